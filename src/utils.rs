// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use {
	crate::common::{Error, Result},
	std::{
		sync::{Arc, Weak, Mutex, MutexGuard, Condvar, PoisonError},
		time::{Duration, Instant}
	}
};

/// A wrapper that implements `Debug` for a type that doesn't.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default)]
pub struct __DebugWrapper__<T>(pub T);

impl<T> std::fmt::Debug for __DebugWrapper__<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NonDebugStruct")
			.finish()
	}
}

impl<T> std::ops::Deref for __DebugWrapper__<T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<T> std::ops::DerefMut for __DebugWrapper__<T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.0
	}
}

/// Locks a mutex, ignoring poisoning. Used where no error can be reported, e.g. in `Drop`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Callback = Box<dyn FnOnce() + Send>;

/// A cancellation signal shared between the owner of an operation and the operation itself.
///
/// Blocking waits register a callback that wakes them when the token is cancelled.
/// Registrations are removed when the returned `Registration` is dropped.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<TokenInner>);

#[derive(Default)]
struct TokenInner {
	state:   Mutex<TokenState>,
	condvar: Condvar
}

#[derive(Default)]
struct TokenState {
	cancelled: bool,
	next_id:   usize,
	callbacks: Vec<(usize, Callback)>
}

impl std::fmt::Debug for CancellationToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CancellationToken")
			.field("cancelled", &self.is_cancelled())
			.finish()
	}
}

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		let callbacks = {
			let mut state = lock(&self.0.state);
			if state.cancelled {
				return;
			}
			state.cancelled = true;
			std::mem::take(&mut state.callbacks)
		};

		self.0.condvar.notify_all();
		for (_, callback) in callbacks {
			callback();
		}
	}

	pub fn is_cancelled(&self) -> bool {
		lock(&self.0.state).cancelled
	}

	pub fn check(&self) -> Result<()> {
		if self.is_cancelled() {
			Err(Error::Cancelled)
		} else {
			Ok(())
		}
	}

	/// Registers a callback that runs once on cancellation, immediately if already cancelled.
	/// The callback must not block.
	pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> Registration {
		let mut state = lock(&self.0.state);
		if state.cancelled {
			drop(state);
			callback();
			return Registration { token: Weak::new(), id: 0 };
		}

		let id = state.next_id;
		state.next_id += 1;
		state.callbacks.push((id, Box::new(callback)));
		Registration { token: Arc::downgrade(&self.0), id }
	}

	/// Sleeps for `duration` or until cancelled. Returns `true` if cancelled.
	pub fn sleep(&self, duration: Duration) -> bool {
		let deadline = Instant::now() + duration;
		let mut state = lock(&self.0.state);
		loop {
			if state.cancelled {
				return true;
			}

			let now = Instant::now();
			if now >= deadline {
				return false;
			}

			state = self.0.condvar.wait_timeout(state, deadline - now)
				.unwrap_or_else(PoisonError::into_inner).0;
		}
	}
}

/// Removes its callback from the token when dropped.
#[must_use]
pub struct Registration {
	token: Weak<TokenInner>,
	id:    usize
}

impl Drop for Registration {
	fn drop(&mut self) {
		if let Some(token) = self.token.upgrade() {
			let id = self.id;
			lock(&token.state).callbacks.retain(|(i, _)| *i != id);
		}
	}
}
