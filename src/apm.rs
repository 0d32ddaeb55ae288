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
	crate::{
		common::{Error, ConnectionPoolSettings},
		description::{ClusterId, ServerId, ConnectionId, ServiceId, ServerDescription, ClusterDescription}
	},
	std::{
		fmt,
		time::Duration,
		panic::{catch_unwind, AssertUnwindSafe},
		sync::{Arc, RwLock, PoisonError, atomic::{AtomicBool, Ordering}}
	}
};

/// Receives cluster, server and pool events.
pub trait EventSubscriber: Send + Sync {
	fn handle(&self, event: &ClusterEvent);
}

impl<F: Fn(&ClusterEvent) + Send + Sync> EventSubscriber for F {
	fn handle(&self, event: &ClusterEvent) {
		self(event)
	}
}

#[derive(Debug)]
pub enum ClusterEvent<'a> {
	ClusterOpening {
		cluster_id: ClusterId
	},
	ClusterOpened {
		cluster_id: ClusterId,
		duration:   Duration
	},
	ClusterClosing {
		cluster_id: ClusterId
	},
	ClusterClosed {
		cluster_id: ClusterId,
		duration:   Duration
	},
	ClusterDescriptionChanged {
		old: &'a ClusterDescription,
		new: &'a ClusterDescription
	},
	ClusterAddingServer {
		server_id: &'a ServerId
	},
	ClusterAddedServer {
		server_id: &'a ServerId,
		duration:  Duration
	},
	ClusterRemovingServer {
		server_id: &'a ServerId,
		reason:    &'a str
	},
	ClusterRemovedServer {
		server_id: &'a ServerId,
		duration:  Duration
	},
	ClusterSelectingServer {
		cluster_id: ClusterId,
		selector:   &'a str
	},
	ClusterEnteredSelectionWaitQueue {
		cluster_id: ClusterId,
		selector:   &'a str,
		remaining:  Duration
	},
	ClusterSelectedServer {
		cluster_id: ClusterId,
		selector:   &'a str,
		server_id:  &'a ServerId,
		duration:   Duration
	},
	ClusterSelectingServerFailed {
		cluster_id: ClusterId,
		selector:   &'a str,
		error:      &'a Error,
		duration:   Duration
	},
	ServerOpening {
		server_id: &'a ServerId
	},
	ServerOpened {
		server_id: &'a ServerId,
		duration:  Duration
	},
	ServerClosing {
		server_id: &'a ServerId
	},
	ServerClosed {
		server_id: &'a ServerId,
		duration:  Duration
	},
	ServerDescriptionChanged {
		old: &'a ServerDescription,
		new: &'a ServerDescription
	},
	ServerHeartbeatStarted {
		connection_id: &'a ConnectionId,
		awaited:       bool
	},
	ServerHeartbeatSucceeded {
		connection_id: &'a ConnectionId,
		duration:      Duration,
		awaited:       bool
	},
	ServerHeartbeatFailed {
		connection_id: &'a ConnectionId,
		error:         &'a Error,
		awaited:       bool
	},
	ConnectionPoolOpened {
		server_id: &'a ServerId,
		settings:  &'a ConnectionPoolSettings
	},
	ConnectionPoolReady {
		server_id: &'a ServerId
	},
	ConnectionPoolCleared {
		server_id:  &'a ServerId,
		service_id: Option<ServiceId>,
		generation: usize
	},
	ConnectionPoolPaused {
		server_id: &'a ServerId
	},
	ConnectionPoolClosed {
		server_id: &'a ServerId
	},
	ConnectionCreated {
		connection_id: &'a ConnectionId
	},
	ConnectionReady {
		connection_id: &'a ConnectionId,
		duration:      Duration
	},
	ConnectionOpeningFailed {
		connection_id: &'a ConnectionId,
		error:         &'a Error
	},
	ConnectionClosed {
		connection_id: &'a ConnectionId,
		reason:        ConnectionClosedReason
	},
	ConnectionCheckOutStarted {
		server_id: &'a ServerId
	},
	ConnectionCheckOutFailed {
		server_id: &'a ServerId,
		reason:    ConnectionCheckOutFailedReason,
		duration:  Duration
	},
	ConnectionCheckedOut {
		connection_id: &'a ConnectionId,
		duration:      Duration
	},
	ConnectionCheckedIn {
		connection_id: &'a ConnectionId
	}
}

impl ClusterEvent<'_> {
	pub fn name(&self) -> &'static str {
		match self {
			Self::ClusterOpening { .. }                   => "cluster opening",
			Self::ClusterOpened { .. }                    => "cluster opened",
			Self::ClusterClosing { .. }                   => "cluster closing",
			Self::ClusterClosed { .. }                    => "cluster closed",
			Self::ClusterDescriptionChanged { .. }        => "cluster description changed",
			Self::ClusterAddingServer { .. }              => "adding server",
			Self::ClusterAddedServer { .. }               => "added server",
			Self::ClusterRemovingServer { .. }            => "removing server",
			Self::ClusterRemovedServer { .. }             => "removed server",
			Self::ClusterSelectingServer { .. }           => "selecting server",
			Self::ClusterEnteredSelectionWaitQueue { .. } => "entered selection wait queue",
			Self::ClusterSelectedServer { .. }            => "selected server",
			Self::ClusterSelectingServerFailed { .. }     => "server selection failed",
			Self::ServerOpening { .. }                    => "server opening",
			Self::ServerOpened { .. }                     => "server opened",
			Self::ServerClosing { .. }                    => "server closing",
			Self::ServerClosed { .. }                     => "server closed",
			Self::ServerDescriptionChanged { .. }         => "server description changed",
			Self::ServerHeartbeatStarted { .. }           => "heartbeat started",
			Self::ServerHeartbeatSucceeded { .. }         => "heartbeat succeeded",
			Self::ServerHeartbeatFailed { .. }            => "heartbeat failed",
			Self::ConnectionPoolOpened { .. }             => "pool opened",
			Self::ConnectionPoolReady { .. }              => "pool ready",
			Self::ConnectionPoolCleared { .. }            => "pool cleared",
			Self::ConnectionPoolPaused { .. }             => "pool paused",
			Self::ConnectionPoolClosed { .. }             => "pool closed",
			Self::ConnectionCreated { .. }                => "connection created",
			Self::ConnectionReady { .. }                  => "connection ready",
			Self::ConnectionOpeningFailed { .. }          => "connection opening failed",
			Self::ConnectionClosed { .. }                 => "connection closed",
			Self::ConnectionCheckOutStarted { .. }        => "check out started",
			Self::ConnectionCheckOutFailed { .. }         => "check out failed",
			Self::ConnectionCheckedOut { .. }             => "checked out",
			Self::ConnectionCheckedIn { .. }              => "checked in"
		}
	}

	/// Per-operation events that would flood the debug log.
	fn is_frequent(&self) -> bool {
		matches!(self,
			Self::ClusterSelectingServer { .. }
			| Self::ClusterSelectedServer { .. }
			| Self::ServerHeartbeatStarted { .. }
			| Self::ServerHeartbeatSucceeded { .. }
			| Self::ConnectionCheckOutStarted { .. }
			| Self::ConnectionCheckedOut { .. }
			| Self::ConnectionCheckedIn { .. })
	}

	fn log(&self) {
		match self {
			Self::ServerHeartbeatFailed { connection_id, error, .. } =>
				tracing::debug!(connection = %connection_id, %error, "{}", self.name()),
			Self::ClusterSelectingServerFailed { selector, error, .. } =>
				tracing::debug!(%selector, %error, "{}", self.name()),
			Self::ConnectionOpeningFailed { connection_id, error } =>
				tracing::debug!(connection = %connection_id, %error, "{}", self.name()),
			_ if self.is_frequent() => tracing::trace!(event = ?self, "{}", self.name()),
			_ => tracing::debug!(event = ?self, "{}", self.name())
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Paused,
	Timeout,
	WaitQueueFull,
	Cancelled,
	ConnectionError
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	Stale,
	Idle,
	Expired,
	Error,
	PoolClosed
}

/// Fans events out to the registered subscribers and the log.
#[derive(Clone, Default)]
pub struct EventDispatcher(Arc<DispatcherInner>);

#[derive(Default)]
struct DispatcherInner {
	subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
	active:      AtomicBool
}

impl fmt::Debug for EventDispatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventDispatcher")
			.field("active", &self.is_active())
			.finish()
	}
}

impl EventDispatcher {
	pub fn new(subscribers: Vec<Arc<dyn EventSubscriber>>) -> Self {
		let self_ = Self::default();
		subscribers.into_iter().for_each(|s| self_.subscribe(s));
		self_
	}

	pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
		self.0.subscribers.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push(subscriber);
		self.0.active.store(true, Ordering::Release);
	}

	pub fn is_active(&self) -> bool {
		self.0.active.load(Ordering::Acquire)
	}

	pub fn dispatch(&self, event: ClusterEvent) {
		event.log();

		if !self.is_active() {
			return;
		}

		let subscribers = self.0.subscribers.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone();

		for subscriber in subscribers {
			if catch_unwind(AssertUnwindSafe(|| subscriber.handle(&event))).is_err() {
				tracing::warn!(event = event.name(), "event subscriber panicked");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{description::{EndPoint, ClusterId}, testing::EventRecorder},
		std::sync::atomic::AtomicUsize
	};

	fn panicking(_: &ClusterEvent) {
		panic!("subscriber failure")
	}

	#[test]
	fn subscribers_receive_events() {
		let recorder = Arc::new(EventRecorder::default());
		let dispatcher = EventDispatcher::default();
		assert!(!dispatcher.is_active());

		dispatcher.subscribe(recorder.clone());
		assert!(dispatcher.is_active());

		let server_id = ServerId::new(ClusterId(1), EndPoint::new("a", 27017));
		dispatcher.dispatch(ClusterEvent::ServerOpening { server_id: &server_id });
		dispatcher.dispatch(ClusterEvent::ConnectionPoolReady { server_id: &server_id });

		assert_eq!(recorder.names(), vec!["server opening", "pool ready"]);
	}

	#[test]
	fn panicking_subscriber_is_isolated() {
		static COUNT: AtomicUsize = AtomicUsize::new(0);
		fn counting(_: &ClusterEvent) {
			COUNT.fetch_add(1, Ordering::SeqCst);
		}

		let dispatcher = EventDispatcher::default();
		dispatcher.subscribe(Arc::new(panicking));
		dispatcher.subscribe(Arc::new(counting));
		dispatcher.dispatch(ClusterEvent::ClusterOpening { cluster_id: ClusterId(1) });
		assert_eq!(COUNT.load(Ordering::SeqCst), 1);
	}
}
