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

//! see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst

use {
	crate::{
		common::{Error, Result, ConnectionPoolSettings},
		description::{ServerId, ConnectionId, ServiceId},
		connection::{Connection, ConnectionFactory},
		apm::{ClusterEvent, EventDispatcher, ConnectionClosedReason, ConnectionCheckOutFailedReason},
		utils::{lock, CancellationToken}
	},
	std::{
		fmt,
		thread::JoinHandle,
		collections::{HashMap, VecDeque},
		sync::{Arc, Weak, Mutex, Condvar, PoisonError, atomic::{AtomicUsize, Ordering}},
		time::{Duration, Instant}
	}
};

/// Called with errors raised while establishing a connection and the generation the
/// connection was opened with.
pub type EstablishmentErrorHandler = dyn Fn(&Error, usize) + Send + Sync;

#[derive(Debug, Clone)]
enum PoolStatus {
	Paused(Option<Arc<Error>>),
	Ready,
	Closed
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Generation {
	global:  usize,
	service: usize
}

#[derive(Debug)]
struct IdleConnection {
	connection: Connection,
	generation: Generation,
	checked_in: Instant
}

#[derive(Debug)]
struct PoolState {
	status:              PoolStatus,
	generation:          usize,
	service_generations: HashMap<ServiceId, usize>,
	available:           Vec<IdleConnection>,
	in_use:              usize,
	pending:             usize,
	wait_queue:          VecDeque<usize>,
	next_ticket:         usize
}

impl PoolState {
	fn total(&self) -> usize {
		self.available.len() + self.in_use + self.pending
	}

	fn generation_of(&self, service_id: Option<ServiceId>) -> Generation {
		Generation {
			global:  self.generation,
			service: service_id
				.and_then(|id| self.service_generations.get(&id).copied())
				.unwrap_or(0)
		}
	}

	fn is_stale(&self, connection: &Connection, generation: Generation) -> bool {
		self.generation_of(connection.service_id()) != generation
	}

	fn dequeue(&mut self, ticket: usize) {
		self.wait_queue.retain(|t| *t != ticket);
	}
}

/// Snapshot of the pool's counters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolStats {
	pub available: usize,
	pub in_use:    usize,
	pub pending:   usize,
	pub waiting:   usize
}

impl PoolStats {
	pub fn total(&self) -> usize {
		self.available + self.in_use + self.pending
	}
}

/// A bounded set of connections to one server.
///
/// Waiters are served in FIFO order: only the caller at the head of the wait queue may take
/// an available connection or start opening a new one.
#[derive(Clone)]
pub struct ConnectionPool(Arc<PoolInner>);

struct PoolInner {
	server_id:     ServerId,
	settings:      ConnectionPoolSettings,
	factory:       Arc<dyn ConnectionFactory>,
	events:        EventDispatcher,
	pausable:      bool,
	state:         Mutex<PoolState>,
	condvar:       Condvar,
	next_local_id: AtomicUsize,
	error_handler: Mutex<Option<Arc<EstablishmentErrorHandler>>>
}

impl fmt::Debug for ConnectionPool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionPool")
			.field("server_id", &self.0.server_id)
			.field("settings", &self.0.settings)
			.field("stats", &self.stats())
			.finish()
	}
}

enum Acquired {
	Reused(IdleConnection),
	Open(Generation)
}

impl ConnectionPool {
	/// Creates a paused pool. Pools for load balancers start ready and can't be paused.
	pub fn new(
		server_id:     ServerId,
		settings:      ConnectionPoolSettings,
		factory:       Arc<dyn ConnectionFactory>,
		events:        EventDispatcher,
		load_balanced: bool
	) -> Self {
		let self_ = Self(Arc::new(PoolInner {
			server_id,
			settings,
			factory,
			events,
			pausable:      !load_balanced,
			state:         Mutex::new(PoolState {
				status:              if load_balanced { PoolStatus::Ready } else { PoolStatus::Paused(None) },
				generation:          0,
				service_generations: HashMap::new(),
				available:           Vec::with_capacity(settings.min_pool_size),
				in_use:              0,
				pending:             0,
				wait_queue:          VecDeque::new(),
				next_ticket:         0
			}),
			condvar:       Condvar::new(),
			next_local_id: AtomicUsize::new(1),
			error_handler: Mutex::new(None)
		}));

		self_.0.events.dispatch(ClusterEvent::ConnectionPoolOpened {
			server_id: &self_.0.server_id,
			settings:  &self_.0.settings
		});
		if load_balanced {
			self_.0.events.dispatch(ClusterEvent::ConnectionPoolReady { server_id: &self_.0.server_id });
		}
		self_
	}

	pub fn server_id(&self) -> &ServerId {
		&self.0.server_id
	}

	pub fn settings(&self) -> &ConnectionPoolSettings {
		&self.0.settings
	}

	pub fn set_error_handler(&self, handler: Arc<EstablishmentErrorHandler>) {
		*lock(&self.0.error_handler) = Some(handler);
	}

	pub fn generation(&self) -> usize {
		lock(&self.0.state).generation
	}

	pub fn service_generation(&self, service_id: ServiceId) -> usize {
		lock(&self.0.state).generation_of(Some(service_id)).service
	}

	pub fn is_paused(&self) -> bool {
		matches!(lock(&self.0.state).status, PoolStatus::Paused(_))
	}

	pub fn is_closed(&self) -> bool {
		matches!(lock(&self.0.state).status, PoolStatus::Closed)
	}

	pub fn stats(&self) -> PoolStats {
		let state = lock(&self.0.state);
		PoolStats {
			available: state.available.len(),
			in_use:    state.in_use,
			pending:   state.pending,
			waiting:   state.wait_queue.len()
		}
	}

	/// Checks out a connection, waiting at most `waitQueueTimeout`.
	pub fn check_out(&self, cancel: &CancellationToken) -> Result<PooledConnection> {
		let start = Instant::now();
		self.0.events.dispatch(ClusterEvent::ConnectionCheckOutStarted { server_id: &self.0.server_id });

		match self.check_out_inner(cancel, start) {
			Ok(connection) => {
				self.0.events.dispatch(ClusterEvent::ConnectionCheckedOut {
					connection_id: connection.id(),
					duration:      start.elapsed()
				});
				Ok(connection)
			}
			Err(e) => {
				let reason = match &e {
					Error::PoolClosed(_)           => ConnectionCheckOutFailedReason::PoolClosed,
					Error::PoolPaused { .. }       => ConnectionCheckOutFailedReason::Paused,
					Error::WaitQueueTimeout { .. } => ConnectionCheckOutFailedReason::Timeout,
					Error::WaitQueueFull           => ConnectionCheckOutFailedReason::WaitQueueFull,
					Error::Cancelled               => ConnectionCheckOutFailedReason::Cancelled,
					_                              => ConnectionCheckOutFailedReason::ConnectionError
				};
				self.0.events.dispatch(ClusterEvent::ConnectionCheckOutFailed {
					server_id: &self.0.server_id,
					reason,
					duration:  start.elapsed()
				});
				Err(e)
			}
		}
	}

	fn check_out_inner(&self, cancel: &CancellationToken, start: Instant) -> Result<PooledConnection> {
		let deadline = start + self.0.settings.wait_queue_timeout;
		let weak = Arc::downgrade(&self.0);
		let _registration = cancel.register(move || if let Some(inner) = weak.upgrade() {
			let _guard = lock(&inner.state);
			inner.condvar.notify_all();
		});

		let mut state = lock(&self.0.state);
		self.check_status(&state)?;
		if state.wait_queue.len() >= self.0.settings.wait_queue_size {
			return Err(Error::WaitQueueFull);
		}

		let mut ticket = state.next_ticket;
		state.next_ticket += 1;
		state.wait_queue.push_back(ticket);
		drop(state);

		loop {
			let (acquired, closed) = match self.acquire(ticket, cancel, start, deadline) {
				Ok(v) => v,
				Err(e) => {
					let mut state = lock(&self.0.state);
					state.dequeue(ticket);
					drop(state);
					self.0.condvar.notify_all();
					return Err(e);
				}
			};
			self.0.condvar.notify_all();
			self.closed(closed);

			let generation = match acquired {
				Acquired::Reused(idle) => return Ok(self.pooled(idle.connection, idle.generation)),
				Acquired::Open(generation) => generation
			};

			match self.open(generation, cancel)? {
				Some(pooled) => return Ok(pooled),
				// stale before it could be used, wait again at the head of the queue
				None => {
					let mut state = lock(&self.0.state);
					ticket = state.next_ticket;
					state.next_ticket += 1;
					state.wait_queue.push_front(ticket);
				}
			}
		}
	}

	/// Waits until the caller holding `ticket` may reuse or open a connection. The ticket is
	/// removed from the queue on success.
	fn acquire(
		&self,
		ticket:   usize,
		cancel:   &CancellationToken,
		start:    Instant,
		deadline: Instant
	) -> Result<(Acquired, Vec<(Connection, ConnectionClosedReason)>)> {
		let settings = &self.0.settings;
		let mut closed = Vec::new();
		let mut state = lock(&self.0.state);

		loop {
			self.check_status(&state)?;
			cancel.check()?;

			if state.wait_queue.front() == Some(&ticket) {
				while let Some(idle) = state.available.pop() {
					match self.perish_reason(&state, &idle) {
						Some(reason) => closed.push((idle.connection, reason)),
						None => {
							state.in_use += 1;
							state.dequeue(ticket);
							return Ok((Acquired::Reused(idle), closed));
						}
					}
				}

				if state.total() < settings.max_pool_size && state.pending < settings.max_connecting {
					state.pending += 1;
					state.dequeue(ticket);
					let generation = state.generation_of(None);
					return Ok((Acquired::Open(generation), closed));
				}
			}

			let now = Instant::now();
			if now >= deadline {
				drop(state);
				self.closed(closed);
				return Err(Error::WaitQueueTimeout {
					endpoint:   self.0.server_id.endpoint.clone(),
					elapsed_ms: start.elapsed().as_millis()
				});
			}

			state = self.0.condvar.wait_timeout(state, deadline - now)
				.unwrap_or_else(PoisonError::into_inner).0;
		}
	}

	/// Opens a new connection for a caller that reserved a pending slot. Returns `None` if the
	/// pool was cleared while opening.
	fn open(&self, generation: Generation, cancel: &CancellationToken) -> Result<Option<PooledConnection>> {
		let start = Instant::now();
		let id = ConnectionId::new(self.0.server_id.clone(), self.0.next_local_id.fetch_add(1, Ordering::Relaxed));
		self.0.events.dispatch(ClusterEvent::ConnectionCreated { connection_id: &id });

		let result = self.0.factory.open(id.clone(), cancel);
		let mut state = lock(&self.0.state);
		state.pending -= 1;

		let connection = match result {
			Ok(connection) => connection,
			Err(e) => {
				drop(state);
				self.0.condvar.notify_all();
				self.0.events.dispatch(ClusterEvent::ConnectionOpeningFailed { connection_id: &id, error: &e });
				self.0.events.dispatch(ClusterEvent::ConnectionClosed {
					connection_id: &id,
					reason:        ConnectionClosedReason::Error
				});

				let handler = lock(&self.0.error_handler).clone();
				if let Some(handler) = handler {
					handler(&e, generation.global);
				}
				return Err(e);
			}
		};

		let generation = Generation { service: state.generation_of(connection.service_id()).service, ..generation };
		let reason = match &state.status {
			PoolStatus::Closed => Some(ConnectionClosedReason::PoolClosed),
			_ if generation.global != state.generation => Some(ConnectionClosedReason::Stale),
			_ => None
		};

		if reason.is_none() {
			state.in_use += 1;
		}
		drop(state);
		self.0.condvar.notify_all();

		self.0.events.dispatch(ClusterEvent::ConnectionReady {
			connection_id: connection.id(),
			duration:      start.elapsed()
		});

		match reason {
			None => Ok(Some(self.pooled(connection, generation))),
			Some(ConnectionClosedReason::PoolClosed) => {
				self.closed(vec![(connection, ConnectionClosedReason::PoolClosed)]);
				Err(Error::PoolClosed(self.0.server_id.endpoint.clone()))
			}
			Some(reason) => {
				self.closed(vec![(connection, reason)]);
				Ok(None)
			}
		}
	}

	fn pooled(&self, connection: Connection, generation: Generation) -> PooledConnection {
		PooledConnection {
			connection: Some(connection),
			generation,
			pool:       self.0.clone()
		}
	}

	fn check_status(&self, state: &PoolState) -> Result<()> {
		match &state.status {
			PoolStatus::Ready         => Ok(()),
			PoolStatus::Closed        => Err(Error::PoolClosed(self.0.server_id.endpoint.clone())),
			PoolStatus::Paused(cause) => Err(Error::PoolPaused {
				endpoint: self.0.server_id.endpoint.clone(),
				cause:    cause.clone()
			})
		}
	}

	fn perish_reason(&self, state: &PoolState, idle: &IdleConnection) -> Option<ConnectionClosedReason> {
		let settings = &self.0.settings;
		if state.is_stale(&idle.connection, idle.generation) {
			Some(ConnectionClosedReason::Stale)
		} else if idle.connection.is_perished() {
			Some(ConnectionClosedReason::Error)
		} else if settings.max_idle_time.map_or(false, |max| idle.checked_in.elapsed() >= max) {
			Some(ConnectionClosedReason::Idle)
		} else if settings.max_life_time.map_or(false, |max| idle.connection.created().elapsed() >= max) {
			Some(ConnectionClosedReason::Expired)
		} else {
			None
		}
	}

	/// Closes connections and emits the events. Must be called without holding the lock.
	fn closed(&self, connections: Vec<(Connection, ConnectionClosedReason)>) {
		for (connection, reason) in connections {
			self.0.events.dispatch(ClusterEvent::ConnectionClosed { connection_id: connection.id(), reason });
		}
	}

	/// Marks all current connections, or those of one service behind a load balancer, as stale.
	/// Idle stale connections are closed immediately, checked out ones when they are checked in.
	pub fn clear(&self, service_id: Option<ServiceId>) {
		let mut state = lock(&self.0.state);
		let generation = match service_id {
			Some(service_id) if !self.0.pausable => {
				let generation = state.service_generations.entry(service_id).or_insert(0);
				*generation += 1;
				*generation
			}
			_ => {
				state.generation += 1;
				state.generation
			}
		};

		let available = std::mem::take(&mut state.available);
		let (stale, fresh): (Vec<_>, Vec<_>) = available.into_iter()
			.partition(|idle| state.is_stale(&idle.connection, idle.generation));
		state.available = fresh;
		drop(state);
		self.0.condvar.notify_all();

		self.0.events.dispatch(ClusterEvent::ConnectionPoolCleared {
			server_id: &self.0.server_id,
			service_id,
			generation
		});
		self.closed(stale.into_iter().map(|idle| (idle.connection, ConnectionClosedReason::Stale)).collect());
	}

	/// Pauses the pool, failing pending and future check outs with the given cause.
	/// Returns `false` if the pool was not ready.
	pub fn pause(&self, cause: Option<Arc<Error>>) -> bool {
		if !self.0.pausable {
			return false;
		}

		let mut state = lock(&self.0.state);
		if !matches!(state.status, PoolStatus::Ready) {
			return false;
		}
		state.status = PoolStatus::Paused(cause);
		drop(state);
		self.0.condvar.notify_all();

		self.0.events.dispatch(ClusterEvent::ConnectionPoolPaused { server_id: &self.0.server_id });
		true
	}

	/// Returns `false` if the pool was not paused.
	pub fn set_ready(&self) -> bool {
		let mut state = lock(&self.0.state);
		if !matches!(state.status, PoolStatus::Paused(_)) {
			return false;
		}
		state.status = PoolStatus::Ready;
		drop(state);
		self.0.condvar.notify_all();

		self.0.events.dispatch(ClusterEvent::ConnectionPoolReady { server_id: &self.0.server_id });
		true
	}

	/// Closes the pool and all idle connections. Checked out connections are closed when
	/// they are checked in.
	pub fn close(&self) {
		let mut state = lock(&self.0.state);
		if matches!(state.status, PoolStatus::Closed) {
			return;
		}
		state.status = PoolStatus::Closed;
		let available = std::mem::take(&mut state.available);
		drop(state);
		self.0.condvar.notify_all();

		self.closed(available.into_iter().map(|idle| (idle.connection, ConnectionClosedReason::PoolClosed)).collect());
		self.0.events.dispatch(ClusterEvent::ConnectionPoolClosed { server_id: &self.0.server_id });
	}

	/// Closes perished idle connections, then opens connections until `minPoolSize` is reached.
	pub fn maintain(&self) {
		let mut state = lock(&self.0.state);
		let available = std::mem::take(&mut state.available);
		let (fresh, perished): (Vec<_>, Vec<_>) = available.into_iter()
			.map(|idle| (self.perish_reason(&state, &idle), idle))
			.partition(|(reason, _)| reason.is_none());
		state.available = fresh.into_iter().map(|(_, idle)| idle).collect();
		drop(state);
		self.closed(perished.into_iter().filter_map(|(reason, idle)| reason.map(|r| (idle.connection, r))).collect());

		loop {
			let mut state = lock(&self.0.state);
			if !matches!(state.status, PoolStatus::Ready)
				|| state.total() >= self.0.settings.min_pool_size
				|| state.pending >= self.0.settings.max_connecting {
				return;
			}
			state.pending += 1;
			let generation = state.generation_of(None);
			drop(state);

			match self.open(generation, &CancellationToken::new()) {
				// checking in makes it available
				Ok(Some(pooled)) => drop(pooled),
				Ok(None) => (),
				Err(e) => {
					tracing::warn!(server = %self.0.server_id.endpoint, error = %e, "failed to populate the connection pool");
					return;
				}
			}
		}
	}

	fn check_in(inner: &Arc<PoolInner>, connection: Connection, generation: Generation) {
		let mut state = lock(&inner.state);
		state.in_use -= 1;

		let reason = match &state.status {
			PoolStatus::Closed                              => Some(ConnectionClosedReason::PoolClosed),
			_ if connection.is_perished()                   => Some(ConnectionClosedReason::Error),
			_ if state.is_stale(&connection, generation)    => Some(ConnectionClosedReason::Stale),
			_                                               => None
		};

		let id = connection.id().clone();
		let connection = match reason {
			None => {
				state.available.push(IdleConnection { connection, generation, checked_in: Instant::now() });
				None
			}
			Some(_) => Some(connection)
		};
		drop(state);
		inner.condvar.notify_all();

		inner.events.dispatch(ClusterEvent::ConnectionCheckedIn { connection_id: &id });
		if let (Some(connection), Some(reason)) = (connection, reason) {
			inner.events.dispatch(ClusterEvent::ConnectionClosed { connection_id: connection.id(), reason });
		}
	}
}

/// A checked out connection, checked back in when dropped.
#[derive(Debug)]
pub struct PooledConnection {
	connection: Option<Connection>,
	generation: Generation,
	pool:       Arc<PoolInner>
}

impl fmt::Debug for PoolInner {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PoolInner")
			.field("server_id", &self.server_id)
			.finish()
	}
}

impl PooledConnection {
	/// The pool generation this connection belongs to.
	pub fn generation(&self) -> usize {
		self.generation.global
	}

	pub fn service_generation(&self) -> usize {
		self.generation.service
	}
}

impl std::ops::Deref for PooledConnection {
	type Target = Connection;

	fn deref(&self) -> &Self::Target {
		// only taken in `drop`
		self.connection.as_ref().unwrap_or_else(|| unreachable!())
	}
}

impl std::ops::DerefMut for PooledConnection {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.connection.as_mut().unwrap_or_else(|| unreachable!())
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(connection) = self.connection.take() {
			ConnectionPool::check_in(&self.pool, connection, self.generation);
		}
	}
}

/// Creates the pools of a cluster's servers.
#[derive(Debug, Clone)]
pub struct ConnectionPoolFactory {
	settings:  ConnectionPoolSettings,
	factory:   Arc<dyn ConnectionFactory>,
	events:    EventDispatcher,
	scheduler: Option<MaintenanceScheduler>
}

impl ConnectionPoolFactory {
	pub fn new(settings: ConnectionPoolSettings, factory: Arc<dyn ConnectionFactory>, events: EventDispatcher) -> Self {
		Self { settings, factory, events, scheduler: None }
	}

	pub fn with_scheduler(mut self, scheduler: MaintenanceScheduler) -> Self {
		self.scheduler = Some(scheduler);
		self
	}

	pub fn create(&self, server_id: ServerId, load_balanced: bool) -> ConnectionPool {
		let pool = ConnectionPool::new(server_id, self.settings, self.factory.clone(), self.events.clone(), load_balanced);
		if let Some(scheduler) = &self.scheduler {
			scheduler.register(&pool);
		}
		pool
	}
}

/// A single thread that periodically maintains all pools of a cluster.
#[derive(Debug, Clone)]
pub struct MaintenanceScheduler(Arc<SchedulerInner>);

#[derive(Debug)]
struct SchedulerInner {
	pools:  Arc<Mutex<Vec<Weak<PoolInner>>>>,
	cancel: CancellationToken,
	thread: Mutex<Option<JoinHandle<()>>>
}

impl MaintenanceScheduler {
	pub fn start(interval: Duration) -> Result<Self> {
		let pools = Arc::new(Mutex::new(Vec::<Weak<PoolInner>>::new()));
		let cancel = CancellationToken::new();

		let thread = {
			let pools = pools.clone();
			let cancel = cancel.clone();
			std::thread::Builder::new()
				.name("pool-maintenance".to_string())
				.spawn(move || while !cancel.sleep(interval) {
					let live = {
						let mut pools = lock(&pools);
						pools.retain(|pool| pool.strong_count() > 0);
						pools.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
					};

					for pool in live {
						ConnectionPool(pool).maintain();
					}
				})?
		};

		Ok(Self(Arc::new(SchedulerInner {
			pools,
			cancel,
			thread: Mutex::new(Some(thread))
		})))
	}

	fn register(&self, pool: &ConnectionPool) {
		lock(&self.0.pools).push(Arc::downgrade(&pool.0));
	}

	/// Stops the maintenance thread and waits for it to finish.
	pub fn stop(&self) {
		self.0.cancel.cancel();
		let thread = lock(&self.0.thread).take();
		if let Some(thread) = thread {
			if thread.join().is_err() {
				tracing::warn!("the pool maintenance thread panicked");
			}
		}
	}
}

impl Drop for SchedulerInner {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}
