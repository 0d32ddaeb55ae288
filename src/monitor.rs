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


//! Server monitoring. Each server is checked on its own thread, either by polling `hello` or by
//! letting the server stream `hello` replies whenever its state changes. A separate thread
//! measures the round trip time while streaming.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-monitoring.rst

use {
	crate::{
		common::{Error, Result, ServerMonitorSettings},
		description::{ServerId, ConnectionId, ServerDescription, REASON_HEARTBEAT_FAILED},
		connection::{Connection, ConnectionFactory},
		wire::{HelloCommand, HelloReply},
		apm::{ClusterEvent, EventDispatcher},
		utils::{lock, CancellationToken}
	},
	std::{
		fmt,
		thread::JoinHandle,
		sync::{Arc, Weak, Mutex, Condvar, PoisonError, atomic::{AtomicBool, AtomicUsize, Ordering}},
		time::{Duration, Instant}
	}
};

/// Weight of a new sample in the round trip time average.
const RTT_ALPHA: f64 = 0.2;

/// Receives the descriptions produced by a monitor.
pub trait DescriptionListener: Send + Sync + fmt::Debug {
	fn on_description(&self, old: &ServerDescription, new: Arc<ServerDescription>);
}

pub trait ServerMonitor: Send + Sync + fmt::Debug {
	/// Starts monitoring. Descriptions are delivered to `listener` until `shutdown`.
	fn initialize(&self, listener: Arc<dyn DescriptionListener>) -> Result<()>;

	/// The most recent description.
	fn description(&self) -> Arc<ServerDescription>;

	/// Requests a check as soon as the minimum heartbeat interval allows. Concurrent requests
	/// are collapsed into one check.
	fn request_heartbeat(&self);

	/// Aborts a check in progress, which then fails.
	fn cancel_current_check(&self);

	/// Replaces the description with an unknown one and requests a check.
	fn invalidate(&self, reason: &'static str, error: Option<Arc<Error>>);

	fn shutdown(&self);
}

pub trait ServerMonitorFactory: Send + Sync + fmt::Debug {
	fn create(&self, server_id: ServerId) -> Arc<dyn ServerMonitor>;

	fn settings(&self) -> &ServerMonitorSettings;
}

/// Exponentially weighted moving average of the round trip time.
#[derive(Debug, Default)]
struct RoundTripTime(Mutex<Option<Duration>>);

impl RoundTripTime {
	fn add_sample(&self, sample: Duration) -> Duration {
		let mut average = lock(&self.0);
		let value = match *average {
			Some(average) => Duration::from_secs_f64(
				RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * average.as_secs_f64()),
			None => sample
		};
		*average = Some(value);
		value
	}

	fn average(&self) -> Option<Duration> {
		*lock(&self.0)
	}

	fn reset(&self) {
		*lock(&self.0) = None;
	}
}

#[derive(Debug, Default)]
struct DelayState {
	requested:  bool,
	last_check: Option<Instant>
}

/// Schedules checks: one per heartbeat interval, or earlier if requested, but never more
/// often than the minimum heartbeat interval.
#[derive(Debug, Default)]
struct HeartbeatDelay {
	state:   Mutex<DelayState>,
	condvar: Condvar
}

impl HeartbeatDelay {
	fn request(&self) {
		lock(&self.state).requested = true;
		self.condvar.notify_all();
	}

	fn wake(&self) {
		let _guard = lock(&self.state);
		self.condvar.notify_all();
	}

	fn checked(&self) {
		let mut state = lock(&self.state);
		state.requested = false;
		state.last_check = Some(Instant::now());
	}

	/// Blocks until the next check is due. Returns `false` if cancelled.
	fn wait(&self, interval: Duration, min_interval: Duration, cancel: &CancellationToken) -> bool {
		let mut state = lock(&self.state);
		loop {
			if cancel.is_cancelled() {
				return false;
			}

			let now = Instant::now();
			let last = state.last_check.unwrap_or(now);
			let due = last + if state.requested { min_interval } else { interval };
			if now >= due {
				return true;
			}

			state = self.condvar.wait_timeout(state, due - now)
				.unwrap_or_else(PoisonError::into_inner).0;
		}
	}
}

/// Monitors a mongod or mongos.
#[derive(Debug)]
pub struct HeartbeatMonitor(Arc<MonitorInner>);

#[derive(Debug)]
struct MonitorInner {
	server_id:     ServerId,
	settings:      ServerMonitorSettings,
	factory:       Arc<dyn ConnectionFactory>,
	events:        EventDispatcher,
	description:   Mutex<Arc<ServerDescription>>,
	listener:      Mutex<Option<Arc<dyn DescriptionListener>>>,
	delay:         HeartbeatDelay,
	rtt:           RoundTripTime,
	rtt_started:   AtomicBool,
	/// cancelled on shutdown
	cancel:        CancellationToken,
	/// cancels the check in progress
	current_check: Mutex<CancellationToken>,
	threads:       Mutex<Vec<JoinHandle<()>>>,
	next_id:       AtomicUsize
}

impl HeartbeatMonitor {
	pub fn new(
		server_id: ServerId,
		settings:  ServerMonitorSettings,
		factory:   Arc<dyn ConnectionFactory>,
		events:    EventDispatcher
	) -> Self {
		Self(Arc::new(MonitorInner {
			description:   Mutex::new(Arc::new(ServerDescription {
				heartbeat_interval: settings.heartbeat_interval,
				..ServerDescription::new(server_id.clone())
			})),
			server_id,
			settings,
			factory,
			events,
			listener:      Mutex::new(None),
			delay:         HeartbeatDelay::default(),
			rtt:           RoundTripTime::default(),
			rtt_started:   AtomicBool::new(false),
			cancel:        CancellationToken::new(),
			current_check: Mutex::new(CancellationToken::new()),
			threads:       Mutex::new(Vec::new()),
			next_id:       AtomicUsize::new(1)
		}))
	}
}

impl ServerMonitor for HeartbeatMonitor {
	fn initialize(&self, listener: Arc<dyn DescriptionListener>) -> Result<()> {
		*lock(&self.0.listener) = Some(listener);
		let inner = self.0.clone();
		let thread = std::thread::Builder::new()
			.name("server-monitor".to_string())
			.spawn(move || inner.run())?;
		lock(&self.0.threads).push(thread);
		Ok(())
	}

	fn description(&self) -> Arc<ServerDescription> {
		self.0.description()
	}

	fn request_heartbeat(&self) {
		self.0.delay.request();
	}

	fn cancel_current_check(&self) {
		lock(&self.0.current_check).cancel();
	}

	fn invalidate(&self, reason: &'static str, error: Option<Arc<Error>>) {
		let description = self.0.description().unknown(reason, error);
		self.0.publish(Arc::new(description));
		self.0.delay.request();
	}

	fn shutdown(&self) {
		self.0.cancel.cancel();
		self.cancel_current_check();
		*lock(&self.0.listener) = None;

		// the monitor thread itself may shut the monitor down through its listener
		let current = std::thread::current().id();
		for thread in std::mem::take(&mut *lock(&self.0.threads)) {
			if thread.thread().id() != current && thread.join().is_err() {
				tracing::warn!(server = %self.0.server_id.endpoint, "a monitor thread panicked");
			}
		}
	}
}

impl Drop for HeartbeatMonitor {
	fn drop(&mut self) {
		self.0.cancel.cancel();
		lock(&self.0.current_check).cancel();
	}
}

impl MonitorInner {
	fn description(&self) -> Arc<ServerDescription> {
		lock(&self.description).clone()
	}

	fn publish(&self, description: Arc<ServerDescription>) {
		let old = std::mem::replace(&mut *lock(&self.description), description.clone());
		let listener = lock(&self.listener).clone();
		if let Some(listener) = listener {
			listener.on_description(&old, description);
		}
	}

	fn next_connection_id(&self) -> ConnectionId {
		ConnectionId::new(self.server_id.clone(), self.next_id.fetch_add(1, Ordering::Relaxed))
	}

	fn is_streamable(&self, description: &ServerDescription) -> bool {
		self.settings.monitoring_mode.is_streaming()
			&& description.topology_version.is_some()
			&& description.error.is_none()
	}

	fn run(self: Arc<Self>) {
		let weak = Arc::downgrade(&self);
		let _registration = self.cancel.register(move || if let Some(inner) = Weak::upgrade(&weak) {
			inner.delay.wake();
		});

		tracing::debug!(server = %self.server_id.endpoint, "server monitor started");
		let mut connection = None;
		loop {
			self.delay.checked();
			let previous = self.description();
			let description = self.check(&mut connection);
			if self.cancel.is_cancelled() {
				break;
			}

			let failed = description.error.is_some();
			let streaming = connection.is_some() && self.is_streamable(&description);
			self.publish(description);

			if streaming {
				self.start_rtt_thread();
				continue;
			}

			// a server that was known gets one immediate retry, e.g. after a failover
			if failed && previous.r#type.is_known() {
				continue;
			}

			if !self.delay.wait(self.settings.heartbeat_interval, self.settings.min_heartbeat_interval, &self.cancel) {
				break;
			}
		}
		tracing::debug!(server = %self.server_id.endpoint, "server monitor stopped");
	}

	/// Runs a single check. The first check of a connection is its handshake.
	fn check(&self, connection: &mut Option<Connection>) -> Arc<ServerDescription> {
		let token = CancellationToken::new();
		*lock(&self.current_check) = token.clone();
		if self.cancel.is_cancelled() {
			token.cancel();
		}

		let previous = self.description();
		let start = Instant::now();
		let (id, awaited, result) = match connection.take() {
			None => {
				let id = self.next_connection_id();
				self.events.dispatch(ClusterEvent::ServerHeartbeatStarted { connection_id: &id, awaited: false });
				let result = self.factory.open(id.clone(), &token).map(|opened| {
					let reply = opened.description().map(|d| d.hello.clone()).unwrap_or_default();
					(opened, reply)
				});
				(id, false, result)
			}
			Some(mut existing) => {
				let id = existing.id().clone();
				let awaited = existing.is_streaming() || self.is_streamable(&previous);
				self.events.dispatch(ClusterEvent::ServerHeartbeatStarted { connection_id: &id, awaited });
				let result = self.hello(&mut existing, &previous, &token).map(|reply| (existing, reply));
				(id, awaited, result)
			}
		};

		match result {
			Ok((opened, reply)) => {
				let elapsed = start.elapsed();
				let rtt = match awaited {
					true  => self.rtt.average().unwrap_or(elapsed),
					false => self.rtt.add_sample(elapsed)
				};

				self.events.dispatch(ClusterEvent::ServerHeartbeatSucceeded {
					connection_id: &id,
					duration:      elapsed,
					awaited
				});
				*connection = Some(opened);
				Arc::new(ServerDescription::from_hello(
					self.server_id.clone(), &reply, rtt, self.settings.heartbeat_interval))
			}
			Err(e) => {
				tracing::debug!(server = %self.server_id.endpoint, error = %e, "heartbeat failed");
				self.events.dispatch(ClusterEvent::ServerHeartbeatFailed { connection_id: &id, error: &e, awaited });
				self.rtt.reset();
				Arc::new(previous.unknown(REASON_HEARTBEAT_FAILED, Some(Arc::new(e))))
			}
		}
	}

	fn hello(&self, connection: &mut Connection, previous: &ServerDescription, token: &CancellationToken) -> Result<HelloReply> {
		let abort = connection.abort_handle();
		let _registration = token.register(move || abort.abort());
		let legacy = !connection.description().map_or(false, |d| d.hello.hello_ok == Some(true));
		let interval = self.settings.heartbeat_interval;

		if connection.is_streaming() {
			connection.set_read_timeout(Some(self.settings.connect_timeout + interval))?;
			return connection.receive_hello();
		}

		match &previous.topology_version {
			Some(topology_version) if self.is_streamable(previous) => {
				connection.set_read_timeout(Some(self.settings.connect_timeout + interval))?;
				connection.hello(&HelloCommand::new(legacy).awaitable(topology_version, interval.as_millis() as u64))
			}
			_ => {
				connection.set_read_timeout(Some(self.settings.effective_heartbeat_timeout()))?;
				connection.hello(&HelloCommand::new(legacy))
			}
		}
	}

	fn start_rtt_thread(self: &Arc<Self>) {
		if self.rtt_started.swap(true, Ordering::SeqCst) {
			return;
		}

		let inner = self.clone();
		match std::thread::Builder::new()
			.name("server-rtt-monitor".to_string())
			.spawn(move || inner.run_rtt()) {
			Ok(thread) => lock(&self.threads).push(thread),
			Err(e) => {
				tracing::warn!(server = %self.server_id.endpoint, error = %e, "failed to start the round trip time monitor");
				self.rtt_started.store(false, Ordering::SeqCst);
			}
		}
	}

	/// Measures the round trip time on a dedicated connection while replies are streamed.
	fn run_rtt(self: Arc<Self>) {
		let mut connection: Option<Connection> = None;
		loop {
			let start = Instant::now();
			let result = match connection.take() {
				None => self.factory.open(self.next_connection_id(), &self.cancel),
				Some(mut existing) => {
					let abort = existing.abort_handle();
					let _registration = self.cancel.register(move || abort.abort());
					let legacy = !existing.description().map_or(false, |d| d.hello.hello_ok == Some(true));
					existing.set_read_timeout(Some(self.settings.effective_heartbeat_timeout()))
						.and_then(|_| existing.hello(&HelloCommand::new(legacy)))
						.map(|_| existing)
				}
			};

			match result {
				Ok(existing) => {
					self.rtt.add_sample(start.elapsed());
					connection = Some(existing);
				}
				Err(e) => tracing::debug!(server = %self.server_id.endpoint, error = %e, "round trip time check failed")
			}

			if self.cancel.sleep(self.settings.heartbeat_interval) {
				break;
			}
		}
	}
}

/// Load balancers are not monitored; their description never changes.
#[derive(Debug)]
pub struct LoadBalancerMonitor {
	description: Arc<ServerDescription>
}

impl LoadBalancerMonitor {
	pub fn new(server_id: ServerId) -> Self {
		Self { description: Arc::new(ServerDescription::load_balancer(server_id)) }
	}
}

impl ServerMonitor for LoadBalancerMonitor {
	fn initialize(&self, listener: Arc<dyn DescriptionListener>) -> Result<()> {
		let old = ServerDescription::new(self.description.server_id.clone());
		listener.on_description(&old, self.description.clone());
		Ok(())
	}

	fn description(&self) -> Arc<ServerDescription> {
		self.description.clone()
	}

	fn request_heartbeat(&self) {}

	fn cancel_current_check(&self) {}

	fn invalidate(&self, _: &'static str, _: Option<Arc<Error>>) {}

	fn shutdown(&self) {}
}

/// Creates `HeartbeatMonitor`s, or `LoadBalancerMonitor`s in load balanced mode.
#[derive(Debug)]
pub struct DefaultServerMonitorFactory {
	settings:      ServerMonitorSettings,
	factory:       Arc<dyn ConnectionFactory>,
	events:        EventDispatcher,
	load_balanced: bool
}

impl DefaultServerMonitorFactory {
	pub fn new(
		settings:      ServerMonitorSettings,
		factory:       Arc<dyn ConnectionFactory>,
		events:        EventDispatcher,
		load_balanced: bool
	) -> Self {
		Self { settings, factory, events, load_balanced }
	}
}

impl ServerMonitorFactory for DefaultServerMonitorFactory {
	fn create(&self, server_id: ServerId) -> Arc<dyn ServerMonitor> {
		match self.load_balanced {
			true  => Arc::new(LoadBalancerMonitor::new(server_id)),
			false => Arc::new(HeartbeatMonitor::new(
				server_id, self.settings.clone(), self.factory.clone(), self.events.clone()))
		}
	}

	fn settings(&self) -> &ServerMonitorSettings {
		&self.settings
	}
}
