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
		common::{Error, Result},
		description::{ServerId, EndPoint, ServiceId, ServerDescription, TopologyVersion, REASON_HEARTBEAT_FAILED},
		pool::{ConnectionPool, ConnectionPoolFactory, PooledConnection},
		monitor::{ServerMonitor, ServerMonitorFactory, DescriptionListener},
		apm::{ClusterEvent, EventDispatcher},
		utils::{lock, CancellationToken}
	},
	std::{
		sync::{Arc, Weak, Mutex, atomic::{AtomicBool, Ordering}},
		time::Instant
	}
};

const REASON_NETWORK_ERROR:      &str = "NetworkError";
const REASON_STATE_CHANGE_ERROR: &str = "StateChangeError";

/// Servers older than 4.2 close all connections on a state change.
const KEEPS_CONNECTIONS_ON_STATE_CHANGE_WIRE_VERSION: i32 = 8;

/// A connection checked out of a server's pool.
pub type Channel = PooledConnection;

/// A server of a cluster with its connection pool and monitor.
///
/// The server reacts to the state observed by the monitor and to errors on its connections:
/// network errors and state change errors mark it unknown and may clear the pool.
///
/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#error-handling
#[derive(Debug, Clone)]
pub struct Server(Arc<ServerInner>);

#[derive(Debug)]
pub struct ServerInner {
	server_id:         ServerId,
	load_balanced:     bool,
	/// the only server of a direct connection accepts operations whatever its type
	direct_connection: bool,
	pool:              ConnectionPool,
	monitor:           Arc<dyn ServerMonitor>,
	events:            EventDispatcher,
	listener:          Mutex<Option<Arc<dyn DescriptionListener>>>,
	disposed:          AtomicBool,
	created:           Instant
}

impl std::ops::Deref for Server {
	type Target = ServerInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

/// Forwards the monitor's descriptions without keeping the server alive.
#[derive(Debug)]
struct ServerListener(Weak<ServerInner>);

impl DescriptionListener for ServerListener {
	fn on_description(&self, old: &ServerDescription, new: Arc<ServerDescription>) {
		if let Some(inner) = self.0.upgrade() {
			inner.on_description(old, new);
		}
	}
}

impl Server {
	pub fn new(
		server_id:         ServerId,
		pool:              ConnectionPool,
		monitor:           Arc<dyn ServerMonitor>,
		events:            EventDispatcher,
		load_balanced:     bool,
		direct_connection: bool
	) -> Self {
		events.dispatch(ClusterEvent::ServerOpening { server_id: &server_id });
		Self(Arc::new(ServerInner {
			server_id,
			load_balanced,
			direct_connection,
			pool,
			monitor,
			events,
			listener: Mutex::new(None),
			disposed: AtomicBool::new(false),
			created:  Instant::now()
		}))
	}

	/// Starts monitoring. Every description observed is passed on to `listener`.
	pub fn initialize(&self, listener: Arc<dyn DescriptionListener>) -> Result<()> {
		*lock(&self.0.listener) = Some(listener);

		let weak = Arc::downgrade(&self.0);
		self.0.pool.set_error_handler(Arc::new(move |error: &Error, generation: usize| {
			if let Some(inner) = weak.upgrade() {
				let max_wire_version = inner.monitor.description().max_wire_version;
				inner.handle_error(error, generation, None, max_wire_version, true);
			}
		}));

		self.0.monitor.initialize(Arc::new(ServerListener(Arc::downgrade(&self.0))))?;
		self.0.events.dispatch(ClusterEvent::ServerOpened {
			server_id: &self.0.server_id,
			duration:  self.0.created.elapsed()
		});
		Ok(())
	}

	/// Checks out a connection.
	pub fn get_channel(&self, cancel: &CancellationToken) -> Result<Channel> {
		if self.is_disposed() {
			return Err(Error::Disposed("server"));
		}
		self.0.pool.check_out(cancel)
	}

	/// Checks out a connection without blocking the executor.
	#[cfg(feature = "async")]
	pub async fn get_channel_async(&self, cancel: CancellationToken) -> Result<PooledConnection> {
		let server = self.clone();
		async_std::task::spawn_blocking(move || server.get_channel(&cancel)).await
	}

	/// Handles an error raised by an operation on a connection of this server.
	pub fn handle_connection_error(&self, connection: &PooledConnection, error: &Error) {
		let service_id = connection.service_id();
		let generation = match (self.0.load_balanced, service_id) {
			(true, Some(_)) => connection.service_generation(),
			_               => connection.generation()
		};
		let max_wire_version = connection.description().map_or(0, |d| d.max_wire_version());
		self.0.handle_error(error, generation, service_id, max_wire_version, false);
	}

	/// Marks the server unknown on behalf of the cluster, e.g. when a newer primary was found.
	pub fn invalidate(&self, reason: &'static str) {
		if self.is_disposed() {
			return;
		}

		if self.0.pool.pause(None) {
			self.0.pool.clear(None);
		}
		self.0.monitor.invalidate(reason, None);
	}

	pub fn dispose(&self) {
		if self.0.disposed.swap(true, Ordering::SeqCst) {
			return;
		}

		self.0.events.dispatch(ClusterEvent::ServerClosing { server_id: &self.0.server_id });
		*lock(&self.0.listener) = None;
		self.0.monitor.shutdown();
		self.0.pool.close();
		self.0.events.dispatch(ClusterEvent::ServerClosed {
			server_id: &self.0.server_id,
			duration:  self.0.created.elapsed()
		});
	}
}

impl ServerInner {
	pub fn server_id(&self) -> &ServerId {
		&self.server_id
	}

	pub fn endpoint(&self) -> &EndPoint {
		&self.server_id.endpoint
	}

	pub fn description(&self) -> Arc<ServerDescription> {
		self.monitor.description()
	}

	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}

	pub fn request_heartbeat(&self) {
		self.monitor.request_heartbeat();
	}

	pub fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::SeqCst)
	}

	fn on_description(&self, old: &ServerDescription, new: Arc<ServerDescription>) {
		if self.is_disposed() {
			return;
		}

		match &new.error {
			Some(error) if new.reason_changed == REASON_HEARTBEAT_FAILED => if !self.pool.is_paused() {
				self.pool.clear(None);
				self.pool.pause(Some(error.clone()));
			}
			None if new.r#type.is_data_bearing() || (self.direct_connection && new.r#type.is_known()) => {
				self.pool.set_ready();
			}
			_ => ()
		}

		if !old.sdam_eq(&new) {
			self.events.dispatch(ClusterEvent::ServerDescriptionChanged { old, new: &new });
		}

		let listener = lock(&self.listener).clone();
		if let Some(listener) = listener {
			listener.on_description(old, new);
		}
	}

	fn handle_error(&self, error: &Error, generation: usize, service_id: Option<ServiceId>, max_wire_version: i32, handshake: bool) {
		if self.is_disposed() {
			return;
		}

		let current = match (self.load_balanced, service_id) {
			(true, Some(service_id)) => self.pool.service_generation(service_id),
			_                        => self.pool.generation()
		};
		if generation < current {
			tracing::trace!(server = %self.server_id.endpoint, %error, "ignoring error from a stale connection");
			return;
		}

		// timeouts after the handshake say nothing about the server's state
		let network_error = error.is_network_error() && (handshake || !error.is_network_timeout());

		if self.load_balanced {
			// without a service id the affected connections are unknown
			if !handshake && service_id.is_some() && (network_error || error.is_shutdown_error()) {
				self.pool.clear(service_id);
			}
			return;
		}

		if network_error {
			tracing::debug!(server = %self.server_id.endpoint, %error, "network error, marking the server unknown");
			let error = Arc::new(error.clone());
			self.pool.clear(None);
			self.pool.pause(Some(error.clone()));
			self.monitor.cancel_current_check();
			self.monitor.invalidate(REASON_NETWORK_ERROR, Some(error));
		} else if error.is_state_change_error() {
			let description = self.monitor.description();
			if TopologyVersion::is_stale_error(error.topology_version(), description.topology_version.as_ref()) {
				tracing::trace!(server = %self.server_id.endpoint, %error, "ignoring stale state change error");
				return;
			}

			tracing::debug!(server = %self.server_id.endpoint, %error, "state change error, marking the server unknown");
			let error = Arc::new(error.clone());
			if error.is_shutdown_error() || max_wire_version < KEEPS_CONNECTIONS_ON_STATE_CHANGE_WIRE_VERSION {
				self.pool.clear(None);
				self.pool.pause(Some(error.clone()));
			}
			self.monitor.invalidate(REASON_STATE_CHANGE_ERROR, Some(error));
		}
	}
}

/// Creates the servers of a cluster.
#[derive(Debug, Clone)]
pub struct ServerFactory {
	pools:             ConnectionPoolFactory,
	monitors:          Arc<dyn ServerMonitorFactory>,
	events:            EventDispatcher,
	load_balanced:     bool,
	direct_connection: bool
}

impl ServerFactory {
	pub fn new(
		pools:         ConnectionPoolFactory,
		monitors:      Arc<dyn ServerMonitorFactory>,
		events:        EventDispatcher,
		load_balanced: bool
	) -> Self {
		Self { pools, monitors, events, load_balanced, direct_connection: false }
	}

	/// Servers of a direct connection accept operations once they are known, even if they
	/// are not data bearing.
	pub fn with_direct_connection(mut self, direct_connection: bool) -> Self {
		self.direct_connection = direct_connection;
		self
	}

	pub fn create(&self, server_id: ServerId) -> Server {
		let pool = self.pools.create(server_id.clone(), self.load_balanced);
		let monitor = self.monitors.create(server_id.clone());
		Server::new(server_id, pool, monitor, self.events.clone(), self.load_balanced, self.direct_connection)
	}

	pub fn monitor_factory(&self) -> &dyn ServerMonitorFactory {
		&*self.monitors
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			common::ConnectionPoolSettings,
			description::{ClusterId, ObjectId, ServerType},
			testing::{FakeStreamFactory, ManualMonitor, ManualMonitorFactory, connection_factory, hello_reply, recording_dispatcher},
			wire::HelloReply
		},
		std::{io, time::Duration, sync::atomic::Ordering}
	};

	#[derive(Debug, Default)]
	struct Forwarded(Mutex<Vec<Arc<ServerDescription>>>);

	impl DescriptionListener for Forwarded {
		fn on_description(&self, _: &ServerDescription, new: Arc<ServerDescription>) {
			self.0.lock().unwrap().push(new);
		}
	}

	struct Fixture {
		server:   Server,
		monitor:  Arc<ManualMonitor>,
		streams:  Arc<FakeStreamFactory>,
		listener: Arc<Forwarded>
	}

	fn fixture() -> Fixture {
		fixture_with(false)
	}

	fn fixture_with(direct_connection: bool) -> Fixture {
		let streams = Arc::new(FakeStreamFactory::healthy());
		let pools = ConnectionPoolFactory::new(
			ConnectionPoolSettings::default(), connection_factory(streams.clone()), EventDispatcher::default());
		let monitors = Arc::new(ManualMonitorFactory::default());
		let factory = ServerFactory::new(pools, monitors.clone(), EventDispatcher::default(), false)
			.with_direct_connection(direct_connection);

		let server_id = ServerId::new(ClusterId(1), "a:27017".parse().unwrap());
		let server = factory.create(server_id.clone());
		let listener = Arc::new(Forwarded::default());
		server.initialize(listener.clone()).unwrap();
		let monitor = monitors.get(&server_id.endpoint);
		Fixture { server, monitor, streams, listener }
	}

	fn described(fixture: &Fixture, reply: &HelloReply) {
		fixture.monitor.publish(ServerDescription::from_hello(
			fixture.server.server_id().clone(), reply, Duration::from_millis(1), Duration::from_secs(10)));
	}

	fn reset() -> Error {
		Error::Io(io::ErrorKind::ConnectionReset.into())
	}

	fn state_change(code: i32, counter: i64) -> Error {
		Error::Command {
			code,
			code_name:        "NotWritablePrimary".to_string(),
			message:          "not primary".to_string(),
			topology_version: Some(TopologyVersion { process_id: ObjectId([1; 12]), counter })
		}
	}

	#[test]
	fn pool_follows_the_monitor() {
		let fixture = fixture();
		assert!(matches!(fixture.server.get_channel(&CancellationToken::new()), Err(Error::PoolPaused { .. })));

		described(&fixture, &hello_reply());
		assert!(fixture.server.get_channel(&CancellationToken::new()).is_ok());
		assert_eq!(fixture.listener.0.lock().unwrap().len(), 1);

		let failed = fixture.server.description().unknown(REASON_HEARTBEAT_FAILED, Some(Arc::new(reset())));
		fixture.monitor.publish(failed.clone());
		fixture.monitor.publish(failed);
		assert!(fixture.server.pool().is_paused());
		assert_eq!(fixture.server.pool().generation(), 1);
		match fixture.server.get_channel(&CancellationToken::new()) {
			Err(Error::PoolPaused { cause: Some(cause), .. }) => assert!(cause.is_network_error()),
			other => panic!("unexpected result: {:?}", other.map(|c| c.id().clone()))
		}
	}

	#[test]
	fn direct_connections_accept_any_known_server() {
		let arbiter = HelloReply {
			is_writable_primary: Some(false),
			set_name:            Some("rs".to_string()),
			arbiter_only:        Some(true),
			..hello_reply()
		};

		let discovered = fixture();
		described(&discovered, &arbiter);
		assert_eq!(discovered.server.description().r#type, ServerType::ReplicaSetArbiter);
		assert!(discovered.server.pool().is_paused());

		let direct = fixture_with(true);
		assert!(direct.server.pool().is_paused());
		described(&direct, &arbiter);
		assert!(!direct.server.pool().is_paused());
		assert!(direct.server.get_channel(&CancellationToken::new()).is_ok());

		// unknown servers stay unusable
		let failed = direct.server.description().unknown(REASON_HEARTBEAT_FAILED, Some(Arc::new(reset())));
		direct.monitor.publish(failed);
		assert!(direct.server.pool().is_paused());
	}

	#[test]
	fn network_errors_mark_the_server_unknown() {
		let fixture = fixture();
		described(&fixture, &hello_reply());
		let connection = fixture.server.get_channel(&CancellationToken::new()).unwrap();

		fixture.server.handle_connection_error(&connection, &reset());
		assert_eq!(fixture.monitor.invalidated.load(Ordering::SeqCst), 1);
		assert_eq!(fixture.server.description().r#type, ServerType::Unknown);
		assert!(fixture.server.pool().is_paused());

		// the connection is now stale
		fixture.server.handle_connection_error(&connection, &reset());
		assert_eq!(fixture.monitor.invalidated.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn timeouts_after_the_handshake_are_ignored() {
		let fixture = fixture();
		described(&fixture, &hello_reply());
		let connection = fixture.server.get_channel(&CancellationToken::new()).unwrap();

		fixture.server.handle_connection_error(&connection, &Error::Io(io::ErrorKind::TimedOut.into()));
		assert_eq!(fixture.monitor.invalidated.load(Ordering::SeqCst), 0);
		assert!(!fixture.server.pool().is_paused());
	}

	#[test]
	fn stale_state_change_errors_are_ignored() {
		let fixture = fixture();
		let mut reply = hello_reply();
		reply.topology_version = Some(TopologyVersion { process_id: ObjectId([1; 12]), counter: 5 });
		described(&fixture, &reply);
		let connection = fixture.server.get_channel(&CancellationToken::new()).unwrap();

		fixture.server.handle_connection_error(&connection, &state_change(10107, 4));
		assert_eq!(fixture.monitor.invalidated.load(Ordering::SeqCst), 0);

		fixture.server.handle_connection_error(&connection, &state_change(10107, 6));
		assert_eq!(fixture.monitor.invalidated.load(Ordering::SeqCst), 1);
		// recent servers keep their connections
		assert_eq!(fixture.server.pool().generation(), 0);
	}

	#[test]
	fn shutdown_errors_clear_the_pool() {
		let fixture = fixture();
		described(&fixture, &hello_reply());
		let connection = fixture.server.get_channel(&CancellationToken::new()).unwrap();

		fixture.server.handle_connection_error(&connection, &state_change(91, 1));
		assert_eq!(fixture.monitor.invalidated.load(Ordering::SeqCst), 1);
		assert_eq!(fixture.server.pool().generation(), 1);
	}

	#[test]
	fn establishment_errors_mark_the_server_unknown() {
		let fixture = fixture();
		described(&fixture, &hello_reply());
		fixture.streams.set_failing(true);

		assert!(fixture.server.get_channel(&CancellationToken::new()).is_err());
		assert_eq!(fixture.monitor.invalidated.load(Ordering::SeqCst), 1);
		assert!(fixture.server.pool().is_paused());
	}

	#[test]
	fn dispose_closes_the_pool_and_the_monitor() {
		let (events, recorder) = recording_dispatcher();
		let fixture = fixture();
		let server = Server::new(
			fixture.server.server_id().clone(), fixture.server.pool().clone(), fixture.monitor.clone(), events, false, false);

		server.dispose();
		server.dispose();
		assert!(fixture.monitor.shut_down.load(Ordering::SeqCst));
		assert!(fixture.server.pool().is_closed());
		assert!(matches!(server.get_channel(&CancellationToken::new()), Err(Error::Disposed(_))));
		assert_eq!(recorder.count("server closed"), 1);
	}
}
