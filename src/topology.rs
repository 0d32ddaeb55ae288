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


//! The cluster tracks the servers of a deployment and selects servers for operations.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst

use {
	crate::{
		common::*,
		description::{ClusterId, ServerId, EndPoint, ServerDescription, ClusterDescription, TopologyAction, TopologyType},
		stream::{StreamFactory, TcpStreamFactory},
		wire::Codec,
		auth::{Authenticator, CredentialCache},
		connection::{ConnectionFactory, BinaryConnectionFactory},
		pool::{ConnectionPoolFactory, MaintenanceScheduler},
		monitor::{ServerMonitorFactory, DefaultServerMonitorFactory, DescriptionListener},
		server::{Server, ServerFactory},
		selector::{ServerSelector, LatencyLimitingServerSelector, RandomServerSelector},
		srv::{SrvResolver, DnsMonitor, DnsMonitoringCluster, select_hosts},
		apm::{ClusterEvent, EventSubscriber, EventDispatcher},
		utils::{lock, CancellationToken}
	},
	std::{
		collections::HashMap,
		sync::{Arc, Weak, Mutex, RwLock, Condvar, PoisonError, atomic::{AtomicBool, AtomicUsize, Ordering}},
		time::{Duration, Instant}
	}
};

/// Set once the description it was published with has been replaced.
#[derive(Debug, Default)]
struct ChangeSignal {
	fired:   Mutex<bool>,
	condvar: Condvar
}

impl ChangeSignal {
	fn fire(&self) {
		*lock(&self.fired) = true;
		self.condvar.notify_all();
	}

	/// Wakes waiters without firing, so they can observe a cancellation.
	fn wake(&self) {
		let _fired = lock(&self.fired);
		self.condvar.notify_all();
	}

	fn wait(&self, timeout: Duration, cancel: &CancellationToken) {
		let fired = lock(&self.fired);
		let _ = self.condvar.wait_timeout_while(fired, timeout, |fired| !*fired && !cancel.is_cancelled())
			.unwrap_or_else(PoisonError::into_inner);
	}
}

#[derive(Debug, Clone)]
struct Snapshot {
	description: Arc<ClusterDescription>,
	changed:     Arc<ChangeSignal>
}

/// Releases a server selection wait queue slot.
struct WaitQueueSlot<'a>(&'a AtomicUsize);

impl Drop for WaitQueueSlot<'_> {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

#[derive(Debug, Clone)]
pub struct Cluster(Arc<ClusterInner>);

#[derive(Debug)]
pub struct ClusterInner {
	this:         Weak<ClusterInner>,
	cluster_id:   ClusterId,
	settings:     ClusterSettings,
	factory:      ServerFactory,
	events:       EventDispatcher,
	snapshot:     RwLock<Snapshot>,
	/// serializes description updates
	update:       Mutex<()>,
	servers:      Mutex<HashMap<EndPoint, Server>>,
	waiting:      AtomicUsize,
	disposed:     AtomicBool,
	created:      Instant,
	srv_resolver: Mutex<Option<Arc<dyn SrvResolver>>>,
	dns_monitor:  Mutex<Option<DnsMonitor>>,
	scheduler:    Mutex<Option<MaintenanceScheduler>>
}

impl std::ops::Deref for Cluster {
	type Target = ClusterInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

/// Passes server descriptions on to the cluster without keeping it alive.
#[derive(Debug)]
struct ClusterListener(Weak<ClusterInner>);

impl DescriptionListener for ClusterListener {
	fn on_description(&self, _: &ServerDescription, new: Arc<ServerDescription>) {
		if let Some(inner) = self.0.upgrade() {
			inner.on_server_description(new);
		}
	}
}

impl Cluster {
	pub fn new(settings: ClusterSettings, factory: ServerFactory, events: EventDispatcher) -> Self {
		let cluster_id = ClusterId::next();
		let description = ClusterDescription::new(cluster_id, &settings);
		let factory = factory.with_direct_connection(settings.direct_connection);
		Self(Arc::new_cyclic(|this| ClusterInner {
			this:         this.clone(),
			cluster_id,
			factory,
			events,
			snapshot:     RwLock::new(Snapshot {
				description: Arc::new(description),
				changed:     Arc::new(ChangeSignal::default())
			}),
			update:       Mutex::new(()),
			servers:      Mutex::new(HashMap::new()),
			waiting:      AtomicUsize::new(0),
			disposed:     AtomicBool::new(false),
			created:      Instant::now(),
			srv_resolver: Mutex::new(None),
			dns_monitor:  Mutex::new(None),
			scheduler:    Mutex::new(None),
			settings
		}))
	}

	/// Resolves `srv_host` through `resolver`. Takes effect on `initialize`.
	pub fn with_srv_resolver(self, resolver: Arc<dyn SrvResolver>) -> Self {
		*lock(&self.0.srv_resolver) = Some(resolver);
		self
	}

	/// A scheduler that is stopped when the cluster is disposed.
	pub fn with_scheduler(self, scheduler: MaintenanceScheduler) -> Self {
		*lock(&self.0.scheduler) = Some(scheduler);
		self
	}

	/// Creates the seed servers and starts monitoring.
	pub fn initialize(&self) -> Result<()> {
		self.0.events.dispatch(ClusterEvent::ClusterOpening { cluster_id: self.0.cluster_id });

		if let Some(host) = &self.0.settings.srv_host {
			let resolver = lock(&self.0.srv_resolver).clone()
				.ok_or_else(|| Error::InvalidSettings("an SRV host requires an SRV resolver".to_string()))?;
			let target: Weak<dyn DnsMonitoringCluster> = self.0.this.clone();
			let monitor = DnsMonitor::start(
				target,
				resolver,
				&self.0.settings.srv_service_name,
				host,
				self.0.settings.srv_rescan_interval
			)?;
			*lock(&self.0.dns_monitor) = Some(monitor);
		}

		let endpoints = self.0.description().servers.iter()
			.map(|s| s.endpoint().clone())
			.collect::<Vec<_>>();
		for endpoint in endpoints {
			self.0.add_server(endpoint);
		}

		self.0.events.dispatch(ClusterEvent::ClusterOpened {
			cluster_id: self.0.cluster_id,
			duration:   self.0.created.elapsed()
		});
		Ok(())
	}

	/// Selects a server, waiting for the topology to change until one is suitable or the server
	/// selection timeout elapses.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst#multi-threaded-or-asynchronous-server-selection
	pub fn select_server(&self, selector: &dyn ServerSelector, cancel: &CancellationToken) -> Result<Server> {
		let start = Instant::now();
		let name = selector.to_string();
		self.0.events.dispatch(ClusterEvent::ClusterSelectingServer { cluster_id: self.0.cluster_id, selector: &name });

		match self.0.wait_for_server(selector, &name, start, cancel) {
			Ok(server) => {
				self.0.events.dispatch(ClusterEvent::ClusterSelectedServer {
					cluster_id: self.0.cluster_id,
					selector:   &name,
					server_id:  server.server_id(),
					duration:   start.elapsed()
				});
				Ok(server)
			}
			Err(e) => {
				self.0.events.dispatch(ClusterEvent::ClusterSelectingServerFailed {
					cluster_id: self.0.cluster_id,
					selector:   &name,
					error:      &e,
					duration:   start.elapsed()
				});
				Err(e)
			}
		}
	}

	/// Selects a server without blocking the executor.
	#[cfg(feature = "async")]
	pub async fn select_server_async(&self, selector: Arc<dyn ServerSelector>, cancel: CancellationToken) -> Result<Server> {
		let cluster = self.clone();
		async_std::task::spawn_blocking(move || cluster.select_server(&*selector, &cancel)).await
	}

	/// Removes all servers and stops monitoring. Pending selections fail.
	pub fn dispose(&self) {
		if self.0.disposed.swap(true, Ordering::SeqCst) {
			return;
		}

		self.0.events.dispatch(ClusterEvent::ClusterClosing { cluster_id: self.0.cluster_id });
		let dns_monitor = lock(&self.0.dns_monitor).take();
		if let Some(monitor) = dns_monitor {
			monitor.stop();
		}

		{
			let _update = lock(&self.0.update);
			let current = self.0.description();
			self.0.publish(&current, current.without_servers());
		}

		let servers = std::mem::take(&mut *lock(&self.0.servers));
		for (_, server) in servers {
			self.0.dispose_server(server, "ClusterClosed");
		}

		let scheduler = lock(&self.0.scheduler).take();
		if let Some(scheduler) = scheduler {
			scheduler.stop();
		}

		self.0.events.dispatch(ClusterEvent::ClusterClosed {
			cluster_id: self.0.cluster_id,
			duration:   self.0.created.elapsed()
		});
	}
}

impl ClusterInner {
	pub fn cluster_id(&self) -> ClusterId {
		self.cluster_id
	}

	pub fn settings(&self) -> &ClusterSettings {
		&self.settings
	}

	/// The current description.
	pub fn description(&self) -> Arc<ClusterDescription> {
		self.snapshot().description
	}

	pub fn server(&self, endpoint: &EndPoint) -> Option<Server> {
		lock(&self.servers).get(endpoint).cloned()
	}

	pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
		self.events.subscribe(subscriber);
	}

	pub fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::SeqCst)
	}

	fn snapshot(&self) -> Snapshot {
		self.snapshot.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	/// Replaces the description. Waiters are only woken by observable changes.
	/// Must be called while holding the update lock.
	fn publish(&self, old: &ClusterDescription, new: ClusterDescription) {
		let new = Arc::new(new);
		if old.sdam_eq(&new) {
			self.snapshot.write().unwrap_or_else(PoisonError::into_inner).description = new;
			return;
		}

		let previous = std::mem::replace(&mut *self.snapshot.write().unwrap_or_else(PoisonError::into_inner), Snapshot {
			description: new.clone(),
			changed:     Arc::new(ChangeSignal::default())
		});
		self.events.dispatch(ClusterEvent::ClusterDescriptionChanged { old, new: &new });
		previous.changed.fire();
	}

	fn on_server_description(&self, description: Arc<ServerDescription>) {
		let actions = {
			let _update = lock(&self.update);
			if self.is_disposed() {
				return;
			}

			let current = self.description();
			let (next, actions) = current.apply(description);
			self.publish(&current, next);
			actions
		};
		self.execute(actions);
	}

	/// Creates, removes and invalidates servers. Must be called without holding the update lock,
	/// since servers report back synchronously.
	fn execute(&self, actions: Vec<TopologyAction>) {
		for action in actions {
			match action {
				TopologyAction::Add(endpoint) => self.add_server(endpoint),
				TopologyAction::Remove(endpoint) => {
					let server = lock(&self.servers).remove(&endpoint);
					if let Some(server) = server {
						self.dispose_server(server, "NoLongerMember");
					}
				}
				TopologyAction::Invalidate(endpoint, reason) => if let Some(server) = self.server(&endpoint) {
					server.invalidate(reason);
				}
			}
		}
	}

	fn add_server(&self, endpoint: EndPoint) {
		if self.is_disposed() {
			return;
		}

		let start = Instant::now();
		let server_id = ServerId::new(self.cluster_id, endpoint.clone());
		self.events.dispatch(ClusterEvent::ClusterAddingServer { server_id: &server_id });

		let server = self.factory.create(server_id.clone());
		let previous = lock(&self.servers).insert(endpoint, server.clone());
		if let Some(previous) = previous {
			self.dispose_server(previous, "Replaced");
		}

		if let Err(e) = server.initialize(Arc::new(ClusterListener(self.this.clone()))) {
			tracing::warn!(server = %server_id.endpoint, error = %e, "failed to initialize server");
		}

		self.events.dispatch(ClusterEvent::ClusterAddedServer { server_id: &server_id, duration: start.elapsed() });
	}

	fn dispose_server(&self, server: Server, reason: &str) {
		let start = Instant::now();
		self.events.dispatch(ClusterEvent::ClusterRemovingServer { server_id: server.server_id(), reason });
		server.dispose();
		self.events.dispatch(ClusterEvent::ClusterRemovedServer { server_id: server.server_id(), duration: start.elapsed() });
	}

	fn request_heartbeats(&self) {
		let servers = lock(&self.servers).values().cloned().collect::<Vec<_>>();
		for server in servers {
			server.request_heartbeat();
		}
	}

	fn enter_wait_queue(&self) -> Result<WaitQueueSlot<'_>> {
		if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.settings.max_server_selection_wait_queue_size {
			self.waiting.fetch_sub(1, Ordering::SeqCst);
			return Err(Error::WaitQueueFull);
		}
		Ok(WaitQueueSlot(&self.waiting))
	}

	fn wait_for_server(&self, selector: &dyn ServerSelector, name: &str, start: Instant, cancel: &CancellationToken) -> Result<Server> {
		let timeout = self.settings.server_selection_timeout;
		let min_heartbeat_interval = self.factory.monitor_factory().settings().min_heartbeat_interval;
		let mut slot = None;
		let mut last_request: Option<Instant> = None;

		loop {
			cancel.check()?;
			if self.is_disposed() {
				return Err(Error::Disposed("cluster"));
			}

			let Snapshot { description, changed } = self.snapshot();
			if let Some(error) = &description.compatibility_error {
				return Err(Error::IncompatibleDriver(error.to_string()));
			}
			self.validate_selectors(&description, selector)?;

			if let Some(server) = self.choose(&description, selector) {
				return Ok(server);
			}

			let elapsed = start.elapsed();
			if elapsed >= timeout {
				return Err(Error::ServerSelectionTimeout {
					elapsed_ms: elapsed.as_millis(),
					selector:   name.to_string(),
					cluster:    description.to_string()
				});
			}

			if slot.is_none() {
				slot = Some(self.enter_wait_queue()?);
				self.events.dispatch(ClusterEvent::ClusterEnteredSelectionWaitQueue {
					cluster_id: self.cluster_id,
					selector:   name,
					remaining:  timeout - elapsed
				});
			}

			// rapid heartbeats while selections are waiting
			if last_request.map_or(true, |t| t.elapsed() >= min_heartbeat_interval) {
				self.request_heartbeats();
				last_request = Some(Instant::now());
			}

			let signal = changed.clone();
			let _registration = cancel.register(move || signal.wake());
			changed.wait((timeout - elapsed).min(min_heartbeat_interval), cancel);
		}
	}

	fn validate_selectors(&self, description: &ClusterDescription, selector: &dyn ServerSelector) -> Result<()> {
		if let Some(pre) = &self.settings.pre_server_selector {
			pre.validate(description)?;
		}
		selector.validate(description)?;
		if let Some(post) = &self.settings.post_server_selector {
			post.validate(description)?;
		}
		Ok(())
	}

	/// Applies the selectors in order, then picks one of the remaining servers at random.
	fn choose(&self, description: &ClusterDescription, selector: &dyn ServerSelector) -> Option<Server> {
		let mut candidates = description.servers.iter()
			.filter(|s| s.r#type.is_known())
			.cloned()
			.collect::<Vec<_>>();

		if let Some(pre) = &self.settings.pre_server_selector {
			candidates = pre.select_servers(description, &candidates);
		}
		candidates = selector.select_servers(description, &candidates);
		if let Some(post) = &self.settings.post_server_selector {
			candidates = post.select_servers(description, &candidates);
		}
		candidates = LatencyLimitingServerSelector(self.settings.local_threshold).select_servers(description, &candidates);

		let servers = lock(&self.servers);
		candidates.retain(|s| servers.contains_key(s.endpoint()));
		let selected = RandomServerSelector.select_servers(description, &candidates)
			.first()
			.and_then(|s| servers.get(s.endpoint()))
			.cloned();
		selected
	}
}

impl DnsMonitoringCluster for ClusterInner {
	fn should_dns_monitor_stop(&self) -> bool {
		let description = self.description();
		self.is_disposed() || (!description.servers.is_empty()
			&& !matches!(description.r#type, TopologyType::Unknown | TopologyType::Sharded))
	}

	fn process_dns_results(&self, endpoints: Vec<EndPoint>) {
		let actions = {
			let _update = lock(&self.update);
			let current = self.description();
			if self.is_disposed() || (!current.servers.is_empty()
				&& !matches!(current.r#type, TopologyType::Unknown | TopologyType::Sharded)) {
				return;
			}

			let known = current.servers.iter().map(|s| s.endpoint().clone()).collect::<Vec<_>>();
			let endpoints = select_hosts(&known, endpoints, self.settings.srv_max_hosts);
			let (next, actions) = current.with_endpoints(&endpoints);
			self.publish(&current, next);
			actions
		};
		self.execute(actions);
	}

	fn process_dns_error(&self, error: Error) {
		let _update = lock(&self.update);
		let current = self.description();
		self.publish(&current, current.with_dns_monitor_error(Some(Arc::new(error))));
	}
}

/// Assembles a cluster from its settings and the user supplied pieces.
///
/// ```ignore
/// let cluster = ClusterBuilder::new(ClusterSettings::default())
///     .with_codec(Arc::new(BsonCodec))
///     .build()?;
/// let server = cluster.select_server(&WritableServerSelector, &CancellationToken::new())?;
/// ```
#[derive(Debug)]
pub struct ClusterBuilder {
	cluster:            ClusterSettings,
	monitor:            ServerMonitorSettings,
	pool:               ConnectionPoolSettings,
	connection:         ConnectionSettings,
	tcp:                TcpStreamSettings,
	#[cfg(feature = "tls")]
	tls:                Option<TlsSettings>,
	stream_factory:     Option<Arc<dyn StreamFactory>>,
	codec:              Option<Arc<dyn Codec>>,
	authenticator:      Option<Arc<dyn Authenticator>>,
	credentials:        Arc<CredentialCache>,
	srv_resolver:       Option<Arc<dyn SrvResolver>>,
	monitor_factory:    Option<Arc<dyn ServerMonitorFactory>>,
	connection_factory: Option<Arc<dyn ConnectionFactory>>,
	subscribers:        Vec<crate::__DebugWrapper__<Arc<dyn EventSubscriber>>>
}

impl ClusterBuilder {
	pub fn new(cluster: ClusterSettings) -> Self {
		Self {
			cluster,
			monitor:            ServerMonitorSettings::default(),
			pool:               ConnectionPoolSettings::default(),
			connection:         ConnectionSettings::default(),
			tcp:                TcpStreamSettings::default(),
			#[cfg(feature = "tls")]
			tls:                None,
			stream_factory:     None,
			codec:              None,
			authenticator:      None,
			credentials:        Arc::new(CredentialCache::default()),
			srv_resolver:       None,
			monitor_factory:    None,
			connection_factory: None,
			subscribers:        Vec::new()
		}
	}

	pub fn with_monitor_settings(mut self, settings: ServerMonitorSettings) -> Self {
		self.monitor = settings;
		self
	}

	pub fn with_pool_settings(mut self, settings: ConnectionPoolSettings) -> Self {
		self.pool = settings;
		self
	}

	pub fn with_connection_settings(mut self, settings: ConnectionSettings) -> Self {
		self.connection = settings;
		self
	}

	pub fn with_tcp_settings(mut self, settings: TcpStreamSettings) -> Self {
		self.tcp = settings;
		self
	}

	#[cfg(feature = "tls")]
	pub fn with_tls(mut self, settings: TlsSettings) -> Self {
		self.tls = Some(settings);
		self
	}

	/// Replaces the TCP stream factory.
	pub fn with_stream_factory(mut self, factory: Arc<dyn StreamFactory>) -> Self {
		self.stream_factory = Some(factory);
		self
	}

	pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
		self.codec = Some(codec);
		self
	}

	pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
		self.authenticator = Some(authenticator);
		self
	}

	pub fn with_credential_cache(mut self, credentials: Arc<CredentialCache>) -> Self {
		self.credentials = credentials;
		self
	}

	pub fn with_srv_resolver(mut self, resolver: Arc<dyn SrvResolver>) -> Self {
		self.srv_resolver = Some(resolver);
		self
	}

	pub fn with_monitor_factory(mut self, factory: Arc<dyn ServerMonitorFactory>) -> Self {
		self.monitor_factory = Some(factory);
		self
	}

	/// Replaces the connection factory of both pools and monitors. The codec, authenticator
	/// and stream settings are then unused.
	pub fn with_connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
		self.connection_factory = Some(factory);
		self
	}

	pub fn with_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
		self.subscribers.push(crate::__DebugWrapper__(subscriber));
		self
	}

	fn stream_factory(&self) -> Arc<dyn StreamFactory> {
		if let Some(factory) = &self.stream_factory {
			return factory.clone();
		}

		let factory = TcpStreamFactory::new(self.tcp.clone());
		#[cfg(feature = "tls")]
		let factory = match &self.tls {
			Some(tls) => factory.with_tls(tls.clone()),
			None => factory
		};
		Arc::new(factory)
	}

	/// Validates the settings, then creates and initializes the cluster.
	pub fn build(self) -> Result<Cluster> {
		self.cluster.validate()?;
		self.pool.validate()?;
		if self.cluster.srv_host.is_some() && self.srv_resolver.is_none() {
			return Err(Error::InvalidSettings("an SRV host requires an SRV resolver".to_string()));
		}

		let load_balanced = self.cluster.load_balanced;
		let events = EventDispatcher::new(self.subscribers.iter().map(|s| s.0.clone()).collect());

		let (connections, monitoring): (Arc<dyn ConnectionFactory>, Arc<dyn ConnectionFactory>) = match &self.connection_factory {
			Some(factory) => (factory.clone(), factory.clone()),
			None => {
				let codec = self.codec.clone()
					.ok_or_else(|| Error::InvalidSettings("a codec is required".to_string()))?;
				let settings = self.connection.clone().with_load_balanced(load_balanced);
				let mut factory = BinaryConnectionFactory::new(self.stream_factory(), codec, settings);
				let monitoring = factory.for_monitoring();
				if let Some(authenticator) = &self.authenticator {
					factory = factory.with_authenticator(authenticator.clone(), self.credentials.clone());
				}
				(Arc::new(factory) as Arc<dyn ConnectionFactory>, Arc::new(monitoring) as Arc<dyn ConnectionFactory>)
			}
		};

		let monitors = match &self.monitor_factory {
			Some(factory) => factory.clone(),
			None => Arc::new(DefaultServerMonitorFactory::new(
				self.monitor.clone(), monitoring, events.clone(), load_balanced)) as Arc<dyn ServerMonitorFactory>
		};

		let scheduler = MaintenanceScheduler::start(self.pool.maintenance_interval)?;
		let pools = ConnectionPoolFactory::new(self.pool, connections, events.clone())
			.with_scheduler(scheduler.clone());
		let servers = ServerFactory::new(pools, monitors, events.clone(), load_balanced);

		let mut cluster = Cluster::new(self.cluster, servers, events)
			.with_scheduler(scheduler);
		if let Some(resolver) = self.srv_resolver {
			cluster = cluster.with_srv_resolver(resolver);
		}

		if let Err(e) = cluster.initialize() {
			cluster.dispose();
			return Err(e);
		}
		Ok(cluster)
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			description::{ServerType, REASON_HEARTBEAT_FAILED, tests::{ep, known, member, primary}},
			selector::{WritableServerSelector, EndPointServerSelector, ReadPreferenceServerSelector},
			srv::SrvRecord,
			testing::{FakeStreamFactory, ManualMonitorFactory, EventRecorder, connection_factory, recording_dispatcher},
			wire::MIN_WIRE_VERSION
		},
		std::{io, thread, collections::HashSet}
	};

	struct Fixture {
		cluster:  Cluster,
		monitors: Arc<ManualMonitorFactory>,
		recorder: Arc<EventRecorder>
	}

	impl Fixture {
		fn publish(&self, description: ServerDescription) {
			self.monitors.get(description.endpoint()).publish(description);
		}

		fn id(&self) -> ClusterId {
			self.cluster.cluster_id()
		}
	}

	impl Drop for Fixture {
		fn drop(&mut self) {
			self.cluster.dispose();
		}
	}

	fn unstarted(settings: ClusterSettings) -> Fixture {
		let (events, recorder) = recording_dispatcher();
		let streams = Arc::new(FakeStreamFactory::healthy());
		let pools = ConnectionPoolFactory::new(
			ConnectionPoolSettings::default(), connection_factory(streams), events.clone());
		let monitors = Arc::new(ManualMonitorFactory::default());
		let servers = ServerFactory::new(pools, monitors.clone(), events.clone(), settings.load_balanced);
		Fixture { cluster: Cluster::new(settings, servers, events), monitors, recorder }
	}

	fn fixture(settings: ClusterSettings) -> Fixture {
		let fixture = unstarted(settings);
		fixture.cluster.initialize().unwrap();
		fixture
	}

	fn endpoints(hosts: &[&str]) -> ClusterSettings {
		ClusterSettings::default()
			.with_endpoints(hosts.iter().map(|h| ep(h)))
			.with_server_selection_timeout(Duration::from_secs(5))
	}

	fn select(fixture: &Fixture) -> Result<Server> {
		fixture.cluster.select_server(&WritableServerSelector, &CancellationToken::new())
	}

	#[test]
	fn selection_times_out_without_servers() {
		let fixture = fixture(endpoints(&["a:27017"]).with_server_selection_timeout(Duration::from_millis(50)));

		match select(&fixture) {
			Err(Error::ServerSelectionTimeout { selector, cluster, .. }) => {
				assert_eq!(selector, WritableServerSelector.to_string());
				assert!(cluster.contains("a:27017"), "{}", cluster);
			}
			other => panic!("unexpected result: {:?}", other.map(|s| s.endpoint().clone()))
		}

		assert_eq!(fixture.recorder.count("entered selection wait queue"), 1);
		assert_eq!(fixture.recorder.count("server selection failed"), 1);
		assert!(fixture.monitors.get(&ep("a:27017")).heartbeats.load(Ordering::SeqCst) >= 1);
		assert_eq!(fixture.cluster.waiting.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn selects_after_discovery() {
		let fixture = Arc::new(fixture(endpoints(&["a:27017"])));

		let publisher = {
			let fixture = fixture.clone();
			thread::spawn(move || {
				thread::sleep(Duration::from_millis(50));
				fixture.publish(known(fixture.id(), "a:27017", ServerType::Standalone));
			})
		};

		let server = select(&fixture).unwrap();
		publisher.join().unwrap();

		assert_eq!(server.endpoint(), &ep("a:27017"));
		assert_eq!(fixture.cluster.description().r#type, TopologyType::Single);
		assert!(server.get_channel(&CancellationToken::new()).is_ok());
		assert_eq!(fixture.recorder.count("selected server"), 1);
		assert!(fixture.recorder.count("cluster description changed") >= 1);
	}

	#[test]
	fn selection_is_spread_over_suitable_servers() {
		let fixture = fixture(endpoints(&["a:27017", "b:27017"]));
		fixture.publish(known(fixture.id(), "a:27017", ServerType::ShardRouter));
		fixture.publish(known(fixture.id(), "b:27017", ServerType::ShardRouter));
		assert_eq!(fixture.cluster.description().r#type, TopologyType::Sharded);

		let selected = (0..100)
			.map(|_| select(&fixture).unwrap().endpoint().clone())
			.collect::<HashSet<_>>();
		assert_eq!(selected.len(), 2);

		let pinned = fixture.cluster.select_server(&EndPointServerSelector(ep("b:27017")), &CancellationToken::new()).unwrap();
		assert_eq!(pinned.endpoint(), &ep("b:27017"));
	}

	#[test]
	fn selection_is_uniform_within_the_latency_window() {
		let fixture = fixture(endpoints(&["a:27017", "b:27017", "c:27017", "d:27017"]));
		for host in &["a:27017", "b:27017", "c:27017"] {
			fixture.publish(ServerDescription {
				average_round_trip_time: Duration::from_millis(5),
				..known(fixture.id(), host, ServerType::ShardRouter)
			});
		}
		fixture.publish(ServerDescription {
			average_round_trip_time: Duration::from_millis(100),
			..known(fixture.id(), "d:27017", ServerType::ShardRouter)
		});

		const SELECTIONS: usize = 3000;
		let mut counts = HashMap::new();
		for _ in 0..SELECTIONS {
			*counts.entry(select(&fixture).unwrap().endpoint().clone()).or_insert(0usize) += 1;
		}

		assert_eq!(counts.len(), 3, "{:?}", counts);
		assert!(!counts.contains_key(&ep("d:27017")));
		let expected = SELECTIONS / 3;
		for (endpoint, count) in &counts {
			assert!(*count >= expected * 85 / 100 && *count <= expected * 115 / 100, "{} selected {} times", endpoint, count);
		}
	}

	#[test]
	fn primary_failover_clears_the_old_pool_once() {
		let hosts = ["a:27017", "b:27017", "c:27017"];
		let fixture = fixture(endpoints(&hosts).with_replica_set_name("rs0"));
		let id = fixture.id();
		let mut types = Vec::new();

		fixture.publish(primary(id, "a:27017", &hosts, 1, 1));
		fixture.publish(member(id, "b:27017", ServerType::ReplicaSetSecondary, &hosts));
		fixture.publish(member(id, "c:27017", ServerType::ReplicaSetSecondary, &hosts));
		types.push(fixture.cluster.description().r#type);
		let old = fixture.cluster.server(&ep("a:27017")).unwrap();
		assert!(old.get_channel(&CancellationToken::new()).is_ok());

		// the primary stops answering, twice
		let outage = || primary(id, "a:27017", &hosts, 1, 1)
			.unknown(REASON_HEARTBEAT_FAILED, Some(Arc::new(Error::Io(io::ErrorKind::ConnectionReset.into()))));
		fixture.publish(outage());
		types.push(fixture.cluster.description().r#type);
		fixture.publish(outage());
		types.push(fixture.cluster.description().r#type);
		assert!(matches!(old.get_channel(&CancellationToken::new()), Err(Error::PoolPaused { .. })));

		fixture.publish(primary(id, "b:27017", &hosts, 1, 2));
		types.push(fixture.cluster.description().r#type);

		// the old primary comes back as a secondary
		fixture.publish(member(id, "a:27017", ServerType::ReplicaSetSecondary, &hosts));
		types.push(fixture.cluster.description().r#type);

		assert_eq!(types, vec![
			TopologyType::ReplicaSetWithPrimary,
			TopologyType::ReplicaSetNoPrimary,
			TopologyType::ReplicaSetNoPrimary,
			TopologyType::ReplicaSetWithPrimary,
			TopologyType::ReplicaSetWithPrimary
		]);
		assert_eq!(fixture.cluster.description().primary().map(|s| s.endpoint().clone()), Some(ep("b:27017")));
		assert_eq!(old.pool().generation(), 1);
		assert!(!old.pool().is_paused());
		assert_eq!(select(&fixture).unwrap().endpoint(), &ep("b:27017"));
	}

	#[test]
	fn max_staleness_is_checked_against_the_heartbeat_interval() {
		let hosts = ["a:27017", "b:27017"];
		let fixture = fixture(endpoints(&hosts).with_replica_set_name("rs0"));
		let slow = |server: ServerDescription| ServerDescription { heartbeat_interval: Duration::from_secs(100), ..server };
		fixture.publish(slow(primary(fixture.id(), "a:27017", &hosts, 1, 1)));
		fixture.publish(slow(member(fixture.id(), "b:27017", ServerType::ReplicaSetSecondary, &hosts)));

		let read_preference = |secs| ReadPreference::new(ReadPreferenceMode::Secondary, Vec::new(), Some(Duration::from_secs(secs))).unwrap();
		let too_small = ReadPreferenceServerSelector::new(read_preference(100));
		assert!(matches!(
			fixture.cluster.select_server(&too_small, &CancellationToken::new()),
			Err(Error::InvalidSettings(_))));

		let enough = ReadPreferenceServerSelector::new(read_preference(110));
		let server = fixture.cluster.select_server(&enough, &CancellationToken::new()).unwrap();
		assert_eq!(server.endpoint(), &ep("b:27017"));
	}

	#[test]
	fn direct_connections_use_non_data_bearing_servers() {
		let fixture = fixture(endpoints(&["a:27017"]).with_direct_connection(true));
		fixture.publish(member(fixture.id(), "a:27017", ServerType::ReplicaSetArbiter, &["a:27017"]));
		assert_eq!(fixture.cluster.description().r#type, TopologyType::Single);

		let server = fixture.cluster.select_server(&ReadPreferenceServerSelector::primary(), &CancellationToken::new()).unwrap();
		assert!(server.get_channel(&CancellationToken::new()).is_ok());
	}

	#[test]
	fn a_newer_primary_invalidates_the_old_one() {
		let hosts = ["a:27017", "b:27017"];
		let fixture = fixture(endpoints(&hosts).with_replica_set_name("rs0"));
		assert_eq!(fixture.cluster.description().r#type, TopologyType::ReplicaSetNoPrimary);

		fixture.publish(primary(fixture.id(), "a:27017", &hosts, 1, 1));
		assert_eq!(select(&fixture).unwrap().endpoint(), &ep("a:27017"));

		fixture.publish(primary(fixture.id(), "b:27017", &hosts, 1, 2));
		let description = fixture.cluster.description();
		assert_eq!(description.r#type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(description.primary().map(|s| s.endpoint().clone()), Some(ep("b:27017")));
		assert_eq!(description.server(&ep("a:27017")).map(|s| s.r#type), Some(ServerType::Unknown));

		let old = fixture.cluster.server(&ep("a:27017")).unwrap();
		assert_eq!(old.pool().generation(), 1);
		assert!(old.pool().is_paused());
		assert_eq!(fixture.monitors.get(&ep("a:27017")).invalidated.load(Ordering::SeqCst), 1);
		assert_eq!(select(&fixture).unwrap().endpoint(), &ep("b:27017"));
	}

	#[test]
	fn wait_queue_is_bounded() {
		let fixture = Arc::new(fixture(endpoints(&["a:27017"]).with_max_server_selection_wait_queue_size(1)));
		let cancel = CancellationToken::new();

		let waiter = {
			let (fixture, cancel) = (fixture.clone(), cancel.clone());
			thread::spawn(move || fixture.cluster.select_server(&WritableServerSelector, &cancel).map(|_| ()))
		};

		let deadline = Instant::now() + Duration::from_secs(2);
		while fixture.cluster.waiting.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
			thread::sleep(Duration::from_millis(5));
		}

		assert!(matches!(select(&fixture), Err(Error::WaitQueueFull)));
		cancel.cancel();
		assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
		assert_eq!(fixture.cluster.waiting.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn incompatible_servers_fail_selection() {
		let fixture = fixture(endpoints(&["a:27017"]));
		fixture.publish(ServerDescription {
			min_wire_version: 0,
			max_wire_version: MIN_WIRE_VERSION - 1,
			..known(fixture.id(), "a:27017", ServerType::Standalone)
		});

		assert!(fixture.cluster.description().compatibility_error.is_some());
		assert!(matches!(select(&fixture), Err(Error::IncompatibleDriver(_))));
	}

	#[test]
	fn servers_outside_the_replica_set_are_removed() {
		let fixture = fixture(endpoints(&["a:27017", "b:27017", "c:27017"]).with_replica_set_name("rs0"));
		fixture.publish(primary(fixture.id(), "a:27017", &["a:27017", "b:27017"], 1, 1));

		assert!(fixture.cluster.server(&ep("c:27017")).is_none());
		assert!(!fixture.cluster.description().contains(&ep("c:27017")));
		assert!(fixture.monitors.get(&ep("c:27017")).shut_down.load(Ordering::SeqCst));
		assert_eq!(fixture.recorder.count("removed server"), 1);

		// members reported by the primary are discovered
		fixture.publish(primary(fixture.id(), "a:27017", &["a:27017", "b:27017", "d:27017"], 1, 1));
		assert!(fixture.cluster.server(&ep("d:27017")).is_some());
		assert!(fixture.monitors.try_get(&ep("d:27017")).is_some());
	}

	#[test]
	fn dispose_removes_all_servers() {
		let fixture = fixture(endpoints(&["a:27017", "b:27017"]));
		fixture.publish(known(fixture.id(), "a:27017", ServerType::ShardRouter));
		let server = select(&fixture).unwrap();

		fixture.cluster.dispose();
		fixture.cluster.dispose();

		assert!(fixture.cluster.description().servers.is_empty());
		assert!(fixture.cluster.server(&ep("a:27017")).is_none());
		assert!(server.is_disposed());
		for host in &["a:27017", "b:27017"] {
			assert!(fixture.monitors.get(&ep(host)).shut_down.load(Ordering::SeqCst));
		}
		assert!(matches!(select(&fixture), Err(Error::Disposed(_))));
		assert_eq!(fixture.recorder.count("cluster closed"), 1);

		// late descriptions are ignored
		fixture.publish(known(fixture.id(), "a:27017", ServerType::ShardRouter));
		assert!(fixture.cluster.description().servers.is_empty());
	}

	#[derive(Debug)]
	struct Resolver(Mutex<Result<Vec<SrvRecord>>>);

	impl SrvResolver for Resolver {
		fn resolve_srv_records(&self, service: &str, _: &CancellationToken) -> Result<Vec<SrvRecord>> {
			assert_eq!(service, "_mongodb._tcp.test.example.com");
			match &*self.0.lock().unwrap() {
				Ok(records) => Ok(records.clone()),
				Err(e) => Err(e.clone())
			}
		}
	}

	fn records(hosts: &[&str]) -> Vec<SrvRecord> {
		hosts.iter()
			.map(|host| SrvRecord { endpoint: ep(host), ttl: Duration::from_millis(0) })
			.collect()
	}

	fn eventually(condition: impl Fn() -> bool) -> bool {
		let deadline = Instant::now() + Duration::from_secs(5);
		while !condition() {
			if Instant::now() >= deadline {
				return false;
			}
			thread::sleep(Duration::from_millis(5));
		}
		true
	}

	#[test]
	fn srv_records_are_polled_until_the_topology_is_known() {
		let resolver = Arc::new(Resolver(Mutex::new(Ok(records(&["a.example.com:27017", "b.example.com:27017"])))));
		let fixture = unstarted(ClusterSettings::default()
			.with_srv_host("test.example.com")
			.with_srv_rescan_interval(Duration::from_millis(10)));
		fixture.cluster.clone().with_srv_resolver(resolver.clone());
		fixture.cluster.initialize().unwrap();

		assert!(eventually(|| fixture.cluster.server(&ep("b.example.com:27017")).is_some()));

		*resolver.0.lock().unwrap() = Ok(records(&["a.example.com:27017", "c.example.com:27017"]));
		assert!(eventually(|| fixture.cluster.server(&ep("c.example.com:27017")).is_some()));
		assert!(eventually(|| fixture.cluster.server(&ep("b.example.com:27017")).is_none()));

		*resolver.0.lock().unwrap() = Err(Error::Dns("SERVFAIL".to_string()));
		assert!(eventually(|| fixture.cluster.description().dns_monitor_error.is_some()));

		*resolver.0.lock().unwrap() = Ok(records(&["a.example.com:27017"]));
		assert!(eventually(|| fixture.cluster.description().dns_monitor_error.is_none()));
		assert!(fixture.cluster.server(&ep("a.example.com:27017")).is_some());
	}

	#[test]
	fn srv_hosts_require_a_resolver() {
		let fixture = unstarted(ClusterSettings::default().with_srv_host("test.example.com"));
		assert!(matches!(fixture.cluster.initialize(), Err(Error::InvalidSettings(_))));
	}

	#[test]
	fn builder_rejects_invalid_settings() {
		let missing_codec = ClusterBuilder::new(ClusterSettings::default()).build();
		assert!(matches!(missing_codec, Err(Error::InvalidSettings(_))));

		let no_endpoints = ClusterBuilder::new(ClusterSettings::default().with_endpoints(Vec::new()))
			.with_codec(Arc::new(crate::testing::JsonCodec))
			.build();
		assert!(matches!(no_endpoints, Err(Error::InvalidSettings(_))));
	}

	#[test]
	fn builder_connects_through_the_stream_factory() {
		let streams = Arc::new(FakeStreamFactory::healthy());
		let recorder = Arc::new(EventRecorder::default());
		let cluster = ClusterBuilder::new(endpoints(&["a:27017"]))
			.with_monitor_settings(ServerMonitorSettings::default().with_monitoring_mode(ServerMonitoringMode::Poll))
			.with_stream_factory(streams.clone())
			.with_codec(Arc::new(crate::testing::JsonCodec))
			.with_subscriber(recorder.clone())
			.build()
			.unwrap();

		let server = cluster.select_server(&WritableServerSelector, &CancellationToken::new()).unwrap();
		assert_eq!(cluster.description().r#type, TopologyType::Single);
		assert!(server.get_channel(&CancellationToken::new()).is_ok());
		assert!(streams.opened() >= 2);
		assert!(recorder.count("heartbeat succeeded") >= 1);

		cluster.dispose();
		assert!(server.pool().is_closed());
	}
}
