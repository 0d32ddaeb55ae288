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
		description::{EndPoint, TopologyVersion},
		selector::ServerSelector,
		wire::{Compressor, InvalidReplyError},
		__DebugWrapper__
	},
	std::{str::FromStr, sync::Arc, time::Duration, collections::HashMap},
	thiserror::Error
};

pub const DEFAULT_MONGO_PORT:                           u16      = 27017;
pub const DEFAULT_CONNECT_TIMEOUT:                      Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL:                   Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_HEARTBEAT_INTERVAL:               Duration = Duration::from_millis(500);
pub const DEFAULT_LOCAL_THRESHOLD:                      Duration = Duration::from_millis(15);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT:             Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_SERVER_SELECTION_WAIT_QUEUE_SIZE: usize    = 500;
pub const DEFAULT_MIN_POOL_SIZE:                        usize    = 0;
pub const DEFAULT_MAX_POOL_SIZE:                        usize    = 100;
pub const DEFAULT_MAX_CONNECTING:                       usize    = 2;
pub const DEFAULT_WAIT_QUEUE_SIZE:                      usize    = 500;
pub const DEFAULT_WAIT_QUEUE_TIMEOUT:                   Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_IDLE_TIME:                        Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_LIFE_TIME:                        Duration = Duration::from_secs(1800);
pub const DEFAULT_MAINTENANCE_INTERVAL:                 Duration = Duration::from_secs(60);
pub const DEFAULT_SRV_RESCAN_INTERVAL:                  Duration = Duration::from_secs(60);
pub const DEFAULT_SRV_SERVICE_NAME:                     &str     = "mongodb";
pub const DEFAULT_CREDENTIAL_CACHE_TTL:                 Duration = Duration::from_secs(600);
/// Lower bound for `maxStalenessSeconds`.
pub const SMALLEST_MAX_STALENESS:                       Duration = Duration::from_secs(90);
/// Period at which an idle primary writes a no-op to the oplog.
pub const IDLE_WRITE_PERIOD:                            Duration = Duration::from_secs(10);

pub type Result<T> = std::result::Result<T, Error>;

/// Generates `with_*` methods that return a copy of the record with one field replaced.
macro_rules! with_fields {
	($ty:ident { $($method:ident => $field:ident: $val:ty),* $(,)? }) => {
		impl $ty {
			$(
				pub fn $method(mut self, $field: $val) -> Self {
					self.$field = $field;
					self
				}
			)*
		}
	};
}

/// Settings of a cluster, see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst
#[derive(Debug, Clone)]
pub struct ClusterSettings {
	pub endpoints:                            Vec<EndPoint>,
	/// Host name to resolve via `_{srv_service_name}._tcp.{host}` instead of using `endpoints`.
	pub srv_host:                             Option<String>,
	pub srv_service_name:                     String,
	/// 0 means no limit
	pub srv_max_hosts:                        usize,
	pub srv_rescan_interval:                  Duration,
	pub direct_connection:                    bool,
	pub load_balanced:                        bool,
	pub replica_set_name:                     Option<String>,
	pub server_selection_timeout:             Duration,
	pub local_threshold:                      Duration,
	pub max_server_selection_wait_queue_size: usize,
	pub pre_server_selector:                  Option<__DebugWrapper__<Arc<dyn ServerSelector>>>,
	pub post_server_selector:                 Option<__DebugWrapper__<Arc<dyn ServerSelector>>>
}

impl Default for ClusterSettings {
	fn default() -> Self {
		Self {
			endpoints:                            vec![EndPoint::new("localhost", DEFAULT_MONGO_PORT)],
			srv_host:                             None,
			srv_service_name:                     DEFAULT_SRV_SERVICE_NAME.to_string(),
			srv_max_hosts:                        0,
			srv_rescan_interval:                  DEFAULT_SRV_RESCAN_INTERVAL,
			direct_connection:                    false,
			load_balanced:                        false,
			replica_set_name:                     None,
			server_selection_timeout:             DEFAULT_SERVER_SELECTION_TIMEOUT,
			local_threshold:                      DEFAULT_LOCAL_THRESHOLD,
			max_server_selection_wait_queue_size: DEFAULT_MAX_SERVER_SELECTION_WAIT_QUEUE_SIZE,
			pre_server_selector:                  None,
			post_server_selector:                 None
		}
	}
}

with_fields!(ClusterSettings {
	with_srv_service_name                     => srv_service_name: String,
	with_srv_max_hosts                        => srv_max_hosts: usize,
	with_srv_rescan_interval                  => srv_rescan_interval: Duration,
	with_direct_connection                    => direct_connection: bool,
	with_load_balanced                        => load_balanced: bool,
	with_server_selection_timeout             => server_selection_timeout: Duration,
	with_local_threshold                      => local_threshold: Duration,
	with_max_server_selection_wait_queue_size => max_server_selection_wait_queue_size: usize,
});

impl ClusterSettings {
	pub fn with_endpoints(mut self, endpoints: impl IntoIterator<Item = EndPoint>) -> Self {
		self.endpoints = endpoints.into_iter().collect();
		self
	}

	pub fn with_srv_host(mut self, host: impl Into<String>) -> Self {
		self.srv_host = Some(host.into());
		self.endpoints.clear();
		self
	}

	pub fn with_replica_set_name(mut self, name: impl Into<String>) -> Self {
		self.replica_set_name = Some(name.into());
		self
	}

	pub fn with_pre_server_selector(mut self, selector: Arc<dyn ServerSelector>) -> Self {
		self.pre_server_selector = Some(__DebugWrapper__(selector));
		self
	}

	pub fn with_post_server_selector(mut self, selector: Arc<dyn ServerSelector>) -> Self {
		self.post_server_selector = Some(__DebugWrapper__(selector));
		self
	}

	/// Rejects combinations that cannot describe a deployment.
	pub fn validate(&self) -> Result<()> {
		let invalid = |msg: &str| Err(Error::InvalidSettings(msg.to_string()));

		match (&self.srv_host, self.endpoints.len()) {
			(Some(_), n) if n > 0         => return invalid("an SRV host cannot be combined with explicit endpoints"),
			(None, 0)                     => return invalid("at least one endpoint is required"),
			_                             => ()
		}

		if self.direct_connection && (self.srv_host.is_some() || self.endpoints.len() > 1) {
			return invalid("a direct connection requires exactly one endpoint");
		}

		if self.load_balanced {
			if self.direct_connection {
				return invalid("load balanced mode cannot be combined with a direct connection");
			}
			if self.replica_set_name.is_some() {
				return invalid("load balanced mode cannot be combined with a replica set name");
			}
			if self.srv_host.is_none() && self.endpoints.len() > 1 {
				return invalid("load balanced mode requires exactly one endpoint");
			}
		}

		if self.srv_max_hosts > 0 && (self.replica_set_name.is_some() || self.load_balanced) {
			return invalid("srvMaxHosts cannot be combined with a replica set name or load balanced mode");
		}

		if self.max_server_selection_wait_queue_size == 0 {
			return invalid("the server selection wait queue size must be positive");
		}

		Ok(())
	}
}

/// Controls whether the heartbeat uses the streaming protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerMonitoringMode {
	/// Streaming unless running in a function-as-a-service environment.
	Auto,
	Stream,
	Poll
}

impl Default for ServerMonitoringMode {
	fn default() -> Self {
		Self::Auto
	}
}

impl FromStr for ServerMonitoringMode {
	type Err = ();

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"auto"   => Self::Auto,
			"stream" => Self::Stream,
			"poll"   => Self::Poll,
			_ => return Err(())
		})
	}
}

impl ServerMonitoringMode {
	pub fn is_streaming(self) -> bool {
		match self {
			Self::Stream => true,
			Self::Poll   => false,
			Self::Auto   => !is_faas_environment()
		}
	}
}

fn is_faas_environment() -> bool {
	["AWS_EXECUTION_ENV", "AWS_LAMBDA_RUNTIME_API", "FUNCTIONS_WORKER_RUNTIME", "K_SERVICE", "FUNCTION_NAME", "VERCEL"]
		.iter()
		.any(|var| std::env::var_os(var).is_some())
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerMonitorSettings {
	pub connect_timeout:        Duration,
	pub heartbeat_interval:     Duration,
	/// `None` uses `connect_timeout`
	pub heartbeat_timeout:      Option<Duration>,
	pub min_heartbeat_interval: Duration,
	pub monitoring_mode:        ServerMonitoringMode
}

impl Default for ServerMonitorSettings {
	fn default() -> Self {
		Self {
			connect_timeout:        DEFAULT_CONNECT_TIMEOUT,
			heartbeat_interval:     DEFAULT_HEARTBEAT_INTERVAL,
			heartbeat_timeout:      None,
			min_heartbeat_interval: DEFAULT_MIN_HEARTBEAT_INTERVAL,
			monitoring_mode:        ServerMonitoringMode::Auto
		}
	}
}

with_fields!(ServerMonitorSettings {
	with_connect_timeout        => connect_timeout: Duration,
	with_heartbeat_interval     => heartbeat_interval: Duration,
	with_heartbeat_timeout      => heartbeat_timeout: Option<Duration>,
	with_min_heartbeat_interval => min_heartbeat_interval: Duration,
	with_monitoring_mode        => monitoring_mode: ServerMonitoringMode,
});

impl ServerMonitorSettings {
	pub fn effective_heartbeat_timeout(&self) -> Duration {
		self.heartbeat_timeout.unwrap_or(self.connect_timeout)
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst#connection-pool-options
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionPoolSettings {
	pub max_pool_size:        usize,
	pub min_pool_size:        usize,
	pub max_connecting:       usize,
	pub wait_queue_size:      usize,
	pub wait_queue_timeout:   Duration,
	/// `None` disables idle eviction
	pub max_idle_time:        Option<Duration>,
	/// `None` disables lifetime eviction
	pub max_life_time:        Option<Duration>,
	pub maintenance_interval: Duration
}

impl Default for ConnectionPoolSettings {
	fn default() -> Self {
		Self {
			max_pool_size:        DEFAULT_MAX_POOL_SIZE,
			min_pool_size:        DEFAULT_MIN_POOL_SIZE,
			max_connecting:       DEFAULT_MAX_CONNECTING,
			wait_queue_size:      DEFAULT_WAIT_QUEUE_SIZE,
			wait_queue_timeout:   DEFAULT_WAIT_QUEUE_TIMEOUT,
			max_idle_time:        Some(DEFAULT_MAX_IDLE_TIME),
			max_life_time:        Some(DEFAULT_MAX_LIFE_TIME),
			maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL
		}
	}
}

with_fields!(ConnectionPoolSettings {
	with_max_pool_size        => max_pool_size: usize,
	with_min_pool_size        => min_pool_size: usize,
	with_max_connecting       => max_connecting: usize,
	with_wait_queue_size      => wait_queue_size: usize,
	with_wait_queue_timeout   => wait_queue_timeout: Duration,
	with_max_idle_time        => max_idle_time: Option<Duration>,
	with_max_life_time        => max_life_time: Option<Duration>,
	with_maintenance_interval => maintenance_interval: Duration,
});

impl ConnectionPoolSettings {
	pub fn validate(&self) -> Result<()> {
		if self.max_pool_size == 0 || self.max_connecting == 0 {
			Err(Error::InvalidSettings("maxPoolSize and maxConnecting must be positive".to_string()))
		} else if self.min_pool_size > self.max_pool_size {
			Err(Error::InvalidSettings("minPoolSize must not exceed maxPoolSize".to_string()))
		} else {
			Ok(())
		}
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionSettings {
	pub app_name:      Option<String>,
	pub compressors:   Vec<Compressor>,
	pub load_balanced: bool
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			app_name:      None,
			compressors:   Vec::new(),
			load_balanced: false
		}
	}
}

with_fields!(ConnectionSettings {
	with_compressors   => compressors: Vec<Compressor>,
	with_load_balanced => load_balanced: bool,
});

impl ConnectionSettings {
	pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
		self.app_name = Some(name.into());
		self
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Socks5ProxySettings {
	pub endpoint: EndPoint,
	pub username: Option<String>,
	pub password: Option<String>
}

impl Socks5ProxySettings {
	pub fn new(endpoint: EndPoint) -> Self {
		Self { endpoint, username: None, password: None }
	}

	pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
		self.username = Some(username.into());
		self.password = Some(password.into());
		self
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TcpStreamSettings {
	pub connect_timeout: Duration,
	pub read_timeout:    Option<Duration>,
	pub write_timeout:   Option<Duration>,
	pub no_delay:        bool,
	pub proxy:           Option<Socks5ProxySettings>
}

impl Default for TcpStreamSettings {
	fn default() -> Self {
		Self {
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
			read_timeout:    None,
			write_timeout:   None,
			no_delay:        true,
			proxy:           None
		}
	}
}

with_fields!(TcpStreamSettings {
	with_connect_timeout => connect_timeout: Duration,
	with_read_timeout    => read_timeout: Option<Duration>,
	with_write_timeout   => write_timeout: Option<Duration>,
	with_no_delay        => no_delay: bool,
	with_proxy           => proxy: Option<Socks5ProxySettings>,
});

#[cfg(feature = "tls")]
#[derive(Debug, Clone)]
pub struct TlsSettings {
	pub config:      __DebugWrapper__<Arc<rustls::ClientConfig>>,
	/// Overrides the name checked against the server certificate.
	pub server_name: Option<String>
}

#[cfg(feature = "tls")]
impl TlsSettings {
	pub fn new(config: Arc<rustls::ClientConfig>) -> Self {
		Self { config: __DebugWrapper__(config), server_name: None }
	}

	pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
		self.server_name = Some(name.into());
		self
	}
}

pub type TagSet = HashMap<String, String>;

/// see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst#read-preference
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadPreference {
	pub mode:          ReadPreferenceMode,
	pub max_staleness: Option<Duration>,
	pub tag_sets:      Vec<TagSet>
}

impl Default for ReadPreference {
	fn default() -> Self {
		Self::PRIMARY
	}
}

impl ReadPreference {
	pub const PRIMARY: Self = Self {
		mode:          ReadPreferenceMode::Primary,
		max_staleness: None,
		tag_sets:      Vec::new()
	};

	pub fn new(mode: ReadPreferenceMode, tag_sets: Vec<TagSet>, max_staleness: Option<Duration>) -> Result<Self> {
		if mode == ReadPreferenceMode::Primary && (max_staleness.is_some() || tag_sets.iter().any(|t| !t.is_empty())) {
			return Err(Error::InvalidSettings("primary read preference cannot have tag sets or a max staleness".to_string()));
		}

		if let Some(max_staleness) = max_staleness {
			if max_staleness < SMALLEST_MAX_STALENESS {
				return Err(Error::InvalidSettings(format!(
					"max staleness ({}s) must be at least {}s", max_staleness.as_secs(), SMALLEST_MAX_STALENESS.as_secs())));
			}
		}

		Ok(Self { mode, max_staleness, tag_sets })
	}

	pub fn mode(mode: ReadPreferenceMode) -> Self {
		Self { mode, max_staleness: None, tag_sets: Vec::new() }
	}
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum ReadPreferenceMode {
	Primary,
	PrimaryPreferred,
	Secondary,
	SecondaryPreferred,
	Nearest
}

impl FromStr for ReadPreferenceMode {
	type Err = ();

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"primary"            => Self::Primary,
			"primaryPreferred"   => Self::PrimaryPreferred,
			"secondary"          => Self::Secondary,
			"secondaryPreferred" => Self::SecondaryPreferred,
			"nearest"            => Self::Nearest,
			_ => return Err(())
		})
	}
}

/// Error codes that signal a replica set state change.
pub const NOT_PRIMARY_CODES:         [i32; 3] = [10107, 13435, 10058];
pub const NODE_IS_RECOVERING_CODES:  [i32; 5] = [11600, 11602, 13436, 189, 91];
/// Subset of `NODE_IS_RECOVERING_CODES` that signal a shutdown.
pub const SHUTDOWN_CODES:            [i32; 2] = [11600, 91];

#[derive(Debug, Error)]
pub enum Error {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("TLS error: {0}")]
	Tls(String),
	#[error("DNS error: {0}")]
	Dns(String),
	#[error("timed out connecting to {0}")]
	ConnectTimeout(EndPoint),
	#[error("SOCKS5 proxy error: {0}")]
	Proxy(String),
	#[error("invalid reply: {0:?}")]
	InvalidReply(InvalidReplyError),
	#[error("codec error: {0}")]
	Codec(String),
	#[error("command failed with error {code} ({code_name}): {message}")]
	Command {
		code:             i32,
		code_name:        String,
		message:          String,
		topology_version: Option<TopologyVersion>
	},
	#[error("authentication failed using mechanism {mechanism}: {message}")]
	Authentication {
		mechanism: String,
		message:   String
	},
	#[error("the connection pool for {0} is closed")]
	PoolClosed(EndPoint),
	#[error("the connection pool for {endpoint} is paused")]
	PoolPaused {
		endpoint: EndPoint,
		cause:    Option<Arc<Error>>
	},
	#[error("timed out after {elapsed_ms}ms waiting for a connection from the pool for {endpoint}")]
	WaitQueueTimeout {
		endpoint:   EndPoint,
		elapsed_ms: u128
	},
	#[error("the wait queue is full")]
	WaitQueueFull,
	#[error("A timeout occurred after {elapsed_ms}ms selecting a server using {selector}. Client view of cluster state is {cluster}.")]
	ServerSelectionTimeout {
		elapsed_ms: u128,
		selector:   String,
		cluster:    String
	},
	#[error("{0}")]
	IncompatibleDriver(String),
	#[error("invalid settings: {0}")]
	InvalidSettings(String),
	#[error("invalid operation: {0}")]
	InvalidOperation(&'static str),
	#[error("the operation was cancelled")]
	Cancelled,
	#[error("the {0} has been disposed")]
	Disposed(&'static str),
	#[error("a lock has been poisoned")]
	Sync
}

impl<T> From<std::sync::PoisonError<T>> for Error {
	fn from(_: std::sync::PoisonError<T>) -> Self {
		Self::Sync
	}
}

#[cfg(feature = "tls")]
impl From<rustls::TLSError> for Error {
	fn from(e: rustls::TLSError) -> Self {
		Self::Tls(e.to_string())
	}
}

#[cfg(feature = "tls")]
impl From<webpki::InvalidDNSNameError> for Error {
	fn from(_: webpki::InvalidDNSNameError) -> Self {
		Self::Dns("invalid DNS name".to_string())
	}
}

impl From<InvalidReplyError> for Error {
	fn from(e: InvalidReplyError) -> Self {
		Self::InvalidReply(e)
	}
}

/// `std::io::Error` is not `Clone`, it is rebuilt from its kind and message.
impl Clone for Error {
	fn clone(&self) -> Self {
		match self {
			Self::Io(e)                 => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
			Self::Tls(e)                => Self::Tls(e.clone()),
			Self::Dns(e)                => Self::Dns(e.clone()),
			Self::ConnectTimeout(e)     => Self::ConnectTimeout(e.clone()),
			Self::Proxy(e)              => Self::Proxy(e.clone()),
			Self::InvalidReply(e)       => Self::InvalidReply(*e),
			Self::Codec(e)              => Self::Codec(e.clone()),
			Self::Command { code, code_name, message, topology_version } => Self::Command {
				code:             *code,
				code_name:        code_name.clone(),
				message:          message.clone(),
				topology_version: topology_version.clone()
			},
			Self::Authentication { mechanism, message } => Self::Authentication {
				mechanism: mechanism.clone(),
				message:   message.clone()
			},
			Self::PoolClosed(e)         => Self::PoolClosed(e.clone()),
			Self::PoolPaused { endpoint, cause } => Self::PoolPaused {
				endpoint: endpoint.clone(),
				cause:    cause.clone()
			},
			Self::WaitQueueTimeout { endpoint, elapsed_ms } => Self::WaitQueueTimeout {
				endpoint:   endpoint.clone(),
				elapsed_ms: *elapsed_ms
			},
			Self::WaitQueueFull         => Self::WaitQueueFull,
			Self::ServerSelectionTimeout { elapsed_ms, selector, cluster } => Self::ServerSelectionTimeout {
				elapsed_ms: *elapsed_ms,
				selector:   selector.clone(),
				cluster:    cluster.clone()
			},
			Self::IncompatibleDriver(e) => Self::IncompatibleDriver(e.clone()),
			Self::InvalidSettings(e)    => Self::InvalidSettings(e.clone()),
			Self::InvalidOperation(e)   => Self::InvalidOperation(e),
			Self::Cancelled             => Self::Cancelled,
			Self::Disposed(e)           => Self::Disposed(e),
			Self::Sync                  => Self::Sync
		}
	}
}

impl Error {
	/// Errors raised by the transport rather than the server.
	pub fn is_network_error(&self) -> bool {
		match self {
			Self::Io(_) | Self::Tls(_) | Self::Dns(_) | Self::ConnectTimeout(_) | Self::Proxy(_) | Self::InvalidReply(_) => true,
			_ => false
		}
	}

	pub fn is_network_timeout(&self) -> bool {
		match self {
			Self::Io(e) => matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock),
			Self::ConnectTimeout(_) => true,
			_ => false
		}
	}

	pub fn is_not_primary(&self) -> bool {
		match self {
			Self::Command { code, message, .. } => NOT_PRIMARY_CODES.contains(code)
				|| (!NODE_IS_RECOVERING_CODES.contains(code) && (message.contains("not master") || message.contains("not primary"))),
			_ => false
		}
	}

	pub fn is_node_is_recovering(&self) -> bool {
		match self {
			Self::Command { code, message, .. } => NODE_IS_RECOVERING_CODES.contains(code)
				|| message.contains("node is recovering")
				|| message.contains("not master or secondary"),
			_ => false
		}
	}

	/// "not primary" or "node is recovering" errors.
	pub fn is_state_change_error(&self) -> bool {
		self.is_not_primary() || self.is_node_is_recovering()
	}

	pub fn is_shutdown_error(&self) -> bool {
		match self {
			Self::Command { code, .. } => SHUTDOWN_CODES.contains(code),
			_ => false
		}
	}

	pub fn topology_version(&self) -> Option<&TopologyVersion> {
		match self {
			Self::Command { topology_version, .. } => topology_version.as_ref(),
			_ => None
		}
	}
}
