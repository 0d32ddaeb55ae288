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
		common::{Error, ClusterSettings, TagSet, DEFAULT_MONGO_PORT, DEFAULT_HEARTBEAT_INTERVAL},
		wire::{HelloReply, MIN_WIRE_VERSION, MAX_WIRE_VERSION}
	},
	std::{
		fmt,
		str::FromStr,
		cmp::Ordering,
		collections::HashSet,
		sync::{Arc, atomic::{AtomicUsize, Ordering as AtomicOrdering}},
		time::{Duration, SystemTime, UNIX_EPOCH}
	},
	serde::{Serialize, Deserialize}
};

/// Servers with this wire version or newer order primaries by election id first.
pub const ELECTION_ID_PRIORITY_WIRE_VERSION: i32 = 17;

pub const REASON_HEARTBEAT:          &str = "Heartbeat";
pub const REASON_HEARTBEAT_FAILED:   &str = "HeartbeatFailed";
pub const REASON_STALE_PRIMARY:      &str = "ReportedPrimaryIsStale";
pub const REASON_NO_LONGER_PRIMARY:  &str = "NoLongerPrimary";
pub const REASON_SET_NAME_MISMATCH:  &str = "ReplicaSetNameMismatch";

/// Address of a server. Host names are stored lower case.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EndPoint {
	host: String,
	port: u16
}

impl EndPoint {
	pub fn new(host: impl AsRef<str>, port: u16) -> Self {
		Self {
			host: host.as_ref().trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase(),
			port
		}
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn port(&self) -> u16 {
		self.port
	}
}

impl fmt::Display for EndPoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

impl FromStr for EndPoint {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let invalid = || Error::InvalidSettings(format!("invalid endpoint `{}`", s));
		let parse_port = |port: &str| port.parse::<u16>().map_err(|_| invalid());
		let s = s.trim();

		let (host, port) = if s.starts_with('[') {
			let end = s.find(']').ok_or_else(invalid)?;
			let rest = &s[end + 1..];
			(&s[1..end], match rest {
				"" => DEFAULT_MONGO_PORT,
				_ if rest.starts_with(':') => parse_port(&rest[1..])?,
				_ => return Err(invalid())
			})
		} else {
			match s.rfind(':') {
				// bare IPv6 address
				Some(i) if s[..i].contains(':') => (s, DEFAULT_MONGO_PORT),
				Some(i) => (&s[..i], parse_port(&s[i + 1..])?),
				None    => (s, DEFAULT_MONGO_PORT)
			}
		};

		if host.is_empty() {
			return Err(invalid());
		}

		Ok(Self::new(host, port))
	}
}

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Default, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 12]);

impl fmt::Display for ObjectId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.iter().try_for_each(|b| write!(f, "{:02x}", b))
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologyversion
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
	pub process_id: ObjectId,
	pub counter:    i64
}

impl TopologyVersion {
	/// `None` if either version is missing or they stem from different processes.
	pub fn compare(a: Option<&Self>, b: Option<&Self>) -> Option<Ordering> {
		match (a, b) {
			(Some(a), Some(b)) if a.process_id == b.process_id => Some(a.counter.cmp(&b.counter)),
			_ => None
		}
	}

	/// An error is stale if its version is not newer than the current one.
	pub fn is_stale_error(error: Option<&Self>, current: Option<&Self>) -> bool {
		matches!(Self::compare(error, current), Some(Ordering::Less) | Some(Ordering::Equal))
	}

	/// A response is stale if its version is older than the current one.
	pub fn is_stale_response(response: Option<&Self>, current: Option<&Self>) -> bool {
		Self::compare(response, current) == Some(Ordering::Less)
	}
}

static NEXT_CLUSTER_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ClusterId(pub usize);

impl ClusterId {
	pub fn next() -> Self {
		Self(NEXT_CLUSTER_ID.fetch_add(1, AtomicOrdering::Relaxed))
	}
}

impl fmt::Display for ClusterId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ServerId {
	pub cluster_id: ClusterId,
	pub endpoint:   EndPoint
}

impl ServerId {
	pub fn new(cluster_id: ClusterId, endpoint: EndPoint) -> Self {
		Self { cluster_id, endpoint }
	}
}

impl fmt::Display for ServerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.cluster_id, self.endpoint)
	}
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConnectionId {
	pub server_id: ServerId,
	/// Assigned by the pool, unique per server.
	pub local:     usize,
	/// Reported by the server during the handshake.
	pub server:    Option<i64>
}

impl ConnectionId {
	pub fn new(server_id: ServerId, local: usize) -> Self {
		Self { server_id, local, server: None }
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{}", self.local, self.server_id)
	}
}

/// Identifies a backend behind a load balancer.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServiceId(pub ObjectId);

impl fmt::Display for ServiceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerType {
	Standalone,
	ShardRouter,
	ReplicaSetPrimary,
	ReplicaSetSecondary,
	ReplicaSetArbiter,
	ReplicaSetOther,
	ReplicaSetGhost,
	LoadBalancer,
	Unknown
}

impl Default for ServerType {
	fn default() -> Self {
		Self::Unknown
	}
}

impl ServerType {
	pub fn is_known(self) -> bool {
		self != Self::Unknown
	}

	pub fn is_data_bearing(self) -> bool {
		matches!(self, Self::Standalone | Self::ShardRouter | Self::ReplicaSetPrimary
			| Self::ReplicaSetSecondary | Self::LoadBalancer)
	}

	pub fn is_writable(self) -> bool {
		matches!(self, Self::Standalone | Self::ShardRouter | Self::ReplicaSetPrimary | Self::LoadBalancer)
	}

	pub fn is_replica_set_member(self) -> bool {
		matches!(self, Self::ReplicaSetPrimary | Self::ReplicaSetSecondary | Self::ReplicaSetArbiter
			| Self::ReplicaSetOther | Self::ReplicaSetGhost)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerState {
	Unknown,
	Connecting,
	Connected,
	Disconnected
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TopologyType {
	Unknown,
	Single,
	ReplicaSetNoPrimary,
	ReplicaSetWithPrimary,
	Sharded,
	LoadBalanced
}

impl Default for TopologyType {
	fn default() -> Self {
		Self::Unknown
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompatibilityError {
	pub endpoint:         EndPoint,
	pub min_wire_version: i32,
	pub max_wire_version: i32
}

impl fmt::Display for CompatibilityError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.min_wire_version > MAX_WIRE_VERSION {
			write!(f, "Server at {} requires wire version {}, but this version of the driver only supports up to {}.",
				self.endpoint, self.min_wire_version, MAX_WIRE_VERSION)
		} else {
			write!(f, "Server at {} reports wire version {}, but this version of the driver requires at least {}.",
				self.endpoint, self.max_wire_version, MIN_WIRE_VERSION)
		}
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#serverdescription
#[derive(Debug, Clone)]
pub struct ServerDescription {
	pub server_id:               ServerId,
	pub state:                   ServerState,
	pub r#type:                  ServerType,
	pub average_round_trip_time: Duration,
	pub last_update_time:        SystemTime,
	pub heartbeat_interval:      Duration,
	pub reason_changed:          String,
	pub error:                   Option<Arc<Error>>,
	// fields from the handshake
	pub last_write_date:         Option<SystemTime>,
	pub min_wire_version:        i32,
	pub max_wire_version:        i32,
	pub canonical_endpoint:      Option<EndPoint>,
	pub hosts:                   Vec<EndPoint>,
	pub passives:                Vec<EndPoint>,
	pub arbiters:                Vec<EndPoint>,
	pub tags:                    TagSet,
	pub set_name:                Option<String>,
	pub set_version:             Option<i32>,
	pub election_id:             Option<ObjectId>,
	pub primary:                 Option<EndPoint>,
	pub topology_version:        Option<TopologyVersion>,
	pub logical_session_timeout: Option<Duration>
}

impl ServerDescription {
	pub fn new(server_id: ServerId) -> Self {
		Self {
			server_id,
			state:                   ServerState::Disconnected,
			r#type:                  ServerType::Unknown,
			average_round_trip_time: Duration::default(),
			last_update_time:        SystemTime::now(),
			heartbeat_interval:      DEFAULT_HEARTBEAT_INTERVAL,
			reason_changed:          "Initial".to_string(),
			error:                   None,
			last_write_date:         None,
			min_wire_version:        0,
			max_wire_version:        0,
			canonical_endpoint:      None,
			hosts:                   Vec::new(),
			passives:                Vec::new(),
			arbiters:                Vec::new(),
			tags:                    TagSet::new(),
			set_name:                None,
			set_version:             None,
			election_id:             None,
			primary:                 None,
			topology_version:        None,
			logical_session_timeout: None
		}
	}

	/// Builds a description from a successful heartbeat.
	pub fn from_hello(
		server_id:          ServerId,
		reply:              &HelloReply,
		round_trip_time:    Duration,
		heartbeat_interval: Duration
	) -> Self {
		let r#type = match reply {
			HelloReply { msg: Some(msg), .. } if msg == "isdbgrid"              => ServerType::ShardRouter,
			HelloReply { set_name: Some(_), .. } if reply.is_primary()          => ServerType::ReplicaSetPrimary,
			HelloReply { set_name: Some(_), hidden: Some(true), .. }            => ServerType::ReplicaSetOther,
			HelloReply { set_name: Some(_), secondary: Some(true), .. }         => ServerType::ReplicaSetSecondary,
			HelloReply { set_name: Some(_), arbiter_only: Some(true), .. }      => ServerType::ReplicaSetArbiter,
			HelloReply { set_name: Some(_), .. }                                => ServerType::ReplicaSetOther,
			HelloReply { is_replica_set: Some(true), .. }                       => ServerType::ReplicaSetGhost,
			_                                                                    => ServerType::Standalone
		};

		let endpoints = |hosts: &Option<Vec<String>>| hosts.iter()
			.flatten()
			.filter_map(|host| host.parse().ok())
			.collect::<Vec<EndPoint>>();

		Self {
			state:                   ServerState::Connected,
			r#type,
			average_round_trip_time: round_trip_time,
			last_update_time:        SystemTime::now(),
			heartbeat_interval,
			reason_changed:          REASON_HEARTBEAT.to_string(),
			error:                   None,
			last_write_date:         reply.last_write.as_ref().map(|v|
				UNIX_EPOCH + Duration::from_millis(v.last_write_date.max(0) as u64)),
			min_wire_version:        reply.min_wire_version,
			max_wire_version:        reply.max_wire_version,
			canonical_endpoint:      reply.me.as_ref().and_then(|me| me.parse().ok()),
			hosts:                   endpoints(&reply.hosts),
			passives:                endpoints(&reply.passives),
			arbiters:                endpoints(&reply.arbiters),
			tags:                    reply.tags.clone().unwrap_or_default(),
			set_name:                reply.set_name.clone(),
			set_version:             reply.set_version,
			election_id:             reply.election_id,
			primary:                 reply.primary.as_ref().and_then(|p| p.parse().ok()),
			topology_version:        reply.topology_version.clone(),
			logical_session_timeout: reply.logical_session_timeout_minutes.map(|m| Duration::from_secs(m.max(0) as u64 * 60)),
			..Self::new(server_id)
		}
	}

	/// Description of a load balancer, which is never monitored.
	pub fn load_balancer(server_id: ServerId) -> Self {
		Self {
			state:            ServerState::Connected,
			r#type:           ServerType::LoadBalancer,
			reason_changed:   "LoadBalanced".to_string(),
			min_wire_version: MIN_WIRE_VERSION,
			max_wire_version: MAX_WIRE_VERSION,
			..Self::new(server_id)
		}
	}

	/// An unknown description for the same server, keeping its heartbeat interval and round trip time.
	pub fn unknown(&self, reason: impl Into<String>, error: Option<Arc<Error>>) -> Self {
		Self {
			average_round_trip_time: self.average_round_trip_time,
			heartbeat_interval:      self.heartbeat_interval,
			reason_changed:          reason.into(),
			error,
			..Self::new(self.server_id.clone())
		}
	}

	pub fn with_topology_version(mut self, topology_version: Option<TopologyVersion>) -> Self {
		self.topology_version = topology_version;
		self
	}

	pub fn endpoint(&self) -> &EndPoint {
		&self.server_id.endpoint
	}

	pub fn members(&self) -> impl Iterator<Item = &EndPoint> {
		self.hosts.iter().chain(&self.passives).chain(&self.arbiters)
	}

	pub fn compatibility_error(&self) -> Option<CompatibilityError> {
		if !self.r#type.is_known() || (self.min_wire_version <= MAX_WIRE_VERSION && self.max_wire_version >= MIN_WIRE_VERSION) {
			None
		} else {
			Some(CompatibilityError {
				endpoint:         self.endpoint().clone(),
				min_wire_version: self.min_wire_version,
				max_wire_version: self.max_wire_version
			})
		}
	}

	/// Equality over the fields the discovery logic reacts to.
	pub fn sdam_eq(&self, other: &Self) -> bool {
		fn same_set(a: &[EndPoint], b: &[EndPoint]) -> bool {
			a.iter().collect::<HashSet<_>>() == b.iter().collect::<HashSet<_>>()
		}

		self.server_id == other.server_id
			&& self.state == other.state
			&& self.r#type == other.r#type
			&& self.min_wire_version == other.min_wire_version
			&& self.max_wire_version == other.max_wire_version
			&& self.canonical_endpoint == other.canonical_endpoint
			&& same_set(&self.hosts, &other.hosts)
			&& same_set(&self.passives, &other.passives)
			&& same_set(&self.arbiters, &other.arbiters)
			&& self.tags == other.tags
			&& self.set_name == other.set_name
			&& self.set_version == other.set_version
			&& self.election_id == other.election_id
			&& self.primary == other.primary
			&& self.logical_session_timeout == other.logical_session_timeout
			&& self.topology_version == other.topology_version
			&& self.error.as_ref().map(ToString::to_string) == other.error.as_ref().map(ToString::to_string)
	}
}

impl fmt::Display for ServerDescription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{ EndPoint : \"{}\", State : \"{:?}\", Type : \"{:?}\"", self.endpoint(), self.state, self.r#type)?;
		if self.r#type.is_known() {
			write!(f, ", WireVersionRange : \"[{}, {}]\"", self.min_wire_version, self.max_wire_version)?;
		}
		if let Some(error) = &self.error {
			write!(f, ", HeartbeatException : \"{}\"", error)?;
		}
		write!(f, ", LastUpdateTimestamp : \"{:?}\" }}", self.last_update_time)
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TopologyAction {
	/// A server was discovered and must be created.
	Add(EndPoint),
	/// A server left the topology and must be disposed.
	Remove(EndPoint),
	/// A server's description was replaced with an unknown one.
	Invalidate(EndPoint, &'static str)
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologydescription
#[derive(Debug, Clone)]
pub struct ClusterDescription {
	pub cluster_id:              ClusterId,
	pub r#type:                  TopologyType,
	pub servers:                 Vec<Arc<ServerDescription>>,
	pub direct_connection:       bool,
	pub load_balanced:           bool,
	pub set_name:                Option<String>,
	pub max_set_version:         Option<i32>,
	pub max_election_id:         Option<ObjectId>,
	pub logical_session_timeout: Option<Duration>,
	pub compatibility_error:     Option<CompatibilityError>,
	pub dns_monitor_error:       Option<Arc<Error>>
}

impl ClusterDescription {
	pub fn new(cluster_id: ClusterId, settings: &ClusterSettings) -> Self {
		let r#type = if settings.load_balanced {
			TopologyType::LoadBalanced
		} else if settings.direct_connection {
			TopologyType::Single
		} else if settings.replica_set_name.is_some() {
			TopologyType::ReplicaSetNoPrimary
		} else {
			TopologyType::Unknown
		};

		let mut self_ = Self {
			cluster_id,
			r#type,
			servers:                 Vec::new(),
			direct_connection:       settings.direct_connection,
			load_balanced:           settings.load_balanced,
			set_name:                settings.replica_set_name.clone(),
			max_set_version:         None,
			max_election_id:         None,
			logical_session_timeout: None,
			compatibility_error:     None,
			dns_monitor_error:       None
		};

		for endpoint in &settings.endpoints {
			if !self_.contains(endpoint) {
				self_.add(endpoint.clone());
			}
		}

		self_
	}

	pub fn server(&self, endpoint: &EndPoint) -> Option<&Arc<ServerDescription>> {
		self.servers.iter().find(|s| s.endpoint() == endpoint)
	}

	pub fn contains(&self, endpoint: &EndPoint) -> bool {
		self.server(endpoint).is_some()
	}

	pub fn primary(&self) -> Option<&Arc<ServerDescription>> {
		self.servers.iter().find(|s| s.r#type == ServerType::ReplicaSetPrimary)
	}

	/// Applies a server's new description, returning the resulting cluster description and the
	/// changes to the server set that follow from it.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#updating-the-topologydescription
	pub fn apply(&self, description: Arc<ServerDescription>) -> (Self, Vec<TopologyAction>) {
		let mut next = self.clone();
		let mut actions = Vec::new();
		let endpoint = description.endpoint().clone();

		let current = match self.server(&endpoint) {
			Some(current) => current,
			None => return (next, actions)
		};

		if description.error.is_none() && TopologyVersion::is_stale_response(
			description.topology_version.as_ref(), current.topology_version.as_ref()) {
			return (next, actions);
		}

		next.replace(description.clone());

		match (self.r#type, description.r#type) {
			(TopologyType::LoadBalanced, _) => (),
			(TopologyType::Single, _) => next.check_single(&description),
			(_, ServerType::LoadBalancer) => (),

			(TopologyType::Unknown, ServerType::Standalone) => if self.servers.len() == 1 {
				next.r#type = TopologyType::Single;
			} else {
				next.remove(&endpoint, &mut actions);
			},
			(TopologyType::Unknown, ServerType::ShardRouter) => next.r#type = TopologyType::Sharded,

			// no-op
			(TopologyType::Unknown, ServerType::Unknown)
			| (TopologyType::Unknown, ServerType::ReplicaSetGhost)
			| (TopologyType::Sharded, ServerType::Unknown)
			| (TopologyType::Sharded, ServerType::ShardRouter)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::ReplicaSetGhost) => (),

			// remove
			(TopologyType::Sharded, _)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::ShardRouter) => next.remove(&endpoint, &mut actions),
			(TopologyType::ReplicaSetWithPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::ShardRouter) => {
				next.remove(&endpoint, &mut actions);
				next.check_if_has_primary();
			}

			(TopologyType::ReplicaSetWithPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::ReplicaSetGhost) => next.check_if_has_primary(),

			(_, ServerType::ReplicaSetPrimary) => next.update_rs_from_primary(&description, &mut actions),
			(TopologyType::ReplicaSetWithPrimary, _) => next.update_rs_with_primary_from_member(&description, &mut actions),
			_ => next.update_rs_without_primary(&description, &mut actions)
		}

		next.refresh();
		(next, actions)
	}

	/// Replaces the server set with the given endpoints, e.g. after an SRV lookup.
	pub fn with_endpoints(&self, endpoints: &[EndPoint]) -> (Self, Vec<TopologyAction>) {
		let mut next = self.clone();
		let mut actions = Vec::new();

		for endpoint in endpoints {
			if !next.contains(endpoint) {
				next.add(endpoint.clone());
				actions.push(TopologyAction::Add(endpoint.clone()));
			}
		}

		let removed = next.servers.iter()
			.map(|s| s.endpoint().clone())
			.filter(|e| !endpoints.contains(e))
			.collect::<Vec<_>>();
		for endpoint in removed {
			next.remove(&endpoint, &mut actions);
		}

		next.dns_monitor_error = None;
		next.refresh();
		(next, actions)
	}

	pub fn with_dns_monitor_error(&self, error: Option<Arc<Error>>) -> Self {
		Self { dns_monitor_error: error, ..self.clone() }
	}

	/// The description of a disposed cluster.
	pub fn without_servers(&self) -> Self {
		let mut next = self.clone();
		next.servers.clear();
		next.refresh();
		next
	}

	pub fn sdam_eq(&self, other: &Self) -> bool {
		self.r#type == other.r#type
			&& self.set_name == other.set_name
			&& self.max_set_version == other.max_set_version
			&& self.max_election_id == other.max_election_id
			&& self.logical_session_timeout == other.logical_session_timeout
			&& self.compatibility_error == other.compatibility_error
			&& self.dns_monitor_error.as_ref().map(ToString::to_string)
				== other.dns_monitor_error.as_ref().map(ToString::to_string)
			&& self.servers.len() == other.servers.len()
			&& self.servers.iter().all(|s| other.server(s.endpoint())
				.map_or(false, |o| s.sdam_eq(o)))
	}

	fn add(&mut self, endpoint: EndPoint) {
		self.servers.push(Arc::new(ServerDescription::new(ServerId::new(self.cluster_id, endpoint))));
	}

	fn remove(&mut self, endpoint: &EndPoint, actions: &mut Vec<TopologyAction>) {
		let len = self.servers.len();
		self.servers.retain(|s| s.endpoint() != endpoint);
		if self.servers.len() != len {
			actions.push(TopologyAction::Remove(endpoint.clone()));
		}
	}

	fn replace(&mut self, description: Arc<ServerDescription>) {
		if let Some(slot) = self.servers.iter_mut().find(|s| s.endpoint() == description.endpoint()) {
			*slot = description;
		}
	}

	fn check_single(&mut self, description: &ServerDescription) {
		if let Some(set_name) = &self.set_name {
			if description.r#type.is_known() && description.set_name.as_ref() != Some(set_name) {
				let error = Error::InvalidSettings(format!(
					"server {} is not a member of replica set {}", description.endpoint(), set_name));
				self.replace(Arc::new(description.unknown(REASON_SET_NAME_MISMATCH, Some(Arc::new(error)))));
			}
		}
	}

	/// Checks if this topology has a primary, setting the type to `no primary` if none has been found.
	fn check_if_has_primary(&mut self) {
		self.r#type = if self.primary().is_some() {
			TopologyType::ReplicaSetWithPrimary
		} else {
			TopologyType::ReplicaSetNoPrimary
		};
	}

	fn is_stale_primary(&self, description: &ServerDescription) -> bool {
		if description.max_wire_version >= ELECTION_ID_PRIORITY_WIRE_VERSION {
			(description.election_id, description.set_version) < (self.max_election_id, self.max_set_version)
		} else {
			match (description.set_version, description.election_id, self.max_set_version, self.max_election_id) {
				(Some(set_version), Some(election_id), Some(max_set_version), Some(max_election_id)) =>
					max_set_version > set_version || (max_set_version == set_version && max_election_id > election_id),
				_ => false
			}
		}
	}

	fn update_rs_from_primary(&mut self, description: &Arc<ServerDescription>, actions: &mut Vec<TopologyAction>) {
		let endpoint = description.endpoint();

		// update set name

		match &self.set_name {
			None => self.set_name = description.set_name.clone(),
			Some(name) if description.set_name.as_ref() != Some(name) => {
				self.remove(endpoint, actions);
				self.check_if_has_primary();
				return;
			}
			_ => ()
		}

		// update setVersion and electionId

		if self.is_stale_primary(description) {
			self.replace(Arc::new(description.unknown(REASON_STALE_PRIMARY, None)));
			actions.push(TopologyAction::Invalidate(endpoint.clone(), REASON_STALE_PRIMARY));
			self.check_if_has_primary();
			return;
		}

		if description.max_wire_version >= ELECTION_ID_PRIORITY_WIRE_VERSION {
			self.max_election_id = description.election_id;
			self.max_set_version = description.set_version;
		} else {
			if description.set_version.is_some() && description.election_id.is_some() {
				self.max_election_id = description.election_id;
			}
			if description.set_version > self.max_set_version {
				self.max_set_version = description.set_version;
			}
		}

		// invalidate old primary

		let old_primaries = self.servers.iter()
			.filter(|s| s.r#type == ServerType::ReplicaSetPrimary && s.endpoint() != endpoint)
			.cloned()
			.collect::<Vec<_>>();
		for old in old_primaries {
			self.replace(Arc::new(old.unknown(REASON_NO_LONGER_PRIMARY, None)));
			actions.push(TopologyAction::Invalidate(old.endpoint().clone(), REASON_NO_LONGER_PRIMARY));
		}

		// update servers

		let members = description.members().cloned().collect::<Vec<_>>();
		for member in &members {
			if !self.contains(member) {
				self.add(member.clone());
				actions.push(TopologyAction::Add(member.clone()));
			}
		}

		let removed = self.servers.iter()
			.map(|s| s.endpoint().clone())
			.filter(|e| !members.contains(e))
			.collect::<Vec<_>>();
		for endpoint in removed {
			self.remove(&endpoint, actions);
		}

		self.check_if_has_primary();
	}

	fn update_rs_without_primary(&mut self, description: &Arc<ServerDescription>, actions: &mut Vec<TopologyAction>) {
		let endpoint = description.endpoint();
		self.r#type = TopologyType::ReplicaSetNoPrimary;

		match &self.set_name {
			None => self.set_name = description.set_name.clone(),
			Some(name) if description.set_name.as_ref() != Some(name) => {
				self.remove(endpoint, actions);
				return;
			}
			_ => ()
		}

		for member in description.members() {
			if !self.contains(member) {
				self.add(member.clone());
				actions.push(TopologyAction::Add(member.clone()));
			}
		}

		if description.canonical_endpoint.as_ref().map_or(false, |me| me != endpoint) {
			self.remove(endpoint, actions);
		}
	}

	fn update_rs_with_primary_from_member(&mut self, description: &Arc<ServerDescription>, actions: &mut Vec<TopologyAction>) {
		let endpoint = description.endpoint();

		if self.set_name != description.set_name
			|| description.canonical_endpoint.as_ref().map_or(false, |me| me != endpoint) {
			self.remove(endpoint, actions);
		}

		self.check_if_has_primary();
	}

	fn refresh(&mut self) {
		self.compatibility_error = self.servers.iter()
			.filter_map(|s| s.compatibility_error())
			.next();

		let mut data_bearing = self.servers.iter()
			.filter(|s| s.r#type.is_data_bearing())
			.peekable();

		self.logical_session_timeout = if data_bearing.peek().is_none() {
			None
		} else {
			data_bearing
				.map(|s| s.logical_session_timeout)
				.fold(Some(Duration::from_secs(u64::MAX)), |acc, t| match (acc, t) {
					(Some(a), Some(b)) => Some(a.min(b)),
					_ => None
				})
		};
	}
}

impl fmt::Display for ClusterDescription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{ ClusterId : \"{}\", Type : \"{:?}\", Servers : [", self.cluster_id, self.r#type)?;
		for (i, server) in self.servers.iter().enumerate() {
			if i > 0 {
				f.write_str(", ")?;
			}
			server.fmt(f)?;
		}
		f.write_str("]")?;
		if let Some(error) = &self.compatibility_error {
			write!(f, ", CompatibilityError : \"{}\"", error)?;
		}
		if let Some(error) = &self.dns_monitor_error {
			write!(f, ", DnsMonitorException : \"{}\"", error)?;
		}
		f.write_str(" }")
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	pub(crate) fn ep(s: &str) -> EndPoint {
		s.parse().unwrap()
	}

	pub(crate) fn oid(n: u8) -> ObjectId {
		let mut bytes = [0u8; 12];
		bytes[11] = n;
		ObjectId(bytes)
	}

	pub(crate) fn known(cluster_id: ClusterId, endpoint: &str, r#type: ServerType) -> ServerDescription {
		ServerDescription {
			state:            ServerState::Connected,
			r#type,
			min_wire_version: MIN_WIRE_VERSION,
			max_wire_version: MAX_WIRE_VERSION,
			reason_changed:   REASON_HEARTBEAT.to_string(),
			..ServerDescription::new(ServerId::new(cluster_id, ep(endpoint)))
		}
	}

	pub(crate) fn member(
		cluster_id: ClusterId,
		endpoint:   &str,
		r#type:     ServerType,
		hosts:      &[&str]
	) -> ServerDescription {
		ServerDescription {
			set_name:           Some("rs0".to_string()),
			hosts:              hosts.iter().map(|h| ep(h)).collect(),
			canonical_endpoint: Some(ep(endpoint)),
			..known(cluster_id, endpoint, r#type)
		}
	}

	pub(crate) fn primary(
		cluster_id:  ClusterId,
		endpoint:    &str,
		hosts:       &[&str],
		set_version: i32,
		election_id: u8
	) -> ServerDescription {
		ServerDescription {
			set_version: Some(set_version),
			election_id: Some(oid(election_id)),
			..member(cluster_id, endpoint, ServerType::ReplicaSetPrimary, hosts)
		}
	}

	fn cluster(endpoints: &[&str]) -> ClusterDescription {
		ClusterDescription::new(ClusterId::next(), &ClusterSettings::default()
			.with_endpoints(endpoints.iter().map(|e| ep(e))))
	}

	fn apply(cluster: &ClusterDescription, description: ServerDescription) -> (ClusterDescription, Vec<TopologyAction>) {
		cluster.apply(Arc::new(description))
	}

	fn type_of(cluster: &ClusterDescription, endpoint: &str) -> ServerType {
		cluster.server(&ep(endpoint)).map(|s| s.r#type).unwrap_or(ServerType::Unknown)
	}

	const HOSTS: [&str; 3] = ["a:27017", "b:27017", "c:27017"];

	#[test]
	fn parse_endpoints() {
		assert_eq!(ep("Example.COM"), EndPoint::new("example.com", 27017));
		assert_eq!(ep("host:1234").port(), 1234);
		assert_eq!(ep("[::1]:27018"), EndPoint::new("::1", 27018));
		assert_eq!(ep("[::1]").to_string(), "[::1]:27017");
		assert_eq!(ep("::1").host(), "::1");
		assert!("host:port".parse::<EndPoint>().is_err());
		assert!("".parse::<EndPoint>().is_err());
	}

	#[test]
	fn discovers_replica_set_from_primary() {
		let c = cluster(&["a:27017"]);
		let (c, actions) = apply(&c, primary(c.cluster_id, "a:27017", &HOSTS, 1, 1));

		assert_eq!(c.r#type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(c.set_name.as_deref(), Some("rs0"));
		assert_eq!(c.servers.len(), 3);
		assert_eq!(actions, vec![TopologyAction::Add(ep("b:27017")), TopologyAction::Add(ep("c:27017"))]);
	}

	#[test]
	fn primary_membership_removes_unlisted_servers() {
		let c = cluster(&["a:27017", "d:27017"]);
		let (c, actions) = apply(&c, primary(c.cluster_id, "a:27017", &HOSTS, 1, 1));

		assert!(!c.contains(&ep("d:27017")));
		assert!(actions.contains(&TopologyAction::Remove(ep("d:27017"))));
	}

	#[test]
	fn converges_regardless_of_order() {
		let c = cluster(&HOSTS);
		let id = c.cluster_id;
		let updates = vec![
			primary(id, "a:27017", &HOSTS, 1, 1),
			member(id, "b:27017", ServerType::ReplicaSetSecondary, &HOSTS),
			member(id, "c:27017", ServerType::ReplicaSetArbiter, &HOSTS),
		];

		let orders: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
		for order in orders.iter() {
			let result = order.iter().fold(c.clone(), |c, i| apply(&c, updates[*i].clone()).0);
			assert_eq!(result.r#type, TopologyType::ReplicaSetWithPrimary, "order {:?}", order);
			assert_eq!(type_of(&result, "a:27017"), ServerType::ReplicaSetPrimary);
			assert_eq!(type_of(&result, "b:27017"), ServerType::ReplicaSetSecondary);
			assert_eq!(type_of(&result, "c:27017"), ServerType::ReplicaSetArbiter);
		}
	}

	#[test]
	fn newer_primary_demotes_old_one() {
		let c = cluster(&HOSTS);
		let id = c.cluster_id;
		let (c, _) = apply(&c, primary(id, "a:27017", &HOSTS, 1, 1));
		let (c, actions) = apply(&c, primary(id, "b:27017", &HOSTS, 1, 2));

		assert_eq!(type_of(&c, "a:27017"), ServerType::Unknown);
		assert_eq!(type_of(&c, "b:27017"), ServerType::ReplicaSetPrimary);
		assert_eq!(actions, vec![TopologyAction::Invalidate(ep("a:27017"), REASON_NO_LONGER_PRIMARY)]);
		assert_eq!(c.servers.iter().filter(|s| s.r#type == ServerType::ReplicaSetPrimary).count(), 1);
	}

	#[test]
	fn stale_primary_is_rejected() {
		let c = cluster(&HOSTS);
		let id = c.cluster_id;
		let (c, _) = apply(&c, primary(id, "b:27017", &HOSTS, 1, 2));
		let (c, actions) = apply(&c, primary(id, "a:27017", &HOSTS, 1, 1));

		assert_eq!(c.r#type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(type_of(&c, "b:27017"), ServerType::ReplicaSetPrimary);
		assert_eq!(type_of(&c, "a:27017"), ServerType::Unknown);
		assert_eq!(c.server(&ep("a:27017")).unwrap().reason_changed, REASON_STALE_PRIMARY);
		assert_eq!(actions, vec![TopologyAction::Invalidate(ep("a:27017"), REASON_STALE_PRIMARY)]);
		assert_eq!(c.max_election_id, Some(oid(2)));
	}

	#[test]
	fn legacy_primary_ordering_uses_set_version_first() {
		let c = cluster(&HOSTS);
		let id = c.cluster_id;
		let legacy = |endpoint, set_version, election_id| ServerDescription {
			max_wire_version: 8,
			..primary(id, endpoint, &HOSTS, set_version, election_id)
		};

		let (c, _) = apply(&c, legacy("a:27017", 2, 1));
		// higher election id but lower set version
		let (c, _) = apply(&c, legacy("b:27017", 1, 5));

		assert_eq!(type_of(&c, "a:27017"), ServerType::ReplicaSetPrimary);
		assert_eq!(type_of(&c, "b:27017"), ServerType::Unknown);
		assert_eq!(c.max_set_version, Some(2));
	}

	#[test]
	fn failover_transitions() {
		let c = cluster(&HOSTS);
		let id = c.cluster_id;
		let (c, _) = apply(&c, primary(id, "a:27017", &HOSTS, 1, 1));
		let (c, _) = apply(&c, member(id, "b:27017", ServerType::ReplicaSetSecondary, &HOSTS));
		assert_eq!(c.r#type, TopologyType::ReplicaSetWithPrimary);

		let down = c.server(&ep("a:27017")).unwrap()
			.unknown(REASON_HEARTBEAT_FAILED, Some(Arc::new(Error::Io(std::io::ErrorKind::ConnectionReset.into()))));
		let (c, _) = apply(&c, down);
		assert_eq!(c.r#type, TopologyType::ReplicaSetNoPrimary);

		let (c, _) = apply(&c, primary(id, "b:27017", &HOSTS, 1, 2));
		assert_eq!(c.r#type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(c.primary().unwrap().endpoint(), &ep("b:27017"));
	}

	#[test]
	fn set_name_and_me_mismatch_remove_servers() {
		let c = cluster(&HOSTS).clone();
		let id = c.cluster_id;
		let (c, _) = apply(&c, primary(id, "a:27017", &HOSTS, 1, 1));

		let foreign = ServerDescription { set_name: Some("other".to_string()), ..member(id, "b:27017", ServerType::ReplicaSetSecondary, &HOSTS) };
		let (c, actions) = apply(&c, foreign);
		assert!(!c.contains(&ep("b:27017")));
		assert_eq!(actions, vec![TopologyAction::Remove(ep("b:27017"))]);

		let renamed = ServerDescription { canonical_endpoint: Some(ep("x:27017")), ..member(id, "c:27017", ServerType::ReplicaSetSecondary, &HOSTS) };
		let (c, _) = apply(&c, renamed);
		assert!(!c.contains(&ep("c:27017")));
		assert_eq!(c.r#type, TopologyType::ReplicaSetWithPrimary);
	}

	#[test]
	fn standalone_and_sharded_rules() {
		let c = cluster(&["a:27017"]);
		let (single, _) = apply(&c, known(c.cluster_id, "a:27017", ServerType::Standalone));
		assert_eq!(single.r#type, TopologyType::Single);

		let c = cluster(&["a:27017", "b:27017"]);
		let (c2, actions) = apply(&c, known(c.cluster_id, "a:27017", ServerType::Standalone));
		assert_eq!(c2.r#type, TopologyType::Unknown);
		assert_eq!(actions, vec![TopologyAction::Remove(ep("a:27017"))]);

		let (sharded, _) = apply(&c, known(c.cluster_id, "a:27017", ServerType::ShardRouter));
		assert_eq!(sharded.r#type, TopologyType::Sharded);
		let (sharded, actions) = apply(&sharded, member(c.cluster_id, "b:27017", ServerType::ReplicaSetSecondary, &HOSTS));
		assert_eq!(actions, vec![TopologyAction::Remove(ep("b:27017"))]);
		assert_eq!(sharded.servers.len(), 1);
	}

	#[test]
	fn incompatible_server_sets_error() {
		let c = cluster(&["a:27017", "b:27017"]);
		let future = ServerDescription {
			min_wire_version: MAX_WIRE_VERSION + 1,
			max_wire_version: MAX_WIRE_VERSION + 5,
			..known(c.cluster_id, "a:27017", ServerType::ShardRouter)
		};
		let (c, _) = apply(&c, future);
		let error = c.compatibility_error.clone().unwrap();
		assert_eq!(error.endpoint, ep("a:27017"));
		assert!(error.to_string().contains("requires wire version"));

		let (c, _) = apply(&c, known(c.cluster_id, "a:27017", ServerType::ShardRouter));
		assert!(c.compatibility_error.is_none());
	}

	#[test]
	fn stale_topology_version_is_ignored() {
		let c = cluster(&["a:27017"]);
		let id = c.cluster_id;
		let tv = |counter| Some(TopologyVersion { process_id: oid(9), counter });

		let (c, _) = apply(&c, known(id, "a:27017", ServerType::ShardRouter).with_topology_version(tv(5)));
		let older = ServerDescription { set_name: Some("x".into()), ..known(id, "a:27017", ServerType::ShardRouter) }
			.with_topology_version(tv(4));
		let (c, _) = apply(&c, older);
		assert!(c.server(&ep("a:27017")).unwrap().set_name.is_none());
	}

	#[test]
	fn logical_session_timeout_is_minimum_of_data_bearing() {
		let c = cluster(&["a:27017", "b:27017"]);
		let id = c.cluster_id;
		let with_timeout = |e, m: u64| ServerDescription {
			logical_session_timeout: Some(Duration::from_secs(m * 60)),
			..known(id, e, ServerType::ShardRouter)
		};
		let (c, _) = apply(&c, with_timeout("a:27017", 30));
		let (c, _) = apply(&c, with_timeout("b:27017", 20));
		assert_eq!(c.logical_session_timeout, Some(Duration::from_secs(20 * 60)));

		let (c, _) = apply(&c, known(id, "b:27017", ServerType::ShardRouter));
		assert_eq!(c.logical_session_timeout, None);
	}

	#[test]
	fn dns_results_replace_servers() {
		let c = cluster(&["a:27017", "b:27017"]);
		let (c, actions) = c.with_endpoints(&[ep("b:27017"), ep("c:27017")]);
		assert_eq!(actions, vec![TopologyAction::Add(ep("c:27017")), TopologyAction::Remove(ep("a:27017"))]);
		assert!(c.contains(&ep("c:27017")) && !c.contains(&ep("a:27017")));
	}

	#[test]
	fn sdam_eq_ignores_round_trip_time() {
		let id = ClusterId::next();
		let a = known(id, "a:27017", ServerType::Standalone);
		let b = ServerDescription { average_round_trip_time: Duration::from_millis(40), ..a.clone() };
		assert!(a.sdam_eq(&b));
		let c = ServerDescription { tags: vec![("dc".to_string(), "ny".to_string())].into_iter().collect(), ..a.clone() };
		assert!(!a.sdam_eq(&c));
	}
}
