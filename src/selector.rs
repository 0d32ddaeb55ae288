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

//! Server selection
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst

use {
	crate::{
		common::{Error, Result, ReadPreference, ReadPreferenceMode, TagSet, IDLE_WRITE_PERIOD},
		description::{ClusterDescription, ServerDescription, ServerType, TopologyType, EndPoint}
	},
	std::{fmt, sync::Arc, time::{Duration, SystemTime, UNIX_EPOCH}},
	rand::seq::SliceRandom
};

/// Narrows down a set of candidate servers.
pub trait ServerSelector: fmt::Display + Send + Sync {
	fn select_servers(
		&self,
		cluster: &ClusterDescription,
		servers: &[Arc<ServerDescription>]
	) -> Vec<Arc<ServerDescription>>;

	/// Fails if no selection can be made against `cluster` with this selector's settings.
	fn validate(&self, _cluster: &ClusterDescription) -> Result<()> {
		Ok(())
	}
}

#[derive(Debug, Clone)]
pub struct ReadPreferenceServerSelector {
	pub read_preference: ReadPreference
}

impl ReadPreferenceServerSelector {
	pub fn new(read_preference: ReadPreference) -> Self {
		Self { read_preference }
	}

	pub fn primary() -> Self {
		Self::new(ReadPreference::PRIMARY)
	}

	fn select_replica_set(&self, cluster: &ClusterDescription, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
		let servers = self.filter_stale(cluster, servers);
		let primaries = || servers.iter()
			.filter(|s| s.r#type == ServerType::ReplicaSetPrimary)
			.cloned()
			.collect::<Vec<_>>();
		let secondaries = || self.select_by_tags(servers.iter()
			.filter(|s| s.r#type == ServerType::ReplicaSetSecondary));

		match self.read_preference.mode {
			ReadPreferenceMode::Primary => primaries(),
			ReadPreferenceMode::PrimaryPreferred => match primaries() {
				v if v.is_empty() => secondaries(),
				v => v
			},
			ReadPreferenceMode::Secondary => secondaries(),
			ReadPreferenceMode::SecondaryPreferred => match secondaries() {
				v if v.is_empty() => primaries(),
				v => v
			},
			ReadPreferenceMode::Nearest => self.select_by_tags(servers.iter()
				.filter(|s| matches!(s.r#type, ServerType::ReplicaSetPrimary | ServerType::ReplicaSetSecondary)))
		}
	}

	/// Servers matching the first tag set that matches any server.
	fn select_by_tags<'a>(&self, servers: impl Iterator<Item = &'a Arc<ServerDescription>> + Clone) -> Vec<Arc<ServerDescription>> {
		fn matches(server: &ServerDescription, tag_set: &TagSet) -> bool {
			tag_set.iter().all(|(k, v)| server.tags.get(k) == Some(v))
		}

		if self.read_preference.tag_sets.is_empty() {
			return servers.cloned().collect();
		}

		self.read_preference.tag_sets.iter()
			.map(|tag_set| servers.clone()
				.filter(|s| matches(s, tag_set))
				.cloned()
				.collect::<Vec<_>>())
			.find(|v| !v.is_empty())
			.unwrap_or_default()
	}

	/// Removes secondaries whose estimated staleness exceeds `maxStalenessSeconds`.
	fn filter_stale(&self, cluster: &ClusterDescription, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
		let max_staleness = match self.read_preference.max_staleness {
			Some(v) => v,
			None => return servers.to_vec()
		};

		fn millis(time: SystemTime) -> i128 {
			match time.duration_since(UNIX_EPOCH) {
				Ok(d) => d.as_millis() as i128,
				Err(e) => -(e.duration().as_millis() as i128)
			}
		}

		fn last_write(s: &ServerDescription) -> i128 {
			millis(s.last_write_date.unwrap_or(s.last_update_time))
		}

		let primary = cluster.primary();
		let max_last_write = servers.iter()
			.filter(|s| s.r#type == ServerType::ReplicaSetSecondary)
			.map(|s| last_write(s))
			.max();

		servers.iter()
			.filter(|s| {
				if s.r#type != ServerType::ReplicaSetSecondary {
					return true;
				}

				let heartbeat = s.heartbeat_interval.as_millis() as i128;
				let staleness = match primary {
					Some(p) => (millis(s.last_update_time) - last_write(s))
						- (millis(p.last_update_time) - last_write(p))
						+ heartbeat,
					None => max_last_write.unwrap_or_default() - last_write(s) + heartbeat
				};
				staleness <= max_staleness.as_millis() as i128
			})
			.cloned()
			.collect()
	}
}

impl ServerSelector for ReadPreferenceServerSelector {
	fn select_servers(&self, cluster: &ClusterDescription, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
		match cluster.r#type {
			TopologyType::Single | TopologyType::LoadBalanced => servers.to_vec(),
			TopologyType::Sharded => servers.iter()
				.filter(|s| s.r#type == ServerType::ShardRouter)
				.cloned()
				.collect(),
			TopologyType::ReplicaSetNoPrimary
			| TopologyType::ReplicaSetWithPrimary => self.select_replica_set(cluster, servers),
			TopologyType::Unknown => Vec::new()
		}
	}

	/// A max staleness must leave room for one heartbeat plus the primary's idle write.
	fn validate(&self, cluster: &ClusterDescription) -> Result<()> {
		let max_staleness = match self.read_preference.max_staleness {
			Some(v) if matches!(cluster.r#type, TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary) => v,
			_ => return Ok(())
		};

		let heartbeat_interval = cluster.servers.iter()
			.map(|s| s.heartbeat_interval)
			.max();
		match heartbeat_interval {
			Some(heartbeat_interval) if max_staleness < heartbeat_interval + IDLE_WRITE_PERIOD =>
				Err(Error::InvalidSettings(format!(
					"max staleness ({}s) must be at least the heartbeat interval plus the idle write period ({}s)",
					max_staleness.as_secs(), (heartbeat_interval + IDLE_WRITE_PERIOD).as_secs()))),
			_ => Ok(())
		}
	}
}

impl fmt::Display for ReadPreferenceServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ReadPreferenceServerSelector{{ ReadPreference = {{ Mode : {:?}", self.read_preference.mode)?;
		if !self.read_preference.tag_sets.is_empty() {
			write!(f, ", TagSets : {:?}", self.read_preference.tag_sets)?;
		}
		if let Some(max_staleness) = self.read_preference.max_staleness {
			write!(f, ", MaxStaleness : {}s", max_staleness.as_secs())?;
		}
		f.write_str(" } }")
	}
}

/// Selects servers that accept writes.
#[derive(Debug, Copy, Clone, Default)]
pub struct WritableServerSelector;

impl ServerSelector for WritableServerSelector {
	fn select_servers(&self, cluster: &ClusterDescription, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
		match cluster.r#type {
			TopologyType::Single | TopologyType::LoadBalanced => servers.to_vec(),
			_ => servers.iter()
				.filter(|s| s.r#type.is_writable())
				.cloned()
				.collect()
		}
	}
}

impl fmt::Display for WritableServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("WritableServerSelector")
	}
}

#[derive(Debug, Clone)]
pub struct EndPointServerSelector(pub EndPoint);

impl ServerSelector for EndPointServerSelector {
	fn select_servers(&self, _: &ClusterDescription, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
		servers.iter()
			.filter(|s| s.endpoint() == &self.0)
			.cloned()
			.collect()
	}
}

impl fmt::Display for EndPointServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "EndPointServerSelector{{ EndPoint = {} }}", self.0)
	}
}

/// Keeps the servers whose round trip time is within `threshold` of the fastest one.
#[derive(Debug, Copy, Clone)]
pub struct LatencyLimitingServerSelector(pub Duration);

impl ServerSelector for LatencyLimitingServerSelector {
	fn select_servers(&self, _: &ClusterDescription, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
		let fastest = match servers.iter().map(|s| s.average_round_trip_time).min() {
			Some(v) => v,
			None => return Vec::new()
		};

		servers.iter()
			.filter(|s| s.average_round_trip_time <= fastest + self.0)
			.cloned()
			.collect()
	}
}

impl fmt::Display for LatencyLimitingServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "LatencyLimitingServerSelector{{ AllowedLatencyRange = {}ms }}", self.0.as_millis())
	}
}

/// Applies selectors in order, each one seeing the previous one's result.
#[derive(Clone)]
pub struct CompositeServerSelector(pub Vec<Arc<dyn ServerSelector>>);

impl ServerSelector for CompositeServerSelector {
	fn select_servers(&self, cluster: &ClusterDescription, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
		self.0.iter().fold(servers.to_vec(), |servers, selector|
			selector.select_servers(cluster, &servers))
	}

	fn validate(&self, cluster: &ClusterDescription) -> Result<()> {
		self.0.iter().try_for_each(|selector| selector.validate(cluster))
	}
}

impl fmt::Display for CompositeServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("CompositeServerSelector{ Selectors = ")?;
		for (i, selector) in self.0.iter().enumerate() {
			if i > 0 {
				f.write_str(", ")?;
			}
			selector.fmt(f)?;
		}
		f.write_str(" }")
	}
}

pub type SelectorFn = dyn Fn(&ClusterDescription, &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> + Send + Sync;

#[derive(Clone)]
pub struct DelegateServerSelector {
	name:     String,
	delegate: Arc<SelectorFn>
}

impl DelegateServerSelector {
	pub fn new(
		name:     impl Into<String>,
		delegate: impl Fn(&ClusterDescription, &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> + Send + Sync + 'static
	) -> Self {
		Self { name: name.into(), delegate: Arc::new(delegate) }
	}
}

impl ServerSelector for DelegateServerSelector {
	fn select_servers(&self, cluster: &ClusterDescription, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
		(self.delegate)(cluster, servers)
	}
}

impl fmt::Display for DelegateServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "DelegateServerSelector{{ Name = {} }}", self.name)
	}
}

/// Picks one server uniformly at random.
#[derive(Debug, Copy, Clone, Default)]
pub struct RandomServerSelector;

impl ServerSelector for RandomServerSelector {
	fn select_servers(&self, _: &ClusterDescription, servers: &[Arc<ServerDescription>]) -> Vec<Arc<ServerDescription>> {
		servers.choose(&mut rand::thread_rng())
			.cloned()
			.into_iter()
			.collect()
	}
}

impl fmt::Display for RandomServerSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("RandomServerSelector")
	}
}
