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


//! Polling of SRV records for clusters configured with a `mongodb+srv` host.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/polling-srv-records-for-mongos-discovery/polling-srv-records-for-mongos-discovery.rst

use {
	crate::{
		common::{Error, Result},
		description::EndPoint,
		utils::{lock, CancellationToken}
	},
	std::{
		fmt,
		thread::JoinHandle,
		sync::{Arc, Weak, Mutex},
		time::Duration
	},
	rand::seq::SliceRandom
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SrvRecord {
	pub endpoint: EndPoint,
	pub ttl:      Duration
}

/// Resolves SRV records, e.g. `_mongodb._tcp.cluster0.example.com`.
pub trait SrvResolver: Send + Sync + fmt::Debug {
	fn resolve_srv_records(&self, service: &str, cancel: &CancellationToken) -> Result<Vec<SrvRecord>>;
}

/// The cluster as seen by the `DnsMonitor`.
pub trait DnsMonitoringCluster: Send + Sync {
	/// Polling stops once the topology is neither unknown nor sharded.
	fn should_dns_monitor_stop(&self) -> bool;

	fn process_dns_results(&self, endpoints: Vec<EndPoint>);

	fn process_dns_error(&self, error: Error);
}

/// Returns the lookup domain if it has at least three labels, as required to derive the
/// parent domain that resolved hosts must belong to.
pub fn ensure_valid_lookup_domain(lookup_domain: &str) -> Result<&str> {
	match lookup_domain.split('.').filter(|label| !label.is_empty()).count() {
		n if n >= 3 => Ok(lookup_domain),
		_ => Err(Error::InvalidSettings(format!(
			"the SRV host '{}' must consist of at least three labels", lookup_domain)))
	}
}

/// Resolved hosts must share the parent domain of the lookup domain, e.g. `x.b.com` for `a.b.com`.
pub fn is_valid_host(lookup_domain: &str, host: &str) -> bool {
	let parent = match lookup_domain.find('.') {
		Some(i) => &lookup_domain[i..],
		None => return false
	};

	host.len() > parent.len() && host.to_ascii_lowercase().ends_with(&parent.to_ascii_lowercase())
}

pub fn valid_endpoints(lookup_domain: &str, records: &[SrvRecord]) -> Vec<EndPoint> {
	records.iter()
		.filter(|record| match is_valid_host(lookup_domain, record.endpoint.host()) {
			true => true,
			false => {
				tracing::warn!(host = record.endpoint.host(), lookup_domain, "ignoring SRV record outside of the parent domain");
				false
			}
		})
		.map(|record| record.endpoint.clone())
		.collect()
}

/// The shortest TTL, but never less than `interval`.
pub fn rescan_delay(records: &[SrvRecord], interval: Duration) -> Duration {
	records.iter()
		.map(|record| record.ttl)
		.min()
		.map_or(interval, |ttl| ttl.max(interval))
}

/// Limits the hosts to `max_hosts` (0 means no limit). Hosts that are already known are kept,
/// the remaining slots are filled with randomly chosen new hosts.
pub fn select_hosts(current: &[EndPoint], discovered: Vec<EndPoint>, max_hosts: usize) -> Vec<EndPoint> {
	if max_hosts == 0 || discovered.len() <= max_hosts {
		return discovered;
	}

	let (mut selected, mut new): (Vec<_>, Vec<_>) = discovered.into_iter()
		.partition(|endpoint| current.contains(endpoint));
	selected.truncate(max_hosts);
	new.shuffle(&mut rand::thread_rng());
	let missing = max_hosts - selected.len();
	selected.extend(new.into_iter().take(missing));
	selected
}

/// Periodically resolves the SRV records of a cluster on a background thread.
#[derive(Debug)]
pub struct DnsMonitor {
	cancel: CancellationToken,
	thread: Mutex<Option<JoinHandle<()>>>
}

impl DnsMonitor {
	pub fn start(
		cluster:       Weak<dyn DnsMonitoringCluster>,
		resolver:      Arc<dyn SrvResolver>,
		service_name:  &str,
		lookup_domain: &str,
		interval:      Duration
	) -> Result<Self> {
		let lookup_domain = ensure_valid_lookup_domain(lookup_domain)?.to_string();
		let service = format!("_{}._tcp.{}", service_name, lookup_domain);
		let cancel = CancellationToken::new();

		let token = cancel.clone();
		let thread = std::thread::Builder::new()
			.name("dns-monitor".to_string())
			.spawn(move || run(cluster, resolver, &service, &lookup_domain, interval, &token))?;

		Ok(Self { cancel, thread: Mutex::new(Some(thread)) })
	}

	/// Stops polling and waits for the thread to exit.
	pub fn stop(&self) {
		self.cancel.cancel();
		if let Some(thread) = lock(&self.thread).take() {
			if thread.thread().id() != std::thread::current().id() && thread.join().is_err() {
				tracing::warn!("the dns monitor thread panicked");
			}
		}
	}
}

impl Drop for DnsMonitor {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

fn run(
	cluster:       Weak<dyn DnsMonitoringCluster>,
	resolver:      Arc<dyn SrvResolver>,
	service:       &str,
	lookup_domain: &str,
	interval:      Duration,
	cancel:        &CancellationToken
) {
	tracing::debug!(service, "dns monitor started");
	loop {
		let delay = match resolver.resolve_srv_records(service, cancel) {
			Err(_) if cancel.is_cancelled() => break,
			Ok(records) => {
				let endpoints = valid_endpoints(lookup_domain, &records);
				match (cluster.upgrade(), endpoints.is_empty()) {
					(None, _) => break,
					(Some(_), true) => tracing::warn!(service, "no valid hosts found, keeping the current ones"),
					(Some(cluster), false) => cluster.process_dns_results(endpoints)
				}
				rescan_delay(&records, interval)
			}
			Err(e) => {
				tracing::warn!(service, error = %e, "failed to resolve SRV records");
				match cluster.upgrade() {
					Some(cluster) => cluster.process_dns_error(e),
					None => break
				}
				interval
			}
		};

		if cluster.upgrade().map_or(true, |cluster| cluster.should_dns_monitor_stop()) {
			break;
		}

		if cancel.sleep(delay) {
			break;
		}
	}
	tracing::debug!(service, "dns monitor stopped");
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		std::sync::atomic::{AtomicBool, AtomicUsize, Ordering}
	};

	fn records(hosts: &[(&str, u64)]) -> Vec<SrvRecord> {
		hosts.iter()
			.map(|(host, ttl)| SrvRecord { endpoint: EndPoint::new(host, 27017), ttl: Duration::from_secs(*ttl) })
			.collect()
	}

	#[test]
	fn lookup_domains_need_three_labels() {
		assert!(ensure_valid_lookup_domain("a.b.com").is_ok());
		assert!(ensure_valid_lookup_domain("a.b.c.com").is_ok());
		for invalid in &["", "com", "a.com"] {
			assert!(matches!(ensure_valid_lookup_domain(invalid), Err(Error::InvalidSettings(_))));
		}
	}

	#[test]
	fn hosts_must_share_the_parent_domain() {
		let cases = [
			("a.b.com", "x.b.com", true),
			("a.b.com", "x.com", false),
			("a.b.com", "x.c.com", false),
			("a.b.c.com", "x.b.c.com", true),
			("a.b.c.com", "x.b.com", false),
			("a.b.c.com", "x.d.c.com", false),
			("a.b.com", "x.bb.com", false),
			("a.b.com", "X.B.COM", true)
		];

		for (lookup_domain, host, expected) in cases.iter() {
			assert_eq!(is_valid_host(lookup_domain, host), *expected, "{} {}", lookup_domain, host);
		}

		let valid = valid_endpoints("a.b.com", &records(&[("x.c.com", 60), ("y.b.com", 60)]));
		assert_eq!(valid, vec![EndPoint::new("y.b.com", 27017)]);
	}

	#[test]
	fn rescan_delay_honors_the_shortest_ttl() {
		let interval = Duration::from_secs(60);
		let cases: [(&[u64], u64); 7] = [(&[], 60), (&[30], 60), (&[60], 60), (&[61], 61), (&[15, 30], 60), (&[30, 60], 60), (&[61, 90], 61)];

		for (ttls, expected) in cases.iter() {
			let records = ttls.iter().map(|ttl| ("x.b.com", *ttl)).collect::<Vec<_>>();
			assert_eq!(rescan_delay(&super::tests::records(&records), interval), Duration::from_secs(*expected));
		}
	}

	#[test]
	fn max_hosts_keeps_known_hosts() {
		let ep = |host: &str| EndPoint::new(host, 27017);
		let discovered = vec![ep("a.b.com"), ep("c.b.com"), ep("d.b.com"), ep("e.b.com")];

		assert_eq!(select_hosts(&[], discovered.clone(), 0).len(), 4);

		let selected = select_hosts(&[ep("c.b.com"), ep("x.b.com")], discovered.clone(), 2);
		assert_eq!(selected.len(), 2);
		assert_eq!(selected[0], ep("c.b.com"));
		assert!(discovered.contains(&selected[1]));
	}

	#[derive(Debug)]
	struct Resolver {
		records: Mutex<Result<Vec<SrvRecord>>>,
		calls:   AtomicUsize
	}

	impl SrvResolver for Resolver {
		fn resolve_srv_records(&self, service: &str, _: &CancellationToken) -> Result<Vec<SrvRecord>> {
			assert_eq!(service, "_mongodb._tcp.a.b.com");
			self.calls.fetch_add(1, Ordering::SeqCst);
			match &*self.records.lock().unwrap() {
				Ok(records) => Ok(records.clone()),
				Err(e) => Err(e.clone())
			}
		}
	}

	#[derive(Default)]
	struct Target {
		results: Mutex<Vec<Vec<EndPoint>>>,
		errors:  AtomicUsize,
		stop:    AtomicBool
	}

	impl DnsMonitoringCluster for Target {
		fn should_dns_monitor_stop(&self) -> bool {
			self.stop.load(Ordering::SeqCst)
		}

		fn process_dns_results(&self, endpoints: Vec<EndPoint>) {
			self.results.lock().unwrap().push(endpoints);
		}

		fn process_dns_error(&self, _: Error) {
			self.errors.fetch_add(1, Ordering::SeqCst);
		}
	}

	fn monitor(records: Result<Vec<SrvRecord>>, stop: bool) -> (Arc<Target>, Arc<Resolver>, DnsMonitor) {
		let target = Arc::new(Target { stop: AtomicBool::new(stop), ..Target::default() });
		let resolver = Arc::new(Resolver { records: Mutex::new(records), calls: AtomicUsize::new(0) });
		let cluster: Arc<dyn DnsMonitoringCluster> = target.clone();
		let monitor = DnsMonitor::start(
			Arc::downgrade(&cluster), resolver.clone(), "mongodb", "a.b.com", Duration::from_millis(10)).unwrap();
		(target, resolver, monitor)
	}

	#[test]
	fn stops_once_the_topology_is_settled() {
		let (target, resolver, monitor) = monitor(Ok(records(&[("host1.b.com", 0), ("host2.b.com", 0)])), true);
		std::thread::sleep(Duration::from_millis(100));
		monitor.stop();

		assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
		assert_eq!(*target.results.lock().unwrap(), vec![vec![EndPoint::new("host1.b.com", 27017), EndPoint::new("host2.b.com", 27017)]]);
	}

	#[test]
	fn invalid_hosts_are_not_reported() {
		let (target, resolver, monitor) = monitor(Ok(records(&[("host1.c.com", 0)])), false);
		std::thread::sleep(Duration::from_millis(100));
		monitor.stop();

		assert!(resolver.calls.load(Ordering::SeqCst) > 1);
		assert!(target.results.lock().unwrap().is_empty());
	}

	#[test]
	fn errors_are_reported() {
		let (target, _, monitor) = monitor(Err(Error::Dns("SERVFAIL".to_string())), false);
		std::thread::sleep(Duration::from_millis(100));
		monitor.stop();

		assert!(target.errors.load(Ordering::SeqCst) >= 1);
	}
}
