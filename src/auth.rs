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

//! Authentication is performed once per connection, right after the handshake.
//! Mechanisms are supplied by the user through the `Authenticator` trait.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/auth/auth.rst

use {
	crate::{
		common::{Result, DEFAULT_CREDENTIAL_CACHE_TTL},
		connection::Connection,
		utils::lock
	},
	std::{
		fmt,
		sync::{Arc, Mutex},
		collections::HashMap,
		time::{Duration, Instant}
	}
};

pub trait Authenticator: Send + Sync + fmt::Debug {
	/// The mechanism name, e.g. `SCRAM-SHA-256`.
	fn name(&self) -> &str;

	/// Runs the conversation on a freshly opened connection. Derived secrets may be shared
	/// between connections through `cache`.
	fn authenticate(&self, connection: &mut Connection, cache: &CredentialCache) -> Result<()>;
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CredentialKey {
	pub mechanism: String,
	pub principal: String,
	/// Mechanism specific derivation inputs, e.g. salt and iteration count
	pub params:    Vec<u8>
}

/// A shared reference to a cached secret. The entry is kept while leases are alive.
pub type CredentialLease = Arc<Vec<u8>>;

#[derive(Debug)]
struct CacheEntry {
	value:    CredentialLease,
	inserted: Instant
}

/// Caches derived secrets (e.g. salted passwords) so that only the first connection pays for
/// the key derivation. Entries expire after `ttl`, but are only evicted once no lease is held.
#[derive(Debug)]
pub struct CredentialCache {
	ttl:     Duration,
	entries: Mutex<HashMap<CredentialKey, CacheEntry>>
}

impl Default for CredentialCache {
	fn default() -> Self {
		Self::new(DEFAULT_CREDENTIAL_CACHE_TTL)
	}
}

impl CredentialCache {
	pub fn new(ttl: Duration) -> Self {
		Self { ttl, entries: Mutex::new(HashMap::new()) }
	}

	pub fn get(&self, key: &CredentialKey) -> Option<CredentialLease> {
		let mut entries = lock(&self.entries);
		match entries.get(key) {
			Some(entry) if self.is_evictable(entry) => {
				entries.remove(key);
				None
			}
			Some(entry) => Some(entry.value.clone()),
			None => None
		}
	}

	/// Returns the cached secret or derives it. The derivation runs without holding the lock,
	/// so concurrent first uses may derive twice, the first insert wins.
	pub fn get_or_insert_with(&self, key: CredentialKey, derive: impl FnOnce() -> Result<Vec<u8>>) -> Result<CredentialLease> {
		if let Some(lease) = self.get(&key) {
			return Ok(lease);
		}

		let value = Arc::new(derive()?);
		let mut entries = lock(&self.entries);
		let entry = entries.entry(key).or_insert_with(|| CacheEntry { value, inserted: Instant::now() });
		Ok(entry.value.clone())
	}

	pub fn remove(&self, key: &CredentialKey) {
		lock(&self.entries).remove(key);
	}

	/// Drops expired entries that are not leased.
	pub fn evict_expired(&self) {
		let ttl = self.ttl;
		lock(&self.entries).retain(|_, entry| entry.inserted.elapsed() < ttl || Arc::strong_count(&entry.value) > 1);
	}

	pub fn len(&self) -> usize {
		lock(&self.entries).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn is_evictable(&self, entry: &CacheEntry) -> bool {
		entry.inserted.elapsed() >= self.ttl && Arc::strong_count(&entry.value) == 1
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(principal: &str) -> CredentialKey {
		CredentialKey {
			mechanism: "SCRAM-SHA-256".to_string(),
			principal: principal.to_string(),
			params:    vec![1, 2, 3]
		}
	}

	#[test]
	fn derives_once() {
		let cache = CredentialCache::default();
		let mut derivations = 0;

		for _ in 0..3 {
			let lease = cache.get_or_insert_with(key("alice"), || {
				derivations += 1;
				Ok(b"secret".to_vec())
			}).unwrap();
			assert_eq!(&**lease, b"secret");
		}

		assert_eq!(derivations, 1);
		assert!(cache.get(&key("bob")).is_none());
	}

	#[test]
	fn expired_entries_survive_while_leased() {
		let cache = CredentialCache::new(Duration::from_millis(0));
		let lease = cache.get_or_insert_with(key("alice"), || Ok(vec![7])).unwrap();

		cache.evict_expired();
		assert_eq!(cache.len(), 1);
		assert!(cache.get(&key("alice")).is_some());

		drop(lease);
		assert!(cache.get(&key("alice")).is_none());
		assert!(cache.is_empty());
	}

	#[test]
	fn failed_derivation_is_not_cached() {
		let cache = CredentialCache::default();
		let result = cache.get_or_insert_with(key("alice"), || Err(crate::common::Error::Authentication {
			mechanism: "SCRAM-SHA-256".to_string(),
			message:   "bad salt".to_string()
		}));
		assert!(result.is_err());
		assert!(cache.is_empty());
	}
}
