//! Two-tier token cache: a size-bounded in-process LRU (L1) in front of a
//! [`DistributedCache`] (L2).
//!
//! L2 is the system of record. Writes go to L2 first and only then to L1, and an L1 entry
//! never outlives the ratio-scaled L2 expiry so out-of-process invalidations are picked up.

// crates.io
use lru::LruCache;
// self
use crate::{
	_prelude::*,
	error::ConfigError,
	store::{CacheError, CacheFuture, DistributedCache},
};

/// Default L1 byte ceiling (500 MiB).
pub const DEFAULT_L1_SIZE_LIMIT: u64 = 500 * 1024 * 1024;

/// Callback consulted when L2 reports a connectivity failure; `true` retries once.
pub type DistributedCacheFailureCallback = Arc<dyn Fn(&CacheError) -> bool + Send + Sync>;

/// Tuning knobs for [`TokenCacheStore`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCacheStoreOptions {
	/// Maximum bytes (keys + blobs) kept in L1 before least-recently-used eviction.
	pub l1_size_limit: u64,
	/// Fraction in `(0, 1]` of the L2 lifetime an L1 entry may live.
	pub l1_expiration_ratio: f64,
	/// L1 lifetime used when L2 does not report an expiry for a back-propagated entry.
	pub l1_fallback_ttl: Duration,
	/// Bypasses L1 entirely (every read hits L2).
	pub disable_l1: bool,
	/// Recoverable-failure callback for L2 connectivity errors.
	#[serde(skip)]
	pub on_distributed_cache_failure: Option<DistributedCacheFailureCallback>,
}
impl TokenCacheStoreOptions {
	/// Overrides the L1 byte ceiling.
	pub fn with_l1_size_limit(mut self, bytes: u64) -> Self {
		self.l1_size_limit = bytes;

		self
	}

	/// Overrides the L1/L2 lifetime ratio.
	pub fn with_l1_expiration_ratio(mut self, ratio: f64) -> Self {
		self.l1_expiration_ratio = ratio;

		self
	}

	/// Disables the in-process tier.
	pub fn with_l1_disabled(mut self) -> Self {
		self.disable_l1 = true;

		self
	}

	/// Registers the L2 connectivity-failure callback.
	pub fn on_distributed_cache_failure<F>(mut self, callback: F) -> Self
	where
		F: 'static + Fn(&CacheError) -> bool + Send + Sync,
	{
		self.on_distributed_cache_failure = Some(Arc::new(callback));

		self
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if !(self.l1_expiration_ratio > 0. && self.l1_expiration_ratio <= 1.) {
			return Err(ConfigError::InvalidCacheOptions {
				reason: "l1_expiration_ratio must be in (0, 1]",
			});
		}
		if self.l1_size_limit == 0 && !self.disable_l1 {
			return Err(ConfigError::InvalidCacheOptions {
				reason: "l1_size_limit must be positive unless L1 is disabled",
			});
		}

		Ok(())
	}
}
impl Default for TokenCacheStoreOptions {
	fn default() -> Self {
		Self {
			l1_size_limit: DEFAULT_L1_SIZE_LIMIT,
			l1_expiration_ratio: 1.,
			l1_fallback_ttl: Duration::hours(1),
			disable_l1: false,
			on_distributed_cache_failure: None,
		}
	}
}
impl Debug for TokenCacheStoreOptions {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenCacheStoreOptions")
			.field("l1_size_limit", &self.l1_size_limit)
			.field("l1_expiration_ratio", &self.l1_expiration_ratio)
			.field("l1_fallback_ttl", &self.l1_fallback_ttl)
			.field("disable_l1", &self.disable_l1)
			.field("on_distributed_cache_failure", &self.on_distributed_cache_failure.is_some())
			.finish()
	}
}

struct L1Entry {
	value: Vec<u8>,
	expires_at: OffsetDateTime,
}

struct L1State {
	entries: LruCache<String, L1Entry>,
	bytes: u64,
}
impl L1State {
	fn remove(&mut self, key: &str) {
		if let Some(entry) = self.entries.pop(key) {
			self.bytes -= entry_size(key, &entry.value);
		}
	}
}

/// Two-tier (L1 + L2) store for opaque token-cache blobs.
pub struct TokenCacheStore {
	l2: Arc<dyn DistributedCache>,
	l1: Mutex<L1State>,
	options: TokenCacheStoreOptions,
}
impl TokenCacheStore {
	/// Builds a store over `l2` after validating `options`.
	pub fn new(l2: Arc<dyn DistributedCache>, options: TokenCacheStoreOptions) -> Result<Self> {
		options.validate()?;

		Ok(Self {
			l2,
			l1: Mutex::new(L1State { entries: LruCache::unbounded(), bytes: 0 }),
			options,
		})
	}

	/// Options the store was built with.
	pub fn options(&self) -> &TokenCacheStoreOptions {
		&self.options
	}

	/// Number of entries currently held in L1 (including not yet purged expired ones).
	pub fn l1_len(&self) -> usize {
		self.l1.lock().entries.len()
	}

	/// Bytes currently accounted to L1.
	pub fn l1_size(&self) -> u64 {
		self.l1.lock().bytes
	}

	/// Drops `key` from L1 only, leaving L2 untouched.
	pub fn evict_l1(&self, key: &str) {
		self.l1.lock().remove(key);
	}

	/// Reads `key`, preferring L1 and back-filling it from L2.
	pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
		let now = OffsetDateTime::now_utc();

		if let Some(value) = self.l1_get(key, now) {
			tracing::trace!(key, "L1 cache hit.");

			return Ok(Some(value));
		}

		let Some(entry) = self.l2_call("read", key, || self.l2.get(key)).await? else {
			return Ok(None);
		};
		let l2_expiry = entry.expires_at.unwrap_or(now + self.options.l1_fallback_ttl);

		self.l1_put(key, entry.value.clone(), self.scaled_expiry(now, l2_expiry));

		Ok(Some(entry.value))
	}

	/// Writes `value` to L2 and then L1; non-positive lifetimes skip the write.
	pub async fn write(&self, key: &str, value: Vec<u8>, expires_at: OffsetDateTime) -> Result<()> {
		let now = OffsetDateTime::now_utc();

		if expires_at <= now {
			tracing::warn!(key, %expires_at, "Skipping token cache write with a non-positive lifetime.");

			return Ok(());
		}

		self.l2_call("write", key, || self.l2.set(key, value.clone(), expires_at)).await?;
		self.l1_put(key, value, self.scaled_expiry(now, expires_at));

		Ok(())
	}

	/// Removes `key` from both tiers.
	pub async fn remove(&self, key: &str) -> Result<()> {
		self.l1.lock().remove(key);
		self.l2_call("remove", key, || self.l2.remove(key)).await?;

		Ok(())
	}

	async fn l2_call<'a, T, F>(&'a self, op: &'static str, key: &str, call: F) -> Result<T, CacheError>
	where
		F: Fn() -> CacheFuture<'a, T>,
	{
		let error = match call().await {
			Ok(value) => return Ok(value),
			Err(e) => e,
		};

		tracing::warn!(op, key, error = %error, "Distributed token cache call failed.");

		let retry = error.is_connectivity()
			&& self.options.on_distributed_cache_failure.as_ref().is_some_and(|callback| callback(&error));

		if !retry {
			return Err(error);
		}

		tracing::info!(op, key, "Retrying distributed token cache call once.");

		call().await
	}

	fn scaled_expiry(&self, now: OffsetDateTime, l2_expiry: OffsetDateTime) -> OffsetDateTime {
		let remaining = l2_expiry - now;

		if remaining <= Duration::ZERO {
			return now;
		}

		(now + remaining * self.options.l1_expiration_ratio).min(l2_expiry)
	}

	fn l1_get(&self, key: &str, now: OffsetDateTime) -> Option<Vec<u8>> {
		if self.options.disable_l1 {
			return None;
		}

		let mut l1 = self.l1.lock();
		let expired = match l1.entries.get(key) {
			Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
			Some(_) => true,
			None => false,
		};

		if expired {
			l1.remove(key);
		}

		None
	}

	fn l1_put(&self, key: &str, value: Vec<u8>, expires_at: OffsetDateTime) {
		if self.options.disable_l1 || expires_at <= OffsetDateTime::now_utc() {
			return;
		}

		let size = entry_size(key, &value);
		let mut l1 = self.l1.lock();

		l1.remove(key);

		if size > self.options.l1_size_limit {
			tracing::debug!(key, size, "Blob exceeds the L1 ceiling; serving it from L2 only.");

			return;
		}

		while l1.bytes + size > self.options.l1_size_limit {
			let Some((evicted_key, evicted)) = l1.entries.pop_lru() else {
				break;
			};

			l1.bytes -= entry_size(&evicted_key, &evicted.value);
		}

		l1.entries.put(key.to_owned(), L1Entry { value, expires_at });
		l1.bytes += size;
	}
}
impl Debug for TokenCacheStore {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenCacheStore")
			.field("l1_len", &self.l1_len())
			.field("l1_size", &self.l1_size())
			.field("options", &self.options)
			.finish()
	}
}

fn entry_size(key: &str, value: &[u8]) -> u64 {
	(key.len() + value.len()) as u64
}
