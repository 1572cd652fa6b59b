//! In-process acquisition counters.

// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters shared by clones of one acquirer.
#[derive(Debug, Default)]
pub struct AcquisitionMetrics {
	attempts: AtomicU64,
	cache_hits: AtomicU64,
	token_requests: AtomicU64,
	claims_retries: AtomicU64,
	credential_resets: AtomicU64,
	failures: AtomicU64,
}
impl AcquisitionMetrics {
	/// Public acquisition calls.
	pub fn attempts(&self) -> u64 {
		self.attempts.load(Ordering::Relaxed)
	}

	/// Calls answered from the token cache.
	pub fn cache_hits(&self) -> u64 {
		self.cache_hits.load(Ordering::Relaxed)
	}

	/// Requests sent to the token endpoint (FIC hops included).
	pub fn token_requests(&self) -> u64 {
		self.token_requests.load(Ordering::Relaxed)
	}

	/// Automatic retries triggered by claims challenges.
	pub fn claims_retries(&self) -> u64 {
		self.claims_retries.load(Ordering::Relaxed)
	}

	/// Credential list resets triggered by stale-credential rejections.
	pub fn credential_resets(&self) -> u64 {
		self.credential_resets.load(Ordering::Relaxed)
	}

	/// Calls that returned an error.
	pub fn failures(&self) -> u64 {
		self.failures.load(Ordering::Relaxed)
	}

	pub(crate) fn record_attempt(&self) {
		self.attempts.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_cache_hit(&self) {
		self.cache_hits.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_token_request(&self) {
		self.token_requests.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_claims_retry(&self) {
		self.claims_retries.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_credential_reset(&self) {
		self.credential_resets.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_failure(&self) {
		self.failures.fetch_add(1, Ordering::Relaxed);
	}
}
