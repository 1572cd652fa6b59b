//! Thread-safe in-memory [`DistributedCache`] for single-process hosts and tests.

// std
use std::sync::atomic::{AtomicUsize, Ordering};
// self
use crate::{
	_prelude::*,
	store::{CacheFuture, DistributedCache, DistributedEntry},
};

type EntryMap = Arc<RwLock<HashMap<String, DistributedEntry>>>;

/// In-process L2 that honors absolute expiry and counts reads/writes for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct MemoryDistributedCache {
	entries: EntryMap,
	reads: Arc<AtomicUsize>,
	writes: Arc<AtomicUsize>,
}
impl MemoryDistributedCache {
	/// Number of `get` calls served so far.
	pub fn reads(&self) -> usize {
		self.reads.load(Ordering::Relaxed)
	}

	/// Number of `set` calls served so far.
	pub fn writes(&self) -> usize {
		self.writes.load(Ordering::Relaxed)
	}

	/// Number of live entries.
	pub fn len(&self) -> usize {
		let now = OffsetDateTime::now_utc();

		self.entries.read().values().filter(|entry| !is_expired(entry, now)).count()
	}

	/// Returns true when no live entry is stored.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn get_now(&self, key: &str) -> Option<DistributedEntry> {
		let now = OffsetDateTime::now_utc();
		let entry = self.entries.read().get(key).cloned()?;

		if is_expired(&entry, now) {
			self.entries.write().remove(key);

			return None;
		}

		Some(entry)
	}
}
impl DistributedCache for MemoryDistributedCache {
	fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<DistributedEntry>> {
		self.reads.fetch_add(1, Ordering::Relaxed);

		Box::pin(async move { Ok(self.get_now(key)) })
	}

	fn set<'a>(
		&'a self,
		key: &'a str,
		value: Vec<u8>,
		expires_at: OffsetDateTime,
	) -> CacheFuture<'a, ()> {
		self.writes.fetch_add(1, Ordering::Relaxed);

		Box::pin(async move {
			self.entries
				.write()
				.insert(key.to_owned(), DistributedEntry { value, expires_at: Some(expires_at) });

			Ok(())
		})
	}

	fn remove<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
		Box::pin(async move {
			self.entries.write().remove(key);

			Ok(())
		})
	}
}

fn is_expired(entry: &DistributedEntry, now: OffsetDateTime) -> bool {
	entry.expires_at.is_some_and(|expires_at| expires_at <= now)
}
