//! File-backed [`DistributedCache`] that lets several processes on one host share blobs.

// std
use std::{
	fs::{self, File},
	io::Write,
	path::{Path, PathBuf},
};
// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD};
// self
use crate::{
	_prelude::*,
	store::{CacheError, CacheFuture, DistributedCache, DistributedEntry},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FileEntry {
	key: String,
	value: String,
	expires_at: OffsetDateTime,
}

/// Persists blobs to a JSON snapshot after each mutation.
///
/// Reads are served from the in-memory snapshot loaded at [`open`](Self::open). I/O errors
/// surface as [`CacheError::Connectivity`]; corrupt snapshots as [`CacheError::Format`].
#[derive(Clone, Debug)]
pub struct FileDistributedCache {
	path: PathBuf,
	inner: Arc<RwLock<HashMap<String, DistributedEntry>>>,
}
impl FileDistributedCache {
	/// Opens (or creates) a cache at the provided path, eagerly loading existing data.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
		let path = path.into();

		ensure_parent_exists(&path)?;

		let snapshot = load_snapshot(&path)?;

		Ok(Self { path, inner: Arc::new(RwLock::new(snapshot)) })
	}

	fn persist_locked(&self, contents: &HashMap<String, DistributedEntry>) -> Result<(), CacheError> {
		ensure_parent_exists(&self.path)?;

		let now = OffsetDateTime::now_utc();
		let snapshot = contents
			.iter()
			.filter_map(|(key, entry)| {
				let expires_at = entry.expires_at.filter(|expires_at| *expires_at > now)?;

				Some(FileEntry { key: key.clone(), value: STANDARD.encode(&entry.value), expires_at })
			})
			.collect::<Vec<_>>();
		let serialized = serde_json::to_vec_pretty(&snapshot)
			.map_err(|e| CacheError::Format { message: format!("Failed to serialize snapshot: {e}") })?;
		let mut tmp_path = self.path.clone();

		tmp_path.set_extension("tmp");

		{
			let mut file = File::create(&tmp_path).map_err(|e| io_failure("create", &tmp_path, e))?;

			file.write_all(&serialized).map_err(|e| io_failure("write", &tmp_path, e))?;
			file.sync_all().map_err(|e| io_failure("sync", &tmp_path, e))?;
		}

		fs::rename(&tmp_path, &self.path).map_err(|e| io_failure("replace", &self.path, e))
	}
}
impl DistributedCache for FileDistributedCache {
	fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<DistributedEntry>> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();

			Ok(self
				.inner
				.read()
				.get(key)
				.filter(|entry| entry.expires_at.is_none_or(|expires_at| expires_at > now))
				.cloned())
		})
	}

	fn set<'a>(
		&'a self,
		key: &'a str,
		value: Vec<u8>,
		expires_at: OffsetDateTime,
	) -> CacheFuture<'a, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			guard.insert(key.to_owned(), DistributedEntry { value, expires_at: Some(expires_at) });
			self.persist_locked(&guard)
		})
	}

	fn remove<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			if guard.remove(key).is_some() {
				self.persist_locked(&guard)?;
			}

			Ok(())
		})
	}
}

fn load_snapshot(path: &Path) -> Result<HashMap<String, DistributedEntry>, CacheError> {
	if !path.exists() {
		return Ok(HashMap::new());
	}

	let bytes = fs::read(path).map_err(|e| io_failure("read", path, e))?;

	if bytes.is_empty() {
		return Ok(HashMap::new());
	}

	let entries: Vec<FileEntry> = serde_json::from_slice(&bytes).map_err(|e| CacheError::Format {
		message: format!("Failed to parse {}: {e}", path.display()),
	})?;

	entries
		.into_iter()
		.map(|entry| {
			let value = STANDARD.decode(entry.value.as_bytes()).map_err(|e| CacheError::Format {
				message: format!("Entry `{}` in {} is not base64: {e}", entry.key, path.display()),
			})?;

			Ok((entry.key, DistributedEntry { value, expires_at: Some(entry.expires_at) }))
		})
		.collect()
}

fn ensure_parent_exists(path: &Path) -> Result<(), CacheError> {
	if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
		fs::create_dir_all(parent).map_err(|e| io_failure("create directory", parent, e))?;
	}

	Ok(())
}

fn io_failure(action: &str, path: &Path, e: std::io::Error) -> CacheError {
	CacheError::Connectivity { message: format!("Failed to {action} {}: {e}", path.display()) }
}
