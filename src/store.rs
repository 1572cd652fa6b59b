//! Token cache storage: the distributed (L2) contract, built-in L2 backends, and the
//! two-tier [`TokenCacheStore`].

pub mod file;
pub mod memory;
pub mod tiered;

pub use file::FileDistributedCache;
pub use memory::MemoryDistributedCache;
pub use tiered::*;

// self
use crate::{
	_prelude::*,
	auth::{ClientId, TenantId},
};

/// Boxed future returned by [`DistributedCache`] operations.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + 'a + Send>>;

/// Durable, shared key-value store used as the system of record for token blobs.
///
/// Values are opaque; implementations must store and return them byte-for-byte.
pub trait DistributedCache
where
	Self: Send + Sync,
{
	/// Fetches the blob stored under `key`, if present and not expired.
	fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<DistributedEntry>>;

	/// Stores (replaces) the blob under `key` until `expires_at`.
	fn set<'a>(
		&'a self,
		key: &'a str,
		value: Vec<u8>,
		expires_at: OffsetDateTime,
	) -> CacheFuture<'a, ()>;

	/// Removes the blob stored under `key`; missing keys are not an error.
	fn remove<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()>;
}

/// Blob returned by [`DistributedCache::get`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedEntry {
	/// Opaque stored bytes.
	pub value: Vec<u8>,
	/// Absolute expiry recorded by the backend, when it tracks one.
	pub expires_at: Option<OffsetDateTime>,
}

/// Failure reported by a [`DistributedCache`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum CacheError {
	/// The backend could not be reached; may be retried once via the failure callback.
	#[error("Connectivity failure: {message}.")]
	Connectivity {
		/// Human-readable error payload.
		message: String,
	},
	/// Stored data is corrupt or cannot be (de)serialized; never retried.
	#[error("Format failure: {message}.")]
	Format {
		/// Human-readable error payload.
		message: String,
	},
}
impl CacheError {
	/// Returns true for connectivity failures.
	pub fn is_connectivity(&self) -> bool {
		matches!(self, Self::Connectivity { .. })
	}
}

/// Kind of token partition a cache key addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKeyKind {
	/// App-only tokens.
	App,
	/// Delegated (user) tokens.
	User,
}

/// Deterministic cache key: `{kind}:{scheme}:{tenant}:{client_id}[:{account}]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
	kind: CacheKeyKind,
	scheme: String,
	tenant: TenantId,
	client_id: ClientId,
	account: Option<String>,
}
impl CacheKey {
	/// Key for the app-only token cache of a client in a tenant.
	pub fn app(scheme: impl Into<String>, tenant: TenantId, client_id: ClientId) -> Self {
		Self { kind: CacheKeyKind::App, scheme: scheme.into(), tenant, client_id, account: None }
	}

	/// Key for the user token cache of one account.
	pub fn user(
		scheme: impl Into<String>,
		tenant: TenantId,
		client_id: ClientId,
		account: impl Into<String>,
	) -> Self {
		Self {
			kind: CacheKeyKind::User,
			scheme: scheme.into(),
			tenant,
			client_id,
			account: Some(account.into()),
		}
	}

	/// Partition kind.
	pub fn kind(&self) -> CacheKeyKind {
		self.kind
	}
}
impl Display for CacheKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let kind = match self.kind {
			CacheKeyKind::App => "app",
			CacheKeyKind::User => "user",
		};

		write!(f, "{kind}:{}:{}:{}", self.scheme, self.tenant, self.client_id)?;

		if let Some(account) = &self.account {
			write!(f, ":{account}")?;
		}

		Ok(())
	}
}
