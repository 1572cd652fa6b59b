//! Explicit construction handle for [`TokenAcquirer`]s, plus an opt-in process-wide default.
//!
//! A factory owns the pieces acquirers share: the HTTP transport, one [`TokenCacheStore`]
//! and one [`CredentialResolver`]. Hosts construct a factory, register application options
//! per authentication scheme, and pass the built acquirer around explicitly. The default
//! instance exists only for hosts that cannot thread a handle through; tests reset it with
//! [`TokenAcquirerFactory::reset_default_instance`].

// self
use crate::{
	_prelude::*,
	credentials::CredentialResolver,
	flows::TokenAcquirer,
	http::TokenHttpClient,
	oauth::TransportErrorMapper,
	options::{ApplicationOptions, DEFAULT_AUTHENTICATION_SCHEME},
	store::{DistributedCache, MemoryDistributedCache, TokenCacheStore, TokenCacheStoreOptions},
};
#[cfg(feature = "reqwest")]
use crate::{http::ReqwestHttpClient, oauth::ReqwestTransportErrorMapper};

#[cfg(feature = "reqwest")]
/// Factory over the crate's default reqwest transport stack.
pub type ReqwestTokenAcquirerFactory = TokenAcquirerFactory<ReqwestHttpClient, ReqwestTransportErrorMapper>;

#[cfg(feature = "reqwest")]
static DEFAULT_INSTANCE: Mutex<Option<Arc<ReqwestTokenAcquirerFactory>>> = parking_lot::const_mutex(None);

type Shared = (Arc<TokenCacheStore>, Arc<CredentialResolver>);

/// Builds acquirers that share one transport, token cache, and credential resolver.
pub struct TokenAcquirerFactory<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	http_client: Arc<C>,
	mapper: Arc<M>,
	distributed_cache: Arc<dyn DistributedCache>,
	cache_options: TokenCacheStoreOptions,
	schemes: BTreeMap<String, ApplicationOptions>,
	resolver: Option<Arc<CredentialResolver>>,
	shared: Mutex<Option<Shared>>,
	built: Mutex<Option<Arc<TokenAcquirer<C, M>>>>,
}
impl<C, M> TokenAcquirerFactory<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Factory over the provided transport; L2 defaults to an in-memory cache.
	pub fn with_http_client(http_client: impl Into<Arc<C>>, mapper: impl Into<Arc<M>>) -> Self {
		Self {
			http_client: http_client.into(),
			mapper: mapper.into(),
			distributed_cache: Arc::new(MemoryDistributedCache::default()),
			cache_options: TokenCacheStoreOptions::default(),
			schemes: BTreeMap::new(),
			resolver: None,
			shared: Mutex::new(None),
			built: Mutex::new(None),
		}
	}

	/// Uses `cache` as the L2 tier.
	pub fn with_distributed_cache(mut self, cache: Arc<dyn DistributedCache>) -> Self {
		self.distributed_cache = cache;

		self
	}

	/// Overrides the token cache options.
	pub fn with_cache_options(mut self, options: TokenCacheStoreOptions) -> Self {
		self.cache_options = options;

		self
	}

	/// Registers the options of an authentication scheme.
	pub fn with_application_options(mut self, scheme: impl Into<String>, options: ApplicationOptions) -> Self {
		self.schemes.insert(scheme.into(), options);

		self
	}

	/// Uses a caller-configured resolver (custom loaders, observers).
	pub fn with_resolver(mut self, resolver: Arc<CredentialResolver>) -> Self {
		self.resolver = Some(resolver);

		self
	}

	/// The acquirer over every registered scheme, built once and then reused.
	///
	/// The `Bearer` scheme is the default; calls naming no scheme use it.
	pub fn build(&self) -> Result<Arc<TokenAcquirer<C, M>>> {
		let mut built = self.built.lock();

		if let Some(acquirer) = built.as_ref() {
			return Ok(acquirer.clone());
		}

		let default = self.schemes.get(DEFAULT_AUTHENTICATION_SCHEME).cloned().unwrap_or_default();
		let acquirer = self
			.schemes
			.iter()
			.fold(self.token_acquirer(default)?, |acquirer, (scheme, options)| {
				acquirer.with_scheme(scheme.clone(), options.clone())
			});
		let acquirer = Arc::new(acquirer);

		tracing::debug!(schemes = self.schemes.len(), "Built token acquirer.");
		*built = Some(acquirer.clone());

		Ok(acquirer)
	}

	/// A standalone acquirer for `options` that shares this factory's cache and resolver.
	pub fn token_acquirer(&self, options: ApplicationOptions) -> Result<TokenAcquirer<C, M>> {
		let (cache, resolver) = self.shared()?;

		Ok(TokenAcquirer::with_http_client(
			options,
			cache,
			resolver,
			self.http_client.clone(),
			self.mapper.clone(),
		))
	}

	fn shared(&self) -> Result<Shared> {
		let mut shared = self.shared.lock();

		if let Some(shared) = shared.as_ref() {
			return Ok(shared.clone());
		}

		let cache = Arc::new(TokenCacheStore::new(self.distributed_cache.clone(), self.cache_options.clone())?);
		let resolver = match &self.resolver {
			Some(resolver) => resolver.clone(),
			None => Arc::new(CredentialResolver::with_http_client(self.http_client.clone(), self.mapper.clone())),
		};
		let value = (cache, resolver);

		*shared = Some(value.clone());

		Ok(value)
	}
}
#[cfg(feature = "reqwest")]
impl TokenAcquirerFactory<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Factory over a fresh reqwest transport.
	pub fn new() -> Result<Self> {
		Ok(Self::with_http_client(ReqwestHttpClient::new()?, ReqwestTransportErrorMapper))
	}

	/// Process-wide factory, created on first use.
	///
	/// Register options on the returned factory's acquirers through
	/// [`token_acquirer`](Self::token_acquirer); the default instance carries no schemes.
	pub fn default_instance() -> Result<Arc<Self>> {
		let mut slot = DEFAULT_INSTANCE.lock();

		if let Some(factory) = slot.as_ref() {
			return Ok(factory.clone());
		}

		let factory = Arc::new(Self::new()?);

		*slot = Some(factory.clone());

		Ok(factory)
	}

	/// Drops the process-wide factory; the next [`default_instance`](Self::default_instance)
	/// call creates a new one with empty caches.
	pub fn reset_default_instance() {
		if DEFAULT_INSTANCE.lock().take().is_some() {
			tracing::info!("Default token acquirer factory reset.");
		}
	}
}
impl<C, M> Debug for TokenAcquirerFactory<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenAcquirerFactory")
			.field("schemes", &self.schemes.keys().collect::<Vec<_>>())
			.field("cache_options", &self.cache_options)
			.field("built", &self.built.lock().is_some())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		_preludet::*,
		auth::{ClientId, ScopeSet, TenantId},
		credentials::CredentialDescriptor,
		options::AcquireTokenOptions,
	};

	fn factory() -> TokenAcquirerFactory<ScriptedHttpClient, ScriptedTransportErrorMapper> {
		TokenAcquirerFactory::with_http_client(ScriptedHttpClient::default(), ScriptedTransportErrorMapper)
	}

	fn options(client: &str) -> ApplicationOptions {
		ApplicationOptions::new(ClientId::new(client).expect("Client id fixture should be valid."))
			.with_tenant(TenantId::new("tenant").expect("Tenant fixture should be valid."))
			.with_credential(CredentialDescriptor::from_client_secret("s3cret"))
	}

	#[test]
	fn build_is_memoized_and_registers_every_scheme() {
		let factory = factory()
			.with_application_options(DEFAULT_AUTHENTICATION_SCHEME, options("api"))
			.with_application_options("Downstream", options("downstream"));
		let first = factory.build().expect("Factory should build.");
		let second = factory.build().expect("Factory should build again.");

		assert!(Arc::ptr_eq(&first, &second));
		assert!(first.application_options("Downstream").is_some());
		assert_eq!(
			first.application_options(DEFAULT_AUTHENTICATION_SCHEME).and_then(|options| options.client_id.clone()),
			Some(ClientId::new("api").expect("Client id fixture should be valid."))
		);
	}

	#[tokio::test]
	async fn acquirers_from_one_factory_share_the_cache() {
		let http = ScriptedHttpClient::default();
		let factory = TokenAcquirerFactory::with_http_client(http.clone(), ScriptedTransportErrorMapper);
		let scopes = ScopeSet::new(["api://downstream/.default"]).expect("Scope fixture should be valid.");

		http.push(ScriptedResponse::token("shared", 3600));

		let first = factory.token_acquirer(options("api")).expect("Acquirer should build.");
		let second = factory.token_acquirer(options("api")).expect("Acquirer should build.");

		first.acquire_token_for_app(&scopes, AcquireTokenOptions::default()).await.expect("First call should succeed.");

		let cached = second
			.acquire_token_for_app(&scopes, AcquireTokenOptions::default())
			.await
			.expect("Second acquirer should read the shared cache.");

		assert_eq!(cached.access_token.expose(), "shared");
		assert_eq!(http.calls(), 1);
		assert!(Arc::ptr_eq(first.cache(), second.cache()));
		assert!(Arc::ptr_eq(first.resolver(), second.resolver()));
	}

	#[test]
	fn invalid_cache_options_fail_the_build() {
		let factory = factory().with_cache_options(TokenCacheStoreOptions::default().with_l1_expiration_ratio(0.));

		assert!(factory.build().is_err());
	}
}
