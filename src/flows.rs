//! Token acquisition orchestrated by [`TokenAcquirer`].
//!
//! Every call follows the same stages: merge options, read the cache, resolve credentials,
//! execute the grant, write the cache, return. `app` runs client credentials, `user` runs
//! on-behalf-of exchanges, and `fic` chains federated identity credentials for agent
//! identities. `common` holds the cache blob format, request decoration, and the bounded
//! claims and credential-rotation retries all flows share.

pub mod common;
pub mod fic;
pub mod metrics;

mod app;
mod user;

pub use common::*;
pub use fic::*;
pub use metrics::*;

// self
use crate::{
	_prelude::*,
	credentials::CredentialResolver,
	error::ConfigError,
	http::TokenHttpClient,
	oauth::{TokenEndpointClient, TransportErrorMapper},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	options::{AcquireTokenOptions, ApplicationOptions, DEFAULT_AUTHENTICATION_SCHEME, MergedOptions},
	provider::{DefaultProviderStrategy, ProviderStrategy},
	store::TokenCacheStore,
};
#[cfg(feature = "reqwest")]
use crate::{http::ReqwestHttpClient, oauth::ReqwestTransportErrorMapper};

#[cfg(feature = "reqwest")]
/// Acquirer specialized for the crate's default reqwest transport stack.
pub type ReqwestTokenAcquirer = TokenAcquirer<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Hop of a federated identity credential chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FicHop {
	/// Agent application credentials → FIC assertion for the agent identity (`A1`).
	AgentApplicationFic,
	/// Agent identity, authenticated with `A1` → target-scoped token.
	AgentIdentityToken,
	/// Agent identity, authenticated with `A1` → its own FIC assertion (`A2`).
	AgentIdentityFic,
	/// `user_fic` grant presenting `A1` and `A2` → agent user token.
	AgentUserToken,
}
impl FicHop {
	/// Returns a stable label suitable for errors and span fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FicHop::AgentApplicationFic => "agent_application_fic",
			FicHop::AgentIdentityToken => "agent_identity_token",
			FicHop::AgentIdentityFic => "agent_identity_fic",
			FicHop::AgentUserToken => "agent_user_token",
		}
	}

	/// Returns true for the hop that produces the caller's token.
	pub const fn is_final(self) -> bool {
		matches!(self, FicHop::AgentIdentityToken | FicHop::AgentUserToken)
	}
}
impl Display for FicHop {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Entry point for token acquisition.
///
/// The acquirer owns the token endpoint client, the shared [`TokenCacheStore`] and
/// [`CredentialResolver`], and the application options registered per authentication
/// scheme. Stored options are never modified by a call; every call works on a
/// [`MergedOptions`] copy.
pub struct TokenAcquirer<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	endpoint: TokenEndpointClient<C, M>,
	cache: Arc<TokenCacheStore>,
	resolver: Arc<CredentialResolver>,
	schemes: BTreeMap<String, ApplicationOptions>,
	default_scheme: String,
	metrics: Arc<AcquisitionMetrics>,
}
impl<C, M> TokenAcquirer<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates an acquirer that reuses the caller-provided transport + mapper pair.
	///
	/// `options` is registered under [`DEFAULT_AUTHENTICATION_SCHEME`].
	pub fn with_http_client(
		options: ApplicationOptions,
		cache: Arc<TokenCacheStore>,
		resolver: Arc<CredentialResolver>,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
	) -> Self {
		let endpoint = TokenEndpointClient::new(
			http_client.into(),
			mapper.into(),
			Arc::new(DefaultProviderStrategy),
		);

		Self {
			endpoint,
			cache,
			resolver,
			schemes: BTreeMap::from([(DEFAULT_AUTHENTICATION_SCHEME.to_owned(), options)]),
			default_scheme: DEFAULT_AUTHENTICATION_SCHEME.to_owned(),
			metrics: Default::default(),
		}
	}

	/// Registers (or replaces) the options of another authentication scheme.
	pub fn with_scheme(mut self, scheme: impl Into<String>, options: ApplicationOptions) -> Self {
		self.schemes.insert(scheme.into(), options);

		self
	}

	/// Uses `scheme` for calls that do not name one.
	pub fn with_default_scheme(mut self, scheme: impl Into<String>) -> Self {
		self.default_scheme = scheme.into();

		self
	}

	/// Replaces the provider strategy used for request augmentation and error
	/// classification.
	pub fn with_strategy(mut self, strategy: Arc<dyn ProviderStrategy>) -> Self {
		self.endpoint = self.endpoint.with_strategy(strategy);

		self
	}

	/// Stored options of `scheme`.
	pub fn application_options(&self, scheme: &str) -> Option<&ApplicationOptions> {
		self.schemes.get(scheme)
	}

	/// Shared token cache.
	pub fn cache(&self) -> &Arc<TokenCacheStore> {
		&self.cache
	}

	/// Shared credential resolver (subscribe rotation observers here).
	pub fn resolver(&self) -> &Arc<CredentialResolver> {
		&self.resolver
	}

	/// Acquisition counters.
	pub fn metrics(&self) -> &AcquisitionMetrics {
		&self.metrics
	}

	pub(crate) fn merge(&self, options: &AcquireTokenOptions) -> Result<MergedOptions> {
		let scheme = options.authentication_scheme.as_deref().unwrap_or(&self.default_scheme);
		let application = self
			.schemes
			.get(scheme)
			.ok_or_else(|| ConfigError::UnknownScheme { scheme: scheme.to_owned() })?;

		Ok(MergedOptions::merge(scheme, application, options)?)
	}

	/// Runs `flow` inside its span, recording attempt and outcome.
	pub(crate) async fn observe<T, F, Fut>(
		&self,
		kind: FlowKind,
		stage: &'static str,
		mut options: AcquireTokenOptions,
		flow: F,
	) -> Result<T>
	where
		F: FnOnce(AcquireTokenOptions) -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let correlation_id = *options.correlation_id.get_or_insert_with(Uuid::new_v4);
		let span = FlowSpan::new(kind, stage).with_correlation_id(correlation_id);

		obs::record_flow_outcome(kind, FlowOutcome::Attempt);
		self.metrics.record_attempt();

		let result = span.instrument(flow(options)).await;

		match &result {
			Ok(_) => obs::record_flow_outcome(kind, FlowOutcome::Success),
			Err(e) => {
				tracing::warn!(flow = kind.as_str(), %correlation_id, error = %e, "Token acquisition failed.");
				obs::record_flow_outcome(kind, FlowOutcome::Failure);
				self.metrics.record_failure();
			},
		}

		result
	}
}
#[cfg(feature = "reqwest")]
impl TokenAcquirer<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates an acquirer over its own reqwest transport; the resolver's Key Vault and
	/// managed identity loaders share it.
	pub fn new(options: ApplicationOptions, cache: Arc<TokenCacheStore>) -> Result<Self> {
		let http_client = Arc::new(ReqwestHttpClient::new()?);
		let mapper = Arc::new(ReqwestTransportErrorMapper);
		let resolver = CredentialResolver::with_http_client(http_client.clone(), mapper.clone());

		Ok(Self::with_http_client(options, cache, Arc::new(resolver), http_client, mapper))
	}
}
impl<C, M> Clone for TokenAcquirer<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn clone(&self) -> Self {
		Self {
			endpoint: self.endpoint.clone(),
			cache: self.cache.clone(),
			resolver: self.resolver.clone(),
			schemes: self.schemes.clone(),
			default_scheme: self.default_scheme.clone(),
			metrics: self.metrics.clone(),
		}
	}
}
impl<C, M> Debug for TokenAcquirer<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenAcquirer")
			.field("schemes", &self.schemes.keys().collect::<Vec<_>>())
			.field("default_scheme", &self.default_scheme)
			.field("resolver", &self.resolver)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		_preludet::*,
		auth::{ClientId, TenantId},
	};

	#[test]
	fn fic_hops_render_snake_case() {
		assert_eq!(FicHop::AgentApplicationFic.to_string(), "agent_application_fic");
		assert_eq!(
			serde_json::to_string(&FicHop::AgentUserToken).expect("Hop should serialize."),
			"\"agent_user_token\""
		);
		assert!(FicHop::AgentUserToken.is_final());
		assert!(!FicHop::AgentIdentityFic.is_final());
	}

	#[test]
	fn unknown_schemes_fail_before_any_request() {
		let options = ApplicationOptions::new(ClientId::new("app").expect("Client id fixture should be valid."))
			.with_tenant(TenantId::new("tenant").expect("Tenant fixture should be valid."));
		let (acquirer, http, _) = build_scripted_acquirer(options);
		let err = acquirer
			.merge(&AcquireTokenOptions::default().with_authentication_scheme("OpenIdConnect"))
			.expect_err("Unregistered schemes should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::UnknownScheme { .. })));
		assert_eq!(http.calls(), 0);
	}
}
