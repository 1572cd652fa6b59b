//! Managed identity (IMDS) tokens used as client assertions and Key Vault bearer tokens.

// crates.io
use oauth2::http::{Method, Request};
// self
use crate::{
	_prelude::*,
	auth::TokenSecret,
	credentials::{
		CredentialDescriptor, CredentialSource, CredentialSourceLoader, LoadError, LoadFuture,
		LoaderParameters, ResolvedCredential, SignedAssertion, loaders::certificate::unsupported,
	},
	http::TokenHttpClient,
	oauth::{self, TransportErrorMapper},
};

/// Instance Metadata Service token endpoint.
pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
/// Audience of managed identity tokens used as federated client assertions.
pub const TOKEN_EXCHANGE_RESOURCE: &str = "api://AzureADTokenExchange";

const IMDS_API_VERSION: &str = "2018-02-01";

#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
	access_token: String,
	#[serde(default)]
	expires_on: Option<serde_json::Value>,
}

/// Minimal IMDS client.
pub struct ManagedIdentityClient<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	http_client: Arc<C>,
	error_mapper: Arc<M>,
	endpoint: Option<Url>,
}
impl<C, M> ManagedIdentityClient<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Client that talks to [`IMDS_TOKEN_ENDPOINT`].
	pub fn new(http_client: Arc<C>, error_mapper: Arc<M>) -> Self {
		Self { http_client, error_mapper, endpoint: None }
	}

	/// Overrides the token endpoint (sidecars, tests).
	pub fn with_endpoint(mut self, endpoint: Url) -> Self {
		self.endpoint = Some(endpoint);

		self
	}

	/// Requests a token for `resource`, as the user-assigned identity `client_id` when set.
	pub async fn token(&self, resource: &str, client_id: Option<&str>) -> Result<SignedAssertion, LoadError> {
		let mut url = match &self.endpoint {
			Some(endpoint) => endpoint.clone(),
			None => Url::parse(IMDS_TOKEN_ENDPOINT)
				.map_err(|e| LoadError::malformed(format!("IMDS endpoint is invalid: {e}")))?,
		};

		url.query_pairs_mut()
			.append_pair("api-version", IMDS_API_VERSION)
			.append_pair("resource", resource);

		if let Some(client_id) = client_id {
			url.query_pairs_mut().append_pair("client_id", client_id);
		}

		let request = Request::builder()
			.method(Method::GET)
			.uri(url.as_str())
			.header("Metadata", "true")
			.body(Vec::new())
			.map_err(|e| LoadError::malformed(format!("IMDS request is invalid: {e}")))?;
		let (response, _) = oauth::dispatch(self.http_client.as_ref(), self.error_mapper.as_ref(), request)
			.await
			.map_err(|e| LoadError::network(e.to_string()))?;
		let status = response.status().as_u16();

		if status == 400 {
			return Err(LoadError::not_found(format!(
				"Managed identity is not available: {}",
				String::from_utf8_lossy(response.body())
			)));
		}
		if !response.status().is_success() {
			return Err(LoadError::from_status(status, String::from_utf8_lossy(response.body())));
		}

		let body = serde_json::from_slice::<ImdsTokenResponse>(response.body())
			.map_err(|e| LoadError::malformed(format!("IMDS response is invalid: {e}")))?;
		let expires_at = body.expires_on.as_ref().and_then(parse_epoch);

		if body.access_token.is_empty() {
			return Err(LoadError::malformed("IMDS returned an empty token"));
		}

		Ok(match expires_at {
			Some(expires_at) => SignedAssertion::with_expiry(body.access_token, expires_at),
			None => SignedAssertion::new(body.access_token),
		})
	}
}
impl<C, M> Clone for ManagedIdentityClient<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn clone(&self) -> Self {
		Self {
			http_client: self.http_client.clone(),
			error_mapper: self.error_mapper.clone(),
			endpoint: self.endpoint.clone(),
		}
	}
}

/// Loads [`CredentialSource::SignedAssertionFromManagedIdentity`] assertions.
pub struct ManagedIdentityAssertionLoader<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	client: ManagedIdentityClient<C, M>,
}
impl<C, M> ManagedIdentityAssertionLoader<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Loader over `client`.
	pub fn new(client: ManagedIdentityClient<C, M>) -> Self {
		Self { client }
	}
}
impl<C, M> CredentialSourceLoader for ManagedIdentityAssertionLoader<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn load<'a>(
		&'a self,
		descriptor: &'a CredentialDescriptor,
		_: &'a LoaderParameters,
	) -> LoadFuture<'a, ResolvedCredential> {
		Box::pin(async move {
			let CredentialSource::SignedAssertionFromManagedIdentity { managed_identity_client_id } =
				descriptor.source()
			else {
				return Err(unsupported(descriptor, "ManagedIdentityAssertionLoader"));
			};
			let assertion = self
				.client
				.token(TOKEN_EXCHANGE_RESOURCE, managed_identity_client_id.as_deref())
				.await?;

			Ok(ResolvedCredential::SignedAssertion(assertion))
		})
	}
}

/// Bearer token source for Key Vault requests.
pub trait VaultTokenSource
where
	Self: Send + Sync,
{
	/// Token accepted by the vault at `vault_url`.
	fn vault_token<'a>(&'a self, vault_url: &'a Url) -> LoadFuture<'a, TokenSecret>;
}

/// [`VaultTokenSource`] backed by a managed identity.
pub struct ManagedIdentityVaultTokenSource<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	client: ManagedIdentityClient<C, M>,
	client_id: Option<String>,
}
impl<C, M> ManagedIdentityVaultTokenSource<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// System-assigned identity source.
	pub fn new(client: ManagedIdentityClient<C, M>) -> Self {
		Self { client, client_id: None }
	}

	/// Uses the user-assigned identity `client_id`.
	pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
		self.client_id = Some(client_id.into());

		self
	}
}
impl<C, M> VaultTokenSource for ManagedIdentityVaultTokenSource<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn vault_token<'a>(&'a self, vault_url: &'a Url) -> LoadFuture<'a, TokenSecret> {
		Box::pin(async move {
			// Vault tokens are scoped to the service, not to the individual vault.
			let resource = match vault_url.host_str() {
				Some(host) if host.ends_with(".vault.azure.cn") => "https://vault.azure.cn",
				Some(host) if host.ends_with(".vault.usgovcloudapi.net") => "https://vault.usgovcloudapi.net",
				_ => "https://vault.azure.net",
			};
			let token = self.client.token(resource, self.client_id.as_deref()).await?;

			Ok(token.token)
		})
	}
}

fn parse_epoch(value: &serde_json::Value) -> Option<OffsetDateTime> {
	let seconds = match value {
		serde_json::Value::Number(number) => number.as_i64()?,
		serde_json::Value::String(text) => text.trim().parse().ok()?,
		_ => return None,
	};

	OffsetDateTime::from_unix_timestamp(seconds).ok()
}
