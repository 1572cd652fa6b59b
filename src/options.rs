//! Application options (bound per authentication scheme) and per-call acquisition options.
//!
//! [`ApplicationOptions`] is plain configuration and deserializes from the host's config
//! source. [`AcquireTokenOptions`] carries per-call overrides. [`MergedOptions`] is the
//! fresh copy a flow works on; merging never writes back into stored configuration.

// self
use crate::{
	_prelude::*,
	auth::{ClientId, TenantId, TokenSecret},
	credentials::CredentialDescriptor,
	error::ConfigError,
	provider::{Authority, DEFAULT_INSTANCE},
};

/// Scheme used when a call does not name one.
pub const DEFAULT_AUTHENTICATION_SCHEME: &str = "Bearer";

/// Confidential client configuration for one authentication scheme.
///
/// ```json
/// {
///   "client_id": "11111111-2222-3333-4444-555555555555",
///   "instance": "https://login.microsoftonline.com/",
///   "tenant_id": "contoso.onmicrosoft.com",
///   "client_credentials": [{ "source_type": "Path", "path": "/etc/broker/app.pem" }]
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationOptions {
	/// Application (client) id.
	pub client_id: Option<ClientId>,
	/// Identity provider instance; defaults to the public cloud.
	pub instance: Option<Url>,
	/// Tenant combined with `instance`.
	pub tenant_id: Option<TenantId>,
	/// Full authority (`{instance}{tenant}`); wins over `instance` + `tenant_id`.
	pub authority: Option<Url>,
	/// Ordered credential list; the first loadable descriptor is used.
	pub client_credentials: Vec<CredentialDescriptor>,
	/// Client capabilities announced through the `xms_cc` claim (for example `cp1`).
	pub client_capabilities: Vec<String>,
	/// Sends the certificate chain (`x5c`) with certificate assertions.
	pub send_x5c: bool,
	/// Query parameters appended to every token request.
	pub extra_query_parameters: BTreeMap<String, String>,
}
impl ApplicationOptions {
	/// Options for `client_id` with nothing else set.
	pub fn new(client_id: ClientId) -> Self {
		Self { client_id: Some(client_id), ..Default::default() }
	}

	/// Sets the instance.
	pub fn with_instance(mut self, instance: Url) -> Self {
		self.instance = Some(instance);

		self
	}

	/// Sets the tenant.
	pub fn with_tenant(mut self, tenant: TenantId) -> Self {
		self.tenant_id = Some(tenant);

		self
	}

	/// Sets the full authority.
	pub fn with_authority(mut self, authority: Url) -> Self {
		self.authority = Some(authority);

		self
	}

	/// Appends a credential to the ordered credential list.
	pub fn with_credential(mut self, descriptor: CredentialDescriptor) -> Self {
		self.client_credentials.push(descriptor);

		self
	}

	/// Replaces the client capabilities.
	pub fn with_client_capabilities<I, S>(mut self, capabilities: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.client_capabilities = capabilities.into_iter().map(Into::into).collect();

		self
	}

	/// Toggles `x5c` on certificate assertions.
	pub fn with_send_x5c(mut self, send_x5c: bool) -> Self {
		self.send_x5c = send_x5c;

		self
	}

	/// Adds a query parameter sent with every token request.
	pub fn with_extra_query_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.extra_query_parameters.insert(name.into(), value.into());

		self
	}

	fn authority(&self, tenant_override: Option<&TenantId>) -> Result<Authority, ConfigError> {
		let authority = match (&self.authority, &self.tenant_id) {
			(Some(authority), _) => Authority::parse(authority)?,
			(None, Some(tenant)) => {
				let instance = match &self.instance {
					Some(instance) => instance.clone(),
					None => Url::parse(DEFAULT_INSTANCE)?,
				};

				Authority::new(instance, tenant.clone())?
			},
			(None, None) => return Err(ConfigError::MissingAuthority),
		};

		Ok(match tenant_override {
			Some(tenant) => authority.with_tenant(tenant.clone()),
			None => authority,
		})
	}
}

/// Per-call acquisition options; every set field overrides the scheme's configuration.
#[derive(Clone, Debug, Default)]
pub struct AcquireTokenOptions {
	/// Tenant override.
	pub tenant: Option<TenantId>,
	/// Authentication scheme whose [`ApplicationOptions`] apply.
	pub authentication_scheme: Option<String>,
	/// Correlation id sent as `client-request-id`; generated when absent.
	pub correlation_id: Option<Uuid>,
	/// Extra token endpoint query parameters.
	pub extra_query_parameters: BTreeMap<String, String>,
	/// Extra token request headers.
	pub extra_headers: BTreeMap<String, String>,
	/// Claims challenge to satisfy.
	pub claims: Option<String>,
	/// Skips the cache read. The cached entry stays in place.
	pub force_refresh: bool,
	/// Proof-of-possession key (`req_cnf`); requests a `pop` token.
	pub pop_public_key: Option<String>,
	/// Long-running on-behalf-of session key.
	pub long_running_session_key: Option<String>,
	/// `fmi_path` sent with federated credential requests.
	pub fmi_path: Option<String>,
	/// Agent identity to act as; switches app and user calls to the FIC chains.
	pub agent_identity: Option<ClientId>,
	/// Agent user principal name.
	pub username: Option<String>,
	/// Agent user object id.
	pub user_id: Option<String>,
	/// Client assertion used instead of the configured credentials.
	pub client_assertion: Option<TokenSecret>,
	/// Cancels the call.
	pub cancellation: Option<CancellationToken>,
}
impl AcquireTokenOptions {
	/// Overrides the tenant.
	pub fn with_tenant(mut self, tenant: TenantId) -> Self {
		self.tenant = Some(tenant);

		self
	}

	/// Selects the authentication scheme.
	pub fn with_authentication_scheme(mut self, scheme: impl Into<String>) -> Self {
		self.authentication_scheme = Some(scheme.into());

		self
	}

	/// Sets the correlation id.
	pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
		self.correlation_id = Some(correlation_id);

		self
	}

	/// Adds a token endpoint query parameter.
	pub fn with_extra_query_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.extra_query_parameters.insert(name.into(), value.into());

		self
	}

	/// Adds a token request header.
	pub fn with_extra_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.extra_headers.insert(name.into(), value.into());

		self
	}

	/// Sets the claims challenge.
	pub fn with_claims(mut self, claims: impl Into<String>) -> Self {
		self.claims = Some(claims.into());

		self
	}

	/// Bypasses the cache read.
	pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
		self.force_refresh = force_refresh;

		self
	}

	/// Requests a proof-of-possession token bound to `key`.
	pub fn with_pop_public_key(mut self, key: impl Into<String>) -> Self {
		self.pop_public_key = Some(key.into());

		self
	}

	/// Keys the on-behalf-of cache entry by a long-running session.
	pub fn with_long_running_session_key(mut self, key: impl Into<String>) -> Self {
		self.long_running_session_key = Some(key.into());

		self
	}

	/// Sets the `fmi_path` for federated credential requests.
	pub fn with_fmi_path(mut self, fmi_path: impl Into<String>) -> Self {
		self.fmi_path = Some(fmi_path.into());

		self
	}

	/// Acts as `agent_identity`.
	pub fn with_agent_identity(mut self, agent_identity: ClientId) -> Self {
		self.agent_identity = Some(agent_identity);

		self
	}

	/// Targets the agent user with principal name `username`.
	pub fn with_username(mut self, username: impl Into<String>) -> Self {
		self.username = Some(username.into());

		self
	}

	/// Targets the agent user with object id `user_id`.
	pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());

		self
	}

	/// Authenticates with `assertion` instead of the configured credentials.
	pub fn with_client_assertion(mut self, assertion: impl Into<String>) -> Self {
		self.client_assertion = Some(TokenSecret::new(assertion));

		self
	}

	/// Cancels the call when `token` fires.
	pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
		self.cancellation = Some(token);

		self
	}
}

/// Effective options for one call: a copy of the scheme's configuration with the call's
/// overrides applied.
#[derive(Clone, Debug)]
pub struct MergedOptions {
	/// Effective authentication scheme.
	pub scheme: String,
	/// Client id.
	pub client_id: ClientId,
	/// Authority after the tenant override.
	pub authority: Authority,
	/// Credential list (clones share resolution state with the configuration).
	pub credentials: Vec<CredentialDescriptor>,
	/// Client capabilities.
	pub client_capabilities: Vec<String>,
	/// Whether certificate assertions carry `x5c`.
	pub send_x5c: bool,
	/// Configured query parameters overlaid with the call's.
	pub extra_query_parameters: BTreeMap<String, String>,
	/// Correlation id of the call.
	pub correlation_id: Uuid,
	/// Cancellation token of the call (a fresh, never-cancelled token when absent).
	pub cancel: CancellationToken,
	/// The call's own options.
	pub call: AcquireTokenOptions,
}
impl MergedOptions {
	/// Merges `call` over `application`, failing fast on missing client id or authority.
	pub fn merge(
		scheme: &str,
		application: &ApplicationOptions,
		call: &AcquireTokenOptions,
	) -> Result<Self, ConfigError> {
		let application = application.clone();
		let call = call.clone();
		let client_id = application.client_id.clone().ok_or(ConfigError::MissingClientId)?;
		let authority = application.authority(call.tenant.as_ref())?;
		let mut extra_query_parameters = application.extra_query_parameters;

		extra_query_parameters.extend(call.extra_query_parameters.clone());

		Ok(Self {
			scheme: scheme.to_owned(),
			client_id,
			authority,
			credentials: application.client_credentials,
			client_capabilities: application.client_capabilities,
			send_x5c: application.send_x5c,
			extra_query_parameters,
			correlation_id: call.correlation_id.unwrap_or_else(Uuid::new_v4),
			cancel: call.cancellation.clone().unwrap_or_default(),
			call,
		})
	}

	/// Tenant the call targets.
	pub fn tenant(&self) -> &TenantId {
		self.authority.tenant()
	}

	/// Token endpoint of the effective authority.
	pub fn token_endpoint(&self) -> Result<Url, ConfigError> {
		Ok(self.authority.token_endpoint()?)
	}

	/// Credential-list key used for selection tracking and resets.
	pub fn credential_list_key(&self) -> String {
		format!("{}:{}", self.scheme, self.client_id)
	}

	/// Same options acting as `client_id` with only `assertion` as credential.
	///
	/// Used for the hops a FIC chain performs as the agent identity.
	pub fn as_client(&self, client_id: ClientId, assertion: TokenSecret) -> Self {
		let mut merged = self.clone();

		merged.client_id = client_id;
		merged.credentials = Vec::new();
		merged.call.client_assertion = Some(assertion);

		merged
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn client() -> ClientId {
		ClientId::new("app").expect("Client id fixture should be valid.")
	}

	fn tenant(value: &str) -> TenantId {
		TenantId::new(value).expect("Tenant fixture should be valid.")
	}

	#[test]
	fn merge_requires_client_id_and_authority() {
		let call = AcquireTokenOptions::default();
		let missing_client = ApplicationOptions::default().with_tenant(tenant("t"));

		assert!(matches!(
			MergedOptions::merge("Bearer", &missing_client, &call),
			Err(ConfigError::MissingClientId)
		));
		assert!(matches!(
			MergedOptions::merge("Bearer", &ApplicationOptions::new(client()), &call),
			Err(ConfigError::MissingAuthority)
		));
	}

	#[test]
	fn call_overrides_win_without_touching_configuration() {
		let application = ApplicationOptions::new(client())
			.with_tenant(tenant("configured"))
			.with_extra_query_parameter("dc", "configured")
			.with_extra_query_parameter("slice", "configured");
		let call = AcquireTokenOptions::default()
			.with_tenant(tenant("override"))
			.with_extra_query_parameter("dc", "call");
		let merged = MergedOptions::merge("Bearer", &application, &call).expect("Options should merge.");

		assert_eq!(merged.tenant().as_ref(), "override");
		assert_eq!(merged.extra_query_parameters.get("dc").map(String::as_str), Some("call"));
		assert_eq!(merged.extra_query_parameters.get("slice").map(String::as_str), Some("configured"));
		assert_eq!(application.tenant_id, Some(tenant("configured")));
		assert_eq!(application.extra_query_parameters.get("dc").map(String::as_str), Some("configured"));
		assert_eq!(
			merged.token_endpoint().expect("Endpoint should derive.").as_str(),
			"https://login.microsoftonline.com/override/oauth2/v2.0/token"
		);
	}

	#[test]
	fn authority_wins_over_instance_and_tenant() {
		let application = ApplicationOptions::new(client())
			.with_tenant(tenant("ignored"))
			.with_authority(Url::parse("https://login.example.com/tenant-a").expect("Authority should parse."));
		let merged = MergedOptions::merge("Bearer", &application, &AcquireTokenOptions::default())
			.expect("Options should merge.");

		assert_eq!(merged.authority.to_string(), "https://login.example.com/tenant-a");
		assert_eq!(merged.credential_list_key(), "Bearer:app");
	}

	#[test]
	fn application_options_deserialize_credentials() {
		let options = serde_json::from_str::<ApplicationOptions>(
			r#"{
				"client_id": "app",
				"tenant_id": "contoso.onmicrosoft.com",
				"client_capabilities": ["cp1"],
				"client_credentials": [
					{ "source_type": "ClientSecret", "secret": "s3cret" },
					{ "source_type": "KeyVault", "vault_url": "https://vault.example/", "certificate_name": "app-cert" }
				]
			}"#,
		)
		.expect("Options should deserialize.");

		assert_eq!(options.client_credentials.len(), 2);
		assert_eq!(options.client_capabilities, vec!["cp1".to_owned()]);
		assert!(!options.send_x5c);
	}
}
