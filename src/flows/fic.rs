//! Federated identity credential chains for agent identities.
//!
//! An agent identity owns no credential. Its agent application exchanges its own
//! credential for a FIC assertion (`A1`, minted for `fmi_path=<agent identity>`), and the
//! agent identity then authenticates with `A1`. Agent user tokens take one more hop: the
//! agent identity mints its own assertion (`A2`) and presents both in a `user_fic` grant.
//! Hops run in order, are never cached, and stop at the first failure.

// self
use crate::{
	_prelude::*,
	auth::{AcquireTokenResult, ClientId, ScopeSet, TokenSecret},
	error::ConfigError,
	flows::{
		CachedToken, FicHop, TokenAcquirer, base_request, correlation_headers, hop_failure,
	},
	http::TokenHttpClient,
	obs::FlowKind,
	oauth::{TokenRequest, TokenResponse, TransportErrorMapper},
	options::{AcquireTokenOptions, MergedOptions},
	provider::{GrantType, JWT_BEARER_ASSERTION_TYPE},
};

/// Audience scope of FIC assertions.
pub const TOKEN_EXCHANGE_SCOPE: &str = "api://AzureADTokenExchange/.default";

/// Form fields the `user_fic` body must never carry.
const USER_FIC_FORBIDDEN_FIELDS: [&str; 2] = ["password", "client_secret"];

/// Agent user targeted by a `user_fic` grant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentUser {
	/// User principal name.
	Username(String),
	/// Directory object id.
	UserId(String),
}
impl AgentUser {
	/// Agent user named by `options`; the username wins when both are set. Empty values
	/// count as unset.
	pub fn from_options(options: &AcquireTokenOptions) -> Option<Self> {
		let present = |value: &Option<String>| value.clone().filter(|value| !value.is_empty());

		present(&options.username)
			.map(Self::Username)
			.or_else(|| present(&options.user_id).map(Self::UserId))
	}

	/// Account component of the user cache key.
	pub fn account(&self) -> &str {
		match self {
			Self::Username(value) | Self::UserId(value) => value,
		}
	}

	fn apply(&self, form: &mut BTreeMap<String, String>) {
		form.remove("username");
		form.remove("user_id");

		match self {
			Self::Username(username) => form.insert("username".into(), username.clone()),
			Self::UserId(user_id) => form.insert("user_id".into(), user_id.clone()),
		};
	}
}

/// Client credentials request for a FIC assertion, optionally scoped by `fmi_path`.
fn fic_request(merged: &MergedOptions, fmi_path: Option<&str>) -> TokenRequest {
	let request = TokenRequest::new(GrantType::ClientCredentials)
		.with_param("client_id", merged.client_id.to_string())
		.with_param("scope", TOKEN_EXCHANGE_SCOPE)
		.with_query(merged.extra_query_parameters.clone())
		.with_headers(correlation_headers(merged));

	match fmi_path {
		Some(fmi_path) => request.with_param("fmi_path", fmi_path),
		None => request,
	}
}

fn exchange_scopes() -> Result<ScopeSet, ConfigError> {
	Ok(ScopeSet::new([TOKEN_EXCHANGE_SCOPE])?)
}

fn assertion_from(response: TokenResponse) -> Result<TokenSecret> {
	if response.access_token.is_empty() {
		return Err(ConfigError::EmptyAccessToken.into());
	}

	Ok(response.access_token)
}

/// Runs the hops of one agent identity chain for one call.
pub(crate) struct FicChainBuilder<'a, C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	acquirer: &'a TokenAcquirer<C, M>,
	merged: &'a MergedOptions,
	agent_identity: ClientId,
}
impl<'a, C, M> FicChainBuilder<'a, C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	pub(crate) fn new(
		acquirer: &'a TokenAcquirer<C, M>,
		merged: &'a MergedOptions,
		agent_identity: ClientId,
	) -> Self {
		Self { acquirer, merged, agent_identity }
	}

	/// `A1`: the agent application's FIC assertion for the agent identity.
	///
	/// A caller-supplied client assertion replaces this hop.
	pub(crate) async fn agent_application_assertion(&self) -> Result<TokenSecret> {
		if let Some(assertion) = &self.merged.call.client_assertion {
			return Ok(assertion.clone());
		}

		let fmi_path = self.agent_identity.to_string();
		let response = self
			.acquirer
			.request_as_client(self.merged, || Ok(fic_request(self.merged, Some(&fmi_path))))
			.await
			.map_err(hop_failure(FicHop::AgentApplicationFic))?;

		assertion_from(response).map_err(hop_failure(FicHop::AgentApplicationFic))
	}

	/// Target-scoped token of the agent identity, authenticated with `A1`.
	pub(crate) async fn agent_identity_token(
		&self,
		scopes: &ScopeSet,
		claims: Option<&str>,
	) -> Result<CachedToken> {
		let a1 = self.agent_application_assertion().await?;
		let identity = self.merged.as_client(self.agent_identity.clone(), a1);

		tracing::debug!(agent_identity = %self.agent_identity, "Requesting the agent identity token.");

		let response = self
			.acquirer
			.request_as_client(&identity, || {
				base_request(GrantType::ClientCredentials, &identity, Some(scopes), claims)
			})
			.await
			.map_err(hop_failure(FicHop::AgentIdentityToken))?;

		self.acquirer
			.cached_from_response(response, scopes, &identity)
			.map_err(hop_failure(FicHop::AgentIdentityToken))
	}

	/// Agent user token obtained through the `user_fic` grant.
	///
	/// The final body is fixed up right before transmission, after provider augmentation:
	/// it carries `A1` as client assertion, `A2` as user federated identity credential,
	/// exactly one user field, and never a password or client secret.
	pub(crate) async fn agent_user_token(
		&self,
		scopes: &ScopeSet,
		user: &AgentUser,
		claims: Option<&str>,
	) -> Result<CachedToken> {
		let a1 = self.agent_application_assertion().await?;
		let identity = self.merged.as_client(self.agent_identity.clone(), a1.clone());
		let a2 = self
			.acquirer
			.request_as_client(&identity, || Ok(fic_request(&identity, None)))
			.await
			.and_then(assertion_from)
			.map_err(hop_failure(FicHop::AgentIdentityFic))?;
		let request = base_request(GrantType::UserFic, &identity, Some(scopes), claims)
			.map_err(|e| Error::from(e).in_hop(FicHop::AgentUserToken))?;
		let request = match user {
			AgentUser::Username(username) => request.with_param("username", username.as_str()),
			AgentUser::UserId(user_id) => request.with_param("user_id", user_id.as_str()),
		};

		let client_id = self.agent_identity.to_string();
		let user = user.clone();
		let request = request.with_interceptor(Arc::new(move |form: &mut BTreeMap<String, String>| {
			for field in USER_FIC_FORBIDDEN_FIELDS {
				form.remove(field);
			}

			form.insert("client_id".into(), client_id.clone());
			form.insert("client_assertion".into(), a1.expose().to_owned());
			form.insert("client_assertion_type".into(), JWT_BEARER_ASSERTION_TYPE.into());
			form.insert("user_federated_identity_credential".into(), a2.expose().to_owned());
			form.insert("grant_type".into(), GrantType::UserFic.as_str().into());
			user.apply(form);
		}));

		tracing::debug!(agent_identity = %self.agent_identity, "Requesting the agent user token.");

		let response = self
			.acquirer
			.send(&identity, request)
			.await
			.map_err(hop_failure(FicHop::AgentUserToken))?;

		self.acquirer
			.cached_from_response(response, scopes, &identity)
			.map_err(hop_failure(FicHop::AgentUserToken))
	}
}

impl<C, M> TokenAcquirer<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Requests one FIC assertion (`api://AzureADTokenExchange/.default`) without caching it.
	///
	/// `client_assertion`, when provided, authenticates the request instead of the configured
	/// credentials. The `fmi_path` comes from the options, falling back to the agent identity.
	pub async fn get_fic_token(
		&self,
		options: AcquireTokenOptions,
		client_assertion: Option<TokenSecret>,
	) -> Result<AcquireTokenResult> {
		self.observe(FlowKind::FicToken, "get_fic_token", options, |options| {
			self.fic_token(options, client_assertion)
		})
		.await
	}

	async fn fic_token(
		&self,
		options: AcquireTokenOptions,
		client_assertion: Option<TokenSecret>,
	) -> Result<AcquireTokenResult> {
		let mut merged = self.merge(&options)?;

		if let Some(assertion) = client_assertion {
			merged.call.client_assertion = Some(assertion);
		}

		let fmi_path = merged
			.call
			.fmi_path
			.clone()
			.or_else(|| merged.call.agent_identity.as_ref().map(ToString::to_string));
		let response =
			self.request_as_client(&merged, || Ok(fic_request(&merged, fmi_path.as_deref()))).await?;
		let token = self.cached_from_response(response, &exchange_scopes()?, &merged)?;

		Ok(token.result)
	}
}
