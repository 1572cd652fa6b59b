// self
use crate::{
	_prelude::*,
	auth::{AcquireTokenResult, ScopeSet, UserPrincipal},
	error::{ConfigError, cancellable},
	flows::{AgentUser, FicChainBuilder, TokenAcquirer, base_request, bypasses_cache, token_slot},
	http::TokenHttpClient,
	obs::FlowKind,
	oauth::TransportErrorMapper,
	options::{AcquireTokenOptions, MergedOptions},
	provider::GrantType,
	store::CacheKey,
};

const OFFLINE_ACCESS: &str = "offline_access";

impl<C, M> TokenAcquirer<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Acquires a delegated token for `principal`.
	///
	/// Without an agent identity this is an on-behalf-of exchange of the principal's inbound
	/// assertion. A long-running session key keys the cache by session instead of by
	/// assertion and keeps the session's refresh token, so later calls may omit the
	/// assertion. With an agent identity (plus `username` or `user_id`) the token comes from
	/// the agent user FIC chain.
	pub async fn acquire_token_for_user(
		&self,
		scopes: &ScopeSet,
		options: AcquireTokenOptions,
		principal: &UserPrincipal,
	) -> Result<AcquireTokenResult> {
		let kind = match options.agent_identity {
			Some(_) => FlowKind::AgentUser,
			None => FlowKind::OnBehalfOf,
		};

		self.observe(kind, "acquire_token_for_user", options, |options| async move {
			let merged = self.merge(&options)?;
			let scopes = scopes.without_reserved();

			if scopes.is_empty() {
				return Err(ConfigError::MissingScopes.into());
			}

			let key = user_cache_key(&merged, principal)?;
			let slot = token_slot(&scopes, merged.call.pop_public_key.as_deref());

			self.with_claims_retry(&merged, |claims| self.user_attempt(&merged, &scopes, principal, &key, &slot, claims))
				.await
		})
		.await
	}

	/// Signs `principal` out: removes its user token cache entry from both tiers.
	pub async fn remove_account(&self, principal: &UserPrincipal, options: AcquireTokenOptions) -> Result<()> {
		let merged = self.merge(&options)?;
		let key = user_cache_key(&merged, principal)?;

		tracing::info!(key, "Removing account.");

		cancellable(&merged.cancel, self.cache.remove(&key)).await
	}

	async fn user_attempt(
		&self,
		merged: &MergedOptions,
		scopes: &ScopeSet,
		principal: &UserPrincipal,
		key: &str,
		slot: &str,
		claims: Option<String>,
	) -> Result<AcquireTokenResult> {
		let claims = claims.as_deref();
		let bypass = bypasses_cache(merged, claims);

		if let Some(agent_identity) = &merged.call.agent_identity {
			if !bypass && let Some(hit) = self.cache_hit(key, slot, merged).await? {
				return Ok(hit);
			}

			let user = AgentUser::from_options(&merged.call).ok_or(ConfigError::MissingAgentUser)?;
			let token = FicChainBuilder::new(self, merged, agent_identity.clone())
				.agent_user_token(scopes, &user, claims)
				.await?;

			self.store_token(key, slot, token.clone(), merged).await?;

			return Ok(token.result);
		}

		let session = merged.call.long_running_session_key.as_deref();
		// Sessions read the entry even when bypassing: it holds the refresh token.
		let cached = match (session, bypass) {
			(None, true) => None,
			_ => self.cached_token(key, slot, merged).await?,
		};

		if !bypass && let Some(cached) = cached.as_ref().filter(|cached| cached.result.is_fresh()) {
			tracing::debug!(key, "Token cache hit.");
			self.metrics.record_cache_hit();

			return Ok(cached.result.clone());
		}

		let previous_refresh = cached.and_then(|cached| cached.refresh_token);
		let requested = match session {
			Some(_) => ScopeSet::new(scopes.iter().chain([OFFLINE_ACCESS])).map_err(ConfigError::from)?,
			None => scopes.clone(),
		};
		let response = match (&principal.assertion, session, &previous_refresh) {
			(Some(assertion), _, _) =>
				self.request_as_client(merged, || {
					Ok(base_request(GrantType::OnBehalfOf, merged, Some(&requested), claims)?
						.with_param("assertion", assertion.expose())
						.with_param("requested_token_use", "on_behalf_of"))
				})
				.await?,
			(None, Some(_), Some(refresh_token)) =>
				self.request_as_client(merged, || {
					Ok(base_request(GrantType::RefreshToken, merged, Some(&requested), claims)?
						.with_param("refresh_token", refresh_token.expose()))
				})
				.await?,
			(None, Some(session), None) =>
				return Err(ConfigError::SessionNotFound { session: session.to_owned() }.into()),
			(None, None, _) => return Err(ConfigError::MissingUserAssertion.into()),
		};
		let mut token = self.cached_from_response(response, scopes, merged)?;

		token.refresh_token = match session {
			Some(_) => token.refresh_token.or(previous_refresh),
			None => None,
		};

		self.store_token(key, slot, token.clone(), merged).await?;

		Ok(token.result)
	}
}

/// User cache key: agent users by username or object id; on-behalf-of users by session key,
/// then home account, then assertion fingerprint.
fn user_cache_key(merged: &MergedOptions, principal: &UserPrincipal) -> Result<String, ConfigError> {
	if let Some(agent_identity) = &merged.call.agent_identity {
		let user = AgentUser::from_options(&merged.call).ok_or(ConfigError::MissingAgentUser)?;

		return Ok(CacheKey::user(&merged.scheme, merged.tenant().clone(), agent_identity.clone(), user.account())
			.to_string());
	}

	let account = merged
		.call
		.long_running_session_key
		.clone()
		.or_else(|| principal.home_account_id())
		.or_else(|| principal.assertion_fingerprint())
		.ok_or(ConfigError::MissingUserAssertion)?;

	Ok(CacheKey::user(&merged.scheme, merged.tenant().clone(), merged.client_id.clone(), account).to_string())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		_preludet::*,
		auth::{ClientId, TenantId},
		credentials::CredentialDescriptor,
		options::ApplicationOptions,
	};

	fn options() -> ApplicationOptions {
		ApplicationOptions::new(ClientId::new("api").expect("Client id fixture should be valid."))
			.with_tenant(TenantId::new("tenant").expect("Tenant fixture should be valid."))
			.with_credential(CredentialDescriptor::from_client_secret("s3cret"))
	}

	fn scopes() -> ScopeSet {
		ScopeSet::new(["https://graph.microsoft.com/User.Read"]).expect("Scope fixture should be valid.")
	}

	fn session_token(access_token: &str, refresh_token: &str) -> ScriptedResponse {
		ScriptedResponse::json(
			200,
			serde_json::json!({
				"token_type": "Bearer",
				"access_token": access_token,
				"refresh_token": refresh_token,
				"expires_in": 3600,
			})
			.to_string(),
		)
	}

	#[tokio::test]
	async fn on_behalf_of_sends_the_inbound_assertion() {
		let (acquirer, http, _) = build_scripted_acquirer(options());
		let principal = UserPrincipal::from_assertion("inbound.jwt");

		http.push(ScriptedResponse::token("obo", 3600));

		let result = acquirer
			.acquire_token_for_user(&scopes(), Default::default(), &principal)
			.await
			.expect("On-behalf-of should succeed.");
		let cached = acquirer
			.acquire_token_for_user(&scopes(), Default::default(), &principal)
			.await
			.expect("Second call should hit the cache.");
		let form = &http.requests()[0].form;

		assert_eq!(result, cached);
		assert_eq!(http.calls(), 1);
		assert_eq!(form.get("grant_type").map(String::as_str), Some(GrantType::OnBehalfOf.as_str()));
		assert_eq!(form.get("assertion").map(String::as_str), Some("inbound.jwt"));
		assert_eq!(form.get("requested_token_use").map(String::as_str), Some("on_behalf_of"));
		assert_eq!(form.get("client_secret").map(String::as_str), Some("s3cret"));
	}

	#[tokio::test]
	async fn principals_without_assertion_or_session_are_rejected() {
		let (acquirer, http, _) = build_scripted_acquirer(options());
		let err = acquirer
			.acquire_token_for_user(&scopes(), Default::default(), &UserPrincipal::default())
			.await
			.expect_err("Anonymous principals should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::MissingUserAssertion)));
		assert_eq!(http.calls(), 0);
	}

	#[tokio::test]
	async fn long_running_sessions_refresh_without_the_assertion() {
		let (acquirer, http, _) = build_scripted_acquirer(options());
		let session = || AcquireTokenOptions::default().with_long_running_session_key("session-1");

		http.push(session_token("first", "rt-1")).push(session_token("second", "rt-2"));

		acquirer
			.acquire_token_for_user(&scopes(), session(), &UserPrincipal::from_assertion("inbound.jwt"))
			.await
			.expect("Session should start from the assertion.");

		let refreshed = acquirer
			.acquire_token_for_user(&scopes(), session().with_force_refresh(true), &UserPrincipal::default())
			.await
			.expect("Session should refresh without the assertion.");
		let requests = http.requests();

		assert_eq!(refreshed.access_token.expose(), "second");
		assert!(requests[0].form.get("scope").is_some_and(|scope| scope.contains(OFFLINE_ACCESS)));
		assert_eq!(requests[1].form.get("grant_type").map(String::as_str), Some("refresh_token"));
		assert_eq!(requests[1].form.get("refresh_token").map(String::as_str), Some("rt-1"));

		let err = acquirer
			.acquire_token_for_user(
				&scopes(),
				AcquireTokenOptions::default().with_long_running_session_key("unknown"),
				&UserPrincipal::default(),
			)
			.await
			.expect_err("Unknown sessions should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::SessionNotFound { .. })));
		assert_eq!(http.calls(), 2);
	}

	#[tokio::test]
	async fn remove_account_evicts_the_user_entry() {
		let (acquirer, http, l2) = build_scripted_acquirer(options());
		let tenant = TenantId::new("home").expect("Tenant fixture should be valid.");
		let principal = UserPrincipal::from_assertion("inbound.jwt").with_home_account("oid", tenant);

		http.always(ScriptedResponse::token("obo", 3600));

		acquirer
			.acquire_token_for_user(&scopes(), Default::default(), &principal)
			.await
			.expect("On-behalf-of should succeed.");

		assert_eq!(l2.len(), 1);

		acquirer.remove_account(&principal, Default::default()).await.expect("Sign-out should succeed.");

		assert_eq!(l2.len(), 0);
		assert_eq!(acquirer.cache().l1_len(), 0);

		acquirer
			.acquire_token_for_user(&scopes(), Default::default(), &principal)
			.await
			.expect("Signed-out users should reacquire.");

		assert_eq!(http.calls(), 2);
	}

	#[tokio::test]
	async fn agent_users_require_a_user_field() {
		let (acquirer, http, _) = build_scripted_acquirer(options());
		let err = acquirer
			.acquire_token_for_user(
				&scopes(),
				AcquireTokenOptions::default()
					.with_agent_identity(ClientId::new("agent").expect("Client id fixture should be valid.")),
				&UserPrincipal::default(),
			)
			.await
			.expect_err("Agent users need a username or user id.");

		assert!(matches!(err, Error::Config(ConfigError::MissingAgentUser)));
		assert_eq!(http.calls(), 0);
	}
}
