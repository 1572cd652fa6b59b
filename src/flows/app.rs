// self
use crate::{
	_prelude::*,
	auth::{AcquireTokenResult, ScopeSet},
	error::ConfigError,
	flows::{FicChainBuilder, TokenAcquirer, base_request, bypasses_cache, token_slot},
	http::TokenHttpClient,
	obs::FlowKind,
	oauth::TransportErrorMapper,
	options::{AcquireTokenOptions, MergedOptions},
	provider::GrantType,
	store::CacheKey,
};

impl<C, M> TokenAcquirer<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Acquires an app-only token for `scopes`.
	///
	/// Reserved OIDC scopes are dropped, every remaining scope must end with `/.default`, and
	/// the tenant must not be a meta tenant. With an agent identity in `options` the token is
	/// obtained through the autonomous FIC chain and cached under the agent identity.
	pub async fn acquire_token_for_app(
		&self,
		scopes: &ScopeSet,
		options: AcquireTokenOptions,
	) -> Result<AcquireTokenResult> {
		let kind = match options.agent_identity {
			Some(_) => FlowKind::AgentIdentity,
			None => FlowKind::App,
		};

		self.observe(kind, "acquire_token_for_app", options, |options| async move {
			let merged = self.merge(&options)?;
			let scopes = app_scopes(scopes, &merged)?;
			let client_id = merged.call.agent_identity.clone().unwrap_or_else(|| merged.client_id.clone());
			let key = CacheKey::app(&merged.scheme, merged.tenant().clone(), client_id).to_string();
			let slot = token_slot(&scopes, merged.call.pop_public_key.as_deref());

			self.with_claims_retry(&merged, |claims| self.app_attempt(&merged, &scopes, &key, &slot, claims))
				.await
		})
		.await
	}

	async fn app_attempt(
		&self,
		merged: &MergedOptions,
		scopes: &ScopeSet,
		key: &str,
		slot: &str,
		claims: Option<String>,
	) -> Result<AcquireTokenResult> {
		let claims = claims.as_deref();

		if !bypasses_cache(merged, claims)
			&& let Some(hit) = self.cache_hit(key, slot, merged).await?
		{
			return Ok(hit);
		}

		let token = match &merged.call.agent_identity {
			Some(agent_identity) =>
				FicChainBuilder::new(self, merged, agent_identity.clone())
					.agent_identity_token(scopes, claims)
					.await?,
			None => {
				let response = self
					.request_as_client(merged, || {
						base_request(GrantType::ClientCredentials, merged, Some(scopes), claims)
					})
					.await?;

				self.cached_from_response(response, scopes, merged)?
			},
		};

		self.store_token(key, slot, token.clone(), merged).await?;

		Ok(token.result)
	}
}

fn app_scopes(scopes: &ScopeSet, merged: &MergedOptions) -> Result<ScopeSet, ConfigError> {
	let scopes = scopes.without_reserved();

	if scopes.is_empty() {
		return Err(ConfigError::MissingScopes);
	}
	if let Some(scope) = scopes.first_non_default() {
		return Err(ConfigError::AppScopeMustEndWithDefault { scope: scope.to_owned() });
	}
	if merged.tenant().is_meta() {
		return Err(ConfigError::MetaTenantNotAllowed { tenant: merged.tenant().to_string() });
	}

	Ok(scopes)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		_preludet::*,
		auth::{ClientId, TenantId},
		credentials::{CredentialDescriptor, CredentialObserver},
		options::ApplicationOptions,
	};

	const CLAIMS: &str = r#"{"access_token":{"nbf":{"essential":true,"value":"1700000000"}}}"#;

	fn options() -> ApplicationOptions {
		ApplicationOptions::new(ClientId::new("app").expect("Client id fixture should be valid."))
			.with_tenant(TenantId::new("tenant").expect("Tenant fixture should be valid."))
			.with_credential(CredentialDescriptor::from_client_secret("s3cret"))
	}

	fn scopes(values: &[&str]) -> ScopeSet {
		ScopeSet::new(values.iter().copied()).expect("Scope fixture should be valid.")
	}

	fn graph() -> ScopeSet {
		scopes(&["https://graph.microsoft.com/.default"])
	}

	fn claims_rejection() -> ScriptedResponse {
		ScriptedResponse::json(
			401,
			serde_json::json!({
				"error": "invalid_grant",
				"error_description": "AADSTS50005: Conditional access.",
				"claims": CLAIMS,
			})
			.to_string(),
		)
	}

	#[derive(Default)]
	struct RecordingObserver {
		events: Mutex<Vec<String>>,
	}
	impl CredentialObserver for RecordingObserver {
		fn on_credential_selected(&self, descriptor: &CredentialDescriptor) {
			self.events.lock().push(format!("selected:{}", descriptor.id()));
		}

		fn on_credential_deselected(&self) {
			self.events.lock().push("deselected".into());
		}
	}

	#[tokio::test]
	async fn app_scopes_are_validated_before_any_request() {
		let (acquirer, http, _) = build_scripted_acquirer(options());
		let err = acquirer
			.acquire_token_for_app(&scopes(&["User.Read"]), Default::default())
			.await
			.expect_err("Non-default scopes should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::AppScopeMustEndWithDefault { .. })));

		let err = acquirer
			.acquire_token_for_app(&scopes(&["openid", "profile"]), Default::default())
			.await
			.expect_err("Reserved scopes alone should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::MissingScopes)));

		let err = acquirer
			.acquire_token_for_app(
				&graph(),
				AcquireTokenOptions::default()
					.with_tenant(TenantId::new("common").expect("Tenant fixture should be valid.")),
			)
			.await
			.expect_err("Meta tenants should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::MetaTenantNotAllowed { .. })));
		assert_eq!(http.calls(), 0);
	}

	#[tokio::test]
	async fn reserved_scopes_are_stripped_and_correlation_is_sent() {
		let (acquirer, http, _) = build_scripted_acquirer(options());
		let correlation_id = Uuid::new_v4();

		http.push(ScriptedResponse::token("app-token", 3600));

		let result = acquirer
			.acquire_token_for_app(
				&scopes(&["https://graph.microsoft.com/.default", "offline_access"]),
				AcquireTokenOptions::default().with_correlation_id(correlation_id),
			)
			.await
			.expect("Client credentials should succeed.");
		let request = &http.requests()[0];

		assert_eq!(result.correlation_id, correlation_id);
		assert_eq!(result.token_type, "Bearer");
		assert_eq!(request.form.get("grant_type").map(String::as_str), Some("client_credentials"));
		assert_eq!(request.form.get("scope").map(String::as_str), Some("https://graph.microsoft.com/.default"));
		assert_eq!(request.form.get("client_secret").map(String::as_str), Some("s3cret"));
		assert_eq!(request.headers.get("client-request-id"), Some(&correlation_id.to_string()));
		assert_eq!(request.headers.get("return-client-request-id").map(String::as_str), Some("true"));
	}

	#[tokio::test]
	async fn claims_challenges_retry_exactly_once() {
		let (acquirer, http, _) = build_scripted_acquirer(options());

		http.always(claims_rejection());

		let err = acquirer
			.acquire_token_for_app(&graph(), Default::default())
			.await
			.expect_err("Persistent challenges should surface.");
		let requests = http.requests();

		assert!(err.token_endpoint().is_some_and(|rejection| rejection.has_claims_challenge()));
		assert_eq!(requests.len(), 2);
		assert!(!requests[0].form.contains_key("claims"));
		assert_eq!(requests[1].form.get("claims").map(String::as_str), Some(CLAIMS));
		assert_eq!(acquirer.metrics().claims_retries(), 1);
	}

	#[tokio::test]
	async fn rejections_without_claims_are_not_retried() {
		let (acquirer, http, _) = build_scripted_acquirer(options());

		http.always(ScriptedResponse::json(401, r#"{"error":"invalid_client"}"#));

		acquirer
			.acquire_token_for_app(&graph(), Default::default())
			.await
			.expect_err("Rejection should surface.");

		assert_eq!(http.calls(), 1);
		assert_eq!(acquirer.metrics().claims_retries(), 0);
	}

	#[tokio::test]
	async fn claims_challenge_from_header_is_retried_and_cached() {
		let (acquirer, http, l2) = build_scripted_acquirer(options());
		let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, CLAIMS);

		http.push(
			ScriptedResponse::json(401, r#"{"error":"invalid_grant"}"#)
				.with_header("www-authenticate", &format!("Bearer error=\"insufficient_claims\", claims=\"{encoded}\"")),
		)
		.push(ScriptedResponse::token("challenged", 3600));

		let result = acquirer
			.acquire_token_for_app(&graph(), Default::default())
			.await
			.expect("Challenge retry should succeed.");

		assert_eq!(result.access_token.expose(), "challenged");
		assert_eq!(http.requests()[1].form.get("claims").map(String::as_str), Some(CLAIMS));
		assert_eq!(l2.writes(), 1);
	}

	#[tokio::test]
	async fn force_refresh_bypasses_without_invalidating() {
		let (acquirer, http, _) = build_scripted_acquirer(options());

		http.push(ScriptedResponse::token("first", 3600))
			.push(ScriptedResponse::json(503, r#"{"error":"temporarily_unavailable"}"#));

		let first = acquirer.acquire_token_for_app(&graph(), Default::default()).await.expect("First call should succeed.");

		acquirer
			.acquire_token_for_app(&graph(), AcquireTokenOptions::default().with_force_refresh(true))
			.await
			.expect_err("Forced call should reach the failing endpoint.");

		let cached = acquirer
			.acquire_token_for_app(&graph(), Default::default())
			.await
			.expect("Cached entry should survive the failed forced call.");

		assert_eq!(cached, first);
		assert_eq!(http.calls(), 2);
	}

	#[tokio::test]
	async fn capabilities_and_pop_decorate_the_request() {
		let (acquirer, http, _) =
			build_scripted_acquirer(options().with_client_capabilities(["cp1"]));

		http.always(ScriptedResponse::token("pop-token", 3600));

		acquirer
			.acquire_token_for_app(&graph(), AcquireTokenOptions::default().with_pop_public_key("jwk-a"))
			.await
			.expect("PoP request should succeed.");
		acquirer
			.acquire_token_for_app(&graph(), AcquireTokenOptions::default().with_pop_public_key("jwk-b"))
			.await
			.expect("Second PoP key should not hit the first key's slot.");

		let requests = http.requests();
		let claims = serde_json::from_str::<serde_json::Value>(
			requests[0].form.get("claims").expect("Capabilities should be sent as claims."),
		)
		.expect("Claims should be JSON.");

		assert_eq!(requests.len(), 2);
		assert_eq!(claims["access_token"]["xms_cc"]["values"], serde_json::json!(["cp1"]));
		assert_eq!(requests[0].form.get("req_cnf").map(String::as_str), Some("jwk-a"));
		assert_eq!(requests[0].form.get("token_type").map(String::as_str), Some("pop"));
	}

	#[tokio::test]
	async fn stale_certificates_rotate_to_the_next_descriptor_once() {
		let rotated = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/client-cert-rotated.pem");
		let options = ApplicationOptions::new(ClientId::new("app").expect("Client id fixture should be valid."))
			.with_tenant(TenantId::new("tenant").expect("Tenant fixture should be valid."))
			.with_credential(test_certificate_descriptor())
			.with_credential(CredentialDescriptor::from_path(rotated, None));
		let (acquirer, http, _) = build_scripted_acquirer(options);
		let observer = Arc::new(RecordingObserver::default());

		acquirer.resolver().subscribe(observer.clone());
		http.push(ScriptedResponse::json(
			401,
			r#"{"error":"invalid_client","error_description":"AADSTS700027: Client assertion contains an invalid signature."}"#,
		))
		.push(ScriptedResponse::token("rotated", 3600));

		let result = acquirer
			.acquire_token_for_app(&graph(), Default::default())
			.await
			.expect("Rotation retry should succeed.");
		let requests = http.requests();
		let thumbprint = |index: usize| {
			let assertion = requests[index].form.get("client_assertion").expect("Assertion should be sent.");

			jsonwebtoken::decode_header(assertion).expect("Assertion header should decode.").x5t_s256
		};
		let events = observer.events.lock().clone();

		assert_eq!(result.access_token.expose(), "rotated");
		assert_eq!(requests.len(), 2);
		assert_ne!(thumbprint(0), thumbprint(1));
		assert_eq!(acquirer.metrics().credential_resets(), 1);
		assert_eq!(events.len(), 3);
		assert!(events[0].starts_with("selected:"));
		assert_eq!(events[1], "deselected");
		assert!(events[2].starts_with("selected:"));
		assert_ne!(events[0], events[2]);
	}

	#[tokio::test]
	async fn cancelled_calls_return_cancelled() {
		let (acquirer, http, _) = build_scripted_acquirer(options());
		let cancel = CancellationToken::new();

		cancel.cancel();

		let err = acquirer
			.acquire_token_for_app(&graph(), AcquireTokenOptions::default().with_cancellation(cancel))
			.await
			.expect_err("Cancelled calls should fail.");

		assert!(matches!(err, Error::Cancelled));
		assert_eq!(http.calls(), 0);
	}
}
