//! Shared helpers for flow implementations: the per-key token cache blob, request
//! decoration, client authentication, and the bounded retries.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
// self
use crate::{
	_prelude::*,
	auth::{AcquireTokenResult, ScopeSet, TokenSecret},
	credentials::{self, LoaderParameters},
	error::{ConfigError, cancellable},
	flows::{FicHop, TokenAcquirer},
	http::TokenHttpClient,
	oauth::{TokenRequest, TokenResponse, TransportErrorMapper},
	options::MergedOptions,
	provider::GrantType,
};

/// How long a cache blob outlives its access token when it holds a session refresh token.
pub const REFRESH_TOKEN_RETENTION: Duration = Duration::days(1);

/// One cached token: the caller-facing result plus the session refresh token, if any.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
	/// Result returned on cache hits.
	pub result: AcquireTokenResult,
	/// Refresh token of a long-running on-behalf-of session.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub refresh_token: Option<TokenSecret>,
}
impl CachedToken {
	fn retain_until(&self) -> OffsetDateTime {
		match self.refresh_token {
			Some(_) => self.result.expires_on + REFRESH_TOKEN_RETENTION,
			None => self.result.expires_on,
		}
	}
}

/// Per-cache-key blob: token slot (scope fingerprint, plus PoP key) → cached token.
///
/// The store treats the encoded blob as opaque bytes; only flows read it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenCacheBlob {
	/// Cached tokens by slot.
	#[serde(default)]
	pub tokens: BTreeMap<String, CachedToken>,
}
impl TokenCacheBlob {
	fn decode(key: &str, bytes: &[u8]) -> Self {
		serde_json::from_slice(bytes).unwrap_or_else(|e| {
			tracing::warn!(key, error = %e, "Ignoring unreadable token cache blob.");

			Self::default()
		})
	}
}

/// Slot of `scopes` inside a cache blob; proof-of-possession tokens get a slot per key.
pub fn token_slot(scopes: &ScopeSet, pop_public_key: Option<&str>) -> String {
	match pop_public_key {
		Some(key) => format!("{}:pop:{}", scopes.fingerprint(), URL_SAFE_NO_PAD.encode(Sha256::digest(key))),
		None => scopes.fingerprint(),
	}
}

/// Merges client capabilities into a claims request as `access_token.xms_cc.values`.
pub fn merge_claims(claims: Option<&str>, capabilities: &[String]) -> Result<Option<String>, ConfigError> {
	let claims = claims.filter(|claims| !claims.trim().is_empty());

	if capabilities.is_empty() {
		return Ok(claims.map(str::to_owned));
	}

	let mut root = match claims {
		Some(claims) => serde_json::from_str::<Value>(claims)
			.map_err(|e| ConfigError::InvalidClaims { source: Some(e) })?,
		None => Value::Object(Map::new()),
	};
	let access_token = root
		.as_object_mut()
		.ok_or(ConfigError::InvalidClaims { source: None })?
		.entry("access_token")
		.or_insert_with(|| Value::Object(Map::new()))
		.as_object_mut()
		.ok_or(ConfigError::InvalidClaims { source: None })?;

	access_token.insert("xms_cc".into(), json!({ "values": capabilities }));

	Ok(Some(root.to_string()))
}

/// Claims challenge that warrants the single automatic retry.
///
/// Challenges raised by intermediate FIC hops are not retried; they concern the agent
/// application, not the caller's token.
pub fn claims_challenge(error: &Error) -> Option<String> {
	match error {
		Error::TokenEndpoint(rejection) if rejection.has_claims_challenge() => rejection.claims.clone(),
		Error::FicChain { hop, source } if hop.is_final() => claims_challenge(source),
		_ => None,
	}
}

/// `client-request-id` echo headers carrying the call's correlation id.
pub fn correlation_headers(merged: &MergedOptions) -> [(String, String); 2] {
	[
		("client-request-id".to_owned(), merged.correlation_id.to_string()),
		("return-client-request-id".to_owned(), "true".to_owned()),
	]
}

/// Token request with the parameters every grant shares: `client_id`, scope, claims
/// (with client capabilities), proof of possession, extra query parameters and headers,
/// and the correlation id.
pub fn base_request(
	grant: GrantType,
	merged: &MergedOptions,
	scopes: Option<&ScopeSet>,
	claims: Option<&str>,
) -> Result<TokenRequest, ConfigError> {
	let mut request = TokenRequest::new(grant)
		.with_param("client_id", merged.client_id.to_string())
		.with_query(merged.extra_query_parameters.clone())
		.with_headers(merged.call.extra_headers.clone())
		.with_headers(correlation_headers(merged));

	if let Some(scopes) = scopes {
		request = request.with_param("scope", scopes.normalized());
	}
	if let Some(claims) = merge_claims(claims, &merged.client_capabilities)? {
		request = request.with_param("claims", claims);
	}
	if let Some(key) = &merged.call.pop_public_key {
		request = request.with_param("req_cnf", key.as_str()).with_param("token_type", "pop");
	}

	Ok(request)
}

impl<C, M> TokenAcquirer<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Cached token of `slot` under `key`, if any (fresh or not).
	pub(crate) async fn cached_token(
		&self,
		key: &str,
		slot: &str,
		merged: &MergedOptions,
	) -> Result<Option<CachedToken>> {
		let Some(bytes) = cancellable(&merged.cancel, self.cache.read(key)).await? else {
			return Ok(None);
		};

		Ok(TokenCacheBlob::decode(key, &bytes).tokens.remove(slot))
	}

	/// Fresh cached result of `slot`, counting the hit.
	pub(crate) async fn cache_hit(
		&self,
		key: &str,
		slot: &str,
		merged: &MergedOptions,
	) -> Result<Option<AcquireTokenResult>> {
		let hit = self.cached_token(key, slot, merged).await?.filter(|cached| cached.result.is_fresh());

		if hit.is_some() {
			tracing::debug!(key, "Token cache hit.");
			self.metrics.record_cache_hit();
		}

		Ok(hit.map(|cached| cached.result))
	}

	/// Replaces the blob under `key` with one holding `token` in `slot`.
	///
	/// Expired slots are dropped; the blob lives until its longest-lived slot expires.
	pub(crate) async fn store_token(
		&self,
		key: &str,
		slot: &str,
		token: CachedToken,
		merged: &MergedOptions,
	) -> Result<()> {
		let now = OffsetDateTime::now_utc();
		let mut blob = match cancellable(&merged.cancel, self.cache.read(key)).await? {
			Some(bytes) => TokenCacheBlob::decode(key, &bytes),
			None => TokenCacheBlob::default(),
		};

		blob.tokens.retain(|_, cached| cached.retain_until() > now);
		blob.tokens.insert(slot.to_owned(), token);

		let expires_at = blob.tokens.values().map(CachedToken::retain_until).max().unwrap_or(now);
		let bytes = serde_json::to_vec(&blob).map_err(ConfigError::TokenCacheSerialization)?;

		cancellable(&merged.cancel, self.cache.write(key, bytes, expires_at)).await
	}

	/// Sends `request` to the merged authority's token endpoint.
	pub(crate) async fn send(&self, merged: &MergedOptions, request: TokenRequest) -> Result<TokenResponse> {
		let endpoint = merged.token_endpoint()?;

		tracing::debug!(grant = %request.grant, client_id = %merged.client_id, "Sending token request.");
		self.metrics.record_token_request();

		cancellable(&merged.cancel, self.endpoint.request_token(&endpoint, request)).await
	}

	/// Sends the request built by `build`, authenticated as `merged.client_id`.
	///
	/// A caller-supplied client assertion wins over configured credentials. Otherwise the
	/// first loadable credential is used; when the provider rejects it as stale the list is
	/// reset, the rejected credential is skipped, and the request is sent exactly once more.
	pub(crate) async fn request_as_client<F>(&self, merged: &MergedOptions, build: F) -> Result<TokenResponse>
	where
		F: Fn() -> Result<TokenRequest, ConfigError>,
	{
		if let Some(assertion) = &merged.call.client_assertion {
			return self.send(merged, build()?.with_params(credentials::assertion_params(assertion))).await;
		}

		let endpoint = merged.token_endpoint()?;
		let list_key = merged.credential_list_key();
		let parameters = LoaderParameters::default()
			.with_client_id(merged.client_id.clone())
			.with_token_endpoint(endpoint.clone());
		let mut reset = false;

		loop {
			let (descriptor, resolved) = self
				.resolver
				.load_first_valid(&list_key, &merged.credentials, &parameters, &merged.cancel)
				.await?;
			let auth = credentials::client_auth_params(
				&resolved,
				descriptor.algorithm(),
				&merged.client_id,
				&endpoint,
				merged.send_x5c,
			)?;

			match self.send(merged, build()?.with_params(auth)).await {
				Err(e) if !reset && e.token_endpoint().is_some_and(|rejection| rejection.stale_credential) => {
					tracing::warn!(
						descriptor_id = %descriptor.id(),
						error = %e,
						"Credential rejected as stale; reloading the credential list."
					);

					self.resolver.reset(&list_key, &merged.credentials);
					descriptor.mark_skipped();
					self.metrics.record_credential_reset();

					reset = true;
				},
				outcome => return outcome,
			}
		}
	}

	/// Runs `attempt` with the caller's claims and, when it fails with a claims challenge,
	/// exactly once more with the challenge.
	pub(crate) async fn with_claims_retry<F, Fut>(&self, merged: &MergedOptions, attempt: F) -> Result<AcquireTokenResult>
	where
		F: Fn(Option<String>) -> Fut,
		Fut: Future<Output = Result<AcquireTokenResult>>,
	{
		let error = match attempt(merged.call.claims.clone()).await {
			Ok(result) => return Ok(result),
			Err(e) => e,
		};
		let Some(claims) = claims_challenge(&error) else {
			return Err(error);
		};

		tracing::info!(correlation_id = %merged.correlation_id, "Retrying once with the claims challenge.");
		self.metrics.record_claims_retry();

		attempt(Some(claims)).await
	}

	/// Normalizes a token response; empty tokens and missing lifetimes are rejected.
	pub(crate) fn cached_from_response(
		&self,
		response: TokenResponse,
		requested: &ScopeSet,
		merged: &MergedOptions,
	) -> Result<CachedToken> {
		if response.access_token.is_empty() {
			return Err(ConfigError::EmptyAccessToken.into());
		}

		let lifetime = response.lifetime()?;
		let scopes = match response.scope.as_deref().map(ScopeSet::from_str) {
			Some(Ok(granted)) if !granted.is_empty() => granted,
			_ => requested.clone(),
		};
		let result = AcquireTokenResult {
			access_token: response.access_token,
			token_type: response.token_type.unwrap_or_else(|| "Bearer".into()),
			expires_on: OffsetDateTime::now_utc() + lifetime,
			tenant_id: Some(merged.tenant().clone()),
			id_token: response.id_token,
			scopes,
			correlation_id: merged.correlation_id,
		};

		Ok(CachedToken { result, refresh_token: response.refresh_token })
	}
}

/// Returns true when the cache read must be skipped for this attempt.
pub(crate) fn bypasses_cache(merged: &MergedOptions, claims: Option<&str>) -> bool {
	merged.call.force_refresh || claims.is_some_and(|claims| !claims.trim().is_empty())
}

/// Wraps `error` as a failure of `hop`.
pub(crate) fn hop_failure(hop: FicHop) -> impl FnOnce(Error) -> Error {
	move |error| error.in_hop(hop)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::error::TokenEndpointError;

	fn rejection(claims: Option<&str>) -> TokenEndpointError {
		TokenEndpointError {
			kind: crate::provider::ProviderErrorKind::InteractionRequired,
			status: Some(401),
			error: "invalid_grant".into(),
			description: None,
			error_codes: Vec::new(),
			claims: claims.map(str::to_owned),
			correlation_id: None,
			stale_credential: false,
		}
	}

	#[test]
	fn capabilities_are_merged_into_claims() {
		let capabilities = vec!["cp1".to_owned()];
		let merged = merge_claims(None, &capabilities).expect("Capabilities alone should merge.");
		let value = serde_json::from_str::<Value>(merged.as_deref().expect("Claims should be produced."))
			.expect("Merged claims should be JSON.");

		assert_eq!(value["access_token"]["xms_cc"]["values"], json!(["cp1"]));

		let merged = merge_claims(Some(r#"{"access_token":{"nbf":{"essential":true}}}"#), &capabilities)
			.expect("Challenge should merge.")
			.expect("Claims should be produced.");
		let value = serde_json::from_str::<Value>(&merged).expect("Merged claims should be JSON.");

		assert_eq!(value["access_token"]["nbf"]["essential"], json!(true));
		assert_eq!(value["access_token"]["xms_cc"]["values"], json!(["cp1"]));
		assert_eq!(merge_claims(Some("{}"), &[]).expect("Plain claims pass through."), Some("{}".to_owned()));
		assert!(matches!(merge_claims(Some("[1]"), &capabilities), Err(ConfigError::InvalidClaims { .. })));
	}

	#[test]
	fn only_final_hop_challenges_are_retried() {
		let direct = Error::from(rejection(Some("{\"access_token\":{}}")));

		assert_eq!(claims_challenge(&direct).as_deref(), Some("{\"access_token\":{}}"));
		assert_eq!(claims_challenge(&Error::from(rejection(None))), None);

		let final_hop = Error::from(rejection(Some("{}"))).in_hop(FicHop::AgentUserToken);
		let first_hop = Error::from(rejection(Some("{}"))).in_hop(FicHop::AgentApplicationFic);

		assert!(claims_challenge(&final_hop).is_some());
		assert!(claims_challenge(&first_hop).is_none());
	}

	#[test]
	fn pop_tokens_get_their_own_slot() {
		let scopes = ScopeSet::new(["api://a/.default"]).expect("Scope fixture should be valid.");

		assert_eq!(token_slot(&scopes, None), scopes.fingerprint());
		assert_ne!(token_slot(&scopes, Some("key-a")), token_slot(&scopes, Some("key-b")));
	}

	#[test]
	fn unreadable_blobs_decode_as_empty() {
		assert!(TokenCacheBlob::decode("app:k", b"not json").tokens.is_empty());
	}
}
