//! Token endpoint client: form encoding, dispatch, and response/rejection mapping.
//!
//! The `oauth2` crate supplies the transport contract ([`AsyncHttpClient`]) while this
//! module owns the request body so grants such as `user_fic`, claims challenges, and
//! proof-of-possession parameters can be expressed without fighting a typed client.

pub use oauth2;

// crates.io
use base64::{
	Engine as _,
	engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use oauth2::{
	AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse,
	http::{
		HeaderMap, Method, Request,
		header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE},
	},
};
use serde::{Deserializer, de::DeserializeOwned};
// self
use crate::{
	_prelude::*,
	auth::TokenSecret,
	error::{ConfigError, TokenEndpointError, TransientError, TransportError},
	http::{ResponseMetadata, ResponseMetadataSlot, TokenHttpClient},
	provider::{GrantType, ProviderErrorContext, ProviderErrorKind, ProviderStrategy},
};
#[cfg(feature = "reqwest")] use crate::http::ReqwestHttpClient;

/// Hook that may rewrite a token request body right before it is sent.
pub type BodyInterceptor = Arc<dyn Fn(&mut BTreeMap<String, String>) + Send + Sync>;

/// Maps HTTP transport failures into broker [`Error`] values.
pub trait TransportErrorMapper<E>
where
	Self: 'static + Send + Sync,
	E: 'static + Send + Sync + StdError,
{
	/// Converts an [`HttpClientError`] emitted by the transport into a broker error.
	fn map_transport_error(
		&self,
		meta: Option<&ResponseMetadata>,
		error: HttpClientError<E>,
	) -> Error;
}

/// Default mapper for reqwest-backed transports.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportErrorMapper;
#[cfg(feature = "reqwest")]
impl TransportErrorMapper<ReqwestError> for ReqwestTransportErrorMapper {
	fn map_transport_error(
		&self,
		meta: Option<&ResponseMetadata>,
		err: HttpClientError<ReqwestError>,
	) -> Error {
		match err {
			HttpClientError::Reqwest(inner) => map_reqwest_error(meta, *inner),
			HttpClientError::Http(inner) => ConfigError::from(inner).into(),
			HttpClientError::Io(inner) => TransportError::Io(inner).into(),
			HttpClientError::Other(message) => map_generic_transport_error(meta, message),
			_ => map_generic_transport_error(meta, "unknown transport failure"),
		}
	}
}

/// Form-encoded token request, before strategy augmentation and interception.
#[derive(Clone)]
pub struct TokenRequest {
	/// Grant being exercised.
	pub grant: GrantType,
	/// Form parameters.
	pub form: BTreeMap<String, String>,
	/// Extra query parameters appended to the token endpoint.
	pub query: Vec<(String, String)>,
	/// Extra request headers.
	pub headers: Vec<(String, String)>,
	/// Last-moment body rewrite.
	pub interceptor: Option<BodyInterceptor>,
}
impl TokenRequest {
	/// Starts a request for `grant` with `grant_type` already set.
	pub fn new(grant: GrantType) -> Self {
		let mut form = BTreeMap::new();

		form.insert("grant_type".into(), grant.as_str().into());

		Self { grant, form, query: Vec::new(), headers: Vec::new(), interceptor: None }
	}

	/// Sets a form parameter, replacing any previous value.
	pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.form.insert(name.into(), value.into());

		self
	}

	/// Sets several form parameters at once.
	pub fn with_params(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
		self.form.extend(params);

		self
	}

	/// Appends extra query parameters.
	pub fn with_query(mut self, query: impl IntoIterator<Item = (String, String)>) -> Self {
		self.query.extend(query);

		self
	}

	/// Appends extra headers.
	pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
		self.headers.extend(headers);

		self
	}

	/// Installs a body interceptor.
	pub fn with_interceptor(mut self, interceptor: BodyInterceptor) -> Self {
		self.interceptor = Some(interceptor);

		self
	}
}
impl Debug for TokenRequest {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenRequest")
			.field("grant", &self.grant)
			.field("params", &self.form.keys().collect::<Vec<_>>())
			.field("query", &self.query)
			.field("intercepted", &self.interceptor.is_some())
			.finish()
	}
}

/// Successful token endpoint payload.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
	/// Issued access token.
	pub access_token: TokenSecret,
	/// Token type (`Bearer`, `pop`).
	#[serde(default)]
	pub token_type: Option<String>,
	/// Lifetime in seconds; some providers encode it as a string.
	#[serde(default, deserialize_with = "deserialize_seconds")]
	pub expires_in: Option<i64>,
	/// ID token, when returned.
	#[serde(default)]
	pub id_token: Option<TokenSecret>,
	/// Refresh token, returned for long-running on-behalf-of sessions.
	#[serde(default)]
	pub refresh_token: Option<TokenSecret>,
	/// Granted scopes (space-delimited).
	#[serde(default)]
	pub scope: Option<String>,
}
impl TokenResponse {
	/// Validated lifetime of the access token.
	pub fn lifetime(&self) -> Result<Duration, ConfigError> {
		let seconds = self.expires_in.ok_or(ConfigError::MissingExpiresIn)?;

		if seconds <= 0 {
			return Err(ConfigError::NonPositiveExpiresIn);
		}

		Ok(Duration::seconds(seconds))
	}
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	error_description: Option<String>,
	#[serde(default)]
	error_codes: Vec<u32>,
	#[serde(default)]
	correlation_id: Option<String>,
	#[serde(default)]
	claims: Option<String>,
}

/// Client that posts token requests for one transport/mapper pair.
pub struct TokenEndpointClient<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	http_client: Arc<C>,
	error_mapper: Arc<M>,
	strategy: Arc<dyn ProviderStrategy>,
}
impl<C, M> TokenEndpointClient<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Builds a client that augments and classifies requests with `strategy`.
	pub fn new(http_client: Arc<C>, error_mapper: Arc<M>, strategy: Arc<dyn ProviderStrategy>) -> Self {
		Self { http_client, error_mapper, strategy }
	}

	/// Replaces the provider strategy.
	pub fn with_strategy(mut self, strategy: Arc<dyn ProviderStrategy>) -> Self {
		self.strategy = strategy;

		self
	}

	/// Strategy used to augment requests and classify rejections.
	pub fn strategy(&self) -> &dyn ProviderStrategy {
		self.strategy.as_ref()
	}

	/// Posts `request` to `endpoint` and parses the token response.
	pub async fn request_token(&self, endpoint: &Url, request: TokenRequest) -> Result<TokenResponse> {
		let TokenRequest { grant, mut form, query, headers, interceptor } = request;

		self.strategy.augment_token_request(grant, &mut form);

		if let Some(interceptor) = interceptor {
			interceptor(&mut form);
		}

		let mut url = endpoint.clone();

		if !query.is_empty() {
			url.query_pairs_mut().extend_pairs(query.iter());
		}

		let body = url::form_urlencoded::Serializer::new(String::new()).extend_pairs(form.iter()).finish();
		let mut builder = Request::builder()
			.method(Method::POST)
			.uri(url.as_str())
			.header(CONTENT_TYPE, "application/x-www-form-urlencoded")
			.header(ACCEPT, "application/json");

		for (name, value) in &headers {
			builder = builder.header(name.as_str(), value.as_str());
		}

		let request = builder.body(body.into_bytes()).map_err(ConfigError::from)?;
		let (response, meta) = dispatch(self.http_client.as_ref(), self.error_mapper.as_ref(), request).await?;

		if response.status().is_success() {
			return parse_json(response.body(), Some(response.status().as_u16()));
		}

		Err(map_rejection(self.strategy.as_ref(), grant, &response, meta.as_ref()))
	}
}
impl<C, M> Clone for TokenEndpointClient<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn clone(&self) -> Self {
		Self {
			http_client: self.http_client.clone(),
			error_mapper: self.error_mapper.clone(),
			strategy: self.strategy.clone(),
		}
	}
}
#[cfg(feature = "reqwest")]
impl TokenEndpointClient<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Client over the default reqwest transport.
	pub fn reqwest(strategy: Arc<dyn ProviderStrategy>) -> Result<Self> {
		Ok(Self::new(
			Arc::new(ReqwestHttpClient::new()?),
			Arc::new(ReqwestTransportErrorMapper),
			strategy,
		))
	}
}

/// Sends `request` through a metadata-instrumented handle, mapping transport failures.
pub async fn dispatch<C, M>(
	http_client: &C,
	error_mapper: &M,
	request: HttpRequest,
) -> Result<(HttpResponse, Option<ResponseMetadata>)>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	let slot = ResponseMetadataSlot::default();
	let handle = http_client.with_metadata(slot.clone());
	let response = handle
		.call(request)
		.await
		.map_err(|e| error_mapper.map_transport_error(slot.take().as_ref(), e))?;

	Ok((response, slot.take()))
}

/// Parses a JSON body with path-aware error reporting.
pub fn parse_json<T>(body: &[u8], status: Option<u16>) -> Result<T>
where
	T: DeserializeOwned,
{
	let mut deserializer = serde_json::Deserializer::from_slice(body);

	serde_path_to_error::deserialize(&mut deserializer)
		.map_err(|source| TransientError::TokenResponseParse { source, status }.into())
}

/// Extracts the base64 `claims` parameter from a `WWW-Authenticate` challenge.
pub fn claims_from_www_authenticate(headers: &HeaderMap) -> Option<String> {
	headers.get_all(WWW_AUTHENTICATE).iter().filter_map(|value| value.to_str().ok()).find_map(
		|challenge| {
			challenge.split(',').find_map(|part| {
				let (name, value) = part.trim().split_once('=')?;

				if !name.trim().trim_start_matches("Bearer ").trim().eq_ignore_ascii_case("claims") {
					return None;
				}

				let encoded = value.trim().trim_matches('"');
				let decoded = STANDARD
					.decode(encoded)
					.or_else(|_| URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')))
					.ok()?;

				String::from_utf8(decoded).ok()
			})
		},
	)
}

fn map_rejection(
	strategy: &dyn ProviderStrategy,
	grant: GrantType,
	response: &HttpResponse,
	meta: Option<&ResponseMetadata>,
) -> Error {
	let status = response.status().as_u16();
	let body = serde_json::from_slice::<ErrorBody>(response.body()).unwrap_or_default();
	let claims = body
		.claims
		.filter(|claims| !claims.trim().is_empty())
		.or_else(|| claims_from_www_authenticate(response.headers()));
	let Some(error) = body.error else {
		return TransientError::TokenEndpoint {
			message: format!("HTTP {status} without an OAuth error body"),
			status: Some(status),
			retry_after: meta.and_then(|meta| meta.retry_after),
		}
		.into();
	};
	let mut ctx = ProviderErrorContext::new(grant)
		.with_http_status(status)
		.with_oauth_error(error.clone())
		.with_error_codes(body.error_codes.clone())
		.with_claims(claims.is_some());

	if let Some(description) = &body.error_description {
		ctx = ctx.with_error_description(description.clone());
	}

	let kind = strategy.classify_token_error(&ctx);

	if kind == ProviderErrorKind::Transient {
		return TransientError::TokenEndpoint {
			message: body.error_description.unwrap_or(error),
			status: Some(status),
			retry_after: meta.and_then(|meta| meta.retry_after),
		}
		.into();
	}

	TokenEndpointError {
		kind,
		status: Some(status),
		error,
		description: body.error_description,
		error_codes: body.error_codes,
		claims,
		correlation_id: body.correlation_id,
		stale_credential: strategy.requires_credential_reset(&ctx),
	}
	.into()
}

#[cfg(feature = "reqwest")]
fn map_reqwest_error(meta: Option<&ResponseMetadata>, err: ReqwestError) -> Error {
	if err.is_builder() {
		return ConfigError::from(err).into();
	}
	if err.is_timeout() {
		return TransientError::TokenEndpoint {
			message: "Request timed out while calling the identity provider".into(),
			status: meta.and_then(|meta| meta.status).or_else(|| err.status().map(|s| s.as_u16())),
			retry_after: meta.and_then(|meta| meta.retry_after),
		}
		.into();
	}

	TransportError::from(err).into()
}

#[cfg(feature = "reqwest")]
fn map_generic_transport_error(meta: Option<&ResponseMetadata>, message: impl Display) -> Error {
	TransientError::TokenEndpoint {
		message: format!("HTTP client error occurred while calling the identity provider: {message}"),
		status: meta.and_then(|meta| meta.status),
		retry_after: meta.and_then(|meta| meta.retry_after),
	}
	.into()
}

fn deserialize_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Seconds {
		Number(i64),
		Text(String),
	}

	match Option::<Seconds>::deserialize(deserializer)? {
		None => Ok(None),
		Some(Seconds::Number(value)) => Ok(Some(value)),
		Some(Seconds::Text(value)) =>
			value.trim().parse().map(Some).map_err(serde::de::Error::custom),
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{_preludet::*, provider::DefaultProviderStrategy};

	fn client(http: &ScriptedHttpClient) -> TokenEndpointClient<ScriptedHttpClient, ScriptedTransportErrorMapper> {
		TokenEndpointClient::new(
			Arc::new(http.clone()),
			Arc::new(ScriptedTransportErrorMapper),
			Arc::new(DefaultProviderStrategy),
		)
	}

	fn endpoint() -> Url {
		Url::parse("https://login.example.com/tenant/oauth2/v2.0/token")
			.expect("Endpoint fixture should parse.")
	}

	#[tokio::test]
	async fn request_token_encodes_form_query_and_interceptor() {
		let http = ScriptedHttpClient::default();

		http.push(ScriptedResponse::json(
			200,
			r#"{"token_type":"Bearer","access_token":"at","expires_in":"3599"}"#,
		));

		let request = TokenRequest::new(GrantType::ClientCredentials)
			.with_param("client_id", "app")
			.with_param("client_secret", "s3cret")
			.with_query([("dc".to_owned(), "ESTS-PUB".to_owned())])
			.with_headers([("client-request-id".to_owned(), "abc".to_owned())])
			.with_interceptor(Arc::new(|form| {
				form.remove("client_secret");
			}));
		let response = client(&http)
			.request_token(&endpoint(), request)
			.await
			.expect("Scripted token response should parse.");

		assert_eq!(response.expires_in, Some(3599));
		assert_eq!(response.access_token.expose(), "at");

		let sent = &http.requests()[0];

		assert_eq!(sent.method, "POST");
		assert!(sent.uri.ends_with("/token?dc=ESTS-PUB"));
		assert_eq!(sent.headers.get("client-request-id").map(String::as_str), Some("abc"));
		assert_eq!(sent.form.get("grant_type").map(String::as_str), Some("client_credentials"));
		assert!(!sent.form.contains_key("client_secret"), "Interceptor must run before encoding.");
	}

	#[tokio::test]
	async fn rejections_carry_claims_from_body_or_header() {
		let http = ScriptedHttpClient::default();
		let encoded = STANDARD.encode(r#"{"access_token":{"nbf":{"essential":true}}}"#);

		http.push(ScriptedResponse::json(
			400,
			r#"{"error":"invalid_grant","error_description":"AADSTS50076: MFA","error_codes":[50076],"claims":"{\"access_token\":{}}"}"#,
		));
		http.push(
			ScriptedResponse::json(401, r#"{"error":"invalid_client"}"#)
				.with_header("www-authenticate", &format!("Bearer realm=\"\", claims=\"{encoded}\"")),
		);

		let client = client(&http);
		let first = client
			.request_token(&endpoint(), TokenRequest::new(GrantType::OnBehalfOf))
			.await
			.expect_err("Rejections should surface as errors.");
		let first = first.token_endpoint().expect("Rejection should be structured.");

		assert_eq!(first.kind, ProviderErrorKind::InteractionRequired);
		assert_eq!(first.error_codes, vec![50076]);
		assert_eq!(first.claims.as_deref(), Some("{\"access_token\":{}}"));

		let second = client
			.request_token(&endpoint(), TokenRequest::new(GrantType::ClientCredentials))
			.await
			.expect_err("Rejections should surface as errors.");
		let second = second.token_endpoint().expect("Rejection should be structured.");

		assert_eq!(second.claims.as_deref(), Some(r#"{"access_token":{"nbf":{"essential":true}}}"#));
	}

	#[tokio::test]
	async fn server_errors_without_oauth_body_are_transient() {
		let http = ScriptedHttpClient::default();

		http.push(ScriptedResponse::json(503, "<html>busy</html>"));

		let err = client(&http)
			.request_token(&endpoint(), TokenRequest::new(GrantType::ClientCredentials))
			.await
			.expect_err("Non-JSON 503 should fail.");

		assert!(matches!(err, Error::Transient(TransientError::TokenEndpoint { status: Some(503), .. })));
	}

	#[test]
	fn lifetime_rejects_missing_and_non_positive_values() {
		let parse = |body: &str| parse_json::<TokenResponse>(body.as_bytes(), Some(200));
		let missing = parse(r#"{"access_token":"at"}"#).expect("Body without expiry should parse.");

		assert!(matches!(missing.lifetime(), Err(ConfigError::MissingExpiresIn)));

		let zero = parse(r#"{"access_token":"at","expires_in":0}"#).expect("Zero expiry should parse.");

		assert!(matches!(zero.lifetime(), Err(ConfigError::NonPositiveExpiresIn)));
		assert!(matches!(parse("{not json"), Err(Error::Transient(TransientError::TokenResponseParse { .. }))));
	}
}
