//! Client assertions: certificate-signed JWTs presented instead of a client secret.

// crates.io
use jsonwebtoken::{Algorithm, Header};
// self
use crate::{
	_prelude::*,
	auth::{ClientId, TokenSecret},
	credentials::{CertificateMaterial, ResolvedCredential},
	error::ConfigError,
	provider::JWT_BEARER_ASSERTION_TYPE,
};

/// Lifetime of certificate-signed client assertions.
pub const CLIENT_ASSERTION_LIFETIME: Duration = Duration::minutes(10);

#[derive(Debug, Serialize)]
struct ClientAssertionClaims<'a> {
	aud: &'a str,
	iss: &'a str,
	sub: &'a str,
	jti: String,
	iat: i64,
	nbf: i64,
	exp: i64,
}

/// Signs a client assertion for `client_id`, audience `token_endpoint`.
///
/// The header carries `x5t#S256`; `x5c` is added when `send_x5c` is set (subject name and
/// issuer authentication).
pub fn sign_client_assertion(
	material: &CertificateMaterial,
	algorithm: Algorithm,
	client_id: &ClientId,
	token_endpoint: &Url,
	send_x5c: bool,
) -> Result<TokenSecret, ConfigError> {
	let now = OffsetDateTime::now_utc().unix_timestamp();
	let mut header = Header::new(algorithm);

	header.x5t_s256 = Some(material.thumbprint_s256());

	if send_x5c {
		header.x5c = Some(material.x5c());
	}

	let claims = ClientAssertionClaims {
		aud: token_endpoint.as_str(),
		iss: client_id.as_ref(),
		sub: client_id.as_ref(),
		jti: Uuid::new_v4().to_string(),
		iat: now,
		nbf: now,
		exp: now + CLIENT_ASSERTION_LIFETIME.whole_seconds(),
	};
	let token = jsonwebtoken::encode(&header, &claims, material.signing_key())
		.map_err(|source| ConfigError::ClientAssertion { source })?;

	Ok(TokenSecret::new(token))
}

/// Client authentication form parameters for a resolved credential.
///
/// Certificates are signed into a fresh assertion; signed assertions and secrets are sent
/// as they are.
pub fn client_auth_params(
	resolved: &ResolvedCredential,
	algorithm: Algorithm,
	client_id: &ClientId,
	token_endpoint: &Url,
	send_x5c: bool,
) -> Result<Vec<(String, String)>, ConfigError> {
	let assertion = match resolved {
		ResolvedCredential::ClientSecret(secret) =>
			return Ok(vec![("client_secret".into(), secret.expose().to_owned())]),
		ResolvedCredential::Certificate(material) =>
			sign_client_assertion(material, algorithm, client_id, token_endpoint, send_x5c)?,
		ResolvedCredential::SignedAssertion(assertion) => assertion.token.clone(),
	};

	Ok(assertion_params(&assertion))
}

/// `client_assertion` + `client_assertion_type` for a JWT-bearer client assertion.
pub fn assertion_params(assertion: &TokenSecret) -> Vec<(String, String)> {
	vec![
		("client_assertion".into(), assertion.expose().to_owned()),
		("client_assertion_type".into(), JWT_BEARER_ASSERTION_TYPE.into()),
	]
}
