//! Key Vault certificate loader.

// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD};
use oauth2::http::{
	Method, Request,
	header::{ACCEPT, AUTHORIZATION},
};
// self
use crate::{
	_prelude::*,
	credentials::{
		CredentialDescriptor, CredentialSource, CredentialSourceLoader, LoadError, LoadFuture,
		LoaderParameters, ResolvedCredential,
		loaders::{VaultTokenSource, certificate::{certificate_from_pem, unsupported}},
	},
	http::TokenHttpClient,
	oauth::{self, TransportErrorMapper},
};

/// Key Vault REST API version used for secret reads.
pub const KEY_VAULT_API_VERSION: &str = "7.4";

#[derive(Debug, Deserialize)]
struct SecretBundle {
	value: String,
	#[serde(default, rename = "contentType")]
	content_type: Option<String>,
}

/// Reads a certificate's backing secret (`GET {vault}/secrets/{name}`) and parses the PEM
/// bundle it holds.
pub struct KeyVaultCertificateLoader<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	http_client: Arc<C>,
	error_mapper: Arc<M>,
	tokens: Arc<dyn VaultTokenSource>,
}
impl<C, M> KeyVaultCertificateLoader<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Loader that authenticates with bearer tokens from `tokens`.
	pub fn new(http_client: Arc<C>, error_mapper: Arc<M>, tokens: Arc<dyn VaultTokenSource>) -> Self {
		Self { http_client, error_mapper, tokens }
	}

	async fn fetch(&self, vault_url: &Url, certificate_name: &str) -> Result<SecretBundle, LoadError> {
		let mut url = vault_url.clone();

		url.path_segments_mut()
			.map_err(|_| LoadError::malformed(format!("Vault URL {vault_url} cannot be a base")))?
			.pop_if_empty()
			.extend(["secrets", certificate_name]);
		url.query_pairs_mut().append_pair("api-version", KEY_VAULT_API_VERSION);

		let token = self.tokens.vault_token(vault_url).await?;
		let request = Request::builder()
			.method(Method::GET)
			.uri(url.as_str())
			.header(AUTHORIZATION, format!("Bearer {}", token.expose()))
			.header(ACCEPT, "application/json")
			.body(Vec::new())
			.map_err(|e| LoadError::malformed(format!("Key Vault request is invalid: {e}")))?;
		let (response, _) = oauth::dispatch(self.http_client.as_ref(), self.error_mapper.as_ref(), request)
			.await
			.map_err(|e| LoadError::network(e.to_string()))?;

		if !response.status().is_success() {
			return Err(LoadError::from_status(
				response.status().as_u16(),
				format!("{certificate_name} in {vault_url}"),
			));
		}

		serde_json::from_slice(response.body())
			.map_err(|e| LoadError::malformed(format!("Key Vault response is invalid: {e}")))
	}
}
impl<C, M> CredentialSourceLoader for KeyVaultCertificateLoader<C, M>
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
			let CredentialSource::KeyVault { vault_url, certificate_name } = descriptor.source() else {
				return Err(unsupported(descriptor, "KeyVaultCertificateLoader"));
			};
			let bundle = self.fetch(vault_url, certificate_name).await?;

			if bundle.content_type.as_deref().is_some_and(|kind| kind.contains("pkcs12")) {
				return Err(LoadError::malformed(format!(
					"{certificate_name} is stored as PKCS#12; only PEM certificates are supported"
				)));
			}

			let pem = if bundle.value.contains("-----BEGIN") {
				bundle.value.into_bytes()
			} else {
				STANDARD
					.decode(bundle.value.trim())
					.map_err(|e| LoadError::malformed(format!("Secret value is neither PEM nor base64: {e}")))?
			};
			let material = certificate_from_pem(&pem, None, OffsetDateTime::now_utc())?;

			Ok(ResolvedCredential::Certificate(Arc::new(material)))
		})
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{_preludet::*, auth::TokenSecret};

	struct StaticToken;
	impl VaultTokenSource for StaticToken {
		fn vault_token<'a>(&'a self, _: &'a Url) -> LoadFuture<'a, TokenSecret> {
			Box::pin(async { Ok(TokenSecret::new("vault-token")) })
		}
	}

	fn loader(http: &ScriptedHttpClient) -> KeyVaultCertificateLoader<ScriptedHttpClient, ScriptedTransportErrorMapper> {
		KeyVaultCertificateLoader::new(
			Arc::new(http.clone()),
			Arc::new(ScriptedTransportErrorMapper),
			Arc::new(StaticToken),
		)
	}

	fn descriptor() -> CredentialDescriptor {
		CredentialDescriptor::from_key_vault(
			Url::parse("https://broker.vault.azure.net").expect("Vault URL fixture should parse."),
			"app-cert",
		)
	}

	#[tokio::test]
	async fn secrets_are_fetched_with_bearer_tokens() {
		let http = ScriptedHttpClient::default();
		let pem = std::fs::read_to_string(test_certificate_path()).expect("Fixture should be readable.");
		let body = serde_json::json!({ "value": pem, "contentType": "application/x-pem-file" });

		http.push(ScriptedResponse::json(200, body.to_string()));

		let resolved = loader(&http)
			.load(&descriptor(), &LoaderParameters::default())
			.await
			.expect("Vault secret should load.");

		assert!(resolved.certificate().is_some());

		let request = &http.requests()[0];

		assert_eq!(request.uri, "https://broker.vault.azure.net/secrets/app-cert?api-version=7.4");
		assert_eq!(request.headers.get("authorization").map(String::as_str), Some("Bearer vault-token"));
	}

	#[tokio::test]
	async fn vault_statuses_map_to_load_errors() {
		let http = ScriptedHttpClient::default();

		http.push(ScriptedResponse::json(403, r#"{"error":{"code":"Forbidden"}}"#));
		http.push(ScriptedResponse::json(404, r#"{"error":{"code":"SecretNotFound"}}"#));
		http.push(ScriptedResponse::json(200, r#"{"value":"MIIK","contentType":"application/x-pkcs12"}"#));

		let loader = loader(&http);
		let params = LoaderParameters::default();
		let descriptor = descriptor();

		assert!(matches!(loader.load(&descriptor, &params).await, Err(LoadError::AccessDenied { .. })));
		assert!(matches!(loader.load(&descriptor, &params).await, Err(LoadError::NotFound { .. })));
		assert!(matches!(loader.load(&descriptor, &params).await, Err(LoadError::Malformed { .. })));
	}
}
