//! Acquires an app-only token with a client secret against a mock identity provider, then
//! serves the second call from the two-tier cache.

// std
use std::sync::Arc;
// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
use url::Url;
// self
use identity_broker::{
	auth::{ClientId, ScopeSet, TenantId},
	credentials::CredentialDescriptor,
	factory::ReqwestTokenAcquirerFactory,
	http::ReqwestHttpClient,
	oauth::ReqwestTransportErrorMapper,
	options::{AcquireTokenOptions, ApplicationOptions},
	store::{MemoryDistributedCache, TokenCacheStoreOptions},
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let server = MockServer::start_async().await;
	let token_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/contoso/oauth2/v2.0/token");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"demo-access\",\"token_type\":\"Bearer\",\"expires_in\":900}",
			);
		})
		.await;
	let options = ApplicationOptions::new(ClientId::new("demo-client")?)
		.with_instance(Url::parse(&server.url("/"))?)
		.with_tenant(TenantId::new("contoso")?)
		.with_credential(CredentialDescriptor::from_client_secret("super-secret"));
	// The mock server presents a self-signed certificate.
	let client = identity_broker::reqwest::Client::builder().danger_accept_invalid_certs(true).build()?;
	let factory = ReqwestTokenAcquirerFactory::with_http_client(
		ReqwestHttpClient::with_client(client),
		ReqwestTransportErrorMapper,
	)
	.with_distributed_cache(Arc::new(MemoryDistributedCache::default()))
	.with_cache_options(TokenCacheStoreOptions::default().on_distributed_cache_failure(|error| {
		eprintln!("Distributed cache failed: {error}.");

		error.is_connectivity()
	}))
	.with_application_options("Bearer", options);
	let acquirer = factory.build()?;
	let scopes = ScopeSet::new(["https://graph.microsoft.com/.default"])?;
	let first = acquirer.acquire_token_for_app(&scopes, AcquireTokenOptions::default()).await?;
	let second = acquirer.acquire_token_for_app(&scopes, AcquireTokenOptions::default()).await?;

	println!("Access token {} expires on {}.", first.access_token.expose(), first.expires_on);
	println!("Cached result reused: {}.", first == second);

	token_mock.assert_async().await;

	Ok(())
}
