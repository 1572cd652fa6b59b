// std
use std::sync::atomic::{AtomicUsize, Ordering};
// self
use identity_broker::{
	_preludet::*,
	auth::{ClientId, CredentialId, ScopeSet, TenantId, TokenSecret},
	credentials::{
		CredentialDescriptor, CredentialLoadError, CredentialResolver, CredentialSourceLoader,
		LoadError, LoadFuture, LoaderParameters, ResolvedCredential, SourceType,
	},
	options::{AcquireTokenOptions, ApplicationOptions},
	store::{MemoryDistributedCache, TokenCacheStore, TokenCacheStoreOptions},
};

/// Path loader replacement that hands out a secret and counts its loads.
#[derive(Default)]
struct SecretFromPath {
	loads: AtomicUsize,
}
impl CredentialSourceLoader for SecretFromPath {
	fn load<'a>(
		&'a self,
		_descriptor: &'a CredentialDescriptor,
		parameters: &'a LoaderParameters,
	) -> LoadFuture<'a, ResolvedCredential> {
		Box::pin(async move {
			self.loads.fetch_add(1, Ordering::SeqCst);

			let client = parameters.client_id.as_ref().ok_or_else(|| LoadError::malformed("Client id is missing"))?;

			Ok(ResolvedCredential::ClientSecret(TokenSecret::new(format!("override-for-{client}"))))
		})
	}
}

fn named(descriptor: CredentialDescriptor, id: &str) -> CredentialDescriptor {
	descriptor.with_id(CredentialId::new(id).expect("Id fixture should be valid."))
}

fn acquirer_with(
	resolver: CredentialResolver,
	options: ApplicationOptions,
) -> (ScriptedAcquirer, ScriptedHttpClient) {
	let http = ScriptedHttpClient::default();
	let cache = TokenCacheStore::new(Arc::new(MemoryDistributedCache::default()), TokenCacheStoreOptions::default())
		.expect("Default cache options should be valid.");
	let acquirer = ScriptedAcquirer::with_http_client(
		options,
		Arc::new(cache),
		Arc::new(resolver),
		http.clone(),
		ScriptedTransportErrorMapper,
	);

	(acquirer, http)
}

fn base_options() -> ApplicationOptions {
	ApplicationOptions::new(ClientId::new("resolver-app").expect("Client id fixture should be valid."))
		.with_tenant(TenantId::new("tenant-r").expect("Tenant fixture should be valid."))
}

fn scopes() -> ScopeSet {
	ScopeSet::new(["api://resolver/.default"]).expect("Scope fixture should be valid.")
}

#[tokio::test]
async fn registered_loaders_take_precedence_over_builtins() {
	let loader = Arc::new(SecretFromPath::default());
	let resolver = CredentialResolver::with_http_client(
		Arc::new(ScriptedHttpClient::default()),
		Arc::new(ScriptedTransportErrorMapper),
	)
	.with_loader(SourceType::Path, loader.clone());
	let (acquirer, http) = acquirer_with(
		resolver,
		base_options().with_credential(CredentialDescriptor::from_path("/nonexistent/cert.pem", None)),
	);

	http.always(ScriptedResponse::token("override", 3600));

	acquirer
		.acquire_token_for_app(&scopes(), AcquireTokenOptions::default())
		.await
		.expect("Overriding loader should resolve the descriptor.");
	acquirer
		.acquire_token_for_app(&scopes(), AcquireTokenOptions::default().with_force_refresh(true))
		.await
		.expect("Resolved credentials should be reused.");

	let requests = http.requests();

	assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
	assert_eq!(requests.len(), 2);
	assert_eq!(requests[0].form.get("client_secret").map(String::as_str), Some("override-for-resolver-app"));
}

#[tokio::test]
async fn failing_descriptors_fall_back_in_order() {
	let resolver = CredentialResolver::with_http_client(
		Arc::new(ScriptedHttpClient::default()),
		Arc::new(ScriptedTransportErrorMapper),
	);
	let broken = named(CredentialDescriptor::from_path("/nonexistent/cert.pem", None), "broken");
	let certificate = named(test_certificate_descriptor(), "certificate");
	let (acquirer, http) =
		acquirer_with(resolver, base_options().with_credential(broken.clone()).with_credential(certificate));

	http.push(ScriptedResponse::token("fallback", 3600));

	acquirer
		.acquire_token_for_app(&scopes(), AcquireTokenOptions::default())
		.await
		.expect("Second descriptor should be used.");

	assert!(broken.is_skipped());
	assert!(http.requests()[0].form.contains_key("client_assertion"));
}

#[tokio::test]
async fn exhausted_lists_fail_before_any_request() {
	let resolver = CredentialResolver::with_http_client(
		Arc::new(ScriptedHttpClient::default()),
		Arc::new(ScriptedTransportErrorMapper),
	);
	let (acquirer, http) = acquirer_with(
		resolver,
		base_options()
			.with_credential(named(CredentialDescriptor::from_path("/nonexistent/a.pem", None), "first"))
			.with_credential(named(CredentialDescriptor::from_path("/nonexistent/b.pem", None), "second")),
	);
	let err = acquirer
		.acquire_token_for_app(&scopes(), AcquireTokenOptions::default())
		.await
		.expect_err("Unloadable lists should fail.");

	match err {
		Error::CredentialLoad(ref failure @ CredentialLoadError::Exhausted { .. }) => {
			let ids = failure.descriptor_ids().into_iter().map(ToString::to_string).collect::<Vec<_>>();

			assert_eq!(ids, ["first", "second"]);
		},
		other => panic!("Unexpected error: {other:?}."),
	}

	assert_eq!(http.calls(), 0);
}

#[tokio::test]
async fn missing_credentials_are_a_configuration_failure() {
	let resolver = CredentialResolver::with_http_client(
		Arc::new(ScriptedHttpClient::default()),
		Arc::new(ScriptedTransportErrorMapper),
	);
	let (acquirer, http) = acquirer_with(resolver, base_options());
	let err = acquirer
		.acquire_token_for_app(&scopes(), AcquireTokenOptions::default())
		.await
		.expect_err("Clients without credentials should fail.");

	assert!(matches!(err, Error::Config(identity_broker::error::ConfigError::MissingCredentials)));
	assert_eq!(http.calls(), 0);
}
