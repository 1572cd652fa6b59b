//! Loader contracts: one [`CredentialSourceLoader`] per [`SourceType`](crate::credentials::SourceType).

// self
use crate::{
	_prelude::*,
	auth::ClientId,
	credentials::{CredentialDescriptor, LoadError, ResolvedCredential, SignedAssertion},
};

/// Boxed future returned by loaders and assertion providers.
pub type LoadFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LoadError>> + 'a + Send>>;

/// Context handed to loaders alongside the descriptor.
#[derive(Clone, Debug, Default)]
pub struct LoaderParameters {
	/// Client the credential will authenticate.
	pub client_id: Option<ClientId>,
	/// Token endpoint the credential will be presented to.
	pub token_endpoint: Option<Url>,
}
impl LoaderParameters {
	/// Sets the client id.
	pub fn with_client_id(mut self, client_id: ClientId) -> Self {
		self.client_id = Some(client_id);

		self
	}

	/// Sets the token endpoint.
	pub fn with_token_endpoint(mut self, token_endpoint: Url) -> Self {
		self.token_endpoint = Some(token_endpoint);

		self
	}
}

/// Populates a descriptor's resolved value from its source.
///
/// Loaders do not touch descriptor state; the resolver records the outcome.
pub trait CredentialSourceLoader
where
	Self: Send + Sync,
{
	/// Loads the credential described by `descriptor`.
	fn load<'a>(
		&'a self,
		descriptor: &'a CredentialDescriptor,
		parameters: &'a LoaderParameters,
	) -> LoadFuture<'a, ResolvedCredential>;
}

/// Host-supplied source of signed client assertions, registered by name.
pub trait SignedAssertionProvider
where
	Self: Send + Sync,
{
	/// Produces an assertion using the descriptor's `provider_data`.
	fn signed_assertion<'a>(
		&'a self,
		provider_data: &'a BTreeMap<String, String>,
		parameters: &'a LoaderParameters,
	) -> LoadFuture<'a, SignedAssertion>;
}
