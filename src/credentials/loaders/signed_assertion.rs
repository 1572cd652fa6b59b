//! Signed assertions read from files or produced by host-registered providers.

// std
use std::{env, path::PathBuf};
// crates.io
use tokio::fs;
// self
use crate::{
	_prelude::*,
	credentials::{
		CredentialDescriptor, CredentialSource, CredentialSourceLoader, FEDERATED_TOKEN_FILE_ENV,
		LoadError, LoadFuture, LoaderParameters, ResolvedCredential, SignedAssertion,
		SignedAssertionProvider, loaders::certificate::unsupported,
	},
};

/// Reads [`CredentialSource::SignedAssertionFilePath`] assertions (projected workload
/// identity tokens). The file is re-read whenever the cached assertion expires.
#[derive(Clone, Debug, Default)]
pub struct SignedAssertionFileLoader;
impl CredentialSourceLoader for SignedAssertionFileLoader {
	fn load<'a>(
		&'a self,
		descriptor: &'a CredentialDescriptor,
		_: &'a LoaderParameters,
	) -> LoadFuture<'a, ResolvedCredential> {
		Box::pin(async move {
			let CredentialSource::SignedAssertionFilePath { path } = descriptor.source() else {
				return Err(unsupported(descriptor, "SignedAssertionFileLoader"));
			};
			let path = match path {
				Some(path) => path.clone(),
				None => env::var_os(FEDERATED_TOKEN_FILE_ENV).map(PathBuf::from).ok_or_else(|| {
					LoadError::not_found(format!("{FEDERATED_TOKEN_FILE_ENV} is not set"))
				})?,
			};
			let raw = fs::read_to_string(&path).await.map_err(|e| LoadError::from_io(&path, e))?;
			let token = raw.trim();

			if token.is_empty() {
				return Err(LoadError::malformed(format!("{} is empty", path.display())));
			}

			Ok(ResolvedCredential::SignedAssertion(SignedAssertion::new(token)))
		})
	}
}

/// Dispatches [`CredentialSource::CustomSignedAssertion`] to providers registered by name.
#[derive(Clone, Default)]
pub struct CustomSignedAssertionLoader {
	providers: BTreeMap<String, Arc<dyn SignedAssertionProvider>>,
}
impl CustomSignedAssertionLoader {
	/// Registers `provider` under `name`, replacing any previous registration.
	pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn SignedAssertionProvider>) -> Self {
		self.providers.insert(name.into(), provider);

		self
	}

	pub(crate) fn insert(&mut self, name: String, provider: Arc<dyn SignedAssertionProvider>) {
		self.providers.insert(name, provider);
	}
}
impl Debug for CustomSignedAssertionLoader {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CustomSignedAssertionLoader")
			.field("providers", &self.providers.keys().collect::<Vec<_>>())
			.finish()
	}
}
impl CredentialSourceLoader for CustomSignedAssertionLoader {
	fn load<'a>(
		&'a self,
		descriptor: &'a CredentialDescriptor,
		parameters: &'a LoaderParameters,
	) -> LoadFuture<'a, ResolvedCredential> {
		Box::pin(async move {
			let CredentialSource::CustomSignedAssertion { provider_name, provider_data } =
				descriptor.source()
			else {
				return Err(unsupported(descriptor, "CustomSignedAssertionLoader"));
			};
			let provider = self.providers.get(provider_name).ok_or_else(|| {
				LoadError::not_found(format!("No signed assertion provider is registered as `{provider_name}`"))
			})?;
			let assertion = provider.signed_assertion(provider_data, parameters).await?;

			Ok(ResolvedCredential::SignedAssertion(assertion))
		})
	}
}
