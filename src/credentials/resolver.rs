//! Single-flight credential resolution, ordered fallback, and rotation notifications.

// self
use crate::{
	_prelude::*,
	auth::CredentialId,
	credentials::{
		CredentialDescriptor, CredentialLoadError, CredentialSource, CredentialSourceLoader,
		LoadError, LoaderParameters, ResolvedCredential, SignedAssertionProvider, SourceType,
		loaders::{
			Base64CertificateLoader, CustomSignedAssertionLoader, KeyVaultCertificateLoader,
			ManagedIdentityAssertionLoader, ManagedIdentityClient, ManagedIdentityVaultTokenSource,
			PathCertificateLoader, SignedAssertionFileLoader, StoreCertificateLoader,
		},
	},
	error::{ConfigError, cancellable},
	http::TokenHttpClient,
	oauth::TransportErrorMapper,
};
#[cfg(feature = "reqwest")]
use crate::{http::ReqwestHttpClient, oauth::ReqwestTransportErrorMapper};

/// Receives credential selection changes for credential lists.
pub trait CredentialObserver
where
	Self: Send + Sync,
{
	/// A different credential became the one in use.
	fn on_credential_selected(&self, descriptor: &CredentialDescriptor);

	/// No credential is in use any more (reset or exhausted list).
	fn on_credential_deselected(&self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Selection {
	descriptor_id: CredentialId,
	thumbprint: Option<String>,
}

/// Orchestrates loaders with per-descriptor single flight.
///
/// Concurrent callers for the same descriptor queue behind one load and observe its
/// outcome. Distinct descriptors load in parallel; the resolver holds no global lock.
pub struct CredentialResolver {
	loaders: HashMap<SourceType, Arc<dyn CredentialSourceLoader>>,
	custom: CustomSignedAssertionLoader,
	observers: RwLock<Vec<Arc<dyn CredentialObserver>>>,
	selections: Mutex<HashMap<String, Selection>>,
}
impl CredentialResolver {
	/// Resolver with the local loaders plus Key Vault and managed identity loaders that use
	/// `http_client`.
	pub fn with_http_client<C, M>(http_client: Arc<C>, error_mapper: Arc<M>) -> Self
	where
		C: ?Sized + TokenHttpClient,
		M: ?Sized + TransportErrorMapper<C::TransportError>,
	{
		let imds = ManagedIdentityClient::new(http_client.clone(), error_mapper.clone());
		let vault_tokens = Arc::new(ManagedIdentityVaultTokenSource::new(imds.clone()));
		let mut loaders = HashMap::<SourceType, Arc<dyn CredentialSourceLoader>>::new();
		let store = Arc::new(StoreCertificateLoader);

		loaders.insert(SourceType::Path, Arc::new(PathCertificateLoader));
		loaders.insert(SourceType::Base64Encoded, Arc::new(Base64CertificateLoader));
		loaders.insert(SourceType::StoreWithThumbprint, store.clone());
		loaders.insert(SourceType::StoreWithDistinguishedName, store);
		loaders.insert(
			SourceType::KeyVault,
			Arc::new(KeyVaultCertificateLoader::new(http_client, error_mapper, vault_tokens)),
		);
		loaders.insert(
			SourceType::SignedAssertionFromManagedIdentity,
			Arc::new(ManagedIdentityAssertionLoader::new(imds)),
		);
		loaders.insert(SourceType::SignedAssertionFilePath, Arc::new(SignedAssertionFileLoader));

		Self {
			loaders,
			custom: CustomSignedAssertionLoader::default(),
			observers: RwLock::new(Vec::new()),
			selections: Mutex::new(HashMap::new()),
		}
	}

	/// Resolver over the default reqwest transport.
	#[cfg(feature = "reqwest")]
	pub fn new() -> Result<Self> {
		Ok(Self::with_http_client(
			Arc::new(ReqwestHttpClient::new()?),
			Arc::new(ReqwestTransportErrorMapper),
		))
	}

	/// Registers `loader` for `source_type`, taking precedence over the built-in loader.
	pub fn with_loader(mut self, source_type: SourceType, loader: Arc<dyn CredentialSourceLoader>) -> Self {
		self.loaders.insert(source_type, loader);

		self
	}

	/// Registers a named provider for [`SourceType::CustomSignedAssertion`] descriptors.
	pub fn with_signed_assertion_provider(
		mut self,
		name: impl Into<String>,
		provider: Arc<dyn SignedAssertionProvider>,
	) -> Self {
		self.custom.insert(name.into(), provider);

		self
	}

	/// Subscribes `observer` to selection changes.
	pub fn subscribe(&self, observer: Arc<dyn CredentialObserver>) {
		self.observers.write().push(observer);
	}

	/// Resolves `descriptor` unless a usable value is cached.
	///
	/// Fails with [`CredentialLoadError::Descriptor`] when the loader fails, or
	/// [`Error::Cancelled`] when `cancel` fires first; cancellation releases the
	/// descriptor's load lock.
	pub async fn resolve_if_needed(
		&self,
		descriptor: &CredentialDescriptor,
		parameters: &LoaderParameters,
		cancel: &CancellationToken,
	) -> Result<ResolvedCredential> {
		let observed = descriptor.generation();

		if let Some(resolved) = descriptor.resolved() {
			return Ok(resolved);
		}

		cancellable(cancel, async {
			let _guard = descriptor.load_lock().lock().await;

			if let Some(resolved) = descriptor.resolved() {
				return Ok(resolved);
			}
			// Another caller finished a load while this one queued; share its failure.
			if descriptor.generation() != observed
				&& let Some(cause) = descriptor.last_failure()
			{
				return Err(descriptor_failure(descriptor, cause));
			}

			tracing::debug!(
				descriptor_id = %descriptor.id(),
				source_type = %descriptor.source_type(),
				"Loading credential."
			);

			let outcome = self.load(descriptor, parameters).await;

			descriptor.finish_load(&outcome);

			outcome.map_err(|cause| {
				tracing::warn!(descriptor_id = %descriptor.id(), error = %cause, "Credential load failed.");

				descriptor_failure(descriptor, cause)
			})
		})
		.await
	}

	/// Resolves the first loadable descriptor of `descriptors`, in order.
	///
	/// Failed descriptors are marked skipped and are not retried until [`reset`](Self::reset);
	/// a list whose descriptors are all skipped gets one fresh pass. Fails with
	/// [`CredentialLoadError::Exhausted`] listing every descriptor when none loads.
	pub async fn load_first_valid(
		&self,
		list_key: &str,
		descriptors: &[CredentialDescriptor],
		parameters: &LoaderParameters,
		cancel: &CancellationToken,
	) -> Result<(CredentialDescriptor, ResolvedCredential)> {
		if descriptors.is_empty() {
			return Err(ConfigError::MissingCredentials.into());
		}
		if descriptors.iter().all(CredentialDescriptor::is_skipped) {
			descriptors.iter().for_each(CredentialDescriptor::clear_skip);
		}

		let mut failures = Vec::with_capacity(descriptors.len());

		for descriptor in descriptors {
			if descriptor.is_skipped() {
				let cause = descriptor
					.last_failure()
					.unwrap_or_else(|| LoadError::not_found("Skipped after an earlier failure"));

				failures.push((descriptor.id().clone(), cause));

				continue;
			}

			match self.resolve_if_needed(descriptor, parameters, cancel).await {
				Ok(resolved) => {
					self.select(list_key, descriptor, &resolved);

					return Ok((descriptor.clone(), resolved));
				},
				Err(Error::CredentialLoad(CredentialLoadError::Descriptor { descriptor_id, cause })) => {
					descriptor.mark_skipped();
					failures.push((descriptor_id, cause));
				},
				Err(e) => return Err(e),
			}
		}

		self.deselect(list_key);

		Err(CredentialLoadError::Exhausted { list_key: list_key.to_owned(), failures }.into())
	}

	/// Drops resolved values and skip flags so the list reloads from its first descriptor.
	///
	/// Code-supplied certificates keep their material. Observers receive a deselection.
	pub fn reset(&self, list_key: &str, descriptors: &[CredentialDescriptor]) {
		tracing::info!(list_key, count = descriptors.len(), "Resetting credentials.");
		descriptors.iter().for_each(CredentialDescriptor::invalidate);
		self.deselect(list_key);
	}

	async fn load(
		&self,
		descriptor: &CredentialDescriptor,
		parameters: &LoaderParameters,
	) -> Result<ResolvedCredential, LoadError> {
		if let Some(loader) = self.loaders.get(&descriptor.source_type()) {
			return loader.load(descriptor, parameters).await;
		}

		match descriptor.source() {
			CredentialSource::ClientSecret { secret } => Ok(ResolvedCredential::ClientSecret(secret.clone())),
			CredentialSource::Certificate(material) => {
				material.ensure_valid_at(OffsetDateTime::now_utc())?;

				Ok(ResolvedCredential::Certificate(material.clone()))
			},
			CredentialSource::CustomSignedAssertion { .. } => self.custom.load(descriptor, parameters).await,
			_ => Err(LoadError::not_found(format!(
				"No loader is registered for {} sources",
				descriptor.source_type()
			))),
		}
	}

	fn select(&self, list_key: &str, descriptor: &CredentialDescriptor, resolved: &ResolvedCredential) {
		let selection = Selection {
			descriptor_id: descriptor.id().clone(),
			thumbprint: resolved.certificate().map(|material| material.thumbprint_hex()),
		};
		let changed = {
			let mut selections = self.selections.lock();

			if selections.get(list_key) == Some(&selection) {
				false
			} else {
				selections.insert(list_key.to_owned(), selection);

				true
			}
		};

		if changed {
			tracing::info!(list_key, descriptor_id = %descriptor.id(), "Credential selected.");

			let observers = self.observers.read().clone();

			for observer in observers {
				observer.on_credential_selected(descriptor);
			}
		}
	}

	fn deselect(&self, list_key: &str) {
		if self.selections.lock().remove(list_key).is_none() {
			return;
		}

		tracing::info!(list_key, "Credential deselected.");

		let observers = self.observers.read().clone();

		for observer in observers {
			observer.on_credential_deselected();
		}
	}
}
impl Debug for CredentialResolver {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CredentialResolver")
			.field("loaders", &self.loaders.keys().collect::<Vec<_>>())
			.field("custom", &self.custom)
			.field("observers", &self.observers.read().len())
			.finish()
	}
}

fn descriptor_failure(descriptor: &CredentialDescriptor, cause: LoadError) -> Error {
	CredentialLoadError::Descriptor { descriptor_id: descriptor.id().clone(), cause }.into()
}
