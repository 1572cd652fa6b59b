//! Declarative credential descriptions and their shared resolution state.

// std
use std::path::PathBuf;
// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::Algorithm;
use sha2::{Digest, Sha256};
// self
use crate::{
	_prelude::*,
	auth::{CredentialId, TokenSecret},
	credentials::{CertificateMaterial, LoadError, ResolvedCredential},
};

/// Environment variable naming the projected workload identity token file.
pub const FEDERATED_TOKEN_FILE_ENV: &str = "AZURE_FEDERATED_TOKEN_FILE";

/// Discriminant of [`CredentialSource`]; keys the loader registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceType {
	/// Certificate material supplied by code.
	Certificate,
	/// Certificate stored as a Key Vault secret.
	KeyVault,
	/// Base64-encoded PEM bundle.
	Base64Encoded,
	/// PEM bundle on disk.
	Path,
	/// Directory store entry selected by SHA-256 thumbprint.
	StoreWithThumbprint,
	/// Directory store entry selected by subject distinguished name.
	StoreWithDistinguishedName,
	/// Shared client secret.
	ClientSecret,
	/// Assertion minted by a managed identity.
	SignedAssertionFromManagedIdentity,
	/// Assertion read from a file (workload identity).
	SignedAssertionFilePath,
	/// Assertion produced by a named [`SignedAssertionProvider`](crate::credentials::SignedAssertionProvider).
	CustomSignedAssertion,
}
impl SourceType {
	/// Stable name used in generated descriptor ids and logs.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Certificate => "Certificate",
			Self::KeyVault => "KeyVault",
			Self::Base64Encoded => "Base64Encoded",
			Self::Path => "Path",
			Self::StoreWithThumbprint => "StoreWithThumbprint",
			Self::StoreWithDistinguishedName => "StoreWithDistinguishedName",
			Self::ClientSecret => "ClientSecret",
			Self::SignedAssertionFromManagedIdentity => "SignedAssertionFromManagedIdentity",
			Self::SignedAssertionFilePath => "SignedAssertionFilePath",
			Self::CustomSignedAssertion => "CustomSignedAssertion",
		}
	}
}
impl Display for SourceType {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Where a credential comes from. Exactly one source per descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source_type")]
pub enum CredentialSource {
	/// In-memory certificate; cannot be expressed in configuration files.
	#[serde(skip)]
	Certificate(Arc<CertificateMaterial>),
	/// Key Vault secret holding a PEM bundle.
	KeyVault {
		/// Vault base URL.
		vault_url: Url,
		/// Certificate (secret) name.
		certificate_name: String,
	},
	/// Base64-encoded PEM bundle.
	Base64Encoded {
		/// Encoded bundle.
		value: TokenSecret,
		/// Password that decrypts an `ENCRYPTED PRIVATE KEY` block in the bundle.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		password: Option<TokenSecret>,
	},
	/// PEM bundle on disk.
	Path {
		/// Bundle location.
		path: PathBuf,
		/// Password that decrypts an `ENCRYPTED PRIVATE KEY` block in the bundle.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		password: Option<TokenSecret>,
	},
	/// Directory store searched by thumbprint.
	StoreWithThumbprint {
		/// Directory holding `.pem` bundles.
		store: PathBuf,
		/// Hex SHA-256 thumbprint of the leaf certificate.
		thumbprint: String,
	},
	/// Directory store searched by subject.
	StoreWithDistinguishedName {
		/// Directory holding `.pem` bundles.
		store: PathBuf,
		/// Subject distinguished name, e.g. `CN=app, O=Contoso`.
		distinguished_name: String,
	},
	/// Shared client secret.
	ClientSecret {
		/// Secret value.
		secret: TokenSecret,
	},
	/// Managed identity token for `api://AzureADTokenExchange`.
	SignedAssertionFromManagedIdentity {
		/// User-assigned identity client id; system-assigned when absent.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		managed_identity_client_id: Option<String>,
	},
	/// Assertion file (workload identity).
	SignedAssertionFilePath {
		/// File location; defaults to `AZURE_FEDERATED_TOKEN_FILE`.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		path: Option<PathBuf>,
	},
	/// Assertion from a registered provider.
	CustomSignedAssertion {
		/// Registered provider name.
		provider_name: String,
		/// Provider-specific settings.
		#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
		provider_data: BTreeMap<String, String>,
	},
}
impl CredentialSource {
	/// Discriminant of this source.
	pub fn source_type(&self) -> SourceType {
		match self {
			Self::Certificate(_) => SourceType::Certificate,
			Self::KeyVault { .. } => SourceType::KeyVault,
			Self::Base64Encoded { .. } => SourceType::Base64Encoded,
			Self::Path { .. } => SourceType::Path,
			Self::StoreWithThumbprint { .. } => SourceType::StoreWithThumbprint,
			Self::StoreWithDistinguishedName { .. } => SourceType::StoreWithDistinguishedName,
			Self::ClientSecret { .. } => SourceType::ClientSecret,
			Self::SignedAssertionFromManagedIdentity { .. } =>
				SourceType::SignedAssertionFromManagedIdentity,
			Self::SignedAssertionFilePath { .. } => SourceType::SignedAssertionFilePath,
			Self::CustomSignedAssertion { .. } => SourceType::CustomSignedAssertion,
		}
	}

	/// Non-secret reference used to derive a descriptor id.
	fn id_reference(&self) -> String {
		match self {
			Self::Certificate(material) => material.thumbprint_hex(),
			Self::KeyVault { vault_url, certificate_name } =>
				format!("{}/{certificate_name}", vault_url.as_str().trim_end_matches('/')),
			Self::Path { path, .. } => path.display().to_string(),
			Self::StoreWithThumbprint { store, thumbprint } =>
				format!("{}/{thumbprint}", store.display()),
			Self::StoreWithDistinguishedName { store, distinguished_name } =>
				format!("{}/{distinguished_name}", store.display()),
			Self::Base64Encoded { value, .. } => short_fingerprint(value.expose()),
			Self::ClientSecret { secret } => short_fingerprint(secret.expose()),
			Self::SignedAssertionFromManagedIdentity { managed_identity_client_id } =>
				managed_identity_client_id.clone().unwrap_or_else(|| "system".into()),
			Self::SignedAssertionFilePath { path } => path
				.as_ref()
				.map(|path| path.display().to_string())
				.unwrap_or_else(|| FEDERATED_TOKEN_FILE_ENV.into()),
			Self::CustomSignedAssertion { provider_name, .. } => provider_name.clone(),
		}
	}
}

/// Serializable form of a [`CredentialDescriptor`], as found in configuration.
///
/// ```json
/// { "source_type": "KeyVault", "vault_url": "https://vault.example/", "certificate_name": "app" }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialDescription {
	/// Diagnostics identity; generated from the source when absent.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<CredentialId>,
	/// Credential source.
	#[serde(flatten)]
	pub source: CredentialSource,
	/// JWS algorithm for certificate assertions (`RS256` when absent).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub algorithm: Option<Algorithm>,
}

#[derive(Debug, Default)]
struct ResolutionSlot {
	resolved: Option<ResolvedCredential>,
	skip: bool,
	last_failure: Option<LoadError>,
	generation: u64,
}

#[derive(Debug, Default)]
struct DescriptorState {
	load_lock: AsyncMutex<()>,
	slot: Mutex<ResolutionSlot>,
}

/// One credential source plus its resolution state.
///
/// Clones share the resolved value, skip flag, and single-flight lock, so a descriptor
/// list can be cloned out of configuration without defeating single-flight loading.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "CredentialDescription", into = "CredentialDescription")]
pub struct CredentialDescriptor {
	id: CredentialId,
	explicit_id: bool,
	source: CredentialSource,
	algorithm: Option<Algorithm>,
	state: Arc<DescriptorState>,
}
impl CredentialDescriptor {
	/// Descriptor for `source` with a generated id.
	pub fn new(source: CredentialSource) -> Self {
		let id = generated_id(&source);
		let state = DescriptorState::default();

		if let CredentialSource::Certificate(material) = &source {
			state.slot.lock().resolved = Some(ResolvedCredential::Certificate(material.clone()));
		}

		Self { id, explicit_id: false, source, algorithm: None, state: Arc::new(state) }
	}

	/// Certificate supplied by code; resolved from the start.
	pub fn from_certificate(material: CertificateMaterial) -> Self {
		Self::new(CredentialSource::Certificate(Arc::new(material)))
	}

	/// PEM bundle on disk.
	pub fn from_path(path: impl Into<PathBuf>, password: Option<String>) -> Self {
		Self::new(CredentialSource::Path { path: path.into(), password: password.map(TokenSecret::new) })
	}

	/// Base64-encoded PEM bundle.
	pub fn from_base64(value: impl Into<String>, password: Option<String>) -> Self {
		Self::new(CredentialSource::Base64Encoded {
			value: TokenSecret::new(value),
			password: password.map(TokenSecret::new),
		})
	}

	/// Key Vault certificate.
	pub fn from_key_vault(vault_url: Url, certificate_name: impl Into<String>) -> Self {
		Self::new(CredentialSource::KeyVault { vault_url, certificate_name: certificate_name.into() })
	}

	/// Directory store entry selected by thumbprint.
	pub fn from_store_thumbprint(store: impl Into<PathBuf>, thumbprint: impl Into<String>) -> Self {
		Self::new(CredentialSource::StoreWithThumbprint {
			store: store.into(),
			thumbprint: thumbprint.into(),
		})
	}

	/// Directory store entry selected by subject distinguished name.
	pub fn from_store_distinguished_name(
		store: impl Into<PathBuf>,
		distinguished_name: impl Into<String>,
	) -> Self {
		Self::new(CredentialSource::StoreWithDistinguishedName {
			store: store.into(),
			distinguished_name: distinguished_name.into(),
		})
	}

	/// Shared client secret.
	pub fn from_client_secret(secret: impl Into<String>) -> Self {
		Self::new(CredentialSource::ClientSecret { secret: TokenSecret::new(secret) })
	}

	/// Managed identity assertion (system-assigned when `client_id` is absent).
	pub fn from_managed_identity(client_id: Option<String>) -> Self {
		Self::new(CredentialSource::SignedAssertionFromManagedIdentity {
			managed_identity_client_id: client_id,
		})
	}

	/// Assertion file; `None` reads `AZURE_FEDERATED_TOKEN_FILE` at load time.
	pub fn from_signed_assertion_file(path: Option<PathBuf>) -> Self {
		Self::new(CredentialSource::SignedAssertionFilePath { path })
	}

	/// Assertion produced by the provider registered under `provider_name`.
	pub fn from_custom_signed_assertion(
		provider_name: impl Into<String>,
		provider_data: BTreeMap<String, String>,
	) -> Self {
		Self::new(CredentialSource::CustomSignedAssertion {
			provider_name: provider_name.into(),
			provider_data,
		})
	}

	/// Overrides the generated id.
	pub fn with_id(mut self, id: CredentialId) -> Self {
		self.id = id;
		self.explicit_id = true;

		self
	}

	/// Sets the JWS algorithm for certificate assertions.
	pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
		self.algorithm = Some(algorithm);

		self
	}

	/// Diagnostics identity.
	pub fn id(&self) -> &CredentialId {
		&self.id
	}

	/// Configured source.
	pub fn source(&self) -> &CredentialSource {
		&self.source
	}

	/// Discriminant of the configured source.
	pub fn source_type(&self) -> SourceType {
		self.source.source_type()
	}

	/// JWS algorithm for certificate assertions.
	pub fn algorithm(&self) -> Algorithm {
		self.algorithm.unwrap_or(Algorithm::RS256)
	}

	/// Location of the source (vault URL, file path, or store path), when it has one.
	pub fn container(&self) -> Option<String> {
		match &self.source {
			CredentialSource::KeyVault { vault_url, .. } => Some(vault_url.to_string()),
			CredentialSource::Path { path, .. } => Some(path.display().to_string()),
			CredentialSource::StoreWithThumbprint { store, .. }
			| CredentialSource::StoreWithDistinguishedName { store, .. } =>
				Some(store.display().to_string()),
			_ => None,
		}
	}

	/// Reference inside the container, or the inline value (secrets included).
	pub fn reference_or_value(&self) -> Option<String> {
		match &self.source {
			CredentialSource::KeyVault { certificate_name, .. } => Some(certificate_name.clone()),
			CredentialSource::Path { password, .. } =>
				password.as_ref().map(|password| password.expose().to_owned()),
			CredentialSource::StoreWithThumbprint { thumbprint, .. } => Some(thumbprint.clone()),
			CredentialSource::StoreWithDistinguishedName { distinguished_name, .. } =>
				Some(distinguished_name.clone()),
			CredentialSource::Base64Encoded { value, .. } => Some(value.expose().to_owned()),
			CredentialSource::ClientSecret { secret } => Some(secret.expose().to_owned()),
			CredentialSource::SignedAssertionFromManagedIdentity { managed_identity_client_id } =>
				managed_identity_client_id.clone(),
			CredentialSource::SignedAssertionFilePath { path } =>
				path.as_ref().map(|path| path.display().to_string()),
			CredentialSource::CustomSignedAssertion { provider_name, .. } =>
				Some(provider_name.clone()),
			CredentialSource::Certificate(_) => None,
		}
	}

	/// Resolved value, when present and still usable.
	pub fn resolved(&self) -> Option<ResolvedCredential> {
		self.resolved_at(OffsetDateTime::now_utc())
	}

	/// Returns true when a usable value is cached.
	pub fn is_resolved(&self) -> bool {
		self.resolved().is_some()
	}

	/// Returns true when the last attempt failed and list fallback skips this descriptor.
	pub fn is_skipped(&self) -> bool {
		self.state.slot.lock().skip
	}

	/// Most recent load failure.
	pub fn last_failure(&self) -> Option<LoadError> {
		self.state.slot.lock().last_failure.clone()
	}

	/// Returns true when both handles share the same resolution state.
	pub fn same_instance(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.state, &other.state)
	}

	pub(crate) fn resolved_at(&self, instant: OffsetDateTime) -> Option<ResolvedCredential> {
		self.state.slot.lock().resolved.as_ref().filter(|value| value.is_usable_at(instant)).cloned()
	}

	pub(crate) fn generation(&self) -> u64 {
		self.state.slot.lock().generation
	}

	pub(crate) fn load_lock(&self) -> &AsyncMutex<()> {
		&self.state.load_lock
	}

	pub(crate) fn finish_load(&self, outcome: &Result<ResolvedCredential, LoadError>) {
		let mut slot = self.state.slot.lock();

		slot.generation += 1;

		match outcome {
			Ok(value) => {
				slot.resolved = Some(value.clone());
				slot.last_failure = None;
				slot.skip = false;
			},
			Err(e) => {
				slot.resolved = None;
				slot.last_failure = Some(e.clone());
			},
		}
	}

	pub(crate) fn mark_skipped(&self) {
		self.state.slot.lock().skip = true;
	}

	pub(crate) fn clear_skip(&self) {
		self.state.slot.lock().skip = false;
	}

	/// Drops the resolved value so the next use reloads it. Code-supplied certificates keep
	/// their material.
	pub(crate) fn invalidate(&self) {
		let mut slot = self.state.slot.lock();

		slot.generation += 1;
		slot.skip = false;
		slot.last_failure = None;

		if !matches!(self.source, CredentialSource::Certificate(_)) {
			slot.resolved = None;
		}
	}
}
impl Debug for CredentialDescriptor {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let slot = self.state.slot.lock();

		f.debug_struct("CredentialDescriptor")
			.field("id", &self.id)
			.field("source_type", &self.source_type())
			.field("resolved", &slot.resolved.is_some())
			.field("skip", &slot.skip)
			.finish()
	}
}
impl From<CredentialDescription> for CredentialDescriptor {
	fn from(description: CredentialDescription) -> Self {
		let CredentialDescription { id, source, algorithm } = description;
		let mut descriptor = Self::new(source);

		descriptor.algorithm = algorithm;

		match id {
			Some(id) => descriptor.with_id(id),
			None => descriptor,
		}
	}
}
impl From<CredentialDescriptor> for CredentialDescription {
	fn from(descriptor: CredentialDescriptor) -> Self {
		Self {
			id: descriptor.explicit_id.then_some(descriptor.id),
			source: descriptor.source,
			algorithm: descriptor.algorithm,
		}
	}
}

fn generated_id(source: &CredentialSource) -> CredentialId {
	CredentialId::sanitized(&format!("{}:{}", source.source_type(), source.id_reference()))
}

fn short_fingerprint(value: &str) -> String {
	let digest = Sha256::digest(value.as_bytes());

	URL_SAFE_NO_PAD.encode(&digest[..9])
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn descriptions_deserialize_by_source_type() {
		let json = r#"[
			{ "source_type": "KeyVault", "vault_url": "https://vault.example/", "certificate_name": "app-cert" },
			{ "source_type": "ClientSecret", "secret": "s3cret", "id": "primary-secret" },
			{ "source_type": "SignedAssertionFromManagedIdentity" },
			{ "source_type": "Path", "path": "/etc/broker/app.pem", "algorithm": "PS256" }
		]"#;
		let descriptors = serde_json::from_str::<Vec<CredentialDescriptor>>(json)
			.expect("Descriptor list should deserialize.");

		assert_eq!(descriptors[0].id().as_ref(), "KeyVault:https://vault.example/app-cert");
		assert_eq!(descriptors[0].container().as_deref(), Some("https://vault.example/"));
		assert_eq!(descriptors[0].reference_or_value().as_deref(), Some("app-cert"));
		assert_eq!(descriptors[1].id().as_ref(), "primary-secret");
		assert_eq!(descriptors[1].reference_or_value().as_deref(), Some("s3cret"));
		assert_eq!(descriptors[2].id().as_ref(), "SignedAssertionFromManagedIdentity:system");
		assert_eq!(descriptors[3].algorithm(), Algorithm::PS256);
		assert_eq!(descriptors[3].source_type(), SourceType::Path);
	}

	#[test]
	fn generated_ids_never_leak_secrets() {
		let descriptor = CredentialDescriptor::from_client_secret("very secret value");
		let rendered = format!("{descriptor:?} {}", descriptor.id());

		assert!(descriptor.id().starts_with("ClientSecret:"));
		assert!(!rendered.contains("very secret value"));
	}

	#[test]
	fn explicit_ids_round_trip_and_generated_ids_stay_implicit() {
		let explicit = CredentialDescriptor::from_client_secret("s")
			.with_id(CredentialId::new("named").expect("Id fixture should be valid."));
		let json = serde_json::to_value(&explicit).expect("Descriptor should serialize.");

		assert_eq!(json["id"], "named");
		assert_eq!(json["source_type"], "ClientSecret");

		let implicit = serde_json::to_value(CredentialDescriptor::from_managed_identity(None))
			.expect("Descriptor should serialize.");

		assert!(implicit.get("id").is_none());
	}

	#[test]
	fn clones_share_resolution_state() {
		let descriptor = CredentialDescriptor::from_client_secret("s");
		let clone = descriptor.clone();

		descriptor.finish_load(&Ok(ResolvedCredential::ClientSecret(TokenSecret::new("s"))));

		assert!(clone.is_resolved());
		assert!(clone.same_instance(&descriptor));
		assert!(!CredentialDescriptor::from_client_secret("s").same_instance(&descriptor));

		clone.mark_skipped();
		descriptor.invalidate();

		assert!(!clone.is_resolved());
		assert!(!clone.is_skipped());
	}
}
