//! Certificate loaders for disk paths, base64 blobs, and directory stores.

// std
use std::path::Path;
// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD};
use tokio::fs;
// self
use crate::{
	_prelude::*,
	auth::TokenSecret,
	credentials::{
		CertificateMaterial, CredentialDescriptor, CredentialSource, CredentialSourceLoader,
		LoadError, LoadFuture, LoaderParameters, ResolvedCredential, x509,
	},
};

const STORE_EXTENSIONS: [&str; 3] = ["pem", "crt", "cer"];

/// Parses a PEM bundle, decrypting its key with `password` when it is encrypted, and
/// rejects certificates outside their validity window.
pub fn certificate_from_pem(
	pem: &[u8],
	password: Option<&TokenSecret>,
	now: OffsetDateTime,
) -> Result<CertificateMaterial, LoadError> {
	let material = CertificateMaterial::from_pem(pem, password)?;

	material.ensure_valid_at(now)?;

	Ok(material)
}

/// Loads [`CredentialSource::Path`] bundles.
#[derive(Clone, Debug, Default)]
pub struct PathCertificateLoader;
impl CredentialSourceLoader for PathCertificateLoader {
	fn load<'a>(
		&'a self,
		descriptor: &'a CredentialDescriptor,
		_: &'a LoaderParameters,
	) -> LoadFuture<'a, ResolvedCredential> {
		Box::pin(async move {
			let CredentialSource::Path { path, password } = descriptor.source() else {
				return Err(unsupported(descriptor, "PathCertificateLoader"));
			};
			let pem = fs::read(path).await.map_err(|e| LoadError::from_io(path, e))?;
			let material = certificate_from_pem(&pem, password.as_ref(), OffsetDateTime::now_utc())?;

			Ok(ResolvedCredential::Certificate(Arc::new(material)))
		})
	}
}

/// Loads [`CredentialSource::Base64Encoded`] bundles.
#[derive(Clone, Debug, Default)]
pub struct Base64CertificateLoader;
impl CredentialSourceLoader for Base64CertificateLoader {
	fn load<'a>(
		&'a self,
		descriptor: &'a CredentialDescriptor,
		_: &'a LoaderParameters,
	) -> LoadFuture<'a, ResolvedCredential> {
		Box::pin(async move {
			let CredentialSource::Base64Encoded { value, password } = descriptor.source() else {
				return Err(unsupported(descriptor, "Base64CertificateLoader"));
			};
			let compact = value.expose().split_whitespace().collect::<String>();
			let pem = STANDARD
				.decode(compact.as_bytes())
				.map_err(|e| LoadError::malformed(format!("Certificate blob is not base64: {e}")))?;
			let material = certificate_from_pem(&pem, password.as_ref(), OffsetDateTime::now_utc())?;

			Ok(ResolvedCredential::Certificate(Arc::new(material)))
		})
	}
}

/// Searches a directory of PEM bundles by thumbprint or subject.
///
/// Among several matches the certificate that is valid now and expires last wins.
#[derive(Clone, Debug, Default)]
pub struct StoreCertificateLoader;
impl StoreCertificateLoader {
	async fn find(
		&self,
		store: &Path,
		matches: impl Fn(&CertificateMaterial) -> bool,
	) -> Result<CertificateMaterial, LoadError> {
		let now = OffsetDateTime::now_utc();
		let mut entries = fs::read_dir(store).await.map_err(|e| LoadError::from_io(store, e))?;
		let mut candidates = Vec::new();
		let mut expired = 0_usize;

		while let Some(entry) = entries.next_entry().await.map_err(|e| LoadError::from_io(store, e))? {
			let path = entry.path();
			let has_pem_extension = path
				.extension()
				.and_then(|ext| ext.to_str())
				.is_some_and(|ext| STORE_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)));

			if !has_pem_extension {
				continue;
			}

			let material = match fs::read(&path)
				.await
				.map_err(|e| LoadError::from_io(&path, e))
				.and_then(|pem| CertificateMaterial::from_pem(&pem, None))
			{
				Ok(material) => material,
				Err(e) => {
					tracing::debug!(path = %path.display(), error = %e, "Ignoring unreadable store entry.");

					continue;
				},
			};

			if !matches(&material) {
				continue;
			}
			if material.is_valid_at(now) {
				candidates.push(material);
			} else {
				expired += 1;
			}
		}

		if let Some(best) = candidates.into_iter().max_by_key(CertificateMaterial::not_after) {
			return Ok(best);
		}
		if expired > 0 {
			return Err(LoadError::malformed(format!(
				"{expired} matching certificate(s) in {} are outside their validity window",
				store.display()
			)));
		}

		Err(LoadError::not_found(format!("No matching certificate in {}", store.display())))
	}
}
impl CredentialSourceLoader for StoreCertificateLoader {
	fn load<'a>(
		&'a self,
		descriptor: &'a CredentialDescriptor,
		_: &'a LoaderParameters,
	) -> LoadFuture<'a, ResolvedCredential> {
		Box::pin(async move {
			let material = match descriptor.source() {
				CredentialSource::StoreWithThumbprint { store, thumbprint } => {
					let wanted = normalize_thumbprint(thumbprint);

					self.find(store, |material| material.thumbprint_hex() == wanted).await?
				},
				CredentialSource::StoreWithDistinguishedName { store, distinguished_name } => {
					let mut wanted = x509::normalize_dn(distinguished_name);

					wanted.sort();

					self.find(store, |material| {
						let mut subject = x509::normalize_dn(material.subject());

						subject.sort();

						subject == wanted
					})
					.await?
				},
				_ => return Err(unsupported(descriptor, "StoreCertificateLoader")),
			};

			Ok(ResolvedCredential::Certificate(Arc::new(material)))
		})
	}
}

/// Rejection for descriptors routed to the wrong loader.
pub(crate) fn unsupported(descriptor: &CredentialDescriptor, loader: &str) -> LoadError {
	LoadError::malformed(format!("{loader} cannot load {} sources", descriptor.source_type()))
}

fn normalize_thumbprint(thumbprint: &str) -> String {
	thumbprint.chars().filter(char::is_ascii_hexdigit).collect::<String>().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
	// std
	use std::path::PathBuf;
	// self
	use super::*;

	const ROTATED_THUMBPRINT: &str =
		"e4:9f:e9:e0:48:a1:a7:6b:5a:62:12:32:3b:0d:0b:94:46:5e:f4:b4:82:6d:de:53:46:1f:17:3d:c9:f9:55:02";

	fn fixtures() -> PathBuf {
		Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
	}

	async fn load(
		loader: &dyn CredentialSourceLoader,
		descriptor: &CredentialDescriptor,
	) -> Result<ResolvedCredential, LoadError> {
		loader.load(descriptor, &LoaderParameters::default()).await
	}

	fn subject(resolved: &ResolvedCredential) -> Vec<String> {
		x509::normalize_dn(resolved.certificate().expect("Loader should yield a certificate.").subject())
	}

	#[tokio::test]
	async fn path_loader_reads_bundles_and_reports_missing_files() {
		let found = load(
			&PathCertificateLoader,
			&CredentialDescriptor::from_path(fixtures().join("client-cert.pem"), None),
		)
		.await
		.expect("Fixture bundle should load.");

		assert_eq!(subject(&found), ["CN=broker-test-1", "O=identity broker tests"]);

		let missing =
			load(&PathCertificateLoader, &CredentialDescriptor::from_path(fixtures().join("nope.pem"), None))
				.await;

		assert!(matches!(missing, Err(LoadError::NotFound { .. })));
	}

	#[tokio::test]
	async fn path_loader_decrypts_password_protected_bundles() {
		let encrypted = fixtures().join("client-cert-encrypted.pem");
		let found = load(
			&PathCertificateLoader,
			&CredentialDescriptor::from_path(encrypted.clone(), Some("broker-fixture-pass".into())),
		)
		.await
		.expect("Password should unlock the bundle.");

		assert_eq!(subject(&found), ["CN=broker-test-1", "O=identity broker tests"]);

		let without_password =
			load(&PathCertificateLoader, &CredentialDescriptor::from_path(encrypted, None)).await;

		assert!(matches!(without_password, Err(LoadError::Malformed { .. })));
	}

	#[tokio::test]
	async fn base64_loader_passes_the_password_through() {
		let pem = std::fs::read(fixtures().join("client-cert-encrypted.pem"))
			.expect("Fixture should be readable.");
		let found = load(
			&Base64CertificateLoader,
			&CredentialDescriptor::from_base64(STANDARD.encode(pem), Some("broker-fixture-pass".into())),
		)
		.await
		.expect("Encoded encrypted fixture should load.");

		assert_eq!(subject(&found), ["CN=broker-test-1", "O=identity broker tests"]);
	}

	#[tokio::test]
	async fn base64_loader_decodes_wrapped_blobs() {
		let pem = std::fs::read(fixtures().join("client-cert-rotated.pem")).expect("Fixture should be readable.");
		let encoded = STANDARD.encode(pem);
		let wrapped = encoded.as_bytes().chunks(76).map(|c| String::from_utf8_lossy(c).into_owned()).collect::<Vec<_>>().join("\n");
		let found = load(&Base64CertificateLoader, &CredentialDescriptor::from_base64(wrapped, None))
			.await
			.expect("Encoded fixture should load.");

		assert_eq!(subject(&found), ["CN=broker-test-2", "O=identity broker tests"]);

		let garbage = load(&Base64CertificateLoader, &CredentialDescriptor::from_base64("%%%", None)).await;

		assert!(matches!(garbage, Err(LoadError::Malformed { .. })));
	}

	#[tokio::test]
	async fn store_loader_matches_thumbprints_and_subjects_in_any_order() {
		let store = fixtures().join("store");
		let by_thumbprint =
			load(&StoreCertificateLoader, &CredentialDescriptor::from_store_thumbprint(&store, ROTATED_THUMBPRINT))
				.await
				.expect("Rotated certificate should be found by thumbprint.");

		assert_eq!(subject(&by_thumbprint), ["CN=broker-test-2", "O=identity broker tests"]);

		let by_subject = load(
			&StoreCertificateLoader,
			&CredentialDescriptor::from_store_distinguished_name(&store, "o=identity broker tests, cn=BROKER-TEST-1"),
		)
		.await
		.expect("Primary certificate should be found by subject.");

		assert_eq!(subject(&by_subject), ["CN=broker-test-1", "O=identity broker tests"]);

		let unknown =
			load(&StoreCertificateLoader, &CredentialDescriptor::from_store_thumbprint(&store, "00FF")).await;

		assert!(matches!(unknown, Err(LoadError::NotFound { .. })));
	}

	#[tokio::test]
	async fn loaders_reject_foreign_sources() {
		let result = load(&PathCertificateLoader, &CredentialDescriptor::from_client_secret("s")).await;

		assert!(matches!(result, Err(LoadError::Malformed { .. })));
	}
}
