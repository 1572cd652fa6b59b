//! Resolved credential material: certificates with signing keys, client secrets, and
//! signed assertions.

// crates.io
use base64::{
	Engine as _,
	engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use jsonwebtoken::{DecodingKey, EncodingKey, Validation};
use pkcs8::{EncryptedPrivateKeyInfo, ObjectIdentifier, PrivateKeyInfo};
use sha2::{Digest, Sha256};
// self
use crate::{
	_prelude::*,
	auth::{EXPIRY_SAFETY_MARGIN, TokenSecret},
	credentials::{LoadError, x509},
};

/// Lifetime assumed for signed assertions whose expiry cannot be read.
pub const OPAQUE_ASSERTION_LIFETIME: Duration = Duration::minutes(10);

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// X.509 certificate chain plus the RSA key used to sign client assertions.
#[derive(Clone)]
pub struct CertificateMaterial {
	chain: Vec<Vec<u8>>,
	signing_key: EncodingKey,
	thumbprint: [u8; 32],
	subject: String,
	not_before: OffsetDateTime,
	not_after: OffsetDateTime,
}
impl CertificateMaterial {
	/// Parses a PEM bundle holding the certificate chain (leaf first) and an RSA private key:
	/// PKCS#1, PKCS#8, or password-encrypted PKCS#8 (`ENCRYPTED PRIVATE KEY`).
	pub fn from_pem(pem: &[u8], password: Option<&TokenSecret>) -> Result<Self, LoadError> {
		let blocks = pem::parse_many(pem)
			.map_err(|e| LoadError::malformed(format!("PEM bundle cannot be read: {e}")))?;
		let mut chain = Vec::new();
		let mut signing_key = None;

		for block in blocks {
			match block.tag() {
				"CERTIFICATE" => chain.push(block.into_contents()),
				"RSA PRIVATE KEY" if signing_key.is_none() =>
					signing_key = Some(EncodingKey::from_rsa_der(block.contents())),
				"PRIVATE KEY" if signing_key.is_none() =>
					signing_key = Some(pkcs8_signing_key(block.contents())?),
				"ENCRYPTED PRIVATE KEY" if signing_key.is_none() =>
					signing_key = Some(encrypted_signing_key(block.contents(), password)?),
				_ => {},
			}
		}

		let signing_key = signing_key
			.ok_or_else(|| LoadError::malformed("PEM bundle does not contain an RSA private key"))?;

		Self::from_parts(chain, signing_key)
	}

	/// Builds material from DER certificates (leaf first) and an already parsed key.
	pub fn from_parts(chain: Vec<Vec<u8>>, signing_key: EncodingKey) -> Result<Self, LoadError> {
		let leaf = chain.first().ok_or_else(|| LoadError::malformed("No certificate was found"))?;
		let info = x509::parse_certificate(leaf)
			.map_err(|e| LoadError::malformed(format!("Certificate cannot be parsed: {e}")))?;
		let thumbprint = Sha256::digest(leaf).into();

		Ok(Self {
			chain,
			signing_key,
			thumbprint,
			subject: info.subject,
			not_before: info.not_before,
			not_after: info.not_after,
		})
	}

	/// Upper-case hex SHA-256 thumbprint of the leaf certificate.
	pub fn thumbprint_hex(&self) -> String {
		self.thumbprint.iter().map(|b| format!("{b:02X}")).collect()
	}

	/// `x5t#S256` header value (URL-safe base64 of the SHA-256 thumbprint).
	pub fn thumbprint_s256(&self) -> String {
		URL_SAFE_NO_PAD.encode(self.thumbprint)
	}

	/// Standard base64 DER chain for the `x5c` header.
	pub fn x5c(&self) -> Vec<String> {
		self.chain.iter().map(|der| STANDARD.encode(der)).collect()
	}

	/// Subject distinguished name of the leaf certificate.
	pub fn subject(&self) -> &str {
		&self.subject
	}

	/// End of the validity window.
	pub fn not_after(&self) -> OffsetDateTime {
		self.not_after
	}

	/// Returns true when `instant` falls inside the validity window.
	pub fn is_valid_at(&self, instant: OffsetDateTime) -> bool {
		self.not_before <= instant && instant < self.not_after
	}

	/// Fails with [`LoadError::Malformed`] when `instant` is outside the validity window.
	pub fn ensure_valid_at(&self, instant: OffsetDateTime) -> Result<(), LoadError> {
		if self.is_valid_at(instant) {
			return Ok(());
		}

		Err(LoadError::malformed(format!(
			"Certificate {} ({}) is outside its validity window {} - {}",
			self.thumbprint_hex(),
			self.subject,
			self.not_before,
			self.not_after
		)))
	}

	pub(crate) fn signing_key(&self) -> &EncodingKey {
		&self.signing_key
	}
}
impl PartialEq for CertificateMaterial {
	fn eq(&self, other: &Self) -> bool {
		self.thumbprint == other.thumbprint
	}
}
impl Eq for CertificateMaterial {}
impl Debug for CertificateMaterial {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CertificateMaterial")
			.field("thumbprint", &self.thumbprint_hex())
			.field("subject", &self.subject)
			.field("not_before", &self.not_before)
			.field("not_after", &self.not_after)
			.field("signing_key", &"<redacted>")
			.finish()
	}
}

/// Pre-signed JWT used as a client assertion (managed identity or workload identity).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedAssertion {
	/// The assertion.
	pub token: TokenSecret,
	/// Instant after which the assertion must be reloaded.
	pub expires_at: OffsetDateTime,
}
impl SignedAssertion {
	/// Wraps `token`, reading its `exp` claim when it is a JWT.
	pub fn new(token: impl Into<String>) -> Self {
		let token = token.into();
		let expires_at = jwt_expiry(&token)
			.unwrap_or_else(|| OffsetDateTime::now_utc() + OPAQUE_ASSERTION_LIFETIME);

		Self { token: TokenSecret::new(token), expires_at }
	}

	/// Wraps `token` with an explicit expiry.
	pub fn with_expiry(token: impl Into<String>, expires_at: OffsetDateTime) -> Self {
		Self { token: TokenSecret::new(token), expires_at }
	}

	/// Returns true when the assertion is still usable at `instant`.
	pub fn is_fresh_at(&self, instant: OffsetDateTime) -> bool {
		instant + EXPIRY_SAFETY_MARGIN < self.expires_at
	}
}

/// Outcome of loading a credential source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedCredential {
	/// Certificate used to sign client assertions.
	Certificate(Arc<CertificateMaterial>),
	/// Shared client secret.
	ClientSecret(TokenSecret),
	/// Pre-signed client assertion.
	SignedAssertion(SignedAssertion),
}
impl ResolvedCredential {
	/// Returns true when the material can still be presented at `instant`.
	pub fn is_usable_at(&self, instant: OffsetDateTime) -> bool {
		match self {
			Self::SignedAssertion(assertion) => assertion.is_fresh_at(instant),
			Self::Certificate(material) => material.is_valid_at(instant),
			Self::ClientSecret(_) => true,
		}
	}

	/// Certificate material, when this is a certificate credential.
	pub fn certificate(&self) -> Option<&Arc<CertificateMaterial>> {
		match self {
			Self::Certificate(material) => Some(material),
			_ => None,
		}
	}
}

/// Reads the `exp` claim of a compact JWT without verifying it.
pub fn jwt_expiry(token: &str) -> Option<OffsetDateTime> {
	#[derive(Deserialize)]
	struct Claims {
		exp: i64,
	}

	let mut validation = Validation::default();

	validation.insecure_disable_signature_validation();
	validation.validate_exp = false;
	validation.validate_aud = false;

	let claims =
		jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation).ok()?.claims;

	OffsetDateTime::from_unix_timestamp(claims.exp).ok()
}

fn pkcs8_signing_key(der: &[u8]) -> Result<EncodingKey, LoadError> {
	let info = PrivateKeyInfo::try_from(der)
		.map_err(|e| LoadError::malformed(format!("PKCS#8 key cannot be decoded: {e}")))?;

	if info.algorithm.oid != RSA_ENCRYPTION {
		return Err(LoadError::malformed(format!(
			"PKCS#8 key algorithm {} is not RSA",
			info.algorithm.oid
		)));
	}

	Ok(EncodingKey::from_rsa_der(info.private_key))
}

fn encrypted_signing_key(der: &[u8], password: Option<&TokenSecret>) -> Result<EncodingKey, LoadError> {
	let password = password
		.filter(|password| !password.is_empty())
		.ok_or_else(|| LoadError::malformed("Encrypted private key requires a password"))?;
	let info = EncryptedPrivateKeyInfo::try_from(der)
		.map_err(|e| LoadError::malformed(format!("Encrypted private key cannot be decoded: {e}")))?;
	let document = info
		.decrypt(password.expose())
		.map_err(|e| LoadError::access_denied(format!("Private key cannot be decrypted: {e}")))?;

	pkcs8_signing_key(document.as_bytes())
}
