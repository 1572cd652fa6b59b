//! Subject name and validity window of X.509 certificates.

// crates.io
use x509_cert::{Certificate, der::Decode, name::RdnSequence, time::Time};
// self
use crate::_prelude::*;

/// Errors raised while reading certificate DER.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum X509Error {
	/// The DER does not decode as an X.509 certificate.
	#[error("Certificate DER cannot be decoded: {0}.")]
	Der(#[from] x509_cert::der::Error),
	/// A validity timestamp does not fit the supported date range.
	#[error("Certificate validity timestamp is out of range.")]
	InvalidTime,
}

/// Fields read from a certificate's `TBSCertificate`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
	/// Subject distinguished name in certificate order, e.g. `CN=app, O=Contoso`.
	pub subject: String,
	/// Start of the validity window.
	pub not_before: OffsetDateTime,
	/// End of the validity window.
	pub not_after: OffsetDateTime,
}

/// Parses subject and validity out of a DER-encoded certificate.
pub fn parse_certificate(der: &[u8]) -> Result<CertificateInfo, X509Error> {
	let certificate = Certificate::from_der(der)?;
	let tbs = &certificate.tbs_certificate;

	Ok(CertificateInfo {
		subject: display_name(&tbs.subject),
		not_before: offset_date_time(tbs.validity.not_before)?,
		not_after: offset_date_time(tbs.validity.not_after)?,
	})
}

/// Normalizes a distinguished name for comparisons (component order preserved).
pub fn normalize_dn(dn: &str) -> Vec<String> {
	dn.split([',', ';'])
		.map(str::trim)
		.filter(|part| !part.is_empty())
		.filter_map(|part| {
			let (name, value) = part.split_once('=')?;

			Some(format!("{}={}", name.trim().to_ascii_uppercase(), value.trim().to_lowercase()))
		})
		.collect()
}

fn display_name(name: &RdnSequence) -> String {
	name.0
		.iter()
		.map(|rdn| rdn.0.iter().map(ToString::to_string).collect::<Vec<_>>().join("+"))
		.collect::<Vec<_>>()
		.join(", ")
}

fn offset_date_time(time: Time) -> Result<OffsetDateTime, X509Error> {
	let seconds =
		i64::try_from(time.to_unix_duration().as_secs()).map_err(|_| X509Error::InvalidTime)?;

	OffsetDateTime::from_unix_timestamp(seconds).map_err(|_| X509Error::InvalidTime)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn fixture_der() -> Vec<u8> {
		let pem = include_bytes!("../../tests/fixtures/client-cert.pem");

		pem::parse_many(pem)
			.expect("Fixture PEM should parse.")
			.into_iter()
			.find(|block| block.tag() == "CERTIFICATE")
			.expect("Fixture should contain a certificate.")
			.into_contents()
	}

	#[test]
	fn reads_subject_and_mixed_time_encodings() {
		let info = parse_certificate(&fixture_der()).expect("Fixture certificate should parse.");

		assert_eq!(normalize_dn(&info.subject), ["CN=broker-test-1", "O=identity broker tests"]);
		assert!(info.not_before.year() >= 2026);
		// Validity ends after 2049, so it is encoded as GeneralizedTime.
		assert!(info.not_after.year() > 2100);
		assert!(info.not_before < info.not_after);
	}

	#[test]
	fn truncated_der_is_rejected() {
		let der = fixture_der();

		assert!(matches!(parse_certificate(&der[..40]), Err(X509Error::Der(_))));
		assert!(parse_certificate(&[0x02, 0x01, 0x00]).is_err());
	}

	#[test]
	fn distinguished_names_normalize_case_and_spacing() {
		assert_eq!(
			normalize_dn("cn=Broker-Test-1,  O=Identity Broker Tests"),
			vec!["CN=broker-test-1".to_owned(), "O=identity broker tests".to_owned()]
		);
	}
}
