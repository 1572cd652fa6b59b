//! Caller identity for delegated (user) token requests.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
// self
use crate::{
	_prelude::*,
	auth::{TenantId, TokenSecret},
};

/// User on whose behalf a delegated token is requested.
///
/// The inbound assertion drives on-behalf-of exchanges. The object id and home tenant form
/// the home account identifier used to partition the user token cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserPrincipal {
	/// Token the caller received from its own client (the OBO assertion).
	pub assertion: Option<TokenSecret>,
	/// Directory object id (`oid`).
	pub object_id: Option<String>,
	/// Home tenant (`tid`).
	pub tenant_id: Option<TenantId>,
	/// User principal name, for diagnostics.
	pub username: Option<String>,
}
impl UserPrincipal {
	/// Principal identified by the token it presented.
	pub fn from_assertion(assertion: impl Into<String>) -> Self {
		Self { assertion: Some(TokenSecret::new(assertion)), ..Default::default() }
	}

	/// Sets the object id and home tenant.
	pub fn with_home_account(mut self, object_id: impl Into<String>, tenant_id: TenantId) -> Self {
		self.object_id = Some(object_id.into());
		self.tenant_id = Some(tenant_id);

		self
	}

	/// Sets the user principal name.
	pub fn with_username(mut self, username: impl Into<String>) -> Self {
		self.username = Some(username.into());

		self
	}

	/// `oid.tid` home account identifier, when both parts are known.
	pub fn home_account_id(&self) -> Option<String> {
		match (&self.object_id, &self.tenant_id) {
			(Some(oid), Some(tid)) => Some(format!("{oid}.{tid}")),
			_ => None,
		}
	}

	/// SHA-256 fingerprint of the inbound assertion (URL-safe base64, no padding).
	pub fn assertion_fingerprint(&self) -> Option<String> {
		self.assertion
			.as_ref()
			.map(|assertion| URL_SAFE_NO_PAD.encode(Sha256::digest(assertion.expose().as_bytes())))
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn home_account_requires_both_parts() {
		let tenant = TenantId::new("tid").expect("Tenant fixture should be valid.");
		let principal = UserPrincipal::from_assertion("jwt").with_home_account("oid", tenant);

		assert_eq!(principal.home_account_id().as_deref(), Some("oid.tid"));
		assert_eq!(UserPrincipal::from_assertion("jwt").home_account_id(), None);
	}

	#[test]
	fn assertion_fingerprint_is_stable_and_opaque() {
		let lhs = UserPrincipal::from_assertion("header.payload.sig");
		let rhs = UserPrincipal::from_assertion("header.payload.sig");
		let fingerprint = lhs.assertion_fingerprint().expect("Fingerprint should exist.");

		assert_eq!(Some(fingerprint.clone()), rhs.assertion_fingerprint());
		assert!(!fingerprint.contains("payload"));
		assert_eq!(UserPrincipal::default().assertion_fingerprint(), None);
	}
}
