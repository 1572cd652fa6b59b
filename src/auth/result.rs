//! Token acquisition results returned to callers and persisted in cache blobs.

// self
use crate::{
	_prelude::*,
	auth::{ScopeSet, TenantId, TokenSecret},
};

/// Tokens are treated as expired this long before their real expiry.
pub const EXPIRY_SAFETY_MARGIN: Duration = Duration::minutes(5);

/// Outcome of a successful token acquisition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireTokenResult {
	/// Access token; never empty.
	pub access_token: TokenSecret,
	/// Token type reported by the provider (`Bearer` or `pop`).
	pub token_type: String,
	/// Absolute expiry instant (UTC).
	pub expires_on: OffsetDateTime,
	/// Tenant the token was issued for.
	pub tenant_id: Option<TenantId>,
	/// ID token, when the provider returned one.
	pub id_token: Option<TokenSecret>,
	/// Scopes granted by the provider (falls back to the requested scopes).
	pub scopes: ScopeSet,
	/// Correlation identifier of the request that minted this token.
	pub correlation_id: Uuid,
}
impl AcquireTokenResult {
	/// Returns true when the token is still usable at `instant`, honoring the safety margin.
	pub fn is_fresh_at(&self, instant: OffsetDateTime) -> bool {
		instant + EXPIRY_SAFETY_MARGIN < self.expires_on
	}

	/// Returns true when the token is still usable now.
	pub fn is_fresh(&self) -> bool {
		self.is_fresh_at(OffsetDateTime::now_utc())
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn result(expires_on: OffsetDateTime) -> AcquireTokenResult {
		AcquireTokenResult {
			access_token: TokenSecret::new("at"),
			token_type: "Bearer".into(),
			expires_on,
			tenant_id: None,
			id_token: None,
			scopes: ScopeSet::new(["api://a/.default"]).expect("Scope fixture should be valid."),
			correlation_id: Uuid::nil(),
		}
	}

	#[test]
	fn freshness_applies_the_safety_margin() {
		let now = OffsetDateTime::now_utc();

		assert!(result(now + Duration::minutes(10)).is_fresh_at(now));
		assert!(!result(now + Duration::minutes(4)).is_fresh_at(now));
		assert!(!result(now - Duration::seconds(1)).is_fresh_at(now));
	}
}
