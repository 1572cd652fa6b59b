//! Grant types issued against the token endpoint.

// self
use crate::_prelude::*;

/// `client_assertion_type` value for JWT client assertions.
pub const JWT_BEARER_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// OAuth 2.0 grant types the broker issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
	/// Client Credentials grant for app-only tokens (including FIC hops).
	ClientCredentials,
	/// JWT bearer grant used for on-behalf-of exchanges.
	OnBehalfOf,
	/// Agent user grant that presents a user federated identity credential.
	UserFic,
	/// Refresh token grant used to extend long-running on-behalf-of sessions.
	RefreshToken,
}
impl GrantType {
	/// Returns the `grant_type` form value.
	pub fn as_str(self) -> &'static str {
		match self {
			GrantType::ClientCredentials => "client_credentials",
			GrantType::OnBehalfOf => "urn:ietf:params:oauth:grant-type:jwt-bearer",
			GrantType::UserFic => "user_fic",
			GrantType::RefreshToken => "refresh_token",
		}
	}
}
impl Display for GrantType {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
