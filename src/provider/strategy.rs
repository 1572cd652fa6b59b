//! Provider strategy hooks that customize token exchanges.
//!
//! Implementations decorate outgoing token requests, classify rejections, and decide
//! whether a rejection means the configured credentials are stale, all without tying
//! flows to any particular HTTP client.

// self
use crate::{_prelude::*, provider::GrantType};

/// Provider error codes that mean the presented certificate is no longer accepted
/// (expired, revoked, or outside the signed assertion validity window).
pub const CREDENTIAL_ROTATION_CODES: [&str; 4] =
	["AADSTS700027", "AADSTS700024", "AADSTS7000214", "AADSTS1000502"];

/// Strategy hook that allows providers to decorate requests and classify errors.
///
/// Implementors are required to be `Send + Sync`, and the hooks use crate-owned data
/// types so downstream crates never depend on reqwest-specific structures. Only
/// [`classify_token_error`](Self::classify_token_error) is mandatory.
pub trait ProviderStrategy: Send + Sync {
	/// Maps a token endpoint rejection into the broker taxonomy.
	fn classify_token_error(&self, ctx: &ProviderErrorContext) -> ProviderErrorKind;

	/// Gives providers a chance to add custom form parameters before dispatching.
	fn augment_token_request(&self, _grant: GrantType, _form: &mut BTreeMap<String, String>) {}

	/// Returns true when the rejection means the credential list must be reset and the
	/// request retried with freshly loaded material.
	fn requires_credential_reset(&self, ctx: &ProviderErrorContext) -> bool {
		let invalid_client =
			ctx.oauth_error.as_deref().is_some_and(|e| e.eq_ignore_ascii_case("invalid_client"));
		let description = ctx.error_description.as_deref().unwrap_or_default();

		invalid_client && CREDENTIAL_ROTATION_CODES.iter().any(|code| description.contains(code))
	}
}

/// Canonical provider error categories used by strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
	/// Provider rejected the grant (bad assertion, expired user token).
	InvalidGrant,
	/// Client authentication failed.
	InvalidClient,
	/// Requested scopes are unknown or not consented.
	InsufficientScope,
	/// The user must satisfy a claims challenge (MFA, conditional access).
	InteractionRequired,
	/// Failure is temporary and may be retried by the caller.
	Transient,
}

/// Context passed to provider strategies when classifying token errors.
///
/// Only primitive data is kept (status code, OAuth fields, error codes) so strategies stay
/// decoupled from any HTTP client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderErrorContext {
	/// Grant type associated with the failing request.
	pub grant_type: GrantType,
	/// HTTP status code returned by the provider, when available.
	pub http_status: Option<u16>,
	/// Provider-supplied OAuth `error` field.
	pub oauth_error: Option<String>,
	/// Provider-supplied OAuth `error_description` field.
	pub error_description: Option<String>,
	/// Numeric provider error codes.
	pub error_codes: Vec<u32>,
	/// Whether the rejection carried a claims challenge.
	pub has_claims: bool,
}
impl ProviderErrorContext {
	/// Creates a new context scoped to the provided grant type.
	pub fn new(grant_type: GrantType) -> Self {
		Self {
			grant_type,
			http_status: None,
			oauth_error: None,
			error_description: None,
			error_codes: Vec::new(),
			has_claims: false,
		}
	}

	/// Adds an HTTP status code (e.g., 400, 401, 500).
	pub fn with_http_status(mut self, status: u16) -> Self {
		self.http_status = Some(status);

		self
	}

	/// Adds the OAuth error code string returned by the provider.
	pub fn with_oauth_error(mut self, error: impl Into<String>) -> Self {
		self.oauth_error = Some(error.into());

		self
	}

	/// Adds the OAuth `error_description` field.
	pub fn with_error_description(mut self, description: impl Into<String>) -> Self {
		self.error_description = Some(description.into());

		self
	}

	/// Adds numeric provider error codes.
	pub fn with_error_codes(mut self, codes: Vec<u32>) -> Self {
		self.error_codes = codes;

		self
	}

	/// Flags the presence of a claims challenge.
	pub fn with_claims(mut self, has_claims: bool) -> Self {
		self.has_claims = has_claims;

		self
	}
}

/// Default strategy for Entra-style identity providers.
///
/// Claims challenges always classify as [`ProviderErrorKind::InteractionRequired`]. Then
/// structured OAuth fields win over the HTTP status code.
#[derive(Debug, Default)]
pub struct DefaultProviderStrategy;
impl Display for DefaultProviderStrategy {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("default-provider-strategy")
	}
}
impl ProviderStrategy for DefaultProviderStrategy {
	fn classify_token_error(&self, ctx: &ProviderErrorContext) -> ProviderErrorKind {
		if ctx.has_claims {
			return ProviderErrorKind::InteractionRequired;
		}
		if let Some(kind) = ctx.oauth_error.as_deref().and_then(match_exact_value) {
			return kind;
		}

		classify_status(ctx.http_status)
	}
}

fn match_exact_value(value: &str) -> Option<ProviderErrorKind> {
	match value.to_ascii_lowercase().as_str() {
		"invalid_grant" | "access_denied" => Some(ProviderErrorKind::InvalidGrant),
		"invalid_client" | "unauthorized_client" => Some(ProviderErrorKind::InvalidClient),
		"invalid_scope" | "insufficient_scope" | "invalid_resource" =>
			Some(ProviderErrorKind::InsufficientScope),
		"interaction_required" | "consent_required" | "login_required" =>
			Some(ProviderErrorKind::InteractionRequired),
		"temporarily_unavailable" | "server_error" => Some(ProviderErrorKind::Transient),
		_ => None,
	}
}

fn classify_status(status: Option<u16>) -> ProviderErrorKind {
	match status {
		Some(400 | 404 | 410) => ProviderErrorKind::InvalidGrant,
		Some(401) => ProviderErrorKind::InvalidClient,
		Some(403) => ProviderErrorKind::InsufficientScope,
		_ => ProviderErrorKind::Transient,
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn ctx() -> ProviderErrorContext {
		ProviderErrorContext::new(GrantType::ClientCredentials)
	}

	#[test]
	fn claims_challenges_win_over_oauth_fields() {
		let strategy = DefaultProviderStrategy;
		let challenged = ctx().with_oauth_error("invalid_grant").with_http_status(400).with_claims(true);

		assert_eq!(strategy.classify_token_error(&challenged), ProviderErrorKind::InteractionRequired);
		assert_eq!(
			strategy.classify_token_error(&ctx().with_oauth_error("invalid_grant")),
			ProviderErrorKind::InvalidGrant
		);
		assert_eq!(
			strategy.classify_token_error(&ctx().with_http_status(503)),
			ProviderErrorKind::Transient
		);
	}

	#[test]
	fn credential_reset_requires_invalid_client_and_rotation_code() {
		let strategy = DefaultProviderStrategy;
		let rotated = ctx()
			.with_oauth_error("invalid_client")
			.with_error_description("AADSTS700027: Client assertion failed signature validation.");

		assert!(strategy.requires_credential_reset(&rotated));

		let other = ctx()
			.with_oauth_error("invalid_client")
			.with_error_description("AADSTS7000215: Invalid client secret provided.");

		assert!(!strategy.requires_credential_reset(&other));

		let wrong_error = ctx()
			.with_oauth_error("invalid_grant")
			.with_error_description("AADSTS700027: Client assertion failed signature validation.");

		assert!(!strategy.requires_credential_reset(&wrong_error));
	}
}
