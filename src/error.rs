//! Broker-level error types shared across credentials, caches, and flows.

// self
use crate::{_prelude::*, flows::FicHop, provider::ProviderErrorKind};

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical broker error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// A credential source could not be resolved.
	#[error(transparent)]
	CredentialLoad(#[from] crate::credentials::CredentialLoadError),
	/// Distributed (L2) token cache failure.
	#[error("Distributed token cache failed: {0}")]
	DistributedCache(
		#[from]
		#[source]
		crate::store::CacheError,
	),
	/// The identity provider rejected the token request.
	#[error(transparent)]
	TokenEndpoint(#[from] TokenEndpointError),
	/// A hop of the federated identity credential chain failed.
	#[error("Federated credential chain failed at the {hop} hop.")]
	FicChain {
		/// Hop that failed.
		hop: FicHop,
		/// Failure reported by the hop.
		#[source]
		source: Box<Error>,
	},
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Temporary upstream failure; retry with backoff.
	#[error(transparent)]
	Transient(#[from] TransientError),
	/// Transport failure (DNS, TCP, TLS).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// The caller cancelled the operation.
	#[error("Operation was cancelled.")]
	Cancelled,
}
impl Error {
	/// Wraps `self` as the failure of the provided FIC hop; cancellation stays unwrapped.
	pub fn in_hop(self, hop: FicHop) -> Self {
		match self {
			Self::Cancelled => Self::Cancelled,
			other => Self::FicChain { hop, source: Box::new(other) },
		}
	}

	/// Returns the token endpoint rejection carried by this error, looking through FIC hops.
	pub fn token_endpoint(&self) -> Option<&TokenEndpointError> {
		match self {
			Self::TokenEndpoint(inner) => Some(inner),
			Self::FicChain { source, .. } => source.token_endpoint(),
			_ => None,
		}
	}
}

/// Drives `future` until it completes or `cancel` fires, whichever happens first.
///
/// Cancellation drops `future`, releasing any guard it holds.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, future: F) -> Result<T>
where
	F: Future<Output = Result<T>>,
{
	tokio::select! {
		biased;
		_ = cancel.cancelled() => Err(Error::Cancelled),
		outcome = future => outcome,
	}
}

/// Structured rejection returned by the token endpoint.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("Token endpoint rejected the request with {error}{}.", .description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct TokenEndpointError {
	/// Broker classification of the failure.
	pub kind: ProviderErrorKind,
	/// HTTP status code, when available.
	pub status: Option<u16>,
	/// OAuth `error` code.
	pub error: String,
	/// OAuth `error_description`.
	pub description: Option<String>,
	/// Numeric provider error codes (`AADSTS` numbers).
	pub error_codes: Vec<u32>,
	/// Claims challenge attached to the rejection, when present.
	pub claims: Option<String>,
	/// Provider correlation identifier, when present.
	pub correlation_id: Option<String>,
	/// Whether the provider considers the presented client credential stale.
	pub stale_credential: bool,
}
impl TokenEndpointError {
	/// Returns true when the rejection carries a non-empty claims challenge.
	pub fn has_claims_challenge(&self) -> bool {
		self.claims.as_deref().is_some_and(|claims| !claims.trim().is_empty())
	}
}

/// Configuration and validation failures raised by the broker.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] oauth2::http::Error),
	/// Authority or instance is invalid.
	#[error(transparent)]
	InvalidAuthority(#[from] crate::provider::AuthorityError),
	/// A URL could not be parsed or joined.
	#[error("Endpoint URL is invalid.")]
	InvalidEndpoint(#[from] url::ParseError),
	/// No options are registered for the authentication scheme.
	#[error("No application options are registered for scheme `{scheme}`.")]
	UnknownScheme {
		/// Requested authentication scheme.
		scheme: String,
	},
	/// Merged options are missing the client identifier.
	#[error("Application options are missing the client id.")]
	MissingClientId,
	/// Merged options are missing both authority and instance.
	#[error("Application options are missing the authority (instance + tenant).")]
	MissingAuthority,
	/// The caller did not request any scope.
	#[error("At least one scope must be requested.")]
	MissingScopes,
	/// No credential description is configured for a confidential client.
	#[error("Application options do not contain any client credential.")]
	MissingCredentials,
	/// Request scopes cannot be normalized.
	#[error("Requested scopes are invalid.")]
	InvalidScope(#[from] crate::auth::ScopeValidationError),
	/// Identifier validation failed.
	#[error(transparent)]
	InvalidIdentifier(#[from] crate::auth::IdentifierError),
	/// App-only tokens must target a `/.default` scope.
	#[error("App-only scope `{scope}` must end with /.default.")]
	AppScopeMustEndWithDefault {
		/// Offending scope.
		scope: String,
	},
	/// App-only tokens cannot target a meta tenant.
	#[error("App-only tokens require a tenanted authority; `{tenant}` is a meta tenant.")]
	MetaTenantNotAllowed {
		/// Offending tenant.
		tenant: String,
	},
	/// On-behalf-of requires an inbound assertion (or a long-running session).
	#[error("The user principal carries neither an inbound assertion nor a session key.")]
	MissingUserAssertion,
	/// A long-running session has no cached token and no assertion to start from.
	#[error("No cached token exists for long-running session `{session}`.")]
	SessionNotFound {
		/// Session key.
		session: String,
	},
	/// Agent user flows need a UPN or an object id.
	#[error("Agent user identity requires a username or user id.")]
	MissingAgentUser,
	/// Token cache options are inconsistent.
	#[error("Token cache options are invalid: {reason}.")]
	InvalidCacheOptions {
		/// Description of the violated constraint.
		reason: &'static str,
	},
	/// Signing a client assertion failed.
	#[error("Client assertion could not be signed.")]
	ClientAssertion {
		/// Underlying signing failure.
		#[source]
		source: jsonwebtoken::errors::Error,
	},
	/// The claims challenge is not a JSON object.
	#[error("Claims challenge is not a JSON object.")]
	InvalidClaims {
		/// Underlying parse failure, when the claims were not JSON at all.
		#[source]
		source: Option<serde_json::Error>,
	},
	/// Token endpoint response omitted `expires_in`.
	#[error("Token endpoint response is missing expires_in.")]
	MissingExpiresIn,
	/// Token endpoint returned a non-positive duration.
	#[error("The expires_in value must be positive.")]
	NonPositiveExpiresIn,
	/// Token endpoint returned an empty access token.
	#[error("Token endpoint returned an empty access token.")]
	EmptyAccessToken,
	/// The acquirer's token cache blob could not be encoded.
	#[error("Token cache blob could not be serialized.")]
	TokenCacheSerialization(#[source] serde_json::Error),
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Temporary failure variants (safe to retry).
#[derive(Debug, ThisError)]
pub enum TransientError {
	/// Provider returned an unexpected but non-fatal response.
	#[error("Token endpoint returned an unexpected response: {message}.")]
	TokenEndpoint {
		/// Provider- or broker-supplied message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// Token endpoint responded with malformed JSON that could not be parsed.
	#[error("Token endpoint returned malformed JSON.")]
	TokenResponseParse {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::error::Error>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
}

/// Transport-level failures (network, IO).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the identity provider.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the identity provider.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn rejection(claims: Option<&str>) -> TokenEndpointError {
		TokenEndpointError {
			kind: ProviderErrorKind::InteractionRequired,
			status: Some(401),
			error: "invalid_grant".into(),
			description: Some("AADSTS50076: MFA required".into()),
			error_codes: vec![50076],
			claims: claims.map(str::to_owned),
			correlation_id: None,
			stale_credential: false,
		}
	}

	#[test]
	fn claims_challenge_requires_content() {
		assert!(rejection(Some("{\"access_token\":{}}")).has_claims_challenge());
		assert!(!rejection(Some("  ")).has_claims_challenge());
		assert!(!rejection(None).has_claims_challenge());
	}

	#[test]
	fn fic_chain_errors_expose_hop_and_rejection() {
		let err = Error::from(rejection(None)).in_hop(FicHop::AgentIdentityFic);

		assert!(err.to_string().contains("agent_identity_fic"));
		assert_eq!(
			err.token_endpoint().map(|inner| inner.status),
			Some(Some(401)),
			"Hop failures should keep the structured rejection reachable."
		);

		let source = StdError::source(&err).expect("Hop failures should expose their cause.");

		assert!(source.to_string().contains("AADSTS50076"));
	}
}
