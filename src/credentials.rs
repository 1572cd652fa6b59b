//! Credential descriptors, source loaders, and the single-flight resolver.

pub mod assertion;
pub mod descriptor;
pub mod loader;
pub mod loaders;
pub mod material;
pub mod resolver;
pub mod x509;

pub use assertion::*;
pub use descriptor::*;
pub use loader::*;
pub use material::*;
pub use resolver::*;

// self
use crate::{_prelude::*, auth::CredentialId};

/// Failure reported by a [`CredentialSourceLoader`].
///
/// The resolver records these verbatim; it never interprets the kind.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum LoadError {
	/// The referenced source does not exist.
	#[error("Credential source was not found: {message}.")]
	NotFound {
		/// Loader-supplied detail.
		message: String,
	},
	/// The source exists but the caller may not read it.
	#[error("Access to the credential source was denied: {message}.")]
	AccessDenied {
		/// Loader-supplied detail.
		message: String,
	},
	/// The source was read but its content is unusable (including expired certificates).
	#[error("Credential source is malformed: {message}.")]
	Malformed {
		/// Loader-supplied detail.
		message: String,
	},
	/// A remote source could not be reached.
	#[error("Credential source could not be reached: {message}.")]
	Network {
		/// Loader-supplied detail.
		message: String,
	},
}
impl LoadError {
	/// Builds a [`LoadError::NotFound`].
	pub fn not_found(message: impl Into<String>) -> Self {
		Self::NotFound { message: message.into() }
	}

	/// Builds a [`LoadError::AccessDenied`].
	pub fn access_denied(message: impl Into<String>) -> Self {
		Self::AccessDenied { message: message.into() }
	}

	/// Builds a [`LoadError::Malformed`].
	pub fn malformed(message: impl Into<String>) -> Self {
		Self::Malformed { message: message.into() }
	}

	/// Builds a [`LoadError::Network`].
	pub fn network(message: impl Into<String>) -> Self {
		Self::Network { message: message.into() }
	}

	/// Maps a filesystem failure on `path` to the closest kind.
	pub fn from_io(path: &std::path::Path, e: std::io::Error) -> Self {
		let message = format!("{}: {e}", path.display());

		match e.kind() {
			std::io::ErrorKind::PermissionDenied => Self::access_denied(message),
			_ => Self::not_found(message),
		}
	}

	/// Maps an HTTP status returned by a remote source.
	pub fn from_status(status: u16, message: impl Display) -> Self {
		match status {
			401 | 403 => Self::access_denied(format!("HTTP {status}: {message}")),
			404 => Self::not_found(format!("HTTP {status}: {message}")),
			_ => Self::network(format!("HTTP {status}: {message}")),
		}
	}
}

/// Credential resolution failure surfaced through [`Error::CredentialLoad`].
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum CredentialLoadError {
	/// One descriptor failed to load.
	#[error("Credential `{descriptor_id}` could not be loaded: {cause}")]
	Descriptor {
		/// Identity of the failing descriptor.
		descriptor_id: CredentialId,
		/// Loader failure.
		#[source]
		cause: LoadError,
	},
	/// Every descriptor of a credential list failed.
	#[error("No credential in `{list_key}` could be loaded: {}", render_failures(.failures))]
	Exhausted {
		/// Name of the credential list (client id or scheme).
		list_key: String,
		/// Each descriptor's id and failure, in configuration order.
		failures: Vec<(CredentialId, LoadError)>,
	},
}
impl CredentialLoadError {
	/// Ids of every descriptor named by this failure.
	pub fn descriptor_ids(&self) -> Vec<&CredentialId> {
		match self {
			Self::Descriptor { descriptor_id, .. } => vec![descriptor_id],
			Self::Exhausted { failures, .. } => failures.iter().map(|(id, _)| id).collect(),
		}
	}
}

fn render_failures(failures: &[(CredentialId, LoadError)]) -> String {
	failures.iter().map(|(id, cause)| format!("[{id}] {cause}")).collect::<Vec<_>>().join(" ")
}
