//! Strongly typed identifiers for tenants, client applications, and credentials.

// std
use std::{borrow::Borrow, ops::Deref};
// self
use crate::_prelude::*;

macro_rules! def_id {
	($name:ident, $doc:literal, $kind:literal) => {
		#[doc = $doc]
		#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);
		impl $name {
			/// Creates a new identifier after validation.
			pub fn new(value: impl AsRef<str>) -> Result<Self, IdentifierError> {
				let view = value.as_ref();

				validate_view($kind, view)?;

				Ok(Self(view.to_owned()))
			}
		}
		impl Deref for $name {
			type Target = str;

			fn deref(&self) -> &Self::Target {
				&self.0
			}
		}
		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
		impl From<$name> for String {
			fn from(value: $name) -> Self {
				value.0
			}
		}
		impl TryFrom<String> for $name {
			type Error = IdentifierError;

			fn try_from(value: String) -> Result<Self, Self::Error> {
				validate_view($kind, &value)?;

				Ok(Self(value))
			}
		}
		impl Borrow<str> for $name {
			fn borrow(&self) -> &str {
				&self.0
			}
		}
		impl Debug for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				write!(f, concat!($kind, "({})"), self.0)
			}
		}
		impl Display for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				f.write_str(&self.0)
			}
		}
		impl FromStr for $name {
			type Err = IdentifierError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s)
			}
		}
	};
}

const IDENTIFIER_MAX_LEN: usize = 256;
const META_TENANTS: [&str; 3] = ["common", "organizations", "consumers"];

/// Error returned when identifier validation fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum IdentifierError {
	/// The identifier was empty.
	#[error("{kind} identifier cannot be empty.")]
	Empty {
		/// Kind of identifier (tenant, client, credential).
		kind: &'static str,
	},
	/// The identifier contains whitespace characters.
	#[error("{kind} identifier contains whitespace.")]
	ContainsWhitespace {
		/// Kind of identifier (tenant, client, credential).
		kind: &'static str,
	},
	/// The identifier exceeded the allowed byte length.
	#[error("{kind} identifier exceeds {max} bytes.")]
	TooLong {
		/// Kind of identifier (tenant, client, credential).
		kind: &'static str,
		/// Maximum permitted length.
		max: usize,
	},
}

def_id! { TenantId, "Directory tenant (GUID or verified domain) or a meta tenant alias.", "Tenant" }
def_id! { ClientId, "Application (client) identifier registered with the identity provider.", "Client" }
def_id! { CredentialId, "Diagnostics identity of a credential descriptor.", "Credential" }

impl CredentialId {
	/// Builds an id from free text, replacing whitespace and truncating to the length limit.
	pub fn sanitized(raw: &str) -> Self {
		let mut id = raw.chars().map(|c| if c.is_whitespace() { '_' } else { c }).collect::<String>();

		if id.is_empty() {
			id.push_str("credential");
		}
		if id.len() > IDENTIFIER_MAX_LEN {
			let mut cut = IDENTIFIER_MAX_LEN;

			while !id.is_char_boundary(cut) {
				cut -= 1;
			}

			id.truncate(cut);
		}

		Self(id)
	}
}

impl TenantId {
	/// Returns true for the multi-tenant aliases `common`, `organizations`, and `consumers`.
	pub fn is_meta(&self) -> bool {
		META_TENANTS.iter().any(|meta| self.0.eq_ignore_ascii_case(meta))
	}
}

fn validate_view(kind: &'static str, view: &str) -> Result<(), IdentifierError> {
	if view.is_empty() {
		return Err(IdentifierError::Empty { kind });
	}
	if view.chars().any(char::is_whitespace) {
		return Err(IdentifierError::ContainsWhitespace { kind });
	}
	if view.len() > IDENTIFIER_MAX_LEN {
		return Err(IdentifierError::TooLong { kind, max: IDENTIFIER_MAX_LEN });
	}

	Ok(())
}
