//! Built-in credential source loaders.

pub mod certificate;
pub mod key_vault;
pub mod managed_identity;
pub mod signed_assertion;

pub use certificate::*;
pub use key_vault::*;
pub use managed_identity::*;
pub use signed_assertion::*;
