//! Identity-domain identifiers, scope sets, user principals, and token results.

pub mod id;
pub mod principal;
pub mod result;
pub mod scope;
pub mod secret;

pub use id::*;
pub use principal::*;
pub use result::*;
pub use scope::*;
pub use secret::*;
