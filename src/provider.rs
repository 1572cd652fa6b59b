//! Identity-provider facing data (authorities, grants) and behavior (strategies).
//!
//! `authority` validates the instance + tenant pair and derives the token endpoint.
//! `strategy` defines [`ProviderStrategy`], an HTTP-client-agnostic hook used by flows to
//! augment outgoing token requests, classify rejections, and decide when a credential
//! list must be reset.

pub mod authority;
pub mod grant;
pub mod strategy;

pub use authority::*;
pub use grant::*;
pub use strategy::*;
