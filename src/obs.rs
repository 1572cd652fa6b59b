//! Observability helpers for broker flows.
//!
//! Every flow runs inside a `tracing` span named `identity_broker.flow` carrying the `flow`
//! and `stage` fields. With the `metrics` feature the `identity_broker_flow_total` counter
//! is incremented for every attempt/success/failure, labeled by `flow` + `outcome`.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Token acquisition flows observed by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
	/// App-only client credentials.
	App,
	/// On-behalf-of exchange (including long-running sessions).
	OnBehalfOf,
	/// Autonomous agent identity chain.
	AgentIdentity,
	/// Agent user (`user_fic`) chain.
	AgentUser,
	/// Single federated credential hop.
	FicToken,
}
impl FlowKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowKind::App => "app",
			FlowKind::OnBehalfOf => "on_behalf_of",
			FlowKind::AgentIdentity => "agent_identity",
			FlowKind::AgentUser => "agent_user",
			FlowKind::FicToken => "fic_token",
		}
	}
}
impl Display for FlowKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowOutcome {
	/// Entry to a flow.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl FlowOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowOutcome::Attempt => "attempt",
			FlowOutcome::Success => "success",
			FlowOutcome::Failure => "failure",
		}
	}
}
impl Display for FlowOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
