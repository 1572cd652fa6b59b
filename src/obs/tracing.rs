// crates.io
use tracing::{Span, instrument::Instrumented};
// self
use crate::{_prelude::*, obs::FlowKind};

/// Span wrapper used by broker flows.
#[derive(Clone, Debug)]
pub struct FlowSpan {
	span: Span,
}
impl FlowSpan {
	/// Creates a new span tagged with the provided flow kind + stage.
	pub fn new(kind: FlowKind, stage: &'static str) -> Self {
		Self {
			span: tracing::info_span!(
				"identity_broker.flow",
				flow = kind.as_str(),
				stage,
				correlation_id = tracing::field::Empty
			),
		}
	}

	/// Records the correlation id of the call on the span.
	pub fn with_correlation_id(self, correlation_id: Uuid) -> Self {
		self.span.record("correlation_id", tracing::field::display(correlation_id));

		self
	}

	/// Instruments an async block without holding a guard across `.await` points.
	pub fn instrument<Fut>(&self, fut: Fut) -> Instrumented<Fut>
	where
		Fut: Future,
	{
		use tracing::Instrument;

		fut.instrument(self.span.clone())
	}
}
