//! Per-lead decision making: history context, the decision service and the
//! processor every trigger funnels through.

pub mod context;
pub mod decision;
pub mod processor;

pub use context::LeadContext;
pub use decision::{Decision, DecisionAction, DecisionService, LlmDecisionService};
pub use processor::{
    LeadProcessor, PreparedAction, PreparedKind, ProcessOutcome, Trigger, transition_lead,
};
