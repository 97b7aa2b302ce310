//! Sub-agent task-chain orchestration: envelopes, the agent registry, the
//! `http_fetch` pre-flight tool, the aggregator reduce, and the controller
//! that drives one hop (or a whole chain) through the router.

pub mod aggregator;
pub mod controller;
pub mod envelope;
pub mod http_fetch;
pub mod registry;

pub use aggregator::reduce;
pub use controller::{HopError, HopOutput, SubagentController};
pub use envelope::{Budget, TaskEnvelope};
pub use registry::AgentRegistry;
