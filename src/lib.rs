//! RoutePilot: a policy-driven orchestrator for OpenAI-compatible LLM
//! gateway access — streaming failover routing, p95-based pre-pick,
//! signed/replayable receipts, quota enforcement, and sub-agent
//! task-chain orchestration.

pub mod agent_session;
pub mod agent_spec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod inference;
pub mod ledger;
pub mod policy;
pub mod quota;
pub mod rate;
pub mod recorder;
pub mod router;
pub mod stream;
pub mod subagent;

pub use agent_session::AgentSessionDriver;
pub use config::RuntimeConfig;
pub use error::{RoutePilotError, Result};
pub use gateway::GatewayClient;
pub use inference::InferenceDriver;
pub use ledger::Ledger;
pub use policy::Policy;
pub use quota::QuotaEnforcer;
pub use rate::RateEstimator;
pub use recorder::Recorder;
pub use router::Supervisor;
