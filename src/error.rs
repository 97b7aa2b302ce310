//! Typed error taxonomy shared across the crate.
//!
//! Component-local errors (`QuotaError`, `RouterError`) convert into the
//! top-level `RoutePilotError` so callers at the driver boundary see one
//! enum, while the router and quota enforcer can still match on their own
//! narrower types internally.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum QuotaError {
    #[error("rpm limit exceeded: {limit} requests/min")]
    Rpm { limit: u32 },
    #[error("daily token limit exceeded: {limit} tokens (day {when})")]
    Daily { limit: u64, when: String },
}

#[derive(Debug, Clone)]
pub struct AttemptError {
    pub model: String,
    pub message: String,
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Error)]
#[error("router exhausted after {} attempts", .attempts.len())]
pub struct RouterError {
    pub attempts: Vec<AttemptError>,
}

#[derive(Debug, Clone)]
pub struct PolicyIssue {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum RoutePilotError {
    #[error("config error: {0}")]
    Config(String),

    #[error("policy invalid: {} issue(s)", .0.len())]
    Policy(Vec<PolicyIssue>),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("gateway error: status {status}")]
    Gateway { status: u16, body: String },

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl RoutePilotError {
    /// Operational exit code per the external-interfaces contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            RoutePilotError::Config(_) => 78,
            RoutePilotError::Policy(_) => 65,
            RoutePilotError::Quota(_) => 75,
            RoutePilotError::Gateway { .. } => 69,
            RoutePilotError::Router(_) => 69,
            RoutePilotError::Unknown(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, RoutePilotError>;
