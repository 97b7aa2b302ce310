//! Minimal orchestration driver: reads a `Policy` from a YAML file given as
//! the first argument, builds the component graph from the process
//! environment, runs one `infer` call against stdin, and prints the
//! receipt id. Demonstrates wiring; it is not the out-of-scope CLI/prompt
//! front end.

use std::io::{self, Read};

use routepilot::config::RuntimeConfig;
use routepilot::error::RoutePilotError;
use routepilot::gateway::GatewayClient;
use routepilot::inference::{InferInput, InferOutput, InferenceDriver};
use routepilot::ledger::Ledger;
use routepilot::policy::Policy;
use routepilot::quota::QuotaEnforcer;
use routepilot::rate::RateEstimator;
use routepilot::router::Supervisor;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();
}

fn db_path() -> String {
    std::env::var("ROUTEPILOT_DB_PATH").unwrap_or_else(|_| "routepilot.db".to_string())
}

/// Exit codes are centralized in `RoutePilotError::exit_code`; `main` never
/// hand-maps a variant to a number itself.
#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();

    match run().await {
        Ok(output) => {
            println!();
            println!("receipt: {}", output.receipt_id);
            println!("route: {} (fallbacks: {})", output.route_final, output.fallback_count);
        }
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

async fn run() -> Result<InferOutput, RoutePilotError> {
    let policy_path = std::env::args()
        .nth(1)
        .ok_or_else(|| RoutePilotError::Config("usage: routepilot <policy.yaml>, prompt on stdin".to_string()))?;
    let policy_yaml = std::fs::read_to_string(&policy_path)
        .map_err(|e| RoutePilotError::Config(format!("reading policy file '{policy_path}': {e}")))?;
    let policy: Policy = serde_yaml::from_str(&policy_yaml).map_err(|e| RoutePilotError::Config(format!("parsing policy YAML: {e}")))?;

    let issues = policy.validate();
    if !issues.is_empty() {
        for issue in &issues {
            tracing::error!(path = %issue.path, message = %issue.message, "policy invalid");
        }
        return Err(RoutePilotError::Policy(issues));
    }

    let cfg = RuntimeConfig::from_env()?;
    let ledger = Ledger::open(db_path()).await.map_err(RoutePilotError::Unknown)?;
    let gateway = GatewayClient::new(&cfg);
    let quota = QuotaEnforcer::new(ledger.clone());
    let recorder = routepilot::recorder::Recorder::new(ledger.clone(), &cfg);
    let rate = RateEstimator::new();
    let supervisor = Supervisor::new(gateway.clone(), ledger.clone(), cfg.chaos.clone());
    let driver = InferenceDriver::new(gateway, ledger, quota, recorder, rate, supervisor, cfg.usage_probe);

    let mut content = String::new();
    io::stdin().read_to_string(&mut content).map_err(|e| RoutePilotError::Unknown(e.into()))?;
    let content = content.trim().to_string();
    if content.is_empty() {
        return Err(RoutePilotError::Config("empty prompt on stdin".to_string()));
    }

    let input = InferInput {
        user: std::env::var("ROUTEPILOT_USER").unwrap_or_else(|_| "cli-user".to_string()),
        content,
        attachment_block: None,
        shadow_model: None,
    };

    driver.infer(&policy, input, |delta: &str| print!("{delta}")).await
}
