//! Architecture verification: every component that crosses a `tokio::spawn`
//! or is shared behind an `Arc` across requests must be `Send + Sync`.

#[cfg(test)]
mod architecture_tests {
    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn core_components_are_thread_safe() {
        assert_send_sync::<routepilot::ledger::Ledger>();
        assert_send_sync::<routepilot::gateway::GatewayClient>();
        assert_send_sync::<routepilot::router::Supervisor>();
        assert_send_sync::<routepilot::quota::QuotaEnforcer>();
        assert_send_sync::<routepilot::recorder::Recorder>();
        assert_send_sync::<routepilot::rate::RateEstimator>();
    }

    #[test]
    fn drivers_are_thread_safe() {
        assert_send_sync::<routepilot::inference::InferenceDriver>();
        assert_send_sync::<routepilot::agent_session::AgentSessionDriver>();
        assert_send_sync::<routepilot::subagent::SubagentController>();
    }

    #[test]
    fn sink_implementations_are_thread_safe() {
        assert_send_sync::<routepilot::router::SilentSink>();
        assert_send_sync::<routepilot::router::CaptureSink>();
    }
}
