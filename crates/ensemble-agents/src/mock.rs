//! Mock agent - simulated work for tests and unknown-type fallback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use ensemble_core::agent::{Agent, AgentError, AgentOutput, AgentRequest};
use ensemble_core::types::LogLevel;

/// Simulates an agent: logs a couple of lines, sleeps a little while
/// honouring cancellation, then returns a canned summary. Can be
/// scripted to fail its first N attempts, which is how the retry path
/// is exercised in tests.
pub struct MockAgent {
    agent_type: String,
    delay: Duration,
    fail_transient: AtomicU32,
    fail_permanent: bool,
}

impl MockAgent {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            delay: Duration::from_millis(10),
            fail_transient: AtomicU32::new(0),
            fail_permanent: false,
        }
    }

    /// Simulated work duration per attempt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `attempts` invocations with a transient error.
    pub fn failing_transient(mut self, attempts: u32) -> Self {
        self.fail_transient = AtomicU32::new(attempts);
        self
    }

    /// Fail every invocation with a permanent error.
    pub fn failing_permanent(mut self) -> Self {
        self.fail_permanent = true;
        self
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn description(&self) -> &str {
        "Simulated agent for development and tests"
    }

    async fn run(&self, request: AgentRequest<'_>) -> Result<AgentOutput, AgentError> {
        request
            .logs
            .log(
                LogLevel::Info,
                &format!("[{}] starting: {}", self.agent_type, preview(request.prompt)),
            )
            .await;

        tokio::select! {
            _ = sleep(self.delay) => {}
            _ = request.cancel.cancelled() => return Err(AgentError::Cancelled),
        }

        if self
            .fail_transient
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AgentError::Transient("simulated flaky failure".to_string()));
        }
        if self.fail_permanent {
            return Err(AgentError::Permanent("simulated permanent failure".to_string()));
        }

        request
            .logs
            .log(LogLevel::Info, &format!("[{}] done", self.agent_type))
            .await;
        Ok(AgentOutput::new(format!(
            "Simulated result for: {}",
            preview(request.prompt)
        )))
    }
}

fn preview(prompt: &str) -> String {
    const MAX: usize = 60;
    if prompt.chars().count() <= MAX {
        prompt.to_string()
    } else {
        prompt.chars().take(MAX).collect::<String>() + "..."
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::agent::NullLogSink;
    use tokio_util::sync::CancellationToken;

    fn request<'a>(cancel: &'a CancellationToken, sink: &'a NullLogSink) -> AgentRequest<'a> {
        AgentRequest {
            task_id: "t1",
            prompt: "simulate something useful",
            model: None,
            dependency_outputs: &[],
            logs: sink,
            cancel,
        }
    }

    #[test]
    fn test_mock_succeeds_with_prompt_preview() {
        tokio_test::block_on(async {
            let agent = MockAgent::new("mock").with_delay(Duration::from_millis(1));
            let cancel = CancellationToken::new();
            let sink = NullLogSink;
            let output = agent.run(request(&cancel, &sink)).await.expect("output");
            assert!(output.summary.contains("simulate something useful"));
        });
    }

    #[test]
    fn test_mock_fails_transient_then_recovers() {
        tokio_test::block_on(async {
            let agent = MockAgent::new("mock")
                .with_delay(Duration::from_millis(1))
                .failing_transient(2);
            let cancel = CancellationToken::new();
            let sink = NullLogSink;

            for _ in 0..2 {
                let err = agent.run(request(&cancel, &sink)).await.expect_err("fail");
                assert!(err.is_transient());
            }
            assert!(agent.run(request(&cancel, &sink)).await.is_ok());
        });
    }

    #[test]
    fn test_mock_observes_cancellation() {
        tokio_test::block_on(async {
            let agent = MockAgent::new("mock").with_delay(Duration::from_secs(30));
            let cancel = CancellationToken::new();
            cancel.cancel();
            let sink = NullLogSink;
            let err = agent.run(request(&cancel, &sink)).await.expect_err("cancelled");
            assert!(matches!(err, AgentError::Cancelled));
        });
    }
}
