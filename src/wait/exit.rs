//! Exit code readiness check.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ReadinessCheck, Result};
use crate::engine::EngineClient;

/// Ready once the container has exited with `expected`.
pub struct ExitCodeCheck {
    client: Arc<EngineClient>,
    container_id: String,
    expected: i64,
}

impl ExitCodeCheck {
    pub fn new(client: Arc<EngineClient>, container_id: impl Into<String>, expected: i64) -> Self {
        Self {
            client,
            container_id: container_id.into(),
            expected,
        }
    }
}

#[async_trait]
impl ReadinessCheck for ExitCodeCheck {
    fn label(&self) -> String {
        format!("on exit code {}", self.expected)
    }

    async fn poll(&mut self) -> Result<bool> {
        let details = self.client.inspect_container(&self.container_id).await?;
        Ok(details
            .and_then(|d| d.exit_code())
            .is_some_and(|code| code == self.expected))
    }

    fn expects_exit(&self) -> bool {
        true
    }
}
