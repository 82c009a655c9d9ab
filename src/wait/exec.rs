//! Exec command readiness check.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ReadinessCheck, Result};
use crate::engine::EngineClient;

/// Ready once `command`, run inside the container, exits with 0.
pub struct ExecCheck {
    client: Arc<EngineClient>,
    container_id: String,
    command: Vec<String>,
}

impl ExecCheck {
    pub fn new(
        client: Arc<EngineClient>,
        container_id: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            client,
            container_id: container_id.into(),
            command,
        }
    }

    async fn run(&self) -> crate::engine::Result<Option<i64>> {
        let exec_id = self
            .client
            .create_exec(&self.container_id, self.command.clone())
            .await?;
        let output = self.client.start_exec(&exec_id).await?;
        if !output.is_empty() {
            tracing::trace!("exec output: {}", output);
        }
        Ok(self.client.inspect_exec(&exec_id).await?.exit_code)
    }
}

#[async_trait]
impl ReadinessCheck for ExecCheck {
    fn label(&self) -> String {
        format!("on exec '{}'", self.command.join(" "))
    }

    async fn poll(&mut self) -> Result<bool> {
        match self.run().await {
            Ok(code) => Ok(code == Some(0)),
            Err(e) => {
                tracing::debug!("Exec in {} failed: {}", self.container_id, e);
                Ok(false)
            }
        }
    }
}
