//! Docker HEALTHCHECK readiness check.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ReadinessCheck, Result, WaitError};
use crate::engine::EngineClient;

/// Ready once the engine reports the container as `healthy`.
///
/// Fails on the first poll if the image defines no HEALTHCHECK, since the
/// status would never change.
pub struct HealthCheck {
    client: Arc<EngineClient>,
    container_id: String,
    first: bool,
}

impl HealthCheck {
    pub fn new(client: Arc<EngineClient>, container_id: impl Into<String>) -> Self {
        Self {
            client,
            container_id: container_id.into(),
            first: true,
        }
    }
}

#[async_trait]
impl ReadinessCheck for HealthCheck {
    fn label(&self) -> String {
        format!("on healthcheck '{}'", self.container_id)
    }

    async fn poll(&mut self) -> Result<bool> {
        let details = match self.client.inspect_container(&self.container_id).await {
            Ok(Some(details)) => details,
            Ok(None) => return Ok(false),
            Err(e) => {
                tracing::debug!("Inspect of {} failed: {}", self.container_id, e);
                return Ok(false);
            }
        };
        if std::mem::take(&mut self.first) && !details.has_health_check() {
            return Err(WaitError::CheckFailed {
                check: self.label(),
                reason: format!(
                    "Can not wait for healthy state of {}. No HEALTHCHECK configured.",
                    self.container_id
                ),
            });
        }
        Ok(details.health_status() == Some("healthy"))
    }
}
