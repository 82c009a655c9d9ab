//! TCP port readiness check.

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{PROBE_TIMEOUT, ReadinessCheck, Result};

/// Ready once every port on `host` has accepted a connection.
///
/// Ports that answered once are not probed again.
pub struct TcpCheck {
    host: String,
    ports: Vec<u16>,
    pending: Vec<u16>,
}

impl TcpCheck {
    pub fn new(host: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            host: host.into(),
            pending: ports.clone(),
            ports,
        }
    }

    pub fn pending(&self) -> &[u16] {
        &self.pending
    }

    async fn probe(&self, port: u16) -> bool {
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((self.host.as_str(), port)))
            .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::trace!("{}:{} not reachable: {}", self.host, port, e);
                false
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ReadinessCheck for TcpCheck {
    fn label(&self) -> String {
        let ports: Vec<String> = self.ports.iter().map(u16::to_string).collect();
        format!("on tcp port '{}' [{}]", ports.join(", "), self.host)
    }

    async fn poll(&mut self) -> Result<bool> {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for &port in &self.pending {
            if !self.probe(port).await {
                still_pending.push(port);
            }
        }
        self.pending = still_pending;
        Ok(self.pending.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_port_is_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut check = TcpCheck::new("127.0.0.1", vec![port]);
        assert!(check.poll().await.unwrap());
        assert!(check.pending().is_empty());
    }

    #[tokio::test]
    async fn test_success_is_cumulative() {
        let open = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = open.local_addr().unwrap().port();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let mut check = TcpCheck::new("127.0.0.1", vec![open_port, closed_port]);
        assert!(!check.poll().await.unwrap());
        assert_eq!(check.pending(), &[closed_port]);

        // The first port going away later does not matter any more.
        drop(open);
        let reopened = TcpListener::bind(("127.0.0.1", closed_port)).await.unwrap();
        assert!(check.poll().await.unwrap());
        drop(reopened);
    }

    #[test]
    fn test_label() {
        let check = TcpCheck::new("10.0.0.2", vec![5432, 6379]);
        assert_eq!(check.label(), "on tcp port '5432, 6379' [10.0.0.2]");
    }
}
