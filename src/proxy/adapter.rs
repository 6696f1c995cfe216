//! Dial adapter handed to the SOCKS5 server.

use crate::error::WgProxyError;
use crate::transport::{Dialer, StreamDyn};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Targets starting with this prefix are refused.
pub const LOOPBACK_GUARD_PREFIX: &str = "127.0.0.1:";

/// Wraps the tunnel dialer for SOCKS5 clients.
///
/// Refuses loopback targets so proxy clients cannot reach services bound
/// on the tunnel host itself, and logs every dial outcome.
#[derive(Debug, Clone)]
pub struct ProxyDialer {
    inner: Arc<dyn Dialer>,
    loopback_prefix: String,
}

impl ProxyDialer {
    /// Guard `inner` with the default loopback prefix.
    pub fn new(inner: Arc<dyn Dialer>) -> Self {
        ProxyDialer {
            inner,
            loopback_prefix: LOOPBACK_GUARD_PREFIX.to_string(),
        }
    }

    /// Replace the refused address prefix
    pub fn with_loopback_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.loopback_prefix = prefix.into();
        self
    }

    /// Open a connection to `addr` over `network` (`tcp` or `tcp4`).
    pub async fn dial(&self, network: &str, addr: &str) -> Result<Box<dyn StreamDyn>> {
        if addr.starts_with(&self.loopback_prefix) {
            warn!("Dial {} / {} -> refused: loopback target", network, addr);
            return Err(WgProxyError::LoopbackForbidden(addr.to_string()).into());
        }

        let result = match network {
            "tcp" | "tcp4" => self.inner.dial_stream(addr).await,
            other => Err(WgProxyError::UnsupportedNetwork(other.to_string()).into()),
        };

        match &result {
            Ok(_) => info!("Dial {} / {} -> success", network, addr),
            Err(e) => warn!("Dial {} / {} -> failed: {:#}", network, addr, e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Datagram;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingDialer {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial_stream(&self, addr: &str) -> Result<Box<dyn StreamDyn>> {
            self.calls.lock().unwrap().push(addr.to_string());
            let (a, _b) = tokio::io::duplex(64);
            Ok(Box::new(a))
        }

        async fn dial_datagram(&self, addr: &str) -> Result<Arc<dyn Datagram>> {
            anyhow::bail!("no datagrams to {}", addr)
        }
    }

    #[tokio::test]
    async fn test_loopback_is_refused_before_dialing() {
        let inner = Arc::new(RecordingDialer::default());
        let dialer = ProxyDialer::new(inner.clone());

        let err = dialer.dial("tcp", "127.0.0.1:22").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WgProxyError>(),
            Some(WgProxyError::LoopbackForbidden(_))
        ));
        assert!(inner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_targets_pass_through() {
        let inner = Arc::new(RecordingDialer::default());
        let dialer = ProxyDialer::new(inner.clone());

        dialer.dial("tcp", "10.0.0.1:80").await.unwrap();
        // only the exact prefix is guarded
        dialer.dial("tcp4", "127.0.0.2:80").await.unwrap();
        assert_eq!(
            *inner.calls.lock().unwrap(),
            vec!["10.0.0.1:80".to_string(), "127.0.0.2:80".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unsupported_network() {
        let inner = Arc::new(RecordingDialer::default());
        let dialer = ProxyDialer::new(inner.clone());

        let err = dialer.dial("unix", "10.0.0.1:80").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WgProxyError>(),
            Some(WgProxyError::UnsupportedNetwork(_))
        ));
        assert!(inner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let inner = Arc::new(RecordingDialer::default());
        let dialer = ProxyDialer::new(inner).with_loopback_prefix("10.0.0.");

        assert!(dialer.dial("tcp", "10.0.0.9:80").await.is_err());
        assert!(dialer.dial("tcp", "127.0.0.1:80").await.is_ok());
    }
}
