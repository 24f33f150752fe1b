//! Direct reachability probe for undecided plain-HTTP destinations

use crate::common::Target;
use crate::Result;
use std::time::Duration;
use tracing::debug;

pub const DETECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Issues `GET http://<target>/favicon.ico` without any proxy.
///
/// Any response counts as reachable; only transport failures and timeouts
/// are errors.
pub struct DetectProbe {
    client: reqwest::Client,
}

impl DetectProbe {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DETECT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(DetectProbe { client })
    }

    pub async fn probe(&self, target: &Target) -> Result<()> {
        let url = format!("http://{}/favicon.ico", target);
        let resp = self.client.get(&url).send().await?;
        debug!("detect probe {} -> {}", url, resp.status());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_any_status_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let probe = DetectProbe::new().unwrap();
        probe.probe(&Target::new("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_is_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = DetectProbe::new().unwrap();
        assert!(probe.probe(&Target::new("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let probe = DetectProbe::with_timeout(Duration::from_millis(200)).unwrap();
        assert!(probe.probe(&Target::new("127.0.0.1", port)).await.is_err());
    }
}
