//! Bidirectional relay between the client and a committed remote stream

use crate::outbound::RemoteStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Per-direction copy buffer
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Copy bytes both ways until each direction reaches end-of-stream.
///
/// client->remote runs in its own task and half-closes the remote write
/// side when done; remote->client runs here, half-closes the remote read
/// side and ends the client write side. Returns `(upload, download)`.
pub async fn relay<C>(client: C, remote: RemoteStream) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut remote_reader, mut remote_writer) = remote.into_split();

    let upload = tokio::spawn(async move {
        let n = copy_until_eof(&mut client_reader, &mut remote_writer, "upload").await;
        if let Err(e) = remote_writer.close_write().await {
            debug!("remote write half-close failed: {}", e);
        }
        n
    });

    let download = copy_until_eof(&mut remote_reader, &mut client_writer, "download").await;
    if let Err(e) = remote_reader.close_read() {
        debug!("remote read half-close failed: {}", e);
    }
    if let Err(e) = client_writer.shutdown().await {
        debug!("client write half-close failed: {}", e);
    }

    let upload = upload.await.unwrap_or_default();
    (upload, download)
}

async fn copy_until_eof<R, W>(reader: &mut R, writer: &mut W, direction: &str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("{} read error: {}", direction, e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!("{} write error: {}", direction, e);
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!("{} flush error: {}", direction, e);
            break;
        }
        total += n as u64;
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_client_eof_half_closes_remote_write_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel();

        // Origin: read the whole upload, then answer on the still-open socket
        tokio::spawn(async move {
            let (mut origin, _) = listener.accept().await.unwrap();
            let mut upload = Vec::new();
            origin.read_to_end(&mut upload).await.unwrap();
            let _ = seen_tx.send(upload);
            tokio::time::sleep(Duration::from_millis(50)).await;
            origin.write_all(b"response after upload eof").await.unwrap();
        });

        let remote = RemoteStream::Tcp(TcpStream::connect(addr).await.unwrap());
        let (client, mut browser) = tokio::io::duplex(64 * 1024);
        let relay_task = tokio::spawn(relay(client, remote));

        browser.write_all(b"request body").await.unwrap();
        browser.shutdown().await.unwrap();

        let upload = tokio::time::timeout(Duration::from_secs(5), seen_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(upload, b"request body");

        let mut download = Vec::new();
        browser.read_to_end(&mut download).await.unwrap();
        assert_eq!(download, b"response after upload eof");

        let (up, down) = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(up, 12);
        assert_eq!(down, 25);
    }

    #[tokio::test]
    async fn test_remote_eof_reaches_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut origin, _) = listener.accept().await.unwrap();
            origin.write_all(b"banner").await.unwrap();
            origin.shutdown().await.unwrap();
            let mut rest = Vec::new();
            let _ = origin.read_to_end(&mut rest).await;
        });

        let remote = RemoteStream::Tcp(TcpStream::connect(addr).await.unwrap());
        let (client, mut browser) = tokio::io::duplex(1024);
        let relay_task = tokio::spawn(relay(client, remote));

        let mut download = Vec::new();
        browser.read_to_end(&mut download).await.unwrap();
        assert_eq!(download, b"banner");

        drop(browser);
        let (up, down) = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((up, down), (0, 6));
    }
}
