use super::protocol::{MessageFrame, Request, Response};
use super::{Connector, ExtensionClient, QueryRows};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace};

#[cfg(unix)]
type Stream = tokio::net::UnixStream;

#[cfg(windows)]
type Stream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Persistent connection to the daemon's extension socket.
///
/// Calls are serialized over the single connection. A timed out call drops
/// the connection, since a late reply would desynchronize the framing.
pub struct SocketClient {
    socket: PathBuf,
    timeout: Duration,
    stream: Mutex<Option<Stream>>,
}

impl SocketClient {
    pub async fn connect(socket: &Path, timeout: Duration) -> Result<Self> {
        let connect_err = |source: std::io::Error| BrokerError::Connect {
            socket: socket.to_path_buf(),
            source,
        };

        let stream = tokio::time::timeout(timeout, open_stream(socket))
            .await
            .map_err(|_| connect_err(std::io::ErrorKind::TimedOut.into()))?
            .map_err(connect_err)?;

        debug!(socket = %socket.display(), "Connected to extension socket");

        Ok(Self {
            socket: socket.to_path_buf(),
            timeout,
            stream: Mutex::new(Some(stream)),
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn call(&self, request: &Request) -> Result<Response> {
        let frame = MessageFrame::encode_request(request)?;

        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| BrokerError::Protocol("connection closed".into()))?;

        trace!(socket = %self.socket.display(), bytes = frame.len(), "Sending request");

        match tokio::time::timeout(self.timeout, round_trip(stream, &frame)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(BrokerError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}

#[async_trait]
impl ExtensionClient for SocketClient {
    async fn query(&self, sql: &str) -> Result<QueryRows> {
        let request = Request::Query {
            sql: sql.to_string(),
        };
        match self.call(&request).await? {
            Response::Rows { rows } => Ok(rows
                .into_iter()
                .map(|row| row.into_iter().collect())
                .collect()),
            Response::Error { code, message } => Err(BrokerError::QueryFailed { code, message }),
            other => Err(BrokerError::Protocol(format!(
                "unexpected response to query: {other:?}"
            ))),
        }
    }

    async fn ping(&self) -> Result<()> {
        match self.call(&Request::Ping).await? {
            Response::Pong { uuid } => {
                trace!(uuid = %uuid, "Extension manager answered ping");
                Ok(())
            }
            Response::Error { code, message } => Err(BrokerError::QueryFailed { code, message }),
            other => Err(BrokerError::Protocol(format!(
                "unexpected response to ping: {other:?}"
            ))),
        }
    }

    async fn close(&self) {
        if self.stream.lock().await.take().is_some() {
            debug!(socket = %self.socket.display(), "Extension socket closed");
        }
    }
}

async fn round_trip(stream: &mut Stream, frame: &[u8]) -> Result<Response> {
    MessageFrame::write_frame(stream, frame).await?;
    let payload = MessageFrame::read_frame(stream).await?;
    MessageFrame::decode_response(&payload)
}

#[cfg(unix)]
async fn open_stream(socket: &Path) -> std::io::Result<Stream> {
    tokio::net::UnixStream::connect(socket).await
}

#[cfg(windows)]
async fn open_stream(socket: &Path) -> std::io::Result<Stream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(socket)
}

/// Builds [`SocketClient`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketConnector;

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self, socket: &Path, timeout: Duration) -> Result<Arc<dyn ExtensionClient>> {
        let client = SocketClient::connect(socket, timeout).await?;
        Ok(Arc::new(client))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Answers each request on one connection until it closes.
    fn serve(listener: UnixListener, respond: fn(Request) -> Option<Response>) {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            loop {
                let Ok(payload) = MessageFrame::read_frame(&mut stream).await else {
                    return;
                };
                let request = MessageFrame::decode_request(&payload).unwrap();
                let Some(response) = respond(request) else {
                    // Hold the connection open without answering.
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    return;
                };
                let frame = MessageFrame::encode_response(&response).unwrap();
                MessageFrame::write_frame(&mut stream, &frame).await.unwrap();
            }
        });
    }

    fn socket_in(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("osquery.em")
    }

    #[tokio::test]
    async fn query_returns_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_in(&dir);
        serve(UnixListener::bind(&path).unwrap(), |request| match request {
            Request::Query { sql } if sql == "select 1" => Some(Response::Rows {
                rows: vec![vec![("1".into(), "1".into())]],
            }),
            Request::Ping => Some(Response::Pong { uuid: "42".into() }),
            Request::Query { .. } => Some(Response::Error {
                code: 1,
                message: "no such table".into(),
            }),
        });

        let client = SocketClient::connect(&path, Duration::from_secs(2)).await.unwrap();
        client.ping().await.unwrap();

        let rows = client.query("select 1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("1").map(String::as_str), Some("1"));

        let err = client.query("select * from nope").await.unwrap_err();
        assert!(matches!(err, BrokerError::QueryFailed { code: 1, .. }));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn connect_without_listener_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = SocketClient::connect(&socket_in(&dir), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::Connect { .. }));
    }

    #[tokio::test]
    async fn timeout_drops_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_in(&dir);
        serve(UnixListener::bind(&path).unwrap(), |_| None);

        let client = SocketClient::connect(&path, Duration::from_secs(1)).await.unwrap();
        let err = client.query("select 1").await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(1)));

        let err = client.query("select 1").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn closed_client_rejects_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_in(&dir);
        serve(UnixListener::bind(&path).unwrap(), |_| {
            Some(Response::Pong { uuid: "1".into() })
        });

        let client = SocketConnector
            .connect(&path, Duration::from_secs(1))
            .await
            .unwrap();
        client.close().await;
        assert!(client.ping().await.unwrap_err().is_transport());
    }
}
