//! Extension socket frames using rkyv for zero-copy serialization
//!
//! Format on the wire: `[4-byte length (little-endian)][rkyv bytes]`.

use crate::error::{BrokerError, Result};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted from the daemon.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Request from broker to daemon
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Check that the extension manager is answering
    Ping,
    /// Run a SQL query against the daemon's tables
    Query { sql: String },
}

/// Response from daemon to broker
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Response {
    /// Response to Ping
    Pong { uuid: String },
    /// Result rows, each a list of (column, value) pairs
    Rows { rows: Vec<Vec<(String, String)>> },
    /// Daemon-side failure with its status code
    Error { code: i32, message: String },
}

pub struct MessageFrame;

impl MessageFrame {
    /// Encode a request to bytes with length prefix
    pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)
            .map_err(|e| BrokerError::Protocol(format!("encode request: {e}")))?;
        Ok(Self::with_length(&bytes))
    }

    /// Encode a response to bytes with length prefix
    pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)
            .map_err(|e| BrokerError::Protocol(format!("encode response: {e}")))?;
        Ok(Self::with_length(&bytes))
    }

    pub fn decode_request(payload: &AlignedVec) -> Result<Request> {
        rkyv::from_bytes::<Request, rkyv::rancor::Error>(payload)
            .map_err(|e| BrokerError::Protocol(format!("decode request: {e}")))
    }

    pub fn decode_response(payload: &AlignedVec) -> Result<Response> {
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(payload)
            .map_err(|e| BrokerError::Protocol(format!("decode response: {e}")))
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    /// Read one length-prefixed payload into an aligned buffer.
    pub async fn read_frame<R>(reader: &mut R) -> Result<AlignedVec>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = Self::read_length(&len_buf);
        if len > MAX_FRAME_LEN {
            return Err(BrokerError::Protocol(format!(
                "frame of {len} bytes exceeds limit"
            )));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        let mut aligned = AlignedVec::new();
        aligned.extend_from_slice(&payload);
        Ok(aligned)
    }

    pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn with_length(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }
}
