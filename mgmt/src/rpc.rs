// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The control-socket wire protocol: length-prefixed JSON frames.
//!
//! One request per frame, one response per frame, except `Subscribe`, which
//! turns the connection into an event stream. Peer identity comes from
//! SO_PEERCRED on the unix socket, not from anything in-band.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// Frames above this are rejected outright; only `StageBinary` approaches
/// it.
pub const MAX_FRAME: usize = 128 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    #[must_use]
    pub fn ok(id: u64, result: Value) -> RpcResponse {
        RpcResponse {
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn fail(id: u64, kind: &str, message: &str, path: Option<String>) -> RpcResponse {
        RpcResponse {
            id,
            result: None,
            error: Some(RpcErrorBody {
                kind: kind.to_string(),
                message: message.to_string(),
                path,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },
}

pub async fn write_frame<W, T>(writer: &mut W, payload: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(payload)?;
    if body.len() > MAX_FRAME {
        return Err(RpcError::TooLarge(body.len()));
    }
    let len = u32::try_from(body.len()).map_err(|_| RpcError::TooLarge(body.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, RpcError>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(RpcError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Blocking-free client used by the CLI and the API process.
pub struct RpcClient {
    stream: UnixStream,
    next_id: u64,
}

impl RpcClient {
    pub async fn connect(socket: &Path) -> Result<RpcClient, RpcError> {
        Ok(RpcClient {
            stream: UnixStream::connect(socket).await?,
            next_id: 1,
        })
    }

    /// One call, one response. Remote errors surface as `RpcError::Remote`
    /// with the stable kind string.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id;
        self.next_id += 1;
        write_frame(
            &mut self.stream,
            &RpcRequest {
                id,
                method: method.to_string(),
                params,
            },
        )
        .await?;
        let response: RpcResponse = read_frame(&mut self.stream).await?;
        match response.error {
            Some(error) => Err(RpcError::Remote {
                kind: error.kind,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Switch the connection into subscription mode and read event frames.
    pub async fn subscribe(mut self, topics: Vec<String>) -> Result<EventStream, RpcError> {
        write_frame(
            &mut self.stream,
            &RpcRequest {
                id: 0,
                method: "Subscribe".to_string(),
                params: serde_json::json!({ "topics": topics }),
            },
        )
        .await?;
        Ok(EventStream {
            stream: self.stream,
        })
    }
}

pub struct EventStream {
    stream: UnixStream,
}

impl EventStream {
    pub async fn next(&mut self) -> Result<Value, RpcError> {
        read_frame(&mut self.stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = RpcRequest {
            id: 7,
            method: "GetLeases".to_string(),
            params: Value::Null,
        };
        write_frame(&mut a, &request).await.unwrap();
        let decoded: RpcRequest = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.method, "GetLeases");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let huge = (u32::try_from(MAX_FRAME).unwrap() + 1).to_be_bytes();
            let _ = a.write_all(&huge).await;
        });
        let result: Result<RpcRequest, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(RpcError::TooLarge(_))));
    }

    #[test]
    fn error_body_serializes_kind() {
        let response = RpcResponse::fail(1, "validation", "bad zone", Some("zone[x]".into()));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["kind"], "validation");
        assert_eq!(json["error"]["path"], "zone[x]");
        assert!(json.get("result").is_none());
    }
}
