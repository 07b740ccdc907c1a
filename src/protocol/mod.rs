//! Messages exchanged between the pool and its worker processes.
//!
//! Every message is a JSON document carried in a length-prefixed frame
//! (4-byte big-endian length, then the body). The pool writes to the
//! worker's stdin and reads from its stdout; closing stdin asks the
//! worker to exit.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, io};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead, LengthDelimitedCodec};

/// Largest frame either side accepts (16 MiB)
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Pool -> worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolMessage {
    Task { id: String, payload: Value },
}

/// Worker -> pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Log {
        level: LogLevel,
        message: String,
        #[serde(default)]
        data: Value,
    },
    Progress {
        id: String,
        value: Value,
    },
    Completed {
        id: String,
        #[serde(default)]
        result: Value,
    },
    Failed {
        id: String,
        error: WorkerError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured error reported by the per-task work function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            details: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "{}: {}", kind, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        WorkerError::new(format!("{err:#}"))
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame codec shared by both ends of the pipe
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Split plain text output (worker stderr, downloader output) into lines.
///
/// Invalid UTF-8 is replaced rather than ending the stream.
pub fn lossy_lines<R>(reader: R) -> impl Stream<Item = io::Result<String>> + Unpin
where
    R: AsyncRead + Unpin,
{
    FramedRead::new(reader, AnyDelimiterCodec::new(b"\n".to_vec(), Vec::new())).map(|chunk| {
        chunk
            .map(|line| String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
            .map_err(io::Error::other)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use serde_json::json;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_task_message_shape() {
        let msg = PoolMessage::Task {
            id: "t1".to_string(),
            payload: json!({"url": "https://example.com/v"}),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "task", "id": "t1", "payload": {"url": "https://example.com/v"}})
        );
    }

    #[test]
    fn test_worker_messages_from_wire() {
        let log: WorkerMessage =
            decode(br#"{"type":"log","level":"warn","message":"retrying"}"#).unwrap();
        assert_eq!(
            log,
            WorkerMessage::Log {
                level: LogLevel::Warn,
                message: "retrying".to_string(),
                data: Value::Null,
            }
        );

        let failed: WorkerMessage = decode(
            br#"{"type":"failed","id":"t9","error":{"message":"403","kind":"fetch_failed"}}"#,
        )
        .unwrap();
        match failed {
            WorkerMessage::Failed { id, error } => {
                assert_eq!(id, "t9");
                assert_eq!(error.kind.as_deref(), Some("fetch_failed"));
                assert_eq!(error.to_string(), "fetch_failed: 403");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result: Result<WorkerMessage, _> = decode(br#"{"type":"bogus","id":"x"}"#);
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_frames_are_length_prefixed() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        let body = encode(&PoolMessage::Task {
            id: "a".to_string(),
            payload: Value::Null,
        })
        .unwrap();
        codec.encode(body.clone(), &mut buf).unwrap();

        assert_eq!(&buf[..4], &(body.len() as u32).to_be_bytes());

        // A partial frame yields nothing until the rest arrives
        let mut partial = buf.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&frame[..], &body[..]);
    }

    #[tokio::test]
    async fn test_lossy_lines_survive_invalid_utf8() {
        let output: &[u8] = b"[download]  10.0%\r\nfetchpool-path=/media/caf\xe9.mp4\ntail without newline";
        let lines: Vec<String> = lossy_lines(output)
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(
            lines,
            vec![
                "[download]  10.0%",
                "fetchpool-path=/media/caf\u{fffd}.mp4",
                "tail without newline",
            ]
        );
    }
}
