// src/control_rpc.rs
//
// The control RPC server: a length-prefixed JSON envelope over a Unix
// domain socket, directly modeled on `socket_communication.rs`'s
// `send_message`/`receive_message` (4-byte big-endian length prefix,
// `serde_json` payload). `query`'s reply is a sequence of such frames
// terminated by a zero-length frame, serviced on its own task per
// connection so one slow client never blocks another.

use crate::error::Error;
use crate::job::JobSpec;
use crate::log;
use crate::logger::LogLevel;
use crate::supervisor::{QueryFilter, Supervisor};
use crate::users::set_path_permission;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum RpcRequest {
    Load(JobSpec),
    Unload { name_or_id: String },
    Start { name_or_id: String },
    Stop { name_or_id: String },
    Query {
        #[serde(default)]
        filter: Vec<(String, String, String)>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        offset: usize,
    },
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl From<&Error> for RpcError {
    fn from(err: &Error) -> Self {
        RpcError {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub result: Option<serde_json::Value>,
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn ok(result: serde_json::Value) -> Self {
        RpcResponse {
            result: Some(result),
            error: None,
        }
    }

    fn err(err: &Error) -> Self {
        RpcResponse {
            result: None,
            error: Some(err.into()),
        }
    }
}

/// Binds the control socket, applying the configured permission bits after
/// bind (the same post-bind `chmod` shape `socket_communication.rs`'s
/// ownership helpers and `users.rs::set_file_permission` use), and serves
/// connections until the listener is dropped.
pub async fn serve(
    supervisor: Arc<Supervisor>,
    socket_path: &str,
    socket_permissions: u32,
) -> Result<(), Error> {
    let path = strip_unix_scheme(socket_path);
    if Path::new(path).exists() {
        let _ = std::fs::remove_file(path);
    }

    let listener = UnixListener::bind(path)?;
    set_path_permission(Path::new(path), socket_permissions)?;
    log!(LogLevel::Info, "control RPC listening on {}", path);

    loop {
        let (stream, _addr) = listener.accept().await?;
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, supervisor).await {
                log!(LogLevel::Warn, "control RPC connection ended: {}", err);
            }
        });
    }
}

fn strip_unix_scheme(path: &str) -> &str {
    path.strip_prefix("unix://").unwrap_or(path)
}

async fn handle_connection(mut stream: UnixStream, supervisor: Arc<Supervisor>) -> Result<(), Error> {
    loop {
        let request = match read_frame(&mut stream).await? {
            Some(bytes) => bytes,
            None => return Ok(()),
        };

        let request: RpcRequest = match serde_json::from_slice(&request) {
            Ok(req) => req,
            Err(err) => {
                let response = RpcResponse::err(&Error::Invalid(err.to_string()));
                write_frame(&mut stream, &response).await?;
                continue;
            }
        };

        match request {
            RpcRequest::Query {
                filter,
                limit,
                offset,
            } => {
                let filter = QueryFilter {
                    equals: filter
                        .into_iter()
                        .filter(|(_, op, _)| op == "=")
                        .map(|(field, _, value)| (field, value))
                        .collect(),
                    limit,
                    offset,
                };
                let rows = supervisor.query(filter).await;
                for row in &rows {
                    let value = serde_json::to_value(row).map_err(Error::from)?;
                    write_frame(&mut stream, &RpcResponse::ok(value)).await?;
                }
                write_empty_frame(&mut stream).await?;
            }
            other => {
                let response = dispatch_single(&supervisor, other).await;
                write_frame(&mut stream, &response).await?;
            }
        }
    }
}

async fn dispatch_single(supervisor: &Arc<Supervisor>, request: RpcRequest) -> RpcResponse {
    let result: Result<serde_json::Value, Error> = async {
        match request {
            RpcRequest::Load(spec) => {
                let id = supervisor.load(spec).await?;
                Ok(serde_json::json!({ "job-id": id }))
            }
            RpcRequest::Unload { name_or_id } => {
                supervisor.unload(&name_or_id).await?;
                Ok(serde_json::Value::Null)
            }
            RpcRequest::Start { name_or_id } => {
                supervisor.start(&name_or_id).await?;
                Ok(serde_json::Value::Null)
            }
            RpcRequest::Stop { name_or_id } => {
                supervisor.stop(&name_or_id).await?;
                Ok(serde_json::Value::Null)
            }
            RpcRequest::Query { .. } => unreachable!("handled by the streaming path"),
        }
    }
    .await;

    match result {
        Ok(value) => RpcResponse::ok(value),
        Err(err) => RpcResponse::err(&err),
    }
}

async fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>, Error> {
    let mut length_bytes = [0u8; 4];
    if let Err(err) = stream.read_exact(&mut length_bytes).await {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err.into());
    }
    let length = u32::from_be_bytes(length_bytes) as usize;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_frame<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<(), Error> {
    let bytes = serde_json::to_vec(message).map_err(Error::from)?;
    let length = (bytes.len() as u32).to_be_bytes();
    stream.write_all(&length).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

async fn write_empty_frame(stream: &mut UnixStream) -> Result<(), Error> {
    stream.write_all(&0u32.to_be_bytes()).await?;
    Ok(())
}
