//! RPC client for the privileged sanitize server.
//!
//! Requests may be issued concurrently from several tasks. A background reader
//! routes every response to the caller waiting on its message id; interim
//! `202` responses are logged and the caller keeps waiting for the final one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mg_protocol::{
    ControlAction, MessageIdGen, ProtocolError, RequestEnvelope, ResponseEnvelope,
    SanitizeRequest, decode_response, encode_line,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{self, BoxedReader, BoxedWriter};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {endpoint} after {attempts} attempts: {last}")]
    Connect {
        endpoint: String,
        attempts: u32,
        last: String,
    },
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("cannot encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no response to message {id} within {timeout:?}")]
    Timeout { id: i64, timeout: Duration },
    #[error("connection closed")]
    Closed,
    #[error("unexpected response {code}: {msg}")]
    Unexpected { code: u32, msg: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_attempts: u32,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    pub control_timeout: Duration,
    pub sanitize_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
            control_timeout: Duration::from_secs(5),
            sanitize_timeout: Duration::from_secs(5 * 60),
        }
    }
}

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<ResponseEnvelope>>>>;

pub struct RpcClient {
    client_id: String,
    ids: MessageIdGen,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Pending,
    reader: JoinHandle<()>,
    config: ClientConfig,
}

impl RpcClient {
    /// Connect with retries; each attempt is bounded by `connect_timeout`.
    pub async fn connect(
        endpoint: &str,
        client_id: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let attempts = config.connect_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            info!("connecting to {endpoint}, attempt {attempt}/{attempts}");
            match tokio::time::timeout(config.connect_timeout, transport::connect(endpoint)).await
            {
                Ok(Ok((reader, writer))) => {
                    info!("connected to {endpoint}");
                    return Ok(Self::from_parts(reader, writer, client_id, config));
                }
                Ok(Err(e)) => last = e.to_string(),
                Err(_) => last = format!("timed out after {:?}", config.connect_timeout),
            }
            warn!("connect attempt {attempt} failed: {last}");
            if attempt < attempts {
                tokio::time::sleep(config.retry_delay).await;
            }
        }
        Err(ClientError::Connect {
            endpoint: endpoint.to_string(),
            attempts,
            last,
        })
    }

    pub fn from_parts(
        reader: BoxedReader,
        writer: BoxedWriter,
        client_id: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let client_id = client_id.into();
        let pending: Pending = Arc::default();
        let reader = tokio::spawn(read_responses(reader, client_id.clone(), pending.clone()));
        Self {
            client_id,
            ids: MessageIdGen::new(),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            reader,
            config,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Liveness check; the server must answer `200 pong`.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let resp = self.control(ControlAction::Ping).await?;
        if resp.is_success() && resp.additional_msg == "pong" {
            Ok(())
        } else {
            Err(ClientError::Unexpected {
                code: resp.result_code,
                msg: resp.additional_msg,
            })
        }
    }

    /// Ask the server to shut down once in-flight work drains.
    pub async fn quit(&self) -> Result<ResponseEnvelope, ClientError> {
        self.control(ControlAction::Quit).await
    }

    /// Close this connection only; the server keeps running.
    pub async fn disconnect(&self) -> Result<ResponseEnvelope, ClientError> {
        self.control(ControlAction::Disconn).await
    }

    pub async fn control(&self, action: ControlAction) -> Result<ResponseEnvelope, ClientError> {
        let id = self.ids.next_id();
        info!(id, "sending control {action:?}");
        let env = RequestEnvelope::control(&self.client_id, id, action)?;
        self.call(env, self.config.control_timeout).await
    }

    /// Send one document and wait for its final result.
    pub async fn sanitize(&self, req: &SanitizeRequest) -> Result<ResponseEnvelope, ClientError> {
        let id = self.ids.next_id();
        info!(
            id,
            detection = %req.detection_name,
            "sending sanitize request for {}", req.path
        );
        let env = RequestEnvelope::sanitize(&self.client_id, id, req)?;
        self.call(env, self.config.sanitize_timeout).await
    }

    async fn call(
        &self,
        env: RequestEnvelope,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, ClientError> {
        let id = env.message_id;
        let line = encode_line(&env)?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let written = {
            let mut w = self.writer.lock().await;
            match w.write_all(&line).await {
                Ok(()) => w.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            lock(&self.pending).remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => {
                debug!(id, code = resp.result_code, "response: {}", resp.additional_msg);
                Ok(resp)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(ClientError::Timeout { id, timeout })
            }
        }
    }

    /// Close the transport and stop the reader.
    pub async fn close(self) {
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
        drop(w);
        self.reader.abort();
        lock(&self.pending).clear();
    }
}

async fn read_responses(reader: BoxedReader, client_id: String, pending: Pending) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("read from server failed: {e}");
                break;
            }
        };
        let resp = match decode_response(&line) {
            Ok(resp) => resp,
            Err(ProtocolError::Empty) => continue,
            Err(e) => {
                warn!("dropping malformed response: {e}");
                continue;
            }
        };
        if resp.client_id != client_id {
            warn!(
                id = resp.message_id,
                "dropping response addressed to client {:?}", resp.client_id
            );
            continue;
        }
        if resp.is_interim() {
            debug!(id = resp.message_id, "accepted: {}", resp.additional_msg);
            continue;
        }
        match lock(&pending).remove(&resp.message_id) {
            Some(waiter) => {
                let _ = waiter.send(resp);
            }
            None => warn!(id = resp.message_id, "response for unknown message"),
        }
    }
    // Waiters see `Closed` once their senders are dropped.
    lock(&pending).clear();
}

fn lock(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<i64, oneshot::Sender<ResponseEnvelope>>> {
    match pending.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use mg_protocol::{ResultCode, decode_request};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    use super::*;

    fn fast() -> ClientConfig {
        ClientConfig {
            control_timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn interim_then_final_reply_resolves_sanitize() {
        let (client_side, server_side) = duplex(4096);
        let (cr, cw) = tokio::io::split(client_side);
        let client = RpcClient::from_parts(Box::new(cr), Box::new(cw), "c-1", fast());

        let (sr, mut sw) = tokio::io::split(server_side);
        let server = tokio::spawn(async move {
            let mut lines = BufReader::new(sr).lines();
            let req = decode_request(&lines.next_line().await.unwrap().unwrap()).unwrap();
            for (code, msg) in [(ResultCode::ACCEPTED, "enqueued"), (ResultCode::OK, "done")] {
                let resp = ResponseEnvelope::reply(&req, code, msg);
                sw.write_all(&encode_line(&resp).unwrap()).await.unwrap();
            }
            req.message_id
        });

        let resp = client
            .sanitize(&SanitizeRequest {
                path: "/a.xlsm".into(),
                action: "remediate".into(),
                destination_module: "Module1".into(),
                detection_name: "VirusX".into(),
            })
            .await
            .unwrap();
        assert_eq!(resp.result_code, ResultCode::OK);
        assert_eq!(resp.message_id, server.await.unwrap());
    }

    #[tokio::test]
    async fn replies_for_another_client_are_ignored() {
        let (client_side, server_side) = duplex(4096);
        let (cr, cw) = tokio::io::split(client_side);
        let client = RpcClient::from_parts(Box::new(cr), Box::new(cw), "c-1", fast());

        let (sr, mut sw) = tokio::io::split(server_side);
        let server = tokio::spawn(async move {
            let mut lines = BufReader::new(sr).lines();
            let req = decode_request(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let mut stray = ResponseEnvelope::reply(&req, ResultCode::FAILED, "not yours");
            stray.client_id = "c-2".into();
            sw.write_all(&encode_line(&stray).unwrap()).await.unwrap();
            let resp = ResponseEnvelope::reply(&req, ResultCode::OK, "pong");
            sw.write_all(&encode_line(&resp).unwrap()).await.unwrap();
            sw
        });

        client.ping().await.unwrap();
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (client_side, _server_side) = duplex(4096);
        let (cr, cw) = tokio::io::split(client_side);
        let client = RpcClient::from_parts(Box::new(cr), Box::new(cw), "c-1", fast());
        assert!(matches!(
            client.ping().await,
            Err(ClientError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn server_hangup_fails_waiters() {
        let (client_side, server_side) = duplex(4096);
        let (cr, cw) = tokio::io::split(client_side);
        let client =
            RpcClient::from_parts(Box::new(cr), Box::new(cw), "c-1", ClientConfig::default());
        let hangup = tokio::spawn(async move {
            let (sr, _sw) = tokio::io::split(server_side);
            let mut lines = BufReader::new(sr).lines();
            let _ = lines.next_line().await;
        });
        let err = client.ping().await.unwrap_err();
        hangup.await.unwrap();
        assert!(matches!(err, ClientError::Closed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_gives_up_after_configured_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("nobody.sock");
        let cfg = ClientConfig {
            connect_attempts: 2,
            retry_delay: Duration::from_millis(10),
            ..ClientConfig::default()
        };
        let err = RpcClient::connect(&endpoint.to_string_lossy(), "c", cfg)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Connect { attempts: 2, .. }));
    }
}
