//! Line-delimited JSON client for networked machines.
//!
//! Requests carry a uuid `id` and are answered by a frame with the same id
//! holding either `result` or `error`. Frames without an id are device
//! notifications and are forwarded on the session's notification channel.

use async_trait::async_trait;
use dispatch_shared::device::{
    EepromMap, LinkError, NetworkClient, NetworkConnector, NetworkSession, Notification, ProcessId, ProcessRequest,
    SystemNotification,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, LinkError>>>>>;

#[derive(Debug, Deserialize)]
struct RemoteError {
    code: i64,
    #[serde(default)]
    message: String,
}

impl From<RemoteError> for LinkError {
    fn from(e: RemoteError) -> Self {
        match e.code {
            401 | 403 => LinkError::NotAuthorized(e.message),
            code => LinkError::Device { code, message: e.message },
        }
    }
}

#[derive(Debug)]
enum Frame {
    Response { id: String, outcome: Result<Value, LinkError> },
    Notification(Notification),
}

fn parse_frame(line: &str) -> Result<Frame, LinkError> {
    let mut value: Value =
        serde_json::from_str(line).map_err(|e| LinkError::Protocol(format!("bad frame: {}", e)))?;
    if let Some(id) = value.get("id").and_then(Value::as_str).map(str::to_string) {
        if let Some(error) = value.get_mut("error").map(Value::take) {
            let error: RemoteError =
                serde_json::from_value(error).map_err(|e| LinkError::Protocol(format!("bad error frame: {}", e)))?;
            return Ok(Frame::Response {
                id,
                outcome: Err(error.into()),
            });
        }
        let result = value.get_mut("result").map(Value::take).unwrap_or(Value::Null);
        return Ok(Frame::Response { id, outcome: Ok(result) });
    }
    serde_json::from_value(value)
        .map(Frame::Notification)
        .map_err(|e| LinkError::Protocol(format!("unknown notification: {}", e)))
}

pub struct TcpConnector {
    address: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            token: None,
            request_timeout,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

#[async_trait]
impl NetworkConnector for TcpConnector {
    fn address(&self) -> &str {
        &self.address
    }

    async fn open(&self) -> Result<NetworkSession, LinkError> {
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(LinkError::Timeout),
        };
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(self.address.clone(), read, pending.clone(), notify_tx));
        tracing::info!(address = %self.address, "network session opened");
        let client = TcpNetworkClient {
            address: self.address.clone(),
            token: self.token.clone(),
            request_timeout: self.request_timeout,
            writer: tokio::sync::Mutex::new(Some(write)),
            pending,
            reader: Mutex::new(Some(reader)),
        };
        Ok(NetworkSession {
            client: Arc::new(client),
            notifications,
        })
    }
}

async fn read_frames(
    address: String,
    read: OwnedReadHalf,
    pending: Pending,
    notifications: mpsc::UnboundedSender<Notification>,
) {
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%address, "read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_frame(&line) {
            Ok(Frame::Response { id, outcome }) => match pending.lock().remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(outcome);
                }
                None => tracing::debug!(%address, %id, "response for unknown request"),
            },
            Ok(Frame::Notification(notification)) => {
                if notifications.send(notification).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(%address, "{}", e),
        }
    }
    for (_, waiter) in pending.lock().drain() {
        let _ = waiter.send(Err(LinkError::Closed));
    }
    tracing::info!(%address, "network session closed");
}

pub struct TcpNetworkClient {
    address: String,
    token: Option<String>,
    request_timeout: Duration,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Pending,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpNetworkClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, LinkError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        let mut frame = json!({ "id": id, "method": method, "params": params }).to_string();
        frame.push('\n');
        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.write_all(frame.as_bytes()).await.map_err(LinkError::from),
                None => Err(LinkError::Closed),
            }
        };
        if let Err(e) = sent {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        tracing::debug!(address = %self.address, %method, %id, "request sent");
        match timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(LinkError::Timeout)
            }
        }
    }

    async fn call_as<T: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LinkError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| LinkError::Protocol(format!("bad {} result: {}", method, e)))
    }
}

#[async_trait]
impl NetworkClient for TcpNetworkClient {
    async fn authenticate(&self) -> Result<(), LinkError> {
        self.call("authenticate", json!({ "token": self.token })).await.map(|_| ())
    }

    async fn handshake(&self) -> Result<SystemNotification, LinkError> {
        self.call_as("handshake", json!({})).await
    }

    async fn reserve_process_id(&self) -> Result<ProcessId, LinkError> {
        let result = self.call("reserve_process_id", json!({})).await?;
        result
            .as_u64()
            .or_else(|| result.get("id").and_then(Value::as_u64))
            .ok_or_else(|| LinkError::Protocol(format!("bad process id: {}", result)))
    }

    async fn start_process(&self, id: ProcessId, request: &ProcessRequest) -> Result<(), LinkError> {
        self.call("start_process", json!({ "id": id, "request": request }))
            .await
            .map(|_| ())
    }

    async fn pause(&self, id: ProcessId) -> Result<(), LinkError> {
        self.call("pause", json!({ "id": id })).await.map(|_| ())
    }

    async fn resume(&self, id: ProcessId) -> Result<(), LinkError> {
        self.call("resume", json!({ "id": id })).await.map(|_| ())
    }

    async fn cancel(&self, id: ProcessId) -> Result<(), LinkError> {
        self.call("cancel", json!({ "id": id })).await.map(|_| ())
    }

    async fn read_eeprom(&self) -> Result<EepromMap, LinkError> {
        self.call_as("read_eeprom", json!({})).await
    }

    async fn write_eeprom(&self, values: &EepromMap) -> Result<(), LinkError> {
        self.call("write_eeprom", json!({ "values": values })).await.map(|_| ())
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        for (_, waiter) in self.pending.lock().drain() {
            let _ = waiter.send(Err(LinkError::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_shared::device::DeviceState;
    use tokio::net::TcpListener;

    #[test]
    fn frames_are_told_apart() {
        match parse_frame(r#"{"id":"a","result":7}"#).unwrap() {
            Frame::Response { id, outcome } => {
                assert_eq!(id, "a");
                assert_eq!(outcome.unwrap(), json!(7));
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse_frame(r#"{"id":"b","error":{"code":401,"message":"bad token"}}"#).unwrap() {
            Frame::Response { outcome, .. } => {
                assert_eq!(outcome.unwrap_err(), LinkError::NotAuthorized("bad token".into()))
            }
            other => panic!("unexpected {:?}", other),
        }
        let frame = parse_frame(r#"{"method":"state_notification","params":{"process_id":3,"step":"printing"}}"#);
        assert!(matches!(frame, Ok(Frame::Notification(Notification::StateNotification(_)))));
        assert!(parse_frame("not json").is_err());
    }

    #[tokio::test]
    async fn round_trip_against_a_local_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                let request: Value = serde_json::from_str(&line).unwrap();
                let id = request["id"].clone();
                let reply = match request["method"].as_str().unwrap() {
                    "authenticate" => json!({ "id": id, "result": null }),
                    "handshake" => json!({ "id": id, "result": { "machine_state": "idle" } }),
                    "reserve_process_id" => {
                        let push = json!({
                            "method": "state_notification",
                            "params": { "process_id": 9, "machine_state": "running" }
                        });
                        write.write_all(format!("{}\n", push).as_bytes()).await.unwrap();
                        json!({ "id": id, "result": { "id": 9 } })
                    }
                    _ => json!({ "id": id, "error": { "code": 500, "message": "nope" } }),
                };
                write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            }
        });

        let connector = TcpConnector::new(address, Duration::from_secs(2));
        let NetworkSession {
            client,
            mut notifications,
        } = connector.open().await.unwrap();
        client.authenticate().await.unwrap();
        assert_eq!(client.handshake().await.unwrap().machine_state, DeviceState::Idle);
        assert_eq!(client.reserve_process_id().await.unwrap(), 9);
        match notifications.recv().await.unwrap() {
            Notification::StateNotification(delta) => assert_eq!(delta.process_id, Some(9)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            client.pause(9).await.unwrap_err(),
            LinkError::Device {
                code: 500,
                message: "nope".into()
            }
        );
        client.close().await;
        assert_eq!(client.cancel(9).await.unwrap_err(), LinkError::Closed);
    }
}
