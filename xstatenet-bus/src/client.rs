//! Bus client. The write half is cloneable (`BusSender`) so the orchestrator
//! bridge can emit outbound events while the owning task drains inbound
//! ones. Request/reply is opt-in per event through a `correlationId`; plain
//! sends never wait for the server.

use crate::protocol::*;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

struct ClientInner {
    writer: tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ResponsePayload>>>,
}

impl ClientInner {
    async fn send(&self, message: &PipeMessage) -> Result<()> {
        let bytes = encode_frame(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Cloneable write-side handle.
#[derive(Clone)]
pub struct BusSender {
    inner: Arc<ClientInner>,
}

impl BusSender {
    pub async fn register(&self, machine_id: &str) -> Result<()> {
        self.inner
            .send(&PipeMessage::Register(RegisterPayload {
                machine_id: machine_id.to_string(),
                process_name: std::env::args()
                    .next()
                    .unwrap_or_else(|| "unknown".to_string()),
                process_id: std::process::id(),
                registered_at: chrono::Utc::now(),
            }))
            .await
    }

    pub async fn unregister(&self, machine_id: &str) -> Result<()> {
        self.inner
            .send(&PipeMessage::Unregister(UnregisterPayload {
                machine_id: machine_id.to_string(),
            }))
            .await
    }

    pub async fn subscribe(&self, machine_id: &str) -> Result<()> {
        self.inner
            .send(&PipeMessage::Subscribe(SubscribePayload {
                machine_id: machine_id.to_string(),
            }))
            .await
    }

    /// Fire-and-forget send; the server does not answer.
    pub async fn send_event(
        &self,
        source: &str,
        target: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<()> {
        self.inner
            .send(&PipeMessage::SendEvent(EventPayload::new(
                source, target, event_name, payload,
            )))
            .await
    }

    /// Send with a correlation id and await the server's `Response`.
    pub async fn request(
        &self,
        source: &str,
        target: &str,
        event_name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<ResponsePayload> {
        let correlation = Uuid::now_v7().to_string();
        let mut payload = match payload {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        payload.insert(
            "correlationId".to_string(),
            Value::String(correlation.clone()),
        );

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(correlation.clone(), tx);

        let sent = self
            .inner
            .send(&PipeMessage::SendEvent(EventPayload::new(
                source,
                target,
                event_name,
                Value::Object(payload),
            )))
            .await;
        if sent.is_err() {
            self.inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&correlation);
            sent?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(anyhow!("connection closed while awaiting response")),
            Err(_) => {
                self.inner
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&correlation);
                Err(anyhow!("no response within {timeout:?}"))
            }
        }
    }
}

pub struct MessageBusClient {
    sender: BusSender,
    events: mpsc::UnboundedReceiver<EventPayload>,
}

impl MessageBusClient {
    pub async fn connect(pipe_name: &str) -> Result<Self> {
        let path = socket_path(pipe_name);
        let stream = UnixStream::connect(&path)
            .await
            .with_context(|| format!("connecting {}", path.display()))?;
        let (read_half, write_half) = stream.into_split();

        let inner = Arc::new(ClientInner {
            writer: tokio::sync::Mutex::new(BufWriter::new(write_half)),
            pending: Mutex::new(HashMap::new()),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Weak: the reader must not keep the write half alive, or dropping
        // the client would never close the connection.
        let reader_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_frame(&line) {
                    Ok(PipeMessage::SendEvent(event)) => {
                        if events_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(PipeMessage::Response(response)) => {
                        let Some(inner) = reader_inner.upgrade() else { break };
                        resolve_response(&inner, response);
                    }
                    Ok(other) => {
                        tracing::debug!(?other, "ignoring unexpected frame");
                    }
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed frame");
                    }
                }
            }
            tracing::debug!("bus connection closed");
        });

        Ok(Self {
            sender: BusSender { inner },
            events: events_rx,
        })
    }

    /// Cloneable write half, usable independently of `next_event`.
    pub fn sender(&self) -> BusSender {
        self.sender.clone()
    }

    /// Next inbound event addressed to one of this connection's machines.
    /// `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<EventPayload> {
        self.events.recv().await
    }

    pub async fn register(&self, machine_id: &str) -> Result<()> {
        self.sender.register(machine_id).await
    }

    pub async fn unregister(&self, machine_id: &str) -> Result<()> {
        self.sender.unregister(machine_id).await
    }

    pub async fn subscribe(&self, machine_id: &str) -> Result<()> {
        self.sender.subscribe(machine_id).await
    }

    pub async fn send_event(
        &self,
        source: &str,
        target: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<()> {
        self.sender.send_event(source, target, event_name, payload).await
    }

    pub async fn request(
        &self,
        source: &str,
        target: &str,
        event_name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<ResponsePayload> {
        self.sender
            .request(source, target, event_name, payload, timeout)
            .await
    }
}

fn resolve_response(inner: &Arc<ClientInner>, response: ResponsePayload) {
    let correlation = response
        .data
        .as_ref()
        .and_then(|event| event.correlation_id())
        .map(str::to_string);
    match correlation {
        Some(correlation) => {
            let waiter = inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&correlation);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => tracing::debug!(%correlation, "response without a waiter"),
            }
        }
        None => {
            // Server-initiated rejections (malformed frames) land here.
            tracing::debug!(?response, "uncorrelated response");
        }
    }
}
