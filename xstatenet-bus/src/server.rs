//! Message bus server: owns the pipe endpoint, keeps the
//! `machineId → connection` routing table, fans frames out to subscribers,
//! and evicts registrations when a connection drops. Every write is flushed
//! before the next frame; a dead client never takes the server down.

use crate::protocol::*;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};

type ConnId = u64;
type Writer = Arc<tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>>;

#[derive(Default)]
struct RoutingState {
    /// machineId → owning connection.
    registrations: HashMap<String, ConnId>,
    /// machineId → connections that asked for its events.
    subscriptions: HashMap<String, Vec<ConnId>>,
    writers: HashMap<ConnId, Writer>,
}

pub struct MessageBusServer {
    path: PathBuf,
    listener: UnixListener,
    state: Arc<Mutex<RoutingState>>,
    next_conn: AtomicU64,
}

impl MessageBusServer {
    /// Bind the endpoint, replacing a stale socket file from a previous run.
    pub async fn bind(pipe_name: &str) -> Result<Self> {
        let path = socket_path(pipe_name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("binding {}", path.display()))?;
        tracing::info!(path = %path.display(), "message bus bound");
        Ok(Self {
            path,
            listener,
            state: Arc::new(Mutex::new(RoutingState::default())),
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the process ends. Each connection gets its
    /// own reader task; a failed connection only evicts itself.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(error) = handle_connection(state.clone(), conn_id, stream).await {
                    tracing::debug!(conn = conn_id, %error, "connection ended with error");
                }
                evict(&state, conn_id);
            });
        }
    }
}

async fn handle_connection(
    state: Arc<Mutex<RoutingState>>,
    conn_id: ConnId,
    stream: UnixStream,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(BufWriter::new(write_half)));
    state
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .writers
        .insert(conn_id, writer.clone());
    tracing::debug!(conn = conn_id, "connection accepted");

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match decode_frame(&line) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(conn = conn_id, %error, "rejecting frame");
                let reject = PipeMessage::Response(ResponsePayload {
                    success: false,
                    data: None,
                    error: Some(error.to_string()),
                });
                let _ = send_frame(&writer, &reject).await;
                continue;
            }
        };
        handle_message(&state, conn_id, &writer, message).await;
    }
    // EOF: the client went away.
    Ok(())
}

async fn handle_message(
    state: &Arc<Mutex<RoutingState>>,
    conn_id: ConnId,
    writer: &Writer,
    message: PipeMessage,
) {
    match message {
        PipeMessage::Register(register) => {
            tracing::info!(
                conn = conn_id,
                machine = %register.machine_id,
                process = %register.process_name,
                pid = register.process_id,
                "machine registered on bus"
            );
            state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .registrations
                .insert(register.machine_id, conn_id);
        }
        PipeMessage::Unregister(unregister) => {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if state.registrations.get(&unregister.machine_id) == Some(&conn_id) {
                state.registrations.remove(&unregister.machine_id);
                tracing::info!(conn = conn_id, machine = %unregister.machine_id, "machine unregistered from bus");
            }
        }
        PipeMessage::Subscribe(subscribe) => {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            let subscribers = state.subscriptions.entry(subscribe.machine_id).or_default();
            if !subscribers.contains(&conn_id) {
                subscribers.push(conn_id);
            }
        }
        PipeMessage::SendEvent(event) => {
            route_event(state, conn_id, writer, event).await;
        }
        PipeMessage::Response(_) => {
            // Responses only flow server → client.
            tracing::debug!(conn = conn_id, "ignoring client-sent Response frame");
        }
    }
}

/// Deliver to the target's owning connection and every subscriber, then
/// answer the originator when the event carries a correlation id.
async fn route_event(
    state: &Arc<Mutex<RoutingState>>,
    conn_id: ConnId,
    origin: &Writer,
    event: EventPayload,
) {
    let targets: Vec<Writer> = {
        let state = state.lock().unwrap_or_else(|e| e.into_inner());
        let mut conn_ids: Vec<ConnId> = Vec::new();
        if let Some(&owner) = state.registrations.get(&event.target_machine_id) {
            conn_ids.push(owner);
        }
        if let Some(subscribers) = state.subscriptions.get(&event.target_machine_id) {
            for &subscriber in subscribers {
                if !conn_ids.contains(&subscriber) {
                    conn_ids.push(subscriber);
                }
            }
        }
        conn_ids
            .into_iter()
            .filter_map(|id| state.writers.get(&id).cloned())
            .collect()
    };

    let delivered = !targets.is_empty();
    let frame = PipeMessage::SendEvent(event.clone());
    for writer in targets {
        if let Err(error) = send_frame(&writer, &frame).await {
            tracing::warn!(target = %event.target_machine_id, %error, "delivery failed");
        }
    }
    if !delivered {
        tracing::debug!(
            target = %event.target_machine_id,
            event = %event.event_name,
            "no route for event"
        );
    }

    if event.correlation_id().is_some() {
        let response = PipeMessage::Response(if delivered {
            ResponsePayload {
                success: true,
                data: Some(event),
                error: None,
            }
        } else {
            ResponsePayload {
                success: false,
                data: Some(event),
                error: Some("target machine is not registered".to_string()),
            }
        });
        if let Err(error) = send_frame(origin, &response).await {
            tracing::warn!(conn = conn_id, %error, "response delivery failed");
        }
    }
}

/// Write one frame and flush it; a buffered unflushed response is the same
/// as no response to a client that is waiting.
async fn send_frame(writer: &Writer, message: &PipeMessage) -> Result<()> {
    let bytes = encode_frame(message)?;
    let mut writer = writer.lock().await;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn evict(state: &Arc<Mutex<RoutingState>>, conn_id: ConnId) {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    state.writers.remove(&conn_id);
    let before = state.registrations.len();
    state.registrations.retain(|_, owner| *owner != conn_id);
    let evicted = before - state.registrations.len();
    for subscribers in state.subscriptions.values_mut() {
        subscribers.retain(|&id| id != conn_id);
    }
    state.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
    if evicted > 0 {
        tracing::info!(conn = conn_id, evicted, "evicted registrations for dropped connection");
    }
}
