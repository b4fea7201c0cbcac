//! Central event bus: a pool of bounded single-consumer channels dispatching
//! events to registered machines. A machine is pinned to one channel by the
//! hash of its id, so its events are handled strictly in arrival order by a
//! single consumer task; unrelated machines on different channels run in
//! parallel. All inter-machine traffic flows through deferred sends, drained
//! here after the producing event commits and before its completion is
//! observable anywhere else.

use crate::config::{BackpressureMode, OrchestratorConfig};
use crate::context::OrchestratedContext;
use crate::error::{Error, Result};
use crate::events::{EventResult, OrchestratorEvent};
use crate::machine::{EventSink, Machine, MachineHandle};
use crate::resilience::dlq::DeadLetterQueue;
use crate::types::{DeferredSend, Event, SendTarget, START_EVENT};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// How long a deferred send may wait on a congested channel before it is
/// dead-lettered instead of stalling the producing consumer forever.
const DEFERRED_SEND_BUDGET: Duration = Duration::from_secs(5);

/// Outbound seam for machines living in other processes. The message bus
/// plugs in here; deferred sends whose target is not locally registered are
/// offered to the router.
#[async_trait]
pub trait RemoteRouter: Send + Sync {
    /// `Ok(true)` when the target is known remotely and the event was
    /// handed off.
    async fn route(&self, send: &DeferredSend) -> Result<bool>;
}

/// Per-machine dispatch counters, kept when `enable_metrics` is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct MachineMetrics {
    pub events_processed: u64,
    pub events_failed: u64,
    pub total_duration_ms: u64,
}

enum Request {
    Start {
        machine_id: String,
        reply: Option<oneshot::Sender<EventResult>>,
    },
    Event {
        source: String,
        machine_id: String,
        event: Event,
        reply: Option<oneshot::Sender<EventResult>>,
    },
    Stop {
        machine_id: String,
        done: Option<oneshot::Sender<()>>,
    },
}

impl Request {
    fn machine_id(&self) -> &str {
        match self {
            Request::Start { machine_id, .. }
            | Request::Event { machine_id, .. }
            | Request::Stop { machine_id, .. } => machine_id,
        }
    }
}

struct MachineSlot {
    machine: tokio::sync::Mutex<Box<dyn MachineHandle>>,
    channel: usize,
    group: Option<u64>,
}

struct ChannelHandle {
    tx: mpsc::Sender<Request>,
    depth: Arc<AtomicUsize>,
    assigned: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

struct Inner {
    config: OrchestratorConfig,
    machines: DashMap<String, Arc<MachineSlot>>,
    channels: RwLock<Vec<ChannelHandle>>,
    events: broadcast::Sender<OrchestratorEvent>,
    dlq: Arc<DeadLetterQueue>,
    remote: RwLock<Option<Arc<dyn RemoteRouter>>>,
    metrics: Option<DashMap<String, MachineMetrics>>,
    state: AtomicU8,
    shutdown: CancellationToken,
}

pub struct EventBusOrchestrator {
    inner: Arc<Inner>,
}

impl EventBusOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        let metrics = config.enable_metrics.then(DashMap::new);
        let dlq = Arc::new(DeadLetterQueue::new(config.dlq_capacity));
        let inner = Arc::new(Inner {
            config,
            machines: DashMap::new(),
            channels: RwLock::new(Vec::new()),
            events,
            dlq,
            remote: RwLock::new(None),
            metrics,
            state: AtomicU8::new(RUNNING),
            shutdown: CancellationToken::new(),
        });

        {
            let mut channels = inner.channels.write();
            for index in 0..inner.config.pool_size.max(1) {
                channels.push(spawn_channel(Arc::downgrade(&inner), index));
            }
        }
        tokio::spawn(monitor_pool(Arc::downgrade(&inner)));

        Self { inner }
    }

    // ── Registration ──

    pub fn register(&self, machine_id: &str, machine: Machine) -> Result<()> {
        self.register_handle(machine_id, Box::new(machine), None)
    }

    pub fn register_grouped(&self, machine_id: &str, machine: Machine, group: u64) -> Result<()> {
        self.register_handle(machine_id, Box::new(machine), Some(group))
    }

    /// Register any handle, including resilience decorators.
    pub fn register_handle(
        &self,
        machine_id: &str,
        mut machine: Box<dyn MachineHandle>,
        group: Option<u64>,
    ) -> Result<()> {
        let inner = &self.inner;
        if inner.state.load(Ordering::Acquire) != RUNNING {
            return Err(Error::ShuttingDown);
        }
        if inner.machines.contains_key(machine_id) {
            return Err(Error::Internal(format!(
                "machine '{machine_id}' is already registered"
            )));
        }

        machine.set_machine_id(machine_id.to_string());
        machine.bind_sink(self.self_sink(machine_id));

        let channels = inner.channels.read();
        let channel = channel_index(machine_id, channels.len());
        channels[channel].assigned.fetch_add(1, Ordering::AcqRel);
        drop(channels);

        inner.machines.insert(
            machine_id.to_string(),
            Arc::new(MachineSlot {
                machine: tokio::sync::Mutex::new(machine),
                channel,
                group,
            }),
        );
        let _ = inner.events.send(OrchestratorEvent::MachineRegistered {
            machine_id: machine_id.to_string(),
        });
        tracing::info!(machine = %machine_id, channel, "machine registered");
        Ok(())
    }

    /// Sink used by the machine's own timers and invocations: re-enqueue on
    /// the machine's channel as a self-addressed event.
    fn self_sink(&self, machine_id: &str) -> EventSink {
        let weak = Arc::downgrade(&self.inner);
        let machine_id = machine_id.to_string();
        EventSink::new(move |event| {
            let Some(inner) = weak.upgrade() else { return };
            let name = event.name.clone();
            let payload = event.payload.clone();
            let request = Request::Event {
                source: machine_id.clone(),
                machine_id: machine_id.clone(),
                event,
                reply: None,
            };
            if let Err(error) = try_enqueue(&inner, request) {
                inner
                    .dlq
                    .push(&machine_id, &name, payload, error.kind(), error.to_string());
            }
        })
    }

    pub async fn unregister(&self, machine_id: &str) -> Result<()> {
        let Some((_, slot)) = self.inner.machines.remove(machine_id) else {
            return Err(Error::MachineNotFound {
                machine_id: machine_id.to_string(),
            });
        };
        if let Some(handle) = self.inner.channels.read().get(slot.channel) {
            handle.assigned.fetch_sub(1, Ordering::AcqRel);
        }

        let mut machine = slot.machine.lock().await;
        let octx = OrchestratedContext::new(machine_id, machine.configuration());
        if let Err(error) = machine.stop(&octx).await {
            tracing::warn!(machine = %machine_id, %error, "stop during unregister failed");
        }
        drop(machine);
        route_deferred(&self.inner, octx.take_deferred()).await;

        let _ = self
            .inner
            .events
            .send(OrchestratorEvent::MachineUnregistered {
                machine_id: machine_id.to_string(),
            });
        tracing::info!(machine = %machine_id, "machine unregistered");
        Ok(())
    }

    /// Unregister every machine registered under the group, stopping each.
    /// Group membership is also recognizable from the `#{group}#` infix in
    /// the machine id, so foreign registrations formatted that way are swept
    /// up too.
    pub async fn unregister_group(&self, group: u64) -> usize {
        let infix = format!("#{group}#");
        let ids: Vec<String> = self
            .inner
            .machines
            .iter()
            .filter(|entry| entry.value().group == Some(group) || entry.key().contains(&infix))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for id in ids {
            if self.unregister(&id).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Synchronous sweep used when a group token is dropped without release:
    /// removes registrations without running stop hooks.
    pub fn force_unregister_group(&self, group: u64) -> usize {
        let infix = format!("#{group}#");
        let ids: Vec<String> = self
            .inner
            .machines
            .iter()
            .filter(|entry| entry.value().group == Some(group) || entry.key().contains(&infix))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            if let Some((_, slot)) = self.inner.machines.remove(id) {
                if let Some(handle) = self.inner.channels.read().get(slot.channel) {
                    handle.assigned.fetch_sub(1, Ordering::AcqRel);
                }
                let _ = self
                    .inner
                    .events
                    .send(OrchestratorEvent::MachineUnregistered {
                        machine_id: id.clone(),
                    });
            }
        }
        ids.len()
    }

    // ── Dispatch ──

    /// Enqueue the synthetic start event and await the initial configuration.
    pub async fn start_machine(&self, machine_id: &str) -> Result<EventResult> {
        let (tx, rx) = oneshot::channel();
        let request = Request::Start {
            machine_id: machine_id.to_string(),
            reply: Some(tx),
        };
        match self.enqueue(request).await {
            Ok(()) => rx.await.map_err(|_| Error::ShuttingDown),
            Err(Error::MachineNotFound { machine_id }) => Ok(EventResult::failed(
                machine_id,
                START_EVENT,
                "MachineNotFound",
                "machine is not registered",
            )),
            Err(e) => Err(e),
        }
    }

    /// Enqueue and await the outcome. Unknown targets resolve (not fail)
    /// with `MachineNotFound` so the caller can decide.
    pub async fn send(
        &self,
        source: &str,
        target: &str,
        event: &str,
        payload: Value,
    ) -> Result<EventResult> {
        let (tx, rx) = oneshot::channel();
        let request = Request::Event {
            source: source.to_string(),
            machine_id: target.to_string(),
            event: Event::new(event, payload),
            reply: Some(tx),
        };
        match self.enqueue(request).await {
            Ok(()) => rx.await.map_err(|_| Error::ShuttingDown),
            Err(Error::MachineNotFound { machine_id }) => Ok(EventResult::failed(
                machine_id,
                event,
                "MachineNotFound",
                "machine is not registered",
            )),
            Err(e) => Err(e),
        }
    }

    /// Enqueue without awaiting the outcome.
    pub async fn send_fire_and_forget(
        &self,
        source: &str,
        target: &str,
        event: &str,
        payload: Value,
    ) -> Result<()> {
        self.enqueue(Request::Event {
            source: source.to_string(),
            machine_id: target.to_string(),
            event: Event::new(event, payload),
            reply: None,
        })
        .await
    }

    /// Fan an event out to every registered machine except the source.
    /// Returns how many machines it was enqueued to.
    pub async fn broadcast(&self, source: &str, event: &str, payload: Value) -> Result<usize> {
        let targets: Vec<String> = self
            .inner
            .machines
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| id != source)
            .collect();
        let mut delivered = 0;
        for target in targets {
            match self
                .send_fire_and_forget(source, &target, event, payload.clone())
                .await
            {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::warn!(%target, %error, "broadcast enqueue failed");
                }
            }
        }
        Ok(delivered)
    }

    async fn enqueue(&self, request: Request) -> Result<()> {
        let inner = &self.inner;
        if inner.state.load(Ordering::Acquire) != RUNNING {
            return Err(Error::ShuttingDown);
        }
        let machine_id = request.machine_id();
        let Some(slot) = inner.machines.get(machine_id).map(|e| e.value().clone()) else {
            return Err(Error::MachineNotFound {
                machine_id: machine_id.to_string(),
            });
        };
        let (tx, depth, capacity) = {
            let channels = inner.channels.read();
            let Some(handle) = channels.get(slot.channel) else {
                return Err(Error::ChannelClosed);
            };
            (handle.tx.clone(), handle.depth.clone(), inner.config.channel_capacity)
        };
        depth.fetch_add(1, Ordering::AcqRel);
        let sent = match inner.config.backpressure {
            BackpressureMode::Wait => tx.send(request).await.map_err(|_| Error::ChannelClosed),
            BackpressureMode::FailFast => tx.try_send(request).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::ChannelFull { capacity },
                mpsc::error::TrySendError::Closed(_) => Error::ChannelClosed,
            }),
        };
        if sent.is_err() {
            depth.fetch_sub(1, Ordering::AcqRel);
        }
        sent
    }

    // ── Observation ──

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    pub fn dlq(&self) -> Arc<DeadLetterQueue> {
        self.inner.dlq.clone()
    }

    pub fn set_remote_router(&self, router: Arc<dyn RemoteRouter>) {
        *self.inner.remote.write() = Some(router);
    }

    pub fn machine_count(&self) -> usize {
        self.inner.machines.len()
    }

    pub fn contains(&self, machine_id: &str) -> bool {
        self.inner.machines.contains_key(machine_id)
    }

    pub fn machine_ids(&self) -> Vec<String> {
        self.inner
            .machines
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.read().len()
    }

    pub async fn configuration_of(&self, machine_id: &str) -> Option<Vec<String>> {
        let slot = self.inner.machines.get(machine_id).map(|e| e.value().clone())?;
        let machine = slot.machine.lock().await;
        Some(machine.configuration())
    }

    pub fn metrics_of(&self, machine_id: &str) -> Option<MachineMetrics> {
        self.inner
            .metrics
            .as_ref()?
            .get(machine_id)
            .map(|m| *m.value())
    }

    // ── Shutdown ──

    /// Drain up to `deadline`, stop every machine, close the pool. Events
    /// still queued after the deadline are dead-lettered by their consumers.
    pub async fn stop(&self, deadline: Duration) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::info!("orchestrator stopping");

        let drain_started = Instant::now();
        while drain_started.elapsed() < deadline {
            let pending: usize = inner
                .channels
                .read()
                .iter()
                .map(|c| c.depth.load(Ordering::Acquire))
                .sum();
            if pending == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let ids: Vec<String> = inner.machines.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, slot)) = inner.machines.remove(&id) {
                let mut machine = slot.machine.lock().await;
                let octx = OrchestratedContext::new(&id, machine.configuration());
                if let Err(error) = machine.stop(&octx).await {
                    tracing::warn!(machine = %id, %error, "stop failed during shutdown");
                }
                let _ = inner
                    .events
                    .send(OrchestratorEvent::MachineUnregistered { machine_id: id.clone() });
            }
        }

        inner.state.store(STOPPED, Ordering::Release);
        inner.shutdown.cancel();

        let channels: Vec<ChannelHandle> = std::mem::take(&mut *inner.channels.write());
        for handle in channels {
            drop(handle.tx);
            let _ = handle.worker.await;
        }
        tracing::info!("orchestrator stopped");
    }
}

// ── Channel machinery ──

fn channel_index(machine_id: &str, pool: usize) -> usize {
    let digest = Sha256::digest(machine_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(bytes) % pool.max(1) as u64) as usize
}

fn spawn_channel(inner: Weak<Inner>, index: usize) -> ChannelHandle {
    let capacity = inner
        .upgrade()
        .map(|i| i.config.channel_capacity)
        .unwrap_or(1)
        .max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    let assigned = Arc::new(AtomicUsize::new(0));
    let worker = tokio::spawn(consumer_loop(inner, index, rx, depth.clone()));
    ChannelHandle {
        tx,
        depth,
        assigned,
        worker,
    }
}

/// Single consumer per channel: at most one machine event is in flight per
/// channel, and deferred sends are flushed before the next dequeue.
async fn consumer_loop(
    inner: Weak<Inner>,
    index: usize,
    mut rx: mpsc::Receiver<Request>,
    depth: Arc<AtomicUsize>,
) {
    while let Some(request) = rx.recv().await {
        depth.fetch_sub(1, Ordering::AcqRel);
        let Some(inner) = inner.upgrade() else { break };
        process_request(&inner, request).await;
    }
    tracing::debug!(channel = index, "consumer exited");
}

async fn process_request(inner: &Arc<Inner>, request: Request) {
    match request {
        Request::Stop { machine_id, done } => {
            if let Some(slot) = inner.machines.get(&machine_id).map(|e| e.value().clone()) {
                let mut machine = slot.machine.lock().await;
                let octx = OrchestratedContext::new(&machine_id, machine.configuration());
                if let Err(error) = machine.stop(&octx).await {
                    tracing::warn!(machine = %machine_id, %error, "stop failed");
                }
                drop(machine);
                route_deferred(inner, octx.take_deferred()).await;
            }
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
        Request::Start { machine_id, reply } => {
            dispatch(inner, &machine_id, None, Event::named(START_EVENT), reply).await;
        }
        Request::Event {
            source,
            machine_id,
            event,
            reply,
        } => {
            dispatch(inner, &machine_id, Some(source), event, reply).await;
        }
    }
}

/// Look up the target, run the handler, publish observability events,
/// resolve the reply, and flush deferred sends.
async fn dispatch(
    inner: &Arc<Inner>,
    machine_id: &str,
    source: Option<String>,
    event: Event,
    reply: Option<oneshot::Sender<EventResult>>,
) {
    let Some(slot) = inner.machines.get(machine_id).map(|e| e.value().clone()) else {
        let shutting_down = inner.state.load(Ordering::Acquire) != RUNNING;
        if shutting_down {
            inner.dlq.push(
                machine_id,
                &event.name,
                event.payload.clone(),
                "ShuttingDown",
                "orchestrator stopped before the event was handled",
            );
        }
        let (kind, message) = if shutting_down {
            ("ShuttingDown", "orchestrator is shutting down")
        } else {
            ("MachineNotFound", "machine is not registered")
        };
        let _ = inner.events.send(OrchestratorEvent::MachineEventFailed {
            machine_id: machine_id.to_string(),
            event_name: event.name.clone(),
            error_kind: kind.to_string(),
            error: message.to_string(),
        });
        if let Some(reply) = reply {
            let _ = reply.send(EventResult::failed(machine_id, &event.name, kind, message));
        }
        return;
    };

    let mut machine = slot.machine.lock().await;
    let octx = OrchestratedContext::new(machine_id, machine.configuration());
    let started = Instant::now();

    let is_start = source.is_none() && event.name == START_EVENT;
    let outcome = if is_start {
        AssertUnwindSafe(machine.start(&octx)).catch_unwind().await
    } else {
        AssertUnwindSafe(machine.handle_event(&event, &octx))
            .catch_unwind()
            .await
    };
    drop(machine);
    let duration_ms = started.elapsed().as_millis() as u64;

    let result = match outcome {
        Ok(Ok(step)) => {
            if step.unhandled_error {
                inner.dlq.push(
                    machine_id,
                    &event.name,
                    event.payload.clone(),
                    "BubbledError",
                    "error event reached the root without a handler",
                );
                let _ = inner.events.send(OrchestratorEvent::DeadLettered {
                    machine_id: machine_id.to_string(),
                    event_name: event.name.clone(),
                    reason: "BubbledError".to_string(),
                });
            }
            let _ = inner.events.send(OrchestratorEvent::MachineEventProcessed {
                machine_id: machine_id.to_string(),
                event_name: event.name.clone(),
                old_configuration: step.old_configuration.clone(),
                new_configuration: step.new_configuration.clone(),
                duration_ms,
            });
            record_metrics(inner, machine_id, duration_ms, true);
            // Causal flush: every send produced by this event is enqueued
            // before the event resolves.
            route_deferred(inner, octx.take_deferred()).await;
            EventResult::ok(machine_id, &event.name, step.new_configuration)
        }
        Ok(Err(error)) => {
            let _ = inner.events.send(OrchestratorEvent::MachineEventFailed {
                machine_id: machine_id.to_string(),
                event_name: event.name.clone(),
                error_kind: error.kind().to_string(),
                error: error.to_string(),
            });
            record_metrics(inner, machine_id, duration_ms, false);
            EventResult::failed(machine_id, &event.name, error.kind(), error.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic);
            tracing::error!(machine = %machine_id, event = %event.name, %message, "handler panicked");
            let _ = inner.events.send(OrchestratorEvent::MachineEventFailed {
                machine_id: machine_id.to_string(),
                event_name: event.name.clone(),
                error_kind: "Panic".to_string(),
                error: message.clone(),
            });
            record_metrics(inner, machine_id, duration_ms, false);
            EventResult::failed(machine_id, &event.name, "Panic", message)
        }
    };

    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

fn record_metrics(inner: &Arc<Inner>, machine_id: &str, duration_ms: u64, ok: bool) {
    let Some(metrics) = inner.metrics.as_ref() else { return };
    let mut entry = metrics.entry(machine_id.to_string()).or_default();
    if ok {
        entry.events_processed += 1;
    } else {
        entry.events_failed += 1;
    }
    entry.total_duration_ms += duration_ms;
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Flush deferred sends in source order: local targets re-enqueue, unknown
/// targets go to the remote router when one is attached, the rest are
/// dead-lettered.
async fn route_deferred(inner: &Arc<Inner>, sends: Vec<DeferredSend>) {
    for send in sends {
        match &send.target {
            SendTarget::Broadcast => {
                let targets: Vec<String> = inner
                    .machines
                    .iter()
                    .map(|entry| entry.key().clone())
                    .filter(|id| *id != send.source)
                    .collect();
                for target in targets {
                    enqueue_deferred(inner, &send, target.clone()).await;
                }
            }
            SendTarget::Current => {
                let target = send.source.clone();
                enqueue_deferred(inner, &send, target).await;
            }
            SendTarget::Machine(target) => {
                if inner.machines.contains_key(target) {
                    enqueue_deferred(inner, &send, target.clone()).await;
                    continue;
                }
                let router = inner.remote.read().clone();
                if let Some(router) = router {
                    match router.route(&send).await {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(error) => {
                            tracing::warn!(target = %target, %error, "remote routing failed");
                        }
                    }
                }
                dead_letter_send(inner, &send, target.clone(), "MachineNotFound");
            }
        }
    }
}

async fn enqueue_deferred(inner: &Arc<Inner>, send: &DeferredSend, target: String) {
    let Some(slot) = inner.machines.get(&target).map(|e| e.value().clone()) else {
        dead_letter_send(inner, send, target, "MachineNotFound");
        return;
    };
    let (sender, depth) = {
        let channels = inner.channels.read();
        match channels.get(slot.channel) {
            Some(handle) => {
                handle.depth.fetch_add(1, Ordering::AcqRel);
                (handle.tx.clone(), handle.depth.clone())
            }
            None => {
                dead_letter_send(inner, send, target, "ChannelClosed");
                return;
            }
        }
    };
    let request = Request::Event {
        source: send.source.clone(),
        machine_id: target.clone(),
        event: send.event.clone(),
        reply: None,
    };
    // A full cross-channel queue must not wedge this consumer forever.
    match tokio::time::timeout(DEFERRED_SEND_BUDGET, sender.send(request)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            depth.fetch_sub(1, Ordering::AcqRel);
            dead_letter_send(inner, send, target, "ChannelClosed");
        }
        Err(_) => {
            depth.fetch_sub(1, Ordering::AcqRel);
            dead_letter_send(inner, send, target, "ChannelFull");
        }
    }
}

fn dead_letter_send(inner: &Arc<Inner>, send: &DeferredSend, target: String, reason: &str) {
    inner.dlq.push(
        target.clone(),
        &send.event.name,
        send.event.payload.clone(),
        reason,
        format!("deferred send from '{}' undeliverable", send.source),
    );
    let _ = inner.events.send(OrchestratorEvent::DeadLettered {
        machine_id: target,
        event_name: send.event.name.clone(),
        reason: reason.to_string(),
    });
}

fn try_enqueue(inner: &Arc<Inner>, request: Request) -> Result<()> {
    let machine_id = request.machine_id();
    let Some(slot) = inner.machines.get(machine_id).map(|e| e.value().clone()) else {
        return Err(Error::MachineNotFound {
            machine_id: machine_id.to_string(),
        });
    };
    let channels = inner.channels.read();
    let Some(handle) = channels.get(slot.channel) else {
        return Err(Error::ChannelClosed);
    };
    handle.depth.fetch_add(1, Ordering::AcqRel);
    handle.tx.try_send(request).map_err(|e| {
        handle.depth.fetch_sub(1, Ordering::AcqRel);
        match e {
            mpsc::error::TrySendError::Full(_) => Error::ChannelFull {
                capacity: inner.config.channel_capacity,
            },
            mpsc::error::TrySendError::Closed(_) => Error::ChannelClosed,
        }
    })
}

/// Grow the pool under sustained pressure, shed idle tail channels when the
/// load falls away. Machines keep the channel they were assigned at
/// registration, so only channels with no assignments are removable.
async fn monitor_pool(inner: Weak<Inner>) {
    loop {
        let Some(inner) = inner.upgrade() else { return };
        if inner.state.load(Ordering::Acquire) != RUNNING {
            return;
        }
        let interval = inner.config.monitor_interval;
        let shutdown = inner.shutdown.clone();

        let (pending, len) = {
            let channels = inner.channels.read();
            let pending: usize = channels.iter().map(|c| c.depth.load(Ordering::Acquire)).sum();
            (pending, channels.len())
        };
        let capacity_total = len * inner.config.channel_capacity;
        let utilization = if capacity_total == 0 {
            0.0
        } else {
            pending as f64 / capacity_total as f64
        };

        if utilization > inner.config.grow_threshold && len < inner.config.max_pool_size {
            let target = ((len as f64 * inner.config.growth_factor).ceil() as usize)
                .min(inner.config.max_pool_size);
            let mut channels = inner.channels.write();
            let from = channels.len();
            for index in from..target {
                channels.push(spawn_channel(Arc::downgrade(&inner), index));
            }
            let now = channels.len();
            drop(channels);
            if now != from {
                tracing::info!(channels = now, "channel pool grew");
                let _ = inner
                    .events
                    .send(OrchestratorEvent::PoolResized { channels: now });
            }
        } else if utilization < inner.config.shrink_threshold && len > inner.config.pool_size {
            let mut channels = inner.channels.write();
            let before = channels.len();
            while channels.len() > inner.config.pool_size {
                let last = channels.last().unwrap_or_else(|| unreachable!());
                if last.assigned.load(Ordering::Acquire) != 0
                    || last.depth.load(Ordering::Acquire) != 0
                {
                    break;
                }
                if let Some(handle) = channels.pop() {
                    drop(handle.tx);
                    handle.worker.abort();
                }
            }
            let now = channels.len();
            drop(channels);
            if now != before {
                tracing::info!(channels = now, "channel pool shrank");
                let _ = inner
                    .events
                    .send(OrchestratorEvent::PoolResized { channels: now });
            }
        }

        drop(inner);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::MachineChart;
    use crate::registry::Registry;
    use parking_lot::Mutex;
    use serde_json::json;

    const TOGGLE: &str =
        "{ id: 'toggle', initial: 'off', states: { off: { on: { TOGGLE: 'on' } }, on: { on: { TOGGLE: 'off' } } } }";

    fn toggle_machine(id: &str) -> Machine {
        Machine::new(
            id,
            Arc::new(MachineChart::parse(TOGGLE).unwrap()),
            Arc::new(Registry::new()),
        )
    }

    fn small_config() -> OrchestratorConfig {
        OrchestratorConfig {
            pool_size: 4,
            channel_capacity: 64,
            ..Default::default()
        }
    }

    async fn wait_for_config(
        orchestrator: &EventBusOrchestrator,
        machine_id: &str,
        expected: &[&str],
    ) {
        for _ in 0..200 {
            if let Some(config) = orchestrator.configuration_of(machine_id).await {
                if config == expected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "machine {machine_id} never reached {expected:?}, at {:?}",
            orchestrator.configuration_of(machine_id).await
        );
    }

    #[tokio::test]
    async fn register_start_send_roundtrip() {
        let orchestrator = EventBusOrchestrator::new(small_config());
        orchestrator.register("t1", toggle_machine("t1")).unwrap();

        let started = orchestrator.start_machine("t1").await.unwrap();
        assert!(started.success);
        assert_eq!(started.new_configuration, vec!["off"]);

        let result = orchestrator.send("test", "t1", "TOGGLE", Value::Null).await.unwrap();
        assert!(result.success);
        assert_eq!(result.new_configuration, vec!["on"]);
    }

    #[tokio::test]
    async fn unknown_target_resolves_with_machine_not_found() {
        let orchestrator = EventBusOrchestrator::new(small_config());
        let result = orchestrator.send("test", "ghost", "E", Value::Null).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("MachineNotFound"));
    }

    #[tokio::test]
    async fn per_machine_order_is_arrival_order() {
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        {
            let seen = seen.clone();
            registry.add_sync_action("note", move |_, event, _| {
                seen.lock().push(event.payload["n"].as_i64().unwrap_or(-1));
                Ok(())
            });
        }
        let chart = MachineChart::parse(
            "{ id: 'sink', initial: 'idle', states: { idle: { on: { NOTE: { actions: 'note' } } } } }",
        )
        .unwrap();
        let machine = Machine::new("sink", Arc::new(chart), Arc::new(registry));

        let orchestrator = EventBusOrchestrator::new(small_config());
        orchestrator.register("sink", machine).unwrap();
        orchestrator.start_machine("sink").await.unwrap();

        for n in 0..100 {
            orchestrator
                .send_fire_and_forget("test", "sink", "NOTE", json!({ "n": n }))
                .await
                .unwrap();
        }
        // A replied send behind the fire-and-forget batch proves the batch drained.
        orchestrator
            .send("test", "sink", "NOTE", json!({ "n": 100 }))
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 101);
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
    }

    #[tokio::test]
    async fn deferred_sends_arrive_in_source_order() {
        // A's entry emits E1 then E2 at B; B only reaches b2 via E1 → E2.
        let a_chart = MachineChart::parse(
            r#"{ id: 'a', initial: 'idle', states: {
                idle: { on: { PUSH: 'announce' } },
                announce: { entry: 'announce' }
            } }"#,
        )
        .unwrap();
        let mut a_registry = Registry::new();
        a_registry.add_sync_action("announce", |_, _, orchestration| {
            orchestration.request_send("B", "E1", Value::Null);
            orchestration.request_send("B", "E2", Value::Null);
            Ok(())
        });
        let b_chart = MachineChart::parse(
            r#"{ id: 'b', initial: 'b0', states: {
                b0: { on: { E1: 'b1' } },
                b1: { on: { E2: 'b2' } },
                b2: {}
            } }"#,
        )
        .unwrap();

        let orchestrator = EventBusOrchestrator::new(small_config());
        orchestrator
            .register(
                "A",
                Machine::new("A", Arc::new(a_chart), Arc::new(a_registry)),
            )
            .unwrap();
        orchestrator
            .register(
                "B",
                Machine::new("B", Arc::new(b_chart), Arc::new(Registry::new())),
            )
            .unwrap();
        orchestrator.start_machine("A").await.unwrap();
        orchestrator.start_machine("B").await.unwrap();

        orchestrator.send("test", "A", "PUSH", Value::Null).await.unwrap();
        wait_for_config(&orchestrator, "B", &["b2"]).await;
    }

    #[tokio::test]
    async fn self_send_is_deferred_not_reentrant() {
        let chart = MachineChart::parse(
            r#"{ id: 'm', initial: 'a', states: {
                a: { on: { KICK: { target: 'b', actions: 'kickSelf' } } },
                b: { on: { FOLLOW: 'c' } },
                c: {}
            } }"#,
        )
        .unwrap();
        let mut registry = Registry::new();
        registry.add_sync_action("kickSelf", |_, _, orchestration| {
            orchestration.request_self_send("FOLLOW", Value::Null);
            Ok(())
        });
        let orchestrator = EventBusOrchestrator::new(small_config());
        orchestrator
            .register("m", Machine::new("m", Arc::new(chart), Arc::new(registry)))
            .unwrap();
        orchestrator.start_machine("m").await.unwrap();

        let result = orchestrator.send("test", "m", "KICK", Value::Null).await.unwrap();
        // The transition that requested the send commits first.
        assert_eq!(result.new_configuration, vec!["b"]);
        wait_for_config(&orchestrator, "m", &["c"]).await;
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_the_source() {
        let chart = Arc::new(
            MachineChart::parse(
                "{ id: 'l', initial: 'idle', states: { idle: { on: { PING: 'pinged' } }, pinged: {} } }",
            )
            .unwrap(),
        );
        let orchestrator = EventBusOrchestrator::new(small_config());
        for id in ["alpha", "beta", "gamma"] {
            orchestrator
                .register(id, Machine::new(id, chart.clone(), Arc::new(Registry::new())))
                .unwrap();
            orchestrator.start_machine(id).await.unwrap();
        }

        let delivered = orchestrator.broadcast("alpha", "PING", Value::Null).await.unwrap();
        assert_eq!(delivered, 2);
        wait_for_config(&orchestrator, "beta", &["pinged"]).await;
        wait_for_config(&orchestrator, "gamma", &["pinged"]).await;
        wait_for_config(&orchestrator, "alpha", &["idle"]).await;
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_event_but_not_the_consumer() {
        let chart = MachineChart::parse(
            "{ id: 'm', initial: 'a', states: { a: { on: { BOOM: { actions: 'panic' }, PING: 'b' } }, b: {} } }",
        )
        .unwrap();
        let mut registry = Registry::new();
        registry.add_sync_action("panic", |_, _, _| panic!("exploded"));
        let orchestrator = EventBusOrchestrator::new(small_config());
        let mut events = orchestrator.subscribe();
        orchestrator
            .register("m", Machine::new("m", Arc::new(chart), Arc::new(registry)))
            .unwrap();
        orchestrator.start_machine("m").await.unwrap();

        let result = orchestrator.send("test", "m", "BOOM", Value::Null).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("Panic"));

        // Consumer is still alive and the machine still responds.
        let result = orchestrator.send("test", "m", "PING", Value::Null).await.unwrap();
        assert!(result.success);
        assert_eq!(result.new_configuration, vec!["b"]);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, OrchestratorEvent::MachineEventFailed { ref error_kind, .. } if error_kind == "Panic")
            {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn unhandled_error_event_is_dead_lettered() {
        let orchestrator = EventBusOrchestrator::new(small_config());
        orchestrator.register("t1", toggle_machine("t1")).unwrap();
        orchestrator.start_machine("t1").await.unwrap();

        orchestrator
            .send("test", "t1", "error.invoke.ghost", Value::Null)
            .await
            .unwrap();
        assert_eq!(orchestrator.dlq().len(), 1);
        assert_eq!(orchestrator.dlq().list()[0].error_kind, "BubbledError");
    }

    #[tokio::test]
    async fn observability_stream_reports_processing() {
        let orchestrator = EventBusOrchestrator::new(small_config());
        let mut events = orchestrator.subscribe();
        orchestrator.register("t1", toggle_machine("t1")).unwrap();
        orchestrator.start_machine("t1").await.unwrap();
        orchestrator.send("test", "t1", "TOGGLE", Value::Null).await.unwrap();

        let mut processed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::MachineEventProcessed {
                event_name,
                old_configuration,
                new_configuration,
                ..
            } = event
            {
                processed.push((event_name, old_configuration, new_configuration));
            }
        }
        assert!(processed
            .iter()
            .any(|(name, old, new)| name == "TOGGLE" && old == &["off"] && new == &["on"]));
    }

    #[tokio::test]
    async fn metrics_accumulate_when_enabled() {
        let orchestrator = EventBusOrchestrator::new(OrchestratorConfig {
            enable_metrics: true,
            ..small_config()
        });
        orchestrator.register("t1", toggle_machine("t1")).unwrap();
        orchestrator.start_machine("t1").await.unwrap();
        orchestrator.send("test", "t1", "TOGGLE", Value::Null).await.unwrap();
        orchestrator.send("test", "t1", "TOGGLE", Value::Null).await.unwrap();

        let metrics = orchestrator.metrics_of("t1").unwrap();
        assert!(metrics.events_processed >= 3);
        assert_eq!(metrics.events_failed, 0);
    }

    #[tokio::test]
    async fn stop_rejects_new_work_and_stops_machines() {
        let exited: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let mut registry = Registry::new();
        {
            let exited = exited.clone();
            registry.add_sync_action("onExit", move |_, _, _| {
                *exited.lock() += 1;
                Ok(())
            });
        }
        let chart = MachineChart::parse(
            "{ id: 'm', initial: 'a', states: { a: { exit: 'onExit' } } }",
        )
        .unwrap();
        let orchestrator = EventBusOrchestrator::new(small_config());
        orchestrator
            .register("m", Machine::new("m", Arc::new(chart), Arc::new(registry)))
            .unwrap();
        orchestrator.start_machine("m").await.unwrap();

        orchestrator.stop(Duration::from_millis(500)).await;
        assert_eq!(*exited.lock(), 1);
        assert_eq!(orchestrator.machine_count(), 0);

        let err = orchestrator.send("test", "m", "E", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }

    #[tokio::test]
    async fn timeout_protected_machine_registers_as_a_handle() {
        use crate::config::TimeoutConfig;
        use crate::resilience::timeout::TimeoutProtectedMachine;

        let orchestrator = EventBusOrchestrator::new(small_config());
        let wrapped = TimeoutProtectedMachine::new(
            toggle_machine("t1"),
            TimeoutConfig::default(),
            orchestrator.dlq(),
        );
        orchestrator
            .register_handle("t1", Box::new(wrapped), None)
            .unwrap();
        let started = orchestrator.start_machine("t1").await.unwrap();
        assert!(started.success);
        let result = orchestrator.send("test", "t1", "TOGGLE", Value::Null).await.unwrap();
        assert_eq!(result.new_configuration, vec!["on"]);
    }
}
