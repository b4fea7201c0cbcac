//! Glue between a local orchestrator and the bus: exposes chosen local
//! machines on the bus, pumps inbound frames into the orchestrator, and
//! plugs into the orchestrator's remote-router seam so deferred sends to
//! machines living in other processes leave through the pipe. Broadcasts
//! stay local; only directly-addressed sends travel.

use crate::client::{BusSender, MessageBusClient};
use crate::protocol::EventPayload;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use xstatenet_core::orchestrator::{EventBusOrchestrator, RemoteRouter};
use xstatenet_core::types::DeferredSend;
use xstatenet_core::SendTarget;

struct BusRouter {
    sender: BusSender,
}

#[async_trait]
impl RemoteRouter for BusRouter {
    async fn route(&self, send: &DeferredSend) -> xstatenet_core::Result<bool> {
        let SendTarget::Machine(target) = &send.target else {
            return Ok(false);
        };
        self.sender
            .send_event(
                &send.source,
                target,
                &send.event.name,
                send.event.payload.clone(),
            )
            .await
            .map_err(|e| xstatenet_core::Error::Internal(format!("bus send failed: {e}")))?;
        Ok(true)
    }
}

/// Running bridge; dropping the handle does not tear down the connection,
/// aborting it does.
pub struct BusBridge {
    pub pump: JoinHandle<()>,
}

/// Wire `orchestrator` to the bus: register and subscribe the given local
/// machine ids, install the outbound router, and start the inbound pump.
pub async fn attach(
    mut client: MessageBusClient,
    orchestrator: Arc<EventBusOrchestrator>,
    expose: &[&str],
) -> Result<BusBridge> {
    for machine_id in expose {
        client.register(machine_id).await?;
        client.subscribe(machine_id).await?;
    }
    orchestrator.set_remote_router(Arc::new(BusRouter {
        sender: client.sender(),
    }));

    let pump = tokio::spawn(async move {
        while let Some(event) = client.next_event().await {
            deliver(&orchestrator, event).await;
        }
        tracing::info!("bus bridge pump ended");
    });
    Ok(BusBridge { pump })
}

async fn deliver(orchestrator: &EventBusOrchestrator, event: EventPayload) {
    if let Err(error) = orchestrator
        .send_fire_and_forget(
            &event.source_machine_id,
            &event.target_machine_id,
            &event.event_name,
            event.payload.clone(),
        )
        .await
    {
        tracing::warn!(
            target = %event.target_machine_id,
            event = %event.event_name,
            %error,
            "inbound bus event undeliverable"
        );
    }
}
