//! Ordered write-back of local changes to the remote source
//!
//! Every local write that must be mirrored is queued here and delivered
//! by one task, in the order the store applied them. Plugin writes are
//! attempted once. Computed write-backs survive outages: they wait for
//! the session to come back and retry until they land or a newer value
//! for the same key makes them obsolete. An obsolete computed write is
//! skipped even before its first attempt.

use std::sync::{Arc, Weak};
use std::time::Duration;

use ha_core::{EntityId, RemoteSource, StateValue};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::store::StateStore;

/// Pause between retries while the session is up but calls keep failing
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOrigin {
    Plugin,
    Computed,
}

#[derive(Debug)]
pub(crate) struct WriteBack {
    pub key: String,
    pub entity_id: EntityId,
    pub value: StateValue,
    /// Store version of the key when this write was applied
    pub version: u64,
    pub origin: WriteOrigin,
}

pub(crate) enum WriterCommand {
    Write(WriteBack),
    Flush(oneshot::Sender<()>),
}

/// Service call that mirrors `value` onto `entity_id`
pub fn service_call(entity_id: &EntityId, value: &StateValue) -> (String, &'static str, Value) {
    let domain = entity_id.domain().to_string();
    let target = entity_id.to_string();
    match value {
        StateValue::Bool(on) => {
            let service = if *on { "turn_on" } else { "turn_off" };
            (domain, service, json!({ "entity_id": target }))
        }
        StateValue::Number(n) => (domain, "set_value", json!({ "entity_id": target, "value": n })),
        StateValue::String(s) => (domain, "set_value", json!({ "entity_id": target, "value": s })),
        StateValue::Structured(doc) => (
            domain,
            "set_value",
            json!({ "entity_id": target, "value": doc.to_string() }),
        ),
    }
}

pub(crate) async fn write_loop(
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    remote: Arc<dyn RemoteSource>,
    store: Weak<StateStore>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Write(write) => deliver(remote.as_ref(), &store, write).await,
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Write-back queue closed");
}

async fn deliver(remote: &dyn RemoteSource, store: &Weak<StateStore>, write: WriteBack) {
    let (domain, service, data) = service_call(&write.entity_id, &write.value);

    loop {
        if write.origin == WriteOrigin::Computed && superseded(store, &write) {
            debug!(key = %write.key, "Computed write-back superseded");
            return;
        }
        match remote.call_service(&domain, service, data.clone()).await {
            Ok(()) => {
                debug!(key = %write.key, entity_id = %write.entity_id, service, "Wrote back");
                return;
            }
            Err(e) if write.origin == WriteOrigin::Computed && e.is_transient() => {
                warn!(
                    key = %write.key,
                    entity_id = %write.entity_id,
                    error = %e,
                    "Computed write-back failed, will retry"
                );
                if remote.is_connected() {
                    tokio::time::sleep(RETRY_DELAY).await;
                } else {
                    remote.wait_connected().await;
                }
            }
            Err(e) => {
                warn!(
                    key = %write.key,
                    entity_id = %write.entity_id,
                    error = %e,
                    "Write-back failed"
                );
                return;
            }
        }
    }
}

fn superseded(store: &Weak<StateStore>, write: &WriteBack) -> bool {
    store
        .upgrade()
        .map_or(true, |store| store.version(&write.key) != Some(write.version))
}
