//! Per-device lock table, in-memory device cache, and the two small
//! helpers (`Send`, `BuildModelMessage`) every `DeviceWorker` handler uses
//! to talk back to the rest of the agent (spec §4.8).
//!
//! The per-ID lock table is grounded on
//! `spark-switch::core::session_manager::SessionManager`'s `DashMap` idiom
//! (atomic insert via `Entry`), adapted to hold owned mutex guards keyed
//! by device id so `lock`/`unlock` can be explicit, non-RAII calls rather
//! than a scope guard: the spec requires "unlock is mandatory on every
//! exit path" the way the Go source's `defer context.Unlock(deviceID)`
//! does, and an explicit pair of calls is the literal translation of that
//! contract, not the idiomatic Rust default.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use dashmap::mapref::one::{Ref, RefMut};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc};

use crate::error::{Error, Result};
use crate::types::Device;

const CONTEXT: &str = "devicetwin.context";

/// Where a published message should be delivered (spec §6: `send-to-edge`
/// / `send-to-cloud`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Edge,
    Cloud,
}

/// Routes an outbound [`agent_bus::Message`] to the local edge bus or the
/// cloud uplink. `viaduct::QuicConnection` (for the cloud path) and the
/// in-process module bus (for the edge path) both implement this.
pub trait Bus: Send + Sync {
    fn send(&self, destination: Destination, target: &str, module: &str, message: agent_bus::Message) -> Result<()>;
}

/// Holds the device cache, the per-device lock table, and the bus/
/// heartbeat sinks `DeviceWorker` hands messages to.
pub struct Context {
    device_list: DashMap<String, Device>,
    lock_table: DashMap<String, Arc<AsyncMutex<()>>>,
    held: StdMutex<HashMap<String, OwnedMutexGuard<()>>>,
    bus: Arc<dyn Bus>,
    heartbeat_sinks: DashMap<String, mpsc::UnboundedSender<String>>,
}

impl Context {
    pub fn new(bus: Arc<dyn Bus>) -> Arc<Self> {
        Arc::new(Self {
            device_list: DashMap::new(),
            lock_table: DashMap::new(),
            held: StdMutex::new(HashMap::new()),
            bus,
            heartbeat_sinks: DashMap::new(),
        })
    }

    /// Inserts or replaces the cached copy of `device`.
    pub fn put_device(&self, device: Device) {
        self.device_list.insert(device.id.clone(), device);
    }

    pub fn get_device(&self, id: &str) -> Option<Ref<'_, String, Device>> {
        self.device_list.get(id)
    }

    pub fn get_device_mut(&self, id: &str) -> Option<RefMut<'_, String, Device>> {
        self.device_list.get_mut(id)
    }

    pub fn remove_device(&self, id: &str) -> Option<Device> {
        self.device_list.remove(id).map(|(_, device)| device)
    }

    /// Blocks until exclusive use of `id`'s device record is granted.
    /// Non-reentrant: calling `lock` twice for the same id from the same
    /// task deadlocks the second call, matching the spec's invariant that
    /// at most one mutator runs per device at a time.
    pub async fn lock(&self, id: &str) {
        let mutex = self
            .lock_table
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        self.held
            .lock()
            .expect("context held-lock table poisoned")
            .insert(id.to_string(), guard);
    }

    /// Releases a lock taken by [`Self::lock`]. A no-op if `id` was not
    /// locked (mirrors the Go source's `defer Unlock` firing even on paths
    /// that returned before `Lock` — callers here are expected to always
    /// pair the two, but an extra `unlock` must never panic).
    pub fn unlock(&self, id: &str) {
        self.held.lock().expect("context held-lock table poisoned").remove(id);
    }

    /// Routes `message` to the local bus or the cloud uplink. Send
    /// failures are the caller's to log (spec §7: "Send failures ... are
    /// logged but do not fail the caller").
    pub fn send(&self, target: &str, destination: Destination, module: &str, message: agent_bus::Message) -> Result<()> {
        self.bus.send(destination, target, module, message)
    }

    /// Builds a standard message envelope (spec §4.8).
    pub fn build_model_message(
        &self,
        group: impl Into<String>,
        parent: Option<&str>,
        resource: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
    ) -> agent_bus::Message {
        let mut message = agent_bus::Message::new(group, resource, operation).with_content(payload);
        if let Some(parent_id) = parent {
            message.header.parent_id = Some(parent_id.to_string());
        }
        message
    }

    /// Registers `group`'s liveness sink; `DeviceWorker::run` forwards
    /// every heartbeat token it reads to [`Self::heart_beat`], which
    /// delivers it here.
    pub fn register_heartbeat_sink(&self, group: impl Into<String>, sink: mpsc::UnboundedSender<String>) {
        self.heartbeat_sinks.insert(group.into(), sink);
    }

    /// Forwards a keepalive token for `group`. Fails with [`Error::Closed`]
    /// equivalent (`Error::conflict`, since devicetwin has no `Closed`
    /// variant) when no sink is registered or it has been dropped, which
    /// is the signal `DeviceWorker::run` uses to stop (spec §4.9: "Start"
    /// returns when `DTContexts.HeartBeat` errors).
    pub fn heart_beat(&self, group: &str, token: &str) -> Result<()> {
        let sink = self
            .heartbeat_sinks
            .get(group)
            .ok_or_else(|| Error::not_found(CONTEXT, group))?;
        sink.send(token.to_string())
            .map_err(|_| Error::conflict(CONTEXT, "heartbeat sink closed"))
    }
}
