//! `DeviceWorker`: decodes inbound device events, serializes access to the
//! target device behind `Context::lock`/`unlock`, and reconciles cached
//! state against storage (spec §4.9).
//!
//! Grounded line-for-line on
//! `original_source/edge/pkg/devicetwin/dtmanager/device.go`: `Start`'s
//! `select` loop, `dealDeviceStateUpdate`/`dealDeviceAttrUpdate` as the two
//! registered actions, `UpdateDeviceAttr` as the merge/replace orchestrator,
//! and `DealMsgAttr` as the attribute diff. The Go source dispatches through
//! a `map[string]CallBack` built once at startup; with exactly two actions
//! fixed for the lifetime of the worker, a `match` is the equivalent Rust
//! idiom and avoids boxing a handful of async closures for no benefit.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::RetryPolicy;
use crate::context::{Context, Destination};
use crate::error::Result;
use crate::store::DeviceStore;
use crate::time::{now_millis, now_rfc3339};
use crate::types::{
    AttrColumnValue, DealAttrResult, DealType, Device, DeviceAttrRow, DeviceAttrUpdate,
    DeviceDelete, DeviceState, DeviceUpdate, MsgAttr, MsgAttrDelta,
};

const ACTION_DEVICE_UPDATED: &str = "device-updated";
const ACTION_DEVICE_STATE_UPDATE: &str = "device-state-update";

const STATE_UPDATE_RESULT_SUFFIX: &str = "/state/update/result";
const STATE_UPDATE_SUFFIX: &str = "/state/update";
const ATTR_UPDATED_SUFFIX: &str = "/updated";

/// The handles every handler function needs, bundled so dispatch doesn't
/// have to thread five separate arguments through every call.
#[derive(Clone)]
struct WorkerDeps {
    context: Arc<Context>,
    store: Arc<dyn DeviceStore>,
    retry: RetryPolicy,
    device_prefix: String,
}

/// Reconciles one device's state against the agent bus and persistent
/// storage. One instance is started per device-twin group; `run` drives it
/// until its inbound channel closes.
pub struct DeviceWorker {
    deps: WorkerDeps,
    group: String,
    inbound: mpsc::UnboundedReceiver<agent_bus::DTMessage>,
    heartbeat: mpsc::UnboundedReceiver<String>,
}

impl DeviceWorker {
    /// Builds a worker and the two channels callers feed it through: one
    /// for device events, one for the liveness tokens `Context::heart_beat`
    /// forwards (spec §4.9).
    pub fn new(
        context: Arc<Context>,
        store: Arc<dyn DeviceStore>,
        retry: RetryPolicy,
        group: impl Into<String>,
        device_prefix: impl Into<String>,
    ) -> (
        Self,
        mpsc::UnboundedSender<agent_bus::DTMessage>,
        mpsc::UnboundedSender<String>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        let worker = Self {
            deps: WorkerDeps {
                context,
                store,
                retry,
                device_prefix: device_prefix.into(),
            },
            group: group.into(),
            inbound: inbound_rx,
            heartbeat: heartbeat_rx,
        };
        (worker, inbound_tx, heartbeat_tx)
    }

    /// Drains inbound events and heartbeat tokens until the inbound channel
    /// closes or a forwarded heartbeat fails (spec §4.9: "returns when
    /// heartbeat forwarding fails").
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.inbound.recv() => {
                    match msg {
                        Some(dt_msg) => self.dispatch(dt_msg).await,
                        None => return,
                    }
                }
                token = self.heartbeat.recv() => {
                    match token {
                        Some(token) => {
                            if self.deps.context.heart_beat(&self.group, &token).is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn dispatch(&self, dt_msg: agent_bus::DTMessage) {
        match dt_msg.action.as_str() {
            ACTION_DEVICE_UPDATED => handle_attr_update(self.deps.clone(), dt_msg.identity, dt_msg.msg).await,
            ACTION_DEVICE_STATE_UPDATE => handle_state_update(self.deps.clone(), dt_msg.identity, dt_msg.msg).await,
            other => tracing::error!(action = other, "no callback registered for device event"),
        }
    }
}

fn decode_device_update(msg: &agent_bus::Message) -> serde_json::Result<DeviceUpdate> {
    serde_json::from_value(msg.content.clone())
}

async fn handle_state_update(deps: WorkerDeps, resource: String, msg: agent_bus::Message) {
    let update = match decode_device_update(&msg) {
        Ok(update) => update,
        Err(err) => {
            tracing::error!(error = %err, "failed to decode device state update");
            return;
        }
    };
    let device_id = resource;
    deps.context.lock(&device_id).await;
    state_update_locked(&deps, &device_id, update).await;
    deps.context.unlock(&device_id);
}

/// Body of `dealDeviceStateUpdate`. Assumes the caller already holds the
/// per-device lock and releases it themselves.
async fn state_update_locked(deps: &WorkerDeps, device_id: &str, update: DeviceUpdate) {
    if deps.context.get_device(device_id).is_none() {
        return;
    }
    let Some(state_raw) = update.state else {
        return;
    };
    let state_lower = state_raw.to_ascii_lowercase();
    let Some(state) = DeviceState::parse(&state_lower) else {
        return;
    };
    let last_online = if state.marks_last_online() { now_rfc3339() } else { String::new() };

    let mut cols = BTreeMap::new();
    cols.insert("last_online", last_online.clone());
    cols.insert("state", state_raw.clone());

    let mut last_err = None;
    for _ in 0..deps.retry.times {
        match deps.store.update_device_fields(device_id, &cols).await {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(deps.retry.interval).await;
            }
        }
    }
    if let Some(err) = last_err {
        tracing::error!(device_id, error = %err, "device state persistence failed after retries");
        return;
    }

    let snapshot = {
        let Some(mut device) = deps.context.get_device_mut(device_id) else {
            return;
        };
        device.state = state_raw.clone();
        device.last_online = last_online;
        device.clone()
    };

    let payload = serde_json::to_value(DeviceCloudState {
        base: agent_bus::BaseMessage {
            event_id: None,
            timestamp: now_millis(),
        },
        device: &snapshot,
    })
    .unwrap_or(serde_json::Value::Null);

    let result_topic = format!("{}{device_id}{STATE_UPDATE_RESULT_SUFFIX}", deps.device_prefix);
    let edge_msg = deps
        .context
        .build_model_message("bus", None, result_topic, "publish", payload.clone());
    if let Err(err) = deps.context.send(device_id, Destination::Edge, "comm", edge_msg) {
        tracing::warn!(device_id, error = %err, "failed to publish device state update to the local bus");
    }

    let cloud_resource = format!("device/{device_id}{STATE_UPDATE_SUFFIX}");
    let cloud_msg = deps
        .context
        .build_model_message("resource", None, cloud_resource, "update", payload);
    if let Err(err) = deps.context.send(device_id, Destination::Cloud, "comm", cloud_msg) {
        tracing::warn!(device_id, error = %err, "failed to publish device state update to the cloud");
    }
}

async fn handle_attr_update(deps: WorkerDeps, resource: String, msg: agent_bus::Message) {
    let update = match decode_device_update(&msg) {
        Ok(update) => update,
        Err(err) => {
            tracing::error!(error = %err, "failed to decode device attribute update");
            return;
        }
    };
    let device_id = resource;
    deps.context.lock(&device_id).await;
    let base = agent_bus::BaseMessage {
        event_id: update.event_id,
        timestamp: 0,
    };
    update_device_attr(&deps, &device_id, update.attributes.unwrap_or_default(), base, DealType::Merge).await;
    deps.context.unlock(&device_id);
}

/// Body of `UpdateDeviceAttr`. Assumes the caller already holds the
/// per-device lock.
async fn update_device_attr(
    deps: &WorkerDeps,
    device_id: &str,
    attributes: BTreeMap<String, Option<MsgAttr>>,
    mut base: agent_bus::BaseMessage,
    deal_type: DealType,
) {
    let deal_result = {
        let Some(mut device) = deps.context.get_device_mut(device_id) else {
            return;
        };
        deal_msg_attr(&mut device, device_id, &attributes, deal_type)
    };

    if deal_result.is_empty() {
        return;
    }

    let mut last_err = None;
    for _ in 0..deps.retry.times {
        match deps
            .store
            .device_attr_trans(&deal_result.add, &deal_result.delete, &deal_result.update)
            .await
        {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(deps.retry.interval).await;
            }
        }
    }
    base.timestamp = now_millis();

    if let Some(err) = last_err {
        tracing::error!(device_id, error = %err, "attribute update persistence failed after retries, resyncing");
        if let Err(err) = resync_device_from_store(deps, device_id).await {
            tracing::error!(device_id, error = %err, "failed to resync device from storage");
        }
        return;
    }

    let payload = serde_json::to_value(DeviceAttrUpdatePayload {
        base,
        result: &deal_result.result,
    })
    .unwrap_or(serde_json::Value::Null);
    let topic = format!("{}{device_id}{ATTR_UPDATED_SUFFIX}", deps.device_prefix);
    let edge_msg = deps.context.build_model_message("bus", None, topic, "publish", payload);
    if let Err(err) = deps.context.send(device_id, Destination::Edge, "comm", edge_msg) {
        tracing::warn!(device_id, error = %err, "failed to publish device attribute update to the local bus");
    }
}

/// Rebuilds the cached device from storage after a write that could not be
/// persisted (spec §4.9). A device missing from storage entirely is dropped
/// from the cache rather than left stale.
async fn resync_device_from_store(deps: &WorkerDeps, device_id: &str) -> Result<()> {
    let Some(row) = deps.store.query_device("id", device_id).await?.into_iter().next() else {
        deps.context.remove_device(device_id);
        return Ok(());
    };
    let attr_rows = deps.store.query_device_attrs(device_id).await?;
    let attributes = attr_rows
        .iter()
        .map(|row| (row.name.clone(), MsgAttr::from_row(row)))
        .collect();
    deps.context.put_device(Device {
        id: row.id,
        name: row.name,
        description: row.description,
        state: row.state,
        last_online: row.last_online,
        attributes,
    });
    Ok(())
}

/// The attribute diff at the heart of an attribute update: computes the
/// storage mutations and the local-bus delta for one batch of incoming
/// attributes against the cached device, mutating the cache in lockstep so
/// the two never drift (spec §4.9, §8).
///
/// `Merge` only deletes an existing attribute when the incoming value is
/// explicitly absent (`None`) *and* the cached attribute is marked
/// optional — mirroring the source's `if *attr.Optional` guard, which in
/// turn means an attribute can only ever have `optional` flipped from
/// `true` to `false`, never back, since the guard requires it to already
/// be `true` before any change is considered. `Replace` additionally drops
/// every cached attribute absent from the incoming set.
pub fn deal_msg_attr(
    device: &mut Device,
    device_id: &str,
    msg_attrs: &BTreeMap<String, Option<MsgAttr>>,
    deal_type: DealType,
) -> DealAttrResult {
    let mut add = Vec::new();
    let mut delete = Vec::new();
    let mut update = Vec::new();
    let mut result: BTreeMap<String, Option<MsgAttrDelta>> = BTreeMap::new();

    for (key, msg_attr_opt) in msg_attrs {
        let existing = device.attributes.get(key).cloned();
        match (existing, msg_attr_opt) {
            (Some(existing_attr), None) => {
                if matches!(deal_type, DealType::Merge) && existing_attr.optional == Some(true) {
                    delete.push(DeviceDelete {
                        device_id: device_id.to_string(),
                        name: key.clone(),
                    });
                    result.insert(key.clone(), None);
                    device.attributes.remove(key);
                }
            }
            (Some(mut existing_attr), Some(msg_attr)) => {
                let mut is_change = false;
                let mut cols: BTreeMap<&'static str, AttrColumnValue> = BTreeMap::new();
                let mut delta = MsgAttrDelta::default();

                if existing_attr.value != msg_attr.value {
                    existing_attr.value = msg_attr.value.clone();
                    cols.insert("value", AttrColumnValue::Text(msg_attr.value.clone()));
                    delta.value = Some(msg_attr.value.clone());
                    is_change = true;
                }

                if let Some(new_metadata) = &msg_attr.metadata {
                    let msg_meta_json = serde_json::to_string(new_metadata).unwrap_or_default();
                    let existing_meta_json =
                        serde_json::to_string(&existing_attr.metadata.clone().unwrap_or_default()).unwrap_or_default();
                    if msg_meta_json != existing_meta_json {
                        cols.insert("attr_type", AttrColumnValue::OptText(msg_attr.attr_type().map(str::to_string)));
                        // The full incoming metadata (`type` key included)
                        // replaces the in-memory copy; only the persisted
                        // `metadata` column has `type` stripped out.
                        existing_attr.metadata = Some(new_metadata.clone());
                        let stripped = msg_attr.metadata_without_type();
                        cols.insert("metadata", AttrColumnValue::Text(serde_json::to_string(&stripped).unwrap_or_default()));
                        delta.metadata = Some(new_metadata.clone());
                        is_change = true;
                    }
                }

                if let Some(new_optional) = msg_attr.optional {
                    if existing_attr.optional == Some(true) && !new_optional {
                        existing_attr.optional = Some(new_optional);
                        cols.insert("optional", AttrColumnValue::Bool(new_optional));
                        delta.optional = Some(new_optional);
                        is_change = true;
                    }
                }

                if is_change {
                    device.attributes.insert(key.clone(), existing_attr);
                    update.push(DeviceAttrUpdate {
                        device_id: device_id.to_string(),
                        name: key.clone(),
                        cols,
                    });
                    result.insert(key.clone(), Some(delta));
                }
            }
            (None, Some(msg_attr)) => {
                add.push(DeviceAttrRow::from_msg_attr(device_id, key, msg_attr));
                device.attributes.insert(key.clone(), msg_attr.clone());
                result.insert(
                    key.clone(),
                    Some(MsgAttrDelta {
                        value: Some(msg_attr.value.clone()),
                        optional: msg_attr.optional,
                        metadata: msg_attr.metadata.clone(),
                    }),
                );
            }
            (None, None) => {}
        }
    }

    if matches!(deal_type, DealType::Replace) {
        let stale: Vec<String> = device
            .attributes
            .keys()
            .filter(|key| !msg_attrs.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            delete.push(DeviceDelete {
                device_id: device_id.to_string(),
                name: key.clone(),
            });
            result.insert(key.clone(), None);
            device.attributes.remove(&key);
        }
    }

    DealAttrResult { add, delete, update, result }
}

#[derive(Serialize)]
struct DeviceCloudState<'a> {
    #[serde(flatten)]
    base: agent_bus::BaseMessage,
    #[serde(flatten)]
    device: &'a Device,
}

#[derive(Serialize)]
struct DeviceAttrUpdatePayload<'a> {
    #[serde(flatten)]
    base: agent_bus::BaseMessage,
    result: &'a BTreeMap<String, Option<MsgAttrDelta>>,
}
