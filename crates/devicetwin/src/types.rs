//! Data model shared by the `Context`, `DeviceStore`, and `DeviceWorker`:
//! the cached `Device`, its attributes, and the persistence-layer
//! projections of both (spec §3).
//!
//! Grounded line-for-line on
//! `original_source/edge/pkg/devicetwin/dtmanager/device.go`'s use of
//! `dttype.Device`, `dttype.MsgAttr`, `dtclient.DeviceAttr`,
//! `dtclient.DeviceAttrUpdate`, and `dtclient.DeviceDelete`. `Metadata` is
//! kept as a `BTreeMap` rather than `HashMap` so serializing it for the
//! byte-wise diff in `worker::deal_msg_attr` produces the same
//! deterministic, key-sorted JSON that Go's `encoding/json` emits for
//! `map[string]string` — the diff only works if both sides serialize the
//! same way every time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The cached, authoritative shadow of one physical device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Lowercase state string (spec §3). Unrecognized values are accepted
    /// here (the worker only rejects them before writing), so this stays a
    /// plain `String` rather than the `DeviceState` enum.
    pub state: String,
    /// RFC-3339 UTC, or empty when the device has never been seen online.
    pub last_online: String,
    pub attributes: BTreeMap<String, MsgAttr>,
}

/// The five recognized device states (spec §3). Any other value is a
/// silent no-op per spec §4.9 step 4 — callers should go through
/// [`DeviceState::parse`] rather than matching strings themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Offline,
    Ok,
    Unknown,
    Unhealthy,
}

impl DeviceState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "ok" => Some(Self::Ok),
            "unknown" => Some(Self::Unknown),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }

    /// Whether reaching this state stamps a fresh `last_online` (spec §4.9
    /// step 5: only `online`/`ok` count as "seen").
    pub fn marks_last_online(self) -> bool {
        matches!(self, Self::Online | Self::Ok)
    }
}

/// One attribute as carried on the wire or cached in [`Device::attributes`].
///
/// `metadata` distinguishes "not provided" (`None`) from "provided but
/// empty" (`Some(BTreeMap::new())`), matching the Go source's nil-map
/// check (`if msgAttr.Metadata != nil`) that gates whether a metadata diff
/// is even attempted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgAttr {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl MsgAttr {
    /// Rebuilds the in-memory representation from a persisted row,
    /// reinserting `attr_type` under the reserved `type` metadata key so
    /// the round-tripped value matches what a live update would have left
    /// in memory (spec §3: the `type` key is only stripped in the
    /// persisted `metadata` column, never in-memory).
    pub fn from_row(row: &DeviceAttrRow) -> Self {
        let mut metadata: BTreeMap<String, String> =
            serde_json::from_str(&row.metadata).unwrap_or_default();
        if let Some(attr_type) = &row.attr_type {
            metadata.insert("type".to_string(), attr_type.clone());
        }
        Self {
            value: row.value.clone(),
            optional: Some(row.optional),
            metadata: Some(metadata),
        }
    }

    pub fn attr_type(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("type").map(String::as_str)
    }

    /// `metadata` with the reserved `type` key removed, for the persisted
    /// `metadata` column (spec §3: "reserved key `type` is extracted as a
    /// separate `AttrType` when persisted").
    pub fn metadata_without_type(&self) -> BTreeMap<String, String> {
        let mut meta = self.metadata.clone().unwrap_or_default();
        meta.remove("type");
        meta
    }
}

/// Persistence projection of [`MsgAttr`]: one row of `device_attr` (spec
/// §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceAttrRow {
    pub device_id: String,
    pub name: String,
    pub value: String,
    pub optional: bool,
    pub attr_type: Option<String>,
    pub metadata: String,
}

impl DeviceAttrRow {
    pub fn from_msg_attr(device_id: &str, name: &str, attr: &MsgAttr) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: name.to_string(),
            value: attr.value.clone(),
            optional: attr.optional.unwrap_or(false),
            attr_type: attr.attr_type().map(str::to_string),
            metadata: serde_json::to_string(&attr.metadata_without_type()).unwrap_or_default(),
        }
    }
}

/// A column-level update to one `device_attr` row. `cols` is a closed set:
/// `value`, `metadata`, `attr_type`, `optional` (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAttrUpdate {
    pub device_id: String,
    pub name: String,
    pub cols: BTreeMap<&'static str, AttrColumnValue>,
}

/// A value for one of the closed-set `device_attr` columns.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrColumnValue {
    Text(String),
    OptText(Option<String>),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDelete {
    pub device_id: String,
    pub name: String,
}

/// A single-row projection of the `device` table (spec §6).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub state: String,
    pub last_online: String,
}

impl From<&Device> for DeviceRow {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            description: device.description.clone(),
            state: device.state.clone(),
            last_online: device.last_online.clone(),
        }
    }
}

/// A device's multi-column update, batched across devices in one
/// transaction by `DeviceStore::update_device_multi` (spec §4.7).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFieldsUpdate {
    pub device_id: String,
    pub cols: BTreeMap<&'static str, String>,
}

/// Persistence projection of a device twin row (spec §6: `device_twin`).
/// The spec leaves the full twin schema to the implementer beyond the
/// primary key; `expected`/`actual` mirror the expected/reported-value
/// pair every device-twin system in this space carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceTwinRow {
    pub device_id: String,
    pub name: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub expected_version: i64,
}

/// Decoded `message.Content` for both `device-updated` and
/// `device-state-update` events (spec §6): both handlers decode the same
/// wire shape and use whichever fields apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceUpdate {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub attributes: Option<BTreeMap<String, Option<MsgAttr>>>,
    #[serde(default)]
    pub event_id: Option<String>,
}

/// Whether [`crate::worker::deal_msg_attr`] merges the incoming attribute
/// set into the cached one or replaces it outright (spec §9, Open
/// Question 3: the source's `dealType` int promoted to an enum at the
/// public boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealType {
    Merge,
    Replace,
}

/// Result of [`crate::worker::deal_msg_attr`]: the storage mutations to
/// apply and the local-bus payload to publish if any of them are
/// non-empty (spec §4.9).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DealAttrResult {
    pub add: Vec<DeviceAttrRow>,
    pub delete: Vec<DeviceDelete>,
    pub update: Vec<DeviceAttrUpdate>,
    /// `None` at a key means the attribute was deleted; `Some(delta)` means
    /// it was added (all fields populated) or changed (only the changed
    /// fields populated) — spec §8, invariant 5.
    pub result: BTreeMap<String, Option<MsgAttrDelta>>,
}

impl DealAttrResult {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.delete.is_empty() && self.update.is_empty()
    }
}

/// The subset of [`MsgAttr`]'s fields that changed, or all of them for a
/// freshly added attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgAttrDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}
