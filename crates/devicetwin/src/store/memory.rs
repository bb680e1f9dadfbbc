//! In-memory `DeviceStore` test double, so unit tests for `DeviceWorker`
//! and the diff algorithm don't need a filesystem. Mirrors
//! `SqliteDeviceStore`'s semantics (closed column set, rollback-on-error
//! transactions) without touching `sqlx`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::store::DeviceStore;
use crate::types::{
    AttrColumnValue, DeviceAttrRow, DeviceAttrUpdate, DeviceDelete, DeviceFieldsUpdate, DeviceRow,
    DeviceTwinRow,
};

const CONTEXT: &str = "memory_device_store";

#[derive(Default)]
struct State {
    devices: BTreeMap<String, DeviceRow>,
    attrs: BTreeMap<(String, String), DeviceAttrRow>,
    twins: BTreeMap<(String, String), DeviceTwinRow>,
}

/// An in-memory stand-in for [`crate::store::sqlite::SqliteDeviceStore`].
pub struct InMemoryDeviceStore {
    state: Mutex<State>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Seeds a device row directly, bypassing `add_device_trans`. Handy for
    /// test setup that only cares about a device already existing.
    pub fn seed_device(&self, row: DeviceRow) {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state.devices.insert(row.id.clone(), row);
    }

    pub fn seed_attr(&self, row: DeviceAttrRow) {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state.attrs.insert((row.device_id.clone(), row.name.clone()), row);
    }

    pub fn attr_rows(&self) -> Vec<DeviceAttrRow> {
        let state = self.state.lock().expect("memory store lock poisoned");
        state.attrs.values().cloned().collect()
    }
}

impl Default for InMemoryDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_field(row: &mut DeviceRow, field: &str, value: &str) -> Result<()> {
    match field {
        "name" => row.name = value.to_string(),
        "description" => row.description = value.to_string(),
        "state" => row.state = value.to_string(),
        "last_online" => row.last_online = value.to_string(),
        other => {
            return Err(Error::validation(
                CONTEXT,
                format!("unknown device column `{other}`"),
            ))
        }
    }
    Ok(())
}

#[async_trait]
impl DeviceStore for InMemoryDeviceStore {
    async fn update_device_field(&self, id: &str, field: &'static str, value: &str) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        let row = state
            .devices
            .get_mut(id)
            .ok_or_else(|| Error::not_found(CONTEXT, id))?;
        apply_field(row, field, value)
    }

    async fn update_device_fields(&self, id: &str, cols: &BTreeMap<&'static str, String>) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        let row = state
            .devices
            .get_mut(id)
            .ok_or_else(|| Error::not_found(CONTEXT, id))?;
        for (field, value) in cols {
            apply_field(row, field, value)?;
        }
        Ok(())
    }

    async fn update_device_multi(&self, updates: &[DeviceFieldsUpdate]) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        // Validate every update applies before mutating any row, so a
        // failure partway through a batch leaves no partial writes
        // (matching the "one transaction" contract of the real store).
        for update in updates {
            if !state.devices.contains_key(&update.device_id) {
                return Err(Error::not_found(CONTEXT, update.device_id.clone()));
            }
        }
        for update in updates {
            let row = state
                .devices
                .get_mut(&update.device_id)
                .expect("presence checked above");
            for (field, value) in &update.cols {
                apply_field(row, field, value)?;
            }
        }
        Ok(())
    }

    async fn query_device(&self, field: &'static str, value: &str) -> Result<Vec<DeviceRow>> {
        let state = self.state.lock().expect("memory store lock poisoned");
        let matches = state
            .devices
            .values()
            .filter(|row| match field {
                "id" => row.id == value,
                "name" => row.name == value,
                "state" => row.state == value,
                other => {
                    tracing::warn!(field = other, "query_device against unknown column");
                    false
                }
            })
            .cloned()
            .collect();
        Ok(matches)
    }

    async fn query_device_all(&self) -> Result<Vec<DeviceRow>> {
        let state = self.state.lock().expect("memory store lock poisoned");
        Ok(state.devices.values().cloned().collect())
    }

    async fn query_device_attrs(&self, device_id: &str) -> Result<Vec<DeviceAttrRow>> {
        let state = self.state.lock().expect("memory store lock poisoned");
        Ok(state
            .attrs
            .values()
            .filter(|row| row.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn device_attr_trans(
        &self,
        add: &[DeviceAttrRow],
        del: &[DeviceDelete],
        update: &[DeviceAttrUpdate],
    ) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        for u in update {
            let key = (u.device_id.clone(), u.name.clone());
            if !state.attrs.contains_key(&key) {
                return Err(Error::not_found(CONTEXT, format!("{}/{}", u.device_id, u.name)));
            }
        }

        for row in add {
            state
                .attrs
                .insert((row.device_id.clone(), row.name.clone()), row.clone());
        }
        for d in del {
            state.attrs.remove(&(d.device_id.clone(), d.name.clone()));
        }
        for u in update {
            let key = (u.device_id.clone(), u.name.clone());
            let row = state.attrs.get_mut(&key).expect("presence checked above");
            for (col, value) in &u.cols {
                match (*col, value) {
                    ("value", AttrColumnValue::Text(v)) => row.value = v.clone(),
                    ("metadata", AttrColumnValue::Text(v)) => row.metadata = v.clone(),
                    ("attr_type", AttrColumnValue::OptText(v)) => row.attr_type = v.clone(),
                    ("optional", AttrColumnValue::Bool(v)) => row.optional = *v,
                    _ => {
                        return Err(Error::validation(
                            CONTEXT,
                            format!("column `{col}` given a value of the wrong kind"),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    async fn add_device_trans(
        &self,
        devices: &[DeviceRow],
        attrs: &[DeviceAttrRow],
        twins: &[DeviceTwinRow],
    ) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        for d in devices {
            state.devices.insert(d.id.clone(), d.clone());
        }
        for a in attrs {
            state.attrs.insert((a.device_id.clone(), a.name.clone()), a.clone());
        }
        for t in twins {
            state.twins.insert((t.device_id.clone(), t.name.clone()), t.clone());
        }
        Ok(())
    }

    async fn delete_device_trans(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        for id in ids {
            state.devices.remove(id);
            state.attrs.retain(|(device_id, _), _| device_id != id);
            state.twins.retain(|(device_id, _), _| device_id != id);
        }
        Ok(())
    }
}
