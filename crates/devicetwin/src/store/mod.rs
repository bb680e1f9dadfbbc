//! Persistence contract exposed to `DeviceWorker` (spec §4.7): single- and
//! multi-column updates, row queries, and the transactional multi-writes
//! that keep `device`/`device_attr`/`device_twin` consistent.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    DeviceAttrRow, DeviceAttrUpdate, DeviceDelete, DeviceFieldsUpdate, DeviceRow, DeviceTwinRow,
};

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Single-column update (spec §4.7).
    async fn update_device_field(&self, id: &str, field: &'static str, value: &str) -> Result<()>;

    /// Multi-column update in one statement.
    async fn update_device_fields(&self, id: &str, cols: &std::collections::BTreeMap<&'static str, String>) -> Result<()>;

    /// Batched per-device multi-column updates in one transaction.
    async fn update_device_multi(&self, updates: &[DeviceFieldsUpdate]) -> Result<()>;

    /// Zero-or-more rows matching `field = value`.
    async fn query_device(&self, field: &'static str, value: &str) -> Result<Vec<DeviceRow>>;

    /// Every row in `device`.
    async fn query_device_all(&self) -> Result<Vec<DeviceRow>>;

    /// Every `device_attr` row for one device, used to rebuild the cached
    /// `Device` after a failed write forces a resync (spec §4.9: "On
    /// failure: resync the device from storage and log").
    async fn query_device_attrs(&self, device_id: &str) -> Result<Vec<DeviceAttrRow>>;

    /// Applies `add`/`del`/`update` to `device_attr` atomically: on any
    /// sub-operation failure, rolls back and returns the original error
    /// (spec §4.7).
    async fn device_attr_trans(
        &self,
        add: &[DeviceAttrRow],
        del: &[DeviceDelete],
        update: &[DeviceAttrUpdate],
    ) -> Result<()>;

    /// Transactional multi-table insert across `device`, `device_attr`,
    /// and `device_twin`.
    async fn add_device_trans(
        &self,
        devices: &[DeviceRow],
        attrs: &[DeviceAttrRow],
        twins: &[DeviceTwinRow],
    ) -> Result<()>;

    /// Transactional delete of the given device ids and every row that
    /// references them in `device_attr`/`device_twin`.
    async fn delete_device_trans(&self, ids: &[String]) -> Result<()>;
}
