//! Per-device state reconciler: a persistent shadow per physical device,
//! delta-merge attribute sync, and retrying persistence against SQLite.
//!
//! `Context` holds the in-memory device cache and the per-device lock
//! table; `DeviceWorker` drains device events off its inbound channel,
//! takes the lock for the target device, reconciles state or attributes
//! against a [`store::DeviceStore`], and publishes the result back onto the
//! bus. See `worker::deal_msg_attr` for the attribute diff at the center of
//! an attribute-update event.

pub mod config;
pub mod context;
pub mod error;
pub mod store;
pub mod time;
pub mod types;
pub mod worker;

pub use config::RetryPolicy;
pub use context::{Bus, Context, Destination};
pub use error::{Error, Result};
pub use store::DeviceStore;
pub use store::memory::InMemoryDeviceStore;
pub use store::sqlite::SqliteDeviceStore;
pub use types::{
    AttrColumnValue, DealAttrResult, DealType, Device, DeviceAttrRow, DeviceAttrUpdate,
    DeviceDelete, DeviceFieldsUpdate, DeviceRow, DeviceState, DeviceTwinRow, DeviceUpdate, MsgAttr,
    MsgAttrDelta,
};
pub use worker::{DeviceWorker, deal_msg_attr};
