//! End-to-end coverage of `DeviceWorker` driving a state-update event
//! through `Context` and a `DeviceStore`, matching the `state update happy
//! path` / `unknown state ignored` / `persistence retry` scenarios.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_bus::{DTMessage, Message};
use async_trait::async_trait;
use devicetwin::{
    Bus, Context, Destination, Device, DeviceAttrRow, DeviceAttrUpdate, DeviceDelete,
    DeviceFieldsUpdate, DeviceRow, DeviceStore, DeviceTwinRow, DeviceWorker, Error,
    InMemoryDeviceStore, RetryPolicy,
};

struct RecordingBus {
    sent: Mutex<Vec<(Destination, agent_bus::Message)>>,
}

impl RecordingBus {
    fn new() -> Arc<Self> {
        Arc::new(Self { sent: Mutex::new(Vec::new()) })
    }
}

impl Bus for RecordingBus {
    fn send(&self, destination: Destination, _target: &str, _module: &str, message: agent_bus::Message) -> devicetwin::Result<()> {
        self.sent.lock().unwrap().push((destination, message));
        Ok(())
    }
}

/// Fails `update_device_fields` a fixed number of times before delegating
/// to a real in-memory store, to drive the retry-then-succeed scenario.
struct FlakyStore {
    inner: InMemoryDeviceStore,
    remaining_failures: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: InMemoryDeviceStore, fail_times: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(fail_times),
        }
    }
}

#[async_trait]
impl DeviceStore for FlakyStore {
    async fn update_device_field(&self, id: &str, field: &'static str, value: &str) -> devicetwin::Result<()> {
        self.inner.update_device_field(id, field, value).await
    }

    async fn update_device_fields(&self, id: &str, cols: &BTreeMap<&'static str, String>) -> devicetwin::Result<()> {
        if self.remaining_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::conflict("flaky_store_test", "simulated failure"));
        }
        self.inner.update_device_fields(id, cols).await
    }

    async fn update_device_multi(&self, updates: &[DeviceFieldsUpdate]) -> devicetwin::Result<()> {
        self.inner.update_device_multi(updates).await
    }

    async fn query_device(&self, field: &'static str, value: &str) -> devicetwin::Result<Vec<DeviceRow>> {
        self.inner.query_device(field, value).await
    }

    async fn query_device_all(&self) -> devicetwin::Result<Vec<DeviceRow>> {
        self.inner.query_device_all().await
    }

    async fn query_device_attrs(&self, device_id: &str) -> devicetwin::Result<Vec<DeviceAttrRow>> {
        self.inner.query_device_attrs(device_id).await
    }

    async fn device_attr_trans(
        &self,
        add: &[DeviceAttrRow],
        del: &[DeviceDelete],
        update: &[DeviceAttrUpdate],
    ) -> devicetwin::Result<()> {
        self.inner.device_attr_trans(add, del, update).await
    }

    async fn add_device_trans(&self, devices: &[DeviceRow], attrs: &[DeviceAttrRow], twins: &[DeviceTwinRow]) -> devicetwin::Result<()> {
        self.inner.add_device_trans(devices, attrs, twins).await
    }

    async fn delete_device_trans(&self, ids: &[String]) -> devicetwin::Result<()> {
        self.inner.delete_device_trans(ids).await
    }
}

fn device_row(id: &str) -> DeviceRow {
    DeviceRow {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        state: String::new(),
        last_online: String::new(),
    }
}

fn state_update_message(state: &str) -> Message {
    Message::new("bus", "d1", "update").with_content(serde_json::json!({ "state": state }))
}

#[tokio::test]
async fn state_update_happy_path_persists_and_publishes_twice() {
    let store = Arc::new(InMemoryDeviceStore::new());
    store.seed_device(device_row("d1"));
    let bus = RecordingBus::new();
    let context = Context::new(bus.clone());
    context.put_device(Device {
        id: "d1".to_string(),
        ..Default::default()
    });

    let (worker, inbound, _heartbeat) = DeviceWorker::new(context, store.clone(), RetryPolicy::default(), "device", "device/");
    let handle = tokio::spawn(worker.run());

    inbound
        .send(DTMessage::new("device-state-update", "d1", state_update_message("Online")))
        .unwrap();
    drop(inbound);
    handle.await.unwrap();

    let row = store.query_device_all().await.unwrap().into_iter().next().unwrap();
    assert_eq!(row.state, "Online");
    assert!(!row.last_online.is_empty());

    let sent = bus.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, Destination::Edge);
    assert!(sent[0].1.resource.ends_with("/state/update/result"));
    assert_eq!(sent[1].0, Destination::Cloud);
    assert_eq!(sent[1].1.resource, "device/d1/state/update");
}

#[tokio::test]
async fn unknown_state_is_a_silent_no_op() {
    let store = Arc::new(InMemoryDeviceStore::new());
    store.seed_device(device_row("d1"));
    let bus = RecordingBus::new();
    let context = Context::new(bus.clone());
    context.put_device(Device {
        id: "d1".to_string(),
        ..Default::default()
    });

    let (worker, inbound, _heartbeat) = DeviceWorker::new(context, store.clone(), RetryPolicy::default(), "device", "device/");
    let handle = tokio::spawn(worker.run());

    inbound
        .send(DTMessage::new("device-state-update", "d1", state_update_message("wiggly")))
        .unwrap();
    drop(inbound);
    handle.await.unwrap();

    let row = store.query_device_all().await.unwrap().into_iter().next().unwrap();
    assert_eq!(row.state, "");
    assert!(bus.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn persistence_retry_succeeds_on_the_third_attempt() {
    let inner = InMemoryDeviceStore::new();
    inner.seed_device(device_row("d1"));
    let store = Arc::new(FlakyStore::new(inner, 2));
    let bus = RecordingBus::new();
    let context = Context::new(bus.clone());
    context.put_device(Device {
        id: "d1".to_string(),
        ..Default::default()
    });

    let retry = RetryPolicy {
        times: 5,
        interval: Duration::from_millis(1),
    };
    let (worker, inbound, _heartbeat) = DeviceWorker::new(context, store.clone(), retry, "device", "device/");
    let handle = tokio::spawn(worker.run());

    inbound
        .send(DTMessage::new("device-state-update", "d1", state_update_message("Online")))
        .unwrap();
    drop(inbound);
    handle.await.unwrap();

    let row = store.query_device_all().await.unwrap().into_iter().next().unwrap();
    assert_eq!(row.state, "Online");
    assert_eq!(bus.sent.lock().unwrap().len(), 2, "must publish exactly once after the retry succeeds");
}
