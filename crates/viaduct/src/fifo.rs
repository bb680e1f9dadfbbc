//! Unbounded, strictly-FIFO queue for inbound messages when a connection
//! runs with `autoRoute` disabled and callers pull via `ReadMessage`
//! instead of routing through the [`crate::mux::Mux`].
//!
//! Grounded on `original_source/pkg/viaduct/pkg/conn/quic.go`'s
//! `messageFifo`: `handleMessage` pushes every frame the `syncKeeper`
//! doesn't claim, and `ReadMessage` blocks on the next one.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};

const CONTEXT: &str = "message_fifo";

pub struct MessageFifo {
    tx: Mutex<Option<mpsc::UnboundedSender<agent_bus::Message>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<agent_bus::Message>>,
}

impl MessageFifo {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
        }
    }

    /// Pushes a message to the back of the queue. Never blocks. Fails with
    /// [`Error::Closed`] once [`Self::close`] has been called.
    pub fn put(&self, msg: agent_bus::Message) -> Result<()> {
        let guard = self.tx.lock().expect("fifo tx lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| Error::closed(CONTEXT)),
            None => Err(Error::closed(CONTEXT)),
        }
    }

    /// Blocks until a message is available. Only one task should call this
    /// at a time (it is the connection's single `ReadMessage` consumer);
    /// concurrent callers would each receive a disjoint subset of messages
    /// rather than a conflict, since the underlying channel has one
    /// receiver.
    pub async fn get(&self) -> Result<agent_bus::Message> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or_else(|| Error::closed(CONTEXT))
    }

    /// Stops accepting new messages. Messages already queued are still
    /// delivered by `get` before it starts returning `Closed`.
    pub fn close(&self) {
        *self.tx.lock().expect("fifo tx lock poisoned") = None;
    }
}

impl Default for MessageFifo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(op: &str) -> agent_bus::Message {
        agent_bus::Message::new("bus", "device/d1", op)
    }

    #[tokio::test]
    async fn preserves_fifo_order() {
        let fifo = MessageFifo::new();
        fifo.put(msg("first")).unwrap();
        fifo.put(msg("second")).unwrap();
        assert_eq!(fifo.get().await.unwrap().operation, "first");
        assert_eq!(fifo.get().await.unwrap().operation, "second");
    }

    #[tokio::test]
    async fn drains_queued_messages_before_reporting_closed() {
        let fifo = MessageFifo::new();
        fifo.put(msg("queued")).unwrap();
        fifo.close();
        assert_eq!(fifo.get().await.unwrap().operation, "queued");
        assert!(matches!(fifo.get().await.unwrap_err(), Error::Closed { .. }));
    }

    #[tokio::test]
    async fn put_after_close_fails() {
        let fifo = MessageFifo::new();
        fifo.close();
        assert!(matches!(fifo.put(msg("late")).unwrap_err(), Error::Closed { .. }));
    }
}
