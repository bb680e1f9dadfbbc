//! Correlates a synchronous write with its response by message id.
//!
//! Grounded on `original_source/pkg/viaduct/pkg/conn/quic.go`'s
//! `syncKeeper`: `WriteMessageSync` registers a waiter before writing, and
//! `handleMessage`'s read loop calls `MatchAndNotify` for every inbound
//! frame, falling through to the FIFO or the `Mux` only when no waiter
//! claims it. A second concurrent wait on the same id is a programmer
//! error (spec §4.3, invariant #3) rather than a queued wait.

use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

const CONTEXT: &str = "sync_keeper";

/// Tracks at most one pending waiter per message id.
pub struct SyncKeeper {
    waiters: DashMap<String, oneshot::Sender<agent_bus::Message>>,
}

impl SyncKeeper {
    pub fn new() -> Self {
        Self {
            waiters: DashMap::new(),
        }
    }

    /// Registers a waiter for `id` and blocks until a matching response
    /// arrives or `deadline` elapses. Fails with [`Error::Conflict`] if a
    /// waiter for `id` is already registered.
    pub async fn wait_response(&self, id: &str, deadline: Option<Instant>) -> Result<agent_bus::Message> {
        let rx = self.register(id)?;

        let result = match deadline {
            Some(instant) => {
                let now = Instant::now();
                if instant <= now {
                    self.waiters.remove(id);
                    return Err(Error::timeout(CONTEXT));
                }
                match tokio::time::timeout(instant - now, rx).await {
                    Ok(inner) => inner,
                    Err(_) => {
                        self.waiters.remove(id);
                        return Err(Error::timeout(CONTEXT));
                    }
                }
            }
            None => rx.await,
        };

        result.map_err(|_| Error::closed(CONTEXT))
    }

    /// Registers a waiter without blocking; the caller drives the returned
    /// receiver itself. Used when the write and the wait need to be
    /// interleaved around a fallible I/O call.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<agent_bus::Message>> {
        if self.waiters.contains_key(id) {
            return Err(Error::conflict(
                CONTEXT,
                format!("a waiter for id {id} is already registered"),
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Delivers `msg` to the waiter registered for the id it answers. A
    /// response correlates to its request via `parent_id` (set by
    /// `Message::new_response`); a message with no `parent_id` is matched
    /// by its own id instead, covering peers that echo the request id
    /// directly rather than minting a response id. Returns whether a
    /// waiter claimed it; the caller (the connection's read loop) falls
    /// back to the FIFO or the `Mux` on `false`.
    pub fn match_and_notify(&self, msg: agent_bus::Message) -> bool {
        let key = msg.header.parent_id.as_deref().unwrap_or(&msg.header.id);
        if let Some((_, tx)) = self.waiters.remove(key) {
            let _ = tx.send(msg);
            true
        } else {
            false
        }
    }

    /// Drops any waiter for `id` without notifying it, used when a caller
    /// abandons a registered wait (e.g. the write itself failed).
    pub fn cancel(&self, id: &str) {
        self.waiters.remove(id);
    }
}

impl Default for SyncKeeper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matched_response_completes_the_wait() {
        let keeper = SyncKeeper::new();
        let reply = agent_bus::Message::new("bus", "device/d1", "ack").with_id("abc");
        let reply_clone = reply.clone();

        let keeper_ref = &keeper;
        let (waited, _) = tokio::join!(
            keeper_ref.wait_response("abc", None),
            async {
                tokio::task::yield_now().await;
                assert!(keeper_ref.match_and_notify(reply_clone));
            }
        );
        assert_eq!(waited.unwrap().header.id, reply.header.id);
    }

    #[tokio::test]
    async fn second_concurrent_wait_on_same_id_conflicts() {
        let keeper = SyncKeeper::new();
        let _rx = keeper.register("dup").unwrap();
        let err = keeper.wait_response("dup", None).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn unmatched_message_returns_false() {
        let keeper = SyncKeeper::new();
        let msg = agent_bus::Message::new("bus", "device/d1", "ack").with_id("nobody-waiting");
        assert!(!keeper.match_and_notify(msg));
    }

    #[tokio::test]
    async fn wait_with_past_deadline_times_out_immediately() {
        let keeper = SyncKeeper::new();
        let err = keeper
            .wait_response("late", Some(Instant::now() - std::time::Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
