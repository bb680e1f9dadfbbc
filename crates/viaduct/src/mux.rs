//! Routes inbound messages to registered handlers by `(operation,
//! resource-pattern)`, used when a connection runs with `autoRoute`
//! enabled instead of pull-style `ReadMessage`.
//!
//! Grounded on `original_source/pkg/viaduct/pkg/conn/quic.go`'s
//! `handleMessage`, which hands unclaimed messages to a `Mux` keyed on
//! resource path; the pack's own workspace has no regex-pattern router, so
//! resource matching is enriched from `regex`, the pattern-matching crate
//! `groblegark-coop`'s workspace already depends on for similar routing.

use std::sync::RwLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::{Error, Result};
use crate::lane::Lane;
use crate::stream_manager::Stream;

/// One inbound message paired with a way to send a correlated response
/// back on the connection it arrived on.
pub struct MessageRequest {
    pub message: agent_bus::Message,
    pub responder: ResponseWriter,
}

/// Handed to a [`Handler`] so it can reply on the same stream the request
/// arrived on, without holding a reference to the connection itself.
#[derive(Clone)]
pub struct ResponseWriter {
    stream: Stream,
}

impl ResponseWriter {
    pub fn new(stream: Stream) -> Self {
        Self { stream }
    }

    pub async fn respond(&self, msg: &agent_bus::Message) -> Result<()> {
        let mut guard = self.stream.lock().await;
        Lane::new(&mut *guard).write_message(msg).await
    }
}

/// Implemented by anything that wants to handle one class of inbound
/// message. Registered against an operation and a resource-path regex.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: MessageRequest);
}

struct Route {
    operation: String,
    pattern: Regex,
    handler: std::sync::Arc<dyn Handler>,
}

/// A first-registered-wins router: the first route whose operation
/// matches exactly and whose pattern matches the message's resource wins;
/// ties among overlapping patterns are resolved by registration order
/// (spec §4.6).
pub struct Mux {
    routes: RwLock<Vec<Route>>,
}

impl Mux {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Registers `handler` for messages whose `operation` matches exactly
    /// and whose `resource` matches `resource_pattern`. Fails only if
    /// `resource_pattern` is not a valid regex.
    pub fn handle(
        &self,
        operation: impl Into<String>,
        resource_pattern: &str,
        handler: std::sync::Arc<dyn Handler>,
    ) -> Result<()> {
        let pattern = Regex::new(resource_pattern)
            .map_err(|err| Error::conflict("mux.handle", err.to_string()))?;
        self.routes.write().expect("mux routes lock poisoned").push(Route {
            operation: operation.into(),
            pattern,
            handler,
        });
        Ok(())
    }

    /// Dispatches `request` to the first matching route. Unmatched
    /// requests are logged and dropped, matching the original's behavior
    /// of silently discarding messages no handler claimed.
    pub async fn dispatch(&self, request: MessageRequest) {
        let handler = {
            let routes = self.routes.read().expect("mux routes lock poisoned");
            routes
                .iter()
                .find(|route| {
                    route.operation == request.message.operation
                        && route.pattern.is_match(&request.message.resource)
                })
                .map(|route| route.handler.clone())
        };

        match handler {
            Some(handler) => handler.handle(request).await,
            None => tracing::warn!(
                operation = %request.message.operation,
                resource = %request.message.resource,
                "no mux route matched inbound message"
            ),
        }
    }
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::UseType;
    use crate::stream_manager::{StreamManager, StreamManagerConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, request: MessageRequest) {
            self.count.fetch_add(1, Ordering::SeqCst);
            let response = request.message.new_response(serde_json::json!({}));
            let _ = request.responder.respond(&response).await;
        }
    }

    async fn request(resource: &str, operation: &str) -> (MessageRequest, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        let mgr = StreamManager::new(StreamManagerConfig::default());
        let stream = mgr.add_stream(UseType::Message, Box::new(near)).await;
        let message = agent_bus::Message::new("bus", resource, operation);
        (
            MessageRequest {
                message,
                responder: ResponseWriter::new(stream),
            },
            far,
        )
    }

    #[tokio::test]
    async fn matches_on_operation_and_resource_pattern() {
        let mux = Mux::new();
        let count = Arc::new(AtomicUsize::new(0));
        mux.handle(
            "update",
            r"^device/[^/]+/attr$",
            Arc::new(CountingHandler { count: count.clone() }),
        )
        .unwrap();

        let (req, mut far) = request("device/d1/attr", "update").await;
        mux.dispatch(req).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let mut lane = Lane::new(&mut far);
        lane.read_message().await.unwrap();
    }

    #[tokio::test]
    async fn first_registered_route_wins_on_overlap() {
        let mux = Mux::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        mux.handle("update", r"^device/.*$", Arc::new(CountingHandler { count: first.clone() }))
            .unwrap();
        mux.handle(
            "update",
            r"^device/d1$",
            Arc::new(CountingHandler { count: second.clone() }),
        )
        .unwrap();

        let (req, _far) = request("device/d1", "update").await;
        mux.dispatch(req).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_operation_is_dropped_without_panicking() {
        let mux = Mux::new();
        let count = Arc::new(AtomicUsize::new(0));
        mux.handle("update", r"^device/.*$", Arc::new(CountingHandler { count: count.clone() }))
            .unwrap();

        let (req, _far) = request("device/d1", "delete").await;
        mux.dispatch(req).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
