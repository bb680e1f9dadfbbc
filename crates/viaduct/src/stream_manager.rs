//! Pool of concurrent streams for one session, partitioned by [`UseType`],
//! with a free-list and LRU reclamation.
//!
//! Grounded on `spark-switch::core::session_manager::SessionManager`'s
//! `DashMap`-backed registry (atomic insert/remove keyed by an id), extended
//! with an idle queue and a hard cap since the teacher's session manager has
//! no capacity bound. The pool is generic over [`crate::duplex::Duplex`]
//! rather than tied to `quinn` directly, so unit tests can exercise the
//! real bookkeeping with an in-memory duplex instead of a mock copy of it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

use crate::api::UseType;
use crate::duplex::BoxDuplex;
use crate::error::{Error, Result};

/// Tunables named in spec §6. Defaults match the spec's stated values.
#[derive(Debug, Clone, Copy)]
pub struct StreamManagerConfig {
    pub num_streams_max: usize,
    pub auto_free: bool,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            num_streams_max: 16,
            auto_free: false,
        }
    }
}

/// A handle to one pooled stream. Cheap to clone: the underlying duplex is
/// behind an `Arc<Mutex<_>>` shared with the manager's bookkeeping entry.
#[derive(Clone)]
pub struct Stream {
    pub id: u64,
    pub use_type: UseType,
    io: Arc<AsyncMutex<BoxDuplex>>,
}

impl Stream {
    /// Locks the underlying duplex for a read/write/lane operation. The
    /// caller is expected to hold the guard only for the duration of one
    /// logical I/O operation (the connection layer already serializes
    /// writers with its own lock, so contention here is not expected in
    /// steady state).
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, BoxDuplex> {
        self.io.lock().await
    }
}

struct LiveEntry {
    use_type: UseType,
    io: Arc<AsyncMutex<BoxDuplex>>,
}

struct State {
    live: HashMap<u64, LiveEntry>,
    /// Ids of idle streams, oldest release at the front. Doubles as both
    /// the GetStream reuse order ("FIFO of least-recently-released", spec
    /// §4.2) and the eviction order (oldest idle is reclaimed first).
    idle_order: VecDeque<u64>,
}

/// Pools the streams of one session. `refcount` from spec §4.2 is modeled
/// here as membership in `idle_order` (absent = checked out, present =
/// idle with refcount 0): only `QuicConnection` acquires and releases
/// handles, under its own connection lock, so a richer counter would track
/// nothing a boolean in/out flag does not already capture.
pub struct StreamManager {
    config: StreamManagerConfig,
    state: AsyncMutex<State>,
    next_id: AtomicU64,
}

impl StreamManager {
    pub fn new(config: StreamManagerConfig) -> Self {
        Self {
            config,
            state: AsyncMutex::new(State {
                live: HashMap::new(),
                idle_order: VecDeque::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns an idle stream of `use_type`; if none is idle and
    /// `open_if_none` is set, calls `open_fn` to create one, evicting the
    /// least-recently-released idle stream first if the cap is reached and
    /// `autoFree` is enabled. Fails with [`Error::Exhausted`] when the cap
    /// is hit, `autoFree` is disabled (or no idle stream exists to evict),
    /// and no stream is free.
    pub async fn get_stream<F, Fut>(
        &self,
        use_type: UseType,
        open_if_none: bool,
        open_fn: Option<F>,
    ) -> Result<Stream>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BoxDuplex>>,
    {
        let mut state = self.state.lock().await;

        if let Some(pos) = state
            .idle_order
            .iter()
            .position(|id| state.live.get(id).map(|e| e.use_type) == Some(use_type))
        {
            let id = state.idle_order.remove(pos).expect("position just found");
            let io = state.live.get(&id).expect("live entry for idle id").io.clone();
            tracing::debug!(stream_id = id, ?use_type, "reusing idle stream");
            return Ok(Stream { id, use_type, io });
        }

        if state.live.len() >= self.config.num_streams_max {
            if !open_if_none || !self.config.auto_free {
                return Err(Error::exhausted(self.config.num_streams_max, use_type));
            }
            let evict_id = state
                .idle_order
                .pop_front()
                .ok_or_else(|| Error::exhausted(self.config.num_streams_max, use_type))?;
            if let Some(entry) = state.live.remove(&evict_id) {
                tracing::debug!(stream_id = evict_id, "evicting idle stream to make room");
                let mut guard = entry.io.lock().await;
                let _ = guard.shutdown().await;
            }
        } else if !open_if_none {
            return Err(Error::exhausted(self.config.num_streams_max, use_type));
        }

        let open_fn = open_fn.ok_or_else(|| Error::exhausted(self.config.num_streams_max, use_type))?;
        let io = open_fn().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let io = Arc::new(AsyncMutex::new(io));
        state.live.insert(
            id,
            LiveEntry {
                use_type,
                io: io.clone(),
            },
        );
        tracing::debug!(stream_id = id, ?use_type, "opened new stream");
        Ok(Stream { id, use_type, io })
    }

    /// Registers a stream accepted from the peer. Accepted streams are not
    /// placed on the idle list: they are driven by a dedicated reader task
    /// for their whole lifetime and are freed (not released) when that
    /// reader exits.
    pub async fn add_stream(&self, use_type: UseType, io: BoxDuplex) -> Stream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let io = Arc::new(AsyncMutex::new(io));
        let mut state = self.state.lock().await;
        state.live.insert(
            id,
            LiveEntry {
                use_type,
                io: io.clone(),
            },
        );
        Stream { id, use_type, io }
    }

    /// Registers a stream accepted from the peer as immediately idle, for
    /// use types with no dedicated reader task (raw `stream` duplexes are
    /// consumer-pull: nothing reads them until a caller acquires one via
    /// [`Self::get_stream`]).
    pub async fn add_idle_stream(&self, use_type: UseType, io: BoxDuplex) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let io = Arc::new(AsyncMutex::new(io));
        let mut state = self.state.lock().await;
        state.live.insert(id, LiveEntry { use_type, io });
        state.idle_order.push_back(id);
    }

    /// Returns `stream` to the idle list for reuse.
    pub async fn release_stream(&self, stream: &Stream) {
        let mut state = self.state.lock().await;
        if state.live.contains_key(&stream.id) {
            state.idle_order.push_back(stream.id);
        }
    }

    /// Removes and closes `stream` unconditionally.
    pub async fn free_stream(&self, stream: &Stream) {
        let mut state = self.state.lock().await;
        state.idle_order.retain(|id| *id != stream.id);
        if state.live.remove(&stream.id).is_some() {
            let mut guard = stream.io.lock().await;
            let _ = guard.shutdown().await;
        }
    }

    /// Closes every pooled stream, idle or checked out.
    pub async fn destroy(&self) {
        let mut state = self.state.lock().await;
        for (_, entry) in state.live.drain() {
            let mut guard = entry.io.lock().await;
            let _ = guard.shutdown().await;
        }
        state.idle_order.clear();
    }

    /// Number of streams currently pooled (idle and checked out).
    pub async fn live_count(&self) -> usize {
        self.state.lock().await.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn half() -> BoxDuplex {
        let (a, _b) = duplex(64);
        Box::new(a)
    }

    async fn open(mgr: &StreamManager, use_type: UseType, open_if_none: bool) -> Result<Stream> {
        mgr.get_stream(use_type, open_if_none, Some(|| async { Ok(half()) }))
            .await
    }

    #[tokio::test]
    async fn never_exceeds_cap_without_auto_free() {
        let mgr = StreamManager::new(StreamManagerConfig {
            num_streams_max: 2,
            auto_free: false,
        });
        let _s1 = open(&mgr, UseType::Message, true).await.unwrap();
        let _s2 = open(&mgr, UseType::Message, true).await.unwrap();
        let err = open(&mgr, UseType::Message, true).await.unwrap_err();
        assert!(matches!(err, Error::Exhausted { .. }));
        assert_eq!(mgr.live_count().await, 2);
    }

    #[tokio::test]
    async fn auto_free_reclaims_lru_idle_stream() {
        let mgr = StreamManager::new(StreamManagerConfig {
            num_streams_max: 2,
            auto_free: true,
        });
        let s1 = open(&mgr, UseType::Message, true).await.unwrap();
        let _s2 = open(&mgr, UseType::Message, true).await.unwrap();
        // s1 becomes idle; the pool is still at the cap, so a third
        // acquire must evict it rather than fail.
        mgr.release_stream(&s1).await;
        let s3 = open(&mgr, UseType::Message, true).await.unwrap();
        assert_ne!(s3.id, s1.id);
        assert_eq!(mgr.live_count().await, 2);
    }

    #[tokio::test]
    async fn idle_reuse_is_fifo_by_release_order() {
        let mgr = StreamManager::new(StreamManagerConfig {
            num_streams_max: 4,
            auto_free: false,
        });
        let s1 = open(&mgr, UseType::Message, true).await.unwrap();
        let s2 = open(&mgr, UseType::Message, true).await.unwrap();
        mgr.release_stream(&s1).await;
        mgr.release_stream(&s2).await;
        let reused = open(&mgr, UseType::Message, true).await.unwrap();
        assert_eq!(reused.id, s1.id, "least-recently-released stream is reused first");
    }

    #[tokio::test]
    async fn get_without_open_if_none_fails_when_idle_is_empty() {
        let mgr = StreamManager::new(StreamManagerConfig::default());
        let err = mgr
            .get_stream::<fn() -> std::future::Ready<Result<BoxDuplex>>, _>(UseType::Stream, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Exhausted { .. }));
    }

    #[tokio::test]
    async fn free_stream_removes_it_from_the_pool() {
        let mgr = StreamManager::new(StreamManagerConfig::default());
        let s1 = open(&mgr, UseType::Message, true).await.unwrap();
        mgr.free_stream(&s1).await;
        assert_eq!(mgr.live_count().await, 0);
    }

    #[derive(Debug, Clone, Copy)]
    enum StreamOp {
        Acquire,
        ReleaseOldestHeld,
    }

    fn stream_op() -> impl proptest::strategy::Strategy<Value = StreamOp> {
        proptest::prop_oneof![
            proptest::strategy::Just(StreamOp::Acquire),
            proptest::strategy::Just(StreamOp::ReleaseOldestHeld),
        ]
    }

    proptest::proptest! {
        /// Invariant 6: `live_count` never exceeds the configured cap, no
        /// matter how acquires and releases interleave.
        #[test]
        fn live_count_never_exceeds_the_cap(
            ops in proptest::collection::vec(stream_op(), 0..40),
            cap in 1usize..6,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let outcome: std::result::Result<(), proptest::test_runner::TestCaseError> = rt.block_on(async move {
                let mgr = StreamManager::new(StreamManagerConfig { num_streams_max: cap, auto_free: true });
                let mut held: Vec<Stream> = Vec::new();
                for op in ops {
                    match op {
                        StreamOp::Acquire => {
                            if let Ok(s) = open(&mgr, UseType::Message, true).await {
                                held.push(s);
                            }
                        }
                        StreamOp::ReleaseOldestHeld => {
                            if !held.is_empty() {
                                let s = held.remove(0);
                                mgr.release_stream(&s).await;
                            }
                        }
                    }
                    proptest::prop_assert!(mgr.live_count().await <= cap);
                }
                Ok(())
            });
            outcome?;
        }
    }
}
