//! Error taxonomy for the Viaduct connection layer.
//!
//! Grounded on `spark-switch::error::SwitchError`: a flat `thiserror` enum
//! with field-carrying variants, one variant per failure class named in the
//! spec (`transport`, `decode`, `timeout`, `conflict`, `exhausted`,
//! `closed`), plus a couple of context-enrichment helpers rather than a
//! generic `CoreError` builder — this workspace does not need
//! `spark-core`'s cross-layer error bus, only a stable, loggable enum.

use thiserror::Error;

/// Errors surfaced by Lane I/O, the stream pool, the sync keeper, the
/// message FIFO, and the QUIC connection driver.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure on the underlying byte stream (read, write, or accept).
    #[error("transport error during {context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A frame could not be decoded into a well-formed message.
    #[error("failed to decode frame during {context}: {reason}")]
    Decode {
        context: &'static str,
        reason: String,
    },

    /// A deadline (read, write, or sync-wait) elapsed before completion.
    #[error("operation timed out during {context}")]
    Timeout { context: &'static str },

    /// A programmer error: e.g. a second `WaitResponse` registered for an
    /// id that already has a pending waiter.
    #[error("conflicting operation during {context}: {reason}")]
    Conflict {
        context: &'static str,
        reason: String,
    },

    /// The stream pool is at `NumStreamsMax` and `autoFree` is disabled, or
    /// no idle stream of the requested use type is free to reclaim.
    #[error("stream pool exhausted (cap={cap}, use_type={use_type:?})")]
    Exhausted { cap: usize, use_type: crate::api::UseType },

    /// The connection, stream, or FIFO has already been closed.
    #[error("{context} is closed")]
    Closed { context: &'static str },
}

impl Error {
    pub(crate) fn transport(context: &'static str, source: std::io::Error) -> Self {
        Error::Transport { context, source }
    }

    pub(crate) fn decode(context: &'static str, reason: impl Into<String>) -> Self {
        Error::Decode {
            context,
            reason: reason.into(),
        }
    }

    pub(crate) fn timeout(context: &'static str) -> Self {
        Error::Timeout { context }
    }

    pub(crate) fn conflict(context: &'static str, reason: impl Into<String>) -> Self {
        Error::Conflict {
            context,
            reason: reason.into(),
        }
    }

    pub(crate) fn exhausted(cap: usize, use_type: crate::api::UseType) -> Self {
        Error::Exhausted { cap, use_type }
    }

    pub(crate) fn closed(context: &'static str) -> Self {
        Error::Closed { context }
    }

    /// True for errors that should terminate only the stream/reader they
    /// occurred on, as opposed to the whole connection. Mirrors the
    /// "transport errors on a data stream free the stream and terminate the
    /// reader for that stream only" policy in spec §7.
    pub fn is_stream_local(&self) -> bool {
        matches!(self, Error::Decode { .. } | Error::Closed { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
