//! Transport-agnostic connection and message-multiplexing layer. QUIC
//! (via `quinn`) is the only transport wired up today; the stream pool and
//! the message router only depend on [`duplex::Duplex`], so another
//! transport can be added without touching either.
//!
//! See `connection::QuicConnection` for the entry point: `serve` spins up
//! the control lane and the accept loop, and `write_message_sync` /
//! `write_message_async` / `read_message` / `read` / `write` are the
//! operations a caller drives it with.

pub mod api;
pub mod connection;
pub mod duplex;
pub mod error;
pub mod fifo;
pub mod lane;
pub mod mux;
pub mod quic;
pub mod stream_manager;
pub mod sync_keeper;

pub use api::{ConnState, ConnectionState, UseType};
pub use connection::{NoopTransportErrorHook, QuicConnection, QuicConnectionConfig, TransportErrorHook};
pub use error::{Error, Result};
pub use fifo::MessageFifo;
pub use lane::Lane;
pub use mux::{Handler, MessageRequest, Mux, ResponseWriter};
pub use stream_manager::{Stream, StreamManager, StreamManagerConfig};
pub use sync_keeper::SyncKeeper;
