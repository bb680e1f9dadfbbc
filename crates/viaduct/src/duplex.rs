//! The one trait that makes the connection layer transport-agnostic: any
//! half-duplex byte stream the wire framing in [`crate::lane`] can read
//! and write. `viaduct::quic` is the only module that builds one today
//! (joining a `quinn::RecvStream`/`SendStream` pair), but nothing above
//! the stream pool or the Mux knows that.

use tokio::io::{AsyncRead, AsyncWrite};

pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Duplex for T {}

pub type BoxDuplex = Box<dyn Duplex>;
