//! Adapts `quinn`'s split `SendStream`/`RecvStream` pair into the single
//! `AsyncRead + AsyncWrite` duplex the rest of the crate works with, and
//! tags each newly opened stream with its [`UseType`] via a one-byte
//! handshake, per spec §6.
//!
//! Grounded on `original_source/pkg/viaduct/pkg/conn/quic.go`'s
//! `openStreamSync`/`acceptStream`, and on
//! `spark-transport-quic::channel::QuicChannel` for the idiom of wrapping
//! `quinn` primitives behind deadline-aware async methods.

use quinn::Connection;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::api::UseType;
use crate::duplex::BoxDuplex;
use crate::error::{Error, Result};

const CONTEXT_OPEN: &str = "quic.open_stream";
const CONTEXT_ACCEPT: &str = "quic.accept_stream";

/// Opens a new bidirectional stream on `connection`, writes the one-byte
/// `UseType` tag, and returns the joined duplex ready for framed or raw
/// I/O.
pub async fn open_stream(connection: &Connection, use_type: UseType) -> Result<BoxDuplex> {
    let (mut send, recv) = connection
        .open_bi()
        .await
        .map_err(|err| Error::transport(CONTEXT_OPEN, std::io::Error::other(err)))?;
    send.write_u8(use_type.to_wire_byte())
        .await
        .map_err(|err| Error::transport(CONTEXT_OPEN, err))?;
    Ok(Box::new(tokio::io::join(recv, send)))
}

/// Accepts the next bidirectional stream opened by the peer, reads its
/// `UseType` tag, and returns it alongside the joined duplex.
pub async fn accept_stream(connection: &Connection) -> Result<(UseType, BoxDuplex)> {
    let (send, mut recv) = connection
        .accept_bi()
        .await
        .map_err(|err| Error::transport(CONTEXT_ACCEPT, std::io::Error::other(err)))?;
    let mut tag = [0u8; 1];
    recv.read_exact(&mut tag)
        .await
        .map_err(|err| Error::transport(CONTEXT_ACCEPT, err))?;
    let use_type = UseType::from_wire_byte(tag[0])
        .ok_or_else(|| Error::decode(CONTEXT_ACCEPT, format!("unknown use-type byte {}", tag[0])))?;
    Ok((use_type, Box::new(tokio::io::join(recv, send))))
}
