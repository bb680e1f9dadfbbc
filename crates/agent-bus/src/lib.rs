//! Local in-process bus envelope shared by the `viaduct` and `devicetwin`
//! crates.
//!
//! Neither crate depends on the other: `viaduct` hands decoded wire messages
//! up to whatever module registered a [`Message`] handler, and `devicetwin`
//! receives [`DTMessage`] values on its worker channel. Keeping the envelope
//! in its own crate avoids a dependency cycle and mirrors the teacher
//! workspace's habit of factoring a shared contract into its own small crate
//! rather than letting two siblings depend on each other directly.

mod message;

pub use message::{BaseMessage, DTMessage, Message, MessageHeader};
