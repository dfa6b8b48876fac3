//! Implementation of the Attribute Protocol (ATT).
//!
//! ATT always runs over L2CAP channel `0x0004`, which is connected by default as soon as the
//! Link-Layer connection is established.
//!
//! ATT is used by GATT, the *Generic Attribute Profile*, which introduces the concept of
//! *Services* and *Characteristics* which can all be accessed and discovered over the Attribute
//! Protocol. This stack only ever plays the Central/Client role: it discovers just enough of the
//! peer's attribute table to classify it, then reads and writes a couple of known characteristics.
//! [`client`] holds the client state machine; everything else in this module is shared PDU/wire
//! plumbing.

pub mod client;
mod handle;
mod pdus;
mod uuid;

pub use self::client::{AttClient, ClientEvent, HandleSet, PeerClass};
pub use self::handle::{AttHandle, RawHandleRange};
pub use self::pdus::{AttError, AttPdu, ErrorCode, Opcode};
pub use self::uuid::AttUuid;
