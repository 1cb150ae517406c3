//! TL runtime for the courier MTProto stack.
//!
//! | Module        | Contents                                                  |
//! |---------------|-----------------------------------------------------------|
//! | [`serialize`] | The [`Serializable`] trait and primitive impls            |
//! | [`deserialize`] | The [`Deserializable`] trait and the [`Cursor`] buffer  |
//! | [`service`]   | Hand-written MTProto service-layer constructors           |
//!
//! Unlike a full API-layer binding, this crate carries only the closed set of
//! service constructors the protocol state machine itself has to understand
//! (acks, salts, containers, notifications, and the few service RPCs). API
//! schema objects are opaque here: requests arrive already serialized and
//! responses leave as raw bytes for the caller to decode.

#![deny(unsafe_code)]

pub mod deserialize;
pub mod serialize;
pub mod service;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// Every TL type has a unique 32-bit constructor ID.
pub trait Identifiable {
    /// The constructor ID as specified in the TL schema.
    const CONSTRUCTOR_ID: u32;
}

/// Marks a function type that can be sent as an RPC call.
///
/// `Return` is the type the server will respond with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}
