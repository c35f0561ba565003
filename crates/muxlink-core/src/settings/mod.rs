//! Authenticated Settings Protocol
//!
//! Key/value configuration documents exchanged with the device over the
//! settings channel, the access-control vectors and key slots that guard
//! them, and the lock/provision/write session flow built on top.

pub mod acl;
pub mod document;
pub mod session;
pub mod signer;

pub use acl::AclVector;
pub use document::SettingsDocument;
pub use session::{LockState, Session, SessionConfig};
pub use signer::{AuthKey, CcmSeal, Seal, SignedPacket, Signer};

/// Number of authentication key slots the device provides
pub const KEY_SLOTS: u8 = 3;

/// Settings path holding a slot's authentication key
pub fn key_slot_path(slot: u8) -> String {
    format!("settings/key_{}", slot)
}

/// Settings path holding a slot's access vector
pub fn acl_slot_path(slot: u8) -> String {
    format!("settings/acl_{}", slot)
}
