//! # MuxLink Core Library
//!
//! Host-side transport and configuration protocol engine for embedded
//! devices reached over an unreliable byte-stream serial link.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - SLIP framing over raw serial bytes
//! - One-byte channel multiplexing of independent device services
//! - Per-channel reassembly of JSON documents split across frames
//! - 256-bit access-control vectors and device key slots
//! - AES-CCM signed settings packets for locked devices
//! - The lock/provision/write/verify configuration session
//!
//! ## Example
//!
//! ```rust,ignore
//! use muxlink_core::prelude::*;
//! use muxlink_core::transport::serial::open_port;
//!
//! let port = open_port("/dev/ttyACM0", None)?;
//! let transport = SerialTransport::new(port);
//! let mut session = Session::connect(
//!     Box::new(transport),
//!     SessionConfig::default(),
//!     Box::new(JsonInfoCodec),
//! )?;
//!
//! let doc = SettingsDocument::new().with("app/brightness", 25);
//! session.write(doc.clone(), true)?;
//! session.verify(&doc)?;
//! ```

pub mod error;
pub mod fwinfo;
pub mod settings;
pub mod sim;
pub mod transport;

pub use error::{Mismatch, ProtocolError};

/// Library version, from Cargo metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Mismatch, ProtocolError};
    pub use crate::fwinfo::{DeviceInfo, FwInfoReader, InfoCodec, JsonInfoCodec};
    pub use crate::settings::{
        AclVector, AuthKey, LockState, Session, SessionConfig, SettingsDocument, SignedPacket,
        Signer,
    };
    pub use crate::transport::{
        Link, LinkConfig, SerialTransport, TcpTransport, Transport, CHANNEL_FWINFO,
        CHANNEL_SETTINGS, DEFAULT_BAUD_RATE,
    };
}
