//! Framed Transport Layer
//!
//! Implements the byte-stream side of the device protocol: SLIP framing,
//! one-byte channel multiplexing, and per-channel reassembly of fragmented
//! JSON documents.
//!
//! Layering is strict. Framing knows nothing about channels, channels know
//! nothing about payload schemas, and reassembly never sees frame bytes.

pub mod link;
pub mod mux;
pub mod reassembly;
pub mod serial;
pub mod slip;
mod stream;

pub use link::{Link, LinkConfig, LinkCounters};
pub use mux::{ChannelHandler, Packet, Router, CHANNEL_FWINFO, CHANNEL_SETTINGS};
pub use reassembly::Reassembler;
pub use serial::{list_ports, open_port, PortInfo};
pub use stream::{SerialTransport, TcpTransport, Transport};

/// Default baud rate for device communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Maximum decoded frame size; larger frames are discarded
pub const MAX_FRAME_SIZE: usize = 8192;

/// Maximum unparsed bytes buffered per channel during reassembly
pub const MAX_REASSEMBLY_SIZE: usize = 65536;
