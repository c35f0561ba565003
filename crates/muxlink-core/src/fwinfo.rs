//! Device information channel
//!
//! Signed writes bind to a specific device by embedding its serial number,
//! which the host fetches once per session over the firmware-info channel.
//! The binary schema on that channel belongs to the device firmware, so it
//! stays behind the [`InfoCodec`] capability: this crate only moves the
//! request and response bytes and hands them to the codec.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::transport::{Link, CHANNEL_FWINFO};
use crate::ProtocolError;

/// Identity data reported by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique device serial number, merged into signed writes as `sn`
    pub serial_number: String,
    /// Any further fields the firmware reports (version, hardware revision)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Encodes device-info requests and decodes the firmware's responses.
///
/// Injected so the firmware's schema (protobuf on real hardware) never leaks
/// into the protocol engine. `decode_response` sees every byte received so
/// far and returns `Ok(None)` while the response is still incomplete.
pub trait InfoCodec: Send {
    /// Bytes of one device-info request.
    fn encode_request(&self) -> Vec<u8>;

    /// Try to decode a response from the bytes accumulated so far.
    fn decode_response(&self, bytes: &[u8]) -> Result<Option<DeviceInfo>, ProtocolError>;
}

/// JSON codec, used by the simulator and by JSON-speaking firmware.
///
/// The request is an empty JSON object; the response is a JSON object with
/// at least a `serial_number` field.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonInfoCodec;

impl InfoCodec for JsonInfoCodec {
    fn encode_request(&self) -> Vec<u8> {
        b"{}".to_vec()
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<Option<DeviceInfo>, ProtocolError> {
        if bytes.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice::<DeviceInfo>(bytes) {
            Ok(info) => Ok(Some(info)),
            // Truncated JSON means more fragments are coming.
            Err(err) if err.is_eof() => Ok(None),
            Err(err) => Err(ProtocolError::InvalidResponse(format!(
                "bad device-info response: {}",
                err
            ))),
        }
    }
}

/// Drives one request/response exchange on the firmware-info channel.
pub struct FwInfoReader {
    codec: Box<dyn InfoCodec>,
    channel: u8,
}

impl FwInfoReader {
    /// Reader using the given codec on the standard firmware-info channel.
    pub fn new(codec: Box<dyn InfoCodec>) -> Self {
        Self {
            codec,
            channel: CHANNEL_FWINFO,
        }
    }

    /// Fetch the device's identity, blocking up to `timeout`.
    ///
    /// Sends one request and accumulates response fragments until the codec
    /// can decode them. The channel's inbox is reset first, so a stale
    /// partial response from an aborted exchange cannot leak in.
    pub fn fetch(&self, link: &mut Link, timeout: Duration) -> Result<DeviceInfo, ProtocolError> {
        link.attach_raw_channel(self.channel);
        link.send(self.channel, &self.codec.encode_request())?;

        let channel = self.channel;
        let info = link.poll_until(timeout, |link| {
            self.codec.decode_response(&link.raw_bytes(channel))
        })?;
        match info {
            Some(info) => {
                debug!(serial = %info.serial_number, "device info received");
                Ok(info)
            }
            None => Err(ProtocolError::Timeout { channel }),
        }
    }
}

impl std::fmt::Debug for FwInfoReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FwInfoReader")
            .field("channel", &format_args!("0x{:02X}", self.channel))
            .finish_non_exhaustive()
    }
}
