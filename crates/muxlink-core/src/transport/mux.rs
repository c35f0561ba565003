//! Channel multiplexing
//!
//! Every SLIP frame carries exactly one channel packet: a one-byte channel
//! id followed by an opaque payload. The [`Router`] dispatches inbound
//! packets to per-channel handlers; unknown channels are dropped so new
//! firmware channels never break an older host.

use std::collections::HashMap;

use tracing::trace;

use crate::ProtocolError;

/// Channel carrying device information queries.
pub const CHANNEL_FWINFO: u8 = 0x12;
/// Channel carrying JSON settings documents.
pub const CHANNEL_SETTINGS: u8 = 0x13;

/// One channel packet: id byte plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Channel id (first byte on the wire)
    pub channel: u8,
    /// Payload bytes, possibly a fragment of a larger message
    pub payload: Vec<u8>,
}

impl Packet {
    /// Wrap a payload for a channel.
    pub fn new(channel: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Split a decoded frame into channel id and payload.
    ///
    /// A zero-length frame has no channel id and is rejected; a frame of a
    /// single byte is a valid packet with an empty payload.
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&channel, payload) = frame
            .split_first()
            .ok_or_else(|| ProtocolError::InvalidResponse("frame has no channel byte".into()))?;
        Ok(Self {
            channel,
            payload: payload.to_vec(),
        })
    }

    /// Serialize to the on-frame layout: channel byte, then payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.channel);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Receives the payloads of one channel.
pub trait ChannelHandler: Send {
    /// Called once per inbound packet, in arrival order.
    fn handle(&mut self, payload: &[u8]) -> Result<(), ProtocolError>;
}

impl<F> ChannelHandler for F
where
    F: FnMut(&[u8]) -> Result<(), ProtocolError> + Send,
{
    fn handle(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self(payload)
    }
}

/// Dispatch table from channel id to handler.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<u8, Box<dyn ChannelHandler>>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a channel, replacing any previous one.
    pub fn register(&mut self, channel: u8, handler: Box<dyn ChannelHandler>) {
        self.handlers.insert(channel, handler);
    }

    /// Remove the handler for a channel.
    pub fn unregister(&mut self, channel: u8) -> bool {
        self.handlers.remove(&channel).is_some()
    }

    /// True if a handler is registered for the channel.
    pub fn is_registered(&self, channel: u8) -> bool {
        self.handlers.contains_key(&channel)
    }

    /// Route one packet to its channel handler.
    ///
    /// Packets for unregistered channels are dropped silently (logged at
    /// trace level) so the device may speak channels this host ignores.
    pub fn route(&mut self, packet: &Packet) -> Result<(), ProtocolError> {
        match self.handlers.get_mut(&packet.channel) {
            Some(handler) => handler.handle(&packet.payload),
            None => {
                trace!(
                    channel = format_args!("0x{:02X}", packet.channel),
                    len = packet.payload.len(),
                    "dropping packet for unregistered channel"
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut channels: Vec<u8> = self.handlers.keys().copied().collect();
        channels.sort_unstable();
        f.debug_struct("Router").field("channels", &channels).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet::new(CHANNEL_SETTINGS, b"{\"a\":1}".to_vec());
        let parsed = Packet::parse(&packet.encode()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_parse_single_byte_frame_has_empty_payload() {
        let packet = Packet::parse(&[CHANNEL_FWINFO]).unwrap();
        assert_eq!(packet.channel, CHANNEL_FWINFO);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_parse_empty_frame_is_rejected() {
        assert!(matches!(
            Packet::parse(&[]),
            Err(ProtocolError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_route_delivers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut router = Router::new();
        router.register(
            0x21,
            Box::new(move |payload: &[u8]| {
                sink.lock().unwrap().push(payload.to_vec());
                Ok(())
            }),
        );

        router.route(&Packet::new(0x21, b"one".to_vec())).unwrap();
        router.route(&Packet::new(0x21, b"two".to_vec())).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_unknown_channel_is_dropped_without_error() {
        let mut router = Router::new();
        assert!(router.route(&Packet::new(0x7F, b"ignored".to_vec())).is_ok());
    }

    #[test]
    fn test_register_replaces_handler() {
        let first = Arc::new(Mutex::new(0usize));
        let second = Arc::new(Mutex::new(0usize));
        let mut router = Router::new();

        let count = Arc::clone(&first);
        router.register(
            0x21,
            Box::new(move |_: &[u8]| {
                *count.lock().unwrap() += 1;
                Ok(())
            }),
        );
        let count = Arc::clone(&second);
        router.register(
            0x21,
            Box::new(move |_: &[u8]| {
                *count.lock().unwrap() += 1;
                Ok(())
            }),
        );

        router.route(&Packet::new(0x21, Vec::new())).unwrap();
        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);
    }

    #[test]
    fn test_unregister() {
        let mut router = Router::new();
        router.register(0x21, Box::new(|_: &[u8]| Ok(())));
        assert!(router.is_registered(0x21));
        assert!(router.unregister(0x21));
        assert!(!router.is_registered(0x21));
        assert!(!router.unregister(0x21));
    }
}
