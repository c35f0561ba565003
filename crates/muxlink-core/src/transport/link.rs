//! Framed link over a byte transport
//!
//! A [`Link`] owns the transport and drives the receive pipeline
//! synchronously: raw bytes are SLIP-decoded, split into channel packets,
//! and routed to per-channel sinks. Callers pump the link while waiting for
//! a response; there is no reader thread.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::mux::{ChannelHandler, Packet, Router};
use super::reassembly::Reassembler;
use super::slip;
use super::stream::Transport;
use crate::ProtocolError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tuning knobs for the blocking receive loop.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How long to wait for a response document before giving up
    pub response_timeout: Duration,
    /// Sleep between polls while the transport has nothing to read
    pub poll_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// Byte and frame counters for a link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounters {
    /// Payload bytes handed to the transport
    pub bytes_sent: u64,
    /// Raw bytes consumed from the transport
    pub bytes_received: u64,
    /// Frames written
    pub frames_sent: u64,
    /// Frames decoded
    pub frames_received: u64,
    /// Frames discarded by the decoder or dropped while parsing
    pub framing_errors: u64,
}

/// A framed, multiplexed connection to one device.
pub struct Link {
    transport: Box<dyn Transport>,
    decoder: slip::Decoder,
    router: Router,
    reassembler: Arc<Mutex<Reassembler>>,
    raw_inboxes: HashMap<u8, Arc<Mutex<Vec<u8>>>>,
    config: LinkConfig,
    counters: LinkCounters,
}

impl Link {
    /// Build a link over an open transport.
    pub fn new(mut transport: Box<dyn Transport>, config: LinkConfig) -> Result<Self, ProtocolError> {
        transport.set_timeout(Duration::from_millis(100))?;
        Ok(Self {
            transport,
            decoder: slip::Decoder::new(),
            router: Router::new(),
            reassembler: Arc::new(Mutex::new(Reassembler::new())),
            raw_inboxes: HashMap::new(),
            config,
            counters: LinkCounters::default(),
        })
    }

    /// The link's timing configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Snapshot of the traffic counters.
    pub fn counters(&self) -> LinkCounters {
        self.counters
    }

    /// Route a channel's packets into the JSON reassembler.
    pub fn attach_json_channel(&mut self, channel: u8) {
        let reassembler = Arc::clone(&self.reassembler);
        self.router.register(
            channel,
            Box::new(move |payload: &[u8]| {
                lock(&reassembler).feed(channel, payload)?;
                Ok(())
            }),
        );
    }

    /// Accumulate a channel's packets as raw bytes (opaque schemas).
    pub fn attach_raw_channel(&mut self, channel: u8) {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        self.raw_inboxes.insert(channel, Arc::clone(&inbox));
        self.router.register(
            channel,
            Box::new(move |payload: &[u8]| {
                lock(&inbox).extend_from_slice(payload);
                Ok(())
            }),
        );
    }

    /// Register a custom handler for a channel.
    pub fn attach_handler(&mut self, channel: u8, handler: Box<dyn ChannelHandler>) {
        self.router.register(channel, handler);
    }

    /// Send one payload on a channel as a single frame.
    pub fn send(&mut self, channel: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = slip::encode(&Packet::new(channel, payload).encode());
        self.transport.write_all(&frame)?;
        self.transport.flush()?;
        self.counters.bytes_sent += frame.len() as u64;
        self.counters.frames_sent += 1;
        trace!(
            channel = format_args!("0x{:02X}", channel),
            len = payload.len(),
            "sent frame"
        );
        Ok(())
    }

    /// Read whatever the transport has buffered and run it through the
    /// receive pipeline. Returns whether any bytes were consumed.
    ///
    /// Framing and payload errors are logged and counted, never fatal: the
    /// decoder resynchronizes on the next frame boundary and the link keeps
    /// running. Only transport failures propagate.
    pub fn pump_once(&mut self) -> Result<bool, ProtocolError> {
        let available = self.transport.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(false);
        }

        let mut buf = [0u8; 512];
        let want = available.min(buf.len());
        let n = match self.transport.read(&mut buf[..want]) {
            Ok(0) => return Ok(false),
            Ok(n) => n,
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                return Ok(false)
            }
            Err(e) => return Err(e.into()),
        };
        self.counters.bytes_received += n as u64;

        for &byte in &buf[..n] {
            match self.decoder.push(byte) {
                Ok(Some(frame)) => {
                    self.counters.frames_received += 1;
                    self.dispatch(&frame);
                }
                Ok(None) => {}
                Err(err) => {
                    self.counters.framing_errors += 1;
                    warn!("framing error, discarding frame: {}", err);
                }
            }
        }
        Ok(true)
    }

    fn dispatch(&mut self, frame: &[u8]) {
        let packet = match Packet::parse(frame) {
            Ok(packet) => packet,
            Err(err) => {
                self.counters.framing_errors += 1;
                warn!("dropping frame: {}", err);
                return;
            }
        };
        if let Err(err) = self.router.route(&packet) {
            // A poisoned payload desyncs its channel; the next complete
            // document resynchronizes it.
            self.counters.framing_errors += 1;
            warn!(
                channel = format_args!("0x{:02X}", packet.channel),
                "payload error: {}", err
            );
        }
    }

    /// Pump the link until `ready` yields a value or `timeout` elapses.
    ///
    /// `ready` runs after every pump pass; returning `Ok(None)` means keep
    /// waiting. `Ok(None)` from this method means the deadline passed, so
    /// callers can attach their own timeout context.
    pub fn poll_until<T>(
        &mut self,
        timeout: Duration,
        mut ready: impl FnMut(&mut Self) -> Result<Option<T>, ProtocolError>,
    ) -> Result<Option<T>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            let progressed = self.pump_once()?;
            if let Some(value) = ready(self)? {
                return Ok(Some(value));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if !progressed {
                std::thread::sleep(self.config.poll_interval);
            }
        }
    }

    /// Pop a completed document for a channel, if one is queued.
    pub fn take_document(&mut self, channel: u8) -> Option<Value> {
        lock(&self.reassembler).take_document(channel)
    }

    /// Wait for the next complete document on a channel.
    pub fn await_document(
        &mut self,
        channel: u8,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        let value = self.poll_until(timeout, |link| Ok(link.take_document(channel)))?;
        match value {
            Some(doc) => {
                debug!(
                    channel = format_args!("0x{:02X}", channel),
                    "received document"
                );
                Ok(doc)
            }
            None => Err(ProtocolError::Timeout { channel }),
        }
    }

    /// Current raw bytes accumulated for a channel.
    pub fn raw_bytes(&self, channel: u8) -> Vec<u8> {
        self.raw_inboxes
            .get(&channel)
            .map(|inbox| lock(inbox).clone())
            .unwrap_or_default()
    }

    /// Drop the raw bytes accumulated for a channel.
    pub fn clear_raw(&mut self, channel: u8) {
        if let Some(inbox) = self.raw_inboxes.get(&channel) {
            lock(inbox).clear();
        }
    }

    /// Drop all partial receive state and any unread transport bytes.
    ///
    /// Used after reconnecting, when the stream may resume mid-frame.
    pub fn reset_streams(&mut self) -> Result<(), ProtocolError> {
        self.transport.clear_input()?;
        self.decoder.reset();
        lock(&self.reassembler).clear_all();
        for inbox in self.raw_inboxes.values() {
            lock(inbox).clear();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("router", &self.router)
            .field("counters", &self.counters)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mux::CHANNEL_SETTINGS;
    use serde_json::json;
    use std::collections::VecDeque;

    /// In-memory transport: inbound bytes are scripted, outbound captured.
    struct ScriptedTransport {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                rx: VecDeque::new(),
                tx: Vec::new(),
            }
        }

        fn queue(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes);
        }
    }

    impl Read for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl Write for ScriptedTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for ScriptedTransport {
        fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn clear_input(&mut self) -> io::Result<()> {
            self.rx.clear();
            Ok(())
        }

        fn clear_output(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok(self.rx.len() as u32)
        }
    }

    fn link_with(script: impl FnOnce(&mut ScriptedTransport)) -> Link {
        let mut transport = ScriptedTransport::new();
        script(&mut transport);
        let config = LinkConfig {
            response_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
        };
        Link::new(Box::new(transport), config).unwrap()
    }

    fn settings_frame(payload: &[u8]) -> Vec<u8> {
        slip::encode(&Packet::new(CHANNEL_SETTINGS, payload).encode())
    }

    #[test]
    fn test_send_writes_one_slip_frame() {
        let mut link = link_with(|_| {});
        link.send(CHANNEL_SETTINGS, br#"{"a":1}"#).unwrap();
        assert_eq!(link.counters().frames_sent, 1);
        assert!(link.counters().bytes_sent > 0);
    }

    #[test]
    fn test_document_reassembled_across_frames() {
        let mut link = link_with(|t| {
            t.queue(&settings_frame(br#"{"app/bright"#));
            t.queue(&settings_frame(br#"ness":25}"#));
        });
        link.attach_json_channel(CHANNEL_SETTINGS);

        let doc = link
            .await_document(CHANNEL_SETTINGS, Duration::from_millis(50))
            .unwrap();
        assert_eq!(doc, json!({"app/brightness": 25}));
        assert_eq!(link.counters().frames_received, 2);
    }

    #[test]
    fn test_await_document_times_out() {
        let mut link = link_with(|t| {
            t.queue(&settings_frame(br#"{"never":"#));
        });
        link.attach_json_channel(CHANNEL_SETTINGS);

        let err = link
            .await_document(CHANNEL_SETTINGS, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Timeout { channel: CHANNEL_SETTINGS }
        ));
    }

    #[test]
    fn test_framing_error_is_counted_and_survived() {
        let mut link = link_with(|t| {
            // Bad escape, then garbage, then a clean frame
            t.queue(&[0x41, slip::ESC, 0x99, 0x42, slip::END]);
            t.queue(&settings_frame(br#"{"ok":true}"#));
        });
        link.attach_json_channel(CHANNEL_SETTINGS);

        let doc = link
            .await_document(CHANNEL_SETTINGS, Duration::from_millis(50))
            .unwrap();
        assert_eq!(doc, json!({"ok": true}));
        assert_eq!(link.counters().framing_errors, 1);
    }

    #[test]
    fn test_malformed_payload_desyncs_channel_only() {
        let mut link = link_with(|t| {
            t.queue(&settings_frame(b"}{bad"));
            t.queue(&settings_frame(br#"{"fresh":1}"#));
        });
        link.attach_json_channel(CHANNEL_SETTINGS);

        let doc = link
            .await_document(CHANNEL_SETTINGS, Duration::from_millis(50))
            .unwrap();
        assert_eq!(doc, json!({"fresh": 1}));
        assert_eq!(link.counters().framing_errors, 1);
    }

    #[test]
    fn test_raw_channel_accumulates_fragments() {
        let mut link = link_with(|t| {
            t.queue(&slip::encode(&Packet::new(0x12, b"\x01\x02".to_vec()).encode()));
            t.queue(&slip::encode(&Packet::new(0x12, b"\x03".to_vec()).encode()));
        });
        link.attach_raw_channel(0x12);

        link.poll_until(Duration::from_millis(50), |l| {
            Ok((l.raw_bytes(0x12).len() >= 3).then_some(()))
        })
        .unwrap()
        .unwrap();
        assert_eq!(link.raw_bytes(0x12), vec![1, 2, 3]);

        link.clear_raw(0x12);
        assert!(link.raw_bytes(0x12).is_empty());
    }

    #[test]
    fn test_unregistered_channel_traffic_is_ignored() {
        let mut link = link_with(|t| {
            t.queue(&slip::encode(&Packet::new(0x7E, b"noise".to_vec()).encode()));
            t.queue(&settings_frame(br#"{"v":1}"#));
        });
        link.attach_json_channel(CHANNEL_SETTINGS);

        let doc = link
            .await_document(CHANNEL_SETTINGS, Duration::from_millis(50))
            .unwrap();
        assert_eq!(doc, json!({"v": 1}));
        assert_eq!(link.counters().frames_received, 2);
        assert_eq!(link.counters().framing_errors, 0);
    }

    #[test]
    fn test_reset_streams_drops_partial_state() {
        let mut link = link_with(|t| {
            t.queue(&settings_frame(br#"{"half":"#));
        });
        link.attach_json_channel(CHANNEL_SETTINGS);
        link.pump_once().unwrap();
        link.reset_streams().unwrap();

        // The half document is gone, so nothing ever completes.
        let err = link
            .await_document(CHANNEL_SETTINGS, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { .. }));
    }
}
