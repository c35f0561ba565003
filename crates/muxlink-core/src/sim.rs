//! Simulated device
//!
//! An in-process device double implementing [`Transport`], protocol-accurate
//! enough to exercise the whole stack without hardware: it SLIP-decodes
//! inbound frames, keeps a running and a saved settings store, enforces the
//! lock (plain writes to a locked device are silently ignored, exactly the
//! rejection behavior real firmware shows), checks the CCM tag and serial
//! number of signed packets, answers device-info requests, and survives a
//! simulated restart.
//!
//! Responses can be fragmented into multiple frames, with fixed or seeded
//! random chunk sizes, to exercise reassembly on the host side.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::settings::document::is_write_only;
use crate::settings::signer::{AuthKey, CcmSeal, Seal, SignedPacket, NONCE_LEN};
use crate::settings::KEY_SLOTS;
use crate::transport::{slip, Packet, Reassembler, Transport, CHANNEL_FWINFO, CHANNEL_SETTINGS};

/// How the simulator splits a response across frames.
#[derive(Debug, Clone)]
pub enum Fragmentation {
    /// One frame per response
    Whole,
    /// Fixed chunk size in bytes
    Fixed(usize),
    /// Seeded random chunk sizes in `1..=max`
    Random { seed: u64, max: usize },
}

/// Simulator tuning.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Serial number reported on the firmware-info channel
    pub serial_number: String,
    /// Response fragmentation strategy
    pub fragment: Fragmentation,
    /// Channel on which a restart request is accepted
    pub restart_channel: u8,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            serial_number: "SIM-0001".to_string(),
            fragment: Fragmentation::Whole,
            restart_channel: 0x14,
        }
    }
}

struct SimState {
    config: SimConfig,
    /// Settings currently in effect
    running: Map<String, Value>,
    /// Settings persisted by `save`; restored on restart
    saved: Map<String, Value>,
    keys: HashMap<u8, AuthKey>,
    decoder: slip::Decoder,
    reassembler: Reassembler,
    /// Device-to-host bytes, already framed
    outbox: VecDeque<u8>,
    /// Bumped on restart; stale transport handles turn into broken pipes
    generation: u64,
    rng: Option<StdRng>,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        let rng = match config.fragment {
            Fragmentation::Random { seed, .. } => Some(StdRng::seed_from_u64(seed)),
            _ => None,
        };
        Self {
            config,
            running: Map::new(),
            saved: Map::new(),
            keys: HashMap::new(),
            decoder: slip::Decoder::new(),
            reassembler: Reassembler::new(),
            outbox: VecDeque::new(),
            generation: 0,
            rng,
        }
    }

    fn locked(&self) -> bool {
        self.running.get("settings/lock") == Some(&Value::Bool(true))
    }

    fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match self.decoder.push(byte) {
                Ok(Some(frame)) => self.handle_frame(&frame),
                Ok(None) => {}
                Err(err) => warn!("sim: discarding frame: {}", err),
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let packet = match Packet::parse(frame) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("sim: dropping frame: {}", err);
                return;
            }
        };
        if packet.channel == self.config.restart_channel {
            self.restart();
            return;
        }
        match packet.channel {
            CHANNEL_SETTINGS | CHANNEL_FWINFO => {
                if let Err(err) = self.reassembler.feed(packet.channel, &packet.payload) {
                    warn!("sim: bad payload: {}", err);
                }
                while let Some(document) = self.reassembler.take_document(packet.channel) {
                    match packet.channel {
                        CHANNEL_SETTINGS => self.handle_settings(document),
                        _ => self.respond_device_info(),
                    }
                }
            }
            other => trace!(channel = format_args!("0x{:02X}", other), "sim: ignoring"),
        }
    }

    fn handle_settings(&mut self, document: Value) {
        let object = match document {
            Value::Object(object) => object,
            other => {
                warn!("sim: non-object settings payload: {}", other);
                return;
            }
        };

        if object.is_empty() {
            self.respond_settings();
            return;
        }
        if object.contains_key("cnt") && object.contains_key("sig") {
            self.handle_signed(object);
            return;
        }
        if self.locked() {
            // Real firmware drops unsigned writes without an error packet.
            warn!("sim: plain write to locked device ignored");
            return;
        }
        self.apply(object);
    }

    fn handle_signed(&mut self, object: Map<String, Value>) {
        let packet: SignedPacket = match serde_json::from_value(Value::Object(object)) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("sim: malformed signed packet: {}", err);
                return;
            }
        };
        let authentic = self.keys.values().any(|key| {
            CcmSeal
                .seal(key, &[0u8; NONCE_LEN], packet.cnt.as_bytes())
                .map(|tag| BASE64.encode(tag) == packet.sig)
                .unwrap_or(false)
        });
        if !authentic {
            warn!("sim: signature did not match any stored key");
            return;
        }

        let content = match packet.content() {
            Ok(content) => content,
            Err(err) => {
                warn!("sim: signed content undecodable: {}", err);
                return;
            }
        };
        if content.get("sn") != Some(&Value::String(self.config.serial_number.clone())) {
            warn!("sim: signed packet bound to a different device");
            return;
        }
        self.apply(content.0);
    }

    fn apply(&mut self, object: Map<String, Value>) {
        let mut save = false;
        for (path, value) in object {
            match path.as_str() {
                "save" => save = value == Value::Bool(true),
                // Factory reset is not modeled
                "reset" => {}
                "sn" => {}
                "settings/lock" => {
                    if value == Value::Bool(true) && self.keys.is_empty() {
                        warn!("sim: refusing to lock with no stored key");
                    } else {
                        self.running.insert(path, value);
                    }
                }
                p if p.starts_with("settings/key_") => self.store_key(p, &value),
                _ => {
                    self.running.insert(path, value);
                }
            }
        }
        if save {
            self.saved = self.running.clone();
            debug!("sim: settings saved");
        }
    }

    fn store_key(&mut self, path: &str, value: &Value) {
        let slot = path
            .strip_prefix("settings/key_")
            .and_then(|s| s.parse::<u8>().ok())
            .filter(|slot| *slot < KEY_SLOTS);
        let key = value
            .as_str()
            .and_then(|encoded| AuthKey::from_base64(encoded).ok());
        match (slot, key) {
            (Some(slot), Some(key)) => {
                self.keys.insert(slot, key);
                debug!(slot, "sim: key stored");
            }
            _ => warn!("sim: bad key write to {}", path),
        }
    }

    fn respond_settings(&mut self) {
        let visible: Map<String, Value> = self
            .running
            .iter()
            .filter(|(path, _)| !is_write_only(path))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect();
        let bytes = Value::Object(visible).to_string().into_bytes();
        self.emit(CHANNEL_SETTINGS, &bytes);
    }

    fn respond_device_info(&mut self) {
        let info = serde_json::json!({ "serial_number": self.config.serial_number });
        let bytes = info.to_string().into_bytes();
        self.emit(CHANNEL_FWINFO, &bytes);
    }

    /// Frame a response, splitting it per the fragmentation strategy.
    fn emit(&mut self, channel: u8, payload: &[u8]) {
        let mut rest = payload;
        while !rest.is_empty() {
            let chunk_len = match self.config.fragment {
                Fragmentation::Whole => rest.len(),
                Fragmentation::Fixed(size) => size.max(1).min(rest.len()),
                Fragmentation::Random { max, .. } => {
                    let max = max.max(1).min(rest.len());
                    match &mut self.rng {
                        Some(rng) => rng.gen_range(1..=max),
                        None => max,
                    }
                }
            };
            let (chunk, tail) = rest.split_at(chunk_len);
            let frame = slip::encode(&Packet::new(channel, chunk).encode());
            self.outbox.extend(frame);
            rest = tail;
        }
    }

    fn restart(&mut self) {
        debug!("sim: restarting");
        self.generation += 1;
        self.running = self.saved.clone();
        self.decoder.reset();
        self.reassembler.clear_all();
        self.outbox.clear();
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The simulated device. Clone-free: hand out transports with
/// [`transport`](Self::transport), inspect state through the accessors.
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// Create a device with empty settings and no stored keys.
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    /// Open a transport to the device.
    ///
    /// Valid until the next restart; afterwards its reads and writes fail
    /// like a vanished serial port, and a fresh transport must be opened.
    pub fn transport(&self) -> SimTransport {
        let state = lock(&self.state);
        SimTransport {
            state: Arc::clone(&self.state),
            generation: state.generation,
        }
    }

    /// True once `settings/lock` is in effect.
    pub fn is_locked(&self) -> bool {
        lock(&self.state).locked()
    }

    /// Number of key slots holding a key.
    pub fn stored_keys(&self) -> usize {
        lock(&self.state).keys.len()
    }

    /// Current running value at a path.
    pub fn value(&self, path: &str) -> Option<Value> {
        lock(&self.state).running.get(path).cloned()
    }

    /// Overwrite a running value behind the protocol's back, to provoke
    /// verification mismatches in tests.
    pub fn force_value(&self, path: &str, value: Value) {
        lock(&self.state).running.insert(path.to_string(), value);
    }

    /// Pre-install a key, as if stored in an earlier session.
    pub fn install_key(&self, slot: u8, key: AuthKey) {
        lock(&self.state).keys.insert(slot, key);
    }

    /// Put the device into the locked state directly, persisted.
    pub fn set_locked(&self) {
        let mut state = lock(&self.state);
        state.running.insert("settings/lock".into(), Value::Bool(true));
        state.saved = state.running.clone();
    }
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SimDevice")
            .field("serial", &state.config.serial_number)
            .field("locked", &state.locked())
            .field("keys", &state.keys.len())
            .finish()
    }
}

/// One open connection to a [`SimDevice`].
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
    generation: u64,
}

impl SimTransport {
    fn stale(&self, state: &SimState) -> bool {
        state.generation != self.generation
    }
}

impl Read for SimTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if self.stale(&state) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device restarted"));
        }
        if state.outbox.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let mut n = 0;
        while n < buf.len() {
            match state.outbox.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for SimTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if self.stale(&state) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device restarted"));
        }
        state.feed(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for SimTransport {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        if !self.stale(&state) {
            state.outbox.clear();
        }
        Ok(())
    }

    fn clear_output(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        let state = lock(&self.state);
        if self.stale(&state) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device restarted"));
        }
        Ok(state.outbox.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(channel: u8, payload: &[u8]) -> Vec<u8> {
        slip::encode(&Packet::new(channel, payload).encode())
    }

    fn drain(transport: &mut SimTransport) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while let Ok(n) = transport.read(&mut buf) {
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn decode_documents(bytes: &[u8], channel: u8) -> Vec<Value> {
        let mut decoder = slip::Decoder::new();
        let mut reassembler = Reassembler::new();
        let mut documents = Vec::new();
        for &byte in bytes {
            if let Ok(Some(frame)) = decoder.push(byte) {
                let packet = Packet::parse(&frame).unwrap();
                assert_eq!(packet.channel, channel);
                reassembler.feed(packet.channel, &packet.payload).unwrap();
                while let Some(doc) = reassembler.take_document(packet.channel) {
                    documents.push(doc);
                }
            }
        }
        documents
    }

    #[test]
    fn test_plain_write_then_read_back() {
        let device = SimDevice::new(SimConfig::default());
        let mut transport = device.transport();

        transport
            .write_all(&frame(CHANNEL_SETTINGS, br#"{"app/brightness":25}"#))
            .unwrap();
        transport.write_all(&frame(CHANNEL_SETTINGS, b"{}")).unwrap();

        let documents = decode_documents(&drain(&mut transport), CHANNEL_SETTINGS);
        assert_eq!(documents, vec![json!({"app/brightness": 25})]);
    }

    #[test]
    fn test_locked_device_ignores_plain_writes() {
        let device = SimDevice::new(SimConfig::default());
        device.install_key(0, AuthKey::from_bytes(&[7; 32]).unwrap());
        device.set_locked();
        let mut transport = device.transport();

        transport
            .write_all(&frame(CHANNEL_SETTINGS, br#"{"app/brightness":99}"#))
            .unwrap();
        assert_eq!(device.value("app/brightness"), None);
    }

    #[test]
    fn test_device_info_response() {
        let device = SimDevice::new(SimConfig {
            serial_number: "DT-7".into(),
            ..SimConfig::default()
        });
        let mut transport = device.transport();
        transport.write_all(&frame(CHANNEL_FWINFO, b"{}")).unwrap();

        let documents = decode_documents(&drain(&mut transport), CHANNEL_FWINFO);
        assert_eq!(documents, vec![json!({"serial_number": "DT-7"})]);
    }

    #[test]
    fn test_fragmented_responses_reassemble() {
        let device = SimDevice::new(SimConfig {
            fragment: Fragmentation::Fixed(3),
            ..SimConfig::default()
        });
        let mut transport = device.transport();
        transport
            .write_all(&frame(CHANNEL_SETTINGS, br#"{"app/name":"muxlink"}"#))
            .unwrap();
        transport.write_all(&frame(CHANNEL_SETTINGS, b"{}")).unwrap();

        let documents = decode_documents(&drain(&mut transport), CHANNEL_SETTINGS);
        assert_eq!(documents, vec![json!({"app/name": "muxlink"})]);
    }

    #[test]
    fn test_restart_restores_saved_and_breaks_transport() {
        let device = SimDevice::new(SimConfig::default());
        let mut transport = device.transport();

        transport
            .write_all(&frame(CHANNEL_SETTINGS, br#"{"app/kept":1,"save":true}"#))
            .unwrap();
        transport
            .write_all(&frame(CHANNEL_SETTINGS, br#"{"app/dropped":2}"#))
            .unwrap();
        transport.write_all(&frame(0x14, &[0x01])).unwrap();

        let mut buf = [0u8; 8];
        assert!(transport.read(&mut buf).is_err());
        assert!(transport.write_all(b"x").is_err());

        assert_eq!(device.value("app/kept"), Some(json!(1)));
        assert_eq!(device.value("app/dropped"), None);

        // A fresh transport works again
        let mut transport = device.transport();
        transport.write_all(&frame(CHANNEL_SETTINGS, b"{}")).unwrap();
        let documents = decode_documents(&drain(&mut transport), CHANNEL_SETTINGS);
        assert_eq!(documents, vec![json!({"app/kept": 1})]);
    }
}
