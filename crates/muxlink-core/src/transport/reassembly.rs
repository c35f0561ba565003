//! Per-channel JSON reassembly
//!
//! Channel packets fragment JSON documents at arbitrary byte boundaries,
//! including inside multi-byte UTF-8 sequences. Each channel accumulates its
//! fragments independently; complete documents are extracted as soon as the
//! accumulated bytes parse, and the consumed prefix is dropped so the next
//! document can start mid-packet.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use super::MAX_REASSEMBLY_SIZE;
use crate::ProtocolError;

#[derive(Debug, Default)]
struct ChannelBuffer {
    bytes: Vec<u8>,
    documents: VecDeque<Value>,
}

/// Accumulates fragments per channel and yields complete JSON documents.
///
/// Documents are concatenated on the wire with no separator, so extraction
/// uses a streaming parse: everything up to the end of the last complete
/// document is consumed, a trailing partial document is kept for the next
/// fragment, and bytes that can never parse poison only their own channel.
#[derive(Debug)]
pub struct Reassembler {
    channels: HashMap<u8, ChannelBuffer>,
    max_pending: usize,
}

impl Reassembler {
    /// Create a reassembler with the default pending-byte bound.
    pub fn new() -> Self {
        Self::with_limit(MAX_REASSEMBLY_SIZE)
    }

    /// Create a reassembler bounding unparsed bytes per channel.
    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            channels: HashMap::new(),
            max_pending,
        }
    }

    /// Append one fragment to a channel and extract completed documents.
    ///
    /// Returns the number of documents completed by this fragment. Malformed
    /// bytes clear the channel's pending buffer and surface as an error;
    /// documents extracted before the malformed region are kept.
    pub fn feed(&mut self, channel: u8, fragment: &[u8]) -> Result<usize, ProtocolError> {
        let buffer = self.channels.entry(channel).or_default();
        buffer.bytes.extend_from_slice(fragment);

        let mut consumed = 0;
        let mut completed = 0;
        let mut malformed = None;
        {
            let mut stream =
                serde_json::Deserializer::from_slice(&buffer.bytes).into_iter::<Value>();
            loop {
                match stream.next() {
                    Some(Ok(value)) => {
                        buffer.documents.push_back(value);
                        completed += 1;
                        consumed = stream.byte_offset();
                    }
                    // A trailing partial document stays buffered until the
                    // next fragment extends it.
                    Some(Err(err)) if err.is_eof() => break,
                    Some(Err(err)) => {
                        malformed = Some(err);
                        break;
                    }
                    None => break,
                }
            }
        }
        buffer.bytes.drain(..consumed);

        if let Some(source) = malformed {
            buffer.bytes.clear();
            return Err(ProtocolError::MalformedPayload { channel, source });
        }
        if buffer.bytes.len() > self.max_pending {
            buffer.bytes.clear();
            return Err(ProtocolError::ReassemblyOverflow {
                channel,
                limit: self.max_pending,
            });
        }
        Ok(completed)
    }

    /// Pop the oldest completed document for a channel.
    pub fn take_document(&mut self, channel: u8) -> Option<Value> {
        self.channels
            .get_mut(&channel)?
            .documents
            .pop_front()
    }

    /// Number of completed documents queued for a channel.
    pub fn queued(&self, channel: u8) -> usize {
        self.channels
            .get(&channel)
            .map_or(0, |b| b.documents.len())
    }

    /// Number of unparsed bytes pending for a channel.
    pub fn pending_len(&self, channel: u8) -> usize {
        self.channels.get(&channel).map_or(0, |b| b.bytes.len())
    }

    /// Drop all pending bytes and queued documents for a channel.
    pub fn clear(&mut self, channel: u8) {
        self.channels.remove(&channel);
    }

    /// Drop state for every channel.
    pub fn clear_all(&mut self) {
        self.channels.clear();
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
