//! SLIP framing
//!
//! Implements the byte-level framing that delimits messages on the raw
//! serial stream: every frame is terminated by an unescaped `END`, and any
//! literal `END`/`ESC` byte inside the payload travels as a two-byte escape
//! sequence.

use super::MAX_FRAME_SIZE;
use crate::ProtocolError;

/// Frame terminator
pub const END: u8 = 0xC0;
/// Escape introducer
pub const ESC: u8 = 0xDB;
/// Escaped form of a literal `END`
pub const ESC_END: u8 = 0xDC;
/// Escaped form of a literal `ESC`
pub const ESC_ESC: u8 = 0xDD;

/// Encode a payload into one delimited frame.
///
/// Total over arbitrary byte sequences: payloads containing `END` or `ESC`
/// round-trip through [`Decoder`] unchanged.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 4 + 1);
    for &byte in payload {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(byte),
        }
    }
    out.push(END);
    out
}

/// Decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Accumulating payload bytes
    Frame,
    /// Saw an `ESC`, expecting the continuation byte
    Escape,
    /// A frame was discarded; dropping bytes until the next unescaped `END`
    Resync,
}

/// Incremental SLIP decoder.
///
/// Feed raw stream bytes one at a time; a completed payload is returned
/// exactly when an unescaped `END` is observed. An `ESC` not followed by one
/// of the two recognized continuations is a framing error: the in-progress
/// frame is discarded and the decoder resynchronizes on the next `END`
/// rather than propagating corrupted bytes.
#[derive(Debug)]
pub struct Decoder {
    buffer: Vec<u8>,
    state: State,
}

impl Decoder {
    /// Create a decoder ready for the start of a frame.
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            state: State::Frame,
        }
    }

    /// Feed one raw byte.
    ///
    /// Returns `Ok(Some(payload))` when the byte completes a frame,
    /// `Ok(None)` when more bytes are needed (empty frames are skipped), and
    /// an error when the byte invalidates the in-progress frame. After an
    /// error the decoder keeps consuming and discarding bytes until the
    /// stream resynchronizes on an `END`.
    pub fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.state {
            State::Resync => {
                if byte == END {
                    self.state = State::Frame;
                }
                Ok(None)
            }
            State::Escape => {
                self.state = State::Frame;
                let literal = match byte {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    // An END here both invalidates the escape and terminates
                    // the (discarded) frame, so the stream is already synced.
                    END => {
                        self.buffer.clear();
                        return Err(ProtocolError::InvalidEscape(END));
                    }
                    other => {
                        self.buffer.clear();
                        self.state = State::Resync;
                        return Err(ProtocolError::InvalidEscape(other));
                    }
                };
                self.store(literal)
            }
            State::Frame => match byte {
                END => {
                    if self.buffer.is_empty() {
                        Ok(None)
                    } else {
                        Ok(Some(std::mem::take(&mut self.buffer)))
                    }
                }
                ESC => {
                    self.state = State::Escape;
                    Ok(None)
                }
                other => self.store(other),
            },
        }
    }

    /// Discard any partial frame and return to the ready state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::Frame;
    }

    /// Number of payload bytes accumulated for the in-progress frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn store(&mut self, byte: u8) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.buffer.len() >= MAX_FRAME_SIZE {
            self.buffer.clear();
            self.state = State::Resync;
            return Err(ProtocolError::FrameTooLarge {
                limit: MAX_FRAME_SIZE,
            });
        }
        self.buffer.push(byte);
        Ok(None)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut Decoder, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in bytes {
            if let Ok(Some(frame)) = decoder.push(b) {
                frames.push(frame);
            }
        }
        frames
    }

    #[test]
    fn test_roundtrip_plain() {
        let payload = b"\x13{\"app/brightness\":25}";
        let mut decoder = Decoder::new();
        let frames = decode_all(&mut decoder, &encode(payload));
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn test_roundtrip_with_marker_bytes() {
        let payload = [END, ESC, 0x00, ESC, END, 0xFF, ESC_END, ESC_ESC];
        let mut decoder = Decoder::new();
        let frames = decode_all(&mut decoder, &encode(&payload));
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn test_roundtrip_every_byte_value() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let mut decoder = Decoder::new();
        let frames = decode_all(&mut decoder, &encode(&payload));
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn test_escaping_is_expanded_on_the_wire() {
        let encoded = encode(&[END]);
        assert_eq!(encoded, vec![ESC, ESC_END, END]);
        let encoded = encode(&[ESC]);
        assert_eq!(encoded, vec![ESC, ESC_ESC, END]);
    }

    #[test]
    fn test_empty_frames_are_skipped() {
        let mut decoder = Decoder::new();
        let mut stream = vec![END, END, END];
        stream.extend_from_slice(&encode(b"x"));
        let frames = decode_all(&mut decoder, &stream);
        assert_eq!(frames, vec![b"x".to_vec()]);
    }

    #[test]
    fn test_split_delivery() {
        let payload = [0x12, ESC, 0x01];
        let encoded = encode(&payload);
        let mut decoder = Decoder::new();
        // One byte at a time across "reads"
        let (head, tail) = encoded.split_at(2);
        let mut frames = decode_all(&mut decoder, head);
        frames.extend(decode_all(&mut decoder, tail));
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn test_invalid_escape_discards_frame_and_resyncs() {
        let mut decoder = Decoder::new();
        assert!(decoder.push(0x41).unwrap().is_none());
        assert!(decoder.push(ESC).unwrap().is_none());
        let err = decoder.push(0x42).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEscape(0x42)));

        // Garbage until the next END must be dropped without yielding a frame
        assert!(decoder.push(0x43).unwrap().is_none());
        assert!(decoder.push(END).unwrap().is_none());

        // The stream is usable again afterwards
        let frames = decode_all(&mut decoder, &encode(b"ok"));
        assert_eq!(frames, vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_escape_cut_short_by_end_leaves_decoder_synced() {
        let mut decoder = Decoder::new();
        decoder.push(0x41).unwrap();
        decoder.push(ESC).unwrap();
        let err = decoder.push(END).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEscape(END)));

        // END terminated the bad frame, so the very next frame decodes.
        let frames = decode_all(&mut decoder, &encode(b"next"));
        assert_eq!(frames, vec![b"next".to_vec()]);
    }

    #[test]
    fn test_oversized_frame_is_discarded() {
        let mut decoder = Decoder::new();
        let mut result = Ok(None);
        for _ in 0..=MAX_FRAME_SIZE {
            result = decoder.push(0x55);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { .. })
        ));

        // Everything up to the next END is junk; afterwards frames flow again
        assert!(decoder.push(0x55).unwrap().is_none());
        assert!(decoder.push(END).unwrap().is_none());
        let frames = decode_all(&mut decoder, &encode(b"after"));
        assert_eq!(frames, vec![b"after".to_vec()]);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut stream = encode(b"first");
        stream.extend_from_slice(&encode(b"second"));
        let mut decoder = Decoder::new();
        let frames = decode_all(&mut decoder, &stream);
        assert_eq!(frames, vec![b"first".to_vec(), b"second".to_vec()]);
    }
}
