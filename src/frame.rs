//! Codec for the UHF reader's framed serial protocol.
//!
//! Every frame on the wire has the same shape:
//!
//! ```text
//! 0xBB TYPE LEN_HI LEN_LO CMD PAYLOAD[LEN] CHECKSUM 0x7E
//! ```
//!
//! The checksum is the byte sum from TYPE through the end of PAYLOAD, modulo
//! 256. The reader is chatty and its UART is not clean, so [`FrameSplitter`]
//! consumes garbage silently and resynchronizes on the next `0xBB`.

use crate::{Epc, Rssi};

use nom::{
    bytes::streaming::{tag, take},
    error::{Error as NomError, ErrorKind},
    number::streaming::{be_u16, be_u8},
    IResult,
};
use std::{error::Error, fmt};

pub const HEADER: u8 = 0xBB;
pub const TAIL: u8 = 0x7E;

pub const TYPE_COMMAND: u8 = 0x00;
pub const TYPE_RESPONSE: u8 = 0x01;
pub const TYPE_NOTICE: u8 = 0x02;

pub const CMD_HARDWARE_VERSION: u8 = 0x03;
pub const CMD_SINGLE_POLL: u8 = 0x22;
pub const CMD_MULTI_POLL: u8 = 0x27;
pub const CMD_SET_TX_POWER: u8 = 0xB6;
pub const CMD_SET_REGION: u8 = 0xB8;

/// Error report frames echo this pseudo-command.
const CMD_ERROR: u8 = 0xFF;
/// Error code the reader uses for "no more tags this poll".
const ERR_INVENTORY_END: u8 = 0x15;

/// Bytes we are willing to buffer while hunting for a frame boundary.
const MAX_PENDING: usize = 64 * 1024;

/// A validated frame, header/checksum/tail already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

/// The response subtypes the controller actually cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A tag answered an inventory poll. Payload is RSSI, a two-byte
    /// protocol-control word we ignore, and the EPC bytes.
    TagNotice { rssi: Rssi, epc: Epc },
    /// The reader has nothing more to report for this poll.
    InventoryEnd,
    /// A configuration command was accepted.
    ConfigAck { cmd: u8 },
    /// The reader rejected a command.
    Error { code: u8 },
}

#[derive(Debug)]
pub enum FrameError {
    /// More than [`MAX_PENDING`] bytes arrived without a parseable frame.
    Desynchronized,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Desynchronized => {
                write!(f, "no valid frame boundary within {} bytes", MAX_PENDING)
            }
        }
    }
}

impl Error for FrameError {}

/// Byte sum from TYPE through the end of PAYLOAD, modulo 256.
fn checksum(frame_type: u8, len: u16, cmd: u8, payload: &[u8]) -> u8 {
    let head = frame_type
        .wrapping_add((len >> 8) as u8)
        .wrapping_add(len as u8)
        .wrapping_add(cmd);
    payload.iter().fold(head, |acc, b| acc.wrapping_add(*b))
}

/// Encode a command frame around `payload`.
pub fn encode(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(payload.len() + 7);
    out.push(HEADER);
    out.push(TYPE_COMMAND);
    out.push((len >> 8) as u8);
    out.push(len as u8);
    out.push(cmd);
    out.extend_from_slice(payload);
    out.push(checksum(TYPE_COMMAND, len, cmd, payload));
    out.push(TAIL);
    out
}

fn parse_frame(input: &[u8]) -> IResult<&[u8], Frame> {
    let (input, _) = tag(&[HEADER][..])(input)?;
    let (input, frame_type) = be_u8(input)?;
    let (input, len) = be_u16(input)?;
    let (input, cmd) = be_u8(input)?;
    let (input, payload) = take(len as usize)(input)?;
    let (input, sum) = be_u8(input)?;
    let (input, _) = tag(&[TAIL][..])(input)?;

    if sum != checksum(frame_type, len, cmd, payload) {
        return Err(nom::Err::Error(NomError::new(input, ErrorKind::Verify)));
    }

    Ok((
        input,
        Frame {
            frame_type,
            cmd,
            payload: payload.to_vec(),
        },
    ))
}

impl Frame {
    /// Classify a frame into one of the known response subtypes. Frames that
    /// match none of them yield `None` and are ignored upstream.
    pub fn response(&self) -> Option<Response> {
        match (self.frame_type, self.cmd) {
            (TYPE_NOTICE, CMD_MULTI_POLL) | (TYPE_NOTICE, CMD_SINGLE_POLL) => {
                // RSSI (1) + protocol control (2) + EPC (at least one byte).
                if self.payload.len() < 4 {
                    return None;
                }
                Some(Response::TagNotice {
                    rssi: self.payload[0] as i8 as Rssi,
                    epc: Epc::from_bytes(&self.payload[3..]),
                })
            }
            (TYPE_RESPONSE, CMD_ERROR) => match self.payload.first() {
                Some(&ERR_INVENTORY_END) => Some(Response::InventoryEnd),
                Some(&code) => Some(Response::Error { code }),
                None => None,
            },
            (TYPE_RESPONSE, cmd) => Some(Response::ConfigAck { cmd }),
            _ => None,
        }
    }
}

/// Incremental scanner over the raw serial byte stream.
///
/// Feed it whatever `read()` returned and pull complete frames out. Garbage
/// between frames is dropped without comment; a corrupt frame costs exactly
/// one header byte and the scan resumes at the next `0xBB`.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buf: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, if one is buffered. `Ok(None)` means "feed me
    /// more bytes". [`FrameError::Desynchronized`] is returned only when the
    /// pending-byte bound is exceeded; the offending header byte is dropped
    /// so the caller can simply continue.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            let start = match self.buf.iter().position(|b| *b == HEADER) {
                Some(i) => i,
                None => {
                    self.buf.clear();
                    return Ok(None);
                }
            };
            if start > 0 {
                self.buf.drain(..start);
            }

            match parse_frame(&self.buf) {
                Ok((rest, frame)) => {
                    let consumed = self.buf.len() - rest.len();
                    self.buf.drain(..consumed);
                    return Ok(Some(frame));
                }
                Err(nom::Err::Incomplete(_)) => {
                    if self.buf.len() > MAX_PENDING {
                        self.buf.drain(..1);
                        return Err(FrameError::Desynchronized);
                    }
                    return Ok(None);
                }
                // Bad checksum, bad tail, or a stray 0xBB: skip the header
                // byte and hunt for the next one.
                Err(_) => {
                    self.buf.drain(..1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_notice_frame(rssi: u8, epc: &[u8]) -> Vec<u8> {
        let mut payload = vec![rssi, 0x34, 0x00];
        payload.extend_from_slice(epc);
        let len = payload.len() as u16;
        let mut out = vec![HEADER, TYPE_NOTICE, (len >> 8) as u8, len as u8, CMD_MULTI_POLL];
        out.extend_from_slice(&payload);
        out.push(checksum(TYPE_NOTICE, len, CMD_MULTI_POLL, &payload));
        out.push(TAIL);
        out
    }

    #[test]
    fn encode_multi_poll_golden_bytes() {
        assert_eq!(
            encode(CMD_MULTI_POLL, &[]),
            vec![0xBB, 0x00, 0x00, 0x00, 0x27, 0x27, 0x7E]
        );
    }

    #[test]
    fn encode_set_region_includes_payload_in_checksum() {
        let frame = encode(CMD_SET_REGION, &[0x02]);
        assert_eq!(frame, vec![0xBB, 0x00, 0x00, 0x01, 0xB8, 0x02, 0xBB, 0x7E]);
    }

    #[test]
    fn splitter_finds_frame_in_garbage() {
        let epc = [0xE2, 0x80, 0x11, 0x60, 0x60, 0x00, 0x02, 0x05, 0x0C, 0xB2, 0x6A, 0xAB];
        let mut bytes = vec![0x00, 0x13, 0x37];
        bytes.extend_from_slice(&tag_notice_frame(0xC5, &epc));
        bytes.push(0xFF);

        let mut splitter = FrameSplitter::new();
        splitter.extend(&bytes);

        let frame = splitter.next_frame().unwrap().unwrap();
        assert_eq!(
            frame.response(),
            Some(Response::TagNotice {
                rssi: -59,
                epc: Epc::from_bytes(&epc),
            })
        );
        assert_eq!(splitter.next_frame().unwrap(), None);
    }

    #[test]
    fn splitter_handles_partial_feeds() {
        let frame_bytes = tag_notice_frame(0xD0, &[0xAA; 12]);
        let (a, b) = frame_bytes.split_at(6);

        let mut splitter = FrameSplitter::new();
        splitter.extend(a);
        assert_eq!(splitter.next_frame().unwrap(), None);
        splitter.extend(b);
        assert!(splitter.next_frame().unwrap().is_some());
    }

    #[test]
    fn corrupt_checksum_is_skipped_silently() {
        let mut bad = tag_notice_frame(0xC5, &[0xAA; 12]);
        let sum_index = bad.len() - 2;
        bad[sum_index] ^= 0xFF;
        let good = tag_notice_frame(0xC8, &[0xBB; 12]);

        let mut splitter = FrameSplitter::new();
        splitter.extend(&bad);
        splitter.extend(&good);

        let frame = splitter.next_frame().unwrap().unwrap();
        assert_eq!(
            frame.response(),
            Some(Response::TagNotice {
                rssi: -56,
                epc: Epc::from_bytes(&[0xBB; 12]),
            })
        );
    }

    #[test]
    fn inventory_end_and_error_frames_classify() {
        let end = Frame {
            frame_type: TYPE_RESPONSE,
            cmd: CMD_ERROR,
            payload: vec![ERR_INVENTORY_END],
        };
        assert_eq!(end.response(), Some(Response::InventoryEnd));

        let err = Frame {
            frame_type: TYPE_RESPONSE,
            cmd: CMD_ERROR,
            payload: vec![0x09],
        };
        assert_eq!(err.response(), Some(Response::Error { code: 0x09 }));

        let ack = Frame {
            frame_type: TYPE_RESPONSE,
            cmd: CMD_SET_REGION,
            payload: vec![0x00],
        };
        assert_eq!(ack.response(), Some(Response::ConfigAck { cmd: CMD_SET_REGION }));
    }

    #[test]
    fn runaway_stream_reports_desync_once_then_recovers() {
        let mut splitter = FrameSplitter::new();
        // A header byte followed by a length that never arrives.
        splitter.extend(&[HEADER, TYPE_NOTICE, 0xFF, 0xFF]);
        splitter.extend(&vec![0x00; MAX_PENDING]);
        assert!(splitter.next_frame().is_err());

        splitter.extend(&tag_notice_frame(0xC5, &[0xAA; 12]));
        // Eventually resynchronizes on the real frame.
        loop {
            match splitter.next_frame() {
                Ok(Some(_)) => break,
                Ok(None) => panic!("ran out of bytes before resync"),
                Err(_) => continue,
            }
        }
    }
}
