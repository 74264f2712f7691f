//! Frame encoding and decoding.
//!
//! ```text
//! [0xA5] [command_id: 1] [sequence: 2 LE] [payload_len: 1] [payload: payload_len] [crc8: 1]
//! ```
//!
//! The checksum is CRC-8/SMBUS over `command_id` through the last payload byte.

use crc::{Crc, CRC_8_SMBUS};

use crate::{ChannelId, ChannelReport, Command, FrameError, Measurement, RelayState, Sequence, Switch};

/// The byte every frame starts with.
pub const START_BYTE: u8 = 0xA5;
/// The largest payload a frame may declare.
pub const MAX_PAYLOAD_LEN: usize = 16;
/// Start byte, command id, sequence number and payload length.
const HEADER_LEN: usize = 5;
/// Bytes in a frame other than the payload.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 1;

const CHECKSUM: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

const ID_SET_RELAY: u8 = 0x01;
const ID_SET_THRESHOLD: u8 = 0x02;
const ID_QUERY_STATE: u8 = 0x03;
const ID_ACK: u8 = 0x81;
const ID_TELEMETRY: u8 = 0x90;

/// The decoded contents of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Body {
    /// Gateway to controller.
    Command(Command),
    /// Controller to gateway, answering the command with the same sequence number.
    Ack(ChannelReport),
    /// Controller to gateway, unsolicited.
    Telemetry(Measurement),
}

/// A decoded frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub sequence: Sequence,
    pub body: Body,
}

/// Encodes `command` into a frame with the given sequence number.
pub fn encode(command: Command, sequence: Sequence) -> Vec<u8> {
    Frame {
        sequence,
        body: Body::Command(command),
    }
    .encode()
}

impl Frame {
    /// Serializes this frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(MAX_PAYLOAD_LEN);
        let id = self.body.write_payload(&mut payload);

        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        buf.push(START_BYTE);
        buf.push(id);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.push(payload.len() as u8);
        buf.extend_from_slice(&payload);
        buf.push(CHECKSUM.checksum(&buf[1..]));

        buf
    }

    /// Returns the total length of the frame starting at `bytes[0]`, or `Ok(None)` if not enough
    /// of the header has been received to tell.
    ///
    /// `bytes` must start with [`START_BYTE`].
    pub fn peek_len(bytes: &[u8]) -> Result<Option<usize>, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Ok(None);
        }

        let payload_len = bytes[HEADER_LEN - 1] as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong(payload_len));
        }

        Ok(Some(FRAME_OVERHEAD + payload_len))
    }

    /// Decodes exactly one frame from `bytes`.
    ///
    /// The start byte, length and checksum are all verified before the command id or payload is
    /// interpreted, so a corrupted frame is never mistaken for a different valid one.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        let first = *bytes.first().ok_or(FrameError::Truncated {
            needed: FRAME_OVERHEAD,
            available: 0,
        })?;
        if first != START_BYTE {
            return Err(FrameError::MissingStartByte(first));
        }

        let total = Frame::peek_len(bytes)?.ok_or(FrameError::Truncated {
            needed: FRAME_OVERHEAD,
            available: bytes.len(),
        })?;
        if bytes.len() < total {
            return Err(FrameError::Truncated {
                needed: total,
                available: bytes.len(),
            });
        }
        if bytes.len() > total {
            return Err(FrameError::TrailingBytes(bytes.len() - total));
        }

        let expected = CHECKSUM.checksum(&bytes[1..total - 1]);
        let found = bytes[total - 1];
        if expected != found {
            return Err(FrameError::ChecksumMismatch { expected, found });
        }

        let id = bytes[1];
        let sequence = Sequence::from_le_bytes([bytes[2], bytes[3]]);
        let body = Body::parse(id, &bytes[HEADER_LEN..total - 1])?;

        Ok(Frame { sequence, body })
    }
}

impl Body {
    /// Appends this body's payload to `out` and returns its command id.
    fn write_payload(&self, out: &mut Vec<u8>) -> u8 {
        match *self {
            Body::Command(Command::SetRelay { channel, desired }) => {
                out.push(channel.to_wire());
                out.push(match desired {
                    Switch::Off => 0,
                    Switch::On => 1,
                });
                ID_SET_RELAY
            }
            Body::Command(Command::SetThreshold { channel, threshold_ma }) => {
                out.push(channel.to_wire());
                out.extend_from_slice(&threshold_ma.to_le_bytes());
                ID_SET_THRESHOLD
            }
            Body::Command(Command::QueryState { channel }) => {
                out.push(channel.to_wire());
                ID_QUERY_STATE
            }
            Body::Ack(report) => {
                out.push(report.channel.to_wire());
                out.push(report.state.to_wire());
                out.extend_from_slice(&report.threshold_ma.to_le_bytes());
                ID_ACK
            }
            Body::Telemetry(m) => {
                out.push(m.channel.to_wire());
                out.extend_from_slice(&m.current_ma.to_le_bytes());
                out.extend_from_slice(&m.power_mw.to_le_bytes());
                ID_TELEMETRY
            }
        }
    }

    fn parse(id: u8, payload: &[u8]) -> Result<Body, FrameError> {
        let invalid = FrameError::InvalidPayload(id);
        let channel = |byte| ChannelId::from_wire(byte).ok_or(invalid);

        let body = match id {
            ID_SET_RELAY => {
                let &[ch, desired] = payload else {
                    return Err(invalid);
                };
                let desired = match desired {
                    0 => Switch::Off,
                    1 => Switch::On,
                    _ => return Err(invalid),
                };
                Body::Command(Command::SetRelay {
                    channel: channel(ch)?,
                    desired,
                })
            }
            ID_SET_THRESHOLD => {
                let &[ch, a, b, c, d] = payload else {
                    return Err(invalid);
                };
                Body::Command(Command::SetThreshold {
                    channel: channel(ch)?,
                    threshold_ma: u32::from_le_bytes([a, b, c, d]),
                })
            }
            ID_QUERY_STATE => {
                let &[ch] = payload else {
                    return Err(invalid);
                };
                Body::Command(Command::QueryState {
                    channel: channel(ch)?,
                })
            }
            ID_ACK => {
                let &[ch, state, a, b, c, d] = payload else {
                    return Err(invalid);
                };
                Body::Ack(ChannelReport {
                    channel: channel(ch)?,
                    state: RelayState::from_wire(state).ok_or(invalid)?,
                    threshold_ma: u32::from_le_bytes([a, b, c, d]),
                })
            }
            ID_TELEMETRY => {
                let &[ch, c0, c1, c2, c3, p0, p1, p2, p3] = payload else {
                    return Err(invalid);
                };
                Body::Telemetry(Measurement {
                    channel: channel(ch)?,
                    current_ma: u32::from_le_bytes([c0, c1, c2, c3]),
                    power_mw: u32::from_le_bytes([p0, p1, p2, p3]),
                })
            }
            other => return Err(FrameError::UnknownCommandId(other)),
        };

        Ok(body)
    }
}
