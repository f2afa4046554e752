//! Wire codec for the biosensor protocol.
//!
//! Every protocol unit travels as a single frame: a one-byte message type, a
//! big-endian `u16` total length (header, payload and trailer included), the
//! payload, and a CRC-16/CCITT trailer computed over everything before it.
//! Message types below [`RESPONSE_TYPE_BASE`] are device-initiated events;
//! types at or above it are replies to a previously sent request.
//!
//! [`decode`] is deliberately incremental-friendly: it reports
//! [`DecodeError::Incomplete`] with the number of bytes still required, so a
//! stream framer can retain a partial frame and retry once more bytes arrive.

pub mod attributes;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use self::attributes::AttributeValue;

/// Message type byte plus the big-endian length field.
pub const HEADER_LEN: usize = 3;
/// CRC-16 trailer size.
pub const CRC_LEN: usize = 2;
/// Smallest legal frame: header plus trailer, no payload.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CRC_LEN;
/// First message type in the response subspace.
pub const RESPONSE_TYPE_BASE: u8 = 0x80;

/// Message type constants for the known protocol units.
pub mod msg_type {
    pub const HEARTBEAT: u8 = 0x05;
    pub const GET_ATTRIBUTE: u8 = 0x12;
    pub const CONFIGURE_REPORTING: u8 = 0x16;
    pub const RESET_REPORTING: u8 = 0x17;
    pub const GET_FILE: u8 = 0x19;
    pub const ATTRIBUTE_CHANGED: u8 = 0x21;
    pub const RAW_PULSE_CHANGED: u8 = 0x26;
    pub const RAW_PULSE_LIST_CHANGED: u8 = 0x27;
    pub const HEARTBEAT_RESPONSE: u8 = 0x85;
    pub const GET_ATTRIBUTE_RESPONSE: u8 = 0x92;
    pub const CONFIGURE_REPORTING_RESPONSE: u8 = 0x96;
    pub const RESET_REPORTING_RESPONSE: u8 = 0x97;
    pub const GET_FILE_RESPONSE: u8 = 0x99;
    pub const FILE_DATA_CHUNK: u8 = 0xB2;
}

/// One raw ECG/PPG sample, in the basic or all-channels form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PulseSample {
    /// Single ECG and single PPG channel.
    Basic { ecg: i32, ppg: i32 },
    /// Single ECG channel with green, red and infrared PPG channels.
    AllChannels {
        ecg: i32,
        ppg_green: i32,
        ppg_red: i32,
        ppg_ir: i32,
    },
}

/// A decoded protocol unit.
///
/// Variants below [`RESPONSE_TYPE_BASE`] are either requests this client
/// sends or events the device pushes; variants at or above it are response
/// messages correlated to a prior request by arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Liveness probe.
    Heartbeat,
    /// Read a single attribute.
    GetAttribute { attribute_id: u8 },
    /// Configure periodic or on-change reporting for an attribute.
    ConfigureReporting {
        attribute_id: u8,
        /// Reporting interval; `0` means "send on every change".
        interval: u16,
        reporting_mode: u8,
    },
    /// Disable reporting for an attribute.
    ResetReporting { attribute_id: u8 },
    /// Start a chunked file download.
    GetFile { file_name: String },
    /// Device-initiated notification that an attribute changed.
    AttributeChanged {
        attribute_id: u8,
        value: AttributeValue,
    },
    /// Device-initiated single raw pulse sample.
    RawPulseChanged { sample: PulseSample },
    /// Device-initiated batch of raw pulse samples.
    RawPulseListChanged { ecgs: Vec<i32>, ppgs: Vec<i32> },
    /// Reply to [`Message::Heartbeat`].
    HeartbeatResponse,
    /// Reply to [`Message::GetAttribute`].
    GetAttributeResponse {
        attribute_id: u8,
        value: AttributeValue,
    },
    /// Reply to [`Message::ConfigureReporting`].
    ConfigureReportingResponse,
    /// Reply to [`Message::ResetReporting`].
    ResetReportingResponse,
    /// Reply to [`Message::GetFile`]; chunks follow as separate frames.
    GetFileResponse,
    /// One fragment of an in-flight file download.
    FileDataChunk {
        /// Transfer identifier assigned by the device.
        fileref: u8,
        /// Byte offset of this chunk within the file.
        offset: u32,
        file_data: Bytes,
    },
}

/// Errors produced while decoding a frame from raw bytes.
///
/// [`DecodeError::Incomplete`] is the normal fragmentation signal, not a
/// corruption: the caller should buffer and retry. Every other variant means
/// the bytes at the current position cannot begin a valid frame.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes for the next frame yet.
    #[error("need {needed} bytes for the next frame, have {available}")]
    Incomplete { needed: usize, available: usize },
    /// The first byte is not a known message type.
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    /// The length field cannot describe a legal frame.
    #[error("frame length field {length} below the {MIN_FRAME_LEN}-byte minimum")]
    BadLength { length: usize },
    /// The CRC trailer does not match the frame contents.
    #[error("CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    CrcMismatch { computed: u16, received: u16 },
    /// Header and CRC were fine but the payload does not fit the type.
    #[error("malformed payload for message type {msg_type:#04x}: {detail}")]
    Payload { msg_type: u8, detail: &'static str },
}

/// CRC-16/CCITT-FALSE over `data` (poly `0x1021`, init `0xFFFF`).
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x1021
            };
        }
    }
    crc
}

const fn is_known_type(msg_type: u8) -> bool {
    matches!(
        msg_type,
        msg_type::HEARTBEAT
            | msg_type::GET_ATTRIBUTE
            | msg_type::CONFIGURE_REPORTING
            | msg_type::RESET_REPORTING
            | msg_type::GET_FILE
            | msg_type::ATTRIBUTE_CHANGED
            | msg_type::RAW_PULSE_CHANGED
            | msg_type::RAW_PULSE_LIST_CHANGED
            | msg_type::HEARTBEAT_RESPONSE
            | msg_type::GET_ATTRIBUTE_RESPONSE
            | msg_type::CONFIGURE_REPORTING_RESPONSE
            | msg_type::RESET_REPORTING_RESPONSE
            | msg_type::GET_FILE_RESPONSE
            | msg_type::FILE_DATA_CHUNK
    )
}

/// Attempt to decode the next frame from the front of `src`.
///
/// On success returns the message and the number of bytes consumed.
///
/// # Errors
///
/// Returns [`DecodeError::Incomplete`] when `src` holds only a partial
/// frame, and a corruption variant when the bytes at the front cannot form a
/// valid frame (the caller decides how to resynchronise).
pub fn decode(src: &[u8]) -> Result<(Message, usize), DecodeError> {
    // The type byte alone decides whether these bytes can begin a frame, so
    // check it before asking for the rest of the header. A garbage byte then
    // resynchronises immediately instead of lingering as incomplete.
    let Some(&msg_type) = src.first() else {
        return Err(DecodeError::Incomplete {
            needed: HEADER_LEN,
            available: 0,
        });
    };
    if !is_known_type(msg_type) {
        return Err(DecodeError::UnknownType(msg_type));
    }
    if src.len() < HEADER_LEN {
        return Err(DecodeError::Incomplete {
            needed: HEADER_LEN,
            available: src.len(),
        });
    }
    let length = usize::from(u16::from_be_bytes([src[1], src[2]]));
    if length < MIN_FRAME_LEN {
        return Err(DecodeError::BadLength { length });
    }
    if src.len() < length {
        return Err(DecodeError::Incomplete {
            needed: length,
            available: src.len(),
        });
    }
    let received = u16::from_be_bytes([src[length - 2], src[length - 1]]);
    let computed = crc16(&src[..length - CRC_LEN]);
    if computed != received {
        return Err(DecodeError::CrcMismatch { computed, received });
    }
    let payload = &src[HEADER_LEN..length - CRC_LEN];
    let message = parse_payload(msg_type, payload)?;
    Ok((message, length))
}

const fn payload_error(msg_type: u8, detail: &'static str) -> DecodeError {
    DecodeError::Payload { msg_type, detail }
}

fn require_len(msg_type: u8, payload: &[u8], expected: usize) -> Result<(), DecodeError> {
    if payload.len() == expected {
        Ok(())
    } else {
        Err(payload_error(msg_type, "unexpected payload length"))
    }
}

fn parse_i32s(data: &[u8]) -> Vec<i32> {
    data.chunks_exact(4)
        .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[allow(clippy::too_many_lines)]
fn parse_payload(msg_type: u8, payload: &[u8]) -> Result<Message, DecodeError> {
    let message = match msg_type {
        msg_type::HEARTBEAT => {
            require_len(msg_type, payload, 0)?;
            Message::Heartbeat
        }
        msg_type::GET_ATTRIBUTE => {
            require_len(msg_type, payload, 1)?;
            Message::GetAttribute {
                attribute_id: payload[0],
            }
        }
        msg_type::CONFIGURE_REPORTING => {
            require_len(msg_type, payload, 4)?;
            Message::ConfigureReporting {
                attribute_id: payload[0],
                interval: u16::from_be_bytes([payload[1], payload[2]]),
                reporting_mode: payload[3],
            }
        }
        msg_type::RESET_REPORTING => {
            require_len(msg_type, payload, 1)?;
            Message::ResetReporting {
                attribute_id: payload[0],
            }
        }
        msg_type::GET_FILE => {
            let file_name = std::str::from_utf8(payload)
                .map_err(|_| payload_error(msg_type, "file name is not valid UTF-8"))?
                .to_owned();
            Message::GetFile { file_name }
        }
        msg_type::ATTRIBUTE_CHANGED | msg_type::GET_ATTRIBUTE_RESPONSE => {
            let (&attribute_id, value_bytes) = payload
                .split_first()
                .ok_or(payload_error(msg_type, "missing attribute id"))?;
            let value = AttributeValue::decode(attribute_id, value_bytes)
                .map_err(|detail| payload_error(msg_type, detail))?;
            if msg_type == self::msg_type::ATTRIBUTE_CHANGED {
                Message::AttributeChanged {
                    attribute_id,
                    value,
                }
            } else {
                Message::GetAttributeResponse {
                    attribute_id,
                    value,
                }
            }
        }
        msg_type::RAW_PULSE_CHANGED => {
            let values = parse_i32s(payload);
            match (payload.len(), values.as_slice()) {
                (8, &[ecg, ppg]) => Message::RawPulseChanged {
                    sample: PulseSample::Basic { ecg, ppg },
                },
                (16, &[ecg, ppg_green, ppg_red, ppg_ir]) => Message::RawPulseChanged {
                    sample: PulseSample::AllChannels {
                        ecg,
                        ppg_green,
                        ppg_red,
                        ppg_ir,
                    },
                },
                _ => return Err(payload_error(msg_type, "expected 8 or 16 payload bytes")),
            }
        }
        msg_type::RAW_PULSE_LIST_CHANGED => {
            if payload.len() < 2 {
                return Err(payload_error(msg_type, "missing sample counts"));
            }
            let ecg_count = usize::from(payload[0]);
            let ppg_count = usize::from(payload[1]);
            let samples = &payload[2..];
            if samples.len() != (ecg_count + ppg_count) * 4 {
                return Err(payload_error(msg_type, "sample counts disagree with length"));
            }
            let values = parse_i32s(samples);
            let (ecgs, ppgs) = values.split_at(ecg_count);
            Message::RawPulseListChanged {
                ecgs: ecgs.to_vec(),
                ppgs: ppgs.to_vec(),
            }
        }
        msg_type::HEARTBEAT_RESPONSE => {
            require_len(msg_type, payload, 0)?;
            Message::HeartbeatResponse
        }
        msg_type::CONFIGURE_REPORTING_RESPONSE => {
            require_len(msg_type, payload, 0)?;
            Message::ConfigureReportingResponse
        }
        msg_type::RESET_REPORTING_RESPONSE => {
            require_len(msg_type, payload, 0)?;
            Message::ResetReportingResponse
        }
        msg_type::GET_FILE_RESPONSE => {
            require_len(msg_type, payload, 0)?;
            Message::GetFileResponse
        }
        msg_type::FILE_DATA_CHUNK => {
            if payload.len() < 5 {
                return Err(payload_error(msg_type, "missing fileref and offset"));
            }
            Message::FileDataChunk {
                fileref: payload[0],
                offset: u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]),
                file_data: Bytes::copy_from_slice(&payload[5..]),
            }
        }
        _ => return Err(DecodeError::UnknownType(msg_type)),
    };
    Ok(message)
}

impl Message {
    /// Numeric message type carried in the frame header.
    #[must_use]
    pub const fn msg_type(&self) -> u8 {
        match self {
            Message::Heartbeat => msg_type::HEARTBEAT,
            Message::GetAttribute { .. } => msg_type::GET_ATTRIBUTE,
            Message::ConfigureReporting { .. } => msg_type::CONFIGURE_REPORTING,
            Message::ResetReporting { .. } => msg_type::RESET_REPORTING,
            Message::GetFile { .. } => msg_type::GET_FILE,
            Message::AttributeChanged { .. } => msg_type::ATTRIBUTE_CHANGED,
            Message::RawPulseChanged { .. } => msg_type::RAW_PULSE_CHANGED,
            Message::RawPulseListChanged { .. } => msg_type::RAW_PULSE_LIST_CHANGED,
            Message::HeartbeatResponse => msg_type::HEARTBEAT_RESPONSE,
            Message::GetAttributeResponse { .. } => msg_type::GET_ATTRIBUTE_RESPONSE,
            Message::ConfigureReportingResponse => msg_type::CONFIGURE_REPORTING_RESPONSE,
            Message::ResetReportingResponse => msg_type::RESET_REPORTING_RESPONSE,
            Message::GetFileResponse => msg_type::GET_FILE_RESPONSE,
            Message::FileDataChunk { .. } => msg_type::FILE_DATA_CHUNK,
        }
    }

    /// Whether this message sits in the response subspace.
    #[must_use]
    pub const fn is_response(&self) -> bool { self.msg_type() >= RESPONSE_TYPE_BASE }

    fn payload_len(&self) -> usize {
        match self {
            Message::Heartbeat
            | Message::HeartbeatResponse
            | Message::ConfigureReportingResponse
            | Message::ResetReportingResponse
            | Message::GetFileResponse => 0,
            Message::GetAttribute { .. } | Message::ResetReporting { .. } => 1,
            Message::ConfigureReporting { .. } => 4,
            Message::GetFile { file_name } => file_name.len(),
            Message::AttributeChanged { value, .. }
            | Message::GetAttributeResponse { value, .. } => 1 + value.encoded_len(),
            Message::RawPulseChanged { sample } => match sample {
                PulseSample::Basic { .. } => 8,
                PulseSample::AllChannels { .. } => 16,
            },
            Message::RawPulseListChanged { ecgs, ppgs } => 2 + (ecgs.len() + ppgs.len()) * 4,
            Message::FileDataChunk { file_data, .. } => 5 + file_data.len(),
        }
    }

    /// Total encoded frame size, header and CRC trailer included.
    #[must_use]
    pub fn encoded_len(&self) -> usize { MIN_FRAME_LEN + self.payload_len() }

    /// Encode this message as a complete frame.
    ///
    /// # Panics
    ///
    /// Panics if the encoded frame would exceed the `u16` length field. All
    /// protocol messages are far below that bound.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let length = self.encoded_len();
        let length_field = u16::try_from(length).expect("frame length fits the u16 length field");
        let mut buf = BytesMut::with_capacity(length);
        buf.put_u8(self.msg_type());
        buf.put_u16(length_field);
        self.write_payload(&mut buf);
        let crc = crc16(&buf);
        buf.put_u16(crc);
        buf.to_vec()
    }

    fn write_payload(&self, buf: &mut BytesMut) {
        match self {
            Message::Heartbeat
            | Message::HeartbeatResponse
            | Message::ConfigureReportingResponse
            | Message::ResetReportingResponse
            | Message::GetFileResponse => {}
            Message::GetAttribute { attribute_id } | Message::ResetReporting { attribute_id } => {
                buf.put_u8(*attribute_id);
            }
            Message::ConfigureReporting {
                attribute_id,
                interval,
                reporting_mode,
            } => {
                buf.put_u8(*attribute_id);
                buf.put_u16(*interval);
                buf.put_u8(*reporting_mode);
            }
            Message::GetFile { file_name } => buf.put_slice(file_name.as_bytes()),
            Message::AttributeChanged {
                attribute_id,
                value,
            }
            | Message::GetAttributeResponse {
                attribute_id,
                value,
            } => {
                buf.put_u8(*attribute_id);
                value.write(buf);
            }
            Message::RawPulseChanged { sample } => match *sample {
                PulseSample::Basic { ecg, ppg } => {
                    buf.put_i32(ecg);
                    buf.put_i32(ppg);
                }
                PulseSample::AllChannels {
                    ecg,
                    ppg_green,
                    ppg_red,
                    ppg_ir,
                } => {
                    buf.put_i32(ecg);
                    buf.put_i32(ppg_green);
                    buf.put_i32(ppg_red);
                    buf.put_i32(ppg_ir);
                }
            },
            Message::RawPulseListChanged { ecgs, ppgs } => {
                buf.put_u8(u8::try_from(ecgs.len()).unwrap_or(u8::MAX));
                buf.put_u8(u8::try_from(ppgs.len()).unwrap_or(u8::MAX));
                for v in ecgs.iter().chain(ppgs) {
                    buf.put_i32(*v);
                }
            }
            Message::FileDataChunk {
                fileref,
                offset,
                file_data,
            } => {
                buf.put_u8(*fileref);
                buf.put_u32(*offset);
                buf.put_slice(file_data);
            }
        }
    }
}

#[cfg(test)]
mod tests;
