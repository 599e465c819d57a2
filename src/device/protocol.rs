//! Fixed-size HID report codec.
//!
//! Every report carries 64 payload bytes and is written with report id
//! `0x01` in front. Byte 0 is the message type; fields follow little endian
//! and the rest is zero padded.
//!
//! | type | code | fields |
//! |---|---|---|
//! | ButtonPress / ButtonRelease | `0x01` / `0x02` | button u8 |
//! | LedSet | `0x10` | button u8, color GRBW 4 bytes |
//! | LedSetBulk | `0x11` | present-mask u16, 10 x color GRBW |
//! | VersionQuery / VersionReply | `0x20` / `0x21` | major, minor, patch, variant |
//! | Heartbeat | `0x30` | none |
//! | UpdateBegin | `0x40` | size u32, CRC-32 u32, version 3 bytes |
//! | UpdateChunk | `0x41` | seq u16, len u8, CRC-16/X.25 u16, data |
//! | UpdateEnd | `0x42` | none |
//! | Ack / Nack | `0x50` / `0x51` | seq u16, CRC-32 u32 / reason u8 |

use crate::error::{PadError, Result};
use crate::event::{ButtonId, LedColor, BUTTON_COUNT};
use crate::state::HardwareVariant;
use crate::update::FirmwareVersion;
use crc::{crc16, Hasher16};

pub const REPORT_SIZE: usize = 64;
pub const REPORT_ID: u8 = 0x01;

/// Firmware bytes per `UpdateChunk`.
pub const CHUNK_SIZE: usize = 58;

/// Sequence number the device uses to acknowledge `UpdateBegin`.
pub const BEGIN_ACK_SEQ: u16 = 0xFFFF;

const BUTTON_PRESS: u8 = 0x01;
const BUTTON_RELEASE: u8 = 0x02;
const LED_SET: u8 = 0x10;
const LED_SET_BULK: u8 = 0x11;
const VERSION_QUERY: u8 = 0x20;
const VERSION_REPLY: u8 = 0x21;
const HEARTBEAT: u8 = 0x30;
const UPDATE_BEGIN: u8 = 0x40;
const UPDATE_CHUNK: u8 = 0x41;
const UPDATE_END: u8 = 0x42;
const ACK: u8 = 0x50;
const NACK: u8 = 0x51;

pub type Report = [u8; REPORT_SIZE];

/// One protocol message, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ButtonPress(ButtonId),
    ButtonRelease(ButtonId),
    LedSet(ButtonId, LedColor),
    /// Indexed by `ButtonId::index`; `None` leaves that LED alone.
    LedSetBulk([Option<LedColor>; BUTTON_COUNT as usize]),
    VersionQuery,
    VersionReply {
        version: FirmwareVersion,
        variant: HardwareVariant,
    },
    Heartbeat,
    UpdateBegin {
        size: u32,
        crc32: u32,
        version: FirmwareVersion,
    },
    UpdateChunk {
        seq: u16,
        data: Vec<u8>,
    },
    UpdateEnd,
    Ack {
        seq: u16,
        crc32: u32,
    },
    Nack {
        seq: u16,
        reason: u8,
    },
}

/// GRBW brightness bytes the firmware expects for a color.
pub fn color_bytes(color: LedColor) -> [u8; 4] {
    match color {
        LedColor::Red => [0x00, 0x0A, 0x00, 0x00],
        LedColor::Green => [0x0A, 0x00, 0x00, 0x00],
        LedColor::Blue => [0x00, 0x00, 0x0A, 0x00],
        LedColor::White => [0x00, 0x00, 0x00, 0x0A],
        LedColor::Black => [0x00, 0x00, 0x00, 0x00],
        LedColor::Yellow => [0x0A, 0x0A, 0x00, 0x00],
        LedColor::Cyan => [0x0A, 0x00, 0x0A, 0x00],
        LedColor::Magenta => [0x00, 0x0A, 0x0A, 0x00],
        LedColor::Orange => [0x08, 0x0A, 0x00, 0x00],
        LedColor::Purple => [0x00, 0x09, 0x09, 0x00],
    }
}

fn color_from_bytes(bytes: &[u8]) -> Result<LedColor> {
    LedColor::ALL
        .into_iter()
        .find(|c| color_bytes(*c) == bytes)
        .ok_or_else(|| PadError::Protocol(format!("unknown color bytes {bytes:02x?}")))
}

pub fn chunk_checksum(data: &[u8]) -> u16 {
    let mut digest = crc16::Digest::new(crc16::X25);
    digest.write(data);
    digest.sum16()
}

fn button(byte: u8) -> Result<ButtonId> {
    ButtonId::new(byte).ok_or_else(|| PadError::Protocol(format!("button {byte} out of range")))
}

fn u16_at(report: &Report, at: usize) -> u16 {
    u16::from_le_bytes([report[at], report[at + 1]])
}

fn u32_at(report: &Report, at: usize) -> u32 {
    u32::from_le_bytes([report[at], report[at + 1], report[at + 2], report[at + 3]])
}

impl Frame {
    pub fn encode(&self) -> Result<Report> {
        let mut out = [0u8; REPORT_SIZE];
        match self {
            Frame::ButtonPress(b) => {
                out[0] = BUTTON_PRESS;
                out[1] = b.get();
            }
            Frame::ButtonRelease(b) => {
                out[0] = BUTTON_RELEASE;
                out[1] = b.get();
            }
            Frame::LedSet(b, color) => {
                out[0] = LED_SET;
                out[1] = b.get();
                out[2..6].copy_from_slice(&color_bytes(*color));
            }
            Frame::LedSetBulk(colors) => {
                out[0] = LED_SET_BULK;
                let mut mask = 0u16;
                for (i, color) in colors.iter().enumerate() {
                    if let Some(color) = color {
                        mask |= 1 << i;
                        let at = 3 + i * 4;
                        out[at..at + 4].copy_from_slice(&color_bytes(*color));
                    }
                }
                out[1..3].copy_from_slice(&mask.to_le_bytes());
            }
            Frame::VersionQuery => out[0] = VERSION_QUERY,
            Frame::VersionReply { version, variant } => {
                out[0] = VERSION_REPLY;
                out[1] = version.major;
                out[2] = version.minor;
                out[3] = version.patch;
                out[4] = variant.as_byte();
            }
            Frame::Heartbeat => out[0] = HEARTBEAT,
            Frame::UpdateBegin {
                size,
                crc32,
                version,
            } => {
                out[0] = UPDATE_BEGIN;
                out[1..5].copy_from_slice(&size.to_le_bytes());
                out[5..9].copy_from_slice(&crc32.to_le_bytes());
                out[9] = version.major;
                out[10] = version.minor;
                out[11] = version.patch;
            }
            Frame::UpdateChunk { seq, data } => {
                if data.len() > CHUNK_SIZE {
                    return Err(PadError::Protocol(format!(
                        "chunk of {} bytes exceeds {CHUNK_SIZE}",
                        data.len()
                    )));
                }
                out[0] = UPDATE_CHUNK;
                out[1..3].copy_from_slice(&seq.to_le_bytes());
                out[3] = data.len() as u8;
                out[4..6].copy_from_slice(&chunk_checksum(data).to_le_bytes());
                out[6..6 + data.len()].copy_from_slice(data);
            }
            Frame::UpdateEnd => out[0] = UPDATE_END,
            Frame::Ack { seq, crc32 } => {
                out[0] = ACK;
                out[1..3].copy_from_slice(&seq.to_le_bytes());
                out[3..7].copy_from_slice(&crc32.to_le_bytes());
            }
            Frame::Nack { seq, reason } => {
                out[0] = NACK;
                out[1..3].copy_from_slice(&seq.to_le_bytes());
                out[3] = *reason;
            }
        }
        Ok(out)
    }

    pub fn decode(report: &Report) -> Result<Frame> {
        let frame = match report[0] {
            BUTTON_PRESS => Frame::ButtonPress(button(report[1])?),
            BUTTON_RELEASE => Frame::ButtonRelease(button(report[1])?),
            LED_SET => Frame::LedSet(button(report[1])?, color_from_bytes(&report[2..6])?),
            LED_SET_BULK => {
                let mask = u16_at(report, 1);
                let mut colors = [None; BUTTON_COUNT as usize];
                for (i, slot) in colors.iter_mut().enumerate() {
                    if mask & (1 << i) != 0 {
                        let at = 3 + i * 4;
                        *slot = Some(color_from_bytes(&report[at..at + 4])?);
                    }
                }
                Frame::LedSetBulk(colors)
            }
            VERSION_QUERY => Frame::VersionQuery,
            VERSION_REPLY => Frame::VersionReply {
                version: FirmwareVersion::new(report[1], report[2], report[3]),
                variant: HardwareVariant::from_byte(report[4]),
            },
            HEARTBEAT => Frame::Heartbeat,
            UPDATE_BEGIN => Frame::UpdateBegin {
                size: u32_at(report, 1),
                crc32: u32_at(report, 5),
                version: FirmwareVersion::new(report[9], report[10], report[11]),
            },
            UPDATE_CHUNK => {
                let len = usize::from(report[3]);
                if len > CHUNK_SIZE {
                    return Err(PadError::Protocol(format!("chunk length {len} too large")));
                }
                let data = report[6..6 + len].to_vec();
                let crc = u16_at(report, 4);
                if crc != chunk_checksum(&data) {
                    return Err(PadError::Protocol("chunk checksum mismatch".to_string()));
                }
                Frame::UpdateChunk {
                    seq: u16_at(report, 1),
                    data,
                }
            }
            UPDATE_END => Frame::UpdateEnd,
            ACK => Frame::Ack {
                seq: u16_at(report, 1),
                crc32: u32_at(report, 3),
            },
            NACK => Frame::Nack {
                seq: u16_at(report, 1),
                reason: report[3],
            },
            other => {
                return Err(PadError::Protocol(format!(
                    "unknown message type 0x{other:02x}"
                )))
            }
        };
        Ok(frame)
    }
}
