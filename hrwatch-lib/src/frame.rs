//! Wire framing for the operations, data and authentication channels.
//!
//! Control frames (operations channel):
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 1    | low nibble: response type, high: flags  |
//! | 1      | 1    | handle minor (echo)                     |
//! | 2      | 1    | handle major (echo)                     |
//! | 3      | 1    | status (0 = ok)                         |
//! | 4      | 4    | LE32 size (init and completion frames)  |
//! | 8      | 4    | LE32 CRC32 (completion frames)          |
//!
//! Data packets (data channel) start with a one-byte header: bit 7 is the
//! last-packet flag and the low seven bits count packets. In the encrypted
//! get phase the header is part of the ciphertext.

use crate::constants::{
    AUTH_HEADER_SIZE, AUTH_RESPONSE_MARKER, AUTH_STEP_CHALLENGE, AUTH_STEP_CONFIRM, COMPLETE_FRAME_SIZE,
    CONTROL_HEADER_SIZE, INIT_FRAME_SIZE,
};
use crate::crypto::BLOCK_SIZE;
use crate::error::FrameError;
use crate::handle::FileHandle;
use bytes::{Buf, Bytes};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// First byte of a control frame
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseHeader {
    pub response_type: B4,
    pub flags: B4,
}

/// Header byte of a data packet
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketHeader {
    pub index: B7,
    pub last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ResponseType {
    GetInit = 0x01,
    LookupInit = 0x02,
    Complete = 0x08,

    #[num_enum(catch_all)]
    Other(u8),
}

impl ResponseType {
    /// Classify a control frame by the low nibble of its first byte
    pub fn of(frame: &[u8]) -> Option<ResponseType> {
        let first = *frame.first()?;
        let header = ResponseHeader::from_bytes([first]);
        Some(ResponseType::from_primitive(header.response_type()))
    }
}

/// Common 4-byte control frame header
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ControlHeaderRaw {
    pub header: u8,
    pub minor: u8,
    pub major: u8,
    pub status: u8,
}

/// Lookup-init and get-init frames (8 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct InitFrameRaw {
    pub head: ControlHeaderRaw,
    pub size: U32,
}

/// Completion frames (12 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CompleteFrameRaw {
    pub head: ControlHeaderRaw,
    pub size: U32,
    pub crc: U32,
}

/// A control frame from the operations channel
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFrame {
    pub kind: ResponseType,
    pub handle: FileHandle,
    pub status: u8,
    raw: Bytes,
}

impl ControlFrame {
    /// Parse the 4-byte header; size and CRC are read on demand
    pub fn parse(raw: Bytes) -> Result<Self, FrameError> {
        let kind = ResponseType::of(&raw).ok_or(FrameError::Empty)?;
        let (head, _) = ControlHeaderRaw::ref_from_prefix(raw.as_ref()).map_err(|_| FrameError::InsufficientData {
            expected: CONTROL_HEADER_SIZE,
            actual: raw.len(),
        })?;
        let handle = FileHandle::new(head.major, head.minor);
        let status = head.status;
        Ok(Self {
            kind,
            handle,
            status,
            raw,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == crate::constants::STATUS_OK
    }

    /// Declared size at offset 4 (init frames)
    pub fn size(&self) -> Result<u32, FrameError> {
        let (frame, _) =
            InitFrameRaw::ref_from_prefix(self.raw.as_ref()).map_err(|_| FrameError::InsufficientData {
                expected: INIT_FRAME_SIZE,
                actual: self.raw.len(),
            })?;
        Ok(frame.size.get())
    }

    /// Declared CRC32 at offset 8 (completion frames)
    pub fn crc(&self) -> Result<u32, FrameError> {
        let (frame, _) =
            CompleteFrameRaw::ref_from_prefix(self.raw.as_ref()).map_err(|_| FrameError::InsufficientData {
                expected: COMPLETE_FRAME_SIZE,
                actual: self.raw.len(),
            })?;
        Ok(frame.crc.get())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// Split a data packet into its header and payload
pub fn split_packet(packet: &[u8]) -> Result<(PacketHeader, &[u8]), FrameError> {
    let (&first, payload) = packet.split_first().ok_or(FrameError::Empty)?;
    Ok((PacketHeader::from_bytes([first]), payload))
}

/// Response on the authentication channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// Step 2: encrypted `watch_random || phone_random`
    Challenge { status: u8, payload: [u8; BLOCK_SIZE] },
    /// Step 5: final verdict
    Status(u8),
}

impl TryFrom<Bytes> for AuthResponse {
    type Error = FrameError;

    fn try_from(mut bytes: Bytes) -> Result<Self, Self::Error> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        if bytes.remaining() < AUTH_HEADER_SIZE {
            return Err(FrameError::InsufficientData {
                expected: AUTH_HEADER_SIZE,
                actual: bytes.remaining(),
            });
        }
        let marker = bytes.get_u8();
        if marker != AUTH_RESPONSE_MARKER {
            return Err(FrameError::Unexpected(format!("auth marker 0x{:02X}", marker)));
        }
        let step = bytes.get_u8();
        let _flags = bytes.get_u8();
        let status = bytes.get_u8();

        match step {
            AUTH_STEP_CHALLENGE => {
                if bytes.remaining() < BLOCK_SIZE {
                    // A rejection may come without the encrypted block.
                    if status != crate::constants::STATUS_OK {
                        return Ok(AuthResponse::Challenge {
                            status,
                            payload: [0u8; BLOCK_SIZE],
                        });
                    }
                    return Err(FrameError::InsufficientData {
                        expected: AUTH_HEADER_SIZE + BLOCK_SIZE,
                        actual: AUTH_HEADER_SIZE + bytes.remaining(),
                    });
                }
                let mut payload = [0u8; BLOCK_SIZE];
                bytes.copy_to_slice(&mut payload);
                Ok(AuthResponse::Challenge { status, payload })
            }
            AUTH_STEP_CONFIRM => Ok(AuthResponse::Status(status)),
            other => Err(FrameError::Unexpected(format!("auth step 0x{:02X}", other))),
        }
    }
}
