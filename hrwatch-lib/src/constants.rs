// Protocol constants for the hybrid watch file and authentication channels

use std::ops::RangeInclusive;

/// Opcode of a file get request (also the get-init response type)
pub const FILE_GET_OPCODE: u8 = 0x01;

/// Opcode of a file lookup request (also the lookup-init response type)
pub const FILE_LOOKUP_OPCODE: u8 = 0x02;

/// Second byte of a lookup request
pub const FILE_LOOKUP_MARKER: u8 = 0xFF;

/// Get requests always ask for the whole file: start offset...
pub const FILE_GET_START: u32 = 0x0000_0000;

/// ...up to the maximum end offset
pub const FILE_GET_END: u32 = 0xFFFF_FFFF;

/// Size of the common control frame header (type, minor, major, status)
pub const CONTROL_HEADER_SIZE: usize = 4;

/// Size of an init frame (header + LE32 size)
pub const INIT_FRAME_SIZE: usize = 8;

/// Size of a completion frame (header + LE32 size + LE32 CRC)
pub const COMPLETE_FRAME_SIZE: usize = 12;

/// Status byte meaning "ok" in control and authentication frames
pub const STATUS_OK: u8 = 0x00;

/// Bit 7 of a data packet header marks the last packet
pub const LAST_PACKET_FLAG: u8 = 0x80;

/// First byte of every authentication request
pub const AUTH_REQUEST_MARKER: u8 = 0x02;

/// First byte of every authentication response
pub const AUTH_RESPONSE_MARKER: u8 = 0x03;

/// Handshake step: phone random / encrypted challenge
pub const AUTH_STEP_CHALLENGE: u8 = 0x01;

/// Handshake step: encrypted confirmation / status
pub const AUTH_STEP_CONFIRM: u8 = 0x02;

/// Third byte of authentication requests
pub const AUTH_REQUEST_FLAGS: u8 = 0x01;

/// Size of the authentication frame header (marker, step, flags, status)
pub const AUTH_HEADER_SIZE: usize = 4;

/// Candidate counter increments tried on the second encrypted packet
pub const IV_INCREMENT_SEARCH: RangeInclusive<u64> = 0x1E..=0x2F;

/// Expected decrypted header of the second packet when more packets follow
pub const SECOND_PACKET_HEADER: u8 = 0x01;

/// Expected decrypted header of the second packet when it completes the file
pub const SECOND_PACKET_LAST_HEADER: u8 = SECOND_PACKET_HEADER | LAST_PACKET_FLAG;
