//! Request builders. Every function here is a pure byte producer.

use crate::constants::{
    AUTH_REQUEST_FLAGS, AUTH_REQUEST_MARKER, AUTH_STEP_CHALLENGE, AUTH_STEP_CONFIRM, FILE_GET_END, FILE_GET_OPCODE,
    FILE_GET_START, FILE_LOOKUP_MARKER, FILE_LOOKUP_OPCODE,
};
use crate::crypto::{BLOCK_SIZE, crc32};
use crate::handle::FileHandle;
use crate::session::RANDOM_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::IntoPrimitive;

/// Longest string field (including its NUL) a length byte can describe
const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Lookup request: `02 FF minor major`
pub fn file_lookup(handle: FileHandle) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(FILE_LOOKUP_OPCODE);
    buf.put_u8(FILE_LOOKUP_MARKER);
    buf.put_u16_le(handle.raw());
    buf.freeze()
}

/// Get request for the whole file: `01 minor major`, LE32 start, LE32 end
pub fn file_get(handle: FileHandle) -> Bytes {
    let mut buf = BytesMut::with_capacity(11);
    buf.put_u8(FILE_GET_OPCODE);
    buf.put_u16_le(handle.raw());
    buf.put_u32_le(FILE_GET_START);
    buf.put_u32_le(FILE_GET_END);
    buf.freeze()
}

/// Handshake step 1: `02 01 01 || phone_random`
pub fn auth_start(phone_random: &[u8; RANDOM_SIZE]) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + RANDOM_SIZE);
    buf.put_u8(AUTH_REQUEST_MARKER);
    buf.put_u8(AUTH_STEP_CHALLENGE);
    buf.put_u8(AUTH_REQUEST_FLAGS);
    buf.put_slice(phone_random);
    buf.freeze()
}

/// Handshake step 4: `02 02 01 || E(phone_random || watch_random)`
pub fn auth_confirm(encrypted: &[u8; BLOCK_SIZE]) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + BLOCK_SIZE);
    buf.put_u8(AUTH_REQUEST_MARKER);
    buf.put_u8(AUTH_STEP_CONFIRM);
    buf.put_u8(AUTH_REQUEST_FLAGS);
    buf.put_slice(encrypted);
    buf.freeze()
}

/// Kind of notification shown on the watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum NotificationType {
    IncomingCall = 0x01,
    Text = 0x02,
    Notification = 0x03,
    Email = 0x04,
    Calendar = 0x05,
    MissedCall = 0x06,
    Dismiss = 0x07,
}

/// Notification payload for the notification-play file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationType,
    pub flags: u8,
    pub message_id: u32,
    /// CRC32 of the originating package name, see [`package_crc`]
    pub package_crc: u32,
    pub title: String,
    pub sender: String,
    pub message: String,
}

/// CRC32 of an application package name as used by the notification filter
pub fn package_crc(package: &str) -> u32 {
    crc32(package.as_bytes())
}

/// UTF-8 string with NUL terminator, truncated on a char boundary to fit a length byte
fn nul_terminated(s: &str) -> Vec<u8> {
    let mut end = s.len().min(MAX_FIELD_LEN - 1);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut field = Vec::with_capacity(end + 1);
    field.extend_from_slice(&s.as_bytes()[..end]);
    field.push(0);
    field
}

/// Notification payload
///
/// Layout:
/// - LE16 total length
/// - header length (10), type, flags, uid length (4), package-CRC length (4)
/// - title, sender and message lengths (each including the NUL)
/// - LE32 message id, LE32 package CRC
/// - title, sender, message (NUL-terminated UTF-8)
pub fn play_notification(notification: &Notification) -> Bytes {
    const HEADER_LEN: u8 = 10;
    const UID_LEN: u8 = 4;
    const PACKAGE_CRC_LEN: u8 = 4;

    let title = nul_terminated(&notification.title);
    let sender = nul_terminated(&notification.sender);
    let message = nul_terminated(&notification.message);

    let total = HEADER_LEN as usize
        + UID_LEN as usize
        + PACKAGE_CRC_LEN as usize
        + title.len()
        + sender.len()
        + message.len();

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16_le(total as u16);
    buf.put_u8(HEADER_LEN);
    buf.put_u8(notification.kind.into());
    buf.put_u8(notification.flags);
    buf.put_u8(UID_LEN);
    buf.put_u8(PACKAGE_CRC_LEN);
    buf.put_u8(title.len() as u8);
    buf.put_u8(sender.len() as u8);
    buf.put_u8(message.len() as u8);
    buf.put_u32_le(notification.message_id);
    buf.put_u32_le(notification.package_crc);
    buf.put_slice(&title);
    buf.put_slice(&sender);
    buf.put_slice(&message);
    buf.freeze()
}

/// One alarm entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub hour: u8,
    pub minute: u8,
    /// Bit 0 = Sunday ... bit 6 = Saturday
    pub days: u8,
    pub repeat: bool,
    pub label: String,
    pub message: String,
}

const ALARM_TIME_TAG: u8 = 0x00;
const ALARM_LABEL_TAG: u8 = 0x01;
const ALARM_MESSAGE_TAG: u8 = 0x02;
const ALARM_REPEAT_FLAG: u8 = 0x80;

/// Alarm list payload
///
/// Each alarm is `00 || LE16 entry length` followed by tagged fields:
/// - `00 03 days minute hour` (bit 7 of `days` = repeat)
/// - `01 len label\0`
/// - `02 len message\0`
pub fn alarms(alarms: &[Alarm]) -> Bytes {
    let mut buf = BytesMut::new();
    for alarm in alarms {
        let label = nul_terminated(&alarm.label);
        let message = nul_terminated(&alarm.message);
        let entry_len = 5 + 2 + label.len() + 2 + message.len();

        let days = (alarm.days & 0x7F) | if alarm.repeat { ALARM_REPEAT_FLAG } else { 0 };

        buf.put_u8(0x00);
        buf.put_u16_le(entry_len as u16);
        buf.put_u8(ALARM_TIME_TAG);
        buf.put_u8(3);
        buf.put_u8(days);
        buf.put_u8(alarm.minute);
        buf.put_u8(alarm.hour);
        buf.put_u8(ALARM_LABEL_TAG);
        buf.put_u8(label.len() as u8);
        buf.put_slice(&label);
        buf.put_u8(ALARM_MESSAGE_TAG);
        buf.put_u8(message.len() as u8);
        buf.put_slice(&message);
    }
    buf.freeze()
}

/// Currently playing track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MusicInfo {
    pub revision: u8,
    pub title: String,
    pub artist: String,
    pub album: String,
}

/// Music info payload
///
/// LE16 total length, header length (8), revision, title/artist/album lengths,
/// then the three NUL-terminated strings.
pub fn music_info(info: &MusicInfo) -> Bytes {
    const HEADER_LEN: u8 = 8;

    let title = nul_terminated(&info.title);
    let artist = nul_terminated(&info.artist);
    let album = nul_terminated(&info.album);
    let total = HEADER_LEN as usize + title.len() + artist.len() + album.len();

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16_le(total as u16);
    buf.put_u8(HEADER_LEN);
    buf.put_u8(info.revision);
    buf.put_u8(title.len() as u8);
    buf.put_u8(artist.len() as u8);
    buf.put_u8(album.len() as u8);
    buf.put_u8(0x00);
    buf.put_slice(&title);
    buf.put_slice(&artist);
    buf.put_slice(&album);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::KnownFile;

    #[test]
    fn test_file_lookup_layout() {
        let request = file_lookup(KnownFile::ActivityFile.into());
        assert_eq!(request.as_ref(), &[0x02, 0xFF, 0x00, 0x01]);

        let request = file_lookup(FileHandle::new(0x07, 0x03));
        assert_eq!(request.as_ref(), &[0x02, 0xFF, 0x03, 0x07]);
    }

    #[test]
    fn test_file_get_layout() {
        let request = file_get(FileHandle::from_raw(0x0142));
        assert_eq!(hex::encode(&request), "01420100000000ffffffff");
    }

    #[test]
    fn test_auth_frames() {
        let start = auth_start(&[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(hex::encode(&start), "0201010001020304050607");

        let confirm = auth_confirm(&[0xAB; 16]);
        assert_eq!(confirm.len(), 19);
        assert_eq!(&confirm[..3], &[0x02, 0x02, 0x01]);
        assert_eq!(&confirm[3..], &[0xAB; 16]);
    }

    #[test]
    fn test_play_notification_layout() {
        let notification = Notification {
            kind: NotificationType::Text,
            flags: 0x02,
            message_id: 0x11223344,
            package_crc: 0xAABBCCDD,
            title: "Hi".to_string(),
            sender: "Bob".to_string(),
            message: "Yo".to_string(),
        };
        let payload = play_notification(&notification);
        // 10 + 4 + 4 + 3 + 4 + 3
        assert_eq!(payload.len(), 28);
        assert_eq!(u16::from_le_bytes([payload[0], payload[1]]), 28);
        assert_eq!(&payload[2..10], &[10, 0x02, 0x02, 4, 4, 3, 4, 3]);
        assert_eq!(&payload[10..14], &0x11223344u32.to_le_bytes());
        assert_eq!(&payload[14..18], &0xAABBCCDDu32.to_le_bytes());
        assert_eq!(&payload[18..], b"Hi\0Bob\0Yo\0");
    }

    #[test]
    fn test_long_fields_are_truncated_on_char_boundary() {
        let field = nul_terminated(&"é".repeat(200));
        assert!(field.len() <= MAX_FIELD_LEN);
        assert_eq!(*field.last().unwrap(), 0);
        assert!(std::str::from_utf8(&field[..field.len() - 1]).is_ok());
    }

    #[test]
    fn test_alarm_layout() {
        let payload = alarms(&[Alarm {
            hour: 7,
            minute: 30,
            days: 0b0111110,
            repeat: true,
            label: "Up".to_string(),
            message: "".to_string(),
        }]);
        assert_eq!(
            hex::encode(&payload),
            concat!("000d00", "0003", "be", "1e", "07", "0103", "557000", "0201", "00")
        );
    }

    #[test]
    fn test_music_info_layout() {
        let payload = music_info(&MusicInfo {
            revision: 3,
            title: "A".to_string(),
            artist: "B".to_string(),
            album: "".to_string(),
        });
        assert_eq!(hex::encode(&payload), "0d000803020201004100420000");
    }

    #[test]
    fn test_package_crc() {
        assert_eq!(package_crc("123456789"), 0xCBF43926);
    }
}
