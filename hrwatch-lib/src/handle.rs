use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use std::str::FromStr;

/// Logical file identifier: `(major << 8) | minor`
///
/// On the wire it is sent little-endian, i.e. minor first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(u16);

impl FileHandle {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self(((major as u16) << 8) | minor as u16)
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u16 {
        self.0
    }

    pub const fn major(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn minor(&self) -> u8 {
        self.0 as u8
    }

    /// The catalog entry for this handle, if it is a static one
    pub fn known(&self) -> Option<KnownFile> {
        KnownFile::try_from(self.0).ok()
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.known() {
            Some(known) => write!(f, "{} (0x{:04X})", known, self.0),
            None => write!(f, "0x{:04X}", self.0),
        }
    }
}

impl From<KnownFile> for FileHandle {
    fn from(file: KnownFile) -> Self {
        Self(file.into())
    }
}

impl FromStr for FileHandle {
    type Err = String;

    /// Accepts a catalog name (`activity_file`, case-insensitive) or a hex value (`0x0100`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u16::from_str_radix(hex, 16)
                .map(FileHandle)
                .map_err(|e| format!("invalid handle '{}': {}", s, e));
        }
        KnownFile::ALL
            .iter()
            .find(|k| k.to_string().eq_ignore_ascii_case(s))
            .map(|k| FileHandle::from(*k))
            .ok_or_else(|| format!("unknown file handle '{}'", s))
    }
}

/// Static catalog of file handles exposed by the watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u16)]
pub enum KnownFile {
    Ota = 0x0000,
    ActivityFile = 0x0100,
    HardwareLog = 0x0200,
    FontFile = 0x0300,
    MusicInfo = 0x0400,
    UiControl = 0x0500,
    HandActions = 0x0600,
    AssetBackgroundImages = 0x0700,
    AssetNotificationImages = 0x0701,
    AssetTranslations = 0x0702,
    AssetReplyImages = 0x0703,
    Configuration = 0x0800,
    NotificationPlay = 0x0900,
    Alarms = 0x0A00,
    DeviceInfo = 0x0B00,
    NotificationFilter = 0x0C00,
    WatchParameters = 0x0E00,
    LookUpTable = 0x0F00,
    Rate = 0x1000,
    ReplyMessages = 0x1300,
    AppCode = 0x1500,
}

impl KnownFile {
    pub const ALL: [KnownFile; 21] = [
        KnownFile::Ota,
        KnownFile::ActivityFile,
        KnownFile::HardwareLog,
        KnownFile::FontFile,
        KnownFile::MusicInfo,
        KnownFile::UiControl,
        KnownFile::HandActions,
        KnownFile::AssetBackgroundImages,
        KnownFile::AssetNotificationImages,
        KnownFile::AssetTranslations,
        KnownFile::AssetReplyImages,
        KnownFile::Configuration,
        KnownFile::NotificationPlay,
        KnownFile::Alarms,
        KnownFile::DeviceInfo,
        KnownFile::NotificationFilter,
        KnownFile::WatchParameters,
        KnownFile::LookUpTable,
        KnownFile::Rate,
        KnownFile::ReplyMessages,
        KnownFile::AppCode,
    ];
}
