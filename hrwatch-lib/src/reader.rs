//! File reader
//!
//! A fetch runs in two phases over the operations and data channels:
//!
//! 1. **Lookup**: `02 FF minor major` for the static handle. The watch answers
//!    with a lookup-init frame (size), data packets and a completion frame
//!    (CRC). The first two payload bytes are the dynamic handle, little-endian.
//! 2. **Get**: `01 minor major 00000000 FFFFFFFF` for the dynamic handle.
//!    Get-init (size), data packets, completion (CRC over the plaintext).
//!
//! In an encrypted get each data packet, header byte included, is AES-128-CTR
//! ciphertext. Packet 0 uses the file IV as is. The counter step between
//! packets is not announced; it is found by trial-decrypting packet 1 with
//! every increment in [`IV_INCREMENT_SEARCH`] until its header decrypts to the
//! expected `0x01` (or `0x81` when it completes the file). Packet `n >= 2`
//! then uses `iv + step * n`.
//!
//! [`EncryptedReadState`] is the protocol logic with no I/O: it takes
//! [`ReadEvent`]s and returns [`Effect`]s. [`EncryptedFileReader`] drives it
//! over a [`Transport`].

use crate::auth::SessionVerifier;
use crate::config::SessionConfig;
use crate::constants::{IV_INCREMENT_SEARCH, SECOND_PACKET_HEADER, SECOND_PACKET_LAST_HEADER};
use crate::crypto::{BLOCK_SIZE, aes_ctr_apply, crc32, increment_iv};
use crate::error::FileTransferError;
use crate::frame::{ControlFrame, ResponseType, split_packet};
use crate::handle::FileHandle;
use crate::request;
use crate::session::{SessionKey, SessionRandoms};
use crate::transport::{Channel, Notification, NotificationStream, Transport};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Sub-state of a transfer phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Stage {
    AwaitingInit,
    AwaitingData,
}

/// Where a fetch currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    Idle,
    Lookup(Stage),
    Get(Stage),
    Completed,
    Failed,
}

impl ReadPhase {
    /// Short name used in timeout errors and logs
    pub fn label(&self) -> &'static str {
        match self {
            ReadPhase::Idle => "idle",
            ReadPhase::Lookup(_) => "lookup",
            ReadPhase::Get(_) => "file get",
            ReadPhase::Completed => "completed",
            ReadPhase::Failed => "failed",
        }
    }

    fn is_active(&self) -> bool {
        matches!(self, ReadPhase::Lookup(_) | ReadPhase::Get(_))
    }
}

impl std::fmt::Display for ReadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadPhase::Lookup(stage) | ReadPhase::Get(stage) => write!(f, "{} ({})", self.label(), stage),
            _ => f.write_str(self.label()),
        }
    }
}

/// Input to the read state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ReadEvent {
    /// Frame from the operations channel
    Control(ControlFrame),
    /// Packet from the data channel
    Data(Bytes),
}

impl ReadEvent {
    /// Classify a transport notification; other channels yield `None`
    pub fn from_notification(notification: Notification) -> Result<Option<ReadEvent>, FileTransferError> {
        match notification.channel {
            Channel::Operations => match ResponseType::of(&notification.value) {
                // Unknown types may be shorter than a control header
                Some(ResponseType::Other(kind)) => {
                    trace!("Ignoring control frame type {:#04x}", kind);
                    Ok(None)
                }
                _ => Ok(Some(ReadEvent::Control(ControlFrame::parse(notification.value)?))),
            },
            Channel::Data => Ok(Some(ReadEvent::Data(notification.value))),
            Channel::Authentication => Ok(None),
        }
    }
}

/// What the driver has to do after an event
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    None,
    /// Lookup finished: request the file under this dynamic handle
    SendGetRequest(FileHandle),
    /// Get-init received with the declared file size
    FileSizeKnown(u32),
    Progress { received: usize, total: u32 },
    /// The file, CRC-checked
    Completed(Bytes),
}

#[derive(Clone, Copy)]
struct CipherContext {
    key: SessionKey,
    base_iv: [u8; BLOCK_SIZE],
}

/// State of one fetch: lookup buffer, file buffer and decryption context
pub struct EncryptedReadState {
    phase: ReadPhase,
    handle: FileHandle,
    dynamic_handle: Option<FileHandle>,
    lookup_expected_size: u32,
    lookup_buffer: BytesMut,
    file_size: u32,
    file_buffer: BytesMut,
    cipher: Option<CipherContext>,
    packet_count: u64,
    iv_incrementor: Option<u64>,
}

impl EncryptedReadState {
    /// Fetch whose get phase is encrypted under the given session
    pub fn encrypted(handle: FileHandle, key: SessionKey, randoms: &SessionRandoms) -> Self {
        let mut state = Self::plain(handle);
        state.cipher = Some(CipherContext {
            key,
            base_iv: randoms.file_iv().0,
        });
        state
    }

    /// Fetch whose get phase is sent in the clear
    pub fn plain(handle: FileHandle) -> Self {
        Self {
            phase: ReadPhase::Idle,
            handle,
            dynamic_handle: None,
            lookup_expected_size: 0,
            lookup_buffer: BytesMut::new(),
            file_size: 0,
            file_buffer: BytesMut::new(),
            cipher: None,
            packet_count: 0,
            iv_incrementor: None,
        }
    }

    pub fn phase(&self) -> ReadPhase {
        self.phase
    }

    pub fn dynamic_handle(&self) -> Option<FileHandle> {
        self.dynamic_handle
    }

    /// Counter step found on packet 1 of the get phase
    pub fn iv_incrementor(&self) -> Option<u64> {
        self.iv_incrementor
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Enter the lookup phase and return the request to write
    pub fn start(&mut self) -> Bytes {
        self.phase = ReadPhase::Lookup(Stage::AwaitingInit);
        self.packet_count = 0;
        request::file_lookup(self.handle)
    }

    /// Drop buffers and key material; the state is unusable afterwards
    pub fn fail(&mut self) {
        self.phase = ReadPhase::Failed;
        self.lookup_buffer.clear();
        self.file_buffer.clear();
        self.cipher = None;
    }

    /// Feed one event. Any error is terminal and moves the state to `Failed`.
    pub fn handle(&mut self, event: ReadEvent) -> Result<Effect, FileTransferError> {
        let result = match event {
            ReadEvent::Control(frame) => self.handle_control(frame),
            ReadEvent::Data(packet) => self.handle_data(&packet),
        };
        if result.is_err() {
            self.fail();
        }
        result
    }

    fn handle_control(&mut self, frame: ControlFrame) -> Result<Effect, FileTransferError> {
        if let ResponseType::Other(kind) = frame.kind {
            trace!("Ignoring control frame type 0x{:X}", kind);
            return Ok(Effect::None);
        }
        if !self.phase.is_active() {
            debug!("Control frame outside a transfer ({}): {}", self.phase, hex::encode(frame.as_bytes()));
            return Ok(Effect::None);
        }
        if !frame.is_ok() {
            return Err(FileTransferError::Rejected(frame.status));
        }

        match (self.phase, frame.kind) {
            (ReadPhase::Lookup(Stage::AwaitingInit), ResponseType::LookupInit) => {
                let size = frame.size()?;
                if size == 0 {
                    return Err(FileTransferError::EmptyFile);
                }
                debug!("Lookup of {} returns {} bytes", self.handle, size);
                self.lookup_expected_size = size;
                self.lookup_buffer = BytesMut::with_capacity(size as usize);
                self.phase = ReadPhase::Lookup(Stage::AwaitingData);
                Ok(Effect::None)
            }
            (ReadPhase::Lookup(Stage::AwaitingData), ResponseType::Complete) => {
                let expected = frame.crc()?;
                let actual = crc32(&self.lookup_buffer);
                if expected != actual {
                    return Err(FileTransferError::InvalidCRC { expected, actual });
                }
                if self.lookup_buffer.len() < 2 {
                    return Err(FileTransferError::InvalidResponse(format!(
                        "lookup returned {} bytes, need 2 for the handle",
                        self.lookup_buffer.len()
                    )));
                }
                let dynamic = FileHandle::from_raw(u16::from_le_bytes([self.lookup_buffer[0], self.lookup_buffer[1]]));
                debug!("{} resolved to dynamic handle {}", self.handle, dynamic);
                self.dynamic_handle = Some(dynamic);
                self.packet_count = 0;
                self.phase = ReadPhase::Get(Stage::AwaitingInit);
                Ok(Effect::SendGetRequest(dynamic))
            }
            (ReadPhase::Get(Stage::AwaitingInit), ResponseType::GetInit) => {
                let expected = self.dynamic_handle.map(|h| h.raw()).unwrap_or_default();
                if frame.handle.raw() != expected {
                    return Err(FileTransferError::UnexpectedHandle {
                        expected,
                        actual: frame.handle.raw(),
                    });
                }
                let size = frame.size()?;
                if size == 0 {
                    return Err(FileTransferError::EmptyFile);
                }
                debug!("Get of 0x{:04X} returns {} bytes", expected, size);
                self.file_size = size;
                self.file_buffer = BytesMut::with_capacity(size as usize);
                self.phase = ReadPhase::Get(Stage::AwaitingData);
                Ok(Effect::FileSizeKnown(size))
            }
            (ReadPhase::Get(Stage::AwaitingData), ResponseType::Complete) => {
                let expected = frame.crc()?;
                let actual = crc32(&self.file_buffer);
                if expected != actual {
                    return Err(FileTransferError::InvalidCRC { expected, actual });
                }
                self.phase = ReadPhase::Completed;
                self.cipher = None;
                Ok(Effect::Completed(self.file_buffer.split().freeze()))
            }
            (phase, kind) => Err(FileTransferError::InvalidResponse(format!(
                "unexpected {:?} frame during {}",
                kind, phase
            ))),
        }
    }

    fn handle_data(&mut self, packet: &[u8]) -> Result<Effect, FileTransferError> {
        match self.phase {
            ReadPhase::Lookup(Stage::AwaitingData) => {
                let (_, payload) = split_packet(packet)?;
                append_checked(&mut self.lookup_buffer, payload, self.lookup_expected_size, "lookup")?;
                self.packet_count += 1;
                Ok(Effect::None)
            }
            ReadPhase::Get(Stage::AwaitingData) => {
                if self.cipher.is_some() {
                    let decrypted = self.decrypt_packet(packet)?;
                    let (_, payload) = split_packet(&decrypted)?;
                    append_checked(&mut self.file_buffer, payload, self.file_size, "file")?;
                } else {
                    let (_, payload) = split_packet(packet)?;
                    append_checked(&mut self.file_buffer, payload, self.file_size, "file")?;
                }
                self.packet_count += 1;
                Ok(Effect::Progress {
                    received: self.file_buffer.len(),
                    total: self.file_size,
                })
            }
            phase => {
                debug!("Dropping {} byte data packet during {}", packet.len(), phase);
                Ok(Effect::None)
            }
        }
    }

    /// Decrypt one get-phase packet, discovering the counter step on packet 1
    fn decrypt_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>, FileTransferError> {
        let ctx = self.cipher.ok_or(FileTransferError::MissingEncryptionContext)?;
        let Some(&first) = packet.first() else {
            return Err(FileTransferError::InvalidResponse("empty data packet".to_string()));
        };

        let iv = match (self.packet_count, self.iv_incrementor) {
            (0, _) => ctx.base_iv,
            (1, _) => {
                let payload_len = packet.len() - 1;
                let completes = self.file_buffer.len() + payload_len == self.file_size as usize;
                let expected = if completes {
                    SECOND_PACKET_LAST_HEADER
                } else {
                    SECOND_PACKET_HEADER
                };
                let step = IV_INCREMENT_SEARCH
                    .find(|&step| {
                        let mut header = [first];
                        aes_ctr_apply(ctx.key.as_bytes(), &increment_iv(&ctx.base_iv, step), &mut header);
                        header[0] == expected
                    })
                    .ok_or(FileTransferError::InvalidDecryption)?;
                debug!("Counter increment 0x{:02X}", step);
                self.iv_incrementor = Some(step);
                increment_iv(&ctx.base_iv, step)
            }
            (n, Some(step)) => increment_iv(&ctx.base_iv, step.wrapping_mul(n)),
            (_, None) => return Err(FileTransferError::InvalidDecryption),
        };

        let mut decrypted = packet.to_vec();
        aes_ctr_apply(ctx.key.as_bytes(), &iv, &mut decrypted);
        trace!(index = self.packet_count, header = decrypted[0], "Decrypted packet");
        Ok(decrypted)
    }
}

fn append_checked(buffer: &mut BytesMut, payload: &[u8], declared: u32, what: &str) -> Result<(), FileTransferError> {
    if buffer.len() + payload.len() > declared as usize {
        return Err(FileTransferError::InvalidResponse(format!(
            "{} data exceeds declared size {} ({} + {})",
            what,
            declared,
            buffer.len(),
            payload.len()
        )));
    }
    buffer.extend_from_slice(payload);
    Ok(())
}

/// Hooks for transfer progress, e.g. a progress bar
pub trait TransferObserver: Send + Sync {
    fn on_phase(&self, _phase: ReadPhase) {}

    fn on_progress(&self, _received: usize, _total: u32) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// Runs fetches over a transport for one authenticated session
pub struct EncryptedFileReader {
    transport: Arc<dyn Transport>,
    session: Arc<dyn SessionVerifier>,
    config: SessionConfig,
    observer: Arc<dyn TransferObserver>,
}

impl EncryptedFileReader {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<dyn SessionVerifier>, config: SessionConfig) -> Self {
        Self {
            transport,
            session,
            config,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Fetch and decrypt a file
    ///
    /// Re-runs the handshake first so the file is encrypted under fresh randoms.
    pub async fn fetch_encrypted_file(&mut self, handle: FileHandle) -> Result<Bytes, FileTransferError> {
        self.fetch_encrypted_file_with_cancel(handle, CancellationToken::new())
            .await
    }

    pub async fn fetch_encrypted_file_with_cancel(
        &mut self,
        handle: FileHandle,
        cancel: CancellationToken,
    ) -> Result<Bytes, FileTransferError> {
        if !self.session.is_authenticated() {
            return Err(FileTransferError::NotAuthenticated);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FileTransferError::Cancelled),
            verified = self.session.verify_authentication() => verified?,
        }

        let key = self
            .session
            .current_key()
            .ok_or(FileTransferError::MissingEncryptionContext)?;
        let randoms = self
            .session
            .current_randoms()
            .ok_or(FileTransferError::MissingEncryptionContext)?;

        info!("Fetching encrypted file {}", handle);
        debug!("File IV {}", randoms.file_iv());
        self.run(EncryptedReadState::encrypted(handle, key, &randoms), cancel)
            .await
    }

    /// Fetch a file whose content is not encrypted; no authentication needed
    pub async fn fetch_file(&mut self, handle: FileHandle) -> Result<Bytes, FileTransferError> {
        self.fetch_file_with_cancel(handle, CancellationToken::new()).await
    }

    pub async fn fetch_file_with_cancel(
        &mut self,
        handle: FileHandle,
        cancel: CancellationToken,
    ) -> Result<Bytes, FileTransferError> {
        info!("Fetching file {}", handle);
        self.run(EncryptedReadState::plain(handle), cancel).await
    }

    async fn run(&mut self, mut state: EncryptedReadState, cancel: CancellationToken) -> Result<Bytes, FileTransferError> {
        let channels = [Channel::Operations, Channel::Data];
        // Subscribe before the first write so no response can be missed.
        let mut rx = self
            .transport
            .subscribe(&channels)
            .await
            .map_err(FileTransferError::Subscribe)?;

        let result = self.drive(&mut state, &mut rx, &cancel).await;

        match &result {
            Ok(file) => info!("Received {} bytes", file.len()),
            Err(e) => {
                state.fail();
                self.observer.on_phase(ReadPhase::Failed);
                warn!("Fetch failed during {}: {}", state.phase().label(), e);
            }
        }
        if let Err(e) = self.transport.unsubscribe(rx).await {
            warn!("Failed to unsubscribe from file channels: {}", e);
        }
        result
    }

    async fn drive(
        &self,
        state: &mut EncryptedReadState,
        rx: &mut NotificationStream,
        cancel: &CancellationToken,
    ) -> Result<Bytes, FileTransferError> {
        if cancel.is_cancelled() {
            return Err(FileTransferError::Cancelled);
        }
        let lookup = state.start();
        self.observer.on_phase(state.phase());
        self.write(&lookup).await?;

        let mut deadline = Instant::now() + self.config.lookup_timeout();
        let mut get_started = Instant::now();
        let mut phase = state.phase();

        loop {
            let notification = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FileTransferError::Cancelled),
                _ = sleep_until(deadline) => return Err(FileTransferError::Timeout(state.phase().label())),
                n = rx.recv() => n.ok_or(FileTransferError::NotConnected)?,
            };

            let Some(event) = ReadEvent::from_notification(notification)? else {
                continue;
            };
            let effect = state.handle(event)?;

            if state.phase() != phase {
                phase = state.phase();
                debug!("Read phase: {}", phase);
                self.observer.on_phase(phase);
            }

            match effect {
                Effect::None => {}
                Effect::SendGetRequest(dynamic) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(FileTransferError::Cancelled),
                        _ = sleep(self.config.settle_delay()) => {}
                    }
                    self.write(&request::file_get(dynamic)).await?;
                    get_started = Instant::now();
                    deadline = get_started + self.config.get_timeout(0);
                }
                Effect::FileSizeKnown(size) => {
                    deadline = get_started + self.config.get_timeout(size);
                }
                Effect::Progress { received, total } => {
                    trace!("{}/{} bytes", received, total);
                    self.observer.on_progress(received, total);
                }
                Effect::Completed(file) => {
                    self.observer.on_progress(file.len(), file.len() as u32);
                    return Ok(file);
                }
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), FileTransferError> {
        debug!("Ops >> {}", hex::encode(data));
        self.transport
            .write(Channel::Operations, data, true)
            .await
            .map_err(FileTransferError::WriteFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::KnownFile;

    const KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
    ];

    fn randoms() -> SessionRandoms {
        SessionRandoms::new([0, 1, 2, 3, 4, 5, 6, 7], [0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17])
    }

    fn control(kind: u8, handle: u16, status: u8, size: u32, crc: Option<u32>) -> ReadEvent {
        let mut raw = vec![kind, handle as u8, (handle >> 8) as u8, status];
        raw.extend_from_slice(&size.to_le_bytes());
        if let Some(crc) = crc {
            raw.extend_from_slice(&crc.to_le_bytes());
        }
        ReadEvent::Control(ControlFrame::parse(Bytes::from(raw)).unwrap())
    }

    fn data(bytes: &[u8]) -> ReadEvent {
        ReadEvent::Data(Bytes::copy_from_slice(bytes))
    }

    /// Split into packets of `chunk` payload bytes, each with an index/last header
    fn packetize(payload: &[u8], chunk: usize) -> Vec<Vec<u8>> {
        let chunks: Vec<&[u8]> = payload.chunks(chunk).collect();
        chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let last = if i == chunks.len() - 1 { 0x80 } else { 0 };
                let mut packet = vec![(i as u8 & 0x7F) | last];
                packet.extend_from_slice(c);
                packet
            })
            .collect()
    }

    fn encrypt(packets: &mut [Vec<u8>], iv: &[u8; 16], step: u64) {
        for (i, packet) in packets.iter_mut().enumerate() {
            let iv = increment_iv(iv, step * i as u64);
            aes_ctr_apply(&KEY, &iv, packet);
        }
    }

    /// Run the lookup phase resolving to `dynamic`
    fn do_lookup(state: &mut EncryptedReadState, dynamic: u16) {
        state.start();
        let body = dynamic.to_le_bytes();
        assert_eq!(state.handle(control(0x02, 0x0100, 0, 2, None)).unwrap(), Effect::None);
        assert_eq!(state.handle(data(&[0x80, body[0], body[1]])).unwrap(), Effect::None);
        let effect = state.handle(control(0x08, 0x0100, 0, 2, Some(crc32(&body)))).unwrap();
        assert_eq!(effect, Effect::SendGetRequest(FileHandle::from_raw(dynamic)));
    }

    #[test]
    fn test_plain_fetch_sequence() {
        let mut state = EncryptedReadState::plain(KnownFile::Configuration.into());
        assert_eq!(state.phase(), ReadPhase::Idle);
        do_lookup(&mut state, 0x0801);
        assert_eq!(state.dynamic_handle(), Some(FileHandle::from_raw(0x0801)));
        assert_eq!(state.phase(), ReadPhase::Get(Stage::AwaitingInit));

        let content = b"plain configuration content";
        assert_eq!(
            state.handle(control(0x01, 0x0801, 0, content.len() as u32, None)).unwrap(),
            Effect::FileSizeKnown(content.len() as u32)
        );
        for packet in packetize(content, 10) {
            assert!(matches!(state.handle(data(&packet)).unwrap(), Effect::Progress { .. }));
        }
        let effect = state
            .handle(control(0x08, 0x0801, 0, content.len() as u32, Some(crc32(content))))
            .unwrap();
        assert_eq!(effect, Effect::Completed(Bytes::from_static(content)));
        assert_eq!(state.phase(), ReadPhase::Completed);
    }

    #[test]
    fn test_encrypted_fetch_discovers_increment() {
        let mut state = EncryptedReadState::encrypted(KnownFile::ActivityFile.into(), SessionKey::new(KEY), &randoms());
        do_lookup(&mut state, 0x0101);

        let content: Vec<u8> = (0..100u8).collect();
        let mut packets = packetize(&content, 19);
        encrypt(&mut packets, &randoms().file_iv().0, 0x1E);

        state.handle(control(0x01, 0x0101, 0, content.len() as u32, None)).unwrap();
        for packet in &packets {
            state.handle(data(packet)).unwrap();
        }
        assert_eq!(state.iv_incrementor(), Some(0x1E));

        let effect = state
            .handle(control(0x08, 0x0101, 0, content.len() as u32, Some(crc32(&content))))
            .unwrap();
        assert_eq!(effect, Effect::Completed(Bytes::from(content)));
    }

    #[test]
    fn test_single_packet_file_needs_no_increment() {
        let mut state = EncryptedReadState::encrypted(KnownFile::ActivityFile.into(), SessionKey::new(KEY), &randoms());
        do_lookup(&mut state, 0x0101);

        let content = b"tiny";
        let mut packets = packetize(content, 64);
        encrypt(&mut packets, &randoms().file_iv().0, 0x20);

        state.handle(control(0x01, 0x0101, 0, 4, None)).unwrap();
        state.handle(data(&packets[0])).unwrap();
        assert_eq!(state.iv_incrementor(), None);
        let effect = state.handle(control(0x08, 0x0101, 0, 4, Some(crc32(content)))).unwrap();
        assert_eq!(effect, Effect::Completed(Bytes::from_static(content)));
    }

    #[test]
    fn test_wrong_key_is_invalid_decryption_or_crc() {
        let mut state =
            EncryptedReadState::encrypted(KnownFile::ActivityFile.into(), SessionKey::new([0xEE; 16]), &randoms());
        do_lookup(&mut state, 0x0101);

        let content: Vec<u8> = (0..60u8).collect();
        let mut packets = packetize(&content, 19);
        encrypt(&mut packets, &randoms().file_iv().0, 0x1E);

        state.handle(control(0x01, 0x0101, 0, content.len() as u32, None)).unwrap();
        let mut failure = None;
        for packet in &packets {
            if let Err(e) = state.handle(data(packet)) {
                failure = Some(e);
                break;
            }
        }
        let failure = match failure {
            Some(e) => e,
            None => state
                .handle(control(0x08, 0x0101, 0, content.len() as u32, Some(crc32(&content))))
                .unwrap_err(),
        };
        assert!(matches!(
            failure,
            FileTransferError::InvalidDecryption | FileTransferError::InvalidCRC { .. }
        ));
        assert_eq!(state.phase(), ReadPhase::Failed);
    }

    #[test]
    fn test_lookup_overflow() {
        let mut state = EncryptedReadState::plain(KnownFile::ActivityFile.into());
        state.start();
        state.handle(control(0x02, 0x0100, 0, 2, None)).unwrap();
        let err = state.handle(data(&[0x80, 0x01, 0x01, 0x99])).unwrap_err();
        assert!(matches!(err, FileTransferError::InvalidResponse(_)));
        assert_eq!(state.phase(), ReadPhase::Failed);
    }

    #[test]
    fn test_lookup_crc_mismatch() {
        let mut state = EncryptedReadState::plain(KnownFile::ActivityFile.into());
        state.start();
        state.handle(control(0x02, 0x0100, 0, 2, None)).unwrap();
        state.handle(data(&[0x80, 0x01, 0x01])).unwrap();
        let err = state.handle(control(0x08, 0x0100, 0, 2, Some(0xDEADBEEF))).unwrap_err();
        assert_eq!(
            err,
            FileTransferError::InvalidCRC {
                expected: 0xDEADBEEF,
                actual: crc32(&[0x01, 0x01])
            }
        );
    }

    #[test]
    fn test_rejected_and_empty() {
        let mut state = EncryptedReadState::plain(KnownFile::ActivityFile.into());
        state.start();
        let err = state.handle(control(0x02, 0x0100, 0x05, 0, None)).unwrap_err();
        assert_eq!(err, FileTransferError::Rejected(0x05));

        let mut state = EncryptedReadState::plain(KnownFile::ActivityFile.into());
        state.start();
        let err = state.handle(control(0x02, 0x0100, 0, 0, None)).unwrap_err();
        assert_eq!(err, FileTransferError::EmptyFile);
    }

    #[test]
    fn test_unexpected_get_handle() {
        let mut state = EncryptedReadState::plain(KnownFile::ActivityFile.into());
        do_lookup(&mut state, 0x0101);
        let err = state.handle(control(0x01, 0x0102, 0, 10, None)).unwrap_err();
        assert_eq!(
            err,
            FileTransferError::UnexpectedHandle {
                expected: 0x0101,
                actual: 0x0102
            }
        );
    }

    #[test]
    fn test_ignored_events() {
        let mut state = EncryptedReadState::plain(KnownFile::ActivityFile.into());
        state.start();
        // Data before any init frame
        assert_eq!(state.handle(data(&[0x00, 0x01])).unwrap(), Effect::None);
        // Unknown control type
        assert_eq!(state.handle(control(0x03, 0x0100, 0, 0, None)).unwrap(), Effect::None);
        assert_eq!(state.phase(), ReadPhase::Lookup(Stage::AwaitingInit));
    }

    #[test]
    fn test_out_of_order_frame() {
        let mut state = EncryptedReadState::plain(KnownFile::ActivityFile.into());
        state.start();
        let err = state.handle(control(0x01, 0x0100, 0, 10, None)).unwrap_err();
        assert!(matches!(err, FileTransferError::InvalidResponse(_)));
    }

    #[test]
    fn test_events_from_notifications() {
        let auth = Notification::new(Channel::Authentication, vec![0x03]);
        assert_eq!(ReadEvent::from_notification(auth).unwrap(), None);

        let packet = Notification::new(Channel::Data, vec![0x80, 0x01]);
        assert!(matches!(ReadEvent::from_notification(packet), Ok(Some(ReadEvent::Data(_)))));

        let truncated = Notification::new(Channel::Operations, vec![0x01, 0x00]);
        assert!(matches!(
            ReadEvent::from_notification(truncated),
            Err(FileTransferError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_short_unknown_control_frame_is_ignored() {
        let keepalive = Notification::new(Channel::Operations, vec![0x03]);
        assert_eq!(ReadEvent::from_notification(keepalive).unwrap(), None);

        let empty = Notification::new(Channel::Operations, Vec::new());
        assert!(matches!(
            ReadEvent::from_notification(empty),
            Err(FileTransferError::InvalidResponse(_))
        ));
    }
}
