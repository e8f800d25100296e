//! Common test utilities: a simulated watch speaking the handshake and file protocols

// Shared across test files; not every item is used in each of them
#![allow(dead_code)]

#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hrwatch_lib::auth::{Authenticator, HandshakeState, SessionVerifier};
#[allow(unused_imports)]
pub use hrwatch_lib::config::SessionConfig;
#[allow(unused_imports)]
pub use hrwatch_lib::error::{AuthError, FileTransferError, TransportError};
#[allow(unused_imports)]
pub use hrwatch_lib::handle::{FileHandle, KnownFile};
#[allow(unused_imports)]
pub use hrwatch_lib::reader::EncryptedFileReader;
#[allow(unused_imports)]
pub use hrwatch_lib::session::{FileIv, SessionKey, SessionRandoms};
#[allow(unused_imports)]
pub use hrwatch_lib::transport::{Channel, Notification, NotificationHub, NotificationStream, Transport};
#[allow(unused_imports)]
pub use std::sync::Arc;

use async_trait::async_trait;
use hrwatch_lib::crypto::{aes_cbc_decrypt_block, aes_cbc_encrypt_block, aes_ctr_apply, crc32, increment_iv};
use rand::rngs::mock::StepRng;
use std::sync::Mutex;

pub const KEY_HEX: &str = "000102030405060708090A0B0C0D0E0F";

pub const PHONE_RANDOM: [u8; 8] = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];

/// Dynamic handle the simulated watch resolves every lookup to
pub const DYNAMIC_HANDLE: u16 = 0x0101;

/// 33 bytes of content followed by their CRC32 (LE)
pub const SAMPLE_FILE_HEX: &str =
    "4879627269642048522061637469766974792073616d706c65207265636f7264210b98cb33";

pub fn key() -> SessionKey {
    SessionKey::from_hex(KEY_HEX).unwrap()
}

pub fn sample_file() -> Vec<u8> {
    hex::decode(SAMPLE_FILE_HEX).unwrap()
}

/// Phone randoms are always 00 01 .. 07
pub fn fixed_rng() -> StepRng {
    StepRng::new(u64::from_le_bytes(PHONE_RANDOM), 0)
}

/// Watch random of the `n`th handshake (1-based)
pub fn watch_random(n: usize) -> [u8; 8] {
    let base = (n as u8).wrapping_mul(0x10);
    std::array::from_fn(|i| base.wrapping_add(i as u8))
}

/// Behaviour knobs of the simulated watch
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub key: [u8; 16],
    /// Counter step between encrypted packets
    pub incrementor: u64,
    /// Payload bytes per data packet (header excluded)
    pub packet_payload: usize,
    pub encrypt: bool,
    pub corrupt_echo: bool,
    pub auth_status: u8,
    /// Send one byte more lookup data than declared
    pub lookup_overflow: bool,
    pub lookup_status: u8,
    /// Flip one payload byte of the first encrypted packet
    pub corrupt_ciphertext: bool,
    pub get_handle: Option<u16>,
    /// Never answer get requests
    pub silent_get: bool,
    /// Never answer anything on the operations channel
    pub silent_lookup: bool,
    /// Interleave a one-byte status frame of an unknown type
    pub keepalive: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            key: *key().as_bytes(),
            incrementor: 0x1E,
            packet_payload: 19,
            encrypt: true,
            corrupt_echo: false,
            auth_status: 0,
            lookup_overflow: false,
            lookup_status: 0,
            corrupt_ciphertext: false,
            get_handle: None,
            silent_get: false,
            silent_lookup: false,
            keepalive: false,
        }
    }
}

#[derive(Default)]
struct SimState {
    handshakes: usize,
    pending: Option<([u8; 8], [u8; 8])>,
    randoms: Option<SessionRandoms>,
    file_ivs: Vec<FileIv>,
    writes: Vec<(Channel, Bytes)>,
}

/// In-memory watch implementing the inverse of every client operation
pub struct SimWatch {
    hub: NotificationHub,
    options: SimOptions,
    file: Vec<u8>,
    state: Mutex<SimState>,
}

impl SimWatch {
    pub fn new(file: Vec<u8>) -> Self {
        Self::with_options(file, SimOptions::default())
    }

    pub fn with_options(file: Vec<u8>, options: SimOptions) -> Self {
        Self {
            hub: NotificationHub::new(),
            options,
            file,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn handshakes(&self) -> usize {
        self.state.lock().unwrap().handshakes
    }

    /// File IVs used for every encrypted get, in order
    pub fn file_ivs(&self) -> Vec<FileIv> {
        self.state.lock().unwrap().file_ivs.clone()
    }

    pub fn writes(&self, channel: Channel) -> Vec<Bytes> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.hub.is_subscribed(channel)
    }

    /// Simulate a link loss
    pub fn disconnect(&self) {
        self.hub.close();
    }

    fn notify(&self, channel: Channel, value: Vec<u8>) {
        self.hub.publish(Notification::new(channel, value));
    }

    fn on_auth(&self, data: &[u8]) {
        match data[1] {
            0x01 => {
                let mut phone = [0u8; 8];
                phone.copy_from_slice(&data[3..11]);
                let watch = {
                    let mut state = self.state.lock().unwrap();
                    state.handshakes += 1;
                    let watch = watch_random(state.handshakes);
                    state.pending = Some((phone, watch));
                    watch
                };

                let mut block = [0u8; 16];
                block[..8].copy_from_slice(&watch);
                block[8..].copy_from_slice(&phone);
                if self.options.corrupt_echo {
                    block[8] ^= 0xFF;
                }
                let mut response = vec![0x03, 0x01, 0x01, 0x00];
                response.extend_from_slice(&aes_cbc_encrypt_block(&self.options.key, &block));
                self.notify(Channel::Authentication, response);
            }
            0x02 => {
                let mut encrypted = [0u8; 16];
                encrypted.copy_from_slice(&data[3..19]);
                let decrypted = aes_cbc_decrypt_block(&self.options.key, &encrypted).unwrap();

                let mut state = self.state.lock().unwrap();
                let status = match state.pending.take() {
                    Some((phone, watch)) if decrypted[..8] == phone && decrypted[8..] == watch => {
                        if self.options.auth_status == 0 {
                            state.randoms = Some(SessionRandoms::new(phone, watch));
                        }
                        self.options.auth_status
                    }
                    _ => 0x01,
                };
                drop(state);
                self.notify(Channel::Authentication, vec![0x03, 0x02, 0x01, status]);
            }
            other => panic!("unexpected auth step {:#04x}", other),
        }
    }

    fn on_operation(&self, data: &[u8]) {
        if self.options.silent_lookup {
            return;
        }
        match data[0] {
            0x02 => self.answer_lookup(data[2], data[3]),
            0x01 => self.answer_get(u16::from_le_bytes([data[1], data[2]])),
            other => panic!("unexpected operation {:#04x}", other),
        }
    }

    fn answer_lookup(&self, minor: u8, major: u8) {
        let body = DYNAMIC_HANDLE.to_le_bytes().to_vec();
        let mut init = vec![0x02, minor, major, self.options.lookup_status];
        init.extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.notify(Channel::Operations, init);
        if self.options.lookup_status != 0 {
            return;
        }
        if self.options.keepalive {
            self.notify(Channel::Operations, vec![0x03]);
        }

        let mut packet = vec![0x80];
        packet.extend_from_slice(&body);
        if self.options.lookup_overflow {
            packet.push(0xEE);
        }
        self.notify(Channel::Data, packet);
        self.notify(Channel::Operations, complete_frame(minor, major, &body));
    }

    fn answer_get(&self, handle: u16) {
        if self.options.silent_get {
            return;
        }
        let echoed = self.options.get_handle.unwrap_or(handle);
        let [minor, major] = echoed.to_le_bytes();

        let mut init = vec![0x01, minor, major, 0x00];
        init.extend_from_slice(&(self.file.len() as u32).to_le_bytes());
        self.notify(Channel::Operations, init);

        let mut packets = packetize(&self.file, self.options.packet_payload);
        if self.options.encrypt {
            let randoms = self.state.lock().unwrap().randoms.expect("encrypted get without handshake");
            let iv = randoms.file_iv();
            self.state.lock().unwrap().file_ivs.push(iv);
            encrypt_packets(&self.options.key, &iv.0, self.options.incrementor, &mut packets);
        }
        if self.options.corrupt_ciphertext {
            packets[0][5] ^= 0x5A;
        }
        for packet in packets {
            self.notify(Channel::Data, packet);
        }
        self.notify(Channel::Operations, complete_frame(minor, major, &self.file));
    }
}

#[async_trait]
impl Transport for SimWatch {
    async fn write(&self, channel: Channel, data: &[u8], _require_ack: bool) -> Result<(), TransportError> {
        self.state
            .lock()
            .unwrap()
            .writes
            .push((channel, Bytes::copy_from_slice(data)));
        match channel {
            Channel::Authentication => self.on_auth(data),
            Channel::Operations => self.on_operation(data),
            Channel::Data => return Err(TransportError::WriteFailed("data channel is notify-only".to_string())),
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<NotificationStream, TransportError> {
        Ok(self.hub.subscribe(channels))
    }

    async fn unsubscribe(&self, stream: NotificationStream) -> Result<(), TransportError> {
        self.hub.unsubscribe(stream.id());
        Ok(())
    }
}

fn complete_frame(minor: u8, major: u8, content: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x08, minor, major, 0x00];
    frame.extend_from_slice(&(content.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32(content).to_le_bytes());
    frame
}

/// Split into data packets: header (index, bit 7 on the last one) + payload
pub fn packetize(content: &[u8], payload: usize) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = content.chunks(payload).collect();
    let last = chunks.len().saturating_sub(1);
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut packet = vec![(i as u8 & 0x7F) | if i == last { 0x80 } else { 0x00 }];
            packet.extend_from_slice(chunk);
            packet
        })
        .collect()
}

/// Packet 0 with the file IV, packet n with `iv + incrementor * n`
pub fn encrypt_packets(key: &[u8; 16], iv: &[u8; 16], incrementor: u64, packets: &mut [Vec<u8>]) {
    for (n, packet) in packets.iter_mut().enumerate() {
        let counter = increment_iv(iv, incrementor * n as u64);
        aes_ctr_apply(key, &counter, packet);
    }
}

pub fn authenticator(watch: Arc<SimWatch>) -> Authenticator {
    Authenticator::new(watch, &SessionConfig::default()).with_rng(fixed_rng())
}

/// A reader over an already authenticated session
pub async fn authenticated_reader(watch: Arc<SimWatch>) -> (Arc<Authenticator>, EncryptedFileReader) {
    let auth = Arc::new(authenticator(watch.clone()));
    auth.authenticate(key()).await.unwrap();
    let reader = EncryptedFileReader::new(watch, auth.clone(), SessionConfig::default());
    (auth, reader)
}
