//! Session authentication
//!
//! Five-step challenge/response on the authentication channel. All blocks are
//! AES-128-CBC with a zero IV and no padding, keyed with the pre-shared
//! [`SessionKey`].
//!
//! 1. Phone writes `02 01 01 || phone_random`
//! 2. Watch notifies `03 01 flags status || E(watch_random || phone_random)`
//! 3. Phone decrypts and checks the echoed phone random
//! 4. Phone writes `02 02 01 || E(phone_random || watch_random)`
//! 5. Watch notifies `03 02 flags status`, `0x00` meaning success
//!
//! A successful run yields fresh [`SessionRandoms`], from which every encrypted
//! file operation derives its counter block. The randoms are therefore
//! regenerated before each encrypted fetch.

use crate::config::SessionConfig;
use crate::constants::STATUS_OK;
use crate::crypto::{BLOCK_SIZE, aes_cbc_decrypt_block, aes_cbc_encrypt_block};
use crate::error::{AuthError, TransportError};
use crate::frame::AuthResponse;
use crate::request;
use crate::session::{RANDOM_SIZE, SessionKey, SessionRandoms};
use crate::transport::{Channel, NotificationStream, Transport};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Progress of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum HandshakeState {
    Idle,
    AwaitingChallenge,
    AwaitingStatus,
    Authenticated,
    Failed,
}

impl HandshakeState {
    pub fn is_running(&self) -> bool {
        matches!(self, HandshakeState::AwaitingChallenge | HandshakeState::AwaitingStatus)
    }
}

/// What the file reader needs from an authenticated session
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Re-run the handshake with the stored key, refreshing the session randoms
    async fn verify_authentication(&self) -> Result<(), AuthError>;

    fn current_randoms(&self) -> Option<SessionRandoms>;

    fn current_key(&self) -> Option<SessionKey>;
}

#[derive(Debug)]
struct Session {
    state: HandshakeState,
    key: Option<SessionKey>,
    randoms: Option<SessionRandoms>,
}

/// Marks the session failed unless the handshake reached a verdict.
///
/// Covers both error returns and a handshake future dropped mid-flight.
struct HandshakeGuard<'a> {
    session: &'a Mutex<Session>,
    armed: bool,
}

impl HandshakeGuard<'_> {
    fn complete(mut self, randoms: SessionRandoms) {
        let mut session = lock(self.session);
        session.state = HandshakeState::Authenticated;
        session.randoms = Some(randoms);
        self.armed = false;
    }
}

impl Drop for HandshakeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut session = lock(self.session);
            session.state = HandshakeState::Failed;
            session.randoms = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs the handshake over a [`Transport`] and owns the resulting session material
pub struct Authenticator {
    transport: Arc<dyn Transport>,
    session: Mutex<Session>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    response_timeout: Duration,
    handshakes: AtomicUsize,
}

impl Authenticator {
    pub fn new(transport: Arc<dyn Transport>, config: &SessionConfig) -> Self {
        Self {
            transport,
            session: Mutex::new(Session {
                state: HandshakeState::Idle,
                key: None,
                randoms: None,
            }),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
            response_timeout: config.auth_timeout(),
            handshakes: AtomicUsize::new(0),
        }
    }

    /// Replace the source of phone randoms
    pub fn with_rng(self, rng: impl RngCore + Send + 'static) -> Self {
        *lock(&self.rng) = Box::new(rng);
        self
    }

    pub fn state(&self) -> HandshakeState {
        lock(&self.session).state
    }

    /// Number of handshakes started on this instance
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Forget the session (disconnect). The key is kept for the next connection.
    pub fn reset(&self) {
        let mut session = lock(&self.session);
        session.state = HandshakeState::Idle;
        session.randoms = None;
    }

    /// Run the handshake with `key`
    ///
    /// On success the session is authenticated and holds fresh randoms. On any
    /// failure it is unauthenticated with the randoms cleared; the key is kept so
    /// the caller may retry.
    pub async fn authenticate(&self, key: SessionKey) -> Result<(), AuthError> {
        let guard = self.begin(key)?;
        let attempt = self.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, "Starting authentication handshake");

        match self.run_handshake(&key).await {
            Ok(randoms) => {
                guard.complete(randoms);
                info!("Watch authenticated");
                Ok(())
            }
            Err(e) => {
                warn!("Authentication failed: {}", e);
                Err(e)
            }
        }
    }

    fn begin(&self, key: SessionKey) -> Result<HandshakeGuard<'_>, AuthError> {
        let mut session = lock(&self.session);
        if session.state.is_running() {
            return Err(AuthError::AlreadyInProgress);
        }
        session.state = HandshakeState::AwaitingChallenge;
        session.key = Some(key);
        session.randoms = None;
        Ok(HandshakeGuard {
            session: &self.session,
            armed: true,
        })
    }

    fn set_state(&self, state: HandshakeState) {
        lock(&self.session).state = state;
    }

    async fn run_handshake(&self, key: &SessionKey) -> Result<SessionRandoms, AuthError> {
        let mut rx = self
            .transport
            .subscribe(&[Channel::Authentication])
            .await
            .map_err(auth_transport_error)?;

        let result = self.exchange(key, &mut rx).await;

        if let Err(e) = self.transport.unsubscribe(rx).await {
            warn!("Failed to unsubscribe from authentication channel: {}", e);
        }
        result
    }

    async fn exchange(&self, key: &SessionKey, rx: &mut NotificationStream) -> Result<SessionRandoms, AuthError> {
        let mut phone_random = [0u8; RANDOM_SIZE];
        lock(&self.rng).fill_bytes(&mut phone_random);
        trace!(phone_random = %hex::encode(phone_random), "Generated phone random");

        // Steps 1 and 2
        self.write(&request::auth_start(&phone_random)).await?;
        let payload = match self.next_response(rx).await? {
            AuthResponse::Challenge { status, .. } if status != STATUS_OK => {
                return Err(AuthError::RejectedByWatch(status));
            }
            AuthResponse::Challenge { payload, .. } => payload,
            AuthResponse::Status(status) => {
                return Err(AuthError::MalformedResponse(format!(
                    "expected challenge, got status 0x{:02X}",
                    status
                )));
            }
        };

        // Step 3
        let decrypted = aes_cbc_decrypt_block(key.as_bytes(), &payload).ok_or(AuthError::DecryptionFailed)?;
        let (watch_part, echo) = decrypted.split_at(RANDOM_SIZE);
        if echo != phone_random {
            debug!(echo = %hex::encode(echo), "Phone random echo mismatch");
            return Err(AuthError::EchoMismatch);
        }
        let mut watch_random = [0u8; RANDOM_SIZE];
        watch_random.copy_from_slice(watch_part);

        // Steps 4 and 5
        let mut confirm = [0u8; BLOCK_SIZE];
        confirm[..RANDOM_SIZE].copy_from_slice(&phone_random);
        confirm[RANDOM_SIZE..].copy_from_slice(&watch_random);
        let encrypted = aes_cbc_encrypt_block(key.as_bytes(), &confirm);

        self.set_state(HandshakeState::AwaitingStatus);
        self.write(&request::auth_confirm(&encrypted)).await?;

        match self.next_response(rx).await? {
            AuthResponse::Status(STATUS_OK) => Ok(SessionRandoms::new(phone_random, watch_random)),
            AuthResponse::Status(status) => Err(AuthError::RejectedByWatch(status)),
            AuthResponse::Challenge { .. } => Err(AuthError::MalformedResponse(
                "expected status, got a second challenge".to_string(),
            )),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), AuthError> {
        debug!("Auth >> {}", hex::encode(data));
        self.transport
            .write(Channel::Authentication, data, true)
            .await
            .map_err(auth_transport_error)
    }

    async fn next_response(&self, rx: &mut NotificationStream) -> Result<AuthResponse, AuthError> {
        let notification = timeout(self.response_timeout, async {
            loop {
                match rx.recv().await {
                    Some(n) if n.channel == Channel::Authentication => return Ok(n),
                    Some(_) => continue,
                    None => return Err(AuthError::NotConnected),
                }
            }
        })
        .await
        .map_err(|_| AuthError::Timeout)??;

        debug!("Auth << {}", hex::encode(&notification.value));
        Ok(AuthResponse::try_from(notification.value)?)
    }
}

fn auth_transport_error(e: TransportError) -> AuthError {
    match e {
        TransportError::ChannelUnavailable(_) => AuthError::CharacteristicNotAvailable,
        TransportError::NotConnected => AuthError::NotConnected,
        other => AuthError::Transport(other),
    }
}

#[async_trait]
impl SessionVerifier for Authenticator {
    fn is_authenticated(&self) -> bool {
        let session = lock(&self.session);
        session.state == HandshakeState::Authenticated && session.randoms.is_some()
    }

    async fn verify_authentication(&self) -> Result<(), AuthError> {
        let key = lock(&self.session).key.ok_or(AuthError::NoKey)?;
        self.authenticate(key).await
    }

    fn current_randoms(&self) -> Option<SessionRandoms> {
        lock(&self.session).randoms
    }

    fn current_key(&self) -> Option<SessionKey> {
        lock(&self.session).key
    }
}
