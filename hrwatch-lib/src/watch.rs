//! One connected watch: key store, authenticator and file reader wired to a
//! shared transport.

use crate::auth::{Authenticator, HandshakeState, SessionVerifier};
use crate::config::SessionConfig;
use crate::error::{AuthError, FileTransferError};
use crate::handle::FileHandle;
use crate::reader::{EncryptedFileReader, TransferObserver};
use crate::session::KeyStore;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Watch {
    keys: Arc<dyn KeyStore>,
    auth: Arc<Authenticator>,
    // Fetches share the operations and data channels, so they run one at a time.
    reader: Mutex<EncryptedFileReader>,
}

impl Watch {
    pub fn new(transport: Arc<dyn Transport>, keys: Arc<dyn KeyStore>, config: SessionConfig) -> Self {
        let auth = Authenticator::new(transport.clone(), &config);
        Self::with_authenticator(transport, keys, auth, config)
    }

    /// Build around a preconfigured authenticator (e.g. a custom RNG)
    pub fn with_authenticator(
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyStore>,
        auth: Authenticator,
        config: SessionConfig,
    ) -> Self {
        let auth = Arc::new(auth);
        let reader = EncryptedFileReader::new(transport, auth.clone(), config);
        Self {
            keys,
            auth,
            reader: Mutex::new(reader),
        }
    }

    pub fn with_observer(self, observer: Arc<dyn TransferObserver>) -> Self {
        let reader = self.reader.into_inner().with_observer(observer);
        Self {
            keys: self.keys,
            auth: self.auth,
            reader: Mutex::new(reader),
        }
    }

    /// Authenticate with the key from the key store
    pub async fn authenticate(&self) -> Result<(), AuthError> {
        let key = self.keys.secret_key().ok_or(AuthError::NoKey)?;
        self.auth.authenticate(key).await
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.auth.state()
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    pub async fn fetch_encrypted_file(&self, handle: FileHandle) -> Result<Bytes, FileTransferError> {
        self.reader.lock().await.fetch_encrypted_file(handle).await
    }

    pub async fn fetch_encrypted_file_with_cancel(
        &self,
        handle: FileHandle,
        cancel: CancellationToken,
    ) -> Result<Bytes, FileTransferError> {
        let mut reader = self.lock_reader(&cancel).await?;
        reader.fetch_encrypted_file_with_cancel(handle, cancel).await
    }

    pub async fn fetch_file(&self, handle: FileHandle) -> Result<Bytes, FileTransferError> {
        self.reader.lock().await.fetch_file(handle).await
    }

    pub async fn fetch_file_with_cancel(
        &self,
        handle: FileHandle,
        cancel: CancellationToken,
    ) -> Result<Bytes, FileTransferError> {
        let mut reader = self.lock_reader(&cancel).await?;
        reader.fetch_file_with_cancel(handle, cancel).await
    }

    /// Wait for the running fetch to finish, unless cancelled first
    async fn lock_reader(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, EncryptedFileReader>, FileTransferError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FileTransferError::Cancelled),
            reader = self.reader.lock() => Ok(reader),
        }
    }

    /// Forget the session after a disconnect
    pub fn disconnect(&self) {
        info!("Session closed");
        self.auth.reset();
    }
}
