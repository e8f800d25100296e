pub mod auth;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod handle;
pub mod reader;
pub mod request;
pub mod session;
pub mod transport;
pub mod watch;

// Re-export the main entry points for easy access
pub use auth::{Authenticator, HandshakeState, SessionVerifier};
pub use config::SessionConfig;
pub use error::{AuthError, FileTransferError, Remediation, TransportError};
pub use handle::{FileHandle, KnownFile};
pub use reader::{EncryptedFileReader, TransferObserver};
pub use session::{KeyStore, SessionKey, SessionRandoms, StaticKeyStore};
pub use transport::{Channel, Notification, NotificationHub, NotificationStream, SubscriptionId, Transport};
pub use watch::Watch;
