//! UnifiedPush connector core.
//! Host-driven: the host passes API calls and distributor messages, and performs the
//! returned actions. No transport I/O.

pub mod backend;
pub mod config;
pub mod connector;
pub mod keys;
pub mod peer;
pub mod protocol;
pub mod store;
pub mod webpush;

pub use backend::{FileBackend, MemoryBackend, StoreBackend, StoreError};
pub use config::{ConnectorConfig, KeyStorage};
pub use connector::{
    perform, Action, Connector, PushEndpoint, PushEvent, PushMessage, PushReceiver,
    RegisterError, RegistrationState, Transport,
};
pub use keys::{
    DefaultKeyManager, EphemeralWrappingKey, KeyError, KeyManager, KeyProtection,
    PlainProtection, SealedKey, WrappedProtection, WrappingKeySource,
};
pub use peer::PeerInfo;
pub use protocol::{FailedReason, InboundMessage, OutboundMessage, PeerProtocol, INSTANCE_DEFAULT};
pub use store::{PeerBinding, Registration, Store};
pub use webpush::{PublicKeySet, WebPushError};
