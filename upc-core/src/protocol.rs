//! Connector <-> distributor control messages, failure reasons and peer protocol variants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Instance used when the application does not name one.
pub const INSTANCE_DEFAULT: &str = "default";

/// Feature advertised by distributors able to deliver raw bytes messages.
pub const FEATURE_BYTES_MESSAGE: &str = "org.unifiedpush.android.distributor.feature.BYTES_MESSAGE";

/// Protocol variant spoken by a bound distributor. Selected once per binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerProtocol {
    /// Pre-link distributors: REGISTER is sent directly, without auth token.
    Legacy,
    /// LINK / LINKED handshake issues an auth token before any REGISTER.
    Handshake,
}

/// Messages sent by the connector to the bound distributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundMessage {
    /// Start a handshake; the distributor echoes `link_token` in LINKED.
    Link { link_token: String },
    /// Subscribe one instance. `auth_token` is `None` for legacy distributors.
    /// `features` lists what the application needs from the distributor.
    Register {
        token: String,
        auth_token: Option<String>,
        message_for_peer: Option<String>,
        vapid: Option<String>,
        application: String,
        features: Vec<String>,
    },
    Unregister { token: String, application: String },
    MessageAck { token: String, message_id: String },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Link { .. } => "LINK",
            OutboundMessage::Register { .. } => "REGISTER",
            OutboundMessage::Unregister { .. } => "UNREGISTER",
            OutboundMessage::MessageAck { .. } => "MESSAGE_ACK",
        }
    }
}

/// Messages received from the distributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboundMessage {
    Linked {
        link_token: String,
        auth_token: String,
    },
    NewEndpoint {
        token: String,
        endpoint: String,
        message_id: Option<String>,
    },
    /// `reason` is the raw reason code; parsed with [`FailedReason::from_code`].
    RegistrationFailed {
        token: String,
        reason: Option<String>,
    },
    Unregistered {
        token: String,
    },
    Message {
        token: String,
        content: Vec<u8>,
        message_id: Option<String>,
    },
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Linked { .. } => "LINKED",
            InboundMessage::NewEndpoint { .. } => "NEW_ENDPOINT",
            InboundMessage::RegistrationFailed { .. } => "REGISTRATION_FAILED",
            InboundMessage::Unregistered { .. } => "UNREGISTERED",
            InboundMessage::Message { .. } => "MESSAGE",
        }
    }
}

/// Why a registration failed. Surfaced to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailedReason {
    /// Generic error; registering again directly is fine.
    InternalError,
    /// No network on the distributor side; retry when it is back.
    Network,
    /// The distributor needs the user to interact with it first.
    ActionRequired,
    /// The auth token was refused. Handled internally by re-linking, still reported.
    Unauth,
    /// The distributor requires a VAPID key and none was supplied.
    VapidRequired,
    /// No distributor is bound, or the bound one went away.
    NoPeerSelected,
}

impl FailedReason {
    /// Parse a wire reason code. Unknown or missing codes map to `InternalError`.
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("NETWORK") => FailedReason::Network,
            Some("ACTION_REQUIRED") => FailedReason::ActionRequired,
            Some("UNAUTH") => FailedReason::Unauth,
            Some("VAPID_REQUIRED") => FailedReason::VapidRequired,
            Some("NO_PEER_SELECTED") | Some("DISTRIBUTOR_NOT_SAVED") => {
                FailedReason::NoPeerSelected
            }
            _ => FailedReason::InternalError,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FailedReason::InternalError => "INTERNAL_ERROR",
            FailedReason::Network => "NETWORK",
            FailedReason::ActionRequired => "ACTION_REQUIRED",
            FailedReason::Unauth => "UNAUTH",
            FailedReason::VapidRequired => "VAPID_REQUIRED",
            FailedReason::NoPeerSelected => "NO_PEER_SELECTED",
        }
    }

    /// Transient failures the caller may retry on its own schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailedReason::Network | FailedReason::ActionRequired)
    }
}

impl fmt::Display for FailedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Shorten a token for log lines.
pub(crate) fn short(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_parse() {
        assert_eq!(FailedReason::from_code(Some("NETWORK")), FailedReason::Network);
        assert_eq!(FailedReason::from_code(Some("UNAUTH")), FailedReason::Unauth);
        assert_eq!(
            FailedReason::from_code(Some("VAPID_REQUIRED")),
            FailedReason::VapidRequired
        );
        assert_eq!(
            FailedReason::from_code(Some("ACTION_REQUIRED")),
            FailedReason::ActionRequired
        );
    }

    #[test]
    fn unknown_or_missing_reason_is_internal_error() {
        assert_eq!(FailedReason::from_code(None), FailedReason::InternalError);
        assert_eq!(
            FailedReason::from_code(Some("network")),
            FailedReason::InternalError
        );
        assert_eq!(
            FailedReason::from_code(Some("SOMETHING_NEW")),
            FailedReason::InternalError
        );
    }

    #[test]
    fn legacy_not_saved_code_maps_to_no_peer() {
        assert_eq!(
            FailedReason::from_code(Some("DISTRIBUTOR_NOT_SAVED")),
            FailedReason::NoPeerSelected
        );
    }

    #[test]
    fn code_roundtrips_through_display() {
        for reason in [
            FailedReason::InternalError,
            FailedReason::Network,
            FailedReason::ActionRequired,
            FailedReason::Unauth,
            FailedReason::VapidRequired,
            FailedReason::NoPeerSelected,
        ] {
            assert_eq!(FailedReason::from_code(Some(&reason.to_string())), reason);
        }
    }

    #[test]
    fn only_network_and_action_required_are_transient() {
        assert!(FailedReason::Network.is_retryable());
        assert!(FailedReason::ActionRequired.is_retryable());
        assert!(!FailedReason::InternalError.is_retryable());
        assert!(!FailedReason::Unauth.is_retryable());
        assert!(!FailedReason::VapidRequired.is_retryable());
        assert!(!FailedReason::NoPeerSelected.is_retryable());
    }

    #[test]
    fn short_token_never_panics() {
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("ééééé"), "éééé");
    }
}
