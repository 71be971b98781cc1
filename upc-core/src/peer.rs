//! Distributors known to the host's peer directory.

use serde::{Deserialize, Serialize};

use crate::protocol::PeerProtocol;

/// A distributor as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub protocol: PeerProtocol,
    #[serde(default)]
    pub features: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>, protocol: PeerProtocol) -> Self {
        Self {
            id: id.into(),
            protocol,
            features: Vec::new(),
        }
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    pub fn supports(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Keep peers that advertise every feature in `features`.
pub fn filter_by_features<'a>(peers: &'a [PeerInfo], features: &[&str]) -> Vec<&'a PeerInfo> {
    peers
        .iter()
        .filter(|p| features.iter().all(|f| p.supports(f)))
        .collect()
}

/// The only candidate, if exactly one remains. Hosts may bind it without asking.
pub fn sole_candidate<'a>(peers: &[&'a PeerInfo]) -> Option<&'a PeerInfo> {
    match peers {
        [only] => Some(*only),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FEATURE_BYTES_MESSAGE;

    #[test]
    fn filter_keeps_peers_with_all_features() {
        let peers = vec![
            PeerInfo::new("a", PeerProtocol::Handshake).with_feature(FEATURE_BYTES_MESSAGE),
            PeerInfo::new("b", PeerProtocol::Legacy),
        ];
        let kept = filter_by_features(&peers, &[FEATURE_BYTES_MESSAGE]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "a");
        assert_eq!(filter_by_features(&peers, &[]).len(), 2);
    }

    #[test]
    fn sole_candidate_only_for_one() {
        let a = PeerInfo::new("a", PeerProtocol::Handshake);
        let b = PeerInfo::new("b", PeerProtocol::Handshake);
        assert!(sole_candidate(&[]).is_none());
        assert_eq!(sole_candidate(&[&a]).map(|p| p.id.as_str()), Some("a"));
        assert!(sole_candidate(&[&a, &b]).is_none());
    }
}
