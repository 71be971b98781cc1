//! Registration engine. The host passes API calls and distributor messages; the engine
//! updates the store and returns actions for the host to perform.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::config::ConnectorConfig;
use crate::keys::KeyManager;
use crate::peer::PeerInfo;
use crate::protocol::{short, FailedReason, InboundMessage, OutboundMessage, PeerProtocol};
use crate::store::{PeerBinding, Registration, Store};
use crate::webpush::{self, PublicKeySet};

/// Endpoint handed to the application, with the keys its server must encrypt to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEndpoint {
    pub url: String,
    pub pub_key_set: Option<PublicKeySet>,
}

/// Message handed to the application. `verified` is false when decryption failed
/// and `content` holds the raw bytes as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub content: Vec<u8>,
    pub verified: bool,
}

/// Event for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    NewEndpoint {
        instance: String,
        endpoint: PushEndpoint,
    },
    Message {
        instance: String,
        message: PushMessage,
    },
    RegistrationFailed {
        instance: String,
        reason: FailedReason,
    },
    Unregistered {
        instance: String,
    },
}

impl PushEvent {
    pub fn dispatch(&self, receiver: &dyn PushReceiver) {
        match self {
            PushEvent::NewEndpoint { instance, endpoint } => {
                receiver.on_new_endpoint(endpoint, instance)
            }
            PushEvent::Message { instance, message } => receiver.on_message(message, instance),
            PushEvent::RegistrationFailed { instance, reason } => {
                receiver.on_registration_failed(*reason, instance)
            }
            PushEvent::Unregistered { instance } => receiver.on_unregistered(instance),
        }
    }
}

/// Application callbacks.
pub trait PushReceiver: Send + Sync {
    fn on_new_endpoint(&self, endpoint: &PushEndpoint, instance: &str);
    fn on_message(&self, message: &PushMessage, instance: &str);
    fn on_registration_failed(&self, reason: FailedReason, instance: &str);
    fn on_unregistered(&self, instance: &str);
}

/// Delivers control messages to a distributor. Best effort; failures are the host's to log.
pub trait Transport: Send + Sync {
    fn send(&self, peer_id: &str, message: OutboundMessage);
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send {
        peer_id: String,
        message: OutboundMessage,
    },
    Deliver(PushEvent),
}

/// Perform actions in order.
pub fn perform(actions: Vec<Action>, transport: &dyn Transport, receiver: &dyn PushReceiver) {
    for action in actions {
        match action {
            Action::Send { peer_id, message } => transport.send(&peer_id, message),
            Action::Deliver(event) => event.dispatch(receiver),
        }
    }
}

/// Per-instance state, derived from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    /// Registered locally, no peer bound.
    Pending,
    /// Waiting for LINKED before REGISTER can be sent.
    Handshaking,
    AwaitingAck,
    Acked,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("malformed VAPID public key")]
    InvalidVapid,
    #[error("a VAPID public key is required")]
    VapidRequired,
}

const INSTANCE_STRIPES: usize = 16;

/// The registration engine. Shared as `Arc<Connector>`; every method takes `&self`.
///
/// Creating and tearing down an instance (registration plus key set) runs under that
/// instance's stripe lock. Peer-wide teardown takes every stripe, in index order.
/// Stripe locks are always taken before any store lock.
pub struct Connector {
    store: Arc<Store>,
    keys: Arc<dyn KeyManager>,
    config: ConnectorConfig,
    instance_locks: [Mutex<()>; INSTANCE_STRIPES],
}

impl Connector {
    pub fn new(store: Arc<Store>, keys: Arc<dyn KeyManager>, config: ConnectorConfig) -> Self {
        Self {
            store,
            keys,
            config,
            instance_locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    fn lock_instance(&self, instance: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        instance.hash(&mut hasher);
        self.instance_locks[hasher.finish() as usize % INSTANCE_STRIPES].lock()
    }

    fn lock_all_instances(&self) -> Vec<MutexGuard<'_, ()>> {
        self.instance_locks.iter().map(|l| l.lock()).collect()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn state(&self, instance: &str) -> RegistrationState {
        let Some(reg) = self.store.registration(instance) else {
            return RegistrationState::Unregistered;
        };
        if reg.ack {
            return RegistrationState::Acked;
        }
        match self.store.peer() {
            None => RegistrationState::Pending,
            Some(p) if p.is_legacy() || p.auth_token.is_some() => RegistrationState::AwaitingAck,
            Some(_) => RegistrationState::Handshaking,
        }
    }

    fn register_message(&self, reg: &Registration, auth_token: Option<String>) -> OutboundMessage {
        OutboundMessage::Register {
            token: reg.token.clone(),
            auth_token,
            message_for_peer: reg.message_for_peer.clone(),
            vapid: reg.vapid.clone(),
            application: self.config.application.clone(),
            features: reg.features.clone(),
        }
    }

    fn send_register(&self, actions: &mut Vec<Action>, peer: &PeerBinding, reg: &Registration) {
        log::debug!("REGISTER {} token={}", reg.instance, short(&reg.token));
        actions.push(Action::Send {
            peer_id: peer.peer_id.clone(),
            message: self.register_message(reg, peer.auth_token.clone()),
        });
    }

    /// Issue a LINK to the bound handshake peer unless one is already outstanding.
    fn start_handshake(&self, actions: &mut Vec<Action>) {
        let event = self.store.next_event();
        let link_token = Uuid::new_v4().to_string();
        let peer_id = self.store.update_peer(|p| {
            if p.is_legacy() || p.handshake_in_flight() {
                return None;
            }
            p.link_token = Some(link_token.clone());
            p.auth_token = None;
            p.last_link_event = Some(event);
            Some(p.peer_id.clone())
        });
        match peer_id.flatten() {
            Some(peer_id) => {
                log::info!("LINK to {} event={}", peer_id, event);
                actions.push(Action::Send {
                    peer_id,
                    message: OutboundMessage::Link { link_token },
                });
            }
            None => log::debug!("handshake already in flight, not relinking"),
        }
    }

    /// Remove an instance and its keys; drop the binding if nothing is left.
    /// With `token`, only the registration carrying it is removed.
    fn drop_instance(&self, instance: &str, token: Option<&str>) -> Option<Registration> {
        let _guard = self.lock_instance(instance);
        let (reg, peer_removed) = self.store.remove_registration_cascading(instance, token)?;
        // Key managers may hold material outside the store.
        self.keys.delete(instance);
        if peer_removed {
            log::info!("last registration gone, peer binding removed");
        }
        Some(reg)
    }

    /// Subscribe `instance`. VAPID problems are rejected before any state changes.
    pub fn register(
        &self,
        instance: &str,
        message_for_peer: Option<&str>,
        vapid: Option<&str>,
    ) -> Result<Vec<Action>, RegisterError> {
        self.register_with_features(instance, message_for_peer, vapid, &[])
    }

    /// Like [`Connector::register`], asking the distributor for `features`.
    pub fn register_with_features(
        &self,
        instance: &str,
        message_for_peer: Option<&str>,
        vapid: Option<&str>,
        features: &[String],
    ) -> Result<Vec<Action>, RegisterError> {
        let _guard = self.lock_instance(instance);
        match vapid {
            Some(v) => webpush::validate_vapid(v).map_err(|_| RegisterError::InvalidVapid)?,
            None if self.config.require_vapid => {
                let stored = self.store.registration(instance).and_then(|r| r.vapid);
                if stored.is_none() {
                    return Err(RegisterError::VapidRequired);
                }
            }
            None => {}
        }

        if let Err(e) = self.keys.generate(instance) {
            log::error!("key generation for {} failed: {}", instance, e);
            return Ok(vec![Action::Deliver(PushEvent::RegistrationFailed {
                instance: instance.to_string(),
                reason: FailedReason::InternalError,
            })]);
        }
        let reg = self
            .store
            .new_or_update_registration(instance, message_for_peer, vapid, features);

        let mut actions = Vec::new();
        let Some(peer) = self.store.peer() else {
            log::info!("register {}: no peer selected", instance);
            actions.push(Action::Deliver(PushEvent::RegistrationFailed {
                instance: instance.to_string(),
                reason: FailedReason::NoPeerSelected,
            }));
            return Ok(actions);
        };

        if peer.is_legacy() || peer.auth_token.is_some() {
            self.send_register(&mut actions, &peer, &reg);
        } else if peer.handshake_in_flight() {
            log::debug!("register {}: buffered until LINKED", instance);
        } else {
            self.start_handshake(&mut actions);
        }
        Ok(actions)
    }

    /// Bind a distributor. A different peer invalidates every acknowledgement.
    pub fn bind_peer(&self, peer_id: &str, protocol: PeerProtocol) -> Vec<Action> {
        let event = match protocol {
            PeerProtocol::Handshake => Some(self.store.next_event()),
            PeerProtocol::Legacy => None,
        };
        let link_token = Uuid::new_v4().to_string();

        let (binding, unacked) = self.store.update_binding(|regs, peer| {
            let changed = peer.as_ref().map_or(true, |p| p.peer_id != peer_id);
            if changed {
                if let Some(old) = peer.take() {
                    log::info!("peer changed from {} to {}", old.peer_id, peer_id);
                }
                for reg in regs.values_mut() {
                    reg.ack = false;
                }
            }
            let binding = peer.get_or_insert_with(|| PeerBinding::new(peer_id, protocol));
            binding.protocol = protocol;
            binding.auth_token = None;
            binding.link_token = event.map(|_| link_token.clone());
            binding.last_link_event = event.or(binding.last_link_event);
            let unacked: Vec<Registration> = regs.values().filter(|r| !r.ack).cloned().collect();
            (binding.clone(), unacked)
        });

        let mut actions = Vec::new();
        match protocol {
            PeerProtocol::Handshake => {
                log::info!("LINK to {} event={:?}", peer_id, event);
                actions.push(Action::Send {
                    peer_id: peer_id.to_string(),
                    message: OutboundMessage::Link { link_token },
                });
            }
            PeerProtocol::Legacy => {
                log::info!("bound legacy peer {}", peer_id);
                for reg in &unacked {
                    self.send_register(&mut actions, &binding, reg);
                }
            }
        }
        actions
    }

    /// LINKED from the bound peer. Ignored unless it echoes the outstanding link token.
    pub fn on_linked(&self, link_token: &str, auth_token: &str) -> Vec<Action> {
        let replay = self.store.update_binding(|regs, peer| {
            let binding = peer.as_mut()?;
            if binding.link_token.as_deref() != Some(link_token) {
                return None;
            }
            binding.auth_token = Some(auth_token.to_string());
            binding.peer_ack = true;
            binding.link_token = None;
            let unacked: Vec<Registration> = regs.values().filter(|r| !r.ack).cloned().collect();
            Some((binding.clone(), unacked))
        });
        let Some((binding, unacked)) = replay else {
            log::warn!("LINKED with unexpected token {}, ignoring", short(link_token));
            return Vec::new();
        };
        log::info!("linked with {}, replaying {} registrations", binding.peer_id, unacked.len());
        let mut actions = Vec::new();
        for reg in &unacked {
            self.send_register(&mut actions, &binding, reg);
        }
        actions
    }

    pub fn on_endpoint(&self, token: &str, url: &str, message_id: Option<&str>) -> Vec<Action> {
        let Some(reg) = self.store.registration_by_token(token) else {
            log::debug!("NEW_ENDPOINT for unknown token {}", short(token));
            return Vec::new();
        };
        if !self.store.set_ack(&reg.instance, true) {
            return Vec::new();
        }
        let peer_id = self.store.update_peer(|p| {
            p.peer_ack = true;
            p.peer_id.clone()
        });
        log::info!("new endpoint for {}", reg.instance);

        let mut actions = vec![Action::Deliver(PushEvent::NewEndpoint {
            instance: reg.instance.clone(),
            endpoint: PushEndpoint {
                url: url.to_string(),
                pub_key_set: self.keys.public_key_set(&reg.instance),
            },
        })];
        push_ack(&mut actions, peer_id, &reg.token, message_id);
        actions
    }

    pub fn on_registration_failed(&self, token: &str, reason: FailedReason) -> Vec<Action> {
        let Some(reg) = self.store.registration_by_token(token) else {
            log::debug!("REGISTRATION_FAILED for unknown token {}", short(token));
            return Vec::new();
        };
        log::info!("registration failed for {}: {}", reg.instance, reason);
        let mut actions = Vec::new();

        if reason == FailedReason::Unauth {
            self.store.set_ack(&reg.instance, false);
            match self.store.peer() {
                Some(peer) if !peer.is_legacy() => {
                    let newer = peer
                        .last_link_event
                        .map_or(true, |last| reg.event_count > last);
                    if newer {
                        self.start_handshake(&mut actions);
                    } else if peer.peer_ack && peer.auth_token.is_some() {
                        self.send_register(&mut actions, &peer, &reg);
                    } else {
                        log::debug!("{} stays buffered until the next LINKED", reg.instance);
                    }
                }
                _ => log::debug!("{} stays buffered", reg.instance),
            }
        } else if self.drop_instance(&reg.instance, Some(token)).is_none() {
            log::debug!("{} already replaced, failure ignored", reg.instance);
            return Vec::new();
        }

        actions.push(Action::Deliver(PushEvent::RegistrationFailed {
            instance: reg.instance,
            reason,
        }));
        actions
    }

    /// Best-effort UNREGISTER, then local removal. The application gets no callback.
    pub fn unregister(&self, instance: &str) -> Vec<Action> {
        let peer = self.store.peer();
        let Some(reg) = self.drop_instance(instance, None) else {
            log::debug!("unregister {}: not registered", instance);
            return Vec::new();
        };
        log::info!("unregister {}", instance);
        match peer {
            Some(peer) => vec![Action::Send {
                peer_id: peer.peer_id,
                message: OutboundMessage::Unregister {
                    token: reg.token,
                    application: self.config.application.clone(),
                },
            }],
            None => Vec::new(),
        }
    }

    /// Peer-initiated unregistration.
    pub fn on_unregistered(&self, token: &str) -> Vec<Action> {
        let Some(reg) = self.store.registration_by_token(token) else {
            log::debug!("UNREGISTERED for unknown token {}", short(token));
            return Vec::new();
        };
        if self.drop_instance(&reg.instance, Some(token)).is_none() {
            return Vec::new();
        }
        log::info!("peer unregistered {}", reg.instance);
        vec![Action::Deliver(PushEvent::Unregistered {
            instance: reg.instance,
        })]
    }

    /// Deliver a push message. Undecryptable content is delivered raw, never dropped.
    pub fn on_message(&self, token: &str, content: Vec<u8>, message_id: Option<&str>) -> Vec<Action> {
        let Some(reg) = self.store.registration_by_token(token) else {
            log::debug!("MESSAGE for unknown token {}", short(token));
            return Vec::new();
        };
        let message = match self.keys.decrypt(&reg.instance, &content) {
            Some(content) => PushMessage {
                content,
                verified: true,
            },
            None => {
                log::warn!("could not decrypt message for {}, delivering raw", reg.instance);
                PushMessage {
                    content,
                    verified: false,
                }
            }
        };
        let mut actions = vec![Action::Deliver(PushEvent::Message {
            instance: reg.instance.clone(),
            message,
        })];
        let peer_id = self.store.peer().map(|p| p.peer_id);
        push_ack(&mut actions, peer_id, &reg.token, message_id);
        actions
    }

    /// Route a message from `from`. Anything not from the bound peer is dropped.
    pub fn handle(&self, from: &str, message: InboundMessage) -> Vec<Action> {
        let bound = self.store.peer().map(|p| p.peer_id);
        if bound.as_deref() != Some(from) {
            log::warn!("{} from unbound peer {}, ignoring", message.kind(), from);
            return Vec::new();
        }
        match message {
            InboundMessage::Linked {
                link_token,
                auth_token,
            } => self.on_linked(&link_token, &auth_token),
            InboundMessage::NewEndpoint {
                token,
                endpoint,
                message_id,
            } => self.on_endpoint(&token, &endpoint, message_id.as_deref()),
            InboundMessage::RegistrationFailed { token, reason } => {
                self.on_registration_failed(&token, FailedReason::from_code(reason.as_deref()))
            }
            InboundMessage::Unregistered { token } => self.on_unregistered(&token),
            InboundMessage::Message {
                token,
                content,
                message_id,
            } => self.on_message(&token, content, message_id.as_deref()),
        }
    }

    /// Reconcile with the peer directory. A bound peer that disappeared is removed and
    /// every instance is told no peer is selected.
    pub fn on_peer_list(&self, peers: &[PeerInfo]) -> Vec<Action> {
        let listed = |p: &PeerBinding| peers.iter().any(|info| info.id == p.peer_id);
        if self.store.peer().map_or(true, |p| listed(&p)) {
            return Vec::new();
        }
        let _guards = self.lock_all_instances();
        let Some((binding, removed)) = self
            .store
            .remove_peer_if(|p| p.is_some_and(|p| !listed(p)))
        else {
            return Vec::new();
        };
        if let Some(p) = binding {
            log::info!("peer {} not available anymore, removing it", p.peer_id);
        }
        removed
            .into_iter()
            .map(|reg| {
                self.keys.delete(&reg.instance);
                Action::Deliver(PushEvent::RegistrationFailed {
                    instance: reg.instance,
                    reason: FailedReason::NoPeerSelected,
                })
            })
            .collect()
    }

    /// Drop the binding and every instance, telling the peer and the application.
    pub fn force_remove_peer(&self) -> Vec<Action> {
        let _guards = self.lock_all_instances();
        let (peer, removed) = self.store.remove_peer_if(|_| true).unwrap_or_default();
        let mut actions = Vec::new();
        for reg in removed {
            self.keys.delete(&reg.instance);
            if let Some(peer) = &peer {
                actions.push(Action::Send {
                    peer_id: peer.peer_id.clone(),
                    message: OutboundMessage::Unregister {
                        token: reg.token,
                        application: self.config.application.clone(),
                    },
                });
            }
            actions.push(Action::Deliver(PushEvent::Unregistered {
                instance: reg.instance,
            }));
        }
        actions
    }
}

fn push_ack(actions: &mut Vec<Action>, peer_id: Option<String>, token: &str, message_id: Option<&str>) {
    if let (Some(peer_id), Some(id)) = (peer_id, message_id) {
        actions.push(Action::Send {
            peer_id,
            message: OutboundMessage::MessageAck {
                token: token.to_string(),
                message_id: id.to_string(),
            },
        });
    }
}
