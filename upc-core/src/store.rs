//! Persistent connector state: registrations, peer binding, event counter, key records.
//!
//! Each family has its own lock and is written through the backend as one batch per
//! logical update. When two families are needed the lock order is
//! registrations → peer → keys. Store APIs never fail: unreadable families load as
//! empty and failed writes are logged while the in-memory state carries on.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{MemoryBackend, StoreBackend, StoreError};
use crate::protocol::{short, PeerProtocol};

const REGISTRATIONS_KEY: &str = "registrations";
const PEER_KEY: &str = "peer";
const EVENT_COUNTER_KEY: &str = "event_counter";
const KEYS_KEY: &str = "keys";

/// One subscription, keyed by instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub instance: String,
    /// UUID v4, unique across instances.
    pub token: String,
    pub message_for_peer: Option<String>,
    pub vapid: Option<String>,
    /// Distributor features requested on the last register call.
    #[serde(default)]
    pub features: Vec<String>,
    /// Set when the peer confirmed this subscription with an endpoint.
    pub ack: bool,
    /// Event counter value when this registration was last (re)issued.
    pub event_count: u64,
}

/// The bound distributor.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerBinding {
    pub peer_id: String,
    /// The peer answered at least once since it was bound.
    pub peer_ack: bool,
    pub protocol: PeerProtocol,
    /// Outstanding LINK token, cleared on LINKED.
    pub link_token: Option<String>,
    pub auth_token: Option<String>,
    /// Event counter value when the last LINK was issued.
    pub last_link_event: Option<u64>,
}

impl PeerBinding {
    pub fn new(peer_id: impl Into<String>, protocol: PeerProtocol) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_ack: false,
            protocol,
            link_token: None,
            auth_token: None,
            last_link_event: None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.protocol == PeerProtocol::Legacy
    }

    /// LINK sent, LINKED not yet received.
    pub fn handshake_in_flight(&self) -> bool {
        self.link_token.is_some() && self.auth_token.is_none()
    }
}

impl fmt::Debug for PeerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerBinding")
            .field("peer_id", &self.peer_id)
            .field("peer_ack", &self.peer_ack)
            .field("protocol", &self.protocol)
            .field("link_token", &self.link_token.as_deref().map(short))
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("last_link_event", &self.last_link_event)
            .finish()
    }
}

type Entry = Result<(&'static str, Option<String>), StoreError>;

fn family<T: Serialize>(key: &'static str, value: &T) -> Entry {
    Ok((key, Some(serde_json::to_string(value)?)))
}

fn load_family<T: DeserializeOwned + Default>(backend: &dyn StoreBackend, key: &str) -> T {
    match backend.load(key) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            log::warn!("store family {} unreadable, starting empty: {}", key, e);
            T::default()
        }),
        Ok(None) => T::default(),
        Err(e) => {
            log::warn!("store family {} could not be read: {}", key, e);
            T::default()
        }
    }
}

fn fresh_token(regs: &BTreeMap<String, Registration>) -> String {
    loop {
        let token = Uuid::new_v4().to_string();
        if !regs.values().any(|r| r.token == token) {
            return token;
        }
    }
}

pub struct Store {
    backend: Box<dyn StoreBackend>,
    registrations: Mutex<BTreeMap<String, Registration>>,
    peer: Mutex<Option<PeerBinding>>,
    event_counter: Mutex<u64>,
    key_records: Mutex<BTreeMap<String, String>>,
}

impl Store {
    /// Load every family from `backend`.
    pub fn open(backend: impl StoreBackend + 'static) -> Self {
        let registrations = load_family(&backend, REGISTRATIONS_KEY);
        let peer = load_family(&backend, PEER_KEY);
        let event_counter = load_family(&backend, EVENT_COUNTER_KEY);
        let key_records = load_family(&backend, KEYS_KEY);
        Self {
            backend: Box::new(backend),
            registrations: Mutex::new(registrations),
            peer: Mutex::new(peer),
            event_counter: Mutex::new(event_counter),
            key_records: Mutex::new(key_records),
        }
    }

    pub fn in_memory() -> Self {
        Self::open(MemoryBackend::new())
    }

    fn commit(&self, batch: Vec<Entry>) {
        let result = batch
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .and_then(|b| self.backend.commit(&b));
        if let Err(e) = result {
            log::error!("store write failed, keeping in-memory state: {}", e);
        }
    }

    /// Return the current event counter and advance it.
    pub fn next_event(&self) -> u64 {
        let mut counter = self.event_counter.lock();
        let current = *counter;
        *counter += 1;
        self.commit(vec![family(EVENT_COUNTER_KEY, &*counter)]);
        current
    }

    // --- registrations ---

    /// Create the registration for `instance`, or refresh it keeping its token.
    /// `message_for_peer` and `vapid` replace stored values only when given; `features`
    /// always replaces. Always stamps a new event count and clears `ack`.
    pub fn new_or_update_registration(
        &self,
        instance: &str,
        message_for_peer: Option<&str>,
        vapid: Option<&str>,
        features: &[String],
    ) -> Registration {
        let event = self.next_event();
        let mut regs = self.registrations.lock();
        let reg = match regs.get_mut(instance) {
            Some(reg) => {
                if let Some(m) = message_for_peer {
                    reg.message_for_peer = Some(m.to_string());
                }
                if let Some(v) = vapid {
                    reg.vapid = Some(v.to_string());
                }
                reg.features = features.to_vec();
                reg.ack = false;
                reg.event_count = event;
                reg.clone()
            }
            None => {
                let reg = Registration {
                    instance: instance.to_string(),
                    token: fresh_token(&regs),
                    message_for_peer: message_for_peer.map(str::to_string),
                    vapid: vapid.map(str::to_string),
                    features: features.to_vec(),
                    ack: false,
                    event_count: event,
                };
                regs.insert(instance.to_string(), reg.clone());
                reg
            }
        };
        self.commit(vec![family(REGISTRATIONS_KEY, &*regs)]);
        log::debug!("registration {} token={} event={}", instance, short(&reg.token), event);
        reg
    }

    pub fn registration(&self, instance: &str) -> Option<Registration> {
        self.registrations.lock().get(instance).cloned()
    }

    pub fn registration_by_token(&self, token: &str) -> Option<Registration> {
        self.registrations
            .lock()
            .values()
            .find(|r| r.token == token)
            .cloned()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().values().cloned().collect()
    }

    /// Returns false when `instance` is unknown.
    pub fn set_ack(&self, instance: &str, ack: bool) -> bool {
        let mut regs = self.registrations.lock();
        match regs.get_mut(instance) {
            Some(reg) => {
                reg.ack = ack;
                self.commit(vec![family(REGISTRATIONS_KEY, &*regs)]);
                true
            }
            None => false,
        }
    }

    /// Drop `instance` with its key record, and the peer binding when no registration is
    /// left, as one batch. With `token`, nothing happens unless the registration carries it.
    /// Returns the removed registration and whether the binding went with it.
    pub fn remove_registration_cascading(
        &self,
        instance: &str,
        token: Option<&str>,
    ) -> Option<(Registration, bool)> {
        let mut regs = self.registrations.lock();
        let current = regs.get(instance)?;
        if token.is_some_and(|t| t != current.token) {
            return None;
        }
        let reg = regs.remove(instance)?;
        let mut peer = self.peer.lock();
        let peer_removed = regs.is_empty() && peer.take().is_some();
        let mut keys = self.key_records.lock();
        keys.remove(instance);
        self.commit(vec![
            family(REGISTRATIONS_KEY, &*regs),
            family(PEER_KEY, &*peer),
            family(KEYS_KEY, &*keys),
        ]);
        Some((reg, peer_removed))
    }

    // --- peer binding ---

    pub fn peer(&self) -> Option<PeerBinding> {
        self.peer.lock().clone()
    }

    /// Mutate the bound peer. `None` when no peer is bound.
    pub fn update_peer<R>(&self, f: impl FnOnce(&mut PeerBinding) -> R) -> Option<R> {
        let mut peer = self.peer.lock();
        let out = f(peer.as_mut()?);
        self.commit(vec![family(PEER_KEY, &*peer)]);
        Some(out)
    }

    /// Mutate registrations and peer binding together, written as one batch.
    pub fn update_binding<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Registration>, &mut Option<PeerBinding>) -> R,
    ) -> R {
        let mut regs = self.registrations.lock();
        let mut peer = self.peer.lock();
        let out = f(&mut *regs, &mut *peer);
        self.commit(vec![
            family(REGISTRATIONS_KEY, &*regs),
            family(PEER_KEY, &*peer),
        ]);
        out
    }

    /// When `pred` holds for the current binding, clear it together with every
    /// registration and their key records in one batch. Returns what was removed.
    pub fn remove_peer_if(
        &self,
        pred: impl FnOnce(Option<&PeerBinding>) -> bool,
    ) -> Option<(Option<PeerBinding>, Vec<Registration>)> {
        let mut regs = self.registrations.lock();
        let mut peer = self.peer.lock();
        if !pred(peer.as_ref()) {
            return None;
        }
        let binding = peer.take();
        let removed: Vec<Registration> = std::mem::take(&mut *regs).into_values().collect();
        let mut keys = self.key_records.lock();
        for reg in &removed {
            keys.remove(&reg.instance);
        }
        self.commit(vec![
            family(REGISTRATIONS_KEY, &*regs),
            family(PEER_KEY, &*peer),
            family(KEYS_KEY, &*keys),
        ]);
        Some((binding, removed))
    }

    // --- key records ---

    pub fn key_record(&self, instance: &str) -> Option<String> {
        self.key_records.lock().get(instance).cloned()
    }

    pub fn put_key_record(&self, instance: &str, record: String) {
        let mut keys = self.key_records.lock();
        keys.insert(instance.to_string(), record);
        self.commit(vec![family(KEYS_KEY, &*keys)]);
    }

    pub fn remove_key_record(&self, instance: &str) -> bool {
        let mut keys = self.key_records.lock();
        let removed = keys.remove(instance).is_some();
        if removed {
            self.commit(vec![family(KEYS_KEY, &*keys)]);
        }
        removed
    }
}
