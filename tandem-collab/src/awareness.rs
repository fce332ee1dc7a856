//! Ephemeral per-peer presence (cursor, user, online status).
//!
//! Each peer owns one JSON state and a clock it bumps on every change.
//! Updates carry `(client, clock, json)` triples; a higher clock wins and
//! the JSON literal `null` announces that a peer is gone.
//!
//! Remote states expire when not renewed within the outdated timeout;
//! the local state is re-announced every half timeout so peers keep it.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::{Decoder, Encoder, ProtocolError};

pub type ClientId = u64;

#[derive(Debug, Clone, Copy)]
struct PeerMeta {
    clock: u64,
    last_updated: Instant,
}

/// Which peers an update touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    /// A peer announced the local client as gone; the local state has
    /// been given a newer clock and must be re-broadcast.
    pub reclaimed: bool,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client whose state appeared, changed or disappeared.
    pub fn changed(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Presence map for one room.
#[derive(Debug)]
pub struct Awareness {
    client_id: ClientId,
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, PeerMeta>,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            states: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.client_id)
    }

    pub fn state(&self, client: ClientId) -> Option<&Value> {
        self.states.get(&client)
    }

    /// Every known state, including the local one.
    pub fn states(&self) -> &HashMap<ClientId, Value> {
        &self.states
    }

    pub fn clock(&self, client: ClientId) -> Option<u64> {
        self.meta.get(&client).map(|m| m.clock)
    }

    /// Replace the local state. `None` announces the local peer as gone.
    pub fn set_local_state(&mut self, state: Option<Value>, now: Instant) -> AwarenessChange {
        let client = self.client_id;
        let clock = self.meta.get(&client).map_or(0, |m| m.clock + 1);
        let prev = match state {
            Some(value) => self.states.insert(client, value),
            None => self.states.remove(&client),
        };
        self.meta.insert(
            client,
            PeerMeta {
                clock,
                last_updated: now,
            },
        );
        let mut change = AwarenessChange::default();
        classify(&mut change, client, prev.as_ref(), self.states.get(&client));
        change
    }

    /// Encode the current entries of `clients`. Clients without a state
    /// are encoded as `null`.
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_var_uint(clients.len() as u64);
        for client in clients {
            let clock = self.clock(*client).unwrap_or(0);
            enc.write_var_uint(*client);
            enc.write_var_uint(clock);
            match self.states.get(client) {
                Some(state) => enc.write_var_string(&state.to_string()),
                None => enc.write_var_string("null"),
            }
        }
        enc.into_inner()
    }

    /// Encode every known state (answer to a query).
    pub fn encode_all(&self) -> Vec<u8> {
        let mut clients: Vec<ClientId> = self.states.keys().copied().collect();
        clients.sort_unstable();
        self.encode_update(&clients)
    }

    /// Announce the local peer as gone without forgetting its state, so a
    /// later renewal can bring it back.
    pub fn encode_local_removal(&mut self) -> Vec<u8> {
        let client = self.client_id;
        let meta = self.meta.entry(client).or_insert(PeerMeta {
            clock: 0,
            last_updated: Instant::now(),
        });
        meta.clock += 1;
        let clock = meta.clock;

        let mut enc = Encoder::new();
        enc.write_var_uint(1);
        enc.write_var_uint(client);
        enc.write_var_uint(clock);
        enc.write_var_string("null");
        enc.into_inner()
    }

    /// Bump the local clock and encode the local state, if there is one.
    pub fn renew_local(&mut self, now: Instant) -> Option<Vec<u8>> {
        let client = self.client_id;
        self.states.get(&client)?;
        let meta = self.meta.entry(client).or_insert(PeerMeta {
            clock: 0,
            last_updated: now,
        });
        meta.clock += 1;
        meta.last_updated = now;
        Some(self.encode_update(&[client]))
    }

    /// Whether the local state is due for its heartbeat.
    pub fn needs_renewal(&self, now: Instant, outdated_timeout: Duration) -> bool {
        if self.local_state().is_none() {
            return false;
        }
        match self.meta.get(&self.client_id) {
            Some(meta) => now.saturating_duration_since(meta.last_updated) >= outdated_timeout / 2,
            None => true,
        }
    }

    /// Apply an encoded update from a peer. The update is validated as a
    /// whole before anything is applied.
    pub fn apply_update(&mut self, update: &[u8], now: Instant) -> Result<AwarenessChange, ProtocolError> {
        let entries = decode_update(update)?;
        let mut change = AwarenessChange::default();

        for (client, clock, state) in entries {
            let known = self.meta.get(&client).map(|m| m.clock);
            let prev = self.states.get(&client).cloned();
            let accept = match known {
                None => state.is_some(),
                Some(curr) => {
                    curr < clock || (curr == clock && state.is_none() && prev.is_some())
                }
            };
            if !accept {
                continue;
            }

            let mut clock = clock;
            match state {
                None if client == self.client_id && prev.is_some() => {
                    // Still here: out-clock the removal and keep the state.
                    clock += 1;
                    change.reclaimed = true;
                }
                None => {
                    self.states.remove(&client);
                }
                Some(value) => {
                    self.states.insert(client, value);
                }
            }
            self.meta.insert(
                client,
                PeerMeta {
                    clock,
                    last_updated: now,
                },
            );
            classify(&mut change, client, prev.as_ref(), self.states.get(&client));
        }
        Ok(change)
    }

    /// Drop every remote state; the local one stays.
    pub fn remove_remote(&mut self) -> AwarenessChange {
        let local = self.client_id;
        let mut removed: Vec<ClientId> = self.states.keys().copied().filter(|c| *c != local).collect();
        removed.sort_unstable();
        for client in &removed {
            self.states.remove(client);
        }
        AwarenessChange {
            removed,
            ..Default::default()
        }
    }

    /// Drop remote states not renewed within `outdated_timeout`.
    pub fn expire(&mut self, now: Instant, outdated_timeout: Duration) -> AwarenessChange {
        let local = self.client_id;
        let mut removed: Vec<ClientId> = self
            .states
            .keys()
            .copied()
            .filter(|client| *client != local)
            .filter(|client| {
                self.meta.get(client).map_or(true, |m| {
                    now.saturating_duration_since(m.last_updated) >= outdated_timeout
                })
            })
            .collect();
        removed.sort_unstable();
        for client in &removed {
            self.states.remove(client);
        }
        AwarenessChange {
            removed,
            ..Default::default()
        }
    }
}

fn classify(change: &mut AwarenessChange, client: ClientId, prev: Option<&Value>, next: Option<&Value>) {
    match (prev, next) {
        (None, Some(_)) => change.added.push(client),
        (Some(_), None) => change.removed.push(client),
        (Some(a), Some(b)) if a != b => change.updated.push(client),
        _ => {}
    }
}

type UpdateEntry = (ClientId, u64, Option<Value>);

fn decode_update(update: &[u8]) -> Result<Vec<UpdateEntry>, ProtocolError> {
    let mut dec = Decoder::new(update);
    let n = dec.read_var_uint()?;
    if n > dec.remaining() as u64 {
        return Err(ProtocolError::LengthOverflow(n));
    }
    let mut entries = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let client = dec.read_var_uint()?;
        let clock = dec.read_var_uint()?;
        let json = dec.read_var_string()?;
        let state: Value = serde_json::from_str(json)
            .map_err(|e| ProtocolError::MalformedAwareness(e.to_string()))?;
        entries.push((client, clock, (!state.is_null()).then_some(state)));
    }
    dec.finish()?;
    Ok(entries)
}
