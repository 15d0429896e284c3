//! Registry of devices seen on the LAN, plus the retry queue of devices whose
//! credentials are not known yet.
//!
//! Entries, the unresolved set and the pending queue share one lock so a
//! discovery upsert and its queue registration are a single step.

use crate::protocol::Version;
use crate::store::CredentialRecord;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// Fields owned by the registry; announcement keys with these names are not
/// copied into `extra`.
const RESERVED_FIELDS: &[&str] = &["id", "ip", "name", "key", "mac", "version", "last_seen"];

/// A decoded discovery announcement.
#[derive(Debug, Clone, Default)]
pub struct Announcement {
    /// Empty when the packet could not be decoded.
    pub id: String,
    pub ip: String,
    pub version: Option<Version>,
    /// Every field of the announcement as received.
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
    pub id: String,
    pub ip: String,
    pub name: String,
    pub key: String,
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Unix seconds of the last announcement.
    pub last_seen: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RegistryEntry {
    pub fn from_announcement(ann: &Announcement) -> Self {
        let extra = ann
            .fields
            .iter()
            .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            id: ann.id.clone(),
            ip: ann.ip.clone(),
            name: String::new(),
            key: String::new(),
            mac: String::new(),
            version: ann.version,
            last_seen: unix_now(),
            extra,
        }
    }

    /// Copy non-empty credential fields over this entry.
    pub fn enrich(&mut self, record: &CredentialRecord) {
        if !record.name.is_empty() {
            self.name = record.name.clone();
        }
        if !record.key.is_empty() {
            self.key = record.key.clone();
        }
        if let Some(mac) = record.mac.as_ref().filter(|m| !m.is_empty()) {
            self.mac = mac.clone();
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.name.is_empty() || !self.key.is_empty()
    }
}

/// One slot in the retry queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingResolution {
    /// Device waiting for credentials with `remaining` scheduled attempts left.
    Pending { id: String, remaining: u32 },
    /// Request for one immediate out-of-schedule pass.
    ForceResolveSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// Triggered by the retry timer; consumes budget.
    Scheduled,
    /// Triggered by [`Registry::force_resolve`]; free of charge.
    Forced,
}

/// Work captured for one resolver pass.
#[derive(Debug, Clone)]
pub struct ResolutionPass {
    pub kind: PassKind,
    pub candidates: Vec<String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct PassOutcome {
    pub resolved: Vec<String>,
    pub expired: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, RegistryEntry>,
    /// Ids discovered without credentials and not resolved since.
    unresolved: BTreeSet<String>,
    pending: Vec<PendingResolution>,
}

#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
    force: Notify,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update an entry. Returns true when the id was new.
    pub fn upsert(&self, entry: RegistryEntry) -> bool {
        let mut state = self.state.lock();
        let is_new = !state.entries.contains_key(&entry.id);
        state.entries.insert(entry.id.clone(), entry);
        is_new
    }

    /// Record an announcement, enriching it from `credentials`. A new device
    /// with neither name nor key is queued for resolution with
    /// `retry_budget` attempts; a known one that gains credentials leaves the
    /// queue. Returns true when the id was new.
    pub fn observe(
        &self,
        ann: &Announcement,
        credentials: Option<&CredentialRecord>,
        retry_budget: u32,
    ) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.entries.get_mut(&ann.id) {
            Some(entry) => {
                let fresh = RegistryEntry::from_announcement(ann);
                entry.ip = fresh.ip;
                entry.last_seen = fresh.last_seen;
                entry.extra = fresh.extra;
                if fresh.version.is_some() {
                    entry.version = fresh.version;
                }
                if let Some(record) = credentials {
                    entry.enrich(record);
                }
                if entry.has_credentials() && state.unresolved.remove(&ann.id) {
                    state.pending.retain(|p| {
                        !matches!(p, PendingResolution::Pending { id, .. } if *id == ann.id)
                    });
                }
                false
            }
            None => {
                let mut entry = RegistryEntry::from_announcement(ann);
                if let Some(record) = credentials {
                    entry.enrich(record);
                }
                if !entry.has_credentials()
                    && !entry.id.is_empty()
                    && state.unresolved.insert(entry.id.clone())
                {
                    state.pending.push(PendingResolution::Pending {
                        id: entry.id.clone(),
                        remaining: retry_budget,
                    });
                }
                state.entries.insert(entry.id.clone(), entry);
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<RegistryEntry> {
        self.state.lock().entries.get(id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<RegistryEntry> {
        self.state
            .lock()
            .entries
            .values()
            .find(|e| e.name == name)
            .cloned()
    }

    /// Map a request token to a registry id: the token itself when it is a
    /// known id, otherwise the id of the first entry named `token`.
    pub fn resolve_token(&self, token: &str) -> Option<String> {
        let state = self.state.lock();
        if state.entries.contains_key(token) {
            return Some(token.to_string());
        }
        state
            .entries
            .values()
            .find(|e| e.name == token)
            .map(|e| e.id.clone())
    }

    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Copy of every entry, ordered by id.
    pub fn snapshot(&self) -> BTreeMap<String, RegistryEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    pub fn pending(&self) -> Vec<PendingResolution> {
        self.state.lock().pending.clone()
    }

    pub fn unresolved(&self) -> Vec<String> {
        self.state.lock().unresolved.iter().cloned().collect()
    }

    /// Arm one immediate resolver pass. Arming twice before the pass runs has
    /// the same effect as arming once.
    pub fn force_resolve(&self) {
        let mut state = self.state.lock();
        if !state
            .pending
            .contains(&PendingResolution::ForceResolveSignal)
        {
            state.pending.push(PendingResolution::ForceResolveSignal);
        }
        drop(state);
        self.force.notify_one();
    }

    /// Completes after [`force_resolve`](Self::force_resolve) is called.
    pub fn force_requested(&self) -> Notified<'_> {
        self.force.notified()
    }

    /// Take the work for the next pass, if any. A pending force signal is
    /// consumed here and wins over a due schedule.
    pub fn begin_pass(&self, schedule_due: bool) -> Option<ResolutionPass> {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|p| *p != PendingResolution::ForceResolveSignal);
        if state.pending.len() != before {
            return Some(ResolutionPass {
                kind: PassKind::Forced,
                candidates: state.unresolved.iter().cloned().collect(),
            });
        }

        if !schedule_due || state.pending.is_empty() {
            return None;
        }
        let candidates = state
            .pending
            .iter()
            .filter_map(|p| match p {
                PendingResolution::Pending { id, .. } => Some(id.clone()),
                PendingResolution::ForceResolveSignal => None,
            })
            .collect();
        Some(ResolutionPass {
            kind: PassKind::Scheduled,
            candidates,
        })
    }

    /// Apply the results of a pass. Resolved ids leave the queue and get their
    /// entry enriched; on a scheduled pass every other candidate loses one
    /// attempt and is dropped at zero.
    pub fn complete_pass(
        &self,
        pass: &ResolutionPass,
        resolved: Vec<(String, CredentialRecord)>,
    ) -> PassOutcome {
        let mut state = self.state.lock();
        let mut outcome = PassOutcome::default();

        for (id, record) in resolved {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.enrich(&record);
            }
            state.unresolved.remove(&id);
            state
                .pending
                .retain(|p| !matches!(p, PendingResolution::Pending { id: pid, .. } if *pid == id));
            outcome.resolved.push(id);
        }

        if pass.kind == PassKind::Scheduled {
            let mut expired = Vec::new();
            state.pending.retain_mut(|p| match p {
                PendingResolution::Pending { id, remaining }
                    if pass.candidates.contains(id) && !outcome.resolved.contains(id) =>
                {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        expired.push(id.clone());
                        false
                    } else {
                        true
                    }
                }
                _ => true,
            });
            outcome.expired = expired;
        }
        outcome
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
