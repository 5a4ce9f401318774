//! In-memory registry of remote entities ("models").
//!
//! Heterogeneous message payloads are folded into one record per entity id.
//! Records are created on first reference, never deleted individually, and
//! the whole registry is cleared on disconnect so stale session data is
//! never exposed as current.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::trace;

use camline_protocol::{UserLevel, VideoState};

/// Top-level attribute keys that identify the entity rather than describe
/// one of its sessions.
const IDENTITY_KEYS: [&str; 3] = ["uid", "lv", "nm"];

/// One session-state snapshot of an entity. An entity broadcasting from two
/// devices has two concurrent snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Arbitrary string-keyed state: camera state, room id, scores, etc.
    pub fields: Map<String, Value>,
    /// When this snapshot last received a merge.
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    fn new() -> Self {
        Self {
            fields: Map::new(),
            updated_at: Utc::now(),
        }
    }

    /// The snapshot's video state, when present and known.
    pub fn video_state(&self) -> Option<VideoState> {
        self.fields
            .get("vs")
            .and_then(Value::as_i64)
            .and_then(|vs| VideoState::from_i32(vs as i32))
    }
}

/// A tracked remote participant with state merged from many message kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Stable identity.
    pub id: i64,
    /// Whether this is a broadcaster-class entity.
    pub is_model: bool,
    /// Merged top-level attributes.
    pub attributes: Map<String, Value>,
    /// Merged per-entity tags.
    pub tags: BTreeSet<String>,
    /// Concurrent session snapshots keyed by session id.
    pub sessions: HashMap<i64, SessionSnapshot>,
}

impl EntityRecord {
    fn new(id: i64, is_model: bool) -> Self {
        Self {
            id,
            is_model,
            attributes: Map::new(),
            tags: BTreeSet::new(),
            sessions: HashMap::new(),
        }
    }

    /// The entity's display name, if one has been merged.
    pub fn name(&self) -> Option<&str> {
        self.attributes.get("nm").and_then(Value::as_str)
    }

    /// The single "current" session snapshot.
    ///
    /// A pure function of `sessions`: snapshots whose video state is not
    /// `Offline` outrank offline ones; within a rank the most recently
    /// updated snapshot wins, with the higher session id as the final
    /// deterministic tie-break.
    pub fn best_session(&self) -> Option<&SessionSnapshot> {
        self.sessions
            .iter()
            .max_by_key(|(sid, snapshot)| {
                let live = snapshot.video_state() != Some(VideoState::Offline);
                (live, snapshot.updated_at, **sid)
            })
            .map(|(_, snapshot)| snapshot)
    }

    /// The video state of the best session, when known.
    pub fn video_state(&self) -> Option<VideoState> {
        self.best_session().and_then(SessionSnapshot::video_state)
    }
}

/// Shallow value merge: object values merge key-by-key, everything else
/// overwrites.
fn merge_value(slot: &mut Map<String, Value>, key: &str, value: &Value) {
    match (slot.get_mut(key), value.as_object()) {
        (Some(Value::Object(existing)), Some(incoming)) => {
            for (k, v) in incoming {
                existing.insert(k.clone(), v.clone());
            }
        }
        _ => {
            slot.insert(key.to_string(), value.clone());
        }
    }
}

/// Registry of entity records keyed by numeric id.
///
/// Also tracks the once-per-connection bulk-load flags; both reset together
/// with the records on disconnect.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    records: HashMap<i64, EntityRecord>,
    models_loaded: bool,
    tags_loaded: bool,
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for `id`, if one has been created.
    pub fn get(&self, id: i64) -> Option<&EntityRecord> {
        self.records.get(&id)
    }

    /// Returns the existing record for `id` or creates one. The sole
    /// construction path, so only one record can ever exist per id.
    pub fn get_or_create(&mut self, id: i64, is_model_hint: bool) -> &mut EntityRecord {
        let record = self
            .records
            .entry(id)
            .or_insert_with(|| EntityRecord::new(id, is_model_hint));
        if is_model_hint {
            record.is_model = true;
        }
        record
    }

    /// Shallow-merges a partial field mapping into the record for `id`.
    ///
    /// Identity keys merge into the record's top-level attributes. When the
    /// partial carries a session id (`sid`), the remaining fields merge into
    /// that session snapshot (nested mappings merged, not replaced) and its
    /// update time is refreshed; without a `sid` everything merges
    /// top-level. New keys are added, existing keys overwritten, unrelated
    /// keys untouched.
    pub fn merge(&mut self, id: i64, partial: &Map<String, Value>) {
        let is_model_hint = partial
            .get("lv")
            .and_then(Value::as_i64)
            .and_then(|lv| UserLevel::from_i32(lv as i32))
            == Some(UserLevel::Model);
        let record = self.get_or_create(id, is_model_hint);
        let sid = partial.get("sid").and_then(Value::as_i64);

        trace!(id, sid, keys = partial.len(), "merging entity fields");

        match sid {
            Some(sid) => {
                for (key, value) in partial {
                    if IDENTITY_KEYS.contains(&key.as_str()) {
                        merge_value(&mut record.attributes, key, value);
                    }
                }
                let snapshot = record.sessions.entry(sid).or_insert_with(SessionSnapshot::new);
                for (key, value) in partial {
                    if !IDENTITY_KEYS.contains(&key.as_str()) {
                        merge_value(&mut snapshot.fields, key, value);
                    }
                }
                snapshot.updated_at = Utc::now();
            }
            None => {
                for (key, value) in partial {
                    merge_value(&mut record.attributes, key, value);
                }
            }
        }
    }

    /// Merges a tag list/delta into the record's tag set. Accepts an array
    /// of strings; anything else is ignored.
    pub fn merge_tags(&mut self, id: i64, delta: &Value) {
        let Some(tags) = delta.as_array() else {
            return;
        };
        let record = self.get_or_create(id, false);
        for tag in tags {
            if let Some(tag) = tag.as_str() {
                record.tags.insert(tag.to_string());
            }
        }
    }

    /// Marks the full roster bulk-list as merged. Returns true only the
    /// first time per connection.
    pub fn mark_models_loaded(&mut self) -> bool {
        !std::mem::replace(&mut self.models_loaded, true)
    }

    /// Marks the full tag bulk-list as merged. Returns true only the first
    /// time per connection.
    pub fn mark_tags_loaded(&mut self) -> bool {
        !std::mem::replace(&mut self.tags_loaded, true)
    }

    /// Number of tracked entities.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when no entities are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over all records.
    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    /// Clears every record and both bulk-load flags. Invoked on every
    /// disconnect.
    pub fn reset(&mut self) {
        self.records.clear();
        self.models_loaded = false;
        self.tags_loaded = false;
    }
}
