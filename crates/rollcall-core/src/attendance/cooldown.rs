use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::CooldownSettings;
use crate::types::BoundingBox;

/// Extra slack on top of the longest window before a persisted entry is pruned.
pub const PRUNE_MARGIN_SECS: i64 = 60;

/// Cooldown state for one (person, context) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub key: String,
    pub person_id: String,
    pub context: Option<String>,
    /// Time of the recorded sample. Never advanced by suppressed sightings.
    pub start_time: DateTime<Utc>,
    /// Re-log window in force when the entry was written.
    pub cooldown_duration_seconds: u64,
    pub last_known_bbox: BoundingBox,
    pub member_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownPhase {
    /// Recently logged; the overlay shows the confirmation.
    Visual,
    /// Past the visual window but still blocking a second write.
    ReLog,
}

/// UI-facing view of an active cooldown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CooldownOverlay {
    pub person_id: String,
    pub member_name: Option<String>,
    pub phase: CooldownPhase,
    pub remaining_secs: i64,
    pub bbox: BoundingBox,
}

#[derive(Debug, Default)]
pub struct CooldownTable {
    entries: HashMap<String, CooldownEntry>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Which window, if any, `key` is inside at `now`.
    pub fn phase(
        &self,
        key: &str,
        now: DateTime<Utc>,
        settings: &CooldownSettings,
    ) -> Option<CooldownPhase> {
        let entry = self.entries.get(key)?;
        let elapsed = now - entry.start_time;
        if elapsed < settings.visual() {
            Some(CooldownPhase::Visual)
        } else if elapsed < settings.relog() {
            Some(CooldownPhase::ReLog)
        } else {
            None
        }
    }

    /// Move the overlay anchor without touching the window.
    pub fn touch(&mut self, key: &str, bbox: BoundingBox) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_known_bbox = bbox;
        }
    }

    /// Record an accepted write, replacing any expired entry for the key.
    pub fn start(&mut self, entry: CooldownEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    pub fn get(&self, key: &str) -> Option<&CooldownEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove entries older than `max(re-log window, own duration) + margin`.
    pub fn prune(&mut self, now: DateTime<Utc>, settings: &CooldownSettings) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !is_prunable(e, now, settings));
        before - self.entries.len()
    }

    /// Load persisted entries, skipping the ones that would be pruned.
    /// Returns how many were kept.
    pub fn restore<I>(
        &mut self,
        entries: I,
        now: DateTime<Utc>,
        settings: &CooldownSettings,
    ) -> usize
    where
        I: IntoIterator<Item = CooldownEntry>,
    {
        let mut kept = 0;
        for entry in entries {
            if is_prunable(&entry, now, settings) {
                tracing::debug!(key = %entry.key, "dropping expired persisted cooldown");
                continue;
            }
            self.entries.insert(entry.key.clone(), entry);
            kept += 1;
        }
        kept
    }

    /// Snapshot sorted by key, for persistence.
    pub fn entries(&self) -> Vec<CooldownEntry> {
        let mut out: Vec<CooldownEntry> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Active cooldowns belonging to `context`, for drawing.
    pub fn overlay(
        &self,
        now: DateTime<Utc>,
        settings: &CooldownSettings,
        context: Option<&str>,
    ) -> Vec<CooldownOverlay> {
        let context = context.filter(|c| !c.is_empty());
        let mut out: Vec<CooldownOverlay> = self
            .entries
            .values()
            .filter(|e| e.context.as_deref().filter(|c| !c.is_empty()) == context)
            .filter_map(|e| {
                let phase = self.phase(&e.key, now, settings)?;
                let until = match phase {
                    CooldownPhase::Visual => e.start_time + settings.visual(),
                    CooldownPhase::ReLog => e.start_time + settings.relog(),
                };
                Some(CooldownOverlay {
                    person_id: e.person_id.clone(),
                    member_name: e.member_name.clone(),
                    phase,
                    remaining_secs: (until - now).num_seconds().max(0),
                    bbox: e.last_known_bbox,
                })
            })
            .collect();
        out.sort_by(|a, b| a.person_id.cmp(&b.person_id));
        out
    }
}

fn is_prunable(entry: &CooldownEntry, now: DateTime<Utc>, settings: &CooldownSettings) -> bool {
    let window = settings.relog_secs.max(entry.cooldown_duration_seconds) as i64;
    now - entry.start_time > chrono::Duration::seconds(window + PRUNE_MARGIN_SECS)
}
