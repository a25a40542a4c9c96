//! Live runtime settings.
//!
//! The pipeline reads these on every cycle instead of caching them at
//! construction, so the control surface can retune cooldowns or toggle
//! spoof detection while capture is running.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub const DEFAULT_VISUAL_COOLDOWN_SECS: u64 = 15;
pub const DEFAULT_RELOG_COOLDOWN_SECS: u64 = 1800;

/// The two cooldown windows layered over each logged identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownSettings {
    /// Short window that only throttles UI churn.
    pub visual_secs: u64,
    /// Long window that blocks a second attendance write.
    pub relog_secs: u64,
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            visual_secs: DEFAULT_VISUAL_COOLDOWN_SECS,
            relog_secs: DEFAULT_RELOG_COOLDOWN_SECS,
        }
    }
}

impl CooldownSettings {
    pub fn visual(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.visual_secs as i64)
    }

    pub fn relog(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.relog_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub cooldowns: CooldownSettings,
    pub spoof_detection: bool,
    /// Active subject/group; scopes cooldown keys.
    pub context: Option<String>,
    /// Bumped on every context change so in-flight results can be recognised as stale.
    pub generation: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            cooldowns: CooldownSettings::default(),
            spoof_detection: true,
            context: None,
            generation: 0,
        }
    }
}

/// Clone-safe handle to the live settings.
#[derive(Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<RuntimeSettings>>,
}

impl SettingsHandle {
    pub fn new(initial: RuntimeSettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current settings.
    pub fn current(&self) -> RuntimeSettings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeSettings> {
        self.tx.subscribe()
    }

    pub fn set_cooldowns(&self, visual_secs: u64, relog_secs: u64) {
        self.tx.send_modify(|s| {
            s.cooldowns = CooldownSettings {
                visual_secs,
                relog_secs,
            };
        });
        tracing::info!(visual_secs, relog_secs, "cooldowns updated");
    }

    pub fn set_spoof_detection(&self, enabled: bool) {
        self.tx.send_modify(|s| s.spoof_detection = enabled);
        tracing::info!(enabled, "spoof detection toggled");
    }

    /// Switch the active context. Returns the new generation.
    pub fn set_context(&self, context: Option<String>) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|s| {
            if s.context != context {
                s.context = context.clone();
                s.generation += 1;
            }
            generation = s.generation;
        });
        tracing::info!(context = ?context, generation, "context changed");
        generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setters_are_visible_to_readers() {
        let handle = SettingsHandle::new(RuntimeSettings::default());
        let reader = handle.clone();

        handle.set_cooldowns(5, 60);
        handle.set_spoof_detection(false);

        let s = reader.current();
        assert_eq!(s.cooldowns.visual_secs, 5);
        assert_eq!(s.cooldowns.relog_secs, 60);
        assert!(!s.spoof_detection);
    }

    #[test]
    fn test_context_change_bumps_generation() {
        let handle = SettingsHandle::new(RuntimeSettings::default());
        assert_eq!(handle.set_context(Some("room-a".into())), 1);
        // same context again is not a change
        assert_eq!(handle.set_context(Some("room-a".into())), 1);
        assert_eq!(handle.set_context(None), 2);
        assert_eq!(handle.current().context, None);
    }

    #[test]
    fn test_defaults() {
        let s = RuntimeSettings::default();
        assert_eq!(s.cooldowns.visual_secs, 15);
        assert_eq!(s.cooldowns.relog_secs, 1800);
        assert!(s.spoof_detection);
        assert_eq!(s.cooldowns.relog(), chrono::Duration::seconds(1800));
    }
}
