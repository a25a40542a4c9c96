use std::sync::Arc;

use chrono::Utc;
use rollcall_core::onnx::OnnxFaceAnalyzer;
use rollcall_core::SettingsHandle;
use tokio::sync::watch;
use zbus::interface;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::pipeline::OverlaySnapshot;
use crate::store::AttendanceStore;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

const MAX_RECENT_RECORDS: u32 = 500;

/// Shared state accessible by D-Bus method handlers.
///
/// Every field is internally synchronized, so handlers never hold a lock
/// across an await.
pub struct AppState {
    pub config: Config,
    pub settings: SettingsHandle,
    pub engine: EngineHandle,
    pub analyzer: Arc<OnnxFaceAnalyzer>,
    pub store: AttendanceStore,
    pub overlay: watch::Receiver<OverlaySnapshot>,
    pub gallery_size: usize,
}

/// D-Bus control and overlay surface of the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub state: Arc<AppState>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// The re-log window must cover the visual one and neither may be zero.
fn validate_cooldowns(visual_secs: u64, relog_secs: u64) -> Result<(), String> {
    if visual_secs == 0 || relog_secs == 0 {
        return Err("cooldowns must be positive".into());
    }
    if relog_secs < visual_secs {
        return Err(format!(
            "re-log cooldown ({relog_secs}s) is shorter than the visual cooldown ({visual_secs}s)"
        ));
    }
    Ok(())
}

fn normalize_context(context: &str) -> Option<String> {
    let trimmed = context.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = &self.state;
        let settings = state.settings.current();
        let overlay = state.overlay.borrow().clone();

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "running": overlay.running,
            "dedup_strategy": state.config.dedup_strategy.to_string(),
            "context": settings.context,
            "spoof_detection": settings.spoof_detection,
            "visual_cooldown_secs": settings.cooldowns.visual_secs,
            "relog_cooldown_secs": settings.cooldowns.relog_secs,
            "similarity_threshold": state.config.similarity_threshold,
            "gallery_size": state.gallery_size,
            "frames_processed": overlay.frames_processed,
            "open_sessions": overlay.open_sessions,
            "active_cooldowns": overlay.cooldowns.len(),
            "engine_busy": state.engine.is_busy(),
            "pools": state.analyzer.pool_stats(),
        })
        .to_string())
    }

    /// Current tracks and cooldown overlay as JSON.
    async fn overlay(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.state.overlay.borrow().clone();
        serde_json::to_string(&snapshot).map_err(failed)
    }

    async fn set_cooldowns(&self, visual_secs: u64, relog_secs: u64) -> zbus::fdo::Result<()> {
        validate_cooldowns(visual_secs, relog_secs).map_err(zbus::fdo::Error::InvalidArgs)?;
        self.state.settings.set_cooldowns(visual_secs, relog_secs);
        Ok(())
    }

    async fn set_spoof_detection(&self, enabled: bool) -> zbus::fdo::Result<()> {
        self.state.settings.set_spoof_detection(enabled);
        Ok(())
    }

    /// Switch the active subject/group. An empty string clears it.
    ///
    /// Returns the new context generation.
    async fn set_context(&self, context: &str) -> zbus::fdo::Result<u64> {
        Ok(self.state.settings.set_context(normalize_context(context)))
    }

    /// Most recent attendance records as JSON, newest first.
    async fn recent_records(&self, limit: u32) -> zbus::fdo::Result<String> {
        let limit = limit.clamp(1, MAX_RECENT_RECORDS);
        let records = self.state.store.recent(limit).await.map_err(|e| {
            tracing::error!(error = %e, "recent_records: store query failed");
            failed(e)
        })?;
        serde_json::to_string(&records).map_err(failed)
    }

    /// Records logged since midnight UTC.
    async fn today_count(&self) -> zbus::fdo::Result<u64> {
        self.state.store.today_count(Utc::now()).await.map_err(|e| {
            tracing::error!(error = %e, "today_count: store query failed");
            failed(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_cooldowns() {
        assert!(validate_cooldowns(15, 1800).is_ok());
        assert!(validate_cooldowns(30, 30).is_ok());
        assert!(validate_cooldowns(0, 1800).is_err());
        assert!(validate_cooldowns(60, 30).is_err());
    }

    #[test]
    fn test_empty_context_clears() {
        assert_eq!(normalize_context(""), None);
        assert_eq!(normalize_context("   "), None);
        assert_eq!(normalize_context(" math-101 "), Some("math-101".to_string()));
    }
}
