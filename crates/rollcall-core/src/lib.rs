//! rollcall-core: face attendance recognition engine.
//!
//! Tracks faces across frames, gates recognized faces through anti-spoofing,
//! and decides when a recognized identity produces exactly one attendance
//! write per visit. ONNX Runtime adapters for detection, recognition and
//! liveness live under [`onnx`].

pub mod attendance;
pub mod inference;
pub mod liveness;
pub mod onnx;
pub mod pool;
pub mod settings;
pub mod stability;
pub mod tracker;
pub mod types;

pub use attendance::{AttendanceEngine, AttendanceWrite, Decision, DedupStrategy, Observation};
pub use inference::{AnalyzeOptions, FaceAnalysis, FrameAnalyzer, InferenceError};
pub use liveness::{LivenessResult, LivenessStatus, LivenessVerdict};
pub use pool::{PoolConfig, PoolError, PooledSession, SessionPool};
pub use settings::{CooldownSettings, RuntimeSettings, SettingsHandle};
pub use tracker::{FaceTracker, TrackerConfig};
pub use types::{BoundingBox, Detection, Frame, Landmarks, Recognition};
