//! Inference session pool.
//!
//! Model load/compile is expensive, so sessions are built lazily per model id,
//! capped per model, and handed out exclusively to one caller at a time.
//! Callers that find every instance busy and the cap reached wait on a short
//! condvar poll until one is checked back in.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

pub const DEFAULT_MAX_PER_MODEL: usize = 5;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent instances per model id.
    pub max_per_model: usize,
    /// Idle instances older than this are dropped by [`SessionPool::sweep`].
    pub idle_timeout: Duration,
    /// How long a waiting caller sleeps between availability checks.
    pub poll_interval: Duration,
    /// Give up waiting for a free instance after this long. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_model: DEFAULT_MAX_PER_MODEL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            acquire_timeout: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum PoolError<E: std::error::Error + 'static> {
    #[error("failed to construct session for model {model_id}: {source}")]
    Construct {
        model_id: String,
        #[source]
        source: E,
    },
    #[error("no session for model {model_id} became free within {waited:?}")]
    Timeout { model_id: String, waited: Duration },
}

/// Per-model occupancy, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub model_id: String,
    pub total: usize,
    pub in_use: usize,
}

struct Slot<S> {
    id: u64,
    /// `None` while checked out or still under construction.
    session: Option<S>,
    in_use: bool,
    last_used: Instant,
}

struct PoolState<S> {
    models: HashMap<String, Vec<Slot<S>>>,
    next_id: u64,
}

pub struct SessionPool<S> {
    config: PoolConfig,
    state: Mutex<PoolState<S>>,
    freed: Condvar,
}

/// Exclusive handle to a pooled session. Returned to the pool on
/// [`PooledSession::release`] or when dropped.
pub struct PooledSession<'a, S> {
    pool: &'a SessionPool<S>,
    model_id: String,
    slot_id: u64,
    session: Option<S>,
}

impl<S> SessionPool<S> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                models: HashMap::new(),
                next_id: 1,
            }),
            freed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<S>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check out a session for `model_id`.
    ///
    /// Reuses an idle instance when one exists, otherwise builds a new one with
    /// `construct` if the model is below its cap, otherwise waits for a release.
    /// `construct` runs without the pool lock held; if it fails the reserved
    /// slot is freed and the error is returned.
    pub fn get_session<E, F>(
        &self,
        model_id: &str,
        construct: F,
    ) -> Result<PooledSession<'_, S>, PoolError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce() -> Result<S, E>,
    {
        let started = Instant::now();
        let mut state = self.lock();

        loop {
            let next_id = state.next_id;
            let slots = state.models.entry(model_id.to_string()).or_default();

            if let Some(slot) = slots
                .iter_mut()
                .find(|s| !s.in_use && s.session.is_some())
            {
                slot.in_use = true;
                slot.last_used = Instant::now();
                return Ok(PooledSession {
                    pool: self,
                    model_id: model_id.to_string(),
                    slot_id: slot.id,
                    session: slot.session.take(),
                });
            }

            if slots.len() < self.config.max_per_model {
                slots.push(Slot {
                    id: next_id,
                    session: None,
                    in_use: true,
                    last_used: Instant::now(),
                });
                state.next_id += 1;
                drop(state);

                tracing::debug!(model_id, slot = next_id, "constructing pooled session");
                return match construct() {
                    Ok(session) => Ok(PooledSession {
                        pool: self,
                        model_id: model_id.to_string(),
                        slot_id: next_id,
                        session: Some(session),
                    }),
                    Err(source) => {
                        self.discard(model_id, next_id);
                        tracing::warn!(model_id, error = %source, "session construction failed");
                        Err(PoolError::Construct {
                            model_id: model_id.to_string(),
                            source,
                        })
                    }
                };
            }

            if let Some(limit) = self.config.acquire_timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(PoolError::Timeout {
                        model_id: model_id.to_string(),
                        waited,
                    });
                }
            }

            let (guard, _) = self
                .freed
                .wait_timeout(state, self.config.poll_interval)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Return a session to the pool and mark it idle.
    pub fn release(&self, handle: PooledSession<'_, S>) {
        drop(handle);
    }

    fn check_in(&self, model_id: &str, slot_id: u64, session: S) {
        let mut state = self.lock();
        if let Some(slot) = state
            .models
            .get_mut(model_id)
            .and_then(|slots| slots.iter_mut().find(|s| s.id == slot_id))
        {
            slot.session = Some(session);
            slot.in_use = false;
            slot.last_used = Instant::now();
        }
        drop(state);
        self.freed.notify_all();
    }

    fn discard(&self, model_id: &str, slot_id: u64) {
        let mut state = self.lock();
        if let Some(slots) = state.models.get_mut(model_id) {
            slots.retain(|s| s.id != slot_id);
        }
        drop(state);
        self.freed.notify_all();
    }

    /// Drop idle sessions unused for longer than the idle timeout.
    /// Returns the number evicted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut state = self.lock();
        let mut evicted = 0;

        for (model_id, slots) in state.models.iter_mut() {
            let before = slots.len();
            slots.retain(|s| s.in_use || now.saturating_duration_since(s.last_used) < idle_timeout);
            let removed = before - slots.len();
            if removed > 0 {
                tracing::debug!(model_id = %model_id, removed, "evicted idle sessions");
            }
            evicted += removed;
        }
        state.models.retain(|_, slots| !slots.is_empty());
        evicted
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let state = self.lock();
        let mut stats: Vec<PoolStats> = state
            .models
            .iter()
            .map(|(model_id, slots)| PoolStats {
                model_id: model_id.clone(),
                total: slots.len(),
                in_use: slots.iter().filter(|s| s.in_use).count(),
            })
            .collect();
        stats.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        stats
    }
}

impl<S> PooledSession<'_, S> {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl<S> Deref for PooledSession<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        // Some until drop
        self.session.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<S> DerefMut for PooledSession<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<S> Drop for PooledSession<'_, S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.check_in(&self.model_id, self.slot_id, session);
        }
    }
}
