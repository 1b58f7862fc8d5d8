//! Periodic checkpointing.
//!
//! A checkpoint makes the WAL redundant: under the table's write lock it
//! appends a CHECKPOINT record, flushes every dirty page and the header,
//! and truncates the log. Recovery after that point starts from an empty
//! log.
//!
//! The background task holds only a `Weak` reference to the store, so a
//! dropped store ends the task; a shutdown signal ends it earlier during
//! controlled close.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::store::StoreInner;

/// Default interval between automatic checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

/// Checkpoint scheduling configuration.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointConfig {
    /// Interval between automatic checkpoints. Zero disables the
    /// background task; checkpoints then run only at close or on demand.
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

impl CheckpointConfig {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// No automatic checkpoints (manual and close-time only).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            interval: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.interval.is_zero()
    }
}

/// Spawn the periodic checkpoint task for a store.
///
/// The task ticks every `interval`, upgrades its weak store reference, and
/// runs a checkpoint. It exits when the store is dropped or the shutdown
/// signal fires; the final close-time checkpoint is the store's own job.
pub(crate) fn spawn_checkpointer(
    store: Weak<StoreInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so
        // a fresh table is not checkpointed before its first write.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    if let Err(e) = store.run_checkpoint().await {
                        tracing::warn!("periodic checkpoint failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
    })
}
