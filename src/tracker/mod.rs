//! Run tracking engine. The public API for recording and reading runs.
//!
//! The tracker owns no threads. Every operation is a short sequence of
//! store round-trips; the periodic stuck scan is driven from outside,
//! either by [`StuckWatcher`] or by a cron calling `wftrack scan-stuck`.

pub mod lifecycle;
pub mod progress;
pub mod stream;
pub mod stuck;
pub mod watch;

pub use progress::{PhaseProgress, RunWithProgress, StepStatus, SubstepProgress, project};
pub use stream::{EventStream, StreamEvent, StreamEventType, format_event_to_stream};
pub use stuck::{DEFAULT_STUCK_THRESHOLD, StuckFailure, StuckReport};
pub use watch::{StuckWatcher, WatchConfig};

use std::sync::Arc;

use crate::steps::StepsRegistry;
use crate::store::{MemoryStore, RunStore};

/// The run tracker. Enforces the run lifecycle on top of a [`RunStore`].
#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn RunStore>,
    steps: Arc<StepsRegistry>,
}

impl Tracker {
    pub fn new(store: Arc<dyn RunStore>, steps: Arc<StepsRegistry>) -> Self {
        Self { store, steps }
    }

    /// Tracker over a fresh in-memory store.
    pub fn in_memory(steps: StepsRegistry) -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(steps))
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn steps(&self) -> &StepsRegistry {
        &self.steps
    }
}
