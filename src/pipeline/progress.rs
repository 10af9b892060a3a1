//! Milestones and progress events.
//!
//! A preprocessing session walks four milestones in order and never goes
//! back:
//!
//! ```text
//! NotStarted ─► scan ─► level0 ─► mips ─► finalize ─► Completed
//!                 │        │        │         │
//!                 └────────┴────────┴─────────┴──► Failed { milestone, reason }
//! ```
//!
//! Progress is published as [`ProgressEvent`]s on an unbounded channel.
//! Sending never blocks, and events are dropped once the receiver is gone.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PipelineError;

/// A named phase of a preprocessing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Milestone {
    Scan,
    Level0,
    Mips,
    Finalize,
}

impl Milestone {
    /// All milestones in execution order.
    pub const ORDER: [Milestone; 4] = [
        Milestone::Scan,
        Milestone::Level0,
        Milestone::Mips,
        Milestone::Finalize,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Milestone::Scan => "scan",
            Milestone::Level0 => "level0",
            Milestone::Mips => "mips",
            Milestone::Finalize => "finalize",
        }
    }

    /// The milestone that follows this one.
    pub fn next(self) -> Option<Milestone> {
        match self {
            Milestone::Scan => Some(Milestone::Level0),
            Milestone::Level0 => Some(Milestone::Mips),
            Milestone::Mips => Some(Milestone::Finalize),
            Milestone::Finalize => None,
        }
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// State of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    NotStarted,
    Running(Milestone),
    Completed,
    Failed {
        milestone: Option<Milestone>,
        reason: String,
    },
}

/// Enforces forward-only milestone progression.
#[derive(Debug, Clone)]
pub struct MilestoneTracker {
    state: SessionState,
    history: Vec<Milestone>,
}

impl Default for MilestoneTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MilestoneTracker {
    pub fn new() -> Self {
        Self {
            state: SessionState::NotStarted,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Milestones entered so far, in order.
    pub fn history(&self) -> &[Milestone] {
        &self.history
    }

    /// The running milestone, if any.
    pub fn current(&self) -> Option<Milestone> {
        match self.state {
            SessionState::Running(m) => Some(m),
            SessionState::Failed { milestone, .. } => milestone,
            _ => None,
        }
    }

    /// Enter `next`. Only the immediate successor of the current milestone
    /// (or `scan` from the start) is accepted.
    pub fn advance(&mut self, next: Milestone) -> Result<(), PipelineError> {
        let expected = match &self.state {
            SessionState::NotStarted => Some(Milestone::Scan),
            SessionState::Running(current) => current.next(),
            SessionState::Completed | SessionState::Failed { .. } => None,
        };

        if expected != Some(next) {
            return Err(PipelineError::Milestone(format!(
                "cannot enter {} from {:?}",
                next, self.state
            )));
        }

        self.state = SessionState::Running(next);
        self.history.push(next);
        Ok(())
    }

    /// Finish the session after `finalize`.
    pub fn complete(&mut self) -> Result<(), PipelineError> {
        if self.state != SessionState::Running(Milestone::Finalize) {
            return Err(PipelineError::Milestone(format!(
                "cannot complete from {:?}",
                self.state
            )));
        }
        self.state = SessionState::Completed;
        Ok(())
    }

    /// Move to the terminal failed state. A session that already ended keeps
    /// its state.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.state = SessionState::Failed {
            milestone: self.current(),
            reason: reason.into(),
        };
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SessionState::Completed | SessionState::Failed { .. }
        )
    }
}

// =============================================================================
// Events
// =============================================================================

/// Progress notifications published during preprocessing and import.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    MilestoneStarted(Milestone),

    /// Percentage (0-100) of the given milestone
    MilestoneProgress { milestone: Milestone, percent: f32 },

    VolumesDecoded { decoded: u64, total: u64 },

    /// Bytes written (preprocess) or fetched (import); `total` when known
    BytesProcessed { processed: u64, total: Option<u64> },

    Warning(String),

    LayerFailed { layer_key: String, reason: String },

    Completed { total_volume_count: u64 },

    Failed {
        milestone: Option<Milestone>,
        reason: String,
    },
}

/// Sending half of a progress channel.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    /// A reporter and the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    /// A reporter that discards every event.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    pub fn milestone_progress(&self, milestone: Milestone, done: u64, total: u64) {
        self.emit(ProgressEvent::MilestoneProgress {
            milestone,
            percent: percent(done, total),
        });
    }
}

/// `done / total` as a percentage; an empty total counts as complete.
pub fn percent(done: u64, total: u64) -> f32 {
    if total == 0 {
        100.0
    } else {
        (done.min(total) as f64 / total as f64 * 100.0) as f32
    }
}
