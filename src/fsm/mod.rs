//! Wash/treatment cycle sequencer.
//!
//! A linear, non-reentrant machine:
//!
//! ```text
//!  IDLE ──[trigger]──▶ PRE_STAGE ──[pre elapsed]──▶ MAIN_STAGE
//!    ▲                     │                            │
//!    │                 [abort]                  [main elapsed]
//!    │                     ▼                            ▼
//!    └──────────────────── IDLE ◀───[actuators off]── STOPPING
//! ```
//!
//! The sequencer only tracks phase and identity.  Each run gets a fresh id
//! so a stage timer that outlives an aborted run cannot advance the next
//! one.  Actuation and guard checks live in the interlock machine.

pub mod context;
pub mod states;

use std::time::Duration;

use log::info;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Phase and trigger identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CyclePhase {
    Idle,
    PreStage,
    MainStage,
    Stopping,
}

/// What asked for the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleTrigger {
    /// Level sensor tripped in auto mode.
    Level,
    /// Operator forced it.
    Operator,
    /// Reboot recovery found a cycle in progress.
    Recovery,
}

#[derive(Debug, Clone, Copy)]
struct CycleRun {
    id: u64,
    phase: CyclePhase,
    trigger: CycleTrigger,
    started: Instant,
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CycleSequencer {
    current: Option<CycleRun>,
    next_id: u64,
}

impl CycleSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> CyclePhase {
        self.current.map_or(CyclePhase::Idle, |r| r.phase)
    }

    pub fn active_id(&self) -> Option<u64> {
        self.current.map(|r| r.id)
    }

    pub fn trigger(&self) -> Option<CycleTrigger> {
        self.current.map(|r| r.trigger)
    }

    /// Once stopping, an interlock no longer needs to abort the run.
    pub fn past_point_of_no_return(&self) -> bool {
        self.phase() == CyclePhase::Stopping
    }

    /// Enter `PreStage`.  Returns the run id, or `None` if a run is active.
    pub fn begin(&mut self, trigger: CycleTrigger, now: Instant) -> Option<u64> {
        if self.current.is_some() {
            return None;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.current = Some(CycleRun {
            id,
            phase: CyclePhase::PreStage,
            trigger,
            started: now,
        });
        info!("CYCLE | #{id} begin ({trigger:?})");
        Some(id)
    }

    /// Move run `id` to its next stage.  Stale ids return `None`.
    pub fn advance(&mut self, id: u64) -> Option<CyclePhase> {
        let run = self.current.as_mut().filter(|r| r.id == id)?;
        let next = match run.phase {
            CyclePhase::PreStage => CyclePhase::MainStage,
            CyclePhase::MainStage => CyclePhase::Stopping,
            CyclePhase::Stopping | CyclePhase::Idle => return None,
        };
        info!("CYCLE | #{id} {:?} -> {next:?}", run.phase);
        run.phase = next;
        Some(next)
    }

    /// Complete a stopping run.  Returns the time spent in the active stages.
    pub fn finish(&mut self, id: u64, now: Instant) -> Option<Duration> {
        match self.current {
            Some(run) if run.id == id && run.phase == CyclePhase::Stopping => {
                self.current = None;
                info!("CYCLE | #{id} complete");
                Some(now.saturating_duration_since(run.started))
            }
            _ => None,
        }
    }

    /// Drop the active run without completing it.
    pub fn abort(&mut self) -> Option<u64> {
        let run = self.current.take()?;
        info!("CYCLE | #{} aborted in {:?}", run.id, run.phase);
        Some(run.id)
    }
}
