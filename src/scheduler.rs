//! Timer engine.
//!
//! Every timed behaviour of a device is a small task that only *sends*
//! [`Tick`]s into the device's dispatch loop; the loop owns the state and
//! decides what each tick means.  All tasks are spawned through the
//! device [`Scope`] and die with it.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Timer tasks                              │
//! │                                                              │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌──────────┐   │
//! │  │ Inputs    │  │ Board     │  │ Window /  │  │ Cycle    │   │
//! │  │ poll      │  │ poll      │  │ Hour      │  │ stages   │   │
//! │  └─────┬─────┘  └─────┬─────┘  └─────┬─────┘  └─────┬────┘   │
//! │        │              │              │              │        │
//! │        ▼              ▼              ▼              ▼        │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │              tick channel (unbounded)                  │  │
//! │  └───────────────────────┬────────────────────────────────┘  │
//! │                          ▼                                   │
//! │                    dispatch loop                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cycle watchdog is a cancellable one-shot per run: aborting a run
//! cancels its token, so no stage step of that run fires afterwards.  The
//! loop additionally ignores steps carrying a stale run id.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use log::debug;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Window;
use crate::events::{InputEvent, Scope};
use crate::pins::InputBinding;

// ═══════════════════════════════════════════════════════════════
//  Ticks
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Read bound input pins.
    PollInputs,
    /// Read the board's `rebooted` value.
    PollBoard,
    /// Compare the clock against the automation window.
    Window,
    /// Running-hour accounting.
    Hour,
    /// Retry pending off-writes.
    RetryOff,
    /// Stage timer of cycle run `id` elapsed.
    CycleStep(u64),
}

pub type TickTx = mpsc::UnboundedSender<Tick>;
pub type TickRx = mpsc::UnboundedReceiver<Tick>;

// ═══════════════════════════════════════════════════════════════
//  Timer tasks
// ═══════════════════════════════════════════════════════════════

/// Send `tick` every `every`, first one after a full period.  Missed
/// periods are skipped rather than bunched.
pub fn arm_periodic(scope: &Scope, name: &'static str, every: Duration, tick: Tick, tx: TickTx) {
    scope.spawn(name, async move {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if tx.send(tick).is_err() {
                break;
            }
        }
    });
}

/// Stage timer of one cycle run: `pre` after arming the first step fires,
/// `main` later the second.  Cancelling `token` disarms both.
pub fn arm_cycle(
    scope: &Scope,
    token: CancellationToken,
    id: u64,
    pre: Duration,
    main: Duration,
    tx: TickTx,
) {
    scope.spawn("cycle", async move {
        for stage in [pre, main] {
            tokio::select! {
                () = token.cancelled() => {
                    debug!("CYCLE | #{id} timer disarmed");
                    return;
                }
                () = tokio::time::sleep(stage) => {}
            }
            if tx.send(Tick::CycleStep(id)).is_err() {
                return;
            }
        }
    });
}

// ═══════════════════════════════════════════════════════════════
//  Decisions
// ═══════════════════════════════════════════════════════════════

/// Whether a level-triggered cycle is due: strictly more than `wait_secs`
/// since the previous one.  No previous cycle means due.
pub fn wait_elapsed(last: Option<DateTime<Utc>>, now: DateTime<Utc>, wait_secs: u64) -> bool {
    match last {
        None => true,
        Some(last) => (now - last).num_seconds() > wait_secs as i64,
    }
}

/// What the window tick should do given the acknowledged automation flag:
/// `Some(true)` start, `Some(false)` stop, `None` nothing.
pub fn window_action(window: Option<Window>, now: NaiveTime, running: bool) -> Option<bool> {
    let inside = window?.contains(now);
    (inside != running).then_some(inside)
}

// ═══════════════════════════════════════════════════════════════
//  Input edge detection
// ═══════════════════════════════════════════════════════════════

/// Turns polled input levels into transition events.
#[derive(Debug, Default)]
pub struct InputScanner {
    last: BTreeMap<u8, bool>,
}

impl InputScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw pin level.  Returns an event when the logical level
    /// changed.  For edge roles the first reading only establishes the
    /// baseline.  Level-follow inputs (emergency stop, security contact)
    /// report their first reading either way, so a hold taken before a
    /// reboot is released if the input was let go meanwhile.
    pub fn observe(&mut self, binding: &InputBinding, raw: bool) -> Option<InputEvent> {
        let active = raw != binding.active_low;
        let event = InputEvent {
            role: binding.role,
            pin: binding.pin,
            active,
        };
        match self.last.insert(binding.pin, active) {
            None => binding.role.follows_level().then_some(event),
            Some(prev) if prev != active => Some(event),
            Some(_) => None,
        }
    }

    /// Forget every baseline, e.g. after the board rebooted.
    pub fn reset(&mut self) {
        self.last.clear();
    }
}
