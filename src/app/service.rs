//! Device controller: composition root of one controlled device.
//!
//! A [`Device`] owns its board, its [`Interlock`], its two reconcilers and
//! its bus.  Everything that can change device state (API commands, input
//! transitions, timer ticks, broadcasts from other devices) is funnelled
//! into one dispatch task, so transitions are strictly serialised.  The
//! loop itself only waits on board calls and primary-store writes; secondary
//! replication and audit appends run in their own tasks.
//!
//! ```text
//!  API ──Command──┐
//!  peers ─Global──┤      ┌───────────────────────────┐     ┌──────────┐
//!                 ├────▶ │  dispatch loop (Core)     │ ──▶ │  board   │
//!  timers ─Tick───┘      │  Interlock · Reconciler   │     └──────────┘
//!                        └─────────────┬─────────────┘
//!                                      ▼
//!                        bus: Input · StateChanged · Audit
//! ```
//!
//! ## Lifecycle
//!
//! - `bootstrap`: reconcile state and config from the stores.
//! - `start`: connect (fixed backoff), replay outputs, resume an
//!   interrupted cycle, arm timers, register bus handlers, start the
//!   replication and audit writers.
//! - `stop`: publish `DeviceStopped`, cancel the run scope, wait for every
//!   task of the run, halt the board.  Restartable.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{Notify, OwnedMutexGuard, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{DeviceConfig, DeviceSpec, Timing, Tunables};
use crate::error::{ConfigError, ControlError, HardwareError, StoreError};
use crate::events::{Bus, GlobalSignal, InputEvent, Message, Scope, Topic, on};
use crate::fsm::context::{Actuator, DeviceState};
use crate::fsm::states::Policy;
use crate::fsm::{CyclePhase, CycleTrigger};
use crate::pins::{InputRole, IoMap};
use crate::reconcile::Reconciler;
use crate::safety::{CycleTimer, Holder, Interlock, Latch, Outputs, Transition};
use crate::scheduler::{self, InputScanner, Tick, TickRx, TickTx};

use super::commands::{Command, Snapshot};
use super::events::{Event, EventKind, EventType};
use super::ports::{ACK_REBOOT_FN, BoardPort, Clock, EventLog, REBOOTED_VALUE};

// ───────────────────────────────────────────────────────────────
// Injected ports
// ───────────────────────────────────────────────────────────────

/// Everything a device is wired to.
pub struct Ports {
    pub board: Box<dyn BoardPort>,
    pub states: Reconciler<DeviceState>,
    pub configs: Reconciler<DeviceConfig>,
    pub events: Arc<dyn EventLog>,
    pub clock: Arc<dyn Clock>,
    /// Process-wide bus shared by all devices.
    pub global: Bus,
}

/// Actuator writes resolved through the device's output bindings.
struct BoardOutputs<'a> {
    board: &'a mut (dyn BoardPort + 'static),
    io: &'a IoMap,
}

impl Outputs for BoardOutputs<'_> {
    fn write(&mut self, actuator: Actuator, on: bool) -> Result<(), HardwareError> {
        let binding = self
            .io
            .output(actuator)
            .ok_or_else(|| HardwareError::Unsupported(format!("no output bound to {actuator}")))?;
        self.board.digital_write(binding.pin, on != binding.active_low)
    }
}

/// Audit events waiting to be appended, oldest first.
struct AuditTrail {
    log: Arc<dyn EventLog>,
    queue: Mutex<VecDeque<Event>>,
    wake: Notify,
}

impl AuditTrail {
    fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
        }
    }

    fn push(&self, event: Event) {
        self.lock().push_back(event);
        self.wake.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append everything queued.  Log failures are never fatal.
    async fn flush(&self) {
        loop {
            let Some(event) = self.lock().pop_front() else {
                return;
            };
            if let Err(e) = self.log.append(&event).await {
                warn!("{}: audit event {} not written: {e}", event.source_id, event.event_type);
            }
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.flush().await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.wake.notified() => {}
            }
        }
        self.flush().await;
    }
}

enum Envelope {
    Command(Command, oneshot::Sender<Result<bool, ControlError>>),
    Global(GlobalSignal),
}

struct Run {
    scope: Scope,
    ticks: TickTx,
}

// ───────────────────────────────────────────────────────────────
// Core: state owned by the dispatch loop
// ───────────────────────────────────────────────────────────────

struct Core {
    id: String,
    name: String,
    interlock: Interlock,
    config: DeviceConfig,
    board: Box<dyn BoardPort>,
    io: IoMap,
    states: Reconciler<DeviceState>,
    configs: Reconciler<DeviceConfig>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
    bus: Bus,
    global: Bus,
    scanner: InputScanner,
    /// Last logical level per input pin.
    inputs: BTreeMap<u8, (InputRole, bool)>,
    pending_off: BTreeSet<Actuator>,
    cycle_tokens: HashMap<u64, CancellationToken>,
    run: Option<Run>,
    board_online: bool,
    online: Arc<AtomicBool>,
    snapshot: watch::Sender<Snapshot>,
}

impl Core {
    fn with_outputs<T>(&mut self, f: impl FnOnce(&mut Interlock, &mut dyn Outputs) -> T) -> T {
        let mut out = BoardOutputs {
            board: self.board.as_mut(),
            io: &self.io,
        };
        f(&mut self.interlock, &mut out)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.interlock.state().clone(),
            config: self.config.clone(),
            phase: self.interlock.phase(),
            online: self.run.is_some() && self.board_online,
            inputs: self
                .inputs
                .iter()
                .map(|(pin, (role, active))| (*pin, *role, *active))
                .collect(),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.snapshot());
    }

    fn set_online(&mut self, online: bool) {
        self.board_online = online;
        self.online.store(online && self.run.is_some(), Ordering::SeqCst);
    }

    /// Queue an audit event and mirror it on the bus.
    fn record(
        &self,
        kind: EventKind,
        event_type: EventType,
        duration: Option<u64>,
        data: Option<f64>,
    ) {
        let mut event = Event::new(&self.id, &self.name, self.clock.now(), kind, event_type);
        event.duration = duration;
        event.data = data;
        self.audit.push(event.clone());
        self.bus.publish(Message::Audit(event));
    }

    fn arm_cycle(&mut self, id: u64) {
        let Some(run) = &self.run else {
            warn!("CYCLE | {}: #{id} armed outside a run", self.id);
            return;
        };
        let token = run.scope.child_token();
        let tunables = &self.config.tunables;
        scheduler::arm_cycle(
            &run.scope,
            token.clone(),
            id,
            Duration::from_secs(tunables.pre_stage_secs),
            Duration::from_secs(tunables.main_stage_secs),
            run.ticks.clone(),
        );
        self.cycle_tokens.insert(id, token);
    }

    /// Carry out the side effects of a transition: timers, retries, audit,
    /// persistence, notification.  Returns whether anything changed.
    async fn settle(&mut self, t: Transition) -> Result<bool, ControlError> {
        self.pending_off.extend(t.retry_off);
        for timer in t.timers {
            match timer {
                CycleTimer::Arm(id) => self.arm_cycle(id),
                CycleTimer::Disarm(id) => {
                    if let Some(token) = self.cycle_tokens.remove(&id) {
                        token.cancel();
                    }
                }
            }
        }
        for note in t.notes {
            self.record(note.kind, note.event_type, note.duration, note.data);
        }

        let mut result = Ok(t.changed);
        if t.changed {
            match self.states.update(self.interlock.state()).await {
                Ok(saved) => self.interlock.restamp(saved.version, saved.updated_at),
                Err(e) => {
                    error!("{}: state not persisted: {e}", self.id);
                    result = Err(ControlError::Durability(e));
                }
            }
            self.bus
                .publish(Message::StateChanged(Arc::new(self.interlock.state().clone())));
        }
        self.publish_snapshot();

        match t.fault {
            Some(e) => Err(ControlError::Hardware(e)),
            None => result,
        }
    }

    async fn settle_logged(&mut self, t: Transition) {
        if let Err(e) = self.settle(t).await {
            warn!("{}: {e}", self.id);
        }
    }

    // ── Commands ──────────────────────────────────────────────

    async fn execute(&mut self, cmd: Command) -> Result<bool, ControlError> {
        let now = Instant::now();
        let t = match cmd {
            Command::SetAuto(on) => self.with_outputs(|il, out| il.set_auto(on, out))?,
            Command::ForceCycle => {
                self.with_outputs(|il, out| il.start_cycle(CycleTrigger::Operator, now, out))?
            }
            Command::SetActuator { actuator, on } => {
                self.with_outputs(|il, out| il.set_actuator(actuator, on, out))?
            }
            Command::SetSecurity(on) => self.with_outputs(|il, out| {
                il.hold(Latch::Security, Holder::Operator, on, out)
            }),
            Command::SetEmergencyStop(on) => self.with_outputs(|il, out| {
                il.hold(Latch::EmergencyStop, Holder::Operator, on, out)
            }),
            Command::SetSecurityOverride(on) => {
                self.with_outputs(|il, out| il.set_security_override(on, out))
            }
            Command::UpdateConfig(tunables) => return self.update_config(tunables).await,
        };
        self.settle(t).await
    }

    async fn update_config(&mut self, tunables: Tunables) -> Result<bool, ControlError> {
        if tunables == self.config.tunables {
            return Ok(false);
        }
        let mut next = self.config.clone();
        next.tunables = tunables;
        next.validate().map_err(|e| match e {
            ConfigError::Validation(reason) => ControlError::Invalid(reason),
            ConfigError::Load(_) => ControlError::Invalid("configuration could not be loaded"),
        })?;
        let saved = self
            .configs
            .update(&next)
            .await
            .map_err(ControlError::Durability)?;
        info!("{}: config now v{}", self.id, saved.version);
        self.config = saved;
        self.global
            .publish(Message::Global(GlobalSignal::ConfigChanged {
                device: self.id.clone(),
                version: self.config.version,
            }));
        self.record(EventKind::Board, EventType::ConfigUpdated, None, None);
        self.publish_snapshot();
        Ok(true)
    }

    async fn apply_global(&mut self, signal: GlobalSignal) {
        let t = match signal {
            GlobalSignal::EmergencyStop { origin, active } => {
                info!("INTERLOCK | {}: emergency stop {active} from {origin}", self.id);
                self.with_outputs(|il, out| {
                    il.hold(Latch::EmergencyStop, Holder::Peer(origin), active, out)
                })
            }
            GlobalSignal::Security { origin, active } => {
                info!("INTERLOCK | {}: security {active} from {origin}", self.id);
                self.with_outputs(|il, out| {
                    il.hold(Latch::Security, Holder::Peer(origin), active, out)
                })
            }
            GlobalSignal::ConfigChanged { device, version } => {
                debug!("{}: {device} config is now v{version}", self.id);
                return;
            }
        };
        self.settle_logged(t).await;
    }

    async fn handle(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Command(cmd, reply) => {
                debug!("{}: command {cmd:?}", self.id);
                let result = self.execute(cmd).await;
                if let Err(e) = &result {
                    info!("{}: command rejected: {e}", self.id);
                }
                // The caller may have given up waiting.
                let _ = reply.send(result);
            }
            Envelope::Global(signal) => self.apply_global(signal).await,
        }
    }

    // ── Ticks ─────────────────────────────────────────────────

    async fn on_tick(&mut self, tick: Tick) {
        match tick {
            Tick::PollInputs => self.poll_inputs().await,
            Tick::PollBoard => self.poll_board().await,
            Tick::Window => self.window_tick().await,
            Tick::Hour => {
                let (mode, max) = (self.config.tunables.uv_mode, self.config.tunables.max_hours);
                let t = self.interlock.tick_hours(mode, max);
                self.settle_logged(t).await;
            }
            Tick::RetryOff => self.retry_off().await,
            Tick::CycleStep(id) => {
                let (now, wall) = (Instant::now(), self.clock.now());
                let t = self.with_outputs(|il, out| il.cycle_step(id, now, wall, out));
                if self.interlock.phase() == CyclePhase::Idle {
                    self.cycle_tokens.remove(&id);
                }
                self.settle_logged(t).await;
            }
        }
    }

    async fn poll_inputs(&mut self) {
        if !self.board_online {
            return;
        }
        let bindings = self.io.inputs.clone();
        let mut levels_changed = false;
        for binding in &bindings {
            let raw = match self.board.digital_read(binding.pin) {
                Ok(raw) => raw,
                Err(e) if e.is_transport() => {
                    self.board_lost(e).await;
                    return;
                }
                Err(e) => {
                    debug!("{}: input pin {} unreadable: {e}", self.id, binding.pin);
                    continue;
                }
            };
            let level = (binding.role, raw != binding.active_low);
            levels_changed |= self.inputs.insert(binding.pin, level) != Some(level);
            if let Some(event) = self.scanner.observe(binding, raw) {
                self.bus.publish(Message::Input(event));
                self.on_input(event).await;
            }
        }
        if levels_changed {
            self.publish_snapshot();
        }
    }

    async fn on_input(&mut self, event: InputEvent) {
        let now = Instant::now();
        let result = match event.role {
            InputRole::EmergencyStop => Ok(self.with_outputs(|il, out| {
                il.hold(Latch::EmergencyStop, Holder::Input, event.active, out)
            })),
            InputRole::Security => Ok(self.with_outputs(|il, out| {
                il.hold(Latch::Security, Holder::Input, event.active, out)
            })),
            // Everything else acts on the press only.
            _ if !event.active => return,
            InputRole::SecurityOverride => {
                Ok(self.with_outputs(|il, out| il.toggle_security_override(out)))
            }
            InputRole::CycleTrigger => {
                let wait = self.config.tunables.wait_between_cycles_secs;
                let last = self.interlock.state().last_cycle_at;
                if !scheduler::wait_elapsed(last, self.clock.now(), wait) {
                    info!("CYCLE | {}: level trip within {wait} s of the last wash, not started", self.id);
                    return;
                }
                self.with_outputs(|il, out| il.start_cycle(CycleTrigger::Level, now, out))
            }
            InputRole::ForceCycle => {
                self.with_outputs(|il, out| il.start_cycle(CycleTrigger::Operator, now, out))
            }
            InputRole::AutoToggle => {
                let on = !self.interlock.state().running;
                self.with_outputs(|il, out| il.set_auto(on, out))
            }
        };
        match result {
            Ok(t) => self.settle_logged(t).await,
            Err(e) => info!("{}: {:?} input ignored: {e}", self.id, event.role),
        }
    }

    async fn poll_board(&mut self) {
        if !self.board_online {
            if let Err(e) = self.board.reconnect() {
                debug!("{}: board still unreachable: {e}", self.id);
                return;
            }
            info!("{}: board reachable again", self.id);
            self.set_online(true);
            self.record(EventKind::Board, EventType::Online, None, None);
            let t = self.with_outputs(|il, out| il.replay(out));
            self.settle_logged(t).await;
        }
        match self.board.read_value(REBOOTED_VALUE) {
            Ok(value) if value.as_bool() == Some(true) => self.resync_after_reboot().await,
            Ok(_) => {}
            Err(e) if e.is_transport() => self.board_lost(e).await,
            Err(e) => warn!("{}: reboot flag unreadable: {e}", self.id),
        }
    }

    async fn resync_after_reboot(&mut self) {
        warn!("{}: board rebooted, replaying state", self.id);
        if let Err(e) = self.board.reconnect() {
            self.board_lost(e).await;
            return;
        }
        self.scanner.reset();
        let now = Instant::now();
        let mut t = self.with_outputs(|il, out| il.replay(out));
        t.absorb(self.with_outputs(|il, out| il.recover_cycle(now, out)));
        if let Err(e) = self.board.call_function(ACK_REBOOT_FN, &[]) {
            warn!("{}: reboot not acknowledged: {e}", self.id);
        }
        self.record(EventKind::Board, EventType::Reboot, None, None);
        self.settle_logged(t).await;
    }

    /// Transport failure: the device stays started but reports offline
    /// until the board answers again.  Interlock flags are untouched.
    async fn board_lost(&mut self, e: HardwareError) {
        if !self.board_online {
            return;
        }
        warn!("{}: board offline: {e}", self.id);
        self.set_online(false);
        self.record(EventKind::Board, EventType::Offline, None, None);
        self.publish_snapshot();
    }

    async fn window_tick(&mut self) {
        let running = self.interlock.state().running;
        let now = self.clock.now().time();
        let Some(on) = scheduler::window_action(self.config.tunables.window, now, running) else {
            return;
        };
        info!("{}: automation window {}", self.id, if on { "opens" } else { "closes" });
        match self.with_outputs(|il, out| il.set_auto(on, out)) {
            Ok(t) => self.settle_logged(t).await,
            Err(e) => info!("{}: window transition refused: {e}", self.id),
        }
    }

    async fn retry_off(&mut self) {
        let pending: Vec<Actuator> = self.pending_off.iter().copied().collect();
        for actuator in pending {
            if !self.interlock.wants_off(actuator) {
                self.pending_off.remove(&actuator);
                continue;
            }
            let written = BoardOutputs {
                board: self.board.as_mut(),
                io: &self.io,
            }
            .write(actuator, false);
            match written {
                Ok(()) => {
                    info!("INTERLOCK | {}: {actuator} confirmed off", self.id);
                    self.pending_off.remove(&actuator);
                    let t = self.interlock.confirm_off(actuator);
                    self.settle_logged(t).await;
                }
                Err(e) => debug!("{}: {actuator} still not off: {e}", self.id),
            }
        }
    }
}

/// The dispatch task.  Holds the core for the whole run.
async fn dispatch(
    mut core: OwnedMutexGuard<Core>,
    scope: Scope,
    mut mail: mpsc::UnboundedReceiver<Envelope>,
    mut ticks: TickRx,
) {
    loop {
        tokio::select! {
            biased;
            () = scope.cancelled() => break,
            Some(envelope) = mail.recv() => core.handle(envelope).await,
            Some(tick) = ticks.recv() => core.on_tick(tick).await,
            else => break,
        }
    }
    debug!("{}: dispatch loop exited", core.id);
}

// ═══════════════════════════════════════════════════════════════
//  Device
// ═══════════════════════════════════════════════════════════════

pub struct Device {
    spec: DeviceSpec,
    policy: Policy,
    bus: Bus,
    global: Bus,
    tracker: TaskTracker,
    core: Arc<tokio::sync::Mutex<Core>>,
    lifecycle: tokio::sync::Mutex<()>,
    run: Mutex<Option<(Scope, mpsc::UnboundedSender<Envelope>)>>,
    online: Arc<AtomicBool>,
    snapshot: watch::Receiver<Snapshot>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.spec.id)
            .field("family", &self.spec.family)
            .field("online", &self.is_online())
            .finish()
    }
}

impl Device {
    /// Reconcile the device's state and config records and build an
    /// unstarted device.  Any primary-store failure is returned.
    pub async fn bootstrap(spec: DeviceSpec, ports: Ports) -> Result<Self, StoreError> {
        let policy = Policy::for_family(spec.family);

        let mut state = ports
            .states
            .init(DeviceState::template(&spec.id, &spec.name, &policy))
            .await?;
        if state.family != spec.family {
            return Err(StoreError::Codec(format!(
                "{}: stored family {:?} does not match configured {:?}",
                spec.id, state.family, spec.family
            )));
        }
        state.actuators.retain(|a, _| policy.fits(*a));
        for a in policy.actuators {
            state.actuators.entry(*a).or_default();
        }

        let config = ports
            .configs
            .init(DeviceConfig::template(&spec.id, spec.tunables.clone()))
            .await?;
        config
            .validate()
            .map_err(|e| StoreError::Codec(format!("{}: stored config rejected: {e}", spec.id)))?;

        info!(
            "{}: bootstrapped ({:?}, state v{}, config v{})",
            spec.id, spec.family, state.version, config.version
        );
        Ok(Self::assemble(spec, policy, ports, state, config))
    }

    fn assemble(
        spec: DeviceSpec,
        policy: Policy,
        ports: Ports,
        state: DeviceState,
        config: DeviceConfig,
    ) -> Self {
        let bus = Bus::new(&spec.id);
        let online = Arc::new(AtomicBool::new(false));
        let interlock = Interlock::new(state, policy);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
            state: interlock.state().clone(),
            config: config.clone(),
            phase: interlock.phase(),
            online: false,
            inputs: Vec::new(),
        });
        let core = Core {
            id: spec.id.clone(),
            name: spec.name.clone(),
            interlock,
            config,
            board: ports.board,
            io: spec.io_map(),
            states: ports.states,
            configs: ports.configs,
            audit: Arc::new(AuditTrail::new(ports.events)),
            clock: ports.clock,
            bus: bus.clone(),
            global: ports.global.clone(),
            scanner: InputScanner::new(),
            inputs: BTreeMap::new(),
            pending_off: BTreeSet::new(),
            cycle_tokens: HashMap::new(),
            run: None,
            board_online: false,
            online: online.clone(),
            snapshot: snapshot_tx,
        };
        Self {
            spec,
            policy,
            bus,
            global: ports.global,
            tracker: TaskTracker::new(),
            core: Arc::new(tokio::sync::Mutex::new(core)),
            lifecycle: tokio::sync::Mutex::new(()),
            run: Mutex::new(None),
            online,
            snapshot: snapshot_rx,
        }
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// The device's own bus (inputs, state changes, audit).
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Started and the board is reachable.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.lock_run().is_some()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Change feed of snapshots.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Background tasks of the current run still alive.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<(Scope, mpsc::UnboundedSender<Envelope>)>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Connect and bring the device up.  Connection attempts repeat with a
    /// fixed backoff until they succeed or `cancel` fires.  Starting a
    /// started device is a no-op.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), ControlError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_started() {
            return Ok(());
        }
        let mut core = self.core.clone().lock_owned().await;

        let backoff = Duration::from_millis(self.spec.timing.start_backoff_ms);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match core.board.connect() {
                Ok(()) => break,
                Err(e) => {
                    warn!("{}: connect attempt {attempt} failed: {e}, retrying in {backoff:?}", self.id());
                    tokio::select! {
                        () = cancel.cancelled() => return Err(ControlError::Offline(self.id().to_owned())),
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
        info!("{}: board connected after {attempt} attempt(s)", self.id());

        let scope = Scope::new(self.tracker.clone());
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let (mail_tx, mail_rx) = mpsc::unbounded_channel();
        core.run = Some(Run {
            scope: scope.clone(),
            ticks: ticks_tx.clone(),
        });
        core.set_online(true);
        core.scanner.reset();
        core.inputs.clear();

        let now = Instant::now();
        let mut t = core.with_outputs(|il, out| il.replay(out));
        t.absorb(core.with_outputs(|il, out| il.recover_cycle(now, out)));
        if let Err(e) = core.settle(t).await {
            warn!("{}: resync on start incomplete: {e}", self.id());
        }

        scope.spawn_cooperative("replicate-states", core.states.clone().replicate(scope.child_token()));
        scope.spawn_cooperative("replicate-configs", core.configs.clone().replicate(scope.child_token()));
        scope.spawn_cooperative("audit", core.audit.clone().run(scope.child_token()));
        self.arm_timers(&scope, &ticks_tx);
        self.register_handlers(&scope, &mail_tx);
        scope.spawn_cooperative("dispatch", dispatch(core, scope.clone(), mail_rx, ticks_rx));

        *self.lock_run() = Some((scope, mail_tx));
        info!("{}: started", self.id());
        Ok(())
    }

    fn arm_timers(&self, scope: &Scope, ticks: &TickTx) {
        let Timing {
            input_poll_ms,
            reboot_poll_ms,
            window_tick_secs,
            hour_tick_secs,
            off_retry_ms,
            ..
        } = self.spec.timing;
        let ms = Duration::from_millis;
        scheduler::arm_periodic(scope, "inputs", ms(input_poll_ms), Tick::PollInputs, ticks.clone());
        scheduler::arm_periodic(scope, "board", ms(reboot_poll_ms), Tick::PollBoard, ticks.clone());
        scheduler::arm_periodic(scope, "retry-off", ms(off_retry_ms), Tick::RetryOff, ticks.clone());
        if !self.policy.hour_counted.is_empty() {
            let every = Duration::from_secs(hour_tick_secs);
            scheduler::arm_periodic(scope, "hours", every, Tick::Hour, ticks.clone());
        }
        if self.policy.windowed {
            let every = Duration::from_secs(window_tick_secs);
            scheduler::arm_periodic(scope, "window", every, Tick::Window, ticks.clone());
        }
    }

    fn register_handlers(&self, scope: &Scope, mail: &mpsc::UnboundedSender<Envelope>) {
        let id = self.id().to_owned();
        let mail = mail.clone();
        on(scope, &self.bus, &self.global, Topic::Global, move |msg| {
            if let Message::Global(signal) = msg {
                if signal.origin() != id {
                    // Closed mailbox means the run is ending.
                    let _ = mail.send(Envelope::Global(signal));
                }
            }
            std::future::ready(())
        });

        if self.spec.propagate_interlocks {
            let origin = self.id().to_owned();
            let global = self.global.clone();
            on(scope, &self.bus, &self.bus, Topic::Input, move |msg| {
                if let Message::Input(event) = msg {
                    let origin = origin.clone();
                    let active = event.active;
                    match event.role {
                        InputRole::EmergencyStop => global.publish(Message::Global(
                            GlobalSignal::EmergencyStop { origin, active },
                        )),
                        InputRole::Security => global
                            .publish(Message::Global(GlobalSignal::Security { origin, active })),
                        _ => {}
                    }
                }
                std::future::ready(())
            });
        }
    }

    /// Tear the run down and wait for every task of it.  Stopping a
    /// stopped device is a no-op.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some((scope, mail)) = self.lock_run().take() else {
            return;
        };
        info!("{}: stopping", self.id());
        drop(mail);
        self.bus.publish(Message::DeviceStopped {
            device: self.id().to_owned(),
        });
        scope.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        let mut core = self.core.lock().await;
        core.run = None;
        for (_, token) in core.cycle_tokens.drain() {
            token.cancel();
        }
        if let Err(e) = core.board.halt() {
            warn!("{}: halt failed: {e}", self.id());
        }
        core.set_online(false);
        core.publish_snapshot();
        info!("{}: stopped", self.id());
    }

    // ── Commands ──────────────────────────────────────────────

    async fn request(&self, cmd: Command) -> Result<bool, ControlError> {
        let offline = || ControlError::Offline(self.id().to_owned());
        let mail = self
            .lock_run()
            .as_ref()
            .map(|(_, mail)| mail.clone())
            .ok_or_else(offline)?;
        let (reply, answer) = oneshot::channel();
        mail.send(Envelope::Command(cmd, reply))
            .map_err(|_| offline())?;
        answer.await.map_err(|_| offline())?
    }

    /// Run any [`Command`].  `Ok(true)` when state changed.
    pub async fn execute(&self, cmd: Command) -> Result<bool, ControlError> {
        self.request(cmd).await
    }

    pub async fn set_auto(&self, on: bool) -> Result<bool, ControlError> {
        self.request(Command::SetAuto(on)).await
    }

    pub async fn force_cycle(&self) -> Result<bool, ControlError> {
        self.request(Command::ForceCycle).await
    }

    pub async fn set_actuator(&self, actuator: Actuator, on: bool) -> Result<bool, ControlError> {
        self.request(Command::SetActuator { actuator, on }).await
    }

    pub async fn set_security(&self, active: bool) -> Result<bool, ControlError> {
        self.request(Command::SetSecurity(active)).await
    }

    pub async fn set_emergency_stop(&self, active: bool) -> Result<bool, ControlError> {
        self.request(Command::SetEmergencyStop(active)).await
    }

    pub async fn set_security_override(&self, active: bool) -> Result<bool, ControlError> {
        self.request(Command::SetSecurityOverride(active)).await
    }

    pub async fn update_config(&self, tunables: Tunables) -> Result<bool, ControlError> {
        self.request(Command::UpdateConfig(tunables)).await
    }
}
