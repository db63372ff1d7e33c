//! End-to-end device behaviour: commands, inputs and timers against the
//! simulated board, with the tokio clock paused so stage timers are exact.

use std::time::Duration;

use chrono::NaiveTime;
use tokio_util::sync::CancellationToken;

use pondctl::app::events::EventType;
use pondctl::config::{Tunables, UvMode, Window};
use pondctl::error::ControlError;
use pondctl::events::{Bus, GlobalSignal, Message, Topic};
use pondctl::fsm::CyclePhase;
use pondctl::fsm::context::{Actuator, Family};
use pondctl::pins::InputRole;

use crate::mock_hw::{Rig, Stores, noon, secs, settle, spec};

// ── Interlocks ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn emergency_stop_halts_everything_and_rejects_starts() {
    let rig = Rig::started(spec("tfp", Family::TechnicalFilter)).await;
    let d = &rig.device;

    assert_eq!(d.set_actuator(Actuator::Bubbler, true).await, Ok(true));
    assert_eq!(d.set_auto(true).await, Ok(true));
    assert!(rig.is_on(Actuator::Bubbler));
    assert!(rig.is_on(Actuator::FilterPump));

    assert_eq!(d.set_emergency_stop(true).await, Ok(true));
    for a in [Actuator::Bubbler, Actuator::FilterPump, Actuator::Uv1, Actuator::Uv2] {
        assert!(!rig.is_on(a), "{a} still on under emergency stop");
    }
    assert!(matches!(
        d.set_actuator(Actuator::Uv1, true).await,
        Err(ControlError::Interlocked(_))
    ));
    assert!(matches!(d.set_auto(false).await, Ok(true)));

    // Desired flags survived: the bubbler comes back, the pump does not
    // because automation was switched off meanwhile.
    assert_eq!(d.set_emergency_stop(false).await, Ok(true));
    assert!(rig.is_on(Actuator::Bubbler));
    assert!(!rig.is_on(Actuator::FilterPump));
    settle().await;
    assert_eq!(rig.count(EventType::SetEmergencyStop), 1);
    assert_eq!(rig.count(EventType::UnsetEmergencyStop), 1);
}

#[tokio::test(start_paused = true)]
async fn security_trip_spares_aeration_and_restores_on_clear() {
    let rig = Rig::started(spec("tfp", Family::TechnicalFilter)).await;
    let d = &rig.device;
    d.set_actuator(Actuator::Bubbler, true).await.unwrap();
    d.set_auto(true).await.unwrap();
    d.set_actuator(Actuator::Uv1, true).await.unwrap();

    d.set_security(true).await.unwrap();
    assert!(rig.is_on(Actuator::Bubbler));
    assert!(!rig.is_on(Actuator::FilterPump));
    assert!(!rig.is_on(Actuator::Uv1));
    assert!(matches!(
        d.set_actuator(Actuator::Uv2, true).await,
        Err(ControlError::Interlocked(_))
    ));
    // The exempt actuator stays under operator control.
    assert_eq!(d.set_actuator(Actuator::Bubbler, false).await, Ok(true));
    assert!(!rig.is_on(Actuator::Bubbler));

    d.set_security(false).await.unwrap();
    assert!(rig.is_on(Actuator::FilterPump));
    assert!(rig.is_on(Actuator::Uv1));
    assert!(!rig.is_on(Actuator::Bubbler));
    assert!(!rig.is_on(Actuator::Uv2));
}

#[tokio::test(start_paused = true)]
async fn security_override_input_toggles_and_resumes() {
    let rig = Rig::started(spec("tfp", Family::TechnicalFilter)).await;
    rig.device.set_auto(true).await.unwrap();

    rig.input(InputRole::Security, true);
    settle().await;
    assert!(rig.state().security);
    assert!(!rig.is_on(Actuator::FilterPump));

    rig.tap(InputRole::SecurityOverride).await;
    assert!(rig.state().security_disabled);
    assert!(rig.is_on(Actuator::FilterPump));

    rig.tap(InputRole::SecurityOverride).await;
    assert!(!rig.state().security_disabled);
    assert!(!rig.is_on(Actuator::FilterPump));

    rig.input(InputRole::Security, false);
    settle().await;
    assert!(rig.is_on(Actuator::FilterPump));
}

#[tokio::test(start_paused = true)]
async fn stalled_replica_does_not_delay_an_emergency_stop() {
    let rig = Rig::started(spec("tank", Family::Tank)).await;
    rig.device.set_auto(true).await.unwrap();
    settle().await;
    rig.stores.states_secondary.set_stalled(true);

    let command = rig.device.set_security_override(true);
    let press = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        rig.input(InputRole::EmergencyStop, true);
        settle().await;
        (rig.state().emergency_stopped, rig.is_on(Actuator::TankPump))
    };
    let started = tokio::time::Instant::now();
    let (done, (stopped, pump_on)) = tokio::join!(command, press);
    assert_eq!(done, Ok(true));
    assert!(stopped);
    assert!(!pump_on);
    assert!(started.elapsed() < Duration::from_millis(100));

    // Once the replica answers again it catches up with the latest state.
    rig.stores.states_secondary.set_stalled(false);
    rig.input(InputRole::EmergencyStop, false);
    settle().await;
    secs(1).await;
    assert!(!rig.state().emergency_stopped);
    assert_eq!(
        rig.stores.states_secondary.peek("tank"),
        rig.stores.states_primary.peek("tank")
    );
}

#[tokio::test(start_paused = true)]
async fn slow_audit_log_does_not_hold_up_commands() {
    let rig = Rig::started(spec("tank", Family::Tank)).await;
    rig.events.set_latency(Duration::from_secs(10));

    let started = tokio::time::Instant::now();
    assert_eq!(rig.device.set_auto(true).await, Ok(true));
    assert_eq!(rig.device.set_emergency_stop(true).await, Ok(true));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!rig.is_on(Actuator::TankPump));
    assert_eq!(rig.count(EventType::SetEmergencyStop), 0);

    secs(60).await;
    assert_eq!(rig.count(EventType::StartAuto), 1);
    assert_eq!(rig.count(EventType::SetEmergencyStop), 1);
}

#[tokio::test(start_paused = true)]
async fn latched_emergency_stop_is_seen_at_start() {
    let rig = Rig::new(spec("tank", Family::Tank)).await;
    rig.input(InputRole::EmergencyStop, true);
    rig.start().await;
    settle().await;
    assert!(rig.state().emergency_stopped);
    assert!(matches!(
        rig.device.set_auto(true).await,
        Err(ControlError::Interlocked(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_off_write_is_retried_until_it_lands() {
    let rig = Rig::started(spec("tank", Family::Tank)).await;
    rig.device.set_auto(true).await.unwrap();
    rig.board.set_pin_failing(2, true);

    rig.device.set_emergency_stop(true).await.unwrap();
    assert!(rig.board.level(2), "relay stuck on");
    assert!(rig.state().is_energized(Actuator::TankPump));

    rig.board.set_pin_failing(2, false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!rig.board.level(2));
    assert!(!rig.state().is_energized(Actuator::TankPump));
}

#[tokio::test(start_paused = true)]
async fn failed_start_reports_hardware_error_and_leaves_flag_clear() {
    let rig = Rig::started(spec("tank", Family::Tank)).await;
    rig.board.set_pin_failing(2, true);
    assert!(matches!(
        rig.device.set_auto(true).await,
        Err(ControlError::Hardware(_))
    ));
    assert!(!rig.state().running);
}

// ── Wash cycle ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn level_trip_runs_one_full_wash() {
    let rig = Rig::started(spec("drum", Family::DrumFilter)).await;
    rig.device.set_auto(true).await.unwrap();

    rig.input(InputRole::CycleTrigger, true);
    settle().await;
    assert_eq!(rig.device.snapshot().phase, CyclePhase::PreStage);
    assert!(rig.is_on(Actuator::WashPump));
    assert!(!rig.is_on(Actuator::Drum));

    secs(5).await;
    assert_eq!(rig.device.snapshot().phase, CyclePhase::MainStage);
    assert!(rig.is_on(Actuator::WashPump));
    assert!(rig.is_on(Actuator::Drum));

    secs(20).await;
    let snap = rig.device.snapshot();
    assert_eq!(snap.phase, CyclePhase::Idle);
    assert!(!snap.state.cycling);
    assert_eq!(snap.state.total_cycles, 1);
    assert_eq!(snap.state.last_cycle_at, Some(noon()));
    assert!(!rig.is_on(Actuator::WashPump));
    assert!(!rig.is_on(Actuator::Drum));

    let washes: Vec<_> = rig
        .events
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::Wash)
        .collect();
    assert_eq!(washes.len(), 1);
    assert_eq!(washes[0].duration, Some(25));
    assert_eq!(washes[0].data, None);
}

#[tokio::test(start_paused = true)]
async fn level_trip_inside_wait_period_is_not_started() {
    let rig = Rig::started(spec("drum", Family::DrumFilter)).await;
    rig.device.set_auto(true).await.unwrap();

    rig.input(InputRole::CycleTrigger, true);
    settle().await;
    secs(26).await;
    assert_eq!(rig.state().total_cycles, 1);

    rig.input(InputRole::CycleTrigger, false);
    settle().await;
    rig.clock.advance(chrono::Duration::seconds(60));
    rig.input(InputRole::CycleTrigger, true);
    settle().await;
    assert_eq!(rig.device.snapshot().phase, CyclePhase::Idle);

    rig.input(InputRole::CycleTrigger, false);
    settle().await;
    rig.clock.advance(chrono::Duration::seconds(61));
    rig.input(InputRole::CycleTrigger, true);
    settle().await;
    assert_eq!(rig.device.snapshot().phase, CyclePhase::PreStage);

    secs(26).await;
    let wash = rig.events.events().into_iter().rfind(|e| e.event_type == EventType::Wash);
    assert_eq!(wash.and_then(|e| e.data), Some(121.0));
}

#[tokio::test(start_paused = true)]
async fn level_trip_outside_auto_is_ignored() {
    let rig = Rig::started(spec("drum", Family::DrumFilter)).await;
    rig.input(InputRole::CycleTrigger, true);
    settle().await;
    assert_eq!(rig.device.snapshot().phase, CyclePhase::Idle);
    assert!(!rig.is_on(Actuator::WashPump));
}

#[tokio::test(start_paused = true)]
async fn forced_cycle_start_is_idempotent() {
    let rig = Rig::started(spec("drum", Family::DrumFilter)).await;
    assert_eq!(rig.device.force_cycle().await, Ok(true));
    assert_eq!(rig.device.force_cycle().await, Ok(false));
    rig.tap(InputRole::ForceCycle).await;

    secs(26).await;
    assert_eq!(rig.state().total_cycles, 1);
    assert_eq!(rig.count(EventType::Wash), 1);
}

#[tokio::test(start_paused = true)]
async fn cycle_is_refused_on_families_without_one() {
    let rig = Rig::started(spec("tank", Family::Tank)).await;
    assert!(matches!(
        rig.device.force_cycle().await,
        Err(ControlError::Invalid(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_mid_cycle_aborts_without_a_wash() {
    let rig = Rig::started(spec("drum", Family::DrumFilter)).await;
    rig.device.force_cycle().await.unwrap();
    secs(6).await;
    assert!(rig.is_on(Actuator::Drum));

    rig.device.set_emergency_stop(true).await.unwrap();
    assert!(!rig.is_on(Actuator::Drum));
    assert!(!rig.is_on(Actuator::WashPump));
    assert_eq!(rig.device.snapshot().phase, CyclePhase::Idle);

    // Clearing must not let a stale stage step of the aborted run through.
    rig.device.set_emergency_stop(false).await.unwrap();
    let writes_before = rig.board.writes().len();
    secs(30).await;
    assert!(!rig.is_on(Actuator::Drum));
    assert!(!rig.is_on(Actuator::WashPump));
    assert_eq!(rig.board.writes().len(), writes_before);
    assert_eq!(rig.count(EventType::Wash), 0);
    assert_eq!(rig.state().total_cycles, 0);
}

#[tokio::test(start_paused = true)]
async fn stage_actuators_are_locked_while_cycling() {
    let rig = Rig::started(spec("drum", Family::DrumFilter)).await;
    rig.device.force_cycle().await.unwrap();
    assert!(matches!(
        rig.device.set_actuator(Actuator::Drum, true).await,
        Err(ControlError::Invalid(_))
    ));
    // Switching a stage actuator off aborts the run.
    assert_eq!(rig.device.set_actuator(Actuator::WashPump, false).await, Ok(true));
    assert_eq!(rig.device.snapshot().phase, CyclePhase::Idle);
    secs(30).await;
    assert!(!rig.is_on(Actuator::Drum));
}

// ── Lifecycle ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn commands_on_a_stopped_device_are_offline() {
    let rig = Rig::new(spec("tank", Family::Tank)).await;
    assert!(matches!(
        rig.device.set_emergency_stop(true).await,
        Err(ControlError::Offline(_))
    ));
    rig.start().await;
    rig.device.stop().await;
    assert!(matches!(
        rig.device.set_auto(true).await,
        Err(ControlError::Offline(_))
    ));
    assert!(!rig.device.is_online());
}

#[tokio::test(start_paused = true)]
async fn repeated_start_stop_leaves_no_tasks_or_subscribers() {
    let mut s = spec("drum", Family::DrumFilter);
    s.propagate_interlocks = true;
    let rig = Rig::new(s).await;
    let global = rig.global.clone();

    let mut per_run = None;
    for _ in 0..25 {
        rig.start().await;
        rig.start().await;
        let running = rig.device.active_tasks();
        assert_eq!(*per_run.get_or_insert(running), running);
        assert_eq!(global.subscriber_count(Topic::Global), 1);
        settle().await;
        rig.device.stop().await;
        rig.device.stop().await;
        assert_eq!(rig.device.active_tasks(), 0);
    }

    assert_eq!(global.subscriber_count(Topic::Global), 0);
    assert_eq!(rig.device.bus().subscriber_count(Topic::Input), 0);
    assert_eq!(rig.device.bus().subscriber_count(Topic::DeviceStopped), 0);
    assert_eq!(rig.board.connects(), 25);
    assert_eq!(rig.board.halts(), 25);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_a_running_cycle_timer() {
    let rig = Rig::started(spec("drum", Family::DrumFilter)).await;
    rig.device.force_cycle().await.unwrap();
    rig.device.stop().await;
    assert_eq!(rig.device.active_tasks(), 0);
    let writes = rig.board.writes().len();
    secs(30).await;
    assert_eq!(rig.board.writes().len(), writes);
}

#[tokio::test(start_paused = true)]
async fn start_retries_the_connection_with_a_fixed_backoff() {
    let rig = Rig::new(spec("tank", Family::Tank)).await;
    rig.board.refuse_connects(3);
    let t0 = tokio::time::Instant::now();
    rig.start().await;
    assert_eq!(t0.elapsed(), Duration::from_millis(300));
    assert!(rig.device.is_online());
}

#[tokio::test(start_paused = true)]
async fn start_gives_up_when_cancelled() {
    let rig = Rig::new(spec("tank", Family::Tank)).await;
    rig.board.set_unreachable(true);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    assert!(matches!(
        rig.device.start(&cancel).await,
        Err(ControlError::Offline(_))
    ));
    assert!(!rig.device.is_started());
}

#[tokio::test(start_paused = true)]
async fn state_survives_a_restart_over_the_same_stores() {
    let stores = Stores::new();
    let global = Bus::new("global");
    {
        let rig = Rig::with(spec("tfp", Family::TechnicalFilter), stores.clone(), global.clone()).await;
        rig.start().await;
        rig.device.set_auto(true).await.unwrap();
        rig.device.set_actuator(Actuator::Uv2, true).await.unwrap();
        rig.device.stop().await;
    }

    let rig = Rig::with(spec("tfp", Family::TechnicalFilter), stores, global).await;
    assert!(rig.state().running);
    rig.start().await;
    assert!(rig.is_on(Actuator::FilterPump));
    assert!(rig.is_on(Actuator::Uv2));
    assert!(!rig.is_on(Actuator::Uv1));
}

#[tokio::test(start_paused = true)]
async fn primary_write_failure_is_a_durability_gap() {
    let rig = Rig::started(spec("tank", Family::Tank)).await;
    rig.stores.states_primary.set_failing(true);
    assert!(matches!(
        rig.device.set_auto(true).await,
        Err(ControlError::Durability(_))
    ));
    // Already actuated; memory is not rolled back.
    assert!(rig.state().running);
    assert!(rig.is_on(Actuator::TankPump));
}

// ── Board supervision ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reboot_replays_outputs_and_restarts_an_interrupted_cycle() {
    let rig = Rig::started(spec("drum", Family::DrumFilter)).await;
    rig.device.force_cycle().await.unwrap();
    secs(6).await;
    assert!(rig.is_on(Actuator::Drum));

    rig.board.reboot();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(rig.board.acks(), 1);
    assert!(!rig.board.is_rebooted());
    assert_eq!(rig.count(EventType::Reboot), 1);
    assert_eq!(rig.device.snapshot().phase, CyclePhase::PreStage);
    assert!(rig.is_on(Actuator::WashPump));
    assert!(!rig.is_on(Actuator::Drum));

    secs(26).await;
    assert_eq!(rig.state().total_cycles, 1);
    assert_eq!(rig.count(EventType::Wash), 1);
}

#[tokio::test(start_paused = true)]
async fn reboot_restores_manual_outputs() {
    let rig = Rig::started(spec("tfp", Family::TechnicalFilter)).await;
    rig.device.set_actuator(Actuator::Bubbler, true).await.unwrap();
    rig.board.reboot();
    assert!(!rig.is_on(Actuator::Bubbler));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(rig.is_on(Actuator::Bubbler));
    assert!(rig.board.reconnects() >= 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_board_goes_offline_once_and_recovers() {
    let rig = Rig::started(spec("tank", Family::Tank)).await;
    rig.device.set_auto(true).await.unwrap();

    rig.board.set_unreachable(true);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!rig.device.is_online());
    assert!(!rig.device.snapshot().online);
    assert_eq!(rig.count(EventType::Offline), 1);
    // Interlock and automation flags are untouched.
    assert!(rig.state().running);
    assert!(!rig.state().emergency_stopped);

    rig.board.set_unreachable(false);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(rig.device.is_online());
    assert_eq!(rig.count(EventType::Online), 1);
    assert!(rig.is_on(Actuator::TankPump));
}

// ── Cross-device signals ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn local_emergency_stop_propagates_to_peers() {
    let global = Bus::new("global");
    let mut drum_spec = spec("drum", Family::DrumFilter);
    drum_spec.propagate_interlocks = true;
    let drum = Rig::with(drum_spec, Stores::new(), global.clone()).await;
    let tank = Rig::with(spec("tank", Family::Tank), Stores::new(), global.clone()).await;
    drum.start().await;
    tank.start().await;
    tank.device.set_auto(true).await.unwrap();

    drum.input(InputRole::EmergencyStop, true);
    settle().await;
    assert!(drum.state().emergency_stopped);
    assert!(tank.state().emergency_stopped);
    assert!(!tank.is_on(Actuator::TankPump));

    drum.input(InputRole::EmergencyStop, false);
    settle().await;
    assert!(!tank.state().emergency_stopped);
    assert!(tank.is_on(Actuator::TankPump));
}

#[tokio::test(start_paused = true)]
async fn remote_clear_does_not_override_a_held_local_stop() {
    let global = Bus::new("global");
    let mut drum_spec = spec("drum", Family::DrumFilter);
    drum_spec.propagate_interlocks = true;
    let drum = Rig::with(drum_spec, Stores::new(), global.clone()).await;
    let tank = Rig::with(spec("tank", Family::Tank), Stores::new(), global.clone()).await;
    drum.start().await;
    tank.start().await;

    tank.input(InputRole::EmergencyStop, true);
    drum.input(InputRole::EmergencyStop, true);
    settle().await;
    drum.input(InputRole::EmergencyStop, false);
    settle().await;

    assert!(!drum.state().emergency_stopped);
    assert!(tank.state().emergency_stopped);
}

#[tokio::test(start_paused = true)]
async fn peer_clear_leaves_an_operator_stop_in_place() {
    let global = Bus::new("global");
    let mut drum_spec = spec("drum", Family::DrumFilter);
    drum_spec.propagate_interlocks = true;
    let drum = Rig::with(drum_spec, Stores::new(), global.clone()).await;
    let tank = Rig::with(spec("tank", Family::Tank), Stores::new(), global.clone()).await;
    drum.start().await;
    tank.start().await;
    settle().await;
    tank.device.set_auto(true).await.unwrap();
    assert_eq!(tank.device.set_emergency_stop(true).await, Ok(true));

    drum.input(InputRole::EmergencyStop, true);
    settle().await;
    drum.input(InputRole::EmergencyStop, false);
    settle().await;

    assert!(!drum.state().emergency_stopped);
    assert!(tank.state().emergency_stopped);
    assert!(!tank.is_on(Actuator::TankPump));

    // Only the operator who set it can clear it.
    assert_eq!(tank.device.set_emergency_stop(false).await, Ok(true));
    assert!(tank.is_on(Actuator::TankPump));
}

#[tokio::test(start_paused = true)]
async fn security_clears_only_after_every_source_releases() {
    let global = Bus::new("global");
    let mut drum_spec = spec("drum", Family::DrumFilter);
    drum_spec.propagate_interlocks = true;
    let drum = Rig::with(drum_spec, Stores::new(), global.clone()).await;
    let tank = Rig::with(spec("tank", Family::Tank), Stores::new(), global.clone()).await;
    drum.start().await;
    tank.start().await;
    settle().await;
    tank.device.set_auto(true).await.unwrap();

    drum.input(InputRole::Security, true);
    settle().await;
    assert_eq!(tank.device.set_security(true).await, Ok(false));
    assert!(!tank.is_on(Actuator::TankPump));

    assert_eq!(tank.device.set_security(false).await, Ok(false));
    assert!(tank.state().security);

    drum.input(InputRole::Security, false);
    settle().await;
    assert!(!tank.state().security);
    assert!(tank.is_on(Actuator::TankPump));
}

#[tokio::test(start_paused = true)]
async fn security_signal_from_another_device_is_applied() {
    let rig = Rig::started(spec("tank", Family::Tank)).await;
    rig.device.set_auto(true).await.unwrap();
    rig.global.publish(Message::Global(GlobalSignal::Security {
        origin: "drum".into(),
        active: true,
    }));
    settle().await;
    assert!(rig.state().security);
    assert!(!rig.is_on(Actuator::TankPump));

    // A device ignores its own broadcasts.
    rig.global.publish(Message::Global(GlobalSignal::Security {
        origin: "tank".into(),
        active: false,
    }));
    settle().await;
    assert!(rig.state().security);
}

// ── Configuration and timed bookkeeping ──────────────────────

#[tokio::test(start_paused = true)]
async fn config_update_is_validated_persisted_and_broadcast() {
    let rig = Rig::started(spec("drum", Family::DrumFilter)).await;
    let mut feed = rig.global.subscribe(Topic::Global);
    let before = rig.device.snapshot().config.version;

    let tunables = Tunables {
        pre_stage_secs: 3,
        ..Tunables::default()
    };
    assert_eq!(rig.device.update_config(tunables.clone()).await, Ok(true));
    assert_eq!(rig.device.update_config(tunables.clone()).await, Ok(false));

    let config = rig.device.snapshot().config;
    assert_eq!(config.version, before + 1);
    assert_eq!(rig.stores.configs_primary.peek("drum").unwrap(), config);
    settle().await;
    assert_eq!(rig.stores.configs_secondary.peek("drum").unwrap(), config);
    match feed.try_recv() {
        Some(Message::Global(GlobalSignal::ConfigChanged { device, version })) => {
            assert_eq!(device, "drum");
            assert_eq!(version, config.version);
        }
        other => panic!("expected a config broadcast, got {other:?}"),
    }
    assert_eq!(rig.count(EventType::ConfigUpdated), 1);

    let invalid = Tunables {
        pre_stage_secs: 0,
        ..Tunables::default()
    };
    assert!(matches!(
        rig.device.update_config(invalid).await,
        Err(ControlError::Invalid(_))
    ));

    // The next run uses the new pre-stage length.
    rig.device.force_cycle().await.unwrap();
    secs(3).await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(rig.is_on(Actuator::Drum));
}

#[tokio::test(start_paused = true)]
async fn lamp_hours_count_only_selected_energised_lamps() {
    let mut s = spec("tfp", Family::TechnicalFilter);
    s.timing.hour_tick_secs = 1;
    s.tunables = Tunables {
        max_hours: 2,
        uv_mode: UvMode::Uv1,
        ..Tunables::default()
    };
    let rig = Rig::started(s).await;
    rig.device.set_actuator(Actuator::Uv1, true).await.unwrap();
    rig.device.set_actuator(Actuator::Uv2, true).await.unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let state = rig.state();
    assert_eq!(state.hours(Actuator::Uv1), 3);
    assert_eq!(state.hours(Actuator::Uv2), 0);
    assert_eq!(rig.count(EventType::HoursExceeded(Actuator::Uv1)), 1);

    // Nothing accrues while interlocked.
    rig.device.set_security(true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rig.state().hours(Actuator::Uv1), 3);
}

#[tokio::test(start_paused = true)]
async fn window_opens_and_closes_automation() {
    let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
    let mut s = spec("tank", Family::Tank);
    s.timing.window_tick_secs = 1;
    s.tunables.window = Some(Window {
        start: hm(8, 0),
        stop: hm(20, 0),
    });
    let rig = Rig::started(s).await;

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(rig.state().running);
    assert!(rig.is_on(Actuator::TankPump));

    rig.clock.set(noon() + chrono::Duration::hours(9));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!rig.state().running);
    assert!(!rig.is_on(Actuator::TankPump));
    assert_eq!(rig.count(EventType::StartAuto), 1);
    assert_eq!(rig.count(EventType::StopAuto), 1);
}

#[tokio::test(start_paused = true)]
async fn snapshots_are_published_on_every_change() {
    let rig = Rig::started(spec("tank", Family::Tank)).await;
    let mut feed = rig.device.watch();
    let mut audit = rig.device.bus().subscribe(Topic::Audit);
    let mut changes = rig.device.bus().subscribe(Topic::StateChanged);
    let _ = feed.borrow_and_update();

    rig.device.set_auto(true).await.unwrap();
    assert!(feed.has_changed().unwrap());
    assert!(feed.borrow_and_update().is_running(Actuator::TankPump));
    assert!(matches!(audit.try_recv(), Some(Message::Audit(e)) if e.event_type == EventType::StartAuto));
    match changes.try_recv() {
        Some(Message::StateChanged(state)) => assert!(state.running),
        other => panic!("expected a state change, got {other:?}"),
    }
}
