//! Dual-store reconciliation over the real file-backed stores: postcard
//! primary, JSON replica.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pondctl::adapters::event_log::MemoryEventLog;
use pondctl::adapters::file_store::{Codec, FileStore};
use pondctl::adapters::memory_store::MemoryStore;
use pondctl::adapters::sim_board::SimBoard;
use pondctl::adapters::time::ManualClock;
use pondctl::app::ports::{Clock, RecordStore};
use pondctl::app::service::{Device, Ports};
use pondctl::config::{DeviceConfig, Tunables};
use pondctl::error::StoreError;
use pondctl::events::Bus;
use pondctl::fsm::context::{DeviceState, Family};
use pondctl::fsm::states::Policy;
use pondctl::reconcile::Reconciler;

use crate::mock_hw::{SECONDARY_TIMEOUT, noon, spec};

fn file_reconciler<R: pondctl::app::ports::Record>(
    root: &Path,
    clock: Arc<dyn Clock>,
) -> (Reconciler<R>, Arc<FileStore<R>>, Arc<FileStore<R>>) {
    let primary = Arc::new(FileStore::new("primary", &root.join("primary"), Codec::Postcard));
    let secondary = Arc::new(FileStore::new("secondary", &root.join("secondary"), Codec::Json));
    let reconciler = Reconciler::new(
        primary.clone() as Arc<dyn RecordStore<R>>,
        Some(secondary.clone() as Arc<dyn RecordStore<R>>),
        SECONDARY_TIMEOUT,
        clock,
    );
    (reconciler, primary, secondary)
}

fn ports_over(root: &Path, id: &str) -> Ports {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at(noon()));
    Ports {
        board: Box::new(SimBoard::new(id)),
        states: file_reconciler(root, clock.clone()).0,
        configs: file_reconciler(root, clock.clone()).0,
        events: Arc::new(MemoryEventLog::new()),
        clock,
        global: Bus::new("global"),
    }
}

#[tokio::test]
async fn replica_only_config_is_restored_into_the_primary() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at(noon()));
    let (reconciler, primary, secondary) = file_reconciler::<DeviceConfig>(dir.path(), clock);

    let mut saved = DeviceConfig::template(
        "drum",
        Tunables {
            main_stage_secs: 40,
            ..Tunables::default()
        },
    );
    saved.version = 4;
    saved.updated_at = noon();
    secondary.create(&saved).await.unwrap();

    let template = DeviceConfig::template("drum", Tunables::default());
    let restored = reconciler.init(template).await.unwrap();
    assert_eq!(restored, saved);
    assert_eq!(primary.get("drum").await.unwrap(), Some(saved.clone()));
    assert_eq!(reconciler.get("drum").await.unwrap(), Some(saved));
    assert!(dir.path().join("primary/configs/drum.bin").exists());
}

#[tokio::test]
async fn newer_primary_state_overwrites_a_stale_replica() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at(noon()));
    let (reconciler, primary, secondary) = file_reconciler::<DeviceState>(dir.path(), clock);
    let policy = Policy::for_family(Family::Tank);

    let mut old = DeviceState::template("tank", "Tank", &policy);
    old.updated_at = noon() - chrono::Duration::minutes(5);
    let mut new = old.clone();
    new.running = true;
    new.updated_at = noon();
    primary.create(&new).await.unwrap();
    secondary.create(&old).await.unwrap();

    let winner = reconciler
        .init(DeviceState::template("tank", "Tank", &policy))
        .await
        .unwrap();
    assert!(winner.running);
    assert_eq!(secondary.get("tank").await.unwrap(), Some(new));
}

#[tokio::test]
async fn corrupt_primary_record_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let configs = dir.path().join("primary/configs");
    std::fs::create_dir_all(&configs).unwrap();
    std::fs::write(configs.join("drum.bin"), [0xff, 0xff, 0xff]).unwrap();

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at(noon()));
    let (reconciler, _, _) = file_reconciler::<DeviceConfig>(dir.path(), clock);
    let err = reconciler
        .init(DeviceConfig::template("drum", Tunables::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Codec(_)));
}

#[tokio::test]
async fn bootstrap_creates_both_records_in_both_stores() {
    let dir = tempfile::tempdir().unwrap();
    let device = Device::bootstrap(spec("drum", Family::DrumFilter), ports_over(dir.path(), "drum"))
        .await
        .unwrap();

    let snap = device.snapshot();
    assert_eq!(snap.state.version, 1);
    assert_eq!(snap.config.version, 1);
    assert!(!snap.online);
    for path in [
        "primary/states/drum.bin",
        "primary/configs/drum.bin",
        "secondary/states/drum.json",
        "secondary/configs/drum.json",
    ] {
        assert!(dir.path().join(path).exists(), "{path} missing");
    }

    // A second bootstrap over the same files finds them in agreement.
    let again = Device::bootstrap(spec("drum", Family::DrumFilter), ports_over(dir.path(), "drum"))
        .await
        .unwrap();
    assert_eq!(again.snapshot().state, snap.state);
}

#[tokio::test]
async fn bootstrap_rejects_a_record_of_another_family() {
    let dir = tempfile::tempdir().unwrap();
    Device::bootstrap(spec("pond", Family::Tank), ports_over(dir.path(), "pond"))
        .await
        .unwrap();

    let err = Device::bootstrap(spec("pond", Family::DrumFilter), ports_over(dir.path(), "pond"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Codec(_)));
}

#[tokio::test]
async fn bootstrap_fails_when_the_primary_is_down() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at(noon()));
    let primary = Arc::new(MemoryStore::<DeviceState>::new("primary"));
    primary.set_failing(true);
    let configs = Arc::new(MemoryStore::<DeviceConfig>::new("primary"));
    let ports = Ports {
        board: Box::new(SimBoard::new("tank")),
        states: Reconciler::new(primary, None, Duration::from_millis(100), clock.clone()),
        configs: Reconciler::new(configs, None, Duration::from_millis(100), clock.clone()),
        events: Arc::new(MemoryEventLog::new()),
        clock,
        global: Bus::new("global"),
    };
    let err = Device::bootstrap(spec("tank", Family::Tank), ports).await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
}

#[tokio::test]
async fn bootstrap_survives_a_missing_replica() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at(noon()));
    let replica = Arc::new(MemoryStore::<DeviceState>::new("secondary"));
    replica.set_failing(true);
    let ports = Ports {
        board: Box::new(SimBoard::new("tank")),
        states: Reconciler::new(
            Arc::new(FileStore::<DeviceState>::new("primary", dir.path(), Codec::Postcard)),
            Some(replica.clone() as Arc<dyn RecordStore<DeviceState>>),
            SECONDARY_TIMEOUT,
            clock.clone(),
        ),
        configs: file_reconciler(dir.path(), clock.clone()).0,
        events: Arc::new(MemoryEventLog::new()),
        clock,
        global: Bus::new("global"),
    };
    let device = Device::bootstrap(spec("tank", Family::Tank), ports).await.unwrap();
    assert_eq!(device.snapshot().state.version, 1);
    assert_eq!(replica.writes(), 0);
}
