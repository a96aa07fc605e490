//! Tests for the canonical build steps against the fake driver.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::Communicator;
use crate::driver::{
    DriverError, ImageHandle, ImageMetadata, ImageState, MachineHandle, MachineNetworking,
};
use crate::hook::{DispatchHook, HOOK_POST_PROVISION, HOOK_PRE_PROVISION, HOOK_PROVISION};
use crate::remote::Connection;
use crate::state::keys;
use crate::step::{Step, StepAction, StepError};
use crate::test_support::{
    DriverOperation, FakeDriver, Journal, RecordingHook, RecordingUi, sample_settings,
};

#[fixture]
fn settings() -> BuildSettings {
    sample_settings()
}

struct Harness {
    state: StateBag,
    driver: FakeDriver,
    ui: Arc<RecordingUi>,
}

fn harness(settings: BuildSettings, driver: FakeDriver) -> Harness {
    let state = StateBag::new();
    let ui = Arc::new(RecordingUi::new());
    state.put(keys::CONFIG, settings);
    state.put_driver(Arc::new(driver.clone()));
    state.put_ui(ui.clone());
    Harness { state, driver, ui }
}

async fn run(step: &dyn Step, state: &StateBag) -> StepAction {
    step.run(state, &CancellationToken::new()).await
}

fn source_image() -> ImageMetadata {
    ImageMetadata {
        id: String::from("src-image"),
        name: String::from("Ubuntu 24.04 Noble Numbat"),
        architecture: String::from("x86_64"),
        creation_date: String::from("2024-04-25T00:00:00Z"),
    }
}

async fn with_machine(harness: &Harness) -> MachineHandle {
    harness.state.put(SOURCE_IMAGE, source_image());
    assert_eq!(run(&StepCreateMachine, &harness.state).await, StepAction::Continue);
    harness
        .state
        .get::<MachineHandle>(MACHINE)
        .expect("machine published")
}

#[rstest]
#[tokio::test]
async fn source_image_is_published(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());

    let action = run(&StepSourceImage, &h.state).await;

    assert_eq!(action, StepAction::Continue);
    let image = h
        .state
        .get::<ImageMetadata>(SOURCE_IMAGE)
        .expect("source image stored");
    assert_eq!(image.name, "Ubuntu 24.04 Noble Numbat");
}

#[rstest]
#[tokio::test]
async fn create_machine_requires_source_image(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());

    let action = run(&StepCreateMachine, &h.state).await;

    assert_eq!(action, StepAction::Halt);
    assert!(matches!(h.state.error(), Some(StepError::State { .. })));
    assert!(h.driver.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn create_machine_failure_is_recorded(settings: BuildSettings) {
    let h = harness(
        settings,
        FakeDriver::new().fail_on(DriverOperation::CreateMachine),
    );
    h.state.put(SOURCE_IMAGE, source_image());

    let action = run(&StepCreateMachine, &h.state).await;

    assert_eq!(action, StepAction::Halt);
    assert!(matches!(h.state.error(), Some(StepError::Driver { .. })));
    assert!(!h.state.contains(MACHINE));
    assert_eq!(h.ui.errors().len(), 1);
}

#[rstest]
#[tokio::test]
async fn create_machine_cleanup_deletes_the_machine(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());
    let handle = with_machine(&h).await;
    assert_eq!(h.driver.machines(), vec![handle.id]);

    StepCreateMachine
        .cleanup(&h.state)
        .await
        .expect("cleanup succeeds");

    assert!(h.driver.machines().is_empty());
    assert!(!h.state.contains(MACHINE));
}

#[rstest]
#[tokio::test]
async fn create_machine_cleanup_without_machine_is_a_no_op(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());

    StepCreateMachine
        .cleanup(&h.state)
        .await
        .expect("nothing to clean");

    assert!(h.driver.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn wait_for_running_publishes_networking(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());
    with_machine(&h).await;

    let action = run(&StepWaitForRunning, &h.state).await;

    assert_eq!(action, StepAction::Continue);
    let networking = h
        .state
        .get::<MachineNetworking>(MACHINE_NETWORKING)
        .expect("networking stored");
    assert_eq!(networking.public_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
}

#[rstest]
#[tokio::test]
async fn cancelled_wait_halts_without_error(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());
    with_machine(&h).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let action = StepWaitForRunning.run(&h.state, &cancel).await;

    assert_eq!(action, StepAction::Halt);
    assert_eq!(h.state.error(), None);
}

#[rstest]
#[tokio::test]
async fn connect_is_skipped_without_communicator(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());

    let action = run(&StepConnect::new(), &h.state).await;

    assert_eq!(action, StepAction::Continue);
    assert!(!h.state.contains(CONNECTION));
}

#[rstest]
#[tokio::test]
async fn connect_publishes_connection_once_port_accepts(settings: BuildSettings) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let h = harness(
        BuildSettings {
            communicator: Communicator::Ssh,
            ssh_port: port,
            ..settings
        },
        FakeDriver::new(),
    );
    h.state.put(
        MACHINE_NETWORKING,
        MachineNetworking {
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ssh_port: 22,
        },
    );

    let action = run(&StepConnect::new(), &h.state).await;

    assert_eq!(action, StepAction::Continue);
    let connection = h
        .state
        .get::<Connection>(CONNECTION)
        .expect("connection stored");
    assert_eq!(connection.port, port);

    StepConnect::new()
        .cleanup(&h.state)
        .await
        .expect("cleanup succeeds");
    assert!(!h.state.contains(CONNECTION));
}

#[rstest]
#[tokio::test]
async fn connect_tolerates_unbounded_ssh_timeout(settings: BuildSettings) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let mut unbounded = BuildSettings {
        communicator: Communicator::Ssh,
        ssh_port: port,
        ..settings
    };
    unbounded.timeouts.ssh = Duration::from_secs(u64::MAX);
    let h = harness(unbounded, FakeDriver::new());
    h.state.put(
        MACHINE_NETWORKING,
        MachineNetworking {
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ssh_port: 22,
        },
    );

    let action = run(&StepConnect::new(), &h.state).await;

    assert_eq!(action, StepAction::Continue);
    assert!(h.state.contains(CONNECTION));
}

#[rstest]
#[tokio::test]
async fn connect_times_out_on_closed_port(settings: BuildSettings) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    let h = harness(
        BuildSettings {
            communicator: Communicator::Ssh,
            ssh_port: port,
            ..settings
        },
        FakeDriver::new(),
    );
    h.state.put(
        MACHINE_NETWORKING,
        MachineNetworking {
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ssh_port: 22,
        },
    );

    let step = StepConnect::new().with_retry_interval(Duration::from_millis(5));
    let action = run(&step, &h.state).await;

    assert_eq!(action, StepAction::Halt);
    assert!(matches!(h.state.error(), Some(StepError::Connect { .. })));
}

#[rstest]
#[tokio::test]
async fn provision_runs_hooks_in_order(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());
    let journal = Journal::new();
    let hook = Arc::new(RecordingHook::new("shell").with_journal(journal.clone()));
    h.state.put_hook(Arc::new(
        DispatchHook::new()
            .register(HOOK_PRE_PROVISION, hook.clone())
            .register(HOOK_PROVISION, hook.clone())
            .register(HOOK_POST_PROVISION, hook),
    ));

    let action = run(&StepProvision, &h.state).await;

    assert_eq!(action, StepAction::Continue);
    assert_eq!(
        journal.entries(),
        vec![
            "shell:pre_provision",
            "shell:provision",
            "shell:post_provision"
        ]
    );
}

#[rstest]
#[tokio::test]
async fn provision_records_hook_failure(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());
    h.state
        .put_hook(Arc::new(RecordingHook::new("shell").fail_with("exit 1")));

    let action = run(&StepProvision, &h.state).await;

    assert_eq!(action, StepAction::Halt);
    assert!(matches!(h.state.error(), Some(StepError::Hook { .. })));
}

#[rstest]
#[tokio::test]
async fn stop_machine_waits_for_stopped(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());
    with_machine(&h).await;

    let action = run(&StepStopMachine, &h.state).await;

    assert_eq!(action, StepAction::Continue);
    assert_eq!(
        h.driver.mutations(),
        vec![DriverOperation::CreateMachine, DriverOperation::StopMachine]
    );
}

#[rstest]
#[tokio::test]
async fn completed_image_survives_cleanup(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());
    with_machine(&h).await;

    assert_eq!(run(&StepCreateImage, &h.state).await, StepAction::Continue);
    StepCreateImage
        .cleanup(&h.state)
        .await
        .expect("cleanup succeeds");

    assert_eq!(h.driver.images().len(), 1);
    assert!(h.state.contains(IMAGE));
}

#[rstest]
#[tokio::test]
async fn image_of_halted_build_is_deleted(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());
    with_machine(&h).await;
    assert_eq!(run(&StepCreateImage, &h.state).await, StepAction::Continue);
    h.state.put(keys::HALTED, true);

    StepCreateImage
        .cleanup(&h.state)
        .await
        .expect("cleanup succeeds");

    assert!(h.driver.images().is_empty());
    assert!(!h.state.contains(IMAGE));
}

#[rstest]
#[tokio::test]
async fn failed_image_is_recorded_and_published_for_cleanup(settings: BuildSettings) {
    let h = harness(
        settings,
        FakeDriver::new().with_image_outcome(ImageState::Error),
    );
    with_machine(&h).await;

    let action = run(&StepCreateImage, &h.state).await;

    assert_eq!(action, StepAction::Halt);
    assert!(matches!(
        h.state.error(),
        Some(StepError::Driver {
            source: DriverError::ImageFailed { .. },
            ..
        })
    ));
    assert!(h.state.get::<ImageHandle>(IMAGE).is_some());
}

#[rstest]
#[tokio::test]
async fn tags_are_applied_to_the_image(settings: BuildSettings) {
    let h = harness(settings, FakeDriver::new());
    let image = ImageHandle {
        id: String::from("img-9"),
        zone: String::from("fr-par-1"),
    };
    h.state.put(IMAGE, image);

    let action = run(&StepTagImage, &h.state).await;

    assert_eq!(action, StepAction::Continue);
    assert_eq!(h.driver.image_tags("img-9"), vec!["web"]);
}

#[rstest]
#[tokio::test]
async fn tagging_without_tags_makes_no_call(settings: BuildSettings) {
    let mut untagged = settings;
    untagged.image.tags.clear();
    let h = harness(untagged, FakeDriver::new());

    let action = run(&StepTagImage, &h.state).await;

    assert_eq!(action, StepAction::Continue);
    assert!(h.driver.calls().is_empty());
}
