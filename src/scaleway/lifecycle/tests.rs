use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rstest::{fixture, rstest};
use scaleway_rs::{ScalewayApi, ScalewayImage};

use super::instance::InstanceRemoval;
use super::snapshot::ImageDetails;
use super::*;
use crate::driver::{ImageState, MachineState, SourceImageQuery};
use crate::scaleway::types::image_state;
use crate::scaleway::{DEFAULT_SSH_PORT, ScalewayDriver};

fn snapshot(state: &str, allowed: &[&str], public_ip: Option<&str>) -> InstanceSnapshot {
    InstanceSnapshot {
        id: InstanceId::from("srv-1"),
        state: InstanceState::from(state),
        allowed_actions: allowed.iter().map(|action| Action::from(*action)).collect(),
        public_ip: public_ip.map(str::to_owned),
        volume_ids: vec![String::from("vol-root"), String::from("vol-data")],
    }
}

fn attached_volume(id: &str) -> scaleway_rs::ScalewayImageExtraVolume {
    scaleway_rs::ScalewayImageExtraVolume {
        id: id.to_owned(),
        name: format!("volume {id}"),
        export_uri: None,
        size: 0,
        volume_type: String::from("l_ssd"),
        creation_date: String::new(),
        modification_date: String::new(),
        organization: String::new(),
        project: String::new(),
        tags: vec![],
        server: scaleway_rs::ScalewayImageExtraVolumeServer {
            id: String::from("srv-1"),
            name: String::from("kiln-build"),
        },
        state: String::from("available"),
        zone: String::from("fr-par-1"),
    }
}

fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
    ScalewayImage {
        id: id.to_owned(),
        name: format!("image {id}"),
        arch: arch.to_owned(),
        creation_date: creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

#[fixture]
fn query() -> SourceImageQuery {
    SourceImageQuery {
        label: String::from("Ubuntu 24.04 Noble Numbat"),
        architecture: String::from("x86_64"),
        zone: String::from("fr-par-1"),
        project_id: String::from("proj"),
        organisation_id: None,
    }
}

#[fixture]
fn driver() -> ScalewayDriver {
    ScalewayDriver {
        api: ScalewayApi::new("dummy"),
        secret_key: String::from("dummy"),
        ssh_port: DEFAULT_SSH_PORT,
        poll_interval: Duration::from_millis(1),
    }
}

#[rstest]
fn select_image_picks_newest(query: SourceImageQuery) {
    let candidates = vec![
        image("old", "x86_64", "available", "2024-01-01T00:00:00Z"),
        image("new", "x86_64", "available", "2025-03-01T00:00:00Z"),
        image("mid", "x86_64", "available", "2024-06-01T00:00:00Z"),
    ];
    let selected = ScalewayDriver::select_image(candidates, &query).expect("image selected");
    assert_eq!(selected.id, "new");
    assert_eq!(selected.architecture, "x86_64");
}

#[rstest]
fn select_image_reports_missing_image(query: SourceImageQuery) {
    let err = ScalewayDriver::select_image(Vec::new(), &query).expect_err("no candidates");
    assert_eq!(
        err,
        ScalewayDriverError::ImageNotFound {
            label: query.label.clone(),
            arch: query.architecture.clone(),
            zone: query.zone.clone(),
        }
    );
}

#[rstest]
fn filter_images_drops_wrong_arch_and_unavailable(query: SourceImageQuery) {
    let images = vec![
        image("keep", "x86_64", "available", "2024-01-01"),
        image("arm", "arm64", "available", "2024-01-01"),
        image("busy", "x86_64", "creating", "2024-01-01"),
    ];
    let ids: Vec<String> = ScalewayDriver::filter_images(images, &query)
        .into_iter()
        .map(|kept| kept.id)
        .collect();
    assert_eq!(ids, vec![String::from("keep")]);
}

#[rstest]
#[tokio::test]
async fn resolve_prefers_project_images(driver: ScalewayDriver, query: SourceImageQuery) {
    let resolved = driver
        .resolve_image_with(
            &query,
            || async { Ok(vec![image("private", "x86_64", "available", "2023-01-01")]) },
            || async { Ok(vec![image("public", "x86_64", "available", "2025-01-01")]) },
        )
        .await
        .expect("image resolved");
    assert_eq!(resolved.id, "private");
}

#[rstest]
#[tokio::test]
async fn resolve_falls_back_to_public_images(driver: ScalewayDriver, query: SourceImageQuery) {
    let resolved = driver
        .resolve_image_with(
            &query,
            || async { Ok(vec![image("arm", "arm64", "available", "2023-01-01")]) },
            || async { Ok(vec![image("public", "x86_64", "available", "2025-01-01")]) },
        )
        .await
        .expect("image resolved");
    assert_eq!(resolved.id, "public");
}

#[rstest]
#[tokio::test]
async fn resolve_propagates_fetch_errors(driver: ScalewayDriver, query: SourceImageQuery) {
    let err = driver
        .resolve_image_with(
            &query,
            || async { Ok(Vec::new()) },
            || async {
                Err(ScalewayDriverError::Provider {
                    message: String::from("boom"),
                })
            },
        )
        .await
        .expect_err("fetch failure surfaces");
    assert!(matches!(err, ScalewayDriverError::Provider { .. }));
}

#[rstest]
#[case("running", MachineState::Running)]
#[case("stopped", MachineState::Stopped)]
#[case("stopped in place", MachineState::Stopped)]
#[case("starting", MachineState::Starting)]
#[case("stopping", MachineState::Stopping)]
#[case("locked", MachineState::Locked)]
#[case("archived", MachineState::Other(String::from("archived")))]
fn server_states_map_to_machine_states(#[case] raw: &str, #[case] expected: MachineState) {
    assert_eq!(InstanceState::from(raw).to_machine_state(), expected);
}

#[rstest]
#[case("available", ImageState::Available)]
#[case("creating", ImageState::Creating)]
#[case("error", ImageState::Error)]
#[case("deleted", ImageState::Other(String::from("deleted")))]
fn image_states_map_to_driver_states(#[case] raw: &str, #[case] expected: ImageState) {
    assert_eq!(image_state(raw), expected);
}

#[test]
fn networking_uses_public_ip_and_port() {
    let server = snapshot("running", &[], Some("203.0.113.7"));
    let networking = ScalewayDriver::networking_from(&server, 2222).expect("networking");
    assert_eq!(
        networking.public_ip,
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    );
    assert_eq!(networking.ssh_port, 2222);
}

#[rstest]
#[case(None)]
#[case(Some("not-an-ip"))]
fn networking_requires_public_ip(#[case] address: Option<&str>) {
    let server = snapshot("running", &[], address);
    let err = ScalewayDriver::networking_from(&server, DEFAULT_SSH_PORT).expect_err("no address");
    assert_eq!(
        err,
        ScalewayDriverError::MissingPublicIp {
            instance_id: String::from("srv-1"),
        }
    );
}

#[rstest]
#[case(&["poweroff", "terminate"], true)]
#[case(&["poweron", "backup"], false)]
#[case(&[], false)]
fn terminate_requires_allowed_action(#[case] allowed: &[&str], #[case] expected: bool) {
    let server = snapshot("running", allowed, None);
    assert_eq!(ScalewayDriver::can_terminate(&server), expected);
}

#[rstest]
#[case(Some("/images/0a1b2c"), Ok(String::from("0a1b2c")))]
#[case(Some("/images/"), Err(()))]
#[case(Some("/servers/abc"), Err(()))]
#[case(None, Err(()))]
fn backup_href_yields_image_id(#[case] href: Option<&str>, #[case] expected: Result<String, ()>) {
    let parsed = ScalewayDriver::image_id_from_href(href).map_err(|_| ());
    assert_eq!(parsed, expected);
}

#[test]
fn image_details_parse_root_volume() {
    let body = br#"{"id":"img-1","state":"available","root_volume":{"id":"snap-1","name":"root"}}"#;
    let details: ImageDetails = parse(body).expect("details parse");
    assert_eq!(details.state, "available");
    assert_eq!(
        details.root_volume.map(|root| root.id).as_deref(),
        Some("snap-1")
    );
}

#[test]
fn parse_reports_unexpected_shape() {
    let err = parse::<ImageDetails>(b"{}").expect_err("missing fields");
    assert!(matches!(err, ScalewayDriverError::UnexpectedResponse { .. }));
}

#[test]
fn stopped_server_is_deleted_with_its_volumes() {
    let server = snapshot("stopped", &["poweron", "backup"], None);
    assert_eq!(
        ScalewayDriver::removal_for(&server),
        InstanceRemoval::Delete {
            volume_ids: vec![String::from("vol-root"), String::from("vol-data")],
        }
    );
}

#[test]
fn running_server_is_terminated() {
    let server = snapshot("running", &["poweroff", "terminate"], None);
    assert_eq!(
        ScalewayDriver::removal_for(&server),
        InstanceRemoval::Terminate
    );
}

#[test]
fn attached_volume_ids_are_sorted() {
    let volumes = scaleway_rs::ScalewayImageExtraVolumes {
        volumes: HashMap::from([
            (String::from("1"), attached_volume("vol-b")),
            (String::from("0"), attached_volume("vol-a")),
        ]),
    };
    assert_eq!(
        volume_ids(volumes),
        vec![String::from("vol-a"), String::from("vol-b")]
    );
}

#[tokio::test]
async fn power_on_failure_releases_the_server() {
    let server = snapshot("stopped", &[], None);
    let mut released = false;

    let err = ScalewayDriver::power_on_or_release(
        &server,
        || async {
            Err(ScalewayDriverError::PowerOnNotAllowed {
                instance_id: String::from("srv-1"),
                state: String::from("stopped"),
            })
        },
        || {
            released = true;
            async { Ok(()) }
        },
    )
    .await
    .expect_err("power-on failure surfaces");

    assert!(matches!(err, ScalewayDriverError::PowerOnNotAllowed { .. }));
    assert!(released);
}

#[tokio::test]
async fn release_failure_keeps_the_power_on_error() {
    let server = snapshot("stopped", &[], None);

    let err = ScalewayDriver::power_on_or_release(
        &server,
        || async {
            Err(ScalewayDriverError::Provider {
                message: String::from("poweron rejected"),
            })
        },
        || async {
            Err(ScalewayDriverError::Provider {
                message: String::from("delete rejected"),
            })
        },
    )
    .await
    .expect_err("power-on failure surfaces");

    assert_eq!(
        err,
        ScalewayDriverError::Provider {
            message: String::from("poweron rejected"),
        }
    );
}

#[tokio::test]
async fn successful_power_on_keeps_the_server() {
    let server = snapshot("stopped", &["poweron"], None);
    let mut released = false;

    ScalewayDriver::power_on_or_release(
        &server,
        || async { Ok(()) },
        || {
            released = true;
            async { Ok(()) }
        },
    )
    .await
    .expect("power-on succeeds");

    assert!(!released);
}

#[test]
fn image_snapshots_include_extra_volumes() {
    let body = br#"{
        "id": "img-1",
        "state": "available",
        "root_volume": {"id": "snap-root"},
        "extra_volumes": {"2": {"id": "snap-logs"}, "1": {"id": "snap-data"}}
    }"#;
    let details: ImageDetails = parse(body).expect("details parse");
    assert_eq!(
        details.snapshot_ids(),
        vec!["snap-root", "snap-data", "snap-logs"]
    );
}
