use std::net::Ipv4Addr;
use std::panic::{catch_unwind, AssertUnwindSafe};

use embassy_futures::block_on;

use pup_coordinator::orchestrator::Device;
use pup_coordinator::provisioning::{
    CredentialFailureReason, Provisioner, ProvisioningEvent, ProvisioningState,
};
use pup_coordinator::sim::{restart_requested, SimBoard, SimButton, SimRadio, SIM_IP};
use pup_coordinator::status::{StatusBoard, StatusSignal};
use pup_coordinator::store::{MemoryStore, POP_KEY, SETTINGS_KEY, SYSTEM_NAMESPACE};

fn provisioner(radio: &SimRadio, max_retries: u32) -> Provisioner {
    Provisioner::new(
        Box::new(radio.transport()),
        Box::new(radio.station()),
        "PROV_A1B20C".to_string(),
        max_retries,
        StatusBoard::new().pulse_handle(),
    )
}

#[test]
fn five_failures_with_bound_five_start_a_fresh_cycle() {
    let radio = SimRadio::new(false);
    let prov = provisioner(&radio, 5);

    prov.handle_event(ProvisioningEvent::SessionStarted);
    prov.handle_event(ProvisioningEvent::CredentialsReceived {
        ssid: "home".to_string(),
    });
    for _ in 0..5 {
        prov.handle_event(ProvisioningEvent::CredentialFailure(
            CredentialFailureReason::AuthError,
        ));
    }

    assert_eq!(prov.state(), ProvisioningState::Unprovisioned);
    assert_eq!(prov.retries(), 0);
    assert_eq!(radio.log().failure_resets, 1);
}

#[test]
fn retry_counter_stays_below_the_bound_for_any_failure_run() {
    for bound in 1..=6 {
        let radio = SimRadio::new(false);
        let prov = provisioner(&radio, bound);

        for _ in 0..(bound * 3) {
            prov.handle_event(ProvisioningEvent::CredentialFailure(
                CredentialFailureReason::ApNotFound,
            ));
            assert!(prov.retries() < bound);
        }
        assert_eq!(radio.log().failure_resets, 3);
    }
}

#[test]
fn reset_provisioning_is_idempotent() {
    let radio = SimRadio::new(true);
    let prov = provisioner(&radio, 5);
    prov.handle_event(ProvisioningEvent::CredentialFailure(
        CredentialFailureReason::AuthError,
    ));

    prov.reset_provisioning().unwrap();
    let once = (prov.state(), prov.retries(), radio.log().provisioned);
    prov.reset_provisioning().unwrap();
    let twice = (prov.state(), prov.retries(), radio.log().provisioned);

    assert_eq!(once, twice);
    assert_eq!(twice, (ProvisioningState::Unprovisioned, 0, false));
}

#[test]
fn fresh_device_is_provisioned_over_ble() {
    let store = MemoryStore::new().with(SYSTEM_NAMESPACE, POP_KEY, "7c1e09ab");
    let board = SimBoard::new(false).with_store(store);
    let mut device = Device::bring_up(Box::new(board.clone())).unwrap();

    let ip = block_on(device.start(|| true)).unwrap();

    assert_eq!(ip, SIM_IP);
    assert_eq!(device.provisioner().state(), ProvisioningState::Connected);
    assert_eq!(device.status().current(), StatusSignal::Connected);

    let log = board.radio.log();
    assert_eq!(
        log.sessions_started,
        vec![("PROV_A1B20C".to_string(), "7c1e09ab".to_string())]
    );
    assert!(log.provisioned);
    assert_eq!(log.country.as_deref(), Some("CH"));
}

#[test]
fn provisioned_device_skips_the_ble_session() {
    let board = SimBoard::new(true);
    let mut device = Device::bring_up(Box::new(board.clone())).unwrap();

    let ip = block_on(device.start(|| true)).unwrap();

    assert_eq!(ip, SIM_IP);
    let log = board.radio.log();
    assert!(log.sessions_started.is_empty());
    assert_eq!(log.station_starts, 1);
    assert_eq!(log.sessions_ended, 1);
}

#[test]
fn wifi_drop_after_startup_reconnects_without_releasing_again() {
    let board = SimBoard::new(true);
    let mut device = Device::bring_up(Box::new(board.clone())).unwrap();
    block_on(device.start(|| true)).unwrap();
    let connects = board.radio.log().connects;

    device
        .provisioner()
        .handle_event(ProvisioningEvent::StationDisconnected);
    assert!(board.radio.log().connects > connects);

    device
        .provisioner()
        .handle_event(ProvisioningEvent::GotIp(Ipv4Addr::new(192, 168, 1, 43)));
    assert_eq!(device.provisioner().state(), ProvisioningState::Connected);
}

#[test]
fn holding_the_button_wipes_credentials_and_restarts() {
    let store = MemoryStore::new().with(
        SYSTEM_NAMESPACE,
        SETTINGS_KEY,
        r#"{"button":{"poll_ms":2,"debounce_ms":4,"hold_ms":30,"reset_grace_ms":5,"restart_grace_ms":5}}"#,
    );
    let mut board = SimBoard::new(true).with_store(store);
    board.button = SimButton::held();

    let device = Device::bring_up(Box::new(board.clone())).unwrap();
    let provisioner = device.provisioner().clone();

    let outcome = catch_unwind(AssertUnwindSafe(|| block_on(device.run(|| true))));

    assert!(restart_requested(outcome));
    assert!(!board.radio.log().provisioned);
    assert_eq!(provisioner.state(), ProvisioningState::ResetRequested);
    assert!(board.journal.position("restart").is_some());
}
