use async_trait::async_trait;
use dispatch_rs::host::dispatcher::{DispatchError, Dispatcher};
use dispatch_rs::host::firmware::FirmwareUploader;
use dispatch_rs::host::machine::Machine;
use dispatch_rs::shared::api_models::MachineState;
use dispatch_rs::shared::config::{
    CancelConfig, Config, ExecutorConfig, MachineConfig, MachineKind, NetworkConfig, PollerConfig, PrintLoopConfig,
};
use dispatch_rs::shared::device::LinkError;
use dispatch_rs::shared::job::{Conclusion, JobKind, JobState};
use dispatch_rs::simulator::{SimNetworkDevice, SimSerialDevice};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> Config {
    Config {
        executor: ExecutorConfig {
            max_retries: 3,
            overflow_backoff_ms: 1,
            overflow_probe_threshold: 20,
        },
        print_loop: PrintLoopConfig {
            telemetry_line_interval: 1000,
            telemetry_interval_ms: 60_000,
            idle_step_ms: 1,
            pause_step_ms: 2,
        },
        poller: PollerConfig { interval_ms: 10 },
        cancel: CancelConfig { settle_ms: 5 },
        network: NetworkConfig {
            auth_retries: 3,
            request_timeout_ms: 1000,
            retry_delay_ms: 1,
        },
        ..Default::default()
    }
}

fn serial(name: &str) -> MachineConfig {
    MachineConfig {
        name: name.to_string(),
        kind: MachineKind::Serial,
        port: Some(format!("/dev/tty-{}", name)),
        address: None,
        baud: 115200,
        profile: "default".to_string(),
        serial_number: None,
        token: None,
    }
}

fn network(name: &str) -> MachineConfig {
    MachineConfig {
        name: name.to_string(),
        kind: MachineKind::Network,
        port: None,
        address: Some("10.0.0.8:9999".to_string()),
        ..serial(name)
    }
}

#[derive(Default)]
struct InstantUploader;

#[async_trait]
impl FirmwareUploader for InstantUploader {
    async fn upload(&self, _port: &str, _image: &Path) -> Result<(), LinkError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_attach_connects_and_lists_machines_by_name() {
    let dispatcher = Dispatcher::new(fast_config());
    let zeta = SimSerialDevice::new("zeta");
    let alpha = SimNetworkDevice::new("alpha");
    dispatcher
        .attach_serial(&serial("zeta"), Arc::new(zeta), None)
        .await
        .unwrap();
    dispatcher
        .attach_network(&network("alpha"), Arc::new(alpha))
        .await
        .unwrap();

    let machines = dispatcher.machines();
    let names: Vec<&str> = machines.iter().map(|m| m.name()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
    assert!(machines.iter().all(|m| m.state() == MachineState::Idle));
    assert!(dispatcher.machine("zeta").is_some());
    dispatcher.shutdown().await;
    assert!(dispatcher.machines().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_name_is_rejected_while_connected() {
    let dispatcher = Dispatcher::new(fast_config());
    dispatcher
        .attach_serial(&serial("replicator"), Arc::new(SimSerialDevice::new("a")), None)
        .await
        .unwrap();
    let err = dispatcher
        .attach_serial(&serial("replicator"), Arc::new(SimSerialDevice::new("b")), None)
        .await
        .err().unwrap();
    assert!(matches!(err, DispatchError::Duplicate(ref name) if name == "replicator"));
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attaches_under_one_name_connect_once() {
    let dispatcher = Dispatcher::new(fast_config());
    let first = SimSerialDevice::new("a");
    let second = SimSerialDevice::new("b");
    let config = serial("replicator");
    let (left, right) = tokio::join!(
        dispatcher.attach_serial(&config, Arc::new(first.clone()), None),
        dispatcher.attach_serial(&config, Arc::new(second.clone()), None),
    );

    let outcomes = [left.is_ok(), right.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let err = if left.is_ok() { right.err() } else { left.err() };
    assert!(matches!(err, Some(DispatchError::Duplicate(ref name)) if name == "replicator"));
    assert_eq!(first.opens() + second.opens(), 1);
    assert_eq!(dispatcher.machines().len(), 1);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_attach_releases_the_name() {
    let dispatcher = Dispatcher::new(fast_config());
    let broken = SimSerialDevice::new("a");
    broken.fail_open(Some(LinkError::Closed));
    assert!(matches!(
        dispatcher.attach_serial(&serial("replicator"), Arc::new(broken), None).await,
        Err(DispatchError::Machine(_))
    ));
    dispatcher
        .attach_serial(&serial("replicator"), Arc::new(SimSerialDevice::new("b")), None)
        .await
        .unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_profile_is_a_config_error() {
    let dispatcher = Dispatcher::new(fast_config());
    let mut config = serial("replicator");
    config.profile = "replicator2x".to_string();
    let err = dispatcher
        .attach_serial(&config, Arc::new(SimSerialDevice::new("a")), None)
        .await
        .err().unwrap();
    assert!(matches!(err, DispatchError::Config(_)));
    assert!(dispatcher.machines().is_empty());
}

#[tokio::test]
async fn test_detach_unknown_machine() {
    let dispatcher = Dispatcher::new(fast_config());
    assert!(matches!(
        dispatcher.detach("ghost").await,
        Err(DispatchError::UnknownMachine(ref name)) if name == "ghost"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_detach_disconnects() {
    let dispatcher = Dispatcher::new(fast_config());
    let machine = dispatcher
        .attach_serial(&serial("replicator"), Arc::new(SimSerialDevice::new("a")), None)
        .await
        .unwrap();
    dispatcher.detach("replicator").await.unwrap();
    assert_eq!(machine.state(), MachineState::Disconnected);
    assert!(dispatcher.machine("replicator").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_firmware_job_ends_when_device_returns() {
    let dispatcher = Dispatcher::new(fast_config());
    let device = SimSerialDevice::new("/dev/ttyACM0");
    device.set_serial_number(Some("23C100".to_string()));
    let machine = dispatcher
        .attach_serial(&serial("replicator"), Arc::new(device.clone()), Some(Arc::new(InstantUploader)))
        .await
        .unwrap();

    let job = machine.upload_firmware(Path::new("firmware.hex")).await.unwrap();
    assert_eq!(job.kind(), JobKind::FirmwareUpload);
    assert_eq!(machine.state(), MachineState::Disconnected);
    assert_eq!(job.state(), JobState::Running);
    assert!(dispatcher.firmware_store().get("23C100").is_some());

    // The flashed device comes back as a fresh attachment under the same name.
    let returned = SimSerialDevice::new("/dev/ttyACM1");
    returned.set_serial_number(Some("23C100".to_string()));
    dispatcher
        .attach_serial(&serial("replicator"), Arc::new(returned), None)
        .await
        .unwrap();

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), job.wait_until_stopped()).await.unwrap(),
        Some(Conclusion::Ended)
    );
    assert_eq!(job.result(), Some(json!({ "serial_number": "23C100" })));
    assert!(dispatcher.firmware_store().is_empty());
    assert_eq!(dispatcher.machine("replicator").map(|m| m.state()), Some(MachineState::Idle));
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_unknown_serial_has_no_pending_upload() {
    let dispatcher = Dispatcher::new(fast_config());
    assert_eq!(dispatcher.note_device_returned("NOPE"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jobs_are_shared_across_machines() {
    let dispatcher = Dispatcher::new(fast_config());
    let first = dispatcher
        .attach_serial(&serial("left"), Arc::new(SimSerialDevice::new("a")), None)
        .await
        .unwrap();
    let second = dispatcher
        .attach_serial(&serial("right"), Arc::new(SimSerialDevice::new("b")), None)
        .await
        .unwrap();

    let a = first.home().await.unwrap();
    let b = second.home().await.unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(dispatcher.job(a.id()).map(|j| j.id()), Some(a.id()));
    assert_eq!(dispatcher.jobs().len(), 2);

    assert_eq!(a.get_info().machine_name.as_deref(), Some("left"));
    assert_eq!(b.get_info().machine_name.as_deref(), Some("right"));
    dispatcher.shutdown().await;
}
