use dispatch_rs::host::jobs::{JobFactory, JobSpec};
use dispatch_rs::host::machine::{Machine, MachineError, NetworkMachine};
use dispatch_rs::shared::api_models::{FaultCode, MachineState};
use dispatch_rs::shared::config::NetworkConfig;
use dispatch_rs::shared::device::{
    DeviceState, EepromMap, LinkError, ProcessFailure, ProcessRequest, ProcessSummary, StateNotification,
    SystemNotification,
};
use dispatch_rs::shared::job::{Conclusion, Job, JobKind, JobState};
use dispatch_rs::shared::job_registry::JobRegistry;
use dispatch_rs::shared::profile::Profile;
use dispatch_rs::simulator::{AuthBehavior, SimCall, SimNetworkDevice};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);
/// Long enough for the control worker to have forwarded anything it was going to.
const SETTLE: Duration = Duration::from_millis(50);

fn factory() -> JobFactory {
    let (events, _) = broadcast::channel(1024);
    JobFactory::new(Arc::new(JobRegistry::new()), events)
}

fn machine_with(device: &SimNetworkDevice, jobs: JobFactory) -> NetworkMachine {
    NetworkMachine::new(
        "birdwing",
        Profile::default(),
        Arc::new(device.clone()),
        jobs,
        NetworkConfig {
            auth_retries: 3,
            request_timeout_ms: 1000,
            retry_delay_ms: 1,
        },
    )
}

async fn connected(device: &SimNetworkDevice) -> NetworkMachine {
    let machine = machine_with(device, factory());
    machine.connect().await.unwrap();
    machine
}

fn pauses(device: &SimNetworkDevice) -> usize {
    device.count_calls(|call| matches!(call, SimCall::Pause(_)))
}

fn resumes(device: &SimNetworkDevice) -> usize {
    device.count_calls(|call| matches!(call, SimCall::Resume(_)))
}

fn cancels(device: &SimNetworkDevice) -> usize {
    device.count_calls(|call| matches!(call, SimCall::Cancel(_)))
}

fn delta(id: u64) -> StateNotification {
    StateNotification {
        process_id: Some(id),
        ..Default::default()
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Start a print and have the device report it running. Returns the job and its process id.
async fn running_print(machine: &NetworkMachine, device: &SimNetworkDevice) -> (Arc<Job>, u64) {
    let job = machine.print_from_file(Path::new("/sd/cube.makerbot"), None).await.unwrap();
    let id = job
        .get_info()
        .extra
        .get("process_id")
        .and_then(|v| v.as_u64())
        .expect("process id recorded on the job");
    assert!(device.push_state(StateNotification {
        machine_state: Some(DeviceState::Running),
        step: Some("printing".to_string()),
        ..delta(id)
    }));
    assert!(machine.wait_for_state(MachineState::Running, WAIT).await);
    (job, id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_authenticates_then_handshakes() {
    let device = SimNetworkDevice::new("10.0.0.8:9999");
    let machine = machine_with(&device, factory());
    assert_eq!(machine.state(), MachineState::Disconnected);
    machine.connect().await.unwrap();
    assert_eq!(machine.state(), MachineState::Idle);
    assert!(machine.is_ready());
    assert_eq!(device.calls(), vec![SimCall::Authenticate, SimCall::Handshake]);

    machine.disconnect().await.unwrap();
    assert_eq!(machine.state(), MachineState::Disconnected);
    assert!(!machine.is_ready());
    assert_eq!(device.calls().last(), Some(&SimCall::Close));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refused_authorization_is_not_retried() {
    let device = SimNetworkDevice::new("printer");
    device.set_auth(AuthBehavior::Refuse);
    let machine = machine_with(&device, factory());
    let err = machine.connect().await.unwrap_err();
    assert!(matches!(err, MachineError::Link(LinkError::NotAuthorized(_))));
    assert_eq!(device.count_calls(|call| *call == SimCall::Authenticate), 1);
    assert_eq!(machine.state(), MachineState::Disconnected);
    assert_eq!(machine.info().fault.map(|f| f.code), Some(FaultCode::NotAuthorized));
    assert_eq!(device.count_calls(|call| *call == SimCall::Handshake), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_auth_failures_are_retried() {
    let device = SimNetworkDevice::new("printer");
    device.set_auth(AuthBehavior::FailTransient(2));
    let machine = connected(&device).await;
    assert_eq!(device.count_calls(|call| *call == SimCall::Authenticate), 3);
    assert_eq!(machine.state(), MachineState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_auth_retries_run_out() {
    let device = SimNetworkDevice::new("printer");
    device.set_auth(AuthBehavior::FailTransient(10));
    let machine = machine_with(&device, factory());
    assert!(machine.connect().await.is_err());
    assert_eq!(device.count_calls(|call| *call == SimCall::Authenticate), 3);
    assert_eq!(machine.info().fault.map(|f| f.code), Some(FaultCode::ConnectFailed));
    assert_eq!(machine.state(), MachineState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handshake_failure_disconnects() {
    let device = SimNetworkDevice::new("printer");
    device.fail_handshake(Some(LinkError::Timeout));
    let machine = machine_with(&device, factory());
    assert!(machine.connect().await.is_err());
    assert_eq!(machine.state(), MachineState::Disconnected);
    assert!(!machine.is_ready());
    assert_eq!(device.calls().last(), Some(&SimCall::Close));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_paused_process_is_discovered_paused_without_echo() {
    let device = SimNetworkDevice::new("printer");
    let mut current = ProcessSummary::new(7, "print", "printing");
    current.paused = true;
    device.set_snapshot(SystemNotification {
        machine_state: DeviceState::Paused,
        current_process: Some(current),
        suspended_processes: Vec::new(),
        tool_temperatures: vec![215.0],
    });
    let machine = connected(&device).await;

    let job = machine.process_job(7).expect("process 7 tracked");
    assert_eq!(job.kind(), JobKind::Print);
    assert_eq!(job.state(), JobState::Paused);
    assert!(job.paused_remotely());
    assert_eq!(job.get_info().extra.get("process_id"), Some(&json!(7)));
    assert_eq!(machine.state(), MachineState::Paused);
    assert_eq!(machine.core().current_job().map(|j| j.id()), Some(job.id()));
    assert_eq!(machine.core().temperatures().tools[0].current, 215.0);

    tokio::time::sleep(SETTLE).await;
    assert_eq!(pauses(&device), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unstarted_process_is_discovered_pending() {
    let device = SimNetworkDevice::new("printer");
    device.set_snapshot(SystemNotification {
        machine_state: DeviceState::Idle,
        current_process: None,
        suspended_processes: vec![ProcessSummary::new(3, "load_filament", "")],
        tool_temperatures: Vec::new(),
    });
    let machine = connected(&device).await;
    let job = machine.process_job(3).expect("process 3 tracked");
    assert_eq!(job.state(), JobState::Pending);
    assert_eq!(job.kind(), JobKind::LoadFilament);
    assert_eq!(machine.state(), MachineState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discovery_is_idempotent() {
    let device = SimNetworkDevice::new("printer");
    let snapshot = SystemNotification {
        machine_state: DeviceState::Running,
        current_process: Some(ProcessSummary::new(9, "print", "printing")),
        suspended_processes: Vec::new(),
        tool_temperatures: Vec::new(),
    };
    device.set_snapshot(snapshot.clone());
    let jobs = factory();
    let machine = machine_with(&device, jobs.clone());
    machine.connect().await.unwrap();
    let job = machine.process_job(9).unwrap();
    assert_eq!(job.state(), JobState::Running);

    assert!(device.push_system(snapshot.clone()));
    assert!(device.push_system(snapshot));
    tokio::time::sleep(SETTLE).await;
    assert_eq!(machine.tracked_processes(), 1);
    assert_eq!(machine.process_job(9).map(|j| j.id()), Some(job.id()));
    assert_eq!(jobs.registry().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_process_in_snapshot_creates_one_job() {
    let device = SimNetworkDevice::new("printer");
    let machine = connected(&device).await;
    assert_eq!(machine.tracked_processes(), 0);

    let snapshot = SystemNotification {
        machine_state: DeviceState::Running,
        current_process: Some(ProcessSummary::new(12, "calibrate", "leveling")),
        suspended_processes: Vec::new(),
        tool_temperatures: Vec::new(),
    };
    assert!(device.push_system(snapshot));
    wait_until(|| machine.tracked_processes() == 1).await;
    let job = machine.process_job(12).unwrap();
    assert_eq!(job.kind(), JobKind::Calibrate);
    assert_eq!(job.state(), JobState::Running);
    assert!(machine.wait_for_state(MachineState::Running, WAIT).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_print_runs_as_device_process() {
    let device = SimNetworkDevice::new("printer");
    let machine = connected(&device).await;
    let (job, id) = running_print(&machine, &device).await;
    assert_eq!(id, 1);
    assert!(device.calls().contains(&SimCall::StartProcess(
        1,
        ProcessRequest::Print {
            path: "/sd/cube.makerbot".to_string()
        }
    )));

    assert!(device.push_state(StateNotification {
        progress: Some(42),
        ..delta(id)
    }));
    wait_until(|| job.progress().is_some()).await;
    assert_eq!(job.progress(), Some(json!({ "percent": 42, "step": "printing" })));

    assert!(device.push_state(StateNotification {
        step: Some("done".to_string()),
        machine_state: Some(DeviceState::Idle),
        ..delta(id)
    }));
    assert!(machine.wait_for_state(MachineState::Idle, WAIT).await);
    assert_eq!(job.conclusion(), Some(Conclusion::Ended));
    assert_eq!(machine.tracked_processes(), 0);
    assert!(machine.core().current_job().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_pause_forwards_exactly_one_request() {
    let device = SimNetworkDevice::new("printer");
    let machine = connected(&device).await;
    let (job, id) = running_print(&machine, &device).await;

    machine.pause().await.unwrap();
    assert_eq!(job.state(), JobState::Paused);
    assert!(!job.paused_remotely());
    assert_eq!(machine.state(), MachineState::Paused);
    wait_until(|| pauses(&device) == 1).await;
    assert!(device.calls().contains(&SimCall::Pause(id)));

    // The device confirming the pause must not be echoed back.
    assert!(device.push_state(StateNotification {
        paused: Some(true),
        machine_state: Some(DeviceState::Paused),
        ..delta(id)
    }));
    tokio::time::sleep(SETTLE).await;
    assert_eq!(pauses(&device), 1);
    assert_eq!(job.state(), JobState::Paused);

    machine.unpause().await.unwrap();
    wait_until(|| resumes(&device) == 1).await;
    assert_eq!(job.state(), JobState::Running);

    machine.cancel().await.unwrap();
    wait_until(|| cancels(&device) == 1).await;
    assert_eq!(job.conclusion(), Some(Conclusion::Canceled));
    assert!(!job.canceled_remotely());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_pause_and_cancel_are_not_forwarded() {
    let device = SimNetworkDevice::new("printer");
    let machine = connected(&device).await;
    let (job, id) = running_print(&machine, &device).await;

    assert!(device.push_state(StateNotification {
        paused: Some(true),
        machine_state: Some(DeviceState::Paused),
        ..delta(id)
    }));
    assert!(machine.wait_for_state(MachineState::Paused, WAIT).await);
    assert_eq!(job.state(), JobState::Paused);
    assert!(job.paused_remotely());

    assert!(device.push_state(StateNotification {
        paused: Some(false),
        machine_state: Some(DeviceState::Running),
        ..delta(id)
    }));
    assert!(machine.wait_for_state(MachineState::Running, WAIT).await);
    assert_eq!(job.state(), JobState::Running);

    assert!(device.push_state(StateNotification {
        step: Some("cancelled".to_string()),
        machine_state: Some(DeviceState::Idle),
        ..delta(id)
    }));
    assert!(machine.wait_for_state(MachineState::Idle, WAIT).await);
    assert_eq!(job.conclusion(), Some(Conclusion::Canceled));
    assert!(job.canceled_remotely());

    tokio::time::sleep(SETTLE).await;
    assert_eq!(pauses(&device), 0);
    assert_eq!(resumes(&device), 0);
    assert_eq!(cancels(&device), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_device_error_fails_job() {
    let device = SimNetworkDevice::new("printer");
    let machine = connected(&device).await;
    let (job, id) = running_print(&machine, &device).await;
    assert!(device.push_state(StateNotification {
        error: Some(ProcessFailure {
            code: 1041,
            message: "filament jam".to_string(),
        }),
        machine_state: Some(DeviceState::Idle),
        ..delta(id)
    }));
    assert_eq!(
        tokio::time::timeout(WAIT, job.wait_until_stopped()).await.unwrap(),
        Some(Conclusion::Failed)
    );
    assert_eq!(job.failure(), Some(json!({ "code": 1041, "message": "filament jam" })));
    assert_eq!(cancels(&device), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_requires_a_running_print() {
    let device = SimNetworkDevice::new("printer");
    let machine = connected(&device).await;
    assert!(matches!(
        machine.pause().await,
        Err(MachineError::InvalidState { state: MachineState::Idle, .. })
    ));
    assert!(machine.cancel().await.is_err());
    assert!(matches!(machine.print(vec!["G28".to_string()], None).await, Err(MachineError::Unsupported(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_session_fails_tracked_jobs() {
    let device = SimNetworkDevice::new("printer");
    let machine = connected(&device).await;
    let (job, _) = running_print(&machine, &device).await;

    device.drop_session();
    assert!(machine.wait_for_state(MachineState::Disconnected, WAIT).await);
    assert_eq!(job.conclusion(), Some(Conclusion::Failed));
    assert_eq!(job.failure().map(|f| f["code"].clone()), Some(json!("link_closed")));
    assert_eq!(machine.info().fault.map(|f| f.code), Some(FaultCode::LinkClosed));
    assert_eq!(machine.tracked_processes(), 0);
    // Failing the job locally must not reach out to the device.
    assert_eq!(cancels(&device), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_does_not_cancel_device_processes() {
    let device = SimNetworkDevice::new("printer");
    device.set_snapshot(SystemNotification {
        machine_state: DeviceState::Idle,
        current_process: None,
        suspended_processes: vec![ProcessSummary::new(3, "print", "")],
        tool_temperatures: Vec::new(),
    });
    let machine = connected(&device).await;
    let job = machine.process_job(3).unwrap();
    assert_eq!(job.state(), JobState::Pending);

    machine.disconnect().await.unwrap();
    assert_eq!(job.conclusion(), Some(Conclusion::Canceled));
    tokio::time::sleep(SETTLE).await;
    assert_eq!(cancels(&device), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_failure_fails_job() {
    let device = SimNetworkDevice::new("printer");
    device.fail_start(Some(LinkError::Device {
        code: 500,
        message: "no such file".to_string(),
    }));
    let jobs = factory();
    let machine = machine_with(&device, jobs.clone());
    machine.connect().await.unwrap();

    let job = jobs.create(JobSpec::new("cube", JobKind::Print).pausable(true));
    let err = machine
        .print_from_file(Path::new("/sd/missing.makerbot"), Some(job.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, MachineError::Link(LinkError::Device { code: 500, .. })));
    assert_eq!(job.conclusion(), Some(Conclusion::Failed));
    assert_eq!(job.failure().map(|f| f["code"].clone()), Some(json!("start_failed")));
    assert_eq!(machine.tracked_processes(), 0);
    assert!(machine.core().current_job().is_none());
    assert_eq!(machine.state(), MachineState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operations_become_processes() {
    let device = SimNetworkDevice::new("printer");
    let machine = connected(&device).await;

    let home = machine.home().await.unwrap();
    assert_eq!(home.kind(), JobKind::Home);
    assert_eq!(home.state(), JobState::Running);

    let firmware = machine.upload_firmware(Path::new("/tmp/fw.zip")).await.unwrap();
    assert_eq!(firmware.kind(), JobKind::FirmwareUpload);
    assert!(!firmware.get_info().can_cancel);

    let logs = machine.zip_logs(Path::new("/tmp/logs.zip")).await.unwrap();
    assert_eq!(logs.kind(), JobKind::ZipLogs);

    let starts: Vec<ProcessRequest> = device
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            SimCall::StartProcess(_, request) => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(
        starts,
        vec![
            ProcessRequest::Home,
            ProcessRequest::FirmwareUpload {
                path: "/tmp/fw.zip".to_string()
            },
            ProcessRequest::ZipLogs {
                path: "/tmp/logs.zip".to_string()
            },
        ]
    );
    assert_eq!(machine.tracked_processes(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_eeprom_goes_through_the_client() {
    let device = SimNetworkDevice::new("printer");
    let machine = connected(&device).await;
    let mut values = EepromMap::new();
    values.insert("z_offset".to_string(), json!(-0.25));
    machine.write_eeprom(values.clone()).await.unwrap();
    assert_eq!(machine.read_eeprom().await.unwrap(), values);
    assert!(device.calls().contains(&SimCall::WriteEeprom));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_keeps_the_new_session_alive() {
    let device = SimNetworkDevice::new("10.0.0.8:9999");
    let machine = connected(&device).await;
    for _ in 0..20 {
        machine.disconnect().await.unwrap();
        machine.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tokio::time::sleep(SETTLE * 2).await;

    assert_eq!(machine.state(), MachineState::Idle);
    assert!(machine.is_ready());
    assert!(machine.core().fault().is_none());

    // The new session's control worker owns the request queue.
    let (job, id) = running_print(&machine, &device).await;
    machine.pause().await.unwrap();
    wait_until(|| pauses(&device) == 1).await;
    tokio::time::sleep(SETTLE).await;
    assert_eq!(pauses(&device), 1);
    assert!(device.calls().contains(&SimCall::Pause(id)));
    assert_eq!(job.state(), JobState::Paused);
}
