//! Networked machine: device work runs as numbered processes, and device
//! state is pushed to the host as notifications.
//!
//! Every process the device reports is tracked by a local job. Local pause,
//! unpause and cancel requests on those jobs are forwarded to the device by a
//! job callback, except when the transition itself came from the device.

use super::base::{MachineCore, StopSignal};
use super::push::{NetworkReconciler, ProcessObservation, machine_state, merge_delta};
use super::reconcile::{Reconcile, apply_directives};
use super::{Machine, MachineError};
use crate::jobs::{JobFactory, JobSpec, abandon};
use async_trait::async_trait;
use dispatch_shared::api_models::{FaultCode, MachineFault, MachineInfo, MachineState};
use dispatch_shared::config::NetworkConfig;
use dispatch_shared::device::{
    DeviceState, EepromMap, ErrorClass, NetworkClient, NetworkConnector, NetworkSession, Notification,
    ProcessId, ProcessRequest, ProcessSummary, StateNotification, SystemNotification,
};
use dispatch_shared::job::{CallbackId, Job, JobKind, JobOrigin, JobSignal, JobState};
use dispatch_shared::profile::Profile;
use dispatch_shared::{Axis, Heater};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A local request the device has to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Pause(ProcessId),
    Resume(ProcessId),
    Cancel(ProcessId),
}

struct Tracked {
    job: Arc<Job>,
    summary: ProcessSummary,
    forwarder: CallbackId,
}

struct Session {
    client: Arc<dyn NetworkClient>,
    stop: StopSignal,
    workers: Vec<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

struct NetworkInner {
    core: Arc<MachineCore>,
    connector: Arc<dyn NetworkConnector>,
    jobs: JobFactory,
    settings: NetworkConfig,
    ready: AtomicBool,
    processes: Mutex<HashMap<ProcessId, Tracked>>,
    control_tx: mpsc::UnboundedSender<ControlRequest>,
    control_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ControlRequest>>>,
    serial_number: Mutex<Option<String>>,
    session: Mutex<Option<Session>>,
    connecting: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct NetworkMachine {
    inner: Arc<NetworkInner>,
}

/// Job kind for a device process name.
fn kind_for(name: &str) -> JobKind {
    match name {
        "print" => JobKind::Print,
        "load_filament" => JobKind::LoadFilament,
        "unload_filament" => JobKind::UnloadFilament,
        "preheat" => JobKind::Preheat,
        "calibrate" | "calibration" => JobKind::Calibrate,
        "home" => JobKind::Home,
        "jog" => JobKind::Jog,
        "zip_logs" => JobKind::ZipLogs,
        "firmware_upload" | "upload_firmware" => JobKind::FirmwareUpload,
        _ => JobKind::Other,
    }
}

fn request_name(request: &ProcessRequest) -> &'static str {
    match request {
        ProcessRequest::Print { .. } => "print",
        ProcessRequest::LoadFilament { .. } => "load_filament",
        ProcessRequest::UnloadFilament { .. } => "unload_filament",
        ProcessRequest::Preheat { .. } => "preheat",
        ProcessRequest::ZipLogs { .. } => "zip_logs",
        ProcessRequest::FirmwareUpload { .. } => "firmware_upload",
        ProcessRequest::Calibrate => "calibrate",
        ProcessRequest::Home => "home",
        ProcessRequest::Jog { .. } => "jog",
    }
}

/// Install the callback that turns local pause/unpause/cancel of `job` into
/// device requests for process `id`.
fn forward_controls(job: &Job, id: ProcessId, tx: mpsc::UnboundedSender<ControlRequest>) -> CallbackId {
    job.add_callback(Box::new(move |signal, info| {
        if info.remote {
            return Ok(());
        }
        let request = match signal {
            JobSignal::Paused => ControlRequest::Pause(id),
            JobSignal::Unpaused => ControlRequest::Resume(id),
            JobSignal::Canceled => ControlRequest::Cancel(id),
            _ => return Ok(()),
        };
        tx.send(request).map_err(|e| e.to_string().into())
    }))
}

impl NetworkMachine {
    pub fn new(
        name: impl Into<String>,
        profile: Profile,
        connector: Arc<dyn NetworkConnector>,
        jobs: JobFactory,
        settings: NetworkConfig,
    ) -> Self {
        let core = Arc::new(MachineCore::new(name, profile, jobs.events().clone()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(NetworkInner {
                core,
                connector,
                jobs,
                settings,
                ready: AtomicBool::new(false),
                processes: Mutex::new(HashMap::new()),
                control_tx,
                control_rx: Arc::new(tokio::sync::Mutex::new(control_rx)),
                serial_number: Mutex::new(None),
                session: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn set_serial_number(&self, serial: Option<String>) {
        *self.inner.serial_number.lock() = serial;
    }

    pub fn core(&self) -> &Arc<MachineCore> {
        &self.inner.core
    }

    /// Whether the initial handshake has completed on the live session.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// The job tracking device process `id`, if any.
    pub fn process_job(&self, id: ProcessId) -> Option<Arc<Job>> {
        self.inner.processes.lock().get(&id).map(|tracked| tracked.job.clone())
    }

    pub fn tracked_processes(&self) -> usize {
        self.inner.processes.lock().len()
    }

    fn client(&self) -> Result<Arc<dyn NetworkClient>, MachineError> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(MachineError::NotConnected)
    }

    /// Return the job tracking `summary`, creating it on first sight.
    ///
    /// A new job for a process the device reports as paused starts out
    /// PAUSED (remotely); any other new job starts out PENDING and is driven
    /// from there by reconciliation.
    pub fn discover(&self, summary: &ProcessSummary) -> (Arc<Job>, bool) {
        let mut processes = self.inner.processes.lock();
        if let Some(tracked) = processes.get(&summary.id) {
            return (tracked.job.clone(), false);
        }
        let kind = kind_for(&summary.name);
        let name = if summary.name.is_empty() { "process" } else { summary.name.as_str() };
        let job = self.inner.jobs.create(
            JobSpec::new(name, kind)
                .pausable(kind == JobKind::Print)
                .can_cancel(summary.can_cancel)
                .origin(self.inner.core.origin()),
        );
        job.add_extra_info("process_id", json!(summary.id), false);
        if summary.paused {
            let started = job.start().and_then(|_| job.pause_remotely());
            if let Err(e) = started {
                tracing::warn!(machine = %self.inner.core.name(), job_id = job.id(), "could not mark discovered job paused: {}", e);
            }
        }
        let forwarder = forward_controls(&job, summary.id, self.inner.control_tx.clone());
        processes.insert(
            summary.id,
            Tracked {
                job: job.clone(),
                summary: summary.clone(),
                forwarder,
            },
        );
        tracing::info!(
            machine = %self.inner.core.name(),
            process_id = summary.id,
            job_id = job.id(),
            step = %summary.step,
            "discovered device process"
        );
        (job, true)
    }

    fn track(&self, id: ProcessId, job: &Arc<Job>, summary: ProcessSummary) {
        let forwarder = forward_controls(job, id, self.inner.control_tx.clone());
        self.inner.processes.lock().insert(
            id,
            Tracked {
                job: job.clone(),
                summary,
                forwarder,
            },
        );
    }

    fn untrack(&self, id: ProcessId) -> Option<Arc<Job>> {
        let tracked = self.inner.processes.lock().remove(&id)?;
        tracked.job.remove_callback(tracked.forwarder);
        Some(tracked.job)
    }

    /// Reconcile one tracked process against its job; forget it once the job stops.
    fn reconcile_process(&self, id: ProcessId, device_state: Option<DeviceState>) {
        let core = &self.inner.core;
        let (job, observation) = {
            let processes = self.inner.processes.lock();
            let Some(tracked) = processes.get(&id) else {
                return;
            };
            let observation = ProcessObservation {
                summary: tracked.summary.clone(),
                device_state,
                job_state: tracked.job.state(),
                paused_remotely: tracked.job.paused_remotely(),
            };
            (tracked.job.clone(), observation)
        };
        let reconciliation = NetworkReconciler.reconcile(core.state(), &observation);
        apply_directives(&job, &reconciliation.directives);
        if job.is_stopped() {
            self.untrack(id);
            if core.current_job().is_some_and(|current| current.id() == job.id()) {
                core.set_current_job(None);
            }
        }
        if let Some(state) = reconciliation.next_state {
            core.set_state(state);
        }
    }

    fn apply_temperatures(&self, tools: &[f64]) {
        if tools.is_empty() {
            return;
        }
        let core = &self.inner.core;
        let mut temperatures = core.temperatures();
        for (tool, celsius) in tools.iter().enumerate() {
            if let Some(reading) = temperatures.reading_mut(Heater::Tool(tool as u8)) {
                reading.current = *celsius;
            }
        }
        core.update_temperatures(temperatures);
    }

    /// Apply a full snapshot of the device.
    pub fn apply_system(&self, snapshot: &SystemNotification) {
        let core = &self.inner.core;
        for summary in snapshot.processes() {
            let (_, created) = self.discover(summary);
            if !created {
                if let Some(tracked) = self.inner.processes.lock().get_mut(&summary.id) {
                    tracked.summary = summary.clone();
                }
            }
            self.reconcile_process(summary.id, None);
        }
        let current = snapshot
            .current_process
            .as_ref()
            .and_then(|summary| self.process_job(summary.id));
        if current.is_some() || core.current_job().is_some_and(|job| job.is_stopped()) {
            core.set_current_job(current);
        }
        self.apply_temperatures(&snapshot.tool_temperatures);
        if let Some(state) = machine_state(snapshot.machine_state) {
            core.set_state(state);
        }
    }

    /// Apply a single-object change.
    pub fn apply_delta(&self, delta: &StateNotification) {
        let core = &self.inner.core;
        let Some(id) = delta.process_id else {
            if let Some(state) = delta.machine_state.and_then(machine_state) {
                core.set_state(state);
            }
            return;
        };
        let known = match self.inner.processes.lock().get_mut(&id) {
            Some(tracked) => {
                merge_delta(&mut tracked.summary, delta);
                true
            }
            None => false,
        };
        if known {
            self.reconcile_process(id, delta.machine_state);
        } else {
            tracing::debug!(machine = %core.name(), process_id = id, "delta for untracked process");
            if let Some(state) = delta.machine_state.and_then(machine_state) {
                core.set_state(state);
            }
        }
    }

    async fn authenticate(&self, client: &Arc<dyn NetworkClient>) -> Result<(), MachineError> {
        let core = &self.inner.core;
        let attempts = self.inner.settings.auth_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match client.authenticate().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if error.class() == ErrorClass::Auth {
                tracing::error!(machine = %core.name(), "device refused authorization: {}", error);
                core.set_fault(MachineFault::new(FaultCode::NotAuthorized, error.to_string()));
                return Err(error.into());
            }
            if attempt >= attempts {
                tracing::error!(machine = %core.name(), attempts, "authentication failed: {}", error);
                core.set_fault(MachineFault::new(
                    FaultCode::ConnectFailed,
                    format!("authentication failed after {} attempts: {}", attempts, error),
                ));
                return Err(error.into());
            }
            tracing::warn!(machine = %core.name(), attempt, "authentication attempt failed: {}", error);
            core.stop().sleep(self.inner.settings.retry_delay()).await;
        }
    }

    async fn read_notifications(self, mut notifications: mpsc::UnboundedReceiver<Notification>, stop: StopSignal) {
        let core = self.inner.core.clone();
        loop {
            let notification = tokio::select! {
                n = notifications.recv() => n,
                _ = stop.wait() => break,
            };
            match notification {
                Some(Notification::SystemNotification(snapshot)) => {
                    if !self.is_ready() {
                        tracing::debug!(machine = %core.name(), "ignoring system notification before handshake");
                        continue;
                    }
                    self.apply_system(&snapshot);
                }
                Some(Notification::StateNotification(delta)) => self.apply_delta(&delta),
                None => {
                    if !stop.is_set() {
                        tracing::warn!(machine = %core.name(), "notification stream closed");
                        core.record_fault(MachineFault::new(FaultCode::LinkClosed, "notification stream closed"));
                    }
                    break;
                }
            }
        }
    }

    async fn run_controls(
        core: Arc<MachineCore>,
        client: Arc<dyn NetworkClient>,
        requests: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ControlRequest>>>,
        stop: StopSignal,
    ) {
        let mut requests = tokio::select! {
            guard = requests.lock() => guard,
            _ = stop.wait() => return,
        };
        loop {
            let request = tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = stop.wait() => break,
            };
            let outcome = match request {
                ControlRequest::Pause(id) => client.pause(id).await,
                ControlRequest::Resume(id) => client.resume(id).await,
                ControlRequest::Cancel(id) => client.cancel(id).await,
            };
            match outcome {
                Ok(()) => tracing::debug!(machine = %core.name(), ?request, "forwarded to device"),
                Err(e) => tracing::warn!(machine = %core.name(), ?request, "device rejected request: {}", e),
            }
        }
    }

    /// Tear the session down, stopping every tracked job. Idempotent.
    async fn shutdown(&self) {
        self.end_session(None).await;
    }

    /// Tear down the live session, or only the session `owner` belongs to.
    async fn end_session(&self, owner: Option<&StopSignal>) {
        let session = {
            let mut slot = self.inner.session.lock();
            if slot
                .as_ref()
                .is_some_and(|live| owner.is_none_or(|owner| live.stop.same_session(owner)))
            {
                slot.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            return;
        };
        let core = &self.inner.core;
        self.inner.ready.store(false, Ordering::SeqCst);
        session.stop.request();
        for worker in session.workers {
            worker.abort();
        }
        // The supervisor may be the caller; it exits on its own.
        drop(session.supervisor);
        session.client.close().await;

        let failure = core
            .fault()
            .map(|fault| fault.to_value())
            .unwrap_or_else(|| json!({ "code": "disconnected", "message": "machine disconnected" }));
        let ids: Vec<ProcessId> = self.inner.processes.lock().keys().copied().collect();
        for id in ids {
            if let Some(job) = self.untrack(id) {
                abandon(&job, failure.clone());
            }
        }
        core.set_current_job(None);
        core.set_state(MachineState::Disconnected);
        tracing::info!(machine = %core.name(), "disconnected");
    }

    /// Reserve a process id, track `job` under it, then start the process.
    async fn run_process(
        &self,
        operation: &'static str,
        allowed: &[MachineState],
        request: ProcessRequest,
        job: Option<Arc<Job>>,
    ) -> Result<Arc<Job>, MachineError> {
        let core = &self.inner.core;
        core.require(operation, allowed)?;
        let client = self.client()?;
        let name = request_name(&request);
        let kind = kind_for(name);
        let job = job.unwrap_or_else(|| {
            self.inner
                .jobs
                .create(JobSpec::new(name, kind).pausable(kind == JobKind::Print).origin(core.origin()))
        });
        if kind == JobKind::Print {
            core.claim_operation(&job)?;
        }
        let release = |job: &Arc<Job>| {
            if core.current_job().is_some_and(|current| current.id() == job.id()) {
                core.set_current_job(None);
            }
        };

        let id = match client.reserve_process_id().await {
            Ok(id) => id,
            Err(e) => {
                release(&job);
                return Err(e.into());
            }
        };
        job.add_extra_info("process_id", json!(id), true);
        self.track(id, &job, ProcessSummary::new(id, name, ""));
        if job.state() == JobState::Pending {
            if let Err(e) = job.start() {
                self.untrack(id);
                release(&job);
                return Err(e.into());
            }
        }
        if let Err(e) = client.start_process(id, &request).await {
            tracing::error!(machine = %core.name(), process_id = id, job_id = job.id(), "process start failed: {}", e);
            self.untrack(id);
            abandon(&job, json!({ "code": "start_failed", "message": e.to_string() }));
            release(&job);
            return Err(e.into());
        }
        tracing::info!(machine = %core.name(), process_id = id, job_id = job.id(), operation, "process started");
        Ok(job)
    }

    fn current_job_in(&self, operation: &'static str, job_state: JobState) -> Result<Arc<Job>, MachineError> {
        let core = &self.inner.core;
        core.current_job()
            .filter(|job| job.state() == job_state)
            .ok_or(MachineError::InvalidState {
                state: core.state(),
                operation,
            })
    }
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl Machine for NetworkMachine {
    fn name(&self) -> &str {
        self.inner.core.name()
    }

    fn state(&self) -> MachineState {
        self.inner.core.state()
    }

    fn info(&self) -> MachineInfo {
        self.inner.core.info()
    }

    fn origin(&self) -> Arc<dyn JobOrigin> {
        self.inner.core.origin()
    }

    fn serial_number(&self) -> Option<String> {
        self.inner.serial_number.lock().clone()
    }

    async fn wait_for_state(&self, state: MachineState, timeout: Duration) -> bool {
        self.inner.core.wait_for_state(state, timeout).await
    }

    async fn connect(&self) -> Result<(), MachineError> {
        let _connecting = self.inner.connecting.lock().await;
        let core = &self.inner.core;
        core.require("connect", &[MachineState::Disconnected])?;
        let stop = core.begin_session();
        core.clear_fault();
        self.inner.ready.store(false, Ordering::SeqCst);

        let address = self.inner.connector.address().to_string();
        let NetworkSession { client, notifications } = match self.inner.connector.open().await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(machine = %core.name(), %address, "connect failed: {}", e);
                let mut fault = MachineFault::from_link(&e);
                fault.code = FaultCode::ConnectFailed;
                core.set_fault(fault);
                return Err(e.into());
            }
        };
        core.set_state(MachineState::Unauthenticated);
        if let Err(e) = self.authenticate(&client).await {
            client.close().await;
            core.set_state(MachineState::Disconnected);
            return Err(e);
        }

        core.set_state(MachineState::Pending);
        let reader = tokio::spawn(self.clone().read_notifications(notifications, stop.clone()));
        let snapshot = match client.handshake().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(machine = %core.name(), "handshake failed: {}", e);
                core.set_fault(MachineFault::from_link(&e));
                reader.abort();
                client.close().await;
                core.set_state(MachineState::Disconnected);
                return Err(e.into());
            }
        };
        *self.inner.session.lock() = Some(Session {
            client: client.clone(),
            stop: stop.clone(),
            workers: vec![reader],
            supervisor: None,
        });
        self.inner.ready.store(true, Ordering::SeqCst);
        self.apply_system(&snapshot);
        core.transition_from(&[MachineState::Pending], MachineState::Idle);

        let controls = tokio::spawn(Self::run_controls(
            core.clone(),
            client,
            self.inner.control_rx.clone(),
            stop.clone(),
        ));
        let supervisor = {
            let machine = self.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                stop.wait().await;
                machine.end_session(Some(&stop)).await;
            })
        };
        match self.inner.session.lock().as_mut() {
            Some(session) if session.stop.same_session(&stop) => {
                session.workers.push(controls);
                session.supervisor = Some(supervisor);
            }
            // Torn down while starting up.
            _ => controls.abort(),
        }
        tracing::info!(machine = %core.name(), %address, state = %core.state(), "connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MachineError> {
        self.shutdown().await;
        Ok(())
    }

    async fn print(&self, _lines: Vec<String>, _job: Option<Arc<Job>>) -> Result<Arc<Job>, MachineError> {
        Err(MachineError::Unsupported("streaming lines to a networked machine"))
    }

    async fn print_from_file(&self, path: &Path, job: Option<Arc<Job>>) -> Result<Arc<Job>, MachineError> {
        let request = ProcessRequest::Print {
            path: display_path(path),
        };
        self.run_process("print", &[MachineState::Idle], request, job).await
    }

    async fn pause(&self) -> Result<(), MachineError> {
        self.inner.core.require("pause", &[MachineState::Running])?;
        let job = self.current_job_in("pause", JobState::Running)?;
        job.pause()?;
        self.inner.core.set_state(MachineState::Paused);
        Ok(())
    }

    async fn unpause(&self) -> Result<(), MachineError> {
        self.inner.core.require("unpause", &[MachineState::Paused])?;
        let job = self.current_job_in("unpause", JobState::Paused)?;
        job.unpause()?;
        self.inner.core.set_state(MachineState::Running);
        Ok(())
    }

    async fn cancel(&self) -> Result<(), MachineError> {
        let core = &self.inner.core;
        let state = core.require("cancel", &[MachineState::Running, MachineState::Paused])?;
        let job = core
            .current_job()
            .filter(|job| !job.is_stopped())
            .ok_or(MachineError::InvalidState {
                state,
                operation: "cancel",
            })?;
        job.cancel()?;
        Ok(())
    }

    async fn jog(&self, axis: Axis, distance: f64, feedrate: f64) -> Result<Arc<Job>, MachineError> {
        let request = ProcessRequest::Jog {
            axis,
            distance,
            feedrate,
        };
        self.run_process("jog", &[MachineState::Idle], request, None).await
    }

    async fn home(&self) -> Result<Arc<Job>, MachineError> {
        self.run_process("home", &[MachineState::Idle], ProcessRequest::Home, None).await
    }

    async fn calibrate(&self) -> Result<Arc<Job>, MachineError> {
        self.run_process("calibrate", &[MachineState::Idle], ProcessRequest::Calibrate, None)
            .await
    }

    async fn preheat(&self, temperatures: Vec<f64>) -> Result<Arc<Job>, MachineError> {
        self.run_process("preheat", &[MachineState::Idle], ProcessRequest::Preheat { temperatures }, None)
            .await
    }

    async fn load_filament(&self, tool: u8) -> Result<Arc<Job>, MachineError> {
        self.run_process("load_filament", &[MachineState::Idle], ProcessRequest::LoadFilament { tool }, None)
            .await
    }

    async fn unload_filament(&self, tool: u8) -> Result<Arc<Job>, MachineError> {
        self.run_process(
            "unload_filament",
            &[MachineState::Idle],
            ProcessRequest::UnloadFilament { tool },
            None,
        )
        .await
    }

    async fn read_eeprom(&self) -> Result<EepromMap, MachineError> {
        self.inner.core.require(
            "read_eeprom",
            &[MachineState::Idle, MachineState::Running, MachineState::Paused],
        )?;
        Ok(self.client()?.read_eeprom().await?)
    }

    async fn write_eeprom(&self, values: EepromMap) -> Result<(), MachineError> {
        self.inner.core.require("write_eeprom", &[MachineState::Idle])?;
        Ok(self.client()?.write_eeprom(&values).await?)
    }

    async fn upload_firmware(&self, image: &Path) -> Result<Arc<Job>, MachineError> {
        let request = ProcessRequest::FirmwareUpload {
            path: display_path(image),
        };
        let job = self
            .run_process("upload_firmware", &[MachineState::Idle], request, None)
            .await?;
        job.set_can_cancel(false);
        Ok(job)
    }

    async fn zip_logs(&self, path: &Path) -> Result<Arc<Job>, MachineError> {
        let request = ProcessRequest::ZipLogs {
            path: display_path(path),
        };
        self.run_process(
            "zip_logs",
            &[MachineState::Idle, MachineState::Running, MachineState::Paused],
            request,
            None,
        )
        .await
    }
}
