//! Legacy serial machine: one command at a time over a [`SerialLink`], with
//! state reconciled by polling.

use super::base::{MachineCore, StopSignal};
use super::poll::{MotherboardInterpreter, Poller, StatusInterpreter};
use super::{Machine, MachineError};
use crate::communication::executor::{Command, CommandExecutor};
use crate::firmware::{FirmwareUploadStore, FirmwareUploader};
use crate::jobs::{JobFactory, JobSpec, abandon};
use crate::print_buffer::PrintBuffer;
use crate::print_loop::{PrintFlags, PrintLoop};
use async_trait::async_trait;
use dispatch_shared::api_models::{FaultCode, MachineFault, MachineInfo, MachineState};
use dispatch_shared::config::{CancelConfig, Config, ExecutorConfig, PauseConfig, PollerConfig, PrintLoopConfig};
use dispatch_shared::device::{ControlCall, EepromMap, Reply, SerialConnector};
use dispatch_shared::gcode_utils::{fmt_coord, strip_comment};
use dispatch_shared::job::{Job, JobKind, JobOrigin, JobState};
use dispatch_shared::profile::Profile;
use dispatch_shared::{Axis, Position};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

/// Lines injected at the front of the buffer by a local pause.
const PAUSE_BLOCK_LEN: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct SerialSettings {
    pub executor: ExecutorConfig,
    pub print_loop: PrintLoopConfig,
    pub poller: PollerConfig,
    pub pause: PauseConfig,
    pub cancel: CancelConfig,
}

impl From<&Config> for SerialSettings {
    fn from(config: &Config) -> Self {
        Self {
            executor: config.executor.clone(),
            print_loop: config.print_loop.clone(),
            poller: config.poller.clone(),
            pause: config.pause.clone(),
            cancel: config.cancel.clone(),
        }
    }
}

/// Retract then lift, both absolute, from the position read at pause time.
pub fn pause_block(position: &Position, profile: &Profile, pause: &PauseConfig) -> Vec<String> {
    let lifted = profile.clamp_z(position.z + pause.lift_height);
    vec![
        format!(
            "G1 E{} F{}",
            fmt_coord(position.e - pause.retract_length),
            fmt_coord(pause.extrude_feedrate)
        ),
        format!("G1 Z{} F{}", fmt_coord(lifted), fmt_coord(pause.travel_feedrate)),
    ]
}

/// Travel back over the print, lower to the original height, restore filament.
pub fn restore_block(position: &Position, pause: &PauseConfig) -> Vec<String> {
    vec![
        format!(
            "G1 X{} Y{} F{}",
            fmt_coord(position.x),
            fmt_coord(position.y),
            fmt_coord(pause.travel_feedrate)
        ),
        format!("G1 Z{} F{}", fmt_coord(position.z), fmt_coord(pause.travel_feedrate)),
        format!("G1 E{} F{}", fmt_coord(position.e), fmt_coord(pause.extrude_feedrate)),
    ]
}

/// One live connection: its executor, its stop signal and the workers bound to it.
struct Session {
    executor: Arc<CommandExecutor>,
    stop: StopSignal,
    workers: Vec<JoinHandle<()>>,
    supervisor: JoinHandle<()>,
}

impl Session {
    /// Stop the workers. The supervisor is left to exit on its own; it may be
    /// the task running this.
    fn stop(self) {
        self.stop.request();
        for worker in self.workers {
            worker.abort();
        }
        drop(self.supervisor);
    }
}

struct SerialInner {
    core: Arc<MachineCore>,
    connector: Arc<dyn SerialConnector>,
    jobs: JobFactory,
    firmware: Arc<FirmwareUploadStore>,
    uploader: Option<Arc<dyn FirmwareUploader>>,
    interpreter: Arc<dyn StatusInterpreter>,
    settings: SerialSettings,
    buffer: Arc<PrintBuffer>,
    flags: Arc<PrintFlags>,
    serial_number: Mutex<Option<String>>,
    pause_position: Mutex<Option<Position>>,
    session: Mutex<Option<Session>>,
    connecting: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct SerialMachine {
    inner: Arc<SerialInner>,
}

pub struct SerialMachineBuilder {
    name: String,
    profile: Profile,
    connector: Arc<dyn SerialConnector>,
    jobs: JobFactory,
    firmware: Arc<FirmwareUploadStore>,
    uploader: Option<Arc<dyn FirmwareUploader>>,
    interpreter: Arc<dyn StatusInterpreter>,
    settings: SerialSettings,
    serial_number: Option<String>,
}

impl SerialMachineBuilder {
    pub fn settings(mut self, settings: SerialSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn firmware_store(mut self, firmware: Arc<FirmwareUploadStore>) -> Self {
        self.firmware = firmware;
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn FirmwareUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn interpreter(mut self, interpreter: Arc<dyn StatusInterpreter>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn serial_number(mut self, serial: Option<String>) -> Self {
        self.serial_number = serial;
        self
    }

    pub fn build(self) -> SerialMachine {
        let core = Arc::new(MachineCore::new(self.name, self.profile, self.jobs.events().clone()));
        SerialMachine {
            inner: Arc::new(SerialInner {
                core,
                connector: self.connector,
                jobs: self.jobs,
                firmware: self.firmware,
                uploader: self.uploader,
                interpreter: self.interpreter,
                settings: self.settings,
                buffer: Arc::new(PrintBuffer::new()),
                flags: Arc::new(PrintFlags::default()),
                serial_number: Mutex::new(self.serial_number),
                pause_position: Mutex::new(None),
                session: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

impl SerialMachine {
    pub fn builder(
        name: impl Into<String>,
        profile: Profile,
        connector: Arc<dyn SerialConnector>,
        jobs: JobFactory,
    ) -> SerialMachineBuilder {
        SerialMachineBuilder {
            name: name.into(),
            profile,
            connector,
            jobs,
            firmware: Arc::new(FirmwareUploadStore::new()),
            uploader: None,
            interpreter: Arc::new(MotherboardInterpreter),
            settings: SerialSettings::default(),
            serial_number: None,
        }
    }

    pub fn core(&self) -> &Arc<MachineCore> {
        &self.inner.core
    }

    pub fn buffer(&self) -> &Arc<PrintBuffer> {
        &self.inner.buffer
    }

    pub fn flags(&self) -> &Arc<PrintFlags> {
        &self.inner.flags
    }

    /// The live connection's executor.
    pub fn executor(&self) -> Result<Arc<CommandExecutor>, MachineError> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|session| session.executor.clone())
            .ok_or(MachineError::NotConnected)
    }

    /// Tear the connection down. Safe to call from any task, any number of times.
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
        session.stop();
        self.inner.flags.reset();
        let dropped = self.inner.buffer.clear().await;
        if dropped > 0 {
            tracing::warn!(machine = %core.name(), dropped, "discarded buffered lines on disconnect");
        }
        *self.inner.pause_position.lock() = None;

        if let Some(job) = core.take_current_job() {
            let failure = core
                .fault()
                .map(|fault| fault.to_value())
                .unwrap_or_else(|| json!({ "code": "disconnected", "message": "machine disconnected" }));
            abandon(&job, failure);
        }
        core.set_state(MachineState::Disconnected);
        tracing::info!(machine = %core.name(), "disconnected");
    }

    async fn start_stream(&self, job: &Arc<Job>, lines: Vec<String>) -> Result<(), MachineError> {
        let flags = &self.inner.flags;
        flags.set_canceling(false);
        flags.set_paused(false);
        *self.inner.pause_position.lock() = None;
        let count = lines.len();
        self.inner.buffer.load(lines).await;
        flags.set_printing(true);
        if job.state() == JobState::Pending {
            job.start()?;
        }
        self.inner.core.set_state(MachineState::Running);
        tracing::info!(machine = %self.inner.core.name(), job_id = job.id(), lines = count, "print started");
        Ok(())
    }

    fn print_job(&self, job: Option<Arc<Job>>, name: &str) -> Arc<Job> {
        job.unwrap_or_else(|| {
            self.inner
                .jobs
                .create(JobSpec::new(name, JobKind::Print).pausable(true).origin(self.inner.core.origin()))
        })
    }

    /// Run a short command sequence as its own job in the background.
    async fn run_script(
        &self,
        operation: &'static str,
        kind: JobKind,
        lines: Vec<String>,
    ) -> Result<Arc<Job>, MachineError> {
        self.inner.core.require(operation, &[MachineState::Idle])?;
        let executor = self.executor()?;
        let job = self
            .inner
            .jobs
            .create(JobSpec::new(operation, kind).origin(self.inner.core.origin()));
        job.start()?;
        let task_job = job.clone();
        tokio::spawn(async move {
            for line in lines {
                if task_job.is_stopped() {
                    return;
                }
                if let Err(e) = executor.execute(&Command::Line(line)).await {
                    abandon(&task_job, json!({ "message": e.to_string() }));
                    return;
                }
            }
            let _ = task_job.end(Value::Bool(true));
        });
        Ok(job)
    }
}

#[async_trait]
impl Machine for SerialMachine {
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

        let link = match self.inner.connector.open().await {
            Ok(link) => link,
            Err(e) => {
                tracing::error!(machine = %core.name(), port = self.inner.connector.port(), "connect failed: {}", e);
                let mut fault = MachineFault::from_link(&e);
                fault.code = FaultCode::ConnectFailed;
                core.set_fault(fault);
                return Err(e.into());
            }
        };
        if self.serial_number().is_none() {
            // Identification is best effort; not every firmware answers.
            if let Ok(serial) = link.control(&ControlCall::SerialNumber).await.and_then(Reply::into_text) {
                *self.inner.serial_number.lock() = Some(serial);
            }
        }

        let settings = &self.inner.settings;
        let executor = Arc::new(CommandExecutor::new(link, core.clone(), settings.executor.clone()));
        self.inner.flags.reset();
        self.inner.buffer.clear().await;

        let print_loop = PrintLoop::new(
            core.clone(),
            executor.clone(),
            self.inner.buffer.clone(),
            self.inner.flags.clone(),
            settings.print_loop.clone(),
        );
        let poller = Poller::new(
            core.clone(),
            executor.clone(),
            self.inner.interpreter.clone(),
            self.inner.buffer.clone(),
            self.inner.flags.clone(),
            settings.poller.interval(),
        );
        let supervisor = {
            let machine = self.clone();
            let stop = stop.clone();
            async move {
                stop.wait().await;
                machine.end_session(Some(&stop)).await;
            }
        };

        core.set_state(MachineState::Idle);
        let workers = vec![tokio::spawn(print_loop.run()), tokio::spawn(poller.run())];
        *self.inner.session.lock() = Some(Session {
            executor,
            stop,
            workers,
            supervisor: tokio::spawn(supervisor),
        });
        tracing::info!(machine = %core.name(), port = self.inner.connector.port(), "connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MachineError> {
        self.shutdown().await;
        Ok(())
    }

    async fn print(&self, lines: Vec<String>, job: Option<Arc<Job>>) -> Result<Arc<Job>, MachineError> {
        let core = &self.inner.core;
        core.require("print", &[MachineState::Idle])?;
        self.executor()?;
        let job = self.print_job(job, "print");
        core.claim_operation(&job)?;
        if let Err(e) = self.start_stream(&job, lines).await {
            core.set_current_job(None);
            return Err(e);
        }
        Ok(job)
    }

    async fn print_from_file(&self, path: &Path, job: Option<Arc<Job>>) -> Result<Arc<Job>, MachineError> {
        let core = &self.inner.core;
        let flags = &self.inner.flags;
        core.require("print", &[MachineState::Idle])?;
        self.executor()?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "print".to_string());
        let job = self.print_job(job, &name);
        core.claim_operation(&job)?;
        if job.state() == JobState::Pending {
            job.start()?;
        }
        core.set_state(MachineState::Running);

        flags.set_downloading(true);
        let mut lines = Vec::new();
        let read = async {
            let file = tokio::fs::File::open(path).await?;
            let mut reader = BufReader::new(file).lines();
            while let Some(line) = reader.next_line().await? {
                if flags.is_download_canceled() {
                    return Ok::<bool, std::io::Error>(false);
                }
                if !strip_comment(&line).is_empty() {
                    lines.push(line);
                }
            }
            Ok(true)
        }
        .await;
        flags.set_downloading(false);

        match read {
            Ok(true) => {
                self.start_stream(&job, lines).await?;
                Ok(job)
            }
            Ok(false) => {
                tracing::info!(machine = %core.name(), job_id = job.id(), "download canceled");
                let _ = job.cancel();
                core.set_current_job(None);
                core.transition_from(&[MachineState::Running], MachineState::Idle);
                Ok(job)
            }
            Err(e) => {
                abandon(&job, json!({ "message": e.to_string() }));
                core.set_current_job(None);
                core.transition_from(&[MachineState::Running], MachineState::Idle);
                Err(e.into())
            }
        }
    }

    async fn pause(&self) -> Result<(), MachineError> {
        let core = &self.inner.core;
        let flags = &self.inner.flags;
        let state = core.require("pause", &[MachineState::Running])?;
        if !flags.is_printing() || flags.is_paused() || flags.is_canceling() {
            return Err(MachineError::InvalidState { state, operation: "pause" });
        }
        let job = core
            .current_job()
            .ok_or(MachineError::InvalidState { state, operation: "pause" })?;
        let executor = self.executor()?;

        flags.set_paused(true);
        let position = executor.call(ControlCall::Position, Reply::into_position).await?;
        let block = pause_block(&position, core.profile(), &self.inner.settings.pause);
        let lift = block[PAUSE_BLOCK_LEN - 1].clone();
        self.inner.buffer.push_front(block).await;
        executor.execute(&Command::Line(lift)).await?;
        *self.inner.pause_position.lock() = Some(position);

        job.pause()?;
        core.set_state(MachineState::Paused);
        tracing::info!(machine = %core.name(), job_id = job.id(), ?position, "paused");
        Ok(())
    }

    async fn unpause(&self) -> Result<(), MachineError> {
        let core = &self.inner.core;
        let flags = &self.inner.flags;
        let state = core.require("unpause", &[MachineState::Paused])?;
        if !flags.is_paused() {
            return Err(MachineError::InvalidState { state, operation: "unpause" });
        }
        let position = self.inner.pause_position.lock().take();
        if let Some(position) = position {
            let restore = restore_block(&position, &self.inner.settings.pause);
            self.inner.buffer.insert_at(PAUSE_BLOCK_LEN, restore).await;
        }
        flags.set_paused(false);
        flags.set_printing(true);
        if let Some(job) = core.current_job().filter(|job| job.state() == JobState::Paused) {
            job.unpause()?;
        }
        core.set_state(MachineState::Running);
        tracing::info!(machine = %core.name(), "unpaused");
        Ok(())
    }

    async fn cancel(&self) -> Result<(), MachineError> {
        let core = &self.inner.core;
        let flags = &self.inner.flags;
        core.require("cancel", &[MachineState::Running, MachineState::Paused])?;
        if flags.is_downloading() {
            flags.cancel_download();
            return Ok(());
        }
        let executor = self.executor()?;
        let dropped = self.inner.buffer.clear().await;
        flags.set_paused(false);
        flags.set_canceling(true);
        executor.stop().sleep(self.inner.settings.cancel.settle()).await;
        executor.execute(&Command::Control(ControlCall::Abort)).await?;
        flags.set_printing(false);
        *self.inner.pause_position.lock() = None;

        if let Some(job) = core.take_current_job() {
            if !job.is_stopped() {
                job.cancel()?;
            }
        }
        core.set_state(MachineState::Idle);
        tracing::info!(machine = %core.name(), dropped, "print canceled");
        Ok(())
    }

    async fn jog(&self, axis: Axis, distance: f64, feedrate: f64) -> Result<Arc<Job>, MachineError> {
        let lines = vec![
            "G91".to_string(),
            format!("G1 {}{} F{}", axis.letter(), fmt_coord(distance), fmt_coord(feedrate)),
            "G90".to_string(),
        ];
        self.run_script("jog", JobKind::Jog, lines).await
    }

    async fn home(&self) -> Result<Arc<Job>, MachineError> {
        self.run_script("home", JobKind::Home, vec!["G28".to_string()]).await
    }

    async fn calibrate(&self) -> Result<Arc<Job>, MachineError> {
        self.run_script("calibrate", JobKind::Calibrate, vec!["G28".to_string(), "G29".to_string()])
            .await
    }

    async fn preheat(&self, temperatures: Vec<f64>) -> Result<Arc<Job>, MachineError> {
        let profile = self.inner.core.profile();
        let tools = profile.tool_count as usize;
        let mut lines: Vec<String> = temperatures
            .iter()
            .take(tools)
            .enumerate()
            .map(|(tool, celsius)| format!("M104 T{} S{}", tool, fmt_coord(*celsius)))
            .collect();
        if profile.heated_platform {
            if let Some(platform) = temperatures.get(tools) {
                lines.push(format!("M140 S{}", fmt_coord(*platform)));
            }
        }
        self.run_script("preheat", JobKind::Preheat, lines).await
    }

    async fn load_filament(&self, tool: u8) -> Result<Arc<Job>, MachineError> {
        let lines = vec![
            format!("T{}", tool),
            "M83".to_string(),
            "G1 E100 F300".to_string(),
            "M82".to_string(),
        ];
        self.run_script("load_filament", JobKind::LoadFilament, lines).await
    }

    async fn unload_filament(&self, tool: u8) -> Result<Arc<Job>, MachineError> {
        let lines = vec![
            format!("T{}", tool),
            "M83".to_string(),
            "G1 E-100 F1200".to_string(),
            "M82".to_string(),
        ];
        self.run_script("unload_filament", JobKind::UnloadFilament, lines).await
    }

    async fn read_eeprom(&self) -> Result<EepromMap, MachineError> {
        let executor = self.executor()?;
        Ok(executor.call(ControlCall::ReadEeprom, Reply::into_eeprom).await?)
    }

    async fn write_eeprom(&self, values: EepromMap) -> Result<(), MachineError> {
        self.inner.core.require("write_eeprom", &[MachineState::Idle])?;
        let executor = self.executor()?;
        executor.execute(&Command::Control(ControlCall::WriteEeprom(values))).await?;
        Ok(())
    }

    async fn upload_firmware(&self, image: &Path) -> Result<Arc<Job>, MachineError> {
        let uploader = self
            .inner
            .uploader
            .clone()
            .ok_or(MachineError::Unsupported("upload_firmware"))?;
        let core = &self.inner.core;
        core.require("upload_firmware", &[MachineState::Idle, MachineState::Disconnected])?;
        let serial = self
            .serial_number()
            .ok_or(MachineError::Unsupported("firmware upload without a device serial number"))?;

        let job = self.inner.jobs.create(
            JobSpec::new("upload_firmware", JobKind::FirmwareUpload)
                .can_cancel(false)
                .origin(core.origin()),
        );
        job.start()?;
        self.inner.firmware.insert(serial.clone(), job.clone());
        // The device reboots into its bootloader; drop our side first.
        self.shutdown().await;

        let port = self.inner.connector.port().to_string();
        let image = image.to_path_buf();
        let store = self.inner.firmware.clone();
        let task_job = job.clone();
        tokio::spawn(async move {
            match uploader.upload(&port, &image).await {
                Ok(()) => {
                    tracing::info!(port = %port, job_id = task_job.id(), "firmware written, waiting for device to return");
                }
                Err(e) => {
                    tracing::error!(port = %port, job_id = task_job.id(), "firmware upload failed: {}", e);
                    store.remove(&serial);
                    abandon(&task_job, json!({ "message": e.to_string() }));
                }
            }
        });
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_block_lifts_and_clamps() {
        let pause = PauseConfig::default();
        let profile = Profile::default();
        let block = pause_block(&Position::new(10.0, 20.0, 30.0, 5.0), &profile, &pause);
        assert_eq!(block, vec!["G1 E4 F1800".to_string(), "G1 Z35 F3000".to_string()]);

        let high = pause_block(&Position::new(0.0, 0.0, 153.0, 0.0), &profile, &pause);
        assert_eq!(high[1], "G1 Z155 F3000");
    }

    #[test]
    fn restore_block_returns_to_original_position() {
        let block = restore_block(&Position::new(10.0, 20.0, 30.0, 5.0), &PauseConfig::default());
        assert_eq!(
            block,
            vec![
                "G1 X10 Y20 F3000".to_string(),
                "G1 Z30 F3000".to_string(),
                "G1 E5 F1800".to_string(),
            ]
        );
    }
}
