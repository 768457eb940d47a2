//! Background worker draining the print buffer into the command executor.

use crate::communication::executor::{Command, CommandExecutor, ExecuteError};
use crate::machine::base::MachineCore;
use crate::print_buffer::{PrintBuffer, Popped};
use dispatch_shared::config::PrintLoopConfig;
use dispatch_shared::device::{ControlCall, Reply};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

/// Cooperative flags shared between machine operations and the print loop.
#[derive(Debug, Default)]
pub struct PrintFlags {
    paused: AtomicBool,
    canceling: AtomicBool,
    printing: AtomicBool,
    downloading: AtomicBool,
    download_canceled: AtomicBool,
}

impl PrintFlags {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    pub fn set_paused(&self, value: bool) {
        self.paused.store(value, Ordering::SeqCst);
    }
    pub fn is_canceling(&self) -> bool {
        self.canceling.load(Ordering::SeqCst)
    }
    pub fn set_canceling(&self, value: bool) {
        self.canceling.store(value, Ordering::SeqCst);
    }
    pub fn is_printing(&self) -> bool {
        self.printing.load(Ordering::SeqCst)
    }
    pub fn set_printing(&self, value: bool) {
        self.printing.store(value, Ordering::SeqCst);
    }
    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }
    pub fn set_downloading(&self, value: bool) {
        self.downloading.store(value, Ordering::SeqCst);
        if value {
            self.download_canceled.store(false, Ordering::SeqCst);
        }
    }
    pub fn cancel_download(&self) {
        self.download_canceled.store(true, Ordering::SeqCst);
    }
    pub fn is_download_canceled(&self) -> bool {
        self.download_canceled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.set_paused(false);
        self.set_canceling(false);
        self.set_printing(false);
        self.set_downloading(false);
    }
}

pub struct PrintLoop {
    core: Arc<MachineCore>,
    executor: Arc<CommandExecutor>,
    buffer: Arc<PrintBuffer>,
    flags: Arc<PrintFlags>,
    settings: PrintLoopConfig,
}

impl PrintLoop {
    pub fn new(
        core: Arc<MachineCore>,
        executor: Arc<CommandExecutor>,
        buffer: Arc<PrintBuffer>,
        flags: Arc<PrintFlags>,
        settings: PrintLoopConfig,
    ) -> Self {
        Self {
            core,
            executor,
            buffer,
            flags,
            settings,
        }
    }

    /// Runs until the connection's stop signal is set or the executor faults.
    pub async fn run(self) {
        let stop = self.executor.stop().clone();
        let mut lines_since_refresh: u64 = 0;
        let mut last_refresh = Instant::now();
        tracing::info!(machine = %self.core.name(), "print loop started");
        while !stop.is_set() {
            if lines_since_refresh >= self.settings.telemetry_line_interval
                || last_refresh.elapsed() >= self.settings.telemetry_interval()
            {
                if let Err(e) = self.executor.refresh_telemetry().await {
                    self.exit(e);
                    return;
                }
                lines_since_refresh = 0;
                last_refresh = Instant::now();
            }

            if self.flags.is_paused() {
                self.flags.set_printing(false);
                stop.sleep(self.settings.pause_step()).await;
                continue;
            }

            match self.buffer.try_pop() {
                Popped::Contended => stop.sleep(self.settings.idle_step()).await,
                Popped::Empty => {
                    if self.flags.is_printing() {
                        match self.executor.call(ControlCall::IsFinished, Reply::into_flag).await {
                            Ok(true) => {
                                self.flags.set_printing(false);
                                tracing::info!(machine = %self.core.name(), "buffer drained and device finished");
                                self.core.poke();
                            }
                            Ok(false) => {}
                            Err(e) => {
                                self.exit(e);
                                return;
                            }
                        }
                    }
                    stop.sleep(self.settings.idle_step()).await;
                }
                Popped::Line(line) => {
                    if self.flags.is_canceling() {
                        tracing::debug!(machine = %self.core.name(), "dropping line during cancel: {}", line.text);
                        continue;
                    }
                    if let Err(e) = self.executor.execute(&Command::line(line.text.as_str())).await {
                        self.exit(e);
                        return;
                    }
                    self.buffer.mark_sent(&line);
                    lines_since_refresh += 1;
                    if let Some(job) = self.core.current_job() {
                        job.try_heartbeat(json!({ "percent": self.buffer.percent() }));
                    }
                }
            }
        }
        tracing::info!(machine = %self.core.name(), "print loop stopped");
    }

    fn exit(&self, error: ExecuteError) {
        match error {
            ExecuteError::Stopped => tracing::info!(machine = %self.core.name(), "print loop stopped"),
            ExecuteError::Fatal(fault) => {
                tracing::error!(machine = %self.core.name(), "print loop exiting on fault: {}", fault)
            }
        }
    }
}
