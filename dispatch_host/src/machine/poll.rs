//! Poll-based reconciliation for the legacy serial family.

use super::base::MachineCore;
use super::reconcile::{JobDirective, Reconcile, Reconciliation, apply_directives};
use crate::communication::executor::{CommandExecutor, ExecuteError};
use crate::print_buffer::PrintBuffer;
use crate::print_loop::PrintFlags;
use dispatch_shared::api_models::MachineState;
use dispatch_shared::device::{BuildState, BuildStatus, ControlCall, Reply};
use dispatch_shared::job::JobState;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// What a raw vendor status means for the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interpretation {
    pub busy: bool,
    pub paused: bool,
    pub running: bool,
}

/// Maps a device family's raw status to [`Interpretation`]. Field semantics
/// are firmware-specific, so each family supplies its own.
pub trait StatusInterpreter: Send + Sync {
    fn interpret(&self, status: &BuildStatus) -> Interpretation;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MotherboardInterpreter;

impl StatusInterpreter for MotherboardInterpreter {
    fn interpret(&self, status: &BuildStatus) -> Interpretation {
        let flags = &status.flags;
        let running = status.build_state == BuildState::Running;
        Interpretation {
            busy: flags.manual_mode
                || flags.onboard_script
                || flags.onboard_process
                || flags.build_cancelling
                || running,
            paused: status.build_state == BuildState::Paused,
            running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobView {
    pub state: JobState,
    pub paused_remotely: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialObservation {
    pub interpretation: Interpretation,
    pub finished: bool,
    pub printing: bool,
    pub paused_locally: bool,
    pub buffer_empty: bool,
    pub job: Option<JobView>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SerialReconciler;

impl Reconcile for SerialReconciler {
    type Observation = SerialObservation;

    fn reconcile(&self, state: MachineState, obs: &SerialObservation) -> Reconciliation {
        let status = obs.interpretation;
        let job_state = obs.job.map(|job| job.state);
        let mut out = Reconciliation::default();
        match state {
            MachineState::Running if status.paused => {
                out.next_state = Some(MachineState::Paused);
                if job_state == Some(JobState::Running) {
                    out.directives.push(JobDirective::PauseRemote);
                }
            }
            // Only undo pauses the device made; a local pause stands.
            MachineState::Paused if status.running => match obs.job {
                Some(job) if job.state == JobState::Paused && job.paused_remotely => {
                    out.next_state = Some(MachineState::Running);
                    out.directives.push(JobDirective::UnpauseRemote);
                }
                None => out.next_state = Some(MachineState::Running),
                Some(_) => {}
            },
            MachineState::Running
                if !status.busy && obs.finished && !obs.printing && !obs.paused_locally && obs.buffer_empty =>
            {
                out.next_state = Some(MachineState::Idle);
                if job_state == Some(JobState::Running) {
                    out.directives.push(JobDirective::End(json!({ "percent": 100 })));
                }
            }
            // Not from PAUSED: a local pause stays in force while the device
            // drains the moves it already accepted.
            MachineState::Idle if status.busy => {
                out.next_state = Some(MachineState::Running);
            }
            _ => {}
        }
        out
    }
}

pub struct Poller {
    core: Arc<MachineCore>,
    executor: Arc<CommandExecutor>,
    interpreter: Arc<dyn StatusInterpreter>,
    buffer: Arc<PrintBuffer>,
    flags: Arc<PrintFlags>,
    interval: Duration,
}

impl Poller {
    pub fn new(
        core: Arc<MachineCore>,
        executor: Arc<CommandExecutor>,
        interpreter: Arc<dyn StatusInterpreter>,
        buffer: Arc<PrintBuffer>,
        flags: Arc<PrintFlags>,
        interval: Duration,
    ) -> Self {
        Self {
            core,
            executor,
            interpreter,
            buffer,
            flags,
            interval,
        }
    }

    /// Poll immediately, then on every interval or poke, until stopped. A
    /// failed poll has already faulted the machine; the loop just exits.
    pub async fn run(self) {
        let stop = self.executor.stop().clone();
        tracing::info!(machine = %self.core.name(), "poller started");
        while !stop.is_set() {
            if let Err(e) = self.poll_once().await {
                if let ExecuteError::Fatal(fault) = e {
                    tracing::error!(machine = %self.core.name(), "poller exiting on fault: {}", fault);
                }
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.core.poked() => {}
                _ = stop.wait() => break,
            }
        }
        tracing::info!(machine = %self.core.name(), "poller stopped");
    }

    pub async fn poll_once(&self) -> Result<(), ExecuteError> {
        let status = self.executor.call(ControlCall::BuildStatus, Reply::into_status).await?;
        self.executor.refresh_telemetry().await?;

        let state = self.core.state();
        // A file still being read counts as printing.
        let printing = self.flags.is_printing() || self.flags.is_downloading();
        let buffer_empty = self.buffer.is_empty().await;
        // Only ask when it can matter; some links block on this query.
        let finished = if state == MachineState::Running && !printing && buffer_empty {
            self.executor.call(ControlCall::IsFinished, Reply::into_flag).await?
        } else {
            false
        };

        let job = self.core.current_job();
        let observation = SerialObservation {
            interpretation: self.interpreter.interpret(&status),
            finished,
            printing,
            paused_locally: self.flags.is_paused(),
            buffer_empty,
            job: job.as_ref().map(|job| JobView {
                state: job.state(),
                paused_remotely: job.paused_remotely(),
            }),
        };
        let reconciliation = SerialReconciler.reconcile(state, &observation);
        if reconciliation.is_noop() {
            return Ok(());
        }
        tracing::debug!(machine = %self.core.name(), ?reconciliation, "poll reconciliation");

        for directive in &reconciliation.directives {
            match directive {
                JobDirective::PauseRemote => self.flags.set_paused(true),
                JobDirective::UnpauseRemote => {
                    self.flags.set_paused(false);
                    self.flags.set_printing(true);
                }
                _ => {}
            }
        }
        if let Some(job) = job {
            apply_directives(&job, &reconciliation.directives);
        }
        if let Some(next) = reconciliation.next_state {
            self.core.transition_from(&[state], next);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_shared::device::MotherboardFlags;

    fn running_job() -> Option<JobView> {
        Some(JobView {
            state: JobState::Running,
            paused_remotely: false,
        })
    }

    #[test]
    fn motherboard_busy_flags() {
        let mut status = BuildStatus::default();
        assert!(!MotherboardInterpreter.interpret(&status).busy);
        status.flags = MotherboardFlags {
            onboard_script: true,
            ..Default::default()
        };
        assert!(MotherboardInterpreter.interpret(&status).busy);
        status.flags = MotherboardFlags::default();
        status.build_state = BuildState::Paused;
        let interpretation = MotherboardInterpreter.interpret(&status);
        assert!(interpretation.paused && !interpretation.busy);
    }

    #[test]
    fn finished_print_goes_idle_and_ends_job() {
        let obs = SerialObservation {
            finished: true,
            buffer_empty: true,
            job: running_job(),
            ..Default::default()
        };
        let r = SerialReconciler.reconcile(MachineState::Running, &obs);
        assert_eq!(r.next_state, Some(MachineState::Idle));
        assert!(matches!(r.directives.as_slice(), [JobDirective::End(_)]));
    }

    #[test]
    fn still_streaming_stays_running() {
        let obs = SerialObservation {
            finished: true,
            printing: true,
            buffer_empty: true,
            job: running_job(),
            ..Default::default()
        };
        assert!(SerialReconciler.reconcile(MachineState::Running, &obs).is_noop());
    }

    #[test]
    fn vendor_pause_is_remote() {
        let obs = SerialObservation {
            interpretation: Interpretation {
                paused: true,
                ..Default::default()
            },
            job: running_job(),
            ..Default::default()
        };
        let r = SerialReconciler.reconcile(MachineState::Running, &obs);
        assert_eq!(r.next_state, Some(MachineState::Paused));
        assert_eq!(r.directives, vec![JobDirective::PauseRemote]);
    }

    #[test]
    fn local_pause_is_not_undone_by_device() {
        let running = Interpretation {
            busy: true,
            running: true,
            ..Default::default()
        };
        let local = SerialObservation {
            interpretation: running,
            job: Some(JobView {
                state: JobState::Paused,
                paused_remotely: false,
            }),
            ..Default::default()
        };
        assert!(SerialReconciler.reconcile(MachineState::Paused, &local).is_noop());

        let remote = SerialObservation {
            job: Some(JobView {
                state: JobState::Paused,
                paused_remotely: true,
            }),
            ..local
        };
        let r = SerialReconciler.reconcile(MachineState::Paused, &remote);
        assert_eq!(r.next_state, Some(MachineState::Running));
        assert_eq!(r.directives, vec![JobDirective::UnpauseRemote]);
    }

    #[test]
    fn busy_forces_running_from_idle_only() {
        let obs = SerialObservation {
            interpretation: Interpretation {
                busy: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            SerialReconciler.reconcile(MachineState::Idle, &obs).next_state,
            Some(MachineState::Running)
        );
        assert!(SerialReconciler.reconcile(MachineState::Paused, &obs).is_noop());
    }
}
