//! Push-based reconciliation for networked machines.
//!
//! Each notified process is classified by its step, then compared with the
//! state of the local job tracking it.

use super::reconcile::{JobDirective, Reconcile, Reconciliation};
use dispatch_shared::api_models::MachineState;
use dispatch_shared::device::{DeviceState, ProcessSummary, StateNotification};
use dispatch_shared::job::JobState;
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepClass {
    Pending,
    Active,
    Done,
    Failed,
    Canceled,
}

pub fn classify(summary: &ProcessSummary) -> StepClass {
    if summary.error.is_some() || summary.step == "failed" {
        return StepClass::Failed;
    }
    if summary.cancelled || summary.step == "cancelled" || summary.step == "canceled" {
        return StepClass::Canceled;
    }
    if summary.complete || summary.step == "done" || summary.step == "completed" {
        return StepClass::Done;
    }
    match summary.step.as_str() {
        "" | "initializing" | "queued" => StepClass::Pending,
        _ => StepClass::Active,
    }
}

pub fn machine_state(state: DeviceState) -> Option<MachineState> {
    match state {
        DeviceState::Idle => Some(MachineState::Idle),
        DeviceState::Running => Some(MachineState::Running),
        DeviceState::Paused => Some(MachineState::Paused),
        DeviceState::Unknown => None,
    }
}

/// Fold a delta into the last full summary of the same process.
pub fn merge_delta(summary: &mut ProcessSummary, delta: &StateNotification) {
    if let Some(step) = &delta.step {
        summary.step = step.clone();
    }
    if let Some(paused) = delta.paused {
        summary.paused = paused;
    }
    if let Some(progress) = delta.progress {
        summary.progress = Some(progress);
    }
    if let Some(error) = &delta.error {
        summary.error = Some(error.clone());
    }
}

/// One process as seen by the device, next to the job tracking it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessObservation {
    pub summary: ProcessSummary,
    pub device_state: Option<DeviceState>,
    pub job_state: JobState,
    pub paused_remotely: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkReconciler;

fn failure_payload(summary: &ProcessSummary) -> Value {
    match &summary.error {
        Some(error) => json!({ "code": error.code, "message": error.message }),
        None => json!({ "message": format!("process {} failed", summary.id) }),
    }
}

impl Reconcile for NetworkReconciler {
    type Observation = ProcessObservation;

    fn reconcile(&self, _state: MachineState, obs: &ProcessObservation) -> Reconciliation {
        use JobDirective::*;
        let summary = &obs.summary;
        let mut directives = Vec::new();
        match (classify(summary), obs.job_state) {
            (_, JobState::Stopped) => {}
            (StepClass::Failed, JobState::Pending) => directives.extend([Start, Fail(failure_payload(summary))]),
            (StepClass::Failed, _) => directives.push(Fail(failure_payload(summary))),
            (StepClass::Canceled, _) => directives.push(CancelRemote),
            (StepClass::Done, JobState::Pending) => directives.extend([Start, End(json!({ "step": summary.step }))]),
            (StepClass::Done, JobState::Paused) => {
                directives.extend([UnpauseRemote, End(json!({ "step": summary.step }))])
            }
            (StepClass::Done, JobState::Running) => directives.push(End(json!({ "step": summary.step }))),
            (StepClass::Pending, _) => directives.push(SetCanCancel(summary.can_cancel)),
            (StepClass::Active, job_state) => {
                directives.push(SetCanCancel(summary.can_cancel));
                let mut running = job_state == JobState::Running;
                if job_state == JobState::Pending {
                    directives.push(Start);
                    running = true;
                }
                if running && summary.paused {
                    directives.push(PauseRemote);
                    running = false;
                } else if job_state == JobState::Paused && !summary.paused && obs.paused_remotely {
                    directives.push(UnpauseRemote);
                    running = true;
                }
                if running {
                    if let Some(percent) = summary.progress {
                        directives.push(Heartbeat(json!({ "percent": percent, "step": summary.step })));
                    }
                }
            }
        }
        Reconciliation {
            next_state: obs.device_state.and_then(machine_state),
            directives,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_shared::device::ProcessFailure;

    fn observe(summary: ProcessSummary, job_state: JobState) -> ProcessObservation {
        ProcessObservation {
            summary,
            device_state: None,
            job_state,
            paused_remotely: false,
        }
    }

    #[test]
    fn step_classes() {
        assert_eq!(classify(&ProcessSummary::new(1, "p", "")), StepClass::Pending);
        assert_eq!(classify(&ProcessSummary::new(1, "p", "printing")), StepClass::Active);
        assert_eq!(classify(&ProcessSummary::new(1, "p", "done")), StepClass::Done);
        let mut failed = ProcessSummary::new(1, "p", "printing");
        failed.error = Some(ProcessFailure {
            code: 7,
            message: "jam".into(),
        });
        assert_eq!(classify(&failed), StepClass::Failed);
        let mut cancelled = ProcessSummary::new(1, "p", "printing");
        cancelled.cancelled = true;
        assert_eq!(classify(&cancelled), StepClass::Canceled);
    }

    #[test]
    fn active_progress_heartbeats_a_running_job() {
        let mut summary = ProcessSummary::new(4, "print", "printing");
        summary.progress = Some(42);
        let r = NetworkReconciler.reconcile(MachineState::Running, &observe(summary, JobState::Running));
        assert!(r.directives.contains(&JobDirective::Heartbeat(json!({ "percent": 42, "step": "printing" }))));
    }

    #[test]
    fn device_cancel_is_remote() {
        let mut summary = ProcessSummary::new(4, "print", "printing");
        summary.cancelled = true;
        let r = NetworkReconciler.reconcile(MachineState::Running, &observe(summary, JobState::Paused));
        assert_eq!(r.directives, vec![JobDirective::CancelRemote]);
    }

    #[test]
    fn stopped_jobs_are_left_alone() {
        let summary = ProcessSummary::new(4, "print", "done");
        let r = NetworkReconciler.reconcile(MachineState::Idle, &observe(summary, JobState::Stopped));
        assert!(r.directives.is_empty());
    }

    #[test]
    fn device_pause_of_running_job() {
        let mut summary = ProcessSummary::new(4, "print", "printing");
        summary.paused = true;
        summary.progress = Some(10);
        let r = NetworkReconciler.reconcile(MachineState::Paused, &observe(summary, JobState::Running));
        assert_eq!(
            r.directives,
            vec![JobDirective::SetCanCancel(true), JobDirective::PauseRemote]
        );
    }

    #[test]
    fn locally_paused_job_is_not_resumed_by_a_stale_report() {
        let summary = ProcessSummary::new(4, "print", "printing");
        let r = NetworkReconciler.reconcile(MachineState::Running, &observe(summary, JobState::Paused));
        assert_eq!(r.directives, vec![JobDirective::SetCanCancel(true)]);
    }
}
