//! Shared vocabulary for turning device-reported status into machine state
//! and job events. Reconcilers are pure: they decide, the machine applies.

use dispatch_shared::api_models::MachineState;
use dispatch_shared::job::{Job, JobError};
use serde_json::Value;

/// One job event to fire. This is the only way reconciliation touches a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDirective {
    Start,
    Heartbeat(Value),
    PauseRemote,
    UnpauseRemote,
    End(Value),
    Fail(Value),
    CancelRemote,
    SetCanCancel(bool),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub next_state: Option<MachineState>,
    pub directives: Vec<JobDirective>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.next_state.is_none() && self.directives.is_empty()
    }
}

/// Implemented once per device family.
pub trait Reconcile {
    type Observation;

    fn reconcile(&self, state: MachineState, observation: &Self::Observation) -> Reconciliation;
}

/// Fire `directives` on `job` in order. An illegal transition means the
/// device and the job already disagree; it is logged and skipped.
pub fn apply_directives(job: &Job, directives: &[JobDirective]) {
    for directive in directives {
        let outcome: Result<(), JobError> = match directive {
            JobDirective::Start => job.start(),
            JobDirective::Heartbeat(progress) => {
                job.try_heartbeat(progress.clone());
                Ok(())
            }
            JobDirective::PauseRemote => job.pause_remotely(),
            JobDirective::UnpauseRemote => job.unpause_remotely(),
            JobDirective::End(result) => job.end(result.clone()),
            JobDirective::Fail(failure) => job.fail(failure.clone()),
            JobDirective::CancelRemote => job.cancel_remotely(),
            JobDirective::SetCanCancel(can_cancel) => {
                job.set_can_cancel(*can_cancel);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            tracing::debug!(job_id = job.id(), ?directive, "skipping reconciled event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_shared::job::{Conclusion, JobKind, JobState};
    use serde_json::json;

    #[test]
    fn illegal_directives_are_skipped() {
        let job = Job::new(1, "print", JobKind::Print);
        apply_directives(
            &job,
            &[JobDirective::UnpauseRemote, JobDirective::Start, JobDirective::End(json!(true))],
        );
        assert_eq!(job.state(), JobState::Stopped);
        assert_eq!(job.conclusion(), Some(Conclusion::Ended));
    }

    #[test]
    fn remote_pause_sets_flag() {
        let job = Job::new(1, "print", JobKind::Print);
        apply_directives(&job, &[JobDirective::Start, JobDirective::PauseRemote]);
        assert!(job.paused_remotely());
        apply_directives(&job, &[JobDirective::UnpauseRemote]);
        assert!(!job.paused_remotely());
        assert_eq!(job.state(), JobState::Running);
    }
}
