//! Job creation shared by every machine and the recipe pipeline.

use dispatch_shared::api_models::DispatchEvent;
use dispatch_shared::job::{Job, JobKind, JobOrigin, JobSignal, JobState};
use dispatch_shared::job_registry::JobRegistry;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct JobSpec {
    name: String,
    kind: JobKind,
    pausable: bool,
    can_cancel: bool,
    origin: Option<Arc<dyn JobOrigin>>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, kind: JobKind) -> Self {
        Self {
            name: name.into(),
            kind,
            pausable: false,
            can_cancel: true,
            origin: None,
        }
    }

    pub fn pausable(mut self, pausable: bool) -> Self {
        self.pausable = pausable;
        self
    }

    pub fn can_cancel(mut self, can_cancel: bool) -> Self {
        self.can_cancel = can_cancel;
        self
    }

    pub fn origin(mut self, origin: Arc<dyn JobOrigin>) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Assigns ids, registers jobs and wires them to the event bus.
#[derive(Clone)]
pub struct JobFactory {
    registry: Arc<JobRegistry>,
    events: broadcast::Sender<DispatchEvent>,
}

impl JobFactory {
    pub fn new(registry: Arc<JobRegistry>, events: broadcast::Sender<DispatchEvent>) -> Self {
        Self { registry, events }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &broadcast::Sender<DispatchEvent> {
        &self.events
    }

    pub fn create(&self, spec: JobSpec) -> Arc<Job> {
        let id = self.registry.create_job_id();
        let mut job = Job::new(id, spec.name, spec.kind)
            .with_pausable(spec.pausable)
            .with_can_cancel(spec.can_cancel);
        if let Some(origin) = spec.origin {
            job = job.with_origin(origin);
        }
        let job = Arc::new(job);
        self.registry.register(&job);

        let events = self.events.clone();
        job.add_callback(Box::new(move |signal, info| {
            if signal == JobSignal::Changed {
                let _ = events.send(DispatchEvent::JobChanged(info.clone()));
            }
            Ok(())
        }));
        let _ = self.events.send(DispatchEvent::JobAdded(job.get_info()));
        tracing::info!(job_id = id, kind = ?job.kind(), "job created: {}", job.name());
        job
    }
}

/// Stop `job` with `failure` from whatever state it is in.
pub fn abandon(job: &Job, failure: Value) {
    let outcome = match job.state() {
        JobState::Running | JobState::Paused => job.fail(failure),
        JobState::Pending => job.cancel(),
        JobState::Stopped => Ok(()),
    };
    if let Err(e) = outcome {
        tracing::debug!(job_id = job.id(), "job already moved on: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn created_jobs_are_announced_and_tracked() {
        let (tx, mut rx) = broadcast::channel(16);
        let factory = JobFactory::new(Arc::new(JobRegistry::new()), tx);
        let job = factory.create(JobSpec::new("print", JobKind::Print).pausable(true));
        assert_eq!(job.id(), 1);
        assert!(factory.registry().get(1).is_some());
        assert!(matches!(rx.try_recv(), Ok(DispatchEvent::JobAdded(info)) if info.pausable));

        job.start().unwrap();
        job.heartbeat(json!({ "percent": 3 })).unwrap();
        let changes: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|e| matches!(e, DispatchEvent::JobChanged(_))));
    }
}
