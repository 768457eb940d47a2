//! Job lifecycle state machine.
//!
//! ```text
//!   PENDING ──start──→ RUNNING ──end / fail / cancel──→ STOPPED
//!      │                │   ↑
//!      │            pause   unpause
//!      │                ↓   │
//!      │               PAUSED ──fail / cancel──→ STOPPED
//!      └──────────────cancel─────────────────→ STOPPED
//! ```
//!
//! Every mutation goes through [`Job::transition`] (or the extra-info setters),
//! which is the single serialization point for a job: events for one job are
//! delivered in order. Subscribers are plain callbacks fired while the job lock
//! is held, most recently attached first. A callback that returns an error is
//! logged and dropped from the list. Callbacks receive a snapshot and must not
//! call back into the same job.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Paused => "PAUSED",
            JobState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Conclusion {
    Ended,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEvent {
    Start,
    Heartbeat,
    Pause,
    Unpause,
    End,
    Fail,
    Cancel,
}

impl JobEvent {
    pub const ALL: [JobEvent; 7] = [
        JobEvent::Start,
        JobEvent::Heartbeat,
        JobEvent::Pause,
        JobEvent::Unpause,
        JobEvent::End,
        JobEvent::Fail,
        JobEvent::Cancel,
    ];
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobEvent::Start => "start",
            JobEvent::Heartbeat => "heartbeat",
            JobEvent::Pause => "pause",
            JobEvent::Unpause => "unpause",
            JobEvent::End => "end",
            JobEvent::Fail => "fail",
            JobEvent::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Notification delivered to job callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSignal {
    Started,
    Running,
    Heartbeat,
    Paused,
    Unpaused,
    Ended,
    Failed,
    Canceled,
    Stopped,
    /// Fired after every mutation, including extra-info updates.
    Changed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("illegal job transition: cannot {event} a job that is {state}")]
    IllegalTransition { state: JobState, event: JobEvent },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Print,
    PrintToFile,
    Slice,
    Calibrate,
    Home,
    Jog,
    FirmwareUpload,
    LoadFilament,
    UnloadFilament,
    Preheat,
    ZipLogs,
    ReadEeprom,
    WriteEeprom,
    /// A device-side process of a kind the host does not model.
    Other,
}

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
pub type JobCallback = Box<dyn Fn(JobSignal, &JobInfo) -> Result<(), CallbackError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Identifies the device a job runs against.
///
/// The base job never depends on machine types; machines hand in an origin
/// and the info snapshot asks it for names.
pub trait JobOrigin: Send + Sync {
    fn machine_name(&self) -> Option<String> {
        None
    }
    fn driver_name(&self) -> Option<String> {
        None
    }
    fn profile_name(&self) -> Option<String> {
        None
    }
}

struct NoOrigin;

impl JobOrigin for NoOrigin {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOrigin {
    pub machine: String,
    pub driver: String,
    pub profile: String,
}

impl JobOrigin for DeviceOrigin {
    fn machine_name(&self) -> Option<String> {
        Some(self.machine.clone())
    }
    fn driver_name(&self) -> Option<String> {
        Some(self.driver.clone())
    }
    fn profile_name(&self) -> Option<String> {
        Some(self.profile.clone())
    }
}

/// Insertion-ordered side channel for vendor-native status fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraInfo(Vec<(String, Value)>);

impl ExtraInfo {
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(index).1)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for ExtraInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Point-in-time snapshot of a job, as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub state: JobState,
    pub conclusion: Option<Conclusion>,
    pub progress: Option<Value>,
    pub result: Option<Value>,
    pub failure: Option<Value>,
    pub pausable: bool,
    pub can_cancel: bool,
    pub machine_name: Option<String>,
    pub driver_name: Option<String>,
    pub profile_name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// The transition that produced this snapshot was reported by the device.
    #[serde(skip)]
    pub remote: bool,
    #[serde(skip)]
    pub paused_remotely: bool,
    #[serde(skip)]
    pub canceled_remotely: bool,
    #[serde(flatten)]
    pub extra: ExtraInfo,
}

struct JobInner {
    state: JobState,
    conclusion: Option<Conclusion>,
    progress: Option<Value>,
    result: Option<Value>,
    failure: Option<Value>,
    pausable: bool,
    can_cancel: bool,
    remote: bool,
    paused_remotely: bool,
    canceled_remotely: bool,
    extra: ExtraInfo,
    callbacks: Vec<(CallbackId, JobCallback)>,
    next_callback: u64,
}

pub struct Job {
    id: JobId,
    name: String,
    kind: JobKind,
    created_at: DateTime<Utc>,
    origin: Arc<dyn JobOrigin>,
    inner: Mutex<JobInner>,
    state_tx: watch::Sender<JobState>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Next state for `event` in `state`, or `None` when the event is illegal.
pub fn next_state(state: JobState, event: JobEvent) -> Option<(JobState, Option<Conclusion>)> {
    use JobEvent::*;
    use JobState::*;
    match (state, event) {
        (Pending, Start) => Some((Running, None)),
        (Running, Heartbeat) => Some((Running, None)),
        (Running, Pause) => Some((Paused, None)),
        (Paused, Unpause) => Some((Running, None)),
        (Running, End) => Some((Stopped, Some(Conclusion::Ended))),
        (Running, Fail) | (Paused, Fail) => Some((Stopped, Some(Conclusion::Failed))),
        (Pending, Cancel) | (Running, Cancel) | (Paused, Cancel) => {
            Some((Stopped, Some(Conclusion::Canceled)))
        }
        _ => None,
    }
}

fn signals_for(event: JobEvent) -> &'static [JobSignal] {
    match event {
        JobEvent::Start => &[JobSignal::Started, JobSignal::Running, JobSignal::Changed],
        JobEvent::Heartbeat => &[JobSignal::Heartbeat, JobSignal::Changed],
        JobEvent::Pause => &[JobSignal::Paused, JobSignal::Changed],
        JobEvent::Unpause => &[JobSignal::Unpaused, JobSignal::Changed],
        JobEvent::End => &[JobSignal::Ended, JobSignal::Stopped, JobSignal::Changed],
        JobEvent::Fail => &[JobSignal::Failed, JobSignal::Stopped, JobSignal::Changed],
        JobEvent::Cancel => &[JobSignal::Canceled, JobSignal::Stopped, JobSignal::Changed],
    }
}

impl Job {
    pub fn new(id: JobId, name: impl Into<String>, kind: JobKind) -> Self {
        let (state_tx, _) = watch::channel(JobState::Pending);
        Self {
            id,
            name: name.into(),
            kind,
            created_at: Utc::now(),
            origin: Arc::new(NoOrigin),
            inner: Mutex::new(JobInner {
                state: JobState::Pending,
                conclusion: None,
                progress: None,
                result: None,
                failure: None,
                pausable: false,
                can_cancel: true,
                remote: false,
                paused_remotely: false,
                canceled_remotely: false,
                extra: ExtraInfo::default(),
                callbacks: Vec::new(),
                next_callback: 0,
            }),
            state_tx,
        }
    }

    pub fn with_origin(mut self, origin: Arc<dyn JobOrigin>) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_pausable(self, pausable: bool) -> Self {
        self.inner.lock().pausable = pausable;
        self
    }

    pub fn with_can_cancel(self, can_cancel: bool) -> Self {
        self.inner.lock().can_cancel = can_cancel;
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    pub fn conclusion(&self) -> Option<Conclusion> {
        self.inner.lock().conclusion
    }

    pub fn progress(&self) -> Option<Value> {
        self.inner.lock().progress.clone()
    }

    pub fn result(&self) -> Option<Value> {
        self.inner.lock().result.clone()
    }

    pub fn failure(&self) -> Option<Value> {
        self.inner.lock().failure.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == JobState::Stopped
    }

    pub fn paused_remotely(&self) -> bool {
        self.inner.lock().paused_remotely
    }

    pub fn canceled_remotely(&self) -> bool {
        self.inner.lock().canceled_remotely
    }

    pub fn start(&self) -> Result<(), JobError> {
        self.transition(JobEvent::Start, None, false)
    }

    pub fn heartbeat(&self, progress: Value) -> Result<(), JobError> {
        self.transition(JobEvent::Heartbeat, Some(progress), false)
    }

    /// Only fires when `progress` differs from the stored value.
    pub fn heartbeat_lazy(&self, progress: Value) -> Result<(), JobError> {
        let mut inner = self.inner.lock();
        if inner.state == JobState::Running && inner.progress.as_ref() == Some(&progress) {
            return Ok(());
        }
        self.apply(&mut inner, JobEvent::Heartbeat, Some(progress), false)
    }

    /// Lazy heartbeat that is dropped, not rejected, once the job has left
    /// RUNNING. Returns whether it was applied.
    pub fn try_heartbeat(&self, progress: Value) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != JobState::Running {
            tracing::debug!(job_id = self.id, state = %inner.state, "dropping late heartbeat");
            return false;
        }
        if inner.progress.as_ref() == Some(&progress) {
            return false;
        }
        self.apply(&mut inner, JobEvent::Heartbeat, Some(progress), false)
            .is_ok()
    }

    pub fn pause(&self) -> Result<(), JobError> {
        self.transition(JobEvent::Pause, None, false)
    }

    /// Pause reported by the device; callbacks see `paused_remotely`.
    pub fn pause_remotely(&self) -> Result<(), JobError> {
        self.transition(JobEvent::Pause, None, true)
    }

    pub fn unpause(&self) -> Result<(), JobError> {
        self.transition(JobEvent::Unpause, None, false)
    }

    pub fn unpause_remotely(&self) -> Result<(), JobError> {
        self.transition(JobEvent::Unpause, None, true)
    }

    pub fn end(&self, result: Value) -> Result<(), JobError> {
        self.transition(JobEvent::End, Some(result), false)
    }

    pub fn fail(&self, failure: Value) -> Result<(), JobError> {
        self.transition(JobEvent::Fail, Some(failure), false)
    }

    pub fn cancel(&self) -> Result<(), JobError> {
        self.transition(JobEvent::Cancel, None, false)
    }

    /// Cancel reported by the device; callbacks see `canceled_remotely`.
    pub fn cancel_remotely(&self) -> Result<(), JobError> {
        self.transition(JobEvent::Cancel, None, true)
    }

    /// Attempt exactly one transition.
    pub fn transition(&self, event: JobEvent, payload: Option<Value>, remote: bool) -> Result<(), JobError> {
        let mut inner = self.inner.lock();
        self.apply(&mut inner, event, payload, remote)
    }

    fn apply(
        &self,
        inner: &mut JobInner,
        event: JobEvent,
        payload: Option<Value>,
        remote: bool,
    ) -> Result<(), JobError> {
        let (next, conclusion) = next_state(inner.state, event).ok_or(JobError::IllegalTransition {
            state: inner.state,
            event,
        })?;
        match event {
            JobEvent::Heartbeat => inner.progress = payload,
            JobEvent::End => inner.result = payload,
            JobEvent::Fail => inner.failure = payload,
            JobEvent::Pause => inner.paused_remotely = remote,
            JobEvent::Unpause => inner.paused_remotely = false,
            JobEvent::Cancel => inner.canceled_remotely = remote,
            JobEvent::Start => {}
        }
        inner.remote = remote;
        inner.state = next;
        if conclusion.is_some() {
            inner.conclusion = conclusion;
        }
        self.state_tx.send_replace(next);
        tracing::debug!(job_id = self.id, %event, state = %next, remote, "job transition");
        self.fire(inner, signals_for(event));
        Ok(())
    }

    pub fn set_can_cancel(&self, can_cancel: bool) {
        let mut inner = self.inner.lock();
        if inner.can_cancel != can_cancel {
            inner.can_cancel = can_cancel;
            inner.remote = false;
            self.fire(&mut inner, &[JobSignal::Changed]);
        }
    }

    pub fn add_extra_info(&self, key: impl Into<String>, value: Value, notify: bool) {
        let mut inner = self.inner.lock();
        inner.extra.insert(key, value);
        if notify {
            inner.remote = false;
            self.fire(&mut inner, &[JobSignal::Changed]);
        }
    }

    pub fn pop_extra_info(&self, key: &str, notify: bool) -> Option<Value> {
        let mut inner = self.inner.lock();
        let value = inner.extra.remove(key);
        if notify && value.is_some() {
            inner.remote = false;
            self.fire(&mut inner, &[JobSignal::Changed]);
        }
        value
    }

    pub fn add_callback(&self, callback: JobCallback) -> CallbackId {
        let mut inner = self.inner.lock();
        let id = CallbackId(inner.next_callback);
        inner.next_callback += 1;
        inner.callbacks.push((id, callback));
        id
    }

    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.callbacks.len();
        inner.callbacks.retain(|(cid, _)| *cid != id);
        inner.callbacks.len() != before
    }

    pub fn callback_count(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn get_info(&self) -> JobInfo {
        let inner = self.inner.lock();
        self.snapshot(&inner)
    }

    /// Resolves once the job reaches STOPPED.
    pub async fn wait_until_stopped(&self) -> Option<Conclusion> {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == JobState::Stopped).await;
        self.conclusion()
    }

    fn snapshot(&self, inner: &JobInner) -> JobInfo {
        JobInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            state: inner.state,
            conclusion: inner.conclusion,
            progress: inner.progress.clone(),
            result: inner.result.clone(),
            failure: inner.failure.clone(),
            pausable: inner.pausable,
            can_cancel: inner.can_cancel,
            machine_name: self.origin.machine_name(),
            driver_name: self.origin.driver_name(),
            profile_name: self.origin.profile_name(),
            created_at: self.created_at,
            remote: inner.remote,
            paused_remotely: inner.paused_remotely,
            canceled_remotely: inner.canceled_remotely,
            extra: inner.extra.clone(),
        }
    }

    fn fire(&self, inner: &mut JobInner, signals: &[JobSignal]) {
        if inner.callbacks.is_empty() {
            return;
        }
        let info = self.snapshot(inner);
        let mut failed: Vec<CallbackId> = Vec::new();
        for signal in signals {
            for (id, callback) in inner.callbacks.iter().rev() {
                if failed.contains(id) {
                    continue;
                }
                if let Err(e) = callback(*signal, &info) {
                    tracing::warn!(job_id = self.id, ?signal, "job callback failed and was removed: {}", e);
                    failed.push(*id);
                }
            }
        }
        if !failed.is_empty() {
            inner.callbacks.retain(|(id, _)| !failed.contains(id));
        }
    }
}
