//! State shared by every machine family: the condition-locked status block,
//! the cooperative stop signal, and event emission.

use super::MachineError;
use dispatch_shared::api_models::{DispatchEvent, MachineFault, MachineInfo, MachineState};
use dispatch_shared::job::{DeviceOrigin, Job, JobOrigin, JobState};
use dispatch_shared::profile::Profile;
use dispatch_shared::{Heater, Position, Temperatures};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast, watch};

/// Cooperative stop flag observed by every background task of one connection.
/// Clones share the flag; each connection gets a fresh one, so a stopped
/// session stays stopped.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// True when both handles belong to the same connection.
    pub fn same_session(&self, other: &StopSignal) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration`, returning early if a stop is requested.
    pub async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wait() => {}
        }
    }
}

struct MachineStatus {
    state: MachineState,
    fault: Option<MachineFault>,
    temperatures: Temperatures,
    position: Option<Position>,
    current_job: Option<Arc<Job>>,
}

pub struct MachineCore {
    name: String,
    profile: Profile,
    status: Mutex<MachineStatus>,
    state_tx: watch::Sender<MachineState>,
    stop: Mutex<StopSignal>,
    poke: Notify,
    events: broadcast::Sender<DispatchEvent>,
}

impl MachineCore {
    pub fn new(name: impl Into<String>, profile: Profile, events: broadcast::Sender<DispatchEvent>) -> Self {
        let (state_tx, _) = watch::channel(MachineState::Disconnected);
        let temperatures = Temperatures::for_layout(profile.tool_count, profile.heated_platform);
        Self {
            name: name.into(),
            profile,
            status: Mutex::new(MachineStatus {
                state: MachineState::Disconnected,
                fault: None,
                temperatures,
                position: None,
                current_job: None,
            }),
            state_tx,
            stop: Mutex::new(StopSignal::new()),
            poke: Notify::new(),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &str {
        &self.profile.driver
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn origin(&self) -> Arc<dyn JobOrigin> {
        Arc::new(DeviceOrigin {
            machine: self.name.clone(),
            driver: self.profile.driver.clone(),
            profile: self.profile.name.clone(),
        })
    }

    /// The stop signal of the current (or last) connection.
    pub fn stop(&self) -> StopSignal {
        self.stop.lock().clone()
    }

    /// Install a fresh stop signal for a new connection. Workers of earlier
    /// connections keep the signal they were started with.
    pub fn begin_session(&self) -> StopSignal {
        let stop = StopSignal::new();
        *self.stop.lock() = stop.clone();
        stop
    }

    /// Wake the poller ahead of its interval.
    pub fn poke(&self) {
        self.poke.notify_one();
    }

    pub async fn poked(&self) {
        self.poke.notified().await
    }

    pub fn emit(&self, event: DispatchEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    pub fn state(&self) -> MachineState {
        self.status.lock().state
    }

    /// Move to `next`, notifying waiters and listeners. Returns the previous state.
    pub fn set_state(&self, next: MachineState) -> MachineState {
        let mut status = self.status.lock();
        let previous = status.state;
        if previous != next {
            status.state = next;
            self.state_tx.send_replace(next);
            tracing::info!(machine = %self.name, from = %previous, to = %next, "machine state changed");
            let info = self.info_locked(&status);
            self.emit(DispatchEvent::MachineStateChanged(info));
        }
        previous
    }

    /// Move to `next` only when the current state is one of `from`.
    pub fn transition_from(&self, from: &[MachineState], next: MachineState) -> bool {
        let mut status = self.status.lock();
        if !from.contains(&status.state) {
            return false;
        }
        let previous = status.state;
        if previous != next {
            status.state = next;
            self.state_tx.send_replace(next);
            tracing::info!(machine = %self.name, from = %previous, to = %next, "machine state changed");
            let info = self.info_locked(&status);
            self.emit(DispatchEvent::MachineStateChanged(info));
        }
        true
    }

    pub fn require(&self, operation: &'static str, allowed: &[MachineState]) -> Result<MachineState, MachineError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(MachineError::InvalidState { state, operation })
        }
    }

    /// Wait until the machine reaches `state`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, state: MachineState, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn fault(&self) -> Option<MachineFault> {
        self.status.lock().fault.clone()
    }

    /// Record a fatal condition and ask the connection to shut down.
    pub fn record_fault(&self, fault: MachineFault) {
        tracing::error!(machine = %self.name, code = ?fault.code, "machine fault: {}", fault.message);
        self.status.lock().fault = Some(fault);
        self.stop().request();
    }

    /// Record an error without tearing anything down (connect failures).
    pub fn set_fault(&self, fault: MachineFault) {
        self.status.lock().fault = Some(fault);
    }

    pub fn clear_fault(&self) {
        self.status.lock().fault = None;
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.status.lock().current_job.clone()
    }

    /// Claim the single print-class operation slot for `job`.
    pub fn claim_operation(&self, job: &Arc<Job>) -> Result<(), MachineError> {
        let mut status = self.status.lock();
        if let Some(current) = &status.current_job {
            if !current.is_stopped() && current.id() != job.id() {
                return Err(MachineError::OperationInFlight(current.id()));
            }
        }
        status.current_job = Some(job.clone());
        Ok(())
    }

    pub fn set_current_job(&self, job: Option<Arc<Job>>) {
        self.status.lock().current_job = job;
    }

    pub fn take_current_job(&self) -> Option<Arc<Job>> {
        self.status.lock().current_job.take()
    }

    pub fn temperatures(&self) -> Temperatures {
        self.status.lock().temperatures.clone()
    }

    pub fn set_target_temperature(&self, heater: Heater, celsius: f64) {
        let mut status = self.status.lock();
        if status.temperatures.set_target(heater, celsius) {
            tracing::debug!(machine = %self.name, ?heater, celsius, "target temperature set");
            self.emit(DispatchEvent::MachineTemperatureChanged {
                machine: self.name.clone(),
                temperatures: status.temperatures.clone(),
            });
        }
    }

    pub fn update_temperatures(&self, temperatures: Temperatures) {
        let mut status = self.status.lock();
        if status.temperatures != temperatures {
            status.temperatures = temperatures;
            self.emit(DispatchEvent::MachineTemperatureChanged {
                machine: self.name.clone(),
                temperatures: status.temperatures.clone(),
            });
        }
    }

    pub fn position(&self) -> Option<Position> {
        self.status.lock().position
    }

    pub fn set_position(&self, position: Position) {
        self.status.lock().position = Some(position);
    }

    pub fn info(&self) -> MachineInfo {
        let status = self.status.lock();
        self.info_locked(&status)
    }

    fn info_locked(&self, status: &MachineStatus) -> MachineInfo {
        MachineInfo {
            name: self.name.clone(),
            state: status.state,
            driver: self.profile.driver.clone(),
            profile: self.profile.name.clone(),
            fault: status.fault.clone(),
            temperatures: status.temperatures.clone(),
            position: status.position,
            current_job: status
                .current_job
                .as_ref()
                .filter(|job| job.state() != JobState::Stopped)
                .map(|job| job.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_shared::job::JobKind;

    fn core() -> (MachineCore, broadcast::Receiver<DispatchEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (MachineCore::new("m1", Profile::default(), tx), rx)
    }

    #[test]
    fn state_change_emits_once() {
        let (core, mut rx) = core();
        core.set_state(MachineState::Idle);
        core.set_state(MachineState::Idle);
        assert!(matches!(rx.try_recv(), Ok(DispatchEvent::MachineStateChanged(info)) if info.state == MachineState::Idle));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn require_reports_state_and_operation() {
        let (core, _rx) = core();
        let err = core.require("print", &[MachineState::Idle]).unwrap_err();
        assert!(matches!(
            err,
            MachineError::InvalidState { state: MachineState::Disconnected, operation: "print" }
        ));
    }

    #[test]
    fn second_operation_is_rejected() {
        let (core, _rx) = core();
        let first = Arc::new(Job::new(1, "a", JobKind::Print));
        let second = Arc::new(Job::new(2, "b", JobKind::Print));
        core.claim_operation(&first).unwrap();
        assert!(matches!(core.claim_operation(&second), Err(MachineError::OperationInFlight(1))));
        first.cancel().unwrap();
        assert!(core.claim_operation(&second).is_ok());
    }

    #[test]
    fn fault_requests_stop() {
        let (core, _rx) = core();
        core.record_fault(MachineFault::new(dispatch_shared::api_models::FaultCode::Protocol, "bad"));
        assert!(core.stop().is_set());
        assert!(core.fault().is_some());
    }

    #[test]
    fn new_session_does_not_revive_old_signal() {
        let (core, _rx) = core();
        let old = core.begin_session();
        old.request();
        let fresh = core.begin_session();
        assert!(old.is_set());
        assert!(!fresh.is_set());
        core.record_fault(MachineFault::new(dispatch_shared::api_models::FaultCode::Protocol, "bad"));
        assert!(fresh.is_set());
    }

    #[tokio::test]
    async fn wait_for_state_times_out() {
        let (core, _rx) = core();
        assert!(!core.wait_for_state(MachineState::Idle, Duration::from_millis(10)).await);
        core.set_state(MachineState::Idle);
        assert!(core.wait_for_state(MachineState::Idle, Duration::from_millis(10)).await);
    }
}
