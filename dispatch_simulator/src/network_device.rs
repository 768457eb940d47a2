//! Scriptable networked device.
//!
//! Records every client call and hands out process ids. Device-side progress
//! is driven by the test, which pushes notifications into the live session.

use async_trait::async_trait;
use dispatch_shared::device::{
    EepromMap, LinkError, NetworkClient, NetworkConnector, NetworkSession, Notification, ProcessId, ProcessRequest,
    StateNotification, SystemNotification,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    Authenticate,
    Handshake,
    ReserveProcessId,
    StartProcess(ProcessId, ProcessRequest),
    Pause(ProcessId),
    Resume(ProcessId),
    Cancel(ProcessId),
    ReadEeprom,
    WriteEeprom,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthBehavior {
    Accept,
    Refuse,
    /// Fail with a transient error this many times, then accept.
    FailTransient(u32),
}

#[derive(Debug)]
struct NetworkState {
    calls: Vec<SimCall>,
    auth: AuthBehavior,
    snapshot: SystemNotification,
    handshake_failure: Option<LinkError>,
    start_failure: Option<LinkError>,
    open_failure: Option<LinkError>,
    next_process: ProcessId,
    notifications: Option<mpsc::UnboundedSender<Notification>>,
    eeprom: EepromMap,
}

/// In-memory networked device. Clones share the same device.
#[derive(Clone)]
pub struct SimNetworkDevice {
    address: String,
    state: Arc<Mutex<NetworkState>>,
}

impl SimNetworkDevice {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Arc::new(Mutex::new(NetworkState {
                calls: Vec::new(),
                auth: AuthBehavior::Accept,
                snapshot: SystemNotification::idle(),
                handshake_failure: None,
                start_failure: None,
                open_failure: None,
                next_process: 1,
                notifications: None,
                eeprom: EepromMap::new(),
            })),
        }
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, matches: impl Fn(&SimCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| matches(call)).count()
    }

    pub fn set_auth(&self, auth: AuthBehavior) {
        self.state.lock().auth = auth;
    }

    /// Snapshot returned by the handshake.
    pub fn set_snapshot(&self, snapshot: SystemNotification) {
        self.state.lock().snapshot = snapshot;
    }

    pub fn fail_handshake(&self, error: Option<LinkError>) {
        self.state.lock().handshake_failure = error;
    }

    pub fn fail_start(&self, error: Option<LinkError>) {
        self.state.lock().start_failure = error;
    }

    pub fn fail_open(&self, error: Option<LinkError>) {
        self.state.lock().open_failure = error;
    }

    /// Deliver a notification on the live session. False when nobody is listening.
    pub fn push(&self, notification: Notification) -> bool {
        match &self.state.lock().notifications {
            Some(tx) => tx.send(notification).is_ok(),
            None => false,
        }
    }

    pub fn push_system(&self, snapshot: SystemNotification) -> bool {
        self.push(Notification::SystemNotification(snapshot))
    }

    pub fn push_state(&self, delta: StateNotification) -> bool {
        self.push(Notification::StateNotification(delta))
    }

    /// End the notification stream as if the device went away.
    pub fn drop_session(&self) {
        self.state.lock().notifications = None;
    }

    fn record(&self, call: SimCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl NetworkConnector for SimNetworkDevice {
    fn address(&self) -> &str {
        &self.address
    }

    async fn open(&self) -> Result<NetworkSession, LinkError> {
        let mut state = self.state.lock();
        if let Some(error) = state.open_failure.clone() {
            return Err(error);
        }
        let (tx, notifications) = mpsc::unbounded_channel();
        state.notifications = Some(tx);
        Ok(NetworkSession {
            client: Arc::new(self.clone()),
            notifications,
        })
    }
}

#[async_trait]
impl NetworkClient for SimNetworkDevice {
    async fn authenticate(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::Authenticate);
        match state.auth {
            AuthBehavior::Accept => Ok(()),
            AuthBehavior::Refuse => Err(LinkError::NotAuthorized("device refused the token".to_string())),
            AuthBehavior::FailTransient(0) => {
                state.auth = AuthBehavior::Accept;
                Ok(())
            }
            AuthBehavior::FailTransient(n) => {
                state.auth = if n == 1 { AuthBehavior::Accept } else { AuthBehavior::FailTransient(n - 1) };
                Err(LinkError::Timeout)
            }
        }
    }

    async fn handshake(&self) -> Result<SystemNotification, LinkError> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::Handshake);
        match state.handshake_failure.clone() {
            Some(error) => Err(error),
            None => Ok(state.snapshot.clone()),
        }
    }

    async fn reserve_process_id(&self) -> Result<ProcessId, LinkError> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::ReserveProcessId);
        let id = state.next_process;
        state.next_process += 1;
        Ok(id)
    }

    async fn start_process(&self, id: ProcessId, request: &ProcessRequest) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::StartProcess(id, request.clone()));
        match state.start_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn pause(&self, id: ProcessId) -> Result<(), LinkError> {
        self.record(SimCall::Pause(id));
        Ok(())
    }

    async fn resume(&self, id: ProcessId) -> Result<(), LinkError> {
        self.record(SimCall::Resume(id));
        Ok(())
    }

    async fn cancel(&self, id: ProcessId) -> Result<(), LinkError> {
        self.record(SimCall::Cancel(id));
        Ok(())
    }

    async fn read_eeprom(&self) -> Result<EepromMap, LinkError> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::ReadEeprom);
        Ok(state.eeprom.clone())
    }

    async fn write_eeprom(&self, values: &EepromMap) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::WriteEeprom);
        state.eeprom.extend(values.clone());
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::Close);
        state.notifications = None;
    }
}
