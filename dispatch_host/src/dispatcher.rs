//! Owns the shared job registry and event bus, and the table of attached machines.

use crate::communication::serial::GcodeSerialConnector;
use crate::communication::tcp::TcpConnector;
use crate::firmware::{FirmwareUploadStore, FirmwareUploader};
use crate::jobs::JobFactory;
use crate::machine::serial::SerialSettings;
use crate::machine::{Machine, MachineError, NetworkMachine, SerialMachine};
use dispatch_shared::api_models::{DispatchEvent, MachineState};
use dispatch_shared::config::{Config, ConfigError, MachineConfig, MachineKind};
use dispatch_shared::device::{NetworkConnector, SerialConnector};
use dispatch_shared::job::{Job, JobId};
use dispatch_shared::job_registry::JobRegistry;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error("a machine named '{0}' is already attached")]
    Duplicate(String),
    #[error("no machine named '{0}'")]
    UnknownMachine(String),
}

pub struct Dispatcher {
    config: Config,
    registry: Arc<JobRegistry>,
    firmware: Arc<FirmwareUploadStore>,
    events: broadcast::Sender<DispatchEvent>,
    machines: Mutex<HashMap<String, Arc<dyn Machine>>>,
    /// Names claimed by an attach that is still connecting.
    attaching: Mutex<HashSet<String>>,
}

/// Releases an attach reservation however the attach ends.
struct Reservation<'a> {
    attaching: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.attaching.lock().remove(&self.name);
    }
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            registry: Arc::new(JobRegistry::new()),
            firmware: Arc::new(FirmwareUploadStore::new()),
            events,
            machines: Mutex::new(HashMap::new()),
            attaching: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn job_factory(&self) -> JobFactory {
        JobFactory::new(self.registry.clone(), self.events.clone())
    }

    pub fn firmware_store(&self) -> &Arc<FirmwareUploadStore> {
        &self.firmware
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Build, connect and register a legacy serial machine.
    pub async fn attach_serial(
        &self,
        machine: &MachineConfig,
        connector: Arc<dyn SerialConnector>,
        uploader: Option<Arc<dyn FirmwareUploader>>,
    ) -> Result<Arc<dyn Machine>, DispatchError> {
        let profile = self.config.profile(&machine.profile)?;
        let mut builder = SerialMachine::builder(&machine.name, profile, connector, self.job_factory())
            .settings(SerialSettings::from(&self.config))
            .firmware_store(self.firmware.clone())
            .serial_number(machine.serial_number.clone());
        if let Some(uploader) = uploader {
            builder = builder.uploader(uploader);
        }
        let machine: Arc<dyn Machine> = Arc::new(builder.build());
        self.attach_machine(machine.clone()).await?;
        Ok(machine)
    }

    /// Build, connect and register a networked machine.
    pub async fn attach_network(
        &self,
        machine: &MachineConfig,
        connector: Arc<dyn NetworkConnector>,
    ) -> Result<Arc<dyn Machine>, DispatchError> {
        let profile = self.config.profile(&machine.profile)?;
        let network = NetworkMachine::new(
            &machine.name,
            profile,
            connector,
            self.job_factory(),
            self.config.network.clone(),
        );
        network.set_serial_number(machine.serial_number.clone());
        let machine: Arc<dyn Machine> = Arc::new(network);
        self.attach_machine(machine.clone()).await?;
        Ok(machine)
    }

    /// Attach a configured machine over its real transport.
    pub async fn attach_from_config(&self, machine: &MachineConfig) -> Result<Arc<dyn Machine>, DispatchError> {
        match machine.kind {
            MachineKind::Serial => {
                let port = machine
                    .port
                    .clone()
                    .ok_or_else(|| ConfigError::Invalid(format!("serial machine '{}' has no port", machine.name)))?;
                let connector = Arc::new(GcodeSerialConnector::new(port, machine.baud));
                self.attach_serial(machine, connector, None).await
            }
            MachineKind::Network => {
                let address = machine.address.clone().ok_or_else(|| {
                    ConfigError::Invalid(format!("network machine '{}' has no address", machine.name))
                })?;
                let connector = Arc::new(
                    TcpConnector::new(address, self.config.network.request_timeout()).with_token(machine.token.clone()),
                );
                self.attach_network(machine, connector).await
            }
        }
    }

    /// Connect `machine` and register it under its name.
    ///
    /// A disconnected machine already registered under the same name is
    /// replaced, which is how a device re-appears after a firmware upload.
    pub async fn attach_machine(&self, machine: Arc<dyn Machine>) -> Result<(), DispatchError> {
        let name = machine.name().to_string();
        let _reservation = self.reserve(&name)?;
        if !machine.state().is_connected() {
            machine.connect().await?;
        }
        if let Some(serial) = machine.serial_number() {
            self.note_device_returned(&serial);
        }
        self.machines.lock().insert(name.clone(), machine);
        tracing::info!(machine = %name, "machine attached");
        Ok(())
    }

    /// Claim `name` for one attach at a time.
    fn reserve(&self, name: &str) -> Result<Reservation<'_>, DispatchError> {
        let machines = self.machines.lock();
        let live = machines
            .get(name)
            .is_some_and(|existing| existing.state() != MachineState::Disconnected);
        if live || !self.attaching.lock().insert(name.to_string()) {
            return Err(DispatchError::Duplicate(name.to_string()));
        }
        Ok(Reservation {
            attaching: &self.attaching,
            name: name.to_string(),
        })
    }

    /// End the firmware-upload job waiting on a device that has come back.
    pub fn note_device_returned(&self, serial: &str) -> Option<JobId> {
        let job = self.firmware.remove(serial)?;
        match job.end(json!({ "serial_number": serial })) {
            Ok(()) => tracing::info!(serial_number = %serial, job_id = job.id(), "firmware upload complete"),
            Err(e) => tracing::warn!(serial_number = %serial, job_id = job.id(), "firmware job already finished: {}", e),
        }
        Some(job.id())
    }

    pub async fn detach(&self, name: &str) -> Result<(), DispatchError> {
        let machine = self
            .machines
            .lock()
            .remove(name)
            .ok_or_else(|| DispatchError::UnknownMachine(name.to_string()))?;
        machine.disconnect().await?;
        tracing::info!(machine = %name, "machine detached");
        Ok(())
    }

    /// Detach every machine.
    pub async fn shutdown(&self) {
        let machines: Vec<Arc<dyn Machine>> = self.machines.lock().drain().map(|(_, m)| m).collect();
        for machine in machines {
            if let Err(e) = machine.disconnect().await {
                tracing::warn!(machine = %machine.name(), "disconnect failed: {}", e);
            }
        }
    }

    pub fn machine(&self, name: &str) -> Option<Arc<dyn Machine>> {
        self.machines.lock().get(name).cloned()
    }

    pub fn machines(&self) -> Vec<Arc<dyn Machine>> {
        let mut machines: Vec<Arc<dyn Machine>> = self.machines.lock().values().cloned().collect();
        machines.sort_by(|a, b| a.name().cmp(b.name()));
        machines
    }

    pub fn job(&self, id: JobId) -> Option<Arc<Job>> {
        self.registry.get(id)
    }

    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.registry.jobs()
    }
}
