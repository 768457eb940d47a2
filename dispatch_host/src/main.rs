use clap::Parser;
use dispatch_host::communication::serial::available_ports;
use dispatch_host::config::{Config, MachineConfig, load_config};
use dispatch_host::dispatcher::{DispatchError, Dispatcher};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "dispatch-host", version, about = "Dispatches print jobs to attached 3D printers")]
struct Args {
    /// Configuration file
    #[arg(default_value = "dispatch.toml")]
    config: String,
    /// Attach simulated devices instead of real ones
    #[arg(long)]
    simulate: bool,
    /// Log at debug level regardless of configuration
    #[arg(short, long)]
    verbose: bool,
    /// Print the serial ports known to the OS and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();
    if args.list_ports {
        for port in available_ports() {
            println!("{}", port);
        }
        return Ok(());
    }

    let config: Config = load_config(&args.config).map_err(|e| {
        eprintln!("Failed to load config from '{}': {}", args.config, e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        config.logging.level.parse().unwrap_or(tracing::Level::INFO)
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %args.config, "starting dispatch host");

    let dispatcher = Arc::new(Dispatcher::new(config.clone()));
    let mut events = dispatcher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::debug!(target: "dispatch_events", "{}", json),
                    Err(e) => tracing::warn!("could not serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for machine in &config.machines {
        let attached = if args.simulate {
            attach_simulated(&dispatcher, machine).await
        } else {
            dispatcher.attach_from_config(machine).await.map(|_| ())
        };
        match attached {
            Ok(()) => tracing::info!(machine = %machine.name, kind = ?machine.kind, "ready"),
            Err(e) => tracing::error!(machine = %machine.name, "could not attach: {}", e),
        }
    }
    if dispatcher.machines().is_empty() {
        tracing::warn!("no machines attached");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    dispatcher.shutdown().await;
    Ok(())
}

#[cfg(feature = "sim-in-host")]
async fn attach_simulated(dispatcher: &Dispatcher, machine: &MachineConfig) -> Result<(), DispatchError> {
    use dispatch_host::config::MachineKind;
    use dispatch_simulator::{SimNetworkDevice, SimSerialDevice};

    match machine.kind {
        MachineKind::Serial => {
            let profile = dispatcher.config().profile(&machine.profile)?;
            let port = machine.port.clone().unwrap_or_else(|| format!("sim:{}", machine.name));
            let device = SimSerialDevice::with_layout(port, profile.tool_count, profile.heated_platform);
            device.set_serial_number(machine.serial_number.clone());
            dispatcher.attach_serial(machine, Arc::new(device), None).await?;
        }
        MachineKind::Network => {
            let address = machine.address.clone().unwrap_or_else(|| format!("sim:{}", machine.name));
            dispatcher.attach_network(machine, Arc::new(SimNetworkDevice::new(address))).await?;
        }
    }
    Ok(())
}

#[cfg(not(feature = "sim-in-host"))]
async fn attach_simulated(_dispatcher: &Dispatcher, machine: &MachineConfig) -> Result<(), DispatchError> {
    Err(DispatchError::Config(dispatch_host::config::ConfigError::Invalid(format!(
        "cannot simulate '{}': built without the sim-in-host feature",
        machine.name
    ))))
}
