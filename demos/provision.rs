//! Command-line provisioning tool.
//!
//! Run with: cargo run --example provision -- scan
//!           cargo run --example provision -- provision --ssid MyWifi

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use wifi_provision_ble::{
    BtleplugTransport, Error, ProvisioningSession, Result, SessionConfig, SessionEvent,
    SessionState, DEFAULT_PERIPHERAL_NAME,
};

#[derive(Parser)]
#[command(name = "provision")]
#[command(about = "Send Wi-Fi credentials to a headless device over BLE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby provisioning devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Send Wi-Fi credentials to a device
    Provision {
        /// Network name
        #[arg(short, long)]
        ssid: String,
        /// Network password
        #[arg(short, long, env = "WIFI_PASSWORD", default_value = "")]
        password: String,
        /// Device name or identifier to provision
        #[arg(short, long, default_value = DEFAULT_PERIPHERAL_NAME)]
        device: String,
        /// Seconds to scan before giving up
        #[arg(long, default_value = "15")]
        scan_timeout: u64,
        /// Per-operation timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wifi_provision_ble=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { duration } => scan(duration).await,
        Commands::Provision {
            ssid,
            password,
            device,
            scan_timeout,
            timeout,
        } => {
            let config =
                SessionConfig::default().with_operation_timeout(Some(Duration::from_secs(timeout)));
            provision(config, &device, &ssid, &password, scan_timeout).await
        }
    }
}

async fn open_session(config: SessionConfig) -> Result<ProvisioningSession> {
    let (transport, events) = BtleplugTransport::new().await?;
    let session = ProvisioningSession::new(Arc::new(transport), config);
    let _ = session.spawn_event_pump(events);
    Ok(session)
}

async fn scan(duration: u64) -> Result<()> {
    let session = open_session(SessionConfig::default()).await?;

    let _handle = session.on_event(|event| {
        if let SessionEvent::DeviceFound(device) = event {
            println!("  {}", device);
        }
    });

    println!("Scanning for {} seconds...", duration);
    session.start().await?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    println!(
        "\nFound {} device(s)",
        session.discovered_devices().len()
    );
    session.reset().await;

    Ok(())
}

async fn provision(
    config: SessionConfig,
    pattern: &str,
    ssid: &str,
    password: &str,
    scan_timeout: u64,
) -> Result<()> {
    let session = open_session(config).await?;
    let mut events = session.subscribe();

    println!("Looking for \"{}\"...", pattern);
    session.start().await?;

    let deadline = tokio::time::sleep(Duration::from_secs(scan_timeout));
    tokio::pin!(deadline);

    let device = loop {
        tokio::select! {
            event = events.recv() => {
                if let Ok(SessionEvent::DeviceFound(device)) = event {
                    println!("  found {}", device);
                    if device.matches(pattern) {
                        break device;
                    }
                }
            }
            _ = &mut deadline => {
                session.reset().await;
                return Err(Error::UnknownDevice { identifier: pattern.to_string() });
            }
        }
    };

    session.select_device(&device.identifier).await?;

    loop {
        match session.current_state() {
            SessionState::Ready => break,
            SessionState::Failed => break,
            state => {
                println!("  {}", state);
                let _ = events.recv().await;
            }
        }
    }

    if session.current_state() == SessionState::Ready {
        println!("Sending credentials for \"{}\"", ssid);
        session.send_credentials(ssid, password).await?;
    }

    let outcome = session.wait_for_outcome().await;
    match &outcome {
        Ok(()) => println!("Provisioned {}", device),
        Err(e) => println!("Provisioning {} failed: {}", device, e),
    }

    session.reset().await;
    outcome
}
