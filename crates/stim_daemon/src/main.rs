mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use log::{error, info};

use link::{
    LinkConfig, LinkSupervisor, MockDevice, MockDeviceConfig, MockPortProvider, MockSignal,
    PortProvider, SystemPorts,
};
use stim_types::{LinkEvent, Subscribe};

use crate::config::load_config;

/// Logs every subscriber event; stands in for an attached client.
struct LogSubscriber;

impl Subscribe for LogSubscriber {
    fn name(&self) -> &'static str {
        "log"
    }

    fn on_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::StreamData(sample) => log::trace!(
                "sample ts={} {:.3} uV",
                sample.device_timestamp,
                sample.microvolts
            ),
            other => info!("link event: {}", other.name()),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Command::new("stim_daemon")
        .about("Closed-loop neurostimulation link daemon")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .default_value("./config.json")
                .help("Path to the JSON configuration file"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PATH")
                .help("Serial device path (skips enumeration)"),
        )
        .arg(
            Arg::new("csv-dir")
                .long("csv-dir")
                .value_name("DIR")
                .help("Directory for the rolling CSV sample logs"),
        )
        .arg(
            Arg::new("mock")
                .long("mock")
                .action(ArgAction::SetTrue)
                .help("Run against the in-process mock device"),
        )
        .arg(
            Arg::new("stream")
                .long("stream")
                .action(ArgAction::SetTrue)
                .help("Start streaming as soon as the link is up"),
        )
        .get_matches();

    env_logger::init();
    info!("stim daemon starting...");

    let config_path = matches
        .get_one::<String>("config")
        .expect("config has a default value");
    let mut daemon_config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = matches.get_one::<String>("port") {
        daemon_config.port = Some(port.clone());
    }
    if let Some(dir) = matches.get_one::<String>("csv-dir") {
        daemon_config.recordings_directory = dir.clone();
    }

    let link_config = LinkConfig {
        csv_dir: PathBuf::from(&daemon_config.recordings_directory),
        csv_debug_format: daemon_config.csv_debug_format,
        predict_rate: daemon_config.predict_rate,
        prediction_history: daemon_config.prediction_history,
        ..LinkConfig::default()
    };

    // The mock device must outlive the supervisor that talks to it.
    let mut mock_device: Option<MockDevice> = None;
    let ports: Arc<dyn PortProvider> = if matches.get_flag("mock") {
        info!("using the in-process mock device");
        let device = MockDevice::spawn(MockDeviceConfig {
            signal: MockSignal::Seizure,
            ..MockDeviceConfig::default()
        });
        let provider = MockPortProvider::new(device.host_port());
        mock_device = Some(device);
        Arc::new(provider)
    } else {
        Arc::new(SystemPorts::new(daemon_config.port.clone()))
    };

    let supervisor = LinkSupervisor::new(link_config, ports);
    supervisor.subscribe(Arc::new(LogSubscriber));

    if let Err(e) = supervisor.start().await {
        error!("unable to establish the device link: {}", e);
        return ExitCode::from(1);
    }

    if matches.get_flag("stream") {
        if let Err(refused) = supervisor.start_streaming() {
            error!("unable to start streaming: {}", refused);
        }
    }

    info!("link is up; press Ctrl+C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("unable to wait for the shutdown signal: {}", e);
    }

    info!("shutdown requested");
    supervisor.stop().await;
    drop(mock_device);
    ExitCode::SUCCESS
}
