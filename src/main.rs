use clap::Parser;
use energomera2mqtt::config::DEFAULT_CONFIG_FILE;
use energomera2mqtt::cycle::scheduler;
use energomera2mqtt::{Config, CycleManager, Iec62056Client, MqttBus};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about = "Energomera meter to MQTT bridge")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config_file: PathBuf,
}

fn init_logging(default_level: &str) {
    let default_filter = std::env::var("E2M_LOG_LEVEL").unwrap_or(default_level.to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config_file) {
        Ok(c) => c,
        Err(e) => {
            init_logging("error");
            error!("Unable to load configuration from {}: {e}", args.config_file.display());
            return ExitCode::FAILURE;
        }
    };

    /* Level names were validated on load */
    let level = config.general.log_level_filter().map(|l| l.as_str().to_lowercase()).unwrap_or("error".to_string());
    init_logging(&level);
    info!("Starting energomera2mqtt with configuration {:?}", config);

    let transport = Iec62056Client::new(&config.meter.port, &config.meter.password,
                                        Duration::from_secs(config.meter.timeout));
    let bus = MqttBus::new(&config.mqtt, Duration::from_secs(config.general.intercycle_delay));
    let mut manager = CycleManager::new(transport, bus, &config.mqtt.hass_discovery_prefix);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
    };

    let result = scheduler::run(&mut manager, &config.general, &config.parameters, shutdown).await;

    info!("Shutting down");
    manager.finalize().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
