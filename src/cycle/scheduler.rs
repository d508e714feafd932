use log::{error, info};
use std::future::Future;
use std::time::Duration;

use super::CycleManager;
use crate::config::{interpolate_parameters, ConfigError, GeneralConfig, ParameterConfig};
use crate::metering_62056::MeterTransport;
use crate::mqtt::MessageBus;

/// Runs cycles until `shutdown` resolves, or once in oneshot mode. A failed
/// cycle is logged and the next one follows after the usual delay.
///
/// Expressions are resolved from `parameters` before every cycle, so date
/// based arguments follow the clock. Failing to resolve them is returned as
/// an error since they were validated when the configuration was loaded.
pub async fn run<T, B, F>(manager: &mut CycleManager<T, B>, general: &GeneralConfig,
                          parameters: &[ParameterConfig], shutdown: F) -> Result<(), ConfigError>
where
    T: MeterTransport,
    B: MessageBus,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let delay = Duration::from_secs(general.intercycle_delay);

    loop {
        let cycle_parameters = interpolate_parameters(parameters)?;

        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested, stopping cycles");
                return Ok(());
            },
            result = manager.run_cycle(&cycle_parameters) => {
                if let Err(e) = result {
                    error!("Got error while processing, skipping to next cycle: {e}");
                }
            },
        }

        if general.oneshot {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested, stopping cycles");
                return Ok(());
            },
            _ = tokio::time::sleep(delay) => {},
        }
    }
}
