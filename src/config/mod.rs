pub mod interpolate;

use chrono::{Local, NaiveDate};
use log::{debug, LevelFilter};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs;
use std::path::Path;
use thiserror::Error;

use self::interpolate::{interpolate_at, ExpressionError};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/energomera/config.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Error loading configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error parsing configuration file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("'parameters' should not be empty if 'general.include_default_parameters' is not enabled")]
    EmptyParameters,
    #[error("Invalid logging level '{0}' - should be one of critical, error, warning, info, debug")]
    InvalidLoggingLevel(String),
    #[error("Invalid expression in parameter '{address}': {source}")]
    Expression { address: String, source: ExpressionError },
}

fn general_oneshot_default() -> bool { return false }
fn general_intercycle_delay_default() -> u64 { return 30 }
fn general_logging_level_default() -> String { return "error".to_string() }
fn general_include_default_parameters_default() -> bool { return false }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct GeneralConfig {
    #[serde(default="general_oneshot_default")]
    pub oneshot: bool,
    /* Seconds between two meter cycles */
    #[serde(default="general_intercycle_delay_default")]
    pub intercycle_delay: u64,
    #[serde(default="general_logging_level_default")]
    pub logging_level: String,
    #[serde(default="general_include_default_parameters_default")]
    pub include_default_parameters: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        return GeneralConfig {
            oneshot: general_oneshot_default(),
            intercycle_delay: general_intercycle_delay_default(),
            logging_level: general_logging_level_default(),
            include_default_parameters: general_include_default_parameters_default(),
        }
    }
}

impl GeneralConfig {
    pub fn log_level_filter(&self) -> Result<LevelFilter, ConfigError> {
        match self.logging_level.as_str() {
            "critical" | "error" => Ok(LevelFilter::Error),
            "warning" => Ok(LevelFilter::Warn),
            "info" => Ok(LevelFilter::Info),
            "debug" => Ok(LevelFilter::Debug),
            other => Err(ConfigError::InvalidLoggingLevel(other.to_string())),
        }
    }
}

fn meter_timeout_default() -> u64 { return 30 }

#[derive(Deserialize, Serialize, Clone)]
pub struct MeterConfig {
    pub port: String,
    pub password: String,
    /* Seconds to wait for the meter to respond */
    #[serde(default="meter_timeout_default")]
    pub timeout: u64,
}

// Keep the password out of the startup dump
impl std::fmt::Debug for MeterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeterConfig")
            .field("port", &self.port)
            .field("password", &"********")
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_discovery_prefix_default() -> String { return "homeassistant".to_string() }
fn mqtt_tls_default() -> bool { return true }
fn mqtt_client_id_default() -> String { return format!("energomera2mqtt-{}", uuid::Uuid::new_v4()) }

#[derive(Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    #[serde(default="mqtt_discovery_prefix_default")]
    pub hass_discovery_prefix: String,
    #[serde(default="mqtt_tls_default")]
    pub tls: bool,
    #[serde(default="mqtt_client_id_default")]
    pub client_id: String,
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("hass_discovery_prefix", &self.hass_discovery_prefix)
            .field("tls", &self.tls)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Label(s) of the entities produced by a parameter: one for all of them, or
/// one per position in a multi-value response.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum ParameterName {
    Single(String),
    PerIndex(Vec<String>),
}

impl From<&str> for ParameterName {
    fn from(name: &str) -> Self {
        ParameterName::Single(name.to_string())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ParameterConfig {
    pub address: String,
    pub name: ParameterName,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub unit: Option<String>,
    /* Argument to the read command, may hold expressions */
    pub additional_data: Option<String>,
    /* Used instead of the address when building unique ids */
    pub entity_name: Option<String>,
    pub response_idx: Option<usize>,
}

impl ParameterConfig {
    /// Returns a copy with every expression resolved against `today`.
    pub fn interpolated_at(&self, today: NaiveDate) -> Result<ParameterConfig, ConfigError> {
        let expr = |value: &str| {
            interpolate_at(value, today).map_err(|source| ConfigError::Expression {
                address: self.address.clone(),
                source,
            })
        };
        let opt_expr = |value: &Option<String>| -> Result<Option<String>, ConfigError> {
            match value {
                Some(v) => Ok(Some(expr(v)?)),
                None => Ok(None),
            }
        };

        let name = match &self.name {
            ParameterName::Single(n) => ParameterName::Single(expr(n)?),
            ParameterName::PerIndex(names) => ParameterName::PerIndex(
                names.iter().map(|n| expr(n)).collect::<Result<Vec<_>, _>>()?
            ),
        };

        return Ok(ParameterConfig {
            address: expr(&self.address)?,
            name,
            device_class: opt_expr(&self.device_class)?,
            state_class: opt_expr(&self.state_class)?,
            unit: opt_expr(&self.unit)?,
            additional_data: opt_expr(&self.additional_data)?,
            entity_name: opt_expr(&self.entity_name)?,
            response_idx: self.response_idx,
        });
    }
}

/// Resolves expressions of all parameters. Always called with the parameters
/// as loaded, never with an already interpolated copy.
pub fn interpolate_parameters_at(params: &[ParameterConfig], today: NaiveDate) -> Result<Vec<ParameterConfig>, ConfigError> {
    params.iter().map(|p| p.interpolated_at(today)).collect()
}

pub fn interpolate_parameters(params: &[ParameterConfig]) -> Result<Vec<ParameterConfig>, ConfigError> {
    interpolate_parameters_at(params, Local::now().date_naive())
}

fn default_parameter(address: &str, name: ParameterName, device_class: &str, state_class: &str, unit: &str) -> ParameterConfig {
    return ParameterConfig {
        address: address.to_string(),
        name,
        device_class: Some(device_class.to_string()),
        state_class: Some(state_class.to_string()),
        unit: Some(unit.to_string()),
        additional_data: None,
        entity_name: None,
        response_idx: None,
    }
}

fn phases(base: &str) -> ParameterName {
    ParameterName::PerIndex(
        ["A", "B", "C"].iter().map(|p| format!("{base}, phase {p}")).collect()
    )
}

/// Parameters read when `general.include_default_parameters` is set, they
/// cover the common CE301/CE303 readings.
pub fn default_parameters() -> Vec<ParameterConfig> {
    let mut cumulative = default_parameter("ET0PE", "Cumulative energy".into(), "energy", "total_increasing", "kWh");
    cumulative.response_idx = Some(0);

    let mut monthly = default_parameter("ECMPE", "Monthly energy".into(), "energy", "total", "kWh");
    monthly.response_idx = Some(0);

    let mut cumulative_prev = default_parameter("ENMPE", "Cumulative energy, previous month".into(), "energy", "total_increasing", "kWh");
    cumulative_prev.response_idx = Some(0);
    cumulative_prev.additional_data = Some("{{ energomera_prev_month }}".to_string());
    cumulative_prev.entity_name = Some("ENMPE_PREV_MONTH".to_string());

    let mut monthly_prev = default_parameter("EAMPE", "Previous month energy".into(), "energy", "total", "kWh");
    monthly_prev.response_idx = Some(0);
    monthly_prev.additional_data = Some("{{ energomera_prev_month }}".to_string());
    monthly_prev.entity_name = Some("ECMPE_PREV_MONTH".to_string());

    let mut daily = default_parameter("ECDPE", "Daily energy".into(), "energy", "total", "kWh");
    daily.response_idx = Some(0);

    return vec![
        cumulative,
        monthly,
        cumulative_prev,
        monthly_prev,
        daily,
        default_parameter("POWPP", phases("Active energy"), "power", "measurement", "kW"),
        default_parameter("POWEP", "Active energy".into(), "power", "measurement", "kW"),
        default_parameter("VOLTA", phases("Voltage"), "voltage", "measurement", "V"),
        default_parameter("VNULL", "Neutral voltage".into(), "voltage", "measurement", "V"),
        default_parameter("CURRE", phases("Current"), "current", "measurement", "A"),
        default_parameter("FREQU", "Frequency".into(), "frequency", "measurement", "Hz"),
    ];
}

fn general_default() -> GeneralConfig { return GeneralConfig::default() }
fn parameters_default() -> Vec<ParameterConfig> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default="general_default")]
    pub general: GeneralConfig,
    pub meter: MeterConfig,
    pub mqtt: MqttConfig,
    #[serde(default="parameters_default")]
    pub parameters: Vec<ParameterConfig>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        debug!("Read configuration from {}", path.as_ref().display());
        return Config::from_yaml(&contents);
    }

    /// Parses and validates the configuration, merging in the built-in
    /// parameters if requested.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let mut c: Config = serde_yml::from_str(contents)?;

        c.general.log_level_filter()?;

        if c.parameters.is_empty() && !c.general.include_default_parameters {
            return Err(ConfigError::EmptyParameters);
        }

        if c.general.include_default_parameters {
            let mut params = default_parameters();
            params.append(&mut c.parameters);
            c.parameters = params;
        }

        /* Trial run so broken expressions are reported at startup */
        interpolate_parameters(&c.parameters)?;

        return Ok(c);
    }
}
