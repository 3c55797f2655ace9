//! Validated, immutable configuration.
//!
//! Loaded from a YAML file (§6 of the specification) and patched with
//! environment variable overrides before validation. Once constructed, a
//! [`HagConfig`] is immutable and shareable across tasks without
//! synchronization.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HagError;

const TEMP_DOMAIN_MIN: f64 = -50.0;
const TEMP_DOMAIN_MAX: f64 = 60.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HagConfig {
    pub app_options: AppOptions,
    pub hass_options: HassOptions,
    pub hvac_options: HvacOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppOptions {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub use_ai: bool,
    pub ai_model: Option<String>,
    pub ai_temperature: Option<f64>,
    pub openai_api_key: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HassOptions {
    pub ws_url: String,
    pub rest_url: String,
    pub token: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_state_check_interval")]
    pub state_check_interval: u64,
    pub timeout_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_state_check_interval() -> u64 {
    300_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    Auto,
    HeatOnly,
    CoolOnly,
    Off,
}

impl SystemMode {
    pub fn allows_heat(self) -> bool {
        matches!(self, SystemMode::Auto | SystemMode::HeatOnly)
    }

    pub fn allows_cool(self) -> bool {
        matches!(self, SystemMode::Auto | SystemMode::CoolOnly)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HvacUnitDescriptor {
    pub entity_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub defrost: bool,
}

fn default_true() -> bool {
    true
}

impl HvacUnitDescriptor {
    /// The unit name extracted from `climate.<name>`.
    pub fn unit_name(&self) -> Option<&str> {
        self.entity_id.split_once('.').map(|(_, name)| name)
    }

    /// The unit's own derived room-temperature sensor, `sensor.<name>_temperature`.
    pub fn derived_sensor_id(&self) -> Option<String> {
        self.unit_name().map(|name| format!("sensor.{name}_temperature"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureThresholds {
    pub indoor_min: f64,
    pub indoor_max: f64,
    pub outdoor_min: f64,
    pub outdoor_max: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefrostParams {
    pub temperature_threshold: f64,
    pub period_seconds: u64,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatingParams {
    pub temperature: f64,
    pub preset_mode: String,
    pub temperature_thresholds: TemperatureThresholds,
    pub defrost: Option<DefrostParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoolingParams {
    pub temperature: f64,
    pub preset_mode: String,
    pub temperature_thresholds: TemperatureThresholds,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveHours {
    pub start: u8,
    pub start_weekday: u8,
    pub end: u8,
}

impl ActiveHours {
    /// Whether `hour` falls within the active window for the given weekday flag.
    /// Both ends of the window are inclusive; a window spanning midnight
    /// (`effective_start > end`) wraps around.
    pub fn contains(&self, hour: u8, is_weekday: bool) -> bool {
        let effective_start = if is_weekday { self.start_weekday } else { self.start };
        if effective_start <= self.end {
            hour >= effective_start && hour <= self.end
        } else {
            hour >= effective_start || hour <= self.end
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HvacOptions {
    pub temp_sensor: String,
    pub outdoor_sensor: String,
    pub system_mode: SystemMode,
    pub hvac_entities: Vec<HvacUnitDescriptor>,
    pub heating: HeatingParams,
    pub cooling: CoolingParams,
    pub active_hours: Option<ActiveHours>,
    #[serde(default = "default_evaluation_cache_ms")]
    pub evaluation_cache_ms: u64,
}

fn default_evaluation_cache_ms() -> u64 {
    100
}

impl HagConfig {
    /// Load configuration from a YAML file, apply environment overrides, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HagError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HagError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;

        let mut config: HagConfig = serde_yaml::from_str(&contents)
            .map_err(|e| HagError::Configuration(format!("failed to parse {}: {e}", path.display())))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Patch fields from recognized environment variables, per §6.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("HASS_WS_URL") {
            self.hass_options.ws_url = v;
        }
        if let Ok(v) = env::var("HASS_REST_URL") {
            self.hass_options.rest_url = v;
        }
        if let Ok(v) = env::var("HASS_TOKEN") {
            self.hass_options.token = v;
        }
        if let Ok(v) = env::var("HASS_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.hass_options.max_retries = n;
            }
        }
        if let Ok(v) = env::var("HAG_LOG_LEVEL") {
            self.app_options.log_level = v;
        }
        if let Ok(v) = env::var("HAG_USE_AI") {
            if let Ok(b) = v.parse() {
                self.app_options.use_ai = b;
            }
        }
        if let Ok(v) = env::var("HAG_AI_MODEL") {
            self.app_options.ai_model = Some(v);
        }
        if let Ok(v) = env::var("OPENAI_API_KEY") {
            self.app_options.openai_api_key = Some(v);
        }
        if let Ok(v) = env::var("HAG_TEMP_SENSOR") {
            self.hvac_options.temp_sensor = v;
        }
        if let Ok(v) = env::var("HAG_OUTDOOR_SENSOR") {
            self.hvac_options.outdoor_sensor = v;
        }
        if let Ok(v) = env::var("HAG_SYSTEM_MODE") {
            if let Some(mode) = parse_system_mode(&v) {
                self.hvac_options.system_mode = mode;
            }
        }
        // HAG_CONFIG_FILE is consumed by the caller before `load` is invoked,
        // to select which file to read in the first place.
    }

    /// Validate every invariant from §3. Returns the first violation found.
    pub fn validate(&self) -> Result<(), HagError> {
        let h = &self.hvac_options.heating.temperature_thresholds;
        let c = &self.hvac_options.cooling.temperature_thresholds;

        if h.indoor_min >= h.indoor_max {
            return Err(HagError::Configuration(
                "heating indoorMin must be < indoorMax".into(),
            ));
        }
        if h.outdoor_min >= h.outdoor_max {
            return Err(HagError::Configuration(
                "heating outdoorMin must be < outdoorMax".into(),
            ));
        }
        if c.indoor_min >= c.indoor_max {
            return Err(HagError::Configuration(
                "cooling indoorMin must be < indoorMax".into(),
            ));
        }
        if c.outdoor_min >= c.outdoor_max {
            return Err(HagError::Configuration(
                "cooling outdoorMin must be < outdoorMax".into(),
            ));
        }

        for (label, value) in [
            ("heating.indoorMin", h.indoor_min),
            ("heating.indoorMax", h.indoor_max),
            ("heating.outdoorMin", h.outdoor_min),
            ("heating.outdoorMax", h.outdoor_max),
            ("cooling.indoorMin", c.indoor_min),
            ("cooling.indoorMax", c.indoor_max),
            ("cooling.outdoorMin", c.outdoor_min),
            ("cooling.outdoorMax", c.outdoor_max),
            ("heating.temperature", self.hvac_options.heating.temperature),
            ("cooling.temperature", self.hvac_options.cooling.temperature),
        ] {
            if !value.is_finite() || value < TEMP_DOMAIN_MIN || value > TEMP_DOMAIN_MAX {
                return Err(HagError::Configuration(format!(
                    "{label} ({value}) must be a finite value in [{TEMP_DOMAIN_MIN}, {TEMP_DOMAIN_MAX}]"
                )));
            }
        }

        if let Some(active_hours) = &self.hvac_options.active_hours {
            for (label, hour) in [
                ("activeHours.start", active_hours.start),
                ("activeHours.startWeekday", active_hours.start_weekday),
                ("activeHours.end", active_hours.end),
            ] {
                if hour > 23 {
                    return Err(HagError::Configuration(format!(
                        "{label} ({hour}) must be in [0, 23]"
                    )));
                }
            }
        }

        if self.hvac_options.evaluation_cache_ms > 5000 {
            return Err(HagError::Configuration(
                "evaluationCacheMs must be in [0, 5000]".into(),
            ));
        }

        for unit in &self.hvac_options.hvac_entities {
            if unit.entity_id.matches('.').count() != 1 {
                return Err(HagError::Configuration(format!(
                    "hvac entity id '{}' must contain exactly one '.'",
                    unit.entity_id
                )));
            }
        }

        if let Some(defrost) = &self.hvac_options.heating.defrost {
            if !defrost.temperature_threshold.is_finite()
                || defrost.temperature_threshold < TEMP_DOMAIN_MIN
                || defrost.temperature_threshold > TEMP_DOMAIN_MAX
            {
                return Err(HagError::Configuration(
                    "defrost.temperatureThreshold out of domain range".into(),
                ));
            }
        }

        Ok(())
    }
}

fn parse_system_mode(s: &str) -> Option<SystemMode> {
    match s {
        "auto" => Some(SystemMode::Auto),
        "heat_only" => Some(SystemMode::HeatOnly),
        "cool_only" => Some(SystemMode::CoolOnly),
        "off" => Some(SystemMode::Off),
        _ => None,
    }
}
