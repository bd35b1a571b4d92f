use crate::prompts::SnapshotPolicy;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub prediction_service: PredictionServiceConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

fn deserialize_device<'de, D>(deserializer: D) -> Result<DeviceSelector, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PredictionServiceConfig {
    /// WebSocket endpoint of the prediction service, e.g. `ws://127.0.0.1:5000/ws`.
    pub url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Frames waiting for the socket beyond this are dropped.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    10
}

fn default_outbound_capacity() -> usize {
    4
}

impl PredictionServiceConfig {
    pub fn get_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct CameraConfig {
    #[serde(
        default = "default_device",
        deserialize_with = "deserialize_device"
    )]
    pub device: DeviceSelector,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_tick_timeout_ms")]
    pub tick_timeout_ms: u64,
    #[serde(default = "default_stream_fps")]
    pub stream_fps: u64,
}

fn default_device() -> DeviceSelector {
    DeviceSelector::TestPattern
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_capture_interval_ms() -> u64 {
    600
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_tick_timeout_ms() -> u64 {
    2400
}

fn default_stream_fps() -> u64 {
    30
}

fn fps_to_delay_ms(fps: u64) -> u64 {
    (1000.0 / fps.max(1) as f64).round() as u64
}

impl CameraConfig {
    pub fn get_capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms.max(1))
    }

    /// How long one capture tick may take before it is abandoned.
    pub fn get_tick_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_timeout_ms.max(1))
    }

    pub fn get_stream_delay_ms(&self) -> u64 {
        fps_to_delay_ms(self.stream_fps)
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            width: default_width(),
            height: default_height(),
            capture_interval_ms: default_capture_interval_ms(),
            jpeg_quality: default_jpeg_quality(),
            tick_timeout_ms: default_tick_timeout_ms(),
            stream_fps: default_stream_fps(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptsConfig {
    #[serde(default)]
    pub snapshot_policy: SnapshotPolicy,
}

/// Which media device backs the camera session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    TestPattern,
    Webcam(i32),
}

impl TryFrom<String> for DeviceSelector {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.trim().to_lowercase().as_str() {
            "test_pattern" | "test-pattern" => Ok(Self::TestPattern),
            other => other.parse::<i32>().map(Self::Webcam).map_err(|_| {
                format!(
                    "{} is not a supported camera device. Use `test_pattern` or a webcam index.",
                    other
                )
            }),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("LA")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}
