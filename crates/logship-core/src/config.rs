use crate::error::ShipError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for logship
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// General agent settings
    pub general: GeneralConfig,

    /// Input definitions
    #[serde(rename = "input")]
    pub inputs: Vec<InputConfig>,

    /// Output definitions
    #[serde(rename = "output")]
    pub outputs: Vec<OutputConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ShipError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ShipError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ShipError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ShipError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String, ShipError> {
        toml::to_string_pretty(self)
            .map_err(|e| ShipError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Reject configurations that would only fail at runtime: bad regexes,
    /// missing grouping patterns, empty host lists, unroutable outputs.
    pub fn validate(&self) -> Result<(), ShipError> {
        if self.outputs.is_empty() {
            return Err(ShipError::Config("No outputs configured".to_string()));
        }

        for input in &self.inputs {
            input.validate()?;
        }
        for output in &self.outputs {
            output.validate()?;
        }
        Ok(())
    }
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Internal log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Directory for position files
    pub libdir: String,

    /// Poll interval in milliseconds
    pub poll: u64,

    /// Maximum events pulled from an input per pass
    pub lines: usize,

    /// Seconds between wildcard re-expansion scans
    pub log_watch_interval: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            libdir: "/var/lib/logship".to_string(),
            poll: 500,
            lines: 100,
            log_watch_interval: 10,
        }
    }
}

impl GeneralConfig {
    /// The poll interval, clamped to the supported 100..9999 ms range.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.clamp(100, 9999))
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.log_watch_interval.max(1))
    }
}

/// A value that may be written as a scalar or an array in the config file.
/// Always treated as a list downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(v) => std::slice::from_ref(v),
            OneOrMany::Many(v) => v.as_slice(),
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

fn de_yes_no<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum YesNo {
        Bool(bool),
        Num(i64),
        Text(String),
    }

    match YesNo::deserialize(deserializer)? {
        YesNo::Bool(b) => Ok(b),
        YesNo::Num(n) => Ok(n != 0),
        YesNo::Text(s) => match s.to_lowercase().as_str() {
            "yes" | "1" | "true" => Ok(true),
            "no" | "0" | "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected yes|no|1|0, got {:?}",
                other
            ))),
        },
    }
}

fn yes() -> bool {
    true
}

/// Payload format of an input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Plain,
    Json,
}

/// A derived add_field rule: match a regex against a referenced field and
/// substitute the captures into a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddFieldRule {
    /// Name of the field to create
    pub key: String,

    /// Event field the regex is applied to
    #[serde(default = "default_rule_field")]
    pub field: String,

    /// Regex with capture groups
    #[serde(rename = "match")]
    pub match_regex: String,

    /// Template with $1..$9 capture references
    pub template: String,

    /// Value used when the regex does not match
    #[serde(default)]
    pub default: Option<String>,
}

fn default_rule_field() -> String {
    "line".to_string()
}

impl AddFieldRule {
    pub fn compile(&self) -> Result<Regex, ShipError> {
        Regex::new(&self.match_regex).map_err(|e| {
            ShipError::Config(format!(
                "add_field rule {:?}: bad regex {:?}: {}",
                self.key, self.match_regex, e
            ))
        })
    }
}

/// Settings shared by every input kind
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CommonInputConfig {
    /// Routing key. Optional for `format = json` inputs, whose events may
    /// carry their own type.
    #[serde(rename = "type")]
    pub event_type: Option<String>,

    pub format: PayloadFormat,

    pub tags: Vec<String>,

    /// Static fields merged into every event
    pub add_field: BTreeMap<String, String>,

    /// Derived fields evaluated per event
    #[serde(rename = "add_field_rule")]
    pub add_field_rules: Vec<AddFieldRule>,

    /// Worker count for this input's process group
    pub workers: Option<usize>,
}

/// Where a tailer starts when no usable position is saved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    Begin,
    #[default]
    End,
}

/// Multi-line grouping mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MultilineMode {
    #[default]
    SingleLine,
    Indented,
    IndentedGroup,
    PrefixGarbage,
    PrefixSuffix,
    OracleXml,
}

/// File tail input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInputConfig {
    #[serde(flatten)]
    pub common: CommonInputConfig,

    /// Paths or glob patterns to tail
    pub path: OneOrMany<String>,

    #[serde(default)]
    pub start_position: StartPosition,

    /// Persist `<inode>:<offset>` across restarts
    #[serde(default, deserialize_with = "de_yes_no")]
    pub save_position: bool,

    /// Lines matching any of these regexes are dropped before grouping
    #[serde(default)]
    pub skip: OneOrMany<String>,

    /// When set, only lines matching one of these regexes pass
    #[serde(default)]
    pub grep: OneOrMany<String>,

    #[serde(default)]
    pub multiline_mode: MultilineMode,

    #[serde(default)]
    pub multiline_prefix: Option<String>,

    #[serde(default)]
    pub multiline_suffix: Option<String>,

    #[serde(default)]
    pub multiline_garbage: Option<String>,

    #[serde(default)]
    pub multiline_indented_group: Option<String>,

    #[serde(default = "yes", deserialize_with = "de_yes_no")]
    pub multiline_drop_garbage: bool,
}

impl FileInputConfig {
    fn validate(&self) -> Result<(), ShipError> {
        if self.path.as_slice().is_empty() {
            return Err(ShipError::Config("file input has no path".to_string()));
        }
        for pattern in self.skip.as_slice().iter().chain(self.grep.as_slice()) {
            compile_named("skip/grep", pattern)?;
        }
        match self.multiline_mode {
            MultilineMode::SingleLine | MultilineMode::Indented | MultilineMode::OracleXml => {}
            MultilineMode::IndentedGroup | MultilineMode::PrefixGarbage
            | MultilineMode::PrefixSuffix => {
                if self.multiline_prefix.is_none() {
                    return Err(ShipError::Config(format!(
                        "multiline_mode {:?} requires multiline_prefix",
                        self.multiline_mode
                    )));
                }
            }
        }
        if self.multiline_mode == MultilineMode::PrefixSuffix && self.multiline_suffix.is_none() {
            return Err(ShipError::Config(
                "multiline_mode prefix-suffix requires multiline_suffix".to_string(),
            ));
        }
        for pattern in [
            &self.multiline_prefix,
            &self.multiline_suffix,
            &self.multiline_garbage,
            &self.multiline_indented_group,
        ]
        .into_iter()
        .flatten()
        {
            compile_named("multiline", pattern)?;
        }
        Ok(())
    }
}

/// TLS material for an endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub ssl_ca_file: Option<String>,
    pub ssl_cert_file: Option<String>,
    pub ssl_key_file: Option<String>,

    /// Accept any server certificate. For self-signed test rigs only.
    pub tls_skip_verify: bool,
}

/// DEFLATE framing wrapper used on the Lumberjack compressed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionWrapper {
    #[default]
    Zlib,
    Raw,
}

/// Lumberjack listener input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LumberjackInputConfig {
    #[serde(flatten)]
    pub common: CommonInputConfig,

    #[serde(default = "default_bind")]
    pub host: String,

    pub port: u16,

    #[serde(flatten)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub compression_wrapper: CompressionWrapper,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

impl LumberjackInputConfig {
    fn validate(&self) -> Result<(), ShipError> {
        if self.port == 0 {
            return Err(ShipError::Config("lumberjack input has no port".to_string()));
        }
        if self.tls.ssl_cert_file.is_none() || self.tls.ssl_key_file.is_none() {
            return Err(ShipError::Config(
                "lumberjack input requires ssl_cert_file and ssl_key_file".to_string(),
            ));
        }
        Ok(())
    }
}

/// Input definitions, dispatched on the `input` key. An unknown kind is a
/// configuration error at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "input", rename_all = "lowercase")]
pub enum InputConfig {
    File(FileInputConfig),
    Lumberjack(LumberjackInputConfig),
}

impl InputConfig {
    pub fn common(&self) -> &CommonInputConfig {
        match self {
            InputConfig::File(c) => &c.common,
            InputConfig::Lumberjack(c) => &c.common,
        }
    }

    /// File inputs are forced to a single worker: tailer state is per file.
    pub fn workers(&self) -> usize {
        match self {
            InputConfig::File(_) => 1,
            InputConfig::Lumberjack(c) => c.common.workers.unwrap_or(1).max(1),
        }
    }

    fn validate(&self) -> Result<(), ShipError> {
        for rule in &self.common().add_field_rules {
            rule.compile()?;
        }
        match self {
            InputConfig::File(c) => c.validate(),
            InputConfig::Lumberjack(c) => c.validate(),
        }
    }
}

/// Settings shared by every output kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonOutputConfig {
    /// Routing keys this output accepts. Scalars, arrays and comma-separated
    /// strings are all accepted; `*` matches any type.
    #[serde(rename = "type")]
    pub types: OneOrMany<String>,
}

impl CommonOutputConfig {
    /// The normalized routing key list.
    pub fn routing_keys(&self) -> Vec<String> {
        self.types
            .as_slice()
            .iter()
            .flat_map(|t| t.split(','))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Lumberjack client output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LumberjackOutputConfig {
    #[serde(flatten)]
    pub common: CommonOutputConfig,

    pub host: OneOrMany<String>,

    pub port: u16,

    /// Per-send timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Per-connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "yes", deserialize_with = "de_yes_no")]
    pub persistent: bool,

    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Maximum events per batch; 0 sends single JSON-encoded events
    #[serde(default = "default_max_window_size")]
    pub max_window_size: usize,

    /// Wire protocol version, 1 or 2
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,

    #[serde(default = "yes", deserialize_with = "de_yes_no")]
    pub compression: bool,

    #[serde(default)]
    pub compression_wrapper: CompressionWrapper,

    #[serde(flatten)]
    pub tls: TlsConfig,
}

fn default_timeout() -> u64 {
    10
}

fn default_window_size() -> u32 {
    100
}

fn default_max_window_size() -> usize {
    100
}

fn default_protocol_version() -> u8 {
    1
}

/// Plain socket output, newline-delimited JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketOutputConfig {
    #[serde(flatten)]
    pub common: CommonOutputConfig,

    pub host: OneOrMany<String>,

    pub port: u16,

    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "yes", deserialize_with = "de_yes_no")]
    pub persistent: bool,
}

/// Foreground diagnostic channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenOutputConfig {
    #[serde(flatten)]
    pub common: CommonOutputConfig,

    #[serde(default)]
    pub send_to: ScreenTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScreenTarget {
    #[default]
    Stdout,
    Stderr,
}

/// Append-mode JSON-lines file output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutputConfig {
    #[serde(flatten)]
    pub common: CommonOutputConfig,

    pub path: String,
}

/// Output definitions, dispatched on the `output` key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "output", rename_all = "lowercase")]
pub enum OutputConfig {
    Lumberjack(LumberjackOutputConfig),
    Socket(SocketOutputConfig),
    Screen(ScreenOutputConfig),
    File(FileOutputConfig),
}

impl OutputConfig {
    pub fn routing_keys(&self) -> Vec<String> {
        match self {
            OutputConfig::Lumberjack(c) => c.common.routing_keys(),
            OutputConfig::Socket(c) => c.common.routing_keys(),
            OutputConfig::Screen(c) => c.common.routing_keys(),
            OutputConfig::File(c) => c.common.routing_keys(),
        }
    }

    fn validate(&self) -> Result<(), ShipError> {
        if self.routing_keys().is_empty() {
            return Err(ShipError::Config(
                "output has no routing type; use \"*\" to match any".to_string(),
            ));
        }
        match self {
            OutputConfig::Lumberjack(c) => {
                if c.host.as_slice().is_empty() {
                    return Err(ShipError::Config("lumberjack output has no host".to_string()));
                }
                if c.port == 0 {
                    return Err(ShipError::Config("lumberjack output has no port".to_string()));
                }
                if !matches!(c.protocol_version, 1 | 2) {
                    return Err(ShipError::Config(format!(
                        "unsupported lumberjack protocol_version {}",
                        c.protocol_version
                    )));
                }
                if c.window_size == 0 {
                    return Err(ShipError::Config("window_size must be at least 1".to_string()));
                }
                if c.max_window_size as u64 > c.window_size as u64 {
                    return Err(ShipError::Config(
                        "max_window_size cannot exceed window_size".to_string(),
                    ));
                }
            }
            OutputConfig::Socket(c) => {
                if c.host.as_slice().is_empty() || c.port == 0 {
                    return Err(ShipError::Config("socket output needs host and port".to_string()));
                }
            }
            OutputConfig::Screen(_) => {}
            OutputConfig::File(c) => {
                if c.path.is_empty() {
                    return Err(ShipError::Config("file output has no path".to_string()));
                }
            }
        }
        Ok(())
    }
}

fn compile_named(what: &str, pattern: &str) -> Result<Regex, ShipError> {
    Regex::new(pattern)
        .map_err(|e| ShipError::Config(format!("{} regex {:?}: {}", what, pattern, e)))
}
