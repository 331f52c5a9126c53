//! Configuration for a frontend server process
use frontend_listener::{ListenerConfig, SchedulerConfig};
use std::collections::HashMap;
use thiserror::Error;
use tracing_core::{
    LevelFilter,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    fs::File,
    io::BufReader,
};

#[derive(Clone,Debug,PartialEq,Eq,serde::Serialize,serde::Deserialize)]
#[serde(rename_all="lowercase")]
pub enum BuiltinLogTarget
{
    Stdout,
    Stderr,
}

#[derive(Clone,Debug,PartialEq,Eq,serde::Serialize,serde::Deserialize)]
#[serde(untagged)]
pub enum LogTarget
{
    File { filename: PathBuf },
    Builtin(BuiltinLogTarget),
}

#[derive(Clone,Copy,Debug,PartialEq,Eq,serde::Serialize,serde::Deserialize)]
#[serde(rename_all ="lowercase")]
pub enum LogLevel
{
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

#[derive(Clone,Copy,Debug,Default,PartialEq,Eq,serde::Serialize,serde::Deserialize)]
#[serde(rename_all ="lowercase")]
pub enum LogFormat
{
    #[default]
    Full,
    Compact,
    Pretty
}

#[derive(Clone,Debug,PartialEq,Eq,serde::Deserialize)]
pub struct LogEntry
{
    pub target: LogTarget,
    #[serde(default)]
    pub modules: Vec<String>,
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Clone,Debug,PartialEq,Eq,serde::Deserialize)]
#[serde(rename_all="kebab-case")]
pub struct LoggingConfig
{
    #[serde(default="default_log_dir")]
    pub dir: PathBuf,
    pub default_level: Option<LogLevel>,
    #[serde(default)]
    pub module_levels: HashMap<String, LogLevel>,
    pub targets: Vec<LogEntry>,
}

fn default_log_dir() -> PathBuf { PathBuf::from("log") }

impl Default for LoggingConfig
{
    fn default() -> Self
    {
        Self {
            dir: default_log_dir(),
            default_level: Some(LogLevel::Info),
            module_levels: HashMap::new(),
            targets: vec![LogEntry {
                target: LogTarget::Builtin(BuiltinLogTarget::Stderr),
                modules: Vec::new(),
                level: None,
                format: LogFormat::Full,
            }],
        }
    }
}

impl LoggingConfig
{
    pub fn prefix_file(&self, filename: impl AsRef<Path>) -> PathBuf
    {
        let mut path = self.dir.clone();
        path.push(filename);
        path
    }
}

/// Everything needed to assemble a [`FrontendServer`](crate::FrontendServer)
#[derive(Clone,Debug,PartialEq,Eq,serde::Deserialize)]
pub struct ServerConfig
{
    pub listener: ListenerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log: LoggingConfig,
}

/// Errors that could happen when loading a config
#[derive(Debug,Error)]
pub enum ConfigError
{
    #[error("I/O error on {1}: {0}")]
    IoError(std::io::Error, PathBuf),
    #[error("JSON parse error in {1}: {0}")]
    JsonError(serde_json::Error, PathBuf),
}

impl ServerConfig
{
    /// Load the server configuration from a given file path
    pub fn load_file<P: AsRef<Path>>(filename: P) -> Result<Self, ConfigError>
    {
        let filename = filename.as_ref();
        let file = File::open(filename).map_err(|e| ConfigError::IoError(e, filename.to_owned()))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| ConfigError::JsonError(e, filename.to_owned()))
    }
}

impl From<LogLevel> for LevelFilter
{
    fn from(arg: LogLevel) -> LevelFilter
    {
        match arg
        {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info  => LevelFilter::INFO,
            LogLevel::Warn  => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off   => LevelFilter::OFF,
        }
    }
}
