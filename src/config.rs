use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::hub::DEFAULT_CLIENT_BUFFER;
use crate::worker::EngineConfig;
use crate::{DEFAULT_TRANSCRIPTIONS_DIR, DEFAULT_UPLOADS_DIR};

#[derive(Parser, Debug, Clone)]
#[command(name = "whisper-hub")]
#[command(about = "Runs transcription jobs on an external engine and streams their progress")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Address the HTTP and WebSocket server binds to
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Engine command to use (e.g., 'whisper', 'uv')
    #[arg(long, env = "WHISPER_CMD", default_value = "whisper")]
    pub engine_cmd: String,

    /// Extra arguments placed before the generated engine arguments
    #[arg(long, default_value = "")]
    pub engine_args: String,

    /// Working directory for engine processes
    #[arg(long)]
    pub engine_workdir: Option<PathBuf>,

    /// Root directory for job output
    #[arg(long, default_value = DEFAULT_TRANSCRIPTIONS_DIR)]
    pub transcriptions_dir: PathBuf,

    /// Directory the upload layer stores files in
    #[arg(long, default_value = DEFAULT_UPLOADS_DIR)]
    pub uploads_dir: PathBuf,

    /// Number of jobs allowed to run at once
    #[arg(long, env = "CONCURRENT_AMOUNT", default_value = "2")]
    pub concurrent_amount: usize,

    /// Pin engine runs to alternating GPUs (production only)
    #[arg(long, env = "MULTIPLE_GPUS", default_value = "false")]
    pub multiple_gpus: bool,

    /// Production mode; also enabled by NODE_ENV=production
    #[arg(long, default_value = "false")]
    pub production: bool,

    /// LibreTranslate base URL; translation is disabled without it
    #[arg(long, env = "LIBRETRANSLATE")]
    pub libretranslate: Option<String>,

    /// LibreTranslate API key
    #[arg(long, env = "LIBRETRANSLATE_API_KEY")]
    pub libretranslate_api_key: Option<String>,

    /// Translation targets, comma separated (defaults to the built-in list)
    #[arg(long, value_delimiter = ',')]
    pub translate_to: Vec<String>,

    /// Command replacing the built-in Traditional to Simplified Chinese conversion
    /// (reads stdin, writes stdout)
    #[arg(long, env = "OPENCC_CMD")]
    pub opencc_cmd: Option<String>,

    /// WebSocket heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    pub heartbeat_interval: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Typed configuration used by the library
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind: SocketAddr,
    pub engine: EngineConfig,
    pub uploads_dir: PathBuf,
    pub concurrent_amount: usize,
    pub multiple_gpus: bool,
    pub production: bool,
    pub libretranslate: Option<String>,
    pub libretranslate_api_key: Option<String>,
    /// Empty means the default target list
    pub translate_to: Vec<String>,
    pub opencc_cmd: Option<String>,
    pub heartbeat_interval: Duration,
    pub client_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            engine: EngineConfig::default(),
            uploads_dir: PathBuf::from(DEFAULT_UPLOADS_DIR),
            concurrent_amount: 2,
            multiple_gpus: false,
            production: false,
            libretranslate: None,
            libretranslate_api_key: None,
            translate_to: Vec::new(),
            opencc_cmd: None,
            heartbeat_interval: Duration::from_secs(30),
            client_buffer: DEFAULT_CLIENT_BUFFER,
        }
    }
}

impl HubConfig {
    /// Device pinning applies only to multi-GPU production deployments
    pub fn multi_device(&self) -> bool {
        self.production && self.multiple_gpus
    }

    pub fn transcriptions_dir(&self) -> &PathBuf {
        &self.engine.transcriptions_dir
    }
}

/// True when `NODE_ENV` asks for production
pub fn production_from_env() -> bool {
    std::env::var("NODE_ENV")
        .map(|value| value.eq_ignore_ascii_case("production"))
        .unwrap_or(false)
}

impl From<Args> for HubConfig {
    fn from(args: Args) -> Self {
        let leading_args = args
            .engine_args
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        Self {
            bind: args.bind,
            engine: EngineConfig {
                command: args.engine_cmd,
                leading_args,
                transcriptions_dir: args.transcriptions_dir,
                working_dir: args.engine_workdir,
                env_vars: Vec::new(),
            },
            uploads_dir: args.uploads_dir,
            concurrent_amount: args.concurrent_amount.max(1),
            multiple_gpus: args.multiple_gpus,
            production: args.production || production_from_env(),
            libretranslate: args.libretranslate.filter(|url| !url.trim().is_empty()),
            libretranslate_api_key: args.libretranslate_api_key,
            translate_to: args
                .translate_to
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            opencc_cmd: args.opencc_cmd,
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval.max(1)),
            ..Default::default()
        }
    }
}
