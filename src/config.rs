use std::{fs::read_to_string, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use service::SessionOptions;

fn default_buffer_limit() -> usize {
    service::sender::DEFAULT_BUFFER_LIMIT
}

fn default_send_timeout_secs() -> u64 {
    service::sender::DEFAULT_SEND_TIMEOUT.as_secs()
}

/// One board in a job's allocation, as the (out-of-scope) job allocator
/// would hand it to this crate: a logical coordinate plus the Ethernet
/// hostname to resolve it from.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct BoardSpec {
    pub x: u32,
    pub y: u32,
    pub hostname: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// Address the demo WebSocket front door binds to.
    ///
    #[serde(default = "Server::listen")]
    pub listen: SocketAddr,
}

impl Server {
    fn listen() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self { listen: Self::listen() }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Proxy {
    ///
    /// Receive-loop timeout, unconnected-bind address, and diagnostic
    /// counter flag — the same `SessionOptions` the `service` crate's
    /// `Session::new` takes, deserialized straight out of this table.
    ///
    #[serde(flatten)]
    pub session: SessionOptions,
    ///
    /// Bound on bytes queued for the WebSocket sender before a session is
    /// considered stuck and closed with `SERVER_ERROR`.
    ///
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,
    ///
    /// Per-frame WebSocket send-time limit, in seconds, before a session is
    /// considered stuck and closed with `SERVER_ERROR`.
    ///
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Proxy {
    pub fn session_options(&self) -> SessionOptions {
        self.session.clone()
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl Default for Proxy {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            buffer_limit: default_buffer_limit(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

/// The board list this demo binary hands to every session it accepts, in
/// place of the out-of-scope job allocator. A real embedding would instead
/// look this up per job id from whatever the WebSocket upgrade carried.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Job {
    #[serde(default)]
    pub boards: Vec<BoardSpec>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub proxy: Proxy,
    #[serde(default)]
    pub job: Job,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: spalloc-proxy --config /etc/spalloc-proxy/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configuration from the file named on the command line.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(&Cli::parse().config)?)?)
    }
}
