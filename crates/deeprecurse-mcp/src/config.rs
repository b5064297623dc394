use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use deeprecurse_sandbox::{
    BackendError, ExternalUnit, LaunchCommand, ProcessLauncher, ReasoningBackend, SandboxConfig,
    SandboxLauncher, SandboxProxy, DEFAULT_BACKEND_PATH, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY,
};
use deeprecurse_store::{ContextStore, FileContextStore, RemoteContextStore, StoreError};
use thiserror::Error;

use crate::server::DEFAULT_MCP_PATH;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_STORE_DIR: &str = "./data/threads";
const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";
const DEFAULT_BACKEND_PORT: u16 = 8080;
const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 600;
const REMOTE_STORE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var}: {message}")]
    Invalid { var: &'static str, message: String },
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    File { dir: PathBuf },
    Remote { base_url: String },
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub transport: Transport,
    pub http_addr: String,
    pub mcp_path: String,
    pub store: StoreKind,
    pub sandbox: SandboxConfig,
    pub backend_cmd: Option<LaunchCommand>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source; unset and blank values
    /// take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let transport = match get("DEEPRECURSE_TRANSPORT").as_deref() {
            None | Some("http") => Transport::Http,
            Some("stdio") => Transport::Stdio,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "DEEPRECURSE_TRANSPORT",
                    message: format!("{other} (expected stdio or http)"),
                })
            }
        };

        let http_addr = match get("DEEPRECURSE_HTTP_ADDR") {
            Some(addr) => addr,
            None => {
                let port = get("PORT")
                    .and_then(|v| v.parse::<u16>().ok())
                    .unwrap_or(DEFAULT_PORT);
                format!("0.0.0.0:{port}")
            }
        };

        let mcp_path = get("DEEPRECURSE_MCP_PATH")
            .map(|p| if p.starts_with('/') { p } else { format!("/{p}") })
            .unwrap_or_else(|| DEFAULT_MCP_PATH.to_string());

        let store = match get("DEEPRECURSE_STORE").as_deref() {
            None | Some("file") => StoreKind::File {
                dir: PathBuf::from(
                    get("DEEPRECURSE_STORE_DIR").unwrap_or_else(|| DEFAULT_STORE_DIR.to_string()),
                ),
            },
            Some("remote") => StoreKind::Remote {
                base_url: get("DEEPRECURSE_STORE_URL")
                    .ok_or(ConfigError::Missing("DEEPRECURSE_STORE_URL"))?,
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "DEEPRECURSE_STORE",
                    message: format!("{other} (expected file or remote)"),
                })
            }
        };

        let host = get("DEEPRECURSE_BACKEND_HOST").unwrap_or_else(|| DEFAULT_BACKEND_HOST.to_string());
        let port = get("DEEPRECURSE_BACKEND_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_BACKEND_PORT);
        let mut sandbox = SandboxConfig::new(host, port);
        sandbox.path = get("DEEPRECURSE_BACKEND_PATH").unwrap_or_else(|| DEFAULT_BACKEND_PATH.to_string());
        sandbox.max_attempts = u32::try_from(env_u64(
            get("DEEPRECURSE_BACKEND_MAX_ATTEMPTS"),
            u64::from(DEFAULT_MAX_ATTEMPTS),
            1,
            1000,
        ))
        .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        sandbox.retry_delay = Duration::from_millis(env_u64(
            get("DEEPRECURSE_BACKEND_RETRY_DELAY_MS"),
            u64::try_from(DEFAULT_RETRY_DELAY.as_millis()).unwrap_or(250),
            1,
            60_000,
        ));
        sandbox.request_timeout = Duration::from_secs(env_u64(
            get("DEEPRECURSE_BACKEND_TIMEOUT_SECS"),
            DEFAULT_BACKEND_TIMEOUT_SECS,
            1,
            86_400,
        ));

        let backend_cmd = get("DEEPRECURSE_BACKEND_CMD")
            .and_then(|raw| LaunchCommand::parse(&raw))
            .map(|cmd| cmd.with_env("PORT", port.to_string()));

        Ok(Self {
            transport,
            http_addr,
            mcp_path,
            store,
            sandbox,
            backend_cmd,
        })
    }

    pub fn build_store(&self) -> Result<Arc<dyn ContextStore>, ConfigError> {
        Ok(match &self.store {
            StoreKind::File { dir } => Arc::new(FileContextStore::open(dir)?),
            StoreKind::Remote { base_url } => {
                Arc::new(RemoteContextStore::new(base_url.clone(), REMOTE_STORE_TIMEOUT)?)
            }
        })
    }

    pub fn build_backend(&self) -> Result<Arc<dyn ReasoningBackend>, ConfigError> {
        let launcher: Arc<dyn SandboxLauncher> = match &self.backend_cmd {
            Some(cmd) => Arc::new(ProcessLauncher::new(cmd.clone())),
            None => Arc::new(ExternalUnit),
        };
        Ok(Arc::new(SandboxProxy::new(self.sandbox.clone(), launcher)?))
    }
}

fn env_u64(raw: Option<String>, default: u64, min: u64, max: u64) -> u64 {
    raw.and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}
