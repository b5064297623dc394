use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_BACKEND_PATH: &str = "/rlm";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    /// Bound on one forwarded request once connected.
    pub request_timeout: Duration,
}

impl SandboxConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: DEFAULT_BACKEND_PATH.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: Duration::from_secs(600),
        }
    }

    pub fn endpoint(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    /// Upper bound on a whole call: every connect attempt and retry delay,
    /// plus one full request wait.
    pub fn call_timeout(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        self.retry_delay
            .saturating_add(self.connect_timeout)
            .saturating_mul(attempts)
            .saturating_add(self.request_timeout)
    }
}

/// Command that boots the execution unit as a child process.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    /// Splits a whitespace-separated command line. Returns `None` when blank.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(ToString::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            env: Vec::new(),
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}
