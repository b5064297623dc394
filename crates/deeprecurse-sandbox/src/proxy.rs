use std::error::Error as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::BackendError;
use crate::traits::{ReasoningBackend, SandboxLauncher};
use crate::types::{BackendCall, BackendStats, UnitState};

/// Longest backend error body echoed back to callers.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Forwards calls to the single shared execution unit, starting it on first
/// use and retrying while it boots. Only connection failures are retried; a
/// unit that answers with an error fails the call immediately.
pub struct SandboxProxy {
    config: SandboxConfig,
    client: Client,
    launcher: Arc<dyn SandboxLauncher>,
    state: Mutex<UnitState>,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    starts: AtomicU64,
    connect_failures: AtomicU64,
    unavailable: AtomicU64,
    api_errors: AtomicU64,
    timeouts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl SandboxProxy {
    pub fn new(
        config: SandboxConfig,
        launcher: Arc<dyn SandboxLauncher>,
    ) -> Result<Self, BackendError> {
        if config.host.trim().is_empty() {
            return Err(BackendError::Config("sandbox host is empty".to_string()));
        }
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            launcher,
            state: Mutex::new(UnitState::NotStarted),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub async fn state(&self) -> UnitState {
        *self.state.lock().await
    }

    // The state lock makes the start check-then-act a single transition.
    async fn ensure_started(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if !self.launcher.is_running().await {
            info!(launcher = self.launcher.name(), "starting sandbox");
            self.launcher.start().await?;
            bump(&self.counters.starts);
            *state = UnitState::Starting;
        } else if *state == UnitState::NotStarted {
            *state = UnitState::Starting;
        }
        Ok(())
    }

    async fn mark_ready(&self) {
        let mut state = self.state.lock().await;
        if *state != UnitState::Ready {
            info!(endpoint = %self.config.endpoint(), "sandbox ready");
            *state = UnitState::Ready;
        }
    }

    async fn forward(&self, request: &BackendCall) -> Result<String, BackendError> {
        let endpoint = self.config.endpoint();
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.client.post(&endpoint).json(request).send().await {
                Ok(res) => {
                    self.mark_ready().await;
                    return read_answer(res).await;
                }
                Err(err) if err.is_connect() => {
                    bump(&self.counters.connect_failures);
                    last_error = error_chain(&err);
                    debug!(attempt, attempts, error = %last_error, "sandbox not reachable yet");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        bump(&self.counters.unavailable);
        warn!(attempts, error = %last_error, "sandbox unavailable");
        Err(BackendError::Unavailable {
            attempts,
            last_error,
        })
    }
}

#[async_trait]
impl ReasoningBackend for SandboxProxy {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn call(&self, request: BackendCall) -> Result<String, BackendError> {
        bump(&self.counters.calls);
        let budget = self.config.call_timeout();
        let run = async {
            self.ensure_started().await?;
            self.forward(&request).await
        };
        let result = match tokio::time::timeout(budget, run).await {
            Ok(result) => result,
            Err(_) => {
                bump(&self.counters.timeouts);
                Err(BackendError::Timeout(budget))
            }
        };
        if matches!(result, Err(BackendError::Api { .. })) {
            bump(&self.counters.api_errors);
        }
        result
    }

    fn stats(&self) -> BackendStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BackendStats {
            calls: load(&self.counters.calls),
            starts: load(&self.counters.starts),
            connect_failures: load(&self.counters.connect_failures),
            unavailable: load(&self.counters.unavailable),
            api_errors: load(&self.counters.api_errors),
            timeouts: load(&self.counters.timeouts),
        }
    }
}

async fn read_answer(res: Response) -> Result<String, BackendError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(BackendError::Api {
            status: status.as_u16(),
            body: truncate_body(&body),
        });
    }

    let payload: Value = res
        .json()
        .await
        .map_err(|err| BackendError::InvalidResponse(format!("body is not json: {err}")))?;
    match payload.get("answer") {
        Some(Value::String(answer)) => Ok(answer.clone()),
        Some(_) => Err(BackendError::InvalidResponse(
            "answer field is not a string".to_string(),
        )),
        None => Err(BackendError::InvalidResponse(
            "missing answer field".to_string(),
        )),
    }
}

fn truncate_body(body: &str) -> String {
    let mut chars = body.chars();
    let head: String = chars.by_ref().take(MAX_ERROR_BODY_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
