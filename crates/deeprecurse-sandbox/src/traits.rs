use async_trait::async_trait;

use crate::error::BackendError;
use crate::types::{BackendCall, BackendStats};

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(&self, request: BackendCall) -> Result<String, BackendError>;

    fn stats(&self) -> BackendStats {
        BackendStats::default()
    }
}

/// Owns the lifecycle of the sandboxed execution unit.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn is_running(&self) -> bool;

    /// Issues a start. The unit is not expected to accept connections yet.
    async fn start(&self) -> Result<(), BackendError>;
}
