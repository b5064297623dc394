use serde::Serialize;

/// One logical invocation forwarded to the sandbox. Serialized as the
/// backend request body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackendCall {
    pub context: String,
    pub query: String,
    pub thread_id: String,
}

impl BackendCall {
    pub fn new(
        context: impl Into<String>,
        query: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            query: query.into(),
            thread_id: thread_id.into(),
        }
    }
}

/// Readiness of the shared execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    NotStarted,
    Starting,
    Ready,
}

/// Running counters for one backend, exposed through `/metrics`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub calls: u64,
    pub starts: u64,
    pub connect_failures: u64,
    pub unavailable: u64,
    pub api_errors: u64,
    pub timeouts: u64,
}
