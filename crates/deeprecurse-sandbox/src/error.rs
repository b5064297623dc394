use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to start sandbox: {0}")]
    Launch(String),

    #[error("backend unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    #[error("backend API error: status={status}, body={body}")]
    Api { status: u16, body: String },

    #[error("backend returned invalid response: {0}")]
    InvalidResponse(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend call timed out after {0:?}")]
    Timeout(std::time::Duration),
}
