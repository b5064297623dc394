pub mod config;
pub mod error;
pub mod launcher;
pub mod proxy;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::BackendError;
pub use launcher::*;
pub use proxy::SandboxProxy;
pub use traits::*;
pub use types::*;
