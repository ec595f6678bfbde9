pub mod backoff;
pub mod classify;
pub mod entry;
pub mod error;
pub mod loopback;
pub mod manager;
pub mod semaphore;

pub use backoff::BackoffPolicy;
pub use classify::{classify_close, CloseKind};
pub use entry::{SessionStatus, SessionSummary};
pub use error::SessionError;
pub use manager::{ManagerConfig, SessionManager};
pub use semaphore::{Permit, Semaphore};
