pub mod config;
pub mod controller;
pub mod db_cleanup;
pub mod db_presets;
pub mod error;
pub mod events;
pub mod git_workspace;
pub mod heartbeat;
pub mod http;
pub mod hub;
pub mod progress;
pub mod rpc;
pub mod session;
pub mod ssh_config;
pub mod ssh_keys;
pub mod tunnel;

pub use config::Config;
pub use controller::{CreateOptions, SandboxController, SessionRegistry, SnapshotOptions};
pub use error::{AppError, AppResult};
pub use progress::ProgressSink;
pub use session::{Session, SessionState};
