//! alices-mirror core: a single interactive shell shared over HTTP.
//!
//! Browsers attach over WebSocket, replay the recent output, then watch
//! and drive the same terminal concurrently. The shell survives client
//! disconnects and respawns on ordinary exit; a privileged owner socket
//! bounds the server's lifetime.

pub mod app;
pub mod server;
pub mod terminal;

pub use app::{build_auth_config, run, startup_lines, validate, Config, StartupInfo};
pub use server::{AuthConfig, Server, ServerConfig, UserLevel};
pub use terminal::{
    ProcessInfo, ResetOutcome, Session, SessionConfig, SessionEvents, ShellKind, OWNER_TOKEN_ENV,
    TITLE_PREFIX_ENV,
};
