//! Multiplexing WebSocket server and its access-control plumbing.

pub mod access;
pub mod assets;
pub mod bind;
pub mod server;
pub mod upload;

pub use access::{
    match_user_level, parse_user_level_rules, AuthConfig, IpAllowList, UserLevel, UserLevelRule,
};
pub use bind::{expand_bind_patterns, local_ipv4s};
pub use server::{Server, ServerConfig, ServerState};
