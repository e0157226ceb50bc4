//! Configuration validation and server assembly.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::server::{
    expand_bind_patterns, local_ipv4s, parse_user_level_rules, AuthConfig, Server, ServerConfig,
};
use crate::terminal::{Session, SessionConfig, ShellKind, OWNER_TOKEN_ENV};

const DEFAULT_USER_LEVEL: &str = "*-0";

#[derive(Debug, Clone)]
pub struct Config {
    pub alias: String,
    pub port: u16,
    pub binds: Vec<String>,
    pub allow_ips: Vec<String>,
    pub user_level: String,
    pub user: String,
    pub password: String,
    pub yolo: bool,
    pub work_dir: PathBuf,
    pub shell: String,
}

pub struct StartupInfo {
    pub work_dir: PathBuf,
    pub port: u16,
    pub origins: Vec<String>,
    pub auth: AuthConfig,
}

/// Reject bad configuration before any session or listener exists.
pub fn validate(cfg: &Config) -> Result<()> {
    if cfg.port == 0 {
        bail!("port must be between 1 and 65535");
    }
    if cfg.work_dir.as_os_str().is_empty() {
        bail!("work directory is required");
    }
    if cfg.binds.is_empty() || cfg.binds.iter().any(|b| b.trim().is_empty()) {
        bail!("bind list is required");
    }
    if cfg.allow_ips.is_empty() || cfg.allow_ips.iter().any(|a| a.trim().is_empty()) {
        bail!("allow-ip list is required");
    }

    if expand_bind_patterns(&cfg.binds).is_empty() {
        bail!("bind patterns did not match any local IPv4 addresses");
    }

    let user_level = effective_user_level(cfg);
    parse_user_level_rules(&user_level)
        .with_context(|| format!("invalid value {:?} for --user-level", cfg.user_level))?;

    let meta = std::fs::metadata(&cfg.work_dir)
        .with_context(|| format!("invalid work directory {:?}", cfg.work_dir))?;
    if !meta.is_dir() {
        bail!("work directory is not a directory: {}", cfg.work_dir.display());
    }

    let shell = ShellKind::parse(&cfg.shell);
    Session::check_shell(&cfg.work_dir, &shell)
        .with_context(|| format!("failed to start shell in {:?}", cfg.work_dir))?;

    Ok(())
}

/// Auth is active only when both credentials are present and `--yolo`
/// was not given.
pub fn build_auth_config(cfg: &Config) -> AuthConfig {
    if !cfg.yolo && !cfg.user.is_empty() && !cfg.password.is_empty() {
        AuthConfig {
            enabled: true,
            user: cfg.user.clone(),
            password: cfg.password.clone(),
        }
    } else {
        AuthConfig::default()
    }
}

/// Validate, assemble the session and the server, and serve until the
/// context is cancelled or the owner goes away.
pub async fn run(cfg: Config, ctx: CancellationToken) -> Result<()> {
    {
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || validate(&cfg))
            .await
            .context("validation task failed")??;
    }

    let auth = build_auth_config(&cfg);
    let owner_token = std::env::var(OWNER_TOKEN_ENV)
        .unwrap_or_default()
        .trim()
        .to_string();
    let user_levels = parse_user_level_rules(&effective_user_level(&cfg))
        .with_context(|| format!("invalid value {:?} for --user-level", cfg.user_level))?;

    let resolved_binds = expand_bind_patterns(&cfg.binds);
    if resolved_binds.is_empty() {
        bail!("bind patterns did not match any local IPv4 addresses");
    }

    let (session, events) = Session::new(SessionConfig {
        work_dir: cfg.work_dir.clone(),
        shell: ShellKind::parse(&cfg.shell),
        buffer_size: 256 * 1024,
        exit_on_shell_exit: !owner_token.is_empty(),
    })?;

    let addrs: Vec<String> = resolved_binds
        .iter()
        .map(|origin| format!("{origin}:{}", cfg.port))
        .collect();
    let alias = cfg.alias.trim().to_string();

    let server = Server::new(
        ServerConfig {
            addrs,
            allow_ips: cfg.allow_ips.clone(),
            session,
            auth: auth.clone(),
            alias,
            owner_token,
            user_levels,
        },
        events,
    )?;

    for line in startup_lines(&StartupInfo {
        work_dir: cfg.work_dir.clone(),
        port: cfg.port,
        origins: resolved_binds,
        auth,
    }) {
        println!("{line}");
    }
    info!(port = cfg.port, work_dir = %cfg.work_dir.display(), "server starting");

    server.start(ctx).await
}

pub fn startup_lines(info: &StartupInfo) -> Vec<String> {
    let mut lines = vec!["alices mirror is running.".to_string()];
    if !info.work_dir.as_os_str().is_empty() {
        lines.push(format!("Working directory: {}", info.work_dir.display()));
    }

    let hosts = build_display_hosts(&info.origins);
    if hosts.is_empty() {
        lines.push("LAN address not detected. Use:".to_string());
        lines.push(format!("http://localhost:{}", info.port));
        return lines;
    }

    for host in hosts {
        let url = if info.auth.enabled {
            format!(
                "http://{}:{}@{}:{}",
                info.auth.user, info.auth.password, host, info.port
            )
        } else {
            format!("http://{}:{}", host, info.port)
        };
        lines.push(format!("Open: {url}"));
    }
    lines.push("Press Ctrl+C to stop the server.".to_string());
    lines
}

fn effective_user_level(cfg: &Config) -> String {
    let trimmed = cfg.user_level.trim();
    if trimmed.is_empty() {
        DEFAULT_USER_LEVEL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn build_display_hosts(origins: &[String]) -> Vec<String> {
    let mut hosts = Vec::new();
    for origin in origins {
        if origin == "0.0.0.0" {
            hosts.extend(local_ipv4s());
        } else {
            hosts.push(origin.clone());
        }
    }
    dedup(hosts)
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|value| !value.is_empty() && seen.insert(value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(dir: &std::path::Path) -> Config {
        Config {
            alias: String::new(),
            port: 8080,
            binds: vec!["127.0.0.1".to_string()],
            allow_ips: vec!["127.0.0.1".to_string()],
            user_level: String::new(),
            user: String::new(),
            password: String::new(),
            yolo: false,
            work_dir: dir.to_path_buf(),
            shell: String::new(),
        }
    }

    #[test]
    fn validate_rejects_zero_port() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = base_config(dir.path());
        cfg.port = 0;
        assert!(validate(&cfg).unwrap_err().to_string().contains("port"));
    }

    #[test]
    fn validate_rejects_empty_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = base_config(dir.path());
        cfg.binds = vec![];
        assert!(validate(&cfg).is_err());

        let mut cfg = base_config(dir.path());
        cfg.allow_ips = vec!["  ".to_string()];
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn validate_rejects_bad_user_level() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = base_config(dir.path());
        cfg.user_level = "10.0.0.1-5".to_string();
        let err = validate(&cfg).unwrap_err();
        assert!(format!("{err:#}").contains("--user-level"));
    }

    #[test]
    fn validate_rejects_missing_work_dir() {
        let mut cfg = base_config(std::path::Path::new("/definitely/not/a/real/dir"));
        cfg.work_dir = PathBuf::from("/definitely/not/a/real/dir");
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn auth_config_requires_both_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = base_config(dir.path());
        assert!(!build_auth_config(&cfg).enabled);

        cfg.user = "u".to_string();
        assert!(!build_auth_config(&cfg).enabled);

        cfg.password = "p".to_string();
        assert!(build_auth_config(&cfg).enabled);

        cfg.yolo = true;
        assert!(!build_auth_config(&cfg).enabled);
    }

    #[test]
    fn startup_lines_include_urls() {
        let lines = startup_lines(&StartupInfo {
            work_dir: PathBuf::from("/srv/work"),
            port: 8080,
            origins: vec!["127.0.0.1".to_string()],
            auth: AuthConfig::default(),
        });
        assert_eq!(lines[0], "alices mirror is running.");
        assert!(lines.contains(&"Open: http://127.0.0.1:8080".to_string()));
        assert!(lines.contains(&"Press Ctrl+C to stop the server.".to_string()));
    }

    #[test]
    fn startup_lines_embed_credentials() {
        let lines = startup_lines(&StartupInfo {
            work_dir: PathBuf::from("/srv/work"),
            port: 9000,
            origins: vec!["10.0.0.2".to_string()],
            auth: AuthConfig {
                enabled: true,
                user: "u".to_string(),
                password: "p".to_string(),
            },
        });
        assert!(lines.contains(&"Open: http://u:p@10.0.0.2:9000".to_string()));
    }

    #[test]
    fn startup_lines_fallback_without_hosts() {
        let lines = startup_lines(&StartupInfo {
            work_dir: PathBuf::new(),
            port: 8080,
            origins: vec![],
            auth: AuthConfig::default(),
        });
        assert!(lines.contains(&"http://localhost:8080".to_string()));
    }
}
