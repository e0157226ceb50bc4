//! Request authorization: basic auth, IP allow-list, per-IP user levels.
//!
//! Patterns are literals with `*` wildcards, compiled to anchored
//! regexes after metacharacter escaping. Rule lists are ordered; first
//! match wins.

use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Context, Result};
use regex::Regex;

/// Basic-auth credentials; `enabled == false` disables the middleware.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub user: String,
    pub password: String,
}

/// Authorization level attached to a client by IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserLevel {
    /// Full control: input, resize, reset, upload.
    Interact,
    /// Output only; every control-plane action is refused.
    WatchOnly,
}

#[derive(Debug, Clone)]
pub struct UserLevelRule {
    pub pattern: String,
    pub level: UserLevel,
    matcher: Regex,
}

/// Parse a comma-separated `<pattern>-<level>` rule list. Levels are
/// `0` (interact) and `1` (watch-only); everything else is rejected.
pub fn parse_user_level_rules(raw: &str) -> Result<Vec<UserLevelRule>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("rules cannot be empty");
    }

    let mut rules = Vec::new();
    for part in trimmed.split(',') {
        let item = part.trim();
        if item.is_empty() {
            bail!("invalid rule list: {raw:?}");
        }

        let sep = item
            .rfind('-')
            .filter(|&sep| sep > 0 && sep < item.len() - 1)
            .with_context(|| format!("invalid rule {item:?} (expected <pattern>-<level>)"))?;

        let pattern = item[..sep].trim();
        let level_text = item[sep + 1..].trim();
        if pattern.is_empty() || level_text.is_empty() {
            bail!("invalid rule {item:?} (expected <pattern>-<level>)");
        }

        let level = match level_text {
            "0" => UserLevel::Interact,
            "1" => UserLevel::WatchOnly,
            other => bail!("invalid level {other:?} in rule {item:?} (expected 0 or 1)"),
        };

        let matcher = compile_wildcard_pattern(pattern)
            .with_context(|| format!("invalid pattern {pattern:?} in rule {item:?}"))?;

        rules.push(UserLevelRule {
            pattern: pattern.to_string(),
            level,
            matcher,
        });
    }

    Ok(rules)
}

/// First matching rule's level, or `(Interact, false)` when nothing
/// matches — callers log the unmatched IP once.
pub fn match_user_level(rules: &[UserLevelRule], ip: &str) -> (UserLevel, bool) {
    for rule in rules {
        if rule.matcher.is_match(ip) {
            return (rule.level, true);
        }
    }
    (UserLevel::Interact, false)
}

/// Compile a `*`-wildcard literal into an anchored regex.
pub fn compile_wildcard_pattern(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    Regex::new(&format!("^{escaped}$")).context("failed to compile pattern")
}

/// Ordered allow-list of IP patterns; required and non-empty.
#[derive(Debug, Clone)]
pub struct IpAllowList {
    matchers: Vec<Regex>,
}

impl IpAllowList {
    pub fn parse(patterns: &[String]) -> Result<Self> {
        let mut matchers = Vec::new();
        for pattern in patterns {
            let trimmed = pattern.trim();
            if trimmed.is_empty() {
                bail!("allow-ip pattern cannot be empty");
            }
            matchers.push(
                compile_wildcard_pattern(trimmed)
                    .with_context(|| format!("invalid allow-ip pattern {trimmed:?}"))?,
            );
        }
        if matchers.is_empty() {
            bail!("allow-ip list is required");
        }
        Ok(Self { matchers })
    }

    pub fn allows(&self, ip: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(ip))
    }
}

/// Client IP as the rule tables see it: port stripped, IPv4-mapped IPv6
/// unwrapped so dual-stack listeners match plain IPv4 patterns.
pub fn client_ip(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        ip => ip.to_string(),
    }
}
