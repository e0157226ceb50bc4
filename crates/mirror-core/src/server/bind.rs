//! Listen-address resolution.
//!
//! Bind patterns containing `*` expand against the machine's current
//! IPv4 addresses (loopback and link-local excluded); literals pass
//! through untouched. Patterns that match nothing are dropped.

use super::access::compile_wildcard_pattern;

/// Non-loopback, non-link-local IPv4 addresses of up interfaces.
#[cfg(unix)]
pub fn local_ipv4s() -> Vec<String> {
    use nix::net::if_::InterfaceFlags;

    let Ok(addrs) = nix::ifaddrs::getifaddrs() else {
        return Vec::new();
    };

    let mut results = Vec::new();
    for ifaddr in addrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            continue;
        }
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        let Some(sin) = address.as_sockaddr_in() else {
            continue;
        };
        let ip = sin.ip();
        if ip.is_link_local() {
            continue;
        }
        results.push(ip.to_string());
    }
    dedup(results)
}

#[cfg(not(unix))]
pub fn local_ipv4s() -> Vec<String> {
    Vec::new()
}

/// Expand `*` patterns against the local address set; see module docs.
pub fn expand_bind_patterns(patterns: &[String]) -> Vec<String> {
    expand_with(patterns, &local_ipv4s())
}

fn expand_with(patterns: &[String], local_ips: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for pattern in patterns {
        let cleaned = pattern.trim();
        if cleaned.is_empty() {
            continue;
        }

        if cleaned.contains('*') {
            let Ok(matcher) = compile_wildcard_pattern(cleaned) else {
                continue;
            };
            for ip in local_ips {
                if matcher.is_match(ip) {
                    out.push(ip.clone());
                }
            }
            continue;
        }

        out.push(cleaned.to_string());
    }
    dedup(out)
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}
