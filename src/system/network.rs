use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Command;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("interface '{0}' not found")]
    NotFound(String),

    #[error("interface '{0}' has no IPv4 address")]
    NoIpv4(String),

    #[error("failed to query interface '{name}': {reason}")]
    Tool { name: String, reason: String },
}

/// Maps a network interface name to its IPv4 address.
pub trait InterfaceResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Ipv4Addr, ResolveError>;
}

/// Asks the host via `ip -4 -o addr show dev <name>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl InterfaceResolver for SystemResolver {
    fn resolve(&self, name: &str) -> Result<Ipv4Addr, ResolveError> {
        if name.is_empty() || name.starts_with('-') {
            return Err(ResolveError::NotFound(name.to_string()));
        }

        let output = Command::new("ip")
            .args(["-4", "-o", "addr", "show", "dev", name])
            .output()
            .map_err(|e| ResolveError::Tool {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // ip prints `Device "foo" does not exist.`
            if stderr.contains("does not exist") {
                return Err(ResolveError::NotFound(name.to_string()));
            }
            return Err(ResolveError::Tool {
                name: name.to_string(),
                reason: stderr.trim().to_string(),
            });
        }

        let addr = parse_ip_addr_output(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| ResolveError::NoIpv4(name.to_string()))?;
        debug!(interface = name, %addr, "resolved interface address");
        Ok(addr)
    }
}

/// Fixed name-to-address table.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    addrs: HashMap<String, Ipv4Addr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, addr: Ipv4Addr) -> Self {
        self.addrs.insert(name.into(), addr);
        self
    }
}

impl InterfaceResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Result<Ipv4Addr, ResolveError> {
        self.addrs
            .get(name)
            .copied()
            .ok_or_else(|| ResolveError::NotFound(name.to_string()))
    }
}

/// Last `inet` address in `ip -4 -o addr` output.
///
/// format: `2: eth0    inet 192.168.1.10/24 brd 192.168.1.255 scope global eth0\ ...`
pub fn parse_ip_addr_output(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "inet")?;
            let cidr = words.next()?;
            cidr.split('/').next()?.parse().ok()
        })
        .last()
}
