//! Name-resolution facade.
//!
//! Resolves the service hostname through an ordered resolver list. The last
//! resolver that answered is tried first next time. When every resolver fails
//! for the service host itself, a fixed fallback address is returned.

use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use knight_core::{config::DnsConfig, error::KnightError};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// One A-record query against one resolver endpoint.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn lookup_a(
        &self,
        server: IpAddr,
        hostname: &str,
        timeout: Duration,
    ) -> Result<Vec<Ipv4Addr>, KnightError>;
}

/// Production lookup over plain UDP/TCP DNS (port 53).
pub struct HickoryLookup;

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn lookup_a(
        &self,
        server: IpAddr,
        hostname: &str,
        timeout: Duration,
    ) -> Result<Vec<Ipv4Addr>, KnightError> {
        let group = NameServerConfigGroup::from_ips_clear(&[server], 53, true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        opts.cache_size = 0;
        let resolver = TokioAsyncResolver::tokio(config, opts);

        let lookup = tokio::time::timeout(timeout, resolver.ipv4_lookup(hostname))
            .await
            .map_err(|_| KnightError::Resolution(format!("{server}: timed out")))?
            .map_err(|e| KnightError::Resolution(format!("{server}: {e}")))?;

        Ok(lookup.iter().map(|a| a.0).collect())
    }
}

/// Ordered-failover resolver.
pub struct Resolver {
    servers: Vec<IpAddr>,
    timeout: Duration,
    service_host: String,
    fallback: Option<Ipv4Addr>,
    preferred: Mutex<Option<IpAddr>>,
    lookup: Arc<dyn DnsLookup>,
}

impl Resolver {
    /// Build from config with the hickory lookup.
    pub fn from_config(config: &DnsConfig) -> Self {
        Self::with_lookup(config, Arc::new(HickoryLookup))
    }

    /// Build from config with an explicit lookup implementation.
    pub fn with_lookup(config: &DnsConfig, lookup: Arc<dyn DnsLookup>) -> Self {
        let servers = config
            .servers
            .iter()
            .filter_map(|s| match s.trim().parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("dns: ignoring invalid resolver address '{s}'");
                    None
                }
            })
            .collect();
        let fallback = match config.fallback_ip.parse::<Ipv4Addr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("dns: invalid fallback address '{}'", config.fallback_ip);
                None
            }
        };
        Self {
            servers,
            timeout: config.timeout(),
            service_host: config.service_host.clone(),
            fallback,
            preferred: Mutex::new(None),
            lookup,
        }
    }

    /// Hostname the fallback literal applies to.
    pub fn service_host(&self) -> &str {
        &self.service_host
    }

    /// Resolver that answered last, if any.
    pub fn preferred(&self) -> Option<IpAddr> {
        *self.preferred.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Configured resolvers with the preferred one moved to the front.
    pub fn ordered_servers(&self) -> Vec<IpAddr> {
        let mut servers = self.servers.clone();
        if let Some(pref) = self.preferred() {
            if let Some(pos) = servers.iter().position(|s| *s == pref) {
                let first = servers.remove(pos);
                servers.insert(0, first);
            }
        }
        servers
    }

    /// Resolve `hostname` to an IPv4 address.
    ///
    /// Falls back to the configured literal for the service host only.
    pub async fn resolve(&self, hostname: &str) -> Result<Ipv4Addr, KnightError> {
        match self.lookup_all(hostname).await {
            Ok(ip) => Ok(ip),
            Err(e) if hostname.eq_ignore_ascii_case(&self.service_host) => match self.fallback {
                Some(ip) => {
                    warn!("dns: {e}; using fallback {ip} for {hostname}");
                    Ok(ip)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Resolve through the resolver list only, never using the fallback.
    pub async fn lookup_all(&self, hostname: &str) -> Result<Ipv4Addr, KnightError> {
        if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
            return Ok(ip);
        }

        let mut failures = Vec::new();
        for server in self.ordered_servers() {
            match self.lookup.lookup_a(server, hostname, self.timeout).await {
                Ok(addrs) if !addrs.is_empty() => {
                    debug!("dns: {hostname} -> {} via {server}", addrs[0]);
                    *self.preferred.lock().unwrap_or_else(|e| e.into_inner()) = Some(server);
                    return Ok(addrs[0]);
                }
                Ok(_) => failures.push(format!("{server}: empty answer")),
                Err(e) => failures.push(e.to_string()),
            }
        }

        if failures.is_empty() {
            failures.push("no resolvers configured".to_string());
        }
        Err(KnightError::Resolution(format!(
            "{hostname}: {}",
            failures.join("; ")
        )))
    }
}
