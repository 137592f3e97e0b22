//! Best-effort DNS SRV discovery for addresses without an explicit port.
//!
//! Discovery never fails a request: any lookup error means "use the address
//! as configured".

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use log::debug;
use tokio::sync::OnceCell;

/// A discovered host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    /// Target host, without the trailing root dot.
    pub host: String,
    /// Target port.
    pub port: u16,
}

/// Resolves `_http._tcp` SRV records for a host.
#[async_trait]
pub trait SrvResolver: Send + Sync + fmt::Debug {
    /// The highest-priority target for `host`, or `None` when there is no
    /// usable record or the lookup fails.
    async fn lookup(&self, host: &str) -> Option<SrvTarget>;
}

/// Resolver backed by the system DNS configuration.
///
/// The underlying resolver is created on first use.
#[derive(Default)]
pub struct DnsSrvResolver {
    resolver: OnceCell<Option<TokioAsyncResolver>>,
}

impl fmt::Debug for DnsSrvResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsSrvResolver")
            .field("initialized", &self.resolver.initialized())
            .finish()
    }
}

impl DnsSrvResolver {
    /// Create a resolver; system configuration is read lazily.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolver(&self) -> Option<&TokioAsyncResolver> {
        self.resolver
            .get_or_init(|| async {
                TokioAsyncResolver::tokio_from_system_conf()
                    .map_err(|e| debug!("SRV discovery disabled: {e}"))
                    .ok()
            })
            .await
            .as_ref()
    }
}

#[async_trait]
impl SrvResolver for DnsSrvResolver {
    async fn lookup(&self, host: &str) -> Option<SrvTarget> {
        if host.parse::<IpAddr>().is_ok() || host.eq_ignore_ascii_case("localhost") {
            return None;
        }

        let resolver = self.resolver().await?;
        let name = format!("_http._tcp.{}.", host.trim_end_matches('.'));
        let lookup = resolver
            .srv_lookup(name.as_str())
            .await
            .map_err(|e| debug!("SRV lookup for {name} failed: {e}"))
            .ok()?;

        let best = lookup
            .iter()
            .min_by_key(|srv| (srv.priority(), std::cmp::Reverse(srv.weight())))?;
        let target = best.target().to_utf8();
        let target = target.trim_end_matches('.');
        if target.is_empty() {
            return None;
        }

        Some(SrvTarget {
            host: target.to_string(),
            port: best.port(),
        })
    }
}

/// A resolver that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSrvResolver;

#[async_trait]
impl SrvResolver for NoSrvResolver {
    async fn lookup(&self, _host: &str) -> Option<SrvTarget> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_and_localhost_hosts_skip_lookup() {
        let resolver = DnsSrvResolver::new();
        assert_eq!(resolver.lookup("127.0.0.1").await, None);
        assert_eq!(resolver.lookup("::1").await, None);
        assert_eq!(resolver.lookup("localhost").await, None);
        assert!(!resolver.resolver.initialized());
    }

    #[tokio::test]
    async fn no_resolver_finds_nothing() {
        assert_eq!(NoSrvResolver.lookup("vault.example.com").await, None);
    }
}
