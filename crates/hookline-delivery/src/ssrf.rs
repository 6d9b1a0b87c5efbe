//! Outbound address hardening.
//!
//! Destinations are user-supplied URLs, so the dispatcher never dials an
//! address from the private, loopback, link-local, or otherwise reserved
//! ranges. Resolution happens once per dispatch and the chosen address is
//! pinned for the connection while TLS keeps the original hostname as SNI.

use std::{
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::LazyLock,
};

use ipnet::{Ipv4Net, Ipv6Net};

use crate::error::{DeliveryError, Result};

static BLOCKED_V4: LazyLock<Vec<Ipv4Net>> = LazyLock::new(|| {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "0.0.0.0/8",
        "192.0.0.0/24",
        "100.64.0.0/10",
        "198.18.0.0/15",
        "224.0.0.0/4",
        "240.0.0.0/4",
    ]
    .iter()
    .map(|p| p.parse().expect("static prefix"))
    .collect()
});

static BLOCKED_V6: LazyLock<Vec<Ipv6Net>> = LazyLock::new(|| {
    [
        "::1/128",
        "::/128",
        "fe80::/10",
        "fc00::/7",
        "::ffff:0:0/96",
        "2001:db8::/32",
        "ff00::/8",
    ]
    .iter()
    .map(|p| p.parse().expect("static prefix"))
    .collect()
});

/// True when the address falls in a range the dispatcher refuses to dial.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => BLOCKED_V4.iter().any(|net| net.contains(&v4)),
        IpAddr::V6(v6) => BLOCKED_V6.iter().any(|net| net.contains(&v6)),
    }
}

/// Hostname resolution seam.
///
/// Production uses the system resolver; tests supply fixed tables so SSRF
/// and pinning behavior is deterministic.
pub trait Resolver: Send + Sync {
    /// Resolves a hostname to candidate addresses.
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + '_>>;
}

/// System DNS resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + '_>> {
        let host = host.to_string();
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host.as_str(), port)).await?;
            Ok(addrs.map(|a| a.ip()).collect())
        })
    }
}

/// Resolves a host and picks the first address outside the block sets.
///
/// IP-literal hosts skip DNS but still pass the block check. With
/// `allow_private` (local deployments, tests) the block sets are not
/// consulted.
pub async fn resolve_pinned(
    resolver: &dyn Resolver,
    host: &str,
    port: u16,
    allow_private: bool,
) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if !allow_private && is_blocked_ip(ip) {
            return Err(DeliveryError::ssrf_blocked(host));
        }
        return Ok(SocketAddr::new(ip, port));
    }

    let ips = resolver.resolve(host, port).await.map_err(|e| DeliveryError::dns(e.to_string()))?;
    if ips.is_empty() {
        return Err(DeliveryError::dns(format!("no addresses for {host}")));
    }

    ips.into_iter()
        .find(|ip| allow_private || !is_blocked_ip(*ip))
        .map(|ip| SocketAddr::new(ip, port))
        .ok_or_else(|| DeliveryError::ssrf_blocked(host))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Resolver backed by a fixed answer.
    struct FixedResolver(Vec<IpAddr>);

    impl Resolver for FixedResolver {
        fn resolve(
            &self,
            _host: &str,
            _port: u16,
        ) -> Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + '_>> {
            let ips = self.0.clone();
            Box::pin(async move { Ok(ips) })
        }
    }

    #[test]
    fn ipv4_block_set_covers_spec_ranges() {
        for blocked in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254",
            "0.0.0.0",
            "192.0.0.10",
            "100.64.0.1",
            "198.18.0.1",
            "224.0.0.1",
            "240.0.0.1",
        ] {
            let ip: IpAddr = blocked.parse().unwrap();
            assert!(is_blocked_ip(ip), "{blocked} should be blocked");
        }

        for allowed in ["8.8.8.8", "93.184.216.34", "172.32.0.1", "192.0.1.1"] {
            let ip: IpAddr = allowed.parse().unwrap();
            assert!(!is_blocked_ip(ip), "{allowed} should be allowed");
        }
    }

    #[test]
    fn ipv6_block_set_covers_spec_ranges() {
        for blocked in ["::1", "::", "fe80::1", "fc00::1", "fdab::1", "::ffff:10.0.0.1", "2001:db8::1", "ff02::1"]
        {
            let ip: IpAddr = blocked.parse().unwrap();
            assert!(is_blocked_ip(ip), "{blocked} should be blocked");
        }

        let ip: IpAddr = "2606:4700::1111".parse().unwrap();
        assert!(!is_blocked_ip(ip));
    }

    #[tokio::test]
    async fn metadata_endpoint_is_refused_without_dialing() {
        let resolver = FixedResolver(vec![]);
        let err = resolve_pinned(&resolver, "169.254.169.254", 80, false).await.unwrap_err();
        assert!(matches!(err, DeliveryError::SsrfBlocked { .. }));
    }

    #[tokio::test]
    async fn first_allowed_address_wins() {
        let resolver = FixedResolver(vec![
            "10.0.0.5".parse().unwrap(),
            "93.184.216.34".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
        ]);

        let addr = resolve_pinned(&resolver, "mixed.example", 443, false).await.unwrap();
        assert_eq!(addr.ip(), "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port(), 443);
    }

    #[tokio::test]
    async fn all_blocked_is_ssrf_error() {
        let resolver =
            FixedResolver(vec!["10.0.0.5".parse().unwrap(), "192.168.0.9".parse().unwrap()]);

        let err = resolve_pinned(&resolver, "internal.example", 443, false).await.unwrap_err();
        assert!(matches!(err, DeliveryError::SsrfBlocked { .. }));
    }

    #[tokio::test]
    async fn allow_private_bypasses_block_sets() {
        let resolver = FixedResolver(vec!["127.0.0.1".parse().unwrap()]);
        let addr = resolve_pinned(&resolver, "localhost", 8080, true).await.unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
