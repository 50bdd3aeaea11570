//! Outbound URL policy (SSRF protection, scheme and host restrictions).
//!
//! The policy is checked before every connection attempt, including each
//! redirect hop, so a permitted initial URL cannot be used to smuggle a
//! request to a blocked address via redirect.

use crate::guard::FetchError;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::net::lookup_host;
use url::Url;

#[derive(Debug, Clone)]
pub struct OutboundPolicy {
    /// If set, only these hosts are allowed (case-insensitive). Allow-listed
    /// hosts are also exempt from the HTTPS requirement and from the
    /// address-range checks (the entry is a deliberate exemption for that
    /// target).
    pub allowed_hosts: Option<HashSet<String>>,
    /// If true, allow plain HTTP and private/loopback/link-local/reserved
    /// destination IPs (local development mode).
    pub allow_private_networks: bool,
    /// Maximum number of redirect hops to follow.
    pub max_redirects: usize,
    /// Maximum response body size (bytes). `None` = unlimited.
    pub max_response_bytes: Option<usize>,
}

impl OutboundPolicy {
    /// Restrictive default: HTTPS only, public addresses only.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            allowed_hosts: None,
            allow_private_networks: false,
            max_redirects: 5,
            max_response_bytes: Some(4 * 1024 * 1024), // 4 MiB
        }
    }

    /// Permissive policy for local development (plain HTTP and private
    /// addresses allowed).
    #[must_use]
    pub fn local_dev() -> Self {
        Self {
            allowed_hosts: None,
            allow_private_networks: true,
            max_redirects: 5,
            max_response_bytes: None,
        }
    }

    /// [`Self::strict`] with environment overrides applied.
    ///
    /// Env:
    /// - `OPENTOOLS_ALLOW_PRIVATE_NETWORKS=1` to allow plain HTTP and
    ///   RFC1918/loopback/link-local destinations.
    /// - `OPENTOOLS_ALLOWED_HOSTS=host1,host2` to restrict hosts
    ///   (case-insensitive).
    #[must_use]
    pub fn from_env() -> Self {
        let mut policy = Self::strict();

        if env_flag("OPENTOOLS_ALLOW_PRIVATE_NETWORKS") {
            policy.allow_private_networks = true;
        }

        if let Some(set) = env_csv_set("OPENTOOLS_ALLOWED_HOSTS") {
            policy.allowed_hosts = Some(set);
        }

        policy
    }

    /// Validate a URL before making an outbound request.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::SsrfBlocked`] if the URL is disallowed by the
    /// policy (unsupported or insecure scheme, host not in the allowlist, or
    /// hostname resolving to a disallowed IP range).
    pub async fn check_url(&self, url: &Url) -> Result<(), FetchError> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(blocked(url, format!("unsupported URL scheme '{scheme}'")));
        }

        let Some(host) = url.host_str() else {
            return Err(blocked(url, "missing URL host".to_string()));
        };

        let allow_listed = self
            .allowed_hosts
            .as_ref()
            .is_some_and(|set| set.contains(&host.to_ascii_lowercase()));

        if self.allowed_hosts.is_some() && !allow_listed {
            return Err(blocked(url, format!("host '{host}' not in allowlist")));
        }

        if scheme == "http" && !self.allow_private_networks && !allow_listed {
            return Err(blocked(
                url,
                format!("plain HTTP to '{host}' is not allowed"),
            ));
        }

        // An explicit allowlist entry is a deliberate exemption for that
        // target, including from the address-range checks.
        if self.allow_private_networks || allow_listed {
            return Ok(());
        }

        // IP literal?
        if let Ok(ip) = host.parse::<IpAddr>() {
            return if is_denied_ip(ip) {
                Err(blocked(url, format!("destination IP '{ip}' is not allowed")))
            } else {
                Ok(())
            };
        }

        // Resolve hostname and validate every resolved address.
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = lookup_host((host, port))
            .await
            .map_err(|e| FetchError::Network(format!("DNS lookup failed for host '{host}': {e}")))?;

        let mut saw_any = false;
        for addr in addrs {
            saw_any = true;
            if is_denied_ip(addr.ip()) {
                return Err(blocked(
                    url,
                    format!("host '{host}' resolved to disallowed IP '{}'", addr.ip()),
                ));
            }
        }

        if !saw_any {
            return Err(FetchError::Network(format!(
                "DNS lookup returned no addresses for host '{host}'"
            )));
        }

        Ok(())
    }
}

fn blocked(url: &Url, reason: String) -> FetchError {
    tracing::warn!(url = %redact_url(url), %reason, "outbound request blocked");
    FetchError::SsrfBlocked(reason)
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_csv_set(name: &str) -> Option<HashSet<String>> {
    let raw = std::env::var(name).ok()?;
    let set: HashSet<String> = raw
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    (!set.is_empty()).then_some(set)
}

#[must_use]
pub fn redact_url(url: &Url) -> String {
    let mut u = url.clone();
    // Best-effort: drop credentials + query + fragment.
    let _ = u.set_username("");
    let _ = u.set_password(None);
    u.set_query(None);
    u.set_fragment(None);
    u.to_string()
}

#[must_use]
pub fn sanitize_reqwest_error(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    if let Some(u) = e.url() {
        msg = msg.replace(u.as_str(), &redact_url(u));
    }
    msg
}

fn is_denied_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_denied_ipv4(v4),
        IpAddr::V6(v6) => is_denied_ipv6(v6),
    }
}

fn is_denied_ipv4(ip: Ipv4Addr) -> bool {
    // Disallow:
    // - loopback
    // - private
    // - link-local (incl. metadata IPs like 169.254.169.254)
    // - unspecified/broadcast
    // - multicast
    // - CGNAT (100.64.0.0/10)
    // - reserved (240.0.0.0/4)
    if ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
    {
        return true;
    }

    // Carrier-grade NAT range.
    let oct = ip.octets();
    if oct[0] == 100 && (64..=127).contains(&oct[1]) {
        return true;
    }

    // Reserved / future use.
    if oct[0] >= 240 {
        return true;
    }

    false
}

fn is_denied_ipv6(ip: Ipv6Addr) -> bool {
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || ip.is_unique_local()
        || ip.is_unicast_link_local()
}
