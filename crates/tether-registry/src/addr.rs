//! Address Resolution
//!
//! Turns the configured service address into the address other processes can
//! actually reach:
//! - `host:port` splitting and joining with IPv6 bracket handling
//! - reachable IP extraction from local interfaces, private ranges first
//! - advertised address synthesis (`":8080"` -> `"10.1.160.78:8080"`)

use std::net::IpAddr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("missing port in address {0:?}")]
    MissingPort(String),

    #[error("too many colons in address {0:?}")]
    TooManyColons(String),

    #[error("missing ']' in address {0:?}")]
    UnclosedBracket(String),

    #[error("failed to list network interfaces: {0}")]
    Interfaces(#[from] std::io::Error),

    #[error("no IP address found, and explicit IP not provided")]
    NoAddress,
}

/// Split `host:port`, `[v6]:port` or `:port` into host and port.
///
/// The host may come back empty (`":8080"`), the port must be present.
pub fn split_host_port(addr: &str) -> Result<(String, String), AddrError> {
    if let Some(rest) = addr.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| AddrError::UnclosedBracket(addr.to_string()))?;
        let host = &rest[..end];
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| AddrError::MissingPort(addr.to_string()))?;
        if port.contains(':') {
            return Err(AddrError::TooManyColons(addr.to_string()));
        }
        return Ok((host.to_string(), port.to_string()));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| AddrError::MissingPort(addr.to_string()))?;
    if host.contains(':') {
        return Err(AddrError::TooManyColons(addr.to_string()));
    }
    Ok((host.to_string(), port.to_string()))
}

/// Join host and port, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Private (RFC 1918, CGNAT and ULA) ranges.
pub fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || (o[0] == 100 && (64..=127).contains(&o[1]))
        }
        IpAddr::V6(v6) => v6.segments()[0] & 0xff00 == 0xfd00,
    }
}

/// Pick the advertised IP out of interface addresses given in preference
/// order: the first private address wins, otherwise the last public one.
pub fn select_address<I>(candidates: I) -> Option<IpAddr>
where
    I: IntoIterator<Item = IpAddr>,
{
    let mut public = None;
    for ip in candidates {
        if is_private(&ip) {
            return Some(ip);
        }
        public = Some(ip);
    }
    public
}

fn is_unspecified_host(host: &str) -> bool {
    host.is_empty() || host == "0.0.0.0" || host == "::" || host == "[::]"
}

/// Return `host` if it names a concrete address, otherwise the best
/// reachable address of this machine.
pub fn extract(host: &str) -> Result<String, AddrError> {
    if !is_unspecified_host(host) {
        return Ok(host.to_string());
    }

    let interfaces = if_addrs::get_if_addrs()?;
    let (loopback, external): (Vec<_>, Vec<_>) =
        interfaces.into_iter().partition(|iface| iface.is_loopback());

    let ordered = external
        .iter()
        .chain(loopback.iter())
        .map(|iface| iface.ip());

    let ip = select_address(ordered).ok_or(AddrError::NoAddress)?;
    debug!(ip = %ip, "Extracted advertised IP from local interfaces");
    Ok(ip.to_string())
}

/// Build the advertised `host:port` from the configured service address,
/// asking `resolve` for the host part.
pub fn advertise_address_with<F>(service_addr: &str, resolve: F) -> Result<String, AddrError>
where
    F: FnOnce(&str) -> Result<String, AddrError>,
{
    let (host, port) = split_host_port(service_addr)?;
    let ip = resolve(&host)?;
    Ok(join_host_port(&ip, &port))
}

/// Build the advertised `host:port` using local interface extraction.
pub fn advertise_address(service_addr: &str) -> Result<String, AddrError> {
    advertise_address_with(service_addr, extract)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("10.0.0.1:2379").unwrap(),
            ("10.0.0.1".to_string(), "2379".to_string())
        );
        assert_eq!(
            split_host_port(":8080").unwrap(),
            (String::new(), "8080".to_string())
        );
        assert_eq!(
            split_host_port("[fd00::1]:9000").unwrap(),
            ("fd00::1".to_string(), "9000".to_string())
        );
        assert!(matches!(
            split_host_port("etcd.local"),
            Err(AddrError::MissingPort(_))
        ));
        assert!(matches!(
            split_host_port("[::1]"),
            Err(AddrError::MissingPort(_))
        ));
        assert!(matches!(
            split_host_port("fd00::1:9000"),
            Err(AddrError::TooManyColons(_))
        ));
        assert!(matches!(
            split_host_port("[::1:9000"),
            Err(AddrError::UnclosedBracket(_))
        ));
    }

    #[test]
    fn test_join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("10.0.0.1", "80"), "10.0.0.1:80");
        assert_eq!(join_host_port("fd00::1", "80"), "[fd00::1]:80");
    }

    #[test]
    fn test_private_ranges() {
        for ip in ["10.1.160.78", "172.16.0.1", "172.31.255.1", "192.168.1.1", "100.64.0.1", "fd12::1"] {
            assert!(is_private(&ip.parse().unwrap()), "{ip} should be private");
        }
        for ip in ["8.8.8.8", "172.32.0.1", "127.0.0.1", "100.128.0.1", "2001:db8::1", "::1"] {
            assert!(!is_private(&ip.parse().unwrap()), "{ip} should not be private");
        }
    }

    #[test]
    fn test_select_prefers_private() {
        let candidates: Vec<IpAddr> = vec![
            "203.0.113.5".parse().unwrap(),
            "10.1.160.78".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
        ];
        assert_eq!(
            select_address(candidates),
            Some("10.1.160.78".parse().unwrap())
        );
    }

    #[test]
    fn test_select_falls_back_to_last_public() {
        let candidates: Vec<IpAddr> = vec![
            "203.0.113.5".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
        ];
        assert_eq!(
            select_address(candidates),
            Some("127.0.0.1".parse().unwrap())
        );
        assert_eq!(select_address(Vec::new()), None);
    }

    #[test]
    fn test_extract_keeps_explicit_host() {
        assert_eq!(extract("svc.internal").unwrap(), "svc.internal");
        assert_eq!(extract("10.0.0.9").unwrap(), "10.0.0.9");
    }

    #[test]
    fn test_advertise_with_resolved_ip() {
        let addr = advertise_address_with(":8080", |host| {
            assert!(host.is_empty());
            Ok("10.1.160.78".to_string())
        })
        .unwrap();
        assert_eq!(addr, "10.1.160.78:8080");
    }

    #[test]
    fn test_advertise_brackets_ipv6() {
        let addr = advertise_address_with("[::]:9000", |_| Ok("fd00::5".to_string())).unwrap();
        assert_eq!(addr, "[fd00::5]:9000");
    }

    #[test]
    fn test_advertise_propagates_resolution_error() {
        let err = advertise_address_with(":8080", |_| Err(AddrError::NoAddress)).unwrap_err();
        assert!(matches!(err, AddrError::NoAddress));
    }

    #[test]
    fn test_advertise_explicit_host() {
        assert_eq!(advertise_address("10.0.0.9:7000").unwrap(), "10.0.0.9:7000");
    }
}
