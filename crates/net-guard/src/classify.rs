use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while reading address lists from configuration.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid IP address '{value}': {source}")]
    InvalidAddress {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Where a client connects from, relative to the protected network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressClass {
    Internal,
    External,
}

/// Classify an address. IPv4-mapped IPv6 addresses are judged by their IPv4
/// form.
pub fn classify(ip: IpAddr) -> AddressClass {
    if is_internal(ip) {
        AddressClass::Internal
    } else {
        AddressClass::External
    }
}

/// `true` for 10/8, 172.16/12, 192.168/16, 127/8 and the IPv6 loopback.
pub fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_internal_v4(v4),
            None => v6.is_loopback(),
        },
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    // is_private covers exactly 10/8, 172.16/12 and 192.168/16
    ip.is_private() || ip.is_loopback()
}

/// Parse a configured list of textual addresses.
pub fn parse_addresses<S: AsRef<str>>(values: &[S]) -> Result<HashSet<IpAddr>, GuardError> {
    values
        .iter()
        .map(|v| {
            let value = v.as_ref().trim();
            value.parse().map_err(|source| GuardError::InvalidAddress {
                value: value.to_string(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn private_and_loopback_ranges_are_internal() {
        for addr in ["10.0.0.5", "172.20.1.1", "192.168.0.1", "127.0.0.1", "::1"] {
            assert!(is_internal(ip(addr)), "{addr} should be internal");
        }
    }

    #[test]
    fn public_addresses_are_external() {
        for addr in ["8.8.8.8", "172.32.0.1", "11.0.0.1", "2001:4860:4860::8888"] {
            assert_eq!(classify(ip(addr)), AddressClass::External, "{addr}");
        }
    }

    #[test]
    fn ipv4_mapped_addresses_use_the_ipv4_rules() {
        assert!(is_internal(ip("::ffff:192.168.1.10")));
        assert!(!is_internal(ip("::ffff:8.8.4.4")));
    }

    #[test]
    fn parse_addresses_reports_the_bad_value() {
        let set = parse_addresses(&["10.0.0.1", " 8.8.8.8 "]).unwrap();
        assert_eq!(set.len(), 2);

        let err = parse_addresses(&["10.0.0.1", "not-an-ip"]).unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));
    }
}
