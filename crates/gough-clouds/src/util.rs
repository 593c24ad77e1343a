//! Behaviors shared across drivers.

use std::net::IpAddr;

/// Whether an address is non-routable (RFC 1918, loopback, link-local, or
/// IPv6 unique-local).
#[must_use]
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Split a provider's address list into `(public, private)`.
///
/// Unparseable strings are dropped; providers occasionally report
/// placeholders like `0.0.0.0` before an address is assigned, and those
/// classify as private.
#[must_use]
pub fn classify_ips<I, S>(addresses: I) -> (Vec<String>, Vec<String>)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut public = Vec::new();
    let mut private = Vec::new();

    for address in addresses {
        let text = address.as_ref().trim();
        if let Ok(parsed) = text.parse::<IpAddr>() {
            if is_private_ip(&parsed) {
                private.push(text.to_string());
            } else {
                public.push(text.to_string());
            }
        }
    }

    (public, private)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rfc1918_as_private() {
        let (public, private) = classify_ips(["10.0.0.5", "192.168.1.2", "203.0.113.7"]);
        assert_eq!(public, vec!["203.0.113.7"]);
        assert_eq!(private, vec!["10.0.0.5", "192.168.1.2"]);
    }

    #[test]
    fn drops_garbage_and_placeholder() {
        let (public, private) = classify_ips(["not-an-ip", "0.0.0.0"]);
        assert!(public.is_empty());
        assert_eq!(private, vec!["0.0.0.0"]);
    }

    #[test]
    fn ipv6_unique_local_is_private() {
        let (public, private) = classify_ips(["fd00::1", "2001:db8::1"]);
        assert_eq!(public, vec!["2001:db8::1"]);
        assert_eq!(private, vec!["fd00::1"]);
    }
}
