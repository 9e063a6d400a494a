//! Test utilities for property-based testing
//!
//! This module provides generators and helpers for proptest.

#[cfg(test)]
pub mod generators {
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    use crate::core::network::NetworkIdentity;

    /// Generate a valid hostname (lowercase alphanumeric with inner hyphens)
    pub fn hostname() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,20}[a-z0-9]".prop_filter("Hostname must not end with a hyphen", |s| !s.ends_with('-'))
    }

    /// Generate a unicast IPv4 address
    pub fn ipv4() -> impl Strategy<Value = Ipv4Addr> {
        (1u8..=223, any::<u8>(), any::<u8>(), 1u8..=254).prop_map(|(a, b, c, d)| Ipv4Addr::new(a, b, c, d))
    }

    /// Generate a complete network identity
    pub fn identity() -> impl Strategy<Value = NetworkIdentity> {
        (hostname(), ipv4(), 8u8..=30, ipv4(), prop::collection::vec(ipv4(), 1..3)).prop_map(
            |(hostname, address, prefix_len, gateway, dns)| NetworkIdentity {
                hostname: Some(hostname),
                address: Some(address),
                prefix_len: Some(prefix_len),
                gateway: Some(gateway),
                dns,
            },
        )
    }

    /// Generate filler console output that matches no boot milestone
    pub fn console_noise() -> impl Strategy<Value = String> {
        "[a-z0-9 .\\[\\]]{0,60}\n"
    }
}

#[cfg(test)]
mod tests {
    use super::generators::*;
    use crate::core::network::is_valid_hostname;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_hostname_generator(name in hostname()) {
            prop_assert!(is_valid_hostname(&name));
        }

        #[test]
        fn test_identity_generator_is_complete(id in identity()) {
            prop_assert!(id.missing_fields().is_empty());
            prop_assert!(id.validate().is_ok());
        }
    }
}
