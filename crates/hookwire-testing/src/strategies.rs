//! Proptest strategies for hookwire domain values.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use proptest::prelude::*;

/// DNS labels joined into a host name of two to four labels.
pub fn domain() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z][a-z0-9]{0,9}", 2..5).prop_map(|labels| labels.join("."))
}

/// Any IPv4 address.
pub fn ipv4() -> impl Strategy<Value = IpAddr> {
    any::<u32>().prop_map(|bits| IpAddr::V4(Ipv4Addr::from(bits)))
}

/// Any IPv6 address.
pub fn ipv6() -> impl Strategy<Value = IpAddr> {
    any::<u128>().prop_map(|bits| IpAddr::V6(Ipv6Addr::from(bits)))
}

/// Any IP address, either family.
pub fn ip() -> impl Strategy<Value = IpAddr> {
    prop_oneof![ipv4(), ipv6()]
}

/// Addresses inside `10.0.0.0/8`, `172.16.0.0/12` or `192.168.0.0/16`.
pub fn private_ipv4() -> impl Strategy<Value = IpAddr> {
    prop_oneof![
        any::<[u8; 3]>().prop_map(|[b, c, d]| Ipv4Addr::new(10, b, c, d)),
        (16u8..32, any::<[u8; 2]>()).prop_map(|(b, [c, d])| Ipv4Addr::new(172, b, c, d)),
        any::<[u8; 2]>().prop_map(|[c, d]| Ipv4Addr::new(192, 168, c, d)),
    ]
    .prop_map(IpAddr::V4)
}

/// Addresses inside `127.0.0.0/8`.
pub fn loopback_ipv4() -> impl Strategy<Value = IpAddr> {
    any::<[u8; 3]>().prop_map(|[b, c, d]| IpAddr::V4(Ipv4Addr::new(127, b, c, d)))
}
