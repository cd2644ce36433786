//! Property tests for the destination URL policy.

use std::net::{Ipv4Addr, Ipv6Addr};

use courier_core::{validate_destination_url, ValidationError};
use proptest::prelude::*;

fn private_ipv4() -> impl Strategy<Value = Ipv4Addr> {
    prop_oneof![
        any::<[u8; 3]>().prop_map(|[b, c, d]| Ipv4Addr::new(10, b, c, d)),
        (16_u8..32, any::<[u8; 2]>()).prop_map(|(b, [c, d])| Ipv4Addr::new(172, b, c, d)),
        any::<[u8; 2]>().prop_map(|[c, d]| Ipv4Addr::new(192, 168, c, d)),
        any::<[u8; 2]>().prop_map(|[c, d]| Ipv4Addr::new(169, 254, c, d)),
        (64_u8..128, any::<[u8; 2]>()).prop_map(|(b, [c, d])| Ipv4Addr::new(100, b, c, d)),
    ]
}

fn unroutable_ipv4() -> impl Strategy<Value = Ipv4Addr> {
    prop_oneof![
        (224_u8..=255, any::<[u8; 3]>()).prop_map(|(a, [b, c, d])| Ipv4Addr::new(a, b, c, d)),
        (18_u8..20, any::<[u8; 2]>()).prop_map(|(b, [c, d])| Ipv4Addr::new(198, b, c, d)),
    ]
}

fn loopback_ipv4() -> impl Strategy<Value = Ipv4Addr> {
    any::<[u8; 3]>().prop_map(|[b, c, d]| Ipv4Addr::new(127, b, c, d))
}

proptest! {
    #[test]
    fn private_ranges_are_rejected(ip in private_ipv4(), path in "[a-z/]{0,20}") {
        let url = format!("https://{ip}/{path}");
        prop_assert_eq!(
            validate_destination_url(&url),
            Err(ValidationError::PrivateAddress(ip.to_string()))
        );
    }

    #[test]
    fn multicast_reserved_and_benchmark_ranges_are_rejected(ip in unroutable_ipv4()) {
        prop_assert_eq!(
            validate_destination_url(&format!("https://{}/hook", ip)),
            Err(ValidationError::PrivateAddress(ip.to_string()))
        );
    }

    #[test]
    fn private_ipv4_inside_ipv6_is_rejected(ip in private_ipv4()) {
        let [hi, lo] = [(u32::from(ip) >> 16) as u16, u32::from(ip) as u16];
        let nat64 = Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, hi, lo);
        let compatible = Ipv6Addr::new(0, 0, 0, 0, 0, 0, hi, lo);
        for embedded in [nat64, compatible] {
            let url = format!("https://[{}]/hook", embedded);
            prop_assert_eq!(validate_destination_url(&url), Err(ValidationError::PrivateAddress(ip.to_string())));
        }
    }

    #[test]
    fn ipv6_multicast_is_rejected(scope in 0_u16..0x100, segments in any::<[u16; 7]>()) {
        let ip = Ipv6Addr::new(
            0xff00 | scope,
            segments[0],
            segments[1],
            segments[2],
            segments[3],
            segments[4],
            segments[5],
            segments[6],
        );
        let url = format!("https://[{}]/hook", ip);
        prop_assert!(matches!(validate_destination_url(&url), Err(ValidationError::PrivateAddress(_))));
    }

    #[test]
    fn loopback_is_rejected_in_any_notation(ip in loopback_ipv4()) {
        let dotted = format!("https://{ip}/hook");
        prop_assert!(matches!(validate_destination_url(&dotted), Err(ValidationError::Loopback(_))));

        let decimal = format!("https://{}/hook", u32::from(ip));
        prop_assert!(matches!(validate_destination_url(&decimal), Err(ValidationError::Loopback(_))));

        let mapped = format!("https://[{}]/hook", ip.to_ipv6_mapped());
        prop_assert!(matches!(validate_destination_url(&mapped), Err(ValidationError::Loopback(_))));
    }

    #[test]
    fn unique_local_ipv6_is_rejected(segments in any::<[u16; 7]>(), low in 0_u16..0x200) {
        let ip = Ipv6Addr::new(
            0xfc00 | low,
            segments[0],
            segments[1],
            segments[2],
            segments[3],
            segments[4],
            segments[5],
            segments[6],
        );
        let url = format!("https://[{ip}]/hook");
        prop_assert!(matches!(validate_destination_url(&url), Err(ValidationError::PrivateAddress(_))));
    }

    #[test]
    fn any_non_https_scheme_is_rejected(scheme in "(http|ftp|ws|wss|gopher|file)") {
        prop_assert_eq!(
            validate_destination_url(&format!("{}://hooks.partner.example/x", scheme)),
            Err(ValidationError::InsecureScheme)
        );
    }

    #[test]
    fn public_hostnames_are_accepted(
        label in "[a-z][a-z0-9-]{0,20}[a-z0-9]",
        tld in "(com|org|io|net|example)",
        path in "[a-z0-9/_-]{0,30}",
    ) {
        prop_assume!(label != "localhost" && label != "metadata");
        let url = format!("https://{label}.{tld}/{path}");
        prop_assert!(validate_destination_url(&url).is_ok(), "rejected {}", url);
    }

    #[test]
    fn internal_suffixes_are_rejected(label in "[a-z]{1,12}", suffix in "(internal|local)") {
        let url = format!("https://{label}.{suffix}/hook");
        prop_assert!(matches!(validate_destination_url(&url), Err(ValidationError::ReservedHostname(_))));
    }
}

#[test]
fn metadata_endpoints_are_rejected() {
    for url in [
        "https://169.254.169.254/latest/meta-data",
        "https://metadata.google.internal/computeMetadata/v1",
        "https://metadata/",
        "https://[fe80::1]/hook",
        "https://0.0.0.0/hook",
        "https://localhost:8443/hook",
    ] {
        assert!(validate_destination_url(url).is_err(), "accepted {url}");
    }
}
