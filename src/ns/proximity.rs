//! Proximity-based resolution.
//!
//! Resolution favors the active server numerically closest to the caller's
//! IPv4 address. Crude, but on the flat networks this targets it keeps
//! clients on their nearest host.

use crate::types::addr_ipv4;
use std::net::IpAddr;

/// Numeric distance between two IPv4 addresses.
fn ip_distance(a: std::net::Ipv4Addr, b: std::net::Ipv4Addr) -> u32 {
    u32::from(a).abs_diff(u32::from(b))
}

/// Pick the candidate address closest to `caller`. Candidates whose IPv4
/// cannot be parsed are skipped; a non-IPv4 caller gets the first parseable
/// candidate. Callers shuffle the slice beforehand to spread exact ties.
pub fn find_closest_ip(caller: IpAddr, candidates: &[String]) -> Option<String> {
    let IpAddr::V4(caller) = caller else {
        return candidates.iter().find(|c| addr_ipv4(c).is_some()).cloned();
    };

    candidates
        .iter()
        .filter_map(|addr| addr_ipv4(addr).map(|ip| (addr, ip_distance(caller, ip))))
        .min_by_key(|(_, dist)| *dist)
        .map(|(addr, _)| addr.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_numerically_nearest() {
        let candidates = vec![
            "http://10.0.0.5:4000".to_string(),
            "http://192.168.1.2:4000".to_string(),
        ];
        let caller: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(
            find_closest_ip(caller, &candidates).as_deref(),
            Some("http://10.0.0.5:4000")
        );
    }

    #[test]
    fn skips_unparseable_candidates() {
        let candidates = vec![
            "garbage".to_string(),
            "http://10.0.0.7:4000".to_string(),
        ];
        let caller: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            find_closest_ip(caller, &candidates).as_deref(),
            Some("http://10.0.0.7:4000")
        );
    }

    #[test]
    fn empty_candidates_yield_none() {
        let caller: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(find_closest_ip(caller, &[]), None);
    }
}
