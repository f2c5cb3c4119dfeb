//! Client network whitelist (CIDR based ACL).

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::CoreError;

/// Three-state ACL: absent list allows everyone, empty list denies everyone,
/// otherwise a client is served iff some network contains its address.
pub struct NetworkWhitelist {
    networks: Option<Vec<IpNet>>,
}

impl NetworkWhitelist {
    pub fn from_config(list: Option<&[String]>) -> Self {
        let networks = list.map(|entries| {
            entries
                .iter()
                .filter_map(|raw| match raw.trim().parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(e) => {
                        tracing::warn!("[acl] Ignoring bad whitelist entry '{}': {}", raw, e);
                        None
                    }
                })
                .collect::<Vec<IpNet>>()
        });
        if let Some(nets) = &networks {
            tracing::info!("[acl] Whitelist active with {} network(s)", nets.len());
        }
        Self { networks }
    }

    pub fn permits(&self, ip: IpAddr) -> bool {
        match &self.networks {
            None => true,
            Some(nets) => nets.iter().any(|net| net.contains(&ip)),
        }
    }

    pub fn authorize(&self, ip: IpAddr) -> Result<(), CoreError> {
        if self.permits(ip) {
            Ok(())
        } else {
            Err(CoreError::Unauthorized(ip))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_whitelist_allows_everyone() {
        let acl = NetworkWhitelist::from_config(None);
        assert!(acl.permits("192.0.2.5".parse().unwrap()));
        assert!(acl.permits("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn empty_whitelist_denies_everyone() {
        let acl = NetworkWhitelist::from_config(Some(&[]));
        assert!(!acl.permits("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn membership_is_checked_against_each_network() {
        let nets = vec!["10.0.0.0/8".to_string(), "2001:db8::/32".to_string()];
        let acl = NetworkWhitelist::from_config(Some(&nets));
        assert!(acl.permits("10.20.30.40".parse().unwrap()));
        assert!(acl.permits("2001:db8::beef".parse().unwrap()));
        assert!(!acl.permits("192.0.2.5".parse().unwrap()));
    }

    #[test]
    fn bad_entries_are_skipped() {
        let nets = vec!["not-a-cidr".to_string(), "10.0.0.0/8".to_string()];
        let acl = NetworkWhitelist::from_config(Some(&nets));
        assert!(acl.permits("10.1.1.1".parse().unwrap()));
        assert!(!acl.permits("11.1.1.1".parse().unwrap()));
    }
}
