use std::net::IpAddr;

use anyhow::Context as _;

/// A single transfer ACL rule
#[derive(Debug, Clone, PartialEq, Eq)]
enum AclEntry {
    /// Exact address
    Address(IpAddr),
    /// CIDR block
    Network { address: IpAddr, prefix_len: u8 },
    /// Textual pattern with `*` and `?` wildcards, e.g. "192.168.*"
    Wildcard(String),
}

/// Glob match over the textual form of an address. `*` spans any run of
/// characters, `?` exactly one.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    // Iterative backtracking over the last `*` seen
    let (mut p, mut t) = (0, 0);
    let (mut star, mut star_t) = (None, 0);
    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some(p);
                star_t = t;
                p += 1;
            }
            Some('?') => {
                p += 1;
                t += 1;
            }
            Some(&c) if c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some(star_p) => {
                    p = star_p + 1;
                    star_t += 1;
                    t = star_t;
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// Decides which peers may transfer zones. An empty ACL denies everyone.
#[derive(Debug, Clone, Default)]
pub struct TransferAcl {
    entries: Vec<AclEntry>,
}

impl TransferAcl {
    pub fn parse(rules: &[String]) -> anyhow::Result<Self> {
        let entries = rules
            .iter()
            .map(|rule| AclEntry::parse(rule.trim()))
            .collect::<anyhow::Result<_>>()?;
        Ok(TransferAcl { entries })
    }

    /// An ACL that allows every peer. Used when transfers are explicitly
    /// open, e.g. in tests.
    pub fn allow_all() -> Self {
        TransferAcl {
            entries: vec![AclEntry::Wildcard("*".to_owned())],
        }
    }

    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        self.entries.iter().any(|entry| entry.matches(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AclEntry {
    fn parse(rule: &str) -> anyhow::Result<Self> {
        if let Some((address, prefix_len)) = rule.split_once('/') {
            let address: IpAddr = address
                .parse()
                .with_context(|| format!("bad network address in ACL rule '{}'", rule))?;
            let prefix_len: u8 = prefix_len
                .parse()
                .with_context(|| format!("bad prefix length in ACL rule '{}'", rule))?;
            let max_len = if address.is_ipv4() { 32 } else { 128 };
            if prefix_len > max_len {
                anyhow::bail!("prefix length {} is too long in ACL rule '{}'", prefix_len, rule);
            }
            return Ok(AclEntry::Network { address, prefix_len });
        }
        if rule.contains('*') || rule.contains('?') {
            return Ok(AclEntry::Wildcard(rule.to_owned()));
        }
        rule.parse()
            .map(AclEntry::Address)
            .with_context(|| format!("bad address in ACL rule '{}'", rule))
    }

    fn matches(&self, addr: IpAddr) -> bool {
        match self {
            AclEntry::Address(allowed) => *allowed == addr,
            AclEntry::Network { address, prefix_len } => match (address, addr) {
                (IpAddr::V4(network), IpAddr::V4(addr)) => {
                    let mask = u32::MAX.checked_shl(32 - *prefix_len as u32).unwrap_or(0);
                    (u32::from(*network) & mask) == (u32::from(addr) & mask)
                }
                (IpAddr::V6(network), IpAddr::V6(addr)) => {
                    let mask = u128::MAX.checked_shl(128 - *prefix_len as u32).unwrap_or(0);
                    (u128::from(*network) & mask) == (u128::from(addr) & mask)
                }
                _ => false,
            },
            AclEntry::Wildcard(pattern) => wildcard_match(pattern, &addr.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(rules: &[&str]) -> TransferAcl {
        TransferAcl::parse(&rules.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn empty_acl_denies_everyone() {
        let acl = TransferAcl::default();
        assert!(!acl.is_allowed("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn exact_address_rule() {
        let acl = acl(&["192.0.2.7"]);
        assert!(acl.is_allowed("192.0.2.7".parse().unwrap()));
        assert!(!acl.is_allowed("192.0.2.8".parse().unwrap()));
    }

    #[test]
    fn cidr_rule() {
        let acl = acl(&["10.1.0.0/16", "2001:db8::/32"]);
        assert!(acl.is_allowed("10.1.200.3".parse().unwrap()));
        assert!(!acl.is_allowed("10.2.0.1".parse().unwrap()));
        assert!(acl.is_allowed("2001:db8::42".parse().unwrap()));
        assert!(!acl.is_allowed("2001:db9::42".parse().unwrap()));
        // A v6 peer never matches a v4 network
        assert!(!acl.is_allowed("::ffff:10.1.0.1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn wildcard_rule() {
        let acl = acl(&["192.168.*"]);
        assert!(acl.is_allowed("192.168.44.1".parse().unwrap()));
        assert!(!acl.is_allowed("192.169.0.1".parse().unwrap()));
    }

    // `?` matches exactly one character
    #[test]
    fn single_character_wildcard_rule() {
        let acl = acl(&["10.0.0.?"]);
        assert!(acl.is_allowed("10.0.0.7".parse().unwrap()));
        assert!(!acl.is_allowed("10.0.0.77".parse().unwrap()));
    }

    #[test]
    fn wildcard_matching_backtracks() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("192.*.44.*", "192.168.44.1"));
        assert!(wildcard_match("*::1", "2001:db8::1"));
        assert!(!wildcard_match("*::2", "2001:db8::1"));
        assert!(wildcard_match("", ""));
        assert!(!wildcard_match("", "x"));
    }

    #[test]
    fn zero_prefix_allows_everything() {
        let acl = acl(&["0.0.0.0/0"]);
        assert!(acl.is_allowed("203.0.113.77".parse().unwrap()));
    }

    #[test]
    fn bad_rules_are_rejected() {
        assert!(TransferAcl::parse(&["10.0.0.0/33".to_owned()]).is_err());
        assert!(TransferAcl::parse(&["not-an-address".to_owned()]).is_err());
    }
}
