//! Resource names for a run and its hosts.
//!
//! Names are random rather than sequential so concurrent CI jobs sharing a
//! project never race for the same identifier.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Prefix of every test-group id this tool generates
pub const GROUP_PREFIX: &str = "gantry";

/// Compute Engine resource names are at most 63 characters.
pub const MAX_NAME_LEN: usize = 63;

/// Length of the `-xxxxxxxxxxxx` suffix [`new_host_id`] appends.
const HOST_SUFFIX_LEN: usize = 12;

/// Longest group id that still leaves room for host and firewall suffixes.
pub const MAX_GROUP_ID_LEN: usize = MAX_NAME_LEN - HOST_SUFFIX_LEN - 1;

/// `gantry-` followed by eight random hex digits.
pub fn new_test_group_id() -> String {
    let n: u32 = rand::thread_rng().r#gen();
    format!("{GROUP_PREFIX}-{n:08x}")
}

/// `<group>-<suffix>`, the suffix starting with a letter.
pub fn new_host_id(group_id: &str) -> String {
    let mut rng = rand::thread_rng();
    let first = rng.gen_range(b'a'..=b'z') as char;
    let rest: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(HOST_SUFFIX_LEN - 1)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("{group_id}-{first}{rest}")
}

pub fn external_firewall_name(group_id: &str) -> String {
    format!("{group_id}-external")
}

pub fn internal_firewall_name(group_id: &str) -> String {
    format!("{group_id}-internal")
}

/// Does `name` match `[a-z]([-a-z0-9]*[a-z0-9])?` within the length limit?
pub fn is_valid_resource_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };

    bytes.len() <= MAX_NAME_LEN
        && first.is_ascii_lowercase()
        && (last.is_ascii_lowercase() || last.is_ascii_digit())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_ids_are_prefixed_and_distinct() {
        let a = new_test_group_id();
        let b = new_test_group_id();
        assert!(a.starts_with("gantry-"), "{a}");
        assert_eq!(a.len(), "gantry-".len() + 8);
        assert!(is_valid_resource_name(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn host_ids_extend_the_group_id() {
        let group = new_test_group_id();
        let host = new_host_id(&group);
        assert!(host.starts_with(&format!("{group}-")), "{host}");
        assert_eq!(host.len(), group.len() + 1 + HOST_SUFFIX_LEN);
        assert!(is_valid_resource_name(&host), "{host}");

        let suffix = &host[group.len() + 1..];
        assert!(suffix.as_bytes()[0].is_ascii_lowercase());
    }

    #[test]
    fn host_ids_do_not_collide() {
        let group = "gantry-0badf00d";
        let ids: std::collections::HashSet<_> = (0..500).map(|_| new_host_id(group)).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn firewall_names() {
        assert_eq!(external_firewall_name("gantry-1"), "gantry-1-external");
        assert_eq!(internal_firewall_name("gantry-1"), "gantry-1-internal");
    }

    #[test]
    fn resource_name_rules() {
        assert!(is_valid_resource_name("a"));
        assert!(is_valid_resource_name("gantry-ci-42"));
        assert!(!is_valid_resource_name(""));
        assert!(!is_valid_resource_name("1abc"));
        assert!(!is_valid_resource_name("abc-"));
        assert!(!is_valid_resource_name("Abc"));
        assert!(!is_valid_resource_name("a_b"));
        assert!(!is_valid_resource_name(&"a".repeat(64)));
        assert!(is_valid_resource_name(&"a".repeat(63)));
    }
}
