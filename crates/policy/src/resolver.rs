//! Decision resolution.

use crate::{AccessRequest, AccessRule, AccessType, Decision, Policy};

/// Resolve `request` against `rules`.
///
/// Rules are scanned in insertion order and the first one whose prefix
/// matches the request path decides, even if a later rule is more specific.
/// Paths are compared literally; normalization is the caller's job.
pub fn resolve(request: &AccessRequest, rules: &[AccessRule]) -> Decision {
    match rules.iter().find(|rule| rule.matches(&request.path)) {
        Some(rule) => apply(rule.policy, request.access),
        // Unmonitored path.
        None => Decision::Allow,
    }
}

fn apply(policy: Policy, access: AccessType) -> Decision {
    match (policy, access) {
        (Policy::ReadWrite, _) => Decision::Allow,
        (Policy::ReadOnly, AccessType::Read) => Decision::Allow,
        (Policy::ReadOnly, AccessType::Write) => Decision::Deny,
        (Policy::NoAccess, _) => Decision::Deny,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rules_allow() {
        assert_eq!(resolve(&AccessRequest::write("/etc/passwd"), &[]), Decision::Allow);
        assert_eq!(resolve(&AccessRequest::read(""), &[]), Decision::Allow);
    }

    #[test]
    fn test_first_match_wins_over_more_specific() {
        let rules = vec![
            AccessRule::new("/a", Policy::NoAccess),
            AccessRule::new("/a/b", Policy::ReadWrite),
        ];
        assert_eq!(resolve(&AccessRequest::write("/a/b/file"), &rules), Decision::Deny);

        let reordered = vec![rules[1].clone(), rules[0].clone()];
        assert_eq!(resolve(&AccessRequest::write("/a/b/file"), &reordered), Decision::Allow);
        assert_eq!(resolve(&AccessRequest::write("/a/c"), &reordered), Decision::Deny);
    }

    #[test]
    fn test_read_only_boundary() {
        let rules = vec![AccessRule::new("/x", Policy::ReadOnly)];
        assert_eq!(resolve(&AccessRequest::read("/x/y"), &rules), Decision::Allow);
        assert_eq!(resolve(&AccessRequest::write("/x/y"), &rules), Decision::Deny);
    }

    #[test]
    fn test_no_access_denies_everything() {
        let rules = vec![AccessRule::new("/secret", Policy::NoAccess)];
        assert_eq!(resolve(&AccessRequest::read("/secret/data.txt"), &rules), Decision::Deny);
        assert_eq!(resolve(&AccessRequest::write("/secret"), &rules), Decision::Deny);
        assert_eq!(resolve(&AccessRequest::read("/public"), &rules), Decision::Allow);
    }

    #[test]
    fn test_prefix_is_literal() {
        // No component boundary: "/home/al" also covers "/home/alice".
        let rules = vec![AccessRule::new("/home/al", Policy::NoAccess)];
        assert_eq!(resolve(&AccessRequest::read("/home/alice/x"), &rules), Decision::Deny);

        // No glob or `..` handling.
        let rules = vec![AccessRule::new("/data/*", Policy::NoAccess)];
        assert_eq!(resolve(&AccessRequest::read("/data/file"), &rules), Decision::Allow);
        let rules = vec![AccessRule::new("/data", Policy::NoAccess)];
        assert_eq!(resolve(&AccessRequest::read("/tmp/../data/f"), &rules), Decision::Allow);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let rules = vec![
            AccessRule::new("/x", Policy::ReadOnly),
            AccessRule::new("/", Policy::NoAccess),
        ];
        let request = AccessRequest::write("/x/y");
        let first = resolve(&request, &rules);
        for _ in 0..10 {
            assert_eq!(resolve(&request, &rules), first);
        }
        assert_eq!(rules.len(), 2);
    }
}
