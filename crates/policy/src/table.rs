//! Concurrent rule table.

use crate::{AccessRule, RuleId};
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable, ordered view of the table at one instant.
pub type RuleSnapshot = Arc<[AccessRule]>;

/// Ordered, concurrently readable set of access rules.
///
/// Mutations build a new list and swap it in under the write lock, so a
/// snapshot is never torn: it holds either the whole list from before a
/// mutation or the whole list from after it. Snapshots are cheap to take and
/// stay valid for as long as the caller holds them.
#[derive(Debug)]
pub struct RuleTable {
    rules: RwLock<RuleSnapshot>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTable {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Append a rule. Duplicates are allowed; earlier rules take precedence.
    pub fn add(&self, rule: AccessRule) {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(rules.len() + 1);
        next.extend(rules.iter().cloned());
        next.push(rule);
        *rules = next.into();
    }

    /// Remove the first rule with the given id, returning it.
    pub fn remove(&self, id: RuleId) -> Option<AccessRule> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let index = rules.iter().position(|rule| rule.id == id)?;
        let mut next = rules.to_vec();
        let removed = next.remove(index);
        *rules = next.into();
        Some(removed)
    }

    /// Current rules in insertion order.
    pub fn snapshot(&self) -> RuleSnapshot {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessRequest, Decision, Policy, resolve};

    #[test]
    fn test_add_preserves_insertion_order() {
        let table = RuleTable::new();
        let a = AccessRule::new("/a", Policy::NoAccess);
        let b = AccessRule::new("/b", Policy::ReadOnly);
        table.add(a.clone());
        table.add(b.clone());

        let snapshot = table.snapshot();
        assert_eq!(&snapshot[..], &[a, b][..]);
    }

    #[test]
    fn test_remove_by_id_not_by_value() {
        let table = RuleTable::new();
        let first = AccessRule::new("/a", Policy::NoAccess);
        let twin = AccessRule::new("/a", Policy::NoAccess);
        table.add(first.clone());
        table.add(twin.clone());

        assert_eq!(table.remove(twin.id), Some(twin));
        assert_eq!(&table.snapshot()[..], &[first][..]);
    }

    #[test]
    fn test_remove_duplicate_drops_first_entry_only() {
        let table = RuleTable::new();
        let rule = AccessRule::new("/a", Policy::NoAccess);
        let other = AccessRule::new("/b", Policy::ReadOnly);
        table.add(rule.clone());
        table.add(other.clone());
        table.add(rule.clone());

        table.remove(rule.id);
        assert_eq!(&table.snapshot()[..], &[other, rule.clone()][..]);
        table.remove(rule.id);
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let table = RuleTable::new();
        table.add(AccessRule::new("/a", Policy::NoAccess));
        assert_eq!(table.remove(RuleId::new()), None);
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn test_add_remove_round_trip() {
        let table = RuleTable::new();
        table.add(AccessRule::new("/x", Policy::ReadOnly));
        let requests = [
            AccessRequest::read("/x/y"),
            AccessRequest::write("/x/y"),
            AccessRequest::write("/a/b"),
        ];
        let before: Vec<Decision> = requests
            .iter()
            .map(|r| resolve(r, &table.snapshot()))
            .collect();

        let rule = AccessRule::new("/a", Policy::NoAccess);
        table.add(rule.clone());
        assert_eq!(resolve(&requests[2], &table.snapshot()), Decision::Deny);
        table.remove(rule.id);

        let after: Vec<Decision> = requests
            .iter()
            .map(|r| resolve(r, &table.snapshot()))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_mutation() {
        let table = RuleTable::new();
        let rule = AccessRule::new("/a", Policy::NoAccess);
        table.add(rule.clone());

        let snapshot = table.snapshot();
        table.remove(rule.id);
        table.add(AccessRule::new("/b", Policy::NoAccess));

        assert_eq!(&snapshot[..], &[rule][..]);
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn test_concurrent_lookups_never_see_torn_table() {
        let table = RuleTable::new();
        let base: Vec<AccessRule> = (0..8)
            .map(|i| AccessRule::new(format!("/base/{i}"), Policy::ReadOnly))
            .collect();
        for rule in &base {
            table.add(rule.clone());
        }
        let extra = AccessRule::new("/extra", Policy::NoAccess);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..500 {
                    table.add(extra.clone());
                    table.remove(extra.id);
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        let snapshot = table.snapshot();
                        assert_eq!(&snapshot[..base.len()], &base[..]);
                        match snapshot.len() {
                            8 => {}
                            9 => assert_eq!(snapshot[8], extra),
                            n => panic!("torn snapshot with {n} rules"),
                        }
                    }
                });
            }
        });

        assert_eq!(&table.snapshot()[..], &base[..]);
    }
}
