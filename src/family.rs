//! Family maps: user-chosen family numbers <-> internal small integers used
//! in kernels, plus the sorted set of families suppressed from output.

use std::collections::BTreeSet;

use dashmap::DashMap;

/// Internal small-integer family tag used by kernels and owner arrays.
pub type FamilyTag = u16;

/// Bidirectional map between user-chosen family numbers and the small
/// internal tags kernels actually branch on. Shared (read-mostly) between
/// the façade, which registers families at load time, and the CSV writer,
/// which consults `no_output_families`.
///
/// Uses a `DashMap` so that family registration (normally façade-only, at
/// load time) and lookups from either worker thread never need a
/// dedicated mutex of their own.
pub struct FamilyMap {
    user_to_internal: DashMap<u32, FamilyTag>,
    internal_to_user: DashMap<FamilyTag, u32>,
    next_internal: std::sync::atomic::AtomicU32,
    no_output_families: std::sync::RwLock<BTreeSet<FamilyTag>>,
    /// Families for which a default-applied warning has already fired, so
    /// the warning only surfaces once per unseen family number.
    warned: DashMap<u32, ()>,
}

impl Default for FamilyMap {
    fn default() -> Self {
        FamilyMap {
            user_to_internal: DashMap::new(),
            internal_to_user: DashMap::new(),
            next_internal: std::sync::atomic::AtomicU32::new(0),
            no_output_families: std::sync::RwLock::new(BTreeSet::new()),
            warned: DashMap::new(),
        }
    }
}

impl FamilyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicitly registers a user family number, returning its internal tag.
    /// Idempotent: re-registering the same number returns the same tag.
    pub fn register(&self, user_family: u32) -> FamilyTag {
        if let Some(tag) = self.user_to_internal.get(&user_family) {
            return *tag;
        }
        let tag = self.next_internal.fetch_add(1, std::sync::atomic::Ordering::Relaxed) as FamilyTag;
        self.user_to_internal.insert(user_family, tag);
        self.internal_to_user.insert(tag, user_family);
        tag
    }

    /// Resolves a user family number to its internal tag, registering it
    /// with a one-shot `tracing::warn!` if unseen.
    pub fn resolve_or_default(&self, user_family: u32) -> FamilyTag {
        if let Some(tag) = self.user_to_internal.get(&user_family) {
            return *tag;
        }
        if self.warned.insert(user_family, ()).is_none() {
            tracing::warn!(
                user_family,
                "family number unspecified; assigning default internal tag"
            );
        }
        self.register(user_family)
    }

    pub fn to_user(&self, tag: FamilyTag) -> Option<u32> {
        self.internal_to_user.get(&tag).map(|v| *v)
    }

    pub fn suppress_from_output(&self, user_family: u32) {
        let tag = self.register(user_family);
        self.no_output_families.write().unwrap().insert(tag);
    }

    pub fn is_suppressed(&self, tag: FamilyTag) -> bool {
        self.no_output_families.read().unwrap().contains(&tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        let map = FamilyMap::new();
        let a = map.register(7);
        let b = map.register(7);
        assert_eq!(a, b);
    }

    #[test]
    fn suppression_roundtrips_through_user_numbers() {
        let map = FamilyMap::new();
        let tag = map.register(3);
        map.suppress_from_output(3);
        assert!(map.is_suppressed(tag));
        assert_eq!(map.to_user(tag), Some(3));
    }

    #[test]
    fn unseen_family_resolves_with_default() {
        let map = FamilyMap::new();
        let tag1 = map.resolve_or_default(42);
        let tag2 = map.resolve_or_default(42);
        assert_eq!(tag1, tag2);
    }
}
