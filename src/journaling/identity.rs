use super::gateway::EntryId;
use super::version::SaveStamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Create,
    Update(EntryId),
    /// A creation is still in flight; issuing anything now would risk a
    /// duplicate record.
    Defer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Unbound,
    Creating { stamp: SaveStamp },
    Bound(EntryId),
}

/// Owns the one-time unbound → bound transition for a draft.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    binding: Binding,
}

impl IdentityResolver {
    pub fn unbound() -> Self {
        Self {
            binding: Binding::Unbound,
        }
    }

    pub fn bound(id: EntryId) -> Self {
        Self {
            binding: Binding::Bound(id),
        }
    }

    pub fn identity(&self) -> Option<EntryId> {
        match self.binding {
            Binding::Bound(id) => Some(id),
            _ => None,
        }
    }

    pub fn creation_in_flight(&self) -> bool {
        matches!(self.binding, Binding::Creating { .. })
    }

    pub fn resolve(&self) -> Resolution {
        match self.binding {
            Binding::Unbound => Resolution::Create,
            Binding::Creating { .. } => Resolution::Defer,
            Binding::Bound(id) => Resolution::Update(id),
        }
    }

    /// Must be called in the same step as `resolve` returned `Create`, before
    /// control returns to the event loop.
    pub fn begin_create(&mut self, stamp: SaveStamp) {
        debug_assert_eq!(self.binding, Binding::Unbound);
        self.binding = Binding::Creating { stamp };
    }

    /// Binds `id` if `stamp` is the creation currently in flight. Returns
    /// whether the identity was newly bound.
    pub fn finish_create(&mut self, stamp: SaveStamp, id: EntryId) -> bool {
        match self.binding {
            Binding::Creating { stamp: pending } if pending == stamp => {
                self.binding = Binding::Bound(id);
                true
            }
            _ => false,
        }
    }

    pub fn abandon_create(&mut self, stamp: SaveStamp) {
        if let Binding::Creating { stamp: pending } = self.binding {
            if pending == stamp {
                self.binding = Binding::Unbound;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn stamp(sequence: u64) -> SaveStamp {
        SaveStamp {
            version: sequence,
            sequence,
        }
    }

    #[test]
    fn defers_while_creation_in_flight() {
        let mut resolver = IdentityResolver::unbound();
        assert_eq!(resolver.resolve(), Resolution::Create);

        resolver.begin_create(stamp(1));
        assert_eq!(resolver.resolve(), Resolution::Defer);
        assert_eq!(resolver.resolve(), Resolution::Defer);

        let id = EntryId::new();
        assert!(resolver.finish_create(stamp(1), id));
        assert_matches!(resolver.resolve(), Resolution::Update(bound) if bound == id);
    }

    #[test]
    fn identity_is_never_rebound() {
        let first = EntryId::new();
        let mut resolver = IdentityResolver::bound(first);
        assert!(!resolver.finish_create(stamp(3), EntryId::new()));
        resolver.abandon_create(stamp(3));
        assert_eq!(resolver.identity(), Some(first));
    }

    #[test]
    fn failed_creation_allows_retry() {
        let mut resolver = IdentityResolver::unbound();
        resolver.begin_create(stamp(1));
        resolver.abandon_create(stamp(1));
        assert_eq!(resolver.resolve(), Resolution::Create);
        assert!(!resolver.creation_in_flight());
    }
}
