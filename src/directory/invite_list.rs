use std::collections::HashSet;

use crate::model::{Principal, PrincipalId};

/// Principals picked while composing invitations, in the order they were
/// found. Keyed by principal id, so repeated lookups of the same user never
/// add a second entry.
#[derive(Debug, Default)]
pub struct InviteList {
    ids: HashSet<PrincipalId>,
    entries: Vec<Principal>,
}

impl InviteList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the principal was already listed.
    pub fn insert(&mut self, principal: Principal) -> bool {
        if !self.ids.insert(principal.id.clone()) {
            return false;
        }
        self.entries.push(principal);
        true
    }

    #[cfg(test)]
    fn contains(&self, id: &PrincipalId) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn iter(&self) -> impl Iterator<Item = &Principal> {
        self.entries.iter()
    }

    /// Keeps only the principals whose username is still in `usernames`.
    pub fn retain_usernames<S: AsRef<str>>(&mut self, usernames: &[S]) {
        let ids = &mut self.ids;
        self.entries.retain(|p| {
            let keep = usernames.iter().any(|u| u.as_ref() == p.username);
            if !keep {
                ids.remove(&p.id);
            }
            keep
        });
    }

    pub fn drain(&mut self) -> Vec<Principal> {
        self.ids.clear();
        std::mem::take(&mut self.entries)
    }
}
