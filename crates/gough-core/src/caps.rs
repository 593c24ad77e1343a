//! Capabilities emitted by the permission evaluator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// An atomic grant on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// View the resource.
    Read,
    /// Mutate the resource (machine lifecycle operations).
    Write,
    /// Open interactive shell sessions on the resource.
    Shell,
    /// Manage the resource's assignments and settings.
    Admin,
}

impl Capability {
    /// The snake_case name used in assignment permission sets.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Shell => "shell",
            Self::Admin => "admin",
        }
    }

    /// Parse a permission string as stored on a resource assignment.
    ///
    /// Unknown strings return `None`; assignments may carry grants this
    /// evaluator does not model and those are ignored, not errors.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "shell" => Some(Self::Shell),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of evaluating a user's access to one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// The granted capability set. Empty means forbidden.
    pub caps: BTreeSet<Capability>,
    /// True when the user holds the global `admin` role; implies the full
    /// capability set on every resource.
    pub is_global_admin: bool,
}

impl Capabilities {
    /// An empty (forbidden) capability set.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// The full capability set, optionally flagged as global-admin derived.
    #[must_use]
    pub fn full(is_global_admin: bool) -> Self {
        Self {
            caps: BTreeSet::from([
                Capability::Read,
                Capability::Write,
                Capability::Shell,
                Capability::Admin,
            ]),
            is_global_admin,
        }
    }

    /// Read-only access.
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            caps: BTreeSet::from([Capability::Read]),
            is_global_admin: false,
        }
    }

    /// Whether the set contains a specific capability.
    #[must_use]
    pub fn contains(&self, cap: Capability) -> bool {
        self.caps.contains(&cap)
    }

    /// Whether no capability at all was granted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// Union this set with another, in place.
    pub fn union_with(&mut self, other: &Self) {
        self.caps.extend(other.caps.iter().copied());
        self.is_global_admin |= other.is_global_admin;
    }

    /// Intersect this set with an explicit grant list, in place.
    ///
    /// Used to cap assignment grants at the team-role ceiling.
    pub fn intersect_with(&mut self, grants: &BTreeSet<Capability>) {
        self.caps.retain(|c| grants.contains(c));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_and_unknown() {
        assert_eq!(Capability::parse("shell"), Some(Capability::Shell));
        assert_eq!(Capability::parse("deploy"), None);
    }

    #[test]
    fn full_set_contains_everything() {
        let caps = Capabilities::full(true);
        assert!(caps.is_global_admin);
        for cap in [
            Capability::Read,
            Capability::Write,
            Capability::Shell,
            Capability::Admin,
        ] {
            assert!(caps.contains(cap));
        }
    }

    #[test]
    fn union_and_intersect() {
        let mut caps = Capabilities::read_only();
        caps.union_with(&Capabilities::full(false));
        assert!(caps.contains(Capability::Admin));

        let grants = BTreeSet::from([Capability::Read, Capability::Shell]);
        caps.intersect_with(&grants);
        assert!(caps.contains(Capability::Shell));
        assert!(!caps.contains(Capability::Admin));
    }

    #[test]
    fn empty_means_forbidden() {
        assert!(Capabilities::none().is_empty());
        assert!(!Capabilities::read_only().is_empty());
    }
}
