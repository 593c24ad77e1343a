//! Team-role and resource-assignment permission evaluation.
//!
//! The evaluator is the single authority on what a user may do to a
//! resource. It consults only the store; it never reaches a cloud provider.
//! On store errors it fails closed and returns the empty capability set,
//! which every caller treats as forbidden.

use std::collections::BTreeSet;
use std::sync::Arc;

use gough_core::{Capabilities, Capability, TeamId, UserId};
use gough_store::{ResourceAssignment, Role, Store, TeamRole};

/// The permission evaluator.
pub struct PermissionEvaluator<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for PermissionEvaluator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

/// What one membership contributes, given the assignment's explicit grants.
///
/// Owners and admins hold the full set on any resource their team is
/// assigned. Members start from read and may be granted up to shell and
/// write explicitly. Viewers never exceed read regardless of grants.
fn membership_contribution(role: TeamRole, granted: &BTreeSet<Capability>) -> BTreeSet<Capability> {
    match role {
        TeamRole::Owner | TeamRole::Admin => Capabilities::full(false).caps,
        TeamRole::Member => {
            let ceiling = [Capability::Read, Capability::Write, Capability::Shell];
            let mut caps: BTreeSet<Capability> = granted
                .iter()
                .copied()
                .filter(|c| ceiling.contains(c))
                .collect();
            caps.insert(Capability::Read);
            caps
        }
        TeamRole::Viewer => BTreeSet::from([Capability::Read]),
    }
}

impl<S: Store> PermissionEvaluator<S> {
    /// Create an evaluator over the store.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Evaluate a user's capabilities on one resource.
    ///
    /// Global admins receive the full set immediately. Otherwise each team
    /// membership contributes the intersection of its role ceiling with the
    /// explicit assignment grants, and contributions are unioned.
    #[must_use]
    pub fn evaluate(
        &self,
        user_id: &UserId,
        resource_type: &str,
        resource_id: &str,
    ) -> Capabilities {
        match self.evaluate_inner(user_id, resource_type, resource_id) {
            Ok(caps) => caps,
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    resource_type,
                    resource_id,
                    error = %e,
                    "permission evaluation failed, failing closed"
                );
                Capabilities::none()
            }
        }
    }

    fn evaluate_inner(
        &self,
        user_id: &UserId,
        resource_type: &str,
        resource_id: &str,
    ) -> gough_store::Result<Capabilities> {
        let Some(user) = self.store.get_user(user_id)? else {
            return Ok(Capabilities::none());
        };
        if !user.active {
            return Ok(Capabilities::none());
        }
        if user.global_roles.contains(&Role::Admin) {
            return Ok(Capabilities::full(true));
        }

        let mut result = Capabilities::none();

        for membership in self.store.list_memberships_by_user(user_id)? {
            let Some(assignment) =
                self.store
                    .get_assignment(&membership.team_id, resource_type, resource_id)?
            else {
                continue;
            };

            // Assignment grants must be explicit; the membership role caps
            // what they can confer.
            let granted: BTreeSet<Capability> = assignment
                .permissions
                .iter()
                .filter_map(|p| Capability::parse(p))
                .collect();

            result.union_with(&Capabilities {
                caps: membership_contribution(membership.role, &granted),
                is_global_admin: false,
            });
        }

        Ok(result)
    }

    /// Find the membership chain that authorizes shell access, returning the
    /// team and assignment the broker should record.
    ///
    /// Returns the assignment whose grants include `shell`, reachable
    /// through a membership of rank member or higher.
    #[must_use]
    pub fn shell_grant(
        &self,
        user_id: &UserId,
        resource_type: &str,
        resource_id: &str,
    ) -> Option<(TeamId, ResourceAssignment)> {
        let memberships = self.store.list_memberships_by_user(user_id).ok()?;
        for membership in memberships {
            if membership.role == TeamRole::Viewer {
                continue;
            }
            let assignment = self
                .store
                .get_assignment(&membership.team_id, resource_type, resource_id)
                .ok()??;
            if assignment.permissions.contains("shell") {
                return Some((membership.team_id, assignment));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gough_store::{RocksStore, Team, TeamMembership, User};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<RocksStore>,
        evaluator: PermissionEvaluator<RocksStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let evaluator = PermissionEvaluator::new(Arc::clone(&store));
        Fixture {
            _dir: dir,
            store,
            evaluator,
        }
    }

    fn add_user(f: &Fixture, email: &str, roles: &[Role]) -> UserId {
        let user = User {
            id: UserId::generate(),
            email: email.to_string(),
            password_hash: String::new(),
            active: true,
            unique_token: "t".to_string(),
            global_roles: roles.iter().copied().collect(),
            created_at: Utc::now(),
        };
        f.store.put_user(&user).unwrap();
        user.id
    }

    fn add_team(f: &Fixture, owner: UserId) -> TeamId {
        let team = Team {
            id: TeamId::generate(),
            name: "ops".to_string(),
            description: String::new(),
            created_by: owner,
            active: true,
            created_at: Utc::now(),
        };
        f.store.put_team(&team).unwrap();
        team.id
    }

    fn add_membership(f: &Fixture, team: TeamId, user: UserId, role: TeamRole) {
        f.store
            .put_membership(&TeamMembership {
                team_id: team,
                user_id: user,
                role,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    fn add_assignment(f: &Fixture, team: TeamId, permissions: &[&str]) {
        f.store
            .put_assignment(&ResourceAssignment {
                team_id: team,
                resource_type: "vm".to_string(),
                resource_id: "vm-42".to_string(),
                permissions: permissions.iter().map(ToString::to_string).collect(),
                shell_principals: vec!["ubuntu".to_string()],
                created_at: Utc::now(),
            })
            .unwrap();
    }

    #[test]
    fn global_admin_short_circuits() {
        let f = fixture();
        let admin = add_user(&f, "admin@example.com", &[Role::Admin]);

        let caps = f.evaluator.evaluate(&admin, "vm", "vm-42");
        assert!(caps.is_global_admin);
        assert!(caps.contains(Capability::Shell));
        assert!(caps.contains(Capability::Admin));
    }

    #[test]
    fn member_gets_shell_through_assignment() {
        let f = fixture();
        let user = add_user(&f, "alice@example.com", &[]);
        let team = add_team(&f, user);
        add_membership(&f, team, user, TeamRole::Member);
        add_assignment(&f, team, &["shell", "read"]);

        let caps = f.evaluator.evaluate(&user, "vm", "vm-42");
        assert!(caps.contains(Capability::Shell));
        assert!(caps.contains(Capability::Read));
        assert!(!caps.contains(Capability::Admin));
        assert!(!caps.is_global_admin);
    }

    #[test]
    fn viewer_never_exceeds_read() {
        let f = fixture();
        let user = add_user(&f, "viewer@example.com", &[]);
        let team = add_team(&f, user);
        add_membership(&f, team, user, TeamRole::Viewer);
        add_assignment(&f, team, &["shell", "write", "read"]);

        let caps = f.evaluator.evaluate(&user, "vm", "vm-42");
        assert!(caps.contains(Capability::Read));
        assert!(!caps.contains(Capability::Shell));
        assert!(!caps.contains(Capability::Write));
    }

    #[test]
    fn owner_holds_full_set_on_assigned_resource() {
        let f = fixture();
        let user = add_user(&f, "owner@example.com", &[]);
        let team = add_team(&f, user);
        add_membership(&f, team, user, TeamRole::Owner);
        add_assignment(&f, team, &["read"]);

        let caps = f.evaluator.evaluate(&user, "vm", "vm-42");
        assert!(caps.contains(Capability::Shell));
        assert!(caps.contains(Capability::Admin));
    }

    #[test]
    fn no_assignment_means_forbidden() {
        let f = fixture();
        let user = add_user(&f, "alice@example.com", &[]);
        let team = add_team(&f, user);
        add_membership(&f, team, user, TeamRole::Admin);
        // No assignment for vm-42.

        let caps = f.evaluator.evaluate(&user, "vm", "vm-42");
        assert!(caps.is_empty());
    }

    #[test]
    fn inactive_user_is_forbidden() {
        let f = fixture();
        let user_id = add_user(&f, "gone@example.com", &[Role::Admin]);
        let mut user = f.store.get_user(&user_id).unwrap().unwrap();
        user.active = false;
        f.store.put_user(&user).unwrap();

        let caps = f.evaluator.evaluate(&user_id, "vm", "vm-42");
        assert!(caps.is_empty());
    }

    #[test]
    fn shell_grant_finds_the_chain() {
        let f = fixture();
        let user = add_user(&f, "alice@example.com", &[]);
        let team = add_team(&f, user);
        add_membership(&f, team, user, TeamRole::Member);
        add_assignment(&f, team, &["shell", "read"]);

        let (grant_team, assignment) = f.evaluator.shell_grant(&user, "vm", "vm-42").unwrap();
        assert_eq!(grant_team, team);
        assert_eq!(assignment.shell_principals, vec!["ubuntu"]);

        assert!(f.evaluator.shell_grant(&user, "vm", "vm-99").is_none());
    }

    #[test]
    fn viewer_has_no_shell_grant() {
        let f = fixture();
        let user = add_user(&f, "viewer@example.com", &[]);
        let team = add_team(&f, user);
        add_membership(&f, team, user, TeamRole::Viewer);
        add_assignment(&f, team, &["shell"]);

        assert!(f.evaluator.shell_grant(&user, "vm", "vm-42").is_none());
    }
}
