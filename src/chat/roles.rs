//! C6 — Role Enforcer. §4.6, §8.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::kv::KvStore;
use crate::error::DexterResult;
use crate::types::{GuildId, RoleId, UserId};

/// The four exclusive "system" roles, in ascending priority (§4.6).
const SYSTEM_ROLE_NAMES: [(&str, u8); 4] =
    [("User", 0), ("Contributor", 1), ("Moderator", 2), ("Admin", 3)];

/// The mutually-exclusive "color" role names (§4.6).
const COLOR_ROLE_NAMES: [&str; 5] = ["Blue", "Orange", "Purple", "Yellow", "Green"];

/// Guild role administration, implemented against serenity's
/// `Member`/`Guild` APIs in `crate::gateway::handler`.
#[async_trait]
pub trait RoleAdmin: Send + Sync {
    /// All roles currently defined on the guild, as (id, name) pairs.
    async fn guild_roles(&self, guild: GuildId) -> DexterResult<Vec<(RoleId, String)>>;
    /// The role ids currently held by `user`.
    async fn member_roles(&self, guild: GuildId, user: UserId) -> DexterResult<Vec<RoleId>>;
    async fn add_role(&self, guild: GuildId, user: UserId, role: RoleId) -> DexterResult<()>;
    async fn remove_role(&self, guild: GuildId, user: UserId, role: RoleId) -> DexterResult<()>;
}

pub struct RoleEnforcer<A: RoleAdmin> {
    admin: A,
    kv: KvStore,
    default_system_role: Option<RoleId>,
}

/// One reconcile operation, for logging/testing (§4.6 "Emit add/remove
/// operations").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOp {
    Add(RoleId),
    Remove(RoleId),
}

impl<A: RoleAdmin> RoleEnforcer<A> {
    pub fn new(admin: A, kv: KvStore, default_system_role: Option<RoleId>) -> Self {
        Self {
            admin,
            kv,
            default_system_role,
        }
    }

    /// On member add/update: reconcile the system slot and the color
    /// slot. Idempotent — a second call with unchanged inputs issues
    /// zero operations (§8 invariant 7).
    pub async fn enforce(&self, guild: GuildId, user: UserId) -> DexterResult<Vec<RoleOp>> {
        let guild_roles = self.admin.guild_roles(guild).await?;
        let member_roles = self.admin.member_roles(guild, user).await?;

        let mut ops = Vec::new();
        ops.extend(self.reconcile_system_slot(guild, user, &guild_roles, &member_roles).await?);
        ops.extend(self.reconcile_color_slot(guild, user, &guild_roles, &member_roles).await?);
        Ok(ops)
    }

    async fn reconcile_system_slot(
        &self,
        guild: GuildId,
        user: UserId,
        guild_roles: &[(RoleId, String)],
        member_roles: &[RoleId],
    ) -> DexterResult<Vec<RoleOp>> {
        let system_roles: Vec<(RoleId, u8)> = SYSTEM_ROLE_NAMES
            .iter()
            .filter_map(|(name, priority)| {
                guild_roles
                    .iter()
                    .find(|(_, role_name)| role_name == name)
                    .map(|(id, _)| (*id, *priority))
            })
            .collect();

        let held: Vec<(RoleId, u8)> = system_roles
            .iter()
            .filter(|(id, _)| member_roles.contains(id))
            .copied()
            .collect();

        let keep = held
            .iter()
            .max_by_key(|(_, priority)| *priority)
            .map(|(id, _)| *id)
            .or(self.default_system_role);

        let mut ops = Vec::new();
        for (id, _) in &held {
            if Some(*id) != keep {
                if try_op(self.admin.remove_role(guild, user, *id).await)? {
                    ops.push(RoleOp::Remove(*id));
                }
            }
        }
        if let Some(id) = keep {
            if !member_roles.contains(&id) && try_op(self.admin.add_role(guild, user, id).await)? {
                ops.push(RoleOp::Add(id));
            }
        }
        Ok(ops)
    }

    async fn reconcile_color_slot(
        &self,
        guild: GuildId,
        user: UserId,
        guild_roles: &[(RoleId, String)],
        member_roles: &[RoleId],
    ) -> DexterResult<Vec<RoleOp>> {
        let mapping = self.color_role_mapping(guild, guild_roles).await?;
        if mapping.is_empty() {
            return Ok(Vec::new());
        }

        let mut held: Vec<RoleId> = mapping
            .iter()
            .map(|(_, id)| *id)
            .filter(|id| member_roles.contains(id))
            .collect();
        held.sort_unstable();

        let keep = match held.first() {
            Some(id) => *id,
            None => {
                // §4.6 "pick one deterministically from the available
                // set" — seeded from the member id rather than wall
                // clock, per the open question's recommended fix (§9).
                let mut hasher = DefaultHasher::new();
                user.hash(&mut hasher);
                let index = (hasher.finish() as usize) % mapping.len();
                mapping[index].1
            }
        };

        let mut ops = Vec::new();
        for id in &held {
            if *id != keep && try_op(self.admin.remove_role(guild, user, *id).await)? {
                ops.push(RoleOp::Remove(*id));
            }
        }
        if !member_roles.contains(&keep) && try_op(self.admin.add_role(guild, user, keep).await)? {
            ops.push(RoleOp::Add(keep));
        }
        Ok(ops)
    }

    /// Cached for 24h under `discord:roles:colors:{guild}` (§4.6, §6).
    async fn color_role_mapping(
        &self,
        guild: GuildId,
        guild_roles: &[(RoleId, String)],
    ) -> DexterResult<Vec<(String, RoleId)>> {
        if let Some(cached) = self.kv.get_color_roles(guild).await? {
            return Ok(cached.into_iter().collect());
        }

        let mapping: std::collections::HashMap<String, RoleId> = COLOR_ROLE_NAMES
            .iter()
            .filter_map(|name| {
                guild_roles
                    .iter()
                    .find(|(_, role_name)| role_name == name)
                    .map(|(id, _)| (name.to_string(), *id))
            })
            .collect();

        self.kv.put_color_roles(guild, &mapping).await?;
        Ok(mapping.into_iter().collect())
    }
}

/// §4.6 "permission-denied outcomes ... are logged with a hint and not
/// retried". Returns `Ok(true)` if the operation actually took effect,
/// `Ok(false)` if it was denied (and therefore shouldn't be counted as
/// an emitted op), and propagates any other error kind.
fn try_op(result: DexterResult<()>) -> DexterResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_permission_denied() => {
            tracing::warn!(error = %e, "role change denied by platform permissions, not retrying");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DexterError;
    use std::sync::Mutex;

    struct FakeAdmin {
        roles: Vec<(RoleId, String)>,
        member_roles: Mutex<Vec<RoleId>>,
        ops: Mutex<Vec<RoleOp>>,
    }

    #[async_trait]
    impl RoleAdmin for FakeAdmin {
        async fn guild_roles(&self, _guild: GuildId) -> DexterResult<Vec<(RoleId, String)>> {
            Ok(self.roles.clone())
        }

        async fn member_roles(&self, _guild: GuildId, _user: UserId) -> DexterResult<Vec<RoleId>> {
            Ok(self.member_roles.lock().unwrap().clone())
        }

        async fn add_role(&self, _guild: GuildId, _user: UserId, role: RoleId) -> DexterResult<()> {
            self.member_roles.lock().unwrap().push(role);
            self.ops.lock().unwrap().push(RoleOp::Add(role));
            Ok(())
        }

        async fn remove_role(&self, _guild: GuildId, _user: UserId, role: RoleId) -> DexterResult<()> {
            self.member_roles.lock().unwrap().retain(|r| *r != role);
            self.ops.lock().unwrap().push(RoleOp::Remove(role));
            Ok(())
        }
    }

    fn guild_roles() -> Vec<(RoleId, String)> {
        vec![
            (10, "User".into()),
            (11, "Contributor".into()),
            (12, "Moderator".into()),
            (13, "Admin".into()),
            (20, "Blue".into()),
            (21, "Orange".into()),
        ]
    }

    #[tokio::test]
    async fn assigns_default_system_role_when_member_has_none() {
        let admin = FakeAdmin {
            roles: guild_roles(),
            member_roles: Mutex::new(vec![]),
            ops: Mutex::new(vec![]),
        };
        let enforcer = RoleEnforcer::new(admin, KvStore::in_memory(), Some(10));
        let ops = enforcer.enforce(1, 100).await.unwrap();
        assert!(ops.contains(&RoleOp::Add(10)));
    }

    #[tokio::test]
    async fn keeps_highest_priority_system_role_and_drops_others() {
        let admin = FakeAdmin {
            roles: guild_roles(),
            member_roles: Mutex::new(vec![10, 12]), // User + Moderator
            ops: Mutex::new(vec![]),
        };
        let enforcer = RoleEnforcer::new(admin, KvStore::in_memory(), Some(10));
        let ops = enforcer.enforce(1, 100).await.unwrap();
        assert!(ops.contains(&RoleOp::Remove(10)));
        assert!(!ops.iter().any(|op| matches!(op, RoleOp::Remove(12))));
    }

    #[tokio::test]
    async fn second_enforce_with_unchanged_state_is_a_noop() {
        let admin = FakeAdmin {
            roles: guild_roles(),
            member_roles: Mutex::new(vec![10, 20]),
            ops: Mutex::new(vec![]),
        };
        let enforcer = RoleEnforcer::new(admin, KvStore::in_memory(), Some(10));
        enforcer.enforce(1, 100).await.unwrap();
        let ops = enforcer.enforce(1, 100).await.unwrap();
        assert!(ops.is_empty());
    }

    #[tokio::test]
    async fn multiple_color_roles_keeps_lowest_id_and_drops_rest() {
        let admin = FakeAdmin {
            roles: guild_roles(),
            member_roles: Mutex::new(vec![20, 21]),
            ops: Mutex::new(vec![]),
        };
        let enforcer = RoleEnforcer::new(admin, KvStore::in_memory(), Some(10));
        let ops = enforcer.enforce(1, 100).await.unwrap();
        assert!(ops.contains(&RoleOp::Remove(21)));
    }

    struct DenyingAdmin;

    #[async_trait]
    impl RoleAdmin for DenyingAdmin {
        async fn guild_roles(&self, _guild: GuildId) -> DexterResult<Vec<(RoleId, String)>> {
            Ok(guild_roles())
        }
        async fn member_roles(&self, _guild: GuildId, _user: UserId) -> DexterResult<Vec<RoleId>> {
            Ok(vec![])
        }
        async fn add_role(&self, _guild: GuildId, _user: UserId, _role: RoleId) -> DexterResult<()> {
            Err(DexterError::PermissionDenied("missing permissions".into()))
        }
        async fn remove_role(&self, _guild: GuildId, _user: UserId, _role: RoleId) -> DexterResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn permission_denied_is_logged_not_propagated() {
        let enforcer = RoleEnforcer::new(DenyingAdmin, KvStore::in_memory(), Some(10));
        let result = enforcer.enforce(1, 100).await;
        assert!(result.is_ok());
    }
}
