//! Authorization Engine
//!
//! Owns roles and user-to-role bindings. Roles and bindings live behind one
//! read-mostly lock, so a check never sees a half-applied assignment.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};

/// A named role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A (user, role) binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRoleBinding {
    pub user_id: String,
    pub role_id: u64,
    pub role_name: String,
}

#[derive(Debug, Default)]
struct AuthzState {
    roles: HashMap<String, Role>,
    names_by_id: HashMap<u64, String>,
    bindings: HashMap<String, BTreeSet<u64>>,
    next_id: u64,
}

/// Authorization engine
#[derive(Debug)]
pub struct AuthorizationEngine {
    state: RwLock<AuthzState>,
    clock: SharedClock,
}

impl AuthorizationEngine {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(AuthzState {
                next_id: 1,
                ..AuthzState::default()
            }),
            clock,
        }
    }

    /// Create a role; names are unique
    pub fn create_role(&self, name: &str, description: &str) -> EngineResult<Role> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::invalid("role name must not be empty"));
        }

        let mut state = self.state.write();
        if state.roles.contains_key(name) {
            return Err(EngineError::Conflict(format!("role '{}' already exists", name)));
        }

        let role = Role {
            id: state.next_id,
            name: name.to_string(),
            description: description.to_string(),
            created_at: self.clock.now(),
        };
        state.next_id += 1;
        state.names_by_id.insert(role.id, role.name.clone());
        state.roles.insert(role.name.clone(), role.clone());

        info!(role = %role.name, role_id = role.id, "Created role");
        Ok(role)
    }

    pub fn get_role(&self, name: &str) -> EngineResult<Role> {
        self.state
            .read()
            .roles
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("role", name))
    }

    /// All roles ordered by id
    pub fn list_roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.state.read().roles.values().cloned().collect();
        roles.sort_by_key(|role| role.id);
        roles
    }

    /// Bind `role_name` to `user_id`; assigning a held role is a no-op
    pub fn assign(&self, user_id: &str, role_name: &str) -> EngineResult<UserRoleBinding> {
        if user_id.trim().is_empty() {
            return Err(EngineError::invalid("user id must not be empty"));
        }

        let mut state = self.state.write();
        let role_id = state
            .roles
            .get(role_name)
            .map(|role| role.id)
            .ok_or_else(|| EngineError::not_found("role", role_name))?;

        let newly_bound = state
            .bindings
            .entry(user_id.to_string())
            .or_default()
            .insert(role_id);
        if newly_bound {
            info!(user_id, role = role_name, "Assigned role");
        } else {
            debug!(user_id, role = role_name, "Role already assigned");
        }

        Ok(UserRoleBinding {
            user_id: user_id.to_string(),
            role_id,
            role_name: role_name.to_string(),
        })
    }

    /// Remove the binding of role `role_id` from `user_id`
    pub fn remove(&self, user_id: &str, role_id: u64) -> EngineResult<()> {
        let mut state = self.state.write();
        let removed = state
            .bindings
            .get_mut(user_id)
            .is_some_and(|held| held.remove(&role_id));
        if state.bindings.get(user_id).is_some_and(BTreeSet::is_empty) {
            state.bindings.remove(user_id);
        }

        if !removed {
            return Err(EngineError::not_found(
                "role binding",
                format!("{}/{}", user_id, role_id),
            ));
        }
        info!(user_id, role_id, "Removed role");
        Ok(())
    }

    pub fn has_role(&self, user_id: &str, role_name: &str) -> bool {
        let state = self.state.read();
        match (state.roles.get(role_name), state.bindings.get(user_id)) {
            (Some(role), Some(held)) => held.contains(&role.id),
            _ => false,
        }
    }

    /// Fail with `Forbidden` unless `user_id` holds `role_name`
    pub fn require_role(&self, user_id: &str, role_name: &str) -> EngineResult<()> {
        if self.has_role(user_id, role_name) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "user {} lacks role '{}'",
                user_id, role_name
            )))
        }
    }

    /// Roles held by `user_id`, ordered by id
    pub fn list_for_user(&self, user_id: &str) -> Vec<Role> {
        let state = self.state.read();
        state
            .bindings
            .get(user_id)
            .map(|held| {
                held.iter()
                    .filter_map(|id| state.names_by_id.get(id))
                    .filter_map(|name| state.roles.get(name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
