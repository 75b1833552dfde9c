//! Per-role sessions
//!
//! The web app keeps a separate session per role so an admin and a worker can
//! be signed in from the same browser. This crate only needs what a session
//! knows about the current user, plus a way to store a user id recovered by
//! lookup, so that is all [`SessionStore`] asks for.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Application roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Accountant,
    Worker,
    Other(String),
}

impl Role {
    /// Parse a stored role string (trimmed, case-insensitive)
    pub fn parse(raw: &str) -> Self {
        let role = raw.trim().to_ascii_lowercase();
        match role.as_str() {
            "admin" => Role::Admin,
            "accountant" => Role::Accountant,
            "worker" => Role::Worker,
            _ => Role::Other(role),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::Accountant => "accountant",
            Role::Worker => "worker",
            Role::Other(s) => s,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cookie name for a role's session namespace, e.g. `pm_worker_session`
pub fn session_cookie_name(role: &Role) -> String {
    let slug: String = role
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("pm_{}_session", slug)
}

/// Who is making the current request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub role: String,
    pub user_id: Option<i64>,
    pub username: Option<String>,
}

impl Identity {
    pub fn new(role: &str, user_id: Option<i64>, username: Option<&str>) -> Self {
        Self {
            role: role.to_string(),
            user_id,
            username: username.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()),
        }
    }
}

/// What the linker needs from a session
pub trait SessionStore {
    fn identity(&self) -> Identity;

    /// Persist a user id that had to be looked up by username
    fn remember_user_id(&mut self, user_id: i64);
}

/// Session held in memory, one per role namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySession {
    cookie_name: String,
    identity: Identity,
}

impl MemorySession {
    pub fn new(identity: Identity) -> Self {
        Self {
            cookie_name: session_cookie_name(&Role::parse(&identity.role)),
            identity,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }
}

impl SessionStore for MemorySession {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn remember_user_id(&mut self, user_id: i64) {
        self.identity.user_id = Some(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("Worker "), Role::Worker);
        assert_eq!(Role::parse("ADMIN"), Role::Admin);
        assert_eq!(Role::parse("accountant"), Role::Accountant);
        assert_eq!(Role::parse("Vet"), Role::Other("vet".to_string()));
    }

    #[test]
    fn test_cookie_names_are_per_role() {
        assert_eq!(session_cookie_name(&Role::Worker), "pm_worker_session");
        assert_eq!(session_cookie_name(&Role::Admin), "pm_admin_session");
        assert_eq!(
            session_cookie_name(&Role::Other("farm hand".to_string())),
            "pm_farm_hand_session"
        );
    }

    #[test]
    fn test_memory_session_remembers_user_id() {
        let mut session = MemorySession::new(Identity::new("worker", None, Some(" bola ")));
        assert_eq!(session.cookie_name(), "pm_worker_session");
        assert_eq!(session.identity().username.as_deref(), Some("bola"));

        session.remember_user_id(42);
        assert_eq!(session.identity().user_id, Some(42));
    }

    #[test]
    fn test_blank_username_is_absent() {
        assert_eq!(Identity::new("worker", None, Some("   ")).username, None);
    }
}
