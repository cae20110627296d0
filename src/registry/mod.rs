//! Broadcast registry for pub/sub routing
//!
//! Maps stream names to the sessions joined under them. Each group has at
//! most one publisher and any number of subscribers; a session belongs to at
//! most one group at a time.
//!
//! ```text
//!                       BroadcastRegistry
//!                 ┌──────────────────────────────┐
//!                 │ groups: HashMap<name,        │
//!                 │   BroadcastGroup {           │
//!                 │     publisher: Option<id>,   │
//!                 │     subscribers: Vec<id>,    │
//!                 │   }>                         │
//!                 │ membership: HashMap<id, name>│
//!                 └──────────────┬───────────────┘
//!                                │ relay_targets(publisher)
//!            ┌───────────────────┼───────────────────┐
//!            ▼                   ▼                   ▼
//!      [Subscriber]        [Subscriber]        [Subscriber]
//! ```
//!
//! The registry is owned by a single worker and passed explicitly to the
//! code that needs it; it holds no locks.

use std::collections::HashMap;
use std::fmt;

use crate::session::SessionId;

/// Role of a session within a broadcast group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
}

/// Registry operation failures; recoverable at the command level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The stream name already has a publisher
    AlreadyPublishing(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyPublishing(name) => {
                write!(f, "Stream already publishing: {}", name)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Sessions joined under one stream name
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    publisher: Option<SessionId>,
    subscribers: Vec<SessionId>,
}

impl BroadcastGroup {
    pub fn publisher(&self) -> Option<SessionId> {
        self.publisher
    }

    /// Subscribers in join order
    pub fn subscribers(&self) -> &[SessionId] {
        &self.subscribers
    }

    fn is_empty(&self) -> bool {
        self.publisher.is_none() && self.subscribers.is_empty()
    }
}

/// Outcome of a session leaving its group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub session: SessionId,
    pub name: String,
    pub role: Role,
    /// Subscribers still in the group; they need notifying when a publisher leaves
    pub remaining_subscribers: Vec<SessionId>,
}

/// Stream name to group mapping
#[derive(Debug, Default)]
pub struct BroadcastRegistry {
    groups: HashMap<String, BroadcastGroup>,
    membership: HashMap<SessionId, (String, Role)>,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `session` to the group for `name`
    ///
    /// A session already joined elsewhere leaves its previous group first;
    /// that departure is returned. A second publisher for a name is
    /// rejected and leaves every membership untouched.
    pub fn join(
        &mut self,
        session: SessionId,
        name: &str,
        role: Role,
    ) -> Result<Option<Departure>, RegistryError> {
        if let Some((current, current_role)) = self.membership.get(&session) {
            if current == name && *current_role == role {
                return Ok(None);
            }
        }

        if role == Role::Publisher {
            if let Some(group) = self.groups.get(name) {
                if group.publisher.is_some() && group.publisher != Some(session) {
                    return Err(RegistryError::AlreadyPublishing(name.to_string()));
                }
            }
        }

        let departure = self.leave(session);

        let group = self.groups.entry(name.to_string()).or_default();
        match role {
            Role::Publisher => group.publisher = Some(session),
            Role::Subscriber => group.subscribers.push(session),
        }
        self.membership.insert(session, (name.to_string(), role));

        tracing::debug!(
            session_id = session,
            stream = %name,
            role = ?role,
            subscribers = group.subscribers.len(),
            "Joined broadcast group"
        );

        Ok(departure)
    }

    /// Remove `session` from its group, deleting the group once empty
    pub fn leave(&mut self, session: SessionId) -> Option<Departure> {
        let (name, role) = self.membership.remove(&session)?;

        let mut remaining_subscribers = Vec::new();
        let mut now_empty = false;
        if let Some(group) = self.groups.get_mut(&name) {
            match role {
                Role::Publisher => {
                    if group.publisher == Some(session) {
                        group.publisher = None;
                    }
                }
                Role::Subscriber => group.subscribers.retain(|id| *id != session),
            }
            remaining_subscribers = group.subscribers.clone();
            now_empty = group.is_empty();
        }

        if now_empty {
            self.groups.remove(&name);
            tracing::debug!(stream = %name, "Broadcast group removed");
        }

        tracing::debug!(session_id = session, stream = %name, role = ?role, "Left broadcast group");

        Some(Departure {
            session,
            name,
            role,
            remaining_subscribers,
        })
    }

    /// Sessions that should receive media sent by `sender`
    ///
    /// Empty unless `sender` is the publisher of its group.
    pub fn relay_targets(&self, sender: SessionId) -> &[SessionId] {
        match self.membership.get(&sender) {
            Some((name, Role::Publisher)) => self
                .groups
                .get(name)
                .map(|g| g.subscribers())
                .unwrap_or(&[]),
            _ => &[],
        }
    }

    pub fn group(&self, name: &str) -> Option<&BroadcastGroup> {
        self.groups.get(name)
    }

    /// Current group name and role of `session`
    pub fn membership(&self, session: SessionId) -> Option<(&str, Role)> {
        self.membership
            .get(&session)
            .map(|(name, role)| (name.as_str(), *role))
    }

    /// Number of groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
