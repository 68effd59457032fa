//! Who asked for a command, and what it descends from

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Request provenance
///
/// Every output command, action chain run and daemon event carries a Context
/// naming who requested it (a controller id, an action id, `api`, ...) and
/// linking it to the context that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// ULID, so ids sort by creation time
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// The context this one was derived from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            origin: None,
            parent_id: None,
        }
    }

    pub fn with_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..Self::new()
        }
    }

    /// Derived context keeping the requester
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            origin: self.origin.clone(),
            parent_id: Some(self.id.clone()),
        }
    }

    /// Derived context acting for someone else
    pub fn child_with_origin(&self, origin: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            origin: Some(origin.into()),
            parent_id: Some(self.id.clone()),
        }
    }

    /// Requester name, or `unknown`
    pub fn origin(&self) -> &str {
        self.origin.as_deref().unwrap_or("unknown")
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_links_parent() {
        let parent = Context::with_origin("pid_tank");
        let child = parent.child();

        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.origin(), "pid_tank");
        assert_ne!(child.id, parent.id);
    }

    #[test]
    fn test_child_with_origin() {
        let parent = Context::new();
        let child = parent.child_with_origin("action:ramp");
        assert_eq!(child.origin(), "action:ramp");
        assert_eq!(parent.origin(), "unknown");
    }
}
