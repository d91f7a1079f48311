//! Operator context for administrative operations
//!
//! Operations that change ancestry or lead state record who asked for the
//! change. The actor is always passed in explicitly; there is no ambient
//! "current user".

/// Caller identity passed to administrative operations
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperatorContext {
    /// Identity (or service account) performing the operation
    pub actor_id: String,
}

impl OperatorContext {
    /// Create a new operator context for the specified actor
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
        }
    }

    /// Context for maintenance performed by the store itself
    pub fn system() -> Self {
        Self::new("system")
    }

    /// Get the actor id as a string reference
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

impl std::fmt::Display for OperatorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OperatorContext({})", self.actor_id)
    }
}
