use serde::{Deserialize, Serialize};

/// An already-authenticated principal handed to us by the auth layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn owns(&self, owner: &str) -> bool {
        self.id == owner
    }
}
