//! Identifier newtypes for workflow entities.

use std::str::FromStr;

use derive_more::{Debug, Display, From, Into};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[derive(Debug, Display, From, Into)]
        #[debug("{_0}")]
        #[display("{_0}")]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id.
            #[inline]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Creates an id from an existing UUID.
            #[inline]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[inline]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::from_str(s)?))
            }
        }

        impl AsRef<Uuid> for $name {
            fn as_ref(&self) -> &Uuid {
                &self.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a workflow definition.
    WorkflowId
}

define_id! {
    /// Unique identifier for a node in a workflow graph.
    NodeId
}

define_id! {
    /// Unique identifier for an edge in a workflow graph.
    EdgeId
}

define_id! {
    /// Unique identifier for one workflow execution.
    ExecutionId
}

define_id! {
    /// Unique identifier for a user program in the catalog.
    ProgramId
}

define_id! {
    /// Unique identifier for a specific version of a program.
    VersionId
}

define_id! {
    /// Unique identifier for a human-interaction gate.
    InteractionId
}

define_id! {
    /// Unique identifier for a platform user.
    UserId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_through_string() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_serde_transparent() {
        let id = ExecutionId::from_uuid(Uuid::from_u128(7));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }
}
