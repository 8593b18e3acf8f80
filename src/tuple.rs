//! Relationship tuples
//!
//! Identifiers follow the `type:id` convention (`user:123`, `document:456`)
//! but are otherwise opaque. The only parsing done here is extracting the
//! type prefix, which the invalidation tags need.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(user, relation, object)` relationship fact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionTuple {
    pub user: String,
    pub relation: String,
    pub object: String,
}

impl PermissionTuple {
    pub fn new(
        user: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            relation: relation.into(),
            object: object.into(),
        }
    }

    /// Identity of this tuple, used to key pending write-behind operations
    #[must_use]
    pub fn key(&self) -> TupleKey {
        TupleKey(self.clone())
    }

    /// Invalidation tags for entries derived from this tuple
    ///
    /// `["user:1", "document:9", "relation:viewer", "user_type:user", "object_type:document"]`
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        vec![
            self.user.clone(),
            self.object.clone(),
            relation_tag(&self.relation),
            user_type_tag(type_of(&self.user)),
            object_type_tag(type_of(&self.object)),
        ]
    }
}

impl fmt::Display for PermissionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.object, self.relation, self.user)
    }
}

/// Hashable identity of a tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleKey(PermissionTuple);

impl TupleKey {
    #[must_use]
    pub fn tuple(&self) -> &PermissionTuple {
        &self.0
    }
}

/// Contextual tuple input as collaborators hand it over
///
/// Raw maps may miss fields; normalization fills them with empty strings
/// instead of rejecting the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TupleInput {
    Typed(PermissionTuple),
    Raw {
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        relation: Option<String>,
        #[serde(default)]
        object: Option<String>,
    },
}

impl TupleInput {
    /// Canonical tuple for this input
    #[must_use]
    pub fn normalize(&self) -> PermissionTuple {
        match self {
            Self::Typed(tuple) => tuple.clone(),
            Self::Raw {
                user,
                relation,
                object,
            } => PermissionTuple::new(
                user.clone().unwrap_or_default(),
                relation.clone().unwrap_or_default(),
                object.clone().unwrap_or_default(),
            ),
        }
    }
}

impl From<PermissionTuple> for TupleInput {
    fn from(tuple: PermissionTuple) -> Self {
        Self::Typed(tuple)
    }
}

/// Type prefix of an identifier (`"document:1"` -> `"document"`)
///
/// An identifier without a colon is its own type.
#[must_use]
pub fn type_of(identifier: &str) -> &str {
    identifier
        .split_once(':')
        .map_or(identifier, |(kind, _)| kind)
}

pub(crate) fn relation_tag(relation: &str) -> String {
    format!("relation:{relation}")
}

pub(crate) fn user_type_tag(kind: &str) -> String {
    format!("user_type:{kind}")
}

pub(crate) fn object_type_tag(kind: &str) -> String {
    format!("object_type:{kind}")
}
