//! Identity handles for the brokered inventory aggregates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::hash::{Hash, Hasher};

/// Primary key of a locally stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl Display for EntityId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        write!(formatter, "{}", self.0)
    }
}

/// Identifier assigned to a record by an external system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForeignId(String);

impl ForeignId {
    /// Creates the identifier from its string form.
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ForeignId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        write!(formatter, "{}", self.0)
    }
}

/// Kinds of aggregate the broker stores and locks.
///
/// Declaration order fixes the canonical acquisition order used for
/// multi-object locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    /// An appliance manager connector.
    Manager,
    /// A virtualization connector together with its SDN controller.
    Connector,
    /// A deployed security appliance.
    Appliance,
    /// A security group.
    SecurityGroup,
    /// A member record of a security group.
    GroupMember,
    /// A manager-owned policy domain mirrored locally.
    Domain,
    /// A manager-owned policy belonging to a domain.
    Policy,
}

/// Primary key of a record in the store: kind plus numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Which aggregate kind the record belongs to.
    pub kind: ObjectKind,
    /// The record's numeric primary key.
    pub id: EntityId,
}

impl EntityKey {
    /// Builds the key for one record.
    #[must_use]
    pub fn new(kind: ObjectKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl Display for EntityKey {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        write!(formatter, "{:?}#{}", self.kind, self.id)
    }
}

/// Reference to a lockable aggregate.
///
/// Identity is (kind, id); the name is display-only and excluded from
/// equality, hashing, and ordering. Never holds a live store handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Which aggregate kind the reference identifies.
    pub kind: ObjectKind,
    /// The aggregate's numeric primary key.
    pub id: EntityId,
    /// Human-readable name, carried for log output only.
    pub name: String,
}

impl ObjectRef {
    /// Builds a reference carrying its display name.
    pub fn new<T: Into<String>>(kind: ObjectKind, id: EntityId, name: T) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
        }
    }

    /// The store key this reference points at.
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.id == other.id
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.id.hash(state);
    }
}

impl Ord for ObjectRef {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.kind, self.id).cmp(&(other.kind, other.id))
    }
}

impl PartialOrd for ObjectRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for ObjectRef {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        write!(formatter, "{:?}#{}", self.kind, self.id)
    }
}
