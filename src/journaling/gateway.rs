use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

use super::stats::DerivedStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerRef(String);

impl OwnerRef {
    pub fn new(owner: impl Into<String>) -> Self {
        Self(owner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Visibility {
    #[default]
    Shared,
    Private,
}

impl Visibility {
    pub fn is_private(self) -> bool {
        matches!(self, Visibility::Private)
    }

    pub fn from_private_flag(is_private: bool) -> Self {
        if is_private {
            Visibility::Private
        } else {
            Visibility::Shared
        }
    }
}

/// The field set written on every create/update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFields {
    pub content: String,
    pub visibility: Visibility,
    pub stats: DerivedStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("no active session")]
    Unauthenticated,
    #[error("entry {0} not found")]
    NotFound(EntryId),
    #[error("backend failure: {0}")]
    Backend(String),
}

impl GatewayError {
    pub fn backend(err: impl fmt::Display) -> Self {
        GatewayError::Backend(err.to_string())
    }
}

/// Boundary to the record store. Implementations enforce their own access
/// rules; callers do not re-check ownership.
pub trait EntryGateway: Send + Sync {
    fn create(&self, fields: &EntryFields, owner: &OwnerRef) -> Result<EntryId, GatewayError>;

    fn update(&self, id: EntryId, fields: &EntryFields) -> Result<(), GatewayError>;

    fn delete(&self, id: EntryId) -> Result<(), GatewayError>;
}

impl<G: EntryGateway + ?Sized> EntryGateway for std::sync::Arc<G> {
    fn create(&self, fields: &EntryFields, owner: &OwnerRef) -> Result<EntryId, GatewayError> {
        (**self).create(fields, owner)
    }

    fn update(&self, id: EntryId, fields: &EntryFields) -> Result<(), GatewayError> {
        (**self).update(id, fields)
    }

    fn delete(&self, id: EntryId) -> Result<(), GatewayError> {
        (**self).delete(id)
    }
}

/// Supplies the signed-in owner at save time.
pub trait AuthSession {
    fn current_owner(&self) -> Option<OwnerRef>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    owner: Option<OwnerRef>,
}

impl StaticSession {
    pub fn signed_in(owner: OwnerRef) -> Self {
        Self { owner: Some(owner) }
    }

    pub fn signed_out() -> Self {
        Self { owner: None }
    }
}

impl AuthSession for StaticSession {
    fn current_owner(&self) -> Option<OwnerRef> {
        self.owner.clone()
    }
}
