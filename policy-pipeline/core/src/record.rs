use crate::{paths::ResourceName, Environment, EnvironmentScope, LifecycleStage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Identifies a policy record in the system of record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(pub i64);

/// A SHA-256 digest of policy content, hex encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

/// The authoritative description of one authorization policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: PolicyId,
    pub environment: EnvironmentScope,
    pub lifecycle_stage: LifecycleStage,
    pub promoted_from_sandbox: bool,

    /// The protected resource this policy governs.
    pub resource_name: Option<String>,

    pub content: String,
    pub content_fingerprint: Fingerprint,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("policy {0} is available to production but was never promoted from sandbox")]
    NotPromoted(PolicyId),

    #[error("policy {0} has no content")]
    EmptyContent(PolicyId),

    #[error("policy {id} fingerprint does not match its content")]
    StaleFingerprint { id: PolicyId },

    #[error("policy {id} has an unusable resource name {name:?}")]
    InvalidResource { id: PolicyId, name: String },
}

// === impl PolicyId ===

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PolicyId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<i64> for PolicyId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// === impl Fingerprint ===

impl Fingerprint {
    pub fn of(content: &str) -> Self {
        Self(hex::encode(Sha256::digest(content.as_bytes())))
    }

    /// Wraps a digest that was computed elsewhere, e.g. loaded from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl PolicyRecord ===

impl PolicyRecord {
    /// Builds a new sandbox draft, the only state an author can create.
    pub fn draft(id: impl Into<PolicyId>, resource_name: Option<String>, content: String) -> Self {
        let content_fingerprint = Fingerprint::of(&content);
        Self {
            id: id.into(),
            environment: EnvironmentScope::Sandbox,
            lifecycle_stage: LifecycleStage::Draft,
            promoted_from_sandbox: false,
            resource_name,
            content,
            content_fingerprint,
        }
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.content.trim().is_empty() {
            return Err(RecordError::EmptyContent(self.id));
        }

        if self.environment != EnvironmentScope::Sandbox && !self.promoted_from_sandbox {
            return Err(RecordError::NotPromoted(self.id));
        }

        if Fingerprint::of(&self.content) != self.content_fingerprint {
            return Err(RecordError::StaleFingerprint { id: self.id });
        }

        if let Some(name) = &self.resource_name {
            if ResourceName::new(name.as_str()).is_err() {
                return Err(RecordError::InvalidResource {
                    id: self.id,
                    name: name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Replaces the record's content, keeping the fingerprint in sync.
    pub fn set_content(&mut self, content: String) {
        self.content_fingerprint = Fingerprint::of(&content);
        self.content = content;
    }

    pub fn is_available_to(&self, env: Environment) -> bool {
        self.environment.includes(env)
    }
}
