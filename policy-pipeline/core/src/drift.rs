use crate::PolicyId;
use chrono::{offset::Utc, DateTime};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftKind {
    /// A policy source file that does not follow the naming convention.
    NonConforming,

    /// A conventionally named file whose id suffix is not an integer.
    MalformedId,

    /// A conventionally named file with no matching policy record. This may
    /// indicate out-of-band tampering with the repository.
    UnknownId { id: PolicyId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub path: String,
    pub severity: Severity,

    #[serde(flatten)]
    pub kind: DriftKind,
}

/// The discrepancies between the files stored for one resource and the
/// records the catalog knows about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub resource: String,
    pub checked_at: DateTime<Utc>,

    /// The stage folders that were listed.
    pub scanned: Vec<String>,
    pub findings: Vec<DriftFinding>,

    /// Known ids found in more than one folder. These are surfaced for
    /// operators but are not violations.
    pub duplicates: BTreeMap<PolicyId, Vec<String>>,
}

// === impl DriftKind ===

impl DriftKind {
    pub fn severity(&self) -> Severity {
        match self {
            Self::NonConforming | Self::MalformedId => Severity::High,
            Self::UnknownId { .. } => Severity::Critical,
        }
    }
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonConforming => f.write_str("non-conforming file name"),
            Self::MalformedId => f.write_str("malformed policy id"),
            Self::UnknownId { id } => write!(f, "no policy record with id {id}"),
        }
    }
}

// === impl DriftFinding ===

impl DriftFinding {
    pub fn new(path: impl Into<String>, kind: DriftKind) -> Self {
        Self {
            path: path.into(),
            severity: kind.severity(),
            kind,
        }
    }
}

// === impl DriftReport ===

impl DriftReport {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            checked_at: Utc::now(),
            scanned: Vec::new(),
            findings: Vec::new(),
            duplicates: BTreeMap::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }
}
