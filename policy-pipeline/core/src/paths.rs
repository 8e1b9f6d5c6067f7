//! The repository path convention.
//!
//! Every stored policy lives at
//!
//! ```text
//! policies/<resource_name>/<sandbox|production>/<draft|enabled|disabled>/policy_<id>.rego
//! ```
//!
//! The folder is a pure function of a record's environment scope and
//! lifecycle stage, so paths are only ever constructed from those values and
//! never accepted verbatim from callers.

use crate::{Environment, LifecycleStage, PolicyId, PolicyRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::LazyLock};
use thiserror::Error;

pub const POLICY_ROOT: &str = "policies";
pub const POLICY_EXTENSION: &str = "rego";
pub const DEFAULT_RESOURCE: &str = "default";

const FILE_PREFIX: &str = "policy_";
const MAX_RESOURCE_NAME_LEN: usize = 128;

static RESOURCE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("resource name regex must compile")
});

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

/// One of the folders that hold a resource's policies.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageDir {
    resource: ResourceName,
    environment: Environment,
    stage: LifecycleStage,
}

/// The location of a single policy file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryPath {
    dir: StageDir,
    id: PolicyId,
}

/// How a file found in a stage folder relates to the naming convention.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileClass {
    /// `policy_<id>.rego`
    Policy(PolicyId),

    /// `policy_<something>.rego` where the suffix is not an integer.
    MalformedId,

    /// A `.rego` file that does not follow the `policy_` naming scheme.
    NonConforming,

    /// Not a policy source file at all (e.g. `.gitkeep`, `README.md`).
    Ignored,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid resource name {0:?}")]
    InvalidResource(String),

    #[error("draft policies may only be stored in sandbox")]
    DraftOutsideSandbox,

    #[error("path {path} does not belong to policy {expected}")]
    WrongRecord { path: String, expected: PolicyId },
}

// === impl ResourceName ===

impl ResourceName {
    pub fn new(name: impl Into<String>) -> Result<Self, PathError> {
        let name = name.into();
        if name.len() > MAX_RESOURCE_NAME_LEN
            || name.contains("..")
            || !RESOURCE_NAME.is_match(&name)
        {
            return Err(PathError::InvalidResource(name));
        }
        Ok(Self(name))
    }

    /// Records without a resource are grouped under a shared folder.
    pub fn for_record(name: Option<&str>) -> Result<Self, PathError> {
        Self::new(name.unwrap_or(DEFAULT_RESOURCE))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl StageDir ===

impl StageDir {
    pub fn new(
        resource: ResourceName,
        environment: Environment,
        stage: LifecycleStage,
    ) -> Result<Self, PathError> {
        if !environment.stages().contains(&stage) {
            return Err(PathError::DraftOutsideSandbox);
        }
        Ok(Self {
            resource,
            environment,
            stage,
        })
    }

    /// Lists the five folders a resource is expected to have.
    pub fn all(resource: &ResourceName) -> Vec<Self> {
        Environment::ALL
            .iter()
            .flat_map(|env| {
                env.stages().iter().map(move |stage| Self {
                    resource: resource.clone(),
                    environment: *env,
                    stage: *stage,
                })
            })
            .collect()
    }

    /// The folder path relative to the resource, e.g. `sandbox/draft`.
    pub fn relative(&self) -> String {
        format!("{}/{}", self.environment, self.stage)
    }

    pub fn file(&self, id: PolicyId) -> RepositoryPath {
        RepositoryPath {
            dir: self.clone(),
            id,
        }
    }
}

impl fmt::Display for StageDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            POLICY_ROOT, self.resource, self.environment, self.stage
        )
    }
}

// === impl RepositoryPath ===

impl RepositoryPath {
    pub fn new(
        resource: ResourceName,
        environment: Environment,
        stage: LifecycleStage,
        id: PolicyId,
    ) -> Result<Self, PathError> {
        Ok(StageDir::new(resource, environment, stage)?.file(id))
    }

    /// The path a record's content must live at given its current state.
    pub fn for_record(record: &PolicyRecord) -> Result<Self, PathError> {
        let resource = ResourceName::for_record(record.resource_name.as_deref())?;
        Self::new(
            resource,
            record.environment.storage_environment(),
            record.lifecycle_stage,
            record.id,
        )
    }

    /// Fails unless this path names the given record's file.
    pub fn ensure_record(&self, id: PolicyId) -> Result<(), PathError> {
        if self.id != id {
            return Err(PathError::WrongRecord {
                path: self.to_string(),
                expected: id,
            });
        }
        Ok(())
    }

    pub fn environment(&self) -> Environment {
        self.dir.environment
    }

    /// Returns the same file relocated to another folder of the same
    /// resource.
    pub fn relocate(
        &self,
        environment: Environment,
        stage: LifecycleStage,
    ) -> Result<Self, PathError> {
        Self::new(self.dir.resource.clone(), environment, stage, self.id)
    }
}

impl fmt::Display for RepositoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dir, file_name(self.id))
    }
}

pub fn file_name(id: PolicyId) -> String {
    format!("{FILE_PREFIX}{id}.{POLICY_EXTENSION}")
}

pub fn classify_file_name(name: &str) -> FileClass {
    let Some(stem) = name.strip_suffix(&format!(".{POLICY_EXTENSION}")) else {
        return FileClass::Ignored;
    };
    let Some(id) = stem.strip_prefix(FILE_PREFIX) else {
        return FileClass::NonConforming;
    };
    // Reject signs and leading zeros so that each id has exactly one name.
    let canonical = !id.is_empty()
        && id.bytes().all(|b| b.is_ascii_digit())
        && (id == "0" || !id.starts_with('0'));
    match id.parse::<i64>() {
        Ok(id) if canonical => FileClass::Policy(PolicyId(id)),
        _ => FileClass::MalformedId,
    }
}
