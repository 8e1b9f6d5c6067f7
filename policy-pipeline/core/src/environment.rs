use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;

/// A deployment environment. Enforcement points and repository folders
/// always belong to exactly one of these.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Sandbox,
    Production,
}

/// The environments a policy record or data connection is available to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentScope {
    Sandbox,
    Production,
    Both,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStage {
    Draft,
    Enabled,
    Disabled,
}

/// Distribution limits that apply to every enforcement point in an
/// environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentLimits {
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,

    /// Requests per minute.
    pub rate_limit: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

// === impl Environment ===

impl Environment {
    pub const ALL: [Self; 2] = [Self::Sandbox, Self::Production];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Production => "production",
        }
    }

    /// Sandbox enforcement points refresh often and tolerate more traffic;
    /// production ones cache longer and are throttled harder.
    pub fn limits(&self) -> EnvironmentLimits {
        match self {
            Self::Sandbox => EnvironmentLimits {
                cache_ttl: Duration::from_secs(30),
                rate_limit: 1000,
            },
            Self::Production => EnvironmentLimits {
                cache_ttl: Duration::from_secs(300),
                rate_limit: 100,
            },
        }
    }

    /// The stages that have a folder in this environment.
    pub fn stages(&self) -> &'static [LifecycleStage] {
        match self {
            Self::Sandbox => &[
                LifecycleStage::Draft,
                LifecycleStage::Enabled,
                LifecycleStage::Disabled,
            ],
            Self::Production => &[LifecycleStage::Enabled, LifecycleStage::Disabled],
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(Self::Sandbox),
            "production" => Ok(Self::Production),
            _ => Err(ParseError::new("environment", s)),
        }
    }
}

// === impl EnvironmentScope ===

impl EnvironmentScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Production => "production",
            Self::Both => "both",
        }
    }

    pub fn includes(&self, env: Environment) -> bool {
        matches!(
            (self, env),
            (Self::Both, _)
                | (Self::Sandbox, Environment::Sandbox)
                | (Self::Production, Environment::Production)
        )
    }

    /// The environment whose folders hold a record with this scope.
    pub fn storage_environment(&self) -> Environment {
        match self {
            Self::Sandbox => Environment::Sandbox,
            Self::Production | Self::Both => Environment::Production,
        }
    }
}

impl fmt::Display for EnvironmentScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentScope {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(Self::Sandbox),
            "production" => Ok(Self::Production),
            "both" => Ok(Self::Both),
            _ => Err(ParseError::new("environment scope", s)),
        }
    }
}

impl From<Environment> for EnvironmentScope {
    fn from(env: Environment) -> Self {
        match env {
            Environment::Sandbox => Self::Sandbox,
            Environment::Production => Self::Production,
        }
    }
}

// === impl LifecycleStage ===

impl LifecycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            _ => Err(ParseError::new("lifecycle stage", s)),
        }
    }
}

// === impl ParseError ===

impl ParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
