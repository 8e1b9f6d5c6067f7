//! Carries an author's change through validation, the repository and the
//! catalog, in that order.
//!
//! The catalog is only updated after the repository confirms the change, so
//! a failure at any stage leaves the record as it was.

use anyhow::anyhow;
use policy_pipeline_core::{
    paths::RepositoryPath, Catalog, Environment, EnvironmentScope, LifecycleStage, PolicyId,
    PolicyRecord,
};
use policy_pipeline_planner::Planner;
use policy_pipeline_store::{CommitResult, DeleteResult, MoveResult, PolicyStore};
use policy_pipeline_validator::{ValidationResult, Validator};
use serde::Serialize;
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[cfg(test)]
mod tests;

#[derive(Clone)]
pub struct AuthoringPipeline {
    catalog: Arc<dyn Catalog>,
    store: Arc<PolicyStore>,
    validator: Validator,
    planner: Arc<Planner>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Commit,
    Move,
    Delete,
    Catalog,
}

#[derive(Debug, Error)]
#[error("{stage} failed for policy {record}: {source}")]
pub struct PipelineError {
    pub record: PolicyId,
    pub stage: Stage,

    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
#[error("policy {0} does not exist")]
pub struct UnknownPolicy(pub PolicyId);

/// Content the validator did not accept.
#[derive(Debug, Error)]
#[error("policy is {} with {} error(s)", .0.status, .0.errors().count())]
pub struct Rejected(pub ValidationResult);

#[derive(Clone, Debug, Serialize)]
pub struct Submitted {
    pub record: PolicyRecord,
    pub path: String,
    pub changed: bool,
    pub validation: ValidationResult,
}

#[derive(Clone, Debug, Serialize)]
pub struct Moved {
    pub record: PolicyRecord,
    pub from: String,
    pub to: String,
    pub changed: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct Removed {
    pub record: PolicyId,
    pub path: String,
    pub deleted: bool,
}

// === impl AuthoringPipeline ===

impl AuthoringPipeline {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<PolicyStore>,
        validator: Validator,
        planner: Arc<Planner>,
    ) -> Self {
        Self {
            catalog,
            store,
            validator,
            planner,
        }
    }

    /// Validates new content and stores it at the record's current location.
    #[instrument(skip(self, content), fields(size = content.len()))]
    pub async fn submit(&self, id: PolicyId, content: String) -> Result<Submitted, PipelineError> {
        let record = self.load(id).await?;
        let validation = self.validate(id, &content).await?;

        let path = RepositoryPath::for_record(&record).map_err(fail(id, Stage::Commit))?;
        let CommitResult { changed, .. } = self
            .store
            .commit(id, &content, &path, &format!("Update policy {id}"))
            .await
            .map_err(fail(id, Stage::Commit))?;

        let mut updated = record;
        updated.set_content(content);
        self.save(&updated).await?;
        info!(%path, changed, "Submitted policy");

        self.reconcile(updated.environment).await;
        Ok(Submitted {
            record: updated,
            path: path.to_string(),
            changed,
            validation,
        })
    }

    /// Moves a record to another lifecycle stage within its environment.
    #[instrument(skip(self))]
    pub async fn transition(
        &self,
        id: PolicyId,
        stage: LifecycleStage,
    ) -> Result<Moved, PipelineError> {
        let record = self.load(id).await?;
        let from = RepositoryPath::for_record(&record).map_err(fail(id, Stage::Move))?;
        let to = from
            .relocate(from.environment(), stage)
            .map_err(fail(id, Stage::Move))?;
        let message = format!("Move policy {id} to {stage}");
        let MoveResult { changed, .. } = self
            .store
            .move_record(id, &from, &to, &message)
            .await
            .map_err(fail(id, Stage::Move))?;

        let mut updated = record;
        updated.lifecycle_stage = stage;
        self.save(&updated).await?;
        info!(%from, %to, changed, "Transitioned policy");

        self.reconcile(updated.environment).await;
        Ok(Moved {
            record: updated,
            from: from.to_string(),
            to: to.to_string(),
            changed,
        })
    }

    /// Makes an enabled sandbox policy available to production.
    #[instrument(skip(self))]
    pub async fn promote(&self, id: PolicyId) -> Result<Moved, PipelineError> {
        let record = self.load(id).await?;
        if record.environment != EnvironmentScope::Sandbox
            || record.lifecycle_stage != LifecycleStage::Enabled
        {
            return Err(PipelineError {
                record: id,
                stage: Stage::Validate,
                source: anyhow!(
                    "only enabled sandbox policies can be promoted; policy is {} in {}",
                    record.lifecycle_stage,
                    record.environment
                ),
            });
        }
        self.validate(id, &record.content).await?;

        let from = RepositoryPath::for_record(&record).map_err(fail(id, Stage::Move))?;
        let to = from
            .relocate(Environment::Production, LifecycleStage::Enabled)
            .map_err(fail(id, Stage::Move))?;
        let MoveResult { changed, .. } = self
            .store
            .move_record(id, &from, &to, &format!("Promote policy {id} to production"))
            .await
            .map_err(fail(id, Stage::Move))?;

        let mut updated = record;
        updated.environment = EnvironmentScope::Production;
        updated.promoted_from_sandbox = true;
        self.save(&updated).await?;
        info!(%from, %to, changed, "Promoted policy");

        // The policy leaves sandbox and arrives in production.
        for env in Environment::ALL {
            self.reconcile_env(env).await;
        }
        Ok(Moved {
            record: updated,
            from: from.to_string(),
            to: to.to_string(),
            changed,
        })
    }

    /// Deletes a record's stored file and then the record itself.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: PolicyId) -> Result<Removed, PipelineError> {
        let record = self.load(id).await?;
        let path = RepositoryPath::for_record(&record).map_err(fail(id, Stage::Delete))?;
        let DeleteResult { deleted, .. } = self
            .store
            .delete(id, &path, &format!("Remove policy {id}"))
            .await
            .map_err(fail(id, Stage::Delete))?;

        self.catalog
            .remove_record(id)
            .await
            .map_err(fail(id, Stage::Catalog))?;
        info!(%path, deleted, "Removed policy");

        self.reconcile(record.environment).await;
        Ok(Removed {
            record: id,
            path: path.to_string(),
            deleted,
        })
    }

    async fn load(&self, id: PolicyId) -> Result<PolicyRecord, PipelineError> {
        self.catalog
            .get_record(id)
            .await
            .map_err(fail(id, Stage::Catalog))?
            .ok_or_else(|| PipelineError {
                record: id,
                stage: Stage::Catalog,
                source: UnknownPolicy(id).into(),
            })
    }

    async fn save(&self, record: &PolicyRecord) -> Result<(), PipelineError> {
        record.validate().map_err(fail(record.id, Stage::Catalog))?;
        self.catalog
            .update_record(record)
            .await
            .map_err(fail(record.id, Stage::Catalog))
    }

    async fn validate(&self, id: PolicyId, content: &str) -> Result<ValidationResult, PipelineError> {
        let result = self.validator.validate(content).await;
        if !result.is_valid() {
            return Err(PipelineError {
                record: id,
                stage: Stage::Validate,
                source: Rejected(result).into(),
            });
        }
        Ok(result)
    }

    async fn reconcile(&self, scope: EnvironmentScope) {
        for env in Environment::ALL {
            if scope.includes(env) {
                self.reconcile_env(env).await;
            }
        }
    }

    /// The change is already durable; a failed sweep is retried by the
    /// periodic reconcile loop.
    async fn reconcile_env(&self, env: Environment) {
        if let Err(error) = self.planner.reconcile(env).await {
            warn!(%error, environment = %env, "Failed to reconcile after authoring change");
        }
    }
}

// === impl PipelineError ===

impl PipelineError {
    /// The validator's verdict, if the change was rejected as content.
    pub fn rejection(&self) -> Option<&ValidationResult> {
        self.source.downcast_ref::<Rejected>().map(|r| &r.0)
    }

    pub fn is_unknown_policy(&self) -> bool {
        self.source.is::<UnknownPolicy>()
    }
}

// === impl Stage ===

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Commit => "commit",
            Self::Move => "move",
            Self::Delete => "delete",
            Self::Catalog => "catalog",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn fail<E>(record: PolicyId, stage: Stage) -> impl FnOnce(E) -> PipelineError
where
    E: Into<anyhow::Error>,
{
    move |error| PipelineError {
        record,
        stage,
        source: error.into(),
    }
}
