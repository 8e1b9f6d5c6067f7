#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Keeps policy content in a remote version-controlled repository, laid out
//! by resource, environment and lifecycle stage.

pub mod github;
mod journal;
pub mod memory;
mod metrics;
mod remote;
mod retry;

#[cfg(test)]
mod tests;

pub use self::{
    journal::{MemoryJournal, MoveEntry, MoveJournal, MoveState},
    metrics::StoreMetrics,
    remote::{
        EntryKind, NotFoundExt, RemoteEntry, RemoteFile, RemoteRepository, StoreError, Version,
    },
    retry::RetryPolicy,
};

use ahash::AHashMap as HashMap;
use policy_pipeline_core::{
    drift::{DriftFinding, DriftKind, DriftReport, Severity},
    paths::{classify_file_name, FileClass, RepositoryPath, ResourceName, StageDir, POLICY_ROOT},
    PolicyId,
};
use std::{collections::BTreeSet, future::Future, sync::Arc};
use thiserror::Error;
use tokio::{sync::Mutex, time};
use tracing::{debug, info, instrument, warn};

pub struct PolicyStore {
    repo: Arc<dyn RemoteRepository>,
    journal: Arc<dyn MoveJournal>,
    retry: RetryPolicy,
    locks: parking_lot::Mutex<HashMap<PolicyId, Arc<Mutex<()>>>>,
    metrics: StoreMetrics,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Created,
    Updated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitResult {
    pub path: RepositoryPath,
    pub outcome: CommitOutcome,

    /// False when the stored content was already identical.
    pub changed: bool,
    pub version: Version,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MoveResult {
    pub from: RepositoryPath,
    pub to: RepositoryPath,

    /// Whether an interrupted move was picked up from the journal.
    pub resumed: bool,

    /// False when no remote state had to change.
    pub changed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteResult {
    pub path: RepositoryPath,

    /// False when the file was already absent.
    pub deleted: bool,
}

/// Which of a resource's five stage folders exist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructureReport {
    pub resource: String,
    pub present: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Error)]
pub enum MoveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("policy {id} has an unfinished move from {from} to {to}")]
    InFlight { id: PolicyId, from: String, to: String },

    #[error("policy {id} is stored at neither {from} nor {to}")]
    Missing { id: PolicyId, from: String, to: String },

    #[error("failed to access move journal: {0}")]
    Journal(#[source] anyhow::Error),
}

// === impl PolicyStore ===

impl PolicyStore {
    pub fn new(
        repo: Arc<dyn RemoteRepository>,
        journal: Arc<dyn MoveJournal>,
        retry: RetryPolicy,
        metrics: StoreMetrics,
    ) -> Self {
        Self {
            repo,
            journal,
            retry,
            locks: Default::default(),
            metrics,
        }
    }

    /// Writes a record's content at its derived path, creating or updating
    /// the file as needed.
    #[instrument(skip_all, fields(%record, path = %target))]
    pub async fn commit(
        &self,
        record: PolicyId,
        content: &str,
        target: &RepositoryPath,
        message: &str,
    ) -> Result<CommitResult, StoreError> {
        let res = self.commit_inner(record, content, target, message).await;
        self.metrics.observe("commit", &res);
        res
    }

    async fn commit_inner(
        &self,
        record: PolicyId,
        content: &str,
        target: &RepositoryPath,
        message: &str,
    ) -> Result<CommitResult, StoreError> {
        target.ensure_record(record)?;
        let path = target.to_string();

        // The read and the write are retried together so that a write whose
        // response was lost is observed as already applied.
        let (outcome, changed, version) = self
            .with_retry("commit", || self.upsert(&path, content, message))
            .await?;

        info!(?outcome, changed, "Committed policy");
        Ok(CommitResult {
            path: target.clone(),
            outcome,
            changed,
            version,
        })
    }

    async fn upsert(
        &self,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<(CommitOutcome, bool, Version), StoreError> {
        match self.repo.get(path).await.found()? {
            Some(file) if file.content == content => {
                Ok((CommitOutcome::Updated, false, file.version))
            }
            Some(file) => {
                let version = self.repo.update(path, content, &file.version, message).await?;
                Ok((CommitOutcome::Updated, true, version))
            }
            None => {
                let version = self.repo.create(path, content, message).await?;
                Ok((CommitOutcome::Created, true, version))
            }
        }
    }

    /// Relocates a record's file between stage folders.
    ///
    /// The remote store cannot do this atomically. Progress is journaled so
    /// that re-running an interrupted move completes it, and every step
    /// checks the current remote state before acting.
    #[instrument(skip_all, fields(%record, %from, %to))]
    pub async fn move_record(
        &self,
        record: PolicyId,
        from: &RepositoryPath,
        to: &RepositoryPath,
        message: &str,
    ) -> Result<MoveResult, MoveError> {
        let res = self.move_inner(record, from, to, message).await;
        self.metrics.record(
            "move",
            match &res {
                Ok(_) => "ok",
                Err(MoveError::Store(e)) => e.kind(),
                Err(MoveError::InFlight { .. }) => "in_flight",
                Err(MoveError::Missing { .. }) => "missing",
                Err(MoveError::Journal(_)) => "journal",
            },
        );
        res
    }

    async fn move_inner(
        &self,
        record: PolicyId,
        from: &RepositoryPath,
        to: &RepositoryPath,
        message: &str,
    ) -> Result<MoveResult, MoveError> {
        from.ensure_record(record).map_err(StoreError::from)?;
        to.ensure_record(record).map_err(StoreError::from)?;
        let (src, dst) = (from.to_string(), to.to_string());
        if src == dst {
            return Ok(MoveResult {
                from: from.clone(),
                to: to.clone(),
                resumed: false,
                changed: false,
            });
        }

        let lock = self.lock(record);
        let _guard = lock.lock().await;

        let (mut entry, resumed) = match self.journal.load(record).await.map_err(MoveError::Journal)? {
            Some(entry) if entry.is_for(&src, &dst) => {
                info!(state = %entry.state, "Resuming interrupted move");
                (entry, true)
            }
            Some(entry) => {
                return Err(MoveError::InFlight {
                    id: record,
                    from: entry.from,
                    to: entry.to,
                })
            }
            None => {
                let entry = MoveEntry::new(record, src.clone(), dst.clone());
                self.journal.save(&entry).await.map_err(MoveError::Journal)?;
                (entry, false)
            }
        };

        let mut changed = false;
        if entry.state == MoveState::Pending {
            let source = self.with_retry("move", || self.repo.get(&src)).await.found()?;
            let dest = self.with_retry("move", || self.repo.get(&dst)).await.found()?;
            match (source, dest) {
                (Some(source), Some(dest)) if source.content == dest.content => {
                    debug!("Destination already holds the content");
                }
                (Some(source), Some(dest)) => {
                    self.with_retry("move", || {
                        self.repo.update(&dst, &source.content, &dest.version, message)
                    })
                    .await?;
                    changed = true;
                }
                (Some(source), None) => {
                    // A lost create response is observed as a conflict on
                    // retry; the next resumption sees identical content.
                    self.with_retry("move", || self.repo.create(&dst, &source.content, message))
                        .await?;
                    changed = true;
                }
                (None, Some(_)) => {
                    debug!("Source already removed");
                    entry.advance(MoveState::SourceRemoved);
                }
                (None, None) => {
                    self.journal.clear(record).await.map_err(MoveError::Journal)?;
                    return Err(MoveError::Missing {
                        id: record,
                        from: src,
                        to: dst,
                    });
                }
            }
            if entry.state == MoveState::Pending {
                entry.advance(MoveState::DestinationWritten);
            }
            self.journal.save(&entry).await.map_err(MoveError::Journal)?;
        }

        if entry.state == MoveState::DestinationWritten {
            // Re-verify before the destructive step. Deletes are never
            // retried without looking again.
            if self.with_retry("move", || self.repo.get(&dst)).await.found()?.is_none() {
                // The destination vanished; start over from the source.
                entry.advance(MoveState::Pending);
                self.journal.save(&entry).await.map_err(MoveError::Journal)?;
                return Err(StoreError::Conflict(dst).into());
            }
            if let Some(source) = self.with_retry("move", || self.repo.get(&src)).await.found()? {
                match self.repo.delete(&src, &source.version, message).await {
                    Ok(()) => changed = true,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            entry.advance(MoveState::SourceRemoved);
            self.journal.save(&entry).await.map_err(MoveError::Journal)?;
        }

        self.journal.clear(record).await.map_err(MoveError::Journal)?;
        info!(resumed, changed, "Moved policy");
        Ok(MoveResult {
            from: from.clone(),
            to: to.clone(),
            resumed,
            changed,
        })
    }

    /// Removes a record's file. Deleting an absent file succeeds.
    #[instrument(skip_all, fields(%record, %path))]
    pub async fn delete(
        &self,
        record: PolicyId,
        path: &RepositoryPath,
        message: &str,
    ) -> Result<DeleteResult, StoreError> {
        let res = self.delete_inner(record, path, message).await;
        self.metrics.observe("delete", &res);
        res
    }

    async fn delete_inner(
        &self,
        record: PolicyId,
        path: &RepositoryPath,
        message: &str,
    ) -> Result<DeleteResult, StoreError> {
        path.ensure_record(record)?;
        let lock = self.lock(record);
        let _guard = lock.lock().await;

        let target = path.to_string();
        let deleted = match self.with_retry("delete", || self.repo.get(&target)).await.found()? {
            None => false,
            Some(file) => match self.repo.delete(&target, &file.version, message).await {
                Ok(()) => true,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            },
        };
        info!(deleted, "Deleted policy");
        Ok(DeleteResult {
            path: path.clone(),
            deleted,
        })
    }

    /// Names of the resource folders present in the repository.
    pub async fn list_resources(&self) -> Result<BTreeSet<String>, StoreError> {
        let entries = self
            .with_retry("list", || self.repo.list(POLICY_ROOT))
            .await
            .found()?
            .unwrap_or_default();
        let mut resources = BTreeSet::new();
        for entry in entries {
            match ResourceName::new(entry.name.as_str()) {
                Ok(name) if entry.kind == EntryKind::Dir => {
                    resources.insert(name.as_str().to_string());
                }
                _ => warn!(path = %entry.path, "Unexpected entry in the policy root"),
            }
        }
        Ok(resources)
    }

    /// Reports which of a resource's stage folders exist. Folders are
    /// created lazily, so a missing one is informational.
    pub async fn validate_folder_structure(
        &self,
        resource: &str,
    ) -> Result<StructureReport, StoreError> {
        let resource = ResourceName::new(resource)?;
        let mut report = StructureReport {
            resource: resource.to_string(),
            present: Vec::new(),
            missing: Vec::new(),
        };
        for dir in StageDir::all(&resource) {
            let path = dir.to_string();
            let listing = self.with_retry("list", || self.repo.list(&path)).await.found()?;
            match listing {
                Some(_) => report.present.push(dir.relative()),
                None => report.missing.push(dir.relative()),
            }
        }
        if !report.missing.is_empty() {
            debug!(resource = %report.resource, missing = ?report.missing, "Stage folders missing");
        }
        Ok(report)
    }

    /// Classifies every file stored for a resource against the naming
    /// convention and the set of known record ids.
    #[instrument(skip_all, fields(%resource, known = known_ids.len()))]
    pub async fn detect_unauthorized_files(
        &self,
        resource: &str,
        known_ids: &BTreeSet<PolicyId>,
    ) -> Result<DriftReport, StoreError> {
        let resource = ResourceName::new(resource)?;
        let mut report = DriftReport::new(resource.as_str());
        let mut seen = HashMap::<PolicyId, Vec<String>>::new();

        for dir in StageDir::all(&resource) {
            let path = dir.to_string();
            let entries = self
                .with_retry("list", || self.repo.list(&path))
                .await
                .found()?
                .unwrap_or_default();
            report.scanned.push(path);

            for entry in entries {
                if entry.kind == EntryKind::Dir {
                    // Nothing may live below a stage folder.
                    report
                        .findings
                        .push(DriftFinding::new(entry.path, DriftKind::NonConforming));
                    continue;
                }
                match classify_file_name(&entry.name) {
                    FileClass::Ignored => {}
                    FileClass::NonConforming => report
                        .findings
                        .push(DriftFinding::new(entry.path, DriftKind::NonConforming)),
                    FileClass::MalformedId => report
                        .findings
                        .push(DriftFinding::new(entry.path, DriftKind::MalformedId)),
                    FileClass::Policy(id) if known_ids.contains(&id) => {
                        seen.entry(id).or_default().push(entry.path);
                    }
                    FileClass::Policy(id) => report
                        .findings
                        .push(DriftFinding::new(entry.path, DriftKind::UnknownId { id })),
                }
            }
        }

        report.duplicates = seen
            .into_iter()
            .filter(|(_, paths)| paths.len() > 1)
            .collect();

        if !report.is_clean() {
            warn!(
                resource = %report.resource,
                findings = report.findings.len(),
                critical = report.count(Severity::Critical),
                "Repository drift detected"
            );
        }
        Ok(report)
    }

    fn lock(&self, record: PolicyId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        locks.entry(record).or_default().clone()
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(error) if error.is_retryable() && self.retry.should_retry(attempt) => {
                    let backoff = self.retry.backoff(attempt);
                    debug!(%error, attempt, ?backoff, op, "Retrying repository call");
                    self.metrics.retried(op);
                    time::sleep(backoff).await;
                    attempt += 1;
                }
                res => return res,
            }
        }
    }
}
