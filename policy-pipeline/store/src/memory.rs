use crate::remote::{EntryKind, RemoteEntry, RemoteFile, RemoteRepository, StoreError, Version};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A `RemoteRepository` held in process memory.
///
/// Directories exist only while they contain files, as in git. Faults can
/// be queued per operation to exercise failure handling.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Update,
    Delete,
    List,
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, RemoteFile>,
    next_version: u64,
    faults: VecDeque<Fault>,
    calls: Vec<(Op, String)>,
}

#[derive(Debug)]
struct Fault {
    op: Op,
    error: StoreError,

    /// Apply the operation before failing, as when a response is lost.
    applied: bool,
}

// === impl MemoryRepository ===

impl MemoryRepository {
    /// Fails the next call of `op` without applying it.
    pub fn fail_next(&self, op: Op, error: StoreError) {
        self.state.lock().faults.push_back(Fault {
            op,
            error,
            applied: false,
        });
    }

    /// Applies the next call of `op` but reports a failure.
    pub fn fail_next_after_apply(&self, op: Op, error: StoreError) {
        self.state.lock().faults.push_back(Fault {
            op,
            error,
            applied: true,
        });
    }

    /// Writes a file out of band.
    pub fn insert(&self, path: impl Into<String>, content: impl Into<String>) {
        let mut state = self.state.lock();
        let version = state.version();
        state.files.insert(
            path.into(),
            RemoteFile {
                content: content.into(),
                version,
            },
        );
    }

    pub fn contents(&self) -> BTreeMap<String, String> {
        self.state
            .lock()
            .files
            .iter()
            .map(|(p, f)| (p.clone(), f.content.clone()))
            .collect()
    }

    pub fn calls(&self, op: Op) -> usize {
        self.state.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    fn with<T>(
        &self,
        op: Op,
        path: &str,
        f: impl FnOnce(&mut State) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock();
        state.calls.push((op, path.to_string()));
        let fault = state
            .faults
            .iter()
            .position(|f| f.op == op)
            .and_then(|i| state.faults.remove(i));
        match fault {
            None => f(&mut state),
            Some(Fault {
                error,
                applied: false,
                ..
            }) => Err(error),
            Some(Fault {
                error,
                applied: true,
                ..
            }) => {
                f(&mut state)?;
                Err(error)
            }
        }
    }
}

#[async_trait::async_trait]
impl RemoteRepository for MemoryRepository {
    async fn get(&self, path: &str) -> Result<RemoteFile, StoreError> {
        self.with(Op::Get, path, |state| {
            state
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(path.to_string()))
        })
    }

    async fn create(
        &self,
        path: &str,
        content: &str,
        _message: &str,
    ) -> Result<Version, StoreError> {
        self.with(Op::Create, path, |state| {
            if state.files.contains_key(path) {
                return Err(StoreError::Conflict(path.to_string()));
            }
            let version = state.version();
            state.files.insert(
                path.to_string(),
                RemoteFile {
                    content: content.to_string(),
                    version: version.clone(),
                },
            );
            Ok(version)
        })
    }

    async fn update(
        &self,
        path: &str,
        content: &str,
        version: &Version,
        _message: &str,
    ) -> Result<Version, StoreError> {
        self.with(Op::Update, path, |state| {
            let next = state.version();
            let file = state
                .files
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            if file.version != *version {
                return Err(StoreError::Conflict(path.to_string()));
            }
            *file = RemoteFile {
                content: content.to_string(),
                version: next.clone(),
            };
            Ok(next)
        })
    }

    async fn delete(
        &self,
        path: &str,
        version: &Version,
        _message: &str,
    ) -> Result<(), StoreError> {
        self.with(Op::Delete, path, |state| {
            let file = state
                .files
                .get(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            if file.version != *version {
                return Err(StoreError::Conflict(path.to_string()));
            }
            state.files.remove(path);
            Ok(())
        })
    }

    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>, StoreError> {
        self.with(Op::List, dir, |state| {
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let mut files = BTreeSet::new();
            let mut dirs = BTreeSet::new();
            for path in state.files.keys() {
                let Some(rest) = path.strip_prefix(&prefix) else {
                    continue;
                };
                match rest.split_once('/') {
                    Some((sub, _)) => dirs.insert(sub.to_string()),
                    None => files.insert(rest.to_string()),
                };
            }
            if files.is_empty() && dirs.is_empty() {
                return Err(StoreError::NotFound(dir.to_string()));
            }
            let entry = |name: String, kind| RemoteEntry {
                path: format!("{prefix}{name}"),
                name,
                kind,
            };
            Ok(dirs
                .into_iter()
                .map(|n| entry(n, EntryKind::Dir))
                .chain(files.into_iter().map(|n| entry(n, EntryKind::File)))
                .collect())
        })
    }
}

// === impl State ===

impl State {
    fn version(&mut self) -> Version {
        self.next_version += 1;
        Version(format!("v{}", self.next_version))
    }
}
