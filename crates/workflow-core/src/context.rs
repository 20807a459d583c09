// Context storage: an append-only, versioned log of
// per-step commits behind a conditional-write API. Grounded on
// `flow::stubs::InMemoryFlowRepository`'s `Mutex<HashMap<...>>` plus a
// `lock()` helper that turns poisoning into a storage error instead of
// panicking.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use uuid::Uuid;

use crate::domain::{ContextCommit, ContextSnapshot, ContextValue, PersistResult};
use crate::errors::{EngineError, Result};

/// Durable log of context commits for every execution, with optimistic
/// concurrency on append ( `Commit(execution_id, step_id,
/// delta, expected_version)`).
#[async_trait]
pub trait ContextStore: Send + Sync {
  async fn snapshot(&self, execution_id: Uuid) -> Result<ContextSnapshot>;

  async fn commit(&self,
                   execution_id: Uuid,
                   step_id: &str,
                   delta: IndexMap<String, ContextValue>,
                   expected_version: i64)
                   -> Result<PersistResult>;

  async fn history(&self, execution_id: Uuid) -> Result<Vec<ContextCommit>>;

  /// Deletes every commit for `execution_id` ( retention: purged
  /// "along with their step executions and context commits"). Called only
  /// after the owning execution has already been deleted.
  async fn purge(&self, execution_id: Uuid) -> Result<()>;
}

#[derive(Default)]
struct ExecutionLog {
  commits: Vec<ContextCommit>,
}

/// In-memory `ContextStore` used by tests and the default runtime
/// configuration when no Diesel-backed store is wired in.
#[derive(Default)]
pub struct InMemoryContextStore {
  logs: Mutex<HashMap<Uuid, ExecutionLog>>,
}

impl InMemoryContextStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, ExecutionLog>>> {
    self.logs
        .lock()
        .map_err(|_| EngineError::Storage("context store mutex poisoned".into()))
  }
}

fn merge(base: &mut IndexMap<String, ContextValue>, delta: &IndexMap<String, ContextValue>) {
  for (k, v) in delta {
    base.insert(k.clone(), v.clone());
  }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
  async fn snapshot(&self, execution_id: Uuid) -> Result<ContextSnapshot> {
    let guard = self.lock()?;
    let mut data = IndexMap::new();
    let mut version = 0i64;
    if let Some(log) = guard.get(&execution_id) {
      for commit in &log.commits {
        merge(&mut data, &commit.delta);
        version = commit.version;
      }
    }
    Ok(ContextSnapshot { data, version })
  }

  async fn commit(&self,
                   execution_id: Uuid,
                   step_id: &str,
                   delta: IndexMap<String, ContextValue>,
                   expected_version: i64)
                   -> Result<PersistResult> {
    let mut guard = self.lock()?;
    let log = guard.entry(execution_id).or_default();
    let current_version = log.commits.last().map(|c| c.version).unwrap_or(0);
    if current_version != expected_version {
      return Ok(PersistResult::Conflict);
    }
    let new_version = current_version + 1;
    log.commits.push(ContextCommit { id: Uuid::new_v4(),
                                      execution_id,
                                      version: new_version,
                                      step_id: step_id.to_string(),
                                      delta,
                                      committed_at: Utc::now() });
    Ok(PersistResult::Ok { new_version })
  }

  async fn history(&self, execution_id: Uuid) -> Result<Vec<ContextCommit>> {
    let guard = self.lock()?;
    Ok(guard.get(&execution_id).map(|l| l.commits.clone()).unwrap_or_default())
  }

  async fn purge(&self, execution_id: Uuid) -> Result<()> {
    let mut guard = self.lock()?;
    guard.remove(&execution_id);
    Ok(())
  }
}
