// Workflow definition storage and DAG validation. Kahn's algorithm is
// used to reject cyclic graphs and to find steps unreachable from the
// declared entry points; fixed linear macro-generated sequences have no
// need for this, so it is grounded instead on the generic DAG executor
// seen in a wider LLM orchestrator core.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::domain::{StepKind, WorkflowDefinition, WorkflowDefinitionInput, WorkflowSummary};
use crate::errors::{EngineError, Result};

#[async_trait]
pub trait WorkflowRegistry: Send + Sync {
  /// Validates `input` and stores it as the next version of `input.id`.
  async fn register(&self, input: WorkflowDefinitionInput) -> Result<WorkflowDefinition>;

  async fn get(&self, workflow_id: &str, version: Option<i64>) -> Result<WorkflowDefinition>;

  async fn list(&self, category: Option<&str>) -> Result<Vec<WorkflowSummary>>;
}

/// Per-kind config schema check: each `StepSpec`'s `config` must validate
/// against its kind's schema. `workflow-core` has no dependency on the
/// step-library crate that owns the built-in schemas, so the registry
/// takes this as an injected callback rather than importing it directly —
/// the same "providers passed as constructor parameters" shape used
/// elsewhere in this engine.
pub type ConfigValidator = Arc<dyn Fn(StepKind, &serde_json::Value) -> Result<()> + Send + Sync>;

/// Validates the structural invariants of a workflow definition: unique
/// step ids, entry/exit points that reference real steps, no cycles, and
/// no step unreachable from an entry point. Per-kind config schema checks are
/// applied separately by the caller via `ConfigValidator` (see
/// `InMemoryWorkflowRegistry::with_config_validator`).
pub fn validate_definition(def: &WorkflowDefinitionInput) -> Result<()> {
  let mut seen = HashSet::new();
  for step in &def.steps {
    if !seen.insert(step.id.as_str()) {
      return Err(EngineError::DuplicateStepId(step.id.clone()));
    }
  }

  let ids: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
  for dep_holder in &def.steps {
    for dep in &dep_holder.dependencies {
      if !ids.contains(dep.as_str()) {
        return Err(EngineError::InvalidEntryExit(format!("step {} depends on unknown step {dep}", dep_holder.id)));
      }
    }
  }

  if def.entry_points.is_empty() {
    return Err(EngineError::InvalidEntryExit("workflow has no entry points".into()));
  }
  for entry in &def.entry_points {
    if !ids.contains(entry.as_str()) {
      return Err(EngineError::InvalidEntryExit(format!("unknown entry point {entry}")));
    }
  }
  if def.exit_points.is_empty() {
    return Err(EngineError::InvalidEntryExit("workflow has no exit points".into()));
  }
  for exit in &def.exit_points {
    if !ids.contains(exit.as_str()) {
      return Err(EngineError::InvalidEntryExit(format!("unknown exit point {exit}")));
    }
  }

  // entry_points and exit_points are deliberately not required to be
  // disjoint: a single-step workflow has the same step as both. See
  // DESIGN.md's Open Questions for the full rationale.

  // entry points must have no unsatisfied dependencies.
  for entry in &def.entry_points {
    let step = def.steps.iter().find(|s| &s.id == entry).expect("validated above");
    if !step.dependencies.is_empty() {
      return Err(EngineError::InvalidEntryExit(format!("entry point {entry} declares dependencies")));
    }
  }

  // every non-entry step must declare at least one dependency.
  for step in &def.steps {
    if !def.entry_points.contains(&step.id) && step.dependencies.is_empty() {
      return Err(EngineError::InvalidEntryExit(format!("non-entry step {} declares no dependencies", step.id)));
    }
  }

  topo_order(def)?;
  Ok(())
}

/// Kahn's algorithm: returns a topological order, or a `CyclicDependencies`
/// error naming one step still stuck with unresolved dependencies. Also
/// rejects steps that are unreachable from any entry point.
fn topo_order(def: &WorkflowDefinitionInput) -> Result<Vec<String>> {
  let mut indegree: HashMap<&str, usize> = HashMap::new();
  let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
  for step in &def.steps {
    indegree.entry(step.id.as_str()).or_insert(0);
    for dep in &step.dependencies {
      *indegree.entry(step.id.as_str()).or_insert(0) += 1;
      dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
    }
  }

  let mut queue: VecDeque<&str> =
    indegree.iter().filter(|(_, &deg)| deg == 0).map(|(id, _)| *id).collect();
  let mut order = Vec::with_capacity(def.steps.len());
  let mut remaining = indegree.clone();

  while let Some(id) = queue.pop_front() {
    order.push(id.to_string());
    if let Some(next) = dependents.get(id) {
      for &n in next {
        let deg = remaining.get_mut(n).expect("known node");
        *deg -= 1;
        if *deg == 0 {
          queue.push_back(n);
        }
      }
    }
  }

  if order.len() != def.steps.len() {
    let stuck: Vec<&str> = remaining.iter().filter(|(_, &d)| d > 0).map(|(id, _)| *id).collect();
    return Err(EngineError::CyclicDependencies(stuck.join(", ")));
  }

  let reachable = reachable_from_entries(def);
  for step in &def.steps {
    if !reachable.contains(step.id.as_str()) {
      return Err(EngineError::UnreachableStep(step.id.clone()));
    }
  }

  Ok(order)
}

fn reachable_from_entries(def: &WorkflowDefinitionInput) -> HashSet<&str> {
  let mut forward: HashMap<&str, Vec<&str>> = HashMap::new();
  for step in &def.steps {
    for dep in &step.dependencies {
      forward.entry(dep.as_str()).or_default().push(step.id.as_str());
    }
  }

  let mut visited: HashSet<&str> = HashSet::new();
  let mut stack: Vec<&str> = def.entry_points.iter().map(|s| s.as_str()).collect();
  while let Some(id) = stack.pop() {
    if !visited.insert(id) {
      continue;
    }
    if let Some(next) = forward.get(id) {
      stack.extend(next.iter().copied());
    }
  }
  visited
}

struct VersionedDefinitions {
  by_id: HashMap<String, Vec<WorkflowDefinition>>,
}

/// In-memory `WorkflowRegistry`, versions append-only per workflow id.
pub struct InMemoryWorkflowRegistry {
  state: Mutex<VersionedDefinitions>,
  config_validator: Option<ConfigValidator>,
}

impl Default for InMemoryWorkflowRegistry {
  fn default() -> Self {
    Self { state: Mutex::new(VersionedDefinitions { by_id: HashMap::new() }), config_validator: None }
  }
}

impl InMemoryWorkflowRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wires in the step library's per-kind config schema check, applied
  /// to every step of every definition registered from this point on.
  pub fn with_config_validator(mut self, validator: ConfigValidator) -> Self {
    self.config_validator = Some(validator);
    self
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, VersionedDefinitions>> {
    self.state.lock().map_err(|_| EngineError::Storage("workflow registry mutex poisoned".into()))
  }
}

#[async_trait]
impl WorkflowRegistry for InMemoryWorkflowRegistry {
  async fn register(&self, input: WorkflowDefinitionInput) -> Result<WorkflowDefinition> {
    validate_definition(&input)?;
    if let Some(validator) = &self.config_validator {
      for step in &input.steps {
        validator(step.kind, &step.config)?;
      }
    }
    let mut state = self.lock()?;
    let versions = state.by_id.entry(input.id.clone()).or_default();
    let next_version = versions.last().map(|d| d.version + 1).unwrap_or(1);
    let def = WorkflowDefinition { id: input.id,
                                    version: next_version,
                                    name: input.name,
                                    description: input.description,
                                    category: input.category,
                                    steps: input.steps,
                                    entry_points: input.entry_points,
                                    exit_points: input.exit_points,
                                    ai_configurable: input.ai_configurable };
    versions.push(def.clone());
    Ok(def)
  }

  async fn get(&self, workflow_id: &str, version: Option<i64>) -> Result<WorkflowDefinition> {
    let state = self.lock()?;
    let versions =
      state.by_id.get(workflow_id).ok_or_else(|| EngineError::NotFound(format!("workflow {workflow_id}")))?;
    match version {
      Some(v) => versions.iter()
                         .find(|d| d.version == v)
                         .cloned()
                         .ok_or_else(|| EngineError::NotFound(format!("workflow {workflow_id} version {v}"))),
      None => versions.last().cloned().ok_or_else(|| EngineError::NotFound(format!("workflow {workflow_id}"))),
    }
  }

  async fn list(&self, category: Option<&str>) -> Result<Vec<WorkflowSummary>> {
    let state = self.lock()?;
    let mut out = Vec::new();
    for versions in state.by_id.values() {
      if let Some(latest) = versions.last() {
        if category.map(|c| c == latest.category).unwrap_or(true) {
          out.push(WorkflowSummary::from(latest));
        }
      }
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{StepKind, StepSpec};
  use std::collections::BTreeSet;

  fn step(id: &str, deps: &[&str]) -> StepSpec {
    StepSpec { id: id.into(),
               name: id.into(),
               description: String::new(),
               kind: StepKind::Automated,
               config: serde_json::Value::Null,
               dependencies: deps.iter().map(|s| s.to_string()).collect(),
               ai_prompt: None,
               validation_rules: None }
  }

  fn def(steps: Vec<StepSpec>, entry: &[&str], exit: &[&str]) -> WorkflowDefinitionInput {
    WorkflowDefinitionInput { id: "wf".into(),
                              name: "wf".into(),
                              description: String::new(),
                              category: "general".into(),
                              steps,
                              entry_points: entry.iter().map(|s| s.to_string()).collect(),
                              exit_points: exit.iter().map(|s| s.to_string()).collect(),
                              ai_configurable: false }
  }

  #[test]
  fn accepts_a_simple_linear_dag() {
    let d = def(vec![step("a", &[]), step("b", &["a"])], &["a"], &["b"]);
    assert!(validate_definition(&d).is_ok());
  }

  #[test]
  fn rejects_a_cycle() {
    let d = def(vec![step("a", &["b"]), step("b", &["a"])], &["a"], &["b"]);
    let err = validate_definition(&d).unwrap_err();
    assert!(matches!(err, EngineError::CyclicDependencies(_)));
  }

  #[test]
  fn rejects_duplicate_step_ids() {
    let d = def(vec![step("a", &[]), step("a", &[])], &["a"], &["a"]);
    assert!(matches!(validate_definition(&d).unwrap_err(), EngineError::DuplicateStepId(_)));
  }

  #[test]
  fn rejects_a_non_entry_step_with_no_declared_dependencies() {
    let d = def(vec![step("a", &[]), step("b", &[])], &["a"], &["a"]);
    let err = validate_definition(&d).unwrap_err();
    assert!(matches!(err, EngineError::InvalidEntryExit(_)));
  }

  #[tokio::test]
  async fn register_assigns_increasing_versions() {
    let registry = InMemoryWorkflowRegistry::new();
    let d1 = def(vec![step("a", &[])], &["a"], &["a"]);
    let v1 = registry.register(d1).await.unwrap();
    assert_eq!(v1.version, 1);

    let d2 = def(vec![step("a", &[])], &["a"], &["a"]);
    let v2 = registry.register(d2).await.unwrap();
    assert_eq!(v2.version, 2);

    let latest = registry.get("wf", None).await.unwrap();
    assert_eq!(latest.version, 2);
    let pinned = registry.get("wf", Some(1)).await.unwrap();
    assert_eq!(pinned.version, 1);
  }
}
