// Ready-step detection and write-key conflict grouping.
// The teacher's flows are a fixed linear sequence with no fan-out, so
// this has no teacher analogue; grounded on the generic DAG-traversal
// pattern `workflow-core::registry`'s topological validation already
// draws on for the same reason.
use std::collections::HashMap;

use workflow_core::{StepSpec, StepStatus, WorkflowDefinition};

fn status_of(statuses: &HashMap<String, StepStatus>, id: &str) -> StepStatus {
  statuses.get(id).copied().unwrap_or(StepStatus::Pending)
}

/// Steps whose dependencies are all terminal and that have not yet been
/// dispatched ("a step becomes ready once every dependency
/// is COMPLETED or SKIPPED").
pub fn ready_steps<'a>(def: &'a WorkflowDefinition, statuses: &HashMap<String, StepStatus>) -> Vec<&'a StepSpec> {
  def.steps
     .iter()
     .filter(|step| status_of(statuses, &step.id) == StepStatus::Pending)
     .filter(|step| step.dependencies.iter().all(|dep| status_of(statuses, dep).is_terminal()))
     .collect()
}

/// Steps still PENDING whose dependencies are all terminal and all
/// SKIPPED ("a step with all-SKIPPED dependencies is SKIPPED; otherwise
/// it proceeds" — a mix of COMPLETED and SKIPPED dependencies still
/// makes the step reachable, since SKIPPED counts as terminal for
/// `ready_steps` too).
pub fn steps_to_skip<'a>(def: &'a WorkflowDefinition, statuses: &HashMap<String, StepStatus>) -> Vec<&'a StepSpec> {
  def.steps
     .iter()
     .filter(|step| status_of(statuses, &step.id) == StepStatus::Pending)
     .filter(|step| !step.dependencies.is_empty())
     .filter(|step| step.dependencies.iter().all(|dep| status_of(statuses, dep).is_terminal()))
     .filter(|step| step.dependencies.iter().all(|dep| status_of(statuses, dep) == StepStatus::Skipped))
     .collect()
}

/// Partitions `ready` into waves that may dispatch concurrently: within a
/// wave, no two steps declare an overlapping output key (/// "two steps within the same execution that share no write-keys in their
/// declared outputs may run in parallel; overlapping output-keys are
/// serialized in definition order"). A step joins the first wave it
/// doesn't conflict with, preserving `ready`'s order within each wave.
pub fn partition_by_write_conflict<'a>(ready: Vec<&'a StepSpec>,
                                        output_keys: impl Fn(&StepSpec) -> Vec<String>)
                                        -> Vec<Vec<&'a StepSpec>> {
  let mut waves: Vec<(Vec<&'a StepSpec>, std::collections::HashSet<String>)> = Vec::new();
  for step in ready {
    let keys = output_keys(step);
    let mut placed = false;
    for (wave, used) in &mut waves {
      if keys.iter().all(|k| !used.contains(k)) {
        wave.push(step);
        used.extend(keys.iter().cloned());
        placed = true;
        break;
      }
    }
    if !placed {
      waves.push((vec![step], keys.into_iter().collect()));
    }
  }
  waves.into_iter().map(|(wave, _)| wave).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeSet;
  use workflow_core::StepKind;

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

  fn def(steps: Vec<StepSpec>) -> WorkflowDefinition {
    WorkflowDefinition { id: "wf".into(),
                         version: 1,
                         name: "wf".into(),
                         description: String::new(),
                         category: "general".into(),
                         entry_points: steps.iter()
                                            .filter(|s| s.dependencies.is_empty())
                                            .map(|s| s.id.clone())
                                            .collect::<BTreeSet<_>>(),
                         exit_points: BTreeSet::new(),
                         steps,
                         ai_configurable: false }
  }

  #[test]
  fn entry_steps_are_ready_with_no_prior_status() {
    let d = def(vec![step("a", &[]), step("b", &["a"])]);
    let ready = ready_steps(&d, &HashMap::new());
    assert_eq!(ready.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["a"]);
  }

  #[test]
  fn dependent_step_is_ready_once_dependency_completes() {
    let d = def(vec![step("a", &[]), step("b", &["a"])]);
    let mut statuses = HashMap::new();
    statuses.insert("a".to_string(), StepStatus::Completed);
    let ready = ready_steps(&d, &statuses);
    assert_eq!(ready.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
  }

  #[test]
  fn a_step_with_only_skipped_dependencies_is_marked_to_skip() {
    let d = def(vec![step("a", &[]), step("b", &["a"])]);
    let mut statuses = HashMap::new();
    statuses.insert("a".to_string(), StepStatus::Skipped);
    let to_skip = steps_to_skip(&d, &statuses);
    assert_eq!(to_skip.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
  }

  #[test]
  fn a_step_with_one_completed_and_one_skipped_dependency_still_proceeds() {
    let d = def(vec![step("a", &[]), step("b", &[]), step("c", &["a", "b"])]);
    let mut statuses = HashMap::new();
    statuses.insert("a".to_string(), StepStatus::Completed);
    statuses.insert("b".to_string(), StepStatus::Skipped);
    assert!(steps_to_skip(&d, &statuses).is_empty());
    let ready = ready_steps(&d, &statuses);
    assert_eq!(ready.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["c"]);
  }

  #[test]
  fn steps_with_disjoint_output_keys_share_a_wave() {
    let ready = vec![step("a", &[]), step("b", &[])];
    let waves = partition_by_write_conflict(ready.iter().collect(),
                                             |s| vec![format!("out_{}", s.id)]);
    assert_eq!(waves.len(), 1);
    assert_eq!(waves[0].len(), 2);
  }

  #[test]
  fn steps_sharing_an_output_key_are_serialized_into_separate_waves() {
    let ready = vec![step("a", &[]), step("b", &[])];
    let waves = partition_by_write_conflict(ready.iter().collect(), |_| vec!["shared".to_string()]);
    assert_eq!(waves.len(), 2);
    assert_eq!(waves[0].len(), 1);
    assert_eq!(waves[1].len(), 1);
  }
}
