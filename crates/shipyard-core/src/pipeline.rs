//! Stage pipeline graph: next-stage edges, cycle validation and derived
//! production status.
//!
//! The graph is a read-only view over a set of stages. Validation only rejects
//! cycles that lead back to the stage being validated (the origin); a loop
//! further down the chain that never returns to the origin is tolerated and
//! simply not walked twice.
//!
//! Validation reads sibling stages as they were loaded. Two concurrent edits
//! that each add one half of a cycle can both pass; serializing edge writes is
//! the store's job.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::id::StageId;
use crate::stage::Stage;
use crate::store::Store;
use crate::{Error, Result};

/// Read-only view of a project's stages and their next-stage edges.
#[derive(Debug, Clone)]
pub struct PipelineGraph<'a> {
    stages: HashMap<StageId, &'a Stage>,
}

impl<'a> PipelineGraph<'a> {
    pub fn new(stages: impl IntoIterator<Item = &'a Stage>) -> Self {
        Self {
            stages: stages.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    pub fn stage(&self, id: StageId) -> Option<&'a Stage> {
        self.stages.get(&id).copied()
    }

    /// Validate `stage` against cycles that return to it. Appends a message to
    /// `errors` and returns false when one is found.
    pub fn validate(&self, stage: &Stage, errors: &mut Vec<String>) -> bool {
        self.validate_from(stage, stage.id, errors)
    }

    /// Validate the chain starting at `stage` against cycles back to `origin`.
    pub fn validate_from(&self, stage: &Stage, origin: StageId, errors: &mut Vec<String>) -> bool {
        let origin_name = if origin == stage.id {
            stage.name.as_str()
        } else {
            self.stage(origin).map(|s| s.name.as_str()).unwrap_or("?")
        };
        let mut walk = Walk {
            graph: self,
            origin,
            origin_name,
            path: vec![stage.name.as_str()],
            on_path: HashSet::from([stage.id]),
        };

        match walk.find_cycle(stage) {
            None => true,
            Some(cycle) => {
                // cycle[0] is the validated stage; cycle[1] is the edge that led back.
                let offender = cycle.get(1).copied().unwrap_or(origin_name);
                debug!(stage = %stage.name, cycle = ?cycle, "Circular pipeline detected");
                errors.push(format!(
                    "Stage {} causes a circular pipeline with this stage ({})",
                    offender,
                    cycle.join(" -> ")
                ));
                false
            }
        }
    }

    /// True when `stage` is production, or any stage reachable through its
    /// next-stage edges is production and actually deploys code.
    pub fn is_effectively_production(&self, stage: &Stage) -> bool {
        if stage.production {
            return true;
        }

        let mut seen = HashSet::from([stage.id]);
        let mut queue: VecDeque<StageId> = stage.next_stages().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(next) = self.stage(id) else {
                continue;
            };
            if next.production && !next.no_code_deployed {
                return true;
            }
            queue.extend(next.next_stages());
        }
        false
    }
}

struct Walk<'g, 'a> {
    graph: &'g PipelineGraph<'a>,
    origin: StageId,
    origin_name: &'g str,
    path: Vec<&'g str>,
    on_path: HashSet<StageId>,
}

impl<'g, 'a: 'g> Walk<'g, 'a> {
    fn find_cycle(&mut self, stage: &'g Stage) -> Option<Vec<&'g str>> {
        let next: Vec<StageId> = stage.next_stages().collect();

        if next.contains(&self.origin) {
            let mut cycle = self.path.clone();
            cycle.push(self.origin_name);
            return Some(cycle);
        }

        for id in next {
            // Loops that never reach the origin are not rejected, only cut short.
            if self.on_path.contains(&id) {
                continue;
            }
            let Some(child) = self.graph.stage(id) else {
                continue;
            };

            self.on_path.insert(id);
            self.path.push(child.name.as_str());
            if let Some(cycle) = self.find_cycle(child) {
                return Some(cycle);
            }
            self.path.pop();
            self.on_path.remove(&id);
        }
        None
    }
}

/// Replace a stage's next-stage edges, persisting only when the resulting
/// pipeline stays acyclic through that stage.
pub async fn set_next_stages(
    store: &dyn Store,
    stage_id: StageId,
    next_stage_ids: Vec<Option<StageId>>,
) -> Result<Stage> {
    let mut candidate = store.get_stage(stage_id).await?;
    candidate.next_stage_ids = next_stage_ids;

    let siblings = store.stages_for_project(candidate.project_id).await?;
    let graph = PipelineGraph::new(
        siblings
            .iter()
            .filter(|s| s.id != candidate.id)
            .chain(std::iter::once(&candidate)),
    );

    let mut errors = Vec::new();
    if !graph.validate(&candidate, &mut errors) {
        return Err(Error::Validation(errors.join("; ")));
    }

    store.save_stage(&candidate).await?;
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ProjectId;
    use crate::store::MemoryStore;

    fn stages(names: &[&str]) -> Vec<Stage> {
        let project = ProjectId::new();
        names
            .iter()
            .map(|name| Stage::new(project, *name, "true"))
            .collect()
    }

    fn link(stages: &mut [Stage], from: usize, to: usize) {
        let target = stages[to].id;
        stages[from].next_stage_ids.push(Some(target));
    }

    #[test]
    fn test_chain_without_return_edge_is_valid() {
        let mut s = stages(&["a", "b", "c"]);
        link(&mut s, 0, 1);
        link(&mut s, 1, 2);

        let graph = PipelineGraph::new(&s);
        let mut errors = Vec::new();
        assert!(graph.validate(&s[0], &mut errors));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_three_stage_cycle_is_rejected_and_named() {
        let mut s = stages(&["a", "b", "c"]);
        link(&mut s, 0, 1);
        link(&mut s, 1, 2);
        link(&mut s, 2, 0);

        let graph = PipelineGraph::new(&s);
        let mut errors = Vec::new();
        assert!(!graph.validate(&s[0], &mut errors));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Stage b causes a circular pipeline"));
        assert!(errors[0].contains("a -> b -> c -> a"));
    }

    #[test]
    fn test_self_reference_is_rejected() {
        let mut s = stages(&["a"]);
        link(&mut s, 0, 0);

        let graph = PipelineGraph::new(&s);
        let mut errors = Vec::new();
        assert!(!graph.validate(&s[0], &mut errors));
        assert!(errors[0].contains("Stage a causes"));
    }

    #[test]
    fn test_empty_edges_are_compacted() {
        let mut s = stages(&["a", "b"]);
        s[0].next_stage_ids = vec![None, Some(s[1].id), None];

        let graph = PipelineGraph::new(&s);
        assert!(graph.validate(&s[0], &mut Vec::new()));
    }

    #[test]
    fn test_dangling_edge_is_ignored() {
        let mut s = stages(&["a"]);
        s[0].next_stage_ids.push(Some(StageId::new()));

        let graph = PipelineGraph::new(&s);
        assert!(graph.validate(&s[0], &mut Vec::new()));
    }

    // Regression: only cycles through the validated stage are rejected.
    #[test]
    fn test_cycle_not_through_origin_is_tolerated() {
        let mut s = stages(&["a", "b", "c"]);
        link(&mut s, 0, 1);
        link(&mut s, 1, 2);
        link(&mut s, 2, 1);

        let graph = PipelineGraph::new(&s);
        assert!(graph.validate(&s[0], &mut Vec::new()));

        let mut errors = Vec::new();
        assert!(!graph.validate(&s[1], &mut errors));
        assert!(errors[0].contains("Stage c causes"));
    }

    #[test]
    fn test_validate_from_explicit_origin() {
        let mut s = stages(&["a", "b", "c"]);
        link(&mut s, 1, 2);
        link(&mut s, 2, 0);

        let graph = PipelineGraph::new(&s);
        let mut errors = Vec::new();
        assert!(!graph.validate_from(&s[1], s[0].id, &mut errors));
        assert!(errors[0].contains("b -> c -> a"));
    }

    #[test]
    fn test_production_flag_on_stage_itself() {
        let mut s = stages(&["prod"]);
        s[0].production = true;
        let graph = PipelineGraph::new(&s);
        assert!(graph.is_effectively_production(&s[0]));
    }

    #[test]
    fn test_production_reached_through_next_stages() {
        let mut s = stages(&["staging", "canary", "prod"]);
        link(&mut s, 0, 1);
        link(&mut s, 1, 2);
        s[2].production = true;

        let graph = PipelineGraph::new(&s);
        assert!(graph.is_effectively_production(&s[0]));
    }

    #[test]
    fn test_no_code_deployed_production_does_not_count() {
        let mut s = stages(&["staging", "prod-restart"]);
        link(&mut s, 0, 1);
        s[1].production = true;
        s[1].no_code_deployed = true;

        let graph = PipelineGraph::new(&s);
        assert!(!graph.is_effectively_production(&s[0]));
    }

    #[test]
    fn test_production_walk_terminates_on_loops() {
        let mut s = stages(&["a", "b"]);
        link(&mut s, 0, 1);
        link(&mut s, 1, 0);

        let graph = PipelineGraph::new(&s);
        assert!(!graph.is_effectively_production(&s[0]));
    }

    #[tokio::test]
    async fn test_set_next_stages_rejects_cycle_and_keeps_old_edges() {
        let store = MemoryStore::new();
        let mut s = stages(&["a", "b"]);
        link(&mut s, 0, 1);
        for stage in &s {
            store.save_stage(stage).await.unwrap();
        }

        let err = set_next_stages(&store, s[1].id, vec![Some(s[0].id)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let stored = store.get_stage(s[1].id).await.unwrap();
        assert!(stored.next_stage_ids.is_empty());
    }

    #[tokio::test]
    async fn test_set_next_stages_persists_valid_edges() {
        let store = MemoryStore::new();
        let s = stages(&["a", "b"]);
        for stage in &s {
            store.save_stage(stage).await.unwrap();
        }

        let updated = set_next_stages(&store, s[0].id, vec![Some(s[1].id), None])
            .await
            .unwrap();
        assert_eq!(updated.next_stages().collect::<Vec<_>>(), vec![s[1].id]);
        let stored = store.get_stage(s[0].id).await.unwrap();
        assert_eq!(stored.next_stage_ids.len(), 2);
    }
}
