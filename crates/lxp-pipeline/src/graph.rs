//! Stage graph: a named DAG where each stage is backed by a job type.
//!
//! Edges are `(stage, depends_on)` pairs held as names, never as object
//! references, so deep graphs stay flat in memory. Validation walks the
//! graph once with Kahn's algorithm; a leftover node means a cycle.

use std::collections::{HashMap, VecDeque};

use lxp_errors::{Code, CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Enqueued automatically once its dependencies are done.
    Job,
    /// Pauses progression until an external signal arrives.
    WaitPoint,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub job_type: String,
    pub kind: StageKind,
    pub depends_on: Vec<String>,
}

impl Stage {
    pub fn job(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            kind: StageKind::Job,
            depends_on: Vec::new(),
        }
    }

    pub fn wait_point(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            kind: StageKind::WaitPoint,
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
}

impl StageGraph {
    /// Validate and build. Rejects duplicate names, unknown dependencies,
    /// self-dependencies, and cycles.
    pub fn new(stages: Vec<Stage>) -> CoreResult<Self> {
        const OP: &str = "pipeline.graph";

        if stages.is_empty() {
            return Err(CoreError::new(Code::Validation, OP, "graph needs at least one stage"));
        }

        let mut index = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.name.clone(), i).is_some() {
                return Err(CoreError::new(
                    Code::Validation,
                    OP,
                    format!("duplicate stage name '{}'", stage.name),
                ));
            }
        }

        for stage in &stages {
            for dep in &stage.depends_on {
                if dep == &stage.name {
                    return Err(CoreError::new(
                        Code::Validation,
                        OP,
                        format!("stage '{}' depends on itself", stage.name),
                    ));
                }
                if !index.contains_key(dep) {
                    return Err(CoreError::new(
                        Code::Validation,
                        OP,
                        format!("stage '{}' depends on unknown stage '{dep}'", stage.name),
                    ));
                }
            }
        }

        // Kahn's algorithm over the name graph; a leftover node is a cycle.
        let mut in_degree: HashMap<&str, usize> = stages
            .iter()
            .map(|s| (s.name.as_str(), s.depends_on.len()))
            .collect();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut visited = 0usize;
        while let Some(name) = queue.pop_front() {
            visited += 1;
            for stage in &stages {
                if stage.depends_on.iter().any(|d| d == name) {
                    let d = in_degree
                        .get_mut(stage.name.as_str())
                        .expect("stage indexed");
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(stage.name.as_str());
                    }
                }
            }
        }

        if visited != stages.len() {
            return Err(CoreError::new(Code::Validation, OP, "stage graph contains a cycle"));
        }

        Ok(Self { stages, index })
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.index.get(name).map(|i| &self.stages[*i])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stages with no dependencies, in declaration order.
    pub fn roots(&self) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .collect()
    }

    /// Stages that list `name` among their dependencies.
    pub fn dependents_of(&self, name: &str) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d == name))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn intake_pipeline() -> Vec<Stage> {
        vec![
            Stage::job("intake", "course_intake"),
            Stage::job("grouping", "concept_grouping").after(&["intake"]),
            Stage::wait_point("review_gate", "structure_review").after(&["grouping"]),
            Stage::job("dispatch", "structure_dispatch").after(&["review_gate"]),
        ]
    }

    #[test]
    fn valid_graph_builds_with_roots_and_dependents() {
        let graph = StageGraph::new(intake_pipeline()).unwrap();
        let roots: Vec<&str> = graph.roots().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(roots, vec!["intake"]);

        let deps: Vec<&str> = graph
            .dependents_of("grouping")
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(deps, vec!["review_gate"]);
        assert_eq!(
            graph.stage("review_gate").unwrap().kind,
            StageKind::WaitPoint
        );
    }

    #[test]
    fn cycle_is_rejected() {
        let err = StageGraph::new(vec![
            Stage::job("a", "ta").after(&["b"]),
            Stage::job("b", "tb").after(&["a"]),
        ])
        .unwrap_err();
        assert_eq!(err.code(), Code::Validation);
        assert!(err.message().contains("cycle"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = StageGraph::new(vec![Stage::job("a", "ta").after(&["ghost"])]).unwrap_err();
        assert!(err.message().contains("unknown stage"));
    }

    #[test]
    fn duplicate_name_and_self_dependency_are_rejected() {
        let err = StageGraph::new(vec![Stage::job("a", "t1"), Stage::job("a", "t2")]).unwrap_err();
        assert!(err.message().contains("duplicate"));

        let err = StageGraph::new(vec![Stage::job("a", "t").after(&["a"])]).unwrap_err();
        assert!(err.message().contains("depends on itself"));
    }

    #[test]
    fn empty_graph_is_rejected() {
        assert!(StageGraph::new(Vec::new()).is_err());
    }
}
