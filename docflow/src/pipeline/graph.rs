//! Validated stage dependency graph.
//!
//! [`PipelineGraph::build`] turns a [`PipelineConfig`] into an immutable DAG,
//! rejecting configurations that cannot run: duplicate or empty names,
//! undefined dependencies, cycles, and inputs that are not upstream.
//!
//! Topological order is computed with Kahn's algorithm. Among stages that
//! are ready at the same time, the one declared first wins, so the order is
//! deterministic for a given configuration.
//!
//! ```text
//!        parse              wave 1
//!       /     \
//!    chunk   ocr            wave 2
//!       \     /
//!        embed              wave 3
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::error::ConfigurationError;
use super::result::StageStatus;
use super::stage::Stage;
use crate::config::PipelineConfig;
use crate::executor::LaneKind;

/// An immutable, validated pipeline DAG.
#[derive(Debug)]
pub struct PipelineGraph {
    config: PipelineConfig,
    config_hash: String,
    stages: Vec<Arc<Stage>>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    topo_order: Vec<usize>,
}

impl PipelineGraph {
    /// Validates `config` and builds the graph.
    pub fn build(config: PipelineConfig) -> Result<Self, ConfigurationError> {
        for kind in LaneKind::ALL {
            if config.resource_limits.lane(kind).max_concurrency == 0 {
                return Err(ConfigurationError::InvalidLaneLimit { lane: kind });
            }
        }

        let mut index = HashMap::with_capacity(config.stages.len());
        for (position, stage) in config.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(ConfigurationError::EmptyStageName);
            }
            if stage.timeout.is_zero() {
                return Err(ConfigurationError::ZeroTimeout {
                    stage: stage.name.clone(),
                });
            }
            if index.insert(stage.name.clone(), position).is_some() {
                return Err(ConfigurationError::DuplicateStage(stage.name.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); config.stages.len()];
        let mut dependents = vec![Vec::new(); config.stages.len()];
        for (position, stage) in config.stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let Some(&dep_index) = index.get(dep) else {
                    return Err(ConfigurationError::UndefinedDependency {
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                if !dependencies[position].contains(&dep_index) {
                    dependencies[position].push(dep_index);
                    dependents[dep_index].push(position);
                }
            }
        }

        let topo_order = topological_sort(&dependencies, &dependents).map_err(|stuck| {
            ConfigurationError::Cycle(find_cycle(stuck, &dependencies, &config))
        })?;

        let stages: Vec<Arc<Stage>> = config
            .stages
            .iter()
            .enumerate()
            .map(|(position, stage)| Arc::new(Stage::from_config(stage, position)))
            .collect();

        let ancestors = ancestor_sets(&topo_order, &dependencies);
        for (position, stage) in stages.iter().enumerate() {
            for input in &stage.inputs {
                let upstream = index
                    .get(input)
                    .is_some_and(|i| ancestors[position].contains(i));
                if !upstream {
                    return Err(ConfigurationError::InvalidInput {
                        stage: stage.name.clone(),
                        input: input.clone(),
                    });
                }
            }
        }

        let config_hash = config.content_hash();
        Ok(Self {
            config,
            config_hash,
            stages,
            index,
            dependencies,
            dependents,
            topo_order,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Fingerprint of the configuration this graph was built from.
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in configuration order.
    pub fn stages(&self) -> impl Iterator<Item = &Arc<Stage>> {
        self.stages.iter()
    }

    pub fn stage(&self, name: &str) -> Option<&Arc<Stage>> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    pub(crate) fn stage_at(&self, position: usize) -> &Arc<Stage> {
        &self.stages[position]
    }

    /// Stage names in topological order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.topo_order
            .iter()
            .map(|&i| self.stages[i].name.as_str())
            .collect()
    }

    pub(crate) fn topological_positions(&self) -> &[usize] {
        &self.topo_order
    }

    /// Stages grouped into waves, assuming every stage succeeds.
    pub fn waves(&self) -> Vec<Vec<&str>> {
        let mut level = vec![0usize; self.stages.len()];
        for &i in &self.topo_order {
            level[i] = self.dependencies[i]
                .iter()
                .map(|&d| level[d] + 1)
                .max()
                .unwrap_or(0);
        }
        let depth = level.iter().copied().max().map_or(0, |m| m + 1);
        let mut waves = vec![Vec::new(); depth];
        for (i, stage) in self.stages.iter().enumerate() {
            waves[level[i]].push(stage.name.as_str());
        }
        waves
    }

    /// Stages that can be dispatched now, in configuration order.
    ///
    /// A stage is ready when it has no result yet and every dependency
    /// succeeded.
    pub fn ready_stages<F>(&self, status: F) -> Vec<usize>
    where
        F: Fn(&str) -> Option<StageStatus>,
    {
        (0..self.stages.len())
            .filter(|&i| status(&self.stages[i].name).is_none())
            .filter(|&i| {
                self.dependencies[i]
                    .iter()
                    .all(|&d| status(&self.stages[d].name) == Some(StageStatus::Success))
            })
            .collect()
    }

    /// First direct dependency of `position` whose status prevents it from
    /// ever running.
    pub(crate) fn blocking_dependency<F>(&self, position: usize, status: F) -> Option<&str>
    where
        F: Fn(&str) -> Option<StageStatus>,
    {
        self.dependencies[position]
            .iter()
            .map(|&d| self.stages[d].name.as_str())
            .find(|name| status(name).is_some_and(|s| s.blocks_dependents()))
    }

    /// All stages downstream of `name`, in topological order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            for &next in &self.dependents[current] {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        self.topo_order
            .iter()
            .filter(|i| seen.contains(i))
            .map(|&i| self.stages[i].name.as_str())
            .collect()
    }
}

/// Kahn's algorithm. On failure returns the positions that never reached
/// in-degree zero.
fn topological_sort(
    dependencies: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>, Vec<usize>> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = (0..in_degree.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(current) = ready.pop_first() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() == in_degree.len() {
        Ok(order)
    } else {
        Err((0..in_degree.len()).filter(|&i| in_degree[i] > 0).collect())
    }
}

/// Walks unresolved dependencies from the first stuck stage until a stage
/// repeats. Every stuck stage has at least one stuck dependency, so the walk
/// always closes a loop.
fn find_cycle(stuck: Vec<usize>, dependencies: &[Vec<usize>], config: &PipelineConfig) -> Vec<String> {
    let stuck_set: HashSet<usize> = stuck.iter().copied().collect();
    let Some(&start) = stuck.first() else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut positions = HashMap::from([(start, 0usize)]);
    let mut current = start;
    loop {
        let Some(&next) = dependencies[current]
            .iter()
            .find(|d| stuck_set.contains(d))
        else {
            break;
        };
        if let Some(&at) = positions.get(&next) {
            let mut cycle: Vec<String> = path[at..]
                .iter()
                .map(|&i| config.stages[i].name.clone())
                .collect();
            cycle.push(config.stages[next].name.clone());
            return cycle;
        }
        positions.insert(next, path.len());
        path.push(next);
        current = next;
    }

    path.iter().map(|&i| config.stages[i].name.clone()).collect()
}

fn ancestor_sets(topo_order: &[usize], dependencies: &[Vec<usize>]) -> Vec<HashSet<usize>> {
    let mut ancestors = vec![HashSet::new(); dependencies.len()];
    for &i in topo_order {
        let mut set = HashSet::new();
        for &d in &dependencies[i] {
            set.insert(d);
            set.extend(ancestors[d].iter().copied());
        }
        ancestors[i] = set;
    }
    ancestors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaneConfig, StageConfig};
    use std::time::Duration;

    fn diamond() -> PipelineConfig {
        PipelineConfig::builder()
            .stage(StageConfig::new("parse", "parse"))
            .stage(StageConfig::new("chunk", "chunk").depends_on(["parse"]))
            .stage(StageConfig::new("ocr", "ocr").depends_on(["parse"]))
            .stage(StageConfig::new("embed", "embed").depends_on(["chunk", "ocr"]))
            .build()
    }

    #[test]
    fn test_diamond_topological_order() {
        let graph = PipelineGraph::build(diamond()).unwrap();
        assert_eq!(
            graph.topological_order(),
            vec!["parse", "chunk", "ocr", "embed"]
        );
    }

    #[test]
    fn test_diamond_waves() {
        let graph = PipelineGraph::build(diamond()).unwrap();
        assert_eq!(
            graph.waves(),
            vec![vec!["parse"], vec!["chunk", "ocr"], vec!["embed"]]
        );
    }

    #[test]
    fn test_topological_order_respects_dependencies_declared_later() {
        let config = PipelineConfig::builder()
            .stage(StageConfig::new("embed", "embed").depends_on(["parse"]))
            .stage(StageConfig::new("parse", "parse"))
            .build();
        let graph = PipelineGraph::build(config).unwrap();
        assert_eq!(graph.topological_order(), vec!["parse", "embed"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let config = PipelineConfig::builder()
            .stage(StageConfig::new("a", "x").depends_on(["c"]))
            .stage(StageConfig::new("b", "x").depends_on(["a"]))
            .stage(StageConfig::new("c", "x").depends_on(["b"]))
            .build();
        let err = PipelineGraph::build(config).unwrap_err();
        match err {
            ConfigurationError::Cycle(path) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let config = PipelineConfig::builder()
            .stage(StageConfig::new("a", "x").depends_on(["a"]))
            .build();
        assert_eq!(
            PipelineGraph::build(config).unwrap_err(),
            ConfigurationError::Cycle(vec!["a".into(), "a".into()])
        );
    }

    #[test]
    fn test_undefined_dependency_rejected() {
        let config = PipelineConfig::builder()
            .stage(StageConfig::new("a", "x").depends_on(["ghost"]))
            .build();
        assert_eq!(
            PipelineGraph::build(config).unwrap_err(),
            ConfigurationError::UndefinedDependency {
                stage: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let config = PipelineConfig::builder()
            .stage(StageConfig::new("a", "x"))
            .stage(StageConfig::new("a", "y"))
            .build();
        assert_eq!(
            PipelineGraph::build(config).unwrap_err(),
            ConfigurationError::DuplicateStage("a".into())
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let config = PipelineConfig::builder()
            .stage(StageConfig::new(" ", "x"))
            .build();
        assert_eq!(
            PipelineGraph::build(config).unwrap_err(),
            ConfigurationError::EmptyStageName
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = PipelineConfig::builder()
            .stage(StageConfig::new("a", "x").with_timeout(Duration::ZERO))
            .build();
        assert!(matches!(
            PipelineGraph::build(config),
            Err(ConfigurationError::ZeroTimeout { .. })
        ));
    }

    #[test]
    fn test_zero_lane_concurrency_rejected() {
        let config = PipelineConfig::builder()
            .lane(LaneKind::Io, LaneConfig::new(0, 4))
            .build();
        assert_eq!(
            PipelineGraph::build(config).unwrap_err(),
            ConfigurationError::InvalidLaneLimit { lane: LaneKind::Io }
        );
    }

    #[test]
    fn test_transitive_input_allowed() {
        let config = PipelineConfig::builder()
            .stage(StageConfig::new("parse", "parse"))
            .stage(StageConfig::new("chunk", "chunk").depends_on(["parse"]))
            .stage(
                StageConfig::new("embed", "embed")
                    .depends_on(["chunk"])
                    .with_inputs(["chunk", "parse"]),
            )
            .build();
        let graph = PipelineGraph::build(config).unwrap();
        assert_eq!(graph.stage("embed").unwrap().inputs, vec!["chunk", "parse"]);
    }

    #[test]
    fn test_non_upstream_input_rejected() {
        let config = PipelineConfig::builder()
            .stage(StageConfig::new("parse", "parse"))
            .stage(StageConfig::new("ocr", "ocr"))
            .stage(
                StageConfig::new("embed", "embed")
                    .depends_on(["parse"])
                    .with_inputs(["ocr"]),
            )
            .build();
        assert_eq!(
            PipelineGraph::build(config).unwrap_err(),
            ConfigurationError::InvalidInput {
                stage: "embed".into(),
                input: "ocr".into()
            }
        );
    }

    #[test]
    fn test_ready_stages_follow_results() {
        let graph = PipelineGraph::build(diamond()).unwrap();
        let mut statuses: HashMap<String, StageStatus> = HashMap::new();

        let ready = graph.ready_stages(|n| statuses.get(n).copied());
        assert_eq!(ready, vec![0]);

        statuses.insert("parse".into(), StageStatus::Success);
        let ready = graph.ready_stages(|n| statuses.get(n).copied());
        assert_eq!(ready, vec![1, 2]);

        statuses.insert("chunk".into(), StageStatus::Success);
        statuses.insert("ocr".into(), StageStatus::Failed);
        let ready = graph.ready_stages(|n| statuses.get(n).copied());
        assert!(ready.is_empty());
        assert_eq!(
            graph.blocking_dependency(3, |n| statuses.get(n).copied()),
            Some("ocr")
        );
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = PipelineGraph::build(diamond()).unwrap();
        assert_eq!(
            graph.transitive_dependents("parse"),
            vec!["chunk", "ocr", "embed"]
        );
        assert_eq!(graph.transitive_dependents("ocr"), vec!["embed"]);
        assert!(graph.transitive_dependents("embed").is_empty());
    }

    #[test]
    fn test_empty_pipeline_is_valid() {
        let graph = PipelineGraph::build(PipelineConfig::default()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.waves().is_empty());
    }
}
