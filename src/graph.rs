//! The task graph.
//!
//! A [`Graph`] owns every [`Task`] and the dependency edges between them.
//! Edges only ever live in the underlying `petgraph` graph, so the upstream
//! and downstream views of a task can't disagree.

mod executor;
mod report;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::develop::{Editor, develop};
use crate::error::{
    BuildError, ConfigError, DevelopError, Error, GraphBuildError, GraphRenderError, RenderError,
};
use crate::source::Reload;
use crate::task::{Task, TaskStatus, Upstream};

pub use report::{BuildReport, Outcome, ReportEntry, SkipReason, TaskSummary};

/// What happens to downstream tasks when a task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Downstream tasks are not built.
    #[default]
    Stop,
    /// Downstream tasks are built anyway.
    Continue,
}

/// How independent tasks are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Executor {
    /// One task at a time, in dependency order.
    #[default]
    Serial,
    /// Independent tasks run concurrently on a rayon pool.
    Parallel {
        /// Pool size, the global rayon pool when `None`.
        threads: Option<usize>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    /// Re-read task sources from storage on every render.
    pub hot_reload: bool,
    pub on_failure: OnFailure,
    #[serde(skip)]
    pub executor: Executor,
}

impl GraphConfig {
    pub fn hot_reload(mut self, hot_reload: bool) -> Self {
        self.hot_reload = hot_reload;
        self
    }

    pub fn on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    fn reload(&self) -> Reload {
        match self.hot_reload {
            true => Reload::Live,
            false => Reload::Cached,
        }
    }
}

/// A directed acyclic graph of tasks.
#[derive(Debug, Default)]
pub struct Graph {
    graph: petgraph::Graph<Task, ()>,
    index: HashMap<String, NodeIndex>,
    config: GraphConfig,
}

impl Graph {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            graph: petgraph::Graph::new(),
            index: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Adds a task. The graph's reload mode is applied to its source.
    pub fn add(&mut self, mut task: Task) -> Result<(), ConfigError> {
        if self.index.contains_key(task.name()) {
            return Err(ConfigError::DuplicateTask(task.name().to_string()));
        }

        task.source_mut().set_reload(self.config.reload())?;

        let name = task.name().to_string();
        let index = self.graph.add_node(task);
        self.index.insert(name, index);
        Ok(())
    }

    /// Makes `upstream` a dependency of `task`.
    pub fn depend(&mut self, task: &str, upstream: &str) -> Result<(), ConfigError> {
        let target = self.lookup(task)?;
        let source = self.lookup(upstream)?;

        if source == target {
            return Err(ConfigError::SelfDependency(task.to_string()));
        }

        if petgraph::algo::has_path_connecting(&self.graph, target, source, None) {
            return Err(ConfigError::Cycle {
                task: task.to_string(),
                upstream: upstream.to_string(),
            });
        }

        self.graph.update_edge(source, target, ());
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<NodeIndex, ConfigError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownTask {
                name: name.to_string(),
                valid: self.names().collect::<Vec<_>>().join(", "),
            })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Task names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(Task::name)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|&index| &self.graph[index])
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.index.get(name).map(|&index| &mut self.graph[index])
    }

    /// Tasks in dependency order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order(None).into_iter().map(|index| &self.graph[index])
    }

    pub(crate) fn indexed_tasks(&self) -> impl Iterator<Item = (usize, &Task)> {
        self.graph
            .node_indices()
            .map(|index| (index.index(), &self.graph[index]))
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.graph
            .raw_edges()
            .iter()
            .map(|edge| (edge.source().index(), edge.target().index()))
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&index) = self.index.get(name) else {
            return Vec::new();
        };

        let mut names: Vec<_> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|other| (other, self.graph[other].name()))
            .collect();
        names.sort_by_key(|(index, _)| *index);
        names.into_iter().map(|(_, name)| name).collect()
    }

    pub fn upstream(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    pub fn downstream(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Topological order, ties broken by insertion order. When `subset` is
    /// given only those nodes are ordered.
    fn order(&self, subset: Option<&HashSet<NodeIndex>>) -> Vec<NodeIndex> {
        let included = |index: &NodeIndex| subset.is_none_or(|set| set.contains(index));

        let mut pending: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .filter(included)
            .map(|index| {
                let count = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .filter(included)
                    .count();
                (index, count)
            })
            .collect();

        let mut ready: BTreeSet<NodeIndex> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| *index)
            .collect();

        let mut order = Vec::with_capacity(pending.len());

        while let Some(index) = ready.pop_first() {
            order.push(index);
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if let Some(count) = pending.get_mut(&next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        order
    }

    /// The task and everything it transitively depends on.
    fn closure(&self, target: NodeIndex) -> HashSet<NodeIndex> {
        let mut seen = HashSet::from([target]);
        let mut stack = vec![target];

        while let Some(index) = stack.pop() {
            for upstream in self.graph.neighbors_directed(index, Direction::Incoming) {
                if seen.insert(upstream) {
                    stack.push(upstream);
                }
            }
        }

        seen
    }

    /// Current fingerprints and locations of the upstream products of a task.
    fn upstream_of(&self, index: NodeIndex) -> Result<BTreeMap<String, Upstream>, RenderError> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|upstream| {
                let task = &self.graph[upstream];
                let state = task.as_upstream().map_err(|source| RenderError::Upstream {
                    task: task.name().to_string(),
                    source,
                })?;
                Ok((task.name().to_string(), state))
            })
            .collect()
    }

    fn render_nodes(&mut self, nodes: &[NodeIndex]) -> Vec<(NodeIndex, RenderError)> {
        let mut failures = Vec::new();

        for &index in nodes {
            let result = self
                .upstream_of(index)
                .and_then(|upstream| self.graph[index].render(&upstream));

            if let Err(e) = result {
                let task = &mut self.graph[index];
                tracing::error!(task = task.name(), "render failed: {e}");
                task.set_status(TaskStatus::Errored);
                failures.push((index, e));
            }
        }

        failures
    }

    /// Renders every task in dependency order.
    ///
    /// A task failing to render doesn't stop the others; all failures are
    /// returned together.
    pub fn render(&mut self) -> Result<(), GraphRenderError> {
        let order = self.order(None);
        let failures = self.render_nodes(&order);

        if failures.is_empty() {
            return Ok(());
        }

        Err(GraphRenderError {
            failures: failures
                .into_iter()
                .map(|(index, e)| (self.graph[index].name().to_string(), e))
                .collect(),
        })
    }

    fn build_nodes(&mut self, nodes: HashSet<NodeIndex>, force: bool) -> Result<BuildReport, GraphBuildError> {
        let order = self.order(Some(&nodes));

        let span = tracing::span!(Level::INFO, "build", tasks = order.len());
        let _enter = span.enter();
        let start = Instant::now();

        let render_failures = self.render_nodes(&order);
        let run = executor::run(&mut self.graph, &order, force, &self.config);

        let mut failures: Vec<(String, BuildError)> = render_failures
            .into_iter()
            .map(|(index, e)| (self.graph[index].name().to_string(), e.into()))
            .collect();
        failures.extend(run.failures);

        tracing::info!(
            "Finished in {:.2?}: {} built, {} failed",
            start.elapsed(),
            run.report.entries().iter().filter(|e| e.outcome == Outcome::Built).count(),
            failures.len()
        );

        match failures.is_empty() {
            true => Ok(run.report),
            false => Err(GraphBuildError {
                failures,
                report: run.report,
            }),
        }
    }

    /// Renders and builds the whole graph.
    ///
    /// Up-to-date tasks are skipped unless `force` is set. Every task
    /// failure is collected into the returned error together with the
    /// report of what ran.
    pub fn build(&mut self, force: bool) -> Result<BuildReport, GraphBuildError> {
        let nodes = self.graph.node_indices().collect();
        self.build_nodes(nodes, force)
    }

    /// Builds `target` and the tasks it depends on, leaving every other
    /// task untouched.
    pub fn build_partially(&mut self, target: &str, force: bool) -> Result<BuildReport, Error> {
        let index = self.lookup(target)?;
        let nodes = self.closure(index);
        Ok(self.build_nodes(nodes, force)?)
    }

    /// Renders and builds one task, whatever the state of its upstream.
    pub fn build_task(&mut self, name: &str, force: bool) -> Result<Outcome, Error> {
        let index = self.lookup(name)?;

        let span = tracing::span!(Level::INFO, "task", name);
        let _enter = span.enter();

        let fail = |source: BuildError| Error::Task {
            name: name.to_string(),
            source,
        };

        let upstream = self.upstream_of(index).map_err(|e| fail(e.into()))?;
        let task = &mut self.graph[index];
        task.render(&upstream).map_err(|e| fail(e.into()))?;
        task.build(force, &upstream).map_err(fail)
    }

    /// Opens the document of a task in `editor`, see [`develop`].
    pub fn develop(&mut self, name: &str, editor: &dyn Editor) -> Result<bool, Error> {
        let index = self.lookup(name)?;
        let upstream = self.upstream_of(index).map_err(DevelopError::Render)?;
        Ok(develop(&mut self.graph[index], &upstream, editor)?)
    }

    /// Status and staleness of every task, in dependency order.
    pub fn status(&self) -> Vec<TaskSummary> {
        self.order(None)
            .into_iter()
            .map(|index| {
                let task = &self.graph[index];
                TaskSummary {
                    name: task.name().to_string(),
                    status: task.status(),
                    staleness: task.staleness(),
                    upstream: self.upstream(task.name()).into_iter().map(String::from).collect(),
                    product: task.product().paths().to_string(),
                }
            })
            .collect()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, task) in self.indexed_tasks() {
            let name = task.name().replace('"', "\\\"");
            writeln!(f, "    {index}[\"{name}\"]")?;
        }

        for (source, target) in self.edges() {
            writeln!(f, "    {source} --> {target}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::Product;

    fn noop(name: &str) -> Task {
        Task::callable(name, name, Product::file(format!("{name}.txt")), |_| Ok(()))
    }

    fn graph(names: &[&str]) -> Graph {
        let mut graph = Graph::default();
        for name in names {
            graph.add(noop(name)).unwrap();
        }
        graph
    }

    #[test]
    fn test_edges_are_consistent() {
        let mut graph = graph(&["a", "b", "c"]);
        graph.depend("b", "a").unwrap();
        graph.depend("c", "a").unwrap();
        graph.depend("c", "b").unwrap();

        assert_eq!(graph.upstream("c"), vec!["a", "b"]);
        assert_eq!(graph.downstream("a"), vec!["b", "c"]);
        assert_eq!(graph.upstream("a"), Vec::<&str>::new());
    }

    #[test]
    fn test_cycles_are_rejected() {
        let mut graph = graph(&["a", "b", "c"]);
        graph.depend("b", "a").unwrap();
        graph.depend("c", "b").unwrap();

        assert!(matches!(graph.depend("a", "c"), Err(ConfigError::Cycle { .. })));
        assert!(matches!(graph.depend("a", "a"), Err(ConfigError::SelfDependency(_))));
        assert_eq!(graph.upstream("a"), Vec::<&str>::new());
    }

    #[test]
    fn test_unknown_and_duplicate_tasks() {
        let mut graph = graph(&["a"]);

        let err = graph.depend("a", "missing").unwrap_err().to_string();
        assert!(err.contains("\"missing\""));
        assert!(err.contains("a"));

        assert!(matches!(graph.add(noop("a")), Err(ConfigError::DuplicateTask(_))));
    }

    #[test]
    fn test_order_is_stable() {
        let mut graph = graph(&["d", "c", "b", "a"]);
        graph.depend("d", "a").unwrap();

        let names: Vec<_> = graph.tasks().map(Task::name).collect();
        assert_eq!(names, vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn test_closure() {
        let mut graph = graph(&["a", "b", "c", "d"]);
        graph.depend("b", "a").unwrap();
        graph.depend("c", "b").unwrap();
        graph.depend("d", "a").unwrap();

        let closure = graph.closure(graph.lookup("c").unwrap());
        let mut names: Vec<_> = closure.iter().map(|&i| graph.graph[i].name()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_mermaid() {
        let mut graph = graph(&["load", "plot"]);
        graph.depend("plot", "load").unwrap();

        assert_eq!(
            graph.to_string(),
            "graph LR\n    0[\"load\"]\n    1[\"plot\"]\n    0 --> 1\n"
        );
    }
}
