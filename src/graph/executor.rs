//! Scheduling of task builds.
//!
//! Both executors walk the same state machine: a task is only prepared
//! once every upstream task in the run finished, and every decision about
//! it (run, block, or report a render failure) is taken on the calling
//! thread, which also owns the report. Each task is lent out to at most one
//! worker at a time, so a task never has two builds in flight.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::Hash32;
use crate::error::BuildError;
use crate::graph::{BuildReport, Executor, GraphConfig, OnFailure, Outcome, ReportEntry, SkipReason};
use crate::task::{Task, TaskStatus, Upstream};
use crate::utils;

pub(crate) struct Run {
    pub report: BuildReport,
    pub failures: Vec<(String, BuildError)>,
}

struct Finished {
    outcome: Outcome,
    elapsed: Duration,
    state: Upstream,
}

enum Prepared {
    Run(BTreeMap<String, Upstream>),
    Done,
}

/// Bookkeeping shared by both executors, only ever touched by the
/// scheduling thread.
struct Scheduler<'a> {
    upstreams: &'a HashMap<NodeIndex, Vec<NodeIndex>>,
    names: &'a HashMap<NodeIndex, String>,
    on_failure: OnFailure,
    finished: HashMap<NodeIndex, Finished>,
    failures: HashMap<NodeIndex, BuildError>,
    /// Tasks that errored or were blocked.
    failed: HashSet<NodeIndex>,
}

impl<'a> Scheduler<'a> {
    fn state_of(task: &Task) -> Upstream {
        task.as_upstream().unwrap_or_else(|e| {
            tracing::warn!(task = task.name(), "Couldn't fingerprint product: {e}");
            Upstream {
                fingerprint: Hash32::MISSING,
                paths: task.product().paths(),
            }
        })
    }

    /// Decides what to do with a task whose upstream tasks all finished.
    fn prepare(&mut self, index: NodeIndex, task: &Task) -> Prepared {
        let all: &'a HashMap<NodeIndex, Vec<NodeIndex>> = self.upstreams;
        let upstreams = &all[&index];

        if task.status() == TaskStatus::Errored {
            // failed to render, the failure is already on record
            self.finish(index, Outcome::Errored, Duration::ZERO, Self::state_of(task));
            self.failed.insert(index);
            return Prepared::Done;
        }

        if self.on_failure == OnFailure::Stop && upstreams.iter().any(|u| self.failed.contains(u)) {
            tracing::warn!(task = task.name(), "not built, an upstream task failed");
            let outcome = Outcome::Skipped(SkipReason::UpstreamFailed);
            self.finish(index, outcome, Duration::ZERO, Self::state_of(task));
            self.failed.insert(index);
            return Prepared::Done;
        }

        let upstream = upstreams
            .iter()
            .filter_map(|u| {
                let finished = self.finished.get(u)?;
                Some((self.names[u].clone(), finished.state.clone()))
            })
            .collect();

        Prepared::Run(upstream)
    }

    fn finish(&mut self, index: NodeIndex, outcome: Outcome, elapsed: Duration, state: Upstream) {
        self.finished.insert(
            index,
            Finished {
                outcome,
                elapsed,
                state,
            },
        );
    }

    fn complete(
        &mut self,
        index: NodeIndex,
        result: Result<Outcome, BuildError>,
        state: Upstream,
        elapsed: Duration,
    ) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.failures.insert(index, e);
                self.failed.insert(index);
                Outcome::Errored
            }
        };
        self.finish(index, outcome, elapsed, state);
    }
}

fn build_one(
    task: &mut Task,
    force: bool,
    upstream: &BTreeMap<String, Upstream>,
    style: &ProgressStyle,
) -> (Result<Outcome, BuildError>, Upstream, Duration) {
    let span = tracing::span!(Level::INFO, "task", name = task.name());
    span.pb_set_style(style);
    span.pb_set_message(&format!("Running {}", task.name()));
    let _enter = span.enter();

    let start = Instant::now();

    let result = match catch_unwind(AssertUnwindSafe(|| task.build(force, upstream))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            task.set_status(TaskStatus::Errored);
            Err(BuildError::Execution(anyhow::anyhow!(msg)))
        }
    };

    let elapsed = start.elapsed();
    (result, Scheduler::state_of(task), elapsed)
}

/// Builds the tasks in `order`, which must be topologically sorted and
/// closed under upstream dependencies.
pub(crate) fn run(
    graph: &mut petgraph::Graph<Task, ()>,
    order: &[NodeIndex],
    force: bool,
    config: &GraphConfig,
) -> Run {
    let included: HashSet<NodeIndex> = order.iter().copied().collect();

    let mut upstreams: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for &index in order {
        let mut incoming: Vec<_> = graph
            .neighbors_directed(index, Direction::Incoming)
            .filter(|u| included.contains(u))
            .collect();
        incoming.sort();

        for &u in &incoming {
            dependents.entry(u).or_default().push(index);
        }
        upstreams.insert(index, incoming);
    }

    let names: HashMap<NodeIndex, String> = order
        .iter()
        .map(|&index| (index, graph[index].name().to_string()))
        .collect();

    let mut scheduler = Scheduler {
        upstreams: &upstreams,
        names: &names,
        on_failure: config.on_failure,
        finished: HashMap::new(),
        failures: HashMap::new(),
        failed: HashSet::new(),
    };

    let root_span = tracing::span!(Level::INFO, "building_tasks");
    root_span.pb_set_length(order.len() as u64);
    root_span.pb_set_style(&utils::style_progress());
    root_span.pb_set_message("Building tasks...");
    let _enter = root_span.enter();

    let style = utils::style_task();

    match config.executor {
        Executor::Serial => {
            for &index in order {
                if let Prepared::Run(upstream) = scheduler.prepare(index, &graph[index]) {
                    let (result, state, elapsed) =
                        build_one(&mut graph[index], force, &upstream, &style);
                    scheduler.complete(index, result, state, elapsed);
                }
                root_span.pb_inc(1);
            }
        }
        Executor::Parallel { threads } => {
            run_parallel(
                graph,
                order,
                threads,
                force,
                &mut scheduler,
                &dependents,
                &style,
                &root_span,
            );
        }
    }

    let entries = order
        .iter()
        .filter_map(|index| {
            scheduler.finished.get(index).map(|finished| ReportEntry {
                name: names[index].clone(),
                outcome: finished.outcome,
                elapsed: finished.elapsed,
            })
        })
        .collect();

    let failures = order
        .iter()
        .filter_map(|index| {
            scheduler
                .failures
                .remove(index)
                .map(|e| (names[index].clone(), e))
        })
        .collect();

    Run {
        report: BuildReport::new(entries),
        failures,
    }
}

/// Results sent back by pool workers.
type Message = (NodeIndex, Result<Outcome, BuildError>, Upstream, Duration);

/// The parallel scheduler.
///
/// This executes the graph on a rayon pool. Tasks are spawned as soon as
/// their dependencies are met:
/// 1. The tasks without upstream dependencies are queued.
/// 2. Queued tasks are prepared on this thread and, if they have to run,
///    spawned onto the pool together with a mutable borrow of the task.
/// 3. Workers send their result back over a channel.
/// 4. Each result decrements the dependency counts of the dependents, and
///    those reaching zero are queued.
/// 5. The loop ends once every task finished.
///
/// The loop itself stays on the calling thread, so a pool of a single
/// thread is free to run the spawned builds.
struct Parallel<'g, 's, 'a> {
    slots: Vec<Option<&'g mut Task>>,
    counts: HashMap<NodeIndex, usize>,
    ready: VecDeque<NodeIndex>,
    total: usize,
    force: bool,
    scheduler: &'s mut Scheduler<'a>,
    dependents: &'s HashMap<NodeIndex, Vec<NodeIndex>>,
    style: &'s ProgressStyle,
    root_span: &'s tracing::Span,
}

impl<'g> Parallel<'g, '_, '_> {
    fn unlock(&mut self, index: NodeIndex) {
        for next in self.dependents.get(&index).into_iter().flatten() {
            if let Some(count) = self.counts.get_mut(next) {
                *count -= 1;
                if *count == 0 {
                    self.ready.push_back(*next);
                }
            }
        }
    }

    fn drive<'scope>(&mut self, s: &rayon::Scope<'scope>)
    where
        'g: 'scope,
    {
        let (sender, receiver) = channel::<Message>();
        let mut completed = 0;

        loop {
            while let Some(index) = self.ready.pop_front() {
                let Some(task) = self.slots[index.index()].take() else {
                    continue;
                };

                match self.scheduler.prepare(index, task) {
                    Prepared::Done => {
                        completed += 1;
                        self.root_span.pb_inc(1);
                        self.unlock(index);
                    }
                    Prepared::Run(upstream) => {
                        let sender = sender.clone();
                        let style = self.style.clone();
                        let force = self.force;

                        s.spawn(move |_| {
                            let (result, state, elapsed) =
                                build_one(task, force, &upstream, &style);
                            // the receiver outlives every worker
                            let _ = sender.send((index, result, state, elapsed));
                        });
                    }
                }
            }

            if completed == self.total {
                break;
            }

            let Ok((index, result, state, elapsed)) = receiver.recv() else {
                break;
            };

            self.scheduler.complete(index, result, state, elapsed);
            completed += 1;
            self.root_span.pb_inc(1);
            self.unlock(index);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_parallel(
    graph: &mut petgraph::Graph<Task, ()>,
    order: &[NodeIndex],
    threads: Option<usize>,
    force: bool,
    scheduler: &mut Scheduler<'_>,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    style: &ProgressStyle,
    root_span: &tracing::Span,
) {
    let counts: HashMap<NodeIndex, usize> = order
        .iter()
        .map(|index| (*index, scheduler.upstreams[index].len()))
        .collect();

    let ready: VecDeque<NodeIndex> = order
        .iter()
        .copied()
        .filter(|index| counts[index] == 0)
        .collect();

    let pool = threads.and_then(|n| {
        match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
            Ok(pool) => Some(pool),
            Err(e) => {
                tracing::warn!("Couldn't create a pool of {n} threads, using the global pool: {e}");
                None
            }
        }
    });

    let mut parallel = Parallel {
        slots: graph.node_weights_mut().map(Some).collect(),
        counts,
        ready,
        total: order.len(),
        force,
        scheduler,
        dependents,
        style,
        root_span,
    };

    match pool {
        Some(pool) => pool.in_place_scope(|s| parallel.drive(s)),
        None => rayon::in_place_scope(|s| parallel.drive(s)),
    }
}
