use std::fmt::{self, Display, Formatter, Write};
use std::time::Duration;

use serde::Serialize;

use crate::graph::Graph;
use crate::task::{Staleness, TaskStatus};

/// Why a task was not built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SkipReason {
    /// Neither the code nor any upstream product changed.
    UpToDate,
    /// An upstream task failed and the graph stops on failure.
    UpstreamFailed,
}

/// What happened to one task during a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Outcome {
    Built,
    Skipped(SkipReason),
    Errored,
}

impl Outcome {
    pub fn ran(self) -> bool {
        matches!(self, Outcome::Built | Outcome::Errored)
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Built => f.write_str("built"),
            Outcome::Skipped(SkipReason::UpToDate) => f.write_str("up to date"),
            Outcome::Skipped(SkipReason::UpstreamFailed) => f.write_str("upstream failed"),
            Outcome::Errored => f.write_str("errored"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub name: String,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// One entry per task that took part in a build, in dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    entries: Vec<ReportEntry>,
}

impl BuildReport {
    pub(crate) fn new(entries: Vec<ReportEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn outcome(&self, name: &str) -> Option<Outcome> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.outcome)
    }

    /// Tasks whose code actually ran, successfully or not.
    pub fn ran(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|entry| entry.outcome.ran())
            .map(|entry| entry.name.as_str())
    }

    pub fn errored(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|entry| entry.outcome == Outcome::Errored)
            .map(|entry| entry.name.as_str())
    }

    pub fn total(&self) -> Duration {
        self.entries.iter().map(|entry| entry.elapsed).sum()
    }

    /// Renders the graph as a Mermaid diagram, color-coded by outcome.
    ///
    /// * **Green**: Built
    /// * **Blue**: Up to date
    /// * **Grey**: Blocked by a failed upstream
    /// * **Red**: Errored
    pub fn render_mermaid(&self, graph: &Graph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for (index, task) in graph.indexed_tasks() {
            let name = task.name().replace('"', "\\\"");

            let (label, color) = match self.entries.iter().find(|e| e.name == task.name()) {
                Some(entry) => {
                    let color = match entry.outcome {
                        Outcome::Built => "#90EE90",
                        Outcome::Skipped(SkipReason::UpToDate) => "#ADD8E6",
                        Outcome::Skipped(SkipReason::UpstreamFailed) => "#D3D3D3",
                        Outcome::Errored => "#F08080",
                    };
                    (format!("{:.2?}", entry.elapsed), color)
                }
                None => ("not built".to_string(), "#FFFFFF"),
            };

            let _ = writeln!(f, "    {index}[\"{name}\\n{label}\"]");
            let _ = writeln!(f, "    style {index} fill:{color}");
        }

        for (source, target) in graph.edges() {
            let _ = writeln!(f, "    {source} --> {target}");
        }

        f
    }
}

impl Display for BuildReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let total = self.total().as_secs_f64();
        let width = self
            .entries
            .iter()
            .map(|entry| entry.name.len())
            .max()
            .unwrap_or(0)
            .max("name".len());

        writeln!(
            f,
            "{:width$} | {:5} | {:>11} | {:>10}",
            "name", "Ran?", "Elapsed (s)", "Percentage"
        )?;
        writeln!(f, "{:-<width$}-+-{:-<5}-+-{:-<11}-+-{:-<10}", "", "", "", "")?;

        for entry in &self.entries {
            let elapsed = entry.elapsed.as_secs_f64();
            let percentage = match total > 0.0 {
                true => elapsed / total * 100.0,
                false => 0.0,
            };

            writeln!(
                f,
                "{:width$} | {:5} | {:>11.4} | {:>10.2}",
                entry.name,
                entry.outcome.ran(),
                elapsed,
                percentage
            )?;
        }

        Ok(())
    }
}

/// State of a task as seen by [`Graph::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub status: TaskStatus,
    /// `None` until the task has been rendered.
    pub staleness: Option<Staleness>,
    pub upstream: Vec<String>,
    pub product: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> BuildReport {
        BuildReport::new(vec![
            ReportEntry {
                name: "load".into(),
                outcome: Outcome::Built,
                elapsed: Duration::from_secs(3),
            },
            ReportEntry {
                name: "clean".into(),
                outcome: Outcome::Skipped(SkipReason::UpToDate),
                elapsed: Duration::ZERO,
            },
            ReportEntry {
                name: "plot".into(),
                outcome: Outcome::Errored,
                elapsed: Duration::from_secs(1),
            },
        ])
    }

    #[test]
    fn test_helpers() {
        let report = report();

        assert_eq!(report.ran().collect::<Vec<_>>(), vec!["load", "plot"]);
        assert_eq!(report.errored().collect::<Vec<_>>(), vec!["plot"]);
        assert_eq!(report.outcome("clean"), Some(Outcome::Skipped(SkipReason::UpToDate)));
        assert_eq!(report.outcome("missing"), None);
        assert_eq!(report.total(), Duration::from_secs(4));
    }

    #[test]
    fn test_table() {
        let table = report().to_string();
        let lines: Vec<_> = table.lines().collect();

        assert!(lines[0].starts_with("name  | Ran?  | Elapsed (s) | Percentage"));
        assert_eq!(lines.len(), 5);
        assert!(lines[2].starts_with("load  | true "));
        assert!(lines[2].ends_with("75.00"));
        assert!(lines[3].starts_with("clean | false"));
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(BuildReport::default().to_string().lines().count(), 2);
    }
}
