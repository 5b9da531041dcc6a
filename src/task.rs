//! Tasks and their render/build lifecycle.

mod document;
mod shell;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::core::{Hash32, Params};
use crate::engine::Engine;
use crate::error::{BuildError, ConfigError, RenderError};
use crate::graph::{Outcome, SkipReason};
use crate::product::{Product, ProductPaths};
use crate::source::{SourceContainer, SourceFormat};

pub use document::{DocumentOptions, DocumentTask};
pub use shell::ShellTask;

/// Everything running code gets to know about the task it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionContext {
    pub task: String,
    pub params: Params,
    pub product: ProductPaths,
    pub upstream: BTreeMap<String, ProductPaths>,
    /// Primary artifact written by the task.
    pub output: Utf8PathBuf,
}

impl ExecutionContext {
    /// Parameters as seen by a document: the user parameters plus the
    /// `product` and `upstream` locations, which take precedence.
    pub fn injected_params(&self) -> Params {
        let mut params = self.params.clone();
        params.insert("product".into(), self.product.to_value());

        if !self.upstream.is_empty() {
            let upstream = self
                .upstream
                .iter()
                .map(|(name, paths)| (name.clone(), paths.to_value()))
                .collect();
            params.insert("upstream".into(), serde_json::Value::Object(upstream));
        }

        params
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskStatus {
    WaitingRender,
    WaitingBuild,
    Skipped,
    Executing,
    Done,
    Errored,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStatus::WaitingRender => "waiting render",
            TaskStatus::WaitingBuild => "waiting build",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Executing => "executing",
            TaskStatus::Done => "done",
            TaskStatus::Errored => "errored",
        };
        f.write_str(text)
    }
}

/// The fingerprint and location of a finished upstream product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub fingerprint: Hash32,
    pub paths: ProductPaths,
}

/// Staleness flags computed by the most recent render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Staleness {
    /// The task source changed since the last successful build.
    pub code: bool,
    /// Some upstream product changed since the last successful build.
    pub data: bool,
}

#[derive(Debug, Clone)]
struct Rendered {
    code: Hash32,
    staleness: Staleness,
}

/// Rust closure run by a [`TaskKind::Callable`] task.
pub type Callable = Arc<dyn Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync>;

/// How a task turns its source into its product.
#[derive(Clone)]
pub enum TaskKind {
    /// Runs a closure; the source text only serves as its fingerprint.
    Callable(Callable),
    /// Runs the source with `sh`.
    Shell(ShellTask),
    /// Executes the source as a parameterized document.
    Document(DocumentTask),
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Callable(_) => f.write_str("Callable"),
            TaskKind::Shell(shell) => fmt::Debug::fmt(shell, f),
            TaskKind::Document(document) => fmt::Debug::fmt(document, f),
        }
    }
}

/// A node of the build graph.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    source: SourceContainer,
    product: Product,
    params: Params,
    kind: TaskKind,
    status: TaskStatus,
    rendered: Option<Rendered>,
}

impl Task {
    fn new(name: String, source: SourceContainer, product: Product, kind: TaskKind) -> Self {
        Self {
            name,
            source,
            product,
            params: Params::new(),
            kind,
            status: TaskStatus::WaitingRender,
            rendered: None,
        }
    }

    /// A task running a Rust closure. `source` stands in for the code of
    /// the closure, so changing it marks the task as stale.
    pub fn callable<F>(
        name: impl Into<String>,
        source: impl Into<String>,
        product: impl Into<Product>,
        func: F,
    ) -> Self
    where
        F: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(
            name.into(),
            SourceContainer::inline(source, SourceFormat::Text),
            product.into(),
            TaskKind::Callable(Arc::new(func)),
        )
    }

    /// A task running its source with `sh`.
    pub fn shell(
        name: impl Into<String>,
        source: SourceContainer,
        product: impl Into<Product>,
    ) -> Self {
        Self::new(name.into(), source, product.into(), TaskKind::Shell(ShellTask))
    }

    /// A document task using the default options.
    pub fn document(
        name: impl Into<String>,
        source: SourceContainer,
        product: impl Into<Product>,
        engine: Arc<dyn Engine>,
    ) -> Result<Self, ConfigError> {
        Self::document_with(name, source, product, engine, DocumentOptions::default())
    }

    /// A document task. Converter and primary key are validated here, so
    /// misconfiguration surfaces before anything runs.
    pub fn document_with(
        name: impl Into<String>,
        source: SourceContainer,
        product: impl Into<Product>,
        engine: Arc<dyn Engine>,
        options: DocumentOptions,
    ) -> Result<Self, ConfigError> {
        let product = product.into();
        let document = DocumentTask::new(&source, &product, engine, options)?;
        Ok(Self::new(name.into(), source, product, TaskKind::Document(document)))
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &SourceContainer {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut SourceContainer {
        &mut self.source
    }

    pub fn product(&self) -> &Product {
        &self.product
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    /// Staleness computed by the most recent successful render.
    pub fn staleness(&self) -> Option<Staleness> {
        self.rendered.as_ref().map(|rendered| rendered.staleness)
    }

    /// What downstream tasks see of this task.
    pub fn as_upstream(&self) -> std::io::Result<Upstream> {
        Ok(Upstream {
            fingerprint: self.product.fingerprint()?,
            paths: self.product.paths(),
        })
    }

    /// Artifact the task's code writes first.
    pub fn output(&self) -> Utf8PathBuf {
        match &self.kind {
            TaskKind::Document(document) => document.native().to_path_buf(),
            _ => match self.product.paths() {
                ProductPaths::Single(path) => path,
                ProductPaths::Keyed(map) => map.into_values().next().unwrap_or_default(),
            },
        }
    }

    pub fn context(&self, upstream: &BTreeMap<String, Upstream>) -> ExecutionContext {
        ExecutionContext {
            task: self.name.clone(),
            params: self.params.clone(),
            product: self.product.paths(),
            upstream: upstream
                .iter()
                .map(|(name, upstream)| (name.clone(), upstream.paths.clone()))
                .collect(),
            output: self.output(),
        }
    }

    /// Refreshes the source and the build record, then recomputes
    /// staleness against the given upstream products. Runs no code.
    pub fn render(&mut self, upstream: &BTreeMap<String, Upstream>) -> Result<(), RenderError> {
        self.product.refresh();

        let code = match self.source.fingerprint() {
            Ok(code) => code,
            Err(e) => {
                self.status = TaskStatus::Errored;
                self.rendered = None;
                return Err(e.into());
            }
        };

        let fingerprints = upstream.values().map(|u| u.fingerprint).collect();
        let staleness = Staleness {
            code: self.product.is_code_stale(code),
            data: self.product.is_data_stale(&fingerprints),
        };

        tracing::debug!(
            task = %self.name,
            code = %code.short(),
            code_stale = staleness.code,
            data_stale = staleness.data,
            "rendered"
        );

        self.rendered = Some(Rendered { code, staleness });
        self.status = TaskStatus::WaitingBuild;
        Ok(())
    }

    /// Builds the product unless it is up to date.
    ///
    /// `upstream` must describe the upstream products as they are now,
    /// after their own builds finished. The build record is only replaced
    /// once the code ran successfully and the product exists.
    pub fn build(
        &mut self,
        force: bool,
        upstream: &BTreeMap<String, Upstream>,
    ) -> Result<Outcome, BuildError> {
        let code = match (&self.status, &self.rendered) {
            (TaskStatus::Errored, _) | (_, None) => return Err(BuildError::NotRendered),
            (_, Some(rendered)) => rendered.code,
        };

        let fingerprints: BTreeSet<Hash32> = upstream.values().map(|u| u.fingerprint).collect();
        let staleness = Staleness {
            code: self.product.is_code_stale(code),
            data: self.product.is_data_stale(&fingerprints),
        };

        if let Some(rendered) = &mut self.rendered {
            rendered.staleness = staleness;
        }

        if !force && !staleness.code && !staleness.data && self.product.exists() {
            tracing::debug!(task = %self.name, "up to date, skipping");
            self.status = TaskStatus::Skipped;
            return Ok(Outcome::Skipped(SkipReason::UpToDate));
        }

        self.status = TaskStatus::Executing;
        let context = self.context(upstream);

        let result = match &self.kind {
            TaskKind::Callable(func) => func(&context).map_err(BuildError::Execution),
            TaskKind::Shell(shell) => shell.run(&mut self.source, &context),
            TaskKind::Document(document) => document.run(&mut self.source, &context),
        }
        .and_then(|()| match self.product.exists() {
            true => Ok(()),
            false => Err(BuildError::MissingProduct(self.product.paths().to_string())),
        })
        .and_then(|()| Ok(self.product.record_build(code, fingerprints)?));

        match result {
            Ok(()) => {
                tracing::info!(task = %self.name, "built");
                self.status = TaskStatus::Done;
                if let Some(rendered) = &mut self.rendered {
                    rendered.staleness = Staleness {
                        code: false,
                        data: false,
                    };
                }
                Ok(Outcome::Built)
            }
            Err(e) => {
                tracing::error!(task = %self.name, "build failed: {e}");
                self.status = TaskStatus::Errored;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8Path;

    use super::*;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn writer(path: &Utf8Path, counter: Arc<AtomicUsize>) -> Task {
        Task::callable("writer", "write hello", Product::file(path), move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            fs::write(&ctx.output, "hello")?;
            Ok(())
        })
    }

    #[test]
    fn test_build_requires_render() {
        let (_guard, dir) = tempdir();
        let mut task = writer(&dir.join("out.txt"), Default::default());

        assert_eq!(task.status(), TaskStatus::WaitingRender);
        assert!(matches!(
            task.build(false, &BTreeMap::new()),
            Err(BuildError::NotRendered)
        ));
    }

    #[test]
    fn test_second_build_is_skipped() {
        let (_guard, dir) = tempdir();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut task = writer(&dir.join("out.txt"), counter.clone());
        let upstream = BTreeMap::new();

        task.render(&upstream).unwrap();
        assert_eq!(task.build(false, &upstream).unwrap(), Outcome::Built);
        assert_eq!(task.status(), TaskStatus::Done);

        task.render(&upstream).unwrap();
        assert_eq!(
            task.staleness(),
            Some(Staleness {
                code: false,
                data: false
            })
        );
        assert_eq!(
            task.build(false, &upstream).unwrap(),
            Outcome::Skipped(SkipReason::UpToDate)
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        task.render(&upstream).unwrap();
        assert_eq!(task.build(true, &upstream).unwrap(), Outcome::Built);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deleted_product_is_rebuilt() {
        let (_guard, dir) = tempdir();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut task = writer(&dir.join("out.txt"), counter.clone());
        let upstream = BTreeMap::new();

        task.render(&upstream).unwrap();
        task.build(false, &upstream).unwrap();
        fs::remove_file(dir.join("out.txt")).unwrap();

        task.render(&upstream).unwrap();
        assert_eq!(task.build(false, &upstream).unwrap(), Outcome::Built);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_changed_upstream_makes_data_stale() {
        let (_guard, dir) = tempdir();
        let mut task = writer(&dir.join("out.txt"), Default::default());

        let before = BTreeMap::from([(
            "up".to_string(),
            Upstream {
                fingerprint: Hash32::hash("a"),
                paths: ProductPaths::Single("up.txt".into()),
            },
        )]);
        task.render(&before).unwrap();
        task.build(false, &before).unwrap();

        let mut after = before.clone();
        after.get_mut("up").unwrap().fingerprint = Hash32::hash("b");
        task.render(&after).unwrap();

        assert_eq!(
            task.staleness(),
            Some(Staleness {
                code: false,
                data: true
            })
        );
    }

    #[test]
    fn test_failure_keeps_record_and_needs_render() {
        let (_guard, dir) = tempdir();
        let out = dir.join("out.txt");
        let mut task = Task::callable("broken", "fail", Product::file(&out), |_| {
            anyhow::bail!("boom")
        });
        let upstream = BTreeMap::new();

        task.render(&upstream).unwrap();
        let err = task.build(false, &upstream).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(task.status(), TaskStatus::Errored);
        assert!(crate::product::FileProduct::new(&out).record().is_none());

        assert!(matches!(
            task.build(false, &upstream),
            Err(BuildError::NotRendered)
        ));
    }

    #[test]
    fn test_missing_product_is_an_error() {
        let (_guard, dir) = tempdir();
        let mut task = Task::callable("lazy", "noop", Product::file(dir.join("out.txt")), |_| Ok(()));
        let upstream = BTreeMap::new();

        task.render(&upstream).unwrap();
        assert!(matches!(
            task.build(false, &upstream),
            Err(BuildError::MissingProduct(_))
        ));
    }

    #[test]
    fn test_injected_params() {
        let task = Task::callable("t", "", Product::file("out.txt"), |_| Ok(()))
            .with_param("x", 1);
        let upstream = BTreeMap::from([(
            "up".to_string(),
            Upstream {
                fingerprint: Hash32::MISSING,
                paths: ProductPaths::Single("up.txt".into()),
            },
        )]);

        let params = task.context(&upstream).injected_params();
        assert_eq!(params["x"], serde_json::json!(1));
        assert_eq!(params["product"], serde_json::json!("out.txt"));
        assert_eq!(params["upstream"], serde_json::json!({ "up": "up.txt" }));
    }
}
