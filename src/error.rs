use camino::Utf8PathBuf;
use thiserror::Error;

use crate::graph::BuildReport;

/// Any error surfaced by the public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Render(#[from] GraphRenderError),

    #[error(transparent)]
    Build(#[from] GraphBuildError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Develop(#[from] DevelopError),

    #[error("Task \"{name}\" failed:\n{source}")]
    Task { name: String, source: BuildError },
}

/// Misconfiguration detected while a task or graph is being assembled.
///
/// These are always raised eagerly, before anything gets executed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown converter \"{id}\", valid converters are: {valid}")]
    UnknownConverter { id: String, valid: String },

    #[error(
        "Could not determine converter for output {path}: no converter is registered for extension \"{extension}\" (registered: {valid})"
    )]
    NoConverter {
        path: Utf8PathBuf,
        extension: String,
        valid: String,
    },

    #[error("Key \"{key}\" does not exist in product, valid keys are: {valid}")]
    MissingProductKey { key: String, valid: String },

    #[error("Product has multiple keys ({valid}), a primary key selecting the document must be given")]
    PrimaryKeyRequired { valid: String },

    #[error("A meta product needs at least one member")]
    EmptyMetaProduct,

    #[error("Unsupported source extension \"{extension}\", valid extensions are: {valid}")]
    UnknownFormat { extension: String, valid: String },

    #[error("Source {0} is not a document, expected a script or a notebook")]
    NotADocument(String),

    #[error("Task \"{0}\" already exists in the graph")]
    DuplicateTask(String),

    #[error("Task \"{name}\" does not exist, loaded tasks: {valid}")]
    UnknownTask { name: String, valid: String },

    #[error("Making \"{upstream}\" an upstream dependency of \"{task}\" would create a cycle")]
    Cycle { task: String, upstream: String },

    #[error("Task \"{0}\" cannot depend on itself")]
    SelfDependency(String),

    #[error("Couldn't load source:\n{0}")]
    Source(#[from] SourceError),
}

/// Failure to read, parse or persist a task source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Couldn't read source {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't write source {path}: {source}")]
    Write {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure to load or store a build record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode build record: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't replace build record: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Failure while rendering a single task.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Couldn't fingerprint upstream product of \"{task}\": {source}")]
    Upstream {
        task: String,
        source: std::io::Error,
    },
}

/// Failure while building a single task.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Task has not been rendered")]
    NotRendered,

    #[error("Task was not rendered successfully:\n{0}")]
    Render(#[from] RenderError),

    #[error("Execution failed:\n{0:#}")]
    Execution(anyhow::Error),

    #[error("Conversion to {path} failed:\n{source:#}")]
    Conversion {
        path: Utf8PathBuf,
        source: anyhow::Error,
    },

    #[error("Task finished without producing {0}")]
    MissingProduct(String),

    #[error("Couldn't save artifact {path}: {source}")]
    Artifact {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Couldn't store build record:\n{0}")]
    Record(#[from] RecordError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Render failures collected across a whole graph.
#[derive(Debug, Error)]
#[error("{} task(s) failed to render:\n{}", .failures.len(), list(.failures))]
pub struct GraphRenderError {
    pub failures: Vec<(String, RenderError)>,
}

/// Build failures collected across a whole graph.
///
/// This is the only error a whole-graph build returns. It carries every
/// failed task, together with the report of everything that did run.
#[derive(Debug, Error)]
#[error("{} task(s) failed to build:\n{}", .failures.len(), list(.failures))]
pub struct GraphBuildError {
    pub failures: Vec<(String, BuildError)>,
    pub report: BuildReport,
}

impl GraphBuildError {
    /// Returns the failure recorded for a given task, if any.
    pub fn failure(&self, name: &str) -> Option<&BuildError> {
        self.failures
            .iter()
            .find(|(task, _)| task == name)
            .map(|(_, err)| err)
    }
}

/// Failure in the interactive develop round-trip.
#[derive(Debug, Error)]
pub enum DevelopError {
    #[error("Task \"{0}\" does not hold a document source")]
    NotADocument(String),

    #[error("Couldn't render task:\n{0}")]
    Render(#[from] RenderError),

    #[error("Couldn't prepare editable copy: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Editor failed:\n{0:#}")]
    Editor(anyhow::Error),
}

/// Failure while loading a declarative pipeline file.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Couldn't read pipeline file {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse pipeline file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No {name} found in {start} or any parent directory")]
    NotFound { name: String, start: Utf8PathBuf },

    #[error("Executor must be one of \"serial\", \"parallel\", got: \"{0}\"")]
    UnknownExecutor(String),

    #[error("Placeholder \"{{{{{0}}}}}\" is not defined in the environment")]
    UndefinedPlaceholder(String),

    #[error("Task \"{task}\" references upstream \"{upstream}\", but no such task exists. Loaded tasks: {valid}")]
    UnknownUpstream {
        task: String,
        upstream: String,
        valid: String,
    },

    #[error("Invalid upstream pattern \"{pattern}\": {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("Couldn't determine a task name for source {0}")]
    Unnamed(String),

    #[error("Task with source {0} declares no product")]
    MissingProduct(String),

    #[error("Environment file {0} must contain a JSON object")]
    InvalidEnv(Utf8PathBuf),

    #[error("Couldn't read \"{key}\" from the parameters cell of {path}: {message}")]
    InvalidParameter {
        path: String,
        key: String,
        message: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn list<E: std::fmt::Display>(failures: &[(String, E)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("- {name}: {err}"))
        .collect::<Vec<_>>()
        .join("\n")
}
