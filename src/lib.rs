#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod convert;
mod core;
mod develop;
mod document;
mod engine;
mod error;
mod graph;
mod pipeline;
mod product;
mod source;
mod task;
mod utils;

pub use crate::convert::{Converter, Converters, Html, Markdown, NATIVE_EXTENSION, Notebook, Script};
pub use crate::core::{Hash32, Params};
pub use crate::develop::{CommandEditor, Editor, develop};
pub use crate::document::{
    Cell, CellKind, CellMetadata, CellOutput, Document, Language, TAG_INJECTED, TAG_PARAMETERS,
};
pub use crate::engine::{CommandEngine, Engine};
pub use crate::error::*;
pub use crate::graph::{
    BuildReport, Executor, Graph, GraphConfig, OnFailure, Outcome, ReportEntry, SkipReason,
    TaskSummary,
};
pub use crate::pipeline::{ENV_FILE, Env, Meta, PIPELINE_FILE, PipelineSpec, ProductSpec, TaskSpec};
pub use crate::product::{BuildRecord, FileProduct, MetaProduct, Product, ProductPaths};
pub use crate::source::{Reload, SourceContainer, SourceFormat, Storage};
pub use crate::task::{
    Callable, DocumentOptions, DocumentTask, ExecutionContext, ShellTask, Staleness, Task, TaskKind,
    TaskStatus, Upstream,
};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
