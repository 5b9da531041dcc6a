//! Declarative pipeline files.
//!
//! A pipeline is described by a JSON file, `pipeline.json` by default:
//!
//! ```json
//! {
//!     "meta": { "hot_reload": true },
//!     "executor": "parallel",
//!     "tasks": [
//!         { "source": "load.py", "product": "{{root}}/raw.ipynb" },
//!         { "source": "clean.sh", "product": "clean.csv", "upstream": ["load"] },
//!         {
//!             "source": "plot.py",
//!             "product": { "nb": "plot.html", "data": "plot.csv" },
//!             "primary_key": "nb",
//!             "upstream": ["*"]
//!         }
//!     ]
//! }
//! ```
//!
//! Strings may contain `{{placeholders}}`, filled from an environment
//! mapping. When none is given explicitly, an `env.json` file next to the
//! pipeline file is used if present.

mod literal;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::Params;
use crate::document::{Document, Language, TAG_PARAMETERS};
use crate::engine::Engine;
use crate::error::{ConfigError, PipelineError};
use crate::graph::{Executor, Graph, GraphConfig};
use crate::product::Product;
use crate::source::{SourceContainer, SourceFormat};
use crate::task::{DocumentOptions, Task};

pub const PIPELINE_FILE: &str = "pipeline.json";
pub const ENV_FILE: &str = "env.json";

/// Values available to `{{placeholders}}`.
pub type Env = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Meta {
    /// Re-read sources on every render.
    pub hot_reload: bool,
    /// JSON file with more tasks. Their relative sources resolve against
    /// the directory of that file, their products against the pipeline
    /// root like every other product.
    pub import_tasks_from: Option<Utf8PathBuf>,
    /// Read `product` from the parameters cell of each document.
    pub extract_product: bool,
    /// Read `upstream` from the parameters cell of each document.
    pub extract_upstream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ProductSpec {
    Path(Utf8PathBuf),
    Keyed(BTreeMap<String, Utf8PathBuf>),
}

impl ProductSpec {
    fn resolve(self, root: &Utf8Path) -> Self {
        match self {
            ProductSpec::Path(path) => ProductSpec::Path(resolve(root, &path)),
            ProductSpec::Keyed(map) => ProductSpec::Keyed(
                map.into_iter()
                    .map(|(key, path)| (key, resolve(root, &path)))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub source: Utf8PathBuf,
    #[serde(default)]
    pub product: Option<ProductSpec>,
    /// Defaults to the file stem of the source.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub params: Params,
    /// Task names, `*` wildcards match any run of characters.
    #[serde(default)]
    pub upstream: Vec<String>,
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub converter: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTask {
    Source(Utf8PathBuf),
    Spec(TaskSpec),
}

impl RawTask {
    fn into_spec(self) -> TaskSpec {
        match self {
            RawTask::Spec(spec) => spec,
            RawTask::Source(source) => TaskSpec {
                source,
                product: None,
                name: None,
                params: Params::new(),
                upstream: Vec::new(),
                primary_key: None,
                converter: None,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipeline {
    #[serde(default)]
    meta: Meta,
    #[serde(default)]
    config: GraphConfig,
    #[serde(default)]
    executor: Option<String>,
    #[serde(default)]
    tasks: Vec<RawTask>,
}

/// A loaded pipeline file.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub meta: Meta,
    pub config: GraphConfig,
    pub tasks: Vec<TaskSpec>,
    root: Utf8PathBuf,
}

fn read_json(path: &Utf8Path) -> Result<Value, PipelineError> {
    let text = fs::read_to_string(path).map_err(|source| PipelineError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

fn expand_str(text: &str, env: &Env, used: &mut HashSet<String>) -> Result<String, PipelineError> {
    let mut acc = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };

        acc.push_str(&rest[..start]);
        let key = rest[start + 2..start + len].trim();

        match env.get(key) {
            Some(Value::String(value)) => acc.push_str(value),
            Some(value) => acc.push_str(&value.to_string()),
            None => return Err(PipelineError::UndefinedPlaceholder(key.to_string())),
        }

        used.insert(key.to_string());
        rest = &rest[start + len + 2..];
    }

    acc.push_str(rest);
    Ok(acc)
}

/// Replaces placeholders in every string of `value`, keys included.
fn expand(value: &mut Value, env: &Env, used: &mut HashSet<String>) -> Result<(), PipelineError> {
    match value {
        Value::String(text) => *text = expand_str(text, env, used)?,
        Value::Array(items) => {
            for item in items {
                expand(item, env, used)?;
            }
        }
        Value::Object(map) => {
            let entries = std::mem::take(map);
            for (key, mut item) in entries {
                expand(&mut item, env, used)?;
                map.insert(expand_str(&key, env, used)?, item);
            }
        }
        _ => {}
    }
    Ok(())
}

fn resolve(root: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    match path.is_absolute() {
        true => path.to_path_buf(),
        false => root.join(path),
    }
}

fn invalid(spec: &TaskSpec, key: &str, message: String) -> PipelineError {
    PipelineError::InvalidParameter {
        path: spec.source.to_string(),
        key: key.to_string(),
        message,
    }
}

fn executor(name: Option<&str>) -> Result<Executor, PipelineError> {
    match name {
        None | Some("serial") => Ok(Executor::Serial),
        Some("parallel") => Ok(Executor::Parallel { threads: None }),
        Some(other) => Err(PipelineError::UnknownExecutor(other.to_string())),
    }
}

/// Reads `key = value` from the parameters cell of a document. Values are
/// Python literals limited to what maps onto JSON, anything else is an
/// error rather than a guess.
fn extract(document: &Document, key: &str) -> Result<Option<Value>, String> {
    let Some(cell) = document.cells.iter().find(|cell| cell.has_tag(TAG_PARAMETERS)) else {
        return Ok(None);
    };

    for line in cell.source.lines() {
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name.trim() == key {
            return literal::parse(value).map(Some);
        }
    }

    Ok(None)
}

impl PipelineSpec {
    /// Loads a pipeline file, picking up an `env.json` next to it.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let env_path = path.with_file_name(ENV_FILE);

        let env = match env_path.is_file() {
            true => match read_json(&env_path)? {
                Value::Object(env) => Some(env),
                _ => return Err(PipelineError::InvalidEnv(env_path)),
            },
            false => None,
        };

        Self::load_with_env(path, env)
    }

    pub fn load_with_env(path: impl AsRef<Utf8Path>, env: Option<Env>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let root = match path.parent() {
            Some(dir) if !dir.as_str().is_empty() => dir.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };

        Self::from_value(read_json(path)?, &root, env)
    }

    /// Looks for a pipeline file in `start` and then in each parent
    /// directory.
    pub fn find(start: impl AsRef<Utf8Path>) -> Result<Self, PipelineError> {
        let start = start.as_ref();

        for dir in start.ancestors() {
            let candidate = dir.join(PIPELINE_FILE);
            if candidate.is_file() {
                tracing::debug!("found pipeline at {candidate}");
                return Self::load(candidate);
            }
        }

        Err(PipelineError::NotFound {
            name: PIPELINE_FILE.to_string(),
            start: start.to_path_buf(),
        })
    }

    /// Builds a spec from parsed JSON. Relative paths resolve against
    /// `root`, which is also available as the `{{root}}` placeholder.
    pub fn from_value(mut value: Value, root: &Utf8Path, env: Option<Env>) -> Result<Self, PipelineError> {
        let user = env.unwrap_or_default();

        let mut env = user.clone();
        env.entry("root").or_insert_with(|| Value::String(root.to_string()));
        if let Ok(cwd) = std::env::current_dir() {
            env.entry("cwd")
                .or_insert_with(|| Value::String(cwd.to_string_lossy().into_owned()));
        }

        let mut used = HashSet::new();
        expand(&mut value, &env, &mut used)?;

        let raw: RawPipeline = serde_json::from_value(value)?;

        let mut config = raw.config;
        config.hot_reload |= raw.meta.hot_reload;
        config.executor = executor(raw.executor.as_deref())?;

        let mut tasks: Vec<_> = raw
            .tasks
            .into_iter()
            .map(RawTask::into_spec)
            .map(|mut spec| {
                spec.source = resolve(root, &spec.source);
                spec
            })
            .collect();

        if let Some(import) = &raw.meta.import_tasks_from {
            let import = resolve(root, import);
            let base = import.parent().unwrap_or(root).to_path_buf();

            let mut value = read_json(&import)?;
            expand(&mut value, &env, &mut used)?;

            let imported: Vec<RawTask> = serde_json::from_value(value)?;
            tasks.extend(imported.into_iter().map(RawTask::into_spec).map(|mut spec| {
                spec.source = resolve(&base, &spec.source);
                spec
            }));
        }

        for key in user.keys().filter(|key| !used.contains(*key)) {
            tracing::warn!("Unused placeholder \"{{{{{key}}}}}\" in pipeline environment");
        }

        for spec in &mut tasks {
            spec.product = spec.product.take().map(|product| product.resolve(root));
        }

        Ok(Self {
            meta: raw.meta,
            config,
            tasks,
            root: root.to_path_buf(),
        })
    }

    /// Directory relative paths were resolved against.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn product(&self, spec: &TaskSpec, source: &mut SourceContainer) -> Result<Product, PipelineError> {
        let product = match &spec.product {
            Some(product) => product.clone(),
            None if self.meta.extract_product && source.format().is_document() => {
                let document = source.document().map_err(ConfigError::from)?;
                let value = extract(&document, "product")
                    .map_err(|message| invalid(spec, "product", message))?
                    .ok_or_else(|| PipelineError::MissingProduct(spec.source.to_string()))?;
                serde_json::from_value::<ProductSpec>(value)
                    .map_err(|e| invalid(spec, "product", e.to_string()))?
                    .resolve(&self.root)
            }
            None => return Err(PipelineError::MissingProduct(spec.source.to_string())),
        };

        Ok(match product {
            ProductSpec::Path(path) => Product::file(path),
            ProductSpec::Keyed(map) => Product::meta(map)?,
        })
    }

    fn upstream(&self, spec: &TaskSpec, source: &mut SourceContainer) -> Result<Vec<String>, PipelineError> {
        if !self.meta.extract_upstream || !source.format().is_document() {
            return Ok(spec.upstream.clone());
        }

        let document = source.document().map_err(ConfigError::from)?;
        let value = extract(&document, "upstream").map_err(|message| invalid(spec, "upstream", message))?;

        match value {
            None => Ok(spec.upstream.clone()),
            Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(name) => Ok(name),
                    other => Err(invalid(spec, "upstream", format!("expected a task name, got {other}"))),
                })
                .collect(),
            Some(other) => Err(invalid(spec, "upstream", format!("expected a list, got {other}"))),
        }
    }

    /// Creates every task and wires up the dependencies.
    pub fn to_graph(&self, engine: Arc<dyn Engine>) -> Result<Graph, PipelineError> {
        let mut graph = Graph::new(self.config.clone());
        let mut dependencies = Vec::with_capacity(self.tasks.len());

        for spec in &self.tasks {
            let name = match &spec.name {
                Some(name) => name.clone(),
                None => spec
                    .source
                    .file_stem()
                    .map(String::from)
                    .ok_or_else(|| PipelineError::Unnamed(spec.source.to_string()))?,
            };

            let mut source = SourceContainer::file(&spec.source)?;
            let product = self.product(spec, &mut source)?;
            let upstream = self.upstream(spec, &mut source)?;

            let task = match source.format() {
                SourceFormat::Script(Language::Shell) => {
                    Task::shell(&name, source, product)
                }
                _ => {
                    let options = DocumentOptions {
                        primary_key: spec.primary_key.clone(),
                        converter: spec.converter.clone(),
                        converters: None,
                    };
                    Task::document_with(&name, source, product, engine.clone(), options)?
                }
            };

            graph.add(task.with_params(spec.params.clone()))?;
            dependencies.push((name, upstream));
        }

        let names: Vec<String> = graph.names().map(String::from).collect();

        for (task, upstream) in dependencies {
            for pattern in upstream {
                if !pattern.contains('*') {
                    if !graph.contains(&pattern) {
                        return Err(PipelineError::UnknownUpstream {
                            task,
                            upstream: pattern,
                            valid: names.join(", "),
                        });
                    }
                    graph.depend(&task, &pattern)?;
                    continue;
                }

                let glob = glob::Pattern::new(&pattern).map_err(|source| PipelineError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })?;

                for name in names.iter().filter(|name| **name != task && glob.matches(name)) {
                    graph.depend(&task, name)?;
                }
            }
        }

        Ok(graph)
    }
}
