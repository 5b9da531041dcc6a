//! Block-structured documents.
//!
//! A [`Document`] is an ordered list of [`Cell`]s, each holding either code
//! or prose. Documents are persisted natively as JSON notebooks (`.ipynb`)
//! and can also be written as plain scripts in the "percent" format, where
//! each cell starts with a `# %%` marker line:
//!
//! ```text
//! # %% tags=["parameters"]
//! var = None
//!
//! # %% [markdown]
//! # Some prose
//!
//! # %%
//! print(var)
//! ```
//!
//! Text before the first marker forms a code cell of its own, so a script
//! without any markers is a single-cell document.

use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::Params;
use crate::error::SourceError;

/// Tag marking the cell which declares default parameter values.
pub const TAG_PARAMETERS: &str = "parameters";

/// Tag marking the cell holding injected parameter values.
pub const TAG_INJECTED: &str = "injected-parameters";

const MARKER: &str = "# %%";

/// Language the code cells of a document are written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    Shell,
}

impl Language {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "py" => Some(Language::Python),
            "sh" => Some(Language::Shell),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "python" | "python3" => Some(Language::Python),
            "sh" | "bash" | "shell" => Some(Language::Shell),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Shell => "sh",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::Shell => "sh",
        }
    }

    /// Renders a single parameter assignment statement.
    pub fn assignment(self, key: &str, value: &serde_json::Value) -> String {
        match self {
            Language::Python => format!("{key} = {}", python_literal(value)),
            Language::Shell => {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{key}={}", shell_quote(&text))
            }
        }
    }

    /// Statement writing `tag` on a line of its own to both stdout and
    /// stderr, used to split the output of several cells run in one process.
    pub(crate) fn marker_statement(self, tag: &str) -> String {
        match self {
            Language::Python => {
                let line = format!("\n{tag}");
                format!(
                    "print({line:?}, flush=True); print({line:?}, file=__import__(\"sys\").stderr, flush=True)"
                )
            }
            Language::Shell => {
                let tag = shell_quote(tag);
                format!("printf '\\n%s\\n' {tag}; printf '\\n%s\\n' {tag} >&2")
            }
        }
    }
}

fn python_literal(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::Null => "None".into(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(items) => {
            let items: Vec<_> = items.iter().map(python_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let items: Vec<_> = map
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}: {}",
                        Value::String(k.clone()),
                        python_literal(v)
                    )
                })
                .collect();
            format!("{{{}}}", items.join(", "))
        }
    }
}

pub(crate) fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    Markdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum CellOutput {
    Stream {
        name: String,
        #[serde(deserialize_with = "multiline")]
        text: String,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CellMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    #[serde(rename = "cell_type")]
    pub kind: CellKind,
    #[serde(deserialize_with = "multiline")]
    pub source: String,
    #[serde(default)]
    pub metadata: CellMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<CellOutput>,
}

impl Cell {
    pub fn code(source: impl Into<String>) -> Self {
        Self {
            kind: CellKind::Code,
            source: source.into(),
            metadata: CellMetadata::default(),
            execution_count: None,
            outputs: Vec::new(),
        }
    }

    pub fn markdown(source: impl Into<String>) -> Self {
        Self {
            kind: CellKind::Markdown,
            ..Self::code(source)
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.iter().any(|t| t == tag)
    }

    /// Whether the cell failed during execution.
    pub fn is_errored(&self) -> bool {
        self.outputs
            .iter()
            .any(|o| matches!(o, CellOutput::Error { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernelspec: Option<KernelSpec>,
}

/// An executable document, possibly carrying the outputs of a previous run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    #[serde(default = "nbformat")]
    pub nbformat: u32,
    #[serde(default = "nbformat_minor")]
    pub nbformat_minor: u32,
}

fn nbformat() -> u32 {
    4
}

fn nbformat_minor() -> u32 {
    5
}

impl Document {
    pub fn new(language: Language) -> Self {
        Self {
            cells: Vec::new(),
            metadata: DocumentMetadata {
                kernelspec: Some(KernelSpec {
                    name: language.name().into(),
                    language: language.name().into(),
                    display_name: language.name().into(),
                }),
            },
            nbformat: nbformat(),
            nbformat_minor: nbformat_minor(),
        }
    }

    pub fn with_cells(language: Language, cells: Vec<Cell>) -> Self {
        Self {
            cells,
            ..Self::new(language)
        }
    }

    /// Language declared in the document metadata, if any is recognized.
    pub fn language(&self) -> Option<Language> {
        self.metadata
            .kernelspec
            .as_ref()
            .and_then(|spec| Language::from_name(&spec.language))
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses a script written in the percent format.
    pub fn from_script(text: &str, language: Language) -> Self {
        let mut cells = Vec::new();
        // leading text before any marker, kept only if non-blank
        let mut current = (CellKind::Code, Vec::new(), Vec::new(), false);

        for line in text.lines() {
            if let Some(header) = line.strip_prefix(MARKER) {
                flush_cell(&mut cells, current);
                let (kind, tags) = parse_header(header);
                current = (kind, tags, Vec::new(), true);
            } else {
                current.2.push(line);
            }
        }

        flush_cell(&mut cells, current);
        Self::with_cells(language, cells)
    }

    /// Writes the document as a percent-format script.
    ///
    /// A leading untagged code cell is written without a marker, so a
    /// script with a single block survives a parse/write round-trip as-is.
    pub fn to_script(&self) -> String {
        let mut out = String::new();

        for (i, cell) in self.cells.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }

            let implicit =
                i == 0 && cell.kind == CellKind::Code && cell.metadata.tags.is_empty();

            if !implicit {
                out.push_str(MARKER);
                if cell.kind == CellKind::Markdown {
                    out.push_str(" [markdown]");
                }
                if !cell.metadata.tags.is_empty() {
                    let tags = serde_json::Value::from(cell.metadata.tags.clone());
                    out.push_str(" tags=");
                    out.push_str(&tags.to_string());
                }
                out.push('\n');
            }

            let source = cell.source.trim_matches('\n');
            match cell.kind {
                CellKind::Code => {
                    if !source.is_empty() {
                        out.push_str(source);
                        out.push('\n');
                    }
                }
                CellKind::Markdown => {
                    for line in source.lines() {
                        if line.is_empty() {
                            out.push_str("#\n");
                        } else {
                            out.push_str("# ");
                            out.push_str(line);
                            out.push('\n');
                        }
                    }
                }
            }
        }

        out
    }

    /// Returns a copy with the given parameters injected as a new code cell.
    ///
    /// The cell is placed right after the cell tagged `parameters`, or at
    /// the top when there is none. Previously injected cells are replaced.
    pub fn inject(&self, params: &Params, language: Language) -> Document {
        let mut document = self.clone();
        document.strip_injected();

        if params.is_empty() {
            return document;
        }

        let mut source = String::from("# Injected parameters");
        for (key, value) in params {
            source.push('\n');
            source.push_str(&language.assignment(key, value));
        }

        let position = document
            .cells
            .iter()
            .position(|cell| cell.has_tag(TAG_PARAMETERS))
            .map_or(0, |i| i + 1);

        document
            .cells
            .insert(position, Cell::code(source).with_tag(TAG_INJECTED));
        document
    }

    pub fn strip_injected(&mut self) {
        self.cells.retain(|cell| !cell.has_tag(TAG_INJECTED));
    }

    pub fn clear_outputs(&mut self) {
        for cell in &mut self.cells {
            cell.outputs.clear();
            cell.execution_count = None;
        }
    }

    /// Canonical text of the document's code, used for fingerprinting.
    ///
    /// Outputs, execution counts and injected parameters are ignored, as are
    /// line ending style, trailing whitespace and blank lines around cells.
    pub fn normalized(&self) -> String {
        let mut acc = String::new();

        for cell in self.cells.iter().filter(|c| !c.has_tag(TAG_INJECTED)) {
            acc.push_str(match cell.kind {
                CellKind::Code => "\u{1}code",
                CellKind::Markdown => "\u{1}markdown",
            });
            for tag in &cell.metadata.tags {
                acc.push('\u{2}');
                acc.push_str(tag);
            }
            acc.push('\n');

            let source = cell.source.replace("\r\n", "\n");
            let lines: Vec<_> = source.lines().map(str::trim_end).collect();
            let start = lines.iter().position(|l| !l.is_empty());
            let end = lines.iter().rposition(|l| !l.is_empty());
            if let (Some(start), Some(end)) = (start, end) {
                acc.push_str(&lines[start..=end].join("\n"));
                acc.push('\n');
            }
        }

        acc
    }

    /// Reads a document persisted in the native format.
    pub fn load(path: &Utf8Path) -> Result<Self, SourceError> {
        let text = fs::read_to_string(path).map_err(|source| SourceError::Read {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self::from_json(&text)?)
    }

    /// Persists the document in the native format, creating parent
    /// directories as needed.
    pub fn save(&self, path: &Utf8Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let json = self.to_json().map_err(std::io::Error::other)?;
        fs::write(path, json)
    }
}

fn parse_header(header: &str) -> (CellKind, Vec<String>) {
    let header = header.trim();
    let (kind, rest) = match header.strip_prefix("[markdown]") {
        Some(rest) => (CellKind::Markdown, rest.trim()),
        None => (CellKind::Code, header),
    };

    let tags = rest
        .strip_prefix("tags=")
        .and_then(|tags| serde_json::from_str::<Vec<String>>(tags.trim()).ok())
        .unwrap_or_default();

    (kind, tags)
}

fn flush_cell(
    cells: &mut Vec<Cell>,
    (kind, tags, lines, explicit): (CellKind, Vec<String>, Vec<&str>, bool),
) {
    if !explicit && lines.iter().all(|l| l.trim().is_empty()) {
        return;
    }

    let lines: Vec<String> = match kind {
        CellKind::Code => lines.iter().map(|l| l.to_string()).collect(),
        CellKind::Markdown => lines
            .iter()
            .map(|l| {
                l.strip_prefix("# ")
                    .or_else(|| l.strip_prefix('#'))
                    .unwrap_or(l)
                    .to_string()
            })
            .collect(),
    };

    let source = lines.join("\n").trim_matches('\n').to_string();
    let mut cell = match kind {
        CellKind::Code => Cell::code(source),
        CellKind::Markdown => Cell::markdown(source),
    };
    cell.metadata.tags = tags;
    cells.push(cell);
}

/// Accepts either a single string or a list of lines, as notebook files
/// written by different tools do both.
fn multiline<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Text {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Text::deserialize(deserializer)? {
        Text::One(text) => text,
        Text::Many(lines) => lines.concat(),
    })
}
