//! Interactive editing of document tasks.
//!
//! [`develop`] hands a parameterized copy of a task's document to an
//! [`Editor`], waits for it to finish, and writes whatever changed back to
//! the task source.

use std::collections::BTreeMap;
use std::fs;
use std::process::Command;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::document::Document;
use crate::error::{DevelopError, SourceError};
use crate::task::{Task, TaskKind, Upstream};

/// Something a user edits a file with.
pub trait Editor {
    /// Blocks until the editing session on `path` ends.
    fn edit(&self, path: &Utf8Path) -> anyhow::Result<()>;
}

impl<F> Editor for F
where
    F: Fn(&Utf8Path) -> anyhow::Result<()>,
{
    fn edit(&self, path: &Utf8Path) -> anyhow::Result<()> {
        self(path)
    }
}

/// Runs an external program with the file path as its last argument.
#[derive(Debug, Clone)]
pub struct CommandEditor {
    program: String,
    args: Vec<String>,
}

impl CommandEditor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The editor named by `$VISUAL` or `$EDITOR`, falling back to `vi`.
    pub fn from_env() -> Self {
        let program = std::env::var("VISUAL")
            .or_else(|_| std::env::var("EDITOR"))
            .unwrap_or_else(|_| "vi".into());
        Self::new(program)
    }
}

impl Editor for CommandEditor {
    fn edit(&self, path: &Utf8Path) -> anyhow::Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .status()
            .with_context(|| format!("Couldn't start editor {}", self.program))?;

        if !status.success() {
            bail!("Editor {} exited with {status}", self.program);
        }

        Ok(())
    }
}

/// Opens the document of `task` in `editor` and persists the edits.
///
/// The editable copy carries the injected parameters and lives in a
/// temporary file next to the source, removed on every exit path. The
/// injected cell is dropped again before anything is written back, and
/// nothing is written when the document is unchanged. Returns whether the
/// source was updated.
pub fn develop(
    task: &mut Task,
    upstream: &BTreeMap<String, Upstream>,
    editor: &dyn Editor,
) -> Result<bool, DevelopError> {
    if !matches!(task.kind(), TaskKind::Document(_)) {
        return Err(DevelopError::NotADocument(task.name().to_string()));
    }

    task.render(upstream)?;

    let context = task.context(upstream);
    let source = task.source_mut();
    let original = source.document()?;
    let editable = source.inject(&context.injected_params())?;

    let dir = match source.path().and_then(Utf8Path::parent) {
        Some(dir) if !dir.as_str().is_empty() => dir.to_path_buf(),
        Some(_) => Utf8PathBuf::from("."),
        None => Utf8PathBuf::try_from(std::env::temp_dir())
            .map_err(|e| DevelopError::Io(e.into_io_error()))?,
    };

    let temp = tempfile::Builder::new()
        .prefix(".kumiki-develop-")
        .suffix(".ipynb")
        .tempfile_in(&dir)?;

    let path = Utf8Path::from_path(temp.path()).ok_or_else(|| {
        DevelopError::Io(std::io::Error::other("temporary path is not UTF-8"))
    })?;

    fs::write(path, editable.to_json().map_err(SourceError::from)?)?;

    tracing::info!(task = task.name(), "waiting for editor on {path}");
    editor.edit(path).map_err(DevelopError::Editor)?;

    let text = fs::read_to_string(path)?;
    let mut edited = Document::from_json(&text).map_err(SourceError::from)?;
    edited.strip_injected();

    if edited.normalized() == original.normalized() {
        tracing::info!(task = task.name(), "no changes");
        return Ok(false);
    }

    task.source_mut().write_document(&edited)?;
    task.render(upstream)?;

    tracing::info!(task = task.name(), "source updated");
    Ok(true)
}
