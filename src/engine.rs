//! Document execution.
//!
//! An [`Engine`] runs the code cells of a [`Document`] and records what they
//! produce into the document itself. The caller persists the document
//! afterwards regardless of the outcome, so whatever the engine managed to
//! record before failing ends up on disk.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, anyhow};

use crate::document::{CellKind, CellOutput, Document, Language};
use crate::task::ExecutionContext;

/// Executes parameterized documents.
pub trait Engine: Send + Sync {
    /// Runs `document` in place. Outputs, execution counts and errors must
    /// be written into the document cells even when an error is returned.
    fn execute(&self, document: &mut Document, context: &ExecutionContext) -> anyhow::Result<()>;
}

impl<F> Engine for F
where
    F: Fn(&mut Document, &ExecutionContext) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, document: &mut Document, context: &ExecutionContext) -> anyhow::Result<()> {
        self(document, context)
    }
}

/// Runs every code cell of a document in a single interpreter process.
///
/// The cells are concatenated into one program separated by marker
/// statements, which is fed to the interpreter on stdin. Python cells are
/// compiled one at a time, so a syntax error only stops the cell containing
/// it. Both output streams are then split back per cell. When the
/// interpreter exits with a failure, the last cell that started gets an
/// error output and the cells after it are left unexecuted. If it failed
/// before any cell started, the error goes to the first code cell.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    python: Vec<String>,
    shell: Vec<String>,
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self {
            python: vec!["python3".into(), "-u".into(), "-".into()],
            shell: vec!["sh".into(), "-e".into(), "-s".into()],
        }
    }
}

impl CommandEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the command line used for Python documents. The program
    /// must read its code from stdin.
    pub fn with_python<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.python = command.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the command line used for shell documents.
    pub fn with_shell<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shell = command.into_iter().map(Into::into).collect();
        self
    }

    fn command(&self, language: Language) -> &[String] {
        match language {
            Language::Python => &self.python,
            Language::Shell => &self.shell,
        }
    }
}

fn marker(index: usize) -> String {
    format!("__kumiki_cell_{index}__")
}

/// Splits a stream into per-cell chunks. Returns the chunks of every cell
/// whose marker appears, in order.
fn split_stream(stream: &str, count: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = stream;

    for index in 0..count {
        let start = format!("\n{}\n", marker(index));
        let Some(at) = rest.find(&start) else {
            break;
        };
        rest = &rest[at + start.len()..];

        let end = format!("\n{}\n", marker(index + 1));
        let chunk = match rest.find(&end) {
            Some(at) => &rest[..at],
            None => rest,
        };
        chunks.push(chunk.to_string());
    }

    chunks
}

/// The statement running one cell.
fn cell_statement(language: Language, n: usize, source: &str) -> anyhow::Result<String> {
    Ok(match language {
        Language::Python => {
            // a JSON string is a valid Python string literal
            let literal = serde_json::to_string(source)?;
            format!("exec(compile({literal}, \"<cell {}>\", \"exec\"))", n + 1)
        }
        Language::Shell => source.to_string(),
    })
}

fn error_output(language: Language, stderr: &str, status: &str) -> CellOutput {
    let last = stderr.lines().rev().find(|line| !line.trim().is_empty());

    let (ename, evalue) = match (language, last) {
        (Language::Python, Some(line)) => match line.split_once(": ") {
            Some((ename, evalue)) => (ename.trim().to_string(), evalue.to_string()),
            None => (line.trim().to_string(), String::new()),
        },
        (_, Some(line)) => ("CommandError".to_string(), line.to_string()),
        (_, None) => ("CommandError".to_string(), status.to_string()),
    };

    CellOutput::Error {
        ename,
        evalue,
        traceback: stderr.lines().map(str::to_string).collect(),
    }
}

impl Engine for CommandEngine {
    fn execute(&self, document: &mut Document, context: &ExecutionContext) -> anyhow::Result<()> {
        let language = document.language().unwrap_or(Language::Python);
        let code: Vec<usize> = document
            .cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.kind == CellKind::Code)
            .map(|(i, _)| i)
            .collect();

        let mut program = String::new();
        for (n, &index) in code.iter().enumerate() {
            program.push_str(&language.marker_statement(&marker(n)));
            program.push('\n');
            program.push_str(&cell_statement(language, n, &document.cells[index].source)?);
            program.push('\n');
        }

        let [program_name, args @ ..] = self.command(language) else {
            return Err(anyhow!("no interpreter configured for {}", language.name()));
        };

        tracing::debug!(task = %context.task, cells = code.len(), "spawning {program_name}");

        let mut child = Command::new(program_name)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Couldn't start interpreter {program_name}"))?;

        let mut stdin = child.stdin.take().context("Interpreter stdin is not piped")?;
        let writer = std::thread::spawn(move || stdin.write_all(program.as_bytes()));

        let output = child.wait_with_output()?;
        // The interpreter may exit before reading everything, a broken pipe
        // then only means the remaining cells never ran.
        let _ = writer.join();

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let out_chunks = split_stream(&stdout, code.len());
        let err_chunks = split_stream(&stderr, code.len());

        let failed = !output.status.success();
        let started = out_chunks.len().max(err_chunks.len());
        // the interpreter gave up before the first marker
        let orphaned = failed && started == 0 && !code.is_empty();
        let started = if orphaned { 1 } else { started };

        for (n, &index) in code.iter().enumerate() {
            let cell = &mut document.cells[index];
            cell.outputs.clear();
            cell.execution_count = None;

            if n >= started {
                continue;
            }

            if !orphaned {
                cell.execution_count = Some(n as u32 + 1);
            }

            let out = out_chunks.get(n).map(String::as_str).unwrap_or_default();
            let err = match orphaned {
                true => &*stderr,
                false => err_chunks.get(n).map(String::as_str).unwrap_or_default(),
            };
            let crashed = failed && n + 1 == started;

            if !out.is_empty() {
                cell.outputs.push(CellOutput::Stream {
                    name: "stdout".into(),
                    text: out.to_string(),
                });
            }

            if crashed {
                cell.outputs
                    .push(error_output(language, err, &output.status.to_string()));
            } else if !err.is_empty() {
                cell.outputs.push(CellOutput::Stream {
                    name: "stderr".into(),
                    text: err.to_string(),
                });
            }
        }

        if failed {
            let failing = code
                .get(started.saturating_sub(1))
                .and_then(|&index| document.cells[index].outputs.last());

            return Err(match failing {
                Some(CellOutput::Error { ename, evalue, .. }) => {
                    anyhow!("Cell {started} raised {ename}: {evalue}")
                }
                _ => anyhow!("Interpreter exited with {}", output.status),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Cell;
    use crate::product::ProductPaths;

    fn context() -> ExecutionContext {
        ExecutionContext {
            task: "test".into(),
            params: Default::default(),
            product: ProductPaths::Single("out.ipynb".into()),
            upstream: Default::default(),
            output: "out.ipynb".into(),
        }
    }

    #[test]
    fn test_split_stream() {
        let stream = format!(
            "\n{}\nhello\n\n{}\n\n{}\nworld",
            marker(0),
            marker(1),
            marker(2)
        );
        assert_eq!(split_stream(&stream, 3), vec!["hello\n", "", "world"]);
        assert_eq!(split_stream(&stream, 1), vec!["hello\n"]);
        assert!(split_stream("", 2).is_empty());
    }

    #[test]
    fn test_shell_cells_get_their_own_output() {
        let mut document = Document::with_cells(
            Language::Shell,
            vec![
                Cell::code("echo one"),
                Cell::markdown("prose"),
                Cell::code("echo two"),
            ],
        );

        CommandEngine::new().execute(&mut document, &context()).unwrap();

        let text = |index: usize| match &document.cells[index].outputs[..] {
            [CellOutput::Stream { text, .. }] => text.clone(),
            other => panic!("unexpected outputs {other:?}"),
        };
        assert_eq!(text(0), "one\n");
        assert_eq!(text(2), "two\n");
        assert_eq!(document.cells[0].execution_count, Some(1));
        assert_eq!(document.cells[2].execution_count, Some(2));
        assert!(document.cells[1].outputs.is_empty());
    }

    #[test]
    fn test_shell_failure_keeps_partial_outputs() {
        let mut document = Document::with_cells(
            Language::Shell,
            vec![
                Cell::code("echo before"),
                Cell::code("echo broken >&2; exit 3"),
                Cell::code("echo never"),
            ],
        );

        let err = CommandEngine::new()
            .execute(&mut document, &context())
            .unwrap_err();
        assert!(err.to_string().contains("Cell 2"));

        assert_eq!(document.cells[0].execution_count, Some(1));
        assert!(document.cells[1].is_errored());
        assert_eq!(document.cells[2].execution_count, None);
        assert!(document.cells[2].outputs.is_empty());
    }

    #[test]
    fn test_python_syntax_error_stays_in_its_cell() {
        let mut document = Document::with_cells(
            Language::Python,
            vec![Cell::code("print('first')"), Cell::code("def broken(:\n    pass")],
        );

        let err = CommandEngine::new()
            .execute(&mut document, &context())
            .unwrap_err();
        assert!(err.to_string().contains("SyntaxError"));

        assert_eq!(document.cells[0].execution_count, Some(1));
        assert!(matches!(
            &document.cells[0].outputs[..],
            [CellOutput::Stream { text, .. }] if text == "first\n"
        ));
        assert!(matches!(
            document.cells[1].outputs.last(),
            Some(CellOutput::Error { ename, .. }) if ename == "SyntaxError"
        ));
    }

    #[test]
    fn test_python_cells_share_state() {
        let mut document = Document::with_cells(
            Language::Python,
            vec![Cell::code("x = 'it\\'s'"), Cell::code("print(x)")],
        );

        CommandEngine::new().execute(&mut document, &context()).unwrap();

        assert!(matches!(
            &document.cells[1].outputs[..],
            [CellOutput::Stream { text, .. }] if text == "it's\n"
        ));
    }

    #[test]
    fn test_failure_before_any_cell_is_recorded() {
        let mut document = Document::with_cells(
            Language::Shell,
            vec![Cell::code("echo one"), Cell::code("echo two")],
        );
        let engine = CommandEngine::new().with_shell(["sh", "-c", "echo 'bad program' >&2; exit 2"]);

        assert!(engine.execute(&mut document, &context()).is_err());

        let outputs = &document.cells[0].outputs;
        assert!(matches!(
            outputs.last(),
            Some(CellOutput::Error { traceback, .. }) if traceback.iter().any(|line| line.contains("bad program"))
        ));
        assert!(document.cells[1].outputs.is_empty());
    }

    #[test]
    fn test_missing_interpreter() {
        let mut document = Document::with_cells(Language::Shell, vec![Cell::code("true")]);
        let engine = CommandEngine::new().with_shell(["kumiki-no-such-interpreter"]);

        assert!(engine.execute(&mut document, &context()).is_err());
    }
}
