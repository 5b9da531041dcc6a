//! Converters turning executed documents into other formats.

use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use camino::Utf8Path;

use crate::document::{CellKind, CellOutput, Document, Language};
use crate::error::ConfigError;

/// Extension of the native persisted document form.
pub const NATIVE_EXTENSION: &str = "ipynb";

/// Renders a document into a different representation.
pub trait Converter: Send + Sync {
    fn convert(&self, document: &Document) -> anyhow::Result<String>;
}

impl<F> Converter for F
where
    F: Fn(&Document) -> anyhow::Result<String> + Send + Sync,
{
    fn convert(&self, document: &Document) -> anyhow::Result<String> {
        self(document)
    }
}

/// Registry of converters, addressable by id or by output extension.
#[derive(Clone)]
pub struct Converters {
    by_id: BTreeMap<String, Arc<dyn Converter>>,
    by_extension: BTreeMap<String, String>,
}

impl Converters {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            by_id: BTreeMap::new(),
            by_extension: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        id: impl Into<String>,
        extensions: &[&str],
        converter: impl Converter + 'static,
    ) -> &mut Self {
        let id = id.into();
        for ext in extensions {
            self.by_extension.insert(ext.to_string(), id.clone());
        }
        self.by_id.insert(id, Arc::new(converter));
        self
    }

    fn valid_ids(&self) -> String {
        self.by_id
            .keys()
            .map(|id| format!("\"{id}\""))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Converter>, ConfigError> {
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownConverter {
                id: id.to_string(),
                valid: self.valid_ids(),
            })
    }

    /// Id of the converter registered for the extension of `path`.
    pub fn id_for(&self, path: &Utf8Path) -> Result<&str, ConfigError> {
        let extension = path.extension().unwrap_or_default();

        self.by_extension
            .get(extension)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::NoConverter {
                path: path.to_path_buf(),
                extension: extension.to_string(),
                valid: self
                    .by_extension
                    .keys()
                    .map(|ext| format!(".{ext}"))
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Picks the converter producing `output`.
    ///
    /// An explicit `id` always has to be registered. Outputs in the native
    /// document form need no conversion and resolve to `None`.
    pub fn resolve(
        &self,
        id: Option<&str>,
        output: &Utf8Path,
    ) -> Result<Option<Arc<dyn Converter>>, ConfigError> {
        let converter = match id {
            Some(id) => self.get(id)?,
            None if output.extension() == Some(NATIVE_EXTENSION) => return Ok(None),
            None => self.get(self.id_for(output)?)?,
        };

        match output.extension() {
            Some(NATIVE_EXTENSION) => Ok(None),
            _ => Ok(Some(converter)),
        }
    }
}

impl Default for Converters {
    /// Registry with the built-in converters.
    fn default() -> Self {
        let mut converters = Self::empty();
        converters
            .register("html", &["html", "htm"], Html)
            .register("markdown", &["md"], Markdown)
            .register("script", &["py", "sh"], Script)
            .register("notebook", &[NATIVE_EXTENSION], Notebook);
        converters
    }
}

impl fmt::Debug for Converters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converters")
            .field("ids", &self.by_id.keys().collect::<Vec<_>>())
            .field("extensions", &self.by_extension)
            .finish()
    }
}

fn escape_html(text: &str) -> String {
    let mut acc = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => acc.push_str("&amp;"),
            '<' => acc.push_str("&lt;"),
            '>' => acc.push_str("&gt;"),
            '"' => acc.push_str("&quot;"),
            c => acc.push(c),
        }
    }
    acc
}

/// Standalone HTML page with one block per cell.
#[derive(Debug, Clone, Copy)]
pub struct Html;

impl Converter for Html {
    fn convert(&self, document: &Document) -> anyhow::Result<String> {
        let language = document.language().unwrap_or(Language::Python);
        let mut html = String::new();

        writeln!(html, "<!DOCTYPE html>")?;
        writeln!(html, "<html>\n<head>\n<meta charset=\"utf-8\">")?;
        writeln!(html, "<style>.output {{ background: #f7f7f7; }} .error {{ color: #b00; }}</style>")?;
        writeln!(html, "</head>\n<body>")?;

        for cell in &document.cells {
            match cell.kind {
                CellKind::Markdown => {
                    writeln!(html, "<div class=\"cell markdown\">")?;
                    for paragraph in cell.source.split("\n\n").filter(|p| !p.trim().is_empty()) {
                        writeln!(html, "<p>{}</p>", escape_html(paragraph.trim()))?;
                    }
                    writeln!(html, "</div>")?;
                }
                CellKind::Code => {
                    let count = cell
                        .execution_count
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| " ".into());

                    writeln!(html, "<div class=\"cell code\">")?;
                    writeln!(
                        html,
                        "<pre class=\"source language-{}\" data-count=\"{count}\">{}</pre>",
                        language.name(),
                        escape_html(&cell.source)
                    )?;

                    for output in &cell.outputs {
                        match output {
                            CellOutput::Stream { name, text } => writeln!(
                                html,
                                "<pre class=\"output {name}\">{}</pre>",
                                escape_html(text)
                            )?,
                            CellOutput::Error {
                                ename,
                                evalue,
                                traceback,
                            } => writeln!(
                                html,
                                "<pre class=\"output error\">{}: {}\n{}</pre>",
                                escape_html(ename),
                                escape_html(evalue),
                                escape_html(&traceback.join("\n"))
                            )?,
                        }
                    }

                    writeln!(html, "</div>")?;
                }
            }
        }

        writeln!(html, "</body>\n</html>")?;
        Ok(html)
    }
}

/// Markdown with fenced code blocks and outputs.
#[derive(Debug, Clone, Copy)]
pub struct Markdown;

impl Converter for Markdown {
    fn convert(&self, document: &Document) -> anyhow::Result<String> {
        let language = document.language().unwrap_or(Language::Python);
        let mut md = String::new();

        for cell in &document.cells {
            match cell.kind {
                CellKind::Markdown => writeln!(md, "{}\n", cell.source.trim_end())?,
                CellKind::Code => {
                    writeln!(md, "```{}\n{}\n```\n", language.name(), cell.source.trim_end())?;

                    for output in &cell.outputs {
                        let text = match output {
                            CellOutput::Stream { text, .. } => text.trim_end().to_string(),
                            CellOutput::Error { ename, evalue, .. } => format!("{ename}: {evalue}"),
                        };
                        if !text.is_empty() {
                            writeln!(md, "```text\n{text}\n```\n")?;
                        }
                    }
                }
            }
        }

        Ok(md)
    }
}

/// Percent-format script, outputs dropped.
#[derive(Debug, Clone, Copy)]
pub struct Script;

impl Converter for Script {
    fn convert(&self, document: &Document) -> anyhow::Result<String> {
        Ok(document.to_script())
    }
}

/// The notebook itself, for outputs that merely want another name.
#[derive(Debug, Clone, Copy)]
pub struct Notebook;

impl Converter for Notebook {
    fn convert(&self, document: &Document) -> anyhow::Result<String> {
        Ok(document.to_json()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Cell;

    #[test]
    fn test_resolve_by_extension() {
        let converters = Converters::default();

        assert!(converters.resolve(None, Utf8Path::new("out.html")).unwrap().is_some());
        assert_eq!(converters.id_for(Utf8Path::new("out.html")).unwrap(), "html");
        assert_eq!(converters.id_for(Utf8Path::new("out.md")).unwrap(), "markdown");
        assert!(converters.resolve(None, Utf8Path::new("out.ipynb")).unwrap().is_none());
    }

    #[test]
    fn test_unknown_extension() {
        let err = Converters::default()
            .resolve(None, Utf8Path::new("out.unknown"))
            .err()
            .unwrap();

        assert!(matches!(err, ConfigError::NoConverter { .. }));
        assert!(err.to_string().contains("Could not determine converter"));
    }

    #[test]
    fn test_unknown_id() {
        let err = Converters::default()
            .resolve(Some("wrong_name"), Utf8Path::new("out.html"))
            .err()
            .unwrap();

        assert!(err.to_string().contains("\"wrong_name\""));
    }

    #[test]
    fn test_custom_converter() {
        let mut converters = Converters::empty();
        converters.register("count", &["txt"], |document: &Document| {
            Ok::<_, anyhow::Error>(document.cells.len().to_string())
        });

        let converter = converters.resolve(None, Utf8Path::new("out.txt")).unwrap().unwrap();
        let document = Document::with_cells(Language::Python, vec![Cell::code("1"), Cell::code("2")]);
        assert_eq!(converter.convert(&document).unwrap(), "2");
    }

    #[test]
    fn test_html_escapes_and_shows_outputs() {
        let mut cell = Cell::code("print('<b>')");
        cell.outputs.push(CellOutput::Stream {
            name: "stdout".into(),
            text: "<b>\n".into(),
        });
        let document = Document::with_cells(Language::Python, vec![cell]);

        let html = Html.convert(&document).unwrap();
        assert!(html.contains("print('&lt;b&gt;')"));
        assert!(html.contains("<pre class=\"output stdout\">&lt;b&gt;\n</pre>"));
    }

    #[test]
    fn test_markdown_fences_code() {
        let document = Document::with_cells(
            Language::Shell,
            vec![Cell::markdown("# Title"), Cell::code("echo 1")],
        );

        let md = Markdown.convert(&document).unwrap();
        assert!(md.starts_with("# Title\n"));
        assert!(md.contains("```sh\necho 1\n```"));
    }
}
