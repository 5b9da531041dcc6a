//! Task sources.
//!
//! A [`SourceContainer`] wraps the code of a task, either held inline or
//! stored in a file. It is the only place where a task's code is read from
//! or written back to storage.

use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{Hash32, Params};
use crate::document::{Document, Language};
use crate::error::{ConfigError, SourceError};

/// How source code is stored and how it can be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Percent-format script, one document cell per `# %%` block.
    Script(Language),
    /// Native JSON notebook.
    Notebook,
    /// Opaque text, only ever fingerprinted.
    Text,
}

impl SourceFormat {
    const EXTENSIONS: &[&str] = &["py", "sh", "ipynb"];

    pub fn from_extension(ext: &str) -> Result<Self, ConfigError> {
        match ext {
            "ipynb" => Ok(SourceFormat::Notebook),
            ext => Language::from_extension(ext)
                .map(SourceFormat::Script)
                .ok_or_else(|| ConfigError::UnknownFormat {
                    extension: ext.to_string(),
                    valid: Self::EXTENSIONS.join(", "),
                }),
        }
    }

    pub fn from_path(path: &Utf8Path) -> Result<Self, ConfigError> {
        Self::from_extension(path.extension().unwrap_or_default())
    }

    pub fn language(self) -> Option<Language> {
        match self {
            SourceFormat::Script(language) => Some(language),
            _ => None,
        }
    }

    pub fn is_document(self) -> bool {
        !matches!(self, SourceFormat::Text)
    }

    /// Parses raw source text into a document.
    pub fn parse(self, text: &str) -> Result<Document, SourceError> {
        match self {
            SourceFormat::Script(language) => Ok(Document::from_script(text, language)),
            SourceFormat::Notebook => Ok(Document::from_json(text)?),
            SourceFormat::Text => Ok(Document::from_script(text, Language::Shell)),
        }
    }

    /// Turns a document back into raw source text of this format.
    pub fn render(self, document: &Document) -> Result<String, SourceError> {
        match self {
            SourceFormat::Notebook => {
                let mut document = document.clone();
                document.clear_outputs();
                Ok(document.to_json()?)
            }
            SourceFormat::Script(_) | SourceFormat::Text => Ok(document.to_script()),
        }
    }

    /// Fingerprint of the normalized form of `text`.
    fn fingerprint(self, text: &str) -> Result<Hash32, SourceError> {
        let normalized = match self {
            SourceFormat::Text => text
                .lines()
                .map(str::trim_end)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string(),
            format => format.parse(text)?.normalized(),
        };

        Ok(Hash32::hash(normalized))
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::Script(language) => write!(f, "{} script", language.name()),
            SourceFormat::Notebook => f.write_str("notebook"),
            SourceFormat::Text => f.write_str("text"),
        }
    }
}

/// Where the source lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    Inline(String),
    File(Utf8PathBuf),
}

/// Whether a source is re-read from storage on every access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reload {
    /// Content is captured once and only refreshed after [`SourceContainer::write`].
    #[default]
    Cached,
    /// Content is re-read from storage on every [`SourceContainer::read`].
    Live,
}

#[derive(Debug, Clone)]
struct Loaded {
    text: String,
    fingerprint: Option<Hash32>,
}

/// The source code of a task.
#[derive(Debug, Clone)]
pub struct SourceContainer {
    storage: Storage,
    format: SourceFormat,
    reload: Reload,
    loaded: Option<Loaded>,
}

impl SourceContainer {
    /// Wraps inline source text in a declared format.
    pub fn inline(text: impl Into<String>, format: SourceFormat) -> Self {
        let text = text.into();
        Self {
            storage: Storage::Inline(text.clone()),
            format,
            reload: Reload::Cached,
            loaded: Some(Loaded {
                text,
                fingerprint: None,
            }),
        }
    }

    /// References a source file, inferring the format from its extension.
    /// The file is read immediately.
    pub fn file(path: impl Into<Utf8PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let format = SourceFormat::from_path(&path)?;
        Self::file_with_format(path, format)
    }

    pub fn file_with_format(
        path: impl Into<Utf8PathBuf>,
        format: SourceFormat,
    ) -> Result<Self, ConfigError> {
        let mut source = Self {
            storage: Storage::File(path.into()),
            format,
            reload: Reload::Cached,
            loaded: None,
        };
        source.load()?;
        Ok(source)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        match &self.storage {
            Storage::File(path) => Some(path),
            Storage::Inline(_) => None,
        }
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }

    pub fn reload(&self) -> Reload {
        self.reload
    }

    /// Switches the reload mode. Switching to [`Reload::Cached`] captures the
    /// current content if nothing has been read yet.
    pub fn set_reload(&mut self, reload: Reload) -> Result<(), SourceError> {
        self.reload = reload;
        if reload == Reload::Cached && self.loaded.is_none() {
            self.load()?;
        }
        Ok(())
    }

    /// Returns the current content.
    ///
    /// With [`Reload::Live`] this always goes back to storage; otherwise the
    /// captured content is returned.
    pub fn read(&mut self) -> Result<&str, SourceError> {
        if self.reload == Reload::Live || self.loaded.is_none() {
            self.load()?;
        }

        match &self.loaded {
            Some(loaded) => Ok(&loaded.text),
            None => unreachable!("source content is loaded above"),
        }
    }

    /// The content obtained by the most recent read, without touching
    /// storage.
    pub fn content(&self) -> Option<&str> {
        self.loaded.as_ref().map(|loaded| loaded.text.as_str())
    }

    /// Deterministic hash of the normalized source.
    ///
    /// Injected parameters are not part of the stored source, so running
    /// with different parameter values never changes the fingerprint.
    pub fn fingerprint(&mut self) -> Result<Hash32, SourceError> {
        self.read()?;
        let format = self.format;

        let loaded = match &mut self.loaded {
            Some(loaded) => loaded,
            None => unreachable!("source content is loaded above"),
        };

        match loaded.fingerprint {
            Some(hash) => Ok(hash),
            None => {
                let hash = format.fingerprint(&loaded.text)?;
                loaded.fingerprint = Some(hash);
                Ok(hash)
            }
        }
    }

    /// Parses the current content into a document.
    pub fn document(&mut self) -> Result<Document, SourceError> {
        let format = self.format;
        format.parse(self.read()?)
    }

    /// Language the source is written in, taken from the format or from
    /// the document metadata.
    pub fn language(&mut self) -> Result<Language, SourceError> {
        match self.format.language() {
            Some(language) => Ok(language),
            None => Ok(self.document()?.language().unwrap_or(Language::Python)),
        }
    }

    /// Returns a parameterized copy of the source. The stored source is
    /// left untouched.
    pub fn inject(&mut self, params: &Params) -> Result<Document, SourceError> {
        let language = self.language()?;
        Ok(self.document()?.inject(params, language))
    }

    /// Persists new content to storage and drops whatever was cached.
    pub fn write(&mut self, content: &str) -> Result<(), SourceError> {
        match &mut self.storage {
            Storage::Inline(text) => *text = content.to_string(),
            Storage::File(path) => {
                fs::write(&*path, content).map_err(|source| SourceError::Write {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        tracing::debug!(source = %self, "source written");
        self.loaded = None;
        Ok(())
    }

    /// Persists a document, converting it to this source's format first.
    pub fn write_document(&mut self, document: &Document) -> Result<(), SourceError> {
        let mut document = document.clone();
        document.strip_injected();
        let text = self.format.render(&document)?;
        self.write(&text)
    }

    fn load(&mut self) -> Result<(), SourceError> {
        let text = match &self.storage {
            Storage::Inline(text) => text.clone(),
            Storage::File(path) => fs::read_to_string(path).map_err(|source| SourceError::Read {
                path: path.clone(),
                source,
            })?,
        };

        match &mut self.loaded {
            Some(loaded) if loaded.text == text => {}
            slot => {
                *slot = Some(Loaded {
                    text,
                    fingerprint: None,
                })
            }
        }

        Ok(())
    }
}

impl fmt::Display for SourceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.storage {
            Storage::File(path) => write!(f, "{path}"),
            Storage::Inline(_) => write!(f, "<inline {}>", self.format),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Utf8Path, name: &str, text: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_cached_source_is_read_once() {
        let (_guard, dir) = tempdir();
        let path = write(&dir, "nb.py", "1 + 1");

        let mut source = SourceContainer::file(&path).unwrap();
        write(&dir, "nb.py", "2 + 2");

        assert_eq!(source.read().unwrap(), "1 + 1");
    }

    #[test]
    fn test_live_source_is_reread() {
        let (_guard, dir) = tempdir();
        let path = write(&dir, "nb.py", "1 + 1");

        let mut source = SourceContainer::file(&path).unwrap();
        source.set_reload(Reload::Live).unwrap();
        let before = source.fingerprint().unwrap();

        write(&dir, "nb.py", "2 + 2");

        assert_eq!(source.read().unwrap(), "2 + 2");
        assert_ne!(source.fingerprint().unwrap(), before);
    }

    #[test]
    fn test_write_roundtrip_live() {
        let (_guard, dir) = tempdir();
        let path = write(&dir, "nb.py", "1 + 1");

        let mut source = SourceContainer::file(&path).unwrap();
        source.set_reload(Reload::Live).unwrap();
        source.write("x = 3\n").unwrap();

        assert_eq!(source.read().unwrap(), "x = 3\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "x = 3\n");
    }

    #[test]
    fn test_write_invalidates_cached_source() {
        let mut source = SourceContainer::inline("1 + 1", SourceFormat::Script(Language::Python));
        let before = source.fingerprint().unwrap();

        source.write("2 + 2").unwrap();

        assert_eq!(source.read().unwrap(), "2 + 2");
        assert_ne!(source.fingerprint().unwrap(), before);
    }

    #[test]
    fn test_fingerprint_ignores_whitespace_and_params() {
        let format = SourceFormat::Script(Language::Python);
        let mut a = SourceContainer::inline("x = 1\n", format);
        let mut b = SourceContainer::inline("\nx = 1   \r\n\n", format);
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        let mut params = Params::new();
        params.insert("x".into(), serde_json::json!(42));
        let injected = a.inject(&params).unwrap();

        assert_eq!(injected.cells.len(), 2);
        assert_eq!(a.read().unwrap(), "x = 1\n");
        assert_eq!(Hash32::hash(injected.normalized()), a.fingerprint().unwrap());
    }

    #[test]
    fn test_unknown_extension() {
        let err = SourceContainer::file("nb.txt").unwrap_err();
        assert!(err.to_string().contains("\"txt\""));
    }

    #[test]
    fn test_missing_file() {
        let err = SourceContainer::file("does/not/exist.py").unwrap_err();
        assert!(matches!(err, ConfigError::Source(SourceError::Read { .. })));
    }

    #[test]
    fn test_write_document_keeps_format() {
        let (_guard, dir) = tempdir();
        let path = write(&dir, "nb.sh", "echo 1");

        let mut source = SourceContainer::file(&path).unwrap();
        let mut document = source.document().unwrap();
        document.cells[0].source = "echo 2".into();
        source.write_document(&document).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "echo 2");
    }
}
