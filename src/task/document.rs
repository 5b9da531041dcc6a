use std::fmt;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::convert::{Converter, Converters, NATIVE_EXTENSION};
use crate::document::Document;
use crate::engine::Engine;
use crate::error::{BuildError, ConfigError};
use crate::product::Product;
use crate::source::SourceContainer;
use crate::task::ExecutionContext;

/// Options for a document task.
#[derive(Clone, Default)]
pub struct DocumentOptions {
    /// Key of the product member receiving the document, required when the
    /// product has several members.
    pub primary_key: Option<String>,
    /// Converter id, inferred from the output extension when absent.
    pub converter: Option<String>,
    /// Converter registry, the built-in one when absent.
    pub converters: Option<Arc<Converters>>,
}

impl DocumentOptions {
    pub fn primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = Some(key.into());
        self
    }

    pub fn converter(mut self, id: impl Into<String>) -> Self {
        self.converter = Some(id.into());
        self
    }

    pub fn converters(mut self, converters: Arc<Converters>) -> Self {
        self.converters = Some(converters);
        self
    }
}

/// Executes a parameterized document and stores the executed copy.
///
/// The executed document is always written to the native path first,
/// whether execution succeeds or not. When the requested output is in a
/// different format, it is converted from the saved native copy afterwards.
#[derive(Clone)]
pub struct DocumentTask {
    engine: Arc<dyn Engine>,
    native: Utf8PathBuf,
    output: Utf8PathBuf,
    converter: Option<Arc<dyn Converter>>,
}

impl DocumentTask {
    pub(crate) fn new(
        source: &SourceContainer,
        product: &Product,
        engine: Arc<dyn Engine>,
        options: DocumentOptions,
    ) -> Result<Self, ConfigError> {
        if !source.format().is_document() {
            return Err(ConfigError::NotADocument(source.to_string()));
        }

        let output = match (product, &options.primary_key) {
            (Product::File(file), _) => file.path().to_path_buf(),
            (Product::Meta(meta), Some(key)) => meta.get(key)?.path().to_path_buf(),
            (Product::Meta(meta), None) if meta.len() == 1 => meta
                .members()
                .map(|(_, file)| file.path().to_path_buf())
                .next()
                .ok_or(ConfigError::EmptyMetaProduct)?,
            (Product::Meta(meta), None) => {
                return Err(ConfigError::PrimaryKeyRequired {
                    valid: meta.valid_keys(),
                });
            }
        };

        let converters = options.converters.unwrap_or_default();
        let converter = converters.resolve(options.converter.as_deref(), &output)?;

        let native = match converter {
            Some(_) => output.with_extension(NATIVE_EXTENSION),
            None => output.clone(),
        };

        Ok(Self {
            engine,
            native,
            output,
            converter,
        })
    }

    /// Where the executed document is stored.
    pub fn native(&self) -> &Utf8Path {
        &self.native
    }

    /// The requested primary output.
    pub fn output(&self) -> &Utf8Path {
        &self.output
    }

    pub(crate) fn run(
        &self,
        source: &mut SourceContainer,
        context: &ExecutionContext,
    ) -> Result<(), BuildError> {
        let mut document = source.inject(&context.injected_params())?;

        let executed = self.engine.execute(&mut document, context);

        document
            .save(&self.native)
            .map_err(|source| BuildError::Artifact {
                path: self.native.clone(),
                source,
            })?;

        let converted = match &self.converter {
            Some(converter) => self.convert(converter.as_ref()),
            None => Ok(()),
        };

        match (executed, converted) {
            (Err(e), Err(conversion)) => {
                tracing::warn!("Conversion of a failed document also failed: {conversion}");
                Err(BuildError::Execution(e))
            }
            (Err(e), Ok(())) => Err(BuildError::Execution(e)),
            (Ok(()), converted) => converted,
        }
    }

    fn convert(&self, converter: &dyn Converter) -> Result<(), BuildError> {
        let document = Document::load(&self.native)?;

        let text = converter
            .convert(&document)
            .map_err(|source| BuildError::Conversion {
                path: self.output.clone(),
                source,
            })?;

        fs::write(&self.output, text).map_err(|source| BuildError::Artifact {
            path: self.output.clone(),
            source,
        })
    }
}

impl fmt::Debug for DocumentTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentTask")
            .field("native", &self.native)
            .field("output", &self.output)
            .field("converted", &self.converter.is_some())
            .finish()
    }
}
