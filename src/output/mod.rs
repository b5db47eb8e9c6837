//! Writing extracted text to disk.

use std::ffi::OsString;

use schemars::JsonSchema;

use crate::{
    errors::{PipelineError, WithWarnings},
    prelude::*,
};

#[cfg(feature = "docx")]
mod docx;

/// The file formats we can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// UTF-8 text, `.txt`.
    PlainText,
    /// A Word document, `.docx`.
    RichDocument,
}

impl OutputFormat {
    /// The file extension for this format, without a dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::PlainText => "txt",
            OutputFormat::RichDocument => "docx",
        }
    }
}

/// Write `text` to `base_path` plus the extension for `format`, returning the
/// path actually written.
///
/// If we can't produce a `.docx` file, we write a `.txt` file instead and
/// return a warning. Only a failure to write plain text is an error.
#[instrument(level = "debug", skip(text), fields(base_path = %base_path.display()))]
pub fn write_output(
    text: &str,
    base_path: &Path,
    format: OutputFormat,
) -> Result<WithWarnings<PathBuf>, PipelineError> {
    match format {
        OutputFormat::PlainText => write_plain_text(text, base_path).map(WithWarnings::ok),
        OutputFormat::RichDocument => write_rich_document(text, base_path),
    }
}

fn write_plain_text(text: &str, base_path: &Path) -> Result<PathBuf, PipelineError> {
    let path = with_extension(base_path, OutputFormat::PlainText);
    std::fs::write(&path, text.as_bytes()).map_err(|source| {
        PipelineError::OutputWriteFailure {
            path: path.clone(),
            source,
        }
    })?;
    debug!(path = %path.display(), "Wrote plain text");
    Ok(path)
}

#[cfg(feature = "docx")]
fn write_rich_document(
    text: &str,
    base_path: &Path,
) -> Result<WithWarnings<PathBuf>, PipelineError> {
    let path = with_extension(base_path, OutputFormat::RichDocument);
    match docx::write_docx(text, &path) {
        Ok(()) => {
            debug!(path = %path.display(), "Wrote docx");
            Ok(WithWarnings::ok(path))
        }
        Err(err) => {
            // Don't leave a truncated archive lying around.
            let _ = std::fs::remove_file(&path);
            let fallback = write_plain_text(text, base_path)?;
            Ok(WithWarnings::with_warning(
                fallback,
                format!("could not write {}: {err:#}; wrote plain text instead", path.display()),
            ))
        }
    }
}

#[cfg(not(feature = "docx"))]
fn write_rich_document(
    text: &str,
    base_path: &Path,
) -> Result<WithWarnings<PathBuf>, PipelineError> {
    let fallback = write_plain_text(text, base_path)?;
    Ok(WithWarnings::with_warning(
        fallback,
        "built without docx support; wrote plain text instead",
    ))
}

/// Append an extension, keeping any dots already in the file name.
fn with_extension(base_path: &Path, format: OutputFormat) -> PathBuf {
    let mut path = OsString::from(base_path.as_os_str());
    path.push(".");
    path.push(format.extension());
    PathBuf::from(path)
}
