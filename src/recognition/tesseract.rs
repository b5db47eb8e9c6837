//! Local recognition using the `tesseract` CLI.

use std::{collections::HashSet, fs::File, io::Write as _};

use tokio::process::Command;

use super::{Fragment, RecognitionBackend};
use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore,
    errors::PipelineError, prelude::*, raster::Raster,
};

/// OCR backend wrapping the `tesseract` CLI tool.
pub struct TesseractBackend {
    /// Language models, like `eng` or `deu`.
    languages: Vec<String>,
}

impl TesseractBackend {
    /// Make sure `tesseract` is installed with every requested language.
    pub async fn new(languages: &[String], gpu: bool) -> Result<Self, PipelineError> {
        if languages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one recognition language is required".to_owned(),
            ));
        }
        if gpu {
            warn!("Tesseract runs on the CPU; ignoring gpu = true");
        }

        let output = Command::new("tesseract")
            .arg("--list-langs")
            .output()
            .await
            .map_err(|err| {
                PipelineError::backend_unavailable(format!("cannot run tesseract: {err}"))
            })?;
        if !output.status.success() {
            return Err(PipelineError::backend_unavailable(format!(
                "tesseract --list-langs failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        // Older versions print the list to stderr.
        let listing = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let installed = parse_language_list(&listing);
        let missing = languages
            .iter()
            .filter(|lang| !installed.contains(lang.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(PipelineError::backend_unavailable(format!(
                "tesseract language models not installed: {}",
                missing.join(", ")
            )));
        }

        debug!(?languages, "Loaded tesseract");
        Ok(Self {
            languages: languages.to_vec(),
        })
    }
}

#[async_trait]
impl RecognitionBackend for TesseractBackend {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    #[instrument(level = "debug", skip_all)]
    async fn detect(&self, image: &Raster) -> Result<Vec<Fragment>> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let mut input_file =
            File::create(&input_path).context("cannot create tesseract input file")?;
        input_file
            .write_all(&image.to_png()?)
            .context("cannot write tesseract input file")?;
        input_file
            .flush()
            .context("cannot flush tesseract input file")?;

        // Run tesseract, asking for word-level TSV on stdout.
        let output = with_cpu_semaphore(|| async {
            Command::new("tesseract")
                .arg(&input_path)
                .arg("stdout")
                .arg("-l")
                .arg(self.languages.join("+"))
                .arg("tsv")
                .output()
                .await
                .context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output)?;

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse the output of `tesseract --list-langs`.
fn parse_language_list(listing: &str) -> HashSet<&str> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of available"))
        .collect()
}

/// Extract words from Tesseract's TSV output. Rows at level 5 are words;
/// a confidence of -1 marks layout rows with no text.
fn parse_tsv(tsv: &str) -> Vec<Fragment> {
    let mut fragments = vec![];
    for line in tsv.lines().skip(1) {
        let columns = line.split('\t').collect::<Vec<_>>();
        if columns.len() < 12 || columns[0] != "5" {
            continue;
        }
        let Ok(conf) = columns[10].trim().parse::<f64>() else {
            continue;
        };
        let text = columns[11].trim();
        if conf < 0.0 || text.is_empty() {
            continue;
        }
        fragments.push(Fragment::new(text, (conf / 100.0).clamp(0.0, 1.0)));
    }
    fragments
}
