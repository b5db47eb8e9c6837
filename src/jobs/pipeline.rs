//! The extraction pipeline: load, normalize, recognize, clean, save.

use std::{sync::Arc, time::Instant};

use super::{ExtractionResult, JobId, JobStatus, JobStore, OutputFiles};
use crate::{
    async_utils::spawn_blocking_propagating_panics,
    config::{AppConfig, PostprocessConfig, PreprocessConfig, UploadConfig},
    errors::{PipelineError, WithWarnings},
    evaluation::{EvaluationParams, EvaluationReport, Evaluator},
    output::{OutputFormat, write_output},
    postprocess::{TextNormalizer, combine_texts},
    prelude::*,
    preprocess,
    raster::{Raster, Upload},
    recognition::RecognitionAdapter,
};

/// Base name for every job's output files.
const OUTPUT_BASENAME: &str = "extracted_text";

/// Goes between the text of consecutive pages.
const PAGE_SEPARATOR: &str = "\n\n";

/// Settings for [`Pipeline`].
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    pub preprocess: PreprocessConfig,
    pub postprocess: PostprocessConfig,
    pub upload: UploadConfig,
    pub output_dir: PathBuf,
    pub recognition_timeout: Option<std::time::Duration>,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            preprocess: config.preprocess.clone(),
            postprocess: config.postprocess.clone(),
            upload: config.upload.clone(),
            output_dir: config.jobs.output_dir.clone(),
            recognition_timeout: config.jobs.recognition_timeout(),
        }
    }
}

/// Runs uploads through every stage, recording progress in a [`JobStore`].
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    text_normalizer: TextNormalizer,
    recognizer: Arc<RecognitionAdapter>,
    store: Arc<JobStore>,
}

impl Pipeline {
    /// Build a pipeline. Fails if the preprocessing settings are invalid.
    pub fn new(
        config: PipelineConfig,
        recognizer: Arc<RecognitionAdapter>,
        store: Arc<JobStore>,
    ) -> Result<Self, PipelineError> {
        config.preprocess.validate()?;
        let text_normalizer = TextNormalizer::new(config.postprocess.clone());
        debug!(
            spell_check = text_normalizer.spell_check_enabled(),
            backend = recognizer.backend_name(),
            "Pipeline ready"
        );
        Ok(Self {
            config: Arc::new(config),
            text_normalizer,
            recognizer,
            store,
        })
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Limits applied to every upload.
    pub fn upload_limits(&self) -> &UploadConfig {
        &self.config.upload
    }

    /// Process `upload`, returning the job ID once the job has finished.
    ///
    /// Rejected uploads never become jobs. Once a job exists, any failure is
    /// recorded in the job and we still return its ID.
    pub async fn submit(&self, upload: Upload) -> Result<JobId, PipelineError> {
        self.submit_pages(vec![upload]).await
    }

    /// Like [`Self::submit`], but for several pages that make up a single
    /// document. The pages' text is joined, in order, into one result.
    #[instrument(level = "debug", skip_all, fields(pages = uploads.len()))]
    pub async fn submit_pages(&self, uploads: Vec<Upload>) -> Result<JobId, PipelineError> {
        if uploads.is_empty() {
            return Err(PipelineError::invalid_input("no pages to process"));
        }
        for upload in &uploads {
            upload.validate(&self.config.upload).map_err(|err| match err {
                PipelineError::InvalidInput(msg) => {
                    PipelineError::InvalidInput(format!("{}: {msg}", upload.filename))
                }
                other => other,
            })?;
        }
        let filename = uploads
            .iter()
            .map(|upload| upload.filename.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let id = self.store.create(&filename);
        match self.run(id, uploads).await {
            Ok(result) => self.store.complete(id, result),
            Err(err) => self.store.fail(id, &format!("{err:#}")),
        }
        Ok(id)
    }

    async fn run(&self, id: JobId, uploads: Vec<Upload>) -> Result<ExtractionResult> {
        let start = Instant::now();
        let mut warnings = vec![];
        let page_count = uploads.len();

        self.store.update_progress(id, 10, "Loading image");
        let mut images = Vec::with_capacity(page_count);
        for upload in uploads {
            let bytes = upload.bytes;
            let image =
                spawn_blocking_propagating_panics(move || Raster::decode(&bytes)).await??;
            images.push(image);
        }

        self.store.update_progress(id, 30, "Preprocessing image");
        let mut normalized = Vec::with_capacity(page_count);
        for image in images {
            let config = self.config.clone();
            let image = spawn_blocking_propagating_panics(move || {
                preprocess::normalize(image, &config.preprocess)
            })
            .await??;
            normalized.push(image);
        }

        self.store.update_progress(id, 50, "Extracting text");
        let recognized = match self.config.recognition_timeout {
            None => self.recognizer.recognize_batch(&normalized).await,
            Some(limit) => {
                let mut results = Vec::with_capacity(page_count);
                for image in &normalized {
                    results.push(self.recognizer.recognize_with_timeout(image, Some(limit)).await);
                }
                results
            }
        };
        for (idx, result) in recognized.iter().enumerate() {
            if let Some(err) = result.error() {
                warnings.push(if page_count > 1 {
                    format!("page {}: text recognition failed: {err}", idx + 1)
                } else {
                    format!("text recognition failed: {err}")
                });
            }
        }
        let confidence =
            recognized.iter().map(|result| result.confidence).sum::<f64>() / page_count as f64;
        self.store.update_progress(id, 80, "Text extracted");

        self.store.update_progress(id, 85, "Post-processing text");
        let texts = recognized
            .iter()
            .map(|result| result.text.clone())
            .collect::<Vec<_>>();
        let confidences = recognized
            .iter()
            .map(|result| result.confidence)
            .collect::<Vec<_>>();
        let pages = self
            .text_normalizer
            .clean_batch(&texts, Some(confidences.as_slice()))
            .into_iter()
            .map(|page| page.into_value(&mut warnings))
            .collect::<Vec<_>>();
        let text = combine_texts(pages.as_slice(), PAGE_SEPARATOR);

        self.store.update_progress(id, 95, "Saving results");
        let output_files = self.save(id, text.clone()).await?.into_value(&mut warnings);

        Ok(ExtractionResult {
            text,
            confidence,
            processing_time_secs: start.elapsed().as_secs_f64(),
            ocr_engine: self.recognizer.backend_name().to_owned(),
            output_files,
            warnings,
        })
    }

    /// Write both output formats to the job's directory.
    async fn save(
        &self,
        id: JobId,
        text: String,
    ) -> Result<WithWarnings<OutputFiles>> {
        let dir = job_dir(&self.config.output_dir, id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| PipelineError::OutputWriteFailure {
                path: dir.clone(),
                source,
            })?;
        let base = dir.join(OUTPUT_BASENAME);
        let files = spawn_blocking_propagating_panics(move || -> Result<_, PipelineError> {
            let mut warnings = vec![];
            let txt = write_output(&text, &base, OutputFormat::PlainText)?
                .into_value(&mut warnings);
            let docx = write_output(&text, &base, OutputFormat::RichDocument)?
                .into_value(&mut warnings);
            Ok(WithWarnings {
                value: OutputFiles { txt, docx },
                warnings,
            })
        })
        .await??;
        Ok(files)
    }

    /// Delete a job's output files and forget the job.
    pub async fn cleanup(&self, id: JobId) -> Result<()> {
        remove_job_outputs(&self.config.output_dir, id).await?;
        self.store.remove(id);
        Ok(())
    }

    /// Grade a completed job's text, storing the report in the job.
    pub async fn evaluate_job(
        &self,
        id: JobId,
        evaluator: &Evaluator,
        params: EvaluationParams,
    ) -> Result<EvaluationReport, PipelineError> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| PipelineError::invalid_input(format!("job {id} not found")))?;
        let result = match (record.status, record.result) {
            (JobStatus::Completed, Some(result)) => result,
            (status, _) => {
                return Err(PipelineError::invalid_input(format!(
                    "job {id} is {status:?}, not completed"
                )));
            }
        };
        let report = evaluator.evaluate(&params.into_request(result.text)).await?;
        self.store.set_evaluation(id, report.clone());
        Ok(report)
    }
}

fn job_dir(output_dir: &Path, id: JobId) -> PathBuf {
    output_dir.join(id.to_string())
}

/// Remove `{output_dir}/{id}`. A missing directory is not an error.
pub async fn remove_job_outputs(output_dir: &Path, id: JobId) -> Result<()> {
    let dir = job_dir(output_dir, id);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {
            info!(%id, dir = %dir.display(), "Removed job outputs");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(%id, "No outputs to remove");
            Ok(())
        }
        Err(err) => {
            Err(err).with_context(|| format!("could not remove {}", dir.display()))
        }
    }
}
