//! Command-line entry points.

use std::sync::{Arc, Mutex, PoisonError};

use clap::{Args, ValueEnum};
use futures::StreamExt as _;

use crate::{
    async_utils::BoxedStream,
    config::{AppConfig, RecognitionConfig},
    evaluation::{EvaluationOpts, EvaluationParams},
    prelude::*,
    raster::Raster,
    ui::Ui,
};

pub mod cleanup;
pub mod evaluate;
pub mod extract;
pub mod schema;

/// Options for subcommands that process a stream of records.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Only process the first N records.
    #[clap(long)]
    pub take_first: Option<usize>,

    /// How many records to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// What portion of records may fail before we report an error, between
    /// 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,
}

impl StreamOpts {
    /// Apply `--take-first`.
    pub fn apply_stream_input_opts<T>(
        &self,
        input: BoxedStream<Result<T>>,
    ) -> BoxedStream<Result<T>>
    where
        T: 'static,
    {
        match self.take_first {
            Some(n) => input.take(n).boxed(),
            None => input,
        }
    }
}

/// The `--config` option.
#[derive(Debug, Clone, Args)]
pub struct ConfigOpts {
    /// A TOML or JSON configuration file.
    #[clap(long = "config", value_name = "FILE")]
    pub config_path: Option<PathBuf>,
}

impl ConfigOpts {
    pub async fn load(&self) -> Result<AppConfig> {
        AppConfig::load(self.config_path.as_deref()).await
    }
}

/// Recognition backends, as named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Engine {
    /// Tesseract, running locally.
    LocalModel,
    /// AWS Textract.
    RemoteService,
}

/// Options which override the `[recognition]` config table.
#[derive(Debug, Clone, Args)]
pub struct RecognitionOpts {
    /// Which recognition backend to use.
    #[clap(long, value_enum)]
    pub engine: Option<Engine>,

    /// A Tesseract language model to load. May be repeated.
    #[clap(long = "language", value_name = "LANG")]
    pub languages: Vec<String>,

    /// Ask for GPU acceleration.
    #[clap(long)]
    pub gpu: bool,

    /// AWS credentials file for the remote service.
    #[clap(long = "credentials", value_name = "FILE")]
    pub credentials_path: Option<PathBuf>,
}

impl RecognitionOpts {
    /// Apply our overrides to `config`.
    pub fn apply(&self, config: &mut RecognitionConfig) {
        let engine = self.engine.unwrap_or(match config {
            RecognitionConfig::LocalModel { .. } => Engine::LocalModel,
            RecognitionConfig::RemoteService { .. } => Engine::RemoteService,
        });
        match (engine, &mut *config) {
            (Engine::LocalModel, RecognitionConfig::LocalModel { languages, gpu }) => {
                if !self.languages.is_empty() {
                    *languages = self.languages.clone();
                }
                *gpu |= self.gpu;
            }
            (Engine::LocalModel, RecognitionConfig::RemoteService { .. }) => {
                let mut local = RecognitionConfig::default();
                self.apply(&mut local);
                *config = local;
            }
            (
                Engine::RemoteService,
                RecognitionConfig::RemoteService {
                    credentials_path, ..
                },
            ) => {
                if self.credentials_path.is_some() {
                    credentials_path.clone_from(&self.credentials_path);
                }
            }
            (Engine::RemoteService, RecognitionConfig::LocalModel { .. }) => {
                *config = RecognitionConfig::RemoteService {
                    credentials_path: self.credentials_path.clone(),
                    rate_limit: None,
                };
            }
        }
    }
}

/// Grading options shared by `extract --evaluate` and `evaluate`.
#[derive(Debug, Clone, Args)]
pub struct GradingOpts {
    /// The exam subject, used in the grading prompt.
    #[clap(long, default_value = "General")]
    pub subject: String,

    /// Marks available.
    #[clap(long, default_value = "100", value_parser = clap::value_parser!(u32).range(1..))]
    pub total_marks: u32,

    /// A text file with the correct answers or marking scheme.
    #[clap(long, value_name = "FILE")]
    pub answer_key: Option<PathBuf>,

    /// An image of the correct answers or marking scheme.
    #[clap(long, value_name = "FILE", conflicts_with = "answer_key")]
    pub reference_image: Option<PathBuf>,

    /// The grading model. Overrides the config file.
    #[clap(long)]
    pub model: Option<String>,

    /// A TOML or JSON file of grading prompts, replacing the built-in ones.
    #[clap(long = "prompt", value_name = "FILE")]
    pub prompt_path: Option<PathBuf>,
}

impl GradingOpts {
    /// Combine these options with the `[evaluation]` config table.
    pub fn evaluation_opts(&self, config: &AppConfig) -> EvaluationOpts {
        let mut opts = EvaluationOpts::from(&config.evaluation);
        if let Some(model) = &self.model {
            opts.model.clone_from(model);
        }
        opts.prompt_path.clone_from(&self.prompt_path);
        opts
    }

    /// Load the answer key and reference image.
    pub async fn params(&self) -> Result<EvaluationParams> {
        let answer_key = match &self.answer_key {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("could not read answer key {}", path.display()))?,
            ),
            None => None,
        };
        let reference_image = match &self.reference_image {
            Some(path) => Some(Raster::load(path).await.with_context(|| {
                format!("could not load reference image {}", path.display())
            })?),
            None => None,
        };
        Ok(EvaluationParams {
            subject: self.subject.clone(),
            total_marks: self.total_marks,
            answer_key,
            reference_image,
        })
    }
}

/// Tallies the records we've written, to decide whether a batch failed.
#[derive(Clone, Debug, Default)]
pub struct OutputCounters {
    pub total_record_count: usize,
    pub failure_count: usize,
    pub non_fatal_error_count: usize,
}

impl OutputCounters {
    /// Wrap `stream`, counting records as they pass through. `is_failure`
    /// and `error_count` inspect each record.
    pub fn wrap_stream<T>(
        stream: BoxedStream<Result<T>>,
        is_failure: fn(&T) -> bool,
        error_count: fn(&T) -> usize,
    ) -> (BoxedStream<Result<T>>, Arc<Mutex<Self>>)
    where
        T: Send + 'static,
    {
        let counters = Arc::new(Mutex::new(Self::default()));
        let shared = counters.clone();
        let stream = stream
            .map(move |record| {
                let record = record?;
                let mut counters = shared.lock().unwrap_or_else(PoisonError::into_inner);
                counters.total_record_count += 1;
                if is_failure(&record) {
                    counters.failure_count += 1;
                } else {
                    counters.non_fatal_error_count += error_count(&record);
                }
                Ok(record)
            })
            .boxed();
        (stream, counters)
    }

    /// Report our totals, failing if too many records failed.
    pub fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        if self.total_record_count == 0 {
            ui.display_message("🤷", "No records to process");
            return Ok(());
        }
        let failure_rate = self.failure_count as f32 / self.total_record_count as f32;
        if failure_rate > allowed_failure_rate {
            return Err(anyhow!(
                "{}/{} ({:.2}%) of records failed, but only {:.2}% were allowed",
                self.failure_count,
                self.total_record_count,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ));
        }
        if self.non_fatal_error_count > 0 {
            ui.display_message(
                "⚠️",
                &format!("{} non-fatal errors encountered", self.non_fatal_error_count),
            );
        }
        if self.failure_count > 0 {
            ui.display_message(
                "❌",
                &format!("{} records could not be processed", self.failure_count),
            );
        }
        Ok(())
    }
}
