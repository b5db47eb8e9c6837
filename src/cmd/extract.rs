//! The `extract` subcommand.

use std::{fmt, sync::Arc};

use clap::Args;
use futures::StreamExt as _;
use schemars::JsonSchema;

use super::{ConfigOpts, GradingOpts, OutputCounters, RecognitionOpts, StreamOpts};
use crate::{
    async_utils::{
        BoxedStream,
        io::{read_jsonl_or_csv, write_jsonl},
    },
    evaluation::{EvaluationParams, Evaluator},
    jobs::{JobId, JobRecord, JobStatus, JobStore, Pipeline, PipelineConfig},
    prelude::*,
    raster::Upload,
    recognition::RecognitionAdapter,
    ui::{ProgressConfig, Ui},
};

/// An input record naming an image to process.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ExtractInput {
    /// An ID which will be copied to the output record.
    pub id: Value,

    /// The image to process. JSONL input may instead give a list of images
    /// which make up one document, such as the pages of an answer script.
    pub path: PagePaths,
}

/// One image path, or several.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(untagged)]
pub enum PagePaths {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl PagePaths {
    pub fn as_slice(&self) -> &[PathBuf] {
        match self {
            PagePaths::One(path) => std::slice::from_ref(path),
            PagePaths::Many(paths) => paths,
        }
    }
}

impl fmt::Display for PagePaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, path) in self.as_slice().iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", path.display())?;
        }
        Ok(())
    }
}

impl ExtractInput {
    /// Read input records from a [`Path`] or from standard input.
    pub async fn read_stream(
        ui: Ui,
        path: Option<&Path>,
    ) -> Result<BoxedStream<Result<Self>>> {
        Ok(read_jsonl_or_csv(ui, path)
            .await?
            .map(|value| {
                serde_json::from_value::<Self>(value?)
                    .context("could not parse input record")
            })
            .boxed())
    }
}

/// Did we manage to process a record?
#[derive(Clone, Copy, Debug, JsonSchema, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Ok,
    Failed,
}

/// An output record describing one extraction job.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ExtractOutput {
    /// The ID from the input record.
    pub id: Value,

    pub status: RecordStatus,

    /// Everything that went wrong, fatal or not.
    pub errors: Vec<String>,

    /// The input path or paths.
    pub path: PagePaths,

    /// The job created for this record. Also the name of the job's output
    /// directory, for use with `cleanup`.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub job_id: Option<JobId>,

    /// The final state of the job, if we got far enough to create one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobRecord>,
}

impl ExtractOutput {
    fn failed(input: ExtractInput, error: String) -> Self {
        Self {
            id: input.id,
            status: RecordStatus::Failed,
            errors: vec![error],
            path: input.path,
            job_id: None,
            job: None,
        }
    }

    fn is_failure(&self) -> bool {
        self.status == RecordStatus::Failed
    }

    fn error_count(&self) -> usize {
        self.errors.len()
    }
}

/// Options for the `extract` subcommand.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// Input JSONL or CSV file, with `id` and `path` fields. Defaults to
    /// standard input.
    pub input_path: Option<PathBuf>,

    /// Output JSONL file. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub config: ConfigOpts,

    /// Directory for per-job output files. Overrides the config file.
    #[clap(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    #[clap(flatten)]
    pub recognition: RecognitionOpts,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,

    /// Delete each job's output directory after processing. The extracted
    /// text is still included in the output records.
    #[clap(long)]
    pub discard_outputs: bool,

    /// Grade each page's text with an LLM.
    #[clap(long)]
    pub evaluate: bool,

    #[clap(flatten)]
    pub grading: GradingOpts,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    let mut config = opts.config.load().await?;
    opts.recognition.apply(&mut config.recognition);
    if let Some(output_dir) = &opts.output_dir {
        config.jobs.output_dir.clone_from(output_dir);
    }

    // Set up our grading model first, so a missing API key fails fast.
    let grading = if opts.evaluate {
        let evaluator = Evaluator::new(opts.grading.evaluation_opts(&config)).await?;
        Some((Arc::new(evaluator), opts.grading.params().await?))
    } else {
        None
    };

    let recognizer = Arc::new(RecognitionAdapter::new(&config.recognition).await?);
    let store = Arc::new(JobStore::with_ttl(config.jobs.ttl()));
    let pipeline = Pipeline::new(PipelineConfig::from(&config), recognizer, store)?;

    let input = ExtractInput::read_stream(ui.clone(), opts.input_path.as_deref()).await?;
    let input = opts.stream_opts.apply_stream_input_opts(input);

    let pb = ui.new_from_size_hint(
        &ProgressConfig {
            emoji: "✍️",
            msg: "Extracting text",
            done_msg: "Extracted text",
        },
        input.size_hint(),
    );

    let discard_outputs = opts.discard_outputs;
    let outputs = input
        .map(move |input| {
            let pipeline = pipeline.clone();
            let grading = grading.clone();
            async move {
                let input = input?;
                Ok(extract_one(&pipeline, grading.as_ref(), discard_outputs, input).await)
            }
        })
        .buffered(opts.stream_opts.job_count);
    let outputs: BoxedStream<Result<ExtractOutput>> = pb.wrap_stream(outputs).boxed();

    let (outputs, counters) = OutputCounters::wrap_stream(
        outputs,
        ExtractOutput::is_failure,
        ExtractOutput::error_count,
    );
    let json = outputs
        .map(|output| serde_json::to_value(output?).context("could not serialize output"))
        .boxed();
    write_jsonl(opts.output_path.as_deref(), json).await?;

    let counters = counters
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    counters.finish(&ui, opts.stream_opts.allowed_failure_rate)
}

/// Run one record through the pipeline, and optionally grade it.
#[instrument(level = "debug", skip_all, fields(path = %input.path))]
async fn extract_one(
    pipeline: &Pipeline,
    grading: Option<&(Arc<Evaluator>, EvaluationParams)>,
    discard_outputs: bool,
    input: ExtractInput,
) -> ExtractOutput {
    let uploads = match load_pages(pipeline, &input.path).await {
        Ok(uploads) => uploads,
        Err(err) => return ExtractOutput::failed(input, format!("{err:#}")),
    };
    let submitted = match <[Upload; 1]>::try_from(uploads) {
        Ok([upload]) => pipeline.submit(upload).await,
        Err(uploads) => pipeline.submit_pages(uploads).await,
    };
    let id = match submitted {
        Ok(id) => id,
        Err(err) => return ExtractOutput::failed(input, err.to_string()),
    };

    let mut errors = vec![];
    let mut evaluation_error = None;
    if let Some((evaluator, params)) = grading {
        match pipeline.evaluate_job(id, evaluator, params.clone()).await {
            Ok(report) => {
                if let Some(err) = report.error {
                    errors.push(format!("evaluation: {err}"));
                }
            }
            Err(err) => evaluation_error = Some(err),
        }
    }

    // Nothing else will ask about this job, so don't keep it around.
    let record = if discard_outputs {
        let record = pipeline.store().get(id);
        if let Err(err) = pipeline.cleanup(id).await {
            errors.push(format!("{err:#}"));
        }
        record
    } else {
        pipeline.store().remove(id)
    };
    let Some(record) = record else {
        return ExtractOutput::failed(input, format!("job {id} disappeared"));
    };
    let status = match record.status {
        JobStatus::Completed => {
            if let Some(err) = evaluation_error {
                errors.push(format!("evaluation: {err}"));
            }
            RecordStatus::Ok
        }
        JobStatus::Failed | JobStatus::Processing => {
            // A failed job can't be graded, and its own error says why.
            if let Some(err) = evaluation_error {
                debug!(%id, "Skipping evaluation: {err}");
            }
            errors.insert(0, record.message.clone());
            RecordStatus::Failed
        }
    };
    if let Some(result) = &record.result {
        errors.extend(result.warnings.iter().cloned());
    }
    ExtractOutput {
        id: input.id,
        status,
        errors,
        path: input.path,
        job_id: Some(id),
        job: Some(record),
    }
}

/// Read every page of a record, checking sizes before reading.
async fn load_pages(pipeline: &Pipeline, paths: &PagePaths) -> Result<Vec<Upload>> {
    let max_file_size = pipeline.upload_limits().max_file_size;
    let mut uploads = Vec::with_capacity(paths.as_slice().len());
    for path in paths.as_slice() {
        uploads.push(Upload::from_path(path, max_file_size).await?);
    }
    Ok(uploads)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{GrayImage, ImageFormat, Luma};
    use serde_json::json;

    use super::*;
    use crate::{
        config::PostprocessConfig,
        evaluation::{fake::FakeDriver, prompt::EvaluationPrompts},
        recognition::fake::FakeBackend,
    };

    fn pipeline(output_dir: &Path) -> Pipeline {
        let config = PipelineConfig {
            postprocess: PostprocessConfig {
                spell_check: false,
                ..PostprocessConfig::default()
            },
            output_dir: output_dir.to_owned(),
            ..PipelineConfig::default()
        };
        let backend = FakeBackend::returning(&[("Two plus two is four", 0.9)]);
        let recognizer = Arc::new(RecognitionAdapter::from_backend(Arc::new(backend)));
        Pipeline::new(config, recognizer, Arc::new(JobStore::new())).unwrap()
    }

    fn write_page(dir: &Path) -> PathBuf {
        let page = GrayImage::from_fn(40, 30, |x, _| Luma([if x % 10 < 2 { 0 } else { 255 }]));
        let mut bytes = Cursor::new(vec![]);
        page.write_to(&mut bytes, ImageFormat::Png).unwrap();
        let path = dir.join("page.png");
        std::fs::write(&path, bytes.into_inner()).unwrap();
        path
    }

    #[tokio::test]
    async fn extracts_and_forgets_job() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let input = ExtractInput {
            id: json!("p1"),
            path: PagePaths::One(write_page(dir.path())),
        };
        let output = extract_one(&pipeline, None, false, input).await;
        assert_eq!(output.status, RecordStatus::Ok, "{:?}", output.errors);
        assert_eq!(output.id, json!("p1"));
        let job = output.job.unwrap();
        assert_eq!(output.job_id, Some(job.id));
        let result = job.result.unwrap();
        assert_eq!(result.text, "Two plus two is four");
        assert!(result.output_files.txt.exists());
        assert!(pipeline.store().is_empty());
    }

    #[tokio::test]
    async fn discards_outputs_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir.path().join("outputs"));
        let input = ExtractInput {
            id: json!("p1"),
            path: PagePaths::One(write_page(dir.path())),
        };
        let output = extract_one(&pipeline, None, true, input).await;
        assert_eq!(output.status, RecordStatus::Ok, "{:?}", output.errors);
        let job = output.job.unwrap();
        assert_eq!(job.result.unwrap().text, "Two plus two is four");
        assert!(!dir.path().join("outputs").join(job.id.to_string()).exists());
        assert!(pipeline.store().is_empty());
    }

    #[tokio::test]
    async fn extracts_multi_page_records() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let page = write_page(dir.path());
        let input: ExtractInput = serde_json::from_value(json!({
            "id": 2,
            "path": [page, page],
        }))
        .unwrap();
        let output = extract_one(&pipeline, None, false, input).await;
        assert_eq!(output.status, RecordStatus::Ok, "{:?}", output.errors);
        assert_eq!(output.path.as_slice().len(), 2);
        assert_eq!(
            output.job.unwrap().result.unwrap().text,
            "Two plus two is four\n\nTwo plus two is four"
        );
    }

    #[tokio::test]
    async fn missing_file_fails_record() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let input = ExtractInput {
            id: json!(1),
            path: PagePaths::Many(vec![
                write_page(dir.path()),
                dir.path().join("missing.png"),
            ]),
        };
        let output = extract_one(&pipeline, None, false, input).await;
        assert!(output.is_failure());
        assert!(output.job.is_none());
        assert_eq!(output.error_count(), 1);
    }

    #[tokio::test]
    async fn attaches_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let evaluator = Arc::new(Evaluator::with_driver(
            Arc::new(FakeDriver::replying("## Total Score\n45/50\n## Strengths\n- neat")),
            EvaluationPrompts::builtin().unwrap(),
            "test-model",
        ));
        let params = EvaluationParams {
            subject: "Math".to_owned(),
            total_marks: 50,
            ..EvaluationParams::default()
        };
        let input = ExtractInput {
            id: json!(7),
            path: PagePaths::One(write_page(dir.path())),
        };
        let output = extract_one(&pipeline, Some(&(evaluator, params)), false, input).await;
        let report = output.job.unwrap().evaluation.unwrap();
        assert_eq!(report.score, 45);
        assert_eq!(report.strengths, vec!["neat".to_owned()]);
    }

    #[tokio::test]
    async fn reports_evaluation_errors_on_completed_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let evaluator = Arc::new(Evaluator::with_driver(
            Arc::new(FakeDriver::replying("## Total Score\n5/10")),
            EvaluationPrompts::builtin().unwrap(),
            "test-model",
        ));
        let params = EvaluationParams {
            total_marks: 0,
            ..EvaluationParams::default()
        };
        let input = ExtractInput {
            id: json!(8),
            path: PagePaths::One(write_page(dir.path())),
        };
        let output = extract_one(&pipeline, Some(&(evaluator, params)), false, input).await;
        assert_eq!(output.status, RecordStatus::Ok);
        assert_eq!(output.error_count(), 1, "{:?}", output.errors);
        assert!(output.errors[0].starts_with("evaluation: "), "{:?}", output.errors);
        assert!(output.job.unwrap().evaluation.is_none());
    }

    #[test]
    fn parses_csv_style_ids() {
        let input: ExtractInput =
            serde_json::from_value(json!({"id": "3", "path": "scan.jpg"})).unwrap();
        assert_eq!(input.id, json!("3"));
        assert_eq!(input.path, PagePaths::One(PathBuf::from("scan.jpg")));
        assert!(
            serde_json::from_value::<ExtractInput>(json!({"id": 1, "path": "a", "x": 2}))
                .is_err()
        );
    }
}
