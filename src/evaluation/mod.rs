//! LLM-based grading of extracted text.
//!
//! We render one of three prompts (answer key, reference image, or a general
//! assessment), send it to the grading model, and parse the free-text reply
//! into an [`EvaluationReport`]. Failures to reach the model are reported in
//! the report itself, not as errors, so a batch can keep going.

use std::{sync::Arc, time::Duration};

use schemars::JsonSchema;

use self::{
    driver::{GenaiDriver, GradingDriver},
    parse::parse_response,
    prompt::EvaluationPrompts,
};
use crate::{config::EvaluationConfig, errors::PipelineError, prelude::*, raster::Raster};

pub mod driver;
pub mod parse;
pub mod prompt;

/// How to reach the grading model.
#[derive(Clone, Debug)]
pub struct EvaluationOpts {
    pub model: String,
    pub api_key_var: String,
    pub timeout: Option<Duration>,
    pub temperature: Option<f32>,
    pub max_completion_tokens: Option<u32>,
    /// Replace the built-in prompts.
    pub prompt_path: Option<PathBuf>,
}

impl From<&EvaluationConfig> for EvaluationOpts {
    fn from(config: &EvaluationConfig) -> Self {
        Self {
            model: config.model.clone(),
            api_key_var: config.api_key_var.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            temperature: config.temperature,
            max_completion_tokens: config.max_completion_tokens,
            prompt_path: None,
        }
    }
}

/// What to grade, and against what.
#[derive(Clone, Debug, Default)]
pub struct EvaluationParams {
    pub subject: String,
    pub total_marks: u32,
    pub answer_key: Option<String>,
    pub reference_image: Option<Raster>,
}

impl EvaluationParams {
    pub fn into_request(self, extracted_text: impl Into<String>) -> EvaluationRequest {
        EvaluationRequest {
            extracted_text: extracted_text.into(),
            answer_key: self.answer_key,
            reference_image: self.reference_image,
            subject: self.subject,
            total_marks: self.total_marks,
        }
    }
}

/// A single grading request.
#[derive(Clone, Debug)]
pub struct EvaluationRequest {
    pub extracted_text: String,
    pub answer_key: Option<String>,
    pub reference_image: Option<Raster>,
    pub subject: String,
    pub total_marks: u32,
}

/// The grade, plus whatever commentary we could extract.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EvaluationReport {
    /// Did we get a response from the grading model?
    pub success: bool,

    /// Marks awarded.
    pub score: u32,

    pub total_marks: u32,

    /// `score` as a percentage, rounded to 2 decimal places.
    pub percentage: f64,

    /// Letter grade, or "N/A" if we couldn't find a score.
    pub grade: String,

    #[serde(default)]
    pub strengths: Vec<String>,

    #[serde(default)]
    pub improvements: Vec<String>,

    #[serde(default)]
    pub feedback: String,

    #[serde(default)]
    pub question_breakdown: String,

    /// The model's complete response.
    #[serde(default)]
    pub raw_text: String,

    /// What went wrong, if anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationReport {
    fn failed(total_marks: u32, error: String) -> Self {
        Self {
            success: false,
            total_marks,
            grade: "N/A".to_owned(),
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Grades text using an LLM.
#[derive(Clone, Debug)]
pub struct Evaluator {
    driver: Arc<dyn GradingDriver>,
    prompts: Arc<EvaluationPrompts>,
    model: String,
}

impl Evaluator {
    /// Create an evaluator. Fails if the API key variable is unset.
    pub async fn new(opts: EvaluationOpts) -> Result<Self, PipelineError> {
        let api_key = std::env::var(&opts.api_key_var)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                PipelineError::backend_unavailable(format!(
                    "grading model not configured; please set {}",
                    opts.api_key_var
                ))
            })?;
        let prompts = match &opts.prompt_path {
            Some(path) => EvaluationPrompts::load(path).await,
            None => EvaluationPrompts::builtin(),
        }
        .map_err(|err| PipelineError::InvalidConfig(format!("{err:#}")))?;
        let driver = GenaiDriver::new(
            api_key,
            opts.temperature,
            opts.max_completion_tokens,
            opts.timeout,
        );
        info!(model = %opts.model, "Grading model configured");
        Ok(Self::with_driver(Arc::new(driver), prompts, opts.model))
    }

    /// Create an evaluator using a specific driver.
    pub fn with_driver(
        driver: Arc<dyn GradingDriver>,
        prompts: EvaluationPrompts,
        model: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            prompts: Arc::new(prompts),
            model: model.into(),
        }
    }

    /// Grade `request`.
    ///
    /// Only bad input is an error. If the model can't be reached, we return a
    /// report with `success = false`.
    #[instrument(level = "debug", skip_all, fields(subject = %request.subject))]
    pub async fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<EvaluationReport, PipelineError> {
        if request.total_marks == 0 {
            return Err(PipelineError::invalid_input("total_marks must be positive"));
        }
        let prompt = self
            .prompts
            .render(request)
            .map_err(|err| PipelineError::invalid_input(format!("{err:#}")))?;

        info!("Sending grading request");
        match self.driver.grade(&self.model, &prompt).await {
            Ok(text) => {
                let report = parse_response(&text, request.total_marks);
                info!(
                    score = report.score,
                    total_marks = report.total_marks,
                    "Grading complete"
                );
                Ok(report)
            }
            Err(err) => {
                error!("Grading failed: {err:#}");
                Ok(EvaluationReport::failed(request.total_marks, format!("{err:#}")))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{fake::FakeDriver, *};

    fn evaluator(driver: Arc<FakeDriver>) -> Evaluator {
        Evaluator::with_driver(driver, EvaluationPrompts::builtin().unwrap(), "test-model")
    }

    fn request(total_marks: u32) -> EvaluationRequest {
        EvaluationParams {
            subject: "Science".to_owned(),
            total_marks,
            answer_key: Some("Photosynthesis makes glucose.".to_owned()),
            reference_image: None,
        }
        .into_request("Plants make sugar from light.")
    }

    #[tokio::test]
    async fn grades_with_answer_key() {
        let driver = Arc::new(FakeDriver::replying(
            "## Total Score\n9 out of 10\n\n## Strengths\nGood recall\n",
        ));
        let report = evaluator(driver.clone()).evaluate(&request(10)).await.unwrap();
        assert!(report.success);
        assert_eq!(report.score, 9);
        assert_eq!(report.grade, "A+");
        assert_eq!(report.strengths, vec!["Good recall"]);

        let prompts = driver.prompts.lock().unwrap();
        assert!(prompts[0].text.contains("Photosynthesis makes glucose."));
        assert!(prompts[0].text.contains("Plants make sugar from light."));
    }

    #[tokio::test]
    async fn zero_total_marks_is_invalid() {
        let driver = Arc::new(FakeDriver::replying("unused"));
        let err = evaluator(driver.clone()).evaluate(&request(0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert!(driver.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn driver_failure_is_reported() {
        let report = evaluator(Arc::new(FakeDriver::failing()))
            .evaluate(&request(10))
            .await
            .unwrap();
        assert!(!report.success);
        assert!(report.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn missing_api_key_is_unavailable() {
        let opts = EvaluationOpts {
            api_key_var: "HANDSCRIPT_TEST_KEY_THAT_IS_NEVER_SET".to_owned(),
            ..EvaluationOpts::from(&EvaluationConfig::default())
        };
        let err = Evaluator::new(opts).await.unwrap_err();
        assert!(matches!(err, PipelineError::BackendUnavailable(_)));
    }

    #[test]
    fn report_serializes_without_empty_error() {
        let report = parse_response("## Total Score\n5/10", 10);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["score"], 5);
        assert!(json.get("error").is_none());
    }
}
