//! Configuration file support.
//!
//! Every table is optional. A missing file means "use the defaults", and
//! command-line options are applied on top of whatever we load here.

use std::time::Duration;

use schemars::JsonSchema;

use crate::{
    async_utils::io::read_json_or_toml, errors::PipelineError, prelude::*,
    rate_limit::RateLimit,
};

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Image normalization settings.
    pub preprocess: PreprocessConfig,

    /// Text cleanup settings.
    pub postprocess: PostprocessConfig,

    /// Which OCR backend to use, and how to configure it.
    pub recognition: RecognitionConfig,

    /// Limits on uploaded files.
    pub upload: UploadConfig,

    /// Job bookkeeping and output locations.
    pub jobs: JobsConfig,

    /// Settings for LLM-based grading.
    pub evaluation: EvaluationConfig,
}

impl AppConfig {
    /// Load our configuration from a TOML or JSON file, or use the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => read_json_or_toml::<Self>(path)
                .await
                .with_context(|| format!("could not load config {}", path.display()))?,
            None => Self::default(),
        };
        config.preprocess.validate()?;
        Ok(config)
    }
}

/// Image normalizer settings. Stages run in the order listed here.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessConfig {
    /// Convert color images to grayscale.
    pub grayscale: bool,

    /// Straighten rotated pages.
    pub deskew: bool,

    /// Apply a median filter.
    pub denoise: bool,

    /// Apply adaptive histogram equalization.
    pub enhance_contrast: bool,

    /// Median filter kernel size. Must be odd.
    pub median_blur_kernel: u32,

    /// Histogram clip limit for contrast enhancement.
    pub clahe_clip_limit: f64,

    /// Tile grid for contrast enhancement, as `[columns, rows]`.
    pub clahe_grid_size: [u32; 2],

    /// Shrink wider pages to this width before any other stage, keeping
    /// the aspect ratio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,

    /// Shrink taller pages to this height before any other stage, keeping
    /// the aspect ratio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            grayscale: true,
            deskew: true,
            denoise: true,
            enhance_contrast: true,
            median_blur_kernel: 3,
            clahe_clip_limit: 2.0,
            clahe_grid_size: [8, 8],
            max_width: None,
            max_height: None,
        }
    }
}

impl PreprocessConfig {
    /// Check for values that would make a stage fail halfway through.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.median_blur_kernel == 0 || self.median_blur_kernel % 2 == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "median_blur_kernel must be a positive odd number, got {}",
                self.median_blur_kernel
            )));
        }
        if !(self.clahe_clip_limit.is_finite() && self.clahe_clip_limit > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "clahe_clip_limit must be positive, got {}",
                self.clahe_clip_limit
            )));
        }
        if self.clahe_grid_size.contains(&0) {
            return Err(PipelineError::InvalidConfig(format!(
                "clahe_grid_size must not contain zero, got {:?}",
                self.clahe_grid_size
            )));
        }
        if self.max_width == Some(0) || self.max_height == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "max_width and max_height must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Text normalizer settings.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PostprocessConfig {
    /// Collapse runs of spaces and blank lines.
    pub remove_extra_spaces: bool,

    /// Run dictionary-based spelling correction.
    pub spell_check: bool,

    /// Warn when OCR confidence falls below this value.
    pub min_confidence: f64,

    /// Word-frequency list used for spelling correction. One word per line,
    /// optionally followed by a count.
    pub dictionary_path: Option<PathBuf>,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            remove_extra_spaces: true,
            spell_check: true,
            min_confidence: 0.5,
            dictionary_path: None,
        }
    }
}

/// Which recognition backend to use.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum RecognitionConfig {
    /// Run Tesseract locally.
    LocalModel {
        /// Tesseract language models to load.
        #[serde(default = "default_languages")]
        languages: Vec<String>,

        /// Request GPU acceleration, where available.
        #[serde(default)]
        gpu: bool,
    },

    /// Call AWS Textract.
    RemoteService {
        /// A TOML or JSON file with `access_key_id`, `secret_access_key`,
        /// `session_token` and `region`. Falls back to the standard AWS
        /// credential chain.
        #[serde(default)]
        credentials_path: Option<PathBuf>,

        /// Request rate limit, like "10/s".
        #[serde(default)]
        rate_limit: Option<RateLimit>,
    },
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self::LocalModel {
            languages: default_languages(),
            gpu: false,
        }
    }
}

impl RecognitionConfig {
    /// The name we report in job results and logs.
    pub fn engine_name(&self) -> &'static str {
        match self {
            Self::LocalModel { .. } => "local-model",
            Self::RemoteService { .. } => "remote-service",
        }
    }
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_owned()]
}

/// Upload limits.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Maximum file size, in bytes.
    pub max_file_size: u64,

    /// Allowed file extensions, including the leading dot.
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            allowed_extensions: [".jpg", ".jpeg", ".png", ".bmp", ".tiff", ".tif", ".webp"]
                .iter()
                .map(|ext| (*ext).to_owned())
                .collect(),
        }
    }
}

/// Job bookkeeping.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct JobsConfig {
    /// Directory under which each job gets its own output directory.
    pub output_dir: PathBuf,

    /// Forget finished jobs after this many seconds.
    pub ttl_secs: Option<u64>,

    /// Give up on a single OCR call after this many seconds.
    pub recognition_timeout_secs: Option<u64>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("outputs"),
            ttl_secs: None,
            recognition_timeout_secs: None,
        }
    }
}

impl JobsConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    pub fn recognition_timeout(&self) -> Option<Duration> {
        self.recognition_timeout_secs.map(Duration::from_secs)
    }
}

/// LLM grading settings.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluationConfig {
    /// The model to use. Any model supported by `genai` will work.
    pub model: String,

    /// The environment variable holding the API key.
    pub api_key_var: String,

    /// Give up on the grading request after this many seconds.
    pub timeout_secs: Option<u64>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Upper limit on response tokens.
    pub max_completion_tokens: Option<u32>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_owned(),
            api_key_var: "GEMINI_API_KEY".to_owned(),
            timeout_secs: None,
            temperature: None,
            max_completion_tokens: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.preprocess.median_blur_kernel, 3);
        assert_eq!(config.preprocess.clahe_grid_size, [8, 8]);
        assert_eq!(config.postprocess.min_confidence, 0.5);
        assert_eq!(config.upload.max_file_size, 52_428_800);
        assert_eq!(config.recognition.engine_name(), "local-model");
        assert_eq!(config.evaluation.model, "gemini-2.0-flash");
    }

    #[test]
    fn parses_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
[preprocess]
deskew = false
median_blur_kernel = 5

[recognition]
backend = "remote-service"
rate_limit = "5/s"
"#,
        )
        .unwrap();
        assert!(!config.preprocess.deskew);
        assert!(config.preprocess.grayscale);
        assert_eq!(config.preprocess.median_blur_kernel, 5);
        match config.recognition {
            RecognitionConfig::RemoteService {
                credentials_path,
                rate_limit,
            } => {
                assert!(credentials_path.is_none());
                assert_eq!(rate_limit.unwrap().to_string(), "5/s");
            }
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn local_model_defaults_to_english() {
        let config: AppConfig = toml::from_str(
            r#"
[recognition]
backend = "local-model"
gpu = true
"#,
        )
        .unwrap();
        assert_eq!(
            config.recognition,
            RecognitionConfig::LocalModel {
                languages: vec!["eng".to_owned()],
                gpu: true,
            }
        );
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<AppConfig>("[preprocess]\nblur = 3\n").is_err());
    }

    #[test]
    fn validate_rejects_even_kernel() {
        let config = PreprocessConfig {
            median_blur_kernel: 4,
            ..PreprocessConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_grid_and_bad_clip() {
        let grid = PreprocessConfig {
            clahe_grid_size: [0, 8],
            ..PreprocessConfig::default()
        };
        assert!(grid.validate().is_err());
        let clip = PreprocessConfig {
            clahe_clip_limit: 0.0,
            ..PreprocessConfig::default()
        };
        assert!(clip.validate().is_err());
        assert!(PreprocessConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_page_size_limits() {
        let config: AppConfig =
            toml::from_str("[preprocess]\nmax_width = 2000\n").unwrap();
        assert_eq!(config.preprocess.max_width, Some(2000));
        assert_eq!(config.preprocess.max_height, None);
        assert!(config.preprocess.validate().is_ok());

        let zero = PreprocessConfig {
            max_height: Some(0),
            ..PreprocessConfig::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
