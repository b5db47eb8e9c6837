//! Grading prompt templates.

use handlebars::{Handlebars, no_escape};
use schemars::JsonSchema;
use serde_json::json;

use super::EvaluationRequest;
use crate::{async_utils::io::read_json_or_toml, data_url::data_url, prelude::*};

/// Our built-in prompts.
const BUILTIN_PROMPTS: &str = include_str!("prompts.toml");

/// The three grading prompts, as Handlebars templates.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EvaluationPrompts {
    /// Optional system message.
    #[serde(default)]
    pub system: Option<String>,

    /// Used when the caller supplies a textual answer key.
    pub answer_key: String,

    /// Used when there is nothing to compare against.
    pub general: String,

    /// Used when the answer key is an image.
    pub reference_image: String,
}

impl EvaluationPrompts {
    /// Parse the prompts compiled into this binary.
    pub fn builtin() -> Result<Self> {
        toml::from_str(BUILTIN_PROMPTS).context("could not parse built-in prompts")
    }

    /// Load prompts from a TOML or JSON file.
    pub async fn load(path: &Path) -> Result<Self> {
        read_json_or_toml(path)
            .await
            .with_context(|| format!("could not load prompts from {}", path.display()))
    }

    /// Pick a template for `request` and render it.
    pub fn render(&self, request: &EvaluationRequest) -> Result<GradingPrompt> {
        let answer_key = request
            .answer_key
            .as_deref()
            .filter(|key| !key.trim().is_empty());
        let template = if request.reference_image.is_some() {
            &self.reference_image
        } else if answer_key.is_some() {
            &self.answer_key
        } else {
            &self.general
        };

        let mut handlebars = Handlebars::new();
        // These are prompts, not HTML.
        handlebars.register_escape_fn(no_escape);
        let bindings = json!({
            "subject": request.subject,
            "extracted_text": request.extracted_text,
            "answer_key": answer_key.unwrap_or_default(),
            "total_marks": request.total_marks,
        });
        let text = handlebars
            .render_template(template.trim(), &bindings)
            .context("could not render grading prompt")?;

        let images = match &request.reference_image {
            Some(image) => vec![data_url("image/png", &image.to_png()?)],
            None => vec![],
        };

        Ok(GradingPrompt {
            system: self.system.clone(),
            text,
            images,
        })
    }
}

/// A rendered prompt, ready to send.
#[derive(Clone, Debug, PartialEq)]
pub struct GradingPrompt {
    pub system: Option<String>,
    pub text: String,
    /// Images, as `data:` URLs.
    pub images: Vec<String>,
}
