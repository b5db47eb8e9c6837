//! Talking to the grading model.

use std::{fmt, sync::Arc, time::Duration};

use genai::{
    Client, ModelIden,
    chat::{
        ChatMessage, ChatOptions, ChatRequest, ChatRole, ContentPart, ImageSource,
        MessageContent,
    },
    resolver::{AuthData, AuthResolver},
};
use tokio::time;

use super::prompt::GradingPrompt;
use crate::{data_url::parse_data_url, prelude::*};

/// Something that can send a grading prompt to a model and return its reply.
#[async_trait]
pub trait GradingDriver: fmt::Debug + Send + Sync + 'static {
    async fn grade(&self, model: &str, prompt: &GradingPrompt) -> Result<String>;
}

/// A driver using [`genai`], which speaks to Gemini, OpenAI, Anthropic and
/// others based on the model name.
pub struct GenaiDriver {
    client: Client,
    temperature: Option<f32>,
    max_completion_tokens: Option<u32>,
    timeout: Option<Duration>,
}

impl fmt::Debug for GenaiDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The client holds our API key.
        f.debug_struct("GenaiDriver")
            .field("temperature", &self.temperature)
            .field("max_completion_tokens", &self.max_completion_tokens)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GenaiDriver {
    /// Create a driver which always authenticates with `api_key`.
    pub fn new(
        api_key: String,
        temperature: Option<f32>,
        max_completion_tokens: Option<u32>,
        timeout: Option<Duration>,
    ) -> Self {
        let auth_resolver = AuthResolver::from_resolver_fn(
            move |_model_iden: ModelIden| -> Result<Option<AuthData>, genai::resolver::Error> {
                Ok(Some(AuthData::from_single(api_key.clone())))
            },
        );
        let client = Client::builder().with_auth_resolver(auth_resolver).build();
        Self {
            client,
            temperature,
            max_completion_tokens,
            timeout,
        }
    }
}

#[async_trait]
impl GradingDriver for GenaiDriver {
    #[instrument(level = "debug", skip(self, prompt))]
    async fn grade(&self, model: &str, prompt: &GradingPrompt) -> Result<String> {
        let req = to_genai_request(prompt)?;
        let opts = ChatOptions {
            temperature: self.temperature.map(f64::from),
            max_tokens: self.max_completion_tokens,
            ..ChatOptions::default()
        };

        let future = self.client.exec_chat(model, req, Some(&opts));
        let chat_res = match self.timeout {
            Some(timeout) => time::timeout(timeout, future)
                .await
                .map_err(|_| anyhow!("grading request timed out after {timeout:?}"))?,
            None => future.await,
        }
        .context("grading request failed")?;

        let content = chat_res
            .content
            .as_ref()
            .ok_or_else(|| anyhow!("No content in grading response"))?;
        let text = content.text_as_str().ok_or_else(|| {
            anyhow!("Expected text content in grading response, found: {content:?}")
        })?;
        debug!(chars = text.len(), "Grading response");
        Ok(text.to_owned())
    }
}

/// Convert our prompt to a [`genai`] request, turning `data:` URLs into image
/// parts.
fn to_genai_request(prompt: &GradingPrompt) -> Result<ChatRequest> {
    let message = if prompt.images.is_empty() {
        ChatMessage::user(prompt.text.clone())
    } else {
        let mut parts = vec![ContentPart::Text(prompt.text.clone())];
        for image in &prompt.images {
            let (mime_type, data) = parse_data_url(image)
                .ok_or_else(|| anyhow!("expected a base64 data: URL for image"))?;
            parts.push(ContentPart::Image {
                content_type: mime_type.to_owned(),
                source: ImageSource::Base64(Arc::from(data)),
            });
        }
        ChatMessage {
            role: ChatRole::User,
            content: MessageContent::Parts(parts),
            options: None,
        }
    };
    Ok(ChatRequest {
        system: prompt.system.clone(),
        messages: vec![message],
        ..ChatRequest::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_url::data_url;

    #[test]
    fn text_only_prompt_is_a_plain_user_message() {
        let req = to_genai_request(&GradingPrompt {
            system: Some("sys".to_owned()),
            text: "grade this".to_owned(),
            images: vec![],
        })
        .unwrap();
        assert_eq!(req.system.as_deref(), Some("sys"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].content.text_as_str(), Some("grade this"));
    }

    #[test]
    fn images_become_parts() {
        let req = to_genai_request(&GradingPrompt {
            system: None,
            text: "compare".to_owned(),
            images: vec![data_url("image/png", b"png")],
        })
        .unwrap();
        match &req.messages[0].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(
                    &parts[1],
                    ContentPart::Image { content_type, .. } if content_type == "image/png"
                ));
            }
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn bad_image_url_is_an_error() {
        let result = to_genai_request(&GradingPrompt {
            system: None,
            text: "compare".to_owned(),
            images: vec!["file:///tmp/key.png".to_owned()],
        });
        assert!(result.is_err());
    }

    #[test]
    fn debug_output_omits_client() {
        let driver = GenaiDriver::new("secret-key".to_owned(), Some(0.2), None, None);
        assert!(!format!("{driver:?}").contains("secret-key"));
    }
}
