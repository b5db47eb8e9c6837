//! Remote recognition using AWS Textract.

use aws_sdk_textract::{
    operation::detect_document_text::DetectDocumentTextOutput,
    primitives::Blob,
    types::{BlockType, Document},
};
use leaky_bucket::RateLimiter;

use super::{Fragment, RecognitionBackend};
use crate::{
    aws::{CredentialsFile, check_credentials, load_aws_config},
    errors::PipelineError,
    prelude::*,
    rate_limit::{RateLimit, RateLimitPeriod},
    raster::Raster,
};

/// Default request rate, well under Textract's standard quota.
const DEFAULT_REQUESTS_PER_SECOND: usize = 10;

/// OCR backend wrapping the AWS Textract API.
pub struct TextractBackend {
    /// AWS Textract client.
    client: aws_sdk_textract::Client,

    /// A rate limiter to avoid hitting API limits.
    rate_limiter: RateLimiter,
}

impl TextractBackend {
    /// Create a Textract client. Credentials are resolved once, here, so that
    /// a misconfigured machine fails before any job starts.
    pub async fn new(
        credentials_path: Option<&Path>,
        rate_limit: Option<&RateLimit>,
    ) -> Result<Self, PipelineError> {
        let credentials = match credentials_path {
            Some(path) => Some(
                CredentialsFile::load(path)
                    .await
                    .map_err(|err| PipelineError::backend_unavailable(format!("{err:#}")))?,
            ),
            None => None,
        };
        let config = load_aws_config(credentials)
            .await
            .map_err(|err| PipelineError::backend_unavailable(format!("{err:#}")))?;
        check_credentials(&config)
            .await
            .map_err(|err| PipelineError::backend_unavailable(format!("{err:#}")))?;

        let rate_limiter = rate_limit
            .cloned()
            .unwrap_or_else(|| {
                RateLimit::new(DEFAULT_REQUESTS_PER_SECOND, RateLimitPeriod::Second)
            })
            .to_rate_limiter();

        Ok(Self {
            client: aws_sdk_textract::Client::new(&config),
            rate_limiter,
        })
    }
}

#[async_trait]
impl RecognitionBackend for TextractBackend {
    fn name(&self) -> &'static str {
        "textract"
    }

    fn separator(&self) -> &'static str {
        "\n"
    }

    #[instrument(level = "debug", skip_all)]
    async fn detect(&self, image: &Raster) -> Result<Vec<Fragment>> {
        // Rate limit the request.
        self.rate_limiter.acquire_one().await;

        let document = Document::builder()
            .bytes(Blob::new(image.to_png()?))
            .build();
        let response = self
            .client
            .detect_document_text()
            .document(document)
            .send()
            .await
            .map_err(|err| anyhow!("AWS Textract error: {err:?}"))?;
        trace!("Document response: {response:#?}");
        Ok(line_fragments(&response))
    }
}

/// Collect `LINE` blocks, in the order Textract returned them.
fn line_fragments(response: &DetectDocumentTextOutput) -> Vec<Fragment> {
    response
        .blocks()
        .iter()
        .filter(|block| block.block_type() == Some(&BlockType::Line))
        .filter_map(|block| {
            let text = block.text()?;
            let confidence = f64::from(block.confidence().unwrap_or_default()) / 100.0;
            Some(Fragment::new(text, confidence.clamp(0.0, 1.0)))
        })
        .collect()
}
