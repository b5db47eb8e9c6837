//! AWS configuration shared by AWS-based backends.

use aws_config::{BehaviorVersion, Region};
use aws_credential_types::{Credentials, provider::ProvideCredentials as _};
use schemars::JsonSchema;

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// Static AWS credentials, loaded from a TOML or JSON file.
#[derive(Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CredentialsFile {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

// Never print secrets in debug logs.
impl std::fmt::Debug for CredentialsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsFile")
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl CredentialsFile {
    pub async fn load(path: &Path) -> Result<Self> {
        read_json_or_toml(path)
            .await
            .with_context(|| format!("could not load AWS credentials from {}", path.display()))
    }
}

/// Load the user's AWS configuration using standard conventions, optionally
/// overriding credentials and region from a file.
pub async fn load_aws_config(
    credentials: Option<CredentialsFile>,
) -> Result<aws_config::SdkConfig> {
    let mut loader = aws_config::defaults(BehaviorVersion::v2025_01_17());
    if let Some(file) = credentials {
        debug!(?file, "Using AWS credentials file");
        if let Some(region) = file.region {
            loader = loader.region(Region::new(region));
        }
        loader = loader.credentials_provider(Credentials::new(
            file.access_key_id,
            file.secret_access_key,
            file.session_token,
            None,
            "handscript-credentials-file",
        ));
    }
    Ok(loader.load().await)
}

/// Make sure `config` can actually produce credentials.
pub async fn check_credentials(config: &aws_config::SdkConfig) -> Result<()> {
    let provider = config
        .credentials_provider()
        .ok_or_else(|| anyhow!("no AWS credentials provider configured"))?;
    provider
        .provide_credentials()
        .await
        .context("no AWS credentials available")?;
    Ok(())
}
