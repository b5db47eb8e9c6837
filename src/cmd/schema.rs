//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use super::extract::{ExtractInput, ExtractOutput};
use crate::{
    async_utils::io::create_writer, config::AppConfig,
    evaluation::{EvaluationReport, prompt::EvaluationPrompts},
    prelude::*,
};

/// The schemas we can print. Parsed as PascalCase, like the type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// `extract` input records.
    ExtractInput,
    /// `extract` output records.
    ExtractOutput,
    /// `evaluate` output.
    EvaluationReport,
    /// Grading prompt files, for `--prompt`.
    EvaluationPrompts,
    /// Config files, for `--config`.
    AppConfig,
}

/// Options for the `schema` subcommand.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// Where to write the schema. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(opts: &SchemaOpts) -> Result<()> {
    let schema = match opts.schema_type {
        SchemaType::ExtractInput => schema_for!(ExtractInput),
        SchemaType::ExtractOutput => schema_for!(ExtractOutput),
        SchemaType::EvaluationReport => schema_for!(EvaluationReport),
        SchemaType::EvaluationPrompts => schema_for!(EvaluationPrompts),
        SchemaType::AppConfig => schema_for!(AppConfig),
    };

    let mut wtr = create_writer(opts.output_path.as_deref()).await?;
    let mut json =
        serde_json::to_string_pretty(&schema).context("could not serialize schema")?;
    json.push('\n');
    wtr.write_all(json.as_bytes())
        .await
        .context("could not write schema")?;
    wtr.flush().await.context("could not flush schema")?;
    Ok(())
}
