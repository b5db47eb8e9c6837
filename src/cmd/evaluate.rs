//! The `evaluate` subcommand.

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use super::{ConfigOpts, GradingOpts};
use crate::{
    async_utils::io::create_writer,
    evaluation::Evaluator,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Options for the `evaluate` subcommand.
#[derive(Debug, Args)]
pub struct EvaluateOpts {
    /// A text file containing the student's answers, usually the output of
    /// `extract`.
    #[clap(long = "text", value_name = "FILE")]
    pub text_path: PathBuf,

    #[clap(flatten)]
    pub grading: GradingOpts,

    #[clap(flatten)]
    pub config: ConfigOpts,

    /// Where to write the JSON report. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `evaluate` subcommand.
#[instrument(level = "debug", skip_all, fields(text = %opts.text_path.display()))]
pub async fn cmd_evaluate(ui: Ui, opts: &EvaluateOpts) -> Result<()> {
    let config = opts.config.load().await?;
    let evaluator = Evaluator::new(opts.grading.evaluation_opts(&config)).await?;

    let text = tokio::fs::read_to_string(&opts.text_path)
        .await
        .with_context(|| format!("could not read {}", opts.text_path.display()))?;
    let request = opts.grading.params().await?.into_request(text);

    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🧑‍🏫",
        msg: "Grading",
        done_msg: "Graded",
    });
    let report = evaluator.evaluate(&request).await?;
    spinner.finish_using_style();

    let mut wtr = create_writer(opts.output_path.as_deref()).await?;
    let mut json =
        serde_json::to_string_pretty(&report).context("could not serialize report")?;
    json.push('\n');
    wtr.write_all(json.as_bytes())
        .await
        .context("could not write report")?;
    wtr.flush().await.context("could not flush report")?;

    if let Some(err) = &report.error {
        ui.display_message("⚠️", &format!("Grading incomplete: {err}"));
    } else {
        ui.display_message(
            "📝",
            &format!(
                "Score: {}/{} ({})",
                report.score, report.total_marks, report.grade
            ),
        );
    }
    Ok(())
}
