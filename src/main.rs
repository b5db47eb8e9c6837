use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod aws;
mod cmd;
mod config;
mod cpu_limit;
mod data_url;
mod errors;
mod evaluation;
mod jobs;
mod output;
mod postprocess;
mod prelude;
mod preprocess;
mod raster;
mod rate_limit;
mod recognition;
mod ui;

/// Extract text from photos of handwritten pages, and optionally grade it.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - GEMINI_API_KEY: The API key for the grading model. Another variable
    may be named in the `[evaluation]` config table.

  Standard AWS environment variables and credential files
  are used by `--engine remote-service`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Extract text from images. The input file should have `id` and `path`
    /// fields.
    Extract(cmd::extract::ExtractOpts),
    /// Grade a text file with an LLM.
    Evaluate(cmd::evaluate::EvaluateOpts),
    /// Delete the output files of finished jobs.
    Cleanup(cmd::cleanup::CleanupOpts),
    /// Print schemas for input, output and config formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Extract(opts) => opts.output_path.is_none(),
            Cmd::Evaluate(opts) => opts.output_path.is_none(),
            Cmd::Cleanup(_) => false,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Everything after logging is set up.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Progress bars would be interleaved with our output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Extract(opts) => cmd::extract::cmd_extract(ui, opts).await,
        Cmd::Evaluate(opts) => cmd::evaluate::cmd_evaluate(ui, opts).await,
        Cmd::Cleanup(opts) => cmd::cleanup::cmd_cleanup(ui, opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}
