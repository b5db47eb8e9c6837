//! The `cleanup` subcommand.

use clap::Args;

use super::ConfigOpts;
use crate::{
    jobs::{JobId, remove_job_outputs},
    prelude::*,
    ui::Ui,
};

/// Options for the `cleanup` subcommand.
#[derive(Debug, Args)]
pub struct CleanupOpts {
    /// Jobs whose output files should be deleted.
    #[clap(value_name = "JOB_ID", required = true)]
    pub job_ids: Vec<JobId>,

    /// Directory containing per-job output files. Overrides the config file.
    #[clap(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    #[clap(flatten)]
    pub config: ConfigOpts,
}

/// The `cleanup` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_cleanup(ui: Ui, opts: &CleanupOpts) -> Result<()> {
    let output_dir = match &opts.output_dir {
        Some(dir) => dir.clone(),
        None => opts.config.load().await?.jobs.output_dir,
    };
    for id in &opts.job_ids {
        remove_job_outputs(&output_dir, *id).await?;
    }
    ui.display_message(
        "🧹",
        &format!("Cleaned up {} job(s) in {}", opts.job_ids.len(), output_dir.display()),
    );
    Ok(())
}
