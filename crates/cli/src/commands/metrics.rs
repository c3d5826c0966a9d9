use opgate_core::config::LoadOptions;

use crate::commands::{block_on_command, to_data, CommandFailure, CommandResult, Session};

/// Computes, stores and prints a user's learning report.
pub fn run(options: &LoadOptions, user_id: &str) -> CommandResult {
    block_on_command("metrics", async {
        let session = Session::open(options).await?;
        let report = session.runtime.learning_report(user_id).await.map_err(CommandFailure::from)?;
        session.close().await;

        let metrics = &report.metrics;
        let message = format!(
            "{} outcomes over {} days, accuracy {:.2}, {} weak area(s)",
            metrics.sample_size,
            metrics.window_days,
            metrics.classification_accuracy,
            report.weak_areas.len()
        );
        Ok((message, to_data(&report)?))
    })
}
