pub mod commands;
pub mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use opgate_core::config::{AppConfig, LoadOptions};

use crate::commands::feedback::Behavior;
use crate::commands::process::ProcessArgs;

#[derive(Debug, Parser)]
#[command(
    name = "opgate",
    about = "Opgate operator CLI",
    long_about = "Decompose, classify, verify and gate natural-language requests, and record feedback on the resulting operations.",
    after_help = "Examples:\n  opgate process \"list files then delete temp.txt\"\n  opgate approve <operation-id>\n  opgate metrics --user alice"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to an opgate.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Classify a request without storing it")]
    Classify { request: String },
    #[command(about = "Decompose and classify a request without storing it")]
    Decompose {
        request: String,
        #[arg(long, help = "Split on plain conjunctions even for short requests")]
        force: bool,
    },
    #[command(about = "Process a request: decompose, classify, verify and gate")]
    Process {
        request: String,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long, default_value = "cli")]
        agent: String,
        #[arg(long, help = "Domain intent that seeds the classification")]
        intent: Option<String>,
        #[arg(long, help = "Intent action: view, search, status, create, update or delete")]
        action: Option<String>,
        #[arg(long)]
        force: bool,
    },
    #[command(about = "Approve an operation awaiting approval")]
    Approve {
        operation_id: String,
        #[arg(long, help = "The user changed the operation before approving")]
        modified: bool,
    },
    #[command(about = "Reject an operation awaiting approval")]
    Reject {
        operation_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    #[command(about = "Show an operation and its effective status")]
    Status { operation_id: String },
    #[command(about = "Rate an operation from 1 to 5")]
    Rate {
        operation_id: String,
        rating: u8,
        #[arg(long = "dimension", value_parser = parse_dimension, help = "Per-dimension rating as name=1..5")]
        dimensions: Vec<(String, u8)>,
        #[arg(long)]
        comment: Option<String>,
    },
    #[command(about = "Record the correct classification for an operation")]
    Correct {
        operation_id: String,
        #[arg(long)]
        destination: String,
        #[arg(long)]
        consumer: String,
        #[arg(long)]
        semantics: String,
        #[arg(long)]
        reasoning: Option<String>,
    },
    #[command(about = "Record a retry and process the request again")]
    Retry { operation_id: String },
    #[command(about = "Record that the user undid an operation")]
    Undo { operation_id: String },
    #[command(about = "Record that the user abandoned an operation")]
    Abandon { operation_id: String },
    #[command(about = "Compute learning metrics, weak areas and training pairs for a user")]
    Metrics {
        #[arg(long, default_value = "cli")]
        user: String,
    },
    #[command(about = "Apply pending database migrations")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "Validate config, model backend reachability and database connectivity")]
    Doctor {
        #[arg(long, help = "Emit human-readable lines instead of JSON")]
        human: bool,
    },
}

fn parse_dimension(value: &str) -> Result<(String, u8), String> {
    let (name, rating) = value.split_once('=').ok_or_else(|| format!("expected name=rating, got `{value}`"))?;
    let rating = rating.trim().parse::<u8>().map_err(|error| format!("invalid rating `{rating}`: {error}"))?;
    Ok((name.trim().to_string(), rating))
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions { config_path: cli.config.clone(), ..LoadOptions::default() };
    if let Ok(config) = AppConfig::load(options.clone()) {
        telemetry::init(&config.logging);
    }

    let result = match cli.command {
        Command::Classify { request } => commands::classify::run(&options, &request),
        Command::Decompose { request, force } => commands::decompose::run(&options, &request, force),
        Command::Process { request, user, agent, intent, action, force } => commands::process::run(
            &options,
            &ProcessArgs {
                request,
                user_id: user,
                source_agent: agent,
                intent,
                action,
                force_decomposition: force,
            },
        ),
        Command::Approve { operation_id, modified } => {
            commands::operations::approve(&options, &operation_id, modified)
        }
        Command::Reject { operation_id, reason } => commands::operations::reject(&options, &operation_id, reason),
        Command::Status { operation_id } => commands::operations::status(&options, &operation_id),
        Command::Rate { operation_id, rating, dimensions, comment } => {
            commands::feedback::rate(&options, &operation_id, rating, &dimensions, comment)
        }
        Command::Correct { operation_id, destination, consumer, semantics, reasoning } => {
            commands::feedback::correct(&options, &operation_id, &destination, &consumer, &semantics, reasoning)
        }
        Command::Retry { operation_id } => commands::feedback::behavior(&options, &operation_id, Behavior::Retry),
        Command::Undo { operation_id } => commands::feedback::behavior(&options, &operation_id, Behavior::Undo),
        Command::Abandon { operation_id } => {
            commands::feedback::behavior(&options, &operation_id, Behavior::Abandon)
        }
        Command::Metrics { user } => commands::metrics::run(&options, &user),
        Command::Migrate => commands::migrate::run(&options),
        Command::Config => commands::config::run(&options),
        Command::Doctor { human } => {
            let (exit_code, output) = commands::doctor::run(&options, human);
            commands::CommandResult { exit_code, output }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::{parse_dimension, Cli};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn dimensions_parse_as_name_and_rating() {
        assert_eq!(parse_dimension("speed=4"), Ok(("speed".to_string(), 4)));
        assert!(parse_dimension("speed").is_err());
        assert!(parse_dimension("speed=fast").is_err());
    }
}
