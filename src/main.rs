use clap::{Parser, Subcommand};
use llm_chain_executor::coordination::{BatchConfigBuilder, RetryPolicyBuilder};
use llm_chain_executor::remote::{ModelParams, RemoteSettings};
use llm_chain_executor::runner::{
    ChainSummary, DEFAULT_BASE_URL, DEFAULT_CHAIN_CONCURRENCY, DEFAULT_DATABASE_URL,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE, DEFAULT_TOP_P,
    ExecutorArgs, OutcomeBackend, run_batch, run_chain, show_chain,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser, Clone)]
#[command(name = "llm-chain-executor", about = "Run chained language-model prompts")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone)]
struct CommonArgs {
    /// Database for step outcomes (postgres://... or sqlite:...)
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL, global = true)]
    database_url: String,

    /// Record step outcomes as JSON files under this directory instead of a database
    #[arg(long, global = true)]
    outcome_dir: Option<PathBuf>,

    /// Maximum database connections
    #[arg(long, default_value = "4", global = true)]
    max_connections: u32,

    /// API key for the completion endpoint
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, default_value = "", global = true)]
    api_key: String,

    /// Base URL of an OpenAI-compatible endpoint
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL, global = true)]
    base_url: String,

    #[arg(long, default_value = DEFAULT_MODEL, global = true)]
    model: String,

    #[arg(long, default_value_t = DEFAULT_TEMPERATURE, global = true)]
    temperature: f32,

    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS, global = true)]
    max_tokens: u32,

    #[arg(long, default_value_t = DEFAULT_TOP_P, global = true)]
    top_p: f32,

    #[arg(long, default_value_t = 0.0, global = true)]
    frequency_penalty: f32,

    #[arg(long, default_value_t = 0.0, global = true)]
    presence_penalty: f32,

    /// JSON file with step templates: [{"name": ..., "template": ...}]
    #[arg(long, global = true)]
    templates: Option<PathBuf>,

    /// Remote calls per step, including the first one
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS, global = true)]
    max_attempts: u32,

    /// Cancel all running chains after this many seconds
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,

    /// Quiet mode - minimal output, only show summary
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Run one chain over a single input
    Chain {
        /// Raw input bound to {input}
        input: String,

        /// Record steps under this chain id instead of a generated one
        #[arg(long)]
        chain_id: Option<String>,
    },

    /// Run one independent chain per input
    Batch {
        /// Inputs given on the command line
        inputs: Vec<String>,

        /// File with one input per line
        #[arg(short, long)]
        input_file: Option<PathBuf>,

        /// Number of chains running at the same time
        #[arg(long, default_value_t = DEFAULT_CHAIN_CONCURRENCY)]
        chain_concurrency: usize,

        /// Report the batch under this id instead of a generated one
        #[arg(long)]
        batch_id: Option<String>,
    },

    /// Print the recorded steps of a chain
    Show {
        chain_id: String,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let common = args.common;

    // Initialize tracing based on quiet mode
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if common.quiet {
        EnvFilter::new("llm_chain_executor=warn,sqlx=off")
    } else {
        EnvFilter::new("llm_chain_executor=info,sqlx=off")
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let cancel = CancellationToken::new();
    cli::spawn_cancel_triggers(&cancel, common.deadline_secs.map(Duration::from_secs));

    match args.command {
        Command::Chain { input, chain_id } => {
            let chain_id = chain_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let executor_args = build_executor_args(&common, DEFAULT_CHAIN_CONCURRENCY)?;
            let summary = run_chain(executor_args, &chain_id, &input, &cancel).await?;
            println!("{}", cli::format_summary(&summary));
            if !summary.is_success() {
                anyhow::bail!("Chain {} did not complete", summary.chain_id());
            }
        }
        Command::Batch {
            inputs,
            input_file,
            chain_concurrency,
            batch_id,
        } => {
            let inputs = cli::collect_inputs(inputs, input_file.as_deref())?;
            if inputs.is_empty() {
                anyhow::bail!("No inputs given. Pass inputs as arguments or use --input-file.");
            }

            let batch_id = batch_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let executor_args = build_executor_args(&common, chain_concurrency)?;
            let result = run_batch(executor_args, &batch_id, inputs, &cancel).await?;

            println!();
            println!("Batch Summary");
            println!("=============");
            println!("Batch ID: {}", result.batch_id);
            for summary in &result.summaries {
                println!("{}", cli::format_summary(summary));
            }
            println!("Chains succeeded: {}", result.succeeded());
            println!("Chains failed: {}", result.failed());
            println!("Duration: {:.2}s", result.duration.as_secs_f64());

            if result.failed() > 0 {
                anyhow::bail!(
                    "{} of {} chains did not complete",
                    result.failed(),
                    result.summaries.len()
                );
            }
        }
        Command::Show { chain_id, json } => {
            let executor_args = build_executor_args(&common, DEFAULT_CHAIN_CONCURRENCY)?;
            let outcomes = show_chain(executor_args, &chain_id).await?;
            if outcomes.is_empty() {
                println!("No steps recorded for chain {}", chain_id);
            }
            for outcome in &outcomes {
                if json {
                    println!("{}", serde_json::to_string(outcome)?);
                } else {
                    println!("{}", cli::format_outcome(outcome));
                }
            }
        }
    }

    Ok(())
}

fn build_executor_args(common: &CommonArgs, chain_concurrency: usize) -> anyhow::Result<ExecutorArgs> {
    let backend = match &common.outcome_dir {
        Some(dir) => OutcomeBackend::LocalDir(dir.clone()),
        None => OutcomeBackend::Database {
            url: common.database_url.clone(),
            max_connections: common.max_connections,
        },
    };

    let retry = RetryPolicyBuilder::default()
        .max_attempts(common.max_attempts)
        .build()?;
    let batch = BatchConfigBuilder::default()
        .chain_concurrency(chain_concurrency)
        .quiet(common.quiet)
        .build()?;

    Ok(ExecutorArgs {
        backend,
        remote: RemoteSettings {
            base_url: common.base_url.clone(),
            api_key: common.api_key.clone(),
        },
        params: ModelParams {
            model: common.model.clone(),
            temperature: common.temperature,
            max_tokens: common.max_tokens,
            top_p: common.top_p,
            frequency_penalty: common.frequency_penalty,
            presence_penalty: common.presence_penalty,
        },
        templates_path: common.templates.clone(),
        retry,
        batch,
    })
}

/// CLI utility functions for inputs, cancellation and output formatting
mod cli {
    use super::ChainSummary;
    use llm_chain_executor::store::StepOutcome;
    use std::path::Path;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Cancel `token` on Ctrl-C or once `deadline` elapses
    pub fn spawn_cancel_triggers(token: &CancellationToken, deadline: Option<Duration>) {
        let on_signal = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, cancelling running chains...");
                on_signal.cancel();
            }
        });

        if let Some(deadline) = deadline {
            let on_deadline = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                eprintln!("Deadline of {}s reached, cancelling running chains...", deadline.as_secs());
                on_deadline.cancel();
            });
        }
    }

    /// Merge command-line inputs with the lines of an optional input file
    pub fn collect_inputs(
        mut inputs: Vec<String>,
        input_file: Option<&Path>,
    ) -> anyhow::Result<Vec<String>> {
        if let Some(path) = input_file {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Failed to read input file '{}': {}", path.display(), e)
            })?;
            inputs.extend(parse_input_lines(&contents));
        }
        Ok(inputs)
    }

    /// One input per line; blank lines are skipped
    pub fn parse_input_lines(contents: &str) -> Vec<String> {
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn format_summary(summary: &ChainSummary) -> String {
        match summary {
            ChainSummary::Succeeded(output) => format!(
                "[ok]     {} -> {}",
                output.chain_id,
                output.final_response().unwrap_or_default()
            ),
            ChainSummary::Failed {
                chain_id,
                error,
                cancelled,
                ..
            } => {
                let tag = if *cancelled { "[cancel]" } else { "[failed]" };
                format!("{} {} : {}", tag, chain_id, error)
            }
        }
    }

    pub fn format_outcome(outcome: &StepOutcome) -> String {
        let detail = match (&outcome.response, &outcome.error_message) {
            (Some(response), _) => response.as_str(),
            (None, Some(error)) => error.as_str(),
            (None, None) => "",
        };
        format!(
            "step {} [{}] {}ms at {}: {}",
            outcome.step_number,
            outcome.status.as_str(),
            outcome.execution_time_ms,
            outcome.created_at.to_rfc3339(),
            detail
        )
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_input_lines_skips_blanks() {
            assert_eq!(
                parse_input_lines("42\n\n  what is 2+2?  \n\r\n"),
                vec!["42".to_string(), "what is 2+2?".to_string()]
            );
        }

        #[test]
        fn test_collect_inputs_appends_file_lines() {
            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().join("inputs.txt");
            std::fs::write(&path, "b\nc\n").unwrap();

            let inputs = collect_inputs(vec!["a".to_string()], Some(path.as_path())).unwrap();
            assert_eq!(inputs, vec!["a", "b", "c"]);

            assert!(collect_inputs(Vec::new(), Some(dir.path().join("missing").as_path())).is_err());
        }

        #[test]
        fn test_format_failed_summary() {
            let summary = ChainSummary::Failed {
                chain_id: "c-1".to_string(),
                step_number: 2,
                error: "boom".to_string(),
                cancelled: false,
            };
            assert_eq!(format_summary(&summary), "[failed] c-1 : boom");
        }
    }
}
