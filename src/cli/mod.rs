pub mod model;
mod validate;

pub use model::Format;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::CommandFactory;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use log::debug;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::agent::client::HttpModelAgent;
use crate::agent::{ModelAgent, NullAgent};
use crate::catalog::Catalog;
use crate::errors::default_error_handler;
use crate::intake::{stdin_events, EventIntake};
use crate::interactor::{
    ListRunsInteractor, ListScenariosInteractor, RunOutcome, RunRequestInteractor,
    ShowCatalogInteractor, ShowRunInteractor,
};
use crate::progress::RunCompleted;
use crate::store::model::OverallStatus;
use crate::store::FsScenarioStore;

#[derive(Parser)]
#[command(
    name = "testgpt",
    about = "TestGPT multi-environment QA test orchestrator",
    long_about = None,
    author,
    version,
    about,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

impl Cli {
    pub async fn run() -> Result<()> {
        let cli = Cli::parse();
        simple_logger::SimpleLogger::new()
            .env()
            .with_level(cli.verbose.log_level_filter())
            .init()
            .unwrap();

        let result = match cli.command {
            Some(Commands::Run(args)) => run_request(args).await,
            Some(Commands::Rerun(args)) => {
                let message = format!("re-run {}", args.reference);
                run_request(RunArgs {
                    message,
                    common: args.common,
                    progress_args: args.progress_args,
                    result_file_args: args.result_file_args,
                    agent_timeout_seconds: args.agent_timeout_seconds,
                    dry_run: false,
                    ignore_test_failures: args.ignore_test_failures,
                })
                .await
            }
            Some(Commands::Scenarios(args)) => {
                let ScenariosCommands::List {
                    common,
                    progress_args,
                } = args.command;
                let store = FsScenarioStore::new(&common.storage_dir);
                let interactor = ListScenariosInteractor {};
                interactor
                    .execute(&store, progress_args.format())
                    .await
                    .map(|_| true)
            }
            Some(Commands::Runs(args)) => match args.command {
                RunsCommands::List {
                    common,
                    progress_args,
                } => {
                    let store = FsScenarioStore::new(&common.storage_dir);
                    ListRunsInteractor {}
                        .execute(&store, progress_args.format())
                        .await
                        .map(|_| true)
                }
                RunsCommands::Show {
                    id,
                    common,
                    progress_args,
                } => {
                    let store = FsScenarioStore::new(&common.storage_dir);
                    ShowRunInteractor {}
                        .execute(&store, &id, progress_args.format())
                        .await
                        .map(|_| true)
                }
            },
            Some(Commands::Profiles(args)) => load_catalog(&args.catalog)
                .await
                .and_then(|catalog| {
                    ShowCatalogInteractor {}.execute(&catalog, args.progress_args.format())
                })
                .map(|_| true),
            Some(Commands::Serve(args)) => serve(args).await,
            Some(Commands::Completions { shell }) => {
                let mut app = Self::command();
                let bin_name = app.get_name().to_string();
                clap_complete::generate(shell, &mut app, bin_name, &mut std::io::stdout());
                Ok(true)
            }
            None => Ok(true),
        };

        match result {
            Ok(true) => ::std::process::exit(0),
            Ok(false) => ::std::process::exit(1),
            Err(error) => {
                let stderr = std::io::stderr();
                default_error_handler(error.into(), &mut stderr.lock());
                ::std::process::exit(1);
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    #[clap(about = "Run a natural-language test request across its environment matrix")]
    Run(RunArgs),
    #[clap(about = "Replay a saved scenario by id, name or 'last'")]
    Rerun(RerunArgs),
    #[clap(about = "Inspect saved scenarios")]
    Scenarios(ScenariosArgs),
    #[clap(about = "Inspect persisted run artifacts")]
    Runs(RunsArgs),
    #[clap(about = "Print the environment catalog (viewports, browsers, networks)")]
    Profiles(ProfilesArgs),
    #[clap(about = "Serve an event-intake loop: JSON events on stdin, summaries on stdout")]
    Serve(ServeArgs),
    #[clap(about = "Output shell completion code for the specified shell (bash, zsh, fish)")]
    Completions { shell: clap_complete::Shell },
}

/// Options valid for any command touching storage or the catalog.
#[derive(Debug, Clone, Args)]
struct CommonArgs {
    #[arg(
        long,
        env("TESTGPT_HOME"),
        default_value = "~/.testgpt",
        help = "Root directory for scenario and run-artifact storage"
    )]
    storage_dir: PathBuf,

    #[arg(
        long,
        env("TESTGPT_CATALOG"),
        help = "Environment catalog file overriding the built-in profiles"
    )]
    catalog: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct ProgressArgs {
    #[arg(long, value_enum, default_value_t, help = "Output format")]
    format: Format,

    #[arg(long, default_value_t = false, help = "Disable animated progress bars")]
    no_progress_bars: bool,
}

impl ProgressArgs {
    fn format(&self) -> Format {
        match (self.format, self.no_progress_bars) {
            (Format::Standard, true) => Format::Plain,
            (format, _) => format,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct ResultFileArgs {
    #[arg(
        long,
        help = "Also write the completed-run report to this file. The extension picks the encoding: .json (default), .yaml or .yml"
    )]
    result_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
#[command(args_conflicts_with_subcommands = true)]
struct RunArgs {
    #[arg(help = "Natural-language request, e.g. \"test careers.example.com on iphone under slow 3g\"")]
    message: String,

    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    progress_args: ProgressArgs,

    #[command(flatten)]
    result_file_args: ResultFileArgs,

    #[arg(
        long,
        default_value_t = 300,
        help = "Wall-clock budget per cell for the browsing agent"
    )]
    agent_timeout_seconds: u64,

    #[arg(
        long,
        default_value_t = false,
        help = "Parse, plan and persist the scenario without executing any cell"
    )]
    dry_run: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "When cells fail and this option is true then cli will exit with code 0. By default, cli will exit with code 1 in case of cell failures and 0 for passing runs"
    )]
    ignore_test_failures: bool,
}

#[derive(Debug, Parser)]
#[command(args_conflicts_with_subcommands = true)]
struct RerunArgs {
    #[arg(help = "Scenario id, name fragment, or 'last'")]
    reference: String,

    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    progress_args: ProgressArgs,

    #[command(flatten)]
    result_file_args: ResultFileArgs,

    #[arg(long, default_value_t = 300)]
    agent_timeout_seconds: u64,

    #[arg(long, default_value_t = false)]
    ignore_test_failures: bool,
}

#[derive(Debug, Parser)]
#[command(args_conflicts_with_subcommands = true)]
struct ScenariosArgs {
    #[command(subcommand)]
    command: ScenariosCommands,
}

#[derive(Debug, Subcommand)]
enum ScenariosCommands {
    #[clap(about = "List saved scenarios")]
    List {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        progress_args: ProgressArgs,
    },
}

#[derive(Debug, Parser)]
#[command(args_conflicts_with_subcommands = true)]
struct RunsArgs {
    #[command(subcommand)]
    command: RunsCommands,
}

#[derive(Debug, Subcommand)]
enum RunsCommands {
    #[clap(about = "List persisted runs, most recent first")]
    List {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        progress_args: ProgressArgs,
    },
    #[clap(about = "Print one run artifact")]
    Show {
        #[arg(long, help = "Run id")]
        id: String,
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        progress_args: ProgressArgs,
    },
}

#[derive(Debug, Parser)]
#[command(args_conflicts_with_subcommands = true)]
struct ProfilesArgs {
    #[arg(long, env("TESTGPT_CATALOG"))]
    catalog: Option<PathBuf>,

    #[command(flatten)]
    progress_args: ProgressArgs,
}

#[derive(Debug, Parser)]
#[command(args_conflicts_with_subcommands = true)]
struct ServeArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    progress_args: ProgressArgs,

    #[arg(
        long,
        default_value = "@testgpt",
        help = "Addressing token events must start with to be processed"
    )]
    mention: String,

    #[arg(long, default_value_t = 300)]
    agent_timeout_seconds: u64,
}

async fn run_request(args: RunArgs) -> Result<bool> {
    validate::check_report_path(args.result_file_args.result_file.as_deref())?;

    let catalog = load_catalog(&args.common.catalog).await?;
    let store = FsScenarioStore::new(&args.common.storage_dir);
    let progress_format = args.progress_args.format();

    let agent: Box<dyn ModelAgent> = if args.dry_run {
        Box::new(NullAgent)
    } else {
        Box::new(HttpModelAgent::from_env()?)
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let interactor = RunRequestInteractor {};
    let outcome = interactor
        .execute(
            &catalog,
            &store,
            agent.as_ref(),
            &args.message,
            Duration::from_secs(args.agent_timeout_seconds),
            args.dry_run,
            &cancel,
            progress_format,
        )
        .await?;

    match outcome {
        RunOutcome::Planned(plan) => {
            progress_format.progress(&format!(
                "Planned {} cell(s) for scenario {} (nothing executed):",
                plan.total_cells, plan.scenario_id
            ));
            for cell in &plan.cells {
                progress_format.progress(&format!("  {}", cell.cell_id));
            }
            Ok(true)
        }
        RunOutcome::Cancelled => Ok(false),
        RunOutcome::Completed(completed) => {
            let report = RunCompleted {
                run_id: completed.artifact.run_id.clone(),
                scenario_name: completed.plan.scenario_name.clone(),
                state: completed.artifact.overall_status.to_string(),
                passed: completed.artifact.passed_cells,
                failed: completed.artifact.failed_cells,
                artifact_path: completed.artifact_path.display().to_string(),
                duration: completed.duration,
                summary: completed.summary.clone(),
            };
            progress_format.format(&report)?;
            if let Some(result_file) = &args.result_file_args.result_file {
                write_result_file(result_file, &report)?;
            }

            let passing = completed.artifact.overall_status == OverallStatus::Pass;
            Ok(passing || args.ignore_test_failures)
        }
    }
}

async fn serve(args: ServeArgs) -> Result<bool> {
    let catalog = load_catalog(&args.common.catalog).await?;
    let store = FsScenarioStore::new(&args.common.storage_dir);
    let agent = HttpModelAgent::from_env()?;
    let progress_format = args.progress_args.format();
    let agent_timeout = Duration::from_secs(args.agent_timeout_seconds);

    let intake = EventIntake::new(&args.mention);
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    progress_format.progress(&format!(
        "Listening for events addressed to {} on stdin...",
        args.mention
    ));

    let events = stdin_events();
    futures::pin_mut!(events);
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let message = match intake.admit(&event, OffsetDateTime::now_utc()) {
            Ok(message) => message,
            Err(reason) => {
                // Dropped events are invisible to the surface on purpose.
                debug!("dropping event {}: {reason}", event.event_id);
                continue;
            }
        };

        let _guard = match intake.begin_run() {
            Ok(guard) => guard,
            Err(busy) => {
                println!("{busy}");
                continue;
            }
        };

        let interactor = RunRequestInteractor {};
        let outcome = interactor
            .execute(
                &catalog,
                &store,
                &agent,
                &message,
                agent_timeout,
                false,
                &cancel,
                progress_format,
            )
            .await;

        match outcome {
            Ok(RunOutcome::Completed(completed)) => println!("{}", completed.summary),
            Ok(RunOutcome::Cancelled) => break,
            Ok(RunOutcome::Planned(_)) => {}
            Err(error) => {
                let stderr = std::io::stderr();
                default_error_handler(error.into(), &mut stderr.lock());
            }
        }
    }

    Ok(true)
}

async fn load_catalog(path: &Option<PathBuf>) -> Result<Catalog> {
    match path {
        Some(path) => Catalog::from_file(path).await,
        None => Catalog::embedded(),
    }
}

fn write_result_file(path: &PathBuf, report: &RunCompleted) -> Result<()> {
    let content = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::to_string(report)?,
        _ => serde_json::to_string_pretty(report)?,
    };
    std::fs::write(path, content)?;
    Ok(())
}
