mod config;
mod dispatch;
mod input;
mod keywords;
mod modes;
mod pattern;
mod process;
mod remote;
mod stage;
mod submit;
mod valuemap;

use clap::{Args, Parser, Subcommand};
use config::SubmitterSettings;
use dispatch::ExecFramework;
use modes::RunMode;
use process::{ConfirmationPolicy, SystemRunner};
use std::path::PathBuf;
use std::process::exit;
use submit::{RunParams, Submitter};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "trainsub",
    version,
    about = "Job submitter for batch analysis trains"
)]
struct Cli {
    /// settings file (YAML)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// answer yes to every confirmation prompt (unattended runs)
    #[arg(long, global = true)]
    yes: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// run mode: local localterminate grid gridtest gridmerge gridterminate
    /// prooflite saf saf2 vaf
    run_mode: String,
    /// input file, file list, or Find;BasePath=...;FileName=... query
    input: String,
    /// e.g. "ESD LHC15o muon_calo_pass1 MC EMBED"
    #[arg(long, default_value = "")]
    input_options: String,
    /// e.g. "NOPHYSSEL CENTR MIXED SPLIT RESUME NWORKERS=44"
    #[arg(long, default_value = "")]
    analysis_options: String,
    /// forwarded verbatim to the task macros
    #[arg(long, default_value = "")]
    task_options: String,
    /// software version for the remote pools; derived from the date if empty
    #[arg(long, default_value = "")]
    soft_version: String,
    /// load every event branch instead of the specialized subset
    #[arg(long)]
    all_branches: bool,
    /// set by the generated pool launcher, never by hand
    #[arg(long, hide = true)]
    on_pod: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run inside an already staged workspace
    Run {
        #[command(flatten)]
        args: RunArgs,
    },
    /// Stage a workspace from task configurations, then run inside it
    Submit {
        /// workspace directory to stage into
        #[arg(long)]
        workdir: PathBuf,
        /// task configuration files, in order
        #[arg(long = "task-config", required = true)]
        task_configs: Vec<PathBuf>,
        #[command(flatten)]
        args: RunArgs,
    },
    /// Write a template task configuration to get started
    Template {
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

fn run_params(args: &RunArgs) -> Result<RunParams, modes::ModeError> {
    Ok(RunParams {
        run_mode: RunMode::parse(&args.run_mode)?,
        input: args.input.clone(),
        input_options: args.input_options.clone(),
        analysis_options: args.analysis_options.clone(),
        task_options: args.task_options.clone(),
        soft_version: args.soft_version.clone(),
        specialized: !args.all_branches,
        on_pod: args.on_pod,
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let settings = match SubmitterSettings::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };
    let policy = if cli.yes {
        ConfirmationPolicy::AutoAccept
    } else {
        ConfirmationPolicy::Interactive
    };

    let runner = SystemRunner;
    let ok = match &cli.command {
        Commands::Template { output_dir } => match config::write_template(output_dir) {
            Ok(path) => {
                info!("template written to {}", path.display());
                true
            }
            Err(e) => {
                error!("cannot write the template: {e}");
                false
            }
        },
        Commands::Run { args } => match run_params(args) {
            Ok(params) => {
                let mut framework = ExecFramework {
                    exec: settings.framework_exec.clone(),
                    runner: &runner,
                };
                let mut submitter = Submitter {
                    settings,
                    runner: &runner,
                    policy,
                    framework: &mut framework,
                };
                submitter.run(&params)
            }
            Err(e) => {
                error!("{e}");
                false
            }
        },
        Commands::Submit {
            workdir,
            task_configs,
            args,
        } => match run_params(args) {
            Ok(params) => {
                let mut framework = ExecFramework {
                    exec: settings.framework_exec.clone(),
                    runner: &runner,
                };
                let mut submitter = Submitter {
                    settings,
                    runner: &runner,
                    policy,
                    framework: &mut framework,
                };
                submitter.setup_and_run(workdir, task_configs, &params)
            }
            Err(e) => {
                error!("{e}");
                false
            }
        },
    };

    exit(if ok { 0 } else { 1 });
}
