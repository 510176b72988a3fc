//! Top-level orchestration: resolve configuration, pick the execution
//! environment, stage, run remotely when needed, dispatch. Configuration
//! errors surface before any side effect; remote failures abort the rest of
//! the pipeline.

use crate::config::{
    load_task_config, load_task_configs, ConfigErrors, SubmitterSettings, TaskConfig,
    TASK_MANIFEST_FILE,
};
use crate::dispatch::{
    build_grid_plan, AnalysisFramework, DispatchContext, DispatchError, DispatchOutcome,
    Dispatcher, ResolvedTask,
};
use crate::input::{self, InputError};
use crate::keywords::{KeywordError, KeywordTable};
use crate::modes::{self, Environment, Family, ModeError, RunMode};
use crate::process::{ConfirmationPolicy, ProcessRunner};
use crate::remote::{write_pod_launcher, RemoteError, RemoteRunner};
use crate::stage::{StageError, Stager};
use crate::valuemap::{build_value_map, ValueMap};
use std::env;
use std::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};

#[derive(ThisError, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Keyword(#[from] KeywordError),
    #[error(transparent)]
    Mode(#[from] ModeError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One invocation: one dataset, one set of tasks, one target environment.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub run_mode: RunMode,
    pub input: String,
    pub input_options: String,
    pub analysis_options: String,
    pub task_options: String,
    pub soft_version: String,
    pub specialized: bool,
    pub on_pod: bool,
}

impl RunParams {
    /// The original run parameters as quoted CLI arguments, for the pool
    /// launcher that re-invokes this submitter next to the staged dataset.
    pub fn rerun_args(&self, dataset: &str) -> String {
        let mut parts = vec![self.run_mode.name().to_string(), shell_quote(dataset)];
        if !self.input_options.is_empty() {
            parts.push("--input-options".to_string());
            parts.push(shell_quote(&self.input_options));
        }
        if !self.analysis_options.is_empty() {
            parts.push("--analysis-options".to_string());
            parts.push(shell_quote(&self.analysis_options));
        }
        if !self.task_options.is_empty() {
            parts.push("--task-options".to_string());
            parts.push(shell_quote(&self.task_options));
        }
        if !self.soft_version.is_empty() {
            parts.push("--soft-version".to_string());
            parts.push(shell_quote(&self.soft_version));
        }
        if !self.specialized {
            parts.push("--all-branches".to_string());
        }
        parts.join(" ")
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Restores the original working directory on drop, whatever the outcome.
struct RestoreDir {
    original: PathBuf,
}

impl RestoreDir {
    fn change_to(dir: &Path) -> io::Result<Self> {
        let original = env::current_dir()?;
        env::set_current_dir(dir)?;
        Ok(Self { original })
    }
}

impl Drop for RestoreDir {
    fn drop(&mut self) {
        if let Err(e) = env::set_current_dir(&self.original) {
            error!("cannot restore {}: {e}", self.original.display());
        }
    }
}

pub struct Submitter<'a> {
    pub settings: SubmitterSettings,
    pub runner: &'a dyn ProcessRunner,
    pub policy: ConfirmationPolicy,
    pub framework: &'a mut dyn AnalysisFramework,
}

impl Submitter<'_> {
    /// Run inside an already staged workspace. The consolidated task manifest
    /// in the current directory is the precondition.
    pub fn run(&mut self, params: &RunParams) -> bool {
        let workspace = match env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!("cannot determine the current directory: {e}");
                return false;
            }
        };
        if !workspace.join(TASK_MANIFEST_FILE).is_file() {
            error!(
                "cannot find {TASK_MANIFEST_FILE} in {}: run must start inside a staged workspace",
                workspace.display()
            );
            return false;
        }

        match self.execute(params, &workspace) {
            Ok(DispatchOutcome::Completed) => {
                info!("job completed");
                true
            }
            Ok(DispatchOutcome::NothingToDo) => {
                info!("terminate step had nothing to do");
                true
            }
            Err(e) => {
                log_chain(&e);
                false
            }
        }
    }

    /// Stage the workspace from the given configuration files, then run the
    /// job inside it; the original working directory is restored regardless
    /// of outcome.
    pub fn setup_and_run(
        &mut self,
        workdir: &Path,
        task_configs: &[PathBuf],
        params: &RunParams,
    ) -> bool {
        let config = match load_task_configs(task_configs) {
            Ok(config) => config,
            Err(e) => {
                log_chain(&e);
                return false;
            }
        };

        let stager = Stager {
            settings: &self.settings,
            runner: self.runner,
            policy: self.policy,
        };
        let staged = match stager.stage(workdir, &config, params.run_mode.is_terminate_only()) {
            Ok(staged) => staged,
            Err(e) => {
                log_chain(&e);
                return false;
            }
        };
        info!(
            "staged {} files into {} ({} packages built)",
            staged.copied.len(),
            staged.path.display(),
            staged.built_packages.len()
        );

        let _restore = match RestoreDir::change_to(&staged.path) {
            Ok(guard) => guard,
            Err(e) => {
                error!("cannot enter {}: {e}", staged.path.display());
                return false;
            }
        };
        self.run(params)
    }

    fn execute(
        &mut self,
        params: &RunParams,
        workspace: &Path,
    ) -> Result<DispatchOutcome, SubmitError> {
        let probe = Environment::probe(params.on_pod);
        let profile = modes::select(
            params.run_mode,
            &params.analysis_options,
            workspace,
            &self.settings,
            &probe,
            &self.policy,
        )?;

        if let Some(user) = &profile.user {
            debug!("remote identity {user}");
        }

        // on the pool machine the staged dataset replaces the original descriptor
        let descriptor = if profile.is_pod() && profile.on_pod_machine {
            input::staged_dataset_name(workspace).unwrap_or_else(|| params.input.clone())
        } else {
            params.input.clone()
        };

        let wants_grid = profile.mode.family() == Family::Grid;
        let manifest = input::resolve(&descriptor, &params.input_options, wants_grid)?;
        input::write_manifest(&manifest, &descriptor, workspace)?;

        let config = load_task_config(&workspace.join(TASK_MANIFEST_FILE))?;

        let options = params.analysis_options.to_uppercase();
        // on the pool machine the synchronized map is reused instead of being
        // re-derived, so a restarted session sees the original values
        let map = if profile.is_pod() && profile.on_pod_machine {
            ValueMap::load(workspace).unwrap_or_else(|_| {
                build_value_map(
                    &manifest,
                    !options.contains("NOPHYSSEL"),
                    options.contains("CENTR"),
                )
            })
        } else {
            build_value_map(
                &manifest,
                !options.contains("NOPHYSSEL"),
                options.contains("CENTR"),
            )
        };
        map.save(workspace)?;
        info!(
            "data type {} ({})",
            map.get("dataType").unwrap_or("DATA"),
            map.get("mcDetails").unwrap_or("FULL")
        );
        let table = KeywordTable::build(&manifest, &params.task_options, &map);
        let tasks = resolve_tasks(&config, &table, workspace)?;

        let soft_version = modes::soft_version(&params.soft_version);
        let mut terminate_only = profile.mode.is_terminate_only();
        info!(
            "run mode {} ({:?} submode), software {soft_version}",
            profile.mode.name(),
            profile.mode.submode()
        );

        if let Some(access) = &profile.remote {
            if !profile.on_pod_machine {
                let dataset = input::stage_dataset(&manifest, workspace, &access.dataset_mode)?;
                write_pod_launcher(
                    workspace,
                    &access.out_dir,
                    profile.nworkers,
                    &dataset,
                    &params.rerun_args(&dataset),
                    profile.split_per_run,
                    &self.settings.framework_exec,
                )?;
                let remote = RemoteRunner {
                    runner: self.runner,
                    soft_version: soft_version.clone(),
                };
                remote.run(access, profile.resume, workspace)?;
                // results are back: only the merge/terminate step remains
                terminate_only = true;
            }
        }

        let grid = wants_grid.then(|| {
            build_grid_plan(
                &manifest,
                profile.mode,
                &soft_version,
                &config,
                &self.settings,
                workspace,
                &descriptor,
            )
        });

        let mut dispatcher = Dispatcher {
            framework: &mut *self.framework,
        };
        Ok(dispatcher.dispatch(DispatchContext {
            manifest: &manifest,
            profile: &profile,
            tasks,
            analysis_options: &params.analysis_options,
            specialized: params.specialized,
            workspace,
            terminate_only,
            grid,
        })?)
    }
}

/// Substitute each task's argument string and the body of its dependency
/// configuration macro on the staged copy.
fn resolve_tasks(
    config: &TaskConfig,
    table: &KeywordTable,
    workspace: &Path,
) -> Result<Vec<ResolvedTask>, SubmitError> {
    let mut tasks = Vec::with_capacity(config.tasks.len());
    for task in &config.tasks {
        let (_, args) = table.substitute(&task.args)?;

        if let Some(config_macro) = &task.config_macro {
            if let Some(file_name) = Path::new(config_macro).file_name() {
                let staged = workspace.join(file_name);
                match fs::read_to_string(&staged) {
                    Ok(body) => {
                        let (replaced, resolved) = table.substitute_lines(&body)?;
                        if replaced {
                            fs::write(&staged, resolved)?;
                        }
                    }
                    Err(e) => {
                        warn!("cannot read configuration macro {}: {e}", staged.display())
                    }
                }
            }
        }

        tasks.push(ResolvedTask {
            name: task.name.clone(),
            macro_file: task.macro_file.clone(),
            config_macro: task.config_macro.clone(),
            args,
        });
    }
    Ok(tasks)
}

fn log_chain(top: &dyn Error) {
    error!("{top}");
    let mut source = top.source();
    while let Some(cause) = source {
        error!("  caused by: {cause}");
        source = cause.source();
    }
}
