//! Boundary to the external analysis framework: translates the resolved plan
//! into handler bindings and a sub-mode, then asks the framework to run.

use crate::config::{SubmitterSettings, TaskConfig, TASK_MANIFEST_FILE};
use crate::input::{DataFormat, InputManifest};
use crate::modes::{ExecutionProfile, Family, RunMode};
use crate::process::{CommandSpec, ProcessRunner};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// common output artifact produced by the framework
pub const COMMON_OUTPUT_FILE: &str = "AnalysisResults.root";

/// serialized execution request handed to the analysis shell
pub const REQUEST_FILE: &str = "request.yaml";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("analysis framework initialization failed")]
    FrameworkInit,
    #[error("analysis run failed in {0} mode")]
    FrameworkRun(String),
}

/// A legitimately empty terminate step is not a failure.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    NothingToDo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventHandler {
    Esd { restrict_branches: bool },
    Aod,
    McTruth,
    /// multiplexes primary and MC-truth handlers for event mixing
    Multi(Vec<EventHandler>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InputObject {
    /// ordered event files, local and grid families
    Chain(Vec<String>),
    /// labeled collection file, proof family
    Collection(String),
    /// plain dataset descriptor or query, proof family
    Dataset(String),
}

/// Optional modules toggled by the analysis options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BuiltinModule {
    PhysicsSelection { as_mc: bool, pass: String },
    Centrality { legacy: bool, as_mc: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTask {
    pub name: String,
    pub macro_file: String,
    pub config_macro: Option<String>,
    pub args: String,
}

/// Parameters of a distributed-grid submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridPlan {
    pub run_name: String,
    pub soft_version: String,
    pub merge_via_jdl: bool,
    pub test_input: Option<String>,
    pub run_list: Vec<i32>,
    pub run_prefix: Option<String>,
    pub working_dir: Option<String>,
    pub data_dir: Option<String>,
    pub data_pattern: Option<String>,
    pub packages: Vec<String>,
    pub extra_sources: Vec<String>,
    pub extra_libs: Vec<String>,
    pub replicas: u32,
    pub output_to_run_number: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRequest {
    pub submode: String,
    /// interactive-pool connection string, empty outside the proof family
    pub cluster: String,
    pub handler: EventHandler,
    pub mc_truth: Option<EventHandler>,
    pub input: InputObject,
    pub tasks: Vec<ResolvedTask>,
    pub builtin: Vec<BuiltinModule>,
    pub grid: Option<GridPlan>,
}

/// External analysis-framework manager: receives the request and a sub-mode,
/// reports success/failure of initialization and of the run.
pub trait AnalysisFramework {
    fn output_file(&self) -> PathBuf;
    fn initialize(&mut self, request: &JobRequest) -> bool;
    fn run(&mut self, submode: &str) -> bool;
}

pub struct DispatchContext<'a> {
    pub manifest: &'a InputManifest,
    pub profile: &'a ExecutionProfile,
    pub tasks: Vec<ResolvedTask>,
    pub analysis_options: &'a str,
    pub specialized: bool,
    pub workspace: &'a Path,
    pub terminate_only: bool,
    pub grid: Option<GridPlan>,
}

pub struct Dispatcher<'a> {
    pub framework: &'a mut dyn AnalysisFramework,
}

impl Dispatcher<'_> {
    pub fn dispatch(&mut self, ctx: DispatchContext<'_>) -> Result<DispatchOutcome, DispatchError> {
        let submode = submode_name(ctx.profile.mode.family(), ctx.terminate_only);

        if ctx.terminate_only {
            let expected = ctx.workspace.join(self.framework.output_file());
            if !expected.is_file() {
                info!("cannot find {}: nothing done", expected.display());
                return Ok(DispatchOutcome::NothingToDo);
            }
        }

        let options = ctx.analysis_options.to_uppercase();
        let manifest = ctx.manifest;

        let primary = match manifest.format {
            DataFormat::Esd => EventHandler::Esd {
                restrict_branches: ctx.specialized,
            },
            DataFormat::Aod => EventHandler::Aod,
        };
        // MC truth only exists alongside the ESD format
        let mc = (manifest.is_mc && manifest.format == DataFormat::Esd)
            .then_some(EventHandler::McTruth);

        let (handler, mc_truth) = if options.contains("MIXED") {
            let mut wrapped = vec![primary];
            wrapped.extend(mc);
            (EventHandler::Multi(wrapped), None)
        } else {
            (primary, mc)
        };

        let as_mc = manifest.is_mc && !manifest.is_embed;
        let mut builtin = Vec::new();
        if !options.contains("NOPHYSSEL") {
            builtin.push(BuiltinModule::PhysicsSelection {
                as_mc,
                pass: manifest.pass.clone().unwrap_or_default(),
            });
        }
        if options.contains("CENTR") {
            builtin.push(BuiltinModule::Centrality {
                legacy: options.contains("OLDCENTR"),
                as_mc,
            });
        }

        let input = match ctx.profile.mode.family() {
            Family::Local | Family::Grid => InputObject::Chain(
                manifest
                    .locations
                    .iter()
                    .filter(|location| location.ends_with(".root"))
                    .cloned()
                    .collect(),
            ),
            Family::Proof if manifest.is_collection => {
                InputObject::Collection(manifest.locations[0].clone())
            }
            Family::Proof => InputObject::Dataset(manifest.locations[0].clone()),
        };

        let request = JobRequest {
            submode: submode.to_string(),
            cluster: ctx.profile.cluster.clone(),
            handler,
            mc_truth,
            input,
            tasks: ctx.tasks,
            builtin,
            grid: ctx.grid,
        };

        info!(
            "analysing {} (MC {}) in {submode} mode",
            manifest.format, manifest.is_mc
        );

        if !self.framework.initialize(&request) {
            return Err(DispatchError::FrameworkInit);
        }
        if !self.framework.run(submode) {
            return Err(DispatchError::FrameworkRun(submode.to_string()));
        }
        Ok(DispatchOutcome::Completed)
    }
}

fn submode_name(family: Family, terminate_only: bool) -> &'static str {
    if terminate_only {
        return "grid terminate";
    }
    match family {
        Family::Local => "local",
        Family::Grid => "grid",
        Family::Proof => "proof",
    }
}

/// Assemble the grid submission parameters.
pub fn build_grid_plan(
    manifest: &InputManifest,
    mode: RunMode,
    soft_version: &str,
    config: &TaskConfig,
    settings: &SubmitterSettings,
    workdir: &Path,
    descriptor: &str,
) -> GridPlan {
    if manifest.run_list.is_empty() {
        error!(
            "the grid submission expects a run list, none was found in the input: {descriptor}"
        );
        error!("this might be a custom production, which the submission cannot handle by itself");
    }
    let run_prefix = (!manifest.is_mc && !manifest.run_list.is_empty()).then(|| "000".to_string());

    let working_dir = match &manifest.period {
        Some(period) => {
            let name = settings.grid_workdir_component(workdir);
            let base = if manifest.is_mc { "mcAna" } else { "analysis" };
            let full = format!("{base}/{period}/{name}");
            warn!("setting a derived grid working dir: {full}");
            Some(full)
        }
        None => {
            warn!("no period: the grid working dir must be declared downstream");
            None
        }
    };

    let mut extra_sources = Vec::new();
    let mut extra_libs = Vec::new();
    let mut packages = config.packages.clone();
    for name in &config.libraries {
        if let Some(stem) = name.strip_suffix(".cxx") {
            extra_sources.push(name.clone());
            extra_libs.push(format!("{stem}.h"));
            extra_libs.push(name.clone());
        } else if name.ends_with(".so") {
            extra_libs.push(name.clone());
        } else if name.ends_with(".par") && !packages.contains(name) {
            packages.push(name.clone());
        }
    }
    for name in &config.sources {
        if !extra_sources.contains(name) {
            extra_sources.push(name.clone());
        }
    }

    GridPlan {
        run_name: mode.grid_run_name().to_string(),
        soft_version: soft_version.to_string(),
        merge_via_jdl: mode.merge_via_jdl(),
        test_input: matches!(mode, RunMode::GridTest).then(|| descriptor.to_string()),
        run_list: manifest.run_list.clone(),
        run_prefix,
        working_dir,
        data_dir: manifest.grid_data_dir.clone(),
        data_pattern: manifest.grid_data_pattern.clone(),
        packages,
        extra_sources,
        extra_libs,
        replicas: 2,
        output_to_run_number: true,
    }
}

/// Framework adapter that hands the serialized request to the configured
/// analysis shell through the process runner. Operates in the current
/// directory, which the submitter has already set to the staged workspace.
pub struct ExecFramework<'a> {
    pub exec: String,
    pub runner: &'a dyn ProcessRunner,
}

impl AnalysisFramework for ExecFramework<'_> {
    fn output_file(&self) -> PathBuf {
        PathBuf::from(COMMON_OUTPUT_FILE)
    }

    fn initialize(&mut self, request: &JobRequest) -> bool {
        let text = match serde_yaml::to_string(request) {
            Ok(text) => text,
            Err(e) => {
                error!("cannot serialize the execution request: {e}");
                return false;
            }
        };
        if let Err(e) = std::fs::write(REQUEST_FILE, text) {
            error!("cannot write {REQUEST_FILE}: {e}");
            return false;
        }
        true
    }

    fn run(&mut self, submode: &str) -> bool {
        let spec = CommandSpec::new(&self.exec)
            .arg(TASK_MANIFEST_FILE)
            .args(["--request", REQUEST_FILE, "--submode", submode]);
        match self.runner.run(&spec) {
            Ok(output) if output.success() => true,
            Ok(output) => {
                error!("{} exited with {}", spec.rendered(), output.status);
                false
            }
            Err(e) => {
                error!("cannot run {}: {e}", spec.rendered());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubmitterSettings;
    use crate::modes::{select, Environment};
    use crate::process::ConfirmationPolicy;
    use std::fs;

    struct RecordingFramework {
        request: Option<JobRequest>,
        submode: Option<String>,
    }

    impl RecordingFramework {
        fn new() -> Self {
            Self {
                request: None,
                submode: None,
            }
        }
    }

    impl AnalysisFramework for RecordingFramework {
        fn output_file(&self) -> PathBuf {
            PathBuf::from(COMMON_OUTPUT_FILE)
        }

        fn initialize(&mut self, request: &JobRequest) -> bool {
            self.request = Some(request.clone());
            true
        }

        fn run(&mut self, submode: &str) -> bool {
            self.submode = Some(submode.to_string());
            true
        }
    }

    fn manifest(format: DataFormat, is_mc: bool) -> InputManifest {
        InputManifest {
            locations: vec!["/x/AliESDs.root".to_string()],
            format,
            is_collection: false,
            period: Some("LHC15o".to_string()),
            pass: Some("pass1".to_string()),
            grid_data_dir: None,
            grid_data_pattern: None,
            is_mc,
            is_embed: false,
            run_list: vec![246392],
        }
    }

    fn local_profile(workdir: &Path) -> ExecutionProfile {
        select(
            RunMode::Local,
            "",
            workdir,
            &SubmitterSettings::default(),
            &Environment::default(),
            &ConfirmationPolicy::AutoAccept,
        )
        .unwrap()
    }

    #[test]
    fn local_esd_job_gets_a_single_esd_handler() {
        let dir = tempfile::tempdir().unwrap();
        let profile = local_profile(dir.path());
        let mut framework = RecordingFramework::new();
        let mut dispatcher = Dispatcher {
            framework: &mut framework,
        };

        let manifest = manifest(DataFormat::Esd, false);
        let outcome = dispatcher
            .dispatch(DispatchContext {
                manifest: &manifest,
                profile: &profile,
                tasks: vec![],
                analysis_options: "",
                specialized: true,
                workspace: dir.path(),
                terminate_only: false,
                grid: None,
            })
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(framework.submode.as_deref(), Some("local"));
        let request = framework.request.unwrap();
        assert_eq!(
            request.handler,
            EventHandler::Esd {
                restrict_branches: true
            }
        );
        assert_eq!(request.mc_truth, None);
        assert_eq!(
            request.input,
            InputObject::Chain(vec!["/x/AliESDs.root".to_string()])
        );
    }

    #[test]
    fn event_mixing_wraps_handlers_into_a_multiplexer() {
        let dir = tempfile::tempdir().unwrap();
        let profile = local_profile(dir.path());
        let mut framework = RecordingFramework::new();
        let mut dispatcher = Dispatcher {
            framework: &mut framework,
        };

        let manifest = manifest(DataFormat::Esd, true);
        dispatcher
            .dispatch(DispatchContext {
                manifest: &manifest,
                profile: &profile,
                tasks: vec![],
                analysis_options: "MIXED",
                specialized: true,
                workspace: dir.path(),
                terminate_only: false,
                grid: None,
            })
            .unwrap();

        let request = framework.request.unwrap();
        assert_eq!(
            request.handler,
            EventHandler::Multi(vec![
                EventHandler::Esd {
                    restrict_branches: true
                },
                EventHandler::McTruth
            ])
        );
        assert_eq!(request.mc_truth, None);
    }

    #[test]
    fn physics_selection_is_on_unless_opted_out() {
        let dir = tempfile::tempdir().unwrap();
        let profile = local_profile(dir.path());
        let manifest = manifest(DataFormat::Esd, false);

        let mut framework = RecordingFramework::new();
        Dispatcher {
            framework: &mut framework,
        }
        .dispatch(DispatchContext {
            manifest: &manifest,
            profile: &profile,
            tasks: vec![],
            analysis_options: "CENTR",
            specialized: true,
            workspace: dir.path(),
            terminate_only: false,
            grid: None,
        })
        .unwrap();
        let request = framework.request.unwrap();
        assert_eq!(request.builtin.len(), 2);

        let mut framework = RecordingFramework::new();
        Dispatcher {
            framework: &mut framework,
        }
        .dispatch(DispatchContext {
            manifest: &manifest,
            profile: &profile,
            tasks: vec![],
            analysis_options: "NOPHYSSEL",
            specialized: true,
            workspace: dir.path(),
            terminate_only: false,
            grid: None,
        })
        .unwrap();
        assert!(framework.request.unwrap().builtin.is_empty());
    }

    #[test]
    fn terminate_without_prior_output_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let profile = local_profile(dir.path());
        let manifest = manifest(DataFormat::Esd, false);
        let mut framework = RecordingFramework::new();
        let mut dispatcher = Dispatcher {
            framework: &mut framework,
        };

        let outcome = dispatcher
            .dispatch(DispatchContext {
                manifest: &manifest,
                profile: &profile,
                tasks: vec![],
                analysis_options: "",
                specialized: true,
                workspace: dir.path(),
                terminate_only: true,
                grid: None,
            })
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::NothingToDo);
        assert!(framework.request.is_none());

        fs::write(dir.path().join(COMMON_OUTPUT_FILE), "results").unwrap();
        let mut framework = RecordingFramework::new();
        let outcome = Dispatcher {
            framework: &mut framework,
        }
        .dispatch(DispatchContext {
            manifest: &manifest,
            profile: &profile,
            tasks: vec![],
            analysis_options: "",
            specialized: true,
            workspace: dir.path(),
            terminate_only: true,
            grid: None,
        })
        .unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(framework.submode.as_deref(), Some("grid terminate"));
    }

    #[test]
    fn grid_plan_derives_workdir_and_run_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("myAnalysis");
        fs::create_dir(&workdir).unwrap();

        let manifest = manifest(DataFormat::Aod, false);
        let mut config = TaskConfig::default();
        config.libraries = vec![
            "libMuonBase.so".to_string(),
            "Helpers.cxx".to_string(),
            "OADB.par".to_string(),
        ];

        let plan = build_grid_plan(
            &manifest,
            RunMode::Grid,
            "vAN-20250101-1",
            &config,
            &SubmitterSettings::default(),
            &workdir,
            "Find;BasePath=/a/;FileName=b.root;",
        );

        assert_eq!(plan.run_name, "full");
        assert!(plan.merge_via_jdl);
        assert_eq!(plan.run_prefix.as_deref(), Some("000"));
        assert_eq!(plan.working_dir.as_deref(), Some("analysis/LHC15o/myAnalysis"));
        assert_eq!(plan.packages, vec!["OADB.par".to_string()]);
        assert_eq!(plan.extra_sources, vec!["Helpers.cxx".to_string()]);
        assert_eq!(
            plan.extra_libs,
            vec![
                "libMuonBase.so".to_string(),
                "Helpers.h".to_string(),
                "Helpers.cxx".to_string(),
            ]
        );
        assert_eq!(plan.replicas, 2);
    }
}
