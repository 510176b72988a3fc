use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// consolidated task-configuration manifest written into the workspace; its
/// presence marks a directory as a staged workspace
pub const TASK_MANIFEST_FILE: &str = "taskconfig.cfg";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("cannot read task configuration {path}")]
    ConfigNotFound {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("module {name} in {path} is missing a macro declaration")]
    MissingMacro { name: String, path: String },
    #[error("directive outside a module in {path}: {line}")]
    StrayDirective { path: String, line: String },
    #[error("cannot read settings {path}")]
    SettingsNotFound {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("settings {path} are malformed")]
    MalformedSettings {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// One analysis module added to the run.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub macro_file: String,
    pub config_macro: Option<String>,
    pub libraries: Vec<String>,
    pub sources: Vec<String>,
    pub args: String,
}

/// Everything declared by the loaded configuration files.
#[derive(Debug, Clone, Default)]
pub struct TaskConfig {
    pub tasks: Vec<Task>,
    /// job-global ordered sets, deduplicated across all tasks and files
    pub libraries: Vec<String>,
    pub sources: Vec<String>,
    pub packages: Vec<String>,
    pub extra_files: Vec<String>,
    /// raw lines of every file, in order, for the consolidated manifest
    pub raw_lines: Vec<String>,
}

/// Merge new names into `list` preserving first-seen order and uniqueness.
pub fn add_objects_dedup<S: AsRef<str>>(list: &mut Vec<String>, new_names: &[S]) {
    for name in new_names {
        let name = name.as_ref();
        if !list.iter().any(|existing| existing == name) {
            list.push(name.to_string());
        }
    }
}

/// Parse one declarative task-configuration file.
///
/// Directive vocabulary (line-prefixed, `#` starts a comment):
/// `module: <name>` opens a module closed by `end`; inside it `macro:`,
/// `cfgmacro:`, `libs:`, `srcs:` and `args:` describe the module. Top-level
/// `libs:`, `srcs:`, `pars:` and `files:` append to the job-global lists.
pub fn load_task_config(path: &Path) -> Result<TaskConfig, ConfigErrors> {
    let text = fs::read_to_string(path).map_err(|source| ConfigErrors::ConfigNotFound {
        path: path.display().to_string(),
        source,
    })?;

    let mut config = TaskConfig::default();
    parse_into(&mut config, &text, path)?;
    Ok(config)
}

/// Load and merge several configuration files in order.
pub fn load_task_configs(paths: &[PathBuf]) -> Result<TaskConfig, ConfigErrors> {
    let mut config = TaskConfig::default();
    for path in paths {
        let text = fs::read_to_string(path).map_err(|source| ConfigErrors::ConfigNotFound {
            path: path.display().to_string(),
            source,
        })?;
        parse_into(&mut config, &text, path)?;
    }
    Ok(config)
}

struct ModuleBuilder {
    name: String,
    macro_file: Option<String>,
    config_macro: Option<String>,
    libraries: Vec<String>,
    sources: Vec<String>,
    args: String,
}

fn parse_into(config: &mut TaskConfig, text: &str, path: &Path) -> Result<(), ConfigErrors> {
    let mut module: Option<ModuleBuilder> = None;

    for raw in text.lines() {
        config.raw_lines.push(raw.to_string());
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = directive(line, "module:") {
            if let Some(open) = module.take() {
                warn!("module {} not closed before {name}: closing it", open.name);
                finish_module(config, open, path)?;
            }
            module = Some(ModuleBuilder {
                name: name.to_string(),
                macro_file: None,
                config_macro: None,
                libraries: Vec::new(),
                sources: Vec::new(),
                args: String::new(),
            });
            continue;
        }

        if line == "end" {
            match module.take() {
                Some(open) => finish_module(config, open, path)?,
                None => warn!("stray end in {}", path.display()),
            }
            continue;
        }

        match &mut module {
            Some(open) => {
                if let Some(value) = directive(line, "macro:") {
                    open.macro_file = Some(value.to_string());
                } else if let Some(value) = directive(line, "cfgmacro:") {
                    open.config_macro = Some(value.to_string());
                } else if let Some(value) = directive(line, "libs:") {
                    add_objects_dedup(&mut open.libraries, &value.split_whitespace().collect_vec());
                } else if let Some(value) = directive(line, "srcs:") {
                    add_objects_dedup(&mut open.sources, &value.split_whitespace().collect_vec());
                } else if let Some(value) = directive(line, "args:") {
                    open.args = value.to_string();
                } else {
                    warn!("unrecognized directive in {}: {line}", path.display());
                }
            }
            None => {
                if let Some(value) = directive(line, "libs:") {
                    add_objects_dedup(&mut config.libraries, &value.split_whitespace().collect_vec());
                } else if let Some(value) = directive(line, "srcs:") {
                    add_objects_dedup(&mut config.sources, &value.split_whitespace().collect_vec());
                } else if let Some(value) = directive(line, "pars:") {
                    add_objects_dedup(&mut config.packages, &value.split_whitespace().collect_vec());
                } else if let Some(value) = directive(line, "files:") {
                    add_objects_dedup(&mut config.extra_files, &value.split_whitespace().collect_vec());
                } else if ["macro:", "cfgmacro:", "args:"]
                    .iter()
                    .any(|prefix| line.starts_with(prefix))
                {
                    return Err(ConfigErrors::StrayDirective {
                        path: path.display().to_string(),
                        line: line.to_string(),
                    });
                } else {
                    warn!("unrecognized line in {}: {line}", path.display());
                }
            }
        }
    }

    if let Some(open) = module.take() {
        warn!("module {} not closed at end of {}", open.name, path.display());
        finish_module(config, open, path)?;
    }

    // package declarations may also appear as bare tokens on library lines
    let par_tokens = config
        .libraries
        .iter()
        .filter(|name| name.ends_with(".par"))
        .cloned()
        .collect_vec();
    add_objects_dedup(&mut config.packages, &par_tokens);

    Ok(())
}

fn finish_module(
    config: &mut TaskConfig,
    module: ModuleBuilder,
    path: &Path,
) -> Result<(), ConfigErrors> {
    let macro_file = module.macro_file.ok_or_else(|| ConfigErrors::MissingMacro {
        name: module.name.clone(),
        path: path.display().to_string(),
    })?;
    debug!(
        "module {}: {} libraries, {} sources",
        module.name,
        module.libraries.len(),
        module.sources.len()
    );

    add_objects_dedup(&mut config.libraries, &module.libraries);
    add_objects_dedup(&mut config.sources, &module.sources);

    config.tasks.push(Task {
        name: module.name,
        macro_file,
        config_macro: module.config_macro,
        libraries: module.libraries,
        sources: module.sources,
        args: module.args,
    });
    Ok(())
}

fn directive<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix).map(str::trim)
}

/// Write an annotated template configuration to get a new analysis started.
pub fn write_template(output_dir: &Path) -> io::Result<PathBuf> {
    let path = output_dir.join("taskconfig.template");
    let template = "\
# Task configuration template.
# One module block per analysis task; top-level declarations are shared.

module: MyTask
macro: AddMyTask.C
cfgmacro: ConfigMyTask.C
libs: libMyAnalysis.so
srcs: MyTaskHelpers.cxx
args: __VAR_ISMC,\"__VAR_PERIOD\",\"__VAR_TASKOPTIONS\"
end

# pars: MyPackage.par
# files: runList.txt
";
    fs::write(&path, template)?;
    Ok(path)
}

fn default_nworkers() -> usize {
    88
}

fn default_build_timeout_secs() -> u64 {
    600
}

fn default_utility_modules() -> Vec<String> {
    ["SetRemoteIO", "BuildEventCuts", "SetupSpecializedTasks"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn default_framework_exec() -> String {
    "anarun".to_string()
}

/// Where the grid working directory name comes from when a period is known.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GridWorkdirFrom {
    /// derive from the local workspace directory name
    #[default]
    Workdir,
    /// use the explicitly declared name
    Declared,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RemoteSettings {
    #[serde(default)]
    pub saf_server: Option<String>,
    #[serde(default)]
    pub saf2_server: Option<String>,
    #[serde(default)]
    pub vaf_tunnel_port: Option<u16>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SubmitterSettings {
    /// build tree used to produce missing package artifacts
    #[serde(default)]
    pub build_dir: Option<PathBuf>,
    /// cap on one package-build invocation
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    /// reference subtree re-packed into the calibration package after a build
    #[serde(default)]
    pub reference_subtree: Option<PathBuf>,
    /// where source files and macros are searched before staging
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// shared utility modules staged only when a task references them
    #[serde(default = "default_utility_modules")]
    pub utility_modules: Vec<String>,
    #[serde(default = "default_nworkers")]
    pub nworkers: usize,
    #[serde(default)]
    pub grid_workdir_from: GridWorkdirFrom,
    #[serde(default)]
    pub grid_workdir_name: Option<String>,
    /// analysis shell invoked by the dispatcher
    #[serde(default = "default_framework_exec")]
    pub framework_exec: String,
    #[serde(default)]
    pub remote: RemoteSettings,
}

impl Default for SubmitterSettings {
    fn default() -> Self {
        Self {
            build_dir: None,
            build_timeout_secs: default_build_timeout_secs(),
            reference_subtree: None,
            search_paths: Vec::new(),
            utility_modules: default_utility_modules(),
            nworkers: default_nworkers(),
            grid_workdir_from: GridWorkdirFrom::default(),
            grid_workdir_name: None,
            framework_exec: default_framework_exec(),
            remote: RemoteSettings::default(),
        }
    }
}

impl SubmitterSettings {
    /// Name component of the derived grid working directory: the declared
    /// name when so configured, the local workspace name otherwise.
    pub fn grid_workdir_component(&self, workdir: &Path) -> String {
        if self.grid_workdir_from == GridWorkdirFrom::Declared {
            if let Some(name) = &self.grid_workdir_name {
                return name.clone();
            }
            warn!("no grid workdir name declared: falling back to the workspace name");
        }
        workdir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "analysis".to_string())
    }

    /// Load settings from an explicit file, or fall back to defaults when no
    /// file was named.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|source| ConfigErrors::SettingsNotFound {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigErrors::MalformedSettings {
            path: path.display().to_string(),
            source,
        })
    }
}
