//! Materializes the local working directory backing local execution or
//! transfer to a remote pool: all resolved sources, packages and utility
//! modules end up side by side with the consolidated task manifest.

use crate::config::{SubmitterSettings, Task, TaskConfig, TASK_MANIFEST_FILE};
use crate::process::{CommandSpec, ConfirmationPolicy, ProcessRunner};
use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// settings snapshot staged next to the manifest so the workspace can
/// self-execute on the remote side
pub const SETTINGS_SNAPSHOT: &str = "submitter.yaml";

#[derive(Error, Debug)]
pub enum StageError {
    #[error("terminate mode requires an existing workspace with prior results at {0}")]
    MissingWorkspace(String),
    #[error("cannot create workspace {path}")]
    WorkspaceCreate {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("package {0} could not be found or built")]
    PackageBuild(String),
    #[error("staging failed")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub struct StagedWorkspace {
    pub path: PathBuf,
    pub copied: BTreeSet<String>,
    pub built_packages: BTreeSet<String>,
}

/// Plain names of the regular files below `dir`.
pub fn listing(dir: &Path) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.path().is_file() {
                names.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    names
}

/// `X.cxx` ships together with `X.h` when the header exists.
fn paired_header(source: &str) -> Option<String> {
    source.strip_suffix(".cxx").map(|stem| format!("{stem}.h"))
}

pub struct Stager<'a> {
    pub settings: &'a SubmitterSettings,
    pub runner: &'a dyn ProcessRunner,
    pub policy: ConfirmationPolicy,
}

impl<'a> Stager<'a> {
    /// Stage `config` into `workdir`. Convergent: staging an already staged
    /// workspace again with the same inputs leaves the same file set.
    pub fn stage(
        &self,
        workdir: &Path,
        config: &TaskConfig,
        terminate_only: bool,
    ) -> Result<StagedWorkspace, StageError> {
        if terminate_only {
            if !workdir.is_dir() {
                return Err(StageError::MissingWorkspace(workdir.display().to_string()));
            }
            return Ok(StagedWorkspace {
                path: workdir.canonicalize()?,
                copied: listing(workdir),
                built_packages: BTreeSet::new(),
            });
        }

        let current = env::current_dir()?;
        if workdir.is_dir() {
            let full = workdir.canonicalize()?;
            if full == current {
                info!("workspace is the current directory: leaving it as is");
                return Ok(StagedWorkspace {
                    path: full,
                    copied: listing(workdir),
                    built_packages: BTreeSet::new(),
                });
            }
            let mut yes_to_all = false;
            if self
                .policy
                .confirm(&format!("rm -rf {}", workdir.display()), &mut yes_to_all)
            {
                fs::remove_dir_all(workdir)?;
            } else {
                warn!("keeping existing {}: staging on top", workdir.display());
            }
        }

        if let Err(source) = fs::create_dir_all(workdir) {
            return Err(StageError::WorkspaceCreate {
                path: workdir.display().to_string(),
                source,
            });
        }
        let workdir = workdir.canonicalize()?;

        self.write_own_definition(&workdir, config)?;

        for source in &config.sources {
            if self.copy_into(&workdir, source).is_none() {
                warn!("cannot find source {source} in the search paths");
                continue;
            }
            if let Some(header) = paired_header(source) {
                if self.copy_into(&workdir, &header).is_none() {
                    debug!("no paired header {header}");
                }
            }
        }

        let mut built_packages = BTreeSet::new();
        for package in &config.packages {
            if self.copy_into(&workdir, package).is_some() {
                continue;
            }
            self.build_package(&workdir, package)?;
            built_packages.insert(package.clone());
        }

        for task in &config.tasks {
            if self.copy_into(&workdir, &task.macro_file).is_none() {
                warn!("cannot find macro {} for task {}", task.macro_file, task.name);
            }
            if let Some(config_macro) = &task.config_macro {
                if self.copy_into(&workdir, config_macro).is_none() {
                    warn!(
                        "cannot find configuration macro {config_macro} for task {}",
                        task.name
                    );
                }
            }
        }

        self.stage_used_utilities(&workdir, &config.tasks)?;

        for file in &config.extra_files {
            if self.copy_into(&workdir, file).is_none() {
                warn!("cannot find additional file {file}");
            }
        }

        Ok(StagedWorkspace {
            copied: listing(&workdir),
            path: workdir,
            built_packages,
        })
    }

    /// The staged copy must be able to self-execute remotely: the
    /// consolidated task manifest plus the settings snapshot describe it.
    fn write_own_definition(&self, workdir: &Path, config: &TaskConfig) -> Result<(), StageError> {
        let mut manifest = config.raw_lines.join("\n");
        manifest.push('\n');
        fs::write(workdir.join(TASK_MANIFEST_FILE), manifest)?;

        let snapshot = serde_yaml::to_string(self.settings)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(workdir.join(SETTINGS_SNAPSHOT), snapshot)?;
        Ok(())
    }

    /// Copy the first hit for `name` across the search paths into the
    /// workspace; returns the staged file name.
    fn copy_into(&self, workdir: &Path, name: &str) -> Option<String> {
        let file_name = Path::new(name).file_name()?.to_string_lossy().into_owned();
        for candidate in self.candidates(name) {
            if candidate.is_file() {
                let target = workdir.join(&file_name);
                if candidate.canonicalize().ok() == target.canonicalize().ok() {
                    return Some(file_name);
                }
                match fs::copy(&candidate, &target) {
                    Ok(_) => return Some(file_name),
                    Err(e) => warn!("cannot copy {}: {e}", candidate.display()),
                }
            }
        }
        None
    }

    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .settings
            .search_paths
            .iter()
            .map(|dir| dir.join(name))
            .collect();
        if let Ok(current) = env::current_dir() {
            paths.push(current.join(name));
        }
        paths.push(PathBuf::from(name));
        paths
    }

    /// Build a missing package artifact from the configured build tree and
    /// move it into the workspace, re-packing the calibration package with
    /// the reference subtree when one is configured.
    fn build_package(&self, workdir: &Path, package: &str) -> Result<(), StageError> {
        let Some(build_dir) = &self.settings.build_dir else {
            return Err(StageError::PackageBuild(package.to_string()));
        };

        info!("building {package} in {}", build_dir.display());
        let build = CommandSpec::new("make")
            .arg(package)
            .cwd(build_dir.clone())
            .timeout(Duration::from_secs(self.settings.build_timeout_secs));
        match self.runner.run(&build) {
            Ok(output) if output.success() => {}
            Ok(output) => {
                warn!("build of {package} exited with {}", output.status);
                if !output.stdout.is_empty() {
                    debug!("build output: {}", output.stdout.trim_end());
                }
                return Err(StageError::PackageBuild(package.to_string()));
            }
            Err(e) => {
                warn!("cannot run the build tool for {package}: {e}");
                return Err(StageError::PackageBuild(package.to_string()));
            }
        }

        let mut found = None;
        for entry in WalkBuilder::new(build_dir).build().flatten() {
            if entry.file_name().to_string_lossy() == package && entry.path().is_file() {
                found = Some(entry.path().to_path_buf());
                break;
            }
        }
        let Some(artifact) = found else {
            return Err(StageError::PackageBuild(package.to_string()));
        };
        fs::copy(&artifact, workdir.join(package))?;

        // the calibration package ships only sources; the objects it reads at
        // run time must be packed in from the reference subtree
        if package.contains("OADB") {
            if let Some(reference) = &self.settings.reference_subtree {
                self.repack_with_reference(workdir, package, reference)?;
            }
        }

        if workdir.join(package).is_file() {
            Ok(())
        } else {
            Err(StageError::PackageBuild(package.to_string()))
        }
    }

    fn repack_with_reference(
        &self,
        workdir: &Path,
        package: &str,
        reference: &Path,
    ) -> Result<(), StageError> {
        let stem = package.trim_end_matches(".par");
        let steps = [
            CommandSpec::new("tar")
                .args(["-xzf", package])
                .cwd(workdir.to_path_buf()),
            CommandSpec::new("rsync")
                .args([
                    "-au".to_string(),
                    "--exclude=.svn".to_string(),
                    format!("--exclude=PROOF-INF.{stem}"),
                    format!("{}/", reference.display()),
                    format!("{stem}/"),
                ])
                .cwd(workdir.to_path_buf()),
            CommandSpec::new("tar")
                .args(["-czf", package, stem])
                .cwd(workdir.to_path_buf()),
        ];
        for step in steps {
            match self.runner.run(&step) {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    warn!("re-pack step {} exited with {}", step.rendered(), output.status);
                    return Err(StageError::PackageBuild(package.to_string()));
                }
                Err(e) => {
                    warn!("re-pack step {} failed: {e}", step.rendered());
                    return Err(StageError::PackageBuild(package.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Utility modules are staged only when some task body references them,
    /// keeping the deployed workspace minimal.
    fn stage_used_utilities(&self, workdir: &Path, tasks: &[Task]) -> Result<(), StageError> {
        let mut bodies = Vec::new();
        for task in tasks {
            for name in [Some(&task.macro_file), task.config_macro.as_ref()]
                .into_iter()
                .flatten()
            {
                if let Some(file_name) = Path::new(name).file_name() {
                    let staged = workdir.join(file_name);
                    if let Ok(text) = fs::read_to_string(&staged) {
                        bodies.push(text);
                    }
                }
            }
            bodies.push(task.args.clone());
        }

        for module in &self.settings.utility_modules {
            let used = bodies.iter().any(|body| body.contains(module.as_str()));
            if !used {
                debug!("utility module {module} not referenced: not staged");
                continue;
            }
            let file = format!("{module}.C");
            if self.copy_into(workdir, &file).is_none() {
                warn!("cannot find utility module {file}");
            }
        }
        Ok(())
    }
}
