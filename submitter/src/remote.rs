//! Executes a staged workspace on a remote pool: synchronize, open a remote
//! session that triggers the pool launcher, then pull the results back.
//! Fail-fast: a failed step aborts the rest, artifacts already retrieved are
//! left in place.

use crate::modes::RemoteAccess;
use crate::process::{CommandSpec, ProcessRunner};
use globset::GlobBuilder;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// launcher script staged into pod workspaces
pub const POD_LAUNCHER_FILE: &str = "run_pod.sh";

/// volatile or generated artifacts never synchronized to the pool
pub const SYNC_EXCLUDES: &[&str] = &[
    "*/",
    "*.log",
    "outputs_valid",
    "*.xml",
    "*.jdl",
    "plugin_test_copy",
    "*.so",
    "*.d",
];

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("remote execution failed (exit {status}): {command}")]
    RemoteExecution { command: String, status: i32 },
    #[error("output retrieval failed (exit {status}): {command}")]
    RemoteRetrieval { command: String, status: i32 },
    #[error("remote transport error")]
    Transport(#[from] io::Error),
}

pub struct RemoteRunner<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub soft_version: String,
}

impl RemoteRunner<'_> {
    /// Synchronize, execute remotely, retrieve. `resume` keeps prior remote
    /// state and must converge to the same remote content as a fresh sync.
    pub fn run(
        &self,
        access: &RemoteAccess,
        resume: bool,
        workspace: &Path,
    ) -> Result<(), RemoteError> {
        let remote_dir = format!("{}:{}", access.server, access.out_dir);

        let sync_opt = if resume { "--delete" } else { "--delete-excluded" };
        let mut sync = CommandSpec::new(&access.copy_program)
            .args(access.copy_args.iter().cloned())
            .arg(sync_opt);
        for pattern in SYNC_EXCLUDES {
            sync = sync.arg(format!("--exclude={pattern}"));
        }
        sync = sync
            .arg("./")
            .arg(format!("{remote_dir}/"))
            .cwd(workspace.to_path_buf());
        self.step(sync, false)?;

        // the remote session first pins the pool software version, then
        // triggers the launcher
        let payload = format!("{}; {}", self.version_update(), access.exec_line);
        let open = CommandSpec::new(&access.open_program)
            .args(access.open_args.iter().cloned())
            .arg(payload);
        self.step(open, false)?;

        let retrieve = CommandSpec::new(&access.copy_program)
            .args(access.copy_args.iter().cloned())
            .arg(format!("{remote_dir}/*.root"))
            .arg("./")
            .cwd(workspace.to_path_buf());
        self.step(retrieve, true)?;

        info!(
            "retrieved {} result artifacts from {remote_dir}",
            count_results(workspace)
        );
        Ok(())
    }

    fn step(&self, spec: CommandSpec, retrieval: bool) -> Result<(), RemoteError> {
        let rendered = spec.rendered();
        info!("executing: {rendered}");
        let output = self.runner.run(&spec)?;
        if output.success() {
            return Ok(());
        }
        if !output.stderr.is_empty() {
            warn!("{rendered}: {}", output.stderr.trim_end());
        }
        if retrieval {
            Err(RemoteError::RemoteRetrieval {
                command: rendered,
                status: output.status,
            })
        } else {
            Err(RemoteError::RemoteExecution {
                command: rendered,
                status: output.status,
            })
        }
    }

    fn version_update(&self) -> String {
        format!(
            "sed -i \"s/VafSoftVersion=.*/VafSoftVersion={}/\" .vaf/vaf.conf",
            self.soft_version
        )
    }
}

fn count_results(workspace: &Path) -> usize {
    let matcher = match GlobBuilder::new("*.root").build() {
        Ok(glob) => glob.compile_matcher(),
        Err(_) => return 0,
    };
    fs::read_dir(workspace)
        .map(|entries| {
            entries
                .flatten()
                .filter(|entry| matcher.is_match(entry.file_name().to_string_lossy().as_ref()))
                .count()
        })
        .unwrap_or(0)
}

/// Write the pool launcher: request the worker allocation, enter the remote
/// output directory, re-invoke this submitter with the original run
/// parameters and the on-pod flag set, release the allocation.
pub fn write_pod_launcher(
    workdir: &Path,
    out_dir: &str,
    nworkers: usize,
    dataset_name: &str,
    rerun_args: &str,
    split_per_run: bool,
    merge_exec: &str,
) -> io::Result<PathBuf> {
    let submitter = env!("CARGO_PKG_NAME");
    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    script.push_str(&format!("nworkers=${{1-{nworkers}}}\n"));
    script.push_str("vafctl start\n");
    script.push_str("vafreq $nworkers\n");
    script.push_str("vafwait $nworkers\n");
    script.push_str(&format!("export TASKDIR=\"$HOME/{out_dir}\"\n"));
    script.push_str("cd \"$TASKDIR\"\n");

    if split_per_run {
        script.push_str(&format!(
            "filelist=$(find . -maxdepth 1 -type f ! -name {dataset_name} | xargs)\n"
        ));
        script.push_str("while read -r line; do\n");
        script.push_str(
            "  runnum=$(echo \"$line\" | grep -oE '[0-9][0-9][0-9][1-9][0-9][0-9][0-9][0-9][0-9]' | xargs)\n",
        );
        script.push_str("  if [ -z \"$runnum\" ]; then\n");
        script.push_str(
            "    runnum=$(echo \"$line\" | grep -oE '[1-9][0-9][0-9][0-9][0-9][0-9]' | xargs)\n",
        );
        script.push_str("  fi\n");
        script.push_str("  if [ -z \"$runnum\" ]; then\n");
        script.push_str("    echo \"cannot find a run number in $line\"\n");
        script.push_str("    continue\n");
        script.push_str("  elif [ -e \"$runnum\" ]; then\n");
        script.push_str("    echo \"run $runnum already processed: skip\"\n");
        script.push_str("    continue\n");
        script.push_str("  fi\n");
        script.push_str("  echo \"analysing run $runnum\"\n");
        script.push_str("  mkdir \"$runnum\"\n");
        script.push_str("  cd \"$runnum\"\n");
        script.push_str("  for f in $filelist; do ln -s ../$f; done\n");
        script.push_str(&format!("  echo \"$line\" > {dataset_name}\n"));
        script.push_str(&format!("  {submitter} run {rerun_args} --on-pod\n"));
        script.push_str("  cd \"$TASKDIR\"\n");
        script.push_str(&format!("done < {dataset_name}\n"));
        script.push_str(
            "outnames=$(find $PWD/*/ -type f -name \"*.root\" -exec basename {} \\; | sort -u | xargs)\n",
        );
        script.push_str("for f in $outnames; do\n");
        script.push_str("  find $PWD/*/ -name \"$f\" > merge_list.txt\n");
        script.push_str(&format!("  {merge_exec} --merge \"$f\" merge_list.txt\n"));
        script.push_str("  rm merge_list.txt\n");
        script.push_str("done\n");
    } else {
        script.push_str(&format!("{submitter} run {rerun_args} --on-pod\n"));
    }

    script.push_str("vafctl stop\n");
    script.push_str("exit\n");

    let path = workdir.join(POD_LAUNCHER_FILE);
    fs::write(&path, script)?;
    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms)?;
    Ok(path)
}
