//! Run-mode state machine: maps the closed run-mode set plus the option
//! string and an environment probe onto a fully parameterized execution
//! profile, before any side effect happens.

use crate::config::SubmitterSettings;
use crate::process::ConfirmationPolicy;
use chrono::{Days, Utc};
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// environment variable queried for the remote pool identity
pub const USER_ENV: &str = "GRID_USER";

/// directory on the remote pool that receives the synchronized workspace
pub const POD_OUT_DIR: &str = "taskdir";

#[derive(Error, Debug)]
pub enum ModeError {
    #[error(
        "unrecognized run mode {0} (expected: local localterminate grid gridtest gridmerge gridterminate prooflite saf saf2 vaf)"
    )]
    UnknownRunMode(String),
    #[error("mode {mode} requires an existing workspace with prior results at {path}")]
    MissingWorkspace { mode: String, path: String },
    #[error("no remote user identity found: set {USER_ENV} or run interactively")]
    MissingCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Local,
    LocalTerminate,
    Grid,
    GridTest,
    GridMerge,
    GridTerminate,
    ProofLite,
    RemoteSaf,
    RemoteSaf2,
    RemoteVaf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Local,
    Grid,
    Proof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubMode {
    Test,
    Full,
    Merge,
}

impl RunMode {
    pub fn parse(name: &str) -> Result<Self, ModeError> {
        match name.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "localterminate" | "terminateonly" => Ok(Self::LocalTerminate),
            "grid" | "gridfull" => Ok(Self::Grid),
            "gridtest" => Ok(Self::GridTest),
            "gridmerge" => Ok(Self::GridMerge),
            "gridterminate" => Ok(Self::GridTerminate),
            "prooflite" => Ok(Self::ProofLite),
            "saf" => Ok(Self::RemoteSaf),
            "saf2" => Ok(Self::RemoteSaf2),
            "vaf" => Ok(Self::RemoteVaf),
            _ => Err(ModeError::UnknownRunMode(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::LocalTerminate => "localterminate",
            Self::Grid => "grid",
            Self::GridTest => "gridtest",
            Self::GridMerge => "gridmerge",
            Self::GridTerminate => "gridterminate",
            Self::ProofLite => "prooflite",
            Self::RemoteSaf => "saf",
            Self::RemoteSaf2 => "saf2",
            Self::RemoteVaf => "vaf",
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Self::Local | Self::LocalTerminate => Family::Local,
            Self::Grid | Self::GridTest | Self::GridMerge | Self::GridTerminate => Family::Grid,
            Self::ProofLite | Self::RemoteSaf | Self::RemoteSaf2 | Self::RemoteVaf => Family::Proof,
        }
    }

    pub fn submode(&self) -> SubMode {
        match self {
            Self::GridTest | Self::ProofLite => SubMode::Test,
            Self::GridMerge | Self::GridTerminate => SubMode::Merge,
            _ => SubMode::Full,
        }
    }

    /// run-mode name handed to the grid plugin
    pub fn grid_run_name(&self) -> &'static str {
        match self {
            Self::GridTest => "test",
            Self::GridMerge => "merge",
            Self::GridTerminate => "terminate",
            _ => "full",
        }
    }

    /// terminate-only: reuse a prior workspace, no grid interaction
    pub fn is_terminate_only(&self) -> bool {
        matches!(self, Self::LocalTerminate)
    }

    /// the terminate re-merge step goes through JDL except in grid terminate
    pub fn merge_via_jdl(&self) -> bool {
        self.family() == Family::Grid && !matches!(self, Self::GridTerminate)
    }
}

/// Pod-style remote transport, bound per profile; the structured pieces are
/// executed through the process runner, only `exec_line` stays a shell string
/// because the remote side interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAccess {
    pub server: String,
    pub copy_program: String,
    pub copy_args: Vec<String>,
    pub open_program: String,
    pub open_args: Vec<String>,
    pub exec_line: String,
    pub dataset_mode: String,
    pub out_dir: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionProfile {
    pub mode: RunMode,
    /// interactive-pool connection string; empty outside the proof family
    pub cluster: String,
    /// present only for the pod-style remote variants
    pub remote: Option<RemoteAccess>,
    pub nworkers: usize,
    pub resume: bool,
    pub split_per_run: bool,
    pub user: Option<String>,
    pub on_pod_machine: bool,
}

impl ExecutionProfile {
    pub fn is_pod(&self) -> bool {
        self.remote.is_some()
    }
}

/// What the selector probes from the surrounding process environment.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub hostname: String,
    pub user: Option<String>,
    pub on_pod_flag: bool,
}

impl Environment {
    pub fn probe(on_pod_flag: bool) -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            hostname,
            user: env::var(USER_ENV).ok(),
            on_pod_flag,
        }
    }
}

/// Build the execution profile for `mode`. Every configuration failure
/// (unknown mode, missing credential, missing terminate workspace) surfaces
/// here, before any side effect.
pub fn select(
    mode: RunMode,
    analysis_options: &str,
    workdir: &Path,
    settings: &SubmitterSettings,
    env: &Environment,
    policy: &ConfirmationPolicy,
) -> Result<ExecutionProfile, ModeError> {
    if mode.is_terminate_only() && !workdir.is_dir() {
        return Err(ModeError::MissingWorkspace {
            mode: mode.name().to_string(),
            path: workdir.display().to_string(),
        });
    }

    let options = analysis_options.to_uppercase();
    let nworkers = parse_nworkers(&options).unwrap_or(settings.nworkers);
    let resume = options.contains("RESUME");
    let split_per_run = options.contains("SPLIT");

    let mut profile = ExecutionProfile {
        mode,
        cluster: String::new(),
        remote: None,
        nworkers,
        resume,
        split_per_run,
        user: env.user.clone(),
        on_pod_machine: env.on_pod_flag,
    };

    match mode {
        RunMode::Local
        | RunMode::LocalTerminate
        | RunMode::Grid
        | RunMode::GridTest
        | RunMode::GridMerge
        | RunMode::GridTerminate => {}
        RunMode::ProofLite => {
            profile.cluster = String::new();
            profile.on_pod_machine = true;
        }
        RunMode::RemoteSaf2 => {
            let server = settings
                .remote
                .saf2_server
                .clone()
                .unwrap_or_else(|| "nansafmaster2.in2p3.fr".to_string());
            profile.cluster = match &profile.user {
                Some(user) => format!("{user}@{server}"),
                None => server.clone(),
            };
            profile.on_pod_machine |= env.hostname == server;
        }
        RunMode::RemoteSaf => {
            let user = resolve_user(env, policy)?;
            let server = settings
                .remote
                .saf_server
                .clone()
                .unwrap_or_else(|| "nansafmaster3.in2p3.fr".to_string());
            profile.cluster = "pod://".to_string();
            profile.remote = Some(RemoteAccess {
                server: server.clone(),
                copy_program: "rsync".to_string(),
                copy_args: vec![
                    "-avcL".to_string(),
                    "-e".to_string(),
                    "gsissh -p 1975".to_string(),
                ],
                open_program: "gsissh".to_string(),
                open_args: vec![
                    "-p".to_string(),
                    "1975".to_string(),
                    "-t".to_string(),
                    server.clone(),
                ],
                exec_line: format!(
                    "/opt/SAF3/bin/saf3-enter \"\" \"{POD_OUT_DIR}/run_pod.sh {nworkers}\""
                ),
                dataset_mode: "cache".to_string(),
                out_dir: POD_OUT_DIR.to_string(),
            });
            profile.user = Some(user);
            profile.on_pod_machine |= is_pool_host(&env.hostname, &server);
        }
        RunMode::RemoteVaf => {
            let user = resolve_user(env, policy)?;
            let port = settings.remote.vaf_tunnel_port.unwrap_or(5501);
            let server = "localhost".to_string();
            profile.cluster = "pod://".to_string();
            profile.remote = Some(RemoteAccess {
                server: server.clone(),
                copy_program: "rsync".to_string(),
                copy_args: vec![
                    "-avcL".to_string(),
                    "-e".to_string(),
                    format!("ssh -p {port}"),
                ],
                open_program: "ssh".to_string(),
                open_args: vec![
                    format!("{user}@{server}"),
                    "-p".to_string(),
                    port.to_string(),
                    "-t".to_string(),
                ],
                exec_line: format!("echo \"{POD_OUT_DIR}/run_pod.sh {nworkers}\" | /usr/bin/vaf-enter"),
                dataset_mode: "remote".to_string(),
                out_dir: POD_OUT_DIR.to_string(),
            });
            profile.user = Some(user);
            profile.on_pod_machine |= is_pool_host(&env.hostname, &server);
        }
    }

    debug!(
        "selected {} (workers {}, resume {})",
        profile.mode.name(),
        profile.nworkers,
        profile.resume
    );
    Ok(profile)
}

/// The generated pool launcher re-invokes this same submitter, so running the
/// remote path from the pool machine itself would recurse forever.
fn is_pool_host(hostname: &str, server: &str) -> bool {
    hostname == server || hostname.starts_with("alivaf")
}

fn resolve_user(env: &Environment, policy: &ConfirmationPolicy) -> Result<String, ModeError> {
    if let Some(user) = &env.user {
        return Ok(user.clone());
    }
    policy
        .solicit("remote pool user name")
        .ok_or(ModeError::MissingCredential)
}

fn parse_nworkers(options: &str) -> Option<usize> {
    let idx = options.find("NWORKERS=")?;
    let digits: String = options[idx + "NWORKERS=".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match digits.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring malformed worker count in {options}");
            None
        }
    }
}

/// Explicit software version, or a dated default from yesterday's tag.
pub fn soft_version(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    let today = Utc::now().date_naive();
    let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
    format!("vAN-{}-1", yesterday.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubmitterSettings;

    fn env_with(hostname: &str, user: Option<&str>) -> Environment {
        Environment {
            hostname: hostname.to_string(),
            user: user.map(String::from),
            on_pod_flag: false,
        }
    }

    #[test]
    fn run_mode_names_round_trip() {
        for name in [
            "local",
            "localterminate",
            "grid",
            "gridtest",
            "gridmerge",
            "gridterminate",
            "prooflite",
            "saf",
            "saf2",
            "vaf",
        ] {
            assert_eq!(RunMode::parse(name).unwrap().name(), name);
        }
        assert!(matches!(
            RunMode::parse("cloud"),
            Err(ModeError::UnknownRunMode(_))
        ));
    }

    #[test]
    fn submodes_follow_the_mode_table() {
        assert_eq!(RunMode::GridTest.submode(), SubMode::Test);
        assert_eq!(RunMode::ProofLite.submode(), SubMode::Test);
        assert_eq!(RunMode::GridMerge.submode(), SubMode::Merge);
        assert_eq!(RunMode::GridTerminate.submode(), SubMode::Merge);
        assert_eq!(RunMode::Grid.submode(), SubMode::Full);
        assert_eq!(RunMode::RemoteSaf.submode(), SubMode::Full);
        assert!(RunMode::Grid.merge_via_jdl());
        assert!(!RunMode::GridTerminate.merge_via_jdl());
        assert!(!RunMode::Local.merge_via_jdl());
    }

    #[test]
    fn local_terminate_requires_an_existing_workspace() {
        let settings = SubmitterSettings::default();
        let env = env_with("desktop", None);

        let missing = Path::new("/no/such/workdir");
        assert!(matches!(
            select(
                RunMode::LocalTerminate,
                "",
                missing,
                &settings,
                &env,
                &ConfirmationPolicy::AutoAccept
            ),
            Err(ModeError::MissingWorkspace { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        let profile = select(
            RunMode::LocalTerminate,
            "",
            dir.path(),
            &settings,
            &env,
            &ConfirmationPolicy::AutoAccept,
        )
        .unwrap();
        assert!(profile.remote.is_none());
        assert!(profile.cluster.is_empty());
    }

    #[test]
    fn vaf_without_identity_fails_before_any_side_effect() {
        let settings = SubmitterSettings::default();
        let dir = tempfile::tempdir().unwrap();
        let result = select(
            RunMode::RemoteVaf,
            "",
            dir.path(),
            &settings,
            &env_with("desktop", None),
            &ConfirmationPolicy::AutoAccept,
        );
        assert!(matches!(result, Err(ModeError::MissingCredential)));
    }

    #[test]
    fn saf_profile_binds_the_pod_transport() {
        let settings = SubmitterSettings::default();
        let dir = tempfile::tempdir().unwrap();
        let profile = select(
            RunMode::RemoteSaf,
            "NWORKERS=24 RESUME",
            dir.path(),
            &settings,
            &env_with("desktop", Some("aliprod")),
            &ConfirmationPolicy::AutoAccept,
        )
        .unwrap();

        assert_eq!(profile.cluster, "pod://");
        assert_eq!(profile.nworkers, 24);
        assert!(profile.resume);
        assert!(!profile.on_pod_machine);

        let remote = profile.remote.unwrap();
        assert_eq!(remote.server, "nansafmaster3.in2p3.fr");
        assert_eq!(remote.copy_program, "rsync");
        assert_eq!(remote.copy_args[2], "gsissh -p 1975");
        assert_eq!(remote.dataset_mode, "cache");
        assert!(remote.exec_line.contains("run_pod.sh 24"));
    }

    #[test]
    fn pool_hostname_marks_the_pod_machine() {
        let settings = SubmitterSettings::default();
        let dir = tempfile::tempdir().unwrap();
        let profile = select(
            RunMode::RemoteSaf,
            "",
            dir.path(),
            &settings,
            &env_with("nansafmaster3.in2p3.fr", Some("aliprod")),
            &ConfirmationPolicy::AutoAccept,
        )
        .unwrap();
        assert!(profile.on_pod_machine);

        let profile = select(
            RunMode::RemoteVaf,
            "",
            dir.path(),
            &settings,
            &env_with("alivaf-003", Some("aliprod")),
            &ConfirmationPolicy::AutoAccept,
        )
        .unwrap();
        assert!(profile.on_pod_machine);
    }

    #[test]
    fn soft_version_defaults_to_a_dated_tag() {
        assert_eq!(soft_version("vAN-20250101-1"), "vAN-20250101-1");
        let derived = soft_version("");
        assert!(derived.starts_with("vAN-"));
        assert!(derived.ends_with("-1"));
        assert_eq!(derived.len(), "vAN-20250101-1".len());
    }
}
