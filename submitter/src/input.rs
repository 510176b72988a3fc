use crate::pattern;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// canonical manifest of resolved input locations, kept in the workspace so
/// long remote jobs can be restarted without re-deriving it
pub const MANIFEST_FILE: &str = "dataset.txt";

/// marker object name probed for inside a labeled collection file
const COLLECTION_MARKER: &[u8] = b"dataset";

/// prefix of the remote-query grammar (`Find;BasePath=...;FileName=...`)
pub const REMOTE_QUERY_PREFIX: &str = "Find;";

#[derive(Error, Debug)]
pub enum InputError {
    #[error(
        "input {0} must be a local file or a remote query in the form Find;BasePath=...;FileName=..."
    )]
    InvalidInput(String),
    #[error("cannot determine whether {0} holds ESD or AOD data")]
    AmbiguousFormat(String),
    #[error("cannot read input list {path}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// The two supported event-data formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Esd,
    Aod,
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Esd => write!(f, "ESD"),
            Self::Aod => write!(f, "AOD"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputManifest {
    pub locations: Vec<String>,
    pub format: DataFormat,
    pub is_collection: bool,
    pub period: Option<String>,
    pub pass: Option<String>,
    pub grid_data_dir: Option<String>,
    pub grid_data_pattern: Option<String>,
    pub is_mc: bool,
    pub is_embed: bool,
    pub run_list: Vec<i32>,
}

/// Resolve a raw input descriptor plus its option string into a manifest.
///
/// A descriptor naming an existing `.root` file is a single input (possibly a
/// labeled collection); any other existing file is a newline-delimited list
/// read verbatim; anything else must match the remote-query grammar.
pub fn resolve(
    descriptor: &str,
    options: &str,
    wants_grid: bool,
) -> Result<InputManifest, InputError> {
    let path = Path::new(descriptor);
    let mut is_collection = false;

    let locations = if path.is_file() {
        if descriptor.ends_with(".root") {
            is_collection = probe_collection(path);
            vec![descriptor.to_string()]
        } else {
            let text = fs::read_to_string(path).map_err(|source| InputError::Unreadable {
                path: descriptor.to_string(),
                source,
            })?;
            text.lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| line.to_string())
                .collect()
        }
    } else if descriptor.starts_with(REMOTE_QUERY_PREFIX) {
        vec![descriptor.to_string()]
    } else {
        return Err(InputError::InvalidInput(descriptor.to_string()));
    };

    if locations.is_empty() {
        return Err(InputError::InvalidInput(descriptor.to_string()));
    }

    let first = locations[0].clone();

    let format = if options.contains("ESD") {
        DataFormat::Esd
    } else if options.contains("AOD") {
        DataFormat::Aod
    } else if first.contains("AliESDs") {
        DataFormat::Esd
    } else if first.contains("AliAOD") {
        DataFormat::Aod
    } else {
        return Err(InputError::AmbiguousFormat(first));
    };

    let period = pattern::period(options).or_else(|| pattern::period(&first));
    if period.is_none() {
        warn!("cannot determine period from {options:?} or {first}");
    }
    let pass = pattern::pass(options).or_else(|| pattern::pass(&first));
    if pass.is_none() {
        warn!("cannot determine pass from {options:?} or {first}");
    }

    let run_list: Vec<i32> = locations
        .iter()
        .filter_map(|location| pattern::run_number_value(location))
        .collect();

    let (grid_data_dir, grid_data_pattern) = if wants_grid {
        let dir = pattern::grid_data_dir(&first);
        let file_pattern = pattern::grid_data_pattern(&first);
        if dir.is_none() {
            warn!("cannot find BasePath in {first}");
        }
        if file_pattern.is_none() {
            warn!("cannot find FileName in {first}");
        }
        (dir, file_pattern)
    } else {
        (None, None)
    };

    Ok(InputManifest {
        locations,
        format,
        is_collection,
        period,
        pass,
        grid_data_dir,
        grid_data_pattern,
        is_mc: options.contains("MC"),
        is_embed: options.contains("EMBED"),
        run_list,
    })
}

/// Persist the resolved list to the canonical manifest file, skipping the
/// write when the resolved input is already that very file.
pub fn write_manifest(
    manifest: &InputManifest,
    descriptor: &str,
    dir: &Path,
) -> io::Result<std::path::PathBuf> {
    let target = dir.join(MANIFEST_FILE);
    let source = Path::new(descriptor);
    if source.is_file() {
        if let (Ok(src), Ok(dst)) = (source.canonicalize(), target.canonicalize()) {
            if src == dst {
                return Ok(target);
            }
        }
    }

    let mut text = manifest.locations.join("\n");
    text.push('\n');
    fs::write(&target, text)?;
    Ok(target)
}

/// Stage the dataset into a pod workspace: a single `.root` input is copied
/// in as `dataset.root`, everything else becomes `dataset.txt` with every
/// remote-query line rewritten to the profile's dataset mode.
pub fn stage_dataset(
    manifest: &InputManifest,
    workdir: &Path,
    dataset_mode: &str,
) -> io::Result<String> {
    if manifest.locations.len() == 1 && manifest.locations[0].ends_with(".root") {
        let source = Path::new(&manifest.locations[0]);
        if source.is_file() {
            fs::copy(source, workdir.join("dataset.root"))?;
            return Ok("dataset.root".to_string());
        }
    }

    let mut lines = Vec::with_capacity(manifest.locations.len());
    for location in &manifest.locations {
        if location.contains(REMOTE_QUERY_PREFIX) {
            lines.push(rewrite_dataset_mode(location, dataset_mode));
        } else {
            lines.push(location.clone());
        }
    }
    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(workdir.join(MANIFEST_FILE), text)?;
    Ok(MANIFEST_FILE.to_string())
}

/// Name of the dataset file previously staged into `dir`, if any.
/// Used when the submitter finds itself re-invoked on the pool machine.
pub fn staged_dataset_name(dir: &Path) -> Option<String> {
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("dataset.") {
            info!("found staged dataset {name}");
            return Some(name);
        }
    }
    None
}

fn rewrite_dataset_mode(line: &str, mode: &str) -> String {
    let mut out = match line.find("Mode=") {
        Some(idx) => {
            let start = idx + "Mode=".len();
            let end = line[start..]
                .find(';')
                .map(|offset| start + offset)
                .unwrap_or(line.len());
            format!("{}{}{}", &line[..start], mode, &line[end..])
        }
        None => format!("{line};Mode={mode};"),
    };
    out = out.replace("Mode=;", "");
    while out.contains(";;") {
        out = out.replace(";;", ";");
    }
    out
}

fn probe_collection(path: &Path) -> bool {
    let mut head = [0u8; 64 * 1024];
    let read = match fs::File::open(path).and_then(|mut file| file.read(&mut head)) {
        Ok(read) => read,
        Err(e) => {
            warn!("cannot probe {} for a collection marker: {e}", path.display());
            return false;
        }
    };
    head[..read]
        .windows(COLLECTION_MARKER.len())
        .any(|window| window == COLLECTION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn list_file_resolves_in_order_with_inferred_format() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("inputs.txt");
        let mut file = fs::File::create(&list).unwrap();
        writeln!(file, "/x/AliESDs.root").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "/y/AliESDs.root").unwrap();

        let manifest = resolve(list.to_str().unwrap(), "", false).unwrap();
        assert_eq!(manifest.format, DataFormat::Esd);
        assert_eq!(
            manifest.locations,
            vec!["/x/AliESDs.root".to_string(), "/y/AliESDs.root".to_string()]
        );
        assert!(!manifest.is_mc);
        assert!(!manifest.is_embed);
    }

    #[test]
    fn explicit_format_option_wins_over_content() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("inputs.txt");
        fs::write(&list, "/x/AliESDs.root\n").unwrap();

        let manifest = resolve(list.to_str().unwrap(), "AOD MC", false).unwrap();
        assert_eq!(manifest.format, DataFormat::Aod);
        assert!(manifest.is_mc);
    }

    #[test]
    fn undetectable_format_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("inputs.txt");
        fs::write(&list, "/x/somefile.root\n").unwrap();

        match resolve(list.to_str().unwrap(), "", false) {
            Err(InputError::AmbiguousFormat(name)) => assert_eq!(name, "/x/somefile.root"),
            other => panic!("expected AmbiguousFormat, got {other:?}"),
        }
    }

    #[test]
    fn missing_path_must_match_remote_query_grammar() {
        match resolve("/no/such/file.txt", "", false) {
            Err(InputError::InvalidInput(name)) => assert_eq!(name, "/no/such/file.txt"),
            other => panic!("expected InvalidInput, got {other:?}"),
        }

        let query = "Find;BasePath=/alice/data/2015/LHC15o/000246392/pass1/;FileName=AliESDs.root;";
        let manifest = resolve(query, "", true).unwrap();
        assert_eq!(manifest.format, DataFormat::Esd);
        assert_eq!(
            manifest.grid_data_dir.as_deref(),
            Some("/alice/data/2015/LHC15o")
        );
        assert_eq!(manifest.grid_data_pattern.as_deref(), Some("pass1/*AliESDs.root"));
        assert_eq!(manifest.run_list, vec![246392]);
        assert_eq!(manifest.period.as_deref(), Some("LHC15o"));
    }

    #[test]
    fn manifest_write_skips_self_copy() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join(MANIFEST_FILE);
        fs::write(&list, "/x/AliESDs.root\n/y/AliESDs.root\n").unwrap();

        let manifest = resolve(list.to_str().unwrap(), "", false).unwrap();
        write_manifest(&manifest, list.to_str().unwrap(), dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(&list).unwrap(),
            "/x/AliESDs.root\n/y/AliESDs.root\n"
        );

        let elsewhere = tempfile::tempdir().unwrap();
        let written = write_manifest(&manifest, list.to_str().unwrap(), elsewhere.path()).unwrap();
        assert_eq!(
            fs::read_to_string(written).unwrap(),
            "/x/AliESDs.root\n/y/AliESDs.root\n"
        );
    }

    #[test]
    fn staging_rewrites_the_dataset_mode() {
        let rewritten = rewrite_dataset_mode(
            "Find;BasePath=/a/b/;FileName=c.root;Mode=local;",
            "cache",
        );
        assert_eq!(rewritten, "Find;BasePath=/a/b/;FileName=c.root;Mode=cache;");

        let appended = rewrite_dataset_mode("Find;BasePath=/a/b/;FileName=c.root", "remote");
        assert_eq!(appended, "Find;BasePath=/a/b/;FileName=c.root;Mode=remote;");

        let cleared = rewrite_dataset_mode("Find;BasePath=/a/b/;FileName=c.root;Mode=x;", "");
        assert_eq!(cleared, "Find;BasePath=/a/b/;FileName=c.root;");
    }

    #[test]
    fn staged_dataset_is_discoverable() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = InputManifest {
            locations: vec!["Find;BasePath=/a/000246392/;FileName=c.root;".to_string()],
            format: DataFormat::Esd,
            is_collection: false,
            period: None,
            pass: None,
            grid_data_dir: None,
            grid_data_pattern: None,
            is_mc: false,
            is_embed: false,
            run_list: vec![246392],
        };
        let name = stage_dataset(&manifest, dir.path(), "cache").unwrap();
        assert_eq!(name, MANIFEST_FILE);
        assert_eq!(staged_dataset_name(dir.path()).as_deref(), Some(MANIFEST_FILE));
        assert!(
            fs::read_to_string(dir.path().join(MANIFEST_FILE))
                .unwrap()
                .contains("Mode=cache;")
        );
    }
}
