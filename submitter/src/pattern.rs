//! Pure extraction helpers for dataset descriptor strings.
//!
//! Run identifiers in this domain are always 6 digits, sometimes zero-padded
//! to 9; any other digit run inside a path is not a run number.

use once_cell::sync::Lazy;
use regex::Regex;

static RUN_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[/; ])(0[0-9]{8}|[0-9]{6})(?:[/; ]|$)").unwrap());

static PERIOD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Z]{3}[0-9]{2}[a-z]").unwrap());

static PASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[/ ])((?:pass|muon_calo)[^/; ]*)").unwrap());

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_]+").unwrap());

/// Extract the run-number segment: exactly 6 digits, or exactly 9 digits with
/// a leading zero, bounded by path separators or string edges.
pub fn run_number(descriptor: &str) -> Option<String> {
    // datasets may carry a star inside glob patterns
    let cleaned = descriptor.replace('*', "");
    RUN_NUMBER_RE
        .captures(&cleaned)
        .map(|caps| caps[1].to_string())
}

/// Run number as integer, padding stripped.
pub fn run_number_value(descriptor: &str) -> Option<i32> {
    run_number(descriptor).and_then(|run| run.parse().ok())
}

/// First substring shaped like a data-taking period (`LHC15o`).
pub fn period(descriptor: &str) -> Option<String> {
    PERIOD_RE
        .find(descriptor)
        .map(|found| found.as_str().to_string())
}

/// First reprocessing-pass token (`pass...` or `muon_calo...`), narrowed to
/// its alphanumeric/underscore core.
pub fn pass(descriptor: &str) -> Option<String> {
    let cleaned = descriptor.replace('*', "");
    let caps = PASS_RE.captures(&cleaned)?;
    WORD_RE
        .find(caps.get(1).map(|m| m.as_str())?)
        .map(|core| core.as_str().to_string())
}

/// Value for `key` in a `;`-delimited `key=value` query string.
pub fn grid_query_value(query: &str, key: &str) -> Option<String> {
    for part in query.split(';') {
        if part.contains(key) {
            let mut pieces = part.splitn(2, '=');
            let _ = pieces.next();
            return pieces.next().map(|value| value.to_string());
        }
    }
    None
}

/// Directory prefix of the `BasePath` query value, truncated just before the
/// run-number segment.
pub fn grid_data_dir(query: &str) -> Option<String> {
    let base = grid_query_value(query, "BasePath")?;
    match run_number(query) {
        Some(run) => match base.find(&run) {
            Some(idx) if idx > 0 => Some(base[..idx - 1].to_string()),
            _ => Some(base),
        },
        None => Some(base),
    }
}

/// `*`-prefixed file pattern for a grid query, keeping whatever path follows
/// the run number inside `BasePath`.
pub fn grid_data_pattern(query: &str) -> Option<String> {
    let base = grid_query_value(query, "BasePath")?;
    let file = grid_query_value(query, "FileName")?;
    let mut pattern = format!("*{file}");

    if let Some(run) = run_number(query) {
        if let Some(idx) = base.find(&run) {
            let mut rest = base.get(idx + run.len() + 1..).unwrap_or("").to_string();
            if !rest.is_empty() {
                if !rest.ends_with('/') {
                    rest.push('/');
                }
                pattern.insert_str(0, &rest);
            }
        }
    }

    Some(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_number_accepts_six_digit_segments() {
        assert_eq!(
            run_number("/alice/data/2015/LHC15o/246392/pass1/").as_deref(),
            Some("246392")
        );
    }

    #[test]
    fn run_number_accepts_zero_padded_nine_digit_segments() {
        assert_eq!(
            run_number("/alice/data/2015/LHC15o/000246392/muon_calo_pass1/AOD/").as_deref(),
            Some("000246392")
        );
        assert_eq!(run_number_value("/x/000246392/y"), Some(246392));
    }

    #[test]
    fn run_number_rejects_other_digit_runs() {
        assert_eq!(run_number("/alice/sim/12345/out/"), None);
        assert_eq!(run_number("/alice/sim/1234567/out/"), None);
        // nine digits without the leading zero is not a padded run
        assert_eq!(run_number("/alice/sim/123456789/out/"), None);
    }

    #[test]
    fn run_number_ignores_glob_stars() {
        assert_eq!(
            run_number("Find;BasePath=/data/000246392/*/;FileName=a.root;").as_deref(),
            Some("000246392")
        );
    }

    #[test]
    fn period_matches_fixed_shape() {
        assert_eq!(
            period("/alice/data/2015/LHC15o/000246392/muon_calo_pass1/AOD/").as_deref(),
            Some("LHC15o")
        );
        assert_eq!(period("/alice/data/2015/nothing/"), None);
    }

    #[test]
    fn pass_narrows_to_word_core() {
        assert_eq!(
            pass("/alice/data/2015/LHC15o/000246392//muon_calo_pass1/AOD/").as_deref(),
            Some("muon_calo_pass1")
        );
        assert_eq!(pass("pass2 MC").as_deref(), Some("pass2"));
        assert_eq!(pass("/alice/data/nopass-here/"), None);
    }

    #[test]
    fn grid_query_value_splits_pairs() {
        let query = "Find;BasePath=/a/b/;FileName=c.root;";
        assert_eq!(grid_query_value(query, "FileName").as_deref(), Some("c.root"));
        assert_eq!(grid_query_value(query, "BasePath").as_deref(), Some("/a/b/"));
        assert_eq!(grid_query_value(query, "Mode"), None);
    }

    #[test]
    fn grid_data_dir_trims_at_run_number() {
        let query =
            "Find;BasePath=/alice/data/2015/LHC15o/000246392/muon_calo_pass1/AOD/;FileName=AliAOD.root;";
        assert_eq!(
            grid_data_dir(query).as_deref(),
            Some("/alice/data/2015/LHC15o")
        );
    }

    #[test]
    fn grid_data_pattern_keeps_trailing_path() {
        let query =
            "Find;BasePath=/alice/data/2015/LHC15o/000246392/muon_calo_pass1/AOD/;FileName=AliAOD.root;";
        assert_eq!(
            grid_data_pattern(query).as_deref(),
            Some("muon_calo_pass1/AOD/*AliAOD.root")
        );
    }

    #[test]
    fn grid_data_pattern_without_run_number_is_star_prefixed() {
        let query = "Find;BasePath=/alice/sim/prod/;FileName=galice.root;";
        assert_eq!(grid_data_pattern(query).as_deref(), Some("*galice.root"));
    }
}
