//! Placeholder resolution for task macro arguments and dependency
//! configuration text. An unresolved placeholder is a hard error: left alone
//! it would be passed verbatim into generated code.

use crate::input::{DataFormat, InputManifest};
use crate::valuemap::ValueMap;
use itertools::Itertools;
use thiserror::Error;

/// prefix marking a placeholder token
pub const SENTINEL: &str = "__VAR_";

#[derive(Error, Debug)]
pub enum KeywordError {
    #[error("unresolved keyword {keyword} in: {text}")]
    UnresolvedKeyword { keyword: String, text: String },
}

/// Fixed substitution table, built once per job from resolved state.
#[derive(Debug, Clone)]
pub struct KeywordTable {
    entries: Vec<(&'static str, String)>,
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

impl KeywordTable {
    pub fn build(manifest: &InputManifest, task_options: &str, map: &ValueMap) -> Self {
        let entries = vec![
            ("__VAR_ISEMBED", flag(manifest.is_embed)),
            ("__VAR_ISAOD", flag(manifest.format == DataFormat::Aod)),
            ("__VAR_ISMC", flag(manifest.is_mc)),
            ("__VAR_PERIOD", manifest.period.clone().unwrap_or_default()),
            ("__VAR_PASS", manifest.pass.clone().unwrap_or_default()),
            ("__VAR_TASKOPTIONS", task_options.to_string()),
            ("__VAR_MAP", map.rendered()),
        ];
        Self { entries }
    }

    /// Replace every occurrence of every known keyword. Returns whether
    /// anything was replaced along with the resulting text.
    pub fn substitute(&self, text: &str) -> Result<(bool, String), KeywordError> {
        if !text.contains(SENTINEL) {
            return Ok((false, text.to_string()));
        }

        // a substituted value never legitimately reintroduces the sentinel,
        // so the bound only guards against a malicious option string
        let mut out = text.to_string();
        for _ in 0..=self.entries.len() {
            let mut progressed = false;
            for (key, value) in &self.entries {
                if out.contains(key) && value != key {
                    out = out.replace(key, value);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        if let Some(idx) = out.find(SENTINEL) {
            let keyword: String = out[idx..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            return Err(KeywordError::UnresolvedKeyword {
                keyword,
                text: out,
            });
        }

        Ok((true, out))
    }

    /// Apply the table line-by-line to a text body, keeping line structure.
    pub fn substitute_lines(&self, body: &str) -> Result<(bool, String), KeywordError> {
        let mut replaced = false;
        let mut lines = Vec::new();
        for line in body.lines() {
            let (line_replaced, line_out) = self.substitute(line)?;
            replaced |= line_replaced;
            lines.push(line_out);
        }
        let mut out = lines.iter().join("\n");
        if body.ends_with('\n') {
            out.push('\n');
        }
        Ok((replaced, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputManifest;
    use crate::valuemap::build_value_map;

    fn table() -> KeywordTable {
        let manifest = InputManifest {
            locations: vec!["/x/AliESDs.root".to_string()],
            format: DataFormat::Esd,
            is_collection: false,
            period: Some("LHC15o".to_string()),
            pass: Some("pass1".to_string()),
            grid_data_dir: None,
            grid_data_pattern: None,
            is_mc: true,
            is_embed: false,
            run_list: vec![],
        };
        let map = build_value_map(&manifest, true, false);
        KeywordTable::build(&manifest, "selectDimuons", &map)
    }

    #[test]
    fn untouched_text_reports_no_replacement() {
        let (replaced, out) = table().substitute("AddTask(0x0)").unwrap();
        assert!(!replaced);
        assert_eq!(out, "AddTask(0x0)");
    }

    #[test]
    fn replaces_every_occurrence_of_every_keyword() {
        let (replaced, out) = table()
            .substitute("AddTask(__VAR_ISMC,\"__VAR_PERIOD\",\"__VAR_PERIOD\")")
            .unwrap();
        assert!(replaced);
        assert_eq!(out, "AddTask(1,\"LHC15o\",\"LHC15o\")");
    }

    #[test]
    fn unknown_placeholder_fails_instead_of_passing_through() {
        match table().substitute("AddTask(__VAR_UNKNOWN)") {
            Err(KeywordError::UnresolvedKeyword { keyword, .. }) => {
                assert_eq!(keyword, "__VAR_UNKNOWN");
            }
            other => panic!("expected UnresolvedKeyword, got {other:?}"),
        }
    }

    #[test]
    fn line_substitution_keeps_structure() {
        let body = "cuts(__VAR_PASS)\nplain line\nopts(__VAR_TASKOPTIONS)\n";
        let (replaced, out) = table().substitute_lines(body).unwrap();
        assert!(replaced);
        assert_eq!(out, "cuts(pass1)\nplain line\nopts(selectDimuons)\n");
    }
}
