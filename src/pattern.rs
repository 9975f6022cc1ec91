// SPDX-License-Identifier: Apache-2.0

//! Date-templated log name matching.
//!
//! A pattern is a file name containing exactly one `${DATE_FORMAT}`
//! placeholder, e.g. `access.log.${yyyy-MM-dd}`. From it we derive the regex
//! matching "today's" dated name, and an insertion rule that reconstructs a
//! dated alias for active files written under an undated name. Rotation
//! managers that write `access.log` and rename it to `access.log.2024-01-02`
//! at midnight are covered by symlinking the dated alias onto the live file.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use regex::Regex;

use crate::error::{Error, Result};

/// A filename template with one date placeholder.
#[derive(Debug, Clone)]
pub struct LogNamePattern {
    prefix: String,
    suffix: String,
    date_format: String,
}

impl LogNamePattern {
    /// Parse a file name into a pattern, or `None` if it carries no
    /// placeholder (a plain, undated file).
    pub fn detect(name: &str) -> Result<Option<Self>> {
        let Some(start) = name.find("${") else {
            return Ok(None);
        };
        let end = name[start..]
            .find('}')
            .map(|i| start + i)
            .ok_or_else(|| Error::Pattern(format!("unterminated placeholder in {name:?}")))?;

        let rest = &name[end + 1..];
        if rest.contains("${") {
            return Err(Error::Pattern(format!(
                "expected exactly one date placeholder in {name:?}"
            )));
        }

        let date_format = convert_date_format(&name[start + 2..end])?;

        Ok(Some(Self {
            prefix: name[..start].to_string(),
            suffix: rest.to_string(),
            date_format,
        }))
    }

    /// The name the pattern resolves to for `date`. Pure string substitution.
    pub fn dated_name(&self, date: NaiveDate) -> String {
        format!(
            "{}{}{}",
            self.prefix,
            date.format(&self.date_format),
            self.suffix
        )
    }

    /// Anchored matcher for the dated name. Derivation depends only on
    /// (template, date), never on filesystem state.
    pub fn dated_regex(&self, date: NaiveDate) -> Regex {
        let pattern = format!("^{}$", regex::escape(&self.dated_name(date)));
        // Escaped literal patterns always compile.
        Regex::new(&pattern).expect("escaped literal regex")
    }

    /// Whether `file_name` is the dated name for `date`.
    pub fn matches(&self, file_name: &str, date: NaiveDate) -> bool {
        self.dated_regex(date).is_match(file_name)
    }

    /// For a file name lacking the date literal, derive the dated alias name
    /// by inserting the missing segment. Candidate insertion offsets are
    /// tried from the end of the name backward; the first insertion that
    /// matches the dated regex wins. Runs only at discovery time.
    pub fn undated_alias(&self, file_name: &str, date: NaiveDate) -> Option<String> {
        let dated = self.dated_name(date);
        if file_name == dated || dated.len() <= file_name.len() {
            return None;
        }

        let regex = self.dated_regex(date);
        let missing_len = dated.len() - file_name.len();
        for i in (0..=file_name.len()).rev() {
            if !file_name.is_char_boundary(i) {
                continue;
            }
            let (head, tail) = file_name.split_at(i);
            if !dated.starts_with(head) || !dated.ends_with(tail) {
                continue;
            }
            let inserted = format!("{head}{}{tail}", &dated[i..i + missing_len]);
            if regex.is_match(&inserted) {
                return Some(inserted);
            }
        }
        None
    }
}

/// Create a symbolic link `alias` pointing at `target` if it does not already
/// exist. Idempotent: an existing alias is returned as-is.
pub fn create_alias(target: &Path, alias: &Path) -> Result<PathBuf> {
    if alias.symlink_metadata().is_ok() {
        return Ok(alias.to_path_buf());
    }
    std::os::unix::fs::symlink(target, alias)?;
    Ok(alias.to_path_buf())
}

/// Convert a SimpleDateFormat-style date format (the original configuration
/// dialect) into a chrono format string.
fn convert_date_format(format: &str) -> Result<String> {
    let mut out = String::with_capacity(format.len());
    let chars: Vec<char> = format.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !c.is_ascii_alphabetic() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
            i += 1;
            continue;
        }

        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let spec = match (c, run) {
            ('y', 4) => "%Y",
            ('y', 2) => "%y",
            ('M', 2) => "%m",
            ('d', 2) => "%d",
            ('H', 2) => "%H",
            ('m', 2) => "%M",
            ('s', 2) => "%S",
            _ => {
                return Err(Error::Pattern(format!(
                    "unsupported date format token {:?}",
                    c.to_string().repeat(run)
                )))
            }
        };
        out.push_str(spec);
        i += run;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn pattern(template: &str) -> LogNamePattern {
        LogNamePattern::detect(template).unwrap().unwrap()
    }

    #[test]
    fn detect_plain_name() {
        assert!(LogNamePattern::detect("app.log").unwrap().is_none());
    }

    #[test]
    fn detect_rejects_malformed_templates() {
        assert!(LogNamePattern::detect("a.${yyyy").is_err());
        assert!(LogNamePattern::detect("a.${yyyy}.${MM}").is_err());
        assert!(LogNamePattern::detect("a.${QQ}").is_err());
    }

    #[test]
    fn dated_name_substitution() {
        let p = pattern("access.log.${yyyy-MM-dd}");
        assert_eq!(p.dated_name(date(2024, 1, 2)), "access.log.2024-01-02");

        let p = pattern("app-${yyyyMMdd}.log");
        assert_eq!(p.dated_name(date(2024, 1, 2)), "app-20240102.log");
    }

    #[test]
    fn dated_regex_matches_only_today() {
        let p = pattern("access.log.${yyyy-MM-dd}");
        let today = date(2024, 1, 2);
        assert!(p.matches("access.log.2024-01-02", today));
        assert!(!p.matches("access.log.2024-01-03", today));
        assert!(!p.matches("access.log", today));
        // Dots in the template are literals, not wildcards.
        assert!(!p.matches("accessXlogX2024-01-02", today));
    }

    #[test]
    fn regex_derivation_is_pure() {
        let p = pattern("access.log.${yyyy-MM-dd}");
        let today = date(2024, 1, 2);
        assert_eq!(
            p.dated_regex(today).as_str(),
            p.dated_regex(today).as_str()
        );
    }

    #[test]
    fn undated_alias_inserts_missing_segment() {
        let p = pattern("access.log.${yyyy-MM-dd}");
        assert_eq!(
            p.undated_alias("access.log", date(2024, 1, 2)),
            Some("access.log.2024-01-02".to_string())
        );
    }

    #[test]
    fn undated_alias_with_suffix_template() {
        let p = pattern("app-${yyyyMMdd}.log");
        assert_eq!(
            p.undated_alias("app-.log", date(2024, 1, 2)),
            Some("app-20240102.log".to_string())
        );
    }

    #[test]
    fn undated_alias_rejects_unrelated_names() {
        let p = pattern("access.log.${yyyy-MM-dd}");
        assert_eq!(p.undated_alias("error.log", date(2024, 1, 2)), None);
        // Already dated: nothing to insert.
        assert_eq!(
            p.undated_alias("access.log.2024-01-02", date(2024, 1, 2)),
            None
        );
    }

    #[test]
    fn create_alias_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("access.log");
        std::fs::write(&target, b"data\n").unwrap();
        let alias = dir.path().join("access.log.2024-01-02");

        let created = create_alias(&target, &alias).unwrap();
        assert_eq!(created, alias);
        assert_eq!(std::fs::read(&alias).unwrap(), b"data\n");

        // Second call returns the existing link without error.
        let again = create_alias(&target, &alias).unwrap();
        assert_eq!(again, alias);
    }
}
