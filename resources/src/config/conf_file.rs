//! Reader and writer for `KEY="value"` configuration files.
//!
//! The files look like shell variable assignments but are never executed:
//! only assignments, comments and (for batch queues) `[section]` headers
//! are understood.

use std::{fmt::Write as _, fs, path::Path};

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Line {
    Section(String),
    Pair(String, String),
}

/// Ordered `KEY=value` entries of a single configuration file or section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfFile {
    entries: Vec<(String, String)>,
}

impl ConfFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut conf = ConfFile::new();
        for (number, line) in parse_lines(content)? {
            match line {
                Line::Pair(key, value) => conf.set(key, value),
                Line::Section(name) => bail!(
                    "line {}: unexpected section [{}] outside of a batch file",
                    number,
                    name
                ),
            }
        }
        Ok(conf)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn save(&self, path: &Path, header: &str) -> Result<()> {
        let mut out = String::new();
        for line in header.lines() {
            writeln!(out, "# {}", line)?;
        }
        out.push_str(&self.to_string());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        fs::write(path, out)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Set a value, replacing an earlier assignment of the same key in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Display for ConfFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (key, value) in &self.entries {
            writeln!(f, "{}=\"{}\"", key, escape(value))?;
        }
        Ok(())
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Tokenize a file into sections and assignments, with 1-based line numbers.
pub(crate) fn parse_lines(content: &str) -> Result<Vec<(usize, Line)>> {
    let mut lines = vec![];
    for (index, raw) in content.lines().enumerate() {
        let number = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let name = rest
                .strip_suffix(']')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .with_context(|| format!("line {}: malformed section header '{}'", number, line))?;
            lines.push((number, Line::Section(name.to_owned())));
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected KEY=value, got '{}'", number, line))?;
        let key = key.trim();
        if !is_valid_key(key) {
            bail!("line {}: invalid key '{}'", number, key);
        }
        let value = parse_value(value.trim()).with_context(|| format!("line {}", number))?;
        lines.push((number, Line::Pair(key.to_owned(), value)));
    }
    Ok(lines)
}

fn parse_value(raw: &str) -> Result<String> {
    let mut chars = raw.chars();
    let rest = match chars.next() {
        Some('"') => {
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(c @ ('"' | '\\' | '$' | '`')) => value.push(c),
                        Some(c) => {
                            value.push('\\');
                            value.push(c);
                        },
                        None => bail!("unterminated escape in {}", raw),
                    },
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => bail!("unterminated double quote in {}", raw),
                }
            }
            check_trailing(chars.as_str())?;
            return Ok(value);
        },
        Some('\'') => {
            let body = chars.as_str();
            let end = body
                .find('\'')
                .with_context(|| format!("unterminated single quote in {}", raw))?;
            check_trailing(&body[end + 1..])?;
            return Ok(body[..end].to_owned());
        },
        _ => raw,
    };
    // bare value, an unquoted ` #` starts a comment
    let value = match rest.find(" #") {
        Some(pos) => &rest[..pos],
        None => rest,
    };
    Ok(value.trim().to_owned())
}

fn check_trailing(rest: &str) -> Result<()> {
    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(())
    } else {
        bail!("unexpected characters after closing quote: '{}'", rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_quote_styles() {
        let conf = ConfFile::parse(
            r#"
# template settings
DISTRIBUTION="ubuntu-22.04"
export TEMPLATE_NAME='ubuntu-base'
CORES=4   # inline comment
PACKAGES="curl \"vim\" \$HOME"
EMPTY=
"#,
        )
        .unwrap();
        assert_eq!(conf.get("DISTRIBUTION"), Some("ubuntu-22.04"));
        assert_eq!(conf.get("TEMPLATE_NAME"), Some("ubuntu-base"));
        assert_eq!(conf.get("CORES"), Some("4"));
        assert_eq!(conf.get("PACKAGES"), Some("curl \"vim\" $HOME"));
        assert_eq!(conf.get("EMPTY"), Some(""));
        assert_eq!(conf.len(), 5);
    }

    #[test]
    fn later_assignment_wins() {
        let conf = ConfFile::parse("A=1\nB=2\nA=3\n").unwrap();
        assert_eq!(conf.get("A"), Some("3"));
        assert_eq!(conf.iter().map(|(k, _)| k).collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(ConfFile::parse("NOT AN ASSIGNMENT").is_err());
        assert!(ConfFile::parse("1KEY=x").is_err());
        assert!(ConfFile::parse("KEY=\"open").is_err());
        assert!(ConfFile::parse("KEY=\"a\" b").is_err());
        assert!(ConfFile::parse("[section]\nKEY=x").is_err());
    }

    #[test]
    fn never_executes_substitutions() {
        let conf = ConfFile::parse("NAME=\"$(rm -rf /)\"").unwrap();
        assert_eq!(conf.get("NAME"), Some("$(rm -rf /)"));
    }

    #[test]
    fn save_then_load_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/template.conf");
        let mut conf = ConfFile::new();
        conf.set("NAME", "a \"quoted\" $value with `ticks` and \\");
        conf.set("EMPTY", "");
        conf.save(&path, "generated\nby tests").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# generated\n# by tests\n"));
        assert_eq!(ConfFile::load(&path).unwrap(), conf);
    }

    #[test]
    fn tokenizes_sections() {
        let lines = parse_lines("GLOBAL=1\n[web]\nA=b\n").unwrap();
        assert_eq!(
            lines,
            vec![
                (1, Line::Pair("GLOBAL".into(), "1".into())),
                (2, Line::Section("web".into())),
                (3, Line::Pair("A".into(), "b".into())),
            ]
        );
        assert!(parse_lines("[]").is_err());
    }
}
