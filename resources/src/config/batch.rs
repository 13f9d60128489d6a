use std::{fs, path::Path};

use anyhow::{bail, Context, Result};

use super::conf_file::{parse_lines, ConfFile, Line};
use crate::objects::TemplateConfig;

/// One `[section]` of a batch queue file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Section name, used as the template name unless the section sets one.
    pub name: String,
    pub conf: ConfFile,
}

/// A queue of template configurations processed one after another.
///
/// Assignments before the first section are defaults for every entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchQueue {
    pub defaults: ConfFile,
    pub entries: Vec<BatchEntry>,
}

impl BatchQueue {
    pub fn parse(content: &str) -> Result<Self> {
        let mut queue = BatchQueue::default();
        for (number, line) in parse_lines(content)? {
            match line {
                Line::Section(name) => {
                    if queue.entries.iter().any(|e| e.name == name) {
                        bail!("line {}: duplicate section [{}]", number, name);
                    }
                    queue.entries.push(BatchEntry {
                        name,
                        conf: ConfFile::new(),
                    });
                },
                Line::Pair(key, value) => match queue.entries.last_mut() {
                    Some(entry) => entry.conf.set(key, value),
                    None => queue.defaults.set(key, value),
                },
            }
        }
        Ok(queue)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read batch file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse batch file {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every entry on top of `base`.
    ///
    /// Each entry is resolved on its own so that one broken section does not
    /// hide the others.
    pub fn resolve(&self, base: &TemplateConfig) -> Vec<(String, Result<TemplateConfig>)> {
        self.entries
            .iter()
            .map(|entry| (entry.name.to_owned(), self.resolve_entry(base, entry)))
            .collect()
    }

    fn resolve_entry(&self, base: &TemplateConfig, entry: &BatchEntry) -> Result<TemplateConfig> {
        let mut config = base.clone();
        config
            .apply_conf(&self.defaults)
            .with_context(|| "Invalid batch defaults")?;
        config.template_name = entry.name.to_owned();
        config
            .apply_conf(&entry.conf)
            .with_context(|| format!("Invalid batch entry [{}]", entry.name))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = r#"
# shared settings
STORAGE="fast-ssd"
CORES=2

[ubuntu-base]
DISTRIBUTION="ubuntu-22.04"

[debian-docker]
DISTRIBUTION="debian-12"
CORES=4
PACKAGES="docker.io curl"

[broken]
DISTRIBUTION="debian-12"
CORES="many"
"#;

    #[test]
    fn parses_defaults_and_sections() {
        let queue = BatchQueue::parse(QUEUE).unwrap();
        assert_eq!(queue.defaults.get("STORAGE"), Some("fast-ssd"));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.entries[1].name, "debian-docker");
        assert_eq!(queue.entries[1].conf.get("CORES"), Some("4"));
    }

    #[test]
    fn resolves_entries_independently() {
        let queue = BatchQueue::parse(QUEUE).unwrap();
        let resolved = queue.resolve(&TemplateConfig::default());
        assert_eq!(resolved.len(), 3);

        let (name, first) = &resolved[0];
        let first = first.as_ref().unwrap();
        assert_eq!(name, "ubuntu-base");
        assert_eq!(first.template_name, "ubuntu-base");
        assert_eq!(first.storage, "fast-ssd");
        assert_eq!(first.cores, 2);

        let second = resolved[1].1.as_ref().unwrap();
        assert_eq!(second.cores, 4);
        assert_eq!(second.packages, vec!["docker.io", "curl"]);

        assert!(resolved[2].1.is_err());
    }

    #[test]
    fn rejects_duplicate_sections() {
        let err = BatchQueue::parse("[a]\nX=1\n[a]\n").unwrap_err();
        assert!(err.to_string().contains("duplicate section"));
    }
}
