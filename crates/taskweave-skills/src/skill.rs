use serde::{Deserialize, Serialize};
use std::path::Path;

use taskweave_core::{WeaveError, WeaveResult};

/// A named body of reference content attached to a task before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// The full instruction text handed to the worker.
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Skill {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            body: body.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Parse a markdown skill file with optional frontmatter.
    ///
    /// File format:
    /// ```markdown
    /// ---
    /// name: rust-testing
    /// description: How to structure Rust tests
    /// tags: testing, rust
    /// ---
    ///
    /// Prefer #[cfg(test)] modules next to the code under test...
    /// ```
    ///
    /// Without frontmatter, the file stem becomes the skill name and the
    /// whole file the body.
    pub fn from_markdown(raw: &str, source: &Path) -> WeaveResult<Self> {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let trimmed = raw.trim_start();
        if let Some(rest) = trimmed.strip_prefix("---") {
            let Some(end) = rest.find("\n---") else {
                return Err(WeaveError::Validation(format!(
                    "unterminated frontmatter in skill file {}",
                    source.display()
                )));
            };
            let frontmatter = &rest[..end];
            let body = rest[end + 4..].trim_start_matches('\n').to_string();

            let mut skill = Skill::new(stem, body);
            for line in frontmatter.lines() {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                let value = value.trim();
                match key.trim() {
                    "name" => skill.name = value.to_string(),
                    "description" => skill.description = value.to_string(),
                    "tags" => {
                        skill.tags = value
                            .split(',')
                            .map(|t| t.trim().to_string())
                            .filter(|t| !t.is_empty())
                            .collect()
                    }
                    _ => {}
                }
            }
            if skill.name.is_empty() {
                return Err(WeaveError::Validation(format!(
                    "skill file {} has no name",
                    source.display()
                )));
            }
            Ok(skill)
        } else {
            Ok(Skill::new(stem, raw.to_string()))
        }
    }

    /// Read and parse a markdown skill file from disk.
    pub fn from_file(path: &Path) -> WeaveResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WeaveError::Validation(format!(
                "failed to read skill file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_markdown(&raw, path)
    }
}
