use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use taskweave_core::{WeaveError, WeaveResult};

use crate::skill::Skill;

/// Central registry of skills, looked up by name before task dispatch.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Skill>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            skills: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, skill: Skill) {
        info!(skill = %skill.name, "Registered skill");
        self.skills.insert(skill.name.clone(), skill);
    }

    pub fn lookup(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    /// Resolve every required skill name, failing with the list of
    /// available skills when one is missing.
    pub fn resolve(&self, names: &[String]) -> WeaveResult<Vec<Skill>> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            match self.skills.get(name) {
                Some(skill) => resolved.push(skill.clone()),
                None => {
                    return Err(WeaveError::RequiredSkillNotFound(format!(
                        "skill '{}' not found; available skills: [{}]",
                        name,
                        self.names().join(", ")
                    )));
                }
            }
        }
        Ok(resolved)
    }

    pub fn names(&self) -> Vec<String> {
        self.skills.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.skills.len()
    }

    /// Load every `*.md` file in a directory as a skill. Files that fail
    /// to parse are logged and skipped.
    pub fn load_dir(&mut self, dir: &Path) -> WeaveResult<usize> {
        let entries = std::fs::read_dir(dir)?;
        let mut loaded = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            match Skill::from_file(&path) {
                Ok(skill) => {
                    self.register(skill);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unparsable skill file");
                }
            }
        }
        info!(dir = %dir.display(), loaded, "Loaded skill directory");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = SkillRegistry::new();
        registry.register(Skill::new("summarize", "How to summarize."));
        assert!(registry.lookup("summarize").is_some());
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_resolve_success() {
        let mut registry = SkillRegistry::new();
        registry.register(Skill::new("a", "body a"));
        registry.register(Skill::new("b", "body b"));

        let skills = registry.resolve(&["a".into(), "b".into()]).unwrap();
        assert_eq!(skills.len(), 2);
        assert_eq!(skills[0].name, "a");
    }

    #[test]
    fn test_resolve_missing_lists_available() {
        let mut registry = SkillRegistry::new();
        registry.register(Skill::new("alpha", "body"));

        let err = registry.resolve(&["beta".into()]).unwrap_err();
        assert_eq!(err.kind(), "RequiredSkillNotFound");
        assert!(err.to_string().contains("alpha"));
    }

    #[test]
    fn test_load_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("review.md"),
            "---\nname: review\ndescription: Reviewing\n---\nReview carefully.",
        )
        .unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "not a skill").unwrap();

        let mut registry = SkillRegistry::new();
        let loaded = registry.load_dir(tmp.path()).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(registry.lookup("review").unwrap().description, "Reviewing");
    }
}
