use std::path::PathBuf;

// ── Base directory & file layout ─────────────────────────────────
//
// Resolution order: MCP_PROFILES_DIR, then $XDG_STATE_HOME/sentryfrogg,
// then ~/.local/state/sentryfrogg. Every file is individually
// overridable via its own env var.

#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

impl Paths {
    pub fn resolve() -> Self {
        let base = if let Ok(dir) = std::env::var("MCP_PROFILES_DIR") {
            PathBuf::from(dir)
        } else if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
            PathBuf::from(xdg).join("sentryfrogg")
        } else {
            home_dir().join(".local").join("state").join("sentryfrogg")
        };
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &PathBuf {
        &self.base
    }

    fn file(&self, env_override: &str, name: &str) -> PathBuf {
        match std::env::var(env_override) {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => self.base.join(name),
        }
    }

    pub fn profiles_file(&self) -> PathBuf {
        self.file("SENTRYFROGG_PROFILES_FILE", "profiles.json")
    }

    pub fn key_file(&self) -> PathBuf {
        self.file("SENTRYFROGG_KEY_FILE", ".mcp_profiles.key")
    }

    pub fn state_file(&self) -> PathBuf {
        self.file("SENTRYFROGG_STATE_FILE", "state.json")
    }

    pub fn projects_file(&self) -> PathBuf {
        self.file("SENTRYFROGG_PROJECTS_FILE", "projects.json")
    }

    pub fn runbooks_file(&self) -> PathBuf {
        self.file("SENTRYFROGG_RUNBOOKS_FILE", "runbooks.json")
    }

    pub fn aliases_file(&self) -> PathBuf {
        self.file("SENTRYFROGG_ALIASES_FILE", "aliases.json")
    }

    pub fn presets_file(&self) -> PathBuf {
        self.file("SENTRYFROGG_PRESETS_FILE", "presets.json")
    }

    pub fn audit_file(&self) -> PathBuf {
        self.file("SENTRYFROGG_AUDIT_FILE", "audit.jsonl")
    }

    pub fn cache_dir(&self) -> PathBuf {
        match std::env::var("SENTRYFROGG_CACHE_DIR") {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => self.base.join("cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_base_layout() {
        let p = Paths::with_base(PathBuf::from("/tmp/sf-test"));
        assert_eq!(p.profiles_file(), PathBuf::from("/tmp/sf-test/profiles.json"));
        assert_eq!(p.key_file(), PathBuf::from("/tmp/sf-test/.mcp_profiles.key"));
        assert_eq!(p.audit_file(), PathBuf::from("/tmp/sf-test/audit.jsonl"));
        assert_eq!(p.cache_dir(), PathBuf::from("/tmp/sf-test/cache"));
    }
}
