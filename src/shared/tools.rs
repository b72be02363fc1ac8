use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use which::which;

/// Lazily-populated lookup of external agent executables.
///
/// Owned by the orchestrator context rather than living in a process-wide
/// static, so embedders control its lifetime and tests get isolation.
#[derive(Default)]
pub struct ToolCache {
    detected: OnceCell<Mutex<HashMap<String, Option<String>>>>,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a program name or path to an invocable path, caching the
    /// answer. Relative names go through PATH; absolute and `~/` paths are
    /// checked directly.
    pub fn resolve(&self, program: &str) -> Option<String> {
        let cache = self.detected.get_or_init(|| Mutex::new(HashMap::new()));
        let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(cached) = cache.get(program) {
            return cached.clone();
        }

        let resolved = detect(program);
        cache.insert(program.to_string(), resolved.clone());
        resolved
    }

    pub fn is_available(&self, program: &str) -> bool {
        self.resolve(program).is_some()
    }
}

/// One-shot, uncached resolution; used on spawn paths that validate a full
/// command line rather than a configured agent binary.
pub fn resolve_program(raw: &str) -> Option<String> {
    detect(raw)
}

fn detect(raw: &str) -> Option<String> {
    let spec = normalize_program_path(raw)?;

    if spec.contains('/') {
        Path::new(&spec).exists().then_some(spec)
    } else {
        which(&spec).ok().map(|p| p.display().to_string())
    }
}

fn normalize_program_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let unquoted = if trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
    {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    };

    if let (Some(path_after_tilde), Ok(home)) = (unquoted.strip_prefix("~/"), std::env::var("HOME"))
    {
        return Some(format!("{home}/{path_after_tilde}"));
    }

    Some(unquoted)
}
