//! The shared runtime value threaded through every stage entry point.
//!
//! [`Runtime`] replaces the module-level singletons a pipeline like this
//! tends to grow: the model-config table, the named-semaphore registry, the
//! prompt store and the sandbox client all live here, constructed once at
//! process start.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::config::{ApiConfigs, DEFAULT_MAX_CONCURRENT, SandboxConfig};
use crate::prompts::PromptStore;
use crate::sandbox::SandboxClient;

/// Registry of named semaphores, one per logical workload
/// (`"dependency_score"`, `"tool_call"`, `"tool_content_plan"`, …).
///
/// Semaphores are created lazily on first use with the configured
/// concurrency. Unlike loop-bound semaphores in cooperative runtimes,
/// tokio's are runtime-agnostic, so no rebinding is needed.
#[derive(Debug)]
pub struct SemaphoreRegistry {
    max_concurrent: usize,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SemaphoreRegistry {
    /// Registry whose semaphores admit `max_concurrent` holders each.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// The semaphore for `name`, created on first use.
    #[must_use]
    pub fn get(&self, name: &str) -> Arc<Semaphore> {
        let mut map = self.semaphores.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            map.entry(name.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent))),
        )
    }

    /// The configured per-workload concurrency.
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

impl Default for SemaphoreRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

/// Everything a stage needs, owned in one place.
#[derive(Debug)]
pub struct Runtime {
    /// Model configuration table.
    pub configs: ApiConfigs,
    /// Named-semaphore registry for per-workload concurrency caps.
    pub semaphores: SemaphoreRegistry,
    /// Prompt templates, loaded from `PROMPT_DIR` with embedded defaults.
    pub prompts: PromptStore,
    /// Code-execution sandbox client, when the stage needs one.
    pub sandbox: Option<SandboxClient>,
}

impl Runtime {
    /// Build a runtime from its parts.
    #[must_use]
    pub fn new(configs: ApiConfigs, prompts: PromptStore, max_concurrent: usize) -> Self {
        Self {
            configs,
            semaphores: SemaphoreRegistry::new(max_concurrent),
            prompts,
            sandbox: None,
        }
    }

    /// Attach a sandbox client.
    #[must_use]
    pub fn with_sandbox(mut self, config: SandboxConfig) -> Self {
        self.sandbox = Some(SandboxClient::new(config));
        self
    }

    /// The sandbox client, or a configuration error for stages that
    /// require one.
    pub fn sandbox(&self) -> crate::error::Result<&SandboxClient> {
        self.sandbox
            .as_ref()
            .ok_or_else(|| crate::error::Error::config("stage requires a sandbox but none is configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphores_are_cached_by_name() {
        let registry = SemaphoreRegistry::new(3);
        let a = registry.get("tool_call");
        let b = registry.get("tool_call");
        let c = registry.get("dependency_score");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.available_permits(), 3);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let registry = SemaphoreRegistry::new(0);
        assert_eq!(registry.max_concurrent(), 1);
    }
}
