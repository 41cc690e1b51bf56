//! Translator registry implementation
//!
//! This module provides the process-wide translator cache. Descriptors are
//! loaded from one or more sources on `init()`, keyed by ID and indexed by
//! mode, and dropped again on `invalidate()`.

use super::types::{Mode, TranslatorDescriptor};
use crate::core::error::{Result, TranslateError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Read-only view of the loaded translators
pub trait TranslatorRegistry: Send + Sync {
    /// Get a descriptor by ID
    fn get(&self, id: &str) -> Option<Arc<TranslatorDescriptor>>;

    /// All descriptors serving `mode`, in candidate order
    fn get_all_for_type(&self, mode: Mode) -> Vec<Arc<TranslatorDescriptor>>;
}

/// Somewhere translator descriptors can be loaded from
pub trait DescriptorSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> String;

    /// Load every descriptor.
    ///
    /// The outer error aborts the source; inner errors only exclude the one
    /// translator they belong to.
    fn load(&self) -> Result<Vec<Result<TranslatorDescriptor>>>;
}

/// `*.js` translator files in a directory, read in file name order
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load_file(path: &Path) -> Result<TranslatorDescriptor> {
        let text = std::fs::read_to_string(path)?;
        TranslatorDescriptor::parse(&text, Some(path))
            .map_err(|e| TranslateError::Metadata(format!("{}: {}", path.display(), e)))
    }
}

impl DescriptorSource for DirectorySource {
    fn name(&self) -> String {
        self.dir.display().to_string()
    }

    fn load(&self) -> Result<Vec<Result<TranslatorDescriptor>>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "js"))
            .collect();
        paths.sort();

        Ok(paths.iter().map(|path| Self::load_file(path)).collect())
    }
}

/// Translator texts compiled into the binary
pub struct StaticSource {
    name: String,
    texts: Vec<&'static str>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, texts: Vec<&'static str>) -> Self {
        Self {
            name: name.into(),
            texts,
        }
    }
}

impl DescriptorSource for StaticSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn load(&self) -> Result<Vec<Result<TranslatorDescriptor>>> {
        Ok(self
            .texts
            .iter()
            .map(|text| TranslatorDescriptor::parse(text, None))
            .collect())
    }
}

#[derive(Default)]
struct CacheState {
    /// All descriptors in load order
    ordered: Vec<Arc<TranslatorDescriptor>>,
    by_id: HashMap<String, Arc<TranslatorDescriptor>>,
    by_mode: HashMap<Mode, Vec<Arc<TranslatorDescriptor>>>,
}

/// Translator cache
///
/// Shared by every operation in the process. Reads take a shared lock;
/// `init()` and `invalidate()` swap the whole state.
#[derive(Default)]
pub struct TranslatorCache {
    sources: Vec<Box<dyn DescriptorSource>>,
    state: RwLock<Option<CacheState>>,
}

impl TranslatorCache {
    /// Create an empty cache with no sources
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source; earlier sources win ID conflicts
    pub fn with_source(mut self, source: impl DescriptorSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Load all sources
    ///
    /// # Returns
    /// The number of descriptors now cached
    ///
    /// # Errors
    /// Returns an error if a source as a whole cannot be read. Malformed
    /// translators are logged and skipped; duplicate IDs keep the first one
    /// loaded.
    pub fn init(&self) -> Result<usize> {
        let mut state = CacheState::default();

        for source in &self.sources {
            let entries = source.load()?;
            debug!(source = %source.name(), count = entries.len(), "Loading translators");

            for entry in entries {
                let descriptor = match entry {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        warn!(source = %source.name(), error = %e, "Skipping translator with bad metadata");
                        continue;
                    }
                };

                if let Some(existing) = state.by_id.get(&descriptor.id) {
                    warn!(
                        id = %descriptor.id,
                        kept = %existing.label,
                        discarded = %descriptor.label,
                        "Translator ID conflict; keeping the first one loaded"
                    );
                    continue;
                }

                let descriptor = Arc::new(descriptor);
                state.by_id.insert(descriptor.id.clone(), descriptor.clone());
                state.ordered.push(descriptor);
            }
        }

        for mode in Mode::ALL {
            let mut candidates: Vec<Arc<TranslatorDescriptor>> =
                state.ordered.iter().filter(|d| d.supports(mode)).cloned().collect();
            // Stable, so equal priorities keep load order
            candidates.sort_by_key(|d| d.priority);
            state.by_mode.insert(mode, candidates);
        }

        let count = state.ordered.len();
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = Some(state);
        info!(count, "Translator cache initialized");
        Ok(count)
    }

    /// Drop everything; the next `init()` reloads from the sources
    pub fn invalidate(&self) {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = None;
        debug!("Translator cache invalidated");
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    /// Every cached descriptor in load order
    pub fn all(&self) -> Vec<Arc<TranslatorDescriptor>> {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|s| s.ordered.clone())
            .unwrap_or_default()
    }
}

impl TranslatorRegistry for TranslatorCache {
    fn get(&self, id: &str) -> Option<Arc<TranslatorDescriptor>> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        match state.as_ref() {
            Some(state) => state.by_id.get(id).cloned(),
            None => {
                warn!(id, "Translator cache used before init()");
                None
            }
        }
    }

    fn get_all_for_type(&self, mode: Mode) -> Vec<Arc<TranslatorDescriptor>> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        match state.as_ref() {
            Some(state) => state.by_mode.get(&mode).cloned().unwrap_or_default(),
            None => {
                warn!(mode = %mode, "Translator cache used before init()");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(id: &str, label: &str, types: u8, priority: i32) -> String {
        format!(
            r#"{{"translatorID": "{}", "label": "{}", "translatorType": {}, "priority": {}}}
native:{}"#,
            id, label, types, priority, label
        )
    }

    fn leak(text: String) -> &'static str {
        Box::leak(text.into_boxed_str())
    }

    #[test]
    fn test_first_loaded_wins() {
        let cache = TranslatorCache::new().with_source(StaticSource::new(
            "test",
            vec![leak(header("dup", "First", 1, 100)), leak(header("dup", "Second", 1, 100))],
        ));
        assert_eq!(cache.init().unwrap(), 1);
        assert_eq!(cache.get("dup").unwrap().label, "First");
    }

    #[test]
    fn test_bad_metadata_skipped() {
        let cache = TranslatorCache::new().with_source(StaticSource::new(
            "test",
            vec!["{ broken", leak(header("ok", "Fine", 4, 100))],
        ));
        assert_eq!(cache.init().unwrap(), 1);
        assert!(cache.get("ok").is_some());
    }

    #[test]
    fn test_candidates_ordered_by_priority_then_load_order() {
        let cache = TranslatorCache::new().with_source(StaticSource::new(
            "test",
            vec![
                leak(header("a", "A", 1, 200)),
                leak(header("b", "B", 1, 100)),
                leak(header("c", "C", 3, 100)),
                leak(header("d", "D", 2, 50)),
            ],
        ));
        cache.init().unwrap();

        let import: Vec<String> = cache.get_all_for_type(Mode::Import).iter().map(|d| d.id.clone()).collect();
        assert_eq!(import, vec!["b", "c", "a"]);
        let export: Vec<String> = cache.get_all_for_type(Mode::Export).iter().map(|d| d.id.clone()).collect();
        assert_eq!(export, vec!["d", "c"]);
        assert!(cache.get_all_for_type(Mode::Web).is_empty());
    }

    #[test]
    fn test_init_and_invalidate() {
        let cache = TranslatorCache::new().with_source(StaticSource::new("test", vec![leak(header("x", "X", 1, 1))]));
        assert!(cache.get("x").is_none());
        cache.init().unwrap();
        assert!(cache.is_initialized());
        cache.invalidate();
        assert!(!cache.is_initialized());
        assert!(cache.get_all_for_type(Mode::Import).is_empty());
    }

    #[test]
    fn test_directory_source_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.js"), header("same", "FromB", 1, 100)).unwrap();
        std::fs::write(dir.path().join("a.js"), header("same", "FromA", 1, 100)).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("c.json"), header("other", "FromJson", 1, 100)).unwrap();

        let cache = TranslatorCache::new().with_source(DirectorySource::new(dir.path()));
        assert_eq!(cache.init().unwrap(), 1);
        let descriptor = cache.get("same").unwrap();
        assert_eq!(descriptor.label, "FromA");
        assert_eq!(descriptor.source().unwrap(), "native:FromA");
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn test_missing_directory_fails_init() {
        let cache = TranslatorCache::new().with_source(DirectorySource::new("/definitely/not/here"));
        assert!(cache.init().is_err());
    }
}
