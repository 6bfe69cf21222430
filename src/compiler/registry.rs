//! Compiler registry and extension lookup tables.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::{Compiler, PostProcessor, SharedCompiler, Verbatim, normalize_ext};

// =============================================================================
// CompilerRegistry
// =============================================================================

/// Ordered set of compilers. Registration order is priority order.
#[derive(Default, Clone)]
pub struct CompilerRegistry {
    compilers: Vec<SharedCompiler>,
    post_processors: Vec<Arc<dyn PostProcessor>>,
}

impl CompilerRegistry {
    /// Empty registry: the mount becomes a plain pass-through view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the compilers built into this crate.
    pub fn builtin() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "scss")]
        {
            registry = registry
                .with(super::ScssCompiler::scss())
                .with(super::ScssCompiler::sass());
        }
        registry
    }

    /// Append a compiler at the lowest priority so far.
    pub fn with(mut self, compiler: impl Compiler + 'static) -> Self {
        self.compilers.push(Arc::new(compiler));
        self
    }

    /// Append an already shared compiler.
    pub fn with_shared(mut self, compiler: SharedCompiler) -> Self {
        self.compilers.push(compiler);
        self
    }

    /// Register an output filter.
    pub fn with_post_processor(mut self, processor: impl PostProcessor + 'static) -> Self {
        self.post_processors.push(Arc::new(processor));
        self
    }

    /// Compilers in priority order.
    pub fn compilers(&self) -> &[SharedCompiler] {
        &self.compilers
    }

    /// Number of registered compilers.
    pub fn len(&self) -> usize {
        self.compilers.len()
    }

    /// Whether no compiler is registered.
    pub fn is_empty(&self) -> bool {
        self.compilers.is_empty()
    }
}

// =============================================================================
// ExtensionMaps
// =============================================================================

/// Immutable lookup tables between source and target extensions.
///
/// - `target_of`: source extension → the single target extension it is
///   exposed under (first registrant wins).
/// - `sources_of`: target extension → candidate source extensions, in
///   registry order. Lower-priority compilers claiming an already taken
///   source extension still show up here as alternate backing candidates.
pub struct ExtensionMaps {
    target_of: FxHashMap<String, String>,
    sources_of: FxHashMap<String, Vec<String>>,
    compilers: FxHashMap<(String, String), SharedCompiler>,
    verbatim: FxHashMap<String, SharedCompiler>,
    post_processors: FxHashMap<String, Vec<Arc<dyn PostProcessor>>>,
}

impl ExtensionMaps {
    /// Build the tables from a registry.
    pub fn build(registry: &CompilerRegistry) -> Self {
        let mut maps = Self {
            target_of: FxHashMap::default(),
            sources_of: FxHashMap::default(),
            compilers: FxHashMap::default(),
            verbatim: FxHashMap::default(),
            post_processors: FxHashMap::default(),
        };

        for compiler in registry.compilers() {
            let source = normalize_ext(compiler.source_ext());
            let target = normalize_ext(compiler.output_ext());

            maps.target_of
                .entry(source.clone())
                .or_insert_with(|| target.clone());

            let candidates = maps.sources_of.entry(target.clone()).or_default();
            if !candidates.contains(&source) {
                candidates.push(source.clone());
            }

            maps.compilers
                .entry((source, target))
                .or_insert_with(|| Arc::clone(compiler));
        }

        for target in maps.sources_of.keys() {
            maps.verbatim
                .insert(target.clone(), Arc::new(Verbatim::new(target.clone())));
        }

        for processor in &registry.post_processors {
            maps.post_processors
                .entry(normalize_ext(processor.target_ext()))
                .or_default()
                .push(Arc::clone(processor));
        }

        maps
    }

    /// Target extension a source extension is exposed under.
    pub fn target_of(&self, source_ext: &str) -> Option<&str> {
        self.target_of.get(source_ext).map(String::as_str)
    }

    /// Candidate source extensions for a target extension, in priority order.
    pub fn sources_of(&self, target_ext: &str) -> &[String] {
        self.sources_of
            .get(target_ext)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether some compiler produces `ext`.
    pub fn is_target(&self, ext: &str) -> bool {
        self.sources_of.contains_key(ext)
    }

    /// Compiler turning `source_ext` into `target_ext`.
    ///
    /// A real file already carrying a target extension gets the verbatim
    /// compiler for that extension.
    pub fn compiler_for(&self, source_ext: &str, target_ext: &str) -> Option<SharedCompiler> {
        if source_ext == target_ext {
            return self.verbatim.get(target_ext).cloned();
        }
        self.compilers
            .get(&(source_ext.to_string(), target_ext.to_string()))
            .cloned()
    }

    /// Output filters for a target extension.
    pub fn post_processors(&self, target_ext: &str) -> &[Arc<dyn PostProcessor>] {
        self.post_processors
            .get(target_ext)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Rank of `source_ext` among the candidates for `target_ext`.
    pub(crate) fn rank(&self, source_ext: &str, target_ext: &str) -> Option<usize> {
        self.sources_of(target_ext)
            .iter()
            .position(|s| s == source_ext)
    }
}
