//! Mount configuration.
//!
//! Use [`OptionsBuilder`] to assemble [`MountOptions`] before constructing a
//! [`crate::TranspileFs`]. Options are fixed for the lifetime of a mount.

use std::thread;
use std::time::Duration;

/// Default autoprefixer target list.
pub const DEFAULT_BROWSERS: &[&str] = &["last 2 versions"];

/// Runtime configuration for one mount.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Glob patterns (virtual namespace, rooted at `/`) whose files get live
    /// invalidation. Empty disables change notification.
    pub watches: Vec<String>,
    /// Log every filesystem request at `info` instead of `trace`.
    pub verbose: bool,
    /// Whether compilers should emit source-map annotations.
    pub source_map: bool,
    /// Target list handed to CSS post-processors.
    pub browsers: Vec<String>,
    /// Recompile on change events instead of only invalidating.
    pub prewarm: bool,
    /// How long the kernel may cache attributes and entries.
    pub attr_ttl: Duration,
    /// Worker threads for compilation.
    pub compile_threads: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            watches: Vec::new(),
            verbose: false,
            source_map: true,
            browsers: DEFAULT_BROWSERS.iter().map(|s| s.to_string()).collect(),
            prewarm: false,
            attr_ttl: Duration::from_secs(1),
            compile_threads: thread::available_parallelism().map_or(4, |n| n.get()),
        }
    }
}

impl MountOptions {
    /// Watch patterns normalized to begin with `/`.
    pub fn normalized_watches(&self) -> Vec<String> {
        self.watches.iter().map(|p| normalize_pattern(p)).collect()
    }
}

/// Prefix a pattern with `/` so it matches virtual paths.
pub fn normalize_pattern(pattern: &str) -> String {
    if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        format!("/{pattern}")
    }
}

/// Configuration builder for fluent API.
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    watches: Vec<String>,
    verbose: Option<bool>,
    source_map: Option<bool>,
    browsers: Option<Vec<String>>,
    prewarm: Option<bool>,
    attr_ttl: Option<Duration>,
    compile_threads: Option<usize>,
}

impl OptionsBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a watch pattern.
    ///
    /// # Example
    ///
    /// ```
    /// use transpile_fs::config::OptionsBuilder;
    ///
    /// let options = OptionsBuilder::new().watch("**/*.scss").build();
    /// assert_eq!(options.normalized_watches(), vec!["/**/*.scss".to_string()]);
    /// ```
    pub fn watch(mut self, pattern: impl Into<String>) -> Self {
        self.watches.push(pattern.into());
        self
    }

    /// Add several watch patterns.
    pub fn watches<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watches.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Enable diagnostic logging.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = Some(verbose);
        self
    }

    /// Toggle source-map annotations. Default: on.
    pub fn source_map(mut self, enabled: bool) -> Self {
        self.source_map = Some(enabled);
        self
    }

    /// Replace the browser target list.
    pub fn browsers<I, S>(mut self, browsers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.browsers = Some(browsers.into_iter().map(Into::into).collect());
        self
    }

    /// Recompile eagerly on change events.
    pub fn prewarm(mut self, prewarm: bool) -> Self {
        self.prewarm = Some(prewarm);
        self
    }

    /// Attribute cache TTL reported to the kernel.
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = Some(ttl);
        self
    }

    /// Number of compile worker threads (minimum 1).
    pub fn compile_threads(mut self, threads: usize) -> Self {
        self.compile_threads = Some(threads.max(1));
        self
    }

    /// Build the options, filling unset fields with defaults.
    pub fn build(self) -> MountOptions {
        let defaults = MountOptions::default();
        MountOptions {
            watches: self.watches,
            verbose: self.verbose.unwrap_or(defaults.verbose),
            source_map: self.source_map.unwrap_or(defaults.source_map),
            browsers: self.browsers.unwrap_or(defaults.browsers),
            prewarm: self.prewarm.unwrap_or(defaults.prewarm),
            attr_ttl: self.attr_ttl.unwrap_or(defaults.attr_ttl),
            compile_threads: self.compile_threads.unwrap_or(defaults.compile_threads),
        }
    }
}
