//! Virtual ↔ real path translation.
//!
//! ```text
//! virtual namespace            real namespace
//! /css/style.css   ──probe──►  <root>/css/style.scss   (first existing
//!                              <root>/css/style.sass    candidate wins,
//!                              <root>/css/style.css     literal last)
//!
//! readdir <root>/css: [style.scss, logo.png]  ──►  [style.css, logo.png]
//! ```
//!
//! Successful probes are memoized in the source-file map; a memo that turns
//! out stale (backing file deleted) is dropped and the path re-probed.

use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::compiler::{ExtensionMaps, extension_of};
use crate::error::FsError;

/// Outcome of resolving a virtual path.
#[derive(Debug)]
pub struct Resolved {
    /// Backing real path.
    pub real: PathBuf,
    /// Metadata fetched while probing, if any.
    pub metadata: Option<Metadata>,
}

/// Maps virtual paths onto the source tree.
pub struct PathTranslator {
    root: PathBuf,
    maps: Arc<ExtensionMaps>,
    source_files: RwLock<FxHashMap<String, PathBuf>>,
}

impl PathTranslator {
    /// Translator for the tree at `root` (expected absolute).
    pub fn new(root: impl Into<PathBuf>, maps: Arc<ExtensionMaps>) -> Self {
        Self {
            root: root.into(),
            maps,
            source_files: RwLock::new(FxHashMap::default()),
        }
    }

    /// Source root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Extension tables.
    pub fn maps(&self) -> &ExtensionMaps {
        &self.maps
    }

    /// Real path with the same name as `virtual_path`.
    pub fn literal(&self, virtual_path: &str) -> PathBuf {
        let rel = virtual_path.trim_start_matches('/');
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    /// Virtual name for a real directory entry, recording the mapping.
    ///
    /// Only regular files are renamed; directories keep their name.
    pub fn virtual_name_of(&self, dir: &str, real_name: &str) -> String {
        let real = self.literal(&join_virtual(dir, real_name));
        match self.renamed(real_name) {
            Some((virtual_name, _)) if real.is_file() => {
                self.source_files
                    .write()
                    .insert(join_virtual(dir, &virtual_name), real);
                virtual_name
            }
            _ => real_name.to_string(),
        }
    }

    /// Virtual name and candidate rank for a compiled real name.
    fn renamed(&self, real_name: &str) -> Option<(String, usize)> {
        let source = extension_of(real_name)?;
        let target = self.maps.target_of(&source)?;
        let rank = self.maps.rank(&source, target).unwrap_or(usize::MAX - 1);
        let virtual_name = Path::new(real_name)
            .with_extension(target.trim_start_matches('.'))
            .to_string_lossy()
            .into_owned();
        Some((virtual_name, rank))
    }

    /// Resolve the real path backing `virtual_path`.
    pub fn resolve_real(&self, virtual_path: &str) -> Result<Resolved, FsError> {
        if let Some(real) = self.source_files.read().get(virtual_path) {
            return Ok(Resolved {
                real: real.clone(),
                metadata: None,
            });
        }

        let literal = self.literal(virtual_path);
        let candidates = extension_of(virtual_path)
            .map(|ext| self.maps.sources_of(&ext))
            .unwrap_or(&[]);
        if candidates.is_empty() {
            return Ok(Resolved {
                real: literal,
                metadata: None,
            });
        }

        for source_ext in candidates {
            let candidate = literal.with_extension(source_ext.trim_start_matches('.'));
            if let Ok(metadata) = fs::metadata(&candidate)
                && metadata.is_file()
            {
                tracing::trace!(virtual_path, real = %candidate.display(), "resolved source");
                self.source_files
                    .write()
                    .insert(virtual_path.to_string(), candidate.clone());
                return Ok(Resolved {
                    real: candidate,
                    metadata: Some(metadata),
                });
            }
        }

        // Not memoized: a source created later must still win.
        match fs::metadata(&literal) {
            Ok(metadata) => Ok(Resolved {
                real: literal,
                metadata: Some(metadata),
            }),
            Err(e) => Err(FsError::io(literal, e)),
        }
    }

    /// Resolve and stat, re-probing once when a memo turned out stale.
    pub fn resolve_stat(&self, virtual_path: &str) -> Result<(PathBuf, Metadata), FsError> {
        let resolved = self.resolve_real(virtual_path)?;
        if let Some(metadata) = resolved.metadata {
            return Ok((resolved.real, metadata));
        }

        match fs::metadata(&resolved.real) {
            Ok(metadata) => Ok((resolved.real, metadata)),
            Err(e) => {
                let err = FsError::io(&resolved.real, e);
                if err.is_not_found() && self.forget(virtual_path) {
                    tracing::debug!(virtual_path, "stale source mapping, re-probing");
                    let resolved = self.resolve_real(virtual_path)?;
                    let metadata = match resolved.metadata {
                        Some(m) => m,
                        None => fs::metadata(&resolved.real)
                            .map_err(|e| FsError::io(&resolved.real, e))?,
                    };
                    return Ok((resolved.real, metadata));
                }
                Err(err)
            }
        }
    }

    /// Drop a memoized mapping. Returns whether one existed.
    pub fn forget(&self, virtual_path: &str) -> bool {
        self.source_files.write().remove(virtual_path).is_some()
    }

    /// Rewrite a real directory listing into virtual names.
    ///
    /// When several real files map to the same virtual name, the highest
    /// priority source extension wins and a literal file loses to any
    /// compiled source, matching [`PathTranslator::resolve_real`]. Entries
    /// keep the position of the first file claiming their name. Only entries
    /// for which `is_file` holds are renamed.
    pub fn rewrite_listing<K>(
        &self,
        dir: &str,
        entries: Vec<(String, K)>,
        is_file: impl Fn(&str, &K) -> bool,
    ) -> Vec<(String, K)> {
        struct Slot<K> {
            virtual_name: String,
            real_name: String,
            kind: K,
            rank: usize,
        }

        let mut index: FxHashMap<String, usize> = FxHashMap::default();
        let mut slots: Vec<Slot<K>> = Vec::with_capacity(entries.len());

        for (real_name, kind) in entries {
            let (virtual_name, rank) = is_file(&real_name, &kind)
                .then(|| self.renamed(&real_name))
                .flatten()
                .unwrap_or_else(|| (real_name.clone(), usize::MAX));
            let slot = Slot {
                virtual_name,
                real_name,
                kind,
                rank,
            };
            match index.get(&slot.virtual_name) {
                Some(&i) if slot.rank < slots[i].rank => slots[i] = slot,
                Some(_) => {}
                None => {
                    index.insert(slot.virtual_name.clone(), slots.len());
                    slots.push(slot);
                }
            }
        }

        let mut memo = self.source_files.write();
        slots
            .into_iter()
            .map(|slot| {
                if slot.rank != usize::MAX {
                    memo.insert(
                        join_virtual(dir, &slot.virtual_name),
                        self.literal(&join_virtual(dir, &slot.real_name)),
                    );
                }
                (slot.virtual_name, slot.kind)
            })
            .collect()
    }
}

/// Join a virtual directory and a name.
pub fn join_virtual(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", dir.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileFailure, CompileOptions, Compiled, Compiler, CompilerRegistry};
    use std::fs;
    use tempfile::TempDir;

    struct Stub(&'static str, &'static str);

    impl Compiler for Stub {
        fn source_ext(&self) -> &str {
            self.0
        }
        fn output_ext(&self) -> &str {
            self.1
        }
        fn compile(&self, _: &Path, _: &CompileOptions) -> Result<Compiled, CompileFailure> {
            Ok(Compiled::default())
        }
    }

    fn translator(dir: &TempDir) -> PathTranslator {
        let registry = CompilerRegistry::new()
            .with(Stub(".scss", ".css"))
            .with(Stub(".less", ".css"));
        PathTranslator::new(dir.path(), Arc::new(ExtensionMaps::build(&registry)))
    }

    #[test]
    fn test_join_virtual() {
        assert_eq!(join_virtual("/", "a.css"), "/a.css");
        assert_eq!(join_virtual("/css", "a.css"), "/css/a.css");
        assert_eq!(join_virtual("/css/", "a.css"), "/css/a.css");
    }

    #[test]
    fn test_passthrough_is_literal() {
        let dir = TempDir::new().unwrap();
        let t = translator(&dir);
        let resolved = t.resolve_real("/notes.txt").unwrap();
        assert_eq!(resolved.real, dir.path().join("notes.txt"));
        assert!(resolved.metadata.is_none());
    }

    #[test]
    fn test_probe_in_priority_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("style.less"), "").unwrap();
        fs::write(dir.path().join("style.scss"), "").unwrap();
        let t = translator(&dir);

        let resolved = t.resolve_real("/style.css").unwrap();
        assert_eq!(resolved.real, dir.path().join("style.scss"));
        assert!(resolved.metadata.is_some());

        // memoized: no metadata on the second call
        let again = t.resolve_real("/style.css").unwrap();
        assert_eq!(again.real, dir.path().join("style.scss"));
        assert!(again.metadata.is_none());
    }

    #[test]
    fn test_literal_fallback_and_not_found() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("plain.css"), "a{}").unwrap();
        let t = translator(&dir);

        assert_eq!(t.resolve_real("/plain.css").unwrap().real, dir.path().join("plain.css"));
        assert!(t.resolve_real("/missing.css").unwrap_err().is_not_found());
    }

    #[test]
    fn test_stale_memo_is_reprobed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x.scss"), "").unwrap();
        let t = translator(&dir);
        t.resolve_real("/x.css").unwrap();

        fs::remove_file(dir.path().join("x.scss")).unwrap();
        fs::write(dir.path().join("x.less"), "").unwrap();

        let (real, _) = t.resolve_stat("/x.css").unwrap();
        assert_eq!(real, dir.path().join("x.less"));

        fs::remove_file(dir.path().join("x.less")).unwrap();
        assert!(t.resolve_stat("/x.css").unwrap_err().is_not_found());
        // the failed lookup left no memo behind
        assert!(!t.forget("/x.css"));
    }

    #[test]
    fn test_rewrite_listing() {
        let dir = TempDir::new().unwrap();
        for name in ["a.less", "a.scss", "a.css", "logo.png", "b.scss"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let t = translator(&dir);

        let listing = vec![
            ("a.less".to_string(), 1),
            ("a.scss".to_string(), 2),
            ("a.css".to_string(), 3),
            ("logo.png".to_string(), 4),
            ("b.scss".to_string(), 5),
        ];
        let out = t.rewrite_listing("/", listing, |_, _| true);

        assert_eq!(
            out,
            vec![
                ("a.css".to_string(), 2),
                ("logo.png".to_string(), 4),
                ("b.css".to_string(), 5),
            ]
        );
        assert_eq!(t.resolve_real("/a.css").unwrap().real, dir.path().join("a.scss"));
        assert_eq!(t.resolve_real("/b.css").unwrap().real, dir.path().join("b.scss"));
    }

    #[test]
    fn test_directories_keep_their_name() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("theme.scss")).unwrap();
        fs::write(dir.path().join("theme.scss/inner.txt"), "").unwrap();
        fs::write(dir.path().join("main.scss"), "").unwrap();
        let t = translator(&dir);

        let listing = vec![("main.scss".to_string(), true), ("theme.scss".to_string(), false)];
        let out = t.rewrite_listing("/", listing, |_, is_file| *is_file);
        assert_eq!(out, vec![("main.css".to_string(), true), ("theme.scss".to_string(), false)]);

        assert!(!t.forget("/theme.css"));
        assert!(t.resolve_real("/theme.css").unwrap_err().is_not_found());
        assert_eq!(
            t.resolve_real("/theme.scss/inner.txt").unwrap().real,
            dir.path().join("theme.scss/inner.txt")
        );
    }

    #[test]
    fn test_virtual_name_of() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("site.less"), "").unwrap();
        fs::create_dir(dir.path().join("vendor.scss")).unwrap();
        let t = translator(&dir);

        assert_eq!(t.virtual_name_of("/", "site.less"), "site.css");
        assert_eq!(t.virtual_name_of("/", "vendor.scss"), "vendor.scss");
        assert_eq!(t.virtual_name_of("/", "logo.png"), "logo.png");

        // the listing name resolves without probing
        let resolved = t.resolve_real("/site.css").unwrap();
        assert_eq!(resolved.real, dir.path().join("site.less"));
        assert!(resolved.metadata.is_none());
    }
}
