use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use tracing::{debug, info, trace, warn};
use verlay_resolver::VersionSet;
use verlay_sandbox::{normalize_path, CallOutcome, Dynamic, Exports, ImportContext, Sandbox};
use verlay_tree::{deep_clone, deep_merge, Branch};

use crate::cache::PathCache;
use crate::config::VerlayConfig;
use crate::error::VerlayError;
use crate::fs::{DiskFs, SourceFs};
use crate::layout::Layout;
use crate::loader::VersionedLoader;
use crate::pipeline;
use crate::walker::{WalkOptions, Walker};

/// An immutable, fully built set of version trees.
/// 建置完成且不可變的版本樹集合。
#[derive(Debug)]
pub struct VersionSnapshot {
    generation: u64,
    original: Branch<Exports>,
    versions: BTreeMap<String, Branch<Exports>>,
    version_set: VersionSet,
    cache: PathCache,
}

impl VersionSnapshot {
    /// Build counter, starting at 1 for the first build.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn original(&self) -> &Branch<Exports> {
        &self.original
    }

    /// Merged tree of the version directory named `version`.
    pub fn tree(&self, version: &str) -> Option<&Branch<Exports>> {
        self.versions.get(version)
    }

    pub fn version_set(&self) -> &VersionSet {
        &self.version_set
    }

    pub fn cache(&self) -> &PathCache {
        &self.cache
    }

    /// Indented listing of every published tree.
    /// 列出所有已發布的樹，供診斷使用。
    pub fn render(&self) -> String {
        let mut out = format!("original\n{}", self.original.render());
        for version in self.version_set.versions() {
            if let Some(tree) = self.versions.get(version) {
                out.push_str(&format!("{version}\n{}", tree.render()));
            }
        }
        out
    }
}

/// Builds and serves per-version views of a source tree.
/// 建置並提供來源樹在各版本下的檢視。
///
/// The source root holds the base modules. Every directory directly under the
/// target root is a version; files inside it override the base file at the
/// same relative path. Each version's view is the base tree with that
/// version's overrides merged in.
pub struct Multiverse {
    config: VerlayConfig,
    layout: Layout,
    fs: Arc<dyn SourceFs>,
    sandbox: Sandbox,
    ignore: Vec<Regex>,
    snapshot: Option<Arc<VersionSnapshot>>,
    generation: u64,
}

impl Multiverse {
    /// Creates a multiverse over `source_root` and `target_root`, building
    /// immediately when `auto_build` is set.
    /// 建立多重版本管理器；`auto_build` 為真時立即建置。
    pub fn create(
        source_root: impl Into<PathBuf>,
        target_root: impl Into<PathBuf>,
        auto_build: bool,
    ) -> Result<Self, VerlayError> {
        Self::from_config(VerlayConfig::new(source_root, target_root).with_auto_build(auto_build))
    }

    pub fn from_config(config: VerlayConfig) -> Result<Self, VerlayError> {
        Self::with_fs(config, Arc::new(DiskFs))
    }

    /// Same as [`Multiverse::from_config`] with a custom filesystem.
    pub fn with_fs(mut config: VerlayConfig, fs: Arc<dyn SourceFs>) -> Result<Self, VerlayError> {
        config.sanitize();
        config.source_root = absolutize(&config.source_root)?;
        config.target_root = absolutize(&config.target_root)?;
        let ignore = config.ignore_patterns()?;

        let mut multiverse = Self {
            layout: Layout::new(&config.source_root, &config.target_root),
            sandbox: Sandbox::new(config.sandbox),
            fs,
            ignore,
            config,
            snapshot: None,
            generation: 0,
        };
        if multiverse.config.auto_build {
            multiverse.rebuild()?;
        }
        Ok(multiverse)
    }

    pub fn config(&self) -> &VerlayConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Builds with default walk options.
    pub fn rebuild(&mut self) -> Result<Arc<VersionSnapshot>, VerlayError> {
        self.build(WalkOptions::default(), WalkOptions::default())
    }

    /// Walks both roots, merges every version over the base tree and
    /// publishes the result as a new snapshot.
    /// 走訪兩個根目錄，將每個版本合併至基底樹並發布為新的快照。
    ///
    /// The previous snapshot stays published when the build fails.
    pub fn build(
        &mut self,
        base_options: WalkOptions,
        version_options: WalkOptions,
    ) -> Result<Arc<VersionSnapshot>, VerlayError> {
        let started = Instant::now();
        self.check_root(self.layout.source_root())?;
        self.check_root(self.layout.target_root())?;

        let loader = VersionedLoader::recording(
            self.layout.clone(),
            Arc::clone(&self.fs),
            self.sandbox.clone(),
            self.config.extensions.clone(),
        );
        let walker = Walker::new(
            &self.layout,
            self.fs.as_ref(),
            &loader,
            &self.ignore,
            &self.config.extensions,
        );

        let base_options = base_options.excluding(self.layout.target_root().to_path_buf());
        let mut original = walker.walk(self.layout.source_root(), &base_options)?;
        debug!(
            target: "verlay::build",
            modules = original.leaf_count(),
            "base tree walked"
        );

        let mut overrides = BTreeMap::new();
        let target_root = self.layout.target_root();
        let entries = self
            .fs
            .read_dir(target_root)
            .map_err(|source| VerlayError::io(target_root, source))?;
        for entry in entries {
            let Some(version) = entry.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !self.fs.is_dir(&entry) {
                warn!(
                    target: "verlay::build",
                    path = %entry.display(),
                    "ignoring file outside any version directory"
                );
                continue;
            }
            if self.ignore.iter().any(|pattern| pattern.is_match(version))
                || !version_options.accepts(version, &entry, true)
            {
                continue;
            }
            let tree = walker.walk(&entry, &version_options)?;
            overrides.insert(version.to_string(), tree);
        }

        let mut versions = BTreeMap::new();
        for (version, overlay) in overrides {
            let mut merged = deep_clone(&original);
            deep_merge(&mut merged, overlay);
            self.resynthesize(&loader, &version, &mut merged);
            versions.insert(version, merged);
        }

        original.strip_provenance();
        for tree in versions.values_mut() {
            tree.strip_provenance();
        }

        let version_set = VersionSet::from_names(versions.keys().cloned());
        self.generation += 1;
        let snapshot = Arc::new(VersionSnapshot {
            generation: self.generation,
            original,
            versions,
            version_set,
            cache: loader.take_cache(),
        });
        info!(
            target: "verlay::build",
            generation = snapshot.generation,
            versions = ?snapshot.version_set.versions(),
            cached = snapshot.cache.len(),
            elapsed = ?started.elapsed(),
            "version trees built"
        );
        trace!(target: "verlay::build", tree = %snapshot.render(), "published trees");
        self.snapshot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Re-evaluates every base leaf of `tree` as if it lived in `version`'s
    /// directory, so that its imports see that version's modules.
    fn resynthesize(&self, loader: &VersionedLoader, version: &str, tree: &mut Branch<Exports>) {
        let layout = &self.layout;
        tree.for_each_leaf_mut(|_, leaf| {
            let Some(path) = leaf.provenance().map(Path::to_path_buf) else {
                return;
            };
            if layout.is_versioned(&path) {
                return;
            }
            let Some(remapped) = layout.remap(&path, version) else {
                return;
            };
            match loader.load_versioned(&path, &remapped) {
                Ok(exports) => leaf.value = exports,
                Err(err) => {
                    let failure = VerlayError::Synthesis {
                        path: remapped.clone(),
                        source: Box::new(err),
                    };
                    warn!(target: "verlay::build", version, error = %failure, "keeping base exports");
                    loader.remember(&remapped, leaf.value.clone());
                }
            }
        });
    }

    fn check_root(&self, root: &Path) -> Result<(), VerlayError> {
        if self.fs.is_dir(root) {
            Ok(())
        } else {
            Err(VerlayError::Configuration {
                path: root.to_path_buf(),
                reason: "not a readable directory".to_string(),
            })
        }
    }

    pub fn snapshot(&self) -> Option<Arc<VersionSnapshot>> {
        self.snapshot.clone()
    }

    /// Version identifiers, highest first. Empty before the first build.
    pub fn versions(&self) -> Vec<String> {
        self.snapshot
            .as_deref()
            .map(|snapshot| snapshot.version_set.versions().to_vec())
            .unwrap_or_default()
    }

    /// Highest version satisfying `spec`, if any.
    /// 取得符合 `spec` 的最高版本。
    pub fn find_version(&self, spec: Option<&str>) -> Option<&str> {
        self.snapshot.as_deref()?.version_set.find(spec)
    }

    /// Tree for the highest version satisfying `spec`, falling back to the
    /// original tree. `None` only before the first build.
    /// 取得符合 `spec` 的最高版本之樹；若無符合則回傳原始樹。
    pub fn version_tree(&self, spec: Option<&str>) -> Option<&Branch<Exports>> {
        let snapshot = self.snapshot.as_deref()?;
        let tree = snapshot
            .version_set
            .find(spec)
            .and_then(|version| snapshot.versions.get(version))
            .unwrap_or(&snapshot.original);
        Some(tree)
    }

    pub fn original_tree(&self) -> Option<&Branch<Exports>> {
        self.snapshot.as_deref().map(VersionSnapshot::original)
    }

    /// Loads `relative_path` as seen from `caller_dir` in the version matching
    /// `spec`, or from the source tree when no version matches.
    /// 以 `caller_dir` 為基準，在符合 `spec` 的版本中載入 `relative_path`；無符合版本時載入原始模組。
    ///
    /// Modules evaluated during the build are returned as the same shared
    /// instance; anything else is loaded fresh and not cached.
    pub fn require_version(
        &self,
        caller_dir: impl AsRef<Path>,
        relative_path: impl AsRef<Path>,
        spec: Option<&str>,
    ) -> Result<Exports, VerlayError> {
        let snapshot = self.snapshot.as_deref().ok_or(VerlayError::NotBuilt)?;
        let logical = normalize_path(&caller_dir.as_ref().join(relative_path.as_ref()));
        let target = match snapshot.version_set.find(spec) {
            Some(version) => self
                .layout
                .remap(&logical, version)
                .unwrap_or_else(|| logical.clone()),
            None => logical,
        };

        if let Some(hit) = snapshot.cache.lookup(&target, &self.config.extensions) {
            return Ok(hit.clone());
        }
        debug!(target: "verlay::loader", module = %target.display(), "cache miss, loading directly");
        self.published_loader(snapshot).load_path(&target)
    }

    /// Calls a function exported by `exports`. Imports inside the function
    /// resolve like the module's own imports: relative to the module's path,
    /// through the published cache.
    /// 呼叫 `exports` 匯出的函式；函式內的匯入與模組本身的匯入解析方式相同。
    pub fn call(
        &self,
        exports: &Exports,
        function: &str,
        args: Vec<Dynamic>,
    ) -> Result<CallOutcome, VerlayError> {
        Ok(self
            .sandbox
            .call(exports, function, args, &self.import_context())?)
    }

    /// Synthesizes one versioned module outside of a build. Imports are
    /// served from the published cache when one exists.
    /// 在建置流程之外合成單一版本化模組。
    pub fn build_versioned_file(
        &self,
        base_path: &Path,
        override_path: &Path,
    ) -> Result<Exports, VerlayError> {
        pipeline::build_versioned_file(
            self.fs.as_ref(),
            &self.sandbox,
            base_path,
            override_path,
            &self.import_context(),
        )
    }

    fn import_context(&self) -> ImportContext {
        let cache = self
            .snapshot
            .as_deref()
            .map(|snapshot| snapshot.cache.clone())
            .unwrap_or_default();
        ImportContext::new(self.loader_over(cache))
    }

    fn published_loader(&self, snapshot: &VersionSnapshot) -> Arc<VersionedLoader> {
        self.loader_over(snapshot.cache.clone())
    }

    fn loader_over(&self, cache: PathCache) -> Arc<VersionedLoader> {
        VersionedLoader::published(
            self.layout.clone(),
            Arc::clone(&self.fs),
            self.sandbox.clone(),
            self.config.extensions.clone(),
            cache,
        )
    }
}

fn absolutize(path: &Path) -> Result<PathBuf, VerlayError> {
    if path.is_absolute() {
        return Ok(normalize_path(path));
    }
    let cwd = std::env::current_dir().map_err(|source| VerlayError::io(path, source))?;
    Ok(normalize_path(&cwd.join(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn queries_before_build_are_empty() {
        let dir = tempdir().unwrap();
        let multiverse =
            Multiverse::create(dir.path(), dir.path().join("versions"), false).unwrap();
        assert!(multiverse.versions().is_empty());
        assert!(multiverse.version_tree(Some("*")).is_none());
        assert!(matches!(
            multiverse.require_version(dir.path(), "./a", None),
            Err(VerlayError::NotBuilt)
        ));
    }

    #[test]
    fn missing_target_root_is_configuration_error() {
        let dir = tempdir().unwrap();
        let err = Multiverse::create(dir.path(), dir.path().join("versions"), true)
            .err()
            .unwrap();
        assert!(matches!(err, VerlayError::Configuration { .. }));
    }

    #[test]
    fn rebuild_bumps_generation_and_keeps_old_snapshot() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("versions/v1.0.0")).unwrap();
        fs::write(dir.path().join("a.rhai"), "export let n = 1;").unwrap();

        let mut multiverse =
            Multiverse::create(dir.path(), dir.path().join("versions"), true).unwrap();
        let first = multiverse.snapshot().unwrap();
        assert_eq!(first.generation(), 1);

        fs::write(dir.path().join("versions/v1.0.0/a.rhai"), "n = 2;").unwrap();
        let second = multiverse.rebuild().unwrap();
        assert_eq!(second.generation(), 2);
        assert_eq!(
            first
                .tree("v1.0.0")
                .and_then(|tree| tree.leaf_value(&["a"]))
                .and_then(|exports| exports.var::<i64>("n")),
            Some(1)
        );
    }

    #[test]
    fn render_lists_every_tree() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("versions/v1.0.0")).unwrap();
        fs::create_dir_all(dir.path().join("versions/v2.0.0")).unwrap();
        fs::write(dir.path().join("a.rhai"), "export let n = 1;").unwrap();
        fs::write(dir.path().join("versions/v2.0.0/b.rhai"), "export let m = 2;").unwrap();

        let multiverse =
            Multiverse::create(dir.path(), dir.path().join("versions"), true).unwrap();
        let rendered = multiverse.snapshot().unwrap().render();
        let original = rendered.find("original").unwrap();
        let newer = rendered.find("v2.0.0").unwrap();
        let older = rendered.find("v1.0.0").unwrap();
        assert!(original < newer && newer < older, "{rendered}");
        assert!(rendered.contains("\nb\n"), "{rendered}");
    }

    #[test]
    fn roots_are_normalized() {
        let dir = tempdir().unwrap();
        let config = VerlayConfig::new(dir.path().join("src/../src"), dir.path().join("src/v"))
            .with_auto_build(false);
        let multiverse = Multiverse::from_config(config).unwrap();
        assert_eq!(multiverse.layout().source_root(), dir.path().join("src"));
    }
}
