use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::{trace, warn};
use verlay_sandbox::Exports;
use verlay_tree::{Branch, ExportNode, Leaf};

use crate::config::has_script_extension;
use crate::error::VerlayError;
use crate::fs::SourceFs;
use crate::layout::Layout;
use crate::loader::VersionedLoader;

type EntryFilter = dyn Fn(&str, &Path, bool) -> bool + Send + Sync;
type ExportsIterator = dyn Fn(&str, &Path, Exports) -> Exports + Send + Sync;

/// Hooks applied while walking a directory tree.
/// 走訪目錄樹時套用的掛勾。
///
/// The filter receives `(name, path, is_dir)` and skips the entry when it
/// returns false. The iterator receives `(name, path, exports)` for every
/// loaded file and returns the value stored in the tree.
#[derive(Clone, Default)]
pub struct WalkOptions {
    filter: Option<Arc<EntryFilter>>,
    iterator: Option<Arc<ExportsIterator>>,
}

impl WalkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &Path, bool) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_iterator<F>(mut self, iterator: F) -> Self
    where
        F: Fn(&str, &Path, Exports) -> Exports + Send + Sync + 'static,
    {
        self.iterator = Some(Arc::new(iterator));
        self
    }

    pub fn accepts(&self, name: &str, path: &Path, is_dir: bool) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter(name, path, is_dir))
    }

    pub fn transform(&self, name: &str, path: &Path, exports: Exports) -> Exports {
        match &self.iterator {
            Some(iterator) => iterator(name, path, exports),
            None => exports,
        }
    }

    /// Adds a rule skipping `dir` itself, on top of any existing filter.
    pub(crate) fn excluding(self, dir: PathBuf) -> Self {
        let inner = self.filter.clone();
        let iterator = self.iterator;
        let filter: Arc<EntryFilter> = Arc::new(move |name: &str, path: &Path, is_dir: bool| {
            if path == dir {
                return false;
            }
            inner
                .as_ref()
                .map_or(true, |filter| filter(name, path, is_dir))
        });
        Self {
            filter: Some(filter),
            iterator,
        }
    }
}

impl fmt::Debug for WalkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalkOptions")
            .field("filter", &self.filter.is_some())
            .field("iterator", &self.iterator.is_some())
            .finish()
    }
}

/// Turns a directory into a branch of module exports.
/// 將目錄轉換為模組匯出的分支。
pub(crate) struct Walker<'a> {
    layout: &'a Layout,
    fs: &'a dyn SourceFs,
    loader: &'a VersionedLoader,
    ignore: &'a [Regex],
    extensions: &'a [String],
}

impl<'a> Walker<'a> {
    pub(crate) fn new(
        layout: &'a Layout,
        fs: &'a dyn SourceFs,
        loader: &'a VersionedLoader,
        ignore: &'a [Regex],
        extensions: &'a [String],
    ) -> Self {
        Self {
            layout,
            fs,
            loader,
            ignore,
            extensions,
        }
    }

    /// Walks `dir` in sorted order. Every branch and leaf is tagged with the
    /// path it came from.
    /// 依排序走訪 `dir`；每個分支與葉節點都標記來源路徑。
    pub(crate) fn walk(
        &self,
        dir: &Path,
        options: &WalkOptions,
    ) -> Result<Branch<Exports>, VerlayError> {
        let entries = self
            .fs
            .read_dir(dir)
            .map_err(|source| VerlayError::io(dir, source))?;
        let mut branch = Branch::with_provenance(dir);

        for path in entries {
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                warn!(target: "verlay::walk", path = %path.display(), "skipping non UTF-8 entry");
                continue;
            };
            let is_dir = self.fs.is_dir(&path);
            if self.is_ignored(file_name) || !options.accepts(file_name, &path, is_dir) {
                trace!(target: "verlay::walk", path = %path.display(), "entry filtered");
                continue;
            }

            if is_dir {
                let child = self.walk(&path, options)?;
                insert_entry(&mut branch, file_name.to_string(), child.into(), &path);
                continue;
            }
            if !has_script_extension(&path, self.extensions) {
                continue;
            }

            let name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or(file_name)
                .to_string();
            let exports = self.load(&path)?;
            let exports = options.transform(&name, &path, exports);
            let leaf = Leaf::with_provenance(exports, path.clone());
            insert_entry(&mut branch, name, leaf.into(), &path);
        }
        Ok(branch)
    }

    fn load(&self, path: &Path) -> Result<Exports, VerlayError> {
        if self.layout.is_versioned(path) {
            let base = self
                .layout
                .base_path(path)
                .ok_or_else(|| VerlayError::ModuleNotFound(path.to_path_buf()))?;
            self.loader.load_versioned(&base, path)
        } else {
            self.loader.load_direct(path)
        }
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|pattern| pattern.is_match(name))
    }
}

fn insert_entry(branch: &mut Branch<Exports>, name: String, node: ExportNode<Exports>, path: &Path) {
    if branch.insert(name.clone(), node).is_some() {
        warn!(
            target: "verlay::walk",
            name = %name,
            path = %path.display(),
            "name collision, later entry replaces earlier one"
        );
    }
}
