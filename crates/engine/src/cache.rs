use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use verlay_sandbox::Exports;

/// Module exports keyed by the absolute path they were evaluated at.
/// 以模組執行時的絕對路徑為鍵的匯出快取。
///
/// Filled while a build runs and frozen once the snapshot is published.
#[derive(Clone, Default)]
pub struct PathCache {
    entries: HashMap<PathBuf, Exports>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&Exports> {
        self.entries.get(path)
    }

    /// Looks `path` up as given, then with each extension appended.
    /// 先以原路徑查詢，再依序補上各副檔名查詢。
    pub fn lookup(&self, path: &Path, extensions: &[String]) -> Option<&Exports> {
        if let Some(hit) = self.entries.get(path) {
            return Some(hit);
        }
        extensions
            .iter()
            .find_map(|ext| self.entries.get(&with_appended_extension(path, ext)))
    }

    /// Stores `exports` unless `path` is already cached; returns the cached
    /// entry either way.
    pub(crate) fn insert(&mut self, path: PathBuf, exports: Exports) -> Exports {
        self.entries.entry(path).or_insert(exports).clone()
    }
}

impl fmt::Debug for PathCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self.entries.keys().collect();
        paths.sort();
        f.debug_struct("PathCache").field("paths", &paths).finish()
    }
}

/// `lib/index` + `rhai` -> `lib/index.rhai`, keeping any existing dots.
pub(crate) fn with_appended_extension(path: &Path, ext: &str) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(".");
    raw.push(ext);
    PathBuf::from(raw)
}
