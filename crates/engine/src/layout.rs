use std::path::{Component, Path, PathBuf};

use verlay_sandbox::normalize_path;

/// Maps paths between the source root and per-version directories under the
/// target root.
/// 在來源根目錄與目標根目錄下各版本目錄之間轉換路徑。
///
/// `<source_root>/lib/a.rhai` corresponds to
/// `<target_root>/<version>/lib/a.rhai` in every version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    source_root: PathBuf,
    target_root: PathBuf,
}

impl Layout {
    pub fn new(source_root: impl AsRef<Path>, target_root: impl AsRef<Path>) -> Self {
        Self {
            source_root: normalize_path(source_root.as_ref()),
            target_root: normalize_path(target_root.as_ref()),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.target_root.join(version)
    }

    /// True for paths inside some version directory.
    pub fn is_versioned(&self, path: &Path) -> bool {
        self.version_of(path).is_some()
    }

    /// Version directory name `path` lives in.
    /// 取得 `path` 所在的版本目錄名稱。
    pub fn version_of<'a>(&self, path: &'a Path) -> Option<&'a str> {
        let rest = path.strip_prefix(&self.target_root).ok()?;
        match rest.components().next()? {
            Component::Normal(name) => name.to_str(),
            _ => None,
        }
    }

    /// Path relative to its tree root: the version directory for versioned
    /// paths, the source root otherwise.
    /// 取得相對於所屬樹根的路徑：版本路徑相對於版本目錄，其他則相對於來源根目錄。
    pub fn relative_path(&self, path: &Path) -> Option<PathBuf> {
        if let Some(version) = self.version_of(path) {
            let rest = path
                .strip_prefix(self.target_root.join(version))
                .ok()?
                .to_path_buf();
            return Some(rest);
        }
        if path.starts_with(&self.target_root) {
            return None;
        }
        path.strip_prefix(&self.source_root)
            .ok()
            .map(Path::to_path_buf)
    }

    /// Counterpart of `path` under the source root.
    pub fn base_path(&self, path: &Path) -> Option<PathBuf> {
        self.relative_path(path)
            .map(|relative| self.source_root.join(relative))
    }

    /// Counterpart of `path` inside `version`'s directory.
    /// 取得 `path` 在指定版本目錄中的對應路徑。
    pub fn remap(&self, path: &Path, version: &str) -> Option<PathBuf> {
        self.relative_path(path)
            .map(|relative| self.version_dir(version).join(relative))
    }
}
