use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};
use verlay_sandbox::{DirectLoader, Exports, ImportContext, ModuleLoader, Sandbox, SandboxError};

use crate::cache::{with_appended_extension, PathCache};
use crate::config::has_script_extension;
use crate::error::VerlayError;
use crate::fs::SourceFs;
use crate::layout::Layout;
use crate::pipeline::build_versioned_file;

/// Resolves module requests for scripts evaluated inside a version tree.
/// 為版本樹中執行的腳本解析模組請求。
///
/// Paths inside a version directory are synthesized from their base
/// counterpart and the version's override; every other path is read and run
/// as is. Results are cached by path while a build records them, so every
/// importer of a module shares one evaluation.
pub(crate) struct VersionedLoader {
    this: Weak<VersionedLoader>,
    layout: Layout,
    fs: Arc<dyn SourceFs>,
    sandbox: Sandbox,
    extensions: Vec<String>,
    cache: RwLock<PathCache>,
    loading: Mutex<HashSet<PathBuf>>,
    record: bool,
}

impl VersionedLoader {
    /// Loader used during a build: every evaluation is cached.
    pub(crate) fn recording(
        layout: Layout,
        fs: Arc<dyn SourceFs>,
        sandbox: Sandbox,
        extensions: Vec<String>,
    ) -> Arc<Self> {
        Self::create(layout, fs, sandbox, extensions, PathCache::new(), true)
    }

    /// Loader over a published cache: hits are shared, misses are evaluated
    /// fresh and never stored.
    pub(crate) fn published(
        layout: Layout,
        fs: Arc<dyn SourceFs>,
        sandbox: Sandbox,
        extensions: Vec<String>,
        cache: PathCache,
    ) -> Arc<Self> {
        Self::create(layout, fs, sandbox, extensions, cache, false)
    }

    fn create(
        layout: Layout,
        fs: Arc<dyn SourceFs>,
        sandbox: Sandbox,
        extensions: Vec<String>,
        cache: PathCache,
        record: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            layout,
            fs,
            sandbox,
            extensions,
            cache: RwLock::new(cache),
            loading: Mutex::new(HashSet::new()),
            record,
        })
    }

    pub(crate) fn take_cache(&self) -> PathCache {
        std::mem::take(&mut *self.cache.write())
    }

    /// Loads whatever `request` names, synthesizing it when it lies inside a
    /// version directory.
    /// 載入 `request` 指向的模組；位於版本目錄內時進行合成。
    pub(crate) fn load_path(&self, request: &Path) -> Result<Exports, VerlayError> {
        let path = self.resolve_script(request);
        if self.layout.is_versioned(&path) {
            let base = self
                .layout
                .base_path(&path)
                .ok_or_else(|| VerlayError::ModuleNotFound(path.clone()))?;
            self.load_versioned(&base, &path)
        } else {
            self.load_direct(&path)
        }
    }

    /// Loads `path` from disk and evaluates it where it lies.
    pub(crate) fn load_direct(&self, path: &Path) -> Result<Exports, VerlayError> {
        if let Some(hit) = self.cached(path) {
            return Ok(hit);
        }
        let _guard = self.enter(path)?;
        let text = match self.fs.read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(VerlayError::ModuleNotFound(path.to_path_buf()));
            }
            Err(source) => return Err(VerlayError::io(path, source)),
        };
        trace!(target: "verlay::loader", module = %path.display(), "loading module");
        let exports = self.sandbox.run_source(&text, path, &self.imports())?;
        Ok(self.remember(path, exports))
    }

    /// Synthesizes the module at `override_path` from its base counterpart.
    /// 由基底檔案與覆寫檔案合成 `override_path` 的模組。
    pub(crate) fn load_versioned(
        &self,
        base_path: &Path,
        override_path: &Path,
    ) -> Result<Exports, VerlayError> {
        if let Some(hit) = self.cached(override_path) {
            return Ok(hit);
        }
        let _guard = self.enter(override_path)?;
        trace!(
            target: "verlay::loader",
            module = %override_path.display(),
            base = %base_path.display(),
            "synthesizing module"
        );
        let exports = build_versioned_file(
            self.fs.as_ref(),
            &self.sandbox,
            base_path,
            override_path,
            &self.imports(),
        )?;
        Ok(self.remember(override_path, exports))
    }

    /// Caches `exports` under `path` when recording. Returns the entry other
    /// importers will see.
    pub(crate) fn remember(&self, path: &Path, exports: Exports) -> Exports {
        if !self.record {
            return exports;
        }
        self.cache.write().insert(path.to_path_buf(), exports)
    }

    fn cached(&self, path: &Path) -> Option<Exports> {
        self.cache.read().lookup(path, &self.extensions).cloned()
    }

    fn imports(&self) -> ImportContext {
        match self.this.upgrade() {
            Some(this) => {
                let loader: Arc<dyn ModuleLoader> = this;
                ImportContext::new(loader)
            }
            None => {
                let mut direct = DirectLoader::new(self.sandbox.clone());
                if let Some(ext) = self.extensions.first() {
                    direct = direct.with_extension(ext.as_str());
                }
                ImportContext::new(Arc::new(direct))
            }
        }
    }

    /// Picks the file an extensionless request refers to.
    fn resolve_script(&self, request: &Path) -> PathBuf {
        if has_script_extension(request, &self.extensions) {
            return request.to_path_buf();
        }
        for ext in &self.extensions {
            let candidate = with_appended_extension(request, ext);
            if self.cache.read().get(&candidate).is_some() || self.exists(&candidate) {
                return candidate;
            }
        }
        match self.extensions.first() {
            Some(ext) => with_appended_extension(request, ext),
            None => request.to_path_buf(),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        if self.fs.is_file(path) {
            return true;
        }
        self.layout.is_versioned(path)
            && self
                .layout
                .base_path(path)
                .map(|base| self.fs.is_file(&base))
                .unwrap_or(false)
    }

    fn enter(&self, path: &Path) -> Result<LoadGuard<'_>, VerlayError> {
        let mut loading = self.loading.lock();
        if !loading.insert(path.to_path_buf()) {
            debug!(target: "verlay::loader", module = %path.display(), "circular import");
            return Err(VerlayError::CircularImport(path.to_path_buf()));
        }
        Ok(LoadGuard {
            loading: &self.loading,
            path: path.to_path_buf(),
        })
    }
}

impl ModuleLoader for VersionedLoader {
    fn load(&self, request: &Path) -> Result<Exports, SandboxError> {
        self.load_path(request).map_err(SandboxError::from)
    }
}

struct LoadGuard<'a> {
    loading: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.loading.lock().remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::DiskFs;
    use std::fs;
    use tempfile::tempdir;

    fn loader(root: &Path, record: bool) -> Arc<VersionedLoader> {
        let layout = Layout::new(root, root.join("versions"));
        let fs: Arc<dyn SourceFs> = Arc::new(DiskFs);
        let extensions = vec!["rhai".to_string()];
        if record {
            VersionedLoader::recording(layout, fs, Sandbox::default(), extensions)
        } else {
            VersionedLoader::published(layout, fs, Sandbox::default(), extensions, PathCache::new())
        }
    }

    #[test]
    fn shared_imports_evaluate_once() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("shared.rhai"), "export const n = 1;").unwrap();
        fs::write(
            dir.path().join("a.rhai"),
            "import \"./shared\" as s; export const n = s::n;",
        )
        .unwrap();

        let loader = loader(dir.path(), true);
        loader.load_path(&dir.path().join("a")).unwrap();
        let first = loader.load_path(&dir.path().join("shared")).unwrap();
        let again = loader.load_direct(&dir.path().join("shared.rhai")).unwrap();
        assert!(first.ptr_eq(&again));
        assert_eq!(loader.take_cache().len(), 2);
    }

    #[test]
    fn published_loader_does_not_store() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.rhai"), "export const n = 1;").unwrap();

        let loader = loader(dir.path(), false);
        let first = loader.load_path(&dir.path().join("a")).unwrap();
        let second = loader.load_path(&dir.path().join("a")).unwrap();
        assert!(!first.ptr_eq(&second));
        assert!(loader.take_cache().is_empty());
    }

    #[test]
    fn versioned_request_without_override_runs_base_in_version_dir() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("versions/v1")).unwrap();
        fs::write(dir.path().join("word.rhai"), "export let word = \"hello\";").unwrap();
        fs::write(
            dir.path().join("versions/v1/word.rhai"),
            "word = \"howdy\";",
        )
        .unwrap();
        fs::write(
            dir.path().join("speak.rhai"),
            "import \"./word\" as w; export const spoken = w::word;",
        )
        .unwrap();

        let loader = loader(dir.path(), true);
        let spoken = loader
            .load_path(&dir.path().join("versions/v1/speak"))
            .unwrap();
        assert_eq!(spoken.var::<String>("spoken").as_deref(), Some("howdy"));
        assert_eq!(
            spoken.origin(),
            dir.path().join("versions/v1/speak.rhai").as_path()
        );
    }

    #[test]
    fn circular_imports_are_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.rhai"), "import \"./b\" as b;").unwrap();
        fs::write(dir.path().join("b.rhai"), "import \"./a\" as a;").unwrap();

        let loader = loader(dir.path(), true);
        let err = loader.load_path(&dir.path().join("a")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("circular import"), "{message}");
    }

    #[test]
    fn missing_module_is_not_found() {
        let dir = tempdir().unwrap();
        let loader = loader(dir.path(), true);
        assert!(matches!(
            loader.load_path(&dir.path().join("nope")),
            Err(VerlayError::ModuleNotFound(_))
        ));
    }
}
