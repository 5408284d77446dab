use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rhai::{Dynamic, Module};

/// The export surface of an evaluated module: exported variables and
/// non-private functions.
/// 模組執行後的匯出介面：匯出的變數與非私有函式。
///
/// Clones share the evaluated module; use [`Exports::ptr_eq`] to check
/// whether two handles refer to the same evaluation.
#[derive(Clone)]
pub struct Exports {
    module: Arc<Module>,
    origin: Arc<Path>,
    output: Arc<[String]>,
}

impl Exports {
    pub(crate) fn new(module: Module, origin: &Path, output: Vec<String>) -> Self {
        Self {
            module: Arc::new(module),
            origin: Arc::from(origin),
            output: output.into(),
        }
    }

    pub(crate) fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Logical path the module was evaluated at.
    /// 模組執行時所使用的邏輯路徑。
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Console lines printed while the module body was evaluated.
    /// 模組主體執行期間輸出的主控台訊息。
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn var<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Option<T> {
        self.module.get_var_value::<T>(name)
    }

    pub fn var_dynamic(&self, name: &str) -> Option<Dynamic> {
        self.module.get_var(name)
    }

    pub fn contains_var(&self, name: &str) -> bool {
        self.module.contains_var(name)
    }

    pub fn var_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .module
            .iter_var()
            .map(|(name, _)| name.to_string())
            .collect();
        names.sort();
        names
    }

    /// Returns true when both handles share one evaluated module.
    pub fn ptr_eq(&self, other: &Exports) -> bool {
        Arc::ptr_eq(&self.module, &other.module)
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exports")
            .field("origin", &self.origin)
            .field("vars", &self.var_names())
            .finish()
    }
}
