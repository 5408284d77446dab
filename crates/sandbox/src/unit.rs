use std::path::{Path, PathBuf};

use rhai::AST;

/// A compiled script ready to be executed by the sandbox.
/// 已編譯、可交由沙箱執行的腳本單元。
#[derive(Debug, Clone)]
pub struct SourceUnit {
    ast: AST,
    origin: PathBuf,
}

impl SourceUnit {
    pub(crate) fn new(ast: AST, origin: PathBuf) -> Self {
        Self { ast, origin }
    }

    /// Path of the file the unit was compiled from. For a combined unit this
    /// is the overriding file.
    /// 單元的來源檔案路徑；合併後的單元則為覆寫檔案。
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }

    /// Splices `overlay` after `base` into a single unit.
    /// 將 `overlay` 接在 `base` 之後，組成單一執行單元。
    ///
    /// Both parts share one top-level scope and the overlay's statements run
    /// after the base's. Each part was parsed on its own, so statements never
    /// fuse across the seam. A function defined in the overlay replaces the
    /// base function with the same name and arity; other base functions stay
    /// visible and resolve calls to the overlay's definitions.
    pub fn combine(base: &SourceUnit, overlay: &SourceUnit) -> SourceUnit {
        SourceUnit {
            ast: base.ast.merge(&overlay.ast),
            origin: overlay.origin.clone(),
        }
    }
}
