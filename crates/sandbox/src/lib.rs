//! Script execution sandbox for verlay.
//! verlay 的腳本執行沙箱。
//!
//! Modules are Rhai scripts. A module's exports are the variables it
//! `export`s plus its non-private functions. Every evaluation happens in a
//! fresh engine whose `import` statements are routed through an
//! [`ImportContext`], so a script can be executed as if it lived at a path
//! other than the one it was read from.
//! 模組為 Rhai 腳本；匯出內容為 `export` 的變數與非私有函式。每次執行都在新的引擎中進行，
//! `import` 敘述透過 [`ImportContext`] 解析，因此腳本可以假裝位於其他路徑執行。

mod error;
mod exports;
mod runtime;
mod unit;

pub use error::SandboxError;
pub use exports::Exports;
pub use rhai::Dynamic;
pub use runtime::{
    normalize_path, resolve_request, CallOutcome, DirectLoader, ImportContext, ModuleLoader,
    Sandbox, SandboxLimits, DEFAULT_EXTENSION,
};
pub use unit::SourceUnit;
