//! Version trees over a directory of Rhai modules.
//! 以 Rhai 模組目錄建立的版本樹。
//!
//! A [`Multiverse`] walks a source root into a tree of module exports, then
//! builds one merged tree per version directory found under the target root.
//! Versioned files are combined with their base counterpart, so an override
//! only needs to define what changed. Lookups accept semantic-version ranges.
//! [`Multiverse`] 會將來源根目錄走訪為模組匯出樹，並為目標根目錄下的每個版本目錄建立合併後的樹；
//! 版本檔案會與基底檔案合併，因此覆寫檔只需定義變更的部分。查詢支援語意化版本範圍。

mod cache;
mod config;
mod error;
mod fs;
mod layout;
mod loader;
mod multiverse;
mod pipeline;
mod walker;

pub use cache::PathCache;
pub use config::{VerlayConfig, CONFIG_FILE_NAME};
pub use error::{ConfigError, VerlayError};
pub use fs::{DiskFs, SourceFs};
pub use layout::Layout;
pub use multiverse::{Multiverse, VersionSnapshot};
pub use pipeline::build_versioned_file;
pub use walker::WalkOptions;

pub use verlay_resolver::{VersionRange, VersionSet};
pub use verlay_sandbox::{CallOutcome, Dynamic, Exports, SandboxError, SandboxLimits};
pub use verlay_tree::{Branch, ExportNode, Leaf};
