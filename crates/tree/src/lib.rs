//! Export tree model and merge utilities for verlay.
//! verlay 的匯出樹資料模型與合併工具。

mod merge;
mod node;

pub use merge::{deep_clone, deep_merge, merge_json};
pub use node::{Branch, ExportNode, Leaf};
