//! Right-biased deep merge and topology-only deep clone.
//! 右偏的深度合併與僅複製結構的深度複製。
//!
//! Branches merge key by key; everything else (leaves, JSON arrays and
//! scalars) is atomic and replaced wholesale by the overlay.
//! 分支逐鍵合併；其餘值（葉節點、JSON 陣列與純量）皆視為不可分割，由覆寫方整體取代。

use serde_json::Value;

use crate::node::{Branch, ExportNode, Leaf};

/// Merges `overlay` into `base`. Overlay wins on every conflict that is not
/// branch-onto-branch, and the merge is not commutative.
/// 將 `overlay` 合併進 `base`；除分支對分支外，衝突時一律以覆寫方為準。
pub fn deep_merge<T>(base: &mut Branch<T>, overlay: Branch<T>) {
    if let Some(path) = overlay.provenance() {
        base.set_provenance(Some(path.to_path_buf()));
    }
    for (name, incoming) in overlay.into_children() {
        match incoming {
            ExportNode::Branch(incoming) => {
                if let Some(ExportNode::Branch(existing)) = base.children_mut().get_mut(&name) {
                    deep_merge(existing, incoming);
                    continue;
                }
                base.children_mut().insert(name, ExportNode::Branch(incoming));
            }
            leaf => {
                base.children_mut().insert(name, leaf);
            }
        }
    }
}

/// Copies the container topology; leaf values are cloned by handle.
/// 複製容器結構；葉節點值以控制代碼方式複製。
///
/// With an `Arc`-backed `T` the clone shares every leaf with the source,
/// so mutating the copy's shape never disturbs the original tree.
pub fn deep_clone<T: Clone>(branch: &Branch<T>) -> Branch<T> {
    let mut copy = Branch::new();
    copy.set_provenance(branch.provenance().map(|path| path.to_path_buf()));
    for (name, node) in branch.iter() {
        let node = match node {
            ExportNode::Branch(child) => ExportNode::Branch(deep_clone(child)),
            ExportNode::Leaf(leaf) => {
                let mut cloned = Leaf::new(leaf.value.clone());
                cloned.set_provenance(leaf.provenance().map(|path| path.to_path_buf()));
                ExportNode::Leaf(cloned)
            }
        };
        copy.insert(name, node);
    }
    copy
}

/// Same merge rule applied to JSON documents; used for layered configuration.
/// 對 JSON 文件套用相同的合併規則，用於分層設定。
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                let nested =
                    value.is_object() && matches!(target.get(&key), Some(Value::Object(_)));
                if nested {
                    if let Some(existing) = target.get_mut(&key) {
                        merge_json(existing, value);
                    }
                } else {
                    target.insert(key, value);
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
