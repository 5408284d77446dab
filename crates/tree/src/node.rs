use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// A node of an export tree: either a loaded module or a directory of nodes.
/// 匯出樹中的節點：已載入的模組或包含子節點的目錄。
#[derive(Debug, Clone, PartialEq)]
pub enum ExportNode<T> {
    Leaf(Leaf<T>),
    Branch(Branch<T>),
}

impl<T> ExportNode<T> {
    pub fn is_branch(&self) -> bool {
        matches!(self, ExportNode::Branch(_))
    }

    pub fn as_leaf(&self) -> Option<&Leaf<T>> {
        match self {
            ExportNode::Leaf(leaf) => Some(leaf),
            ExportNode::Branch(_) => None,
        }
    }

    pub fn as_branch(&self) -> Option<&Branch<T>> {
        match self {
            ExportNode::Branch(branch) => Some(branch),
            ExportNode::Leaf(_) => None,
        }
    }

    /// Returns the path this node was loaded from, while the tree is under construction.
    /// 建構期間回傳節點的來源路徑。
    pub fn provenance(&self) -> Option<&Path> {
        match self {
            ExportNode::Leaf(leaf) => leaf.provenance(),
            ExportNode::Branch(branch) => branch.provenance(),
        }
    }
}

impl<T> From<Leaf<T>> for ExportNode<T> {
    fn from(leaf: Leaf<T>) -> Self {
        ExportNode::Leaf(leaf)
    }
}

impl<T> From<Branch<T>> for ExportNode<T> {
    fn from(branch: Branch<T>) -> Self {
        ExportNode::Branch(branch)
    }
}

/// Terminal export value. The value is opaque to the merge engine.
/// 終端匯出值，合併引擎不會檢視其內容。
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf<T> {
    pub value: T,
    provenance: Option<PathBuf>,
}

impl<T> Leaf<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            provenance: None,
        }
    }

    pub fn with_provenance(value: T, path: impl Into<PathBuf>) -> Self {
        Self {
            value,
            provenance: Some(path.into()),
        }
    }

    pub fn provenance(&self) -> Option<&Path> {
        self.provenance.as_deref()
    }

    pub fn set_provenance(&mut self, path: Option<PathBuf>) {
        self.provenance = path;
    }
}

/// Named collection of nodes mirroring a directory.
/// 對應目錄結構的具名節點集合。
#[derive(Debug, Clone, PartialEq)]
pub struct Branch<T> {
    children: BTreeMap<String, ExportNode<T>>,
    provenance: Option<PathBuf>,
}

impl<T> Default for Branch<T> {
    fn default() -> Self {
        Self {
            children: BTreeMap::new(),
            provenance: None,
        }
    }
}

impl<T> Branch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provenance(path: impl Into<PathBuf>) -> Self {
        Self {
            children: BTreeMap::new(),
            provenance: Some(path.into()),
        }
    }

    pub fn provenance(&self) -> Option<&Path> {
        self.provenance.as_deref()
    }

    pub fn set_provenance(&mut self, path: Option<PathBuf>) {
        self.provenance = path;
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Inserts a child, returning the node previously stored under the same name.
    /// 插入子節點，並回傳先前同名的節點（若有）。
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        node: impl Into<ExportNode<T>>,
    ) -> Option<ExportNode<T>> {
        self.children.insert(name.into(), node.into())
    }

    pub fn child(&self, name: &str) -> Option<&ExportNode<T>> {
        self.children.get(name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut ExportNode<T>> {
        self.children.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExportNode<T>)> {
        self.children.iter().map(|(name, node)| (name.as_str(), node))
    }

    pub(crate) fn children_mut(&mut self) -> &mut BTreeMap<String, ExportNode<T>> {
        &mut self.children
    }

    pub(crate) fn into_children(self) -> BTreeMap<String, ExportNode<T>> {
        self.children
    }

    /// Follows `segments` from this branch, e.g. `["lib", "index"]`.
    /// 依序走訪路徑片段，例如 `["lib", "index"]`。
    pub fn get<S: AsRef<str>>(&self, segments: &[S]) -> Option<&ExportNode<T>> {
        let (first, rest) = segments.split_first()?;
        let node = self.children.get(first.as_ref())?;
        if rest.is_empty() {
            return Some(node);
        }
        match node {
            ExportNode::Branch(branch) => branch.get(rest),
            ExportNode::Leaf(_) => None,
        }
    }

    /// Convenience lookup returning the leaf value at `segments`.
    /// 便利查詢：回傳指定路徑上的葉節點值。
    pub fn leaf_value<S: AsRef<str>>(&self, segments: &[S]) -> Option<&T> {
        self.get(segments)
            .and_then(ExportNode::as_leaf)
            .map(|leaf| &leaf.value)
    }

    /// Visits every leaf depth-first with the key path leading to it.
    /// 深度優先走訪每個葉節點，並提供其鍵路徑。
    pub fn for_each_leaf_mut<F>(&mut self, mut visit: F)
    where
        F: FnMut(&[String], &mut Leaf<T>),
    {
        let mut trail = Vec::new();
        visit_leaves_mut(self, &mut trail, &mut visit);
    }

    pub fn leaf_count(&self) -> usize {
        self.children
            .values()
            .map(|node| match node {
                ExportNode::Leaf(_) => 1,
                ExportNode::Branch(branch) => branch.leaf_count(),
            })
            .sum()
    }

    /// Clears the provenance annotation from this branch and every descendant.
    /// 清除此分支與所有子孫節點的來源註記。
    pub fn strip_provenance(&mut self) {
        self.provenance = None;
        for node in self.children.values_mut() {
            match node {
                ExportNode::Leaf(leaf) => leaf.provenance = None,
                ExportNode::Branch(branch) => branch.strip_provenance(),
            }
        }
    }

    /// Returns true if any node in the tree still carries a provenance path.
    pub fn any_provenance(&self) -> bool {
        self.provenance.is_some()
            || self.children.values().any(|node| match node {
                ExportNode::Leaf(leaf) => leaf.provenance.is_some(),
                ExportNode::Branch(branch) => branch.any_provenance(),
            })
    }

    /// Renders an indented listing of the tree for diagnostics.
    /// 產生縮排的樹狀列表，供診斷輸出使用。
    pub fn render(&self) -> String {
        let mut out = String::new();
        render_into(self, 0, &mut out);
        out
    }
}

fn visit_leaves_mut<T, F>(branch: &mut Branch<T>, trail: &mut Vec<String>, visit: &mut F)
where
    F: FnMut(&[String], &mut Leaf<T>),
{
    for (name, node) in branch.children.iter_mut() {
        trail.push(name.clone());
        match node {
            ExportNode::Leaf(leaf) => visit(trail, leaf),
            ExportNode::Branch(child) => visit_leaves_mut(child, trail, visit),
        }
        trail.pop();
    }
}

fn render_into<T>(branch: &Branch<T>, depth: usize, out: &mut String) {
    for (name, node) in &branch.children {
        let indent = "  ".repeat(depth);
        match node {
            ExportNode::Leaf(leaf) => {
                let _ = match leaf.provenance() {
                    Some(path) => writeln!(out, "{indent}{name} ({})", path.display()),
                    None => writeln!(out, "{indent}{name}"),
                };
            }
            ExportNode::Branch(child) => {
                let _ = writeln!(out, "{indent}{name}/");
                render_into(child, depth + 1, out);
            }
        }
    }
}
