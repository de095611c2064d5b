//! UI-facing directory tree node.

use serde::{Deserialize, Serialize};

use super::FileEntry;

/// A [`FileEntry`] wrapped with lazy-loaded children for tree browsing.
///
/// Invariant: `children` is `None` until a listing succeeds, then
/// `Some(entries)` — `Some(vec![])` means loaded-and-empty. Toggling
/// expansion on a node whose children are `None` must trigger exactly one
/// background listing, which lands via [`DirectoryTreeNode::set_children`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryTreeNode {
    pub entry: FileEntry,
    pub is_expanded: bool,
    pub children: Option<Vec<FileEntry>>,
}

impl DirectoryTreeNode {
    pub fn new(entry: FileEntry) -> Self {
        Self {
            entry,
            is_expanded: false,
            children: None,
        }
    }

    /// Flip expansion; returns `true` when the caller must now load the
    /// children (expanding a directory whose children were never fetched).
    pub fn toggle_expanded(&mut self) -> bool {
        self.is_expanded = !self.is_expanded;
        self.is_expanded && self.entry.is_dir && self.children.is_none()
    }

    /// Record a completed listing.
    pub fn set_children(&mut self, children: Vec<FileEntry>) {
        self.children = Some(children);
    }

    pub fn is_loaded(&self) -> bool {
        self.children.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_node() -> DirectoryTreeNode {
        DirectoryTreeNode::new(FileEntry::new("srv", "/", true))
    }

    #[test]
    fn test_first_expand_requests_load_once() {
        let mut node = dir_node();
        assert!(node.toggle_expanded(), "first expand must request a load");
        node.set_children(vec![FileEntry::new("a", "/srv", false)]);
        assert!(!node.toggle_expanded()); // collapse
        assert!(!node.toggle_expanded(), "children already loaded");
    }

    #[test]
    fn test_empty_directory_is_loaded_state() {
        let mut node = dir_node();
        node.toggle_expanded();
        node.set_children(Vec::new());
        assert!(node.is_loaded());
        assert_eq!(node.children.as_deref(), Some(&[][..]));
    }

    #[test]
    fn test_file_node_never_requests_load() {
        let mut node = DirectoryTreeNode::new(FileEntry::new("a.txt", "/", false));
        assert!(!node.toggle_expanded());
    }
}
