use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;

pub const ROOT_PATH: &str = "/";

/// Identity of a pending transfer: one account, one remote path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TransferKey {
    pub account: String,
    pub remote_path: String,
}

impl TransferKey {
    pub fn new(account: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            remote_path: remote_path.into(),
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.account, self.remote_path)
    }
}

#[derive(Debug)]
struct Node<V> {
    payload: Option<V>,
    parent: Option<String>,
    children: BTreeSet<String>,
}

impl<V> Node<V> {
    fn empty() -> Self {
        Self {
            payload: None,
            parent: None,
            children: BTreeSet::new(),
        }
    }
}

/// What a removal took out of the forest.
#[derive(Debug)]
pub struct Removed<V> {
    pub payload: Option<V>,
    pub descendants: Vec<V>,
    /// Closest ancestor folder that is still pending after the removal.
    pub unlinked_from: Option<String>,
}

impl<V> Removed<V> {
    fn nothing() -> Self {
        Self {
            payload: None,
            descendants: Vec::new(),
            unlinked_from: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_none() && self.descendants.is_empty()
    }

    pub fn into_operations(self) -> Vec<V> {
        self.payload.into_iter().chain(self.descendants).collect()
    }
}

/// Index of pending transfers shaped after the remote folder tree.
///
/// Every pending file hangs under a chain of folder nodes (paths ending in
/// `/`) up to the account root, so folder-level lookups and removals reach
/// all descendants. Folder nodes without payload disappear as soon as their
/// last child does. Callers provide the locking.
#[derive(Debug)]
pub struct PendingForest<V> {
    nodes: HashMap<TransferKey, Node<V>>,
}

impl<V> Default for PendingForest<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> PendingForest<V> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Inserts `value` unless an operation is already pending for the key.
    ///
    /// Returns the key and the remote path of the ancestor the new entry was
    /// linked under (`/` when no ancestor was pending before).
    pub fn put_if_absent(
        &mut self,
        account: &str,
        remote_path: &str,
        value: V,
    ) -> Option<(TransferKey, String)> {
        let key = TransferKey::new(account, remote_path);
        if let Some(node) = self.nodes.get_mut(&key) {
            if node.payload.is_some() {
                return None;
            }
            node.payload = Some(value);
            let linked_to = node.parent.clone().unwrap_or_else(|| ROOT_PATH.to_string());
            return Some((key, linked_to));
        }

        let mut node = Node::empty();
        node.payload = Some(value);
        self.nodes.insert(key.clone(), node);

        let mut current = remote_path.to_string();
        let mut linked_to = None;
        while let Some(parent) = parent_path(&current) {
            if let Some(node) = self.nodes.get_mut(&TransferKey::new(account, current.as_str())) {
                node.parent = Some(parent.clone());
            }
            let parent_key = TransferKey::new(account, parent.as_str());
            match self.nodes.get_mut(&parent_key) {
                Some(parent_node) => {
                    parent_node.children.insert(current);
                    linked_to = Some(parent);
                    break;
                }
                None => {
                    let mut folder = Node::empty();
                    folder.children.insert(current);
                    self.nodes.insert(parent_key, folder);
                }
            }
            current = parent;
        }

        Some((key, linked_to.unwrap_or_else(|| ROOT_PATH.to_string())))
    }

    pub fn get(&self, key: &TransferKey) -> Option<&V> {
        self.nodes.get(key)?.payload.as_ref()
    }

    /// True when the file, or anything below the folder, is pending.
    pub fn contains(&self, account: &str, remote_path: &str) -> bool {
        if self
            .nodes
            .contains_key(&TransferKey::new(account, remote_path))
        {
            return true;
        }
        !remote_path.ends_with('/')
            && self
                .nodes
                .contains_key(&TransferKey::new(account, format!("{remote_path}/")))
    }

    /// Removes the entry and, for a folder, every entry below it.
    pub fn remove(&mut self, account: &str, remote_path: &str) -> Removed<V> {
        let mut key = TransferKey::new(account, remote_path);
        if !self.nodes.contains_key(&key) && !remote_path.ends_with('/') {
            key.remote_path.push('/');
        }
        let Some(node) = self.nodes.remove(&key) else {
            return Removed::nothing();
        };

        let mut descendants = Vec::new();
        let mut stack: Vec<String> = node.children.into_iter().collect();
        while let Some(path) = stack.pop() {
            if let Some(child) = self.nodes.remove(&TransferKey::new(account, path)) {
                stack.extend(child.children);
                descendants.extend(child.payload);
            }
        }

        let unlinked_from = self.detach(account, key.remote_path, node.parent);
        Removed {
            payload: node.payload,
            descendants,
            unlinked_from,
        }
    }

    /// Drops the payload of a finished entry. The node itself stays while
    /// other entries are still pending below it.
    pub fn remove_payload(&mut self, account: &str, remote_path: &str) -> Removed<V> {
        let key = TransferKey::new(account, remote_path);
        let Some(node) = self.nodes.get_mut(&key) else {
            return Removed::nothing();
        };
        let payload = node.payload.take();
        if !node.children.is_empty() {
            return Removed {
                payload,
                descendants: Vec::new(),
                unlinked_from: None,
            };
        }
        let mut removed = self.remove(account, remote_path);
        removed.payload = payload;
        removed
    }

    /// Bulk removal of everything pending for one account.
    pub fn remove_account(&mut self, account: &str) -> Vec<V> {
        let keys: Vec<TransferKey> = self
            .nodes
            .keys()
            .filter(|key| key.account == account)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.nodes.remove(&key))
            .filter_map(|node| node.payload)
            .collect()
    }

    /// Number of pending operations (folder nodes without payload excluded).
    pub fn len(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| node.payload.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn detach(
        &mut self,
        account: &str,
        mut child: String,
        mut parent: Option<String>,
    ) -> Option<String> {
        while let Some(parent_path) = parent {
            let parent_key = TransferKey::new(account, parent_path.as_str());
            let node = self.nodes.get_mut(&parent_key)?;
            node.children.remove(&child);
            if !node.children.is_empty() || node.payload.is_some() {
                return Some(parent_path);
            }
            parent = self.nodes.remove(&parent_key).and_then(|node| node.parent);
            child = parent_path;
        }
        None
    }
}

/// `/a/b.txt` -> `/a/`, `/a/` -> `/`, `/` -> none.
pub fn parent_path(remote_path: &str) -> Option<String> {
    let trimmed = remote_path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let idx = trimmed.rfind('/')?;
    Some(trimmed[..=idx].to_string())
}

/// Component-aware prefix test: `/a/b` covers `/a/b` and `/a/b/x`, never `/a/bc`.
pub fn is_same_or_below(candidate: &str, prefix: &str) -> bool {
    if candidate == prefix {
        return true;
    }
    let trimmed = prefix.trim_end_matches('/');
    candidate
        .strip_prefix(trimmed)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_if_absent_rejects_duplicates() {
        let mut forest = PendingForest::new();
        let (key, linked_to) = forest.put_if_absent("alice", "/a/b.txt", 1).unwrap();
        assert_eq!(key, TransferKey::new("alice", "/a/b.txt"));
        assert_eq!(linked_to, "/");
        assert!(forest.put_if_absent("alice", "/a/b.txt", 2).is_none());
        assert_eq!(forest.get(&key), Some(&1));
        assert_eq!(forest.len(), 1);
    }

    #[test]
    fn new_entries_link_under_pending_ancestors() {
        let mut forest = PendingForest::new();
        forest.put_if_absent("alice", "/a/b.txt", 1).unwrap();
        let (_, linked_to) = forest.put_if_absent("alice", "/a/c.txt", 2).unwrap();
        assert_eq!(linked_to, "/a/");
        let (_, linked_to) = forest.put_if_absent("alice", "/a/d/e.txt", 3).unwrap();
        assert_eq!(linked_to, "/a/");
    }

    #[test]
    fn contains_sees_files_and_folders() {
        let mut forest = PendingForest::new();
        forest.put_if_absent("alice", "/a/b/c.txt", 1).unwrap();
        assert!(forest.contains("alice", "/a/b/c.txt"));
        assert!(forest.contains("alice", "/a/b"));
        assert!(forest.contains("alice", "/a/"));
        assert!(!forest.contains("alice", "/a/bc"));
        assert!(!forest.contains("bob", "/a/b/c.txt"));
    }

    #[test]
    fn removing_a_folder_takes_descendants() {
        let mut forest = PendingForest::new();
        forest.put_if_absent("alice", "/a/b/1.txt", 1).unwrap();
        forest.put_if_absent("alice", "/a/b/2.txt", 2).unwrap();
        forest.put_if_absent("alice", "/a/keep.txt", 3).unwrap();

        let removed = forest.remove("alice", "/a/b");
        let mut ops = removed.descendants.clone();
        ops.sort();
        assert_eq!(ops, vec![1, 2]);
        assert!(removed.payload.is_none());
        assert_eq!(removed.unlinked_from.as_deref(), Some("/a/"));
        assert!(!forest.contains("alice", "/a/b/1.txt"));
        assert!(forest.contains("alice", "/a/keep.txt"));
        assert_eq!(forest.len(), 1);
    }

    #[test]
    fn removing_last_entry_clears_ancestors() {
        let mut forest = PendingForest::new();
        forest.put_if_absent("alice", "/a/b/c.txt", 1).unwrap();
        let removed = forest.remove("alice", "/a/b/c.txt");
        assert_eq!(removed.payload, Some(1));
        assert_eq!(removed.unlinked_from, None);
        assert!(!forest.contains("alice", "/"));
        assert!(forest.is_empty());
    }

    #[test]
    fn remove_payload_keeps_nodes_with_pending_children() {
        let mut forest = PendingForest::new();
        forest.put_if_absent("alice", "/a/", 1).unwrap();
        forest.put_if_absent("alice", "/a/b.txt", 2).unwrap();

        let removed = forest.remove_payload("alice", "/a/");
        assert_eq!(removed.payload, Some(1));
        assert!(forest.contains("alice", "/a/b.txt"));
        assert!(forest.get(&TransferKey::new("alice", "/a/")).is_none());

        let removed = forest.remove_payload("alice", "/a/b.txt");
        assert_eq!(removed.payload, Some(2));
        assert!(forest.is_empty());
        assert!(!forest.contains("alice", "/a/"));
    }

    #[test]
    fn remove_account_does_not_touch_similar_names() {
        let mut forest = PendingForest::new();
        forest.put_if_absent("alice", "/x.txt", 1).unwrap();
        forest.put_if_absent("alice", "/d/y.txt", 2).unwrap();
        forest.put_if_absent("alice2", "/x.txt", 3).unwrap();

        let mut removed = forest.remove_account("alice");
        removed.sort();
        assert_eq!(removed, vec![1, 2]);
        assert!(!forest.contains("alice", "/"));
        assert!(forest.contains("alice2", "/x.txt"));
        assert_eq!(forest.len(), 1);
    }

    #[test]
    fn parent_paths_walk_to_root() {
        assert_eq!(parent_path("/a/b.txt").as_deref(), Some("/a/"));
        assert_eq!(parent_path("/a/").as_deref(), Some("/"));
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn prefix_matching_respects_components() {
        assert!(is_same_or_below("/a/b", "/a/b"));
        assert!(is_same_or_below("/a/b/c.txt", "/a/b"));
        assert!(is_same_or_below("/a/b/c.txt", "/a/b/"));
        assert!(!is_same_or_below("/a/bc.txt", "/a/b"));
        assert!(is_same_or_below("/a.txt", "/"));
    }
}
