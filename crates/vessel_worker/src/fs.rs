//! In-memory POSIX-like filesystem, rooted at `/`.
//!
//! Every path is normalized on entry, so the node map only ever holds
//! canonical absolute keys. Directories must exist before children are
//! created; the root always exists and cannot be removed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use vessel_protocol::paths;

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Shared handle used by executors and the dispatcher.
pub type SharedFs = Arc<Mutex<FileSystem>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Parent directory does not exist: {0}")]
    ParentMissing(String),

    #[error("File exists: {0}")]
    AlreadyExists(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(String),
    Dir,
}

/// The worker-owned virtual filesystem.
#[derive(Debug)]
pub struct FileSystem {
    nodes: BTreeMap<String, Node>,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self { nodes }
    }

    pub fn shared() -> SharedFs {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&paths::normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(&paths::normalize(path)), Some(Node::Dir))
    }

    pub fn write_file(&mut self, path: &str, content: &str) -> FsResult<()> {
        let path = paths::normalize(path);
        if path == "/" {
            return Err(FsError::IsADirectory(path));
        }
        self.check_parent(&path)?;
        if let Some(Node::Dir) = self.nodes.get(&path) {
            return Err(FsError::IsADirectory(path));
        }
        self.nodes.insert(path, Node::File(content.to_string()));
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> FsResult<String> {
        let path = paths::normalize(path);
        match self.nodes.get(&path) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(Node::Dir) => Err(FsError::IsADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    /// Delete a file, or a directory when `recursive` allows it.
    ///
    /// A non-empty directory is refused unless `recursive` is set.
    pub fn delete_file(&mut self, path: &str, recursive: bool) -> FsResult<()> {
        let path = paths::normalize(path);
        if path == "/" {
            if recursive {
                self.nodes.retain(|key, _| key == "/");
                return Ok(());
            }
            return Err(FsError::DirectoryNotEmpty(path));
        }
        match self.nodes.get(&path) {
            Some(Node::File(_)) => {
                self.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => {
                if !recursive && self.has_children(&path) {
                    return Err(FsError::DirectoryNotEmpty(path));
                }
                self.remove_subtree(&path);
                Ok(())
            }
            None => Err(FsError::NotFound(path)),
        }
    }

    pub fn create_directory(&mut self, path: &str) -> FsResult<()> {
        let path = paths::normalize(path);
        if self.nodes.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        self.check_parent(&path)?;
        self.nodes.insert(path, Node::Dir);
        Ok(())
    }

    /// Create a directory and any missing ancestors.
    pub fn create_dir_all(&mut self, path: &str) -> FsResult<()> {
        let path = paths::normalize(path);
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            match self.nodes.get(&current) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => return Err(FsError::NotADirectory(current)),
                None => {
                    self.nodes.insert(current.clone(), Node::Dir);
                }
            }
        }
        Ok(())
    }

    /// Immediate children of a directory, name-sorted.
    pub fn list_directory(&self, path: &str) -> FsResult<Vec<String>> {
        let path = paths::normalize(path);
        match self.nodes.get(&path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(FsError::NotADirectory(path)),
            None => return Err(FsError::NotFound(path)),
        }
        let prefix = child_prefix(&path);
        let entries = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        Ok(entries)
    }

    /// Remove a directory and its whole subtree.
    pub fn delete_directory(&mut self, path: &str) -> FsResult<()> {
        let path = paths::normalize(path);
        if path == "/" {
            self.nodes.retain(|key, _| key == "/");
            return Ok(());
        }
        match self.nodes.get(&path) {
            Some(Node::Dir) => {
                self.remove_subtree(&path);
                Ok(())
            }
            Some(Node::File(_)) => Err(FsError::NotADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    /// Flat listing of every file under `path` (the whole tree when `None`).
    pub fn list_files(&self, path: Option<&str>) -> FsResult<Vec<String>> {
        let root = paths::normalize(path.unwrap_or("/"));
        if !self.nodes.contains_key(&root) {
            return Err(FsError::NotFound(root));
        }
        let prefix = child_prefix(&root);
        let files = self
            .nodes
            .iter()
            .filter(|(key, node)| {
                matches!(node, Node::File(_))
                    && (key.as_str() == root || key.starts_with(&prefix))
            })
            .map(|(key, _)| key.clone())
            .collect();
        Ok(files)
    }

    /// Total bytes of file content; feeds the soft memory hint.
    pub fn total_bytes(&self) -> u64 {
        self.nodes
            .values()
            .map(|node| match node {
                Node::File(content) => content.len() as u64,
                Node::Dir => 0,
            })
            .sum()
    }

    fn check_parent(&self, path: &str) -> FsResult<()> {
        let Some(parent) = paths::parent(path) else {
            return Ok(());
        };
        match self.nodes.get(&parent) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(FsError::NotADirectory(parent)),
            None => Err(FsError::ParentMissing(parent)),
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }

    fn remove_subtree(&mut self, path: &str) {
        let prefix = child_prefix(path);
        self.nodes
            .retain(|key, _| key != path && !key.starts_with(&prefix));
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_requires_existing_parent() {
        let mut fs = FileSystem::new();
        assert_eq!(
            fs.write_file("/missing/file.txt", "x"),
            Err(FsError::ParentMissing("/missing".to_string()))
        );
        fs.create_directory("/missing").unwrap();
        fs.write_file("/missing/file.txt", "x").unwrap();
        assert_eq!(fs.read_file("/missing/file.txt").unwrap(), "x");
    }

    #[test]
    fn read_distinguishes_dirs_and_missing_paths() {
        let mut fs = FileSystem::new();
        fs.create_directory("/d").unwrap();
        assert_eq!(fs.read_file("/d"), Err(FsError::IsADirectory("/d".into())));
        assert_eq!(fs.read_file("/x"), Err(FsError::NotFound("/x".into())));
    }

    #[test]
    fn delete_refuses_non_empty_dir_without_recursive() {
        let mut fs = FileSystem::new();
        fs.create_directory("/d").unwrap();
        fs.write_file("/d/a", "1").unwrap();
        assert_eq!(
            fs.delete_file("/d", false),
            Err(FsError::DirectoryNotEmpty("/d".into()))
        );
        fs.delete_file("/d", true).unwrap();
        assert!(!fs.exists("/d"));
        assert!(!fs.exists("/d/a"));
    }

    #[test]
    fn list_directory_returns_immediate_children_only() {
        let mut fs = FileSystem::new();
        fs.create_directory("/d").unwrap();
        fs.create_directory("/d/sub").unwrap();
        fs.write_file("/d/a", "1").unwrap();
        fs.write_file("/d/sub/deep", "2").unwrap();
        assert_eq!(fs.list_directory("/d").unwrap(), vec!["a", "sub"]);
        assert_eq!(fs.list_directory("/").unwrap(), vec!["d"]);
    }

    #[test]
    fn list_files_without_path_walks_the_whole_tree() {
        let mut fs = FileSystem::new();
        fs.create_directory("/d").unwrap();
        fs.write_file("/top", "1").unwrap();
        fs.write_file("/d/a", "2").unwrap();
        assert_eq!(fs.list_files(None).unwrap(), vec!["/d/a", "/top"]);
        assert_eq!(fs.list_files(Some("/d")).unwrap(), vec!["/d/a"]);
    }

    #[test]
    fn delete_directory_removes_subtree() {
        let mut fs = FileSystem::new();
        fs.create_dir_all("/a/b/c").unwrap();
        fs.write_file("/a/b/c/f", "x").unwrap();
        fs.delete_directory("/a").unwrap();
        assert!(!fs.exists("/a"));
        assert!(fs.exists("/"));
        assert_eq!(fs.total_bytes(), 0);
    }

    #[test]
    fn paths_normalize_on_every_entry() {
        let mut fs = FileSystem::new();
        fs.create_directory("/d").unwrap();
        fs.write_file("/d/../d//file", "x").unwrap();
        assert_eq!(fs.read_file("/d/file").unwrap(), "x");
    }

    #[test]
    fn total_bytes_tracks_content() {
        let mut fs = FileSystem::new();
        fs.write_file("/a", "12345").unwrap();
        fs.write_file("/b", "123").unwrap();
        assert_eq!(fs.total_bytes(), 8);
        fs.delete_file("/a", false).unwrap();
        assert_eq!(fs.total_bytes(), 3);
    }
}
