// src/sandbox/vfs.rs
//! In-memory virtual filesystem
//!
//! An arena of path-keyed nodes rooted at `/`. Each bot owns exactly one
//! instance; it is never cloned or shared. The tree can be flattened into a
//! [`VfsSnapshot`] to hand it to the bot's worker process.

use crate::utils::errors::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

type NodeId = usize;

const ROOT: NodeId = 0;

/// Kind of a filesystem node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    children: BTreeMap<String, NodeId>,
    contents: Vec<u8>,
}

impl Node {
    fn directory() -> Self {
        Self {
            kind: NodeKind::Directory,
            children: BTreeMap::new(),
            contents: Vec::new(),
        }
    }

    fn file(contents: Vec<u8>) -> Self {
        Self {
            kind: NodeKind::File,
            children: BTreeMap::new(),
            contents,
        }
    }
}

/// Per-bot in-memory filesystem
#[derive(Debug)]
pub struct VirtualFilesystem {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
    max_file_bytes: usize,
}

impl VirtualFilesystem {
    pub fn new(max_file_bytes: usize) -> Self {
        let mut index = HashMap::new();
        index.insert("/".to_string(), ROOT);

        Self {
            nodes: vec![Node::directory()],
            index,
            max_file_bytes,
        }
    }

    /// Normalize a path to `/a/b` form; `..` is rejected
    pub fn normalize(path: &str) -> Result<String> {
        let mut parts = Vec::new();

        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    return Err(RunnerError::SandboxFilesystem(format!(
                        "Parent segments are not allowed: {}",
                        path
                    )))
                }
                part if part.contains('\0') => {
                    return Err(RunnerError::SandboxFilesystem(format!(
                        "Invalid path: {:?}",
                        path
                    )))
                }
                part => parts.push(part),
            }
        }

        Ok(format!("/{}", parts.join("/")))
    }

    fn split_parent(path: &str) -> (&str, &str) {
        match path.rfind('/') {
            Some(0) => ("/", &path[1..]),
            Some(i) => (&path[..i], &path[i + 1..]),
            None => ("/", path),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        Self::normalize(path)
            .map(|p| self.index.contains_key(&p))
            .unwrap_or(false)
    }

    pub fn kind(&self, path: &str) -> Option<NodeKind> {
        let path = Self::normalize(path).ok()?;
        self.index.get(&path).map(|id| self.nodes[*id].kind)
    }

    /// Create a directory and any missing parents
    pub fn create_dir_all(&mut self, path: &str) -> Result<()> {
        let path = Self::normalize(path)?;
        self.ensure_dir(&path).map(|_| ())
    }

    fn ensure_dir(&mut self, path: &str) -> Result<NodeId> {
        if let Some(id) = self.index.get(path) {
            return match self.nodes[*id].kind {
                NodeKind::Directory => Ok(*id),
                NodeKind::File => Err(RunnerError::SandboxFilesystem(format!(
                    "{} is a file",
                    path
                ))),
            };
        }

        let (parent, name) = Self::split_parent(path);
        let parent_id = self.ensure_dir(parent)?;
        Ok(self.attach(parent_id, path, name, Node::directory()))
    }

    fn attach(&mut self, parent: NodeId, path: &str, name: &str, node: Node) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.nodes[parent].children.insert(name.to_string(), id);
        self.index.insert(path.to_string(), id);
        id
    }

    /// Write a file, replacing any previous contents
    pub fn write_file(&mut self, path: &str, contents: impl Into<Vec<u8>>) -> Result<()> {
        let contents = contents.into();
        let path = Self::normalize(path)?;

        if path == "/" {
            return Err(RunnerError::SandboxFilesystem("Cannot write to /".into()));
        }

        if contents.len() > self.max_file_bytes {
            return Err(RunnerError::SandboxFilesystem(format!(
                "{} exceeds the {} byte file limit",
                path, self.max_file_bytes
            )));
        }

        if let Some(id) = self.index.get(&path) {
            let node = &mut self.nodes[*id];
            if node.kind == NodeKind::Directory {
                return Err(RunnerError::SandboxFilesystem(format!(
                    "{} is a directory",
                    path
                )));
            }
            node.contents = contents;
            return Ok(());
        }

        let (parent, name) = Self::split_parent(&path);
        let parent_id = self.ensure_dir(parent)?;
        self.attach(parent_id, &path, name, Node::file(contents));
        Ok(())
    }

    /// Write a file only when nothing exists at `path`; returns whether it was written
    pub fn write_if_absent(&mut self, path: &str, contents: impl Into<Vec<u8>>) -> Result<bool> {
        if self.exists(path) {
            return Ok(false);
        }
        self.write_file(path, contents)?;
        Ok(true)
    }

    pub fn read_file(&self, path: &str) -> Result<&[u8]> {
        let normalized = Self::normalize(path)?;
        let id = self
            .index
            .get(&normalized)
            .ok_or_else(|| RunnerError::SandboxFilesystem(format!("{}: no such file", normalized)))?;

        let node = &self.nodes[*id];
        match node.kind {
            NodeKind::File => Ok(&node.contents),
            NodeKind::Directory => Err(RunnerError::SandboxFilesystem(format!(
                "{} is a directory",
                normalized
            ))),
        }
    }

    /// Entry names directly under a directory, sorted
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let normalized = Self::normalize(path)?;
        let id = self.index.get(&normalized).ok_or_else(|| {
            RunnerError::SandboxFilesystem(format!("{}: no such directory", normalized))
        })?;

        let node = &self.nodes[*id];
        if node.kind != NodeKind::Directory {
            return Err(RunnerError::SandboxFilesystem(format!(
                "{} is not a directory",
                normalized
            )));
        }

        Ok(node.children.keys().cloned().collect())
    }

    /// All files with their contents, sorted by path
    pub fn files(&self) -> BTreeMap<String, &[u8]> {
        self.index
            .iter()
            .filter(|(_, id)| self.nodes[**id].kind == NodeKind::File)
            .map(|(path, id)| (path.clone(), self.nodes[*id].contents.as_slice()))
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.kind == NodeKind::File).count()
    }

    pub fn snapshot(&self) -> VfsSnapshot {
        VfsSnapshot {
            files: self
                .files()
                .into_iter()
                .map(|(path, contents)| (path, hex::encode(contents)))
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: &VfsSnapshot, max_file_bytes: usize) -> Result<Self> {
        let mut fs = Self::new(max_file_bytes);
        for (path, encoded) in &snapshot.files {
            let contents = hex::decode(encoded).map_err(|e| {
                RunnerError::SandboxFilesystem(format!("Corrupt snapshot entry {}: {}", path, e))
            })?;
            fs.write_file(path, contents)?;
        }
        Ok(fs)
    }
}

/// Flattened filesystem handed to a worker process (contents hex encoded)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VfsSnapshot {
    pub files: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(VirtualFilesystem::normalize("a//b/./c").unwrap(), "/a/b/c");
        assert_eq!(VirtualFilesystem::normalize("/").unwrap(), "/");
        assert!(VirtualFilesystem::normalize("/a/../etc/passwd").is_err());
    }

    #[test]
    fn test_write_creates_parents() {
        let mut fs = VirtualFilesystem::new(1024);
        fs.write_file("/commands/ping", "pong").unwrap();

        assert_eq!(fs.kind("/commands"), Some(NodeKind::Directory));
        assert_eq!(fs.read_file("/commands/ping").unwrap(), b"pong");
        assert_eq!(fs.list_dir("/").unwrap(), vec!["commands"]);
        assert_eq!(fs.list_dir("/commands").unwrap(), vec!["ping"]);
    }

    #[test]
    fn test_write_if_absent_keeps_first_write() {
        let mut fs = VirtualFilesystem::new(1024);
        assert!(fs.write_if_absent("/webhooks/a", "one").unwrap());
        assert!(!fs.write_if_absent("/webhooks/a", "two").unwrap());
        assert_eq!(fs.read_file("/webhooks/a").unwrap(), b"one");
    }

    #[test]
    fn test_file_directory_conflicts() {
        let mut fs = VirtualFilesystem::new(1024);
        fs.write_file("/a", "x").unwrap();
        assert!(fs.write_file("/a/b", "y").is_err());
        assert!(fs.create_dir_all("/a").is_err());

        fs.create_dir_all("/dir/sub").unwrap();
        assert!(fs.write_file("/dir", "z").is_err());
        assert!(fs.read_file("/dir").is_err());
    }

    #[test]
    fn test_size_limit() {
        let mut fs = VirtualFilesystem::new(4);
        assert!(fs.write_file("/small", "1234").is_ok());
        assert!(fs.write_file("/big", "12345").is_err());
    }

    #[test]
    fn test_snapshot_restores_tree() {
        let mut fs = VirtualFilesystem::new(1024);
        fs.write_file("/main", "print('hi')").unwrap();
        fs.write_file("/bin/blob", vec![0u8, 159, 146, 150]).unwrap();

        let snapshot = fs.snapshot();
        let restored = VirtualFilesystem::from_snapshot(&snapshot, 1024).unwrap();

        assert_eq!(restored.file_count(), 2);
        assert_eq!(restored.read_file("/bin/blob").unwrap(), &[0u8, 159, 146, 150]);
        assert_eq!(restored.snapshot(), snapshot);
    }
}
