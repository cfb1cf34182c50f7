use serde::Serialize;

use super::files::sandbox_path;
use std::path::Path;

/// Directory tree of a sandbox source root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Directory,
    File,
}

impl FileNode {
    fn directory(name: &str, path: String) -> Self {
        Self {
            name: name.to_string(),
            path,
            kind: NodeKind::Directory,
            size: None,
            children: Vec::new(),
        }
    }

    /// Build a tree from sorted `(relative path, size)` pairs.
    pub fn from_entries(source_root: &str, entries: &[(String, u64)]) -> Self {
        let root_name = source_root
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or("/");
        let mut root = Self::directory(root_name, source_root.to_string());

        for (relative, size) in entries {
            let parts: Vec<&str> = relative.split('/').filter(|p| !p.is_empty()).collect();
            let Some((file_name, dirs)) = parts.split_last() else {
                continue;
            };

            let mut node = &mut root;
            let mut walked = String::new();
            for dir in dirs {
                if !walked.is_empty() {
                    walked.push('/');
                }
                walked.push_str(dir);
                let index = match node
                    .children
                    .iter()
                    .position(|c| c.kind == NodeKind::Directory && c.name == *dir)
                {
                    Some(index) => index,
                    None => {
                        node.children.push(Self::directory(
                            dir,
                            sandbox_path(source_root, Path::new(&walked)),
                        ));
                        node.children.len() - 1
                    }
                };
                node = &mut node.children[index];
            }

            node.children.push(Self {
                name: file_name.to_string(),
                path: sandbox_path(source_root, Path::new(relative)),
                kind: NodeKind::File,
                size: Some(*size),
                children: Vec::new(),
            });
        }
        root
    }

    /// Number of files below this node.
    pub fn file_count(&self) -> usize {
        match self.kind {
            NodeKind::File => 1,
            NodeKind::Directory => self.children.iter().map(Self::file_count).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(paths: &[&str]) -> Vec<(String, u64)> {
        paths.iter().map(|p| (p.to_string(), 1)).collect()
    }

    #[test]
    fn test_nested_tree() {
        let tree = FileNode::from_entries(
            "/app/src",
            &entries(&["package.json", "pages/api/hello.ts", "pages/index.tsx"]),
        );
        assert_eq!(tree.name, "src");
        assert_eq!(tree.path, "/app/src");
        assert_eq!(tree.file_count(), 3);
        assert_eq!(tree.children.len(), 2);

        let pages = &tree.children[1];
        assert_eq!(pages.kind, NodeKind::Directory);
        assert_eq!(pages.path, "/app/src/pages");
        let api = &pages.children[0];
        assert_eq!(api.path, "/app/src/pages/api");
        assert_eq!(api.children[0].path, "/app/src/pages/api/hello.ts");
        assert_eq!(pages.children[1].name, "index.tsx");
    }

    #[test]
    fn test_empty_tree_serializes_without_children() {
        let tree = FileNode::from_entries("/app/src", &[]);
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "name": "src", "path": "/app/src", "type": "directory" })
        );
    }

    #[test]
    fn test_root_source_dir() {
        let tree = FileNode::from_entries("/", &entries(&["a.ts"]));
        assert_eq!(tree.name, "/");
        assert_eq!(tree.children[0].path, "/a.ts");
    }
}
