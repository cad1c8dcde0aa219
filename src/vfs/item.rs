// The virtual tree is stored as a flat arena of nodes. Children are referenced by
// key -> ItemId maps and every node keeps the ItemId of its parent, so walking
// back up to the root never needs shared ownership. Once a VirtualFileSystemRoot
// has been built nothing in it changes; a refresh produces a whole new one.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub(super) usize);

impl ItemId {
    pub(crate) const ROOT: ItemId = ItemId(0);
}

#[derive(Debug)]
pub(super) enum NodeKind {
    Root { children: HashMap<String, ItemId> },
    Directory { children: HashMap<String, ItemId> },
    File { size: u64 },
}

#[derive(Debug)]
pub(super) struct Node {
    pub(super) key: String,
    pub(super) real_path: PathBuf,
    pub(super) parent: Option<ItemId>,
    pub(super) kind: NodeKind,
}

impl Node {
    pub(super) fn root() -> Node {
        Node {
            key: String::new(),
            real_path: PathBuf::new(),
            parent: None,
            kind: NodeKind::Root {
                children: HashMap::new(),
            },
        }
    }

    pub(super) fn children(&self) -> Option<&HashMap<String, ItemId>> {
        match &self.kind {
            NodeKind::Root { children } | NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    pub(super) fn children_mut(&mut self) -> Option<&mut HashMap<String, ItemId>> {
        match &mut self.kind {
            NodeKind::Root { children } | NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }
}

/// An immutable snapshot of everything being served.
#[derive(Debug)]
pub struct VirtualFileSystemRoot {
    nodes: Vec<Node>,
    generation: Uuid,
    built_at: DateTime<Utc>,
}

impl VirtualFileSystemRoot {
    /// A tree with nothing but the root in it.
    pub fn empty() -> VirtualFileSystemRoot {
        VirtualFileSystemRoot::from_nodes(vec![Node::root()])
    }

    pub(super) fn from_nodes(nodes: Vec<Node>) -> VirtualFileSystemRoot {
        VirtualFileSystemRoot {
            nodes,
            generation: Uuid::new_v4(),
            built_at: Utc::now(),
        }
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Number of items in the tree, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root().is_empty()
    }

    pub fn root(&self) -> VirtualDirectory<'_> {
        VirtualDirectory {
            tree: self,
            id: ItemId::ROOT,
        }
    }

    pub fn item(&self, id: ItemId) -> Option<VirtualItem<'_>> {
        let node = self.nodes.get(id.0)?;
        Some(match node.kind {
            NodeKind::Root { .. } => VirtualItem::Root(VirtualDirectory { tree: self, id }),
            NodeKind::Directory { .. } => {
                VirtualItem::Directory(VirtualDirectory { tree: self, id })
            }
            NodeKind::File { .. } => VirtualItem::File(VirtualFile { tree: self, id }),
        })
    }

    fn node(&self, id: ItemId) -> &Node {
        &self.nodes[id.0]
    }
}

/// A borrowed view of one node of a snapshot.
#[derive(Debug, Clone, Copy)]
pub enum VirtualItem<'a> {
    Root(VirtualDirectory<'a>),
    Directory(VirtualDirectory<'a>),
    File(VirtualFile<'a>),
}

impl<'a> VirtualItem<'a> {
    pub fn id(&self) -> ItemId {
        match self {
            VirtualItem::Root(d) | VirtualItem::Directory(d) => d.id,
            VirtualItem::File(f) => f.id,
        }
    }

    pub fn key(&self) -> &'a str {
        match self {
            VirtualItem::Root(d) | VirtualItem::Directory(d) => d.key(),
            VirtualItem::File(f) => f.key(),
        }
    }

    pub fn real_path(&self) -> &'a Path {
        match self {
            VirtualItem::Root(d) | VirtualItem::Directory(d) => d.real_path(),
            VirtualItem::File(f) => f.real_path(),
        }
    }

    pub fn parent(&self) -> Option<VirtualDirectory<'a>> {
        match self {
            VirtualItem::Root(_) => None,
            VirtualItem::Directory(d) => d.parent(),
            VirtualItem::File(f) => Some(f.parent()),
        }
    }

    pub fn as_directory(&self) -> Option<VirtualDirectory<'a>> {
        match self {
            VirtualItem::Root(d) | VirtualItem::Directory(d) => Some(*d),
            VirtualItem::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<VirtualFile<'a>> {
        match self {
            VirtualItem::File(f) => Some(*f),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VirtualDirectory<'a> {
    tree: &'a VirtualFileSystemRoot,
    id: ItemId,
}

impl<'a> VirtualDirectory<'a> {
    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn key(&self) -> &'a str {
        &self.tree.node(self.id).key
    }

    pub fn real_path(&self) -> &'a Path {
        &self.tree.node(self.id).real_path
    }

    pub fn is_root(&self) -> bool {
        self.id == ItemId::ROOT
    }

    pub fn parent(&self) -> Option<VirtualDirectory<'a>> {
        self.tree.node(self.id).parent.map(|id| VirtualDirectory {
            tree: self.tree,
            id,
        })
    }

    fn child_map(&self) -> &'a HashMap<String, ItemId> {
        // Only directory nodes are ever wrapped in a VirtualDirectory.
        static NONE: std::sync::OnceLock<HashMap<String, ItemId>> = std::sync::OnceLock::new();
        self.tree
            .node(self.id)
            .children()
            .unwrap_or_else(|| NONE.get_or_init(HashMap::new))
    }

    pub fn len(&self) -> usize {
        self.child_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.child_map().is_empty()
    }

    pub fn child(&self, key: &str) -> Option<VirtualItem<'a>> {
        let id = self.child_map().get(key)?;
        self.tree.item(*id)
    }

    pub fn children(&self) -> impl Iterator<Item = VirtualItem<'a>> + 'a {
        let tree = self.tree;
        self.child_map().values().filter_map(move |id| tree.item(*id))
    }

    pub fn files(&self) -> impl Iterator<Item = VirtualFile<'a>> + 'a {
        self.children().filter_map(|c| c.as_file())
    }

    pub fn subdirectories(&self) -> impl Iterator<Item = VirtualDirectory<'a>> + 'a {
        self.children().filter_map(|c| c.as_directory())
    }

    /// Every file below this directory, at any depth.
    pub fn descendant_files(&self) -> Vec<VirtualFile<'a>> {
        let mut files = Vec::new();
        let mut pending = vec![*self];
        while let Some(dir) = pending.pop() {
            for child in dir.children() {
                match child {
                    VirtualItem::File(f) => files.push(f),
                    VirtualItem::Directory(d) | VirtualItem::Root(d) => pending.push(d),
                }
            }
        }
        files
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VirtualFile<'a> {
    tree: &'a VirtualFileSystemRoot,
    id: ItemId,
}

impl<'a> VirtualFile<'a> {
    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn key(&self) -> &'a str {
        &self.tree.node(self.id).key
    }

    pub fn real_path(&self) -> &'a Path {
        &self.tree.node(self.id).real_path
    }

    /// Size in bytes as seen when the snapshot was taken.
    pub fn size(&self) -> u64 {
        match self.tree.node(self.id).kind {
            NodeKind::File { size } => size,
            _ => 0,
        }
    }

    pub fn parent(&self) -> VirtualDirectory<'a> {
        VirtualDirectory {
            tree: self.tree,
            id: self.tree.node(self.id).parent.unwrap_or(ItemId::ROOT),
        }
    }
}
