// Builds a fresh VirtualFileSystemRoot from the real served directories.
//
// Every failure below the level of "the whole build" is logged and the offending
// entry skipped: a directory that cannot be listed, a file whose metadata cannot
// be read, a served root that has disappeared. The result is always a usable,
// possibly partial, tree.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::settings::Settings;
use crate::vfs::item::{ItemId, Node, NodeKind, VirtualFileSystemRoot};

/// Key given to a served directory that has no final path component, e.g. `/` or `C:\`.
pub const PLACEHOLDER_ROOT_KEY: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub flatten: bool,
    pub exclude_empty_directories: bool,
    allowed_extensions: HashSet<String>,
}

impl BuildOptions {
    pub fn new<I, S>(flatten: bool, exclude_empty_directories: bool, extensions: I) -> BuildOptions
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        BuildOptions {
            flatten,
            exclude_empty_directories,
            allowed_extensions: extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn from_settings(settings: &Settings) -> BuildOptions {
        BuildOptions::new(
            settings.flatten,
            settings.exclude_empty_directories,
            &settings.allowed_extensions,
        )
    }

    pub fn allows(&self, path: &Path) -> bool {
        match path.extension().and_then(OsStr::to_str) {
            Some(ext) => self.allowed_extensions.contains(&ext.to_lowercase()),
            None => false,
        }
    }
}

pub(crate) fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

pub struct SnapshotBuilder {
    options: BuildOptions,
}

impl SnapshotBuilder {
    pub fn new(options: BuildOptions) -> SnapshotBuilder {
        SnapshotBuilder { options }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Walk the served directories and produce a brand new tree.
    #[instrument(name = "builder.build", level = "info", skip(self, served_directories), fields(
        served = served_directories.len(),
        flatten = self.options.flatten
    ))]
    pub fn build(&self, served_directories: &[PathBuf]) -> VirtualFileSystemRoot {
        let mut arena = TreeArena::new();
        if self.options.flatten {
            self.build_flat(&mut arena, served_directories);
        } else {
            self.build_hierarchical(&mut arena, served_directories);
            if self.options.exclude_empty_directories {
                arena.prune_empty_directories();
            }
        }
        let tree = arena.finish();
        tracing::info!(
            "Built snapshot {} with {} items",
            tree.generation(),
            tree.len()
        );
        tree
    }

    fn build_flat(&self, arena: &mut TreeArena, served_directories: &[PathBuf]) {
        let mut pending: VecDeque<PathBuf> = served_directories
            .iter()
            .filter(|dir| is_served_directory(dir))
            .cloned()
            .collect();

        while let Some(dir) = pending.pop_front() {
            for entry in list_directory(&dir) {
                match entry {
                    Entry::Directory(path) => pending.push_back(path),
                    Entry::File(path, size) => {
                        if self.options.allows(&path) {
                            arena.insert_file(ItemId::ROOT, path, size);
                        }
                    }
                }
            }
        }
    }

    fn build_hierarchical(&self, arena: &mut TreeArena, served_directories: &[PathBuf]) {
        let mut pending: VecDeque<(PathBuf, ItemId)> = VecDeque::new();
        for dir in served_directories {
            if !is_served_directory(dir) {
                continue;
            }
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| PLACEHOLDER_ROOT_KEY.to_string());
            let id = arena.insert_directory(ItemId::ROOT, &name, dir.clone());
            pending.push_back((dir.clone(), id));
        }

        while let Some((dir, parent)) = pending.pop_front() {
            for entry in list_directory(&dir) {
                match entry {
                    Entry::Directory(path) => {
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        let id = arena.insert_directory(parent, &name, path.clone());
                        pending.push_back((path, id));
                    }
                    Entry::File(path, size) => {
                        if self.options.allows(&path) {
                            arena.insert_file(parent, path, size);
                        }
                    }
                }
            }
        }
    }
}

fn is_served_directory(dir: &Path) -> bool {
    match fs::metadata(dir) {
        Ok(metadata) if metadata.is_dir() => true,
        Ok(_) => {
            tracing::warn!("Served path {} is not a directory, skipping", dir.display());
            false
        }
        Err(e) => {
            tracing::warn!("Served directory {} is unavailable: {}", dir.display(), e);
            false
        }
    }
}

enum Entry {
    Directory(PathBuf),
    File(PathBuf, u64),
}

/// The readable entries of one directory, sorted by name.
fn list_directory(dir: &Path) -> Vec<Entry> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) => {
            tracing::warn!("Failed to list directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut paths = Vec::new();
    for entry in read_dir {
        match entry {
            Ok(entry) => paths.push(entry.path()),
            Err(e) => tracing::warn!("Failed to read an entry of {}: {}", dir.display(), e),
        }
    }
    paths.sort();

    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        // fs::metadata follows symlinks
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_dir() => entries.push(Entry::Directory(path)),
            Ok(metadata) if metadata.is_file() => entries.push(Entry::File(path, metadata.len())),
            Ok(_) => tracing::debug!("Skipping special file {}", path.display()),
            Err(e) => tracing::warn!("Failed to read metadata of {}: {}", path.display(), e),
        }
    }
    entries
}

/// Turn a real file name into something usable as a single URL path segment.
pub(crate) fn sanitize_key(name: &str) -> String {
    let key: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '#' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if key.is_empty() {
        "_".to_string()
    } else {
        key
    }
}

/// `name` with `_<n>` appended, placed before the extension for files.
pub(crate) fn suffixed_key(natural: &str, n: usize, is_file: bool) -> String {
    if is_file {
        if let Some(dot) = natural.rfind('.').filter(|dot| *dot > 0) {
            let (stem, ext) = natural.split_at(dot);
            return format!("{}_{}{}", stem, n, ext);
        }
    }
    format!("{}_{}", natural, n)
}

fn free_key(siblings: &HashMap<String, ItemId>, natural: &str, is_file: bool) -> String {
    if !siblings.contains_key(natural) {
        return natural.to_string();
    }
    // Each taken candidate is a distinct sibling, so one of the first len + 1 is free.
    (1..=siblings.len() + 1)
        .map(|n| suffixed_key(natural, n, is_file))
        .find(|candidate| !siblings.contains_key(candidate))
        .unwrap_or_else(|| format!("{}_{}", natural, uuid::Uuid::new_v4()))
}

/// Mutable arena used only while a build is in progress.
struct TreeArena {
    nodes: Vec<Node>,
}

impl TreeArena {
    fn new() -> TreeArena {
        TreeArena {
            nodes: vec![Node::root()],
        }
    }

    fn insert(&mut self, parent: ItemId, natural: &str, real_path: PathBuf, kind: NodeKind) -> ItemId {
        let is_file = matches!(kind, NodeKind::File { .. });
        let id = ItemId(self.nodes.len());
        let natural = sanitize_key(natural);
        let Some(siblings) = self.nodes[parent.0].children_mut() else {
            // Callers only ever pass directory ids as parents.
            tracing::error!("Refusing to insert {} below a file", real_path.display());
            return parent;
        };
        let key = free_key(siblings, &natural, is_file);
        if key != natural {
            tracing::debug!("Name {} already taken, using {}", natural, key);
        }
        siblings.insert(key.clone(), id);
        self.nodes.push(Node {
            key,
            real_path,
            parent: Some(parent),
            kind,
        });
        id
    }

    fn insert_directory(&mut self, parent: ItemId, name: &str, real_path: PathBuf) -> ItemId {
        self.insert(
            parent,
            name,
            real_path,
            NodeKind::Directory {
                children: HashMap::new(),
            },
        )
    }

    fn insert_file(&mut self, parent: ItemId, real_path: PathBuf, size: u64) -> ItemId {
        let name = real_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.insert(parent, &name, real_path, NodeKind::File { size })
    }

    /// Remove every directory that has no file anywhere below it.
    fn prune_empty_directories(&mut self) {
        // Children are always pushed after their parent, so walking the arena
        // backwards settles every subdirectory before the directory holding it.
        let mut removed = vec![false; self.nodes.len()];
        for index in (1..self.nodes.len()).rev() {
            let empty = match &self.nodes[index].kind {
                NodeKind::Directory { children } => {
                    children.values().all(|child| removed[child.0])
                }
                _ => false,
            };
            if empty {
                removed[index] = true;
            }
        }
        if !removed.iter().any(|r| *r) {
            return;
        }

        let old_nodes = std::mem::take(&mut self.nodes);
        let mut remap: Vec<Option<ItemId>> = vec![None; old_nodes.len()];
        let mut next = 0;
        for (index, is_removed) in removed.iter().enumerate() {
            if !is_removed {
                remap[index] = Some(ItemId(next));
                next += 1;
            }
        }

        for (index, mut node) in old_nodes.into_iter().enumerate() {
            if removed[index] {
                continue;
            }
            node.parent = node.parent.and_then(|p| remap[p.0]);
            if let Some(children) = node.children_mut() {
                children.retain(|_, child| match remap[child.0] {
                    Some(new_id) => {
                        *child = new_id;
                        true
                    }
                    None => false,
                });
            }
            self.nodes.push(node);
        }
        tracing::debug!(
            "Pruned {} empty directories",
            removed.iter().filter(|r| **r).count()
        );
    }

    fn finish(self) -> VirtualFileSystemRoot {
        VirtualFileSystemRoot::from_nodes(self.nodes)
    }
}
