use crate::vfs::item::{VirtualFileSystemRoot, VirtualItem};

/// Walk an already percent-decoded request path down the tree.
///
/// `""` and `"/"` resolve to the root; a single trailing slash is ignored.
/// Returns `None` when a segment is missing or when segments remain below a file.
pub fn resolve<'a>(tree: &'a VirtualFileSystemRoot, path: &str) -> Option<VirtualItem<'a>> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);

    let mut current = VirtualItem::Root(tree.root());
    if path.is_empty() {
        return Some(current);
    }
    for segment in path.split('/') {
        // A file has no children, so anything left over is a miss.
        let dir = current.as_directory()?;
        current = dir.child(segment)?;
    }
    Some(current)
}

/// The request path that resolves back to `item`, each segment percent-encoded.
pub fn request_path(item: &VirtualItem<'_>) -> String {
    if let VirtualItem::Root(_) = item {
        return "/".to_string();
    }
    let mut segments = vec![item.key()];
    let mut parent = item.parent();
    while let Some(dir) = parent {
        if dir.is_root() {
            break;
        }
        segments.push(dir.key());
        parent = dir.parent();
    }

    let mut path = String::new();
    for segment in segments.iter().rev() {
        path.push('/');
        path.push_str(&urlencoding::encode(segment));
    }
    path
}
