use serde::Serialize;

use crate::vfs::{request_path, VirtualDirectory, VirtualFileSystemRoot, VirtualItem};

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct IndexFile {
    pub url: String,
    pub size: u64,
}

/// Listing returned for a directory request.
#[derive(Debug, Serialize)]
pub struct IndexDocument {
    pub files: Vec<IndexFile>,
    pub directories: Vec<String>,
    pub generation: String,
}

impl IndexDocument {
    /// Every file below `dir` plus the immediate subdirectories of `dir`.
    pub fn for_directory(tree: &VirtualFileSystemRoot, dir: VirtualDirectory<'_>) -> IndexDocument {
        let mut files: Vec<IndexFile> = dir
            .descendant_files()
            .into_iter()
            .map(|f| IndexFile {
                url: request_path(&VirtualItem::File(f)),
                size: f.size(),
            })
            .collect();
        files.sort_by(|a, b| a.url.cmp(&b.url));

        let mut directories: Vec<String> = dir
            .subdirectories()
            .map(|d| format!("{}/", request_path(&VirtualItem::Directory(d))))
            .collect();
        directories.sort();

        IndexDocument {
            files,
            directories,
            generation: tree.generation().to_string(),
        }
    }
}
