// In-memory mirror of the served directories. Folders and files in the mirror are
// always backed by real ones; the mirror itself is never written back to disk.

mod builder;
mod item;
mod resolver;

pub use builder::{BuildOptions, SnapshotBuilder, PLACEHOLDER_ROOT_KEY};
pub use item::{ItemId, VirtualDirectory, VirtualFile, VirtualFileSystemRoot, VirtualItem};
pub use resolver::{request_path, resolve};
