mod staging;
mod storage;

pub use staging::StagingFile;
pub use storage::{BlobStore, FilesystemStorage, MemoryStorage, TempFile, validate_key};
