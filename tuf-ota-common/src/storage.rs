use crate::{TufError, Version};

/// A trait to abstract file storage for TUF.
///
/// Root files go through two stages: [TufStorage::persist_root] stages a verified root,
/// [TufStorage::commit_root] makes every staged root trusted. Staged roots that are never
/// committed are dropped by [TufStorage::discard_uncommitted_roots].
pub trait TufStorage: Send {
    /// Delete currently stored timestamp metadata.
    fn delete_timestamp_metadata(&mut self) -> Result<(), TufError>;
    /// Delete currently stored snapshot metadata.
    fn delete_snapshot_metadata(&mut self) -> Result<(), TufError>;
    /// Stage the provided root file with its version. It becomes trusted once committed.
    fn persist_root(&mut self, version: Version, data: &[u8]) -> Result<(), TufError>;
    /// Persistently store the provided timestamp file.
    fn persist_timestamp(&mut self, data: &[u8]) -> Result<(), TufError>;
    /// Persistently store the provided snapshot file.
    fn persist_snapshot(&mut self, data: &[u8]) -> Result<(), TufError>;
    /// Persistently store the provided targets file.
    fn persist_targets(&mut self, data: &[u8]) -> Result<(), TufError>;
    /// Update the root file to the last root file that was staged.
    fn commit_root(&mut self) -> Result<(), TufError>;
    /// Drop all staged roots without trusting them.
    fn discard_uncommitted_roots(&mut self);
    fn current_root(&self) -> &[u8];
    fn current_uncommitted_root(&self) -> Option<&[u8]>;
    fn current_timestamp(&self) -> Option<&[u8]>;
    fn current_snapshot(&self) -> Option<&[u8]>;
    fn current_targets(&self) -> Option<&[u8]>;
}
