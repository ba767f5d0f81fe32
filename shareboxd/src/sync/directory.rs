use std::collections::HashSet;

use sharebox_api::FileInfo;
use uuid::Uuid;

use super::error::SyncError;
use super::store::{DirectoryEntry, DownloadTracker, SyncStore, TrackerOperation};

/// What a server index demands of this client, split by how it has to be
/// fetched.
#[derive(Debug, Default)]
pub struct DownloadSet {
    pub content: Vec<FileInfo>,
    pub deletions: Vec<FileInfo>,
    pub app_meta_data: Vec<FileInfo>,
}

impl DownloadSet {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.deletions.is_empty() && self.app_meta_data.is_empty()
    }
}

/// The client's view of which files exist, at which versions, deleted or
/// not. Entries are never forgotten on deletion so that repeat server
/// deletions stay idempotent.
#[derive(Clone)]
pub struct LocalDirectory {
    store: SyncStore,
}

impl LocalDirectory {
    pub fn new(store: SyncStore) -> Self {
        Self { store }
    }

    /// Compares a server index against the directory and decides what needs
    /// downloading.
    ///
    /// Unknown files the server already deleted are tombstoned here without
    /// queuing any work, so later passes skip them. Missing file group and
    /// mime type fields on known entries are backfilled from the index.
    pub async fn diff(&self, server_files: &[FileInfo]) -> Result<DownloadSet, SyncError> {
        let mut set = DownloadSet::default();
        for file in server_files {
            let Some(mut entry) = self.store.get_entry(file.file_uuid).await? else {
                if file.deleted {
                    let mut entry = DirectoryEntry::new(file.file_uuid, file.sharing_group_uuid);
                    entry.file_group_uuid = file.file_group_uuid;
                    entry.mime_type = Some(file.mime_type.clone());
                    entry.file_version = Some(file.file_version);
                    entry.app_meta_data_version = file.app_meta_data_version;
                    entry.deleted_locally = true;
                    entry.deleted_on_server = true;
                    self.store.upsert_entry(&entry).await?;
                } else {
                    set.content.push(file.clone());
                }
                continue;
            };

            let mut dirty = false;
            if entry.file_group_uuid.is_none() && file.file_group_uuid.is_some() {
                entry.file_group_uuid = file.file_group_uuid;
                dirty = true;
            }
            if entry.mime_type.is_none() {
                entry.mime_type = Some(file.mime_type.clone());
                dirty = true;
            }
            if dirty {
                self.store.upsert_entry(&entry).await?;
            }

            // Gone files stay out of automatic transfers until the client
            // retries them explicitly.
            if entry.gone_reason.is_some() {
                continue;
            }

            if file.deleted {
                if !entry.deleted_on_server {
                    set.deletions.push(file.clone());
                }
            } else if entry.deleted_locally {
                // Another client undeleted the file. Resurrect it with a
                // fresh download.
                set.content.push(file.clone());
            } else if entry.file_version != Some(file.file_version) {
                set.content.push(file.clone());
            } else if let Some(server_meta) = file.app_meta_data_version
                && entry.app_meta_data_version != Some(server_meta)
            {
                set.app_meta_data.push(file.clone());
            }
        }
        Ok(set)
    }

    /// Records finished content downloads. Version numbers move to what the
    /// server sent and any deletion marks are cleared.
    pub async fn apply_downloads(&self, trackers: &[DownloadTracker]) -> Result<(), SyncError> {
        for tracker in trackers {
            let mut entry = match self.store.get_entry(tracker.file_uuid).await? {
                Some(entry) => entry,
                None => {
                    let mut entry =
                        DirectoryEntry::new(tracker.file_uuid, tracker.sharing_group_uuid);
                    entry.file_group_uuid = tracker.file_group_uuid;
                    entry
                }
            };
            if let Some(expected) = &entry.mime_type
                && *expected != tracker.mime_type
            {
                return Err(SyncError::MimeTypeMismatch {
                    file_uuid: tracker.file_uuid,
                    expected: expected.clone(),
                    actual: tracker.mime_type.clone(),
                });
            }
            entry.mime_type = Some(tracker.mime_type.clone());
            if entry.file_group_uuid.is_none() {
                entry.file_group_uuid = tracker.file_group_uuid;
            }
            match tracker.operation {
                TrackerOperation::File => {
                    entry.file_version = Some(tracker.file_version);
                    if tracker.app_meta_data_version.is_some() {
                        entry.app_meta_data_version = tracker.app_meta_data_version;
                    }
                    entry.deleted_locally = false;
                    entry.deleted_on_server = false;
                }
                TrackerOperation::AppMetaData => {
                    entry.app_meta_data_version = tracker.app_meta_data_version;
                }
                TrackerOperation::Deletion | TrackerOperation::SharingGroup => {}
            }
            self.store.upsert_entry(&entry).await?;
        }
        Ok(())
    }

    /// Records server-side deletions. Files with an undeletion upload in
    /// flight keep `deleted_locally` clear so the next index does not queue
    /// the same deletion again while the undelete is pending.
    pub async fn apply_download_deletions(
        &self,
        trackers: &[DownloadTracker],
        undelete_in_flight: &HashSet<Uuid>,
    ) -> Result<(), SyncError> {
        for tracker in trackers {
            let mut entry = match self.store.get_entry(tracker.file_uuid).await? {
                Some(entry) => entry,
                None => {
                    let mut entry =
                        DirectoryEntry::new(tracker.file_uuid, tracker.sharing_group_uuid);
                    entry.file_group_uuid = tracker.file_group_uuid;
                    entry.mime_type = Some(tracker.mime_type.clone());
                    entry.file_version = Some(tracker.file_version);
                    entry
                }
            };
            entry.deleted_on_server = true;
            if !undelete_in_flight.contains(&tracker.file_uuid) {
                entry.deleted_locally = true;
            }
            self.store.upsert_entry(&entry).await?;
        }
        Ok(())
    }
}
