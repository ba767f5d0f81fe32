use sharebox_api::FileInfo;
use uuid::Uuid;

use super::error::SyncError;
use super::store::{
    DownloadGroup, DownloadInput, GroupStatus, SyncStore, TrackerOperation, TrackerStatus,
};

/// Files sharing a file group download and land together. Ungrouped files
/// get a singleton group of their own.
pub fn group_key(file_group_uuid: Option<Uuid>, file_uuid: Uuid) -> String {
    match file_group_uuid {
        Some(group) => format!("group-{group}"),
        None => format!("file-{file_uuid}"),
    }
}

#[derive(Clone)]
pub struct ContentGroupCoordinator {
    store: SyncStore,
}

impl ContentGroupCoordinator {
    pub fn new(store: SyncStore) -> Self {
        Self { store }
    }

    /// Registers a download tracker under its content group. Returns false
    /// when the file is already tracked.
    pub async fn track(
        &self,
        file: &FileInfo,
        operation: TrackerOperation,
    ) -> Result<bool, SyncError> {
        if self.store.download_for_file(file.file_uuid).await?.is_some() {
            return Ok(false);
        }
        let key = group_key(file.file_group_uuid, file.file_uuid);
        self.store
            .ensure_group(&DownloadGroup {
                group_key: key.clone(),
                sharing_group_uuid: file.sharing_group_uuid,
                file_group_uuid: file.file_group_uuid,
                status: GroupStatus::NotStarted,
            })
            .await?;
        self.store
            .insert_download(&DownloadInput {
                file_uuid: file.file_uuid,
                sharing_group_uuid: file.sharing_group_uuid,
                file_group_uuid: file.file_group_uuid,
                group_key: key,
                operation,
                file_version: file.file_version,
                app_meta_data_version: file.app_meta_data_version,
                mime_type: file.mime_type.clone(),
            })
            .await?;
        Ok(true)
    }

    /// Picks the group to work on next. A group already marked downloading
    /// resumes first; finding more than one is a broken store and fatal.
    pub async fn next_group(&self) -> Result<Option<DownloadGroup>, SyncError> {
        let groups = self.store.download_groups().await?;
        let mut downloading = groups
            .iter()
            .filter(|group| group.status == GroupStatus::Downloading);
        let resumed = downloading.next().cloned();
        if downloading.next().is_some() {
            return Err(SyncError::MultipleGroupsDownloading);
        }
        if resumed.is_some() {
            return Ok(resumed);
        }
        Ok(groups
            .into_iter()
            .find(|group| group.status == GroupStatus::NotStarted))
    }

    /// A group is complete when every tracker either finished transferring
    /// or stands for a deletion, which needs no transfer.
    pub async fn is_complete(&self, group_key: &str) -> Result<bool, SyncError> {
        let trackers = self.store.downloads_for_group(group_key).await?;
        Ok(trackers.iter().all(|tracker| {
            tracker.status == TrackerStatus::Done
                || tracker.operation == TrackerOperation::Deletion
        }))
    }
}
