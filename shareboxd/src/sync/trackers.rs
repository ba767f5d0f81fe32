use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::SyncError;
use super::events::SyncAttributes;
use super::store::{DirectoryEntry, SyncStore, TrackerOperation, UploadInput};

/// Intake side of the upload pipeline. Client calls land here as pending
/// trackers; `promote` numbers the pending set as the next batch when a sync
/// is requested.
///
/// The age counter orders every tracker ever queued. It survives restarts by
/// reseeding from the store.
pub struct TrackerQueue {
    store: SyncStore,
    next_age: AtomicI64,
    lock: Mutex<()>,
}

impl TrackerQueue {
    pub async fn open(store: SyncStore) -> Result<Self, SyncError> {
        let seed = store.max_upload_age().await? + 1;
        Ok(Self {
            store,
            next_age: AtomicI64::new(seed),
            lock: Mutex::new(()),
        })
    }

    fn next_age(&self) -> i64 {
        self.next_age.fetch_add(1, Ordering::SeqCst)
    }

    /// Queues a file content upload. A later enqueue for the same file
    /// replaces the pending tracker; batches already promoted are left
    /// alone.
    pub async fn enqueue_upload(
        &self,
        local_file: &Path,
        attr: &SyncAttributes,
    ) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;
        let entry = self.check_uploadable(attr).await?;
        self.register_entry(entry, attr).await?;
        let input = UploadInput {
            file_uuid: attr.file_uuid,
            sharing_group_uuid: attr.sharing_group_uuid,
            file_group_uuid: attr.file_group_uuid,
            operation: TrackerOperation::File,
            age: self.next_age(),
            local_path: Some(local_file.to_string_lossy().into_owned()),
            mime_type: Some(attr.mime_type.clone()),
            app_meta_data: attr.app_meta_data.clone(),
            new_name: None,
        };
        self.store.replace_pending_content_upload(&input).await?;
        Ok(())
    }

    /// Queues an app meta data upload for an already known file.
    pub async fn enqueue_app_meta_data_upload(
        &self,
        attr: &SyncAttributes,
    ) -> Result<(), SyncError> {
        if attr.app_meta_data.is_none() {
            return Err(SyncError::MissingAppMetaData(attr.file_uuid));
        }
        let _guard = self.lock.lock().await;
        let entry = self.check_uploadable(attr).await?;
        if entry.is_none() {
            return Err(SyncError::UnknownFile(attr.file_uuid));
        }
        let input = UploadInput {
            file_uuid: attr.file_uuid,
            sharing_group_uuid: attr.sharing_group_uuid,
            file_group_uuid: attr.file_group_uuid,
            operation: TrackerOperation::AppMetaData,
            age: self.next_age(),
            local_path: None,
            mime_type: Some(attr.mime_type.clone()),
            app_meta_data: attr.app_meta_data.clone(),
            new_name: None,
        };
        self.store.replace_pending_content_upload(&input).await?;
        Ok(())
    }

    pub async fn enqueue_deletion(&self, file_uuid: Uuid) -> Result<(), SyncError> {
        self.enqueue_deletions(&[file_uuid]).await
    }

    /// Queues deletions for several files as one unit. Validation failures
    /// on any file leave the whole call without effect.
    ///
    /// Files that never reached the server and have no promoted uploads are
    /// tombstoned locally without server traffic.
    pub async fn enqueue_deletions(&self, file_uuids: &[Uuid]) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;
        let mut inputs = Vec::new();
        let mut local_only = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for &file_uuid in file_uuids {
            if !seen.insert(file_uuid) {
                return Err(SyncError::FileQueuedForDeletion(file_uuid));
            }
            let entry = self
                .store
                .get_entry(file_uuid)
                .await?
                .ok_or(SyncError::DeletingUnknownFile(file_uuid))?;
            if entry.deleted_locally || entry.deleted_on_server {
                return Err(SyncError::FileAlreadyDeleted(file_uuid));
            }
            let uploads = self.store.uploads_for_file(file_uuid).await?;
            if uploads
                .iter()
                .any(|upload| upload.operation == TrackerOperation::Deletion)
            {
                return Err(SyncError::FileQueuedForDeletion(file_uuid));
            }
            let promoted = uploads.iter().any(|upload| upload.batch.is_some());
            if entry.file_version.is_none() && !promoted {
                local_only.push(file_uuid);
            } else {
                inputs.push(UploadInput {
                    file_uuid,
                    sharing_group_uuid: entry.sharing_group_uuid,
                    file_group_uuid: entry.file_group_uuid,
                    operation: TrackerOperation::Deletion,
                    age: self.next_age(),
                    local_path: None,
                    mime_type: None,
                    app_meta_data: None,
                    new_name: None,
                });
            }
        }
        self.store
            .enqueue_deletion_trackers(&inputs, &local_only)
            .await?;
        Ok(())
    }

    /// Queues a rename of a sharing group.
    pub async fn enqueue_sharing_group_update(
        &self,
        sharing_group: Uuid,
        new_name: &str,
    ) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;
        if self.store.get_sharing_entry(sharing_group).await?.is_none() {
            return Err(SyncError::UnknownSharingGroup(sharing_group));
        }
        let input = UploadInput {
            file_uuid: sharing_group,
            sharing_group_uuid: sharing_group,
            file_group_uuid: None,
            operation: TrackerOperation::SharingGroup,
            age: self.next_age(),
            local_path: None,
            mime_type: None,
            app_meta_data: None,
            new_name: Some(new_name.to_string()),
        };
        self.store.insert_upload(&input).await?;
        Ok(())
    }

    /// Turns the pending set into the next numbered batch. Returns the batch
    /// number, or None when nothing was pending.
    pub async fn promote(&self) -> Result<Option<i64>, SyncError> {
        let _guard = self.lock.lock().await;
        Ok(self.store.promote_pending_batch().await?)
    }

    async fn check_uploadable(
        &self,
        attr: &SyncAttributes,
    ) -> Result<Option<DirectoryEntry>, SyncError> {
        let entry = self.store.get_entry(attr.file_uuid).await?;
        if let Some(entry) = &entry {
            if let Some(mime) = &entry.mime_type
                && *mime != attr.mime_type
            {
                return Err(SyncError::MimeTypeChanged(attr.file_uuid));
            }
            if let (Some(have), Some(want)) = (entry.file_group_uuid, attr.file_group_uuid)
                && have != want
            {
                return Err(SyncError::FileGroupChanged(attr.file_uuid));
            }
            if entry.deleted_on_server && !undeletion_pending(self, attr.file_uuid).await? {
                return Err(SyncError::FileAlreadyDeleted(attr.file_uuid));
            }
        }
        let uploads = self.store.uploads_for_file(attr.file_uuid).await?;
        if uploads
            .iter()
            .any(|upload| upload.operation == TrackerOperation::Deletion)
        {
            return Err(SyncError::FileQueuedForDeletion(attr.file_uuid));
        }
        Ok(entry)
    }

    async fn register_entry(
        &self,
        entry: Option<DirectoryEntry>,
        attr: &SyncAttributes,
    ) -> Result<(), SyncError> {
        match entry {
            None => {
                let mut entry = DirectoryEntry::new(attr.file_uuid, attr.sharing_group_uuid);
                entry.file_group_uuid = attr.file_group_uuid;
                entry.mime_type = Some(attr.mime_type.clone());
                self.store.upsert_entry(&entry).await?;
            }
            Some(mut entry) => {
                if entry.file_group_uuid.is_none() && attr.file_group_uuid.is_some() {
                    entry.file_group_uuid = attr.file_group_uuid;
                    self.store.upsert_entry(&entry).await?;
                }
            }
        }
        Ok(())
    }
}

async fn undeletion_pending(queue: &TrackerQueue, file_uuid: Uuid) -> Result<bool, SyncError> {
    let uploads = queue.store.uploads_for_file(file_uuid).await?;
    Ok(uploads.iter().any(|upload| upload.undelete))
}
