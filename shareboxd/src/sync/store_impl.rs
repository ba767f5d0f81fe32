use sqlx::{Row, sqlite::SqliteRow};
use uuid::Uuid;

use sharebox_api::GoneReason;

use super::store::{
    DirectoryEntry, DownloadGroup, DownloadInput, DownloadTracker, GroupStatus, SharingEntry,
    StoreError, SyncStore, TrackerOperation, TrackerStatus, UploadInput, UploadTracker,
    parse_gone_reason, parse_optional_uuid, parse_permission, parse_uuid, permission_as_str,
};

const ENTRY_COLUMNS: &str = "file_uuid, sharing_group_uuid, file_group_uuid, mime_type, \
     file_version, app_meta_data_version, deleted_locally, deleted_on_server, gone_reason";

const UPLOAD_COLUMNS: &str = "id, file_uuid, sharing_group_uuid, file_group_uuid, operation, \
     status, age, batch, local_path, mime_type, app_meta_data, target_version, undelete, new_name";

const DOWNLOAD_COLUMNS: &str = "id, file_uuid, sharing_group_uuid, file_group_uuid, group_key, \
     operation, status, file_version, app_meta_data_version, mime_type, local_path, \
     app_meta_data, gone_reason, delivered";

fn entry_from_row(row: &SqliteRow) -> Result<DirectoryEntry, StoreError> {
    let file_uuid: String = row.try_get("file_uuid")?;
    let sharing_group_uuid: String = row.try_get("sharing_group_uuid")?;
    let file_group_uuid: Option<String> = row.try_get("file_group_uuid")?;
    let deleted_locally: i64 = row.try_get("deleted_locally")?;
    let deleted_on_server: i64 = row.try_get("deleted_on_server")?;
    let gone_reason: Option<String> = row.try_get("gone_reason")?;
    Ok(DirectoryEntry {
        file_uuid: parse_uuid(&file_uuid)?,
        sharing_group_uuid: parse_uuid(&sharing_group_uuid)?,
        file_group_uuid: parse_optional_uuid(file_group_uuid)?,
        mime_type: row.try_get("mime_type")?,
        file_version: row.try_get("file_version")?,
        app_meta_data_version: row.try_get("app_meta_data_version")?,
        deleted_locally: deleted_locally != 0,
        deleted_on_server: deleted_on_server != 0,
        gone_reason: parse_gone_reason(gone_reason)?,
    })
}

fn upload_from_row(row: &SqliteRow) -> Result<UploadTracker, StoreError> {
    let file_uuid: String = row.try_get("file_uuid")?;
    let sharing_group_uuid: String = row.try_get("sharing_group_uuid")?;
    let file_group_uuid: Option<String> = row.try_get("file_group_uuid")?;
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    let undelete: i64 = row.try_get("undelete")?;
    Ok(UploadTracker {
        id: row.try_get("id")?,
        file_uuid: parse_uuid(&file_uuid)?,
        sharing_group_uuid: parse_uuid(&sharing_group_uuid)?,
        file_group_uuid: parse_optional_uuid(file_group_uuid)?,
        operation: TrackerOperation::parse(&operation)?,
        status: TrackerStatus::parse(&status)?,
        age: row.try_get("age")?,
        batch: row.try_get("batch")?,
        local_path: row.try_get("local_path")?,
        mime_type: row.try_get("mime_type")?,
        app_meta_data: row.try_get("app_meta_data")?,
        target_version: row.try_get("target_version")?,
        undelete: undelete != 0,
        new_name: row.try_get("new_name")?,
    })
}

fn download_from_row(row: &SqliteRow) -> Result<DownloadTracker, StoreError> {
    let file_uuid: String = row.try_get("file_uuid")?;
    let sharing_group_uuid: String = row.try_get("sharing_group_uuid")?;
    let file_group_uuid: Option<String> = row.try_get("file_group_uuid")?;
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    let gone_reason: Option<String> = row.try_get("gone_reason")?;
    let delivered: i64 = row.try_get("delivered")?;
    Ok(DownloadTracker {
        id: row.try_get("id")?,
        file_uuid: parse_uuid(&file_uuid)?,
        sharing_group_uuid: parse_uuid(&sharing_group_uuid)?,
        file_group_uuid: parse_optional_uuid(file_group_uuid)?,
        group_key: row.try_get("group_key")?,
        operation: TrackerOperation::parse(&operation)?,
        status: TrackerStatus::parse(&status)?,
        file_version: row.try_get("file_version")?,
        app_meta_data_version: row.try_get("app_meta_data_version")?,
        mime_type: row.try_get("mime_type")?,
        local_path: row.try_get("local_path")?,
        app_meta_data: row.try_get("app_meta_data")?,
        gone_reason: parse_gone_reason(gone_reason)?,
        delivered: delivered != 0,
    })
}

fn group_from_row(row: &SqliteRow) -> Result<DownloadGroup, StoreError> {
    let sharing_group_uuid: String = row.try_get("sharing_group_uuid")?;
    let file_group_uuid: Option<String> = row.try_get("file_group_uuid")?;
    let status: String = row.try_get("status")?;
    Ok(DownloadGroup {
        group_key: row.try_get("group_key")?,
        sharing_group_uuid: parse_uuid(&sharing_group_uuid)?,
        file_group_uuid: parse_optional_uuid(file_group_uuid)?,
        status: GroupStatus::parse(&status)?,
    })
}

fn sharing_from_row(row: &SqliteRow) -> Result<SharingEntry, StoreError> {
    let sharing_group_uuid: String = row.try_get("sharing_group_uuid")?;
    let permission: String = row.try_get("permission")?;
    let sync_needed: i64 = row.try_get("sync_needed")?;
    let removed_from_group: i64 = row.try_get("removed_from_group")?;
    Ok(SharingEntry {
        sharing_group_uuid: parse_uuid(&sharing_group_uuid)?,
        name: row.try_get("name")?,
        permission: parse_permission(&permission)?,
        master_version: row.try_get("master_version")?,
        sync_needed: sync_needed != 0,
        removed_from_group: removed_from_group != 0,
    })
}

impl SyncStore {
    pub async fn upsert_entry(&self, entry: &DirectoryEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO directory_entries (
                file_uuid,
                sharing_group_uuid,
                file_group_uuid,
                mime_type,
                file_version,
                app_meta_data_version,
                deleted_locally,
                deleted_on_server,
                gone_reason
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(file_uuid) DO UPDATE SET
                sharing_group_uuid = excluded.sharing_group_uuid,
                file_group_uuid = excluded.file_group_uuid,
                mime_type = excluded.mime_type,
                file_version = excluded.file_version,
                app_meta_data_version = excluded.app_meta_data_version,
                deleted_locally = excluded.deleted_locally,
                deleted_on_server = excluded.deleted_on_server,
                gone_reason = excluded.gone_reason;",
        )
        .bind(entry.file_uuid.to_string())
        .bind(entry.sharing_group_uuid.to_string())
        .bind(entry.file_group_uuid.map(|uuid| uuid.to_string()))
        .bind(&entry.mime_type)
        .bind(entry.file_version)
        .bind(entry.app_meta_data_version)
        .bind(if entry.deleted_locally { 1 } else { 0 })
        .bind(if entry.deleted_on_server { 1 } else { 0 })
        .bind(entry.gone_reason.map(|reason| reason.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_entry(&self, file_uuid: Uuid) -> Result<Option<DirectoryEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM directory_entries WHERE file_uuid = ?1"
        ))
        .bind(file_uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(entry_from_row(&row)?))
    }

    pub async fn entries_for_sharing_group(
        &self,
        sharing_group: Uuid,
    ) -> Result<Vec<DirectoryEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM directory_entries
             WHERE sharing_group_uuid = ?1 ORDER BY file_uuid ASC"
        ))
        .bind(sharing_group.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn all_entries(&self) -> Result<Vec<DirectoryEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM directory_entries ORDER BY file_uuid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn remove_entry(&self, file_uuid: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM directory_entries WHERE file_uuid = ?1")
            .bind(file_uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_upload(&self, input: &UploadInput) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO upload_trackers (
                file_uuid,
                sharing_group_uuid,
                file_group_uuid,
                operation,
                status,
                age,
                local_path,
                mime_type,
                app_meta_data,
                new_name
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(input.file_uuid.to_string())
        .bind(input.sharing_group_uuid.to_string())
        .bind(input.file_group_uuid.map(|uuid| uuid.to_string()))
        .bind(input.operation.as_str())
        .bind(TrackerStatus::NotStarted.as_str())
        .bind(input.age)
        .bind(&input.local_path)
        .bind(&input.mime_type)
        .bind(&input.app_meta_data)
        .bind(&input.new_name)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Replaces any pending content upload for the same file in a single
    /// transaction. Numbered batches are never touched.
    pub async fn replace_pending_content_upload(
        &self,
        input: &UploadInput,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM upload_trackers
             WHERE file_uuid = ?1 AND batch IS NULL AND operation IN ('file', 'app_meta_data')",
        )
        .bind(input.file_uuid.to_string())
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "INSERT INTO upload_trackers (
                file_uuid,
                sharing_group_uuid,
                file_group_uuid,
                operation,
                status,
                age,
                local_path,
                mime_type,
                app_meta_data,
                new_name
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(input.file_uuid.to_string())
        .bind(input.sharing_group_uuid.to_string())
        .bind(input.file_group_uuid.map(|uuid| uuid.to_string()))
        .bind(input.operation.as_str())
        .bind(TrackerStatus::NotStarted.as_str())
        .bind(input.age)
        .bind(&input.local_path)
        .bind(&input.mime_type)
        .bind(&input.app_meta_data)
        .bind(&input.new_name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// Queues deletion trackers and tombstones local-only files atomically.
    /// Pending content uploads for every named file are dropped.
    pub async fn enqueue_deletion_trackers(
        &self,
        inputs: &[UploadInput],
        local_only: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for input in inputs {
            sqlx::query(
                "DELETE FROM upload_trackers
                 WHERE file_uuid = ?1 AND batch IS NULL AND operation IN ('file', 'app_meta_data')",
            )
            .bind(input.file_uuid.to_string())
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO upload_trackers (
                    file_uuid,
                    sharing_group_uuid,
                    file_group_uuid,
                    operation,
                    status,
                    age
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(input.file_uuid.to_string())
            .bind(input.sharing_group_uuid.to_string())
            .bind(input.file_group_uuid.map(|uuid| uuid.to_string()))
            .bind(input.operation.as_str())
            .bind(TrackerStatus::NotStarted.as_str())
            .bind(input.age)
            .execute(&mut *tx)
            .await?;
        }
        for file_uuid in local_only {
            sqlx::query(
                "DELETE FROM upload_trackers
                 WHERE file_uuid = ?1 AND batch IS NULL AND operation IN ('file', 'app_meta_data')",
            )
            .bind(file_uuid.to_string())
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE directory_entries SET deleted_locally = 1, deleted_on_server = 1
                 WHERE file_uuid = ?1",
            )
            .bind(file_uuid.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn pending_uploads(&self) -> Result<Vec<UploadTracker>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload_trackers
             WHERE batch IS NULL ORDER BY age ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(upload_from_row).collect()
    }

    pub async fn uploads_for_file(&self, file_uuid: Uuid) -> Result<Vec<UploadTracker>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload_trackers
             WHERE file_uuid = ?1 ORDER BY age ASC"
        ))
        .bind(file_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(upload_from_row).collect()
    }

    pub async fn queued_uploads(&self) -> Result<Vec<UploadTracker>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload_trackers
             WHERE batch IS NOT NULL ORDER BY batch ASC, age ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(upload_from_row).collect()
    }

    pub async fn remove_upload(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM upload_trackers WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_content_uploads_for_file(&self, file_uuid: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM upload_trackers
             WHERE file_uuid = ?1 AND operation IN ('file', 'app_meta_data')",
        )
        .bind(file_uuid.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_deletion_uploads_for_file(&self, file_uuid: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM upload_trackers WHERE file_uuid = ?1 AND operation = 'deletion'")
            .bind(file_uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Numbers the pending set as the next synced batch. Returns the batch
    /// number, or None when nothing was pending.
    pub async fn promote_pending_batch(&self) -> Result<Option<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM upload_trackers WHERE batch IS NULL")
                .fetch_one(&mut *tx)
                .await?;
        if pending == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        let next: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(batch), -1) + 1 FROM upload_trackers")
                .fetch_one(&mut *tx)
                .await?;
        sqlx::query("UPDATE upload_trackers SET batch = ?1 WHERE batch IS NULL")
            .bind(next)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(next))
    }

    pub async fn head_batch_for_group(
        &self,
        sharing_group: Uuid,
    ) -> Result<Option<i64>, StoreError> {
        let batch: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(batch) FROM upload_trackers
             WHERE batch IS NOT NULL AND sharing_group_uuid = ?1",
        )
        .bind(sharing_group.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(batch)
    }

    pub async fn batch_uploads(
        &self,
        batch: i64,
        sharing_group: Uuid,
    ) -> Result<Vec<UploadTracker>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload_trackers
             WHERE batch = ?1 AND sharing_group_uuid = ?2 ORDER BY age ASC"
        ))
        .bind(batch)
        .bind(sharing_group.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(upload_from_row).collect()
    }

    pub async fn set_upload_status(&self, id: i64, status: TrackerStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE upload_trackers SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_upload_target_version(&self, id: i64, version: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE upload_trackers SET target_version = ?1 WHERE id = ?2")
            .bind(version)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_upload_undelete(&self, id: i64, undelete: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE upload_trackers SET undelete = ?1 WHERE id = ?2")
            .bind(if undelete { 1 } else { 0 })
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn reset_batch_statuses(&self, batch: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE upload_trackers SET status = 'not_started' WHERE batch = ?1")
            .bind(batch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn max_upload_age(&self) -> Result<i64, StoreError> {
        let age: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(age), -1) FROM upload_trackers")
            .fetch_one(&self.pool)
            .await?;
        Ok(age)
    }

    pub async fn insert_download(&self, input: &DownloadInput) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO download_trackers (
                file_uuid,
                sharing_group_uuid,
                file_group_uuid,
                group_key,
                operation,
                status,
                file_version,
                app_meta_data_version,
                mime_type
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(input.file_uuid.to_string())
        .bind(input.sharing_group_uuid.to_string())
        .bind(input.file_group_uuid.map(|uuid| uuid.to_string()))
        .bind(&input.group_key)
        .bind(input.operation.as_str())
        .bind(TrackerStatus::NotStarted.as_str())
        .bind(input.file_version)
        .bind(input.app_meta_data_version)
        .bind(&input.mime_type)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn download_trackers(&self) -> Result<Vec<DownloadTracker>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM download_trackers ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(download_from_row).collect()
    }

    pub async fn downloads_for_group(
        &self,
        group_key: &str,
    ) -> Result<Vec<DownloadTracker>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM download_trackers
             WHERE group_key = ?1 ORDER BY id ASC"
        ))
        .bind(group_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(download_from_row).collect()
    }

    pub async fn download_for_file(
        &self,
        file_uuid: Uuid,
    ) -> Result<Option<DownloadTracker>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM download_trackers WHERE file_uuid = ?1"
        ))
        .bind(file_uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(download_from_row(&row)?))
    }

    pub async fn set_download_status(
        &self,
        id: i64,
        status: TrackerStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE download_trackers SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_download_result(
        &self,
        id: i64,
        local_path: Option<&str>,
        app_meta_data: Option<&str>,
        app_meta_data_version: Option<i64>,
        delivered: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE download_trackers SET
                status = 'done',
                local_path = ?1,
                app_meta_data = ?2,
                app_meta_data_version = ?3,
                delivered = ?4
             WHERE id = ?5",
        )
        .bind(local_path)
        .bind(app_meta_data)
        .bind(app_meta_data_version)
        .bind(if delivered { 1 } else { 0 })
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_download_gone(&self, id: i64, reason: GoneReason) -> Result<(), StoreError> {
        sqlx::query("UPDATE download_trackers SET status = 'done', gone_reason = ?1 WHERE id = ?2")
            .bind(reason.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops all download state. Used when the server reports a newer master
    /// version and the index has to be re-fetched.
    pub async fn clear_download_state(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM download_trackers")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM download_groups")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_group(&self, group_key: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM download_trackers WHERE group_key = ?1")
            .bind(group_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM download_groups WHERE group_key = ?1")
            .bind(group_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Inserts the group if it is not yet tracked. An existing row keeps its
    /// status.
    pub async fn ensure_group(&self, group: &DownloadGroup) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO download_groups (
                group_key, sharing_group_uuid, file_group_uuid, status
            )
            VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&group.group_key)
        .bind(group.sharing_group_uuid.to_string())
        .bind(group.file_group_uuid.map(|uuid| uuid.to_string()))
        .bind(group.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn download_groups(&self) -> Result<Vec<DownloadGroup>, StoreError> {
        let rows = sqlx::query(
            "SELECT group_key, sharing_group_uuid, file_group_uuid, status
             FROM download_groups ORDER BY group_key ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(group_from_row).collect()
    }

    pub async fn set_group_status(
        &self,
        group_key: &str,
        status: GroupStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE download_groups SET status = ?1 WHERE group_key = ?2")
            .bind(status.as_str())
            .bind(group_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_sharing_entry(&self, entry: &SharingEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sharing_entries (
                sharing_group_uuid,
                name,
                permission,
                master_version,
                sync_needed,
                removed_from_group
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(sharing_group_uuid) DO UPDATE SET
                name = excluded.name,
                permission = excluded.permission,
                master_version = excluded.master_version,
                sync_needed = excluded.sync_needed,
                removed_from_group = excluded.removed_from_group;",
        )
        .bind(entry.sharing_group_uuid.to_string())
        .bind(&entry.name)
        .bind(permission_as_str(entry.permission))
        .bind(entry.master_version)
        .bind(if entry.sync_needed { 1 } else { 0 })
        .bind(if entry.removed_from_group { 1 } else { 0 })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_sharing_entry(
        &self,
        sharing_group: Uuid,
    ) -> Result<Option<SharingEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT sharing_group_uuid, name, permission, master_version, sync_needed,
                    removed_from_group
             FROM sharing_entries WHERE sharing_group_uuid = ?1",
        )
        .bind(sharing_group.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(sharing_from_row(&row)?))
    }

    pub async fn sharing_entries(&self) -> Result<Vec<SharingEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT sharing_group_uuid, name, permission, master_version, sync_needed,
                    removed_from_group
             FROM sharing_entries ORDER BY sharing_group_uuid ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sharing_from_row).collect()
    }

    pub async fn set_master_version(
        &self,
        sharing_group: Uuid,
        master_version: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sharing_entries SET master_version = ?1 WHERE sharing_group_uuid = ?2",
        )
        .bind(master_version)
        .bind(sharing_group.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_sync_needed(
        &self,
        sharing_group: Uuid,
        sync_needed: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sharing_entries SET sync_needed = ?1 WHERE sharing_group_uuid = ?2")
            .bind(if sync_needed { 1 } else { 0 })
            .bind(sharing_group.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_removed_from_group(&self, sharing_group: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sharing_entries SET removed_from_group = 1 WHERE sharing_group_uuid = ?1",
        )
        .bind(sharing_group.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drops in-progress marks left behind by an interrupted pass.
    pub async fn reset_interrupted(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE upload_trackers SET status = 'not_started' WHERE status = 'in_progress'",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE download_trackers SET status = 'not_started' WHERE status = 'in_progress'",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear_tracking(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM upload_trackers")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM download_trackers")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM download_groups")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.clear_tracking().await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM directory_entries")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sharing_entries")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
