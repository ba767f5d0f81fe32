use std::collections::HashSet;
use std::path::Path;

use super::{make_store, server_file, uuid};
use crate::sync::directory::LocalDirectory;
use crate::sync::error::SyncError;
use crate::sync::events::SyncAttributes;
use crate::sync::store::{DirectoryEntry, DownloadTracker, TrackerOperation, TrackerStatus};
use crate::sync::trackers::TrackerQueue;

use sharebox_api::GoneReason;

fn attributes(file: u128, group: u128) -> SyncAttributes {
    SyncAttributes {
        file_uuid: uuid(file),
        sharing_group_uuid: uuid(group),
        file_group_uuid: None,
        mime_type: "text/plain".into(),
        app_meta_data: None,
    }
}

fn done_tracker(file: u128, group: u128, version: i64) -> DownloadTracker {
    DownloadTracker {
        id: 0,
        file_uuid: uuid(file),
        sharing_group_uuid: uuid(group),
        file_group_uuid: None,
        group_key: format!("file-{}", uuid(file)),
        operation: TrackerOperation::File,
        status: TrackerStatus::Done,
        file_version: version,
        app_meta_data_version: None,
        mime_type: "text/plain".into(),
        local_path: Some("/tmp/staged".into()),
        app_meta_data: None,
        gone_reason: None,
        delivered: true,
    }
}

#[tokio::test]
async fn diff_queues_unknown_live_file_for_download() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());

    let set = directory
        .diff(&[server_file(uuid(1), uuid(9), 0)])
        .await
        .unwrap();

    assert_eq!(set.content.len(), 1);
    assert!(set.deletions.is_empty());
    assert!(set.app_meta_data.is_empty());
}

#[tokio::test]
async fn diff_tombstones_unknown_deleted_file_without_queuing_work() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());
    let mut file = server_file(uuid(1), uuid(9), 2);
    file.deleted = true;

    let set = directory.diff(&[file]).await.unwrap();

    assert!(set.is_empty());
    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert!(entry.deleted_locally && entry.deleted_on_server);
    assert_eq!(entry.file_version, Some(2));

    // a later index with the same deleted file stays a no-op
    let mut file = server_file(uuid(1), uuid(9), 2);
    file.deleted = true;
    let set = directory.diff(&[file]).await.unwrap();
    assert!(set.is_empty());
}

#[tokio::test]
async fn diff_matches_versions_and_spots_changes() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.mime_type = Some("text/plain".into());
    entry.file_version = Some(1);
    store.upsert_entry(&entry).await.unwrap();

    let same = directory
        .diff(&[server_file(uuid(1), uuid(9), 1)])
        .await
        .unwrap();
    assert!(same.is_empty());

    let changed = directory
        .diff(&[server_file(uuid(1), uuid(9), 2)])
        .await
        .unwrap();
    assert_eq!(changed.content.len(), 1);
}

#[tokio::test]
async fn diff_queues_metadata_only_download_for_meta_bump() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.mime_type = Some("text/plain".into());
    entry.file_version = Some(1);
    store.upsert_entry(&entry).await.unwrap();

    let mut file = server_file(uuid(1), uuid(9), 1);
    file.app_meta_data_version = Some(0);
    let set = directory.diff(&[file]).await.unwrap();

    assert!(set.content.is_empty());
    assert_eq!(set.app_meta_data.len(), 1);
}

#[tokio::test]
async fn diff_resurrects_tombstone_the_server_undeleted() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.file_version = Some(1);
    entry.deleted_locally = true;
    entry.deleted_on_server = true;
    store.upsert_entry(&entry).await.unwrap();

    let set = directory
        .diff(&[server_file(uuid(1), uuid(9), 2)])
        .await
        .unwrap();

    assert_eq!(set.content.len(), 1);
}

#[tokio::test]
async fn diff_suppresses_repeat_deletion_while_undelete_is_in_flight() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.file_version = Some(1);
    entry.deleted_on_server = true;
    store.upsert_entry(&entry).await.unwrap();

    let mut file = server_file(uuid(1), uuid(9), 1);
    file.deleted = true;
    let set = directory.diff(&[file]).await.unwrap();

    assert!(set.deletions.is_empty());
}

#[tokio::test]
async fn diff_skips_gone_files() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.file_version = Some(0);
    entry.gone_reason = Some(GoneReason::CloudFileRenamedOrRemoved);
    store.upsert_entry(&entry).await.unwrap();

    let set = directory
        .diff(&[server_file(uuid(1), uuid(9), 3)])
        .await
        .unwrap();

    assert!(set.is_empty());
}

#[tokio::test]
async fn diff_backfills_file_group_and_mime_type() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.file_version = Some(1);
    store.upsert_entry(&entry).await.unwrap();

    let mut file = server_file(uuid(1), uuid(9), 1);
    file.file_group_uuid = Some(uuid(5));
    directory.diff(&[file]).await.unwrap();

    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.file_group_uuid, Some(uuid(5)));
    assert_eq!(entry.mime_type.as_deref(), Some("text/plain"));
}

#[tokio::test]
async fn apply_downloads_records_versions_and_clears_deletion_marks() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.mime_type = Some("text/plain".into());
    entry.deleted_locally = true;
    entry.deleted_on_server = true;
    store.upsert_entry(&entry).await.unwrap();

    directory
        .apply_downloads(&[done_tracker(1, 9, 4)])
        .await
        .unwrap();

    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.file_version, Some(4));
    assert!(!entry.deleted_locally && !entry.deleted_on_server);
}

#[tokio::test]
async fn apply_downloads_rejects_mime_type_change() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.mime_type = Some("image/jpeg".into());
    store.upsert_entry(&entry).await.unwrap();

    let result = directory.apply_downloads(&[done_tracker(1, 9, 0)]).await;

    assert!(matches!(result, Err(SyncError::MimeTypeMismatch { .. })));
}

#[tokio::test]
async fn apply_download_deletions_keeps_limbo_half_deleted() {
    let store = make_store().await;
    let directory = LocalDirectory::new(store.clone());
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.file_version = Some(1);
    store.upsert_entry(&entry).await.unwrap();
    let mut other = DirectoryEntry::new(uuid(2), uuid(9));
    other.file_version = Some(1);
    store.upsert_entry(&other).await.unwrap();

    let mut deletion = done_tracker(1, 9, 1);
    deletion.operation = TrackerOperation::Deletion;
    let mut plain = done_tracker(2, 9, 1);
    plain.operation = TrackerOperation::Deletion;
    let undelete_in_flight: HashSet<_> = [uuid(1)].into_iter().collect();

    directory
        .apply_download_deletions(&[deletion, plain], &undelete_in_flight)
        .await
        .unwrap();

    let limbo = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert!(limbo.deleted_on_server && !limbo.deleted_locally);
    let full = store.get_entry(uuid(2)).await.unwrap().unwrap();
    assert!(full.deleted_on_server && full.deleted_locally);
}

#[tokio::test]
async fn enqueue_upload_registers_entry_and_pending_tracker() {
    let store = make_store().await;
    let queue = TrackerQueue::open(store.clone()).await.unwrap();

    queue
        .enqueue_upload(Path::new("/tmp/a.txt"), &attributes(1, 9))
        .await
        .unwrap();

    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.mime_type.as_deref(), Some("text/plain"));
    assert_eq!(entry.file_version, None);

    let pending = store.pending_uploads().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, TrackerOperation::File);
    assert_eq!(pending[0].local_path.as_deref(), Some("/tmp/a.txt"));
}

#[tokio::test]
async fn re_enqueue_replaces_the_pending_tracker() {
    let store = make_store().await;
    let queue = TrackerQueue::open(store.clone()).await.unwrap();

    queue
        .enqueue_upload(Path::new("/tmp/a.txt"), &attributes(1, 9))
        .await
        .unwrap();
    queue
        .enqueue_upload(Path::new("/tmp/b.txt"), &attributes(1, 9))
        .await
        .unwrap();

    let pending = store.pending_uploads().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].local_path.as_deref(), Some("/tmp/b.txt"));
}

#[tokio::test]
async fn enqueue_upload_rejects_mime_type_change() {
    let store = make_store().await;
    let queue = TrackerQueue::open(store.clone()).await.unwrap();
    queue
        .enqueue_upload(Path::new("/tmp/a.txt"), &attributes(1, 9))
        .await
        .unwrap();

    let mut attr = attributes(1, 9);
    attr.mime_type = "image/jpeg".into();
    let result = queue.enqueue_upload(Path::new("/tmp/a.jpg"), &attr).await;

    assert!(matches!(result, Err(SyncError::MimeTypeChanged(_))));
}

#[tokio::test]
async fn enqueue_upload_rejects_file_queued_for_deletion() {
    let store = make_store().await;
    let queue = TrackerQueue::open(store.clone()).await.unwrap();
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.mime_type = Some("text/plain".into());
    entry.file_version = Some(0);
    store.upsert_entry(&entry).await.unwrap();
    queue.enqueue_deletion(uuid(1)).await.unwrap();

    let result = queue
        .enqueue_upload(Path::new("/tmp/a.txt"), &attributes(1, 9))
        .await;

    assert!(matches!(result, Err(SyncError::FileQueuedForDeletion(_))));
}

#[tokio::test]
async fn deleting_unknown_file_fails() {
    let store = make_store().await;
    let queue = TrackerQueue::open(store.clone()).await.unwrap();

    let result = queue.enqueue_deletion(uuid(1)).await;

    assert!(matches!(result, Err(SyncError::DeletingUnknownFile(_))));
}

#[tokio::test]
async fn deleting_never_uploaded_file_stays_local() {
    let store = make_store().await;
    let queue = TrackerQueue::open(store.clone()).await.unwrap();
    queue
        .enqueue_upload(Path::new("/tmp/a.txt"), &attributes(1, 9))
        .await
        .unwrap();

    queue.enqueue_deletion(uuid(1)).await.unwrap();

    // no server traffic needed: no deletion tracker, pending upload dropped
    assert!(store.uploads_for_file(uuid(1)).await.unwrap().is_empty());
    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert!(entry.deleted_locally && entry.deleted_on_server);
}

#[tokio::test]
async fn deletion_batch_fails_as_a_unit() {
    let store = make_store().await;
    let queue = TrackerQueue::open(store.clone()).await.unwrap();
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.file_version = Some(0);
    store.upsert_entry(&entry).await.unwrap();

    let result = queue.enqueue_deletions(&[uuid(1), uuid(2)]).await;

    assert!(matches!(result, Err(SyncError::DeletingUnknownFile(_))));
    // the known file keeps its state; nothing was queued
    assert!(store.uploads_for_file(uuid(1)).await.unwrap().is_empty());
    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert!(!entry.deleted_locally);
}

#[tokio::test]
async fn double_deletion_is_rejected() {
    let store = make_store().await;
    let queue = TrackerQueue::open(store.clone()).await.unwrap();
    let mut entry = DirectoryEntry::new(uuid(1), uuid(9));
    entry.file_version = Some(0);
    store.upsert_entry(&entry).await.unwrap();

    queue.enqueue_deletion(uuid(1)).await.unwrap();
    let again = queue.enqueue_deletion(uuid(1)).await;

    assert!(matches!(again, Err(SyncError::FileQueuedForDeletion(_))));
}

#[tokio::test]
async fn age_counter_reseeds_from_the_store() {
    let store = make_store().await;
    {
        let queue = TrackerQueue::open(store.clone()).await.unwrap();
        queue
            .enqueue_upload(Path::new("/tmp/a.txt"), &attributes(1, 9))
            .await
            .unwrap();
        queue
            .enqueue_upload(Path::new("/tmp/b.txt"), &attributes(2, 9))
            .await
            .unwrap();
    }

    let reopened = TrackerQueue::open(store.clone()).await.unwrap();
    reopened
        .enqueue_upload(Path::new("/tmp/c.txt"), &attributes(3, 9))
        .await
        .unwrap();

    let pending = store.pending_uploads().await.unwrap();
    let ages: Vec<i64> = pending.iter().map(|upload| upload.age).collect();
    assert_eq!(ages, vec![0, 1, 2]);
}

#[tokio::test]
async fn sharing_group_update_requires_known_group() {
    let store = make_store().await;
    let queue = TrackerQueue::open(store.clone()).await.unwrap();

    let result = queue.enqueue_sharing_group_update(uuid(9), "Renamed").await;

    assert!(matches!(result, Err(SyncError::UnknownSharingGroup(_))));
}
