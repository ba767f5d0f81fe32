use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::{make_store, uuid};
use crate::sync::conflict::{
    AcceptRemote, ConflictDelegate, ContentDownloadResolution, ContentUploadResolution,
    DownloadDeletionResolution, SyncConflict, UploadResolution,
};
use crate::sync::events::{SyncAttributes, SyncEvent};
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::store::{DirectoryEntry, SyncStore};

use sharebox_api::{GoneReason, ShareboxClient};

/// Rejects incoming server content, keeping all queued local changes.
struct KeepLocal;

impl ConflictDelegate for KeepLocal {
    fn content_download_conflict(
        &self,
        _attr: &SyncAttributes,
        conflict: &SyncConflict<ContentDownloadResolution>,
    ) {
        conflict
            .resolve(ContentDownloadResolution::RejectContentDownload(
                UploadResolution::KEEP_ALL,
            ))
            .unwrap();
    }

    fn download_deletion_conflict(
        &self,
        _attr: &SyncAttributes,
        conflict: &SyncConflict<DownloadDeletionResolution>,
    ) {
        conflict
            .resolve(DownloadDeletionResolution::RejectDownloadDeletion(
                ContentUploadResolution::KeepContentUpload,
            ))
            .unwrap();
    }
}

async fn make_orchestrator(
    server: &MockServer,
    staging: &Path,
    delegate: Arc<dyn ConflictDelegate>,
) -> (
    Arc<SyncOrchestrator>,
    SyncStore,
    UnboundedReceiver<SyncEvent>,
) {
    let client = ShareboxClient::new(&server.uri(), "test-token").unwrap();
    let store = make_store().await;
    let (orchestrator, events) =
        SyncOrchestrator::bootstrap(client, store.clone(), staging.to_path_buf(), delegate)
            .await
            .unwrap();
    (orchestrator, store, events)
}

fn drain(events: &mut UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn file_json(file: Uuid, group: Uuid, version: i64, deleted: bool) -> serde_json::Value {
    json!({
        "fileUuid": file,
        "sharingGroupUuid": group,
        "mimeType": "text/plain",
        "fileVersion": version,
        "deleted": deleted
    })
}

fn group_index_body(group: Uuid, master_version: i64, files: Vec<serde_json::Value>) -> serde_json::Value {
    json!({
        "sharingGroups": [
            { "sharingGroupUuid": group, "permission": "write" }
        ],
        "masterVersion": master_version,
        "files": files
    })
}

/// Mounts the group-specific index (query-matched, so it must go first) and
/// the membership index behind it.
async fn mount_index(server: &MockServer, group: Uuid, master_version: i64, files: Vec<serde_json::Value>) {
    Mock::given(method("GET"))
        .and(path("/v1/index"))
        .and(query_param("sharingGroupId", group.to_string()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(group_index_body(group, master_version, files)),
        )
        .mount(server)
        .await;
    mount_membership_index(server, group).await;
}

async fn mount_membership_index(server: &MockServer, group: Uuid) {
    Mock::given(method("GET"))
        .and(path("/v1/index"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sharingGroups": [
                { "sharingGroupUuid": group, "permission": "write" }
            ]
        })))
        .mount(server)
        .await;
}

fn text_attr(file: u128, group: Uuid) -> SyncAttributes {
    SyncAttributes {
        file_uuid: uuid(file),
        sharing_group_uuid: group,
        file_group_uuid: None,
        mime_type: "text/plain".into(),
        app_meta_data: None,
    }
}

#[tokio::test]
async fn download_pass_applies_content_and_hands_over_the_group() {
    let server = MockServer::start().await;
    let group = uuid(9);
    mount_index(
        &server,
        group,
        5,
        vec![file_json(uuid(1), group, 0, false)],
    )
    .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .and(query_param("fileVersion", "0"))
        .and(query_param("masterVersion", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"hello".to_vec(), "text/plain"))
        .expect(1)
        .mount(&server)
        .await;

    let staging = tempdir().unwrap();
    let (orchestrator, store, mut events) =
        make_orchestrator(&server, staging.path(), Arc::new(AcceptRemote)).await;

    orchestrator.sync_and_wait().await.unwrap();

    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.file_version, Some(0));
    assert_eq!(entry.mime_type.as_deref(), Some("text/plain"));

    let sharing = store.get_sharing_entry(group).await.unwrap().unwrap();
    assert_eq!(sharing.master_version, 5);
    assert!(!sharing.sync_needed);

    assert!(store.download_trackers().await.unwrap().is_empty());
    assert!(store.download_groups().await.unwrap().is_empty());

    let drained = drain(&mut events);
    let downloaded = drained
        .iter()
        .find_map(|event| match event {
            SyncEvent::FileGroupDownloadComplete { group } => Some(group),
            _ => None,
        })
        .expect("group handed over");
    assert_eq!(downloaded.files.len(), 1);
    let staged = downloaded.files[0].local_path.as_ref().unwrap();
    assert_eq!(std::fs::read(staged).unwrap(), b"hello");
    assert!(matches!(drained.last(), Some(SyncEvent::SyncDone)));

    // nothing changed, so a second pass transfers nothing (the download
    // mock's expectation of one hit verifies this)
    orchestrator.sync_and_wait().await.unwrap();
    assert!(store.download_trackers().await.unwrap().is_empty());
}

#[tokio::test]
async fn master_version_conflict_on_download_adopts_and_retries() {
    let server = MockServer::start().await;
    let group = uuid(9);
    // stale index first, refreshed one behind it
    Mock::given(method("GET"))
        .and(path("/v1/index"))
        .and(query_param("sharingGroupId", group.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(group_index_body(
            group,
            5,
            vec![file_json(uuid(1), group, 1, false)],
        )))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/index"))
        .and(query_param("sharingGroupId", group.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(group_index_body(
            group,
            6,
            vec![file_json(uuid(1), group, 1, false)],
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .and(query_param("masterVersion", "5"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "masterVersion": 6 })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .and(query_param("masterVersion", "6"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"fresh".to_vec(), "text/plain"))
        .mount(&server)
        .await;
    mount_membership_index(&server, group).await;

    let staging = tempdir().unwrap();
    let (orchestrator, store, _events) =
        make_orchestrator(&server, staging.path(), Arc::new(AcceptRemote)).await;

    orchestrator.sync_and_wait().await.unwrap();

    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.file_version, Some(1));
    let sharing = store.get_sharing_entry(group).await.unwrap().unwrap();
    assert_eq!(sharing.master_version, 6);
}

#[tokio::test]
async fn upload_pass_commits_and_bumps_the_master_version() {
    let server = MockServer::start().await;
    let group = uuid(9);
    mount_index(&server, group, 3, vec![]).await;
    Mock::given(method("PUT"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .and(query_param("fileVersion", "0"))
        .and(query_param("masterVersion", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/uploads/commit"))
        .and(query_param("masterVersion", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "numberTransferred": 1 })))
        .mount(&server)
        .await;

    let staging = tempdir().unwrap();
    let payload = staging.path().join("a.txt");
    std::fs::write(&payload, b"hi").unwrap();
    let (orchestrator, store, mut events) =
        make_orchestrator(&server, staging.path(), Arc::new(AcceptRemote)).await;

    orchestrator
        .enqueue_upload(&payload, &text_attr(1, group))
        .await
        .unwrap();
    orchestrator.sync_and_wait().await.unwrap();

    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.file_version, Some(0));
    let sharing = store.get_sharing_entry(group).await.unwrap().unwrap();
    assert_eq!(sharing.master_version, 4);
    assert!(store.queued_uploads().await.unwrap().is_empty());

    let drained = drain(&mut events);
    assert!(drained
        .iter()
        .any(|event| matches!(event, SyncEvent::SingleFileUploadComplete { .. })));
    assert!(drained
        .iter()
        .any(|event| matches!(event, SyncEvent::ContentUploadsCompleted { count: 1 })));
}

#[tokio::test]
async fn upload_conflict_resubmits_against_the_new_master_version() {
    let server = MockServer::start().await;
    let group = uuid(9);
    Mock::given(method("GET"))
        .and(path("/v1/index"))
        .and(query_param("sharingGroupId", group.to_string()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(group_index_body(group, 3, vec![])),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/index"))
        .and(query_param("sharingGroupId", group.to_string()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(group_index_body(group, 9, vec![])),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .and(query_param("masterVersion", "3"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "masterVersion": 9 })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .and(query_param("masterVersion", "9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/uploads/commit"))
        .and(query_param("masterVersion", "9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "numberTransferred": 1 })))
        .mount(&server)
        .await;
    mount_membership_index(&server, group).await;

    let staging = tempdir().unwrap();
    let payload = staging.path().join("a.txt");
    std::fs::write(&payload, b"hi").unwrap();
    let (orchestrator, store, _events) =
        make_orchestrator(&server, staging.path(), Arc::new(AcceptRemote)).await;

    orchestrator
        .enqueue_upload(&payload, &text_attr(1, group))
        .await
        .unwrap();
    orchestrator.sync_and_wait().await.unwrap();

    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.file_version, Some(0));
    let sharing = store.get_sharing_entry(group).await.unwrap().unwrap();
    assert_eq!(sharing.master_version, 10);
}

#[tokio::test]
async fn server_deletion_is_applied_and_announced() {
    let server = MockServer::start().await;
    let group = uuid(9);
    mount_index(
        &server,
        group,
        2,
        vec![file_json(uuid(1), group, 0, true)],
    )
    .await;

    let staging = tempdir().unwrap();
    let (orchestrator, store, mut events) =
        make_orchestrator(&server, staging.path(), Arc::new(AcceptRemote)).await;
    let mut entry = DirectoryEntry::new(uuid(1), group);
    entry.mime_type = Some("text/plain".into());
    entry.file_version = Some(0);
    store.upsert_entry(&entry).await.unwrap();

    orchestrator.sync_and_wait().await.unwrap();

    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert!(entry.deleted_locally && entry.deleted_on_server);

    let drained = drain(&mut events);
    let deleted = drained
        .iter()
        .find_map(|event| match event {
            SyncEvent::DownloadDeletions { files } => Some(files),
            _ => None,
        })
        .expect("deletion announced");
    assert_eq!(deleted[0].file_uuid, uuid(1));
}

#[tokio::test]
async fn rejected_deletion_turns_the_queued_upload_into_an_undeletion() {
    let server = MockServer::start().await;
    let group = uuid(9);
    mount_index(
        &server,
        group,
        2,
        vec![file_json(uuid(1), group, 0, true)],
    )
    .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .and(query_param("fileVersion", "1"))
        .and(query_param("masterVersion", "2"))
        .and(query_param("undelete", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/uploads/commit"))
        .and(query_param("masterVersion", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "numberTransferred": 1 })))
        .mount(&server)
        .await;

    let staging = tempdir().unwrap();
    let payload = staging.path().join("a.txt");
    std::fs::write(&payload, b"mine").unwrap();
    let (orchestrator, store, mut events) =
        make_orchestrator(&server, staging.path(), Arc::new(KeepLocal)).await;
    let mut entry = DirectoryEntry::new(uuid(1), group);
    entry.mime_type = Some("text/plain".into());
    entry.file_version = Some(0);
    store.upsert_entry(&entry).await.unwrap();

    orchestrator
        .enqueue_upload(&payload, &text_attr(1, group))
        .await
        .unwrap();
    orchestrator.sync_and_wait().await.unwrap();

    // the local copy won: version moved forward and the file is live again
    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.file_version, Some(1));
    assert!(!entry.deleted_locally && !entry.deleted_on_server);

    let drained = drain(&mut events);
    assert!(!drained
        .iter()
        .any(|event| matches!(event, SyncEvent::DownloadDeletions { .. })));
}

#[tokio::test]
async fn accepted_content_download_drops_the_queued_upload() {
    let server = MockServer::start().await;
    let group = uuid(9);
    mount_index(
        &server,
        group,
        4,
        vec![file_json(uuid(1), group, 1, false)],
    )
    .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .and(query_param("fileVersion", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"server".to_vec(), "text/plain"))
        .mount(&server)
        .await;

    let staging = tempdir().unwrap();
    let payload = staging.path().join("a.txt");
    std::fs::write(&payload, b"mine").unwrap();
    let (orchestrator, store, _events) =
        make_orchestrator(&server, staging.path(), Arc::new(AcceptRemote)).await;
    let mut entry = DirectoryEntry::new(uuid(1), group);
    entry.mime_type = Some("text/plain".into());
    entry.file_version = Some(0);
    store.upsert_entry(&entry).await.unwrap();

    orchestrator
        .enqueue_upload(&payload, &text_attr(1, group))
        .await
        .unwrap();
    orchestrator.sync_and_wait().await.unwrap();

    // server content won: no upload left, version follows the server
    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.file_version, Some(1));
    assert!(store.uploads_for_file(uuid(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_content_download_keeps_the_upload_and_withholds_the_payload() {
    let server = MockServer::start().await;
    let group = uuid(9);
    mount_index(
        &server,
        group,
        4,
        vec![file_json(uuid(1), group, 1, false)],
    )
    .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .and(query_param("fileVersion", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"server".to_vec(), "text/plain"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .and(query_param("fileVersion", "2"))
        .and(query_param("masterVersion", "4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/uploads/commit"))
        .and(query_param("masterVersion", "4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "numberTransferred": 1 })))
        .mount(&server)
        .await;

    let staging = tempdir().unwrap();
    let payload = staging.path().join("a.txt");
    std::fs::write(&payload, b"mine").unwrap();
    let (orchestrator, store, mut events) =
        make_orchestrator(&server, staging.path(), Arc::new(KeepLocal)).await;
    let mut entry = DirectoryEntry::new(uuid(1), group);
    entry.mime_type = Some("text/plain".into());
    entry.file_version = Some(0);
    store.upsert_entry(&entry).await.unwrap();

    orchestrator
        .enqueue_upload(&payload, &text_attr(1, group))
        .await
        .unwrap();
    orchestrator.sync_and_wait().await.unwrap();

    // server version was recorded, then the kept upload moved past it
    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.file_version, Some(2));

    // the rejected payload was never staged
    assert!(!staging.path().join(format!("{}-v1", uuid(1))).exists());

    let drained = drain(&mut events);
    let downloaded = drained
        .iter()
        .find_map(|event| match event {
            SyncEvent::FileGroupDownloadComplete { group } => Some(group),
            _ => None,
        })
        .expect("group handed over");
    assert!(downloaded.files[0].local_path.is_none());
}

#[tokio::test]
async fn gone_file_is_terminal_until_retried() {
    let server = MockServer::start().await;
    let group = uuid(9);
    mount_index(
        &server,
        group,
        1,
        vec![file_json(uuid(1), group, 0, false)],
    )
    .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .respond_with(
            ResponseTemplate::new(410).set_body_json(json!({ "goneReason": "ownerRemoved" })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/files/{}", uuid(1))))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"back".to_vec(), "text/plain"))
        .mount(&server)
        .await;

    let staging = tempdir().unwrap();
    let (orchestrator, store, mut events) =
        make_orchestrator(&server, staging.path(), Arc::new(AcceptRemote)).await;

    orchestrator.sync_and_wait().await.unwrap();

    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.gone_reason, Some(GoneReason::OwnerRemoved));
    assert_eq!(entry.file_version, None);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, SyncEvent::FileGroupDownloadGone { .. })));

    // the gone file stays out of the next pass entirely
    orchestrator.sync_and_wait().await.unwrap();
    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.file_version, None);

    // an explicit retry clears the mark and the download goes through
    orchestrator.retry_gone(uuid(1)).await.unwrap();
    orchestrator.sync_and_wait().await.unwrap();
    let entry = store.get_entry(uuid(1)).await.unwrap().unwrap();
    assert_eq!(entry.gone_reason, None);
    assert_eq!(entry.file_version, Some(0));
}
