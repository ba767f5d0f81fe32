use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use sharebox_api::{
    AppMetaDataOutcome, CommitOutcome, DownloadFileOutcome, GoneReason, ShareboxClient,
    SharingGroupInfo, UpdateSharingGroupOutcome, UploadDeletionOutcome, UploadFileOutcome,
    UploadFileRequest,
};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use super::conflict::{
    ConflictDelegate, ContentDownloadResolution, ContentUploadResolution,
    DownloadDeletionResolution, SyncConflict, classify_pending,
};
use super::consistency::{ConsistencyChecker, ConsistencyReport, LocalConsistencyReport};
use super::directory::LocalDirectory;
use super::error::SyncError;
use super::events::{DownloadedGroup, DownloadedGroupFile, EventSender, SyncAttributes, SyncEvent};
use super::groups::ContentGroupCoordinator;
use super::store::{
    DirectoryEntry, DownloadGroup, DownloadTracker, GroupStatus, SharingEntry, SyncStore,
    TrackerOperation, TrackerStatus, UploadTracker,
};
use super::trackers::TrackerQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassState {
    Idle,
    Running,
    /// A sync was requested mid-pass; another pass follows the current one.
    DelayedPending,
    Stopping,
}

enum PassStart {
    Fresh,
    /// A pass is already running; this request folds into its follow-up.
    Coalesced,
    /// The engine is stopping; the request is dropped.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Drop trackers and content groups, keep the directory.
    Tracking,
    /// Drop everything the engine knows.
    All,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingStats {
    pub content_downloads: usize,
    pub download_deletions: usize,
    pub queued_uploads: usize,
    pub pending_uploads: usize,
}

enum GroupOutcome {
    Done,
    MasterVersionConflict(i64),
}

enum BatchOutcome {
    Committed,
    MasterVersionConflict(i64),
}

enum UploadStep {
    Done,
    /// The tracker was dropped, e.g. because the file is gone server-side.
    Removed,
    Conflict(i64),
}

/// Drives sync passes: index fetch, diff, atomic group downloads, conflict
/// mediation, then draining the head upload batch and committing it.
///
/// Passes are strictly sequential. Requests arriving while a pass runs
/// coalesce into a single follow-up pass.
pub struct SyncOrchestrator {
    api: ShareboxClient,
    store: SyncStore,
    directory: LocalDirectory,
    queue: TrackerQueue,
    groups: ContentGroupCoordinator,
    checker: ConsistencyChecker,
    delegate: Arc<dyn ConflictDelegate>,
    events: EventSender,
    pass: Mutex<PassState>,
    staging_root: PathBuf,
}

impl SyncOrchestrator {
    pub async fn bootstrap(
        api: ShareboxClient,
        store: SyncStore,
        staging_root: PathBuf,
        delegate: Arc<dyn ConflictDelegate>,
    ) -> Result<(Arc<Self>, UnboundedReceiver<SyncEvent>), SyncError> {
        tokio::fs::create_dir_all(&staging_root).await?;
        store.reset_interrupted().await?;
        let queue = TrackerQueue::open(store.clone()).await?;
        let (events, receiver) = EventSender::channel();
        let orchestrator = Arc::new(Self {
            directory: LocalDirectory::new(store.clone()),
            groups: ContentGroupCoordinator::new(store.clone()),
            checker: ConsistencyChecker::new(api.clone(), store.clone()),
            api,
            store,
            queue,
            delegate,
            events,
            pass: Mutex::new(PassState::Idle),
            staging_root,
        });
        Ok((orchestrator, receiver))
    }

    pub async fn enqueue_upload(
        &self,
        local_file: &Path,
        attr: &SyncAttributes,
    ) -> Result<(), SyncError> {
        self.queue.enqueue_upload(local_file, attr).await?;
        self.store
            .set_sync_needed(attr.sharing_group_uuid, true)
            .await?;
        Ok(())
    }

    pub async fn enqueue_app_meta_data_upload(
        &self,
        attr: &SyncAttributes,
    ) -> Result<(), SyncError> {
        self.queue.enqueue_app_meta_data_upload(attr).await?;
        self.store
            .set_sync_needed(attr.sharing_group_uuid, true)
            .await?;
        Ok(())
    }

    pub async fn enqueue_deletion(&self, file_uuid: Uuid) -> Result<(), SyncError> {
        self.enqueue_deletions(&[file_uuid]).await
    }

    pub async fn enqueue_deletions(&self, file_uuids: &[Uuid]) -> Result<(), SyncError> {
        self.queue.enqueue_deletions(file_uuids).await?;
        for &file_uuid in file_uuids {
            if let Some(entry) = self.store.get_entry(file_uuid).await? {
                self.store
                    .set_sync_needed(entry.sharing_group_uuid, true)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn enqueue_sharing_group_update(
        &self,
        sharing_group: Uuid,
        new_name: &str,
    ) -> Result<(), SyncError> {
        self.queue
            .enqueue_sharing_group_update(sharing_group, new_name)
            .await?;
        self.store.set_sync_needed(sharing_group, true).await?;
        Ok(())
    }

    /// Clears a file's terminal gone state so the next pass retries it.
    pub async fn retry_gone(&self, file_uuid: Uuid) -> Result<(), SyncError> {
        let mut entry = self
            .store
            .get_entry(file_uuid)
            .await?
            .ok_or(SyncError::UnknownFile(file_uuid))?;
        if entry.gone_reason.is_none() {
            return Ok(());
        }
        entry.gone_reason = None;
        self.store.upsert_entry(&entry).await?;
        self.store
            .set_sync_needed(entry.sharing_group_uuid, true)
            .await?;
        Ok(())
    }

    /// Promotes pending uploads to a numbered batch and starts a pass in the
    /// background. A request landing mid-pass coalesces into one follow-up;
    /// a request landing while the engine is stopping is ignored.
    pub async fn request_sync(self: &Arc<Self>) -> Result<(), SyncError> {
        match self.begin_pass() {
            PassStart::Ignored => return Ok(()),
            PassStart::Coalesced => {
                self.queue.promote().await?;
                self.events.send(SyncEvent::SyncDelayed);
                return Ok(());
            }
            PassStart::Fresh => {}
        }
        self.queue.promote().await?;
        self.events.send(SyncEvent::SyncStarted);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = engine.run_to_idle().await {
                tracing::error!(%error, "sync pass failed");
            }
        });
        Ok(())
    }

    /// Like `request_sync` but runs the pass on the caller's task and
    /// surfaces its error.
    pub async fn sync_and_wait(self: &Arc<Self>) -> Result<(), SyncError> {
        match self.begin_pass() {
            PassStart::Ignored => return Ok(()),
            PassStart::Coalesced => {
                self.queue.promote().await?;
                self.events.send(SyncEvent::SyncDelayed);
                return Ok(());
            }
            PassStart::Fresh => {}
        }
        self.queue.promote().await?;
        self.events.send(SyncEvent::SyncStarted);
        self.run_to_idle().await
    }

    /// Asks the running pass to stop at the next safe boundary. In-flight
    /// transfers finish first.
    pub fn stop_sync(&self) {
        let mut pass = self.lock_pass();
        if matches!(*pass, PassState::Running | PassState::DelayedPending) {
            *pass = PassState::Stopping;
        }
    }

    /// Previews the download side of the next pass. No trackers or groups
    /// are created, though the diff still tombstones unknown server-deleted
    /// files and backfills sparse directory entries.
    pub async fn stats(&self) -> Result<PendingStats, SyncError> {
        let mut stats = PendingStats::default();
        for sharing in self.store.sharing_entries().await? {
            if sharing.removed_from_group {
                continue;
            }
            let index = self.api.index(Some(sharing.sharing_group_uuid)).await?;
            let files = index.files.ok_or(SyncError::IncompleteIndex)?;
            let set = self.directory.diff(&files).await?;
            stats.content_downloads += set.content.len() + set.app_meta_data.len();
            stats.download_deletions += set.deletions.len();
        }
        stats.queued_uploads = self.store.queued_uploads().await?.len();
        stats.pending_uploads = self.store.pending_uploads().await?.len();
        Ok(stats)
    }

    pub async fn reset(&self, scope: ResetScope) -> Result<(), SyncError> {
        self.ensure_idle()?;
        match scope {
            ResetScope::Tracking => self.store.clear_tracking().await?,
            ResetScope::All => self.store.clear_all().await?,
        }
        Ok(())
    }

    /// Cross-checks server, directory and the client's files. With `repair`,
    /// entries for files the client lost are forgotten and a fresh pass is
    /// requested so they download again.
    pub async fn consistency_check(
        self: &Arc<Self>,
        local_files: &[Uuid],
        repair: bool,
    ) -> Result<ConsistencyReport, SyncError> {
        self.ensure_idle()?;
        let report = self.checker.check(local_files).await?;
        if repair && !report.missing_locally.is_empty() {
            self.checker.repair(&report).await?;
            for sharing in self.store.sharing_entries().await? {
                if !sharing.removed_from_group {
                    self.store
                        .set_sync_needed(sharing.sharing_group_uuid, true)
                        .await?;
                }
            }
            self.request_sync().await?;
        }
        Ok(report)
    }

    pub async fn local_consistency_check(
        &self,
        local_files: &[Uuid],
    ) -> Result<LocalConsistencyReport, SyncError> {
        self.checker.local_check(local_files).await
    }

    fn lock_pass(&self) -> MutexGuard<'_, PassState> {
        self.pass.lock().expect("pass lock poisoned")
    }

    fn begin_pass(&self) -> PassStart {
        let mut pass = self.lock_pass();
        match *pass {
            PassState::Idle => {
                *pass = PassState::Running;
                PassStart::Fresh
            }
            PassState::Running => {
                *pass = PassState::DelayedPending;
                PassStart::Coalesced
            }
            PassState::DelayedPending => PassStart::Coalesced,
            PassState::Stopping => PassStart::Ignored,
        }
    }

    fn stop_requested(&self) -> bool {
        matches!(*self.lock_pass(), PassState::Stopping)
    }

    fn ensure_idle(&self) -> Result<(), SyncError> {
        if matches!(*self.lock_pass(), PassState::Idle) {
            Ok(())
        } else {
            Err(SyncError::SyncIsOperating)
        }
    }

    async fn run_to_idle(self: &Arc<Self>) -> Result<(), SyncError> {
        loop {
            if let Err(error) = self.run_pass().await {
                // Leave trackers resumable and fall back to idle; the next
                // request retries from the store.
                if let Err(reset_error) = self.store.reset_interrupted().await {
                    tracing::warn!(%reset_error, "failed to reset in-flight trackers");
                }
                *self.lock_pass() = PassState::Idle;
                return Err(error);
            }
            let more_work = self.more_work().await?;
            let (again, stopped) = {
                let mut pass = self.lock_pass();
                match *pass {
                    PassState::Stopping => {
                        *pass = PassState::Idle;
                        (false, true)
                    }
                    PassState::DelayedPending => {
                        *pass = PassState::Running;
                        (true, false)
                    }
                    PassState::Running => {
                        if more_work {
                            (true, false)
                        } else {
                            *pass = PassState::Idle;
                            (false, false)
                        }
                    }
                    PassState::Idle => (false, false),
                }
            };
            if again {
                continue;
            }
            if stopped {
                self.events.send(SyncEvent::SyncStopping);
            }
            self.events.send(SyncEvent::SyncDone);
            return Ok(());
        }
    }

    async fn more_work(&self) -> Result<bool, SyncError> {
        for sharing in self.store.sharing_entries().await? {
            if sharing.removed_from_group {
                continue;
            }
            if sharing.sync_needed {
                return Ok(true);
            }
            if self
                .store
                .head_batch_for_group(sharing.sharing_group_uuid)
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn run_pass(&self) -> Result<(), SyncError> {
        let index = self.api.index(None).await?;
        let (created, updated, removed) = self.apply_sharing_groups(&index.sharing_groups).await?;
        self.events.send(SyncEvent::SharingGroupsDownloaded {
            created,
            updated,
            removed,
        });
        for sharing in self.store.sharing_entries().await? {
            if sharing.removed_from_group {
                continue;
            }
            if self.stop_requested() {
                return Ok(());
            }
            self.sync_sharing_group(sharing.sharing_group_uuid).await?;
        }
        Ok(())
    }

    async fn apply_sharing_groups(
        &self,
        infos: &[SharingGroupInfo],
    ) -> Result<(usize, usize, usize), SyncError> {
        let known = self.store.sharing_entries().await?;
        let server: HashSet<Uuid> = infos.iter().map(|info| info.sharing_group_uuid).collect();
        let mut created = 0;
        let mut updated = 0;
        let mut removed = 0;
        for info in infos {
            let existing = known
                .iter()
                .find(|entry| entry.sharing_group_uuid == info.sharing_group_uuid);
            match existing {
                None => created += 1,
                Some(entry) => {
                    updated += 1;
                    if info.deleted && !entry.removed_from_group {
                        removed += 1;
                    }
                }
            }
            self.store
                .upsert_sharing_entry(&SharingEntry {
                    sharing_group_uuid: info.sharing_group_uuid,
                    name: info.name.clone(),
                    permission: info.permission,
                    master_version: existing.map(|entry| entry.master_version).unwrap_or(0),
                    sync_needed: existing.map(|entry| entry.sync_needed).unwrap_or(true),
                    removed_from_group: info.deleted,
                })
                .await?;
        }
        for entry in &known {
            if !server.contains(&entry.sharing_group_uuid) && !entry.removed_from_group {
                removed += 1;
                self.store
                    .mark_removed_from_group(entry.sharing_group_uuid)
                    .await?;
            }
        }
        Ok((created, updated, removed))
    }

    async fn sync_sharing_group(&self, sharing_group: Uuid) -> Result<(), SyncError> {
        'pass: loop {
            if self.stop_requested() {
                return Ok(());
            }
            let index = self.api.index(Some(sharing_group)).await?;
            let master_version = index.master_version.ok_or(SyncError::IncompleteIndex)?;
            let files = index.files.ok_or(SyncError::IncompleteIndex)?;
            self.store
                .set_master_version(sharing_group, master_version)
                .await?;

            let set = self.directory.diff(&files).await?;
            for file in &set.content {
                self.groups.track(file, TrackerOperation::File).await?;
            }
            for file in &set.app_meta_data {
                self.groups.track(file, TrackerOperation::AppMetaData).await?;
            }
            for file in &set.deletions {
                self.groups.track(file, TrackerOperation::Deletion).await?;
            }
            let trackers = self.store.download_trackers().await?;
            if !trackers.is_empty() {
                let deletion_count = trackers
                    .iter()
                    .filter(|tracker| tracker.operation == TrackerOperation::Deletion)
                    .count();
                self.events.send(SyncEvent::WillStartDownloads {
                    content_count: trackers.len() - deletion_count,
                    deletion_count,
                });
            }

            while let Some(group) = self.groups.next_group().await? {
                if self.stop_requested() {
                    return Ok(());
                }
                self.store
                    .set_group_status(&group.group_key, GroupStatus::Downloading)
                    .await?;
                match self.download_group(&group).await? {
                    GroupOutcome::Done => {}
                    GroupOutcome::MasterVersionConflict(new_master) => {
                        self.adopt_master_version(group.sharing_group_uuid, new_master)
                            .await?;
                        continue 'pass;
                    }
                }
            }

            let Some(batch) = self.store.head_batch_for_group(sharing_group).await? else {
                self.store.set_sync_needed(sharing_group, false).await?;
                return Ok(());
            };
            match self.drain_batch(sharing_group, batch).await? {
                BatchOutcome::Committed => {}
                BatchOutcome::MasterVersionConflict(new_master) => {
                    self.store.reset_batch_statuses(batch).await?;
                    self.adopt_master_version(sharing_group, new_master).await?;
                    continue 'pass;
                }
            }
            if self.store.head_batch_for_group(sharing_group).await?.is_some() {
                continue 'pass;
            }
            self.store.set_sync_needed(sharing_group, false).await?;
            return Ok(());
        }
    }

    /// The server moved ahead of us. Adopt its master version and drop all
    /// download tracking; the re-fetched index decides what still applies.
    async fn adopt_master_version(
        &self,
        sharing_group: Uuid,
        new_master: i64,
    ) -> Result<(), SyncError> {
        tracing::info!(%sharing_group, new_master, "master version moved, re-fetching index");
        self.store
            .set_master_version(sharing_group, new_master)
            .await?;
        self.store.clear_download_state().await?;
        Ok(())
    }

    async fn master_version(&self, sharing_group: Uuid) -> Result<i64, SyncError> {
        Ok(self
            .store
            .get_sharing_entry(sharing_group)
            .await?
            .ok_or(SyncError::UnknownSharingGroup(sharing_group))?
            .master_version)
    }

    async fn download_group(&self, group: &DownloadGroup) -> Result<GroupOutcome, SyncError> {
        let master_version = self.master_version(group.sharing_group_uuid).await?;
        let trackers = self.store.downloads_for_group(&group.group_key).await?;
        for tracker in &trackers {
            if tracker.operation == TrackerOperation::Deletion
                || tracker.status == TrackerStatus::Done
            {
                continue;
            }
            self.store
                .set_download_status(tracker.id, TrackerStatus::InProgress)
                .await?;
            match tracker.operation {
                TrackerOperation::File => {
                    match self
                        .api
                        .download_file(
                            tracker.file_uuid,
                            tracker.file_version,
                            tracker.sharing_group_uuid,
                            master_version,
                        )
                        .await?
                    {
                        DownloadFileOutcome::File(file) => {
                            if file.mime_type != tracker.mime_type {
                                return Err(SyncError::MimeTypeMismatch {
                                    file_uuid: tracker.file_uuid,
                                    expected: tracker.mime_type.clone(),
                                    actual: file.mime_type,
                                });
                            }
                            let delivered = self
                                .mediate_content_download(tracker, file.app_meta_data.as_deref())
                                .await?;
                            // A withheld payload never reaches the staging
                            // dir; only the directory version advances.
                            let staged = if delivered {
                                Some(self.stage_download(tracker, &file.bytes).await?)
                            } else {
                                None
                            };
                            let staged_path = staged.as_ref().map(|path| path.to_string_lossy());
                            let meta_version =
                                file.app_meta_data_version.or(tracker.app_meta_data_version);
                            self.store
                                .set_download_result(
                                    tracker.id,
                                    staged_path.as_deref(),
                                    file.app_meta_data.as_deref(),
                                    meta_version,
                                    delivered,
                                )
                                .await?;
                        }
                        DownloadFileOutcome::Gone(reason) => {
                            self.store.set_download_gone(tracker.id, reason).await?;
                            self.mark_gone(
                                tracker.file_uuid,
                                tracker.sharing_group_uuid,
                                tracker.file_group_uuid,
                                Some(&tracker.mime_type),
                                reason,
                            )
                            .await?;
                        }
                        DownloadFileOutcome::MasterVersionConflict(new_master) => {
                            return Ok(GroupOutcome::MasterVersionConflict(new_master));
                        }
                    }
                }
                TrackerOperation::AppMetaData => {
                    let version = tracker.app_meta_data_version.unwrap_or(0);
                    match self
                        .api
                        .download_app_meta_data(
                            tracker.file_uuid,
                            version,
                            tracker.sharing_group_uuid,
                            master_version,
                        )
                        .await?
                    {
                        AppMetaDataOutcome::AppMetaData(contents) => {
                            self.store
                                .set_download_result(
                                    tracker.id,
                                    None,
                                    Some(&contents),
                                    tracker.app_meta_data_version,
                                    true,
                                )
                                .await?;
                        }
                        AppMetaDataOutcome::MasterVersionConflict(new_master) => {
                            return Ok(GroupOutcome::MasterVersionConflict(new_master));
                        }
                    }
                }
                TrackerOperation::Deletion | TrackerOperation::SharingGroup => {}
            }
        }
        self.settle_group(group).await?;
        Ok(GroupOutcome::Done)
    }

    async fn stage_download(
        &self,
        tracker: &DownloadTracker,
        bytes: &[u8],
    ) -> Result<PathBuf, SyncError> {
        let path = self
            .staging_root
            .join(format!("{}-v{}", tracker.file_uuid, tracker.file_version));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Lets the delegate pick a side when server content arrives for a file
    /// with queued local changes. Returns whether the payload should be
    /// handed to the client.
    async fn mediate_content_download(
        &self,
        tracker: &DownloadTracker,
        app_meta_data: Option<&str>,
    ) -> Result<bool, SyncError> {
        let uploads = self.store.uploads_for_file(tracker.file_uuid).await?;
        let Some(kind) = classify_pending(&uploads) else {
            return Ok(true);
        };
        let attr = download_attributes(tracker, app_meta_data);
        let (conflict, receiver) = SyncConflict::new(kind);
        self.delegate.content_download_conflict(&attr, &conflict);
        match receiver.await.map_err(|_| SyncError::ConflictAbandoned)? {
            ContentDownloadResolution::AcceptContentDownload => {
                self.store
                    .remove_content_uploads_for_file(tracker.file_uuid)
                    .await?;
                self.store
                    .remove_deletion_uploads_for_file(tracker.file_uuid)
                    .await?;
                Ok(true)
            }
            ContentDownloadResolution::RejectContentDownload(resolution) => {
                if !resolution.keep_content_uploads {
                    self.store
                        .remove_content_uploads_for_file(tracker.file_uuid)
                        .await?;
                }
                if !resolution.keep_upload_deletions {
                    self.store
                        .remove_deletion_uploads_for_file(tracker.file_uuid)
                        .await?;
                }
                Ok(false)
            }
        }
    }

    /// Applies the finished group to the directory and hands it to the
    /// client as one unit, mediating deletion conflicts on the way.
    async fn settle_group(&self, group: &DownloadGroup) -> Result<(), SyncError> {
        let trackers = self.store.downloads_for_group(&group.group_key).await?;
        let deletions: Vec<DownloadTracker> = trackers
            .iter()
            .filter(|tracker| tracker.operation == TrackerOperation::Deletion)
            .cloned()
            .collect();

        let mut undelete_in_flight: HashSet<Uuid> = HashSet::new();
        let mut skip_apply: HashSet<Uuid> = HashSet::new();
        let mut skip_notify: HashSet<Uuid> = HashSet::new();
        for deletion in &deletions {
            let uploads = self.store.uploads_for_file(deletion.file_uuid).await?;
            if uploads
                .iter()
                .any(|upload| upload.operation == TrackerOperation::Deletion)
            {
                // Both sides deleted the file. Our queued deletion is moot
                // and the client already knows the file is gone.
                self.store
                    .remove_deletion_uploads_for_file(deletion.file_uuid)
                    .await?;
                skip_notify.insert(deletion.file_uuid);
            }
            let content: Vec<UploadTracker> = uploads
                .into_iter()
                .filter(|upload| upload.operation.is_content())
                .collect();
            let Some(kind) = classify_pending(&content) else {
                continue;
            };
            let attr = download_attributes(deletion, None);
            let (conflict, receiver) = SyncConflict::new(kind);
            self.delegate.download_deletion_conflict(&attr, &conflict);
            match receiver.await.map_err(|_| SyncError::ConflictAbandoned)? {
                DownloadDeletionResolution::AcceptDownloadDeletion => {
                    self.store
                        .remove_content_uploads_for_file(deletion.file_uuid)
                        .await?;
                }
                DownloadDeletionResolution::RejectDownloadDeletion(resolution) => {
                    match resolution {
                        ContentUploadResolution::KeepContentUpload => {
                            // The oldest queued upload undeletes the file on
                            // its way up. Until it commits the entry stays in
                            // the half-deleted state.
                            if let Some(oldest) = content.first() {
                                self.store.set_upload_undelete(oldest.id, true).await?;
                            }
                            undelete_in_flight.insert(deletion.file_uuid);
                            skip_notify.insert(deletion.file_uuid);
                        }
                        ContentUploadResolution::RemoveContentUpload => {
                            self.store
                                .remove_content_uploads_for_file(deletion.file_uuid)
                                .await?;
                            skip_apply.insert(deletion.file_uuid);
                            skip_notify.insert(deletion.file_uuid);
                        }
                    }
                }
            }
        }

        let to_apply: Vec<DownloadTracker> = deletions
            .iter()
            .filter(|deletion| !skip_apply.contains(&deletion.file_uuid))
            .cloned()
            .collect();
        self.directory
            .apply_download_deletions(&to_apply, &undelete_in_flight)
            .await?;
        let notify: Vec<SyncAttributes> = deletions
            .iter()
            .filter(|deletion| !skip_notify.contains(&deletion.file_uuid))
            .map(|deletion| download_attributes(deletion, None))
            .collect();
        if !notify.is_empty() {
            self.events.send(SyncEvent::DownloadDeletions { files: notify });
        }

        let content_done: Vec<DownloadTracker> = trackers
            .iter()
            .filter(|tracker| {
                tracker.operation.is_content()
                    && tracker.status == TrackerStatus::Done
                    && tracker.gone_reason.is_none()
            })
            .cloned()
            .collect();
        self.directory.apply_downloads(&content_done).await?;

        let content_all: Vec<&DownloadTracker> = trackers
            .iter()
            .filter(|tracker| tracker.operation.is_content())
            .collect();
        if !content_all.is_empty() {
            let any_gone = content_all
                .iter()
                .any(|tracker| tracker.gone_reason.is_some());
            let files = content_all
                .iter()
                .map(|tracker| DownloadedGroupFile {
                    attr: download_attributes(tracker, tracker.app_meta_data.as_deref()),
                    local_path: if tracker.delivered {
                        tracker.local_path.clone().map(PathBuf::from)
                    } else {
                        None
                    },
                    app_meta_data_version: tracker.app_meta_data_version,
                    gone: tracker.gone_reason,
                })
                .collect();
            let downloaded = DownloadedGroup {
                sharing_group_uuid: group.sharing_group_uuid,
                file_group_uuid: group.file_group_uuid,
                files,
            };
            self.events.send(if any_gone {
                SyncEvent::FileGroupDownloadGone { group: downloaded }
            } else {
                SyncEvent::FileGroupDownloadComplete { group: downloaded }
            });
        }

        self.store
            .set_group_status(&group.group_key, GroupStatus::Downloaded)
            .await?;
        self.store.remove_group(&group.group_key).await?;
        Ok(())
    }

    async fn drain_batch(
        &self,
        sharing_group: Uuid,
        batch: i64,
    ) -> Result<BatchOutcome, SyncError> {
        let uploads = self.store.batch_uploads(batch, sharing_group).await?;
        let content_count = uploads
            .iter()
            .filter(|upload| upload.operation.is_content())
            .count();
        let deletion_count = uploads
            .iter()
            .filter(|upload| upload.operation == TrackerOperation::Deletion)
            .count();
        if content_count + deletion_count > 0 {
            self.events.send(SyncEvent::WillStartUploads {
                content_count,
                deletion_count,
            });
        }
        for upload in &uploads {
            if upload.status == TrackerStatus::Done {
                continue;
            }
            let master_version = self.master_version(sharing_group).await?;
            self.store
                .set_upload_status(upload.id, TrackerStatus::InProgress)
                .await?;
            let step = match upload.operation {
                TrackerOperation::File => {
                    self.upload_file_tracker(upload, master_version).await?
                }
                TrackerOperation::AppMetaData => {
                    self.upload_app_meta_data_tracker(upload, master_version)
                        .await?
                }
                TrackerOperation::Deletion => {
                    self.upload_deletion_tracker(upload, master_version).await?
                }
                TrackerOperation::SharingGroup => {
                    self.upload_sharing_group_tracker(upload, master_version)
                        .await?
                }
            };
            match step {
                UploadStep::Done => {
                    self.store
                        .set_upload_status(upload.id, TrackerStatus::Done)
                        .await?;
                }
                UploadStep::Removed => {}
                UploadStep::Conflict(new_master) => {
                    return Ok(BatchOutcome::MasterVersionConflict(new_master));
                }
            }
        }

        let master_version = self.master_version(sharing_group).await?;
        match self.api.commit_uploads(sharing_group, master_version).await? {
            CommitOutcome::MasterVersionConflict(new_master) => {
                Ok(BatchOutcome::MasterVersionConflict(new_master))
            }
            CommitOutcome::Done { number_transferred } => {
                tracing::debug!(%sharing_group, number_transferred, "upload batch committed");
                self.store
                    .set_master_version(sharing_group, master_version + 1)
                    .await?;
                self.finish_batch(sharing_group, batch).await?;
                Ok(BatchOutcome::Committed)
            }
        }
    }

    async fn upload_file_tracker(
        &self,
        upload: &UploadTracker,
        master_version: i64,
    ) -> Result<UploadStep, SyncError> {
        let entry = self
            .store
            .get_entry(upload.file_uuid)
            .await?
            .ok_or(SyncError::UnknownFile(upload.file_uuid))?;
        let target_version = match upload.target_version {
            Some(version) => version,
            None => {
                let version = entry.file_version.map(|version| version + 1).unwrap_or(0);
                self.store
                    .set_upload_target_version(upload.id, version)
                    .await?;
                version
            }
        };
        let path = upload
            .local_path
            .as_deref()
            .ok_or(SyncError::MissingUploadPayload(upload.file_uuid))?;
        let bytes = tokio::fs::read(path).await?;
        let request = UploadFileRequest {
            file_uuid: upload.file_uuid,
            sharing_group_uuid: upload.sharing_group_uuid,
            file_version: target_version,
            master_version,
            mime_type: upload
                .mime_type
                .clone()
                .or_else(|| entry.mime_type.clone())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            undelete: upload.undelete,
            app_meta_data: upload.app_meta_data.clone(),
            app_meta_data_version: upload.app_meta_data.as_ref().map(|_| {
                entry
                    .app_meta_data_version
                    .map(|version| version + 1)
                    .unwrap_or(0)
            }),
        };
        match self.api.upload_file(&request, bytes).await? {
            UploadFileOutcome::Ok => {
                self.events.send(SyncEvent::SingleFileUploadComplete {
                    attr: upload_attributes(upload),
                });
                Ok(UploadStep::Done)
            }
            UploadFileOutcome::Gone(reason) => {
                self.store.remove_upload(upload.id).await?;
                self.mark_gone(
                    upload.file_uuid,
                    upload.sharing_group_uuid,
                    upload.file_group_uuid,
                    upload.mime_type.as_deref(),
                    reason,
                )
                .await?;
                self.events.send(SyncEvent::SingleFileUploadGone {
                    attr: upload_attributes(upload),
                    reason,
                });
                Ok(UploadStep::Removed)
            }
            UploadFileOutcome::MasterVersionConflict(new_master) => {
                Ok(UploadStep::Conflict(new_master))
            }
        }
    }

    async fn upload_app_meta_data_tracker(
        &self,
        upload: &UploadTracker,
        master_version: i64,
    ) -> Result<UploadStep, SyncError> {
        let entry = self
            .store
            .get_entry(upload.file_uuid)
            .await?
            .ok_or(SyncError::UnknownFile(upload.file_uuid))?;
        let target_version = match upload.target_version {
            Some(version) => version,
            None => {
                let version = entry
                    .app_meta_data_version
                    .map(|version| version + 1)
                    .unwrap_or(0);
                self.store
                    .set_upload_target_version(upload.id, version)
                    .await?;
                version
            }
        };
        let request = UploadFileRequest {
            file_uuid: upload.file_uuid,
            sharing_group_uuid: upload.sharing_group_uuid,
            file_version: entry.file_version.unwrap_or(0),
            master_version,
            mime_type: upload
                .mime_type
                .clone()
                .or_else(|| entry.mime_type.clone())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            undelete: false,
            app_meta_data: upload.app_meta_data.clone(),
            app_meta_data_version: Some(target_version),
        };
        match self.api.upload_file(&request, Vec::new()).await? {
            UploadFileOutcome::Ok => Ok(UploadStep::Done),
            UploadFileOutcome::Gone(reason) => {
                self.store.remove_upload(upload.id).await?;
                self.mark_gone(
                    upload.file_uuid,
                    upload.sharing_group_uuid,
                    upload.file_group_uuid,
                    upload.mime_type.as_deref(),
                    reason,
                )
                .await?;
                self.events.send(SyncEvent::SingleFileUploadGone {
                    attr: upload_attributes(upload),
                    reason,
                });
                Ok(UploadStep::Removed)
            }
            UploadFileOutcome::MasterVersionConflict(new_master) => {
                Ok(UploadStep::Conflict(new_master))
            }
        }
    }

    async fn upload_deletion_tracker(
        &self,
        upload: &UploadTracker,
        master_version: i64,
    ) -> Result<UploadStep, SyncError> {
        let entry = self
            .store
            .get_entry(upload.file_uuid)
            .await?
            .ok_or(SyncError::UnknownFile(upload.file_uuid))?;
        match self
            .api
            .upload_deletion(
                upload.file_uuid,
                entry.file_version.unwrap_or(0),
                upload.sharing_group_uuid,
                master_version,
            )
            .await?
        {
            UploadDeletionOutcome::Ok => Ok(UploadStep::Done),
            UploadDeletionOutcome::MasterVersionConflict(new_master) => {
                Ok(UploadStep::Conflict(new_master))
            }
        }
    }

    async fn upload_sharing_group_tracker(
        &self,
        upload: &UploadTracker,
        master_version: i64,
    ) -> Result<UploadStep, SyncError> {
        let name = upload.new_name.as_deref().unwrap_or_default();
        match self
            .api
            .update_sharing_group(upload.sharing_group_uuid, name, master_version)
            .await?
        {
            UpdateSharingGroupOutcome::Ok => Ok(UploadStep::Done),
            UpdateSharingGroupOutcome::MasterVersionConflict(new_master) => {
                Ok(UploadStep::Conflict(new_master))
            }
        }
    }

    /// The commit went through: fold the batch into the directory and drop
    /// its trackers.
    async fn finish_batch(&self, sharing_group: Uuid, batch: i64) -> Result<(), SyncError> {
        let uploads = self.store.batch_uploads(batch, sharing_group).await?;
        let mut content = 0usize;
        let mut deletions = 0usize;
        for upload in &uploads {
            match upload.operation {
                TrackerOperation::File => {
                    let mut entry = self
                        .store
                        .get_entry(upload.file_uuid)
                        .await?
                        .ok_or(SyncError::UnknownFile(upload.file_uuid))?;
                    entry.file_version = Some(upload.target_version.unwrap_or(0));
                    if upload.app_meta_data.is_some() {
                        entry.app_meta_data_version = Some(
                            entry
                                .app_meta_data_version
                                .map(|version| version + 1)
                                .unwrap_or(0),
                        );
                    }
                    if upload.undelete {
                        entry.deleted_locally = false;
                        entry.deleted_on_server = false;
                    }
                    self.store.upsert_entry(&entry).await?;
                    content += 1;
                }
                TrackerOperation::AppMetaData => {
                    let mut entry = self
                        .store
                        .get_entry(upload.file_uuid)
                        .await?
                        .ok_or(SyncError::UnknownFile(upload.file_uuid))?;
                    entry.app_meta_data_version = Some(upload.target_version.unwrap_or(0));
                    self.store.upsert_entry(&entry).await?;
                    content += 1;
                }
                TrackerOperation::Deletion => {
                    let mut entry = self
                        .store
                        .get_entry(upload.file_uuid)
                        .await?
                        .ok_or(SyncError::UnknownFile(upload.file_uuid))?;
                    entry.deleted_locally = true;
                    entry.deleted_on_server = true;
                    self.store.upsert_entry(&entry).await?;
                    deletions += 1;
                }
                TrackerOperation::SharingGroup => {
                    if let Some(name) = &upload.new_name
                        && let Some(mut sharing) =
                            self.store.get_sharing_entry(upload.sharing_group_uuid).await?
                    {
                        sharing.name = Some(name.clone());
                        self.store.upsert_sharing_entry(&sharing).await?;
                    }
                    self.events.send(SyncEvent::SharingGroupUploadComplete {
                        sharing_group_uuid: upload.sharing_group_uuid,
                    });
                }
            }
            self.store.remove_upload(upload.id).await?;
        }
        if content > 0 {
            self.events
                .send(SyncEvent::ContentUploadsCompleted { count: content });
        }
        if deletions > 0 {
            self.events
                .send(SyncEvent::UploadDeletionsCompleted { count: deletions });
        }
        Ok(())
    }

    async fn mark_gone(
        &self,
        file_uuid: Uuid,
        sharing_group: Uuid,
        file_group: Option<Uuid>,
        mime_type: Option<&str>,
        reason: GoneReason,
    ) -> Result<(), SyncError> {
        let mut entry = match self.store.get_entry(file_uuid).await? {
            Some(entry) => entry,
            None => {
                let mut entry = DirectoryEntry::new(file_uuid, sharing_group);
                entry.file_group_uuid = file_group;
                entry.mime_type = mime_type.map(str::to_string);
                entry
            }
        };
        entry.gone_reason = Some(reason);
        self.store.upsert_entry(&entry).await?;
        Ok(())
    }
}

fn download_attributes(tracker: &DownloadTracker, app_meta_data: Option<&str>) -> SyncAttributes {
    SyncAttributes {
        file_uuid: tracker.file_uuid,
        sharing_group_uuid: tracker.sharing_group_uuid,
        file_group_uuid: tracker.file_group_uuid,
        mime_type: tracker.mime_type.clone(),
        app_meta_data: app_meta_data.map(str::to_string),
    }
}

fn upload_attributes(upload: &UploadTracker) -> SyncAttributes {
    SyncAttributes {
        file_uuid: upload.file_uuid,
        sharing_group_uuid: upload.sharing_group_uuid,
        file_group_uuid: upload.file_group_uuid,
        mime_type: upload.mime_type.clone().unwrap_or_default(),
        app_meta_data: upload.app_meta_data.clone(),
    }
}
