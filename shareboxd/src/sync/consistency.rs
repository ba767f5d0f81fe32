use std::collections::HashSet;

use sharebox_api::ShareboxClient;
use uuid::Uuid;

use super::error::SyncError;
use super::store::SyncStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCounts {
    pub sharing_group_uuid: Uuid,
    pub directory_entries: usize,
    pub server_files: usize,
}

/// Outcome of comparing the server index, the local directory and the files
/// the client actually holds.
#[derive(Debug, Default)]
pub struct ConsistencyReport {
    /// Marked deleted on the server yet the client still holds the file.
    pub deleted_but_present: Vec<Uuid>,
    /// Live on the server but absent from the client's files.
    pub missing_locally: Vec<Uuid>,
    /// Held by the client without any directory entry.
    pub missing_from_directory: Vec<Uuid>,
    pub counts: Vec<GroupCounts>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.deleted_but_present.is_empty()
            && self.missing_locally.is_empty()
            && self.missing_from_directory.is_empty()
    }
}

/// Result of checking the client's files against the directory alone,
/// without going to the server.
#[derive(Debug, Default)]
pub struct LocalConsistencyReport {
    pub tracked_and_present: usize,
    pub deleted_but_present: Vec<Uuid>,
    pub missing_from_directory: Vec<Uuid>,
}

pub struct ConsistencyChecker {
    api: ShareboxClient,
    store: SyncStore,
}

impl ConsistencyChecker {
    pub fn new(api: ShareboxClient, store: SyncStore) -> Self {
        Self { api, store }
    }

    /// Cross-checks every sharing group's index against the directory and
    /// the files the client reports holding.
    pub async fn check(&self, local_files: &[Uuid]) -> Result<ConsistencyReport, SyncError> {
        let local: HashSet<Uuid> = local_files.iter().copied().collect();
        let mut report = ConsistencyReport::default();

        for sharing in self.store.sharing_entries().await? {
            if sharing.removed_from_group {
                continue;
            }
            let index = self.api.index(Some(sharing.sharing_group_uuid)).await?;
            let files = index.files.ok_or(SyncError::IncompleteIndex)?;
            let mut server_live = 0;
            for file in &files {
                if file.deleted {
                    continue;
                }
                server_live += 1;
                if !local.contains(&file.file_uuid) {
                    report.missing_locally.push(file.file_uuid);
                }
            }
            let entries = self
                .store
                .entries_for_sharing_group(sharing.sharing_group_uuid)
                .await?;
            report.counts.push(GroupCounts {
                sharing_group_uuid: sharing.sharing_group_uuid,
                directory_entries: entries.iter().filter(|e| !e.deleted_on_server).count(),
                server_files: server_live,
            });
        }

        self.check_directory(&local, &mut report).await?;
        Ok(report)
    }

    /// Compares the client's files against the directory without any server
    /// traffic.
    pub async fn local_check(
        &self,
        local_files: &[Uuid],
    ) -> Result<LocalConsistencyReport, SyncError> {
        let local: HashSet<Uuid> = local_files.iter().copied().collect();
        let mut report = LocalConsistencyReport::default();
        let entries = self.store.all_entries().await?;
        let known: HashSet<Uuid> = entries.iter().map(|entry| entry.file_uuid).collect();
        for entry in &entries {
            if local.contains(&entry.file_uuid) {
                if entry.deleted_on_server {
                    report.deleted_but_present.push(entry.file_uuid);
                } else {
                    report.tracked_and_present += 1;
                }
            }
        }
        for file_uuid in &local {
            if !known.contains(file_uuid) {
                report.missing_from_directory.push(*file_uuid);
            }
        }
        Ok(report)
    }

    /// Forgets directory entries for files the client no longer holds so a
    /// following sync pass downloads them again. Returns how many entries
    /// were dropped.
    pub async fn repair(&self, report: &ConsistencyReport) -> Result<usize, SyncError> {
        for file_uuid in &report.missing_locally {
            self.store.remove_entry(*file_uuid).await?;
        }
        Ok(report.missing_locally.len())
    }

    async fn check_directory(
        &self,
        local: &HashSet<Uuid>,
        report: &mut ConsistencyReport,
    ) -> Result<(), SyncError> {
        let entries = self.store.all_entries().await?;
        let known: HashSet<Uuid> = entries.iter().map(|entry| entry.file_uuid).collect();
        for entry in &entries {
            if entry.deleted_on_server && local.contains(&entry.file_uuid) {
                report.deleted_but_present.push(entry.file_uuid);
            }
        }
        for file_uuid in local {
            if !known.contains(file_uuid) {
                report.missing_from_directory.push(*file_uuid);
            }
        }
        Ok(())
    }
}
