use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::oneshot;

use super::events::SyncAttributes;
use super::store::{TrackerOperation, UploadTracker};

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("conflict was already resolved")]
    AlreadyResolved,
}

/// Which kind of queued local change collided with the server's version of
/// the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictingClientOperation {
    ContentUpload(ContentType),
    UploadDeletion,
    Both(ContentType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    File,
    AppMetaData,
    Both,
}

/// What to do with the queued local changes when a conflict is resolved
/// against them selectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadResolution {
    pub keep_content_uploads: bool,
    pub keep_upload_deletions: bool,
}

impl UploadResolution {
    pub const KEEP_ALL: Self = Self {
        keep_content_uploads: true,
        keep_upload_deletions: true,
    };
    pub const REMOVE_ALL: Self = Self {
        keep_content_uploads: false,
        keep_upload_deletions: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentDownloadResolution {
    /// Take the server's content. All queued local changes for the file are
    /// removed.
    AcceptContentDownload,
    /// Keep (some of) the queued local changes. The server's file version is
    /// still recorded but the payload is not handed to the client.
    RejectContentDownload(UploadResolution),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentUploadResolution {
    /// The oldest queued content upload turns into an undeletion.
    KeepContentUpload,
    RemoveContentUpload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadDeletionResolution {
    /// The local file is marked deleted and queued content uploads are
    /// removed.
    AcceptDownloadDeletion,
    RejectDownloadDeletion(ContentUploadResolution),
}

/// A single-use resolution token. The engine stalls the affected file until
/// `resolve` is called; resolving twice is an error.
pub struct SyncConflict<R> {
    kind: ConflictingClientOperation,
    sender: Mutex<Option<oneshot::Sender<R>>>,
}

impl<R> SyncConflict<R> {
    pub(crate) fn new(kind: ConflictingClientOperation) -> (Self, oneshot::Receiver<R>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind,
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn conflicting_operation(&self) -> ConflictingClientOperation {
        self.kind
    }

    pub fn resolve(&self, resolution: R) -> Result<(), ConflictError> {
        let sender = self
            .sender
            .lock()
            .expect("conflict lock poisoned")
            .take()
            .ok_or(ConflictError::AlreadyResolved)?;
        // The engine may have been dropped mid-pass; nothing to report then.
        let _ = sender.send(resolution);
        Ok(())
    }
}

/// How the application mediates between queued local changes and incoming
/// server state. The default accepts the server's view.
pub trait ConflictDelegate: Send + Sync {
    fn content_download_conflict(
        &self,
        attr: &SyncAttributes,
        conflict: &SyncConflict<ContentDownloadResolution>,
    );

    fn download_deletion_conflict(
        &self,
        attr: &SyncAttributes,
        conflict: &SyncConflict<DownloadDeletionResolution>,
    );
}

/// Resolves every conflict in the server's favor.
pub struct AcceptRemote;

impl ConflictDelegate for AcceptRemote {
    fn content_download_conflict(
        &self,
        _attr: &SyncAttributes,
        conflict: &SyncConflict<ContentDownloadResolution>,
    ) {
        let _ = conflict.resolve(ContentDownloadResolution::AcceptContentDownload);
    }

    fn download_deletion_conflict(
        &self,
        _attr: &SyncAttributes,
        conflict: &SyncConflict<DownloadDeletionResolution>,
    ) {
        let _ = conflict.resolve(DownloadDeletionResolution::AcceptDownloadDeletion);
    }
}

/// Classifies the queued uploads for a file, if any conflict with incoming
/// server content.
pub(crate) fn classify_pending(uploads: &[UploadTracker]) -> Option<ConflictingClientOperation> {
    let mut has_file = false;
    let mut has_meta = false;
    let mut has_deletion = false;
    for upload in uploads {
        match upload.operation {
            TrackerOperation::File => {
                has_file = true;
                if upload.app_meta_data.is_some() {
                    has_meta = true;
                }
            }
            TrackerOperation::AppMetaData => has_meta = true,
            TrackerOperation::Deletion => has_deletion = true,
            TrackerOperation::SharingGroup => {}
        }
    }
    let content = match (has_file, has_meta) {
        (true, true) => Some(ContentType::Both),
        (true, false) => Some(ContentType::File),
        (false, true) => Some(ContentType::AppMetaData),
        (false, false) => None,
    };
    match (content, has_deletion) {
        (Some(content), true) => Some(ConflictingClientOperation::Both(content)),
        (Some(content), false) => Some(ConflictingClientOperation::ContentUpload(content)),
        (None, true) => Some(ConflictingClientOperation::UploadDeletion),
        (None, false) => None,
    }
}
