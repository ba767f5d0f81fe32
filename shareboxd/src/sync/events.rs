use std::path::PathBuf;

use sharebox_api::GoneReason;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use uuid::Uuid;

/// Client-facing identity of a file, carried on uploads, downloads and
/// deletion notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncAttributes {
    pub file_uuid: Uuid,
    pub sharing_group_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub mime_type: String,
    pub app_meta_data: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadedGroupFile {
    pub attr: SyncAttributes,
    /// Staged payload on disk. None for metadata-only downloads and for
    /// content the client chose to reject during conflict resolution.
    pub local_path: Option<PathBuf>,
    pub app_meta_data_version: Option<i64>,
    pub gone: Option<GoneReason>,
}

#[derive(Debug, Clone)]
pub struct DownloadedGroup {
    pub sharing_group_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub files: Vec<DownloadedGroupFile>,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    SyncStarted,
    /// A sync was requested while a pass was running. Another pass will
    /// follow the current one.
    SyncDelayed,
    SyncDone,
    SyncStopping,
    SharingGroupsDownloaded {
        created: usize,
        updated: usize,
        removed: usize,
    },
    WillStartDownloads {
        content_count: usize,
        deletion_count: usize,
    },
    WillStartUploads {
        content_count: usize,
        deletion_count: usize,
    },
    SingleFileUploadComplete {
        attr: SyncAttributes,
    },
    SingleFileUploadGone {
        attr: SyncAttributes,
        reason: GoneReason,
    },
    ContentUploadsCompleted {
        count: usize,
    },
    UploadDeletionsCompleted {
        count: usize,
    },
    SharingGroupUploadComplete {
        sharing_group_uuid: Uuid,
    },
    /// Every file in a content group finished downloading and the group was
    /// handed over as one unit.
    FileGroupDownloadComplete {
        group: DownloadedGroup,
    },
    /// The group finished but at least one of its files is gone on the
    /// server side.
    FileGroupDownloadGone {
        group: DownloadedGroup,
    },
    DownloadDeletions {
        files: Vec<SyncAttributes>,
    },
}

#[derive(Clone)]
pub struct EventSender {
    tx: UnboundedSender<SyncEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}
