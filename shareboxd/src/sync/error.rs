use thiserror::Error;
use uuid::Uuid;

use sharebox_api::ApiError;

use super::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mime type of file {0} cannot change across uploads")]
    MimeTypeChanged(Uuid),
    #[error("file group of file {0} cannot change across uploads")]
    FileGroupChanged(Uuid),
    #[error("file {0} is already deleted")]
    FileAlreadyDeleted(Uuid),
    #[error("file {0} is already queued for deletion")]
    FileQueuedForDeletion(Uuid),
    #[error("cannot delete unknown file {0}")]
    DeletingUnknownFile(Uuid),
    #[error("file {0} is not known to the local directory")]
    UnknownFile(Uuid),
    #[error("app meta data upload for file {0} carries no app meta data")]
    MissingAppMetaData(Uuid),
    #[error("upload tracker for file {0} has no payload path")]
    MissingUploadPayload(Uuid),
    #[error("server sent mime type {actual} for file {file_uuid}, directory has {expected}")]
    MimeTypeMismatch {
        file_uuid: Uuid,
        expected: String,
        actual: String,
    },
    #[error("more than one content group is marked downloading")]
    MultipleGroupsDownloading,
    #[error("sharing group {0} is unknown")]
    UnknownSharingGroup(Uuid),
    #[error("index response is missing the master version or file list")]
    IncompleteIndex,
    #[error("a sync pass is currently operating")]
    SyncIsOperating,
    #[error("conflict resolution was abandoned")]
    ConflictAbandoned,
}
