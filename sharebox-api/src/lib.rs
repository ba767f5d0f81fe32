mod client;

pub use client::{
    ApiError, ApiErrorClass, AppMetaDataOutcome, CommitOutcome, DownloadFileOutcome,
    DownloadedFile, FileInfo, GoneReason, IndexResponse, Permission, ShareboxClient,
    SharingGroupInfo, UpdateSharingGroupOutcome, UploadDeletionOutcome, UploadFileOutcome,
    UploadFileRequest,
};
