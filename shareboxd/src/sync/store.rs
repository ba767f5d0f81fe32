use sharebox_api::{GoneReason, Permission};
use sqlx::{SqlitePool, migrate::Migrator};
use thiserror::Error;
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
    #[error("invalid tracker operation: {0}")]
    InvalidOperation(String),
    #[error("invalid tracker status: {0}")]
    InvalidStatus(String),
    #[error("invalid group status: {0}")]
    InvalidGroupStatus(String),
    #[error("invalid permission: {0}")]
    InvalidPermission(String),
    #[error("invalid gone reason: {0}")]
    InvalidGoneReason(String),
}

/// The kind of transfer a tracker stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerOperation {
    File,
    AppMetaData,
    Deletion,
    SharingGroup,
}

impl TrackerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerOperation::File => "file",
            TrackerOperation::AppMetaData => "app_meta_data",
            TrackerOperation::Deletion => "deletion",
            TrackerOperation::SharingGroup => "sharing_group",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "file" => Ok(TrackerOperation::File),
            "app_meta_data" => Ok(TrackerOperation::AppMetaData),
            "deletion" => Ok(TrackerOperation::Deletion),
            "sharing_group" => Ok(TrackerOperation::SharingGroup),
            other => Err(StoreError::InvalidOperation(other.to_string())),
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(self, TrackerOperation::File | TrackerOperation::AppMetaData)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerStatus {
    NotStarted,
    InProgress,
    Done,
}

impl TrackerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerStatus::NotStarted => "not_started",
            TrackerStatus::InProgress => "in_progress",
            TrackerStatus::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "not_started" => Ok(TrackerStatus::NotStarted),
            "in_progress" => Ok(TrackerStatus::InProgress),
            "done" => Ok(TrackerStatus::Done),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    NotStarted,
    Downloading,
    Downloaded,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::NotStarted => "not_started",
            GroupStatus::Downloading => "downloading",
            GroupStatus::Downloaded => "downloaded",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "not_started" => Ok(GroupStatus::NotStarted),
            "downloading" => Ok(GroupStatus::Downloading),
            "downloaded" => Ok(GroupStatus::Downloaded),
            other => Err(StoreError::InvalidGroupStatus(other.to_string())),
        }
    }
}

/// What the client knows about one file, deleted or not.
///
/// `deleted_locally` implies `deleted_on_server` except while an undeletion
/// upload is in flight, where only `deleted_on_server` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub file_uuid: Uuid,
    pub sharing_group_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub mime_type: Option<String>,
    pub file_version: Option<i64>,
    pub app_meta_data_version: Option<i64>,
    pub deleted_locally: bool,
    pub deleted_on_server: bool,
    pub gone_reason: Option<GoneReason>,
}

impl DirectoryEntry {
    pub fn new(file_uuid: Uuid, sharing_group_uuid: Uuid) -> Self {
        Self {
            file_uuid,
            sharing_group_uuid,
            file_group_uuid: None,
            mime_type: None,
            file_version: None,
            app_meta_data_version: None,
            deleted_locally: false,
            deleted_on_server: false,
            gone_reason: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadInput {
    pub file_uuid: Uuid,
    pub sharing_group_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub operation: TrackerOperation,
    pub age: i64,
    pub local_path: Option<String>,
    pub mime_type: Option<String>,
    pub app_meta_data: Option<String>,
    pub new_name: Option<String>,
}

/// One queued upload. `batch` is NULL while the tracker is still in the
/// pending set and numbered once a sync is requested.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTracker {
    pub id: i64,
    pub file_uuid: Uuid,
    pub sharing_group_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub operation: TrackerOperation,
    pub status: TrackerStatus,
    pub age: i64,
    pub batch: Option<i64>,
    pub local_path: Option<String>,
    pub mime_type: Option<String>,
    pub app_meta_data: Option<String>,
    pub target_version: Option<i64>,
    pub undelete: bool,
    pub new_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadInput {
    pub file_uuid: Uuid,
    pub sharing_group_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub group_key: String,
    pub operation: TrackerOperation,
    pub file_version: i64,
    pub app_meta_data_version: Option<i64>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTracker {
    pub id: i64,
    pub file_uuid: Uuid,
    pub sharing_group_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub group_key: String,
    pub operation: TrackerOperation,
    pub status: TrackerStatus,
    pub file_version: i64,
    pub app_meta_data_version: Option<i64>,
    pub mime_type: String,
    pub local_path: Option<String>,
    pub app_meta_data: Option<String>,
    pub gone_reason: Option<GoneReason>,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadGroup {
    pub group_key: String,
    pub sharing_group_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub status: GroupStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SharingEntry {
    pub sharing_group_uuid: Uuid,
    pub name: Option<String>,
    pub permission: Permission,
    pub master_version: i64,
    pub sync_needed: bool,
    pub removed_from_group: bool,
}

#[derive(Clone)]
pub struct SyncStore {
    pub(super) pool: SqlitePool,
}

pub(super) fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|_| StoreError::InvalidUuid(value.to_string()))
}

pub(super) fn parse_optional_uuid(value: Option<String>) -> Result<Option<Uuid>, StoreError> {
    value.as_deref().map(parse_uuid).transpose()
}

pub(super) fn parse_gone_reason(value: Option<String>) -> Result<Option<GoneReason>, StoreError> {
    match value {
        Some(value) => GoneReason::parse(&value)
            .map(Some)
            .map_err(|_| StoreError::InvalidGoneReason(value)),
        None => Ok(None),
    }
}

pub(super) fn permission_as_str(permission: Permission) -> &'static str {
    match permission {
        Permission::Read => "read",
        Permission::Write => "write",
        Permission::Admin => "admin",
    }
}

pub(super) fn parse_permission(value: &str) -> Result<Permission, StoreError> {
    match value {
        "read" => Ok(Permission::Read),
        "write" => Ok(Permission::Write),
        "admin" => Ok(Permission::Admin),
        other => Err(StoreError::InvalidPermission(other.to_string())),
    }
}

impl SyncStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}
