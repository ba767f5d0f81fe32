use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

const APP_META_DATA_HEADER: &str = "x-sharebox-app-meta-data";
const APP_META_DATA_VERSION_HEADER: &str = "x-sharebox-app-meta-data-version";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("unknown gone reason: {0}")]
    UnknownGoneReason(String),
    #[error("malformed {0} header in response")]
    MalformedHeader(&'static str),
    #[error("conflict response did not carry a master version")]
    MissingConflictVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl ApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Terminal reason a server file can no longer be transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoneReason {
    OwnerRemoved,
    AuthExpiredOrRevoked,
    CloudFileRenamedOrRemoved,
}

impl GoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoneReason::OwnerRemoved => "ownerRemoved",
            GoneReason::AuthExpiredOrRevoked => "authExpiredOrRevoked",
            GoneReason::CloudFileRenamedOrRemoved => "cloudFileRenamedOrRemoved",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ApiError> {
        match value {
            "ownerRemoved" => Ok(GoneReason::OwnerRemoved),
            "authExpiredOrRevoked" => Ok(GoneReason::AuthExpiredOrRevoked),
            "cloudFileRenamedOrRemoved" => Ok(GoneReason::CloudFileRenamedOrRemoved),
            other => Err(ApiError::UnknownGoneReason(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_uuid: Uuid,
    #[serde(default)]
    pub file_group_uuid: Option<Uuid>,
    pub sharing_group_uuid: Uuid,
    pub mime_type: String,
    pub file_version: i64,
    #[serde(default)]
    pub app_meta_data_version: Option<i64>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingGroupInfo {
    pub sharing_group_uuid: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub permission: Permission,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexResponse {
    pub sharing_groups: Vec<SharingGroupInfo>,
    /// Present only when the index was requested for a specific sharing group.
    #[serde(default)]
    pub master_version: Option<i64>,
    #[serde(default)]
    pub files: Option<Vec<FileInfo>>,
}

#[derive(Debug, Clone)]
pub struct UploadFileRequest {
    pub file_uuid: Uuid,
    pub sharing_group_uuid: Uuid,
    pub file_version: i64,
    pub master_version: i64,
    pub mime_type: String,
    pub undelete: bool,
    pub app_meta_data: Option<String>,
    pub app_meta_data_version: Option<i64>,
}

#[derive(Debug)]
pub enum UploadFileOutcome {
    Ok,
    Gone(GoneReason),
    MasterVersionConflict(i64),
}

#[derive(Debug)]
pub enum UploadDeletionOutcome {
    Ok,
    MasterVersionConflict(i64),
}

#[derive(Debug)]
pub enum CommitOutcome {
    Done { number_transferred: i64 },
    MasterVersionConflict(i64),
}

#[derive(Debug)]
pub struct DownloadedFile {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub app_meta_data: Option<String>,
    pub app_meta_data_version: Option<i64>,
}

#[derive(Debug)]
pub enum DownloadFileOutcome {
    File(DownloadedFile),
    Gone(GoneReason),
    MasterVersionConflict(i64),
}

#[derive(Debug)]
pub enum AppMetaDataOutcome {
    AppMetaData(String),
    MasterVersionConflict(i64),
}

#[derive(Debug)]
pub enum UpdateSharingGroupOutcome {
    Ok,
    MasterVersionConflict(i64),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    master_version: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoneBody {
    gone_reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitBody {
    number_transferred: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppMetaDataBody {
    app_meta_data: String,
}

#[derive(Clone)]
pub struct ShareboxClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl ShareboxClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Fetches the file index. With a sharing group, the response carries that
    /// group's master version and file list; without one, only the caller's
    /// sharing group memberships.
    pub async fn index(&self, sharing_group: Option<Uuid>) -> Result<IndexResponse, ApiError> {
        let mut url = self.endpoint("/v1/index")?;
        if let Some(group) = sharing_group {
            url.query_pairs_mut()
                .append_pair("sharingGroupId", &group.to_string());
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn upload_file(
        &self,
        request: &UploadFileRequest,
        bytes: Vec<u8>,
    ) -> Result<UploadFileOutcome, ApiError> {
        let mut url = self.endpoint(&format!("/v1/files/{}", request.file_uuid))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sharingGroupId", &request.sharing_group_uuid.to_string());
            query.append_pair("fileVersion", &request.file_version.to_string());
            query.append_pair("masterVersion", &request.master_version.to_string());
            query.append_pair("mimeType", &request.mime_type);
            if request.undelete {
                query.append_pair("undelete", "true");
            }
            if let Some(app_meta_data) = &request.app_meta_data {
                query.append_pair("appMetaData", app_meta_data);
            }
            if let Some(version) = request.app_meta_data_version {
                query.append_pair("appMetaDataVersion", &version.to_string());
            }
        }
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .header("Content-Type", &request.mime_type)
            .body(bytes)
            .send()
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(UploadFileOutcome::MasterVersionConflict(
                Self::conflict_version(response).await?,
            )),
            StatusCode::GONE => Ok(UploadFileOutcome::Gone(Self::gone_reason(response).await?)),
            _ => {
                Self::expect_success(response).await?;
                Ok(UploadFileOutcome::Ok)
            }
        }
    }

    pub async fn upload_deletion(
        &self,
        file_uuid: Uuid,
        file_version: i64,
        sharing_group: Uuid,
        master_version: i64,
    ) -> Result<UploadDeletionOutcome, ApiError> {
        let mut url = self.endpoint(&format!("/v1/files/{file_uuid}"))?;
        url.query_pairs_mut()
            .append_pair("sharingGroupId", &sharing_group.to_string())
            .append_pair("fileVersion", &file_version.to_string())
            .append_pair("masterVersion", &master_version.to_string());
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(UploadDeletionOutcome::MasterVersionConflict(
                Self::conflict_version(response).await?,
            ));
        }
        Self::expect_success(response).await?;
        Ok(UploadDeletionOutcome::Ok)
    }

    /// Commits the uploads accepted since the last commit boundary. The server
    /// increments the group's master version on success.
    pub async fn commit_uploads(
        &self,
        sharing_group: Uuid,
        master_version: i64,
    ) -> Result<CommitOutcome, ApiError> {
        let mut url = self.endpoint("/v1/uploads/commit")?;
        url.query_pairs_mut()
            .append_pair("sharingGroupId", &sharing_group.to_string())
            .append_pair("masterVersion", &master_version.to_string());
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(CommitOutcome::MasterVersionConflict(
                Self::conflict_version(response).await?,
            ));
        }
        let body: CommitBody = Self::handle_response(response).await?;
        Ok(CommitOutcome::Done {
            number_transferred: body.number_transferred,
        })
    }

    pub async fn download_file(
        &self,
        file_uuid: Uuid,
        file_version: i64,
        sharing_group: Uuid,
        master_version: i64,
    ) -> Result<DownloadFileOutcome, ApiError> {
        let mut url = self.endpoint(&format!("/v1/files/{file_uuid}"))?;
        url.query_pairs_mut()
            .append_pair("sharingGroupId", &sharing_group.to_string())
            .append_pair("fileVersion", &file_version.to_string())
            .append_pair("masterVersion", &master_version.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(DownloadFileOutcome::MasterVersionConflict(
                Self::conflict_version(response).await?,
            )),
            StatusCode::GONE => Ok(DownloadFileOutcome::Gone(
                Self::gone_reason(response).await?,
            )),
            status if status.is_success() => {
                let mime_type = response
                    .headers()
                    .get("content-type")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let app_meta_data = match response.headers().get(APP_META_DATA_HEADER) {
                    Some(value) => Some(
                        value
                            .to_str()
                            .map_err(|_| ApiError::MalformedHeader(APP_META_DATA_HEADER))?
                            .to_string(),
                    ),
                    None => None,
                };
                let app_meta_data_version =
                    match response.headers().get(APP_META_DATA_VERSION_HEADER) {
                        Some(value) => Some(
                            value
                                .to_str()
                                .ok()
                                .and_then(|value| value.parse::<i64>().ok())
                                .ok_or(ApiError::MalformedHeader(APP_META_DATA_VERSION_HEADER))?,
                        ),
                        None => None,
                    };
                let bytes = response.bytes().await?.to_vec();
                Ok(DownloadFileOutcome::File(DownloadedFile {
                    bytes,
                    mime_type,
                    app_meta_data,
                    app_meta_data_version,
                }))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::Api { status, body })
            }
        }
    }

    pub async fn download_app_meta_data(
        &self,
        file_uuid: Uuid,
        app_meta_data_version: i64,
        sharing_group: Uuid,
        master_version: i64,
    ) -> Result<AppMetaDataOutcome, ApiError> {
        let mut url = self.endpoint(&format!("/v1/files/{file_uuid}/meta"))?;
        url.query_pairs_mut()
            .append_pair("sharingGroupId", &sharing_group.to_string())
            .append_pair("appMetaDataVersion", &app_meta_data_version.to_string())
            .append_pair("masterVersion", &master_version.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(AppMetaDataOutcome::MasterVersionConflict(
                Self::conflict_version(response).await?,
            ));
        }
        let body: AppMetaDataBody = Self::handle_response(response).await?;
        Ok(AppMetaDataOutcome::AppMetaData(body.app_meta_data))
    }

    pub async fn update_sharing_group(
        &self,
        sharing_group: Uuid,
        name: &str,
        master_version: i64,
    ) -> Result<UpdateSharingGroupOutcome, ApiError> {
        let mut url = self.endpoint(&format!("/v1/sharing-groups/{sharing_group}"))?;
        url.query_pairs_mut()
            .append_pair("masterVersion", &master_version.to_string());
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(UpdateSharingGroupOutcome::MasterVersionConflict(
                Self::conflict_version(response).await?,
            ));
        }
        Self::expect_success(response).await?;
        Ok(UpdateSharingGroupOutcome::Ok)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Api { status, body })
        }
    }

    async fn expect_success(response: reqwest::Response) -> Result<(), ApiError> {
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Api { status, body })
    }

    async fn conflict_version(response: reqwest::Response) -> Result<i64, ApiError> {
        let body: ConflictBody = response
            .json()
            .await
            .map_err(|_| ApiError::MissingConflictVersion)?;
        Ok(body.master_version)
    }

    async fn gone_reason(response: reqwest::Response) -> Result<GoneReason, ApiError> {
        let body: GoneBody = response
            .json()
            .await
            .map_err(|_| ApiError::UnknownGoneReason(String::new()))?;
        GoneReason::parse(&body.gone_reason)
    }
}
