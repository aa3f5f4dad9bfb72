use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8Path;
use reqwest::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT,
};
use reqwest::{Body, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::{Endpoints, Token};
use crate::domain::{DecontaminationStats, FileType};
use crate::error::UploaderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDetails {
    pub user: String,
    pub organisation: String,
    pub allowed_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuidRequest {
    pub batch: GuidRequestBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidRequestBatch {
    pub organisation: String,
    pub uploaded_on: String,
    pub uploaded_by: String,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuidResponse {
    pub batch: GuidResponseBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuidResponseBatch {
    pub guid: String,
    pub samples: Vec<HashGuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HashGuid {
    pub hash: String,
    pub guid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionPayload {
    pub status: String,
    pub batch: SubmissionBatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionBatch {
    pub file_name: String,
    pub bucket_name: String,
    pub uploaded_on: String,
    pub uploaded_by: String,
    pub organisation: String,
    pub samples: Vec<SubmissionSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionSample {
    pub name: String,
    pub run_number: String,
    pub tags: Vec<String>,
    pub control: String,
    pub collection_date: String,
    pub country: String,
    pub region: String,
    pub district: String,
    pub specimen: String,
    pub host: String,
    pub instrument: Instrument,
    pub primer_scheme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decontamination: Option<DecontaminationStats>,
    #[serde(flatten)]
    pub reads: SubmissionReads,
}

#[derive(Debug, Clone, Serialize)]
pub struct Instrument {
    pub platform: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum SubmissionReads {
    #[serde(rename = "se_reads")]
    Single { uri: String, md5: String },
    #[serde(rename = "pe_reads")]
    Paired {
        r1_uri: String,
        r1_md5: String,
        r2_uri: String,
        r2_md5: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubmissionResponse {
    pub status: Option<String>,
    #[serde(rename = "errorMsg")]
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub exception: ExceptionDetails,
    pub uploader: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExceptionDetails {
    pub class: String,
    pub message: String,
    pub traceback: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SampleDetail {
    pub status: Option<String>,
    pub name: Option<String>,
}

/// Every remote call the uploader and fetcher make against the portal.
#[async_trait]
pub trait PortalClient: Send + Sync {
    async fn user_details(&self) -> Result<UserDetails, UploaderError>;
    async fn create_sample_guids(
        &self,
        request: &GuidRequest,
    ) -> Result<GuidResponse, UploaderError>;
    async fn fetch_par(&self) -> Result<String, UploaderError>;
    async fn put_file(&self, url: &str, path: &Utf8Path) -> Result<(), UploaderError>;
    async fn put_marker(&self, url: &str) -> Result<(), UploaderError>;
    async fn submit_batch(
        &self,
        payload: &SubmissionPayload,
    ) -> Result<SubmissionResponse, UploaderError>;
    async fn log_error(&self, report: &ErrorReport) -> Result<(), UploaderError>;
    async fn sample_detail(&self, guid: &str) -> Result<SampleDetail, UploaderError>;
    async fn get_output(&self, guid: &str, file_type: FileType) -> Result<Vec<u8>, UploaderError>;
}

/// Ceiling for streaming one read file to object storage.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct PortalHttpClient {
    client: Client,
    endpoints: Endpoints,
    upload_timeout: Duration,
}

impl PortalHttpClient {
    /// `timeout` bounds every API call; file uploads use [`UPLOAD_TIMEOUT`]
    /// unless overridden with [`PortalHttpClient::with_upload_timeout`].
    pub fn new(
        endpoints: Endpoints,
        token: &Token,
        timeout: Duration,
    ) -> Result<Self, UploaderError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("gpas-uploader/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| UploaderError::Token(err.to_string()))?,
        );
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token.access_token))
            .map_err(|err| UploaderError::Token(err.to_string()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoints,
            upload_timeout: UPLOAD_TIMEOUT,
        })
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    fn ords(&self, path: &str) -> String {
        format!("{}{path}", self.endpoints.ords)
    }

    fn api(&self, path: &str) -> String {
        format!("{}{path}", self.endpoints.api)
    }
}

async fn check_status(response: Response) -> Result<Response, UploaderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(UploaderError::Authentication {
            status: status.as_u16(),
        });
    }
    let message = response.text().await.unwrap_or_default();
    if status == StatusCode::BAD_REQUEST && message.contains("API access") {
        return Err(UploaderError::Permission(message));
    }
    Err(UploaderError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn json_body<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, UploaderError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| UploaderError::Protocol(err.to_string()))
}

#[derive(Deserialize)]
struct UserOrgResponse {
    #[serde(rename = "userOrgDtl", default)]
    details: Vec<UserOrgDetail>,
}

#[derive(Deserialize)]
struct UserOrgDetail {
    #[serde(rename = "userName")]
    user_name: Option<String>,
    organisation: Option<String>,
    #[serde(default)]
    tags: Vec<TagDetail>,
}

#[derive(Deserialize)]
struct TagDetail {
    #[serde(rename = "tagName")]
    tag_name: String,
}

#[derive(Deserialize)]
struct ParResponse {
    par: Option<String>,
    status: Option<String>,
}

#[async_trait]
impl PortalClient for PortalHttpClient {
    async fn user_details(&self) -> Result<UserDetails, UploaderError> {
        let url = self.ords("userOrgDtls");
        debug!(%url, "fetching user details");
        let response = check_status(self.client.get(&url).send().await?).await?;
        let body: UserOrgResponse = json_body(response).await?;
        let detail = body
            .details
            .into_iter()
            .next()
            .ok_or_else(|| UploaderError::Protocol("empty userOrgDtl".to_string()))?;
        Ok(UserDetails {
            user: detail.user_name.unwrap_or_default(),
            organisation: detail.organisation.unwrap_or_default(),
            allowed_tags: detail.tags.into_iter().map(|tag| tag.tag_name).collect(),
        })
    }

    async fn create_sample_guids(
        &self,
        request: &GuidRequest,
    ) -> Result<GuidResponse, UploaderError> {
        let url = self.ords("createSampleGuids");
        debug!(%url, samples = request.batch.samples.len(), "fetching guids");
        let response = self.client.post(&url).json(request).send().await?;
        json_body(check_status(response).await?).await
    }

    async fn fetch_par(&self) -> Result<String, UploaderError> {
        let url = self.ords("pars");
        debug!(%url, "fetching PAR");
        let response = check_status(self.client.get(&url).send().await?).await?;
        let body: ParResponse = json_body(response).await?;
        if body.status.as_deref() == Some("error") {
            return Err(UploaderError::Protocol("problem fetching PAR".to_string()));
        }
        body.par
            .ok_or_else(|| UploaderError::Protocol("PAR response has no par".to_string()))
    }

    async fn put_file(&self, url: &str, path: &Utf8Path) -> Result<(), UploaderError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|err| UploaderError::Filesystem(format!("open {path}: {err}")))?;
        let length = file.metadata().await?.len();
        let body = Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .client
            .put(url)
            .timeout(self.upload_timeout)
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn put_marker(&self, url: &str) -> Result<(), UploaderError> {
        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn submit_batch(
        &self,
        payload: &SubmissionPayload,
    ) -> Result<SubmissionResponse, UploaderError> {
        let url = self.ords("batches");
        debug!(%url, "submitting batch metadata");
        let response = self.client.post(&url).json(payload).send().await?;
        json_body(check_status(response).await?).await
    }

    async fn log_error(&self, report: &ErrorReport) -> Result<(), UploaderError> {
        let url = self.ords("logUploaderError");
        let response = self.client.post(&url).json(report).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn sample_detail(&self, guid: &str) -> Result<SampleDetail, UploaderError> {
        let url = self.api(&format!("get_sample_detail/{guid}"));
        let response = self
            .client
            .get(&url)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?;
        let details: Vec<SampleDetail> = json_body(check_status(response).await?).await?;
        details
            .into_iter()
            .next()
            .ok_or_else(|| UploaderError::Protocol(format!("empty sample detail for {guid}")))
    }

    async fn get_output(&self, guid: &str, file_type: FileType) -> Result<Vec<u8>, UploaderError> {
        let url = self.api(&format!("get_output/{guid}/{file_type}"));
        let response = self.client.get(&url).send().await?;
        let bytes = check_status(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Object-storage bucket name: third-from-last path segment of the PAR.
pub fn bucket_from_par(par: &str) -> Result<String, UploaderError> {
    let segments = par.split('/').collect::<Vec<_>>();
    if segments.len() < 3 {
        return Err(UploaderError::Protocol(format!("malformed PAR: {par}")));
    }
    Ok(segments[segments.len() - 3].to_string())
}
