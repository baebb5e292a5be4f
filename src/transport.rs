use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::error::KiraError;

/// Every file of a batch goes into a resource with this name.
pub const RESOURCE_NAME: &str = "DICOM";

/// Where one upload batch lives in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub project: String,
    pub subject: String,
    pub session_label: String,
    pub dataset: String,
    pub modality: String,
    pub study_date: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

/// Path of an activated resource, relative to the server root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    segments: Vec<String>,
}

impl ResourceHandle {
    pub fn for_spec(spec: &ResourceSpec) -> Self {
        let segments = [
            "data",
            "projects",
            spec.project.as_str(),
            "subjects",
            spec.subject.as_str(),
            "experiments",
            spec.session_label.as_str(),
            "scans",
            spec.dataset.as_str(),
            "resources",
            RESOURCE_NAME,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    fn prefix(&self, len: usize) -> &[String] {
        &self.segments[..len.min(self.segments.len())]
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

/// Remote archive operations used by the uploader.
pub trait ArchiveTransport: Send + Sync {
    /// Gets or creates the resource, creating subject, session and scan on
    /// the way. Calling it again for an existing resource is harmless.
    fn resource(&self, spec: &ResourceSpec) -> Result<ResourceHandle, KiraError>;

    /// Remote file name to MD5 digest.
    fn list_files(&self, handle: &ResourceHandle) -> Result<BTreeMap<String, String>, KiraError>;

    fn upload_file(
        &self,
        handle: &ResourceHandle,
        local: &Utf8Path,
        remote_name: &str,
        overwrite: bool,
    ) -> Result<(), KiraError>;
}

impl<T: ArchiveTransport + ?Sized> ArchiveTransport for &T {
    fn resource(&self, spec: &ResourceSpec) -> Result<ResourceHandle, KiraError> {
        (**self).resource(spec)
    }

    fn list_files(&self, handle: &ResourceHandle) -> Result<BTreeMap<String, String>, KiraError> {
        (**self).list_files(handle)
    }

    fn upload_file(
        &self,
        handle: &ResourceHandle,
        local: &Utf8Path,
        remote_name: &str,
        overwrite: bool,
    ) -> Result<(), KiraError> {
        (**self).upload_file(handle, local, remote_name, overwrite)
    }
}

/// Session and scan XSI types for a DICOM modality.
pub fn xsi_types(modality: &str) -> (&'static str, &'static str) {
    match modality.trim().to_ascii_uppercase().as_str() {
        "MRPT" => ("xnat:petmrSessionData", "xnat:mrScanData"),
        "MR" => ("xnat:mrSessionData", "xnat:mrScanData"),
        "CT" => ("xnat:ctSessionData", "xnat:ctScanData"),
        "PT" | "PET" => ("xnat:petSessionData", "xnat:petScanData"),
        "US" => ("xnat:usSessionData", "xnat:usScanData"),
        "CR" => ("xnat:crSessionData", "xnat:crScanData"),
        "DX" => ("xnat:dxSessionData", "xnat:dxScanData"),
        "MG" => ("xnat:mgSessionData", "xnat:mgScanData"),
        "NM" => ("xnat:nmSessionData", "xnat:nmScanData"),
        "XA" => ("xnat:xaSessionData", "xnat:xaScanData"),
        "RF" => ("xnat:rfSessionData", "xnat:rfScanData"),
        "OPT" => ("xnat:optSessionData", "xnat:optScanData"),
        _ => ("xnat:otherDicomSessionData", "xnat:otherDicomScanData"),
    }
}

#[derive(Debug, Deserialize)]
struct FileListing {
    #[serde(rename = "ResultSet")]
    result_set: ResultSet,
}

#[derive(Debug, Deserialize)]
struct ResultSet {
    #[serde(rename = "Result", default)]
    result: Vec<RemoteFile>,
}

#[derive(Debug, Deserialize)]
struct RemoteFile {
    #[serde(rename = "Name")]
    name: String,
    #[serde(default)]
    digest: Option<String>,
}

/// XNAT REST client. Credentials come from `XNAT_USER` and `XNAT_PASSWORD`.
pub struct XnatHttpClient {
    client: Client,
    base_url: Url,
    credentials: Option<(String, String)>,
    checked_projects: Mutex<HashSet<String>>,
}

impl XnatHttpClient {
    pub fn new(server: &str) -> Result<Self, KiraError> {
        let base_url = Url::parse(server)
            .map_err(|err| KiraError::Config(format!("invalid server url {server}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(KiraError::Config(format!("invalid server url {server}")));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-xu/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::Transport(err.to_string()))?,
        );

        let credentials = match std::env::var("XNAT_USER") {
            Ok(user) if !user.trim().is_empty() => {
                let password = std::env::var("XNAT_PASSWORD").unwrap_or_default();
                Some((user.trim().to_string(), password))
            }
            _ => None,
        };

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| KiraError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            base_url,
            credentials,
            checked_projects: Mutex::new(HashSet::new()),
        })
    }

    fn url(&self, segments: &[String]) -> Result<Url, KiraError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| KiraError::Transport(format!("invalid base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, KiraError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match self.authorize(make_req()).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(status, attempt, "retrying archive request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(%err, attempt, "retrying archive request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::Transport(err.to_string()));
                }
            }
        }
    }

    fn ensure_project(&self, project: &str) -> Result<(), KiraError> {
        let mut checked = self
            .checked_projects
            .lock()
            .map_err(|_| KiraError::Transport("project cache poisoned".to_string()))?;
        if checked.contains(project) {
            return Ok(());
        }
        let url = self.url(&["data".to_string(), "projects".to_string(), project.to_string()])?;
        let response = self.send_with_retries(|| {
            self.client.get(url.clone()).query(&[("format", "json")])
        })?;
        match response.status().as_u16() {
            200 => {
                checked.insert(project.to_string());
                Ok(())
            }
            401 | 403 | 404 => Err(KiraError::TargetUnavailable(format!(
                "project {project} does not exist or you don't have access to it"
            ))),
            status => Err(status_error(status, response)),
        }
    }

    fn put(&self, segments: &[String], query: &[(String, String)]) -> Result<(), KiraError> {
        let url = self.url(segments)?;
        let response = self.send_with_retries(|| self.client.put(url.clone()).query(query))?;
        check_created(response, &url)
    }
}

impl ArchiveTransport for XnatHttpClient {
    fn resource(&self, spec: &ResourceSpec) -> Result<ResourceHandle, KiraError> {
        self.ensure_project(&spec.project)?;
        let handle = ResourceHandle::for_spec(spec);
        let (session_type, scan_type) = xsi_types(&spec.modality);

        self.put(handle.prefix(5), &[])?;

        let mut session_query = vec![("xsiType".to_string(), session_type.to_string())];
        if let Some(date) = archive_date(&spec.study_date) {
            session_query.push((format!("{session_type}/date"), date));
        }
        self.put(handle.prefix(7), &session_query)?;

        let mut scan_query = vec![
            ("xsiType".to_string(), scan_type.to_string()),
            (format!("{scan_type}/type"), spec.dataset.clone()),
        ];
        if let Some(manufacturer) = &spec.manufacturer {
            scan_query.push((format!("{scan_type}/scanner/manufacturer"), manufacturer.clone()));
        }
        if let Some(model) = &spec.model {
            scan_query.push((format!("{scan_type}/scanner/model"), model.clone()));
        }
        self.put(handle.prefix(9), &scan_query)?;

        self.put(
            handle.segments(),
            &[
                ("format".to_string(), "DICOM".to_string()),
                ("content".to_string(), "RAW".to_string()),
            ],
        )?;
        tracing::debug!(resource = %handle, "resource ready");
        Ok(handle)
    }

    fn list_files(&self, handle: &ResourceHandle) -> Result<BTreeMap<String, String>, KiraError> {
        let mut segments = handle.segments().to_vec();
        segments.push("files".to_string());
        let url = self.url(&segments)?;
        let response = self.send_with_retries(|| {
            self.client.get(url.clone()).query(&[("format", "json")])
        })?;
        let status = response.status().as_u16();
        if status == 404 {
            return Ok(BTreeMap::new());
        }
        if !response.status().is_success() {
            return Err(status_error(status, response));
        }
        let listing: FileListing = response
            .json()
            .map_err(|err| KiraError::Transport(format!("unreadable file listing: {err}")))?;
        Ok(listing
            .result_set
            .result
            .into_iter()
            .map(|file| (file.name, file.digest.unwrap_or_default()))
            .collect())
    }

    fn upload_file(
        &self,
        handle: &ResourceHandle,
        local: &Utf8Path,
        remote_name: &str,
        overwrite: bool,
    ) -> Result<(), KiraError> {
        let content = std::fs::read(local.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("{local}: {err}")))?;
        let mut segments = handle.segments().to_vec();
        segments.push("files".to_string());
        segments.push(remote_name.to_string());
        let url = self.url(&segments)?;
        let overwrite = if overwrite { "true" } else { "false" };
        let response = self.send_with_retries(|| {
            self.client
                .put(url.clone())
                .query(&[("inbody", "true"), ("overwrite", overwrite), ("format", "DICOM")])
                .body(content.clone())
        })?;
        check_created(response, &url)
    }
}

fn check_created(response: Response, url: &Url) -> Result<(), KiraError> {
    let status = response.status().as_u16();
    match status {
        200..=299 | 409 => Ok(()),
        401 | 403 => Err(KiraError::TargetUnavailable(format!(
            "permission denied for {}",
            url.path()
        ))),
        _ => Err(status_error(status, response)),
    }
}

fn status_error(status: u16, response: Response) -> KiraError {
    let message = response
        .text()
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| "archive request failed".to_string());
    KiraError::TransportStatus { status, message }
}

/// XNAT expects session dates as YYYY-MM-DD.
fn archive_date(value: &str) -> Option<String> {
    ["%Y%m%d", "%Y-%m-%d", "%Y.%m.%d"]
        .iter()
        .find_map(|format| chrono::NaiveDate::parse_from_str(value.trim(), format).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
