use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::cache::CollectionResult;
use crate::config::Config;

use super::api_types::{
  ApiBulkDeleteResponse, ApiBulkUpdateResponse, ApiCodeList, ApiErrorBody, ApiExportResponse,
  ApiFavoriteCheck, ApiImportResponse, ApiRestoreRequest,
};
use super::error::ApiError;
use super::types::{
  BulkDeleteResult, BulkUpdate, BulkUpdateResult, CodeVersion, CsvExport, CsvUpload,
  DiagnosticCode, DiagnosticCodeCreate, DiagnosticCodeUpdate, ExportFilter, ImportResult,
  ListParams, Suggestion,
};

/// Diagnostic codes REST API client
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    // Every request carries the bearer token when one is configured
    match Config::get_api_token() {
      Some(token) => {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
          .map_err(|e| eyre!("Invalid API token: {}", e))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
      }
      None => warn!("no API token set, requests will be unauthenticated"),
    }

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(config.api.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base: parse_base_url(&config.api.url)?,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  fn url(&self, path: &str) -> Result<Url, ApiError> {
    self
      .base
      .join(path)
      .map_err(|e| ApiError::Validation(format!("Invalid request path {}: {}", path, e)))
  }

  /// Send a request and decode a JSON body.
  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
    let response = check_status(request.send().await?).await?;
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
  }

  /// Send a request whose body we do not need.
  async fn send_empty(&self, request: RequestBuilder) -> Result<(), ApiError> {
    check_status(request.send().await?).await?;
    Ok(())
  }

  /// List codes matching `params`
  pub async fn list_codes(
    &self,
    params: &ListParams,
  ) -> Result<CollectionResult<DiagnosticCode>, ApiError> {
    let url = self.url("api/v1/diagnostic-codes")?;
    debug!(%url, ?params, "list codes");
    let list: ApiCodeList = self
      .send(self.http.get(url).query(&params.to_query()))
      .await?;
    Ok(list.into())
  }

  /// Get a single code by id
  pub async fn get_code(&self, id: i64) -> Result<DiagnosticCode, ApiError> {
    let url = self.url(&format!("api/v1/diagnostic-codes/{}", id))?;
    self.send(self.http.get(url)).await
  }

  /// Get a single code by its code string
  pub async fn get_code_by_code(&self, code: &str) -> Result<DiagnosticCode, ApiError> {
    let mut url = self.url("api/v1/diagnostic-codes/by-code/")?;
    url
      .path_segments_mut()
      .map_err(|_| ApiError::Validation("Base URL cannot carry a path".into()))?
      .pop_if_empty()
      .push(code);
    self.send(self.http.get(url)).await
  }

  pub async fn create_code(
    &self,
    input: &DiagnosticCodeCreate,
  ) -> Result<DiagnosticCode, ApiError> {
    let url = self.url("api/v1/diagnostic-codes")?;
    self.send(self.http.post(url).json(input)).await
  }

  pub async fn update_code(
    &self,
    id: i64,
    patch: &DiagnosticCodeUpdate,
  ) -> Result<DiagnosticCode, ApiError> {
    let url = self.url(&format!("api/v1/diagnostic-codes/{}", id))?;
    self.send(self.http.put(url).json(patch)).await
  }

  pub async fn delete_code(&self, id: i64) -> Result<(), ApiError> {
    let url = self.url(&format!("api/v1/diagnostic-codes/{}", id))?;
    self.send_empty(self.http.delete(url)).await
  }

  /// Delete several codes in one request
  pub async fn bulk_delete(&self, ids: &[i64]) -> Result<BulkDeleteResult, ApiError> {
    let url = self.url("api/v1/bulk/bulk-delete")?;
    let response: ApiBulkDeleteResponse = self.send(self.http.delete(url).json(ids)).await?;
    Ok(response.into())
  }

  /// Apply the same change to several codes in one request
  pub async fn bulk_update(
    &self,
    ids: &[i64],
    update: &BulkUpdate,
  ) -> Result<BulkUpdateResult, ApiError> {
    let url = self.url("api/v1/bulk/bulk-update")?;
    let response: ApiBulkUpdateResponse = self
      .send(self.http.post(url).query(&update.to_query()).json(ids))
      .await?;
    Ok(response.into())
  }

  /// Create or update codes from an uploaded CSV file
  pub async fn import_csv(&self, upload: &CsvUpload) -> Result<ImportResult, ApiError> {
    let url = self.url("api/v1/bulk/import-csv")?;
    let part = reqwest::multipart::Part::bytes(upload.content.clone())
      .file_name(upload.filename.clone())
      .mime_str("text/csv")?;
    let form = reqwest::multipart::Form::new().part("file", part);
    // The multipart content type replaces the client's JSON default
    let response: ApiImportResponse = self.send(self.http.post(url).multipart(form)).await?;
    Ok(response.into())
  }

  /// Restore code `id` to an earlier version. Returns the new version entry.
  pub async fn restore_version(
    &self,
    id: i64,
    version_id: i64,
    comment: Option<&str>,
  ) -> Result<CodeVersion, ApiError> {
    let url = self.url(&format!("api/v1/codes/{}/restore", id))?;
    let body = ApiRestoreRequest {
      version_id,
      comment,
    };
    self.send(self.http.post(url).json(&body)).await
  }

  /// Export codes matching `filter` as CSV
  pub async fn export_csv(&self, filter: &ExportFilter) -> Result<CsvExport, ApiError> {
    let url = self.url("api/v1/bulk/export-csv")?;
    let response: ApiExportResponse = self
      .send(self.http.post(url).query(&filter.to_query()))
      .await?;
    Ok(response.into())
  }

  /// The current user's favorite codes, most recently added first
  pub async fn favorites(&self) -> Result<CollectionResult<DiagnosticCode>, ApiError> {
    let url = self.url("api/v1/users/favorites")?;
    let items: Vec<DiagnosticCode> = self.send(self.http.get(url)).await?;
    let total = items.len() as u64;
    Ok(CollectionResult::new(items, total))
  }

  pub async fn is_favorite(&self, id: i64) -> Result<bool, ApiError> {
    let url = self.url(&format!("api/v1/users/favorites/check/{}", id))?;
    let check: ApiFavoriteCheck = self.send(self.http.get(url)).await?;
    Ok(check.is_favorite)
  }

  pub async fn add_favorite(&self, id: i64) -> Result<(), ApiError> {
    let url = self.url(&format!("api/v1/users/favorites/{}", id))?;
    self.send_empty(self.http.post(url)).await
  }

  pub async fn remove_favorite(&self, id: i64) -> Result<(), ApiError> {
    let url = self.url(&format!("api/v1/users/favorites/{}", id))?;
    self.send_empty(self.http.delete(url)).await
  }

  /// Autocomplete suggestions for a partial query
  pub async fn autocomplete(&self, query: &str, limit: u32) -> Result<Vec<Suggestion>, ApiError> {
    let url = self.url("api/v1/search/autocomplete")?;
    self
      .send(
        self
          .http
          .get(url)
          .query(&[("query", query.to_string()), ("limit", limit.to_string())]),
      )
      .await
  }
}

/// Parse the configured base URL, making sure relative joins keep its path.
fn parse_base_url(raw: &str) -> Result<Url> {
  let mut url = Url::parse(raw).map_err(|e| eyre!("Invalid API url '{}': {}", raw, e))?;
  if url.cannot_be_a_base() {
    return Err(eyre!("Invalid API url '{}': not a base URL", raw));
  }
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  Ok(url)
}

/// Turn a non-success response into a normalized [`ApiError`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  if status == StatusCode::UNAUTHORIZED {
    warn!("API rejected credentials; check DXCODES_API_TOKEN");
  }

  let body = response.text().await.unwrap_or_default();
  Err(error_from_body(status, &body))
}

fn error_from_body(status: StatusCode, body: &str) -> ApiError {
  let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
  let message = parsed
    .message()
    .or_else(|| status.canonical_reason().map(String::from))
    .unwrap_or_else(|| "request failed".to_string());
  ApiError::Server {
    status: status.as_u16(),
    message,
    request_id: parsed.request_id,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_base_url_keeps_prefix() {
    let base = parse_base_url("https://codes.example.com/backend").unwrap();
    assert_eq!(
      base.join("api/v1/diagnostic-codes").unwrap().as_str(),
      "https://codes.example.com/backend/api/v1/diagnostic-codes"
    );

    let base = parse_base_url("http://localhost:8000").unwrap();
    assert_eq!(
      base.join("api/v1/users/favorites").unwrap().as_str(),
      "http://localhost:8000/api/v1/users/favorites"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(parse_base_url("not a url").is_err());
    assert!(parse_base_url("mailto:someone@example.com").is_err());
  }

  #[test]
  fn test_error_from_structured_body() {
    let err = error_from_body(
      StatusCode::NOT_FOUND,
      r#"{"status_code":404,"error":"Not Found","message":"Diagnostic code not found","details":null,"request_id":"r-1"}"#,
    );
    assert_eq!(
      err,
      ApiError::Server {
        status: 404,
        message: "Diagnostic code not found".into(),
        request_id: Some("r-1".into()),
      }
    );
  }

  #[test]
  fn test_error_from_unparseable_body_uses_reason() {
    let err = error_from_body(StatusCode::INTERNAL_SERVER_ERROR, "<html>oops</html>");
    assert_eq!(err.status(), Some(500));
    assert_eq!(err.to_string(), "server error 500: Internal Server Error");
  }

  #[test]
  fn test_by_code_path_is_escaped() {
    let config = Config::default();
    let client = ApiClient {
      http: reqwest::Client::new(),
      base: parse_base_url(&config.api.url).unwrap(),
    };
    let mut url = client.url("api/v1/diagnostic-codes/by-code/").unwrap();
    url.path_segments_mut().unwrap().pop_if_empty().push("A/B 1");
    assert_eq!(
      url.as_str(),
      "http://localhost:8000/api/v1/diagnostic-codes/by-code/A%2FB%201"
    );
  }
}
