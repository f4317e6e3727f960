//! Read side of the field API, routed through the interception layer.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::error::SyncError;
use crate::intercept::{InterceptorHandle, ResponseSource, Served};
use crate::sync::HttpRequest;

use super::api_types::{
  export_endpoint, project_endpoint, projects_endpoint, ApiProject, ProjectSummary,
};
use super::types::Project;

/// Decoded body plus where it came from.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
  pub data: T,
  pub source: ResponseSource,
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> Fetched<T> {
  pub fn is_stale(&self) -> bool {
    self.source != ResponseSource::Network
  }
}

/// Field API client. Reads degrade to the last cached response when offline.
#[derive(Clone)]
pub struct FieldClient {
  interceptor: InterceptorHandle,
  base_url: Url,
}

impl FieldClient {
  pub fn new(interceptor: InterceptorHandle, base_url: Url) -> Self {
    Self {
      interceptor,
      base_url,
    }
  }

  pub async fn list_projects(&self) -> Result<Fetched<Vec<ProjectSummary>>, SyncError> {
    self.get_json(&projects_endpoint()).await
  }

  pub async fn get_project(&self, project_id: &str) -> Result<Fetched<Project>, SyncError> {
    let fetched: Fetched<ApiProject> = self.get_json(&project_endpoint(project_id)).await?;
    Ok(Fetched {
      data: fetched.data.into_project(),
      source: fetched.source,
      cached_at: fetched.cached_at,
    })
  }

  /// Server-side export document for a project.
  pub async fn export(&self, project_id: &str) -> Result<Fetched<Value>, SyncError> {
    self.get_json(&export_endpoint(project_id)).await
  }

  async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Fetched<T>, SyncError> {
    let url = self
      .base_url
      .join(endpoint)
      .map_err(|e| SyncError::InvalidInput(format!("bad endpoint '{}': {}", endpoint, e)))?;

    let Served {
      response,
      source,
      cached_at,
    } = self.interceptor.fetch(HttpRequest::get(url.clone())).await?;

    if source == ResponseSource::OfflineMarker {
      return Err(SyncError::Network(format!("offline and {} is not cached", url)));
    }
    if let Some(err) = SyncError::from_status(response.status) {
      return Err(err);
    }

    Ok(Fetched {
      data: response.json()?,
      source,
      cached_at,
    })
  }
}
