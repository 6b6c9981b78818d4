use super::{BlobberClient, BlobberRef, CommitPayload, FileMeta, ListResult};
use crate::{Result, SyncError};
use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use std::time::Duration;

const CLIENT_ID_HEADER: &str = "X-App-Client-ID";

/// JSON-over-HTTP blobber client.
#[derive(Clone)]
pub struct HttpBlobberClient {
    http: reqwest::Client,
    allocation_id: String,
    client_id: Option<String>,
}

impl HttpBlobberClient {
    pub fn new(
        allocation_id: impl Into<String>,
        client_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            allocation_id: allocation_id.into(),
            client_id,
        })
    }

    fn url(&self, blobber: &BlobberRef, endpoint: &str) -> String {
        format!(
            "{}/v1/{}/{}",
            blobber.base_url.trim_end_matches('/'),
            endpoint,
            self.allocation_id
        )
    }

    fn request(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match self.client_id.as_deref() {
            Some(client_id) => builder.header(CLIENT_ID_HEADER, client_id),
            None => builder,
        }
    }

    async fn collaborator_call(
        &self,
        method: Method,
        blobber: &BlobberRef,
        path: &str,
        collaborator_id: &str,
    ) -> Result<()> {
        let response = self
            .request(method, self.url(blobber, "file/collaborator"))
            .form(&[("path", path), ("collab_id", collaborator_id)])
            .send()
            .await
            .map_err(|error| SyncError::blobber(&blobber.id, error.to_string()))?;

        ensure_success(blobber, response).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobberClient for HttpBlobberClient {
    async fn list_dir(&self, blobber: &BlobberRef, path: &str) -> Result<ListResult> {
        let response = self
            .request(Method::GET, self.url(blobber, "file/list"))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|error| SyncError::blobber(&blobber.id, error.to_string()))?;

        let response = ensure_success(blobber, response).await?;
        response.json::<ListResult>().await.map_err(|error| {
            SyncError::blobber(&blobber.id, format!("invalid listing for {}: {}", path, error))
        })
    }

    async fn file_meta(&self, blobber: &BlobberRef, path: &str) -> Result<Option<FileMeta>> {
        let response = self
            .request(Method::GET, self.url(blobber, "file/meta"))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|error| SyncError::blobber(&blobber.id, error.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = ensure_success(blobber, response).await?;
        let meta = response.json::<FileMeta>().await.map_err(|error| {
            SyncError::blobber(&blobber.id, format!("invalid file meta for {}: {}", path, error))
        })?;
        Ok(Some(meta))
    }

    async fn commit(&self, blobber: &BlobberRef, payload: &CommitPayload) -> Result<String> {
        let write_marker = serde_json::to_string(&payload.write_marker)?;
        let response = self
            .request(Method::POST, self.url(blobber, "connection/commit"))
            .form(&[
                ("connection_id", payload.connection_id.as_str()),
                ("write_marker", write_marker.as_str()),
            ])
            .send()
            .await
            .map_err(|error| SyncError::blobber(&blobber.id, error.to_string()))?;

        let response = ensure_success(blobber, response).await?;
        Ok(response.text().await?)
    }

    async fn add_collaborator(
        &self,
        blobber: &BlobberRef,
        path: &str,
        collaborator_id: &str,
    ) -> Result<()> {
        self.collaborator_call(Method::POST, blobber, path, collaborator_id)
            .await
    }

    async fn remove_collaborator(
        &self,
        blobber: &BlobberRef,
        path: &str,
        collaborator_id: &str,
    ) -> Result<()> {
        self.collaborator_call(Method::DELETE, blobber, path, collaborator_id)
            .await
    }
}

async fn ensure_success(blobber: &BlobberRef, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(SyncError::blobber(
        &blobber.id,
        format!("status={} body={}", status.as_u16(), body.trim()),
    ))
}
