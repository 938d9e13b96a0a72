//! Minimal Qdrant REST client covering the operations the verifier needs.
//!
//! Vectors travel as flat single-precision arrays. Every call carries the
//! configured per-request deadline; network and non-2xx failures surface as
//! `StoreUnavailable` so the orchestrator never retries internally.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Shared, thread-safe handle to one Qdrant instance.
#[derive(Clone)]
pub struct QdrantClient {
    http: reqwest::Client,
    base_url: String,
}

/// A point fetched by id, with its vector and payload.
#[derive(Debug, Clone)]
pub struct RetrievedPoint {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct PointStruct<'a> {
    id: u64,
    vector: &'a [f32],
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CollectionsResult {
    collections: Vec<CollectionDescription>,
}

#[derive(Debug, Deserialize)]
struct CollectionDescription {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: usize,
}

#[derive(Debug, Deserialize)]
struct PointRecord {
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    points: Vec<PointRecord>,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<PointRecord>,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: u64,
}

impl QdrantClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::store(format!("failed to build vector store client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// True when the instance answers the collections listing.
    pub async fn healthy(&self) -> bool {
        self.list_collections().await.is_ok()
    }

    pub async fn list_collections(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.url("/collections"))
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?;
        let body: ApiResponse<CollectionsResult> = response.json().await?;
        Ok(body.result.collections.into_iter().map(|c| c.name).collect())
    }

    /// Vector size of a collection, or `None` when it does not exist.
    pub async fn collection_dim(&self, name: &str) -> Result<Option<usize>> {
        let response = self
            .http
            .get(self.url(&format!("/collections/{}", name)))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(Error::from)?;
        let body: ApiResponse<CollectionInfo> = response.json().await?;
        Ok(Some(body.result.config.params.vectors.size))
    }

    pub async fn create_collection(&self, name: &str, dim: usize) -> Result<()> {
        info!("creating collection '{}' (dim {}, cosine)", name, dim);
        self.http
            .put(self.url(&format!("/collections/{}", name)))
            .json(&json!({
                "vectors": { "size": dim, "distance": "Cosine" }
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?;
        Ok(())
    }

    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        self.http
            .delete(self.url(&format!("/collections/{}", name)))
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?;
        Ok(())
    }

    /// Verify the collection exists with the expected vector size; recreate
    /// it on dimension mismatch. Startup-only.
    pub async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        match self.collection_dim(name).await? {
            Some(existing) if existing == dim => {
                debug!("collection '{}' already configured with dim {}", name, dim);
                Ok(())
            }
            Some(existing) => {
                warn!(
                    "collection '{}' has dim {}, expected {}; recreating",
                    name, existing, dim
                );
                self.delete_collection(name).await?;
                self.create_collection(name, dim).await
            }
            None => self.create_collection(name, dim).await,
        }
    }

    /// Create-or-replace a single point.
    pub async fn upsert(
        &self,
        collection: &str,
        id: u64,
        vector: &[f32],
        payload: serde_json::Value,
    ) -> Result<()> {
        self.upsert_batch(collection, &[(id, vector, payload)]).await
    }

    /// Create-or-replace a batch of points in one call.
    pub async fn upsert_batch(
        &self,
        collection: &str,
        points: &[(u64, &[f32], serde_json::Value)],
    ) -> Result<()> {
        let body = json!({
            "points": points
                .iter()
                .map(|(id, vector, payload)| PointStruct {
                    id: *id,
                    vector,
                    payload: payload.clone(),
                })
                .collect::<Vec<_>>()
        });
        self.http
            .put(self.url(&format!("/collections/{}/points?wait=true", collection)))
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?;
        Ok(())
    }

    /// Exact lookup by point id.
    pub async fn retrieve(&self, collection: &str, id: u64) -> Result<Option<RetrievedPoint>> {
        let response = self
            .http
            .get(self.url(&format!("/collections/{}/points/{}", collection, id)))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(Error::from)?;
        let body: ApiResponse<PointRecord> = response.json().await?;
        let record = body.result;
        match record.vector {
            Some(vector) => Ok(Some(RetrievedPoint {
                id,
                vector,
                payload: record.payload.unwrap_or(serde_json::Value::Null),
            })),
            None => Ok(None),
        }
    }

    pub async fn delete_point(&self, collection: &str, id: u64) -> Result<()> {
        self.http
            .post(self.url(&format!("/collections/{}/points/delete?wait=true", collection)))
            .json(&json!({ "points": [id] }))
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?;
        Ok(())
    }

    /// Approximate nearest neighbors by cosine similarity, returning the
    /// stored vectors themselves.
    pub async fn top_k(&self, collection: &str, query: &[f32], k: usize) -> Result<Vec<Vec<f32>>> {
        let response = self
            .http
            .post(self.url(&format!("/collections/{}/points/query", collection)))
            .json(&json!({
                "query": query,
                "limit": k,
                "with_vector": true,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?;
        let body: ApiResponse<QueryResult> = response.json().await?;
        Ok(body
            .result
            .points
            .into_iter()
            .filter_map(|p| p.vector)
            .collect())
    }

    /// Exact point count for a collection.
    pub async fn count(&self, collection: &str) -> Result<u64> {
        let response = self
            .http
            .post(self.url(&format!("/collections/{}/points/count", collection)))
            .json(&json!({ "exact": true }))
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?;
        let body: ApiResponse<CountResult> = response.json().await?;
        Ok(body.result.count)
    }

    /// Page through payloads without vectors (used for enrolled-user
    /// listings).
    pub async fn scroll_payloads(
        &self,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let response = self
            .http
            .post(self.url(&format!("/collections/{}/points/scroll", collection)))
            .json(&json!({
                "limit": limit,
                "with_payload": true,
                "with_vector": false,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?;
        let body: ApiResponse<ScrollResult> = response.json().await?;
        Ok(body
            .result
            .points
            .into_iter()
            .filter_map(|p| p.payload)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = QdrantClient::new("http://localhost:6333/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("/collections"), "http://localhost:6333/collections");
    }

    #[test]
    fn point_struct_serializes_flat_vector() {
        let point = PointStruct {
            id: 42,
            vector: &[0.25, -0.5],
            payload: json!({ "customer_id": "alice", "num_samples": 3 }),
        };
        let value = serde_json::to_value(&point).unwrap();
        assert_eq!(value["id"], 42);
        assert_eq!(value["vector"], json!([0.25, -0.5]));
        assert_eq!(value["payload"]["customer_id"], "alice");
    }

    #[test]
    fn point_record_tolerates_missing_fields() {
        let record: PointRecord =
            serde_json::from_value(json!({ "id": 7, "payload": { "source": "x" } })).unwrap();
        assert!(record.vector.is_none());
        assert_eq!(record.payload.unwrap()["source"], "x");
    }
}
