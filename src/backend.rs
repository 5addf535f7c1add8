use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::db::{Database, StoredResume};
use crate::error::{RelayError, RelayResult};
use crate::models::{CapturedRecord, Document, DocumentPatch};
use crate::protocol::{ApiResponse, APPLICATIONS_ROUTE, RESUMES_ROUTE};

// --- Backend trait ---

/// The application's data plane. Resume payloads are returned raw so the
/// cache reconciler can validate and repair their shape.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn submit_application(&self, record: &CapturedRecord) -> RelayResult<Value>;
    async fn list_resumes(&self, owner_id: Option<&str>) -> RelayResult<Vec<Value>>;
    async fn get_resume(&self, id: &str) -> RelayResult<Option<Value>>;
    async fn create_resume(&self, doc: &Document) -> RelayResult<Value>;
    async fn update_resume(&self, id: &str, patch: &DocumentPatch) -> RelayResult<Value>;
    async fn delete_resume(&self, id: &str) -> RelayResult<()>;
}

/// Body of `POST /api/applications`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSubmission<'a> {
    #[serde(flatten)]
    pub record: &'a CapturedRecord,
    pub applied_at: DateTime<Utc>,
}

// --- HTTP backend ---

pub struct HttpBackend {
    base: Url,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> RelayResult<Self> {
        let base = Url::parse(base_url).map_err(|e| {
            RelayError::Validation(format!("invalid backend url '{}': {}", base_url, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hunt-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { base, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, route: &str) -> RelayResult<Url> {
        self.base
            .join(route)
            .map_err(|e| RelayError::Validation(format!("bad route '{}': {}", route, e)))
    }

    fn resume_url(&self, id: &str) -> RelayResult<Url> {
        let mut url = self.endpoint(RESUMES_ROUTE)?;
        url.path_segments_mut()
            .map_err(|_| RelayError::Validation(format!("cannot extend {}", self.base)))?
            .push(id);
        Ok(url)
    }

    async fn read(response: reqwest::Response, url: &Url) -> RelayResult<ApiResponse> {
        let status = response.status();
        let text = response.text().await?;
        let parsed = serde_json::from_str::<ApiResponse>(&text);

        if status == StatusCode::CONFLICT {
            let error = parsed
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| "application already exists".to_string());
            return Err(RelayError::Duplicate(error));
        }

        if !status.is_success() {
            let detail = parsed
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| text.trim().chars().take(200).collect());
            return Err(RelayError::Transport(format!(
                "{} responded with {}: {}",
                url, status, detail
            )));
        }

        let body = parsed.map_err(|e| {
            RelayError::Transport(format!("{} returned a non-JSON body: {}", url, e))
        })?;

        if body.success == Some(false) {
            let error = body
                .error
                .unwrap_or_else(|| "request rejected".to_string());
            if error.to_lowercase().contains("already exists") {
                return Err(RelayError::Duplicate(error));
            }
            return Err(RelayError::Transport(format!("{}: {}", url, error)));
        }

        Ok(body)
    }

    fn require_data(body: ApiResponse, url: &Url) -> RelayResult<Value> {
        body.data
            .ok_or_else(|| RelayError::Transport(format!("{} returned no data", url)))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn submit_application(&self, record: &CapturedRecord) -> RelayResult<Value> {
        let url = self.endpoint(APPLICATIONS_ROUTE)?;
        let submission = ApplicationSubmission {
            record,
            applied_at: Utc::now(),
        };
        debug!(%url, company = %record.company, "submitting application");

        let response = self.client.post(url.clone()).json(&submission).send().await?;
        let body = Self::read(response, &url).await?;
        Ok(body.data.unwrap_or_else(|| json!({ "success": true })))
    }

    async fn list_resumes(&self, owner_id: Option<&str>) -> RelayResult<Vec<Value>> {
        let mut url = self.endpoint(RESUMES_ROUTE)?;
        if let Some(owner) = owner_id {
            url.query_pairs_mut().append_pair("userId", owner);
        }

        let response = self.client.get(url.clone()).send().await?;
        let body = Self::read(response, &url).await?;
        match (body.resumes, body.data) {
            (Some(resumes), _) => Ok(resumes),
            (None, Some(Value::Array(items))) => Ok(items),
            _ => Err(RelayError::Transport(format!("{} returned no resume list", url))),
        }
    }

    async fn get_resume(&self, id: &str) -> RelayResult<Option<Value>> {
        let url = self.resume_url(id)?;
        let response = self.client.get(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::read(response, &url).await?;
        Ok(body.data)
    }

    async fn create_resume(&self, doc: &Document) -> RelayResult<Value> {
        let url = self.endpoint(RESUMES_ROUTE)?;
        let response = self.client.post(url.clone()).json(doc).send().await?;
        let body = Self::read(response, &url).await?;
        Self::require_data(body, &url)
    }

    async fn update_resume(&self, id: &str, patch: &DocumentPatch) -> RelayResult<Value> {
        let url = self.resume_url(id)?;
        let response = self.client.put(url.clone()).json(patch).send().await?;
        let body = Self::read(response, &url).await?;
        Self::require_data(body, &url)
    }

    async fn delete_resume(&self, id: &str) -> RelayResult<()> {
        let url = self.resume_url(id)?;
        let response = self.client.delete(url.clone()).send().await?;
        Self::read(response, &url).await?;
        Ok(())
    }
}

// --- Local SQLite backend ---

/// Backend served from a local SQLite file. Applies the same duplicate
/// check on the identity tuple as the remote service.
pub struct LocalBackend {
    db: Mutex<Database>,
}

impl LocalBackend {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> anyhow::Result<T>) -> RelayResult<T> {
        let db = self
            .db
            .lock()
            .map_err(|_| RelayError::Transport("local backend lock poisoned".to_string()))?;
        f(&db).map_err(|e| RelayError::Transport(format!("{:#}", e)))
    }

    fn parse_id(id: &str) -> RelayResult<i64> {
        id.parse::<i64>()
            .map_err(|_| RelayError::NoCandidateTargets(format!("resume {} not found", id)))
    }

    fn resume_value(stored: StoredResume) -> Value {
        let mut object = match serde_json::from_str::<Value>(&stored.payload) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        object.insert("id".to_string(), Value::String(stored.id.to_string()));
        if let Some(user) = stored.user_id {
            object.insert("userId".to_string(), Value::String(user));
        }
        object.insert("createdAt".to_string(), Value::String(stored.created_at));
        object.insert("updatedAt".to_string(), Value::String(stored.updated_at));
        Value::Object(object)
    }

    fn payload_of(value: Value) -> RelayResult<Map<String, Value>> {
        match value {
            Value::Object(mut map) => {
                for key in ["id", "_id", "createdAt", "updatedAt"] {
                    map.remove(key);
                }
                Ok(map)
            }
            _ => Err(RelayError::Validation("resume payload must be an object".to_string())),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> RelayResult<Value> {
    serde_json::to_value(value).map_err(|e| RelayError::Validation(e.to_string()))
}

#[async_trait]
impl Backend for LocalBackend {
    async fn submit_application(&self, record: &CapturedRecord) -> RelayResult<Value> {
        record.validate()?;
        let applied_at = Utc::now();
        let inserted = self.with_db(|db| db.insert_application(record, applied_at))?;

        let Some(id) = inserted else {
            return Err(RelayError::Duplicate(format!(
                "application for {} at {} already exists",
                record.position, record.company
            )));
        };

        let mut stored = to_value(&ApplicationSubmission { record, applied_at })?;
        if let Value::Object(map) = &mut stored {
            map.insert("id".to_string(), json!(id));
        }
        Ok(stored)
    }

    async fn list_resumes(&self, owner_id: Option<&str>) -> RelayResult<Vec<Value>> {
        let rows = self.with_db(|db| db.list_resumes(owner_id))?;
        Ok(rows.into_iter().map(Self::resume_value).collect())
    }

    async fn get_resume(&self, id: &str) -> RelayResult<Option<Value>> {
        let Ok(row_id) = id.parse::<i64>() else {
            return Ok(None);
        };
        let row = self.with_db(|db| db.get_resume(row_id))?;
        Ok(row.map(Self::resume_value))
    }

    async fn create_resume(&self, doc: &Document) -> RelayResult<Value> {
        let payload = Self::payload_of(to_value(doc)?)?;
        let text = Value::Object(payload).to_string();
        let stored = self.with_db(|db| db.insert_resume(doc.user_id.as_deref(), &text))?;
        Ok(Self::resume_value(stored))
    }

    async fn update_resume(&self, id: &str, patch: &DocumentPatch) -> RelayResult<Value> {
        let row_id = Self::parse_id(id)?;
        let changes = Self::payload_of(to_value(patch)?)?;

        let updated = self.with_db(|db| {
            let Some(existing) = db.get_resume(row_id)? else {
                return Ok(None);
            };
            let mut payload = match serde_json::from_str::<Value>(&existing.payload) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            payload.extend(changes);
            db.update_resume(row_id, &Value::Object(payload).to_string())
        })?;

        updated
            .map(Self::resume_value)
            .ok_or_else(|| RelayError::NoCandidateTargets(format!("resume {} not found", id)))
    }

    async fn delete_resume(&self, id: &str) -> RelayResult<()> {
        let row_id = Self::parse_id(id)?;
        if self.with_db(|db| db.delete_resume(row_id))? {
            Ok(())
        } else {
            Err(RelayError::NoCandidateTargets(format!("resume {} not found", id)))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::local_backend;
    use super::*;
    use crate::models::PersonalInfo;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn acme() -> CapturedRecord {
        let mut record = CapturedRecord::new("Acme", "Engineer");
        record.job_url = Some("https://x/1".to_string());
        record
    }

    fn http(server: &MockServer) -> HttpBackend {
        HttpBackend::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_local_backend_duplicate_check() {
        let backend = local_backend();
        let stored = backend.submit_application(&acme()).await.unwrap();
        assert_eq!(stored["company"], "Acme");
        assert!(stored["appliedAt"].is_string());

        let err = backend.submit_application(&acme()).await.unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_local_backend_rejects_invalid_record() {
        let backend = local_backend();
        let err = backend
            .submit_application(&CapturedRecord::new("", "Engineer"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_local_backend_resume_lifecycle() {
        let backend = local_backend();
        let doc = Document {
            id: "ignored".to_string(),
            user_id: Some("u1".to_string()),
            title: "CV".to_string(),
            personal_info: Some(PersonalInfo {
                full_name: Some("Ada".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = backend.create_resume(&doc).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        assert_ne!(id, "ignored");
        assert_eq!(created["userId"], "u1");

        let patch = DocumentPatch {
            title: Some("CV v2".to_string()),
            ..Default::default()
        };
        let updated = backend.update_resume(&id, &patch).await.unwrap();
        assert_eq!(updated["title"], "CV v2");
        assert_eq!(updated["personalInfo"]["fullName"], "Ada");

        assert_eq!(backend.list_resumes(Some("u1")).await.unwrap().len(), 1);
        assert!(backend.list_resumes(Some("u2")).await.unwrap().is_empty());

        backend.delete_resume(&id).await.unwrap();
        assert!(backend.get_resume(&id).await.unwrap().is_none());
        assert!(backend.delete_resume(&id).await.is_err());
        assert!(backend.get_resume("local_123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_submit_posts_record_with_applied_at() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/applications"))
            .and(body_partial_json(json!({"company": "Acme", "jobUrl": "https://x/1"})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"success": true, "data": {"id": "a1"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let data = http(&server).submit_application(&acme()).await.unwrap();
        assert_eq!(data["id"], "a1");

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body["appliedAt"].is_string());
    }

    #[tokio::test]
    async fn test_http_conflict_is_duplicate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/applications"))
            .respond_with(
                ResponseTemplate::new(409)
                    .set_body_json(json!({"success": false, "error": "Application already exists"})),
            )
            .mount(&server)
            .await;

        let err = http(&server).submit_application(&acme()).await.unwrap_err();
        assert_eq!(err, RelayError::Duplicate("Application already exists".to_string()));
    }

    #[tokio::test]
    async fn test_http_server_error_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = http(&server).submit_application(&acme()).await.unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_http_non_json_success_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let err = http(&server).submit_application(&acme()).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_http_unreachable_is_transport() {
        let backend = HttpBackend::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = backend.submit_application(&acme()).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_http_list_resumes_with_owner() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/resumes"))
            .and(query_param("userId", "u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"success": true, "resumes": [{"id": "r1"}, {"id": "r2"}]}),
            ))
            .mount(&server)
            .await;

        let resumes = http(&server).list_resumes(Some("u1")).await.unwrap();
        assert_eq!(resumes.len(), 2);
    }

    #[tokio::test]
    async fn test_http_get_resume_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/resumes/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(http(&server).get_resume("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_update_and_delete_routes() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/resumes/r1"))
            .and(body_partial_json(json!({"title": "New"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"success": true, "data": {"id": "r1", "title": "New"}}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/resumes/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = http(&server);
        let patch = DocumentPatch {
            title: Some("New".to_string()),
            ..Default::default()
        };
        let updated = backend.update_resume("r1", &patch).await.unwrap();
        assert_eq!(updated["title"], "New");
        backend.delete_resume("r1").await.unwrap();
    }

    #[tokio::test]
    async fn test_http_success_false_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/resumes"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": "quota exceeded"})),
            )
            .mount(&server)
            .await;

        let err = http(&server)
            .create_resume(&Document::default())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("quota exceeded"));
    }
}
