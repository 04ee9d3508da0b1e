//! S3-based state storage backend.
//!
//! Stores the state document and its lock as objects under a key prefix so a
//! team can share one stack. A single `PutObject` replaces the document
//! atomically; concurrent writers from one process are serialized locally and
//! writers from other processes are kept out by the run lock. The lock object
//! is only ever written with a conditional put, so two runs cannot both
//! believe they hold it.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::{Mutation, StateStore};
use super::types::{StateDocument, STATE_VERSION};

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

/// Precondition of a conditional put.
enum WriteIf {
    /// No object exists under the key.
    Absent,
    /// The object still has this entity tag.
    Matches(String),
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store using the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            write_lock: Mutex::new(()),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_tagged_object(key).await?.map(|(content, _)| content))
    }

    /// Reads an object together with its entity tag.
    async fn get_tagged_object(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    ConvergeError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    ConvergeError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(ConvergeError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| ConvergeError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Writes an object only if the precondition holds. Returns false when
    /// S3 refused the write because the object changed or already exists.
    async fn put_object_if(&self, key: &str, content: &str, condition: WriteIf) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");
        let request = match condition {
            WriteIf::Absent => request.if_none_match("*"),
            WriteIf::Matches(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let status = e.raw_response().map(|r| r.status().as_u16());
                if matches!(status, Some(409 | 412)) {
                    debug!("Conditional put on {key} refused ({status:?})");
                    Ok(false)
                } else {
                    Err(ConvergeError::State(StateError::s3(format!("S3 put error: {e}"))))
                }
            }
        }
    }

    async fn read_lock(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        match self.get_tagged_object(&self.key(LOCK_KEY)).await? {
            Some((content, etag)) => Ok(Some((LockInfo::from_json(&content)?, etag))),
            None => Ok(None),
        }
    }

    /// Error for an acquisition that lost a race.
    async fn contended(&self) -> ConvergeError {
        match self.read_lock().await {
            Ok(Some((existing, _))) => existing.conflict(),
            Ok(None) => ConvergeError::State(StateError::LockFailed {
                message: String::from("lock object changed during acquisition"),
            }),
            Err(e) => e,
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ConvergeError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    async fn read_document(&self) -> Result<Option<StateDocument>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: StateDocument = serde_json::from_str(&json).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
            })
        })?;

        if state.version != STATE_VERSION {
            return Err(ConvergeError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        Ok(Some(state))
    }

    async fn write_document(&self, state: &StateDocument) -> Result<()> {
        let key = self.key(STATE_KEY);
        let content = serde_json::to_string_pretty(state).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        self.put_object(&key, &content).await?;
        debug!("State written to s3://{}/{key} (serial {})", self.bucket, state.serial);
        Ok(())
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateDocument>> {
        let state = self.read_document().await?;
        if let Some(state) = &state {
            info!(
                "Loaded state for stack: {}/{}",
                state.stack, state.environment
            );
        }
        Ok(state)
    }

    async fn save(&self, state: &StateDocument) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        info!("Saving state to s3://{}/{}", self.bucket, self.key(STATE_KEY));
        self.write_document(state).await
    }

    async fn mutate(&self, mutation: Mutation) -> Result<StateDocument> {
        let _guard = self.write_lock.lock().await;
        let mut state = self
            .read_document()
            .await?
            .unwrap_or_else(|| StateDocument::new("", ""));
        mutation(&mut state);
        self.write_document(&state).await?;
        Ok(state)
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let state_key = self.key(STATE_KEY);
        let lock_key = self.key(LOCK_KEY);

        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&lock_key).await
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(ConvergeError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        let content = lock_info.to_json()?;

        if !self.put_object_if(&key, &content, WriteIf::Absent).await? {
            let acquired = match self.read_lock().await? {
                Some((existing, _)) if existing.blocks(&holder_id) => {
                    return Err(existing.conflict());
                }
                Some((_, Some(etag))) => {
                    debug!("Expired or own lock found, taking over");
                    self.put_object_if(&key, &content, WriteIf::Matches(etag)).await?
                }
                Some((_, None)) => false,
                None => self.put_object_if(&key, &content, WriteIf::Absent).await?,
            };
            if !acquired {
                return Err(self.contended().await);
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.key(LOCK_KEY);

        if let Some(content) = self.get_object(&key).await? {
            let existing = LockInfo::from_json(&content)?;
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        let key = self.key(LOCK_KEY);
        info!("Force-removing state lock s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock().await?.map(|(lock, _)| lock))
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let Some((current, Some(etag))) = self.read_lock().await? else {
            return Err(lock.lost());
        };
        if current.lock_id != lock.lock_id {
            return Err(lock.lost());
        }

        let renewed = current.renewed();
        let key = self.key(LOCK_KEY);
        let content = renewed.to_json()?;
        if !self.put_object_if(&key, &content, WriteIf::Matches(etag)).await? {
            return Err(lock.lost());
        }
        debug!("Renewed state lock {}", renewed.lock_id);
        Ok(renewed)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PRECONDITION_FAILED: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
        <Error><Code>PreconditionFailed</Code><Message>At least one of the pre-conditions \
        you specified did not hold</Message></Error>";

    fn store(server: &MockServer) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("key", "secret", None, None, "test"))
            .endpoint_url(server.uri())
            .force_path_style(true)
            .build();
        S3StateStore::with_client(Client::from_conf(config), "stacks", None)
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("stacks/tutorial/")), "stacks/tutorial/");
        assert_eq!(normalize_prefix(Some("/team")), "team/");
    }

    #[tokio::test]
    async fn test_lock_is_written_only_if_absent() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/stacks/state.lock"))
            .and(header("if-none-match", "*"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"v1\""))
            .expect(1)
            .mount(&server)
            .await;

        let lock = store(&server).acquire_lock("me").await.expect("lock");
        assert_eq!(lock.holder, "me");
    }

    #[tokio::test]
    async fn test_refused_lock_write_reports_holder() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/stacks/state.lock"))
            .respond_with(
                ResponseTemplate::new(412)
                    .set_body_string(PRECONDITION_FAILED)
                    .insert_header("content-type", "application/xml"),
            )
            .mount(&server)
            .await;
        let holder = LockInfo::new("other").to_json().expect("encode");
        Mock::given(method("GET"))
            .and(path("/stacks/state.lock"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(holder)
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let err = store(&server).acquire_lock("me").await.expect_err("held");
        match err {
            ConvergeError::State(StateError::LockedByOther { holder, .. }) => {
                assert_eq!(holder, "other");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_renewal_is_conditional_on_etag() {
        let server = MockServer::start().await;
        let lock = LockInfo::new("me");
        Mock::given(method("GET"))
            .and(path("/stacks/state.lock"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(lock.to_json().expect("encode"))
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/stacks/state.lock"))
            .and(header("if-match", "\"v1\""))
            .respond_with(
                ResponseTemplate::new(412)
                    .set_body_string(PRECONDITION_FAILED)
                    .insert_header("content-type", "application/xml"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = store(&server).renew_lock(&lock).await.expect_err("lost");
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));
    }
}
