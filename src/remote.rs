//! Mirror of the catalog kept as a JSON file in a GitHub repository,
//! read and written through the contents API.

use std::sync::Arc;

use base64::Engine as _;
use chrono::Utc;
use log::*;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;

use crate::cache::{Storage, StorageError};
use crate::events::{Event, EventBus};
use crate::model::remote::{
    Committer, ContentResponse, PutContentRequest, PutContentResponse, RemoteMirrorConfig,
    RemoteMirrorState,
};
use crate::model::{RawRecord, VehicleRecord};
use crate::normalize::{self, ShapeError};

pub const CONFIG_KEY: &str = "mbk_remote_sync_v1";
pub const STATE_KEY: &str = "mbk_remote_sync_state_v1";
const USER_AGENT: &str = "car-catalog";

/// Characters left alone by JavaScript's `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("remote sync is not enabled")]
    Disabled,
    #[error("no GitHub access token configured")]
    MissingToken,
    /// The remote refused the write because the revision token is stale or missing.
    #[error("remote file changed since revision {sha:?} ({status}): {body}")]
    Conflict {
        status: u16,
        sha: Option<String>,
        body: String,
    },
    #[error("GitHub returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("unexpected GitHub response: {0}")]
    Decode(String),
    #[error("failed to encode cars: {0}")]
    Encode(String),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one request and hands back whatever status the server answered with.
/// Only failures to get an answer at all are errors.
pub trait HttpTransport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, SyncError>;
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, SyncError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SyncError::Transport {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(ReqwestTransport { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, SyncError> {
        let transport_error = |e: reqwest::Error| SyncError::Transport {
            url: request.url.clone(),
            message: e.to_string(),
        };
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Put => self.client.put(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        debug!("{:?} {}", request.method, request.url);
        let response = builder.send().map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(transport_error)?;
        debug!("{} from {}", status, request.url);
        Ok(HttpResponse { status, body })
    }
}

/// Cars read from the remote file, with the revision they were read at.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    pub cars: Vec<RawRecord>,
    /// None when the file does not exist yet.
    pub sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    pub sha: Option<String>,
}

pub struct RemoteMirror {
    storage: Arc<dyn Storage>,
    transport: Box<dyn HttpTransport>,
    events: EventBus,
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, COMPONENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn contents_url(config: &RemoteMirrorConfig) -> String {
    format!(
        "{}/repos/{}/{}/contents/{}",
        config.api_base.trim_end_matches('/'),
        utf8_percent_encode(&config.owner, COMPONENT),
        utf8_percent_encode(&config.repo, COMPONENT),
        encode_path(&config.clean_path())
    )
}

fn headers(config: &RemoteMirrorConfig) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("Accept", "application/vnd.github+json".to_owned()),
        ("User-Agent", USER_AGENT.to_owned()),
    ];
    if !config.token.is_empty() {
        headers.push(("Authorization", format!("Bearer {}", config.token)));
    }
    headers
}

fn decode_content(content: &str) -> Result<Vec<RawRecord>, SyncError> {
    // GitHub wraps base64 content at 60 columns
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| SyncError::Decode(format!("content is not base64: {}", e)))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| SyncError::Decode(format!("content is not UTF-8: {}", e)))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(normalize::parse_collection_str(&text)?)
}

/// Pretty JSON with a trailing newline, the form committed to the repository.
pub fn serialize_cars(cars: &[VehicleRecord]) -> Result<String, SyncError> {
    let json =
        serde_json::to_string_pretty(cars).map_err(|e| SyncError::Encode(e.to_string()))?;
    Ok(format!("{}\n", json))
}

impl RemoteMirror {
    pub fn new(storage: Arc<dyn Storage>, transport: Box<dyn HttpTransport>, events: EventBus) -> Self {
        RemoteMirror {
            storage,
            transport,
            events,
        }
    }

    /// Stored configuration merged over defaults. Unreadable settings count as unset.
    pub fn config(&self) -> RemoteMirrorConfig {
        match self.storage.get(CONFIG_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring unreadable remote sync settings: {}", e);
                RemoteMirrorConfig::default()
            }),
            Ok(None) => RemoteMirrorConfig::default(),
            Err(e) => {
                warn!("Failed to read remote sync settings: {}", e);
                RemoteMirrorConfig::default()
            }
        }
    }

    pub fn save_config(&self, config: RemoteMirrorConfig) -> Result<RemoteMirrorConfig, SyncError> {
        let config = config.normalized();
        let raw = serde_json::to_string(&config).map_err(|e| SyncError::Encode(e.to_string()))?;
        self.storage.set(CONFIG_KEY, &raw)?;
        info!("Saved remote sync settings for {}/{}", config.owner, config.repo);
        self.events
            .publish(Event::RemoteConfigChanged(Some(config.masked())));
        Ok(config)
    }

    /// Erases configuration and sync state.
    pub fn clear_configuration(&self) -> Result<(), SyncError> {
        self.storage.remove(CONFIG_KEY)?;
        self.storage.remove(STATE_KEY)?;
        self.events.publish(Event::RemoteConfigChanged(None));
        Ok(())
    }

    pub fn state(&self) -> RemoteMirrorState {
        match self.storage.get(STATE_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            _ => RemoteMirrorState::default(),
        }
    }

    fn update_state<F: FnOnce(&mut RemoteMirrorState)>(&self, patch: F) -> Result<(), SyncError> {
        let mut state = self.state();
        patch(&mut state);
        let raw = serde_json::to_string(&state).map_err(|e| SyncError::Encode(e.to_string()))?;
        self.storage.set(STATE_KEY, &raw)?;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.config().is_enabled()
    }

    /// Reads the remote file, records its revision and announces the pull.
    pub fn fetch_collection(&self) -> Result<RemoteSnapshot, SyncError> {
        self.pull(true)
    }

    /// Checks that the configured file can be read. Failures are returned
    /// to the caller only, not broadcast.
    pub fn test_connection(&self) -> Result<(), SyncError> {
        self.pull(false).map(|_| ())
    }

    fn pull(&self, broadcast_errors: bool) -> Result<RemoteSnapshot, SyncError> {
        let config = self.config();
        if !config.is_enabled() {
            return Err(SyncError::Disabled);
        }
        let result = self.read_content(&config).and_then(|snapshot| {
            let sha = snapshot.sha.clone();
            self.update_state(|state| {
                state.sha = sha;
                state.fetched_at = Some(Utc::now());
            })?;
            Ok(snapshot)
        });
        match result {
            Ok(snapshot) => {
                info!(
                    "Pulled {} cars from {}/{} at {:?}",
                    snapshot.cars.len(),
                    config.owner,
                    config.repo,
                    snapshot.sha
                );
                self.events.publish(Event::RemotePullSucceeded);
                Ok(snapshot)
            }
            Err(e) => {
                if broadcast_errors {
                    self.events.publish(Event::RemoteError(e.clone()));
                }
                Err(e)
            }
        }
    }

    fn read_content(&self, config: &RemoteMirrorConfig) -> Result<RemoteSnapshot, SyncError> {
        let url = format!(
            "{}?ref={}",
            contents_url(config),
            utf8_percent_encode(&config.branch_or_default(), COMPONENT)
        );
        let response = self.transport.send(&HttpRequest {
            method: Method::Get,
            url,
            headers: headers(config),
            body: None,
        })?;
        if response.status == 404 {
            debug!("Remote file {} does not exist yet", config.clean_path());
            return Ok(RemoteSnapshot {
                cars: Vec::new(),
                sha: None,
            });
        }
        if !response.is_success() {
            return Err(SyncError::Status {
                status: response.status,
                body: response.body,
            });
        }
        let data: ContentResponse = serde_json::from_str(&response.body)
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        let content = data
            .content
            .ok_or_else(|| SyncError::Decode("response has no `content` field".to_owned()))?;
        Ok(RemoteSnapshot {
            cars: decode_content(&content)?,
            sha: data.sha,
        })
    }

    /// Commits the collection to the remote file. Uses the last known
    /// revision, or looks it up first when none is known.
    pub fn push_collection(&self, cars: &[VehicleRecord]) -> Result<PushReceipt, SyncError> {
        let config = self.config();
        if !config.is_enabled() {
            return Err(SyncError::Disabled);
        }
        match self.write_content(&config, cars) {
            Ok(receipt) => {
                info!(
                    "Pushed {} cars to {}/{}, now at {:?}",
                    cars.len(),
                    config.owner,
                    config.repo,
                    receipt.sha
                );
                self.events.publish(Event::RemotePushSucceeded);
                Ok(receipt)
            }
            Err(e) => {
                self.events.publish(Event::RemoteError(e.clone()));
                Err(e)
            }
        }
    }

    fn write_content(
        &self,
        config: &RemoteMirrorConfig,
        cars: &[VehicleRecord],
    ) -> Result<PushReceipt, SyncError> {
        if config.token.trim().is_empty() {
            return Err(SyncError::MissingToken);
        }
        let sha = match self.state().sha {
            Some(sha) => Some(sha),
            None => self.read_content(config)?.sha,
        };

        let content = base64::engine::general_purpose::STANDARD.encode(serialize_cars(cars)?);
        let branch = config.branch_or_default();
        let body = PutContentRequest {
            message: &config.commit_message,
            content,
            branch: &branch,
            sha: sha.as_deref(),
            committer: config
                .committer()
                .map(|(name, email)| Committer { name, email }),
        };
        let body = serde_json::to_string(&body).map_err(|e| SyncError::Encode(e.to_string()))?;

        let mut request_headers = headers(config);
        request_headers.push(("Content-Type", "application/json".to_owned()));
        let response = self.transport.send(&HttpRequest {
            method: Method::Put,
            url: contents_url(config),
            headers: request_headers,
            body: Some(body),
        })?;

        match response.status {
            409 | 422 => {
                return Err(SyncError::Conflict {
                    status: response.status,
                    sha,
                    body: response.body,
                })
            }
            _ if !response.is_success() => {
                return Err(SyncError::Status {
                    status: response.status,
                    body: response.body,
                })
            }
            _ => {}
        }

        let result: PutContentResponse = serde_json::from_str(&response.body)
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        let new_sha = result.content.and_then(|c| c.sha);
        let stored_sha = new_sha.clone();
        self.update_state(|state| {
            state.sha = stored_sha;
            state.pushed_at = Some(Utc::now());
        })?;
        Ok(PushReceipt { sha: new_sha })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::cache::MemoryStorage;
    use serde_json::Value;

    fn mirror() -> (RemoteMirror, ScriptedTransport, EventBus, MemoryStorage) {
        let storage = MemoryStorage::new();
        let transport = ScriptedTransport::default();
        let events = EventBus::new();
        let mirror = RemoteMirror::new(
            Arc::new(storage.clone()),
            Box::new(transport.clone()),
            events.clone(),
        );
        (mirror, transport, events, storage)
    }

    fn car(title: &str) -> VehicleRecord {
        let raw = serde_json::json!({ "title": title });
        normalize::normalize_collection(vec![normalize::raw_from_json(raw).unwrap()]).remove(0)
    }

    #[test]
    fn encodes_path_segments_like_uri_components() {
        let config = RemoteMirrorConfig {
            path: "/data/my cars (new).json".to_owned(),
            ..enabled_config()
        };
        assert_eq!(
            contents_url(&config),
            "https://api.github.com/repos/dealer/site/contents/data/my%20cars%20(new).json"
        );
    }

    #[test]
    fn fetch_decodes_content_and_records_sha() {
        let (mirror, transport, events, _) = mirror();
        mirror.save_config(enabled_config()).unwrap();
        let rx = events.subscribe();
        transport.respond(200, &content_body(r#"{"cars":[{"title":"Audi A4"}]}"#, "abc123"));

        let snapshot = mirror.fetch_collection().unwrap();

        assert_eq!(snapshot.cars.len(), 1);
        assert_eq!(snapshot.sha.as_deref(), Some("abc123"));
        assert_eq!(mirror.state().sha.as_deref(), Some("abc123"));
        assert!(mirror.state().fetched_at.is_some());
        assert!(matches!(rx.try_recv(), Ok(Event::RemotePullSucceeded)));

        let request = &transport.sent()[0];
        assert_eq!(request.method, Method::Get);
        assert!(request.url.ends_with("/contents/assets/data/cars.json?ref=main"));
        assert!(request
            .headers
            .contains(&("Accept", "application/vnd.github+json".to_owned())));
        assert!(request
            .headers
            .contains(&("Authorization", "Bearer ghp_secret".to_owned())));
    }

    #[test]
    fn missing_file_is_an_empty_collection() {
        let (mirror, transport, _, _) = mirror();
        mirror.save_config(enabled_config()).unwrap();
        transport.respond(404, r#"{"message":"Not Found"}"#);

        let snapshot = mirror.fetch_collection().unwrap();
        assert!(snapshot.cars.is_empty());
        assert_eq!(snapshot.sha, None);
    }

    #[test]
    fn failed_fetch_is_broadcast_and_returned() {
        let (mirror, transport, events, _) = mirror();
        mirror.save_config(enabled_config()).unwrap();
        let rx = events.subscribe();
        transport.respond(401, "Bad credentials");

        let err = mirror.fetch_collection().unwrap_err();
        assert!(matches!(err, SyncError::Status { status: 401, ref body } if body == "Bad credentials"));
        assert!(matches!(rx.try_recv(), Ok(Event::RemoteError(SyncError::Status { status: 401, .. }))));
    }

    #[test]
    fn disabled_mirror_refuses_to_fetch() {
        let (mirror, transport, _, _) = mirror();
        assert!(matches!(mirror.fetch_collection(), Err(SyncError::Disabled)));
        assert!(matches!(mirror.test_connection(), Err(SyncError::Disabled)));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_connection_does_not_broadcast_errors() {
        let (mirror, transport, events, _) = mirror();
        mirror.save_config(enabled_config()).unwrap();
        let rx = events.subscribe();
        transport.fail("connection refused");

        assert!(matches!(mirror.test_connection(), Err(SyncError::Transport { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn push_without_token_fails_fast() {
        let (mirror, transport, _, _) = mirror();
        mirror
            .save_config(RemoteMirrorConfig {
                token: String::new(),
                ..enabled_config()
            })
            .unwrap();

        let err = mirror.push_collection(&[car("Audi A4")]).unwrap_err();
        assert!(matches!(err, SyncError::MissingToken));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn push_without_known_sha_reads_first() {
        let (mirror, transport, events, _) = mirror();
        mirror.save_config(enabled_config()).unwrap();
        let rx = events.subscribe();
        transport
            .respond(200, &content_body("[]", "old-sha"))
            .respond(200, r#"{"content":{"sha":"new-sha"}}"#);

        let receipt = mirror.push_collection(&[car("Audi A4")]).unwrap();
        assert_eq!(receipt.sha.as_deref(), Some("new-sha"));
        assert_eq!(mirror.state().sha.as_deref(), Some("new-sha"));
        assert!(mirror.state().pushed_at.is_some());
        assert!(matches!(rx.try_recv(), Ok(Event::RemotePushSucceeded)));

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].method, Method::Get);
        assert_eq!(sent[1].method, Method::Put);
        assert!(!sent[1].url.contains("?ref="));

        let body: Value = serde_json::from_str(sent[1].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["sha"], "old-sha");
        assert_eq!(body["branch"], "main");
        assert_eq!(body["message"], "Update car listings");
        assert!(body.get("committer").is_none());
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(body["content"].as_str().unwrap())
            .unwrap();
        let text = String::from_utf8(decoded).unwrap();
        assert!(text.ends_with("]\n"));
        assert!(text.contains("\n  {\n    \"id\": \"audi-a4\""));
    }

    #[test]
    fn push_to_missing_file_creates_it() {
        let (mirror, transport, _, _) = mirror();
        mirror.save_config(enabled_config()).unwrap();
        transport
            .respond(404, "Not Found")
            .respond(201, r#"{"content":{"sha":"created"}}"#);

        mirror.push_collection(&[]).unwrap();
        let body: Value =
            serde_json::from_str(transport.sent()[1].body.as_deref().unwrap()).unwrap();
        assert!(body.get("sha").is_none());
    }

    #[test]
    fn push_with_known_sha_skips_the_read() {
        let (mirror, transport, _, _) = mirror();
        mirror
            .save_config(RemoteMirrorConfig {
                author_name: "Sales".to_owned(),
                author_email: "sales@example.com".to_owned(),
                ..enabled_config()
            })
            .unwrap();
        mirror.update_state(|s| s.sha = Some("known".to_owned())).unwrap();
        transport.respond(200, r#"{"content":{"sha":"next"}}"#);

        mirror.push_collection(&[]).unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let body: Value = serde_json::from_str(sent[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["sha"], "known");
        assert_eq!(body["committer"]["name"], "Sales");
        assert_eq!(body["committer"]["email"], "sales@example.com");
    }

    #[test]
    fn stale_sha_is_a_conflict() {
        let (mirror, transport, events, _) = mirror();
        mirror.save_config(enabled_config()).unwrap();
        mirror.update_state(|s| s.sha = Some("stale".to_owned())).unwrap();
        let rx = events.subscribe();
        transport.respond(409, "is at abc but expected stale");

        let err = mirror.push_collection(&[]).unwrap_err();
        assert!(matches!(err, SyncError::Conflict { status: 409, sha: Some(ref s), .. } if s == "stale"));
        assert!(matches!(rx.try_recv(), Ok(Event::RemoteError(SyncError::Conflict { .. }))));
        assert_eq!(mirror.state().sha.as_deref(), Some("stale"));
    }

    #[test]
    fn unprocessable_write_is_a_conflict() {
        let (mirror, transport, events, _) = mirror();
        mirror.save_config(enabled_config()).unwrap();
        mirror.update_state(|s| s.sha = Some("outdated".to_owned())).unwrap();
        let rx = events.subscribe();
        transport.respond(422, r#"{"message":"sha does not match"}"#);

        let err = mirror.push_collection(&[car("Audi A4")]).unwrap_err();
        assert!(matches!(err, SyncError::Conflict { status: 422, sha: Some(ref s), .. } if s == "outdated"));
        assert!(matches!(
            rx.try_recv(),
            Ok(Event::RemoteError(SyncError::Conflict { status: 422, .. }))
        ));
        assert_eq!(mirror.state().pushed_at, None);
    }

    #[test]
    fn config_changes_are_announced_masked() {
        let (mirror, _, events, storage) = mirror();
        let rx = events.subscribe();

        let saved = mirror.save_config(enabled_config()).unwrap();
        assert_eq!(saved.token, "ghp_secret");
        match rx.try_recv() {
            Ok(Event::RemoteConfigChanged(Some(config))) => assert_eq!(config.token, "***"),
            other => panic!("unexpected event {:?}", other),
        }

        mirror.update_state(|s| s.sha = Some("x".to_owned())).unwrap();
        mirror.clear_configuration().unwrap();
        assert!(matches!(rx.try_recv(), Ok(Event::RemoteConfigChanged(None))));
        assert_eq!(storage.get(CONFIG_KEY).unwrap(), None);
        assert_eq!(storage.get(STATE_KEY).unwrap(), None);
        assert!(!mirror.is_enabled());
    }

    #[test]
    fn decode_rejects_non_collections() {
        let body = content_body(r#""just a string""#, "sha");
        let (mirror, transport, _, _) = mirror();
        mirror.save_config(enabled_config()).unwrap();
        transport.respond(200, &body);
        assert!(matches!(
            mirror.fetch_collection(),
            Err(SyncError::Shape(ShapeError::NotACollection("a string")))
        ));
    }
}
