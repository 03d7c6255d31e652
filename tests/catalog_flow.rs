use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use car_catalog::model::storage::{StoredPayload, SCHEMA_VERSION};
use car_catalog::store::STORAGE_KEY;
use car_catalog::{
    CatalogStore, DefaultDataset, Event, EventBus, FileStorage, HttpRequest, HttpResponse,
    HttpTransport, MemoryStorage, Method, Numeric, RawRecord, RemoteMirror, RemoteMirrorConfig,
    Storage, SyncError,
};

fn raw(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

#[derive(Clone, Default)]
struct FakeGitHub {
    responses: Arc<Mutex<VecDeque<HttpResponse>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl FakeGitHub {
    fn reply(&self, status: u16, body: Value) {
        self.responses.lock().unwrap().push_back(HttpResponse {
            status,
            body: body.to_string(),
        });
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpTransport for FakeGitHub {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, SyncError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.responses.lock().unwrap().pop_front().expect("unexpected request"))
    }
}

#[test]
fn local_only_lifecycle() {
    let storage = MemoryStorage::new();
    let mut store = CatalogStore::new(
        Arc::new(storage.clone()),
        DefaultDataset::Bundled,
        EventBus::new(),
    );
    let changes = store.subscribe();

    let defaults = store.get_all();
    assert!(!defaults.is_empty());
    let stored = storage.get(STORAGE_KEY).unwrap().unwrap();
    let envelope: Value = serde_json::from_str(&stored).unwrap();
    assert_eq!(envelope["version"], SCHEMA_VERSION);

    let car = store
        .upsert(raw(json!({"title": "BMW 320d", "price": "25000"})))
        .unwrap();
    assert_eq!(car.slug, "bmw-320d");
    assert_eq!(car.price, Some(Numeric::from(25000)));
    assert!(car.gallery.is_empty());
    assert!(car.features.is_empty());
    assert!(store.get_all().iter().any(|c| c.slug == "bmw-320d"));
    assert_eq!(store.get_all().len(), defaults.len() + 1);

    assert!(store.remove("bmw-320d").unwrap());
    assert!(store.get_all().iter().all(|c| c.slug != "bmw-320d"));
    assert_eq!(store.get_by_slug_or_id("bmw-320d"), None);

    let notified = changes
        .try_iter()
        .filter(|e| matches!(e, Event::CatalogChanged))
        .count();
    assert_eq!(notified, 2);
}

#[test]
fn file_storage_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let open = || {
        CatalogStore::new(
            Arc::new(FileStorage::new(dir.path())),
            DefaultDataset::Bundled,
            EventBus::new(),
        )
    };

    let mut store = open();
    store
        .replace_all(vec![
            raw(json!({"title": "Mazda CX-5", "vin": "JMZKE00000000001"})),
            raw(json!({"title": "Mazda CX-5"})),
        ])
        .unwrap();

    let mut reopened = open();
    let cars = reopened.get_all();
    assert_eq!(cars.len(), 2);
    assert_eq!(cars[0].slug, "mazda-cx-5");
    assert_eq!(cars[1].slug, "mazda-cx-5-1");
    assert_eq!(cars[0].identification_code.as_deref(), Some("JMZKE00000000001"));

    let stored = std::fs::read_to_string(dir.path().join("mbk_cars.json")).unwrap();
    assert!(matches!(StoredPayload::decode(&stored), Ok(StoredPayload::Current(_))));
}

#[test]
fn mirrored_save_commits_to_github() {
    let storage = MemoryStorage::new();
    let github = FakeGitHub::default();
    let events = EventBus::new();
    let remote = RemoteMirror::new(
        Arc::new(storage.clone()),
        Box::new(github.clone()),
        events.clone(),
    );
    remote
        .save_config(RemoteMirrorConfig {
            enabled: true,
            owner: "dealer".to_owned(),
            repo: "website".to_owned(),
            branch: "gh-pages".to_owned(),
            token: "ghp_secret".to_owned(),
            ..RemoteMirrorConfig::default()
        })
        .unwrap();
    let mut store = CatalogStore::new(Arc::new(storage.clone()), DefaultDataset::Bundled, events)
        .with_remote(remote);
    let rx = store.subscribe();

    let remote_cars = json!([{"title": "Remote Tesla", "price": 31000}]);
    let content = base64_encode(&remote_cars.to_string());
    github.reply(200, json!({"content": content, "sha": "sha-1"}));
    github.reply(200, json!({"content": {"sha": "sha-2"}}));

    let cars = store.get_all();
    assert_eq!(cars.len(), 1);
    assert_eq!(cars[0].title, "Remote Tesla");

    store.upsert(raw(json!({"title": "Local Addition"}))).unwrap();

    let requests = github.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, Method::Get);
    assert!(requests[0]
        .url
        .ends_with("/repos/dealer/website/contents/assets/data/cars.json?ref=gh-pages"));
    assert_eq!(requests[1].method, Method::Put);
    let body: Value = serde_json::from_str(requests[1].body.as_deref().unwrap()).unwrap();
    assert_eq!(body["sha"], "sha-1");
    assert_eq!(body["branch"], "gh-pages");

    assert_eq!(store.remote().unwrap().state().sha.as_deref(), Some("sha-2"));
    let seen: Vec<Event> = rx.try_iter().collect();
    assert!(seen.iter().any(|e| matches!(e, Event::RemotePullSucceeded)));
    assert!(seen.iter().any(|e| matches!(e, Event::RemotePushSucceeded)));
}

fn base64_encode(text: &str) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(text)
}
