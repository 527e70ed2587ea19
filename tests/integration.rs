//! Integration tests for the offline-first sync core.
//!
//! All tests run against an in-memory SQLite cache and a scriptable mock
//! remote, so no external services are required.
//!
//! # Test Organization
//! - `offline_*` - behavior with connectivity down (pending rows, replays)
//! - `policy_*`  - per-policy routing semantics
//! - `sync_*`    - drains, stale reconciliation, realtime ingest
//! - `misc_*`    - response cache, maintenance, schema bootstrap

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use recordsync::{
    FileUpload, ListPage, ListQuery, ManualConnectivity, RealtimeAction, RealtimeEvent,
    RemoteClient, RequestPolicy, SendRequest, SyncClient, SyncConfig, SyncError,
};

// =============================================================================
// Mock Remote
// =============================================================================

/// A scriptable in-memory server.
#[derive(Default)]
struct MockRemote {
    /// (service, id) → record
    records: Mutex<HashMap<(String, String), Value>>,
    /// Log of mutating calls, e.g. "CREATE posts abc123def456ghi".
    calls: Mutex<Vec<String>>,
    /// Fail every request with this status when non-zero.
    fail_status: AtomicU16,
    /// Fail only creates with this status when non-zero (one probe knob).
    create_status: AtomicU16,
    /// Server-side id to assign on the next create.
    assign_id: Mutex<Option<String>>,
    /// Rename uploaded files to `<stem>_<nonce>.<ext>` like the real server.
    rename_files: AtomicBool,
    /// Open realtime topics.
    topics: Mutex<HashMap<String, mpsc::Sender<RealtimeEvent>>>,
    /// Canned response for `send`.
    send_response: Mutex<Option<Value>>,
}

impl MockRemote {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn seed(&self, service: &str, record: Value) {
        let id = record["id"].as_str().unwrap().to_string();
        self.records
            .lock()
            .insert((service.to_string(), id), record);
    }

    fn record(&self, service: &str, id: &str) -> Option<Value> {
        self.records
            .lock()
            .get(&(service.to_string(), id.to_string()))
            .cloned()
    }

    fn remove(&self, service: &str, id: &str) {
        self.records
            .lock()
            .remove(&(service.to_string(), id.to_string()));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn check_fail(&self) -> Result<(), SyncError> {
        let status = self.fail_status.load(Ordering::SeqCst);
        if status != 0 {
            return Err(SyncError::Remote {
                status,
                body: "scripted failure".into(),
            });
        }
        Ok(())
    }

    fn stamp(&self, record: &mut Map<String, Value>) {
        let now = recordsync::record::now_iso();
        record
            .entry("created")
            .or_insert_with(|| Value::String(now.clone()));
        record.insert("updated".into(), Value::String(now));
    }

    fn apply_files(&self, record: &mut Map<String, Value>, files: &[FileUpload]) {
        let mut grouped: HashMap<&str, Vec<String>> = HashMap::new();
        for file in files {
            let name = if self.rename_files.load(Ordering::SeqCst) {
                match file.filename.rsplit_once('.') {
                    Some((stem, ext)) => format!("{stem}_x7f9q2.{ext}"),
                    None => format!("{}_x7f9q2", file.filename),
                }
            } else {
                file.filename.clone()
            };
            grouped.entry(file.field.as_str()).or_default().push(name);
        }
        for (field, mut names) in grouped {
            let value = if names.len() == 1 {
                Value::String(names.pop().unwrap())
            } else {
                Value::Array(names.into_iter().map(Value::String).collect())
            };
            record.insert(field.to_string(), value);
        }
    }

    async fn push_event(&self, topic: &str, event: RealtimeEvent) {
        let sender = self.topics.lock().get(topic).cloned();
        if let Some(sender) = sender {
            sender.send(event).await.unwrap();
        }
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn get_one(
        &self,
        service: &str,
        id: &str,
        _query: &[(String, String)],
    ) -> Result<Value, SyncError> {
        self.check_fail()?;
        self.record(service, id).ok_or(SyncError::Remote {
            status: 404,
            body: "not found".into(),
        })
    }

    async fn get_list(
        &self,
        service: &str,
        page: u32,
        per_page: u32,
        _query: &[(String, String)],
    ) -> Result<ListPage, SyncError> {
        self.check_fail()?;
        let mut items: Vec<Value> = self
            .records
            .lock()
            .iter()
            .filter(|((s, _), _)| s == service)
            .map(|(_, v)| v.clone())
            .collect();
        items.sort_by_key(|v| v["id"].as_str().unwrap_or_default().to_string());

        let total = items.len() as u64;
        let start = ((page.max(1) - 1) * per_page) as usize;
        let items: Vec<Value> = items
            .into_iter()
            .skip(start)
            .take(per_page as usize)
            .collect();
        Ok(ListPage {
            page,
            per_page,
            total_items: Some(total),
            items,
        })
    }

    async fn create(
        &self,
        service: &str,
        body: &Value,
        files: &[FileUpload],
        _query: &[(String, String)],
    ) -> Result<Value, SyncError> {
        self.check_fail()?;
        let status = self.create_status.load(Ordering::SeqCst);
        if status != 0 {
            return Err(SyncError::Remote {
                status,
                body: "scripted create failure".into(),
            });
        }

        let mut record = body.as_object().cloned().unwrap_or_default();
        let id = match self.assign_id.lock().take() {
            Some(forced) => forced,
            None => record
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(recordsync::id::generate),
        };
        record.insert("id".into(), Value::String(id.clone()));
        self.apply_files(&mut record, files);
        self.stamp(&mut record);

        let value = Value::Object(record);
        self.calls.lock().push(format!("CREATE {service} {id}"));
        self.records
            .lock()
            .insert((service.to_string(), id), value.clone());
        Ok(value)
    }

    async fn update(
        &self,
        service: &str,
        id: &str,
        body: &Value,
        files: &[FileUpload],
        _query: &[(String, String)],
    ) -> Result<Value, SyncError> {
        self.check_fail()?;
        let existing = self.record(service, id).ok_or(SyncError::Remote {
            status: 404,
            body: "not found".into(),
        })?;

        let mut record = existing.as_object().cloned().unwrap_or_default();
        for (key, value) in body.as_object().cloned().unwrap_or_default() {
            record.insert(key, value);
        }
        record.insert("id".into(), Value::String(id.to_string()));
        self.apply_files(&mut record, files);
        self.stamp(&mut record);

        let value = Value::Object(record);
        self.calls.lock().push(format!("UPDATE {service} {id}"));
        self.records
            .lock()
            .insert((service.to_string(), id.to_string()), value.clone());
        Ok(value)
    }

    async fn delete(&self, service: &str, id: &str) -> Result<(), SyncError> {
        self.check_fail()?;
        self.calls.lock().push(format!("DELETE {service} {id}"));
        match self
            .records
            .lock()
            .remove(&(service.to_string(), id.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(SyncError::Remote {
                status: 404,
                body: "not found".into(),
            }),
        }
    }

    async fn send(&self, request: SendRequest) -> Result<Value, SyncError> {
        self.check_fail()?;
        self.calls
            .lock()
            .push(format!("SEND {} {}", request.method, request.path));
        self.send_response
            .lock()
            .clone()
            .ok_or(SyncError::Remote {
                status: 404,
                body: "no canned response".into(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<RealtimeEvent>, SyncError> {
        let (tx, rx) = mpsc::channel(16);
        self.topics.lock().insert(topic.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), SyncError> {
        self.topics.lock().remove(topic);
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

const POSTS_SCHEMA: &str = r#"[
    {"id": "c_posts", "name": "posts", "fields": [
        {"name": "title", "type": "text", "required": true},
        {"name": "community", "type": "text"},
        {"name": "author", "type": "relation",
         "data": {"maxSelect": 1, "collectionId": "c_users"}},
        {"name": "tags", "type": "relation",
         "data": {"maxSelect": 3, "collectionId": "c_tags"}},
        {"name": "cover", "type": "file", "data": {"maxSelect": 1}}
    ]},
    {"id": "c_users", "name": "users", "fields": [
        {"name": "name", "type": "text"}
    ]},
    {"id": "c_tags", "name": "tags", "fields": [
        {"name": "label", "type": "text"}
    ]}
]"#;

async fn open_client(
    online: bool,
) -> (SyncClient, Arc<MockRemote>, Arc<ManualConnectivity>) {
    let remote = MockRemote::new();
    let connectivity = Arc::new(ManualConnectivity::new(online));
    let client = SyncClient::open(
        SyncConfig::default(),
        remote.clone() as Arc<dyn RemoteClient>,
        connectivity.clone(),
    )
    .await
    .expect("open client");
    client
        .load_schema_snapshot(POSTS_SCHEMA)
        .await
        .expect("load schema snapshot");
    (client, remote, connectivity)
}

fn obj(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

/// Wait until every pending row drained (bounded).
async fn wait_drained(client: &SyncClient) {
    for _ in 0..200 {
        if client.store().pending_count().await.unwrap() == 0 {
            client.sync_completed().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pending rows were not drained");
}

// =============================================================================
// offline_* - behavior with connectivity down
// =============================================================================

#[tokio::test]
async fn offline_create_then_reconnect_replays() {
    // Scenario: create offline with the resilient default, then reconnect.
    let (client, remote, connectivity) = open_client(false).await;
    let posts = client.collection("posts");

    let record = posts
        .create(obj(json!({"title": "Hi"})), Vec::new(), None)
        .await
        .unwrap();

    let id = record["id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 15);
    assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    assert_eq!(record["synced"], json!(false));
    assert_eq!(record["isNew"], json!(true));

    // Connectivity rising edge drains the pending row.
    connectivity.set_online(true);
    wait_drained(&client).await;

    // The server received the create under the same id.
    assert!(remote.calls().contains(&format!("CREATE posts {id}")));
    assert!(remote.record("posts", &id).is_some());

    // The cache row flipped to synced.
    let row = posts.get_one(&id, Some(RequestPolicy::CacheOnly)).await.unwrap();
    assert_eq!(row["synced"], json!(true));
    assert_eq!(row["isNew"], json!(false));
    client.shutdown().await;
}

#[tokio::test]
async fn offline_create_keeps_original_file_names() {
    let (client, _remote, _connectivity) = open_client(false).await;
    let posts = client.collection("posts");

    let record = posts
        .create(
            obj(json!({"title": "Hi"})),
            vec![FileUpload {
                field: "cover".into(),
                filename: "photo.png".into(),
                bytes: vec![9, 9, 9],
            }],
            None,
        )
        .await
        .unwrap();

    let id = record["id"].as_str().unwrap();
    let cached = posts.get_one(id, Some(RequestPolicy::CacheOnly)).await.unwrap();
    assert_eq!(cached["cover"], json!("photo.png"));

    let blob = client.store().get_file(id, "photo.png").await.unwrap().unwrap();
    assert_eq!(blob.bytes, vec![9, 9, 9]);
    client.shutdown().await;
}

#[tokio::test]
async fn offline_delete_leaves_tombstone_then_replays() {
    let (client, remote, connectivity) = open_client(false).await;
    let posts = client.collection("posts");

    remote.seed("posts", json!({"id": "aaa111aaa111aaa", "title": "Hi"}));
    client
        .store()
        .set_local("posts", &[json!({"id": "aaa111aaa111aaa", "title": "Hi"})])
        .await
        .unwrap();

    posts.delete("aaa111aaa111aaa", None).await.unwrap();

    // Tombstone still present locally until the server confirms.
    let row = client
        .store()
        .get_row("posts", "aaa111aaa111aaa")
        .await
        .unwrap()
        .unwrap();
    assert!(row.deleted());
    assert!(!row.synced());

    connectivity.set_online(true);
    wait_drained(&client).await;

    assert!(remote.record("posts", "aaa111aaa111aaa").is_none());
    assert!(client
        .store()
        .get_row("posts", "aaa111aaa111aaa")
        .await
        .unwrap()
        .is_none());
    client.shutdown().await;
}

#[tokio::test]
async fn offline_network_policies_fail_fast() {
    let (client, _remote, _connectivity) = open_client(false).await;
    let posts = client.collection("posts");

    let err = posts
        .get_one("aaa111aaa111aaa", Some(RequestPolicy::NetworkOnly))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Offline));

    let err = posts
        .create(
            obj(json!({"title": "Hi"})),
            Vec::new(),
            Some(RequestPolicy::NetworkFirst),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Offline));

    // NetworkFirst read falls back to cache; both missing → Unavailable.
    let err = posts
        .get_one("aaa111aaa111aaa", Some(RequestPolicy::NetworkFirst))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Unavailable { .. }));
    client.shutdown().await;
}

// =============================================================================
// policy_* - routing semantics
// =============================================================================

#[tokio::test]
async fn policy_cache_only_never_touches_network() {
    let (client, remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");

    let record = posts
        .create(
            obj(json!({"title": "Local"})),
            Vec::new(),
            Some(RequestPolicy::CacheOnly),
        )
        .await
        .unwrap();
    let id = record["id"].as_str().unwrap();

    // Local-only rows are excluded from the pending scan.
    assert_eq!(client.store().pending_count().await.unwrap(), 0);
    let row = client.store().get_row("posts", id).await.unwrap().unwrap();
    assert!(row.no_sync());

    let err = posts
        .get_one("missing456789ab", Some(RequestPolicy::CacheOnly))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::CacheMiss { .. }));

    assert!(remote.calls().is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn policy_network_only_skips_cache() {
    let (client, remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");

    remote.seed("posts", json!({"id": "aaa111aaa111aaa", "title": "Remote"}));
    let record = posts
        .get_one("aaa111aaa111aaa", Some(RequestPolicy::NetworkOnly))
        .await
        .unwrap();
    assert_eq!(record["title"], json!("Remote"));

    // No cache side effects.
    assert!(client
        .store()
        .get_row("posts", "aaa111aaa111aaa")
        .await
        .unwrap()
        .is_none());
    client.shutdown().await;
}

#[tokio::test]
async fn policy_network_first_updates_cache_and_falls_back() {
    let (client, remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");

    remote.seed("posts", json!({"id": "aaa111aaa111aaa", "title": "Remote"}));
    let record = posts
        .get_one("aaa111aaa111aaa", Some(RequestPolicy::NetworkFirst))
        .await
        .unwrap();
    assert_eq!(record["title"], json!("Remote"));

    // Cached as synced.
    let row = client
        .store()
        .get_row("posts", "aaa111aaa111aaa")
        .await
        .unwrap()
        .unwrap();
    assert!(row.synced());

    // Server failure now falls back to the cached copy.
    remote.fail_status.store(500, Ordering::SeqCst);
    let record = posts
        .get_one("aaa111aaa111aaa", Some(RequestPolicy::NetworkFirst))
        .await
        .unwrap();
    assert_eq!(record["title"], json!("Remote"));
    client.shutdown().await;
}

#[tokio::test]
async fn policy_cache_first_returns_local_and_refreshes_in_background() {
    let (client, remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");

    remote.seed("posts", json!({"id": "aaa111aaa111aaa", "title": "Server"}));
    client
        .store()
        .set_local(
            "posts",
            &[json!({"id": "aaa111aaa111aaa", "title": "Stale",
                     "updated": "2024-01-01T00:00:00.000Z"})],
        )
        .await
        .unwrap();

    let record = posts
        .get_one("aaa111aaa111aaa", Some(RequestPolicy::CacheFirst))
        .await
        .unwrap();
    // Cache answers synchronously.
    assert_eq!(record["title"], json!("Stale"));

    // The out-of-band refresh lands the server copy.
    client.engine().drain_background().await;
    let row = client
        .store()
        .get_row("posts", "aaa111aaa111aaa")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.data["title"], json!("Server"));
    client.shutdown().await;
}

#[tokio::test]
async fn policy_create_with_id_conflict_falls_back_to_update() {
    let (client, remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");

    remote.seed("posts", json!({"id": "aaa111aaa111aaa", "title": "Old", "views": 7}));
    remote.create_status.store(400, Ordering::SeqCst);

    let record = posts
        .create(
            obj(json!({"id": "aaa111aaa111aaa", "title": "New"})),
            Vec::new(),
            Some(RequestPolicy::CacheAndNetwork),
        )
        .await
        .unwrap();

    // The 400 probe fell back to update; the server merged the body.
    assert_eq!(record["title"], json!("New"));
    assert_eq!(record["views"], json!(7));
    assert!(remote
        .calls()
        .contains(&"UPDATE posts aaa111aaa111aaa".to_string()));
    client.shutdown().await;
}

#[tokio::test]
async fn policy_server_id_mismatch_reconciles_local_row() {
    // Scenario: the server refuses the local id and assigns its own.
    let (client, remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");

    *remote.assign_id.lock() = Some("zzz999zzz999zzz".into());
    let record = posts
        .create(
            obj(json!({"id": "aaa111aaa111aaa", "title": "Hi"})),
            Vec::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(record["id"], json!("zzz999zzz999zzz"));

    // Exactly one row for the service, under the server id.
    assert_eq!(client.store().count("posts", None).await.unwrap(), 1);
    assert!(client
        .store()
        .get_row("posts", "zzz999zzz999zzz")
        .await
        .unwrap()
        .is_some());
    assert!(client
        .store()
        .get_row("posts", "aaa111aaa111aaa")
        .await
        .unwrap()
        .is_none());

    let gone = posts
        .get_one_or_none("aaa111aaa111aaa", Some(RequestPolicy::CacheOnly))
        .await
        .unwrap();
    assert!(gone.is_none());
    client.shutdown().await;
}

#[tokio::test]
async fn policy_uploaded_files_recached_under_server_names() {
    let (client, remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");
    remote.rename_files.store(true, Ordering::SeqCst);

    let record = posts
        .create(
            obj(json!({"title": "Hi"})),
            vec![FileUpload {
                field: "cover".into(),
                filename: "photo.png".into(),
                bytes: vec![4, 5, 6],
            }],
            None,
        )
        .await
        .unwrap();

    let id = record["id"].as_str().unwrap();
    let server_name = record["cover"].as_str().unwrap();
    assert!(server_name.starts_with("photo_"));

    let blob = client.store().get_file(id, server_name).await.unwrap().unwrap();
    assert_eq!(blob.bytes, vec![4, 5, 6]);
    // The original name no longer shadows the canonical one.
    assert!(client.store().get_file(id, "photo.png").await.unwrap().is_none());
    client.shutdown().await;
}

#[tokio::test]
async fn policy_expand_shapes_match_cardinality() {
    let (client, _remote, _connectivity) = open_client(true).await;

    client
        .store()
        .set_local("users", &[json!({"id": "usr111usr111usr", "name": "Ada"})])
        .await
        .unwrap();
    client
        .store()
        .set_local(
            "tags",
            &[
                json!({"id": "tag111tag111tag", "label": "rust"}),
                json!({"id": "tag222tag222tag", "label": "sync"}),
            ],
        )
        .await
        .unwrap();
    client
        .store()
        .set_local(
            "posts",
            &[json!({
                "id": "pst111pst111pst", "title": "One",
                "author": "usr111usr111usr",
                "tags": ["tag111tag111tag", "tag222tag222tag"],
            })],
        )
        .await
        .unwrap();

    let posts = client.collection("posts");
    let record = posts
        .get_one_with(
            "pst111pst111pst",
            &ListQuery::new().expand("author,tags"),
            Some(RequestPolicy::CacheOnly),
        )
        .await
        .unwrap();

    // Single relation: object. Multi relation: list.
    assert!(record["expand"]["author"].is_object());
    assert_eq!(record["expand"]["author"]["name"], json!("Ada"));
    assert!(record["expand"]["tags"].is_array());
    assert_eq!(record["expand"]["tags"].as_array().unwrap().len(), 2);
    client.shutdown().await;
}

// =============================================================================
// sync_* - drains, reconciliation, realtime
// =============================================================================

#[tokio::test]
async fn sync_full_list_reconciles_stale_rows() {
    // Scenario: server no longer returns B for the filter; B is stale.
    let (client, remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");

    for (id, community) in [
        ("aaa111aaa111aaa", "x"),
        ("ccc333ccc333ccc", "x"),
    ] {
        remote.seed("posts", json!({"id": id, "title": id, "community": community}));
    }
    client
        .store()
        .set_local(
            "posts",
            &[
                json!({"id": "aaa111aaa111aaa", "title": "A", "community": "x"}),
                json!({"id": "bbb222bbb222bbb", "title": "B", "community": "x"}),
                json!({"id": "ccc333ccc333ccc", "title": "C", "community": "x"}),
                json!({"id": "ddd444ddd444ddd", "title": "D", "community": "y"}),
            ],
        )
        .await
        .unwrap();

    let items = posts
        .get_full_list(
            &ListQuery::new().filter("community = 'x'"),
            Some(RequestPolicy::NetworkFirst),
        )
        .await
        .unwrap();
    assert_eq!(items.len(), 2);

    let store = client.store();
    assert!(store.get_row("posts", "aaa111aaa111aaa").await.unwrap().is_some());
    assert!(store.get_row("posts", "bbb222bbb222bbb").await.unwrap().is_none());
    assert!(store.get_row("posts", "ccc333ccc333ccc").await.unwrap().is_some());
    // Rows outside the filter are untouched.
    assert!(store.get_row("posts", "ddd444ddd444ddd").await.unwrap().is_some());
    client.shutdown().await;
}

#[tokio::test]
async fn sync_offline_edit_replays_as_update() {
    let (client, remote, connectivity) = open_client(false).await;
    let posts = client.collection("posts");

    remote.seed("posts", json!({"id": "aaa111aaa111aaa", "title": "Old"}));
    client
        .store()
        .set_local("posts", &[json!({"id": "aaa111aaa111aaa", "title": "Old"})])
        .await
        .unwrap();

    posts
        .update(
            "aaa111aaa111aaa",
            obj(json!({"title": "Edited"})),
            Vec::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(client.store().pending_count().await.unwrap(), 1);

    connectivity.set_online(true);
    wait_drained(&client).await;

    assert_eq!(
        remote.record("posts", "aaa111aaa111aaa").unwrap()["title"],
        json!("Edited")
    );
    let row = client
        .store()
        .get_row("posts", "aaa111aaa111aaa")
        .await
        .unwrap()
        .unwrap();
    assert!(row.synced());
    client.shutdown().await;
}

#[tokio::test]
async fn sync_failed_row_does_not_stop_the_drain() {
    let (client, remote, connectivity) = open_client(false).await;
    let posts = client.collection("posts");

    // Two offline edits; the first targets a row the server rejects.
    client
        .store()
        .set_local(
            "posts",
            &[
                json!({"id": "aaa111aaa111aaa", "title": "A"}),
                json!({"id": "bbb222bbb222bbb", "title": "B"}),
            ],
        )
        .await
        .unwrap();
    remote.seed("posts", json!({"id": "bbb222bbb222bbb", "title": "B"}));
    // "aaa…" is unknown server-side and update→create fallback will also
    // fail because creates are scripted to 500.
    posts
        .update("aaa111aaa111aaa", obj(json!({"title": "A2"})), Vec::new(), None)
        .await
        .unwrap();
    posts
        .update("bbb222bbb222bbb", obj(json!({"title": "B2"})), Vec::new(), None)
        .await
        .unwrap();
    remote.create_status.store(500, Ordering::SeqCst);

    connectivity.set_online(true);
    client.sync_manager().sync_completed().await;
    // Give the drain a moment to start and finish.
    for _ in 0..100 {
        if remote.record("posts", "bbb222bbb222bbb").unwrap()["title"] == json!("B2") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The good row made it despite the bad one.
    assert_eq!(
        remote.record("posts", "bbb222bbb222bbb").unwrap()["title"],
        json!("B2")
    );
    // The bad row is still pending for the next drain.
    assert!(client.store().pending_count().await.unwrap() >= 1);
    client.shutdown().await;
}

#[tokio::test]
async fn sync_connectivity_flap_coalesces() {
    let (client, remote, connectivity) = open_client(false).await;
    let posts = client.collection("posts");

    posts
        .create(obj(json!({"title": "Hi"})), Vec::new(), None)
        .await
        .unwrap();

    // Several rapid edges; drains coalesce instead of duplicating work.
    for _ in 0..3 {
        connectivity.set_online(false);
        connectivity.set_online(true);
    }
    wait_drained(&client).await;

    let creates = remote
        .calls()
        .iter()
        .filter(|c| c.starts_with("CREATE posts"))
        .count();
    assert_eq!(creates, 1);
    client.shutdown().await;
}

#[tokio::test]
async fn sync_realtime_events_apply_to_cache() {
    let (client, remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");

    posts.subscribe("*").await.unwrap();

    remote
        .push_event(
            "posts",
            RealtimeEvent {
                action: RealtimeAction::Create,
                record: Some(json!({"id": "aaa111aaa111aaa", "title": "Pushed"})),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let row = client
        .store()
        .get_row("posts", "aaa111aaa111aaa")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.data["title"], json!("Pushed"));
    assert!(row.synced());

    remote
        .push_event(
            "posts",
            RealtimeEvent {
                action: RealtimeAction::Delete,
                record: Some(json!({"id": "aaa111aaa111aaa"})),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client
        .store()
        .get_row("posts", "aaa111aaa111aaa")
        .await
        .unwrap()
        .is_none());

    posts.unsubscribe("*").await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn sync_watch_list_emits_cache_then_merged() {
    let (client, remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");

    client
        .store()
        .set_local("posts", &[json!({"id": "aaa111aaa111aaa", "title": "Cached"})])
        .await
        .unwrap();
    remote.seed("posts", json!({"id": "aaa111aaa111aaa", "title": "Cached"}));
    remote.seed("posts", json!({"id": "bbb222bbb222bbb", "title": "Fresh"}));

    let mut stream = posts.watch_list(ListQuery::new().sort("id"));

    let first = stream.recv().await.unwrap();
    assert_eq!(first.len(), 1);

    let second = stream.recv().await.unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(second[1]["title"], json!("Fresh"));
    client.shutdown().await;
}

// =============================================================================
// misc_* - response cache, maintenance, bootstrap
// =============================================================================

#[tokio::test]
async fn misc_send_answers_from_response_cache_offline() {
    let (client, remote, connectivity) = open_client(true).await;
    *remote.send_response.lock() = Some(json!({"status": "ok"}));

    let request = SendRequest {
        path: "/api/custom/stats".into(),
        method: "GET".into(),
        ..Default::default()
    };

    let live = client.send(request.clone()).await.unwrap();
    assert_eq!(live, json!({"status": "ok"}));

    connectivity.set_online(false);
    let cached = client.send(request.clone()).await.unwrap();
    assert_eq!(cached, json!({"status": "ok"}));

    // Non-GET routes never cache, so offline they fail.
    let post = SendRequest {
        path: "/api/custom/stats".into(),
        method: "POST".into(),
        ..Default::default()
    };
    assert!(matches!(client.send(post).await, Err(SyncError::Offline)));
    client.shutdown().await;
}

#[tokio::test]
async fn misc_maintenance_respects_ttl_and_sync_state() {
    let (client, _remote, _connectivity) = open_client(true).await;
    let store = client.store();

    // A synced row 10 days old and an unsynced one beside it.
    let old = "2024-01-01T00:00:00.000Z";
    for (id, synced) in [("aaa111aaa111aaa", true), ("bbb222bbb222bbb", false)] {
        let mut record = recordsync::Record::from_server_value(
            "posts",
            &json!({"id": id, "title": "Old", "updated": old}),
        );
        record.set_flag("synced", synced);
        record.updated = old.into();
        store.upsert(&record).await.unwrap();
    }

    let report = client
        .run_maintenance_with(Some(Duration::from_secs(7 * 24 * 3600)))
        .await
        .unwrap();
    assert_eq!(report.deleted_records, 1);
    assert!(store.get_row("posts", "aaa111aaa111aaa").await.unwrap().is_none());
    assert!(store.get_row("posts", "bbb222bbb222bbb").await.unwrap().is_some());

    // Disabled cleanup is a no-op.
    let report = client.run_maintenance_with(None).await.unwrap();
    assert_eq!(report.total(), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn misc_schema_snapshot_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db").to_string_lossy().into_owned();
    let config = SyncConfig {
        db_path: Some(path.clone()),
        ..Default::default()
    };

    let remote = MockRemote::new();
    let connectivity = Arc::new(ManualConnectivity::new(false));
    let client = SyncClient::open(
        config.clone(),
        remote.clone() as Arc<dyn RemoteClient>,
        connectivity.clone(),
    )
    .await
    .unwrap();
    client.load_schema_snapshot(POSTS_SCHEMA).await.unwrap();
    client.shutdown().await;

    // A fresh client over the same file sees the persisted schemas.
    let client = SyncClient::open(
        config,
        remote as Arc<dyn RemoteClient>,
        connectivity,
    )
    .await
    .unwrap();
    assert!(client.store().registry().by_name("posts").is_some());
    assert!(client.store().registry().by_id("c_users").is_some());
    client.shutdown().await;
}

#[tokio::test]
async fn misc_validation_rejects_bad_payloads() {
    let (client, _remote, _connectivity) = open_client(true).await;
    let posts = client.collection("posts");

    let err = posts
        .create(obj(json!({"title": 42})), Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation { .. }));
    client.shutdown().await;
}
