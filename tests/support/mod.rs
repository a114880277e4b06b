#![allow(dead_code)]
//! In-process stand-in for the ZFS Storage Appliance REST interface.
//!
//! Serves just enough of the v2 surface for the end-to-end scenarios:
//! session tokens, pools, projects, target groups, LUNs with initiator-group
//! masking, filesystems, and snapshots, all wrapped in the appliance's list
//! envelope. Counters record the calls the scenarios assert on.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const POOL: &str = "p";
pub const PROJECT: &str = "j";
pub const TARGET_GROUP: &str = "tg";
pub const TARGET_IQN: &str = "iqn.1986-03.com.sun:02:stub-target";
pub const POOL_AVAILABLE: i64 = 10 * (1 << 40);
pub const PROJECT_AVAILABLE: i64 = 5 * (1 << 40);

#[derive(Clone)]
pub struct LunRecord {
    pub pool: String,
    pub project: String,
    pub name: String,
    pub size: i64,
    pub block_size: i64,
    pub sparse: bool,
    pub target_group: String,
    pub initiator_group: Vec<String>,
    pub assigned: i32,
}

impl LunRecord {
    fn href(&self) -> String {
        format!(
            "/api/storage/v2/pools/{}/projects/{}/luns/{}",
            self.pool, self.project, self.name
        )
    }

    fn body(&self) -> Value {
        json!({
            "volsize": self.size as f64,
            "volblocksize": self.block_size,
            "sparse": self.sparse,
            "canonical_name": format!("{}/local/{}/{}", self.pool, self.project, self.name),
            "pool": self.pool,
            "project": self.project,
            "name": self.name,
            "href": self.href(),
            "assignednumber": [self.assigned],
            "initiatorgroup": self.initiator_group,
            "targetgroup": self.target_group,
        })
    }
}

#[derive(Clone)]
pub struct FilesystemRecord {
    pub pool: String,
    pub project: String,
    pub name: String,
    pub quota: i64,
    pub share_nfs: String,
    pub restrict_chown: bool,
    pub readonly: bool,
}

impl FilesystemRecord {
    fn href(&self) -> String {
        format!(
            "/api/storage/v2/pools/{}/projects/{}/filesystems/{}",
            self.pool, self.project, self.name
        )
    }

    fn body(&self) -> Value {
        json!({
            "mountpoint": format!("/export/{}", self.name),
            "creation": "2024-05-06T10:00:00",
            "rstchown": self.restrict_chown,
            "sharenfs": self.share_nfs,
            "quota": self.quota,
            "reservation": self.quota,
            "readonly": self.readonly,
            "pool": self.pool,
            "project": self.project,
            "name": self.name,
            "href": self.href(),
        })
    }
}

#[derive(Clone)]
pub struct SnapshotRecord {
    pub kind: &'static str,
    pub pool: String,
    pub project: String,
    pub volume: String,
    pub name: String,
    pub num_clones: i64,
    pub space_data: i64,
}

impl SnapshotRecord {
    fn href(&self) -> String {
        format!(
            "/api/storage/v2/pools/{}/projects/{}/{}/{}/snapshots/{}",
            self.pool, self.project, self.kind, self.volume, self.name
        )
    }

    fn body(&self) -> Value {
        json!({
            "name": self.name,
            "numclones": self.num_clones,
            "creation": "2024-05-06T10:00:00",
            "project": self.project,
            "pool": self.pool,
            "space_unique": self.space_data / 2,
            "space_data": self.space_data,
            "href": self.href(),
        })
    }
}

#[derive(Default)]
pub struct StubState {
    pub luns: Mutex<HashMap<String, LunRecord>>,
    pub filesystems: Mutex<HashMap<String, FilesystemRecord>>,
    pub snapshots: Mutex<HashMap<(String, String), SnapshotRecord>>,
    pub sessions: Mutex<HashSet<String>>,
    session_seq: AtomicUsize,
    pub token_posts: AtomicUsize,
    pub lun_posts: AtomicUsize,
    pub lun_deletes: AtomicUsize,
    pub filesystem_posts: AtomicUsize,
    pub snapshot_posts: AtomicUsize,
    pub token_delay: Mutex<Option<Duration>>,
}

impl StubState {
    pub fn token_posts(&self) -> usize {
        self.token_posts.load(Ordering::SeqCst)
    }

    pub fn lun_posts(&self) -> usize {
        self.lun_posts.load(Ordering::SeqCst)
    }

    pub fn lun_deletes(&self) -> usize {
        self.lun_deletes.load(Ordering::SeqCst)
    }

    pub fn snapshot_posts(&self) -> usize {
        self.snapshot_posts.load(Ordering::SeqCst)
    }

    /// Invalidates every live session so the next request answers 401.
    pub fn revoke_sessions(&self) {
        self.sessions.lock().clear();
    }

    /// Slows token creation down, widening the race window the coalescing
    /// scenarios need.
    pub fn delay_token_creation(&self, delay: Duration) {
        *self.token_delay.lock() = Some(delay);
    }

    /// Puts a LUN on the appliance behind the driver's back.
    pub fn seed_lun(&self, name: &str, size: i64, initiator_group: Vec<String>) {
        self.luns.lock().insert(
            name.to_owned(),
            LunRecord {
                pool: POOL.into(),
                project: PROJECT.into(),
                name: name.to_owned(),
                size,
                block_size: 8192,
                sparse: false,
                target_group: TARGET_GROUP.into(),
                initiator_group,
                assigned: 0,
            },
        );
    }

    pub fn initiator_group_of(&self, name: &str) -> Option<Vec<String>> {
        self.luns.lock().get(name).map(|lun| lun.initiator_group.clone())
    }
}

fn fault(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "fault": { "message": message, "code": status.as_u16(), "Name": message }
        })),
    )
        .into_response()
}

fn envelope(key: &str, items: Vec<Value>) -> Response {
    let mut body = serde_json::Map::new();
    body.insert(key.to_owned(), Value::Array(items));
    Json(Value::Object(body)).into_response()
}

async fn require_session(
    State(state): State<Arc<StubState>>,
    req: Request,
    next: Next,
) -> Response {
    let is_token_post = req.uri().path() == "/api/access/v2" && req.method() == axum::http::Method::POST;
    if !is_token_post {
        let authorized = req
            .headers()
            .get("X-Auth-Session")
            .and_then(|v| v.to_str().ok())
            .map(|session| state.sessions.lock().contains(session))
            .unwrap_or(false);
        if !authorized {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn post_token(State(state): State<Arc<StubState>>) -> Response {
    let delay = *state.token_delay.lock();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    state.token_posts.fetch_add(1, Ordering::SeqCst);
    let session = format!("sess-{}", state.session_seq.fetch_add(1, Ordering::SeqCst));
    state.sessions.lock().insert(session.clone());
    (
        StatusCode::CREATED,
        [
            ("x-auth-session", session),
            ("x-auth-name", "admin".to_owned()),
        ],
    )
        .into_response()
}

async fn get_services() -> Response {
    envelope(
        "services",
        vec![json!({"version": "1.0", "name": "access", "uri": "/api/access/v2"})],
    )
}

async fn get_pools() -> Response {
    envelope(
        "pools",
        vec![json!({
            "status": "online",
            "name": POOL,
            "usage": { "available": POOL_AVAILABLE },
            "href": format!("/api/storage/v2/pools/{POOL}"),
            "asn": "stub-asn",
        })],
    )
}

async fn get_pool(Path(pool): Path<String>) -> Response {
    if pool != POOL {
        return fault(StatusCode::NOT_FOUND, "no such pool");
    }
    Json(json!({
        "pool": {
            "status": "online",
            "name": POOL,
            "usage": { "available": POOL_AVAILABLE },
            "href": format!("/api/storage/v2/pools/{POOL}"),
            "asn": "stub-asn",
        }
    }))
    .into_response()
}

async fn get_project(Path((pool, project)): Path<(String, String)>) -> Response {
    if pool != POOL || project != PROJECT {
        return fault(StatusCode::NOT_FOUND, "no such project");
    }
    Json(json!({
        "project": { "name": PROJECT, "pool": POOL, "space_available": PROJECT_AVAILABLE }
    }))
    .into_response()
}

async fn get_target_group(Path((protocol, group)): Path<(String, String)>) -> Response {
    if protocol != "iscsi" || group != TARGET_GROUP {
        return fault(StatusCode::NOT_FOUND, "no such target group");
    }
    Json(json!({
        "group": { "name": TARGET_GROUP, "targets": [TARGET_IQN] }
    }))
    .into_response()
}

// -- LUNs -------------------------------------------------------------------

async fn post_lun(
    State(state): State<Arc<StubState>>,
    Path((pool, project)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    state.lun_posts.fetch_add(1, Ordering::SeqCst);
    let name = body["name"].as_str().unwrap_or_default().to_owned();
    let mut luns = state.luns.lock();
    if luns.contains_key(&name) {
        return fault(StatusCode::CONFLICT, "share already exists");
    }
    let record = LunRecord {
        pool,
        project,
        name: name.clone(),
        size: body["volsize"].as_i64().unwrap_or_default(),
        block_size: body["volblocksize"].as_i64().unwrap_or(8192),
        sparse: body["sparse"].as_bool().unwrap_or(false),
        target_group: body["targetgroup"].as_str().unwrap_or_default().to_owned(),
        initiator_group: body["initiatorgroup"]
            .as_array()
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|g| g.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default(),
        assigned: 0,
    };
    let response = (StatusCode::CREATED, Json(json!({ "lun": record.body() }))).into_response();
    luns.insert(name, record);
    response
}

async fn get_lun(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, name)): Path<(String, String, String)>,
) -> Response {
    match state.luns.lock().get(&name) {
        Some(record) => Json(json!({ "lun": record.body() })).into_response(),
        None => fault(StatusCode::NOT_FOUND, "no such lun"),
    }
}

async fn put_lun(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, name)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let mut luns = state.luns.lock();
    let Some(record) = luns.get_mut(&name) else {
        return fault(StatusCode::NOT_FOUND, "no such lun");
    };
    if let Some(groups) = body["initiatorgroup"].as_array() {
        record.initiator_group = groups
            .iter()
            .filter_map(|g| g.as_str().map(str::to_owned))
            .collect();
    }
    (StatusCode::ACCEPTED, Json(json!({ "lun": record.body() }))).into_response()
}

async fn delete_lun(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, name)): Path<(String, String, String)>,
) -> Response {
    if state.luns.lock().remove(&name).is_none() {
        return fault(StatusCode::NOT_FOUND, "no such lun");
    }
    state.lun_deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT.into_response()
}

async fn get_all_luns(State(state): State<Arc<StubState>>) -> Response {
    let records: Vec<Value> = state.luns.lock().values().map(LunRecord::body).collect();
    envelope("luns", records)
}

// -- Filesystems ------------------------------------------------------------

async fn post_filesystem(
    State(state): State<Arc<StubState>>,
    Path((pool, project)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    state.filesystem_posts.fetch_add(1, Ordering::SeqCst);
    let name = body["name"].as_str().unwrap_or_default().to_owned();
    let mut filesystems = state.filesystems.lock();
    if filesystems.contains_key(&name) {
        return fault(StatusCode::CONFLICT, "share already exists");
    }
    let record = FilesystemRecord {
        pool,
        project,
        name: name.clone(),
        quota: body["quota"].as_i64().unwrap_or_default(),
        share_nfs: body["sharenfs"].as_str().unwrap_or("on").to_owned(),
        restrict_chown: body["rstchown"].as_bool().unwrap_or(true),
        readonly: false,
    };
    let response = (
        StatusCode::CREATED,
        Json(json!({ "filesystem": record.body() })),
    )
        .into_response();
    filesystems.insert(name, record);
    response
}

async fn get_filesystem(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, name)): Path<(String, String, String)>,
) -> Response {
    match state.filesystems.lock().get(&name) {
        Some(record) => Json(json!({ "filesystem": record.body() })).into_response(),
        None => fault(StatusCode::NOT_FOUND, "no such filesystem"),
    }
}

async fn put_filesystem(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, name)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let mut filesystems = state.filesystems.lock();
    let Some(record) = filesystems.get_mut(&name) else {
        return fault(StatusCode::NOT_FOUND, "no such filesystem");
    };
    if let Some(quota) = body["quota"].as_i64() {
        record.quota = quota;
    }
    (
        StatusCode::ACCEPTED,
        Json(json!({ "filesystem": record.body() })),
    )
        .into_response()
}

async fn delete_filesystem(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, name)): Path<(String, String, String)>,
) -> Response {
    if state.filesystems.lock().remove(&name).is_none() {
        return fault(StatusCode::NOT_FOUND, "no such filesystem");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn get_all_filesystems(State(state): State<Arc<StubState>>) -> Response {
    let records: Vec<Value> = state
        .filesystems
        .lock()
        .values()
        .map(FilesystemRecord::body)
        .collect();
    envelope("filesystems", records)
}

// -- Snapshots --------------------------------------------------------------

fn create_snapshot(
    state: &StubState,
    kind: &'static str,
    pool: String,
    project: String,
    volume: String,
    body: &Value,
) -> Response {
    state.snapshot_posts.fetch_add(1, Ordering::SeqCst);
    let exists = match kind {
        "luns" => state.luns.lock().contains_key(&volume),
        _ => state.filesystems.lock().contains_key(&volume),
    };
    if !exists {
        return fault(StatusCode::NOT_FOUND, "no such volume");
    }
    let name = body["name"].as_str().unwrap_or_default().to_owned();
    let key = (volume.clone(), name.clone());
    let mut snapshots = state.snapshots.lock();
    if snapshots.contains_key(&key) {
        return fault(StatusCode::CONFLICT, "snapshot already exists");
    }
    let record = SnapshotRecord {
        kind,
        pool,
        project,
        volume,
        name,
        num_clones: 0,
        space_data: 1 << 20,
    };
    let response = (
        StatusCode::CREATED,
        Json(json!({ "snapshot": record.body() })),
    )
        .into_response();
    snapshots.insert(key, record);
    response
}

fn get_snapshot(state: &StubState, volume: String, name: String) -> Response {
    match state.snapshots.lock().get(&(volume, name)) {
        Some(record) => Json(json!({ "snapshot": record.body() })).into_response(),
        None => fault(StatusCode::NOT_FOUND, "no such snapshot"),
    }
}

fn delete_snapshot(state: &StubState, volume: String, name: String) -> Response {
    if state.snapshots.lock().remove(&(volume, name)).is_none() {
        return fault(StatusCode::NOT_FOUND, "no such snapshot");
    }
    StatusCode::NO_CONTENT.into_response()
}

fn volume_snapshots(state: &StubState, volume: &str) -> Response {
    let records: Vec<Value> = state
        .snapshots
        .lock()
        .values()
        .filter(|record| record.volume == volume)
        .map(SnapshotRecord::body)
        .collect();
    envelope("snapshots", records)
}

async fn post_lun_snapshot(
    State(state): State<Arc<StubState>>,
    Path((pool, project, volume)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Response {
    create_snapshot(&state, "luns", pool, project, volume, &body)
}

async fn get_lun_snapshots(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, volume)): Path<(String, String, String)>,
) -> Response {
    volume_snapshots(&state, &volume)
}

async fn get_lun_snapshot(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, volume, name)): Path<(String, String, String, String)>,
) -> Response {
    get_snapshot(&state, volume, name)
}

async fn delete_lun_snapshot(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, volume, name)): Path<(String, String, String, String)>,
) -> Response {
    delete_snapshot(&state, volume, name)
}

async fn post_filesystem_snapshot(
    State(state): State<Arc<StubState>>,
    Path((pool, project, volume)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Response {
    create_snapshot(&state, "filesystems", pool, project, volume, &body)
}

async fn get_filesystem_snapshots(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, volume)): Path<(String, String, String)>,
) -> Response {
    volume_snapshots(&state, &volume)
}

async fn get_filesystem_snapshot(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, volume, name)): Path<(String, String, String, String)>,
) -> Response {
    get_snapshot(&state, volume, name)
}

async fn delete_filesystem_snapshot(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, volume, name)): Path<(String, String, String, String)>,
) -> Response {
    delete_snapshot(&state, volume, name)
}

fn clone_snapshot(
    state: &StubState,
    kind: &'static str,
    volume: String,
    name: String,
    body: &Value,
) -> Response {
    let source_size = {
        let snapshots = state.snapshots.lock();
        let Some(record) = snapshots.get(&(volume.clone(), name)) else {
            return fault(StatusCode::NOT_FOUND, "no such snapshot");
        };
        record.space_data
    };
    let share = body["share"].as_str().unwrap_or_default().to_owned();
    let project = body["project"].as_str().unwrap_or(PROJECT).to_owned();

    if kind == "luns" {
        let source_lun = state.luns.lock().get(&volume).cloned();
        let Some(source) = source_lun else {
            return fault(StatusCode::NOT_FOUND, "no such volume");
        };
        let record = LunRecord {
            pool: source.pool.clone(),
            project,
            name: share.clone(),
            size: source.size.max(source_size),
            block_size: source.block_size,
            sparse: source.sparse,
            target_group: source.target_group.clone(),
            initiator_group: body["initiatorgroup"]
                .as_array()
                .map(|groups| {
                    groups
                        .iter()
                        .filter_map(|g| g.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default(),
            assigned: 0,
        };
        let response =
            (StatusCode::CREATED, Json(json!({ "lun": record.body() }))).into_response();
        state.luns.lock().insert(share, record);
        let mut snapshots = state.snapshots.lock();
        if let Some(record) = snapshots.values_mut().find(|r| r.volume == volume) {
            record.num_clones += 1;
        }
        response
    } else {
        let source_fs = state.filesystems.lock().get(&volume).cloned();
        let Some(source) = source_fs else {
            return fault(StatusCode::NOT_FOUND, "no such volume");
        };
        let record = FilesystemRecord {
            pool: source.pool.clone(),
            project,
            name: share.clone(),
            quota: source.quota,
            share_nfs: source.share_nfs.clone(),
            restrict_chown: source.restrict_chown,
            readonly: false,
        };
        let response = (
            StatusCode::CREATED,
            Json(json!({ "filesystem": record.body() })),
        )
            .into_response();
        state.filesystems.lock().insert(share, record);
        response
    }
}

async fn clone_lun_snapshot(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, volume, name)): Path<(String, String, String, String)>,
    Json(body): Json<Value>,
) -> Response {
    clone_snapshot(&state, "luns", volume, name, &body)
}

async fn clone_filesystem_snapshot(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, volume, name)): Path<(String, String, String, String)>,
    Json(body): Json<Value>,
) -> Response {
    clone_snapshot(&state, "filesystems", volume, name, &body)
}

async fn get_snapshot_dependents(
    State(state): State<Arc<StubState>>,
    Path((_pool, _project, volume, name)): Path<(String, String, String, String)>,
) -> Response {
    let clones = state
        .snapshots
        .lock()
        .get(&(volume, name))
        .map(|record| record.num_clones)
        .unwrap_or(0);
    let dependents: Vec<Value> = (0..clones)
        .map(|i| json!({"project": PROJECT, "href": format!("/clone-{i}"), "share": format!("clone-{i}")}))
        .collect();
    envelope("dependents", dependents)
}

async fn get_all_snapshots(State(state): State<Arc<StubState>>) -> Response {
    let records: Vec<Value> = state
        .snapshots
        .lock()
        .values()
        .map(SnapshotRecord::body)
        .collect();
    envelope("snapshots", records)
}

// -- Assembly ---------------------------------------------------------------

pub struct StubAppliance {
    pub state: Arc<StubState>,
    pub base_url: String,
}

/// Builds a driver wired to the stub, with scratch credentials. The returned
/// temp dir owns the credentials file and must outlive the driver.
pub fn driver_for(stub: &StubAppliance) -> (zfssa_csi::ZfssaDriver, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cred_path = dir.path().join("zfssa.yaml");
    std::fs::write(&cred_path, "username: admin\npassword: secret\n").expect("write credentials");

    let config = zfssa_csi::Config {
        appliance: "zs1".to_owned(),
        node_name: "node-1".to_owned(),
        endpoint: dir.path().join("csi.sock"),
        secure: false,
        certificate: None,
        cred_path,
        host_ip: "0.0.0.0".to_owned(),
        pod_ip: "0.0.0.0".to_owned(),
        log_level: 3,
    };
    let client = zfssa_csi::zfssa::ZfssaClient::with_base_url("zs1", &stub.base_url)
        .expect("stub client");
    let driver = zfssa_csi::ZfssaDriver::with_client("zfssa-csi-driver", "0.1.0", config, client);
    (driver, dir)
}

/// Starts the stub on an ephemeral port.
pub async fn spawn() -> StubAppliance {
    let state = Arc::new(StubState::default());

    let app = Router::new()
        .route("/api/access/v2", post(post_token).get(get_services))
        .route("/api/storage/v2/pools", get(get_pools))
        .route("/api/storage/v2/pools/:pool", get(get_pool))
        .route(
            "/api/storage/v2/pools/:pool/projects/:project",
            get(get_project),
        )
        .route("/api/san/v2/:protocol/target-groups/:group", get(get_target_group))
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/luns",
            post(post_lun),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/luns/:name",
            get(get_lun).put(put_lun).delete(delete_lun),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/luns/:name/snapshots",
            post(post_lun_snapshot).get(get_lun_snapshots),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/luns/:name/snapshots/:snap",
            get(get_lun_snapshot).delete(delete_lun_snapshot),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/luns/:name/snapshots/:snap/dependents",
            get(get_snapshot_dependents),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/luns/:name/snapshots/:snap/clone",
            axum::routing::put(clone_lun_snapshot),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/filesystems",
            post(post_filesystem),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/filesystems/:name",
            get(get_filesystem).put(put_filesystem).delete(delete_filesystem),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/filesystems/:name/snapshots",
            post(post_filesystem_snapshot).get(get_filesystem_snapshots),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/filesystems/:name/snapshots/:snap",
            get(get_filesystem_snapshot).delete(delete_filesystem_snapshot),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/filesystems/:name/snapshots/:snap/dependents",
            get(get_snapshot_dependents),
        )
        .route(
            "/api/storage/v2/pools/:pool/projects/:project/filesystems/:name/snapshots/:snap/clone",
            axum::routing::put(clone_filesystem_snapshot),
        )
        .route("/api/storage/v2/luns", get(get_all_luns))
        .route("/api/storage/v2/filesystems", get(get_all_filesystems))
        .route("/api/storage/v2/snapshots", get(get_all_snapshots))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_session,
        ))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("stub address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub");
    });

    StubAppliance {
        state,
        base_url: format!("http://{addr}"),
    }
}
