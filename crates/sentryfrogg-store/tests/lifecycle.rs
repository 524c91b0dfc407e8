//! Integration test: full store lifecycle.
//!
//! Tests: open store -> upsert profiles -> list/get -> patch secret
//!        -> state + registries -> audit -> delete -> reopen

use sentryfrogg_store::Store;
use sentryfrogg_types::{
    AuditEntry, AuditStatus, ProfileKind, Project, Runbook, StateScope, Step, TargetBinding,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn setup() -> (Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Store::open_in(dir.path().to_path_buf()).unwrap();
    (store, dir)
}

fn pg_data() -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("host".into(), json!("db.example"));
    data.insert("port".into(), json!(5432));
    data.insert("database".into(), json!("app"));
    data
}

#[tokio::test]
async fn test_full_lifecycle() {
    let (store, dir) = setup();

    // ── 1. Upsert profiles ──────────────────────────────────
    let mut secrets = BTreeMap::new();
    secrets.insert("password".to_string(), "super-secret-db-pw".to_string());
    store
        .profiles
        .set("prod-db", ProfileKind::Postgresql, pg_data(), secrets)
        .await
        .unwrap();

    let mut ssh_secrets = BTreeMap::new();
    ssh_secrets.insert("private_key".to_string(), "-----BEGIN OPENSSH...".to_string());
    let mut ssh_data = Map::new();
    ssh_data.insert("host".into(), json!("bastion.example"));
    ssh_data.insert("username".into(), json!("deploy"));
    store
        .profiles
        .set("bastion", ProfileKind::Ssh, ssh_data, ssh_secrets)
        .await
        .unwrap();

    // ── 2. List & get ───────────────────────────────────────
    let all = store.profiles.list(None).await;
    assert_eq!(all.len(), 2);

    let pg_only = store.profiles.list(Some(ProfileKind::Postgresql)).await;
    assert_eq!(pg_only.len(), 1);
    assert_eq!(pg_only[0].name, "prod-db");
    assert_eq!(pg_only[0].secret_keys, vec!["password".to_string()]);

    let profile = store
        .profiles
        .get("prod-db", Some(ProfileKind::Postgresql))
        .await
        .unwrap();
    assert_eq!(profile.secrets["password"], "super-secret-db-pw");

    // Type guard
    assert!(store.profiles.get("prod-db", Some(ProfileKind::Ssh)).await.is_err());

    // Plaintext never reaches disk
    let raw = std::fs::read_to_string(dir.path().join("profiles.json")).unwrap();
    assert!(!raw.contains("super-secret-db-pw"));

    // ── 3. Patch one secret in place ────────────────────────
    store
        .profiles
        .set_secret("prod-db", "password", "rotated")
        .await
        .unwrap();
    let rotated = store.profiles.get("prod-db", None).await.unwrap();
    assert_eq!(rotated.secrets["password"], "rotated");
    assert_eq!(rotated.data["host"], json!("db.example"));

    // ── 4. State store ──────────────────────────────────────
    store
        .state
        .set(StateScope::Persistent, "last_run", json!({"rows": 10}))
        .await
        .unwrap();
    store
        .state
        .set(StateScope::Session, "cursor", json!("c1"))
        .await
        .unwrap();
    assert!(store.state.get(StateScope::Persistent, "last_run").await.is_some());
    assert!(store.state.get(StateScope::Persistent, "cursor").await.is_none());

    // ── 5. Registries ───────────────────────────────────────
    let mut targets = BTreeMap::new();
    targets.insert(
        "prod".to_string(),
        TargetBinding {
            postgres_profile: Some("prod-db".into()),
            ssh_profile: Some("bastion".into()),
            ..Default::default()
        },
    );
    store
        .projects
        .put(
            "svc",
            Project {
                name: "svc".into(),
                description: None,
                default_target: "prod".into(),
                targets,
            },
        )
        .await
        .unwrap();

    store
        .runbooks
        .put(
            "deploy",
            Runbook {
                name: "deploy".into(),
                description: Some("roll out".into()),
                inputs: None,
                steps: vec![Step {
                    id: "check".into(),
                    tool: "postgres".into(),
                    args: json!({"action": "query", "sql": "SELECT 1"}),
                    when: None,
                    retry: None,
                    stop_on_error: true,
                }],
                tags: vec![],
            },
        )
        .await
        .unwrap();

    store.aliases.put("sql", "postgres".to_string()).await.unwrap();
    store
        .presets
        .put("prod-pg", json!({"profile_name": "prod-db"}))
        .await
        .unwrap();

    assert_eq!(store.projects.names().await, vec!["svc".to_string()]);
    assert_eq!(store.runbooks.get("deploy").await.unwrap().steps.len(), 1);

    // ── 6. Audit ────────────────────────────────────────────
    store
        .audit
        .append(AuditEntry {
            timestamp: chrono::Utc::now(),
            tool: "postgres".into(),
            action: "query".into(),
            status: AuditStatus::Ok,
            trace_id: "t1".into(),
            span_id: "s1".into(),
            parent_span_id: None,
            duration_ms: Some(5),
            details: Some(json!({"sql": "SELECT 1", "password": "leak-me-not"})),
            error: None,
        })
        .await
        .unwrap();

    let entries = store.audit.read(None, None, None).await.unwrap();
    assert_eq!(entries.len(), 1);
    let audit_raw = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
    assert!(!audit_raw.contains("leak-me-not"));

    // ── 7. Delete & reopen ──────────────────────────────────
    assert!(store.profiles.delete("bastion").await.unwrap());
    assert!(!store.profiles.delete("bastion").await.unwrap());

    let reopened = Store::open_in(dir.path().to_path_buf()).unwrap();
    let survivors = reopened.profiles.list(None).await;
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].name, "prod-db");
    // Same key file decrypts the surviving profile
    let profile = reopened.profiles.get("prod-db", None).await.unwrap();
    assert_eq!(profile.secrets["password"], "rotated");

    // Persistent state survives too
    assert!(reopened
        .state
        .get(StateScope::Persistent, "last_run")
        .await
        .is_some());
    assert!(reopened.state.get(StateScope::Session, "cursor").await.is_none());
}
