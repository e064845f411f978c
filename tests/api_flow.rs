use culture_center::client::forms::{Attachment, DocumentForm, EventForm, FormPayload};
use culture_center::client::{ApiClient, ApiErrorKind, ApiRequest, FetchOptions, RetryPolicy};
use culture_center::config::AppConfig;
use culture_center::http::{build_router, AppState};
use culture_center::models::{CsrfTokenResponse, Document, Event, Role, User};
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ADMIN_USERNAME: &str = "curator";
const ADMIN_PASSWORD: &str = "gallery-pass";

struct TestServer {
    addr: SocketAddr,
    base_url: String,
    state: AppState,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let vars: HashMap<String, String> = [
            ("DATA_DIR", root.join("data").display().to_string()),
            ("UPLOADS_DIR", root.join("uploads").display().to_string()),
            ("LOG_DIR", root.join("logs").display().to_string()),
            ("ADMIN_USERNAME", ADMIN_USERNAME.to_string()),
            ("ADMIN_PASSWORD", ADMIN_PASSWORD.to_string()),
            ("BCRYPT_ROUNDS", "4".to_string()),
            ("RATE_LIMIT_AUTH_MAX", "1000".to_string()),
            ("RATE_LIMIT_MUTATION_MAX", "1000".to_string()),
            ("RATE_LIMIT_DOCUMENT_MAX", "1000".to_string()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();

        let config = AppConfig::from_lookup(move |name| vars.get(name).cloned()).expect("config");
        let state = AppState::initialize(config).await.expect("initialize state");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let router = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .expect("serve");
        });

        Self {
            addr,
            base_url: format!("http://{addr}/api"),
            state,
            _dir: dir,
        }
    }

    fn client(&self) -> ApiClient {
        ApiClient::new(&self.base_url).expect("client")
    }

    async fn admin(&self) -> ApiClient {
        let client = self.client();
        client.login(ADMIN_USERNAME, ADMIN_PASSWORD).await.expect("admin login");
        client
    }

    fn files_in(&self, folder: &str) -> BTreeSet<String> {
        std::fs::read_dir(self.state.uploads.root().join(folder))
            .expect("read upload folder")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
            .collect()
    }

    fn upload_path(&self, public_url: &str) -> std::path::PathBuf {
        self.state
            .uploads
            .resolve_public_url(public_url)
            .expect("public url under uploads root")
    }
}

fn concert_night() -> EventForm {
    EventForm {
        title: "Concert Night".to_string(),
        short_description: "A fun evening of music".to_string(),
        full_description: "Join us for live music in the main hall.".to_string(),
        date: "2025-12-01".to_string(),
        image: None,
    }
}

fn pdf(name: &str) -> Attachment {
    Attachment::new(name, "application/pdf", b"%PDF-1.4 test".to_vec())
}

async fn fresh_csrf(client: &ApiClient) -> String {
    client
        .api_fetch::<CsrfTokenResponse>(ApiRequest::get("/auth/csrf-token"), FetchOptions::default())
        .await
        .expect("csrf token")
        .csrf_token
}

/// Forwards to `target`, but hangs up on the first `drops` connections.
async fn flaky_relay(target: SocketAddr, drops: usize) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    tokio::spawn(async move {
        let mut dropped = 0;
        while let Ok((mut inbound, _)) = listener.accept().await {
            if dropped < drops {
                dropped += 1;
                drop(inbound);
                continue;
            }
            tokio::spawn(async move {
                if let Ok(mut outbound) = tokio::net::TcpStream::connect(target).await {
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                }
            });
        }
    });
    addr
}

fn file_count(path: &Path) -> usize {
    std::fs::read_dir(path).expect("read dir").count()
}

#[tokio::test]
async fn created_event_gets_next_id_and_no_image() {
    let server = TestServer::start().await;
    let admin = server.admin().await;

    let first = admin.create_event(&concert_night()).await.expect("create first");
    assert_eq!(first.id, 1);
    assert_eq!(first.image, None);
    assert_eq!(first.title, "Concert Night");
    assert_eq!(first.created_at, first.updated_at);
    let fetched = server.client().get_event(first.id, None).await.expect("fetch by id");
    assert_eq!(fetched, first);

    admin.delete_event(first.id).await.expect("delete");
    let second = admin.create_event(&concert_night()).await.expect("create second");
    assert_eq!(second.id, 2, "ids are never reused after deletion");

    let listed = server.client().list_events(None).await.expect("public list");
    assert_eq!(listed.iter().map(|event| event.id).collect::<Vec<_>>(), vec![2]);
}

#[tokio::test]
async fn concurrent_creates_get_distinct_sequential_ids() {
    let server = TestServer::start().await;
    let admin = Arc::new(server.admin().await);

    let mut tasks = Vec::new();
    for index in 0..20 {
        let admin = admin.clone();
        tasks.push(tokio::spawn(async move {
            let mut form = concert_night();
            form.title = format!("Concert Night {index}");
            admin.create_event(&form).await.expect("concurrent create")
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.expect("join").id);
    }
    ids.sort_unstable();
    assert_eq!(ids, (1..=20).collect::<Vec<u64>>());

    let stored: Vec<Event> = server.state.store.all().await;
    assert_eq!(stored.len(), 20);

    let page = admin.list_events_page(2, 8).await.expect("page");
    assert_eq!(page.data.len(), 8);
    assert_eq!(page.pagination.total, 20);
    assert_eq!(page.pagination.total_pages, 3);
}

#[tokio::test]
async fn server_enforces_title_length_boundary() {
    let server = TestServer::start().await;
    let admin = server.admin().await;
    let token = fresh_csrf(&admin).await;

    let body = |title: &str| {
        json!({
            "title": title,
            "shortDescription": "A fun evening of music",
            "fullDescription": "Join us for live music in the main hall.",
            "date": "2025-12-01",
        })
    };

    let rejected = admin
        .api_fetch::<Event>(
            ApiRequest::new(Method::POST, "/events").json(body("Ab")).with_csrf(token.clone()),
            FetchOptions::default(),
        )
        .await
        .expect_err("two characters");
    assert_eq!(rejected.status, Some(400));
    assert_eq!(rejected.message, "Validation failed");
    assert_eq!(rejected.details, vec!["title must be at least 3 characters".to_string()]);

    let accepted = admin
        .api_fetch::<Event>(
            ApiRequest::new(Method::POST, "/events").json(body("Abc")).with_csrf(token),
            FetchOptions::default(),
        )
        .await
        .expect("three characters");
    assert_eq!(accepted.title, "Abc");
}

#[tokio::test]
async fn rejected_file_type_leaves_nothing_on_disk() {
    let server = TestServer::start().await;
    let admin = server.admin().await;
    let token = fresh_csrf(&admin).await;

    let mut fields = std::collections::BTreeMap::new();
    fields.insert("title".to_string(), "Installer".to_string());
    let payload = FormPayload {
        fields,
        file: Some(("file", Attachment::new("tool.exe", "application/octet-stream", b"MZ".to_vec()))),
    };
    let error = admin
        .api_fetch::<Document>(
            ApiRequest::new(Method::POST, "/documents").form(payload).with_csrf(token),
            FetchOptions::default(),
        )
        .await
        .expect_err("exe rejected");
    assert_eq!(error.status, Some(400));
    assert_eq!(error.message, "File type is not allowed");

    server.state.uploads.cleanup().settled().await;
    assert_eq!(file_count(&server.state.uploads.root().join("documents")), 0);
    assert!(server.state.store.all::<Document>().await.is_empty());
}

#[tokio::test]
async fn document_file_replacement_and_failed_update() {
    let server = TestServer::start().await;
    let admin = server.admin().await;

    let created = admin
        .create_document(&DocumentForm {
            title: "Statute".to_string(),
            description: Some("Founding statute".to_string()),
            category: Some("legal".to_string()),
            file: Some(pdf("statute.pdf")),
        })
        .await
        .expect("create document");
    assert!(created.file_url.starts_with("/uploads/documents/doc-"));
    assert!(created.file_url.ends_with(".pdf"));
    let original_path = server.upload_path(&created.file_url);
    assert!(original_path.exists());

    let updated = admin
        .update_document(
            created.id,
            &DocumentForm {
                title: "Statute 2025".to_string(),
                description: Some(String::new()),
                category: Some("legal".to_string()),
                file: Some(pdf("statute-2025.pdf")),
            },
        )
        .await
        .expect("update document");
    assert_ne!(updated.file_url, created.file_url);
    assert_eq!(updated.description, None, "an empty optional field clears the value");
    assert_eq!(updated.category.as_deref(), Some("legal"));

    server.state.uploads.cleanup().settled().await;
    assert!(!original_path.exists(), "replaced file is cleaned up");
    let current_path = server.upload_path(&updated.file_url);
    assert!(current_path.exists());
    let before = server.files_in("documents");

    let token = fresh_csrf(&admin).await;
    let mut fields = std::collections::BTreeMap::new();
    fields.insert("title".to_string(), String::new());
    let payload = FormPayload {
        fields,
        file: Some(("file", pdf("ignored.pdf"))),
    };
    let error = admin
        .api_fetch::<Document>(
            ApiRequest::new(Method::PUT, format!("/documents/{}", created.id))
                .form(payload)
                .with_csrf(token),
            FetchOptions::default(),
        )
        .await
        .expect_err("empty title");
    assert_eq!(error.status, Some(400));

    server.state.uploads.cleanup().settled().await;
    assert_eq!(server.files_in("documents"), before, "staged upload of a failed update is removed");
    let stored = server.state.store.get::<Document>(created.id).await.expect("still stored");
    assert_eq!(stored.file_url, updated.file_url);

    admin.delete_document(created.id).await.expect("delete");
    server.state.uploads.cleanup().settled().await;
    assert!(!current_path.exists());
}

#[tokio::test]
async fn update_of_missing_document_discards_staged_upload() {
    let server = TestServer::start().await;
    let admin = server.admin().await;
    admin
        .create_document(&DocumentForm {
            title: "Statute".to_string(),
            description: None,
            category: None,
            file: Some(pdf("statute.pdf")),
        })
        .await
        .expect("create document");
    let before = server.files_in("documents");
    let token = fresh_csrf(&admin).await;

    let mut fields = std::collections::BTreeMap::new();
    fields.insert("title".to_string(), "Ghost".to_string());
    let payload = FormPayload {
        fields,
        file: Some(("file", pdf("ghost.pdf"))),
    };
    let error = admin
        .api_fetch::<Document>(
            ApiRequest::new(Method::PUT, "/documents/999").form(payload).with_csrf(token),
            FetchOptions::default(),
        )
        .await
        .expect_err("missing document");
    assert_eq!(error.status, Some(404));

    server.state.uploads.cleanup().settled().await;
    assert_eq!(server.files_in("documents"), before);
}

#[tokio::test]
async fn stale_csrf_token_is_dropped_and_refetched() {
    let server = TestServer::start().await;
    let admin = server.admin().await;
    assert!(!admin.csrf_cache().await.is_empty());

    let error = admin
        .api_fetch::<Event>(
            ApiRequest::new(Method::POST, "/events")
                .json(json!({"title": "Concert Night"}))
                .with_csrf("c2FsdA.bm90LWEtc2lnbmF0dXJl".to_string()),
            FetchOptions::default(),
        )
        .await
        .expect_err("forged token");
    assert_eq!(error.status, Some(403));
    assert_eq!(error.message, "Session is stale. Refresh and retry the action");
    assert!(admin.csrf_cache().await.is_empty());

    let event = admin.create_event(&concert_night()).await.expect("retry with fresh token");
    assert_eq!(event.id, 1);
    assert!(!admin.csrf_cache().await.is_empty());
}

#[tokio::test]
async fn deleting_missing_record_leaves_store_untouched() {
    let server = TestServer::start().await;
    let admin = server.admin().await;
    admin.create_event(&concert_night()).await.expect("create");

    let data_file = server.state.store.path().to_path_buf();
    let before = std::fs::read(&data_file).expect("read store");

    let error = admin.delete_event(999).await.expect_err("missing id");
    assert_eq!(error.status, Some(404));
    assert_eq!(error.message, "Resource not found");

    let after = std::fs::read(&data_file).expect("read store");
    assert_eq!(before, after);
}

#[tokio::test]
async fn auth_gate_distinguishes_anonymous_and_non_admin() {
    let server = TestServer::start().await;

    let anonymous = server.client();
    let error = anonymous.create_event(&concert_night()).await.expect_err("anonymous");
    assert_eq!(error.status, Some(401));
    assert_eq!(error.message, "Authentication required");

    let hash = server
        .state
        .auth
        .hash_password("volunteer-pass".to_string())
        .await
        .expect("hash");
    server
        .state
        .store
        .create(move |id, now| User {
            id,
            username: "volunteer".to_string(),
            password: hash,
            role: Role::User,
            created_at: now,
        })
        .await
        .expect("seed user");

    let member = server.client();
    let login = member.login("volunteer", "volunteer-pass").await.expect("member login");
    assert_eq!(login.user.role, Role::User);
    let error = member.create_event(&concert_night()).await.expect_err("not admin");
    assert_eq!(error.status, Some(403));
    assert_eq!(error.message, "Insufficient permissions");

    let verified = member.verify_token(None).await;
    assert!(verified.valid);
    member.logout().await.expect("logout");
    assert!(member.csrf_cache().await.is_empty());
    assert!(!member.verify_token(None).await.valid);

    let error = server.client().login(ADMIN_USERNAME, "wrong").await.expect_err("bad password");
    assert_eq!(error.status, Some(401));
}

#[tokio::test]
async fn health_reports_store_and_cleanup_state() {
    let server = TestServer::start().await;
    let health = server.client().health().await.expect("health");
    assert_eq!(health.status, "ok");
    assert_eq!(health.database, "connected");
    assert_eq!(health.environment, "development");
    assert_eq!(health.uploads_cleanup.pending, 0);

    let missing: Value = reqwest::get(format!("{}/nothing-here", server.base_url))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(missing["error"], "Endpoint not found");
}

#[tokio::test]
async fn reads_retry_with_backoff_but_writes_do_not() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = closed.local_addr().expect("addr");
    drop(closed);

    let client = ApiClient::with_retry_policy(
        format!("http://{addr}/api"),
        RetryPolicy {
            base_backoff: Duration::from_millis(40),
        },
    )
    .expect("client");

    let started = Instant::now();
    let error = client.list_events(None).await.expect_err("unreachable");
    assert_eq!(error.kind, ApiErrorKind::Network);
    assert!(started.elapsed() >= Duration::from_millis(40 + 80 + 160));

    let slow = ApiClient::with_retry_policy(
        format!("http://{addr}/api"),
        RetryPolicy {
            base_backoff: Duration::from_secs(5),
        },
    )
    .expect("client");
    let started = Instant::now();
    let error = slow
        .api_fetch::<Value>(
            ApiRequest::new(Method::POST, "/events").json(json!({})),
            FetchOptions::default(),
        )
        .await
        .expect_err("unreachable");
    assert_eq!(error.kind, ApiErrorKind::Network);
    assert!(started.elapsed() < Duration::from_secs(5), "writes are attempted once");
}

#[tokio::test]
async fn retried_reads_leave_store_untouched() {
    let server = TestServer::start().await;
    let admin = server.admin().await;
    admin.create_event(&concert_night()).await.expect("create");
    let expected = server.client().list_events(None).await.expect("direct list");

    let data_file = server.state.store.path().to_path_buf();
    let before = std::fs::read(&data_file).expect("read store");

    let relay = flaky_relay(server.addr, 2).await;
    let client = ApiClient::with_retry_policy(
        format!("http://{relay}/api"),
        RetryPolicy {
            base_backoff: Duration::from_millis(40),
        },
    )
    .expect("client");
    let started = Instant::now();
    let listed = client.list_events(None).await.expect("list after retries");
    assert!(started.elapsed() >= Duration::from_millis(40 + 80), "two retries happened");
    assert_eq!(listed, expected);

    let after = std::fs::read(&data_file).expect("read store");
    assert_eq!(before, after);
}

#[tokio::test]
async fn unresponsive_server_times_out_without_retry() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let client = ApiClient::new(format!("http://{addr}/api")).expect("client");
    let options = FetchOptions {
        timeout: Duration::from_millis(150),
        ..FetchOptions::default()
    };
    let started = Instant::now();
    let error = client
        .api_fetch::<Value>(ApiRequest::get("/events"), options)
        .await
        .expect_err("timeout");
    assert_eq!(error.kind, ApiErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(1));
}
