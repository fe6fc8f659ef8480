use actix_web::http::{header, StatusCode};
use actix_web::test::{self, TestRequest};
use actix_web::web::Data;
use actix_web::App;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cogs::models::file::FileStorage;
use cogs::models::run::RunResult;
use cogs::queue::{AcceptanceGrader, GradeFault, GradeJob, Grader};
use cogs::routes::{register_routes, UploadLimit};
use cogs::store::{MemoryStore, Store};
use cogs::Context;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::ZipWriter;

const BOUNDARY: &str = "cogs-test-boundary";

fn context(dir: &TempDir) -> Context {
    Context::new(
        Arc::new(MemoryStore::new()),
        FileStorage::new(dir.path()).unwrap(),
        b"test-secret",
        Arc::new(AcceptanceGrader),
        2,
    )
}

fn basic(name: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", name, password)))
}

fn multipart(parts: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (key, filename, content) in parts {
        write!(
            body,
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            BOUNDARY, key, filename
        )
        .unwrap();
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    write!(body, "--{}--\r\n", BOUNDARY).unwrap();
    body
}

fn upload(auth: &str, parts: &[(&str, &str, &[u8])]) -> TestRequest {
    TestRequest::post()
        .uri("/files/")
        .insert_header((header::AUTHORIZATION, auth.to_string()))
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        ))
        .set_payload(multipart(parts))
}

fn zip_of(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in members {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn get(uri: &str, auth: &str) -> TestRequest {
    TestRequest::get()
        .uri(uri)
        .insert_header((header::AUTHORIZATION, auth.to_string()))
}

fn with_json(req: TestRequest, uri: &str, auth: &str, body: Value) -> TestRequest {
    req.uri(uri)
        .insert_header((header::AUTHORIZATION, auth.to_string()))
        .set_json(body)
}

fn post(uri: &str, auth: &str, body: Value) -> TestRequest {
    with_json(TestRequest::post(), uri, auth, body)
}

fn put(uri: &str, auth: &str, body: Value) -> TestRequest {
    with_json(TestRequest::put(), uri, auth, body)
}

fn delete(uri: &str, auth: &str) -> TestRequest {
    TestRequest::delete()
        .uri(uri)
        .insert_header((header::AUTHORIZATION, auth.to_string()))
}

fn delete_json(uri: &str, auth: &str, body: Value) -> TestRequest {
    with_json(TestRequest::delete(), uri, auth, body)
}

macro_rules! app {
    ($ctx:expr) => {
        test::init_service(
            App::new()
                .app_data(Data::new($ctx.clone()))
                .configure(register_routes),
        )
        .await
    };
}

macro_rules! send {
    ($app:expr, $req:expr) => {{
        let resp = test::call_service(&$app, $req.to_request()).await;
        let status = resp.status();
        let body = test::read_body(resp).await;
        let json: Value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }};
}

fn only_id(body: &Value, key: &str) -> String {
    let ids = body[key].as_array().unwrap();
    assert_eq!(ids.len(), 1, "{}", body);
    ids[0].as_str().unwrap().to_string()
}

#[actix_web::test]
async fn first_login_signs_up_and_tokens_authenticate() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let app = app!(ctx);
    let alice = basic("alice", "wonderland");

    let (status, _) = send!(app, TestRequest::get().uri("/assignments/"));
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send!(app, get("/tokens/", &alice));
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    let (status, _) = send!(app, get("/tokens/", &alice));
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send!(app, get("/assignments/", &format!("Bearer {}", token)));
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send!(app, get("/assignments/", &basic(&token, "")));
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send!(app, get("/assignments/", &basic("alice", "nope")));
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send!(app, post("/tokens/", &alice, json!({})));
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["token"].as_str().unwrap(), token);
    let (status, _) = send!(app, get("/assignments/", &format!("Bearer {}", token)));
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn only_owner_or_admin_may_touch_a_resource() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    ctx.auth.ensure_user("root", "toor", true).unwrap();
    let app = app!(ctx);
    let (alice, bob, root) = (basic("alice", "a"), basic("bob", "b"), basic("root", "toor"));

    let (status, body) = send!(app, post("/assignments/", &alice, json!({ "name": "hw1" })));
    assert_eq!(status, StatusCode::OK);
    let id = only_id(&body, "assignments");
    let uri = format!("/assignments/{}/", id);

    let (status, body) = send!(app, get(&uri, &alice));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[&id]["name"], "hw1");

    let (status, _) = send!(app, get(&uri, &bob));
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send!(app, put(&uri, &bob, json!({ "name": "mine" })));
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send!(app, delete(&uri, &bob));
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send!(app, put(&uri, &root, json!({ "env": "python" })));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[&id]["name"], "hw1");
    assert_eq!(body[&id]["env"], "python");

    let (status, _) = send!(app, delete(&uri, &alice));
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send!(app, get(&uri, &alice));
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn rejected_input_leaves_state_alone() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let app = app!(ctx);
    let alice = basic("alice", "a");

    let (status, _) = send!(app, post("/assignments/", &alice, json!({ "env": "c" })));
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (_, body) = send!(app, get("/assignments/", &alice));
    assert_eq!(body["assignments"], json!([]));

    let (_, body) = send!(app, post("/assignments/", &alice, json!({ "name": "hw" })));
    let uri = format!("/assignments/{}/", only_id(&body, "assignments"));
    let (status, _) = send!(app, put(&uri, &alice, json!({ "name": "x", "bogus": 1 })));
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (_, body) = send!(app, get(&uri, &alice));
    let fields = body.as_object().unwrap().values().next().unwrap();
    assert_eq!(fields["name"], "hw");
    assert!(fields.get("bogus").is_none());

    let (status, _) = send!(app, get("/assignments/not-a-uuid/", &alice));
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send!(app, get("/widgets/", &alice));
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send!(app, put("/files/", &alice, json!({})));
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[actix_web::test]
async fn relations_are_idempotent_and_follow_deletes() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let app = app!(ctx);
    let alice = basic("alice", "a");

    let (_, body) = send!(app, post("/assignments/", &alice, json!({ "name": "hw" })));
    let assignment = only_id(&body, "assignments");
    let (status, body) = send!(
        app,
        post(
            &format!("/assignments/{}/tests/", assignment),
            &alice,
            json!({ "name": "t1", "maxscore": 10 })
        )
    );
    assert_eq!(status, StatusCode::OK);
    let test_id = only_id(&body, "tests");

    let (status, body) = send!(app, upload(&alice, &[("file", "input.txt", b"1 2\n")]));
    assert_eq!(status, StatusCode::OK);
    let file = only_id(&body, "files");

    let files_uri = format!("/tests/{}/files/", test_id);
    for _ in 0..2 {
        let (status, body) = send!(app, put(&files_uri, &alice, json!({ "files": [file] })));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["files"], json!([file]));
    }

    let (status, _) = send!(
        app,
        put(&files_uri, &alice, json!({ "files": [uuid::Uuid::new_v4().to_string()] }))
    );
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send!(app, delete(&format!("/files/{}/", file), &alice));
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send!(app, get(&files_uri, &alice));
    assert_eq!(body["files"], json!([]));

    let (_, body) = send!(app, get(&format!("/assignments/{}/tests/", assignment), &alice));
    assert_eq!(body["tests"], json!([test_id]));
}

#[actix_web::test]
async fn archives_unpack_into_one_file_per_member() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let app = app!(ctx);
    let alice = basic("alice", "a");

    let archive = zip_of(&[("a.txt", b"a"), ("b.txt", b"b"), ("c.txt", b"c")]);
    let (status, body) = send!(app, upload(&alice, &[("extract", "bundle.zip", archive.as_slice())]));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["files"].as_array().unwrap().len(), 3);
    assert!(body.get("failures").is_none());

    let (status, _) = send!(app, upload(&alice, &[("extract", "broken.zip", b"not a zip")]));
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send!(app, get("/files/", &alice));
    assert_eq!(body["files"].as_array().unwrap().len(), 3);
}

async fn wait_for_run<S, F>(mut poll: F) -> Value
where
    F: FnMut() -> S,
    S: std::future::Future<Output = Value>,
{
    for _ in 0..100 {
        let run = poll().await;
        if run["status"] == "complete" || run["status"] == "failed" {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run never finished");
}

#[actix_web::test]
async fn runs_are_queued_then_graded() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let app = app!(ctx);
    let alice = basic("alice", "a");

    let (_, body) = send!(app, post("/assignments/", &alice, json!({ "name": "hw" })));
    let assignment = only_id(&body, "assignments");
    let (_, body) = send!(
        app,
        post(
            &format!("/assignments/{}/tests/", assignment),
            &alice,
            json!({ "name": "t1", "maxscore": 5 })
        )
    );
    let test_id = only_id(&body, "tests");

    let mut submissions = Vec::new();
    for _ in 0..2 {
        let (_, body) = send!(
            app,
            post(
                &format!("/assignments/{}/submissions/", assignment),
                &alice,
                json!({ "comments": "first try" })
            )
        );
        submissions.push(only_id(&body, "submissions"));
    }
    let (_, body) = send!(app, upload(&alice, &[("file", "main.py", b"print(1)\n")]));
    let file = only_id(&body, "files");
    let (status, _) = send!(
        app,
        put(
            &format!("/submissions/{}/files/", submissions[0]),
            &alice,
            json!({ "files": [file] })
        )
    );
    assert_eq!(status, StatusCode::OK);

    let mut runs = Vec::new();
    for submission in &submissions {
        let (status, body) = send!(
            app,
            post(
                &format!("/submissions/{}/runs/", submission),
                &alice,
                json!({ "test": test_id })
            )
        );
        assert_eq!(status, StatusCode::OK);
        runs.push(only_id(&body, "runs"));
    }

    let graded = wait_for_run(|| {
        let uri = format!("/runs/{}/", runs[0]);
        let req = get(&uri, &alice);
        let id = runs[0].clone();
        let app = &app;
        async move {
            let (_, body) = send!(*app, req);
            body[&id].clone()
        }
    })
    .await;
    assert_eq!(graded["status"], "complete");
    assert_eq!(graded["result"]["score"], 5.0);
    assert!(!graded["finished"].is_null());

    let failed = wait_for_run(|| {
        let uri = format!("/runs/{}/", runs[1]);
        let req = get(&uri, &alice);
        let id = runs[1].clone();
        let app = &app;
        async move {
            let (_, body) = send!(*app, req);
            body[&id].clone()
        }
    })
    .await;
    assert_eq!(failed["status"], "failed");

    let (status, _) = send!(app, put(&format!("/runs/{}/", runs[0]), &alice, json!({})));
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (_, body) = send!(app, post("/assignments/", &alice, json!({ "name": "other" })));
    let other = only_id(&body, "assignments");
    let (_, body) = send!(
        app,
        post(
            &format!("/assignments/{}/tests/", other),
            &alice,
            json!({ "name": "elsewhere" })
        )
    );
    let foreign_test = only_id(&body, "tests");
    let (status, _) = send!(
        app,
        post(
            &format!("/submissions/{}/runs/", submissions[0]),
            &alice,
            json!({ "test": foreign_test })
        )
    );
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send!(app, delete(&format!("/assignments/{}/", assignment), &alice));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cascaded"].as_array().unwrap().len(), 5);
    let (status, _) = send!(app, get(&format!("/runs/{}/", runs[0]), &alice));
    assert_eq!(status, StatusCode::NOT_FOUND);
}

fn id_set(body: &Value, key: &str) -> BTreeSet<String> {
    body[key]
        .as_array()
        .unwrap()
        .iter()
        .map(|id| id.as_str().unwrap().to_string())
        .collect()
}

fn set_of(ids: &[&String]) -> BTreeSet<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

#[actix_web::test]
async fn relation_edits_reconcile_as_sets() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let app = app!(ctx);
    let (alice, bob) = (basic("alice", "a"), basic("bob", "b"));

    let (_, body) = send!(app, post("/assignments/", &alice, json!({ "name": "hw" })));
    let assignment = only_id(&body, "assignments");
    let (_, body) = send!(
        app,
        post(
            &format!("/assignments/{}/tests/", assignment),
            &alice,
            json!({ "name": "t1" })
        )
    );
    let test_id = only_id(&body, "tests");

    let (status, body) = send!(
        app,
        upload(
            &alice,
            &[("file", "1.in", b"1"), ("file", "2.in", b"2"), ("file", "3.in", b"3")]
        )
    );
    assert_eq!(status, StatusCode::OK);
    let files: Vec<String> = body["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|id| id.as_str().unwrap().to_string())
        .collect();
    let (f1, f2, f3) = (&files[0], &files[1], &files[2]);

    let uri = format!("/tests/{}/files/", test_id);
    let (status, body) = send!(app, put(&uri, &alice, json!({ "files": [f1, f2] })));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(id_set(&body, "files"), set_of(&[f1, f2]));
    let (_, body) = send!(app, put(&uri, &alice, json!({ "files": [f1] })));
    assert_eq!(id_set(&body, "files"), set_of(&[f1, f2]));

    let missing = uuid::Uuid::new_v4().to_string();
    let (status, _) = send!(app, put(&uri, &alice, json!({ "files": [f3, missing] })));
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = send!(app, get(&uri, &alice));
    assert_eq!(id_set(&body, "files"), set_of(&[f1, f2]));

    let (status, _) = send!(app, put(&uri, &bob, json!({ "files": [f3] })));
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send!(app, delete_json(&uri, &bob, json!({ "files": [f1] })));
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (_, body) = send!(app, get(&uri, &alice));
    assert_eq!(id_set(&body, "files"), set_of(&[f1, f2]));

    let (status, body) = send!(app, delete_json(&uri, &alice, json!({ "files": [f3] })));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(id_set(&body, "files"), set_of(&[f1, f2]));

    let (status, body) = send!(app, delete_json(&uri, &alice, json!({ "files": [f1] })));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(id_set(&body, "files"), set_of(&[f2]));

    let store = ctx.server.store();
    let f1_id = uuid::Uuid::parse_str(f1).unwrap();
    let f2_id = uuid::Uuid::parse_str(f2).unwrap();
    let test_uuid = uuid::Uuid::parse_str(&test_id).unwrap();
    assert!(store.members("files", f1_id, "tests").unwrap().is_empty());
    assert!(store.members("files", f2_id, "tests").unwrap().contains(&test_uuid));

    let (status, _) = send!(app, delete(&format!("/files/{}/", f1), &alice));
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send!(app, get(&uri, &alice));
    assert_eq!(id_set(&body, "files"), set_of(&[f2]));
}

/// Holds every grading until the test lets it go.
struct HeldGrader {
    release: async_channel::Receiver<()>,
}

impl Grader for HeldGrader {
    fn grade(&self, _job: &GradeJob) -> Result<RunResult, GradeFault> {
        self.release
            .recv_blocking()
            .map_err(|e| GradeFault::Other(e.to_string()))?;
        Ok(RunResult {
            score: 1.0,
            retcode: 0,
            output: "released".into(),
        })
    }
}

#[actix_web::test]
async fn dispatch_returns_a_pending_run() {
    let dir = TempDir::new().unwrap();
    let (release, held) = async_channel::unbounded();
    let ctx = Context::new(
        Arc::new(MemoryStore::new()),
        FileStorage::new(dir.path()).unwrap(),
        b"test-secret",
        Arc::new(HeldGrader { release: held }),
        1,
    );
    let app = app!(ctx);
    let alice = basic("alice", "a");

    let (_, body) = send!(app, post("/assignments/", &alice, json!({ "name": "hw" })));
    let assignment = only_id(&body, "assignments");
    let (_, body) = send!(
        app,
        post(
            &format!("/assignments/{}/tests/", assignment),
            &alice,
            json!({ "name": "t1" })
        )
    );
    let test_id = only_id(&body, "tests");
    let (_, body) = send!(
        app,
        post(
            &format!("/assignments/{}/submissions/", assignment),
            &alice,
            json!({})
        )
    );
    let submission = only_id(&body, "submissions");
    let (_, body) = send!(app, upload(&alice, &[("file", "main.py", b"print(1)\n")]));
    let file = only_id(&body, "files");
    send!(
        app,
        put(
            &format!("/submissions/{}/files/", submission),
            &alice,
            json!({ "files": [file] })
        )
    );

    let (status, body) = send!(
        app,
        post(
            &format!("/submissions/{}/runs/", submission),
            &alice,
            json!({ "test": test_id })
        )
    );
    assert_eq!(status, StatusCode::OK);
    let run = only_id(&body, "runs");
    let run_uri = format!("/runs/{}/", run);

    let (status, body) = send!(app, get(&run_uri, &alice));
    assert_eq!(status, StatusCode::OK);
    let status = body[&run]["status"].as_str().unwrap().to_string();
    assert!(status == "pending" || status == "running", "{}", status);
    assert!(body[&run]["result"].is_null());
    assert!(body[&run]["finished"].is_null());

    release.send(()).await.unwrap();
    let graded = wait_for_run(|| {
        let req = get(&run_uri, &alice);
        let id = run.clone();
        let app = &app;
        async move {
            let (_, body) = send!(*app, req);
            body[&id].clone()
        }
    })
    .await;
    assert_eq!(graded["status"], "complete");
    assert_eq!(graded["result"]["output"], "released");
}

#[actix_web::test]
async fn oversized_uploads_are_refused() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let app = test::init_service(
        App::new()
            .app_data(Data::new(ctx.clone()))
            .app_data(UploadLimit(16))
            .configure(register_routes),
    )
    .await;
    let alice = basic("alice", "a");

    let (status, _) = send!(app, upload(&alice, &[("file", "big.bin", &[7u8; 64])]));
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    let (_, body) = send!(app, get("/files/", &alice));
    assert_eq!(body["files"], json!([]));

    let (status, body) = send!(app, upload(&alice, &[("file", "small.bin", &[7u8; 8])]));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["files"].as_array().unwrap().len(), 1);
}
