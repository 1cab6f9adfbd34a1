use std::{
    fs,
    num::{NonZeroU32, NonZeroU64},
    path::Path,
    time::Duration,
};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use httpmock::MockServer;
use meshport::{
    application::{export::ExportService, generate::GenerationService},
    config::{ExportSettings, RemoteSettings},
    infra::{
        http::{AppState, build_router},
        remote::RemoteGenerationClient,
        staging::WorkspaceStager,
    },
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use url::Url;

const BOUNDARY: &str = "meshport-test-boundary";
const BODY_LIMIT: usize = 8 * 1024 * 1024;

fn export_settings(root: &Path) -> ExportSettings {
    ExportSettings {
        blender_path: root.join("blender"),
        scripts_dir: root.join("scripts"),
        directory: root.join("exports"),
        staging_dir: root.join("staging"),
        timeout: Duration::from_secs(10),
        max_concurrent_jobs: NonZeroU32::new(2).unwrap(),
        queue_timeout: Duration::from_secs(1),
        log_tail_lines: NonZeroU32::new(20).unwrap(),
        retention: None,
        model_max_bytes: NonZeroU64::new(1024 * 1024).unwrap(),
        image_max_bytes: NonZeroU64::new(64 * 1024).unwrap(),
    }
}

fn router(root: &Path, remote_base: &str, api_key: Option<&str>) -> Router {
    let settings = export_settings(root);
    let limits = settings.upload_limits();
    let client = RemoteGenerationClient::new(&RemoteSettings {
        api_key: api_key.map(str::to_owned),
        base_url: Url::parse(remote_base).expect("base url"),
        submit_timeout: Duration::from_secs(5),
        poll_timeout: Duration::from_secs(5),
    })
    .expect("client");
    let generation = GenerationService::new(
        limits,
        WorkspaceStager::new(&settings.staging_dir),
        client,
    );
    let state = AppState::new(ExportService::new(&settings), generation, limits);
    build_router(state, BODY_LIMIT)
}

struct Part<'a> {
    name: &'a str,
    filename: Option<&'a str>,
    content_type: Option<&'a str>,
    data: &'a [u8],
}

fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part.filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{filename}\"\r\n",
                    part.name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name).as_bytes(),
            ),
        }
        if let Some(content_type) = part.content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn tempdir() -> TempDir {
    tempfile::tempdir().expect("tempdir")
}

#[tokio::test]
async fn health_returns_no_content() {
    let dir = tempdir();
    let response = router(dir.path(), "http://127.0.0.1:9/v1", None)
        .oneshot(get("/api/health"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn download_of_unknown_artifact_is_not_found() {
    let dir = tempdir();
    fs::create_dir_all(dir.path().join("exports")).expect("exports");
    let response = router(dir.path(), "http://127.0.0.1:9/v1", None)
        .oneshot(get("/api/export/download/export_missing.fbx"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"]["code"], "not_found");
}

#[tokio::test]
async fn download_rejects_traversal() {
    let dir = tempdir();
    fs::create_dir_all(dir.path().join("exports")).expect("exports");
    fs::write(dir.path().join("secret.txt"), b"secret").expect("secret");

    let app = router(dir.path(), "http://127.0.0.1:9/v1", None);
    for uri in [
        "/api/export/download/%2E%2E%2Fsecret.txt",
        "/api/export/download/..",
        "/api/export/download/a%5Cb.fbx",
    ] {
        let response = app.clone().oneshot(get(uri)).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(
            json_body(response).await["error"]["code"],
            "invalid_filename",
            "{uri}"
        );
    }
}

#[tokio::test]
async fn download_streams_artifact_as_attachment() {
    let dir = tempdir();
    let exports = dir.path().join("exports");
    fs::create_dir_all(&exports).expect("exports");
    fs::write(exports.join("export_20240101.fbx"), b"FBX-BYTES").expect("artifact");

    let response = router(dir.path(), "http://127.0.0.1:9/v1", None)
        .oneshot(get("/api/export/download/export_20240101.fbx"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
    assert_eq!(headers[header::CONTENT_LENGTH], "9");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"export_20240101.fbx\""
    );
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(&bytes[..], b"FBX-BYTES");
}

#[tokio::test]
async fn export_with_disallowed_extension_is_bad_request() {
    let dir = tempdir();
    let response = router(dir.path(), "http://127.0.0.1:9/v1", None)
        .oneshot(multipart_request(
            "/api/export/retarget",
            &[
                Part {
                    name: "character",
                    filename: Some("character.obj"),
                    content_type: None,
                    data: b"obj",
                },
                Part {
                    name: "animation",
                    filename: Some("walk.bvh"),
                    content_type: None,
                    data: b"bvh",
                },
            ],
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "invalid_extension");
    assert!(
        body["error"]["hint"]
            .as_str()
            .unwrap_or_default()
            .contains("FBX")
    );
    assert_eq!(fs::read_dir(dir.path()).expect("root").count(), 0);
}

#[tokio::test]
async fn export_without_character_is_bad_request() {
    let dir = tempdir();
    let response = router(dir.path(), "http://127.0.0.1:9/v1", None)
        .oneshot(multipart_request("/api/export/autorig", &[]))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "missing_file");
}

#[tokio::test]
async fn oversized_image_is_payload_too_large() {
    let dir = tempdir();
    let image = vec![0u8; 64 * 1024 + 1];
    let response = router(dir.path(), "http://127.0.0.1:9/v1", Some("key"))
        .oneshot(multipart_request(
            "/api/ai/generate",
            &[Part {
                name: "image",
                filename: Some("photo.png"),
                content_type: Some("image/png"),
                data: &image,
            }],
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(response).await["error"]["code"], "payload_too_large");
}

#[tokio::test]
async fn generate_submits_image_and_returns_queued_ticket() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("POST")
            .path("/v1/image-to-3d")
            .header("authorization", "Bearer test-key")
            .json_body_includes(r#"{"enable_pbr":true,"prompt":"a knight"}"#);
        then.status(202)
            .header("content-type", "application/json")
            .body(r#"{"result":"task-77"}"#);
    });

    let dir = tempdir();
    let response = router(dir.path(), &server.url("/v1"), Some("test-key"))
        .oneshot(multipart_request(
            "/api/ai/generate",
            &[
                Part {
                    name: "image",
                    filename: Some("knight.png"),
                    content_type: Some("image/png"),
                    data: b"\x89PNG",
                },
                Part {
                    name: "prompt",
                    filename: None,
                    content_type: None,
                    data: b"  a knight  ",
                },
            ],
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["task_id"], "task-77");
    assert_eq!(body["status"], "QUEUED");
    mock.assert();
    assert_eq!(
        fs::read_dir(dir.path().join("staging"))
            .map(|entries| entries.count())
            .unwrap_or(0),
        0
    );
}

#[tokio::test]
async fn generate_without_api_key_is_unavailable() {
    let dir = tempdir();
    let response = router(dir.path(), "http://127.0.0.1:9/v1", None)
        .oneshot(multipart_request(
            "/api/ai/generate",
            &[Part {
                name: "image",
                filename: Some("knight.jpg"),
                content_type: Some("image/jpeg"),
                data: b"jpeg",
            }],
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        json_body(response).await["error"]["code"],
        "remote_unconfigured"
    );
}

#[tokio::test]
async fn status_projects_provider_task() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("GET").path("/v1/image-to-3d/task-42");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"task-42","status":"IN_PROGRESS","progress":42}"#);
    });

    let dir = tempdir();
    let response = router(dir.path(), &server.url("/v1"), Some("test-key"))
        .oneshot(get("/api/ai/status/task-42"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["task_id"], "task-42");
    assert_eq!(body["status"], "RUNNING");
    assert_eq!(body["progress"], 42);
    assert!(body.get("result").is_none());
}

#[tokio::test]
async fn status_reports_provider_failure_as_bad_gateway() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("GET").path("/v1/image-to-3d/task-9");
        then.status(500).body("upstream exploded");
    });

    let dir = tempdir();
    let response = router(dir.path(), &server.url("/v1"), Some("test-key"))
        .oneshot(get("/api/ai/status/task-9"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        json_body(response).await["error"]["code"],
        "remote_bad_response"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn retarget_then_download_round_trip() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir();
    let root = dir.path();
    fs::create_dir_all(root.join("scripts")).expect("scripts");
    fs::write(root.join("scripts/export_animation.py"), "import bpy\n").expect("script");
    fs::write(
        root.join("blender"),
        r#"#!/bin/sh
prev=""
for arg in "$@"; do
    if [ "$prev" = "--output" ]; then out="$arg"; fi
    prev="$arg"
done
printf 'RIGGED' > "$out"
echo "SUCCESS: done"
"#,
    )
    .expect("tool");
    fs::set_permissions(root.join("blender"), fs::Permissions::from_mode(0o755)).expect("chmod");

    let app = router(root, "http://127.0.0.1:9/v1", None);
    let response = app
        .clone()
        .oneshot(multipart_request(
            "/api/export/retarget",
            &[
                Part {
                    name: "character",
                    filename: Some("hero.fbx"),
                    content_type: Some("application/octet-stream"),
                    data: b"fbx",
                },
                Part {
                    name: "animation",
                    filename: Some("walk.bvh"),
                    content_type: None,
                    data: b"bvh",
                },
            ],
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["file_size"], 6);
    assert!(body.get("path").is_none());
    let download_url = body["download_url"].as_str().expect("url").to_string();

    let response = app.oneshot(get(&download_url)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(&bytes[..], b"RIGGED");
}
