pub mod groups;
pub mod settings;
pub mod sites;
pub mod uploads;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/sites", sites::router(state.clone()))
        .nest("/site-groups", groups::router(state.clone()))
        .nest("/uploads", uploads::router(state.clone()))
        .nest("/settings", settings::router(state.clone()))
        .route("/ws", axum::routing::get(crate::ws::ui::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use deploy_sync::sites::registry::SiteRecord;
    use deploy_sync::sites::{ObjectState, RegistrySiteManager};
    use serde_json::{json, Value};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "deploy-test-boundary";

    fn site(name: &str, root: PathBuf) -> SiteRecord {
        SiteRecord {
            name: name.to_string(),
            id: 1,
            physical_path: root,
            application_pool: name.to_string(),
            state: ObjectState::Started,
            bindings: vec![],
            start_command: None,
            stop_command: None,
        }
    }

    fn setup(names: &[&str]) -> (TempDir, Router) {
        let tmp = TempDir::new().unwrap();
        let records = names
            .iter()
            .map(|n| {
                let root = tmp.path().join(n);
                std::fs::create_dir_all(&root).unwrap();
                site(n, root)
            })
            .collect();

        let mut config = AppConfig::default();
        config.server.data_dir = tmp.path().join("data");
        let state = Arc::new(AppState::new(
            config,
            Arc::new(RegistrySiteManager::in_memory(records)),
        ));
        (tmp, create_router(state))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::empty()).unwrap()
    }

    fn multipart(uri: &str, fields: &[(&str, &str)], file: (&str, &[u8])) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                    .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                file.0
            )
            .as_bytes(),
        );
        body.extend_from_slice(file.1);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn manifest(path: &str, size: u64) -> Value {
        json!([{
            "relativePath": path,
            "fileName": path,
            "size": size,
            "lastModified": "2024-03-01T10:20:30.123Z",
            "isDirectory": false
        }])
    }

    async fn begin(app: &Router, uri: &str) -> String {
        let (status, body) = send(app, post_empty(uri)).await;
        assert_eq!(status, StatusCode::OK);
        body["uploadId"].as_str().unwrap().to_string()
    }

    fn read(root: &Path, rel: &str) -> String {
        std::fs::read_to_string(root.join(rel)).unwrap()
    }

    #[tokio::test]
    async fn test_list_and_get_sites() {
        let (_tmp, app) = setup(&["shop"]);

        let (status, body) = send(&app, Request::get("/sites").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "shop");

        let (status, body) = send(&app, Request::get("/sites/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_check_files() {
        let (_tmp, app) = setup(&["shop"]);

        let (status, body) = send(&app, post_json("/sites/shop/check-files", manifest("index.html", 120))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["filesToUpdate"], json!(["index.html"]));
        assert_eq!(body["files"][0]["reason"], "NotOnServer");

        let (status, _) = send(&app, post_json("/sites/shop/check-files", json!([]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, post_json("/sites/ghost/check-files", manifest("a", 1))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ignored_files_feed_diff() {
        let (_tmp, app) = setup(&["shop"]);

        let (status, body) = send(&app, post_json("/settings/ignored-files", json!(["*.log"]))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ignoredFiles"], json!(["*.log"]));

        let (_, body) = send(&app, post_json("/sites/shop/check-files", manifest("app.log", 3))).await;
        assert_eq!(body["filesToUpdate"], json!([]));
        assert_eq!(body["ignoredFiles"][0]["ignoreReason"], "matches exclusion pattern");
    }

    #[tokio::test]
    async fn test_chunked_upload_and_finalize() {
        let (tmp, app) = setup(&["shop"]);
        let id = begin(&app, "/uploads/begin/shop").await;

        let uri = format!("/uploads/{id}/chunk/shop");
        for (index, part) in [(1, "world"), (0, "hello ")] {
            let req = multipart(
                &uri,
                &[
                    ("chunkIndex", &index.to_string()),
                    ("totalSize", "11"),
                    ("lastModified", "2024-03-01T10:20:30.123Z"),
                ],
                ("pages/index.html", part.as_bytes()),
            );
            let (status, _) = send(&app, req).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = send(&app, post_empty(&format!("/uploads/{id}/finalize/shop"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["merged"], json!(["pages/index.html"]));
        assert!(PathBuf::from(body["backupFile"].as_str().unwrap()).is_file());
        assert_eq!(read(&tmp.path().join("shop"), "pages/index.html"), "hello world");

        let (_, body) = send(&app, post_json("/sites/shop/check-files", manifest("pages/index.html", 11))).await;
        assert_eq!(body["filesToUpdate"], json!([]));

        let (status, _) = send(&app, post_empty(&format!("/uploads/{id}/finalize/shop"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_zstd_chunk_is_decoded() {
        let (tmp, app) = setup(&["shop"]);
        let id = begin(&app, "/uploads/begin/shop").await;
        let compressed = zstd::encode_all(&b"compressed body"[..], 3).unwrap();

        let req = multipart(
            &format!("/uploads/{id}/chunk/shop"),
            &[("chunkIndex", "0"), ("encoding", "zstd")],
            ("app.js", &compressed),
        );
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, post_empty(&format!("/uploads/{id}/finalize/shop"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read(&tmp.path().join("shop"), "app.js"), "compressed body");
    }

    #[tokio::test]
    async fn test_missing_physical_path_is_server_error() {
        let (tmp, app) = setup(&["shop"]);
        let id = begin(&app, "/uploads/begin/shop").await;
        let req = multipart(&format!("/uploads/{id}/file/shop"), &[], ("a.txt", b"a"));
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::put("/sites/shop/physical-path")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "physicalPath": tmp.path().join("gone") }).to_string()))
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, post_empty(&format!("/uploads/{id}/finalize/shop"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("Physical path not found"));

        let (status, _) = send(&app, post_json("/sites/shop/check-files", manifest("a.txt", 1))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let (status, _) = send(&app, post_empty("/uploads/begin/shop")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let (_tmp, app) = setup(&["shop", "blog"]);

        let req = multipart("/uploads/bogus/chunk/shop", &[("chunkIndex", "0")], ("a.txt", b"a"));
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("bogus"));

        let id = begin(&app, "/uploads/begin/shop").await;
        let req = multipart(&format!("/uploads/{id}/chunk/blog"), &[("chunkIndex", "0")], ("a.txt", b"a"));
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = multipart(&format!("/uploads/{id}/chunk/shop"), &[("chunkIndex", "0")], ("../escape.txt", b"a"));
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = multipart(&format!("/uploads/{id}/chunk/shop"), &[], ("a.txt", b"a"));
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_group_upload_flow() {
        let (tmp, app) = setup(&["a", "b"]);

        let (status, _) = send(&app, post_json("/site-groups", json!({ "name": "web", "siteNames": ["a", "b"] }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(&app, post_json("/site-groups", json!({ "name": "web" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, post_json("/sites/group/web/check-files", manifest("app.js", 2))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["filesToUpdate"], json!(["app.js"]));

        let id = begin(&app, "/uploads/group/begin/web").await;
        let req = multipart(&format!("/uploads/{id}/file/group/web"), &[], ("app.js", b"js"));
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, _) = send(&app, post_empty(&format!("/uploads/{id}/finalize/group/web/site/a"))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, post_empty(&format!("/uploads/{id}/finalize/group/web"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["alreadyDeployed"], json!(["a"]));
        assert_eq!(body["results"][0]["site"], "b");
        assert_eq!(body["results"][0]["success"], true);
        assert_eq!(body["errors"], json!([]));

        assert_eq!(read(&tmp.path().join("a"), "app.js"), "js");
        assert_eq!(read(&tmp.path().join("b"), "app.js"), "js");
    }

    #[tokio::test]
    async fn test_site_control() {
        let (tmp, app) = setup(&["shop"]);

        let (status, _) = send(&app, post_empty("/sites/shop/stop")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = send(&app, Request::get("/sites/shop").body(Body::empty()).unwrap()).await;
        assert_eq!(body["state"], "Stopped");

        let new_root = tmp.path().join("shop-v2");
        let req = Request::put("/sites/shop/physical-path")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "physicalPath": new_root }).to_string()))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(PathBuf::from(body["physicalPath"].as_str().unwrap()), new_root);

        let binding = json!({ "protocol": "http", "bindingInformation": "*:8080:shop.local" });
        let (status, _) = send(&app, post_json("/sites/shop/bindings", binding)).await;
        assert_eq!(status, StatusCode::CREATED);
        let req = Request::delete("/sites/shop/bindings/*:8080:shop.local")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
