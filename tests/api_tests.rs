//! HTTP API tests driven through the router with `tower::ServiceExt`.

mod test_utils;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use test_utils::{FakeExtractor, TestApp, video_url};
use tubecast::models::{QueueStatus, TargetCollection};
use tubecast::server::create_app;

async fn app() -> (TestApp, Router) {
    let app = TestApp::new(FakeExtractor::default()).await.unwrap();
    let router = create_app(app.services.state.clone());
    (app, router)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn root_and_health() {
    let (_app, router) = app().await;

    let (status, _, body) = send(&router, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "tubecast");

    let (status, _, body) = send(&router, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "ok");
}

#[tokio::test]
async fn submitting_a_batch_creates_jobs_and_queue_entries() {
    let (app, router) = app().await;
    let user = Uuid::new_v4();

    let (status, _, body) = send(
        &router,
        post_json(
            "/api/v1/jobs",
            json!({
                "user_id": user,
                "urls": [video_url("dQw4w9WgXcQ"), "https://youtu.be/aaaaaaaaaaa"]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job["status"] == "CREATED"));

    for job in jobs {
        let job_id: Uuid = job["id"].as_str().unwrap().parse().unwrap();
        let entry = app
            .services
            .state
            .queue
            .find_for_target(TargetCollection::Jobs, job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
    }

    let batch_id = body["batch_id"].as_str().unwrap();
    let (status, _, batch) = send(&router, get(&format!("/api/v1/batches/{batch_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(batch["total"], 2);
    assert_eq!(batch["counts"]["created"], 2);
    assert_eq!(batch["finished"], false);
}

#[tokio::test]
async fn finished_job_reports_its_download() {
    let (app, router) = app().await;
    let user = Uuid::new_v4();
    app.open_cycle(user, 1 << 30).await.unwrap();

    let (_, _, body) = send(
        &router,
        post_json(
            "/api/v1/jobs",
            json!({ "user_id": user, "urls": [video_url("dQw4w9WgXcQ")] }),
        ),
    )
    .await;
    let job_id = body["jobs"][0]["id"].as_str().unwrap().to_string();
    let batch_id = body["batch_id"].as_str().unwrap().to_string();

    app.run_until_idle().await.unwrap();

    let (status, _, job) = send(&router, get(&format!("/api/v1/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "SUCCESS");
    let audio_url = job["download"]["audio_url"].as_str().unwrap();
    assert!(audio_url.starts_with("http://tubecast.test/api/files/audio/"));

    let (_, _, batch) = send(&router, get(&format!("/api/v1/batches/{batch_id}"))).await;
    assert_eq!(batch["finished"], true);
    assert_eq!(batch["counts"]["success"], 1);

    // Stored audio is served from storage
    let file_path = audio_url.trim_start_matches("http://tubecast.test");
    let response = router.clone().oneshot(get(file_path)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_batches_are_rejected_as_problem_json() {
    let (_app, router) = app().await;
    let user = Uuid::new_v4();

    let cases = [
        json!({ "user_id": user, "urls": [] }),
        json!({ "user_id": user, "urls": ["https://vimeo.com/1"] }),
        json!({ "user_id": user, "urls": vec![video_url("dQw4w9WgXcQ"); 26] }),
        json!({ "urls": [video_url("dQw4w9WgXcQ")] }),
    ];

    for case in cases {
        let (status, headers, body) = send(&router, post_json("/api/v1/jobs", case)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
        assert_eq!(body["code"], "VALIDATION_FAILED");
    }
}

#[tokio::test]
async fn unknown_ids_are_not_found_and_carry_the_request_id() {
    let (_app, router) = app().await;

    let request = Request::builder()
        .uri(format!("/api/v1/jobs/{}", Uuid::new_v4()))
        .header("x-request-id", "req-12345")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers.get("x-request-id").unwrap(), "req-12345");
    assert_eq!(body["trace_id"], "req-12345");

    let (status, _, _) = send(&router, get(&format!("/api/v1/batches/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn podcast_items_are_enqueued() {
    let (app, router) = app().await;
    let user = Uuid::new_v4();

    let (status, _, podcast) = send(
        &router,
        post_json(
            "/api/v1/podcasts",
            json!({ "user_id": user, "title": "Commute" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(podcast["feed_url"], Value::Null);
    let podcast_id = podcast["id"].as_str().unwrap();

    let (status, _, item) = send(
        &router,
        post_json(
            &format!("/api/v1/podcasts/{podcast_id}/items"),
            json!({ "user_id": user, "url": video_url("bbbbbbbbbbb") }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let item_id: Uuid = item["id"].as_str().unwrap().parse().unwrap();

    let entry = app
        .services
        .state
        .queue
        .find_for_target(TargetCollection::Items, item_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, QueueStatus::Pending);

    let (status, _, _) = send(
        &router,
        post_json(
            &format!("/api/v1/podcasts/{}/items", Uuid::new_v4()),
            json!({ "user_id": user, "url": video_url("bbbbbbbbbbb") }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn usage_cycles_and_webhooks_can_be_registered() {
    let (_app, router) = app().await;
    let user = Uuid::new_v4();

    let (status, _, cycle) = send(
        &router,
        post_json(
            "/api/v1/usage",
            json!({ "user_id": user, "limit_bytes": 1048576 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(cycle["usage_bytes"], 0);

    let request = Request::builder()
        .method("PUT")
        .uri(format!("/api/v1/webhooks/{user}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "url": "https://hooks.example.com/x", "secret": "k" }).to_string(),
        ))
        .unwrap();
    let (status, _, hook) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hook["signed"], true);
    assert_eq!(hook["events"].as_array().unwrap().len(), 4);

    let request = Request::builder()
        .method("PUT")
        .uri(format!("/api/v1/webhooks/{user}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "url": "not a url" }).to_string()))
        .unwrap();
    let (status, _, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
