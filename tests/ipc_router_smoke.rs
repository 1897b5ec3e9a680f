mod test_support;

use serde_json::json;
use test_support::{connected_sidecar, error_code, spawn_sidecar};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[test]
fn protocol_errors_are_reported_per_line() {
    let mut sidecar = spawn_sidecar();

    let health = sidecar.request_ok("1", "health", json!({}));
    assert_eq!(health["connected"], false);
    assert!(health["version"].is_string());

    sidecar.send_raw("{ not json");
    let bad = sidecar.read_anonymous();
    assert_eq!(bad["ok"], false);
    assert_eq!(error_code(&bad), "bad_json");

    sidecar.send("2", "grades.explode", json!({}));
    let unknown = sidecar.wait("2");
    assert_eq!(error_code(&unknown), "not_implemented");

    assert_eq!(sidecar.request_err("3", "attendance.open", json!({})), "no_session");
    assert_eq!(
        sidecar.request_err("4", "session.connect", json!({ "baseUrl": "not a url" })),
        "bad_params"
    );
    assert_eq!(
        sidecar.request_err("5", "session.connect", json!({ "region": "eu" })),
        "bad_params"
    );
    assert_eq!(
        sidecar.request_err("6", "page.close", json!({ "page": "reports" })),
        "bad_params"
    );

    // An out-of-range timeout is answered, not fatal, and the sidecar keeps serving.
    assert_eq!(
        sidecar.request_err("7", "session.connect", json!({ "timeoutSeconds": 1e300 })),
        "bad_params"
    );
    let after = sidecar.request_ok("8", "health", json!({}));
    assert_eq!(after["connected"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn router_dispatch_smoke_covers_page_families() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/students/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{ "id": 1, "name": "Amina" }])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/attendance/today/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/submissions/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "submissions": [] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/lesson-plans/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
        .mount(&server)
        .await;

    let mut sidecar = connected_sidecar(&server);
    let health = sidecar.request_ok("1", "health", json!({}));
    assert_eq!(health["connected"], true);
    assert!(health["baseUrl"].as_str().expect("baseUrl").ends_with("/api/"));

    let attendance = sidecar.request_ok("2", "attendance.open", json!({}));
    assert_eq!(attendance["status"]["state"], "ready");
    let grading = sidecar.request_ok("3", "grading.open", json!({ "assignmentId": 7 }));
    assert_eq!(grading["assignmentId"], "7");
    let plans = sidecar.request_ok("4", "plans.open", json!({}));
    assert_eq!(plans["sortKey"], "strand");

    for (i, method) in ["attendance.rows", "grading.rows", "plans.rows"].iter().enumerate() {
        let _ = sidecar.request_ok(&format!("rows-{}", i), method, json!({}));
    }

    sidecar.request_ok("5", "page.close", json!({ "page": "attendance" }));
    let closed = sidecar.request_ok("6", "attendance.rows", json!({}));
    assert_eq!(closed["status"]["state"], "loading");
    assert_eq!(
        sidecar.request_err("7", "attendance.toggle", json!({ "studentId": 1 })),
        "not_ready"
    );

    let gone = sidecar.request_ok("8", "session.disconnect", json!({}));
    assert_eq!(gone["disconnected"], true);
    assert_eq!(sidecar.request_err("9", "plans.refresh", json!({})), "no_session");
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_server_surfaces_fetch_failed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/lesson-plans/"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let mut sidecar = connected_sidecar(&server);
    let resp = sidecar.request("1", "plans.open", json!({}));
    assert_eq!(error_code(&resp), "fetch_failed");
    assert_eq!(resp["error"]["details"]["status"], 503);

    let rows = sidecar.request_ok("2", "plans.rows", json!({}));
    assert_eq!(rows["status"]["state"], "error");
    assert!(rows["status"]["message"].is_string());
    assert_eq!(sidecar.request_err("3", "plans.create", json!({})), "not_ready");
}
