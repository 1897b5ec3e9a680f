mod test_support;

use serde_json::{json, Value};
use test_support::{bodies_for, connected_sidecar, row, rows};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn plan(id: i64, strand: &str, sub_strand: &str, outcome: &str) -> Value {
    json!({
        "id": id,
        "strand": strand,
        "sub_strand": sub_strand,
        "general_outcome": outcome,
        "introduction": "Warm up",
    })
}

fn ids(result: &Value) -> Vec<String> {
    rows(result)
        .iter()
        .map(|r| r["id"].as_str().expect("id").to_string())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn created_plan_is_rekeyed_and_editable_under_its_server_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/lesson-plans/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "count": 0, "results": [] })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/lesson-plans/"))
        .and(body_partial_json(json!({ "strand": "Fractions" })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(plan(42, "Fractions", "Halves", "share equally")),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/lesson-plans/42/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut sidecar = connected_sidecar(&server);
    sidecar.request_ok("1", "plans.open", json!({}));

    let created = sidecar.request_ok(
        "2",
        "plans.create",
        json!({ "fields": {
            "strand": "Fractions",
            "sub_strand": "Halves",
            "general_outcome": "share equally",
        } }),
    );
    let temp = created["planId"].as_str().expect("planId").to_string();
    let listed = sidecar.request_ok("3", "plans.rows", json!({}));
    let draft = row(&rows(&listed), &temp).clone();
    assert_eq!(draft["draft"], true);
    assert_eq!(draft["editing"], true);
    assert_eq!(draft["fields"]["reflection"], "");

    let saved = sidecar.request_ok("4", "plans.commitRow", json!({ "planId": temp }));
    assert_eq!(saved["planId"], "42");
    assert_eq!(saved["previousId"], temp.as_str());

    let after = sidecar.request_ok("5", "plans.rows", json!({}));
    assert_eq!(ids(&after), vec!["42"]);
    assert_eq!(after["editingId"], Value::Null);
    assert_eq!(row(&rows(&after), "42")["fields"]["introduction"], "Warm up");

    sidecar.request_ok("6", "plans.edit", json!({ "planId": 42 }));
    sidecar.request_ok(
        "7",
        "plans.setField",
        json!({ "planId": 42, "field": "reflection", "value": "Went well" }),
    );
    sidecar.request_ok("8", "plans.commitRow", json!({ "planId": 42 }));

    let puts = bodies_for(&server, "PUT", "/api/lesson-plans/42/").await;
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0]["reflection"], "Went well");
    assert_eq!(puts[0]["strand"], "Fractions");

    let final_rows = sidecar.request_ok("9", "plans.rows", json!({}));
    let r = row(&rows(&final_rows), "42").clone();
    assert_eq!(r["dirty"], false);
    assert_eq!(r["fields"]["reflection"], "Went well");
}

#[tokio::test(flavor = "multi_thread")]
async fn search_sort_and_delete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/lesson-plans/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "lesson_plans": [
            plan(1, "Numbers", "Counting", "count to 100"),
            plan(2, "Measurement", "Length", "measure in cm"),
            plan(3, "Algebra", "Patterns", "extend number patterns"),
            { "strand": "orphan without id" },
        ]})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/lesson-plans/2/"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut sidecar = connected_sidecar(&server);
    let opened = sidecar.request_ok("1", "plans.open", json!({}));
    assert_eq!(ids(&opened), vec!["3", "2", "1"]);

    let filtered = sidecar.request_ok("2", "plans.rows", json!({ "search": "NUMBER" }));
    assert_eq!(ids(&filtered), vec!["3", "1"]);
    let desc = sidecar.request_ok("3", "plans.toggleSort", json!({ "sortKey": "strand" }));
    assert_eq!(ids(&desc), vec!["1", "3"]);
    let by_outcome = sidecar.request_ok(
        "4",
        "plans.rows",
        json!({ "search": "", "sortKey": "general_outcome", "sortAsc": true }),
    );
    assert_eq!(ids(&by_outcome), vec!["1", "3", "2"]);

    let expanded = sidecar.request_ok("5", "plans.toggleExpanded", json!({ "planId": 2 }));
    assert_eq!(expanded["expanded"], true);
    let deleted = sidecar.request_ok("6", "plans.delete", json!({ "planId": 2 }));
    assert_eq!(deleted["deleted"], true);

    let left = sidecar.request_ok("7", "plans.rows", json!({}));
    assert_eq!(ids(&left), vec!["1", "3"]);
    assert_eq!(left["total"], 2);
}
