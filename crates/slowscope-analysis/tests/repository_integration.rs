use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Router,
};
use serde_json::json;
use slowscope_analysis::{
    analyze, AnalysisError, ClickHouseSlowQueryRepository, SlowQueryRepository,
};
use slowscope_clickhouse::ClickHouseClient;
use slowscope_config::ClickHouseConfig;

const NAMESPACE: &str = "orders_20240102T030405Z_logs";

#[derive(Default)]
struct MockState {
    queries: Mutex<Vec<String>>,
    fail_rollups: bool,
}

fn test_clickhouse_config(url: String) -> ClickHouseConfig {
    ClickHouseConfig {
        url,
        database: "default".to_string(),
        username: "default".to_string(),
        password: String::new(),
        timeout_seconds: 5.0,
        async_insert: true,
        wait_for_async_insert: true,
    }
}

fn json_each_row(rows: serde_json::Value) -> String {
    match rows {
        serde_json::Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                out.push_str(&item.to_string());
                out.push('\n');
            }
            out
        }
        value => format!("{value}\n"),
    }
}

fn slow_doc(hash: &str, duration: i64) -> String {
    json!({
        "t": {"$date": "2024-01-02T03:04:05.123Z"},
        "s": "I",
        "c": "COMMAND",
        "id": 51803,
        "ctx": "conn7",
        "msg": "Slow query",
        "attr": {"queryHash": hash, "durationMillis": duration, "planSummary": "COLLSCAN"},
        "host": "shard-00:27017",
        "ctxhost": "conn7_shard-00:27017",
        "category": "slowQuery"
    })
    .to_string()
}

fn rollup_row(driver: &str, hash: &str, total: i64) -> serde_json::Value {
    json!({
        "driver": driver,
        "hash": hash,
        "isCollscan": true,
        "count": 2,
        "totalBytesRead": 100,
        "totalBytesWritten": 0,
        "totalDurationMillis": total,
        "totalNumYields": 2,
        "maxBytesRead": 60,
        "maxWritten": 0,
        "maxDurationMillis": total,
        "maxNumYields": 1,
        "avgBytesRead": 50.0,
        "avgWritten": 0.0,
        "avgDurationMillis": total as f64 / 2.0,
        "avgNumYields": 1.0,
        "queryExample": slow_doc(hash, 1)
    })
}

async fn spawn_mock_server(state: Arc<MockState>) -> String {
    async fn handler(
        State(state): State<Arc<MockState>>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> (StatusCode, String) {
        if headers.get("content-length").is_none() {
            return (
                StatusCode::LENGTH_REQUIRED,
                "missing content-length".to_string(),
            );
        }

        let query = params.get("query").cloned().unwrap_or_default();
        state
            .queries
            .lock()
            .expect("query lock")
            .push(query.clone());

        if query.starts_with("TRUNCATE") || query.starts_with("INSERT INTO") {
            if state.fail_rollups {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Code: 60. DB::Exception: Unknown table".to_string(),
                );
            }
            return (StatusCode::OK, String::new());
        }

        if query.contains("`slowQueriesByDriver`") && query.contains("ORDER BY totalDurationMillis DESC")
        {
            return (
                StatusCode::OK,
                json_each_row(json!([
                    rollup_row("nodejs:6.3.0", "BBB", 900),
                    rollup_row("go:1.12", "AAA", 300)
                ])),
            );
        }

        if query.starts_with("SELECT doc FROM") {
            let hash = if query.contains("queryHash = 'BBB'") {
                "BBB"
            } else {
                "AAA"
            };
            return (
                StatusCode::OK,
                json_each_row(json!([{ "doc": slow_doc(hash, 777) }])),
            );
        }

        if query.contains("toUnixTimestamp64Milli") {
            return (
                StatusCode::OK,
                json_each_row(json!([
                    {"host": "shard-01:27017", "t_ms": 1704164645123_i64}
                ])),
            );
        }

        (StatusCode::BAD_REQUEST, format!("unexpected query: {query}"))
    }

    let app = Router::new()
        .route("/", get(handler).post(handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    format!("http://{}", addr)
}

fn repository(url: String) -> ClickHouseSlowQueryRepository {
    let ch = ClickHouseClient::new(test_clickhouse_config(url))
        .expect("clickhouse client")
        .for_namespace(NAMESPACE)
        .expect("namespace");
    ClickHouseSlowQueryRepository::new(ch)
}

#[tokio::test]
async fn analyze_runs_the_three_query_shapes_in_order() {
    let state = Arc::new(MockState::default());
    let url = spawn_mock_server(state.clone()).await;
    let repo = repository(url);

    let outcome = analyze(&repo, 10).await.expect("analysis");

    assert_eq!(outcome.ranked.len(), 2);
    assert_eq!(outcome.ranked[0].rank, 1);
    assert_eq!(outcome.ranked[0].rollup.hash, "BBB");
    assert_eq!(outcome.ranked[0].rollup.total_duration_millis, 900);
    assert_eq!(outcome.ranked[0].rollup.query_example.attr_str(&["queryHash"]), "BBB");
    assert_eq!(outcome.ranked[0].slowest.driver, "nodejs:6.3.0");
    assert_eq!(
        outcome.ranked[0].slowest.event.attr_i64(&["durationMillis"]),
        777
    );
    assert_eq!(outcome.ranked[1].slowest.driver, "go:1.12");
    assert_eq!(outcome.transitions.len(), 1);
    assert_eq!(outcome.transitions[0].host, "shard-01:27017");

    let queries = state.queries.lock().expect("query lock").clone();
    assert_eq!(
        queries[0],
        format!("TRUNCATE TABLE `{NAMESPACE}`.`slowQueriesByDriver`")
    );
    assert!(queries[1].starts_with(&format!(
        "INSERT INTO `{NAMESPACE}`.`slowQueriesByDriver`"
    )));
    assert!(queries[2].contains("LIMIT 10"));
    assert!(queries[3].contains("WHERE queryHash = 'BBB'"));
    assert!(queries[3].contains("ORDER BY durationMillis DESC"));
    assert!(queries[3].contains("LIMIT 1"));
    assert!(queries[4].contains("WHERE queryHash = 'AAA'"));
    assert!(queries[5].contains("`primaryChangeEvents`"));
}

#[tokio::test]
async fn backend_failure_surfaces_as_backend_error() {
    let state = Arc::new(MockState {
        fail_rollups: true,
        ..MockState::default()
    });
    let url = spawn_mock_server(state.clone()).await;
    let repo = repository(url);

    let err = repo.build_rollups().await.expect_err("rollup build fails");
    match err {
        AnalysisError::Backend(message) => assert!(message.contains("Unknown table")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(state.queries.lock().expect("query lock").len(), 1);
}

#[tokio::test]
async fn slowest_example_escapes_hash_literal() {
    let state = Arc::new(MockState::default());
    let url = spawn_mock_server(state.clone()).await;
    let repo = repository(url);

    let event = repo
        .slowest_example("it's")
        .await
        .expect("query")
        .expect("row");
    assert_eq!(event.attr_str(&["queryHash"]), "AAA");

    let queries = state.queries.lock().expect("query lock").clone();
    assert!(queries[0].contains(r"WHERE queryHash = 'it\'s'"));
}
