use anyhow::{anyhow, bail, Context, Result};
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    Client, Url,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use slowscope_config::ClickHouseConfig;
use std::collections::HashSet;
use std::time::Duration;

/// Raw event tables plus the derived rollup table, in creation order.
pub const NAMESPACE_TABLES: [&str; 4] = [
    "primaryChangeEvents",
    "slowQueries",
    "clientMetadata",
    "slowQueriesByDriver",
];

const NAMESPACE_SCHEMA: &str = include_str!("../../../sql/001_namespace.sql");

/// HTTP client bound to one database. Cloning shares the connection pool, so
/// `for_namespace` is the way to address another run's database.
#[derive(Clone)]
pub struct ClickHouseClient {
    cfg: ClickHouseConfig,
    http: Client,
    database: String,
}

#[derive(Deserialize)]
struct ClickHouseEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DoctorReport {
    pub clickhouse_healthy: bool,
    pub clickhouse_version: Option<String>,
    pub database: String,
    pub database_exists: bool,
    pub missing_tables: Vec<String>,
    pub errors: Vec<String>,
}

impl ClickHouseClient {
    pub fn new(cfg: ClickHouseConfig) -> Result<Self> {
        let timeout = Duration::from_secs_f64(cfg.timeout_seconds.max(1.0));
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to construct reqwest client")?;
        let database = cfg.database.clone();

        Ok(Self {
            cfg,
            http,
            database,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn for_namespace(&self, namespace: &str) -> Result<Self> {
        validate_identifier(namespace)?;
        Ok(Self {
            cfg: self.cfg.clone(),
            http: self.http.clone(),
            database: namespace.to_string(),
        })
    }

    fn base_url(&self) -> Result<Url> {
        Url::parse(&self.cfg.url).context("invalid ClickHouse URL")
    }

    pub async fn request_text(
        &self,
        query: &str,
        body: Option<Vec<u8>>,
        database: Option<&str>,
        async_insert: bool,
        default_format: Option<&str>,
    ) -> Result<String> {
        let mut url = self.base_url()?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("query", query);
            if let Some(database) = database {
                qp.append_pair("database", database);
            }
            if let Some(default_format) = default_format {
                qp.append_pair("default_format", default_format);
            }
            // Row structs decode 64-bit counters as JSON numbers, not strings.
            qp.append_pair("output_format_json_quote_64bit_integers", "0");
            if async_insert && self.cfg.async_insert {
                qp.append_pair("async_insert", "1");
                if self.cfg.wait_for_async_insert {
                    qp.append_pair("wait_for_async_insert", "1");
                }
            }
        }

        // ClickHouse HTTP treats GET as readonly, so use POST for both reads and writes.
        let payload = body.unwrap_or_default();
        let payload_len = payload.len();

        let mut req = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            // Some ClickHouse builds require an explicit Content-Length on POST.
            .header(CONTENT_LENGTH, payload_len)
            .body(payload);

        if !self.cfg.username.is_empty() {
            req = req.basic_auth(self.cfg.username.clone(), Some(self.cfg.password.clone()));
        }

        let response = req.send().await.context("clickhouse request failed")?;
        let status = response.status();
        let text = response.text().await.with_context(|| {
            format!(
                "failed to read clickhouse response body (status {})",
                status
            )
        })?;

        if !status.is_success() {
            return Err(anyhow!("clickhouse returned {}: {}", status, text));
        }

        Ok(text)
    }

    pub async fn ping(&self) -> Result<()> {
        let response = self
            .request_text("SELECT 1", None, Some("system"), false, None)
            .await?;
        if response.trim() == "1" {
            Ok(())
        } else {
            Err(anyhow!("unexpected ping response: {}", response.trim()))
        }
    }

    pub async fn version(&self) -> Result<String> {
        let rows: Vec<Value> = self
            .query_json_data("SELECT version() AS version", Some("system"))
            .await?;
        let version = rows
            .first()
            .and_then(|row| row.get("version"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing version in payload"))?;

        Ok(version.to_string())
    }

    /// Runs a statement that returns no rows against the bound database.
    pub async fn execute(&self, statement: &str) -> Result<()> {
        self.request_text(statement, None, Some(&self.database), false, None)
            .await
            .with_context(|| format!("statement failed: {}", truncate_for_error(statement)))?;
        Ok(())
    }

    pub async fn query_json_each_row<T: DeserializeOwned>(
        &self,
        query: &str,
        database: Option<&str>,
    ) -> Result<Vec<T>> {
        let database = database.or(Some(&self.database));
        let raw = self
            .request_text(query, None, database, false, None)
            .await?;
        let mut rows = Vec::new();

        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str::<T>(line)
                .with_context(|| format!("failed to parse JSONEachRow line: {}", line))?;
            rows.push(row);
        }

        Ok(rows)
    }

    pub async fn query_json_data<T: DeserializeOwned>(
        &self,
        query: &str,
        database: Option<&str>,
    ) -> Result<Vec<T>> {
        let database = database.or(Some(&self.database));
        let raw = self
            .request_text(query, None, database, false, Some("JSON"))
            .await?;
        let envelope: ClickHouseEnvelope<T> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid clickhouse JSON response: {}", raw))?;
        Ok(envelope.data)
    }

    pub async fn insert_json_rows(&self, table: &str, rows: &[Value]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut payload = Vec::<u8>::new();
        for row in rows {
            let line = serde_json::to_vec(row).context("failed to encode JSON row")?;
            payload.extend_from_slice(&line);
            payload.push(b'\n');
        }

        let query = format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            escape_identifier(&self.database),
            escape_identifier(table)
        );
        self.request_text(&query, Some(payload), None, true, None)
            .await?;
        Ok(())
    }

    /// Creates the bound database and its event and rollup tables.
    pub async fn ensure_namespace(&self) -> Result<()> {
        let sql = materialize_schema_sql(NAMESPACE_SCHEMA, &self.database)?;
        for statement in split_sql_statements(&sql) {
            let database = if statement.starts_with("CREATE DATABASE") {
                None
            } else {
                Some(self.database.as_str())
            };
            self.request_text(&statement, None, database, false, None)
                .await
                .with_context(|| {
                    format!(
                        "failed namespace statement: {}",
                        truncate_for_error(&statement)
                    )
                })?;
        }
        Ok(())
    }

    pub async fn doctor_report(&self) -> Result<DoctorReport> {
        let mut report = DoctorReport {
            clickhouse_healthy: false,
            clickhouse_version: None,
            database: self.database.clone(),
            database_exists: false,
            missing_tables: Vec::new(),
            errors: Vec::new(),
        };

        match self.ping().await {
            Ok(()) => {
                report.clickhouse_healthy = true;
            }
            Err(err) => {
                report.errors.push(format!("ping failed: {err}"));
                return Ok(report);
            }
        }

        match self.version().await {
            Ok(version) => report.clickhouse_version = Some(version),
            Err(err) => report.errors.push(format!("version query failed: {err}")),
        }

        #[derive(Deserialize)]
        struct TableRow {
            name: String,
        }

        let table_query = format!(
            "SELECT name FROM system.tables WHERE database = {}",
            escape_literal(&self.database)
        );

        match self
            .query_json_data::<TableRow>(&table_query, Some("system"))
            .await
        {
            Ok(rows) => {
                report.database_exists = !rows.is_empty();
                let existing = rows.into_iter().map(|r| r.name).collect::<HashSet<_>>();
                report.missing_tables = NAMESPACE_TABLES
                    .iter()
                    .filter(|name| !existing.contains(**name))
                    .map(|name| (*name).to_string())
                    .collect();
            }
            Err(err) => report.errors.push(format!("table listing failed: {err}")),
        }

        Ok(report)
    }
}

/// Derives the database name for one analysis run, e.g.
/// `orders_prod_20240102T030405Z_logs`.
pub fn run_namespace(cluster_name: &str, stamp: &str) -> String {
    let raw = format!("{cluster_name}_{stamp}_logs");
    let mut name: String = raw
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '_' => Some(c),
            '-' | '.' | ' ' => Some('_'),
            _ => None,
        })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

fn truncate_for_error(statement: &str) -> String {
    const LIMIT: usize = 240;
    let compact = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.len() <= LIMIT {
        compact
    } else {
        let mut end = LIMIT;
        while !compact.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &compact[..end])
    }
}

pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        bail!("identifier must not be empty");
    }

    let ok = identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !ok {
        bail!("identifier contains unsupported characters: {identifier}");
    }

    Ok(())
}

fn materialize_schema_sql(sql: &str, database: &str) -> Result<String> {
    validate_identifier(database)?;

    let mut text = sql.to_string();
    text = text.replace(
        "CREATE DATABASE IF NOT EXISTS slowscope;",
        &format!("CREATE DATABASE IF NOT EXISTS {database};"),
    );
    text = text.replace("slowscope.", &format!("{database}."));
    Ok(text)
}

fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut prev = '\0';

    for line in sql.lines() {
        if line.trim_start().starts_with("--") {
            continue;
        }

        let chars: Vec<char> = line.chars().collect();
        let mut idx = 0;
        while idx < chars.len() {
            let ch = chars[idx];
            if ch == '\'' {
                if in_single_quote && idx + 1 < chars.len() && chars[idx + 1] == '\'' {
                    current.push(ch);
                    current.push(chars[idx + 1]);
                    prev = chars[idx + 1];
                    idx += 2;
                    continue;
                }
                if prev != '\\' {
                    in_single_quote = !in_single_quote;
                }
            }

            if ch == ';' && !in_single_quote {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
                prev = '\0';
                idx += 1;
                continue;
            }

            current.push(ch);
            prev = ch;
            idx += 1;
        }

        current.push('\n');
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }

    statements
}

pub fn escape_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

pub fn escape_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Query, State},
        http::{HeaderMap, StatusCode},
        routing::get,
        Router,
    };
    use slowscope_config::ClickHouseConfig;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

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

    #[derive(Default)]
    struct Recorded {
        requests: Mutex<Vec<(HashMap<String, String>, String)>>,
    }

    async fn spawn_mock_server() -> (String, Arc<Recorded>) {
        async fn handler(
            State(state): State<Arc<Recorded>>,
            Query(params): Query<HashMap<String, String>>,
            headers: HeaderMap,
            body: String,
        ) -> (StatusCode, String) {
            if headers.get("content-length").is_none() {
                return (
                    StatusCode::LENGTH_REQUIRED,
                    "missing content-length".to_string(),
                );
            }

            state
                .requests
                .lock()
                .expect("request lock")
                .push((params.clone(), body));

            let query = params.get("query").cloned().unwrap_or_default();
            if query.contains("FAIL") {
                return (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string());
            }

            (StatusCode::OK, String::new())
        }

        let state = Arc::new(Recorded::default());
        let app = Router::new()
            .route("/", get(handler).post(handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (format!("http://{}", addr), state)
    }

    #[test]
    fn sql_split_handles_multiple_statements() {
        let sql = "CREATE TABLE a (x String);\nINSERT INTO a VALUES ('a;b');\n";
        let out = split_sql_statements(sql);
        assert_eq!(out.len(), 2);
        assert!(out[0].starts_with("CREATE TABLE"));
        assert!(out[1].contains("'a;b'"));
    }

    #[test]
    fn sql_split_handles_sql_standard_escaped_quotes() {
        let sql = "INSERT INTO a VALUES ('it''s;fine');\nSELECT 1;\n";
        let out = split_sql_statements(sql);
        assert_eq!(out.len(), 2);
        assert!(out[0].contains("'it''s;fine'"));
    }

    #[test]
    fn bundled_schema_splits_into_database_and_four_tables() {
        let sql = materialize_schema_sql(NAMESPACE_SCHEMA, "orders_20240102T030405Z_logs")
            .expect("should rewrite");
        let statements = split_sql_statements(&sql);
        assert_eq!(statements.len(), 5);
        assert_eq!(
            statements[0],
            "CREATE DATABASE IF NOT EXISTS orders_20240102T030405Z_logs"
        );
        for (statement, table) in statements[1..].iter().zip(NAMESPACE_TABLES) {
            assert!(
                statement.contains(&format!("orders_20240102T030405Z_logs.{table}")),
                "unexpected statement: {statement}"
            );
        }
    }

    #[test]
    fn identifier_validation_rejects_invalid() {
        assert!(validate_identifier("orders_prod_logs").is_ok());
        assert!(validate_identifier("orders-prod").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn run_namespace_strips_timestamp_punctuation() {
        assert_eq!(
            run_namespace("orders-prod", "2024-01-02T03:04:05+00:00"),
            "orders_prod_2024_01_02T0304050000_logs"
        );
        assert_eq!(run_namespace("9lives", "x"), "_9lives_x_logs");
        assert!(validate_identifier(&run_namespace("a.b c", "t")).is_ok());
    }

    #[test]
    fn for_namespace_rejects_unsafe_names() {
        let client = ClickHouseClient::new(test_clickhouse_config("http://127.0.0.1:1".into()))
            .expect("new client");
        assert!(client.for_namespace("bad;name").is_err());
        let scoped = client.for_namespace("run_1_logs").expect("valid namespace");
        assert_eq!(scoped.database(), "run_1_logs");
        assert_eq!(client.database(), "default");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_text_includes_status_and_body_on_http_failure() {
        let (base_url, _) = spawn_mock_server().await;
        let client = ClickHouseClient::new(test_clickhouse_config(base_url)).expect("new client");

        let err = client
            .request_text("SELECT FAIL", None, None, false, None)
            .await
            .expect_err("expected HTTP failure");

        let msg = err.to_string();
        assert!(msg.contains("clickhouse returned"));
        assert!(msg.contains("500"));
        assert!(msg.contains("boom"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_json_rows_targets_namespace_table() {
        let (base_url, state) = spawn_mock_server().await;
        let client = ClickHouseClient::new(test_clickhouse_config(base_url))
            .expect("new client")
            .for_namespace("run_1_logs")
            .expect("namespace");

        client
            .insert_json_rows(
                "slowQueries",
                &[serde_json::json!({"msg": "Slow query"}), serde_json::json!({"msg": "x"})],
            )
            .await
            .expect("insert");
        client
            .insert_json_rows("slowQueries", &[])
            .await
            .expect("empty insert is a no-op");

        let requests = state.requests.lock().expect("request lock");
        assert_eq!(requests.len(), 1);
        let (params, body) = &requests[0];
        assert_eq!(
            params.get("query").map(String::as_str),
            Some("INSERT INTO `run_1_logs`.`slowQueries` FORMAT JSONEachRow")
        );
        assert_eq!(params.get("async_insert").map(String::as_str), Some("1"));
        assert_eq!(body.lines().count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ensure_namespace_creates_database_then_tables() {
        let (base_url, state) = spawn_mock_server().await;
        let client = ClickHouseClient::new(test_clickhouse_config(base_url))
            .expect("new client")
            .for_namespace("orders_20240102T030405Z_logs")
            .expect("namespace");

        client.ensure_namespace().await.expect("namespace created");

        let requests = state.requests.lock().expect("request lock");
        assert_eq!(requests.len(), 1 + NAMESPACE_TABLES.len());
        let (first, _) = &requests[0];
        assert!(first["query"].starts_with("CREATE DATABASE IF NOT EXISTS"));
        assert!(!first.contains_key("database"));
        for ((params, _), table) in requests[1..].iter().zip(NAMESPACE_TABLES) {
            assert_eq!(
                params.get("database").map(String::as_str),
                Some("orders_20240102T030405Z_logs")
            );
            assert!(params["query"].contains(table));
        }
    }
}
