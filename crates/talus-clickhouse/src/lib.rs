//! ClickHouse transport shared by every talus crate that touches storage.
//!
//! Everything rides the HTTP interface as POST with the statement in the
//! `query` parameter. All talus SQL carries fully qualified `db.table`
//! references, so no session database is ever negotiated with the server;
//! reads end in `FORMAT JSONEachRow` and deserialize one serde row per
//! line. Schema setup is a small revision runner over the bundled `sql/`
//! files.

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use talus_config::ClickHouseConfig;

#[derive(Clone)]
pub struct ClickHouseClient {
    cfg: ClickHouseConfig,
    http: reqwest::Client,
}

/// One bundled schema revision, applied at most once per database.
#[derive(Debug, Clone, Copy)]
pub struct SchemaRevision {
    pub id: u16,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const SCHEMA_REVISIONS: [SchemaRevision; 2] = [
    SchemaRevision {
        id: 1,
        name: "schema",
        sql: include_str!("../../../sql/001_schema.sql"),
    },
    SchemaRevision {
        id: 2,
        name: "analysis",
        sql: include_str!("../../../sql/002_analysis.sql"),
    },
];

const REQUIRED_TABLES: [&str; 7] = [
    "log_files",
    "log_events",
    "known_issues",
    "known_issue_hits",
    "device_sessions",
    "analysis_snapshots",
    "schema_revisions",
];

/// What `talusctl db doctor` prints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub reachable: bool,
    pub server_version: Option<String>,
    pub database: String,
    pub database_exists: bool,
    pub applied_revisions: Vec<u16>,
    pub pending_revisions: Vec<u16>,
    pub missing_tables: Vec<String>,
    pub problems: Vec<String>,
}

#[derive(Deserialize)]
struct NameRow {
    name: String,
}

impl ClickHouseClient {
    pub fn new(cfg: ClickHouseConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout_seconds.max(1.0)))
            .build()
            .context("failed to build http client")?;

        Ok(Self { cfg, http })
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.cfg
    }

    fn db(&self) -> String {
        sql_ident(&self.cfg.database)
    }

    /// Sends one statement. `payload` carries JSONEachRow lines for inserts
    /// and stays empty for reads and DDL.
    async fn send(&self, sql: &str, payload: Vec<u8>, insert: bool) -> Result<String> {
        let mut params: Vec<(&str, &str)> = vec![("query", sql)];
        if insert && self.cfg.async_insert {
            params.push(("async_insert", "1"));
            if self.cfg.wait_for_async_insert {
                params.push(("wait_for_async_insert", "1"));
            }
        }

        let mut request = self.http.post(&self.cfg.url).query(&params).body(payload);
        if !self.cfg.username.is_empty() {
            request = request.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }

        let response = request.send().await.context("clickhouse unreachable")?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("clickhouse response body unreadable (http {status})"))?;

        if !status.is_success() {
            bail!("clickhouse http {status}: {}", body.trim());
        }

        Ok(body)
    }

    pub async fn ping(&self) -> Result<()> {
        let body = self.send("SELECT 1", Vec::new(), false).await?;
        if body.trim() == "1" {
            Ok(())
        } else {
            Err(anyhow!("ping returned {:?}", body.trim()))
        }
    }

    /// Runs a fully qualified SELECT ending in `FORMAT JSONEachRow` and
    /// deserializes one row per non-empty line.
    pub async fn query_rows<T: DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let body = self.send(sql, Vec::new(), false).await?;
        body.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str::<T>(line)
                    .with_context(|| format!("bad JSONEachRow line: {line}"))
            })
            .collect()
    }

    /// Inserts rows into a table of the configured database.
    pub async fn insert_rows(&self, table: &str, rows: &[Value]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut payload = Vec::with_capacity(rows.len() * 128);
        for row in rows {
            serde_json::to_writer(&mut payload, row).context("row does not serialize")?;
            payload.push(b'\n');
        }

        let sql = format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            self.db(),
            sql_ident(table)
        );
        self.send(&sql, payload, true).await.map(|_| ())
    }

    /// Applies every bundled schema revision the database has not seen yet
    /// and returns the names applied on this call.
    pub async fn migrate(&self) -> Result<Vec<&'static str>> {
        validate_database(&self.cfg.database)?;

        self.send(
            &format!("CREATE DATABASE IF NOT EXISTS {}", self.db()),
            Vec::new(),
            false,
        )
        .await?;
        self.ensure_revision_ledger().await?;
        let applied = self.applied_revisions().await?;

        let mut ran = Vec::new();
        for revision in SCHEMA_REVISIONS {
            if applied.contains(&revision.id) {
                continue;
            }

            for statement in statements(&qualify(revision.sql, &self.cfg.database)) {
                self.send(&statement, Vec::new(), false)
                    .await
                    .with_context(|| {
                        format!(
                            "revision {} failed at: {}",
                            revision.name,
                            head_of(&statement)
                        )
                    })?;
            }

            // The ledger row goes in synchronously so a crash between
            // statements re-runs the (idempotent) revision, never skips it.
            let record = format!(
                "INSERT INTO {}.schema_revisions (revision, name) VALUES ({}, {})",
                self.db(),
                revision.id,
                sql_str(revision.name)
            );
            self.send(&record, Vec::new(), false)
                .await
                .with_context(|| format!("failed to record revision {}", revision.name))?;

            ran.push(revision.name);
        }

        Ok(ran)
    }

    pub async fn health_report(&self) -> Result<HealthReport> {
        let mut report = HealthReport {
            reachable: false,
            server_version: None,
            database: self.cfg.database.clone(),
            database_exists: false,
            applied_revisions: Vec::new(),
            pending_revisions: SCHEMA_REVISIONS.iter().map(|r| r.id).collect(),
            missing_tables: Vec::new(),
            problems: Vec::new(),
        };

        if let Err(err) = self.ping().await {
            report.problems.push(format!("ping failed: {err}"));
            return Ok(report);
        }
        report.reachable = true;

        #[derive(Deserialize)]
        struct VersionRow {
            version: String,
        }
        match self
            .query_rows::<VersionRow>("SELECT version() AS version FORMAT JSONEachRow")
            .await
        {
            Ok(rows) => report.server_version = rows.into_iter().next().map(|r| r.version),
            Err(err) => report.problems.push(format!("version query failed: {err}")),
        }

        let databases = match self
            .query_rows::<NameRow>(&format!(
                "SELECT name FROM system.databases WHERE name = {} FORMAT JSONEachRow",
                sql_str(&self.cfg.database)
            ))
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                report.problems.push(format!("database lookup failed: {err}"));
                return Ok(report);
            }
        };
        if databases.is_empty() {
            report
                .problems
                .push(format!("database '{}' does not exist", self.cfg.database));
            return Ok(report);
        }
        report.database_exists = true;

        match self.applied_revisions().await {
            Ok(applied) => {
                report.pending_revisions = SCHEMA_REVISIONS
                    .iter()
                    .map(|r| r.id)
                    .filter(|id| !applied.contains(id))
                    .collect();
                report.applied_revisions = applied.into_iter().collect();
            }
            Err(err) => report
                .problems
                .push(format!("revision ledger unreadable: {err}")),
        }

        match self
            .query_rows::<NameRow>(&format!(
                "SELECT name FROM system.tables WHERE database = {} FORMAT JSONEachRow",
                sql_str(&self.cfg.database)
            ))
            .await
        {
            Ok(rows) => {
                let present: BTreeSet<String> = rows.into_iter().map(|r| r.name).collect();
                report.missing_tables = REQUIRED_TABLES
                    .iter()
                    .filter(|table| !present.contains(**table))
                    .map(|table| (*table).to_string())
                    .collect();
            }
            Err(err) => report.problems.push(format!("table listing failed: {err}")),
        }

        Ok(report)
    }

    async fn ensure_revision_ledger(&self) -> Result<()> {
        self.send(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.schema_revisions (\
                 revision UInt16, \
                 name String, \
                 applied_at DateTime64(3) DEFAULT now64(3)\
                 ) ENGINE = ReplacingMergeTree(applied_at) ORDER BY (revision)",
                self.db()
            ),
            Vec::new(),
            false,
        )
        .await
        .map(|_| ())
    }

    async fn applied_revisions(&self) -> Result<BTreeSet<u16>> {
        #[derive(Deserialize)]
        struct Row {
            revision: u16,
        }

        let rows: Vec<Row> = self
            .query_rows(&format!(
                "SELECT DISTINCT toUInt16(revision) AS revision \
                 FROM {}.schema_revisions FORMAT JSONEachRow",
                self.db()
            ))
            .await?;
        Ok(rows.into_iter().map(|row| row.revision).collect())
    }
}

/// The bundled SQL keeps one statement per `;` and never quotes a
/// semicolon, so splitting is line-comment stripping plus a plain split.
fn statements(sql: &str) -> Vec<String> {
    let stripped: String = sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    stripped
        .split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .map(str::to_string)
        .collect()
}

/// Rewrites the `talus` database the bundled SQL names into the configured
/// one.
fn qualify(sql: &str, database: &str) -> String {
    sql.replace("talus.", &format!("{database}."))
        .replace(
            "CREATE DATABASE IF NOT EXISTS talus",
            &format!("CREATE DATABASE IF NOT EXISTS {database}"),
        )
}

fn validate_database(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !ok {
        bail!("database name must be [A-Za-z0-9_]+, got {name:?}");
    }
    Ok(())
}

fn head_of(statement: &str) -> String {
    statement
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(160)
        .collect()
}

pub fn sql_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn sql_str(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
