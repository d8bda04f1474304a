//! Runs parameterized multi-statement scripts inside a tenant transaction.
//!
//! The pipeline is the same for every caller (named queries, local interceptor
//! scripts, webhook callbacks and jobs): substitute `$i` markers, substitute context
//! markers, split into statements, then bind each parameter row across the statements
//! in order. A failure rolls the whole transaction back. Committing is always the
//! caller's job.

mod params;
mod split;

use rusqlite::{Connection, Statement, params_from_iter};
use serde_json::Value;

use crate::core::auth::{Identity, IdentityKind};
use crate::core::error::{CoreError, CoreResult};
use crate::core::tenant::TenantTx;

pub use params::{from_sql, to_marker_text, to_sql};
pub use split::split_statements;

pub const DEFAULT_PAGE_SIZE: i64 = 1000;
pub const MAX_PAGE_SIZE: i64 = 10_000;

/// Per-request values for the named markers a script may reference.
#[derive(Debug, Clone, Default)]
pub struct ContextVars {
    pairs: Vec<(&'static str, String)>,
}

impl ContextVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_caller(identity: &Identity, client_ip: Option<&str>) -> Self {
        let (login_id, login_code, token_id, token_code) = match identity.kind {
            IdentityKind::Token => (
                String::new(),
                String::new(),
                identity.subject_id.clone(),
                identity.subject_code.clone(),
            ),
            _ => (
                identity.subject_id.clone(),
                identity.subject_code.clone(),
                String::new(),
                String::new(),
            ),
        };
        Self {
            pairs: vec![
                ("__ip__", client_ip.unwrap_or_default().to_string()),
                ("__login_user_id__", login_id),
                ("__login_user_code__", login_code),
                ("__token_user_id__", token_id),
                ("__token_user_code__", token_code),
            ],
        }
    }

    /// Replaces every marker. Values are escaped for use inside single-quoted literals.
    pub fn apply(&self, script: &str) -> String {
        let mut out = script.to_string();
        for (marker, value) in &self.pairs {
            if out.contains(marker) {
                out = out.replace(marker, &value.replace('\'', "''"));
            }
        }
        out
    }
}

/// `$i` markers first, highest index down so `$10` is not consumed by `$1`, then context markers.
pub fn substitute(script: &str, query_params: &[String], vars: &ContextVars) -> String {
    let mut out = script.to_string();
    for (i, value) in query_params.iter().enumerate().rev() {
        out = out.replace(&format!("${}", i), value);
    }
    vars.apply(&out)
}

pub fn prepare_script(script: &str, query_params: &[String], vars: &ContextVars) -> Vec<String> {
    split_statements(&substitute(script, query_params, vars))
}

/// Executes `script` once per row of `rows`, returning rows affected per statement per row.
///
/// An empty `rows` executes nothing; pass one empty row for a parameterless run.
pub fn execute_batch(
    tx: &mut TenantTx,
    script: &str,
    query_params: &[String],
    rows: &[Vec<Value>],
    vars: &ContextVars,
) -> CoreResult<Vec<Vec<usize>>> {
    let statements = prepare_script(script, query_params, vars);
    let result = run_rows(tx.conn()?, &statements, rows);
    if result.is_err() {
        tx.rollback();
    }
    result
}

fn run_rows(
    conn: &Connection,
    statements: &[String],
    rows: &[Vec<Value>],
) -> CoreResult<Vec<Vec<usize>>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut consumed = 0;
        let mut affected = Vec::with_capacity(statements.len());
        for sql in statements {
            let mut stmt = conn.prepare_cached(sql)?;
            let args = take_args(row, &mut consumed, stmt.parameter_count())?;
            affected.push(step(&mut stmt, args)?);
        }
        out.push(affected);
    }
    Ok(out)
}

fn take_args<'a>(row: &'a [Value], consumed: &mut usize, needed: usize) -> CoreResult<&'a [Value]> {
    let end = *consumed + needed;
    if row.len() < end {
        return Err(CoreError::ParameterAlignment {
            expected: end,
            actual: row.len(),
        });
    }
    let args = &row[*consumed..end];
    *consumed = end;
    Ok(args)
}

/// Runs one statement. Statements that return columns are stepped to completion and report 0.
fn step(stmt: &mut Statement<'_>, args: &[Value]) -> rusqlite::Result<usize> {
    let bound = params_from_iter(args.iter().map(to_sql));
    if stmt.column_count() > 0 {
        let mut rows = stmt.query(bound)?;
        while rows.next()?.is_some() {}
        Ok(0)
    } else {
        stmt.execute(bound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn parse(value: &str) -> CoreResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "asc" => Ok(SortDir::Asc),
            "desc" => Ok(SortDir::Desc),
            other => Err(CoreError::Validation(format!("Invalid sort direction: {}", other))),
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paging {
    pub page_number: i64,
    pub page_size: i64,
    pub sort: Option<(String, SortDir)>,
}

impl Paging {
    pub fn new(page_number: Option<i64>, page_size: Option<i64>) -> Self {
        Self {
            page_number: page_number.filter(|p| *p > 0).unwrap_or(1),
            page_size: page_size.filter(|s| *s > 0).unwrap_or(DEFAULT_PAGE_SIZE),
            sort: None,
        }
    }

    /// Like `new`, but rejects a page size above `MAX_PAGE_SIZE` and pages whose
    /// offset does not fit in an i64.
    pub fn checked(page_number: Option<i64>, page_size: Option<i64>) -> CoreResult<Self> {
        if let Some(size) = page_size.filter(|s| *s > MAX_PAGE_SIZE) {
            return Err(CoreError::Validation(format!(
                "limit {} exceeds the maximum of {}",
                size, MAX_PAGE_SIZE
            )));
        }
        let paging = Self::new(page_number, page_size);
        paging.offset()?;
        Ok(paging)
    }

    pub fn offset(&self) -> CoreResult<i64> {
        (self.page_number - 1)
            .checked_mul(self.page_size)
            .ok_or_else(|| CoreError::Validation("page out of range".to_string()))
    }

    pub fn total_pages(&self, total_rows: i64) -> i64 {
        let full = total_rows / self.page_size;
        if total_rows % self.page_size > 0 { full + 1 } else { full }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub total_rows: i64,
}

/// Runs `script` with one parameter tuple spread across its statements and returns the
/// result set of the last statement that produces columns. `paging` applies to the
/// final statement.
pub fn query_batch(
    tx: &mut TenantTx,
    script: &str,
    query_params: &[String],
    args: &[Value],
    vars: &ContextVars,
    paging: Option<&Paging>,
) -> CoreResult<QueryResult> {
    let statements = prepare_script(script, query_params, vars);
    let result = run_query(tx.conn()?, &statements, args, paging);
    if result.is_err() {
        tx.rollback();
    }
    result
}

fn run_query(
    conn: &Connection,
    statements: &[String],
    args: &[Value],
    paging: Option<&Paging>,
) -> CoreResult<QueryResult> {
    let mut result = QueryResult::default();
    let mut consumed = 0;
    let last = statements.len().saturating_sub(1);
    for (i, sql) in statements.iter().enumerate() {
        let mut stmt = conn.prepare(sql)?;
        let slice = take_args(args, &mut consumed, stmt.parameter_count())?;
        if stmt.column_count() == 0 {
            stmt.execute(params_from_iter(slice.iter().map(to_sql)))?;
            continue;
        }
        result = match paging {
            Some(paging) if i == last => {
                drop(stmt);
                run_paged(conn, sql, slice, paging)?
            }
            _ => collect(&mut stmt, slice)?,
        };
    }
    Ok(result)
}

fn collect(stmt: &mut Statement<'_>, args: &[Value]) -> CoreResult<QueryResult> {
    let headers: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = headers.len();
    let mut rows = stmt.query(params_from_iter(args.iter().map(to_sql)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(from_sql(row.get_ref(i)?));
        }
        out.push(values);
    }
    Ok(QueryResult {
        headers,
        total_rows: out.len() as i64,
        rows: out,
    })
}

fn run_paged(conn: &Connection, sql: &str, args: &[Value], paging: &Paging) -> CoreResult<QueryResult> {
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM ({})", sql),
        params_from_iter(args.iter().map(to_sql)),
        |row| row.get(0),
    )?;

    let order = match &paging.sort {
        Some((column, dir)) => format!(" ORDER BY {} {}", quote_ident(column)?, dir.as_sql()),
        None => String::new(),
    };
    let offset = paging.offset()?;
    let paged = format!(
        "SELECT * FROM ({}){} LIMIT {} OFFSET {}",
        sql, order, paging.page_size, offset
    );
    let mut stmt = conn.prepare(&paged)?;
    let mut result = collect(&mut stmt, args)?;
    result.total_rows = total;
    Ok(result)
}

/// Quotes a table or column name, optionally dot-qualified. Anything outside
/// `[A-Za-z0-9_]` is rejected.
pub fn quote_ident(name: &str) -> CoreResult<String> {
    let name = name.replace('`', "");
    let mut parts = Vec::new();
    for part in name.trim().split('.') {
        let valid = !part.is_empty()
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !part.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(CoreError::Validation(format!("Invalid identifier: {}", name)));
        }
        parts.push(format!("\"{}\"", part));
    }
    Ok(parts.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn db() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id TEXT PRIMARY KEY, x INTEGER);
             CREATE TABLE u (id TEXT PRIMARY KEY);
             INSERT INTO t VALUES ('a', 0), ('b', 0);
             INSERT INTO u VALUES ('a'), ('b');",
        )
        .unwrap();
        Arc::new(Mutex::new(conn))
    }

    async fn scalar(db: &Arc<Mutex<Connection>>, sql: &str) -> i64 {
        db.lock().await.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[tokio::test]
    async fn scenario_b_params_spread_across_statements() {
        let db = db();
        let mut tx = TenantTx::begin(db.clone()).await.unwrap();
        let result = execute_batch(
            &mut tx,
            "UPDATE t SET x=? WHERE id=?; DELETE FROM u WHERE id=?",
            &[],
            &[vec![json!(5), json!("a"), json!("a")]],
            &ContextVars::new(),
        )
        .unwrap();
        assert_eq!(result, vec![vec![1, 1]]);
        tx.commit().unwrap();
        drop(tx);
        assert_eq!(scalar(&db, "SELECT x FROM t WHERE id = 'a'").await, 5);
        assert_eq!(scalar(&db, "SELECT COUNT(*) FROM u").await, 1);
    }

    #[tokio::test]
    async fn short_row_is_a_parameter_error_and_rolls_back() {
        let db = db();
        let mut tx = TenantTx::begin(db.clone()).await.unwrap();
        let err = execute_batch(
            &mut tx,
            "UPDATE t SET x=? WHERE id=?; DELETE FROM u WHERE id=?",
            &[],
            &[vec![json!(9), json!("a"), json!("a")], vec![json!(9), json!("b")]],
            &ContextVars::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CoreError::ParameterAlignment {
                expected: 3,
                actual: 2
            }
        ));
        assert!(!tx.is_open());
        drop(tx);
        // Row 0 and the first statement of row 1 are gone with the rollback.
        assert_eq!(scalar(&db, "SELECT COUNT(*) FROM t WHERE x = 9").await, 0);
        assert_eq!(scalar(&db, "SELECT COUNT(*) FROM u").await, 2);
    }

    #[tokio::test]
    async fn failing_statement_discards_earlier_rows() {
        let db = db();
        let mut tx = TenantTx::begin(db.clone()).await.unwrap();
        let err = execute_batch(
            &mut tx,
            "UPDATE t SET x = ? WHERE id = ?; INSERT INTO u VALUES (?)",
            &[],
            &[
                vec![json!(1), json!("a"), json!("c")],
                vec![json!(2), json!("b"), json!("a")],
            ],
            &ContextVars::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "database");
        drop(tx);
        assert_eq!(scalar(&db, "SELECT SUM(x) FROM t").await, 0);
        assert_eq!(scalar(&db, "SELECT COUNT(*) FROM u").await, 2);
    }

    #[tokio::test]
    async fn rerun_after_rollback_is_deterministic() {
        let db = db();
        let rows = vec![vec![json!(3), json!("a")], vec![json!(4), json!("zzz")]];
        let mut results = Vec::new();
        for _ in 0..2 {
            let mut tx = TenantTx::begin(db.clone()).await.unwrap();
            results.push(
                execute_batch(
                    &mut tx,
                    "UPDATE t SET x = ? WHERE id = ?",
                    &[],
                    &rows,
                    &ContextVars::new(),
                )
                .unwrap(),
            );
            tx.rollback();
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], vec![vec![1], vec![0]]);
    }

    #[tokio::test]
    async fn positional_and_context_markers() {
        let identity = Identity {
            subject_id: "u1".into(),
            subject_code: "o'neil@example.com".into(),
            scope_mode: "rwx".into(),
            targets: "*".into(),
            tenant_id: "p1".into(),
            kind: IdentityKind::Member,
        };
        let vars = ContextVars::for_caller(&identity, Some("10.0.0.1"));
        let params: Vec<String> = (0..11).map(|i| format!("p{}", i)).collect();
        let out = substitute(
            "SELECT $10, $1 FROM $0 WHERE who = '__login_user_code__' AND ip = '__ip__' AND t = '__token_user_id__'",
            &params,
            &vars,
        );
        assert_eq!(
            out,
            "SELECT p10, p1 FROM p0 WHERE who = 'o''neil@example.com' AND ip = '10.0.0.1' AND t = ''"
        );
    }

    #[tokio::test]
    async fn query_batch_returns_last_result_set_with_paging() {
        let db = db();
        {
            let conn = db.lock().await;
            conn.execute_batch("INSERT INTO t VALUES ('c', 3), ('d', 4), ('e', 5)")
                .unwrap();
        }
        let mut tx = TenantTx::begin(db.clone()).await.unwrap();
        let mut paging = Paging::new(Some(2), Some(2));
        paging.sort = Some(("id".to_string(), SortDir::Desc));
        let result = query_batch(
            &mut tx,
            "UPDATE t SET x = x WHERE id = ?; SELECT id, x FROM $0 WHERE x >= ?",
            &["t".to_string()],
            &[json!("a"), json!(0)],
            &ContextVars::new(),
            Some(&paging),
        )
        .unwrap();
        assert_eq!(result.headers, vec!["id", "x"]);
        assert_eq!(result.total_rows, 5);
        assert_eq!(result.rows, vec![vec![json!("c"), json!(3)], vec![json!("b"), json!(0)]]);
        assert_eq!(paging.total_pages(result.total_rows), 3);
    }

    #[test]
    fn oversized_paging_is_rejected() {
        assert!(matches!(Paging::checked(Some(1), Some(i64::MAX)), Err(CoreError::Validation(_))));
        assert!(matches!(Paging::checked(Some(i64::MAX), Some(1000)), Err(CoreError::Validation(_))));
        assert!(Paging::checked(Some(3), Some(MAX_PAGE_SIZE)).is_ok());

        let widest = Paging::new(Some(1), Some(i64::MAX));
        assert_eq!(widest.total_pages(3), 1);
        assert_eq!(widest.total_pages(0), 0);
        assert!(Paging::new(Some(i64::MAX), Some(2)).offset().is_err());
    }

    #[test]
    fn identifiers_are_validated() {
        assert_eq!(quote_ident("orders").unwrap(), "\"orders\"");
        assert_eq!(quote_ident("`shop`.orders").unwrap(), "\"shop\".\"orders\"");
        assert!(quote_ident("orders; DROP TABLE x").is_err());
        assert!(quote_ident("").is_err());
        assert!(quote_ident("1abc").is_err());
    }
}
