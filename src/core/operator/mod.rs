//! Access-controlled data operations.
//!
//! Each call owns one transaction end to end: it opens before the before-chain,
//! the operation and the after-chain run inside it, and it commits only when all of
//! them succeeded. Deferred effects are applied after the commit.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::core::auth::Identity;
use crate::core::cache::{self, Cached, keys};
use crate::core::catalog::DefinitionCatalog;
use crate::core::context::{Deferred, ExecutionContext};
use crate::core::error::{CoreError, CoreResult};
use crate::core::executor::{self, ContextVars, Paging, QueryResult, from_sql, quote_ident, to_sql};
use crate::core::interceptor::{Action, HookCall, InterceptorRegistry};
use crate::core::jobs::JobScheduler;
use crate::core::store::{ADMIN_TENANT, new_id};
use crate::core::store::types::{QueryRecord, UsageStats};
use crate::core::tenant::{TenantRegistry, TenantTx};

/// A named query call. `params` is one tuple spread across the script's statements.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub name: String,
    pub query_params: Vec<String>,
    pub params: Vec<Value>,
    pub paging: Option<Paging>,
}

/// A named script call, executed once per row of `params`.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub name: String,
    pub query_params: Vec<String>,
    pub params: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub headers: Vec<String>,
    pub data_array: Vec<Value>,
    pub total_rows: i64,
    pub total_pages: i64,
    pub page_number: i64,
    pub page_size: i64,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecResponse {
    /// Rows affected, per parameter row then per statement.
    pub data_array: Vec<Vec<usize>>,
    pub total_rows: usize,
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Map,
    Array,
}

pub struct DataOperator {
    tenants: Arc<TenantRegistry>,
    catalog: DefinitionCatalog,
    registry: Arc<InterceptorRegistry>,
    scheduler: Option<Arc<JobScheduler>>,
}

impl DataOperator {
    pub fn new(
        tenants: Arc<TenantRegistry>,
        catalog: DefinitionCatalog,
        registry: Arc<InterceptorRegistry>,
        scheduler: Option<Arc<JobScheduler>>,
    ) -> Self {
        Self {
            tenants,
            catalog,
            registry,
            scheduler,
        }
    }

    pub async fn query_map(
        &self,
        identity: Identity,
        client_ip: Option<String>,
        request: QueryRequest,
    ) -> CoreResult<QueryResponse> {
        self.query(identity, client_ip, request, Shape::Map).await
    }

    pub async fn query_array(
        &self,
        identity: Identity,
        client_ip: Option<String>,
        request: QueryRequest,
    ) -> CoreResult<QueryResponse> {
        self.query(identity, client_ip, request, Shape::Array).await
    }

    async fn query(
        &self,
        identity: Identity,
        client_ip: Option<String>,
        request: QueryRequest,
        shape: Shape,
    ) -> CoreResult<QueryResponse> {
        let query = self.named_query(&identity.tenant_id, &request.name).await?;
        let action = match shape {
            Shape::Map => Action::QueryMap,
            Shape::Array => Action::QueryArray,
        };
        let mut call = HookCall::new(&request.name, action, Value::Array(request.params.clone()));
        call.query_params = request.query_params.clone();
        call.params = vec![request.params.clone()];

        let paging = request.paging.unwrap_or_else(|| Paging::new(None, None));
        self.run(identity, client_ip, call, move |tx, call, vars| {
            let args = call.params.first().map(Vec::as_slice).unwrap_or_default();
            let result = executor::query_batch(tx, &query.script, &call.query_params, args, vars, Some(&paging))?;
            Ok(query_response(
                result,
                shape,
                &paging,
                executor::substitute(&query.script, &call.query_params, vars),
            ))
        })
        .await
    }

    pub async fn exec(
        &self,
        identity: Identity,
        client_ip: Option<String>,
        request: ExecRequest,
    ) -> CoreResult<ExecResponse> {
        let query = self.named_query(&identity.tenant_id, &request.name).await?;
        let data = serde_json::to_value(&request.params)?;
        let mut call = HookCall::new(&request.name, Action::Exec, data);
        call.query_params = request.query_params;
        call.params = request.params;

        self.run(identity, client_ip, call, move |tx, call, vars| {
            let once = [Vec::new()];
            let rows = if call.params.is_empty() {
                &once[..]
            } else {
                &call.params[..]
            };
            let affected = executor::execute_batch(tx, &query.script, &call.query_params, rows, vars)?;
            Ok(ExecResponse {
                total_rows: affected.len(),
                data_array: affected,
                sql: executor::substitute(&query.script, &call.query_params, vars),
            })
        })
        .await
    }

    /// Inserts `rows` into `table`. Rows without an `id` get one. Returns the rows as inserted.
    pub async fn create(
        &self,
        identity: Identity,
        client_ip: Option<String>,
        table: &str,
        rows: Vec<Map<String, Value>>,
    ) -> CoreResult<Value> {
        let quoted = quote_ident(table)?;
        let rows: Vec<Value> = rows
            .into_iter()
            .map(|mut row| {
                let has_id = row.get("id").is_some_and(|v| !v.is_null() && v.as_str() != Some(""));
                if !has_id {
                    row.insert("id".to_string(), Value::String(new_id()));
                }
                Value::Object(row)
            })
            .collect();
        let call = HookCall::new(table, Action::Create, Value::Array(rows));

        self.run(identity, client_ip, call, move |tx, call, _vars| {
            let conn = tx.conn()?;
            for row in rows_of(&call.data)? {
                let columns = row.keys().map(|k| quote_ident(k)).collect::<CoreResult<Vec<_>>>()?;
                let marks = vec!["?"; columns.len()].join(", ");
                let sql = format!("INSERT INTO {} ({}) VALUES ({})", quoted, columns.join(", "), marks);
                conn.execute(&sql, rusqlite::params_from_iter(row.values().map(to_sql)))?;
            }
            Ok(call.data.clone())
        })
        .await
    }

    pub async fn load(&self, identity: Identity, client_ip: Option<String>, table: &str, id: &str) -> CoreResult<Value> {
        let quoted = quote_ident(table)?;
        let call = HookCall::new(table, Action::Load, Value::Array(vec![Value::String(id.to_string())]));
        let id = id.to_string();

        self.run(identity, client_ip, call, move |tx, _call, _vars| {
            let conn = tx.conn()?;
            let mut stmt = conn.prepare(&format!("SELECT * FROM {} WHERE id = ?1", quoted))?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query(rusqlite::params![id])?;
            let Some(row) = rows.next()? else {
                return Err(CoreError::NotFound(format!("No row '{}'", id)));
            };
            let mut out = Map::new();
            for (i, name) in names.iter().enumerate() {
                out.insert(name.clone(), from_sql(row.get_ref(i)?));
            }
            Ok(Value::Object(out))
        })
        .await
    }

    /// Updates rows by `id`. Every row must carry one. Returns rows affected per row.
    pub async fn update(
        &self,
        identity: Identity,
        client_ip: Option<String>,
        table: &str,
        rows: Vec<Map<String, Value>>,
    ) -> CoreResult<Value> {
        let quoted = quote_ident(table)?;
        if rows.iter().any(|row| row.get("id").and_then(Value::as_str).is_none_or(str::is_empty)) {
            return Err(CoreError::Validation("Every updated row needs an id".to_string()));
        }
        let call = HookCall::new(table, Action::Update, Value::Array(rows.into_iter().map(Value::Object).collect()));

        self.run(identity, client_ip, call, move |tx, call, _vars| {
            let conn = tx.conn()?;
            let mut affected = Vec::new();
            for row in rows_of(&call.data)? {
                let id = row.get("id").cloned().unwrap_or(Value::Null);
                let fields: Vec<(&String, &Value)> = row.iter().filter(|(k, _)| k.as_str() != "id").collect();
                if fields.is_empty() {
                    affected.push(0);
                    continue;
                }
                let sets = fields
                    .iter()
                    .map(|(k, _)| quote_ident(k).map(|c| format!("{} = ?", c)))
                    .collect::<CoreResult<Vec<_>>>()?;
                let sql = format!("UPDATE {} SET {} WHERE id = ?", quoted, sets.join(", "));
                let values = fields.iter().map(|(_, v)| to_sql(v)).chain(std::iter::once(to_sql(&id)));
                affected.push(conn.execute(&sql, rusqlite::params_from_iter(values))?);
            }
            Ok(serde_json::to_value(affected)?)
        })
        .await
    }

    pub async fn delete(
        &self,
        identity: Identity,
        client_ip: Option<String>,
        table: &str,
        ids: Vec<String>,
    ) -> CoreResult<Value> {
        let quoted = quote_ident(table)?;
        let call = HookCall::new(table, Action::Delete, Value::Array(ids.into_iter().map(Value::String).collect()));

        self.run(identity, client_ip, call, move |tx, call, _vars| {
            let conn = tx.conn()?;
            let mut stmt = conn.prepare(&format!("DELETE FROM {} WHERE id = ?1", quoted))?;
            let mut deleted = 0;
            if let Value::Array(ids) = &call.data {
                for id in ids {
                    deleted += stmt.execute([to_sql(id)])?;
                }
            }
            Ok(serde_json::json!({ "deleted": deleted }))
        })
        .await
    }

    async fn named_query(&self, tenant_id: &str, name: &str) -> CoreResult<QueryRecord> {
        self.catalog
            .query(tenant_id, name)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Query '{}' not found", name)))
    }

    /// The shared pipeline: quota, transaction, before-chain, operation, after-chain,
    /// commit, deferred effects, accounting.
    async fn run<T, F>(&self, identity: Identity, client_ip: Option<String>, mut call: HookCall, op: F) -> CoreResult<T>
    where
        T: Serialize + Send,
        F: FnOnce(&mut TenantTx, &HookCall, &ContextVars) -> CoreResult<T> + Send,
    {
        let tenant_id = identity.tenant_id.clone();
        let admin = tenant_id == ADMIN_TENANT;
        if !admin {
            self.check_quota(&tenant_id).await?;
        }

        let tx = self.tenants.begin(&tenant_id).await?;
        let mut ctx = ExecutionContext::new(identity, client_ip, tx);
        self.registry.run_before(&mut ctx, &mut call).await?;

        let vars = ctx.vars();
        let output = match op(ctx.tx(), &call, &vars) {
            Ok(output) => output,
            Err(e) => {
                ctx.rollback();
                return Err(e);
            }
        };
        call.result = serde_json::to_value(&output)?;

        self.registry.run_after(&mut ctx, &call).await?;
        let deferred = ctx.commit()?;
        self.apply(deferred).await;

        if !admin {
            if let Err(e) = self.catalog.store().record_request(&tenant_id).await {
                warn!("Failed to record request for tenant '{}': {}", tenant_id, e);
            }
        }
        Ok(output)
    }

    async fn check_quota(&self, tenant_id: &str) -> CoreResult<()> {
        let cache = self.catalog.cache();
        let key = keys::stats(tenant_id);
        let stats = match cache::lookup::<UsageStats>(cache.as_ref(), &key).await? {
            Cached::Present(stats) => stats,
            Cached::Absent => return Ok(()),
            Cached::Miss => {
                let stats = self.catalog.store().load_stats(tenant_id).await?;
                cache::store(cache.as_ref(), &key, Some(&stats)).await?;
                stats
            }
        };
        if stats.requests_exhausted() {
            return Err(CoreError::Authorization("request quota exceeded".to_string()));
        }
        Ok(())
    }

    /// Post-commit effects. The data is already committed, so failures are logged only.
    async fn apply(&self, deferred: Vec<Deferred>) {
        for effect in deferred {
            match effect {
                Deferred::Invalidate(key) => {
                    debug!("Invalidating {}", key);
                    if let Err(e) = self.catalog.cache().delete(&key).await {
                        error!("Failed to invalidate {}: {}", key, e);
                    }
                }
                Deferred::SyncJob(id) => match &self.scheduler {
                    Some(scheduler) => {
                        if let Err(e) = scheduler.sync_job(&id).await {
                            error!("Failed to re-sync job {}: {}", id, e);
                        }
                    }
                    None => debug!("No scheduler on this node; job {} syncs at next start", id),
                },
                Deferred::Notify(notification) => {
                    if let Err(e) = self.catalog.store().enqueue_notification(&notification).await {
                        error!(
                            "Failed to queue notification for {} {}: {}",
                            notification.target, notification.action, e
                        );
                    }
                }
            }
        }
    }
}

fn rows_of(data: &Value) -> CoreResult<Vec<&Map<String, Value>>> {
    let Value::Array(items) = data else {
        return Err(CoreError::Validation("Expected a list of rows".to_string()));
    };
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| CoreError::Validation("Every row must be an object".to_string()))
        })
        .collect()
}

fn query_response(result: QueryResult, shape: Shape, paging: &Paging, sql: String) -> QueryResponse {
    let data_array = match shape {
        Shape::Array => result.rows.into_iter().map(Value::Array).collect(),
        Shape::Map => result
            .rows
            .into_iter()
            .map(|row| {
                Value::Object(
                    result
                        .headers
                        .iter()
                        .cloned()
                        .zip(row)
                        .collect::<Map<String, Value>>(),
                )
            })
            .collect(),
    };
    QueryResponse {
        total_pages: paging.total_pages(result.total_rows),
        total_rows: result.total_rows,
        page_number: paging.page_number,
        page_size: paging.page_size,
        headers: result.headers,
        data_array,
        sql,
    }
}
