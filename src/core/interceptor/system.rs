use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};

use super::registry::veto_on;
use super::{Action, HookCall, HookOutcome, Interceptor};
use crate::core::cache::keys;
use crate::core::context::{Deferred, ExecutionContext};
use crate::core::error::CoreResult;
use crate::core::executor::{from_sql, quote_ident};
use crate::core::jobs::normalize_cron;
use crate::core::store::types::{DeliveryMode, Phase};

/// System tables whose rows back runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemTable {
    Token,
    User,
    UserProject,
    Query,
    LocalInterceptor,
    RemoteInterceptor,
    Job,
}

impl SystemTable {
    pub const ALL: [SystemTable; 7] = [
        SystemTable::Token,
        SystemTable::User,
        SystemTable::UserProject,
        SystemTable::Query,
        SystemTable::LocalInterceptor,
        SystemTable::RemoteInterceptor,
        SystemTable::Job,
    ];

    pub fn table(self) -> &'static str {
        match self {
            SystemTable::Token => "token",
            SystemTable::User => "user",
            SystemTable::UserProject => "user_project",
            SystemTable::Query => "query",
            SystemTable::LocalInterceptor => "local_interceptor",
            SystemTable::RemoteInterceptor => "remote_interceptor",
            SystemTable::Job => "job",
        }
    }
}

/// Keeps caches and the scheduler in step with administrative writes to a system table.
///
/// Rows as they were are read before the write, rows as they are after it; every
/// resulting effect waits for the commit.
pub struct SystemTableInterceptor {
    table: SystemTable,
}

impl SystemTableInterceptor {
    pub fn new(table: SystemTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> SystemTable {
        self.table
    }

    fn on_before(&self, ctx: &mut ExecutionContext, call: &mut HookCall) -> CoreResult<()> {
        if self.table == SystemTable::Job && matches!(call.action, Action::Create | Action::Update) {
            normalize_job_rows(&mut call.data);
        }
        if !matches!(call.action, Action::Update | Action::Delete) {
            return Ok(());
        }
        let effects = self.effects(ctx.tx().conn()?, &row_ids(&call.data))?;
        for effect in effects {
            ctx.defer(effect);
        }
        Ok(())
    }

    fn on_after(&self, ctx: &mut ExecutionContext, call: &HookCall) -> CoreResult<()> {
        let ids = row_ids(&call.data);
        match call.action {
            Action::Create | Action::Update => {
                let effects = self.effects(ctx.tx().conn()?, &ids)?;
                for effect in effects {
                    ctx.defer(effect);
                }
            }
            Action::Delete if self.table == SystemTable::Job => {
                for id in ids {
                    ctx.defer(Deferred::SyncJob(id));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn effects(&self, conn: &Connection, ids: &[String]) -> CoreResult<Vec<Deferred>> {
        let mut out = Vec::new();
        if self.table == SystemTable::Job {
            out.extend(ids.iter().cloned().map(Deferred::SyncJob));
            return Ok(out);
        }
        for row in read_rows(conn, self.table.table(), ids)? {
            for key in self.keys_for(conn, &row)? {
                out.push(Deferred::Invalidate(key));
            }
        }
        Ok(out)
    }

    fn keys_for(&self, conn: &Connection, row: &Map<String, Value>) -> CoreResult<Vec<String>> {
        let field = |name: &str| row.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
        let keys = match self.table {
            SystemTable::Token => vec![keys::token(&field("project_id"), &field("token"))],
            SystemTable::User => {
                let token_key = field("token_key");
                let mut out = vec![keys::admin_token(&token_key)];
                let mut stmt = conn.prepare("SELECT project_id FROM user_project WHERE user_email = ?1")?;
                let projects = stmt.query_map(params![field("email")], |r| r.get::<_, String>(0))?;
                for project in projects {
                    out.push(keys::token(&project?, &token_key));
                }
                out
            }
            SystemTable::UserProject => {
                let token_key: Option<String> = conn
                    .query_row(
                        "SELECT token_key FROM user WHERE email = ?1",
                        params![field("user_email")],
                        |r| r.get(0),
                    )
                    .optional()?;
                token_key
                    .map(|t| vec![keys::token(&field("project_id"), &t)])
                    .unwrap_or_default()
            }
            SystemTable::Query => vec![keys::query(&field("project_id"), &field("name"))],
            SystemTable::LocalInterceptor | SystemTable::RemoteInterceptor => {
                let mode = if self.table == SystemTable::LocalInterceptor {
                    DeliveryMode::Local
                } else {
                    DeliveryMode::Remote
                };
                match Phase::parse(&field("type")) {
                    Some(phase) => vec![keys::interceptor(
                        mode,
                        &field("project_id"),
                        &field("target"),
                        phase,
                        &field("action_type"),
                    )],
                    None => Vec::new(),
                }
            }
            SystemTable::Job => Vec::new(),
        };
        Ok(keys)
    }
}

#[async_trait]
impl Interceptor for SystemTableInterceptor {
    fn name(&self) -> &str {
        self.table.table()
    }

    async fn before(&self, ctx: &mut ExecutionContext, call: &mut HookCall) -> HookOutcome {
        if !ctx.is_admin_tenant() {
            return HookOutcome::Continue;
        }
        veto_on(self.on_before(ctx, call))
    }

    async fn after(&self, ctx: &mut ExecutionContext, call: &HookCall) -> CoreResult<()> {
        if !ctx.is_admin_tenant() {
            return Ok(());
        }
        self.on_after(ctx, call)
    }
}

/// Ids named by a call: row objects carry an `id` field, bare strings are ids.
pub(crate) fn row_ids(data: &Value) -> Vec<String> {
    let one = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Object(m) => m.get("id").and_then(Value::as_str).map(String::from),
        _ => None,
    };
    match data {
        Value::Array(items) => items.iter().filter_map(one).collect(),
        other => one(other).into_iter().collect(),
    }
}

fn normalize_job_rows(data: &mut Value) {
    let fix = |row: &mut Value| {
        if let Some(Value::String(cron)) = row.get_mut("cron") {
            *cron = normalize_cron(cron);
        }
    };
    match data {
        Value::Array(rows) => rows.iter_mut().for_each(fix),
        row => fix(row),
    }
}

fn read_rows(conn: &Connection, table: &str, ids: &[String]) -> CoreResult<Vec<Map<String, Value>>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!("SELECT * FROM {} WHERE id = ?1", quote_ident(table)?))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut out = Vec::new();
    for id in ids {
        let mut rows = stmt.query(params![id])?;
        while let Some(row) = rows.next()? {
            let mut map = Map::new();
            for (i, name) in names.iter().enumerate() {
                map.insert(name.clone(), from_sql(row.get_ref(i)?));
            }
            out.push(map);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::auth::Identity;
    use crate::core::store::{ADMIN_TENANT, test_store};
    use crate::core::tenant::TenantTx;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    async fn admin_ctx(store: &crate::core::store::SystemStore) -> ExecutionContext {
        let conn = crate::core::store::open_connection(store.path()).unwrap();
        let tx = TenantTx::begin(Arc::new(Mutex::new(conn))).await.unwrap();
        ExecutionContext::new(Identity::system(ADMIN_TENANT), None, tx)
    }

    #[tokio::test]
    async fn token_delete_invalidates_the_exact_pair() {
        let (store, _dir) = test_store().await;
        let token = store.create_token("p1", "t1", "orders", "rw").await.unwrap();
        let hook = SystemTableInterceptor::new(SystemTable::Token);

        let mut ctx = admin_ctx(&store).await;
        let mut call = HookCall::new("token", Action::Delete, json!([token.id]));
        assert!(matches!(hook.before(&mut ctx, &mut call).await, HookOutcome::Continue));
        let deferred = ctx.commit().unwrap();
        assert_eq!(deferred, vec![Deferred::Invalidate(keys::token("p1", "t1"))]);
    }

    #[tokio::test]
    async fn member_changes_invalidate_member_credentials() {
        let (store, _dir) = test_store().await;
        let user = store.create_user("a@example.com").await.unwrap();
        store.add_member("a@example.com", "p1").await.unwrap();
        let hook = SystemTableInterceptor::new(SystemTable::User);

        let mut ctx = admin_ctx(&store).await;
        let mut call = HookCall::new("user", Action::Update, json!([{"id": user.id, "email": "a@example.com"}]));
        assert!(matches!(hook.before(&mut ctx, &mut call).await, HookOutcome::Continue));
        let deferred = ctx.commit().unwrap();
        assert!(deferred.contains(&Deferred::Invalidate(keys::admin_token(&user.token_key))));
        assert!(deferred.contains(&Deferred::Invalidate(keys::token("p1", &user.token_key))));
    }

    #[tokio::test]
    async fn job_writes_normalize_cron_and_resync() {
        let (store, _dir) = test_store().await;
        let hook = SystemTableInterceptor::new(SystemTable::Job);
        let mut ctx = admin_ctx(&store).await;
        let mut call = HookCall::new("job", Action::Create, json!([{"id": "j1", "cron": "*/5 * * * *"}]));
        assert!(matches!(hook.before(&mut ctx, &mut call).await, HookOutcome::Continue));
        assert_eq!(call.data[0]["cron"], "0 */5 * * * *");
        hook.after(&mut ctx, &call).await.unwrap();
        assert_eq!(ctx.commit().unwrap(), vec![Deferred::SyncJob("j1".into())]);
    }

    #[tokio::test]
    async fn tenant_tables_with_system_names_are_ignored() {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let mut ctx = ExecutionContext::new(Identity::system("p1"), None, TenantTx::begin(db).await.unwrap());
        let hook = SystemTableInterceptor::new(SystemTable::Job);
        let mut call = HookCall::new("job", Action::Create, json!([{"id": "j1", "cron": "* * * * *"}]));
        assert!(matches!(hook.before(&mut ctx, &mut call).await, HookOutcome::Continue));
        assert_eq!(call.data[0]["cron"], "* * * * *");
    }

    #[test]
    fn ids_from_rows_and_strings() {
        assert_eq!(row_ids(&json!([{"id": "a"}, "b", 3])), vec!["a", "b"]);
        assert_eq!(row_ids(&json!({"id": "c"})), vec!["c"]);
    }
}
