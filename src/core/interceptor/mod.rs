pub mod criteria;
mod local;
mod policy;
mod registry;
mod remote;
mod system;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::core::catalog::DefinitionCatalog;
use crate::core::context::ExecutionContext;
use crate::core::error::{CoreError, CoreResult};
use crate::core::outbound::WebhookClient;
use crate::core::store::ADMIN_TENANT;
use crate::core::store::types::{DeliveryMode, InterceptorDefinition, Phase};

pub use local::LocalScriptInterceptor;
pub use policy::AccessPolicyInterceptor;
pub use registry::InterceptorRegistry;
pub use remote::RemoteWebhookInterceptor;
pub use system::{SystemTable, SystemTableInterceptor};

/// Registration priorities of the built-in global interceptors.
pub const POLICY_PRIORITY: i32 = 0;
pub const LOCAL_SCRIPT_PRIORITY: i32 = 20;
pub const REMOTE_WEBHOOK_PRIORITY: i32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Load,
    Update,
    Delete,
    QueryMap,
    QueryArray,
    Exec,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Load => "load",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::QueryMap => "query_map",
            Action::QueryArray => "query_array",
            Action::Exec => "exec",
        }
    }

    /// Permission characters a caller's mode must contain.
    pub fn required_ops(self) -> &'static str {
        match self {
            Action::Load | Action::QueryMap | Action::QueryArray => "r",
            Action::Create | Action::Update | Action::Delete => "w",
            Action::Exec => "x",
        }
    }

    pub fn writes(self) -> bool {
        matches!(
            self,
            Action::Create | Action::Update | Action::Delete | Action::Exec
        )
    }
}

/// One data operation as the hooks see it.
#[derive(Debug, Clone)]
pub struct HookCall {
    pub target: String,
    pub action: Action,
    /// Candidate data: rows for create/update, ids for delete/load, parameters for queries.
    pub data: Value,
    pub query_params: Vec<String>,
    pub params: Vec<Vec<Value>>,
    /// Operation result, filled in before the after-chain runs. Payloads carry `data`.
    pub result: Value,
}

impl HookCall {
    pub fn new(target: &str, action: Action, data: Value) -> Self {
        Self {
            target: target.to_string(),
            action,
            data,
            query_params: Vec::new(),
            params: Vec::new(),
            result: Value::Null,
        }
    }
}

#[derive(Debug)]
pub enum HookOutcome {
    Continue,
    Veto(CoreError),
}

/// A before/after hook around data operations.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn before(&self, _ctx: &mut ExecutionContext, _call: &mut HookCall) -> HookOutcome {
        HookOutcome::Continue
    }

    async fn after(&self, _ctx: &mut ExecutionContext, _call: &HookCall) -> CoreResult<()> {
        Ok(())
    }
}

/// Shape sent to remote webhooks and handed to local scripts as their only parameter.
pub fn hook_payload(target: &str, phase: Phase, action: Action, data: &Value) -> Value {
    serde_json::json!({
        "target": target,
        "action": format!("{}_{}", phase.as_str(), action.as_str()),
        "data": data,
    })
}

/// Looks up the tenant definition for this call and applies its criteria gate.
///
/// `None` when nothing is configured, when the gate filters everything out, or on the
/// administrative tenant, whose system tables only carry the built-in hooks.
pub(crate) async fn applicable(
    catalog: &DefinitionCatalog,
    tenant_id: &str,
    call: &HookCall,
    mode: DeliveryMode,
    phase: Phase,
) -> CoreResult<Option<(InterceptorDefinition, Value)>> {
    if tenant_id == ADMIN_TENANT {
        return Ok(None);
    }
    let Some(def) = catalog
        .interceptor(mode, tenant_id, &call.target, phase, call.action.as_str())
        .await?
    else {
        return Ok(None);
    };
    match criteria::gate(&def.criteria, &call.data)? {
        Some(selected) => Ok(Some((def, selected))),
        None => {
            debug!(
                "Criteria skipped {} interceptor for {}:{}",
                phase.as_str(),
                call.target,
                call.action.as_str()
            );
            Ok(None)
        }
    }
}

/// The registry every server builds: access policy first, then tenant scripts and
/// webhooks, plus the system-table hooks of the administrative tenant.
pub fn standard_registry(catalog: &DefinitionCatalog, client: WebhookClient) -> InterceptorRegistry {
    let mut registry = InterceptorRegistry::new();
    registry.register_global(POLICY_PRIORITY, Arc::new(AccessPolicyInterceptor));
    registry.register_global(
        LOCAL_SCRIPT_PRIORITY,
        Arc::new(LocalScriptInterceptor::new(catalog.clone())),
    );
    registry.register_global(
        REMOTE_WEBHOOK_PRIORITY,
        Arc::new(RemoteWebhookInterceptor::new(catalog.clone(), client)),
    );
    for table in SystemTable::ALL {
        registry.register_target(table.table(), 0, Arc::new(SystemTableInterceptor::new(table)));
    }
    registry
}
