use async_trait::async_trait;
use serde_json::Value;

use super::registry::veto_on;
use super::{Action, HookCall, HookOutcome, Interceptor, applicable, hook_payload};
use crate::core::catalog::DefinitionCatalog;
use crate::core::context::ExecutionContext;
use crate::core::error::{CoreError, CoreResult};
use crate::core::executor;
use crate::core::store::types::{Delivery, DeliveryMode, Phase};

/// Runs a tenant's stored query as an in-transaction policy check.
pub struct LocalScriptInterceptor {
    catalog: DefinitionCatalog,
}

impl LocalScriptInterceptor {
    pub fn new(catalog: DefinitionCatalog) -> Self {
        Self { catalog }
    }

    async fn run(&self, ctx: &mut ExecutionContext, call: &HookCall, phase: Phase) -> CoreResult<()> {
        let tenant_id = ctx.tenant_id.clone();
        let Some((def, data)) = applicable(&self.catalog, &tenant_id, call, DeliveryMode::Local, phase).await? else {
            return Ok(());
        };
        let Delivery::Local { callback } = &def.delivery else {
            return Ok(());
        };
        let query = self
            .catalog
            .query(&tenant_id, callback)
            .await?
            .ok_or_else(|| CoreError::Validation(format!("Interceptor query '{}' not found", callback)))?;

        let vars = ctx.vars();
        let outcome = if call.action == Action::Exec {
            let rows = if call.params.is_empty() {
                vec![Vec::new()]
            } else {
                call.params.clone()
            };
            executor::execute_batch(ctx.tx(), &query.script, &call.query_params, &rows, &vars)
        } else {
            let payload = hook_payload(&call.target, phase, call.action, &data);
            let rows = vec![vec![Value::String(payload.to_string())]];
            executor::execute_batch(ctx.tx(), &query.script, &[], &rows, &vars)
        };
        match outcome {
            Ok(_) => Ok(()),
            Err(CoreError::Database(e)) => Err(CoreError::Validation(format!(
                "Interceptor '{}' rejected {}: {}",
                callback,
                call.action.as_str(),
                e
            ))),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Interceptor for LocalScriptInterceptor {
    fn name(&self) -> &str {
        "local_script"
    }

    async fn before(&self, ctx: &mut ExecutionContext, call: &mut HookCall) -> HookOutcome {
        veto_on(self.run(ctx, call, Phase::Before).await)
    }

    async fn after(&self, ctx: &mut ExecutionContext, call: &HookCall) -> CoreResult<()> {
        self.run(ctx, call, Phase::After).await
    }
}
