use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{HookCall, HookOutcome, Interceptor, applicable, hook_payload};
use crate::core::catalog::DefinitionCatalog;
use crate::core::context::{Deferred, ExecutionContext};
use crate::core::error::{CoreError, CoreResult};
use crate::core::executor;
use crate::core::outbound::WebhookClient;
use crate::core::store::types::{Delivery, DeliveryMode, NewNotification, Phase};

/// What a before-webhook may answer with when its definition names a callback query.
#[derive(Debug, Default, Deserialize)]
struct CallbackBody {
    #[serde(default)]
    query_params: Vec<String>,
    #[serde(default)]
    params: Vec<Vec<Value>>,
}

/// Calls tenant webhooks synchronously before an operation; queues a durable
/// notification after it.
pub struct RemoteWebhookInterceptor {
    catalog: DefinitionCatalog,
    client: WebhookClient,
}

impl RemoteWebhookInterceptor {
    pub fn new(catalog: DefinitionCatalog, client: WebhookClient) -> Self {
        Self { catalog, client }
    }

    async fn call_before(&self, ctx: &mut ExecutionContext, call: &HookCall) -> CoreResult<()> {
        let tenant_id = ctx.tenant_id.clone();
        let Some((def, data)) =
            applicable(&self.catalog, &tenant_id, call, DeliveryMode::Remote, Phase::Before).await?
        else {
            return Ok(());
        };
        let Delivery::Remote { method, url, callback } = &def.delivery else {
            return Ok(());
        };

        let payload = hook_payload(&call.target, Phase::Before, call.action, &data);
        let response = self.client.send(method, url, &payload).await?;
        if response.status != 200 {
            warn!("Before-webhook {} {} answered {}", method, url, response.status);
            return Err(CoreError::Transport(format!(
                "Webhook {} returned status {}",
                url, response.status
            )));
        }

        let Some(callback) = callback.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(());
        };
        let body: CallbackBody = if response.body.is_empty() {
            CallbackBody::default()
        } else {
            serde_json::from_slice(&response.body).map_err(|e| {
                CoreError::Validation(format!("Webhook {} returned an unreadable callback body: {}", url, e))
            })?
        };
        let query = self
            .catalog
            .query(&tenant_id, callback)
            .await?
            .ok_or_else(|| CoreError::Validation(format!("Callback query '{}' not found", callback)))?;
        let rows = if body.params.is_empty() {
            vec![Vec::new()]
        } else {
            body.params
        };
        debug!("Running callback '{}' for {} on {}", callback, call.action.as_str(), call.target);
        let vars = ctx.vars();
        executor::execute_batch(ctx.tx(), &query.script, &body.query_params, &rows, &vars)?;
        Ok(())
    }

    async fn queue_after(&self, ctx: &mut ExecutionContext, call: &HookCall) -> CoreResult<()> {
        let tenant_id = ctx.tenant_id.clone();
        let Some((def, data)) =
            applicable(&self.catalog, &tenant_id, call, DeliveryMode::Remote, Phase::After).await?
        else {
            return Ok(());
        };
        let Delivery::Remote { method, url, .. } = def.delivery else {
            return Ok(());
        };
        ctx.defer(Deferred::Notify(NewNotification {
            project_id: tenant_id,
            target: call.target.clone(),
            method,
            url,
            phase: Phase::After,
            action: call.action.as_str().to_string(),
            data: hook_payload(&call.target, Phase::After, call.action, &data),
        }));
        Ok(())
    }
}

#[async_trait]
impl Interceptor for RemoteWebhookInterceptor {
    fn name(&self) -> &str {
        "remote_webhook"
    }

    async fn before(&self, ctx: &mut ExecutionContext, call: &mut HookCall) -> HookOutcome {
        match self.call_before(ctx, call).await {
            Ok(()) => HookOutcome::Continue,
            Err(err) => HookOutcome::Veto(err),
        }
    }

    async fn after(&self, ctx: &mut ExecutionContext, call: &HookCall) -> CoreResult<()> {
        self.queue_after(ctx, call).await
    }
}
