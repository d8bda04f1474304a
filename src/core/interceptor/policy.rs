use async_trait::async_trait;

use super::{HookCall, HookOutcome, Interceptor};
use crate::core::context::ExecutionContext;
use crate::core::error::CoreError;

/// First global hook: the caller's scope must cover the target with the action's ops.
pub struct AccessPolicyInterceptor;

#[async_trait]
impl Interceptor for AccessPolicyInterceptor {
    fn name(&self) -> &str {
        "access_policy"
    }

    async fn before(&self, ctx: &mut ExecutionContext, call: &mut HookCall) -> HookOutcome {
        if ctx.identity.allows(&call.target, call.action.required_ops()) {
            HookOutcome::Continue
        } else {
            HookOutcome::Veto(CoreError::access_denied())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::auth::{Identity, IdentityKind};
    use crate::core::interceptor::Action;
    use crate::core::tenant::TenantTx;
    use rusqlite::Connection;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn denies_actions_outside_the_token_scope() {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let identity = Identity {
            subject_id: "u1".into(),
            subject_code: "a@example.com".into(),
            scope_mode: "r".into(),
            targets: "orders".into(),
            tenant_id: "p1".into(),
            kind: IdentityKind::Token,
        };
        let mut ctx = ExecutionContext::new(identity, None, TenantTx::begin(db).await.unwrap());

        let mut read = HookCall::new("orders", Action::QueryMap, json!({}));
        assert!(matches!(
            AccessPolicyInterceptor.before(&mut ctx, &mut read).await,
            HookOutcome::Continue
        ));

        let mut write = HookCall::new("orders", Action::Create, json!([]));
        assert!(matches!(
            AccessPolicyInterceptor.before(&mut ctx, &mut write).await,
            HookOutcome::Veto(CoreError::Authorization(_))
        ));

        let mut exec = HookCall::new("orders", Action::Exec, json!({}));
        assert!(matches!(
            AccessPolicyInterceptor.before(&mut ctx, &mut exec).await,
            HookOutcome::Veto(CoreError::Authorization(_))
        ));
    }
}
