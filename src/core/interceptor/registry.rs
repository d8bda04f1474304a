use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{HookCall, HookOutcome, Interceptor};
use crate::core::context::ExecutionContext;
use crate::core::error::CoreResult;

struct Entry {
    priority: i32,
    hook: Arc<dyn Interceptor>,
}

fn insert_sorted(entries: &mut Vec<Entry>, priority: i32, hook: Arc<dyn Interceptor>) {
    // after the last entry with priority <= ours, so ties keep registration order
    let at = entries.partition_point(|e| e.priority <= priority);
    entries.insert(at, Entry { priority, hook });
}

/// Global and per-target interceptor chains.
///
/// The before chain is global (ascending priority) then per-target (ascending); the
/// after chain is exactly the reverse.
#[derive(Default)]
pub struct InterceptorRegistry {
    global: Vec<Entry>,
    per_target: HashMap<String, Vec<Entry>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_global(&mut self, priority: i32, hook: Arc<dyn Interceptor>) {
        debug!("Registering global interceptor '{}' at {}", hook.name(), priority);
        insert_sorted(&mut self.global, priority, hook);
    }

    pub fn register_target(&mut self, target: &str, priority: i32, hook: Arc<dyn Interceptor>) {
        debug!(
            "Registering interceptor '{}' for '{}' at {}",
            hook.name(),
            target,
            priority
        );
        insert_sorted(
            self.per_target.entry(target.to_string()).or_default(),
            priority,
            hook,
        );
    }

    pub fn chain(&self, target: &str) -> Vec<Arc<dyn Interceptor>> {
        let mut out: Vec<Arc<dyn Interceptor>> = self.global.iter().map(|e| e.hook.clone()).collect();
        if let Some(entries) = self.per_target.get(target) {
            out.extend(entries.iter().map(|e| e.hook.clone()));
        }
        out
    }

    /// Runs the before chain. The first veto rolls the transaction back and is returned.
    pub async fn run_before(&self, ctx: &mut ExecutionContext, call: &mut HookCall) -> CoreResult<()> {
        for hook in self.chain(&call.target) {
            match hook.before(ctx, call).await {
                HookOutcome::Continue => {}
                HookOutcome::Veto(err) => {
                    debug!("Interceptor '{}' vetoed {} on '{}': {}", hook.name(), call.action.as_str(), call.target, err);
                    ctx.rollback();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub async fn run_after(&self, ctx: &mut ExecutionContext, call: &HookCall) -> CoreResult<()> {
        for hook in self.chain(&call.target).into_iter().rev() {
            if let Err(err) = hook.after(ctx, call).await {
                debug!("Interceptor '{}' failed after {} on '{}': {}", hook.name(), call.action.as_str(), call.target, err);
                ctx.rollback();
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.per_target.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorRegistry")
            .field("global", &self.global.iter().map(|e| e.hook.name()).collect::<Vec<_>>())
            .field("targets", &self.per_target.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Turns a hook error into a veto.
pub(crate) fn veto_on(result: CoreResult<()>) -> HookOutcome {
    match result {
        Ok(()) => HookOutcome::Continue,
        Err(err) => HookOutcome::Veto(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::auth::Identity;
    use crate::core::error::CoreError;
    use crate::core::interceptor::Action;
    use crate::core::tenant::TenantTx;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use serde_json::json;
    use tokio::sync::Mutex;

    struct Recorder {
        name: String,
        log: Arc<std::sync::Mutex<Vec<String>>>,
        veto: bool,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn before(&self, _ctx: &mut ExecutionContext, _call: &mut HookCall) -> HookOutcome {
            self.log.lock().unwrap().push(format!("before:{}", self.name));
            if self.veto {
                HookOutcome::Veto(CoreError::Validation(format!("{} says no", self.name)))
            } else {
                HookOutcome::Continue
            }
        }

        async fn after(&self, _ctx: &mut ExecutionContext, _call: &HookCall) -> CoreResult<()> {
            self.log.lock().unwrap().push(format!("after:{}", self.name));
            Ok(())
        }
    }

    fn recorder(name: &str, log: &Arc<std::sync::Mutex<Vec<String>>>, veto: bool) -> Arc<dyn Interceptor> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: log.clone(),
            veto,
        })
    }

    async fn context() -> ExecutionContext {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let tx = TenantTx::begin(db).await.unwrap();
        ExecutionContext::new(Identity::system("p1"), None, tx)
    }

    #[tokio::test]
    async fn before_and_after_chains_are_mirrored() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = InterceptorRegistry::new();
        registry.register_target("orders", 5, recorder("t5", &log, false));
        registry.register_global(10, recorder("g10", &log, false));
        registry.register_global(1, recorder("g1", &log, false));
        registry.register_target("orders", 1, recorder("t1", &log, false));
        registry.register_global(10, recorder("g10b", &log, false));
        registry.register_target("invoices", 0, recorder("other", &log, false));

        let mut ctx = context().await;
        let mut call = HookCall::new("orders", Action::Create, json!([]));
        registry.run_before(&mut ctx, &mut call).await.unwrap();
        registry.run_after(&mut ctx, &call).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before:g1", "before:g10", "before:g10b", "before:t1", "before:t5",
                "after:t5", "after:t1", "after:g10b", "after:g10", "after:g1",
            ]
        );
    }

    #[tokio::test]
    async fn veto_short_circuits_and_rolls_back() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = InterceptorRegistry::new();
        registry.register_global(0, recorder("first", &log, false));
        registry.register_global(1, recorder("blocker", &log, true));
        registry.register_global(2, recorder("never", &log, false));

        let mut ctx = context().await;
        let mut call = HookCall::new("orders", Action::Delete, json!(["a"]));
        let err = registry.run_before(&mut ctx, &mut call).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(*log.lock().unwrap(), vec!["before:first", "before:blocker"]);
        assert!(!ctx.tx().is_open());
    }
}
