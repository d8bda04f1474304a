use crate::core::store::types::{DeliveryMode, Phase};

pub const TOKEN_PREFIX: &str = "token:";
pub const ADMIN_TOKEN_PREFIX: &str = "dtoken:";
pub const QUERY_PREFIX: &str = "query:";

pub fn token(tenant_id: &str, token: &str) -> String {
    format!("token:{}:{}", tenant_id, token)
}

pub fn admin_token(token: &str) -> String {
    format!("dtoken:{}", token)
}

pub fn interceptor(
    mode: DeliveryMode,
    tenant_id: &str,
    target: &str,
    phase: Phase,
    action: &str,
) -> String {
    let prefix = match mode {
        DeliveryMode::Local => "li",
        DeliveryMode::Remote => "ri",
    };
    format!(
        "{}:{}:{}:{}:{}",
        prefix,
        tenant_id,
        target,
        phase.as_str(),
        action
    )
}

pub fn query(tenant_id: &str, name: &str) -> String {
    format!("query:{}:{}", tenant_id, name)
}

pub fn stats(tenant_id: &str) -> String {
    format!("stats:{}", tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layouts() {
        assert_eq!(token("p1", "t1"), "token:p1:t1");
        assert_eq!(admin_token("abc"), "dtoken:abc");
        assert_eq!(
            interceptor(DeliveryMode::Remote, "p1", "orders", Phase::Before, "create"),
            "ri:p1:orders:before:create"
        );
        assert_eq!(
            interceptor(DeliveryMode::Local, "p1", "orders", Phase::After, "update"),
            "li:p1:orders:after:update"
        );
        assert_eq!(query("p1", "q"), "query:p1:q");
        assert_eq!(stats("p1"), "stats:p1");
    }
}
