/// Whether an identity holding `targets` and `mode` may perform `required_ops` on `resource`.
///
/// `targets` is `*` or a comma-separated list of names. Only the last dot-qualified
/// segment of `resource` is compared, with backticks stripped. Every character of
/// `required_ops` must occur in `mode`.
pub fn check_access_permission(targets: &str, resource: &str, mode: &str, required_ops: &str) -> bool {
    target_matches(targets, resource) && mode_covers(mode, required_ops)
}

fn target_matches(targets: &str, resource: &str) -> bool {
    let targets = targets.trim();
    if targets == "*" {
        return true;
    }
    let name = resource_name(resource);
    if name.is_empty() {
        return false;
    }
    targets
        .split(',')
        .map(|t| resource_name(t.trim()))
        .any(|t| t == name)
}

fn mode_covers(mode: &str, required_ops: &str) -> bool {
    required_ops.chars().all(|op| mode.contains(op))
}

fn resource_name(resource: &str) -> String {
    let stripped = resource.replace('`', "");
    stripped
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}
