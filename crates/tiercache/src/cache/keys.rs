//! Cache key construction.
//!
//! ## Key Format
//!
//! Every raw key is namespaced per tier so the two tiers never collide, even
//! when both are backed by the same transport in tests:
//!
//! - local: `{namespace}l1:{raw}`
//! - shared: `{namespace}l2:{raw}`, e.g. `appcache:l2:task:42`

/// Applies the configured namespace to raw keys.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    namespace: String,
}

impl CacheKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[inline]
    pub fn local(&self, raw: &str) -> String {
        format!("{}l1:{raw}", self.namespace)
    }

    #[inline]
    pub fn shared(&self, raw: &str) -> String {
        format!("{}l2:{raw}", self.namespace)
    }

    /// SCAN pattern for a raw glob. The namespace itself is matched
    /// literally.
    pub fn shared_pattern(&self, raw_pattern: &str) -> String {
        format!("{}{raw_pattern}", escape_glob(&self.shared("")))
    }
}

/// Escape Redis glob metacharacters so `s` matches only itself.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Key for a single task.
#[inline]
pub fn task(task_id: i64) -> String {
    format!("task:{task_id}")
}

/// Pattern matching every cached task.
pub fn task_pattern() -> &'static str {
    "task:*"
}
