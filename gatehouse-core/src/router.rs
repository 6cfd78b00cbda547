use crate::error::GatewayError;
use crate::route::{RoutePattern, RouteRule};
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Thread-safe router over an immutable, specificity-ordered route table.
///
/// Lookups load the current table with a single atomic read; `reload`
/// compiles a whole new table and swaps it in, so readers see either the
/// old table or the new one, never a mix.
pub struct Router {
    inner: ArcSwap<RouteTable>,
}

/// Compiled route table, sorted most-specific first.
struct RouteTable {
    entries: Vec<CompiledRoute>,
}

struct CompiledRoute {
    pattern: RoutePattern,
    rule: Arc<RouteRule>,
}

impl CompiledRoute {
    /// Ranking key: longer literal first, exact before wildcard on the
    /// same literal.
    fn rank(&self) -> (usize, bool) {
        (self.pattern.literal().len(), self.pattern.is_exact())
    }

    /// Specificity of this entry for `path`, or `None` if it does not match.
    ///
    /// A wildcard that only matches through its bare form (`/api/auth/*`
    /// against `/api/auth`) counts the bare literal, so an exact rule on
    /// that path still outranks it.
    fn score(&self, path: &str) -> Option<(usize, bool)> {
        if !self.pattern.matches(path) {
            return None;
        }
        match &self.pattern {
            RoutePattern::Prefix(p) if !path.starts_with(p.as_str()) => Some((path.len(), false)),
            _ => Some(self.rank()),
        }
    }
}

impl RouteTable {
    fn compile(rules: Vec<RouteRule>) -> Result<Self, GatewayError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(rules.len());

        for rule in rules {
            if !seen.insert(rule.path.clone()) {
                return Err(GatewayError::ConfigValidation(format!(
                    "duplicate route pattern {:?}",
                    rule.path
                )));
            }
            let pattern = rule.pattern()?;
            entries.push(CompiledRoute {
                pattern,
                rule: Arc::new(rule),
            });
        }

        entries.sort_by(|a, b| b.rank().cmp(&a.rank()));
        Ok(Self { entries })
    }
}

impl Router {
    /// Compile a router from route rules.
    pub fn build(rules: Vec<RouteRule>) -> Result<Self, GatewayError> {
        let table = RouteTable::compile(rules)?;
        info!(count = table.entries.len(), "Router built");
        Ok(Self {
            inner: ArcSwap::new(Arc::new(table)),
        })
    }

    /// Match a request path. Returns the most specific rule.
    pub fn match_path(&self, path: &str) -> Option<Arc<RouteRule>> {
        let table = self.inner.load();
        let mut best: Option<(&CompiledRoute, (usize, bool))> = None;
        for entry in &table.entries {
            let Some(score) = entry.score(path) else {
                continue;
            };
            // entries are in rank order, so ties keep the earlier one
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((entry, score));
            }
        }
        let found = best.map(|(entry, _)| Arc::clone(&entry.rule));

        match &found {
            Some(rule) => debug!(path = %path, pattern = %rule.path, service = %rule.service, "Route matched"),
            None => debug!(path = %path, "No route matched"),
        }
        found
    }

    /// Replace the whole route table atomically.
    ///
    /// On error the current table stays in place.
    pub fn reload(&self, rules: Vec<RouteRule>) -> Result<(), GatewayError> {
        let table = RouteTable::compile(rules)?;
        let count = table.entries.len();
        self.inner.store(Arc::new(table));
        info!(count, "Route table reloaded");
        Ok(())
    }

    /// All rules in match precedence order.
    pub fn rules(&self) -> Vec<RouteRule> {
        self.inner
            .load()
            .entries
            .iter()
            .map(|entry| (*entry.rule).clone())
            .collect()
    }

    /// Total number of routes.
    pub fn route_count(&self) -> usize {
        self.inner.load().entries.len()
    }
}
