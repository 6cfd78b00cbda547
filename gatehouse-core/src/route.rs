use crate::error::GatewayError;
use serde::{Deserialize, Serialize};

/// A RouteRule maps a path pattern to a backend service.
///
/// Patterns are either exact (`/api/auth/login`) or prefix-wildcard
/// (`/api/auth/*`). A wildcard pattern matches its literal prefix and
/// everything below it, including the bare prefix without the trailing
/// slash (`/api/auth`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteRule {
    /// Path pattern.
    pub path: String,

    /// Name of the service in the registry.
    pub service: String,

    /// Whether a verified bearer token is required.
    #[serde(default)]
    pub auth_required: bool,
}

/// Compiled form of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePattern {
    Exact(String),
    Prefix(String),
}

impl RoutePattern {
    /// Parse a pattern. `*` is only allowed as the final character.
    pub fn parse(pattern: &str) -> Result<Self, GatewayError> {
        if !pattern.starts_with('/') {
            return Err(GatewayError::ConfigValidation(format!(
                "route pattern {pattern:?} must start with '/'"
            )));
        }
        match pattern.find('*') {
            None => Ok(RoutePattern::Exact(pattern.to_string())),
            Some(pos) if pos == pattern.len() - 1 => {
                Ok(RoutePattern::Prefix(pattern[..pos].to_string()))
            }
            Some(_) => Err(GatewayError::ConfigValidation(format!(
                "route pattern {pattern:?} may only use '*' as its last character"
            ))),
        }
    }

    /// The literal part of the pattern.
    pub fn literal(&self) -> &str {
        match self {
            RoutePattern::Exact(s) | RoutePattern::Prefix(s) => s,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, RoutePattern::Exact(_))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            RoutePattern::Exact(p) => p == path,
            RoutePattern::Prefix(prefix) => {
                if path.starts_with(prefix.as_str()) {
                    return true;
                }
                // `/api/auth/*` also covers `/api/auth`
                let bare = prefix.trim_end_matches('/');
                !bare.is_empty() && bare != prefix && path == bare
            }
        }
    }
}

impl RouteRule {
    pub fn new(path: impl Into<String>, service: impl Into<String>, auth_required: bool) -> Self {
        Self {
            path: path.into(),
            service: service.into(),
            auth_required,
        }
    }

    pub fn pattern(&self) -> Result<RoutePattern, GatewayError> {
        RoutePattern::parse(&self.path)
    }
}
