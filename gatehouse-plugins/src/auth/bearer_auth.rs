use super::validator::AuthValidator;
use crate::priority;
use async_trait::async_trait;
use axum::response::Response;
use gatehouse_core::error::GatewayError;
use gatehouse_plugin::plugin::{Next, Plugin, PluginContext};
use http::header;
use std::sync::Arc;
use tracing::debug;

/// Requires a verified bearer token on routes marked `auth_required`.
pub struct BearerAuthPlugin {
    validator: Arc<AuthValidator>,
}

impl BearerAuthPlugin {
    pub fn new(validator: Arc<AuthValidator>) -> Self {
        Self { validator }
    }
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn extract_bearer(ctx: &PluginContext) -> Option<&str> {
    let value = ctx.get_header(header::AUTHORIZATION.as_str())?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[async_trait]
impl Plugin for BearerAuthPlugin {
    fn name(&self) -> &str {
        "bearer-auth"
    }

    fn priority(&self) -> i32 {
        priority::BEARER_AUTH
    }

    async fn handle(&self, ctx: &mut PluginContext, next: Next<'_>) -> Response {
        let required = ctx.route.as_ref().is_some_and(|r| r.auth_required);
        if !required {
            return next.run(ctx).await;
        }

        let Some(token) = extract_bearer(ctx).map(str::to_string) else {
            debug!(path = %ctx.path, "Missing bearer token");
            return ctx.fail(GatewayError::MissingCredentials);
        };

        match self.validator.verify(&token).await {
            Ok(identity) => {
                ctx.identity = Some(identity);
                next.run(ctx).await
            }
            Err(e) => ctx.fail(e),
        }
    }
}
