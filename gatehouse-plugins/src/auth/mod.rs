pub mod bearer_auth;
pub mod validator;

pub use bearer_auth::BearerAuthPlugin;
pub use validator::AuthValidator;
