use crate::config::Config;
use crate::middleware::auth::CredentialValidator;
use crate::services::ChatFabric;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub fabric: ChatFabric,
    pub validator: CredentialValidator,
}
