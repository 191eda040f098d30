use std::sync::Arc;

use crate::config::AppConfig;
use crate::debrid::DebridClient;
use crate::poller::FeedPoller;
use crate::store::{AuthStore, SeenStore, SettingsStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthStore>,
    pub settings: Arc<SettingsStore>,
    pub seen: Arc<SeenStore>,
    pub debrid: Arc<DebridClient>,
    pub poller: Arc<FeedPoller>,
    pub session: SessionAuth,
}

#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub secret: String,
    pub max_age_seconds: i64,
}

impl SessionAuth {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            secret: config.session_secret.clone(),
            max_age_seconds: config.session_max_age_seconds,
        }
    }
}
