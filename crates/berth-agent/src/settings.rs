use tokio::sync::Mutex;

/// Operator-configured endpoint of the external "default" Redis server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub enabled: bool,
}

impl Default for DefaultRedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            enabled: false,
        }
    }
}

#[async_trait::async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn default_redis_settings(&self) -> DefaultRedisSettings;
}

/// In-process provider; the API layer swaps the value when the operator
/// edits settings.
#[derive(Debug, Default)]
pub struct StaticSettings {
    current: Mutex<DefaultRedisSettings>,
}

impl StaticSettings {
    pub fn new(settings: DefaultRedisSettings) -> Self {
        Self {
            current: Mutex::new(settings),
        }
    }

    pub async fn set(&self, settings: DefaultRedisSettings) {
        *self.current.lock().await = settings;
    }
}

#[async_trait::async_trait]
impl SettingsProvider for StaticSettings {
    async fn default_redis_settings(&self) -> DefaultRedisSettings {
        self.current.lock().await.clone()
    }
}
