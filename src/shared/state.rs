use crate::config::AppConfig;
use crate::llm::LlmClient;
use crate::shared::utils::DbPool;
use crate::vector::VectorClient;
use redis::Client as RedisClient;
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub conn: DbPool,
    /// Optional cache; WeChat sessions and the access token degrade to
    /// per-request values when absent.
    pub cache: Option<Arc<RedisClient>>,
    pub llm: Arc<LlmClient>,
    pub vector: Arc<VectorClient>,
    /// Outbound client for WeChat platform calls, bounded by the same
    /// request timeout as the other upstream clients.
    pub http: reqwest::Client,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
            cache: self.cache.clone(),
            llm: Arc::clone(&self.llm),
            vector: Arc::clone(&self.vector),
            http: self.http.clone(),
        }
    }
}
