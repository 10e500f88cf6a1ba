use std::time::Duration;

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ai: AiConfig,
    pub embedding: EmbeddingConfig,
    pub wechat: WeChatConfig,
    pub system_mode: String,
    pub http_timeout: Duration,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct AiConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
}

#[derive(Clone)]
pub struct EmbeddingConfig {
    pub api_url: String,
}

#[derive(Clone)]
pub struct WeChatConfig {
    pub app_id: String,
    /// Optional; access-token acquisition degrades to "no token" without it.
    pub app_secret: Option<String>,
    pub token: String,
    pub api_base_url: String,
}

impl AppConfig {
    /// Read the whole configuration surface from the environment once.
    /// Handed out by reference through AppState afterwards; nothing else in
    /// the crate touches `std::env` at request time.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let server = ServerConfig {
            host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
        };
        let ai = AiConfig {
            api_url: std::env::var("AI_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("AI_API_KEY").unwrap_or_default(),
            model: std::env::var("AI_MODEL").unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
            system_prompt: std::env::var("SYSTEM_PROMPT").unwrap_or_default(),
        };
        let embedding = EmbeddingConfig {
            api_url: std::env::var("EMBEDDING_API_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9000".to_string()),
        };
        let wechat = WeChatConfig {
            app_id: std::env::var("WECHAT_APPID").unwrap_or_default(),
            app_secret: std::env::var("WECHAT_APPSECRET").ok().filter(|s| !s.is_empty()),
            token: std::env::var("WECHAT_TOKEN").unwrap_or_else(|_| "default_token".to_string()),
            api_base_url: std::env::var("WECHAT_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.weixin.qq.com".to_string()),
        };
        let http_timeout = Duration::from_secs(
            std::env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        );
        Ok(AppConfig {
            server,
            ai,
            embedding,
            wechat,
            system_mode: std::env::var("SYSTEM_MODE").unwrap_or_else(|_| "general".to_string()),
            http_timeout,
        })
    }
}
