use dotenvy::dotenv;
use kbserver::channels;
use kbserver::config::AppConfig;
use kbserver::shared::state::AppState;
use kbserver::shared::utils::{create_conn, run_migrations};
use kbserver::{ai, auth, kb};
use log::{info, warn};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "init-user" => return run_init_user(&args[2..]),
            "--help" | "-h" => {
                println!("Usage: kbserver [init-user [--name NAME] [--email EMAIL] [--password PASSWORD]]");
                return Ok(());
            }
            other => {
                eprintln!("Unknown command: {}", other);
                eprintln!("Run 'kbserver --help' for usage information");
                anyhow::bail!("unknown command: {}", other);
            }
        }
    }

    let config = AppConfig::from_env()?;
    let pool = create_conn()?;
    run_migrations(&pool).map_err(|e| anyhow::anyhow!("migrations failed: {}", e))?;

    let cache_url = std::env::var("CACHE_URL")
        .or_else(|_| std::env::var("REDIS_URL"))
        .unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let cache = match redis::Client::open(cache_url.as_str()) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!("failed to connect to Redis, running without cache: {}", e);
            None
        }
    };

    let llm = Arc::new(kbserver::llm::LlmClient::new(
        &config.ai,
        config.http_timeout,
    )?);
    let vector = Arc::new(kbserver::vector::VectorClient::new(
        &config.embedding.api_url,
        config.http_timeout,
    )?);

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()?;

    let state = Arc::new(AppState {
        config: config.clone(),
        conn: pool,
        cache,
        llm,
        vector,
        http,
    });

    let app = axum::Router::new()
        .merge(ai::configure())
        .merge(kb::configure())
        .merge(auth::configure())
        .merge(channels::wechat::configure())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn run_init_user(args: &[String]) -> anyhow::Result<()> {
    let option = |flag: &str, default: &str| -> String {
        args.iter()
            .position(|a| a == flag)
            .and_then(|idx| args.get(idx + 1))
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };
    let name = option("--name", "admin");
    let email = option("--email", "admin@example.com");
    let password = option("--password", "password");

    let pool = create_conn()?;
    run_migrations(&pool).map_err(|e| anyhow::anyhow!("migrations failed: {}", e))?;
    auth::init_user(&pool, &name, &email, &password)?;
    println!("User created: {} <{}>", name, email);
    println!("Change the password after first login.");
    Ok(())
}
