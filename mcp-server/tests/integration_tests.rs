//! Black-box tests against the crate's public API: configuration
//! loading/overrides and the fully wired `App` serving real HTTP traffic.

use broker_server::config::{AuthConfig, Config, DatabaseConfig, LogFormat, LoggingConfig, SchedulerConfigToml, ServerConfig};
use broker_server::setup::{create_store, ensure_database_directory};
use broker_server::initialize_app;
use std::env;
use tempfile::TempDir;

fn config_with_database(database_url: String) -> Config {
    Config {
        database: DatabaseConfig { url: Some(database_url), max_connections: 5, connection_timeout: 30 },
        server: ServerConfig { listen_addr: "127.0.0.1".to_string(), port: 3000, workers: 4 },
        logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Pretty },
        auth: AuthConfig { secret: Some("test-secret".to_string()), enabled: true },
        scheduler: SchedulerConfigToml {
            tick_interval_secs: 1,
            ack_timeout_secs: 30,
            heartbeat_timeout_secs: 300,
            stale_wait_timeout_secs: 60,
        },
    }
}

#[tokio::test]
async fn server_starts_up_against_a_fresh_sqlite_file() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let config = config_with_database(format!("sqlite://{}", db_path.display()));

    let store = create_store(&config).await;
    assert!(store.is_ok(), "Failed to create store: {:?}", store.err());
}

#[test]
fn default_configuration_is_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.server.listen_addr, "127.0.0.1");
    assert_eq!(config.server.port, 3000);
}

#[test]
fn standard_env_vars_override_the_default_config() {
    env::set_var("DATABASE_URL", "sqlite://test_env.db");
    env::set_var("LISTEN_ADDR", "0.0.0.0");
    env::set_var("LOG_LEVEL", "debug");
    env::set_var("AUTH_SECRET", "env-secret");

    let config = Config::default().merge_with_env().unwrap();

    assert_eq!(config.database.url, Some("sqlite://test_env.db".to_string()));
    assert_eq!(config.server.listen_addr, "0.0.0.0");
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.auth.secret, Some("env-secret".to_string()));

    env::remove_var("DATABASE_URL");
    env::remove_var("LISTEN_ADDR");
    env::remove_var("LOG_LEVEL");
    env::remove_var("AUTH_SECRET");
}

#[test]
fn ensure_database_directory_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("test.db");
    let database_url = format!("sqlite://{}", db_path.display());

    assert!(ensure_database_directory(&database_url).is_ok());
    assert!(ensure_database_directory(&database_url).is_ok());
    assert!(db_path.parent().unwrap().exists());
}

#[tokio::test]
async fn initialize_app_serves_a_working_health_endpoint() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("app.db");
    let config = config_with_database(format!("sqlite://{}", db_path.display()));

    let app = initialize_app(&config).await.expect("initialize app");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app.router).await.expect("server exited");
    });

    let response = reqwest::get(format!("http://{addr}/health")).await.expect("GET /health");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn initialize_app_enforces_the_shared_secret_on_rpc() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("app2.db");
    let config = config_with_database(format!("sqlite://{}", db_path.display()));

    let app = initialize_app(&config).await.expect("initialize app");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app.router).await.expect("server exited");
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/rpc"))
        .json(&serde_json::json!({ "op": "register_agent", "params": {} }))
        .send()
        .await
        .expect("POST /rpc");
    assert_eq!(response.status(), 401);
}
