//! Integration tests for the session agent HTTP server

#[cfg(feature = "server")]
mod server_tests {
    use breath_session_agent::server::{run, ServerConfig};
    use breath_session_agent::{
        Config, MemoryStore, MockFactory, MockProfile, PortRegistry, SessionRunner, SessionStore,
        SessionSupervisor,
    };
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    /// Start a server backed by a paced synthetic sensor and an in-memory store.
    async fn start(ports: PortRegistry) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let config = Config {
            max_session_duration: Duration::from_secs(5),
            ..Config::default()
        };
        let runner =
            Arc::new(SessionRunner::new(config, store.clone()).with_ports(ports.clone()));
        let factory = MockFactory::new("mock0", MockProfile::Random, ports)
            .with_interval(Duration::from_millis(20));
        let supervisor = SessionSupervisor::new(
            runner,
            Arc::new(factory),
            tokio::runtime::Handle::current(),
        );

        let (addr, shutdown_tx) = run(ServerConfig::new(0), supervisor, store)
            .await
            .expect("Failed to start server");

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(100)).await;
        (addr, shutdown_tx)
    }

    /// Shut the server down and let cancelled sessions wind up.
    async fn stop(shutdown_tx: tokio::sync::oneshot::Sender<()>) {
        let _ = shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (addr, shutdown_tx) = start(PortRegistry::new()).await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .expect("Failed to send request");

        assert!(response.status().is_success());

        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["status"], "ok");
        assert!(body["version"].as_str().is_some());
        assert_eq!(body["active_sessions"], 0);

        stop(shutdown_tx).await;
    }

    #[tokio::test]
    async fn test_login_is_accepted_then_pollable() {
        let (addr, shutdown_tx) = start(PortRegistry::new()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("http://{}/sessions", addr))
            .json(&serde_json::json!({ "user_id": "user-1" }))
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        let ack: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(ack["status"], "accepted");
        let session_id = ack["session_id"].as_str().unwrap().to_string();

        // The running record shows up without waiting for the session to end
        let mut latest = None;
        for _ in 0..100 {
            let response = client
                .get(format!("http://{}/sessions/user-1/latest", addr))
                .send()
                .await
                .expect("Failed to send request");
            if response.status().is_success() {
                latest = Some(response.json::<serde_json::Value>().await.unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let latest = latest.expect("session record was never stored");
        assert_eq!(latest["session_id"], session_id.as_str());
        assert_eq!(latest["user_id"], "user-1");

        stop(shutdown_tx).await;
    }

    #[tokio::test]
    async fn test_second_login_conflicts() {
        let (addr, shutdown_tx) = start(PortRegistry::new()).await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/sessions", addr);

        let first = client
            .post(&url)
            .json(&serde_json::json!({ "user_id": "user-1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), reqwest::StatusCode::ACCEPTED);

        let second = client
            .post(&url)
            .json(&serde_json::json!({ "user_id": "user-1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
        let body: serde_json::Value = second.json().await.unwrap();
        assert_eq!(body["code"], "SESSION_ACTIVE");

        // Another user needs the same sensor
        let other = client
            .post(&url)
            .json(&serde_json::json!({ "user_id": "user-2" }))
            .send()
            .await
            .unwrap();
        assert_eq!(other.status(), reqwest::StatusCode::LOCKED);
        let body: serde_json::Value = other.json().await.unwrap();
        assert_eq!(body["code"], "PORT_BUSY");

        stop(shutdown_tx).await;
    }

    #[tokio::test]
    async fn test_unknown_user_and_bad_input() {
        let (addr, shutdown_tx) = start(PortRegistry::new()).await;
        let client = reqwest::Client::new();

        let missing = client
            .get(format!("http://{}/sessions/nobody/latest", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let empty = client
            .post(format!("http://{}/sessions", addr))
            .json(&serde_json::json!({ "user_id": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), reqwest::StatusCode::BAD_REQUEST);

        stop(shutdown_tx).await;
    }

    #[tokio::test]
    async fn test_cors_headers() {
        let (addr, shutdown_tx) = start(PortRegistry::new()).await;

        // Send OPTIONS request to check CORS
        let client = reqwest::Client::new();
        let response = client
            .request(reqwest::Method::OPTIONS, format!("http://{}/sessions", addr))
            .header("Origin", "http://localhost")
            .header("Access-Control-Request-Method", "POST")
            .send()
            .await
            .expect("Failed to send request");

        // CORS preflight should succeed
        assert!(
            response.status().is_success() || response.status() == reqwest::StatusCode::NO_CONTENT,
            "CORS preflight failed: {}",
            response.status()
        );

        stop(shutdown_tx).await;
    }
}
