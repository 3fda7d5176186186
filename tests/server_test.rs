//! Black-box tests against the spawned binary
//!
//! Uses reqwest over real TCP, so caller IPs come from the socket.

mod common;

use common::{TestServer, ADMIN_EMAIL, ADMIN_PASSWORD};
use serde_json::{json, Value};

#[tokio::test]
async fn test_login_verify_logout_flow() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let token = server.login(&client).await;
    assert_eq!(token.len(), 64);

    let resp = client
        .post(server.url("/api/v1/auth/verify"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["user"]["email"], ADMIN_EMAIL);

    let resp = client
        .post(server.url("/api/v1/auth/logout"))
        .json(&json!({ "token": token }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = client
        .post(server.url("/api/v1/auth/verify"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
async fn test_concurrent_failures_all_counted() {
    let server = TestServer::with_max_attempts(5).await;
    let client = reqwest::Client::new();

    let attempts = (0..20).map(|_| {
        let client = client.clone();
        let url = server.url("/api/v1/auth/login");
        tokio::spawn(async move {
            client
                .post(url)
                .json(&json!({"email": ADMIN_EMAIL, "password": "wrong"}))
                .send()
                .await
                .unwrap()
                .status()
                .as_u16()
        })
    });

    let mut unauthorized = 0;
    for handle in attempts.collect::<Vec<_>>() {
        match handle.await.unwrap() {
            401 => unauthorized += 1,
            429 => {}
            other => panic!("unexpected status {other}"),
        }
    }
    // Attempts are reserved before bcrypt, so exactly the budget is evaluated
    assert_eq!(unauthorized, 5);

    let resp = client
        .post(server.url("/api/v1/auth/login"))
        .json(&json!({"email": ADMIN_EMAIL, "password": ADMIN_PASSWORD}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 429);
    let body: Value = resp.json().await.unwrap();
    assert!(body["retryAfterMinutes"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_concurrent_verifies_keep_session() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let token = server.login(&client).await;

    let verifies: Vec<_> = (0..16)
        .map(|_| {
            let client = client.clone();
            let url = server.url("/api/v1/auth/verify");
            let token = token.clone();
            tokio::spawn(async move {
                client
                    .post(url)
                    .bearer_auth(token)
                    .send()
                    .await
                    .unwrap()
                    .status()
                    .as_u16()
            })
        })
        .collect();

    for handle in verifies {
        assert_eq!(handle.await.unwrap(), 200);
    }
}

#[tokio::test]
async fn test_strict_ip_allows_same_socket_address() {
    let server = TestServer::strict_ip().await;
    let client = reqwest::Client::new();
    let token = server.login(&client).await;

    // Proxy headers are not trusted by default, so this cannot spoof a mismatch
    let resp = client
        .post(server.url("/api/v1/auth/verify"))
        .bearer_auth(&token)
        .header("x-forwarded-for", "9.9.9.9")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn test_health_and_security_headers() {
    let server = TestServer::start().await;
    let resp = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
    assert_eq!(resp.headers()["x-frame-options"], "DENY");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
}
