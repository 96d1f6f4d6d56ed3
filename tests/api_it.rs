mod support;

use anyhow::Result;
use axum::http::{Method, StatusCode};
use chrono::Duration;
use serde_json::json;
use support::{
    app::TestApp,
    provider::StubReply,
};

fn polite() -> StubReply {
    StubReply::Text("Could you please help me?".to_string())
}

#[tokio::test]
async fn generate_counts_down_then_rejects_with_quota_exceeded() -> Result<()> {
    let app = TestApp::start(2, polite()).await?;
    let token = app.register_and_login("alice", "secret1").await?;

    let (status, body) = app.generate(Some(&token), "help me").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "Could you please help me?");
    assert_eq!(body["remaining"], 1);

    let (status, body) = app.generate(Some(&token), "help me").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining"], 0);

    let (status, body) = app.generate(Some(&token), "help me").await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
    assert!(
        body["message"]
            .as_str()
            .unwrap_or_default()
            .contains("try again tomorrow")
    );
    assert_eq!(app.provider.calls(), 2);

    let (status, body) = app
        .request(Method::GET, "/api/quota", Some(&token), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"username": "alice", "daily_limit": 2, "remaining": 0}));

    Ok(())
}

#[tokio::test]
async fn quota_returns_on_the_next_day() -> Result<()> {
    let app = TestApp::start(1, polite()).await?;
    let token = app.register_and_login("alice", "secret1").await?;

    assert_eq!(app.generate(Some(&token), "one").await?.0, StatusCode::OK);
    assert_eq!(
        app.generate(Some(&token), "two").await?.0,
        StatusCode::TOO_MANY_REQUESTS
    );

    app.clock.advance(Duration::days(1));
    let (status, body) = app.generate(Some(&token), "three").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining"], 0);

    Ok(())
}

#[tokio::test]
async fn missing_or_invalid_token_is_unauthorized_and_never_reaches_provider() -> Result<()> {
    let app = TestApp::start(3, polite()).await?;

    let (status, body) = app.generate(None, "help me").await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = app.generate(Some("not-a-jwt"), "help me").await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.provider.calls(), 0);

    Ok(())
}

#[tokio::test]
async fn provider_failure_is_bad_gateway_and_still_consumes_quota() -> Result<()> {
    let app = TestApp::start(3, StubReply::Status(StatusCode::INTERNAL_SERVER_ERROR)).await?;
    let token = app.register_and_login("alice", "secret1").await?;

    let (status, body) = app.generate(Some(&token), "help me").await?;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "generation_failed");
    assert_eq!(app.provider.calls(), 1);

    let (_, quota) = app
        .request(Method::GET, "/api/quota", Some(&token), None)
        .await?;
    assert_eq!(quota["remaining"], 2);

    Ok(())
}

#[tokio::test]
async fn provider_receives_prompt_and_api_key() -> Result<()> {
    let app = TestApp::start(3, polite()).await?;
    let token = app.register_and_login("alice", "secret1").await?;

    app.generate(Some(&token), "gimme help").await?;

    assert_eq!(
        app.provider.last_prompt().as_deref(),
        Some("Rewrite this politely\n\nText:\ngimme help")
    );
    assert_eq!(
        app.provider.last_authorization().as_deref(),
        Some("Bearer test-key")
    );

    Ok(())
}

#[tokio::test]
async fn empty_text_is_rejected_before_quota_is_used() -> Result<()> {
    let app = TestApp::start(1, polite()).await?;
    let token = app.register_and_login("alice", "secret1").await?;

    let (status, body) = app.generate(Some(&token), "   ").await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation");

    assert_eq!(app.generate(Some(&token), "real text").await?.0, StatusCode::OK);

    Ok(())
}

#[tokio::test]
async fn registration_and_login_errors() -> Result<()> {
    let app = TestApp::start(3, polite()).await?;
    app.register_and_login("alice", "secret1").await?;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/register",
            None,
            Some(json!({"username": "alice", "password": "secret2"})),
        )
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");

    let (status, _) = app
        .request(
            Method::POST,
            "/api/register",
            None,
            Some(json!({"username": "bob", "password": "short"})),
        )
        .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .request(
            Method::POST,
            "/api/login",
            None,
            Some(json!({"username": "alice", "password": "wrong99"})),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .request(
            Method::POST,
            "/api/login",
            None,
            Some(json!({"username": "nobody", "password": "secret1"})),
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn admin_and_user_tokens_stay_in_their_lanes() -> Result<()> {
    let app = TestApp::start(3, polite()).await?;
    let user = app.register_and_login("alice", "secret1").await?;
    let admin = app.admin_token().await?;

    let (status, _) = app
        .request(Method::GET, "/api/admin/usage", Some(&user), None)
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.generate(Some(&admin), "help me").await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .request(
            Method::POST,
            "/api/admin/login",
            None,
            Some(json!({"username": "admin", "password": "guess"})),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    Ok(())
}

#[tokio::test]
async fn admin_usage_and_resets() -> Result<()> {
    let app = TestApp::start(3, polite()).await?;
    let alice = app.register_and_login("alice", "secret1").await?;
    let bob = app.register_and_login("bob", "secret2").await?;
    let admin = app.admin_token().await?;

    app.generate(Some(&alice), "one").await?;
    app.generate(Some(&alice), "two").await?;
    app.generate(Some(&bob), "three").await?;

    let (status, usage) = app
        .request(Method::GET, "/api/admin/usage", Some(&admin), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["total_users"], 2);
    assert_eq!(usage["daily_limit"], 3);
    assert_eq!(usage["total_generations"], 3);
    assert_eq!(usage["active_today"], 2);
    assert_eq!(usage["today"], "2026-10-17");
    assert_eq!(usage["usage"]["alice"], json!({"date": "2026-10-17", "count": 2}));

    let (status, body) = app
        .request(
            Method::POST,
            "/api/admin/reset-user",
            Some(&admin),
            Some(json!({"username": "alice"})),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reset"], true);
    let (_, quota) = app
        .request(Method::GET, "/api/quota", Some(&alice), None)
        .await?;
    assert_eq!(quota["remaining"], 3);

    let (status, _) = app
        .request(Method::POST, "/api/admin/reset-usage", Some(&admin), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    let (_, quota) = app
        .request(Method::GET, "/api/quota", Some(&bob), None)
        .await?;
    assert_eq!(quota["remaining"], 3);
    assert_eq!(std::fs::read_to_string(app.ledger_path())?.trim(), "{}");

    Ok(())
}

#[tokio::test]
async fn deleted_user_loses_access() -> Result<()> {
    let app = TestApp::start(3, polite()).await?;
    let alice = app.register_and_login("alice", "secret1").await?;
    let admin = app.admin_token().await?;

    let (status, body) = app
        .request(Method::DELETE, "/api/admin/users/alice", Some(&admin), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, _) = app.generate(Some(&alice), "help me").await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .request(Method::DELETE, "/api/admin/users/alice", Some(&admin), None)
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn admin_logs_list_recent_interactions() -> Result<()> {
    let app = TestApp::start(5, polite()).await?;
    let alice = app.register_and_login("alice", "secret1").await?;
    let admin = app.admin_token().await?;

    app.generate(Some(&alice), "first").await?;
    app.generate(Some(&alice), "second").await?;

    let (status, body) = app
        .request(Method::GET, "/api/admin/logs?limit=1", Some(&admin), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    let entry = &body["interactions"][0];
    assert_eq!(entry["user_id"], "alice");
    assert_eq!(entry["user_text"], "second");
    assert_eq!(entry["ai_response"], "Could you please help me?");
    assert_eq!(entry["token_usage"]["total_tokens"], 28);

    Ok(())
}

#[tokio::test]
async fn service_endpoints_respond() -> Result<()> {
    let app = TestApp::start(1, polite()).await?;

    let (status, body) = app.request(Method::GET, "/", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Text Assistant API is running");

    let (status, body) = app.request(Method::GET, "/healthz", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    let token = app.register_and_login("alice", "secret1").await?;
    app.generate(Some(&token), "one").await?;
    app.generate(Some(&token), "two").await?;

    let (status, body) = app.request(Method::GET, "/metrics", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    let metrics = body.as_str().unwrap_or_default();
    assert!(metrics.contains("test_generations_total{outcome=\"success\"} 1"));
    assert!(metrics.contains("test_quota_rejections_total 1"));
    assert!(metrics.contains("test_http_requests_total"));

    Ok(())
}
