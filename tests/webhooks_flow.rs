mod common;

use anyhow::Result;
use axum::http::{Method, StatusCode};
use common::{acquire_db_lock, body_to_json, TestApp};
use serde_json::json;

#[tokio::test]
async fn webhook_crud_round_trip() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/webhooks",
            Some(json!({
                "id": "hook-1",
                "url": "https://example.org/callback",
                "event": "sms:received",
            })),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    // Same ext id upserts rather than duplicating.
    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/webhooks",
            Some(json!({
                "id": "hook-1",
                "url": "https://example.org/callback-v2",
                "event": "sms:delivered",
            })),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .request(Method::GET, "/3rdparty/v1/webhooks", None, Some(&user_auth))
        .await?;
    let body = body_to_json(response.into_body()).await?;
    let hooks = body.as_array().unwrap();
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0]["url"], "https://example.org/callback-v2");
    assert_eq!(hooks[0]["event"], "sms:delivered");

    let response = app
        .request(
            Method::DELETE,
            "/3rdparty/v1/webhooks/hook-1",
            None,
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .request(Method::GET, "/3rdparty/v1/webhooks", None, Some(&user_auth))
        .await?;
    let body = body_to_json(response.into_body()).await?;
    assert!(body.as_array().unwrap().is_empty());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_webhooks_are_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/webhooks",
            Some(json!({"url": "ftp://example.org", "event": "sms:received"})),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/webhooks",
            Some(json!({"url": "https://example.org", "event": "sms:exploded"})),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn device_scoped_webhooks_are_visible_to_that_device_only() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let first = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&first.login, &first.password);

    // Second device for the same user.
    let response = app
        .request(
            Method::POST,
            "/mobile/v1/device",
            Some(json!({"name": "second"})),
            Some(&user_auth),
        )
        .await?;
    let second = body_to_json(response.into_body()).await?;
    let second_token = second["token"].as_str().unwrap().to_string();

    // One global webhook and one scoped to the first device.
    app.request(
        Method::POST,
        "/3rdparty/v1/webhooks",
        Some(json!({
            "id": "global-hook",
            "url": "https://example.org/all",
            "event": "sms:received",
        })),
        Some(&user_auth),
    )
    .await?;
    app.request(
        Method::POST,
        "/3rdparty/v1/webhooks",
        Some(json!({
            "id": "scoped-hook",
            "deviceId": first.id,
            "url": "https://example.org/first-only",
            "event": "sms:received",
        })),
        Some(&user_auth),
    )
    .await?;

    let response = app
        .request(
            Method::GET,
            "/mobile/v1/webhooks",
            None,
            Some(&TestApp::bearer_auth(&first.token)),
        )
        .await?;
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body.as_array().unwrap().len(), 2);

    let response = app
        .request(
            Method::GET,
            "/mobile/v1/webhooks",
            None,
            Some(&TestApp::bearer_auth(&second_token)),
        )
        .await?;
    let body = body_to_json(response.into_body()).await?;
    let hooks = body.as_array().unwrap();
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0]["id"], "global-hook");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn webhooks_are_isolated_between_users() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let alice = app.register_device().await?;
    let bob = app.register_device().await?;

    app.request(
        Method::POST,
        "/3rdparty/v1/webhooks",
        Some(json!({
            "id": "alices-hook",
            "url": "https://example.org/alice",
            "event": "sms:received",
        })),
        Some(&TestApp::basic_auth(&alice.login, &alice.password)),
    )
    .await?;

    let response = app
        .request(
            Method::GET,
            "/3rdparty/v1/webhooks",
            None,
            Some(&TestApp::basic_auth(&bob.login, &bob.password)),
        )
        .await?;
    let body = body_to_json(response.into_body()).await?;
    assert!(body.as_array().unwrap().is_empty());

    // Deleting someone else's webhook is a silent no-op on their data.
    app.request(
        Method::DELETE,
        "/3rdparty/v1/webhooks/alices-hook",
        None,
        Some(&TestApp::basic_auth(&bob.login, &bob.password)),
    )
    .await?;

    let response = app
        .request(
            Method::GET,
            "/3rdparty/v1/webhooks",
            None,
            Some(&TestApp::basic_auth(&alice.login, &alice.password)),
        )
        .await?;
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body.as_array().unwrap().len(), 1);

    app.cleanup().await?;
    Ok(())
}
