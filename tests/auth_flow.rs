mod common;

use anyhow::Result;
use axum::http::{Method, StatusCode};
use common::{acquire_db_lock, body_to_json, TestApp};
use serde_json::json;

#[tokio::test]
async fn refresh_rotation_detects_replay() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);

    let response = app
        .request(Method::POST, "/3rdparty/v1/auth/token", None, Some(&user_auth))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let pair = body_to_json(response.into_body()).await?;
    let access = pair["accessToken"].as_str().unwrap().to_string();
    let refresh = pair["refreshToken"].as_str().unwrap().to_string();

    // Rotate once.
    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/auth/token/refresh",
            None,
            Some(&TestApp::bearer_auth(&refresh)),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let rotated = body_to_json(response.into_body()).await?;
    assert_ne!(rotated["refreshToken"].as_str(), Some(refresh.as_str()));

    // Replaying the consumed refresh token is rejected and issues nothing.
    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/auth/token/refresh",
            None,
            Some(&TestApp::bearer_auth(&refresh)),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // The pre-rotation access token stays valid until its natural expiry.
    let response = app
        .request(
            Method::GET,
            "/3rdparty/v1/messages",
            None,
            Some(&TestApp::bearer_auth(&access)),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    // The rotated pair works.
    let new_access = rotated["accessToken"].as_str().unwrap();
    let response = app
        .request(
            Method::GET,
            "/3rdparty/v1/messages",
            None,
            Some(&TestApp::bearer_auth(new_access)),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn revoked_access_token_is_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);

    let response = app
        .request(Method::POST, "/3rdparty/v1/auth/token", None, Some(&user_auth))
        .await?;
    let pair = body_to_json(response.into_body()).await?;
    let jti = pair["id"].as_str().unwrap().to_string();
    let access = pair["accessToken"].as_str().unwrap().to_string();

    let response = app
        .request(
            Method::DELETE,
            &format!("/3rdparty/v1/auth/token/{jti}"),
            None,
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .request(
            Method::GET,
            "/3rdparty/v1/messages",
            None,
            Some(&TestApp::bearer_auth(&access)),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn scoped_tokens_are_enforced() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/auth/token",
            Some(json!({"scopes": ["messages:read"]})),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let pair = body_to_json(response.into_body()).await?;
    let access = pair["accessToken"].as_str().unwrap().to_string();
    let bearer = TestApp::bearer_auth(&access);

    // Reading is granted.
    let response = app
        .request(Method::GET, "/3rdparty/v1/messages", None, Some(&bearer))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    // Sending is not.
    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/messages",
            Some(json!({
                "phoneNumbers": ["+16502530000"],
                "textMessage": {"text": "hi"},
                "deviceId": device.id,
            })),
            Some(&bearer),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn wrong_credentials_are_unauthorized() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/auth/token",
            None,
            Some(&TestApp::basic_auth(&device.login, "wrong-password")),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .request(
            Method::GET,
            "/3rdparty/v1/messages",
            None,
            Some(&TestApp::bearer_auth("garbage-token")),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await?;
    Ok(())
}
