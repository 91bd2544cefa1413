mod common;

use anyhow::Result;
use axum::http::{Method, StatusCode};
use common::{acquire_db_lock, body_to_json, TestApp};
use diesel::prelude::*;
use serde_json::json;
use sha2::{Digest, Sha256};

#[tokio::test]
async fn enqueue_pull_report_round_trip() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);
    let device_auth = TestApp::bearer_auth(&device.token);

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/messages",
            Some(json!({
                "phoneNumbers": ["+16502530000"],
                "textMessage": {"text": "hi"},
                "deviceId": device.id,
            })),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body["state"], "Pending");
    let ext_id = body["id"].as_str().unwrap().to_string();
    assert_eq!(
        location.as_deref(),
        Some(format!("/3rdparty/v1/messages/{ext_id}").as_str())
    );

    // Device pulls pending work.
    let response = app
        .request(Method::GET, "/mobile/v1/messages", None, Some(&device_auth))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let pending = body_to_json(response.into_body()).await?;
    let pending = pending.as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["id"], ext_id.as_str());
    assert_eq!(pending[0]["phoneNumbers"][0], "+16502530000");
    assert_eq!(pending[0]["textMessage"]["text"], "hi");

    // Device reports the send.
    let response = app
        .request(
            Method::PATCH,
            "/mobile/v1/messages",
            Some(json!([{
                "id": ext_id,
                "state": "Sent",
                "recipients": [{"phoneNumber": "+16502530000", "state": "Sent"}],
            }])),
            Some(&device_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .request(
            Method::GET,
            &format!("/3rdparty/v1/messages/{ext_id}"),
            None,
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body["state"], "Sent");
    assert_eq!(body["recipients"][0]["state"], "Sent");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_enqueue_conflicts() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);
    let payload = json!({
        "id": "abc-1",
        "phoneNumbers": ["+16502530000"],
        "textMessage": {"text": "hi"},
        "deviceId": device.id,
    });

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/messages",
            Some(payload.clone()),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/messages",
            Some(payload),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let rows: i64 = app
        .with_conn(|conn| {
            use smsbridge::schema::messages::dsl::*;
            Ok(messages.filter(ext_id.eq("abc-1")).count().get_result(conn)?)
        })
        .await?;
    assert_eq!(rows, 1);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn phone_validation_can_be_skipped() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);
    let payload = json!({
        "phoneNumbers": ["not-a-number"],
        "textMessage": {"text": "hi"},
        "deviceId": device.id,
    });

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/messages",
            Some(payload.clone()),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/messages?skipPhoneValidation=true",
            Some(payload),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn missing_content_is_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);

    let response = app
        .request(
            Method::POST,
            "/3rdparty/v1/messages",
            Some(json!({
                "phoneNumbers": ["+16502530000"],
                "deviceId": device.id,
            })),
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn pending_batch_is_priority_then_recency_ordered() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);
    let device_auth = TestApp::bearer_auth(&device.token);

    for (ext_id, priority) in [("m-first", 0), ("m-urgent", 5), ("m-last", 0)] {
        let response = app
            .request(
                Method::POST,
                "/3rdparty/v1/messages",
                Some(json!({
                    "id": ext_id,
                    "priority": priority,
                    "phoneNumbers": ["+16502530000"],
                    "textMessage": {"text": "hi"},
                    "deviceId": device.id,
                })),
                Some(&user_auth),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    // Default LIFO: highest priority first, then newest.
    let response = app
        .request(Method::GET, "/mobile/v1/messages", None, Some(&device_auth))
        .await?;
    let body = body_to_json(response.into_body()).await?;
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|message| message["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["m-urgent", "m-last", "m-first"]);

    let response = app
        .request(
            Method::GET,
            "/mobile/v1/messages?order=fifo",
            None,
            Some(&device_auth),
        )
        .await?;
    let body = body_to_json(response.into_body()).await?;
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|message| message["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["m-urgent", "m-first", "m-last"]);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn listing_filters_by_state_and_reports_total() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);
    let device_auth = TestApp::bearer_auth(&device.token);

    for ext_id in ["list-1", "list-2"] {
        app.request(
            Method::POST,
            "/3rdparty/v1/messages",
            Some(json!({
                "id": ext_id,
                "phoneNumbers": ["+16502530000"],
                "textMessage": {"text": "hi"},
                "deviceId": device.id,
            })),
            Some(&user_auth),
        )
        .await?;
    }
    app.request(
        Method::PATCH,
        "/mobile/v1/messages",
        Some(json!([{
            "id": "list-1",
            "state": "Sent",
            "recipients": [{"phoneNumber": "+16502530000", "state": "Sent"}],
        }])),
        Some(&device_auth),
    )
    .await?;

    let response = app
        .request(
            Method::GET,
            "/3rdparty/v1/messages?state=Pending",
            None,
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-total-count")
            .and_then(|value| value.to_str().ok()),
        Some("1")
    );
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], "list-2");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn state_history_keeps_first_timestamp() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);
    let device_auth = TestApp::bearer_auth(&device.token);

    app.request(
        Method::POST,
        "/3rdparty/v1/messages",
        Some(json!({
            "id": "hist-1",
            "phoneNumbers": ["+16502530000"],
            "textMessage": {"text": "hi"},
            "deviceId": device.id,
        })),
        Some(&user_auth),
    )
    .await?;

    let first = "2026-01-01T10:00:00";
    let second = "2026-01-01T11:00:00";
    for stamp in [first, second] {
        let response = app
            .request(
                Method::PATCH,
                "/mobile/v1/messages",
                Some(json!([{
                    "id": "hist-1",
                    "state": "Sent",
                    "recipients": [{"phoneNumber": "+16502530000", "state": "Sent"}],
                    "states": {"Sent": stamp},
                }])),
                Some(&device_auth),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let (rows, stored): (i64, chrono::NaiveDateTime) = app
        .with_conn(|conn| {
            use smsbridge::schema::message_states::dsl::*;
            let rows = message_states
                .filter(state.eq("Sent"))
                .count()
                .get_result(conn)?;
            let stored = message_states
                .filter(state.eq("Sent"))
                .select(updated_at)
                .first(conn)?;
            Ok((rows, stored))
        })
        .await?;
    assert_eq!(rows, 1);
    assert_eq!(
        stored,
        chrono::NaiveDateTime::parse_from_str(first, "%Y-%m-%dT%H:%M:%S")?
    );

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn hashing_sweep_anonymises_settled_messages() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);
    let device_auth = TestApp::bearer_auth(&device.token);

    app.request(
        Method::POST,
        "/3rdparty/v1/messages",
        Some(json!({
            "id": "hash-1",
            "phoneNumbers": ["+16502530000"],
            "textMessage": {"text": "hi"},
            "deviceId": device.id,
        })),
        Some(&user_auth),
    )
    .await?;
    app.request(
        Method::PATCH,
        "/mobile/v1/messages",
        Some(json!([{
            "id": "hash-1",
            "state": "Sent",
            "recipients": [{"phoneNumber": "+16502530000", "state": "Sent"}],
        }])),
        Some(&device_auth),
    )
    .await?;

    app.with_conn(|conn| {
        smsbridge::messages::repository::hash_processed(conn, &[])?;
        Ok(())
    })
    .await?;

    let (hashed, content, phone): (bool, String, String) = app
        .with_conn(|conn| {
            use smsbridge::schema::{message_recipients, messages};
            let (hashed, content): (bool, String) = messages::table
                .filter(messages::ext_id.eq("hash-1"))
                .select((messages::is_hashed, messages::content))
                .first(conn)?;
            let phone: String = message_recipients::table
                .select(message_recipients::phone_number)
                .first(conn)?;
            Ok((hashed, content, phone))
        })
        .await?;

    assert!(hashed);
    assert_eq!(content, hex::encode(Sha256::digest(b"hi")));
    assert_eq!(phone, hex::encode(Sha256::digest(b"+16502530000"))[..16]);

    // A second sweep is a no-op on already-hashed rows.
    let again: String = app
        .with_conn(|conn| {
            smsbridge::messages::repository::hash_processed(conn, &[])?;
            use smsbridge::schema::messages::dsl::*;
            Ok(messages
                .filter(ext_id.eq("hash-1"))
                .select(content)
                .first(conn)?)
        })
        .await?;
    assert_eq!(again, content);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn encrypted_messages_are_never_hashed() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);
    let device_auth = TestApp::bearer_auth(&device.token);

    app.request(
        Method::POST,
        "/3rdparty/v1/messages",
        Some(json!({
            "id": "enc-1",
            "isEncrypted": true,
            "phoneNumbers": ["encrypted-blob"],
            "textMessage": {"text": "ciphertext"},
            "deviceId": device.id,
        })),
        Some(&user_auth),
    )
    .await?;
    app.request(
        Method::PATCH,
        "/mobile/v1/messages",
        Some(json!([{
            "id": "enc-1",
            "state": "Sent",
            "recipients": [{"phoneNumber": "encrypted-blob", "state": "Sent"}],
        }])),
        Some(&device_auth),
    )
    .await?;

    let (hashed, content): (bool, String) = app
        .with_conn(|conn| {
            smsbridge::messages::repository::hash_processed(conn, &[])?;
            use smsbridge::schema::messages::dsl::*;
            Ok(messages
                .filter(ext_id.eq("enc-1"))
                .select((is_hashed, content))
                .first(conn)?)
        })
        .await?;

    assert!(!hashed);
    assert!(content.contains("ciphertext"));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn absent_message_is_negatively_cached() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let device = app.register_device().await?;
    let user_auth = TestApp::basic_auth(&device.login, &device.password);

    let response = app
        .request(
            Method::GET,
            "/3rdparty/v1/messages/ghost-1",
            None,
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // The row appears behind the cache's back; the negative entry still
    // answers within its TTL, so the new row stays invisible.
    let owner_device = device.id.clone();
    app.with_conn(move |conn| {
        use smsbridge::schema::messages;
        diesel::insert_into(messages::table)
            .values((
                messages::device_id.eq(owner_device),
                messages::ext_id.eq("ghost-1"),
                messages::message_type.eq("Text"),
                messages::content.eq(r#"{"text":"hi"}"#),
                messages::state.eq("Pending"),
            ))
            .execute(conn)?;
        Ok(())
    })
    .await?;

    let response = app
        .request(
            Method::GET,
            "/3rdparty/v1/messages/ghost-1",
            None,
            Some(&user_auth),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.cleanup().await?;
    Ok(())
}
