// Integration tests for the loopback OAuth callback endpoint

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use manim_ai::identity::{
    create_callback_router, AuthorizationCode, CallbackOutcome, CallbackState, PendingLogins,
    CALLBACK_PATH,
};
use tokio::sync::mpsc;
use tower::ServiceExt;

fn create_test_app(pending: PendingLogins) -> (Router, mpsc::Receiver<CallbackOutcome>) {
    let (outcomes, rx) = mpsc::channel(4);
    let app = create_callback_router(CallbackState { pending, outcomes });
    (app, rx)
}

async fn get(app: Router, query: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("{}?{}", CALLBACK_PATH, query))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

/// A valid state delivers the code paired with its verifier.
#[tokio::test]
async fn test_valid_callback_delivers_code() {
    let pending = PendingLogins::new(600);
    let state = pending.create("verifier-1");
    let (app, mut rx) = create_test_app(pending.clone());

    let (status, body) = get(app, &format!("code=auth-code&state={}", state)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Signed in"));
    assert_eq!(
        rx.recv().await.unwrap(),
        Ok(AuthorizationCode {
            code: "auth-code".to_string(),
            code_verifier: "verifier-1".to_string(),
        })
    );
    // State is consumed
    assert!(pending.validate_and_consume(&state).is_none());
}

/// Replaying a consumed state is rejected.
#[tokio::test]
async fn test_state_is_single_use() {
    let pending = PendingLogins::new(600);
    let state = pending.create("verifier-1");
    let (app, mut rx) = create_test_app(pending);

    let query = format!("code=auth-code&state={}", state);
    let (first, _) = get(app.clone(), &query).await;
    let (second, body) = get(app, &query).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::UNAUTHORIZED);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "Invalid or expired sign-in attempt");

    // Only the first callback reached the login task
    assert!(rx.recv().await.unwrap().is_ok());
    assert!(rx.try_recv().is_err());
}

/// Unknown state values never deliver a code.
#[tokio::test]
async fn test_unknown_state_rejected() {
    let (app, mut rx) = create_test_app(PendingLogins::new(600));

    let (status, _) = get(app, "code=auth-code&state=forged").await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(rx.try_recv().is_err());
}

/// Missing parameters are a bad request.
#[tokio::test]
async fn test_missing_parameters() {
    let pending = PendingLogins::new(600);
    let state = pending.create("verifier-1");
    let (app, _rx) = create_test_app(pending);

    let (status, body) = get(app.clone(), &format!("state={}", state)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Missing 'code' parameter"));

    let (status, body) = get(app, "code=auth-code").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Missing 'state' parameter"));
}

/// Provider errors are forwarded to the waiting login.
#[tokio::test]
async fn test_provider_error_forwarded() {
    let pending = PendingLogins::new(600);
    let state = pending.create("verifier-1");
    let (app, mut rx) = create_test_app(pending.clone());

    let (status, body) = get(
        app,
        &format!(
            "error=access_denied&error_description=User%20cancelled&state={}",
            state
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("access_denied"));
    assert_eq!(
        rx.recv().await.unwrap(),
        Err("access_denied - User cancelled".to_string())
    );
    assert!(pending.validate_and_consume(&state).is_none());
}

/// An error redirect without a live state cannot abort the pending login.
#[tokio::test]
async fn test_error_without_valid_state_is_ignored() {
    let pending = PendingLogins::new(600);
    let state = pending.create("verifier-1");
    let (app, mut rx) = create_test_app(pending);

    let (status, _) = get(app.clone(), "error=access_denied").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = get(app.clone(), "error=access_denied&state=forged").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "Invalid or expired sign-in attempt");
    assert!(rx.try_recv().is_err());

    // The real redirect still completes the login
    let (status, _) = get(app, &format!("code=auth-code&state={}", state)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        rx.recv().await.unwrap(),
        Ok(AuthorizationCode {
            code: "auth-code".to_string(),
            code_verifier: "verifier-1".to_string(),
        })
    );
}

/// A live state without a code ends the login with an error.
#[tokio::test]
async fn test_missing_code_is_forwarded() {
    let pending = PendingLogins::new(600);
    let state = pending.create("verifier-1");
    let (app, mut rx) = create_test_app(pending);

    let (status, _) = get(app, &format!("state={}", state)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        rx.recv().await.unwrap(),
        Err("Missing 'code' parameter".to_string())
    );
}
