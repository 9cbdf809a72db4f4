// End-to-end tests: Supabase sign-in, backend token exchange, generation,
// and sign-out over a shared on-disk credential store

use manim_ai::credentials::{CredentialCache, LocalStorage};
use manim_ai::generation::{GenerationController, GenerationStatus, SubmitOutcome};
use manim_ai::identity::{IdentityProvider, SupabaseAuth};
use manim_ai::session::{SessionBridge, SessionState, TokenExchange};
use manim_ai::ApiClient;
use mockito::{Matcher, Server, ServerGuard};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// 32 zero bytes
const ENCRYPTION_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

const TOKEN_BODY: &str = r#"{
    "access_token": "sb-access",
    "refresh_token": "sb-refresh",
    "expires_in": 3600,
    "user": {
        "id": "sub-1",
        "email": "user@example.com",
        "app_metadata": {"provider": "google"},
        "user_metadata": {"full_name": "Test User"}
    }
}"#;

struct Client {
    cache: Arc<CredentialCache>,
    provider: Arc<SupabaseAuth>,
    bridge: Arc<SessionBridge>,
    api: Arc<ApiClient>,
}

fn create_client(db: &Path, identity_url: &str, backend_url: &str) -> Client {
    create_client_with_timeout(db, identity_url, backend_url, Duration::from_secs(5))
}

fn create_client_with_timeout(
    db: &Path,
    identity_url: &str,
    backend_url: &str,
    identity_timeout: Duration,
) -> Client {
    let storage = Arc::new(LocalStorage::open(db, Some(ENCRYPTION_KEY)).unwrap());
    let cache = Arc::new(CredentialCache::new(Arc::clone(&storage)));
    let provider = Arc::new(
        SupabaseAuth::new(identity_url, "anon", storage, identity_timeout).unwrap(),
    );
    let exchange =
        TokenExchange::new(backend_url, Arc::clone(&cache), Duration::from_secs(5)).unwrap();
    let bridge = Arc::new(SessionBridge::new(
        provider.clone(),
        exchange,
        Arc::clone(&cache),
    ));
    let api = Arc::new(
        ApiClient::new(backend_url, Arc::clone(&cache), Duration::from_secs(5)).unwrap(),
    );

    Client {
        cache,
        provider,
        bridge,
        api,
    }
}

async fn mock_pkce(server: &mut ServerGuard) -> mockito::Mock {
    mock_pkce_with_body(server, TOKEN_BODY).await
}

async fn mock_pkce_with_body(server: &mut ServerGuard, body: &str) -> mockito::Mock {
    server
        .mock("POST", "/auth/v1/token?grant_type=pkce")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await
}

async fn mock_verify(server: &mut ServerGuard, hits: usize) -> mockito::Mock {
    server
        .mock("POST", "/api/auth/verify-oauth-user")
        .match_body(Matcher::Json(
            serde_json::json!({"email": "user@example.com", "supabaseId": "sub-1"}),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token": "abc", "user": {"tokens": 5}}"#)
        .expect(hits)
        .create_async()
        .await
}

/// Sign in, mint a backend token, generate one animation.
#[tokio::test]
async fn test_sign_in_then_generate() {
    let dir = tempfile::tempdir().unwrap();
    let mut identity = Server::new_async().await;
    let mut backend = Server::new_async().await;
    let _pkce = mock_pkce(&mut identity).await;
    let verify = mock_verify(&mut backend, 1).await;
    let generate = backend
        .mock("POST", "/api/generate")
        .match_header("authorization", "Bearer abc")
        .match_body(Matcher::Json(serde_json::json!({"prompt": "Show a sine wave"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"videoUrl": "/v/1.mp4", "remainingTokens": 4}"#)
        .expect(1)
        .create_async()
        .await;

    let client = create_client(&dir.path().join("creds.db"), &identity.url(), &backend.url());

    client
        .provider
        .exchange_code("code-1", "verifier-1")
        .await
        .unwrap();
    assert_eq!(client.bridge.reconcile().await, SessionState::Authenticated);
    assert_eq!(client.bridge.profile().unwrap().balance(), 5);

    let controller = GenerationController::new(
        client.api.clone(),
        Arc::clone(&client.cache),
        Some(Duration::from_secs(5)),
    );
    assert_eq!(controller.state().tokens, 5);

    let SubmitOutcome::Settled(state) = controller.submit("Show a sine wave").await else {
        panic!("expected settled outcome");
    };
    assert_eq!(state.status, GenerationStatus::Complete);
    assert_eq!(state.result.unwrap().video_url, "/v/1.mp4");
    assert_eq!(state.tokens, 4);
    assert_eq!(client.cache.get().profile.unwrap().tokens, Some(4));

    verify.assert_async().await;
    generate.assert_async().await;
}

/// A restarted client reuses the stored session and credential without
/// another exchange.
#[tokio::test]
async fn test_restart_restores_session() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("creds.db");
    let mut identity = Server::new_async().await;
    let mut backend = Server::new_async().await;
    let _pkce = mock_pkce(&mut identity).await;
    let verify = mock_verify(&mut backend, 1).await;

    {
        let client = create_client(&db, &identity.url(), &backend.url());
        client
            .provider
            .exchange_code("code-1", "verifier-1")
            .await
            .unwrap();
        assert_eq!(client.bridge.reconcile().await, SessionState::Authenticated);
    }

    let restarted = create_client(&db, &identity.url(), &backend.url());
    assert_eq!(restarted.bridge.state(), SessionState::Uninitialized);
    assert!(restarted.bridge.is_authenticated());
    assert_eq!(
        restarted.bridge.reconcile().await,
        SessionState::Authenticated
    );

    verify.assert_async().await;
}

/// Sign-out clears the provider session and every cached credential, and the
/// generation API refuses to send without a credential.
#[tokio::test]
async fn test_sign_out_clears_everything() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("creds.db");
    let mut identity = Server::new_async().await;
    let mut backend = Server::new_async().await;
    let _pkce = mock_pkce(&mut identity).await;
    let logout = identity
        .mock("POST", "/auth/v1/logout")
        .match_header("authorization", "Bearer sb-access")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    let _verify = mock_verify(&mut backend, 1).await;
    let tokens = backend
        .mock("GET", "/api/user/tokens")
        .expect(0)
        .create_async()
        .await;

    let client = create_client(&db, &identity.url(), &backend.url());
    client
        .provider
        .exchange_code("code-1", "verifier-1")
        .await
        .unwrap();
    client.bridge.reconcile().await;

    client.bridge.sign_out().await.unwrap();

    assert_eq!(client.bridge.state(), SessionState::Unauthenticated);
    assert!(client.cache.get().is_empty());
    assert_eq!(client.provider.get_session().await.unwrap(), None);
    assert!(client.api.get_user_tokens().await.is_err());

    // Nothing survives on disk either
    let reopened = create_client(&db, &identity.url(), &backend.url());
    assert!(reopened.cache.get().is_empty());
    assert_eq!(
        reopened.bridge.reconcile().await,
        SessionState::Unauthenticated
    );

    logout.assert_async().await;
    tokens.assert_async().await;
}

/// A rejected exchange leaves the user signed out with a visible reason.
#[tokio::test]
async fn test_rejected_exchange_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut identity = Server::new_async().await;
    let mut backend = Server::new_async().await;
    let _pkce = mock_pkce(&mut identity).await;
    let _verify = backend
        .mock("POST", "/api/auth/verify-oauth-user")
        .with_status(403)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": "Account disabled"}"#)
        .create_async()
        .await;

    let client = create_client(&dir.path().join("creds.db"), &identity.url(), &backend.url());
    client
        .provider
        .exchange_code("code-1", "verifier-1")
        .await
        .unwrap();

    assert_eq!(
        client.bridge.reconcile().await,
        SessionState::Unauthenticated
    );
    assert!(client
        .bridge
        .last_error()
        .unwrap()
        .contains("Account disabled"));
    assert!(!client.bridge.is_authenticated());
    assert!(client.cache.get().credential.is_none());
}

/// The background bridge picks up a sign-in announced by the provider.
#[tokio::test]
async fn test_spawned_bridge_reacts_to_sign_in() {
    let dir = tempfile::tempdir().unwrap();
    let mut identity = Server::new_async().await;
    let mut backend = Server::new_async().await;
    let _pkce = mock_pkce(&mut identity).await;
    let _verify = mock_verify(&mut backend, 1).await;

    let client = create_client(&dir.path().join("creds.db"), &identity.url(), &backend.url());
    let mut states = client.bridge.subscribe_state();
    let handle = client.bridge.spawn(Duration::from_secs(60));

    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == SessionState::Unauthenticated),
    )
    .await
    .unwrap()
    .unwrap();

    client
        .provider
        .exchange_code("code-1", "verifier-1")
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == SessionState::Authenticated),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(client.cache.get().is_authenticated());

    handle.shutdown().await;
}

/// A stalled identity server cannot hold reconciliation hostage: the refresh
/// times out and the still-valid session keeps the user signed in.
#[tokio::test]
async fn test_stalled_identity_server_does_not_block_reconcile() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("creds.db");
    let mut identity = Server::new_async().await;
    let mut backend = Server::new_async().await;
    // Session inside the refresh margin
    let _pkce = mock_pkce_with_body(
        &mut identity,
        &TOKEN_BODY.replace("\"expires_in\": 3600", "\"expires_in\": 30"),
    )
    .await;
    let verify = mock_verify(&mut backend, 1).await;

    {
        let client = create_client(&db, &identity.url(), &backend.url());
        client
            .provider
            .exchange_code("code-1", "verifier-1")
            .await
            .unwrap();
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_url = format!("http://{}", listener.local_addr().unwrap());
    let stalled = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            open.push(socket);
        }
    });

    let client = create_client_with_timeout(
        &db,
        &stalled_url,
        &backend.url(),
        Duration::from_millis(200),
    );
    let state = tokio::time::timeout(Duration::from_secs(5), client.bridge.reconcile())
        .await
        .expect("reconcile hung on the identity server");
    assert_eq!(state, SessionState::Authenticated);
    assert!(client.cache.get().is_authenticated());

    verify.assert_async().await;
    stalled.abort();
}
