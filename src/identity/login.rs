//! Interactive OAuth sign-in through a loopback redirect.

use super::callback::{create_callback_router, CallbackState, PendingLogins};
use super::{pkce, IdentityProvider, IdentitySession};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Path the provider redirects back to.
pub const CALLBACK_PATH: &str = "/auth/callback";

/// Runs the redirect flow end to end.
///
/// Binds `127.0.0.1:<port>`, hands the authorization URL to `open_url` (print
/// it, launch a browser…), waits up to `timeout` for the redirect, then
/// exchanges the code with the provider. The provider announces `SignedIn`
/// on success, which the session bridge picks up.
pub async fn run_loopback_login<F>(
    provider: &dyn IdentityProvider,
    port: u16,
    timeout: Duration,
    open_url: F,
) -> Result<IdentitySession>
where
    F: FnOnce(&str),
{
    let code_verifier = pkce::generate_code_verifier();
    let challenge = pkce::code_challenge(&code_verifier);

    let pending = PendingLogins::new(timeout.as_secs() as i64);
    let csrf_state = pending.create(&code_verifier);

    let (outcomes, mut outcome_rx) = mpsc::channel(1);
    let router = create_callback_router(CallbackState { pending, outcomes });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind callback listener on port {}", port))?;
    let bound = listener
        .local_addr()
        .context("Failed to read callback listener address")?;
    debug!(addr = %bound, "Callback listener ready");

    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    let redirect_to = format!(
        "http://127.0.0.1:{}{}?state={}",
        bound.port(),
        CALLBACK_PATH,
        csrf_state
    );
    open_url(&provider.authorize_url(&redirect_to, &challenge));

    let outcome = tokio::time::timeout(timeout, outcome_rx.recv()).await;
    server.abort();

    let code = match outcome {
        Err(_) => return Err(anyhow!("Timed out waiting for sign-in")),
        Ok(None) => return Err(anyhow!("Callback listener stopped unexpectedly")),
        Ok(Some(Err(reason))) => return Err(anyhow!("Sign-in failed: {}", reason)),
        Ok(Some(Ok(code))) => code,
    };

    let session = provider
        .exchange_code(&code.code, &code.code_verifier)
        .await
        .context("Failed to complete sign-in")?;

    info!(email = %session.email, "Sign-in completed");
    Ok(session)
}
