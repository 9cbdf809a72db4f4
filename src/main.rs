use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use manim_ai::config::{load_config, ClientConfig};
use manim_ai::credentials::{CredentialCache, LocalStorage};
use manim_ai::generation::{GenerationController, GenerationStatus, SubmitOutcome};
use manim_ai::identity::{run_loopback_login, SupabaseAuth};
use manim_ai::session::{SessionBridge, SessionState, TokenExchange};
use manim_ai::ApiClient;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_CONFIG_FILE: &str = "manim-ai.toml";

#[derive(Parser)]
#[command(name = "manim-ai")]
#[command(about = "Sign in and generate Manim animations from a text prompt")]
struct Cli {
    /// Config file (defaults to ./manim-ai.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with Google through the browser
    Login,
    /// Sign out and forget cached credentials
    Logout,
    /// Show who is signed in
    Status,
    /// Show the credit balance
    Tokens,
    /// Generate an animation
    Generate {
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
        /// Also download the video to this file (or directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Download a generated video
    Download {
        /// Video URL or path as shown by `generate` or `history`
        video_url: String,
        /// Destination file or directory (defaults to ./animation-<timestamp>.mp4)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List previous animations
    History,
    /// Check that the backend is reachable
    Health,
    /// Keep the session reconciled and print changes until Ctrl-C
    Watch,
}

/// Wired client components.
struct App {
    config: ClientConfig,
    cache: Arc<CredentialCache>,
    provider: Arc<SupabaseAuth>,
    bridge: Arc<SessionBridge>,
    api: Arc<ApiClient>,
}

impl App {
    fn build(config: ClientConfig) -> Result<Self> {
        let storage = Arc::new(
            LocalStorage::open(&config.storage.path, config.storage.encryption_key.as_deref())
                .context("Failed to open credential storage")?,
        );
        let cache = Arc::new(CredentialCache::new(Arc::clone(&storage)));

        let provider = Arc::new(
            SupabaseAuth::new(
                &config.identity.url,
                &config.identity.anon_key,
                storage,
                config.identity.request_timeout(),
            )?
            .with_refresh_margin(config.identity.refresh_margin()),
        );

        let exchange = TokenExchange::new(
            &config.backend.url,
            Arc::clone(&cache),
            config.backend.request_timeout(),
        )?;
        let bridge = Arc::new(SessionBridge::new(
            provider.clone(),
            exchange,
            Arc::clone(&cache),
        ));

        let api = Arc::new(ApiClient::new(
            &config.backend.url,
            Arc::clone(&cache),
            config.backend.request_timeout(),
        )?);

        Ok(Self {
            config,
            cache,
            provider,
            bridge,
            api,
        })
    }

    async fn require_sign_in(&self) -> Result<()> {
        if self.bridge.reconcile().await == SessionState::Authenticated {
            return Ok(());
        }
        match self.bridge.last_error() {
            Some(message) => bail!("{}", message),
            None => bail!("Not signed in. Run `manim-ai login` first."),
        }
    }

    async fn download(&self, video_url: &str, output: Option<&Path>) -> Result<()> {
        let dest = video_destination(output);
        let bytes = self
            .api
            .download_video(video_url, &dest)
            .await
            .map_err(|e| anyhow!("Failed to download video: {}", e.user_message()))?;
        println!("Saved {} ({} bytes)", dest.display(), bytes);
        Ok(())
    }
}

/// `animation-<unix millis>.mp4`, placed inside `output` when it is a directory.
fn video_destination(output: Option<&Path>) -> PathBuf {
    let file_name = format!("animation-{}.mp4", chrono::Utc::now().timestamp_millis());
    match output {
        Some(path) if path.is_dir() => path.join(file_name),
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(file_name),
    }
}

fn read_config(path: Option<&Path>) -> Result<ClientConfig> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => load_config(DEFAULT_CONFIG_FILE)?,
        None => ClientConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "manim_ai=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = read_config(cli.config.as_deref())?;
    debug!(backend = %config.backend.url, identity = %config.identity.url, "Configuration loaded");

    let app = App::build(config)?;

    match cli.command {
        Commands::Login => login(&app).await,
        Commands::Logout => {
            app.bridge.sign_out().await?;
            println!("Signed out.");
            Ok(())
        }
        Commands::Status => status(&app).await,
        Commands::Tokens => tokens(&app).await,
        Commands::Generate { prompt, output } => {
            generate(&app, &prompt.join(" "), output.as_deref()).await
        }
        Commands::Download { video_url, output } => {
            app.download(&video_url, output.as_deref()).await
        }
        Commands::History => history(&app).await,
        Commands::Health => health(&app).await,
        Commands::Watch => watch(&app).await,
    }
}

async fn login(app: &App) -> Result<()> {
    run_loopback_login(
        app.provider.as_ref(),
        app.config.identity.callback_port,
        app.config.identity.login_timeout(),
        |url| println!("Open this URL in your browser to sign in:\n\n  {}\n", url),
    )
    .await?;

    app.require_sign_in().await?;
    if let Some(profile) = app.bridge.profile() {
        println!(
            "Signed in as {} ({} plan, {} credits).",
            profile.email,
            profile.plan,
            profile.balance()
        );
    }
    Ok(())
}

async fn status(app: &App) -> Result<()> {
    match app.bridge.reconcile().await {
        SessionState::Authenticated => {
            if let Some(profile) = app.bridge.profile() {
                println!("Signed in as {}", profile.email);
                println!("Plan:    {}", profile.plan);
                println!("Credits: {}", profile.balance());
            }
        }
        _ => {
            println!("Not signed in.");
            if let Some(message) = app.bridge.last_error() {
                println!("{}", message);
            }
        }
    }
    Ok(())
}

async fn tokens(app: &App) -> Result<()> {
    app.require_sign_in().await?;
    let controller = GenerationController::new(app.api.clone(), Arc::clone(&app.cache), None);
    let tokens = controller
        .refresh_balance()
        .await
        .map_err(|e| anyhow!(e.user_message()))?;
    println!("{} credits", tokens);
    Ok(())
}

async fn generate(app: &App, prompt: &str, output: Option<&Path>) -> Result<()> {
    app.require_sign_in().await?;
    let controller = GenerationController::new(
        app.api.clone(),
        Arc::clone(&app.cache),
        app.config.generation.timeout(),
    );

    println!("Generating animation...");
    let state = match controller.submit(prompt).await {
        SubmitOutcome::Rejected(_) => bail!("Please enter a prompt."),
        SubmitOutcome::Busy => bail!("A generation is already running."),
        SubmitOutcome::Settled(state) => state,
    };

    match (state.status, state.result) {
        (GenerationStatus::Complete, Some(result)) => {
            println!("Video: {}", app.api.asset_url(&result.video_url));
            if let Some(code_url) = &result.code_url {
                println!("Code:  {}", app.api.asset_url(code_url));
            }
            println!("Remaining credits: {}", state.tokens);
            if output.is_some() {
                app.download(&result.video_url, output).await?;
            }
            Ok(())
        }
        _ => Err(anyhow!(state
            .error
            .unwrap_or_else(|| "Generation did not complete.".to_string()))),
    }
}

async fn history(app: &App) -> Result<()> {
    app.require_sign_in().await?;
    let animations = app
        .api
        .animation_history()
        .await
        .map_err(|e| anyhow!(e.user_message()))?;

    if animations.is_empty() {
        println!("No animations yet.");
    }
    for item in animations {
        println!("{}  {}", item.created_at, item.prompt);
        println!("    {}", app.api.asset_url(&item.video_url));
    }
    Ok(())
}

async fn health(app: &App) -> Result<()> {
    if app.api.check_health().await {
        println!("Backend at {} is healthy.", app.api.base_url());
        Ok(())
    } else {
        bail!("Backend at {} is not reachable.", app.api.base_url())
    }
}

async fn watch(app: &App) -> Result<()> {
    let mut states = app.bridge.subscribe_state();
    let handle = app.bridge.spawn(app.config.session.poll_interval());
    info!("Watching session, press Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                match (state, app.bridge.profile()) {
                    (SessionState::Authenticated, Some(profile)) => {
                        println!("authenticated: {} ({} credits)", profile.email, profile.balance());
                    }
                    (SessionState::Unauthenticated, _) => match app.bridge.last_error() {
                        Some(message) => println!("signed out: {}", message),
                        None => println!("signed out"),
                    },
                    (SessionState::Authenticated, None) => println!("authenticated"),
                    (SessionState::Checking, _) => println!("checking session..."),
                    (SessionState::Uninitialized, _) => {}
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    handle.shutdown().await;
    Ok(())
}
