use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use certpilot::acme::AccountAuthority;
use certpilot::oauth::OAuthLogin;
use certpilot::platform::{PlatformClient, StaticToken, TokenProvider};
use certpilot::policy::Probabilistic;
use certpilot::scheduler::LocalScheduler;
use certpilot::server::{AppState, OperatorAuth, SelfTestTarget};
use certpilot::store::JsonStore;
use certpilot::upload::{UploadRequest, upload_and_map};
use certpilot::workflow::{Workflow, WorkflowOptions};
use certpilot::{Settings, server, status};
use clap::{Args, Parser, Subcommand};
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (default: certpilot.toml)
    #[arg(long, short, env = "CERTPILOT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Serve the HTTP routes and run queued workflow stages
    Serve,
    /// Print certificates, domain mappings and operations
    Status,
    /// Upload an existing certificate and map domains to it
    Upload(UploadArgs),
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// PEM file with the certificate chain, leaf first
    #[arg(long)]
    fullchain: PathBuf,

    /// PEM file with the private key
    #[arg(long)]
    key: PathBuf,

    /// Domain to map to the uploaded certificate (repeatable or comma-separated)
    #[arg(long = "domain", required = true, value_delimiter = ',')]
    domains: Vec<String>,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run() {
        eprintln!("certpilot error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config).context("Failed to load configuration")?;
    settings.validate()?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to initialize async runtime")?;
    match cli.command {
        CliCommand::Serve => runtime.block_on(run_serve(settings)),
        CliCommand::Status => runtime.block_on(run_status(&settings)),
        CliCommand::Upload(args) => runtime.block_on(run_upload(&settings, &args)),
    }
}

async fn run_serve(settings: Settings) -> Result<()> {
    let store = Arc::new(
        JsonStore::open(&settings.store_path)
            .await
            .context("Failed to open store")?,
    );

    let oauth = match &settings.oauth {
        Some(oauth) => Some(Arc::new(OAuthLogin::new(oauth.clone(), store.clone())?)),
        None => None,
    };
    let tokens: Arc<dyn TokenProvider> = match (static_token(&settings), &oauth) {
        (Some(token), _) => token,
        (None, Some(oauth)) => oauth.clone() as Arc<dyn TokenProvider>,
        (None, None) => {
            anyhow::bail!("Either platform.access_token or the [oauth] section must be set")
        }
    };
    let host = Arc::new(PlatformClient::new(&settings.platform, tokens)?);
    let authority = Arc::new(AccountAuthority::new(
        store.clone(),
        settings.server.clone(),
        settings.email.clone(),
        settings.acme.clone(),
    ));

    let options = WorkflowOptions::from_settings(&settings);
    let workflow = Arc::new(Workflow::new(
        store.clone(),
        authority,
        host.clone(),
        options,
    ));
    let scheduler = LocalScheduler::new(workflow.clone(), options.retry);

    let self_test = settings
        .self_test
        .base_url
        .clone()
        .filter(|url| !url.trim().is_empty())
        .map(|base_url| SelfTestTarget {
            base_url,
            timeout: Duration::from_secs(settings.self_test.timeout_secs),
        });
    let state = Arc::new(AppState {
        workflow,
        queue: Arc::new(scheduler.clone()),
        host,
        operations: store,
        cleanup: Arc::new(Probabilistic::new(settings.workflow.cleanup_probability)),
        oauth,
        auth: OperatorAuth::new(&settings.admin.token),
        expiry: settings.workflow.expiry_policy(),
        renew_before: settings.workflow.renew_before,
        self_test,
        http: reqwest::Client::new(),
    });

    server::serve(&settings.listen_addr, state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Shutdown signal handler error: {err}");
        }
        warn!("Shutdown signal received");
    })
    .await?;

    let pending = scheduler.pending().await;
    if pending > 0 {
        warn!("Exiting with {} queued tasks", pending);
    }
    Ok(())
}

async fn run_status(settings: &Settings) -> Result<()> {
    let store = JsonStore::open(&settings.store_path)
        .await
        .context("Failed to open store")?;
    let host = cli_platform(settings)?;
    let mut report = status::collect_status(
        &host,
        &store,
        settings.workflow.expiry_policy(),
        OffsetDateTime::now_utc(),
    )
    .await?;
    if let Some(base_url) = &settings.self_test.base_url {
        let timeout = Duration::from_secs(settings.self_test.timeout_secs);
        let client = reqwest::Client::new();
        report.self_test = Some(status::self_test(&client, base_url, timeout).await);
    }
    print!("{}", report.render_text());
    Ok(())
}

async fn run_upload(settings: &Settings, args: &UploadArgs) -> Result<()> {
    let chain_pem = tokio::fs::read_to_string(&args.fullchain)
        .await
        .with_context(|| format!("Failed to read {}", args.fullchain.display()))?;
    let key_pem = tokio::fs::read_to_string(&args.key)
        .await
        .with_context(|| format!("Failed to read {}", args.key.display()))?;
    let host = cli_platform(settings)?;

    let summary = upload_and_map(
        &host,
        &UploadRequest {
            chain_pem,
            key_pem,
            domains: args.domains.clone(),
        },
    )
    .await?;
    info!(
        "Uploaded {} as certificate {}",
        summary.display_name, summary.certificate_id
    );
    for domain in &summary.mapped {
        println!("mapped {domain} -> {}", summary.certificate_id);
    }
    if !summary.failed.is_empty() {
        anyhow::bail!("Failed to map: {}", summary.failed.join(", "));
    }
    Ok(())
}

fn static_token(settings: &Settings) -> Option<Arc<dyn TokenProvider>> {
    settings
        .platform
        .access_token
        .clone()
        .filter(|token| !token.trim().is_empty())
        .map(|token| Arc::new(StaticToken::new(token)) as Arc<dyn TokenProvider>)
}

/// Platform client for one-shot commands, which never touch the stored OAuth login.
fn cli_platform(settings: &Settings) -> Result<PlatformClient> {
    let tokens = static_token(settings)
        .context("platform.access_token is required for this command")?;
    PlatformClient::new(&settings.platform, tokens)
}
