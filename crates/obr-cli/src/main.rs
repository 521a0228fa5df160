use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use obr_digest::{Config, Pipeline};
use obr_sources::{
    build_client, AlgoraClient, Chat, GithubClient, HttpConfig, SlackBotChat, SlackWebhookChat,
};
use obr_store::ItemStore;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "obr")]
#[command(about = "Open Bounty Radar command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll both sources once and persist new items.
    Collect,
    /// Send the undelivered backlog as a chunked digest + CSV export.
    Digest,
    /// Wide-lookback catch-up collect, then digest.
    Bootstrap,
    /// Inject a dummy item and send a digest without marking anything.
    TestDigest,
    /// Refresh the cached profile-language set.
    Langs,
    /// Flip recently delivered items back to undelivered for a resend.
    ResetRecent {
        /// Cutoff in minutes (default: 7 days).
        #[arg(long, default_value_t = 10_080)]
        minutes: i64,
    },
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("obr=info,info"));
    fmt().with_env_filter(env_filter).init();
}

async fn build_pipeline(config: Config) -> Result<Pipeline> {
    let http = build_client(&HttpConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: config.user_agent.clone(),
    })?;

    let github = GithubClient::new(http.clone(), config.github_token.clone());
    let profile = GithubClient::new(http.clone(), config.github_token.clone());
    let algora = AlgoraClient::new(http.clone());
    let chat: Box<dyn Chat> = match (&config.slack_bot_token, &config.slack_webhook_url) {
        (Some(token), _) => Box::new(SlackBotChat::new(
            http.clone(),
            token.clone(),
            config.slack_channel.clone(),
            config.slack_unfurl,
        )),
        (None, Some(webhook)) => Box::new(SlackWebhookChat::new(http, webhook.clone())),
        (None, None) => unreachable!("Config::from_env requires one chat credential"),
    };

    let store = ItemStore::open(&config.db_path).await?;
    Ok(Pipeline::new(
        config,
        store,
        Box::new(github),
        Box::new(algora),
        chat,
        Box::new(profile),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let pipeline = build_pipeline(config).await?;

    match cli.command.unwrap_or(Commands::Collect) {
        Commands::Collect => {
            let report = pipeline.collect(pipeline.config().window_minutes).await?;
            info!(status = %report.status(), "collect run finished");
            println!(
                "collect {}: gh +{} (~{} updated), bounties +{}, fallback={}",
                report.status(),
                report.issue_search.inserted,
                report.issue_search.updated,
                report.bounty_platform.inserted,
                report.fallback_used,
            );
        }
        Commands::Digest => {
            let report = pipeline.digest(true).await?;
            println!(
                "digest {}: {} items, {}/{} chunks sent, {} marked delivered",
                report.status,
                report.selected,
                report.chunks_sent,
                report.chunks_total,
                report.marked_delivered,
            );
        }
        Commands::Bootstrap => {
            let (collected, digested) = pipeline.bootstrap().await?;
            println!(
                "bootstrap: collect {} (+{} items), digest {} ({} marked)",
                collected.status(),
                collected.issue_search.inserted + collected.bounty_platform.inserted,
                digested.status,
                digested.marked_delivered,
            );
        }
        Commands::TestDigest => {
            let report = pipeline.test_digest().await?;
            println!(
                "test digest {}: {} items rendered, {}/{} chunks sent, nothing marked",
                report.status, report.selected, report.chunks_sent, report.chunks_total,
            );
        }
        Commands::Langs => {
            let languages = pipeline.refresh_languages().await?;
            println!("profile languages refreshed: {}", languages.join(", "));
        }
        Commands::ResetRecent { minutes } => {
            let reset = pipeline.reset_recent(minutes).await?;
            println!("reset {reset} item(s) back to undelivered");
        }
    }

    Ok(())
}
