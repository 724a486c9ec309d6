use anyhow::Result;
use tracing::info;

use gitpulse::config::Config;
use gitpulse::discovery;
use gitpulse::github::GithubClient;
use gitpulse::messaging::Bus;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    gitpulse::init_tracing(&config.rust_log);

    let bus = Bus::connect_with_retry(&config.rabbitmq_url).await?;
    let github = GithubClient::new(config.github_token.clone());

    info!("Discovery service started");
    discovery::run(&github, &bus).await;

    Ok(())
}
