use lagoon_ident::irc::config::ServerConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("lagoon-ident — nick and identity sync for the Lagun mesh");

    let config = ServerConfig::from_env();
    info!(
        server = %config.server_name,
        sid = %config.sid,
        peers = config.peers.len(),
        nick_delay_secs = config.nick_delay_secs,
        "configuration loaded"
    );

    lagoon_ident::irc::connection::run(config).await
}
