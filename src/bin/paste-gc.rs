use anyhow::Context;
use pastebin_lite::{config, paste_repo::paste_repository_capsule};
use time::OffsetDateTime;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let container = config::init_container().await?;

    let deleted = container
        .read(paste_repository_capsule)
        .delete_unavailable_pastes(OffsetDateTime::now_utc())
        .await
        .context("Failed to delete unavailable pastes")?;
    info!(deleted, "Deleted expired and exhausted pastes");
    Ok(())
}
