// src/cli/admin.rs — One-shot maintenance commands

use crate::core::pricing::{self, CATALOG};
use crate::infra::config::Config;
use crate::store;

pub async fn cleanup_sessions(config: &Config) -> anyhow::Result<()> {
    let store = store::open(&config.storage)?;
    let removed = store.cleanup_expired_sessions().await?;
    println!("Removed {removed} expired session(s)");
    Ok(())
}

pub fn show_models(json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&pricing::catalog())?);
        return Ok(());
    }

    println!("{:<10} {:<28} {:>10} {:>10}", "PROVIDER", "MODEL", "IN/1M", "OUT/1M");
    for m in CATALOG {
        println!(
            "{:<10} {:<28} {:>10.2} {:>10.2}",
            m.provider.as_str(),
            m.id,
            m.input,
            m.output
        );
    }
    Ok(())
}
