use {
    anyhow::{Context, Result},
    chatgate_config::ChatgateConfig,
    chatgate_whatsapp::{CredentialStore, FileCredentialStore},
    tracing::info,
};

/// Delete the stored session credentials so the next connect has to enroll
/// a new device.
pub async fn logout(config: &ChatgateConfig) -> Result<()> {
    let store = FileCredentialStore::new(&config.whatsapp.auth_dir);
    let current = store
        .load()
        .await
        .with_context(|| format!("failed to read credentials in {}", store.dir().display()))?;

    if current.is_empty() {
        println!("No stored session in {}", store.dir().display());
        return Ok(());
    }

    store.clear().await?;
    info!(dir = %store.dir().display(), revision = current.revision, "credentials cleared");
    println!("Logged out; the next start will print a new QR code.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[tokio::test]
    async fn logout_clears_saved_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ChatgateConfig::default();
        config.whatsapp.auth_dir = tmp.path().join("auth");

        let store = FileCredentialStore::new(&config.whatsapp.auth_dir);
        store.save(json!({"me": "42"})).await.unwrap();

        logout(&config).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());

        // Nothing stored: still fine.
        logout(&config).await.unwrap();
    }
}
