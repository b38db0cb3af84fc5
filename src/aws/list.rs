//! `list` subcommand for `aws`

use crate::aws::{
    deployer_directory, Error, Metadata, CREATED_FILE_NAME, DESTROYED_FILE_NAME,
    METADATA_FILE_NAME,
};
use std::fs::{self, File};
use tracing::info;

/// Lists all active deployments (created but not destroyed)
pub fn list() -> Result<(), Error> {
    // Check if the deployer directory exists
    let deployer_dir = deployer_directory(None);
    if !deployer_dir.exists() {
        info!("no deployments found");
        return Ok(());
    }

    // Collect active deployments
    let mut active = Vec::new();
    for entry in fs::read_dir(&deployer_dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }

        // Skip incomplete or destroyed deployments
        let created = path.join(CREATED_FILE_NAME);
        let destroyed = path.join(DESTROYED_FILE_NAME);
        if !created.exists() || destroyed.exists() {
            continue;
        }

        let metadata_path = path.join(METADATA_FILE_NAME);
        if !metadata_path.exists() {
            continue;
        }
        let file = File::open(&metadata_path)?;
        active.push(serde_yaml::from_reader::<_, Metadata>(file)?);
    }

    // Display results sorted by creation time (newest first)
    if active.is_empty() {
        info!("no active deployments");
    } else {
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for deployment in &active {
            info!(
                tag = deployment.tag.as_str(),
                environment = deployment.environment.as_str(),
                region = deployment.region.as_str(),
                created_at = deployment.created_at,
                siem = deployment.short_name.as_deref().unwrap_or("-"),
            );
        }
    }
    Ok(())
}
