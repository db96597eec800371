use anyhow::Result;

use crate::config::Config;
use crate::models::{ContentScope, EntityType};

/// One row per entity type: whether the configured scope visits it.
pub fn source_rows(scope: ContentScope) -> Vec<(EntityType, &'static str)> {
    EntityType::ALL
        .into_iter()
        .map(|et| (et, if scope.enables(et) { "ENABLED" } else { "DISABLED" }))
        .collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    let scope: ContentScope = config.connector.content_scope.parse()?;

    println!(
        "{}/{}  scope: {}",
        config.connector.organization,
        config.connector.project,
        scope.as_str()
    );
    println!("{:<14} STATUS", "ENTITY");
    for (entity, status) in source_rows(scope) {
        println!("{:<14} {}", entity.as_str(), status);
    }
    if !config.connector.repositories.is_empty() {
        println!("repositories: {}", config.connector.repositories.join(", "));
    }

    Ok(())
}
