use serde_json::json;

use opgate_core::config::LoadOptions;

use crate::commands::{block_on_command, load_config, open_pool, CommandResult};

pub fn run(options: &LoadOptions) -> CommandResult {
    block_on_command("migrate", async {
        let config = load_config(options)?;
        let pool = open_pool(&config).await?;
        pool.close().await;
        Ok(("applied pending migrations".to_string(), json!({ "database_url": config.database.url })))
    })
}
