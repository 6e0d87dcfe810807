use clap::Args;
use stowaway_core::{Action, MutationQueue};

use super::{open_store, parse_json, runtime, CommandError};
use crate::config::Config;

/// Record a mutation for later replay
#[derive(Debug, Args)]
pub struct EnqueueCommand {
    /// Action tag, e.g. "diet.upsert"
    pub tag: String,

    /// JSON payload, e.g. '{"id": "X", "lote_id": "L1"}'
    pub payload: String,
}

impl EnqueueCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        let payload = parse_json(&self.payload)?;
        let action = Action::parse(&self.tag, payload, &config.catalog)?;

        let rt = runtime()?;
        let id = rt.block_on(async {
            let store = open_store(config).await?;
            let id = MutationQueue::new(store.clone()).try_enqueue(&action).await;
            store.close().await;
            id.map_err(CommandError::from)
        })?;

        println!("{}", id);
        Ok(())
    }
}
