use anyhow::{Context, Result};

use crate::{
    block::{random_block, BlockStore},
    identity::ParticipantIdentity,
    plan::{BLOCK_TOPIC, DONE_STATE, PROVIDER_TOPIC, READY_DL_STATE, READY_STATE},
    runenv::RunEnv,
    sync::SyncChannel,
};

pub async fn run_provide(
    env: &RunEnv,
    sync: &SyncChannel,
    identity: &ParticipantIdentity,
    store: &dyn BlockStore,
) -> Result<()> {
    sync.publish(&PROVIDER_TOPIC, identity).await?;
    sync.signal_and_wait(&READY_STATE, env.instance_count).await?;

    let size = env.params.size;
    let block_count = env.params.block_count;

    // a handle is only published once its block is stored
    for i in 0..block_count {
        env.record_message(&format!("generating {size}-sized random block[{i}]"));
        let block = random_block(size);
        let handle = block.handle;

        store
            .put(block)
            .with_context(|| format!("could not store block[{i}] {handle}"))?;

        env.record_message(&format!("publishing block {handle}"));
        sync.publish(&BLOCK_TOPIC, &handle).await?;
    }

    sync.signal_and_wait(&READY_DL_STATE, env.instance_count).await?;
    sync.signal_and_wait(&DONE_STATE, env.instance_count).await?;

    Ok(())
}
