use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use log::debug;

use crate::{
    exchange::Exchange,
    plan::{BLOCK_TOPIC, DONE_STATE, PROVIDER_TOPIC, READY_DL_STATE, READY_STATE},
    runenv::{RunEnv, Stat},
    sync::SyncChannel,
};

pub async fn run_request(env: &RunEnv, sync: &SyncChannel, exchange: &dyn Exchange) -> Result<()> {
    let provider_count = env
        .params
        .provider_count
        .ok_or_else(|| anyhow!("requestors need the provider_count parameter"))?;

    let mut providers = sync.subscribe(&PROVIDER_TOPIC).await?;
    for i in 0..provider_count {
        let provider = providers.next().await?;
        env.record_message(&format!("connecting to provider provider[{i}]: {provider}"));

        exchange
            .connect(&provider)
            .await
            .with_context(|| format!("could not connect to provider[{i}] {provider}"))?;

        env.record_message(&format!("requester connected to provider[{i}]: {provider}"));
    }
    providers.done();

    env.record_message("connected to all providers");

    // tell the providers we are ready for them to publish blocks
    sync.signal_and_wait(&READY_STATE, env.instance_count).await?;
    // then wait until everyone is ready for downloads to start
    sync.signal_and_wait(&READY_DL_STATE, env.instance_count).await?;

    let mut handles = sync
        .subscribe(&BLOCK_TOPIC)
        .await
        .context("could not subscribe to block topic")?;

    let block_count = env.params.block_count;
    let begin = Instant::now();

    // one fetch at a time, the aggregate duration is meant to be latency-bound
    for i in 0..block_count {
        let handle = handles.next().await?;
        env.record_message(&format!("downloading block[{i}] {handle}"));

        let dl_begin = Instant::now();
        let block = exchange
            .get_block(&handle)
            .await
            .with_context(|| format!("could not download block[{i}] {handle}"))?;
        let duration = dl_begin.elapsed();
        debug!("Fetched {} bytes of block[{i}] in {duration:?}. ", block.len());

        env.record_stat(&Stat::SingleDownloadSpeed {
            content_id: block.handle,
            duration,
        });
    }

    let total_duration = begin.elapsed();
    env.record_stat(&Stat::MultipleDownloadSpeed {
        block_count,
        total_duration,
    });
    handles.done();

    sync.signal_entry(&DONE_STATE).await?;
    Ok(())
}
