use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use log::{debug, info};
use tokio::task::JoinSet;

use crate::{
    block::{BlockStore, MemoryBlockStore},
    config::SimulationConfig,
    exchange::{Exchange, MemoryExchange, MemoryNetwork},
    identity::ParticipantIdentity,
    network::NetworkSettings,
    plan::{Participant, Plan, PROVIDERS_GROUP, REQUESTORS_GROUP},
    runenv::{EventKind, RunEnv, Sink, Stat},
    sync::{SyncChannel, SyncClient},
};

/// Runs a whole cohort as tasks of this process, with blocks moving through a
/// `MemoryNetwork` instead of sockets.
pub struct Simulation {
    config: SimulationConfig,
    sync: Arc<dyn SyncClient>,
    network: Arc<MemoryNetwork>,
    sink: Arc<Sink>,
}

impl Simulation {
    pub fn new(config: SimulationConfig, sync: Arc<dyn SyncClient>, sink: Arc<Sink>) -> Self {
        Self {
            config,
            sync,
            network: Arc::new(MemoryNetwork::new()),
            sink,
        }
    }

    #[cfg(test)]
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Aggregate measurements recorded so far, in recording order. Empty
    /// unless the sink retains events.
    pub fn summary(&self) -> Vec<(String, usize, Duration)> {
        self.sink
            .events()
            .into_iter()
            .filter_map(|event| match event.kind {
                EventKind::Stat {
                    stat: Stat::MultipleDownloadSpeed { block_count, total_duration },
                } => Some((event.participant, block_count, total_duration)),
                _ => None,
            })
            .collect()
    }

    pub async fn run(&self) -> Result<()> {
        self.run_with(|network| Arc::new(MemoryExchange::new(network)) as Arc<dyn Exchange>).await
    }

    /// Like `run`, with every participant's exchange built by `make_exchange`.
    pub async fn run_with<F>(&self, make_exchange: F) -> Result<()>
    where
        F: Fn(Arc<MemoryNetwork>) -> Arc<dyn Exchange>,
    {
        let providers = (0..self.config.providers).map(|i| (format!("provider-{i}"), PROVIDERS_GROUP));
        let requestors = (0..self.config.requestors).map(|i| (format!("requestor-{i}"), REQUESTORS_GROUP));
        let cohort: Vec<(String, &str)> = providers.chain(requestors).collect();

        let instance_count = cohort.len() as u64;
        let mut params = self.config.params.clone();
        params.provider_count.get_or_insert(self.config.providers);

        info!(
            "Simulating run {} with {} provider(s) and {} requestor(s). ",
            self.config.run_id, self.config.providers, self.config.requestors
        );

        let mut tasks = JoinSet::new();

        for (name, group) in cohort {
            let identity = ParticipantIdentity::new(name.clone(), vec![]);
            let store = Arc::new(MemoryBlockStore::new());
            self.network.register(identity.id, store.clone())?;

            let participant = Participant {
                identity,
                store: store as Arc<dyn BlockStore>,
                exchange: make_exchange(self.network.clone()),
            };

            let env = RunEnv::new(
                name,
                self.config.run_id.clone(),
                self.config.test_case.clone(),
                group.to_string(),
                instance_count,
                params.clone(),
                self.sink.clone(),
            );

            let sync = SyncChannel::new(self.sync.clone(), &self.config.run_id)
                .with_timeout(Duration::from_secs(self.config.barrier_timeout));
            let settings = self.config.network.clone();

            debug!("Starting {}. ", participant.identity);
            tasks.spawn(async move {
                let result = run_participant(&env, &sync, &settings, &participant).await;
                env.record_outcome(&result);
                (env.participant, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (name, result) = joined?;

            if let Err(e) = result {
                // the others would wait on barriers forever
                tasks.abort_all();
                return Err(e).with_context(|| format!("participant {name} failed"));
            }

            debug!("{name} finished. ");
        }

        info!("All {instance_count} instance(s) of run {} finished. ", self.config.run_id);
        Ok(())
    }
}

async fn run_participant(
    env: &RunEnv,
    sync: &SyncChannel,
    settings: &NetworkSettings,
    participant: &Participant,
) -> Result<()> {
    let plan = Plan::prepare(env, sync, settings).await?;
    plan.run(env, sync, participant).await
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Instant};

    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        block::{Block, ContentHandle},
        plan::{tests::params, BLOCK_TOPIC, DONE_STATE},
        sync::{Subscription, SyncService},
    };

    fn config(providers: usize, requestors: usize, size: usize, block_count: usize) -> SimulationConfig {
        SimulationConfig {
            run_id: "sim".into(),
            test_case: "speed-test".into(),
            providers,
            requestors,
            barrier_timeout: 600,
            network: NetworkSettings::default(),
            results_path: None,
            params: params(size, block_count, None),
        }
    }

    fn stats_of(sink: &Sink, participant: &str) -> Vec<Stat> {
        sink.events_of(participant)
            .into_iter()
            .filter_map(|kind| match kind {
                EventKind::Stat { stat } => Some(stat),
                _ => None,
            })
            .collect()
    }

    async fn published_handles(sync: Arc<dyn SyncClient>, count: usize) -> Vec<ContentHandle> {
        let channel = SyncChannel::new(sync, "sim");
        let mut sub = channel.subscribe(&BLOCK_TOPIC).await.unwrap();

        let mut handles = vec![];
        for _ in 0..count {
            handles.push(sub.next().await.unwrap());
        }
        handles
    }

    /// Notes when each state was signalled, before the service sees it.
    struct RecordingSync {
        inner: SyncService,
        signals: Mutex<Vec<(String, Instant)>>,
    }

    #[async_trait]
    impl SyncClient for RecordingSync {
        async fn publish(&self, topic: &str, payload: Value) -> Result<u64> {
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription<Value>> {
            self.inner.subscribe(topic).await
        }

        async fn signal_entry(&self, state: &str) -> Result<u64> {
            self.signals.lock().unwrap().push((state.to_string(), Instant::now()));
            self.inner.signal_entry(state).await
        }

        async fn barrier(&self, state: &str, target: u64) -> Result<u64> {
            self.inner.barrier(state, target).await
        }
    }

    /// Counts connections and notes when each fetch started.
    struct TimedExchange {
        inner: MemoryExchange,
        connects: Arc<Mutex<usize>>,
        fetches: Arc<Mutex<Vec<Instant>>>,
    }

    impl TimedExchange {
        fn factory(
            connects: &Arc<Mutex<usize>>,
            fetches: &Arc<Mutex<Vec<Instant>>>,
        ) -> impl Fn(Arc<MemoryNetwork>) -> Arc<dyn Exchange> {
            let connects = connects.clone();
            let fetches = fetches.clone();
            move |network| {
                Arc::new(TimedExchange {
                    inner: MemoryExchange::new(network),
                    connects: connects.clone(),
                    fetches: fetches.clone(),
                }) as Arc<dyn Exchange>
            }
        }
    }

    #[async_trait]
    impl Exchange for TimedExchange {
        async fn connect(&self, peer: &ParticipantIdentity) -> Result<()> {
            *self.connects.lock().unwrap() += 1;
            self.inner.connect(peer).await
        }

        async fn get_block(&self, handle: &ContentHandle) -> Result<Block> {
            self.fetches.lock().unwrap().push(Instant::now());
            self.inner.get_block(handle).await
        }
    }

    struct BrokenExchange;

    #[async_trait]
    impl Exchange for BrokenExchange {
        async fn connect(&self, _: &ParticipantIdentity) -> Result<()> {
            Ok(())
        }

        async fn get_block(&self, handle: &ContentHandle) -> Result<Block> {
            Err(anyhow!("link down while fetching {handle}"))
        }
    }

    #[tokio::test]
    async fn one_provider_one_requestor() {
        let sync: Arc<dyn SyncClient> = Arc::new(SyncService::spawn());
        let sink = Arc::new(Sink::retaining());
        let simulation = Simulation::new(config(1, 1, 1024, 3), sync.clone(), sink.clone());
        let connects = Arc::new(Mutex::new(0));
        let fetches = Arc::new(Mutex::new(vec![]));

        simulation.run_with(TimedExchange::factory(&connects, &fetches)).await.unwrap();
        assert_eq!(*connects.lock().unwrap(), 1);
        assert_eq!(fetches.lock().unwrap().len(), 3);

        let stats = stats_of(&sink, "requestor-0");
        assert_eq!(stats.len(), 4);

        let mut fetched = vec![];
        let mut sum = Duration::ZERO;
        for stat in &stats[..3] {
            match stat {
                Stat::SingleDownloadSpeed { content_id, duration } => {
                    fetched.push(*content_id);
                    sum += *duration;
                },
                other => panic!("unexpected stat {other:?}"),
            }
        }

        match &stats[3] {
            Stat::MultipleDownloadSpeed { block_count, total_duration } => {
                assert_eq!(*block_count, 3);
                assert!(*total_duration >= sum);
            },
            other => panic!("unexpected stat {other:?}"),
        }

        assert_eq!(fetched, published_handles(sync.clone(), 3).await);

        let provider = ParticipantIdentity::new("provider-0".into(), vec![]);
        let store = simulation.network().store(&provider.id).unwrap().unwrap();
        assert_eq!(store.len().unwrap(), 3);
        for handle in &fetched {
            assert_eq!(store.get(handle).unwrap().unwrap().len(), 1024);
        }

        let summary = simulation.summary();
        assert_eq!(summary.len(), 1);
        assert_eq!((summary[0].0.as_str(), summary[0].1), ("requestor-0", 3));

        assert_eq!(sink.events_of("provider-0").last(), Some(&EventKind::Success));
        assert_eq!(sink.events_of("requestor-0").last(), Some(&EventKind::Success));

        let channel = SyncChannel::new(sync, "sim");
        assert_eq!(channel.barrier(&DONE_STATE, 2).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn every_requestor_fetches_every_block_in_order() {
        for block_count in [0, 1, 5] {
            let sync: Arc<dyn SyncClient> = Arc::new(SyncService::spawn());
            let sink = Arc::new(Sink::retaining());
            let simulation = Simulation::new(config(1, 2, 64, block_count), sync.clone(), sink.clone());

            simulation.run().await.unwrap();
            let published = published_handles(sync, block_count).await;

            for requestor in ["requestor-0", "requestor-1"] {
                let stats = stats_of(&sink, requestor);
                assert_eq!(stats.len(), block_count + 1);

                let fetched: Vec<ContentHandle> = stats
                    .iter()
                    .filter_map(|stat| match stat {
                        Stat::SingleDownloadSpeed { content_id, .. } => Some(*content_id),
                        _ => None,
                    })
                    .collect();
                assert_eq!(fetched, published);

                assert!(matches!(
                    stats.last(),
                    Some(Stat::MultipleDownloadSpeed { block_count: n, .. }) if *n == block_count,
                ));
            }
        }
    }

    #[tokio::test]
    async fn fetches_start_after_everyone_is_ready_to_download() {
        let recording = Arc::new(RecordingSync {
            inner: SyncService::spawn(),
            signals: Mutex::new(vec![]),
        });
        let sink = Arc::new(Sink::retaining());
        let fetches = Arc::new(Mutex::new(vec![]));

        let simulation = Simulation::new(config(2, 2, 256, 4), recording.clone(), sink);
        let connects = Arc::new(Mutex::new(0));
        simulation.run_with(TimedExchange::factory(&connects, &fetches)).await.unwrap();
        assert_eq!(*connects.lock().unwrap(), 4);

        let signals = recording.signals.lock().unwrap();
        let ready: Vec<Instant> = signals
            .iter()
            .filter(|(state, _)| state.ends_with(":state:ready-to-download"))
            .map(|(_, at)| *at)
            .collect();
        assert_eq!(ready.len(), 4);
        let last_ready = ready.into_iter().max().unwrap();

        let fetches = fetches.lock().unwrap();
        assert_eq!(fetches.len(), 8);
        assert!(fetches.iter().all(|at| *at >= last_ready));
    }

    #[tokio::test]
    async fn unknown_test_case_fails_the_run() {
        let sync: Arc<dyn SyncClient> = Arc::new(SyncService::spawn());
        let sink = Arc::new(Sink::retaining());
        let mut config = config(1, 1, 64, 1);
        config.test_case = "latency-test".into();

        let err = Simulation::new(config, sync, sink.clone()).run().await.unwrap_err();
        assert!(format!("{err:#}").contains("unknown test case latency-test"));

        let failures = sink
            .events()
            .into_iter()
            .filter(|event| matches!(event.kind, EventKind::Failure { .. }))
            .count();
        assert!(failures >= 1);
    }

    #[tokio::test]
    async fn unreachable_rendezvous_fails_instead_of_hanging() {
        let sync: Arc<dyn SyncClient> = Arc::new(SyncService::spawn());
        let sink = Arc::new(Sink::retaining());
        let mut config = config(1, 1, 64, 1);
        // one provider simulated, two expected
        config.params.provider_count = Some(2);
        config.barrier_timeout = 1;

        let err = timeout(Duration::from_secs(10), Simulation::new(config, sync, sink.clone()).run())
            .await
            .unwrap()
            .unwrap_err();

        let message = format!("{err:#}");
        assert!(message.contains("participant"));
        assert!(message.contains("timed out"));

        let failures = sink
            .events()
            .into_iter()
            .filter(|event| matches!(event.kind, EventKind::Failure { .. }))
            .count();
        assert!(failures >= 1);
    }

    #[tokio::test]
    async fn failed_requestor_stops_the_cohort() {
        let sync: Arc<dyn SyncClient> = Arc::new(SyncService::spawn());
        let sink = Arc::new(Sink::retaining());
        let simulation = Simulation::new(config(1, 1, 64, 2), sync, sink.clone());

        let err = timeout(
            Duration::from_secs(5),
            simulation.run_with(|_| Arc::new(BrokenExchange) as Arc<dyn Exchange>),
        )
        .await
        .unwrap()
        .unwrap_err();

        let message = format!("{err:#}");
        assert!(message.contains("participant requestor-0 failed"));
        assert!(message.contains("could not download block[0]"));

        assert!(matches!(
            sink.events_of("requestor-0").last(),
            Some(EventKind::Failure { .. }),
        ));
    }
}
