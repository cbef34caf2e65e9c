use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use log::{debug, info};

use crate::{
    block::{BlockStore, MemoryBlockStore},
    config::{Config, ServiceConfig, SimulationConfig},
    exchange::{self, HttpExchange},
    identity::ParticipantIdentity,
    network::{data_network_ip, NetworkSettings},
    plan::{Participant, Plan},
    runenv::{RunEnv, Sink},
    server::bind,
    simulate::Simulation,
    sync::{self, HttpSyncClient, SyncChannel, SyncService, POLL_INTERVAL_SECS},
    util::string_to_socket,
};

/// One participant of a run, talking to a remote coordination service and
/// exchanging blocks over HTTP.
pub struct App {
    env: RunEnv,
    sync: SyncChannel,
    exchange: Arc<HttpExchange>,
    network: NetworkSettings,
    interface: String,
    data_subnet: Option<String>,
    listen_port: u16,
}

fn open_sink(results_path: Option<&str>) -> Result<Sink> {
    match results_path {
        Some(path) => {
            info!("Recording events to {path}. ");
            Sink::file(Path::new(path))
        },
        None => Ok(Sink::none()),
    }
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let sync_addr = string_to_socket(&config.sync_service)?;
        info!("Using sync service at {sync_addr}. ");

        let client = HttpSyncClient::new(
            sync_addr,
            Duration::from_secs(config.timeout),
            Duration::from_secs(config.barrier_timeout),
        )?;

        let sync = SyncChannel::new(Arc::new(client), &config.run_id)
            .with_timeout(Duration::from_secs(config.barrier_timeout));
        let exchange = Arc::new(HttpExchange::new(Duration::from_secs(config.timeout))?);

        let env = RunEnv::new(
            config.name,
            config.run_id,
            config.test_case,
            config.group,
            config.instance_count,
            config.params,
            Arc::new(open_sink(config.results_path.as_deref())?),
        );

        Ok(Self {
            env,
            sync,
            exchange,
            network: config.network,
            interface: config.interface,
            data_subnet: config.data_subnet,
            listen_port: config.listen_port,
        })
    }

    pub async fn start(self) -> Result<()> {
        let result = self.run().await;
        self.env.record_outcome(&result);
        result
    }

    async fn run(&self) -> Result<()> {
        let plan = Plan::prepare(&self.env, &self.sync, &self.network).await?;

        // only meaningful once the network is configured
        let ip = data_network_ip(&self.interface, self.data_subnet.as_deref())?;
        let listeners = bind(&[SocketAddr::new(ip, self.listen_port)])?;

        let identity = ParticipantIdentity::new(self.env.participant.clone(), listeners.local_addrs().to_vec());
        info!("Local participant is {identity}. ");

        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let mut server = tokio::spawn(listeners.serve(exchange::router(identity.clone(), Arc::clone(&store))));

        let participant = Participant {
            identity,
            store,
            exchange: self.exchange.clone(),
        };

        let result = tokio::select! {
            result = plan.run(&self.env, &self.sync, &participant) => result,
            joined = &mut server => match joined {
                Ok(Ok(())) => Err(anyhow!("exchange server exited unexpectedly")),
                Ok(Err(e)) => Err(e.context("exchange server failed")),
                Err(e) => Err(anyhow!("exchange server exited unexpectedly: {e}")),
            },
        };

        debug!("Stopping exchange server. ");
        server.abort();
        result
    }
}

/// Hosts the coordination service until the process is stopped.
pub async fn serve(config: ServiceConfig) -> Result<()> {
    let listeners = bind(&config.listen)?;
    let service = SyncService::spawn();

    listeners
        .serve(sync::router(service, Duration::from_secs(POLL_INTERVAL_SECS)))
        .await?;

    Err(anyhow!("sync service exited unexpectedly"))
}

/// Runs a cohort in this process and prints each requestor's aggregate
/// download time.
pub async fn simulate(config: SimulationConfig) -> Result<()> {
    let sink = Arc::new(open_sink(config.results_path.as_deref())?.retain());
    let service = Arc::new(SyncService::spawn());

    let simulation = Simulation::new(config, service, sink);
    simulation.run().await?;

    for (participant, block_count, total_duration) in simulation.summary() {
        println!("{participant}: {block_count} block(s) in {total_duration:?}");
    }

    Ok(())
}
