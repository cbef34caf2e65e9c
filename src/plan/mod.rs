mod provider;
mod requestor;

pub use provider::run_provide;
pub use requestor::run_request;

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::{
    block::{BlockStore, ContentHandle},
    exchange::Exchange,
    identity::ParticipantIdentity,
    network::{configure_network, NetworkSettings},
    runenv::RunEnv,
    sync::{State, SyncChannel, Topic},
};

pub const SPEED_TEST: &str = "speed-test";
pub const PROVIDERS_GROUP: &str = "providers";
pub const REQUESTORS_GROUP: &str = "requestors";

pub static READY_STATE: State = State::new("ready-to-publish");
pub static READY_DL_STATE: State = State::new("ready-to-download");
pub static DONE_STATE: State = State::new("done");
pub static PROVIDER_TOPIC: Topic<ParticipantIdentity> = Topic::new("provider");
pub static BLOCK_TOPIC: Topic<ContentHandle> = Topic::new("blocks");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestCase {
    SpeedTest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Provider,
    Requestor,
}

/// Everything a role needs from the host it runs on.
pub struct Participant {
    pub identity: ParticipantIdentity,
    pub store: Arc<dyn BlockStore>,
    pub exchange: Arc<dyn Exchange>,
}

/// A test case and role resolved from the run environment. Resolving first
/// means a bad label fails before anything touches the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plan {
    pub test_case: TestCase,
    pub role: Role,
}

impl TestCase {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            SPEED_TEST => Ok(Self::SpeedTest),
            _ => Err(anyhow!("unknown test case {name}")),
        }
    }
}

impl Role {
    pub fn from_group(group: &str) -> Result<Self> {
        match group {
            PROVIDERS_GROUP => Ok(Self::Provider),
            REQUESTORS_GROUP => Ok(Self::Requestor),
            _ => Err(anyhow!("unknown test group id {group}")),
        }
    }
}

impl Plan {
    pub fn resolve(env: &RunEnv) -> Result<Self> {
        let test_case = TestCase::from_name(&env.test_case)?;
        let role = Role::from_group(&env.group).map_err(|e| {
            env.record_message("not part of a group");
            e
        })?;

        Ok(Self { test_case, role })
    }

    /// Resolves the plan, then waits until the network shape is confirmed
    /// for every instance of the run.
    pub async fn prepare(env: &RunEnv, sync: &SyncChannel, network: &NetworkSettings) -> Result<Self> {
        let plan = Self::resolve(env)?;

        env.record_message(&format!("running {}", env.test_case));
        configure_network(sync, &env.participant, network, env.instance_count).await?;

        Ok(plan)
    }

    pub async fn run(&self, env: &RunEnv, sync: &SyncChannel, participant: &Participant) -> Result<()> {
        for addr in &participant.identity.addrs {
            env.record_message(&format!("listening on addr: {addr}"));
        }

        match self.test_case {
            TestCase::SpeedTest => self.run_speed_test(env, sync, participant).await,
        }
    }

    async fn run_speed_test(&self, env: &RunEnv, sync: &SyncChannel, participant: &Participant) -> Result<()> {
        match self.role {
            Role::Provider => {
                env.record_message("running provider");
                run_provide(env, sync, &participant.identity, participant.store.as_ref()).await
            },
            Role::Requestor => {
                env.record_message("running requestor");
                run_request(env, sync, participant.exchange.as_ref()).await
            },
        }
    }
}
