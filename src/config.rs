use std::{fs, net::SocketAddr};

use anyhow::{anyhow, Result};
use cidr_utils::cidr::Ipv4Cidr;
use futures::{executor::block_on, TryStreamExt};
use log::{debug, error, info, warn};
use pnet::datalink;
use rtnetlink::{new_connection, IpVersion};
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    network::NetworkSettings,
    plan::{REQUESTORS_GROUP, SPEED_TEST},
    runenv::Params,
    sync::POLL_INTERVAL_SECS,
};

const RUN_ID_DEFAULT: &str = "default";
const LISTEN_PORT_DEFAULT: u16 = 3333;
const SERVICE_LISTEN_DEFAULT: &str = "0.0.0.0:5050";
const TIMEOUT_DEFAULT: u64 = 60;
const BARRIER_TIMEOUT_DEFAULT: u64 = 600;

/// One participant of a run, as started by `blockbench run`.
#[derive(Clone, Deserialize)]
pub struct Config {
    pub name: String,

    #[serde(default = "run_id_default")]
    pub run_id: String,

    #[serde(default = "test_case_default")]
    pub test_case: String,

    pub group: String,

    // across all groups
    pub instance_count: u64,

    pub sync_service: String,

    #[serde(default = "listen_port_default")]
    pub listen_port: u16,

    #[serde(default = "interface_default")]
    pub interface: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_subnet: Option<String>,

    #[serde(default = "timeout_default")]
    pub timeout: u64,

    #[serde(default = "barrier_timeout_default")]
    pub barrier_timeout: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_path: Option<String>,

    #[serde(default)]
    pub network: NetworkSettings,

    pub params: Params,
}

/// The coordination service, as started by `blockbench serve`.
#[derive(Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "service_listen_default")]
    pub listen: Vec<SocketAddr>,
}

/// A whole cohort in one process, as started by `blockbench simulate`.
#[derive(Clone, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "run_id_default")]
    pub run_id: String,

    #[serde(default = "test_case_default")]
    pub test_case: String,

    pub providers: usize,

    pub requestors: usize,

    #[serde(default = "barrier_timeout_default")]
    pub barrier_timeout: u64,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_path: Option<String>,

    pub params: Params,
}

fn load<T: DeserializeOwned>(config_path: &str) -> Result<T> {
    info!("Using configuration file {config_path}. ");

    let config = fs::read_to_string(config_path)?;
    let config = config.trim();
    Ok(serde_yaml::from_str(config)?)
}

impl Config {
    pub fn new(config_path: &str) -> Result<Self> {
        let config: Self = load(config_path)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.instance_count == 0 {
            error!("config.instance_count must be at least 1. ");
            return Err(anyhow!("invalid configuration"));
        }

        if self.timeout <= POLL_INTERVAL_SECS {
            error!("config.timeout must exceed the sync poll interval of {POLL_INTERVAL_SECS}s. ");
            return Err(anyhow!("invalid configuration"));
        }

        if let Some(subnet) = &self.data_subnet {
            if Ipv4Cidr::from_str(subnet).is_err() {
                error!("config.data_subnet {subnet} is not an IPv4 CIDR. ");
                return Err(anyhow!("invalid configuration"));
            }
        }

        if self.params.provider_count.is_some() && self.group != REQUESTORS_GROUP {
            warn!("config.params.provider_count is only read by requestors, ignoring. ");
        }

        Ok(())
    }
}

impl ServiceConfig {
    pub fn new(config_path: &str) -> Result<Self> {
        let config: Self = load(config_path)?;

        if config.listen.is_empty() {
            error!("config.listen must name at least one address. ");
            return Err(anyhow!("invalid configuration"));
        }

        Ok(config)
    }
}

impl SimulationConfig {
    pub fn new(config_path: &str) -> Result<Self> {
        let config: Self = load(config_path)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.providers + self.requestors == 0 {
            error!("A simulation needs at least one provider or requestor. ");
            return Err(anyhow!("invalid configuration"));
        }

        if let Some(provider_count) = self.params.provider_count {
            if provider_count > self.providers {
                error!(
                    "config.params.provider_count is {provider_count} but only {} provider(s) are simulated. ",
                    self.providers
                );
                return Err(anyhow!("invalid configuration"));
            }
        }

        if self.barrier_timeout == 0 {
            error!("config.barrier_timeout must be at least 1. ");
            return Err(anyhow!("invalid configuration"));
        }

        if self.network.sidecar {
            warn!("config.network.sidecar has no effect in a simulation. ");
        }

        Ok(())
    }
}

fn run_id_default() -> String {
    debug!("Defaulting config.run_id to {RUN_ID_DEFAULT}. ");
    String::from(RUN_ID_DEFAULT)
}

fn test_case_default() -> String {
    debug!("Defaulting config.test_case to {SPEED_TEST}. ");
    String::from(SPEED_TEST)
}

fn listen_port_default() -> u16 {
    debug!("Defaulting config.listen_port to {LISTEN_PORT_DEFAULT}. ");
    LISTEN_PORT_DEFAULT
}

fn service_listen_default() -> Vec<SocketAddr> {
    debug!("Defaulting config.listen to {SERVICE_LISTEN_DEFAULT}. ");
    SERVICE_LISTEN_DEFAULT.parse().into_iter().collect()
}

fn timeout_default() -> u64 {
    debug!("Defaulting config.timeout to {TIMEOUT_DEFAULT}. ");
    TIMEOUT_DEFAULT
}

fn barrier_timeout_default() -> u64 {
    debug!("Defaulting config.barrier_timeout to {BARRIER_TIMEOUT_DEFAULT}. ");
    BARRIER_TIMEOUT_DEFAULT
}

fn interface_default() -> String {
    let interface = match block_on(interface_default_impl()) {
        Ok(interface) => interface,
        Err(e) => {
            warn!("Failed to determine primary interface: {e}. Using \"lo\". ");
            warn!("You should manually configure an interface in this case! ");
            String::from("lo")
        },
    };

    debug!("Defaulting config.interface to {interface}. ");
    interface
}

async fn interface_default_impl() -> Result<String> {
    let (connection, handle, _) = new_connection()?;
    let conn = tokio::spawn(connection);

    let interface = {
        let mut routes = handle.route().get(IpVersion::V4).execute();

        loop {
            let route = match routes.try_next().await? {
                Some(route) => route,
                None => return Err(anyhow!("no default route found")),
            };

            let index = match route.output_interface() {
                Some(index) => index,
                None => continue,
            };

            if route.header.destination_prefix_length == 0 {
                conn.abort();
                break index;
            }
        }
    };

    let interface = datalink::interfaces()
        .into_iter()
        .find(|i| i.index == interface)
        .ok_or_else(|| anyhow!("invalid interface"))?;

    Ok(interface.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARTICIPANT: &str = r#"
name: requestor-0
group: requestors
instance_count: 2
sync_service: 127.0.0.1:5050
interface: lo
params:
  size: 1KiB
  block_count: 3
  provider_count: 1
"#;

    #[test]
    fn participant_defaults() {
        let config: Config = serde_yaml::from_str(PARTICIPANT).unwrap();
        config.validate().unwrap();

        assert_eq!(config.run_id, "default");
        assert_eq!(config.test_case, "speed-test");
        assert_eq!(config.listen_port, 3333);
        assert_eq!(config.timeout, 60);
        assert_eq!(config.barrier_timeout, 600);
        assert!(config.network.enable);
        assert!(!config.network.sidecar);
        assert_eq!(config.params.size, 1024);
    }

    #[test]
    fn rejects_short_timeout() {
        let mut config: Config = serde_yaml::from_str(PARTICIPANT).unwrap();
        config.timeout = POLL_INTERVAL_SECS;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_subnet_and_empty_run() {
        let mut config: Config = serde_yaml::from_str(PARTICIPANT).unwrap();
        config.data_subnet = Some("16.0.0.0/99".into());
        assert!(config.validate().is_err());

        config.data_subnet = Some("16.0.0.0/8".into());
        config.validate().unwrap();

        config.instance_count = 0;
        assert!(config.validate().is_err());
    }

    const SIMULATION: &str = r#"
providers: 1
requestors: 2
params:
  size: 1KiB
  block_count: 3
"#;

    #[test]
    fn simulation_defaults() {
        let config: SimulationConfig = serde_yaml::from_str(SIMULATION).unwrap();
        config.validate().unwrap();

        assert_eq!(config.barrier_timeout, 600);
        assert_eq!(config.params.provider_count, None);
    }

    #[test]
    fn simulation_rejects_more_expected_providers_than_simulated() {
        let mut config: SimulationConfig = serde_yaml::from_str(SIMULATION).unwrap();

        config.params.provider_count = Some(1);
        config.validate().unwrap();

        config.params.provider_count = Some(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn service_listens_on_default_port() {
        let config: ServiceConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.listen, vec!["0.0.0.0:5050".parse::<SocketAddr>().unwrap()]);
    }
}
