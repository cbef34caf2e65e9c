use std::net::{IpAddr, Ipv4Addr};

use anyhow::{anyhow, Result};
use cidr_utils::cidr::Ipv4Cidr;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    sync::{State, SyncChannel, Topic},
    util::get_interface,
};

pub const DEFAULT_NETWORK: &str = "default";
pub static NETWORK_CONFIGURED_STATE: State = State::new("network-configured");

/// Traffic shape applied to every link of a network. Zero means "leave
/// unchanged" for every field.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkShape {
    pub latency_ms: u64,
    pub jitter_ms: u64,
    /// bits per second
    pub bandwidth: u64,
    pub loss: f32,
    pub corrupt: f32,
    pub corrupt_corr: f32,
    pub reorder: f32,
    pub reorder_corr: f32,
    pub duplicate: f32,
    pub duplicate_corr: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    #[default]
    AllowAll,
    DenyAll,
}

/// What a participant asks the shaping sidecar to apply. The sidecar signals
/// `callback_state` once the shape is in place.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NetworkConfig {
    pub network: String,
    pub enable: bool,
    pub default: LinkShape,
    pub callback_state: String,
    pub callback_target: u64,
    pub routing_policy: RoutingPolicy,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "enable_default")]
    pub enable: bool,

    /// Whether a sidecar applies the shape and confirms it. Without one the
    /// participant confirms its own request.
    #[serde(default)]
    pub sidecar: bool,

    #[serde(default)]
    pub shape: LinkShape,

    #[serde(default)]
    pub routing_policy: RoutingPolicy,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            enable: enable_default(),
            sidecar: false,
            shape: LinkShape::default(),
            routing_policy: RoutingPolicy::default(),
        }
    }
}

fn enable_default() -> bool {
    true
}

impl NetworkConfig {
    pub fn new(settings: &NetworkSettings, callback_target: u64) -> Self {
        Self {
            network: String::from(DEFAULT_NETWORK),
            enable: settings.enable,
            default: settings.shape.clone(),
            callback_state: String::from(NETWORK_CONFIGURED_STATE.name()),
            callback_target,
            routing_policy: settings.routing_policy,
        }
    }
}

/// Requests the shape for this participant and returns once every
/// participant's shape has been confirmed.
pub async fn configure_network(
    sync: &SyncChannel,
    participant: &str,
    settings: &NetworkSettings,
    instance_count: u64,
) -> Result<()> {
    let config = NetworkConfig::new(settings, instance_count);
    let topic: Topic<NetworkConfig> = Topic::owned(format!("network:{participant}"));
    let callback = State::owned(config.callback_state.clone());

    info!("Requesting shape {:?} on network {}. ", config.default, config.network);
    sync.publish(&topic, &config).await?;

    if settings.sidecar {
        sync.barrier(&callback, config.callback_target).await?;
    } else {
        debug!("No sidecar configured, confirming network shape locally. ");
        sync.signal_and_wait(&callback, config.callback_target).await?;
    }

    info!("Network configured for all {} instance(s). ", config.callback_target);
    Ok(())
}

/// The address this participant is reachable at on the data network.
pub fn data_network_ip(interface: &str, subnet: Option<&str>) -> Result<IpAddr> {
    let subnet = match subnet {
        Some(subnet) => Some(
            Ipv4Cidr::from_str(subnet).map_err(|e| anyhow!("invalid data subnet {subnet}: {e:?}"))?,
        ),
        None => None,
    };

    let interface = get_interface(interface)?;
    let candidates: Vec<Ipv4Addr> = interface
        .ips
        .iter()
        .filter_map(|network| match network.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();

    pick_data_ip(&candidates, subnet.as_ref())
        .map(IpAddr::V4)
        .ok_or_else(|| anyhow!("no IPv4 address on interface {} for the data network", interface.name))
}

fn pick_data_ip(candidates: &[Ipv4Addr], subnet: Option<&Ipv4Cidr>) -> Option<Ipv4Addr> {
    candidates
        .iter()
        .find(|ip| match subnet {
            Some(subnet) => subnet.contains(**ip),
            None => true,
        })
        .copied()
}
