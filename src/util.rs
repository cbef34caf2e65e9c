use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{anyhow, Result};
use pnet::datalink::{self, NetworkInterface};
use serde::{de, Deserialize, Deserializer};

pub fn string_to_socket(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let host = s.to_socket_addrs()?.next().ok_or_else(|| anyhow!("cannot resolve hostname {s}"))?;

    Ok(host)
}

pub fn get_interface(interface_name: &str) -> Result<NetworkInterface> {
    let interface = datalink::interfaces()
        .into_iter()
        .find(|i| i.name == interface_name);

    match interface {
        Some(interface) => Ok(interface),
        None => Err(anyhow!("network interface {interface_name} not found")),
    }
}

/// Parses "1024", "4KB", "1 MiB" and the like into a byte count. Decimal
/// units are powers of 1000, binary units powers of 1024.
pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    if number.is_empty() {
        return Err(anyhow!("invalid size: {s}"));
    }

    let number: usize = number.parse()?;
    let multiplier: usize = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1000,
        "kib" => 1 << 10,
        "mb" => 1000 * 1000,
        "mib" => 1 << 20,
        "gb" => 1000 * 1000 * 1000,
        "gib" => 1 << 30,
        _ => return Err(anyhow!("invalid size unit in {s}")),
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("size {s} is too large"))
}

pub fn deserialize_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(usize),
        Human(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(bytes) => Ok(bytes),
        Size::Human(s) => parse_size(&s).map_err(de::Error::custom),
    }
}
