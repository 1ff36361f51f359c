use anyhow::{anyhow, Result};
use if_addrs::{IfAddr, Interface};
use log::{debug, warn};
use std::net::Ipv4Addr;

use crate::traits::LinkProbe;

const WIRELESS_STATS_PATH: &str = "/proc/net/wireless";

/// Pick the interface the node talks through: the configured one, or the first
/// non-loopback interface with an IPv4 address.
pub fn get_default_interface(preferred: Option<&str>) -> Result<(String, Ipv4Addr)> {
    let ifaces = if_addrs::get_if_addrs()?;
    select_interface(&ifaces, preferred)
        .ok_or_else(|| match preferred {
            Some(name) => anyhow!("Interface {} has no IPv4 address", name),
            None => anyhow!("No suitable IPv4 interface found"),
        })
}

fn select_interface(ifaces: &[Interface], preferred: Option<&str>) -> Option<(String, Ipv4Addr)> {
    ifaces.iter().find_map(|iface| {
        if iface.is_loopback() {
            return None;
        }
        if let Some(name) = preferred {
            if iface.name != name {
                return None;
            }
        }
        match &iface.addr {
            IfAddr::V4(v4) => Some((iface.name.clone(), v4.ip)),
            _ => None,
        }
    })
}

/// Link is usable when the chosen interface holds an IPv4 address.
pub struct InterfaceLinkProbe {
    interface: Option<String>,
}

impl InterfaceLinkProbe {
    pub fn new(interface: Option<String>) -> Self {
        InterfaceLinkProbe { interface }
    }
}

impl LinkProbe for InterfaceLinkProbe {
    fn is_link_up(&self) -> bool {
        match if_addrs::get_if_addrs() {
            Ok(ifaces) => select_interface(&ifaces, self.interface.as_deref()).is_some(),
            Err(e) => {
                warn!("[LINK] Interface query failed: {}", e);
                false
            }
        }
    }

    fn signal_quality(&self) -> Option<i32> {
        let contents = std::fs::read_to_string(WIRELESS_STATS_PATH).ok()?;
        parse_wireless_level(&contents, self.interface.as_deref())
    }
}

/// Signal level (dBm) from `/proc/net/wireless` for the named interface, or
/// the first wireless interface listed.
pub fn parse_wireless_level(contents: &str, interface: Option<&str>) -> Option<i32> {
    // Two header lines, then "iface: status link level noise ..."
    for line in contents.lines().skip(2) {
        let (name, rest) = match line.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };
        let name = name.trim();
        if interface.map_or(false, |want| want != name) {
            continue;
        }

        let fields: Vec<&str> = rest.split_whitespace().collect();
        let level = fields.get(2)?.trim_end_matches('.');
        match level.parse::<f64>() {
            Ok(dbm) => return Some(dbm as i32),
            Err(_) => {
                debug!("Unparseable wireless level {:?} for {}", level, name);
                return None;
            }
        }
    }
    None
}

/// Hardware address of an interface as "AA:BB:CC:DD:EE:FF".
pub fn read_mac_address(interface: &str) -> Option<String> {
    let path = format!("/sys/class/net/{}/address", interface);
    let raw = std::fs::read_to_string(path).ok()?;
    let mac = raw.trim().to_uppercase();
    if mac.len() == 17 { Some(mac) } else { None }
}
