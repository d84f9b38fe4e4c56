//! Network interface discovery for the advertised access URLs.
//!
//! Phones on the same LAN use the first ordinary interface address; devices
//! on a private mesh VPN (Tailscale hands out 100.x addresses) get their
//! own URL. Docker bridge addresses are noise and skipped.

use std::net::{IpAddr, Ipv4Addr};

use local_ip_address::list_afinet_netifas;
use tracing::warn;

/// Access URLs computed once at server start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedUrls {
    /// Best guess: LAN if present, else mesh, else loopback.
    pub primary: String,
    pub lan: Option<String>,
    pub mesh: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IfaceClass {
    Lan,
    Mesh,
}

fn classify(ip: Ipv4Addr) -> Option<IfaceClass> {
    if ip.is_loopback() {
        return None;
    }
    match ip.octets()[0] {
        100 => Some(IfaceClass::Mesh),
        // Docker bridges; never reachable from a phone.
        172 => None,
        _ => Some(IfaceClass::Lan),
    }
}

fn access_url(ip: &str, port: u16, token: &str) -> String {
    format!("http://{ip}:{port}?token={token}")
}

/// Enumerate IPv4 interfaces and derive the advertised URLs.
pub fn discover(port: u16, token: &str) -> AdvertisedUrls {
    let mut lan_ip: Option<Ipv4Addr> = None;
    let mut mesh_ip: Option<Ipv4Addr> = None;

    match list_afinet_netifas() {
        Ok(interfaces) => {
            for (_name, ip) in interfaces {
                let IpAddr::V4(v4) = ip else { continue };
                match classify(v4) {
                    Some(IfaceClass::Lan) if lan_ip.is_none() => lan_ip = Some(v4),
                    Some(IfaceClass::Mesh) if mesh_ip.is_none() => mesh_ip = Some(v4),
                    _ => {}
                }
            }
        }
        Err(err) => warn!(%err, "interface enumeration failed; advertising loopback only"),
    }

    let lan = lan_ip.map(|ip| access_url(&ip.to_string(), port, token));
    let mesh = mesh_ip.map(|ip| access_url(&ip.to_string(), port, token));
    let primary = lan
        .clone()
        .or_else(|| mesh.clone())
        .unwrap_or_else(|| access_url("127.0.0.1", port, token));

    AdvertisedUrls { primary, lan, mesh }
}
