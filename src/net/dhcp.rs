//! Network arbiter: static DHCP host reservations on the lab network.
//!
//! Every sandbox gets a deterministic MAC; this module picks a free IPv4
//! from the network's DHCP ranges and pins it as a static host entry so
//! the address survives guest reboots and is known before the VM boots.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::hypervisor::{
    self, DhcpLease, Hypervisor, HypervisorError, NetUpdateCommand, NetUpdateFlags,
};

#[derive(thiserror::Error, Debug)]
pub enum NetError {
    #[error("no free IPv4 address left in the DHCP ranges of network {network}")]
    DhcpRangeExhausted { network: String },

    #[error("network {network} defines no IPv4 DHCP range")]
    NoDhcpRange { network: String },

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

/// A static host pin owned by one lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpReservation {
    pub mac: String,
    pub ip: Ipv4Addr,
}

/// A `<host mac ip/>` entry currently configured on the network.
#[derive(Debug, Clone)]
pub struct PinnedHost {
    pub mac: String,
    pub ip: String,
}

pub struct DhcpArbiter {
    hypervisor: Arc<dyn Hypervisor>,
    network: String,
}

impl DhcpArbiter {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, network: impl Into<String>) -> Self {
        Self {
            hypervisor,
            network: network.into(),
        }
    }

    /// Pick the first free IPv4 in the network's DHCP ranges and pin it
    /// to `mac` as a static host entry (live + persistent config).
    ///
    /// "Used" is the union of already-configured host entries and current
    /// dynamic leases. Ranges are scanned in source order; addresses
    /// increment byte-wise from start to end inclusive.
    pub async fn acquire(&self, mac: &str) -> Result<DhcpReservation, NetError> {
        let xml = self.hypervisor.describe_network(&self.network).await?;
        let ranges = parse_ranges(&xml);
        if ranges.is_empty() {
            return Err(NetError::NoDhcpRange {
                network: self.network.clone(),
            });
        }
        let pinned = parse_hosts(&xml);
        let leases = self.hypervisor.list_dhcp_leases(&self.network).await?;

        let used = used_addresses(&pinned, &leases);
        let ip = first_free(&ranges, &used).ok_or_else(|| NetError::DhcpRangeExhausted {
            network: self.network.clone(),
        })?;

        // Drop any stale entry that would conflict with the new pin.
        for host in &pinned {
            if host.mac.eq_ignore_ascii_case(mac) || host.ip == ip.to_string() {
                self.delete_host(&host.mac, Some(&host.ip)).await?;
            }
        }

        let host_xml = format!("<host mac='{mac}' ip='{ip}'/>");
        self.hypervisor
            .update_dhcp_host(
                &self.network,
                NetUpdateCommand::Add,
                &host_xml,
                NetUpdateFlags::BOTH,
            )
            .await?;

        tracing::info!(network = %self.network, mac, ip = %ip, "pinned DHCP reservation");

        Ok(DhcpReservation {
            mac: mac.to_string(),
            ip,
        })
    }

    /// Remove the host entries matching the reservation's mac and/or ip.
    /// Idempotent: a pin that is already gone is not an error.
    pub async fn release(&self, reservation: &DhcpReservation) -> Result<(), NetError> {
        self.delete_host(&reservation.mac, Some(&reservation.ip.to_string()))
            .await?;
        tracing::info!(
            network = %self.network,
            mac = %reservation.mac,
            ip = %reservation.ip,
            "released DHCP reservation"
        );
        Ok(())
    }

    /// Current dynamic leases on the network.
    pub async fn leases(&self) -> Result<Vec<DhcpLease>, NetError> {
        Ok(self.hypervisor.list_dhcp_leases(&self.network).await?)
    }

    /// Static host entries currently configured on the network.
    pub async fn pinned(&self) -> Result<Vec<PinnedHost>, NetError> {
        let xml = self.hypervisor.describe_network(&self.network).await?;
        Ok(parse_hosts(&xml))
    }

    async fn delete_host(&self, mac: &str, ip: Option<&str>) -> Result<(), NetError> {
        // libvirt matches delete on the attributes given; try the mac form
        // first and fall back to the ip form so either key clears the pin.
        let mut attempts = vec![format!("<host mac='{mac}'/>")];
        if let Some(ip) = ip {
            attempts.push(format!("<host ip='{ip}'/>"));
        }
        for host_xml in attempts {
            match self
                .hypervisor
                .update_dhcp_host(
                    &self.network,
                    NetUpdateCommand::Delete,
                    &host_xml,
                    NetUpdateFlags::BOTH,
                )
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_benign_release() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn used_addresses(pinned: &[PinnedHost], leases: &[DhcpLease]) -> HashSet<Ipv4Addr> {
    pinned
        .iter()
        .map(|h| h.ip.as_str())
        .chain(leases.iter().map(|l| l.ip.as_str()))
        .filter_map(|ip| ip.parse().ok())
        .collect()
}

fn first_free(ranges: &[(Ipv4Addr, Ipv4Addr)], used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    for (start, end) in ranges {
        let mut cur = u32::from(*start);
        let last = u32::from(*end);
        while cur <= last {
            let ip = Ipv4Addr::from(cur);
            if !used.contains(&ip) {
                return Some(ip);
            }
            cur = cur.checked_add(1)?;
        }
    }
    None
}

fn parse_ranges(xml: &str) -> Vec<(Ipv4Addr, Ipv4Addr)> {
    hypervisor::xml::element_starts(xml, "range")
        .into_iter()
        .filter_map(|el| {
            let start: Ipv4Addr = hypervisor::xml::attr(el, "start")?.parse().ok()?;
            let end: Ipv4Addr = hypervisor::xml::attr(el, "end")?.parse().ok()?;
            Some((start, end))
        })
        .collect()
}

fn parse_hosts(xml: &str) -> Vec<PinnedHost> {
    hypervisor::xml::element_starts(xml, "host")
        .into_iter()
        .filter_map(|el| {
            Some(PinnedHost {
                mac: hypervisor::xml::attr(el, "mac")?,
                ip: hypervisor::xml::attr(el, "ip")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::FakeHypervisor;

    fn network_xml(ranges: &[(&str, &str)], hosts: &[(&str, &str)]) -> String {
        let mut xml = String::from("<network><name>lab</name><ip><dhcp>");
        for (start, end) in ranges {
            xml.push_str(&format!("<range start='{start}' end='{end}'/>"));
        }
        for (mac, ip) in hosts {
            xml.push_str(&format!("<host mac='{mac}' ip='{ip}'/>"));
        }
        xml.push_str("</dhcp></ip></network>");
        xml
    }

    fn arbiter(xml: String, leases: Vec<DhcpLease>) -> (Arc<FakeHypervisor>, DhcpArbiter) {
        let hv = Arc::new(FakeHypervisor::new());
        {
            let mut st = hv.state.lock().unwrap();
            st.network_xml = xml;
            st.leases = leases;
        }
        let arb = DhcpArbiter::new(hv.clone(), "lab");
        (hv, arb)
    }

    fn lease(mac: &str, ip: &str) -> DhcpLease {
        DhcpLease {
            mac: mac.into(),
            ip: ip.into(),
            hostname: None,
            expiry: None,
        }
    }

    #[tokio::test]
    async fn picks_first_free_address() {
        let xml = network_xml(
            &[("10.0.0.2", "10.0.0.5")],
            &[("52:54:00:00:00:01", "10.0.0.2")],
        );
        let (_, arb) = arbiter(xml, vec![lease("52:54:00:00:00:02", "10.0.0.3")]);
        let res = arb.acquire("52:54:00:aa:bb:cc").await.unwrap();
        assert_eq!(res.ip, Ipv4Addr::new(10, 0, 0, 4));
    }

    #[tokio::test]
    async fn exhausted_range_is_an_error() {
        let xml = network_xml(
            &[("10.0.0.2", "10.0.0.3")],
            &[("52:54:00:00:00:01", "10.0.0.2")],
        );
        let (_, arb) = arbiter(xml, vec![lease("52:54:00:00:00:02", "10.0.0.3")]);
        let err = arb.acquire("52:54:00:aa:bb:cc").await.unwrap_err();
        assert!(matches!(err, NetError::DhcpRangeExhausted { .. }));
    }

    #[tokio::test]
    async fn ranges_scanned_in_source_order() {
        let xml = network_xml(
            &[("10.0.1.10", "10.0.1.10"), ("10.0.0.2", "10.0.0.254")],
            &[],
        );
        let (_, arb) = arbiter(xml, vec![]);
        let res = arb.acquire("52:54:00:aa:bb:cc").await.unwrap();
        assert_eq!(res.ip, Ipv4Addr::new(10, 0, 1, 10));
    }

    #[tokio::test]
    async fn stale_entry_for_same_mac_is_replaced() {
        let mac = "52:54:00:aa:bb:cc";
        let xml = network_xml(&[("10.0.0.2", "10.0.0.5")], &[(mac, "10.0.0.4")]);
        let (hv, arb) = arbiter(xml, vec![]);
        let res = arb.acquire(mac).await.unwrap();
        // 10.0.0.4 is pinned (used); first free is .2, and the stale pin
        // for our mac was deleted first.
        assert_eq!(res.ip, Ipv4Addr::new(10, 0, 0, 2));
        let calls = hv.calls();
        assert!(calls.iter().any(|c| c.starts_with("net-update:Delete")));
        assert!(calls.iter().any(|c| c.starts_with("net-update:Add")));
    }

    #[tokio::test]
    async fn concurrent_acquirers_get_distinct_addresses() {
        let xml = network_xml(&[("10.0.0.2", "10.0.0.20")], &[]);
        let (hv, arb) = arbiter(xml, vec![]);
        let a = arb.acquire("52:54:00:00:00:0a").await.unwrap();
        // The fake records the add; refresh its network view the way the
        // live network would.
        {
            let mut st = hv.state.lock().unwrap();
            st.network_xml = network_xml(
                &[("10.0.0.2", "10.0.0.20")],
                &[("52:54:00:00:00:0a", &a.ip.to_string())],
            );
        }
        let b = arb.acquire("52:54:00:00:00:0b").await.unwrap();
        assert_ne!(a.ip, b.ip);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let xml = network_xml(&[("10.0.0.2", "10.0.0.5")], &[]);
        let (_, arb) = arbiter(xml, vec![]);
        let res = DhcpReservation {
            mac: "52:54:00:aa:bb:cc".into(),
            ip: Ipv4Addr::new(10, 0, 0, 2),
        };
        // Nothing pinned; the fake answers InvalidArg, which is swallowed.
        arb.release(&res).await.unwrap();
        arb.release(&res).await.unwrap();
    }

    #[tokio::test]
    async fn missing_range_is_an_error() {
        let (_, arb) = arbiter("<network><ip><dhcp></dhcp></ip></network>".into(), vec![]);
        let err = arb.acquire("52:54:00:aa:bb:cc").await.unwrap_err();
        assert!(matches!(err, NetError::NoDhcpRange { .. }));
    }

    #[tokio::test]
    async fn pinned_lists_host_entries() {
        let xml = network_xml(
            &[("10.0.0.2", "10.0.0.5")],
            &[("52:54:00:00:00:01", "10.0.0.2"), ("52:54:00:00:00:02", "10.0.0.3")],
        );
        let (_, arb) = arbiter(xml, vec![]);
        let pinned = arb.pinned().await.unwrap();
        assert_eq!(pinned.len(), 2);
        assert_eq!(pinned[0].ip, "10.0.0.2");
    }
}
