//! NIC provisioner.
//!
//! Asks the host network allocator for a tap interface and parses the
//! returned address. Always posts `InterfaceCreated`: with an empty
//! address on any failure, which the controller surfaces as a device
//! failure instead of waiting forever.

use crate::events::{BusSender, InterfaceInfo, RouteRule, VmEvent};
use crate::host::NetworkAllocator;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

/// One-shot job for one interface slot.
pub(crate) async fn create_interface(
    network: Arc<dyn NetworkAllocator>,
    index: usize,
    pci_addr: u32,
    device: String,
    is_default: bool,
    bus: BusSender,
) {
    let settings = match network.allocate("").await {
        Ok(settings) => settings,
        Err(e) => {
            warn!(index, error = %e, "interface allocation failed");
            bus.post(VmEvent::InterfaceCreated(failed(index, pci_addr, &device)))
                .await;
            return;
        }
    };

    let Ok(ip) = settings.ip_address.parse::<Ipv4Addr>() else {
        warn!(index, addr = %settings.ip_address, "cannot parse interface address");
        bus.post(VmEvent::InterfaceCreated(failed(index, pci_addr, &device)))
            .await;
        return;
    };
    let Some(mask) = prefix_to_mask(settings.prefix_len) else {
        warn!(index, prefix = settings.prefix_len, "invalid prefix length");
        bus.post(VmEvent::InterfaceCreated(failed(index, pci_addr, &device)))
            .await;
        return;
    };

    let mut routes = Vec::new();
    if is_default {
        routes.push(RouteRule {
            destination: "0.0.0.0/0".to_string(),
            gateway: settings.gateway.clone(),
            via_this: true,
        });
    }

    info!(index, ip = %ip, mask = %mask, "interface allocated");
    bus.post(VmEvent::InterfaceCreated(InterfaceInfo {
        index,
        pci_addr,
        device,
        fd: Some(settings.tap),
        ip: ip.to_string(),
        mask: mask.to_string(),
        routes,
    }))
    .await;
}

fn failed(index: usize, pci_addr: u32, device: &str) -> InterfaceInfo {
    InterfaceInfo {
        index,
        pci_addr,
        device: device.to_string(),
        fd: None,
        ip: String::new(),
        mask: String::new(),
        routes: Vec::new(),
    }
}

/// Dotted-quad netmask for a prefix length; `None` above /32.
fn prefix_to_mask(prefix: u8) -> Option<Ipv4Addr> {
    if prefix > 32 {
        return None;
    }
    let bits = (!0u32)
        .checked_shl(u32::from(32 - prefix))
        .unwrap_or(0);
    Some(Ipv4Addr::from(bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::host::NetworkSettings;
    use async_trait::async_trait;

    #[test]
    fn mask_from_prefix() {
        assert_eq!(prefix_to_mask(24).unwrap().to_string(), "255.255.255.0");
        assert_eq!(prefix_to_mask(16).unwrap().to_string(), "255.255.0.0");
        assert_eq!(prefix_to_mask(0).unwrap().to_string(), "0.0.0.0");
        assert_eq!(prefix_to_mask(32).unwrap().to_string(), "255.255.255.255");
        assert!(prefix_to_mask(33).is_none());
    }

    struct FailingAllocator;

    #[async_trait]
    impl NetworkAllocator for FailingAllocator {
        async fn allocate(&self, _requested: &str) -> Result<NetworkSettings> {
            Err(Error::NicProvision { index: 0 })
        }
    }

    #[tokio::test]
    async fn failure_posts_empty_address() {
        let (bus, mut rx) = crate::events::event_bus();
        create_interface(
            Arc::new(FailingAllocator),
            0,
            5,
            "eth0".to_string(),
            true,
            bus,
        )
        .await;

        match rx.recv().await.unwrap() {
            VmEvent::InterfaceCreated(info) => {
                assert!(info.ip.is_empty());
                assert!(info.fd.is_none());
                assert!(info.routes.is_empty());
            }
            other => panic!("unexpected event {}", other.kind()),
        }
    }
}
