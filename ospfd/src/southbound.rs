use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use bitflags::bitflags;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::collections::{AreaId, Arena, InterfaceId, InterfaceIndex};
use crate::config::DFLT_DISTANCE;
use crate::instance::Instance;
use crate::interface::Interface;
use crate::lsdb::LsaOriginateEvent;
use crate::route::{RouteNet, RouteNetFlags};

// Interface flags reported by the system interface manager.
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct InterfaceFlags: u8 {
        const OPERATIVE = 0x01;
        const LOOPBACK = 0x02;
    }
}

// Messages sent to the forwarding-table installer.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum SouthboundTxMsg {
    RouteInstall(RouteMsg),
    RouteUninstall(RouteKeyMsg),
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RouteMsg {
    pub prefix: Ipv4Network,
    pub distance: u8,
    pub metric: u32,
    pub tag: Option<u32>,
    pub reject: bool,
    pub nexthops: BTreeSet<Nexthop>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RouteKeyMsg {
    pub prefix: Ipv4Network,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum Nexthop {
    Address { ifindex: u32, addr: Ipv4Addr },
    Interface { ifindex: u32 },
}

// Messages received from the system: physical interface events, address
// changes and forwarding-table notifications.
#[derive(Clone, Debug)]
pub enum SouthboundRxMsg {
    IfaceUpd(IfaceUpdateMsg),
    AddrAdd { ifname: String, addr: Ipv4Network },
    AddrDel { ifname: String, addr: Ipv4Network },
    RouterIdUpd { router_id: Option<Ipv4Addr> },
    // The kernel reports one of our routes was deleted behind our back.
    KrtDeleteNotification { prefix: Ipv4Network },
    // The kernel reports a leftover route from a previous incarnation.
    RemnantNotification { prefix: Ipv4Network },
}

#[derive(Clone, Debug)]
pub struct IfaceUpdateMsg {
    pub ifname: String,
    pub ifindex: Option<u32>,
    pub mtu: Option<u16>,
    pub flags: InterfaceFlags,
}

// ===== Tx: FIB synchronization =====

pub(crate) fn route_install(
    sb_tx: &ospfd_utils::UnboundedSender<SouthboundTxMsg>,
    prefix: &Ipv4Network,
    route: &RouteNet,
    interfaces: &Arena<Interface>,
) {
    // Fill-in nexthops.
    let nexthops = route
        .nexthops
        .values()
        .map(|nexthop| {
            let iface = &interfaces[nexthop.iface_idx];
            match nexthop.addr {
                Some(addr) => Nexthop::Address {
                    ifindex: iface.system.ifindex.unwrap(),
                    addr,
                },
                None => Nexthop::Interface {
                    ifindex: iface.system.ifindex.unwrap(),
                },
            }
        })
        .collect::<BTreeSet<_>>();

    // Install route.
    let msg = RouteMsg {
        prefix: *prefix,
        distance: DFLT_DISTANCE,
        metric: route.metric(),
        tag: route.tag,
        reject: false,
        nexthops,
    };
    let _ = sb_tx.send(SouthboundTxMsg::RouteInstall(msg));
}

// Installs a reject route for an active area range, so that traffic to
// unallocated parts of the aggregate is dropped instead of looping.
pub(crate) fn reject_install(
    sb_tx: &ospfd_utils::UnboundedSender<SouthboundTxMsg>,
    prefix: &Ipv4Network,
    metric: u32,
) {
    let msg = RouteMsg {
        prefix: *prefix,
        distance: DFLT_DISTANCE,
        metric,
        tag: None,
        reject: true,
        nexthops: Default::default(),
    };
    let _ = sb_tx.send(SouthboundTxMsg::RouteInstall(msg));
}

pub(crate) fn route_uninstall(
    sb_tx: &ospfd_utils::UnboundedSender<SouthboundTxMsg>,
    prefix: &Ipv4Network,
) {
    let msg = RouteKeyMsg { prefix: *prefix };
    let _ = sb_tx.send(SouthboundTxMsg::RouteUninstall(msg));
}

// ===== Rx: system events =====

pub(crate) fn process_iface_update(
    instance: &mut Instance,
    msg: IfaceUpdateMsg,
) {
    // Lookup area and interface.
    let Some((area_idx, iface_idx)) =
        instance.arenas.areas.indexes().find_map(|area_idx| {
            instance.arenas.areas[area_idx]
                .interfaces
                .get_by_name(&instance.arenas.interfaces, &msg.ifname)
                .map(|(iface_idx, _)| (area_idx, iface_idx))
        })
    else {
        return;
    };

    // Update interface system information.
    let iface = &mut instance.arenas.interfaces[iface_idx];
    iface.system.flags = msg.flags;
    iface.system.mtu = msg.mtu;
    let area = &mut instance.arenas.areas[area_idx];
    area.interfaces.update_ifindex(
        iface_idx,
        &mut instance.arenas.interfaces[iface_idx],
        msg.ifindex,
    );

    // Check if the interface needs to be started or stopped.
    if let Some((instance, arenas)) = instance.as_up() {
        let area = &arenas.areas[area_idx];
        let iface = &mut arenas.interfaces[iface_idx];
        iface.update(
            area,
            &instance,
            &mut arenas.neighbors,
            &arenas.lsa_entries,
        );
    }
}

pub(crate) fn process_addr_add(
    instance: &mut Instance,
    ifname: &str,
    addr: Ipv4Network,
) {
    // Lookup area and interface.
    let Some((area_id, iface_idx, iface_id)) =
        lookup_iface(instance, ifname)
    else {
        return;
    };
    let iface = &mut instance.arenas.interfaces[iface_idx];

    // Add address to interface.
    if !iface.system.addr_list.insert(addr) {
        return;
    }
    if iface.system.primary_addr.is_none() {
        iface.system.primary_addr = Some(addr);
    }

    // Check if the interface needs to be started, and reoriginate LSAs that
    // might have been affected.
    if let Some((instance, arenas)) = instance.as_up()
        && let Ok((_, area)) = arenas.areas.get_by_id(area_id)
    {
        let iface = &mut arenas.interfaces[iface_idx];
        iface.update(
            area,
            &instance,
            &mut arenas.neighbors,
            &arenas.lsa_entries,
        );
        instance.tx.protocol_input.lsa_orig_event(
            LsaOriginateEvent::InterfaceAddrAddDel {
                area_id,
                iface_id,
            },
        );
    }
}

pub(crate) fn process_addr_del(
    instance: &mut Instance,
    ifname: &str,
    addr: Ipv4Network,
) {
    // Lookup area and interface.
    let Some((area_id, iface_idx, iface_id)) =
        lookup_iface(instance, ifname)
    else {
        return;
    };
    let iface = &mut instance.arenas.interfaces[iface_idx];

    // Remove address from interface.
    if !iface.system.addr_list.remove(&addr) {
        return;
    }
    if iface.system.primary_addr == Some(addr) {
        iface.system.primary_addr =
            iface.system.addr_list.first().copied();
    }

    // Check if the interface needs to be stopped, and reoriginate LSAs that
    // might have been affected.
    if let Some((instance, arenas)) = instance.as_up()
        && let Ok((_, area)) = arenas.areas.get_by_id(area_id)
    {
        let iface = &mut arenas.interfaces[iface_idx];
        iface.update(
            area,
            &instance,
            &mut arenas.neighbors,
            &arenas.lsa_entries,
        );
        instance.tx.protocol_input.lsa_orig_event(
            LsaOriginateEvent::InterfaceAddrAddDel {
                area_id,
                iface_id,
            },
        );
    }
}

pub(crate) fn process_router_id_update(
    instance: &mut Instance,
    router_id: Option<Ipv4Addr>,
) {
    instance.system.router_id = router_id;
    instance.update();
}

// The kernel deleted one of our routes behind our back. Keep a retry record;
// if the route is still valid after a quiet period, it's reinstalled.
pub(crate) fn process_krt_delete(instance: &mut Instance, prefix: Ipv4Network) {
    let Some((instance, _)) = instance.as_up() else {
        return;
    };

    if let Some(route) = instance.state.rib.get_mut(&prefix)
        && route.flags.contains(RouteNetFlags::INSTALLED)
    {
        route.flags.remove(RouteNetFlags::INSTALLED);
        let task = crate::tasks::krt_retry_timer(&instance, prefix);
        instance.state.krt_retries.insert(prefix, task);
    }
}

// A route from a previous incarnation is lingering in the kernel; remove it.
pub(crate) fn process_remnant(instance: &mut Instance, prefix: Ipv4Network) {
    let Some((instance, _)) = instance.as_up() else {
        return;
    };

    if !instance.state.rib.contains_key(&prefix) {
        route_uninstall(&instance.tx.sb, &prefix);
    }
}

// ===== helper functions =====

fn lookup_iface(
    instance: &Instance,
    ifname: &str,
) -> Option<(AreaId, InterfaceIndex, InterfaceId)> {
    instance.arenas.areas.iter().find_map(|area| {
        area.interfaces
            .get_by_name(&instance.arenas.interfaces, ifname)
            .map(|(iface_idx, iface)| (area.id, iface_idx, iface.id))
    })
}
