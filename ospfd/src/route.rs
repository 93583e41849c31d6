use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, btree_map};
use std::net::Ipv4Addr;
use std::sync::Arc;

use bitflags::bitflags;
use derive_new::new;
use ipnetwork::Ipv4Network;

use crate::area::{self, Area};
use crate::collections::{Areas, Arena, InterfaceIndex};
use crate::config::ExternalRouteCfg;
use crate::debug::Debug;
use crate::instance::InstanceUpView;
use crate::interface::{Interface, InterfaceType};
use crate::neighbor::Neighbor;
use crate::lsdb::{LSA_INFINITY, LsaEntry};
use crate::packet::lsa::{
    LsaAsExternalFlags, LsaKey, LsaRouterFlags, LsaTypeCode,
};
use crate::southbound;

// Network routing table entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteNet {
    pub area_id: Option<Ipv4Addr>,
    pub origin: Option<LsaKey>,
    pub path_type: PathType,
    pub metric: u32,
    pub type2_metric: Option<u32>,
    pub tag: Option<u32>,
    pub nexthops: Arc<Nexthops>,
    pub flags: RouteNetFlags,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RouteNetFlags: u8 {
        const CONNECTED = 0x01;
        const INSTALLED = 0x02;
        const SUMMARIZED = 0x04;
    }
}

// Router routing table entry.
#[derive(Clone, Debug, Eq, PartialEq, new)]
pub struct RouteRtr {
    pub area_id: Ipv4Addr,
    pub path_type: PathType,
    pub flags: LsaRouterFlags,
    pub metric: u32,
    pub nexthops: Arc<Nexthops>,
}

// Locally originated inter-area "network" route.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SummaryNet {
    pub metric: u32,
}

// Locally originated inter-area "router" route.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SummaryRtr {
    pub metric: u32,
}

// OSPF path types in decreasing order of preference.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum PathType {
    IntraArea,
    InterArea,
    Type1External,
    Type2External,
}

// Route nexthop key.
#[derive(Clone, Copy, Debug, Eq, Hash, new, Ord, PartialEq, PartialOrd)]
pub struct NexthopKey {
    // Nexthop interface.
    pub iface_idx: InterfaceIndex,
    // Nexthop address (`None` for connected routes).
    pub addr: Option<Ipv4Addr>,
}

// Route nexthop.
#[derive(Clone, Copy, Debug, Eq, Hash, new, PartialEq)]
pub struct Nexthop {
    // Nexthop interface.
    pub iface_idx: InterfaceIndex,
    // Nexthop address (`None` for connected routes).
    pub addr: Option<Ipv4Addr>,
    // Router-ID of the remote neighbor (`None` for connected routes).
    pub nbr_router_id: Option<Ipv4Addr>,
}

// Ordered set of nexthops, bounded by the configured maximum.
pub type Nexthops = BTreeMap<NexthopKey, Nexthop>;

// Process-wide canonicalization table for nexthop sets.
//
// Value-equal sets are represented by the same allocation, so pointer
// identity implies equality and "did the nexthop set change?" is an O(1)
// test.
#[derive(Debug, Default)]
pub struct NexthopInterner(HashMap<Nexthops, Arc<Nexthops>>);

// ===== impl RouteNet =====

impl RouteNet {
    pub(crate) fn metric(&self) -> u32 {
        match self.path_type {
            PathType::IntraArea | PathType::InterArea => self.metric,
            PathType::Type1External => self.metric,
            PathType::Type2External => self.type2_metric.unwrap(),
        }
    }
}

// ===== impl NexthopInterner =====

impl NexthopInterner {
    // Returns the canonical shared copy of the given nexthop set.
    //
    // Entries are never freed: the number of distinct multipath sets is
    // bounded by the topology.
    pub(crate) fn intern(&mut self, nexthops: Nexthops) -> Arc<Nexthops> {
        if let Some(interned) = self.0.get(&nexthops) {
            return interned.clone();
        }
        let interned = Arc::new(nexthops.clone());
        self.0.insert(nexthops, interned.clone());
        interned
    }
}

// ===== global functions =====

// Updates the entire OSPF routing table.
pub(crate) fn update_rib(
    instance: &mut InstanceUpView<'_>,
    areas: &mut Areas,
    interfaces: &Arena<Interface>,
    lsa_entries: &Arena<LsaEntry>,
) {
    let mut rib = BTreeMap::new();
    let old_rib = std::mem::take(&mut instance.state.rib);

    // Compute intra-area routes.
    for area_idx in areas.indexes().collect::<Vec<_>>() {
        let area = &mut areas[area_idx];
        update_rib_intra_area(&mut rib, area, instance);
    }

    // Compute inter-area routes.
    let active_areas = areas.active_count(interfaces);
    for area in areas.iter_mut() {
        // If the router has active attachments to multiple areas, only
        // backbone summary-LSAs are examined.
        if active_areas > 1 && !area.is_backbone() {
            continue;
        }

        update_rib_inter_area_networks(&mut rib, area, instance, lsa_entries);
        update_rib_inter_area_routers(area, instance, lsa_entries);
    }

    // If the backbone is reachable through a transit area, shorter paths
    // via that area supersede the backbone-learned ones.
    update_rib_transit_fixup(&mut rib, instance, areas, lsa_entries);

    // Compute external routes.
    update_rib_external(&mut rib, instance, areas, lsa_entries);

    // Update OSPF routes in the global RIB.
    update_global_rib(&mut rib, old_rib, instance, interfaces);

    // Save updated RIB.
    instance.state.rib = rib;
}

// ===== helper functions =====

// Computes intra-area routes from the shortest-path trees.
fn update_rib_intra_area(
    rib: &mut BTreeMap<Ipv4Network, RouteNet>,
    area: &mut Area,
    instance: &mut InstanceUpView<'_>,
) {
    // Iterate over all stub networks and their corresponding vertices.
    let stubs = crate::spf::intra_area_networks(area);
    for stub in stubs {
        // Calculate stub metric.
        let metric = stub.distance.saturating_add(stub.metric) as u32;

        // Compare this distance to the current best cost to the stub
        // network.
        if let Some(best_route) = rib.get(&stub.prefix)
            && metric > best_route.metric
        {
            continue;
        }

        // If the newly added vertex is a transit network, multiple vertices
        // might have mapped to the same IP network (e.g. when a new
        // Designated Router is being established). In this case, the current
        // routing table entry should be overwritten if and only if the newly
        // found path is just as short and the current routing table entry's
        // Link State Origin has a smaller Link State ID than the newly added
        // vertex's LSA.
        if !stub.from_router
            && let btree_map::Entry::Occupied(o) = rib.entry(stub.prefix)
        {
            let curr_route = o.get();
            if metric > curr_route.metric
                || stub.origin.lsa_id < curr_route.origin.unwrap().lsa_id
            {
                continue;
            }
            o.remove();
        }

        // Create new intra-area route.
        let mut flags = RouteNetFlags::empty();
        if stub.connected {
            flags.insert(RouteNetFlags::CONNECTED);
        }
        let new_route = RouteNet {
            area_id: Some(area.area_id),
            path_type: PathType::IntraArea,
            origin: Some(stub.origin),
            metric,
            type2_metric: None,
            tag: None,
            nexthops: instance
                .state
                .nexthops_interner
                .intern(stub.nexthops),
            flags,
        };

        // Try to add or update stub route in the RIB.
        route_update(
            rib,
            stub.prefix,
            new_route,
            &mut instance.state.nexthops_interner,
            instance.config.max_paths,
        );
    }
}

// Computes inter-area "network" routes.
fn update_rib_inter_area_networks(
    rib: &mut BTreeMap<Ipv4Network, RouteNet>,
    area: &mut Area,
    instance: &mut InstanceUpView<'_>,
    lsa_entries: &Arena<LsaEntry>,
) {
    // Examine all Type-3 Summary-LSAs.
    let router_id = instance.state.router_id;
    for (_, lse) in area
        .state
        .lsdb
        .iter_by_type(lsa_entries, LsaTypeCode::SummaryNetwork.into())
        .filter(|(_, lse)| !lse.data.hdr.is_maxage())
        // Filter out LSAs originated by the calculating router itself.
        .filter(|(_, lse)| lse.data.hdr.adv_rtr != router_id)
    {
        let lsa = &lse.data;
        let lsa_body = lsa.body.as_summary_network().unwrap();
        let Ok(prefix) =
            Ipv4Network::with_netmask(lsa.hdr.lsa_id, lsa_body.mask)
        else {
            continue;
        };

        // Filter out unreachable LSAs.
        if lsa_body.metric >= LSA_INFINITY {
            continue;
        }

        // Look up the routing table entry for the advertising border router.
        let route_br = match area
            .state
            .routers
            .get(&lsa.hdr.adv_rtr)
            .filter(|route| route.flags.is_abr())
        {
            Some(route_br) => route_br,
            None => {
                // If no such entry exists for router BR, do nothing with
                // this LSA and consider the next in the list.
                Debug::SpfNetworkUnreachableAbr(&prefix, lsa.hdr.adv_rtr)
                    .log();
                continue;
            }
        };

        // The inter-area path cost is the distance to BR plus the cost
        // specified in the LSA.
        let metric = route_br.metric + lsa_body.metric;

        // Create new inter-area route.
        let new_route = RouteNet {
            area_id: Some(area.area_id),
            path_type: PathType::InterArea,
            origin: None,
            metric,
            type2_metric: None,
            tag: None,
            nexthops: route_br.nexthops.clone(),
            flags: RouteNetFlags::empty(),
        };

        // Try to add or update summary route in the RIB.
        route_update(
            rib,
            prefix,
            new_route,
            &mut instance.state.nexthops_interner,
            instance.config.max_paths,
        );
    }
}

// Computes inter-area "router" (ASBR) routes.
fn update_rib_inter_area_routers(
    area: &mut Area,
    instance: &mut InstanceUpView<'_>,
    lsa_entries: &Arena<LsaEntry>,
) {
    // Examine all Type-4 ASBR-Summary-LSAs.
    let router_id = instance.state.router_id;
    let mut new_routes = vec![];
    for (_, lse) in area
        .state
        .lsdb
        .iter_by_type(lsa_entries, LsaTypeCode::SummaryRouter.into())
        .filter(|(_, lse)| !lse.data.hdr.is_maxage())
        // Filter out LSAs originated by the calculating router itself.
        .filter(|(_, lse)| lse.data.hdr.adv_rtr != router_id)
    {
        let lsa = &lse.data;
        let lsa_body = lsa.body.as_summary_router().unwrap();

        // Filter out unreachable LSAs.
        if lsa_body.metric >= LSA_INFINITY {
            continue;
        }

        // Look up the routing table entry for the advertising border router.
        let route_br = match area
            .state
            .routers
            .get(&lsa.hdr.adv_rtr)
            .filter(|route| route.flags.is_abr())
        {
            Some(route_br) => route_br,
            None => {
                Debug::SpfRouterUnreachableAbr(
                    &lsa.hdr.lsa_id,
                    lsa.hdr.adv_rtr,
                )
                .log();
                continue;
            }
        };

        // The inter-area path cost is the distance to BR plus the cost
        // specified in the LSA.
        let metric = route_br.metric + lsa_body.metric;

        // Intra-area routes to the ASBR are always preferred.
        if area
            .state
            .routers
            .get(&lsa.hdr.lsa_id)
            .is_some_and(|route| route.path_type == PathType::IntraArea)
        {
            continue;
        }

        let new_route = RouteRtr::new(
            area.area_id,
            PathType::InterArea,
            LsaRouterFlags::E,
            metric,
            route_br.nexthops.clone(),
        );
        new_routes.push((lsa.hdr.lsa_id, new_route));
    }

    for (router_id, new_route) in new_routes {
        match area.state.routers.entry(router_id) {
            btree_map::Entry::Occupied(mut o) => {
                if new_route.metric < o.get().metric {
                    *o.get_mut() = new_route;
                }
            }
            btree_map::Entry::Vacant(v) => {
                v.insert(new_route);
            }
        }
    }
}

// Re-examines backbone routes when a transit area provides a shorter path
// (RFC 2328, section 16.3).
fn update_rib_transit_fixup(
    rib: &mut BTreeMap<Ipv4Network, RouteNet>,
    instance: &mut InstanceUpView<'_>,
    areas: &Areas,
    lsa_entries: &Arena<LsaEntry>,
) {
    let router_id = instance.state.router_id;

    for area in areas
        .iter()
        .filter(|area| !area.is_backbone())
        .filter(|area| area.state.transit_capability)
    {
        for (_, lse) in area
            .state
            .lsdb
            .iter_by_type(lsa_entries, LsaTypeCode::SummaryNetwork.into())
            .filter(|(_, lse)| !lse.data.hdr.is_maxage())
            .filter(|(_, lse)| lse.data.hdr.adv_rtr != router_id)
        {
            let lsa = &lse.data;
            let lsa_body = lsa.body.as_summary_network().unwrap();
            let Ok(prefix) =
                Ipv4Network::with_netmask(lsa.hdr.lsa_id, lsa_body.mask)
            else {
                continue;
            };
            if lsa_body.metric >= LSA_INFINITY {
                continue;
            }

            // Only routes learned through the backbone are re-examined.
            let Some(route) = rib.get_mut(&prefix) else {
                continue;
            };
            if route.area_id != Some(Ipv4Addr::UNSPECIFIED) {
                continue;
            }

            // Check the cost through the transit area.
            let Some(route_br) = area
                .state
                .routers
                .get(&lsa.hdr.adv_rtr)
                .filter(|route| route.flags.is_abr())
            else {
                continue;
            };
            let metric = route_br.metric + lsa_body.metric;
            if metric < route.metric {
                route.metric = metric;
                route.nexthops = route_br.nexthops.clone();
            }
        }
    }
}

// Computes AS external routes.
fn update_rib_external(
    rib: &mut BTreeMap<Ipv4Network, RouteNet>,
    instance: &mut InstanceUpView<'_>,
    areas: &Areas,
    lsa_entries: &Arena<LsaEntry>,
) {
    // Examine all AS-external-LSAs.
    let router_id = instance.state.router_id;
    let mut new_routes = vec![];
    for (_, lse) in instance
        .state
        .lsdb
        .iter_by_type(lsa_entries, LsaTypeCode::AsExternal.into())
        .filter(|(_, lse)| !lse.data.hdr.is_maxage())
        // Filter out LSAs originated by the calculating router itself.
        .filter(|(_, lse)| lse.data.hdr.adv_rtr != router_id)
    {
        let lsa = &lse.data;
        let lsa_body = lsa.body.as_as_external().unwrap();
        let Ok(prefix) =
            Ipv4Network::with_netmask(lsa.hdr.lsa_id, lsa_body.mask)
        else {
            continue;
        };

        // Filter out unreachable LSAs.
        if lsa_body.metric >= LSA_INFINITY {
            continue;
        }

        // Look up the routing table entries (potentially one per attached
        // area) for the AS boundary router that originated the LSA.
        let mut asbr_routes = areas
            .iter()
            .filter_map(|area| {
                area.state
                    .routers
                    .get(&lsa.hdr.adv_rtr)
                    .filter(|route| route.flags.is_asbr())
            })
            .collect::<Vec<_>>();

        // Intra-area paths using non-backbone areas are always the most
        // preferred.
        let asbr_routes_pruned = asbr_routes
            .iter()
            .copied()
            .filter(|route| {
                route.path_type == PathType::IntraArea
                    && route.area_id != Ipv4Addr::UNSPECIFIED
            })
            .collect::<Vec<_>>();
        if !asbr_routes_pruned.is_empty() {
            asbr_routes = asbr_routes_pruned;
        }

        // Select the routing table entry with the least cost; when there are
        // multiple least cost routing table entries the entry whose
        // associated area has the largest OSPF Area ID is chosen.
        let route_asbr = match asbr_routes.iter().reduce(|best, route| {
            match route.metric.cmp(&best.metric) {
                Ordering::Less => route,
                Ordering::Equal => {
                    if route.area_id > best.area_id {
                        route
                    } else {
                        best
                    }
                }
                Ordering::Greater => best,
            }
        }) {
            Some(route_asbr) => route_asbr,
            None => {
                // If no entries exist for the ASBR, do nothing with this LSA
                // and consider the next in the list.
                Debug::SpfUnreachableAsbr(&prefix, lsa.hdr.adv_rtr).log();
                continue;
            }
        };

        // Examine the forwarding address, when present: it must be reachable
        // through an intra-area or inter-area path, and that path supplies
        // the nexthops.
        let (base_metric, nexthops, exit_area) = match lsa_body.fwd_addr {
            Some(fwd_addr) => {
                match rib_lookup(rib, fwd_addr).filter(|route| {
                    matches!(
                        route.path_type,
                        PathType::IntraArea | PathType::InterArea
                    )
                }) {
                    Some(route_fwd) => (
                        route_fwd.metric,
                        route_fwd.nexthops.clone(),
                        route_fwd.area_id,
                    ),
                    None => continue,
                }
            }
            None => (
                route_asbr.metric,
                route_asbr.nexthops.clone(),
                Some(route_asbr.area_id),
            ),
        };

        // Get path type and metric.
        let e_bit = lsa_body.flags.contains(LsaAsExternalFlags::E);
        let (path_type, metric, type2_metric) = match e_bit {
            true => {
                (PathType::Type2External, base_metric, Some(lsa_body.metric))
            }
            false => {
                (PathType::Type1External, base_metric + lsa_body.metric, None)
            }
        };

        // Create new external route. The exit area is recorded so that the
        // non-backbone preference tie-breaker can be applied.
        let new_route = RouteNet {
            area_id: exit_area,
            path_type,
            origin: Some(lsa.hdr.key()),
            metric,
            type2_metric,
            tag: Some(lsa_body.tag),
            nexthops,
            flags: RouteNetFlags::empty(),
        };

        new_routes.push((prefix, new_route));
    }

    for (prefix, new_route) in new_routes {
        // Locally configured external routes compete under the same
        // tie-breaking rules; when the local route is preferred, the LSA
        // derived one is suppressed.
        if let Some(ext) = instance.config.external_routes.get(&prefix)
            && external_local_preferred(ext, &new_route)
        {
            continue;
        }

        // Try to add or update external route in the RIB.
        route_update(
            rib,
            prefix,
            new_route,
            &mut instance.state.nexthops_interner,
            instance.config.max_paths,
        );
    }
}

// Compares a locally configured external route against a computed one using
// the AS-external tie-breakers.
fn external_local_preferred(
    ext: &ExternalRouteCfg,
    computed: &RouteNet,
) -> bool {
    let local_path_type = if ext.metric_type2 {
        PathType::Type2External
    } else {
        PathType::Type1External
    };

    match local_path_type.cmp(&computed.path_type) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => ext.metric <= computed.metric(),
    }
}

// Longest-prefix-match lookup in the OSPF routing table.
fn rib_lookup(
    rib: &BTreeMap<Ipv4Network, RouteNet>,
    addr: Ipv4Addr,
) -> Option<&RouteNet> {
    rib.iter()
        .filter(|(prefix, _)| prefix.contains(addr))
        .max_by_key(|(prefix, _)| prefix.prefix())
        .map(|(_, route)| route)
}

// Updates OSPF routes in the global RIB.
//
// This step should be done at the end of the routing table calculation to
// prevent transient states from affecting the forwarding plane.
fn update_global_rib(
    rib: &mut BTreeMap<Ipv4Network, RouteNet>,
    mut old_rib: BTreeMap<Ipv4Network, RouteNet>,
    instance: &mut InstanceUpView<'_>,
    interfaces: &Arena<Interface>,
) {
    // While restarting gracefully, the forwarding table is left untouched;
    // the preserved forwarding state keeps carrying traffic.
    if instance.state.gr.is_some() {
        for (prefix, route) in rib.iter_mut() {
            if let Some(old_route) = old_rib.remove(prefix)
                && old_route.flags.contains(RouteNetFlags::INSTALLED)
            {
                route.flags.insert(RouteNetFlags::INSTALLED);
            }
        }
        return;
    }

    // Install new routes or routes that have changed.
    for (prefix, route) in rib.iter_mut() {
        // Remove route from the old RIB if it's present.
        if let Some(old_route) = old_rib.remove(prefix) {
            // Skip reinstalling the route if it hasn't changed. Nexthop sets
            // are interned, so pointer identity decides.
            if old_route.metric() == route.metric()
                && old_route.tag == route.tag
                && Arc::ptr_eq(&old_route.nexthops, &route.nexthops)
            {
                if old_route.flags.contains(RouteNetFlags::INSTALLED) {
                    route.flags.insert(RouteNetFlags::INSTALLED);
                }
                continue;
            }
        }

        // The list of nexthops might be empty in the case of nexthop
        // computation errors. When that happens, ensure the route is removed
        // from the RIB.
        if !route.flags.contains(RouteNetFlags::CONNECTED)
            && !route.nexthops.is_empty()
        {
            southbound::route_install(
                &instance.tx.sb,
                prefix,
                route,
                interfaces,
            );
            route.flags.insert(RouteNetFlags::INSTALLED);
        } else if route.flags.contains(RouteNetFlags::INSTALLED) {
            southbound::route_uninstall(&instance.tx.sb, prefix);
            route.flags.remove(RouteNetFlags::INSTALLED);
        }
    }

    // Uninstall routes that are no longer available.
    for (dest, _) in old_rib
        .into_iter()
        .filter(|(_, route)| route.flags.contains(RouteNetFlags::INSTALLED))
    {
        southbound::route_uninstall(&instance.tx.sb, &dest);
    }
}

fn route_update(
    rib: &mut BTreeMap<Ipv4Network, RouteNet>,
    prefix: Ipv4Network,
    route: RouteNet,
    interner: &mut NexthopInterner,
    max_paths: u16,
) {
    let route = match rib.entry(prefix) {
        btree_map::Entry::Occupied(o) => {
            let curr_route = o.into_mut();

            match route_compare(&route, curr_route) {
                Ordering::Less => {
                    // Overwrite the current routing table entry, but preserve
                    // the flag indicating whether the route is installed or
                    // not.
                    let installed =
                        curr_route.flags.contains(RouteNetFlags::INSTALLED);
                    *curr_route = route;
                    if installed {
                        curr_route.flags.insert(RouteNetFlags::INSTALLED);
                    }
                }
                Ordering::Equal => {
                    // Merge nexthops.
                    let mut merged = (*curr_route.nexthops).clone();
                    merged.extend(route.nexthops.iter().map(|(k, v)| (*k, *v)));
                    curr_route.nexthops = interner.intern(merged);
                }
                Ordering::Greater => {
                    // Ignore less preferred route.
                }
            }

            curr_route
        }
        btree_map::Entry::Vacant(v) => v.insert(route),
    };

    // Honor configured maximum number of ECMP paths.
    if route.nexthops.len() > max_paths as usize {
        let bounded = route
            .nexthops
            .iter()
            .map(|(k, v)| (*k, *v))
            .take(max_paths as usize)
            .collect();
        route.nexthops = interner.intern(bounded);
    }
}

fn route_compare(a: &RouteNet, b: &RouteNet) -> Ordering {
    let cmp = a.path_type.cmp(&b.path_type);
    if cmp != Ordering::Equal {
        return cmp;
    }

    match a.path_type {
        PathType::IntraArea | PathType::InterArea => a.metric.cmp(&b.metric),
        PathType::Type1External => {
            let cmp = non_backbone_preference(a, b);
            if cmp != Ordering::Equal {
                return cmp;
            }

            a.metric.cmp(&b.metric)
        }
        PathType::Type2External => {
            let cmp = a.type2_metric.cmp(&b.type2_metric);
            if cmp != Ordering::Equal {
                return cmp;
            }

            let cmp = non_backbone_preference(a, b);
            if cmp != Ordering::Equal {
                return cmp;
            }

            a.metric.cmp(&b.metric)
        }
    }
}

// External paths exiting through a non-backbone area are preferred over ones
// through the backbone (RFC 2328, section 16.4.1).
fn non_backbone_preference(a: &RouteNet, b: &RouteNet) -> Ordering {
    let a_backbone = a.area_id == Some(Ipv4Addr::UNSPECIFIED);
    let b_backbone = b.area_id == Some(Ipv4Addr::UNSPECIFIED);
    a_backbone.cmp(&b_backbone)
}

// ===== virtual link resolution =====

// Resolves the endpoints of configured virtual links from the transit
// areas' routing tables, bringing the corresponding interfaces up or down.
pub(crate) fn update_virtual_links(
    instance: &mut InstanceUpView<'_>,
    areas: &mut Areas,
    interfaces: &mut Arena<Interface>,
    neighbors: &mut Arena<Neighbor>,
    lsa_entries: &Arena<LsaEntry>,
) {
    let mut updates = vec![];
    for area in areas.iter() {
        for iface_idx in area.interfaces.indexes() {
            let iface = &interfaces[iface_idx];
            if iface.config.if_type != InterfaceType::VirtualLink {
                continue;
            }
            let Some(vlink) = &iface.config.vlink else {
                continue;
            };

            // Resolve the endpoints through the transit area.
            let endpoints = areas
                .get_by_area_id(vlink.transit_area_id)
                .filter(|(_, transit_area)| {
                    transit_area.state.transit_capability
                        || transit_area
                            .state
                            .routers
                            .contains_key(&vlink.router_id)
                })
                .and_then(|(_, transit_area)| {
                    let route_br = transit_area
                        .state
                        .routers
                        .get(&vlink.router_id)
                        .filter(|route| {
                            route.path_type == PathType::IntraArea
                        })
                        .filter(|route| route.metric < LSA_INFINITY)?;
                    let src = area::vlink_source_addr(route_br, interfaces)?;
                    let remote = area::vlink_neighbor_addr(
                        transit_area,
                        vlink.router_id,
                        lsa_entries,
                    )?;
                    Some((src, remote, route_br.metric))
                });

            updates.push((area.id, iface_idx, endpoints));
        }
    }

    for (area_id, iface_idx, endpoints) in updates {
        let Ok((_, area)) = areas.get_by_id(area_id) else {
            continue;
        };
        let iface = &mut interfaces[iface_idx];
        match endpoints {
            Some((src, remote, cost)) => {
                iface.state.vlink_src = Some(src);
                iface.state.vlink_remote = Some(remote);
                iface.config.cost = cost as u16;
            }
            None => {
                iface.state.vlink_src = None;
                iface.state.vlink_remote = None;
            }
        }
        iface.update(area, instance, neighbors, lsa_entries);
    }
}
