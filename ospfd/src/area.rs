use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use ospfd_utils::ip::Ipv4NetworkExt;

use crate::collections::{
    AreaId, AreaIndex, Areas, Arena, Interfaces, Lsdb, LsdbId,
};
use crate::config::{AreaCfg, AreaType, RangeCfg};
use crate::debug::LsaFlushReason;
use crate::instance::InstanceUpView;
use crate::interface::Interface;
use crate::lsdb::{LSA_INFINITY, LsaEntry, LsaEntryFlags};
use crate::packet::Options;
use crate::packet::lsa::{
    Lsa, LsaBody, LsaKey, LsaRouterLinkType, LsaSummary, LsaType, LsaTypeCode,
};
use crate::route::{PathType, RouteNet, RouteNetFlags, RouteRtr, SummaryNet, SummaryRtr};
use crate::spf::Vertex;
use crate::{southbound, spf};

// OSPF area.
#[derive(Debug)]
pub struct Area {
    // ID.
    pub id: AreaId,
    // Area ID.
    pub area_id: Ipv4Addr,
    // Area configuration data.
    pub config: AreaCfg,
    // Area state data.
    pub state: AreaState,
    // Area ranges.
    pub ranges: HashMap<Ipv4Network, Range>,
    // Area interfaces.
    pub interfaces: Interfaces,
}

// OSPF area state.
#[derive(Debug)]
pub struct AreaState {
    // LSDB of area-scope LSAs.
    pub lsdb: Lsdb,
    // Indicates whether the area can carry data traffic that neither
    // originates nor terminates in the area itself.
    pub transit_capability: bool,
    // Shortest-path tree.
    pub spt: BTreeMap<spf::VertexId, Vertex>,
    // Table of all routers in the area.
    pub routers: BTreeMap<Ipv4Addr, RouteRtr>,
    // Table of summaries originated into this area.
    pub net_summaries: BTreeMap<Ipv4Network, (Ipv4Addr, SummaryNet)>,
    pub rtr_summaries: BTreeMap<Ipv4Addr, (Ipv4Addr, SummaryRtr)>,
    // Statistics.
    pub spf_run_count: u32,
    pub discontinuity_time: DateTime<Utc>,
}

// OSPF area range.
#[derive(Debug, Default)]
pub struct Range {
    pub config: RangeCfg,
    // Largest cost among the contained intra-area routes; zero while the
    // range is inactive.
    pub cost: u32,
}

// ===== impl Area =====

impl Area {
    // Create new area.
    pub(crate) fn new(id: AreaId, area_id: Ipv4Addr) -> Self {
        Self {
            id,
            area_id,
            config: Default::default(),
            state: Default::default(),
            ranges: Default::default(),
            interfaces: Default::default(),
        }
    }

    // Returns whether this area is active.
    //
    // An area is active as long as it contains at least one operational
    // interface.
    pub(crate) fn is_active(&self, interfaces: &Arena<Interface>) -> bool {
        self.interfaces
            .iter(interfaces)
            .any(|iface| !iface.is_down())
    }

    // Returns whether this is the backbone area.
    pub(crate) fn is_backbone(&self) -> bool {
        self.area_id == Ipv4Addr::UNSPECIFIED
    }

    // Returns the options used in packets sent on the given interface.
    pub(crate) fn options(&self, iface: &Interface) -> Options {
        let mut options = self.options_lsa();

        if iface.config.demand_circuit {
            options.insert(Options::DC);
        }
        options.insert(Options::O);

        options
    }

    // Returns the options used in self-originated LSAs.
    pub(crate) fn options_lsa(&self) -> Options {
        let mut options = Options::empty();

        if self.config.area_type == AreaType::Normal {
            options.insert(Options::E);
        }

        options
    }
}

// ===== impl AreaState =====

impl Default for AreaState {
    fn default() -> AreaState {
        AreaState {
            lsdb: Default::default(),
            transit_capability: false,
            spt: Default::default(),
            routers: Default::default(),
            net_summaries: Default::default(),
            rtr_summaries: Default::default(),
            spf_run_count: 0,
            discontinuity_time: Utc::now(),
        }
    }
}

// ===== global functions =====

// Recomputes the active ranges and the summary-LSAs originated into every
// area. Runs after each routing table update.
pub(crate) fn update_summary_lsas(
    instance: &mut InstanceUpView<'_>,
    areas: &mut Areas,
    interfaces: &Arena<Interface>,
    lsa_entries: &Arena<LsaEntry>,
) {
    // Check ABR status.
    let is_abr = areas.is_abr(interfaces);

    // Clear the summarized flag from all routes.
    for route in instance.state.rib.values_mut() {
        route.flags.remove(RouteNetFlags::SUMMARIZED);
    }

    // Check which routes should be summarized and which area ranges are
    // active.
    for area in areas.iter_mut() {
        update_net_ranges(area, is_abr, instance);
    }

    // Install reject routes for the active ranges so traffic to unallocated
    // parts of an aggregate is dropped instead of following the default.
    for area in areas.iter() {
        for (prefix, range) in area
            .ranges
            .iter()
            .filter(|(_, range)| range.cost != 0)
        {
            southbound::reject_install(&instance.tx.sb, prefix, range.cost);
        }
    }

    // Proceed to originate and/or flush summary LSAs as required.
    for area_idx in areas.indexes().collect::<Vec<_>>() {
        update_net_summary_lsas(area_idx, is_abr, instance, areas, lsa_entries);
        update_rtr_summary_lsas(area_idx, is_abr, instance, areas, lsa_entries);
    }
}

fn update_net_ranges(
    area: &mut Area,
    is_abr: bool,
    instance: &mut InstanceUpView<'_>,
) {
    // Reset area ranges.
    for range in area.ranges.values_mut() {
        range.cost = 0;
    }

    // Area ranges are only checked when the router is an ABR.
    if is_abr {
        for (prefix, route) in instance
            .state
            .rib
            .iter_mut()
            // Select intra-area routes from this area.
            .filter(|(_, route)| route.path_type == PathType::IntraArea)
            .filter(|(_, route)| route.area_id == Some(area.area_id))
            // Skip unreachable destinations.
            .filter(|(_, route)| route.metric < LSA_INFINITY)
        {
            // Check if the network is contained in an explicitly configured
            // address range.
            if let Some((_, range)) = area
                .ranges
                .iter_mut()
                .find(|(range_prefix, _)| range_prefix.is_supernet_of(*prefix))
            {
                route.flags.insert(RouteNetFlags::SUMMARIZED);

                // The advertised cost of an active range is the largest cost
                // of the routes it covers.
                if route.metric > range.cost {
                    range.cost = route.metric;
                }
            }
        }
    }
}

fn update_net_summary_lsas(
    area_idx: AreaIndex,
    is_abr: bool,
    instance: &InstanceUpView<'_>,
    areas: &mut Areas,
    lsa_entries: &Arena<LsaEntry>,
) {
    // Compute summary routes.
    let area = &areas[area_idx];
    let new_summaries = compute_net_summaries(is_abr, area, instance, areas);

    // Save the old table of summary routes.
    let area = &mut areas[area_idx];
    let mut old_summaries = std::mem::take(&mut area.state.net_summaries);

    // (Re)originate the required Summary-LSAs.
    area.state.net_summaries = new_summaries
        .into_iter()
        .map(|(prefix, new_summary)| {
            let lsa_id = match old_summaries.remove(&prefix) {
                Some((old_lsa_id, old_summary)) => {
                    // Reoriginate summary LSA if the route has changed,
                    // reusing the previous LSA-ID.
                    if new_summary != old_summary {
                        lsa_orig_summary_net(
                            area,
                            instance,
                            prefix,
                            old_lsa_id,
                            &new_summary,
                        );
                    }
                    old_lsa_id
                }
                None => {
                    // Originate new summary LSA.
                    let lsa_id = prefix.ip();
                    lsa_orig_summary_net(
                        area,
                        instance,
                        prefix,
                        lsa_id,
                        &new_summary,
                    );
                    lsa_id
                }
            };

            (prefix, (lsa_id, new_summary))
        })
        .collect();

    // Flush old summaries that are no longer valid.
    let lsa_type = LsaTypeCode::SummaryNetwork.into();
    let lsa_ids = old_summaries.into_values().map(|(lsa_id, _)| lsa_id);
    flush_summary_lsas(lsa_type, lsa_ids, area, instance, lsa_entries);
}

fn update_rtr_summary_lsas(
    area_idx: AreaIndex,
    is_abr: bool,
    instance: &InstanceUpView<'_>,
    areas: &mut Areas,
    lsa_entries: &Arena<LsaEntry>,
) {
    // Compute summary routes.
    let area = &areas[area_idx];
    let new_summaries = compute_rtr_summaries(is_abr, area, areas);

    // Save the old table of summary routes.
    let area = &mut areas[area_idx];
    let mut old_summaries = std::mem::take(&mut area.state.rtr_summaries);

    // (Re)originate the required ASBR-Summary-LSAs.
    area.state.rtr_summaries = new_summaries
        .into_iter()
        .map(|(router_id, new_summary)| {
            let lsa_id = match old_summaries.remove(&router_id) {
                Some((old_lsa_id, old_summary)) => {
                    if new_summary != old_summary {
                        lsa_orig_summary_rtr(
                            area,
                            instance,
                            router_id,
                            &new_summary,
                        );
                    }
                    old_lsa_id
                }
                None => {
                    lsa_orig_summary_rtr(
                        area,
                        instance,
                        router_id,
                        &new_summary,
                    );
                    router_id
                }
            };

            (router_id, (lsa_id, new_summary))
        })
        .collect();

    // Flush old summaries that are no longer valid.
    let lsa_type = LsaTypeCode::SummaryRouter.into();
    let lsa_ids = old_summaries.into_values().map(|(lsa_id, _)| lsa_id);
    flush_summary_lsas(lsa_type, lsa_ids, area, instance, lsa_entries);
}

// Originates a Type-3 Summary-LSA.
fn lsa_orig_summary_net(
    area: &Area,
    instance: &InstanceUpView<'_>,
    prefix: Ipv4Network,
    lsa_id: Ipv4Addr,
    summary: &SummaryNet,
) {
    let lsdb_id = LsdbId::Area(area.id);
    let options = area.options_lsa();

    let lsa_body = LsaBody::SummaryNetwork(LsaSummary {
        mask: prefix.mask(),
        metric: summary.metric,
    });
    instance
        .tx
        .protocol_input
        .lsa_orig_check(lsdb_id, options, lsa_id, lsa_body);
}

// Originates a Type-4 ASBR-Summary-LSA.
fn lsa_orig_summary_rtr(
    area: &Area,
    instance: &InstanceUpView<'_>,
    router_id: Ipv4Addr,
    summary: &SummaryRtr,
) {
    let lsdb_id = LsdbId::Area(area.id);
    let options = area.options_lsa();

    let lsa_body = LsaBody::SummaryRouter(LsaSummary {
        mask: Ipv4Addr::BROADCAST,
        metric: summary.metric,
    });
    instance
        .tx
        .protocol_input
        .lsa_orig_check(lsdb_id, options, router_id, lsa_body);
}

fn compute_net_summaries(
    is_abr: bool,
    area: &Area,
    instance: &InstanceUpView<'_>,
    areas: &Areas,
) -> Vec<(Ipv4Network, SummaryNet)> {
    let mut summaries = vec![];

    // Only ABRs should originate summaries.
    if !is_abr {
        return summaries;
    }

    // Add regular summaries and ranges, except for stub areas with
    // import-summaries disabled.
    if area.config.area_type == AreaType::Normal || area.config.summary {
        let rsummaries = compute_net_regular_summaries(area, instance);
        summaries.extend(rsummaries);

        let rsummaries = compute_net_range_summaries(area, areas);
        summaries.extend(rsummaries);
    }

    // Add default route for stub areas.
    if area.config.area_type != AreaType::Normal {
        let prefix = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).unwrap();
        let default_summary = SummaryNet {
            metric: area.config.default_cost,
        };
        summaries.push((prefix, default_summary));
    }

    summaries
}

fn compute_net_regular_summaries<'a>(
    area: &'a Area,
    instance: &'a InstanceUpView<'_>,
) -> impl Iterator<Item = (Ipv4Network, SummaryNet)> + 'a {
    instance
        .state
        .rib
        .iter()
        // AS external routes are never advertised in summary-LSAs.
        .filter(|(_, route)| {
            !matches!(
                route.path_type,
                PathType::Type1External | PathType::Type2External
            )
        })
        // Skip unreachable destinations.
        .filter(|(_, route)| route.metric < LSA_INFINITY)
        // Skip route if it's associated with the area itself.
        .filter(|(_, route)| route.area_id != Some(area.area_id))
        // Only intra-area routes are advertised into the backbone.
        .filter(|(_, route)| {
            route.path_type == PathType::IntraArea || !area.is_backbone()
        })
        // Check if the nexthops associated with this route belong to the
        // area. This is the logical equivalent of a Distance Vector
        // protocol's split horizon logic.
        .filter(|(_, route)| !nexthops_area_check(route, area))
        // Check if the network is not contained in any explicitly configured
        // address range.
        .filter(|(_, route)| {
            // The backbone's configured ranges should be ignored when
            // originating summary-LSAs into transit areas.
            if route.area_id == Some(Ipv4Addr::UNSPECIFIED)
                && area.state.transit_capability
            {
                true
            } else {
                !route.flags.contains(RouteNetFlags::SUMMARIZED)
            }
        })
        // Map to summary route.
        .map(|(prefix, route)| {
            let summary = SummaryNet {
                metric: route.metric,
            };
            (*prefix, summary)
        })
}

fn compute_net_range_summaries<'a>(
    area: &'a Area,
    areas: &'a Areas,
) -> impl Iterator<Item = (Ipv4Network, SummaryNet)> + 'a {
    areas
        .iter()
        // Check all other areas.
        .filter(|other_area| other_area.area_id != area.area_id)
        // The backbone's configured ranges should be ignored when
        // originating summary-LSAs into transit areas.
        .filter(|other_area| {
            !(other_area.is_backbone() && area.state.transit_capability)
        })
        .flat_map(move |other_area| {
            // Check the other area's configured ranges. A range configured
            // in multiple areas is advertised from the area where it's
            // active with the lowest cost.
            other_area
                .ranges
                .iter()
                // Skip inactive ranges.
                .filter(|(_, range)| range.cost != 0)
                // Skip ranges whose advertisement isn't enabled.
                .filter(|(_, range)| range.config.advertise)
                // Skip ranges for which another area holds an active, lower
                // cost instance.
                .filter(move |(range_prefix, range)| {
                    !areas
                        .iter()
                        .filter(|a| a.area_id != other_area.area_id)
                        .filter_map(|a| a.ranges.get(*range_prefix))
                        .any(|other| {
                            other.cost != 0 && other.cost < range.cost
                        })
                })
                // Map to summary route.
                .map(|(range_prefix, range)| {
                    let summary = SummaryNet {
                        metric: range.config.cost.unwrap_or(range.cost),
                    };
                    (*range_prefix, summary)
                })
        })
}

fn compute_rtr_summaries(
    is_abr: bool,
    area: &Area,
    areas: &Areas,
) -> Vec<(Ipv4Addr, SummaryRtr)> {
    // Check conditions in which no router summaries should be generated.
    if !is_abr || area.config.area_type != AreaType::Normal {
        return Vec::new();
    }

    areas
        .iter()
        // Check the routing table from all other areas.
        .filter(|area_src| area_src.id != area.id)
        .flat_map(|area_src| area_src.state.routers.iter())
        // Only ASBR routes are advertised in ASBR-summary-LSAs.
        .filter(|(_, route)| route.flags.is_asbr())
        // Skip unreachable destinations.
        .filter(|(_, route)| route.metric < LSA_INFINITY)
        // Only intra-area routes are advertised into the backbone.
        .filter(|(_, route)| {
            route.path_type == PathType::IntraArea || !area.is_backbone()
        })
        // Map to summary route.
        .map(|(router_id, route)| {
            let summary = SummaryRtr {
                metric: route.metric,
            };
            (*router_id, summary)
        })
        .collect()
}

fn nexthops_area_check(route: &RouteNet, area: &Area) -> bool {
    route.nexthops.values().any(|nexthop| {
        area.interfaces
            .indexes()
            .any(|iface_idx| nexthop.iface_idx == iface_idx)
    })
}

fn flush_summary_lsas(
    lsa_type: LsaType,
    lsa_ids: impl Iterator<Item = Ipv4Addr>,
    area: &Area,
    instance: &InstanceUpView<'_>,
    lsa_entries: &Arena<LsaEntry>,
) {
    let lsdb_id = LsdbId::Area(area.id);
    let adv_rtr = instance.state.router_id;

    // Flush previously originated summaries that are no longer valid.
    for lsa_id in lsa_ids {
        let lsa_key = LsaKey::new(lsa_type, adv_rtr, lsa_id);
        if let Some((_, lse)) = area.state.lsdb.get(lsa_entries, &lsa_key) {
            instance.tx.protocol_input.lsa_flush(
                lsdb_id,
                lse.id,
                LsaFlushReason::PrematureAging,
            );
        }
    }

    // Flush received self-originated summaries that are no longer valid.
    for (_, lse) in area
        .state
        .lsdb
        .iter_by_type_advrtr(lsa_entries, lsa_type, adv_rtr)
        .filter(|(_, lse)| lse.flags.contains(LsaEntryFlags::RECEIVED))
    {
        instance.tx.protocol_input.lsa_flush(
            lsdb_id,
            lse.id,
            LsaFlushReason::PrematureAging,
        );
    }
}

// ===== virtual link support =====

// Resolves the local address of a virtual link from the route used to reach
// its endpoint through the transit area.
pub(crate) fn vlink_source_addr(
    route_br: &RouteRtr,
    interfaces: &Arena<Interface>,
) -> Option<Ipv4Addr> {
    // The virtual link source address is taken from the interface used to
    // reach the virtual link endpoint. If multiple ECMP paths exist, only
    // the first interface with a valid address is used.
    for nexthop in route_br.nexthops.values() {
        let iface = &interfaces[nexthop.iface_idx];
        if let Some(addr) = iface.state.src_addr {
            return Some(addr);
        }
    }

    None
}

// Resolves the remote address of a virtual link from the endpoint's
// router-LSA in the transit area.
pub(crate) fn vlink_neighbor_addr(
    area: &Area,
    router_id: Ipv4Addr,
    lsa_entries: &Arena<LsaEntry>,
) -> Option<Ipv4Addr> {
    let lsa_key =
        LsaKey::new(LsaTypeCode::Router.into(), router_id, router_id);
    let (_, lse) = area
        .state
        .lsdb
        .get(lsa_entries, &lsa_key)
        .filter(|(_, lse)| !lse.data.hdr.is_maxage())?;
    let lsa: &Arc<Lsa> = &lse.data;
    let lsa_body = lsa.body.as_router().unwrap();
    lsa_body.links.iter().find_map(|link| match link.link_type {
        LsaRouterLinkType::PointToPoint | LsaRouterLinkType::TransitNetwork => {
            Some(link.link_data)
        }
        _ => None,
    })
}
