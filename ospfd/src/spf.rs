use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use derive_new::new;
use enum_as_inner::EnumAsInner;
use ipnetwork::Ipv4Network;
use ospfd_utils::ip::Ipv4NetworkExt;

use crate::area::{self, Area};
use crate::collections::Arena;
use crate::debug::Debug;
use crate::error::Error;
use crate::instance::{InstanceArenas, InstanceUpView};
use crate::interface::Interface;
use crate::lsdb::LsaEntry;
use crate::packet::lsa::{
    Lsa, LsaKey, LsaRouterLink, LsaRouterLinkType, LsaTypeCode,
};
use crate::route::{Nexthop, NexthopKey, Nexthops, RouteRtr};
use crate::{route, tasks};

// Delay before a scheduled SPF run starts, in milliseconds. Triggers
// arriving while the timer is armed are absorbed into the same run.
const SPF_DELAY: u32 = 100;

#[derive(Debug, new)]
pub struct Vertex {
    pub id: VertexId,
    pub lsa: VertexLsa,
    pub distance: u16,
    pub hops: u16,
    #[new(default)]
    pub nexthops: Nexthops,
}

// NOTE: network vertices are ordered before router vertices in order for the
// SPF algorithm to find all equal-cost paths.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum VertexId {
    Network { dr_addr: Ipv4Addr },
    Router { router_id: Ipv4Addr },
}

#[derive(Debug, EnumAsInner)]
pub enum VertexLsa {
    Network(Arc<Lsa>),
    Router(Arc<Lsa>),
}

#[derive(Debug, new)]
pub struct SpfLink<'a> {
    pub parent: Option<&'a LsaRouterLink>,
    pub id: VertexId,
    pub lsa: VertexLsa,
    pub cost: u16,
}

// Intra-area network reachable through the shortest-path tree.
#[derive(Debug)]
pub struct SpfIntraAreaNetwork {
    pub prefix: Ipv4Network,
    pub metric: u16,
    pub distance: u16,
    pub from_router: bool,
    pub connected: bool,
    pub origin: LsaKey,
    pub nexthops: Nexthops,
}

// ===== impl VertexId =====

impl VertexId {
    fn new_root(router_id: Ipv4Addr) -> Self {
        VertexId::Router { router_id }
    }
}

// ===== impl VertexLsa =====

impl VertexLsa {
    fn origin(&self) -> LsaKey {
        let lsa = match self {
            VertexLsa::Network(lsa) => lsa,
            VertexLsa::Router(lsa) => lsa,
        };
        lsa.hdr.key()
    }
}

// ===== global functions =====

// Schedules an SPF run. Requests are coalesced: the first one arms the
// delay timer and the computation runs once when it fires.
pub(crate) fn schedule(instance: &mut InstanceUpView<'_>) {
    instance
        .state
        .spf_schedule_time
        .get_or_insert_with(Instant::now);

    if instance.state.spf_delay_timer.is_none() {
        let task = tasks::spf_delay_timer(instance, SPF_DELAY);
        instance.state.spf_delay_timer = Some(task);
    }
}

// This is the SPF main function.
pub(crate) fn compute_spf(
    instance: &mut InstanceUpView<'_>,
    arenas: &mut InstanceArenas,
) {
    Debug::SpfStart.log();
    let start_time = Instant::now();
    instance.state.spf_delay_timer = None;
    instance.state.spf_schedule_time = None;

    // Calculate the shortest-path tree of every attached area.
    for area_idx in arenas.areas.indexes().collect::<Vec<_>>() {
        let area = &mut arenas.areas[area_idx];
        run_area(area, instance, &arenas.interfaces, &arenas.lsa_entries);
    }

    // Update routing table (intra-area, inter-area and external routes, in
    // that order).
    route::update_rib(
        instance,
        &mut arenas.areas,
        &arenas.interfaces,
        &arenas.lsa_entries,
    );

    // Bring virtual links up or down according to the new routing table.
    route::update_virtual_links(
        instance,
        &mut arenas.areas,
        &mut arenas.interfaces,
        &mut arenas.neighbors,
        &arenas.lsa_entries,
    );

    // Update summary LSAs and active ranges.
    area::update_summary_lsas(
        instance,
        &mut arenas.areas,
        &arenas.interfaces,
        &arenas.lsa_entries,
    );

    // Check whether our own graceful restart can complete.
    crate::gr::restart_stabilized_check(instance, arenas);

    // Update statistics.
    instance.state.spf_run_count += 1;
    Debug::SpfFinish(start_time.elapsed().as_micros()).log();
}

// Runs SPF in the provided area.
fn run_area(
    area: &mut Area,
    instance: &mut InstanceUpView<'_>,
    interfaces: &Arena<Interface>,
    lsa_entries: &Arena<LsaEntry>,
) {
    area.state.transit_capability = false;

    // Get root vertex.
    let root_vid = VertexId::new_root(instance.state.router_id);
    let root_vlsa = match vertex_lsa_find(root_vid, area, lsa_entries) {
        Some(vertex) => vertex,
        None => {
            Error::SpfRootNotFound(area.area_id).log();
            area.state.spt.clear();
            area.state.routers.clear();
            return;
        }
    };
    let root_v = Vertex::new(root_vid, root_vlsa, 0, 0);

    // Initialize SPT and candidate list.
    let mut spt = BTreeMap::new();
    let mut cand_list = BTreeMap::new();
    cand_list.insert((root_v.distance, root_v.id), root_v);

    // Clear the area's router routing table.
    area.state.routers.clear();

    // Main SPF loop.
    while let Some(((_, vertex_id), vertex)) = cand_list.pop_first() {
        // Add vertex to SPT.
        spt.insert(vertex.id, vertex);
        let vertex = spt.get(&vertex_id).unwrap();

        if let VertexLsa::Router(lsa) = &vertex.lsa {
            let lsa_body = lsa.body.as_router().unwrap();

            // Add "router" routing table entry.
            let route = RouteRtr::new(
                area.area_id,
                crate::route::PathType::IntraArea,
                lsa_body.flags,
                vertex.distance.into(),
                instance
                    .state
                    .nexthops_interner
                    .intern(vertex.nexthops.clone()),
            );
            area.state.routers.insert(lsa.hdr.adv_rtr, route);

            // Set TransitCapability.
            if lsa_body
                .flags
                .contains(crate::packet::lsa::LsaRouterFlags::V)
            {
                area.state.transit_capability = true;
            }
        }

        // Iterate over all links described by the vertex's LSA.
        for link in vertex_lsa_links(&vertex.lsa, area, lsa_entries) {
            // Check if the LSAs are mutually linked.
            if !vertex_lsa_links(&link.lsa, area, lsa_entries)
                .any(|rlink| rlink.id == vertex.id)
            {
                continue;
            }

            // Check if the link's vertex is already on the shortest-path
            // tree.
            if spt.contains_key(&link.id) {
                continue;
            }

            // Calculate distance to the link's vertex.
            let distance = vertex.distance.saturating_add(link.cost);

            // Increment number of hops to the root.
            let mut hops = vertex.hops;
            if link.lsa.is_router() {
                hops = hops.saturating_add(1);
            }

            // Check if this vertex is already present on the candidate list.
            if let Some((cand_key, cand_v)) = cand_list
                .iter_mut()
                .find(|(_, cand_v)| cand_v.id == link.id)
            {
                match distance.cmp(&cand_v.distance) {
                    Ordering::Less => {
                        // Remove vertex since its key has changed. It will
                        // be re-added with the correct key below.
                        let cand_key = *cand_key;
                        cand_list.remove(&cand_key);
                    }
                    Ordering::Equal => {}
                    Ordering::Greater => {
                        // Ignore higher cost path.
                        continue;
                    }
                }
            }
            let link_parent = link.parent;
            let link_id = link.id;
            let cand_v =
                cand_list.entry((distance, link.id)).or_insert_with(|| {
                    Vertex::new(link_id, link.lsa, distance, hops)
                });

            // Update vertex's nexthops.
            match calc_nexthops(
                area,
                vertex,
                link_parent,
                link_id,
                &cand_v.lsa,
                interfaces,
            ) {
                Ok(nexthops) => cand_v.nexthops.extend(nexthops),
                Err(error) => error.log(),
            }
        }
    }

    // Update area's SPT.
    area.state.spt = spt;

    // Update statistics.
    area.state.spf_run_count += 1;
    area.state.discontinuity_time = Utc::now();
}

// Computes the set of nexthops that should be used to reach the given
// destination.
fn calc_nexthops(
    area: &Area,
    parent: &Vertex,
    parent_link: Option<&LsaRouterLink>,
    dest_id: VertexId,
    dest_lsa: &VertexLsa,
    interfaces: &Arena<Interface>,
) -> Result<Nexthops, Error> {
    let mut nexthops = Nexthops::new();

    if parent.hops != 0 {
        // If there is at least one intervening router in the current
        // shortest path between the destination and the root, the
        // destination simply inherits the set of next hops from the parent.
        return Ok(parent.nexthops.clone());
    }

    let dest_addr = match dest_id {
        VertexId::Network { dr_addr } => dr_addr,
        VertexId::Router { router_id } => router_id,
    };

    match &parent.lsa {
        // The parent vertex is the root.
        VertexLsa::Router(_parent_lsa) => {
            // The destination is either a directly connected network or
            // directly connected router. The outgoing interface in this case
            // is simply the OSPF interface connecting to the destination
            // network/router.
            let parent_link = parent_link.unwrap();

            // Get nexthop interface.
            let parent_link_addr = parent_link.link_data;
            let (iface_idx, iface) = area
                .interfaces
                .get_by_addr(interfaces, parent_link_addr)
                .or_else(|| {
                    // Virtual links borrow their source address from another
                    // interface; resolve them by the address itself.
                    area.interfaces
                        .indexes()
                        .map(|iface_idx| (iface_idx, &interfaces[iface_idx]))
                        .find(|(_, iface)| {
                            iface.state.src_addr == Some(parent_link_addr)
                        })
                })
                .ok_or(Error::SpfNexthopCalcError(dest_addr))?;

            match dest_lsa {
                VertexLsa::Router(dest_lsa) => {
                    // Point-to-point or virtual link: the nexthop address is
                    // found in the neighbor's router-LSA link that points
                    // back to the attached subnet.
                    if iface.is_virtual_link() {
                        let nexthop_addr = iface
                            .state
                            .vlink_remote
                            .ok_or(Error::SpfNexthopCalcError(dest_addr))?;
                        nexthops.insert(
                            NexthopKey::new(iface_idx, Some(nexthop_addr)),
                            Nexthop::new(
                                iface_idx,
                                Some(nexthop_addr),
                                Some(dest_lsa.hdr.adv_rtr),
                            ),
                        );
                    } else {
                        nexthops.extend(
                            dest_lsa
                                .body
                                .as_router()
                                .unwrap()
                                .links
                                .iter()
                                .filter(|link| {
                                    iface.system.contains_addr(&link.link_data)
                                })
                                .map(|link| {
                                    let nexthop_addr = link.link_data;
                                    let nbr_router_id = dest_lsa.hdr.adv_rtr;
                                    (
                                        NexthopKey::new(
                                            iface_idx,
                                            Some(nexthop_addr),
                                        ),
                                        Nexthop::new(
                                            iface_idx,
                                            Some(nexthop_addr),
                                            Some(nbr_router_id),
                                        ),
                                    )
                                }),
                        );
                    }
                    if nexthops.is_empty() {
                        return Err(Error::SpfNexthopCalcError(dest_addr));
                    }
                }
                VertexLsa::Network(_lsa) => {
                    // Add nexthop.
                    nexthops.insert(
                        NexthopKey::new(iface_idx, None),
                        Nexthop::new(iface_idx, None, None),
                    );
                }
            }
        }
        // The parent vertex is a network that directly connects the
        // calculating router to the destination router.
        VertexLsa::Network(parent_lsa) => {
            // The list of next hops is then determined by examining the
            // destination's router-LSA. For each link in the router-LSA that
            // points back to the parent network, the link's Link Data field
            // provides the IP address of a next hop router.
            let lsa_body = parent_lsa.body.as_network().unwrap();
            let parent_network = Ipv4Network::with_netmask(
                parent_lsa.hdr.lsa_id,
                lsa_body.mask,
            )
            .map_err(|_| Error::SpfNexthopCalcError(dest_addr))?;
            let dest_lsa = dest_lsa.as_router().unwrap();
            let dest_link = dest_lsa
                .body
                .as_router()
                .unwrap()
                .links
                .iter()
                .find(|link| parent_network.contains(link.link_data))
                .ok_or(Error::SpfNexthopCalcError(dest_addr))?;

            // Inherit outgoing interface from the parent network.
            let iface_idx = parent
                .nexthops
                .values()
                .next()
                .ok_or(Error::SpfNexthopCalcError(dest_addr))?
                .iface_idx;

            // Get nexthop address.
            let nbr_router_id = dest_lsa.hdr.adv_rtr;
            let nexthop_addr = dest_link.link_data;

            // Add nexthop.
            nexthops.insert(
                NexthopKey::new(iface_idx, Some(nexthop_addr)),
                Nexthop::new(
                    iface_idx,
                    Some(nexthop_addr),
                    Some(nbr_router_id),
                ),
            );
        }
    }

    Ok(nexthops)
}

// Finds the LSA corresponding to an SPF vertex.
fn vertex_lsa_find(
    id: VertexId,
    area: &Area,
    lsa_entries: &Arena<LsaEntry>,
) -> Option<VertexLsa> {
    match id {
        VertexId::Network { dr_addr } => {
            // SPF needs to find a Network-LSA knowing only its LS-ID but not
            // its advertising router.
            area.state
                .lsdb
                .iter_by_type(lsa_entries, LsaTypeCode::Network.into())
                .map(|(_, lse)| &lse.data)
                .find(|lsa| lsa.hdr.lsa_id == dr_addr)
                .filter(|lsa| !lsa.hdr.is_maxage())
                .map(|lsa| VertexLsa::Network(lsa.clone()))
        }
        VertexId::Router { router_id } => {
            let lsa_key =
                LsaKey::new(LsaTypeCode::Router.into(), router_id, router_id);
            area.state
                .lsdb
                .get(lsa_entries, &lsa_key)
                .filter(|(_, lse)| !lse.data.hdr.is_maxage())
                .map(|(_, lse)| VertexLsa::Router(lse.data.clone()))
        }
    }
}

// Returns an iterator over all links of the provided SPF vertex.
fn vertex_lsa_links<'a>(
    vertex_lsa: &'a VertexLsa,
    area: &'a Area,
    lsa_entries: &'a Arena<LsaEntry>,
) -> Box<dyn Iterator<Item = SpfLink<'a>> + 'a> {
    match vertex_lsa {
        VertexLsa::Network(lsa) => {
            let lsa_body = lsa.body.as_network().unwrap();
            let iter =
                lsa_body.attached_rtrs.iter().filter_map(move |router_id| {
                    let link_vid = VertexId::Router {
                        router_id: *router_id,
                    };
                    vertex_lsa_find(link_vid, area, lsa_entries).map(
                        |link_vlsa| SpfLink::new(None, link_vid, link_vlsa, 0),
                    )
                });
            Box::new(iter)
        }
        VertexLsa::Router(lsa) => {
            let lsa_body = lsa.body.as_router().unwrap();
            let iter = lsa_body
                .links
                .iter()
                .filter_map(|link| match link.link_type {
                    LsaRouterLinkType::PointToPoint
                    | LsaRouterLinkType::VirtualLink => {
                        let link_vid = VertexId::Router {
                            router_id: link.link_id,
                        };
                        Some((link, link_vid, link.metric))
                    }
                    LsaRouterLinkType::TransitNetwork => {
                        let link_vid = VertexId::Network {
                            dr_addr: link.link_id,
                        };
                        Some((link, link_vid, link.metric))
                    }
                    LsaRouterLinkType::StubNetwork => None,
                })
                .filter_map(move |(link, link_vid, cost)| {
                    vertex_lsa_find(link_vid, area, lsa_entries).map(
                        |link_vlsa| {
                            SpfLink::new(Some(link), link_vid, link_vlsa, cost)
                        },
                    )
                });
            Box::new(iter)
        }
    }
}

// Collects the intra-area networks reachable through the area's
// shortest-path tree.
pub(crate) fn intra_area_networks(area: &Area) -> Vec<SpfIntraAreaNetwork> {
    let mut stubs = vec![];

    for vertex in area.state.spt.values() {
        match &vertex.lsa {
            VertexLsa::Network(lsa) => {
                let lsa_body = lsa.body.as_network().unwrap();
                let Ok(prefix) =
                    Ipv4Network::with_netmask(lsa.hdr.lsa_id, lsa_body.mask)
                else {
                    continue;
                };
                let prefix = prefix.apply_mask();

                stubs.push(SpfIntraAreaNetwork {
                    prefix,
                    metric: 0,
                    distance: vertex.distance,
                    from_router: false,
                    connected: vertex.hops == 0,
                    origin: vertex.lsa.origin(),
                    nexthops: vertex.nexthops.clone(),
                });
            }
            VertexLsa::Router(lsa) => {
                let lsa_body = lsa.body.as_router().unwrap();
                stubs.extend(
                    lsa_body
                        .links
                        .iter()
                        .filter(|link| {
                            link.link_type == LsaRouterLinkType::StubNetwork
                        })
                        .filter_map(|link| {
                            let prefix = Ipv4Network::with_netmask(
                                link.link_id,
                                link.link_data,
                            )
                            .ok()?;
                            let prefix = prefix.apply_mask();

                            Some(SpfIntraAreaNetwork {
                                prefix,
                                metric: link.metric,
                                distance: vertex.distance,
                                from_router: true,
                                connected: vertex.hops == 0,
                                origin: vertex.lsa.origin(),
                                nexthops: vertex.nexthops.clone(),
                            })
                        }),
                )
            }
        }
    }

    stubs
}
