use std::time::Duration;

use ospfd_utils::task::TimeoutTask;

use crate::area::Area;
use crate::collections::LsdbId;
use crate::debug::{Debug, GrRejectReason, LsaFlushReason};
use crate::instance::{InstanceArenas, InstanceUpView};
use crate::interface::{Interface, ism};
use crate::lsdb::{self, LsaEntryFlags, LsaOriginateEvent};
use crate::neighbor::{Neighbor, NeighborGrHelper, nsm};
use crate::packet::lsa::{GrReason, LsaHdr, LsaType};
use crate::tasks;

// OSPF Graceful Restart exit reason.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GrExitReason {
    Completed,
    TimedOut,
    TopologyChanged,
}

// Our own graceful restart, after resumption.
//
// While it lasts, the forwarding table is left untouched and divergent
// self-origination is avoided; the restart ends when the database
// stabilizes or the timer fires.
#[derive(Debug)]
pub struct GrRestart {
    pub grace_period: u32,
    pub reason: GrReason,
    pub timeout: TimeoutTask,
}

// ===== impl GrExitReason =====

impl std::fmt::Display for GrExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrExitReason::Completed => {
                write!(f, "completed")
            }
            GrExitReason::TimedOut => {
                write!(f, "timed out")
            }
            GrExitReason::TopologyChanged => {
                write!(f, "topology changed")
            }
        }
    }
}

// ===== global functions =====

pub(crate) fn helper_process_grace_lsa(
    nbr: &mut Neighbor,
    iface: &Interface,
    area: &Area,
    lsa_hdr: &LsaHdr,
    grace_period: u32,
    reason: GrReason,
    instance: &mut InstanceUpView<'_>,
) {
    if lsa_hdr.is_maxage() {
        // Exit from the helper mode.
        if nbr.gr.is_some() {
            helper_exit(nbr, iface, area, GrExitReason::Completed, instance);
        }
    } else {
        // Calculate the remaining grace period.
        let remn_grace_period =
            grace_period.saturating_sub(lsa_hdr.age() as u32);

        // If we're already helping this neighbor, just restart the grace
        // period timeout.
        if let Some(gr) = &mut nbr.gr {
            gr.grace_period
                .reset(Some(Duration::from_secs(remn_grace_period.into())));
            return;
        }

        // Check if the neighbor is fully adjacent.
        if nbr.state != nsm::State::Full {
            let reason = GrRejectReason::NeighborNotFull;
            Debug::GrHelperReject(nbr.router_id, reason).log();
            return;
        }

        // Check for topology changes in the LSDB since the neighbor
        // restarted. Only contents that actually changed disqualify
        // helping; periodic refreshes don't.
        if instance.config.gr.strict_lsa_checking
            && nbr
                .lists
                .ls_rxmt
                .values()
                .any(|lsa| lsa.hdr.lsa_type.is_gr_topology_info())
        {
            let reason = GrRejectReason::TopologyChange;
            Debug::GrHelperReject(nbr.router_id, reason).log();
            return;
        }

        // Check if the grace period has already expired.
        if lsa_hdr.age() as u32 >= grace_period {
            let reason = GrRejectReason::GracePeriodExpired;
            Debug::GrHelperReject(nbr.router_id, reason).log();
            return;
        }

        // Check if helper mode is enabled in the configuration.
        if !instance.config.gr.helper_enabled {
            let reason = GrRejectReason::HelperDisabled;
            Debug::GrHelperReject(nbr.router_id, reason).log();
            return;
        }

        // All checks have passed. Enter helper mode.
        helper_enter(nbr, iface, area, remn_grace_period, reason, instance);
    }
}

pub(crate) fn helper_process_topology_change(
    lsa_type: Option<LsaType>,
    instance: &mut InstanceUpView<'_>,
    arenas: &mut InstanceArenas,
) {
    // Iterate over all neighbors.
    for area_idx in arenas.areas.indexes().collect::<Vec<_>>() {
        let area = &arenas.areas[area_idx];
        let area_type = area.config.area_type;
        for iface_idx in area.interfaces.indexes().collect::<Vec<_>>() {
            let iface = &arenas.interfaces[iface_idx];
            for nbr_idx in iface.state.neighbors.indexes().collect::<Vec<_>>()
            {
                let nbr = &mut arenas.neighbors[nbr_idx];
                if nbr.gr.is_none() {
                    continue;
                }

                // Check if the LSA was flooded to the neighbor.
                if let Some(lsa_type) = lsa_type
                    && !lsdb::lsa_type_is_valid(
                        Some(area_type),
                        nbr.options,
                        lsa_type,
                    )
                {
                    continue;
                }

                // Exit from the helper mode for this neighbor.
                helper_exit(
                    nbr,
                    iface,
                    area,
                    GrExitReason::TopologyChanged,
                    instance,
                );
            }
        }
    }
}

pub(crate) fn helper_exit(
    nbr: &mut Neighbor,
    iface: &Interface,
    area: &Area,
    reason: GrExitReason,
    instance: &mut InstanceUpView<'_>,
) {
    Debug::GrHelperExit(nbr.router_id, reason).log();

    // Stop the grace period timeout.
    nbr.gr = None;

    // Recalculate the Designated Router for the segment.
    if iface.is_broadcast_or_nbma() {
        instance.tx.protocol_input.ism_event(
            area.id,
            iface.id,
            ism::Event::NbrChange,
        );
    }

    // Reoriginate the Router-LSA and, if needed, the Network-LSA for the
    // segment's OSPF area.
    instance.tx.protocol_input.lsa_orig_event(
        LsaOriginateEvent::GrHelperExit {
            area_id: area.id,
            iface_id: iface.id,
        },
    );

    // Decrement the count of neighbors performing a graceful restart.
    instance.state.gr_helper_count -= 1;
}

// ===== restarting side =====

// Announces an imminent graceful restart by originating a Grace-LSA on
// every operational interface. The caller is expected to halt once the
// announcements have been acknowledged.
pub(crate) fn restart_announce(
    instance: &mut InstanceUpView<'_>,
    arenas: &InstanceArenas,
    grace_period: u32,
    reason: GrReason,
) {
    Debug::GrRestartBegin(grace_period).log();
    lsdb::lsa_orig_grace(instance, arenas, grace_period, reason);
}

// Resumes operation after a restart: while the grace period lasts, the
// forwarding table is left untouched and self-origination that would
// diverge from the network's copy is avoided.
pub(crate) fn restart_resume(
    instance: &mut InstanceUpView<'_>,
    grace_period: u32,
    reason: GrReason,
) {
    let timeout = tasks::gr_restart_timer(instance, grace_period);
    instance.state.gr = Some(GrRestart {
        grace_period,
        reason,
        timeout,
    });
}

// Checks whether our own graceful restart can complete: every adjacency
// must be fully resumed, and the router-LSAs we would originate must match
// the database copies.
pub(crate) fn restart_stabilized_check(
    instance: &mut InstanceUpView<'_>,
    arenas: &mut InstanceArenas,
) {
    if instance.state.gr.is_none() {
        return;
    }

    // All neighbors must be fully adjacent (or bidirectional on transit
    // networks where the adjacency is not required).
    let stabilized = arenas.areas.iter().all(|area| {
        area.interfaces
            .iter(&arenas.interfaces)
            .filter(|iface| !iface.is_down() && !iface.is_passive())
            .all(|iface| {
                iface.state.neighbors.count() > 0
                    && iface
                        .state
                        .neighbors
                        .iter(&arenas.neighbors)
                        .all(|nbr| {
                            nbr.state == nsm::State::Full
                                || (nbr.state == nsm::State::TwoWay
                                    && !iface.need_adjacency(nbr))
                        })
            })
    });
    if !stabilized {
        return;
    }

    restart_exit(instance, arenas, "completed");
}

// Ends our own graceful restart: the Grace-LSAs are flushed, the normal
// LSAs are reoriginated and route installation resumes.
pub(crate) fn restart_exit(
    instance: &mut InstanceUpView<'_>,
    arenas: &mut InstanceArenas,
    reason: &str,
) {
    if instance.state.gr.take().is_none() {
        return;
    }

    Debug::GrRestartExit(reason).log();

    // Flush the Grace-LSAs.
    for area_idx in arenas.areas.indexes() {
        let area = &arenas.areas[area_idx];
        for iface_idx in area.interfaces.indexes() {
            let iface = &arenas.interfaces[iface_idx];
            for (_, lse) in iface
                .state
                .lsdb
                .iter(&arenas.lsa_entries)
                .filter(|(_, lse)| {
                    lse.flags.contains(LsaEntryFlags::SELF_ORIGINATED)
                })
            {
                instance.tx.protocol_input.lsa_flush(
                    LsdbId::Link(area.id, iface.id),
                    lse.id,
                    LsaFlushReason::PrematureAging,
                );
            }
        }
    }

    // Reoriginate the normal set of LSAs and recompute routes.
    instance
        .tx
        .protocol_input
        .lsa_orig_event(LsaOriginateEvent::ConfigChange);
    crate::spf::schedule(instance);
}

// ===== helper functions =====

fn helper_enter(
    nbr: &mut Neighbor,
    iface: &Interface,
    area: &Area,
    grace_period: u32,
    restart_reason: GrReason,
    instance: &mut InstanceUpView<'_>,
) {
    Debug::GrHelperEnter(nbr.router_id, restart_reason, grace_period).log();

    // Start the grace period timeout.
    let grace_period =
        tasks::grace_period_timer(nbr, iface, area, instance, grace_period);

    // Store information that this neighbor is undergoing a graceful restart.
    nbr.gr = Some(NeighborGrHelper {
        restart_reason,
        grace_period,
    });

    // Increment the count of neighbors performing a graceful restart.
    instance.state.gr_helper_count += 1;
}
