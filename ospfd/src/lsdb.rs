use std::cmp::Ordering;
use std::collections::{btree_map, hash_map};
use std::net::Ipv4Addr;
use std::sync::Arc;

use bitflags::bitflags;
use chrono::Utc;
use ospfd_utils::UnboundedSender;
use ospfd_utils::task::TimeoutTask;
use serde::{Deserialize, Serialize};

use crate::area::Area;
use crate::collections::{
    AreaId, Arena, InterfaceId, LsaEntryId, LsaEntryIndex, LsdbId, LsdbIndex,
    lsdb_get, lsdb_index_mut,
};
use crate::config::AreaType;
use crate::debug::{Debug, LsaFlushReason};
use crate::error::Error;
use crate::flood::flood;
use crate::instance::{InstanceArenas, InstanceUpView, OverflowState};
use crate::interface::{Interface, InterfaceType, ism};
use crate::neighbor::nsm;
use crate::packet::Options;
use crate::packet::lsa::{
    Lsa, LsaAsExternal, LsaAsExternalFlags, LsaBody, LsaGrace, LsaHdr,
    LsaKey, LsaNetwork, LsaRouter, LsaRouterFlags, LsaRouterLink,
    LsaRouterLinkType, LsaType, LsaTypeCode,
};
use crate::tasks::messages::input::LsaFlushMsg;
use crate::{gr, spf, tasks};

// Architectural Constants.
pub const LSA_REFRESH_TIME: u16 = 1800;
pub const LSA_MAX_AGE: u16 = 3600;
pub const LSA_MAX_AGE_DIFF: u16 = 900;
pub const LSA_DO_NOT_AGE: u16 = 0x8000;
pub const LSA_INFINITY: u32 = 0x00ffffff;
pub const LSA_INIT_SEQ_NO: u32 = 0x8000_0001;
pub const LSA_MAX_SEQ_NO: u32 = 0x7fff_ffff;
pub const LSA_RESERVED_SEQ_NO: u32 = 0x8000_0000;
pub const LSA_MIN_INTERVAL: u64 = 5;
pub const LSA_MIN_ARRIVAL: u64 = 1;
pub const LSA_CHECK_INTERVAL: u64 = 300;
pub const MAX_LINK_METRIC: u16 = 0xffff;

#[derive(Debug)]
pub struct LsaEntry {
    // LSA ID.
    pub id: LsaEntryId,
    // LSA data.
    pub data: Arc<Lsa>,
    // Expiry timer that triggers when the LSA age reaches MaxAge.
    pub expiry_timer: Option<TimeoutTask>,
    // Refresh timer that triggers every LSRefreshTime seconds.
    pub refresh_timer: Option<TimeoutTask>,
    // Number of updates discarded by the MinLSArrival check. The first
    // discard is tolerated; repeated ones mean the source is misbehaving.
    pub min_arrival_discards: u8,
    // LSA entry flags.
    pub flags: LsaEntryFlags,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct LsaEntryFlags: u8 {
        const RECEIVED = 0x01;
        const SELF_ORIGINATED = 0x02;
        // The LSA body differs from the previous instance (refreshes with
        // identical contents don't set this).
        const CHANGED = 0x04;
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub enum LsaOriginateEvent {
    InterfaceStateChange {
        area_id: AreaId,
        iface_id: InterfaceId,
    },
    InterfaceDrChange {
        area_id: AreaId,
        iface_id: InterfaceId,
    },
    InterfaceAddrAddDel {
        area_id: AreaId,
        iface_id: InterfaceId,
    },
    NeighborToFromFull {
        area_id: AreaId,
        iface_id: InterfaceId,
    },
    SelfOriginatedLsaRcvd {
        lsdb_id: LsdbId,
        lse_id: LsaEntryId,
    },
    GrHelperExit {
        area_id: AreaId,
        iface_id: InterfaceId,
    },
    ExternalRoutesChange,
    ConfigChange,
}

#[derive(Debug)]
pub struct LsaDelayedOrig {
    pub data: Lsa,
    pub timeout: TimeoutTask,
}

// ===== impl LsaEntry =====

impl LsaEntry {
    pub(crate) fn new(
        lsdb_id: LsdbId,
        id: LsaEntryId,
        data: Arc<Lsa>,
        lsa_flushp: &UnboundedSender<LsaFlushMsg>,
    ) -> LsaEntry {
        // DoNotAge LSAs are pinned at their received age and never expire.
        let expiry_timer = (!data.hdr.is_maxage() && !data.hdr.is_dona())
            .then(|| tasks::lsa_expiry_timer(lsdb_id, id, &data, lsa_flushp));

        LsaEntry {
            id,
            data,
            expiry_timer,
            refresh_timer: None,
            min_arrival_discards: 0,
            flags: Default::default(),
        }
    }
}

// ===== global functions =====

// Compares which LSA is more recent according to the rules specified in
// Section 13.1 of RFC 2328.
//
// Returns:
// - Ordering::Greater when `a` is more recent
// - Ordering::Less when `b` is more recent
// - Ordering::Equal when the two LSAs are considered to be identical
pub fn lsa_compare(a: &LsaHdr, b: &LsaHdr) -> Ordering {
    let a_seq_no = a.seq_no as i32;
    let b_seq_no = b.seq_no as i32;
    let cmp = a_seq_no.cmp(&b_seq_no);
    if cmp != Ordering::Equal {
        return cmp;
    }

    let cmp = a.cksum.cmp(&b.cksum);
    if cmp != Ordering::Equal {
        return cmp;
    }

    if a.is_maxage() && !b.is_maxage() {
        return Ordering::Greater;
    } else if !a.is_maxage() && b.is_maxage() {
        return Ordering::Less;
    }

    // The DoNotAge bit is excluded from the comparison: ages that differ by
    // more than MaxAgeDiff make the younger instance more recent.
    if a.age().abs_diff(b.age()) > LSA_MAX_AGE_DIFF {
        return b.age().cmp(&a.age());
    }

    Ordering::Equal
}

// Compares two LSAs according to the rules specified in Section 13.2 of RFC
// 2328. Its purpose is to determine if the contents of the LSAs are
// identical.
pub(crate) fn lsa_same_contents(a: &Lsa, b: &Lsa) -> bool {
    if a.hdr.options != b.hdr.options {
        return false;
    }

    if a.hdr.is_maxage() ^ b.hdr.is_maxage() {
        return false;
    }

    if a.hdr.length != b.hdr.length {
        return false;
    }

    let hdr_length = LsaHdr::LENGTH as usize;
    a.raw[hdr_length..] == b.raw[hdr_length..]
}

// Checks if the provided area and/or neighbor can accept the given LSA type.
pub(crate) fn lsa_type_is_valid(
    area_type: Option<AreaType>,
    nbr_options: Option<Options>,
    lsa_type: LsaType,
) -> bool {
    // Reject LSAs of unknown type.
    let Some(type_code) = lsa_type.type_code() else {
        return false;
    };

    // Opaque LSAs (the Grace-LSA) are only flooded to opaque-capable
    // neighbors.
    if let Some(nbr_options) = nbr_options
        && type_code == LsaTypeCode::OpaqueLink
        && !nbr_options.contains(Options::O)
    {
        return false;
    }

    // Reject AS-external and type-4 summary LSAs (as per errata 3746 of RFC
    // 2328) on stub areas.
    if let Some(area_type) = area_type
        && area_type != AreaType::Normal
        && matches!(
            type_code,
            LsaTypeCode::SummaryRouter | LsaTypeCode::AsExternal
        )
    {
        return false;
    }

    true
}

// Checks whether the LSA is self-originated.
pub(crate) fn lsa_is_self_originated(
    lsa: &Lsa,
    router_id: Ipv4Addr,
    interfaces: &Arena<Interface>,
) -> bool {
    // 1) The LSA's Advertising Router is equal to the router's own Router ID.
    if lsa.hdr.adv_rtr == router_id {
        return true;
    }

    // 2) The LSA is a network-LSA and its Link State ID is equal to one of
    // the router's own IP interface addresses.
    if lsa.hdr.lsa_type.type_code() == Some(LsaTypeCode::Network)
        && interfaces
            .iter()
            .filter_map(|(_, iface)| iface.system.primary_addr)
            .any(|iface_primary_addr| lsa.hdr.lsa_id == iface_primary_addr.ip())
    {
        return true;
    }

    false
}

// Checks if the given LSA was received via flooding less than MinLSArrival
// seconds ago.
pub(crate) fn lsa_min_arrival_check(lse: &LsaEntry) -> bool {
    if !lse.flags.contains(LsaEntryFlags::RECEIVED) {
        return false;
    }

    #[cfg(feature = "deterministic")]
    {
        false
    }
    #[cfg(not(feature = "deterministic"))]
    {
        match lse.data.base_time {
            Some(lsa_base_time) => {
                lsa_base_time.elapsed().as_secs() < LSA_MIN_ARRIVAL
            }
            None => false,
        }
    }
}

// Checks if the given LSA was originated less than MinLSInterval seconds ago.
fn lsa_min_orig_interval_check(lse: &LsaEntry) -> bool {
    if lse.flags.contains(LsaEntryFlags::RECEIVED) {
        return false;
    }

    #[cfg(feature = "deterministic")]
    {
        false
    }
    #[cfg(not(feature = "deterministic"))]
    {
        match lse.data.base_time {
            Some(lsa_base_time) => {
                lsa_base_time.elapsed().as_secs() < LSA_MIN_INTERVAL
            }
            None => false,
        }
    }
}

// Installs the provided LSA to the specified LSDB.
pub(crate) fn install(
    instance: &mut InstanceUpView<'_>,
    arenas: &mut InstanceArenas,
    lsdb_idx: LsdbIndex,
    lsa: Arc<Lsa>,
) -> LsaEntryIndex {
    Debug::LsaInstall(&lsa.hdr).log();

    // Remove old instance (if any) from all neighbors' Link state
    // retransmission lists.
    rxmt_lists_remove(arenas, lsdb_idx, &lsa);

    // Lookup LSDB.
    let (lsdb_id, lsdb) = lsdb_index_mut(
        &mut instance.state.lsdb,
        &mut arenas.areas,
        &mut arenas.interfaces,
        lsdb_idx,
    );

    // Remove old instance of the LSA.
    let old_lsa = match lsdb.get(&arenas.lsa_entries, &lsa.hdr.key()) {
        Some((old_lse_idx, old_lse)) => {
            let old_lsa = old_lse.data.clone();
            lsdb.delete(&mut arenas.lsa_entries, old_lse_idx);
            Some(old_lsa)
        }
        None => None,
    };

    // Add LSA entry to LSDB.
    let (lse_idx, lse) = lsdb.insert(
        &mut arenas.lsa_entries,
        lsdb_id,
        lsa.clone(),
        &instance.tx.protocol_input,
    );

    // Check if the LSA is self-originated and mark it as such.
    if lsa_is_self_originated(
        &lse.data,
        instance.state.router_id,
        &arenas.interfaces,
    ) {
        lse.flags.insert(LsaEntryFlags::SELF_ORIGINATED);
    }

    // RFC 2328 - Section 13.2:
    // "The contents of the new LSA should be compared to the old instance,
    // if present. If there is no difference, there is no need to recalculate
    // the routing table".
    let mut content_change = true;
    if let Some(old_lsa) = &old_lsa
        && lsa_same_contents(old_lsa, &lsa)
    {
        content_change = false;
    }
    if content_change {
        lse.flags.insert(LsaEntryFlags::CHANGED);
    }
    let self_orig_summary = lse.flags.contains(LsaEntryFlags::SELF_ORIGINATED)
        && lsa.body.as_summary().is_some();
    let route_recalc =
        content_change && !lsa.body.is_unknown() && !self_orig_summary;

    // Keep track of self-originated Network-LSAs in the corresponding
    // interface structures. This is necessary to allow flushing those LSAs
    // later, since the interface address might change.
    if lsa.hdr.lsa_type.type_code() == Some(LsaTypeCode::Network)
        && lsa.hdr.adv_rtr == instance.state.router_id
        && let LsdbIndex::Area(area_idx) = lsdb_idx
    {
        let area = &mut arenas.areas[area_idx];
        if let Some((_, iface)) = area
            .interfaces
            .get_mut_by_addr(&mut arenas.interfaces, lsa.hdr.lsa_id)
        {
            if lsa.hdr.is_maxage() {
                iface.state.network_lsa_self = None;
            } else {
                iface.state.network_lsa_self = Some(lsa.hdr.key());
            }
        }
    }

    // A network topology change forces the termination of all graceful
    // restart helper sessions in the area.
    if content_change
        && lsa.hdr.lsa_type.is_gr_topology_info()
        && instance.state.gr_helper_count > 0
        && instance.config.gr.strict_lsa_checking
    {
        gr::helper_process_topology_change(
            Some(lsa.hdr.lsa_type),
            instance,
            arenas,
        );
    }

    // Check the AS-external database limit.
    if lsa.hdr.lsa_type.type_code() == Some(LsaTypeCode::AsExternal) {
        overflow_check(instance, arenas);
    }

    // Schedule SPF run if necessary.
    if route_recalc {
        spf::schedule(instance);
    }

    lse_idx
}

// Originates the provided LSA.
pub(crate) fn originate(
    instance: &mut InstanceUpView<'_>,
    arenas: &mut InstanceArenas,
    lsdb_idx: LsdbIndex,
    lsa: Lsa,
) {
    let (lsdb_id, lsdb) = lsdb_index_mut(
        &mut instance.state.lsdb,
        &mut arenas.areas,
        &mut arenas.interfaces,
        lsdb_idx,
    );

    // When an attempt is made to increment the sequence number past the
    // maximum value of MaxSequenceNumber, the current instance of the LSA
    // must first be flushed from the routing domain. As soon as this flood
    // has been acknowledged by all adjacent neighbors, a new instance can
    // be originated with sequence number of InitialSequenceNumber.
    let lsa_key = lsa.hdr.key();
    if let Some((old_lse_idx, _)) = lsdb.get(&arenas.lsa_entries, &lsa_key)
        && lsa.hdr.seq_no == LSA_MAX_SEQ_NO + 1
    {
        // Record LSA that will be originated later and then flush the
        // existing instance.
        match lsdb.seqno_wrapping.entry(lsa_key) {
            hash_map::Entry::Occupied(mut o) => {
                *o.get_mut() = lsa;
            }
            hash_map::Entry::Vacant(v) => {
                v.insert(lsa);
            }
        }
        let reason = LsaFlushReason::PrematureAging;
        flush(instance, arenas, lsdb_idx, old_lse_idx, reason);
        return;
    }

    Debug::LsaOriginate(&lsa.hdr).log();

    let lse_idx = install(instance, arenas, lsdb_idx, Arc::new(lsa));

    let lse = &mut arenas.lsa_entries[lse_idx];
    flood(
        instance,
        &arenas.areas,
        &mut arenas.interfaces,
        &mut arenas.neighbors,
        lsdb_idx,
        &lse.data,
        lse.flags.contains(LsaEntryFlags::CHANGED),
        None,
    );

    // Update statistics.
    instance.state.orig_lsa_count += 1;
    instance.state.discontinuity_time = Utc::now();

    // Schedule LSA refreshing.
    let lsdb_id = lsdb_id_of(lsdb_idx, arenas);
    let lse = &mut arenas.lsa_entries[lse_idx];
    let refresh_timer = tasks::lsa_refresh_timer(
        lsdb_id,
        lse.id,
        &instance.tx.protocol_input.lsa_refresh,
    );
    lse.refresh_timer = Some(refresh_timer);
}

// Attempts to originate the provided LSA, but only if it passes a few checks.
pub(crate) fn originate_check(
    instance: &mut InstanceUpView<'_>,
    arenas: &mut InstanceArenas,
    lsdb_idx: LsdbIndex,
    options: Options,
    lsa_id: Ipv4Addr,
    lsa_body: LsaBody,
) {
    let (lsdb_id, lsdb) = lsdb_index_mut(
        &mut instance.state.lsdb,
        &mut arenas.areas,
        &mut arenas.interfaces,
        lsdb_idx,
    );
    let adv_rtr = instance.state.router_id;
    let lsa_key = LsaKey::new(lsa_body.lsa_type(), adv_rtr, lsa_id);

    // Get next sequence number.
    let seq_no = lsdb
        .get(&arenas.lsa_entries, &lsa_key)
        .map(|(_, old_lse)| old_lse.data.hdr.seq_no.wrapping_add(1))
        .unwrap_or(LSA_INIT_SEQ_NO);

    // Make new LSA.
    let lsa = Lsa::new(0, options, lsa_id, adv_rtr, seq_no, lsa_body);

    // Check if an instance of this LSA already exists in the LSDB.
    if let Some((_, old_lse)) = lsdb.get(&arenas.lsa_entries, &lsa_key) {
        // If an LSA with identical contents already exists in the LSDB, skip
        // originating a new one (as per section 12.4 of RFC 2328).
        //
        // However, if the database copy was received through flooding,
        // proceed to originate a new instance with an updated sequence
        // number.
        if lsa_same_contents(&old_lse.data, &lsa)
            && !old_lse.flags.contains(LsaEntryFlags::RECEIVED)
        {
            return;
        }

        // Perform the MinLSInterval check.
        if lsdb.delayed_orig.contains_key(&lsa_key)
            || lsa_min_orig_interval_check(old_lse)
        {
            Debug::LsaOriginateMinInterval(&lsa.hdr).log();

            match lsdb.delayed_orig.entry(lsa_key) {
                hash_map::Entry::Occupied(mut o) => {
                    // Update the LSA that will be originated, but keep the
                    // current timeout.
                    let ldo = o.get_mut();
                    ldo.data = lsa;
                }
                hash_map::Entry::Vacant(v) => {
                    // Start timer to postpone originating the LSA.
                    let timeout = tasks::lsa_orig_delayed_timer(
                        lsdb_id,
                        lsa_key,
                        old_lse.data.base_time,
                        &instance.tx.protocol_input.lsa_orig_delayed_timer,
                    );
                    v.insert(LsaDelayedOrig { data: lsa, timeout });
                }
            }
            return;
        }
    }

    // Effectively originate the LSA.
    originate(instance, arenas, lsdb_idx, lsa);
}

// Flushes LSA from the LSDB.
pub(crate) fn flush(
    instance: &mut InstanceUpView<'_>,
    arenas: &mut InstanceArenas,
    lsdb_idx: LsdbIndex,
    lse_idx: LsaEntryIndex,
    reason: LsaFlushReason,
) {
    // Do not flush the same LSA more than once.
    let lse = &mut arenas.lsa_entries[lse_idx];
    if lse.data.hdr.is_maxage() {
        return;
    }

    Debug::LsaFlush(&lse.data.hdr, reason).log();

    // Disarm timers.
    lse.expiry_timer = None;
    lse.refresh_timer = None;

    // Set the LSA age to MaxAge.
    let mut lsa = (*lse.data).clone();
    lsa.set_maxage();
    let lsa = Arc::new(lsa);

    // Install updated LSA to clear rxmt lists and rerun route calculations.
    let lse_idx = install(instance, arenas, lsdb_idx, lsa);

    // Reflood updated LSA.
    let lse = &arenas.lsa_entries[lse_idx];
    let _ = flood(
        instance,
        &arenas.areas,
        &mut arenas.interfaces,
        &mut arenas.neighbors,
        lsdb_idx,
        &lse.data,
        true,
        None,
    );

    // Get LSA's LSDB.
    let lsa_key = lse.data.hdr.key();
    let (_, lsdb) = lsdb_index_mut(
        &mut instance.state.lsdb,
        &mut arenas.areas,
        &mut arenas.interfaces,
        lsdb_idx,
    );

    // Remove pending LSA origination, if any.
    lsdb.delayed_orig.remove(&lsa_key);
}

// Flushes all self-originated LSAs from the LSDB.
//
// Network-LSAs are flushed last, so that withdrawn reachability propagates
// before the transit networks themselves disappear.
pub(crate) fn flush_all_self_originated(
    instance: &mut InstanceUpView<'_>,
    arenas: &mut InstanceArenas,
) {
    let reason = LsaFlushReason::PrematureAging;
    let mut idxs = vec![];

    // AS-scope LSAs.
    let lsdb_idx = LsdbIndex::As;
    idxs.extend(
        instance
            .state
            .lsdb
            .iter(&arenas.lsa_entries)
            .filter(|(_, lse)| {
                lse.flags.contains(LsaEntryFlags::SELF_ORIGINATED)
            })
            .map(|(lse_idx, _)| (lsdb_idx, lse_idx)),
    );

    // Area-scope LSAs.
    for area_idx in arenas.areas.indexes() {
        let area = &arenas.areas[area_idx];
        let lsdb_idx = LsdbIndex::Area(area_idx);
        idxs.extend(
            area.state
                .lsdb
                .iter(&arenas.lsa_entries)
                .filter(|(_, lse)| {
                    lse.flags.contains(LsaEntryFlags::SELF_ORIGINATED)
                })
                .map(|(lse_idx, _)| (lsdb_idx, lse_idx)),
        );

        // Link-scope LSAs.
        for iface_idx in area.interfaces.indexes() {
            let iface = &arenas.interfaces[iface_idx];
            let lsdb_idx = LsdbIndex::Link(area_idx, iface_idx);
            idxs.extend(
                iface
                    .state
                    .lsdb
                    .iter(&arenas.lsa_entries)
                    .filter(|(_, lse)| {
                        lse.flags.contains(LsaEntryFlags::SELF_ORIGINATED)
                    })
                    .map(|(lse_idx, _)| (lsdb_idx, lse_idx)),
            );
        }
    }

    // Flush non-network LSAs first.
    idxs.sort_by_key(|(_, lse_idx)| {
        arenas.lsa_entries[*lse_idx].data.hdr.lsa_type.type_code()
            == Some(LsaTypeCode::Network)
    });
    for (lsdb_idx, lse_idx) in idxs {
        flush(instance, arenas, lsdb_idx, lse_idx, reason);
    }
}

// Removes old instance of the given LSA from all neighbors' Link state
// retransmission lists.
fn rxmt_lists_remove(
    arenas: &mut InstanceArenas,
    lsdb_idx: LsdbIndex,
    lsa: &Lsa,
) {
    for area_idx in arenas.areas.indexes() {
        let area = &arenas.areas[area_idx];

        // Filter by LSA area.
        match lsdb_idx {
            LsdbIndex::Link(lsdb_area_idx, _)
            | LsdbIndex::Area(lsdb_area_idx) => {
                if area_idx != lsdb_area_idx {
                    continue;
                }
            }
            _ => (),
        }

        for iface_idx in area.interfaces.indexes() {
            let iface = &arenas.interfaces[iface_idx];

            // Filter by LSA interface.
            if let LsdbIndex::Link(_, lsdb_iface_idx) = lsdb_idx
                && iface_idx != lsdb_iface_idx
            {
                continue;
            }

            // Iterate over all neighbors from this interface.
            for nbr_idx in iface.state.neighbors.indexes() {
                let nbr = &mut arenas.neighbors[nbr_idx];

                // Remove LSA from rxmt list as long as it's an older version.
                if let btree_map::Entry::Occupied(o) =
                    nbr.lists.ls_rxmt.entry(lsa.hdr.key())
                {
                    let old_lsa = o.get();
                    if lsa_compare(&old_lsa.hdr, &lsa.hdr) == Ordering::Less {
                        o.remove();
                        nbr.lists.ls_rxmt_pending.remove(&lsa.hdr.key());
                        nbr.rxmt_lsupd_stop_check();
                    }
                }
            }
        }
    }
}

// ===== LSA origination =====

// Originates or flushes the required LSAs in response to an LSA origination
// event.
pub(crate) fn lsa_orig_event(
    instance: &InstanceUpView<'_>,
    arenas: &InstanceArenas,
    event: LsaOriginateEvent,
) -> Result<(), Error> {
    match event {
        LsaOriginateEvent::InterfaceStateChange { .. }
        | LsaOriginateEvent::ConfigChange => {
            // (Re)originate Router-LSA in all areas since the ABR status
            // might have changed.
            for area in arenas.areas.iter() {
                lsa_orig_router(area, instance, arenas);
            }
            if let LsaOriginateEvent::ConfigChange = event {
                lsa_orig_external(instance, arenas);
            }
        }
        LsaOriginateEvent::InterfaceDrChange { area_id, iface_id }
        | LsaOriginateEvent::NeighborToFromFull { area_id, iface_id }
        | LsaOriginateEvent::GrHelperExit { area_id, iface_id } => {
            // (Re)originate Router-LSA.
            let (_, area) = arenas.areas.get_by_id(area_id)?;
            lsa_orig_router(area, instance, arenas);

            // (Re)originate or flush Network-LSA.
            let (_, iface) =
                area.interfaces.get_by_id(&arenas.interfaces, iface_id)?;
            if iface.state.ism_state == ism::State::Dr
                && iface
                    .state
                    .neighbors
                    .iter(&arenas.neighbors)
                    .any(|nbr| nbr.state == nsm::State::Full)
            {
                lsa_orig_network(iface, area, instance, arenas);
            } else {
                lsa_flush_network(iface, area, instance, arenas);
            }
        }
        LsaOriginateEvent::InterfaceAddrAddDel { area_id, .. } => {
            // (Re)originate Router-LSA.
            let (_, area) = arenas.areas.get_by_id(area_id)?;
            lsa_orig_router(area, instance, arenas);
        }
        LsaOriginateEvent::SelfOriginatedLsaRcvd { lsdb_id, lse_id } => {
            // Check if the received self-originated LSA needs to be
            // reoriginated or flushed.
            process_self_originated_lsa(instance, arenas, lsdb_id, lse_id)?;
        }
        LsaOriginateEvent::ExternalRoutesChange => {
            lsa_orig_external(instance, arenas);
        }
    };

    Ok(())
}

// (Re)originates the Router-LSA for the given area.
pub(crate) fn lsa_orig_router(
    area: &Area,
    instance: &InstanceUpView<'_>,
    arenas: &InstanceArenas,
) {
    let lsdb_id = LsdbId::Area(area.id);

    // LSA's header options.
    let options = area.options_lsa();

    // Router-LSA's flags.
    let mut flags = LsaRouterFlags::empty();
    if arenas.areas.is_abr(&arenas.interfaces) {
        flags.insert(LsaRouterFlags::B);
    }
    if instance.is_asbr() && area.config.area_type == AreaType::Normal {
        flags.insert(LsaRouterFlags::E);
    }
    if area.state.transit_capability {
        flags.insert(LsaRouterFlags::V);
    }

    // Router-LSA's links.
    let mut links = vec![];
    for iface in area
        .interfaces
        .iter(&arenas.interfaces)
        // Skip interfaces in the "Down" state.
        .filter(|iface| !iface.is_down())
    {
        // Add Type-3 (stub) links to interfaces in Loopback state.
        if iface.state.ism_state == ism::State::Loopback {
            links.extend(iface.system.addr_list.iter().map(|addr| {
                LsaRouterLink::new(
                    LsaRouterLinkType::StubNetwork,
                    addr.ip(),
                    Ipv4Addr::BROADCAST,
                    0,
                )
            }));
            continue;
        }

        // When acting as a host, only stub links are ever advertised so the
        // router never attracts transit traffic.
        if instance.config.host_mode {
            links.extend(stub_links(iface));
            continue;
        }

        let mut add_stub_links = false;
        match iface.config.if_type {
            InterfaceType::PointToPoint | InterfaceType::PointToMultipoint => {
                // Add a Type-1 link (p2p) for each fully adjacent neighbor.
                for nbr in iface
                    .state
                    .neighbors
                    .iter(&arenas.neighbors)
                    .filter(|nbr| nbr.state == nsm::State::Full)
                {
                    let link = LsaRouterLink::new(
                        LsaRouterLinkType::PointToPoint,
                        nbr.router_id,
                        iface.system.primary_addr.unwrap().ip(),
                        iface.config.cost,
                    );
                    links.push(link);
                }

                // Add Type-3 (stub) links.
                add_stub_links = true;
            }
            InterfaceType::VirtualLink => {
                // Add a Type-4 link for the fully adjacent virtual neighbor.
                for nbr in iface
                    .state
                    .neighbors
                    .iter(&arenas.neighbors)
                    .filter(|nbr| nbr.state == nsm::State::Full)
                {
                    let link = LsaRouterLink::new(
                        LsaRouterLinkType::VirtualLink,
                        nbr.router_id,
                        iface.state.vlink_src.unwrap_or(Ipv4Addr::UNSPECIFIED),
                        iface.config.cost,
                    );
                    links.push(link);
                }
            }
            InterfaceType::Broadcast | InterfaceType::NonBroadcast => {
                if iface.state.ism_state == ism::State::Waiting {
                    // Add Type-3 (stub) links.
                    add_stub_links = true;
                } else if (iface.state.ism_state == ism::State::Dr
                    && iface
                        .state
                        .neighbors
                        .iter(&arenas.neighbors)
                        .any(|nbr| nbr.state == nsm::State::Full))
                    || iface
                        .state
                        .dr
                        .and_then(|net_id| {
                            iface
                                .state
                                .neighbors
                                .get_by_net_id(&arenas.neighbors, net_id)
                                .filter(|(_, nbr)| {
                                    nbr.state == nsm::State::Full
                                })
                        })
                        .is_some()
                {
                    // Add a Type-2 (transit) link.
                    let link = LsaRouterLink::new(
                        LsaRouterLinkType::TransitNetwork,
                        iface.state.dr.unwrap().get(),
                        iface.system.primary_addr.unwrap().ip(),
                        iface.config.cost,
                    );
                    links.push(link);
                } else {
                    // Add Type-3 (stub) links.
                    add_stub_links = true;
                }
            }
        }

        if add_stub_links {
            links.extend(stub_links(iface));
        }
    }

    // (Re)originate Router-LSA.
    let lsa_body = LsaBody::Router(LsaRouter { flags, links });
    instance.tx.protocol_input.lsa_orig_check(
        lsdb_id,
        options,
        instance.state.router_id,
        lsa_body,
    );
}

// (Re)originates the Network-LSA for the segment the given interface is DR
// on.
pub(crate) fn lsa_orig_network(
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
    arenas: &InstanceArenas,
) {
    let lsdb_id = LsdbId::Area(area.id);

    // LSA's header options.
    let options = area.options_lsa();

    // The Link State ID for a network-LSA is the IP interface address of
    // the Designated Router.
    let lsa_id = iface.system.primary_addr.unwrap().ip();

    // Network-LSA's mask.
    let mask = iface.system.primary_addr.unwrap().mask();

    // Network-LSA's attached routers.
    let myself = instance.state.router_id;
    let nbrs = iface
        .state
        .neighbors
        .iter(&arenas.neighbors)
        .filter(|nbr| nbr.state == nsm::State::Full)
        .map(|nbr| nbr.router_id);
    let attached_rtrs = std::iter::once(myself).chain(nbrs).collect();

    // (Re)originate Network-LSA.
    let lsa_body = LsaBody::Network(LsaNetwork {
        mask,
        attached_rtrs,
    });
    instance
        .tx
        .protocol_input
        .lsa_orig_check(lsdb_id, options, lsa_id, lsa_body);
}

fn lsa_flush_network(
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
    arenas: &InstanceArenas,
) {
    if let Some(lsa_key) = &iface.state.network_lsa_self
        && let Some((_, lse)) =
            area.state.lsdb.get(&arenas.lsa_entries, lsa_key)
    {
        instance.tx.protocol_input.lsa_flush(
            LsdbId::Area(area.id),
            lse.id,
            LsaFlushReason::PrematureAging,
        );
    }
}

// (Re)originates AS-external-LSAs for the configured external routes, and
// flushes the ones that are no longer configured or advertisable.
pub(crate) fn lsa_orig_external(
    instance: &InstanceUpView<'_>,
    arenas: &InstanceArenas,
) {
    let lsdb_id = LsdbId::As;
    let adv_rtr = instance.state.router_id;

    // While in overflow state, only the default route may be advertised.
    let overflow = instance.state.overflow.is_some();

    let mut advertised = vec![];
    for (prefix, ext) in instance
        .config
        .external_routes
        .iter()
        .filter(|(_, ext)| !ext.no_advertise)
        .filter(|(prefix, _)| !overflow || prefix.prefix() == 0)
    {
        let mut ext_flags = LsaAsExternalFlags::empty();
        if ext.metric_type2 {
            ext_flags.insert(LsaAsExternalFlags::E);
        }
        let lsa_body = LsaBody::AsExternal(LsaAsExternal {
            mask: prefix.mask(),
            flags: ext_flags,
            metric: ext.metric,
            fwd_addr: ext.fwd_addr,
            tag: ext.tag,
        });
        let lsa_id = prefix.ip();
        advertised.push(lsa_id);
        instance.tx.protocol_input.lsa_orig_check(
            lsdb_id,
            Options::E,
            lsa_id,
            lsa_body,
        );
    }

    // Flush self-originated AS-external-LSAs that no longer apply.
    for (_, lse) in instance
        .state
        .lsdb
        .iter_by_type_advrtr(
            &arenas.lsa_entries,
            LsaTypeCode::AsExternal.into(),
            adv_rtr,
        )
        .filter(|(_, lse)| !advertised.contains(&lse.data.hdr.lsa_id))
    {
        instance.tx.protocol_input.lsa_flush(
            lsdb_id,
            lse.id,
            LsaFlushReason::PrematureAging,
        );
    }
}

// Originates the Grace-LSAs announcing our own graceful restart.
pub(crate) fn lsa_orig_grace(
    instance: &InstanceUpView<'_>,
    arenas: &InstanceArenas,
    grace_period: u32,
    gr_reason: crate::packet::lsa::GrReason,
) {
    for area in arenas.areas.iter() {
        for iface_idx in area.interfaces.indexes() {
            let iface = &arenas.interfaces[iface_idx];
            if iface.is_down() || iface.is_passive() {
                continue;
            }

            let addr = (!matches!(
                iface.config.if_type,
                InterfaceType::PointToPoint | InterfaceType::VirtualLink
            ))
            .then(|| iface.system.primary_addr.unwrap().ip());

            let lsa_body = LsaBody::Grace(LsaGrace {
                grace_period,
                gr_reason,
                addr,
            });
            instance.tx.protocol_input.lsa_orig_check(
                LsdbId::Link(area.id, iface.id),
                Options::O,
                LsaGrace::lsa_id(),
                lsa_body,
            );
        }
    }
}

// Handles the receipt of a self-originated LSA.
//
// If the LSA should still exist it's reoriginated with a higher sequence
// number to retake ownership; otherwise it's flushed from the routing
// domain.
fn process_self_originated_lsa(
    instance: &InstanceUpView<'_>,
    arenas: &InstanceArenas,
    lsdb_id: LsdbId,
    lse_id: LsaEntryId,
) -> Result<(), Error> {
    let mut flush = false;

    // Lookup LSDB and LSA entry.
    let (lsdb_idx, lsdb) = lsdb_get(
        &instance.state.lsdb,
        &arenas.areas,
        &arenas.interfaces,
        &lsdb_id.into(),
    )?;
    let (_, lse) = lsdb.get_by_id(&arenas.lsa_entries, lse_id)?;
    let lsa = &lse.data;

    // Check LSA type.
    match lsa.hdr.lsa_type.type_code() {
        Some(LsaTypeCode::Router) => {
            let area_idx = lsdb_idx.into_area().unwrap();
            let area = &arenas.areas[area_idx];

            // Reoriginate Router-LSA.
            lsa_orig_router(area, instance, arenas);
        }
        Some(LsaTypeCode::Network) => {
            let area_idx = lsdb_idx.into_area().unwrap();
            let area = &arenas.areas[area_idx];

            // Check if the router is still the DR for the network.
            if let Some(iface) = area
                .interfaces
                .iter(&arenas.interfaces)
                .find(|iface| {
                    iface
                        .system
                        .primary_addr
                        .is_some_and(|addr| addr.ip() == lsa.hdr.lsa_id)
                })
                .filter(|iface| iface.state.ism_state == ism::State::Dr)
                .filter(|_| {
                    // Ensure the Router-ID hasn't changed.
                    lsa.hdr.adv_rtr == instance.state.router_id
                })
            {
                // Reoriginate Network-LSA.
                lsa_orig_network(iface, area, instance, arenas);
            } else {
                // Flush Network-LSA.
                flush = true;
            }
        }
        Some(LsaTypeCode::SummaryNetwork | LsaTypeCode::SummaryRouter) => {
            // Do nothing. These LSAs will be either reoriginated or flushed
            // once SPF runs and the routing table is computed.
        }
        Some(LsaTypeCode::AsExternal) => {
            if instance.config.external_routes.keys().any(|prefix| {
                prefix.ip() == lsa.hdr.lsa_id
            }) {
                lsa_orig_external(instance, arenas);
            } else {
                // Flush AS-External-LSA.
                flush = true;
            }
        }
        Some(LsaTypeCode::OpaqueLink) | None => {
            // Flush the received copy.
            flush = true;
        }
    }

    if flush {
        // Effectively flush the received self-originated LSA.
        instance.tx.protocol_input.lsa_flush(
            lsdb_id,
            lse_id,
            LsaFlushReason::PrematureAging,
        );
    }

    Ok(())
}

// ===== Database overflow =====

// Checks the AS-external database limit and enters the overflow state if
// it's exceeded (RFC 1765).
pub(crate) fn overflow_check(
    instance: &mut InstanceUpView<'_>,
    arenas: &InstanceArenas,
) {
    let Some(lsdb_limit) = instance.config.lsdb_limit else {
        return;
    };
    if instance.state.overflow.is_some() {
        return;
    }

    let count = instance
        .state
        .lsdb
        .iter_by_type(&arenas.lsa_entries, LsaTypeCode::AsExternal.into())
        .filter(|(_, lse)| !lse.data.hdr.is_maxage())
        .count() as u32;
    if count < lsdb_limit {
        return;
    }

    Debug::OverflowEnter(count).log();

    // Enter the overflow state and schedule its exit.
    let exit_timer = (instance.config.overflow_interval != 0).then(|| {
        tasks::overflow_exit_timer(instance, instance.config.overflow_interval)
    });
    instance.state.overflow = Some(OverflowState { exit_timer });

    // Flush all self-originated non-default AS-external-LSAs.
    lsa_orig_external(instance, arenas);
}

// Returns whether a received AS-external-LSA must be refused due to the
// overflow state. The default route is always accepted.
pub(crate) fn overflow_refuse(
    instance: &InstanceUpView<'_>,
    lsa: &Lsa,
) -> bool {
    instance.state.overflow.is_some()
        && lsa.hdr.lsa_type.type_code() == Some(LsaTypeCode::AsExternal)
        && !lsa.hdr.is_maxage()
        && lsa.hdr.lsa_id != Ipv4Addr::UNSPECIFIED
        && lsa.hdr.adv_rtr != instance.state.router_id
}

// ===== helper functions =====

fn stub_links(iface: &Interface) -> Vec<LsaRouterLink> {
    use ospfd_utils::ip::Ipv4NetworkExt;

    iface
        .system
        .addr_list
        .iter()
        .map(|addr| addr.apply_mask())
        .map(|addr| {
            LsaRouterLink::new(
                LsaRouterLinkType::StubNetwork,
                addr.ip(),
                addr.mask(),
                iface.config.cost,
            )
        })
        .collect()
}

fn lsdb_id_of(lsdb_idx: LsdbIndex, arenas: &InstanceArenas) -> LsdbId {
    match lsdb_idx {
        LsdbIndex::Link(area_idx, iface_idx) => LsdbId::Link(
            arenas.areas[area_idx].id,
            arenas.interfaces[iface_idx].id,
        ),
        LsdbIndex::Area(area_idx) => LsdbId::Area(arenas.areas[area_idx].id),
        LsdbIndex::As => LsdbId::As,
    }
}
