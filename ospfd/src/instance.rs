use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use ospfd_utils::task::{IntervalTask, TimeoutTask};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{Receiver, Sender, UnboundedReceiver, UnboundedSender};

use crate::collections::{
    AreaId, Areas, Arena, InterfaceId, Lsdb, LsdbId, NeighborId,
};
use crate::config::{ConfigOp, ConfigTransaction, InstanceCfg};
use crate::debug::{
    Debug, InstanceInactiveReason, InterfaceInactiveReason, LsaFlushReason,
};
use crate::error::{CommitError, Error};
use crate::gr::GrRestart;
use crate::interface::{Interface, InterfaceType, ism};
use crate::lsdb::{self, LsaEntry, LsaOriginateEvent};
use crate::neighbor::Neighbor;
use crate::route::{NexthopInterner, RouteNet, RouteNetFlags};
use crate::southbound::{self, SouthboundRxMsg, SouthboundTxMsg};
use crate::tasks::messages::input::{
    DbDescFreeMsg, DelayedAckMsg, GracePeriodMsg, GrRestartTimeoutMsg,
    HelloIntervalMsg, IsmEventMsg, KrtRetryMsg, LsaFlushMsg, LsaOrigCheckMsg,
    LsaOrigDelayedMsg, LsaOrigEventMsg, LsaRefreshMsg, LsdbChecksumScanMsg,
    LsdbMaxAgeSweepMsg, NetRxPacketMsg, NsmEventMsg, OverflowExitMsg,
    RxmtIntervalMsg, SendLsUpdateMsg, SpfRunMsg,
};
use crate::tasks::messages::ProtocolInputMsg;
#[cfg(feature = "testing")]
use crate::tasks::messages::ProtocolOutputMsg;
use crate::{events, output, spf, tasks};

pub struct Instance {
    // Instance name.
    pub name: String,
    // Instance system data.
    pub system: InstanceSys,
    // Instance configuration data.
    pub config: InstanceCfg,
    // Instance state data.
    pub state: Option<InstanceState>,
    // Instance arenas.
    pub arenas: InstanceArenas,
    // Instance Tx channels.
    pub tx: InstanceChannelsTx,
}

#[derive(Debug, Default)]
pub struct InstanceSys {
    pub router_id: Option<Ipv4Addr>,
}

#[derive(Debug)]
pub struct InstanceState {
    // Instance Router ID.
    pub router_id: Ipv4Addr,
    // LSDB of AS-scope LSAs.
    pub lsdb: Lsdb,
    // SPF scheduling (coalesced: at most one run per armed timer).
    pub spf_delay_timer: Option<TimeoutTask>,
    pub spf_schedule_time: Option<Instant>,
    // Routing table.
    pub rib: BTreeMap<Ipv4Network, RouteNet>,
    // Canonicalizing next-hop set intern table.
    pub nexthops_interner: NexthopInterner,
    // Adjacencies waiting for a database-exchange slot.
    pub pending_adjacencies: VecDeque<(AreaId, InterfaceId, NeighborId)>,
    // Database overflow state.
    pub overflow: Option<OverflowState>,
    // Number of neighbors performing a graceful restart.
    pub gr_helper_count: usize,
    // Our own graceful restart (restarting side).
    pub gr: Option<GrRestart>,
    // Background LSDB checksum verification.
    pub lsdb_checksum_scanner: Option<IntervalTask>,
    // Kernel routes pending re-installation.
    pub krt_retries: BTreeMap<Ipv4Network, TimeoutTask>,
    // Authentication non-decreasing sequence number.
    pub auth_seqno: Arc<AtomicU64>,
    // Statistics.
    pub orig_lsa_count: u32,
    pub rx_lsa_count: u32,
    pub spf_run_count: u32,
    pub discontinuity_time: DateTime<Utc>,
}

// AS-external database overflow state (RFC 1765).
#[derive(Debug)]
pub struct OverflowState {
    // Exit timer; `None` means the overflow state is permanent.
    pub exit_timer: Option<TimeoutTask>,
}

#[derive(Debug, Default)]
pub struct InstanceArenas {
    pub areas: Areas,
    pub interfaces: Arena<Interface>,
    pub neighbors: Arena<Neighbor>,
    pub lsa_entries: Arena<LsaEntry>,
}

#[derive(Clone, Debug)]
pub struct InstanceChannelsTx {
    // Channels to send messages to the instance event loop.
    pub protocol_input: ProtocolInputChannelsTx,
    // Packet output channel used by the test framework.
    #[cfg(feature = "testing")]
    pub protocol_output: Sender<ProtocolOutputMsg>,
    // Channel to the forwarding-table installer.
    pub sb: UnboundedSender<SouthboundTxMsg>,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    // Interface FSM event.
    pub ism_event: UnboundedSender<IsmEventMsg>,
    // Neighbor FSM event.
    pub nsm_event: UnboundedSender<NsmEventMsg>,
    // Packet Rx event.
    pub net_packet_rx: Sender<NetRxPacketMsg>,
    // Hello Tx tick.
    pub hello_interval: UnboundedSender<HelloIntervalMsg>,
    // Free last sent/received Database Description packets.
    pub dbdesc_free: Sender<DbDescFreeMsg>,
    // Request to send LS Update.
    pub send_lsupd: UnboundedSender<SendLsUpdateMsg>,
    // Packet retransmission interval.
    pub rxmt_interval: Sender<RxmtIntervalMsg>,
    // Delayed Ack timeout.
    pub delayed_ack_timeout: UnboundedSender<DelayedAckMsg>,
    // LSA originate event.
    pub lsa_orig_event: UnboundedSender<LsaOrigEventMsg>,
    // LSA originate check.
    pub lsa_orig_check: UnboundedSender<LsaOrigCheckMsg>,
    // LSA delayed origination timer.
    pub lsa_orig_delayed_timer: Sender<LsaOrigDelayedMsg>,
    // LSA flush event.
    pub lsa_flush: UnboundedSender<LsaFlushMsg>,
    // LSA refresh event.
    pub lsa_refresh: UnboundedSender<LsaRefreshMsg>,
    // LSDB MaxAge sweep timer.
    pub lsdb_maxage_sweep_interval: Sender<LsdbMaxAgeSweepMsg>,
    // LSDB background checksum verification.
    pub lsdb_checksum_scan: UnboundedSender<LsdbChecksumScanMsg>,
    // SPF run event.
    pub spf_run: UnboundedSender<SpfRunMsg>,
    // Grace period timeout.
    pub grace_period: Sender<GracePeriodMsg>,
    // Database overflow exit timer.
    pub overflow_exit: UnboundedSender<OverflowExitMsg>,
    // Graceful restart timeout (restarting side).
    pub gr_restart_timeout: UnboundedSender<GrRestartTimeoutMsg>,
    // Kernel route re-installation retry.
    pub krt_retry: UnboundedSender<KrtRetryMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    pub ism_event: UnboundedReceiver<IsmEventMsg>,
    pub nsm_event: UnboundedReceiver<NsmEventMsg>,
    pub net_packet_rx: Receiver<NetRxPacketMsg>,
    pub hello_interval: UnboundedReceiver<HelloIntervalMsg>,
    pub dbdesc_free: Receiver<DbDescFreeMsg>,
    pub send_lsupd: UnboundedReceiver<SendLsUpdateMsg>,
    pub rxmt_interval: Receiver<RxmtIntervalMsg>,
    pub delayed_ack_timeout: UnboundedReceiver<DelayedAckMsg>,
    pub lsa_orig_event: UnboundedReceiver<LsaOrigEventMsg>,
    pub lsa_orig_check: UnboundedReceiver<LsaOrigCheckMsg>,
    pub lsa_orig_delayed_timer: Receiver<LsaOrigDelayedMsg>,
    pub lsa_flush: UnboundedReceiver<LsaFlushMsg>,
    pub lsa_refresh: UnboundedReceiver<LsaRefreshMsg>,
    pub lsdb_maxage_sweep_interval: Receiver<LsdbMaxAgeSweepMsg>,
    pub lsdb_checksum_scan: UnboundedReceiver<LsdbChecksumScanMsg>,
    pub spf_run: UnboundedReceiver<SpfRunMsg>,
    pub grace_period: Receiver<GracePeriodMsg>,
    pub overflow_exit: UnboundedReceiver<OverflowExitMsg>,
    pub gr_restart_timeout: UnboundedReceiver<GrRestartTimeoutMsg>,
    pub krt_retry: UnboundedReceiver<KrtRetryMsg>,
}

pub struct InstanceUpView<'a> {
    pub name: &'a str,
    pub system: &'a InstanceSys,
    pub config: &'a InstanceCfg,
    pub state: &'a mut InstanceState,
    pub tx: &'a InstanceChannelsTx,
}

// ===== impl InstanceUpView =====

impl InstanceUpView<'_> {
    // Returns whether we're an AS boundary router.
    pub(crate) fn is_asbr(&self) -> bool {
        self.config
            .external_routes
            .values()
            .any(|ext| !ext.no_advertise)
    }
}

// Bundle of channel endpoints handed to the embedder at creation time.
pub struct InstanceHandles {
    pub instance: Instance,
    pub protocol_input_rx: ProtocolInputChannelsRx,
    pub sb_rx: UnboundedReceiver<SouthboundTxMsg>,
    #[cfg(feature = "testing")]
    pub protocol_output_rx: Receiver<ProtocolOutputMsg>,
}

// ===== impl Instance =====

impl Instance {
    pub fn new(name: String) -> InstanceHandles {
        Debug::InstanceCreate.log();

        let (protocol_input, protocol_input_rx) = protocol_input_channels();
        let (sb_tx, sb_rx) = mpsc::unbounded_channel();
        #[cfg(feature = "testing")]
        let (protocol_output_tx, protocol_output_rx) = mpsc::channel(64);

        let instance = Instance {
            name,
            system: Default::default(),
            config: Default::default(),
            state: None,
            arenas: Default::default(),
            tx: InstanceChannelsTx {
                protocol_input,
                #[cfg(feature = "testing")]
                protocol_output: protocol_output_tx,
                sb: sb_tx,
            },
        };

        InstanceHandles {
            instance,
            protocol_input_rx,
            sb_rx,
            #[cfg(feature = "testing")]
            protocol_output_rx,
        }
    }

    // Runs the instance event loop until all input channels are closed.
    pub async fn run(
        mut self,
        mut protocol_input: ProtocolInputChannelsRx,
        mut sb_rx: Receiver<SouthboundRxMsg>,
    ) {
        loop {
            tokio::select! {
                biased;
                msg = sb_rx.recv() => {
                    match msg {
                        Some(msg) => self.process_southbound_msg(msg),
                        None => break,
                    }
                }
                msg = protocol_input.recv() => {
                    match msg {
                        Some(msg) => self.process_protocol_msg(msg),
                        None => break,
                    }
                }
            }
        }

        self.shutdown();
    }

    // Checks if the instance needs to be started or stopped in response to a
    // configuration or system event.
    pub(crate) fn update(&mut self) {
        let router_id = self.get_router_id();

        match self.is_ready(router_id) {
            Ok(()) if !self.is_active() => {
                self.start(router_id.unwrap());
            }
            Err(reason) if self.is_active() => {
                self.stop(reason);
            }
            _ => (),
        }
    }

    fn start(&mut self, router_id: Ipv4Addr) {
        Debug::InstanceStart.log();

        // Store instance initial state.
        let state = InstanceState::new(router_id);
        self.state = Some(state);

        // Try to start interfaces.
        let (instance, arenas) = self.as_up().unwrap();
        for area in arenas.areas.iter() {
            for iface_idx in area.interfaces.indexes() {
                let iface = &mut arenas.interfaces[iface_idx];

                iface.update(
                    area,
                    &instance,
                    &mut arenas.neighbors,
                    &arenas.lsa_entries,
                );
            }
        }

        // Start the background LSDB checksum verification.
        let task = tasks::lsdb_checksum_interval(
            &instance.tx.protocol_input.lsdb_checksum_scan,
        );
        instance.state.lsdb_checksum_scanner = Some(task);

        // Originate configured AS-external routes.
        instance
            .tx
            .protocol_input
            .lsa_orig_event(LsaOriginateEvent::ExternalRoutesChange);
    }

    fn stop(&mut self, reason: InstanceInactiveReason) {
        if !self.is_active() {
            return;
        }

        Debug::InstanceStop(reason).log();

        // Flush all self-originated LSAs: non-network LSAs first, then
        // network-LSAs.
        let (mut instance, arenas) = self.as_up().unwrap();
        lsdb::flush_all_self_originated(&mut instance, arenas);

        // Uninstall all routes.
        for dest in instance
            .state
            .rib
            .iter()
            .filter(|(_, route)| {
                route.flags.contains(RouteNetFlags::INSTALLED)
            })
            .map(|(dest, _)| dest)
        {
            southbound::route_uninstall(&instance.tx.sb, dest);
        }

        for area in arenas.areas.iter_mut() {
            // Clear area's state.
            area.state = Default::default();

            // Stop interfaces.
            for iface_idx in area.interfaces.indexes() {
                let iface = &mut arenas.interfaces[iface_idx];
                if iface.is_down() || iface.is_passive() {
                    continue;
                }

                // Send pending LS Updates.
                output::send_lsupd(
                    None,
                    iface,
                    area,
                    &instance,
                    &mut arenas.neighbors,
                );

                let reason = InterfaceInactiveReason::InstanceDown;
                iface.fsm(
                    area,
                    &instance,
                    &mut arenas.neighbors,
                    &arenas.lsa_entries,
                    ism::Event::InterfaceDown(reason),
                );
            }
        }

        // Clear instance state.
        self.state = None;
    }

    // Multi-phase shutdown: flush self-originated LSAs, withdraw routes,
    // exit.
    pub fn shutdown(mut self) {
        self.stop(InstanceInactiveReason::AdminDown);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.is_some()
    }

    // Returns whether the instance is ready for OSPF operation.
    fn is_ready(
        &self,
        router_id: Option<Ipv4Addr>,
    ) -> Result<(), InstanceInactiveReason> {
        if !self.config.enabled || self.arenas.interfaces.is_empty() {
            return Err(InstanceInactiveReason::AdminDown);
        }

        if router_id.is_none() {
            return Err(InstanceInactiveReason::MissingRouterId);
        }

        Ok(())
    }

    pub(crate) fn get_router_id(&self) -> Option<Ipv4Addr> {
        self.config.router_id.or(self.system.router_id)
    }

    pub(crate) fn as_up(
        &mut self,
    ) -> Option<(InstanceUpView<'_>, &mut InstanceArenas)> {
        if let Some(state) = &mut self.state {
            let instance = InstanceUpView {
                name: &self.name,
                system: &self.system,
                config: &self.config,
                state,
                tx: &self.tx,
            };
            Some((instance, &mut self.arenas))
        } else {
            None
        }
    }

    // Applies a configuration transaction atomically.
    //
    // The transaction is validated in full before the first operation is
    // applied; a rejected transaction leaves the running configuration
    // untouched.
    pub fn commit(
        &mut self,
        transaction: ConfigTransaction,
    ) -> Result<(), CommitError> {
        transaction.validate(self.get_router_id(), self.is_active())?;
        self.commit_validate(&transaction)?;

        for op in transaction.ops {
            self.apply_config_op(op);
        }

        // Check if the instance needs to be started or stopped, resync
        // interfaces, and reoriginate LSAs that might have been affected.
        self.update();
        if let Some((mut instance, arenas)) = self.as_up() {
            for area in arenas.areas.iter() {
                for iface_idx in area.interfaces.indexes() {
                    let iface = &mut arenas.interfaces[iface_idx];
                    iface.update(
                        area,
                        &instance,
                        &mut arenas.neighbors,
                        &arenas.lsa_entries,
                    );
                }
            }
            instance
                .tx
                .protocol_input
                .lsa_orig_event(LsaOriginateEvent::ConfigChange);
            spf::schedule(&mut instance);
        }

        Ok(())
    }

    // Cross-object validation against the running configuration. Objects
    // created by earlier operations of the same transaction are taken into
    // account.
    fn commit_validate(
        &self,
        transaction: &ConfigTransaction,
    ) -> Result<(), CommitError> {
        let mut new_areas = std::collections::BTreeSet::new();
        let mut new_ifaces = std::collections::BTreeSet::new();

        for op in &transaction.ops {
            match op {
                ConfigOp::AreaUpsert { area_id, .. } => {
                    new_areas.insert(*area_id);
                }
                ConfigOp::InterfaceUpsert {
                    area_id,
                    ifname,
                    cfg,
                } => {
                    new_areas.insert(*area_id);
                    new_ifaces.insert(ifname.clone());
                    if let Some(vlink) = &cfg.vlink
                        && vlink.router_id == Ipv4Addr::UNSPECIFIED
                    {
                        return Err(CommitError::VlinkUnknownRouterId(
                            vlink.router_id,
                        ));
                    }
                }
                ConfigOp::RangeUpsert { area_id, .. }
                | ConfigOp::RangeDelete { area_id, .. } => {
                    if self.arenas.areas.get_by_area_id(*area_id).is_none()
                        && !new_areas.contains(area_id)
                    {
                        return Err(CommitError::AreaNotFound(*area_id));
                    }
                }
                ConfigOp::StaticNbrUpsert { ifname, .. }
                | ConfigOp::StaticNbrDelete { ifname, .. }
                | ConfigOp::Md5KeyDelete { ifname, .. }
                | ConfigOp::InterfaceDelete { ifname } => {
                    if self.lookup_iface(ifname).is_none()
                        && !new_ifaces.contains(ifname)
                    {
                        return Err(CommitError::InterfaceNotFound(
                            ifname.clone(),
                        ));
                    }
                }
                ConfigOp::Md5KeyUpsert { ifname, key_id, .. } => {
                    let Some((_, _, iface_idx)) = self.lookup_iface(ifname)
                    else {
                        if new_ifaces.contains(ifname) {
                            continue;
                        }
                        return Err(CommitError::InterfaceNotFound(
                            ifname.clone(),
                        ));
                    };
                    let iface = &self.arenas.interfaces[iface_idx];
                    if let Some(crate::config::AuthCfg::MessageDigest(keys)) =
                        &iface.config.auth
                        && keys.contains_key(key_id)
                    {
                        return Err(CommitError::DuplicateKeyId(
                            ifname.clone(),
                            *key_id,
                        ));
                    }
                }
                _ => (),
            }
        }

        Ok(())
    }

    fn apply_config_op(&mut self, op: ConfigOp) {
        match op {
            ConfigOp::GlobalSet(cfg) => {
                self.config = cfg;
            }
            ConfigOp::AreaUpsert { area_id, cfg } => {
                if self.arenas.areas.get_by_area_id(area_id).is_none() {
                    self.arenas.areas.insert(area_id);
                }
                let (_, area) =
                    self.arenas.areas.get_mut_by_area_id(area_id).unwrap();
                area.config = cfg;
            }
            ConfigOp::AreaDelete { area_id } => {
                if let Some((area_idx, ifnames)) = self
                    .arenas
                    .areas
                    .get_by_area_id(area_id)
                    .map(|(area_idx, area)| {
                        let ifnames = area
                            .interfaces
                            .iter(&self.arenas.interfaces)
                            .map(|iface| iface.name.clone())
                            .collect::<Vec<_>>();
                        (area_idx, ifnames)
                    })
                {
                    for ifname in ifnames {
                        self.delete_iface(&ifname);
                    }
                    self.arenas.areas.delete(area_idx);
                }
            }
            ConfigOp::InterfaceUpsert {
                area_id,
                ifname,
                cfg,
            } => {
                // Create the area implicitly if necessary.
                if self.arenas.areas.get_by_area_id(area_id).is_none() {
                    self.arenas.areas.insert(area_id);
                }
                let (_, area) =
                    self.arenas.areas.get_mut_by_area_id(area_id).unwrap();
                let iface_idx = match area
                    .interfaces
                    .get_by_name(&self.arenas.interfaces, &ifname)
                    .map(|(iface_idx, _)| iface_idx)
                {
                    Some(iface_idx) => iface_idx,
                    None => {
                        area.interfaces
                            .insert(&mut self.arenas.interfaces, &ifname)
                            .0
                    }
                };
                let iface = &mut self.arenas.interfaces[iface_idx];
                let hello_changed =
                    iface.config.hello_interval != cfg.hello_interval;
                let auth_changed = iface.config.auth != cfg.auth;
                iface.config = cfg;

                // Virtual links never run a DR election and carry no subnet
                // of their own.
                if iface.config.if_type == InterfaceType::VirtualLink {
                    iface.config.priority = 0;
                }

                if auth_changed || hello_changed {
                    if let Some((instance, arenas)) = self.as_up()
                        && let Some((_, area)) =
                            arenas.areas.get_by_area_id(area_id)
                    {
                        let iface = &mut arenas.interfaces[iface_idx];
                        if !iface.is_down() {
                            iface.auth_update(area, &instance);
                        }
                    }
                }
            }
            ConfigOp::InterfaceDelete { ifname } => {
                self.delete_iface(&ifname);
            }
            ConfigOp::RangeUpsert {
                area_id,
                prefix,
                cfg,
            } => {
                if let Some((_, area)) =
                    self.arenas.areas.get_mut_by_area_id(area_id)
                {
                    area.ranges.entry(prefix).or_default().config = cfg;
                }
            }
            ConfigOp::RangeDelete { area_id, prefix } => {
                if let Some((_, area)) =
                    self.arenas.areas.get_mut_by_area_id(area_id)
                {
                    area.ranges.remove(&prefix);
                }
            }
            ConfigOp::StaticNbrUpsert { ifname, addr, cfg } => {
                if let Some((_, _, iface_idx)) = self.lookup_iface(&ifname) {
                    let iface = &mut self.arenas.interfaces[iface_idx];
                    iface.config.static_nbrs.insert(addr, cfg);
                }
            }
            ConfigOp::StaticNbrDelete { ifname, addr } => {
                if let Some((_, _, iface_idx)) = self.lookup_iface(&ifname) {
                    let iface = &mut self.arenas.interfaces[iface_idx];
                    iface.config.static_nbrs.remove(&addr);
                }
            }
            ConfigOp::Md5KeyUpsert {
                ifname,
                key_id,
                key,
            } => {
                if let Some((_, _, iface_idx)) = self.lookup_iface(&ifname) {
                    let iface = &mut self.arenas.interfaces[iface_idx];
                    let keys = match &mut iface.config.auth {
                        Some(crate::config::AuthCfg::MessageDigest(keys)) => {
                            keys
                        }
                        _ => {
                            iface.config.auth = Some(
                                crate::config::AuthCfg::MessageDigest(
                                    Default::default(),
                                ),
                            );
                            match &mut iface.config.auth {
                                Some(crate::config::AuthCfg::MessageDigest(
                                    keys,
                                )) => keys,
                                _ => unreachable!(),
                            }
                        }
                    };
                    keys.insert(key_id, key);
                }
            }
            ConfigOp::Md5KeyDelete { ifname, key_id } => {
                if let Some((_, _, iface_idx)) = self.lookup_iface(&ifname) {
                    let iface = &mut self.arenas.interfaces[iface_idx];
                    if let Some(crate::config::AuthCfg::MessageDigest(keys)) =
                        &mut iface.config.auth
                    {
                        keys.remove(&key_id);
                        if keys.is_empty() {
                            iface.config.auth = None;
                        }
                    }
                }
            }
            ConfigOp::ExternalRouteUpsert { prefix, cfg } => {
                self.config.external_routes.insert(prefix, cfg);
            }
            ConfigOp::ExternalRouteDelete { prefix } => {
                self.config.external_routes.remove(&prefix);
            }
        }
    }

    fn delete_iface(&mut self, ifname: &str) {
        let Some((area_id, _, iface_idx)) = self.lookup_iface(ifname) else {
            return;
        };

        // Stop the interface before removing it.
        if let Some((instance, arenas)) = self.as_up()
            && let Ok((_, area)) = arenas.areas.get_by_id(area_id)
        {
            let iface = &mut arenas.interfaces[iface_idx];
            if !iface.is_down() {
                iface.fsm(
                    area,
                    &instance,
                    &mut arenas.neighbors,
                    &arenas.lsa_entries,
                    ism::Event::InterfaceDown(
                        InterfaceInactiveReason::AdminDown,
                    ),
                );
            }
        }

        let (_, area) = self
            .arenas
            .areas
            .get_mut_by_id(area_id)
            .expect("area vanished");
        area.interfaces
            .delete(&mut self.arenas.interfaces, iface_idx);
    }

    fn lookup_iface(
        &self,
        ifname: &str,
    ) -> Option<(AreaId, InterfaceId, crate::collections::InterfaceIndex)>
    {
        self.arenas.areas.iter().find_map(|area| {
            area.interfaces
                .get_by_name(&self.arenas.interfaces, ifname)
                .map(|(iface_idx, iface)| (area.id, iface.id, iface_idx))
        })
    }

    // Announces an imminent graceful restart (RFC 3623). The caller is
    // expected to halt once the Grace-LSAs have been acknowledged.
    pub fn graceful_restart_begin(
        &mut self,
        grace_period: u32,
        reason: crate::packet::lsa::GrReason,
    ) {
        if let Some((mut instance, arenas)) = self.as_up() {
            crate::gr::restart_announce(
                &mut instance,
                arenas,
                grace_period,
                reason,
            );
        }
    }

    // Resumes operation after a graceful restart: forwarding state is left
    // untouched until the database stabilizes or the grace period expires.
    pub fn graceful_restart_resume(
        &mut self,
        grace_period: u32,
        reason: crate::packet::lsa::GrReason,
    ) {
        if let Some((mut instance, _)) = self.as_up() {
            crate::gr::restart_resume(&mut instance, grace_period, reason);
        }
    }

    pub fn process_southbound_msg(&mut self, msg: SouthboundRxMsg) {
        match msg {
            SouthboundRxMsg::IfaceUpd(msg) => {
                southbound::process_iface_update(self, msg);
            }
            SouthboundRxMsg::AddrAdd { ifname, addr } => {
                southbound::process_addr_add(self, &ifname, addr);
            }
            SouthboundRxMsg::AddrDel { ifname, addr } => {
                southbound::process_addr_del(self, &ifname, addr);
            }
            SouthboundRxMsg::RouterIdUpd { router_id } => {
                southbound::process_router_id_update(self, router_id);
            }
            SouthboundRxMsg::KrtDeleteNotification { prefix } => {
                southbound::process_krt_delete(self, prefix);
            }
            SouthboundRxMsg::RemnantNotification { prefix } => {
                southbound::process_remnant(self, prefix);
            }
        }
    }

    pub fn process_protocol_msg(&mut self, msg: ProtocolInputMsg) {
        // Ignore event if the instance isn't active.
        if let Some((mut instance, arenas)) = self.as_up()
            && let Err(error) = process_protocol_msg(&mut instance, arenas, msg)
        {
            error.log();
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").field("name", &self.name).finish()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        Debug::InstanceDelete.log();
    }
}

// ===== impl InstanceState =====

impl InstanceState {
    fn new(router_id: Ipv4Addr) -> InstanceState {
        InstanceState {
            router_id,
            lsdb: Default::default(),
            spf_delay_timer: None,
            spf_schedule_time: None,
            rib: Default::default(),
            nexthops_interner: Default::default(),
            pending_adjacencies: Default::default(),
            overflow: None,
            gr_helper_count: 0,
            gr: None,
            lsdb_checksum_scanner: None,
            krt_retries: Default::default(),
            auth_seqno: Arc::new(AtomicU64::new(initial_auth_seqno())),
            orig_lsa_count: 0,
            rx_lsa_count: 0,
            spf_run_count: 0,
            discontinuity_time: Utc::now(),
        }
    }
}

// ===== impl ProtocolInputChannelsTx =====

impl ProtocolInputChannelsTx {
    pub(crate) fn ism_event(
        &self,
        area_id: AreaId,
        iface_id: InterfaceId,
        event: ism::Event,
    ) {
        let _ = self.ism_event.send(IsmEventMsg {
            area_key: area_id.into(),
            iface_key: iface_id.into(),
            event,
        });
    }

    pub(crate) fn nsm_event(
        &self,
        area_id: AreaId,
        iface_id: InterfaceId,
        nbr_id: NeighborId,
        event: crate::neighbor::nsm::Event,
    ) {
        let _ = self.nsm_event.send(NsmEventMsg {
            area_key: area_id.into(),
            iface_key: iface_id.into(),
            nbr_key: nbr_id.into(),
            event,
        });
    }

    pub(crate) fn send_lsupd(
        &self,
        area_id: AreaId,
        iface_id: InterfaceId,
        nbr_id: Option<NeighborId>,
    ) {
        let _ = self.send_lsupd.send(SendLsUpdateMsg {
            area_key: area_id.into(),
            iface_key: iface_id.into(),
            nbr_key: nbr_id.map(std::convert::Into::into),
        });
    }

    pub(crate) fn lsa_orig_event(&self, event: LsaOriginateEvent) {
        let _ = self.lsa_orig_event.send(LsaOrigEventMsg { event });
    }

    pub(crate) fn lsa_orig_check(
        &self,
        lsdb_id: LsdbId,
        options: crate::packet::Options,
        lsa_id: Ipv4Addr,
        lsa_body: crate::packet::lsa::LsaBody,
    ) {
        let _ = self.lsa_orig_check.send(LsaOrigCheckMsg {
            lsdb_key: lsdb_id.into(),
            options,
            lsa_id,
            lsa_body,
        });
    }

    pub(crate) fn lsa_flush(
        &self,
        lsdb_id: LsdbId,
        lse_id: crate::collections::LsaEntryId,
        reason: LsaFlushReason,
    ) {
        let _ = self.lsa_flush.send(LsaFlushMsg {
            lsdb_key: lsdb_id.into(),
            lse_key: lse_id.into(),
            reason,
        });
    }
}

// ===== impl ProtocolInputChannelsRx =====

impl ProtocolInputChannelsRx {
    pub async fn recv(&mut self) -> Option<ProtocolInputMsg> {
        tokio::select! {
            biased;
            msg = self.ism_event.recv() => {
                msg.map(ProtocolInputMsg::IsmEvent)
            }
            msg = self.nsm_event.recv() => {
                msg.map(ProtocolInputMsg::NsmEvent)
            }
            msg = self.net_packet_rx.recv() => {
                msg.map(ProtocolInputMsg::NetRxPacket)
            }
            msg = self.hello_interval.recv() => {
                msg.map(ProtocolInputMsg::HelloInterval)
            }
            msg = self.dbdesc_free.recv() => {
                msg.map(ProtocolInputMsg::DbDescFree)
            }
            msg = self.send_lsupd.recv() => {
                msg.map(ProtocolInputMsg::SendLsUpdate)
            }
            msg = self.rxmt_interval.recv() => {
                msg.map(ProtocolInputMsg::RxmtInterval)
            }
            msg = self.delayed_ack_timeout.recv() => {
                msg.map(ProtocolInputMsg::DelayedAck)
            }
            msg = self.lsa_orig_event.recv() => {
                msg.map(ProtocolInputMsg::LsaOrigEvent)
            }
            msg = self.lsa_orig_check.recv() => {
                msg.map(ProtocolInputMsg::LsaOrigCheck)
            }
            msg = self.lsa_orig_delayed_timer.recv() => {
                msg.map(ProtocolInputMsg::LsaOrigDelayed)
            }
            msg = self.lsa_flush.recv() => {
                msg.map(ProtocolInputMsg::LsaFlush)
            }
            msg = self.lsa_refresh.recv() => {
                msg.map(ProtocolInputMsg::LsaRefresh)
            }
            msg = self.lsdb_maxage_sweep_interval.recv() => {
                msg.map(ProtocolInputMsg::LsdbMaxAgeSweep)
            }
            msg = self.lsdb_checksum_scan.recv() => {
                msg.map(ProtocolInputMsg::LsdbChecksumScan)
            }
            msg = self.spf_run.recv() => {
                msg.map(ProtocolInputMsg::SpfRun)
            }
            msg = self.grace_period.recv() => {
                msg.map(ProtocolInputMsg::GracePeriod)
            }
            msg = self.overflow_exit.recv() => {
                msg.map(ProtocolInputMsg::OverflowExit)
            }
            msg = self.gr_restart_timeout.recv() => {
                msg.map(ProtocolInputMsg::GrRestartTimeout)
            }
            msg = self.krt_retry.recv() => {
                msg.map(ProtocolInputMsg::KrtRetry)
            }
        }
    }
}

// ===== helper functions =====

fn protocol_input_channels()
-> (ProtocolInputChannelsTx, ProtocolInputChannelsRx) {
    let (ism_eventp, ism_eventc) = mpsc::unbounded_channel();
    let (nsm_eventp, nsm_eventc) = mpsc::unbounded_channel();
    let (net_packet_rxp, net_packet_rxc) = mpsc::channel(4);
    let (hello_intervalp, hello_intervalc) = mpsc::unbounded_channel();
    let (dbdesc_freep, dbdesc_freec) = mpsc::channel(4);
    let (send_lsupdp, send_lsupdc) = mpsc::unbounded_channel();
    let (rxmt_intervalp, rxmt_intervalc) = mpsc::channel(4);
    let (delayed_ack_timeoutp, delayed_ack_timeoutc) =
        mpsc::unbounded_channel();
    let (lsa_orig_eventp, lsa_orig_eventc) = mpsc::unbounded_channel();
    let (lsa_orig_checkp, lsa_orig_checkc) = mpsc::unbounded_channel();
    let (lsa_orig_delayed_timerp, lsa_orig_delayed_timerc) = mpsc::channel(4);
    let (lsa_flushp, lsa_flushc) = mpsc::unbounded_channel();
    let (lsa_refreshp, lsa_refreshc) = mpsc::unbounded_channel();
    let (lsdb_maxage_sweep_intervalp, lsdb_maxage_sweep_intervalc) =
        mpsc::channel(4);
    let (lsdb_checksum_scanp, lsdb_checksum_scanc) = mpsc::unbounded_channel();
    let (spf_runp, spf_runc) = mpsc::unbounded_channel();
    let (grace_periodp, grace_periodc) = mpsc::channel(4);
    let (overflow_exitp, overflow_exitc) = mpsc::unbounded_channel();
    let (gr_restart_timeoutp, gr_restart_timeoutc) = mpsc::unbounded_channel();
    let (krt_retryp, krt_retryc) = mpsc::unbounded_channel();

    let tx = ProtocolInputChannelsTx {
        ism_event: ism_eventp,
        nsm_event: nsm_eventp,
        net_packet_rx: net_packet_rxp,
        hello_interval: hello_intervalp,
        dbdesc_free: dbdesc_freep,
        send_lsupd: send_lsupdp,
        rxmt_interval: rxmt_intervalp,
        delayed_ack_timeout: delayed_ack_timeoutp,
        lsa_orig_event: lsa_orig_eventp,
        lsa_orig_check: lsa_orig_checkp,
        lsa_orig_delayed_timer: lsa_orig_delayed_timerp,
        lsa_flush: lsa_flushp,
        lsa_refresh: lsa_refreshp,
        lsdb_maxage_sweep_interval: lsdb_maxage_sweep_intervalp,
        lsdb_checksum_scan: lsdb_checksum_scanp,
        spf_run: spf_runp,
        grace_period: grace_periodp,
        overflow_exit: overflow_exitp,
        gr_restart_timeout: gr_restart_timeoutp,
        krt_retry: krt_retryp,
    };
    let rx = ProtocolInputChannelsRx {
        ism_event: ism_eventc,
        nsm_event: nsm_eventc,
        net_packet_rx: net_packet_rxc,
        hello_interval: hello_intervalc,
        dbdesc_free: dbdesc_freec,
        send_lsupd: send_lsupdc,
        rxmt_interval: rxmt_intervalc,
        delayed_ack_timeout: delayed_ack_timeoutc,
        lsa_orig_event: lsa_orig_eventc,
        lsa_orig_check: lsa_orig_checkc,
        lsa_orig_delayed_timer: lsa_orig_delayed_timerc,
        lsa_flush: lsa_flushc,
        lsa_refresh: lsa_refreshc,
        lsdb_maxage_sweep_interval: lsdb_maxage_sweep_intervalc,
        lsdb_checksum_scan: lsdb_checksum_scanc,
        spf_run: spf_runc,
        grace_period: grace_periodc,
        overflow_exit: overflow_exitc,
        gr_restart_timeout: gr_restart_timeoutc,
        krt_retry: krt_retryc,
    };

    (tx, rx)
}

// The cryptographic sequence number is seeded from the wall clock so that it
// keeps increasing across restarts.
fn initial_auth_seqno() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn process_protocol_msg(
    instance: &mut InstanceUpView<'_>,
    arenas: &mut InstanceArenas,
    msg: ProtocolInputMsg,
) -> Result<(), Error> {
    match msg {
        // Interface FSM event.
        ProtocolInputMsg::IsmEvent(msg) => events::process_ism_event(
            instance,
            arenas,
            msg.area_key,
            msg.iface_key,
            msg.event,
        )?,
        // Neighbor FSM event.
        ProtocolInputMsg::NsmEvent(msg) => events::process_nsm_event(
            instance,
            arenas,
            msg.area_key,
            msg.iface_key,
            msg.nbr_key,
            msg.event,
        )?,
        // Received network packet.
        ProtocolInputMsg::NetRxPacket(msg) => {
            events::process_packet(
                instance,
                arenas,
                msg.area_key,
                msg.iface_key,
                msg.src,
                msg.dst,
                msg.packet,
            )?;
        }
        // Hello Tx tick.
        ProtocolInputMsg::HelloInterval(msg) => {
            events::process_hello_interval(
                instance,
                arenas,
                msg.area_key,
                msg.iface_key,
                msg.addr,
            )?
        }
        // Free last sent/received Database Description packets.
        ProtocolInputMsg::DbDescFree(msg) => events::process_dbdesc_free(
            instance,
            arenas,
            msg.area_key,
            msg.iface_key,
            msg.nbr_key,
        )?,
        // Request to send LS Update.
        ProtocolInputMsg::SendLsUpdate(msg) => events::process_send_lsupd(
            instance,
            arenas,
            msg.area_key,
            msg.iface_key,
            msg.nbr_key,
        )?,
        // Packet retransmission.
        ProtocolInputMsg::RxmtInterval(msg) => events::process_packet_rxmt(
            instance,
            arenas,
            msg.area_key,
            msg.iface_key,
            msg.nbr_key,
            msg.packet_type,
        )?,
        // Delayed Ack timeout.
        ProtocolInputMsg::DelayedAck(msg) => {
            events::process_delayed_ack_timeout(
                instance,
                arenas,
                msg.area_key,
                msg.iface_key,
            )?
        }
        // LSA origination event.
        ProtocolInputMsg::LsaOrigEvent(msg) => {
            events::process_lsa_orig_event(instance, arenas, msg.event)?
        }
        // LSA origination check.
        ProtocolInputMsg::LsaOrigCheck(msg) => events::process_lsa_orig_check(
            instance,
            arenas,
            msg.lsdb_key,
            msg.options,
            msg.lsa_id,
            msg.lsa_body,
        )?,
        // LSA delayed origination timer.
        ProtocolInputMsg::LsaOrigDelayed(msg) => {
            events::process_lsa_orig_delayed_timer(
                instance,
                arenas,
                msg.lsdb_key,
                msg.lsa_key,
            )?
        }
        // LSA flush.
        ProtocolInputMsg::LsaFlush(msg) => events::process_lsa_flush(
            instance,
            arenas,
            msg.lsdb_key,
            msg.lse_key,
            msg.reason,
        )?,
        // LSA refresh event.
        ProtocolInputMsg::LsaRefresh(msg) => events::process_lsa_refresh(
            instance,
            arenas,
            msg.lsdb_key,
            msg.lse_key,
        )?,
        // LSA MaxAge sweep interval.
        ProtocolInputMsg::LsdbMaxAgeSweep(msg) => {
            events::process_lsdb_maxage_sweep_interval(
                instance,
                arenas,
                msg.lsdb_key,
            )?
        }
        // LSDB background checksum verification.
        ProtocolInputMsg::LsdbChecksumScan(_) => {
            events::process_lsdb_checksum_scan(instance, arenas)?
        }
        // SPF run event.
        ProtocolInputMsg::SpfRun(_) => {
            events::process_spf_run(instance, arenas)?
        }
        // Grace period timeout.
        ProtocolInputMsg::GracePeriod(msg) => {
            events::process_grace_period_timeout(
                instance,
                arenas,
                msg.area_key,
                msg.iface_key,
                msg.nbr_key,
            )?
        }
        // Database overflow exit.
        ProtocolInputMsg::OverflowExit(_) => {
            events::process_overflow_exit(instance, arenas)?
        }
        // Graceful restart timeout (restarting side).
        ProtocolInputMsg::GrRestartTimeout(_) => {
            events::process_gr_restart_timeout(instance, arenas)?
        }
        // Kernel route re-installation retry.
        ProtocolInputMsg::KrtRetry(msg) => {
            events::process_krt_retry(instance, arenas, msg.prefix)?
        }
    }

    Ok(())
}
