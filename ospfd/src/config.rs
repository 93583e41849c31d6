use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::error::CommitError;
use crate::interface::InterfaceType;
use crate::packet::auth::{AuthKey, AuthKeyring, AuthMethod};

// Administrative distance of OSPF routes.
pub const DFLT_DISTANCE: u8 = 110;

// Instance-wide configuration.
#[derive(Clone, Debug)]
pub struct InstanceCfg {
    pub enabled: bool,
    pub router_id: Option<Ipv4Addr>,
    // Maximum number of equal-cost paths per route.
    pub max_paths: u16,
    // Maximum number of concurrent database exchanges, per direction.
    pub max_dds: u16,
    // Upper bound of the per-neighbor retransmission window.
    pub max_rxmt_window: u16,
    // Maximum number of parallel point-to-point adjacencies per neighbor.
    pub pp_adj_limit: Option<u8>,
    // Act as a host: never advertise transit links.
    pub host_mode: bool,
    // AS-external-LSA database limit and overflow exit interval.
    pub lsdb_limit: Option<u32>,
    pub overflow_interval: u16,
    // Graceful restart configuration.
    pub gr: GrCfg,
    // Locally originated AS-external routes.
    pub external_routes: BTreeMap<Ipv4Network, ExternalRouteCfg>,
}

#[derive(Clone, Debug)]
pub struct GrCfg {
    pub helper_enabled: bool,
    pub strict_lsa_checking: bool,
}

// Per-area configuration.
#[derive(Clone, Debug)]
pub struct AreaCfg {
    pub area_type: AreaType,
    // Whether summary-LSAs are imported into this (stub) area.
    pub summary: bool,
    // Cost of the default summary route advertised into stub areas.
    pub default_cost: u32,
}

// OSPF area type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AreaType {
    Normal,
    Stub,
}

// Per-range configuration.
#[derive(Clone, Debug, Default)]
pub struct RangeCfg {
    pub advertise: bool,
    pub cost: Option<u32>,
}

// Per-interface configuration.
#[derive(Clone, Debug)]
pub struct InterfaceCfg {
    pub enabled: bool,
    pub if_type: InterfaceType,
    pub cost: u16,
    pub hello_interval: u16,
    pub dead_interval: u16,
    pub retransmit_interval: u16,
    pub transmit_delay: u16,
    pub priority: u8,
    pub passive: bool,
    pub demand_circuit: bool,
    pub mtu_ignore: bool,
    pub auth: Option<AuthCfg>,
    // NBMA/Point-to-MultiPoint static neighbors.
    pub static_nbrs: BTreeMap<Ipv4Addr, StaticNbrCfg>,
    // Virtual link parameters (if_type == VirtualLink).
    pub vlink: Option<VlinkCfg>,
}

// Authentication configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthCfg {
    Simple(String),
    MessageDigest(BTreeMap<u8, String>),
}

// Statically configured neighbor.
#[derive(Clone, Debug)]
pub struct StaticNbrCfg {
    pub priority: u8,
    pub poll_interval: u16,
}

// Virtual link parameters.
#[derive(Clone, Debug)]
pub struct VlinkCfg {
    pub transit_area_id: Ipv4Addr,
    pub router_id: Ipv4Addr,
}

// Locally originated AS-external route.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExternalRouteCfg {
    pub metric: u32,
    pub metric_type2: bool,
    pub tag: u32,
    pub fwd_addr: Option<Ipv4Addr>,
    pub no_advertise: bool,
}

// Single operation within a configuration transaction.
#[derive(Clone, Debug)]
pub enum ConfigOp {
    GlobalSet(InstanceCfg),
    AreaUpsert {
        area_id: Ipv4Addr,
        cfg: AreaCfg,
    },
    AreaDelete {
        area_id: Ipv4Addr,
    },
    InterfaceUpsert {
        area_id: Ipv4Addr,
        ifname: String,
        cfg: InterfaceCfg,
    },
    InterfaceDelete {
        ifname: String,
    },
    RangeUpsert {
        area_id: Ipv4Addr,
        prefix: Ipv4Network,
        cfg: RangeCfg,
    },
    RangeDelete {
        area_id: Ipv4Addr,
        prefix: Ipv4Network,
    },
    StaticNbrUpsert {
        ifname: String,
        addr: Ipv4Addr,
        cfg: StaticNbrCfg,
    },
    StaticNbrDelete {
        ifname: String,
        addr: Ipv4Addr,
    },
    Md5KeyUpsert {
        ifname: String,
        key_id: u8,
        key: String,
    },
    Md5KeyDelete {
        ifname: String,
        key_id: u8,
    },
    ExternalRouteUpsert {
        prefix: Ipv4Network,
        cfg: ExternalRouteCfg,
    },
    ExternalRouteDelete {
        prefix: Ipv4Network,
    },
}

// An uncommitted set of configuration operations.
//
// Operations are accumulated with `add` and validated and applied atomically
// by `Instance::commit`; a rejected transaction leaves the running
// configuration untouched.
#[derive(Debug, Default)]
pub struct ConfigTransaction {
    pub(crate) ops: Vec<ConfigOp>,
}

// ===== impl InstanceCfg =====

impl InstanceCfg {
    pub const DFLT_MAX_PATHS: u16 = 4;
    pub const DFLT_MAX_DDS: u16 = 4;
    pub const DFLT_MAX_RXMT_WINDOW: u16 = 8;
    pub const DFLT_OVERFLOW_INTERVAL: u16 = 300;
}

impl Default for InstanceCfg {
    fn default() -> InstanceCfg {
        InstanceCfg {
            enabled: true,
            router_id: None,
            max_paths: Self::DFLT_MAX_PATHS,
            max_dds: Self::DFLT_MAX_DDS,
            max_rxmt_window: Self::DFLT_MAX_RXMT_WINDOW,
            pp_adj_limit: None,
            host_mode: false,
            lsdb_limit: None,
            overflow_interval: Self::DFLT_OVERFLOW_INTERVAL,
            gr: Default::default(),
            external_routes: Default::default(),
        }
    }
}

// ===== impl GrCfg =====

impl Default for GrCfg {
    fn default() -> GrCfg {
        GrCfg {
            helper_enabled: true,
            strict_lsa_checking: true,
        }
    }
}

// ===== impl AreaCfg =====

impl AreaCfg {
    pub const DFLT_DEFAULT_COST: u32 = 1;
}

impl Default for AreaCfg {
    fn default() -> AreaCfg {
        AreaCfg {
            area_type: AreaType::Normal,
            summary: true,
            default_cost: Self::DFLT_DEFAULT_COST,
        }
    }
}

// ===== impl InterfaceCfg =====

impl InterfaceCfg {
    pub const DFLT_COST: u16 = 10;
    pub const DFLT_HELLO_INTERVAL: u16 = 10;
    pub const DFLT_DEAD_INTERVAL: u16 = 40;
    pub const DFLT_RETRANSMIT_INTERVAL: u16 = 5;
    pub const DFLT_TRANSMIT_DELAY: u16 = 1;
    pub const DFLT_PRIORITY: u8 = 1;

    // Builds the runtime authentication data from the configuration.
    pub(crate) fn auth_method(&self) -> Option<AuthMethod> {
        match &self.auth {
            Some(AuthCfg::Simple(passwd)) => {
                Some(AuthMethod::Simple(passwd.as_bytes().to_vec()))
            }
            Some(AuthCfg::MessageDigest(keys)) => {
                let keys = keys
                    .iter()
                    .map(|(id, key)| {
                        (*id, AuthKey::new(*id, key.as_bytes().to_vec()))
                    })
                    .collect();
                Some(AuthMethod::MessageDigest(AuthKeyring { keys }))
            }
            None => None,
        }
    }
}

impl Default for InterfaceCfg {
    fn default() -> InterfaceCfg {
        InterfaceCfg {
            enabled: true,
            if_type: InterfaceType::Broadcast,
            cost: Self::DFLT_COST,
            hello_interval: Self::DFLT_HELLO_INTERVAL,
            dead_interval: Self::DFLT_DEAD_INTERVAL,
            retransmit_interval: Self::DFLT_RETRANSMIT_INTERVAL,
            transmit_delay: Self::DFLT_TRANSMIT_DELAY,
            priority: Self::DFLT_PRIORITY,
            passive: false,
            demand_circuit: false,
            mtu_ignore: false,
            auth: None,
            static_nbrs: Default::default(),
            vlink: None,
        }
    }
}

// ===== impl StaticNbrCfg =====

impl StaticNbrCfg {
    pub const DFLT_POLL_INTERVAL: u16 = 120;
}

impl Default for StaticNbrCfg {
    fn default() -> StaticNbrCfg {
        StaticNbrCfg {
            priority: 0,
            poll_interval: Self::DFLT_POLL_INTERVAL,
        }
    }
}

// ===== impl ConfigTransaction =====

impl ConfigTransaction {
    pub fn begin() -> ConfigTransaction {
        Default::default()
    }

    pub fn add(&mut self, op: ConfigOp) {
        self.ops.push(op);
    }

    pub fn abort(self) {}

    // Validates the individual operations against the given running
    // configuration. Cross-object validation is done during the apply phase.
    pub(crate) fn validate(
        &self,
        running_router_id: Option<Ipv4Addr>,
        active: bool,
    ) -> Result<(), CommitError> {
        for op in &self.ops {
            match op {
                ConfigOp::GlobalSet(cfg) => {
                    // The Router ID cannot change without a restart.
                    if active
                        && cfg.router_id.is_some()
                        && cfg.router_id != running_router_id
                    {
                        return Err(CommitError::RouterIdChange);
                    }
                    if cfg.max_paths == 0 {
                        return Err(CommitError::InvalidParameter(
                            "max-paths",
                        ));
                    }
                    if cfg.max_dds == 0 {
                        return Err(CommitError::InvalidParameter("max-dds"));
                    }
                    if cfg.max_rxmt_window == 0 {
                        return Err(CommitError::InvalidParameter(
                            "max-rxmt-window",
                        ));
                    }
                }
                ConfigOp::InterfaceUpsert { cfg, .. } => {
                    if cfg.hello_interval == 0 {
                        return Err(CommitError::InvalidParameter(
                            "hello-interval",
                        ));
                    }
                    if cfg.dead_interval <= cfg.hello_interval {
                        return Err(CommitError::InvalidParameter(
                            "dead-interval",
                        ));
                    }
                    if cfg.retransmit_interval == 0 {
                        return Err(CommitError::InvalidParameter(
                            "retransmit-interval",
                        ));
                    }
                    if let Some(vlink) = &cfg.vlink {
                        // Virtual links cannot transit the backbone itself.
                        if vlink.transit_area_id == Ipv4Addr::UNSPECIFIED {
                            return Err(CommitError::VlinkTransitBackbone);
                        }
                    }
                }
                _ => (),
            }
        }

        Ok(())
    }
}
