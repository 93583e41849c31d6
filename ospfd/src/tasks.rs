use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use ospfd_utils::socket::{AsyncFd, Socket};
use ospfd_utils::task::{IntervalTask, Task, TimeoutTask};
use tokio::sync::mpsc::{Sender, UnboundedReceiver, UnboundedSender};
use tracing::{Instrument, debug_span};

use crate::area::Area;
use crate::collections::{LsaEntryId, LsdbId};
use crate::debug::LsaFlushReason;
use crate::instance::InstanceUpView;
use crate::interface::{Interface, ism};
use crate::lsdb;
use crate::neighbor::{Neighbor, nsm};
use crate::network;
use crate::packet::lsa::{Lsa, LsaKey};

//
// OSPF tasks diagram:
//                                     +--------------+
//                      net_rx (Nx) -> |              | -> (Nx) net_tx
//                                     |              |
//              hello_interval (Nx) -> |              |
//              ism_wait_timer (Nx) -> |              |
//                                     |              |
//        nsm_inactivity_timer (Nx) -> |              |
//        packet_rxmt_interval (Nx) -> |              |
//           dbdesc_free_timer (Nx) -> |              |
//             ls_update_timer (Nx) -> |              |
//           delayed_ack_timer (Nx) -> |   instance   |
//                                     |              |
//            lsa_expiry_timer (Nx) -> |              |
//           lsa_refresh_timer (Nx) -> |              |
//      lsa_orig_delayed_timer (Nx) -> |              |
//  lsdb_maxage_sweep_interval (Nx) -> |              |
//        lsdb_checksum_interval (1x) -> |            |
//                                     |              |
//             spf_delay_timer (1x) -> |              |
//         overflow_exit_timer (1x) -> |              |
//          grace_period_timer (Nx) -> |              |
//                                     +--------------+
//                                southbound | ^ system events
//                                           V |
//                                     +--------------+
//                                     |    kernel    |
//                                     +--------------+
//

// OSPF inter-task message types.
pub mod messages {
    use std::net::Ipv4Addr;

    use ipnetwork::Ipv4Network;
    use serde::{Deserialize, Serialize};
    use smallvec::SmallVec;

    use crate::collections::{
        AreaKey, InterfaceKey, LsaEntryKey, LsdbKey, NeighborKey,
    };
    use crate::debug::LsaFlushReason;
    use crate::interface::ism;
    use crate::lsdb::LsaOriginateEvent;
    use crate::neighbor::{RxmtPacketType, nsm};
    use crate::packet::error::DecodeError;
    use crate::packet::lsa::LsaKey;
    use crate::packet::{Options, Packet};

    // Type aliases.
    pub type ProtocolInputMsg = input::ProtocolMsg;
    pub type ProtocolOutputMsg = output::ProtocolMsg;

    // Input messages (child task -> main task).
    pub mod input {
        use super::*;

        #[derive(Debug, Deserialize, Serialize)]
        pub enum ProtocolMsg {
            IsmEvent(IsmEventMsg),
            NsmEvent(NsmEventMsg),
            NetRxPacket(NetRxPacketMsg),
            HelloInterval(HelloIntervalMsg),
            DbDescFree(DbDescFreeMsg),
            SendLsUpdate(SendLsUpdateMsg),
            RxmtInterval(RxmtIntervalMsg),
            DelayedAck(DelayedAckMsg),
            LsaOrigEvent(LsaOrigEventMsg),
            LsaOrigCheck(LsaOrigCheckMsg),
            LsaOrigDelayed(LsaOrigDelayedMsg),
            LsaFlush(LsaFlushMsg),
            LsaRefresh(LsaRefreshMsg),
            LsdbMaxAgeSweep(LsdbMaxAgeSweepMsg),
            LsdbChecksumScan(LsdbChecksumScanMsg),
            SpfRun(SpfRunMsg),
            GracePeriod(GracePeriodMsg),
            OverflowExit(OverflowExitMsg),
            GrRestartTimeout(GrRestartTimeoutMsg),
            KrtRetry(KrtRetryMsg),
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct IsmEventMsg {
            pub area_key: AreaKey,
            pub iface_key: InterfaceKey,
            pub event: ism::Event,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NsmEventMsg {
            pub area_key: AreaKey,
            pub iface_key: InterfaceKey,
            pub nbr_key: NeighborKey,
            pub event: nsm::Event,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NetRxPacketMsg {
            pub area_key: AreaKey,
            pub iface_key: InterfaceKey,
            pub src: Ipv4Addr,
            pub dst: Ipv4Addr,
            pub packet: Result<Packet, DecodeError>,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct HelloIntervalMsg {
            pub area_key: AreaKey,
            pub iface_key: InterfaceKey,
            // Unicast poll destination (NBMA), or `None` for the interface's
            // regular destination set.
            pub addr: Option<Ipv4Addr>,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct DbDescFreeMsg {
            pub area_key: AreaKey,
            pub iface_key: InterfaceKey,
            pub nbr_key: NeighborKey,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct SendLsUpdateMsg {
            pub area_key: AreaKey,
            pub iface_key: InterfaceKey,
            pub nbr_key: Option<NeighborKey>,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct RxmtIntervalMsg {
            pub area_key: AreaKey,
            pub iface_key: InterfaceKey,
            pub nbr_key: NeighborKey,
            pub packet_type: RxmtPacketType,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct DelayedAckMsg {
            pub area_key: AreaKey,
            pub iface_key: InterfaceKey,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct LsaOrigEventMsg {
            pub event: LsaOriginateEvent,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct LsaOrigCheckMsg {
            pub lsdb_key: LsdbKey,
            pub options: Options,
            pub lsa_id: Ipv4Addr,
            pub lsa_body: crate::packet::lsa::LsaBody,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct LsaOrigDelayedMsg {
            pub lsdb_key: LsdbKey,
            pub lsa_key: LsaKey,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct LsaFlushMsg {
            pub lsdb_key: LsdbKey,
            pub lse_key: LsaEntryKey,
            pub reason: LsaFlushReason,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct LsaRefreshMsg {
            pub lsdb_key: LsdbKey,
            pub lse_key: LsaEntryKey,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct LsdbMaxAgeSweepMsg {
            pub lsdb_key: LsdbKey,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct LsdbChecksumScanMsg {}

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct SpfRunMsg {}

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct GracePeriodMsg {
            pub area_key: AreaKey,
            pub iface_key: InterfaceKey,
            pub nbr_key: NeighborKey,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct OverflowExitMsg {}

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct GrRestartTimeoutMsg {}

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct KrtRetryMsg {
            pub prefix: Ipv4Network,
        }
    }

    // Output messages (main task -> child task).
    pub mod output {
        use super::*;

        #[derive(Debug, Serialize)]
        pub enum ProtocolMsg {
            NetTxPacket(NetTxPacketMsg),
        }

        #[derive(Clone, Debug, Serialize)]
        pub struct NetTxPacketMsg {
            pub packet: Packet,
            #[cfg(feature = "testing")]
            pub ifname: String,
            pub dst: SmallVec<[Ipv4Addr; 4]>,
        }
    }
}

// ===== OSPF tasks =====

// Network Rx task.
pub(crate) fn net_rx(
    socket: Arc<AsyncFd<Socket>>,
    iface: &Interface,
    area: &Area,
    net_packet_rxp: &Sender<messages::input::NetRxPacketMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("network");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("input");
        let _span2_guard = span2.enter();

        let area_id = area.id;
        let iface_id = iface.id;
        let auth = iface.state.auth.clone();
        let net_packet_rxp = net_packet_rxp.clone();

        Task::spawn_supervised(move || {
            let socket = socket.clone();
            let auth = auth.clone();
            let net_packet_rxp = net_packet_rxp.clone();
            async move {
                let _ = network::read_loop(
                    socket,
                    area_id,
                    iface_id,
                    auth,
                    net_packet_rxp,
                )
                .await;
            }
            .in_current_span()
        })
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Network Tx task.
#[allow(unused_mut)]
pub(crate) fn net_tx(
    socket: Arc<AsyncFd<Socket>>,
    iface: &Interface,
    auth_seqno: &Arc<AtomicU64>,
    mut net_packet_txc: UnboundedReceiver<messages::output::NetTxPacketMsg>,
    #[cfg(feature = "testing")] proto_output_tx: &Sender<
        messages::ProtocolOutputMsg,
    >,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("network");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("output");
        let _span2_guard = span2.enter();

        let ifindex = iface.system.ifindex.unwrap();
        let src = iface.state.src_addr.unwrap();
        let auth = iface.state.auth.clone();
        let auth_seqno = auth_seqno.clone();

        Task::spawn(
            async move {
                network::write_loop(
                    socket,
                    ifindex,
                    src,
                    auth,
                    auth_seqno,
                    net_packet_txc,
                )
                .await;
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        let proto_output_tx = proto_output_tx.clone();
        Task::spawn(async move {
            // Relay message to the test framework.
            while let Some(msg) = net_packet_txc.recv().await {
                let msg = messages::ProtocolOutputMsg::NetTxPacket(msg);
                let _ = proto_output_tx.send(msg).await;
            }
        })
    }
}

// Periodic OSPF Hello trigger.
//
// The Hello packet itself is generated at each tick by the instance, so that
// the advertised neighbor list is always current and hellos can be withheld
// on demand circuits.
pub(crate) fn hello_interval(
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
    addr: Option<std::net::Ipv4Addr>,
    interval: u16,
) -> IntervalTask {
    let area_id = area.id;
    let iface_id = iface.id;
    let hello_intervalp = instance.tx.protocol_input.hello_interval.clone();

    IntervalTask::new(
        Duration::from_secs(interval.into()),
        true,
        move || {
            let hello_intervalp = hello_intervalp.clone();

            async move {
                let msg = messages::input::HelloIntervalMsg {
                    area_key: area_id.into(),
                    iface_key: iface_id.into(),
                    addr,
                };
                let _ = hello_intervalp.send(msg);
            }
        },
    )
}

// Interface wait timer task.
pub(crate) fn ism_wait_timer(
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
) -> TimeoutTask {
    let timeout = Duration::from_secs(iface.config.dead_interval.into());
    let area_id = area.id;
    let iface_id = iface.id;
    let ism_eventp = instance.tx.protocol_input.ism_event.clone();

    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::IsmEventMsg {
            area_key: area_id.into(),
            iface_key: iface_id.into(),
            event: ism::Event::WaitTimer,
        };
        let _ = ism_eventp.send(msg);
    })
}

// Neighbor inactivity timer.
pub(crate) fn nsm_inactivity_timer(
    nbr: &Neighbor,
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
) -> TimeoutTask {
    let timeout = Duration::from_secs(iface.config.dead_interval.into());
    let nbr_id = nbr.id;
    let area_id = area.id;
    let iface_id = iface.id;
    let nsm_eventp = instance.tx.protocol_input.nsm_event.clone();

    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::NsmEventMsg {
            area_key: area_id.into(),
            iface_key: iface_id.into(),
            nbr_key: nbr_id.into(),
            event: nsm::Event::InactivityTimer,
        };
        let _ = nsm_eventp.send(msg);
    })
}

// Send periodic packet retransmissions.
pub(crate) fn packet_rxmt_interval(
    iface: &Interface,
    msg: messages::input::RxmtIntervalMsg,
    instance: &InstanceUpView<'_>,
) -> IntervalTask {
    let rxmt_intervalp = instance.tx.protocol_input.rxmt_interval.clone();

    IntervalTask::new(
        Duration::from_secs(iface.config.retransmit_interval.into()),
        false,
        move || {
            let rxmt_intervalp = rxmt_intervalp.clone();
            let msg = msg.clone();

            async move {
                let _ = rxmt_intervalp.send(msg).await;
            }
        },
    )
}

// Timer to free the neighbor's last sent/received Database Description
// packets.
pub(crate) fn dbdesc_free_timer(
    nbr: &Neighbor,
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
) -> TimeoutTask {
    let area_id = area.id;
    let iface_id = iface.id;
    let nbr_id = nbr.id;
    let dbdesc_freep = instance.tx.protocol_input.dbdesc_free.clone();

    TimeoutTask::new(
        Duration::from_secs(iface.config.dead_interval.into()),
        move || async move {
            let _ = dbdesc_freep
                .send(messages::input::DbDescFreeMsg {
                    area_key: area_id.into(),
                    iface_key: iface_id.into(),
                    nbr_key: nbr_id.into(),
                })
                .await;
        },
    )
}

// Interface LS Update timer task.
pub(crate) fn ls_update_timer(
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
) -> TimeoutTask {
    let area_id = area.id;
    let iface_id = iface.id;
    let send_lsupdp = instance.tx.protocol_input.send_lsupd.clone();

    #[cfg(not(feature = "testing"))]
    {
        // Start timer.
        TimeoutTask::new(Duration::from_millis(100), move || async move {
            let _ = send_lsupdp.send(messages::input::SendLsUpdateMsg {
                area_key: area_id.into(),
                iface_key: iface_id.into(),
                nbr_key: None,
            });
        })
    }
    #[cfg(feature = "testing")]
    {
        // Send LS Update immediately.
        let _ = send_lsupdp.send(messages::input::SendLsUpdateMsg {
            area_key: area_id.into(),
            iface_key: iface_id.into(),
            nbr_key: None,
        });

        TimeoutTask::new(Duration::from_millis(100), move || async move {})
    }
}

// Interface delayed Ack timer task.
pub(crate) fn delayed_ack_timer(
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
) -> TimeoutTask {
    let area_id = area.id;
    let iface_id = iface.id;
    let delayed_ack_timeoutp =
        instance.tx.protocol_input.delayed_ack_timeout.clone();

    #[cfg(not(feature = "testing"))]
    {
        // RFC 2328 - Section 13.5:
        // "The fixed interval between a router's delayed transmissions must
        // be short (less than RxmtInterval) or needless retransmissions will
        // ensue".
        let timeout = Duration::from_secs(1);
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::DelayedAckMsg {
                area_key: area_id.into(),
                iface_key: iface_id.into(),
            };
            let _ = delayed_ack_timeoutp.send(msg);
        })
    }
    #[cfg(feature = "testing")]
    {
        // Send LS Ack immediately.
        let msg = messages::input::DelayedAckMsg {
            area_key: area_id.into(),
            iface_key: iface_id.into(),
        };
        let _ = delayed_ack_timeoutp.send(msg);

        TimeoutTask::new(Duration::from_secs(1), move || async move {})
    }
}

// LSA expiry timer task.
//
// DoNotAge LSAs never expire and carry no such timer.
pub(crate) fn lsa_expiry_timer(
    lsdb_id: LsdbId,
    lse_id: LsaEntryId,
    lsa: &Lsa,
    lsa_flushp: &UnboundedSender<messages::input::LsaFlushMsg>,
) -> TimeoutTask {
    let timeout = lsdb::LSA_MAX_AGE - lsa.hdr.age();
    let timeout = Duration::from_secs(timeout.into());
    let lsa_flushp = lsa_flushp.clone();

    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::LsaFlushMsg {
            lsdb_key: lsdb_id.into(),
            lse_key: lse_id.into(),
            reason: LsaFlushReason::Expiry,
        };
        let _ = lsa_flushp.send(msg);
    })
}

// LSA refresh timer task.
//
// Refreshes are randomly spread to avoid synchronized refresh storms.
pub(crate) fn lsa_refresh_timer(
    lsdb_id: LsdbId,
    lse_id: LsaEntryId,
    lsa_refreshp: &UnboundedSender<messages::input::LsaRefreshMsg>,
) -> TimeoutTask {
    let timeout = lsdb::LSA_REFRESH_TIME as u64 + refresh_jitter();
    let timeout = Duration::from_secs(timeout);
    let lsa_refreshp = lsa_refreshp.clone();

    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::LsaRefreshMsg {
            lsdb_key: lsdb_id.into(),
            lse_key: lse_id.into(),
        };
        let _ = lsa_refreshp.send(msg);
    })
}

// LSA delayed origination timer task.
pub(crate) fn lsa_orig_delayed_timer(
    lsdb_id: LsdbId,
    lsa_key: LsaKey,
    lsa_base_time: Option<Instant>,
    lsa_orig_delayed_timerp: &Sender<messages::input::LsaOrigDelayedMsg>,
) -> TimeoutTask {
    let lsa_orig_delayed_timerp = lsa_orig_delayed_timerp.clone();

    let lsa_age = lsa_base_time
        .map(|base_time| base_time.elapsed())
        .unwrap_or_default();
    let timeout =
        Duration::from_secs(lsdb::LSA_MIN_INTERVAL).saturating_sub(lsa_age);

    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::LsaOrigDelayedMsg {
            lsdb_key: lsdb_id.into(),
            lsa_key,
        };
        let _ = lsa_orig_delayed_timerp.send(msg).await;
    })
}

// LSDB MaxAge sweeper interval task.
pub(crate) fn lsdb_maxage_sweep_interval(
    lsdb_id: LsdbId,
    lsdb_maxage_sweep_intervalp: &Sender<messages::input::LsdbMaxAgeSweepMsg>,
) -> IntervalTask {
    let lsdb_maxage_sweep_intervalp = lsdb_maxage_sweep_intervalp.clone();

    let timeout = Duration::from_secs(5);
    IntervalTask::new(timeout, false, move || {
        let lsdb_maxage_sweep_intervalp = lsdb_maxage_sweep_intervalp.clone();
        async move {
            let msg = messages::input::LsdbMaxAgeSweepMsg {
                lsdb_key: lsdb_id.into(),
            };
            let _ = lsdb_maxage_sweep_intervalp.send(msg).await;
        }
    })
}

// LSDB background checksum verification interval task.
pub(crate) fn lsdb_checksum_interval(
    lsdb_checksum_scanp: &UnboundedSender<messages::input::LsdbChecksumScanMsg>,
) -> IntervalTask {
    let lsdb_checksum_scanp = lsdb_checksum_scanp.clone();

    let timeout = Duration::from_secs(lsdb::LSA_CHECK_INTERVAL);
    IntervalTask::new(timeout, false, move || {
        let lsdb_checksum_scanp = lsdb_checksum_scanp.clone();
        async move {
            let msg = messages::input::LsdbChecksumScanMsg {};
            let _ = lsdb_checksum_scanp.send(msg);
        }
    })
}

// SPF delay timer task.
//
// SPF requests are coalesced: the first trigger arms this timer and
// subsequent triggers are absorbed until it fires.
pub(crate) fn spf_delay_timer(
    instance: &InstanceUpView<'_>,
    timeout: u32,
) -> TimeoutTask {
    let timeout = Duration::from_millis(timeout.into());
    let spf_runp = instance.tx.protocol_input.spf_run.clone();

    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::SpfRunMsg {};
        let _ = spf_runp.send(msg);
    })
}

// Grace period timer task.
pub(crate) fn grace_period_timer(
    nbr: &Neighbor,
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
    grace_period: u32,
) -> TimeoutTask {
    let area_id = area.id;
    let iface_id = iface.id;
    let nbr_id = nbr.id;
    let grace_periodp = instance.tx.protocol_input.grace_period.clone();

    TimeoutTask::new(
        Duration::from_secs(grace_period.into()),
        move || async move {
            let _ = grace_periodp
                .send(messages::input::GracePeriodMsg {
                    area_key: area_id.into(),
                    iface_key: iface_id.into(),
                    nbr_key: nbr_id.into(),
                })
                .await;
        },
    )
}

// Database overflow exit timer task.
pub(crate) fn overflow_exit_timer(
    instance: &InstanceUpView<'_>,
    interval: u16,
) -> TimeoutTask {
    let overflow_exitp = instance.tx.protocol_input.overflow_exit.clone();

    TimeoutTask::new(
        Duration::from_secs(interval.into()),
        move || async move {
            let msg = messages::input::OverflowExitMsg {};
            let _ = overflow_exitp.send(msg);
        },
    )
}

// Graceful restart timer task (restarting side).
pub(crate) fn gr_restart_timer(
    instance: &InstanceUpView<'_>,
    grace_period: u32,
) -> TimeoutTask {
    let gr_restartp = instance.tx.protocol_input.gr_restart_timeout.clone();

    TimeoutTask::new(
        Duration::from_secs(grace_period.into()),
        move || async move {
            let msg = messages::input::GrRestartTimeoutMsg {};
            let _ = gr_restartp.send(msg);
        },
    )
}

// Kernel route re-installation retry timer.
pub(crate) fn krt_retry_timer(
    instance: &InstanceUpView<'_>,
    prefix: ipnetwork::Ipv4Network,
) -> TimeoutTask {
    let krt_retryp = instance.tx.protocol_input.krt_retry.clone();

    TimeoutTask::new(Duration::from_secs(5), move || async move {
        let msg = messages::input::KrtRetryMsg { prefix };
        let _ = krt_retryp.send(msg);
    })
}

// ===== helper functions =====

// Random spread applied to LSA refreshes, bounded by MaxAgeDiff.
fn refresh_jitter() -> u64 {
    #[cfg(not(feature = "deterministic"))]
    {
        use rand::Rng;
        rand::rng().random_range(0..lsdb::LSA_MAX_AGE_DIFF as u64)
    }
    #[cfg(feature = "deterministic")]
    {
        0
    }
}
