use smallvec::smallvec;

use crate::area::Area;
use crate::collections::{Arena, NeighborIndex};
use crate::instance::InstanceUpView;
use crate::interface::{Interface, InterfaceType, ism};
use crate::lsdb;
use crate::neighbor::{Neighbor, nsm};
use crate::network::MulticastAddr;
use crate::packet::lsa::LsaHdr;
use crate::packet::{
    DbDesc, DbDescFlags, LsAck, LsRequest, LsUpdate, Packet, PacketHdr,
    PacketType,
};
use crate::tasks::messages::output::NetTxPacketMsg;

// ===== Database Description Packets =====

pub(crate) fn send_dbdesc(
    nbr: &mut Neighbor,
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
) {
    // Initialize destination address.
    let dst = send_dest_nbr(nbr, iface);

    // Calculate maximum packet size.
    let max_size =
        iface.max_packet_size() - PacketHdr::LENGTH - DbDesc::BASE_LENGTH;

    // Append as many LSA headers as possible while on the Exchange state.
    let mut total = 0;
    let mut lsa_hdrs = vec![];
    while total + LsaHdr::LENGTH <= max_size {
        match nbr.lists.db_summary.pop_first() {
            Some((_, lsa)) => {
                total += LsaHdr::LENGTH;

                // Update LSA age.
                let mut lsa_hdr = lsa.hdr;
                lsa_hdr.set_age(lsa.age() | (lsa.hdr.age & lsdb::LSA_DO_NOT_AGE));
                lsa_hdrs.push(lsa_hdr);
            }
            None => break,
        }
    }

    // Clear the M-bit if there's no more data to send.
    if !nbr.dd_flags.contains(DbDescFlags::I)
        && nbr.lists.db_summary.is_empty()
    {
        nbr.dd_flags.remove(DbDescFlags::M);
    }

    // Generate Database Description packet.
    let pkt_hdr = PacketHdr::new(
        PacketType::DbDesc,
        instance.state.router_id,
        area.area_id,
    );
    let packet = Packet::DbDesc(DbDesc {
        hdr: pkt_hdr,
        options: area.options(iface),
        mtu: if iface.is_virtual_link() {
            0
        } else {
            iface.system.mtu.unwrap()
        },
        dd_flags: nbr.dd_flags,
        dd_seq_no: nbr.dd_seq_no,
        lsa_hdrs,
    });

    // Enqueue packet for network transmission.
    let msg = NetTxPacketMsg {
        packet,
        #[cfg(feature = "testing")]
        ifname: iface.name.clone(),
        dst,
    };
    nbr.last_sent_dbdesc = Some(msg.clone());
    iface.send_packet(msg);

    // Start retransmission interval in two cases:
    // * The router is master
    // * When sending the initial database description packet
    if nbr.dd_flags.intersects(DbDescFlags::MS | DbDescFlags::I) {
        nbr.rxmt_dbdesc_start(iface, area, instance);
    }
}

pub(crate) fn rxmt_dbdesc(nbr: &Neighbor, iface: &Interface) {
    if let Some(msg) = &nbr.last_sent_dbdesc {
        // Enqueue packet for network transmission.
        iface.send_packet(msg.clone());
    }
}

// ===== LS Request Packets =====

pub(crate) fn send_lsreq(
    nbr: &mut Neighbor,
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
) {
    // Initialize destination address.
    let dst = send_dest_nbr(nbr, iface);

    // Calculate maximum packet size.
    let max_size = iface.max_packet_size() - PacketHdr::LENGTH;

    // Append as many LS Request Entries as possible in a single packet.
    let mut total = 0;
    while total + LsRequest::ENTRY_LENGTH < max_size {
        match nbr.lists.ls_request.pop_first() {
            Some((lsa_key, lsa_hdr)) => {
                nbr.lists.ls_request_pending.insert(lsa_key, lsa_hdr);
                total += LsRequest::ENTRY_LENGTH;
            }
            None => break,
        }
    }

    // Generate Link State Request packet.
    let pkt_hdr = PacketHdr::new(
        PacketType::LsRequest,
        instance.state.router_id,
        area.area_id,
    );
    let entries = nbr.lists.ls_request_pending.keys().copied().collect();
    let packet = Packet::LsRequest(LsRequest {
        hdr: pkt_hdr,
        entries,
    });

    // Enqueue packet for network transmission.
    let msg = NetTxPacketMsg {
        packet,
        #[cfg(feature = "testing")]
        ifname: iface.name.clone(),
        dst,
    };
    iface.send_packet(msg);

    // Start retransmission interval.
    nbr.rxmt_lsreq_start(iface, area, instance);
}

pub(crate) fn rxmt_lsreq(
    nbr: &Neighbor,
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
) {
    // Initialize destination address.
    let dst = send_dest_nbr(nbr, iface);

    // Generate Link State Request packet.
    let pkt_hdr = PacketHdr::new(
        PacketType::LsRequest,
        instance.state.router_id,
        area.area_id,
    );
    let entries = nbr.lists.ls_request_pending.keys().copied().collect();
    let packet = Packet::LsRequest(LsRequest {
        hdr: pkt_hdr,
        entries,
    });

    // Enqueue packet for network transmission.
    let msg = NetTxPacketMsg {
        packet,
        #[cfg(feature = "testing")]
        ifname: iface.name.clone(),
        dst,
    };
    iface.send_packet(msg);
}

// ===== LS Update Packets =====

pub(crate) fn send_lsupd(
    nbr_idx: Option<NeighborIndex>,
    iface: &mut Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
    neighbors: &mut Arena<Neighbor>,
) {
    // Initialize destination address(es).
    let dst = send_dest_iface(iface, neighbors);

    // Calculate maximum packet size.
    let max_size = iface.max_packet_size()
        - PacketHdr::LENGTH
        - LsUpdate::BASE_LENGTH;

    // Get list of LSAs enqueued for transmission.
    let ls_update_list = match nbr_idx {
        Some(nbr_idx) => {
            let nbr = &mut neighbors[nbr_idx];
            &mut nbr.lists.ls_update
        }
        None => &mut iface.state.ls_update_list,
    };
    let mut ls_update_list = std::mem::take(ls_update_list);

    // Send as many LS Updates as necessary.
    while !ls_update_list.is_empty() {
        // Append as many LSAs as possible in a single packet.
        let mut total = 0;
        let mut lsas = vec![];
        while let Some(mut o) = ls_update_list.first_entry() {
            let lsa = o.get_mut();
            // If a single LSA is bigger than the maximum packet size,
            // there's nothing we can do other than relying on IP-level
            // fragmentation.
            if lsa.hdr.length <= max_size && total + lsa.hdr.length > max_size
            {
                break;
            }
            total += lsa.hdr.length;

            // Update LSA age before transmission.
            let lsa = o.remove();
            let mut lsa = (*lsa).clone();
            let age = std::cmp::min(
                lsa.age() + iface.config.transmit_delay,
                lsdb::LSA_MAX_AGE,
            );
            lsa.set_age(age);
            lsas.push(lsa);
        }

        // Generate Link State Update packet.
        let pkt_hdr = PacketHdr::new(
            PacketType::LsUpdate,
            instance.state.router_id,
            area.area_id,
        );
        let packet = Packet::LsUpdate(LsUpdate { hdr: pkt_hdr, lsas });

        // Enqueue packet for network transmission.
        let msg = NetTxPacketMsg {
            packet,
            #[cfg(feature = "testing")]
            ifname: iface.name.clone(),
            dst: dst.clone(),
        };
        iface.send_packet(msg);
    }
}

// Handles the expiry of the retransmission timer: whatever was in flight is
// assumed lost, so the window collapses back to one LSA before sending.
pub(crate) fn rxmt_lsupd(
    nbr: &mut Neighbor,
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
) {
    nbr.lists.ls_rxmt_pending.clear();
    nbr.rxmt_window = 1;

    rxmt_lsupd_window(nbr, iface, area, instance);
}

// Retransmits as many unacknowledged LSAs as the current window allows.
pub(crate) fn rxmt_lsupd_window(
    nbr: &mut Neighbor,
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
) {
    // Initialize destination address.
    let dst = send_dest_nbr(nbr, iface);

    // Calculate maximum packet size.
    let max_size = iface.max_packet_size()
        - PacketHdr::LENGTH
        - LsUpdate::BASE_LENGTH;

    // Append as many LSAs as fit in the current retransmission window.
    let window = nbr
        .rxmt_window
        .saturating_sub(nbr.lists.ls_rxmt_pending.len() as u16);
    let mut total = 0;
    let mut lsas = vec![];
    for lsa in nbr
        .lists
        .ls_rxmt
        .values()
        .filter(|lsa| !nbr.lists.ls_rxmt_pending.contains(&lsa.hdr.key()))
        .take(window as usize)
    {
        // If a single LSA is bigger than the maximum packet size, there's
        // nothing we can do other than relying on IP-level fragmentation.
        if lsa.hdr.length <= max_size && total + lsa.hdr.length > max_size {
            break;
        }
        total += lsa.hdr.length;

        // Update LSA age before transmission.
        let mut lsa = (**lsa).clone();
        let age = std::cmp::min(
            lsa.age() + iface.config.transmit_delay,
            lsdb::LSA_MAX_AGE,
        );
        lsa.set_age(age);
        lsas.push(lsa);
    }
    if lsas.is_empty() {
        return;
    }

    // Record the in-flight instances.
    for lsa in &lsas {
        nbr.lists.ls_rxmt_pending.insert(lsa.hdr.key());
    }

    // Generate Link State Update packet.
    let pkt_hdr = PacketHdr::new(
        PacketType::LsUpdate,
        instance.state.router_id,
        area.area_id,
    );
    let packet = Packet::LsUpdate(LsUpdate { hdr: pkt_hdr, lsas });

    // Enqueue packet for network transmission.
    let msg = NetTxPacketMsg {
        packet,
        #[cfg(feature = "testing")]
        ifname: iface.name.clone(),
        dst,
    };
    iface.send_packet(msg);
}

// ===== LS Ack Packets =====

pub(crate) fn send_lsack_direct(
    nbr: &Neighbor,
    iface: &Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
    lsa_hdr: &LsaHdr,
) {
    // Initialize destination address.
    let dst = send_dest_nbr(nbr, iface);

    // Generate Link State Ack packet.
    let pkt_hdr = PacketHdr::new(
        PacketType::LsAck,
        instance.state.router_id,
        area.area_id,
    );
    let lsa_hdrs = vec![*lsa_hdr];
    let packet = Packet::LsAck(LsAck {
        hdr: pkt_hdr,
        lsa_hdrs,
    });

    // Enqueue packet for network transmission.
    let msg = NetTxPacketMsg {
        packet,
        #[cfg(feature = "testing")]
        ifname: iface.name.clone(),
        dst,
    };
    iface.send_packet(msg);
}

pub(crate) fn send_lsack_delayed(
    iface: &mut Interface,
    area: &Area,
    instance: &InstanceUpView<'_>,
    neighbors: &Arena<Neighbor>,
) {
    // Initialize destination address(es).
    let dst = send_dest_iface(iface, neighbors);

    // Calculate maximum packet size.
    let max_size = iface.max_packet_size() - PacketHdr::LENGTH;

    // Send as many LS Acks as necessary.
    while !iface.state.ls_ack_list.is_empty() {
        // Append as many LSA headers as possible in a single packet.
        let mut total = 0;
        let mut lsa_hdrs = vec![];
        while total + LsaHdr::LENGTH <= max_size {
            match iface.state.ls_ack_list.pop_first() {
                Some((_, lsa_hdr)) => {
                    total += LsaHdr::LENGTH;
                    lsa_hdrs.push(lsa_hdr);
                }
                None => break,
            }
        }

        // Generate Link State Ack packet.
        let pkt_hdr = PacketHdr::new(
            PacketType::LsAck,
            instance.state.router_id,
            area.area_id,
        );
        let packet = Packet::LsAck(LsAck {
            hdr: pkt_hdr,
            lsa_hdrs,
        });

        // Enqueue packet for network transmission.
        let msg = NetTxPacketMsg {
            packet,
            #[cfg(feature = "testing")]
            ifname: iface.name.clone(),
            dst: dst.clone(),
        };
        iface.send_packet(msg);
    }
}

// ===== helper functions =====

// Returns destination used to send a packet directly to the given neighbor.
fn send_dest_nbr(
    nbr: &Neighbor,
    iface: &Interface,
) -> smallvec::SmallVec<[std::net::Ipv4Addr; 4]> {
    let addr = if iface.config.if_type == InterfaceType::PointToPoint {
        MulticastAddr::AllSpfRtrs.addr()
    } else {
        nbr.src
    };
    smallvec![addr]
}

// Returns a destination used to send a packet to all adjacent neighbors
// associated with the given interface.
fn send_dest_iface(
    iface: &Interface,
    neighbors: &Arena<Neighbor>,
) -> smallvec::SmallVec<[std::net::Ipv4Addr; 4]> {
    match iface.config.if_type {
        InterfaceType::Broadcast => {
            let addr = if matches!(
                iface.state.ism_state,
                ism::State::Dr | ism::State::Backup
            ) {
                MulticastAddr::AllSpfRtrs
            } else {
                MulticastAddr::AllDrRtrs
            };
            smallvec![addr.addr()]
        }
        InterfaceType::NonBroadcast | InterfaceType::PointToMultipoint => {
            // On non-broadcast networks, separate LS Update and delayed LS
            // Ack packets must be sent, as unicasts, to each adjacent
            // neighbor.
            iface
                .state
                .neighbors
                .iter(neighbors)
                .filter(|nbr| nbr.state >= nsm::State::Exchange)
                .map(|nbr| nbr.src)
                .collect()
        }
        InterfaceType::PointToPoint => {
            smallvec![MulticastAddr::AllSpfRtrs.addr()]
        }
        InterfaceType::VirtualLink => {
            smallvec![iface.state.vlink_remote.unwrap()]
        }
    }
}
