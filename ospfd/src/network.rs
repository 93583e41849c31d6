use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use bytes::{Buf, Bytes};
use ospfd_utils::socket::{AsyncFd, Socket};
use serde::{Deserialize, Serialize};

use crate::collections::{AreaId, InterfaceId};
use crate::error::IoError;
use crate::packet::Packet;
use crate::packet::auth::{AuthDecodeCtx, AuthMethod};
use crate::packet::error::{DecodeError, DecodeResult};
use crate::tasks::messages::input::NetRxPacketMsg;
use crate::tasks::messages::output::NetTxPacketMsg;

// OSPF IP protocol number.
pub const OSPF_IP_PROTO: i32 = 89;

// OSPFv2 multicast addresses.
pub const ALL_SPF_RTRS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 5);
pub const ALL_DR_RTRS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 6);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MulticastAddr {
    AllSpfRtrs,
    AllDrRtrs,
}

// ===== impl MulticastAddr =====

impl MulticastAddr {
    pub(crate) fn addr(&self) -> Ipv4Addr {
        match self {
            MulticastAddr::AllSpfRtrs => ALL_SPF_RTRS,
            MulticastAddr::AllDrRtrs => ALL_DR_RTRS,
        }
    }
}

// ===== global functions =====

// Creates the raw OSPF socket bound to the given interface.
pub(crate) fn socket(ifname: &str) -> Result<Socket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        use nix::sys::socket::{self, sockopt};
        use socket2::{Domain, Protocol, Type};

        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(OSPF_IP_PROTO)),
        )?;

        socket.set_nonblocking(true)?;
        socket.bind_device(Some(ifname.as_bytes()))?;
        socket.set_multicast_loop_v4(false)?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_tos_v4(libc::IPTOS_PREC_INTERNETCONTROL as u32)?;
        socket::setsockopt(&socket, sockopt::Ipv4PacketInfo, &true)?;

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(Socket())
    }
}

// Joins the given OSPF multicast group.
pub(crate) fn join_multicast(
    socket: &Socket,
    addr: MulticastAddr,
    ifindex: u32,
) -> Result<(), std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        use socket2::InterfaceIndexOrAddress;

        let socket = socket2::SockRef::from(socket);
        socket.join_multicast_v4_n(
            &addr.addr(),
            &InterfaceIndexOrAddress::Index(ifindex),
        )
    }
    #[cfg(feature = "testing")]
    {
        Ok(())
    }
}

// Leaves the given OSPF multicast group.
pub(crate) fn leave_multicast(
    socket: &Socket,
    addr: MulticastAddr,
    ifindex: u32,
) -> Result<(), std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        use socket2::InterfaceIndexOrAddress;

        let socket = socket2::SockRef::from(socket);
        socket.leave_multicast_v4_n(
            &addr.addr(),
            &InterfaceIndexOrAddress::Index(ifindex),
        )
    }
    #[cfg(feature = "testing")]
    {
        Ok(())
    }
}

// Validates the IP header of a received packet and moves past it.
pub(crate) fn validate_ip_hdr(buf: &mut Bytes) -> DecodeResult<()> {
    let buf_len = buf.len() as u16;

    // Parse IHL (header length).
    let hdr_len = buf.try_get_u8()? & 0x0F;

    // Ignore TOS.
    let _ = buf.try_get_u8()?;

    // Parse and validate the IP header total length.
    let total_len = buf.try_get_u16()?;
    if buf_len != total_len {
        return Err(DecodeError::InvalidIpHdrLength(total_len));
    }

    // Move past the IP header.
    let hdr_len = (hdr_len as usize) << 2;
    if hdr_len < 20 || buf.remaining() < hdr_len - 4 {
        return Err(DecodeError::InvalidIpHdrLength(total_len));
    }
    buf.advance(hdr_len - 4);

    Ok(())
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn send_packet(
    socket: &AsyncFd<Socket>,
    ifindex: u32,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    packet: &Packet,
    auth: Option<&crate::packet::auth::AuthEncodeCtx<'_>>,
) -> Result<usize, IoError> {
    use std::io::IoSlice;
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{self, SockaddrIn};

    use crate::debug::Debug;

    // Log packet being sent.
    Debug::PacketTx(ifindex, &dst, packet).log();

    // Encode packet.
    let buf = packet.encode(auth);

    // Send packet.
    let iov = [IoSlice::new(&buf)];
    let sockaddr: SockaddrIn = std::net::SocketAddrV4::new(dst, 0).into();
    let pktinfo = libc::in_pktinfo {
        ipi_ifindex: ifindex as i32,
        ipi_spec_dst: libc::in_addr { s_addr: 0 },
        ipi_addr: libc::in_addr { s_addr: src.into() },
    };
    let cmsg = [socket::ControlMessage::Ipv4PacketInfo(&pktinfo)];
    socket
        .async_io(tokio::io::Interest::WRITABLE, |socket| {
            socket::sendmsg(
                socket.as_raw_fd(),
                &iov,
                &cmsg,
                socket::MsgFlags::empty(),
                Some(&sockaddr),
            )
            .map_err(|errno| errno.into())
        })
        .await
        .map_err(IoError::SendError)
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn write_loop(
    socket: Arc<AsyncFd<Socket>>,
    ifindex: u32,
    src: Ipv4Addr,
    auth: Option<AuthMethod>,
    auth_seqno: Arc<AtomicU64>,
    mut net_tx_packetc: ospfd_utils::UnboundedReceiver<NetTxPacketMsg>,
) {
    use crate::error::Error;

    while let Some(NetTxPacketMsg { packet, dst }) = net_tx_packetc.recv().await
    {
        // Prepare authentication context.
        let auth = match &auth {
            Some(auth) => match auth.encode_ctx(&auth_seqno) {
                Some(auth) => Some(auth),
                None => {
                    Error::PacketAuthMissingKey.log();
                    continue;
                }
            },
            None => None,
        };

        // Send packet to all requested destinations.
        for dst in dst {
            if let Err(error) =
                send_packet(&socket, ifindex, src, dst, &packet, auth.as_ref())
                    .await
            {
                error.log();
            }
        }
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn read_loop(
    socket: Arc<AsyncFd<Socket>>,
    area_id: AreaId,
    iface_id: InterfaceId,
    auth: Option<AuthMethod>,
    net_packet_rxp: ospfd_utils::Sender<NetRxPacketMsg>,
) -> Result<(), tokio::sync::mpsc::error::SendError<NetRxPacketMsg>> {
    use std::io::IoSliceMut;
    use std::ops::Deref;
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{self, SockaddrIn};

    let mut buf = [0; 16384];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsgspace = nix::cmsg_space!(libc::in_pktinfo);

    loop {
        // Receive data packet.
        match socket
            .async_io(tokio::io::Interest::READABLE, |socket| {
                match socket::recvmsg::<SockaddrIn>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    socket::MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        // Retrieve source and destination addresses.
                        let src = msg
                            .address
                            .as_ref()
                            .map(|addr| Ipv4Addr::from(addr.ip()));
                        let dst = msg.cmsgs().unwrap().find_map(|cmsg| {
                            if let socket::ControlMessageOwned::Ipv4PacketInfo(
                                pktinfo,
                            ) = cmsg
                            {
                                let dst = Ipv4Addr::from(
                                    pktinfo.ipi_spec_dst.s_addr.to_be(),
                                );
                                Some(dst)
                            } else {
                                None
                            }
                        });
                        Ok((src, dst, msg.bytes))
                    }
                    Err(errno) => Err(errno.into()),
                }
            })
            .await
        {
            Ok((src, dst, bytes)) => {
                let src = match src {
                    Some(addr) => addr,
                    None => {
                        IoError::RecvMissingSourceAddr.log();
                        return Ok(());
                    }
                };
                let dst = match dst {
                    Some(addr) => addr,
                    None => {
                        IoError::RecvMissingAncillaryData.log();
                        return Ok(());
                    }
                };

                // Decode packet.
                let mut buf = Bytes::copy_from_slice(&iov[0].deref()[0..bytes]);
                let packet = validate_ip_hdr(&mut buf).and_then(|_| {
                    let auth = auth.as_ref().map(AuthDecodeCtx::new);
                    Packet::decode(&mut buf, auth)
                });
                let msg = NetRxPacketMsg {
                    area_key: area_id.into(),
                    iface_key: iface_id.into(),
                    src,
                    dst,
                    packet,
                };
                net_packet_rxp.send(msg).await?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                // Retry if the syscall was interrupted (EINTR).
                continue;
            }
            Err(error) => {
                IoError::RecvError(error).log();
            }
        }
    }
}
