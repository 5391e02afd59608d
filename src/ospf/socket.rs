//! The raw IP-protocol-89 socket: multicast join on AllSPFRouters,
//! TTL 1, non-blocking under the tokio reactor.

use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;

use super::{ALL_SPF_ROUTERS, OSPF_IP_PROTO};

pub struct OspfSocket {
    inner: AsyncFd<Socket>,
}

impl OspfSocket {
    /// Open the raw socket bound to one interface and join AllSPFRouters
    /// on it.
    pub fn bind(ifname: &str, ifaddr: Ipv4Addr) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(i32::from(OSPF_IP_PROTO))),
        )?;
        socket.set_nonblocking(true)?;
        socket.bind_device(Some(ifname.as_bytes()))?;
        socket.set_multicast_loop_v4(false)?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_ttl(1)?;
        socket.set_tos(libc::IPTOS_PREC_INTERNETCONTROL as u32)?;
        socket.join_multicast_v4(&ALL_SPF_ROUTERS, &ifaddr)?;
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    /// Receive one IP datagram; returns the OSPF payload (IP header
    /// stripped) and the source address.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        loop {
            let mut guard = self.inner.readable().await?;
            let mut uninit = [MaybeUninit::<u8>::uninit(); 2048];
            match guard.try_io(|inner| inner.get_ref().recv_from(&mut uninit)) {
                Ok(Ok((len, addr))) => {
                    // Raw IPv4 sockets deliver the IP header; skip it
                    let datagram =
                        unsafe { std::slice::from_raw_parts(uninit.as_ptr() as *const u8, len) };
                    if datagram.is_empty() {
                        continue;
                    }
                    let header_len = usize::from(datagram[0] & 0x0f) * 4;
                    if header_len == 0 || len <= header_len {
                        continue;
                    }
                    let payload = &datagram[header_len..len];
                    let copy_len = payload.len().min(buf.len());
                    buf[..copy_len].copy_from_slice(&payload[..copy_len]);
                    let src = addr
                        .as_socket_ipv4()
                        .map(|sa| *sa.ip())
                        .unwrap_or(Ipv4Addr::UNSPECIFIED);
                    return Ok((copy_len, src));
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }

    /// Send an OSPF packet to `dst` (usually AllSPFRouters or a
    /// neighbor's interface address).
    pub async fn send_to(&self, payload: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let addr = SocketAddr::V4(SocketAddrV4::new(dst, 0));
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(payload, &addr.into())) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}
