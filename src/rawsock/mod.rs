//! Raw socket I/O.
//!
//! Sends and receives IPv4 packets whose headers the tunnel builds itself.
//! The kernel would answer unsolicited segments on the impersonated flow
//! with RSTs, so it is never given a connected socket; packets enter and
//! leave through a raw socket with `IP_HDRINCL` set.

mod packet;

pub use packet::{
    build_ipv4_header, build_packet, build_tcp_header, checksum, parse_packet, tcp_checksum,
    tcp_flags, verify_ipv4_checksum, verify_tcp_checksum, TcpDatagram, IPV4_HEADER_LEN,
    TCP_HEADER_LEN, TCP_WINDOW,
};

use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

use crate::error::{Error, Result};

/// Largest raw frame we accept.
pub const MAX_DATAGRAM: usize = 65535;

/// Kernel socket buffer target for each direction.
///
/// FEC emits whole blocks back to back, so both directions need room for
/// bursts; failure to grow the buffers is non-fatal.
pub const SOCKET_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// A raw IPv4 socket restricted to TCP-shaped traffic.
pub struct RawSocket {
    io: AsyncFd<Socket>,
    local_addr: SocketAddrV4,
}

impl RawSocket {
    /// Open a raw socket.
    ///
    /// Servers pass `bind = true` to receive on their configured address.
    /// Fails with [`Error::Privilege`] when raw sockets are unavailable or
    /// `IP_HDRINCL` cannot be set.
    pub fn open(local_addr: SocketAddrV4, bind: bool) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::privilege("raw socket requires root or CAP_NET_RAW")
            } else {
                Error::Io(e)
            }
        })?;

        set_header_included(&socket)
            .map_err(|e| Error::privilege(format!("cannot set IP_HDRINCL: {}", e)))?;

        socket.set_nonblocking(true)?;

        if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES) {
            tracing::debug!(error = %e, "could not grow receive buffer");
        }
        if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_BYTES) {
            tracing::debug!(error = %e, "could not grow send buffer");
        }

        if bind {
            socket.bind(&SockAddr::from(local_addr))?;
        }

        Ok(Self {
            io: AsyncFd::new(socket)?,
            local_addr,
        })
    }

    /// Build and send one TCP-shaped packet.
    #[allow(clippy::too_many_arguments)]
    pub async fn send(
        &self,
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        options: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        let frame = packet::build_packet(src, sport, dst, dport, seq, ack, flags, options, payload);
        self.send_frame(dst, &frame).await
    }

    /// Send a pre-built IPv4 frame.
    pub async fn send_frame(&self, dst: Ipv4Addr, frame: &[u8]) -> Result<()> {
        // Port 0: for raw sockets the kernel only routes on the address.
        let addr = SockAddr::from(SocketAddrV4::new(dst, 0));
        loop {
            let mut guard = self.io.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(frame, &addr)) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive and parse one TCP datagram.
    ///
    /// Non-TCP or truncated frames surface as [`Error::Parse`]; the caller
    /// discards and counts them.
    pub async fn recv(&self) -> Result<TcpDatagram> {
        let mut buf = vec![MaybeUninit::<u8>::uninit(); MAX_DATAGRAM];
        loop {
            let mut guard = self.io.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
                Ok(Ok(n)) => {
                    // SAFETY: recv initialized the first n bytes.
                    let filled =
                        unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
                    return packet::parse_packet(filled);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// The configured local address.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
}

fn set_header_included(socket: &Socket) -> std::io::Result<()> {
    let enable: libc::c_int = 1;
    // SAFETY: plain setsockopt on an owned, open fd with a c_int payload.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of_val(&enable) as libc::socklen_t,
        )
    };
    if rc != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}
