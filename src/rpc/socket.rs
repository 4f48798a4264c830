//! UDP transport: size-bounded datagram reads into arena buffers, and
//! fire-and-forget message writes.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::messages::Message;
use crate::rpc::statistics::{add, bump, Statistics};
use crate::rpc::Arena;
use crate::{Error, Result};

/// Datagrams larger than this are processed as truncated. Once in a while a
/// bigger one shows up, but meh.
pub const MAX_UDP_PACKET_SIZE: usize = 4096;

const UDP_SOCKET_BUFFER_SIZE: i32 = 2 * 1024 * 1024; // 2MB

const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// The engine's UDP socket. All writes happen on the engine thread; the
/// reader thread works on a cloned handle.
#[derive(Debug)]
pub struct KrpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    stats: Arc<Statistics>,
}

impl KrpcSocket {
    pub fn bind(address: &str, port: u16, stats: Arc<Statistics>) -> Result<KrpcSocket> {
        let ip: std::net::Ipv4Addr = if address.is_empty() {
            std::net::Ipv4Addr::UNSPECIFIED
        } else {
            address
                .parse()
                .map_err(|_| Error::AddressResolution(address.to_string()))?
        };
        let socket = UdpSocket::bind(SocketAddrV4::new(ip, port))?;

        // The default OS buffers (~128KB) are often too small for DHT
        // traffic at scale; enlarge both directions.
        set_socket_buffers(&socket, UDP_SOCKET_BUFFER_SIZE)?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("KrpcSocket does not support IPv6"),
        };

        Ok(KrpcSocket {
            socket,
            local_addr,
            stats,
        })
    }

    // === Getters ===

    /// The address the socket is bound to, with the actual port when the
    /// configured one was 0.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// A raw handle for the reader thread.
    pub fn reader_socket(&self) -> Result<UdpSocket> {
        let socket = self.socket.try_clone()?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(socket)
    }

    /// Encode and send a message. Failures are logged and counted, never
    /// propagated; retries are implicit in the DHT's iterative lookups.
    pub fn send_message(&self, address: SocketAddrV4, message: &Message) {
        trace!(context = "socket_message_sending", ?address, ?message);
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(?e, "error encoding outgoing message");
                return;
            }
        };
        match self.socket.send_to(&bytes, address) {
            Ok(written) => {
                bump(&self.stats.total_sent);
                add(&self.stats.total_written_bytes, written as u64);
            }
            Err(e) => {
                debug!(?e, ?address, "node write failed");
            }
        }
    }
}

/// Read datagrams into arena buffers and hand them to the engine. Exits when
/// the shutdown flag is raised or the engine hangs up the packet channel.
pub fn spawn_reader(
    socket: UdpSocket,
    arena: Arena,
    packets: flume::Sender<(Vec<u8>, SocketAddrV4)>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Statistics>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        if shutdown.load(Relaxed) || packets.is_disconnected() {
            return;
        }
        let mut buffer = arena.pop();
        match socket.recv_from(&mut buffer) {
            Ok((read, SocketAddr::V4(from))) => {
                if read == MAX_UDP_PACKET_SIZE {
                    debug!(
                        read,
                        "received packet at the size limit, some data may have been discarded"
                    );
                }
                add(&stats.total_read_bytes, read as u64);
                buffer.truncate(read);
                if read == 0 || from.port() == 0 {
                    arena.push(buffer);
                    continue;
                }
                if packets.send((buffer, from)).is_err() {
                    return;
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(context = "socket_validation", "received IPv6 packet");
                arena.push(buffer);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                arena.push(buffer);
            }
            Err(e) => {
                debug!(?e, "socket read error");
                arena.push(buffer);
            }
        }
    })
}

#[cfg(unix)]
fn set_socket_buffers(socket: &UdpSocket, size: i32) -> std::io::Result<()> {
    use libc::{setsockopt, SOL_SOCKET, SO_RCVBUF, SO_SNDBUF};
    use std::io::Error;
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();

    for option in [SO_RCVBUF, SO_SNDBUF] {
        // The OS may clamp the size depending on sysctl limits.
        let result = unsafe {
            setsockopt(
                fd,
                SOL_SOCKET,
                option,
                &size as *const _ as *const _,
                std::mem::size_of_val(&size) as u32,
            )
        };
        if result != 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_socket_buffers(_socket: &UdpSocket, _size: i32) -> std::io::Result<()> {
    Ok(())
}
