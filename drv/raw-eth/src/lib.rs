// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw layer-2 Ethernet transport for talking to the modem.
//!
//! The modem speaks its management protocol directly over Ethernet frames
//! with a vendor EtherType, so the host side needs an `AF_PACKET`/`SOCK_RAW`
//! socket bound to the NIC that faces it. This crate wraps that socket plus
//! the one piece of machinery a blocking receive loop cannot live without: a
//! self-pipe that lets another thread break the receiver out of its `select`
//! at teardown.
//!
//! The [`Transport`] trait is the seam the session core is written against.
//! [`RawSocket`] is the real implementation; tests and device simulators
//! provide in-memory ones.
//!
//! Concurrency contract: exactly one thread calls `recv`; any number of
//! threads may call `send` (the kernel serializes `sendto` on a single
//! socket); `break_recv` may be called from anywhere.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// A MAC address in wire order. Kept local so this crate stands alone.
pub type MacAddr = [u8; 6];

pub const BROADCAST_MAC: MacAddr = [0xff; 6];

/// Longest frame we will put on the wire.
pub const MAX_ETH_SIZE: usize = 1514;

/// Shortest frame the wire will carry; shorter sends are zero-padded up.
pub const MIN_ETH_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum EthError {
    /// `recv` ran out its timeout with no acceptable frame.
    #[error("receive timed out")]
    Timeout,
    /// `break_recv` was fired while a `recv` was in flight.
    #[error("receive aborted")]
    Abort,
    /// No interface carries the requested MAC address.
    #[error("no matching network interface")]
    NotFound,
    /// The interface exists but is not up and running yet.
    #[error("network interface is not running")]
    NotYet,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// What the session core needs from a frame pipe.
pub trait Transport: Send + Sync {
    /// Queues one frame, non-blocking. Oversize frames are truncated to
    /// [`MAX_ETH_SIZE`] and short ones padded to [`MIN_ETH_SIZE`].
    fn send(&self, frame: &[u8]) -> Result<(), EthError>;

    /// Blocks up to `timeout_ms` for a frame addressed to us (negative means
    /// forever), filling `buf` and returning the frame length.
    fn recv(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, EthError>;

    /// Wakes any in-flight `recv` with [`EthError::Abort`]. Sticky: later
    /// `recv` calls abort too, which is exactly what teardown wants.
    fn break_recv(&self);
}

/// The destination filter applied to every received frame: ours or broadcast,
/// and on a unicast connection the source must be the peer.
fn frame_acceptable(frame: &[u8], host: &MacAddr, peer: &MacAddr) -> bool {
    let Some(dst) = frame.get(..6) else {
        return false;
    };
    if dst != host && dst != BROADCAST_MAC {
        return false;
    }
    if *peer == BROADCAST_MAC {
        // Broadcast connection: any sender with our EtherType passes.
        return true;
    }
    frame.get(6..12).is_some_and(|src| src == peer)
}

/// An `AF_PACKET` socket bound to one NIC and one EtherType, with its
/// break-out self-pipe.
pub struct RawSocket {
    fd: OwnedFd,
    pipe_rd: OwnedFd,
    pipe_wr: OwnedFd,
    host: MacAddr,
    peer: MacAddr,
}

/// Looks through the system's interfaces for the one with `mac`, returning
/// its index.
fn ifindex_by_mac(mac: &MacAddr) -> Result<i32, EthError> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| EthError::Io(io::Error::from_raw_os_error(e as i32)))?;
    for ifa in addrs {
        let Some(link) = ifa.address.as_ref().and_then(|a| a.as_link_addr()) else {
            continue;
        };
        if link.addr() == Some(*mac) {
            return Ok(link.ifindex() as i32);
        }
    }
    log::error!("no interface with MAC {mac:02x?}");
    Err(EthError::NotFound)
}

/// Resolves an interface name to its MAC address.
///
/// Fails with [`EthError::NotYet`] when the interface exists but is not
/// RUNNING; callers typically retry while the modem's link comes up.
pub fn mac_by_interface_name(name: &str) -> Result<MacAddr, EthError> {
    use nix::net::if_::InterfaceFlags;

    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| EthError::Io(io::Error::from_raw_os_error(e as i32)))?;
    for ifa in addrs {
        if ifa.interface_name != name {
            continue;
        }
        let Some(link) = ifa.address.as_ref().and_then(|a| a.as_link_addr()) else {
            continue;
        };
        let Some(mac) = link.addr() else {
            continue;
        };
        if !ifa.flags.contains(InterfaceFlags::IFF_RUNNING) {
            log::error!("interface {name} is not running");
            return Err(EthError::NotYet);
        }
        return Ok(mac);
    }
    Err(EthError::NotFound)
}

impl RawSocket {
    /// Opens a raw socket for `ethertype` on the NIC with MAC `nic_mac` and
    /// remembers `peer` as the far end; `None` means a broadcast connection
    /// that accepts frames from any station.
    pub fn connect(
        nic_mac: &MacAddr,
        peer: Option<&MacAddr>,
        ethertype: u16,
    ) -> Result<Self, EthError> {
        let ifindex = ifindex_by_mac(nic_mac)?;

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                i32::from(ethertype.to_be()),
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            log::error!("failed to open raw socket: {err}");
            return Err(err.into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = ethertype.to_be();
        sll.sll_ifindex = ifindex;
        sll.sll_halen = 6;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            log::error!("failed to bind raw socket to ifindex {ifindex}: {err}");
            return Err(err.into());
        }

        let mut pipefd = [0; 2];
        if unsafe { libc::pipe(pipefd.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let (pipe_rd, pipe_wr) = unsafe {
            (
                OwnedFd::from_raw_fd(pipefd[0]),
                OwnedFd::from_raw_fd(pipefd[1]),
            )
        };

        Ok(Self {
            fd,
            pipe_rd,
            pipe_wr,
            host: *nic_mac,
            peer: peer.copied().unwrap_or(BROADCAST_MAC),
        })
    }
}

impl Transport for RawSocket {
    fn send(&self, frame: &[u8]) -> Result<(), EthError> {
        let mut padded = [0u8; MIN_ETH_SIZE];
        let (ptr, len) = if frame.len() < MIN_ETH_SIZE {
            padded[..frame.len()].copy_from_slice(frame);
            (padded.as_ptr(), MIN_ETH_SIZE)
        } else {
            (frame.as_ptr(), frame.len().min(MAX_ETH_SIZE))
        };

        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                ptr as *const libc::c_void,
                len,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                std::ptr::null(),
                0,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            log::error!("sendto failed: {err}");
            return Err(err.into());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, EthError> {
        let sock = self.fd.as_raw_fd();
        let pipe = self.pipe_rd.as_raw_fd();
        let max_fd = sock.max(pipe);

        // On Linux, select updates the timeval with the time not slept, so
        // one timeval carries the remaining budget across skipped frames.
        let mut tv = libc::timeval {
            tv_sec: libc::time_t::from(timeout_ms.max(0) / 1000),
            tv_usec: libc::suseconds_t::from((timeout_ms.max(0) % 1000) * 1000),
        };

        loop {
            let mut rdfds: libc::fd_set = unsafe { std::mem::zeroed() };
            unsafe {
                libc::FD_ZERO(&mut rdfds);
                libc::FD_SET(sock, &mut rdfds);
                libc::FD_SET(pipe, &mut rdfds);
            }
            let tv_ptr = if timeout_ms >= 0 {
                &mut tv as *mut libc::timeval
            } else {
                std::ptr::null_mut()
            };
            let rc = unsafe {
                libc::select(
                    max_fd + 1,
                    &mut rdfds,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    tv_ptr,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    // Harmless: happens when the NIC bounces while the modem
                    // resets. Go around again.
                    continue;
                }
                log::error!("select failed in recv: {err}");
                return Err(err.into());
            }
            if rc == 0 {
                log::info!("timeout in recv");
                return Err(EthError::Timeout);
            }
            if unsafe { libc::FD_ISSET(pipe, &rdfds) } {
                return Err(EthError::Abort);
            }

            let rc = unsafe {
                libc::recvfrom(
                    sock,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                log::error!("recvfrom failed: {err}");
                return Err(err.into());
            }
            let len = rc as usize;
            if frame_acceptable(&buf[..len], &self.host, &self.peer) {
                return Ok(len);
            }
            // Not for us; keep listening on the remaining budget.
        }
    }

    fn break_recv(&self) {
        let rc = unsafe {
            libc::write(
                self.pipe_wr.as_raw_fd(),
                b"1".as_ptr() as *const libc::c_void,
                1,
            )
        };
        if rc != 1 {
            log::error!("failed to signal receive break: {}", io::Error::last_os_error());
        }
    }
}
