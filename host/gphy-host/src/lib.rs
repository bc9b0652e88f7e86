// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side session for driving a HomePlug-GreenPHY-style powerline modem
//! over raw layer-2 Ethernet.
//!
//! A [`Session`] owns the raw socket, the receive database, and a background
//! receive loop. Request methods encode a typed operation, transmit it, and
//! block until the matching confirmation surfaces in the database (or a
//! wall-clock deadline passes); the modem's asynchronous indications are
//! buffered in their own aged tier and fetched with the `_ind_receive`
//! methods.
//!
//! The receive loop tells the application about completed messages through a
//! caller-supplied callback, invoked once per *last fragment* with the
//! host-facing message id and the originating request id. The callback runs
//! on the receive thread: it must not block, and typically just nudges
//! whatever task scheduling the application uses. Confirmation receivers do
//! not depend on it; they park on an internal condition variable that the
//! loop signals after every push.
//!
//! All receive-side storage is budgeted from a single [`gphy_pool::Pool`]
//! whose size the caller picks at init; see `gphy-rxdb` for how the budget is
//! split.

pub mod legacy;
mod nscm;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use drv_raw_eth::{EthError, RawSocket, Transport};
use gphy_pool::Pool;
use gphy_proto::frame::HostMsgId;
use gphy_proto::{CodecError, MacAddr, Packet, WireMsgId, ETHER_TYPE, HEADER_LEN};
use gphy_rxdb::{RxDb, RxDbError};
use num_traits::FromPrimitive as _;
use zerocopy::{FromZeros as _, IntoBytes as _};

pub use drv_raw_eth::mac_by_interface_name;
pub use gphy_proto::ops;

/// Result codes surfaced to the application.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("bad parameter")]
    BadParameter,
    #[error("not found")]
    NotFound,
    #[error("out of memory")]
    NoMemory,
    #[error("timed out")]
    Timeout,
    #[error("resource in use")]
    ResourceInUse,
    #[error("bad state")]
    BadState,
    #[error("access denied")]
    AccessDenied,
    #[error("transport aborted")]
    HwAbort,
    #[error("general failure")]
    General,
    #[error("not ready yet")]
    NotYet,
}

impl From<EthError> for Error {
    fn from(e: EthError) -> Self {
        match e {
            EthError::Timeout => Error::Timeout,
            EthError::Abort => Error::HwAbort,
            EthError::NotFound => Error::NotFound,
            EthError::NotYet => Error::NotYet,
            EthError::Io(io) => match io.raw_os_error() {
                Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EDEADLK) => {
                    Error::ResourceInUse
                }
                Some(libc::EINVAL) => Error::BadParameter,
                Some(libc::ENOMEM) => Error::NoMemory,
                Some(libc::EPERM) | Some(libc::EACCES) => Error::AccessDenied,
                _ => Error::General,
            },
        }
    }
}

impl From<RxDbError> for Error {
    fn from(e: RxDbError) -> Self {
        match e {
            RxDbError::NotFound => Error::NotFound,
            RxDbError::TooSmall { .. } | RxDbError::NoMemory => Error::NoMemory,
            RxDbError::Full | RxDbError::Thread => Error::General,
        }
    }
}

impl From<CodecError> for Error {
    fn from(_: CodecError) -> Self {
        Error::General
    }
}

/// Library version.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Reports this library's semantic version.
pub fn version() -> Version {
    Version {
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    }
}

/// Called from the receive thread on every completed (last-fragment) message.
/// Must not block; reentry into the session API is allowed.
pub type RxCallback = Box<dyn Fn(HostMsgId, u16) + Send + Sync>;

/// Wakeup channel between the receive loop and confirmation waiters. The
/// counter increments after every successful database push.
struct RxNotify {
    generation: Mutex<u64>,
    cond: Condvar,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RxNotify {
    fn bump(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }
}

pub struct Session {
    transport: Arc<dyn Transport>,
    rx_db: Arc<RxDb>,
    notify: Arc<RxNotify>,
    rx_loop: Option<thread::JoinHandle<()>>,
    pool: Pool,
    pub(crate) nic_mac: MacAddr,
    pub(crate) peer_mac: MacAddr,
}

impl Session {
    /// Opens a session against the modem at `peer_mac` (or broadcast when
    /// `None`) through the NIC owning `nic_mac`, with `arena_size` bytes of
    /// receive-side memory budget.
    pub fn open(
        nic_mac: MacAddr,
        peer_mac: Option<MacAddr>,
        callback: RxCallback,
        arena_size: usize,
    ) -> Result<Self, Error> {
        let socket = RawSocket::connect(&nic_mac, peer_mac.as_ref(), ETHER_TYPE)
            .map_err(|e| {
                log::error!("failed to connect raw transport: {e}");
                Error::from(e)
            })?;
        Self::with_transport(Arc::new(socket), nic_mac, peer_mac, callback, arena_size)
    }

    /// Like [`Session::open`], but over a caller-supplied transport. This is
    /// the constructor device simulators and the test harness use; the
    /// session logic is identical.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        nic_mac: MacAddr,
        peer_mac: Option<MacAddr>,
        callback: RxCallback,
        arena_size: usize,
    ) -> Result<Self, Error> {
        let pool = Pool::new(arena_size);
        let rx_db = Arc::new(RxDb::new(&pool).map_err(|e| {
            log::error!("failed to build rx database: {e}");
            Error::from(e)
        })?);
        let notify = Arc::new(RxNotify {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        });

        let rx_loop = {
            let transport = Arc::clone(&transport);
            let rx_db = Arc::clone(&rx_db);
            let notify = Arc::clone(&notify);
            thread::Builder::new()
                .name("gphy-rx-loop".into())
                .spawn(move || rx_loop(&*transport, &rx_db, &notify, &callback))
                .map_err(|e| {
                    log::error!("failed to spawn rx loop: {e}");
                    Error::General
                })?
        };

        Ok(Self {
            transport,
            rx_db,
            notify,
            rx_loop: Some(rx_loop),
            pool,
            nic_mac,
            peer_mac: peer_mac.unwrap_or(gphy_proto::BROADCAST_MAC),
        })
    }

    pub fn nic_mac(&self) -> &MacAddr {
        &self.nic_mac
    }

    pub fn peer_mac(&self) -> &MacAddr {
        &self.peer_mac
    }

    /// The receive database, exposed for diagnostics (listing pending
    /// frames, capacity queries).
    pub fn rx_db(&self) -> &RxDb {
        &self.rx_db
    }

    /// Transmits an encoded frame.
    pub(crate) fn transmit(&self, packet: &Packet, wire_len: usize) -> Result<(), Error> {
        self.transport
            .send(&packet.as_bytes()[..wire_len])
            .map_err(Error::from)
    }

    /// Waits until a frame matching the single-fragment query can be popped,
    /// or `timeout_ms` of wall-clock time passes.
    pub(crate) fn wait_pop(
        &self,
        msg_id: WireMsgId,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<Packet, Error> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        self.wait_pop_fragment(msg_id, req_id, 0, 0, deadline)
            .map(|(packet, _)| packet)
    }

    /// Fragment-aware variant of [`Session::wait_pop`], against an absolute
    /// deadline so multi-fragment drains share one budget.
    pub(crate) fn wait_pop_fragment(
        &self,
        msg_id: WireMsgId,
        req_id: u16,
        frag_idx: u8,
        fmsn: u8,
        deadline: Instant,
    ) -> Result<(Packet, usize), Error> {
        let mut generation = lock(&self.notify.generation);
        loop {
            // Checked under the generation lock: a push landing after this
            // miss must bump the generation, which needs the lock we hold,
            // so the wakeup cannot slip past us.
            match self
                .rx_db
                .find_and_pop_fragment(msg_id as u16, req_id, frag_idx, fmsn)
            {
                Ok(hit) => return Ok(hit),
                Err(RxDbError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
            let now = Instant::now();
            if now >= deadline {
                log::info!(
                    "timed out waiting for msg id {:#06x}, req id {req_id}",
                    msg_id as u16
                );
                return Err(Error::Timeout);
            }
            let (guard, _) = self
                .notify
                .cond
                .wait_timeout(generation, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            generation = guard;
        }
    }
}

impl Drop for Session {
    /// Teardown: break the receive loop out of its blocking read, join it,
    /// then let the database (and its cleaner) and the pool unwind.
    fn drop(&mut self) {
        self.transport.break_recv();
        if let Some(handle) = self.rx_loop.take() {
            let _ = handle.join();
        }
        log::info!(
            "final pool usage={}, capacity={}",
            self.pool.usage(),
            self.pool.capacity()
        );
    }
}

/// The background receive loop: read, classify, store, and on the last
/// fragment of a message work out its request id and tell the application.
fn rx_loop(
    transport: &dyn Transport,
    rx_db: &RxDb,
    notify: &RxNotify,
    callback: &RxCallback,
) {
    let mut buf = Packet::new_zeroed();
    loop {
        let len = match transport.recv(buf.as_mut_bytes(), -1) {
            Ok(len) => len,
            Err(EthError::Abort) => break,
            Err(e) => {
                log::error!("receive failed, rx loop exiting: {e}");
                break;
            }
        };
        if len < HEADER_LEN {
            // Can't even hold our headers; not control traffic.
            continue;
        }
        if !buf.is_control_path() {
            continue;
        }
        if rx_db.push(&buf, len as u16).is_err() {
            log::error!(
                "failed to push msg id {:#06x} to rx db, db is full",
                buf.msg_id()
            );
            continue;
        }
        notify.bump();

        if buf.frag_idx() + 1 != buf.num_frags() {
            continue;
        }
        let req_id = if buf.num_frags() == 1 {
            buf.req_id()
        } else {
            // The request id lives in the first fragment of the series; this
            // frame is the last one.
            match rx_db.find_req_id_of_series(buf.msg_id(), buf.fmsn()) {
                Ok(req_id) => req_id,
                Err(_) => {
                    log::error!(
                        "no req id for msg id {:#06x}, fmsn {}",
                        buf.msg_id(),
                        buf.fmsn()
                    );
                    continue;
                }
            }
        };
        let Some(wire_id) = WireMsgId::from_u16(buf.msg_id()) else {
            log::error!("no host msg id for msg id {:#06x}", buf.msg_id());
            continue;
        };
        callback(wire_id.host(), req_id);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory transport: frames the session sends are logged for
    /// assertions, and tests inject the frames the session should receive.
    pub struct Loopback {
        rx: Mutex<VecDeque<Vec<u8>>>,
        rx_cond: Condvar,
        sent: Mutex<Vec<Vec<u8>>>,
        broken: AtomicBool,
    }

    impl Loopback {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                rx: Mutex::new(VecDeque::new()),
                rx_cond: Condvar::new(),
                sent: Mutex::new(Vec::new()),
                broken: AtomicBool::new(false),
            })
        }

        /// Queues a frame for the session's receive loop.
        pub fn inject(&self, frame: &[u8]) {
            lock(&self.rx).push_back(frame.to_vec());
            self.rx_cond.notify_all();
        }

        pub fn sent_frames(&self) -> Vec<Vec<u8>> {
            lock(&self.sent).clone()
        }
    }

    impl Transport for Loopback {
        fn send(&self, frame: &[u8]) -> Result<(), EthError> {
            lock(&self.sent).push(frame.to_vec());
            Ok(())
        }

        fn recv(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, EthError> {
            let deadline = Instant::now()
                + Duration::from_millis(if timeout_ms < 0 {
                    // "Forever", far as any test is concerned.
                    60_000
                } else {
                    timeout_ms as u64
                });
            let mut rx = lock(&self.rx);
            loop {
                if self.broken.load(Ordering::SeqCst) {
                    return Err(EthError::Abort);
                }
                if let Some(frame) = rx.pop_front() {
                    let len = frame.len().min(buf.len());
                    buf[..len].copy_from_slice(&frame[..len]);
                    return Ok(len);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(EthError::Timeout);
                }
                let (guard, _) = self
                    .rx_cond
                    .wait_timeout(rx, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                rx = guard;
            }
        }

        fn break_recv(&self) {
            self.broken.store(true, Ordering::SeqCst);
            self.rx_cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::Loopback;
    use super::*;
    use gphy_proto::frame::{build_control, FragInfo};
    use std::sync::mpsc;
    use zerocopy::IntoBytes as _;

    const NIC: MacAddr = [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];
    const DEV: MacAddr = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
    const ARENA: usize = 64 * 1024;

    fn cnf_frame(msg_id: WireMsgId, req_id: u16, frag: FragInfo, payload: &[u8]) -> Vec<u8> {
        let (p, len) =
            build_control(&NIC, &DEV, msg_id as u16, req_id, frag, payload).unwrap();
        p.as_bytes()[..len].to_vec()
    }

    fn open_session(
        loopback: &Arc<Loopback>,
    ) -> (Session, mpsc::Receiver<(HostMsgId, u16)>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx) = mpsc::channel();
        let callback: RxCallback = Box::new(move |id, req| {
            let _ = tx.send((id, req));
        });
        let session = Session::with_transport(
            Arc::clone(loopback) as Arc<dyn Transport>,
            NIC,
            Some(DEV),
            callback,
            ARENA,
        )
        .unwrap();
        (session, rx)
    }

    #[test]
    fn callback_fires_once_per_completed_message() {
        let loopback = Loopback::new();
        let (session, callbacks) = open_session(&loopback);

        loopback.inject(&cnf_frame(
            WireMsgId::GetDeviceStateCnf,
            7,
            FragInfo::SINGLE,
            &[1],
        ));

        let (id, req_id) = callbacks
            .recv_timeout(Duration::from_secs(2))
            .expect("callback did not fire");
        assert_eq!(id, HostMsgId::GetDeviceStateCnf);
        assert_eq!(req_id, 7);
        assert!(callbacks
            .recv_timeout(Duration::from_millis(200))
            .is_err(), "callback fired more than once");

        let state = session.get_device_state_cnf_receive(7, 1_000).unwrap();
        assert_eq!(state, 1);
    }

    #[test]
    fn request_send_puts_the_frame_on_the_wire() {
        let loopback = Loopback::new();
        let (session, _callbacks) = open_session(&loopback);

        session.get_fw_version_req_send(3).unwrap();
        let sent = loopback.sent_frames();
        assert_eq!(sent.len(), 1);
        // EtherType at 12..14, msg id little-endian at 25..27.
        assert_eq!(&sent[0][12..14], &ETHER_TYPE.to_be_bytes());
        assert_eq!(
            u16::from_le_bytes([sent[0][25], sent[0][26]]),
            WireMsgId::GetFwVersionReq as u16
        );
    }

    #[test]
    fn confirmation_receive_parses_and_consumes() {
        let loopback = Loopback::new();
        let (session, _callbacks) = open_session(&loopback);

        let mut payload = [0u8; 28];
        payload[..5].copy_from_slice(b"9.9.9");
        payload[24..].copy_from_slice(&7u32.to_le_bytes());
        loopback.inject(&cnf_frame(
            WireMsgId::GetFwVersionCnf,
            11,
            FragInfo::SINGLE,
            &payload,
        ));

        let version = session.get_fw_version_cnf_receive(11, 1_000).unwrap();
        assert_eq!(&version.version[..5], b"9.9.9");
        assert_eq!(version.svn_rev, 7);
        // Consumed: a second receive times out.
        assert_eq!(
            session.get_fw_version_cnf_receive(11, 50),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn receive_times_out_when_nothing_arrives() {
        let loopback = Loopback::new();
        let (session, _callbacks) = open_session(&loopback);
        let t0 = Instant::now();
        assert_eq!(
            session.get_device_state_cnf_receive(1, 100),
            Err(Error::Timeout)
        );
        assert!(t0.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn amp_map_drains_all_fragments() {
        let loopback = Loopback::new();
        let (session, callbacks) = open_session(&loopback);

        let fmsn = 4;
        let mut first = Vec::new();
        first.extend_from_slice(&6u16.to_le_bytes());
        first.extend_from_slice(&[0x21, 0x43]);
        loopback.inject(&cnf_frame(
            WireMsgId::GetAmpMapCnf,
            5,
            FragInfo {
                frag_idx: 0,
                num_frags: 2,
                fmsn,
            },
            &first,
        ));
        loopback.inject(&cnf_frame(
            WireMsgId::GetAmpMapCnf,
            0, // later fragments don't carry the request id
            FragInfo {
                frag_idx: 1,
                num_frags: 2,
                fmsn,
            },
            &[0x65],
        ));

        // One callback, for the series, with the first fragment's req id.
        let (id, req_id) = callbacks.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(id, HostMsgId::GetAmpMapCnf);
        assert_eq!(req_id, 5);

        let map = session.get_amp_map_cnf_receive(5, 1_000).unwrap();
        assert_eq!(map.num_entries, 6);
        assert_eq!(map.entries, vec![0x21, 0x43, 0x65]);
        assert!(session.rx_db().list_main(8).is_empty());
    }

    #[test]
    fn indications_are_received_from_their_tier() {
        let loopback = Loopback::new();
        let (session, callbacks) = open_session(&loopback);

        loopback.inject(&cnf_frame(
            WireMsgId::DLinkReadyInd,
            0,
            FragInfo::SINGLE,
            &[1],
        ));
        let (id, _) = callbacks.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(id, HostMsgId::DLinkReadyInd);

        let ready = session.d_link_ready_ind_receive(0, 1_000).unwrap();
        assert!(ready.ready);
        assert_eq!(session.rx_db().remaining_indication(), session.rx_db().capacity_indication());
    }

    #[test]
    fn data_path_frames_are_dropped() {
        let loopback = Loopback::new();
        let (session, callbacks) = open_session(&loopback);

        let mut frame = cnf_frame(
            WireMsgId::GetDeviceStateCnf,
            7,
            FragInfo::SINGLE,
            &[1],
        );
        frame[23] |= 0x10; // set the vendor-header path nibble: data plane
        loopback.inject(&frame);

        assert!(callbacks.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(
            session.get_device_state_cnf_receive(7, 50),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn teardown_completes_promptly() {
        let loopback = Loopback::new();
        let (session, _callbacks) = open_session(&loopback);
        let t0 = Instant::now();
        drop(session);
        assert!(t0.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn version_is_the_crate_version() {
        let v = version();
        assert_eq!(
            (v.major, v.minor, v.patch),
            (0, 1, 0),
        );
    }
}
