// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware-loader command family, spoken to the modem's bootloader.
//!
//! This is an older, simpler protocol than the management plane: its own
//! EtherType, strictly synchronous request/response correlated by
//! `(msg_id, session_id)`, no fragmentation, no receive database. Each
//! command transmits and then sits on the socket until the matching response
//! arrives or the clock runs out. It exists to push a firmware image into a
//! device that has nothing but its boot ROM running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use drv_raw_eth::{EthError, RawSocket, Transport};
use gphy_proto::frame::{EtherHeader, MgmtHeader, SpiHeader};
use gphy_proto::MacAddr;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros as _, Immutable, IntoBytes, KnownLayout};

use crate::Error;

/// EtherType of the bootloader protocol.
pub const LEGACY_ETHER_TYPE: u16 = 0x1200;

/// Default response deadline.
pub const TIMEOUT_MSEC: u32 = 1000;

/// Largest data payload a single loader frame carries.
pub const BUFFER_PAYLOAD_LIMIT: usize = 1460 - 8;

const LEGACY_MSG_PRIORITY: u8 = 4;

/// The boot ROM answers from this address before the device has a real MAC.
const BOOTLOADER_MAC: MacAddr = [0x00, 0xc5, 0xd9, 0x51, 0x00, 0x00];

/// Loader command ids.
const VSM_MSG_SET_MEM: u16 = 1;
const VSM_MSG_QUERY_DEVICE: u16 = 3;
const VSM_MSG_SET_IMAGE_HEADER: u16 = 14;
const VSM_MSG_EXECUTE_CMD: u16 = 16;
const VSM_MSG_SET_IMAGE_DATA: u16 = 19;
const VSM_MSG_INIT_COPY: u16 = 31;
const VSM_MSG_DECOMPRESS: u16 = 32;

/// Status byte in a loader response.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
enum LegacyStatus {
    NoError = 0,
    RetvalFail = 1,
    InvalidReq = 2,
    MemError = 3,
    InvalidMode = 4,
    InternalError = 5,
    RspMaxLenExceeded = 6,
    /// The device saw a retransmission; the exchange still succeeded.
    RetransmissionFlag = 7,
    SpDmNotCapable = 20,
    MapVsmBufIsLocked = 21,
    MsgLengthIsInvalid = 22,
    MapChecksumErr = 23,
    MapMngrBufIsNotReady = 24,
    MapVsmBufIsInvalid = 25,
}

const LEGACY_HEADER_LEN: usize = 28;
const LEGACY_PAYLOAD_CAP: usize = 1514 - LEGACY_HEADER_LEN;

/// One loader frame: L2 + SPI + management header, no vendor header.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Copy, Clone)]
#[repr(C, packed)]
struct LegacyPacket {
    eth: EtherHeader,
    pad: [u8; 2],
    spi: SpiHeader,
    mgmt: MgmtHeader,
    payload: [u8; LEGACY_PAYLOAD_CAP],
}

const_assert_eq!(core::mem::size_of::<LegacyPacket>(), 1514);

impl LegacyPacket {
    fn msg_id(&self) -> u16 {
        u16::from_le(self.mgmt.msg_id)
    }

    fn session_id(&self) -> u16 {
        u16::from_le(self.mgmt.session_id)
    }

    fn mgmt_len(&self) -> usize {
        u16::from_le(self.mgmt.length) as usize
    }
}

/// Device description returned by `query_device`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueryDevice {
    pub mac: MacAddr,
    pub device_state: u8,
    pub new_vsm_format: bool,
    pub option_flags: u32,
    pub svn_rev: u32,
    /// NUL-padded strings, straight off the wire.
    pub sw_version: [u8; 32],
    pub build_date: [u8; 16],
    pub build_time: [u8; 16],
}

const QUERY_DEVICE_LEN: usize = 80;

/// Image header sent ahead of the image data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageHeader {
    pub version: [u8; 24],
    pub cpu_id: u32,
    pub num_sections: u32,
    pub total_image_size: u32,
    pub checksum: u32,
}

/// A synchronous bootloader session. Commands take `&mut self` because every
/// exchange consumes one session id.
pub struct LegacySession {
    transport: Arc<dyn Transport>,
    nic_mac: MacAddr,
    peer_mac: MacAddr,
    session_id: u16,
}

impl LegacySession {
    /// Opens a loader session on the bootloader EtherType.
    pub fn open(nic_mac: MacAddr, peer_mac: Option<MacAddr>) -> Result<Self, Error> {
        let socket = RawSocket::connect(&nic_mac, peer_mac.as_ref(), LEGACY_ETHER_TYPE)
            .map_err(|e| {
                log::error!("failed to connect loader transport: {e}");
                Error::from(e)
            })?;
        Ok(Self::with_transport(Arc::new(socket), nic_mac, peer_mac))
    }

    /// Loader session over a caller-supplied transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        nic_mac: MacAddr,
        peer_mac: Option<MacAddr>,
    ) -> Self {
        Self {
            transport,
            nic_mac,
            peer_mac: peer_mac.unwrap_or(drv_raw_eth::BROADCAST_MAC),
            session_id: 0,
        }
    }

    fn build(&self, msg_id: u16, payload: &[u8]) -> (LegacyPacket, usize) {
        let mut p = LegacyPacket::new_zeroed();
        p.eth = EtherHeader {
            dst: self.peer_mac,
            src: self.nic_mac,
            ethertype: LEGACY_ETHER_TYPE.to_be(),
        };
        p.spi = SpiHeader {
            did: 0,
            sid: 0,
            priority: LEGACY_MSG_PRIORITY,
            pad: 0,
        };
        p.mgmt = MgmtHeader {
            flags: 0,
            msg_id: msg_id.to_le(),
            session_id: 0,
            length: (payload.len() as u16).to_le(),
            status: 0,
        };
        p.payload[..payload.len()].copy_from_slice(payload);
        (p, LEGACY_HEADER_LEN + payload.len())
    }

    /// Does a response's source pass the loader acceptance filter? On a
    /// broadcast connection anything goes; otherwise the peer or the boot
    /// ROM's fixed address.
    fn source_acceptable(&self, src: &[u8]) -> bool {
        self.peer_mac == drv_raw_eth::BROADCAST_MAC
            || src == self.peer_mac
            || src == BOOTLOADER_MAC
    }

    /// Transmits `tx` and waits for the response correlated by
    /// `(msg_id, session_id)`. On success the session id is consumed.
    fn exchange(
        &mut self,
        mut tx: LegacyPacket,
        tx_len: usize,
        timeout_ms: u32,
    ) -> Result<LegacyPacket, Error> {
        tx.mgmt.session_id = self.session_id.to_le();
        self.transport
            .send(&tx.as_bytes()[..tx_len])
            .map_err(Error::from)?;

        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        let mut rx = LegacyPacket::new_zeroed();
        loop {
            let now = Instant::now();
            if now >= deadline {
                log::info!("timed out waiting for loader response");
                return Err(Error::Timeout);
            }
            let remaining = (deadline - now).as_millis().max(1) as i32;
            let len = match self.transport.recv(rx.as_mut_bytes(), remaining) {
                Ok(len) => len,
                Err(EthError::Timeout) => continue,
                Err(e) => return Err(e.into()),
            };
            if len < LEGACY_HEADER_LEN {
                continue;
            }
            if u16::from_be(rx.eth.ethertype) != LEGACY_ETHER_TYPE {
                continue;
            }
            if rx.msg_id() != tx.msg_id() {
                log::error!(
                    "loader response has wrong msg id: sent {}, got {}",
                    tx.msg_id(),
                    rx.msg_id()
                );
                continue;
            }
            if rx.session_id() != self.session_id {
                log::error!(
                    "loader response has wrong session id: sent {}, got {}",
                    self.session_id,
                    rx.session_id()
                );
                continue;
            }
            if !self.source_acceptable(&rx.eth.src) {
                continue;
            }

            match LegacyStatus::from_u8(rx.mgmt.status) {
                Some(LegacyStatus::NoError) => {}
                Some(LegacyStatus::RetransmissionFlag) => {
                    // Success with notice; the device already handled the
                    // original frame.
                    log::info!("loader response carries the retransmission flag");
                }
                Some(LegacyStatus::InternalError) => {
                    log::error!("loader response status: internal error");
                    return Err(Error::BadState);
                }
                Some(LegacyStatus::MapVsmBufIsLocked) => {
                    log::error!("loader response status: VSM buffer locked");
                    return Err(Error::ResourceInUse);
                }
                other => {
                    log::error!("loader response status {:?}", other);
                    return Err(Error::General);
                }
            }

            self.session_id = self.session_id.wrapping_add(1);
            return Ok(rx);
        }
    }

    /// Writes `data` to the device's memory at `address`, in frame-sized
    /// blocks. With `timeout_ms == 0` no replies are expected (the caller is
    /// streaming and will verify later); otherwise each block waits for its
    /// confirmation.
    pub fn write_to_mem(
        &mut self,
        address: u32,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<(), Error> {
        let mut offset = 0usize;
        loop {
            let block = &data[offset..(offset + BUFFER_PAYLOAD_LIMIT).min(data.len())];
            let mut payload = Vec::with_capacity(8 + block.len());
            payload.extend_from_slice(&(address + offset as u32).to_le_bytes());
            payload.extend_from_slice(&(block.len() as u32).to_le_bytes());
            payload.extend_from_slice(block);
            let (tx, tx_len) = self.build(VSM_MSG_SET_MEM, &payload);

            if timeout_ms != 0 {
                self.exchange(tx, tx_len, timeout_ms)?;
            } else {
                self.transport
                    .send(&tx.as_bytes()[..tx_len])
                    .map_err(Error::from)?;
            }

            offset += block.len();
            if offset >= data.len() {
                return Ok(());
            }
        }
    }

    /// Asks the boot ROM who it is.
    pub fn query_device(&mut self, timeout_ms: u32) -> Result<QueryDevice, Error> {
        let (tx, tx_len) = self.build(VSM_MSG_QUERY_DEVICE, &[]);
        let rx = self.exchange(tx, tx_len, timeout_ms)?;
        if rx.mgmt_len() != QUERY_DEVICE_LEN {
            log::error!(
                "query device: payload is {} bytes, expected {}",
                rx.mgmt_len(),
                QUERY_DEVICE_LEN
            );
            return Err(Error::General);
        }
        let p = &rx.payload[..QUERY_DEVICE_LEN];
        let mut mac = [0; 6];
        mac.copy_from_slice(&p[..6]);
        let mut sw_version = [0; 32];
        sw_version.copy_from_slice(&p[16..48]);
        let mut build_date = [0; 16];
        build_date.copy_from_slice(&p[48..64]);
        let mut build_time = [0; 16];
        build_time.copy_from_slice(&p[64..80]);
        Ok(QueryDevice {
            mac,
            device_state: p[6],
            new_vsm_format: p[7] != 0,
            option_flags: u32::from_le_bytes([p[8], p[9], p[10], p[11]]),
            svn_rev: u32::from_le_bytes([p[12], p[13], p[14], p[15]]),
            sw_version,
            build_date,
            build_time,
        })
    }

    /// Sends one block of image data.
    pub fn set_image_data(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        if data.len() > BUFFER_PAYLOAD_LIMIT {
            return Err(Error::BadParameter);
        }
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        payload.extend_from_slice(data);
        let (tx, tx_len) = self.build(VSM_MSG_SET_IMAGE_DATA, &payload);
        self.exchange(tx, tx_len, TIMEOUT_MSEC).map(|_| ())
    }

    /// Describes the image about to be transferred.
    pub fn set_image_header(&mut self, header: &ImageHeader) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(40);
        payload.extend_from_slice(&header.version);
        payload.extend_from_slice(&header.cpu_id.to_le_bytes());
        payload.extend_from_slice(&header.num_sections.to_le_bytes());
        payload.extend_from_slice(&header.total_image_size.to_le_bytes());
        payload.extend_from_slice(&header.checksum.to_le_bytes());
        let (tx, tx_len) = self.build(VSM_MSG_SET_IMAGE_HEADER, &payload);
        self.exchange(tx, tx_len, TIMEOUT_MSEC).map(|_| ())
    }

    /// Starts the device-side copy of a transferred image.
    pub fn init_copy(&mut self) -> Result<(), Error> {
        let (tx, tx_len) = self.build(VSM_MSG_INIT_COPY, &[]);
        self.exchange(tx, tx_len, TIMEOUT_MSEC).map(|_| ())
    }

    /// Jumps into the loaded image.
    ///
    /// For `cpu_id` 1 the device resets into the new image before replying,
    /// so a missing response is the expected outcome and is not an error.
    pub fn execute_command(
        &mut self,
        address: u32,
        ignore_checksum: u32,
        image_checksum: u32,
        cpu_id: u32,
    ) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&ignore_checksum.to_le_bytes());
        payload.extend_from_slice(&image_checksum.to_le_bytes());
        payload.extend_from_slice(&cpu_id.to_le_bytes());
        let (tx, tx_len) = self.build(VSM_MSG_EXECUTE_CMD, &payload);
        let res = self.exchange(tx, tx_len, TIMEOUT_MSEC).map(|_| ());
        if cpu_id == 1 {
            if let Err(e) = res {
                log::info!("execute on cpu 1: no response ({e}), as expected");
            }
            return Ok(());
        }
        res
    }

    /// Asks the boot ROM to decompress a loaded image in place.
    pub fn decompress(&mut self, src_addr: u32, dest_addr: u32) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&src_addr.to_le_bytes());
        payload.extend_from_slice(&dest_addr.to_le_bytes());
        let (tx, tx_len) = self.build(VSM_MSG_DECOMPRESS, &payload);
        self.exchange(tx, tx_len, TIMEOUT_MSEC).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Loopback;
    use zerocopy::{FromZeros as _, IntoBytes as _};

    const NIC: MacAddr = [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];
    const DEV: MacAddr = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

    fn session(loopback: &Arc<Loopback>) -> LegacySession {
        let _ = env_logger::builder().is_test(true).try_init();
        LegacySession::with_transport(
            Arc::clone(loopback) as Arc<dyn Transport>,
            NIC,
            Some(DEV),
        )
    }

    /// What the device would answer: same msg id, echoed session id, chosen
    /// status.
    fn response(
        msg_id: u16,
        session_id: u16,
        status: u8,
        src: MacAddr,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut p = LegacyPacket::new_zeroed();
        p.eth = EtherHeader {
            dst: NIC,
            src,
            ethertype: LEGACY_ETHER_TYPE.to_be(),
        };
        p.mgmt = MgmtHeader {
            flags: 0,
            msg_id: msg_id.to_le(),
            session_id: session_id.to_le(),
            length: (payload.len() as u16).to_le(),
            status,
        };
        p.payload[..payload.len()].copy_from_slice(payload);
        p.as_bytes()[..LEGACY_HEADER_LEN + payload.len()].to_vec()
    }

    fn query_payload() -> Vec<u8> {
        let mut p = vec![0u8; QUERY_DEVICE_LEN];
        p[..6].copy_from_slice(&DEV);
        p[6] = 2; // device state
        p[7] = 1; // new VSM format
        p[8..12].copy_from_slice(&0x11u32.to_le_bytes());
        p[12..16].copy_from_slice(&1234u32.to_le_bytes());
        p[16..24].copy_from_slice(b"fw-1.0\0\0");
        p
    }

    #[test]
    fn query_device_round_trip() {
        let loopback = Loopback::new();
        let mut s = session(&loopback);
        loopback.inject(&response(VSM_MSG_QUERY_DEVICE, 0, 0, DEV, &query_payload()));

        let info = s.query_device(200).unwrap();
        assert_eq!(info.mac, DEV);
        assert_eq!(info.device_state, 2);
        assert!(info.new_vsm_format);
        assert_eq!(info.svn_rev, 1234);
        assert_eq!(&info.sw_version[..7], b"fw-1.0\0");

        // The request went out on the loader EtherType.
        let sent = loopback.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][12..14], &LEGACY_ETHER_TYPE.to_be_bytes());

        // The exchange consumed session id 0.
        assert_eq!(s.session_id, 1);
    }

    #[test]
    fn wrong_payload_length_is_an_error() {
        let loopback = Loopback::new();
        let mut s = session(&loopback);
        loopback.inject(&response(VSM_MSG_QUERY_DEVICE, 0, 0, DEV, &[0; 12]));
        assert_eq!(s.query_device(200), Err(Error::General));
    }

    #[test]
    fn status_bytes_map_to_error_codes() {
        let cases = [
            (LegacyStatus::InternalError as u8, Error::BadState),
            (LegacyStatus::MapVsmBufIsLocked as u8, Error::ResourceInUse),
            (LegacyStatus::RetvalFail as u8, Error::General),
        ];
        for (status, want) in cases {
            let loopback = Loopback::new();
            let mut s = session(&loopback);
            loopback.inject(&response(VSM_MSG_INIT_COPY, 0, status, DEV, &[]));
            assert_eq!(s.init_copy(), Err(want), "status {status}");
            // Failed exchanges do not consume a session id.
            assert_eq!(s.session_id, 0);
        }
    }

    #[test]
    fn retransmission_flag_is_success() {
        let loopback = Loopback::new();
        let mut s = session(&loopback);
        loopback.inject(&response(
            VSM_MSG_INIT_COPY,
            0,
            LegacyStatus::RetransmissionFlag as u8,
            DEV,
            &[],
        ));
        assert_eq!(s.init_copy(), Ok(()));
        assert_eq!(s.session_id, 1);
    }

    #[test]
    fn mismatched_session_id_is_skipped() {
        let loopback = Loopback::new();
        let mut s = session(&loopback);
        // A stale response from some earlier exchange: right command, wrong
        // session. It must be ignored, leading to a timeout.
        loopback.inject(&response(VSM_MSG_INIT_COPY, 9, 0, DEV, &[]));
        assert_eq!(s.init_copy(), Err(Error::Timeout));
    }

    #[test]
    fn bootloader_mac_passes_the_source_filter() {
        let loopback = Loopback::new();
        let mut s = session(&loopback);
        loopback.inject(&response(
            VSM_MSG_QUERY_DEVICE,
            0,
            0,
            BOOTLOADER_MAC,
            &query_payload(),
        ));
        assert!(s.query_device(200).is_ok());
    }

    #[test]
    fn foreign_source_is_skipped_on_unicast() {
        let loopback = Loopback::new();
        let mut s = session(&loopback);
        loopback.inject(&response(
            VSM_MSG_QUERY_DEVICE,
            0,
            0,
            [9; 6],
            &query_payload(),
        ));
        assert_eq!(s.query_device(200), Err(Error::Timeout));
    }

    #[test]
    fn write_to_mem_blocks_the_transfer() {
        let loopback = Loopback::new();
        let mut s = session(&loopback);
        let data = vec![0xab; BUFFER_PAYLOAD_LIMIT * 2 + 96];

        // Fire-and-forget mode: no responses needed.
        s.write_to_mem(0x4000_0000, &data, 0).unwrap();

        let sent = loopback.sent_frames();
        assert_eq!(sent.len(), 3);
        // Block sizes ride in the payload's second word.
        for (i, want) in [BUFFER_PAYLOAD_LIMIT, BUFFER_PAYLOAD_LIMIT, 96]
            .iter()
            .enumerate()
        {
            let p = &sent[i][LEGACY_HEADER_LEN..];
            let size = u32::from_le_bytes([p[4], p[5], p[6], p[7]]) as usize;
            assert_eq!(size, *want, "block {i}");
            let addr = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
            assert_eq!(addr as usize, 0x4000_0000 + i * BUFFER_PAYLOAD_LIMIT);
        }
    }

    #[test]
    fn execute_on_cpu_one_tolerates_silence() {
        let loopback = Loopback::new();
        let mut s = session(&loopback);
        // Nothing injected: the exchange times out, but cpu 1 resets before
        // replying so that's fine. Short custom deadline keeps the test fast.
        let t0 = Instant::now();
        let res = {
            // execute_command uses the standard 1s deadline; acceptable here.
            s.execute_command(0x100, 0, 0, 1)
        };
        assert_eq!(res, Ok(()));
        assert!(t0.elapsed() >= Duration::from_millis(900));
    }
}
