// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-operation request builders and confirmation parsers.
//!
//! Every builder lays out a complete single-fragment control frame via
//! [`frame::build_control`] and returns it with its wire length; every parser
//! validates the management length before touching the payload. Both sides
//! are pure `(struct) <-> bytes` mappings; correlation and transport live
//! elsewhere.
//!
//! Payload integers are little-endian on the wire throughout.

use crate::frame::{build_control, FragInfo, Packet, WireMsgId};
use crate::{CodecError, MacAddr, HEADER_LEN};

/// Firmware version, as reported by `GetFwVersion`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FwVersion {
    /// NUL-padded version string.
    pub version: [u8; 24],
    pub svn_rev: u32,
}

/// Parameters for a link-statistics query.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinkStatsReq {
    pub link_id: u8,
    pub peer: MacAddr,
}

/// Link-level counters returned by `LinkStats`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LinkStats {
    pub tx_frames: u32,
    pub tx_acked: u32,
    pub tx_collisions: u32,
    pub tx_failed: u32,
    pub rx_frames: u32,
    pub rx_crc_errors: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReadMemReq {
    pub address: u32,
    pub size: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadMem {
    pub address: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteMemReq<'a> {
    pub address: u32,
    pub data: &'a [u8],
}

/// Status byte carried in one-byte confirmations. Zero is success; anything
/// else is device-defined.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PeerStatus(pub u8);

impl PeerStatus {
    pub fn ok(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    pub mac: MacAddr,
    pub state: u8,
    /// NUL-padded version string.
    pub version: [u8; 24],
    pub svn_rev: u32,
}

/// Amplitude map, reassembled across fragments. Entries are 4 bits each,
/// packed two per byte, low nibble first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AmpMap {
    pub num_entries: u16,
    pub entries: Vec<u8>,
}

impl AmpMap {
    /// True once the packed entry bytes cover the advertised entry count.
    pub fn is_complete(&self) -> bool {
        self.entries.len() * 2 >= self.num_entries as usize
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DcCalib {
    pub done: bool,
    pub offset: u16,
}

/// Signal-to-noise ratio estimate per carrier group, in whole dB.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SnreInfo {
    pub snr_db: Vec<i8>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ce2Info {
    pub block_size: u32,
    pub num_blocks: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ce2Data {
    pub block_index: u32,
    pub data: Vec<u8>,
}

/// Line-noise estimate per carrier group, in whole dB.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LnoeInfo {
    pub noise_db: Vec<i8>,
}

/// Reset behavior requested of the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResetMode {
    Normal = 0,
    EnterBootloader = 1,
}

/// Asynchronous notice that the device refused or dropped a host message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HostMessageStatus {
    pub refused_msg_id: u16,
    pub status: u8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DLinkReady {
    pub ready: bool,
}

// --- small slice cursors, in the take_array style -------------------------

fn take_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    let (&b, rest) = buf
        .split_first()
        .ok_or(CodecError::Malformed("payload truncated"))?;
    *buf = rest;
    Ok(b)
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, CodecError> {
    Ok(u16::from_le_bytes([take_u8(buf)?, take_u8(buf)?]))
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    let lo = take_u16(buf)? as u32;
    let hi = take_u16(buf)? as u32;
    Ok(hi << 16 | lo)
}

fn take_bytes<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if buf.len() < n {
        return Err(CodecError::Malformed("payload truncated"));
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

fn payload_exact(p: &Packet, want: usize) -> Result<&[u8], CodecError> {
    let payload = p.payload_bytes()?;
    if payload.len() != want {
        return Err(CodecError::Malformed("unexpected payload length"));
    }
    Ok(payload)
}

fn build_empty_req(
    dest: &MacAddr,
    src: &MacAddr,
    msg_id: WireMsgId,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_control(dest, src, msg_id as u16, req_id, FragInfo::SINGLE, &[])
}

fn parse_status_cnf(p: &Packet) -> Result<PeerStatus, CodecError> {
    let payload = payload_exact(p, 1)?;
    Ok(PeerStatus(payload[0]))
}

// --- firmware version -----------------------------------------------------

pub fn build_get_fw_version_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::GetFwVersionReq, req_id)
}

pub fn parse_get_fw_version_cnf(p: &Packet) -> Result<FwVersion, CodecError> {
    let mut payload = payload_exact(p, 28)?;
    let buf = &mut payload;
    let mut version = [0; 24];
    version.copy_from_slice(take_bytes(buf, 24)?);
    Ok(FwVersion {
        version,
        svn_rev: take_u32(buf)?,
    })
}

// --- link statistics ------------------------------------------------------

pub fn build_link_stats_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
    args: &LinkStatsReq,
) -> Result<(Packet, usize), CodecError> {
    let mut payload = [0; 7];
    payload[0] = args.link_id;
    payload[1..].copy_from_slice(&args.peer);
    build_control(
        dest,
        src,
        WireMsgId::LinkStatsReq as u16,
        req_id,
        FragInfo::SINGLE,
        &payload,
    )
}

pub fn parse_link_stats_cnf(p: &Packet) -> Result<LinkStats, CodecError> {
    let mut payload = payload_exact(p, 24)?;
    let buf = &mut payload;
    Ok(LinkStats {
        tx_frames: take_u32(buf)?,
        tx_acked: take_u32(buf)?,
        tx_collisions: take_u32(buf)?,
        tx_failed: take_u32(buf)?,
        rx_frames: take_u32(buf)?,
        rx_crc_errors: take_u32(buf)?,
    })
}

// --- memory access --------------------------------------------------------

pub fn build_read_mem_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
    args: &ReadMemReq,
) -> Result<(Packet, usize), CodecError> {
    let mut payload = [0; 8];
    payload[..4].copy_from_slice(&args.address.to_le_bytes());
    payload[4..].copy_from_slice(&args.size.to_le_bytes());
    build_control(
        dest,
        src,
        WireMsgId::ReadMemReq as u16,
        req_id,
        FragInfo::SINGLE,
        &payload,
    )
}

pub fn parse_read_mem_cnf(p: &Packet) -> Result<ReadMem, CodecError> {
    let mut payload = p.payload_bytes()?;
    let buf = &mut payload;
    let address = take_u32(buf)?;
    let size = take_u32(buf)? as usize;
    if buf.len() != size {
        return Err(CodecError::Malformed("read size disagrees with payload"));
    }
    Ok(ReadMem {
        address,
        data: buf.to_vec(),
    })
}

pub fn build_write_mem_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
    args: &WriteMemReq<'_>,
) -> Result<(Packet, usize), CodecError> {
    let mut payload = Vec::with_capacity(8 + args.data.len());
    payload.extend_from_slice(&args.address.to_le_bytes());
    payload.extend_from_slice(&(args.data.len() as u32).to_le_bytes());
    payload.extend_from_slice(args.data);
    build_control(
        dest,
        src,
        WireMsgId::WriteMemReq as u16,
        req_id,
        FragInfo::SINGLE,
        &payload,
    )
}

pub fn parse_write_mem_cnf(p: &Packet) -> Result<PeerStatus, CodecError> {
    parse_status_cnf(p)
}

// --- device info / state --------------------------------------------------

pub fn build_device_info_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::DeviceInfoReq, req_id)
}

pub fn parse_device_info_cnf(p: &Packet) -> Result<DeviceInfo, CodecError> {
    let mut payload = payload_exact(p, 35)?;
    let buf = &mut payload;
    let mut mac = [0; 6];
    mac.copy_from_slice(take_bytes(buf, 6)?);
    let state = take_u8(buf)?;
    let mut version = [0; 24];
    version.copy_from_slice(take_bytes(buf, 24)?);
    Ok(DeviceInfo {
        mac,
        state,
        version,
        svn_rev: take_u32(buf)?,
    })
}

pub fn build_get_device_state_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::GetDeviceStateReq, req_id)
}

pub fn parse_get_device_state_cnf(p: &Packet) -> Result<u8, CodecError> {
    Ok(payload_exact(p, 1)?[0])
}

pub fn build_get_d_link_status_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::GetDLinkStatusReq, req_id)
}

pub fn parse_get_d_link_status_cnf(p: &Packet) -> Result<u8, CodecError> {
    Ok(payload_exact(p, 1)?[0])
}

// --- calibration and diagnostics ------------------------------------------

pub fn build_get_dc_calib_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::GetDcCalibReq, req_id)
}

pub fn parse_get_dc_calib_cnf(p: &Packet) -> Result<DcCalib, CodecError> {
    let mut payload = payload_exact(p, 3)?;
    let buf = &mut payload;
    Ok(DcCalib {
        done: take_u8(buf)? != 0,
        offset: take_u16(buf)?,
    })
}

pub fn build_enter_phy_mode_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::EnterPhyModeReq, req_id)
}

pub fn parse_enter_phy_mode_cnf(p: &Packet) -> Result<PeerStatus, CodecError> {
    parse_status_cnf(p)
}

pub fn build_abort_dump_action_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::AbortDumpActionReq, req_id)
}

pub fn parse_abort_dump_action_cnf(p: &Packet) -> Result<PeerStatus, CodecError> {
    parse_status_cnf(p)
}

fn parse_counted_i8(p: &Packet) -> Result<Vec<i8>, CodecError> {
    let mut payload = p.payload_bytes()?;
    let buf = &mut payload;
    let count = take_u16(buf)? as usize;
    let raw = take_bytes(buf, count)?;
    if !buf.is_empty() {
        return Err(CodecError::Malformed("trailing bytes after entries"));
    }
    Ok(raw.iter().map(|&b| b as i8).collect())
}

pub fn build_get_snre_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::GetSnreReq, req_id)
}

pub fn parse_get_snre_cnf(p: &Packet) -> Result<SnreInfo, CodecError> {
    Ok(SnreInfo {
        snr_db: parse_counted_i8(p)?,
    })
}

pub fn build_get_lnoe_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::GetLnoeReq, req_id)
}

pub fn parse_get_lnoe_cnf(p: &Packet) -> Result<LnoeInfo, CodecError> {
    Ok(LnoeInfo {
        noise_db: parse_counted_i8(p)?,
    })
}

// --- CE2 capture ----------------------------------------------------------

pub fn build_get_ce2_info_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::GetCe2InfoReq, req_id)
}

pub fn parse_get_ce2_info_cnf(p: &Packet) -> Result<Ce2Info, CodecError> {
    let mut payload = payload_exact(p, 8)?;
    let buf = &mut payload;
    Ok(Ce2Info {
        block_size: take_u32(buf)?,
        num_blocks: take_u32(buf)?,
    })
}

pub fn build_get_ce2_data_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
    block_index: u32,
) -> Result<(Packet, usize), CodecError> {
    build_control(
        dest,
        src,
        WireMsgId::GetCe2DataReq as u16,
        req_id,
        FragInfo::SINGLE,
        &block_index.to_le_bytes(),
    )
}

pub fn parse_get_ce2_data_cnf(p: &Packet) -> Result<Ce2Data, CodecError> {
    let mut payload = p.payload_bytes()?;
    let buf = &mut payload;
    let block_index = take_u32(buf)?;
    let size = take_u32(buf)? as usize;
    if buf.len() != size {
        return Err(CodecError::Malformed("block size disagrees with payload"));
    }
    Ok(Ce2Data {
        block_index,
        data: buf.to_vec(),
    })
}

// --- amplitude map (multi-fragment) ---------------------------------------

pub fn build_get_amp_map_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::GetAmpMapReq, req_id)
}

/// Consumes one fragment of a `GetAmpMap` confirmation.
///
/// Called once per fragment with a running `offset` (packed entry bytes
/// already accumulated in `out`); returns how many entry bytes this fragment
/// contributed. The first fragment additionally carries the total entry count.
pub fn parse_get_amp_map_cnf(
    p: &Packet,
    wire_len: usize,
    out: &mut AmpMap,
    offset: usize,
) -> Result<usize, CodecError> {
    let mut payload = p.payload_bytes()?;
    if HEADER_LEN + payload.len() > wire_len {
        return Err(CodecError::Malformed("length exceeds received frame"));
    }
    if out.entries.len() != offset {
        return Err(CodecError::Malformed("fragment applied out of order"));
    }
    let buf = &mut payload;
    if p.frag_idx() == 0 {
        out.num_entries = take_u16(buf)?;
        out.entries.clear();
    }
    out.entries.extend_from_slice(buf);
    Ok(buf.len())
}

// --- reset / link teardown ------------------------------------------------

pub fn build_reset_device_req(
    dest: &MacAddr,
    src: &MacAddr,
    mode: ResetMode,
) -> Result<(Packet, usize), CodecError> {
    // Reset is fire-and-forget: the device goes down before it could confirm,
    // so no request id is carried.
    build_control(
        dest,
        src,
        WireMsgId::ResetDeviceReq as u16,
        0,
        FragInfo::SINGLE,
        &[mode as u8],
    )
}

pub fn build_d_link_terminate_req(
    dest: &MacAddr,
    src: &MacAddr,
    req_id: u16,
) -> Result<(Packet, usize), CodecError> {
    build_empty_req(dest, src, WireMsgId::DLinkTerminateReq, req_id)
}

pub fn parse_d_link_terminate_cnf(p: &Packet) -> Result<(), CodecError> {
    payload_exact(p, 0)?;
    Ok(())
}

// --- indications ----------------------------------------------------------

pub fn parse_host_message_status_ind(
    p: &Packet,
) -> Result<HostMessageStatus, CodecError> {
    let mut payload = payload_exact(p, 3)?;
    let buf = &mut payload;
    Ok(HostMessageStatus {
        refused_msg_id: take_u16(buf)?,
        status: take_u8(buf)?,
    })
}

pub fn parse_d_link_ready_ind(p: &Packet) -> Result<DLinkReady, CodecError> {
    Ok(DLinkReady {
        ready: payload_exact(p, 1)?[0] != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::build_control;
    use proptest::prelude::*;

    const DEV: MacAddr = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
    const NIC: MacAddr = [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];

    /// Confirmation-direction builder for round-trip tests: what a device
    /// would put on the wire.
    fn cnf(msg_id: WireMsgId, req_id: u16, payload: &[u8]) -> Packet {
        let (p, _) =
            build_control(&NIC, &DEV, msg_id as u16, req_id, FragInfo::SINGLE, payload)
                .unwrap();
        p
    }

    fn cnf_fragment(
        msg_id: WireMsgId,
        req_id: u16,
        frag: FragInfo,
        payload: &[u8],
    ) -> (Packet, usize) {
        build_control(&NIC, &DEV, msg_id as u16, req_id, frag, payload).unwrap()
    }

    #[test]
    fn requests_carry_their_ids_and_lengths() {
        let (p, len) = build_get_fw_version_req(&DEV, &NIC, 7).unwrap();
        assert_eq!(len, HEADER_LEN);
        assert_eq!(p.msg_id(), WireMsgId::GetFwVersionReq as u16);
        assert_eq!(p.req_id(), 7);
        assert_eq!(p.num_frags(), 1);
        assert_eq!(p.frag_idx(), 0);
        assert_eq!(p.mgmt_len(), 0);

        let (p, len) = build_read_mem_req(
            &DEV,
            &NIC,
            3,
            &ReadMemReq {
                address: 0x1000_0000,
                size: 64,
            },
        )
        .unwrap();
        assert_eq!(len, HEADER_LEN + 8);
        assert_eq!(p.mgmt_len(), 8);
    }

    #[test]
    fn fw_version_round_trip() {
        let mut payload = [0u8; 28];
        payload[..7].copy_from_slice(b"v1.2.3\0");
        payload[24..].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        let got =
            parse_get_fw_version_cnf(&cnf(WireMsgId::GetFwVersionCnf, 1, &payload))
                .unwrap();
        assert_eq!(&got.version[..7], b"v1.2.3\0");
        assert_eq!(got.svn_rev, 0xdead_beef);
    }

    #[test]
    fn short_or_long_confirmations_are_malformed() {
        let p = cnf(WireMsgId::GetFwVersionCnf, 1, &[0; 27]);
        assert!(parse_get_fw_version_cnf(&p).is_err());
        let p = cnf(WireMsgId::GetDeviceStateCnf, 1, &[0, 0]);
        assert!(parse_get_device_state_cnf(&p).is_err());
    }

    #[test]
    fn read_mem_size_must_agree_with_payload() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x2000u32.to_le_bytes());
        payload.extend_from_slice(&4u32.to_le_bytes());
        payload.extend_from_slice(&[1, 2, 3, 4]);
        let got = parse_read_mem_cnf(&cnf(WireMsgId::ReadMemCnf, 2, &payload)).unwrap();
        assert_eq!(got.address, 0x2000);
        assert_eq!(got.data, vec![1, 2, 3, 4]);

        payload[4] = 5; // claim one more byte than present
        assert!(parse_read_mem_cnf(&cnf(WireMsgId::ReadMemCnf, 2, &payload)).is_err());
    }

    #[test]
    fn amp_map_reassembles_across_fragments() {
        let mut out = AmpMap::default();
        // 10 entries = 5 packed bytes, split 3 + 2 across two fragments.
        let mut first = Vec::new();
        first.extend_from_slice(&10u16.to_le_bytes());
        first.extend_from_slice(&[0x21, 0x43, 0x65]);
        let (p0, len0) = cnf_fragment(
            WireMsgId::GetAmpMapCnf,
            9,
            FragInfo {
                frag_idx: 0,
                num_frags: 2,
                fmsn: 5,
            },
            &first,
        );
        let consumed = parse_get_amp_map_cnf(&p0, len0, &mut out, 0).unwrap();
        assert_eq!(consumed, 3);
        assert!(!out.is_complete());

        let (p1, len1) = cnf_fragment(
            WireMsgId::GetAmpMapCnf,
            9,
            FragInfo {
                frag_idx: 1,
                num_frags: 2,
                fmsn: 5,
            },
            &[0x87, 0xa9],
        );
        let consumed = parse_get_amp_map_cnf(&p1, len1, &mut out, consumed).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(out.num_entries, 10);
        assert_eq!(out.entries, vec![0x21, 0x43, 0x65, 0x87, 0xa9]);
        assert!(out.is_complete());
    }

    #[test]
    fn amp_map_rejects_out_of_order_application() {
        let mut out = AmpMap::default();
        let (p1, len1) = cnf_fragment(
            WireMsgId::GetAmpMapCnf,
            9,
            FragInfo {
                frag_idx: 1,
                num_frags: 2,
                fmsn: 5,
            },
            &[0x87, 0xa9],
        );
        // Claiming an offset we never accumulated must fail.
        assert!(parse_get_amp_map_cnf(&p1, len1, &mut out, 3).is_err());
    }

    #[test]
    fn indication_parsers() {
        let got = parse_host_message_status_ind(&cnf(
            WireMsgId::HostMessageStatusInd,
            0,
            &[0x0c, 0xa0, 2],
        ))
        .unwrap();
        assert_eq!(got.refused_msg_id, 0xa00c);
        assert_eq!(got.status, 2);

        let got =
            parse_d_link_ready_ind(&cnf(WireMsgId::DLinkReadyInd, 0, &[1])).unwrap();
        assert!(got.ready);
    }

    proptest! {
        #[test]
        fn link_stats_round_trip(vals in proptest::array::uniform6(any::<u32>())) {
            let mut payload = Vec::new();
            for v in vals {
                payload.extend_from_slice(&v.to_le_bytes());
            }
            let got = parse_link_stats_cnf(
                &cnf(WireMsgId::LinkStatsCnf, 1, &payload),
            ).unwrap();
            prop_assert_eq!(
                got,
                LinkStats {
                    tx_frames: vals[0],
                    tx_acked: vals[1],
                    tx_collisions: vals[2],
                    tx_failed: vals[3],
                    rx_frames: vals[4],
                    rx_crc_errors: vals[5],
                }
            );
        }

        #[test]
        fn snre_round_trip(entries in proptest::collection::vec(any::<i8>(), 0..64)) {
            let mut payload = Vec::new();
            payload.extend_from_slice(&(entries.len() as u16).to_le_bytes());
            payload.extend(entries.iter().map(|&v| v as u8));
            let got = parse_get_snre_cnf(
                &cnf(WireMsgId::GetSnreCnf, 1, &payload),
            ).unwrap();
            prop_assert_eq!(got.snr_db, entries);
        }

        #[test]
        fn write_mem_req_layout(addr in any::<u32>(), data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let (p, len) = build_write_mem_req(
                &DEV, &NIC, 4, &WriteMemReq { address: addr, data: &data },
            ).unwrap();
            prop_assert_eq!(len, HEADER_LEN + 8 + data.len());
            let payload = p.payload_bytes().unwrap();
            prop_assert_eq!(&payload[..4], &addr.to_le_bytes());
            prop_assert_eq!(&payload[8..], data.as_slice());
        }

        #[test]
        fn ce2_data_round_trip(idx in any::<u32>(), data in proptest::collection::vec(any::<u8>(), 0..128)) {
            let mut payload = Vec::new();
            payload.extend_from_slice(&idx.to_le_bytes());
            payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
            payload.extend_from_slice(&data);
            let got = parse_get_ce2_data_cnf(
                &cnf(WireMsgId::GetCe2DataCnf, 1, &payload),
            ).unwrap();
            prop_assert_eq!(got, Ce2Data { block_index: idx, data });
        }
    }
}
