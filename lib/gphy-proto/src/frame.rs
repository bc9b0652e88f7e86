// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frame layout, message identity, and fragment-field access.

use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros as _, Immutable, IntoBytes, KnownLayout};

use crate::{CodecError, MacAddr, ETHER_TYPE, HEADER_LEN, PACKET_CAP, PAYLOAD_CAP};

/// Ethernet layer-2 header. `ethertype` is big-endian, unlike everything that
/// follows it.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct EtherHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

/// SPI stream header carried between the L2 header and the vendor header.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct SpiHeader {
    pub did: u8,
    pub sid: u8,
    pub priority: u8,
    pub pad: u8,
}

/// Vendor header: request correlation plus fragmentation state.
///
/// `frag` packs the fragment index in the low nibble and the fragment count in
/// the high nibble; `fmsn_path` packs the FMSN in the low nibble and the
/// data/control path selector in the high nibble (0 = control).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct VendorHeader {
    pub req_id: u16,
    pub frag: u8,
    pub fmsn_path: u8,
}

/// Management header. All multi-byte fields little-endian.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct MgmtHeader {
    pub flags: u8,
    pub msg_id: u16,
    pub session_id: u16,
    pub length: u16,
    pub status: u8,
}

const_assert_eq!(core::mem::size_of::<EtherHeader>(), 14);
const_assert_eq!(core::mem::size_of::<SpiHeader>(), 4);
const_assert_eq!(core::mem::size_of::<VendorHeader>(), 4);
const_assert_eq!(core::mem::size_of::<MgmtHeader>(), 8);

/// One received or to-be-transmitted control frame, at full Ethernet capacity.
///
/// The receive path reads frames straight into one of these and the receive
/// database stores them by value, so the type is `Copy` on purpose: a slot is
/// a fixed 1514-byte region, never a heap object.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Copy, Clone)]
#[repr(C, packed)]
pub struct Packet {
    pub eth: EtherHeader,
    pub pad: [u8; 2],
    pub spi: SpiHeader,
    pub vendor: VendorHeader,
    pub mgmt: MgmtHeader,
    pub payload: [u8; PAYLOAD_CAP],
}

const_assert_eq!(core::mem::size_of::<Packet>(), PACKET_CAP);

impl Packet {
    /// Management message id, converted from wire (little-endian) order.
    pub fn msg_id(&self) -> u16 {
        u16::from_le(self.mgmt.msg_id)
    }

    /// Host-assigned request id from the vendor header. Only meaningful in
    /// the first fragment of a series.
    pub fn req_id(&self) -> u16 {
        u16::from_le(self.vendor.req_id)
    }

    /// Payload length claimed by the management header.
    pub fn mgmt_len(&self) -> u16 {
        u16::from_le(self.mgmt.length)
    }

    pub fn session_id(&self) -> u16 {
        u16::from_le(self.mgmt.session_id)
    }

    pub fn status(&self) -> u8 {
        self.mgmt.status
    }

    /// Fragment index within a series, 0-based.
    pub fn frag_idx(&self) -> u8 {
        self.vendor.frag & 0x0f
    }

    /// Total fragments in this frame's series.
    pub fn num_frags(&self) -> u8 {
        self.vendor.frag >> 4
    }

    /// Fragmentation Message Sequence Number, a 4-bit wrapping series tag.
    pub fn fmsn(&self) -> u8 {
        self.vendor.fmsn_path & 0x0f
    }

    /// True for control-path traffic. Data-plane frames set the path nibble
    /// and never enter the receive database.
    pub fn is_control_path(&self) -> bool {
        self.vendor.fmsn_path >> 4 == 0
    }

    /// Payload bytes covered by the management length, or an error when the
    /// header claims more than fits.
    pub fn payload_bytes(&self) -> Result<&[u8], CodecError> {
        let len = self.mgmt_len() as usize;
        self.payload
            .get(..len)
            .ok_or(CodecError::Malformed("length exceeds payload capacity"))
    }
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new_zeroed()
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("msg_id", &self.msg_id())
            .field("req_id", &self.req_id())
            .field("frag_idx", &self.frag_idx())
            .field("num_frags", &self.num_frags())
            .field("fmsn", &self.fmsn())
            .field("len", &self.mgmt_len())
            .finish()
    }
}

/// Message class, from the low two bits of the message id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MsgClass {
    Request,
    Confirm,
    Indication,
    Response,
}

impl MsgClass {
    pub fn of(msg_id: u16) -> Self {
        match msg_id & 0x3 {
            0 => MsgClass::Request,
            1 => MsgClass::Confirm,
            2 => MsgClass::Indication,
            _ => MsgClass::Response,
        }
    }
}

/// Which receive-database tier a message is stored in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tier {
    Main,
    Indication,
}

impl Tier {
    /// Routing rule: indications go to the indication tier, everything else to
    /// main. `D_LINK_READY_IND` is the one message whose class bits say
    /// otherwise but which is an asynchronous notification all the same, so it
    /// is routed by explicit exception.
    pub fn of(msg_id: u16) -> Self {
        if msg_id == WireMsgId::DLinkReadyInd as u16
            || MsgClass::of(msg_id) == MsgClass::Indication
        {
            Tier::Indication
        } else {
            Tier::Main
        }
    }
}

/// Wire message ids for the station-management operation set.
///
/// Encoding is `0xA000 + (operation << 2) | class` with class bits
/// request=0 / confirm=1 / indication=2 / response=3.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum WireMsgId {
    GetFwVersionReq = 0xA000,
    GetFwVersionCnf = 0xA001,
    LinkStatsReq = 0xA004,
    LinkStatsCnf = 0xA005,
    ReadMemReq = 0xA008,
    ReadMemCnf = 0xA009,
    WriteMemReq = 0xA00C,
    WriteMemCnf = 0xA00D,
    DeviceInfoReq = 0xA010,
    DeviceInfoCnf = 0xA011,
    GetAmpMapReq = 0xA014,
    GetAmpMapCnf = 0xA015,
    GetDeviceStateReq = 0xA018,
    GetDeviceStateCnf = 0xA019,
    GetDLinkStatusReq = 0xA01C,
    GetDLinkStatusCnf = 0xA01D,
    GetDcCalibReq = 0xA020,
    GetDcCalibCnf = 0xA021,
    EnterPhyModeReq = 0xA024,
    EnterPhyModeCnf = 0xA025,
    AbortDumpActionReq = 0xA028,
    AbortDumpActionCnf = 0xA029,
    GetSnreReq = 0xA02C,
    GetSnreCnf = 0xA02D,
    GetCe2InfoReq = 0xA030,
    GetCe2InfoCnf = 0xA031,
    GetCe2DataReq = 0xA034,
    GetCe2DataCnf = 0xA035,
    GetLnoeReq = 0xA038,
    GetLnoeCnf = 0xA039,
    ResetDeviceReq = 0xA03C,
    DLinkTerminateReq = 0xA040,
    DLinkTerminateCnf = 0xA041,
    HostMessageStatusInd = 0xA046,
    /// Carries a confirm-class id on the wire; see [`Tier::of`].
    DLinkReadyInd = 0xA049,
}

/// Host-facing message identity, as delivered to the session's receive
/// callback. One variant per wire id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostMsgId {
    GetFwVersionReq,
    GetFwVersionCnf,
    LinkStatsReq,
    LinkStatsCnf,
    ReadMemReq,
    ReadMemCnf,
    WriteMemReq,
    WriteMemCnf,
    DeviceInfoReq,
    DeviceInfoCnf,
    GetAmpMapReq,
    GetAmpMapCnf,
    GetDeviceStateReq,
    GetDeviceStateCnf,
    GetDLinkStatusReq,
    GetDLinkStatusCnf,
    GetDcCalibReq,
    GetDcCalibCnf,
    EnterPhyModeReq,
    EnterPhyModeCnf,
    AbortDumpActionReq,
    AbortDumpActionCnf,
    GetSnreReq,
    GetSnreCnf,
    GetCe2InfoReq,
    GetCe2InfoCnf,
    GetCe2DataReq,
    GetCe2DataCnf,
    GetLnoeReq,
    GetLnoeCnf,
    ResetDeviceReq,
    DLinkTerminateReq,
    DLinkTerminateCnf,
    HostMessageStatusInd,
    DLinkReadyInd,
}

impl WireMsgId {
    /// Total mapping from wire identity to host identity.
    pub fn host(self) -> HostMsgId {
        match self {
            WireMsgId::GetFwVersionReq => HostMsgId::GetFwVersionReq,
            WireMsgId::GetFwVersionCnf => HostMsgId::GetFwVersionCnf,
            WireMsgId::LinkStatsReq => HostMsgId::LinkStatsReq,
            WireMsgId::LinkStatsCnf => HostMsgId::LinkStatsCnf,
            WireMsgId::ReadMemReq => HostMsgId::ReadMemReq,
            WireMsgId::ReadMemCnf => HostMsgId::ReadMemCnf,
            WireMsgId::WriteMemReq => HostMsgId::WriteMemReq,
            WireMsgId::WriteMemCnf => HostMsgId::WriteMemCnf,
            WireMsgId::DeviceInfoReq => HostMsgId::DeviceInfoReq,
            WireMsgId::DeviceInfoCnf => HostMsgId::DeviceInfoCnf,
            WireMsgId::GetAmpMapReq => HostMsgId::GetAmpMapReq,
            WireMsgId::GetAmpMapCnf => HostMsgId::GetAmpMapCnf,
            WireMsgId::GetDeviceStateReq => HostMsgId::GetDeviceStateReq,
            WireMsgId::GetDeviceStateCnf => HostMsgId::GetDeviceStateCnf,
            WireMsgId::GetDLinkStatusReq => HostMsgId::GetDLinkStatusReq,
            WireMsgId::GetDLinkStatusCnf => HostMsgId::GetDLinkStatusCnf,
            WireMsgId::GetDcCalibReq => HostMsgId::GetDcCalibReq,
            WireMsgId::GetDcCalibCnf => HostMsgId::GetDcCalibCnf,
            WireMsgId::EnterPhyModeReq => HostMsgId::EnterPhyModeReq,
            WireMsgId::EnterPhyModeCnf => HostMsgId::EnterPhyModeCnf,
            WireMsgId::AbortDumpActionReq => HostMsgId::AbortDumpActionReq,
            WireMsgId::AbortDumpActionCnf => HostMsgId::AbortDumpActionCnf,
            WireMsgId::GetSnreReq => HostMsgId::GetSnreReq,
            WireMsgId::GetSnreCnf => HostMsgId::GetSnreCnf,
            WireMsgId::GetCe2InfoReq => HostMsgId::GetCe2InfoReq,
            WireMsgId::GetCe2InfoCnf => HostMsgId::GetCe2InfoCnf,
            WireMsgId::GetCe2DataReq => HostMsgId::GetCe2DataReq,
            WireMsgId::GetCe2DataCnf => HostMsgId::GetCe2DataCnf,
            WireMsgId::GetLnoeReq => HostMsgId::GetLnoeReq,
            WireMsgId::GetLnoeCnf => HostMsgId::GetLnoeCnf,
            WireMsgId::ResetDeviceReq => HostMsgId::ResetDeviceReq,
            WireMsgId::DLinkTerminateReq => HostMsgId::DLinkTerminateReq,
            WireMsgId::DLinkTerminateCnf => HostMsgId::DLinkTerminateCnf,
            WireMsgId::HostMessageStatusInd => HostMsgId::HostMessageStatusInd,
            WireMsgId::DLinkReadyInd => HostMsgId::DLinkReadyInd,
        }
    }
}

/// Fragmentation fields for a frame under construction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FragInfo {
    pub frag_idx: u8,
    pub num_frags: u8,
    pub fmsn: u8,
}

impl FragInfo {
    /// A single-fragment message, which is every request this library sends.
    pub const SINGLE: Self = Self {
        frag_idx: 0,
        num_frags: 1,
        fmsn: 0,
    };
}

/// Lays out a complete control frame and returns it with its wire length.
///
/// This is the one place all four headers get written; the typed builders in
/// [`crate::ops`] and the confirmation side of device simulators both go
/// through it.
pub fn build_control(
    dest: &MacAddr,
    src: &MacAddr,
    msg_id: u16,
    req_id: u16,
    frag: FragInfo,
    payload: &[u8],
) -> Result<(Packet, usize), CodecError> {
    if payload.len() > PAYLOAD_CAP {
        return Err(CodecError::Oversize);
    }
    let mut p = Packet::new_zeroed();
    p.eth = EtherHeader {
        dst: *dest,
        src: *src,
        ethertype: ETHER_TYPE.to_be(),
    };
    p.spi = SpiHeader {
        did: 0,
        sid: 0,
        priority: 0,
        pad: 0,
    };
    p.vendor = VendorHeader {
        req_id: req_id.to_le(),
        frag: (frag.num_frags << 4) | (frag.frag_idx & 0x0f),
        fmsn_path: frag.fmsn & 0x0f,
    };
    p.mgmt = MgmtHeader {
        flags: 0,
        msg_id: msg_id.to_le(),
        session_id: 0,
        length: (payload.len() as u16).to_le(),
        status: 0,
    };
    p.payload[..payload.len()].copy_from_slice(payload);
    Ok((p, HEADER_LEN + payload.len()))
}
