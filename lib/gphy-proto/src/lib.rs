// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-plane protocol for a HomePlug-GreenPHY-style powerline modem.
//!
//! This crate owns the bit-exact frame layout the modem speaks on its
//! management EtherType and the per-operation request/confirmation codec on
//! top of it. It is pure data transformation: nothing in here touches a
//! socket, takes a lock, or spawns a thread. The session crate feeds it
//! received frames and transmits what it builds.
//!
//! Layout of a control frame, offsets in bytes:
//!
//! ```text
//! 0   EtherHeader    dst mac, src mac, ethertype (big-endian)
//! 14  2 pad bytes
//! 16  SpiHeader      did, sid, priority, pad
//! 20  VendorHeader   req_id (LE), fragment fields, path nibble
//! 24  MgmtHeader     flags, msg_id (LE), session_id (LE), length (LE), status
//! 32  payload        up to PAYLOAD_CAP bytes, length per MgmtHeader
//! ```
//!
//! Everything after the Ethernet header is little-endian on the wire;
//! accessors convert on read and builders convert on write, so `Packet` always
//! holds wire-order bytes and can be transmitted or stored as-is.

pub mod frame;
pub mod ops;

pub use frame::{FragInfo, MsgClass, Packet, Tier, WireMsgId};

/// A MAC address, in wire order.
pub type MacAddr = [u8; 6];

/// All-ones broadcast address.
pub const BROADCAST_MAC: MacAddr = [0xff; 6];

/// The management EtherType the modem listens on by default.
pub const ETHER_TYPE: u16 = 0x88E1;

/// A full Ethernet frame, and therefore the capacity of every receive slot.
pub const PACKET_CAP: usize = 1514;

/// Bytes of stacked headers in front of the payload.
pub const HEADER_LEN: usize = 32;

/// Maximum control-frame payload.
pub const PAYLOAD_CAP: usize = PACKET_CAP - HEADER_LEN;

/// Decode failure. The frame arrived and correlated, but its contents don't
/// parse as the confirmation we asked for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("payload too long for a single frame")]
    Oversize,
}
