// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Station-management operations: one `_req_send` / `_cnf_receive` pair per
//! operation, plus the indication receivers.
//!
//! Senders encode through `gphy_proto::ops` and transmit; receivers wait for
//! the matching confirmation in the receive database and parse it. The
//! pairing is deliberate: an application can pipeline several requests with
//! distinct request ids and collect the confirmations in any order.

use std::time::{Duration, Instant};

use gphy_proto::ops::{
    self, AmpMap, Ce2Data, Ce2Info, DLinkReady, DcCalib, DeviceInfo, FwVersion,
    HostMessageStatus, LinkStats, LinkStatsReq, LnoeInfo, PeerStatus, ReadMem,
    ReadMemReq, ResetMode, SnreInfo, WriteMemReq,
};
use gphy_proto::WireMsgId;

use crate::{Error, Session};

impl Session {
    pub fn get_fw_version_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_get_fw_version_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn get_fw_version_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<FwVersion, Error> {
        let packet = self.wait_pop(WireMsgId::GetFwVersionCnf, req_id, timeout_ms)?;
        ops::parse_get_fw_version_cnf(&packet).map_err(|e| {
            log::error!("confirmation parse failed: {e}");
            e.into()
        })
    }

    pub fn link_stats_req_send(
        &self,
        req_id: u16,
        args: &LinkStatsReq,
    ) -> Result<(), Error> {
        let (packet, len) =
            ops::build_link_stats_req(&self.peer_mac, &self.nic_mac, req_id, args)?;
        self.transmit(&packet, len)
    }

    pub fn link_stats_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<LinkStats, Error> {
        let packet = self.wait_pop(WireMsgId::LinkStatsCnf, req_id, timeout_ms)?;
        ops::parse_link_stats_cnf(&packet).map_err(|e| {
            log::error!("confirmation parse failed: {e}");
            e.into()
        })
    }

    pub fn read_mem_req_send(
        &self,
        req_id: u16,
        args: &ReadMemReq,
    ) -> Result<(), Error> {
        let (packet, len) =
            ops::build_read_mem_req(&self.peer_mac, &self.nic_mac, req_id, args)?;
        self.transmit(&packet, len)
    }

    pub fn read_mem_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<ReadMem, Error> {
        let packet = self.wait_pop(WireMsgId::ReadMemCnf, req_id, timeout_ms)?;
        ops::parse_read_mem_cnf(&packet).map_err(|e| {
            log::error!("confirmation parse failed: {e}");
            e.into()
        })
    }

    pub fn write_mem_req_send(
        &self,
        req_id: u16,
        args: &WriteMemReq<'_>,
    ) -> Result<(), Error> {
        let (packet, len) =
            ops::build_write_mem_req(&self.peer_mac, &self.nic_mac, req_id, args)?;
        self.transmit(&packet, len)
    }

    pub fn write_mem_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<PeerStatus, Error> {
        let packet = self.wait_pop(WireMsgId::WriteMemCnf, req_id, timeout_ms)?;
        ops::parse_write_mem_cnf(&packet).map_err(Error::from)
    }

    pub fn device_info_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_device_info_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn device_info_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<DeviceInfo, Error> {
        let packet = self.wait_pop(WireMsgId::DeviceInfoCnf, req_id, timeout_ms)?;
        ops::parse_device_info_cnf(&packet).map_err(|e| {
            log::error!("confirmation parse failed: {e}");
            e.into()
        })
    }

    pub fn get_device_state_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_get_device_state_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn get_device_state_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<u8, Error> {
        let packet =
            self.wait_pop(WireMsgId::GetDeviceStateCnf, req_id, timeout_ms)?;
        ops::parse_get_device_state_cnf(&packet).map_err(Error::from)
    }

    pub fn get_d_link_status_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_get_d_link_status_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn get_d_link_status_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<u8, Error> {
        let packet =
            self.wait_pop(WireMsgId::GetDLinkStatusCnf, req_id, timeout_ms)?;
        ops::parse_get_d_link_status_cnf(&packet).map_err(Error::from)
    }

    pub fn get_dc_calib_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_get_dc_calib_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn get_dc_calib_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<DcCalib, Error> {
        let packet = self.wait_pop(WireMsgId::GetDcCalibCnf, req_id, timeout_ms)?;
        ops::parse_get_dc_calib_cnf(&packet).map_err(Error::from)
    }

    pub fn enter_phy_mode_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_enter_phy_mode_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn enter_phy_mode_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<PeerStatus, Error> {
        let packet = self.wait_pop(WireMsgId::EnterPhyModeCnf, req_id, timeout_ms)?;
        ops::parse_enter_phy_mode_cnf(&packet).map_err(Error::from)
    }

    pub fn abort_dump_action_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_abort_dump_action_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn abort_dump_action_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<PeerStatus, Error> {
        let packet =
            self.wait_pop(WireMsgId::AbortDumpActionCnf, req_id, timeout_ms)?;
        ops::parse_abort_dump_action_cnf(&packet).map_err(Error::from)
    }

    pub fn get_snre_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_get_snre_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn get_snre_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<SnreInfo, Error> {
        let packet = self.wait_pop(WireMsgId::GetSnreCnf, req_id, timeout_ms)?;
        ops::parse_get_snre_cnf(&packet).map_err(Error::from)
    }

    pub fn get_lnoe_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_get_lnoe_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn get_lnoe_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<LnoeInfo, Error> {
        let packet = self.wait_pop(WireMsgId::GetLnoeCnf, req_id, timeout_ms)?;
        ops::parse_get_lnoe_cnf(&packet).map_err(Error::from)
    }

    pub fn get_ce2_info_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_get_ce2_info_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn get_ce2_info_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<Ce2Info, Error> {
        let packet = self.wait_pop(WireMsgId::GetCe2InfoCnf, req_id, timeout_ms)?;
        ops::parse_get_ce2_info_cnf(&packet).map_err(Error::from)
    }

    pub fn get_ce2_data_req_send(
        &self,
        req_id: u16,
        block_index: u32,
    ) -> Result<(), Error> {
        let (packet, len) = ops::build_get_ce2_data_req(
            &self.peer_mac,
            &self.nic_mac,
            req_id,
            block_index,
        )?;
        self.transmit(&packet, len)
    }

    pub fn get_ce2_data_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<Ce2Data, Error> {
        let packet = self.wait_pop(WireMsgId::GetCe2DataCnf, req_id, timeout_ms)?;
        ops::parse_get_ce2_data_cnf(&packet).map_err(Error::from)
    }

    pub fn get_amp_map_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_get_amp_map_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    /// Receives and reassembles a (possibly fragmented) amplitude-map
    /// confirmation.
    ///
    /// The first fragment is matched by request id and names the series'
    /// FMSN and fragment count; the rest are drained in index order against
    /// the same wall-clock budget.
    pub fn get_amp_map_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<AmpMap, Error> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        let mut map = AmpMap::default();

        let (first, wire_len) =
            self.wait_pop_fragment(WireMsgId::GetAmpMapCnf, req_id, 0, 0, deadline)?;
        let num_frags = first.num_frags();
        let fmsn = first.fmsn();
        let mut offset = ops::parse_get_amp_map_cnf(&first, wire_len, &mut map, 0)
            .map_err(|e| {
                log::error!("confirmation parse failed: {e}");
                Error::from(e)
            })?;

        for frag_idx in 1..num_frags {
            let (frag, wire_len) = self.wait_pop_fragment(
                WireMsgId::GetAmpMapCnf,
                req_id,
                frag_idx,
                fmsn,
                deadline,
            )?;
            offset += ops::parse_get_amp_map_cnf(&frag, wire_len, &mut map, offset)
                .map_err(|e| {
                    log::error!("confirmation parse failed: {e}");
                    Error::from(e)
                })?;
        }
        Ok(map)
    }

    /// Fire-and-forget: the device resets before it could confirm.
    pub fn reset_device_req_send(&self, mode: ResetMode) -> Result<(), Error> {
        let (packet, len) =
            ops::build_reset_device_req(&self.peer_mac, &self.nic_mac, mode)?;
        self.transmit(&packet, len)
    }

    pub fn d_link_terminate_req_send(&self, req_id: u16) -> Result<(), Error> {
        let (packet, len) =
            ops::build_d_link_terminate_req(&self.peer_mac, &self.nic_mac, req_id)?;
        self.transmit(&packet, len)
    }

    pub fn d_link_terminate_cnf_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<(), Error> {
        let packet =
            self.wait_pop(WireMsgId::DLinkTerminateCnf, req_id, timeout_ms)?;
        ops::parse_d_link_terminate_cnf(&packet).map_err(Error::from)
    }

    pub fn host_message_status_ind_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<HostMessageStatus, Error> {
        let packet =
            self.wait_pop(WireMsgId::HostMessageStatusInd, req_id, timeout_ms)?;
        ops::parse_host_message_status_ind(&packet).map_err(|e| {
            log::error!("indication parse failed: {e}");
            e.into()
        })
    }

    pub fn d_link_ready_ind_receive(
        &self,
        req_id: u16,
        timeout_ms: u32,
    ) -> Result<DLinkReady, Error> {
        let packet = self.wait_pop(WireMsgId::DLinkReadyInd, req_id, timeout_ms)?;
        ops::parse_d_link_ready_ind(&packet).map_err(|e| {
            log::error!("indication parse failed: {e}");
            e.into()
        })
    }
}
