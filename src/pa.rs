//! Counters queries (performance administration)
//!
//! The counters service is a vendor class reached through the primary
//! performance manager, which is located with two SA lookups: the PM's service
//! record, then a path to the GID it advertises. Every request carries the
//! vendor OUI in its class header.

use crate::mad::{
    Gid, MadHeader, RequestEnvelope, ResponseEnvelope, WireReader, WireRecord, WireWriter, MCLASS_VFI_PM, METHOD_GET,
    METHOD_GETTABLE, METHOD_SET, STL_OUI_BYTES, STL_PA_CLASS_VERSION,
};
use crate::sa::{ClassPortInfo, PathQuery, ServiceQuery, DEFAULT_PKEY, LIMITED_PKEY};
use crate::session::{PmAddress, ServiceState, Session};
use crate::transport::Destination;
use crate::{MadError, MadResult};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const PA_ATTR_CLASS_PORT_INFO: u16 = 0x0001;
pub const PA_ATTR_GRP_LIST: u16 = 0x00a0;
pub const PA_ATTR_GRP_INFO: u16 = 0x00a1;
pub const PA_ATTR_GRP_CFG: u16 = 0x00a2;
pub const PA_ATTR_PORT_CTRS: u16 = 0x00a3;
pub const PA_ATTR_CLR_PORT_CTRS: u16 = 0x00a4;
pub const PA_ATTR_CLR_ALL_PORT_CTRS: u16 = 0x00a5;
pub const PA_ATTR_PM_CONFIG: u16 = 0x00a6;
pub const PA_ATTR_FREEZE_IMAGE: u16 = 0x00a7;
pub const PA_ATTR_RELEASE_IMAGE: u16 = 0x00a8;
pub const PA_ATTR_RENEW_IMAGE: u16 = 0x00a9;
pub const PA_ATTR_FOCUS_PORTS: u16 = 0x00aa;
pub const PA_ATTR_IMAGE_INFO: u16 = 0x00ab;
pub const PA_ATTR_MOVE_FREEZE_FRAME: u16 = 0x00ac;
pub const PA_ATTR_VF_LIST: u16 = 0x00ad;
pub const PA_ATTR_VF_INFO: u16 = 0x00ae;
pub const PA_ATTR_VF_CONFIG: u16 = 0x00af;
pub const PA_ATTR_VF_PORT_CTRS: u16 = 0x00b0;
pub const PA_ATTR_CLR_VF_PORT_CTRS: u16 = 0x00b1;
pub const PA_ATTR_VF_FOCUS_PORTS: u16 = 0x00b2;
pub const PA_ATTR_GRP_LIST2: u16 = 0x00b7;
pub const PA_ATTR_VF_LIST2: u16 = 0x00b8;

pub const PA_STATUS_UNAVAILABLE: u16 = 0x0a00;
pub const PA_STATUS_NO_GROUP: u16 = 0x0b00;
pub const PA_STATUS_NO_PORT: u16 = 0x0c00;
pub const PA_STATUS_NO_VF: u16 = 0x0d00;
pub const PA_STATUS_INVALID_PARAMETER: u16 = 0x0e00;
pub const PA_STATUS_NO_IMAGE: u16 = 0x0f00;
pub const PA_STATUS_NO_DATA: u16 = 0x1000;
pub const PA_STATUS_BAD_DATA: u16 = 0x1100;

pub const PC_FLAG_DELTA: u32 = 0x0000_0001;
pub const PC_FLAG_UNEXPECTED_CLEAR: u32 = 0x0000_0002;
pub const PC_FLAG_USER_COUNTERS: u32 = 0x0000_0008;

/// Service id advertised by performance managers
pub const PM_SERVICE_ID: u64 = 0x1100_d03c_3484_5555;
/// Paths requested when locating the PM
pub const PM_PATH_COUNT: u8 = 32;

/// Selects every counter in a clear request
pub const COUNTER_SELECT_ALL: u32 = 0xffff_ffe0;

pub const GROUP_NAME_LEN: usize = 64;
pub const VF_NAME_LEN: usize = 64;
pub const NODE_DESC_LEN: usize = 64;

/// Utilization histogram buckets, 10% each
pub const UTIL_BUCKETS: usize = 10;
/// Error histogram buckets, 25% of threshold each plus one over threshold
pub const CATEGORY_BUCKETS: usize = 5;

pub const FOCUS_SELECT_UNEXPECTED_CLEAR: u32 = 0x0001_0101;
pub const FOCUS_SELECT_NO_RESPONSE: u32 = 0x0001_0102;
pub const FOCUS_SELECT_SKIPPED: u32 = 0x0001_0103;
pub const FOCUS_SELECT_UTIL_HIGH: u32 = 0x0002_0001;
pub const FOCUS_SELECT_UTIL_PKTS_HIGH: u32 = 0x0002_0082;
pub const FOCUS_SELECT_UTIL_LOW: u32 = 0x0002_0101;
pub const FOCUS_SELECT_INTEGRITY: u32 = 0x0003_0001;
pub const FOCUS_SELECT_CONGESTION: u32 = 0x0003_0002;
/// Largest port range a focus query may ask for
pub const FOCUS_MAX_RANGE: u32 = 300_000;

/// Map a non-zero counters-service status onto the error taxonomy
pub fn check_pa_status(status: u16) -> MadResult<()> {
    match status {
        0 => Ok(()),
        PA_STATUS_NO_GROUP | PA_STATUS_NO_PORT | PA_STATUS_NO_VF | PA_STATUS_NO_IMAGE | PA_STATUS_NO_DATA => {
            Err(MadError::not_found(pa_status_text(status)))
        }
        PA_STATUS_INVALID_PARAMETER => Err(MadError::invalid_parameter("PA rejected request parameters")),
        PA_STATUS_UNAVAILABLE => Err(MadError::unavailable("PA engine")),
        other => Err(MadError::error(format!("PA status 0x{:04x}: {}", other, pa_status_text(other)))),
    }
}

pub fn pa_status_text(status: u16) -> &'static str {
    match status {
        PA_STATUS_UNAVAILABLE => "Engine unavailable",
        PA_STATUS_NO_GROUP => "No such group",
        PA_STATUS_NO_PORT => "Port not found",
        PA_STATUS_NO_VF => "VF not found",
        PA_STATUS_INVALID_PARAMETER => "Invalid parameter",
        PA_STATUS_NO_IMAGE => "Image not found",
        PA_STATUS_NO_DATA => "No counter data",
        PA_STATUS_BAD_DATA => "Bad counter data",
        other => crate::mad::status_text(other),
    }
}

/// Identifies a sweep image; number 0 is the most recent sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ImageId {
    pub number: u64,
    pub offset: i32,
    pub time: u32,
}

impl ImageId {
    pub const CURRENT: ImageId = ImageId {
        number: 0,
        offset: 0,
        time: 0,
    };

    pub fn frozen(number: u64) -> Self {
        Self {
            number,
            ..Default::default()
        }
    }
}

impl WireRecord for ImageId {
    const SIZE: usize = 16;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        Ok(Self {
            number: r.u64()?,
            offset: r.i32()?,
            time: r.u32()?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.number).put_i32(self.offset).put_u32(self.time);
    }
}

/// One entry of a group or virtual fabric list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NameRecord {
    pub name: String,
}

impl WireRecord for NameRecord {
    const SIZE: usize = GROUP_NAME_LEN;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        Ok(Self {
            name: r.text(GROUP_NAME_LEN)?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_text(&self.name, GROUP_NAME_LEN);
    }
}

/// Group or virtual fabric list entry tagged with the image it came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageNameRecord {
    pub name: String,
    pub image_id: ImageId,
}

impl WireRecord for ImageNameRecord {
    const SIZE: usize = GROUP_NAME_LEN + ImageId::SIZE;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        Ok(Self {
            name: r.text(GROUP_NAME_LEN)?,
            image_id: ImageId::decode(r)?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_text(&self.name, GROUP_NAME_LEN);
        self.image_id.encode(w);
    }
}

/// A port that belongs to a group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupConfigRecord {
    pub image_id: ImageId,
    pub node_guid: u64,
    pub node_desc: String,
    pub node_lid: u32,
    pub port_number: u8,
}

impl WireRecord for GroupConfigRecord {
    const SIZE: usize = 96;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let image_id = ImageId::decode(r)?;
        let node_guid = r.u64()?;
        let node_desc = r.text(NODE_DESC_LEN)?;
        let node_lid = r.u32()?;
        let port_number = r.u8()?;
        r.skip(3)?;
        Ok(Self {
            image_id,
            node_guid,
            node_desc,
            node_lid,
            port_number,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        self.image_id.encode(w);
        w.put_u64(self.node_guid)
            .put_text(&self.node_desc, NODE_DESC_LEN)
            .put_u32(self.node_lid)
            .put_u8(self.port_number)
            .put_zeros(3);
    }
}

/// Counters of one port in one image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortCounters {
    pub node_lid: u32,
    pub port_number: u8,
    pub flags: u32,
    pub image_id: ImageId,
    pub port_xmit_data: u64,
    pub port_rcv_data: u64,
    pub port_xmit_pkts: u64,
    pub port_rcv_pkts: u64,
    pub port_multicast_xmit_pkts: u64,
    pub port_multicast_rcv_pkts: u64,
    pub local_link_integrity_errors: u64,
    pub fm_config_errors: u64,
    pub port_rcv_errors: u64,
    pub excessive_buffer_overruns: u64,
    pub port_rcv_constraint_errors: u64,
    pub port_rcv_switch_relay_errors: u64,
    pub port_xmit_discards: u64,
    pub port_xmit_constraint_errors: u64,
    pub port_rcv_remote_physical_errors: u64,
    pub sw_port_congestion: u64,
    pub port_xmit_wait: u64,
    pub port_rcv_fecn: u64,
    pub port_rcv_becn: u64,
    pub port_xmit_time_cong: u64,
    pub port_xmit_wasted_bw: u64,
    pub port_xmit_wait_data: u64,
    pub port_rcv_bubble: u64,
    pub port_mark_fecn: u64,
    pub link_error_recovery: u32,
    pub link_downed: u32,
    pub uncorrectable_errors: u8,
    pub num_lanes_down: u8,
    pub link_quality_indicator: u8,
}

impl PortCounters {
    fn counters_mut(&mut self) -> [&mut u64; 24] {
        [
            &mut self.port_xmit_data,
            &mut self.port_rcv_data,
            &mut self.port_xmit_pkts,
            &mut self.port_rcv_pkts,
            &mut self.port_multicast_xmit_pkts,
            &mut self.port_multicast_rcv_pkts,
            &mut self.local_link_integrity_errors,
            &mut self.fm_config_errors,
            &mut self.port_rcv_errors,
            &mut self.excessive_buffer_overruns,
            &mut self.port_rcv_constraint_errors,
            &mut self.port_rcv_switch_relay_errors,
            &mut self.port_xmit_discards,
            &mut self.port_xmit_constraint_errors,
            &mut self.port_rcv_remote_physical_errors,
            &mut self.sw_port_congestion,
            &mut self.port_xmit_wait,
            &mut self.port_rcv_fecn,
            &mut self.port_rcv_becn,
            &mut self.port_xmit_time_cong,
            &mut self.port_xmit_wasted_bw,
            &mut self.port_xmit_wait_data,
            &mut self.port_rcv_bubble,
            &mut self.port_mark_fecn,
        ]
    }

    fn counters(&self) -> [u64; 24] {
        [
            self.port_xmit_data,
            self.port_rcv_data,
            self.port_xmit_pkts,
            self.port_rcv_pkts,
            self.port_multicast_xmit_pkts,
            self.port_multicast_rcv_pkts,
            self.local_link_integrity_errors,
            self.fm_config_errors,
            self.port_rcv_errors,
            self.excessive_buffer_overruns,
            self.port_rcv_constraint_errors,
            self.port_rcv_switch_relay_errors,
            self.port_xmit_discards,
            self.port_xmit_constraint_errors,
            self.port_rcv_remote_physical_errors,
            self.sw_port_congestion,
            self.port_xmit_wait,
            self.port_rcv_fecn,
            self.port_rcv_becn,
            self.port_xmit_time_cong,
            self.port_xmit_wasted_bw,
            self.port_xmit_wait_data,
            self.port_rcv_bubble,
            self.port_mark_fecn,
        ]
    }
}

impl WireRecord for PortCounters {
    const SIZE: usize = 248;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let mut pc = PortCounters {
            node_lid: r.u32()?,
            port_number: r.u8()?,
            ..Default::default()
        };
        r.skip(3)?;
        pc.flags = r.u32()?;
        r.skip(12)?;
        pc.image_id = ImageId::decode(r)?;
        for counter in pc.counters_mut() {
            *counter = r.u64()?;
        }
        pc.link_error_recovery = r.u32()?;
        pc.link_downed = r.u32()?;
        pc.uncorrectable_errors = r.u8()?;
        let lq = r.u8()?;
        pc.num_lanes_down = lq >> 4;
        pc.link_quality_indicator = lq & 0x07;
        r.skip(6)?;
        Ok(pc)
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.node_lid)
            .put_u8(self.port_number)
            .put_zeros(3)
            .put_u32(self.flags)
            .put_zeros(12);
        self.image_id.encode(w);
        for counter in self.counters() {
            w.put_u64(counter);
        }
        w.put_u32(self.link_error_recovery)
            .put_u32(self.link_downed)
            .put_u8(self.uncorrectable_errors)
            .put_u8((self.num_lanes_down << 4) | (self.link_quality_indicator & 0x07))
            .put_zeros(6);
    }
}

/// Clear the selected counters of one port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearPortCounters {
    pub node_lid: u32,
    pub port_number: u8,
    pub select: u32,
}

impl WireRecord for ClearPortCounters {
    const SIZE: usize = 20;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let node_lid = r.u32()?;
        let port_number = r.u8()?;
        r.skip(11)?;
        Ok(Self {
            node_lid,
            port_number,
            select: r.u32()?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.node_lid)
            .put_u8(self.port_number)
            .put_zeros(11)
            .put_u32(self.select);
    }
}

/// Counter select mask echoed by a clear-all request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSelect {
    pub select: u32,
}

impl WireRecord for CounterSelect {
    const SIZE: usize = 4;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        Ok(Self { select: r.u32()? })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.select);
    }
}

/// Old and new image of a move-freeze request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MoveFreeze {
    pub old_image: ImageId,
    pub new_image: ImageId,
}

impl WireRecord for MoveFreeze {
    const SIZE: usize = 32;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        Ok(Self {
            old_image: ImageId::decode(r)?,
            new_image: ImageId::decode(r)?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        self.old_image.encode(w);
        self.new_image.encode(w);
    }
}

/// Subnet manager entry in an image summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SmInfo {
    pub lid: u32,
    pub priority: u8,
    pub state: u8,
    pub port_number: u8,
    pub port_guid: u64,
    pub node_desc: String,
}

impl WireRecord for SmInfo {
    const SIZE: usize = 80;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let lid = r.u32()?;
        let prio_state = r.u8()?;
        let port_number = r.u8()?;
        r.skip(2)?;
        Ok(Self {
            lid,
            priority: prio_state >> 4,
            state: prio_state & 0x0f,
            port_number,
            port_guid: r.u64()?,
            node_desc: r.text(NODE_DESC_LEN)?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.lid)
            .put_u8((self.priority << 4) | (self.state & 0x0f))
            .put_u8(self.port_number)
            .put_u16(0)
            .put_u64(self.port_guid)
            .put_text(&self.node_desc, NODE_DESC_LEN);
    }
}

/// Summary of a sweep image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub image_id: ImageId,
    pub sweep_start: u64,
    pub sweep_duration: u32,
    pub num_hfi_ports: u16,
    pub num_switch_nodes: u16,
    pub num_switch_ports: u32,
    pub num_links: u32,
    pub num_sms: u32,
    pub num_no_resp_nodes: u32,
    pub num_no_resp_ports: u32,
    pub num_skipped_nodes: u32,
    pub num_skipped_ports: u32,
    pub num_unexpected_clear_ports: u32,
    pub image_interval: u32,
    pub sm_info: [SmInfo; 2],
}

impl WireRecord for ImageInfo {
    const SIZE: usize = 232;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let image_id = ImageId::decode(r)?;
        let sweep_start = r.u64()?;
        let sweep_duration = r.u32()?;
        let num_hfi_ports = r.u16()?;
        r.skip(4)?;
        let num_switch_nodes = r.u16()?;
        Ok(Self {
            image_id,
            sweep_start,
            sweep_duration,
            num_hfi_ports,
            num_switch_nodes,
            num_switch_ports: r.u32()?,
            num_links: r.u32()?,
            num_sms: r.u32()?,
            num_no_resp_nodes: r.u32()?,
            num_no_resp_ports: r.u32()?,
            num_skipped_nodes: r.u32()?,
            num_skipped_ports: r.u32()?,
            num_unexpected_clear_ports: r.u32()?,
            image_interval: r.u32()?,
            sm_info: [SmInfo::decode(r)?, SmInfo::decode(r)?],
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        self.image_id.encode(w);
        w.put_u64(self.sweep_start)
            .put_u32(self.sweep_duration)
            .put_u16(self.num_hfi_ports)
            .put_zeros(4)
            .put_u16(self.num_switch_nodes)
            .put_u32(self.num_switch_ports)
            .put_u32(self.num_links)
            .put_u32(self.num_sms)
            .put_u32(self.num_no_resp_nodes)
            .put_u32(self.num_no_resp_ports)
            .put_u32(self.num_skipped_nodes)
            .put_u32(self.num_skipped_ports)
            .put_u32(self.num_unexpected_clear_ports)
            .put_u32(self.image_interval);
        for sm in &self.sm_info {
            sm.encode(w);
        }
    }
}

/// Bandwidth and packet-rate summary over a set of ports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UtilStats {
    pub total_mbps: u64,
    pub total_kpps: u64,
    pub avg_mbps: u32,
    pub min_mbps: u32,
    pub max_mbps: u32,
    pub num_bw_buckets: u32,
    pub bw_buckets: [u32; UTIL_BUCKETS],
    pub avg_kpps: u32,
    pub min_kpps: u32,
    pub max_kpps: u32,
    pub pma_no_resp_ports: u16,
    pub topo_incomp_ports: u16,
}

impl WireRecord for UtilStats {
    const SIZE: usize = 88;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let mut stats = UtilStats {
            total_mbps: r.u64()?,
            total_kpps: r.u64()?,
            avg_mbps: r.u32()?,
            min_mbps: r.u32()?,
            max_mbps: r.u32()?,
            num_bw_buckets: r.u32()?,
            ..Default::default()
        };
        for bucket in stats.bw_buckets.iter_mut() {
            *bucket = r.u32()?;
        }
        stats.avg_kpps = r.u32()?;
        stats.min_kpps = r.u32()?;
        stats.max_kpps = r.u32()?;
        stats.pma_no_resp_ports = r.u16()?;
        stats.topo_incomp_ports = r.u16()?;
        Ok(stats)
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.total_mbps)
            .put_u64(self.total_kpps)
            .put_u32(self.avg_mbps)
            .put_u32(self.min_mbps)
            .put_u32(self.max_mbps)
            .put_u32(self.num_bw_buckets);
        for bucket in self.bw_buckets {
            w.put_u32(bucket);
        }
        w.put_u32(self.avg_kpps)
            .put_u32(self.min_kpps)
            .put_u32(self.max_kpps)
            .put_u16(self.pma_no_resp_ports)
            .put_u16(self.topo_incomp_ports);
    }
}

/// Per-category error scores; used for thresholds and histogram buckets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub integrity_errors: u32,
    pub congestion: u32,
    pub sma_congestion: u32,
    pub bubble: u32,
    pub security_errors: u32,
    pub routing_errors: u32,
}

impl WireRecord for CategoryCounts {
    const SIZE: usize = 24;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        Ok(Self {
            integrity_errors: r.u32()?,
            congestion: r.u32()?,
            sma_congestion: r.u32()?,
            bubble: r.u32()?,
            security_errors: r.u32()?,
            routing_errors: r.u32()?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.integrity_errors)
            .put_u32(self.congestion)
            .put_u32(self.sma_congestion)
            .put_u32(self.bubble)
            .put_u32(self.security_errors)
            .put_u32(self.routing_errors);
    }
}

/// Worst category scores of a set of ports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategorySummary {
    pub maximums: CategoryCounts,
    /// Units of 10%
    pub utilization_pct10: u16,
    pub discards_pct10: u16,
}

impl WireRecord for CategorySummary {
    const SIZE: usize = 40;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let maximums = CategoryCounts::decode(r)?;
        let utilization_pct10 = r.u16()?;
        let discards_pct10 = r.u16()?;
        r.skip(12)?;
        Ok(Self {
            maximums,
            utilization_pct10,
            discards_pct10,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        self.maximums.encode(w);
        w.put_u16(self.utilization_pct10)
            .put_u16(self.discards_pct10)
            .put_zeros(12);
    }
}

/// Category maximums plus a histogram of ports per 25% of threshold; the
/// last bucket counts ports over threshold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub summary: CategorySummary,
    pub ports: [CategoryCounts; CATEGORY_BUCKETS],
}

impl WireRecord for CategoryStats {
    const SIZE: usize = CategorySummary::SIZE + CATEGORY_BUCKETS * CategoryCounts::SIZE;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let mut stats = CategoryStats {
            summary: CategorySummary::decode(r)?,
            ..Default::default()
        };
        for bucket in stats.ports.iter_mut() {
            *bucket = CategoryCounts::decode(r)?;
        }
        Ok(stats)
    }

    fn encode(&self, w: &mut WireWriter) {
        self.summary.encode(w);
        for bucket in &self.ports {
            bucket.encode(w);
        }
    }
}

/// Utilization and error summary of a group in one image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub group_name: String,
    pub image_id: ImageId,
    pub num_internal_ports: u32,
    pub num_external_ports: u32,
    pub internal_util: UtilStats,
    pub send_util: UtilStats,
    pub recv_util: UtilStats,
    pub internal_categories: CategoryStats,
    pub external_categories: CategoryStats,
    pub max_internal_rate: u8,
    pub min_internal_rate: u8,
    pub max_external_rate: u8,
    pub min_external_rate: u8,
    pub max_internal_mbps: u32,
    pub max_external_mbps: u32,
}

impl WireRecord for GroupInfo {
    const SIZE: usize = 684;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        Ok(Self {
            group_name: r.text(GROUP_NAME_LEN)?,
            image_id: ImageId::decode(r)?,
            num_internal_ports: r.u32()?,
            num_external_ports: r.u32()?,
            internal_util: UtilStats::decode(r)?,
            send_util: UtilStats::decode(r)?,
            recv_util: UtilStats::decode(r)?,
            internal_categories: CategoryStats::decode(r)?,
            external_categories: CategoryStats::decode(r)?,
            max_internal_rate: r.u8()?,
            min_internal_rate: r.u8()?,
            max_external_rate: r.u8()?,
            min_external_rate: r.u8()?,
            max_internal_mbps: r.u32()?,
            max_external_mbps: r.u32()?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_text(&self.group_name, GROUP_NAME_LEN);
        self.image_id.encode(w);
        w.put_u32(self.num_internal_ports).put_u32(self.num_external_ports);
        self.internal_util.encode(w);
        self.send_util.encode(w);
        self.recv_util.encode(w);
        self.internal_categories.encode(w);
        self.external_categories.encode(w);
        w.put_u8(self.max_internal_rate)
            .put_u8(self.min_internal_rate)
            .put_u8(self.max_external_rate)
            .put_u8(self.min_external_rate)
            .put_u32(self.max_internal_mbps)
            .put_u32(self.max_external_mbps);
    }
}

/// Runtime configuration of the performance manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PmConfig {
    pub sweep_interval: u32,
    pub max_clients: u32,
    pub size_history: u32,
    pub size_freeze: u32,
    pub lease: u32,
    pub pm_flags: u32,
    /// PortXmitWait, SwPortCongestion, PortRcvFECN, PortRcvBECN,
    /// PortXmitTimeCong, PortMarkFECN
    pub congestion_weights: [u8; 6],
    pub category_thresholds: CategoryCounts,
    /// LocalLinkIntegrity, PortRcv, ExcessiveBufferOverrun, LinkErrorRecovery,
    /// LinkDowned, Uncorrectable, FMConfig, LinkQuality, LinkWidthDowngrade
    pub integrity_weights: [u8; 9],
    pub memory_footprint: u64,
    pub max_attempts: u32,
    pub resp_timeout: u32,
    pub min_resp_timeout: u32,
    pub max_parallel_nodes: u32,
    pub pma_batch_size: u32,
    pub error_clear: u8,
}

impl WireRecord for PmConfig {
    const SIZE: usize = 104;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let mut cfg = PmConfig {
            sweep_interval: r.u32()?,
            max_clients: r.u32()?,
            size_history: r.u32()?,
            size_freeze: r.u32()?,
            lease: r.u32()?,
            pm_flags: r.u32()?,
            ..Default::default()
        };
        for weight in cfg.congestion_weights.iter_mut() {
            *weight = r.u8()?;
        }
        r.skip(2)?;
        cfg.category_thresholds = CategoryCounts::decode(r)?;
        for weight in cfg.integrity_weights.iter_mut() {
            *weight = r.u8()?;
        }
        r.skip(7)?;
        cfg.memory_footprint = r.u64()?;
        cfg.max_attempts = r.u32()?;
        cfg.resp_timeout = r.u32()?;
        cfg.min_resp_timeout = r.u32()?;
        cfg.max_parallel_nodes = r.u32()?;
        cfg.pma_batch_size = r.u32()?;
        cfg.error_clear = r.u8()?;
        r.skip(3)?;
        Ok(cfg)
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.sweep_interval)
            .put_u32(self.max_clients)
            .put_u32(self.size_history)
            .put_u32(self.size_freeze)
            .put_u32(self.lease)
            .put_u32(self.pm_flags);
        for weight in self.congestion_weights {
            w.put_u8(weight);
        }
        w.put_zeros(2);
        self.category_thresholds.encode(w);
        for weight in self.integrity_weights {
            w.put_u8(weight);
        }
        w.put_zeros(7)
            .put_u64(self.memory_footprint)
            .put_u32(self.max_attempts)
            .put_u32(self.resp_timeout)
            .put_u32(self.min_resp_timeout)
            .put_u32(self.max_parallel_nodes)
            .put_u32(self.pma_batch_size)
            .put_u8(self.error_clear)
            .put_zeros(3);
    }
}

/// Which ports a focus query ranks and which slice of the ranking it returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusSelect {
    pub select: u32,
    pub start: u32,
    pub range: u32,
}

impl FocusSelect {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.select).put_u32(self.start).put_u32(self.range);
    }

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        Ok(Self {
            select: r.u32()?,
            start: r.u32()?,
            range: r.u32()?,
        })
    }

    fn validate(&self) -> MadResult<()> {
        if self.range > FOCUS_MAX_RANGE {
            return Err(MadError::invalid_parameter(format!(
                "focus range {} exceeds {}",
                self.range, FOCUS_MAX_RANGE
            )));
        }
        Ok(())
    }
}

/// Focus request for a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusRequest {
    pub group_name: String,
    pub image_id: ImageId,
    pub focus: FocusSelect,
}

impl WireRecord for FocusRequest {
    const SIZE: usize = 92;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        Ok(Self {
            group_name: r.text(GROUP_NAME_LEN)?,
            image_id: ImageId::decode(r)?,
            focus: FocusSelect::decode(r)?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_text(&self.group_name, GROUP_NAME_LEN);
        self.image_id.encode(w);
        self.focus.encode(w);
    }
}

/// Focus request for a virtual fabric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfFocusRequest {
    pub vf_name: String,
    pub image_id: ImageId,
    pub focus: FocusSelect,
}

impl WireRecord for VfFocusRequest {
    const SIZE: usize = 100;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let vf_name = r.text(VF_NAME_LEN)?;
        r.skip(8)?;
        Ok(Self {
            vf_name,
            image_id: ImageId::decode(r)?,
            focus: FocusSelect::decode(r)?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_text(&self.vf_name, VF_NAME_LEN).put_zeros(8);
        self.image_id.encode(w);
        self.focus.encode(w);
    }
}

/// One ranked port of a focus response, with its link neighbor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FocusPort {
    pub image_id: ImageId,
    pub node_lid: u32,
    pub port_number: u8,
    pub rate: u8,
    pub max_vl_mtu: u8,
    pub local_status: u8,
    pub neighbor_status: u8,
    /// Value the ports were ranked by
    pub value: u64,
    pub node_guid: u64,
    pub node_desc: String,
    pub neighbor_lid: u32,
    pub neighbor_port_number: u8,
    pub neighbor_value: u64,
    pub neighbor_guid: u64,
    pub neighbor_node_desc: String,
}

impl WireRecord for FocusPort {
    const SIZE: usize = 192;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let image_id = ImageId::decode(r)?;
        let node_lid = r.u32()?;
        let port_number = r.u8()?;
        let rate = r.u8()?;
        let max_vl_mtu = r.u8()?;
        let status = r.u8()?;
        let value = r.u64()?;
        let node_guid = r.u64()?;
        let node_desc = r.text(NODE_DESC_LEN)?;
        let neighbor_lid = r.u32()?;
        let neighbor_port_number = r.u8()?;
        r.skip(3)?;
        Ok(Self {
            image_id,
            node_lid,
            port_number,
            rate: rate & 0x1f,
            max_vl_mtu: max_vl_mtu & 0x0f,
            local_status: status >> 4,
            neighbor_status: status & 0x0f,
            value,
            node_guid,
            node_desc,
            neighbor_lid,
            neighbor_port_number,
            neighbor_value: r.u64()?,
            neighbor_guid: r.u64()?,
            neighbor_node_desc: r.text(NODE_DESC_LEN)?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        self.image_id.encode(w);
        w.put_u32(self.node_lid)
            .put_u8(self.port_number)
            .put_u8(self.rate & 0x1f)
            .put_u8(self.max_vl_mtu & 0x0f)
            .put_u8((self.local_status << 4) | (self.neighbor_status & 0x0f))
            .put_u64(self.value)
            .put_u64(self.node_guid)
            .put_text(&self.node_desc, NODE_DESC_LEN)
            .put_u32(self.neighbor_lid)
            .put_u8(self.neighbor_port_number)
            .put_zeros(3)
            .put_u64(self.neighbor_value)
            .put_u64(self.neighbor_guid)
            .put_text(&self.neighbor_node_desc, NODE_DESC_LEN);
    }
}

/// Utilization and error summary of a virtual fabric in one image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VfInfo {
    pub vf_name: String,
    pub image_id: ImageId,
    pub num_ports: u32,
    pub internal_util: UtilStats,
    pub internal_categories: CategoryStats,
    pub max_internal_rate: u8,
    pub min_internal_rate: u8,
    pub max_internal_mbps: u32,
}

impl WireRecord for VfInfo {
    const SIZE: usize = 346;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let vf_name = r.text(VF_NAME_LEN)?;
        r.skip(8)?;
        Ok(Self {
            vf_name,
            image_id: ImageId::decode(r)?,
            num_ports: r.u32()?,
            internal_util: UtilStats::decode(r)?,
            internal_categories: CategoryStats::decode(r)?,
            max_internal_rate: r.u8()?,
            min_internal_rate: r.u8()?,
            max_internal_mbps: r.u32()?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_text(&self.vf_name, VF_NAME_LEN).put_zeros(8);
        self.image_id.encode(w);
        w.put_u32(self.num_ports);
        self.internal_util.encode(w);
        self.internal_categories.encode(w);
        w.put_u8(self.max_internal_rate)
            .put_u8(self.min_internal_rate)
            .put_u32(self.max_internal_mbps);
    }
}

/// Virtual fabric name and image of a VF config request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VfImageRequest {
    pub vf_name: String,
    pub image_id: ImageId,
}

impl WireRecord for VfImageRequest {
    const SIZE: usize = 88;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let vf_name = r.text(VF_NAME_LEN)?;
        r.skip(8)?;
        Ok(Self {
            vf_name,
            image_id: ImageId::decode(r)?,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_text(&self.vf_name, VF_NAME_LEN).put_zeros(8);
        self.image_id.encode(w);
    }
}

/// Per-VF counters of one port in one image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VfPortCounters {
    pub node_lid: u32,
    pub port_number: u8,
    pub flags: u32,
    pub vf_name: String,
    pub image_id: ImageId,
    pub port_vf_xmit_data: u64,
    pub port_vf_rcv_data: u64,
    pub port_vf_xmit_pkts: u64,
    pub port_vf_rcv_pkts: u64,
    pub port_vf_xmit_discards: u64,
    pub sw_port_vf_congestion: u64,
    pub port_vf_xmit_wait: u64,
    pub port_vf_rcv_fecn: u64,
    pub port_vf_rcv_becn: u64,
    pub port_vf_xmit_time_cong: u64,
    pub port_vf_xmit_wasted_bw: u64,
    pub port_vf_xmit_wait_data: u64,
    pub port_vf_rcv_bubble: u64,
    pub port_vf_mark_fecn: u64,
}

impl VfPortCounters {
    fn counters_mut(&mut self) -> [&mut u64; 14] {
        [
            &mut self.port_vf_xmit_data,
            &mut self.port_vf_rcv_data,
            &mut self.port_vf_xmit_pkts,
            &mut self.port_vf_rcv_pkts,
            &mut self.port_vf_xmit_discards,
            &mut self.sw_port_vf_congestion,
            &mut self.port_vf_xmit_wait,
            &mut self.port_vf_rcv_fecn,
            &mut self.port_vf_rcv_becn,
            &mut self.port_vf_xmit_time_cong,
            &mut self.port_vf_xmit_wasted_bw,
            &mut self.port_vf_xmit_wait_data,
            &mut self.port_vf_rcv_bubble,
            &mut self.port_vf_mark_fecn,
        ]
    }

    fn counters(&self) -> [u64; 14] {
        [
            self.port_vf_xmit_data,
            self.port_vf_rcv_data,
            self.port_vf_xmit_pkts,
            self.port_vf_rcv_pkts,
            self.port_vf_xmit_discards,
            self.sw_port_vf_congestion,
            self.port_vf_xmit_wait,
            self.port_vf_rcv_fecn,
            self.port_vf_rcv_becn,
            self.port_vf_xmit_time_cong,
            self.port_vf_xmit_wasted_bw,
            self.port_vf_xmit_wait_data,
            self.port_vf_rcv_bubble,
            self.port_vf_mark_fecn,
        ]
    }
}

impl WireRecord for VfPortCounters {
    const SIZE: usize = 224;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let mut pc = VfPortCounters {
            node_lid: r.u32()?,
            port_number: r.u8()?,
            ..Default::default()
        };
        r.skip(3)?;
        pc.flags = r.u32()?;
        r.skip(12)?;
        pc.vf_name = r.text(VF_NAME_LEN)?;
        r.skip(8)?;
        pc.image_id = ImageId::decode(r)?;
        for counter in pc.counters_mut() {
            *counter = r.u64()?;
        }
        Ok(pc)
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.node_lid)
            .put_u8(self.port_number)
            .put_zeros(3)
            .put_u32(self.flags)
            .put_zeros(12)
            .put_text(&self.vf_name, VF_NAME_LEN)
            .put_zeros(8);
        self.image_id.encode(w);
        for counter in self.counters() {
            w.put_u64(counter);
        }
    }
}

/// Clear the selected per-VF counters of one port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearVfPortCounters {
    pub node_lid: u32,
    pub port_number: u8,
    pub vf_name: String,
    pub select: u32,
}

impl WireRecord for ClearVfPortCounters {
    const SIZE: usize = 96;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let node_lid = r.u32()?;
        let port_number = r.u8()?;
        r.skip(11)?;
        let vf_name = r.text(VF_NAME_LEN)?;
        r.skip(8)?;
        let select = r.u32()?;
        r.skip(4)?;
        Ok(Self {
            node_lid,
            port_number,
            vf_name,
            select,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.node_lid)
            .put_u8(self.port_number)
            .put_zeros(11)
            .put_text(&self.vf_name, VF_NAME_LEN)
            .put_zeros(8)
            .put_u32(self.select)
            .put_zeros(4);
    }
}

/// Pick the PM path: the last record (other than the first) on the default
/// partition, else the first record
fn choose_pm_path(pkeys: &[u16]) -> usize {
    (1..pkeys.len())
        .rev()
        .find(|&ix| pkeys[ix] & LIMITED_PKEY == LIMITED_PKEY)
        .unwrap_or(0)
}

impl Session {
    /// Locate the primary PM through the SA and cache its address
    pub fn pa_connect(&mut self) -> MadResult<PmAddress> {
        match self.discover_pm() {
            Ok(pm) => {
                info!("Primary PM at LID 0x{:x} SL {}", pm.lid, pm.sl);
                self.cache().set_primary_pm(Some(pm));
                self.cache().set_pa_state(ServiceState::Operational);
                Ok(pm)
            }
            Err(e) => {
                warn!("PM discovery failed: {}", e);
                self.cache().set_primary_pm(None);
                self.cache().set_pa_state(ServiceState::Unavailable);
                Err(match e {
                    MadError::Protection { .. } => e,
                    other => MadError::unavailable(format!("performance manager ({})", other)),
                })
            }
        }
    }

    fn discover_pm(&mut self) -> MadResult<PmAddress> {
        let services = self.sa_service_records(&ServiceQuery::ServiceId(PM_SERVICE_ID))?;
        let master = services
            .iter()
            .find(|s| s.service_data8[0] >= 1 && s.service_data8[1] == 1)
            .ok_or_else(|| MadError::not_found("master PM service record"))?;
        debug!("Master PM advertises GID {}", master.service_gid);

        let port = self.cache().address().port;
        let own_gid = Gid {
            prefix: port.gid_prefix,
            interface_id: port.port_guid,
        };
        let query = PathQuery::between(own_gid, master.service_gid)
            .with_service_id(PM_SERVICE_ID)
            .with_num_paths(PM_PATH_COUNT);
        let paths = self.sa_path_records(&query)?;
        if paths.is_empty() {
            return Err(MadError::not_found("path to PM"));
        }
        let pkeys: Vec<u16> = paths.iter().map(|p| p.pkey).collect();
        let path = &paths[choose_pm_path(&pkeys)];
        let lid = path.dgid.extended_lid().unwrap_or(path.dlid as u32);
        Ok(PmAddress { lid, sl: path.sl })
    }

    pub fn pa_class_port_info(&mut self) -> MadResult<ClassPortInfo> {
        self.pa_query(METHOD_GET, PA_ATTR_CLASS_PORT_INFO, 0, Vec::new())?.single()
    }

    pub fn pa_group_list(&mut self) -> MadResult<Vec<String>> {
        let resp = self.pa_query(METHOD_GETTABLE, PA_ATTR_GRP_LIST, 0, Vec::new())?;
        Ok(resp.records::<NameRecord>()?.into_iter().map(|r| r.name).collect())
    }

    pub fn pa_group_list2(&mut self, image: ImageId) -> MadResult<Vec<ImageNameRecord>> {
        let payload = ImageNameRecord {
            name: String::new(),
            image_id: image,
        }
        .to_bytes();
        self.pa_query(METHOD_GETTABLE, PA_ATTR_GRP_LIST2, 0, payload)?.records()
    }

    pub fn pa_vf_list(&mut self) -> MadResult<Vec<String>> {
        let resp = self.pa_query(METHOD_GETTABLE, PA_ATTR_VF_LIST, 0, Vec::new())?;
        Ok(resp.records::<NameRecord>()?.into_iter().map(|r| r.name).collect())
    }

    pub fn pa_vf_list2(&mut self, image: ImageId) -> MadResult<Vec<ImageNameRecord>> {
        let payload = ImageNameRecord {
            name: String::new(),
            image_id: image,
        }
        .to_bytes();
        self.pa_query(METHOD_GETTABLE, PA_ATTR_VF_LIST2, 0, payload)?.records()
    }

    /// Ports that make up a group in the given image
    pub fn pa_group_config(&mut self, group: &str, image: ImageId) -> MadResult<Vec<GroupConfigRecord>> {
        let payload = ImageNameRecord {
            name: group.to_string(),
            image_id: image,
        }
        .to_bytes();
        self.pa_query(METHOD_GETTABLE, PA_ATTR_GRP_CFG, 0, payload)?.records()
    }

    pub fn pa_port_counters(
        &mut self,
        lid: u32,
        port: u8,
        delta: bool,
        user: bool,
        image: ImageId,
    ) -> MadResult<PortCounters> {
        let mut flags = 0;
        if delta {
            flags |= PC_FLAG_DELTA;
        }
        if user {
            flags |= PC_FLAG_USER_COUNTERS;
        }
        let request = PortCounters {
            node_lid: lid,
            port_number: port,
            flags,
            image_id: image,
            ..Default::default()
        };
        self.pa_query(METHOD_GET, PA_ATTR_PORT_CTRS, 0, request.to_bytes())?.single()
    }

    pub fn pa_clear_port_counters(&mut self, lid: u32, port: u8, select: u32) -> MadResult<ClearPortCounters> {
        let request = ClearPortCounters {
            node_lid: lid,
            port_number: port,
            select,
        };
        self.pa_query(METHOD_SET, PA_ATTR_CLR_PORT_CTRS, 0, request.to_bytes())?.single()
    }

    pub fn pa_clear_all_port_counters(&mut self, select: u32) -> MadResult<CounterSelect> {
        let request = CounterSelect { select };
        self.pa_query(METHOD_SET, PA_ATTR_CLR_ALL_PORT_CTRS, 0, request.to_bytes())?.single()
    }

    pub fn pa_image_info(&mut self, image: ImageId) -> MadResult<ImageInfo> {
        let request = ImageInfo {
            image_id: image,
            ..Default::default()
        };
        self.pa_query(METHOD_GET, PA_ATTR_IMAGE_INFO, 0, request.to_bytes())?.single()
    }

    /// Freeze an image so it survives later sweeps; returns the frozen id
    pub fn pa_freeze_image(&mut self, image: ImageId) -> MadResult<ImageId> {
        self.pa_query(METHOD_SET, PA_ATTR_FREEZE_IMAGE, 0, image.to_bytes())?.single()
    }

    pub fn pa_release_image(&mut self, image: ImageId) -> MadResult<ImageId> {
        self.pa_query(METHOD_SET, PA_ATTR_RELEASE_IMAGE, 0, image.to_bytes())?.single()
    }

    pub fn pa_renew_image(&mut self, image: ImageId) -> MadResult<ImageId> {
        self.pa_query(METHOD_SET, PA_ATTR_RENEW_IMAGE, 0, image.to_bytes())?.single()
    }

    pub fn pa_move_freeze(&mut self, old_image: ImageId, new_image: ImageId) -> MadResult<MoveFreeze> {
        let request = MoveFreeze { old_image, new_image };
        self.pa_query(METHOD_SET, PA_ATTR_MOVE_FREEZE_FRAME, 0, request.to_bytes())?.single()
    }

    /// Utilization and error summary of a group
    pub fn pa_group_info(&mut self, group: &str, image: ImageId) -> MadResult<Vec<GroupInfo>> {
        let request = GroupInfo {
            group_name: group.to_string(),
            image_id: image,
            ..Default::default()
        };
        self.pa_query(METHOD_GETTABLE, PA_ATTR_GRP_INFO, 0, request.to_bytes())?.records()
    }

    pub fn pa_pm_config(&mut self) -> MadResult<PmConfig> {
        self.pa_query(METHOD_GET, PA_ATTR_PM_CONFIG, 0, Vec::new())?.single()
    }

    /// Ports of a group ranked by `focus.select`
    pub fn pa_group_focus(&mut self, group: &str, image: ImageId, focus: FocusSelect) -> MadResult<Vec<FocusPort>> {
        focus.validate()?;
        let request = FocusRequest {
            group_name: group.to_string(),
            image_id: image,
            focus,
        };
        self.pa_query(METHOD_GETTABLE, PA_ATTR_FOCUS_PORTS, 0, request.to_bytes())?.records()
    }

    pub fn pa_vf_info(&mut self, vf: &str, image: ImageId) -> MadResult<Vec<VfInfo>> {
        let request = VfInfo {
            vf_name: vf.to_string(),
            image_id: image,
            ..Default::default()
        };
        self.pa_query(METHOD_GETTABLE, PA_ATTR_VF_INFO, 0, request.to_bytes())?.records()
    }

    /// Ports that carry a virtual fabric in the given image
    pub fn pa_vf_config(&mut self, vf: &str, image: ImageId) -> MadResult<Vec<GroupConfigRecord>> {
        let request = VfImageRequest {
            vf_name: vf.to_string(),
            image_id: image,
        };
        self.pa_query(METHOD_GETTABLE, PA_ATTR_VF_CONFIG, 0, request.to_bytes())?.records()
    }

    pub fn pa_vf_port_counters(
        &mut self,
        vf: &str,
        lid: u32,
        port: u8,
        delta: bool,
        user: bool,
        image: ImageId,
    ) -> MadResult<VfPortCounters> {
        let mut flags = 0;
        if delta {
            flags |= PC_FLAG_DELTA;
        }
        if user {
            flags |= PC_FLAG_USER_COUNTERS;
        }
        let request = VfPortCounters {
            node_lid: lid,
            port_number: port,
            flags,
            vf_name: vf.to_string(),
            image_id: image,
            ..Default::default()
        };
        self.pa_query(METHOD_GET, PA_ATTR_VF_PORT_CTRS, 0, request.to_bytes())?.single()
    }

    pub fn pa_clear_vf_port_counters(&mut self, vf: &str, lid: u32, port: u8, select: u32) -> MadResult<ClearVfPortCounters> {
        let request = ClearVfPortCounters {
            node_lid: lid,
            port_number: port,
            vf_name: vf.to_string(),
            select,
        };
        self.pa_query(METHOD_SET, PA_ATTR_CLR_VF_PORT_CTRS, 0, request.to_bytes())?.single()
    }

    /// Ports of a virtual fabric ranked by `focus.select`
    pub fn pa_vf_focus(&mut self, vf: &str, image: ImageId, focus: FocusSelect) -> MadResult<Vec<FocusPort>> {
        focus.validate()?;
        let request = VfFocusRequest {
            vf_name: vf.to_string(),
            image_id: image,
            focus,
        };
        self.pa_query(METHOD_GETTABLE, PA_ATTR_VF_FOCUS_PORTS, 0, request.to_bytes())?.records()
    }

    pub(crate) fn pa_query(&mut self, method: u8, attr_id: u16, attr_mod: u32, payload: Vec<u8>) -> MadResult<ResponseEnvelope> {
        self.ensure_port_active()?;
        let dest = if self.is_native() {
            let port = self.cache().address().port;
            if !port.pkeys.contains(&DEFAULT_PKEY) {
                return Err(MadError::Protection { pkey: DEFAULT_PKEY });
            }
            let pm = match (self.cache().pa_state(), self.cache().address().primary_pm) {
                (ServiceState::Operational, Some(pm)) => pm,
                _ => self.pa_connect()?,
            };
            Destination::gsi(pm.lid, pm.sl, DEFAULT_PKEY)
        } else {
            Destination::default()
        };

        let request = RequestEnvelope::new(MadHeader::new(MCLASS_VFI_PM, STL_PA_CLASS_VERSION, method, attr_id))
            .with_attr_mod(attr_mod)
            .with_vendor_oui(STL_OUI_BYTES)
            .with_payload(payload);
        let (timeout_ms, retries) = (self.timeout_ms(), self.retry_count());
        match self.exchange(&request, &dest, timeout_ms, retries) {
            Ok(resp) => {
                check_pa_status(resp.status())?;
                Ok(resp)
            }
            Err(e) => {
                if self.is_native() && !matches!(e, MadError::Protection { .. } | MadError::InvalidParameter { .. }) {
                    warn!("PA query 0x{:02x} failed ({}), marking PA down", attr_id, e);
                    self.cache().set_pa_state(ServiceState::Down);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(ImageId::default().to_bytes().len(), ImageId::SIZE);
        assert_eq!(ImageNameRecord::default().to_bytes().len(), 80);
        assert_eq!(GroupConfigRecord::default().to_bytes().len(), GroupConfigRecord::SIZE);
        assert_eq!(PortCounters::default().to_bytes().len(), PortCounters::SIZE);
        assert_eq!(ClearPortCounters::default().to_bytes().len(), ClearPortCounters::SIZE);
        assert_eq!(MoveFreeze::default().to_bytes().len(), MoveFreeze::SIZE);
        assert_eq!(ImageInfo::default().to_bytes().len(), ImageInfo::SIZE);
    }

    #[test]
    fn test_status_mapping() {
        for status in [PA_STATUS_NO_GROUP, PA_STATUS_NO_PORT, PA_STATUS_NO_VF, PA_STATUS_NO_IMAGE, PA_STATUS_NO_DATA] {
            assert!(matches!(check_pa_status(status), Err(MadError::NotFound { .. })));
        }
        assert!(matches!(check_pa_status(PA_STATUS_INVALID_PARAMETER), Err(MadError::InvalidParameter { .. })));
        assert!(matches!(check_pa_status(PA_STATUS_UNAVAILABLE), Err(MadError::Unavailable { .. })));
        assert!(matches!(check_pa_status(PA_STATUS_BAD_DATA), Err(MadError::Error { .. })));
        assert!(matches!(check_pa_status(0x7700), Err(MadError::Error { .. })));
        assert!(check_pa_status(0).is_ok());
    }

    #[test]
    fn test_port_counters_layout() {
        let pc = PortCounters {
            node_lid: 3,
            port_number: 1,
            flags: PC_FLAG_DELTA,
            port_xmit_data: 0x1122_3344_5566_7788,
            port_mark_fecn: 9,
            link_downed: 2,
            num_lanes_down: 1,
            link_quality_indicator: 5,
            ..Default::default()
        };
        let raw = pc.to_bytes();
        assert_eq!(&raw[40..48], &0x1122_3344_5566_7788u64.to_be_bytes());
        assert_eq!(raw[241], 0x15);
        assert_eq!(PortCounters::decode(&mut WireReader::new(&raw)).unwrap(), pc);
    }

    #[test]
    fn test_image_info_sm_entries() {
        let mut info = ImageInfo {
            image_id: ImageId::frozen(12),
            num_sms: 2,
            ..Default::default()
        };
        info.sm_info[1] = SmInfo {
            lid: 7,
            priority: 3,
            state: 2,
            node_desc: "standby sm".to_string(),
            ..Default::default()
        };
        let raw = info.to_bytes();
        assert_eq!(raw[72 + 80 + 4], 0x32);
        assert_eq!(ImageInfo::decode(&mut WireReader::new(&raw)).unwrap(), info);
    }

    #[test]
    fn test_analysis_record_sizes() {
        assert_eq!(UtilStats::default().to_bytes().len(), UtilStats::SIZE);
        assert_eq!(CategoryStats::default().to_bytes().len(), 160);
        assert_eq!(GroupInfo::default().to_bytes().len(), GroupInfo::SIZE);
        assert_eq!(PmConfig::default().to_bytes().len(), PmConfig::SIZE);
        assert_eq!(FocusPort::default().to_bytes().len(), FocusPort::SIZE);
        assert_eq!(VfInfo::default().to_bytes().len(), VfInfo::SIZE);
        assert_eq!(VfImageRequest::default().to_bytes().len(), VfImageRequest::SIZE);
        assert_eq!(VfPortCounters::default().to_bytes().len(), VfPortCounters::SIZE);
        assert_eq!(ClearVfPortCounters::default().to_bytes().len(), ClearVfPortCounters::SIZE);
        let focus = FocusSelect {
            select: FOCUS_SELECT_UTIL_HIGH,
            start: 0,
            range: 10,
        };
        let group = FocusRequest {
            group_name: "All".to_string(),
            image_id: ImageId::default(),
            focus,
        };
        assert_eq!(group.to_bytes().len(), FocusRequest::SIZE);
        let vf = VfFocusRequest {
            vf_name: "Default".to_string(),
            image_id: ImageId::default(),
            focus,
        };
        assert_eq!(vf.to_bytes().len(), VfFocusRequest::SIZE);
    }

    #[test]
    fn test_focus_port_status_nibbles() {
        let port = FocusPort {
            node_lid: 2,
            port_number: 7,
            rate: 15,
            local_status: 0x1,
            neighbor_status: 0x2,
            value: 42,
            node_desc: "edge switch 01".to_string(),
            neighbor_node_desc: "host01 hfi1_0".to_string(),
            ..Default::default()
        };
        let raw = port.to_bytes();
        assert_eq!(raw[ImageId::SIZE + 7], 0x12);
        assert_eq!(&raw[24..32], &42u64.to_be_bytes());
        assert_eq!(FocusPort::decode(&mut WireReader::new(&raw)).unwrap(), port);
    }

    #[test]
    fn test_focus_range_limit() {
        let mut focus = FocusSelect {
            select: FOCUS_SELECT_CONGESTION,
            start: 0,
            range: FOCUS_MAX_RANGE,
        };
        assert!(focus.validate().is_ok());
        focus.range += 1;
        assert!(matches!(focus.validate(), Err(MadError::InvalidParameter { .. })));
    }

    #[test]
    fn test_pm_config_weights() {
        let config = PmConfig {
            sweep_interval: 10,
            congestion_weights: [10, 5, 5, 5, 5, 5],
            integrity_weights: [4, 100, 100, 100, 25, 100, 25, 40, 10],
            error_clear: 8,
            ..Default::default()
        };
        let raw = config.to_bytes();
        assert_eq!(&raw[0..4], &10u32.to_be_bytes());
        assert_eq!(raw[PmConfig::SIZE - 4], 8);
        assert_eq!(PmConfig::decode(&mut WireReader::new(&raw)).unwrap(), config);
    }

    #[test]
    fn test_pm_path_choice() {
        assert_eq!(choose_pm_path(&[0x8001]), 0);
        assert_eq!(choose_pm_path(&[0x8001, 0xffff, 0x8002]), 1);
        assert_eq!(choose_pm_path(&[0xffff, 0x8001, 0x7fff, 0xffff]), 3);
        assert_eq!(choose_pm_path(&[0xffff, 0x8001]), 0);
    }
}
