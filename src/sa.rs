//! Directory queries (subnet administration)
//!
//! Typed record layouts for the subnet administrator plus the query operations
//! a [`Session`] exposes for them. Table queries use GETTABLE and decode every
//! record the response carries. A query the SA answers with NO_RECORDS fails
//! with [`MadError::NotFound`].

use crate::mad::{
    Gid, MadHeader, RequestEnvelope, ResponseEnvelope, WireReader, WireRecord, WireWriter, MAD_STATUS_BUSY,
    MAD_STATUS_UNSUPPORTED_CLASS_VER, MAD_STATUS_UNSUPPORTED_METHOD, MAD_STATUS_UNSUPPORTED_METHOD_ATTRIB,
    MAD_STATUS_INVALID_ATTRIB, MCLASS_SUBN_ADM, METHOD_GET, METHOD_GETTABLE, STL_SA_CLASS_VERSION,
};
use crate::session::{ServiceState, Session};
use crate::transport::Destination;
use crate::{MadError, MadResult};
use serde::Serialize;
use tracing::{debug, warn};

pub const SA_ATTR_CLASS_PORT_INFO: u16 = 0x0001;
pub const SA_ATTR_NOTICE: u16 = 0x0002;
pub const SA_ATTR_INFORM_INFO: u16 = 0x0003;
pub const SA_ATTR_NODE_RECORD: u16 = 0x0011;
pub const SA_ATTR_SERVICE_RECORD: u16 = 0x0031;
pub const SA_ATTR_PATH_RECORD: u16 = 0x0035;
pub const SA_ATTR_MCMEMBER_RECORD: u16 = 0x0038;
pub const SA_ATTR_MULTIPATH_RECORD: u16 = 0x003a;
pub const SA_ATTR_INFORM_INFO_RECORD: u16 = 0x00f3;

pub const SA_STATUS_NO_RESOURCES: u16 = 0x0100;
pub const SA_STATUS_REQ_INVALID: u16 = 0x0200;
pub const SA_STATUS_NO_RECORDS: u16 = 0x0300;
pub const SA_STATUS_TOO_MANY_RECORDS: u16 = 0x0400;
pub const SA_STATUS_INVALID_GID: u16 = 0x0500;
pub const SA_STATUS_INSUFFICIENT_COMPONENTS: u16 = 0x0600;

pub const NODE_COMP_LID: u64 = 0x0000_0001;
pub const NODE_COMP_NODETYPE: u64 = 0x0000_0010;
pub const NODE_COMP_SYSIMAGEGUID: u64 = 0x0000_0080;
pub const NODE_COMP_NODEGUID: u64 = 0x0000_0100;
pub const NODE_COMP_PORTGUID: u64 = 0x0000_0200;
pub const NODE_COMP_NODEDESC: u64 = 0x0000_8000;

pub const SERVICE_COMP_SERVICEID: u64 = 0x0000_0001;

pub const PATH_COMP_SERVICEID: u64 = 0x0000_0003;
pub const PATH_COMP_DGID: u64 = 0x0000_0004;
pub const PATH_COMP_SGID: u64 = 0x0000_0008;
pub const PATH_COMP_REVERSIBLE: u64 = 0x0000_0800;
pub const PATH_COMP_NUMBPATH: u64 = 0x0000_1000;
pub const PATH_COMP_PKEY: u64 = 0x0000_2000;

pub const DEFAULT_PKEY: u16 = 0xffff;
pub const LIMITED_PKEY: u16 = 0x7fff;

/// Timeout used when probing an SA whose state is not known to be good
pub const SA_PING_TIMEOUT_MS: u64 = 250;

pub const NODE_TYPE_FI: u8 = 1;
pub const NODE_TYPE_SWITCH: u8 = 2;

/// Bytes between records when a record of `size` is carried in a table
pub fn table_stride(size: usize) -> usize {
    (size + 7) & !7
}

/// Attributes a limited-management member may still query
fn allowed_with_limited_pkey(attr_id: u16) -> bool {
    matches!(
        attr_id,
        SA_ATTR_PATH_RECORD
            | SA_ATTR_MULTIPATH_RECORD
            | SA_ATTR_NODE_RECORD
            | SA_ATTR_INFORM_INFO
            | SA_ATTR_INFORM_INFO_RECORD
            | SA_ATTR_NOTICE
            | SA_ATTR_SERVICE_RECORD
            | SA_ATTR_MCMEMBER_RECORD
            | SA_ATTR_CLASS_PORT_INFO
    )
}

/// Choose the partition key for an SA request from the local key table
pub fn sa_pkey(pkeys: &[u16], attr_id: u16) -> MadResult<u16> {
    if pkeys.contains(&DEFAULT_PKEY) {
        Ok(DEFAULT_PKEY)
    } else if allowed_with_limited_pkey(attr_id) && pkeys.contains(&LIMITED_PKEY) {
        Ok(LIMITED_PKEY)
    } else {
        Err(MadError::Protection { pkey: DEFAULT_PKEY })
    }
}

/// Map a non-zero SA status onto the error taxonomy
pub fn check_sa_status(status: u16) -> MadResult<()> {
    match status {
        0 => Ok(()),
        SA_STATUS_NO_RECORDS => Err(MadError::not_found("SA records")),
        SA_STATUS_REQ_INVALID
        | SA_STATUS_INVALID_GID
        | SA_STATUS_INSUFFICIENT_COMPONENTS
        | MAD_STATUS_UNSUPPORTED_CLASS_VER
        | MAD_STATUS_UNSUPPORTED_METHOD
        | MAD_STATUS_UNSUPPORTED_METHOD_ATTRIB
        | MAD_STATUS_INVALID_ATTRIB => Err(MadError::invalid_parameter(format!(
            "SA rejected request: {}",
            sa_status_text(status)
        ))),
        SA_STATUS_NO_RESOURCES | MAD_STATUS_BUSY => Err(MadError::unavailable(format!(
            "SA: {}",
            sa_status_text(status)
        ))),
        other => Err(MadError::error(format!("SA status 0x{:04x}: {}", other, sa_status_text(other)))),
    }
}

pub fn sa_status_text(status: u16) -> &'static str {
    match status {
        SA_STATUS_NO_RESOURCES => "Insufficient resources",
        SA_STATUS_REQ_INVALID => "Invalid request",
        SA_STATUS_NO_RECORDS => "No records",
        SA_STATUS_TOO_MANY_RECORDS => "Too many records",
        SA_STATUS_INVALID_GID => "Invalid GID",
        SA_STATUS_INSUFFICIENT_COMPONENTS => "Insufficient components",
        other => crate::mad::status_text(other),
    }
}

/// STL ClassPortInfo, shared by the SA and the counters service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassPortInfo {
    pub base_version: u8,
    pub class_version: u8,
    pub cap_mask: u16,
    pub cap_mask2: u32,
    pub resp_time_value: u8,
    pub redirect_gid: Gid,
    pub redirect_lid: u32,
    pub redirect_sl: u8,
    pub redirect_qp: u32,
    pub redirect_qkey: u32,
    pub trap_gid: Gid,
    pub trap_lid: u32,
    pub trap_hop_limit: u8,
    pub trap_qp: u32,
    pub trap_qkey: u32,
    pub trap_pkey: u16,
    pub redirect_pkey: u16,
    pub trap_sl: u8,
}

impl WireRecord for ClassPortInfo {
    const SIZE: usize = 80;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let base_version = r.u8()?;
        let class_version = r.u8()?;
        let cap_mask = r.u16()?;
        let word = r.u32()?;
        let redirect_gid = r.gid()?;
        r.skip(4)?;
        let redirect_lid = r.u32()?;
        let redirect = r.u32()?;
        let redirect_qkey = r.u32()?;
        let trap_gid = r.gid()?;
        r.skip(4)?;
        let trap_lid = r.u32()?;
        let trap = r.u32()?;
        let trap_qkey = r.u32()?;
        let trap_pkey = r.u16()?;
        let redirect_pkey = r.u16()?;
        let trap_sl = r.u8()? & 0x1f;
        r.skip(3)?;
        Ok(Self {
            base_version,
            class_version,
            cap_mask,
            cap_mask2: word >> 5,
            resp_time_value: (word & 0x1f) as u8,
            redirect_gid,
            redirect_lid,
            redirect_sl: (redirect >> 27) as u8,
            redirect_qp: redirect & 0x00ff_ffff,
            redirect_qkey,
            trap_gid,
            trap_lid,
            trap_hop_limit: (trap >> 24) as u8,
            trap_qp: trap & 0x00ff_ffff,
            trap_qkey,
            trap_pkey,
            redirect_pkey,
            trap_sl,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u8(self.base_version)
            .put_u8(self.class_version)
            .put_u16(self.cap_mask)
            .put_u32((self.cap_mask2 << 5) | (self.resp_time_value & 0x1f) as u32)
            .put_gid(&self.redirect_gid)
            .put_u32(0)
            .put_u32(self.redirect_lid)
            .put_u32(((self.redirect_sl as u32 & 0x1f) << 27) | (self.redirect_qp & 0x00ff_ffff))
            .put_u32(self.redirect_qkey)
            .put_gid(&self.trap_gid)
            .put_u32(0)
            .put_u32(self.trap_lid)
            .put_u32(((self.trap_hop_limit as u32) << 24) | (self.trap_qp & 0x00ff_ffff))
            .put_u32(self.trap_qkey)
            .put_u16(self.trap_pkey)
            .put_u16(self.redirect_pkey)
            .put_u8(self.trap_sl & 0x1f)
            .put_zeros(3);
    }
}

/// STL NodeRecord
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    pub lid: u32,
    pub base_version: u8,
    pub class_version: u8,
    pub node_type: u8,
    pub num_ports: u8,
    pub system_image_guid: u64,
    pub node_guid: u64,
    pub port_guid: u64,
    pub partition_cap: u16,
    pub device_id: u16,
    pub revision: u32,
    pub local_port_num: u8,
    pub vendor_id: u32,
    pub node_desc: String,
}

impl WireRecord for NodeRecord {
    const SIZE: usize = 116;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let lid = r.u32()?;
        r.skip(4)?;
        let base_version = r.u8()?;
        let class_version = r.u8()?;
        let node_type = r.u8()?;
        let num_ports = r.u8()?;
        r.skip(4)?;
        let system_image_guid = r.u64()?;
        let node_guid = r.u64()?;
        let port_guid = r.u64()?;
        let partition_cap = r.u16()?;
        let device_id = r.u16()?;
        let revision = r.u32()?;
        let port_vendor = r.u32()?;
        let node_desc = r.text(64)?;
        Ok(Self {
            lid,
            base_version,
            class_version,
            node_type,
            num_ports,
            system_image_guid,
            node_guid,
            port_guid,
            partition_cap,
            device_id,
            revision,
            local_port_num: (port_vendor >> 24) as u8,
            vendor_id: port_vendor & 0x00ff_ffff,
            node_desc,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.lid)
            .put_u32(0)
            .put_u8(self.base_version)
            .put_u8(self.class_version)
            .put_u8(self.node_type)
            .put_u8(self.num_ports)
            .put_u32(0)
            .put_u64(self.system_image_guid)
            .put_u64(self.node_guid)
            .put_u64(self.port_guid)
            .put_u16(self.partition_cap)
            .put_u16(self.device_id)
            .put_u32(self.revision)
            .put_u32(((self.local_port_num as u32) << 24) | (self.vendor_id & 0x00ff_ffff))
            .put_text(&self.node_desc, 64);
    }
}

/// STL ServiceRecord
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub service_id: u64,
    pub service_lid: u32,
    pub service_pkey: u16,
    pub service_gid: Gid,
    pub service_lease: u32,
    pub service_key: [u8; 16],
    pub service_name: String,
    pub service_data8: [u8; 16],
    pub service_data16: [u16; 8],
    pub service_data32: [u32; 4],
    pub service_data64: [u64; 2],
}

impl WireRecord for ServiceRecord {
    const SIZE: usize = 176;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let service_id = r.u64()?;
        let service_lid = r.u32()?;
        let service_pkey = r.u16()?;
        r.skip(2)?;
        let service_gid = r.gid()?;
        let service_lease = r.u32()?;
        r.skip(4)?;
        let service_key = r.array::<16>()?;
        let service_name = r.text(64)?;
        let service_data8 = r.array::<16>()?;
        let mut service_data16 = [0u16; 8];
        for v in service_data16.iter_mut() {
            *v = r.u16()?;
        }
        let mut service_data32 = [0u32; 4];
        for v in service_data32.iter_mut() {
            *v = r.u32()?;
        }
        let mut service_data64 = [0u64; 2];
        for v in service_data64.iter_mut() {
            *v = r.u64()?;
        }
        Ok(Self {
            service_id,
            service_lid,
            service_pkey,
            service_gid,
            service_lease,
            service_key,
            service_name,
            service_data8,
            service_data16,
            service_data32,
            service_data64,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.service_id)
            .put_u32(self.service_lid)
            .put_u16(self.service_pkey)
            .put_u16(0)
            .put_gid(&self.service_gid)
            .put_u32(self.service_lease)
            .put_u32(0)
            .put_bytes(&self.service_key)
            .put_text(&self.service_name, 64)
            .put_bytes(&self.service_data8);
        for v in self.service_data16 {
            w.put_u16(v);
        }
        for v in self.service_data32 {
            w.put_u32(v);
        }
        for v in self.service_data64 {
            w.put_u64(v);
        }
    }
}

/// PathRecord (IB layout, also used by STL subnet administrators)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PathRecord {
    pub service_id: u64,
    pub dgid: Gid,
    pub sgid: Gid,
    pub dlid: u16,
    pub slid: u16,
    pub raw_traffic: bool,
    pub flow_label: u32,
    pub hop_limit: u8,
    pub tclass: u8,
    pub reversible: bool,
    pub num_paths: u8,
    pub pkey: u16,
    pub qos_class: u16,
    pub sl: u8,
    pub mtu_selector: u8,
    pub mtu: u8,
    pub rate_selector: u8,
    pub rate: u8,
    pub pkt_life_selector: u8,
    pub pkt_life: u8,
    pub preference: u8,
}

impl WireRecord for PathRecord {
    const SIZE: usize = 64;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let service_id = r.u64()?;
        let dgid = r.gid()?;
        let sgid = r.gid()?;
        let dlid = r.u16()?;
        let slid = r.u16()?;
        let flow = r.u32()?;
        let tclass = r.u8()?;
        let numb = r.u8()?;
        let pkey = r.u16()?;
        let qos = r.u16()?;
        let mtu = r.u8()?;
        let rate = r.u8()?;
        let pkt_life = r.u8()?;
        let preference = r.u8()?;
        r.skip(6)?;
        Ok(Self {
            service_id,
            dgid,
            sgid,
            dlid,
            slid,
            raw_traffic: flow & 0x8000_0000 != 0,
            flow_label: (flow >> 8) & 0x000f_ffff,
            hop_limit: (flow & 0xff) as u8,
            tclass,
            reversible: numb & 0x80 != 0,
            num_paths: numb & 0x7f,
            pkey,
            qos_class: qos >> 4,
            sl: (qos & 0x0f) as u8,
            mtu_selector: mtu >> 6,
            mtu: mtu & 0x3f,
            rate_selector: rate >> 6,
            rate: rate & 0x3f,
            pkt_life_selector: pkt_life >> 6,
            pkt_life: pkt_life & 0x3f,
            preference,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        let flow = ((self.raw_traffic as u32) << 31) | ((self.flow_label & 0x000f_ffff) << 8) | self.hop_limit as u32;
        w.put_u64(self.service_id)
            .put_gid(&self.dgid)
            .put_gid(&self.sgid)
            .put_u16(self.dlid)
            .put_u16(self.slid)
            .put_u32(flow)
            .put_u8(self.tclass)
            .put_u8(((self.reversible as u8) << 7) | (self.num_paths & 0x7f))
            .put_u16(self.pkey)
            .put_u16((self.qos_class << 4) | (self.sl & 0x0f) as u16)
            .put_u8((self.mtu_selector << 6) | (self.mtu & 0x3f))
            .put_u8((self.rate_selector << 6) | (self.rate & 0x3f))
            .put_u8((self.pkt_life_selector << 6) | (self.pkt_life & 0x3f))
            .put_u8(self.preference)
            .put_zeros(6);
    }
}

/// STL Notice, delivered unsolicited in REPORT and TRAP MADs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub is_generic: bool,
    pub notice_type: u8,
    /// Producer type for generic notices, vendor id otherwise
    pub producer: u32,
    /// Trap number for generic notices, device id otherwise
    pub trap_number: u16,
    pub toggle: bool,
    pub count: u16,
    pub issuer_lid: u32,
    pub issuer_gid: Gid,
    pub data: Vec<u8>,
}

impl WireRecord for Notice {
    const SIZE: usize = 96;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let word = r.u32()?;
        let trap_number = r.u16()?;
        let stats = r.u16()?;
        let issuer_lid = r.u32()?;
        r.skip(4)?;
        let issuer_gid = r.gid()?;
        let data = r.bytes(64)?.to_vec();
        Ok(Self {
            is_generic: word & 0x8000_0000 != 0,
            notice_type: ((word >> 24) & 0x7f) as u8,
            producer: word & 0x00ff_ffff,
            trap_number,
            toggle: stats & 0x8000 != 0,
            count: stats & 0x7fff,
            issuer_lid,
            issuer_gid,
            data,
        })
    }

    fn encode(&self, w: &mut WireWriter) {
        let word = ((self.is_generic as u32) << 31) | ((self.notice_type as u32 & 0x7f) << 24) | (self.producer & 0x00ff_ffff);
        let mut data = self.data.clone();
        data.resize(64, 0);
        w.put_u32(word)
            .put_u16(self.trap_number)
            .put_u16(((self.toggle as u16) << 15) | (self.count & 0x7fff))
            .put_u32(self.issuer_lid)
            .put_u32(0)
            .put_gid(&self.issuer_gid)
            .put_bytes(&data);
    }
}

/// Node records selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeQuery {
    All,
    Lid(u32),
    PortGuid(u64),
    NodeGuid(u64),
    SystemImageGuid(u64),
    NodeType(u8),
    NodeDesc(String),
}

impl NodeQuery {
    fn template(&self) -> (u64, NodeRecord) {
        let mut rec = NodeRecord::default();
        let mask = match self {
            Self::All => 0,
            Self::Lid(lid) => {
                rec.lid = *lid;
                NODE_COMP_LID
            }
            Self::PortGuid(guid) => {
                rec.port_guid = *guid;
                NODE_COMP_PORTGUID
            }
            Self::NodeGuid(guid) => {
                rec.node_guid = *guid;
                NODE_COMP_NODEGUID
            }
            Self::SystemImageGuid(guid) => {
                rec.system_image_guid = *guid;
                NODE_COMP_SYSIMAGEGUID
            }
            Self::NodeType(node_type) => {
                rec.node_type = *node_type;
                NODE_COMP_NODETYPE
            }
            Self::NodeDesc(desc) => {
                rec.node_desc = desc.clone();
                NODE_COMP_NODEDESC
            }
        };
        (mask, rec)
    }
}

/// Service records selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceQuery {
    All,
    ServiceId(u64),
}

/// Path records request between two end points
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathQuery {
    pub sgid: Gid,
    pub dgid: Gid,
    pub service_id: Option<u64>,
    pub pkey: Option<u16>,
    pub num_paths: u8,
}

impl PathQuery {
    pub fn between(sgid: Gid, dgid: Gid) -> Self {
        Self {
            sgid,
            dgid,
            service_id: None,
            pkey: None,
            num_paths: 1,
        }
    }

    pub fn with_service_id(mut self, service_id: u64) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn with_pkey(mut self, pkey: u16) -> Self {
        self.pkey = Some(pkey);
        self
    }

    pub fn with_num_paths(mut self, num_paths: u8) -> Self {
        self.num_paths = num_paths & 0x7f;
        self
    }

    fn template(&self) -> (u64, PathRecord) {
        let mut mask = PATH_COMP_DGID | PATH_COMP_SGID | PATH_COMP_NUMBPATH | PATH_COMP_REVERSIBLE;
        let mut rec = PathRecord {
            dgid: self.dgid,
            sgid: self.sgid,
            num_paths: self.num_paths,
            reversible: true,
            ..Default::default()
        };
        if let Some(service_id) = self.service_id {
            rec.service_id = service_id;
            mask |= PATH_COMP_SERVICEID;
        }
        if let Some(pkey) = self.pkey {
            rec.pkey = pkey;
            mask |= PATH_COMP_PKEY;
        }
        (mask, rec)
    }
}

impl Session {
    /// Fetch the SA's ClassPortInfo
    pub fn sa_class_port_info(&mut self) -> MadResult<ClassPortInfo> {
        self.sa_query(METHOD_GET, SA_ATTR_CLASS_PORT_INFO, 0, Vec::new())?.single()
    }

    pub fn sa_node_records(&mut self, query: &NodeQuery) -> MadResult<Vec<NodeRecord>> {
        let (mask, template) = query.template();
        let resp = self.sa_query(METHOD_GETTABLE, SA_ATTR_NODE_RECORD, mask, template.to_bytes())?;
        let records = resp.records()?;
        debug!("SA returned {} node records", records.len());
        Ok(records)
    }

    pub fn sa_service_records(&mut self, query: &ServiceQuery) -> MadResult<Vec<ServiceRecord>> {
        let mut template = ServiceRecord::default();
        let mask = match query {
            ServiceQuery::All => 0,
            ServiceQuery::ServiceId(id) => {
                template.service_id = *id;
                SERVICE_COMP_SERVICEID
            }
        };
        let resp = self.sa_query(METHOD_GETTABLE, SA_ATTR_SERVICE_RECORD, mask, template.to_bytes())?;
        resp.records()
    }

    pub fn sa_path_records(&mut self, query: &PathQuery) -> MadResult<Vec<PathRecord>> {
        let (mask, template) = query.template();
        let resp = self.sa_query(METHOD_GETTABLE, SA_ATTR_PATH_RECORD, mask, template.to_bytes())?;
        resp.records()
    }

    /// Ping the SA and record the outcome in the service state
    pub(crate) fn sa_ping(&mut self) -> MadResult<()> {
        self.sa_ping_response().map(|_| ())
    }

    /// ClassPortInfo GET on the short ping timeout
    fn sa_ping_response(&mut self) -> MadResult<ResponseEnvelope> {
        let request = sa_request(METHOD_GET, SA_ATTR_CLASS_PORT_INFO, 0, Vec::new());
        let dest = self.sa_destination(SA_ATTR_CLASS_PORT_INFO)?;
        let retries = self.retry_count();
        self.sa_exchange(&request, &dest, SA_PING_TIMEOUT_MS, retries)
    }

    pub(crate) fn sa_query(&mut self, method: u8, attr_id: u16, mask: u64, payload: Vec<u8>) -> MadResult<ResponseEnvelope> {
        self.ensure_port_active()?;
        if self.is_native() && self.cache().sa_state() != ServiceState::Operational {
            if method == METHOD_GET && attr_id == SA_ATTR_CLASS_PORT_INFO {
                debug!("SA state is {:?}, ClassPortInfo sent as the ping", self.cache().sa_state());
                return self.sa_ping_response();
            }
            debug!("SA state is {:?}, pinging before query", self.cache().sa_state());
            self.sa_ping()?;
        }
        let dest = self.sa_destination(attr_id)?;
        let request = sa_request(method, attr_id, mask, payload);
        let (timeout_ms, retries) = (self.timeout_ms(), self.retry_count());
        self.sa_exchange(&request, &dest, timeout_ms, retries)
    }

    fn sa_exchange(
        &mut self,
        request: &RequestEnvelope,
        dest: &Destination,
        timeout_ms: u64,
        retries: u32,
    ) -> MadResult<ResponseEnvelope> {
        match self.exchange(request, dest, timeout_ms, retries) {
            Ok(resp) => {
                self.cache().set_sa_state(ServiceState::Operational);
                check_sa_status(resp.status())?;
                Ok(resp)
            }
            Err(e) => {
                if self.is_native() && !matches!(e, MadError::Protection { .. } | MadError::InvalidParameter { .. }) {
                    warn!("SA query failed ({}), marking SA and PA down", e);
                    self.cache().set_sa_state(ServiceState::Down);
                    self.cache().set_pa_state(ServiceState::Down);
                }
                Err(e)
            }
        }
    }

    fn sa_destination(&self, attr_id: u16) -> MadResult<Destination> {
        if !self.is_native() {
            return Ok(Destination::default());
        }
        let port = self.cache().address().port;
        let pkey = sa_pkey(&port.pkeys, attr_id)?;
        Ok(Destination::gsi(port.sm_lid, port.sm_sl, pkey))
    }
}

fn sa_request(method: u8, attr_id: u16, mask: u64, payload: Vec<u8>) -> RequestEnvelope {
    RequestEnvelope::new(MadHeader::new(MCLASS_SUBN_ADM, STL_SA_CLASS_VERSION, method, attr_id))
        .with_component_mask(mask)
        .with_payload(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkey_selection() {
        assert_eq!(sa_pkey(&[0xffff, 0x7fff], SA_ATTR_NODE_RECORD).unwrap(), 0xffff);
        assert_eq!(sa_pkey(&[0x7fff], SA_ATTR_PATH_RECORD).unwrap(), 0x7fff);
        assert_eq!(sa_pkey(&[0x7fff], SA_ATTR_CLASS_PORT_INFO).unwrap(), 0x7fff);
        assert!(matches!(
            sa_pkey(&[0x7fff], 0x0020),
            Err(MadError::Protection { pkey: 0xffff })
        ));
        assert!(sa_pkey(&[0x8001], SA_ATTR_NODE_RECORD).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_sa_status(0).is_ok());
        assert!(matches!(check_sa_status(SA_STATUS_NO_RECORDS), Err(MadError::NotFound { .. })));
        assert!(matches!(check_sa_status(SA_STATUS_REQ_INVALID), Err(MadError::InvalidParameter { .. })));
        assert!(matches!(check_sa_status(MAD_STATUS_INVALID_ATTRIB), Err(MadError::InvalidParameter { .. })));
        assert!(matches!(check_sa_status(SA_STATUS_NO_RESOURCES), Err(MadError::Unavailable { .. })));
        assert!(matches!(check_sa_status(MAD_STATUS_BUSY), Err(MadError::Unavailable { .. })));
        assert!(matches!(check_sa_status(SA_STATUS_TOO_MANY_RECORDS), Err(MadError::Error { .. })));
    }

    #[test]
    fn test_status_mapping_is_stable() {
        for status in [0x0100u16, 0x0200, 0x0300, 0x0700, 0x001c] {
            let a = check_sa_status(status).map_err(|e| e.category());
            let b = check_sa_status(status).map_err(|e| e.category());
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(ClassPortInfo::default().to_bytes().len(), ClassPortInfo::SIZE);
        assert_eq!(NodeRecord::default().to_bytes().len(), NodeRecord::SIZE);
        assert_eq!(ServiceRecord::default().to_bytes().len(), ServiceRecord::SIZE);
        assert_eq!(PathRecord::default().to_bytes().len(), PathRecord::SIZE);
        assert_eq!(Notice::default().to_bytes().len(), Notice::SIZE);
        assert_eq!(table_stride(NodeRecord::SIZE), 120);
    }

    #[test]
    fn test_node_record_packed_fields() {
        let rec = NodeRecord {
            lid: 0x1_0001,
            node_type: NODE_TYPE_SWITCH,
            local_port_num: 7,
            vendor_id: 0x00066a,
            node_desc: "edge switch 1".to_string(),
            ..Default::default()
        };
        let raw = rec.to_bytes();
        assert_eq!(&raw[0..4], &[0x00, 0x01, 0x00, 0x01]);
        assert_eq!(&raw[48..52], &[0x07, 0x00, 0x06, 0x6a]);
        assert_eq!(NodeRecord::decode(&mut WireReader::new(&raw)).unwrap(), rec);
    }

    #[test]
    fn test_path_record_bitfields() {
        let rec = PathRecord {
            dlid: 5,
            slid: 1,
            flow_label: 0x12345,
            hop_limit: 1,
            reversible: true,
            num_paths: 32,
            pkey: 0xffff,
            sl: 3,
            mtu_selector: 2,
            mtu: 5,
            ..Default::default()
        };
        let raw = rec.to_bytes();
        assert_eq!(raw[49], 0x80 | 32);
        assert_eq!(raw[53] & 0x0f, 3);
        assert_eq!(PathRecord::decode(&mut WireReader::new(&raw)).unwrap(), rec);
    }

    #[test]
    fn test_path_query_mask() {
        let q = PathQuery::between(Gid::default(), Gid::default())
            .with_service_id(0x10)
            .with_num_paths(32);
        let (mask, rec) = q.template();
        assert_eq!(mask & PATH_COMP_SERVICEID, PATH_COMP_SERVICEID);
        assert_eq!(mask & PATH_COMP_NUMBPATH, PATH_COMP_NUMBPATH);
        assert_eq!(mask & PATH_COMP_PKEY, 0);
        assert_eq!(rec.num_paths, 32);
    }

    #[test]
    fn test_notice_decode() {
        let notice = Notice {
            is_generic: true,
            notice_type: 4,
            producer: 2,
            trap_number: 64,
            issuer_lid: 1,
            data: vec![0xab; 64],
            ..Default::default()
        };
        let raw = notice.to_bytes();
        assert_eq!(raw[0], 0x84);
        assert_eq!(Notice::decode(&mut WireReader::new(&raw)).unwrap(), notice);
    }
}
