//! In-process fabric used by the mock management interface
//!
//! Answers the subset of SA and counters-service requests this crate issues,
//! from a small static topology: one host, one switch and one storage node,
//! with the host's port running the master performance manager.

use crate::mad::{
    Gid, MadHeader, RequestEnvelope, WireReader, WireRecord, MCLASS_SUBN_ADM, MCLASS_VFI_PM, METHOD_GET,
    METHOD_GETTABLE, METHOD_GETTABLE_RESP, METHOD_GET_RESP, METHOD_RESP_BIT, METHOD_SET, SA_DATA_OFFSET,
    STL_OUI_BYTES,
};
use crate::pa::*;
use crate::sa::*;
use crate::umad::{MadAddr, MadResponder, MockReply};
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::debug;

/// Static topology plus the mutable state of the counters service
pub struct MockFabric {
    pub nodes: Vec<NodeRecord>,
    pub services: Vec<ServiceRecord>,
    pub groups: Vec<String>,
    pub vfs: Vec<String>,
    pub gid_prefix: u64,
    frozen: Mutex<HashSet<u64>>,
    next_image: Mutex<u64>,
}

impl Default for MockFabric {
    fn default() -> Self {
        let gid_prefix = 0xfe80_0000_0000_0000;
        let node = |lid: u32, node_type: u8, guid: u64, desc: &str| NodeRecord {
            lid,
            base_version: 0x80,
            class_version: 0x80,
            node_type,
            num_ports: if node_type == NODE_TYPE_SWITCH { 48 } else { 1 },
            system_image_guid: guid,
            node_guid: guid,
            port_guid: guid,
            partition_cap: 16,
            device_id: 0x24f0,
            revision: 0x11,
            local_port_num: 1,
            vendor_id: 0x00175,
            node_desc: desc.to_string(),
        };
        let nodes = vec![
            node(1, NODE_TYPE_FI, 0x0011_7501_0000_0001, "host01 hfi1_0"),
            node(2, NODE_TYPE_SWITCH, 0x0011_7501_0200_0001, "edge switch 01"),
            node(3, NODE_TYPE_FI, 0x0011_7501_0000_0003, "storage01 hfi1_0"),
        ];

        let mut pm = ServiceRecord {
            service_id: PM_SERVICE_ID,
            service_lid: 1,
            service_pkey: 0xffff,
            service_gid: Gid {
                prefix: gid_prefix,
                interface_id: 0x0011_7501_0000_0001,
            },
            service_name: "Primary PM".to_string(),
            ..Default::default()
        };
        pm.service_data8[0] = 1;
        pm.service_data8[1] = 1;

        Self {
            nodes,
            services: vec![pm],
            groups: ["All", "HFIs", "SWs"].iter().map(|s| s.to_string()).collect(),
            vfs: vec!["Default".to_string(), "Admin".to_string()],
            gid_prefix,
            frozen: Mutex::new(HashSet::new()),
            next_image: Mutex::new(100),
        }
    }
}

struct Reply {
    status: u16,
    stride: u16,
    payload: Vec<u8>,
}

impl Reply {
    fn ok(payload: Vec<u8>) -> Self {
        Self {
            status: 0,
            stride: 0,
            payload,
        }
    }

    fn table<T: WireRecord>(records: &[T]) -> Self {
        let stride = table_stride(T::SIZE);
        let mut payload = Vec::with_capacity(records.len() * stride);
        for rec in records {
            let start = payload.len();
            payload.extend_from_slice(&rec.to_bytes());
            payload.resize(start + stride, 0);
        }
        Self {
            status: 0,
            stride: (stride / 8) as u16,
            payload,
        }
    }

    /// An SA table with no matches is answered with NO_RECORDS
    fn records_or_none<T: WireRecord>(records: &[T]) -> Self {
        if records.is_empty() {
            Self::status(SA_STATUS_NO_RECORDS)
        } else {
            Self::table(records)
        }
    }

    fn status(status: u16) -> Self {
        Self {
            status,
            stride: 0,
            payload: Vec::new(),
        }
    }
}

impl MockFabric {
    fn node_by_lid(&self, lid: u32) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.lid == lid)
    }

    fn class_port_info(&self) -> ClassPortInfo {
        ClassPortInfo {
            base_version: 0x80,
            class_version: 0x80,
            resp_time_value: 18,
            ..Default::default()
        }
    }

    fn sa(&self, header: &MadHeader, mask: u64, data: &[u8]) -> Reply {
        let mut r = WireReader::new(data);
        match header.attr_id {
            SA_ATTR_CLASS_PORT_INFO => Reply::ok(self.class_port_info().to_bytes()),
            SA_ATTR_NODE_RECORD => {
                let Ok(tmpl) = NodeRecord::decode(&mut r) else {
                    return Reply::status(SA_STATUS_REQ_INVALID);
                };
                let matches: Vec<NodeRecord> = self
                    .nodes
                    .iter()
                    .filter(|n| mask & NODE_COMP_LID == 0 || n.lid == tmpl.lid)
                    .filter(|n| mask & NODE_COMP_NODETYPE == 0 || n.node_type == tmpl.node_type)
                    .filter(|n| mask & NODE_COMP_NODEGUID == 0 || n.node_guid == tmpl.node_guid)
                    .filter(|n| mask & NODE_COMP_PORTGUID == 0 || n.port_guid == tmpl.port_guid)
                    .filter(|n| mask & NODE_COMP_SYSIMAGEGUID == 0 || n.system_image_guid == tmpl.system_image_guid)
                    .filter(|n| mask & NODE_COMP_NODEDESC == 0 || n.node_desc == tmpl.node_desc)
                    .cloned()
                    .collect();
                Reply::records_or_none(&matches)
            }
            SA_ATTR_SERVICE_RECORD => {
                let Ok(tmpl) = ServiceRecord::decode(&mut r) else {
                    return Reply::status(SA_STATUS_REQ_INVALID);
                };
                let matches: Vec<ServiceRecord> = self
                    .services
                    .iter()
                    .filter(|s| mask & SERVICE_COMP_SERVICEID == 0 || s.service_id == tmpl.service_id)
                    .cloned()
                    .collect();
                Reply::records_or_none(&matches)
            }
            SA_ATTR_PATH_RECORD => {
                let Ok(tmpl) = PathRecord::decode(&mut r) else {
                    return Reply::status(SA_STATUS_REQ_INVALID);
                };
                if mask & (PATH_COMP_DGID | PATH_COMP_SGID) != (PATH_COMP_DGID | PATH_COMP_SGID) {
                    return Reply::status(SA_STATUS_INSUFFICIENT_COMPONENTS);
                }
                let Some(dest) = self.nodes.iter().find(|n| n.port_guid == tmpl.dgid.interface_id) else {
                    return Reply::status(SA_STATUS_INVALID_GID);
                };
                let path = PathRecord {
                    service_id: tmpl.service_id,
                    dgid: tmpl.dgid,
                    sgid: tmpl.sgid,
                    dlid: dest.lid as u16,
                    slid: 1,
                    hop_limit: 0,
                    reversible: true,
                    num_paths: 1,
                    pkey: 0xffff,
                    sl: 0,
                    mtu_selector: 2,
                    mtu: 5,
                    rate_selector: 2,
                    rate: 16,
                    pkt_life_selector: 2,
                    pkt_life: 18,
                    ..Default::default()
                };
                let limited = PathRecord { pkey: 0x8001, ..path.clone() };
                Reply::table(&[path, limited])
            }
            _ => Reply::status(crate::mad::MAD_STATUS_INVALID_ATTRIB),
        }
    }

    fn image_known(&self, image: &ImageId) -> bool {
        image.number == 0 || self.frozen.lock().contains(&image.number)
    }

    fn counters_for(&self, lid: u32, port: u8, flags: u32, image: ImageId) -> PortCounters {
        let base = lid as u64 * 1_000_000 + port as u64 * 1000;
        let scale = if flags & PC_FLAG_DELTA != 0 { 1 } else { 100 };
        PortCounters {
            node_lid: lid,
            port_number: port,
            flags,
            image_id: image,
            port_xmit_data: base * scale,
            port_rcv_data: (base + 17) * scale,
            port_xmit_pkts: base / 64 * scale,
            port_rcv_pkts: (base + 17) / 64 * scale,
            port_xmit_wait: lid as u64,
            link_quality_indicator: 5,
            ..Default::default()
        }
    }

    fn group_members(&self, name: &str) -> Option<Vec<&NodeRecord>> {
        match name {
            "All" => Some(self.nodes.iter().collect()),
            "HFIs" => Some(self.nodes.iter().filter(|n| n.node_type == NODE_TYPE_FI).collect()),
            "SWs" => Some(self.nodes.iter().filter(|n| n.node_type == NODE_TYPE_SWITCH).collect()),
            _ => None,
        }
    }

    /// "Default" spans the fabric, "Admin" only the hosts
    fn vf_members(&self, name: &str) -> Option<Vec<&NodeRecord>> {
        match name {
            "Default" => Some(self.nodes.iter().collect()),
            "Admin" => Some(self.nodes.iter().filter(|n| n.node_type == NODE_TYPE_FI).collect()),
            _ => None,
        }
    }

    fn util_stats(&self, members: &[&NodeRecord], image: ImageId) -> UtilStats {
        let rates: Vec<u64> = member_ports(members)
            .into_iter()
            .map(|(lid, port)| self.counters_for(lid, port, PC_FLAG_DELTA, image).port_xmit_data / 1_000_000)
            .collect();
        let total: u64 = rates.iter().sum();
        let count = rates.len().max(1) as u64;
        let mut stats = UtilStats {
            total_mbps: total,
            total_kpps: total / 64,
            avg_mbps: (total / count) as u32,
            min_mbps: rates.iter().copied().min().unwrap_or(0) as u32,
            max_mbps: rates.iter().copied().max().unwrap_or(0) as u32,
            num_bw_buckets: UTIL_BUCKETS as u32,
            ..Default::default()
        };
        stats.bw_buckets[0] = rates.len() as u32;
        stats
    }

    /// Rank member ports by the selected metric and return the requested slice
    fn focus(&self, members: &[&NodeRecord], image: ImageId, focus: FocusSelect) -> Reply {
        if !self.image_known(&image) {
            return Reply::status(PA_STATUS_NO_IMAGE);
        }
        let metric = |pc: &PortCounters| match focus.select {
            FOCUS_SELECT_UTIL_HIGH | FOCUS_SELECT_UTIL_LOW => Some(pc.port_xmit_data),
            FOCUS_SELECT_UTIL_PKTS_HIGH => Some(pc.port_xmit_pkts),
            FOCUS_SELECT_CONGESTION => Some(pc.port_xmit_wait),
            FOCUS_SELECT_INTEGRITY => Some(pc.local_link_integrity_errors),
            _ => None,
        };
        let mut ranked = Vec::new();
        for n in members {
            for port in 1..=n.num_ports {
                let pc = self.counters_for(n.lid, port, PC_FLAG_DELTA, image);
                let Some(value) = metric(&pc) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                ranked.push(FocusPort {
                    image_id: image,
                    node_lid: n.lid,
                    port_number: port,
                    rate: 15,
                    max_vl_mtu: 7,
                    value,
                    node_guid: n.node_guid,
                    node_desc: n.node_desc.clone(),
                    ..Default::default()
                });
            }
        }
        if focus.select == FOCUS_SELECT_UTIL_LOW {
            ranked.sort_by_key(|p| p.value);
        } else {
            ranked.sort_by(|a, b| b.value.cmp(&a.value));
        }
        let slice: Vec<FocusPort> = ranked
            .into_iter()
            .skip(focus.start as usize)
            .take(focus.range as usize)
            .collect();
        Reply::table(&slice)
    }

    fn pa(&self, header: &MadHeader, data: &[u8]) -> Reply {
        let mut r = WireReader::new(data);
        match (header.method, header.attr_id) {
            (METHOD_GET, PA_ATTR_CLASS_PORT_INFO) => Reply::ok(self.class_port_info().to_bytes()),
            (METHOD_GETTABLE, PA_ATTR_GRP_LIST) => {
                let names: Vec<NameRecord> = self.groups.iter().map(|n| NameRecord { name: n.clone() }).collect();
                Reply::table(&names)
            }
            (METHOD_GETTABLE, PA_ATTR_VF_LIST) => {
                let names: Vec<NameRecord> = self.vfs.iter().map(|n| NameRecord { name: n.clone() }).collect();
                Reply::table(&names)
            }
            (METHOD_GETTABLE, PA_ATTR_GRP_LIST2) | (METHOD_GETTABLE, PA_ATTR_VF_LIST2) => {
                let Ok(req) = ImageNameRecord::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                if !self.image_known(&req.image_id) {
                    return Reply::status(PA_STATUS_NO_IMAGE);
                }
                let names = if header.attr_id == PA_ATTR_GRP_LIST2 { &self.groups } else { &self.vfs };
                let records: Vec<ImageNameRecord> = names
                    .iter()
                    .map(|n| ImageNameRecord {
                        name: n.clone(),
                        image_id: req.image_id,
                    })
                    .collect();
                Reply::table(&records)
            }
            (METHOD_GETTABLE, PA_ATTR_GRP_CFG) => {
                let Ok(req) = ImageNameRecord::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                let Some(members) = self.group_members(&req.name) else {
                    return Reply::status(PA_STATUS_NO_GROUP);
                };
                Reply::table(&config_records(&members, req.image_id))
            }
            (METHOD_GETTABLE, PA_ATTR_GRP_INFO) => {
                let Ok(req) = GroupInfo::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                if !self.image_known(&req.image_id) {
                    return Reply::status(PA_STATUS_NO_IMAGE);
                }
                let Some(members) = self.group_members(&req.group_name) else {
                    return Reply::status(PA_STATUS_NO_GROUP);
                };
                let ports = member_ports(&members).len() as u32;
                let info = GroupInfo {
                    group_name: req.group_name,
                    image_id: req.image_id,
                    num_internal_ports: ports,
                    internal_util: self.util_stats(&members, req.image_id),
                    max_internal_rate: 15,
                    min_internal_rate: 15,
                    max_internal_mbps: 12_500,
                    ..Default::default()
                };
                Reply::table(&[info])
            }
            (METHOD_GET, PA_ATTR_PM_CONFIG) => {
                let config = PmConfig {
                    sweep_interval: 10,
                    max_clients: 3,
                    size_history: 10,
                    size_freeze: 5,
                    lease: 60,
                    pm_flags: 0x3,
                    congestion_weights: [10, 5, 5, 5, 5, 5],
                    integrity_weights: [4, 100, 100, 100, 25, 100, 25, 40, 10],
                    max_attempts: 3,
                    resp_timeout: 250,
                    min_resp_timeout: 35,
                    max_parallel_nodes: 10,
                    pma_batch_size: 2,
                    error_clear: 8,
                    ..Default::default()
                };
                Reply::ok(config.to_bytes())
            }
            (METHOD_GETTABLE, PA_ATTR_FOCUS_PORTS) => {
                let Ok(req) = FocusRequest::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                let Some(members) = self.group_members(&req.group_name) else {
                    return Reply::status(PA_STATUS_NO_GROUP);
                };
                self.focus(&members, req.image_id, req.focus)
            }
            (METHOD_GETTABLE, PA_ATTR_VF_INFO) => {
                let Ok(req) = VfInfo::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                if !self.image_known(&req.image_id) {
                    return Reply::status(PA_STATUS_NO_IMAGE);
                }
                let Some(members) = self.vf_members(&req.vf_name) else {
                    return Reply::status(PA_STATUS_NO_VF);
                };
                let info = VfInfo {
                    vf_name: req.vf_name,
                    image_id: req.image_id,
                    num_ports: member_ports(&members).len() as u32,
                    internal_util: self.util_stats(&members, req.image_id),
                    max_internal_rate: 15,
                    min_internal_rate: 15,
                    max_internal_mbps: 12_500,
                    ..Default::default()
                };
                Reply::table(&[info])
            }
            (METHOD_GETTABLE, PA_ATTR_VF_CONFIG) => {
                let Ok(req) = VfImageRequest::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                let Some(members) = self.vf_members(&req.vf_name) else {
                    return Reply::status(PA_STATUS_NO_VF);
                };
                Reply::table(&config_records(&members, req.image_id))
            }
            (METHOD_GET, PA_ATTR_VF_PORT_CTRS) => {
                let Ok(req) = VfPortCounters::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                if !self.image_known(&req.image_id) {
                    return Reply::status(PA_STATUS_NO_IMAGE);
                }
                let Some(members) = self.vf_members(&req.vf_name) else {
                    return Reply::status(PA_STATUS_NO_VF);
                };
                if !member_ports(&members).contains(&(req.node_lid, req.port_number)) {
                    return Reply::status(PA_STATUS_NO_PORT);
                }
                let pc = self.counters_for(req.node_lid, req.port_number, req.flags, req.image_id);
                let vf_share = if req.vf_name == "Default" { 1 } else { 4 };
                let counters = VfPortCounters {
                    port_vf_xmit_data: pc.port_xmit_data / vf_share,
                    port_vf_rcv_data: pc.port_rcv_data / vf_share,
                    port_vf_xmit_pkts: pc.port_xmit_pkts / vf_share,
                    port_vf_rcv_pkts: pc.port_rcv_pkts / vf_share,
                    port_vf_xmit_wait: pc.port_xmit_wait,
                    ..req
                };
                Reply::ok(counters.to_bytes())
            }
            (METHOD_SET, PA_ATTR_CLR_VF_PORT_CTRS) => {
                let Ok(req) = ClearVfPortCounters::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                if self.vf_members(&req.vf_name).is_none() {
                    return Reply::status(PA_STATUS_NO_VF);
                }
                if self.node_by_lid(req.node_lid).is_none() {
                    return Reply::status(PA_STATUS_NO_PORT);
                }
                Reply::ok(req.to_bytes())
            }
            (METHOD_GETTABLE, PA_ATTR_VF_FOCUS_PORTS) => {
                let Ok(req) = VfFocusRequest::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                let Some(members) = self.vf_members(&req.vf_name) else {
                    return Reply::status(PA_STATUS_NO_VF);
                };
                self.focus(&members, req.image_id, req.focus)
            }
            (METHOD_GET, PA_ATTR_PORT_CTRS) => {
                let Ok(req) = PortCounters::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                if !self.image_known(&req.image_id) {
                    return Reply::status(PA_STATUS_NO_IMAGE);
                }
                match self.node_by_lid(req.node_lid) {
                    Some(node) if req.port_number <= node.num_ports => Reply::ok(
                        self.counters_for(req.node_lid, req.port_number, req.flags, req.image_id)
                            .to_bytes(),
                    ),
                    _ => Reply::status(PA_STATUS_NO_PORT),
                }
            }
            (METHOD_SET, PA_ATTR_CLR_PORT_CTRS) => {
                let Ok(req) = ClearPortCounters::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                if self.node_by_lid(req.node_lid).is_none() {
                    return Reply::status(PA_STATUS_NO_PORT);
                }
                Reply::ok(req.to_bytes())
            }
            (METHOD_SET, PA_ATTR_CLR_ALL_PORT_CTRS) => Reply::ok(data.get(..CounterSelect::SIZE).unwrap_or_default().to_vec()),
            (METHOD_GET, PA_ATTR_IMAGE_INFO) => {
                let Ok(image) = ImageId::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                if !self.image_known(&image) {
                    return Reply::status(PA_STATUS_NO_IMAGE);
                }
                let info = ImageInfo {
                    image_id: image,
                    sweep_start: 1_700_000_000,
                    sweep_duration: 250_000,
                    num_hfi_ports: 2,
                    num_switch_nodes: 1,
                    num_switch_ports: 48,
                    num_links: 2,
                    num_sms: 1,
                    image_interval: 10,
                    sm_info: [
                        SmInfo {
                            lid: 1,
                            priority: 8,
                            state: 3,
                            port_number: 1,
                            port_guid: 0x0011_7501_0000_0001,
                            node_desc: "host01 hfi1_0".to_string(),
                        },
                        SmInfo::default(),
                    ],
                    ..Default::default()
                };
                Reply::ok(info.to_bytes())
            }
            (METHOD_SET, PA_ATTR_FREEZE_IMAGE) => {
                let Ok(image) = ImageId::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                if !self.image_known(&image) {
                    return Reply::status(PA_STATUS_NO_IMAGE);
                }
                let mut next = self.next_image.lock();
                *next += 1;
                self.frozen.lock().insert(*next);
                Reply::ok(ImageId::frozen(*next).to_bytes())
            }
            (METHOD_SET, PA_ATTR_RELEASE_IMAGE) | (METHOD_SET, PA_ATTR_RENEW_IMAGE) => {
                let Ok(image) = ImageId::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                let known = self.frozen.lock().contains(&image.number);
                if !known {
                    return Reply::status(PA_STATUS_NO_IMAGE);
                }
                if header.attr_id == PA_ATTR_RELEASE_IMAGE {
                    self.frozen.lock().remove(&image.number);
                }
                Reply::ok(image.to_bytes())
            }
            (METHOD_SET, PA_ATTR_MOVE_FREEZE_FRAME) => {
                let Ok(req) = MoveFreeze::decode(&mut r) else {
                    return Reply::status(PA_STATUS_INVALID_PARAMETER);
                };
                let mut frozen = self.frozen.lock();
                if !frozen.remove(&req.old_image.number) {
                    return Reply::status(PA_STATUS_NO_IMAGE);
                }
                frozen.insert(req.new_image.number);
                Reply::ok(req.to_bytes())
            }
            _ => Reply::status(PA_STATUS_INVALID_PARAMETER),
        }
    }

    /// Build the response MAD for an encoded request, or `None` for non-requests
    pub fn answer(&self, request: &[u8]) -> Option<Vec<u8>> {
        let mut r = WireReader::new(request);
        let header = MadHeader::decode(&mut r).ok()?;
        if header.method & METHOD_RESP_BIT != 0 {
            return None;
        }
        let sa_header = r
            .skip(crate::mad::RMPP_HEADER_SIZE)
            .and_then(|_| crate::mad::SaHeader::decode(&mut r))
            .ok()?;
        let data = request.get(SA_DATA_OFFSET..).unwrap_or_default();

        let reply = match header.mgmt_class {
            MCLASS_SUBN_ADM => self.sa(&header, sa_header.component_mask, data),
            MCLASS_VFI_PM => self.pa(&header, data),
            _ => return None,
        };
        debug!(
            "mock fabric: class 0x{:02x} attr 0x{:04x} -> status 0x{:04x}, {} bytes",
            header.mgmt_class,
            header.attr_id,
            reply.status,
            reply.payload.len()
        );

        let mut rsp_header = header;
        rsp_header.method = if header.method == METHOD_GETTABLE {
            METHOD_GETTABLE_RESP
        } else {
            METHOD_GET_RESP
        };
        rsp_header.status = reply.status;
        let mut rsp = RequestEnvelope::new(rsp_header).with_payload(reply.payload);
        rsp.sa_header.attribute_offset = reply.stride;
        if header.mgmt_class == MCLASS_VFI_PM {
            rsp = rsp.with_vendor_oui(STL_OUI_BYTES);
        }
        Some(rsp.to_bytes())
    }
}

fn member_ports(members: &[&NodeRecord]) -> Vec<(u32, u8)> {
    members
        .iter()
        .flat_map(|n| (1..=n.num_ports).map(move |port| (n.lid, port)))
        .collect()
}

fn config_records(members: &[&NodeRecord], image: ImageId) -> Vec<GroupConfigRecord> {
    members
        .iter()
        .flat_map(|n| {
            (1..=n.num_ports).map(move |port| GroupConfigRecord {
                image_id: image,
                node_guid: n.node_guid,
                node_desc: n.node_desc.clone(),
                node_lid: n.lid,
                port_number: port,
            })
        })
        .collect()
}

impl MadResponder for MockFabric {
    fn respond(&self, request: &[u8], _addr: &MadAddr) -> MockReply {
        match self.answer(request) {
            Some(rsp) => MockReply::Reply(rsp),
            None => MockReply::Silent,
        }
    }
}
