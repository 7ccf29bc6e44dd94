//! Local management-interface backends
//!
//! The native transport talks to the fabric through `libibumad`, loaded at
//! runtime so the crate builds and tests on hosts without fabric hardware.
//! An in-process mock backend stands in for the interface during development
//! and testing.
//!
//! # Features
//!
//! - `real-umad`: opening a port loads `libibumad` and uses the kernel interface.
//!   Without it, opening a port attaches the mock backend.

use crate::mad::{Gid, MCLASS_VFI_PM, METHOD_RESP_BIT, STL_MAD_BLOCK_SIZE};
use crate::rmpp::RMPP_PA_SUBHEADER_LEN;
use crate::{MadError, MadResult};
use libc::{c_char, c_int, c_long, c_uint, c_void};
use libloading::{Library, Symbol};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const UMAD_CA_NAME_LEN: usize = 20;
pub const UMAD_MAX_DEVICES: usize = 32;
pub const UMAD_MAX_PORTS: u8 = 64;
pub const QP1_WELL_KNOWN_Q_KEY: u32 = 0x8001_0000;

/// Logical port state as reported by the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortState {
    Down,
    Init,
    Armed,
    Active,
    Other(u32),
}

impl From<u32> for PortState {
    fn from(state: u32) -> Self {
        match state {
            1 => Self::Down,
            2 => Self::Init,
            3 => Self::Armed,
            4 => Self::Active,
            other => Self::Other(other),
        }
    }
}

impl Default for PortState {
    fn default() -> Self {
        Self::Down
    }
}

/// Addressing data of a local port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortAttributes {
    pub ca_name: String,
    pub port_num: u8,
    pub base_lid: u32,
    pub lmc: u8,
    pub sm_lid: u32,
    pub sm_sl: u8,
    pub state: PortState,
    pub gid_prefix: u64,
    pub port_guid: u64,
    pub pkeys: Vec<u16>,
    pub link_layer: String,
}

/// Destination or source address of a MAD
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MadAddr {
    pub lid: u32,
    pub sl: u8,
    pub qpn: u32,
    pub qkey: u32,
    pub pkey_index: u16,
    pub grh: Option<Grh>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Grh {
    pub gid: Gid,
    pub gid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub flow_label: u32,
}

/// A MAD handed back by the interface
#[derive(Debug, Clone)]
pub struct ReceivedMad {
    pub agent_id: u32,
    /// Local completion status; non-zero means the send failed
    pub status: i32,
    pub addr: MadAddr,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum RecvOutcome {
    Received(ReceivedMad),
    /// The pending MAD needs a buffer of this many bytes
    TooLarge { length: usize },
    Failed { errno: i32 },
}

/// Kernel agent registration request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSpec {
    pub mgmt_class: u8,
    pub class_version: u8,
    pub rmpp_version: u8,
    pub oui: Option<[u8; 3]>,
}

/// Management-interface backend (simplified enum approach)
pub enum UmadBackend {
    Library(LibUmadPort),
    Mock(MockUmad),
}

impl UmadBackend {
    /// Open a local port by device name and port number
    pub fn open(ca_name: &str, port_num: u8) -> MadResult<Self> {
        if cfg!(feature = "real-umad") {
            Ok(Self::Library(LibUmadPort::open(ca_name, port_num)?))
        } else {
            Ok(Self::Mock(MockUmad::new(MockUmad::default_attributes(ca_name, port_num))))
        }
    }

    /// Names of the local devices, in interface order
    pub fn device_names() -> MadResult<Vec<String>> {
        if cfg!(feature = "real-umad") {
            LibUmadPort::device_names()
        } else {
            Ok(vec!["mock_hfi1_0".to_string()])
        }
    }

    /// Attributes of an arbitrary port, without opening it
    pub fn query_port(ca_name: &str, port_num: u8) -> MadResult<PortAttributes> {
        if cfg!(feature = "real-umad") {
            LibUmadPort::query_port(ca_name, port_num)
        } else if port_num <= 1 {
            Ok(MockUmad::default_attributes(ca_name, 1))
        } else {
            Err(MadError::not_found(format!("{} port {}", ca_name, port_num)))
        }
    }

    pub fn port_attributes(&self) -> MadResult<PortAttributes> {
        match self {
            Self::Library(port) => port.port_attributes(),
            Self::Mock(port) => Ok(port.port_attributes()),
        }
    }

    pub fn register_agent(&self, spec: AgentSpec) -> MadResult<u32> {
        match self {
            Self::Library(port) => port.register_agent(spec),
            Self::Mock(port) => Ok(port.register_agent(spec)),
        }
    }

    pub fn unregister_agent(&self, agent_id: u32) {
        match self {
            Self::Library(port) => port.unregister_agent(agent_id),
            Self::Mock(_) => {}
        }
    }

    pub fn send(&self, agent_id: u32, mad: &[u8], addr: &MadAddr, timeout_ms: u32, retries: u32) -> MadResult<()> {
        match self {
            Self::Library(port) => port.send(agent_id, mad, addr, timeout_ms, retries),
            Self::Mock(port) => port.send(agent_id, mad, addr, timeout_ms, retries),
        }
    }

    pub fn recv(&self, buf_len: usize, timeout_ms: i32) -> RecvOutcome {
        match self {
            Self::Library(port) => port.recv(buf_len, timeout_ms),
            Self::Mock(port) => port.recv(buf_len, timeout_ms),
        }
    }

    pub fn mock(&self) -> Option<&MockUmad> {
        match self {
            Self::Mock(port) => Some(port),
            Self::Library(_) => None,
        }
    }
}

/// Header placed in front of every MAD exchanged with the kernel
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IbMadAddr {
    qpn: u32,
    qkey: u32,
    lid: u16,
    sl: u8,
    path_bits: u8,
    grh_present: u8,
    gid_index: u8,
    hop_limit: u8,
    traffic_class: u8,
    gid: [u8; 16],
    flow_label: u32,
    pkey_index: u16,
    reserved: [u8; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IbUserMad {
    agent_id: u32,
    status: u32,
    timeout_ms: u32,
    retries: u32,
    length: u32,
    addr: IbMadAddr,
}

const UMAD_HDR_SIZE: usize = std::mem::size_of::<IbUserMad>();

#[repr(C)]
struct UmadPortRaw {
    ca_name: [c_char; UMAD_CA_NAME_LEN],
    portnum: c_int,
    base_lid: c_uint,
    lmc: c_uint,
    sm_lid: c_uint,
    sm_sl: c_uint,
    state: c_uint,
    phys_state: c_uint,
    rate: c_uint,
    capmask: u32,
    gid_prefix: u64,
    port_guid: u64,
    pkeys_size: c_uint,
    pkeys: *mut u16,
    link_layer: [c_char; UMAD_CA_NAME_LEN],
}

/// libibumad function table
pub struct UmadApi {
    umad_init: Symbol<'static, unsafe extern "C" fn() -> c_int>,
    umad_get_cas_names: Symbol<'static, unsafe extern "C" fn(*mut [c_char; UMAD_CA_NAME_LEN], c_int) -> c_int>,
    umad_get_port: Symbol<'static, unsafe extern "C" fn(*const c_char, c_int, *mut UmadPortRaw) -> c_int>,
    umad_release_port: Symbol<'static, unsafe extern "C" fn(*mut UmadPortRaw) -> c_int>,
    umad_open_port: Symbol<'static, unsafe extern "C" fn(*const c_char, c_int) -> c_int>,
    umad_close_port: Symbol<'static, unsafe extern "C" fn(c_int) -> c_int>,
    umad_register: Symbol<'static, unsafe extern "C" fn(c_int, c_int, c_int, u8, *mut c_long) -> c_int>,
    umad_register_oui: Symbol<'static, unsafe extern "C" fn(c_int, c_int, u8, *mut u8, *mut c_long) -> c_int>,
    umad_unregister: Symbol<'static, unsafe extern "C" fn(c_int, c_int) -> c_int>,
    umad_send: Symbol<'static, unsafe extern "C" fn(c_int, c_int, *mut c_void, c_int, c_int, c_int) -> c_int>,
    umad_recv: Symbol<'static, unsafe extern "C" fn(c_int, *mut c_void, *mut c_int, c_int) -> c_int>,
}

static UMAD_API: OnceLock<Result<UmadApi, String>> = OnceLock::new();

impl UmadApi {
    /// Load libibumad and run its one-time initialization
    pub fn get() -> MadResult<&'static UmadApi> {
        UMAD_API
            .get_or_init(|| Self::load().map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|reason| MadError::unavailable(format!("libibumad: {}", reason)))
    }

    fn load() -> MadResult<Self> {
        info!("Loading libibumad");

        let lib_names = [
            "libibumad.so.3",
            "libibumad.so",
            "/usr/lib64/libibumad.so.3",
            "/usr/lib/x86_64-linux-gnu/libibumad.so.3",
        ];

        let library = lib_names
            .iter()
            .find_map(|name| {
                debug!("Trying to load umad library: {}", name);
                match unsafe { Library::new(name) } {
                    Ok(lib) => {
                        info!("Loaded umad library: {}", name);
                        Some(lib)
                    }
                    Err(e) => {
                        debug!("Failed to load {}: {}", name, e);
                        None
                    }
                }
            })
            .ok_or_else(|| MadError::unavailable("libibumad not found"))?;

        // Leak the library to get 'static lifetime for symbols
        let library: &'static Library = Box::leak(Box::new(library));

        let sym_err = |name: &str, e: libloading::Error| MadError::unavailable(format!("{} symbol: {}", name, e));
        let api = unsafe {
            UmadApi {
                umad_init: library.get(b"umad_init").map_err(|e| sym_err("umad_init", e))?,
                umad_get_cas_names: library
                    .get(b"umad_get_cas_names")
                    .map_err(|e| sym_err("umad_get_cas_names", e))?,
                umad_get_port: library.get(b"umad_get_port").map_err(|e| sym_err("umad_get_port", e))?,
                umad_release_port: library
                    .get(b"umad_release_port")
                    .map_err(|e| sym_err("umad_release_port", e))?,
                umad_open_port: library.get(b"umad_open_port").map_err(|e| sym_err("umad_open_port", e))?,
                umad_close_port: library.get(b"umad_close_port").map_err(|e| sym_err("umad_close_port", e))?,
                umad_register: library.get(b"umad_register").map_err(|e| sym_err("umad_register", e))?,
                umad_register_oui: library
                    .get(b"umad_register_oui")
                    .map_err(|e| sym_err("umad_register_oui", e))?,
                umad_unregister: library.get(b"umad_unregister").map_err(|e| sym_err("umad_unregister", e))?,
                umad_send: library.get(b"umad_send").map_err(|e| sym_err("umad_send", e))?,
                umad_recv: library.get(b"umad_recv").map_err(|e| sym_err("umad_recv", e))?,
            }
        };

        if unsafe { (api.umad_init)() } < 0 {
            return Err(MadError::unavailable("umad_init failed"));
        }
        Ok(api)
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn c_name(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// An open port on the kernel management interface
pub struct LibUmadPort {
    api: &'static UmadApi,
    fd: c_int,
    ca_name: CString,
    port_num: u8,
}

impl LibUmadPort {
    pub fn open(ca_name: &str, port_num: u8) -> MadResult<Self> {
        let api = UmadApi::get()?;
        let name = CString::new(ca_name).map_err(|_| MadError::invalid_parameter("device name contains NUL"))?;
        let fd = unsafe { (api.umad_open_port)(name.as_ptr(), port_num as c_int) };
        if fd < 0 {
            return Err(MadError::unavailable(format!(
                "umad_open_port({}, {}) failed: errno {}",
                ca_name,
                port_num,
                if fd < -1 { -fd } else { last_errno() }
            )));
        }
        info!("Opened umad port {}:{} (fd {})", ca_name, port_num, fd);
        Ok(Self {
            api,
            fd,
            ca_name: name,
            port_num,
        })
    }

    pub fn device_names() -> MadResult<Vec<String>> {
        let api = UmadApi::get()?;
        let mut names = [[0 as c_char; UMAD_CA_NAME_LEN]; UMAD_MAX_DEVICES];
        let n = unsafe { (api.umad_get_cas_names)(names.as_mut_ptr(), UMAD_MAX_DEVICES as c_int) };
        if n < 0 {
            return Err(MadError::unavailable("umad_get_cas_names failed"));
        }
        Ok(names[..n as usize].iter().map(|raw| c_name(raw)).collect())
    }

    pub fn query_port(ca_name: &str, port_num: u8) -> MadResult<PortAttributes> {
        let api = UmadApi::get()?;
        let name = CString::new(ca_name).map_err(|_| MadError::invalid_parameter("device name contains NUL"))?;
        Self::read_port(api, &name, port_num)
    }

    fn read_port(api: &UmadApi, name: &CStr, port_num: u8) -> MadResult<PortAttributes> {
        // SAFETY: umad_port is plain data; umad_get_port fills it in and
        // umad_release_port frees the pkey table it allocated.
        let mut raw: UmadPortRaw = unsafe { std::mem::zeroed() };
        if unsafe { (api.umad_get_port)(name.as_ptr(), port_num as c_int, &mut raw) } < 0 {
            return Err(MadError::not_found(format!(
                "{} port {}",
                name.to_string_lossy(),
                port_num
            )));
        }
        let pkeys = if raw.pkeys.is_null() {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(raw.pkeys, raw.pkeys_size as usize).to_vec() }
        };
        let attrs = PortAttributes {
            ca_name: c_name(&raw.ca_name),
            port_num: raw.portnum as u8,
            base_lid: raw.base_lid,
            lmc: raw.lmc as u8,
            sm_lid: raw.sm_lid,
            sm_sl: raw.sm_sl as u8,
            state: PortState::from(raw.state),
            gid_prefix: u64::from_be(raw.gid_prefix),
            port_guid: u64::from_be(raw.port_guid),
            pkeys,
            link_layer: c_name(&raw.link_layer),
        };
        unsafe { (api.umad_release_port)(&mut raw) };
        Ok(attrs)
    }

    pub fn port_attributes(&self) -> MadResult<PortAttributes> {
        Self::read_port(self.api, &self.ca_name, self.port_num)
    }

    pub fn register_agent(&self, spec: AgentSpec) -> MadResult<u32> {
        let id = match spec.oui {
            Some(mut oui) => unsafe {
                (self.api.umad_register_oui)(
                    self.fd,
                    spec.mgmt_class as c_int,
                    spec.rmpp_version,
                    oui.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            },
            None => unsafe {
                (self.api.umad_register)(
                    self.fd,
                    spec.mgmt_class as c_int,
                    spec.class_version as c_int,
                    spec.rmpp_version,
                    std::ptr::null_mut(),
                )
            },
        };
        if id < 0 {
            let errno = if id < -1 { -id } else { last_errno() };
            return Err(MadError::error(format!(
                "failed to register class 0x{:02x} version 0x{:x}: errno {}",
                spec.mgmt_class, spec.class_version, errno
            )));
        }
        Ok(id as u32)
    }

    pub fn unregister_agent(&self, agent_id: u32) {
        unsafe { (self.api.umad_unregister)(self.fd, agent_id as c_int) };
    }

    pub fn send(&self, agent_id: u32, mad: &[u8], addr: &MadAddr, timeout_ms: u32, retries: u32) -> MadResult<()> {
        let mut buf = vec![0u8; UMAD_HDR_SIZE + mad.len()];
        let mut mad_addr = IbMadAddr {
            qpn: addr.qpn.to_be(),
            qkey: addr.qkey.to_be(),
            lid: ((addr.lid & 0xffff) as u16).to_be(),
            sl: addr.sl,
            pkey_index: addr.pkey_index,
            ..Default::default()
        };
        if let Some(grh) = addr.grh {
            mad_addr.grh_present = 1;
            mad_addr.gid_index = grh.gid_index;
            mad_addr.hop_limit = grh.hop_limit;
            mad_addr.traffic_class = grh.traffic_class;
            mad_addr.gid = grh.gid.to_bytes();
            mad_addr.flow_label = grh.flow_label.to_be();
        }
        let hdr = IbUserMad {
            addr: mad_addr,
            ..Default::default()
        };
        // SAFETY: buf holds at least UMAD_HDR_SIZE bytes.
        unsafe { std::ptr::write_unaligned(buf.as_mut_ptr() as *mut IbUserMad, hdr) };
        buf[UMAD_HDR_SIZE..].copy_from_slice(mad);

        let rc = unsafe {
            (self.api.umad_send)(
                self.fd,
                agent_id as c_int,
                buf.as_mut_ptr() as *mut c_void,
                mad.len() as c_int,
                timeout_ms as c_int,
                retries as c_int,
            )
        };
        if rc < 0 {
            let errno = if rc < -1 { -rc } else { last_errno() };
            return Err(MadError::not_done(format!("umad_send failed: errno {}", errno)));
        }
        Ok(())
    }

    pub fn recv(&self, buf_len: usize, timeout_ms: i32) -> RecvOutcome {
        let mut buf = vec![0u8; UMAD_HDR_SIZE + buf_len];
        let mut length = buf_len as c_int;
        let rc = unsafe { (self.api.umad_recv)(self.fd, buf.as_mut_ptr() as *mut c_void, &mut length, timeout_ms) };
        if rc < 0 {
            if length as usize > buf_len {
                return RecvOutcome::TooLarge { length: length as usize };
            }
            let errno = if rc < -1 { -rc } else { last_errno() };
            return RecvOutcome::Failed { errno };
        }
        // SAFETY: buf holds at least UMAD_HDR_SIZE bytes.
        let hdr: IbUserMad = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const IbUserMad) };
        let grh = (hdr.addr.grh_present != 0).then(|| Grh {
            gid: Gid::from_bytes(&hdr.addr.gid),
            gid_index: hdr.addr.gid_index,
            hop_limit: hdr.addr.hop_limit,
            traffic_class: hdr.addr.traffic_class,
            flow_label: u32::from_be(hdr.addr.flow_label),
        });
        let len = (length.max(0) as usize).min(buf_len);
        RecvOutcome::Received(ReceivedMad {
            agent_id: rc as u32,
            status: hdr.status as i32,
            addr: MadAddr {
                lid: u16::from_be(hdr.addr.lid) as u32,
                sl: hdr.addr.sl,
                qpn: u32::from_be(hdr.addr.qpn),
                qkey: u32::from_be(hdr.addr.qkey),
                pkey_index: hdr.addr.pkey_index,
                grh,
            },
            data: buf[UMAD_HDR_SIZE..UMAD_HDR_SIZE + len].to_vec(),
        })
    }
}

impl Drop for LibUmadPort {
    fn drop(&mut self) {
        debug!("Closing umad port fd {}", self.fd);
        unsafe { (self.api.umad_close_port)(self.fd) };
    }
}

/// What the mock fabric does with a request
#[derive(Debug, Clone)]
pub enum MockReply {
    Reply(Vec<u8>),
    /// No response; the send completes with a timeout status
    Silent,
    /// The interface refuses the send
    Refuse,
    /// The send completes at once with a failed status
    Fail { status: i32 },
}

/// Produces mock fabric responses
pub trait MadResponder: Send + Sync {
    fn respond(&self, request: &[u8], addr: &MadAddr) -> MockReply;
}

impl<F> MadResponder for F
where
    F: Fn(&[u8], &MadAddr) -> MockReply + Send + Sync,
{
    fn respond(&self, request: &[u8], addr: &MadAddr) -> MockReply {
        self(request, addr)
    }
}

struct Pending {
    ready_at: Instant,
    mad: ReceivedMad,
}

/// Mock management interface for testing and development
pub struct MockUmad {
    attributes: RwLock<PortAttributes>,
    responder: RwLock<Arc<dyn MadResponder>>,
    inbox: Mutex<VecDeque<Pending>>,
    agents: Mutex<Vec<AgentSpec>>,
    sent: Mutex<Vec<(Vec<u8>, MadAddr)>>,
    next_agent: AtomicU32,
    send_count: AtomicUsize,
}

impl MockUmad {
    pub fn new(attributes: PortAttributes) -> Self {
        warn!("Using MOCK umad backend - for development only!");
        info!("   Device: {} port {} (mock)", attributes.ca_name, attributes.port_num);
        Self {
            attributes: RwLock::new(attributes),
            responder: RwLock::new(Arc::new(crate::mock::MockFabric::default())),
            inbox: Mutex::new(VecDeque::new()),
            agents: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            next_agent: AtomicU32::new(0),
            send_count: AtomicUsize::new(0),
        }
    }

    pub fn default_attributes(ca_name: &str, port_num: u8) -> PortAttributes {
        PortAttributes {
            ca_name: ca_name.to_string(),
            port_num: port_num.max(1),
            base_lid: 1,
            lmc: 0,
            sm_lid: 1,
            sm_sl: 0,
            state: PortState::Active,
            gid_prefix: 0xfe80_0000_0000_0000,
            port_guid: 0x0011_7501_0000_0001,
            pkeys: vec![0xffff, 0x7fff],
            link_layer: "InfiniBand".to_string(),
        }
    }

    pub fn set_responder(&self, responder: Arc<dyn MadResponder>) {
        *self.responder.write() = responder;
    }

    pub fn set_attributes(&self, attributes: PortAttributes) {
        *self.attributes.write() = attributes;
    }

    pub fn port_attributes(&self) -> PortAttributes {
        self.attributes.read().clone()
    }

    pub fn registered_agents(&self) -> Vec<AgentSpec> {
        self.agents.lock().clone()
    }

    pub fn send_count(&self) -> usize {
        self.send_count.load(Ordering::SeqCst)
    }

    /// Every MAD sent so far with its destination
    pub fn sent(&self) -> Vec<(Vec<u8>, MadAddr)> {
        self.sent.lock().clone()
    }

    /// Queue an unsolicited MAD, as if it arrived from the fabric
    pub fn inject(&self, data: Vec<u8>) {
        self.inbox.lock().push_back(Pending {
            ready_at: Instant::now(),
            mad: ReceivedMad {
                agent_id: 0,
                status: 0,
                addr: MadAddr::default(),
                data,
            },
        });
    }

    fn register_agent(&self, spec: AgentSpec) -> u32 {
        self.agents.lock().push(spec);
        self.next_agent.fetch_add(1, Ordering::SeqCst)
    }

    fn send(&self, agent_id: u32, mad: &[u8], addr: &MadAddr, timeout_ms: u32, retries: u32) -> MadResult<()> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push((mad.to_vec(), addr.clone()));

        let responder = self.responder.read().clone();
        match responder.respond(mad, addr) {
            MockReply::Refuse => Err(MadError::not_done("mock interface refused send")),
            MockReply::Reply(data) => {
                let data = kernel_layout(data);
                self.inbox.lock().push_back(Pending {
                    ready_at: Instant::now(),
                    mad: ReceivedMad {
                        agent_id,
                        status: 0,
                        addr: addr.clone(),
                        data,
                    },
                });
                Ok(())
            }
            MockReply::Fail { status } => {
                self.inbox.lock().push_back(Pending {
                    ready_at: Instant::now(),
                    mad: ReceivedMad {
                        agent_id,
                        status,
                        addr: addr.clone(),
                        data: mad.to_vec(),
                    },
                });
                Ok(())
            }
            MockReply::Silent => {
                let is_response = mad.get(3).map_or(false, |m| m & METHOD_RESP_BIT != 0);
                if timeout_ms > 0 && !is_response {
                    let wait = Duration::from_millis(timeout_ms as u64 * (retries as u64 + 1));
                    self.inbox.lock().push_back(Pending {
                        ready_at: Instant::now() + wait,
                        mad: ReceivedMad {
                            agent_id,
                            status: libc::ETIMEDOUT,
                            addr: addr.clone(),
                            data: mad.to_vec(),
                        },
                    });
                }
                Ok(())
            }
        }
    }

    fn recv(&self, buf_len: usize, timeout_ms: i32) -> RecvOutcome {
        let deadline = (timeout_ms >= 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        loop {
            let wake = {
                let mut inbox = self.inbox.lock();
                let now = Instant::now();
                if let Some(idx) = inbox.iter().position(|p| p.ready_at <= now) {
                    let len = inbox[idx].mad.data.len();
                    if len > buf_len {
                        return RecvOutcome::TooLarge { length: len };
                    }
                    if let Some(pending) = inbox.remove(idx) {
                        return RecvOutcome::Received(pending.mad);
                    }
                }
                let next_ready = inbox.iter().map(|p| p.ready_at).min();
                match (next_ready, deadline) {
                    (Some(ready), Some(deadline)) => ready.min(deadline),
                    (Some(ready), None) => ready,
                    (None, Some(deadline)) => deadline,
                    (None, None) => now + Duration::from_millis(10),
                }
            };
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return RecvOutcome::Failed { errno: libc::ETIMEDOUT };
                }
            }
            let now = Instant::now();
            if wake > now {
                std::thread::sleep((wake - now).min(Duration::from_millis(10)));
            }
        }
    }
}

/// Lay a large counters-service response out the way kernel RMPP reassembly does
fn kernel_layout(data: Vec<u8>) -> Vec<u8> {
    use crate::mad::{SA_DATA_OFFSET, STL_SA_DATA_SIZE};

    if data.len() <= STL_MAD_BLOCK_SIZE || data.get(1) != Some(&MCLASS_VFI_PM) {
        return data;
    }
    let mut out = data[..SA_DATA_OFFSET].to_vec();
    for (i, chunk) in data[SA_DATA_OFFSET..].chunks(STL_SA_DATA_SIZE).enumerate() {
        if i > 0 {
            out.extend_from_slice(&data[SA_DATA_OFFSET - RMPP_PA_SUBHEADER_LEN..SA_DATA_OFFSET]);
        }
        out.extend_from_slice(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_mock() -> MockUmad {
        let mock = MockUmad::new(MockUmad::default_attributes("mock0", 1));
        mock.set_responder(Arc::new(|_: &[u8], _: &MadAddr| MockReply::Silent));
        mock
    }

    #[test]
    #[cfg(not(feature = "real-umad"))]
    fn test_default_build_opens_mock_backend() {
        let backend = UmadBackend::open("mock_hfi1_0", 1).unwrap();
        assert!(backend.mock().is_some());
        assert_eq!(UmadBackend::device_names().unwrap(), vec!["mock_hfi1_0".to_string()]);
        assert!(UmadBackend::query_port("mock_hfi1_0", 1).is_ok());
        assert!(matches!(
            UmadBackend::query_port("mock_hfi1_0", 2),
            Err(MadError::NotFound { .. })
        ));
    }

    #[test]
    fn test_port_state_conversion() {
        assert_eq!(PortState::from(4), PortState::Active);
        assert_eq!(PortState::from(1), PortState::Down);
        assert_eq!(PortState::from(9), PortState::Other(9));
    }

    #[test]
    fn test_user_mad_header_size() {
        assert_eq!(std::mem::size_of::<IbMadAddr>(), 44);
        assert_eq!(UMAD_HDR_SIZE, 64);
    }

    #[test]
    fn test_mock_reply_roundtrip() {
        let mock = MockUmad::new(MockUmad::default_attributes("mock0", 1));
        mock.set_responder(Arc::new(|req: &[u8], _: &MadAddr| {
            let mut rsp = req.to_vec();
            rsp[3] |= METHOD_RESP_BIT;
            MockReply::Reply(rsp)
        }));
        let agent = mock.register_agent(AgentSpec {
            mgmt_class: 0x03,
            class_version: 0x80,
            rmpp_version: 1,
            oui: None,
        });
        mock.send(agent, &[0x80, 0x03, 0x80, 0x01], &MadAddr::default(), 100, 0).unwrap();

        match mock.recv(STL_MAD_BLOCK_SIZE, 100) {
            RecvOutcome::Received(mad) => {
                assert_eq!(mad.agent_id, agent);
                assert_eq!(mad.data[3], 0x81);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(mock.send_count(), 1);
    }

    #[test]
    fn test_mock_silent_send_reports_timeout_status() {
        let mock = silent_mock();
        mock.send(0, &[0x80, 0x03, 0x80, 0x01], &MadAddr::default(), 20, 1).unwrap();

        let start = Instant::now();
        match mock.recv(STL_MAD_BLOCK_SIZE, 500) {
            RecvOutcome::Received(mad) => assert_eq!(mad.status, libc::ETIMEDOUT),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_mock_recv_times_out_when_idle() {
        let mock = silent_mock();
        assert!(matches!(mock.recv(STL_MAD_BLOCK_SIZE, 20), RecvOutcome::Failed { errno } if errno == libc::ETIMEDOUT));
    }

    #[test]
    fn test_mock_large_message_needs_bigger_buffer() {
        let mock = silent_mock();
        mock.inject(vec![0u8; 3000]);
        assert!(matches!(mock.recv(STL_MAD_BLOCK_SIZE, 20), RecvOutcome::TooLarge { length: 3000 }));
        assert!(matches!(mock.recv(3000, 20), RecvOutcome::Received(_)));
    }

    #[test]
    fn test_kernel_layout_inserts_subheaders_for_counters_class() {
        use crate::mad::{SA_DATA_OFFSET, STL_SA_DATA_SIZE};

        let mut data = vec![0u8; SA_DATA_OFFSET + STL_SA_DATA_SIZE + 10];
        data[1] = MCLASS_VFI_PM;
        assert_eq!(kernel_layout(data.clone()).len(), data.len() + RMPP_PA_SUBHEADER_LEN);

        data[1] = 0x03;
        assert_eq!(kernel_layout(data.clone()).len(), data.len());
    }
}
