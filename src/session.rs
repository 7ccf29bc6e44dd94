//! Session management for MAD exchanges
//!
//! A `Session` owns one transport, chosen when it is opened, and the
//! session-wide timeout, retry count and transaction id counter. Native
//! sessions also own a cached copy of the local port's addressing data and a
//! background event monitor that keeps it current.

use crate::mad::{stamp_tid, RequestEnvelope, ResponseEnvelope};
use crate::monitor::{EventMonitor, MonitorCommand, PortEvent, DEFAULT_MONITOR_INTERVAL_MS};
use crate::native::{NativePort, NativeTransport};
use crate::oob::OobTransport;
use crate::sa::Notice;
use crate::transport::{Destination, Transport, TransportKind};
use crate::umad::{PortAttributes, PortState, UmadBackend, UMAD_MAX_PORTS};
use crate::{MadEngineConfig, MadError, MadResult, SessionMode, TlsConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};

/// Per-attempt wait substituted for non-positive timeouts
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
/// Retry count substituted for negative values
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Last known reachability of a fabric service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    /// Not checked since open or since the SM changed
    #[default]
    Unknown,
    Operational,
    /// A request went unanswered
    Down,
    /// The service could not be located
    Unavailable,
}

/// How a service-state query treats the cached state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    NoRefresh,
    /// Ping only when the cached state is not operational
    RefreshIfBad,
    RefreshAlways,
}

/// Fabric address of the primary performance manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PmAddress {
    pub lid: u32,
    pub sl: u8,
}

/// Cached local addressing data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressRecord {
    pub port: PortAttributes,
    pub primary_pm: Option<PmAddress>,
}

#[derive(Debug, Default)]
struct CacheState {
    record: AddressRecord,
    sa_state: ServiceState,
    pa_state: ServiceState,
}

/// Address record and service states, shared between the query path and
/// the event monitor behind a single lock
#[derive(Debug, Default)]
pub struct PortCache {
    state: Mutex<CacheState>,
}

impl PortCache {
    pub fn new(port: Option<PortAttributes>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                record: AddressRecord {
                    port: port.unwrap_or_default(),
                    primary_pm: None,
                },
                ..Default::default()
            }),
        }
    }

    /// Snapshot of the address record
    pub fn address(&self) -> AddressRecord {
        self.state.lock().record.clone()
    }

    pub fn replace_port(&self, port: PortAttributes) {
        self.state.lock().record.port = port;
    }

    /// Install new port attributes; with `reset_services` the SA/PA states
    /// and the PM address are forgotten in the same critical section
    pub fn apply_port_change(&self, port: PortAttributes, reset_services: bool) {
        let mut state = self.state.lock();
        state.record.port = port;
        if reset_services {
            state.record.primary_pm = None;
            state.sa_state = ServiceState::Unknown;
            state.pa_state = ServiceState::Unknown;
        }
    }

    pub fn set_primary_pm(&self, pm: Option<PmAddress>) {
        self.state.lock().record.primary_pm = pm;
    }

    pub fn sa_state(&self) -> ServiceState {
        self.state.lock().sa_state
    }

    pub fn set_sa_state(&self, sa_state: ServiceState) {
        let mut state = self.state.lock();
        if state.sa_state != sa_state {
            debug!("SA state: {:?} -> {:?}", state.sa_state, sa_state);
            state.sa_state = sa_state;
        }
    }

    pub fn pa_state(&self) -> ServiceState {
        self.state.lock().pa_state
    }

    pub fn set_pa_state(&self, pa_state: ServiceState) {
        let mut state = self.state.lock();
        if state.pa_state != pa_state {
            debug!("PA state: {:?} -> {:?}", state.pa_state, pa_state);
            state.pa_state = pa_state;
        }
    }

    /// Forget everything; used when the session closes
    pub fn invalidate(&self) {
        *self.state.lock() = CacheState::default();
    }
}

/// An open connection to the fabric management services
pub struct Session {
    transport: Box<dyn Transport>,
    native: Option<Arc<NativePort>>,
    cache: Arc<PortCache>,
    monitor: Option<EventMonitor>,
    timeout_ms: u64,
    retry_count: u32,
    next_tid: AtomicU64,
    closed: bool,
}

impl Session {
    /// Open a session as described by `config`
    pub fn open(config: &MadEngineConfig) -> MadResult<Self> {
        let interval = Duration::from_millis(config.monitor_interval_ms);
        let mut session = match &config.mode {
            SessionMode::Native {
                device: Some(device),
                port,
                ..
            } => Self::from_backend(UmadBackend::open(device, *port)?, interval)?,
            SessionMode::Native { device: None, hfi, port } => {
                let (device, port) = find_port_by_num(*hfi, *port)?;
                Self::from_backend(UmadBackend::open(&device, port)?, interval)?
            }
            SessionMode::Oob { host, port } => Self::open_oob(host, *port, config.tls.as_ref())?,
        };
        session.set_timeout(config.timeout_ms as i64);
        session.set_retry_count(config.retry_count as i32);
        Ok(session)
    }

    /// Open a local port by device name and port number
    pub fn open_port_by_name(device: &str, port: u8) -> MadResult<Self> {
        let backend = UmadBackend::open(device, port)?;
        Self::from_backend(backend, Duration::from_millis(DEFAULT_MONITOR_INTERVAL_MS))
    }

    /// Open a local port by 1-based device index. Index 0 picks the first
    /// device; port 0 picks its first active port.
    pub fn open_port_by_num(hfi: u32, port: u8) -> MadResult<Self> {
        let (device, port) = find_port_by_num(hfi, port)?;
        Self::open_port_by_name(&device, port)
    }

    /// Open whichever local port carries `port_guid`
    pub fn open_port_by_guid(port_guid: u64) -> MadResult<Self> {
        for device in UmadBackend::device_names()? {
            for port in 1..=UMAD_MAX_PORTS {
                match UmadBackend::query_port(&device, port) {
                    Ok(attrs) if attrs.port_guid == port_guid => return Self::open_port_by_name(&device, port),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
        Err(MadError::not_found(format!("port with GUID 0x{:016x}", port_guid)))
    }

    /// Connect to an out-of-band management service
    pub fn open_oob(host: &str, port: u16, tls: Option<&TlsConfig>) -> MadResult<Self> {
        let transport = OobTransport::connect(host, port, tls)?;
        Ok(Self::from_transport(Box::new(transport)))
    }

    /// Open a native session over an already opened interface backend
    pub fn from_backend(backend: UmadBackend, monitor_interval: Duration) -> MadResult<Self> {
        let attrs = backend.port_attributes()?;
        if attrs.state != PortState::Active {
            warn!("Port {} {} is {:?}, not Active", attrs.ca_name, attrs.port_num, attrs.state);
        }
        info!(
            "Opened {} port {} (LID 0x{:x}, SM LID 0x{:x})",
            attrs.ca_name, attrs.port_num, attrs.base_lid, attrs.sm_lid
        );

        let cache = Arc::new(PortCache::new(Some(attrs)));
        let port = Arc::new(NativePort::new(backend, cache.clone()));
        let monitor = EventMonitor::start(port.clone(), cache.clone(), monitor_interval)?;
        Ok(Self {
            transport: Box::new(NativeTransport::new(port.clone())),
            native: Some(port),
            cache,
            monitor: Some(monitor),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_count: DEFAULT_RETRY_COUNT,
            next_tid: AtomicU64::new(1),
            closed: false,
        })
    }

    /// Wrap an arbitrary transport. The session has no local port.
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            native: None,
            cache: Arc::new(PortCache::new(None)),
            monitor: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_count: DEFAULT_RETRY_COUNT,
            next_tid: AtomicU64::new(1),
            closed: false,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    pub(crate) fn cache(&self) -> &PortCache {
        &self.cache
    }

    /// Per-attempt timeout; non-positive values select the default
    pub fn set_timeout(&mut self, timeout_ms: i64) {
        self.timeout_ms = if timeout_ms <= 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            timeout_ms as u64
        };
    }

    /// Resends after a timeout; negative values select the default
    pub fn set_retry_count(&mut self, retries: i32) {
        self.retry_count = if retries < 0 {
            DEFAULT_RETRY_COUNT
        } else {
            retries as u32
        };
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Next transaction id; strictly increasing, never 0
    pub fn next_tid(&self) -> u64 {
        loop {
            let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
            if tid != 0 {
                return tid;
            }
        }
    }

    fn ensure_open(&self) -> MadResult<()> {
        if self.closed {
            return Err(MadError::invalid_state("session is closed"));
        }
        Ok(())
    }

    /// Directory and counters queries need an Active local port
    pub(crate) fn ensure_port_active(&self) -> MadResult<()> {
        if !self.is_native() {
            return Ok(());
        }
        let state = self.cache.address().port.state;
        if state != PortState::Active {
            return Err(MadError::invalid_state(format!("local port is {:?}, not Active", state)));
        }
        Ok(())
    }

    /// Send an encoded request under a fresh transaction id and wait for the
    /// response, retrying timeouts and refused sends
    pub fn send_recv_mad(&mut self, request: &[u8], dest: &Destination, timeout_ms: u64, retries: u32) -> MadResult<Vec<u8>> {
        self.ensure_open()?;
        let mut mad = request.to_vec();
        let tid = self.next_tid();
        stamp_tid(&mut mad, tid)?;

        if !self.transport.resends_on_timeout() {
            let window = timeout_ms.saturating_mul(retries as u64 + 1);
            return self.transport.send_receive(&mad, dest, window);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.send_receive(&mad, dest, timeout_ms) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt <= retries => {
                    debug!("tid 0x{:x} attempt {}/{} failed: {}", tid, attempt, retries + 1, e);
                }
                Err(e) => {
                    debug!(
                        "tid 0x{:x} failed after {} attempt(s) [{}]: {}",
                        tid,
                        attempt,
                        e.category(),
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Send an encoded MAD as-is without waiting for a response
    pub fn send_mad(&mut self, mad: &[u8], dest: &Destination) -> MadResult<()> {
        self.ensure_open()?;
        self.transport.send(mad, dest)
    }

    pub(crate) fn exchange(
        &mut self,
        request: &RequestEnvelope,
        dest: &Destination,
        timeout_ms: u64,
        retries: u32,
    ) -> MadResult<ResponseEnvelope> {
        let raw = self.send_recv_mad(&request.to_bytes(), dest, timeout_ms, retries)?;
        ResponseEnvelope::parse(raw)
    }

    /// Exchange one request using the session's timeout and retry count
    pub fn send_receive(&mut self, request: &RequestEnvelope, dest: &Destination) -> MadResult<ResponseEnvelope> {
        let (timeout_ms, retries) = (self.timeout_ms, self.retry_count);
        self.exchange(request, dest, timeout_ms, retries)
    }

    fn local_port(&self) -> MadResult<PortAttributes> {
        if !self.is_native() {
            return Err(MadError::invalid_state("no local port on an out-of-band session"));
        }
        self.ensure_open()?;
        Ok(self.cache.address().port)
    }

    pub fn port_lid(&self) -> MadResult<u32> {
        Ok(self.local_port()?.base_lid)
    }

    pub fn port_lmc(&self) -> MadResult<u8> {
        Ok(self.local_port()?.lmc)
    }

    pub fn port_sm_lid(&self) -> MadResult<u32> {
        Ok(self.local_port()?.sm_lid)
    }

    pub fn port_sm_sl(&self) -> MadResult<u8> {
        Ok(self.local_port()?.sm_sl)
    }

    pub fn port_prefix(&self) -> MadResult<u64> {
        Ok(self.local_port()?.gid_prefix)
    }

    pub fn port_guid(&self) -> MadResult<u64> {
        Ok(self.local_port()?.port_guid)
    }

    pub fn port_state(&self) -> MadResult<PortState> {
        Ok(self.local_port()?.state)
    }

    pub fn pkeys(&self) -> MadResult<Vec<u16>> {
        Ok(self.local_port()?.pkeys)
    }

    pub fn port_attributes(&self) -> MadResult<PortAttributes> {
        self.local_port()
    }

    /// Whether `lid` falls in the LMC range of the local port
    pub fn is_my_lid(&self, lid: u32) -> MadResult<bool> {
        let port = self.local_port()?;
        let count = 1u32 << port.lmc.min(7);
        Ok(lid >= port.base_lid && lid - port.base_lid < count)
    }

    pub fn sa_service_state(&mut self, mode: RefreshMode) -> MadResult<ServiceState> {
        self.local_port()?;
        let state = self.cache.sa_state();
        if needs_refresh(mode, state) {
            if let Err(e) = self.sa_ping() {
                debug!("SA ping failed: {}", e);
            }
        }
        Ok(self.cache.sa_state())
    }

    pub fn pa_service_state(&mut self, mode: RefreshMode) -> MadResult<ServiceState> {
        self.local_port()?;
        let state = self.cache.pa_state();
        if needs_refresh(mode, state) {
            if let Err(e) = self.pa_connect() {
                debug!("PM discovery failed: {}", e);
            }
        }
        Ok(self.cache.pa_state())
    }

    fn monitor(&self) -> MadResult<&EventMonitor> {
        self.ensure_open()?;
        self.monitor
            .as_ref()
            .ok_or_else(|| MadError::invalid_state("event monitoring requires a native session"))
    }

    /// Receive SA notices (traps and reports) delivered to this port
    pub fn subscribe_notices(&self) -> MadResult<UnboundedReceiver<Notice>> {
        let (tx, rx) = unbounded_channel();
        self.monitor()?.send(MonitorCommand::NoticesOn(tx))?;
        Ok(rx)
    }

    pub fn unsubscribe_notices(&self) -> MadResult<()> {
        self.monitor()?.send(MonitorCommand::NoticesOff)
    }

    /// Receive port state, LID, key table and SM change events
    pub fn subscribe_events(&self) -> MadResult<UnboundedReceiver<PortEvent>> {
        let (tx, rx) = unbounded_channel();
        self.monitor()?.send(MonitorCommand::EventsOn(tx))?;
        Ok(rx)
    }

    /// Ask the monitor to re-read the port attributes now
    pub fn request_refresh(&self) -> MadResult<()> {
        self.monitor()?.send(MonitorCommand::Refresh)
    }

    /// Stop the monitor, release the transport and drop cached addressing.
    /// Calling it again does nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut monitor) = self.monitor.take() {
            monitor.shutdown();
        }
        self.transport.close();
        self.cache.invalidate();
        info!("Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn needs_refresh(mode: RefreshMode, state: ServiceState) -> bool {
    match mode {
        RefreshMode::NoRefresh => false,
        RefreshMode::RefreshIfBad => state != ServiceState::Operational,
        RefreshMode::RefreshAlways => true,
    }
}

/// Resolve a 1-based device index and port number, 0 meaning "first"
/// (first device, first active port)
fn find_port_by_num(hfi: u32, port: u8) -> MadResult<(String, u8)> {
    let devices = UmadBackend::device_names()?;
    let index = hfi.saturating_sub(1) as usize;
    let device = devices
        .get(index)
        .cloned()
        .ok_or_else(|| MadError::not_found(format!("HFI {} ({} present)", hfi, devices.len())))?;
    if port != 0 {
        return Ok((device, port));
    }
    for candidate in 1..=UMAD_MAX_PORTS {
        match UmadBackend::query_port(&device, candidate) {
            Ok(attrs) if attrs.state == PortState::Active => return Ok((device, candidate)),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Err(MadError::not_found(format!("active port on {}", device)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mad::{peek_tid, MadHeader, MCLASS_SUBN_ADM, MCLASS_VFI_PM, METHOD_GET, METHOD_RESP_BIT, STL_SA_CLASS_VERSION};
    use crate::mock::MockFabric;
    use crate::oob::{decode_oob_packet, encode_frame, encode_oob_packet};
    use crate::pa::{
        FocusSelect, ImageId, FOCUS_MAX_RANGE, FOCUS_SELECT_CONGESTION, FOCUS_SELECT_SKIPPED, FOCUS_SELECT_UTIL_HIGH,
        FOCUS_SELECT_UTIL_LOW,
    };
    use crate::sa::{NodeQuery, SA_ATTR_CLASS_PORT_INFO};
    use crate::umad::{MadAddr, MockReply, MockUmad};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Fails every attempt after sleeping for the attempt's timeout
    struct StubTransport {
        resends: bool,
        error: fn(u64) -> MadError,
        attempts: Arc<AtomicUsize>,
        windows: Arc<Mutex<Vec<u64>>>,
        tids: Arc<Mutex<Vec<u64>>>,
    }

    impl StubTransport {
        fn timing_out(resends: bool) -> Self {
            Self {
                resends,
                error: |timeout_ms| MadError::Timeout { timeout_ms },
                attempts: Arc::new(AtomicUsize::new(0)),
                windows: Arc::new(Mutex::new(Vec::new())),
                tids: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Transport for StubTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Native
        }

        fn resends_on_timeout(&self) -> bool {
            self.resends
        }

        fn send_receive(&mut self, request: &[u8], _dest: &Destination, timeout_ms: u64) -> MadResult<Vec<u8>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.windows.lock().push(timeout_ms);
            self.tids.lock().push(peek_tid(request).unwrap());
            std::thread::sleep(Duration::from_millis(timeout_ms));
            Err((self.error)(timeout_ms))
        }

        fn send(&mut self, _mad: &[u8], _dest: &Destination) -> MadResult<()> {
            Ok(())
        }
    }

    fn cpi_request() -> RequestEnvelope {
        RequestEnvelope::new(MadHeader::new(
            MCLASS_SUBN_ADM,
            STL_SA_CLASS_VERSION,
            METHOD_GET,
            SA_ATTR_CLASS_PORT_INFO,
        ))
    }

    fn mock_session(attrs: PortAttributes) -> Session {
        let backend = UmadBackend::Mock(MockUmad::new(attrs));
        Session::from_backend(backend, Duration::from_millis(50)).unwrap()
    }

    #[test]
    fn test_retry_bound_with_timeouts() {
        let stub = StubTransport::timing_out(true);
        let attempts = stub.attempts.clone();
        let tids = stub.tids.clone();
        let mut session = Session::from_transport(Box::new(stub));
        session.set_timeout(100);
        session.set_retry_count(3);

        let start = Instant::now();
        let err = session.send_receive(&cpi_request(), &Destination::default()).unwrap_err();
        assert!(matches!(err, MadError::Timeout { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_millis(400));

        let tids = tids.lock();
        assert!(tids.iter().all(|&tid| tid == tids[0]));
    }

    #[test]
    fn test_single_window_without_resend() {
        let stub = StubTransport::timing_out(false);
        let attempts = stub.attempts.clone();
        let windows = stub.windows.clone();
        let mut session = Session::from_transport(Box::new(stub));
        session.set_timeout(20);
        session.set_retry_count(2);

        assert!(session.send_receive(&cpi_request(), &Destination::default()).is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*windows.lock(), vec![60]);
    }

    #[test]
    fn test_non_retryable_error_not_retried() {
        let mut stub = StubTransport::timing_out(true);
        stub.error = |_| MadError::reject("refused");
        let attempts = stub.attempts.clone();
        let mut session = Session::from_transport(Box::new(stub));
        session.set_timeout(1);

        let err = session.send_receive(&cpi_request(), &Destination::default()).unwrap_err();
        assert!(matches!(err, MadError::Reject { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tids_strictly_increasing() {
        let stub = StubTransport::timing_out(true);
        let tids = stub.tids.clone();
        let mut session = Session::from_transport(Box::new(stub));
        session.set_timeout(1);
        session.set_retry_count(0);

        for _ in 0..10 {
            let _ = session.send_receive(&cpi_request(), &Destination::default());
        }
        let tids = tids.lock();
        assert_eq!(tids.len(), 10);
        assert!(tids.windows(2).all(|w| w[0] < w[1]));
        assert_ne!(tids[0], 0);
    }

    #[test]
    fn test_tid_skips_zero_on_wrap() {
        let session = Session::from_transport(Box::new(StubTransport::timing_out(true)));
        session.next_tid.store(u64::MAX, Ordering::Relaxed);
        assert_eq!(session.next_tid(), u64::MAX);
        assert_eq!(session.next_tid(), 1);
    }

    #[test]
    fn test_defaults_substituted() {
        let mut session = Session::from_transport(Box::new(StubTransport::timing_out(true)));
        session.set_timeout(0);
        session.set_retry_count(-1);
        assert_eq!(session.timeout_ms(), DEFAULT_TIMEOUT_MS);
        assert_eq!(session.retry_count(), DEFAULT_RETRY_COUNT);
        session.set_retry_count(0);
        assert_eq!(session.retry_count(), 0);
        session.set_timeout(250);
        assert_eq!(session.timeout_ms(), 250);
    }

    #[test]
    fn test_port_accessors_need_local_port() {
        let session = Session::from_transport(Box::new(StubTransport::timing_out(true)));
        assert!(matches!(session.port_lid(), Err(MadError::InvalidState { .. })));
        assert!(matches!(session.subscribe_notices(), Err(MadError::InvalidState { .. })));
    }

    #[test]
    fn test_native_accessors() {
        let mut attrs = MockUmad::default_attributes("mock0", 1);
        attrs.base_lid = 0x10;
        attrs.lmc = 2;
        let session = mock_session(attrs);
        assert!(session.is_native());
        assert_eq!(session.port_lid().unwrap(), 0x10);
        assert_eq!(session.port_guid().unwrap(), 0x0011_7501_0000_0001);
        assert_eq!(session.port_state().unwrap(), PortState::Active);
        assert!(session.is_my_lid(0x13).unwrap());
        assert!(!session.is_my_lid(0x14).unwrap());
        assert!(!session.is_my_lid(0x0f).unwrap());
    }

    #[test]
    fn test_open_variants() {
        let session = Session::open_port_by_num(0, 0).unwrap();
        assert_eq!(session.port_lid().unwrap(), 1);
        assert!(matches!(Session::open_port_by_num(7, 0), Err(MadError::NotFound { .. })));
        assert!(Session::open_port_by_guid(0x0011_7501_0000_0001).is_ok());
        assert!(matches!(Session::open_port_by_guid(0xdead), Err(MadError::NotFound { .. })));
    }

    #[test]
    fn test_sa_queries_over_mock_fabric() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        assert_eq!(session.cache().sa_state(), ServiceState::Unknown);

        let nodes = session.sa_node_records(&NodeQuery::All).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(session.sa_service_state(RefreshMode::NoRefresh).unwrap(), ServiceState::Operational);

        let hosts = session.sa_node_records(&NodeQuery::Lid(3)).unwrap();
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn test_sa_query_without_matches_is_not_found() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        assert!(matches!(
            session.sa_node_records(&NodeQuery::Lid(0x99)),
            Err(MadError::NotFound { .. })
        ));
        assert_eq!(session.sa_service_state(RefreshMode::NoRefresh).unwrap(), ServiceState::Operational);
    }

    #[test]
    fn test_pa_queries_over_mock_fabric() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        let groups = session.pa_group_list().unwrap();
        assert!(groups.iter().any(|g| g == "All"));
        assert_eq!(session.pa_service_state(RefreshMode::NoRefresh).unwrap(), ServiceState::Operational);
        assert!(session.cache().address().primary_pm.is_some());

        // Large enough to span several RMPP segments
        let ports = session.pa_group_config("All", ImageId::CURRENT).unwrap();
        assert_eq!(ports.len(), 50);
    }

    #[test]
    fn test_pa_group_analysis_over_mock_fabric() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        let info = session.pa_group_info("All", ImageId::CURRENT).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].group_name, "All");
        assert_eq!(info[0].num_internal_ports, 50);
        assert_eq!(info[0].internal_util.bw_buckets[0], 50);

        let config = session.pa_pm_config().unwrap();
        assert_eq!(config.sweep_interval, 10);
        assert_eq!(config.integrity_weights[1], 100);

        let top = FocusSelect {
            select: FOCUS_SELECT_UTIL_HIGH,
            start: 0,
            range: 5,
        };
        let ports = session.pa_group_focus("All", ImageId::CURRENT, top).unwrap();
        assert_eq!(ports.len(), 5);
        assert_eq!((ports[0].node_lid, ports[0].port_number), (3, 1));
        assert!(ports.windows(2).all(|w| w[0].value >= w[1].value));

        let tail = FocusSelect { start: 48, range: 10, ..top };
        assert_eq!(session.pa_group_focus("All", ImageId::CURRENT, tail).unwrap().len(), 2);

        let low = FocusSelect {
            select: FOCUS_SELECT_UTIL_LOW,
            ..top
        };
        let ports = session.pa_group_focus("HFIs", ImageId::CURRENT, low).unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].node_lid, 1);

        assert!(matches!(
            session.pa_group_info("Nope", ImageId::CURRENT),
            Err(MadError::NotFound { .. })
        ));
        let skipped = FocusSelect {
            select: FOCUS_SELECT_SKIPPED,
            ..top
        };
        assert!(matches!(
            session.pa_group_focus("All", ImageId::CURRENT, skipped),
            Err(MadError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_focus_range_checked_before_send() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        session.pa_group_list().unwrap();
        let sent = session.native.as_ref().unwrap().backend().mock().unwrap().send_count();
        let wide = FocusSelect {
            select: FOCUS_SELECT_UTIL_HIGH,
            start: 0,
            range: FOCUS_MAX_RANGE + 1,
        };
        assert!(matches!(
            session.pa_vf_focus("Default", ImageId::CURRENT, wide),
            Err(MadError::InvalidParameter { .. })
        ));
        assert_eq!(session.native.as_ref().unwrap().backend().mock().unwrap().send_count(), sent);
        assert_eq!(session.pa_service_state(RefreshMode::NoRefresh).unwrap(), ServiceState::Operational);
    }

    #[test]
    fn test_pa_vf_queries_over_mock_fabric() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        let info = session.pa_vf_info("Admin", ImageId::CURRENT).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].num_ports, 2);

        let ports = session.pa_vf_config("Admin", ImageId::CURRENT).unwrap();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|p| p.node_desc.contains("hfi1_0")));
        assert_eq!(session.pa_vf_config("Default", ImageId::CURRENT).unwrap().len(), 50);

        let counters = session.pa_vf_port_counters("Admin", 3, 1, true, false, ImageId::CURRENT).unwrap();
        assert_eq!(counters.vf_name, "Admin");
        assert_eq!(counters.port_vf_xmit_data, 3_001_000 / 4);
        assert_eq!(counters.port_vf_xmit_wait, 3);

        let cleared = session.pa_clear_vf_port_counters("Default", 2, 7, 0xffff_0000).unwrap();
        assert_eq!((cleared.node_lid, cleared.port_number, cleared.select), (2, 7, 0xffff_0000));

        let congested = FocusSelect {
            select: FOCUS_SELECT_CONGESTION,
            start: 0,
            range: 1,
        };
        let ports = session.pa_vf_focus("Admin", ImageId::CURRENT, congested).unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!((ports[0].node_lid, ports[0].value), (3, 3));

        assert!(matches!(
            session.pa_vf_info("Storage", ImageId::CURRENT),
            Err(MadError::NotFound { .. })
        ));
        assert!(matches!(
            session.pa_vf_port_counters("Admin", 2, 1, true, false, ImageId::CURRENT),
            Err(MadError::NotFound { .. })
        ));
        assert_eq!(session.pa_service_state(RefreshMode::NoRefresh).unwrap(), ServiceState::Operational);
    }

    #[test]
    fn test_pa_requires_full_key() {
        let mut attrs = MockUmad::default_attributes("mock0", 1);
        attrs.pkeys = vec![0x7fff];
        let mut session = mock_session(attrs);

        assert!(session.sa_node_records(&NodeQuery::All).is_ok());
        assert!(matches!(session.pa_group_list(), Err(MadError::Protection { pkey: 0xffff })));
    }

    #[test]
    fn test_unanswered_sa_marks_services_down() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        session
            .native
            .as_ref()
            .unwrap()
            .backend()
            .mock()
            .unwrap()
            .set_responder(Arc::new(|_: &[u8], _: &MadAddr| MockReply::Silent));
        session.set_timeout(20);
        session.set_retry_count(1);

        assert!(matches!(session.sa_class_port_info(), Err(MadError::Timeout { .. })));
        assert_eq!(session.cache().sa_state(), ServiceState::Down);
        assert_eq!(session.cache().pa_state(), ServiceState::Down);
    }

    #[test]
    fn test_rejected_pa_query_marks_pa_down() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        assert!(session.pa_group_list().is_ok());
        assert_eq!(session.pa_service_state(RefreshMode::NoRefresh).unwrap(), ServiceState::Operational);

        let fabric = MockFabric::default();
        let responder = move |request: &[u8], _: &MadAddr| {
            if request[1] == MCLASS_VFI_PM {
                MockReply::Fail { status: libc::EIO }
            } else {
                fabric.answer(request).map_or(MockReply::Silent, MockReply::Reply)
            }
        };
        session
            .native
            .as_ref()
            .unwrap()
            .backend()
            .mock()
            .unwrap()
            .set_responder(Arc::new(responder));

        assert!(matches!(session.pa_group_list(), Err(MadError::Reject { .. })));
        assert_eq!(session.pa_service_state(RefreshMode::NoRefresh).unwrap(), ServiceState::Down);
        assert_eq!(session.cache().sa_state(), ServiceState::Operational);
    }

    #[test]
    fn test_class_port_info_sent_once() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        let sends = |session: &Session| session.native.as_ref().unwrap().backend().mock().unwrap().send_count();
        let before = sends(&session);

        let cpi = session.sa_class_port_info().unwrap();
        assert_eq!(cpi.class_version, 0x80);
        assert_eq!(sends(&session) - before, 1);
        assert_eq!(session.cache().sa_state(), ServiceState::Operational);

        session.sa_class_port_info().unwrap();
        assert_eq!(sends(&session) - before, 2);
    }

    #[test]
    fn test_inactive_port_fails_fast() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        let mut attrs = MockUmad::default_attributes("mock0", 1);
        attrs.state = PortState::Init;
        let mock = session.native.as_ref().unwrap().backend().mock().unwrap();
        mock.set_attributes(attrs.clone());
        let sent_before = mock.send_count();
        session.cache().replace_port(attrs);

        assert!(matches!(session.sa_node_records(&NodeQuery::All), Err(MadError::InvalidState { .. })));
        assert!(matches!(session.pa_group_list(), Err(MadError::InvalidState { .. })));
        let mock = session.native.as_ref().unwrap().backend().mock().unwrap();
        assert_eq!(mock.send_count(), sent_before);
        assert_eq!(session.cache().sa_state(), ServiceState::Unknown);
        assert_eq!(session.cache().pa_state(), ServiceState::Unknown);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut session = mock_session(MockUmad::default_attributes("mock0", 1));
        session.close();
        session.close();
        assert!(matches!(
            session.send_receive(&cpi_request(), &Destination::default()),
            Err(MadError::InvalidState { .. })
        ));
        assert_eq!(session.cache().address(), AddressRecord::default());
    }

    #[test]
    fn test_oob_session_against_fabric_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let fabric = MockFabric::default();
            let (mut sock, _) = listener.accept().unwrap();
            let mut header = [0u8; 8];
            while sock.read_exact(&mut header).is_ok() {
                let total = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
                let mut body = vec![0u8; total - 8];
                sock.read_exact(&mut body).unwrap();
                let request = decode_oob_packet(&body).unwrap();
                let mut response = fabric.answer(&request).unwrap();
                assert_ne!(response[3] & METHOD_RESP_BIT, 0);
                response[8..16].copy_from_slice(&request[8..16]);
                sock.write_all(&encode_frame(&encode_oob_packet(&response))).unwrap();
            }
        });

        let mut session = Session::open_oob("127.0.0.1", port, None).unwrap();
        assert_eq!(session.kind(), TransportKind::OutOfBand);
        assert_eq!(session.sa_node_records(&NodeQuery::All).unwrap().len(), 3);
        assert!(session.pa_group_list().unwrap().iter().any(|g| g == "HFIs"));
        assert!(matches!(session.port_lid(), Err(MadError::InvalidState { .. })));
        session.close();
        server.join().unwrap();
    }
}
