//! Native transport over the local management interface
//!
//! Requests are addressed to a LID on the fabric and sent through a kernel
//! agent registered for their class. Responses are matched on the low 32 bits
//! of the transaction id; anything else that arrives meanwhile is either an
//! unsolicited notice, forwarded to the event monitor, or a stale response,
//! which is dropped.

use crate::mad::{
    is_extended_lid, peek_tid, Gid, MadHeader, WireReader, MCLASS_SUBN_ADM, MCLASS_VENDOR_RANGE2_END,
    MCLASS_VENDOR_RANGE2_START, MCLASS_VFI_PM, METHOD_REPORT, METHOD_REPORT_RESP, METHOD_RESP_BIT, METHOD_TRAP,
    PERMISSIVE_LID, STL_MAD_BLOCK_SIZE, STL_OUI_BYTES, STL_PERMISSIVE_LID,
};
use crate::rmpp;
use crate::session::PortCache;
use crate::transport::{Destination, Transport, TransportKind};
use crate::umad::{AgentSpec, Grh, MadAddr, ReceivedMad, RecvOutcome, UmadBackend};
use crate::{MadError, MadResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Smallest MAD the interface accepts
const MIN_SEND_LEN: usize = 36;
/// Extra wait for the interface to return an unanswered send
const COMPLETION_GRACE_MS: u64 = 100;

/// Resolve the index of `pkey` in the local key table.
///
/// The full and limited default keys must match exactly; other keys match on
/// their low 15 bits, so either membership type is accepted.
pub fn resolve_pkey_index(pkeys: &[u16], pkey: u16) -> MadResult<u16> {
    let found = if pkey == 0xffff || pkey == 0x7fff {
        pkeys.iter().position(|&k| k == pkey)
    } else {
        pkeys.iter().position(|&k| k & 0x7fff == pkey & 0x7fff)
    };
    found.map(|ix| ix as u16).ok_or(MadError::Protection { pkey })
}

/// Length the interface is handed for a MAD of `len` bytes
pub fn padded_send_len(len: usize) -> usize {
    (len.max(MIN_SEND_LEN) + 7) & !7
}

fn agent_spec(mgmt_class: u8, class_version: u8) -> AgentSpec {
    let rmpp_version = if mgmt_class == MCLASS_SUBN_ADM
        || (MCLASS_VENDOR_RANGE2_START..=MCLASS_VENDOR_RANGE2_END).contains(&mgmt_class)
    {
        1
    } else {
        0
    };
    AgentSpec {
        mgmt_class,
        class_version,
        rmpp_version,
        oui: (mgmt_class == MCLASS_VFI_PM).then_some(STL_OUI_BYTES),
    }
}

/// Error for a send the interface completed with a failed status
fn completion_error(status: i32, timeout_ms: u64) -> MadError {
    if status == libc::ETIMEDOUT {
        MadError::Timeout { timeout_ms }
    } else {
        MadError::reject(format!("interface reported status {}", status))
    }
}

fn is_unsolicited(data: &[u8]) -> bool {
    matches!(data.get(3), Some(&METHOD_REPORT) | Some(&METHOD_TRAP))
}

/// An open local port, shared by the native transport and the event monitor
pub struct NativePort {
    backend: UmadBackend,
    cache: Arc<PortCache>,
    agents: Mutex<HashMap<(u8, u8), u32>>,
    recv_lock: Mutex<()>,
    stash: Mutex<VecDeque<ReceivedMad>>,
    notice_sink: Mutex<Option<UnboundedSender<Vec<u8>>>>,
}

impl NativePort {
    pub fn new(backend: UmadBackend, cache: Arc<PortCache>) -> Self {
        Self {
            backend,
            cache,
            agents: Mutex::new(HashMap::new()),
            recv_lock: Mutex::new(()),
            stash: Mutex::new(VecDeque::new()),
            notice_sink: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &UmadBackend {
        &self.backend
    }

    /// Where unsolicited REPORT/TRAP MADs go; `None` drops them
    pub fn set_notice_sink(&self, sink: Option<UnboundedSender<Vec<u8>>>) {
        *self.notice_sink.lock() = sink;
    }

    fn agent_for(&self, mgmt_class: u8, class_version: u8) -> MadResult<u32> {
        let mut agents = self.agents.lock();
        if let Some(&id) = agents.get(&(class_version, mgmt_class)) {
            return Ok(id);
        }
        let id = self.backend.register_agent(agent_spec(mgmt_class, class_version))?;
        debug!(
            "Registered agent {} for class 0x{:02x} version 0x{:02x}",
            id, mgmt_class, class_version
        );
        agents.insert((class_version, mgmt_class), id);
        Ok(id)
    }

    /// Address, pad and hand one MAD to the interface
    pub fn send_mad(&self, mad: &[u8], dest: &Destination, timeout_ms: u32, retries: u32) -> MadResult<()> {
        let header = MadHeader::decode(&mut WireReader::new(mad))?;
        let port = self.cache.address().port;
        let local_extended = is_extended_lid(port.base_lid);

        let lid = match dest.lid {
            0 if local_extended => STL_PERMISSIVE_LID,
            0 => PERMISSIVE_LID,
            lid => lid,
        };
        let grh = (is_extended_lid(lid) || local_extended).then(|| Grh {
            gid: Gid::for_extended_lid(port.gid_prefix, lid),
            gid_index: 0,
            hop_limit: 1,
            traffic_class: 0,
            flow_label: 0,
        });
        let addr = MadAddr {
            lid,
            sl: dest.sl,
            qpn: dest.qpn,
            qkey: dest.qkey,
            pkey_index: resolve_pkey_index(&port.pkeys, dest.pkey)?,
            grh,
        };

        let mut buf = mad.to_vec();
        buf.resize(padded_send_len(mad.len()), 0);
        let timeout_ms = if header.is_response() { 0 } else { timeout_ms };

        let agent = self.agent_for(header.mgmt_class, header.class_version)?;
        debug!(
            "send class 0x{:02x} method 0x{:02x} attr 0x{:04x} tid 0x{:x} to LID 0x{:x} ({} bytes)",
            header.mgmt_class,
            header.method,
            header.attr_id,
            header.tid,
            lid,
            buf.len()
        );
        self.backend.send(agent, &buf, &addr, timeout_ms, retries)
    }

    fn recv_raw(&self, timeout_ms: i32) -> MadResult<ReceivedMad> {
        loop {
            match self.backend.recv(STL_MAD_BLOCK_SIZE, timeout_ms) {
                RecvOutcome::Received(mad) => return Ok(mad),
                RecvOutcome::Failed { errno } if errno == libc::EINTR => continue,
                RecvOutcome::Failed { errno } if errno == libc::ETIMEDOUT || errno == libc::EAGAIN => {
                    return Err(MadError::Timeout {
                        timeout_ms: timeout_ms.max(0) as u64,
                    })
                }
                RecvOutcome::Failed { errno } => {
                    debug!("umad_recv failed: errno {}", errno);
                    return Err(MadError::from(errno));
                }
                RecvOutcome::TooLarge { length } => {
                    debug!("Pending MAD needs {} bytes, receiving into larger buffer", length);
                    return match self.backend.recv(length, timeout_ms) {
                        RecvOutcome::Received(mut mad) => {
                            if rmpp::needs_correction(&mad.data) {
                                mad.data = rmpp::strip_segment_subheaders(&mad.data)?;
                            }
                            Ok(mad)
                        }
                        _ => Err(MadError::Overrun { length }),
                    };
                }
            }
        }
    }

    /// Receive the next MAD for this process
    pub fn recv_mad(&self, timeout_ms: i32) -> MadResult<ReceivedMad> {
        let mut mad = {
            let _guard = self.recv_lock.lock();
            // poll_notices may have stashed a MAD while we waited for the lock
            let stashed = self.stash.lock().pop_front();
            match stashed {
                Some(mad) => mad,
                None => self.recv_raw(timeout_ms)?,
            }
        };
        if let Some(lid) = mad.addr.grh.and_then(|grh| grh.gid.extended_lid()) {
            mad.addr.lid = lid;
        }
        Ok(mad)
    }

    /// Forward a REPORT/TRAP to the monitor; REPORTs are acknowledged
    fn dispatch_unsolicited(&self, mad: ReceivedMad) {
        if mad.data.get(3) == Some(&METHOD_REPORT) {
            let mut ack = mad.data.clone();
            ack[3] = METHOD_REPORT_RESP;
            let dest = Destination {
                lid: mad.addr.lid,
                sl: mad.addr.sl,
                pkey: self.cache.address().port.pkeys.get(mad.addr.pkey_index as usize).copied().unwrap_or(0xffff),
                qpn: mad.addr.qpn,
                qkey: mad.addr.qkey,
            };
            if let Err(e) = self.send_mad(&ack, &dest, 0, 0) {
                warn!("Failed to acknowledge report: {}", e);
            }
        }
        match self.notice_sink.lock().as_ref() {
            Some(sink) => {
                if sink.send(mad.data).is_err() {
                    debug!("Notice receiver gone, dropping notice");
                }
            }
            None => debug!("No notice subscriber, dropping notice"),
        }
    }

    /// Drain MADs that arrived while no request was waiting. Returns the
    /// number of notices forwarded.
    pub fn poll_notices(&self) -> usize {
        let Some(_guard) = self.recv_lock.try_lock() else {
            return 0;
        };
        let mut forwarded = 0;
        loop {
            match self.backend.recv(STL_MAD_BLOCK_SIZE, 0) {
                RecvOutcome::Received(mad) if mad.status == 0 && is_unsolicited(&mad.data) => {
                    self.dispatch_unsolicited(mad);
                    forwarded += 1;
                }
                RecvOutcome::Received(mad) => self.stash.lock().push_back(mad),
                _ => break,
            }
        }
        forwarded
    }

    /// Wait for the response matching `tid`, forwarding or dropping the rest.
    ///
    /// The interface hands back a send that got no answer with a failed
    /// status once its own timeout expires, so the wait runs slightly past
    /// `timeout_ms` to collect that completion instead of leaving it queued.
    pub fn wait_response(&self, tid: u64, timeout_ms: u64) -> MadResult<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms + COMPLETION_GRACE_MS);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MadError::Timeout { timeout_ms });
            }
            let mad = match self.recv_mad(remaining.as_millis() as i32) {
                Ok(mad) => mad,
                Err(MadError::Timeout { .. }) => return Err(MadError::Timeout { timeout_ms }),
                Err(e) => return Err(e),
            };
            let tid_matches = peek_tid(&mad.data).map_or(false, |got| got as u32 == tid as u32);
            if mad.status != 0 {
                if tid_matches {
                    return Err(completion_error(mad.status, timeout_ms));
                }
                debug!("Discarding failed completion (status {}) of an earlier send", mad.status);
                continue;
            }
            if is_unsolicited(&mad.data) {
                self.dispatch_unsolicited(mad);
                continue;
            }
            let is_response = mad.data.get(3).map_or(false, |m| m & METHOD_RESP_BIT != 0);
            if tid_matches && is_response {
                return Ok(mad.data);
            }
            debug!(
                "Discarding unmatched MAD tid {:?} (waiting for 0x{:x})",
                peek_tid(&mad.data),
                tid
            );
        }
    }

    /// Unregister every agent this port registered
    pub fn close(&self) {
        for (_, id) in self.agents.lock().drain() {
            self.backend.unregister_agent(id);
        }
    }
}

/// `Transport` over a local port
pub struct NativeTransport {
    port: Arc<NativePort>,
}

impl NativeTransport {
    pub fn new(port: Arc<NativePort>) -> Self {
        Self { port }
    }

    pub fn port(&self) -> &Arc<NativePort> {
        &self.port
    }
}

impl Transport for NativeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Native
    }

    fn resends_on_timeout(&self) -> bool {
        true
    }

    fn send_receive(&mut self, request: &[u8], dest: &Destination, timeout_ms: u64) -> MadResult<Vec<u8>> {
        let tid = peek_tid(request).ok_or_else(|| MadError::invalid_parameter("request shorter than MAD header"))?;
        self.port.send_mad(request, dest, timeout_ms as u32, 0)?;
        self.port.wait_response(tid, timeout_ms)
    }

    fn send(&mut self, mad: &[u8], dest: &Destination) -> MadResult<()> {
        self.port.send_mad(mad, dest, 0, 0)
    }

    fn close(&mut self) {
        self.port.close();
    }
}
