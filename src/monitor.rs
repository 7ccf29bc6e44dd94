//! Background event monitor for native sessions
//!
//! One thread per native session, named `mad-monitor`, running a
//! current-thread tokio runtime. It waits on the control channel, on notices
//! forwarded by the native transport and on a housekeeping interval. Each
//! housekeeping tick drains unsolicited MADs from the port and re-reads the
//! port attributes; differences from the cached address record are turned
//! into [`PortEvent`]s and the cache is replaced in one step.
//!
//! Port attributes are polled rather than read from transport async events,
//! so a link, LID, SM or key change is reported up to one interval late
//! ([`DEFAULT_MONITOR_INTERVAL_MS`] unless `monitor_interval_ms` is configured).
//! [`MonitorCommand::Refresh`] re-reads the port at once.

use crate::mad::{WireReader, WireRecord, SA_DATA_OFFSET};
use crate::native::NativePort;
use crate::sa::Notice;
use crate::session::PortCache;
use crate::umad::{PortAttributes, PortState};
use crate::{MadError, MadResult};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 5000;

/// Control messages from the owning session
#[derive(Debug)]
pub enum MonitorCommand {
    Shutdown,
    NoticesOn(UnboundedSender<Notice>),
    NoticesOff,
    EventsOn(UnboundedSender<PortEvent>),
    /// Re-read the port attributes without waiting for the next tick
    Refresh,
}

/// Change observed on the local port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PortEvent {
    PortActive,
    PortError { state: String },
    LidChange { old_lid: u32, new_lid: u32, lmc: u8 },
    PkeyChange,
    SmChange { old_lid: u32, new_lid: u32 },
}

/// Events implied by moving from `old` to `new` port attributes
pub fn diff_port(old: &PortAttributes, new: &PortAttributes) -> Vec<PortEvent> {
    let mut events = Vec::new();
    if old.state != new.state {
        events.push(match new.state {
            PortState::Active => PortEvent::PortActive,
            state => PortEvent::PortError {
                state: format!("{:?}", state),
            },
        });
    }
    if old.base_lid != new.base_lid || old.lmc != new.lmc {
        events.push(PortEvent::LidChange {
            old_lid: old.base_lid,
            new_lid: new.base_lid,
            lmc: new.lmc,
        });
    }
    if old.pkeys != new.pkeys {
        events.push(PortEvent::PkeyChange);
    }
    if old.sm_lid != new.sm_lid || old.sm_sl != new.sm_sl {
        events.push(PortEvent::SmChange {
            old_lid: old.sm_lid,
            new_lid: new.sm_lid,
        });
    }
    events
}

/// Decode the Notice carried by a REPORT/TRAP MAD
pub fn decode_notice(raw: &[u8]) -> MadResult<Notice> {
    let data = raw
        .get(SA_DATA_OFFSET..)
        .ok_or_else(|| MadError::error(format!("notice MAD of {} bytes has no data", raw.len())))?;
    Notice::decode(&mut WireReader::new(data))
}

/// Handle to the running monitor thread
pub struct EventMonitor {
    commands: UnboundedSender<MonitorCommand>,
    handle: Option<JoinHandle<()>>,
}

impl EventMonitor {
    pub fn start(port: Arc<NativePort>, cache: Arc<PortCache>, interval: Duration) -> MadResult<Self> {
        let (commands, command_rx) = unbounded_channel();
        let (notice_tx, notice_rx) = unbounded_channel();
        port.set_notice_sink(Some(notice_tx));

        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
        let interval = if interval.is_zero() {
            Duration::from_millis(DEFAULT_MONITOR_INTERVAL_MS)
        } else {
            interval
        };
        let handle = std::thread::Builder::new()
            .name("mad-monitor".to_string())
            .spawn(move || {
                let mut monitor = MonitorLoop {
                    port,
                    cache,
                    notices: None,
                    events: None,
                };
                runtime.block_on(monitor.run(interval, command_rx, notice_rx));
            })?;
        debug!("Event monitor started, interval {:?}", interval);

        Ok(Self {
            commands,
            handle: Some(handle),
        })
    }

    pub fn send(&self, command: MonitorCommand) -> MadResult<()> {
        self.commands
            .send(command)
            .map_err(|_| MadError::invalid_state("event monitor has stopped"))
    }

    /// Stop the thread and wait for it to exit
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.commands.send(MonitorCommand::Shutdown);
        if handle.join().is_err() {
            error!("Event monitor thread panicked");
        }
        debug!("Event monitor stopped");
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct MonitorLoop {
    port: Arc<NativePort>,
    cache: Arc<PortCache>,
    notices: Option<UnboundedSender<Notice>>,
    events: Option<UnboundedSender<PortEvent>>,
}

impl MonitorLoop {
    async fn run(
        &mut self,
        interval: Duration,
        mut commands: UnboundedReceiver<MonitorCommand>,
        mut raw_notices: UnboundedReceiver<Vec<u8>>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    None | Some(MonitorCommand::Shutdown) => break,
                    Some(MonitorCommand::NoticesOn(tx)) => self.notices = Some(tx),
                    Some(MonitorCommand::NoticesOff) => self.notices = None,
                    Some(MonitorCommand::EventsOn(tx)) => self.events = Some(tx),
                    Some(MonitorCommand::Refresh) => self.refresh(),
                },
                Some(raw) = raw_notices.recv() => self.deliver_notice(&raw),
                _ = ticker.tick() => {
                    let forwarded = self.port.poll_notices();
                    if forwarded > 0 {
                        debug!("Collected {} notice(s) while idle", forwarded);
                    }
                    self.refresh();
                }
            }
        }
        self.port.set_notice_sink(None);
    }

    fn deliver_notice(&mut self, raw: &[u8]) {
        let notice = match decode_notice(raw) {
            Ok(notice) => notice,
            Err(e) => {
                warn!("Dropping undecodable notice: {}", e);
                return;
            }
        };
        debug!(
            "Notice trap {} from LID 0x{:x}",
            notice.trap_number, notice.issuer_lid
        );
        if let Some(tx) = &self.notices {
            if tx.send(notice).is_err() {
                debug!("Notice subscriber gone");
                self.notices = None;
            }
        }
    }

    fn refresh(&mut self) {
        let new = match self.port.backend().port_attributes() {
            Ok(attrs) => attrs,
            Err(e) => {
                warn!("Failed to read port attributes: {}", e);
                return;
            }
        };
        let old = self.cache.address().port;
        if old == new {
            return;
        }
        let events = diff_port(&old, &new);
        let sm_changed = events.iter().any(|e| matches!(e, PortEvent::SmChange { .. }));
        self.cache.apply_port_change(new, sm_changed);

        for event in events {
            info!("Port event: {:?}", event);
            if let Some(tx) = &self.events {
                if tx.send(event).is_err() {
                    self.events = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mad::{MadHeader, RequestEnvelope, MCLASS_SUBN_ADM, METHOD_REPORT, STL_SA_CLASS_VERSION};
    use crate::sa::SA_ATTR_NOTICE;
    use crate::session::ServiceState;
    use crate::umad::{MockUmad, UmadBackend};
    use tokio::time::timeout;

    fn mock_port() -> (Arc<NativePort>, Arc<PortCache>) {
        let attrs = MockUmad::default_attributes("mock0", 1);
        let cache = Arc::new(PortCache::new(Some(attrs.clone())));
        let port = Arc::new(NativePort::new(UmadBackend::Mock(MockUmad::new(attrs)), cache.clone()));
        (port, cache)
    }

    #[test]
    fn test_diff_port() {
        let old = MockUmad::default_attributes("mock0", 1);
        assert!(diff_port(&old, &old).is_empty());

        let mut new = old.clone();
        new.state = PortState::Down;
        new.sm_lid = 7;
        let events = diff_port(&old, &new);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PortEvent::PortError { .. }));
        assert_eq!(events[1], PortEvent::SmChange { old_lid: 1, new_lid: 7 });

        let mut keys = old.clone();
        keys.pkeys.push(0x8001);
        assert_eq!(diff_port(&old, &keys), vec![PortEvent::PkeyChange]);
    }

    #[test]
    fn test_decode_notice_requires_data() {
        assert!(decode_notice(&[0u8; 40]).is_err());
    }

    #[tokio::test]
    async fn test_lid_change_updates_cache() {
        let (port, cache) = mock_port();
        let mut monitor = EventMonitor::start(port.clone(), cache.clone(), Duration::from_millis(20)).unwrap();
        let (tx, mut rx) = unbounded_channel();
        monitor.send(MonitorCommand::EventsOn(tx)).unwrap();

        let mut attrs = MockUmad::default_attributes("mock0", 1);
        attrs.base_lid = 0x22;
        port.backend().mock().unwrap().set_attributes(attrs);

        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, PortEvent::LidChange { old_lid: 1, new_lid: 0x22, lmc: 0 });
        assert_eq!(cache.address().port.base_lid, 0x22);
        monitor.shutdown();
    }

    #[tokio::test]
    async fn test_sm_change_resets_services() {
        let (port, cache) = mock_port();
        cache.set_sa_state(ServiceState::Operational);
        cache.set_pa_state(ServiceState::Operational);
        let mut monitor = EventMonitor::start(port.clone(), cache.clone(), Duration::from_millis(20)).unwrap();
        let (tx, mut rx) = unbounded_channel();
        monitor.send(MonitorCommand::EventsOn(tx)).unwrap();

        let mut attrs = MockUmad::default_attributes("mock0", 1);
        attrs.sm_lid = 9;
        port.backend().mock().unwrap().set_attributes(attrs);
        monitor.send(MonitorCommand::Refresh).unwrap();

        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, PortEvent::SmChange { old_lid: 1, new_lid: 9 });
        assert_eq!(cache.sa_state(), ServiceState::Unknown);
        assert_eq!(cache.pa_state(), ServiceState::Unknown);
        monitor.shutdown();
    }

    #[tokio::test]
    async fn test_change_waits_for_tick_or_refresh() {
        let (port, cache) = mock_port();
        let mut monitor = EventMonitor::start(port.clone(), cache.clone(), Duration::from_secs(60)).unwrap();
        let (tx, mut rx) = unbounded_channel();
        monitor.send(MonitorCommand::EventsOn(tx)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut attrs = MockUmad::default_attributes("mock0", 1);
        attrs.state = PortState::Down;
        port.backend().mock().unwrap().set_attributes(attrs);
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        assert_eq!(cache.address().port.state, PortState::Active);

        monitor.send(MonitorCommand::Refresh).unwrap();
        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, PortEvent::PortError { .. }));
        assert_eq!(cache.address().port.state, PortState::Down);
        monitor.shutdown();
    }

    #[tokio::test]
    async fn test_report_delivered_as_notice() {
        let (port, cache) = mock_port();
        let mut monitor = EventMonitor::start(port.clone(), cache, Duration::from_millis(20)).unwrap();
        let (tx, mut rx) = unbounded_channel();
        monitor.send(MonitorCommand::NoticesOn(tx)).unwrap();

        let notice = Notice {
            is_generic: true,
            notice_type: 3,
            trap_number: 64,
            issuer_lid: 2,
            data: vec![0u8; 64],
            ..Default::default()
        };
        let report = RequestEnvelope::new(MadHeader::new(MCLASS_SUBN_ADM, STL_SA_CLASS_VERSION, METHOD_REPORT, SA_ATTR_NOTICE))
            .with_payload(notice.to_bytes())
            .to_bytes();
        port.backend().mock().unwrap().inject(report);

        let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.trap_number, 64);
        assert_eq!(got.issuer_lid, 2);
        monitor.shutdown();
    }

    #[test]
    fn test_shutdown_joins_thread() {
        let (port, cache) = mock_port();
        let mut monitor = EventMonitor::start(port, cache, Duration::from_millis(20)).unwrap();
        monitor.shutdown();
        assert!(monitor.send(MonitorCommand::Refresh).is_err());
        monitor.shutdown();
    }
}
