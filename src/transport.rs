//! Request/response capability shared by the native and out-of-band transports

use crate::umad::QP1_WELL_KNOWN_Q_KEY;
use crate::MadResult;
use serde::Serialize;

/// Which wire a session runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportKind {
    Native,
    OutOfBand,
}

/// Fabric destination of a request. Out-of-band transports ignore it; the
/// remote service addresses the fabric on the caller's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    /// 0 addresses the permissive LID
    pub lid: u32,
    pub sl: u8,
    pub pkey: u16,
    pub qpn: u32,
    pub qkey: u32,
}

impl Default for Destination {
    fn default() -> Self {
        Self::gsi(0, 0, 0xffff)
    }
}

impl Destination {
    /// The general services interface (QP1) of a port
    pub fn gsi(lid: u32, sl: u8, pkey: u16) -> Self {
        Self {
            lid,
            sl,
            pkey,
            qpn: 1,
            qkey: QP1_WELL_KNOWN_Q_KEY,
        }
    }
}

/// One request/response attempt over some wire
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Whether the session should resend the same request after a timeout.
    /// Transports that return false already waited the whole retry window.
    fn resends_on_timeout(&self) -> bool;

    /// Send `request` and wait up to `timeout_ms` for the matching response
    fn send_receive(&mut self, request: &[u8], dest: &Destination, timeout_ms: u64) -> MadResult<Vec<u8>>;

    /// Send without waiting for a response
    fn send(&mut self, mad: &[u8], dest: &Destination) -> MadResult<()>;

    /// Release wire resources; later calls fail
    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gsi_destination() {
        let dest = Destination::gsi(5, 2, 0x7fff);
        assert_eq!(dest.qpn, 1);
        assert_eq!(dest.qkey, 0x8001_0000);
        assert_eq!(Destination::default().lid, 0);
    }
}
