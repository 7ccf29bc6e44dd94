//! Management datagram wire layer
//!
//! Header codecs, wire constants and a pair of length-checked cursors used by
//! every record decoder in the crate. All multi-byte fields travel in network
//! byte order; decoding never reads past the end of the received buffer.

use crate::{MadError, MadResult};
use serde::Serialize;
use std::fmt;

pub const IB_BASE_VERSION: u8 = 0x01;
pub const STL_BASE_VERSION: u8 = 0x80;

pub const MCLASS_SUBN_ADM: u8 = 0x03;
pub const MCLASS_VFI_PM: u8 = 0x32;
pub const MCLASS_VENDOR_RANGE2_START: u8 = 0x30;
pub const MCLASS_VENDOR_RANGE2_END: u8 = 0x4f;

pub const STL_SA_CLASS_VERSION: u8 = 0x80;
pub const STL_PA_CLASS_VERSION: u8 = 0x80;

pub const METHOD_GET: u8 = 0x01;
pub const METHOD_SET: u8 = 0x02;
pub const METHOD_TRAP: u8 = 0x05;
pub const METHOD_REPORT: u8 = 0x06;
pub const METHOD_GET_RESP: u8 = 0x81;
pub const METHOD_REPORT_RESP: u8 = 0x86;
pub const METHOD_GETTABLE: u8 = 0x12;
pub const METHOD_GETTABLE_RESP: u8 = 0x92;
pub const METHOD_RESP_BIT: u8 = 0x80;

pub const MAD_HEADER_SIZE: usize = 24;
pub const RMPP_HEADER_SIZE: usize = 12;
pub const SA_HEADER_SIZE: usize = 20;
/// Offset of class data in SA and PA MADs (MAD + RMPP + SA headers)
pub const SA_DATA_OFFSET: usize = MAD_HEADER_SIZE + RMPP_HEADER_SIZE + SA_HEADER_SIZE;
pub const STL_MAD_BLOCK_SIZE: usize = 2048;
pub const STL_SA_DATA_SIZE: usize = STL_MAD_BLOCK_SIZE - SA_DATA_OFFSET;
/// Byte offset of the three-byte vendor OUI in a vendor-class MAD
pub const VENDOR_OUI_OFFSET: usize = MAD_HEADER_SIZE + RMPP_HEADER_SIZE + 1;

/// Vendor OUI carried by counters-service MADs and extended-LID GIDs
pub const STL_OUI: u32 = 0x00066a;
pub const STL_OUI_BYTES: [u8; 3] = [0x00, 0x06, 0x6a];

pub const MAD_STATUS_SUCCESS: u16 = 0x0000;
pub const MAD_STATUS_BUSY: u16 = 0x0001;
pub const MAD_STATUS_REDIRECT: u16 = 0x0002;
pub const MAD_STATUS_UNSUPPORTED_CLASS_VER: u16 = 0x0004;
pub const MAD_STATUS_UNSUPPORTED_METHOD: u16 = 0x0008;
pub const MAD_STATUS_UNSUPPORTED_METHOD_ATTRIB: u16 = 0x000c;
pub const MAD_STATUS_INVALID_ATTRIB: u16 = 0x001c;

/// Largest LID usable without extended addressing
pub const MAX_CLASSIC_UNICAST_LID: u32 = 0xbfff;
pub const PERMISSIVE_LID: u32 = 0xffff;
pub const STL_PERMISSIVE_LID: u32 = 0xffff_ffff;

/// Length-checked big-endian reader over a received buffer
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> MadResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(MadError::error(format!(
                "truncated record: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> MadResult<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> MadResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> MadResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> MadResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> MadResult<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> MadResult<u64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn array<const N: usize>(&mut self) -> MadResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Fixed-width NUL-padded text field
    pub fn text(&mut self, len: usize) -> MadResult<String> {
        let raw = self.bytes(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub fn gid(&mut self) -> MadResult<Gid> {
        Ok(Gid {
            prefix: self.u64()?,
            interface_id: self.u64()?,
        })
    }
}

/// Big-endian writer building an outbound MAD
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.put_u32(v as u32)
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn put_zeros(&mut self, len: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + len, 0);
        self
    }

    /// Fixed-width text field, truncated to leave room for the terminator
    pub fn put_text(&mut self, text: &str, len: usize) -> &mut Self {
        let raw = text.as_bytes();
        let n = raw.len().min(len.saturating_sub(1));
        self.buf.extend_from_slice(&raw[..n]);
        self.put_zeros(len - n)
    }

    pub fn put_gid(&mut self, gid: &Gid) -> &mut Self {
        self.put_u64(gid.prefix).put_u64(gid.interface_id)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// 128-bit global identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Gid {
    pub prefix: u64,
    pub interface_id: u64,
}

impl Gid {
    /// Derive the GID that carries an extended LID in its low bits
    pub fn for_extended_lid(prefix: u64, lid: u32) -> Self {
        Self {
            prefix,
            interface_id: ((STL_OUI as u64) << 40) | lid as u64,
        }
    }

    /// The LID embedded in an extended-LID GID, if this is one
    pub fn extended_lid(&self) -> Option<u32> {
        if (self.interface_id >> 40) as u32 == STL_OUI {
            Some((self.interface_id & 0xffff_ffff) as u32)
        } else {
            None
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.prefix.to_be_bytes());
        out[8..].copy_from_slice(&self.interface_id.to_be_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; 16]) -> Self {
        let mut prefix = [0u8; 8];
        let mut iid = [0u8; 8];
        prefix.copy_from_slice(&raw[..8]);
        iid.copy_from_slice(&raw[8..]);
        Self {
            prefix: u64::from_be_bytes(prefix),
            interface_id: u64::from_be_bytes(iid),
        }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}:0x{:016x}", self.prefix, self.interface_id)
    }
}

/// Whether a LID needs extended addressing
pub fn is_extended_lid(lid: u32) -> bool {
    lid > MAX_CLASSIC_UNICAST_LID && lid != PERMISSIVE_LID
}

/// Common 24-byte MAD header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MadHeader {
    pub base_version: u8,
    pub mgmt_class: u8,
    pub class_version: u8,
    pub method: u8,
    pub status: u16,
    pub class_specific: u16,
    pub tid: u64,
    pub attr_id: u16,
    pub attr_mod: u32,
}

impl MadHeader {
    pub fn new(mgmt_class: u8, class_version: u8, method: u8, attr_id: u16) -> Self {
        Self {
            base_version: STL_BASE_VERSION,
            mgmt_class,
            class_version,
            method,
            attr_id,
            ..Default::default()
        }
    }

    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u8(self.base_version)
            .put_u8(self.mgmt_class)
            .put_u8(self.class_version)
            .put_u8(self.method)
            .put_u16(self.status)
            .put_u16(self.class_specific)
            .put_u64(self.tid)
            .put_u16(self.attr_id)
            .put_u16(0)
            .put_u32(self.attr_mod);
    }

    pub fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let base_version = r.u8()?;
        let mgmt_class = r.u8()?;
        let class_version = r.u8()?;
        let method = r.u8()?;
        let status = r.u16()?;
        let class_specific = r.u16()?;
        let tid = r.u64()?;
        let attr_id = r.u16()?;
        r.skip(2)?;
        let attr_mod = r.u32()?;
        Ok(Self {
            base_version,
            mgmt_class,
            class_version,
            method,
            status,
            class_specific,
            tid,
            attr_id,
            attr_mod,
        })
    }

    pub fn is_response(&self) -> bool {
        self.method & METHOD_RESP_BIT != 0
    }
}

/// 12-byte RMPP header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RmppHeader {
    pub version: u8,
    pub rmpp_type: u8,
    pub resp_time_flags: u8,
    pub status: u8,
    pub segment: u32,
    pub payload_len: u32,
}

impl RmppHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u8(self.version)
            .put_u8(self.rmpp_type)
            .put_u8(self.resp_time_flags)
            .put_u8(self.status)
            .put_u32(self.segment)
            .put_u32(self.payload_len);
    }

    pub fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        Ok(Self {
            version: r.u8()?,
            rmpp_type: r.u8()?,
            resp_time_flags: r.u8()?,
            status: r.u8()?,
            segment: r.u32()?,
            payload_len: r.u32()?,
        })
    }
}

/// 20-byte subnet-administration class header, also used by the counters service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaHeader {
    pub sm_key: u64,
    /// Record stride in 8-byte units
    pub attribute_offset: u16,
    pub component_mask: u64,
}

impl SaHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.sm_key)
            .put_u16(self.attribute_offset)
            .put_u16(0)
            .put_u64(self.component_mask);
    }

    pub fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
        let sm_key = r.u64()?;
        let attribute_offset = r.u16()?;
        r.skip(2)?;
        let component_mask = r.u64()?;
        Ok(Self {
            sm_key,
            attribute_offset,
            component_mask,
        })
    }
}

/// Outbound management operation
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub header: MadHeader,
    pub sa_header: SaHeader,
    /// Tagged into the class header after encoding; never byte-swapped
    pub vendor_oui: Option<[u8; 3]>,
    pub payload: Vec<u8>,
}

impl RequestEnvelope {
    pub fn new(header: MadHeader) -> Self {
        Self {
            header,
            sa_header: SaHeader::default(),
            vendor_oui: None,
            payload: Vec::new(),
        }
    }

    pub fn with_component_mask(mut self, mask: u64) -> Self {
        self.sa_header.component_mask = mask;
        self
    }

    pub fn with_attr_mod(mut self, attr_mod: u32) -> Self {
        self.header.attr_mod = attr_mod;
        self
    }

    pub fn with_vendor_oui(mut self, oui: [u8; 3]) -> Self {
        self.vendor_oui = Some(oui);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize headers and payload in network byte order
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(SA_DATA_OFFSET + self.payload.len());
        self.header.encode(&mut w);
        RmppHeader::default().encode(&mut w);
        self.sa_header.encode(&mut w);
        w.put_bytes(&self.payload);
        let mut out = w.into_inner();
        if let Some(oui) = self.vendor_oui {
            out[VENDOR_OUI_OFFSET..VENDOR_OUI_OFFSET + 3].copy_from_slice(&oui);
        }
        out
    }
}

/// Write a transaction id into an encoded MAD
pub fn stamp_tid(mad: &mut [u8], tid: u64) -> MadResult<()> {
    if mad.len() < MAD_HEADER_SIZE {
        return Err(MadError::invalid_parameter(format!(
            "MAD of {} bytes is shorter than its header",
            mad.len()
        )));
    }
    mad[8..16].copy_from_slice(&tid.to_be_bytes());
    Ok(())
}

/// Read the transaction id of an encoded MAD
pub fn peek_tid(mad: &[u8]) -> Option<u64> {
    mad.get(8..16).map(|b| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        u64::from_be_bytes(raw)
    })
}

/// Number of records in a multi-record response.
///
/// A GET response always holds exactly one record; table responses divide the
/// class data by the stride advertised in `attribute_offset`.
pub fn record_count(len: usize, method: u8, attribute_offset: u16) -> usize {
    if method == METHOD_GET_RESP {
        1
    } else if attribute_offset != 0 {
        len.saturating_sub(SA_DATA_OFFSET) / (attribute_offset as usize * 8)
    } else {
        0
    }
}

/// A fixed-layout record carried in SA/PA class data
pub trait WireRecord: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    fn decode(r: &mut WireReader<'_>) -> MadResult<Self>;

    fn encode(&self, w: &mut WireWriter);

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(Self::SIZE);
        self.encode(&mut w);
        w.into_inner()
    }
}

/// Decoded reply
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub header: MadHeader,
    pub sa_header: SaHeader,
    raw: Vec<u8>,
}

impl ResponseEnvelope {
    /// Parse the MAD and class headers of a received SA/PA response
    pub fn parse(raw: Vec<u8>) -> MadResult<Self> {
        if raw.len() < SA_DATA_OFFSET {
            return Err(MadError::not_found(format!(
                "response of {} bytes carries no class header",
                raw.len()
            )));
        }
        let mut r = WireReader::new(&raw);
        let header = MadHeader::decode(&mut r)?;
        r.skip(RMPP_HEADER_SIZE)?;
        let sa_header = SaHeader::decode(&mut r)?;
        Ok(Self { header, sa_header, raw })
    }

    pub fn status(&self) -> u16 {
        self.header.status
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len() <= SA_DATA_OFFSET
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[SA_DATA_OFFSET..]
    }

    pub fn record_count(&self) -> usize {
        record_count(self.raw.len(), self.header.method, self.sa_header.attribute_offset)
    }

    /// Bytes per record; a GET response's single record spans the rest of the MAD
    pub fn record_stride(&self) -> usize {
        if self.header.method == METHOD_GET_RESP {
            self.payload().len()
        } else {
            self.sa_header.attribute_offset as usize * 8
        }
    }

    /// Decode every record in the response
    pub fn records<T: WireRecord>(&self) -> MadResult<Vec<T>> {
        let count = self.record_count();
        let stride = self.record_stride();
        if count > 0 && stride < T::SIZE {
            return Err(MadError::error(format!(
                "record stride {} smaller than record size {}",
                stride,
                T::SIZE
            )));
        }
        let payload = self.payload();
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let start = i * stride;
            let end = start + stride;
            let slice = payload.get(start..end).ok_or_else(|| {
                MadError::error(format!("record {} exceeds response of {} bytes", i, self.raw.len()))
            })?;
            out.push(T::decode(&mut WireReader::new(slice))?);
        }
        Ok(out)
    }

    /// Decode the single record of a GET response
    pub fn single<T: WireRecord>(&self) -> MadResult<T> {
        let mut records = self.records::<T>()?;
        if records.is_empty() {
            return Err(MadError::not_found("record in response"));
        }
        Ok(records.swap_remove(0))
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }
}

/// Human-readable text for the generic part of a MAD status
pub fn status_text(status: u16) -> &'static str {
    match status & 0x00ff {
        MAD_STATUS_SUCCESS if status == MAD_STATUS_SUCCESS => "Success",
        MAD_STATUS_SUCCESS => "Class specific error",
        MAD_STATUS_BUSY => "Busy",
        MAD_STATUS_REDIRECT => "Redirection required",
        MAD_STATUS_UNSUPPORTED_CLASS_VER => "Unsupported class or version",
        MAD_STATUS_UNSUPPORTED_METHOD => "Unsupported method",
        MAD_STATUS_UNSUPPORTED_METHOD_ATTRIB => "Unsupported method/attribute combination",
        MAD_STATUS_INVALID_ATTRIB => "Invalid attribute or modifier",
        _ => "Unknown status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        a: u32,
        b: u32,
    }

    impl WireRecord for Pair {
        const SIZE: usize = 8;

        fn decode(r: &mut WireReader<'_>) -> MadResult<Self> {
            Ok(Self { a: r.u32()?, b: r.u32()? })
        }

        fn encode(&self, w: &mut WireWriter) {
            w.put_u32(self.a).put_u32(self.b);
        }
    }

    fn table_response(attribute_offset: u16, payload: &[u8]) -> Vec<u8> {
        let mut header = MadHeader::new(MCLASS_SUBN_ADM, STL_SA_CLASS_VERSION, METHOD_GETTABLE_RESP, 0x11);
        header.tid = 7;
        let mut req = RequestEnvelope::new(header).with_payload(payload.to_vec());
        req.sa_header.attribute_offset = attribute_offset;
        req.to_bytes()
    }

    #[test]
    fn test_header_layout() {
        let mut header = MadHeader::new(MCLASS_VFI_PM, STL_PA_CLASS_VERSION, METHOD_GET, 0xa3);
        header.tid = 0x0102_0304_0506_0708;
        header.attr_mod = 0xdead_beef;
        let bytes = RequestEnvelope::new(header).to_bytes();

        assert_eq!(bytes.len(), SA_DATA_OFFSET);
        assert_eq!(&bytes[0..4], &[0x80, 0x32, 0x80, 0x01]);
        assert_eq!(&bytes[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[16..18], &[0x00, 0xa3]);
        assert_eq!(&bytes[20..24], &[0xde, 0xad, 0xbe, 0xef]);

        let decoded = MadHeader::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_vendor_oui_written_after_headers() {
        let header = MadHeader::new(MCLASS_VFI_PM, STL_PA_CLASS_VERSION, METHOD_GET, 0xa0);
        let mut req = RequestEnvelope::new(header).with_vendor_oui(STL_OUI_BYTES);
        req.sa_header.sm_key = u64::MAX;
        let bytes = req.to_bytes();
        assert_eq!(&bytes[37..40], &[0x00, 0x06, 0x6a]);
        assert_eq!(bytes[36], 0xff);
    }

    #[test]
    fn test_record_count_rules() {
        assert_eq!(record_count(SA_DATA_OFFSET + 256, METHOD_GETTABLE_RESP, 8), 4);
        assert_eq!(record_count(SA_DATA_OFFSET + 100, METHOD_GET_RESP, 0), 1);
        assert_eq!(record_count(SA_DATA_OFFSET + 100, METHOD_GETTABLE_RESP, 0), 0);
        assert_eq!(record_count(SA_DATA_OFFSET + 70, METHOD_GETTABLE_RESP, 1), 8);
    }

    #[test]
    fn test_directory_table_with_64_byte_stride() {
        let payload = vec![0u8; 256];
        let resp = ResponseEnvelope::parse(table_response(8, &payload)).unwrap();
        assert_eq!(resp.record_count(), 4);
        assert_eq!(resp.record_stride(), 64);
    }

    #[test]
    fn test_records_decode_with_stride() {
        let mut payload = Vec::new();
        for i in 0..3u32 {
            payload.extend_from_slice(&Pair { a: i, b: i * 10 }.to_bytes());
            payload.extend_from_slice(&[0u8; 8]);
        }
        let resp = ResponseEnvelope::parse(table_response(2, &payload)).unwrap();
        let records: Vec<Pair> = resp.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].a, 2);
        assert_eq!(records[2].b, 20);
    }

    #[test]
    fn test_short_stride_is_rejected() {
        let resp = ResponseEnvelope::parse(table_response(0, &[]));
        assert!(resp.unwrap().records::<Pair>().unwrap().is_empty());

        let mut raw = table_response(0, &[0u8; 4]);
        raw[3] = METHOD_GET_RESP;
        let resp = ResponseEnvelope::parse(raw).unwrap();
        assert!(resp.records::<Pair>().is_err());
    }

    #[test]
    fn test_truncated_response_is_not_found() {
        let err = ResponseEnvelope::parse(vec![0u8; 30]).unwrap_err();
        assert!(matches!(err, MadError::NotFound { .. }));
    }

    #[test]
    fn test_reader_never_overreads() {
        let mut r = WireReader::new(&[1, 2, 3]);
        assert_eq!(r.u16().unwrap(), 0x0102);
        assert!(r.u32().is_err());
        assert_eq!(r.u8().unwrap(), 3);
    }

    #[test]
    fn test_text_fields() {
        let mut w = WireWriter::new();
        w.put_text("All", 64);
        let raw = w.into_inner();
        assert_eq!(raw.len(), 64);
        assert_eq!(WireReader::new(&raw).text(64).unwrap(), "All");

        let mut w = WireWriter::new();
        w.put_text(&"x".repeat(80), 64);
        assert_eq!(w.len(), 64);
        assert_eq!(w.into_inner()[63], 0);
    }

    #[test]
    fn test_extended_lid_gid() {
        let gid = Gid::for_extended_lid(0xfe80_0000_0000_0000, 0x0001_0002);
        assert_eq!(gid.extended_lid(), Some(0x0001_0002));
        assert_eq!(Gid::from_bytes(&gid.to_bytes()), gid);
        assert_eq!(Gid { prefix: 0, interface_id: 0x1234 }.extended_lid(), None);
        assert!(is_extended_lid(0xc000));
        assert!(!is_extended_lid(0xbfff));
        assert!(!is_extended_lid(PERMISSIVE_LID));
    }

    #[test]
    fn test_tid_stamping() {
        let mut raw = vec![0u8; MAD_HEADER_SIZE];
        stamp_tid(&mut raw, 42).unwrap();
        assert_eq!(peek_tid(&raw), Some(42));
        assert!(stamp_tid(&mut [0u8; 4], 1).is_err());
    }
}
