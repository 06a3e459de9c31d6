//! Control-channel wire format.
//!
//! A packed, little-endian header followed by an optional trailing buffer of
//! NUL-terminated domain names. Fields are decoded one at a time with bounds
//! checks; the buffer is never reinterpreted in place.

use std::net::{Ipv4Addr, Ipv6Addr};

use super::Action;
use crate::error::FilterError;
use crate::filter::{LayerKind, LayerSet, LAYER_COUNT};

// ============================================================================
// CONSTANTS
// ============================================================================

pub const FILTER_TRANSPORT_MAGIC: u32 = 0x3af3_bbcc;

pub const MAX_IPV4_ADDRESSES: usize = 512;
pub const MAX_IPV6_ADDRESSES: usize = 512;

pub const IPV4_ADDRESS_SIZE: usize = 4;
pub const IPV6_ADDRESS_SIZE: usize = 16;

/// Domain entries must be strictly shorter than this, terminator excluded.
pub const MAX_DOMAIN_LEN: usize = 254;

/// Encoded size of the fixed header.
pub const HEADER_SIZE: usize = 4 // magic
    + 2 // header size
    + LAYER_COUNT // layer enable flags
    + 2 // alert inbound / outbound
    + 3 // ipv4 / ipv6 / dns actions
    + 2 + MAX_IPV6_ADDRESSES * IPV6_ADDRESS_SIZE
    + 2 + MAX_IPV4_ADDRESSES * IPV4_ADDRESS_SIZE
    + 2; // dns buffer size

// ============================================================================
// HEADER
// ============================================================================

/// Decoded form of the fixed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyHeader {
    pub layers: LayerSet,
    pub alert_inbound: bool,
    pub alert_outbound: bool,
    pub ipv4_action: Action,
    pub ipv6_action: Action,
    pub dns_action: Action,
    pub ipv6_blocklist: Vec<Ipv6Addr>,
    pub ipv4_blocklist: Vec<Ipv4Addr>,
    pub dns_buffer_size: u16,
}

impl PolicyHeader {
    /// Decode and validate a full config buffer.
    ///
    /// Returns the header and the trailing domain buffer, which has already
    /// been checked with [`validate_domain_buffer`].
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), FilterError> {
        if buf.is_empty() {
            return Err(FilterError::BadParameters("empty config buffer".into()));
        }
        if buf.len() < HEADER_SIZE {
            return Err(FilterError::corrupt(format!(
                "config buffer is {} bytes, header needs {}",
                buf.len(),
                HEADER_SIZE
            )));
        }

        let mut reader = WireReader::new(buf);

        let magic = reader.read_u32()?;
        if magic != FILTER_TRANSPORT_MAGIC {
            return Err(FilterError::corrupt(format!("bad magic {:#010x}", magic)));
        }
        let header_size = reader.read_u16()? as usize;
        if header_size != HEADER_SIZE {
            return Err(FilterError::corrupt(format!(
                "header size {} does not match expected {}",
                header_size, HEADER_SIZE
            )));
        }

        let mut layers = LayerSet::empty();
        for layer in LayerKind::ALL {
            if reader.read_bool()? {
                layers.insert(layer);
            }
        }
        if layers.is_empty() {
            return Err(FilterError::corrupt("every interception layer is disabled"));
        }

        let alert_inbound = reader.read_bool()?;
        let alert_outbound = reader.read_bool()?;
        let ipv4_action = reader.read_action("ipv4")?;
        let ipv6_action = reader.read_action("ipv6")?;
        let dns_action = reader.read_action("dns")?;

        let num_ipv6 = reader.read_count(MAX_IPV6_ADDRESSES, "ipv6")?;
        let ipv6_slots = reader.take(MAX_IPV6_ADDRESSES * IPV6_ADDRESS_SIZE)?;
        let ipv6_blocklist = ipv6_slots
            .chunks_exact(IPV6_ADDRESS_SIZE)
            .take(num_ipv6)
            .map(|raw| {
                let mut octets = [0u8; IPV6_ADDRESS_SIZE];
                octets.copy_from_slice(raw);
                Ipv6Addr::from(octets)
            })
            .collect::<Vec<_>>();
        if ipv6_blocklist.iter().any(Ipv6Addr::is_unspecified) {
            return Err(FilterError::corrupt("ipv6 blocklist contains the zero address"));
        }

        let num_ipv4 = reader.read_count(MAX_IPV4_ADDRESSES, "ipv4")?;
        let ipv4_slots = reader.take(MAX_IPV4_ADDRESSES * IPV4_ADDRESS_SIZE)?;
        let ipv4_blocklist = parse_ipv4_pool(&ipv4_slots[..num_ipv4 * IPV4_ADDRESS_SIZE])?;

        let dns_buffer_size = reader.read_u16()?;

        let expected = HEADER_SIZE + dns_buffer_size as usize;
        if buf.len() != expected {
            return Err(FilterError::corrupt(format!(
                "config buffer is {} bytes, header declares {}",
                buf.len(),
                expected
            )));
        }
        let dns_buffer = reader.rest();
        validate_domain_buffer(dns_buffer)?;

        let header = Self {
            layers,
            alert_inbound,
            alert_outbound,
            ipv4_action,
            ipv6_action,
            dns_action,
            ipv6_blocklist,
            ipv4_blocklist,
            dns_buffer_size,
        };
        Ok((header, dns_buffer))
    }

    /// Encode this header followed by `dns_buffer`.
    ///
    /// `dns_buffer_size` is taken from `dns_buffer`, not from the field.
    pub fn encode(&self, dns_buffer: &[u8]) -> Result<Vec<u8>, FilterError> {
        if self.ipv4_blocklist.len() > MAX_IPV4_ADDRESSES {
            return Err(FilterError::BadParameters(format!(
                "{} ipv4 addresses exceed the {} entry header capacity",
                self.ipv4_blocklist.len(),
                MAX_IPV4_ADDRESSES
            )));
        }
        if self.ipv6_blocklist.len() > MAX_IPV6_ADDRESSES {
            return Err(FilterError::BadParameters(format!(
                "{} ipv6 addresses exceed the {} entry header capacity",
                self.ipv6_blocklist.len(),
                MAX_IPV6_ADDRESSES
            )));
        }
        let dns_size = u16::try_from(dns_buffer.len()).map_err(|_| FilterError::BufferTooLarge {
            len: dns_buffer.len(),
            max: u16::MAX as usize,
        })?;

        let mut out = Vec::with_capacity(HEADER_SIZE + dns_buffer.len());
        out.extend_from_slice(&FILTER_TRANSPORT_MAGIC.to_le_bytes());
        out.extend_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
        for layer in LayerKind::ALL {
            out.push(self.layers.contains(layer) as u8);
        }
        out.push(self.alert_inbound as u8);
        out.push(self.alert_outbound as u8);
        out.push(self.ipv4_action.as_wire());
        out.push(self.ipv6_action.as_wire());
        out.push(self.dns_action.as_wire());

        out.extend_from_slice(&(self.ipv6_blocklist.len() as u16).to_le_bytes());
        for addr in &self.ipv6_blocklist {
            out.extend_from_slice(&addr.octets());
        }
        pad(&mut out, (MAX_IPV6_ADDRESSES - self.ipv6_blocklist.len()) * IPV6_ADDRESS_SIZE);

        out.extend_from_slice(&(self.ipv4_blocklist.len() as u16).to_le_bytes());
        for addr in &self.ipv4_blocklist {
            out.extend_from_slice(&addr.octets());
        }
        pad(&mut out, (MAX_IPV4_ADDRESSES - self.ipv4_blocklist.len()) * IPV4_ADDRESS_SIZE);

        out.extend_from_slice(&dns_size.to_le_bytes());
        debug_assert_eq!(out.len(), HEADER_SIZE);
        out.extend_from_slice(dns_buffer);
        Ok(out)
    }
}

fn pad(out: &mut Vec<u8>, len: usize) {
    out.resize(out.len() + len, 0);
}

// ============================================================================
// ADDRESS POOLS & DOMAIN BUFFER
// ============================================================================

/// Split raw network-order bytes into addresses, rejecting `0.0.0.0`.
pub fn parse_ipv4_pool(raw: &[u8]) -> Result<Vec<Ipv4Addr>, FilterError> {
    if raw.len() % IPV4_ADDRESS_SIZE != 0 {
        return Err(FilterError::BadParameters(format!(
            "{} bytes is not a whole number of ipv4 addresses",
            raw.len()
        )));
    }

    let mut pool = Vec::new();
    pool.try_reserve_exact(raw.len() / IPV4_ADDRESS_SIZE)
        .map_err(|_| FilterError::OutOfMemory("ipv4 address pool"))?;

    for chunk in raw.chunks_exact(IPV4_ADDRESS_SIZE) {
        let addr = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        if addr.is_unspecified() {
            return Err(FilterError::corrupt(
                "ipv4 blocklist contains 0.0.0.0, which looks like a gateway",
            ));
        }
        pool.push(addr);
    }
    Ok(pool)
}

/// Check a NUL-delimited domain buffer. Returns the number of entries.
pub fn validate_domain_buffer(buf: &[u8]) -> Result<usize, FilterError> {
    if buf.is_empty() {
        return Ok(0);
    }
    if buf.last() != Some(&0) {
        return Err(FilterError::corrupt("domain buffer is not NUL terminated"));
    }

    let mut count = 0;
    for name in domain_entries(buf) {
        if name.is_empty() {
            return Err(FilterError::corrupt("empty domain entry"));
        }
        if name.len() >= MAX_DOMAIN_LEN {
            return Err(FilterError::corrupt(format!(
                "domain entry of {} bytes exceeds {}",
                name.len(),
                MAX_DOMAIN_LEN - 1
            )));
        }
        if !name.contains(&b'.') {
            return Err(FilterError::corrupt(format!(
                "domain entry {:?} has no '.'",
                String::from_utf8_lossy(name)
            )));
        }
        count += 1;
    }
    Ok(count)
}

/// Iterate over the entries of a NUL-delimited domain buffer, terminators stripped.
pub fn domain_entries(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    buf.split_inclusive(|b| *b == 0)
        .map(|entry| entry.strip_suffix(&[0]).unwrap_or(entry))
}

/// Flatten domain names into a NUL-delimited buffer.
pub fn encode_domain_buffer<S: AsRef<str>>(names: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_ref().as_bytes());
        out.push(0);
    }
    out
}

// ============================================================================
// READER
// ============================================================================

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FilterError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| FilterError::corrupt("config buffer truncated"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }

    fn read_u8(&mut self) -> Result<u8, FilterError> {
        Ok(self.take(1)?[0])
    }

    fn read_bool(&mut self) -> Result<bool, FilterError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u16(&mut self) -> Result<u16, FilterError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, FilterError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_action(&mut self, category: &str) -> Result<Action, FilterError> {
        let raw = self.read_u8()?;
        Action::from_wire(raw)
            .ok_or_else(|| FilterError::corrupt(format!("unknown {} action {}", category, raw)))
    }

    fn read_count(&mut self, capacity: usize, category: &str) -> Result<usize, FilterError> {
        let count = self.read_u16()? as usize;
        if count > capacity {
            return Err(FilterError::corrupt(format!(
                "{} {} addresses exceed the {} entry capacity",
                count, category, capacity
            )));
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> PolicyHeader {
        PolicyHeader {
            layers: LayerSet::from_layers(&[LayerKind::OutboundTransportV4]),
            alert_inbound: false,
            alert_outbound: true,
            ipv4_action: Action::Block,
            ipv6_action: Action::Alert,
            dns_action: Action::Pass,
            ipv6_blocklist: vec!["2001:db8::1".parse().unwrap()],
            ipv4_blocklist: vec![Ipv4Addr::new(203, 0, 113, 5)],
            dns_buffer_size: 0,
        }
    }

    #[test]
    fn test_header_size_matches_layout() {
        assert_eq!(HEADER_SIZE, 10263);
        let buf = header().encode(&[]).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[..4], &[0xcc, 0xbb, 0xf3, 0x3a]);
    }

    #[test]
    fn test_decode_reads_back_fields() {
        let dns = encode_domain_buffer(&["evil.example", "bad.test"]);
        let buf = header().encode(&dns).unwrap();

        let (decoded, trailing) = PolicyHeader::decode(&buf).unwrap();
        assert_eq!(trailing, dns.as_slice());
        assert_eq!(decoded.dns_buffer_size as usize, dns.len());
        assert_eq!(decoded.ipv4_blocklist, vec![Ipv4Addr::new(203, 0, 113, 5)]);
        assert_eq!(decoded.ipv4_action, Action::Block);
        assert!(decoded.layers.contains(LayerKind::OutboundTransportV4));
        assert!(!decoded.layers.contains(LayerKind::InboundTransportV4));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut buf = header().encode(&[]).unwrap();
        buf[0] ^= 0xff;
        assert!(matches!(
            PolicyHeader::decode(&buf),
            Err(FilterError::CorruptConfig(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_header_size() {
        let mut buf = header().encode(&[]).unwrap();
        buf[4] = buf[4].wrapping_add(1);
        assert!(matches!(
            PolicyHeader::decode(&buf),
            Err(FilterError::CorruptConfig(_))
        ));
    }

    #[test]
    fn test_rejects_all_layers_disabled() {
        let mut h = header();
        h.layers = LayerSet::empty();
        let buf = h.encode(&[]).unwrap();
        assert!(matches!(
            PolicyHeader::decode(&buf),
            Err(FilterError::CorruptConfig(_))
        ));
    }

    #[test]
    fn test_rejects_zero_addresses() {
        let mut h = header();
        h.ipv4_blocklist.push(Ipv4Addr::UNSPECIFIED);
        assert!(matches!(
            PolicyHeader::decode(&h.encode(&[]).unwrap()),
            Err(FilterError::CorruptConfig(_))
        ));

        let mut h = header();
        h.ipv6_blocklist.push(Ipv6Addr::UNSPECIFIED);
        assert!(matches!(
            PolicyHeader::decode(&h.encode(&[]).unwrap()),
            Err(FilterError::CorruptConfig(_))
        ));
    }

    #[test]
    fn test_rejects_dns_size_mismatch() {
        let dns = encode_domain_buffer(&["evil.example"]);
        let mut buf = header().encode(&dns).unwrap();
        buf.push(0);
        assert!(matches!(
            PolicyHeader::decode(&buf),
            Err(FilterError::CorruptConfig(_))
        ));

        let buf = header().encode(&dns).unwrap();
        assert!(matches!(
            PolicyHeader::decode(&buf[..buf.len() - 1]),
            Err(FilterError::CorruptConfig(_))
        ));
    }

    #[test]
    fn test_rejects_count_over_capacity() {
        let mut buf = header().encode(&[]).unwrap();
        let offset = HEADER_SIZE - 2 - MAX_IPV4_ADDRESSES * IPV4_ADDRESS_SIZE - 2;
        buf[offset..offset + 2].copy_from_slice(&(MAX_IPV4_ADDRESSES as u16 + 1).to_le_bytes());
        assert!(matches!(
            PolicyHeader::decode(&buf),
            Err(FilterError::CorruptConfig(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_action() {
        let mut buf = header().encode(&[]).unwrap();
        let offset = 4 + 2 + LAYER_COUNT + 2;
        buf[offset] = 9;
        assert!(matches!(
            PolicyHeader::decode(&buf),
            Err(FilterError::CorruptConfig(_))
        ));
    }

    #[test]
    fn test_empty_and_short_buffers() {
        assert!(matches!(
            PolicyHeader::decode(&[]),
            Err(FilterError::BadParameters(_))
        ));
        assert!(matches!(
            PolicyHeader::decode(&[0u8; 16]),
            Err(FilterError::CorruptConfig(_))
        ));
    }

    #[test]
    fn test_domain_buffer_rules() {
        assert_eq!(validate_domain_buffer(&[]).unwrap(), 0);
        assert_eq!(
            validate_domain_buffer(&encode_domain_buffer(&["a.b", "c.d"])).unwrap(),
            2
        );
        // no dot
        assert!(validate_domain_buffer(b"localhost\0").is_err());
        // missing terminator
        assert!(validate_domain_buffer(b"a.b").is_err());
        // empty entry
        assert!(validate_domain_buffer(b"a.b\0\0").is_err());

        let long = format!("{}.com", "x".repeat(MAX_DOMAIN_LEN - 4));
        assert_eq!(long.len(), MAX_DOMAIN_LEN);
        assert!(validate_domain_buffer(&encode_domain_buffer(&[long])).is_err());
        let fits = format!("{}.com", "x".repeat(MAX_DOMAIN_LEN - 5));
        assert!(validate_domain_buffer(&encode_domain_buffer(&[fits])).is_ok());
    }

    #[test]
    fn test_ipv4_pool_parsing() {
        let pool = parse_ipv4_pool(&[10, 0, 2, 1, 203, 0, 113, 5]).unwrap();
        assert_eq!(
            pool,
            vec![Ipv4Addr::new(10, 0, 2, 1), Ipv4Addr::new(203, 0, 113, 5)]
        );
        assert!(matches!(
            parse_ipv4_pool(&[1, 2, 3]),
            Err(FilterError::BadParameters(_))
        ));
        assert!(matches!(
            parse_ipv4_pool(&[1, 2, 3, 4, 0, 0, 0, 0]),
            Err(FilterError::CorruptConfig(_))
        ));
    }
}
