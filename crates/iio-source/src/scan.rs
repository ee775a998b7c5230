//! Triggered-buffer record layout.
//!
//! Scan element types follow the kernel ABI: `[be|le]:[s|u]<bits>/<storagebits>[X<repeat>]>><shift>`.
//! Each element is aligned to its storage size inside a record and the record itself is
//! padded to the largest element.

use crate::{Result, SourceError};
use time::OffsetDateTime;

use crate::types::{RawScan, ScanElement};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanFormat {
    pub big_endian: bool,
    pub signed: bool,
    pub real_bits: u8,
    pub storage_bits: u8,
    pub shift: u8,
    pub repeat: u8,
}

impl ScanFormat {
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || SourceError::InvalidFormat(s.to_string());
        let s = s.trim();
        let (endian, rest) = s.split_once(':').ok_or_else(bad)?;
        let big_endian = match endian {
            "be" => true,
            "le" => false,
            _ => return Err(bad()),
        };
        let mut chars = rest.chars();
        let signed = match chars.next() {
            Some('s') => true,
            Some('u') => false,
            _ => return Err(bad()),
        };
        let rest = chars.as_str();
        let (bits, rest) = rest.split_once('/').ok_or_else(bad)?;
        let (storage, shift) = rest.split_once(">>").ok_or_else(bad)?;
        let (storage, repeat) = match storage.split_once('X') {
            Some((st, rep)) => (st, rep.parse::<u8>().map_err(|_| bad())?),
            None => (storage, 1),
        };
        let fmt = ScanFormat {
            big_endian,
            signed,
            real_bits: bits.parse().map_err(|_| bad())?,
            storage_bits: storage.parse().map_err(|_| bad())?,
            shift: shift.parse().map_err(|_| bad())?,
            repeat,
        };
        if !matches!(fmt.storage_bits, 8 | 16 | 32 | 64)
            || fmt.real_bits == 0
            || fmt.real_bits > fmt.storage_bits
            || u32::from(fmt.shift) + u32::from(fmt.real_bits) > u32::from(fmt.storage_bits)
        {
            return Err(bad());
        }
        Ok(fmt)
    }

    pub fn storage_bytes(&self) -> usize {
        usize::from(self.storage_bits / 8)
    }

    /// Decode one element from exactly `storage_bytes()` bytes.
    pub fn decode(&self, bytes: &[u8]) -> i64 {
        let mut raw: u64 = 0;
        if self.big_endian {
            for b in bytes {
                raw = (raw << 8) | u64::from(*b);
            }
        } else {
            for b in bytes.iter().rev() {
                raw = (raw << 8) | u64::from(*b);
            }
        }
        raw >>= self.shift;
        if self.real_bits < 64 {
            raw &= (1u64 << self.real_bits) - 1;
        }
        if self.signed && self.real_bits < 64 && raw & (1u64 << (self.real_bits - 1)) != 0 {
            raw |= !((1u64 << self.real_bits) - 1);
        }
        raw as i64
    }
}

#[derive(Clone, Debug)]
struct Slot {
    channel: Option<usize>,
    offset: usize,
    format: ScanFormat,
}

/// Byte layout of one buffer record for the enabled scan elements of a device.
#[derive(Clone, Debug)]
pub struct ScanLayout {
    slots: Vec<Slot>,
    record_len: usize,
}

impl ScanLayout {
    /// `elements` pairs a channel position (or `None` for the timestamp) with its scan element.
    pub fn new(mut elements: Vec<(Option<usize>, ScanElement)>) -> Result<Self> {
        if elements.is_empty() {
            return Err(SourceError::Unsupported("no scan elements enabled"));
        }
        elements.sort_by_key(|(_, e)| e.index);
        let mut slots = Vec::with_capacity(elements.len());
        let mut offset = 0usize;
        let mut largest = 1usize;
        for (channel, element) in elements {
            let size = element.format.storage_bytes();
            if element.format.repeat != 1 {
                return Err(SourceError::Unsupported("repeated scan elements"));
            }
            if offset % size != 0 {
                offset += size - offset % size;
            }
            slots.push(Slot {
                channel,
                offset,
                format: element.format,
            });
            offset += size;
            largest = largest.max(size);
        }
        if offset % largest != 0 {
            offset += largest - offset % largest;
        }
        Ok(Self {
            slots,
            record_len: offset,
        })
    }

    pub fn record_len(&self) -> usize {
        self.record_len
    }

    /// Decode one record. The timestamp element, if present, is interpreted as
    /// nanoseconds since the Unix epoch (the default IIO realtime clock).
    pub fn decode(&self, record: &[u8]) -> Result<RawScan> {
        if record.len() < self.record_len {
            return Err(SourceError::InvalidFormat(format!(
                "short record: {} < {}",
                record.len(),
                self.record_len
            )));
        }
        let mut values = Vec::with_capacity(self.slots.len());
        let mut timestamp = None;
        for slot in &self.slots {
            let end = slot.offset + slot.format.storage_bytes();
            let value = slot.format.decode(&record[slot.offset..end]);
            match slot.channel {
                Some(pos) => values.push((pos, value)),
                None => {
                    timestamp = OffsetDateTime::from_unix_timestamp_nanos(i128::from(value)).ok()
                }
            }
        }
        Ok(RawScan {
            values,
            timestamp: timestamp.unwrap_or_else(OffsetDateTime::now_utc),
        })
    }
}
