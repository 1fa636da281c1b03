//! Metric block codec and the KV-backed data flusher.
//!
//! A flushed memory database becomes one KV value per metric key. The
//! block layout is length-prefixed little-endian:
//!
//! ```text
//! [version u8][slot_start u16][slot_end u16][series_count u32]
//!   per series: [series_id u32][field_count u16]
//!     per field: [field_id u16][point_count u16]
//!       per point: [slot u16][value f64]
//! ```
//!
//! The writer side is [`KvDataFlusher`]: the memory database streams
//! fields, then seals a series, then seals the metric; the sealed metric
//! is encoded and staged on the underlying KV flusher. `close` commits
//! the KV batch, publishing all blocks and the sequence footer at once.

use gale_common::error::KvError;
use gale_common::timeutil::SlotRange;
use gale_common::types::{FieldId, MetricId, SeriesId};
use gale_kv::Flusher as _;

const BLOCK_VERSION: u8 = 1;

/// Point list for one field: `(slot, value)`, sorted by slot.
pub type FieldPoints = Vec<(u16, f64)>;

/// Receives a memory database's contents during a flush, hierarchically:
/// fields accumulate under the open series, series under the open metric.
pub trait MetricDataFlusher {
    fn flush_field(&mut self, field_id: FieldId, points: &[(u16, f64)]) -> Result<(), KvError>;

    /// Seal the open series from the fields flushed since the last seal.
    fn flush_series(&mut self, series_id: SeriesId) -> Result<(), KvError>;

    /// Seal the open metric and stage its block.
    fn flush_metric(&mut self, metric_id: MetricId) -> Result<(), KvError>;

    /// Publish everything staged so far.
    fn close(&mut self) -> Result<(), KvError>;
}

/// [`MetricDataFlusher`] that encodes sealed metrics into blocks on a KV
/// flusher. Dropping without `close` abandons the KV batch.
pub struct KvDataFlusher {
    flusher: Box<dyn gale_kv::Flusher>,
    pending_fields: Vec<(FieldId, FieldPoints)>,
    pending_series: Vec<(SeriesId, Vec<(FieldId, FieldPoints)>)>,
}

impl KvDataFlusher {
    pub fn new(flusher: Box<dyn gale_kv::Flusher>) -> Self {
        Self {
            flusher,
            pending_fields: Vec::new(),
            pending_series: Vec::new(),
        }
    }
}

impl MetricDataFlusher for KvDataFlusher {
    fn flush_field(&mut self, field_id: FieldId, points: &[(u16, f64)]) -> Result<(), KvError> {
        if !points.is_empty() {
            self.pending_fields.push((field_id, points.to_vec()));
        }
        Ok(())
    }

    fn flush_series(&mut self, series_id: SeriesId) -> Result<(), KvError> {
        if !self.pending_fields.is_empty() {
            self.pending_series
                .push((series_id, std::mem::take(&mut self.pending_fields)));
        }
        Ok(())
    }

    fn flush_metric(&mut self, metric_id: MetricId) -> Result<(), KvError> {
        let series = std::mem::take(&mut self.pending_series);
        if series.is_empty() {
            return Ok(());
        }
        let block = encode_block(&series);
        self.flusher.add(metric_id, block)
    }

    fn close(&mut self) -> Result<(), KvError> {
        self.flusher.commit()
    }
}

fn encode_block(series: &[(SeriesId, Vec<(FieldId, FieldPoints)>)]) -> Vec<u8> {
    let mut slot_start = u16::MAX;
    let mut slot_end = 0u16;
    for (_, fields) in series {
        for (_, points) in fields {
            for (slot, _) in points {
                slot_start = slot_start.min(*slot);
                slot_end = slot_end.max(*slot);
            }
        }
    }

    let mut buf = Vec::with_capacity(64);
    buf.push(BLOCK_VERSION);
    buf.extend_from_slice(&slot_start.to_le_bytes());
    buf.extend_from_slice(&slot_end.to_le_bytes());
    buf.extend_from_slice(&(series.len() as u32).to_le_bytes());
    for (series_id, fields) in series {
        buf.extend_from_slice(&series_id.to_le_bytes());
        buf.extend_from_slice(&(fields.len() as u16).to_le_bytes());
        for (field_id, points) in fields {
            buf.extend_from_slice(&field_id.to_le_bytes());
            buf.extend_from_slice(&(points.len() as u16).to_le_bytes());
            for (slot, value) in points {
                buf.extend_from_slice(&slot.to_le_bytes());
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
    buf
}

/// Decoded metric block from one flushed file.
#[derive(Debug, Clone)]
pub struct MetricBlock {
    slot_range: SlotRange,
    series: Vec<(SeriesId, Vec<(FieldId, FieldPoints)>)>,
}

impl MetricBlock {
    /// Decode a block; any truncation or version mismatch is corruption.
    pub fn decode(raw: &[u8]) -> Result<Self, KvError> {
        let mut cursor = Cursor { raw, pos: 0 };
        let version = cursor.u8()?;
        if version != BLOCK_VERSION {
            return Err(KvError::Corrupted(format!(
                "unsupported block version {version}"
            )));
        }
        let slot_start = cursor.u16()?;
        let slot_end = cursor.u16()?;
        let series_count = cursor.u32()? as usize;

        let mut series = Vec::with_capacity(series_count);
        for _ in 0..series_count {
            let series_id = cursor.u32()?;
            let field_count = cursor.u16()? as usize;
            let mut fields = Vec::with_capacity(field_count);
            for _ in 0..field_count {
                let field_id = cursor.u16()?;
                let point_count = cursor.u16()? as usize;
                let mut points = Vec::with_capacity(point_count);
                for _ in 0..point_count {
                    let slot = cursor.u16()?;
                    let value = cursor.f64()?;
                    points.push((slot, value));
                }
                fields.push((field_id, points));
            }
            series.push((series_id, fields));
        }

        Ok(Self {
            slot_range: SlotRange::new(slot_start, slot_end),
            series,
        })
    }

    pub fn slot_range(&self) -> SlotRange {
        self.slot_range
    }

    /// Points stored for `(series, field)`, if any.
    pub fn load(&self, series_id: SeriesId, field_id: FieldId) -> Option<&FieldPoints> {
        let (_, fields) = self
            .series
            .iter()
            .find(|(stored, _)| *stored == series_id)?;
        fields
            .iter()
            .find(|(stored, _)| *stored == field_id)
            .map(|(_, points)| points)
    }
}

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8], KvError> {
        if self.pos + len > self.raw.len() {
            return Err(KvError::Corrupted(format!(
                "block truncated at offset {}",
                self.pos
            )));
        }
        let slice = &self.raw[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, KvError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, KvError> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, KvError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn f64(&mut self) -> Result<f64, KvError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(f64::from_le_bytes(bytes))
    }
}
