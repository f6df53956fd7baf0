// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Metadata protocol: the compact binary wire format for per-rank variable
//! and attribute declarations.
//!
//! A local pattern buffer carries an 8-byte little-endian `pos` header (the
//! total valid length, header included) followed by records. Aggregation
//! prepends the 1-byte final-step and locked flags, so a global buffer reads
//! flags at bytes 0..2, the payload total at 2..10, and records from 10.
//!
//! Variable record:
//!
//! ```text
//! u8  shape tag (never 66)
//! i32 owning rank
//! u8  name_len; name_len bytes of name
//! u8  type tag
//! u8  ndims
//! ndims x u64 shape, ndims x u64 start, ndims x u64 count
//! u64 buffer_start
//! u64 buffer_count
//! u8  value_len; value_len bytes of inline value
//! ```
//!
//! Attribute record: `u8 marker = 66, u8 type tag, u8 name_len + name,
//! u64 payload_size, payload bytes`.

use bytes::BytesMut;

use crate::block::{Block, BlockVec, BlockVecVec, DataType, Dims, ShapeId, ATTRIBUTE_MARKER};
use crate::io::Io;
use crate::{Result, SscError};

/// Headroom the variable serializer keeps ahead of the cursor.
const VARIABLE_HEADROOM: usize = 256;
/// Headroom the attribute serializer keeps ahead of the cursor.
const ATTRIBUTE_HEADROOM: usize = 1024;

/// A pattern buffer under construction: `pos` header plus records.
pub struct PatternBuffer {
    buf: BytesMut,
}

impl Default for PatternBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternBuffer {
    /// An empty buffer: the header alone, `pos = 8`.
    pub fn new() -> Self {
        let mut buf = BytesMut::zeroed(8);
        buf[0..8].copy_from_slice(&8u64.to_le_bytes());
        Self { buf }
    }

    /// Total valid length, header included.
    pub fn pos(&self) -> u64 {
        u64::from_le_bytes(self.buf[0..8].try_into().expect("8-byte header"))
    }

    fn set_pos(&mut self, pos: u64) {
        self.buf[0..8].copy_from_slice(&pos.to_le_bytes());
    }

    /// Record bytes, without the header.
    pub fn payload(&self) -> &[u8] {
        &self.buf[8..self.pos() as usize]
    }

    /// Grow geometrically so at least `headroom` bytes fit past the cursor.
    fn reserve_headroom(&mut self, headroom: usize) {
        let needed = self.pos() as usize + headroom;
        if needed > self.buf.len() {
            let target = (self.buf.len() + headroom) * 2;
            self.buf.resize(target.max(needed), 0);
        }
    }
}

struct RecordWriter<'a> {
    buf: &'a mut BytesMut,
    cursor: usize,
}

impl<'a> RecordWriter<'a> {
    fn new(buffer: &'a mut PatternBuffer, record_size: usize, headroom: usize) -> Self {
        buffer.reserve_headroom(record_size.max(headroom));
        let cursor = buffer.pos() as usize;
        Self {
            buf: &mut buffer.buf,
            cursor,
        }
    }

    fn put_u8(&mut self, value: u8) {
        self.buf[self.cursor] = value;
        self.cursor += 1;
    }

    fn put_i32(&mut self, value: i32) {
        self.buf[self.cursor..self.cursor + 4].copy_from_slice(&value.to_le_bytes());
        self.cursor += 4;
    }

    fn put_u64(&mut self, value: u64) {
        self.buf[self.cursor..self.cursor + 8].copy_from_slice(&value.to_le_bytes());
        self.cursor += 8;
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.cursor..self.cursor + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
    }

    fn finish(self) -> u64 {
        self.cursor as u64
    }
}

fn short_len(what: &'static str, len: usize) -> Result<u8> {
    u8::try_from(len).map_err(|_| SscError::FieldTooLong { what, len })
}

/// Append a rank's block declarations, rewriting the `pos` header after each
/// record.
pub fn serialize_variables(input: &BlockVec, output: &mut PatternBuffer, rank: i32) -> Result<()> {
    for block in input {
        let name_len = short_len("variable name", block.name.len())?;
        let value_len = short_len("inline value", block.value.len())?;
        let ndims = short_len("dimension count", block.shape.len())?;
        if block.start.len() != block.shape.len() || block.count.len() != block.shape.len() {
            return Err(SscError::DimsMismatch {
                name: block.name.clone(),
            });
        }

        let record_size = 1 + 4 + 1 + block.name.len() + 1 + 1
            + 24 * block.shape.len()
            + 16
            + 1
            + block.value.len();
        let mut w = RecordWriter::new(output, record_size, VARIABLE_HEADROOM);
        w.put_u8(block.shape_id.tag());
        w.put_i32(rank);
        w.put_u8(name_len);
        w.put_bytes(block.name.as_bytes());
        w.put_u8(block.dtype.tag());
        w.put_u8(ndims);
        for &d in &block.shape {
            w.put_u64(d);
        }
        for &d in &block.start {
            w.put_u64(d);
        }
        for &d in &block.count {
            w.put_u64(d);
        }
        w.put_u64(block.buffer_start);
        w.put_u64(block.buffer_count);
        w.put_u8(value_len);
        w.put_bytes(&block.value);
        let pos = w.finish();
        output.set_pos(pos);
    }
    Ok(())
}

/// Append the host attribute table. Only one rank per side serializes
/// attributes, so the table travels once.
pub fn serialize_attributes(io: &Io, output: &mut PatternBuffer) -> Result<()> {
    for attribute in io.attributes_sorted() {
        let name_len = short_len("attribute name", attribute.name.len())?;
        let payload = attribute.value.payload_bytes();

        let record_size = 1 + 1 + 1 + attribute.name.len() + 8 + payload.len();
        let mut w = RecordWriter::new(output, record_size, ATTRIBUTE_HEADROOM);
        w.put_u8(ATTRIBUTE_MARKER);
        w.put_u8(attribute.dtype().tag());
        w.put_u8(name_len);
        w.put_bytes(attribute.name.as_bytes());
        w.put_u64(payload.len() as u64);
        w.put_bytes(&payload);
        let pos = w.finish();
        output.set_pos(pos);
    }
    Ok(())
}

struct RecordReader<'a> {
    input: &'a [u8],
    cursor: usize,
    end: usize,
}

impl<'a> RecordReader<'a> {
    fn new(input: &'a [u8], start: usize, end: usize) -> Self {
        Self {
            input,
            cursor: start,
            end,
        }
    }

    fn has_remaining(&self) -> bool {
        self.cursor < self.end
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.cursor + len > self.end {
            return Err(SscError::MalformedBuffer {
                cursor: self.cursor + len,
                valid: self.end,
            });
        }
        let bytes = &self.input[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn dims(&mut self, ndims: usize) -> Result<Dims> {
        let mut dims = Dims::with_capacity(ndims);
        for _ in 0..ndims {
            dims.push(self.u64()?);
        }
        Ok(dims)
    }

    fn string(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SscError::MalformedBuffer {
            cursor: self.cursor,
            valid: self.end,
        })
    }
}

/// Decode a global pattern buffer into per-rank block vectors.
///
/// `output` must be sized to the stream; each decoded variable record is
/// appended to its owning rank's vector. With `reg_vars`/`reg_attrs`,
/// previously unknown variables/attributes are registered with the host,
/// reversing shape and start when the host orders column-major.
pub fn deserialize(
    input: &[u8],
    output: &mut BlockVecVec,
    io: &Io,
    reg_vars: bool,
    reg_attrs: bool,
) -> Result<()> {
    for blocks in output.iter_mut() {
        blocks.clear();
    }

    if input.len() < 10 {
        return Err(SscError::MalformedBuffer {
            cursor: 10,
            valid: input.len(),
        });
    }
    let total = u64::from_le_bytes(input[2..10].try_into().expect("8 bytes")) as usize;
    let end = 10 + total;
    if end > input.len() {
        return Err(SscError::MalformedBuffer {
            cursor: end,
            valid: input.len(),
        });
    }

    let mut r = RecordReader::new(input, 10, end);
    while r.has_remaining() {
        let lead = r.u8()?;
        if lead == ATTRIBUTE_MARKER {
            decode_attribute(&mut r, io, reg_attrs)?;
        } else {
            decode_variable(&mut r, lead, output, io, reg_vars)?;
        }
    }
    Ok(())
}

fn decode_attribute(r: &mut RecordReader<'_>, io: &Io, reg_attrs: bool) -> Result<()> {
    let dtype = DataType::try_from(r.u8()?)?;
    let name_len = r.u8()? as usize;
    let name = r.string(name_len)?;
    let payload_size = r.u64()? as usize;
    let payload = r.take(payload_size)?;

    if reg_attrs && io.inquire_attribute(&name).is_none() {
        io.define_attribute_from_payload(&name, dtype, payload)?;
    }
    Ok(())
}

fn decode_variable(
    r: &mut RecordReader<'_>,
    shape_tag: u8,
    output: &mut BlockVecVec,
    io: &Io,
    reg_vars: bool,
) -> Result<()> {
    let shape_id = ShapeId::try_from(shape_tag)?;
    let rank = r.i32()?;
    if rank < 0 || rank as usize >= output.len() {
        return Err(SscError::MalformedBuffer {
            cursor: r.cursor,
            valid: r.end,
        });
    }
    let name_len = r.u8()? as usize;
    let name = r.string(name_len)?;
    let dtype = DataType::try_from(r.u8()?)?;
    let ndims = r.u8()? as usize;
    let shape = r.dims(ndims)?;
    let start = r.dims(ndims)?;
    let count = r.dims(ndims)?;
    let buffer_start = r.u64()?;
    let buffer_count = r.u64()?;
    let value_len = r.u8()? as usize;
    let value = r.take(value_len)?.to_vec();

    if reg_vars && io.inquire_variable(&name).is_none() {
        register_variable(io, &name, dtype, shape_id, &shape, &start)?;
    }

    output[rank as usize].push(Block {
        name,
        shape_id,
        dtype,
        shape,
        start,
        count,
        buffer_start,
        buffer_count,
        value,
    });
    Ok(())
}

fn register_variable(
    io: &Io,
    name: &str,
    dtype: DataType,
    shape_id: ShapeId,
    shape: &[u64],
    start: &[u64],
) -> Result<()> {
    let mut reg_shape: Dims = shape.to_vec();
    let mut reg_start: Dims = start.to_vec();
    if !io.row_major() {
        reg_shape.reverse();
        reg_start.reverse();
    }
    let def = match shape_id {
        ShapeId::GlobalValue => crate::io::VariableDef {
            name: name.to_string(),
            dtype,
            shape_id,
            shape: Dims::new(),
            start: Dims::new(),
            count: Dims::new(),
        },
        // The full shape is registered as the initial count; readers narrow
        // it with their own selections.
        ShapeId::GlobalArray => crate::io::VariableDef {
            name: name.to_string(),
            dtype,
            shape_id,
            shape: reg_shape.clone(),
            start: reg_start,
            count: reg_shape,
        },
        ShapeId::LocalValue => crate::io::VariableDef {
            name: name.to_string(),
            dtype,
            shape_id,
            shape: Dims::new(),
            start: Dims::new(),
            count: Dims::new(),
        },
        ShapeId::LocalArray => crate::io::VariableDef {
            name: name.to_string(),
            dtype,
            shape_id,
            shape: Dims::new(),
            start: Dims::new(),
            count: reg_shape,
        },
    };
    io.define_variable_dyn(def)
}

/// Wrap a local pattern buffer in the global framing (flags + total) so it
/// can be decoded without aggregation. Used by tests and diagnostics.
pub fn frame_local(buffer: &PatternBuffer, final_step: bool, locked: bool) -> Vec<u8> {
    let payload = buffer.payload();
    let mut framed = vec![0u8; 10 + payload.len()];
    framed[0] = final_step as u8;
    framed[1] = locked as u8;
    framed[2..10].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    framed[10..].copy_from_slice(payload);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ShapeId;

    fn sample_block(name: &str) -> Block {
        Block {
            name: name.to_string(),
            shape_id: ShapeId::GlobalArray,
            dtype: DataType::Float32,
            shape: vec![10, 20],
            start: vec![0, 5],
            count: vec![10, 15],
            buffer_start: 1,
            buffer_count: 600,
            value: Vec::new(),
        }
    }

    fn round_trip(blocks: &BlockVec, rank: i32, world: usize) -> BlockVecVec {
        let mut buffer = PatternBuffer::new();
        serialize_variables(blocks, &mut buffer, rank).unwrap();
        let framed = frame_local(&buffer, false, false);
        let mut output = vec![Vec::new(); world];
        deserialize(&framed, &mut output, &Io::new(), false, false).unwrap();
        output
    }

    #[test]
    fn test_variable_round_trip_field_by_field() {
        let blocks = vec![sample_block("u"), sample_block("v")];
        let output = round_trip(&blocks, 2, 4);
        assert_eq!(output[2], blocks);
        assert!(output[0].is_empty() && output[1].is_empty() && output[3].is_empty());
    }

    #[test]
    fn test_scalar_round_trip() {
        let block = Block {
            name: "step".to_string(),
            shape_id: ShapeId::GlobalValue,
            dtype: DataType::UInt64,
            shape: vec![],
            start: vec![],
            count: vec![],
            buffer_start: 1,
            buffer_count: 8,
            value: 7u64.to_le_bytes().to_vec(),
        };
        let output = round_trip(&vec![block.clone()], 0, 1);
        assert_eq!(output[0], vec![block]);
    }

    #[test]
    fn test_first_record_begins_at_offset_eight() {
        let mut buffer = PatternBuffer::new();
        assert_eq!(buffer.pos(), 8);
        serialize_variables(&vec![sample_block("u")], &mut buffer, 0).unwrap();
        // Leading record byte is the shape tag, right past the header.
        assert_eq!(buffer.buf[8], ShapeId::GlobalArray.tag());
    }

    #[test]
    fn test_name_length_boundary() {
        let mut long = sample_block("x");
        long.name = "n".repeat(255);
        let output = round_trip(&vec![long.clone()], 0, 1);
        assert_eq!(output[0][0].name.len(), 255);

        let mut too_long = sample_block("x");
        too_long.name = "n".repeat(256);
        let mut buffer = PatternBuffer::new();
        let err = serialize_variables(&vec![too_long], &mut buffer, 0).unwrap_err();
        assert!(matches!(err, SscError::FieldTooLong { .. }));
    }

    #[test]
    fn test_growth_over_many_records() {
        let blocks: Vec<Block> = (0..100)
            .map(|i| {
                let mut b = sample_block(&format!("var{i}"));
                b.shape = vec![i; 8];
                b.start = vec![0; 8];
                b.count = vec![i; 8];
                b
            })
            .collect();
        let output = round_trip(&blocks, 0, 1);
        assert_eq!(output[0], blocks);
    }

    #[test]
    fn test_unknown_type_tag_rejected() {
        let mut buffer = PatternBuffer::new();
        serialize_variables(&vec![sample_block("u")], &mut buffer, 0).unwrap();
        let mut framed = frame_local(&buffer, false, false);
        // Corrupt the type tag: shape(1) + rank(4) + name_len(1) + name(1).
        framed[10 + 7] = 200;
        let mut output = vec![Vec::new(); 1];
        let err = deserialize(&framed, &mut output, &Io::new(), false, false).unwrap_err();
        assert!(matches!(err, SscError::UnknownType(200)));
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let mut buffer = PatternBuffer::new();
        serialize_variables(&vec![sample_block("u")], &mut buffer, 0).unwrap();
        let mut framed = frame_local(&buffer, false, false);
        // Claim more payload than is present.
        let lie = (framed.len() as u64).to_le_bytes();
        framed[2..10].copy_from_slice(&lie);
        let mut output = vec![Vec::new(); 1];
        let err = deserialize(&framed, &mut output, &Io::new(), false, false).unwrap_err();
        assert!(matches!(err, SscError::MalformedBuffer { .. }));
    }

    #[test]
    fn test_registration_defines_unknown_variables() {
        let mut buffer = PatternBuffer::new();
        serialize_variables(&vec![sample_block("u")], &mut buffer, 0).unwrap();
        let framed = frame_local(&buffer, false, false);
        let io = Io::new();
        let mut output = vec![Vec::new(); 1];
        deserialize(&framed, &mut output, &io, true, true).unwrap();
        let def = io.inquire_variable("u").unwrap();
        assert_eq!(def.shape, vec![10, 20]);
        assert_eq!(def.count, vec![10, 20]);
        assert_eq!(def.dtype, DataType::Float32);
    }

    #[test]
    fn test_registration_reverses_for_column_major_host() {
        let mut buffer = PatternBuffer::new();
        serialize_variables(&vec![sample_block("u")], &mut buffer, 0).unwrap();
        let framed = frame_local(&buffer, false, false);
        let io = Io::column_major();
        let mut output = vec![Vec::new(); 1];
        deserialize(&framed, &mut output, &io, true, false).unwrap();
        let def = io.inquire_variable("u").unwrap();
        assert_eq!(def.shape, vec![20, 10]);
        assert_eq!(def.start, vec![5, 0]);
    }

    #[test]
    fn test_attribute_round_trip_registers_equal_values() {
        let io = Io::new();
        io.define_attribute("answer", 42i32).unwrap();
        io.define_attribute_array("weights", &[1.0f64, 2.0, 3.0]).unwrap();
        io.define_attribute_string("unit", "kelvin").unwrap();

        let mut buffer = PatternBuffer::new();
        serialize_attributes(&io, &mut buffer).unwrap();
        let framed = frame_local(&buffer, false, false);

        let target = Io::new();
        let mut output = vec![Vec::new(); 1];
        deserialize(&framed, &mut output, &target, false, true).unwrap();

        for attr in io.attributes_sorted() {
            let got = target.inquire_attribute(&attr.name).unwrap();
            assert_eq!(got.value, attr.value);
            assert_eq!(got.single, attr.single);
        }
    }

    #[test]
    fn test_randomized_patterns_round_trip() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x55C);
        for _ in 0..50 {
            let world = rng.gen_range(1..5usize);
            let rank = rng.gen_range(0..world);
            let blocks: BlockVec = (0..rng.gen_range(0..6usize))
                .map(|i| {
                    let ndims = rng.gen_range(0..4usize);
                    let shape: Dims = (0..ndims).map(|_| rng.gen_range(1..100u64)).collect();
                    let start: Dims = shape.iter().map(|&s| rng.gen_range(0..s)).collect();
                    let count: Dims = shape
                        .iter()
                        .zip(&start)
                        .map(|(&s, &st)| rng.gen_range(1..=s - st))
                        .collect();
                    Block {
                        name: format!("v{i}"),
                        shape_id: if ndims == 0 {
                            ShapeId::GlobalValue
                        } else {
                            ShapeId::GlobalArray
                        },
                        dtype: DataType::Float64,
                        shape,
                        start,
                        count,
                        buffer_start: rng.gen(),
                        buffer_count: rng.gen(),
                        value: (0..rng.gen_range(0..16u8)).collect(),
                    }
                })
                .collect();
            let output = round_trip(&blocks, rank as i32, world);
            assert_eq!(output[rank], blocks);
        }
    }

    #[test]
    fn test_mixed_variables_and_attributes() {
        let io = Io::new();
        io.define_attribute("rank_count", 4u32).unwrap();
        let mut buffer = PatternBuffer::new();
        serialize_variables(&vec![sample_block("u")], &mut buffer, 1).unwrap();
        serialize_attributes(&io, &mut buffer).unwrap();

        let framed = frame_local(&buffer, false, false);
        let target = Io::new();
        let mut output = vec![Vec::new(); 2];
        deserialize(&framed, &mut output, &target, true, true).unwrap();
        assert_eq!(output[1].len(), 1);
        assert!(target.inquire_attribute("rank_count").is_some());
    }
}
