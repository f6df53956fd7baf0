// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block model: the atomic unit one rank declares for one step.
//!
//! A [`Block`] names a variable, its element type, the hyperslab this rank
//! touches (`shape`/`start`/`count`), and where the payload lives inside the
//! owning rank's buffer. A [`BlockVec`] is one rank's declarations and a
//! [`BlockVecVec`] is the global pattern, indexed by stream rank.

use std::collections::BTreeMap;

use crate::{Result, SscError};

/// Dimension sequence for shape/start/count.
pub type Dims = Vec<u64>;

/// One rank's block declarations for one step.
pub type BlockVec = Vec<Block>;

/// The global pattern: block declarations indexed by stream rank.
pub type BlockVecVec = Vec<BlockVec>;

/// Peer rank -> (byte offset within the peer's receive buffer, byte length).
/// Ordered so position assignment walks ranks ascending.
pub type RankPosMap = BTreeMap<usize, (u64, u64)>;

/// Wire tag marking an attribute record; never a valid shape tag.
pub const ATTRIBUTE_MARKER: u8 = 66;

/// Element types carried on the wire. The tag values are the wire encoding;
/// 66 is reserved for [`ATTRIBUTE_MARKER`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    UInt8 = 5,
    UInt16 = 6,
    UInt32 = 7,
    UInt64 = 8,
    Float32 = 9,
    Float64 = 10,
    String = 11,
}

impl DataType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Byte width of one element. `None` for `String`, whose payload length
    /// travels in `buffer_count` instead.
    pub fn type_size(self) -> Option<usize> {
        match self {
            DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => Some(8),
            DataType::String => None,
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = SscError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(DataType::Int8),
            2 => Ok(DataType::Int16),
            3 => Ok(DataType::Int32),
            4 => Ok(DataType::Int64),
            5 => Ok(DataType::UInt8),
            6 => Ok(DataType::UInt16),
            7 => Ok(DataType::UInt32),
            8 => Ok(DataType::UInt64),
            9 => Ok(DataType::Float32),
            10 => Ok(DataType::Float64),
            11 => Ok(DataType::String),
            other => Err(SscError::UnknownType(other)),
        }
    }
}

/// How a variable spans the parallel domain.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeId {
    GlobalValue = 1,
    GlobalArray = 2,
    LocalValue = 3,
    LocalArray = 4,
}

impl ShapeId {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn is_value(self) -> bool {
        matches!(self, ShapeId::GlobalValue | ShapeId::LocalValue)
    }
}

impl TryFrom<u8> for ShapeId {
    type Error = SscError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(ShapeId::GlobalValue),
            2 => Ok(ShapeId::GlobalArray),
            3 => Ok(ShapeId::LocalValue),
            4 => Ok(ShapeId::LocalArray),
            other => Err(SscError::UnknownShape(other)),
        }
    }
}

/// A single variable declaration by one rank for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub shape_id: ShapeId,
    pub dtype: DataType,
    pub shape: Dims,
    pub start: Dims,
    pub count: Dims,
    /// Byte offset of this block's payload within the owner's buffer.
    pub buffer_start: u64,
    /// Byte length of this block's payload.
    pub buffer_count: u64,
    /// Inline value for Value shapes, at most 255 bytes.
    pub value: Vec<u8>,
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:?}/{:?} shape {:?} start {:?} count {:?} buffer [{}, +{}]",
            self.name,
            self.shape_id,
            self.dtype,
            self.shape,
            self.start,
            self.count,
            self.buffer_start,
            self.buffer_count
        )
    }
}

/// Payload bytes a dims/type/shape triple occupies: element size times the
/// count product for arrays, one element for values.
pub fn total_data_size_of(count: &[u64], dtype: DataType, shape_id: ShapeId) -> Result<u64> {
    let elem = dtype
        .type_size()
        .ok_or(SscError::UnknownType(dtype.tag()))? as u64;
    match shape_id {
        ShapeId::GlobalArray | ShapeId::LocalArray => Ok(count.iter().product::<u64>() * elem),
        ShapeId::GlobalValue | ShapeId::LocalValue => Ok(elem),
    }
}

/// Payload bytes a whole block vector occupies. String blocks contribute
/// exactly `buffer_count`, independent of dimensions.
pub fn total_data_size(blocks: &BlockVec) -> Result<u64> {
    let mut total = 0u64;
    for block in blocks {
        if block.dtype == DataType::String {
            total += block.buffer_count;
        } else {
            total += total_data_size_of(&block.count, block.dtype, block.shape_id)?;
        }
    }
    Ok(total)
}

pub fn same_dims(a: &[u64], b: &[u64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// Multi-line dump of a global pattern, used by the high verbose levels.
pub fn pattern_summary(pattern: &BlockVecVec) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for (rank, blocks) in pattern.iter().enumerate() {
        if blocks.is_empty() {
            continue;
        }
        let _ = writeln!(out, "rank {rank}");
        for block in blocks {
            let _ = writeln!(out, "    {block}");
        }
    }
    out
}

mod sealed {
    pub trait Sealed {}
}

/// Scalar element types the coupler can move. Maps each Rust scalar onto its
/// wire [`DataType`] and provides little-endian byte views for the payload
/// buffers.
pub trait Element: sealed::Sealed + Copy + Default + Send + Sync + 'static {
    const DATA_TYPE: DataType;
    const SIZE: usize;

    fn write_le(self, out: &mut [u8]);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl sealed::Sealed for $ty {}

        impl Element for $ty {
            const DATA_TYPE: DataType = $dtype;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let arr: [u8; std::mem::size_of::<$ty>()] =
                    bytes.try_into().expect("caller slices element width");
                <$ty>::from_le_bytes(arr)
            }
        }
    };
}

impl_element!(i8, DataType::Int8);
impl_element!(i16, DataType::Int16);
impl_element!(i32, DataType::Int32);
impl_element!(i64, DataType::Int64);
impl_element!(u8, DataType::UInt8);
impl_element!(u16, DataType::UInt16);
impl_element!(u32, DataType::UInt32);
impl_element!(u64, DataType::UInt64);
impl_element!(f32, DataType::Float32);
impl_element!(f64, DataType::Float64);

/// Little-endian bytes of an element slice.
pub fn elements_to_bytes<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * T::SIZE];
    for (value, chunk) in values.iter().zip(out.chunks_exact_mut(T::SIZE)) {
        value.write_le(chunk);
    }
    out
}

/// Decode a little-endian byte slice into elements. The length must be a
/// whole number of elements.
pub fn bytes_to_elements<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    if bytes.len() % T::SIZE != 0 {
        return Err(SscError::CountMismatch {
            expected: bytes.len() / T::SIZE * T::SIZE,
            got: bytes.len(),
        });
    }
    Ok(bytes.chunks_exact(T::SIZE).map(T::read_le).collect())
}
