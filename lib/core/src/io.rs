// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host I/O facade: the variable and attribute database the codec registers
//! newly seen declarations into and the engines read geometry from.
//!
//! The embedding framework owns this database in a full deployment; this
//! in-process version is what ships with the repo so the engines run
//! end-to-end. Handles are cheap to clone and share one store.

use std::sync::Arc;

use dashmap::DashMap;

use crate::block::{elements_to_bytes, DataType, Dims, Element, ShapeId};
use crate::{Result, SscError};

/// A defined variable: element type, span kind, and current geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDef {
    pub name: String,
    pub dtype: DataType,
    pub shape_id: ShapeId,
    pub shape: Dims,
    pub start: Dims,
    pub count: Dims,
}

/// Attribute payload: a scalar or flat array per numeric type, or a string.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(String),
}

macro_rules! for_numeric_attribute {
    ($value:expr, $inner:ident => $body:expr, $string:ident => $string_body:expr) => {
        match $value {
            AttributeValue::Int8($inner) => $body,
            AttributeValue::Int16($inner) => $body,
            AttributeValue::Int32($inner) => $body,
            AttributeValue::Int64($inner) => $body,
            AttributeValue::UInt8($inner) => $body,
            AttributeValue::UInt16($inner) => $body,
            AttributeValue::UInt32($inner) => $body,
            AttributeValue::UInt64($inner) => $body,
            AttributeValue::Float32($inner) => $body,
            AttributeValue::Float64($inner) => $body,
            AttributeValue::String($string) => $string_body,
        }
    };
}

impl AttributeValue {
    pub fn dtype(&self) -> DataType {
        match self {
            AttributeValue::Int8(_) => DataType::Int8,
            AttributeValue::Int16(_) => DataType::Int16,
            AttributeValue::Int32(_) => DataType::Int32,
            AttributeValue::Int64(_) => DataType::Int64,
            AttributeValue::UInt8(_) => DataType::UInt8,
            AttributeValue::UInt16(_) => DataType::UInt16,
            AttributeValue::UInt32(_) => DataType::UInt32,
            AttributeValue::UInt64(_) => DataType::UInt64,
            AttributeValue::Float32(_) => DataType::Float32,
            AttributeValue::Float64(_) => DataType::Float64,
            AttributeValue::String(_) => DataType::String,
        }
    }

    pub fn element_count(&self) -> usize {
        for_numeric_attribute!(self, values => values.len(), s => s.len())
    }

    /// Little-endian wire payload (raw UTF-8 for strings).
    pub fn payload_bytes(&self) -> Vec<u8> {
        for_numeric_attribute!(self, values => elements_to_bytes(values), s => s.as_bytes().to_vec())
    }

    /// Decode a wire payload of the given type.
    pub fn from_payload(dtype: DataType, bytes: &[u8]) -> Result<Self> {
        fn decode<T: Element>(bytes: &[u8], len: usize) -> Result<Vec<T>> {
            if bytes.len() != len * T::SIZE {
                return Err(SscError::MalformedBuffer {
                    cursor: bytes.len(),
                    valid: len * T::SIZE,
                });
            }
            Ok(bytes.chunks_exact(T::SIZE).map(T::read_le).collect())
        }

        if dtype == DataType::String {
            let text = String::from_utf8(bytes.to_vec()).map_err(|_| SscError::MalformedBuffer {
                cursor: bytes.len(),
                valid: bytes.len(),
            })?;
            return Ok(AttributeValue::String(text));
        }
        let elem = dtype
            .type_size()
            .ok_or(SscError::UnknownType(dtype.tag()))?;
        if bytes.len() % elem != 0 {
            return Err(SscError::MalformedBuffer {
                cursor: bytes.len(),
                valid: bytes.len() / elem * elem,
            });
        }
        let len = bytes.len() / elem;
        Ok(match dtype {
            DataType::Int8 => AttributeValue::Int8(decode(bytes, len)?),
            DataType::Int16 => AttributeValue::Int16(decode(bytes, len)?),
            DataType::Int32 => AttributeValue::Int32(decode(bytes, len)?),
            DataType::Int64 => AttributeValue::Int64(decode(bytes, len)?),
            DataType::UInt8 => AttributeValue::UInt8(decode(bytes, len)?),
            DataType::UInt16 => AttributeValue::UInt16(decode(bytes, len)?),
            DataType::UInt32 => AttributeValue::UInt32(decode(bytes, len)?),
            DataType::UInt64 => AttributeValue::UInt64(decode(bytes, len)?),
            DataType::Float32 => AttributeValue::Float32(decode(bytes, len)?),
            DataType::Float64 => AttributeValue::Float64(decode(bytes, len)?),
            DataType::String => unreachable!("handled above"),
        })
    }
}

/// A named attribute with the scalar/array distinction the wire format
/// derives from payload size.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub single: bool,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn dtype(&self) -> DataType {
        self.value.dtype()
    }
}

struct IoInner {
    row_major: bool,
    variables: DashMap<String, VariableDef>,
    attributes: DashMap<String, Attribute>,
}

/// Handle onto the variable/attribute database. Cloning shares the store.
#[derive(Clone)]
pub struct Io {
    inner: Arc<IoInner>,
}

impl Default for Io {
    fn default() -> Self {
        Self::new()
    }
}

impl Io {
    /// Row-major host ordering.
    pub fn new() -> Self {
        Self::with_ordering(true)
    }

    /// Column-major host ordering: registered shapes and starts are reversed
    /// by the codec.
    pub fn column_major() -> Self {
        Self::with_ordering(false)
    }

    fn with_ordering(row_major: bool) -> Self {
        Self {
            inner: Arc::new(IoInner {
                row_major,
                variables: DashMap::new(),
                attributes: DashMap::new(),
            }),
        }
    }

    pub fn row_major(&self) -> bool {
        self.inner.row_major
    }

    /// Define a variable. The span kind is inferred: a non-empty shape is a
    /// GlobalArray, empty shape with a non-empty count is a LocalArray, and
    /// everything empty is a GlobalValue.
    pub fn define_variable<T: Element>(
        &self,
        name: &str,
        shape: Dims,
        start: Dims,
        count: Dims,
    ) -> Result<()> {
        let shape_id = if !shape.is_empty() {
            ShapeId::GlobalArray
        } else if !count.is_empty() {
            ShapeId::LocalArray
        } else {
            ShapeId::GlobalValue
        };
        self.define_variable_dyn(VariableDef {
            name: name.to_string(),
            dtype: T::DATA_TYPE,
            shape_id,
            shape,
            start,
            count,
        })
    }

    /// Define a scalar local value.
    pub fn define_local_value<T: Element>(&self, name: &str) -> Result<()> {
        self.define_variable_dyn(VariableDef {
            name: name.to_string(),
            dtype: T::DATA_TYPE,
            shape_id: ShapeId::LocalValue,
            shape: Dims::new(),
            start: Dims::new(),
            count: Dims::new(),
        })
    }

    /// Define a global string variable.
    pub fn define_string_variable(&self, name: &str) -> Result<()> {
        self.define_variable_dyn(VariableDef {
            name: name.to_string(),
            dtype: DataType::String,
            shape_id: ShapeId::GlobalValue,
            shape: Dims::new(),
            start: Dims::new(),
            count: Dims::new(),
        })
    }

    /// Type-erased definition path, used by the codec's registration.
    pub fn define_variable_dyn(&self, def: VariableDef) -> Result<()> {
        if def.shape_id == ShapeId::GlobalArray
            && (def.shape.len() != def.start.len() || def.shape.len() != def.count.len())
        {
            return Err(SscError::DimsMismatch { name: def.name });
        }
        self.inner.variables.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn inquire_variable(&self, name: &str) -> Option<VariableDef> {
        self.inner.variables.get(name).map(|v| v.clone())
    }

    /// Update a variable's declared region for the next step.
    pub fn set_selection(&self, name: &str, start: Dims, count: Dims) -> Result<()> {
        let mut def = self
            .inner
            .variables
            .get_mut(name)
            .ok_or_else(|| SscError::UnknownVariable(name.to_string()))?;
        if def.shape_id == ShapeId::GlobalArray
            && (start.len() != def.shape.len() || count.len() != def.shape.len())
        {
            return Err(SscError::DimsMismatch {
                name: name.to_string(),
            });
        }
        def.start = start;
        def.count = count;
        Ok(())
    }

    pub fn define_attribute<T: Element>(&self, name: &str, value: T) -> Result<()> {
        let payload = elements_to_bytes(&[value]);
        let value = AttributeValue::from_payload(T::DATA_TYPE, &payload)?;
        self.insert_attribute(name, true, value)
    }

    pub fn define_attribute_array<T: Element>(&self, name: &str, values: &[T]) -> Result<()> {
        let payload = elements_to_bytes(values);
        let value = AttributeValue::from_payload(T::DATA_TYPE, &payload)?;
        self.insert_attribute(name, false, value)
    }

    pub fn define_attribute_string(&self, name: &str, value: &str) -> Result<()> {
        self.insert_attribute(name, true, AttributeValue::String(value.to_string()))
    }

    /// Registration path used by the codec: the scalar/array distinction
    /// falls out of the payload size.
    pub(crate) fn define_attribute_from_payload(
        &self,
        name: &str,
        dtype: DataType,
        payload: &[u8],
    ) -> Result<()> {
        let value = AttributeValue::from_payload(dtype, payload)?;
        let single = match dtype.type_size() {
            Some(elem) => payload.len() == elem,
            None => true,
        };
        self.insert_attribute(name, single, value)
    }

    fn insert_attribute(&self, name: &str, single: bool, value: AttributeValue) -> Result<()> {
        self.inner.attributes.insert(
            name.to_string(),
            Attribute {
                name: name.to_string(),
                single,
                value,
            },
        );
        Ok(())
    }

    pub fn inquire_attribute(&self, name: &str) -> Option<Attribute> {
        self.inner.attributes.get(name).map(|a| a.clone())
    }

    /// All attributes in name order; the codec serializes the table
    /// deterministically.
    pub fn attributes_sorted(&self) -> Vec<Attribute> {
        let mut attrs: Vec<Attribute> = self
            .inner
            .attributes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        attrs.sort_by(|a, b| a.name.cmp(&b.name));
        attrs
    }
}
