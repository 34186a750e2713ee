//! Minimal GGUF reader: metadata key/values and tensor descriptors.
//!
//! Reads just enough of the container to answer the inspector's questions
//! (architecture, context length, block count, parameter count). Tensor data
//! is never touched; parsing stops after the tensor-info table.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// "GGUF" little-endian.
const GGUF_MAGIC: u32 = 0x4655_4747;

/// Metadata value, with the integer widths collapsed the way consumers
/// actually use them.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<GgufValue>),
}

impl GgufValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            GgufValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Lossy conversion into a JSON value for serialization.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            GgufValue::String(s) => serde_json::Value::String(s.clone()),
            GgufValue::Int(i) => serde_json::Value::from(*i),
            GgufValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            GgufValue::Bool(b) => serde_json::Value::Bool(*b),
            GgufValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(GgufValue::to_json).collect())
            }
        }
    }
}

/// Name, dimensions and placement of one tensor.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub data_type: u32,
    pub offset: u64,
}

impl TensorInfo {
    /// Element count, i.e. the product of all dimensions.
    pub fn element_count(&self) -> u64 {
        self.dims.iter().product()
    }
}

/// Parsed GGUF header: metadata plus the tensor-info table.
#[derive(Debug)]
pub struct GgufFile {
    pub version: u32,
    pub metadata: BTreeMap<String, GgufValue>,
    pub tensors: Vec<TensorInfo>,
}

impl GgufFile {
    /// Parse the header of the file at `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != GGUF_MAGIC {
            return Err(Error::Parse(format!(
                "{} is not a GGUF file (bad magic)",
                path.display()
            )));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if !(2..=3).contains(&version) {
            return Err(Error::Parse(format!("unsupported GGUF version {version}")));
        }

        let tensor_count = read_count(&mut reader, version)?;
        let metadata_count = read_count(&mut reader, version)?;
        log::debug!(
            "{}: GGUF v{version}, {tensor_count} tensors, {metadata_count} metadata entries",
            path.display()
        );

        let mut metadata = BTreeMap::new();
        for _ in 0..metadata_count {
            let key = read_string(&mut reader, version)?;
            let value_type = reader.read_u32::<LittleEndian>()?;
            let value = read_value(&mut reader, value_type, version)?;
            metadata.insert(key, value);
        }

        let mut tensors = Vec::with_capacity(tensor_count as usize);
        for _ in 0..tensor_count {
            let name = read_string(&mut reader, version)?;
            let n_dims = reader.read_u32::<LittleEndian>()?;
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(read_count(&mut reader, version)?);
            }
            let data_type = reader.read_u32::<LittleEndian>()?;
            let offset = reader.read_u64::<LittleEndian>()?;
            tensors.push(TensorInfo {
                name,
                dims,
                data_type,
                offset,
            });
        }

        Ok(Self {
            version,
            metadata,
            tensors,
        })
    }

    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.get(key)
    }
}

/// Counts and string lengths widened from u32 to u64 in GGUF v3.
fn read_count<R: Read>(reader: &mut R, version: u32) -> Result<u64> {
    if version >= 3 {
        Ok(reader.read_u64::<LittleEndian>()?)
    } else {
        Ok(u64::from(reader.read_u32::<LittleEndian>()?))
    }
}

fn read_string<R: Read>(reader: &mut R, version: u32) -> Result<String> {
    let len = read_count(reader, version)?;
    if len > 64 * 1024 * 1024 {
        return Err(Error::Parse(format!("string length {len} out of range")));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| Error::Parse(format!("invalid UTF-8 in string: {e}")))
}

fn read_value<R: Read>(reader: &mut R, value_type: u32, version: u32) -> Result<GgufValue> {
    let value = match value_type {
        0 => GgufValue::Int(i64::from(reader.read_u8()?)),
        1 => GgufValue::Int(i64::from(reader.read_i8()?)),
        2 => GgufValue::Int(i64::from(reader.read_u16::<LittleEndian>()?)),
        3 => GgufValue::Int(i64::from(reader.read_i16::<LittleEndian>()?)),
        4 => GgufValue::Int(i64::from(reader.read_u32::<LittleEndian>()?)),
        5 => GgufValue::Int(i64::from(reader.read_i32::<LittleEndian>()?)),
        6 => GgufValue::Float(f64::from(reader.read_f32::<LittleEndian>()?)),
        7 => GgufValue::Bool(reader.read_u8()? != 0),
        8 => GgufValue::String(read_string(reader, version)?),
        9 => {
            let element_type = reader.read_u32::<LittleEndian>()?;
            let len = read_count(reader, version)?;
            let mut items = Vec::with_capacity(len.min(1 << 20) as usize);
            for _ in 0..len {
                items.push(read_value(reader, element_type, version)?);
            }
            GgufValue::Array(items)
        }
        10 => {
            let v = reader.read_u64::<LittleEndian>()?;
            GgufValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
        }
        11 => GgufValue::Int(reader.read_i64::<LittleEndian>()?),
        12 => GgufValue::Float(reader.read_f64::<LittleEndian>()?),
        other => {
            return Err(Error::Parse(format!("unknown GGUF value type {other}")));
        }
    };
    Ok(value)
}
