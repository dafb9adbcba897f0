//! Reader for `.npz` archives: a zip of independently compressed `.npy` arrays.
//!
//! ## `.npy` record layout
//!
//! | Bytes        | Content                                          |
//! |--------------|--------------------------------------------------|
//! | 0..6         | magic `\x93NUMPY`                                |
//! | 6, 7         | major, minor version                             |
//! | 8..10        | header length, u16 LE (major 1)                  |
//! | 8..12        | header length, u32 LE (major >= 2)               |
//! | header       | Python dict literal: `descr`, `fortran_order`, `shape` |
//! | rest         | raw element bytes                                |
//!
//! Each archive entry is decoded on its own. A malformed entry is logged and
//! skipped so the others still load; callers that need a specific key use
//! [`NpzArchive::require`].

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::error::{FacecastError, Result};

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
const NPY_EXTENSION: &str = ".npy";

/// Element storage, one variant per supported dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum NpyData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

macro_rules! each_variant {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            NpyData::F32($v) => $body,
            NpyData::F64($v) => $body,
            NpyData::I8($v) => $body,
            NpyData::I16($v) => $body,
            NpyData::I32($v) => $body,
            NpyData::I64($v) => $body,
            NpyData::U8($v) => $body,
            NpyData::U16($v) => $body,
            NpyData::U32($v) => $body,
            NpyData::U64($v) => $body,
        }
    };
}

/// One decoded array.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    /// Empty for scalars or when the header carried no parseable shape.
    pub shape: Vec<usize>,
    pub fortran_order: bool,
    pub data: NpyData,
}

impl NpyArray {
    pub fn len(&self) -> usize {
        each_variant!(&self.data, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements widened or narrowed to `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        each_variant!(&self.data, v => v.iter().map(|&x| x as f32).collect())
    }

    /// Elements as indices.
    ///
    /// # Errors
    /// `FacecastError::Format` on negative or non-integral values.
    pub fn to_index_vec(&self) -> Result<Vec<usize>> {
        fn from_f64(x: f64) -> Result<usize> {
            if x < 0.0 || x.fract() != 0.0 {
                return Err(FacecastError::format(format!("invalid index value {x}")));
            }
            Ok(x as usize)
        }
        fn from_i64(x: i64) -> Result<usize> {
            usize::try_from(x).map_err(|_| FacecastError::format(format!("negative index {x}")))
        }

        match &self.data {
            NpyData::F32(v) => v.iter().map(|&x| from_f64(x as f64)).collect(),
            NpyData::F64(v) => v.iter().map(|&x| from_f64(x)).collect(),
            NpyData::I8(v) => v.iter().map(|&x| from_i64(x as i64)).collect(),
            NpyData::I16(v) => v.iter().map(|&x| from_i64(x as i64)).collect(),
            NpyData::I32(v) => v.iter().map(|&x| from_i64(x as i64)).collect(),
            NpyData::I64(v) => v.iter().map(|&x| from_i64(x)).collect(),
            NpyData::U8(v) => Ok(v.iter().map(|&x| x as usize).collect()),
            NpyData::U16(v) => Ok(v.iter().map(|&x| x as usize).collect()),
            NpyData::U32(v) => Ok(v.iter().map(|&x| x as usize).collect()),
            NpyData::U64(v) => Ok(v.iter().map(|&x| x as usize).collect()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl Dtype {
    fn width(self) -> usize {
        match self {
            Dtype::I8 | Dtype::U8 => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::F32 | Dtype::I32 | Dtype::U32 => 4,
            Dtype::F64 | Dtype::I64 | Dtype::U64 => 8,
        }
    }
}

struct NpyHeader {
    dtype: Dtype,
    endian: Endian,
    fortran_order: bool,
    shape: Vec<usize>,
    data_offset: usize,
}

/// Decode a single `.npy` record.
///
/// # Errors
/// `FacecastError::Format` if the magic is missing, the header is truncated,
/// or its `descr` cannot be matched.
pub fn parse_npy(bytes: &[u8]) -> Result<NpyArray> {
    let header = read_header(bytes)?;
    let payload = &bytes[header.data_offset..];
    let count = payload.len() / header.dtype.width();
    let payload = &payload[..count * header.dtype.width()];

    let data = match header.endian {
        Endian::Little => decode_elements::<LittleEndian>(payload, header.dtype, count),
        Endian::Big => decode_elements::<BigEndian>(payload, header.dtype, count),
    };

    Ok(NpyArray {
        shape: header.shape,
        fortran_order: header.fortran_order,
        data,
    })
}

fn read_header(bytes: &[u8]) -> Result<NpyHeader> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(FacecastError::format("missing .npy magic"));
    }
    let major = bytes[6];
    let (header_len, header_start) = if major >= 2 {
        if bytes.len() < 12 {
            return Err(FacecastError::format("truncated .npy v2 preamble"));
        }
        (LittleEndian::read_u32(&bytes[8..12]) as usize, 12)
    } else {
        (LittleEndian::read_u16(&bytes[8..10]) as usize, 10)
    };
    let data_offset = header_start + header_len;
    if data_offset > bytes.len() {
        return Err(FacecastError::format(format!(
            "header length {header_len} exceeds record size {}",
            bytes.len()
        )));
    }
    let text = String::from_utf8_lossy(&bytes[header_start..data_offset]);

    let (endian, dtype) = parse_descr(&text)?;
    Ok(NpyHeader {
        dtype,
        endian,
        fortran_order: parse_fortran_order(&text),
        shape: parse_shape(&text),
        data_offset,
    })
}

/// Match `'descr': '<endianness><category><width>'`.
fn parse_descr(header: &str) -> Result<(Endian, Dtype)> {
    let descr = dict_value(header, "descr")
        .and_then(|rest| rest.strip_prefix('\''))
        .and_then(|rest| rest.split('\'').next())
        .ok_or_else(|| FacecastError::format(format!("cannot parse numpy dtype from {header:?}")))?;

    let mut chars = descr.chars();
    let endian = match chars.next() {
        Some('<') | Some('|') => Endian::Little,
        Some('>') => Endian::Big,
        _ => return Err(FacecastError::format(format!("cannot parse numpy dtype {descr:?}"))),
    };
    let category = chars
        .next()
        .filter(|c| c.is_ascii_alphabetic())
        .ok_or_else(|| FacecastError::format(format!("cannot parse numpy dtype {descr:?}")))?;
    let width: usize = chars
        .as_str()
        .parse()
        .map_err(|_| FacecastError::format(format!("cannot parse numpy dtype {descr:?}")))?;

    let dtype = match (category.to_ascii_lowercase(), width) {
        ('f', 4) => Dtype::F32,
        ('f', 8) => Dtype::F64,
        ('i', 1) => Dtype::I8,
        ('i', 2) => Dtype::I16,
        ('i', 4) => Dtype::I32,
        ('i', 8) => Dtype::I64,
        ('u', 1) => Dtype::U8,
        ('u', 2) => Dtype::U16,
        ('u', 4) => Dtype::U32,
        ('u', 8) => Dtype::U64,
        // Widths with no native type fall back to the widest float and the
        // narrowest integer. The payload is then read at that width.
        ('f', _) => {
            debug!(descr, "unsupported float width, reading as f64");
            Dtype::F64
        }
        ('i', _) => {
            debug!(descr, "unsupported int width, reading as i8");
            Dtype::I8
        }
        ('u', _) => {
            debug!(descr, "unsupported uint width, reading as u8");
            Dtype::U8
        }
        _ => {
            debug!(descr, "unknown dtype category, reading as f32");
            Dtype::F32
        }
    };
    Ok((endian, dtype))
}

fn parse_shape(header: &str) -> Vec<usize> {
    dict_value(header, "shape")
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.split(')').next())
        .map(|inner| {
            inner
                .split(',')
                .filter_map(|dim| dim.trim().parse::<usize>().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_fortran_order(header: &str) -> bool {
    dict_value(header, "fortran_order")
        .map(|rest| rest.starts_with("True"))
        .unwrap_or(false)
}

/// Text following `'key':` with leading whitespace stripped.
fn dict_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}'");
    let start = header.find(&needle)? + needle.len();
    let rest = header[start..].trim_start().strip_prefix(':')?;
    Some(rest.trim_start())
}

fn decode_elements<B: ByteOrder>(payload: &[u8], dtype: Dtype, count: usize) -> NpyData {
    match dtype {
        Dtype::F32 => {
            let mut out = vec![0f32; count];
            B::read_f32_into(payload, &mut out);
            NpyData::F32(out)
        }
        Dtype::F64 => {
            let mut out = vec![0f64; count];
            B::read_f64_into(payload, &mut out);
            NpyData::F64(out)
        }
        Dtype::I8 => NpyData::I8(payload.iter().map(|&b| b as i8).collect()),
        Dtype::I16 => {
            let mut out = vec![0i16; count];
            B::read_i16_into(payload, &mut out);
            NpyData::I16(out)
        }
        Dtype::I32 => {
            let mut out = vec![0i32; count];
            B::read_i32_into(payload, &mut out);
            NpyData::I32(out)
        }
        Dtype::I64 => {
            let mut out = vec![0i64; count];
            B::read_i64_into(payload, &mut out);
            NpyData::I64(out)
        }
        Dtype::U8 => NpyData::U8(payload.to_vec()),
        Dtype::U16 => {
            let mut out = vec![0u16; count];
            B::read_u16_into(payload, &mut out);
            NpyData::U16(out)
        }
        Dtype::U32 => {
            let mut out = vec![0u32; count];
            B::read_u32_into(payload, &mut out);
            NpyData::U32(out)
        }
        Dtype::U64 => {
            let mut out = vec![0u64; count];
            B::read_u64_into(payload, &mut out);
            NpyData::U64(out)
        }
    }
}

/// Arrays keyed by entry base name (without the `.npy` suffix).
#[derive(Debug, Clone, Default)]
pub struct NpzArchive {
    arrays: BTreeMap<String, NpyArray>,
}

impl NpzArchive {
    pub fn get(&self, key: &str) -> Option<&NpyArray> {
        self.arrays.get(key)
    }

    /// # Errors
    /// `FacecastError::Format` if the archive has no entry named `key`.
    pub fn require(&self, key: &str) -> Result<&NpyArray> {
        self.get(key)
            .ok_or_else(|| FacecastError::format(format!("archive is missing array '{key}'")))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

/// Read and decode an `.npz` file.
pub fn load_npz(path: &Path) -> Result<NpzArchive> {
    let bytes = fs::read(path)?;
    read_npz(&bytes)
}

/// Decode an in-memory `.npz` archive.
///
/// # Errors
/// `FacecastError::Format` if the bytes are not a zip archive. Individual
/// malformed entries are skipped with a warning.
pub fn read_npz(bytes: &[u8]) -> Result<NpzArchive> {
    let mut zip = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| FacecastError::format(format!("not a zip archive: {e}")))?;

    let mut arrays = BTreeMap::new();
    for i in 0..zip.len() {
        let mut entry = match zip.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(index = i, "skipping unreadable archive entry: {e}");
                continue;
            }
        };
        let name = entry.name().to_string();
        let Some(stem) = name.strip_suffix(NPY_EXTENSION) else {
            continue;
        };
        let key = stem.rsplit('/').next().unwrap_or(stem).to_string();

        let mut raw = Vec::with_capacity(entry.size() as usize);
        if let Err(e) = entry.read_to_end(&mut raw) {
            warn!(entry = %name, "failed to inflate archive entry: {e}");
            continue;
        }
        match parse_npy(&raw) {
            Ok(array) => {
                debug!(entry = %name, shape = ?array.shape, len = array.len(), "decoded array");
                arrays.insert(key, array);
            }
            Err(e) => warn!(entry = %name, "skipping malformed array: {e}"),
        }
    }

    Ok(NpzArchive { arrays })
}
