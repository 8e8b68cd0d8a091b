//! Gatan DigitalMicrograph 3 (`.dm3`) tag reader.
//!
//! The file is a tree of tag groups; tag names and structure are big-endian,
//! data values use the byte order declared in the header. Large arrays (the
//! image data itself) are skipped, not loaded.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};

use camino::Utf8Path;
use serde_json::Value;

use crate::error::HarvestError;
use crate::flatten::{TagNode, TagValue, colliding_keys, flatten};
use crate::record::{
    FIELD_DATASET_ID, FIELD_DTYPE, FIELD_FILE_PATH, FIELD_FILE_SIZE_MB, FIELD_FORMAT,
    FIELD_NDIMS, FIELD_RESOLUTION, FIELD_RESOLUTION_UNIT, FIELD_SHAPE, MetadataRecord,
    file_dataset_id, file_size_mb,
};

pub const DM3_FORMAT: &str = "DM3";

const TAG_GROUP: u8 = 20;
const TAG_DATA: u8 = 21;
const TAG_END: u8 = 0;

const TYPE_STRUCT: u32 = 15;
const TYPE_STRING: u32 = 18;
const TYPE_ARRAY: u32 = 20;
const TYPE_U16: u32 = 4;

const MAX_DEPTH: usize = 64;
const MAX_INFO_WORDS: u32 = 1 << 16;
const MAX_INLINE_ARRAY: u64 = 16;
const MAX_TEXT_CHARS: u64 = 1024;
const MAX_STRING_BYTES: u32 = 1 << 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Dm3Document {
    pub version: u32,
    pub little_endian: bool,
    pub tags: TagNode,
}

impl Dm3Document {
    pub fn read<R: Read + Seek>(reader: R) -> Result<Self, String> {
        Dm3Reader::parse(reader).map_err(|err| err.to_string())
    }

    /// The `ImageData` group of the largest image in `ImageList`; the first
    /// entry is usually a thumbnail.
    pub fn main_image(&self) -> Option<&TagNode> {
        let images = self.tags.group("ImageList")?;
        images
            .entries()
            .filter_map(|(_, value)| match value {
                TagValue::Group(image) => image.group("ImageData"),
                TagValue::Leaf(_) => None,
            })
            .max_by_key(|image| {
                dimensions(image)
                    .iter()
                    .try_fold(1u64, |acc, dim| acc.checked_mul(*dim))
                    .unwrap_or(u64::MAX)
            })
    }
}

/// DM dimensions are stored fastest-axis first; shapes are reported
/// slowest-axis first.
fn dimensions(image: &TagNode) -> Vec<u64> {
    image
        .group("Dimensions")
        .map(|dims| {
            dims.entries()
                .filter_map(|(_, value)| match value {
                    TagValue::Leaf(value) => value.as_u64(),
                    TagValue::Group(_) => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn calibrations(image: &TagNode) -> Vec<(Option<Value>, Option<Value>)> {
    image
        .group_at("Calibrations.Dimension")
        .map(|dims| {
            dims.entries()
                .filter_map(|(_, value)| match value {
                    TagValue::Group(dim) => {
                        Some((dim.leaf("Scale").cloned(), dim.leaf("Units").cloned()))
                    }
                    TagValue::Leaf(_) => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn dm_data_type_name(code: u64) -> String {
    match code {
        1 => "int16".to_string(),
        2 => "float32".to_string(),
        3 => "complex64".to_string(),
        6 => "uint8".to_string(),
        7 => "int32".to_string(),
        8 => "rgb".to_string(),
        9 => "int8".to_string(),
        10 => "uint16".to_string(),
        11 => "uint32".to_string(),
        12 => "float64".to_string(),
        13 => "complex128".to_string(),
        14 => "bool".to_string(),
        23 => "rgba8".to_string(),
        other => format!("unknown({other})"),
    }
}

pub fn extract_dm3_record(path: &Utf8Path) -> Result<MetadataRecord, HarvestError> {
    let dm3_error = |message: String| HarvestError::Dm3 {
        path: path.as_std_path().to_path_buf(),
        message,
    };
    let file = File::open(path.as_std_path()).map_err(|err| dm3_error(err.to_string()))?;
    let size = fs::metadata(path.as_std_path())
        .map_err(|err| dm3_error(err.to_string()))?
        .len();
    let document = Dm3Document::read(BufReader::new(file)).map_err(dm3_error)?;
    let image = document
        .main_image()
        .ok_or_else(|| dm3_error("no ImageList.ImageData group".to_string()))?;

    let mut shape = dimensions(image);
    shape.reverse();
    let mut calibration = calibrations(image);
    calibration.reverse();

    let flat = flatten(&document.tags);
    let collisions = colliding_keys(&document.tags);
    if !collisions.is_empty() {
        tracing::debug!(
            path = %path,
            keys = collisions.len(),
            "DM3 tags share short names; later tags win"
        );
    }

    let mut record = MetadataRecord::new();
    record.insert(FIELD_DATASET_ID, file_dataset_id(path));
    record.insert(FIELD_FORMAT, DM3_FORMAT);
    record.insert(FIELD_SHAPE, shape.clone());
    record.insert(
        FIELD_DTYPE,
        image
            .leaf("DataType")
            .and_then(Value::as_u64)
            .map(dm_data_type_name)
            .map(Value::from)
            .unwrap_or(Value::Null),
    );
    record.insert(FIELD_NDIMS, shape.len());

    let scales = calibration
        .iter()
        .map(|(scale, _)| scale.clone().unwrap_or(Value::Null))
        .collect::<Vec<_>>();
    record.insert(
        FIELD_RESOLUTION,
        if scales.iter().all(Value::is_null) {
            Value::Null
        } else {
            Value::Array(scales)
        },
    );
    record.insert(
        FIELD_RESOLUTION_UNIT,
        calibration
            .last()
            .and_then(|(_, unit)| unit.clone())
            .unwrap_or(Value::Null),
    );
    record.insert(FIELD_FILE_SIZE_MB, file_size_mb(size));
    for (field, tag) in [
        ("pixel_size", "Pixel size"),
        ("size", "Size"),
        ("zoom_ratio", "Zoom ratio"),
    ] {
        record.insert(field, flat.get(tag).cloned().unwrap_or(Value::Null));
    }
    let channel = if shape.len() >= 3 {
        shape.last().copied().unwrap_or(1)
    } else {
        1
    };
    record.insert("channel", channel);
    record.insert(FIELD_FILE_PATH, path.as_str());
    Ok(record)
}

struct Dm3Reader<R> {
    reader: R,
    little_endian: bool,
}

impl<R: Read + Seek> Dm3Reader<R> {
    fn parse(mut reader: R) -> io::Result<Dm3Document> {
        let version = read_be_u32(&mut reader)?;
        if version != 3 {
            return Err(invalid(&format!("unsupported DM version {version}")));
        }
        let _root_length = read_be_u32(&mut reader)?;
        let little_endian = read_be_u32(&mut reader)? == 1;
        let mut this = Self {
            reader,
            little_endian,
        };
        let tags = this.read_group(0)?;
        Ok(Dm3Document {
            version,
            little_endian,
            tags,
        })
    }

    fn read_group(&mut self, depth: usize) -> io::Result<TagNode> {
        if depth > MAX_DEPTH {
            return Err(invalid("tag groups nested too deeply"));
        }
        let _sorted = self.read_u8()?;
        let _open = self.read_u8()?;
        let count = read_be_u32(&mut self.reader)?;
        let mut node = TagNode::new();
        for index in 0..count {
            let kind = self.read_u8()?;
            if kind == TAG_END {
                break;
            }
            let name_len = read_be_u16(&mut self.reader)?;
            let mut name_bytes = vec![0u8; usize::from(name_len)];
            self.reader.read_exact(&mut name_bytes)?;
            let name = if name_bytes.is_empty() {
                index.to_string()
            } else {
                name_bytes.iter().map(|&byte| char::from(byte)).collect()
            };
            match kind {
                TAG_GROUP => {
                    let group = self.read_group(depth + 1)?;
                    node.insert_group(name, group);
                }
                TAG_DATA => {
                    let value = self.read_data()?;
                    node.insert_leaf(name, value);
                }
                other => return Err(invalid(&format!("unknown tag kind {other} for {name}"))),
            }
        }
        Ok(node)
    }

    fn read_data(&mut self) -> io::Result<Value> {
        let mut marker = [0u8; 4];
        self.reader.read_exact(&mut marker)?;
        if &marker != b"%%%%" {
            return Err(invalid("missing %%%% data marker"));
        }
        let info_len = read_be_u32(&mut self.reader)?;
        if info_len == 0 || info_len > MAX_INFO_WORDS {
            return Err(invalid("bad data info length"));
        }
        let info = (0..info_len)
            .map(|_| read_be_u32(&mut self.reader))
            .collect::<io::Result<Vec<_>>>()?;

        match info[0] {
            TYPE_STRING => {
                let len = *info.get(1).ok_or_else(|| invalid("string without length"))?;
                if len > MAX_STRING_BYTES {
                    return Err(invalid(&format!("string of {len} bytes exceeds limit")));
                }
                let mut bytes = vec![0u8; len as usize];
                self.reader.read_exact(&mut bytes)?;
                Ok(Value::String(
                    bytes.iter().map(|&byte| char::from(byte)).collect(),
                ))
            }
            TYPE_STRUCT => {
                let field_types = struct_field_types(&info[1..])?;
                let values = field_types
                    .iter()
                    .map(|field_type| self.read_simple(*field_type))
                    .collect::<io::Result<Vec<_>>>()?;
                Ok(Value::Array(values))
            }
            TYPE_ARRAY => self.read_array(&info),
            simple => self.read_simple(simple),
        }
    }

    fn read_array(&mut self, info: &[u32]) -> io::Result<Value> {
        let element_type = *info.get(1).ok_or_else(|| invalid("array without type"))?;
        if element_type == TYPE_STRUCT {
            let field_types = struct_field_types(&info[2..])?;
            let count = u64::from(*info.last().ok_or_else(|| invalid("array without count"))?);
            let element_size = field_types
                .iter()
                .map(|field_type| simple_size(*field_type))
                .sum::<Option<u64>>()
                .ok_or_else(|| invalid("unknown struct field type"))?;
            self.skip(count.saturating_mul(element_size))?;
            return Ok(Value::String(format!("<{count} x struct>")));
        }

        let count = u64::from(*info.get(2).ok_or_else(|| invalid("array without count"))?);
        let size = simple_size(element_type)
            .ok_or_else(|| invalid(&format!("unknown array element type {element_type}")))?;
        if element_type == TYPE_U16 && count <= MAX_TEXT_CHARS {
            let units = (0..count)
                .map(|_| self.read_u16())
                .collect::<io::Result<Vec<_>>>()?;
            return Ok(Value::String(String::from_utf16_lossy(&units)));
        }
        if count <= MAX_INLINE_ARRAY {
            let values = (0..count)
                .map(|_| self.read_simple(element_type))
                .collect::<io::Result<Vec<_>>>()?;
            return Ok(Value::Array(values));
        }
        self.skip(count.saturating_mul(size))?;
        Ok(Value::String(format!(
            "<{count} x {}>",
            simple_type_name(element_type)
        )))
    }

    fn read_simple(&mut self, data_type: u32) -> io::Result<Value> {
        let value = match data_type {
            2 => Value::from(self.read_u16()? as i16),
            3 => Value::from(self.read_u32()? as i32),
            4 => Value::from(self.read_u16()?),
            5 => Value::from(self.read_u32()?),
            6 => Value::from(f64::from(f32::from_bits(self.read_u32()?))),
            7 => Value::from(f64::from_bits(self.read_u64()?)),
            8 => Value::from(self.read_u8()? != 0),
            9 => Value::from(self.read_u8()? as i8),
            10 => Value::from(self.read_u8()?),
            11 => Value::from(self.read_u64()? as i64),
            12 => Value::from(self.read_u64()?),
            other => return Err(invalid(&format!("unknown data type {other}"))),
        };
        Ok(value)
    }

    fn skip(&mut self, bytes: u64) -> io::Result<()> {
        let offset = i64::try_from(bytes).map_err(|_| invalid("array too large"))?;
        self.reader.seek(SeekFrom::Current(offset))?;
        Ok(())
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.reader.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn read_u16(&mut self) -> io::Result<u16> {
        let mut bytes = [0u8; 2];
        self.reader.read_exact(&mut bytes)?;
        Ok(if self.little_endian {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        })
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let mut bytes = [0u8; 4];
        self.reader.read_exact(&mut bytes)?;
        Ok(if self.little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        let mut bytes = [0u8; 8];
        self.reader.read_exact(&mut bytes)?;
        Ok(if self.little_endian {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        })
    }
}

/// Field types from a struct definition `[name_len, field_count, (name_len, type)...]`.
fn struct_field_types(definition: &[u32]) -> io::Result<Vec<u32>> {
    let field_count = *definition
        .get(1)
        .ok_or_else(|| invalid("struct without field count"))? as usize;
    let pairs = definition
        .get(2..2 + 2 * field_count)
        .ok_or_else(|| invalid("truncated struct definition"))?;
    Ok(pairs.chunks_exact(2).map(|pair| pair[1]).collect())
}

fn simple_size(data_type: u32) -> Option<u64> {
    match data_type {
        8 | 9 | 10 => Some(1),
        2 | 4 => Some(2),
        3 | 5 | 6 => Some(4),
        7 | 11 | 12 => Some(8),
        _ => None,
    }
}

fn simple_type_name(data_type: u32) -> &'static str {
    match data_type {
        2 => "i16",
        3 => "i32",
        4 => "u16",
        5 => "u32",
        6 => "f32",
        7 => "f64",
        8 => "bool",
        9 => "i8",
        10 => "u8",
        11 => "i64",
        12 => "u64",
        _ => "unknown",
    }
}

fn read_be_u16<R: Read>(reader: &mut R) -> io::Result<u16> {
    let mut bytes = [0u8; 2];
    reader.read_exact(&mut bytes)?;
    Ok(u16::from_be_bytes(bytes))
}

fn read_be_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn rejects_dm4() {
        let mut bytes = 4u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        let err = Dm3Document::read(Cursor::new(bytes)).unwrap_err();
        assert!(err.contains("version 4"));
    }

    #[test]
    fn struct_definition_types() {
        // name_len 0, two fields: (0, f32) and (0, u32)
        let types = struct_field_types(&[0, 2, 0, 6, 0, 5]).unwrap();
        assert_eq!(types, vec![6, 5]);
    }

    #[test]
    fn oversized_string_length_is_rejected() {
        let mut bytes = Vec::new();
        for word in [3u32, 0, 1] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(TAG_DATA);
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(b"Name");
        bytes.extend_from_slice(b"%%%%");
        for word in [2u32, TYPE_STRING, u32::MAX] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        let err = Dm3Document::read(Cursor::new(bytes)).unwrap_err();
        assert!(err.contains("exceeds limit"));
    }

    #[test]
    fn data_type_codes() {
        assert_eq!(dm_data_type_name(10), "uint16");
        assert_eq!(dm_data_type_name(99), "unknown(99)");
    }
}
