//! Header-level TIFF reading: page count plus the first page's layout and
//! resolution tags. Pixel data is only read by [`decode_plane`], for the
//! uncompressed single planes that stacks are assembled from.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};

use camino::Utf8Path;
use serde_json::Value;

use crate::error::HarvestError;
use crate::formats::tiff_stack::TiffPlane;
use crate::record::{
    FIELD_DATASET_ID, FIELD_DTYPE, FIELD_FILE_PATH, FIELD_FILE_SIZE_MB, FIELD_FORMAT,
    FIELD_NDIMS, FIELD_RESOLUTION, FIELD_RESOLUTION_UNIT, FIELD_SHAPE, MetadataRecord,
    file_dataset_id, file_size_mb,
};

pub const TIFF_FORMAT: &str = "TIFF";

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_IMAGE_DESCRIPTION: u16 = 270;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_PLANAR_CONFIGURATION: u16 = 284;
const TAG_X_RESOLUTION: u16 = 282;
const TAG_Y_RESOLUTION: u16 = 283;
const TAG_RESOLUTION_UNIT: u16 = 296;
const TAG_SAMPLE_FORMAT: u16 = 339;

const MAX_PAGES: usize = 1 << 20;
const MAX_DESCRIPTION_BYTES: u64 = 1 << 16;
const MAX_STRIP_TABLE_BYTES: u64 = 1 << 24;

#[derive(Debug, Clone, PartialEq)]
pub struct TiffSummary {
    pub big_tiff: bool,
    pub pages: usize,
    pub width: u64,
    pub height: u64,
    pub bits_per_sample: u64,
    pub samples_per_pixel: u64,
    pub sample_format: u64,
    pub compression: u64,
    pub x_resolution: Option<f64>,
    pub y_resolution: Option<f64>,
    pub resolution_unit: u64,
    pub description: Option<String>,
}

impl TiffSummary {
    pub fn read<R: Read + Seek>(reader: R) -> Result<Self, String> {
        IfdReader::open(reader)
            .and_then(IfdReader::summarize)
            .map_err(|err| err.to_string())
    }

    /// Pages are prepended when there is more than one, samples appended when
    /// a pixel has more than one.
    pub fn shape(&self) -> Vec<u64> {
        let mut shape = Vec::with_capacity(4);
        if self.pages > 1 {
            shape.push(self.pages as u64);
        }
        shape.push(self.height);
        shape.push(self.width);
        if self.samples_per_pixel > 1 {
            shape.push(self.samples_per_pixel);
        }
        shape
    }

    pub fn dtype(&self) -> String {
        match (self.sample_format, self.bits_per_sample) {
            (_, 1) => "bool".to_string(),
            (1, bits) => format!("uint{bits}"),
            (2, bits) => format!("int{bits}"),
            (3, bits) => format!("float{bits}"),
            (6, bits) => format!("complex{bits}"),
            (format, bits) => format!("unknown(format={format}, bits={bits})"),
        }
    }

    pub fn resolution_unit_name(&self) -> &'static str {
        match self.resolution_unit {
            1 => "none",
            3 => "centimeter",
            _ => "inch",
        }
    }

    /// `spacing` and `unit` from an ImageJ-written description block.
    pub fn imagej_spacing(&self) -> Option<(f64, Option<String>)> {
        let description = self.description.as_deref()?;
        if !description.starts_with("ImageJ=") {
            return None;
        }
        let mut spacing = None;
        let mut unit = None;
        for line in description.lines() {
            match line.split_once('=') {
                Some(("spacing", value)) => spacing = value.trim().parse::<f64>().ok(),
                Some(("unit", value)) => unit = Some(value.trim().to_string()),
                _ => {}
            }
        }
        spacing.map(|spacing| (spacing, unit))
    }
}

/// Pixels of the first page of an uncompressed, chunky TIFF, converted to
/// little-endian samples.
pub fn decode_plane(bytes: &[u8]) -> Result<TiffPlane, String> {
    IfdReader::open(Cursor::new(bytes))
        .and_then(IfdReader::first_plane)
        .map_err(|err| err.to_string())
}

pub fn extract_tiff_record(path: &Utf8Path) -> Result<MetadataRecord, HarvestError> {
    let tiff_error = |message: String| HarvestError::Tiff {
        path: path.as_std_path().to_path_buf(),
        message,
    };
    let file = File::open(path.as_std_path()).map_err(|err| tiff_error(err.to_string()))?;
    let size = fs::metadata(path.as_std_path())
        .map_err(|err| tiff_error(err.to_string()))?
        .len();
    let summary = TiffSummary::read(BufReader::new(file)).map_err(tiff_error)?;

    let shape = summary.shape();
    let mut record = MetadataRecord::new();
    record.insert(FIELD_DATASET_ID, file_dataset_id(path));
    record.insert(FIELD_FORMAT, TIFF_FORMAT);
    record.insert(FIELD_NDIMS, shape.len());
    record.insert(FIELD_SHAPE, shape);
    record.insert(FIELD_DTYPE, summary.dtype());
    let resolution = match (summary.x_resolution, summary.y_resolution) {
        (Some(x), Some(y)) => Value::from(vec![x, y]),
        _ => Value::Null,
    };
    record.insert(FIELD_RESOLUTION, resolution);
    record.insert(FIELD_RESOLUTION_UNIT, summary.resolution_unit_name());
    record.insert(FIELD_FILE_SIZE_MB, file_size_mb(size));
    record.insert("samples_per_pixel", summary.samples_per_pixel);
    record.insert("compression", summary.compression);
    if let Some((spacing, unit)) = summary.imagej_spacing() {
        record.insert("imagej_spacing", spacing);
        if let Some(unit) = unit {
            record.insert("imagej_unit", unit);
        }
    }
    record.insert(FIELD_FILE_PATH, path.as_str());
    Ok(record)
}

#[derive(Debug, Clone)]
struct RawEntry {
    tag: u16,
    field_type: u16,
    count: u64,
    value: Vec<u8>,
}

struct IfdReader<R> {
    reader: R,
    little_endian: bool,
    big_tiff: bool,
    first_ifd: u64,
}

impl<R: Read + Seek> IfdReader<R> {
    fn open(mut reader: R) -> io::Result<Self> {
        let mut order = [0u8; 2];
        reader.read_exact(&mut order)?;
        let little_endian = match &order {
            b"II" => true,
            b"MM" => false,
            _ => return Err(invalid("not a TIFF file (bad byte order mark)")),
        };
        let mut this = Self {
            reader,
            little_endian,
            big_tiff: false,
            first_ifd: 0,
        };
        match this.read_u16()? {
            42 => {
                this.first_ifd = u64::from(this.read_u32()?);
            }
            43 => {
                this.big_tiff = true;
                let offset_size = this.read_u16()?;
                let _reserved = this.read_u16()?;
                if offset_size != 8 {
                    return Err(invalid("unsupported BigTIFF offset size"));
                }
                this.first_ifd = this.read_u64()?;
            }
            version => return Err(invalid(&format!("unsupported TIFF version {version}"))),
        }
        Ok(this)
    }

    fn summarize(mut self) -> io::Result<TiffSummary> {
        if self.first_ifd == 0 {
            return Err(invalid("TIFF has no image directories"));
        }
        let (entries, mut next) = self.read_ifd(self.first_ifd)?;
        let mut pages = 1usize;
        let mut visited = HashSet::from([self.first_ifd]);
        while next != 0 && pages < MAX_PAGES {
            if !visited.insert(next) {
                return Err(invalid("image directory chain loops"));
            }
            next = self.skip_ifd(next)?;
            pages += 1;
        }

        let find = |tag: u16| entries.iter().find(|entry| entry.tag == tag);
        let width = find(TAG_IMAGE_WIDTH)
            .and_then(|entry| self.first_uint(entry))
            .ok_or_else(|| invalid("missing ImageWidth"))?;
        let height = find(TAG_IMAGE_LENGTH)
            .and_then(|entry| self.first_uint(entry))
            .ok_or_else(|| invalid("missing ImageLength"))?;
        let uint_or = |tag: u16, default: u64| {
            find(tag)
                .and_then(|entry| self.first_uint(entry))
                .unwrap_or(default)
        };
        let bits_per_sample = uint_or(TAG_BITS_PER_SAMPLE, 1);
        let samples_per_pixel = uint_or(TAG_SAMPLES_PER_PIXEL, 1);
        let sample_format = uint_or(TAG_SAMPLE_FORMAT, 1);
        let compression = uint_or(TAG_COMPRESSION, 1);
        let resolution_unit = uint_or(TAG_RESOLUTION_UNIT, 2);

        let x_entry = find(TAG_X_RESOLUTION).cloned();
        let y_entry = find(TAG_Y_RESOLUTION).cloned();
        let description_entry = find(TAG_IMAGE_DESCRIPTION).cloned();
        let x_resolution = x_entry.map(|entry| self.rational(&entry)).transpose()?.flatten();
        let y_resolution = y_entry.map(|entry| self.rational(&entry)).transpose()?.flatten();
        let description = description_entry
            .map(|entry| self.ascii(&entry))
            .transpose()?
            .flatten();

        Ok(TiffSummary {
            big_tiff: self.big_tiff,
            pages,
            width,
            height,
            bits_per_sample,
            samples_per_pixel,
            sample_format,
            compression,
            x_resolution,
            y_resolution,
            resolution_unit,
            description,
        })
    }

    fn first_plane(mut self) -> io::Result<TiffPlane> {
        if self.first_ifd == 0 {
            return Err(invalid("TIFF has no image directories"));
        }
        let (entries, _) = self.read_ifd(self.first_ifd)?;
        let find = |tag: u16| entries.iter().find(|entry| entry.tag == tag).cloned();
        let uint = |this: &Self, tag: u16, default: u64| {
            find(tag)
                .and_then(|entry| this.first_uint(&entry))
                .unwrap_or(default)
        };
        let width = find(TAG_IMAGE_WIDTH)
            .and_then(|entry| self.first_uint(&entry))
            .ok_or_else(|| invalid("missing ImageWidth"))?;
        let height = find(TAG_IMAGE_LENGTH)
            .and_then(|entry| self.first_uint(&entry))
            .ok_or_else(|| invalid("missing ImageLength"))?;
        let bits = uint(&self, TAG_BITS_PER_SAMPLE, 1);
        let samples = uint(&self, TAG_SAMPLES_PER_PIXEL, 1);
        let compression = uint(&self, TAG_COMPRESSION, 1);
        let planar = uint(&self, TAG_PLANAR_CONFIGURATION, 1);
        if compression != 1 {
            return Err(invalid(&format!("unsupported compression {compression}")));
        }
        if planar != 1 && samples > 1 {
            return Err(invalid("planar sample layout is not supported"));
        }
        if bits == 0 || bits % 8 != 0 {
            return Err(invalid(&format!("unsupported bit depth {bits}")));
        }

        let offsets_entry = find(TAG_STRIP_OFFSETS).ok_or_else(|| invalid("missing StripOffsets"))?;
        let counts_entry =
            find(TAG_STRIP_BYTE_COUNTS).ok_or_else(|| invalid("missing StripByteCounts"))?;
        let offsets = self.uints(&offsets_entry)?;
        let counts = self.uints(&counts_entry)?;
        if offsets.len() != counts.len() {
            return Err(invalid("strip tables differ in length"));
        }

        let expected = width
            .checked_mul(height)
            .and_then(|pixels| pixels.checked_mul(samples))
            .and_then(|values| values.checked_mul(bits / 8))
            .and_then(|total| usize::try_from(total).ok())
            .ok_or_else(|| invalid("image too large"))?;
        let mut data = Vec::with_capacity(expected);
        for (offset, count) in offsets.into_iter().zip(counts) {
            let remaining = (expected - data.len()) as u64;
            let take = count.min(remaining);
            self.reader.seek(SeekFrom::Start(offset))?;
            let start = data.len();
            data.resize(start + take as usize, 0);
            self.reader.read_exact(&mut data[start..])?;
        }
        if data.len() != expected {
            return Err(invalid("strips hold fewer bytes than the image"));
        }
        let sample_bytes = (bits / 8) as usize;
        if !self.little_endian && sample_bytes > 1 {
            for sample in data.chunks_exact_mut(sample_bytes) {
                sample.reverse();
            }
        }

        let narrow = |value: u64, what: &str| {
            u32::try_from(value).map_err(|_| invalid(&format!("{what} out of range")))
        };
        let short = |value: u64, what: &str| {
            u16::try_from(value).map_err(|_| invalid(&format!("{what} out of range")))
        };
        Ok(TiffPlane {
            width: narrow(width, "width")?,
            height: narrow(height, "height")?,
            bits_per_sample: short(bits, "bit depth")?,
            samples_per_pixel: short(samples, "samples per pixel")?,
            sample_format: short(uint(&self, TAG_SAMPLE_FORMAT, 1), "sample format")?,
            photometric: short(uint(&self, TAG_PHOTOMETRIC, 1), "photometric")?,
            data,
        })
    }

    /// Every value of an unsigned integer entry.
    fn uints(&mut self, entry: &RawEntry) -> io::Result<Vec<u64>> {
        let width = match entry.field_type {
            3 => 2,
            4 => 4,
            16 => 8,
            other => return Err(invalid(&format!("tag {} has type {other}", entry.tag))),
        };
        let bytes = self
            .value_bytes(entry, MAX_STRIP_TABLE_BYTES)?
            .ok_or_else(|| invalid(&format!("tag {} table too large", entry.tag)))?;
        Ok(bytes
            .chunks_exact(width)
            .map(|raw| match width {
                2 => u64::from(self.decode_u16(raw)),
                4 => u64::from(self.decode_u32(raw)),
                _ => self.decode_u64(raw),
            })
            .collect())
    }

    fn entry_count(&mut self, offset: u64) -> io::Result<u64> {
        self.reader.seek(SeekFrom::Start(offset))?;
        if self.big_tiff {
            self.read_u64()
        } else {
            self.read_u16().map(u64::from)
        }
    }

    fn read_ifd(&mut self, offset: u64) -> io::Result<(Vec<RawEntry>, u64)> {
        let count = self.entry_count(offset)?;
        let inline = if self.big_tiff { 8 } else { 4 };
        let mut entries = Vec::with_capacity(count.min(512) as usize);
        for _ in 0..count {
            let tag = self.read_u16()?;
            let field_type = self.read_u16()?;
            let count = if self.big_tiff {
                self.read_u64()?
            } else {
                u64::from(self.read_u32()?)
            };
            let mut value = vec![0u8; inline];
            self.reader.read_exact(&mut value)?;
            entries.push(RawEntry {
                tag,
                field_type,
                count,
                value,
            });
        }
        let next = self.read_offset()?;
        Ok((entries, next))
    }

    fn skip_ifd(&mut self, offset: u64) -> io::Result<u64> {
        let count = self.entry_count(offset)?;
        let entry_size: i64 = if self.big_tiff { 20 } else { 12 };
        let skip = i64::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(entry_size))
            .ok_or_else(|| invalid("image directory too large"))?;
        self.reader.seek(SeekFrom::Current(skip))?;
        self.read_offset()
    }

    fn read_offset(&mut self) -> io::Result<u64> {
        if self.big_tiff {
            self.read_u64()
        } else {
            self.read_u32().map(u64::from)
        }
    }

    /// The entry's raw value bytes, following the offset when they do not
    /// fit inline.
    fn value_bytes(&mut self, entry: &RawEntry, limit: u64) -> io::Result<Option<Vec<u8>>> {
        let Some(size) = type_size(entry.field_type) else {
            return Ok(None);
        };
        let total = size.saturating_mul(entry.count);
        if total > limit {
            return Ok(None);
        }
        if total <= entry.value.len() as u64 {
            return Ok(Some(entry.value[..total as usize].to_vec()));
        }
        let offset = if self.big_tiff {
            self.decode_u64(&entry.value)
        } else {
            u64::from(self.decode_u32(&entry.value))
        };
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut bytes = vec![0u8; total as usize];
        self.reader.read_exact(&mut bytes)?;
        Ok(Some(bytes))
    }

    fn first_uint(&self, entry: &RawEntry) -> Option<u64> {
        if entry.count == 0 {
            return None;
        }
        match entry.field_type {
            1 => Some(u64::from(entry.value[0])),
            3 => Some(u64::from(self.decode_u16(&entry.value))),
            4 => Some(u64::from(self.decode_u32(&entry.value))),
            16 if entry.value.len() >= 8 => Some(self.decode_u64(&entry.value)),
            _ => None,
        }
    }

    fn rational(&mut self, entry: &RawEntry) -> io::Result<Option<f64>> {
        if entry.count == 0 {
            return Ok(None);
        }
        let single = RawEntry {
            count: 1,
            ..entry.clone()
        };
        let Some(bytes) = self.value_bytes(&single, 8)? else {
            return Ok(None);
        };
        let value = match entry.field_type {
            5 => {
                let numerator = f64::from(self.decode_u32(&bytes[..4]));
                let denominator = f64::from(self.decode_u32(&bytes[4..8]));
                (denominator != 0.0).then(|| numerator / denominator)
            }
            10 => {
                let numerator = f64::from(self.decode_u32(&bytes[..4]) as i32);
                let denominator = f64::from(self.decode_u32(&bytes[4..8]) as i32);
                (denominator != 0.0).then(|| numerator / denominator)
            }
            11 => Some(f64::from(f32::from_bits(self.decode_u32(&bytes[..4])))),
            12 => Some(f64::from_bits(self.decode_u64(&bytes[..8]))),
            _ => None,
        };
        Ok(value)
    }

    fn ascii(&mut self, entry: &RawEntry) -> io::Result<Option<String>> {
        if entry.field_type != 2 {
            return Ok(None);
        }
        let bytes = self.value_bytes(entry, MAX_DESCRIPTION_BYTES)?;
        Ok(bytes.map(|bytes| {
            let text = String::from_utf8_lossy(&bytes);
            text.trim_end_matches('\0').to_string()
        }))
    }

    fn read_u16(&mut self) -> io::Result<u16> {
        let mut bytes = [0u8; 2];
        self.reader.read_exact(&mut bytes)?;
        Ok(self.decode_u16(&bytes))
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let mut bytes = [0u8; 4];
        self.reader.read_exact(&mut bytes)?;
        Ok(self.decode_u32(&bytes))
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        let mut bytes = [0u8; 8];
        self.reader.read_exact(&mut bytes)?;
        Ok(self.decode_u64(&bytes))
    }

    fn decode_u16(&self, bytes: &[u8]) -> u16 {
        let raw = [bytes[0], bytes[1]];
        if self.little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        }
    }

    fn decode_u32(&self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        }
    }

    fn decode_u64(&self, bytes: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        if self.little_endian {
            u64::from_le_bytes(raw)
        } else {
            u64::from_be_bytes(raw)
        }
    }
}

fn type_size(field_type: u16) -> Option<u64> {
    match field_type {
        1 | 2 | 6 | 7 => Some(1),
        3 | 8 => Some(2),
        4 | 9 | 11 => Some(4),
        5 | 10 | 12 | 16 | 17 | 18 => Some(8),
        _ => None,
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Big-endian single-page 8-bit image, 3 x 2, no resolution tags.
    fn minimal_big_endian() -> Vec<u8> {
        let mut bytes = b"MM\x00\x2a\x00\x00\x00\x08".to_vec();
        bytes.extend_from_slice(&2u16.to_be_bytes());
        for (tag, value) in [(TAG_IMAGE_WIDTH, 3u16), (TAG_IMAGE_LENGTH, 2u16)] {
            bytes.extend_from_slice(&tag.to_be_bytes());
            bytes.extend_from_slice(&3u16.to_be_bytes());
            bytes.extend_from_slice(&1u32.to_be_bytes());
            bytes.extend_from_slice(&value.to_be_bytes());
            bytes.extend_from_slice(&[0, 0]);
        }
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes
    }

    #[test]
    fn big_endian_defaults() {
        let summary = TiffSummary::read(Cursor::new(minimal_big_endian())).unwrap();
        assert_eq!(summary.shape(), vec![2, 3]);
        assert_eq!(summary.dtype(), "bool");
        assert_eq!(summary.x_resolution, None);
        assert_eq!(summary.resolution_unit_name(), "inch");
    }

    #[test]
    fn rejects_non_tiff() {
        let err = TiffSummary::read(Cursor::new(b"GIF89a....".to_vec())).unwrap_err();
        assert!(err.contains("byte order"));
    }
}
