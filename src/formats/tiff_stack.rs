//! Multi-page TIFF assembly: equally shaped planes written one after another
//! into a little-endian, uncompressed file, one strip per page.

use std::io::{self, BufWriter, Seek, SeekFrom, Write};

use camino::Utf8Path;
use tempfile::Builder;

use crate::error::HarvestError;

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_IMAGE_DESCRIPTION: u16 = 270;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_PLANAR_CONFIGURATION: u16 = 284;
const TAG_SAMPLE_FORMAT: u16 = 339;

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_LONG8: u16 = 16;

/// Room left in front of the pixel data for either header flavour.
const HEADER_BYTES: u64 = 16;
/// Upper bound on one page's directory plus its out-of-line values.
const MAX_DIRECTORY_BYTES: u64 = 4096;

/// One decoded image plane; samples are little-endian and interleaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiffPlane {
    pub width: u32,
    pub height: u32,
    pub bits_per_sample: u16,
    pub samples_per_pixel: u16,
    pub sample_format: u16,
    pub photometric: u16,
    pub data: Vec<u8>,
}

impl TiffPlane {
    /// A single-sample greyscale plane.
    pub fn grey(width: u32, height: u32, bits_per_sample: u16, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bits_per_sample,
            samples_per_pixel: 1,
            sample_format: 1,
            photometric: 1,
            data,
        }
    }

    fn layout(&self) -> (u32, u32, u16, u16, u16) {
        (
            self.width,
            self.height,
            self.bits_per_sample,
            self.samples_per_pixel,
            self.sample_format,
        )
    }

    fn expected_len(&self) -> Option<u64> {
        u64::from(self.width)
            .checked_mul(u64::from(self.height))?
            .checked_mul(u64::from(self.samples_per_pixel))?
            .checked_mul(u64::from(self.bits_per_sample) / 8)
    }
}

#[derive(Debug, Clone)]
struct PageRecord {
    width: u32,
    height: u32,
    bits_per_sample: u16,
    samples_per_pixel: u16,
    sample_format: u16,
    photometric: u16,
    offset: u64,
    len: u64,
}

struct Entry {
    tag: u16,
    field_type: u16,
    count: u64,
    data: Vec<u8>,
}

/// Streams planes into `W`; the image directories are written by
/// [`TiffStackWriter::finish`] after the last plane. Files whose pixel data
/// outgrows 32-bit offsets are written as BigTIFF.
pub struct TiffStackWriter<W: Write + Seek> {
    out: W,
    position: u64,
    pages: Vec<PageRecord>,
}

impl<W: Write + Seek> TiffStackWriter<W> {
    pub fn new(mut out: W) -> io::Result<Self> {
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&[0u8; HEADER_BYTES as usize])?;
        Ok(Self {
            out,
            position: HEADER_BYTES,
            pages: Vec::new(),
        })
    }

    pub fn pages(&self) -> usize {
        self.pages.len()
    }

    pub fn push(&mut self, plane: &TiffPlane) -> io::Result<()> {
        if plane.bits_per_sample == 0 || plane.bits_per_sample % 8 != 0 {
            return Err(invalid(&format!(
                "unsupported bit depth {}",
                plane.bits_per_sample
            )));
        }
        if plane.expected_len() != Some(plane.data.len() as u64) {
            return Err(invalid("plane data does not match its dimensions"));
        }
        if let Some(first) = self.pages.first() {
            let first_layout = (
                first.width,
                first.height,
                first.bits_per_sample,
                first.samples_per_pixel,
                first.sample_format,
            );
            if first_layout != plane.layout() {
                return Err(invalid(&format!(
                    "plane {} is {}x{} ({} bits x {}), stack is {}x{} ({} bits x {})",
                    self.pages.len(),
                    plane.width,
                    plane.height,
                    plane.bits_per_sample,
                    plane.samples_per_pixel,
                    first.width,
                    first.height,
                    first.bits_per_sample,
                    first.samples_per_pixel,
                )));
            }
        }
        self.out.write_all(&plane.data)?;
        self.pages.push(PageRecord {
            width: plane.width,
            height: plane.height,
            bits_per_sample: plane.bits_per_sample,
            samples_per_pixel: plane.samples_per_pixel,
            sample_format: plane.sample_format,
            photometric: plane.photometric,
            offset: self.position,
            len: plane.data.len() as u64,
        });
        self.position += plane.data.len() as u64;
        Ok(())
    }

    /// Writes the directories and the header; returns the writer and the
    /// total file size.
    pub fn finish(mut self) -> io::Result<(W, u64)> {
        let Some(first) = self.pages.first().cloned() else {
            return Err(invalid("a stack needs at least one plane"));
        };
        if self.position % 2 == 1 {
            self.out.write_all(&[0])?;
            self.position += 1;
        }
        let directories = MAX_DIRECTORY_BYTES.saturating_mul(self.pages.len() as u64);
        let big = self.position.saturating_add(directories) > u64::from(u32::MAX);

        let mut shape = vec![self.pages.len() as u64, u64::from(first.height), u64::from(first.width)];
        if first.samples_per_pixel > 1 {
            shape.push(u64::from(first.samples_per_pixel));
        }
        let description = serde_json::json!({ "shape": shape }).to_string();

        let first_directory = self.position;
        let page_count = self.pages.len();
        let pages = std::mem::take(&mut self.pages);
        for (index, page) in pages.iter().enumerate() {
            let entries = page_entries(page, (index == 0).then_some(description.as_str()), big);
            let directory_start = self.position;
            let size = directory_size(&entries, big);
            let next = if index + 1 == page_count {
                0
            } else {
                directory_start + size
            };
            let bytes = encode_directory(&entries, directory_start, next, big);
            self.out.write_all(&bytes)?;
            self.position += bytes.len() as u64;
        }

        self.out.seek(SeekFrom::Start(0))?;
        if big {
            self.out.write_all(b"II")?;
            self.out.write_all(&43u16.to_le_bytes())?;
            self.out.write_all(&8u16.to_le_bytes())?;
            self.out.write_all(&0u16.to_le_bytes())?;
            self.out.write_all(&first_directory.to_le_bytes())?;
        } else {
            self.out.write_all(b"II")?;
            self.out.write_all(&42u16.to_le_bytes())?;
            self.out.write_all(&(first_directory as u32).to_le_bytes())?;
        }
        self.out.seek(SeekFrom::Start(self.position))?;
        self.out.flush()?;
        Ok((self.out, self.position))
    }
}

fn page_entries(page: &PageRecord, description: Option<&str>, big: bool) -> Vec<Entry> {
    let short = |tag: u16, values: &[u16]| Entry {
        tag,
        field_type: TYPE_SHORT,
        count: values.len() as u64,
        data: values.iter().flat_map(|value| value.to_le_bytes()).collect(),
    };
    let long = |tag: u16, value: u32| Entry {
        tag,
        field_type: TYPE_LONG,
        count: 1,
        data: value.to_le_bytes().to_vec(),
    };
    let offset = |tag: u16, value: u64| {
        if big {
            Entry {
                tag,
                field_type: TYPE_LONG8,
                count: 1,
                data: value.to_le_bytes().to_vec(),
            }
        } else {
            long(tag, value as u32)
        }
    };
    let samples = usize::from(page.samples_per_pixel);

    let mut entries = vec![
        long(TAG_IMAGE_WIDTH, page.width),
        long(TAG_IMAGE_LENGTH, page.height),
        short(TAG_BITS_PER_SAMPLE, &vec![page.bits_per_sample; samples]),
        short(TAG_COMPRESSION, &[1]),
        short(TAG_PHOTOMETRIC, &[page.photometric]),
    ];
    if let Some(text) = description {
        let mut data = text.as_bytes().to_vec();
        data.push(0);
        entries.push(Entry {
            tag: TAG_IMAGE_DESCRIPTION,
            field_type: TYPE_ASCII,
            count: data.len() as u64,
            data,
        });
    }
    entries.extend([
        offset(TAG_STRIP_OFFSETS, page.offset),
        short(TAG_SAMPLES_PER_PIXEL, &[page.samples_per_pixel]),
        long(TAG_ROWS_PER_STRIP, page.height),
        offset(TAG_STRIP_BYTE_COUNTS, page.len),
        short(TAG_PLANAR_CONFIGURATION, &[1]),
        short(TAG_SAMPLE_FORMAT, &vec![page.sample_format; samples]),
    ]);
    entries
}

fn inline_bytes(big: bool) -> usize {
    if big { 8 } else { 4 }
}

fn padded(len: usize) -> u64 {
    (len + len % 2) as u64
}

fn directory_size(entries: &[Entry], big: bool) -> u64 {
    let (head, entry, tail) = if big { (8, 20, 8) } else { (2, 12, 4) };
    let overflow: u64 = entries
        .iter()
        .filter(|entry| entry.data.len() > inline_bytes(big))
        .map(|entry| padded(entry.data.len()))
        .sum();
    head + entry * entries.len() as u64 + tail + overflow
}

/// A directory at `start`, followed by the values that do not fit inline.
fn encode_directory(entries: &[Entry], start: u64, next: u64, big: bool) -> Vec<u8> {
    let (head, entry_size, tail) = if big { (8u64, 20u64, 8u64) } else { (2, 12, 4) };
    let mut overflow_at = start + head + entry_size * entries.len() as u64 + tail;
    let mut out = Vec::new();
    let mut overflow = Vec::new();

    if big {
        out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    } else {
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    }
    for entry in entries {
        out.extend_from_slice(&entry.tag.to_le_bytes());
        out.extend_from_slice(&entry.field_type.to_le_bytes());
        if big {
            out.extend_from_slice(&entry.count.to_le_bytes());
        } else {
            out.extend_from_slice(&(entry.count as u32).to_le_bytes());
        }
        let mut value = vec![0u8; inline_bytes(big)];
        if entry.data.len() <= value.len() {
            value[..entry.data.len()].copy_from_slice(&entry.data);
        } else {
            if big {
                value.copy_from_slice(&overflow_at.to_le_bytes());
            } else {
                value.copy_from_slice(&(overflow_at as u32).to_le_bytes());
            }
            overflow.extend_from_slice(&entry.data);
            if entry.data.len() % 2 == 1 {
                overflow.push(0);
            }
            overflow_at += padded(entry.data.len());
        }
        out.extend_from_slice(&value);
    }
    if big {
        out.extend_from_slice(&next.to_le_bytes());
    } else {
        out.extend_from_slice(&(next as u32).to_le_bytes());
    }
    out.extend_from_slice(&overflow);
    out
}

/// Writes the planes produced by `planes` as one stack at `path`, through a
/// temp file renamed into place. The first error from `planes` aborts the
/// stack and leaves nothing at `path`. Returns the file size.
pub fn write_stack_file<I>(path: &Utf8Path, planes: I) -> Result<u64, HarvestError>
where
    I: IntoIterator<Item = Result<TiffPlane, HarvestError>>,
{
    let stack_error = |message: String| HarvestError::Tiff {
        path: path.as_std_path().to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    let temp = Builder::new()
        .prefix(".imgharvest-stack")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let mut writer =
        TiffStackWriter::new(BufWriter::new(temp)).map_err(|err| stack_error(err.to_string()))?;
    for plane in planes {
        writer
            .push(&plane?)
            .map_err(|err| stack_error(err.to_string()))?;
    }
    let pages = writer.pages();
    let (buffered, size) = writer.finish().map_err(|err| stack_error(err.to_string()))?;
    let temp = buffered
        .into_inner()
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    tracing::debug!(path = %path, pages, bytes = size, "stack written");
    Ok(size)
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::formats::tiff::{TiffSummary, decode_plane};

    fn plane(fill: u8) -> TiffPlane {
        TiffPlane::grey(4, 3, 8, vec![fill; 12])
    }

    #[test]
    fn pages_are_written_in_push_order() {
        let mut writer = TiffStackWriter::new(Cursor::new(Vec::new())).unwrap();
        for fill in [10, 20, 30] {
            writer.push(&plane(fill)).unwrap();
        }
        let (cursor, size) = writer.finish().unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(size, bytes.len() as u64);

        let summary = TiffSummary::read(Cursor::new(bytes.clone())).unwrap();
        assert!(!summary.big_tiff);
        assert_eq!(summary.pages, 3);
        assert_eq!(summary.shape(), vec![3, 3, 4]);
        assert_eq!(summary.dtype(), "uint8");
        assert_eq!(summary.description.as_deref(), Some(r#"{"shape":[3,3,4]}"#));
        assert_eq!(decode_plane(&bytes).unwrap(), plane(10));
    }

    #[test]
    fn sixteen_bit_planes_survive() {
        let data: Vec<u8> = (0u16..6).flat_map(|value| (value * 1000).to_le_bytes()).collect();
        let source = TiffPlane::grey(3, 2, 16, data);
        let mut writer = TiffStackWriter::new(Cursor::new(Vec::new())).unwrap();
        writer.push(&source).unwrap();
        let (cursor, _) = writer.finish().unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(decode_plane(&bytes).unwrap(), source);
        assert_eq!(TiffSummary::read(Cursor::new(bytes)).unwrap().dtype(), "uint16");
    }

    #[test]
    fn mismatched_plane_is_rejected() {
        let mut writer = TiffStackWriter::new(Cursor::new(Vec::new())).unwrap();
        writer.push(&plane(1)).unwrap();
        let err = writer
            .push(&TiffPlane::grey(5, 3, 8, vec![0; 15]))
            .unwrap_err();
        assert!(err.to_string().contains("stack is 4x3"));
    }

    #[test]
    fn empty_stack_is_an_error() {
        let writer = TiffStackWriter::new(Cursor::new(Vec::new())).unwrap();
        assert!(writer.finish().is_err());
    }
}
