#![allow(dead_code)]

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};
use tempfile::TempDir;

pub fn utf8_tempdir() -> (TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, path)
}

pub fn write_array(dir: &Utf8Path, shape: &[u64], attrs: Option<Value>) {
    fs::create_dir_all(dir.as_std_path()).unwrap();
    let chunks: Vec<u64> = shape.iter().map(|dim| (*dim).clamp(1, 64)).collect();
    let descriptor = json!({
        "zarr_format": 2,
        "shape": shape,
        "chunks": chunks,
        "dtype": "<u2",
        "compressor": {"id": "blosc", "cname": "zstd", "clevel": 5, "shuffle": 1},
        "fill_value": 0,
        "order": "C",
        "filters": null
    });
    fs::write(dir.join(".zarray").as_std_path(), descriptor.to_string()).unwrap();
    if let Some(attrs) = attrs {
        fs::write(dir.join(".zattrs").as_std_path(), attrs.to_string()).unwrap();
    }
}

pub fn write_group(dir: &Utf8Path, attrs: Option<Value>) {
    fs::create_dir_all(dir.as_std_path()).unwrap();
    fs::write(dir.join(".zgroup").as_std_path(), r#"{"zarr_format": 2}"#).unwrap();
    if let Some(attrs) = attrs {
        fs::write(dir.join(".zattrs").as_std_path(), attrs.to_string()).unwrap();
    }
}

pub struct TiffSpec {
    pub width: u32,
    pub height: u32,
    pub pages: usize,
    pub bits: u16,
    /// XResolution and YResolution as `numerator / 1`.
    pub resolution: Option<(u32, u32)>,
    pub description: Option<String>,
}

impl Default for TiffSpec {
    fn default() -> Self {
        Self {
            width: 4,
            height: 3,
            pages: 1,
            bits: 8,
            resolution: None,
            description: None,
        }
    }
}

/// Little-endian classic TIFF holding only image directories; readers of
/// header metadata never touch pixel data.
pub fn tiff_bytes(spec: &TiffSpec) -> Vec<u8> {
    let mut out = b"II\x2a\x00\x08\x00\x00\x00".to_vec();
    let description = spec
        .description
        .as_ref()
        .map(|text| {
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(0);
            bytes
        })
        .unwrap_or_default();

    for page in 0..spec.pages {
        let ifd_start = out.len() as u32;
        let mut count = 6u16;
        if spec.resolution.is_some() {
            count += 2;
        }
        if !description.is_empty() {
            count += 1;
        }
        let extra_start = ifd_start + 2 + 12 * u32::from(count) + 4;
        let rational_len = if spec.resolution.is_some() { 16 } else { 0 };
        let description_offset = extra_start + rational_len;
        let extra_len = rational_len + description.len() as u32;

        out.extend_from_slice(&count.to_le_bytes());
        let mut entry = |tag: u16, field_type: u16, count: u32, value: [u8; 4]| {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&field_type.to_le_bytes());
            out.extend_from_slice(&count.to_le_bytes());
            out.extend_from_slice(&value);
        };
        let short = |value: u16| {
            let [a, b] = value.to_le_bytes();
            [a, b, 0, 0]
        };
        entry(256, 4, 1, spec.width.to_le_bytes());
        entry(257, 4, 1, spec.height.to_le_bytes());
        entry(258, 3, 1, short(spec.bits));
        entry(259, 3, 1, short(1));
        if !description.is_empty() {
            entry(270, 2, description.len() as u32, description_offset.to_le_bytes());
        }
        entry(277, 3, 1, short(1));
        if spec.resolution.is_some() {
            entry(282, 5, 1, extra_start.to_le_bytes());
            entry(283, 5, 1, (extra_start + 8).to_le_bytes());
        }
        entry(296, 3, 1, short(3));

        let next = if page + 1 == spec.pages {
            0
        } else {
            extra_start + extra_len
        };
        out.extend_from_slice(&next.to_le_bytes());
        if let Some((x, y)) = spec.resolution {
            for value in [x, 1, y, 1] {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out.extend_from_slice(&description);
    }
    out
}

/// A DM3 tag value. Data values are written little-endian.
pub enum Dm3Value {
    Group(Vec<(String, Dm3Value)>),
    U32(u32),
    F32(f32),
    /// UTF-16 text stored as an array of u16.
    Text(String),
    /// A byte array long enough to be skipped, standing in for image data.
    Bytes(u32),
}

pub fn group(entries: Vec<(&str, Dm3Value)>) -> Dm3Value {
    Dm3Value::Group(
        entries
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    )
}

pub fn dm3_bytes(root: &Dm3Value) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&3u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes());
    match root {
        Dm3Value::Group(entries) => write_dm3_group(&mut out, entries),
        _ => panic!("root must be a group"),
    }
    out
}

fn write_dm3_group(out: &mut Vec<u8>, entries: &[(String, Dm3Value)]) {
    out.push(0);
    out.push(0);
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (name, value) in entries {
        let kind = if matches!(value, Dm3Value::Group(_)) { 20 } else { 21 };
        out.push(kind);
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        match value {
            Dm3Value::Group(children) => write_dm3_group(out, children),
            other => write_dm3_data(out, other),
        }
    }
}

fn write_dm3_data(out: &mut Vec<u8>, value: &Dm3Value) {
    out.extend_from_slice(b"%%%%");
    let info: Vec<u32> = match value {
        Dm3Value::U32(_) => vec![5],
        Dm3Value::F32(_) => vec![6],
        Dm3Value::Text(text) => vec![20, 4, text.encode_utf16().count() as u32],
        Dm3Value::Bytes(count) => vec![20, 10, *count],
        Dm3Value::Group(_) => unreachable!(),
    };
    out.extend_from_slice(&(info.len() as u32).to_be_bytes());
    for word in &info {
        out.extend_from_slice(&word.to_be_bytes());
    }
    match value {
        Dm3Value::U32(value) => out.extend_from_slice(&value.to_le_bytes()),
        Dm3Value::F32(value) => out.extend_from_slice(&value.to_le_bytes()),
        Dm3Value::Text(text) => {
            for unit in text.encode_utf16() {
                out.extend_from_slice(&unit.to_le_bytes());
            }
        }
        Dm3Value::Bytes(count) => out.extend(std::iter::repeat_n(0u8, *count as usize)),
        Dm3Value::Group(_) => unreachable!(),
    }
}

/// One calibrated dimension of a DM3 image.
pub fn dm3_dimension(scale: f32, units: &str) -> Dm3Value {
    group(vec![
        ("Origin", Dm3Value::F32(0.0)),
        ("Scale", Dm3Value::F32(scale)),
        ("Units", Dm3Value::Text(units.to_string())),
    ])
}

/// ImageList with a 2 x 2 thumbnail first and the main image second.
/// `dims` are in DM order (fastest axis first).
pub fn dm3_image(dims: &[u32], data_type: u32, scales: &[(f32, &str)]) -> Dm3Value {
    let image = |dims: &[u32], calibrated: bool| {
        let mut image_data = vec![
            (
                "Dimensions",
                Dm3Value::Group(
                    dims.iter()
                        .map(|dim| (String::new(), Dm3Value::U32(*dim)))
                        .collect(),
                ),
            ),
            ("DataType", Dm3Value::U32(data_type)),
            ("Data", Dm3Value::Bytes(dims.iter().product::<u32>().max(17))),
        ];
        if calibrated {
            image_data.insert(
                0,
                (
                    "Calibrations",
                    group(vec![(
                        "Dimension",
                        Dm3Value::Group(
                            scales
                                .iter()
                                .map(|(scale, units)| (String::new(), dm3_dimension(*scale, units)))
                                .collect(),
                        ),
                    )]),
                ),
            );
        }
        Dm3Value::Group(vec![("ImageData".to_string(), group(image_data))])
    };
    group(vec![
        (
            "ImageList",
            Dm3Value::Group(vec![
                (String::new(), image(&[2, 2], false)),
                (String::new(), image(dims, true)),
            ]),
        ),
        (
            "Microscope Info",
            group(vec![
                ("Pixel size", Dm3Value::F32(1.5)),
                ("Zoom ratio", Dm3Value::U32(200)),
            ]),
        ),
    ])
}
