//! Write MAT-5 files.
//!
//! A file is a 128-byte header followed by one tagged data element per
//! top-level variable. Every variable here is written as a `miMATRIX`
//! element, optionally wrapped in a zlib `miCOMPRESSED` element.

use std::io::{self, prelude::*};

use binrw::{binrw, BinWrite};
use byteorder::{WriteBytesExt, LE};
use flate2::{write::ZlibEncoder, Compression};
use log::warn;

use crate::mat::{class, el, MatVar, NumericData};
use crate::{MatFileVersion, TelematError, TelematResult};

/// Field names inside a struct are stored in fixed-width slots of this many
/// bytes, including the terminating NUL.
pub(crate) const FIELD_NAME_LEN: usize = 32;

/// The fixed-size file header: 116 bytes of descriptive text, an 8-byte
/// subsystem offset (zeros), the format version, and the endianness marker.
#[binrw]
#[brw(little)]
pub(crate) struct FileHeader {
    pub text: [u8; 116],
    pub subsys_offset: [u8; 8],
    pub version: u16,
    pub endian: [u8; 2],
}

pub(crate) const MAT5_VERSION: u16 = 0x0100;

/// The endianness marker as seen by a little-endian reader.
pub(crate) const ENDIAN_LE: [u8; 2] = *b"IM";

impl FileHeader {
    fn little_endian() -> Self {
        let banner = format!(
            "MATLAB 5.0 MAT-file, Platform: {}, Created by: telemat {}",
            std::env::consts::OS,
            env!("CARGO_PKG_VERSION"),
        );
        let mut text = [b' '; 116];
        let bytes = banner.as_bytes();
        let len = bytes.len().min(text.len());
        text[..len].copy_from_slice(&bytes[..len]);
        Self {
            text,
            subsys_offset: [0; 8],
            version: MAT5_VERSION,
            endian: ENDIAN_LE,
        }
    }
}

/// Writing options: compression and the requested file version.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    compression: bool,
    version: MatFileVersion,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression: false,
            version: MatFileVersion::Default,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specifies whether top-level variables are wrapped in zlib-compressed
    /// elements.
    pub fn compression(self, compression: bool) -> Self {
        Self {
            compression,
            ..self
        }
    }

    /// Specifies the requested MAT file version. `V5`, `Default`, and
    /// `Undefined` select MAT-5. `V7_3` falls back to MAT-5 with a warning
    /// (the HDF5-based layout is not supported). `V4` is refused: MAT-4 has
    /// no struct variables, and the recorder writes one per file.
    pub fn version(self, version: MatFileVersion) -> Self {
        Self { version, ..self }
    }

    /// Creates a [`Writer`] which writes to `w` using the given options.
    pub fn create<W: Write + Seek>(self, w: W) -> TelematResult<Writer<W>> {
        Writer::with_options(w, self)
    }
}

/// Writes a MAT-5 file to the given [writer](Write).
///
/// The header goes out on construction; each [`write_var`](Self::write_var)
/// appends one complete top-level variable. Call [`finish`](Self::finish) to
/// flush the stream and check for errors when done.
pub struct Writer<W: Write + Seek> {
    writer: W,
    options: WriteOptions,
}

impl<W: Write + Seek> Writer<W> {
    pub fn new(writer: W) -> TelematResult<Self> {
        Self::with_options(writer, WriteOptions::default())
    }

    fn with_options(mut writer: W, options: WriteOptions) -> TelematResult<Self> {
        match options.version {
            MatFileVersion::V4 => {
                return Err(TelematError::UnsupportedMatVersion(options.version));
            }
            MatFileVersion::V7_3 => {
                warn!("MAT 7.3 output is not supported, falling back to MAT 5");
            }
            _ => {}
        }
        FileHeader::little_endian().write_le(&mut writer)?;
        Ok(Self { writer, options })
    }

    /// Appends one named variable to the file.
    pub fn write_var(&mut self, name: &str, var: &MatVar) -> TelematResult<()> {
        var.check()?;

        let mut element = Vec::new();
        write_matrix(&mut element, name, var)?;

        if self.options.compression {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&element)?;
            let compressed = encoder.finish()?;
            self.writer.write_u32::<LE>(el::COMPRESSED)?;
            self.writer.write_u32::<LE>(compressed.len() as u32)?;
            self.writer.write_all(&compressed)?;
        } else {
            self.writer.write_all(&element)?;
        }
        Ok(())
    }

    /// Flushes the underlying writer and hands it back.
    pub fn finish(mut self) -> TelematResult<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Writes one tagged data element, using the small-element format when the
/// payload fits in four bytes, and padding to an 8-byte boundary otherwise.
fn write_element<W: Write>(w: &mut W, ty: u32, payload: &[u8]) -> io::Result<()> {
    // A zero-length payload must use the regular format: a zeroed length
    // field in the small format is indistinguishable from a regular tag.
    if !payload.is_empty() && payload.len() <= 4 {
        w.write_u32::<LE>(ty | ((payload.len() as u32) << 16))?;
        w.write_all(payload)?;
        w.write_all(&[0u8; 4][..4 - payload.len()])?;
    } else {
        w.write_u32::<LE>(ty)?;
        w.write_u32::<LE>(payload.len() as u32)?;
        w.write_all(payload)?;
        let tail = payload.len() % 8;
        if tail != 0 {
            w.write_all(&[0u8; 8][..8 - tail])?;
        }
    }
    Ok(())
}

/// MATLAB arrays carry at least two dimensions; a bare vector becomes a row.
fn on_disk_dims(dims: &[usize]) -> Vec<i32> {
    match dims.len() {
        0 => vec![1, 0],
        1 => vec![1, dims[0] as i32],
        _ => dims.iter().map(|&d| d as i32).collect(),
    }
}

/// Serializes a complete `miMATRIX` element (tag included) for `var`.
///
/// Nested variables (cells, struct fields) are matrices with empty names.
fn write_matrix(out: &mut Vec<u8>, name: &str, var: &MatVar) -> TelematResult<()> {
    let mut body = Vec::new();

    let mat_class = match var {
        MatVar::Numeric { data, .. } => data.class().mat_class(),
        MatVar::Char { .. } => class::CHAR,
        MatVar::Cell { .. } => class::CELL,
        MatVar::Struct { .. } => class::STRUCT,
    };

    // Array flags: the class in the low byte of the first word, no flag
    // bits, and a zero nzmax (we never write sparse arrays).
    let mut flags = Vec::with_capacity(8);
    flags.write_u32::<LE>(mat_class)?;
    flags.write_u32::<LE>(0)?;
    write_element(&mut body, el::UINT32, &flags)?;

    let mut dims = Vec::new();
    for d in on_disk_dims(&var.dims()) {
        dims.write_i32::<LE>(d)?;
    }
    write_element(&mut body, el::INT32, &dims)?;

    write_element(&mut body, el::INT8, name.as_bytes())?;

    match var {
        MatVar::Numeric { data, .. } => {
            write_element(&mut body, data.class().element_type(), &data.payload())?;
        }
        MatVar::Char { text } => {
            let units: Vec<u16> = text.encode_utf16().collect();
            let data = NumericData::UInt16(units);
            write_element(&mut body, el::UTF16, &data.payload())?;
        }
        MatVar::Cell { cells, .. } => {
            for cell in cells {
                write_matrix(&mut body, "", cell)?;
            }
        }
        MatVar::Struct {
            fields, elements, ..
        } => {
            let mut field_len = Vec::with_capacity(4);
            field_len.write_i32::<LE>(FIELD_NAME_LEN as i32)?;
            write_element(&mut body, el::INT32, &field_len)?;

            let mut names = vec![0u8; fields.len() * FIELD_NAME_LEN];
            for (i, field) in fields.iter().enumerate() {
                let mut bytes = field.as_bytes();
                if bytes.len() >= FIELD_NAME_LEN {
                    warn!("struct field name `{field}` is too long, truncating");
                    bytes = &bytes[..FIELD_NAME_LEN - 1];
                }
                names[i * FIELD_NAME_LEN..i * FIELD_NAME_LEN + bytes.len()]
                    .copy_from_slice(bytes);
            }
            write_element(&mut body, el::INT8, &names)?;

            for element in elements {
                for value in element {
                    write_matrix(&mut body, "", value)?;
                }
            }
        }
    }

    out.write_u32::<LE>(el::MATRIX)?;
    out.write_u32::<LE>(body.len() as u32)?;
    out.extend_from_slice(&body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_to_vec(options: WriteOptions, vars: &[(&str, MatVar)]) -> Vec<u8> {
        let mut writer = options.create(Cursor::new(Vec::new())).unwrap();
        for (name, var) in vars {
            writer.write_var(name, var).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn header_is_128_bytes_and_little_endian() {
        let bytes = write_to_vec(WriteOptions::new(), &[]);
        assert_eq!(bytes.len(), 128);
        assert!(bytes.starts_with(b"MATLAB 5.0 MAT-file"));
        assert_eq!(&bytes[124..126], &[0x00, 0x01]);
        assert_eq!(&bytes[126..128], b"IM");
    }

    #[test]
    fn elements_are_8_byte_aligned() {
        let bytes = write_to_vec(
            WriteOptions::new(),
            &[
                ("a", MatVar::row(vec![1.0f64, 2.0, 3.0])),
                ("b", MatVar::row(vec![1i8])),
            ],
        );
        // The second variable starts right after the first element's
        // payload; both tags must land on 8-byte boundaries.
        let first_len = u32::from_le_bytes(bytes[132..136].try_into().unwrap()) as usize;
        assert_eq!((128 + 8 + first_len) % 8, 0);
        let second_tag = 128 + 8 + first_len;
        assert_eq!(
            u32::from_le_bytes(bytes[second_tag..second_tag + 4].try_into().unwrap()),
            el::MATRIX
        );
    }

    #[test]
    fn small_element_format_packs_short_payloads() {
        let mut buf = Vec::new();
        write_element(&mut buf, el::INT32, &42i32.to_le_bytes()).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), el::INT32 | (4 << 16));

        let mut empty = Vec::new();
        write_element(&mut empty, el::INT8, &[]).unwrap();
        assert_eq!(empty.len(), 8);
        assert_eq!(u32::from_le_bytes(empty[0..4].try_into().unwrap()), el::INT8);
        assert_eq!(u32::from_le_bytes(empty[4..8].try_into().unwrap()), 0);
    }

    #[test]
    fn compressed_variables_use_the_compressed_element() {
        let var = MatVar::row(vec![0.0f64; 256]);
        let bytes = write_to_vec(WriteOptions::new().compression(true), &[("z", var)]);
        assert_eq!(
            u32::from_le_bytes(bytes[128..132].try_into().unwrap()),
            el::COMPRESSED
        );
        // 256 zero doubles compress far below their 2 KiB raw size.
        assert!(bytes.len() < 600);
    }

    #[test]
    fn v4_is_refused_and_v7_3_falls_back() {
        assert!(matches!(
            WriteOptions::new()
                .version(MatFileVersion::V4)
                .create(Cursor::new(Vec::new())),
            Err(TelematError::UnsupportedMatVersion(MatFileVersion::V4))
        ));
        assert!(WriteOptions::new()
            .version(MatFileVersion::V7_3)
            .create(Cursor::new(Vec::new()))
            .is_ok());
    }
}
