//! Read back the MAT-5 subset that [`write`](crate::mat::write) emits.
//!
//! This is a linear reader: it walks the top-level data elements in file
//! order and reconstructs each variable. Variables produced by other writers
//! parse as long as they stay inside the same subset (little-endian,
//! non-sparse, numeric data stored in its native element type).

use std::io::{self, prelude::*, Cursor};

use binrw::BinRead;
use byteorder::{ReadBytesExt, LE};
use flate2::read::ZlibDecoder;

use crate::mat::write::{FileHeader, ENDIAN_LE, MAT5_VERSION};
use crate::mat::{class, el, MatVar, NumericClass, NumericData};
use crate::{TelematError, TelematResult};

/// Reads the variables of a MAT-5 file in file order.
pub struct Reader<R: Read + Seek> {
    reader: R,
}

impl<R: Read + Seek> Reader<R> {
    /// Parses and validates the file header; the resulting reader iterates
    /// over `(name, variable)` pairs.
    pub fn new(mut reader: R) -> TelematResult<Self> {
        let header = FileHeader::read_le(&mut reader).map_err(|_| TelematError::BadMatHeader)?;
        if header.endian != ENDIAN_LE || header.version != MAT5_VERSION {
            return Err(TelematError::BadMatHeader);
        }
        Ok(Self { reader })
    }

    fn next_var(&mut self) -> TelematResult<Option<(String, MatVar)>> {
        let ty = match self.reader.read_u32::<LE>() {
            Ok(ty) => ty,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if ty >> 16 != 0 {
            return Err(TelematError::UnsupportedMatFile(
                "small element at the top level",
            ));
        }
        let len = self.reader.read_u32::<LE>()? as usize;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;

        match ty {
            el::COMPRESSED => {
                let mut decompressed = Vec::new();
                ZlibDecoder::new(&payload[..]).read_to_end(&mut decompressed)?;
                let mut cursor = Cursor::new(&decompressed[..]);
                let (ty, body) = read_element(&mut cursor)?;
                if ty != el::MATRIX {
                    return Err(TelematError::UnsupportedMatFile(
                        "compressed element does not hold a matrix",
                    ));
                }
                parse_matrix(&body).map(Some)
            }
            el::MATRIX => {
                // Top-level matrices are padded like any other element.
                skip_padding(&mut self.reader, len)?;
                parse_matrix(&payload).map(Some)
            }
            _ => Err(TelematError::UnsupportedMatFile(
                "unexpected top-level element type",
            )),
        }
    }
}

impl<R: Read + Seek> Iterator for Reader<R> {
    type Item = TelematResult<(String, MatVar)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_var().transpose()
    }
}

/// Convenience: all variables of the file at `path`.
pub fn read_file(path: impl AsRef<std::path::Path>) -> TelematResult<Vec<(String, MatVar)>> {
    let file = std::fs::File::open(path)?;
    Reader::new(io::BufReader::new(file))?.collect()
}

fn skip_padding<R: Read>(reader: &mut R, payload_len: usize) -> io::Result<()> {
    let tail = payload_len % 8;
    if tail != 0 {
        let mut pad = [0u8; 8];
        reader.read_exact(&mut pad[..8 - tail])?;
    }
    Ok(())
}

/// Reads one data element (small or regular format) including its padding.
fn read_element(cursor: &mut Cursor<&[u8]>) -> TelematResult<(u32, Vec<u8>)> {
    let word = cursor.read_u32::<LE>()?;
    let small_len = (word >> 16) as usize;
    if small_len != 0 {
        let mut data = [0u8; 4];
        cursor.read_exact(&mut data)?;
        if small_len > 4 {
            return Err(TelematError::UnsupportedMatFile(
                "small element longer than four bytes",
            ));
        }
        return Ok((word & 0xFFFF, data[..small_len].to_vec()));
    }
    let len = cursor.read_u32::<LE>()? as usize;
    let mut payload = vec![0u8; len];
    cursor.read_exact(&mut payload)?;
    skip_padding(cursor, len)?;
    Ok((word, payload))
}

fn expect_element(cursor: &mut Cursor<&[u8]>, ty: u32, what: &'static str) -> TelematResult<Vec<u8>> {
    let (actual, payload) = read_element(cursor)?;
    if actual != ty {
        return Err(TelematError::UnsupportedMatFile(what));
    }
    Ok(payload)
}

/// Parses the body of a `miMATRIX` element (everything after its tag).
fn parse_matrix(body: &[u8]) -> TelematResult<(String, MatVar)> {
    let mut cursor = Cursor::new(body);

    let flags = expect_element(&mut cursor, el::UINT32, "array flags are not uint32")?;
    if flags.len() != 8 {
        return Err(TelematError::UnsupportedMatFile("short array-flags element"));
    }
    let mat_class = u32::from_le_bytes(flags[0..4].try_into().unwrap()) & 0xFF;

    let dims_payload = expect_element(&mut cursor, el::INT32, "dimensions are not int32")?;
    let dims: Vec<usize> = dims_payload
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes(chunk.try_into().unwrap()).max(0) as usize)
        .collect();
    let count: usize = dims.iter().product();

    let name_payload = expect_element(&mut cursor, el::INT8, "array name is not int8")?;
    let name = String::from_utf8_lossy(&name_payload).into_owned();

    let var = match mat_class {
        class::CHAR => {
            let (ty, payload) = read_element(&mut cursor)?;
            let text = match ty {
                el::UTF16 | el::UINT16 => {
                    let units: Vec<u16> = payload
                        .chunks_exact(2)
                        .map(|chunk| u16::from_le_bytes(chunk.try_into().unwrap()))
                        .collect();
                    String::from_utf16(&units).map_err(|_| {
                        TelematError::UnsupportedMatFile("char array is not valid UTF-16")
                    })?
                }
                el::UTF8 => String::from_utf8(payload).map_err(|_| {
                    TelematError::UnsupportedMatFile("char array is not valid UTF-8")
                })?,
                _ => {
                    return Err(TelematError::UnsupportedMatFile(
                        "unexpected char array storage type",
                    ))
                }
            };
            MatVar::Char { text }
        }
        class::CELL => {
            let mut cells = Vec::with_capacity(count);
            for _ in 0..count {
                let body = expect_element(&mut cursor, el::MATRIX, "cell is not a matrix")?;
                let (_, cell) = parse_matrix(&body)?;
                cells.push(cell);
            }
            MatVar::Cell { dims, cells }
        }
        class::STRUCT => {
            let len_payload =
                expect_element(&mut cursor, el::INT32, "field name length is not int32")?;
            if len_payload.len() != 4 {
                return Err(TelematError::UnsupportedMatFile("bad field-name length"));
            }
            let slot = i32::from_le_bytes(len_payload[..].try_into().unwrap()) as usize;
            if slot == 0 {
                return Err(TelematError::UnsupportedMatFile("zero field-name length"));
            }
            let names_payload =
                expect_element(&mut cursor, el::INT8, "field names are not int8")?;
            let fields: Vec<String> = names_payload
                .chunks(slot)
                .map(|chunk| {
                    let end = chunk.iter().position(|&b| b == 0).unwrap_or(chunk.len());
                    String::from_utf8_lossy(&chunk[..end]).into_owned()
                })
                .collect();

            let mut elements = Vec::with_capacity(count);
            for _ in 0..count {
                let mut element = Vec::with_capacity(fields.len());
                for _ in 0..fields.len() {
                    let body =
                        expect_element(&mut cursor, el::MATRIX, "struct field is not a matrix")?;
                    let (_, value) = parse_matrix(&body)?;
                    element.push(value);
                }
                elements.push(element);
            }
            MatVar::Struct {
                dims,
                fields,
                elements,
            }
        }
        numeric => {
            let Some(numeric_class) = NumericClass::from_mat_class(numeric) else {
                return Err(TelematError::UnsupportedMatFile("unsupported array class"));
            };
            let (ty, payload) = read_element(&mut cursor)?;
            if ty != numeric_class.element_type() {
                return Err(TelematError::UnsupportedMatFile(
                    "numeric data is not stored in its native type",
                ));
            }
            let data = NumericData::from_payload(numeric_class, &payload)?;
            if data.len() != count {
                return Err(TelematError::UnsupportedMatFile(
                    "numeric data does not match its dimensions",
                ));
            }
            MatVar::Numeric { dims, data }
        }
    };

    Ok((name, var))
}
