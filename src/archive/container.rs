/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Minimal NPZ-style container: a DEFLATE-compressed zip holding one
//! `.npy` member per bulk array plus a `meta.json` member for scalar
//! fields. See SPEC_FULL.md §2 for why this encoding was chosen.

use num_complex::Complex32;
use std::io::{self, Write};
use zip::{ZipWriter, write::SimpleFileOptions};

/// NPY v1.0 header alignment, per the numpy format spec.
const ALIGN: usize = 64;

fn shape_repr(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [n] => format!("({n},)"),
        rest => format!(
            "({})",
            rest.iter().map(usize::to_string).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Writes one NPY v1.0 array: magic, version, header dict, raw data.
fn write_npy<W: Write>(w: &mut W, descr: &str, shape: &[usize], raw: &[u8]) -> io::Result<()> {
    let dict = format!(
        "{{'descr': '{descr}', 'fortran_order': False, 'shape': {}, }}",
        shape_repr(shape)
    );
    // Magic(6) + version(2) + header_len(2) = 10 bytes before the header.
    let unpadded_total = 10 + dict.len() + 1; // +1 for the trailing newline
    let padded_total = unpadded_total.div_ceil(ALIGN) * ALIGN;
    let pad_len = padded_total - unpadded_total;
    let mut header = dict;
    header.extend(std::iter::repeat_n(' ', pad_len));
    header.push('\n');

    w.write_all(b"\x93NUMPY")?;
    w.write_all(&[1u8, 0u8])?;
    w.write_all(&(header.len() as u16).to_le_bytes())?;
    w.write_all(header.as_bytes())?;
    w.write_all(raw)?;
    Ok(())
}

fn complex_to_le_bytes(samples: &[Complex32]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(samples.len() * 8);
    for c in samples {
        raw.extend_from_slice(&c.re.to_le_bytes());
        raw.extend_from_slice(&c.im.to_le_bytes());
    }
    raw
}

pub struct ArchiveContainer<W: Write + io::Seek> {
    zip: ZipWriter<W>,
    options: SimpleFileOptions,
}

impl<W: Write + io::Seek> ArchiveContainer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            zip: ZipWriter::new(writer),
            options: SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated),
        }
    }

    pub fn write_complex_array(&mut self, name: &str, samples: &[Complex32]) -> io::Result<()> {
        self.zip.start_file(format!("{name}.npy"), self.options)?;
        write_npy(&mut self.zip, "<c8", &[samples.len()], &complex_to_le_bytes(samples))
    }

    pub fn write_u8_array(&mut self, name: &str, values: &[u8]) -> io::Result<()> {
        self.zip.start_file(format!("{name}.npy"), self.options)?;
        write_npy(&mut self.zip, "|u1", &[values.len()], values)
    }

    pub fn write_meta_json(&mut self, meta: &serde_json::Value) -> io::Result<()> {
        self.zip.start_file("meta.json", self.options)?;
        self.zip.write_all(&serde_json::to_vec_pretty(meta)?)
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.zip
            .finish()
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(())
    }
}

/// Reads back the `meta.json` member of a sealed archive file, used by
/// the supervisor's startup session-boundary scan (spec.md §4.7) to
/// find where the previous run left off without re-deriving it from
/// the file name alone.
pub fn read_meta_json(path: &std::path::Path) -> io::Result<serde_json::Value> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| io::Error::other(e.to_string()))?;
    let meta_file = archive.by_name("meta.json").map_err(|e| io::Error::other(e.to_string()))?;
    serde_json::from_reader(meta_file).map_err(io::Error::other)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn npy_header_is_64_byte_aligned() {
        let mut buf = Vec::new();
        write_npy(&mut buf, "<f4", &[3], &[0u8; 12]).unwrap();
        let header_len = u16::from_le_bytes([buf[8], buf[9]]) as usize;
        assert_eq!((10 + header_len) % ALIGN, 0);
        assert_eq!(&buf[0..6], b"\x93NUMPY");
    }

    #[test]
    fn shape_repr_matches_numpy_tuple_syntax() {
        assert_eq!(shape_repr(&[]), "()");
        assert_eq!(shape_repr(&[5]), "(5,)");
        assert_eq!(shape_repr(&[2, 3]), "(2, 3)");
    }

    #[test]
    fn round_trips_through_zip_reader() {
        let buf = Cursor::new(Vec::new());
        let mut container = ArchiveContainer::new(buf);
        container
            .write_complex_array("iq", &[Complex32::new(0.5, -0.5)])
            .unwrap();
        container.write_u8_array("gap_mask", &[0, 1]).unwrap();
        container
            .write_meta_json(&serde_json::json!({"sample_rate": 16000}))
            .unwrap();
        // finish() needs the inner writer back out for this test.
        let ArchiveContainer { zip, .. } = container;
        let buf = zip.finish().unwrap();
        let mut reader = zip::ZipArchive::new(buf).unwrap();
        assert_eq!(reader.len(), 3);
        let iq = reader.by_name("iq.npy").unwrap();
        assert!(iq.size() > 0);
    }
}
