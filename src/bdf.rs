//! Decoding of correlator data blocks held in binary data files (BDFs).
//!
//! An index maps runs of rows onto blocks. Cross-correlation blocks store
//! baselines in `(i2, i1)` order and are read through a transposition table;
//! auto-correlation blocks are stored in row order with their own packing.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, warn};
use ndarray::{Array2, Axis};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::vis::VisBuffer;

/// How the samples of a block are encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleEncoding {
    /// Complex cross-correlations as pairs of 16-bit integers.
    Int16,
    /// Complex cross-correlations as pairs of 32-bit integers.
    Int32,
    /// Complex cross-correlations as pairs of 32-bit floats.
    Float32,
    /// Auto-correlations as packed 32-bit floats.
    AutoCorr,
}

impl SampleEncoding {
    pub fn from_tag(tag: u32) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(SampleEncoding::Int16),
            1 => Ok(SampleEncoding::Int32),
            3 => Ok(SampleEncoding::Float32),
            10 => Ok(SampleEncoding::AutoCorr),
            other => Err(DecodeError::UnknownDataType(other)),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            SampleEncoding::Int16 => 0,
            SampleEncoding::Int32 => 1,
            SampleEncoding::Float32 => 3,
            SampleEncoding::AutoCorr => 10,
        }
    }
}

/// One index entry: where the rows `row..row + n_bl` live and how they are laid out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockIndex {
    /// First row of the block.
    pub row: usize,
    pub n_bl: usize,
    pub spw: usize,
    pub n_chan: usize,
    pub n_pol: usize,
    /// Distance between consecutive baselines, in samples.
    pub step_bl: usize,
    /// Start of the data within the block, in samples.
    pub block_offset: usize,
    /// Cross-correlations are divided by the entry for their spectral window.
    pub scale_factors: Vec<f64>,
    pub encoding: SampleEncoding,
    pub file_nr: usize,
    pub file_offset: u64,
    /// Block length in bytes.
    pub data_size: usize,
}

impl BlockIndex {
    pub fn n_rows(&self) -> usize {
        self.n_bl
    }

    /// Decoded `(channels, polarisations)`. Three auto-correlation products
    /// expand to four.
    pub fn row_shape(&self) -> (usize, usize) {
        if self.encoding == SampleEncoding::AutoCorr && self.n_pol == 3 {
            (self.n_chan, 4)
        } else {
            (self.n_chan, self.n_pol)
        }
    }
}

/// Maps a row's position within a cross-correlation block to the baseline
/// number under which it is stored.
#[derive(Clone, Debug, Default)]
pub struct BaselineTransposer {
    n_bl: usize,
    table: Vec<usize>,
}

impl BaselineTransposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Antennas needed for `n_bl` cross-correlation baselines.
    pub fn antennas_for(n_bl: usize) -> usize {
        ((1.0 + (1.0 + 8.0 * n_bl as f64).sqrt()) / 2.0 + 0.5).floor() as usize
    }

    /// Stored number of baseline `(i1, i2)`, `i1 < i2`. Storage runs over `i2`,
    /// then `i1`.
    #[inline]
    pub fn stored_number(i1: usize, i2: usize) -> usize {
        i2 * (i2 - 1) / 2 + i1
    }

    /// Rebuild the table if the baseline count changed. Returns whether it did.
    pub fn update(&mut self, n_bl: usize) -> bool {
        if n_bl == self.n_bl && !self.table.is_empty() {
            return false;
        }
        let n_ant = Self::antennas_for(n_bl);
        self.table.clear();
        for i1 in 0..n_ant {
            for i2 in i1 + 1..n_ant {
                self.table.push(Self::stored_number(i1, i2));
            }
        }
        self.n_bl = n_bl;
        debug!(
            "Baseline transposition rebuilt for {} baselines ({} antennas)",
            n_bl, n_ant
        );
        true
    }

    pub fn n_bl(&self) -> usize {
        self.n_bl
    }

    pub fn table(&self) -> &[usize] {
        &self.table
    }

    #[inline]
    pub fn get(&self, row_in_block: usize) -> Option<usize> {
        self.table.get(row_in_block).copied()
    }
}

fn block_slice(data: &[u8], start: usize, len: usize) -> Result<&[u8], DecodeError> {
    data.get(start..start + len).ok_or(DecodeError::BlockTooShort {
        needed: start + len,
        got: data.len(),
    })
}

fn decode_cross(
    data: &[u8],
    ix: &BlockIndex,
    bl: usize,
    size: usize,
    read: impl Fn(&[u8]) -> f64,
) -> Result<Array2<Complex32>, DecodeError> {
    let scale = *ix
        .scale_factors
        .get(ix.spw)
        .ok_or(DecodeError::MissingScaleFactor {
            spw: ix.spw,
            n: ix.scale_factors.len(),
        })?;
    let n = ix.n_chan * ix.n_pol;
    let start = 2 * (ix.block_offset + bl * ix.step_bl) * size;
    let bytes = block_slice(data, start, 2 * n * size)?;

    let values: Vec<Complex32> = bytes
        .chunks_exact(2 * size)
        .map(|pair| {
            Complex32::new(
                (read(&pair[..size]) / scale) as f32,
                (read(&pair[size..]) / scale) as f32,
            )
        })
        .collect();
    Ok(Array2::from_shape_vec((ix.n_chan, ix.n_pol), values)?)
}

fn auto_floats<B: ByteOrder>(
    data: &[u8],
    ix: &BlockIndex,
    bl: usize,
    per_chan: usize,
) -> Result<Vec<f32>, DecodeError> {
    let start = (ix.block_offset + bl * ix.step_bl) * 4;
    let bytes = block_slice(data, start, ix.n_chan * per_chan * 4)?;
    Ok(bytes.chunks_exact(4).map(B::read_f32).collect())
}

/// Auto-correlations: 1 or 2 real products, or all four with the cross hands
/// reconstructed (`YX = conj(XY)` when only three are stored).
fn decode_auto<B: ByteOrder>(
    data: &[u8],
    ix: &BlockIndex,
    bl: usize,
) -> Result<Array2<Complex32>, DecodeError> {
    let per_chan = match ix.n_pol {
        1 | 2 => ix.n_pol,
        3 => 4,
        4 => 6,
        n_pol => {
            return Err(DecodeError::UnsupportedPolarisations {
                encoding: ix.encoding,
                n_pol,
            })
        }
    };
    let floats = auto_floats::<B>(data, ix, bl, per_chan)?;

    let mut out = Array2::zeros(ix.row_shape());
    for (d, mut o) in floats.chunks_exact(per_chan).zip(out.outer_iter_mut()) {
        match ix.n_pol {
            3 => {
                o[0] = Complex32::new(d[0], 0.0);
                o[1] = Complex32::new(d[1], d[2]);
                o[2] = Complex32::new(d[1], -d[2]);
                o[3] = Complex32::new(d[3], 0.0);
            }
            4 => {
                o[0] = Complex32::new(d[0], 0.0);
                o[1] = Complex32::new(d[1], d[2]);
                o[2] = Complex32::new(d[3], d[4]);
                o[3] = Complex32::new(d[5], 0.0);
            }
            _ => {
                for (o, &v) in o.iter_mut().zip(d) {
                    *o = Complex32::new(v, 0.0);
                }
            }
        }
    }
    Ok(out)
}

/// Decode baseline `bl` of a block.
pub fn decode_row<B: ByteOrder>(
    data: &[u8],
    ix: &BlockIndex,
    bl: usize,
) -> Result<Array2<Complex32>, DecodeError> {
    match ix.encoding {
        SampleEncoding::Int16 => decode_cross(data, ix, bl, 2, |b| B::read_i16(b) as f64),
        SampleEncoding::Int32 => decode_cross(data, ix, bl, 4, |b| B::read_i32(b) as f64),
        SampleEncoding::Float32 => decode_cross(data, ix, bl, 4, |b| B::read_f32(b) as f64),
        SampleEncoding::AutoCorr => decode_auto::<B>(data, ix, bl),
    }
}

/// Decode baseline `bl` of an auto-correlation block as real values.
pub fn decode_float_row<B: ByteOrder>(
    data: &[u8],
    ix: &BlockIndex,
    bl: usize,
) -> Result<Array2<f32>, DecodeError> {
    if ix.encoding != SampleEncoding::AutoCorr {
        return Err(DecodeError::NotFloatData(ix.encoding));
    }
    if ix.n_pol > 2 {
        return Err(DecodeError::UnsupportedPolarisations {
            encoding: ix.encoding,
            n_pol: ix.n_pol,
        });
    }
    let floats = auto_floats::<B>(data, ix, bl, ix.n_pol)?;
    Ok(Array2::from_shape_vec((ix.n_chan, ix.n_pol), floats)?)
}

/// Reads rows from a set of BDFs through a block index. The most recently
/// used file and block are kept.
pub struct BlockReader {
    files: Vec<PathBuf>,
    index: Vec<BlockIndex>,
    big_endian: bool,
    columns: Vec<String>,
    available: bool,
    transposer: BaselineTransposer,
    open: Option<(usize, File)>,
    loaded: Option<(usize, u64)>,
    data: Vec<u8>,
}

impl BlockReader {
    /// If the first BDF cannot be opened, the reader is still created but
    /// every read fails with [`DecodeError::Unavailable`].
    pub fn new(
        files: Vec<PathBuf>,
        index: Vec<BlockIndex>,
        stored_big_endian: bool,
        columns: Vec<String>,
    ) -> Self {
        let mut available = true;
        if !index.is_empty() {
            let first_open = match files.first() {
                Some(path) => File::open(path)
                    .map(|_| ())
                    .map_err(|e| format!("{}: {}", path.display(), e)),
                None => Err("no binary data files listed".to_string()),
            };
            if let Err(e) = first_open {
                warn!("An error occurred when accessing the binary data referenced by this index: {}", e);
                warn!(
                    "You will not be able to access the columns {:?}; the data may have been moved from their import location",
                    columns
                );
                available = false;
            }
        }

        BlockReader {
            files,
            index,
            big_endian: stored_big_endian,
            columns,
            available,
            transposer: BaselineTransposer::new(),
            open: None,
            loaded: None,
            data: vec![],
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn index(&self) -> &[BlockIndex] {
        &self.index
    }

    /// Entry of the last block starting at or before `row`.
    pub fn search_index(&self, row: usize) -> Result<usize, DecodeError> {
        let entry = match self.index.binary_search_by_key(&row, |ix| ix.row) {
            Ok(entry) => entry,
            Err(0) => return Err(DecodeError::EmptyIndex),
            Err(next) => next - 1,
        };
        let ix = &self.index[entry];
        if row - ix.row >= ix.n_rows() {
            return Err(DecodeError::RowOutOfRange {
                row: row - ix.row,
                n_rows: ix.n_rows(),
            });
        }
        Ok(entry)
    }

    /// `(channels, polarisations)` of a row as returned by [`BlockReader::read_row`].
    pub fn shape(&self, row: usize) -> Result<(usize, usize), DecodeError> {
        Ok(self.index[self.search_index(row)?].row_shape())
    }

    fn load_block(&mut self, entry: usize) -> Result<(), DecodeError> {
        if !self.available {
            return Err(DecodeError::Unavailable {
                columns: self.columns.clone(),
            });
        }
        let (file_nr, file_offset, data_size) = {
            let ix = &self.index[entry];
            (ix.file_nr, ix.file_offset, ix.data_size)
        };
        if self.loaded == Some((file_nr, file_offset)) {
            return Ok(());
        }
        if file_nr >= self.files.len() {
            return Err(DecodeError::UnknownFile {
                file_nr,
                n_files: self.files.len(),
            });
        }

        if self.open.as_ref().map(|(nr, _)| *nr) != Some(file_nr) {
            self.open = None;
            let file = File::open(&self.files[file_nr])?;
            self.open = Some((file_nr, file));
        }
        self.loaded = None;
        if let Some((_, file)) = self.open.as_mut() {
            file.seek(SeekFrom::Start(file_offset))?;
            self.data.resize(data_size, 0);
            file.read_exact(&mut self.data)?;
        }
        self.loaded = Some((file_nr, file_offset));
        Ok(())
    }

    pub fn read_row(&mut self, row: usize) -> Result<Array2<Complex32>, DecodeError> {
        let entry = self.search_index(row)?;
        self.load_block(entry)?;

        let ix = &self.index[entry];
        let offset = row - ix.row;
        let bl = if ix.encoding == SampleEncoding::AutoCorr {
            offset
        } else {
            self.transposer.update(ix.n_bl);
            self.transposer.get(offset).ok_or(DecodeError::RowOutOfRange {
                row: offset,
                n_rows: self.transposer.table().len(),
            })?
        };

        if self.big_endian {
            decode_row::<BigEndian>(&self.data, ix, bl)
        } else {
            decode_row::<LittleEndian>(&self.data, ix, bl)
        }
    }

    /// Auto-correlation row as real values (1 or 2 polarisations only).
    pub fn read_float_row(&mut self, row: usize) -> Result<Array2<f32>, DecodeError> {
        let entry = self.search_index(row)?;
        if self.index[entry].encoding != SampleEncoding::AutoCorr {
            return Err(DecodeError::NotFloatData(self.index[entry].encoding));
        }
        self.load_block(entry)?;

        let ix = &self.index[entry];
        let bl = row - ix.row;
        if self.big_endian {
            decode_float_row::<BigEndian>(&self.data, ix, bl)
        } else {
            decode_float_row::<LittleEndian>(&self.data, ix, bl)
        }
    }

    /// Fill `vis.data` from rows `first_row..first_row + vis.n_rows()`.
    pub fn fill_data(&mut self, first_row: usize, vis: &mut VisBuffer) -> Result<(), DecodeError> {
        let expected = (vis.n_chan(), vis.n_pol());
        for (r, mut out) in vis.data.axis_iter_mut(Axis(0)).enumerate() {
            let row = first_row + r;
            let decoded = self.read_row(row)?;
            if decoded.dim() != expected {
                return Err(DecodeError::RowShape {
                    row,
                    got: decoded.shape().to_vec(),
                    expected: vec![expected.0, expected.1],
                });
            }
            out.assign(&decoded);
        }
        if vis.n_rows() > 0 {
            vis.spw = self.index[self.search_index(first_row)?].spw;
        }
        Ok(())
    }
}
