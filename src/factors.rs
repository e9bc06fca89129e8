//! The shared factor store: one dense row-major slab per side (users,
//! items), read and written in place by every local worker.
//!
//! There is no lock around the slabs. Within a step the portions of the
//! `PortionCatalog` split the rows disjointly, so every row has at most one
//! writer, and no step reads the matrix it writes. Writers go through
//! `FactorMatrix::rows_mut`, which hands out a `RowsMut` bounded to one
//! portion's row range. Debug builds additionally record every live
//! `RowsMut` and assert that no two of them overlap.
use crate::config::Precision;
use crate::error::{EmfError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::fmt;
use std::io::{Read, Write};
use std::ops::Range;
#[cfg(debug_assertions)]
use std::sync::Mutex;

/// Rows are persisted in chunks of this many rows
const ROWS_PER_CHUNK: usize = 4096;

/// Which of the two factor matrices
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    User,
    Item,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::User => Side::Item,
            Side::Item => Side::User,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Side::User => write!(f, "user"),
            Side::Item => write!(f, "item"),
        }
    }
}

/// A `[from, to)` range of row ids
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowRange {
    pub from: usize,
    pub to: usize,
}

impl RowRange {
    pub fn new(from: usize, to: usize) -> Self {
        RowRange { from, to }
    }

    pub fn len(&self) -> usize {
        self.to.saturating_sub(self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }

    pub fn contains(&self, row: usize) -> bool {
        self.from <= row && row < self.to
    }

    pub fn overlaps(&self, other: &RowRange) -> bool {
        self.from < other.to && other.from < self.to
    }

    pub fn iter(&self) -> Range<usize> {
        self.from..self.to
    }
}

impl fmt::Display for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct Header {
    rows: u64,
    factors: u64,
    precision: Precision,
}

/// A `rows × factors` matrix of factor elements, `precision.width()` bytes
/// each, little-endian
pub struct FactorMatrix {
    rows: usize,
    factors: usize,
    precision: Precision,
    slab: Box<[UnsafeCell<u8>]>,
    #[cfg(debug_assertions)]
    claims: Mutex<Vec<RowRange>>,
}

// SAFETY: every write goes through a `RowsMut`, and callers never hold two
// `RowsMut` over the same rows nor read rows a `RowsMut` is writing (see the
// module docs). Debug builds assert the first half of that.
unsafe impl Sync for FactorMatrix {}

impl fmt::Debug for FactorMatrix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FactorMatrix")
            .field("rows", &self.rows)
            .field("factors", &self.factors)
            .field("precision", &self.precision)
            .finish()
    }
}

impl FactorMatrix {
    /// A matrix of zeros
    pub fn zeroed(rows: usize, factors: usize, precision: Precision) -> Self {
        let len = rows * factors * precision.width();
        Self::from_bytes(rows, factors, precision, vec![0u8; len])
    }

    /// A matrix drawn uniformly from `[0, 1/sqrt(factors))`
    pub fn random<R: Rng>(
        rows: usize,
        factors: usize,
        precision: Precision,
        rng: &mut R,
    ) -> Self {
        let scale = 1.0 / (factors as f64).sqrt();
        let values: Vec<f64> =
            (0..rows * factors).map(|_| rng.gen::<f64>() * scale).collect();
        let mut bytes = vec![0u8; values.len() * precision.width()];
        encode(precision, &values, &mut bytes);
        Self::from_bytes(rows, factors, precision, bytes)
    }

    fn from_bytes(
        rows: usize,
        factors: usize,
        precision: Precision,
        bytes: Vec<u8>,
    ) -> Self {
        debug_assert_eq!(bytes.len(), rows * factors * precision.width());
        FactorMatrix {
            rows,
            factors,
            precision,
            slab: bytes.into_iter().map(UnsafeCell::new).collect(),
            #[cfg(debug_assertions)]
            claims: Mutex::new(Vec::new()),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn factors(&self) -> usize {
        self.factors
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn full_range(&self) -> RowRange {
        RowRange::new(0, self.rows)
    }

    fn row_bytes_len(&self) -> usize {
        self.factors * self.precision.width()
    }

    fn check_range(&self, range: RowRange) -> Result<Range<usize>> {
        if range.from > range.to || range.to > self.rows {
            return Err(EmfError::RowOutOfRange);
        }
        let w = self.row_bytes_len();
        Ok(range.from * w..range.to * w)
    }

    /// Raw bytes of the given byte range.
    ///
    /// SAFETY: nobody may write these bytes while the slice is alive.
    unsafe fn bytes(&self, bytes: Range<usize>) -> &[u8] {
        let ptr = self.slab.as_ptr().add(bytes.start) as *const u8;
        std::slice::from_raw_parts(ptr, bytes.len())
    }

    /// SAFETY: the caller must be the only one touching these bytes.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self, bytes: Range<usize>) -> &mut [u8] {
        let ptr = UnsafeCell::raw_get(self.slab.as_ptr().add(bytes.start));
        std::slice::from_raw_parts_mut(ptr, bytes.len())
    }

    /// Decodes `row` into `out`, which must hold `factors` values
    pub fn read_row(&self, row: usize, out: &mut [f64]) {
        assert!(row < self.rows, "row {} out of {}", row, self.rows);
        assert_eq!(out.len(), self.factors);
        let w = self.row_bytes_len();
        let bytes = unsafe { self.bytes(row * w..(row + 1) * w) };
        decode(self.precision, bytes, out);
    }

    pub fn row(&self, row: usize) -> Vec<f64> {
        let mut out = vec![0.0; self.factors];
        self.read_row(row, &mut out);
        out
    }

    /// Copies out the raw bytes of `range`, ready to be sent to another node
    pub fn rows_bytes(&self, range: RowRange) -> Result<Vec<u8>> {
        let bytes = self.check_range(range)?;
        Ok(unsafe { self.bytes(bytes) }.to_vec())
    }

    /// Exclusive write access to the rows in `range`
    pub fn rows_mut(&self, range: RowRange) -> Result<RowsMut<'_>> {
        let bytes = self.check_range(range)?;
        #[cfg(debug_assertions)]
        {
            let mut claims =
                self.claims.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(other) = claims.iter().find(|c| c.overlaps(&range)) {
                panic!(
                    "rows {} are already being written as {}",
                    range, other
                );
            }
            claims.push(range);
        }
        Ok(RowsMut {
            matrix: self,
            range,
            bytes,
        })
    }

    /// Overwrites the whole matrix with raw bytes from another node
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.rows_mut(self.full_range())?.copy_from_bytes(bytes)
    }

    /// Writes a header and then every row in ascending order
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let header = Header {
            rows: self.rows as u64,
            factors: self.factors as u64,
            precision: self.precision,
        };
        bincode::serialize_into(&mut *w, &header)?;
        let mut from = 0;
        while from < self.rows {
            let to = (from + ROWS_PER_CHUNK).min(self.rows);
            let bytes = self.check_range(RowRange::new(from, to))?;
            w.write_all(unsafe { self.bytes(bytes) })?;
            from = to;
        }
        w.flush()?;
        Ok(())
    }

    /// Reads a matrix written by `write_to`, keeping its row order and
    /// precision
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let header: Header = bincode::deserialize_from(&mut *r)?;
        let rows = header.rows as usize;
        let factors = header.factors as usize;
        let mut bytes = vec![0u8; rows * factors * header.precision.width()];
        r.read_exact(&mut bytes)?;
        Ok(Self::from_bytes(rows, factors, header.precision, bytes))
    }

    /// Whether this matrix can stand in for one of the given shape
    pub fn matches(
        &self,
        rows: usize,
        factors: usize,
        precision: Precision,
    ) -> bool {
        self.rows == rows
            && self.factors == factors
            && self.precision == precision
    }
}

fn decode(precision: Precision, bytes: &[u8], out: &mut [f64]) {
    match precision {
        Precision::Single => {
            for (v, b) in out.iter_mut().zip(bytes.chunks_exact(4)) {
                *v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64;
            }
        }
        Precision::Double => {
            for (v, b) in out.iter_mut().zip(bytes.chunks_exact(8)) {
                let mut a = [0u8; 8];
                a.copy_from_slice(b);
                *v = f64::from_le_bytes(a);
            }
        }
    }
}

fn encode(precision: Precision, values: &[f64], bytes: &mut [u8]) {
    match precision {
        Precision::Single => {
            for (v, b) in values.iter().zip(bytes.chunks_exact_mut(4)) {
                b.copy_from_slice(&(*v as f32).to_le_bytes());
            }
        }
        Precision::Double => {
            for (v, b) in values.iter().zip(bytes.chunks_exact_mut(8)) {
                b.copy_from_slice(&v.to_le_bytes());
            }
        }
    }
}

/// Write access to one row range of a `FactorMatrix`
pub struct RowsMut<'a> {
    matrix: &'a FactorMatrix,
    range: RowRange,
    bytes: Range<usize>,
}

impl<'a> RowsMut<'a> {
    pub fn range(&self) -> RowRange {
        self.range
    }

    pub fn factors(&self) -> usize {
        self.matrix.factors
    }

    fn row_bytes(&self, row: usize) -> Range<usize> {
        assert!(
            self.range.contains(row),
            "row {} is outside of the owned range {}",
            row,
            self.range
        );
        let w = self.matrix.row_bytes_len();
        row * w..(row + 1) * w
    }

    pub fn read_row(&self, row: usize, out: &mut [f64]) {
        assert_eq!(out.len(), self.matrix.factors);
        let bytes = unsafe { self.matrix.bytes(self.row_bytes(row)) };
        decode(self.matrix.precision, bytes, out);
    }

    pub fn write_row(&mut self, row: usize, values: &[f64]) {
        assert_eq!(values.len(), self.matrix.factors);
        let bytes = unsafe { self.matrix.bytes_mut(self.row_bytes(row)) };
        encode(self.matrix.precision, values, bytes);
    }

    /// Overwrites the owned rows with raw bytes in this matrix's precision
    pub fn copy_from_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.bytes.len() {
            return Err(EmfError::PrecisionMismatch);
        }
        unsafe { self.matrix.bytes_mut(self.bytes.clone()) }
            .copy_from_slice(data);
        Ok(())
    }
}

#[cfg(debug_assertions)]
impl<'a> Drop for RowsMut<'a> {
    fn drop(&mut self) {
        let mut claims = self
            .matrix
            .claims
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = claims.iter().position(|c| *c == self.range) {
            claims.swap_remove(pos);
        }
    }
}

/// The user and item matrices of one training run
#[derive(Debug)]
pub struct FactorStore {
    pub users: FactorMatrix,
    pub items: FactorMatrix,
}

impl FactorStore {
    pub fn new(users: FactorMatrix, items: FactorMatrix) -> Self {
        FactorStore { users, items }
    }

    pub fn zeroed(
        users: usize,
        items: usize,
        factors: usize,
        precision: Precision,
    ) -> Self {
        FactorStore {
            users: FactorMatrix::zeroed(users, factors, precision),
            items: FactorMatrix::zeroed(items, factors, precision),
        }
    }

    pub fn side(&self, side: Side) -> &FactorMatrix {
        match side {
            Side::User => &self.users,
            Side::Item => &self.items,
        }
    }
}
