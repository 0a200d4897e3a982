//! The column-oriented batch handed to `enqueue_insert`. The connection core
//! only needs to enumerate `(name, column)` pairs, know the row count and ask
//! each column to serialize itself; everything else about column typing lives
//! behind the `ColumnData` trait.

use crate::net::result::Result;
use crate::net::wire::write_string;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

/// Block header fields sent ahead of the column data.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    pub is_overflows: u8,
    pub bucket_num: i32,
}

impl Default for BlockInfo {
    #[inline]
    fn default() -> BlockInfo {
        BlockInfo {
            is_overflows: 0,
            bucket_num: -1,
        }
    }
}

/// A column body that knows its wire type name and how to serialize itself.
pub trait ColumnData {
    /// The ClickHouse type name, e.g. `UInt64`.
    fn type_name(&self) -> &str;

    /// Number of rows in the column.
    fn len(&self) -> usize;

    /// Writes the column body in wire format.
    fn save(&self, out: &mut dyn Write) -> Result<()>;
}

/// A named batch of columns with a uniform row count.
pub struct Block {
    info: BlockInfo,
    columns: Vec<(String, Box<dyn ColumnData>)>,
    rows: usize,
}

impl Block {
    #[inline]
    pub fn new() -> Block {
        Block {
            info: BlockInfo::default(),
            columns: Vec::new(),
            rows: 0,
        }
    }

    /// Appends a named column. All columns of a block must hold the same
    /// number of rows.
    pub fn append_column<C: ColumnData + 'static>(&mut self, name: &str, column: C) {
        if self.columns.is_empty() {
            self.rows = column.len();
        } else if column.len() != self.rows {
            panic!(
                "Column {} has {} rows, block has {}",
                name,
                column.len(),
                self.rows
            );
        }
        self.columns.push((name.to_string(), Box::new(column)));
    }

    #[inline]
    pub fn info(&self) -> &BlockInfo {
        &self.info
    }

    #[inline]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn row_count(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn column_name(&self, idx: usize) -> &str {
        &self.columns[idx].0
    }

    /// Iterates `(name, column)` pairs in append order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &dyn ColumnData)> {
        self.columns
            .iter()
            .map(|(name, column)| (name.as_str(), column.as_ref()))
    }
}

/// A `UInt64` column.
pub struct ColumnUInt64 {
    data: Vec<u64>,
}

impl ColumnUInt64 {
    #[inline]
    pub fn new() -> ColumnUInt64 {
        ColumnUInt64 { data: Vec::new() }
    }

    #[inline]
    pub fn append(&mut self, value: u64) {
        self.data.push(value);
    }
}

impl ColumnData for ColumnUInt64 {
    fn type_name(&self) -> &str {
        "UInt64"
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        for &value in &self.data {
            out.write_u64::<LittleEndian>(value)?;
        }
        Ok(())
    }
}

/// A `String` column; each row is a length-prefixed byte string.
pub struct ColumnString {
    data: Vec<Vec<u8>>,
}

impl ColumnString {
    #[inline]
    pub fn new() -> ColumnString {
        ColumnString { data: Vec::new() }
    }

    #[inline]
    pub fn append<S: AsRef<[u8]>>(&mut self, value: S) {
        self.data.push(value.as_ref().to_vec());
    }
}

impl ColumnData for ColumnString {
    fn type_name(&self) -> &str {
        "String"
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        for value in &self.data {
            write_string(out, value)?;
        }
        Ok(())
    }
}

/// A `UUID` column. Each value is the (high, low) pair of 64-bit halves,
/// written most-significant half first, both little-endian.
pub struct ColumnUuid {
    data: Vec<(u64, u64)>,
}

impl ColumnUuid {
    #[inline]
    pub fn new() -> ColumnUuid {
        ColumnUuid { data: Vec::new() }
    }

    #[inline]
    pub fn append(&mut self, high: u64, low: u64) {
        self.data.push((high, low));
    }
}

impl ColumnData for ColumnUuid {
    fn type_name(&self) -> &str {
        "UUID"
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        for &(high, low) in &self.data {
            out.write_u64::<LittleEndian>(high)?;
            out.write_u64::<LittleEndian>(low)?;
        }
        Ok(())
    }
}
