//! Dimension options from rows of a V4 file.
//!
//! The first cell of the header row carries the number of leading observation
//! columns after an underscore (`V4_2`). Every column from that offset onward
//! belongs to a (code, label) pair, one pair per dimension, with the label
//! column's header naming the dimension.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;

/// Lower-cased dimension name to code list ID, fetched once per file.
pub type CodelistMap = HashMap<String, String>;

/// `(dimension_name, value)`, the identity of an option within one file.
pub type DedupKey = (String, String);

pub type DedupSet = HashSet<DedupKey>;

const TIME_DIMENSION: &str = "time";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionOption {
    pub dimension_name: String,
    pub code: String,
    pub label: String,
    pub value: String,
    pub code_list_id: String,
}

impl DimensionOption {
    pub fn dedup_key(&self) -> DedupKey {
        (self.dimension_name.clone(), self.value.clone())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderError {
    #[error("file has no header row")]
    Empty,
    #[error("header cell {0:?} does not carry a column offset")]
    MissingOffset(String),
    #[error("header cell {0:?} has a non numeric column offset")]
    InvalidOffset(String),
    #[error("column offset {offset} is beyond the {columns} header columns")]
    OffsetBeyondHeader { offset: usize, columns: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExtractError {
    #[error("invalid number of columns: [{}], needs to be divisible by 2", .row.len())]
    InvalidColumnCount { row: Vec<String> },
    #[error("missing dimension value in row {row:?}")]
    MissingDimensionValue { row: Vec<String> },
    #[error("dimension {0:?} has no code list on the instance")]
    UnmappedDimension(String),
}

/// Column names of a file and the offset parsed from the first of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    names: Vec<String>,
    offset: usize,
}

impl Header {
    pub fn parse(names: Vec<String>) -> Result<Self, HeaderError> {
        let first = names.first().ok_or(HeaderError::Empty)?;
        let (_, suffix) = first
            .split_once('_')
            .ok_or_else(|| HeaderError::MissingOffset(first.clone()))?;
        let offset = suffix
            .trim()
            .parse::<usize>()
            .map_err(|_| HeaderError::InvalidOffset(first.clone()))?;

        if offset > names.len() {
            return Err(HeaderError::OffsetBeyondHeader {
                offset,
                columns: names.len(),
            });
        }

        Ok(Self { names, offset })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Turns data rows into dimension options for one file.
pub struct RowExtractor<'a> {
    header: &'a Header,
    codelists: &'a CodelistMap,
    time_column: Option<usize>,
}

impl<'a> RowExtractor<'a> {
    pub fn new(header: &'a Header, codelists: &'a CodelistMap) -> Self {
        Self {
            header,
            codelists,
            time_column: None,
        }
    }

    /// Treat the pair whose code column sits at `index` as the time pair,
    /// on top of the pairs recognised by name or position.
    pub fn time_column(mut self, index: Option<usize>) -> Self {
        self.time_column = index;
        self
    }

    /// The options of `row` that are new to this file, in column order.
    ///
    /// The row is checked in full before anything is returned, so an error
    /// in any pair means no option of the row is emitted. `seen` is only
    /// read; recording keys is up to the caller.
    pub fn extract(
        &self,
        row: &[String],
        seen: &DedupSet,
    ) -> Result<Vec<DimensionOption>, ExtractError> {
        let offset = self.header.offset();
        if row.len() < offset || (row.len() - offset) % 2 != 0 {
            return Err(ExtractError::InvalidColumnCount { row: row.to_vec() });
        }

        let mut row_keys = DedupSet::new();
        let mut options = Vec::new();

        for code_index in (offset..row.len()).step_by(2) {
            let code = &row[code_index];
            let label = &row[code_index + 1];
            if code.is_empty() && label.is_empty() {
                return Err(ExtractError::MissingDimensionValue { row: row.to_vec() });
            }

            let header_name = self
                .header
                .names()
                .get(code_index + 1)
                .ok_or_else(|| ExtractError::InvalidColumnCount { row: row.to_vec() })?;
            let dimension_name = header_name.to_lowercase();
            let code_list_id = self
                .codelists
                .get(&dimension_name)
                .ok_or_else(|| ExtractError::UnmappedDimension(header_name.clone()))?;

            let value = if self.is_time_pair(code_index, code, &dimension_name) {
                label
            } else if !code.is_empty() {
                code
            } else {
                label
            };
            if value.is_empty() {
                return Err(ExtractError::MissingDimensionValue { row: row.to_vec() });
            }

            let key = (dimension_name, value.clone());
            if seen.contains(&key) || row_keys.contains(&key) {
                continue;
            }
            row_keys.insert(key.clone());

            options.push(DimensionOption {
                dimension_name: key.0,
                code: code.clone(),
                label: label.clone(),
                value: key.1,
                code_list_id: code_list_id.clone(),
            });
        }

        Ok(options)
    }

    /// Time options are identified by their label. A pair is the time pair
    /// when the dimension is named `time`, when its code cell names the code
    /// list instead of a code (`Year` under `Year`), or when it sits at the
    /// configured time column.
    fn is_time_pair(&self, code_index: usize, code: &str, dimension_name: &str) -> bool {
        dimension_name == TIME_DIMENSION
            || code.to_lowercase() == dimension_name
            || self.time_column == Some(code_index)
    }
}
