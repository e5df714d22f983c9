//! Fixed-width table decoder for hypervisor CLI output
//!
//! virsh prints its listings as:
//! - a header line naming the columns
//! - a dashed separator line
//! - one line per record
//!
//! Values do not always stay under their header: right aligned sizes and long
//! names overflow to the left of the label. Column boundaries are therefore
//! widened leftwards until they fall on whitespace in every data row.

use std::collections::BTreeMap;
use thiserror::Error;

/// One decoded row, keyed by header label
pub type Record = BTreeMap<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("table payload is empty")]
    Empty,
}

#[derive(Debug)]
struct Column {
    label: String,
    start: usize,
}

/// Decode a table into one record per data row
pub fn decode(payload: &str) -> Result<Vec<Record>, DecodeError> {
    let lines: Vec<Vec<char>> = payload
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.chars().collect())
        .collect();

    let Some(header) = lines.first() else {
        return Err(DecodeError::Empty);
    };
    let rows = lines.get(2..).unwrap_or_default();

    let mut columns = header_columns(header);
    resolve_boundaries(&mut columns, rows);

    Ok(rows.iter().map(|row| split_row(row, &columns)).collect())
}

/// Decode a table and index the records by the value of `key`.
///
/// Later rows replace earlier ones carrying the same key.
pub fn decode_keyed(payload: &str, key: &str) -> Result<BTreeMap<String, Record>, DecodeError> {
    let mut keyed = BTreeMap::new();
    for record in decode(payload)? {
        let value = record.get(key).cloned().unwrap_or_default();
        keyed.insert(value, record);
    }
    Ok(keyed)
}

/// Header labels with the index of their first character
fn header_columns(header: &[char]) -> Vec<Column> {
    let mut columns = Vec::new();
    let mut index = 0;

    while index < header.len() {
        if header[index].is_whitespace() {
            index += 1;
            continue;
        }
        let start = index;
        while index < header.len() && !header[index].is_whitespace() {
            index += 1;
        }
        columns.push(Column {
            label: header[start..index].iter().collect(),
            start,
        });
    }

    columns
}

/// Walk every column start left while some row still has a character
/// immediately before it. A column never moves onto its left neighbour.
fn resolve_boundaries(columns: &mut [Column], rows: &[Vec<char>]) {
    for position in 0..columns.len() {
        let floor = match position {
            0 => 0,
            _ => columns[position - 1].start + 1,
        };
        let mut start = columns[position].start;

        while start > floor && rows.iter().any(|row| occupied(row, start - 1)) {
            start -= 1;
        }

        columns[position].start = start;
    }
}

fn occupied(row: &[char], index: usize) -> bool {
    row.get(index).is_some_and(|c| !c.is_whitespace())
}

fn split_row(row: &[char], columns: &[Column]) -> Record {
    columns
        .iter()
        .enumerate()
        .map(|(position, column)| {
            let end = columns
                .get(position + 1)
                .map_or(row.len(), |next| next.start)
                .min(row.len());
            let cell: String = if column.start < end {
                row[column.start..end].iter().collect()
            } else {
                String::new()
            };
            (column.label.clone(), cell.trim().to_string())
        })
        .collect()
}
