//! Image Display Format parsing and film cell geometry.
//!
//! The grammar (PS3.3 C.13.5) is `STANDARD\c,r`, `ROW\n1,n2,...` or
//! `COL\n1,n2,...` with a literal backslash. `STANDARD` is columns,rows per
//! the standard; some SCUs send rows,columns instead, which is tolerated
//! behind the `rows_first` flag.

use thiserror::Error;

/// Upper bound on image slots per film box.
pub const MAX_CELLS: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("empty image display format")]
    Empty,

    #[error("unrecognized image display format {0:?}")]
    Unrecognized(String),

    #[error("invalid cell count in image display format {0:?}")]
    InvalidCount(String),

    #[error("image display format {0:?} implies more than {MAX_CELLS} cells")]
    TooManyCells(String),
}

/// A parsed Image Display Format value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageDisplayFormat {
    /// `STANDARD\c,r`: a regular grid of `rows` x `columns` cells
    Standard { columns: u32, rows: u32 },
    /// `ROW\n1,n2,...`: row i holds `n_i` cells
    Row(Vec<u32>),
    /// `COL\n1,n2,...`: column j holds `n_j` cells
    Col(Vec<u32>),
}

/// A cell rectangle on the film page, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ImageDisplayFormat {
    /// Parse an Image Display Format string.
    ///
    /// `rows_first` flips the `STANDARD` pair to rows,columns for peers
    /// that send the swapped form.
    pub fn parse(value: &str, rows_first: bool) -> Result<Self, FormatError> {
        let value = value.trim().trim_end_matches('\0').trim();
        if value.is_empty() {
            return Err(FormatError::Empty);
        }

        let (mode, args) = value
            .split_once('\\')
            .ok_or_else(|| FormatError::Unrecognized(value.to_string()))?;

        let counts: Vec<u32> = args
            .split(',')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|_| FormatError::InvalidCount(value.to_string()))?;
        if counts.is_empty() || counts.iter().any(|&n| n == 0) {
            return Err(FormatError::InvalidCount(value.to_string()));
        }

        let format = match mode.trim() {
            "STANDARD" => {
                if counts.len() != 2 {
                    return Err(FormatError::InvalidCount(value.to_string()));
                }
                let (columns, rows) = if rows_first {
                    (counts[1], counts[0])
                } else {
                    (counts[0], counts[1])
                };
                ImageDisplayFormat::Standard { columns, rows }
            }
            "ROW" => ImageDisplayFormat::Row(counts),
            "COL" => ImageDisplayFormat::Col(counts),
            _ => return Err(FormatError::Unrecognized(value.to_string())),
        };

        if format.cell_count() > MAX_CELLS {
            return Err(FormatError::TooManyCells(value.to_string()));
        }
        Ok(format)
    }

    /// Number of image box slots implied by the format.
    pub fn cell_count(&self) -> usize {
        match self {
            ImageDisplayFormat::Standard { columns, rows } => (columns * rows) as usize,
            ImageDisplayFormat::Row(counts) | ImageDisplayFormat::Col(counts) => {
                counts.iter().map(|&n| n as usize).sum()
            }
        }
    }

    /// The canonical string form (always columns,rows for STANDARD).
    pub fn to_dicom(&self) -> String {
        match self {
            ImageDisplayFormat::Standard { columns, rows } => {
                format!("STANDARD\\{},{}", columns, rows)
            }
            ImageDisplayFormat::Row(counts) => format!("ROW\\{}", join(counts)),
            ImageDisplayFormat::Col(counts) => format!("COL\\{}", join(counts)),
        }
    }

    /// Cell rectangles for a page of `width` x `height` pixels, in image
    /// position order: row-major for STANDARD and ROW, top-to-bottom then
    /// left-to-right for COL.
    pub fn cells(&self, width: u32, height: u32) -> Vec<Cell> {
        let mut cells = Vec::with_capacity(self.cell_count());
        match self {
            ImageDisplayFormat::Standard { columns, rows } => {
                let cell_w = width / columns;
                let cell_h = height / rows;
                for r in 0..*rows {
                    for c in 0..*columns {
                        cells.push(Cell {
                            x: c * cell_w,
                            y: r * cell_h,
                            width: cell_w,
                            height: cell_h,
                        });
                    }
                }
            }
            ImageDisplayFormat::Row(counts) => {
                let cell_h = height / counts.len() as u32;
                for (r, &n) in counts.iter().enumerate() {
                    let cell_w = width / n;
                    for c in 0..n {
                        cells.push(Cell {
                            x: c * cell_w,
                            y: r as u32 * cell_h,
                            width: cell_w,
                            height: cell_h,
                        });
                    }
                }
            }
            ImageDisplayFormat::Col(counts) => {
                let cell_w = width / counts.len() as u32;
                for (c, &n) in counts.iter().enumerate() {
                    let cell_h = height / n;
                    for r in 0..n {
                        cells.push(Cell {
                            x: c as u32 * cell_w,
                            y: r * cell_h,
                            width: cell_w,
                            height: cell_h,
                        });
                    }
                }
            }
        }
        cells
    }
}

fn join(counts: &[u32]) -> String {
    counts
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
