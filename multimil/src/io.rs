use crate::common::*;

use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
///
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    match ext {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not, or `stdout`
///
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }

    if let Some(dir) = Path::new(output_file).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    let file = File::create(output_file)?;
    match ext {
        Some("gz") => Ok(Box::new(BufWriter::new(flate2::write::GzEncoder::new(
            file,
            flate2::Compression::default(),
        )))),
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

/// Header and rows of a delimited text file
pub struct Table {
    pub header: Vec<Box<str>>,
    pub rows: Vec<Vec<Box<str>>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> anyhow::Result<usize> {
        self.header
            .iter()
            .position(|h| h.as_ref() == name)
            .ok_or_else(|| anyhow::anyhow!("column `{}` not found", name))
    }

    /// all values of a named column
    pub fn column(&self, name: &str) -> anyhow::Result<Vec<Box<str>>> {
        let j = self.column_index(name)?;
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.get(j)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("row {} has no column `{}`", i + 1, name))
            })
            .collect()
    }
}

///
/// Read a delimited file with a header line; lines starting with `#`
/// are skipped
///
/// * `input_file` - file name--either gzipped or not
/// * `delim` - field delimiter
///
pub fn read_table(input_file: &str, delim: char) -> anyhow::Result<Table> {
    let lines: Vec<String> = open_buf_reader(input_file)?
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
        .collect();

    let (hdr, body) = lines
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("{} has no header line", input_file))?;

    let split = |line: &str| -> Vec<Box<str>> {
        line.split(delim)
            .map(|w| w.trim().to_string().into_boxed_str())
            .collect()
    };

    let header = split(hdr);
    let rows: Vec<Vec<Box<str>>> = body.par_iter().map(|l| split(l)).collect();

    Ok(Table { header, rows })
}

///
/// Write a header line and rows
/// * `output_file` - file name--either gzipped or not
///
pub fn write_table<S: AsRef<str>>(
    output_file: &str,
    header: &[S],
    rows: &[Vec<String>],
    delim: char,
) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(output_file)?;
    let sep = delim.to_string();
    let hdr: Vec<&str> = header.iter().map(|h| h.as_ref()).collect();
    writeln!(buf, "{}", hdr.join(&sep))?;
    for row in rows {
        if let Err(e) = writeln!(buf, "{}", row.join(&sep)) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Ok(());
            }
            return Err(e.into());
        }
    }
    buf.flush()?;
    Ok(())
}

/// Feature matrix with row (cell) and column (feature) names
pub struct NamedMatrix {
    pub rows: Vec<String>,
    pub cols: Vec<String>,
    pub data: Mat,
}

///
/// Read a TSV matrix: the first column holds row names, the header
/// holds column names
///
pub fn read_named_matrix(input_file: &str) -> anyhow::Result<NamedMatrix> {
    let table = read_table(input_file, '\t')?;
    if table.header.len() < 2 {
        return Err(anyhow::anyhow!("{}: expected a name column and features", input_file));
    }
    let cols: Vec<String> = table.header[1..].iter().map(|s| s.to_string()).collect();
    let ncol = cols.len();
    let nrow = table.rows.len();

    let values: Vec<Vec<f32>> = table
        .rows
        .par_iter()
        .enumerate()
        .map(|(i, row)| -> anyhow::Result<Vec<f32>> {
            if row.len() != ncol + 1 {
                return Err(anyhow::anyhow!(
                    "{}: line {} has {} fields, expected {}",
                    input_file,
                    i + 2,
                    row.len(),
                    ncol + 1
                ));
            }
            row[1..]
                .iter()
                .map(|v| {
                    v.parse::<f32>()
                        .map_err(|e| anyhow::anyhow!("{}: `{}` {}", input_file, v, e))
                })
                .collect()
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let data = Mat::from_fn(nrow, ncol, |r, c| values[r][c]);
    let rows = table.rows.iter().map(|r| r[0].to_string()).collect();

    debug!("read {} x {} matrix from {}", nrow, ncol, input_file);
    Ok(NamedMatrix { rows, cols, data })
}

pub fn write_named_matrix<S: AsRef<str> + Sync>(
    output_file: &str,
    row_names: &[S],
    col_names: &[S],
    data: &Mat,
) -> anyhow::Result<()> {
    if row_names.len() != data.nrows() || col_names.len() != data.ncols() {
        return Err(anyhow::anyhow!(
            "names ({} x {}) do not match the matrix ({} x {})",
            row_names.len(),
            col_names.len(),
            data.nrows(),
            data.ncols()
        ));
    }
    let mut header = vec!["name".to_string()];
    header.extend(col_names.iter().map(|c| c.as_ref().to_string()));

    let rows: Vec<Vec<String>> = (0..data.nrows())
        .into_par_iter()
        .map(|r| {
            let mut row = Vec::with_capacity(data.ncols() + 1);
            row.push(row_names[r].as_ref().to_string());
            row.extend(data.row(r).iter().map(|v| v.to_string()));
            row
        })
        .collect();

    write_table(output_file, &header, &rows, '\t')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzipped_matrix_survives_a_write_and_read() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("x.tsv.gz");
        let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;

        let data = Mat::from_row_slice(2, 3, &[0.0, 1.5, -2.0, 3.25, 0.0, 1e-3]);
        let rows = vec!["c1".to_string(), "c2".to_string()];
        let cols = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        write_named_matrix(file, &rows, &cols, &data)?;

        let back = read_named_matrix(file)?;
        assert_eq!(back.rows, rows);
        assert_eq!(back.cols, cols);
        assert_eq!(back.data, data);
        Ok(())
    }

    #[test]
    fn ragged_lines_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("x.tsv");
        std::fs::write(&file, "name\ta\tb\nc1\t1\n")?;
        assert!(read_named_matrix(file.to_str().ok_or(anyhow::anyhow!("path"))?).is_err());
        Ok(())
    }
}
