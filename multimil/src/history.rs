use crate::io::{read_table, write_table};
use crate::loss::LossRecord;

/// Per-epoch loss table
///
/// Columns are `epoch`, then `{term}_train` for every term of the
/// first recorded epoch and, when validation was run,
/// `{term}_validation`. Missing values are stored as NaN.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct History {
    columns: Vec<String>,
    rows: Vec<Vec<f32>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn num_epochs(&self) -> usize {
        self.rows.len()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn push_epoch(&mut self, train: &LossRecord, validation: Option<&LossRecord>) {
        let mut named: Vec<(String, f32)> = vec![("epoch".into(), (self.rows.len() + 1) as f32)];
        named.extend(
            train
                .terms()
                .into_iter()
                .map(|(k, v)| (format!("{}_train", k), v)),
        );
        if let Some(valid) = validation {
            named.extend(
                valid
                    .terms()
                    .into_iter()
                    .map(|(k, v)| (format!("{}_validation", k), v)),
            );
        }

        if self.columns.is_empty() {
            self.columns = named.iter().map(|(k, _)| k.clone()).collect();
        }

        let row = self
            .columns
            .iter()
            .map(|c| {
                named
                    .iter()
                    .find(|(k, _)| k == c)
                    .map(|(_, v)| *v)
                    .unwrap_or(f32::NAN)
            })
            .collect();
        self.rows.push(row);
    }

    pub fn column(&self, name: &str) -> Option<Vec<f32>> {
        let j = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r[j]).collect())
    }

    pub fn last(&self, name: &str) -> Option<f32> {
        self.column(name).and_then(|v| v.last().copied())
    }

    pub fn to_csv(&self, file: &str) -> anyhow::Result<()> {
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| r.iter().map(|v| v.to_string()).collect())
            .collect();
        write_table(file, &self.columns, &rows, ',')
    }

    pub fn from_csv(file: &str) -> anyhow::Result<Self> {
        let table = read_table(file, ',')?;
        let columns: Vec<String> = table.header.iter().map(|h| h.to_string()).collect();
        let rows = table
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| -> anyhow::Result<Vec<f32>> {
                if row.len() != columns.len() {
                    return Err(anyhow::anyhow!(
                        "{}: line {} has {} fields, expected {}",
                        file,
                        i + 2,
                        row.len(),
                        columns.len()
                    ));
                }
                row.iter()
                    .map(|v| {
                        v.parse::<f32>()
                            .map_err(|e| anyhow::anyhow!("{}: `{}` {}", file, v, e))
                    })
                    .collect()
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { columns, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_round_trip_keeps_columns_and_values() -> anyhow::Result<()> {
        let mut hist = History::new();
        let rec = |loss: f32| LossRecord {
            loss,
            recon_loss: loss / 3.0,
            ..Default::default()
        };
        hist.push_epoch(&rec(1.25), Some(&rec(2.5)));
        hist.push_epoch(&rec(0.1), None);

        assert_eq!(hist.columns()[0], "epoch");
        assert!(hist.columns().contains(&"recon_loss_validation".to_string()));
        assert!(hist.last("loss_validation").is_some_and(|v| v.is_nan()));

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("history.csv");
        let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;
        hist.to_csv(file)?;
        let back = History::from_csv(file)?;

        assert_eq!(back.columns(), hist.columns());
        assert_eq!(back.column("loss_train"), hist.column("loss_train"));
        assert_eq!(back.column("recon_loss_train"), hist.column("recon_loss_train"));
        assert_eq!(back.column("epoch"), Some(vec![1.0, 2.0]));
        Ok(())
    }
}
