use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::types::{ResultRecord, SortKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
    Txt,
}

impl ExportFormat {
    /// Guess the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| e.parse().ok())
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            "txt" | "text" => Ok(ExportFormat::Txt),
            other => Err(anyhow!("unsupported export format: {other}")),
        }
    }
}

fn fields(r: &ResultRecord) -> [String; 6] {
    [
        r.id.to_string(),
        r.address.clone(),
        r.status.to_string(),
        r.username.clone(),
        r.password.clone(),
        r.details.clone(),
    ]
}

fn headers() -> [&'static str; 6] {
    SortKey::COLUMNS.map(SortKey::header)
}

/// Render rows (already in display order) with the fixed column order
/// `id, address, status, username, password, details`.
pub fn render(rows: &[&ResultRecord], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(Vec::new());
            wtr.write_record(headers())?;
            for r in rows {
                wtr.write_record(fields(r))?;
            }
            let bytes = wtr.into_inner().map_err(|e| anyhow!(e.to_string()))?;
            Ok(String::from_utf8(bytes)?)
        }
        ExportFormat::Json => Ok(serde_json::to_string_pretty(rows)?),
        ExportFormat::Txt => {
            let mut out = headers().join("\t");
            out.push('\n');
            for r in rows {
                out.push_str(&fields(r).join("\t"));
                out.push('\n');
            }
            Ok(out)
        }
    }
}

pub fn write_to_path(path: &Path, rows: &[&ResultRecord], format: ExportFormat) -> Result<()> {
    let body = render(rows, format)?;
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}
