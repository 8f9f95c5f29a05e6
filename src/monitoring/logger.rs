use anyhow::Result;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use crate::data::types::CanonicalRecord;

/// Append-only CSV trail of forwarded records.
pub struct CsvLogger {
    log_path: String,
}

impl CsvLogger {
    pub fn new(log_path: String) -> Result<Self> {
        // Create CSV file with headers if it doesn't exist
        if !std::path::Path::new(&log_path).exists() {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&log_path)?;

            writeln!(
                file,
                "timestamp,home,away,market_type,team,outcome,points,is_first_half,odds,status"
            )?;
        }

        Ok(Self { log_path })
    }

    /// Log a record with the sink outcome (`200`, `rejected:500`, `error`).
    pub fn log_record(&self, record: &CanonicalRecord, status: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.log_path)?;

        let team_str = match &record.team {
            Some(team) => team.to_string(),
            None => "".to_string(),
        };

        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{:.3},{}",
            Utc::now().to_rfc3339(),
            escape(&record.home),
            escape(&record.away),
            record.market_type,
            team_str,
            record.outcome,
            record.points,
            record.is_first_half,
            record.odds,
            status
        )?;

        Ok(())
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
