//! Pipeline output post-processing.
//!
//! Fuses the per-sample results CSV written by the pipeline with the
//! clinical covariates captured at submission, scores every sample and
//! produces the update records merged into the image documents.

use std::collections::HashMap;
use std::io::Read;

use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::services::scoring::{
    self, round2, ClinicalCovariates, InductionType, SampleMeasurements, ScoreCard,
};

/// Column positions in `ensembled_group_features_per_sample.csv`.
const COL_FILE: usize = 0;
const COL_BASE_SIZE: usize = 1;
const COL_CORTEX_SIZE: usize = 2;
const COL_NORMAL_GLOM: usize = 3;
const COL_ABNORMAL_GLOM: usize = 4;
const COL_AIF: usize = 8;
const COL_ISA: usize = 15;
const MIN_RESULT_COLUMNS: usize = 17;

const MIN_CLINICAL_COLUMNS: usize = 6;

/// One row of pipeline output.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleResult {
    pub file: String,
    pub base_size: f64,
    pub cortex_size: f64,
    pub measurements: SampleMeasurements,
}

/// One row of the clinical input file.
#[derive(Debug, Clone, PartialEq)]
pub struct ClinicalRecord {
    pub file: String,
    pub covariates: ClinicalCovariates,
}

/// A scored sample: report row and image update in one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredImage {
    pub file: String,
    pub base_size: f64,
    pub cortex_size: f64,
    pub normal_glomeruli: f64,
    pub abnormal_glomeruli: f64,
    pub sclerosis: Option<f64>,
    pub aif: f64,
    pub isa: f64,
    pub kdpi: Option<f64>,
    /// `None` when the sample had no clinical covariates.
    pub card: Option<ScoreCard>,
}

fn cell_f64(record: &StringRecord, index: usize) -> Option<f64> {
    record.get(index)?.trim().parse::<f64>().ok()
}

/// Parse the pipeline results CSV. Short or unparseable rows are skipped.
pub fn parse_results<R: Read>(reader: R) -> Result<Vec<SampleResult>, ResultsError> {
    let mut csv = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for record in csv.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        if record.len() < MIN_RESULT_COLUMNS {
            warn!(columns = record.len(), row = ?record, "Skipping short results row");
            continue;
        }

        let parsed = (|| {
            Some(SampleResult {
                file: record.get(COL_FILE)?.to_string(),
                base_size: round2(cell_f64(&record, COL_BASE_SIZE)?),
                cortex_size: round2(cell_f64(&record, COL_CORTEX_SIZE)?),
                measurements: SampleMeasurements {
                    normal_glomeruli: round2(cell_f64(&record, COL_NORMAL_GLOM)?),
                    abnormal_glomeruli: round2(cell_f64(&record, COL_ABNORMAL_GLOM)?),
                    aif: round2(cell_f64(&record, COL_AIF)?),
                    isa: round2(cell_f64(&record, COL_ISA)?),
                },
            })
        })();

        match parsed {
            Some(row) => rows.push(row),
            None => warn!(row = ?record, "Skipping unparseable results row"),
        }
    }
    Ok(rows)
}

/// Parse the tab-separated clinical file, keyed by file name.
pub fn parse_clinical<R: Read>(reader: R) -> Result<HashMap<String, ClinicalRecord>, ResultsError> {
    let mut csv = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut records = HashMap::new();
    for record in csv.records() {
        let record = record?;
        if record.len() < MIN_CLINICAL_COLUMNS {
            warn!(row = ?record, "Skipping invalid clinical row");
            continue;
        }
        let parsed = (|| {
            Some(ClinicalRecord {
                file: record.get(0)?.to_string(),
                covariates: ClinicalCovariates {
                    kdpi: cell_f64(&record, 1)?,
                    induction: InductionType::parse_lenient(record.get(2)?),
                    recipient_age: cell_f64(&record, 3)?,
                    pumped: record.get(4)?.eq_ignore_ascii_case("y"),
                    cold_ischemia_hours: cell_f64(&record, 5)?,
                },
            })
        })();
        match parsed {
            Some(row) => {
                records.insert(row.file.clone(), row);
            }
            None => warn!(row = ?record, "Skipping unparseable clinical row"),
        }
    }
    Ok(records)
}

/// Score every result row against its clinical covariates.
pub fn score_results(
    results: &[SampleResult],
    clinical: &HashMap<String, ClinicalRecord>,
) -> Vec<ScoredImage> {
    results
        .iter()
        .map(|row| {
            let covariates = clinical.get(&row.file).map(|c| c.covariates);
            if covariates.is_none() {
                warn!(file = %row.file, "No clinical covariates for sample");
            }
            ScoredImage {
                file: row.file.clone(),
                base_size: row.base_size,
                cortex_size: row.cortex_size,
                normal_glomeruli: row.measurements.normal_glomeruli,
                abnormal_glomeruli: row.measurements.abnormal_glomeruli,
                sclerosis: row.measurements.sclerosis_ratio().map(round2),
                aif: row.measurements.aif,
                isa: row.measurements.isa,
                kdpi: covariates.map(|c| c.kdpi),
                card: covariates.map(|c| scoring::score_sample(&row.measurements, &c)),
            }
        })
        .collect()
}

impl ScoredImage {
    /// Image document fields written on completion.
    pub fn to_update(&self) -> Map<String, Value> {
        let card = self.card.as_ref();
        let mut update = Map::new();
        update.insert("file".into(), Value::from(self.file.as_str()));
        update.insert("base_size".into(), Value::from(self.base_size));
        update.insert("cortex_size".into(), Value::from(self.cortex_size));
        update.insert("norm_glom".into(), Value::from(self.normal_glomeruli));
        update.insert("abnorm_glom".into(), Value::from(self.abnormal_glomeruli));
        update.insert("schl_glom".into(), Value::from(self.sclerosis));
        update.insert("aif".into(), Value::from(self.aif));
        update.insert("isa".into(), Value::from(self.isa));
        update.insert("kdpi".into(), Value::from(self.kdpi));
        update.insert("kdqs".into(), Value::from(card.and_then(|c| c.kdqs)));
        update.insert(
            "risk".into(),
            Value::from(card.and_then(|c| c.allocation).map(|r| r.to_string())),
        );
        update.insert("year_1_score".into(), Value::from(card.and_then(|c| c.year_1_risk)));
        update.insert(
            "year_1_rec".into(),
            Value::from(card.and_then(|c| c.year_1_recommendation).map(|r| r.to_string())),
        );
        update.insert("year_4_score".into(), Value::from(card.and_then(|c| c.year_4_risk)));
        update.insert(
            "year_4_rec".into(),
            Value::from(card.and_then(|c| c.year_4_recommendation).map(|r| r.to_string())),
        );
        update
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResultsError {
    #[error("I/O error reading pipeline output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed CSV: {0}")]
    Csv(#[from] csv::Error),
}
