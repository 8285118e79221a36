//! Sample submissions and pipeline output shared by the integration tests

use kidneytx::models::image::NewImageEntry;
use kidneytx::models::submission::SubmitJobRequest;

/// Expected scoring outcome for one biopsy sample
#[derive(Debug, Clone)]
pub struct SampleFixture {
    pub file_id: &'static str,
    pub kdpi: f64,
    pub induction: &'static str,
    pub age: f64,
    pub pump: &'static str,
    pub cit: f64,
    /// Row of `ensembled_group_features_per_sample.csv` for this sample.
    pub results_row: &'static str,
    pub description: &'static str,
}

pub const SAMPLES: &[SampleFixture] = &[
    SampleFixture {
        file_id: "biopsy_a.svs",
        kdpi: 0.85,
        induction: "LymDep",
        age: 52.0,
        pump: "Y",
        cit: 14.0,
        results_row: "biopsy_a,1200.5,950.25,20,4,0,0,0,0.18,0,0,0,0,0,0,0.22,0",
        description: "High KDPI donor with moderate sclerosis",
    },
    SampleFixture {
        file_id: "biopsy_b.svs",
        kdpi: 0.35,
        induction: "LND",
        age: 61.0,
        pump: "N",
        cit: 22.5,
        results_row: "biopsy_b,800,640,31,1,0,0,0,0.05,0,0,0,0,0,0,0.08,0",
        description: "Low KDPI donor, mostly normal glomeruli",
    },
];

pub const RESULTS_HEADER: &str =
    "file,base_size,cortex_size,normal_glom,abnormal_glom,c5,c6,c7,aif,c9,c10,c11,c12,c13,c14,isa,c16";

impl SampleFixture {
    pub fn entry(&self) -> NewImageEntry {
        NewImageEntry {
            file_id: self.file_id.to_string(),
            kdpi: self.kdpi,
            induction: self.induction.to_string(),
            age: self.age,
            pump: self.pump.to_string(),
            cit: self.cit,
            wedge: Some("n".to_string()),
        }
    }

    /// File name as the pipeline reports it.
    pub fn stem(&self) -> &'static str {
        self.file_id.split('.').next().unwrap_or(self.file_id)
    }
}

pub fn submit_request(user_id: &str, job_id: &str, start: bool) -> SubmitJobRequest {
    SubmitJobRequest {
        user_id: user_id.to_string(),
        job_id: job_id.to_string(),
        file_type: "svs".to_string(),
        skip_flag: "n".to_string(),
        entries: SAMPLES.iter().map(SampleFixture::entry).collect(),
        start,
    }
}

/// Pipeline results CSV covering every fixture sample.
pub fn results_csv() -> String {
    let mut csv = String::from(RESULTS_HEADER);
    for sample in SAMPLES {
        csv.push('\n');
        csv.push_str(sample.results_row);
    }
    csv.push('\n');
    csv
}
