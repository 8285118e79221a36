//! HTML pathology report, attached to the notification mail and offered for
//! download once a job completes.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::services::codec;
use crate::services::results::ScoredImage;

const STYLE: &str = r#"
    table { font-family: Arial, sans-serif; border-collapse: collapse; width: 100%; }
    td, th { border: 1px solid #dddddd; text-align: left; padding: 8px; }
    tr:nth-child(even) { background-color: #f2f2f2; }
"#;

const COLUMNS: [&str; 9] = [
    "File Name",
    "GS%",
    "AIF%",
    "IF%",
    "KDQS",
    "1-year Risk Score",
    "1-year Recommendation",
    "4-year Risk Score",
    "4-year Recommendation",
];

const EXPLANATION: &str = "\
<p><strong>Percentage of sclerotic glomeruli</strong><br>\n\
The percentage of sclerotic glomeruli (GS%) was calculated as the number of sclerotic glomeruli divided by total number of glomeruli.</p>\n\
<p><strong>Percentage of arterial intimal fibrosis</strong><br>\n\
The percentage of arterial intimal fibrosis (AIF%) was determined by averaging the arithmetic mean and the weighted mean (adjusted for artery sizes) of arterial intimal fibrosis percentages observed in the top three severely affected arteries.</p>\n\
<p><strong>Percentage of interstitial space abnormality</strong><br>\n\
The percentage of interstitial space abnormality (IF%) was calculated as the area of enlarged interstitial space divided by the area of total interstitial space within glomeruli enriched regions (cortex sections).</p>\n\
<p><strong>Kidney Donor Quality Score</strong><br>\n\
A composite score incorporating KDPI, GS%, AIF%, IF% reflects the overall quality of donor kidney.</p>\n\
<p><strong>1-year and 4-year Risk Score</strong><br>\n\
The probability scores from logistic regression model by including Cold Ischemia Time, Induction Type, Kidney Donor Quality Score, Use of Pump (Only in 1-year model), and Recipient Age (Only in 4-year model).</p>\n";

const CITATION: &str = "<p>Yi, Z., et al., <em><a href=\"https://pubmed.ncbi.nlm.nih.gov/37923131/\">\
A large-scale retrospective study enabled deep-learning based pathological assessment of frozen procurement kidney \
biopsies to predict graft loss and guide organ utilization.</a></em> Kidney International, 2023.</p>\n";

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn number(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_default()
}

fn text<T: ToString>(value: Option<T>) -> String {
    value.map(|v| escape(&v.to_string())).unwrap_or_default()
}

fn row_cells(row: &ScoredImage) -> [String; 9] {
    let card = row.card.as_ref();
    [
        escape(&row.file),
        number(row.sclerosis),
        number(Some(row.aif)),
        number(Some(row.isa)),
        text(card.and_then(|c| c.kdqs)),
        number(card.and_then(|c| c.year_1_risk)),
        text(card.and_then(|c| c.year_1_recommendation)),
        number(card.and_then(|c| c.year_4_risk)),
        text(card.and_then(|c| c.year_4_recommendation)),
    ]
}

/// Render the report document for a job's scored images.
pub fn render(rows: &[ScoredImage], app_url: &str) -> String {
    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<style>{STYLE}</style>\n</head>\n<body>\n"
    );
    html.push_str("<h2>PATHOLOGY REPORT</h2>\n");
    let _ = writeln!(html, "<p><a href=\"{}\">Link to Webpage</a></p>", escape(app_url));

    html.push_str("<table>\n<tr>");
    for column in COLUMNS {
        let _ = write!(html, "<th>{column}</th>");
    }
    html.push_str("</tr>\n");

    for row in rows {
        html.push_str("<tr>");
        for cell in row_cells(row) {
            let _ = write!(html, "<td>{cell}</td>");
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</table>\n");

    html.push_str(EXPLANATION);
    html.push_str(CITATION);
    html.push_str("</body>\n</html>\n");
    html
}

/// Write the report into `dir` under the job's report file name.
pub fn write_report(
    dir: &Path,
    user_id: &str,
    job_id: &str,
    rows: &[ScoredImage],
    app_url: &str,
) -> Result<PathBuf, ReportError> {
    let path = dir.join(codec::report_file_name(user_id, job_id));
    std::fs::write(&path, render(rows, app_url))?;
    Ok(path)
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),
}
