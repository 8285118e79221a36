//! Kidney Donor Quality Score (KDQS) and graft-loss risk models.
//!
//! Four ordinal buckets (glomerulosclerosis, arterial intimal fibrosis,
//! interstitial space abnormality, KDPI) sum to the 0-8 KDQS. The KDQS then
//! feeds two fixed logistic-regression models predicting 1-year and 4-year
//! graft loss.
//!
//! Reference: Yi, Z., et al., Kidney International, 2023.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ── Bucket thresholds ────────────────────────────────────────────────
const GS_LOW: f64 = 0.03;
const GS_HIGH: f64 = 0.09;
const AIF_LOW: f64 = 0.11;
const AIF_HIGH: f64 = 0.39;
const ISA_LOW: f64 = 0.10;
const ISA_HIGH: f64 = 0.39;
const KDPI_LOW: f64 = 0.50;
const KDPI_HIGH: f64 = 0.76;

/// KDQS at or above this value discards the organ outright.
const DISCARD_KDQS: u8 = 7;

// ── 1-year model ─────────────────────────────────────────────────────
const Y1_INTERCEPT: f64 = -1.22;
const Y1_CIT: f64 = 0.03;
const Y1_PUMP: f64 = -1.56;
const Y1_LYMDEP: f64 = -2.70;
const Y1_LND: f64 = -2.09;
const Y1_KDQS: f64 = 0.37;
const Y1_DISCARD_RISK: f64 = 0.55;

// ── 4-year model ─────────────────────────────────────────────────────
const Y4_INTERCEPT: f64 = 0.12;
const Y4_CIT: f64 = 0.02;
const Y4_AGE: f64 = -0.04;
const Y4_LYMDEP: f64 = -1.76;
const Y4_LND: f64 = -1.88;
const Y4_KDQS: f64 = 0.40;
const Y4_HIGH_RISK: f64 = 0.11;

/// Induction therapy given to the recipient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
pub enum InductionType {
    #[default]
    #[strum(serialize = "None")]
    #[serde(rename = "None")]
    NoInduction,
    /// Lymphocyte-depleting.
    #[strum(serialize = "LymDep")]
    #[serde(rename = "LymDep")]
    LymphocyteDepleting,
    /// Lymphocyte-non-depleting.
    #[strum(serialize = "LND")]
    #[serde(rename = "LND")]
    LymphocyteNonDepleting,
}

impl InductionType {
    /// Unknown values score as no induction.
    pub fn parse_lenient(raw: &str) -> Self {
        Self::from_str(raw.trim()).unwrap_or_default()
    }

    fn one_year_coefficient(self) -> f64 {
        match self {
            Self::NoInduction => 0.0,
            Self::LymphocyteDepleting => Y1_LYMDEP,
            Self::LymphocyteNonDepleting => Y1_LND,
        }
    }

    fn four_year_coefficient(self) -> f64 {
        match self {
            Self::NoInduction => 0.0,
            Self::LymphocyteDepleting => Y4_LYMDEP,
            Self::LymphocyteNonDepleting => Y4_LND,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum AllocationRecommendation {
    #[strum(serialize = "Proceed to Allocation")]
    #[serde(rename = "Proceed to Allocation")]
    ProceedToAllocation,
    #[strum(serialize = "Discard Immediately")]
    #[serde(rename = "Discard Immediately")]
    DiscardImmediately,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum TransplantRecommendation {
    #[strum(serialize = "Proceed to Transplant")]
    #[serde(rename = "Proceed to Transplant")]
    ProceedToTransplant,
    #[strum(serialize = "Discard")]
    #[serde(rename = "Discard")]
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum RiskLevel {
    High,
    Low,
}

/// Pipeline-measured morphometry for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleMeasurements {
    pub normal_glomeruli: f64,
    pub abnormal_glomeruli: f64,
    /// Arterial intimal fibrosis, fraction 0-1.
    pub aif: f64,
    /// Interstitial space abnormality, fraction 0-1.
    pub isa: f64,
}

impl SampleMeasurements {
    /// Fraction of sclerotic glomeruli; `None` when no glomeruli were found.
    pub fn sclerosis_ratio(&self) -> Option<f64> {
        let total = self.normal_glomeruli + self.abnormal_glomeruli;
        (total > 0.0).then(|| self.abnormal_glomeruli / total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClinicalCovariates {
    pub kdpi: f64,
    pub induction: InductionType,
    pub pumped: bool,
    pub cold_ischemia_hours: f64,
    pub recipient_age: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub sclerosis_bucket: u8,
    pub aif_bucket: u8,
    pub isa_bucket: u8,
    pub kdpi_bucket: u8,
    pub kdqs: Option<u8>,
    pub allocation: Option<AllocationRecommendation>,
    pub year_1_risk: Option<f64>,
    pub year_1_recommendation: Option<TransplantRecommendation>,
    pub year_4_risk: Option<f64>,
    pub year_4_recommendation: Option<RiskLevel>,
}

fn ordinal(value: f64, low: f64, high: f64) -> u8 {
    if value <= low {
        0
    } else if value > high {
        2
    } else {
        1
    }
}

/// A missing ratio (no glomeruli) lands in the middle bucket.
pub fn sclerosis_bucket(ratio: Option<f64>) -> u8 {
    ratio.map_or(1, |r| ordinal(r, GS_LOW, GS_HIGH))
}

pub fn aif_bucket(aif: f64) -> u8 {
    ordinal(aif, AIF_LOW, AIF_HIGH)
}

pub fn isa_bucket(isa: f64) -> u8 {
    ordinal(isa, ISA_LOW, ISA_HIGH)
}

pub fn kdpi_bucket(kdpi: f64) -> u8 {
    ordinal(kdpi, KDPI_LOW, KDPI_HIGH)
}

fn logistic(logit: f64) -> f64 {
    1.0 / (1.0 + (-logit).exp())
}

/// Round to two decimals, the precision risks are reported and compared at.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn one_year_risk(kdqs: u8, covariates: &ClinicalCovariates) -> f64 {
    let pump = if covariates.pumped { Y1_PUMP } else { 0.0 };
    let logit = Y1_INTERCEPT
        + Y1_CIT * covariates.cold_ischemia_hours
        + pump
        + covariates.induction.one_year_coefficient()
        + Y1_KDQS * f64::from(kdqs);
    round2(logistic(logit))
}

pub fn four_year_risk(kdqs: u8, covariates: &ClinicalCovariates) -> f64 {
    let logit = Y4_INTERCEPT
        + Y4_CIT * covariates.cold_ischemia_hours
        + Y4_AGE * covariates.recipient_age
        + covariates.induction.four_year_coefficient()
        + Y4_KDQS * f64::from(kdqs);
    round2(logistic(logit))
}

/// Score one sample.
///
/// An interstitial abnormality of exactly zero marks an unreadable sample:
/// every derived field is `None`, only the individual buckets remain.
pub fn score_sample(measurements: &SampleMeasurements, covariates: &ClinicalCovariates) -> ScoreCard {
    let sclerosis_bucket = sclerosis_bucket(measurements.sclerosis_ratio());
    let aif_bucket = aif_bucket(measurements.aif);
    let isa_bucket = isa_bucket(measurements.isa);
    let kdpi_bucket = kdpi_bucket(covariates.kdpi);

    let mut card = ScoreCard {
        sclerosis_bucket,
        aif_bucket,
        isa_bucket,
        kdpi_bucket,
        kdqs: None,
        allocation: None,
        year_1_risk: None,
        year_1_recommendation: None,
        year_4_risk: None,
        year_4_recommendation: None,
    };

    if measurements.isa == 0.0 {
        return card;
    }

    let kdqs = sclerosis_bucket + aif_bucket + isa_bucket + kdpi_bucket;
    let y1 = one_year_risk(kdqs, covariates);
    let y4 = four_year_risk(kdqs, covariates);

    card.kdqs = Some(kdqs);
    card.allocation = Some(if kdqs < DISCARD_KDQS {
        AllocationRecommendation::ProceedToAllocation
    } else {
        AllocationRecommendation::DiscardImmediately
    });
    card.year_1_risk = Some(y1);
    card.year_1_recommendation = Some(if y1 >= Y1_DISCARD_RISK {
        TransplantRecommendation::Discard
    } else {
        TransplantRecommendation::ProceedToTransplant
    });
    card.year_4_risk = Some(y4);
    card.year_4_recommendation = Some(if y4 >= Y4_HIGH_RISK {
        RiskLevel::High
    } else {
        RiskLevel::Low
    });
    card
}
