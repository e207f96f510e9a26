use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Natural key for a job record: a (job_url, company_name) pair that is
/// unique and stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub job_url: String,
    pub company_name: String,
}

impl JobKey {
    pub fn new(job_url: impl Into<String>, company_name: impl Into<String>) -> Self {
        Self {
            job_url: job_url.into(),
            company_name: company_name.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {}", self.job_url, self.company_name)
    }
}

/// Categorical resume-to-job suitability. The rank gives the canonical total
/// order used for sorting and threshold comparisons; it is derived here and
/// nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitScore {
    QuestionableFit,
    VeryPoorFit,
    PoorFit,
    ModerateFit,
    GoodFit,
    VeryGoodFit,
}

impl FitScore {
    pub fn rank(self) -> i64 {
        match self {
            FitScore::VeryGoodFit => 5,
            FitScore::GoodFit => 4,
            FitScore::ModerateFit => 3,
            FitScore::PoorFit => 2,
            FitScore::VeryPoorFit => 1,
            FitScore::QuestionableFit => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FitScore::VeryGoodFit => "Very good fit",
            FitScore::GoodFit => "Good fit",
            FitScore::ModerateFit => "Moderate fit",
            FitScore::PoorFit => "Poor fit",
            FitScore::VeryPoorFit => "Very poor fit",
            FitScore::QuestionableFit => "Questionable fit",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Very good fit" => Some(FitScore::VeryGoodFit),
            "Good fit" => Some(FitScore::GoodFit),
            "Moderate fit" => Some(FitScore::ModerateFit),
            "Poor fit" => Some(FitScore::PoorFit),
            "Very poor fit" => Some(FitScore::VeryPoorFit),
            "Questionable fit" => Some(FitScore::QuestionableFit),
            _ => None,
        }
    }

    /// Scores hidden by the reviewer's default filter.
    pub fn is_poor_band(self) -> bool {
        matches!(
            self,
            FitScore::PoorFit | FitScore::VeryPoorFit | FitScore::QuestionableFit
        )
    }

    /// Anything that does not warrant tailored application artifacts.
    pub fn is_below_good(self) -> bool {
        !matches!(self, FitScore::GoodFit | FitScore::VeryGoodFit)
    }

    pub fn qualifies_for_artifacts(self) -> bool {
        matches!(self, FitScore::GoodFit | FitScore::VeryGoodFit)
    }
}

/// Rank for a possibly-unscored record. Unscored sorts with Questionable.
pub fn fit_rank(score: Option<FitScore>) -> i64 {
    score.map(FitScore::rank).unwrap_or(0)
}

/// One row of the job store. Content fields use the empty string as
/// "not yet fetched"; `Option` is reserved for genuinely tri-state or
/// absent-by-meaning values.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_url: String,
    pub company_name: String,
    pub job_title: String,
    pub location: String,
    pub location_priority: i64,
    pub job_description: String,
    pub company_overview: String,
    pub co_fetch_attempted: bool,
    pub jd_crawl_attempted: bool,
    pub sustainable: Option<bool>,
    pub sustainability_keyword_matches: String,
    pub fit_score: Option<FitScore>,
    pub fit_score_rank: i64,
    pub bulk_filtered: bool,
    pub job_analysis: String,
    pub tailored_resume_ref: String,
    pub tailored_resume_payload: String,
    pub tailored_cover_letter: String,
    pub resume_feedback: String,
    pub resume_feedback_addressed: bool,
    pub cl_feedback: String,
    pub cl_feedback_addressed: bool,
    pub applied: bool,
    pub bad_analysis: bool,
    pub expired: bool,
    pub last_expiration_check: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A freshly collected record: identity and location filled in, every
    /// enrichment field still empty.
    pub fn new_collected(
        job_url: impl Into<String>,
        company_name: impl Into<String>,
        job_title: impl Into<String>,
        location: impl Into<String>,
        location_priority: i64,
        job_description: impl Into<String>,
    ) -> Self {
        Self {
            job_url: job_url.into(),
            company_name: company_name.into(),
            job_title: job_title.into(),
            location: location.into(),
            location_priority,
            job_description: job_description.into(),
            company_overview: String::new(),
            co_fetch_attempted: false,
            jd_crawl_attempted: false,
            sustainable: None,
            sustainability_keyword_matches: String::new(),
            fit_score: None,
            fit_score_rank: 0,
            bulk_filtered: false,
            job_analysis: String::new(),
            tailored_resume_ref: String::new(),
            tailored_resume_payload: String::new(),
            tailored_cover_letter: String::new(),
            resume_feedback: String::new(),
            resume_feedback_addressed: false,
            cl_feedback: String::new(),
            cl_feedback_addressed: false,
            applied: false,
            bad_analysis: false,
            expired: false,
            last_expiration_check: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.job_url.clone(), self.company_name.clone())
    }

    /// Applied, user-flagged, or expired records take no further pipeline work.
    pub fn is_excluded(&self) -> bool {
        self.applied || self.bad_analysis || self.expired
    }

    /// Would this record be visible under the reviewer's default filter?
    /// Mirrors the dashboard default so the pipeline does not spend fetch
    /// budget on rows nobody will look at.
    pub fn passes_default_filter(&self, check_sustainability: bool) -> bool {
        if self.is_excluded() {
            return false;
        }
        if self.fit_score.is_some_and(FitScore::is_poor_band) {
            return false;
        }
        if check_sustainability && self.sustainable == Some(false) {
            return false;
        }
        true
    }
}

/// Normalized candidate item coming out of the listing provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateJob {
    pub job_title: String,
    pub company_name: String,
    pub job_url: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub job_description: String,
}

/// One entry from a bulk job-detail fetch. Matched back to records by
/// title/company since the provider does not echo our natural key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub title: String,
    pub company: String,
    pub description: String,
    #[serde(default)]
    pub company_overview: String,
}

/// Structured search parameters produced by the fit-analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub keywords: String,
    pub location: String,
    #[serde(default)]
    pub remote: bool,
}

/// A search intent: a raw search URL or a structured parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchIntent {
    Url(String),
    Params(SearchParams),
}

impl SearchIntent {
    pub fn describe(&self) -> String {
        match self {
            SearchIntent::Url(url) => url.clone(),
            SearchIntent::Params(p) => format!("{} in {}", p.keywords, p.location),
        }
    }
}

/// Outcome of a coarse bulk accept/reject pass.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkQualification {
    #[serde(default)]
    pub filtered_titles: Vec<String>,
    /// Newly discovered generalizable skip keywords, keyed by filter list name.
    #[serde(default)]
    pub new_skip_keywords: std::collections::HashMap<String, Vec<String>>,
}

/// Per-company sustainability classification result.
#[derive(Debug, Clone, Deserialize)]
pub struct SustainabilityVerdict {
    pub is_sustainable: Option<bool>,
    #[serde(default)]
    pub reasoning: String,
}

/// Company data handed to the sustainability classifier.
#[derive(Debug, Clone, Serialize)]
pub struct CompanyContext {
    pub company_name: String,
    pub company_overview: String,
    pub job_description: String,
}

/// Job fields passed as context to analysis and generation calls.
#[derive(Debug, Clone, Serialize)]
pub struct JobContext {
    pub company_name: String,
    pub job_title: String,
    pub job_description: String,
    pub location: String,
    pub company_overview: String,
}

impl JobContext {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            company_name: record.company_name.clone(),
            job_title: record.job_title.clone(),
            job_description: record.job_description.clone(),
            location: record.location.clone(),
            company_overview: record.company_overview.clone(),
        }
    }
}

/// A generated resume artifact: serialized content, a filename, and the
/// rendered binary payload.
#[derive(Debug, Clone)]
pub struct ResumeArtifact {
    pub resume_json: String,
    pub filename: String,
    pub pdf_bytes: Vec<u8>,
}

/// Result of fetching a single job description.
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptionOutcome {
    Fetched(String),
    Expired,
    Failed,
}
