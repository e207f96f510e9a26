use anyhow::{Context, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashMap;
use std::env;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ResumeProfile;
use crate::models::{
    BulkQualification, CandidateJob, CompanyContext, DescriptionOutcome, JobContext, JobDetail,
    ResumeArtifact, SearchIntent, SearchParams, SustainabilityVerdict,
};

// --- Error taxonomy ---

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Both credentials exhausted or the provider told us to slow down.
    /// Callers skip the operation and retry next cycle; never a hard failure.
    #[error("rate limited by provider")]
    RateLimited,
    #[error("provider unavailable")]
    Unavailable,
    #[error("request failed with status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ServiceError {
    /// Upstream hiccups worth one immediate retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Http {
                status: 502 | 503 | 504,
                ..
            }
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ServiceError::RateLimited)
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// --- Retry / throttle / availability primitives ---

/// One immediate retry after a short randomized delay, applied uniformly to
/// every client call site. Only transient conditions are retried; everything
/// else fails fast to the caller.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn run<T>(&self, mut op: impl FnMut() -> ServiceResult<T>) -> ServiceResult<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    attempt += 1;
                    let delay = random_duration(self.min_delay, self.max_delay);
                    debug!(error = %e, retry_in_ms = delay.as_millis() as u64, "Transient provider error, retrying");
                    thread::sleep(delay);
                }
                other => return other,
            }
        }
    }
}

/// Serializes calls to one logical provider: at least `min_interval` between
/// requests, sleeping a random fraction of the interval rather than a fixed
/// amount.
pub struct Pacer {
    min_interval: Duration,
    last_request: Cell<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Cell::new(None),
        }
    }

    pub fn wait(&self) {
        if let Some(last) = self.last_request.get() {
            if last.elapsed() < self.min_interval {
                thread::sleep(random_duration(self.min_interval / 2, self.min_interval));
            }
        }
        self.last_request.set(Some(Instant::now()));
    }
}

/// Provider-level circuit breaker. Once a hard quota error is observed the
/// provider is considered unavailable until the cooldown elapses, after which
/// a single retry attempt is allowed to re-validate.
pub struct ProviderGate {
    cooldown: Duration,
    available: Cell<bool>,
    failed_at: Cell<Option<Instant>>,
}

impl ProviderGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            available: Cell::new(true),
            failed_at: Cell::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        if !self.available.get() {
            if let Some(failed_at) = self.failed_at.get() {
                if failed_at.elapsed() > self.cooldown {
                    debug!("Provider cooldown elapsed, allowing retry");
                    self.available.set(true);
                    self.failed_at.set(None);
                }
            }
        }
        self.available.get()
    }

    pub fn mark_unavailable(&self) {
        self.available.set(false);
        self.failed_at.set(Some(Instant::now()));
    }

    pub fn reset(&self) {
        self.available.set(true);
        self.failed_at.set(None);
    }
}

fn random_duration(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

/// Randomized pause between sub-batches of a bulk operation.
pub fn pause_between_batches() {
    thread::sleep(random_duration(
        Duration::from_secs(2),
        Duration::from_secs(4),
    ));
}

// --- Collaborator traits ---

/// The bulk job-listing provider.
pub trait ListingProvider {
    fn is_available(&self) -> bool;
    /// May be empty when the provider is unavailable; that is not an error.
    fn search(&self, intent: &SearchIntent) -> Result<Vec<CandidateJob>>;
    fn fetch_overviews_bulk(&self, company_names: &[String]) -> Result<HashMap<String, String>>;
    fn fetch_descriptions_bulk(&self, job_ids: &[String]) -> Result<Vec<JobDetail>>;
}

/// The LLM-backed fit-analysis service.
pub trait FitAnalyst {
    fn analyze(&self, profile: &ResumeProfile, job: &JobContext) -> ServiceResult<String>;
    fn bulk_qualify(
        &self,
        jobs: &[(String, String)],
        profile: &ResumeProfile,
    ) -> ServiceResult<BulkQualification>;
    fn classify_sustainability_bulk(
        &self,
        companies: &[CompanyContext],
    ) -> ServiceResult<HashMap<String, SustainabilityVerdict>>;
    fn generate_search_parameters(&self, profile: &ResumeProfile)
        -> ServiceResult<Vec<SearchIntent>>;
}

/// The resume / cover-letter generation service.
pub trait ArtifactGenerator {
    fn generate_resume(
        &self,
        profile: &ResumeProfile,
        job: &JobContext,
        current: Option<&str>,
        feedback: Option<&str>,
    ) -> ServiceResult<ResumeArtifact>;
    fn generate_cover_letter(
        &self,
        profile: &ResumeProfile,
        job: &JobContext,
        current: Option<&str>,
        feedback: Option<&str>,
    ) -> ServiceResult<String>;
}

/// Per-job fallback path over public listing pages.
pub trait DetailFetcher {
    fn fetch_description(&self, job_url: &str) -> Result<DescriptionOutcome>;
    fn fetch_company_overview(&self, company_name: &str) -> Result<Option<String>>;
    /// Ok(None) means the check itself failed and nothing should be concluded.
    fn check_expired(&self, job_url: &str) -> Result<Option<bool>>;
}

// --- Fit-analysis / generation service client ---

pub struct AnalysisClient {
    base_url: String,
    api_key: String,
    primary_llm_key: String,
    backup_llm_key: Option<String>,
    client: reqwest::blocking::Client,
    pacer: Pacer,
    retry: RetryPolicy,
}

impl AnalysisClient {
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("ANALYSIS_SERVER_URL")
            .context("ANALYSIS_SERVER_URL environment variable not set")?;
        let api_key = env::var("ANALYSIS_API_KEY")
            .context("ANALYSIS_API_KEY environment variable not set")?;
        let primary_llm_key =
            env::var("FIT_API_KEY").context("FIT_API_KEY environment variable not set")?;
        let backup_llm_key = env::var("BACKUP_FIT_API_KEY").ok().filter(|k| !k.is_empty());
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url,
            api_key,
            primary_llm_key,
            backup_llm_key,
            client,
            pacer: Pacer::new(Duration::from_secs(1)),
            retry: RetryPolicy::default(),
        })
    }

    /// Primary credential first; on a definitive rate-limit signal the backup
    /// is tried once. Both rate-limited means "skip, try later".
    fn post_with_fallback<'s, B: Serialize, R: DeserializeOwned>(
        &'s self,
        path: &str,
        build_payload: impl Fn(&'s str) -> B,
    ) -> ServiceResult<R> {
        let mut credentials = vec![self.primary_llm_key.as_str()];
        if let Some(backup) = &self.backup_llm_key {
            credentials.push(backup.as_str());
        }
        let last = credentials.len() - 1;
        for (i, llm_key) in credentials.into_iter().enumerate() {
            let payload = build_payload(llm_key);
            self.pacer.wait();
            match self.retry.run(|| self.post_once(path, &payload)) {
                Err(ServiceError::RateLimited) if i < last => {
                    warn!(path, "Rate limit hit on primary credential, trying backup");
                }
                other => return other,
            }
        }
        Err(ServiceError::RateLimited)
    }

    fn post_once<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        payload: &B,
    ) -> ServiceResult<R> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(payload)
            .send()?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ServiceError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ServiceError::Http {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<R>()
            .map_err(|e| ServiceError::Malformed(e.to_string()))
    }

    fn fetch_bytes(&self, url: &str) -> ServiceResult<Vec<u8>> {
        let response = self.client.get(url).header("x-api-key", &self.api_key).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Http {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        Ok(response.bytes()?.to_vec())
    }
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    job_posting_text: &'a str,
    job_context: &'a JobContext,
    resume_json: &'a serde_json::Value,
    llm_api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    job_analysis: String,
}

#[derive(Debug, Serialize)]
struct QualifyJob<'a> {
    title: &'a str,
    company: &'a str,
}

#[derive(Debug, Serialize)]
struct BulkQualifyRequest<'a> {
    jobs: Vec<QualifyJob<'a>>,
    resume_json: &'a serde_json::Value,
    llm_api_key: &'a str,
}

#[derive(Debug, Serialize)]
struct SustainabilityRequest<'a> {
    companies: &'a [CompanyContext],
    llm_api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct SustainabilityResponse {
    results: HashMap<String, SustainabilityVerdict>,
}

#[derive(Debug, Serialize)]
struct SearchParametersRequest<'a> {
    resume_json: &'a serde_json::Value,
    llm_api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct SearchParametersResponse {
    search_parameters: Vec<SearchParams>,
}

#[derive(Debug, Serialize)]
struct TailorResumeRequest<'a> {
    job_posting_text: &'a str,
    job_context: &'a JobContext,
    resume_json: &'a serde_json::Value,
    filename: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_resume_data: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_feedback: Option<&'a str>,
    llm_api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct TailorResumeResponse {
    tailored_resume_json: serde_json::Value,
    pdf_url: String,
}

#[derive(Debug, Serialize)]
struct CoverLetterRequest<'a> {
    job_posting_text: &'a str,
    job_context: &'a JobContext,
    resume_json: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_feedback: Option<&'a str>,
    llm_api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct CoverLetterResponse {
    cover_letter: String,
}

impl FitAnalyst for AnalysisClient {
    fn analyze(&self, profile: &ResumeProfile, job: &JobContext) -> ServiceResult<String> {
        let response: AnalyzeResponse =
            self.post_with_fallback("analyze-job-posting", |llm_api_key| AnalyzeRequest {
                job_posting_text: &job.job_description,
                job_context: job,
                resume_json: profile.json(),
                llm_api_key,
            })?;
        Ok(response.job_analysis)
    }

    fn bulk_qualify(
        &self,
        jobs: &[(String, String)],
        profile: &ResumeProfile,
    ) -> ServiceResult<BulkQualification> {
        self.post_with_fallback("bulk-qualify", |llm_api_key| BulkQualifyRequest {
            jobs: jobs
                .iter()
                .map(|(title, company)| QualifyJob { title, company })
                .collect(),
            resume_json: profile.json(),
            llm_api_key,
        })
    }

    fn classify_sustainability_bulk(
        &self,
        companies: &[CompanyContext],
    ) -> ServiceResult<HashMap<String, SustainabilityVerdict>> {
        let response: SustainabilityResponse =
            self.post_with_fallback("classify-sustainability", |llm_api_key| {
                SustainabilityRequest {
                    companies,
                    llm_api_key,
                }
            })?;
        Ok(response.results)
    }

    fn generate_search_parameters(
        &self,
        profile: &ResumeProfile,
    ) -> ServiceResult<Vec<SearchIntent>> {
        let response: SearchParametersResponse =
            self.post_with_fallback("search-parameters", |llm_api_key| SearchParametersRequest {
                resume_json: profile.json(),
                llm_api_key,
            })?;
        Ok(response
            .search_parameters
            .into_iter()
            .map(SearchIntent::Params)
            .collect())
    }
}

impl ArtifactGenerator for AnalysisClient {
    fn generate_resume(
        &self,
        profile: &ResumeProfile,
        job: &JobContext,
        current: Option<&str>,
        feedback: Option<&str>,
    ) -> ServiceResult<ResumeArtifact> {
        let filename = format!(
            "{}_resume_{}.pdf",
            profile.full_name.replace(' ', "_"),
            job.company_name.replace(' ', "_")
        );
        let response: TailorResumeResponse =
            self.post_with_fallback("tailor-resume", |llm_api_key| TailorResumeRequest {
                job_posting_text: &job.job_description,
                job_context: job,
                resume_json: profile.json(),
                filename: &filename,
                current_resume_data: current,
                retry_feedback: feedback,
                llm_api_key,
            })?;
        let pdf_bytes = self.fetch_bytes(&response.pdf_url)?;
        let resume_json = serde_json::to_string(&response.tailored_resume_json)
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;
        Ok(ResumeArtifact {
            resume_json,
            filename,
            pdf_bytes,
        })
    }

    fn generate_cover_letter(
        &self,
        profile: &ResumeProfile,
        job: &JobContext,
        current: Option<&str>,
        feedback: Option<&str>,
    ) -> ServiceResult<String> {
        let response: CoverLetterResponse =
            self.post_with_fallback("tailor-cover-letter", |llm_api_key| CoverLetterRequest {
                job_posting_text: &job.job_description,
                job_context: job,
                resume_json: profile.json(),
                current_content: current,
                retry_feedback: feedback,
                llm_api_key,
            })?;
        Ok(response.cover_letter)
    }
}

// --- Bulk listing provider client ---

const LISTING_COOLDOWN: Duration = Duration::from_secs(3600);
const HARD_LIMIT_MARKER: &str = "usage hard limit";

pub struct ListingClient {
    base_url: Option<String>,
    token: Option<String>,
    client: reqwest::blocking::Client,
    gate: ProviderGate,
    pacer: Pacer,
    retry: RetryPolicy,
}

impl ListingClient {
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("LISTING_API_URL").ok().filter(|v| !v.is_empty());
        let token = env::var("LISTING_API_TOKEN").ok().filter(|v| !v.is_empty());
        if base_url.is_none() || token.is_none() {
            warn!("Listing provider not configured (LISTING_API_URL / LISTING_API_TOKEN); bulk operations disabled");
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url,
            token,
            client,
            gate: ProviderGate::new(LISTING_COOLDOWN),
            pacer: Pacer::new(Duration::from_secs(1)),
            retry: RetryPolicy::default(),
        })
    }

    fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, payload: &B) -> ServiceResult<R> {
        let (Some(base_url), Some(token)) = (&self.base_url, &self.token) else {
            return Err(ServiceError::Unavailable);
        };
        self.pacer.wait();
        self.retry.run(|| {
            let url = format!("{}/{}", base_url.trim_end_matches('/'), path);
            let response = self.client.post(&url).bearer_auth(token).json(payload).send()?;
            let status = response.status();
            if status.as_u16() == 429 {
                return Err(ServiceError::RateLimited);
            }
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(ServiceError::Http {
                    status: status.as_u16(),
                    body,
                });
            }
            response
                .json::<R>()
                .map_err(|e| ServiceError::Malformed(e.to_string()))
        })
    }

    /// Inspect a failure for the monthly hard-limit signal and flip the
    /// availability gate when seen. Returns None for conditions that should
    /// yield an empty result rather than an error.
    fn absorb_failure(&self, operation: &str, error: ServiceError) -> Option<ServiceError> {
        if error.is_rate_limit() {
            warn!(operation, "Listing provider rate limited, skipping operation");
            return None;
        }
        let hard_limit = matches!(
            &error,
            ServiceError::Http { status, body }
                if *status == 402 || body.to_lowercase().contains(HARD_LIMIT_MARKER)
        );
        if hard_limit {
            warn!(operation, "Listing provider hard quota reached, disabling for cooldown");
            self.gate.mark_unavailable();
            return None;
        }
        Some(error)
    }
}

#[derive(Debug, Serialize)]
struct ListingSearchRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    search_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a SearchParams>,
}

#[derive(Debug, Deserialize)]
struct RawListingItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    company: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ListingSearchResponse {
    items: Vec<RawListingItem>,
}

#[derive(Debug, Serialize)]
struct CompanyOverviewsRequest<'a> {
    identifiers: &'a [String],
}

#[derive(Debug, Deserialize)]
struct CompanyOverviewsResponse {
    overviews: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct JobDetailsRequest<'a> {
    job_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RawJobDetail {
    #[serde(default)]
    title: String,
    #[serde(default)]
    company: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    company_description: String,
}

#[derive(Debug, Deserialize)]
struct JobDetailsResponse {
    jobs: Vec<RawJobDetail>,
}

impl ListingProvider for ListingClient {
    fn is_available(&self) -> bool {
        self.base_url.is_some() && self.token.is_some() && self.gate.is_available()
    }

    fn search(&self, intent: &SearchIntent) -> Result<Vec<CandidateJob>> {
        if !self.is_available() {
            debug!("Listing provider unavailable, returning no candidates");
            return Ok(Vec::new());
        }
        let request = match intent {
            SearchIntent::Url(url) => ListingSearchRequest {
                search_url: Some(url),
                params: None,
            },
            SearchIntent::Params(params) => ListingSearchRequest {
                search_url: None,
                params: Some(params),
            },
        };
        let response: ListingSearchResponse = match self.post("search", &request) {
            Ok(response) => response,
            Err(e) => {
                return match self.absorb_failure("search", e) {
                    None => Ok(Vec::new()),
                    Some(e) => Err(e.into()),
                };
            }
        };

        let mut candidates = Vec::new();
        for item in response.items {
            // A single malformed item is skipped, not fatal for the batch.
            if item.title.trim().is_empty()
                || item.company.trim().is_empty()
                || item.url.trim().is_empty()
            {
                debug!(?item, "Skipping malformed listing item");
                continue;
            }
            candidates.push(CandidateJob {
                job_title: item.title,
                company_name: item.company.trim().to_string(),
                job_url: item.url.trim().to_string(),
                location: item.location,
                job_description: item.description,
            });
        }
        Ok(candidates)
    }

    fn fetch_overviews_bulk(&self, company_names: &[String]) -> Result<HashMap<String, String>> {
        if !self.is_available() || company_names.is_empty() {
            return Ok(HashMap::new());
        }
        let request = CompanyOverviewsRequest {
            identifiers: company_names,
        };
        match self.post::<_, CompanyOverviewsResponse>("company-overviews", &request) {
            Ok(response) => Ok(response.overviews),
            Err(e) => match self.absorb_failure("company-overviews", e) {
                None => Ok(HashMap::new()),
                Some(e) => Err(e.into()),
            },
        }
    }

    fn fetch_descriptions_bulk(&self, job_ids: &[String]) -> Result<Vec<JobDetail>> {
        if !self.is_available() || job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = JobDetailsRequest { job_ids };
        match self.post::<_, JobDetailsResponse>("job-details", &request) {
            Ok(response) => Ok(response
                .jobs
                .into_iter()
                .map(|raw| JobDetail {
                    title: raw.title,
                    company: raw.company,
                    description: raw.description,
                    company_overview: raw.company_description,
                })
                .collect()),
            Err(e) => match self.absorb_failure("job-details", e) {
                None => Ok(Vec::new()),
                Some(e) => Err(e.into()),
            },
        }
    }
}

// --- Public-page crawl client (per-job fallback path) ---

const DEFAULT_CRAWL_BASE: &str = "https://www.linkedin.com";
const EXPIRED_MARKERS: [&str; 2] = [
    "No longer accepting applications",
    "This job is no longer available",
];

const DESCRIPTION_SELECTORS: [&str; 4] = [
    ".show-more-less-html__markup",
    ".description__text",
    ".jobs-description__content",
    "#job-details",
];

const OVERVIEW_SELECTORS: [&str; 2] = ["p.about-us__description", "section.about-us p"];

pub struct CrawlClient {
    base_url: String,
    client: reqwest::blocking::Client,
    min_delay: Duration,
    max_delay: Duration,
    last_request: Cell<Option<Instant>>,
}

impl CrawlClient {
    pub fn from_env() -> Result<Self> {
        let base_url =
            env::var("CRAWL_BASE_URL").unwrap_or_else(|_| DEFAULT_CRAWL_BASE.to_string());
        let user_agent = env::var("CRAWL_USER_AGENT").unwrap_or_else(|_| {
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36"
                .to_string()
        });
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url,
            client,
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(10),
            last_request: Cell::new(None),
        })
    }

    fn pace(&self) {
        if self.last_request.get().is_some() {
            thread::sleep(random_duration(self.min_delay, self.max_delay));
        }
        self.last_request.set(Some(Instant::now()));
    }

    fn get_page(&self, url: &str) -> Result<Option<(u16, String)>> {
        self.pace();
        match self.client.get(url).send() {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().unwrap_or_default();
                Ok(Some((status, body)))
            }
            Err(e) => {
                debug!(url, error = %e, "Crawl request failed");
                Ok(None)
            }
        }
    }

    fn company_slug(company_name: &str) -> String {
        company_name
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }

    fn select_text(html: &scraper::Html, selectors: &[&str]) -> Option<String> {
        for selector in selectors {
            let Ok(parsed) = scraper::Selector::parse(selector) else {
                continue;
            };
            if let Some(element) = html.select(&parsed).next() {
                let text: String = element.text().collect::<Vec<_>>().join("\n");
                let text = text.trim().to_string();
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
        None
    }
}

impl DetailFetcher for CrawlClient {
    fn fetch_description(&self, job_url: &str) -> Result<DescriptionOutcome> {
        let Some((status, body)) = self.get_page(job_url)? else {
            return Ok(DescriptionOutcome::Failed);
        };
        if status == 404 || status == 410 {
            return Ok(DescriptionOutcome::Expired);
        }
        if status >= 400 {
            return Ok(DescriptionOutcome::Failed);
        }
        if EXPIRED_MARKERS.iter().any(|marker| body.contains(marker)) {
            return Ok(DescriptionOutcome::Expired);
        }
        let html = scraper::Html::parse_document(&body);
        match Self::select_text(&html, &DESCRIPTION_SELECTORS) {
            Some(text) => Ok(DescriptionOutcome::Fetched(text)),
            None => Ok(DescriptionOutcome::Failed),
        }
    }

    fn fetch_company_overview(&self, company_name: &str) -> Result<Option<String>> {
        let slug = Self::company_slug(company_name);
        if slug.is_empty() {
            return Ok(None);
        }
        let url = format!("{}/company/{}/about", self.base_url.trim_end_matches('/'), slug);
        let Some((status, body)) = self.get_page(&url)? else {
            return Ok(None);
        };
        if status >= 400 {
            return Ok(None);
        }
        let html = scraper::Html::parse_document(&body);
        Ok(Self::select_text(&html, &OVERVIEW_SELECTORS))
    }

    fn check_expired(&self, job_url: &str) -> Result<Option<bool>> {
        let Some((status, body)) = self.get_page(job_url)? else {
            return Ok(None);
        };
        if status == 404 || status == 410 {
            return Ok(Some(true));
        }
        if status >= 400 {
            return Ok(None);
        }
        Ok(Some(
            EXPIRED_MARKERS.iter().any(|marker| body.contains(marker)),
        ))
    }
}
