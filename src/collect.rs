use anyhow::Result;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::clients::{FitAnalyst, ListingProvider};
use crate::config::{FilterConfig, FilterStore, ResumeProfile};
use crate::cycle::{CycleContext, ShutdownFlag};
use crate::db::Database;
use crate::filters;
use crate::models::{CandidateJob, JobKey, JobRecord, SearchIntent};

/// Pull candidate jobs for every configured search intent, screen them, and
/// insert the survivors. Returns the natural keys of newly inserted records so
/// downstream stages can scope their work to just-collected jobs.
///
/// With no cached search parameters (or a full pass that found nothing new),
/// a fresh parameter set is requested from the analysis service and persisted
/// for reuse, keeping an otherwise idle pipeline self-seeding.
pub fn run_collection(
    db: &Database,
    listing: &dyn ListingProvider,
    analyst: &dyn FitAnalyst,
    filter_store: &FilterStore,
    profile: &ResumeProfile,
    ctx: &mut CycleContext,
    shutdown: &ShutdownFlag,
) -> Result<Vec<JobKey>> {
    let mut config = filter_store.load();
    let mut collected = Vec::new();

    let cached_intents = config.search_parameters.clone();
    if !cached_intents.is_empty() {
        info!(parameter_sets = cached_intents.len(), "Collecting with cached search parameters");
        for intent in &cached_intents {
            if shutdown.requested() {
                return Ok(collected);
            }
            let new_keys = collect_from_intent(db, listing, &config, intent)?;
            if !new_keys.is_empty() {
                info!(count = new_keys.len(), search = %intent.describe(), "Collected new jobs");
            }
            collected.extend(new_keys);
        }
    }

    if (cached_intents.is_empty() || collected.is_empty())
        && listing.is_available()
        && !shutdown.requested()
    {
        if cached_intents.is_empty() {
            info!("No cached search parameters found, generating from resume");
        } else {
            info!("No new jobs from cached search parameters, regenerating");
        }
        match analyst.generate_search_parameters(profile) {
            Ok(intents) if !intents.is_empty() => {
                info!(parameter_sets = intents.len(), "Generated new search parameters");
                config.search_parameters = intents.clone();
                if let Err(e) = filter_store.save(&config) {
                    warn!(error = %e, "Could not persist generated search parameters");
                }
                for intent in &intents {
                    if shutdown.requested() {
                        break;
                    }
                    let new_keys = collect_from_intent(db, listing, &config, intent)?;
                    if !new_keys.is_empty() {
                        info!(count = new_keys.len(), search = %intent.describe(), "Collected new jobs");
                    }
                    collected.extend(new_keys);
                }
            }
            Ok(_) => warn!("Search parameter generation returned an empty set"),
            Err(e) if e.is_rate_limit() => {
                ctx.rate_limit_hit = true;
                warn!("Rate limited while generating search parameters, skipping");
            }
            Err(e) => warn!(error = %e, "Could not generate search parameters"),
        }
    }

    Ok(collected)
}

fn collect_from_intent(
    db: &Database,
    listing: &dyn ListingProvider,
    config: &FilterConfig,
    intent: &SearchIntent,
) -> Result<Vec<JobKey>> {
    let candidates = match listing.search(intent) {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(search = %intent.describe(), error = %e, "Listing search failed");
            return Ok(Vec::new());
        }
    };
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut seen: HashSet<JobKey> = db.get_all()?.iter().map(|r| r.key()).collect();
    let mut new_records = Vec::new();
    for candidate in &candidates {
        let Some(record) = screen_candidate(candidate, config) else {
            continue;
        };
        let key = record.key();
        if !seen.insert(key) {
            continue;
        }
        new_records.push(record);
    }

    db.insert_new_records(&new_records)
}

/// Normalize and screen one candidate item. Returns the record to insert, or
/// None when the item is malformed or a keyword filter disqualifies it.
fn screen_candidate(candidate: &CandidateJob, config: &FilterConfig) -> Option<JobRecord> {
    let job_title = filters::normalize_job_title(&candidate.job_title);
    let company_name = candidate.company_name.trim();
    let job_url = candidate.job_url.trim();
    if job_title.is_empty() || company_name.is_empty() || job_url.is_empty() {
        debug!(url = %candidate.job_url, "Skipping malformed candidate item");
        return None;
    }

    if let Some(reason) =
        filters::apply_keyword_filters(&job_title, company_name, &candidate.location, config)
    {
        debug!(title = %job_title, company = %company_name, reason, "Skipping candidate");
        return None;
    }
    // No overview is available yet; the screen runs on identity fields only.
    let screen = filters::apply_sustainability_keyword_filters(
        &job_title,
        company_name,
        &candidate.location,
        "",
        config,
    );
    if screen.skip {
        debug!(title = %job_title, company = %company_name, "Skipping candidate on sustainability keywords");
        return None;
    }

    let location = filters::parse_location(&candidate.location);
    let location_priority = filters::location_priority(&location, config);
    Some(JobRecord::new_collected(
        job_url,
        company_name,
        job_title,
        location,
        location_priority,
        candidate.job_description.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ServiceError, ServiceResult};
    use crate::models::{
        BulkQualification, CompanyContext, JobContext, JobDetail, SearchParams,
        SustainabilityVerdict,
    };
    use std::cell::Cell;
    use std::collections::HashMap;

    struct StubListing {
        available: bool,
        candidates: Vec<CandidateJob>,
    }

    impl ListingProvider for StubListing {
        fn is_available(&self) -> bool {
            self.available
        }
        fn search(&self, _intent: &SearchIntent) -> Result<Vec<CandidateJob>> {
            Ok(self.candidates.clone())
        }
        fn fetch_overviews_bulk(&self, _: &[String]) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        fn fetch_descriptions_bulk(&self, _: &[String]) -> Result<Vec<JobDetail>> {
            Ok(Vec::new())
        }
    }

    struct StubAnalyst {
        intents: ServiceResult<Vec<SearchIntent>>,
        calls: Cell<usize>,
    }

    impl StubAnalyst {
        fn with_params(params: Vec<SearchParams>) -> Self {
            Self {
                intents: Ok(params.into_iter().map(SearchIntent::Params).collect()),
                calls: Cell::new(0),
            }
        }

        fn rate_limited() -> Self {
            Self {
                intents: Err(ServiceError::RateLimited),
                calls: Cell::new(0),
            }
        }
    }

    impl FitAnalyst for StubAnalyst {
        fn analyze(&self, _: &ResumeProfile, _: &JobContext) -> ServiceResult<String> {
            panic!("collection must not analyze jobs")
        }
        fn bulk_qualify(
            &self,
            _: &[(String, String)],
            _: &ResumeProfile,
        ) -> ServiceResult<BulkQualification> {
            panic!("collection must not bulk qualify")
        }
        fn classify_sustainability_bulk(
            &self,
            _: &[CompanyContext],
        ) -> ServiceResult<HashMap<String, SustainabilityVerdict>> {
            panic!("collection must not classify sustainability")
        }
        fn generate_search_parameters(
            &self,
            _: &ResumeProfile,
        ) -> ServiceResult<Vec<SearchIntent>> {
            self.calls.set(self.calls.get() + 1);
            match &self.intents {
                Ok(intents) => Ok(intents.clone()),
                Err(ServiceError::RateLimited) => Err(ServiceError::RateLimited),
                Err(_) => Err(ServiceError::Unavailable),
            }
        }
    }

    fn candidate(title: &str, company: &str, url: &str) -> CandidateJob {
        CandidateJob {
            job_title: title.into(),
            company_name: company.into(),
            job_url: url.into(),
            location: "Berlin, Germany".into(),
            job_description: String::new(),
        }
    }

    fn profile() -> ResumeProfile {
        ResumeProfile::from_value(serde_json::json!({
            "personal": {"full_name": "Ada Lovelace"}
        }))
        .unwrap()
    }

    fn store_with(config: &FilterConfig) -> (FilterStore, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = FilterStore::new(file.path().to_path_buf());
        store.save(config).unwrap();
        (store, file)
    }

    fn cached_search_config() -> FilterConfig {
        FilterConfig {
            search_parameters: vec![SearchIntent::Params(SearchParams {
                keywords: "rust backend".into(),
                location: "Berlin".into(),
                remote: false,
            })],
            ..Default::default()
        }
    }

    #[test]
    fn test_collection_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let listing = StubListing {
            available: true,
            candidates: vec![
                candidate("Backend Engineer", "Acme", "u1"),
                candidate("Data Engineer", "Beta", "u2"),
            ],
        };
        let analyst = StubAnalyst::with_params(vec![]);
        let (store, _file) = store_with(&cached_search_config());
        let shutdown = ShutdownFlag::new();

        let mut ctx = CycleContext::default();
        let first = run_collection(&db, &listing, &analyst, &store, &profile(), &mut ctx, &shutdown)
            .unwrap();
        assert_eq!(first.len(), 2);

        // Same provider output again: natural-key dedup inserts nothing.
        let second = run_collection(&db, &listing, &analyst, &store, &profile(), &mut ctx, &shutdown)
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(db.get_all().unwrap().len(), 2);
    }

    #[test]
    fn test_keyword_filtered_candidates_are_not_inserted() {
        let db = Database::open_in_memory().unwrap();
        let listing = StubListing {
            available: true,
            candidates: vec![
                candidate("WordPress Developer", "Acme", "u1"),
                candidate("Backend Engineer", "Beta", "u2"),
            ],
        };
        let analyst = StubAnalyst::with_params(vec![]);
        let mut config = cached_search_config();
        config.job_title_skip_keywords = vec!["wordpress".into()];
        let (store, _file) = store_with(&config);

        let mut ctx = CycleContext::default();
        let inserted = run_collection(
            &db,
            &listing,
            &analyst,
            &store,
            &profile(),
            &mut ctx,
            &ShutdownFlag::new(),
        )
        .unwrap();
        assert_eq!(inserted, vec![JobKey::new("u2", "Beta")]);
    }

    #[test]
    fn test_malformed_candidate_is_skipped_not_fatal() {
        let db = Database::open_in_memory().unwrap();
        let listing = StubListing {
            available: true,
            candidates: vec![
                candidate("Backend Engineer", "", "u1"),
                candidate("Backend Engineer", "Beta", "u2"),
            ],
        };
        let analyst = StubAnalyst::with_params(vec![]);
        let (store, _file) = store_with(&cached_search_config());

        let mut ctx = CycleContext::default();
        let inserted = run_collection(
            &db,
            &listing,
            &analyst,
            &store,
            &profile(),
            &mut ctx,
            &ShutdownFlag::new(),
        )
        .unwrap();
        assert_eq!(inserted.len(), 1);
    }

    #[test]
    fn test_self_seeding_persists_generated_parameters() {
        let db = Database::open_in_memory().unwrap();
        let listing = StubListing {
            available: true,
            candidates: vec![candidate("Backend Engineer", "Acme", "u1")],
        };
        let analyst = StubAnalyst::with_params(vec![SearchParams {
            keywords: "rust".into(),
            location: "Remote".into(),
            remote: true,
        }]);
        let (store, _file) = store_with(&FilterConfig::default());

        let mut ctx = CycleContext::default();
        let inserted = run_collection(
            &db,
            &listing,
            &analyst,
            &store,
            &profile(),
            &mut ctx,
            &ShutdownFlag::new(),
        )
        .unwrap();

        assert_eq!(inserted.len(), 1);
        assert_eq!(analyst.calls.get(), 1);
        assert_eq!(store.load().search_parameters.len(), 1);
    }

    #[test]
    fn test_rate_limited_seeding_sets_cycle_flag() {
        let db = Database::open_in_memory().unwrap();
        let listing = StubListing {
            available: true,
            candidates: vec![],
        };
        let analyst = StubAnalyst::rate_limited();
        let (store, _file) = store_with(&FilterConfig::default());

        let mut ctx = CycleContext::default();
        let inserted = run_collection(
            &db,
            &listing,
            &analyst,
            &store,
            &profile(),
            &mut ctx,
            &ShutdownFlag::new(),
        )
        .unwrap();
        assert!(inserted.is_empty());
        assert!(ctx.rate_limit_hit);
    }

    #[test]
    fn test_unavailable_provider_yields_empty_not_error() {
        let db = Database::open_in_memory().unwrap();
        let listing = StubListing {
            available: false,
            candidates: vec![],
        };
        let analyst = StubAnalyst::with_params(vec![]);
        let (store, _file) = store_with(&FilterConfig::default());

        let mut ctx = CycleContext::default();
        let inserted = run_collection(
            &db,
            &listing,
            &analyst,
            &store,
            &profile(),
            &mut ctx,
            &ShutdownFlag::new(),
        )
        .unwrap();
        assert!(inserted.is_empty());
        assert_eq!(analyst.calls.get(), 0);
    }
}
