use anyhow::Result;
use std::collections::{HashMap, HashSet};
use strsim::jaro_winkler;
use tracing::{debug, info, warn};

use crate::clients::{pause_between_batches, DetailFetcher, ListingProvider};
use crate::db::{Database, JobUpdate};
use crate::filters::{extract_job_id, normalize_company_name};
use crate::models::{DescriptionOutcome, FitScore, JobDetail, JobKey};

/// Provider cap for one bulk company-overview request.
pub const COMPANY_OVERVIEW_BATCH_SIZE: usize = 1000;

/// Crawl failures accumulate to this size before the bulk provider is asked
/// to fill in the failed subset.
pub const JD_FALLBACK_MIN_BATCH: usize = 50;

const TITLE_SIMILARITY_THRESHOLD: f64 = 0.9;

/// Fetch missing company overviews. Cache first, then the bulk provider,
/// with the crawl path as fallback only when the provider is unavailable.
/// Companies appearing in more pending records are fetched first. Returns the
/// number of records that received an overview.
pub fn fetch_company_overviews(
    db: &Database,
    listing: &dyn ListingProvider,
    crawler: Option<&dyn DetailFetcher>,
    cache: &mut HashMap<String, String>,
    check_sustainability: bool,
    target: Option<&HashSet<JobKey>>,
) -> Result<usize> {
    let rows = db.get_all()?;
    let mut fetched = 0;
    let mut company_jobs: HashMap<String, Vec<JobKey>> = HashMap::new();
    let mut display_names: HashMap<String, String> = HashMap::new();

    for row in &rows {
        let key = row.key();
        if let Some(target) = target {
            if !target.contains(&key) {
                continue;
            }
        }
        // Never overwrite an overview; only fetch for rows the reviewer would
        // actually see, and only once per record.
        if !row.company_overview.is_empty() || row.co_fetch_attempted {
            continue;
        }
        if !row.passes_default_filter(check_sustainability) {
            continue;
        }
        if row.job_url.is_empty() || row.company_name.is_empty() {
            continue;
        }

        let company_key = normalize_company_name(&row.company_name);
        if let Some(overview) = cache.get(&company_key) {
            db.update_by_key(
                &key,
                &JobUpdate {
                    company_overview: Some(overview.clone()),
                    ..Default::default()
                },
            )?;
            fetched += 1;
            continue;
        }

        display_names
            .entry(company_key.clone())
            .or_insert_with(|| row.company_name.clone());
        company_jobs.entry(company_key).or_default().push(key);
    }

    if company_jobs.is_empty() {
        return Ok(fetched);
    }

    // Companies blocking more records first.
    let mut ordered: Vec<&String> = company_jobs.keys().collect();
    ordered.sort_by_key(|key| std::cmp::Reverse(company_jobs[*key].len()));
    let ordered: Vec<String> = ordered.into_iter().cloned().collect();
    info!(companies = ordered.len(), "Fetching missing company overviews");

    let mut resolved: HashSet<String> = HashSet::new();
    if listing.is_available() {
        let names: Vec<String> = ordered
            .iter()
            .map(|key| display_names[key].clone())
            .collect();
        let chunk_count = names.len().div_ceil(COMPANY_OVERVIEW_BATCH_SIZE);
        for (index, chunk) in names.chunks(COMPANY_OVERVIEW_BATCH_SIZE).enumerate() {
            if !listing.is_available() {
                break;
            }
            let overviews = listing.fetch_overviews_bulk(chunk)?;
            for (name, overview) in overviews {
                if overview.trim().is_empty() {
                    continue;
                }
                let fetched_key = normalize_company_name(&name);
                cache.insert(fetched_key.clone(), overview.clone());
                // Exact key first, substring fallback for provider-renamed companies.
                let matched: Vec<String> = if company_jobs.contains_key(&fetched_key) {
                    vec![fetched_key.clone()]
                } else {
                    company_jobs
                        .keys()
                        .filter(|k| k.contains(&fetched_key) || fetched_key.contains(k.as_str()))
                        .cloned()
                        .collect()
                };
                for company_key in matched {
                    for job_key in &company_jobs[&company_key] {
                        db.update_by_key(
                            job_key,
                            &JobUpdate {
                                company_overview: Some(overview.clone()),
                                co_fetch_attempted: Some(true),
                                ..Default::default()
                            },
                        )?;
                        fetched += 1;
                    }
                    resolved.insert(company_key);
                }
            }
            if index + 1 < chunk_count {
                pause_between_batches();
            }
        }
    } else if let Some(crawler) = crawler {
        debug!("Bulk provider unavailable, crawling company pages instead");
        for company_key in &ordered {
            let name = &display_names[company_key];
            match crawler.fetch_company_overview(name) {
                Ok(Some(overview)) => {
                    cache.insert(company_key.clone(), overview.clone());
                    for job_key in &company_jobs[company_key] {
                        db.update_by_key(
                            job_key,
                            &JobUpdate {
                                company_overview: Some(overview.clone()),
                                co_fetch_attempted: Some(true),
                                ..Default::default()
                            },
                        )?;
                        fetched += 1;
                    }
                    resolved.insert(company_key.clone());
                }
                Ok(None) => {}
                Err(e) => warn!(company = %name, error = %e, "Company overview crawl failed"),
            }
        }
    } else {
        // No fetch path at all this cycle; leave records unmarked so a later
        // cycle with the provider back can pick them up.
        return Ok(fetched);
    }

    // Attempted but unresolved companies are marked so the next cycle does
    // not retry them forever.
    for company_key in &ordered {
        if resolved.contains(company_key) {
            continue;
        }
        for job_key in &company_jobs[company_key] {
            db.update_by_key(
                job_key,
                &JobUpdate {
                    co_fetch_attempted: Some(true),
                    ..Default::default()
                },
            )?;
        }
    }

    info!(fetched, "Company overview fetching completed");
    Ok(fetched)
}

/// Fit scores for which a missing description is still worth fetching.
fn description_worth_fetching(score: Option<FitScore>) -> bool {
    score.is_none_or(|s| {
        matches!(
            s,
            FitScore::ModerateFit | FitScore::GoodFit | FitScore::VeryGoodFit
        )
    })
}

/// Fetch missing job descriptions: individual crawl first (recording every
/// attempt), bulk provider fallback once enough failures accumulate. Jobs
/// detected as expired during fetch are marked expired instead. Returns the
/// number of descriptions written.
pub fn fetch_missing_descriptions(
    db: &Database,
    listing: &dyn ListingProvider,
    crawler: Option<&dyn DetailFetcher>,
) -> Result<usize> {
    let rows = db.get_all()?;
    let mut to_fetch: Vec<(JobKey, String, bool)> = Vec::new();

    for row in &rows {
        if row.is_excluded() || row.sustainable == Some(false) {
            continue;
        }
        if !description_worth_fetching(row.fit_score) {
            continue;
        }
        if row.jd_crawl_attempted || !row.job_description.is_empty() {
            continue;
        }
        if row.job_url.is_empty() || row.company_name.is_empty() {
            continue;
        }
        to_fetch.push((
            row.key(),
            row.job_title.clone(),
            row.company_overview.is_empty(),
        ));
    }

    if to_fetch.is_empty() {
        debug!("No jobs need description fetching");
        return Ok(0);
    }
    info!(count = to_fetch.len(), "Fetching missing job descriptions");

    let mut fetched = 0;
    let mut failed: Vec<(JobKey, String, bool)> = Vec::new();

    if let Some(crawler) = crawler {
        for (key, title, overview_missing) in &to_fetch {
            let outcome = match crawler.fetch_description(&key.job_url) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(url = %key.job_url, error = %e, "Description crawl failed");
                    DescriptionOutcome::Failed
                }
            };
            let mut update = JobUpdate {
                jd_crawl_attempted: Some(true),
                ..Default::default()
            };
            match outcome {
                DescriptionOutcome::Fetched(description) => {
                    update.job_description = Some(description);
                    fetched += 1;
                }
                DescriptionOutcome::Expired => {
                    info!(url = %key.job_url, "Job posting expired");
                    update.expired = Some(true);
                }
                DescriptionOutcome::Failed => {
                    failed.push((key.clone(), title.clone(), *overview_missing));
                }
            }
            db.update_by_key(key, &update)?;
        }
    } else {
        // No crawl path; hand everything to the bulk fallback below without
        // burning the single crawl attempt each record gets.
        failed = to_fetch.clone();
    }

    if failed.len() >= JD_FALLBACK_MIN_BATCH && listing.is_available() {
        let with_ids: Vec<(&JobKey, &String, bool, String)> = failed
            .iter()
            .filter_map(|(key, title, overview_missing)| {
                extract_job_id(&key.job_url).map(|id| (key, title, *overview_missing, id))
            })
            .collect();
        let ids: Vec<String> = with_ids.iter().map(|(_, _, _, id)| id.clone()).collect();
        info!(count = ids.len(), "Trying bulk provider for failed description fetches");
        let details = listing.fetch_descriptions_bulk(&ids)?;
        for detail in &details {
            if detail.description.trim().is_empty() {
                continue;
            }
            for (key, title, overview_missing, _) in &with_ids {
                if !matches_job_detail(title, &key.company_name, detail) {
                    continue;
                }
                let mut update = JobUpdate {
                    job_description: Some(detail.description.clone()),
                    ..Default::default()
                };
                if *overview_missing && !detail.company_overview.trim().is_empty() {
                    update.company_overview = Some(detail.company_overview.clone());
                    update.co_fetch_attempted = Some(true);
                }
                db.update_by_key(key, &update)?;
                fetched += 1;
                break;
            }
        }
    }

    Ok(fetched)
}

/// Match a record to a bulk-fetch result by comparing title and company,
/// tolerating the provider's renames and truncations.
fn matches_job_detail(job_title: &str, company_name: &str, detail: &JobDetail) -> bool {
    let title = job_title.trim().to_lowercase();
    let detail_title = detail.title.trim().to_lowercase();
    let title_matches = title.contains(&detail_title)
        || detail_title.contains(&title)
        || jaro_winkler(&title, &detail_title) >= TITLE_SIMILARITY_THRESHOLD;

    let company = normalize_company_name(company_name);
    let detail_company = normalize_company_name(&detail.company);
    let company_matches = company == detail_company
        || company.contains(&detail_company)
        || detail_company.contains(&company);

    title_matches && company_matches
}
