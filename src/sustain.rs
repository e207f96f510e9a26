use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::clients::{pause_between_batches, FitAnalyst};
use crate::cycle::CycleContext;
use crate::db::{Database, JobUpdate};
use crate::filters::normalize_company_name;
use crate::models::{CompanyContext, FitScore, JobRecord};

pub const SUSTAINABILITY_CHECK_BATCH_SIZE: usize = 10;

/// Overviews shorter than this cannot support a classification.
pub const MIN_OVERVIEW_CHARS: usize = 40;

pub const INSUFFICIENT_OVERVIEW_REASON: &str =
    "Insufficient company overview (cannot evaluate sustainability)";

/// Classify companies without a definitive sustainability value. Records whose
/// overview is missing or too short are marked unsustainable outright so they
/// leave the default review view; the rest are batched to the classification
/// service, cache-first, and results fan out to every record of a matching
/// company. Returns the number of records updated.
pub fn run_sustainability_validation(
    db: &Database,
    analyst: &dyn FitAnalyst,
    ctx: &mut CycleContext,
) -> Result<usize> {
    let mut processed = mark_insufficient_overviews(db)?;

    let rows = db.get_all()?;
    let cache = build_sustainability_cache(&rows);

    let mut companies_seen: HashSet<String> = HashSet::new();
    let mut cached_hits: Vec<(String, bool)> = Vec::new();
    let mut to_classify: Vec<CompanyContext> = Vec::new();

    for row in &rows {
        if row.applied || row.expired {
            continue;
        }
        // Bad-analysis jobs are included so their company gets validated
        // before re-analysis; otherwise anything already scored below Good
        // is not worth a classification call.
        if !row.bad_analysis && row.fit_score.is_some_and(FitScore::is_below_good) {
            continue;
        }
        if row.sustainable.is_some() {
            continue;
        }
        let overview = row.company_overview.trim();
        if overview.len() < MIN_OVERVIEW_CHARS {
            continue;
        }
        if row.company_name.trim().is_empty() {
            continue;
        }

        let company_key = normalize_company_name(&row.company_name);
        if !companies_seen.insert(company_key.clone()) {
            continue;
        }
        if let Some(&known) = cache.get(&company_key) {
            cached_hits.push((row.company_name.clone(), known));
            continue;
        }
        to_classify.push(CompanyContext {
            company_name: row.company_name.clone(),
            company_overview: overview.to_string(),
            job_description: row.job_description.clone(),
        });
    }

    for (company_name, known) in cached_hits {
        if fan_out_verdict(db, &rows, &company_name, known, "Cached from store")? {
            processed += 1;
        }
    }

    if to_classify.is_empty() {
        debug!("No companies need sustainability validation");
        return Ok(processed);
    }
    info!(companies = to_classify.len(), "Validating company sustainability");

    let chunk_count = to_classify.len().div_ceil(SUSTAINABILITY_CHECK_BATCH_SIZE);
    for (index, batch) in to_classify
        .chunks(SUSTAINABILITY_CHECK_BATCH_SIZE)
        .enumerate()
    {
        match analyst.classify_sustainability_bulk(batch) {
            Ok(results) => {
                for (company_name, verdict) in results {
                    let Some(is_sustainable) = verdict.is_sustainable else {
                        debug!(company = %company_name, "Classifier returned no verdict");
                        continue;
                    };
                    if fan_out_verdict(db, &rows, &company_name, is_sustainable, &verdict.reasoning)?
                    {
                        processed += 1;
                    }
                }
            }
            Err(e) if e.is_rate_limit() => {
                ctx.rate_limit_hit = true;
                warn!("Rate limited during sustainability classification, stopping for this cycle");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Sustainability classification batch failed");
            }
        }
        if index + 1 < chunk_count {
            pause_between_batches();
        }
    }

    info!(processed, "Sustainability validation completed");
    Ok(processed)
}

/// Insufficient data is treated as disqualifying rather than unknown-forever,
/// so these records do not linger in the default view.
fn mark_insufficient_overviews(db: &Database) -> Result<usize> {
    let rows = db.get_all()?;
    let mut updates = Vec::new();
    for row in &rows {
        if row.sustainable.is_some() {
            continue;
        }
        if row.company_overview.trim().len() >= MIN_OVERVIEW_CHARS {
            continue;
        }
        if row.job_url.is_empty() || row.company_name.is_empty() {
            continue;
        }
        let mut update = JobUpdate {
            sustainable: Some(false),
            ..Default::default()
        };
        if row.fit_score.is_none() {
            update.fit_score = Some(FitScore::VeryPoorFit);
            update.job_analysis = Some(INSUFFICIENT_OVERVIEW_REASON.to_string());
        }
        updates.push((row.key(), update));
    }
    if !updates.is_empty() {
        info!(count = updates.len(), "Marking records with insufficient overview as unsustainable");
        db.bulk_update_by_key(&updates)?;
    }
    Ok(updates.len())
}

pub(crate) fn build_sustainability_cache(rows: &[JobRecord]) -> HashMap<String, bool> {
    let mut cache = HashMap::new();
    for row in rows {
        if row.company_name.trim().is_empty() {
            continue;
        }
        if let Some(value) = row.sustainable {
            cache
                .entry(normalize_company_name(&row.company_name))
                .or_insert(value);
        }
    }
    cache
}

/// Apply one company's verdict to every record with a matching name, exact
/// first and substring as fallback. Negative verdicts score unscored records
/// as VeryPoorFit; an existing fit score is never overwritten.
fn fan_out_verdict(
    db: &Database,
    rows: &[JobRecord],
    company_name: &str,
    is_sustainable: bool,
    reasoning: &str,
) -> Result<bool> {
    let search_name = normalize_company_name(company_name);
    if search_name.is_empty() {
        return Ok(false);
    }

    let mut updates = Vec::new();
    for row in rows {
        if row.job_url.is_empty() {
            continue;
        }
        let row_company = normalize_company_name(&row.company_name);
        let matched = row_company == search_name
            || row_company.contains(&search_name)
            || search_name.contains(&row_company);
        if !matched {
            continue;
        }

        let mut update = JobUpdate {
            sustainable: Some(is_sustainable),
            ..Default::default()
        };
        if !is_sustainable && row.fit_score.is_none() {
            update.fit_score = Some(FitScore::VeryPoorFit);
            update.job_analysis = Some(format!("Unsustainable company: {reasoning}"));
        }
        updates.push((row.key(), update));
    }

    if updates.is_empty() {
        return Ok(false);
    }
    if !is_sustainable {
        info!(company = %company_name, reasoning, "Company classified unsustainable");
    }
    db.bulk_update_by_key(&updates)?;
    Ok(true)
}
