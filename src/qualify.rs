use anyhow::Result;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::clients::{pause_between_batches, FitAnalyst};
use crate::config::{FilterStore, ResumeProfile};
use crate::cycle::CycleContext;
use crate::db::{Database, JobUpdate};
use crate::filters;
use crate::models::{FitScore, JobKey};

/// Minimum number of unqualified jobs before a service batch is worth sending.
pub const BULK_FILTER_BATCH_SIZE: usize = 100;

pub const BULK_FILTER_REASON: &str = "Filtered by bulk analysis - wrong tech/role/domain";

/// Coarse accept/reject pass over records that have not been through bulk
/// qualification yet. Keyword screening runs first and short-circuits the
/// service call for records it can already score; the rest go to the
/// fit-analysis service in batches of (title, company) pairs. Returns the
/// number of records that received a score.
pub fn run_bulk_qualification(
    db: &Database,
    analyst: &dyn FitAnalyst,
    filter_store: &FilterStore,
    profile: &ResumeProfile,
    target: Option<&HashSet<JobKey>>,
    force: bool,
    ctx: &mut CycleContext,
) -> Result<usize> {
    let mut config = filter_store.load();
    let rows = db.get_all()?;

    let mut to_mark: Vec<JobKey> = Vec::new();
    let mut candidates: Vec<(JobKey, String, String)> = Vec::new();
    let mut filtered_count = 0;

    for row in &rows {
        if row.bulk_filtered {
            continue;
        }
        let key = row.key();
        if let Some(target) = target {
            if !target.contains(&key) {
                continue;
            }
        }

        // Qualification is a cost-avoidance gate, not a scoring source of
        // truth: anything already scored or excluded just gets marked done.
        if row.fit_score.is_some() || row.is_excluded() {
            to_mark.push(key);
            continue;
        }

        let result = filters::classify(
            &row.job_title,
            &row.company_name,
            &row.location,
            &row.company_overview,
            &row.job_description,
            &config,
            false,
            |_, _, _| None,
        );
        if let Some(score) = result.fit_score {
            info!(title = %row.job_title, company = %row.company_name, reason = %result.reason, "Keyword filter scored job");
            db.update_by_key(
                &key,
                &JobUpdate {
                    fit_score: Some(score),
                    job_analysis: Some(result.reason),
                    bulk_filtered: Some(true),
                    sustainability_keyword_matches: (!result.keyword_matches.is_empty())
                        .then_some(result.keyword_matches),
                    ..Default::default()
                },
            )?;
            filtered_count += 1;
            continue;
        }

        candidates.push((key, row.job_title.clone(), row.company_name.clone()));
    }

    for key in &to_mark {
        db.update_by_key(
            key,
            &JobUpdate {
                bulk_filtered: Some(true),
                ..Default::default()
            },
        )?;
    }

    if candidates.is_empty() {
        debug!("No jobs need bulk qualification");
        return Ok(filtered_count);
    }
    if !force && candidates.len() < BULK_FILTER_BATCH_SIZE {
        info!(
            pending = candidates.len(),
            minimum = BULK_FILTER_BATCH_SIZE,
            "Not enough jobs for a qualification batch, skipping"
        );
        return Ok(filtered_count);
    }

    let mut filters_updated = false;
    let chunks: Vec<&[(JobKey, String, String)]> =
        candidates.chunks(BULK_FILTER_BATCH_SIZE).collect();
    let chunk_count = chunks.len();
    for (index, chunk) in chunks.into_iter().enumerate() {
        let pairs: Vec<(String, String)> = chunk
            .iter()
            .map(|(_, title, company)| (title.clone(), company.clone()))
            .collect();

        match analyst.bulk_qualify(&pairs, profile) {
            Ok(result) => {
                if config.merge_skip_keywords(&result.new_skip_keywords) {
                    filters_updated = true;
                }
                let flagged: HashSet<&str> =
                    result.filtered_titles.iter().map(String::as_str).collect();
                for (key, title, company) in chunk {
                    let mut update = JobUpdate {
                        bulk_filtered: Some(true),
                        ..Default::default()
                    };
                    if flagged.contains(title.as_str()) {
                        update.fit_score = Some(FitScore::VeryPoorFit);
                        update.job_analysis = Some(BULK_FILTER_REASON.to_string());
                        info!(title = %title, company = %company, "Bulk qualification filtered job");
                        filtered_count += 1;
                    }
                    db.update_by_key(key, &update)?;
                }
            }
            Err(e) => {
                if e.is_rate_limit() {
                    ctx.rate_limit_hit = true;
                }
                warn!(error = %e, "Bulk qualification batch failed, marking batch as processed");
                // Mark anyway so the same batch is not reprocessed forever.
                for (key, _, _) in chunk {
                    db.update_by_key(
                        key,
                        &JobUpdate {
                            bulk_filtered: Some(true),
                            ..Default::default()
                        },
                    )?;
                }
            }
        }

        if index + 1 < chunk_count {
            pause_between_batches();
        }
    }

    if filters_updated {
        if let Err(e) = filter_store.save(&config) {
            warn!(error = %e, "Could not persist discovered skip keywords");
        }
    }

    info!(filtered = filtered_count, "Bulk qualification completed");
    Ok(filtered_count)
}
