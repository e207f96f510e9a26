use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactStore;
use crate::clients::DetailFetcher;
use crate::config::FilterStore;
use crate::db::{Database, JobUpdate};
use crate::filters::{self, normalize_company_name};
use crate::models::FitScore;
use crate::sustain::build_sustainability_cache;

/// A record is re-checked for expiration at most once per this window.
const EXPIRATION_RECHECK_SECS: i64 = 3600;

/// Re-validate good-fit and unscored records over the crawl path: detect
/// expired postings (deleting their artifacts), and re-screen survivors
/// against the current filter config so keywords added since collection take
/// effect. Returns the number of records changed.
pub fn run_expiration_validation(
    db: &Database,
    crawler: &dyn DetailFetcher,
    filter_store: &FilterStore,
    artifact_store: &ArtifactStore,
    check_sustainability: bool,
) -> Result<usize> {
    let config = filter_store.load();
    let rows = db.get_all()?;
    let sustainability_cache = build_sustainability_cache(&rows);
    let mut changed = 0;

    for row in &rows {
        if row.job_url.is_empty() || row.company_name.is_empty() {
            continue;
        }
        if row.is_excluded() {
            continue;
        }
        if row.fit_score.is_some_and(FitScore::is_below_good) {
            continue;
        }
        if let Some(last_checked) = row.last_expiration_check {
            if (Utc::now() - last_checked).num_seconds() < EXPIRATION_RECHECK_SECS {
                debug!(title = %row.job_title, company = %row.company_name, "Expiration checked recently, skipping");
                continue;
            }
        }

        info!(title = %row.job_title, company = %row.company_name, "Checking expiration");
        match crawler.check_expired(&row.job_url) {
            Ok(Some(true)) => {
                info!(title = %row.job_title, company = %row.company_name, "Job has expired");
                db.update_by_key(
                    &row.key(),
                    &JobUpdate {
                        expired: Some(true),
                        ..Default::default()
                    },
                )?;
                if !row.tailored_resume_ref.is_empty() {
                    artifact_store.delete_resume(&row.tailored_resume_ref);
                }
                changed += 1;
            }
            Ok(Some(false)) => {
                let result = filters::classify(
                    &row.job_title,
                    &row.company_name,
                    &row.location,
                    &row.company_overview,
                    &row.job_description,
                    &config,
                    check_sustainability,
                    |company, _, _| {
                        sustainability_cache
                            .get(&normalize_company_name(company))
                            .copied()
                    },
                );

                let mut update = JobUpdate {
                    last_expiration_check: Some(Utc::now()),
                    ..Default::default()
                };
                if !row.location.is_empty() {
                    let priority = filters::location_priority(&row.location, &config);
                    if priority != row.location_priority {
                        update.location_priority = Some(priority);
                    }
                }
                if let Some(score) = result.fit_score {
                    // Keyword re-screens overwrite even a good score;
                    // the sustainability downgrade never replaces one.
                    let sustainability_downgrade = result.sustainable == Some(false);
                    if !sustainability_downgrade || row.fit_score.is_none() {
                        info!(title = %row.job_title, reason = %result.reason, "Filtered on re-screen");
                        update.fit_score = Some(score);
                        update.job_analysis = Some(result.reason);
                        update.bulk_filtered = Some(true);
                        update.sustainable = result.sustainable;
                        changed += 1;
                    }
                }
                db.update_by_key(&row.key(), &update)?;
            }
            Ok(None) => {
                // Undetermined; leave unstamped so the next cycle retries.
                debug!(url = %row.job_url, "Could not determine expiration");
            }
            Err(e) => warn!(url = %row.job_url, error = %e, "Expiration check failed"),
        }
    }

    info!(changed, "Expiration validation completed");
    Ok(changed)
}
