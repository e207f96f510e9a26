use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::analyze::{self, AnalysisSettings};
use crate::artifacts::{self, ArtifactStore};
use crate::clients::{ArtifactGenerator, DetailFetcher, FitAnalyst, ListingProvider};
use crate::collect;
use crate::config::{FilterStore, ResumeProfile, Settings};
use crate::db::Database;
use crate::enrich;
use crate::filters::normalize_company_name;
use crate::models::JobKey;
use crate::qualify;
use crate::sustain;
use crate::validate;

pub const BASE_SLEEP_INTERVAL: Duration = Duration::from_secs(3600);
pub const MAX_SLEEP_INTERVAL: Duration = Duration::from_secs(86400);
/// Rate limits clear quickly; wait this long instead of the full backoff.
pub const RATE_LIMIT_SHORT_WAIT: Duration = Duration::from_secs(300);
/// Idle waits sleep in small chunks so a shutdown request is honored promptly.
const SLEEP_CHUNK: Duration = Duration::from_secs(5);

/// Cooperative shutdown signal, checked at the top of every cycle and inside
/// the idle wait. In-flight calls complete before the flag is honored.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-cycle state threaded through the stages rather than kept in globals.
#[derive(Debug, Default)]
pub struct CycleContext {
    /// Set by any stage that observed a rate-limit signal this cycle; the
    /// controller then prefers the short wait over the long backoff.
    pub rate_limit_hit: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CycleOutcome {
    pub progress: bool,
    pub rate_limit_hit: bool,
}

/// Next idle interval: exponential backoff while stuck, reset on progress.
pub fn next_sleep_interval(current: Duration, progress_made: bool) -> Duration {
    if progress_made {
        BASE_SLEEP_INTERVAL
    } else {
        (current * 2).min(MAX_SLEEP_INTERVAL)
    }
}

pub struct Pipeline<'a> {
    pub db: &'a Database,
    pub listing: &'a dyn ListingProvider,
    pub analyst: &'a dyn FitAnalyst,
    pub generator: &'a dyn ArtifactGenerator,
    pub crawler: Option<&'a dyn DetailFetcher>,
    pub filter_store: &'a FilterStore,
    pub artifact_store: &'a ArtifactStore,
    pub profile: &'a ResumeProfile,
    pub settings: &'a Settings,
}

impl Pipeline<'_> {
    /// One full pass through the stages in fixed order. Stage-local failures
    /// never propagate past their stage; the controller only learns whether
    /// progress was made and whether a rate limit was observed.
    pub fn run_cycle(
        &self,
        overview_cache: &mut HashMap<String, String>,
        shutdown: &ShutdownFlag,
    ) -> Result<CycleOutcome> {
        let mut ctx = CycleContext::default();
        let mut progress = false;
        info!("Starting processing cycle");

        let collected = collect::run_collection(
            self.db,
            self.listing,
            self.analyst,
            self.filter_store,
            self.profile,
            &mut ctx,
            shutdown,
        )?;
        if !collected.is_empty() {
            progress = true;
        }
        let target: Option<HashSet<JobKey>> =
            (!collected.is_empty()).then(|| collected.into_iter().collect());

        if shutdown.requested() {
            return Ok(CycleOutcome {
                progress,
                rate_limit_hit: ctx.rate_limit_hit,
            });
        }

        if qualify::run_bulk_qualification(
            self.db,
            self.analyst,
            self.filter_store,
            self.profile,
            target.as_ref(),
            false,
            &mut ctx,
        )? > 0
        {
            progress = true;
        }

        if !self.settings.skip_jd_fetch
            && enrich::fetch_missing_descriptions(self.db, self.listing, self.crawler)? > 0
        {
            progress = true;
        }
        if enrich::fetch_company_overviews(
            self.db,
            self.listing,
            self.crawler,
            overview_cache,
            self.settings.check_sustainability,
            None,
        )? > 0
        {
            progress = true;
        }

        if shutdown.requested() {
            return Ok(CycleOutcome {
                progress,
                rate_limit_hit: ctx.rate_limit_hit,
            });
        }

        if self.settings.check_sustainability
            && sustain::run_sustainability_validation(self.db, self.analyst, &mut ctx)? > 0
        {
            progress = true;
        }

        let analysis_settings = AnalysisSettings {
            check_sustainability: self.settings.check_sustainability,
        };
        if analyze::run_fit_analysis(
            self.db,
            self.analyst,
            self.generator,
            self.artifact_store,
            self.filter_store,
            self.profile,
            &analysis_settings,
            None,
            &mut ctx,
        )? > 0
        {
            progress = true;
        }

        if artifacts::run_artifact_generation(
            self.db,
            self.generator,
            self.artifact_store,
            self.profile,
            None,
            &mut ctx,
        )? > 0
        {
            progress = true;
        }

        info!("Finalizing processing cycle");
        if self.settings.crawl_enabled {
            if let Some(crawler) = self.crawler {
                if validate::run_expiration_validation(
                    self.db,
                    crawler,
                    self.filter_store,
                    self.artifact_store,
                    self.settings.check_sustainability,
                )? > 0
                {
                    progress = true;
                }
            }
        }
        // Leftover qualification batches below the minimum size run now.
        if qualify::run_bulk_qualification(
            self.db,
            self.analyst,
            self.filter_store,
            self.profile,
            None,
            true,
            &mut ctx,
        )? > 0
        {
            progress = true;
        }

        info!("Sorting records by fit score and location priority");
        self.db.sort_by_priority()?;

        if !progress {
            info!("Cycle made no progress");
        }
        Ok(CycleOutcome {
            progress,
            rate_limit_hit: ctx.rate_limit_hit,
        })
    }

    /// The continuous loop: check for pending work, wait with backoff when
    /// idle or stuck, and stop entirely when no work remains and no data
    /// source is available at all.
    pub fn run_loop(&self, shutdown: &ShutdownFlag) -> Result<()> {
        let mut overview_cache = build_company_overview_cache(self.db)?;
        let mut last_cycle_start: Option<Instant> = None;
        let mut progress_last_cycle = true;
        let mut rate_limited_last_cycle = false;
        let mut current_interval = BASE_SLEEP_INTERVAL;

        while !shutdown.requested() {
            let has_incomplete = self.has_incomplete_jobs()?;
            if !has_incomplete && !self.settings.crawl_enabled && !self.listing.is_available() {
                info!("Nothing left to do and no data source available, stopping");
                break;
            }

            current_interval = self.idle_wait(
                has_incomplete,
                progress_last_cycle,
                rate_limited_last_cycle,
                last_cycle_start,
                current_interval,
                shutdown,
            );
            if shutdown.requested() {
                break;
            }

            if has_incomplete {
                info!("Found jobs with missing data, processing");
            }
            last_cycle_start = Some(Instant::now());

            match self.run_cycle(&mut overview_cache, shutdown) {
                Ok(outcome) => {
                    progress_last_cycle = outcome.progress;
                    rate_limited_last_cycle = outcome.rate_limit_hit;
                    if outcome.progress && current_interval != BASE_SLEEP_INTERVAL {
                        info!("Progress made, resetting idle interval");
                        current_interval = BASE_SLEEP_INTERVAL;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Processing cycle failed");
                }
            }
        }

        info!("Shutdown complete");
        Ok(())
    }

    /// Any record that still needs a description, an overview, or analysis,
    /// and that some available path could actually serve.
    fn has_incomplete_jobs(&self) -> Result<bool> {
        let listing_available = self.listing.is_available();
        let description_path =
            !self.settings.skip_jd_fetch && (self.settings.crawl_enabled || listing_available);
        for row in self.db.get_all()? {
            if row.job_title.is_empty() || row.is_excluded() {
                continue;
            }
            let needs_description = row.job_description.is_empty() && description_path;
            let needs_overview = row.company_overview.is_empty() && listing_available;
            let can_get_description = !row.job_description.is_empty() || description_path;
            let can_get_overview = !row.company_overview.is_empty()
                || listing_available
                || self.settings.crawl_enabled;
            let needs_analysis =
                row.fit_score.is_none() && can_get_description && can_get_overview;
            if needs_description || needs_overview || needs_analysis {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn idle_wait(
        &self,
        has_incomplete: bool,
        progress_last_cycle: bool,
        rate_limited_last_cycle: bool,
        last_cycle_start: Option<Instant>,
        current_interval: Duration,
        shutdown: &ShutdownFlag,
    ) -> Duration {
        if !progress_last_cycle && rate_limited_last_cycle && has_incomplete {
            info!(
                minutes = RATE_LIMIT_SHORT_WAIT.as_secs() / 60,
                "Rate limit was hit, short wait before retry"
            );
            chunked_sleep(RATE_LIMIT_SHORT_WAIT, shutdown);
            return current_interval;
        }

        let Some(last_start) = last_cycle_start else {
            return current_interval;
        };
        let elapsed = last_start.elapsed();
        let should_sleep =
            (!has_incomplete || !progress_last_cycle) && elapsed < current_interval;
        if !should_sleep {
            return current_interval;
        }

        let sleep_time = current_interval - elapsed;
        if has_incomplete {
            info!(
                hours = current_interval.as_secs_f64() / 3600.0,
                "No progress on incomplete jobs, backing off to avoid a tight loop"
            );
        } else {
            info!(
                minutes = sleep_time.as_secs() / 60,
                "All jobs complete, sleeping until next check"
            );
        }
        chunked_sleep(sleep_time, shutdown);

        if !progress_last_cycle {
            let next = next_sleep_interval(current_interval, false);
            info!(hours = next.as_secs_f64() / 3600.0, "Extending idle interval");
            return next;
        }
        current_interval
    }
}

pub(crate) fn chunked_sleep(total: Duration, shutdown: &ShutdownFlag) {
    let mut slept = Duration::ZERO;
    while slept < total && !shutdown.requested() {
        let chunk = SLEEP_CHUNK.min(total - slept);
        thread::sleep(chunk);
        slept += chunk;
    }
}

/// Seed the per-run overview cache from what the store already knows, so a
/// restart does not refetch overviews that were fetched before.
pub fn build_company_overview_cache(db: &Database) -> Result<HashMap<String, String>> {
    let mut cache = HashMap::new();
    for row in db.get_all()? {
        let overview = row.company_overview.trim();
        if row.company_name.trim().is_empty() || overview.is_empty() {
            continue;
        }
        cache
            .entry(normalize_company_name(&row.company_name))
            .or_insert_with(|| overview.to_string());
    }
    Ok(cache)
}
