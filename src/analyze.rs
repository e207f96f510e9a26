use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::artifacts::{self, ArtifactStore};
use crate::clients::{ArtifactGenerator, FitAnalyst};
use crate::config::{FilterStore, ResumeProfile};
use crate::cycle::CycleContext;
use crate::db::{Database, JobUpdate};
use crate::filters;
use crate::models::{FitScore, JobContext, JobKey, JobRecord};

/// Abort the remaining batch after this many per-record failures in a row.
const MAX_CONSECUTIVE_FAILURES: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct AnalysisSettings {
    pub check_sustainability: bool,
}

/// A named condition that stops further processing of a record this cycle.
struct Gate {
    name: &'static str,
    applies: fn(&JobRecord, &AnalysisSettings) -> bool,
}

/// Evaluated in order; the first matching gate wins and is reported as the
/// skip reason. The order is part of the stage contract.
const GATES: &[Gate] = &[
    Gate {
        name: "Job posting expired",
        applies: |r, _| r.expired,
    },
    Gate {
        name: "Missing job description",
        applies: |r, _| r.job_description.is_empty(),
    },
    Gate {
        name: "Missing company overview",
        applies: |r, _| r.company_overview.is_empty(),
    },
    Gate {
        name: "Company marked unsustainable",
        applies: |r, s| s.check_sustainability && r.sustainable == Some(false),
    },
    Gate {
        name: "Sustainability pending",
        applies: |r, s| s.check_sustainability && r.sustainable.is_none(),
    },
    Gate {
        name: "Already applied",
        applies: |r, _| r.applied,
    },
    Gate {
        name: "Already scored",
        applies: |r, _| r.fit_score.is_some() && !r.bad_analysis,
    },
];

/// First matching gate for a record, or None when it is eligible for analysis.
pub fn first_gate(record: &JobRecord, settings: &AnalysisSettings) -> Option<&'static str> {
    GATES
        .iter()
        .find(|gate| (gate.applies)(record, settings))
        .map(|gate| gate.name)
}

/// Category phrases checked in order against the service narrative; the
/// narrative format belongs to the service, so this adapter is the only place
/// that knows about it. No match means QuestionableFit.
pub fn parse_fit_score(narrative: &str) -> FitScore {
    const ORDERED: [FitScore; 5] = [
        FitScore::VeryGoodFit,
        FitScore::GoodFit,
        FitScore::ModerateFit,
        FitScore::PoorFit,
        FitScore::VeryPoorFit,
    ];
    for score in ORDERED {
        if narrative.contains(score.as_str()) {
            return score;
        }
    }
    FitScore::QuestionableFit
}

/// Analyze every eligible record against the resume profile. A VeryGoodFit
/// result triggers artifact generation for that record inline, so the best
/// matches are acted on without waiting for the next stage. A rate-limit
/// signal aborts the remaining batch for this cycle. Returns the number of
/// records analyzed.
pub fn run_fit_analysis(
    db: &Database,
    analyst: &dyn FitAnalyst,
    generator: &dyn ArtifactGenerator,
    artifact_store: &ArtifactStore,
    filter_store: &FilterStore,
    profile: &ResumeProfile,
    settings: &AnalysisSettings,
    target: Option<&HashSet<JobKey>>,
    ctx: &mut CycleContext,
) -> Result<usize> {
    let config = filter_store.load();
    let rows = db.get_all()?;
    let mut analyzed = 0;
    let mut consecutive_failures = 0;
    let mut skip_counts: HashMap<&'static str, usize> = HashMap::new();
    let mut skip_examples: HashMap<&'static str, String> = HashMap::new();

    for row in &rows {
        if let Some(target) = target {
            if !target.contains(&row.key()) {
                continue;
            }
        }
        if row.job_title.is_empty() {
            continue;
        }
        if let Some(gate) = first_gate(row, settings) {
            *skip_counts.entry(gate).or_default() += 1;
            skip_examples
                .entry(gate)
                .or_insert_with(|| format!("{} – {}", row.company_name, row.job_title));
            continue;
        }

        info!(title = %row.job_title, company = %row.company_name, "Analyzing job");
        let context = JobContext::from_record(row);
        match analyst.analyze(profile, &context) {
            Ok(narrative) => {
                let score = parse_fit_score(&narrative);
                let screen = filters::apply_sustainability_keyword_filters(
                    &row.job_title,
                    &row.company_name,
                    &row.location,
                    &row.company_overview,
                    &config,
                );
                let mut update = JobUpdate {
                    fit_score: Some(score),
                    job_analysis: Some(narrative),
                    sustainability_keyword_matches: Some(screen.matches),
                    ..Default::default()
                };
                if row.bad_analysis {
                    update.bad_analysis = Some(false);
                }
                db.update_by_key(&row.key(), &update)?;
                analyzed += 1;
                consecutive_failures = 0;

                if score == FitScore::VeryGoodFit {
                    info!(
                        title = %row.job_title,
                        company = %row.company_name,
                        "Very good fit found, generating artifacts immediately"
                    );
                    if let Some(refreshed) = db.get_by_key(&row.key())? {
                        if let Err(e) = artifacts::process_record(
                            db,
                            generator,
                            artifact_store,
                            profile,
                            &refreshed,
                            ctx,
                        ) {
                            warn!(error = %e, "Inline artifact generation failed");
                        }
                    }
                } else if matches!(score, FitScore::GoodFit | FitScore::ModerateFit) {
                    info!(score = score.as_str(), title = %row.job_title, company = %row.company_name, "Scored job");
                }
            }
            Err(e) if e.is_rate_limit() => {
                ctx.rate_limit_hit = true;
                warn!("Rate limit hit during analysis, aborting remaining batch for this cycle");
                break;
            }
            Err(e) => {
                warn!(title = %row.job_title, error = %e, "Job analysis failed");
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!(
                        failures = consecutive_failures,
                        "Stopping analysis after consecutive failures"
                    );
                    break;
                }
            }
        }
    }

    for gate in GATES {
        if let Some(count) = skip_counts.get(gate.name) {
            info!(
                gate = gate.name,
                count,
                example = %skip_examples[gate.name],
                "Jobs skipped in analysis"
            );
        }
    }
    info!(analyzed, "Fit analysis completed");
    Ok(analyzed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ServiceError, ServiceResult};
    use crate::config::FilterConfig;
    use crate::models::{
        BulkQualification, CompanyContext, ResumeArtifact, SearchIntent, SustainabilityVerdict,
    };
    use std::cell::Cell;

    enum Mode {
        Narrative(&'static str),
        RateLimited,
        Fail,
    }

    struct AnalystStub {
        mode: Mode,
        calls: Cell<usize>,
    }

    impl AnalystStub {
        fn new(mode: Mode) -> Self {
            Self {
                mode,
                calls: Cell::new(0),
            }
        }
    }

    impl FitAnalyst for AnalystStub {
        fn analyze(&self, _: &ResumeProfile, _: &JobContext) -> ServiceResult<String> {
            self.calls.set(self.calls.get() + 1);
            match self.mode {
                Mode::Narrative(text) => Ok(text.to_string()),
                Mode::RateLimited => Err(ServiceError::RateLimited),
                Mode::Fail => Err(ServiceError::Http {
                    status: 500,
                    body: "boom".into(),
                }),
            }
        }
        fn bulk_qualify(
            &self,
            _: &[(String, String)],
            _: &ResumeProfile,
        ) -> ServiceResult<BulkQualification> {
            panic!("analysis must not bulk qualify")
        }
        fn classify_sustainability_bulk(
            &self,
            _: &[CompanyContext],
        ) -> ServiceResult<HashMap<String, SustainabilityVerdict>> {
            panic!("analysis must not classify sustainability")
        }
        fn generate_search_parameters(
            &self,
            _: &ResumeProfile,
        ) -> ServiceResult<Vec<SearchIntent>> {
            panic!("analysis must not generate search parameters")
        }
    }

    struct GeneratorStub {
        resume_calls: Cell<usize>,
        cover_letter_calls: Cell<usize>,
    }

    impl GeneratorStub {
        fn new() -> Self {
            Self {
                resume_calls: Cell::new(0),
                cover_letter_calls: Cell::new(0),
            }
        }
    }

    impl ArtifactGenerator for GeneratorStub {
        fn generate_resume(
            &self,
            _: &ResumeProfile,
            _: &JobContext,
            _: Option<&str>,
            _: Option<&str>,
        ) -> ServiceResult<ResumeArtifact> {
            self.resume_calls.set(self.resume_calls.get() + 1);
            Ok(ResumeArtifact {
                resume_json: "{}".into(),
                filename: "resume.pdf".into(),
                pdf_bytes: b"pdf".to_vec(),
            })
        }
        fn generate_cover_letter(
            &self,
            _: &ResumeProfile,
            _: &JobContext,
            _: Option<&str>,
            _: Option<&str>,
        ) -> ServiceResult<String> {
            self.cover_letter_calls.set(self.cover_letter_calls.get() + 1);
            Ok("Dear team,".into())
        }
    }

    fn profile() -> ResumeProfile {
        ResumeProfile::from_value(serde_json::json!({
            "personal": {"full_name": "Ada Lovelace"}
        }))
        .unwrap()
    }

    fn eligible_record(url: &str, company: &str) -> JobRecord {
        let mut record =
            JobRecord::new_collected(url, company, "Engineer", "Berlin", 1, "A fine job.");
        record.company_overview = "A fine company doing fine things.".into();
        record
    }

    fn setup() -> (
        Database,
        ArtifactStore,
        FilterStore,
        tempfile::TempDir,
        tempfile::NamedTempFile,
    ) {
        let db = Database::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let artifact_store = ArtifactStore::open(dir.path()).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        let filter_store = FilterStore::new(file.path().to_path_buf());
        filter_store.save(&FilterConfig::default()).unwrap();
        (db, artifact_store, filter_store, dir, file)
    }

    const SETTINGS: AnalysisSettings = AnalysisSettings {
        check_sustainability: false,
    };
    const SUSTAINABILITY_SETTINGS: AnalysisSettings = AnalysisSettings {
        check_sustainability: true,
    };

    #[test]
    fn test_expired_gate_wins_over_missing_description() {
        let mut record = JobRecord::new_collected("u1", "Acme", "Engineer", "", 5, "");
        record.expired = true;
        assert!(record.job_description.is_empty());
        assert_eq!(first_gate(&record, &SETTINGS), Some("Job posting expired"));
    }

    #[test]
    fn test_gate_order_follows_declaration() {
        let mut record = JobRecord::new_collected("u1", "Acme", "Engineer", "", 5, "");
        assert_eq!(first_gate(&record, &SETTINGS), Some("Missing job description"));

        record.job_description = "jd".into();
        assert_eq!(first_gate(&record, &SETTINGS), Some("Missing company overview"));

        record.company_overview = "co".into();
        assert_eq!(first_gate(&record, &SETTINGS), None);
        assert_eq!(
            first_gate(&record, &SUSTAINABILITY_SETTINGS),
            Some("Sustainability pending")
        );

        record.sustainable = Some(false);
        assert_eq!(
            first_gate(&record, &SUSTAINABILITY_SETTINGS),
            Some("Company marked unsustainable")
        );

        record.sustainable = Some(true);
        record.applied = true;
        assert_eq!(first_gate(&record, &SUSTAINABILITY_SETTINGS), Some("Already applied"));

        record.applied = false;
        record.fit_score = Some(FitScore::PoorFit);
        assert_eq!(first_gate(&record, &SUSTAINABILITY_SETTINGS), Some("Already scored"));

        // Bad-analysis override reopens the record.
        record.bad_analysis = true;
        assert_eq!(first_gate(&record, &SUSTAINABILITY_SETTINGS), None);
    }

    #[test]
    fn test_parse_fit_score_first_phrase_wins() {
        assert_eq!(
            parse_fit_score("Overall this is a Very good fit for the candidate."),
            FitScore::VeryGoodFit
        );
        assert_eq!(parse_fit_score("Good fit overall."), FitScore::GoodFit);
        assert_eq!(parse_fit_score("Sadly a Very poor fit."), FitScore::VeryPoorFit);
        assert_eq!(parse_fit_score("No clear verdict here."), FitScore::QuestionableFit);
    }

    #[test]
    fn test_analysis_writes_score_and_clears_bad_analysis() {
        let (db, artifact_store, filter_store, _dir, _file) = setup();
        let mut record = eligible_record("u1", "Acme");
        record.bad_analysis = true;
        record.fit_score = Some(FitScore::PoorFit);
        db.insert_new_records(&[record]).unwrap();
        let analyst = AnalystStub::new(Mode::Narrative("Looks like a Good fit to me."));
        let generator = GeneratorStub::new();

        let mut ctx = CycleContext::default();
        let analyzed = run_fit_analysis(
            &db,
            &analyst,
            &generator,
            &artifact_store,
            &filter_store,
            &profile(),
            &SETTINGS,
            None,
            &mut ctx,
        )
        .unwrap();

        assert_eq!(analyzed, 1);
        let row = db.get_by_key(&JobKey::new("u1", "Acme")).unwrap().unwrap();
        assert_eq!(row.fit_score, Some(FitScore::GoodFit));
        assert_eq!(row.fit_score_rank, FitScore::GoodFit.rank());
        assert!(!row.bad_analysis);
        assert!(row.job_analysis.contains("Good fit"));
    }

    #[test]
    fn test_very_good_fit_triggers_inline_artifacts() {
        let (db, artifact_store, filter_store, _dir, _file) = setup();
        db.insert_new_records(&[eligible_record("u1", "Acme")]).unwrap();
        let analyst = AnalystStub::new(Mode::Narrative("A rare Very good fit."));
        let generator = GeneratorStub::new();

        let mut ctx = CycleContext::default();
        run_fit_analysis(
            &db,
            &analyst,
            &generator,
            &artifact_store,
            &filter_store,
            &profile(),
            &SETTINGS,
            None,
            &mut ctx,
        )
        .unwrap();

        assert_eq!(generator.resume_calls.get(), 1);
        assert_eq!(generator.cover_letter_calls.get(), 1);
        let row = db.get_by_key(&JobKey::new("u1", "Acme")).unwrap().unwrap();
        assert_eq!(row.fit_score, Some(FitScore::VeryGoodFit));
        assert!(!row.tailored_resume_ref.is_empty());
    }

    #[test]
    fn test_rate_limit_aborts_remaining_batch() {
        let (db, artifact_store, filter_store, _dir, _file) = setup();
        db.insert_new_records(&[eligible_record("u1", "Acme"), eligible_record("u2", "Beta")])
            .unwrap();
        let analyst = AnalystStub::new(Mode::RateLimited);
        let generator = GeneratorStub::new();

        let mut ctx = CycleContext::default();
        let analyzed = run_fit_analysis(
            &db,
            &analyst,
            &generator,
            &artifact_store,
            &filter_store,
            &profile(),
            &SETTINGS,
            None,
            &mut ctx,
        )
        .unwrap();

        assert_eq!(analyzed, 0);
        assert_eq!(analyst.calls.get(), 1);
        assert!(ctx.rate_limit_hit);
        // Records are left unmodified for retry next cycle.
        for row in db.get_all().unwrap() {
            assert_eq!(row.fit_score, None);
        }
    }

    #[test]
    fn test_consecutive_failures_trip_circuit_breaker() {
        let (db, artifact_store, filter_store, _dir, _file) = setup();
        let records: Vec<JobRecord> = (0..7)
            .map(|i| eligible_record(&format!("u{i}"), &format!("Company {i}")))
            .collect();
        db.insert_new_records(&records).unwrap();
        let analyst = AnalystStub::new(Mode::Fail);
        let generator = GeneratorStub::new();

        let mut ctx = CycleContext::default();
        let analyzed = run_fit_analysis(
            &db,
            &analyst,
            &generator,
            &artifact_store,
            &filter_store,
            &profile(),
            &SETTINGS,
            None,
            &mut ctx,
        )
        .unwrap();

        assert_eq!(analyzed, 0);
        assert_eq!(analyst.calls.get(), MAX_CONSECUTIVE_FAILURES);
        assert!(!ctx.rate_limit_hit);
    }

    #[test]
    fn test_scored_records_are_not_reanalyzed() {
        let (db, artifact_store, filter_store, _dir, _file) = setup();
        let mut record = eligible_record("u1", "Acme");
        record.fit_score = Some(FitScore::ModerateFit);
        db.insert_new_records(&[record]).unwrap();
        let analyst = AnalystStub::new(Mode::Narrative("Good fit"));
        let generator = GeneratorStub::new();

        let mut ctx = CycleContext::default();
        let analyzed = run_fit_analysis(
            &db,
            &analyst,
            &generator,
            &artifact_store,
            &filter_store,
            &profile(),
            &SETTINGS,
            None,
            &mut ctx,
        )
        .unwrap();

        assert_eq!(analyzed, 0);
        assert_eq!(analyst.calls.get(), 0);
        let row = db.get_by_key(&JobKey::new("u1", "Acme")).unwrap().unwrap();
        assert_eq!(row.fit_score, Some(FitScore::ModerateFit));
    }
}
