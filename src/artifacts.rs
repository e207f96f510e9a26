use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::clients::{ArtifactGenerator, ServiceError};
use crate::config::ResumeProfile;
use crate::cycle::CycleContext;
use crate::db::{Database, JobUpdate};
use crate::models::{JobContext, JobKey, JobRecord};

/// Local filesystem home for generated resumes and cover letters.
pub struct ArtifactStore {
    resumes_dir: PathBuf,
    cover_letters_dir: PathBuf,
}

impl ArtifactStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let resumes_dir = data_dir.join("resumes");
        let cover_letters_dir = data_dir.join("cover_letters");
        std::fs::create_dir_all(&resumes_dir)
            .with_context(|| format!("Failed to create {}", resumes_dir.display()))?;
        std::fs::create_dir_all(&cover_letters_dir)
            .with_context(|| format!("Failed to create {}", cover_letters_dir.display()))?;
        Ok(Self {
            resumes_dir,
            cover_letters_dir,
        })
    }

    pub fn save_resume(&self, filename: &str, pdf_bytes: &[u8]) -> Result<String> {
        let path = self.resumes_dir.join(sanitize_filename(filename));
        std::fs::write(&path, pdf_bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path.display().to_string())
    }

    pub fn save_cover_letter(&self, filename: &str, text: &str) -> Result<String> {
        let path = self.cover_letters_dir.join(sanitize_filename(filename));
        std::fs::write(&path, text)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path.display().to_string())
    }

    pub fn delete_resume(&self, reference: &str) {
        if reference.is_empty() {
            return;
        }
        match std::fs::remove_file(reference) {
            Ok(()) => info!(path = %reference, "Deleted resume artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %reference, error = %e, "Could not delete resume artifact"),
        }
    }
}

fn sanitize_filename(filename: &str) -> String {
    filename.replace(['/', '\\'], "_")
}

fn cover_letter_filename(profile: &ResumeProfile, company_name: &str) -> String {
    format!(
        "{}_cover_letter_{}.txt",
        profile.full_name.replace(' ', "_"),
        company_name.replace(' ', "_")
    )
}

/// Generate or refresh application artifacts for every record scoring
/// GoodFit or better. Retired records (applied, flagged, expired) get their
/// artifacts deleted instead of new work. Returns the number of records for
/// which any artifact work was done.
pub fn run_artifact_generation(
    db: &Database,
    generator: &dyn ArtifactGenerator,
    store: &ArtifactStore,
    profile: &ResumeProfile,
    target: Option<&HashSet<JobKey>>,
    ctx: &mut CycleContext,
) -> Result<usize> {
    let rows = db.get_all()?;
    let mut processed = 0;

    for row in &rows {
        if let Some(target) = target {
            if !target.contains(&row.key()) {
                continue;
            }
        }
        let Some(score) = row.fit_score else {
            continue;
        };
        if !score.qualifies_for_artifacts() {
            continue;
        }

        if row.is_excluded() {
            if !row.tailored_resume_ref.is_empty() {
                store.delete_resume(&row.tailored_resume_ref);
                db.update_by_key(
                    &row.key(),
                    &JobUpdate {
                        tailored_resume_ref: Some(String::new()),
                        tailored_resume_payload: Some(String::new()),
                        ..Default::default()
                    },
                )?;
            }
            continue;
        }

        if process_record(db, generator, store, profile, row, ctx)? {
            processed += 1;
        }
    }

    info!(processed, "Artifact generation completed");
    Ok(processed)
}

/// Resume and cover letter are independent sub-operations; either, both, or
/// neither may produce work in a given pass.
pub fn process_record(
    db: &Database,
    generator: &dyn ArtifactGenerator,
    store: &ArtifactStore,
    profile: &ResumeProfile,
    row: &JobRecord,
    ctx: &mut CycleContext,
) -> Result<bool> {
    let cover_letter_done = process_cover_letter(db, generator, store, profile, row, ctx)?;
    let resume_done = process_resume(db, generator, store, profile, row, ctx)?;
    Ok(cover_letter_done || resume_done)
}

fn process_cover_letter(
    db: &Database,
    generator: &dyn ArtifactGenerator,
    store: &ArtifactStore,
    profile: &ResumeProfile,
    row: &JobRecord,
    ctx: &mut CycleContext,
) -> Result<bool> {
    let key = row.key();
    let context = JobContext::from_record(row);

    if !row.cl_feedback.is_empty() && !row.cl_feedback_addressed {
        info!(title = %row.job_title, company = %row.company_name, "Regenerating cover letter with feedback");
        let current = (!row.tailored_cover_letter.is_empty())
            .then_some(row.tailored_cover_letter.as_str());
        match generator.generate_cover_letter(profile, &context, current, Some(&row.cl_feedback)) {
            Ok(text) => {
                let filename = cover_letter_filename(profile, &row.company_name);
                if let Err(e) = store.save_cover_letter(&filename, &text) {
                    warn!(error = %e, "Could not save cover letter");
                    return Ok(false);
                }
                db.update_by_key(
                    &key,
                    &JobUpdate {
                        tailored_cover_letter: Some(text),
                        cl_feedback_addressed: Some(true),
                        ..Default::default()
                    },
                )?;
                return Ok(true);
            }
            Err(e) => {
                note_generation_error("cover letter", &row.job_title, e, ctx);
                return Ok(false);
            }
        }
    }

    if row.tailored_cover_letter.is_empty() {
        info!(title = %row.job_title, company = %row.company_name, "Generating cover letter");
        match generator.generate_cover_letter(profile, &context, None, None) {
            Ok(text) => {
                let filename = cover_letter_filename(profile, &row.company_name);
                if let Err(e) = store.save_cover_letter(&filename, &text) {
                    warn!(error = %e, "Could not save cover letter");
                    return Ok(false);
                }
                db.update_by_key(
                    &key,
                    &JobUpdate {
                        tailored_cover_letter: Some(text),
                        ..Default::default()
                    },
                )?;
                return Ok(true);
            }
            Err(e) => {
                note_generation_error("cover letter", &row.job_title, e, ctx);
            }
        }
    }

    Ok(false)
}

fn process_resume(
    db: &Database,
    generator: &dyn ArtifactGenerator,
    store: &ArtifactStore,
    profile: &ResumeProfile,
    row: &JobRecord,
    ctx: &mut CycleContext,
) -> Result<bool> {
    let key = row.key();
    let context = JobContext::from_record(row);

    if !row.resume_feedback.is_empty() && !row.resume_feedback_addressed {
        info!(title = %row.job_title, company = %row.company_name, "Regenerating resume with feedback");
        let current = (!row.tailored_resume_payload.is_empty())
            .then_some(row.tailored_resume_payload.as_str());
        match generator.generate_resume(profile, &context, current, Some(&row.resume_feedback)) {
            Ok(artifact) => {
                let reference = match store.save_resume(&artifact.filename, &artifact.pdf_bytes) {
                    Ok(reference) => reference,
                    Err(e) => {
                        warn!(error = %e, "Could not save resume");
                        return Ok(false);
                    }
                };
                db.update_by_key(
                    &key,
                    &JobUpdate {
                        tailored_resume_ref: Some(reference),
                        tailored_resume_payload: Some(artifact.resume_json),
                        resume_feedback_addressed: Some(true),
                        ..Default::default()
                    },
                )?;
                return Ok(true);
            }
            Err(e) => {
                note_generation_error("resume", &row.job_title, e, ctx);
                return Ok(false);
            }
        }
    }

    if row.tailored_resume_ref.is_empty() {
        info!(title = %row.job_title, company = %row.company_name, "Generating tailored resume");
        match generator.generate_resume(profile, &context, None, None) {
            Ok(artifact) => {
                let reference = match store.save_resume(&artifact.filename, &artifact.pdf_bytes) {
                    Ok(reference) => reference,
                    Err(e) => {
                        warn!(error = %e, "Could not save resume");
                        return Ok(false);
                    }
                };
                db.update_by_key(
                    &key,
                    &JobUpdate {
                        tailored_resume_ref: Some(reference),
                        tailored_resume_payload: Some(artifact.resume_json),
                        ..Default::default()
                    },
                )?;
                return Ok(true);
            }
            Err(e) => {
                note_generation_error("resume", &row.job_title, e, ctx);
            }
        }
    }

    Ok(false)
}

fn note_generation_error(kind: &str, job_title: &str, error: ServiceError, ctx: &mut CycleContext) {
    if error.is_rate_limit() {
        ctx.rate_limit_hit = true;
        warn!(kind, job = %job_title, "Rate limit hit during artifact generation, will retry next cycle");
    } else {
        warn!(kind, job = %job_title, error = %error, "Artifact generation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ServiceResult;
    use crate::models::{FitScore, ResumeArtifact};
    use std::cell::Cell;

    struct GeneratorStub {
        rate_limited: bool,
        resume_calls: Cell<usize>,
        cover_letter_calls: Cell<usize>,
    }

    impl GeneratorStub {
        fn new() -> Self {
            Self {
                rate_limited: false,
                resume_calls: Cell::new(0),
                cover_letter_calls: Cell::new(0),
            }
        }

        fn rate_limited() -> Self {
            Self {
                rate_limited: true,
                ..Self::new()
            }
        }
    }

    impl ArtifactGenerator for GeneratorStub {
        fn generate_resume(
            &self,
            _: &ResumeProfile,
            job: &JobContext,
            _current: Option<&str>,
            feedback: Option<&str>,
        ) -> ServiceResult<ResumeArtifact> {
            self.resume_calls.set(self.resume_calls.get() + 1);
            if self.rate_limited {
                return Err(ServiceError::RateLimited);
            }
            Ok(ResumeArtifact {
                resume_json: format!("{{\"for\":\"{}\"}}", job.company_name),
                filename: format!("resume_{}.pdf", job.company_name.replace(' ', "_")),
                pdf_bytes: if feedback.is_some() {
                    b"revised pdf".to_vec()
                } else {
                    b"pdf".to_vec()
                },
            })
        }

        fn generate_cover_letter(
            &self,
            _: &ResumeProfile,
            job: &JobContext,
            _current: Option<&str>,
            feedback: Option<&str>,
        ) -> ServiceResult<String> {
            self.cover_letter_calls.set(self.cover_letter_calls.get() + 1);
            if self.rate_limited {
                return Err(ServiceError::RateLimited);
            }
            match feedback {
                Some(feedback) => Ok(format!("Dear {}, (revised: {feedback})", job.company_name)),
                None => Ok(format!("Dear {},", job.company_name)),
            }
        }
    }

    fn profile() -> ResumeProfile {
        ResumeProfile::from_value(serde_json::json!({
            "personal": {"full_name": "Ada Lovelace"}
        }))
        .unwrap()
    }

    fn good_fit_record(url: &str, company: &str) -> JobRecord {
        let mut record =
            JobRecord::new_collected(url, company, "Engineer", "Berlin", 1, "A fine job.");
        record.fit_score = Some(FitScore::GoodFit);
        record
    }

    fn setup() -> (Database, ArtifactStore, tempfile::TempDir) {
        let db = Database::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        (db, store, dir)
    }

    #[test]
    fn test_initial_generation_creates_both_artifacts() {
        let (db, store, _dir) = setup();
        db.insert_new_records(&[good_fit_record("u1", "Acme")]).unwrap();
        let generator = GeneratorStub::new();

        let mut ctx = CycleContext::default();
        let processed =
            run_artifact_generation(&db, &generator, &store, &profile(), None, &mut ctx).unwrap();

        assert_eq!(processed, 1);
        let row = db.get_by_key(&JobKey::new("u1", "Acme")).unwrap().unwrap();
        assert!(!row.tailored_resume_ref.is_empty());
        assert!(std::path::Path::new(&row.tailored_resume_ref).exists());
        assert_eq!(row.tailored_resume_payload, "{\"for\":\"Acme\"}");
        assert_eq!(row.tailored_cover_letter, "Dear Acme,");
    }

    #[test]
    fn test_existing_artifacts_are_not_regenerated() {
        let (db, store, _dir) = setup();
        let mut record = good_fit_record("u1", "Acme");
        record.tailored_resume_ref = "somewhere.pdf".into();
        record.tailored_cover_letter = "Dear Acme,".into();
        db.insert_new_records(&[record]).unwrap();
        let generator = GeneratorStub::new();

        let mut ctx = CycleContext::default();
        let processed =
            run_artifact_generation(&db, &generator, &store, &profile(), None, &mut ctx).unwrap();

        assert_eq!(processed, 0);
        assert_eq!(generator.resume_calls.get(), 0);
        assert_eq!(generator.cover_letter_calls.get(), 0);
    }

    #[test]
    fn test_feedback_triggers_regeneration_and_marks_addressed() {
        let (db, store, _dir) = setup();
        let mut record = good_fit_record("u1", "Acme");
        record.tailored_resume_ref = "old.pdf".into();
        record.tailored_resume_payload = "{}".into();
        record.tailored_cover_letter = "Dear Acme,".into();
        record.cl_feedback = "Mention the anvil project".into();
        db.insert_new_records(&[record]).unwrap();
        let generator = GeneratorStub::new();

        let mut ctx = CycleContext::default();
        let processed =
            run_artifact_generation(&db, &generator, &store, &profile(), None, &mut ctx).unwrap();

        assert_eq!(processed, 1);
        assert_eq!(generator.cover_letter_calls.get(), 1);
        assert_eq!(generator.resume_calls.get(), 0);
        let row = db.get_by_key(&JobKey::new("u1", "Acme")).unwrap().unwrap();
        assert!(row.cl_feedback_addressed);
        assert!(row.tailored_cover_letter.contains("revised"));
    }

    #[test]
    fn test_retired_record_loses_artifacts() {
        let (db, store, _dir) = setup();
        let reference = store.save_resume("stale.pdf", b"pdf").unwrap();
        let mut record = good_fit_record("u1", "Acme");
        record.tailored_resume_ref = reference.clone();
        record.tailored_resume_payload = "{}".into();
        record.expired = true;
        db.insert_new_records(&[record]).unwrap();
        let generator = GeneratorStub::new();

        let mut ctx = CycleContext::default();
        let processed =
            run_artifact_generation(&db, &generator, &store, &profile(), None, &mut ctx).unwrap();

        assert_eq!(processed, 0);
        assert_eq!(generator.resume_calls.get(), 0);
        assert!(!std::path::Path::new(&reference).exists());
        let row = db.get_by_key(&JobKey::new("u1", "Acme")).unwrap().unwrap();
        assert!(row.tailored_resume_ref.is_empty());
        assert!(row.tailored_resume_payload.is_empty());
    }

    #[test]
    fn test_rate_limit_leaves_record_unmodified_for_retry() {
        let (db, store, _dir) = setup();
        db.insert_new_records(&[good_fit_record("u1", "Acme")]).unwrap();
        let generator = GeneratorStub::rate_limited();

        let mut ctx = CycleContext::default();
        let processed =
            run_artifact_generation(&db, &generator, &store, &profile(), None, &mut ctx).unwrap();

        assert_eq!(processed, 0);
        assert!(ctx.rate_limit_hit);
        let row = db.get_by_key(&JobKey::new("u1", "Acme")).unwrap().unwrap();
        assert!(row.tailored_resume_ref.is_empty());
        assert!(row.tailored_cover_letter.is_empty());
    }

    #[test]
    fn test_below_good_scores_are_skipped() {
        let (db, store, _dir) = setup();
        let mut record = good_fit_record("u1", "Acme");
        record.fit_score = Some(FitScore::ModerateFit);
        db.insert_new_records(&[record]).unwrap();
        let generator = GeneratorStub::new();

        let mut ctx = CycleContext::default();
        let processed =
            run_artifact_generation(&db, &generator, &store, &profile(), None, &mut ctx).unwrap();
        assert_eq!(processed, 0);
        assert_eq!(generator.resume_calls.get(), 0);
    }
}
