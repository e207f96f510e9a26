use regex::Regex;
use std::sync::OnceLock;

use crate::config::FilterConfig;
use crate::models::FitScore;

pub const UNSUSTAINABLE_COMPANY_REASON: &str =
    "Unsustainable company (weapons/fossil fuels/harmful industries)";

/// Cleans up a job title: listing pages often repeat the title on a wrapped
/// second line, which would otherwise defeat natural-key dedup.
pub fn normalize_job_title(job_title: &str) -> String {
    let job_title = job_title.trim();
    if job_title.is_empty() {
        return String::new();
    }

    let lines: Vec<&str> = job_title.split('\n').collect();
    if lines.len() == 1 {
        return job_title.to_string();
    }

    let first_line = lines[0];
    let is_duplicate = lines.iter().all(|l| *l == first_line)
        || lines[1].contains(first_line)
        || first_line.contains(lines[1]);

    if is_duplicate {
        first_line.to_string()
    } else {
        job_title.to_string()
    }
}

/// Normalize a company name for case-insensitive matching and caching.
pub fn normalize_company_name(company_name: &str) -> String {
    company_name.trim().to_lowercase()
}

/// Extract "city, country" from a raw location string.
/// "Belgrade, Serbia · Reposted 6 minutes ago" -> "Belgrade, Serbia"
pub fn parse_location(raw_location: &str) -> String {
    raw_location
        .split('·')
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Priority score for sorting, from the configured location priority map.
/// Lower is more preferred; unmatched locations fall after every configured one.
pub fn location_priority(location: &str, config: &FilterConfig) -> i64 {
    let location_lower = location.to_lowercase();
    let mut entries: Vec<(&String, &i64)> = config.location_priorities.iter().collect();
    entries.sort_by_key(|(_, priority)| **priority);
    for (name, priority) in entries {
        if location_lower.contains(&name.to_lowercase()) {
            return *priority;
        }
    }
    config
        .location_priorities
        .values()
        .max()
        .map(|max| max + 1)
        .unwrap_or(5)
}

/// Extract the numeric job ID from a listing URL.
pub fn extract_job_id(url: &str) -> Option<String> {
    static VIEW_RE: OnceLock<Regex> = OnceLock::new();
    static PARAM_RE: OnceLock<Regex> = OnceLock::new();
    let view = VIEW_RE.get_or_init(|| Regex::new(r"view/(\d+)").unwrap());
    let param = PARAM_RE.get_or_init(|| Regex::new(r"currentJobId=(\d+)").unwrap());

    view.captures(url)
        .or_else(|| param.captures(url))
        .map(|caps| caps[1].to_string())
}

/// Evaluate the keyword skip-lists in fixed priority order. Title checks win
/// over location and company checks. Returns the skip reason, or None.
pub fn apply_keyword_filters(
    job_title: &str,
    company_name: &str,
    raw_location: &str,
    config: &FilterConfig,
) -> Option<&'static str> {
    let title_lower = job_title.to_lowercase();
    let location_lower = raw_location.to_lowercase();
    let company_normalized = normalize_company_name(company_name);

    let skip_title = config
        .job_title_skip_keywords
        .iter()
        .any(|kw| title_lower.contains(&kw.to_lowercase()));
    let skip_title_word = config.job_title_skip_words.iter().any(|kw| {
        let kw = kw.to_lowercase();
        title_lower.split_whitespace().any(|word| word == kw)
    });
    let skip_location = config
        .location_skip_keywords
        .iter()
        .any(|kw| location_lower.contains(&kw.to_lowercase()));
    let skip_company = config
        .company_skip_keywords
        .iter()
        .any(|kw| company_normalized.contains(&kw.to_lowercase()));

    if skip_title || skip_title_word {
        Some("Job title contains unwanted keyword")
    } else if skip_location {
        Some("Location not preferred")
    } else if skip_company {
        Some("Company name contains unwanted keyword")
    } else {
        None
    }
}

/// Outcome of the sustainability keyword screen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SustainabilityScreen {
    pub skip: bool,
    pub reason: Option<String>,
    /// Audit summary of what matched, e.g. "positive: solar, climate".
    pub matches: String,
}

/// Negative keywords force a skip; positive matches are only collected for
/// the audit trail. With neither list configured this is always a no-op.
pub fn apply_sustainability_keyword_filters(
    job_title: &str,
    company_name: &str,
    raw_location: &str,
    company_overview: &str,
    config: &FilterConfig,
) -> SustainabilityScreen {
    let keywords = &config.sustainability_keywords;
    if keywords.negative.is_empty() && keywords.positive.is_empty() {
        return SustainabilityScreen::default();
    }

    let mut haystacks = vec![
        job_title.to_lowercase(),
        normalize_company_name(company_name),
        raw_location.to_lowercase(),
    ];
    if keywords.scan_overview {
        haystacks.push(company_overview.to_lowercase());
    }

    for keyword in &keywords.negative {
        let kw = keyword.to_lowercase();
        if kw.is_empty() {
            continue;
        }
        if haystacks.iter().any(|h| h.contains(&kw)) {
            return SustainabilityScreen {
                skip: true,
                reason: Some(format!("Matched negative sustainability keyword '{keyword}'")),
                matches: format!("negative: {keyword}"),
            };
        }
    }

    let mut positives: Vec<&str> = Vec::new();
    for keyword in &keywords.positive {
        let kw = keyword.to_lowercase();
        if !kw.is_empty() && haystacks.iter().any(|h| h.contains(&kw)) {
            positives.push(keyword);
        }
    }

    SustainabilityScreen {
        skip: false,
        reason: None,
        matches: if positives.is_empty() {
            String::new()
        } else {
            format!("positive: {}", positives.join(", "))
        },
    }
}

/// Combined screening verdict for one candidate record.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    pub fit_score: Option<FitScore>,
    pub reason: String,
    pub sustainable: Option<bool>,
    pub bulk_filtered: bool,
    pub keyword_matches: String,
}

impl FilterResult {
    fn undecided(sustainable: Option<bool>, keyword_matches: String) -> Self {
        Self {
            fit_score: None,
            reason: String::new(),
            sustainable,
            bulk_filtered: false,
            keyword_matches,
        }
    }
}

/// Run the full screening sequence: keyword filters, then sustainability
/// keywords, then (when enabled and an overview is present) an external
/// sustainability classification supplied by `sustainability_lookup` so this
/// engine itself stays free of I/O. First disqualifier wins.
pub fn classify(
    job_title: &str,
    company_name: &str,
    raw_location: &str,
    company_overview: &str,
    job_description: &str,
    config: &FilterConfig,
    check_sustainability: bool,
    sustainability_lookup: impl FnOnce(&str, &str, &str) -> Option<bool>,
) -> FilterResult {
    if let Some(reason) = apply_keyword_filters(job_title, company_name, raw_location, config) {
        return FilterResult {
            fit_score: Some(FitScore::PoorFit),
            reason: reason.to_string(),
            sustainable: None,
            bulk_filtered: true,
            keyword_matches: String::new(),
        };
    }

    let screen = apply_sustainability_keyword_filters(
        job_title,
        company_name,
        raw_location,
        company_overview,
        config,
    );
    if screen.skip {
        return FilterResult {
            fit_score: Some(FitScore::VeryPoorFit),
            reason: screen.reason.unwrap_or_default(),
            sustainable: None,
            bulk_filtered: true,
            keyword_matches: screen.matches,
        };
    }

    let mut sustainable = None;
    if check_sustainability && !company_overview.trim().is_empty() {
        sustainable = sustainability_lookup(company_name, company_overview, job_description);
        if sustainable == Some(false) {
            return FilterResult {
                fit_score: Some(FitScore::VeryPoorFit),
                reason: UNSUSTAINABLE_COMPANY_REASON.to_string(),
                sustainable,
                bulk_filtered: true,
                keyword_matches: screen.matches,
            };
        }
    }

    FilterResult::undecided(sustainable, screen.matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_skips() -> FilterConfig {
        FilterConfig {
            job_title_skip_keywords: vec!["wordpress".into()],
            job_title_skip_words: vec!["senior".into()],
            company_skip_keywords: vec!["staffing".into()],
            location_skip_keywords: vec!["on-site".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_title_filter_wins_over_location_and_company() {
        let config = config_with_skips();
        let reason = apply_keyword_filters(
            "WordPress Developer",
            "Acme Staffing",
            "Paris (On-site)",
            &config,
        );
        assert_eq!(reason, Some("Job title contains unwanted keyword"));

        let reason = apply_keyword_filters("Rust Developer", "Acme Staffing", "Paris (On-site)", &config);
        assert_eq!(reason, Some("Location not preferred"));

        let reason = apply_keyword_filters("Rust Developer", "Acme Staffing", "Paris", &config);
        assert_eq!(reason, Some("Company name contains unwanted keyword"));
    }

    #[test]
    fn test_title_word_list_matches_whole_words_only() {
        let config = config_with_skips();
        assert!(apply_keyword_filters("Senior Engineer", "Acme", "", &config).is_some());
        // "seniority" contains the word but is not the word.
        assert!(apply_keyword_filters("Seniority Analyst", "Acme", "", &config).is_none());
    }

    #[test]
    fn test_sustainability_negative_keyword_skips() {
        let mut config = FilterConfig::default();
        config.sustainability_keywords.negative = vec!["defense".into()];
        config.sustainability_keywords.positive = vec!["solar".into()];

        let screen =
            apply_sustainability_keyword_filters("Engineer", "Orbital Defense Corp", "", "", &config);
        assert!(screen.skip);
        assert!(screen.reason.unwrap().contains("defense"));
        assert_eq!(screen.matches, "negative: defense");
    }

    #[test]
    fn test_sustainability_positive_matches_do_not_skip() {
        let mut config = FilterConfig::default();
        config.sustainability_keywords.negative = vec!["defense".into()];
        config.sustainability_keywords.positive = vec!["solar".into(), "climate".into()];

        let screen = apply_sustainability_keyword_filters(
            "Climate Data Engineer",
            "Solar Grid",
            "",
            "",
            &config,
        );
        assert!(!screen.skip);
        assert_eq!(screen.matches, "positive: solar, climate");
    }

    #[test]
    fn test_sustainability_unconfigured_is_no_op() {
        let screen = apply_sustainability_keyword_filters(
            "Engineer",
            "Acme",
            "",
            "",
            &FilterConfig::default(),
        );
        assert_eq!(screen, SustainabilityScreen::default());
    }

    #[test]
    fn test_overview_scanned_only_when_enabled() {
        let mut config = FilterConfig::default();
        config.sustainability_keywords.negative = vec!["fossil".into()];

        let overview = "We extract fossil fuels.";
        let screen =
            apply_sustainability_keyword_filters("Engineer", "Acme", "", overview, &config);
        assert!(!screen.skip);

        config.sustainability_keywords.scan_overview = true;
        let screen =
            apply_sustainability_keyword_filters("Engineer", "Acme", "", overview, &config);
        assert!(screen.skip);
    }

    #[test]
    fn test_classify_keyword_match_short_circuits() {
        let config = config_with_skips();
        let result = classify(
            "WordPress Developer",
            "Acme",
            "",
            "",
            "",
            &config,
            true,
            |_, _, _| panic!("external classification must not run after a keyword match"),
        );
        assert_eq!(result.fit_score, Some(FitScore::PoorFit));
        assert!(result.bulk_filtered);
    }

    #[test]
    fn test_classify_unsustainable_downgrades_to_very_poor() {
        let config = FilterConfig::default();
        let result = classify(
            "Engineer",
            "Oil Co",
            "",
            "Large fossil fuel extraction company",
            "",
            &config,
            true,
            |_, _, _| Some(false),
        );
        assert_eq!(result.fit_score, Some(FitScore::VeryPoorFit));
        assert_eq!(result.sustainable, Some(false));
        assert_eq!(result.reason, UNSUSTAINABLE_COMPANY_REASON);
    }

    #[test]
    fn test_classify_undecided_carries_sustainability() {
        let config = FilterConfig::default();
        let result = classify(
            "Engineer",
            "Solar Co",
            "",
            "Residential solar installer",
            "",
            &config,
            true,
            |_, _, _| Some(true),
        );
        assert_eq!(result.fit_score, None);
        assert_eq!(result.sustainable, Some(true));
        assert!(!result.bulk_filtered);
    }

    #[test]
    fn test_classify_skips_lookup_without_overview() {
        let config = FilterConfig::default();
        let result = classify("Engineer", "Acme", "", "", "", &config, true, |_, _, _| {
            panic!("no overview, no external classification")
        });
        assert_eq!(result.fit_score, None);
        assert_eq!(result.sustainable, None);
    }

    #[test]
    fn test_normalize_job_title_collapses_wrapped_duplicate() {
        assert_eq!(
            normalize_job_title("Backend Engineer\nBackend Engineer"),
            "Backend Engineer"
        );
        assert_eq!(
            normalize_job_title("Backend Engineer\nBackend Engineer with benefits"),
            "Backend Engineer"
        );
        assert_eq!(
            normalize_job_title("Backend Engineer\nRemote, Europe"),
            "Backend Engineer\nRemote, Europe"
        );
        assert_eq!(normalize_job_title("  plain  "), "plain");
    }

    #[test]
    fn test_location_priority_uses_config_and_default() {
        let mut config = FilterConfig::default();
        config.location_priorities.insert("berlin".into(), 1);
        config.location_priorities.insert("remote".into(), 2);

        assert_eq!(location_priority("Berlin, Germany", &config), 1);
        assert_eq!(location_priority("Remote (EU)", &config), 2);
        assert_eq!(location_priority("Oslo, Norway", &config), 3);
        assert_eq!(location_priority("Anywhere", &FilterConfig::default()), 5);
    }

    #[test]
    fn test_extract_job_id() {
        assert_eq!(
            extract_job_id("https://example.com/jobs/view/4355288971/?ref=x").as_deref(),
            Some("4355288971")
        );
        assert_eq!(
            extract_job_id("https://example.com/jobs/search/?currentJobId=123").as_deref(),
            Some("123")
        );
        assert_eq!(extract_job_id("https://example.com/jobs/"), None);
    }
}
