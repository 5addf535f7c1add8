use anyhow::{anyhow, Context, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::models::CapturedRecord;

// Candidate selectors per field, most specific first. Covers LinkedIn,
// Indeed, Greenhouse, Lever, Workday and generic job boards.
const POSITION_SELECTORS: &[&str] = &[
    ".job-details-jobs-unified-top-card__job-title",
    ".jobs-unified-top-card__job-title",
    ".top-card-layout__title",
    "h1[data-testid='jobsearch-JobInfoHeader-title']",
    ".jobsearch-JobInfoHeader-title",
    ".app-title",
    ".posting-headline h2",
    "[data-automation-id='jobPostingHeader']",
    "h1.job-title",
    "h1",
];

const COMPANY_SELECTORS: &[&str] = &[
    ".job-details-jobs-unified-top-card__company-name",
    ".jobs-unified-top-card__company-name",
    ".topcard__org-name-link",
    "[data-testid='inlineHeader-companyName']",
    "[data-company-name='true']",
    ".company-name",
    ".posting-categories .company",
    "[itemprop='hiringOrganization'] [itemprop='name']",
];

const LOCATION_SELECTORS: &[&str] = &[
    ".job-details-jobs-unified-top-card__bullet",
    ".jobs-unified-top-card__bullet",
    ".topcard__flavor--bullet",
    "[data-testid='inlineHeader-companyLocation']",
    "[data-testid='job-location']",
    ".location",
    ".posting-categories .location",
    "[itemprop='jobLocation']",
];

const SALARY_SELECTORS: &[&str] = &[
    ".salary-main-rail__data-body",
    ".compensation__salary",
    "#salaryInfoAndJobType",
    "[data-testid='jobsearch-OtherJobDetailsContainer'] .salary",
    ".salary",
    "[itemprop='baseSalary']",
];

const DESCRIPTION_SELECTORS: &[&str] = &[
    ".jobs-description__content",
    ".jobs-box__html-content",
    ".show-more-less-html__markup",
    ".description__text",
    "#jobDescriptionText",
    "#content .section-wrapper",
    "[data-automation-id='jobPostingDescription']",
    "[itemprop='description']",
    "article",
];

const MAX_DESCRIPTION_CHARS: usize = 5000;

/// Reads a captured page with ordered candidate selectors per field.
/// Fields that cannot be found come back empty.
pub struct FieldExtractor {
    position: Vec<Selector>,
    company: Vec<Selector>,
    location: Vec<Selector>,
    salary: Vec<Selector>,
    description: Vec<Selector>,
    salary_pattern: Option<Regex>,
}

fn compile(selectors: &[&str]) -> Vec<Selector> {
    selectors
        .iter()
        .filter_map(|s| match Selector::parse(s) {
            Ok(selector) => Some(selector),
            Err(e) => {
                warn!(selector = %s, error = ?e, "skipping unparsable selector");
                None
            }
        })
        .collect()
}

fn element_text(element: ElementRef) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn meta_content(document: &Html, query: &str) -> Option<String> {
    let selector = Selector::parse(query).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|content| !content.is_empty())
        .map(str::to_string)
}

/// Strip query string and fragment, which on job boards are tracking noise.
pub fn clean_tracking_url(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    let end = url.find(['?', '#']).unwrap_or(url.len());
    Some(url[..end].to_string())
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldExtractor {
    pub fn new() -> Self {
        Self {
            position: compile(POSITION_SELECTORS),
            company: compile(COMPANY_SELECTORS),
            location: compile(LOCATION_SELECTORS),
            salary: compile(SALARY_SELECTORS),
            description: compile(DESCRIPTION_SELECTORS),
            salary_pattern: Regex::new(
                r"\$\s?\d{2,3}(?:,\d{3})?(?:\.\d+)?\s?[kK]?(?:\s*(?:-|–|to)\s*\$?\s?\d{2,3}(?:,\d{3})?(?:\.\d+)?\s?[kK]?)?(?:\s*(?:/|per)\s*(?:year|yr|hour|hr))?",
            )
            .ok(),
        }
    }

    fn first_text(document: &Html, selectors: &[Selector]) -> Option<String> {
        for selector in selectors {
            for element in document.select(selector) {
                let text = element_text(element);
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
        None
    }

    /// Build a best-effort record from a page. `page_url` is used when the
    /// page carries no canonical link.
    pub fn extract(&self, html: &str, page_url: Option<&str>) -> CapturedRecord {
        let document = Html::parse_document(html);

        let position = Self::first_text(&document, &self.position)
            .or_else(|| meta_content(&document, "meta[property='og:title']"))
            .unwrap_or_default();

        let company = Self::first_text(&document, &self.company)
            .or_else(|| meta_content(&document, "meta[property='og:site_name']"))
            .unwrap_or_default();

        let location = Self::first_text(&document, &self.location);

        let salary = Self::first_text(&document, &self.salary).or_else(|| {
            let pattern = self.salary_pattern.as_ref()?;
            let body = Selector::parse("body").ok()?;
            let text = document.select(&body).next().map(element_text)?;
            pattern.find(&text).map(|m| m.as_str().trim().to_string())
        });

        let description = Self::first_text(&document, &self.description)
            .or_else(|| meta_content(&document, "meta[name='description']"))
            .map(|text| text.chars().take(MAX_DESCRIPTION_CHARS).collect::<String>());

        let canonical = Selector::parse("link[rel='canonical']")
            .ok()
            .and_then(|selector| {
                document
                    .select(&selector)
                    .filter_map(|el| el.value().attr("href"))
                    .next()
                    .map(str::to_string)
            });
        let job_url = canonical
            .as_deref()
            .or(page_url)
            .and_then(clean_tracking_url);

        debug!(%company, %position, has_url = job_url.is_some(), "extracted page fields");

        CapturedRecord {
            company,
            position,
            location,
            salary,
            job_url,
            description,
            ..Default::default()
        }
    }
}

/// Fetch a job page over HTTP.
pub async fn fetch_page(url: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .user_agent("Mozilla/5.0 (X11; Linux x86_64) hunt-relay")
        .build()?;
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;
    if !response.status().is_success() {
        return Err(anyhow!("Fetching {} failed with status {}", url, response.status()));
    }
    response
        .text()
        .await
        .with_context(|| format!("Failed to read body of {}", url))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINKEDIN_PAGE: &str = r#"
        <html><head>
            <link rel="canonical" href="https://www.linkedin.com/jobs/view/123?trk=abc">
        </head><body>
            <div class="job-details-jobs-unified-top-card__job-title"><h1>  Staff   Engineer </h1></div>
            <div class="job-details-jobs-unified-top-card__company-name"><a>Acme Corp</a></div>
            <span class="job-details-jobs-unified-top-card__bullet">Remote, US</span>
            <div class="jobs-description__content">Build things. Pay is $150,000 - $180,000 per year.</div>
        </body></html>
    "#;

    #[test]
    fn test_extract_linkedin_layout() {
        let record = FieldExtractor::new().extract(LINKEDIN_PAGE, None);
        assert_eq!(record.position, "Staff Engineer");
        assert_eq!(record.company, "Acme Corp");
        assert_eq!(record.location.as_deref(), Some("Remote, US"));
        assert_eq!(record.job_url.as_deref(), Some("https://www.linkedin.com/jobs/view/123"));
        assert_eq!(record.salary.as_deref(), Some("$150,000 - $180,000 per year"));
        assert!(record.description.unwrap().starts_with("Build things."));
    }

    #[test]
    fn test_extract_falls_back_to_meta_and_page_url() {
        let html = r#"
            <html><head>
                <meta property="og:title" content="Data Analyst">
                <meta property="og:site_name" content="Globex">
                <meta name="description" content="Crunch numbers">
            </head><body><p>Nothing useful</p></body></html>
        "#;
        let record = FieldExtractor::new().extract(html, Some("https://globex.example/jobs/7?utm_source=x"));
        assert_eq!(record.position, "Data Analyst");
        assert_eq!(record.company, "Globex");
        assert_eq!(record.description.as_deref(), Some("Crunch numbers"));
        assert_eq!(record.job_url.as_deref(), Some("https://globex.example/jobs/7"));
        assert!(record.salary.is_none());
    }

    #[test]
    fn test_extract_empty_page_gives_empty_fields() {
        let record = FieldExtractor::new().extract("<html><body></body></html>", None);
        assert!(record.company.is_empty());
        assert!(record.position.is_empty());
        assert!(record.job_url.is_none());
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_skips_empty_matches() {
        let html = r#"<h1>   </h1><h1>Platform Engineer</h1>"#;
        let record = FieldExtractor::new().extract(html, None);
        assert_eq!(record.position, "Platform Engineer");
    }

    #[test]
    fn test_salary_from_k_range() {
        let html = r#"<body><h1>SRE</h1><p>Compensation: $120k-$140k plus equity</p></body>"#;
        let record = FieldExtractor::new().extract(html, None);
        assert_eq!(record.salary.as_deref(), Some("$120k-$140k"));
    }

    #[test]
    fn test_description_is_truncated() {
        let long = "x".repeat(MAX_DESCRIPTION_CHARS + 100);
        let html = format!("<article>{}</article>", long);
        let record = FieldExtractor::new().extract(&html, None);
        assert_eq!(record.description.unwrap().len(), MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn test_clean_tracking_url() {
        assert_eq!(
            clean_tracking_url("https://x.com/jobs/1?ref=mail#apply").as_deref(),
            Some("https://x.com/jobs/1")
        );
        assert_eq!(clean_tracking_url("  ").as_deref(), None);
    }

    #[test]
    fn test_all_selectors_parse() {
        let extractor = FieldExtractor::new();
        assert_eq!(extractor.position.len(), POSITION_SELECTORS.len());
        assert_eq!(extractor.company.len(), COMPANY_SELECTORS.len());
        assert_eq!(extractor.location.len(), LOCATION_SELECTORS.len());
        assert_eq!(extractor.salary.len(), SALARY_SELECTORS.len());
        assert_eq!(extractor.description.len(), DESCRIPTION_SELECTORS.len());
        assert!(extractor.salary_pattern.is_some());
    }
}
