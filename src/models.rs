use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{RelayError, RelayResult};

/// Placeholder used in the identity tuple when a record has no job URL.
pub const NO_URL_MARKER: &str = "<no-url>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApplicationStatus {
    #[default]
    Applied,
    Interviewing,
    Offered,
    Rejected,
    Withdrawn,
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplicationStatus::Applied => "Applied",
            ApplicationStatus::Interviewing => "Interviewing",
            ApplicationStatus::Offered => "Offered",
            ApplicationStatus::Rejected => "Rejected",
            ApplicationStatus::Withdrawn => "Withdrawn",
        };
        f.pad(s)
    }
}

impl FromStr for ApplicationStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "applied" => Ok(ApplicationStatus::Applied),
            "interviewing" => Ok(ApplicationStatus::Interviewing),
            "offered" => Ok(ApplicationStatus::Offered),
            "rejected" => Ok(ApplicationStatus::Rejected),
            "withdrawn" => Ok(ApplicationStatus::Withdrawn),
            other => Err(RelayError::Validation(format!(
                "unknown status '{}' (expected applied, interviewing, offered, rejected, withdrawn)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRef {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// One job application captured from a page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRecord {
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub position: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: ApplicationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_ref: Option<ResumeRef>,
}

/// Case-insensitive identity used for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordIdentity {
    pub company: String,
    pub position: String,
    pub job_url: String,
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|||{}|||{}", self.company, self.position, self.job_url)
    }
}

/// Lowercase, trim and collapse internal whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl CapturedRecord {
    pub fn new(company: &str, position: &str) -> Self {
        Self {
            company: company.trim().to_string(),
            position: position.trim().to_string(),
            ..Default::default()
        }
    }

    pub fn identity(&self) -> RecordIdentity {
        let job_url = self
            .job_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(|u| u.to_lowercase())
            .unwrap_or_else(|| NO_URL_MARKER.to_string());

        RecordIdentity {
            company: normalize(&self.company),
            position: normalize(&self.position),
            job_url,
        }
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.company.trim().is_empty() {
            return Err(RelayError::Validation("company is required".to_string()));
        }
        if self.position.trim().is_empty() {
            return Err(RelayError::Validation("position is required".to_string()));
        }
        Ok(())
    }
}

// --- Resume documents ---

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_blank<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersonalInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linkedin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

fn filled(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl PersonalInfo {
    pub fn is_empty(&self) -> bool {
        [
            &self.full_name,
            &self.first_name,
            &self.last_name,
            &self.email,
            &self.phone,
            &self.location,
            &self.website,
            &self.linkedin,
            &self.summary,
        ]
        .iter()
        .all(|field| filled(field).is_none())
    }

    /// Full name if present, otherwise first and last name joined.
    pub fn display_name(&self) -> Option<String> {
        if let Some(full) = filled(&self.full_name) {
            return Some(full.to_string());
        }
        let first = filled(&self.first_name)?;
        match filled(&self.last_name) {
            Some(last) => Some(format!("{} {}", first, last)),
            None => Some(first.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Education {
    pub institution: Option<String>,
    pub degree: Option<String>,
    pub field: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub gpa: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Skill {
    Named(String),
    Rated {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Experience {
    pub company: Option<String>,
    pub position: Option<String>,
    pub location: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub current: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Project {
    pub name: Option<String>,
    pub description: Option<String>,
    pub technologies: Vec<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Certification {
    pub name: Option<String>,
    pub issuer: Option<String>,
    pub date: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Language {
    pub name: Option<String>,
    pub proficiency: Option<String>,
}

/// A resume as stored by the backend and mirrored in the local cache.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default, alias = "_id", deserialize_with = "null_as_blank")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_blank")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_info: Option<PersonalInfo>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub education: Vec<Education>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub skills: Vec<Skill>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub experience: Vec<Experience>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub projects: Vec<Project>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub certifications: Vec<Certification>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub languages: Vec<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Document {
    pub fn is_local(&self) -> bool {
        self.id.starts_with("local_")
    }

    /// A document needs personal info and either a name or a title.
    pub fn validate(&self) -> RelayResult<()> {
        let info = match &self.personal_info {
            Some(info) if !info.is_empty() => info,
            _ => {
                return Err(RelayError::Validation(
                    "resume has no personal info".to_string(),
                ));
            }
        };
        if info.display_name().is_none() && self.title.trim().is_empty() {
            return Err(RelayError::Validation(
                "resume needs a name or a title".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_title(&self) -> Option<String> {
        self.personal_info
            .as_ref()
            .and_then(PersonalInfo::display_name)
            .map(|name| format!("{} Resume", name))
    }

    pub fn from_patch(patch: DocumentPatch) -> Self {
        let mut doc = Document::default();
        patch.apply_to(&mut doc);
        doc
    }
}

/// Partial document used for create and update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personal_info: Option<PersonalInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub education: Option<Vec<Education>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skills: Option<Vec<Skill>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experience: Option<Vec<Experience>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects: Option<Vec<Project>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certifications: Option<Vec<Certification>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<Language>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl DocumentPatch {
    pub fn apply_to(self, doc: &mut Document) {
        if let Some(user_id) = self.user_id {
            doc.user_id = Some(user_id);
        }
        if let Some(title) = self.title {
            doc.title = title;
        }
        if let Some(template) = self.template {
            doc.template = Some(template);
        }
        if let Some(info) = self.personal_info {
            doc.personal_info = Some(info);
        }
        if let Some(education) = self.education {
            doc.education = education;
        }
        if let Some(skills) = self.skills {
            doc.skills = skills;
        }
        if let Some(experience) = self.experience {
            doc.experience = experience;
        }
        if let Some(projects) = self.projects {
            doc.projects = projects;
        }
        if let Some(certifications) = self.certifications {
            doc.certifications = certifications;
        }
        if let Some(languages) = self.languages {
            doc.languages = languages;
        }
        if let Some(status) = self.status {
            doc.status = Some(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_case_insensitive() {
        let mut a = CapturedRecord::new("Acme", "Engineer");
        a.job_url = Some("https://x/1".to_string());
        let mut b = CapturedRecord::new("  ACME ", "engineer");
        b.job_url = Some("HTTPS://X/1".to_string());
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_identity_marks_missing_url() {
        let mut a = CapturedRecord::new("Acme", "Engineer");
        a.job_url = Some("   ".to_string());
        assert_eq!(a.identity().job_url, NO_URL_MARKER);
        let b = CapturedRecord::new("Acme", "Engineer");
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_identity_collapses_whitespace() {
        let a = CapturedRecord::new("Acme   Corp", "Staff\tEngineer");
        assert_eq!(a.identity().company, "acme corp");
        assert_eq!(a.identity().position, "staff engineer");
    }

    #[test]
    fn test_record_validate_requires_company_and_position() {
        assert!(CapturedRecord::new("", "Engineer").validate().is_err());
        assert!(CapturedRecord::new("Acme", " ").validate().is_err());
        assert!(CapturedRecord::new("Acme", "Engineer").validate().is_ok());
    }

    #[test]
    fn test_record_wire_format_is_camel_case() {
        let mut record = CapturedRecord::new("Acme", "Engineer");
        record.job_url = Some("https://x/1".to_string());
        record.applied_date = NaiveDate::from_ymd_opt(2024, 3, 1);
        record.resume_ref = Some(ResumeRef {
            id: "r1".to_string(),
            title: "Main".to_string(),
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["jobUrl"], "https://x/1");
        assert_eq!(json["appliedDate"], "2024-03-01");
        assert_eq!(json["status"], "Applied");
        assert_eq!(json["resumeRef"]["id"], "r1");
        assert!(json.get("salary").is_none());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "interviewing".parse::<ApplicationStatus>().unwrap(),
            ApplicationStatus::Interviewing
        );
        assert_eq!(
            " Offered ".parse::<ApplicationStatus>().unwrap(),
            ApplicationStatus::Offered
        );
        assert!("ghosted".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn test_document_null_lists_become_empty() {
        let doc: Document = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "personalInfo": {"fullName": "Ada Lovelace"},
            "skills": null,
        }))
        .unwrap();
        assert!(doc.skills.is_empty());
        assert!(doc.education.is_empty());
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn test_document_accepts_mixed_skill_shapes() {
        let doc: Document = serde_json::from_value(serde_json::json!({
            "_id": "abc",
            "title": "CV",
            "personalInfo": {"email": "a@b.c"},
            "skills": ["Rust", {"name": "SQL", "level": "expert"}],
        }))
        .unwrap();
        assert_eq!(doc.id, "abc");
        assert_eq!(doc.skills.len(), 2);
        assert_eq!(doc.skills[0], Skill::Named("Rust".to_string()));
    }

    #[test]
    fn test_document_validation() {
        let mut doc = Document::default();
        assert!(doc.validate().is_err());

        doc.personal_info = Some(PersonalInfo::default());
        assert!(doc.validate().is_err());

        doc.personal_info = Some(PersonalInfo {
            email: Some("a@b.c".to_string()),
            ..Default::default()
        });
        assert!(doc.validate().is_err());

        doc.title = "Backend CV".to_string();
        assert!(doc.validate().is_ok());

        doc.title.clear();
        doc.personal_info = Some(PersonalInfo {
            first_name: Some("Ada".to_string()),
            ..Default::default()
        });
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn test_default_title_uses_name() {
        let doc = Document {
            personal_info: Some(PersonalInfo {
                first_name: Some("Ada".to_string()),
                last_name: Some("Lovelace".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(doc.default_title().as_deref(), Some("Ada Lovelace Resume"));
    }

    #[test]
    fn test_patch_only_touches_present_fields() {
        let mut doc = Document {
            id: "1".to_string(),
            title: "Old".to_string(),
            skills: vec![Skill::Named("Rust".to_string())],
            ..Default::default()
        };
        let patch = DocumentPatch {
            title: Some("New".to_string()),
            ..Default::default()
        };
        patch.apply_to(&mut doc);
        assert_eq!(doc.title, "New");
        assert_eq!(doc.skills.len(), 1);
        assert_eq!(doc.id, "1");
    }
}
