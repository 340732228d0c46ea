//! Discovery input and university metadata.

use serde::{Deserialize, Serialize};

/// A candidate program page produced by a discovery source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    /// University name as listed by the ranking source
    pub university: String,

    /// Candidate data-science program page
    pub url: String,

    /// Optional metadata scraped alongside the listing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<UniversityDetails>,
}

impl Discovery {
    pub fn new(university: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            university: university.into(),
            url: url.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: UniversityDetails) -> Self {
        self.details = Some(details);
        self
    }
}

/// Ranking-site metadata for a university.
///
/// All values are kept as the source displays them ("7%", "$57,590").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniversityDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_sat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_act: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiving_aid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub founded: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuition: Option<Tuition>,
}

impl UniversityDetails {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Graduate tuition figures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domestic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub international: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_discovery() {
        let d: Discovery =
            serde_json::from_str(r#"{"university":"MIT","url":"mit.edu/ds"}"#).unwrap();
        assert_eq!(d, Discovery::new("MIT", "mit.edu/ds"));
    }

    #[test]
    fn test_parse_discovery_with_details() {
        let d: Discovery = serde_json::from_str(
            r#"{"university":"CMU","url":"cmu.edu/ds",
                "details":{"state":"Pennsylvania","tuition":{"domestic":"$50,000"}}}"#,
        )
        .unwrap();
        let details = d.details.unwrap();
        assert_eq!(details.state.as_deref(), Some("Pennsylvania"));
        assert_eq!(details.tuition.unwrap().domestic.as_deref(), Some("$50,000"));
    }

    #[test]
    fn test_empty_details() {
        assert!(UniversityDetails::default().is_empty());
    }
}
