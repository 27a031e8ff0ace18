//! Human annotation records and review decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLabel {
    Excellent,
    Good,
    Acceptable,
    Poor,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionType {
    #[default]
    None,
    Minor,
    Major,
    Rewrite,
}

/// Reviewer verdict on an annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewOutcome {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// Annotation content submitted for a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationInput {
    pub annotator_id: String,
    pub corrected_question: Option<String>,
    pub corrected_answer: Option<String>,
    pub quality_label: QualityLabel,
    #[serde(default)]
    pub correction_type: CorrectionType,
    pub domain: Option<String>,
    pub intent: Option<String>,
    pub complexity: Option<String>,
    #[serde(default = "default_true")]
    pub is_useful: bool,
    #[serde(default)]
    pub should_add_to_kb: bool,
    pub kb_category: Option<String>,
    pub notes: Option<String>,
    /// Seconds spent annotating
    #[serde(default)]
    pub time_cost_secs: u64,
}

fn default_true() -> bool {
    true
}

impl AnnotationInput {
    /// Minimal input with a quality label, used by callers that only grade
    pub fn labelled(annotator_id: &str, quality_label: QualityLabel) -> Self {
        Self {
            annotator_id: annotator_id.to_string(),
            corrected_question: None,
            corrected_answer: None,
            quality_label,
            correction_type: CorrectionType::None,
            domain: None,
            intent: None,
            complexity: None,
            is_useful: true,
            should_add_to_kb: false,
            kb_category: None,
            notes: None,
            time_cost_secs: 0,
        }
    }

    pub fn with_kb(mut self, kb_category: Option<&str>) -> Self {
        self.should_add_to_kb = true;
        self.kb_category = kb_category.map(str::to_string);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.annotator_id.trim().is_empty() {
            return Err("annotator_id must not be empty".to_string());
        }
        let blank = |v: &Option<String>| v.as_ref().is_some_and(|s| s.trim().is_empty());
        if blank(&self.corrected_question) {
            return Err("corrected_question must not be blank".to_string());
        }
        if blank(&self.corrected_answer) {
            return Err("corrected_answer must not be blank".to_string());
        }
        if self.correction_type != CorrectionType::None
            && self.corrected_question.is_none()
            && self.corrected_answer.is_none()
        {
            return Err(format!(
                "correction_type {:?} requires a corrected question or answer",
                self.correction_type
            ));
        }
        Ok(())
    }
}

/// Stored annotation for a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub annotation_id: String,
    pub task_id: String,
    #[serde(flatten)]
    pub input: AnnotationInput,
    pub review_status: ReviewOutcome,
    pub reviewer_id: Option<String>,
    pub review_comment: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Annotation {
    pub fn new(task_id: &str, input: AnnotationInput) -> Self {
        Self {
            annotation_id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            input,
            review_status: ReviewOutcome::Pending,
            reviewer_id: None,
            review_comment: None,
            reviewed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Question as corrected by the annotator, falling back to the original
    pub fn final_question<'a>(&'a self, original: &'a str) -> &'a str {
        self.input.corrected_question.as_deref().unwrap_or(original)
    }

    /// Answer as corrected by the annotator, falling back to the original
    pub fn final_answer<'a>(&'a self, original: &'a str) -> &'a str {
        self.input.corrected_answer.as_deref().unwrap_or(original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labelled_input_validates() {
        let input = AnnotationInput::labelled("ann-1", QualityLabel::Good);
        assert!(input.validate().is_ok());
    }

    #[test]
    fn test_empty_annotator_rejected() {
        let input = AnnotationInput::labelled("  ", QualityLabel::Good);
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_correction_requires_content() {
        let mut input = AnnotationInput::labelled("ann-1", QualityLabel::Poor);
        input.correction_type = CorrectionType::Rewrite;
        assert!(input.validate().is_err());

        input.corrected_answer = Some("A better answer".to_string());
        assert!(input.validate().is_ok());
    }

    #[test]
    fn test_final_text_prefers_corrections() {
        let mut input = AnnotationInput::labelled("ann-1", QualityLabel::Good);
        input.corrected_answer = Some("fixed".to_string());
        let annotation = Annotation::new("unit-1", input);

        assert_eq!(annotation.final_question("orig q"), "orig q");
        assert_eq!(annotation.final_answer("orig a"), "fixed");
        assert_eq!(annotation.review_status, ReviewOutcome::Pending);
    }

    #[test]
    fn test_annotation_json_is_flat() {
        let annotation = Annotation::new(
            "unit-1",
            AnnotationInput::labelled("ann-1", QualityLabel::Excellent).with_kb(Some("faq")),
        );
        let json = serde_json::to_value(&annotation).unwrap();
        assert_eq!(json["quality_label"], "excellent");
        assert_eq!(json["should_add_to_kb"], true);
        assert_eq!(json["kb_category"], "faq");
        assert_eq!(json["review_status"], "pending");
    }
}
