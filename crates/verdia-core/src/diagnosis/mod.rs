//! Extraction and validation of the structured diagnosis.
//!
//! The inference provider is asked for a bare JSON object but is treated as
//! untrusted: models wrap JSON in commentary despite instructions. The
//! extractor takes the span between the first `{` and the last `}` as the
//! candidate document, parses it, and then validates every field against
//! the diagnosis schema before anything downstream may see the data.
//!
//! Validation is all-or-nothing: there are no partial results, and no value
//! is ever silently coerced. A parse problem is a [`ExtractError::Format`];
//! a present-but-invalid field is a [`ExtractError::Schema`] naming the
//! offending field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Severity of a diagnosed condition. Closed set; the wire labels are the
/// provider's fixed output language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Mild, cosmetic or early-stage.
    #[serde(rename = "Leve")]
    Low,
    /// Established but treatable.
    #[serde(rename = "Moderada")]
    Moderate,
    /// Threatens the plant's survival.
    #[serde(rename = "Severa")]
    Severe,
}

impl Severity {
    /// Parses a wire label into the closed set.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Leve" => Some(Self::Low),
            "Moderada" => Some(Self::Moderate),
            "Severa" => Some(Self::Severe),
            _ => None,
        }
    }

    /// The wire label for this severity.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Low => "Leve",
            Self::Moderate => "Moderada",
            Self::Severe => "Severa",
        }
    }
}

/// A validated diagnosis. Created only by [`extract`]; immutable afterwards
/// except for the single policy-driven substitution of `treatment` in
/// [`crate::policy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisResult {
    /// Condition name. Non-empty.
    pub disease: String,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    /// Description of the condition. Non-empty.
    pub description: String,
    /// Recommended remedial action. Non-empty; subject to the policy
    /// filter.
    pub treatment: String,
    /// Severity of the condition.
    pub severity: Severity,
}

/// Failures while recovering a diagnosis from raw model output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// No parseable JSON document in the output.
    #[error("no parseable JSON object in model output: {0}")]
    Format(String),

    /// A document was parsed but a field violates the schema.
    #[error("model output field '{field}' is invalid: {reason}")]
    Schema {
        /// Name of the offending field.
        field: &'static str,
        /// What the field violated.
        reason: String,
    },
}

/// Extracts and validates a diagnosis from free-form model output.
///
/// # Errors
///
/// [`ExtractError::Format`] when no `{...}` span exists or the span is not
/// valid JSON; [`ExtractError::Schema`] when any field violates the
/// diagnosis schema.
pub fn extract(raw: &str) -> Result<DiagnosisResult, ExtractError> {
    let candidate = candidate_span(raw)?;
    let value: Value = serde_json::from_str(candidate)
        .map_err(|e| ExtractError::Format(format!("candidate span is not valid JSON: {e}")))?;
    validate(&value)
}

/// Locates the candidate JSON span: first `{` through last `}` inclusive.
///
/// A deliberate tolerance for models that wrap JSON in commentary despite
/// instructions.
fn candidate_span(raw: &str) -> Result<&str, ExtractError> {
    let start = raw
        .find('{')
        .ok_or_else(|| ExtractError::Format("no opening brace in model output".into()))?;
    let end = raw
        .rfind('}')
        .ok_or_else(|| ExtractError::Format("no closing brace in model output".into()))?;
    if end < start {
        return Err(ExtractError::Format(
            "closing brace precedes opening brace".into(),
        ));
    }
    Ok(&raw[start..=end])
}

/// Validates a parsed document field-by-field. Nothing from the document is
/// trusted until every field has been checked.
fn validate(value: &Value) -> Result<DiagnosisResult, ExtractError> {
    let obj = value.as_object().ok_or(ExtractError::Schema {
        field: "root",
        reason: "expected a JSON object".into(),
    })?;

    let disease = required_string(obj, "disease")?;
    let confidence = required_confidence(obj)?;
    let description = required_string(obj, "description")?;
    let treatment = required_string(obj, "treatment")?;
    let severity = required_severity(obj)?;

    Ok(DiagnosisResult {
        disease,
        confidence,
        description,
        treatment,
        severity,
    })
}

fn required_string(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, ExtractError> {
    let value = obj.get(field).ok_or(ExtractError::Schema {
        field,
        reason: "missing".into(),
    })?;
    let s = value.as_str().ok_or(ExtractError::Schema {
        field,
        reason: "expected a string".into(),
    })?;
    if s.trim().is_empty() {
        return Err(ExtractError::Schema {
            field,
            reason: "must not be empty".into(),
        });
    }
    Ok(s.to_string())
}

fn required_confidence(obj: &serde_json::Map<String, Value>) -> Result<f64, ExtractError> {
    let field = "confidence";
    let value = obj.get(field).ok_or(ExtractError::Schema {
        field,
        reason: "missing".into(),
    })?;
    let n = value.as_f64().ok_or(ExtractError::Schema {
        field,
        reason: "expected a number".into(),
    })?;
    if !(0.0..=1.0).contains(&n) {
        return Err(ExtractError::Schema {
            field,
            reason: format!("{n} is outside [0, 1]"),
        });
    }
    Ok(n)
}

fn required_severity(obj: &serde_json::Map<String, Value>) -> Result<Severity, ExtractError> {
    let field = "severity";
    let value = obj.get(field).ok_or(ExtractError::Schema {
        field,
        reason: "missing".into(),
    })?;
    let label = value.as_str().ok_or(ExtractError::Schema {
        field,
        reason: "expected a string".into(),
    })?;
    Severity::from_label(label).ok_or_else(|| ExtractError::Schema {
        field,
        reason: format!("'{label}' is not one of Leve, Moderada, Severa"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_json() -> String {
        r#"{
            "disease": "Roya del cafeto",
            "confidence": 0.87,
            "description": "Pústulas anaranjadas en el envés de las hojas.",
            "treatment": "Retira las hojas afectadas y mejora la ventilación.",
            "severity": "Moderada"
        }"#
        .to_string()
    }

    #[test]
    fn extracts_bare_json() {
        let result = extract(&valid_json()).unwrap();
        assert_eq!(result.disease, "Roya del cafeto");
        assert!((result.confidence - 0.87).abs() < f64::EPSILON);
        assert_eq!(result.severity, Severity::Moderate);
    }

    #[test]
    fn extracts_json_wrapped_in_commentary() {
        let raw = format!("Claro, aquí está el análisis: {} ¡Saludos!", valid_json());
        let result = extract(&raw).unwrap();
        assert_eq!(result.severity, Severity::Moderate);
    }

    #[test]
    fn missing_opening_brace_is_format_error() {
        let result = extract("no json here at all}");
        assert!(matches!(result, Err(ExtractError::Format(_))));
    }

    #[test]
    fn missing_closing_brace_is_format_error() {
        let result = extract("{\"disease\": \"Roya\"");
        assert!(matches!(result, Err(ExtractError::Format(_))));
    }

    #[test]
    fn reversed_braces_are_format_error() {
        let result = extract("} oops {");
        assert!(matches!(result, Err(ExtractError::Format(_))));
    }

    #[test]
    fn unparseable_span_is_format_error() {
        let result = extract("{not valid json}");
        assert!(matches!(result, Err(ExtractError::Format(_))));
    }

    #[test]
    fn missing_field_names_the_field() {
        let raw = r#"{"disease": "Roya", "confidence": 0.5, "description": "d", "severity": "Leve"}"#;
        let err = extract(raw).unwrap_err();
        assert_eq!(
            err,
            ExtractError::Schema {
                field: "treatment",
                reason: "missing".into()
            }
        );
    }

    #[test]
    fn empty_string_field_is_schema_error() {
        let raw = r#"{"disease": "  ", "confidence": 0.5, "description": "d", "treatment": "t", "severity": "Leve"}"#;
        let err = extract(raw).unwrap_err();
        assert!(matches!(err, ExtractError::Schema { field: "disease", .. }));
    }

    #[test]
    fn confidence_above_one_is_schema_error() {
        let raw = r#"{"disease": "Roya", "confidence": 1.2, "description": "d", "treatment": "t", "severity": "Leve"}"#;
        let err = extract(raw).unwrap_err();
        assert!(matches!(err, ExtractError::Schema { field: "confidence", .. }));
    }

    #[test]
    fn negative_confidence_is_schema_error() {
        let raw = r#"{"disease": "Roya", "confidence": -0.1, "description": "d", "treatment": "t", "severity": "Leve"}"#;
        let err = extract(raw).unwrap_err();
        assert!(matches!(err, ExtractError::Schema { field: "confidence", .. }));
    }

    #[test]
    fn confidence_bounds_are_inclusive() {
        for bound in ["0", "1", "0.0", "1.0"] {
            let raw = format!(
                r#"{{"disease": "Roya", "confidence": {bound}, "description": "d", "treatment": "t", "severity": "Leve"}}"#
            );
            assert!(extract(&raw).is_ok(), "confidence {bound} should validate");
        }
    }

    #[test]
    fn string_confidence_is_never_coerced() {
        let raw = r#"{"disease": "Roya", "confidence": "0.9", "description": "d", "treatment": "t", "severity": "Leve"}"#;
        let err = extract(raw).unwrap_err();
        assert!(matches!(err, ExtractError::Schema { field: "confidence", .. }));
    }

    #[test]
    fn unknown_severity_is_schema_error() {
        let raw = r#"{"disease": "Roya", "confidence": 0.5, "description": "d", "treatment": "t", "severity": "Critical"}"#;
        let err = extract(raw).unwrap_err();
        assert!(matches!(err, ExtractError::Schema { field: "severity", .. }));
    }

    #[test]
    fn all_severity_labels_parse() {
        assert_eq!(Severity::from_label("Leve"), Some(Severity::Low));
        assert_eq!(Severity::from_label("Moderada"), Some(Severity::Moderate));
        assert_eq!(Severity::from_label("Severa"), Some(Severity::Severe));
        assert_eq!(Severity::from_label("leve"), None);
    }

    #[test]
    fn severity_labels_round_trip() {
        for severity in [Severity::Low, Severity::Moderate, Severity::Severe] {
            assert_eq!(Severity::from_label(severity.label()), Some(severity));
        }
    }

    #[test]
    fn serializes_with_wire_labels() {
        let result = extract(&valid_json()).unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["severity"], "Moderada");
        assert_eq!(json["disease"], "Roya del cafeto");
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let raw = r#"{"disease": "Roya", "confidence": 0.5, "description": "d", "treatment": "t", "severity": "Leve", "note": "extra"}"#;
        assert!(extract(raw).is_ok());
    }
}
