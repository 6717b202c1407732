//! Organic-only treatment guarantee.
//!
//! The prompt asks the model for organic, brand-free treatments, but model
//! output is untrusted. This filter is the mechanical guarantee: after
//! validation, the treatment text is scanned case-insensitively against a
//! forbidden-term set (chemical and synthetic-treatment vocabulary plus
//! agrochemical brands). Any hit replaces the entire treatment with one
//! fixed, pre-approved organic fallback text; there is no partial
//! redaction. The emitted recommendation is therefore organic-only
//! independent of model behavior.

use tracing::warn;

/// Pre-approved organic fallback recommendation.
const FALLBACK_TREATMENT: &str = "Aplica tratamientos orgánicos: retira las hojas afectadas, \
    mejora la ventilación de la planta y pulveriza extracto de neem o una infusión de ajo una \
    vez por semana hasta que remita.";

/// Chemical/synthetic-treatment vocabulary. Stored lowercase; matching is
/// case-insensitive substring, so accented and unaccented spellings are
/// listed separately.
const FORBIDDEN_TERMS: &[&str] = &[
    "fungicida",
    "fungicide",
    "pesticida",
    "pesticide",
    "plaguicida",
    "insecticida",
    "insecticide",
    "herbicida",
    "herbicide",
    "químico",
    "quimico",
    "chemical",
    "sintético",
    "sintetico",
    "synthetic",
    "glifosato",
    "glyphosate",
    "clorpirifos",
    "malation",
    "malatión",
    "carbendazim",
    "mancozeb",
    "clorotalonil",
    "imidacloprid",
    // Agrochemical brands
    "roundup",
    "bayer",
    "monsanto",
    "syngenta",
];

/// Static, process-wide content policy: forbidden lexical terms plus the
/// fallback remedial text. Loaded once at startup; never mutated.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Lowercase forbidden terms.
    pub forbidden_terms: Vec<String>,
    /// Replacement text used when any term matches.
    pub fallback_treatment: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            forbidden_terms: FORBIDDEN_TERMS.iter().map(ToString::to_string).collect(),
            fallback_treatment: FALLBACK_TREATMENT.to_string(),
        }
    }
}

/// Post-validation filter over the treatment field.
pub struct PolicyFilter {
    config: PolicyConfig,
}

impl PolicyFilter {
    /// Creates a filter over the given policy. Terms are normalized to
    /// lowercase so matching stays case-insensitive regardless of how the
    /// policy was written.
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        let config = PolicyConfig {
            forbidden_terms: config
                .forbidden_terms
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
            fallback_treatment: config.fallback_treatment,
        };
        Self { config }
    }

    /// Enforces the policy on a validated diagnosis: if the treatment
    /// contains any forbidden term, the whole field is replaced with the
    /// fallback text. All other fields pass through untouched.
    #[must_use]
    pub fn enforce(
        &self,
        mut result: crate::diagnosis::DiagnosisResult,
    ) -> crate::diagnosis::DiagnosisResult {
        if let Some(term) = self.first_match(&result.treatment) {
            warn!(
                term,
                disease = %result.disease,
                "treatment contained forbidden term, substituting fallback"
            );
            result.treatment = self.config.fallback_treatment.clone();
        }
        result
    }

    /// Returns the first forbidden term present in `text`, if any.
    #[must_use]
    pub fn first_match(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        self.config
            .forbidden_terms
            .iter()
            .find(|term| lowered.contains(term.as_str()))
            .map(String::as_str)
    }

    /// The configured fallback text.
    #[must_use]
    pub fn fallback_treatment(&self) -> &str {
        &self.config.fallback_treatment
    }
}

impl Default for PolicyFilter {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}
