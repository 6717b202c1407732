//! The fixed analysis instruction sent with every inference call.
//!
//! The instruction pins the output language, demands a single JSON object
//! matching the diagnosis shape with no surrounding prose, and restricts
//! treatments to organic methods without brand names. It is a policy input
//! to the model, not a guarantee; [`crate::policy`] enforces the treatment
//! rule mechanically after validation.

use crate::imaging::NormalizedImage;

/// Instruction text for the inference provider. Fixed and non-negotiable;
/// the diagnosis schema here must stay in lockstep with
/// [`crate::diagnosis::DiagnosisResult`].
const ANALYSIS_INSTRUCTION: &str = "\
Analiza la planta de la imagen.

Responde SIEMPRE en español.
Devuelve SOLO un JSON con este formato:

{
  \"disease\": string,
  \"confidence\": number,
  \"description\": string,
  \"treatment\": string,
  \"severity\": \"Leve\" | \"Moderada\" | \"Severa\"
}

REGLAS:
- Tratamientos exclusivamente orgánicos
- No mencionar químicos ni marcas
- No agregar texto fuera del JSON
";

/// Instruction plus the normalized image it applies to; the unit consumed
/// by the inference client.
#[derive(Debug)]
pub struct PromptPayload<'a> {
    /// The fixed analysis instruction.
    pub instruction: &'static str,
    /// Image to analyze, already normalized.
    pub image: &'a NormalizedImage,
}

/// Builds the prompt payload for a normalized image. Pure: the instruction
/// does not vary per request.
#[must_use]
pub const fn build(image: &NormalizedImage) -> PromptPayload<'_> {
    PromptPayload {
        instruction: ANALYSIS_INSTRUCTION,
        image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_image() -> NormalizedImage {
        NormalizedImage {
            bytes: vec![0xFF, 0xD8, 0xFF, 0xD9],
            width: 1,
            height: 1,
        }
    }

    #[test]
    fn instruction_is_stable_across_calls() {
        let image = dummy_image();
        let a = build(&image);
        let b = build(&image);
        assert_eq!(a.instruction, b.instruction);
    }

    #[test]
    fn instruction_fixes_language_and_shape() {
        let image = dummy_image();
        let payload = build(&image);

        assert!(payload.instruction.contains("español"));
        assert!(payload.instruction.contains("SOLO un JSON"));
        assert!(payload.instruction.contains("\"severity\""));
    }

    #[test]
    fn instruction_restricts_treatments() {
        let image = dummy_image();
        let payload = build(&image);

        assert!(payload.instruction.contains("orgánicos"));
        assert!(payload.instruction.contains("químicos ni marcas"));
    }
}
