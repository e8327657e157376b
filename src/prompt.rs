//! Enriched-prompt composer: builds the text actually handed to the
//! reasoner, grounded in the teacher's `engine/prompt.rs` `assemble_prompt`
//! (persona header + body sections, markdown headings, blank-line
//! separation between sections).

use crate::learning::Lesson;
use crate::persona::Persona;

/// Compose the enriched prompt per spec §4.5 step 5: persona header,
/// system prompt, optional priority-skill hint, a compact bullet list of
/// relevant lessons, then the original payload — in that order. Formatting
/// is stable so tests can assert on it directly.
pub fn assemble_prompt(persona: &Persona, lessons: &[Lesson], payload_text: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("# Persona: {}\n\n", persona.id));

    prompt.push_str(&persona.system_prompt);
    prompt.push_str("\n\n");

    if let Some(skill) = &persona.priority_skill {
        prompt.push_str(&format!("## Priority skill\nPrefer the `{skill}` skill when applicable.\n\n"));
    }

    if !lessons.is_empty() {
        prompt.push_str("## Relevant lessons\n");
        for lesson in lessons {
            prompt.push_str(&format!("- {}", lesson.lesson_summary));
            if let Some(solution) = &lesson.solution {
                prompt.push_str(&format!(": {solution}"));
            }
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    prompt.push_str("## Message\n");
    prompt.push_str(payload_text);

    prompt
}
