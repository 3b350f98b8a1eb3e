use crate::messages::StartSession;

/// Built-in teaching instructions used when no template exists for a mode.
pub const DEFAULT_TEMPLATE: &str = "\
You are a friendly, patient language tutor. The learner's native language is {mother_language} \
and they are practising {target_language} at a {user_level} level.

Scenario: {scenario}

Speak mostly in {target_language}, keep sentences short and natural for the learner's level, \
and switch to {mother_language} only to clarify something the learner is stuck on. \
Gently correct mistakes by repeating the learner's sentence correctly, then keep the conversation going \
with a question.";

const DEFAULT_SCENARIO: &str = "General conversation practice with friendly guidance";

/// Produces the natural-language configuration sent when a connection opens.
pub trait InstructionSource: Send + Sync {
    fn instructions(&self, start: &StartSession) -> String;
}

/// Always renders [`DEFAULT_TEMPLATE`].
pub struct BuiltinInstructions;

impl InstructionSource for BuiltinInstructions {
    fn instructions(&self, start: &StartSession) -> String {
        render_template(DEFAULT_TEMPLATE, start)
    }
}

/// Substitutes `{mother_language}`, `{target_language}`, `{user_level}` and
/// `{scenario}`. Unknown placeholders are left as they are.
pub fn render_template(template: &str, start: &StartSession) -> String {
    let scenario = start
        .scenario
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_SCENARIO);
    template
        .replace("{mother_language}", &start.mother_language)
        .replace("{target_language}", &start.target_language)
        .replace("{user_level}", &start.user_level)
        .replace("{scenario}", scenario)
}
