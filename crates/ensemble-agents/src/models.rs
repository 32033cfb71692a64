//! Default model routing per agent type.

const FALLBACK_MODEL: &str = "openai/gpt-4o";

/// Recommended model for an agent type when the task carries no
/// override. Retrieval and spreadsheet work runs on the cheaper tier;
/// long-form writing prefers the Anthropic models.
pub fn default_model_for(agent_type: &str) -> &'static str {
    match agent_type {
        "data_retrieval" | "spreadsheet" => "openai/gpt-4o-mini",
        "report" => "anthropic/claude-sonnet-4-5",
        "code_execution" | "general" => "openai/gpt-4o",
        _ => FALLBACK_MODEL,
    }
}
