//! Canned replies used when the completion provider fails or times out.

const REGENERATED_NAME_PREFIX_CHARS: usize = 30;

pub fn send_reply(content: &str) -> String {
    format!("I received your message: \"{content}\". I'm unable to reach the assistant right now.")
}

pub fn edit_reply(content: &str) -> String {
    format!(
        "I received your message: \"{content}\". This is a basic response for the edited message."
    )
}

pub fn regenerate_reply(content: &str) -> String {
    format!(
        "Here's a different perspective on your message: \"{content}\"\n\n\
         This is a regenerated response that offers an alternative viewpoint or approach to your question."
    )
}

pub fn regenerated_branch_name(content: &str) -> String {
    let prefix: String = content.chars().take(REGENERATED_NAME_PREFIX_CHARS).collect();
    format!("Regenerated response from \"{prefix}...\"")
}

/// Instruction appended to the lineage when asking for a different reply.
pub const REGENERATE_INSTRUCTION: &str =
    "Please provide a new, different response to the last user message.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_reply_quotes_the_new_content() {
        assert_eq!(
            edit_reply("hey"),
            "I received your message: \"hey\". This is a basic response for the edited message."
        );
    }

    #[test]
    fn regenerated_name_counts_characters_not_bytes() {
        let content = "é".repeat(40);
        let name = regenerated_branch_name(&content);
        assert_eq!(
            name,
            format!("Regenerated response from \"{}...\"", "é".repeat(30))
        );
        assert_eq!(
            regenerated_branch_name("short"),
            "Regenerated response from \"short...\""
        );
    }
}
