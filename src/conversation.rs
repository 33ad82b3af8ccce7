//! Role-tagged messages and the fixed prompt template.
//!
//! The template is the Vicuna v1 layout: a system preamble followed by
//! alternating `USER`/`ASSISTANT` turns, with `</s>` closing each assistant
//! turn. Rendering an unfilled assistant turn produces the trailing
//! `ASSISTANT:` that cues the model to generate.

use serde::{Deserialize, Serialize};

/// Role label for user turns.
pub const ROLE_USER: &str = "USER";
/// Role label for assistant turns.
pub const ROLE_ASSISTANT: &str = "ASSISTANT";

const VICUNA_SYSTEM: &str = "A chat between a curious user and an artificial intelligence \
     assistant. The assistant gives helpful, detailed, and polite answers to the user's questions.";

/// One turn of a conversation as callers see it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ROLE_USER, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ROLE_ASSISTANT, content)
    }

    /// Whether the role is one of the two labels the template understands.
    pub fn has_known_role(&self) -> bool {
        self.role == ROLE_USER || self.role == ROLE_ASSISTANT
    }
}

/// How turns are joined when the template is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparatorStyle {
    /// One separator after every turn.
    Single,
    /// Alternating separators; the second one doubles as the stop sequence.
    Two,
}

/// Accumulating prompt buffer bound to one template.
///
/// Turns with `None` content render as `ROLE:` and are filled in place once
/// the reply is decoded.
#[derive(Debug, Clone)]
pub struct Conversation {
    system: String,
    roles: (String, String),
    sep_style: SeparatorStyle,
    sep: String,
    sep2: Option<String>,
    messages: Vec<(String, Option<String>)>,
}

impl Conversation {
    /// The Vicuna v1 template used by LLaVA checkpoints.
    pub fn vicuna_v1() -> Self {
        Self {
            system: VICUNA_SYSTEM.to_string(),
            roles: (ROLE_USER.to_string(), ROLE_ASSISTANT.to_string()),
            sep_style: SeparatorStyle::Two,
            sep: " ".to_string(),
            sep2: Some("</s>".to_string()),
            messages: Vec::new(),
        }
    }

    pub fn roles(&self) -> (&str, &str) {
        (&self.roles.0, &self.roles.1)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn append(&mut self, role: impl Into<String>, content: Option<String>) {
        self.messages.push((role.into(), content));
    }

    /// Fills the most recent turn in place. A no-op on an empty buffer.
    pub fn fill_last(&mut self, content: impl Into<String>) {
        if let Some(last) = self.messages.last_mut() {
            last.1 = Some(content.into());
        }
    }

    /// The sequence that terminates an assistant turn.
    pub fn stop_str(&self) -> &str {
        match self.sep_style {
            SeparatorStyle::Two => self.sep2.as_deref().unwrap_or(&self.sep),
            SeparatorStyle::Single => &self.sep,
        }
    }

    /// Renders the buffer into a single prompt string.
    pub fn render(&self) -> String {
        let seps = match self.sep_style {
            SeparatorStyle::Two => [self.sep.as_str(), self.stop_str()],
            SeparatorStyle::Single => [self.sep.as_str(), self.sep.as_str()],
        };
        let mut prompt = format!("{}{}", self.system, seps[0]);
        for (i, (role, content)) in self.messages.iter().enumerate() {
            match content {
                Some(text) => {
                    prompt.push_str(role);
                    prompt.push_str(": ");
                    prompt.push_str(text);
                    prompt.push_str(seps[i % 2]);
                }
                None => {
                    prompt.push_str(role);
                    prompt.push(':');
                }
            }
        }
        prompt
    }

    /// Copies the buffer out as caller-facing messages. Unfilled turns
    /// surface with empty content.
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .iter()
            .map(|(role, content)| Message::new(role.clone(), content.clone().unwrap_or_default()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vicuna_prompt_layout() {
        let mut conv = Conversation::vicuna_v1();
        conv.append(ROLE_USER, Some("What's in the image?".to_string()));
        conv.append(ROLE_ASSISTANT, None);

        let prompt = conv.render();
        let expected = format!("{VICUNA_SYSTEM} USER: What's in the image? ASSISTANT:");
        assert_eq!(prompt, expected);
    }

    #[test]
    fn filled_assistant_turn_ends_with_stop() {
        let mut conv = Conversation::vicuna_v1();
        conv.append(ROLE_USER, Some("Hi".to_string()));
        conv.append(ROLE_ASSISTANT, None);
        conv.fill_last("Hello there.");

        let prompt = conv.render();
        assert!(prompt.ends_with("ASSISTANT: Hello there.</s>"));
    }

    #[test]
    fn stop_str_is_sep2_for_two_style() {
        let conv = Conversation::vicuna_v1();
        assert_eq!(conv.stop_str(), "</s>");
    }

    #[test]
    fn fill_last_replaces_placeholder_without_growing() {
        let mut conv = Conversation::vicuna_v1();
        conv.append(ROLE_USER, Some("Hi".to_string()));
        conv.append(ROLE_ASSISTANT, None);
        assert_eq!(conv.len(), 2);

        conv.fill_last("Hello.");
        assert_eq!(conv.len(), 2);
        let messages = conv.messages();
        assert_eq!(messages[1], Message::assistant("Hello."));
    }

    #[test]
    fn role_membership() {
        assert!(Message::user("a").has_known_role());
        assert!(Message::assistant("b").has_known_role());
        assert!(!Message::new("SYSTEM", "c").has_known_role());
        assert!(!Message::new("user", "d").has_known_role());
    }
}
