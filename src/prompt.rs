//! prompt rendering for chat-tuned models.
//!
//! the delimiters here must match the model's chat template byte for byte;
//! a wrong marker doesn't fail loudly, the model just answers badly.

use serde::{Deserialize, Serialize};

use crate::conversation::{Role, Turn};

pub const DEFAULT_SYSTEM_PREAMBLE: &str = "You are a helpful AI assistant.";

/// chat template families.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    /// `<|im_start|>role\n...<|im_end|>\n` (qwen and other chatml models).
    #[default]
    ChatMl,
    /// `<|role|>\n...</s>\n` (tinyllama / zephyr).
    Zephyr,
}

impl ChatTemplate {
    /// marker that closes a turn.
    pub fn end_marker(&self) -> &'static str {
        match self {
            ChatTemplate::ChatMl => "<|im_end|>",
            ChatTemplate::Zephyr => "</s>",
        }
    }

    fn push_turn(&self, out: &mut String, role: Role, content: &str) {
        self.push_open(out, role);
        out.push_str(content);
        out.push_str(self.end_marker());
        out.push('\n');
    }

    fn push_open(&self, out: &mut String, role: Role) {
        match self {
            ChatTemplate::ChatMl => {
                out.push_str("<|im_start|>");
                out.push_str(role.as_str());
                out.push('\n');
            }
            ChatTemplate::Zephyr => {
                out.push_str("<|");
                out.push_str(role.as_str());
                out.push_str("|>\n");
            }
        }
    }
}

/// a rendered prompt in both forms an engine may want.
///
/// `text` carries our chat template for engines that take raw text.
/// `turns` (system preamble, history tail, new user turn) is for chat
/// endpoints that apply the model's template server-side; sending them `text`
/// would wrap the role markers twice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub turns: Vec<Turn>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptBuilder {
    template: ChatTemplate,
    system_preamble: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(ChatTemplate::default(), DEFAULT_SYSTEM_PREAMBLE)
    }
}

impl PromptBuilder {
    pub fn new(template: ChatTemplate, system_preamble: impl Into<String>) -> Self {
        Self { template, system_preamble: system_preamble.into() }
    }

    pub fn template(&self) -> ChatTemplate {
        self.template
    }

    /// system preamble, then each history turn, then the new user turn, then an
    /// open assistant tag.
    pub fn build<'a>(&self, history_tail: impl IntoIterator<Item = &'a Turn>, user_text: &str) -> String {
        let mut out = String::with_capacity(self.system_preamble.len() + user_text.len() + 128);
        self.template.push_turn(&mut out, Role::System, &self.system_preamble);
        for turn in history_tail {
            self.template.push_turn(&mut out, turn.role(), turn.content());
        }
        self.template.push_turn(&mut out, Role::User, user_text);
        self.template.push_open(&mut out, Role::Assistant);
        out
    }

    /// [`PromptBuilder::build`] plus the same conversation as structured turns.
    pub fn prepare<'a>(&self, history_tail: impl IntoIterator<Item = &'a Turn>, user_text: &str) -> Prompt {
        let mut turns = vec![Turn::system(self.system_preamble.clone())];
        turns.extend(history_tail.into_iter().cloned());
        let text = self.build(&turns[1..], user_text);
        turns.push(Turn::user(user_text));
        Prompt { text, turns }
    }

    /// pulls the assistant reply out of raw engine output.
    ///
    /// some engines echo the prompt ahead of the continuation, and most keep
    /// the end-of-turn marker; both are removed here.
    pub fn extract_reply(&self, prompt: &str, raw: &str) -> String {
        let body = raw.strip_prefix(prompt).unwrap_or(raw);
        let body = match body.find(self.template.end_marker()) {
            Some(idx) => &body[..idx],
            None => body,
        };
        body.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationHistory;
    use pretty_assertions::assert_eq;

    #[test]
    fn chatml_layout_is_exact() {
        let mut h = ConversationHistory::new();
        h.append(Turn::user("Hello"));
        h.append(Turn::assistant("Hi there"));

        let prompt = PromptBuilder::default().build(h.recent(3), "How are you?");
        assert_eq!(
            prompt,
            "<|im_start|>system\nYou are a helpful AI assistant.<|im_end|>\n\
             <|im_start|>user\nHello<|im_end|>\n\
             <|im_start|>assistant\nHi there<|im_end|>\n\
             <|im_start|>user\nHow are you?<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn zephyr_layout_is_exact() {
        let builder = PromptBuilder::new(ChatTemplate::Zephyr, "Be brief.");
        let prompt = builder.build(std::iter::empty(), "Hi");
        assert_eq!(prompt, "<|system|>\nBe brief.</s>\n<|user|>\nHi</s>\n<|assistant|>\n");
    }

    #[test]
    fn build_is_deterministic() {
        let mut h = ConversationHistory::new();
        h.append(Turn::user("a"));
        h.append(Turn::assistant("b"));
        let builder = PromptBuilder::default();
        assert_eq!(builder.build(h.recent(3), "c"), builder.build(h.recent(3), "c"));
    }

    #[test]
    fn prepare_pairs_text_with_structured_turns() {
        let mut h = ConversationHistory::new();
        h.append(Turn::user("Hello"));
        h.append(Turn::assistant("Hi there"));
        let builder = PromptBuilder::default();

        let prompt = builder.prepare(h.recent(3), "How are you?");
        assert_eq!(prompt.text, builder.build(h.recent(3), "How are you?"));
        assert_eq!(
            prompt.turns,
            vec![
                Turn::system(DEFAULT_SYSTEM_PREAMBLE),
                Turn::user("Hello"),
                Turn::assistant("Hi there"),
                Turn::user("How are you?"),
            ]
        );
        assert!(prompt.turns.iter().all(|t| !t.content().contains("<|im_start|>")));
    }

    #[test]
    fn extract_reply_strips_echoed_prompt_and_end_marker() {
        let builder = PromptBuilder::default();
        let prompt = builder.build(std::iter::empty(), "Hello");
        let raw = format!("{prompt}Hi there<|im_end|>\n<|im_start|>user\n");
        assert_eq!(builder.extract_reply(&prompt, &raw), "Hi there");
    }

    #[test]
    fn extract_reply_passes_through_bare_continuations() {
        let builder = PromptBuilder::default();
        assert_eq!(builder.extract_reply("ignored", "  Hi there \n"), "Hi there");
    }
}
