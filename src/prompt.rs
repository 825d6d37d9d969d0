//! System prompt construction.

use serde::Deserialize;

use crate::conversation::ConversationState;

/// Static advisor instruction assembled from a persona and a fixed list of
/// named fragments.  The result depends only on configuration, so its size
/// is bounded no matter how many requests are served.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct FixedPrompt {
    pub persona: String,
    #[serde(default)]
    pub fragments: Vec<PromptFragment>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PromptFragment {
    pub name: String,
    pub text: String,
}

impl FixedPrompt {
    pub fn render(&self) -> String {
        let mut out = self.persona.trim().to_string();
        for fragment in &self.fragments {
            let text = fragment.text.trim();
            if text.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(text);
        }
        out
    }
}

impl Default for FixedPrompt {
    fn default() -> Self {
        let fragment = |name: &str, text: &str| PromptFragment {
            name: name.to_string(),
            text: text.to_string(),
        };
        Self {
            persona: "Eres \"Careeryzer\", un experto coach de carrera, y asistente basado en IA \
                      que te ayuda a crecer y desarrollarte en tu carrera profesional."
                .to_string(),
            fragments: vec![
                fragment("name", "Por favor, presentate, y dime tu nombre."),
                fragment("hobbies", "Cuáles son tus hobbies e intereses?"),
                fragment("skills", "Cuáles son tus habilidades y fortalezas?"),
                fragment("experience", "Cuál es tu experiencia en la industria?"),
            ],
        }
    }
}

/// How the system instruction is derived for each turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptPolicy {
    /// Same instruction every turn; the questionnaire is not used.
    Fixed(FixedPrompt),
    /// Current question followed by any draft answer recorded for it.
    Stateful,
}

impl PromptPolicy {
    pub fn is_stateful(&self) -> bool {
        matches!(self, PromptPolicy::Stateful)
    }

    pub fn build(&self, state: &ConversationState) -> String {
        match self {
            PromptPolicy::Fixed(prompt) => prompt.render(),
            PromptPolicy::Stateful => {
                let index = state.current_index();
                format!(
                    "{}\n{}\n",
                    state.current_question().unwrap_or_default(),
                    state.answer(index).unwrap_or_default()
                )
            }
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            PromptPolicy::Fixed(_) => "fixed",
            PromptPolicy::Stateful => "stateful",
        }
    }
}
