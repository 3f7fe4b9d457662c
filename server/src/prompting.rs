use minijinja::{context, Environment};

const WELCOME_PROMPT_TEMPLATE: &str = include_str!("prompts/welcome_prompt.j2");
const ANSWER_PROMPT_TEMPLATE: &str = include_str!("prompts/answer_prompt.j2");

pub struct WelcomePromptContext<'a> {
    pub language_code: &'a str,
    pub language_name: &'a str,
    pub party_name: &'a str,
    pub locale: &'a str,
}

pub struct AnswerPromptContext<'a> {
    pub language_code: &'a str,
    pub language_name: &'a str,
    pub transcript: &'a str,
}

pub fn render_welcome_prompt(ctx: &WelcomePromptContext<'_>) -> String {
    render(
        "welcome_prompt",
        WELCOME_PROMPT_TEMPLATE,
        context! {
            language_code => ctx.language_code,
            language_name => ctx.language_name,
            party_name => ctx.party_name.trim(),
            locale => ctx.locale.trim(),
        },
    )
    .unwrap_or_else(|| fallback_welcome_prompt(ctx))
}

pub fn render_answer_prompt(ctx: &AnswerPromptContext<'_>) -> String {
    render(
        "answer_prompt",
        ANSWER_PROMPT_TEMPLATE,
        context! {
            language_code => ctx.language_code,
            language_name => ctx.language_name,
            transcript => ctx.transcript.trim(),
        },
    )
    .unwrap_or_else(|| fallback_answer_prompt(ctx))
}

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    let template = env.get_template(name).ok()?;
    template.render(ctx).ok()
}

fn language_rule(code: &str, name: &str) -> String {
    format!("Reply ONLY in {name} (language code \"{code}\").")
}

fn fallback_welcome_prompt(ctx: &WelcomePromptContext<'_>) -> String {
    let mut prompt = String::from(
        "You are the virtual assistant of a customer support desk.\n\
         Write one short, friendly welcome message for a visitor who just opened a chat.\n",
    );
    if !ctx.party_name.trim().is_empty() {
        prompt.push_str(&format!("The visitor's name is {}.\n", ctx.party_name.trim()));
    }
    prompt.push_str(&language_rule(ctx.language_code, ctx.language_name));
    prompt.push('\n');
    prompt
}

fn fallback_answer_prompt(ctx: &AnswerPromptContext<'_>) -> String {
    let mut prompt = String::from(
        "You are the virtual assistant of a customer support desk.\n\
         Answer briefly and accurately. Never invent facts.\n",
    );
    if !ctx.transcript.trim().is_empty() {
        prompt.push_str("\nRecent conversation:\n");
        prompt.push_str(ctx.transcript.trim());
        prompt.push('\n');
    }
    prompt.push_str(&language_rule(ctx.language_code, ctx.language_name));
    prompt.push('\n');
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_prompt_carries_the_language_rule() {
        let prompt = render_welcome_prompt(&WelcomePromptContext {
            language_code: "ar",
            language_name: "العربية",
            party_name: "Layla",
            locale: "AE",
        });
        assert!(prompt.contains("language code \"ar\""));
        assert!(prompt.contains("Layla"));
        assert!(prompt.contains("AE"));
    }

    #[test]
    fn answer_prompt_omits_empty_transcript() {
        let prompt = render_answer_prompt(&AnswerPromptContext {
            language_code: "fr",
            language_name: "Français",
            transcript: "",
        });
        assert!(prompt.contains("language code \"fr\""));
        assert!(!prompt.contains("Recent conversation"));
    }
}
