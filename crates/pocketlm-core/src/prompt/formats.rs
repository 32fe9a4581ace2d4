//! Fixed per-family prompt layouts.
//!
//! Every layout ends with an open assistant turn. Callers pass the history
//! with its system message already in place.

use pocketlm_types::{ChatMessage, Role};

use super::family::TemplateStrategy;

pub fn render(strategy: TemplateStrategy, messages: &[ChatMessage]) -> String {
    match strategy {
        TemplateStrategy::ChatMl => chat_ml(messages),
        TemplateStrategy::Llama3 => llama3(messages),
        TemplateStrategy::Inst => inst(messages),
        TemplateStrategy::Gemma => gemma(messages),
        TemplateStrategy::Phi => phi(messages),
        TemplateStrategy::Harmony => harmony(messages),
    }
}

fn chat_ml(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        out.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", m.role, m.content));
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

fn llama3(messages: &[ChatMessage]) -> String {
    let mut out = String::from("<|begin_of_text|>");
    for m in messages {
        out.push_str(&format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            m.role, m.content
        ));
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    out
}

/// Split off the system prompt for layouts without a system role.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let rest = messages.iter().filter(|m| m.role != Role::System).collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, rest)
}

fn inst(messages: &[ChatMessage]) -> String {
    let (mut system, turns) = split_system(messages);
    let mut out = String::from("<s>");
    let mut open = false;
    for m in turns {
        match m.role {
            Role::User => {
                out.push_str("[INST] ");
                if let Some(system) = system.take() {
                    out.push_str(&system);
                    out.push_str("\n\n");
                }
                out.push_str(&m.content);
                out.push_str(" [/INST]");
                open = true;
            }
            Role::Assistant => {
                out.push(' ');
                out.push_str(&m.content);
                out.push_str("</s>");
                open = false;
            }
            Role::System => {}
        }
    }
    if !open {
        out.push_str("[INST] ");
        out.push_str(system.as_deref().unwrap_or_default());
        out.push_str(" [/INST]");
    }
    out
}

fn gemma(messages: &[ChatMessage]) -> String {
    let (mut system, turns) = split_system(messages);
    let mut out = String::new();
    for m in turns {
        let role = match m.role {
            Role::Assistant => "model",
            _ => "user",
        };
        out.push_str("<start_of_turn>");
        out.push_str(role);
        out.push('\n');
        if m.role == Role::User {
            if let Some(system) = system.take() {
                out.push_str(&system);
                out.push_str("\n\n");
            }
        }
        out.push_str(&m.content);
        out.push_str("<end_of_turn>\n");
    }
    if let Some(system) = system {
        out.push_str(&format!("<start_of_turn>user\n{system}<end_of_turn>\n"));
    }
    out.push_str("<start_of_turn>model\n");
    out
}

fn phi(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        out.push_str(&format!("<|{}|>\n{}<|end|>\n", m.role, m.content));
    }
    out.push_str("<|assistant|>\n");
    out
}

fn harmony(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        match m.role {
            Role::Assistant => out.push_str(&format!(
                "<|start|>assistant<|channel|>final<|message|>{}<|end|>",
                m.content
            )),
            role => out.push_str(&format!("<|start|>{role}<|message|>{}<|end|>", m.content)),
        }
    }
    out.push_str("<|start|>assistant");
    out
}
