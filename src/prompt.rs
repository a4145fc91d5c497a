//! Prompt templates and model request construction.
//!
//! Templates use `{name}` placeholders. Doubled braces (`{{`, `}}`) are
//! literal braces, so user-authored prompts can carry JSON-shaped
//! instructions next to real placeholders. Only a brace run of odd length
//! on both sides of an identifier counts as a placeholder.

use crate::error::{RagError, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{+[A-Za-z0-9_]+\}+").expect("placeholder pattern is valid"));

/// The placeholder name every request skeleton must carry in its prompt slot.
pub const PROMPT_VAR: &str = "prompt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    text: String,
}

impl Template {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn declared_variables(&self) -> BTreeSet<String> {
        declared_variables(&self.text)
    }

    pub fn fill(&self, bindings: &HashMap<String, String>) -> Result<String> {
        fill(&self.text, bindings)
    }
}

pub fn declared_variables(template: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .find_iter(template)
        .filter_map(|m| {
            let s = m.as_str();
            let opens = s.bytes().take_while(|&b| b == b'{').count();
            let closes = s.bytes().rev().take_while(|&b| b == b'}').count();
            (opens % 2 == 1 && closes % 2 == 1).then(|| s[opens..s.len() - closes].to_string())
        })
        .collect()
}

/// Fill every placeholder in `template`.
///
/// The binding keys must equal the declared variable set exactly; missing
/// and extra bindings are both rejected before any substitution happens.
pub fn fill(template: &str, bindings: &HashMap<String, String>) -> Result<String> {
    let declared = declared_variables(template);
    let supplied: BTreeSet<String> = bindings.keys().cloned().collect();
    if declared != supplied {
        return Err(RagError::TemplateMismatch { declared, supplied });
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }

        if tail.starts_with('{') {
            let name_len = tail[1..]
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(tail.len() - 1);
            let name = &tail[1..1 + name_len];
            if name_len > 0
                && tail[1 + name_len..].starts_with('}')
                && let Some(value) = bindings.get(name)
            {
                out.push_str(value);
                rest = &tail[name_len + 2..];
                continue;
            }
        }

        // Lone braces are not placeholders and are kept as written.
        out.push_str(&tail[..1]);
        rest = &tail[1..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Convenience for building a binding map from string pairs.
pub fn bindings<const N: usize>(pairs: [(&str, String); N]) -> HashMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// A vendor-shaped request body ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    body: Value,
    prompt_pointer: String,
}

impl ModelRequest {
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// The filled text at the vendor's prompt slot.
    pub fn prompt_text(&self) -> Option<&str> {
        self.body.pointer(&self.prompt_pointer).and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.body)?)
    }
}

/// Immutable request skeleton. Each `build` produces a fresh body, so one
/// template can be shared by any number of concurrent callers.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    skeleton: Value,
    prompt_pointer: String,
    slot: Template,
}

impl RequestTemplate {
    pub fn new(skeleton: Value, prompt_pointer: impl Into<String>) -> Result<Self> {
        let prompt_pointer = prompt_pointer.into();
        let slot = skeleton
            .pointer(&prompt_pointer)
            .and_then(Value::as_str)
            .map(Template::new)
            .ok_or_else(|| {
                RagError::InvalidRequest(format!(
                    "request body has no text at {}",
                    prompt_pointer
                ))
            })?;

        let declared = slot.declared_variables();
        if declared.len() != 1 || !declared.contains(PROMPT_VAR) {
            return Err(RagError::TemplateMismatch {
                declared,
                supplied: [PROMPT_VAR.to_string()].into(),
            });
        }

        Ok(Self {
            skeleton,
            prompt_pointer,
            slot,
        })
    }

    pub fn build(&self, prompt: &str) -> Result<ModelRequest> {
        let text = self.slot.fill(&bindings([(PROMPT_VAR, prompt.to_string())]))?;

        let mut body = self.skeleton.clone();
        let target = body.pointer_mut(&self.prompt_pointer).ok_or_else(|| {
            RagError::InvalidRequest(format!("request body has no text at {}", self.prompt_pointer))
        })?;
        *target = Value::String(text);

        Ok(ModelRequest {
            body,
            prompt_pointer: self.prompt_pointer.clone(),
        })
    }
}
