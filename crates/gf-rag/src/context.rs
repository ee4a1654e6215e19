use gf_core::ScoredDocument;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Use the provided context to answer questions accurately.
If the context doesn't contain enough information, say so clearly.
Always cite which source(s) you used in your answer.";

pub const DEFAULT_PROMPT_TEMPLATE: &str = "Context:
{context}

Question: {question}

Answer based on the context provided above:";

pub const NO_CONTEXT_NOTICE: &str =
    "No relevant documents were found in the knowledge base for this question.";

/// 上下文与提示词构建配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// 每篇文档保留的字符数
    pub context_chars_per_doc: usize,
    /// 整个上下文的字符上限
    pub max_context_chars: usize,
    pub system_prompt: String,
    /// 包含 `{context}` 与 `{question}` 占位符
    pub prompt_template: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_chars_per_doc: 300,
            max_context_chars: 8000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> Option<&str> {
    text.char_indices().nth(max_chars).map(|(idx, _)| &text[..idx])
}

impl ContextConfig {
    /// 通用的上下文格式化逻辑
    pub fn build_context(&self, sources: &[ScoredDocument]) -> String {
        let context = sources
            .iter()
            .enumerate()
            .map(|(i, source)| {
                let text = &source.document.text;
                let text = match truncate_chars(text, self.context_chars_per_doc) {
                    Some(head) => format!("{head}..."),
                    None => text.clone(),
                };
                format!(
                    "[Source {}: {}] (relevance: {:.2}): {}",
                    i + 1,
                    source.document.source_label(),
                    source.score(),
                    text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        match truncate_chars(&context, self.max_context_chars) {
            Some(head) => {
                warn!(
                    "Context length {} exceeds maximum {}, truncating",
                    context.chars().count(),
                    self.max_context_chars
                );
                head.to_string()
            }
            None => context,
        }
    }

    pub fn build_prompt(&self, question: &str, context: &str) -> String {
        let context = if context.is_empty() {
            NO_CONTEXT_NOTICE
        } else {
            context
        };
        fill_template(&self.prompt_template, context, question)
    }
}

/// 单次扫描替换占位符，替换进来的文本不会再被展开
fn fill_template(template: &str, context: &str, question: &str) -> String {
    let mut out = String::with_capacity(template.len() + context.len() + question.len());
    let mut rest = template;
    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("{context}") {
            out.push_str(context);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{question}") {
            out.push_str(question);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}
