use serde::Serialize;

use crate::error::{GatewayError, GatewayResult};
use crate::extract::FOLLOW_UP_HEADING;

/**
 * \brief 解释复杂度等级。
 */
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Level {
    pub value: u8,
    pub label: &'static str,
    pub description: &'static str,
    #[serde(skip)]
    pub instruction: &'static str,
}

pub const DEFAULT_LEVEL: u8 = 2;

pub static LEVELS: [Level; 5] = [
    Level {
        value: 0,
        label: "Child",
        description: "Simple words, fun analogies, and short sentences. Focus on the magic of the concept.",
        instruction: "Explain this topic as if you are teaching a 5-year-old. Use very simple words, fun analogies, and short sentences. Avoid big words completely. Focus on the 'magic' or 'story' of the concept.",
    },
    Level {
        value: 1,
        label: "Simple",
        description: "Clear and simple explanation for a general audience using everyday examples.",
        instruction: "Explain this clearly and simply, suitable for a general audience. Avoid jargon where possible, or clearly explain it if necessary. Use everyday examples to make the concept relatable and easy to grasp.",
    },
    Level {
        value: 2,
        label: "Detailed",
        description: "Comprehensive breakdown with clear headings, bullet points, and practical examples.",
        instruction: "Provide a comprehensive and structured explanation. Break down the concept into key components using clear headings, bullet points, and practical examples. Cover the 'what', 'why', and 'how' in depth.",
    },
    Level {
        value: 3,
        label: "Academic",
        description: "Rigorous explanation with precise terminology, definitions, and theoretical context.",
        instruction: "Provide a rigorous academic explanation suitable for an undergraduate student. Use precise terminology, define key concepts formally, and discuss theoretical underpinnings. Use LaTeX math equations ($...$) for all mathematical expressions and provide derivations where relevant.",
    },
    Level {
        value: 4,
        label: "Expert",
        description: "Highly technical analysis suitable for professionals, covering edge cases and advanced theory.",
        instruction: "Provide a highly technical, expert-level analysis suitable for a PhD researcher or industry professional. Deep dive into nuances, edge cases, and advanced theoretical frameworks, with particular focus on mathematical rigor using LaTeX ($...$), state-of-the-art context, and complex relationships within the topic.",
    },
];

pub fn level(value: u8) -> GatewayResult<&'static Level> {
    LEVELS
        .get(value as usize)
        .ok_or(GatewayError::InvalidLevel(value))
}

const FORMATTING_RULES: &str = "**FORMATTING RULES:**
1. **Markdown**: Use standard Markdown formatting.
2. **Math**: STRICTLY use '$' for inline math (e.g. $E=mc^2$) and '$$' for block math (e.g. $$a^2+b^2=c^2$$). Do NOT use \\( \\) or \\[ \\].
3. **Emphasis**: Use **bold** for technical terms, variable names in text, and key concepts. Do NOT use inline code ticks (`) for single words or short terms. Only use code ticks for actual code syntax or file paths.
4. **Tables**: Create clear, structured Markdown tables where appropriate. Use **bold** for headers and key terms within cells.";

/**
 * \brief 主解释请求的系统指令，末尾约定追问块格式。
 */
pub fn explanation_prompt(value: u8) -> GatewayResult<String> {
    let level = level(value)?;
    Ok(format!(
        "You are a helpful AI assistant that explains complex topics in simple terms. {instruction}

{rules}

**FOLLOW-UP QUESTIONS:**
After the explanation, add a line containing only `---`, then the exact heading {heading} on its own line, then exactly three numbered follow-up questions the reader might ask next, each wrapped in square brackets, for example:
---
{heading}
1. [First question?]
2. [Second question?]
3. [Third question?]
Write nothing after the third question.",
        instruction = level.instruction,
        rules = FORMATTING_RULES,
        heading = FOLLOW_UP_HEADING,
    ))
}

/**
 * \brief 闪卡生成的系统指令。
 */
pub fn flashcard_prompt() -> &'static str {
    "You create study flashcards from the explanation provided by the user. Produce between 5 and 8 cards that cover the most important facts and ideas. \
Respond with ONLY a JSON array of objects of the form {\"q\": \"question\", \"a\": \"answer\"}. \
Do not wrap the array in code fences and do not add any text before or after it."
}

/**
 * \brief 学习路径生成的系统指令。
 */
pub fn learning_path_prompt() -> &'static str {
    "You design learning roadmaps. Given the topic provided by the user, produce between 4 and 6 steps ordered from prerequisites to advanced material. \
Respond with ONLY a JSON array of objects of the form {\"title\": \"short step title\", \"description\": \"one or two sentences on what to learn and why\"}. \
Do not wrap the array in code fences and do not add any text before or after it."
}
