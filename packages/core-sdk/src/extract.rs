//! 从模型自由文本中提取结构化产物：追问、闪卡、学习路径。
//!
//! 追问块的格式与 `prompts::explanation_prompt` 中的要求互相绑定，修改任一侧都需要同步另一侧。

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{GatewayError, GatewayResult};
use crate::models::{Flashcard, LearningStep};

/** \brief 追问块的固定标题。 */
pub const FOLLOW_UP_HEADING: &str = "**Want to learn more?**";

const MAX_FOLLOW_UPS: usize = 3;
const MIN_FOLLOW_UP_CHARS: usize = 10;

// 标题前可选的 `---` 分隔线与标题行首的 `#` 都属于追问块。
static FOLLOW_UP_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?m)(?:^[ \t]*-{{3,}}[ \t]*\r?\n\s*)?(?:^[ \t]*#{{1,6}}[ \t]*)?{}",
        regex::escape(FOLLOW_UP_HEADING)
    ))
    .unwrap()
});

static LIST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[.)]\s*").unwrap());

static FENCE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*```[a-z0-9_+-]*[ \t]*").unwrap());

static FENCE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```\s*$").unwrap());

/**
 * \brief 一次解释调用的提取结果：正文与至多三个追问。
 */
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Explanation {
    pub body: String,
    pub follow_ups: Vec<String>,
}

/**
 * \brief 拆出尾部追问块。找不到标题时整段作为正文返回，不报错。
 * \details 只取带编号的行。长度阈值作用于去掉首尾空白后的整行（编号与方括号仍在），清理后为空的条目丢弃。
 */
pub fn extract_follow_ups(raw: &str) -> Explanation {
    let Some(found) = FOLLOW_UP_BLOCK.find_iter(raw).last() else {
        return Explanation {
            body: raw.to_string(),
            follow_ups: Vec::new(),
        };
    };

    let follow_ups = raw[found.end()..]
        .lines()
        .map(str::trim)
        .filter(|line| LIST_NUMBER.is_match(line))
        .filter(|line| line.chars().count() > MIN_FOLLOW_UP_CHARS)
        .map(clean_follow_up)
        .filter(|q| !q.is_empty())
        .take(MAX_FOLLOW_UPS)
        .collect();

    Explanation {
        body: raw[..found.start()].trim_end().to_string(),
        follow_ups,
    }
}

fn clean_follow_up(line: &str) -> String {
    let unnumbered = LIST_NUMBER.replace(line, "");
    unnumbered
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim()
        .to_string()
}

/**
 * \brief 去掉可能包裹 JSON 的代码围栏，语言标记不区分大小写。
 */
pub fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    if !FENCE_OPEN.is_match(trimmed) {
        return trimmed.to_string();
    }
    let opened = FENCE_OPEN.replace(trimmed, "");
    FENCE_CLOSE.replace(&opened, "").trim().to_string()
}

fn parse_json_array<T: DeserializeOwned>(raw: &str, what: &str) -> GatewayResult<Vec<T>> {
    let cleaned = strip_code_fence(raw);
    let first_err = match serde_json::from_str::<Vec<T>>(&cleaned) {
        Ok(items) => return Ok(items),
        Err(err) => err,
    };
    // 模型偶尔在数组前后附带说明文字
    if let (Some(start), Some(end)) = (cleaned.find('['), cleaned.rfind(']')) {
        if start < end {
            if let Ok(items) = serde_json::from_str::<Vec<T>>(&cleaned[start..=end]) {
                return Ok(items);
            }
        }
    }
    Err(GatewayError::InvalidArtifactFormat(format!(
        "{}: {}",
        what, first_err
    )))
}

/**
 * \brief 解析 `[{q, a}]` 闪卡数组。
 */
pub fn extract_flashcards(raw: &str) -> GatewayResult<Vec<Flashcard>> {
    parse_json_array(raw, "flashcards")
}

/**
 * \brief 解析 `[{title, description}]` 学习路径数组。
 */
pub fn extract_learning_path(raw: &str) -> GatewayResult<Vec<LearningStep>> {
    parse_json_array(raw, "learning path")
}
