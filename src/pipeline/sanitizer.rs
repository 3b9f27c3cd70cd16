use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::llm::PromptRewriter;
use crate::utils::text::{strip_code_fence, strip_wrapping_quotes, truncate_for_log};

/// Known policy-sensitive words and the artistic substitutes sent instead.
const SENSITIVE_WORD_REPLACEMENTS: &[(&str, &str)] = &[
    ("blood", "red accents"),
    ("bloody", "crimson-toned"),
    ("bleeding", "flowing crimson"),
    ("murder", "dramatic confrontation"),
    ("murderer", "antagonist"),
    ("kill", "confront"),
    ("killing", "confronting"),
    ("killed", "confronted"),
    ("killer", "rival"),
    ("death", "final moment"),
    ("dead", "fallen"),
    ("corpse", "resting figure"),
    ("violence", "intense action"),
    ("violent", "dynamic"),
    ("attack", "confrontation"),
    ("attacking", "facing"),
    ("brutal", "intense"),
    ("brutality", "intensity"),
    ("cruel", "dramatic"),
    ("cruelty", "drama"),
    ("weapon", "artifact"),
    ("weapons", "artifacts"),
    ("sword", "ancient blade"),
    ("knife", "metallic object"),
    ("gun", "device"),
    ("pistol", "device"),
    ("rifle", "equipment"),
    ("dagger", "ornate object"),
    ("axe", "tool"),
    ("battle", "dramatic standoff"),
    ("war", "historic conflict"),
    ("warfare", "conflict"),
    ("combat", "confrontation"),
    ("fight", "standoff"),
    ("fighting", "facing off"),
    ("torture", "hardship"),
    ("torment", "struggle"),
    ("wound", "mark"),
    ("wounded", "marked"),
    ("injury", "scar"),
    ("injured", "scarred"),
    ("pain", "struggle"),
    ("painful", "difficult"),
    ("suffering", "enduring"),
    ("demon", "mythical being"),
    ("devil", "shadowy entity"),
    ("evil", "shadowy"),
    ("monster", "legendary creature"),
    ("scary", "mysterious"),
    ("terrifying", "enigmatic"),
    ("horror", "suspense"),
    ("fear", "tension"),
    ("crime", "incident"),
    ("criminal", "figure"),
    ("victim", "person involved"),
];

/// Hangul has no ASCII word boundaries, so these match as substrings.
const SENSITIVE_WORD_REPLACEMENTS_KO: &[(&str, &str)] = &[
    ("피투성이", "붉게 물든"),
    ("출혈", "붉은 흐름"),
    ("살인자", "대결 상대"),
    ("살인", "극적인 대결"),
    ("살해", "극적인 순간"),
    ("죽음", "마지막 순간"),
    ("시체", "쓰러진 인물"),
    ("사체", "누운 형체"),
    ("폭력적", "역동적인"),
    ("폭력", "격렬한 움직임"),
    ("무기", "도구"),
    ("단검", "금속 조각"),
    ("권총", "장치"),
    ("소총", "장치"),
    ("도끼", "도구"),
    ("전투", "대결 장면"),
    ("전쟁", "역사적 충돌"),
    ("싸움", "대치 상황"),
    ("고문", "고난"),
    ("고통", "시련"),
    ("상처", "흔적"),
    ("부상", "표식"),
    ("악마", "신비로운 존재"),
    ("괴물", "신화적 존재"),
    ("공포", "긴장감"),
    ("범죄", "사건"),
    ("피해자", "관련자"),
];

fn alternation<'a>(words: impl Iterator<Item = &'a str>) -> String {
    let mut words: Vec<&str> = words.collect();
    // Longest first so "killer" wins over "kill".
    words.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    words
        .into_iter()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("|")
}

static ENGLISH_RE: Lazy<Regex> = Lazy::new(|| {
    let pattern = format!(
        r"(?i)\b(?:{})\b",
        alternation(SENSITIVE_WORD_REPLACEMENTS.iter().map(|(word, _)| *word))
    );
    Regex::new(&pattern).expect("sensitive word pattern")
});

static KOREAN_RE: Lazy<Regex> = Lazy::new(|| {
    let pattern = alternation(SENSITIVE_WORD_REPLACEMENTS_KO.iter().map(|(word, _)| *word));
    Regex::new(&pattern).expect("sensitive word pattern")
});

static REPLACEMENTS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    SENSITIVE_WORD_REPLACEMENTS
        .iter()
        .chain(SENSITIVE_WORD_REPLACEMENTS_KO.iter())
        .copied()
        .collect()
});

/// Replaces known sensitive words with safe substitutes in a single pass.
pub fn pre_filter_sensitive_words(text: &str) -> String {
    let mut replaced = 0usize;
    let mut substitute = |caps: &regex::Captures<'_>| {
        let matched = &caps[0];
        match REPLACEMENTS.get(matched.to_lowercase().as_str()) {
            Some(safe) => {
                replaced += 1;
                (*safe).to_string()
            }
            None => matched.to_string(),
        }
    };
    let english = ENGLISH_RE.replace_all(text, &mut substitute).into_owned();
    let result = KOREAN_RE.replace_all(&english, &mut substitute).into_owned();

    if replaced > 0 {
        debug!("Pre-filter replaced {replaced} sensitive words");
    }
    result
}

/// Rewrites a safety-blocked prompt into a policy-compliant variant.
pub struct PromptSanitizer {
    rewriter: Arc<dyn PromptRewriter>,
}

impl PromptSanitizer {
    pub fn new(rewriter: Arc<dyn PromptRewriter>) -> Self {
        PromptSanitizer { rewriter }
    }

    pub async fn sanitize(
        &self,
        blocked_prompt: &str,
        block_reason: Option<&str>,
    ) -> Result<String, PipelineError> {
        let filtered = pre_filter_sensitive_words(blocked_prompt);

        let rewritten = self
            .rewriter
            .infer_sanitized_prompt(&filtered, block_reason)
            .await
            .map_err(|err| {
                warn!("Prompt rewrite call failed: {err}");
                PipelineError::SanitizationFailed(err.to_string())
            })?;

        let rewritten = strip_wrapping_quotes(strip_code_fence(&rewritten))
            .trim()
            .to_string();
        if rewritten.is_empty() {
            return Err(PipelineError::SanitizationFailed(
                "rewriter returned an empty prompt".to_string(),
            ));
        }
        if rewritten == blocked_prompt.trim() {
            return Err(PipelineError::SanitizationFailed(
                "rewriter returned the blocked prompt unchanged".to_string(),
            ));
        }

        info!(
            "Sanitized prompt: {} -> {}",
            truncate_for_log(blocked_prompt, 100),
            truncate_for_log(&rewritten, 100)
        );
        Ok(rewritten)
    }
}
