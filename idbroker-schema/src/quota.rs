use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Claude,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderStyle {
    Antigravity,
    GeminiCli,
}

/// Coarse bucket used for soft-quota gating and capacity surfaces.
/// Claude has no pro/flash split; Gemini splits by model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaGroup {
    Claude,
    GeminiPro,
    GeminiFlash,
}

impl QuotaGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaGroup::Claude => "claude",
            QuotaGroup::GeminiPro => "gemini-pro",
            QuotaGroup::GeminiFlash => "gemini-flash",
        }
    }
}

/// The unit of rate-limit tracking: `(family, headerStyle, model?)`
/// flattened to a single string key, per the "avoid nested maps" design
/// note — callers store `rateLimitResetTimes` as `HashMap<String, i64>`.
pub fn quota_key(family: Family, header_style: HeaderStyle, model: Option<&str>) -> String {
    let base = match family {
        Family::Claude => "claude",
        Family::Gemini => match header_style {
            HeaderStyle::Antigravity => "gemini-antigravity",
            HeaderStyle::GeminiCli => "gemini-cli",
        },
    };

    match (family, model) {
        (Family::Claude, _) => "claude".to_string(),
        (Family::Gemini, Some(model)) => format!("{base}:{model}"),
        (Family::Gemini, None) => base.to_string(),
    }
}

/// Resolve the coarse quota group for soft-quota display/gating.
///
/// Model-name resolution: "flash" anywhere in the name wins; otherwise
/// "gemini" maps to the pro bucket; otherwise "claude" maps to claude.
/// A family with no matching model name falls back to its own family
/// bucket (gemini without a recognizable model name still needs *a*
/// group to look up cached quota under).
pub fn quota_group(family: Family, model: Option<&str>) -> QuotaGroup {
    if let Some(model) = model {
        let lower = model.to_lowercase();
        if lower.contains("flash") {
            return QuotaGroup::GeminiFlash;
        }
        if lower.contains("gemini") {
            return QuotaGroup::GeminiPro;
        }
        if lower.contains("claude") {
            return QuotaGroup::Claude;
        }
    }

    match family {
        Family::Claude => QuotaGroup::Claude,
        Family::Gemini => QuotaGroup::GeminiPro,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_key_ignores_header_style_and_model() {
        assert_eq!(
            quota_key(Family::Claude, HeaderStyle::Antigravity, Some("claude-opus")),
            "claude"
        );
        assert_eq!(
            quota_key(Family::Claude, HeaderStyle::GeminiCli, None),
            "claude"
        );
    }

    #[test]
    fn gemini_keys_split_by_header_style() {
        assert_eq!(
            quota_key(Family::Gemini, HeaderStyle::Antigravity, None),
            "gemini-antigravity"
        );
        assert_eq!(
            quota_key(Family::Gemini, HeaderStyle::GeminiCli, None),
            "gemini-cli"
        );
    }

    #[test]
    fn model_suffix_is_appended() {
        assert_eq!(
            quota_key(Family::Gemini, HeaderStyle::Antigravity, Some("gemini-3-pro")),
            "gemini-antigravity:gemini-3-pro"
        );
    }

    #[test]
    fn quota_group_prefers_flash_over_gemini() {
        assert_eq!(
            quota_group(Family::Gemini, Some("gemini-3-flash")),
            QuotaGroup::GeminiFlash
        );
        assert_eq!(
            quota_group(Family::Gemini, Some("gemini-3-pro")),
            QuotaGroup::GeminiPro
        );
    }

    #[test]
    fn quota_group_falls_back_to_family() {
        assert_eq!(quota_group(Family::Claude, None), QuotaGroup::Claude);
        assert_eq!(quota_group(Family::Gemini, None), QuotaGroup::GeminiPro);
    }
}
