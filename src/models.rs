//! Supported model catalog exposed by the frontend surfaces.

/// Base models plus their preview aliases, in catalog order.
pub const SUPPORTED_MODELS: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-pro-preview-05-06",
    "gemini-2.5-pro-preview-06-05",
    "gemini-2.5-flash",
    "gemini-2.5-flash-preview-04-17",
    "gemini-2.5-flash-preview-05-20",
    "gpt-5",
];

pub fn is_supported(model: &str) -> bool {
    SUPPORTED_MODELS.contains(&model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_contains_bases_and_previews() {
        assert!(is_supported("gemini-2.5-pro"));
        assert!(is_supported("gemini-2.5-flash-preview-05-20"));
        assert!(is_supported("gpt-5"));
        assert!(!is_supported("gemini-1.5-pro"));
    }
}
