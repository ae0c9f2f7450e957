//! The upstream has no model-listing endpoint of its own; `GET /v1/models`
//! is served from this static table instead of being proxied.

use chatrelay_protocol::openai::models::{ListModelsResponse, Model, ModelListObjectType, ModelObjectType};

pub const TEXT_MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "claude-3.7-sonnet", "deepseek-r1"];
pub const MIXTURE_MODELS: &[&str] = &["gpt-4o", "claude-3.7-sonnet", "deepseek-r1"];
pub const IMAGE_MODELS: &[&str] = &["gpt-image-1"];
pub const VIDEO_MODELS: &[&str] = &["sora-2"];

pub fn is_text_model(model: &str) -> bool {
    TEXT_MODELS.contains(&model)
}

pub fn is_image_model(model: &str) -> bool {
    IMAGE_MODELS.contains(&model)
}

pub fn is_video_model(model: &str) -> bool {
    VIDEO_MODELS.contains(&model)
}

/// The `extra_data.models` array for a (possibly `-search`-suffixed)
/// logical model name. A bare text model passes through alone; anything
/// else (including the search variants) fans out to the full
/// mixture-of-experts roster, matching the upstream's own behaviour.
pub fn resolve_model_list(logical_model: &str) -> Vec<String> {
    if is_text_model(logical_model) {
        vec![logical_model.to_string()]
    } else {
        MIXTURE_MODELS.iter().map(|s| s.to_string()).collect()
    }
}

pub fn list_models() -> ListModelsResponse {
    let data = TEXT_MODELS
        .iter()
        .chain(IMAGE_MODELS.iter())
        .chain(VIDEO_MODELS.iter())
        .map(|id| Model { id: id.to_string(), object: ModelObjectType::Model })
        .chain(TEXT_MODELS.iter().map(|id| Model { id: format!("{id}-search"), object: ModelObjectType::Model }))
        .collect();
    ListModelsResponse { object: ModelListObjectType::List, data }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_model_resolves_to_itself_alone() {
        assert_eq!(resolve_model_list("gpt-4o"), vec!["gpt-4o".to_string()]);
    }

    #[test]
    fn unknown_or_search_model_resolves_to_mixture_roster() {
        assert_eq!(resolve_model_list("gpt-4o-search").len(), MIXTURE_MODELS.len());
        assert_eq!(resolve_model_list("something-else").len(), MIXTURE_MODELS.len());
    }

    #[test]
    fn listing_includes_search_variants() {
        let listing = list_models();
        assert!(listing.data.iter().any(|m| m.id == "gpt-4o-search"));
        assert!(listing.data.iter().any(|m| m.id == "gpt-image-1"));
    }
}
