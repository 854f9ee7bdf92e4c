use serde::{Deserialize, Serialize};

/// Gemini-native model catalog (`GET /v1beta/models`).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeminiModelList {
    pub models: Vec<GeminiModel>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeminiModel {
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_generation_methods: Option<Vec<String>>,
}

impl GeminiModelList {
    pub fn from_model_names<I, S>(model_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let models = model_names
            .into_iter()
            .map(|model| {
                let name = model.into();
                GeminiModel {
                    display_name: name.clone(),
                    name: format!("models/{name}"),
                    supported_generation_methods: Some(vec![
                        "generateContent".to_string(),
                        "streamGenerateContent".to_string(),
                    ]),
                    ..Default::default()
                }
            })
            .collect();
        Self { models }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_model_names_prefixes_resource_path() {
        let list = GeminiModelList::from_model_names(["gemini-2.5-pro"]);
        assert_eq!(list.models[0].name, "models/gemini-2.5-pro");
        assert_eq!(list.models[0].display_name, "gemini-2.5-pro");
    }
}
