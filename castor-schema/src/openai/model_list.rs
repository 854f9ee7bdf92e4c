use serde::{Deserialize, Serialize};

/// OpenAI-style model catalog (`GET /v1/models`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenaiModelList {
    pub object: String,
    pub data: Vec<OpenaiModel>,
}

impl Default for OpenaiModelList {
    fn default() -> Self {
        Self {
            object: "list".to_string(),
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenaiModel {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

impl Default for OpenaiModel {
    fn default() -> Self {
        Self {
            id: String::new(),
            object: "model".to_string(),
            owned_by: String::new(),
        }
    }
}

impl OpenaiModelList {
    pub fn from_model_names<I, S>(model_names: I, owned_by: String) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let data = model_names
            .into_iter()
            .map(|model| OpenaiModel {
                id: model.into(),
                owned_by: owned_by.clone(),
                ..Default::default()
            })
            .collect();

        Self {
            data,
            ..Default::default()
        }
    }
}
