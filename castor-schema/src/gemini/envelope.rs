use super::{GenerateContentRequest, GenerateContentResponse};
use serde::{Deserialize, Serialize};

/// Code Assist upstream request envelope. The Generative Language API takes
/// the inner `request` directly; only the v1internal surface wants this
/// wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliEnvelope {
    pub model: String,
    pub project: String,
    pub request: GenerateContentRequest,
}

impl CliEnvelope {
    pub fn new(
        model: impl Into<String>,
        project: impl Into<String>,
        request: GenerateContentRequest,
    ) -> Self {
        CliEnvelope {
            model: model.into(),
            project: project.into(),
            request,
        }
    }
}

/// Code Assist response envelope: `{"response": <GenerateContentResponse>}`.
#[derive(Debug, Deserialize)]
pub struct CliResponseBody {
    #[serde(rename = "response")]
    pub inner: GenerateContentResponse,
}

impl From<CliResponseBody> for GenerateContentResponse {
    fn from(body: CliResponseBody) -> Self {
        body.inner
    }
}

/// Parse one upstream SSE payload, enveloped or bare. Code Assist wraps
/// fragments in `{"response": …}`; the Generative Language API does not.
pub fn parse_response_payload(data: &str) -> Result<GenerateContentResponse, serde_json::Error> {
    match serde_json::from_str::<CliResponseBody>(data) {
        Ok(enveloped) => Ok(enveloped.into()),
        Err(_) => serde_json::from_str::<GenerateContentResponse>(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_roundtrips() {
        let input = json!({
            "model": "gemini-2.5-pro",
            "project": "project-1",
            "request": {
                "contents": [{"role": "user", "parts": [{"text": "ping"}]}]
            }
        });

        let body: CliEnvelope = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(serde_json::to_value(&body).unwrap(), input);
    }

    #[test]
    fn enveloped_payload_unwraps() {
        let resp = parse_response_payload(
            r#"{"response":{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}}"#,
        )
        .unwrap();
        assert_eq!(
            resp.primary_content().unwrap().parts[0].text.as_deref(),
            Some("hi")
        );
    }

    #[test]
    fn bare_payload_parses() {
        let resp = parse_response_payload(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(
            resp.primary_content().unwrap().parts[0].text.as_deref(),
            Some("hi")
        );
    }
}
