use crate::error::OauthError;
use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::{
    AuthUrl, Client as OAuth2Client, ClientId, ClientSecret, ExtraTokenFields, RefreshToken,
    StandardRevocableToken, StandardTokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Fixed Gemini CLI OAuth client credentials (not overridable via config).
const GCLI_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const GCLI_CLIENT_SECRET: &str = "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";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Fixed Codex CLI OAuth client id (public client, no secret). The
/// interactive flow runs a local callback server on port 1455; only the
/// refresh grant is exercised here.
const CODEX_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

const OPENAI_AUTH_URL: &str = "https://auth.openai.com/oauth/authorize";
const OPENAI_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";

/// Extra (non-standard) OAuth token response fields. Debug output is
/// redacted to keep tokens out of logs.
#[derive(Clone, Deserialize, Serialize)]
pub struct CustomTokenFields {
    pub id_token: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ExtraTokenFields for CustomTokenFields {}

impl std::fmt::Debug for CustomTokenFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id_token = self.id_token.as_ref().map(|_| "<redacted>");
        let mut keys: Vec<&String> = self.extra.keys().collect();
        keys.sort();

        f.debug_struct("CustomTokenFields")
            .field("id_token", &id_token)
            .field("extra_keys", &keys)
            .finish()
    }
}

/// Standard OAuth2 token endpoint response extended with [`CustomTokenFields`].
pub type OauthTokenResponse = StandardTokenResponse<CustomTokenFields, BasicTokenType>;

type StandardOauth2Client<
    HasAuthUrl = oauth2::EndpointSet,
    HasDeviceAuthUrl = oauth2::EndpointNotSet,
    HasIntrospectionUrl = oauth2::EndpointNotSet,
    HasRevocationUrl = oauth2::EndpointNotSet,
    HasTokenUrl = oauth2::EndpointSet,
> = OAuth2Client<
    BasicErrorResponse,
    OauthTokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    HasAuthUrl,
    HasDeviceAuthUrl,
    HasIntrospectionUrl,
    HasRevocationUrl,
    HasTokenUrl,
>;

fn build_oauth2_client(
    client_id: &str,
    client_secret: Option<&str>,
    auth_url: &str,
    token_url: &str,
) -> StandardOauth2Client {
    let mut client = OAuth2Client::<
        BasicErrorResponse,
        OauthTokenResponse,
        BasicTokenIntrospectionResponse,
        StandardRevocableToken,
        BasicRevocationErrorResponse,
    >::new(ClientId::new(client_id.to_string()));

    if let Some(secret) = client_secret {
        client = client.set_client_secret(ClientSecret::new(secret.to_string()));
    }

    client
        .set_auth_uri(AuthUrl::new(auth_url.to_string()).expect("valid fixed auth URL"))
        .set_token_uri(TokenUrl::new(token_url.to_string()).expect("valid fixed token URL"))
}

static GOOGLE_OAUTH_CLIENT: LazyLock<StandardOauth2Client> = LazyLock::new(|| {
    build_oauth2_client(
        GCLI_CLIENT_ID,
        Some(GCLI_CLIENT_SECRET),
        GOOGLE_AUTH_URL,
        GOOGLE_TOKEN_URI,
    )
});

static CODEX_OAUTH_CLIENT: LazyLock<StandardOauth2Client> =
    LazyLock::new(|| build_oauth2_client(CODEX_CLIENT_ID, None, OPENAI_AUTH_URL, OPENAI_TOKEN_URL));

/// Exchange a Google refresh token for a fresh access token.
pub async fn refresh_google(
    refresh_token: &str,
    http_client: &reqwest::Client,
) -> Result<OauthTokenResponse, OauthError> {
    let token_result: OauthTokenResponse = GOOGLE_OAUTH_CLIENT
        .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
        .request_async(http_client)
        .await?;
    Ok(token_result)
}

/// Exchange an OpenAI (Codex CLI) refresh token for a fresh access token.
pub async fn refresh_codex(
    refresh_token: &str,
    http_client: &reqwest::Client,
) -> Result<OauthTokenResponse, OauthError> {
    let token_result: OauthTokenResponse = CODEX_OAUTH_CLIENT
        .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
        .request_async(http_client)
        .await?;
    Ok(token_result)
}

/// Flatten a token response into the JSON patch shape the credential
/// record merges (`access_token`, `expires_in`, optional `refresh_token`).
pub fn token_payload(response: &OauthTokenResponse) -> Result<Value, OauthError> {
    serde_json::to_value(response).map_err(|e| OauthError::Other {
        message: format!("token response serialize failed: {e}"),
    })
}
