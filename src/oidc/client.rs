//! OpenID Connect provider client.
//!
//! Speaks the authorization-code flow with PKCE: discovery via the
//! well-known endpoint, authorization URL construction, code/token exchange
//! (client_secret_basic) and the userinfo fetch. One client instance is
//! built per distinct set of [`OidcClientParams`] and shared by all
//! requests; see `ConfigRef` for the caching rules.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use url::Url;

use crate::config::OidcConfig;
use crate::{Error, Result};

/// The parameters that determine provider discovery and client identity.
/// Compared structurally on config reload: equal parameters keep the
/// already-discovered client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcClientParams {
    /// Provider issuer URL.
    pub issuer_url: String,
    /// OAuth2 client id.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// Redirect URI registered with the provider.
    pub redirect_uri: String,
}

impl OidcClientParams {
    /// Extracts the client-relevant parameters from the config block.
    pub fn from_config(config: &OidcConfig) -> Self {
        Self {
            issuer_url: config.issuer_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect.uri.clone(),
        }
    }
}

/// The subset of the provider's discovery document the gateway uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier as stated by the provider.
    pub issuer: String,
    /// Where browsers are sent to authenticate.
    pub authorization_endpoint: String,
    /// Where authorization codes are exchanged.
    pub token_endpoint: String,
    /// Where access tokens are traded for identity claims.
    pub userinfo_endpoint: String,
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    /// The access token; absent when the provider returned none.
    pub access_token: Option<String>,
    /// Token type, typically `Bearer`.
    pub token_type: Option<String>,
    /// Lifetime in seconds.
    pub expires_in: Option<u64>,
    /// Optional refresh token.
    pub refresh_token: Option<String>,
    /// Granted scopes.
    pub scope: Option<String>,
    /// Raw ID token, unused by the gateway (identity comes from userinfo).
    pub id_token: Option<String>,
}

/// Identity claims from the userinfo endpoint. Unknown claims are kept in
/// `extra` so denial bodies and logs can show the full document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Userinfo {
    /// Subject claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Email claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Whether the provider verified the email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    /// Every other claim, verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Userinfo {
    /// Renders the claims as one JSON object.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// A PKCE verifier/challenge pair for one authorization attempt.
#[derive(Debug, Clone)]
pub struct Pkce {
    /// The secret verifier sent with the token exchange.
    pub verifier: String,
    /// The S256 challenge sent with the authorization request.
    pub challenge: String,
}

/// Generates a fresh PKCE pair: 32 random bytes as an URL-safe verifier and
/// its SHA-256 as the challenge.
pub fn generate_pkce() -> Pkce {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());
    Pkce {
        verifier,
        challenge,
    }
}

/// Query parameters of interest on the callback request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    /// The authorization code.
    pub code: Option<String>,
    /// The `state` token minted at authorization start.
    pub state: Option<String>,
    /// Provider error code, if the provider denied the request.
    pub error: Option<String>,
    /// Provider error detail.
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Extracts the known parameters from a raw query string.
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                "error_description" => params.error_description = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }
}

/// A discovered, ready-to-use provider client.
#[derive(Debug)]
pub struct OidcClient {
    http: reqwest::Client,
    params: OidcClientParams,
    metadata: ProviderMetadata,
}

impl OidcClient {
    /// Fetches the provider's discovery document and builds a client.
    pub async fn discover(http: reqwest::Client, params: OidcClientParams) -> Result<Self> {
        let url = discovery_url(&params.issuer_url);
        let response = http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::oidc(format!(
                "discovery of {url} failed with status {}",
                response.status()
            )));
        }
        let metadata = response.json::<ProviderMetadata>().await?;
        Ok(Self {
            http,
            params,
            metadata,
        })
    }

    /// The discovered provider metadata.
    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    /// Builds the authorization URL for one attempt.
    pub fn authorization_url(&self, code_challenge: &str, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.metadata.authorization_endpoint)
            .map_err(|err| Error::oidc(format!("bad authorization endpoint: {err}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.params.client_id)
            .append_pair("redirect_uri", &self.params.redirect_uri)
            .append_pair("scope", "openid email")
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state);
        Ok(String::from(url))
    }

    /// Exchanges an authorization code for tokens, proving possession of
    /// the attempt's PKCE verifier.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenSet> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", self.params.redirect_uri.as_str());
        form.insert("client_id", self.params.client_id.as_str());
        form.insert("code_verifier", code_verifier);

        let response = self
            .http
            .post(&self.metadata.token_endpoint)
            .basic_auth(&self.params.client_id, Some(&self.params.client_secret))
            .form(&form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::oidc(format!(
                "token exchange failed with status {status}: {body}"
            )));
        }
        Ok(response.json::<TokenSet>().await?)
    }

    /// Fetches identity claims for an access token.
    pub async fn fetch_userinfo(&self, access_token: &str) -> Result<Userinfo> {
        let response = self
            .http
            .get(&self.metadata.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::oidc(format!(
                "userinfo request failed with status {}",
                response.status()
            )));
        }
        Ok(response.json::<Userinfo>().await?)
    }
}

fn discovery_url(issuer_url: &str) -> String {
    format!(
        "{}/.well-known/openid-configuration",
        issuer_url.trim_end_matches('/')
    )
}
