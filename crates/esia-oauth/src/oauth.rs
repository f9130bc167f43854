//! Generic authorization-code flow driver.
//!
//! The driver knows the standard OAuth2 parameters and how to talk HTTP. What
//! makes a provider special plugs in at two points: a [`SecretAugmenter`]
//! that rewrites parameters right before they are sent, and a
//! [`TokenFactory`] that turns a token response into the provider's token type.

use http::{Method, Request, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use url::Url;

use crate::error::{EsiaError, IdentityProviderError, Result};
use crate::http_client::HttpClient;
use crate::params::{self, Parameters};
use crate::token::InvalidTokenError;

/// Rewrites request parameters before they leave the client.
pub trait SecretAugmenter {
    fn augment(&self, params: Parameters) -> params::Result<Parameters>;
}

/// Builds the provider's token type from a successful token response.
pub trait TokenFactory {
    type Token;

    fn create_token(&self, response: TokenResponse) -> core::result::Result<Self::Token, InvalidTokenError>;
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-5.1
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<SmolStr>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Grants the token endpoint accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    AuthorizationCode { code: String },
    RefreshToken { refresh_token: String },
}

impl Grant {
    pub fn authorization_code(code: impl Into<String>) -> Self {
        Self::AuthorizationCode { code: code.into() }
    }

    pub fn refresh_token(refresh_token: impl Into<String>) -> Self {
        Self::RefreshToken {
            refresh_token: refresh_token.into(),
        }
    }

    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::RefreshToken { .. } => "refresh_token",
        }
    }

    fn apply(&self, params: &mut Parameters) {
        params.insert("grant_type".into(), self.grant_type().into());
        match self {
            Self::AuthorizationCode { code } => {
                params.insert("code".into(), code.clone());
            }
            Self::RefreshToken { refresh_token } => {
                params.insert("refresh_token".into(), refresh_token.clone());
            }
        }
    }
}

/// Caller-controlled parts of an authorization request.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct AuthorizationOptions {
    /// Overrides the provider's default scopes
    #[builder(default)]
    pub scopes: Vec<String>,
    /// Overrides the generated state
    #[builder(into)]
    pub state: Option<String>,
    /// Extra query parameters, applied over the generated ones but under
    /// provider-fixed values
    #[builder(default)]
    pub extra: Parameters,
}

/// Authorization redirect plus the state the caller must keep for the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: String,
}

/// Identity of the registered client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub redirect_uri: Url,
}

/// Resource owner profile as returned by the details endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOwner {
    id: SmolStr,
    data: serde_json::Map<String, Value>,
}

impl ResourceOwner {
    pub const ID_KEY: &'static str = "resourceOwnerId";

    /// `data` with the owner id stored under [`Self::ID_KEY`]. The id from the
    /// token replaces any such field in the response.
    pub fn new(id: impl Into<SmolStr>, mut data: serde_json::Map<String, Value>) -> Self {
        let id = id.into();
        data.insert(Self::ID_KEY.into(), Value::String(id.to_string()));
        Self { id, data }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn to_map(&self) -> &serde_json::Map<String, Value> {
        &self.data
    }
}

/// Turns an error status or an `error` field into [`IdentityProviderError`].
pub fn check_response(
    status: StatusCode,
    body: &[u8],
) -> core::result::Result<(), IdentityProviderError> {
    let error = serde_json::from_slice::<Value>(body).ok().and_then(|data| {
        data.get("error").map(|e| match e {
            Value::String(s) => SmolStr::new(s),
            other => SmolStr::new(other.to_string()),
        })
    });
    if status.as_u16() >= 400 || error.is_some() {
        let message = error.unwrap_or_else(|| {
            SmolStr::new_static(status.canonical_reason().unwrap_or_default())
        });
        return Err(IdentityProviderError {
            message,
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }
    Ok(())
}

/// Drives authorization and token requests for one client.
#[derive(Debug, Clone)]
pub struct OAuthFlow<A, F> {
    credentials: ClientCredentials,
    authorization_endpoint: Url,
    token_endpoint: Url,
    augmenter: A,
    token_factory: F,
}

impl<A, F> OAuthFlow<A, F>
where
    A: SecretAugmenter,
    F: TokenFactory,
{
    pub fn new(
        credentials: ClientCredentials,
        authorization_endpoint: Url,
        token_endpoint: Url,
        augmenter: A,
        token_factory: F,
    ) -> Self {
        Self {
            credentials,
            authorization_endpoint,
            token_endpoint,
            augmenter,
            token_factory,
        }
    }

    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    pub fn token_factory(&self) -> &F {
        &self.token_factory
    }

    pub fn authorization_endpoint(&self) -> &Url {
        &self.authorization_endpoint
    }

    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    /// Standard authorization parameters, then the caller's extras, then
    /// `overrides` (`None` removes a parameter), then the augmenter.
    pub fn authorization_parameters<'o>(
        &self,
        options: AuthorizationOptions,
        default_scopes: &[String],
        overrides: impl IntoIterator<Item = (&'o str, Option<String>)>,
    ) -> Result<Parameters> {
        let scopes = if options.scopes.is_empty() {
            default_scopes
        } else {
            &options.scopes
        };
        let mut params = Parameters::new();
        params.insert("response_type".into(), "code".into());
        params.insert("approval_prompt".into(), "auto".into());
        params.insert(params::CLIENT_ID.into(), self.credentials.client_id.clone());
        params.insert(
            "redirect_uri".into(),
            self.credentials.redirect_uri.to_string(),
        );
        params.insert(params::SCOPE.into(), scopes.join(" "));
        params.insert(
            params::STATE.into(),
            options.state.unwrap_or_else(random_state),
        );
        params.extend(options.extra);
        for (name, value) in overrides {
            match value {
                Some(value) => params.insert(name.to_owned(), value),
                None => params.remove(name),
            };
        }
        Ok(self.augmenter.augment(params)?)
    }

    pub fn authorization_url(&self, params: &Parameters) -> Result<Url> {
        let mut url = self.authorization_endpoint.clone();
        url.set_query(Some(&serde_html_form::to_string(params)?));
        Ok(url)
    }

    /// Client id, redirect uri and grant fields, then the caller's `params`,
    /// then `defaults` for whatever is still missing, then the augmenter.
    pub fn token_parameters<'d>(
        &self,
        grant: &Grant,
        params: Parameters,
        defaults: impl IntoIterator<Item = (&'d str, String)>,
    ) -> Result<Parameters> {
        let mut merged = Parameters::new();
        merged.insert(params::CLIENT_ID.into(), self.credentials.client_id.clone());
        merged.insert(
            "redirect_uri".into(),
            self.credentials.redirect_uri.to_string(),
        );
        grant.apply(&mut merged);
        merged.extend(params);
        for (name, value) in defaults {
            merged.entry(name.to_owned()).or_insert(value);
        }
        Ok(self.augmenter.augment(merged)?)
    }

    /// Form-encoded `POST` to the token endpoint.
    pub fn token_request(&self, params: &Parameters) -> Result<Request<Vec<u8>>> {
        let body = serde_html_form::to_string(params)?;
        Ok(Request::builder()
            .method(Method::POST)
            .uri(self.token_endpoint.as_str())
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::ACCEPT, "application/json")
            .body(body.into_bytes())?)
    }

    /// Send a token request and build the provider token from the answer.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(url = %self.token_endpoint)))]
    pub async fn request_token<C>(&self, client: &C, request: Request<Vec<u8>>) -> Result<F::Token>
    where
        C: HttpClient + Sync,
    {
        let response = client
            .send_http(request)
            .await
            .map_err(EsiaError::transport)?;
        check_response(response.status(), response.body())?;
        let token_response: TokenResponse = serde_json::from_slice(response.body())?;
        Ok(self.token_factory.create_token(token_response)?)
    }

    /// `GET` a resource with the access token as bearer credentials.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(url = %url)))]
    pub async fn fetch_resource<C>(
        &self,
        client: &C,
        url: &Url,
        access_token: &str,
    ) -> Result<serde_json::Map<String, Value>>
    where
        C: HttpClient + Sync,
    {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
            .header(header::ACCEPT, "application/json")
            .body(Vec::new())?;
        let response = client
            .send_http(request)
            .await
            .map_err(EsiaError::transport)?;
        check_response(response.status(), response.body())?;
        Ok(serde_json::from_slice(response.body())?)
    }
}

/// Random UUIDv4 used as `state`.
pub fn random_state() -> String {
    uuid::Uuid::new_v4().to_string()
}
