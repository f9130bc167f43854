//! The ESIA provider: the generic flow with signed parameters, ESIA endpoints
//! and scope-gated resource owner lookups.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::embed::{self, EmbedSection};
use crate::error::{ConfigError, ContractViolation, EsiaError, IdentityProviderError, Result};
use crate::http_client::HttpClient;
use crate::oauth::{
    self, AuthorizationOptions, AuthorizationRequest, ClientCredentials, Grant, OAuthFlow,
    ResourceOwner, TokenFactory, TokenResponse,
};
use crate::params::{self, ParameterSigner, Parameters};
use crate::signer::Signer;
use crate::token::{EsiaAccessToken, EsiaTokenFactory, InvalidTokenError, ScopedToken};

pub const DEFAULT_REMOTE_URL: &str = "https://esia.gosuslugi.ru";
pub const TEST_REMOTE_URL: &str = "https://esia-portal1.test.gosuslugi.ru";

pub const AUTHORIZATION_PATH: &str = "/aas/oauth2/ac";
pub const TOKEN_PATH: &str = "/aas/oauth2/te";
pub const PERSONS_PATH: &str = "/rs/prns/";

fn default_remote_url() -> String {
    DEFAULT_REMOTE_URL.to_owned()
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_owned(), "fullname".to_owned()]
}

/// Provider settings. Deserializable so it can live in an application config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct EsiaConfig {
    #[builder(into)]
    pub client_id: String,
    pub redirect_uri: Url,
    /// Base URL of the ESIA environment, without a trailing path
    #[builder(into, default = default_remote_url())]
    #[serde(default = "default_remote_url")]
    pub remote_url: String,
    /// ESIA certificate for the environment, used when verifying token signatures
    #[builder(into)]
    pub remote_certificate_path: PathBuf,
    /// Scopes requested when the caller does not name any
    #[builder(default = default_scopes())]
    #[serde(default = "default_scopes")]
    pub default_scopes: Vec<String>,
    /// Check access token signatures against `remote_certificate_path`
    #[builder(default)]
    #[serde(default)]
    pub verify_token_signature: bool,
}

type EsiaFlow = OAuthFlow<ParameterSigner<Arc<dyn Signer>>, EsiaTokenFactory>;

/// OAuth2 client for ESIA.
///
/// Every authorization and token request carries a `client_secret` computed by
/// the configured [`Signer`]. The provider is immutable after construction and
/// can be shared between tasks when the signer and client are.
pub struct EsiaProvider<C> {
    config: EsiaConfig,
    remote_base: String,
    flow: EsiaFlow,
    client: C,
}

impl<C> EsiaProvider<C> {
    /// Validate `config` and build the provider.
    ///
    /// Fails without touching the network when the remote URL is not an absolute
    /// http(s) URL, the client id is empty, or the certificate file is missing.
    pub fn new(config: EsiaConfig, signer: impl Signer + 'static, client: C) -> Result<Self> {
        Self::with_signer(config, Some(Arc::new(signer)), client)
    }

    /// Like [`EsiaProvider::new`], for callers holding an optional, shared signer.
    pub fn with_signer(
        config: EsiaConfig,
        signer: Option<Arc<dyn Signer>>,
        client: C,
    ) -> Result<Self> {
        if config.client_id.is_empty() {
            return Err(ConfigError::Empty("client_id").into());
        }
        let remote_base = validate_remote_url(&config.remote_url)?;
        if !config.remote_certificate_path.is_file() {
            return Err(ConfigError::MissingCertificate(config.remote_certificate_path.clone()).into());
        }
        let signer = signer.ok_or(ConfigError::MissingSigner)?;

        let issuer_key = config
            .verify_token_signature
            .then(|| config.remote_certificate_path.clone());
        let flow = OAuthFlow::new(
            ClientCredentials {
                client_id: config.client_id.clone(),
                redirect_uri: config.redirect_uri.clone(),
            },
            Url::parse(&format!("{remote_base}{AUTHORIZATION_PATH}"))?,
            Url::parse(&format!("{remote_base}{TOKEN_PATH}"))?,
            ParameterSigner::new(signer),
            EsiaTokenFactory::new(issuer_key),
        );

        #[cfg(feature = "tracing")]
        tracing::debug!(
            remote_url = %remote_base,
            client_id = %config.client_id,
            verify_token_signature = config.verify_token_signature,
            "esia provider configured"
        );

        Ok(Self {
            config,
            remote_base,
            flow,
            client,
        })
    }

    pub fn config(&self) -> &EsiaConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn base_authorization_url(&self) -> &Url {
        self.flow.authorization_endpoint()
    }

    pub fn base_access_token_url(&self) -> &Url {
        self.flow.token_endpoint()
    }

    pub fn default_scopes(&self) -> &[String] {
        &self.config.default_scopes
    }

    pub fn scope_separator(&self) -> &'static str {
        " "
    }

    /// Fresh opaque `state` value.
    pub fn generate_state(&self) -> String {
        oauth::random_state()
    }

    /// Signed query parameters for the authorization redirect.
    ///
    /// `access_type=online` and a fresh `timestamp` are always set and
    /// `approval_prompt` is never sent.
    pub fn authorization_parameters(&self, options: AuthorizationOptions) -> Result<Parameters> {
        self.flow.authorization_parameters(
            options,
            &self.config.default_scopes,
            [
                ("access_type", Some("online".to_owned())),
                ("approval_prompt", None),
                (params::TIMESTAMP, Some(params::timestamp_now())),
            ],
        )
    }

    /// Authorization redirect URL together with the state to remember.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub fn authorization_url(&self, options: AuthorizationOptions) -> Result<AuthorizationRequest> {
        let params = self.authorization_parameters(options)?;
        let url = self.flow.authorization_url(&params)?;
        let state = params.get(params::STATE).cloned().unwrap_or_default();
        Ok(AuthorizationRequest { url, state })
    }

    /// Signed token endpoint parameters. Caller values win over the defaults
    /// `scope=openid`, a fresh `state`, a fresh `timestamp` and `token_type=Bearer`.
    pub fn token_parameters(&self, grant: &Grant, caller: Parameters) -> Result<Parameters> {
        self.flow.token_parameters(
            grant,
            caller,
            [
                (params::SCOPE, "openid".to_owned()),
                (params::STATE, oauth::random_state()),
                (params::TIMESTAMP, params::timestamp_now()),
                ("token_type", "Bearer".to_owned()),
            ],
        )
    }

    /// Form `POST` to the token endpoint for `grant`.
    pub fn token_request(
        &self,
        grant: &Grant,
        params: Parameters,
    ) -> Result<http::Request<Vec<u8>>> {
        let params = self.token_parameters(grant, params)?;
        self.flow.token_request(&params)
    }

    pub fn check_response(
        &self,
        status: StatusCode,
        body: &[u8],
    ) -> core::result::Result<(), IdentityProviderError> {
        oauth::check_response(status, body)
    }

    pub fn create_access_token(
        &self,
        response: TokenResponse,
    ) -> core::result::Result<EsiaAccessToken, InvalidTokenError> {
        self.flow.token_factory().create_token(response)
    }

    /// Person details URL with the sections the token's scopes allow.
    pub fn resource_owner_details_url<T>(&self, token: &T) -> Result<Url>
    where
        T: ScopedToken + ?Sized,
    {
        let owner_id = token
            .resource_owner_id()
            .ok_or(ContractViolation("a resource owner id"))?;
        let scopes = token
            .scopes()
            .ok_or(ContractViolation("granted scopes"))?;
        let sections: Vec<EmbedSection> = embed::resolve(&scopes);
        Ok(Url::parse(&format!(
            "{}{PERSONS_PATH}{owner_id}?embed={}",
            self.remote_base,
            embed::embed_list(&sections)
        ))?)
    }

    /// Resource owner from an already fetched details response.
    pub fn create_resource_owner<T>(
        &self,
        data: serde_json::Map<String, serde_json::Value>,
        token: &T,
    ) -> Result<ResourceOwner>
    where
        T: ScopedToken + ?Sized,
    {
        let owner_id = token
            .resource_owner_id()
            .ok_or(ContractViolation("a resource owner id"))?;
        Ok(ResourceOwner::new(owner_id, data))
    }
}

impl<C: HttpClient + Sync> EsiaProvider<C> {
    /// Exchange a grant for a validated access token.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(grant_type = grant.grant_type())))]
    pub async fn access_token(&self, grant: Grant, params: Parameters) -> Result<EsiaAccessToken> {
        let request = self.token_request(&grant, params)?;
        self.flow.request_token(&self.client, request).await
    }

    /// Exchange the authorization `code` from the callback.
    pub async fn exchange_code(&self, code: &str) -> Result<EsiaAccessToken> {
        self.access_token(Grant::authorization_code(code), Parameters::new())
            .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<EsiaAccessToken> {
        self.access_token(Grant::refresh_token(refresh_token), Parameters::new())
            .await
    }

    /// Fetch the person profile with every section the token allows embedded.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(owner = %token.owner_id())))]
    pub async fn fetch_resource_owner(&self, token: &EsiaAccessToken) -> Result<ResourceOwner> {
        let url = self.resource_owner_details_url(token)?;
        let data = self
            .flow
            .fetch_resource(&self.client, &url, token.access_token())
            .await?;
        self.create_resource_owner(data, token)
    }
}

impl<C> fmt::Debug for EsiaProvider<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EsiaProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// `remote_url` without a trailing slash, if it is an absolute http(s) URL.
fn validate_remote_url(remote_url: &str) -> core::result::Result<String, EsiaError> {
    let invalid = || ConfigError::InvalidRemoteUrl(remote_url.into());
    let url = Url::parse(remote_url).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || !url.has_host() {
        return Err(invalid().into());
    }
    Ok(remote_url.trim_end_matches('/').to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::tests::MockClient;
    use crate::params::tests::RecordingSigner;
    use crate::token::ScopeSet;
    use crate::token::tests::{claims, encode_jwt};
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use chrono::Utc;
    use serde_json::json;
    use smol_str::SmolStr;
    use tempfile::NamedTempFile;

    fn certificate() -> NamedTempFile {
        NamedTempFile::new().unwrap()
    }

    fn config(cert: &NamedTempFile) -> EsiaConfig {
        EsiaConfig::builder()
            .client_id("MY_CLIENT")
            .redirect_uri(Url::parse("https://app.example/callback").unwrap())
            .remote_certificate_path(cert.path())
            .build()
    }

    fn provider(
        cert: &NamedTempFile,
        signer: Arc<RecordingSigner>,
        client: MockClient,
    ) -> EsiaProvider<MockClient> {
        EsiaProvider::with_signer(config(cert), Some(signer), client).unwrap()
    }

    struct Scoped {
        id: Option<&'static str>,
        scopes: Option<&'static [&'static str]>,
    }

    impl ScopedToken for Scoped {
        fn scopes(&self) -> Option<ScopeSet> {
            self.scopes
                .map(|scopes| scopes.iter().map(|s| (*s).into()).collect())
        }

        fn resource_owner_id(&self) -> Option<&str> {
            self.id
        }
    }

    fn fresh_access_token(scope: &str) -> String {
        let now = Utc::now().timestamp();
        let mut claims = claims(scope);
        claims["nbf"] = json!(now - 10);
        claims["iat"] = json!(now - 10);
        claims["exp"] = json!(now + 3600);
        encode_jwt(&json!({"alg": "RS256", "typ": "JWT"}), &claims, b"sig")
    }

    #[test]
    fn config_defaults() {
        let cert = certificate();
        let config = config(&cert);
        assert_eq!(config.remote_url, DEFAULT_REMOTE_URL);
        assert_eq!(config.default_scopes, ["openid", "fullname"]);
        assert!(!config.verify_token_signature);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EsiaConfig = serde_json::from_value(json!({
            "client_id": "MY_CLIENT",
            "redirect_uri": "https://app.example/callback",
            "remote_url": TEST_REMOTE_URL,
            "remote_certificate_path": "/etc/esia/test.cer"
        }))
        .unwrap();
        assert_eq!(config.remote_url, TEST_REMOTE_URL);
        assert_eq!(config.default_scopes, ["openid", "fullname"]);
    }

    #[test]
    fn endpoints_use_remote_url() {
        let cert = certificate();
        let mut config = config(&cert);
        config.remote_url = format!("{TEST_REMOTE_URL}/");
        let provider = EsiaProvider::new(config, RecordingSigner::default(), MockClient::default())
            .unwrap();
        assert_eq!(
            provider.base_authorization_url().as_str(),
            "https://esia-portal1.test.gosuslugi.ru/aas/oauth2/ac"
        );
        assert_eq!(
            provider.base_access_token_url().as_str(),
            "https://esia-portal1.test.gosuslugi.ru/aas/oauth2/te"
        );
    }

    #[test]
    fn rejects_relative_or_non_http_remote_url() {
        let cert = certificate();
        for remote_url in ["esia.gosuslugi.ru", "/aas", "ftp://esia.gosuslugi.ru", ""] {
            let mut config = config(&cert);
            config.remote_url = remote_url.into();
            let err = EsiaProvider::new(config, RecordingSigner::default(), MockClient::default())
                .unwrap_err();
            assert!(
                matches!(err, EsiaError::Config(ConfigError::InvalidRemoteUrl(_))),
                "{remote_url}: {err:?}"
            );
        }
    }

    #[test]
    fn rejects_missing_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&certificate());
        config.remote_certificate_path = dir.path().join("esia.cer");
        let err = EsiaProvider::new(config, RecordingSigner::default(), MockClient::default())
            .unwrap_err();
        assert!(matches!(err, EsiaError::Config(ConfigError::MissingCertificate(_))));
    }

    #[test]
    fn rejects_missing_signer_and_empty_client_id() {
        let cert = certificate();
        let err = EsiaProvider::with_signer(config(&cert), None, MockClient::default()).unwrap_err();
        assert!(matches!(err, EsiaError::Config(ConfigError::MissingSigner)));

        let mut config = config(&cert);
        config.client_id.clear();
        let err = EsiaProvider::new(config, RecordingSigner::default(), MockClient::default())
            .unwrap_err();
        assert!(matches!(err, EsiaError::Config(ConfigError::Empty("client_id"))));
    }

    #[test]
    fn authorization_url_is_signed_and_fixed() {
        let cert = certificate();
        let signer = Arc::new(RecordingSigner::with_signature(b"sig"));
        let provider = provider(&cert, signer.clone(), MockClient::default());
        let options = AuthorizationOptions::builder()
            .extra(
                [("access_type".to_owned(), "offline".to_owned())]
                    .into_iter()
                    .collect(),
            )
            .build();

        let request = provider.authorization_url(options).unwrap();
        assert_eq!(request.url.path(), AUTHORIZATION_PATH);
        let query: Parameters = request.url.query_pairs().into_owned().collect();

        assert_eq!(query["access_type"], "online");
        assert!(!query.contains_key("approval_prompt"));
        assert_eq!(query["scope"], "openid fullname");
        assert_eq!(query["client_secret"], "c2ln");
        assert_eq!(query["state"], request.state);
        assert!(uuid::Uuid::parse_str(&request.state).is_ok());

        let message = signer.last_message().unwrap();
        let expected = format!(
            "openid fullname{}MY_CLIENT{}",
            query["timestamp"], request.state
        );
        assert_eq!(message, expected);
    }

    #[test]
    fn token_parameters_defaults_and_caller_override() {
        let cert = certificate();
        let provider = provider(&cert, Default::default(), MockClient::default());
        let params = provider
            .token_parameters(&Grant::authorization_code("abc"), Parameters::new())
            .unwrap();
        assert_eq!(params["scope"], "openid");
        assert_eq!(params["token_type"], "Bearer");
        assert_eq!(params["grant_type"], "authorization_code");
        assert!(uuid::Uuid::parse_str(&params["state"]).is_ok());
        assert!(params.contains_key("timestamp"));
        assert!(params.contains_key("client_secret"));

        let caller = [("scope".to_owned(), "openid email".to_owned())]
            .into_iter()
            .collect();
        let params = provider
            .token_parameters(&Grant::authorization_code("abc"), caller)
            .unwrap();
        assert_eq!(params["scope"], "openid email");
    }

    #[test]
    fn details_url_embeds_granted_sections() {
        let cert = certificate();
        let provider = provider(&cert, Default::default(), MockClient::default());
        let token = Scoped {
            id: Some("1000012345"),
            scopes: Some(&["openid", "vehicles", "email"]),
        };
        let url = provider.resource_owner_details_url(&token).unwrap();
        assert_eq!(
            url.as_str(),
            "https://esia.gosuslugi.ru/rs/prns/1000012345?embed=(contacts.elements,vehicles.elements)"
        );

        let bare = Scoped {
            id: Some("1"),
            scopes: Some(&["openid"]),
        };
        let url = provider.resource_owner_details_url(&bare).unwrap();
        assert_eq!(url.query(), Some("embed=()"));
    }

    #[test]
    fn details_url_requires_scoped_token() {
        let cert = certificate();
        let provider = provider(&cert, Default::default(), MockClient::default());
        let plain = TokenResponse {
            access_token: "opaque".into(),
            token_type: None,
            expires_in: None,
            refresh_token: None,
            id_token: None,
            state: None,
            extra: Default::default(),
        };
        let err = provider.resource_owner_details_url(&plain).unwrap_err();
        assert!(matches!(err, EsiaError::ContractViolation(_)));

        let no_scopes = Scoped {
            id: Some("1"),
            scopes: None,
        };
        let err = provider.resource_owner_details_url(&no_scopes).unwrap_err();
        assert!(matches!(err, EsiaError::ContractViolation(ContractViolation("granted scopes"))));
    }

    #[tokio::test]
    async fn exchange_code_and_fetch_owner() {
        let cert = certificate();
        let client = MockClient::default();
        let provider = provider(&cert, Default::default(), client.clone());

        client
            .push(
                StatusCode::OK,
                json!({
                    "access_token": fresh_access_token("http://esia.gosuslugi.ru/usr_org?oid=1000012345 openid"),
                    "token_type": "Bearer",
                    "expires_in": 3600,
                    "refresh_token": "refresh",
                    "state": "s"
                }),
            )
            .await;
        client
            .push(StatusCode::OK, json!({"firstName": "Ivan", "lastName": "Ivanov", "resourceOwnerId": "42"}))
            .await;

        let token = provider.exchange_code("the-code").await.unwrap();
        assert_eq!(token.owner_id(), "1000012345");
        let expected: ScopeSet = ["/usr_org", "openid"].into_iter().map(SmolStr::new).collect();
        assert_eq!(token.granted_scopes(), expected);

        let owner = provider.fetch_resource_owner(&token).await.unwrap();
        assert_eq!(owner.id(), "1000012345");
        assert_eq!(owner.get("lastName").unwrap(), "Ivanov");
        assert_eq!(owner.get(ResourceOwner::ID_KEY).unwrap(), "1000012345");

        let requests = client.requests.lock().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].uri(), "https://esia.gosuslugi.ru/aas/oauth2/te");
        let form: Parameters = serde_html_form::from_bytes(requests[0].body()).unwrap();
        assert_eq!(form["code"], "the-code");
        assert!(form.contains_key("client_secret"));
        assert_eq!(
            requests[1].uri(),
            "https://esia.gosuslugi.ru/rs/prns/1000012345?embed=()"
        );
    }

    #[tokio::test]
    async fn refresh_surfaces_provider_error() {
        let cert = certificate();
        let client = MockClient::default();
        let provider = provider(&cert, Default::default(), client.clone());
        client
            .push(
                StatusCode::BAD_REQUEST,
                json!({"error": "invalid_grant", "error_description": "expired"}),
            )
            .await;
        let err = provider.refresh("stale").await.unwrap_err();
        assert!(matches!(err, EsiaError::IdentityProvider(ref e) if e.message == "invalid_grant"));

        let requests = client.requests.lock().await;
        let form: Parameters = serde_html_form::from_bytes(requests[0].body()).unwrap();
        assert_eq!(form["grant_type"], "refresh_token");
        assert_eq!(form["refresh_token"], "stale");
    }

    #[tokio::test]
    async fn token_without_subject_is_rejected() {
        let cert = certificate();
        let client = MockClient::default();
        let provider = provider(&cert, Default::default(), client.clone());
        let now = Utc::now().timestamp();
        let access_token = encode_jwt(
            &json!({"alg": "RS256"}),
            &json!({"scope": "openid", "exp": now + 60}),
            b"sig",
        );
        client
            .push(StatusCode::OK, json!({"access_token": access_token}))
            .await;
        let err = provider.exchange_code("c").await.unwrap_err();
        assert!(matches!(
            err,
            EsiaError::InvalidToken(InvalidTokenError::MissingSubject { .. })
        ));
    }

    #[test]
    fn client_secret_is_base64url_of_signature() {
        let cert = certificate();
        let signer = Arc::new(RecordingSigner::with_signature(&[0xfb, 0xff, 0xbf]));
        let provider = provider(&cert, signer, MockClient::default());
        let params = provider
            .token_parameters(&Grant::refresh_token("r"), Parameters::new())
            .unwrap();
        assert_eq!(params["client_secret"], URL_SAFE_NO_PAD.encode([0xfb, 0xff, 0xbf]));
    }
}
