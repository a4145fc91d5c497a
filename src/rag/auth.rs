//! Request authentication for the model and knowledge-base endpoints.
//!
//! SigV4 signs with credentials from the standard AWS chain (environment,
//! profiles, SSO, instance and task roles). A bearer API key is accepted
//! for the model runtime only; the knowledge-base runtime requires SigV4.

use crate::error::{RagError, Result};
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningParams, SigningSettings, sign};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use tokio::sync::OnceCell;
use tracing::debug;

/// SigV4 service name of both the runtime and the agent-runtime endpoints.
pub const SIGNING_NAME: &str = "bedrock";

pub const DEFAULT_API_KEY_ENV: &str = "AWS_BEARER_TOKEN_BEDROCK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Sigv4,
    Bearer,
    /// Unauthenticated, for local stand-ins of the services.
    None,
}

#[derive(Clone)]
pub enum Auth {
    None,
    Bearer(String),
    SigV4 {
        credentials: SharedCredentialsProvider,
        region: String,
    },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::None => write!(f, "None"),
            Auth::Bearer(_) => write!(f, "Bearer(<redacted>)"),
            Auth::SigV4 { region, .. } => f.debug_struct("SigV4").field("region", region).finish(),
        }
    }
}

impl Auth {
    /// Attach credentials to `builder`. `headers` and `body` must be exactly
    /// what the request carries, since SigV4 covers both.
    pub async fn authorize(
        &self,
        builder: RequestBuilder,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<RequestBuilder> {
        match self {
            Auth::None => Ok(builder),
            Auth::Bearer(key) => Ok(builder.bearer_auth(key)),
            Auth::SigV4 {
                credentials,
                region,
            } => {
                let credentials = credentials
                    .provide_credentials()
                    .await
                    .map_err(|e| RagError::Auth(format!("cannot resolve AWS credentials: {}", e)))?;
                let identity: Identity = credentials.into();
                let signed = signing_headers(&identity, region, url, headers, body, SystemTime::now())?;
                Ok(signed
                    .into_iter()
                    .fold(builder, |b, (name, value)| b.header(name, value)))
            }
        }
    }
}

/// Headers that sign a POST of `body` to `url` at `time`.
pub fn signing_headers(
    identity: &Identity,
    region: &str,
    url: &str,
    headers: &[(&str, &str)],
    body: &[u8],
    time: SystemTime,
) -> Result<Vec<(String, String)>> {
    let params: SigningParams = v4::SigningParams::builder()
        .identity(identity)
        .region(region)
        .name(SIGNING_NAME)
        .time(time)
        .settings(SigningSettings::default())
        .build()
        .map_err(|e| RagError::Auth(format!("invalid signing parameters: {}", e)))?
        .into();

    let request = SignableRequest::new("POST", url, headers.iter().copied(), SignableBody::Bytes(body))
        .map_err(|e| RagError::Auth(format!("cannot sign request to {}: {}", url, e)))?;

    let (instructions, _signature) = sign(request, &params)
        .map_err(|e| RagError::Auth(format!("cannot sign request to {}: {}", url, e)))?
        .into_parts();

    Ok(instructions
        .headers()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect())
}

pub fn api_key_from_env(var: Option<&str>) -> Option<String> {
    std::env::var(var.unwrap_or(DEFAULT_API_KEY_ENV))
        .ok()
        .filter(|k| !k.is_empty())
}

/// Turns configured modes into [`Auth`] values. The AWS credential chain is
/// loaded on first use and shared by every endpoint.
pub struct AuthResolver {
    region: String,
    credentials: OnceCell<SharedCredentialsProvider>,
}

impl AuthResolver {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            credentials: OnceCell::new(),
        }
    }

    pub async fn resolve(&self, mode: AuthMode, api_key_env: Option<&str>) -> Result<Auth> {
        match mode {
            AuthMode::None => Ok(Auth::None),
            AuthMode::Bearer => api_key_from_env(api_key_env).map(Auth::Bearer).ok_or_else(|| {
                RagError::Auth(format!(
                    "bearer auth selected but {} is not set",
                    api_key_env.unwrap_or(DEFAULT_API_KEY_ENV)
                ))
            }),
            AuthMode::Sigv4 => {
                let credentials = self
                    .credentials
                    .get_or_try_init(|| load_credentials(&self.region))
                    .await?
                    .clone();
                Ok(Auth::SigV4 {
                    credentials,
                    region: self.region.clone(),
                })
            }
        }
    }
}

async fn load_credentials(region: &str) -> Result<SharedCredentialsProvider> {
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await;
    debug!(region, "Loaded AWS configuration");

    config
        .credentials_provider()
        .ok_or_else(|| RagError::Auth("no AWS credentials provider available".into()))
}
