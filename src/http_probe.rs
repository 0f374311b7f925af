//! LuCI-style web login prober.
//!
//! Reachability is a GET of the first login path that answers 200/401/403.
//! A credential is tried under each form field naming in turn and is
//! accepted when the POST answers with a redirect or sets a `sysauth`
//! session cookie. Any answer other than 404/500 is final for that
//! credential.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{SERVER, SET_COOKIE};
use reqwest::{redirect, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::error::ProbeFailure;
use crate::probe::{Credential, ProbeConnection, Prober};
use crate::targets::Target;

#[derive(Debug, Clone)]
pub struct HttpLoginConfig {
    /// Candidate login pages, tried in order.
    pub login_paths: Vec<String>,
    /// `(username field, password field)` pairs, tried in order.
    pub field_variants: Vec<(String, String)>,
    pub use_https: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpLoginConfig {
    fn default() -> Self {
        Self {
            login_paths: vec![
                "/cgi-bin/luci".into(),
                "/cgi-bin/luci/admin".into(),
                "/".into(),
            ],
            field_variants: vec![
                ("luci_username".into(), "luci_password".into()),
                ("username".into(), "password".into()),
                ("auth_username".into(), "auth_password".into()),
            ],
            use_https: false,
            connect_timeout: Duration::from_millis(3000),
            request_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpLoginProber {
    client: Client,
    config: HttpLoginConfig,
}

impl HttpLoginProber {
    pub fn new(config: HttpLoginConfig) -> Result<Self> {
        let client = Client::builder()
            // Routers ship self-signed certificates.
            .danger_accept_invalid_certs(true)
            .redirect(redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    pub fn login_url(&self, target: &Target, path: &str) -> String {
        let scheme = if self.config.use_https { "https" } else { "http" };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        format!("{scheme}://{}{path}", authority(target))
    }
}

/// URL authority for a target; bare IPv6 literals need brackets.
fn authority(target: &Target) -> String {
    let s = target.as_str();
    if !s.starts_with('[') && s.matches(':').count() > 1 {
        format!("[{s}]")
    } else {
        s.to_string()
    }
}

fn classify(err: reqwest::Error) -> ProbeFailure {
    if err.is_timeout() {
        ProbeFailure::TimedOut
    } else if err.is_connect() {
        ProbeFailure::Refused(err.to_string())
    } else {
        ProbeFailure::Other(err.to_string())
    }
}

#[async_trait]
impl Prober for HttpLoginProber {
    async fn connect(&self, target: &Target) -> Result<Box<dyn ProbeConnection>, ProbeFailure> {
        for path in &self.config.login_paths {
            let url = self.login_url(target, path);
            let resp = self.client.get(&url).send().await.map_err(classify)?;
            let status = resp.status();
            if !matches!(
                status,
                StatusCode::OK | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) {
                debug!(%url, %status, "not a login page");
                continue;
            }
            let server = resp
                .headers()
                .get(SERVER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            // Drain the body so the connection can be reused for the POSTs.
            let _ = resp.bytes().await;
            return Ok(Box::new(HttpLoginConnection {
                client: self.client.clone(),
                url,
                identification: server.unwrap_or_else(|| path.clone()),
                field_variants: self.config.field_variants.clone(),
            }));
        }
        Err(ProbeFailure::Other("no login page found".into()))
    }
}

struct HttpLoginConnection {
    client: Client,
    url: String,
    identification: String,
    field_variants: Vec<(String, String)>,
}

impl HttpLoginConnection {
    async fn post_login(
        &self,
        username_field: &str,
        password_field: &str,
        credential: &Credential,
    ) -> Result<(StatusCode, bool), ProbeFailure> {
        let form = [
            (username_field, credential.username.as_str()),
            (password_field, credential.password.as_str()),
        ];
        let resp = self
            .client
            .post(&self.url)
            .form(&form)
            .send()
            .await
            .map_err(classify)?;
        let status = resp.status();
        let redirected = matches!(status, StatusCode::FOUND | StatusCode::SEE_OTHER);
        let session_cookie = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|c| c.contains("sysauth"));
        Ok((status, redirected || session_cookie))
    }
}

#[async_trait]
impl ProbeConnection for HttpLoginConnection {
    fn identification(&self) -> Option<String> {
        Some(self.identification.clone())
    }

    async fn try_credential(&mut self, credential: &Credential) -> Result<bool, ProbeFailure> {
        let mut last_error = None;
        for (username_field, password_field) in &self.field_variants {
            match self.post_login(username_field, password_field, credential).await {
                Ok((_, true)) => return Ok(true),
                // The form exists but rejected the login; other namings won't help.
                Ok((status, false))
                    if !matches!(
                        status,
                        StatusCode::NOT_FOUND | StatusCode::INTERNAL_SERVER_ERROR
                    ) =>
                {
                    return Ok(false)
                }
                Ok(_) => {}
                Err(e @ ProbeFailure::Other(_)) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }
}
