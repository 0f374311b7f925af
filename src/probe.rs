use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProbeFailure;
use crate::targets::Target;
use crate::types::{FailureReason, ResultRecord};

/// One username/password pair to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Opens a connection to a target. Implementations own transport details and
/// their own connect timeout.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Box<dyn ProbeConnection>, ProbeFailure>;
}

/// An established connection on which credentials can be tried.
#[async_trait]
pub trait ProbeConnection: Send {
    /// Identification string reported by the device (firmware, server banner).
    fn identification(&self) -> Option<String>;

    /// `Ok(true)` when the device accepted the credential.
    async fn try_credential(&mut self, credential: &Credential) -> Result<bool, ProbeFailure>;
}

/// Ordered list of credentials to try against a target.
pub trait CredentialPolicy: Send + Sync {
    fn candidates(&self, target: &Target) -> Vec<Credential>;
}

/// The same ordered list for every target.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Vec<Credential>);

impl CredentialPolicy for StaticCredentials {
    fn candidates(&self, _target: &Target) -> Vec<Credential> {
        self.0.clone()
    }
}

/// Parse a credentials file: one `username:password` per line.
///
/// Everything after the first `:` is the password, so passwords may contain
/// colons. Lines starting with `#` and blank lines are ignored.
pub fn parse_credentials_str(s: &str) -> Result<Vec<Credential>> {
    let mut out = Vec::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((user, pass)) = line.split_once(':') else {
            bail!("line {line_no}: expected username:password");
        };
        if user.is_empty() {
            bail!("line {line_no}: empty username");
        }
        let cred = Credential::new(user, pass);
        if !out.contains(&cred) {
            out.push(cred);
        }
    }
    Ok(out)
}

/// Load credentials from a file path. Errors if the file cannot be read or parsed.
pub fn load_credentials_from_path(path: impl AsRef<Path>) -> Result<Vec<Credential>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read credentials file: {}", path.as_ref().display()))?;
    parse_credentials_str(&content)
}

/// Ephemeral bookkeeping for one worker's attempt on one target.
#[derive(Debug)]
pub struct ProbeAttempt {
    pub target: Target,
    pub started_at: Instant,
    pub cancelled: bool,
}

impl ProbeAttempt {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            started_at: Instant::now(),
            cancelled: false,
        }
    }

    /// Cooperative cancellation checkpoint.
    fn checkpoint(&mut self, cancel: &CancellationToken) -> Result<(), FailureReason> {
        if cancel.is_cancelled() {
            self.cancelled = true;
            return Err(FailureReason::Cancelled);
        }
        Ok(())
    }
}

enum Outcome {
    Accepted {
        credential: Credential,
        details: String,
    },
    Failed(FailureReason),
}

/// Run the connect + credential-trial sequence for one target and return its
/// terminal record. Never fails: every problem becomes a `failed` row.
pub async fn probe_target(
    prober: &dyn Prober,
    policy: &dyn CredentialPolicy,
    target: &Target,
    id: u64,
    cancel: &CancellationToken,
    attempt_timeout: Duration,
) -> ResultRecord {
    let mut attempt = ProbeAttempt::new(target.clone());
    let finished = time::timeout(
        attempt_timeout,
        run_attempt(prober, policy, &mut attempt, cancel),
    )
    .await;
    let outcome = match finished {
        Ok(outcome) => outcome,
        // A stopped session wins over a deadline that fired mid-call.
        Err(_) if cancel.is_cancelled() => {
            attempt.cancelled = true;
            Outcome::Failed(FailureReason::Cancelled)
        }
        Err(_) => Outcome::Failed(FailureReason::Timeout),
    };

    debug!(
        host = %target,
        id,
        elapsed_ms = attempt.started_at.elapsed().as_millis() as u64,
        cancelled = attempt.cancelled,
        "attempt finished"
    );

    match outcome {
        Outcome::Accepted {
            credential,
            details,
        } => ResultRecord::success(
            id,
            target.as_str(),
            credential.username,
            credential.password,
            details,
        ),
        Outcome::Failed(reason) => ResultRecord::failed(id, target.as_str(), reason),
    }
}

async fn run_attempt(
    prober: &dyn Prober,
    policy: &dyn CredentialPolicy,
    attempt: &mut ProbeAttempt,
    cancel: &CancellationToken,
) -> Outcome {
    match try_credentials(prober, policy, attempt, cancel).await {
        Ok(outcome) => outcome,
        Err(reason) => Outcome::Failed(reason),
    }
}

async fn try_credentials(
    prober: &dyn Prober,
    policy: &dyn CredentialPolicy,
    attempt: &mut ProbeAttempt,
    cancel: &CancellationToken,
) -> Result<Outcome, FailureReason> {
    attempt.checkpoint(cancel)?;
    let connected = prober.connect(&attempt.target).await;
    attempt.checkpoint(cancel)?;
    let mut conn = connected.map_err(|e| {
        debug!(host = %attempt.target, error = %e, "connect failed");
        e.reason(true)
    })?;

    for credential in policy.candidates(&attempt.target) {
        attempt.checkpoint(cancel)?;
        let verdict = conn.try_credential(&credential).await;
        attempt.checkpoint(cancel)?;
        match verdict {
            Ok(true) => {
                let details = conn
                    .identification()
                    .unwrap_or_else(|| "authenticated".to_string());
                return Ok(Outcome::Accepted {
                    credential,
                    details,
                });
            }
            Ok(false) | Err(ProbeFailure::Rejected) | Err(ProbeFailure::Other(_)) => continue,
            Err(e @ (ProbeFailure::TimedOut | ProbeFailure::Refused(_))) => {
                debug!(host = %attempt.target, error = %e, "device went away mid-trial");
                return Err(e.reason(false));
            }
        }
    }

    Err(FailureReason::AuthRejected)
}
