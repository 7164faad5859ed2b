//! Authentication challenges
//!
//! A `401` carrying `WWW-Authenticate` is a challenge. If an
//! [`AuthenticationDelegate`] is attached to the request and claims the
//! protection space, it chooses a [`Credential`] and the request is re-sent.
//! Without a delegate, or after [`MAX_CHALLENGE_ROUNDS`], the challenge
//! response is treated as the final response.

use super::request::ResponseMetadata;
use async_trait::async_trait;
use reqwest::header::{self, HeaderMap};
use url::Url;

/// Challenge rounds allowed per attempt before giving up
pub const MAX_CHALLENGE_ROUNDS: u32 = 5;

/// Where credentials apply: origin, scheme and realm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionSpace {
    /// Host that issued the challenge
    pub host: String,
    /// Port, if known
    pub port: Option<u16>,
    /// `http` or `https`
    pub protocol: String,
    /// Authentication scheme, lower-cased (e.g. `basic`, `bearer`)
    pub scheme: String,
    /// Realm parameter, if present
    pub realm: Option<String>,
}

/// A challenge handed to the delegate
#[derive(Debug, Clone)]
pub struct AuthenticationChallenge {
    /// Space the credentials are for
    pub protection_space: ProtectionSpace,
    /// Challenges already answered in this attempt
    pub previous_failure_count: u32,
    /// The `401` response that raised the challenge
    pub failure_response: ResponseMetadata,
}

/// Credentials a delegate can supply
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// HTTP Basic
    Basic {
        /// User name
        username: String,
        /// Password, if any
        password: Option<String>,
    },
    /// Bearer token
    Bearer(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

impl Credential {
    pub(crate) fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credential::Basic { username, password } => builder.basic_auth(username, password.as_ref()),
            Credential::Bearer(token) => builder.bearer_auth(token),
        }
    }
}

/// How the delegate answers a challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeDisposition {
    /// Re-send the request with this credential
    UseCredential(Credential),
    /// Give up; the challenge response becomes the final response
    Reject,
}

/// Answers authentication challenges on behalf of the client
#[async_trait]
pub trait AuthenticationDelegate: Send + Sync {
    /// True if this delegate can answer challenges for `space`
    fn can_authenticate(&self, space: &ProtectionSpace) -> bool;

    /// Answer one challenge
    async fn handle_challenge(&self, challenge: &AuthenticationChallenge) -> ChallengeDisposition;
}

/// Protection space described by a `401` response, if it is a challenge
pub(crate) fn protection_space(
    url: &Url,
    status: reqwest::StatusCode,
    headers: &HeaderMap,
) -> Option<ProtectionSpace> {
    if status != reqwest::StatusCode::UNAUTHORIZED {
        return None;
    }
    let raw = headers.get(header::WWW_AUTHENTICATE)?.to_str().ok()?;
    let (scheme, realm) = parse_challenge(raw)?;
    Some(ProtectionSpace {
        host: url.host_str()?.to_ascii_lowercase(),
        port: url.port_or_known_default(),
        protocol: url.scheme().to_string(),
        scheme,
        realm,
    })
}

/// Split `Scheme param=value, ...` into lower-cased scheme and realm
fn parse_challenge(raw: &str) -> Option<(String, Option<String>)> {
    let raw = raw.trim();
    let (scheme, params) = match raw.split_once(char::is_whitespace) {
        Some((scheme, params)) => (scheme, params),
        None => (raw, ""),
    };
    if scheme.is_empty() {
        return None;
    }

    let realm = params.split(',').find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("realm")
            .then(|| value.trim().trim_matches('"').to_string())
    });
    Some((scheme.to_ascii_lowercase(), realm))
}
