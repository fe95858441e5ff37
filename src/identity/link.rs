//! Continuation links: the URL a passwordless sign-in email carries.
//!
//! Links have the shape `{continue_url}?mode=signIn&oobCode=<token>&email=<addr>`.
//! The token is the only thing that must survive between requesting the link
//! and opening it.

use reqwest::Url;

use crate::error::AuthError;

const MODE_PARAM: &str = "mode";
const TOKEN_PARAM: &str = "oobCode";
const EMAIL_PARAM: &str = "email";

/// What kind of action an emailed link performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    SignIn,
    VerifyEmail,
}

impl LinkMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::SignIn => "signIn",
            Self::VerifyEmail => "verifyEmail",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "signIn" => Some(Self::SignIn),
            "verifyEmail" => Some(Self::VerifyEmail),
            _ => None,
        }
    }
}

/// A parsed continuation link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationLink {
    pub mode: Option<LinkMode>,
    pub token: String,
    pub email: Option<String>,
}

impl ContinuationLink {
    /// Build the URL for an emailed link.
    pub fn build(
        continue_url: &str,
        mode: LinkMode,
        token: &str,
        email: &str,
    ) -> Result<String, AuthError> {
        let mut url = Url::parse(continue_url)
            .map_err(|e| AuthError::InvalidContinueUrl(format!("{continue_url}: {e}")))?;
        url.query_pairs_mut()
            .append_pair(MODE_PARAM, mode.as_str())
            .append_pair(TOKEN_PARAM, token)
            .append_pair(EMAIL_PARAM, email);
        Ok(url.into())
    }

    /// Extract the continuation token from an incoming URL or bare query string.
    ///
    /// Returns `None` when no token is present.
    pub fn parse(incoming: &str) -> Option<Self> {
        let incoming = incoming.trim();
        let url = Url::parse(incoming).ok().or_else(|| {
            let query = incoming.trim_start_matches('?');
            Url::parse(&format!("http://localhost/?{query}")).ok()
        })?;

        let mut mode = None;
        let mut token = None;
        let mut email = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                MODE_PARAM => mode = LinkMode::parse(&value),
                TOKEN_PARAM if !value.is_empty() => token = Some(value.into_owned()),
                EMAIL_PARAM if !value.is_empty() => email = Some(value.into_owned()),
                _ => {}
            }
        }

        Some(Self {
            mode,
            token: token?,
            email,
        })
    }

    /// Whether `incoming` looks like a sign-in link.
    pub fn is_sign_in_link(incoming: &str) -> bool {
        Self::parse(incoming).is_some_and(|link| link.mode == Some(LinkMode::SignIn))
    }
}
