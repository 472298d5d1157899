//! Request matching for the tunnel endpoint
//!
//! Decides which inbound requests belong to the tunnel. Anything that
//! does not match is left to the rest of the HTTP pipeline.

use hyper::header::{HeaderMap, HeaderName};
use polltunnel_shared::{Error, Result};

/// Selects requests that should be handed to the tunnel server
pub trait RequestMatcher: Send + Sync {
    fn matches(&self, path: &str, headers: &HeaderMap) -> bool;
}

/// Matches an exact request path
#[derive(Debug, Clone)]
pub struct PathMatcher {
    path: String,
}

impl PathMatcher {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self { path })
    }
}

impl RequestMatcher for PathMatcher {
    fn matches(&self, path: &str, _headers: &HeaderMap) -> bool {
        self.path == path
    }
}

/// Matches an exact path carrying a shared secret header
#[derive(Debug, Clone)]
pub struct SecuredMatcher {
    path: PathMatcher,
    header: HeaderName,
    secret: String,
}

impl SecuredMatcher {
    pub fn new(path: impl Into<String>, header: &str, secret: impl Into<String>) -> Result<Self> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|_| Error::Config(format!("invalid secret header name '{}'", header)))?;
        let secret = secret.into();
        if secret.is_empty() {
            return Err(Error::Config("secret must not be empty".into()));
        }
        Ok(Self {
            path: PathMatcher::new(path)?,
            header,
            secret,
        })
    }
}

impl RequestMatcher for SecuredMatcher {
    fn matches(&self, path: &str, headers: &HeaderMap) -> bool {
        if !self.path.matches(path, headers) {
            return false;
        }
        headers
            .get(&self.header)
            .map(|provided| provided.as_bytes() == self.secret.as_bytes())
            .unwrap_or(false)
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::Config(format!("tunnel path '{}' must start with '/'", path)));
    }
    Ok(())
}
