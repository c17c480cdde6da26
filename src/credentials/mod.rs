use std::fs;
use std::path::PathBuf;

use log::debug;

/// Supplies the bearer token attached to store requests.
///
/// Implementations are consulted every time a request is built, never cached
/// ahead of time.
pub trait CredentialSource {
    fn bearer_token(&self) -> Option<String>;
}

/// A token fixed for the whole session, e.g. passed on the command line.
#[derive(Clone, Debug)]
pub struct StaticToken(pub String);

impl CredentialSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        let token = self.0.trim();
        (!token.is_empty()).then(|| token.to_owned())
    }
}

/// Reads the token from a file shared by every task of the process.
#[derive(Clone, Debug)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialSource for TokenFile {
    fn bearer_token(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                (!token.is_empty()).then(|| token.to_owned())
            }
            Err(err) => {
                debug!("credentials: no token at {} ({err})", self.path.display());
                None
            }
        }
    }
}
