use std::sync::Arc;

use super::error::ApiResult;
use super::events::BoxFuture;

/// Supplies bearer credentials to the HTTP backend.
///
/// Token storage and login flows live outside this crate; the backend only asks for the
/// current token and requests a refresh after a `401`.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token<'a>(&'a self) -> BoxFuture<'a, ApiResult<Option<String>>>;
    fn refresh<'a>(&'a self) -> BoxFuture<'a, ApiResult<Option<String>>>;
}

/// Fixed API key credentials; refresh hands back the same key.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        let api_key = api_key.into().trim().to_string();
        Self {
            token: (!api_key.is_empty()).then_some(api_key),
        }
    }

    pub fn anonymous() -> Arc<dyn CredentialProvider> {
        Arc::new(Self::default())
    }
}

impl CredentialProvider for StaticCredentials {
    fn bearer_token<'a>(&'a self) -> BoxFuture<'a, ApiResult<Option<String>>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }

    fn refresh<'a>(&'a self) -> BoxFuture<'a, ApiResult<Option<String>>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }
}
