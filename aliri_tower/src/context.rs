//! Carrying the authenticated token with the request

use std::sync::Arc;

use aliri_oidc::Token;
use http::Extensions;

#[derive(Clone)]
struct AuthenticatedToken(Arc<Token>);

/// Attaches an authenticated token to the request extensions
///
/// Any token attached earlier is replaced.
pub fn with_token(extensions: &mut Extensions, token: Arc<Token>) {
    let _ = extensions.insert(AuthenticatedToken(token));
}

/// The token attached by [`with_token`], if any
#[must_use]
pub fn token_from(extensions: &Extensions) -> Option<Arc<Token>> {
    extensions
        .get::<AuthenticatedToken>()
        .map(|t| Arc::clone(&t.0))
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;
    use crate::test::authenticated_token;

    #[test]
    fn empty_extensions_have_no_token() {
        assert!(token_from(&Extensions::new()).is_none());
    }

    #[tokio::test]
    async fn attached_token_is_shared() -> Result<()> {
        let token = Arc::new(authenticated_token(&["read"]).await?);

        let mut extensions = Extensions::new();
        with_token(&mut extensions, Arc::clone(&token));

        let found = token_from(&extensions).unwrap();
        assert!(Arc::ptr_eq(&found, &token));
        Ok(())
    }

    #[tokio::test]
    async fn attaching_again_replaces_token() -> Result<()> {
        let first = Arc::new(authenticated_token(&["read"]).await?);
        let second = Arc::new(authenticated_token(&["write"]).await?);

        let mut extensions = Extensions::new();
        with_token(&mut extensions, first);
        with_token(&mut extensions, Arc::clone(&second));

        assert!(Arc::ptr_eq(&token_from(&extensions).unwrap(), &second));
        Ok(())
    }
}
