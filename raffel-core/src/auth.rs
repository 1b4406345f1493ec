//! Authentication seam. Strategy implementations (bearer, OAuth2, OIDC,
//! sessions) live outside the core; the pipeline only carries the verified
//! [`AuthRecord`](crate::context::AuthRecord) in the call context.

use std::future::Future;
use std::pin::Pin;

use crate::context::{AuthRecord, Context};

/// Verifies a credential into a principal. Consumed by auth interceptors.
pub trait AuthStrategy: Send + Sync {
    /// Verify `token` (e.g. the `authorization` metadata value). `None`
    /// means the credential is invalid or expired.
    fn verify<'a>(
        &'a self,
        token: &'a str,
        ctx: &'a Context,
    ) -> Pin<Box<dyn Future<Output = Option<AuthRecord>> + Send + 'a>>;
}
