//! Single sign-on for every deployed context.
//! The login service talks to the credential store and owns `activeUsers`;
//! per-context authenticators decide each request from that map alone.

mod authenticator;
mod login_service;
mod principal;
mod provider;
mod request_context;

pub use authenticator::{AuthDecision, AuthMode, AuthenticatorFactory, SsoAuthenticator, SsoSettings};
pub use login_service::{LoginService, LoginSettings};
pub use principal::Principal;
pub use provider::{CouchDbAuthenticator, CouchDbSettings, CredentialStore};
pub use request_context::{parse_cookie, parse_form, AuthRequest, RequestContext};
