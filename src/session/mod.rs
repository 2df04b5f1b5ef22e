//! Authenticated session core: the shared HTTP client, the cookie jar with
//! its sliding-token merge, and cookie persistence.

mod client;
mod cookies;

pub use client::{CONNECT_TIMEOUT, GetOptions, READ_TIMEOUT, SessionClient, USER_AGENT};
pub use cookies::{CookieStore, CookieStoreError};
