//! Process-wide environment shared by every client: the cookie store and
//! TLS validation policy. Configured once, before the first client is
//! constructed, and immutable thereafter.

use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use reqwest::cookie::Jar;

use crate::Error;

/// Shared cookie store and TLS policy.
pub struct Environment {
    /// Cookie jar shared by the HTTP transport and the WebSocket handshake.
    pub cookie_jar: Arc<Jar>,
    /// Disable server-certificate validation on the HTTP stack. Testing
    /// environments only.
    pub accept_invalid_certs: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            cookie_jar: Arc::new(Jar::default()),
            accept_invalid_certs: false,
        }
    }
}

struct Slot {
    env: Option<Arc<Environment>>,
    sealed: bool,
}

lazy_static! {
    static ref ENVIRONMENT: Mutex<Slot> = Mutex::new(Slot {
        env: None,
        sealed: false,
    });
}

/// Install the process-wide environment. Fails with
/// [`Error::InvalidState`] once any client has read it.
pub fn set_environment(env: Environment) -> Result<(), Error> {
    let mut slot = ENVIRONMENT.lock();
    if slot.sealed {
        return Err(Error::InvalidState("environment is already in use"));
    }
    slot.env = Some(Arc::new(env));
    Ok(())
}

/// The active environment; seals it against further mutation.
pub(crate) fn environment() -> Arc<Environment> {
    let mut slot = ENVIRONMENT.lock();
    slot.sealed = true;
    slot.env
        .get_or_insert_with(|| Arc::new(Environment::default()))
        .clone()
}
