//! Challenge/response login through a [`Portal`].
//!
//! The portal is a connection's root object. A client asks it for a
//! challenge, answers with `SHA-256(challenge ‖ password)`, and gets back an
//! avatar exported under the identity the [`Realm`] vouched for.

use crate::broker::Broker;
use crate::error::{CallError, RemoteError};
use crate::flavor::{HandlerFuture, Invocation, MethodTable, Referenceable};
use crate::reference::RemoteReference;
use crate::transport::Root;
use crate::value::{FromValue, Value};
use async_trait::async_trait;
use perspective_core::Identity;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

/// Error tag for rejected credentials.
pub const UNAUTHORIZED: &str = "perspective.unauthorized";

const CHALLENGE_BYTES: usize = 32;

/// Fresh random challenge.
pub fn challenge() -> Vec<u8> {
    let mut bytes = vec![0u8; CHALLENGE_BYTES];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes
}

/// The response a client holding `password` sends for `challenge`.
pub fn respond(challenge: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Credentials handed to a [`Realm`]. The password itself never crosses
/// the wire.
#[derive(Debug, Clone)]
pub struct UsernameHashedPassword {
    pub username: String,
    pub challenge: Vec<u8>,
    pub response: Vec<u8>,
}

impl UsernameHashedPassword {
    /// Whether the response was computed from `password`.
    pub fn check_password(&self, password: &str) -> bool {
        let expected = respond(&self.challenge, password);
        expected.as_slice().ct_eq(self.response.as_slice()).into()
    }
}

/// A successful login.
pub struct LoggedIn {
    pub identity: Identity,
    pub avatar: Arc<dyn Referenceable>,
    logout: Option<Box<dyn FnOnce() + Send>>,
}

impl LoggedIn {
    pub fn new<T: Referenceable>(identity: Identity, avatar: Arc<T>) -> Self {
        Self {
            identity,
            avatar,
            logout: None,
        }
    }

    /// Run `logout` when the connection that logged in closes.
    pub fn on_logout(mut self, logout: impl FnOnce() + Send + 'static) -> Self {
        self.logout = Some(Box::new(logout));
        self
    }
}

/// Checks credentials and hands out avatars.
#[async_trait]
pub trait Realm: Send + Sync + 'static {
    /// Reject bad credentials with [`unauthorized`].
    ///
    /// `mind` is the client-side object the client offered, if any.
    /// `interfaces` names the avatar interfaces the client asked for.
    async fn login(
        &self,
        credentials: UsernameHashedPassword,
        mind: Option<RemoteReference>,
        interfaces: Vec<String>,
    ) -> Result<LoggedIn, RemoteError>;
}

/// The error a [`Realm`] returns for bad credentials.
pub fn unauthorized(message: impl Into<String>) -> RemoteError {
    RemoteError::new(UNAUTHORIZED, message)
}

/// Root that serves a login portal on every connection.
pub struct Portal {
    realm: Arc<dyn Realm>,
}

impl Portal {
    pub fn new(realm: Arc<dyn Realm>) -> Self {
        Self { realm }
    }
}

impl Root for Portal {
    fn root_object(&self, broker: &Broker) -> Arc<dyn Referenceable> {
        tracing::debug!("broker {} awaiting login", broker.id());
        Arc::new(PortalRoot {
            realm: self.realm.clone(),
        })
    }
}

struct PortalRoot {
    realm: Arc<dyn Realm>,
}

static PORTAL_METHODS: LazyLock<MethodTable<PortalRoot>> = LazyLock::new(|| {
    MethodTable::<PortalRoot>::remote().sync("login", |portal, invocation| {
        invocation.args.expect(1, &["interfaces"])?;
        let username: String = invocation.args.get(0)?;
        let interfaces: Vec<String> = invocation
            .args
            .keyword("interfaces")?
            .unwrap_or_default();
        let challenge = challenge();
        let challenger = Challenger {
            realm: portal.realm.clone(),
            username,
            challenge: challenge.clone(),
            interfaces,
            answered: AtomicBool::new(false),
        };
        Ok(Value::List(vec![
            Value::Bytes(challenge),
            Value::reference(Arc::new(challenger)),
        ]))
    })
});

impl Referenceable for PortalRoot {
    fn remote_message(self: Arc<Self>, invocation: Invocation) -> HandlerFuture {
        PORTAL_METHODS.dispatch(self, invocation)
    }
}

/// Holds one challenge until it is answered.
struct Challenger {
    realm: Arc<dyn Realm>,
    username: String,
    challenge: Vec<u8>,
    interfaces: Vec<String>,
    answered: AtomicBool,
}

static CHALLENGER_METHODS: LazyLock<MethodTable<Challenger>> = LazyLock::new(|| {
    MethodTable::<Challenger>::remote().on("respond", |challenger, invocation| async move {
        let args = &invocation.args;
        if args.len() > 2 || !args.keywords().is_empty() {
            return Err(RemoteError::bad_arguments(
                "respond takes a response and an optional mind",
            ));
        }
        let response = args.get::<Value>(0)?.into_bytes()?;
        let mind = args.get_opt::<Option<RemoteReference>>(1)?.flatten();

        if challenger.answered.swap(true, Ordering::AcqRel) {
            return Err(unauthorized("challenge was already answered"));
        }
        let credentials = UsernameHashedPassword {
            username: challenger.username.clone(),
            challenge: challenger.challenge.clone(),
            response,
        };
        let LoggedIn {
            identity,
            avatar,
            logout,
        } = match challenger
            .realm
            .login(credentials, mind, challenger.interfaces.clone())
            .await
        {
            Ok(logged_in) => logged_in,
            Err(err) => {
                tracing::info!("login as {} refused: {}", challenger.username, err);
                return Err(err);
            }
        };

        tracing::info!("{} logged in on broker {}", identity, invocation.broker.id());
        if let Some(logout) = logout {
            invocation.broker.notify_on_disconnect(logout);
        }
        Ok(Value::under_perspective(
            identity,
            Value::Referenceable(avatar),
        ))
    })
});

impl Referenceable for Challenger {
    fn remote_message(self: Arc<Self>, invocation: Invocation) -> HandlerFuture {
        CHALLENGER_METHODS.dispatch(self, invocation)
    }
}

/// Log in through the portal at `root` and return the avatar.
///
/// `mind` is exported to the server for the realm to call back.
pub async fn login(
    root: &RemoteReference,
    username: &str,
    password: &str,
    mind: Option<Arc<dyn Referenceable>>,
) -> Result<RemoteReference, CallError> {
    let answer = root.call_remote("login", crate::args![username]).await?;
    let (challenge, challenger) = match answer {
        Value::List(parts) if parts.len() == 2 => {
            let mut parts = parts.into_iter();
            match (parts.next(), parts.next()) {
                (Some(challenge), Some(challenger)) => (challenge, challenger),
                _ => return Err(malformed("login")),
            }
        }
        _ => return Err(malformed("login")),
    };
    let challenge = challenge.into_bytes().map_err(|_| malformed("login"))?;
    let challenger = RemoteReference::from_value(challenger).map_err(|_| malformed("login"))?;

    let response = respond(&challenge, password);
    let mind = mind.map(Value::Referenceable).unwrap_or(Value::None);
    let avatar = challenger
        .call_remote("respond", vec![Value::Bytes(response), mind])
        .await?;
    RemoteReference::from_value(avatar).map_err(|_| malformed("respond"))
}

fn malformed(method: &str) -> CallError {
    CallError::Protocol(format!("unexpected answer to {method}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_checks_against_password() {
        let challenge = challenge();
        let credentials = UsernameHashedPassword {
            username: "alice".into(),
            response: respond(&challenge, "hunter2"),
            challenge,
        };
        assert!(credentials.check_password("hunter2"));
        assert!(!credentials.check_password("hunter3"));
    }

    #[test]
    fn challenges_are_fresh() {
        let a = challenge();
        assert_eq!(a.len(), 32);
        assert_ne!(a, challenge());
    }

    #[test]
    fn truncated_response_is_rejected() {
        let challenge = challenge();
        let mut response = respond(&challenge, "pw");
        response.pop();
        let credentials = UsernameHashedPassword {
            username: "bob".into(),
            challenge,
            response,
        };
        assert!(!credentials.check_password("pw"));
    }

    #[test]
    fn single_flipped_byte_is_rejected() {
        let challenge = challenge();
        let mut response = respond(&challenge, "pw");
        let last = response.len() - 1;
        response[last] ^= 1;
        let credentials = UsernameHashedPassword {
            username: "bob".into(),
            challenge,
            response,
        };
        assert!(!credentials.check_password("pw"));
    }

    #[test]
    fn unauthorized_is_tagged() {
        let err = unauthorized("no such user");
        assert_eq!(err.tag(), Some(UNAUTHORIZED));
    }
}
