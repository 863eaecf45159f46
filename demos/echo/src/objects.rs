//! Objects the echo server hands out, and their client-side mirrors.

use async_trait::async_trait;
use parking_lot::Mutex;
use perspective_broker::{
    Args, CacheObserver, Cacheable, Copyable, HandlerFuture, Identity, Invocation, LoggedIn,
    MethodTable, ObserverTable, Realm, Referenceable, RemoteCache, RemoteCopy, RemoteError,
    RemoteReference, TypeRegistry, UsernameHashedPassword, Value, ValueError, unauthorized,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

pub const PROFILE_TAG: &str = "echo.Profile";
pub const SCOREBOARD_TAG: &str = "echo.Scoreboard";

/// Register the mirrors this demo's client understands.
pub fn register(registry: &TypeRegistry) -> anyhow::Result<()> {
    registry.register_copy::<RemoteProfile>(PROFILE_TAG)?;
    registry.register_cache::<RemoteScoreboard>(SCOREBOARD_TAG)?;
    registry.register_error(perspective_broker::UNAUTHORIZED)?;
    registry.seal();
    Ok(())
}

/// Accounts given on the command line.
pub struct Accounts {
    passwords: HashMap<String, String>,
    scoreboard: Arc<Scoreboard>,
}

impl Accounts {
    pub fn new(passwords: HashMap<String, String>) -> Self {
        Self {
            passwords,
            scoreboard: Arc::new(Scoreboard::default()),
        }
    }
}

#[async_trait]
impl Realm for Accounts {
    async fn login(
        &self,
        credentials: UsernameHashedPassword,
        _mind: Option<RemoteReference>,
        _interfaces: Vec<String>,
    ) -> Result<LoggedIn, RemoteError> {
        let Some(password) = self.passwords.get(&credentials.username) else {
            return Err(unauthorized("bad username or password"));
        };
        if !credentials.check_password(password) {
            return Err(unauthorized("bad username or password"));
        }
        let name = credentials.username;
        let avatar = Arc::new(Avatar {
            name: name.clone(),
            scoreboard: self.scoreboard.clone(),
        });
        Ok(LoggedIn::new(Identity::user(&name), avatar)
            .on_logout(move || tracing::info!("{} logged out", name)))
    }
}

/// What a logged-in user talks to.
pub struct Avatar {
    name: String,
    scoreboard: Arc<Scoreboard>,
}

static AVATAR_METHODS: LazyLock<MethodTable<Avatar>> = LazyLock::new(|| {
    MethodTable::<Avatar>::remote()
        .sync("echo", |_, invocation| {
            invocation.args.expect(1, &[])?;
            invocation.args.get::<Value>(0)
        })
        .sync("profile", |avatar, _| {
            Ok(Value::copyable(Arc::new(Profile {
                name: avatar.name.clone(),
            })))
        })
        .sync("scoreboard", |avatar, _| {
            Ok(Value::cacheable(avatar.scoreboard.clone()))
        })
        .on("score", |avatar, _| async move {
            avatar.scoreboard.score(&avatar.name).await;
            Ok(Value::None)
        })
});

impl Referenceable for Avatar {
    fn remote_message(self: Arc<Self>, invocation: Invocation) -> HandlerFuture {
        AVATAR_METHODS.dispatch(self, invocation)
    }

    fn interfaces(&self) -> Vec<String> {
        vec!["echo.Avatar".into()]
    }
}

/// Sent by value: the receiver gets its own copy.
pub struct Profile {
    name: String,
}

impl Copyable for Profile {
    fn type_tag(&self) -> String {
        PROFILE_TAG.into()
    }

    fn state_for(&self, perspective: Option<&Identity>) -> Value {
        let mut state = BTreeMap::from([("name".to_string(), Value::from(self.name.as_str()))]);
        if let Some(viewer) = perspective {
            state.insert("seen_by".into(), Value::from(viewer.to_string()));
        }
        Value::Dict(state)
    }
}

#[derive(Debug, Default)]
pub struct RemoteProfile {
    pub name: String,
    pub seen_by: Option<String>,
}

impl RemoteCopy for RemoteProfile {
    fn set_state(&mut self, state: Value) -> Result<(), ValueError> {
        self.name = state.field("name")?;
        self.seen_by = state.field("seen_by").ok();
        Ok(())
    }
}

/// Mirrored on every client that asked for it.
#[derive(Default)]
pub struct Scoreboard {
    scores: Mutex<BTreeMap<String, i64>>,
    observers: Mutex<Vec<CacheObserver>>,
}

impl Scoreboard {
    async fn score(&self, name: &str) {
        let total = {
            let mut scores = self.scores.lock();
            let total = scores.entry(name.to_string()).or_default();
            *total += 1;
            *total
        };
        let observers = self.observers.lock().clone();
        for observer in observers {
            if let Err(e) = observer.call_remote("set", perspective_broker::args![name, total]).await {
                tracing::debug!("scoreboard update not delivered: {}", e);
            }
        }
    }
}

impl Cacheable for Scoreboard {
    fn type_tag(&self) -> String {
        SCOREBOARD_TAG.into()
    }

    fn state_to_cache(&self, _: Option<&Identity>, observer: CacheObserver) -> Value {
        self.observers.lock().push(observer);
        Value::from(self.scores.lock().clone())
    }

    fn stopped_observing(&self, observer: &CacheObserver) {
        self.observers.lock().retain(|o| o != observer);
    }
}

#[derive(Debug, Default)]
pub struct RemoteScoreboard {
    pub scores: BTreeMap<String, i64>,
}

static SCOREBOARD_OBSERVERS: LazyLock<ObserverTable<RemoteScoreboard>> = LazyLock::new(|| {
    ObserverTable::<RemoteScoreboard>::new().on("set", |board, args| {
        args.expect(2, &[])?;
        board.scores.insert(args.get(0)?, args.get(1)?);
        Ok(Value::None)
    })
});

impl RemoteCache for RemoteScoreboard {
    fn set_state(&mut self, state: Value) -> Result<(), ValueError> {
        self.scores = perspective_broker::FromValue::from_value(state)?;
        Ok(())
    }

    fn observe(&mut self, method: &str, args: Args) -> Result<Value, RemoteError> {
        SCOREBOARD_OBSERVERS.dispatch(self, method, args)
    }
}
