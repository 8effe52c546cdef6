use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use satlink_codec::{ErrorReply, Value};

use crate::{error::*, node::Node};

pub type ErrorDecoder = Arc<dyn Fn(&ErrorReply) -> CmdError + Send + Sync>;

/// Maps error kind names to constructors, in both directions.
///
/// One registry is built at startup and shared by every session through an
/// `Arc`. Kinds nobody registered decode to [`CmdError::Remote`].
pub struct ErrorRegistry {
    decoders: RwLock<HashMap<String, ErrorDecoder>>,
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorRegistry {
    /// Registry with the built-in kinds. `Timeout` is left out: a peer's
    /// timeout decodes to [`CmdError::Remote`] and never looks like this
    /// side's own wait expiring.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(KIND_NO_PATH, |e| {
            let path = e
                .detail
                .as_ref()
                .and_then(|d| d.get("p"))
                .and_then(Value::as_list)
                .map(|segs| segs.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let missing = e.detail.as_ref().and_then(|d| d.get("m")).and_then(Value::as_str).unwrap_or_default();
            CmdError::NoPath {
                path,
                missing: missing.to_string(),
            }
        });
        registry.register(KIND_SHORT_COMMAND, |_| CmdError::ShortCommand);
        registry.register(KIND_CHANNEL_CLOSED, |_| CmdError::ChannelClosed);
        registry.register(KIND_NOT_READY, |e| CmdError::NotReady(e.text.clone()));
        registry.register(KIND_STOPPED, |e| CmdError::Stopped(e.text.clone()));
        registry.register(KIND_CANCELLED, |_| CmdError::Cancelled);
        registry.register(KIND_INVALID_ARGUMENT, |e| CmdError::InvalidArgument(e.text.clone()));
        registry.register(KIND_FAILED, |e| CmdError::Failed(e.text.clone()));
        registry
    }

    pub fn empty() -> Self {
        Self {
            decoders: RwLock::new(HashMap::new()),
        }
    }

    /// Later registrations of the same kind replace earlier ones.
    pub fn register<F>(&self, kind: &str, decoder: F)
    where
        F: Fn(&ErrorReply) -> CmdError + Send + Sync + 'static,
    {
        self.decoders.write().insert(kind.to_string(), Arc::new(decoder));
    }

    pub fn is_known(&self, kind: &str) -> bool {
        self.decoders.read().contains_key(kind)
    }

    pub fn encode(&self, err: &CmdError) -> ErrorReply {
        let reply = ErrorReply::new(err.kind(), &err.text());
        match err {
            CmdError::NoPath { path, missing } => reply.with_detail(Value::map([
                ("p", Value::list(path.iter().map(|s| Value::from(s.as_str())))),
                ("m", Value::from(missing.as_str())),
            ])),
            _ => reply,
        }
    }

    pub fn decode(&self, reply: &ErrorReply) -> CmdError {
        let decoder = self.decoders.read().get(&reply.kind).cloned();
        match decoder {
            Some(decoder) => decoder(reply),
            None => CmdError::Remote {
                kind: reply.kind.clone(),
                text: reply.text.clone(),
            },
        }
    }
}

pub type AppFactory = Arc<dyn Fn(&str, Value) -> Result<Arc<dyn Node>, CmdError> + Send + Sync>;

/// App type name to constructor, used when a directory builds its children
/// from configuration.
#[derive(Default)]
pub struct AppRegistry {
    factories: RwLock<HashMap<String, AppFactory>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The factory gets the child's name and its config section.
    pub fn register<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&str, Value) -> Result<Arc<dyn Node>, CmdError> + Send + Sync + 'static,
    {
        self.factories.write().insert(kind.to_string(), Arc::new(factory));
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn create(&self, kind: &str, name: &str, config: Value) -> Result<Arc<dyn Node>, CmdError> {
        let factory = self.factories.read().get(kind).cloned();
        match factory {
            Some(factory) => factory(name, config),
            None => Err(CmdError::InvalidArgument(format!("unknown app type {}", kind))),
        }
    }
}
