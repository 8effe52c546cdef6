use std::{collections::BTreeMap, future::Future, sync::Arc};

use futures_util::{future::BoxFuture, stream, FutureExt, StreamExt};
use satlink_codec::Value;

use crate::{
    node::{CallCtx, Reply, ValueStream},
    CmdError,
};

type CallHandler<T> = Arc<dyn Fn(Arc<T>, Value) -> BoxFuture<'static, Result<Value, CmdError>> + Send + Sync>;
type IterHandler<T> = Arc<dyn Fn(Arc<T>, Value) -> BoxFuture<'static, Result<ValueStream, CmdError>> + Send + Sync>;

pub enum Verb<T> {
    Call(CallHandler<T>),
    /// Produces a value stream. Subscribers never get a cadence below `min_cadence_ms`.
    Iter { min_cadence_ms: u32, handler: IterHandler<T> },
}

impl<T> Clone for Verb<T> {
    fn clone(&self) -> Self {
        match self {
            Verb::Call(h) => Verb::Call(h.clone()),
            Verb::Iter { min_cadence_ms, handler } => Verb::Iter {
                min_cadence_ms: *min_cadence_ms,
                handler: handler.clone(),
            },
        }
    }
}

/// Verb name to handler, defined once per node type.
///
/// ```ignore
/// fn verbs() -> VerbTable<Counter> {
///     VerbTable::new()
///         .call("get", |me: Arc<Counter>, _| async move { Ok(Value::from(me.get())) })
///         .iter("watch", 100, |me, _| async move { Ok(me.watch()) })
/// }
/// ```
pub struct VerbTable<T> {
    verbs: BTreeMap<String, Verb<T>>,
}

impl<T> Default for VerbTable<T> {
    fn default() -> Self {
        Self { verbs: BTreeMap::new() }
    }
}

impl<T: Send + Sync + 'static> VerbTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<T>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CmdError>> + Send + 'static,
    {
        self.verbs.insert(name.to_string(), Verb::Call(Arc::new(move |app: Arc<T>, args: Value| handler(app, args).boxed())));
        self
    }

    pub fn iter<F, Fut>(mut self, name: &str, min_cadence_ms: u32, handler: F) -> Self
    where
        F: Fn(Arc<T>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueStream, CmdError>> + Send + 'static,
    {
        self.verbs.insert(
            name.to_string(),
            Verb::Iter {
                min_cadence_ms,
                handler: Arc::new(move |app: Arc<T>, args: Value| handler(app, args).boxed()),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&Verb<T>> {
        self.verbs.get(name)
    }

    /// Attach the table to one instance.
    pub fn bind(&self, app: Arc<T>) -> BoundVerbs {
        let mut verbs = BTreeMap::new();
        for (name, verb) in &self.verbs {
            let bound = match verb.clone() {
                Verb::Call(handler) => {
                    let app = app.clone();
                    BoundVerb::Call(Arc::new(move |args: Value| handler(app.clone(), args)))
                }
                Verb::Iter { min_cadence_ms, handler } => {
                    let app = app.clone();
                    BoundVerb::Iter {
                        min_cadence_ms,
                        handler: Arc::new(move |args: Value| handler(app.clone(), args)),
                    }
                }
            };
            verbs.insert(name.clone(), bound);
        }
        BoundVerbs { verbs }
    }
}

type BoundCall = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, CmdError>> + Send + Sync>;
type BoundIter = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<ValueStream, CmdError>> + Send + Sync>;

#[derive(Clone)]
enum BoundVerb {
    Call(BoundCall),
    Iter { min_cadence_ms: u32, handler: BoundIter },
}

/// A verb table bound to its instance, as held by a node.
#[derive(Clone, Default)]
pub struct BoundVerbs {
    verbs: BTreeMap<String, BoundVerb>,
}

impl BoundVerbs {
    pub fn contains(&self, name: &str) -> bool {
        self.verbs.contains_key(name)
    }

    /// Names of call verbs and iterator verbs, sorted.
    pub fn names(&self) -> (Vec<String>, Vec<String>) {
        let mut calls = vec![];
        let mut iters = vec![];
        for (name, verb) in &self.verbs {
            match verb {
                BoundVerb::Call(_) => calls.push(name.clone()),
                BoundVerb::Iter { .. } => iters.push(name.clone()),
            }
        }
        (calls, iters)
    }

    /// Run `name`. Returns `None` if there is no such verb.
    ///
    /// A subscription to a call verb calls it once per tick; a plain call to
    /// an iterator verb returns its first value.
    pub async fn invoke(&self, ctx: &CallCtx, name: &str, args: Value) -> Option<Result<Reply, CmdError>> {
        let verb = self.verbs.get(name)?.clone();
        let res = match (verb, ctx.repeat_ms) {
            (BoundVerb::Call(handler), None) => handler(args).await.map(Reply::Value),
            (BoundVerb::Call(handler), Some(cadence_ms)) => {
                let items = stream::unfold((handler, args), |(handler, args)| async move {
                    let res = handler(args.clone()).await;
                    Some((res, (handler, args)))
                });
                Ok(Reply::Stream {
                    cadence_ms,
                    items: items.boxed(),
                })
            }
            (BoundVerb::Iter { min_cadence_ms, handler }, Some(cadence_ms)) => handler(args).await.map(|items| Reply::Stream {
                cadence_ms: cadence_ms.max(min_cadence_ms),
                items,
            }),
            (BoundVerb::Iter { handler, .. }, None) => match handler(args).await {
                Ok(mut items) => match items.next().await {
                    Some(res) => res.map(Reply::Value),
                    None => Ok(Reply::Value(Value::Nil)),
                },
                Err(e) => Err(e),
            },
        };
        Some(res)
    }
}
