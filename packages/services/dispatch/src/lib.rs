mod dir;
mod error;
mod forward;
mod iter;
mod node;
mod registry;
mod request;
mod session;
mod verbs;

pub use dir::DirNode;
pub use error::CmdError;
pub use forward::ForwardNode;
pub use iter::{Pacer, RemoteIter};
pub use node::{dir_value, CallCtx, Node, NodeCore, NodeState, Reply, ValueStream, VerbNode};
pub use registry::{AppFactory, AppRegistry, ErrorDecoder, ErrorRegistry};
pub use request::Role;
pub use session::{CmdSession, SessionConfig};
pub use verbs::{BoundVerbs, Verb, VerbTable};
